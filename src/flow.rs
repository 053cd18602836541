/// The flow orchestrator: a directed graph of nodes sharing one store.
///
/// A [`Flow`] owns its node instances in an insertion-ordered arena keyed
/// by node id; successor links and entry references are ids, never owning
/// references, so the node ↔ flow cycle of the object graph dissolves
/// into plain lookups. The state store and event streamer are shared
/// handles — a nested composite flow receives clones of the same `Arc`s,
/// guaranteeing a single state container across the whole hierarchy.
///
/// Execution is sequential: one node at a time, the action string
/// returned by `post` selecting the successor. The loop halts on an
/// absent action, an unwired action, or a successor id that names no node
/// in this flow (logged as a warning). There is no iteration cap; cycles
/// are the caller's responsibility and may self-terminate by returning an
/// absent action.
use indexmap::IndexMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backpack::Backpack;
use crate::error::{FlowError, FlowResult};
use crate::events::EventStreamer;
use crate::namespace;
use crate::node::{run_lifecycle, Node, NodeContext};
use crate::types::PackOptions;

/// One key remapping applied before a target node runs: the value under
/// `source_key` is copied to `target_key` with the target's identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeMapping {
    /// Key to read.
    pub source_key: String,
    /// Key to write.
    pub target_key: String,
}

/// An edge as the flow knows it: routing triple plus any key mappings.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeSpec {
    /// Source node id.
    pub from: String,
    /// Action string that selects this edge.
    pub condition: String,
    /// Target node id.
    pub to: String,
    /// Key remappings carried by this edge.
    pub mappings: Option<IndexMap<String, String>>,
}

/// Summary counters for a flow.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FlowStats {
    /// The flow's namespace.
    pub namespace: String,
    /// Registered nodes.
    pub node_count: usize,
    /// Wired edges.
    pub edge_count: usize,
    /// The entry node id, when set.
    pub entry: Option<String>,
    /// Node ids in insertion order.
    pub node_ids: Vec<String>,
}

/// What one `run` did: which nodes executed, in order, and how it ended.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Correlation id stamped on this run's events.
    pub run_id: String,
    /// Executed node ids, in execution order.
    pub executed: Vec<String>,
    /// The action returned by the last node.
    pub final_action: Option<String>,
}

struct NodeSlot {
    node: Box<dyn Node>,
    successors: IndexMap<String, String>,
    input_mappings: Vec<EdgeMapping>,
}

/// A directed graph of nodes with shared state, executed one node at a
/// time by action routing.
pub struct Flow {
    namespace: String,
    backpack: Arc<Backpack>,
    events: Option<Arc<EventStreamer>>,
    nodes: IndexMap<String, NodeSlot>,
    mappings_by_edge: IndexMap<(String, String), IndexMap<String, String>>,
    entry: Option<String>,
}

impl Flow {
    /// A flow with its own fresh state store and no event streamer.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self::with_shared(namespace, Arc::new(Backpack::new()), None)
    }

    /// A flow over shared collaborators. The streamer, when present, is
    /// also attached to the store so BACKPACK_* events reach it.
    pub fn with_shared(
        namespace: impl Into<String>,
        backpack: Arc<Backpack>,
        events: Option<Arc<EventStreamer>>,
    ) -> Self {
        if let Some(streamer) = &events {
            backpack.set_event_streamer(Arc::clone(streamer));
        }
        Self {
            namespace: namespace.into(),
            backpack,
            events,
            nodes: IndexMap::new(),
            mappings_by_edge: IndexMap::new(),
            entry: None,
        }
    }

    /// The flow's namespace.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The shared state store.
    pub fn backpack(&self) -> &Arc<Backpack> {
        &self.backpack
    }

    /// The shared event streamer, when one is attached.
    pub fn events(&self) -> Option<&Arc<EventStreamer>> {
        self.events.as_ref()
    }

    /// The entry node id, when set.
    pub fn entry(&self) -> Option<&str> {
        self.entry.as_deref()
    }

    /// A construction context for a node under this flow's namespace.
    ///
    /// The segment is the node type's static namespace segment, falling
    /// back to the node's id when the type declares none.
    pub fn node_context(&self, segment: &str) -> NodeContext {
        NodeContext::new(
            namespace::compose(&self.namespace, segment),
            Arc::clone(&self.backpack),
            self.events.clone(),
        )
    }

    /// Construct and register a node.
    ///
    /// The builder receives the composed context. A duplicate id
    /// overwrites the previous node in place; the serialization layer is
    /// the one that rejects duplicates in documents.
    pub fn add_node<N, F>(&mut self, segment: Option<&str>, id: &str, build: F) -> FlowResult<&dyn Node>
    where
        N: Node + 'static,
        F: FnOnce(NodeContext) -> FlowResult<N>,
    {
        let context = self.node_context(segment.unwrap_or(id));
        let node = build(context)?;
        let node_id = node.id().to_string();
        self.register_node(Box::new(node));
        Ok(self
            .nodes
            .get(&node_id)
            .map(|slot| slot.node.as_ref())
            .expect("just registered"))
    }

    /// Register an externally constructed node under its own id.
    pub fn register_node(&mut self, node: Box<dyn Node>) {
        let id = node.id().to_string();
        match self.nodes.get_mut(&id) {
            Some(slot) => slot.node = node,
            None => {
                self.nodes.insert(
                    id,
                    NodeSlot {
                        node,
                        successors: IndexMap::new(),
                        input_mappings: Vec::new(),
                    },
                );
            }
        }
    }

    /// Set the node the default `run` starts from.
    pub fn set_entry_node(&mut self, id: impl Into<String>) -> FlowResult<()> {
        let id = id.into();
        if !self.nodes.contains_key(&id) {
            return Err(FlowError::validation(format!(
                "entry node '{id}' is not registered in this flow"
            )));
        }
        self.entry = Some(id);
        Ok(())
    }

    /// Look up a node by id.
    pub fn get_node(&self, id: &str) -> Option<&dyn Node> {
        self.nodes.get(id).map(|slot| slot.node.as_ref())
    }

    /// Every node, in insertion order.
    pub fn get_all_nodes(&self) -> Vec<&dyn Node> {
        self.nodes.values().map(|slot| slot.node.as_ref()).collect()
    }

    /// Node ids in insertion order.
    pub fn node_ids(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    /// Wire an edge: when `from` returns `condition`, run `to` next.
    ///
    /// A later registration for the same condition overwrites. The target
    /// is not required to exist yet; routing to an id that never appears
    /// in this flow halts the run with a warning.
    pub fn on(
        &mut self,
        from: &str,
        condition: impl Into<String>,
        to: impl Into<String>,
    ) -> FlowResult<()> {
        let slot = self.nodes.get_mut(from).ok_or_else(|| {
            FlowError::validation(format!("cannot wire edge from unknown node '{from}'"))
        })?;
        slot.successors.insert(condition.into(), to.into());
        Ok(())
    }

    /// Wire an edge carrying key mappings. Before the target's lifecycle
    /// begins, each (source, target) pair is copied under the target's
    /// identity; a target key already present with a different value is a
    /// mapping conflict.
    pub fn on_mapped(
        &mut self,
        from: &str,
        condition: impl Into<String>,
        to: impl Into<String>,
        mappings: IndexMap<String, String>,
    ) -> FlowResult<()> {
        let condition = condition.into();
        let to = to.into();
        self.on(from, condition.clone(), to.clone())?;
        if let Some(slot) = self.nodes.get_mut(&to) {
            slot.input_mappings.extend(
                mappings
                    .iter()
                    .map(|(source_key, target_key)| EdgeMapping {
                        source_key: source_key.clone(),
                        target_key: target_key.clone(),
                    }),
            );
        }
        self.mappings_by_edge
            .insert((from.to_string(), condition), mappings);
        Ok(())
    }

    /// Every wired edge, in node insertion order then wiring order.
    pub fn edges(&self) -> Vec<EdgeSpec> {
        self.nodes
            .iter()
            .flat_map(|(from, slot)| {
                slot.successors.iter().map(move |(condition, to)| EdgeSpec {
                    from: from.clone(),
                    condition: condition.clone(),
                    to: to.clone(),
                    mappings: self
                        .mappings_by_edge
                        .get(&(from.clone(), condition.clone()))
                        .cloned(),
                })
            })
            .collect()
    }

    /// Summary counters.
    pub fn get_stats(&self) -> FlowStats {
        FlowStats {
            namespace: self.namespace.clone(),
            node_count: self.nodes.len(),
            edge_count: self.nodes.values().map(|slot| slot.successors.len()).sum(),
            entry: self.entry.clone(),
            node_ids: self.node_ids(),
        }
    }

    /// A nested flow composed under this one, sharing store and streamer.
    pub fn create_subflow(&self, segment: &str) -> Flow {
        Flow::with_shared(
            namespace::compose(&self.namespace, segment),
            Arc::clone(&self.backpack),
            self.events.clone(),
        )
    }

    /// Run from the entry node.
    pub async fn run(&mut self) -> FlowResult<RunReport> {
        let start = self
            .entry
            .clone()
            .ok_or_else(|| FlowError::validation("flow has no entry node"))?;
        self.run_from(&start).await
    }

    /// Run from an explicit start node.
    pub async fn run_from(&mut self, start: &str) -> FlowResult<RunReport> {
        if !self.nodes.contains_key(start) {
            return Err(FlowError::validation(format!(
                "start node '{start}' is not registered in this flow"
            )));
        }
        let run_id = Uuid::new_v4().to_string();
        let previous_run = match &self.events {
            Some(events) => {
                let previous = events.current_run();
                events.set_current_run(Some(run_id.clone()));
                previous
            }
            None => None,
        };

        let result = self.run_loop(start, &run_id).await;

        if let Some(events) = &self.events {
            events.set_current_run(previous_run);
        }
        result
    }

    async fn run_loop(&mut self, start: &str, run_id: &str) -> FlowResult<RunReport> {
        let backpack = Arc::clone(&self.backpack);
        let events = self.events.clone();
        let mut current = start.to_string();
        let mut executed = Vec::new();
        let mut final_action = None;

        loop {
            self.apply_input_mappings(&current)?;

            let slot = self
                .nodes
                .get_mut(&current)
                .expect("current node validated before dispatch");
            let action =
                run_lifecycle(&mut slot.node, &backpack, events.as_ref(), run_id).await?;
            debug!(node = %current, ?action, "node finished");
            executed.push(current.clone());
            final_action = action.clone();

            let action = match action {
                Some(action) => action,
                None => break,
            };
            let successor = self
                .nodes
                .get(&current)
                .and_then(|slot| slot.successors.get(&action))
                .cloned();
            let next = match successor {
                Some(next) => next,
                None => break,
            };
            if !self.nodes.contains_key(&next) {
                warn!(
                    from = %current,
                    condition = %action,
                    successor = %next,
                    "successor is not a node in this flow; halting"
                );
                break;
            }
            current = next;
        }

        Ok(RunReport {
            run_id: run_id.to_string(),
            executed,
            final_action,
        })
    }

    /// Copy each mapped source key to its target key under the target
    /// node's identity. Runs before the node's lifecycle, and therefore
    /// before its input-contract validation.
    fn apply_input_mappings(&self, node_id: &str) -> FlowResult<()> {
        let slot = match self.nodes.get(node_id) {
            Some(slot) => slot,
            None => return Ok(()),
        };
        if slot.input_mappings.is_empty() {
            return Ok(());
        }
        let identity = PackOptions::for_node(
            slot.node.id(),
            slot.node.name(),
            slot.node.namespace(),
        );
        for mapping in &slot.input_mappings {
            let value = match self.backpack.peek(&mapping.source_key) {
                Some(value) => value,
                None => continue,
            };
            if let Some(existing) = self.backpack.peek(&mapping.target_key) {
                if existing != value {
                    return Err(FlowError::serialization(format!(
                        "mapping conflict: key '{}' already holds a different value",
                        mapping.target_key
                    )));
                }
            }
            self.backpack
                .pack(mapping.target_key.clone(), value, identity.clone())?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("namespace", &self.namespace)
            .field("nodes", &self.node_ids())
            .field("entry", &self.entry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::StoreHandle;
    use async_trait::async_trait;
    use serde_json::{json, Value as JsonValue};

    /// Appends its id to the "trail" key and returns a fixed action.
    struct Tracer {
        id: String,
        namespace: String,
        action: Option<String>,
    }

    impl Tracer {
        fn build(id: &str, action: Option<&str>) -> impl FnOnce(NodeContext) -> FlowResult<Tracer> {
            let id = id.to_string();
            let action = action.map(String::from);
            move |context| {
                Ok(Tracer {
                    id,
                    namespace: context.namespace().to_string(),
                    action,
                })
            }
        }
    }

    #[async_trait]
    impl Node for Tracer {
        fn id(&self) -> &str {
            &self.id
        }
        fn namespace(&self) -> &str {
            &self.namespace
        }
        fn type_name(&self) -> &str {
            "Tracer"
        }
        async fn post(
            &mut self,
            store: &StoreHandle,
            _prep: JsonValue,
            _exec: JsonValue,
        ) -> FlowResult<Option<String>> {
            let mut trail = store
                .peek("trail")
                .and_then(|v| v.as_array().cloned())
                .unwrap_or_default();
            trail.push(json!(self.id));
            store.pack("trail", json!(trail))?;
            Ok(self.action.clone())
        }
    }

    fn linear_flow() -> Flow {
        let mut flow = Flow::new("test");
        flow.add_node(None, "a", Tracer::build("a", Some("next"))).unwrap();
        flow.add_node(None, "b", Tracer::build("b", Some("next"))).unwrap();
        flow.add_node(None, "c", Tracer::build("c", None)).unwrap();
        flow.on("a", "next", "b").unwrap();
        flow.on("b", "next", "c").unwrap();
        flow.set_entry_node("a").unwrap();
        flow
    }

    #[tokio::test]
    async fn test_action_routing_runs_nodes_in_order() {
        let mut flow = linear_flow();
        let report = flow.run().await.unwrap();
        assert_eq!(report.executed, vec!["a", "b", "c"]);
        assert_eq!(
            flow.backpack().peek("trail"),
            Some(json!(["a", "b", "c"]))
        );
        assert_eq!(report.final_action, None);
    }

    #[tokio::test]
    async fn test_unwired_action_halts() {
        let mut flow = Flow::new("test");
        flow.add_node(None, "a", Tracer::build("a", Some("unwired"))).unwrap();
        flow.set_entry_node("a").unwrap();
        let report = flow.run().await.unwrap();
        assert_eq!(report.executed, vec!["a"]);
        assert_eq!(report.final_action, Some("unwired".to_string()));
    }

    #[tokio::test]
    async fn test_foreign_successor_halts_with_warning() {
        let mut flow = Flow::new("test");
        flow.add_node(None, "a", Tracer::build("a", Some("next"))).unwrap();
        flow.on("a", "next", "not-in-this-flow").unwrap();
        flow.set_entry_node("a").unwrap();
        let report = flow.run().await.unwrap();
        assert_eq!(report.executed, vec!["a"]);
    }

    #[tokio::test]
    async fn test_run_without_entry_is_an_error() {
        let mut flow = Flow::new("test");
        assert!(matches!(
            flow.run().await,
            Err(FlowError::Validation { .. })
        ));
    }

    #[test]
    fn test_nodes_inherit_composed_namespace() {
        let flow = linear_flow();
        assert_eq!(flow.get_node("a").unwrap().namespace(), "test.a");
    }

    #[test]
    fn test_node_segment_overrides_id_fallback() {
        let mut flow = Flow::new("root");
        flow.add_node(Some("chat"), "c1", Tracer::build("c1", None)).unwrap();
        assert_eq!(flow.get_node("c1").unwrap().namespace(), "root.chat");
    }

    #[test]
    fn test_subflow_shares_store() {
        let flow = Flow::new("parent");
        let subflow = flow.create_subflow("child");
        assert_eq!(subflow.namespace(), "parent.child");
        assert!(Arc::ptr_eq(flow.backpack(), subflow.backpack()));
    }

    #[test]
    fn test_duplicate_id_overwrites_in_place() {
        let mut flow = Flow::new("test");
        flow.add_node(None, "a", Tracer::build("a", Some("one"))).unwrap();
        flow.add_node(None, "b", Tracer::build("b", None)).unwrap();
        flow.add_node(None, "a", Tracer::build("a", Some("two"))).unwrap();
        assert_eq!(flow.node_ids(), vec!["a", "b"]);
    }

    #[test]
    fn test_condition_rewiring_overwrites() {
        let mut flow = linear_flow();
        flow.on("a", "next", "c").unwrap();
        let edges = flow.edges();
        let a_edge = edges.iter().find(|e| e.from == "a").unwrap();
        assert_eq!(a_edge.to, "c");
        assert_eq!(flow.get_stats().edge_count, 2);
    }

    #[tokio::test]
    async fn test_cycle_terminates_by_absent_action() {
        /// Counts down in the store and stops routing at zero.
        struct Countdown {
            id: String,
            namespace: String,
        }

        #[async_trait]
        impl Node for Countdown {
            fn id(&self) -> &str {
                &self.id
            }
            fn namespace(&self) -> &str {
                &self.namespace
            }
            fn type_name(&self) -> &str {
                "Countdown"
            }
            async fn post(
                &mut self,
                store: &StoreHandle,
                _prep: JsonValue,
                _exec: JsonValue,
            ) -> FlowResult<Option<String>> {
                let remaining = store.peek("remaining").and_then(|v| v.as_i64()).unwrap_or(0);
                store.pack("remaining", json!(remaining - 1))?;
                Ok(if remaining > 1 {
                    Some("again".to_string())
                } else {
                    None
                })
            }
        }

        let mut flow = Flow::new("loop");
        flow.add_node(None, "tick", |context| {
            Ok(Countdown {
                id: "tick".to_string(),
                namespace: context.namespace().to_string(),
            })
        })
        .unwrap();
        flow.on("tick", "again", "tick").unwrap();
        flow.set_entry_node("tick").unwrap();
        flow.backpack()
            .pack("remaining", json!(3), PackOptions::for_node_id("seed"))
            .unwrap();

        let report = flow.run().await.unwrap();
        assert_eq!(report.executed, vec!["tick", "tick", "tick"]);
        assert_eq!(flow.backpack().peek("remaining"), Some(json!(0)));
    }
}
