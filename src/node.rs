/// The node runtime: three-phase lifecycle with provenance capture.
///
/// A node is the unit of computation in a flow. Its lifecycle is split
/// into three overridable phases:
///
/// - **prep** reads inputs from the shared store and shapes them for exec
/// - **exec** performs the actual work (LLM calls, tools, computation)
/// - **post** writes results back and returns the routing action
///
/// The runtime wraps each lifecycle in telemetry (NODE_START through
/// NODE_END, or ERROR), validates the node's input contract before prep,
/// and hands the node a [`StoreHandle`] — a scoped adapter bound to the
/// node's identity. Every write through the handle inherits the node's
/// id, name, and namespace unless explicitly overridden, so provenance is
/// never blank for in-lifecycle writes. The handle also records which
/// keys the node read and wrote; those lists ride on the lifecycle
/// events.
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::backpack::Backpack;
use crate::config::NodeConfig;
use crate::contract::DataContract;
use crate::error::{ContractViolation, FlowError, FlowResult};
use crate::events::{EmitContext, EventPayload, EventStreamer, FlowEvent, LifecyclePhase};
use crate::flow::Flow;
use crate::types::{PackOptions, StateItem};

/// A computational node in a flow.
///
/// Implementations override the phases they need; defaults make prep a
/// no-op, exec a passthrough of the prep result, and post a terminal
/// no-action. `type_name` identifies the node type in config documents
/// and the registry.
#[async_trait]
pub trait Node: Send + Sync {
    /// Unique id within the owning flow.
    fn id(&self) -> &str;

    /// Human-readable name; defaults to the id.
    fn name(&self) -> &str {
        self.id()
    }

    /// Full dotted namespace assigned at construction.
    fn namespace(&self) -> &str;

    /// The registered type name, as it appears in config documents.
    fn type_name(&self) -> &str;

    /// Node-specific configuration params, serialized for telemetry and
    /// export.
    fn params(&self) -> JsonValue {
        JsonValue::Object(Default::default())
    }

    /// Contract the runtime validates against the store before prep.
    fn input_contract(&self) -> Option<&DataContract> {
        None
    }

    /// Contract advertised for the keys this node produces.
    fn output_contract(&self) -> Option<&DataContract> {
        None
    }

    /// Read and shape inputs. Runs after contract validation.
    async fn prep(&mut self, _store: &StoreHandle) -> FlowResult<JsonValue> {
        Ok(JsonValue::Null)
    }

    /// Do the work. No store access by design; everything needed comes
    /// through the prep result.
    async fn exec(&mut self, prep_result: JsonValue) -> FlowResult<JsonValue> {
        Ok(prep_result)
    }

    /// Write results and pick the next action. `None` halts the flow.
    async fn post(
        &mut self,
        _store: &StoreHandle,
        _prep_result: JsonValue,
        _exec_result: JsonValue,
    ) -> FlowResult<Option<String>> {
        Ok(None)
    }

    /// Serialize this node back into a config document. Nodes that return
    /// `None` are exported with an empty params object and a warning.
    fn to_config(&self) -> Option<NodeConfig> {
        None
    }

    /// The nested flow of a composite node, when one exists.
    fn internal_flow(&self) -> Option<&Flow> {
        None
    }
}

/// Construction context handed to every node: its composed namespace and
/// the collaborators shared across the flow tree.
#[derive(Clone)]
pub struct NodeContext {
    namespace: String,
    backpack: Arc<Backpack>,
    events: Option<Arc<EventStreamer>>,
    internal_flow_created: bool,
}

impl NodeContext {
    /// A context for the given namespace and shared collaborators.
    pub fn new(
        namespace: impl Into<String>,
        backpack: Arc<Backpack>,
        events: Option<Arc<EventStreamer>>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            backpack,
            events,
            internal_flow_created: false,
        }
    }

    /// The node's full dotted namespace.
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

    /// Build the internal flow of a composite node.
    ///
    /// The returned flow shares this node's namespace, state store, and
    /// event streamer. A node may request its internal flow exactly once;
    /// a second request is an error.
    pub fn create_internal_flow(&mut self) -> FlowResult<Flow> {
        if self.internal_flow_created {
            return Err(FlowError::serialization("internal flow already exists"));
        }
        self.internal_flow_created = true;
        Ok(Flow::with_shared(
            self.namespace.clone(),
            Arc::clone(&self.backpack),
            self.events.clone(),
        ))
    }
}

impl std::fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("namespace", &self.namespace)
            .field("has_events", &self.events.is_some())
            .finish()
    }
}

/// A store adapter bound to one node's identity for one lifecycle.
///
/// Writes default their provenance to the owning node; reads and writes
/// are recorded so the lifecycle events can report which keys the node
/// touched. The handle is transient: the underlying store is never
/// structurally modified, which keeps the single-threaded contract intact
/// even when several handles exist across a flow tree.
pub struct StoreHandle {
    backpack: Arc<Backpack>,
    node_id: String,
    node_name: String,
    namespace: String,
    reads: Mutex<Vec<String>>,
    writes: Mutex<Vec<String>>,
}

impl StoreHandle {
    /// A handle binding the store to a node identity.
    pub fn new(
        backpack: Arc<Backpack>,
        node_id: impl Into<String>,
        node_name: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            backpack,
            node_id: node_id.into(),
            node_name: node_name.into(),
            namespace: namespace.into(),
            reads: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
        }
    }

    /// Build a handle for a node.
    pub fn for_node(backpack: Arc<Backpack>, node: &dyn Node) -> Self {
        Self::new(backpack, node.id(), node.name(), node.namespace())
    }

    /// The underlying shared store, for operations the handle does not
    /// wrap.
    pub fn backpack(&self) -> &Arc<Backpack> {
        &self.backpack
    }

    /// Write a value with this node's identity.
    pub fn pack(&self, key: impl Into<String>, value: JsonValue) -> FlowResult<Option<StateItem>> {
        self.pack_with(key, value, PackOptions::default())
    }

    /// Write a value, defaulting any unset provenance field to this
    /// node's identity.
    pub fn pack_with(
        &self,
        key: impl Into<String>,
        value: JsonValue,
        options: PackOptions,
    ) -> FlowResult<Option<StateItem>> {
        let key = key.into();
        self.writes.lock().expect("writes lock poisoned").push(key.clone());
        let options = PackOptions {
            node_id: options.node_id.or_else(|| Some(self.node_id.clone())),
            node_name: options.node_name.or_else(|| Some(self.node_name.clone())),
            namespace: options.namespace.or_else(|| Some(self.namespace.clone())),
            tags: options.tags,
        };
        self.backpack.pack(key, value, options)
    }

    /// Read a value as this node; absent keys come back as `None`.
    pub fn unpack(&self, key: &str) -> FlowResult<Option<JsonValue>> {
        self.reads.lock().expect("reads lock poisoned").push(key.to_string());
        self.backpack.unpack(key, Some(&self.node_id))
    }

    /// Read a value that must exist.
    pub fn unpack_required(&self, key: &str) -> FlowResult<JsonValue> {
        self.reads.lock().expect("reads lock poisoned").push(key.to_string());
        self.backpack.unpack_required(key, Some(&self.node_id))
    }

    /// Diagnostic read; not recorded, no permission checks.
    pub fn peek(&self, key: &str) -> Option<JsonValue> {
        self.backpack.peek(key)
    }

    /// Namespace query as this node; see [`Backpack::unpack_by_namespace`].
    pub fn unpack_by_namespace(
        &self,
        pattern: &str,
    ) -> std::collections::BTreeMap<String, JsonValue> {
        self.backpack.unpack_by_namespace(pattern, Some(&self.node_id))
    }

    /// Keys read through this handle so far.
    pub fn reads(&self) -> Vec<String> {
        self.reads.lock().expect("reads lock poisoned").clone()
    }

    /// Keys written through this handle so far.
    pub fn writes(&self) -> Vec<String> {
        self.writes.lock().expect("writes lock poisoned").clone()
    }
}

/// Execute one node's full lifecycle.
///
/// Emits NODE_START, validates the input contract, runs prep / exec /
/// post with PREP_COMPLETE / EXEC_COMPLETE / NODE_END telemetry, and
/// returns the routing action. Any failure emits ERROR with the phase it
/// is attributed to — validation counts as prep — and propagates; there
/// is no internal retry.
pub async fn run_lifecycle(
    node: &mut Box<dyn Node>,
    backpack: &Arc<Backpack>,
    events: Option<&Arc<EventStreamer>>,
    run_id: &str,
) -> FlowResult<Option<String>> {
    let started = Instant::now();
    let node_id = node.id().to_string();
    let node_name = node.name().to_string();
    let node_namespace = node.namespace().to_string();
    let handle = StoreHandle::new(
        Arc::clone(backpack),
        node_id.clone(),
        node_name.clone(),
        node_namespace.clone(),
    );

    let context = || EmitContext {
        source_node: node_name.clone(),
        node_id: node_id.clone(),
        namespace: if node_namespace.is_empty() {
            None
        } else {
            Some(node_namespace.clone())
        },
        run_id: Some(run_id.to_string()),
    };
    let emit = |payload: EventPayload| -> Option<FlowEvent> {
        events.map(|streamer| streamer.emit(payload, context()))
    };
    let emit_error = |phase: LifecyclePhase, error: &FlowError| {
        emit(EventPayload::Error {
            phase,
            message: error.to_string(),
            stack: None,
            backpack_state: state_snapshot(backpack),
        });
    };

    emit(EventPayload::NodeStart {
        params: node.params(),
        backpack_snapshot: state_snapshot(backpack),
    });

    // Contract validation is attributed to prep: it fails before any user
    // code has run.
    let contract = node.input_contract().cloned();
    if let Some(contract) = contract {
        if let Err(error) = validate_inputs(&contract, &handle, &node_id) {
            emit_error(LifecyclePhase::Prep, &error);
            return Err(error);
        }
    }

    let prep_result = match node.prep(&handle).await {
        Ok(result) => result,
        Err(error) => {
            emit_error(LifecyclePhase::Prep, &error);
            return Err(error);
        }
    };
    emit(EventPayload::PrepComplete {
        prep_result: prep_result.clone(),
        reads: handle.reads(),
    });

    let exec_started = Instant::now();
    let exec_result = match node.exec(prep_result.clone()).await {
        Ok(result) => result,
        Err(error) => {
            emit_error(LifecyclePhase::Exec, &error);
            return Err(error);
        }
    };
    emit(EventPayload::ExecComplete {
        exec_result: exec_result.clone(),
        attempts: 1,
        duration_ms: exec_started.elapsed().as_millis() as u64,
    });

    let action = match node.post(&handle, prep_result, exec_result).await {
        Ok(action) => action,
        Err(error) => {
            emit_error(LifecyclePhase::Post, &error);
            return Err(error);
        }
    };
    emit(EventPayload::NodeEnd {
        action: action.clone(),
        writes: handle.writes(),
        total_duration_ms: started.elapsed().as_millis() as u64,
    });

    Ok(action)
}

/// Validate every declared input key against its schema, reading through
/// the handle so the reads are recorded and permission-checked.
///
/// All failures are aggregated into one error; validation never stops at
/// the first bad key.
fn validate_inputs(
    contract: &DataContract,
    handle: &StoreHandle,
    node_id: &str,
) -> FlowResult<()> {
    let mut violations = Vec::new();
    for (key, schema) in contract.iter() {
        match handle.unpack(key)? {
            Some(value) => {
                if let Err(errors) = schema.safe_parse(&value) {
                    violations.push(ContractViolation {
                        key: key.clone(),
                        errors,
                    });
                }
            }
            None if schema.accepts_absent() => {}
            None => {
                violations.push(ContractViolation {
                    key: key.clone(),
                    errors: vec![crate::contract::SchemaIssue {
                        path: String::new(),
                        message: "required key missing".to_string(),
                    }],
                });
            }
        }
    }
    if violations.is_empty() {
        Ok(())
    } else {
        Err(FlowError::ContractValidation {
            node_id: node_id.to_string(),
            violations,
        })
    }
}

fn state_snapshot(backpack: &Arc<Backpack>) -> JsonValue {
    serde_json::to_value(backpack.peek_all()).unwrap_or(JsonValue::Null)
}
