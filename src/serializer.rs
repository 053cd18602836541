//! The serialization bridge: config documents ↔ live flows.
//!
//! `load_flow` turns a [`FlowConfig`] into a runnable [`Flow`], resolving
//! node types through the registry and collaborators through the
//! dependency container. `export_flow` walks a live flow back into a
//! document, recursing into composite nodes up to a configurable depth
//! and refusing circular hierarchies.
//!
//! Edge key-mappings are honored on load: the mapping pairs of an edge
//! are installed on the target node and applied just before its
//! lifecycle, which places them ahead of input-contract validation.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

use crate::backpack::Backpack;
use crate::config::{FlowConfig, FlowEdge, NodeConfig, SUPPORTED_CONFIG_VERSION};
use crate::dependencies::DependencyContainer;
use crate::error::{FlowError, FlowResult};
use crate::flow::Flow;
use crate::registry::NodeTypeRegistry;

/// Default recursion depth for composite export.
pub const DEFAULT_EXPORT_DEPTH: usize = 10;

/// Options controlling [`export_flow`].
#[derive(Debug, Clone)]
pub struct ExportOptions {
    /// How many composite levels to descend into. Depth 0 exports no
    /// internal flows at all.
    pub max_depth: usize,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_EXPORT_DEPTH,
        }
    }
}

impl ExportOptions {
    /// Export to a specific depth.
    pub fn with_depth(max_depth: usize) -> Self {
        Self { max_depth }
    }

    /// Export every level, however deep.
    pub fn unlimited() -> Self {
        Self {
            max_depth: usize::MAX,
        }
    }
}

/// Build a live flow from a config document.
///
/// The document version must be present (else a validation error) and
/// equal to the supported version (else a serialization error). The state
/// store and event streamer come from the dependency container when
/// registered there; otherwise the flow gets a fresh store and no
/// streamer. Node configs are instantiated in declared order through the
/// registry; the first node becomes the entry node.
pub fn load_flow(
    config: &FlowConfig,
    registry: &NodeTypeRegistry,
    dependencies: &DependencyContainer,
) -> FlowResult<Flow> {
    match &config.version {
        None => return Err(FlowError::validation("flow config is missing a version")),
        Some(version) if version != SUPPORTED_CONFIG_VERSION => {
            return Err(FlowError::serialization(format!(
                "unsupported config version '{version}' (expected '{SUPPORTED_CONFIG_VERSION}')"
            )));
        }
        Some(_) => {}
    }

    let backpack = dependencies
        .backpack()
        .unwrap_or_else(|_| Arc::new(Backpack::new()));
    let events = dependencies.event_streamer().ok();
    let mut flow = Flow::with_shared(
        config.namespace.clone().unwrap_or_default(),
        backpack,
        events,
    );

    for node_config in &config.nodes {
        let registration = registry.get(&node_config.node_type).ok_or_else(|| {
            FlowError::serialization(format!(
                "unknown node type '{}' for node '{}'",
                node_config.node_type, node_config.id
            ))
        })?;
        let segment = registration
            .segment()
            .unwrap_or(node_config.id.as_str())
            .to_string();
        let context = flow.node_context(&segment);
        let node = registry.create(&node_config.node_type, node_config, context, dependencies)?;
        flow.register_node(node);
    }

    if let Some(first) = config.nodes.first() {
        flow.set_entry_node(&first.id)?;
    }

    for edge in &config.edges {
        if flow.get_node(&edge.from).is_none() {
            return Err(FlowError::serialization(format!(
                "edge references unknown source node '{}'",
                edge.from
            )));
        }
        if flow.get_node(&edge.to).is_none() {
            return Err(FlowError::serialization(format!(
                "edge references unknown target node '{}'",
                edge.to
            )));
        }
        match &edge.mappings {
            Some(mappings) => {
                flow.on_mapped(&edge.from, &edge.condition, &edge.to, mappings.clone())?
            }
            None => flow.on(&edge.from, &edge.condition, &edge.to)?,
        }
    }

    Ok(flow)
}

/// Serialize a live flow into a config document.
///
/// Nodes are exported in insertion order via their `to_config`; a node
/// without one is exported as its bare type name with empty params and a
/// warning. Composite nodes recurse while the current depth is below the
/// configured maximum, each branch carrying its own copy of the visited
/// set. A flow namespace encountered twice on one branch is a circular
/// reference and fails the export.
pub fn export_flow(flow: &Flow, options: &ExportOptions) -> FlowResult<FlowConfig> {
    export_recursive(flow, 0, HashSet::new(), options)
}

fn export_recursive(
    flow: &Flow,
    depth: usize,
    mut visited: HashSet<String>,
    options: &ExportOptions,
) -> FlowResult<FlowConfig> {
    if !visited.insert(flow.namespace().to_string()) {
        return Err(FlowError::serialization(format!(
            "circular reference: flow '{}' reached from itself",
            flow.namespace()
        )));
    }

    let mut nodes = Vec::new();
    for node in flow.get_all_nodes() {
        let mut node_config = node.to_config().unwrap_or_else(|| {
            warn!(
                node = node.id(),
                node_type = node.type_name(),
                "node has no to_config; exporting bare type with empty params"
            );
            NodeConfig::new(node.type_name(), node.id())
        });
        if let Some(inner) = node.internal_flow() {
            if depth < options.max_depth {
                node_config.internal_flow = Some(Box::new(export_recursive(
                    inner,
                    depth + 1,
                    visited.clone(),
                    options,
                )?));
            }
        }
        nodes.push(node_config);
    }

    let edges = flow
        .edges()
        .into_iter()
        .map(|edge| {
            let mut flow_edge = FlowEdge::new(edge.from, edge.to, edge.condition);
            flow_edge.mappings = edge.mappings;
            flow_edge
        })
        .collect();

    Ok(FlowConfig {
        version: Some(SUPPORTED_CONFIG_VERSION.to_string()),
        namespace: Some(flow.namespace().to_string()),
        nodes,
        edges,
        dependencies: Some(Default::default()),
        extra: Default::default(),
    })
}
