//! The versioned flow-config document.
//!
//! A [`FlowConfig`] is the JSON document the UI loads and exports: node
//! configs identified by type name, edges identified by (from, to,
//! condition), and optional nested documents for composite nodes. Unknown
//! fields at any level survive a parse → serialize round trip (they land
//! in the flattened `extra` maps), and unknown version strings are
//! rejected at load time.
//!
//! Besides the document types this module carries the no-instantiation
//! validator and the query utilities the UI uses to inspect a document
//! without building a live flow.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;

use crate::contract::DataContract;
use crate::registry::NodeTypeRegistry;

/// The config document version this crate reads and writes.
pub const SUPPORTED_CONFIG_VERSION: &str = "2.0.0";

/// A complete flow document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Document schema version. Required on load; absent means the
    /// document is invalid.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Namespace of the flow.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Node configs, in declaration order.
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
    /// Edges between declared nodes.
    #[serde(default)]
    pub edges: Vec<FlowEdge>,
    /// Dependency keys the flow expects the caller to provide, mapped to
    /// human-readable descriptions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<BTreeMap<String, String>>,
    /// Unknown fields, preserved across round trips.
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl FlowConfig {
    /// An empty document at the supported version.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            version: Some(SUPPORTED_CONFIG_VERSION.to_string()),
            namespace: Some(namespace.into()),
            nodes: Vec::new(),
            edges: Vec::new(),
            dependencies: Some(BTreeMap::new()),
            extra: Map::new(),
        }
    }

    /// Append a node config.
    pub fn with_node(mut self, node: NodeConfig) -> Self {
        self.nodes.push(node);
        self
    }

    /// Append an edge.
    pub fn with_edge(mut self, edge: FlowEdge) -> Self {
        self.edges.push(edge);
        self
    }

    /// Every node in this document and all nested documents, paired with
    /// its dotted path ("parent.child" for a node inside the internal
    /// flow of "parent").
    pub fn flatten_nodes(&self) -> Vec<(String, &NodeConfig)> {
        let mut result = Vec::new();
        collect_nodes(self, "", &mut result);
        result
    }

    /// Every edge in this document and all nested documents.
    pub fn flatten_edges(&self) -> Vec<&FlowEdge> {
        let mut result = Vec::new();
        collect_edges(self, &mut result);
        result
    }

    /// Resolve a dotted path to a node, descending through internal
    /// flows: "pipeline.retry" finds node "retry" inside the internal
    /// flow of node "pipeline".
    pub fn find_node(&self, path: &str) -> Option<&NodeConfig> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut node = self.nodes.iter().find(|n| n.id == first)?;
        for segment in segments {
            node = node
                .internal_flow
                .as_ref()?
                .nodes
                .iter()
                .find(|n| n.id == segment)?;
        }
        Some(node)
    }

    /// Every composite node (one carrying an internal flow), with its
    /// dotted path.
    pub fn get_composite_nodes(&self) -> Vec<(String, &NodeConfig)> {
        self.flatten_nodes()
            .into_iter()
            .filter(|(_, node)| node.internal_flow.is_some())
            .collect()
    }

    /// Nesting depth of the document: 0 for a flat flow, 1 when a node
    /// carries a flat internal flow, and so on.
    pub fn get_max_depth(&self) -> usize {
        self.nodes
            .iter()
            .filter_map(|node| node.internal_flow.as_ref())
            .map(|inner| 1 + inner.get_max_depth())
            .max()
            .unwrap_or(0)
    }
}

fn collect_nodes<'a>(config: &'a FlowConfig, prefix: &str, out: &mut Vec<(String, &'a NodeConfig)>) {
    for node in &config.nodes {
        let path = if prefix.is_empty() {
            node.id.clone()
        } else {
            format!("{prefix}.{}", node.id)
        };
        out.push((path.clone(), node));
        if let Some(inner) = &node.internal_flow {
            collect_nodes(inner, &path, out);
        }
    }
}

fn collect_edges<'a>(config: &'a FlowConfig, out: &mut Vec<&'a FlowEdge>) {
    out.extend(config.edges.iter());
    for node in &config.nodes {
        if let Some(inner) = &node.internal_flow {
            collect_edges(inner, out);
        }
    }
}

/// One node in a flow document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Registered type name.
    #[serde(rename = "type")]
    pub node_type: String,
    /// Node id, unique within its document.
    pub id: String,
    /// Node-specific configuration.
    #[serde(default)]
    pub params: JsonValue,
    /// Dependency keys this node expects in the container.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<Vec<String>>,
    /// Portable input contract.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inputs: Option<DataContract>,
    /// Portable output contract.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<DataContract>,
    /// Nested document of a composite node.
    #[serde(rename = "internalFlow", skip_serializing_if = "Option::is_none")]
    pub internal_flow: Option<Box<FlowConfig>>,
    /// Unknown fields, preserved across round trips.
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl NodeConfig {
    /// A config for a node of `node_type` with empty params.
    pub fn new(node_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            node_type: node_type.into(),
            id: id.into(),
            params: JsonValue::Object(Map::new()),
            dependencies: None,
            inputs: None,
            outputs: None,
            internal_flow: None,
            extra: Map::new(),
        }
    }

    /// Set the params object.
    pub fn with_params(mut self, params: JsonValue) -> Self {
        self.params = params;
        self
    }

    /// Attach a nested document, marking this node composite.
    pub fn with_internal_flow(mut self, flow: FlowConfig) -> Self {
        self.internal_flow = Some(Box::new(flow));
        self
    }

    /// Read one param field.
    pub fn param(&self, name: &str) -> Option<&JsonValue> {
        self.params.get(name)
    }

    /// Read one param field as a string.
    pub fn param_str(&self, name: &str) -> Option<&str> {
        self.param(name).and_then(|v| v.as_str())
    }
}

/// One edge in a flow document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowEdge {
    /// Source node id.
    pub from: String,
    /// Target node id.
    pub to: String,
    /// Action string that routes along this edge.
    pub condition: String,
    /// Optional key remappings applied before the target runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mappings: Option<IndexMap<String, String>>,
    /// Unknown fields, preserved across round trips.
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl FlowEdge {
    /// An edge from → to under `condition`.
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        condition: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: condition.into(),
            mappings: None,
            extra: Map::new(),
        }
    }

    /// Attach key remappings.
    pub fn with_mappings<I, S>(mut self, mappings: I) -> Self
    where
        I: IntoIterator<Item = (S, S)>,
        S: Into<String>,
    {
        self.mappings = Some(
            mappings
                .into_iter()
                .map(|(s, t)| (s.into(), t.into()))
                .collect(),
        );
        self
    }
}

/// Result of [`validate_config`]: overall verdict plus every problem
/// found.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    /// True when no errors were found.
    pub valid: bool,
    /// Every problem, in document order.
    pub errors: Vec<String>,
}

/// Check a document without instantiating anything.
///
/// Verifies: version present and supported; at least one node; unique
/// node ids; every node type registered; every edge endpoint present;
/// every edge condition non-empty. All problems are reported, not just
/// the first.
pub fn validate_config(config: &FlowConfig, registry: &NodeTypeRegistry) -> ValidationReport {
    let mut errors = Vec::new();

    match &config.version {
        None => errors.push("missing version".to_string()),
        Some(version) if version != SUPPORTED_CONFIG_VERSION => {
            errors.push(format!(
                "unsupported version '{version}' (expected '{SUPPORTED_CONFIG_VERSION}')"
            ));
        }
        Some(_) => {}
    }

    if config.nodes.is_empty() {
        errors.push("flow has no nodes".to_string());
    }

    let mut seen = std::collections::HashSet::new();
    for node in &config.nodes {
        if !seen.insert(node.id.as_str()) {
            errors.push(format!("duplicate node id '{}'", node.id));
        }
        if !registry.contains(&node.node_type) {
            errors.push(format!(
                "node '{}' has unregistered type '{}'",
                node.id, node.node_type
            ));
        }
    }

    for edge in &config.edges {
        if !config.nodes.iter().any(|n| n.id == edge.from) {
            errors.push(format!("edge references unknown source '{}'", edge.from));
        }
        if !config.nodes.iter().any(|n| n.id == edge.to) {
            errors.push(format!("edge references unknown target '{}'", edge.to));
        }
        if edge.condition.is_empty() {
            errors.push(format!(
                "edge {} -> {} has an empty condition",
                edge.from, edge.to
            ));
        }
    }

    ValidationReport {
        valid: errors.is_empty(),
        errors,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn nested_config() -> FlowConfig {
        let inner = FlowConfig::new("pipeline")
            .with_node(NodeConfig::new("SetValue", "s1"))
            .with_node(NodeConfig::new("SetValue", "s2"))
            .with_edge(FlowEdge::new("s1", "s2", "default"));
        FlowConfig::new("root")
            .with_node(NodeConfig::new("Composite", "pipeline").with_internal_flow(inner))
            .with_node(NodeConfig::new("SetValue", "tail"))
            .with_edge(FlowEdge::new("pipeline", "tail", "done"))
    }

    #[test]
    fn test_unknown_fields_survive_round_trip() {
        let document = json!({
            "version": "2.0.0",
            "namespace": "root",
            "nodes": [
                {"type": "SetValue", "id": "a", "params": {}, "uiPosition": {"x": 10, "y": 20}}
            ],
            "edges": [
                {"from": "a", "to": "a", "condition": "loop", "uiColor": "red"}
            ],
            "studioLayout": "grid"
        });
        let config: FlowConfig = serde_json::from_value(document.clone()).unwrap();
        let back = serde_json::to_value(&config).unwrap();
        assert_eq!(back["studioLayout"], "grid");
        assert_eq!(back["nodes"][0]["uiPosition"]["x"], 10);
        assert_eq!(back["edges"][0]["uiColor"], "red");
    }

    #[test]
    fn test_flatten_nodes_paths() {
        let config = nested_config();
        let paths: Vec<String> = config.flatten_nodes().into_iter().map(|(p, _)| p).collect();
        assert_eq!(paths, vec!["pipeline", "pipeline.s1", "pipeline.s2", "tail"]);
    }

    #[test]
    fn test_flatten_edges_includes_nested() {
        let config = nested_config();
        assert_eq!(config.flatten_edges().len(), 2);
    }

    #[test]
    fn test_find_node_by_dotted_path() {
        let config = nested_config();
        assert_eq!(config.find_node("tail").unwrap().id, "tail");
        assert_eq!(config.find_node("pipeline.s2").unwrap().id, "s2");
        assert!(config.find_node("pipeline.missing").is_none());
        assert!(config.find_node("tail.s1").is_none());
    }

    #[test]
    fn test_composite_nodes_and_depth() {
        let config = nested_config();
        let composites = config.get_composite_nodes();
        assert_eq!(composites.len(), 1);
        assert_eq!(composites[0].0, "pipeline");
        assert_eq!(config.get_max_depth(), 1);
        assert_eq!(FlowConfig::new("flat").get_max_depth(), 0);
    }

    #[test]
    fn test_validate_reports_every_problem() {
        let registry = NodeTypeRegistry::new();
        let config = FlowConfig {
            version: None,
            ..FlowConfig::new("root")
        }
        .with_node(NodeConfig::new("Ghost", "a"))
        .with_node(NodeConfig::new("Ghost", "a"))
        .with_edge(FlowEdge {
            condition: String::new(),
            ..FlowEdge::new("a", "missing", "")
        });

        let report = validate_config(&config, &registry);
        assert!(!report.valid);
        assert!(report.errors.iter().any(|e| e.contains("missing version")));
        assert!(report.errors.iter().any(|e| e.contains("duplicate node id")));
        assert!(report
            .errors
            .iter()
            .any(|e| e.contains("unregistered type")));
        assert!(report
            .errors
            .iter()
            .any(|e| e.contains("unknown target 'missing'")));
        assert!(report.errors.iter().any(|e| e.contains("empty condition")));
    }

    #[test]
    fn test_validate_accepts_good_config() {
        let mut registry = NodeTypeRegistry::new();
        crate::nodes::register_builtin_nodes(&mut registry);
        let config = FlowConfig::new("root")
            .with_node(NodeConfig::new("SetValue", "a"))
            .with_node(NodeConfig::new("Echo", "b"))
            .with_edge(FlowEdge::new("a", "b", "default"));
        let report = validate_config(&config, &registry);
        assert!(report.valid, "unexpected errors: {:?}", report.errors);
    }
}
