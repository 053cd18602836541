//! Built-in utility nodes.
//!
//! A small catalogue of generic nodes useful for wiring and testing
//! flows: write a value, copy a key, route on a stored value. Concrete
//! LLM and HTTP client nodes live outside the core and register
//! themselves the same way these do.

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};

use crate::config::NodeConfig;
use crate::contract::Schema;
use crate::error::{FlowError, FlowResult};
use crate::node::{Node, NodeContext, StoreHandle};
use crate::registry::{NodeTypeRegistration, NodeTypeRegistry};

/// Writes a configured value under a configured key, then routes
/// "default".
pub struct SetValueNode {
    id: String,
    namespace: String,
    key: String,
    value: JsonValue,
}

impl SetValueNode {
    /// Build from a node config; `params.key` is required.
    pub fn from_config(config: &NodeConfig, context: NodeContext) -> FlowResult<Self> {
        let key = config
            .param_str("key")
            .ok_or_else(|| {
                FlowError::validation(format!(
                    "SetValue node '{}' requires params.key",
                    config.id
                ))
            })?
            .to_string();
        Ok(Self {
            id: config.id.clone(),
            namespace: context.namespace().to_string(),
            key,
            value: config.param("value").cloned().unwrap_or(JsonValue::Null),
        })
    }
}

#[async_trait]
impl Node for SetValueNode {
    fn id(&self) -> &str {
        &self.id
    }
    fn namespace(&self) -> &str {
        &self.namespace
    }
    fn type_name(&self) -> &str {
        "SetValue"
    }
    fn params(&self) -> JsonValue {
        json!({"key": self.key, "value": self.value})
    }

    async fn post(
        &mut self,
        store: &StoreHandle,
        _prep: JsonValue,
        _exec: JsonValue,
    ) -> FlowResult<Option<String>> {
        store.pack(self.key.clone(), self.value.clone())?;
        Ok(Some("default".to_string()))
    }

    fn to_config(&self) -> Option<NodeConfig> {
        Some(NodeConfig::new("SetValue", &self.id).with_params(self.params()))
    }
}

/// Copies the value under `sourceKey` to `targetKey`, then routes
/// "default". Missing sources route "missing" without writing.
pub struct EchoNode {
    id: String,
    namespace: String,
    source_key: String,
    target_key: String,
}

impl EchoNode {
    /// Build from a node config; `params.sourceKey` and
    /// `params.targetKey` are required.
    pub fn from_config(config: &NodeConfig, context: NodeContext) -> FlowResult<Self> {
        let required = |name: &str| {
            config.param_str(name).map(String::from).ok_or_else(|| {
                FlowError::validation(format!(
                    "Echo node '{}' requires params.{name}",
                    config.id
                ))
            })
        };
        Ok(Self {
            id: config.id.clone(),
            namespace: context.namespace().to_string(),
            source_key: required("sourceKey")?,
            target_key: required("targetKey")?,
        })
    }
}

#[async_trait]
impl Node for EchoNode {
    fn id(&self) -> &str {
        &self.id
    }
    fn namespace(&self) -> &str {
        &self.namespace
    }
    fn type_name(&self) -> &str {
        "Echo"
    }
    fn params(&self) -> JsonValue {
        json!({"sourceKey": self.source_key, "targetKey": self.target_key})
    }

    async fn prep(&mut self, store: &StoreHandle) -> FlowResult<JsonValue> {
        Ok(store.unpack(&self.source_key)?.unwrap_or(JsonValue::Null))
    }

    async fn post(
        &mut self,
        store: &StoreHandle,
        _prep: JsonValue,
        exec_result: JsonValue,
    ) -> FlowResult<Option<String>> {
        if exec_result.is_null() {
            return Ok(Some("missing".to_string()));
        }
        store.pack(self.target_key.clone(), exec_result)?;
        Ok(Some("default".to_string()))
    }

    fn to_config(&self) -> Option<NodeConfig> {
        Some(NodeConfig::new("Echo", &self.id).with_params(self.params()))
    }
}

/// Reads the string under `decisionKey` and returns it as the routing
/// action. A missing or non-string value halts the flow.
pub struct DecisionNode {
    id: String,
    namespace: String,
    decision_key: String,
}

impl DecisionNode {
    /// Build from a node config; `params.decisionKey` is required.
    pub fn from_config(config: &NodeConfig, context: NodeContext) -> FlowResult<Self> {
        let decision_key = config
            .param_str("decisionKey")
            .ok_or_else(|| {
                FlowError::validation(format!(
                    "Decision node '{}' requires params.decisionKey",
                    config.id
                ))
            })?
            .to_string();
        Ok(Self {
            id: config.id.clone(),
            namespace: context.namespace().to_string(),
            decision_key,
        })
    }
}

#[async_trait]
impl Node for DecisionNode {
    fn id(&self) -> &str {
        &self.id
    }
    fn namespace(&self) -> &str {
        &self.namespace
    }
    fn type_name(&self) -> &str {
        "Decision"
    }
    fn params(&self) -> JsonValue {
        json!({"decisionKey": self.decision_key})
    }

    async fn prep(&mut self, store: &StoreHandle) -> FlowResult<JsonValue> {
        Ok(store.unpack(&self.decision_key)?.unwrap_or(JsonValue::Null))
    }

    async fn post(
        &mut self,
        _store: &StoreHandle,
        _prep: JsonValue,
        exec_result: JsonValue,
    ) -> FlowResult<Option<String>> {
        Ok(exec_result.as_str().map(String::from))
    }

    fn to_config(&self) -> Option<NodeConfig> {
        Some(NodeConfig::new("Decision", &self.id).with_params(self.params()))
    }
}

/// Register the built-in node types.
pub fn register_builtin_nodes(registry: &mut NodeTypeRegistry) {
    registry.register(
        NodeTypeRegistration::new("SetValue", |config, context, _deps| {
            Ok(Box::new(SetValueNode::from_config(config, context)?) as Box<dyn Node>)
        })
        .with_display_name("Set Value")
        .with_category("logic")
        .with_config_schema(Schema::object([
            ("key", Schema::string().describe("Store key to write")),
            ("value", Schema::any().describe("Value to store")),
        ])),
    );
    registry.register(
        NodeTypeRegistration::new("Echo", |config, context, _deps| {
            Ok(Box::new(EchoNode::from_config(config, context)?) as Box<dyn Node>)
        })
        .with_display_name("Echo")
        .with_category("logic")
        .with_config_schema(Schema::object([
            ("sourceKey", Schema::string().describe("Key to read")),
            ("targetKey", Schema::string().describe("Key to write")),
        ])),
    );
    registry.register(
        NodeTypeRegistration::new("Decision", |config, context, _deps| {
            Ok(Box::new(DecisionNode::from_config(config, context)?) as Box<dyn Node>)
        })
        .with_display_name("Decision")
        .with_category("routing")
        .with_segment("decision")
        .with_config_schema(Schema::object([(
            "decisionKey",
            Schema::string().describe("Key whose string value becomes the action"),
        )])),
    );
}
