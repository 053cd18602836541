//! The node-type registry: name → factory plus UI-facing metadata.
//!
//! The serialization bridge resolves the `type` field of a node config
//! through this table, and the Studio-style embedding surface queries it
//! for display names, categories, and schemas. Registrations are built
//! with [`NodeTypeRegistration::new`] and its `with_*` methods.

use indexmap::IndexMap;
use serde::Serialize;

use crate::config::NodeConfig;
use crate::contract::{DataContract, Schema};
use crate::dependencies::DependencyContainer;
use crate::error::{FlowError, FlowResult};
use crate::node::{Node, NodeContext};

/// UI-facing description of a node type.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeTypeMetadata {
    /// The registered type name, as used in config documents.
    pub type_name: String,
    /// Human-readable name shown in the UI.
    pub display_name: String,
    /// Palette category ("llm", "logic", "io", ...).
    pub category: String,
    /// Schema of the `params` object, when the type declares one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_schema: Option<Schema>,
    /// Input contract over store keys.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inputs: Option<DataContract>,
    /// Output contract over store keys.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<DataContract>,
}

/// Factory signature: build a node from its config, the composed context,
/// and the caller's dependency container.
pub type NodeFactory = Box<
    dyn Fn(&NodeConfig, NodeContext, &DependencyContainer) -> FlowResult<Box<dyn Node>>
        + Send
        + Sync,
>;

/// One registered node type.
pub struct NodeTypeRegistration {
    metadata: NodeTypeMetadata,
    /// The type's static namespace segment; nodes of types without one
    /// fall back to their id.
    segment: Option<String>,
    factory: NodeFactory,
}

impl NodeTypeRegistration {
    /// A registration for `type_name` built by `factory`.
    pub fn new<F>(type_name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&NodeConfig, NodeContext, &DependencyContainer) -> FlowResult<Box<dyn Node>>
            + Send
            + Sync
            + 'static,
    {
        let type_name = type_name.into();
        Self {
            metadata: NodeTypeMetadata {
                display_name: type_name.clone(),
                type_name,
                category: "general".to_string(),
                config_schema: None,
                inputs: None,
                outputs: None,
            },
            segment: None,
            factory: Box::new(factory),
        }
    }

    /// Set the static namespace segment.
    pub fn with_segment(mut self, segment: impl Into<String>) -> Self {
        self.segment = Some(segment.into());
        self
    }

    /// Set the display name.
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.metadata.display_name = name.into();
        self
    }

    /// Set the palette category.
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.metadata.category = category.into();
        self
    }

    /// Declare the params schema.
    pub fn with_config_schema(mut self, schema: Schema) -> Self {
        self.metadata.config_schema = Some(schema);
        self
    }

    /// Declare the input contract.
    pub fn with_inputs(mut self, contract: DataContract) -> Self {
        self.metadata.inputs = Some(contract);
        self
    }

    /// Declare the output contract.
    pub fn with_outputs(mut self, contract: DataContract) -> Self {
        self.metadata.outputs = Some(contract);
        self
    }

    /// The type's metadata.
    pub fn metadata(&self) -> &NodeTypeMetadata {
        &self.metadata
    }

    /// The type's static namespace segment, when declared.
    pub fn segment(&self) -> Option<&str> {
        self.segment.as_deref()
    }
}

/// Table of node types the serialization bridge can instantiate.
#[derive(Default)]
pub struct NodeTypeRegistry {
    types: IndexMap<String, NodeTypeRegistration>,
}

impl NodeTypeRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a registration, replacing any previous one for the same name.
    pub fn register(&mut self, registration: NodeTypeRegistration) {
        self.types
            .insert(registration.metadata.type_name.clone(), registration);
    }

    /// Whether a type name is registered.
    pub fn contains(&self, type_name: &str) -> bool {
        self.types.contains_key(type_name)
    }

    /// Look up a registration.
    pub fn get(&self, type_name: &str) -> Option<&NodeTypeRegistration> {
        self.types.get(type_name)
    }

    /// Metadata for every registered type, in registration order. This is
    /// the node-type endpoint the UI queries.
    pub fn list(&self) -> Vec<&NodeTypeMetadata> {
        self.types.values().map(|r| r.metadata()).collect()
    }

    /// Instantiate a node of a registered type.
    pub fn create(
        &self,
        type_name: &str,
        config: &NodeConfig,
        context: NodeContext,
        dependencies: &DependencyContainer,
    ) -> FlowResult<Box<dyn Node>> {
        let registration = self.get(type_name).ok_or_else(|| {
            FlowError::serialization(format!("unknown node type '{type_name}'"))
        })?;
        (registration.factory)(config, context, dependencies)
    }
}

impl std::fmt::Debug for NodeTypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeTypeRegistry")
            .field("types", &self.types.keys().collect::<Vec<_>>())
            .finish()
    }
}
