//! Caller-provided collaborators, passed in by key.
//!
//! Flows built from config documents need non-serializable collaborators:
//! the shared state store, the event streamer, clients, and the
//! credential manager. The caller constructs a [`DependencyContainer`],
//! registers what its node types need, and hands it to the loader. There
//! are no process-wide singletons; everything a node reaches for was put
//! there explicitly.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use crate::backpack::Backpack;
use crate::error::{FlowError, FlowResult};
use crate::events::EventStreamer;
use crate::registry::NodeTypeRegistry;

/// Container key under which the loader looks for the shared state store.
pub const BACKPACK_KEY: &str = "backpack";
/// Container key under which the loader looks for the event streamer.
pub const EVENT_STREAMER_KEY: &str = "eventStreamer";
/// Container key for the credential resolver.
pub const CREDENTIALS_KEY: &str = "credentials";
/// Container key under which composite-node factories find the registry.
pub const NODE_REGISTRY_KEY: &str = "nodeRegistry";

/// Resolves an opaque credential reference ("env:OPENAI_API_KEY",
/// "vault:prod/llm") to the final secret value.
///
/// Resolution is entirely the embedder's concern; the core never
/// interprets the reference string.
pub trait CredentialResolver: Send + Sync {
    /// Resolve a reference to the secret it names.
    fn resolve(&self, reference: &str) -> FlowResult<String>;
}

/// A registry of collaborators keyed by string.
///
/// Values are stored type-erased; retrieval downcasts back to the
/// registered type. Registering `Arc`-wrapped values keeps retrieval
/// cheap: `get` clones the stored value.
#[derive(Default)]
pub struct DependencyContainer {
    entries: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl DependencyContainer {
    /// An empty container.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a value under a key, replacing any previous value.
    pub fn register<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.entries.insert(key.into(), Box::new(value));
    }

    /// Retrieve a clone of the value registered under a key.
    ///
    /// Fails with [`FlowError::Dependency`] when the key is absent or the
    /// stored value has a different type.
    pub fn get<T: Any + Send + Sync + Clone>(&self, key: &str) -> FlowResult<T> {
        self.entries
            .get(key)
            .and_then(|value| value.downcast_ref::<T>())
            .cloned()
            .ok_or_else(|| FlowError::Dependency {
                key: key.to_string(),
            })
    }

    /// Whether a key is registered.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Registered keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Register the shared state store under its well-known key.
    pub fn register_backpack(&mut self, backpack: Arc<Backpack>) {
        self.register(BACKPACK_KEY, backpack);
    }

    /// The shared state store, when registered.
    pub fn backpack(&self) -> FlowResult<Arc<Backpack>> {
        self.get(BACKPACK_KEY)
    }

    /// Register the event streamer under its well-known key.
    pub fn register_event_streamer(&mut self, events: Arc<EventStreamer>) {
        self.register(EVENT_STREAMER_KEY, events);
    }

    /// The event streamer, when registered.
    pub fn event_streamer(&self) -> FlowResult<Arc<EventStreamer>> {
        self.get(EVENT_STREAMER_KEY)
    }

    /// Register the node-type registry under its well-known key.
    pub fn register_node_registry(&mut self, registry: Arc<NodeTypeRegistry>) {
        self.register(NODE_REGISTRY_KEY, registry);
    }

    /// The node-type registry, when registered.
    pub fn node_registry(&self) -> FlowResult<Arc<NodeTypeRegistry>> {
        self.get(NODE_REGISTRY_KEY)
    }

    /// Register the credential resolver under its well-known key.
    pub fn register_credentials(&mut self, resolver: Arc<dyn CredentialResolver>) {
        self.register(CREDENTIALS_KEY, resolver);
    }

    /// Resolve a credential reference through the registered resolver.
    pub fn resolve_credential(&self, reference: &str) -> FlowResult<String> {
        let resolver: Arc<dyn CredentialResolver> = self.get(CREDENTIALS_KEY)?;
        resolver.resolve(reference)
    }
}

impl std::fmt::Debug for DependencyContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyContainer")
            .field("keys", &self.keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticSecrets;

    impl CredentialResolver for StaticSecrets {
        fn resolve(&self, reference: &str) -> FlowResult<String> {
            match reference {
                "env:API_KEY" => Ok("sk-test".to_string()),
                other => Err(FlowError::Dependency {
                    key: other.to_string(),
                }),
            }
        }
    }

    #[test]
    fn test_round_trip_arc_value() {
        let mut container = DependencyContainer::new();
        let backpack = Arc::new(Backpack::new());
        container.register_backpack(Arc::clone(&backpack));
        let fetched = container.backpack().unwrap();
        assert!(Arc::ptr_eq(&backpack, &fetched));
    }

    #[test]
    fn test_missing_key_is_dependency_error() {
        let container = DependencyContainer::new();
        assert!(matches!(
            container.backpack(),
            Err(FlowError::Dependency { .. })
        ));
    }

    #[test]
    fn test_wrong_type_is_dependency_error() {
        let mut container = DependencyContainer::new();
        container.register("backpack", 42_u64);
        assert!(matches!(
            container.backpack(),
            Err(FlowError::Dependency { .. })
        ));
    }

    #[test]
    fn test_credential_resolution() {
        let mut container = DependencyContainer::new();
        container.register_credentials(Arc::new(StaticSecrets));
        assert_eq!(
            container.resolve_credential("env:API_KEY").unwrap(),
            "sk-test"
        );
        assert!(container.resolve_credential("env:OTHER").is_err());
    }
}
