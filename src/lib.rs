//! # backpack-flow — Traceable Agent Workflows
//!
//! backpack-flow builds AI-agent workflows as a directed graph of
//! computational nodes sharing one traceable, versioned state container —
//! the **backpack**:
//!
//! - **Versioned state** - every write stamps provenance and bumps a
//!   per-key version; history replays into point-in-time snapshots
//! - **Three-phase nodes** - prep / exec / post with contract validation
//!   and automatic provenance injection
//! - **Action routing** - each node's returned action picks the next
//!   node; composite nodes nest whole flows over the same store
//! - **Portable documents** - flows load from and export to a versioned
//!   JSON config the UI can edit
//!
//! ## Quick Start
//!
//! ```ignore
//! use backpack_flow::prelude::*;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> FlowResult<()> {
//!     let mut registry = NodeTypeRegistry::new();
//!     register_builtin_nodes(&mut registry);
//!
//!     let config = FlowConfig::new("demo")
//!         .with_node(
//!             NodeConfig::new("SetValue", "seed")
//!                 .with_params(json!({"key": "greeting", "value": "hello"})),
//!         )
//!         .with_node(
//!             NodeConfig::new("Echo", "copy")
//!                 .with_params(json!({"sourceKey": "greeting", "targetKey": "copied"})),
//!         )
//!         .with_edge(FlowEdge::new("seed", "copy", "default"));
//!
//!     let mut flow = load_flow(&config, &registry, &DependencyContainer::new())?;
//!     flow.run().await?;
//!
//!     // Every write is traceable.
//!     let history = flow.backpack().get_history();
//!     println!("{} commits", history.len());
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! 1. **Backpack** ([`backpack`]) - versioned key/value store with
//!    history, snapshots, namespace queries, and per-node permissions
//! 2. **Node runtime** ([`node`]) - lifecycle execution with a scoped
//!    store handle that injects the node's identity into every write
//! 3. **Flow orchestrator** ([`flow`]) - graph construction and action
//!    routing over an id-keyed node arena
//! 4. **Serialization bridge** ([`serializer`], [`config`]) - config
//!    documents ↔ live flows, recursive over composite nodes
//! 5. **Event streamer** ([`events`]) - typed lifecycle telemetry with
//!    filters and bounded history
//!
//! ## Concurrency
//!
//! The runtime is single-threaded and cooperative: one node at a time,
//! with suspension points only inside node phases and user event
//! handlers. Shared structures carry coarse locks so a multithreaded
//! embedding stays safe, but nothing in the core schedules work in
//! parallel.

pub mod backpack;
pub mod config;
pub mod contract;
pub mod dependencies;
pub mod error;
pub mod events;
pub mod flow;
pub mod namespace;
pub mod node;
pub mod nodes;
pub mod registry;
pub mod serializer;
pub mod types;

pub use backpack::{Backpack, BackpackConfig, BackpackStats};
pub use config::{
    validate_config, FlowConfig, FlowEdge, NodeConfig, ValidationReport, SUPPORTED_CONFIG_VERSION,
};
pub use contract::{DataContract, Schema, SchemaIssue, SchemaKind};
pub use dependencies::{CredentialResolver, DependencyContainer};
pub use error::{ContractViolation, FlowError, FlowResult};
pub use events::{
    EmitContext, EventFilter, EventPayload, EventStreamer, FlowEvent, FlowEventType, HandlerId,
    LifecyclePhase, StreamerStats,
};
pub use flow::{EdgeMapping, EdgeSpec, Flow, FlowStats, RunReport};
pub use node::{run_lifecycle, Node, NodeContext, StoreHandle};
pub use nodes::register_builtin_nodes;
pub use registry::{NodeFactory, NodeTypeMetadata, NodeTypeRegistration, NodeTypeRegistry};
pub use serializer::{export_flow, load_flow, ExportOptions};
pub use types::{
    BackpackDiff, BackpackSnapshot, Commit, CommitAction, ItemMetadata, ModifiedKey, PackOptions,
    PermissionEntry, StateItem,
};

/// Everything most embedders need, in one import.
pub mod prelude {
    pub use crate::backpack::{Backpack, BackpackConfig};
    pub use crate::config::{validate_config, FlowConfig, FlowEdge, NodeConfig};
    pub use crate::contract::{DataContract, Schema};
    pub use crate::dependencies::{CredentialResolver, DependencyContainer};
    pub use crate::error::{FlowError, FlowResult};
    pub use crate::events::{EventFilter, EventPayload, EventStreamer, FlowEvent, FlowEventType};
    pub use crate::flow::{Flow, RunReport};
    pub use crate::node::{Node, NodeContext, StoreHandle};
    pub use crate::nodes::register_builtin_nodes;
    pub use crate::registry::{NodeTypeRegistration, NodeTypeRegistry};
    pub use crate::serializer::{export_flow, load_flow, ExportOptions};
    pub use crate::types::{PackOptions, PermissionEntry};
}
