/// Error types for backpack-flow operations.
///
/// This module provides the error taxonomy used across the framework. All
/// errors are well-typed and can be pattern-matched for precise handling:
/// configuration problems surface at load time, store problems at the
/// offending call, and node lifecycle failures propagate out of the flow
/// run loop untouched.
use thiserror::Error;

use crate::contract::SchemaIssue;

/// A single failed key in an input contract, with every schema issue found
/// under that key. Validation is always aggregate: the full list of
/// violations is collected before the error is raised.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ContractViolation {
    /// The store key whose value failed its schema.
    pub key: String,
    /// All issues found for this key, with dotted paths.
    pub errors: Vec<SchemaIssue>,
}

/// The main error type for backpack-flow operations.
///
/// All fallible operations return `Result<T, FlowError>` (aliased as
/// [`FlowResult`]).
#[derive(Error, Debug)]
pub enum FlowError {
    /// A config document is missing required fields or carries no version.
    #[error("Validation error: {reason}")]
    Validation {
        /// Description of what the config is missing.
        reason: String,
    },

    /// Config ↔ live-graph conversion failed: unknown node type, unknown
    /// edge endpoint, circular reference, mapping conflict, or an
    /// unsupported document version.
    #[error("Serialization error: {reason}")]
    Serialization {
        /// Description of the conversion failure.
        reason: String,
    },

    /// A dependency key was requested from the container but never
    /// registered by the caller.
    #[error("Dependency '{key}' is not registered")]
    Dependency {
        /// The dependency key that was requested.
        key: String,
    },

    /// Permission rules denied a read or write under strict enforcement.
    #[error("Access denied: node '{node_id}' may not {operation} key '{key}'")]
    AccessDenied {
        /// The node whose access was denied.
        node_id: String,
        /// The key that was targeted.
        key: String,
        /// "read" or "write".
        operation: &'static str,
    },

    /// A required key was absent on `unpack_required`.
    #[error("Key '{key}' not found in backpack")]
    KeyNotFound {
        /// The key that was not found.
        key: String,
        /// The node that asked, when known.
        node_id: Option<String>,
    },

    /// One or more input keys failed their declared schemas.
    #[error("Input contract violated for node '{node_id}': {} key(s) failed", violations.len())]
    ContractValidation {
        /// The node whose input contract failed.
        node_id: String,
        /// Every failing key with its full issue list.
        violations: Vec<ContractViolation>,
    },

    /// A snapshot was requested for a commit that is unknown or has been
    /// evicted from the bounded history.
    #[error("Unknown commit '{commit_id}'")]
    InvalidCommit {
        /// The commit id that could not be resolved.
        commit_id: String,
    },

    /// A node's own prep/exec/post logic failed.
    #[error("Node error: {0}")]
    Node(String),

    /// JSON (de)serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FlowError {
    /// Shorthand for a [`FlowError::Validation`].
    pub fn validation(reason: impl Into<String>) -> Self {
        FlowError::Validation {
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`FlowError::Serialization`].
    pub fn serialization(reason: impl Into<String>) -> Self {
        FlowError::Serialization {
            reason: reason.into(),
        }
    }

    /// Shorthand for a node-level failure from arbitrary error sources.
    pub fn node(reason: impl std::fmt::Display) -> Self {
        FlowError::Node(reason.to_string())
    }
}

/// Result type alias for backpack-flow operations.
pub type FlowResult<T> = Result<T, FlowError>;
