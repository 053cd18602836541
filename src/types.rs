/// Common types used throughout backpack-flow.
///
/// This module defines the core data structures of the state store: items,
/// their provenance metadata, immutable history commits, permission
/// entries, and the serializable snapshot document. The types are simple,
/// serde-friendly, and owned by the store; callers receive clones.
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

/// Maximum characters of a value rendered into a commit summary before the
/// tail is replaced by a content digest.
const MAX_SUMMARY_LEN: usize = 64;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Provenance metadata attached to every stored item.
///
/// Stamped by the store at `pack` time from the write options; the node
/// runtime defaults these to the writing node's identity, so provenance is
/// never blank for in-lifecycle writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemMetadata {
    /// Id of the node that wrote this version.
    #[serde(rename = "sourceNodeId")]
    pub source_node_id: String,
    /// Human-readable name of the writing node.
    #[serde(rename = "sourceNodeName")]
    pub source_node_name: String,
    /// Full dotted namespace of the writing node, if any.
    #[serde(rename = "sourceNamespace", skip_serializing_if = "Option::is_none")]
    pub source_namespace: Option<String>,
    /// Write time, milliseconds since epoch.
    pub timestamp: i64,
    /// Monotonic per-key version, starting at 1.
    pub version: u64,
    /// Free-form tags supplied by the writer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

/// An entry in the state store: a key, its current value, and provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateItem {
    /// The key, unique within the store.
    pub key: String,
    /// The stored payload.
    pub value: JsonValue,
    /// Provenance and versioning metadata.
    pub metadata: ItemMetadata,
}

/// The kind of state-changing (or read-logging) action a commit records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitAction {
    /// A write.
    Pack,
    /// A logged read (opt-in, see `BackpackConfig::log_reads`).
    Unpack,
    /// A value moved aside by an external moderation step.
    Quarantine,
}

impl std::fmt::Display for CommitAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommitAction::Pack => write!(f, "pack"),
            CommitAction::Unpack => write!(f, "unpack"),
            CommitAction::Quarantine => write!(f, "quarantine"),
        }
    }
}

/// An immutable record appended to history for every store action.
///
/// Commits are never edited after creation. Snapshot reconstruction
/// replays pack-commits in chronological order; the bounded history may
/// evict the oldest commits (FIFO), after which snapshots at those commits
/// are no longer reachable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    /// Globally unique commit id.
    #[serde(rename = "commitId")]
    pub commit_id: String,
    /// Commit time, milliseconds since epoch.
    pub timestamp: i64,
    /// Id of the acting node.
    #[serde(rename = "nodeId")]
    pub node_id: String,
    /// Name of the acting node.
    #[serde(rename = "nodeName")]
    pub node_name: String,
    /// Namespace of the acting node, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// What happened.
    pub action: CommitAction,
    /// The key that was acted on.
    pub key: String,
    /// The value after the action.
    #[serde(rename = "newValue")]
    pub new_value: JsonValue,
    /// The value before the action, absent for first writes.
    #[serde(rename = "previousValue", skip_serializing_if = "Option::is_none")]
    pub previous_value: Option<JsonValue>,
    /// Short display string for the new value.
    #[serde(rename = "valueSummary")]
    pub value_summary: String,
}

/// Render a short display summary of a value.
///
/// Values longer than the display budget are truncated and suffixed with a
/// blake3 digest prefix of the full canonical JSON, so two different long
/// values never share a summary.
pub(crate) fn summarize_value(value: &JsonValue) -> String {
    let text = value.to_string();
    if text.len() <= MAX_SUMMARY_LEN {
        return text;
    }
    let mut cut = MAX_SUMMARY_LEN;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    let digest = blake3::hash(text.as_bytes()).to_hex();
    format!("{}… blake3:{}", &text[..cut], &digest[..8])
}

/// Per-node permission bundle.
///
/// Absence of an entry for a node id means unrestricted access; enforcement
/// is opt-in per node. `deny` always overrides every allow rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PermissionEntry {
    /// Keys this node may read.
    #[serde(default)]
    pub read: Vec<String>,
    /// Keys this node may write.
    #[serde(default)]
    pub write: Vec<String>,
    /// Keys this node may never touch, regardless of other rules.
    #[serde(default)]
    pub deny: Vec<String>,
    /// Namespace patterns this node may read from.
    #[serde(rename = "namespaceRead", default)]
    pub namespace_read: Vec<String>,
    /// Namespace patterns this node may write into.
    #[serde(rename = "namespaceWrite", default)]
    pub namespace_write: Vec<String>,
}

impl PermissionEntry {
    /// Create an entry that allows nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow reading the given keys.
    pub fn with_read<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.read.extend(keys.into_iter().map(Into::into));
        self
    }

    /// Allow writing the given keys.
    pub fn with_write<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.write.extend(keys.into_iter().map(Into::into));
        self
    }

    /// Forbid the given keys outright.
    pub fn with_deny<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.deny.extend(keys.into_iter().map(Into::into));
        self
    }

    /// Allow reading from namespaces matching the given patterns.
    pub fn with_namespace_read<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.namespace_read
            .extend(patterns.into_iter().map(Into::into));
        self
    }

    /// Allow writing into namespaces matching the given patterns.
    pub fn with_namespace_write<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.namespace_write
            .extend(patterns.into_iter().map(Into::into));
        self
    }
}

/// Write options carried by `pack`.
///
/// Everything is optional; the node runtime's store handle fills in the
/// writing node's identity for any field left unset.
#[derive(Debug, Clone, Default)]
pub struct PackOptions {
    /// Id of the writing node.
    pub node_id: Option<String>,
    /// Name of the writing node.
    pub node_name: Option<String>,
    /// Namespace stamped into the item.
    pub namespace: Option<String>,
    /// Free-form tags.
    pub tags: Option<Vec<String>>,
}

impl PackOptions {
    /// Options carrying a full node identity.
    pub fn for_node(
        node_id: impl Into<String>,
        node_name: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            node_id: Some(node_id.into()),
            node_name: Some(node_name.into()),
            namespace: Some(namespace.into()),
            tags: None,
        }
    }

    /// Options carrying only a node id (name defaults to the id).
    pub fn for_node_id(node_id: impl Into<String>) -> Self {
        let id = node_id.into();
        Self {
            node_name: Some(id.clone()),
            node_id: Some(id),
            namespace: None,
            tags: None,
        }
    }

    /// Attach tags.
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }
}

/// Serializable point-in-time image of a store: items, history, and the
/// permission table. `from_snapshot` restores all three.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackpackSnapshot {
    /// Every current item, as (key, item) pairs sorted by key.
    pub items: Vec<(String, StateItem)>,
    /// The full commit history, oldest first.
    pub history: Vec<Commit>,
    /// The permission table, keyed by node id.
    pub permissions: BTreeMap<String, PermissionEntry>,
    /// When the snapshot was taken, milliseconds since epoch.
    pub timestamp: i64,
    /// The commit this snapshot was reconstructed at, when applicable.
    #[serde(rename = "commitId", skip_serializing_if = "Option::is_none")]
    pub commit_id: Option<String>,
}

/// One key whose value differs between two stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModifiedKey {
    /// The key.
    pub key: String,
    /// Value in the first store.
    #[serde(rename = "oldValue")]
    pub old_value: JsonValue,
    /// Value in the second store.
    #[serde(rename = "newValue")]
    pub new_value: JsonValue,
}

/// Structural difference between the current item sets of two stores.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackpackDiff {
    /// Keys present only in the second store.
    pub added: Vec<String>,
    /// Keys present only in the first store.
    pub removed: Vec<String>,
    /// Keys present in both with differing values.
    pub modified: Vec<ModifiedKey>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_summarize_short_value_verbatim() {
        assert_eq!(summarize_value(&json!(42)), "42");
        assert_eq!(summarize_value(&json!({"a": 1})), "{\"a\":1}");
    }

    #[test]
    fn test_summarize_long_value_truncates_with_digest() {
        let long = json!("x".repeat(500));
        let summary = summarize_value(&long);
        assert!(summary.len() < 100);
        assert!(summary.contains("blake3:"));
    }

    #[test]
    fn test_summaries_of_distinct_long_values_differ() {
        let a = json!(format!("{}a", "x".repeat(500)));
        let b = json!(format!("{}b", "x".repeat(500)));
        assert_ne!(summarize_value(&a), summarize_value(&b));
    }

    #[test]
    fn test_commit_serde_field_names() {
        let commit = Commit {
            commit_id: "c1".to_string(),
            timestamp: 1,
            node_id: "n".to_string(),
            node_name: "n".to_string(),
            namespace: None,
            action: CommitAction::Pack,
            key: "k".to_string(),
            new_value: json!(1),
            previous_value: None,
            value_summary: "1".to_string(),
        };
        let doc = serde_json::to_value(&commit).unwrap();
        assert_eq!(doc["commitId"], "c1");
        assert_eq!(doc["action"], "pack");
        assert!(doc.get("previousValue").is_none());
    }

    #[test]
    fn test_permission_entry_builder() {
        let entry = PermissionEntry::new()
            .with_read(["a"])
            .with_deny(["secret"])
            .with_namespace_read(["public.*"]);
        assert_eq!(entry.read, vec!["a"]);
        assert_eq!(entry.deny, vec!["secret"]);
        assert_eq!(entry.namespace_read, vec!["public.*"]);
        assert!(entry.write.is_empty());
    }
}
