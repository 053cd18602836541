/// The state store ("backpack") with provenance and causal history.
///
/// This module implements the versioned key/value container every node in
/// a flow tree shares. Unlike a plain map, the backpack never forgets how
/// a value came to be:
///
/// - Every write stamps provenance (node id, name, namespace) and bumps a
///   per-key version
/// - Every action appends an immutable commit to a bounded history
/// - Any still-retained commit can be replayed into a point-in-time
///   snapshot
/// - Namespace-scoped queries return deep copies, so callers can never
///   alias stored state
/// - An opt-in permission table gates reads and writes per node identity
///
/// The store is in-process and snapshot-serializable; there is no
/// persistence backend and no network transport. Shared structures are
/// guarded by coarse locks so a multithreaded embedding stays safe, but
/// the runtime contract is single-threaded and cooperative.
use dashmap::DashMap;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{FlowError, FlowResult};
use crate::events::{EmitContext, EventPayload, EventStreamer};
use crate::namespace;
use crate::types::{
    now_millis, summarize_value, BackpackDiff, BackpackSnapshot, Commit, CommitAction,
    ItemMetadata, ModifiedKey, PackOptions, PermissionEntry, StateItem,
};

/// Default maximum number of retained commits.
const DEFAULT_MAX_HISTORY: usize = 1000;

/// Identity stamped on writes that arrive without one (writes from outside
/// a node lifecycle).
const ANONYMOUS_WRITER: &str = "system";

/// Construction-time options for a [`Backpack`].
#[derive(Debug, Clone)]
pub struct BackpackConfig {
    /// Commits retained before FIFO eviction.
    pub max_history: usize,
    /// Master switch for permission evaluation. Off means every access is
    /// allowed regardless of registered entries.
    pub access_control: bool,
    /// When true, denied accesses raise [`FlowError::AccessDenied`];
    /// otherwise writes are dropped and reads come back absent.
    pub strict: bool,
    /// When true, `unpack` appends an unpack-commit and emits
    /// BACKPACK_UNPACK. Off by default; `peek` never logs.
    pub log_reads: bool,
}

impl Default for BackpackConfig {
    fn default() -> Self {
        Self {
            max_history: DEFAULT_MAX_HISTORY,
            access_control: true,
            strict: false,
            log_reads: false,
        }
    }
}

/// Counters exposed by [`Backpack::stats`].
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct BackpackStats {
    /// Current items.
    pub item_count: usize,
    /// Retained commits.
    pub commit_count: usize,
    /// Retained pack-commits.
    pub pack_commits: usize,
    /// Retained unpack-commits.
    pub unpack_commits: usize,
    /// Distinct non-empty source namespaces.
    pub namespace_count: usize,
}

/// The shared, traceable state store.
///
/// Cloning is intentionally not provided; share a store with
/// `Arc<Backpack>`. The flow orchestrator hands the same `Arc` to every
/// node it constructs, including nodes of nested composite flows.
#[derive(Debug)]
pub struct Backpack {
    config: BackpackConfig,
    items: DashMap<String, StateItem>,
    history: RwLock<VecDeque<Commit>>,
    permissions: DashMap<String, PermissionEntry>,
    events: RwLock<Option<Arc<EventStreamer>>>,
}

impl Default for Backpack {
    fn default() -> Self {
        Self::new()
    }
}

impl Backpack {
    /// A store with default configuration.
    pub fn new() -> Self {
        Self::with_config(BackpackConfig::default())
    }

    /// A store with explicit configuration.
    pub fn with_config(config: BackpackConfig) -> Self {
        Self {
            config,
            items: DashMap::new(),
            history: RwLock::new(VecDeque::new()),
            permissions: DashMap::new(),
            events: RwLock::new(None),
        }
    }

    /// Attach the event streamer that BACKPACK_* events are emitted to.
    pub fn set_event_streamer(&self, streamer: Arc<EventStreamer>) {
        *self.events.write().expect("events lock poisoned") = Some(streamer);
    }

    /// The store's configuration.
    pub fn config(&self) -> &BackpackConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Store a value, creating a new per-key version and a pack-commit.
    ///
    /// Provenance comes from `options`; the node runtime's store handle
    /// fills identity in for lifecycle writes. If a permission entry
    /// exists for the writing node and denies the write, the result is
    /// [`FlowError::AccessDenied`] under strict enforcement or `Ok(None)`
    /// (dropped, logged) otherwise.
    ///
    /// After a successful pack, the latest item's version equals the
    /// number of pack-commits targeting the key, and the newest history
    /// entry carries the written value.
    pub fn pack(
        &self,
        key: impl Into<String>,
        value: JsonValue,
        options: PackOptions,
    ) -> FlowResult<Option<StateItem>> {
        let key = key.into();
        let node_id = options
            .node_id
            .unwrap_or_else(|| ANONYMOUS_WRITER.to_string());
        let node_name = options.node_name.unwrap_or_else(|| node_id.clone());

        if !self.check_write(&node_id, &key, options.namespace.as_deref()) {
            if self.config.strict {
                return Err(FlowError::AccessDenied {
                    node_id,
                    key,
                    operation: "write",
                });
            }
            warn!(%node_id, %key, "write dropped by permission rules");
            return Ok(None);
        }

        let previous = self.items.get(&key).map(|item| item.clone());
        let version = previous
            .as_ref()
            .map(|item| item.metadata.version + 1)
            .unwrap_or(1);

        let metadata = ItemMetadata {
            source_node_id: node_id.clone(),
            source_node_name: node_name.clone(),
            source_namespace: options.namespace.clone(),
            timestamp: now_millis(),
            version,
            tags: options.tags,
        };
        let item = StateItem {
            key: key.clone(),
            value: value.clone(),
            metadata: metadata.clone(),
        };

        let commit = Commit {
            commit_id: Uuid::new_v4().to_string(),
            timestamp: metadata.timestamp,
            node_id,
            node_name,
            namespace: options.namespace,
            action: CommitAction::Pack,
            key: key.clone(),
            new_value: value,
            previous_value: previous.map(|item| item.value),
            value_summary: summarize_value(&item.value),
        };

        self.append_commit(commit.clone());
        self.items.insert(key, item.clone());
        debug!(key = %item.key, version, "packed");

        self.emit(
            EventPayload::BackpackPack {
                key: item.key.clone(),
                value_summary: commit.value_summary.clone(),
                metadata,
            },
            &commit,
        );

        Ok(Some(item))
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Read a value by key, honoring the reader's permission entry.
    ///
    /// Absent keys come back as `Ok(None)`. A denied read raises under
    /// strict enforcement and comes back absent otherwise.
    pub fn unpack(&self, key: &str, node_id: Option<&str>) -> FlowResult<Option<JsonValue>> {
        let item = match self.items.get(key) {
            Some(item) => item.clone(),
            None => return Ok(None),
        };

        if let Some(reader) = node_id {
            if !self.check_read(reader, key, item.metadata.source_namespace.as_deref()) {
                if self.config.strict {
                    return Err(FlowError::AccessDenied {
                        node_id: reader.to_string(),
                        key: key.to_string(),
                        operation: "read",
                    });
                }
                return Ok(None);
            }
        }

        if self.config.log_reads {
            let commit = Commit {
                commit_id: Uuid::new_v4().to_string(),
                timestamp: now_millis(),
                node_id: node_id.unwrap_or(ANONYMOUS_WRITER).to_string(),
                node_name: node_id.unwrap_or(ANONYMOUS_WRITER).to_string(),
                namespace: None,
                action: CommitAction::Unpack,
                key: key.to_string(),
                new_value: item.value.clone(),
                previous_value: None,
                value_summary: summarize_value(&item.value),
            };
            self.append_commit(commit.clone());
            self.emit(
                EventPayload::BackpackUnpack {
                    key: key.to_string(),
                },
                &commit,
            );
        }

        Ok(Some(item.value))
    }

    /// Read a value that must exist.
    pub fn unpack_required(&self, key: &str, node_id: Option<&str>) -> FlowResult<JsonValue> {
        self.unpack(key, node_id)?.ok_or_else(|| FlowError::KeyNotFound {
            key: key.to_string(),
            node_id: node_id.map(String::from),
        })
    }

    /// Diagnostic read: bypasses permissions and read logging.
    pub fn peek(&self, key: &str) -> Option<JsonValue> {
        self.items.get(key).map(|item| item.value.clone())
    }

    /// Every current key → value, bypassing permissions. This is the
    /// read-only inspection surface the UI polls.
    pub fn peek_all(&self) -> BTreeMap<String, JsonValue> {
        self.items
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().value.clone()))
            .collect()
    }

    /// Sorted list of current keys.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.items.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Values of all items whose source namespace matches a wildcard
    /// pattern, deep-copied, filtered by the reader's permissions.
    ///
    /// Items the reader cannot see are silently omitted; an unmatched or
    /// malformed pattern yields an empty map rather than an error.
    pub fn unpack_by_namespace(
        &self,
        pattern: &str,
        node_id: Option<&str>,
    ) -> BTreeMap<String, JsonValue> {
        self.matching_items(pattern, node_id)
            .into_iter()
            .map(|item| (item.key.clone(), item.value))
            .collect()
    }

    /// Full items (with metadata) whose source namespace matches a
    /// wildcard pattern, deep-copied and permission-filtered, ordered by
    /// key.
    pub fn get_items_by_namespace(&self, pattern: &str, node_id: Option<&str>) -> Vec<StateItem> {
        self.matching_items(pattern, node_id)
    }

    fn matching_items(&self, pattern: &str, node_id: Option<&str>) -> Vec<StateItem> {
        let mut items: Vec<StateItem> = self
            .items
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .metadata
                    .source_namespace
                    .as_deref()
                    .is_some_and(|ns| namespace::pattern_matches(pattern, ns))
            })
            .filter(|entry| match node_id {
                Some(reader) => self.check_read(
                    reader,
                    entry.key(),
                    entry.value().metadata.source_namespace.as_deref(),
                ),
                None => true,
            })
            .map(|entry| entry.value().clone())
            .collect();
        items.sort_by(|a, b| a.key.cmp(&b.key));
        items
    }

    /// Sorted, deduplicated list of non-empty source namespaces present.
    pub fn get_namespaces(&self) -> Vec<String> {
        let mut namespaces: Vec<String> = self
            .items
            .iter()
            .filter_map(|entry| entry.value().metadata.source_namespace.clone())
            .filter(|ns| !ns.is_empty())
            .collect();
        namespaces.sort();
        namespaces.dedup();
        namespaces
    }

    // ------------------------------------------------------------------
    // History & snapshots
    // ------------------------------------------------------------------

    fn append_commit(&self, commit: Commit) {
        let mut history = self.history.write().expect("history lock poisoned");
        history.push_back(commit);
        while history.len() > self.config.max_history {
            history.pop_front();
        }
    }

    /// All retained commits, newest first. Defensive copy.
    pub fn get_history(&self) -> Vec<Commit> {
        self.history
            .read()
            .expect("history lock poisoned")
            .iter()
            .rev()
            .cloned()
            .collect()
    }

    /// Retained commits for one key, newest first.
    pub fn get_key_history(&self, key: &str) -> Vec<Commit> {
        self.history
            .read()
            .expect("history lock poisoned")
            .iter()
            .rev()
            .filter(|commit| commit.key == key)
            .cloned()
            .collect()
    }

    /// Retained commits for one node id, newest first. This is the
    /// history endpoint's node filter.
    pub fn get_node_history(&self, node_id: &str) -> Vec<Commit> {
        self.history
            .read()
            .expect("history lock poisoned")
            .iter()
            .rev()
            .filter(|commit| commit.node_id == node_id)
            .cloned()
            .collect()
    }

    /// Reconstruct the store as of a commit, inclusive.
    ///
    /// Replays every retained pack-commit up to and including `commit_id`
    /// in chronological order into a fresh store with empty history. A
    /// commit that is unknown — or was evicted by the history bound —
    /// raises [`FlowError::InvalidCommit`].
    pub fn get_snapshot_at_commit(&self, commit_id: &str) -> FlowResult<Backpack> {
        let history = self.history.read().expect("history lock poisoned");
        let position = history
            .iter()
            .position(|commit| commit.commit_id == commit_id)
            .ok_or_else(|| FlowError::InvalidCommit {
                commit_id: commit_id.to_string(),
            })?;
        Ok(Self::replay(history.iter().take(position + 1)))
    }

    /// Reconstruct the store immediately before a node's first commit.
    ///
    /// Returns `Ok(None)` when the node never wrote. A node whose first
    /// commit opens the retained history yields an empty store.
    pub fn get_snapshot_before_node(&self, node_id: &str) -> FlowResult<Option<Backpack>> {
        let history = self.history.read().expect("history lock poisoned");
        let position = match history.iter().position(|commit| commit.node_id == node_id) {
            Some(position) => position,
            None => return Ok(None),
        };
        Ok(Some(Self::replay(history.iter().take(position))))
    }

    fn replay<'a>(commits: impl Iterator<Item = &'a Commit>) -> Backpack {
        let snapshot = Backpack::new();
        let mut versions: HashMap<String, u64> = HashMap::new();
        for commit in commits.filter(|c| c.action == CommitAction::Pack) {
            let version = versions
                .entry(commit.key.clone())
                .and_modify(|v| *v += 1)
                .or_insert(1);
            snapshot.items.insert(
                commit.key.clone(),
                StateItem {
                    key: commit.key.clone(),
                    value: commit.new_value.clone(),
                    metadata: ItemMetadata {
                        source_node_id: commit.node_id.clone(),
                        source_node_name: commit.node_name.clone(),
                        source_namespace: commit.namespace.clone(),
                        timestamp: commit.timestamp,
                        version: *version,
                        tags: None,
                    },
                },
            );
        }
        snapshot
    }

    /// Structural difference between the current item sets of two stores.
    ///
    /// `added` holds keys only in `b`, `removed` keys only in `a`,
    /// `modified` keys present in both with different values. All lists
    /// are sorted by key.
    pub fn diff(a: &Backpack, b: &Backpack) -> BackpackDiff {
        let mut result = BackpackDiff::default();
        for entry in b.items.iter() {
            match a.items.get(entry.key()) {
                None => result.added.push(entry.key().clone()),
                Some(old) if old.value != entry.value().value => {
                    result.modified.push(ModifiedKey {
                        key: entry.key().clone(),
                        old_value: old.value.clone(),
                        new_value: entry.value().value.clone(),
                    });
                }
                Some(_) => {}
            }
        }
        for entry in a.items.iter() {
            if !b.items.contains_key(entry.key()) {
                result.removed.push(entry.key().clone());
            }
        }
        result.added.sort();
        result.removed.sort();
        result.modified.sort_by(|x, y| x.key.cmp(&y.key));
        result
    }

    // ------------------------------------------------------------------
    // Serialization
    // ------------------------------------------------------------------

    /// A serializable image of items, history, and permissions.
    pub fn snapshot(&self) -> BackpackSnapshot {
        let mut items: Vec<(String, StateItem)> = self
            .items
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        items.sort_by(|a, b| a.0.cmp(&b.0));
        BackpackSnapshot {
            items,
            history: self
                .history
                .read()
                .expect("history lock poisoned")
                .iter()
                .cloned()
                .collect(),
            permissions: self
                .permissions
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect(),
            timestamp: now_millis(),
            commit_id: None,
        }
    }

    /// Serialize the full store to a JSON document.
    pub fn to_json(&self) -> FlowResult<JsonValue> {
        Ok(serde_json::to_value(self.snapshot())?)
    }

    /// Restore a store from a snapshot document produced by [`to_json`].
    ///
    /// [`to_json`]: Backpack::to_json
    pub fn from_json(document: &JsonValue) -> FlowResult<Backpack> {
        let snapshot: BackpackSnapshot = serde_json::from_value(document.clone())?;
        Ok(Self::from_snapshot(snapshot))
    }

    /// Restore a store from a snapshot, preserving items, history, and
    /// the permission table.
    pub fn from_snapshot(snapshot: BackpackSnapshot) -> Backpack {
        let store = Backpack::new();
        for (key, item) in snapshot.items {
            store.items.insert(key, item);
        }
        *store.history.write().expect("history lock poisoned") =
            snapshot.history.into_iter().collect();
        for (node_id, entry) in snapshot.permissions {
            store.permissions.insert(node_id, entry);
        }
        store
    }

    // ------------------------------------------------------------------
    // Permissions
    // ------------------------------------------------------------------

    /// Register (or replace) the permission entry for a node id.
    pub fn register_permissions(&self, node_id: impl Into<String>, entry: PermissionEntry) {
        self.permissions.insert(node_id.into(), entry);
    }

    /// Remove the permission entry for a node id, restoring unrestricted
    /// access for it.
    pub fn clear_permissions(&self, node_id: &str) {
        self.permissions.remove(node_id);
    }

    fn check_read(&self, node_id: &str, key: &str, source_namespace: Option<&str>) -> bool {
        self.check_access(node_id, key, source_namespace, AccessKind::Read)
    }

    fn check_write(&self, node_id: &str, key: &str, target_namespace: Option<&str>) -> bool {
        self.check_access(node_id, key, target_namespace, AccessKind::Write)
    }

    fn check_access(
        &self,
        node_id: &str,
        key: &str,
        target_namespace: Option<&str>,
        kind: AccessKind,
    ) -> bool {
        if !self.config.access_control {
            return true;
        }
        let entry = match self.permissions.get(node_id) {
            Some(entry) => entry,
            None => return true,
        };
        // Deny always wins, before any allow rule is consulted.
        if entry.deny.iter().any(|denied| denied == key) {
            return false;
        }
        let (keys, patterns) = match kind {
            AccessKind::Read => (&entry.read, &entry.namespace_read),
            AccessKind::Write => (&entry.write, &entry.namespace_write),
        };
        if keys.iter().any(|allowed| allowed == key) {
            return true;
        }
        if let Some(ns) = target_namespace {
            if patterns
                .iter()
                .any(|pattern| namespace::pattern_matches(pattern, ns))
            {
                return true;
            }
        }
        false
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Remove every item. History and permissions are untouched; commits
    /// remain the only record of what was stored.
    pub fn clear(&self) {
        self.items.clear();
    }

    /// Number of current items.
    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    /// Whether the store holds no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Store-wide counters.
    pub fn stats(&self) -> BackpackStats {
        let history = self.history.read().expect("history lock poisoned");
        let pack_commits = history
            .iter()
            .filter(|c| c.action == CommitAction::Pack)
            .count();
        let unpack_commits = history
            .iter()
            .filter(|c| c.action == CommitAction::Unpack)
            .count();
        BackpackStats {
            item_count: self.items.len(),
            commit_count: history.len(),
            pack_commits,
            unpack_commits,
            namespace_count: self.get_namespaces().len(),
        }
    }

    fn emit(&self, payload: EventPayload, commit: &Commit) {
        let events = self.events.read().expect("events lock poisoned");
        if let Some(streamer) = events.as_ref() {
            streamer.emit(
                payload,
                EmitContext {
                    source_node: commit.node_name.clone(),
                    node_id: commit.node_id.clone(),
                    namespace: commit.namespace.clone(),
                    run_id: None,
                },
            );
        }
    }
}

#[derive(Clone, Copy)]
enum AccessKind {
    Read,
    Write,
}
