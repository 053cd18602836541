/// Typed event fan-out for flow lifecycle telemetry.
///
/// This module provides the publish-subscribe surface of the framework.
/// Every lifecycle transition (node start, phase completion, errors) and
/// every store write produces a [`FlowEvent`] envelope with a tagged,
/// fully-typed payload. Subscribers register handlers with an optional
/// [`EventFilter`]; delivery is synchronous and in registration order, and
/// a bounded ring buffer keeps recent events for late-joining consumers
/// (the UI polls it).
///
/// Handler failures are isolated: a handler returning an error is logged
/// and never breaks the emitter or other handlers.
///
/// # Example
///
/// ```ignore
/// let streamer = EventStreamer::new();
/// streamer.on_type(FlowEventType::NodeEnd, |event| {
///     println!("finished: {}", event.node_id);
///     Ok(())
/// });
/// ```
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::warn;
use uuid::Uuid;

use crate::namespace;
use crate::types::ItemMetadata;

/// Default capacity of the event history ring buffer.
const DEFAULT_EVENT_HISTORY: usize = 1000;

/// The ten event types the framework emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowEventType {
    /// A node lifecycle began.
    NodeStart,
    /// The prep phase returned.
    PrepComplete,
    /// The exec phase returned.
    ExecComplete,
    /// The lifecycle finished and produced an action.
    NodeEnd,
    /// A lifecycle phase raised.
    Error,
    /// The store accepted a write.
    BackpackPack,
    /// The store served a logged read (opt-in).
    BackpackUnpack,
    /// A streaming producer pushed a chunk.
    StreamChunk,
    /// A node invoked an external tool.
    ToolCall,
    /// User-defined.
    Custom,
}

impl std::fmt::Display for FlowEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FlowEventType::NodeStart => "NODE_START",
            FlowEventType::PrepComplete => "PREP_COMPLETE",
            FlowEventType::ExecComplete => "EXEC_COMPLETE",
            FlowEventType::NodeEnd => "NODE_END",
            FlowEventType::Error => "ERROR",
            FlowEventType::BackpackPack => "BACKPACK_PACK",
            FlowEventType::BackpackUnpack => "BACKPACK_UNPACK",
            FlowEventType::StreamChunk => "STREAM_CHUNK",
            FlowEventType::ToolCall => "TOOL_CALL",
            FlowEventType::Custom => "CUSTOM",
        };
        write!(f, "{name}")
    }
}

/// The lifecycle phase an error is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecyclePhase {
    /// Input validation or the prep phase.
    Prep,
    /// The exec phase.
    Exec,
    /// The post phase.
    Post,
}

/// Type-specific event content, adjacently tagged so the envelope
/// serializes as `{ ..., "type": "NODE_START", "payload": { ... } }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum EventPayload {
    /// Lifecycle began; carries the node's params and a state snapshot.
    NodeStart {
        /// The node's configuration params.
        params: JsonValue,
        /// Current store contents, key → value.
        backpack_snapshot: JsonValue,
    },
    /// Prep returned.
    PrepComplete {
        /// What prep produced.
        prep_result: JsonValue,
        /// Keys read so far in this lifecycle.
        reads: Vec<String>,
    },
    /// Exec returned.
    ExecComplete {
        /// What exec produced.
        exec_result: JsonValue,
        /// Execution attempts (always 1; no internal retry).
        attempts: u32,
        /// Wall time of exec.
        duration_ms: u64,
    },
    /// The lifecycle finished.
    NodeEnd {
        /// The routing action, absent when the node ends the flow.
        action: Option<String>,
        /// Keys written during the lifecycle.
        writes: Vec<String>,
        /// Wall time of the whole lifecycle.
        total_duration_ms: u64,
    },
    /// A phase raised.
    Error {
        /// Which phase failed.
        phase: LifecyclePhase,
        /// The error message.
        message: String,
        /// Backtrace text, when available.
        stack: Option<String>,
        /// Store contents at the moment of failure.
        backpack_state: JsonValue,
    },
    /// The store accepted a write.
    BackpackPack {
        /// The written key.
        key: String,
        /// Truncated display summary of the value.
        value_summary: String,
        /// Provenance stamped into the item.
        metadata: ItemMetadata,
    },
    /// The store served a logged read.
    BackpackUnpack {
        /// The read key.
        key: String,
    },
    /// A streaming producer pushed a chunk.
    StreamChunk {
        /// Chunk content.
        content: String,
    },
    /// A node invoked an external tool.
    ToolCall {
        /// Tool name.
        tool: String,
        /// Tool arguments.
        arguments: JsonValue,
    },
    /// User-defined payload.
    Custom {
        /// Arbitrary data.
        data: JsonValue,
    },
}

impl EventPayload {
    /// The event type this payload belongs to.
    pub fn event_type(&self) -> FlowEventType {
        match self {
            EventPayload::NodeStart { .. } => FlowEventType::NodeStart,
            EventPayload::PrepComplete { .. } => FlowEventType::PrepComplete,
            EventPayload::ExecComplete { .. } => FlowEventType::ExecComplete,
            EventPayload::NodeEnd { .. } => FlowEventType::NodeEnd,
            EventPayload::Error { .. } => FlowEventType::Error,
            EventPayload::BackpackPack { .. } => FlowEventType::BackpackPack,
            EventPayload::BackpackUnpack { .. } => FlowEventType::BackpackUnpack,
            EventPayload::StreamChunk { .. } => FlowEventType::StreamChunk,
            EventPayload::ToolCall { .. } => FlowEventType::ToolCall,
            EventPayload::Custom { .. } => FlowEventType::Custom,
        }
    }
}

/// A delivered event: identity, origin, correlation, and typed payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowEvent {
    /// Unique event id.
    pub id: String,
    /// Emission time, milliseconds since epoch.
    pub timestamp: i64,
    /// Name of the originating node.
    pub source_node: String,
    /// Id of the originating node.
    pub node_id: String,
    /// Namespace of the originating node, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Correlation id for one end-to-end flow execution.
    pub run_id: String,
    /// The typed content.
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl FlowEvent {
    /// The event's type tag.
    pub fn event_type(&self) -> FlowEventType {
        self.payload.event_type()
    }
}

/// Origin fields for an emission; anything left unset falls back to the
/// streamer's current run.
#[derive(Debug, Clone, Default)]
pub struct EmitContext {
    /// Name of the originating node.
    pub source_node: String,
    /// Id of the originating node.
    pub node_id: String,
    /// Namespace of the originating node.
    pub namespace: Option<String>,
    /// Correlation id; defaults to the streamer's current run.
    pub run_id: Option<String>,
}

impl EmitContext {
    /// Context for a node identity.
    pub fn for_node(
        node_id: impl Into<String>,
        source_node: impl Into<String>,
        namespace: Option<String>,
    ) -> Self {
        Self {
            source_node: source_node.into(),
            node_id: node_id.into(),
            namespace,
            run_id: None,
        }
    }
}

/// Predicate over events used by subscriptions and history queries.
///
/// All set fields must match. The namespace field is a wildcard pattern
/// with the same semantics as state-store queries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    /// Match a specific node id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    /// Match namespaces against this wildcard pattern.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Match any of these event types.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub types: Option<Vec<FlowEventType>>,
    /// Match a specific run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

impl EventFilter {
    /// A filter that matches every event.
    pub fn all() -> Self {
        Self::default()
    }

    /// Match only the given type.
    pub fn of_type(event_type: FlowEventType) -> Self {
        Self {
            types: Some(vec![event_type]),
            ..Self::default()
        }
    }

    /// Restrict to a node id.
    pub fn for_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    /// Restrict to namespaces matching a wildcard pattern.
    pub fn for_namespace(mut self, pattern: impl Into<String>) -> Self {
        self.namespace = Some(pattern.into());
        self
    }

    /// Restrict to a set of types.
    pub fn with_types<I>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = FlowEventType>,
    {
        self.types = Some(types.into_iter().collect());
        self
    }

    /// Restrict to a run id.
    pub fn for_run(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Whether an event passes this filter.
    pub fn matches(&self, event: &FlowEvent) -> bool {
        if let Some(node_id) = &self.node_id {
            if &event.node_id != node_id {
                return false;
            }
        }
        if let Some(pattern) = &self.namespace {
            match &event.namespace {
                Some(ns) => {
                    if !namespace::pattern_matches(pattern, ns) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        if let Some(types) = &self.types {
            if !types.contains(&event.event_type()) {
                return false;
            }
        }
        if let Some(run_id) = &self.run_id {
            if &event.run_id != run_id {
                return false;
            }
        }
        true
    }
}

/// Identifier returned by `on`, usable to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type EventHandler = dyn Fn(&FlowEvent) -> anyhow::Result<()> + Send + Sync;

struct HandlerEntry {
    id: HandlerId,
    filter: EventFilter,
    handler: Box<EventHandler>,
}

/// Counters exposed by [`EventStreamer::get_stats`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamerStats {
    /// Events emitted since construction.
    pub total_emitted: u64,
    /// Events currently retained in history.
    pub history_len: usize,
    /// Events evicted from the bounded history.
    pub dropped_from_history: u64,
    /// Registered handlers.
    pub handler_count: usize,
    /// Emission counts per event type.
    pub by_type: BTreeMap<String, u64>,
}

/// In-process, single-threaded event fan-out with bounded history.
///
/// Shared by every node in a flow tree (composite flows inherit the same
/// instance). Delivery is synchronous: handlers registered before an
/// `emit` observe the event before `emit` returns; [`EventStreamer::
/// emit_yielding`] additionally yields to the scheduler between handlers.
pub struct EventStreamer {
    max_history: usize,
    handlers: RwLock<Vec<Arc<HandlerEntry>>>,
    history: RwLock<VecDeque<FlowEvent>>,
    by_type: RwLock<BTreeMap<FlowEventType, u64>>,
    total_emitted: AtomicU64,
    dropped_from_history: AtomicU64,
    next_handler_id: AtomicU64,
    current_run: RwLock<Option<String>>,
}

impl Default for EventStreamer {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStreamer {
    /// A streamer with the default history capacity.
    pub fn new() -> Self {
        Self::with_history_capacity(DEFAULT_EVENT_HISTORY)
    }

    /// A streamer retaining at most `capacity` events.
    pub fn with_history_capacity(capacity: usize) -> Self {
        Self {
            max_history: capacity,
            handlers: RwLock::new(Vec::new()),
            history: RwLock::new(VecDeque::new()),
            by_type: RwLock::new(BTreeMap::new()),
            total_emitted: AtomicU64::new(0),
            dropped_from_history: AtomicU64::new(0),
            next_handler_id: AtomicU64::new(1),
            current_run: RwLock::new(None),
        }
    }

    /// Set the run id stamped onto events whose context carries none.
    pub fn set_current_run(&self, run_id: Option<String>) {
        *self.current_run.write().expect("run lock poisoned") = run_id;
    }

    /// The run id currently stamped onto context-less events.
    pub fn current_run(&self) -> Option<String> {
        self.current_run.read().expect("run lock poisoned").clone()
    }

    /// Subscribe a handler with a filter. Handlers run in registration
    /// order; a failing handler is logged and skipped.
    pub fn on<F>(&self, filter: EventFilter, handler: F) -> HandlerId
    where
        F: Fn(&FlowEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_handler_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .expect("handler lock poisoned")
            .push(Arc::new(HandlerEntry {
                id,
                filter,
                handler: Box::new(handler),
            }));
        id
    }

    /// Subscribe to a single event type.
    pub fn on_type<F>(&self, event_type: FlowEventType, handler: F) -> HandlerId
    where
        F: Fn(&FlowEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on(EventFilter::of_type(event_type), handler)
    }

    /// Remove a handler. Unknown ids are ignored.
    pub fn off(&self, id: HandlerId) {
        self.handlers
            .write()
            .expect("handler lock poisoned")
            .retain(|entry| entry.id != id);
    }

    /// Emit an event, delivering synchronously to every matching handler
    /// in registration order. Returns the envelope.
    pub fn emit(&self, payload: EventPayload, context: EmitContext) -> FlowEvent {
        let event = self.record(payload, context);
        for entry in self.matching_handlers(&event) {
            if let Err(error) = (entry.handler)(&event) {
                warn!(event_type = %event.event_type(), %error, "event handler failed");
            }
        }
        event
    }

    /// Emit an event, yielding to the scheduler between handlers.
    pub async fn emit_yielding(&self, payload: EventPayload, context: EmitContext) -> FlowEvent {
        let event = self.record(payload, context);
        for entry in self.matching_handlers(&event) {
            if let Err(error) = (entry.handler)(&event) {
                warn!(event_type = %event.event_type(), %error, "event handler failed");
            }
            tokio::task::yield_now().await;
        }
        event
    }

    fn record(&self, payload: EventPayload, context: EmitContext) -> FlowEvent {
        let run_id = context
            .run_id
            .or_else(|| self.current_run.read().expect("run lock poisoned").clone())
            .unwrap_or_else(|| "detached".to_string());
        let event = FlowEvent {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now().timestamp_millis(),
            source_node: context.source_node,
            node_id: context.node_id,
            namespace: context.namespace,
            run_id,
            payload,
        };

        self.total_emitted.fetch_add(1, Ordering::Relaxed);
        *self
            .by_type
            .write()
            .expect("counter lock poisoned")
            .entry(event.event_type())
            .or_insert(0) += 1;

        let mut history = self.history.write().expect("history lock poisoned");
        history.push_back(event.clone());
        while history.len() > self.max_history {
            history.pop_front();
            self.dropped_from_history.fetch_add(1, Ordering::Relaxed);
        }

        event
    }

    fn matching_handlers(&self, event: &FlowEvent) -> Vec<Arc<HandlerEntry>> {
        // Snapshot under the lock, invoke outside it, so handlers may
        // subscribe or unsubscribe reentrantly.
        self.handlers
            .read()
            .expect("handler lock poisoned")
            .iter()
            .filter(|entry| entry.filter.matches(event))
            .cloned()
            .collect()
    }

    /// Retained events, oldest first, optionally filtered.
    pub fn get_history(&self, filter: Option<&EventFilter>) -> Vec<FlowEvent> {
        let history = self.history.read().expect("history lock poisoned");
        match filter {
            Some(filter) => history.iter().filter(|e| filter.matches(e)).cloned().collect(),
            None => history.iter().cloned().collect(),
        }
    }

    /// Emission and retention counters.
    pub fn get_stats(&self) -> StreamerStats {
        let by_type = self
            .by_type
            .read()
            .expect("counter lock poisoned")
            .iter()
            .map(|(t, n)| (t.to_string(), *n))
            .collect();
        StreamerStats {
            total_emitted: self.total_emitted.load(Ordering::Relaxed),
            history_len: self.history.read().expect("history lock poisoned").len(),
            dropped_from_history: self.dropped_from_history.load(Ordering::Relaxed),
            handler_count: self.handlers.read().expect("handler lock poisoned").len(),
            by_type,
        }
    }
}

impl std::fmt::Debug for EventStreamer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStreamer")
            .field("max_history", &self.max_history)
            .field("total_emitted", &self.total_emitted.load(Ordering::Relaxed))
            .finish()
    }
}
