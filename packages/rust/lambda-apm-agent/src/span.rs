//! Span and span context types.
//!
//! A [`Span`] records one logical operation: an immutable identity fixed at
//! creation (ids, names, start time) and a mutable recording state (tags,
//! logs, finish time) guarded by a mutex so listeners running on other worker
//! threads observe a consistent view. Handles are `Arc<Span>`; anyone holding
//! a handle may tag, log, or finish the span.
//!
//! Finishing is idempotent. The first `finish` call stamps the finish time,
//! notifies the owning tracer exactly once, and every later call changes
//! nothing. Finish times are clamped so `finish_time >= start_time` holds
//! even when the wall clock regresses.

use crate::constants::tags;
use crate::tag::TagValue;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use uuid::Uuid;

/// Current wall-clock time as epoch milliseconds, the unit used on the wire.
pub(crate) fn epoch_millis_now() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Immutable identity of a span within its trace.
///
/// `trace_id` groups everything from one end-to-end request, `transaction_id`
/// everything from one invocation. A missing `parent_span_id` marks a root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanContext {
    trace_id: Uuid,
    transaction_id: Uuid,
    span_id: Uuid,
    parent_span_id: Option<Uuid>,
}

impl SpanContext {
    /// Context for a root span of the given trace and transaction.
    pub fn root(trace_id: Uuid, transaction_id: Uuid) -> Self {
        Self {
            trace_id,
            transaction_id,
            span_id: Uuid::new_v4(),
            parent_span_id: None,
        }
    }

    /// Context for a child of `parent`, inheriting trace and transaction ids.
    pub fn child_of(parent: &SpanContext) -> Self {
        Self {
            trace_id: parent.trace_id,
            transaction_id: parent.transaction_id,
            span_id: Uuid::new_v4(),
            parent_span_id: Some(parent.span_id),
        }
    }

    pub fn trace_id(&self) -> Uuid {
        self.trace_id
    }

    pub fn transaction_id(&self) -> Uuid {
        self.transaction_id
    }

    pub fn span_id(&self) -> Uuid {
        self.span_id
    }

    pub fn parent_span_id(&self) -> Option<Uuid> {
        self.parent_span_id
    }
}

/// A timestamped set of fields attached to a span via [`Span::log`].
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpanLog {
    pub timestamp: u64,
    pub fields: HashMap<String, TagValue>,
}

#[derive(Debug, Default)]
struct SpanState {
    finish_time: Option<u64>,
    tags: HashMap<String, TagValue>,
    logs: Vec<SpanLog>,
}

/// Receiver for first-finish notifications. Implemented by the tracer so the
/// recorder and the listener pipeline see every finish exactly once.
pub(crate) trait SpanSink: Send + Sync {
    fn span_finished(&self, span: &Arc<Span>);
}

/// One recorded operation.
pub struct Span {
    context: SpanContext,
    operation_name: String,
    class_name: String,
    domain_name: String,
    start_time: u64,
    state: Mutex<SpanState>,
    sink: Weak<dyn SpanSink>,
}

impl std::fmt::Debug for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Span")
            .field("context", &self.context)
            .field("operation_name", &self.operation_name)
            .field("class_name", &self.class_name)
            .field("domain_name", &self.domain_name)
            .field("start_time", &self.start_time)
            .field("finish_time", &self.finish_time())
            .finish()
    }
}

impl Span {
    pub(crate) fn new(
        context: SpanContext,
        operation_name: impl Into<String>,
        class_name: impl Into<String>,
        domain_name: impl Into<String>,
        start_time: u64,
        sink: Weak<dyn SpanSink>,
    ) -> Self {
        Self {
            context,
            operation_name: operation_name.into(),
            class_name: class_name.into(),
            domain_name: domain_name.into(),
            start_time,
            state: Mutex::new(SpanState::default()),
            sink,
        }
    }

    pub fn context(&self) -> &SpanContext {
        &self.context
    }

    pub fn operation_name(&self) -> &str {
        &self.operation_name
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn domain_name(&self) -> &str {
        &self.domain_name
    }

    /// Start time in epoch milliseconds.
    pub fn start_time(&self) -> u64 {
        self.start_time
    }

    /// Finish time in epoch milliseconds, once finished.
    pub fn finish_time(&self) -> Option<u64> {
        self.state.lock().ok().and_then(|s| s.finish_time)
    }

    /// Wall-clock duration in milliseconds, once finished.
    pub fn duration(&self) -> Option<u64> {
        self.finish_time().map(|f| f.saturating_sub(self.start_time))
    }

    pub fn is_finished(&self) -> bool {
        self.finish_time().is_some()
    }

    /// Set a tag, replacing any previous value under the same key.
    ///
    /// Tags stay mutable after finish; the value that ends up on the wire is
    /// whatever the map holds when the report is assembled.
    pub fn set_tag(&self, key: impl Into<String>, value: impl Into<TagValue>) {
        if let Ok(mut state) = self.state.lock() {
            state.tags.insert(key.into(), value.into());
        }
    }

    /// Current value of a tag, if set.
    pub fn get_tag(&self, key: &str) -> Option<TagValue> {
        self.state.lock().ok().and_then(|s| s.tags.get(key).cloned())
    }

    /// Snapshot of all tags.
    pub fn tags(&self) -> HashMap<String, TagValue> {
        self.state
            .lock()
            .map(|s| s.tags.clone())
            .unwrap_or_default()
    }

    /// Mark this span erroneous with the standard error tag keys.
    pub fn set_error_tags(&self, kind: &str, message: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.tags.insert(tags::ERROR.to_string(), true.into());
            state.tags.insert(tags::ERROR_KIND.to_string(), kind.into());
            state
                .tags
                .insert(tags::ERROR_MESSAGE.to_string(), message.into());
        }
    }

    /// Whether the error tag is set.
    pub fn is_erroneous(&self) -> bool {
        self.get_tag(tags::ERROR).and_then(|v| v.as_bool()) == Some(true)
    }

    /// Attach a timestamped log record to this span.
    pub fn log<K, V, I>(&self, fields: I)
    where
        K: Into<String>,
        V: Into<TagValue>,
        I: IntoIterator<Item = (K, V)>,
    {
        let record = SpanLog {
            timestamp: epoch_millis_now(),
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        };
        if let Ok(mut state) = self.state.lock() {
            state.logs.push(record);
        }
    }

    /// Snapshot of the span's log records.
    pub fn logs(&self) -> Vec<SpanLog> {
        self.state
            .lock()
            .map(|s| s.logs.clone())
            .unwrap_or_default()
    }

    /// Finish the span now. The first call wins; later calls are no-ops.
    pub fn finish(self: &Arc<Self>) {
        self.finish_at(epoch_millis_now());
    }

    /// Finish the span at an explicit epoch-millisecond timestamp.
    ///
    /// Timestamps earlier than the start time are clamped to it.
    pub fn finish_at(self: &Arc<Self>, timestamp: u64) {
        {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            if state.finish_time.is_some() {
                return;
            }
            state.finish_time = Some(timestamp.max(self.start_time));
        }
        if let Some(sink) = self.sink.upgrade() {
            sink.span_finished(self);
        }
    }
}
