//! Per-invocation execution context.
//!
//! An [`ExecutionContext`] is the unit of isolation: one is created for each
//! invocation, owns that invocation's [`Tracer`] (and through it the span
//! store), accumulates the reports produced by the plugins, and carries the
//! `reported` gate that makes completion exactly-once. Whichever completion
//! path wins the [`ExecutionContext::mark_reported`] race (handler return,
//! legacy completion handle, or the timeout guard) is the only one that
//! reports; every later completion turns into a no-op.
//!
//! Code that cannot be handed a context explicitly resolves the causally
//! owning one through [`ExecutionContextManager`](crate::context_manager::ExecutionContextManager).

use crate::error::{AgentError, BoxError};
use crate::listener::SpanListenerRegistry;
use crate::report::Report;
use crate::span::{epoch_millis_now, Span};
use crate::tag::TagValue;
use crate::tracer::Tracer;
use bon::Builder;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use uuid::Uuid;

/// Host-provided metadata about one invocation.
#[derive(Builder, Debug, Clone, Default)]
pub struct InvocationRequest {
    /// Logical name of the handled function or endpoint.
    pub function_name: Option<String>,

    /// Host-assigned correlation id for this request.
    pub request_id: Option<String>,

    /// Wall-clock budget remaining at invocation start. When present, the
    /// timeout guard fires once the budget less the configured margin has
    /// elapsed, so reports leave before the host kills the process.
    pub remaining_time: Option<Duration>,
}

/// Error summary recorded on a context and reported to the collector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub error_type: String,
    pub error_message: String,
}

impl ErrorInfo {
    pub fn new(error_type: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            error_message: error_message.into(),
        }
    }
}

impl From<&AgentError> for ErrorInfo {
    fn from(error: &AgentError) -> Self {
        Self::new(error.error_type(), error.to_string())
    }
}

impl From<&BoxError> for ErrorInfo {
    fn from(error: &BoxError) -> Self {
        Self::new("Error", error.to_string())
    }
}

/// One log record captured during an invocation.
#[derive(Debug, Clone)]
pub struct CapturedLog {
    pub timestamp: u64,
    pub level: String,
    pub source: String,
    pub message: String,
    /// Span active when the record was captured, if any.
    pub span_id: Option<Uuid>,
}

#[derive(Debug, Default)]
struct ContextState {
    finish_timestamp: Option<u64>,
    root_span: Option<Arc<Span>>,
    response: Option<serde_json::Value>,
    error: Option<ErrorInfo>,
    reports: Vec<Report>,
    user_tags: HashMap<String, TagValue>,
    captured_logs: Vec<CapturedLog>,
}

/// State for one invocation, shared across its causal chain.
pub struct ExecutionContext {
    trace_id: Uuid,
    transaction_id: Uuid,
    tracer: Tracer,
    invocation: InvocationRequest,
    timeout_margin: Duration,
    start_timestamp: u64,
    cold_start: bool,
    reported: AtomicBool,
    timed_out: AtomicBool,
    state: Mutex<ContextState>,
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("trace_id", &self.trace_id)
            .field("transaction_id", &self.transaction_id)
            .field("start_timestamp", &self.start_timestamp)
            .field("reported", &self.is_reported())
            .finish()
    }
}

static EMPTY_CONTEXT: OnceLock<Arc<ExecutionContext>> = OnceLock::new();

impl ExecutionContext {
    pub fn new(
        listeners: Arc<SpanListenerRegistry>,
        invocation: InvocationRequest,
        timeout_margin: Duration,
        cold_start: bool,
    ) -> Arc<Self> {
        let trace_id = Uuid::new_v4();
        let transaction_id = Uuid::new_v4();
        Arc::new(Self {
            trace_id,
            transaction_id,
            tracer: Tracer::new(trace_id, transaction_id, listeners),
            invocation,
            timeout_margin,
            start_timestamp: epoch_millis_now(),
            cold_start,
            reported: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
            state: Mutex::new(ContextState::default()),
        })
    }

    /// The process-wide sentinel returned to code that no invocation owns.
    ///
    /// Spans started against it are recorded nowhere durable and it can never
    /// be reported, so stray instrumentation stays harmless.
    pub fn empty() -> Arc<Self> {
        EMPTY_CONTEXT
            .get_or_init(|| {
                Arc::new(Self {
                    trace_id: Uuid::nil(),
                    transaction_id: Uuid::nil(),
                    tracer: Tracer::new(
                        Uuid::nil(),
                        Uuid::nil(),
                        Arc::new(SpanListenerRegistry::new()),
                    ),
                    invocation: InvocationRequest::default(),
                    timeout_margin: Duration::ZERO,
                    start_timestamp: 0,
                    cold_start: false,
                    // Permanently reported: the sentinel must never win a
                    // completion race.
                    reported: AtomicBool::new(true),
                    timed_out: AtomicBool::new(false),
                    state: Mutex::new(ContextState::default()),
                })
            })
            .clone()
    }

    /// Whether this is the sentinel context.
    pub fn is_sentinel(&self) -> bool {
        self.transaction_id.is_nil()
    }

    pub fn trace_id(&self) -> Uuid {
        self.trace_id
    }

    pub fn transaction_id(&self) -> Uuid {
        self.transaction_id
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    pub fn invocation(&self) -> &InvocationRequest {
        &self.invocation
    }

    pub fn timeout_margin(&self) -> Duration {
        self.timeout_margin
    }

    pub fn start_timestamp(&self) -> u64 {
        self.start_timestamp
    }

    pub fn cold_start(&self) -> bool {
        self.cold_start
    }

    /// Claim the right to report this context. Returns true for exactly one
    /// caller over the context's lifetime.
    pub fn mark_reported(&self) -> bool {
        self.reported
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_reported(&self) -> bool {
        self.reported.load(Ordering::Acquire)
    }

    pub(crate) fn mark_timed_out(&self) {
        self.timed_out.store(true, Ordering::Release);
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::Acquire)
    }

    pub(crate) fn set_finish_timestamp(&self, timestamp: u64) {
        if let Ok(mut state) = self.state.lock() {
            state.finish_timestamp = Some(timestamp.max(self.start_timestamp));
        }
    }

    pub fn finish_timestamp(&self) -> Option<u64> {
        self.state.lock().ok().and_then(|s| s.finish_timestamp)
    }

    /// Invocation duration in milliseconds, once finished.
    pub fn duration(&self) -> Option<u64> {
        self.finish_timestamp()
            .map(|finish| finish.saturating_sub(self.start_timestamp))
    }

    pub(crate) fn set_root_span(&self, span: Arc<Span>) {
        if let Ok(mut state) = self.state.lock() {
            state.root_span = Some(span);
        }
    }

    pub fn root_span(&self) -> Option<Arc<Span>> {
        self.state.lock().ok().and_then(|s| s.root_span.clone())
    }

    pub(crate) fn set_response(&self, response: serde_json::Value) {
        if let Ok(mut state) = self.state.lock() {
            state.response = Some(response);
        }
    }

    pub fn response(&self) -> Option<serde_json::Value> {
        self.state.lock().ok().and_then(|s| s.response.clone())
    }

    pub(crate) fn set_error(&self, error: ErrorInfo) {
        if let Ok(mut state) = self.state.lock() {
            state.error = Some(error);
        }
    }

    pub fn error(&self) -> Option<ErrorInfo> {
        self.state.lock().ok().and_then(|s| s.error.clone())
    }

    /// Tag carried on the invocation summary, not on any span.
    pub fn set_user_tag(&self, key: impl Into<String>, value: impl Into<TagValue>) {
        if let Ok(mut state) = self.state.lock() {
            state.user_tags.insert(key.into(), value.into());
        }
    }

    pub fn user_tags(&self) -> HashMap<String, TagValue> {
        self.state
            .lock()
            .map(|s| s.user_tags.clone())
            .unwrap_or_default()
    }

    /// Capture an application log record, attributed to the active span.
    pub fn capture_log(
        &self,
        level: impl Into<String>,
        source: impl Into<String>,
        message: impl Into<String>,
    ) {
        let record = CapturedLog {
            timestamp: epoch_millis_now(),
            level: level.into(),
            source: source.into(),
            message: message.into(),
            span_id: self.tracer.active_span().map(|s| s.context().span_id()),
        };
        if let Ok(mut state) = self.state.lock() {
            state.captured_logs.push(record);
        }
    }

    pub fn captured_logs(&self) -> Vec<CapturedLog> {
        self.state
            .lock()
            .map(|s| s.captured_logs.clone())
            .unwrap_or_default()
    }

    /// Queue a report for transmission at the end of the invocation.
    pub fn add_report(&self, report: Report) {
        if let Ok(mut state) = self.state.lock() {
            state.reports.push(report);
        }
    }

    /// Drain all queued reports for the reporter.
    pub(crate) fn take_reports(&self) -> Vec<Report> {
        self.state
            .lock()
            .map(|mut s| std::mem::take(&mut s.reports))
            .unwrap_or_default()
    }

    pub fn report_count(&self) -> usize {
        self.state.lock().map(|s| s.reports.len()).unwrap_or(0)
    }

    /// Release everything the invocation accumulated. Called after reporting
    /// so span storage does not outlive the causal chain.
    pub(crate) fn destroy(&self) {
        self.tracer.recorder().destroy();
        if let Ok(mut state) = self.state.lock() {
            *state = ContextState::default();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_context() -> Arc<ExecutionContext> {
        ExecutionContext::new(
            Arc::new(SpanListenerRegistry::new()),
            InvocationRequest::builder()
                .function_name("orders".to_string())
                .build(),
            Duration::from_millis(200),
            false,
        )
    }

    #[test]
    fn test_mark_reported_single_winner_across_threads() {
        let context = fresh_context();
        let winners: Vec<bool> = std::thread::scope(|scope| {
            (0..8)
                .map(|_| {
                    let context = context.clone();
                    scope.spawn(move || context.mark_reported())
                })
                .collect::<Vec<_>>()
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .collect()
        });

        assert_eq!(winners.iter().filter(|won| **won).count(), 1);
        assert!(context.is_reported());
        assert!(!context.mark_reported());
    }

    #[test]
    fn test_sentinel_is_shared_and_inert() {
        let a = ExecutionContext::empty();
        let b = ExecutionContext::empty();

        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.is_sentinel());
        assert!(!a.mark_reported());
        assert_eq!(a.trace_id(), Uuid::nil());
    }

    #[test]
    fn test_duration_from_finish_timestamp() {
        let context = fresh_context();
        assert_eq!(context.duration(), None);

        context.set_finish_timestamp(context.start_timestamp() + 120);
        assert_eq!(context.duration(), Some(120));

        // Clock regression clamps to zero duration.
        let other = fresh_context();
        other.set_finish_timestamp(other.start_timestamp().saturating_sub(5));
        assert_eq!(other.duration(), Some(0));
    }

    #[test]
    fn test_capture_log_attributes_active_span() {
        let context = fresh_context();
        context.capture_log("INFO", "checkout", "no active span yet");

        let span = context.tracer().start_span("charge");
        context.capture_log("WARN", "checkout", "retrying charge");
        span.finish();

        let logs = context.captured_logs();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].span_id, None);
        assert_eq!(logs[1].span_id, Some(span.context().span_id()));
        assert_eq!(logs[1].level, "WARN");
    }

    #[test]
    fn test_reports_drain_once() {
        let context = fresh_context();
        context.add_report(Report::new(
            crate::report::ReportData::Log(crate::report::LogData {
                trace_id: context.trace_id(),
                transaction_id: context.transaction_id(),
                span_id: None,
                log_level: "INFO".to_string(),
                log_context_name: "t".to_string(),
                log_message: "m".to_string(),
                log_timestamp: 1,
            }),
            "key",
        ));

        assert_eq!(context.report_count(), 1);
        assert_eq!(context.take_reports().len(), 1);
        assert_eq!(context.report_count(), 0);
        assert!(context.take_reports().is_empty());
    }

    #[test]
    fn test_destroy_clears_spans_and_state() {
        let context = fresh_context();
        let span = context.tracer().start_span("op");
        span.finish();
        context.set_user_tag("customer", "acme");

        context.destroy();

        assert!(context.tracer().recorder().span_list().is_empty());
        assert!(context.user_tags().is_empty());
    }

    #[test]
    fn test_error_info_conversions() {
        let agent_err = AgentError::Timeout { after_ms: 100 };
        let info = ErrorInfo::from(&agent_err);
        assert_eq!(info.error_type, "TimeoutError");

        let box_err: BoxError = "kaput".into();
        let info = ErrorInfo::from(&box_err);
        assert_eq!(info.error_type, "Error");
        assert_eq!(info.error_message, "kaput");
    }
}
