//! Span creation and the active-span stack.
//!
//! Each execution context owns one [`Tracer`]. The tracer resolves parentage
//! (explicit parent first, then the innermost unfinished span, then root),
//! registers every span with the context's [`Recorder`], and drives the
//! listener pipeline: `on_span_started` at creation, `on_span_initialized`
//! before a wrapped operation runs, `on_span_finished` on first finish.
//!
//! `Tracer` is cheap to clone and safe to share across the worker threads of
//! one invocation; all clones observe the same recorder and active stack.
//!
//! # Example
//!
//! ```
//! use lambda_apm_agent::listener::SpanListenerRegistry;
//! use lambda_apm_agent::tracer::Tracer;
//! use std::sync::Arc;
//! use uuid::Uuid;
//!
//! let tracer = Tracer::new(
//!     Uuid::new_v4(),
//!     Uuid::new_v4(),
//!     Arc::new(SpanListenerRegistry::new()),
//! );
//! let outer = tracer.start_span("outer");
//! let inner = tracer.start_span("inner"); // child of outer via the stack
//! inner.finish();
//! outer.finish();
//! assert_eq!(tracer.recorder().span_list().len(), 2);
//! ```

use crate::error::AgentError;
use crate::listener::SpanListenerRegistry;
use crate::recorder::Recorder;
use crate::span::{epoch_millis_now, Span, SpanContext, SpanSink};
use crate::tag::TagValue;
use bon::Builder;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Options for [`Tracer::start_span_with`].
#[derive(Builder, Debug, Clone, Default)]
pub struct SpanOptions {
    /// Tags set on the span before listeners observe it.
    #[builder(field)]
    pub tags: HashMap<String, TagValue>,

    /// Explicit parent. Overrides the active span.
    pub parent: Option<SpanContext>,

    /// Coarse implementation label (defaults to "Method").
    pub class_name: Option<String>,

    /// Coarse architectural label (defaults to "API").
    pub domain_name: Option<String>,

    /// Start time override, epoch milliseconds.
    pub start_time: Option<u64>,
}

impl<S: span_options_builder::State> SpanOptionsBuilder<S> {
    /// Set a start tag. Repeated calls add more tags.
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<TagValue>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

struct TracerInner {
    trace_id: Uuid,
    transaction_id: Uuid,
    recorder: Recorder,
    listeners: Arc<SpanListenerRegistry>,
    active: Mutex<Vec<Arc<Span>>>,
}

impl SpanSink for TracerInner {
    fn span_finished(&self, span: &Arc<Span>) {
        // Drop from the active stack before anyone reacts to the finish, so a
        // listener starting a new span resolves the right parent.
        if let Ok(mut active) = self.active.lock() {
            if let Some(position) = active
                .iter()
                .rposition(|s| s.context().span_id() == span.context().span_id())
            {
                active.remove(position);
            }
        }
        self.recorder.record_finish(span);
        self.listeners.notify_finished(span);
    }
}

/// Span factory for one execution context.
#[derive(Clone)]
pub struct Tracer {
    inner: Arc<TracerInner>,
}

impl fmt::Debug for Tracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracer")
            .field("trace_id", &self.inner.trace_id)
            .field("transaction_id", &self.inner.transaction_id)
            .field("span_count", &self.inner.recorder.span_count())
            .finish()
    }
}

impl Tracer {
    pub fn new(
        trace_id: Uuid,
        transaction_id: Uuid,
        listeners: Arc<SpanListenerRegistry>,
    ) -> Self {
        Self {
            inner: Arc::new(TracerInner {
                trace_id,
                transaction_id,
                recorder: Recorder::new(),
                listeners,
                active: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn trace_id(&self) -> Uuid {
        self.inner.trace_id
    }

    pub fn transaction_id(&self) -> Uuid {
        self.inner.transaction_id
    }

    /// The span store backing this tracer.
    pub fn recorder(&self) -> &Recorder {
        &self.inner.recorder
    }

    /// Innermost unfinished span, if any.
    pub fn active_span(&self) -> Option<Arc<Span>> {
        self.inner
            .active
            .lock()
            .ok()
            .and_then(|active| active.last().cloned())
    }

    /// Start a span with default options.
    pub fn start_span(&self, operation_name: &str) -> Arc<Span> {
        self.start_span_with(operation_name, SpanOptions::default())
    }

    /// Start a span. Parent resolution: explicit parent in `options`, else
    /// the active span, else a new root of this tracer's trace.
    pub fn start_span_with(&self, operation_name: &str, options: SpanOptions) -> Arc<Span> {
        let parent = options
            .parent
            .clone()
            .or_else(|| self.active_span().map(|span| span.context().clone()));
        let context = match parent {
            Some(parent) => SpanContext::child_of(&parent),
            None => SpanContext::root(self.inner.trace_id, self.inner.transaction_id),
        };

        let sink: Arc<dyn SpanSink> = self.inner.clone();
        let span = Arc::new(Span::new(
            context,
            operation_name,
            options.class_name.as_deref().unwrap_or("Method"),
            options.domain_name.as_deref().unwrap_or("API"),
            options.start_time.unwrap_or_else(epoch_millis_now),
            Arc::downgrade(&sink),
        ));
        for (key, value) in options.tags {
            span.set_tag(key, value);
        }

        self.inner.recorder.register(&span);
        if let Ok(mut active) = self.inner.active.lock() {
            active.push(span.clone());
        }
        self.inner.listeners.notify_started(&span);
        span
    }

    /// Run the listener veto point for a span about to do real work.
    ///
    /// An error means some listener refused the operation; the caller must
    /// not run it.
    pub fn initialize_span(&self, span: &Arc<Span>) -> Result<(), AgentError> {
        self.inner.listeners.notify_initialized(span)
    }

    /// Finish the innermost unfinished span.
    pub fn finish_span(&self) {
        if let Some(span) = self.active_span() {
            span.finish();
        }
    }

    /// Run `f` inside a span named `operation_name`.
    ///
    /// The span is started and initialized first; a listener veto surfaces as
    /// `E` without running `f`. A failure from `f` lands on the span as error
    /// tags. The span finishes on every path.
    pub fn wrap<T, E, F>(&self, operation_name: &str, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<AgentError> + fmt::Display,
    {
        self.wrap_with(operation_name, SpanOptions::default(), f)
    }

    /// [`Tracer::wrap`] with explicit span options.
    pub fn wrap_with<T, E, F>(&self, operation_name: &str, options: SpanOptions, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<AgentError> + fmt::Display,
    {
        let span = self.start_span_with(operation_name, options);
        if let Err(veto) = self.initialize_span(&span) {
            span.finish();
            return Err(E::from(veto));
        }
        let result = f();
        if let Err(e) = &result {
            span.set_error_tags("Error", &e.to_string());
        }
        span.finish();
        result
    }

    /// Async flavor of [`Tracer::wrap`]; the future is only constructed when
    /// no listener vetoes the span.
    pub async fn wrap_async<T, E, F, Fut>(&self, operation_name: &str, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<AgentError> + fmt::Display,
    {
        self.wrap_async_with(operation_name, SpanOptions::default(), f)
            .await
    }

    /// [`Tracer::wrap_async`] with explicit span options.
    pub async fn wrap_async_with<T, E, F, Fut>(
        &self,
        operation_name: &str,
        options: SpanOptions,
        f: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<AgentError> + fmt::Display,
    {
        let span = self.start_span_with(operation_name, options);
        if let Err(veto) = self.initialize_span(&span) {
            span.finish();
            return Err(E::from(veto));
        }
        let result = f().await;
        if let Err(e) = &result {
            span.set_error_tags("Error", &e.to_string());
        }
        span.finish();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::tags;
    use crate::listener::test_support::CountingListener;
    use std::sync::atomic::Ordering;

    fn plain_tracer() -> Tracer {
        Tracer::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Arc::new(SpanListenerRegistry::new()),
        )
    }

    fn tracer_with_counters() -> (Tracer, Arc<crate::listener::test_support::Counters>) {
        let (listener, counters) = CountingListener::new();
        let mut registry = SpanListenerRegistry::new();
        registry.register(Box::new(listener));
        (
            Tracer::new(Uuid::new_v4(), Uuid::new_v4(), Arc::new(registry)),
            counters,
        )
    }

    #[test]
    fn test_parent_resolution_via_active_stack() {
        let tracer = plain_tracer();

        let outer = tracer.start_span("outer");
        assert_eq!(outer.context().parent_span_id(), None);
        assert_eq!(outer.context().trace_id(), tracer.trace_id());

        let inner = tracer.start_span("inner");
        assert_eq!(
            inner.context().parent_span_id(),
            Some(outer.context().span_id())
        );

        inner.finish();
        let sibling = tracer.start_span("sibling");
        assert_eq!(
            sibling.context().parent_span_id(),
            Some(outer.context().span_id())
        );
    }

    #[test]
    fn test_explicit_parent_overrides_active() {
        let tracer = plain_tracer();
        let outer = tracer.start_span("outer");
        let _inner = tracer.start_span("inner");

        let options = SpanOptions::builder()
            .parent(outer.context().clone())
            .build();
        let reparented = tracer.start_span_with("reparented", options);

        assert_eq!(
            reparented.context().parent_span_id(),
            Some(outer.context().span_id())
        );
    }

    #[test]
    fn test_out_of_order_finish_keeps_stack_sane() {
        let tracer = plain_tracer();
        let outer = tracer.start_span("outer");
        let inner = tracer.start_span("inner");

        outer.finish();
        assert_eq!(
            tracer.active_span().unwrap().context().span_id(),
            inner.context().span_id()
        );

        inner.finish();
        assert!(tracer.active_span().is_none());
    }

    #[test]
    fn test_finish_order_and_tree_shape() {
        let tracer = plain_tracer();
        let outer = tracer.start_span("outer");
        let inner = tracer.start_span("inner");
        inner.finish();
        outer.finish();

        let list: Vec<_> = tracer
            .recorder()
            .span_list()
            .iter()
            .map(|s| s.operation_name().to_string())
            .collect();
        assert_eq!(list, ["inner", "outer"]);

        let trees = tracer.recorder().span_tree();
        assert_eq!(trees[0].span.operation_name(), "outer");
        assert_eq!(trees[0].children[0].span.operation_name(), "inner");
    }

    #[test]
    fn test_listener_sees_each_event_once() {
        let (tracer, counters) = tracer_with_counters();
        let span = tracer.start_span("op");
        tracer.initialize_span(&span).unwrap();
        span.finish();
        span.finish();

        assert_eq!(counters.started.load(Ordering::SeqCst), 1);
        assert_eq!(counters.initialized.load(Ordering::SeqCst), 1);
        assert_eq!(counters.finished.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wrap_records_failure_and_finishes() {
        let tracer = plain_tracer();
        let result: Result<(), crate::error::BoxError> =
            tracer.wrap("failing", || Err("disk on fire".into()));

        assert!(result.is_err());
        let spans = tracer.recorder().span_list();
        assert_eq!(spans.len(), 1);
        assert!(spans[0].is_erroneous());
        assert_eq!(
            spans[0].get_tag(tags::ERROR_MESSAGE),
            Some(TagValue::Str("disk on fire".to_string()))
        );
        assert!(spans[0].is_finished());
    }

    #[test]
    fn test_wrap_veto_skips_body() {
        let (listener, _) = CountingListener::vetoing();
        let mut registry = SpanListenerRegistry::new();
        registry.register(Box::new(listener));
        let tracer = Tracer::new(Uuid::new_v4(), Uuid::new_v4(), Arc::new(registry));

        let mut ran = false;
        let result: Result<(), AgentError> = tracer.wrap("blocked", || {
            ran = true;
            Ok(())
        });

        assert!(matches!(result, Err(AgentError::SecurityBlocked(_))));
        assert!(!ran);
        // Vetoed span still finished and recorded.
        assert_eq!(tracer.recorder().span_list().len(), 1);
    }

    #[tokio::test]
    async fn test_wrap_async_success() {
        let tracer = plain_tracer();
        let result: Result<u32, AgentError> = tracer
            .wrap_async("compute", || async {
                tokio::task::yield_now().await;
                Ok(41 + 1)
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        let spans = tracer.recorder().span_list();
        assert_eq!(spans.len(), 1);
        assert!(!spans[0].is_erroneous());
    }

    #[test]
    fn test_start_tags_applied_before_listeners() {
        let tracer = plain_tracer();
        let options = SpanOptions::builder()
            .class_name("HTTP".to_string())
            .with_tag("http.method", "PUT")
            .build();
        let span = tracer.start_span_with("put_item", options);

        assert_eq!(span.class_name(), "HTTP");
        assert_eq!(
            span.get_tag("http.method"),
            Some(TagValue::Str("PUT".to_string()))
        );
    }
}
