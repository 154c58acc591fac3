//! Span listener pipeline.
//!
//! Listeners observe every span the tracer produces and may mutate or veto
//! them. The pipeline has three callbacks:
//!
//! - `on_span_started`: the span exists and is registered. Observation only.
//! - `on_span_initialized`: called before the instrumented operation runs.
//!   Returning an error vetoes the operation; the tracer finishes the span
//!   with error tags and the operation body never executes.
//! - `on_span_finished`: the span's first finish was recorded.
//!
//! [`FilteringSpanListener`] scopes any inner listener to the spans matching
//! all of its [`SpanFilter`]s, so chaos or security listeners can be aimed at
//! a single operation class. Listener stacks can be built in code or parsed
//! from JSON descriptors (see [`listeners_from_json`]), which is how the
//! `APM_AGENT_SPAN_LISTENERS` environment variable is consumed:
//!
//! ```json
//! [{
//!   "type": "FilteringSpanListener",
//!   "config": {
//!     "listener": {"type": "LatencyInjectorSpanListener", "config": {"delayMs": 370}},
//!     "filters": [{"className": "HTTP", "tags": {"http.method": ["GET", "PUT"]}}]
//!   }
//! }]
//! ```

use crate::chaos::{ErrorInjectorSpanListener, LatencyInjectorSpanListener};
use crate::error::AgentError;
use crate::logger::Logger;
use crate::security::SecurityAwareSpanListener;
use crate::span::Span;
use crate::tag::TagValue;
use bon::Builder;
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

static LOGGER: Logger = Logger::const_new("listener");

/// Observer of span lifecycle events.
///
/// All callbacks run inline on the thread driving the span, so they must be
/// cheap or deliberately blocking (the latency injector blocks on purpose).
pub trait SpanListener: Send + Sync + Debug {
    /// A span was created and registered.
    fn on_span_started(&self, _span: &Arc<Span>) {}

    /// The instrumented operation is about to run. Err vetoes it.
    fn on_span_initialized(&self, _span: &Arc<Span>) -> Result<(), AgentError> {
        Ok(())
    }

    /// The span finished for the first time.
    fn on_span_finished(&self, _span: &Arc<Span>) {}
}

/// The ordered set of listeners shared by every tracer the agent creates.
///
/// Built once at agent init and then immutable, so sharing is a plain `Arc`
/// with no locking on the hot path.
#[derive(Debug, Default)]
pub struct SpanListenerRegistry {
    listeners: Vec<Box<dyn SpanListener>>,
}

impl SpanListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a listener. Listeners fire in registration order.
    pub fn register(&mut self, listener: Box<dyn SpanListener>) {
        self.listeners.push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub(crate) fn notify_started(&self, span: &Arc<Span>) {
        for listener in &self.listeners {
            listener.on_span_started(span);
        }
    }

    /// Runs the veto point. The first listener error stops the iteration and
    /// is returned to the tracer.
    pub(crate) fn notify_initialized(&self, span: &Arc<Span>) -> Result<(), AgentError> {
        for listener in &self.listeners {
            listener.on_span_initialized(span)?;
        }
        Ok(())
    }

    pub(crate) fn notify_finished(&self, span: &Arc<Span>) {
        for listener in &self.listeners {
            listener.on_span_finished(span);
        }
    }
}

fn de_tag_sets<'de, D>(deserializer: D) -> Result<HashMap<String, Vec<TagValue>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        Many(Vec<TagValue>),
        One(TagValue),
    }

    let raw = HashMap::<String, OneOrMany>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|(key, values)| {
            (
                key,
                match values {
                    OneOrMany::Many(values) => values,
                    OneOrMany::One(value) => vec![value],
                },
            )
        })
        .collect())
}

/// Predicate over spans, matched field by field.
///
/// Every specified field must match; unspecified fields match anything. Tag
/// entries are membership tests: the span's value for the key must be one of
/// the listed values. In JSON descriptors a single tag value is accepted as
/// shorthand for a one-element list.
#[derive(Builder, Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SpanFilter {
    #[builder(field)]
    #[serde(deserialize_with = "de_tag_sets")]
    pub tags: HashMap<String, Vec<TagValue>>,

    /// Exact operation name to match.
    pub operation_name: Option<String>,

    /// Exact class name to match.
    pub class_name: Option<String>,

    /// Exact domain name to match.
    pub domain_name: Option<String>,
}

impl<S: span_filter_builder::State> SpanFilterBuilder<S> {
    /// Allow `value` for `key`. Repeated calls on the same key widen the set.
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<TagValue>) -> Self {
        self.tags.entry(key.into()).or_default().push(value.into());
        self
    }
}

impl SpanFilter {
    /// Whether the span satisfies every specified field of this filter.
    pub fn matches(&self, span: &Span) -> bool {
        if let Some(operation_name) = &self.operation_name {
            if operation_name != span.operation_name() {
                return false;
            }
        }
        if let Some(class_name) = &self.class_name {
            if class_name != span.class_name() {
                return false;
            }
        }
        if let Some(domain_name) = &self.domain_name {
            if domain_name != span.domain_name() {
                return false;
            }
        }
        if self.tags.is_empty() {
            return true;
        }
        let span_tags = span.tags();
        self.tags.iter().all(|(key, allowed)| {
            span_tags
                .get(key)
                .map(|value| allowed.contains(value))
                .unwrap_or(false)
        })
    }
}

/// Scopes an inner listener to spans matching all configured filters.
///
/// With no filters every span matches. Filters are re-evaluated per callback,
/// so a span that gains or loses a tag between start and finish can match at
/// one callback and not the other.
#[derive(Debug)]
pub struct FilteringSpanListener {
    listener: Box<dyn SpanListener>,
    filters: Vec<SpanFilter>,
}

impl FilteringSpanListener {
    pub fn new(listener: Box<dyn SpanListener>, filters: Vec<SpanFilter>) -> Self {
        Self { listener, filters }
    }

    fn accepts(&self, span: &Span) -> bool {
        self.filters.iter().all(|filter| filter.matches(span))
    }

    fn from_config(config: &serde_json::Value) -> Result<Self, AgentError> {
        #[derive(Deserialize)]
        struct FilteringConfig {
            listener: serde_json::Value,
            #[serde(default)]
            filters: Vec<SpanFilter>,
        }

        let config: FilteringConfig = serde_json::from_value(config.clone())
            .map_err(|e| AgentError::Config(format!("bad FilteringSpanListener config: {e}")))?;
        Ok(Self::new(
            listener_from_descriptor(&config.listener)?,
            config.filters,
        ))
    }
}

impl SpanListener for FilteringSpanListener {
    fn on_span_started(&self, span: &Arc<Span>) {
        if self.accepts(span) {
            self.listener.on_span_started(span);
        }
    }

    fn on_span_initialized(&self, span: &Arc<Span>) -> Result<(), AgentError> {
        if self.accepts(span) {
            self.listener.on_span_initialized(span)?;
        }
        Ok(())
    }

    fn on_span_finished(&self, span: &Arc<Span>) {
        if self.accepts(span) {
            self.listener.on_span_finished(span);
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListenerDescriptor {
    #[serde(rename = "type")]
    listener_type: String,
    #[serde(default)]
    config: serde_json::Value,
}

/// Build one listener from a JSON descriptor (`{"type": ..., "config": ...}`).
///
/// The listener set is closed; an unknown type is a configuration error. The
/// external-APM bridge is not descriptor-constructible because it needs a
/// client instance, so it is wired programmatically instead.
pub fn listener_from_descriptor(
    value: &serde_json::Value,
) -> Result<Box<dyn SpanListener>, AgentError> {
    let descriptor: ListenerDescriptor = serde_json::from_value(value.clone())
        .map_err(|e| AgentError::Config(format!("bad span listener descriptor: {e}")))?;

    match descriptor.listener_type.as_str() {
        "FilteringSpanListener" => Ok(Box::new(FilteringSpanListener::from_config(
            &descriptor.config,
        )?)),
        "SecurityAwareSpanListener" => Ok(Box::new(SecurityAwareSpanListener::from_config(
            &descriptor.config,
        )?)),
        "LatencyInjectorSpanListener" => Ok(Box::new(LatencyInjectorSpanListener::from_config(
            &descriptor.config,
        )?)),
        "ErrorInjectorSpanListener" => Ok(Box::new(ErrorInjectorSpanListener::from_config(
            &descriptor.config,
        )?)),
        other => Err(AgentError::Config(format!(
            "unknown span listener type: {other}"
        ))),
    }
}

/// Parse a JSON array of listener descriptors, as carried by the
/// `APM_AGENT_SPAN_LISTENERS` environment variable.
pub fn listeners_from_json(raw: &str) -> Result<Vec<Box<dyn SpanListener>>, AgentError> {
    let descriptors: Vec<serde_json::Value> = serde_json::from_str(raw)
        .map_err(|e| AgentError::Config(format!("span listener config is not a JSON array: {e}")))?;
    let listeners = descriptors
        .iter()
        .map(listener_from_descriptor)
        .collect::<Result<Vec<_>, _>>()?;
    LOGGER.debug(format!("parsed {} span listener(s)", listeners.len()));
    Ok(listeners)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts callbacks; optionally vetoes every initialization.
    #[derive(Debug, Default)]
    pub struct Counters {
        pub started: AtomicUsize,
        pub initialized: AtomicUsize,
        pub finished: AtomicUsize,
        pub veto: bool,
    }

    #[derive(Debug, Clone)]
    pub struct CountingListener(pub Arc<Counters>);

    impl CountingListener {
        pub fn new() -> (Self, Arc<Counters>) {
            let counters = Arc::new(Counters::default());
            (Self(counters.clone()), counters)
        }

        pub fn vetoing() -> (Self, Arc<Counters>) {
            let counters = Arc::new(Counters {
                veto: true,
                ..Counters::default()
            });
            (Self(counters.clone()), counters)
        }
    }

    impl SpanListener for CountingListener {
        fn on_span_started(&self, _span: &Arc<Span>) {
            self.0.started.fetch_add(1, Ordering::SeqCst);
        }

        fn on_span_initialized(&self, span: &Arc<Span>) -> Result<(), AgentError> {
            self.0.initialized.fetch_add(1, Ordering::SeqCst);
            if self.0.veto {
                return Err(AgentError::SecurityBlocked(
                    span.operation_name().to_string(),
                ));
            }
            Ok(())
        }

        fn on_span_finished(&self, _span: &Arc<Span>) {
            self.0.finished.fetch_add(1, Ordering::SeqCst);
        }
    }
}
