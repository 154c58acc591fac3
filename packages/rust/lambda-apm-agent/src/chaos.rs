//! Chaos engineering listeners.
//!
//! These listeners exist to hurt you on purpose: the latency injector stalls
//! the chain driving a span, the error injector periodically fails spans that
//! would have succeeded. Both are usually wrapped in a
//! [`FilteringSpanListener`](crate::listener::FilteringSpanListener) so the
//! damage is aimed at one operation class instead of the whole invocation.

use crate::error::AgentError;
use crate::listener::SpanListener;
use crate::logger::Logger;
use crate::span::Span;
use rand::Rng;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

static LOGGER: Logger = Logger::const_new("chaos");

/// Injects an artificial delay at span start or span finish.
///
/// The delay blocks the calling thread. That is the point: in a cooperative
/// model the stall lands exactly on the chain that produced the span, which
/// is what a slow downstream dependency would do.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LatencyInjectorSpanListener {
    delay_ms: u64,
    /// Uniform jitter bound. Zero keeps the delay fixed; otherwise the delay
    /// is drawn from `[delay_ms - variation_ms, delay_ms + variation_ms]`,
    /// clamped at zero.
    variation_ms: u64,
    /// Inject before the finish callback instead of at span start.
    inject_on_finish: bool,
}

impl LatencyInjectorSpanListener {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay_ms: delay.as_millis() as u64,
            ..Self::default()
        }
    }

    pub fn with_variation(mut self, variation: Duration) -> Self {
        self.variation_ms = variation.as_millis() as u64;
        self
    }

    pub fn on_finish(mut self) -> Self {
        self.inject_on_finish = true;
        self
    }

    pub(crate) fn from_config(config: &serde_json::Value) -> Result<Self, AgentError> {
        serde_json::from_value(config.clone())
            .map_err(|e| AgentError::Config(format!("bad LatencyInjectorSpanListener config: {e}")))
    }

    fn delay(&self) -> Duration {
        let millis = if self.variation_ms == 0 {
            self.delay_ms
        } else {
            let low = self.delay_ms.saturating_sub(self.variation_ms);
            let high = self.delay_ms.saturating_add(self.variation_ms);
            rand::rng().random_range(low..=high)
        };
        Duration::from_millis(millis)
    }

    fn inject(&self, span: &Span) {
        let delay = self.delay();
        LOGGER.debug(format!(
            "delaying '{}' by {}ms",
            span.operation_name(),
            delay.as_millis()
        ));
        std::thread::sleep(delay);
    }
}

impl SpanListener for LatencyInjectorSpanListener {
    fn on_span_started(&self, span: &Arc<Span>) {
        if !self.inject_on_finish {
            self.inject(span);
        }
    }

    fn on_span_finished(&self, span: &Arc<Span>) {
        if self.inject_on_finish {
            self.inject(span);
        }
    }
}

fn default_error_type() -> String {
    "InjectedError".to_string()
}

fn default_error_message() -> String {
    "error injected by agent configuration".to_string()
}

fn default_freq() -> u64 {
    1
}

/// Fails every Nth span passing through it.
///
/// In the default mode the failure lands at the initialization callback, so
/// the instrumented operation is vetoed and never runs. With
/// `inject_on_finish` the operation runs and only the finished span is marked
/// erroneous.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInjectorSpanListener {
    #[serde(default = "default_error_type")]
    error_type: String,
    #[serde(default = "default_error_message")]
    error_message: String,
    /// Inject on every Nth callback. 1 means every span.
    #[serde(default = "default_freq")]
    inject_count_freq: u64,
    #[serde(default)]
    inject_on_finish: bool,
    #[serde(skip)]
    counter: AtomicU64,
}

impl Default for ErrorInjectorSpanListener {
    fn default() -> Self {
        Self {
            error_type: default_error_type(),
            error_message: default_error_message(),
            inject_count_freq: default_freq(),
            inject_on_finish: false,
            counter: AtomicU64::new(0),
        }
    }
}

impl ErrorInjectorSpanListener {
    pub fn new(error_type: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            error_message: error_message.into(),
            ..Self::default()
        }
    }

    pub fn every_nth(mut self, freq: u64) -> Self {
        self.inject_count_freq = freq.max(1);
        self
    }

    pub fn on_finish(mut self) -> Self {
        self.inject_on_finish = true;
        self
    }

    pub(crate) fn from_config(config: &serde_json::Value) -> Result<Self, AgentError> {
        let mut listener: Self = serde_json::from_value(config.clone())
            .map_err(|e| AgentError::Config(format!("bad ErrorInjectorSpanListener config: {e}")))?;
        listener.inject_count_freq = listener.inject_count_freq.max(1);
        Ok(listener)
    }

    fn due(&self) -> bool {
        let call = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        call % self.inject_count_freq == 0
    }

    fn mark(&self, span: &Span) {
        span.set_error_tags(&self.error_type, &self.error_message);
    }
}

impl SpanListener for ErrorInjectorSpanListener {
    fn on_span_initialized(&self, span: &Arc<Span>) -> Result<(), AgentError> {
        if self.inject_on_finish || !self.due() {
            return Ok(());
        }
        self.mark(span);
        LOGGER.debug(format!(
            "injected {} into '{}'",
            self.error_type,
            span.operation_name()
        ));
        Err(AgentError::Injected(self.error_message.clone()))
    }

    fn on_span_finished(&self, span: &Arc<Span>) {
        if self.inject_on_finish && self.due() {
            self.mark(span);
        }
    }
}
