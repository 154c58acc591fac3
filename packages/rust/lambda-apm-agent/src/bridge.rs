//! Bridging spans into an external APM product.
//!
//! Some deployments run a vendor tracing SDK next to this agent and want the
//! agent's spans mirrored there (for example as X-Ray style subsegments).
//! [`ApmBridgeSpanListener`] does the mirroring: it opens an external handle
//! when a span starts, keeps it in a side map keyed by span id, and on the
//! span's first finish closes the handle exactly once, handing the finished
//! span over so the client can copy names, tags, and error state into its own
//! format. Map entries are removed on close, so memory stays bounded by the
//! number of currently open spans.
//!
//! The external SDK is abstracted behind [`ExternalTraceClient`] to keep this
//! crate vendor-neutral and the bridge testable without any vendor SDK.

use crate::error::BoxError;
use crate::listener::SpanListener;
use crate::logger::Logger;
use crate::span::Span;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

static LOGGER: Logger = Logger::const_new("bridge");

/// Adapter to an external tracing SDK.
///
/// `open` runs at span start with the names and start tags already set;
/// `close` runs after the span finished, so tags, logs, and error state read
/// from the span inside `close` are final.
pub trait ExternalTraceClient: Send + Sync {
    /// Vendor-side handle for one open subsegment.
    type Subsegment: Send;

    fn open(&self, span: &Span) -> Result<Self::Subsegment, BoxError>;

    fn close(&self, subsegment: Self::Subsegment, span: &Span) -> Result<(), BoxError>;
}

/// Mirrors every span through an [`ExternalTraceClient`].
pub struct ApmBridgeSpanListener<C: ExternalTraceClient> {
    client: C,
    open_handles: Mutex<HashMap<Uuid, C::Subsegment>>,
}

impl<C: ExternalTraceClient> ApmBridgeSpanListener<C> {
    pub fn new(client: C) -> Self {
        Self {
            client,
            open_handles: Mutex::new(HashMap::new()),
        }
    }

    /// Number of spans currently mirrored and not yet closed.
    pub fn open_handle_count(&self) -> usize {
        self.open_handles.lock().map(|m| m.len()).unwrap_or(0)
    }
}

impl<C: ExternalTraceClient> fmt::Debug for ApmBridgeSpanListener<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApmBridgeSpanListener")
            .field("open_handles", &self.open_handle_count())
            .finish()
    }
}

impl<C: ExternalTraceClient> SpanListener for ApmBridgeSpanListener<C> {
    fn on_span_started(&self, span: &Arc<Span>) {
        match self.client.open(span) {
            Ok(handle) => {
                if let Ok(mut handles) = self.open_handles.lock() {
                    handles.insert(span.context().span_id(), handle);
                }
            }
            Err(e) => LOGGER.warn(format!(
                "failed to open external handle for '{}': {e}",
                span.operation_name()
            )),
        }
    }

    fn on_span_finished(&self, span: &Arc<Span>) {
        let handle = self
            .open_handles
            .lock()
            .ok()
            .and_then(|mut handles| handles.remove(&span.context().span_id()));
        let Some(handle) = handle else {
            return;
        };
        if let Err(e) = self.client.close(handle, span) {
            LOGGER.warn(format!(
                "failed to close external handle for '{}': {e}",
                span.operation_name()
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::test_support::detached_span;

    /// Fake vendor SDK recording open/close calls.
    #[derive(Debug, Default)]
    struct MockTraceClient {
        opened: Mutex<Vec<String>>,
        closed: Mutex<Vec<(String, bool)>>,
        fail_open: bool,
    }

    impl ExternalTraceClient for MockTraceClient {
        type Subsegment = String;

        fn open(&self, span: &Span) -> Result<String, BoxError> {
            if self.fail_open {
                return Err("vendor sdk unavailable".into());
            }
            let id = format!("sub-{}", span.context().span_id());
            self.opened.lock().unwrap().push(span.operation_name().to_string());
            Ok(id)
        }

        fn close(&self, subsegment: String, span: &Span) -> Result<(), BoxError> {
            assert!(subsegment.starts_with("sub-"));
            self.closed
                .lock()
                .unwrap()
                .push((span.operation_name().to_string(), span.is_erroneous()));
            Ok(())
        }
    }

    #[test]
    fn test_open_then_close_copies_final_state() {
        let bridge = ApmBridgeSpanListener::new(MockTraceClient::default());
        let span = detached_span("charge_card", "HTTP", "API");

        bridge.on_span_started(&span);
        assert_eq!(bridge.open_handle_count(), 1);

        span.set_error_tags("GatewayError", "card network down");
        bridge.on_span_finished(&span);

        assert_eq!(bridge.open_handle_count(), 0);
        let closed = bridge.client.closed.lock().unwrap();
        assert_eq!(closed.as_slice(), [("charge_card".to_string(), true)]);
    }

    #[test]
    fn test_close_is_exactly_once() {
        let bridge = ApmBridgeSpanListener::new(MockTraceClient::default());
        let span = detached_span("charge_card", "HTTP", "API");

        bridge.on_span_started(&span);
        bridge.on_span_finished(&span);
        bridge.on_span_finished(&span);

        assert_eq!(bridge.client.closed.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_finish_without_open_is_noop() {
        let bridge = ApmBridgeSpanListener::new(MockTraceClient::default());
        let span = detached_span("never_started", "HTTP", "API");

        bridge.on_span_finished(&span);
        assert!(bridge.client.closed.lock().unwrap().is_empty());
    }

    #[test]
    fn test_open_failure_is_contained() {
        let bridge = ApmBridgeSpanListener::new(MockTraceClient {
            fail_open: true,
            ..MockTraceClient::default()
        });
        let span = detached_span("charge_card", "HTTP", "API");

        bridge.on_span_started(&span);
        assert_eq!(bridge.open_handle_count(), 0);
        bridge.on_span_finished(&span);
    }
}
