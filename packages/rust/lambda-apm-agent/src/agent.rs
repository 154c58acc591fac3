//! Agent façade and invocation lifecycle.
//!
//! [`init_agent`] wires configuration, span listeners, plugins and the
//! reporter into an [`Agent`]. [`Agent::invoke`] runs one handler under the
//! full lifecycle:
//!
//! 1. a fresh [`ExecutionContext`] is created and installed as the causally
//!    current context for everything the invocation runs,
//! 2. plugin `before_invocation` hooks fire in order (the trace plugin
//!    starts the root span here); a hook error aborts the invocation before
//!    user code runs,
//! 3. the handler runs, racing the [`CompletionHandle`] and the timeout
//!    guard. The first of the three to claim the completion gate decides the
//!    invocation's outcome; later completions are ignored,
//! 4. plugin `after_invocation` hooks fire (failures logged, never fatal)
//!    and the queued reports ship as one batch.
//!
//! The timeout guard arms only when the invocation carries a
//! `remaining_time` budget. It fires `timeout_margin` before the budget runs
//! out, so reports leave the process before the host kills it.
//!
//! # Example
//!
//! ```no_run
//! use lambda_apm_agent::agent::init_agent;
//! use lambda_apm_agent::config::AgentConfig;
//! use lambda_apm_agent::context::InvocationRequest;
//! use lambda_apm_agent::context_manager::ExecutionContextManager;
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let agent = init_agent(AgentConfig::from_env())?;
//!
//! let request = InvocationRequest::builder()
//!     .function_name("checkout".to_string())
//!     .build();
//!
//! let response = agent
//!     .invoke(request, |_completion| async {
//!         let context = ExecutionContextManager::get();
//!         let span = context.tracer().start_span("charge-card");
//!         // ... user work ...
//!         span.finish();
//!         Ok(json!({"status": "ok"}))
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

use crate::config::AgentConfig;
use crate::context::{ErrorInfo, ExecutionContext, InvocationRequest};
use crate::context_manager::ExecutionContextManager;
use crate::error::{AgentError, BoxError};
use crate::invocation::InvocationPlugin;
use crate::listener::{listeners_from_json, SpanListenerRegistry};
use crate::log::LogPlugin;
use crate::logger::Logger;
use crate::metric::MetricPlugin;
use crate::plugin::Plugin;
use crate::reporter::Reporter;
use crate::span::epoch_millis_now;
use crate::trace::TracePlugin;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

static LOGGER: Logger = Logger::const_new("agent");

/// Build an [`Agent`] from configuration alone. Environment variables
/// override the configured values.
pub fn init_agent(config: AgentConfig) -> Result<Agent, AgentError> {
    Agent::new(config, SpanListenerRegistry::new())
}

/// Shared state behind the completion race.
///
/// `claim` is the only way an invocation gets an outcome, and the context's
/// reported gate makes it first-caller-wins regardless of which path
/// (handler return, completion handle, timeout guard, hook abort) calls it.
struct CompletionState {
    context: Arc<ExecutionContext>,
    outcome: Mutex<Option<Result<serde_json::Value, AgentError>>>,
    notify: Notify,
}

impl CompletionState {
    fn new(context: Arc<ExecutionContext>) -> Arc<Self> {
        Arc::new(Self {
            context,
            outcome: Mutex::new(None),
            notify: Notify::new(),
        })
    }

    fn claim(&self, outcome: Result<serde_json::Value, AgentError>) -> bool {
        if !self.context.mark_reported() {
            LOGGER.debug("late completion ignored; the invocation already has an outcome");
            return false;
        }
        self.context.set_finish_timestamp(epoch_millis_now());
        match &outcome {
            Ok(response) => self.context.set_response(response.clone()),
            // User failures are recorded with their own message, not the
            // agent's wrapping.
            Err(AgentError::UserCode(source)) => self.context.set_error(ErrorInfo::from(source)),
            Err(error) => self.context.set_error(ErrorInfo::from(error)),
        }
        if let Ok(mut slot) = self.outcome.lock() {
            *slot = Some(outcome);
        }
        self.notify.notify_one();
        true
    }

    fn take_outcome(&self) -> Result<serde_json::Value, AgentError> {
        let taken = self.outcome.lock().ok().and_then(|mut slot| slot.take());
        taken.unwrap_or_else(|| {
            Err(AgentError::UserCode(
                "invocation produced no outcome".into(),
            ))
        })
    }
}

/// Callback-style completion object handed to the handler.
///
/// `succeed`, `fail` and `done` complete the invocation immediately, without
/// waiting for the handler future to return; the handler is still driven to
/// completion afterwards so its cleanup runs, but its eventual result is
/// ignored. Each method returns whether this call won the completion race.
#[derive(Clone)]
pub struct CompletionHandle {
    state: Arc<CompletionState>,
}

impl fmt::Debug for CompletionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("completed", &self.state.context.is_reported())
            .finish()
    }
}

impl CompletionHandle {
    pub fn succeed(&self, response: impl Into<serde_json::Value>) -> bool {
        self.state.claim(Ok(response.into()))
    }

    pub fn fail(&self, error: impl Into<BoxError>) -> bool {
        self.state.claim(Err(AgentError::UserCode(error.into())))
    }

    /// Callback-convention completion: an error wins over a response.
    pub fn done(&self, error: Option<BoxError>, response: Option<serde_json::Value>) -> bool {
        match error {
            Some(error) => self.fail(error),
            None => self.succeed(response.unwrap_or(serde_json::Value::Null)),
        }
    }
}

struct AgentInner {
    config: AgentConfig,
    listeners: Arc<SpanListenerRegistry>,
    plugins: Vec<Box<dyn Plugin>>,
    reporter: Reporter,
    cold_start: AtomicBool,
}

/// Instrumentation agent. One per process; cheap to clone.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("application", &self.inner.config.resolved_application_name())
            .field("plugins", &self.inner.plugins.len())
            .field("listeners", &self.inner.listeners.len())
            .finish()
    }
}

impl Agent {
    /// Build an agent over an explicit listener registry. Listeners from
    /// `span_listener_json` (or the environment) are appended to it.
    pub fn new(config: AgentConfig, listeners: SpanListenerRegistry) -> Result<Self, AgentError> {
        Self::build(config.resolve(), listeners, Vec::new(), None)
    }

    /// Full control: `extra_plugins` run after the built-in set and reports
    /// go through `reporter` instead of the configured collector.
    pub fn with_components(
        config: AgentConfig,
        listeners: SpanListenerRegistry,
        extra_plugins: Vec<Box<dyn Plugin>>,
        reporter: Reporter,
    ) -> Result<Self, AgentError> {
        Self::build(config.resolve(), listeners, extra_plugins, Some(reporter))
    }

    fn build(
        config: AgentConfig,
        mut listeners: SpanListenerRegistry,
        extra_plugins: Vec<Box<dyn Plugin>>,
        reporter: Option<Reporter>,
    ) -> Result<Self, AgentError> {
        config.validate()?;

        if let Some(raw) = &config.span_listener_json {
            for listener in listeners_from_json(raw)? {
                listeners.register(listener);
            }
        }

        let mut plugins: Vec<Box<dyn Plugin>> = vec![Box::new(InvocationPlugin::new(&config))];
        if config.trace_enabled {
            plugins.push(Box::new(TracePlugin::new(&config)));
        }
        if config.metric_enabled {
            plugins.push(Box::new(MetricPlugin::new(&config)));
        }
        if config.log_enabled {
            plugins.push(Box::new(LogPlugin::new(&config)));
        }
        plugins.extend(extra_plugins);

        let reporter = reporter.unwrap_or_else(|| Reporter::new(&config));
        LOGGER.info(format!(
            "agent initialized for '{}' with {} plugin(s) and {} span listener(s)",
            config.resolved_application_name(),
            plugins.len(),
            listeners.len()
        ));

        Ok(Self {
            inner: Arc::new(AgentInner {
                config,
                listeners: Arc::new(listeners),
                plugins,
                reporter,
                cold_start: AtomicBool::new(true),
            }),
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    /// Run one handler invocation under the full lifecycle. Returns the
    /// outcome decided by the winning completion path.
    pub async fn invoke<F, Fut>(
        &self,
        request: InvocationRequest,
        handler: F,
    ) -> Result<serde_json::Value, AgentError>
    where
        F: FnOnce(CompletionHandle) -> Fut,
        Fut: Future<Output = Result<serde_json::Value, BoxError>>,
    {
        let cold_start = self.inner.cold_start.swap(false, Ordering::AcqRel);
        let context = ExecutionContext::new(
            self.inner.listeners.clone(),
            request,
            self.inner.config.timeout_margin,
            cold_start,
        );
        let completion = CompletionState::new(context.clone());

        let outcome = ExecutionContextManager::run_with_context(
            context.clone(),
            self.run_invocation(&context, &completion, handler),
        )
        .await;
        context.destroy();
        outcome
    }

    async fn run_invocation<F, Fut>(
        &self,
        context: &Arc<ExecutionContext>,
        completion: &Arc<CompletionState>,
        handler: F,
    ) -> Result<serde_json::Value, AgentError>
    where
        F: FnOnce(CompletionHandle) -> Fut,
        Fut: Future<Output = Result<serde_json::Value, BoxError>>,
    {
        for plugin in &self.inner.plugins {
            if let Err(e) = plugin.before_invocation(context).await {
                LOGGER.warn(format!(
                    "plugin {} aborted the invocation: {e}",
                    plugin.name()
                ));
                completion.claim(Err(e));
                break;
            }
        }

        if !context.is_reported() {
            self.drive_handler(context, completion, handler).await;
        }

        for plugin in &self.inner.plugins {
            if let Err(e) = plugin.after_invocation(context).await {
                LOGGER.warn(format!(
                    "plugin {} after_invocation failed: {e}",
                    plugin.name()
                ));
            }
        }
        self.inner.reporter.report(context.take_reports()).await;

        completion.take_outcome()
    }

    async fn drive_handler<F, Fut>(
        &self,
        context: &Arc<ExecutionContext>,
        completion: &Arc<CompletionState>,
        handler: F,
    ) where
        F: FnOnce(CompletionHandle) -> Fut,
        Fut: Future<Output = Result<serde_json::Value, BoxError>>,
    {
        let handle = CompletionHandle {
            state: completion.clone(),
        };
        let handler_future = handler(handle);
        tokio::pin!(handler_future);

        let guard_delay = context
            .invocation()
            .remaining_time
            .map(|budget| budget.saturating_sub(context.timeout_margin()));
        let guard = async {
            match guard_delay {
                Some(delay) => tokio::time::sleep(delay).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(guard);

        tokio::select! {
            biased;

            _ = completion.notify.notified() => {
                // A completion call decided the outcome; keep driving the
                // handler so its cleanup runs, bounded by the deadline.
                tokio::select! {
                    _ = &mut handler_future => {}
                    _ = &mut guard => {
                        LOGGER.warn(
                            "handler still running at the deadline after completing; abandoning it",
                        );
                    }
                }
            }
            result = &mut handler_future => {
                completion.claim(result.map_err(AgentError::UserCode));
            }
            _ = &mut guard => {
                context.mark_timed_out();
                let after_ms = guard_delay.map(|d| d.as_millis() as u64).unwrap_or(0);
                completion.claim(Err(AgentError::Timeout { after_ms }));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context_manager::ContextFutureExt;
    use crate::listener::test_support::CountingListener;
    use crate::plugin::test_support::RecordingPlugin;
    use crate::report::{Report, ReportData};
    use crate::reporter::ReportTransport;
    use async_trait::async_trait;
    use serde_json::json;
    use serial_test::serial;
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct RecordingTransport {
        batches: Mutex<Vec<Vec<Report>>>,
    }

    impl RecordingTransport {
        fn batches(&self) -> Vec<Vec<Report>> {
            self.batches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ReportTransport for RecordingTransport {
        async fn send(&self, reports: &[Report]) -> Result<(), AgentError> {
            self.batches.lock().unwrap().push(reports.to_vec());
            Ok(())
        }
    }

    fn test_agent(config: AgentConfig) -> (Agent, Arc<RecordingTransport>) {
        test_agent_with(config, SpanListenerRegistry::new(), Vec::new())
    }

    fn test_agent_with(
        config: AgentConfig,
        listeners: SpanListenerRegistry,
        extra_plugins: Vec<Box<dyn Plugin>>,
    ) -> (Agent, Arc<RecordingTransport>) {
        crate::config::clear_agent_env();
        let transport = Arc::new(RecordingTransport::default());
        let reporter = Reporter::with_transport(transport.clone());
        let agent =
            Agent::with_components(config, listeners, extra_plugins, reporter).unwrap();
        (agent, transport)
    }

    fn invocation_data(report: &Report) -> &crate::report::InvocationData {
        match &report.data {
            ReportData::Invocation(data) => data,
            other => panic!("expected invocation data, got {other:?}"),
        }
    }

    fn audit_data(report: &Report) -> &crate::report::AuditData {
        match &report.data {
            ReportData::Audit(data) => data,
            other => panic!("expected audit data, got {other:?}"),
        }
    }

    #[tokio::test]
    #[serial]
    async fn test_handler_return_ships_one_batch() {
        let config = AgentConfig::builder()
            .api_key("key-1".to_string())
            .application_name("orders".to_string())
            .build();
        let (agent, transport) = test_agent(config);

        let outcome = agent
            .invoke(
                InvocationRequest::builder()
                    .function_name("orders-fn".to_string())
                    .request_id("req-1".to_string())
                    .build(),
                |_completion| async { Ok(json!({"status": "ok"})) },
            )
            .await;
        assert_eq!(outcome.unwrap(), json!({"status": "ok"}));

        let batches = transport.batches();
        assert_eq!(batches.len(), 1);
        let types: Vec<&str> = batches[0].iter().map(|r| r.data_type()).collect();
        assert_eq!(types, vec!["InvocationData", "AuditData", "StatData"]);

        let data = invocation_data(&batches[0][0]);
        assert!(!data.erroneous);
        assert!(data.cold_start);
        assert_eq!(data.application_name, "orders");
        assert_eq!(data.request_id.as_deref(), Some("req-1"));

        let audit = audit_data(&batches[0][1]);
        assert_eq!(audit.root_span.operation_name, "orders-fn");
    }

    #[tokio::test]
    #[serial]
    async fn test_completion_handle_beats_handler_return() {
        let (agent, transport) = test_agent(AgentConfig::default());

        let outcome = agent
            .invoke(InvocationRequest::default(), |completion| async move {
                assert!(completion.succeed(json!("early")));
                assert!(!completion.fail("already decided"));
                tokio::task::yield_now().await;
                Ok(json!("late"))
            })
            .await;

        assert_eq!(outcome.unwrap(), json!("early"));
        let batches = transport.batches();
        assert_eq!(batches.len(), 1);
        assert!(!invocation_data(&batches[0][0]).erroneous);
    }

    #[tokio::test]
    #[serial]
    async fn test_done_error_wins_over_response() {
        let (agent, transport) = test_agent(AgentConfig::default());

        let outcome = agent
            .invoke(InvocationRequest::default(), |completion| async move {
                assert!(completion.done(Some("card declined".into()), Some(json!("ignored"))));
                Ok(json!("unused"))
            })
            .await;

        assert!(matches!(outcome, Err(AgentError::UserCode(_))));
        let batches = transport.batches();
        let data = invocation_data(&batches[0][0]);
        assert!(data.erroneous);
        assert_eq!(data.error_type.as_deref(), Some("Error"));
        assert_eq!(data.error_message.as_deref(), Some("card declined"));
    }

    #[tokio::test]
    #[serial]
    async fn test_handler_error_is_the_outcome() {
        let (agent, transport) = test_agent(AgentConfig::default());

        let outcome = agent
            .invoke(InvocationRequest::default(), |_completion| async {
                Err("kaput".into())
            })
            .await;

        assert!(matches!(outcome, Err(AgentError::UserCode(_))));
        let batches = transport.batches();
        let data = invocation_data(&batches[0][0]);
        assert!(data.erroneous);
        assert_eq!(data.error_message.as_deref(), Some("kaput"));

        // The trace plugin copies the invocation error onto the root span.
        let audit = audit_data(&batches[0][1]);
        assert_eq!(
            audit.root_span.tags.get("error"),
            Some(&crate::tag::TagValue::Bool(true))
        );
    }

    #[tokio::test(start_paused = true)]
    #[serial]
    async fn test_timeout_guard_claims_and_reports() {
        let (agent, transport) = test_agent(AgentConfig::default());

        let outcome = agent
            .invoke(
                InvocationRequest::builder()
                    .function_name("slow-fn".to_string())
                    .remaining_time(Duration::from_secs(3))
                    .build(),
                |_completion| async {
                    std::future::pending::<()>().await;
                    Ok(json!("never"))
                },
            )
            .await;

        // Default margin is 200ms, so the guard fires at 2800ms.
        assert!(matches!(outcome, Err(AgentError::Timeout { after_ms: 2800 })));

        let batches = transport.batches();
        assert_eq!(batches.len(), 1);
        let data = invocation_data(&batches[0][0]);
        assert!(data.timeout);
        assert!(data.erroneous);
        assert_eq!(data.error_type.as_deref(), Some("TimeoutError"));

        // The root span was still finished and reported.
        let audit = audit_data(&batches[0][1]);
        assert_eq!(
            audit.root_span.tags.get("error.kind"),
            Some(&crate::tag::TagValue::from("TimeoutError"))
        );
    }

    #[tokio::test]
    #[serial]
    async fn test_before_hook_veto_blocks_user_code() {
        let (vetoer, counters) = CountingListener::vetoing();
        let mut listeners = SpanListenerRegistry::new();
        listeners.register(Box::new(vetoer));
        let (agent, transport) = test_agent_with(AgentConfig::default(), listeners, Vec::new());

        let ran = Arc::new(AtomicBool::new(false));
        let ran_by_handler = ran.clone();
        let outcome = agent
            .invoke(
                InvocationRequest::builder()
                    .function_name("blocked-fn".to_string())
                    .build(),
                move |_completion| async move {
                    ran_by_handler.store(true, Ordering::SeqCst);
                    Ok(json!(null))
                },
            )
            .await;

        assert!(matches!(outcome, Err(AgentError::SecurityBlocked(_))));
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(counters.initialized.load(Ordering::SeqCst), 1);

        let batches = transport.batches();
        assert_eq!(batches.len(), 1);
        let data = invocation_data(&batches[0][0]);
        assert!(data.erroneous);
        assert_eq!(data.error_type.as_deref(), Some("SecurityError"));
    }

    #[tokio::test]
    #[serial]
    async fn test_cold_start_only_on_first_invocation() {
        let (agent, transport) = test_agent(AgentConfig::default());

        for _ in 0..2 {
            agent
                .invoke(InvocationRequest::default(), |_completion| async {
                    Ok(json!(null))
                })
                .await
                .unwrap();
        }

        let batches = transport.batches();
        assert_eq!(batches.len(), 2);
        assert!(invocation_data(&batches[0][0]).cold_start);
        assert!(!invocation_data(&batches[1][0]).cold_start);
    }

    #[tokio::test]
    #[serial]
    async fn test_plugin_after_failure_is_isolated() {
        let (failing, counters) = RecordingPlugin::failing();
        let (agent, transport) = test_agent_with(
            AgentConfig::default(),
            SpanListenerRegistry::new(),
            vec![Box::new(failing)],
        );

        let outcome = agent
            .invoke(InvocationRequest::default(), |_completion| async {
                Ok(json!("fine"))
            })
            .await;

        assert_eq!(outcome.unwrap(), json!("fine"));
        assert_eq!(counters.after_calls.load(Ordering::SeqCst), 1);
        // Reports still shipped despite the failing plugin.
        assert_eq!(transport.batches().len(), 1);
    }

    #[tokio::test]
    #[serial]
    async fn test_spawned_task_spans_join_the_trace() {
        let (agent, transport) = test_agent(AgentConfig::default());

        let outcome = agent
            .invoke(
                InvocationRequest::builder()
                    .function_name("fan-out".to_string())
                    .build(),
                |_completion| async {
                    let context = ExecutionContextManager::get();
                    let task = tokio::spawn(
                        async {
                            let context = ExecutionContextManager::get();
                            let span = context.tracer().start_span("background");
                            tokio::task::yield_now().await;
                            span.finish();
                        }
                        .with_execution_context(context),
                    );
                    task.await.map_err(|e| Box::new(e) as BoxError)?;
                    Ok(json!("done"))
                },
            )
            .await;
        assert!(outcome.is_ok());

        let batches = transport.batches();
        let audit = audit_data(&batches[0][1]);
        assert_eq!(audit.root_span.children.len(), 1);
        assert_eq!(audit.root_span.children[0].operation_name, "background");
    }

    #[tokio::test]
    #[serial]
    async fn test_security_listener_from_config_blocks_invocation() {
        let listener_json = r#"[
            {
                "type": "SecurityAwareSpanListener",
                "config": {
                    "block": true,
                    "blacklist": [{"operationName": "orders-fn"}]
                }
            }
        ]"#;
        let config = AgentConfig::builder()
            .span_listener_json(listener_json.to_string())
            .build();
        let (agent, transport) = test_agent(config);

        let outcome = agent
            .invoke(
                InvocationRequest::builder()
                    .function_name("orders-fn".to_string())
                    .build(),
                |_completion| async { Ok(json!("unreachable")) },
            )
            .await;

        assert!(matches!(outcome, Err(AgentError::SecurityBlocked(_))));
        let batches = transport.batches();
        let data = invocation_data(&batches[0][0]);
        assert_eq!(data.error_type.as_deref(), Some("SecurityError"));

        // The root span carries the violation tags.
        let audit = audit_data(&batches[0][1]);
        assert_eq!(
            audit.root_span.tags.get("security.blocked"),
            Some(&crate::tag::TagValue::Bool(true))
        );
    }

    #[test]
    #[serial]
    fn test_unknown_listener_type_is_a_config_error() {
        crate::config::clear_agent_env();
        let config = AgentConfig::builder()
            .span_listener_json(r#"[{"type": "FancyListener"}]"#.to_string())
            .build();
        assert!(matches!(init_agent(config), Err(AgentError::Config(_))));
    }

    #[test]
    #[serial]
    fn test_invalid_collector_url_fails_init() {
        crate::config::clear_agent_env();
        let config = AgentConfig::builder()
            .collector_url("not a url".to_string())
            .build();
        assert!(matches!(init_agent(config), Err(AgentError::Config(_))));
    }
}
