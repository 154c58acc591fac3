//! In-process APM instrumentation for serverless functions.
//!
//! This crate instruments one handler invocation at a time: it builds a span
//! tree for the work the handler does, watches the invocation's lifecycle
//! (including completions racing a timeout guard), and ships everything to an
//! APM collector as a single batched POST when the invocation ends.
//!
//! # Features
//!
//! - **Causal context propagation**: spans created anywhere in the
//!   invocation's async call tree land in the right trace without passing a
//!   context parameter around
//! - **Exactly-once completion**: handler return, explicit success/failure
//!   callbacks, and the timeout guard race for a single completion gate, so
//!   an invocation is never reported twice
//! - **Span listeners**: filterable hooks over span start/finish, with
//!   built-in security screening, latency/error injection, and bridging into
//!   external APM SDKs
//! - **Batched delivery**: invocation, trace, metric, and log reports leave
//!   in one request, with a single retry on connection-reset class failures
//!   and an NDJSON stdout mode for log-pipeline setups
//!
//! # Architecture
//!
//! - [`agent`]: lifecycle controller and the public entry point
//! - [`context`] / [`context_manager`]: per-invocation state and its
//!   task-local propagation
//! - [`tracer`] / [`span`] / [`recorder`]: span creation and the in-memory
//!   span store
//! - [`listener`], [`security`], [`chaos`], [`bridge`]: the span listener
//!   pipeline and its built-in listeners
//! - [`invocation`], [`trace`], [`metric`], [`log`]: plugins producing the
//!   report types in [`report`]
//! - [`reporter`]: batching transport to the collector
//!
//! # Quick Start
//!
//! ```no_run
//! use lambda_apm_agent::{init_agent, AgentConfig, ExecutionContextManager, InvocationRequest};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let agent = init_agent(AgentConfig::from_env())?;
//!
//!     let request = InvocationRequest::builder()
//!         .function_name("checkout".to_string())
//!         .build();
//!
//!     let response = agent
//!         .invoke(request, |_completion| async {
//!             let context = ExecutionContextManager::get();
//!             let span = context.tracer().start_span("charge-card");
//!             // ... user work ...
//!             span.finish();
//!             Ok(json!({"status": "ok"}))
//!         })
//!         .await?;
//!
//!     println!("{response}");
//!     Ok(())
//! }
//! ```
//!
//! # Configuration
//!
//! Programmatic configuration goes through [`AgentConfig::builder`]; the
//! `APM_AGENT_*` environment variables override it (see
//! [`constants::env_vars`]). The ones most deployments set:
//!
//! - `APM_AGENT_API_KEY`: collector credential
//! - `APM_AGENT_COLLECTOR_URL`: collector base URL
//! - `APM_AGENT_REPORT_STDOUT_ENABLE`: write reports to stdout as NDJSON
//!   instead of posting them
//! - `APM_AGENT_SPAN_LISTENERS`: JSON array of span listener descriptors
//! - `APM_AGENT_TRACE_DISABLE` / `APM_AGENT_METRIC_DISABLE` /
//!   `APM_AGENT_LOG_DISABLE`: turn individual report types off
//!
//! # Span Listeners
//!
//! Listeners observe every span and may veto an operation at initialization.
//! They can be registered programmatically on a
//! [`SpanListenerRegistry`] or declared as JSON:
//!
//! ```json
//! [
//!   {
//!     "type": "FilteringSpanListener",
//!     "config": {
//!       "listener": {"type": "LatencyInjectorSpanListener", "config": {"delayMs": 300}},
//!       "filters": [{"className": "HTTP", "operationName": "checkout"}]
//!     }
//!   }
//! ]
//! ```
//!
//! See [`listener`] for the descriptor format and [`security`], [`chaos`],
//! and [`bridge`] for the built-in listeners.

pub mod agent;
pub mod bridge;
pub mod chaos;
pub mod config;
pub mod constants;
pub mod context;
pub mod context_manager;
pub mod error;
pub mod invocation;
pub mod listener;
pub mod log;
pub mod logger;
pub mod metric;
pub mod plugin;
pub mod recorder;
pub mod report;
pub mod reporter;
pub mod sampler;
pub mod security;
pub mod span;
pub mod tag;
pub mod trace;
pub mod tracer;

pub use agent::{init_agent, Agent, CompletionHandle};
pub use config::AgentConfig;
pub use context::{ErrorInfo, ExecutionContext, InvocationRequest};
pub use context_manager::{ContextFutureExt, ExecutionContextManager};
pub use error::{AgentError, BoxError};
pub use listener::{FilteringSpanListener, SpanFilter, SpanListener, SpanListenerRegistry};
pub use plugin::Plugin;
pub use span::Span;
pub use tag::TagValue;
pub use tracer::Tracer;

#[cfg(doctest)]
#[macro_use]
extern crate doc_comment;

#[cfg(doctest)]
use doc_comment::doctest;

#[cfg(doctest)]
doctest!("../README.md", readme);
