//! Plugin seam for invocation lifecycle hooks.
//!
//! A [`Plugin`] observes one invocation from both ends: `before_invocation`
//! runs after the execution context is installed and before user code,
//! `after_invocation` runs once completion is decided, before the queued
//! reports are sent. The built-in plugins
//! ([`InvocationPlugin`](crate::invocation::InvocationPlugin),
//! [`TracePlugin`](crate::trace::TracePlugin),
//! [`MetricPlugin`](crate::metric::MetricPlugin),
//! [`LogPlugin`](crate::log::LogPlugin)) queue one report kind each.
//!
//! Hook failures are logged by the controller and never abort the
//! invocation or the other plugins.

use crate::context::ExecutionContext;
use crate::error::AgentError;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait Plugin: Send + Sync {
    /// Stable name used in hook failure logs.
    fn name(&self) -> &'static str;

    async fn before_invocation(&self, context: &Arc<ExecutionContext>) -> Result<(), AgentError>;

    async fn after_invocation(&self, context: &Arc<ExecutionContext>) -> Result<(), AgentError>;
}
