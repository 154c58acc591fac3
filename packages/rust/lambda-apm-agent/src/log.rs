//! Log plugin: ships logs captured during the invocation.
//!
//! Application code hands records to
//! [`ExecutionContext::capture_log`](crate::context::ExecutionContext::capture_log)
//! (directly or through the agent façade); this plugin turns each captured
//! record into one [`LogData`] report, attributed to the span that was
//! active at capture time.
//!
//! A sampler attached with [`LogPlugin::with_sampler`] gates emission per
//! invocation, so logs can be shipped for erroneous invocations only.

use crate::config::AgentConfig;
use crate::context::ExecutionContext;
use crate::error::AgentError;
use crate::plugin::Plugin;
use crate::report::{LogData, Report, ReportData};
use crate::sampler::Sampler;
use async_trait::async_trait;
use std::sync::Arc;

pub struct LogPlugin {
    api_key: String,
    sampler: Option<Box<dyn Sampler>>,
}

impl LogPlugin {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            api_key: config.api_key.clone(),
            sampler: None,
        }
    }

    /// Gate log emission behind a sampler decision.
    pub fn with_sampler(config: &AgentConfig, sampler: Box<dyn Sampler>) -> Self {
        Self {
            sampler: Some(sampler),
            ..Self::new(config)
        }
    }
}

impl std::fmt::Debug for LogPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogPlugin")
            .field("sampled", &self.sampler.is_some())
            .finish()
    }
}

#[async_trait]
impl Plugin for LogPlugin {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn before_invocation(&self, _context: &Arc<ExecutionContext>) -> Result<(), AgentError> {
        Ok(())
    }

    async fn after_invocation(&self, context: &Arc<ExecutionContext>) -> Result<(), AgentError> {
        if let Some(sampler) = &self.sampler {
            if !sampler.should_sample(context) {
                return Ok(());
            }
        }
        for log in context.captured_logs() {
            let data = LogData {
                trace_id: context.trace_id(),
                transaction_id: context.transaction_id(),
                span_id: log.span_id,
                log_level: log.level,
                log_context_name: log.source,
                log_message: log.message,
                log_timestamp: log.timestamp,
            };
            context.add_report(Report::new(ReportData::Log(data), &self.api_key));
        }
        Ok(())
    }
}
