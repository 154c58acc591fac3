//! Invocation summary plugin.
//!
//! Queues one [`InvocationData`] report per invocation: timing, cold start,
//! timeout, error summary and user tags. This report is always emitted, even
//! when traces, metrics and logs are disabled.

use crate::config::AgentConfig;
use crate::context::ExecutionContext;
use crate::error::AgentError;
use crate::plugin::Plugin;
use crate::report::{InvocationData, Report, ReportData};
use crate::span::epoch_millis_now;
use async_trait::async_trait;
use std::sync::Arc;

pub(crate) const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug)]
pub struct InvocationPlugin {
    application_name: String,
    application_stage: String,
    application_domain_name: String,
    application_class_name: String,
    api_key: String,
}

impl InvocationPlugin {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            application_name: config.resolved_application_name().to_string(),
            application_stage: config.application_stage.clone(),
            application_domain_name: config.application_domain_name.clone(),
            application_class_name: config.application_class_name.clone(),
            api_key: config.api_key.clone(),
        }
    }
}

#[async_trait]
impl Plugin for InvocationPlugin {
    fn name(&self) -> &'static str {
        "invocation"
    }

    async fn before_invocation(&self, _context: &Arc<ExecutionContext>) -> Result<(), AgentError> {
        Ok(())
    }

    async fn after_invocation(&self, context: &Arc<ExecutionContext>) -> Result<(), AgentError> {
        let finish_timestamp = context.finish_timestamp().unwrap_or_else(epoch_millis_now);
        let error = context.error();
        let data = InvocationData {
            trace_id: context.trace_id(),
            transaction_id: context.transaction_id(),
            application_name: self.application_name.clone(),
            application_stage: self.application_stage.clone(),
            application_domain_name: self.application_domain_name.clone(),
            application_class_name: self.application_class_name.clone(),
            agent_version: AGENT_VERSION.to_string(),
            request_id: context.invocation().request_id.clone(),
            start_timestamp: context.start_timestamp(),
            finish_timestamp,
            duration: finish_timestamp.saturating_sub(context.start_timestamp()),
            cold_start: context.cold_start(),
            timeout: context.timed_out(),
            erroneous: error.is_some(),
            error_type: error.as_ref().map(|e| e.error_type.clone()),
            error_message: error.as_ref().map(|e| e.error_message.clone()),
            tags: context.user_tags(),
        };
        context.add_report(Report::new(ReportData::Invocation(data), &self.api_key));
        Ok(())
    }
}
