//! Trace plugin: root span lifecycle and the span-tree report.
//!
//! `before_invocation` starts the invocation's root span and runs the
//! listener initialization pass over it; a veto there aborts the invocation
//! before user code runs (the span is still finished and reported, carrying
//! whatever tags the vetoing listener set). `after_invocation` finishes the
//! root span, copies the invocation error onto it if no span-level error is
//! already recorded, and queues one [`AuditData`] report holding the whole
//! span tree.

use crate::config::AgentConfig;
use crate::context::ExecutionContext;
use crate::error::AgentError;
use crate::plugin::Plugin;
use crate::report::{AuditData, Report, ReportData, SpanNode};
use crate::span::epoch_millis_now;
use crate::tracer::SpanOptions;
use async_trait::async_trait;
use std::sync::Arc;

#[derive(Debug)]
pub struct TracePlugin {
    application_domain_name: String,
    application_class_name: String,
    api_key: String,
}

impl TracePlugin {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            application_domain_name: config.application_domain_name.clone(),
            application_class_name: config.application_class_name.clone(),
            api_key: config.api_key.clone(),
        }
    }
}

#[async_trait]
impl Plugin for TracePlugin {
    fn name(&self) -> &'static str {
        "trace"
    }

    async fn before_invocation(&self, context: &Arc<ExecutionContext>) -> Result<(), AgentError> {
        let operation_name = context
            .invocation()
            .function_name
            .clone()
            .unwrap_or_else(|| "invocation".to_string());

        let root = context.tracer().start_span_with(
            &operation_name,
            SpanOptions::builder()
                .class_name(self.application_class_name.clone())
                .domain_name(self.application_domain_name.clone())
                .build(),
        );

        if let Err(veto) = context.tracer().initialize_span(&root) {
            root.finish();
            context.set_root_span(root);
            return Err(veto);
        }

        context.set_root_span(root);
        Ok(())
    }

    async fn after_invocation(&self, context: &Arc<ExecutionContext>) -> Result<(), AgentError> {
        let Some(root) = context.root_span() else {
            return Ok(());
        };

        let finish_timestamp = context.finish_timestamp().unwrap_or_else(epoch_millis_now);
        root.finish_at(finish_timestamp);

        if let Some(error) = context.error() {
            if !root.is_erroneous() {
                root.set_error_tags(&error.error_type, &error.error_message);
            }
        }

        let Some(tree) = context
            .tracer()
            .recorder()
            .span_tree_from(root.context().span_id())
        else {
            return Ok(());
        };

        let data = AuditData {
            trace_id: context.trace_id(),
            transaction_id: context.transaction_id(),
            start_timestamp: context.start_timestamp(),
            finish_timestamp,
            root_span: SpanNode::from_tree(&tree),
        };
        context.add_report(Report::new(ReportData::Audit(data), &self.api_key));
        Ok(())
    }
}
