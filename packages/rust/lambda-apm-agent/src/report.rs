//! Wire types for collector reports.
//!
//! Every monitoring record travels in the same envelope:
//!
//! ```json
//! {
//!   "type": "InvocationData",
//!   "data": { ... },
//!   "apiKey": "...",
//!   "dataFormatVersion": "2.0"
//! }
//! ```
//!
//! The `type`/`data` pair is the [`ReportData`] enum serialized with adjacent
//! tagging and flattened into the envelope. Payload field names are camelCase
//! and all timestamps are epoch milliseconds.

use crate::constants::wire;
use crate::recorder::SpanTreeNode;
use crate::span::SpanLog;
use crate::tag::TagValue;
use serde::Serialize;
use std::collections::HashMap;
use uuid::Uuid;

/// One report envelope, ready for transmission.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    #[serde(flatten)]
    pub data: ReportData,
    pub api_key: String,
    pub data_format_version: String,
}

impl Report {
    pub fn new(data: ReportData, api_key: impl Into<String>) -> Self {
        Self {
            data,
            api_key: api_key.into(),
            data_format_version: wire::DATA_FORMAT_VERSION.to_string(),
        }
    }

    /// The envelope's wire `type` discriminant.
    pub fn data_type(&self) -> &'static str {
        match &self.data {
            ReportData::Invocation(_) => "InvocationData",
            ReportData::Audit(_) => "AuditData",
            ReportData::Stat(_) => "StatData",
            ReportData::Log(_) => "LogData",
        }
    }
}

/// Typed report payloads, tagged the way the collector expects.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum ReportData {
    #[serde(rename = "InvocationData")]
    Invocation(InvocationData),
    #[serde(rename = "AuditData")]
    Audit(AuditData),
    #[serde(rename = "StatData")]
    Stat(StatData),
    #[serde(rename = "LogData")]
    Log(LogData),
}

/// Invocation summary, one per invocation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationData {
    pub trace_id: Uuid,
    pub transaction_id: Uuid,
    pub application_name: String,
    pub application_stage: String,
    pub application_domain_name: String,
    pub application_class_name: String,
    pub agent_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub start_timestamp: u64,
    pub finish_timestamp: u64,
    pub duration: u64,
    pub cold_start: bool,
    pub timeout: bool,
    pub erroneous: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub tags: HashMap<String, TagValue>,
}

/// Span tree for one invocation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditData {
    pub trace_id: Uuid,
    pub transaction_id: Uuid,
    pub start_timestamp: u64,
    pub finish_timestamp: u64,
    pub root_span: SpanNode,
}

/// Serialized span with its children, preserving the creation-time tree.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpanNode {
    pub id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<Uuid>,
    pub operation_name: String,
    pub class_name: String,
    pub domain_name: String,
    pub start_timestamp: u64,
    /// Missing when the span never finished before the report was assembled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_timestamp: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, TagValue>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<SpanLog>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<SpanNode>,
}

impl SpanNode {
    /// Materialize a recorder tree snapshot into its wire form.
    pub fn from_tree(node: &SpanTreeNode) -> Self {
        let span = &node.span;
        Self {
            id: span.context().span_id(),
            parent_span_id: span.context().parent_span_id(),
            operation_name: span.operation_name().to_string(),
            class_name: span.class_name().to_string(),
            domain_name: span.domain_name().to_string(),
            start_timestamp: span.start_time(),
            finish_timestamp: span.finish_time(),
            duration: span.duration(),
            tags: span.tags(),
            logs: span.logs(),
            children: node.children.iter().map(SpanNode::from_tree).collect(),
        }
    }
}

/// Resource gauges and span aggregates for one invocation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatData {
    pub trace_id: Uuid,
    pub transaction_id: Uuid,
    pub stat_timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_stats: Option<ProcessStats>,
    pub span_usages: Vec<SpanUsage>,
}

/// Process-level gauges sampled around the invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessStats {
    pub rss_bytes: u64,
    pub cpu_user_ms: u64,
    pub cpu_system_ms: u64,
}

/// Aggregate over finished spans sharing a class and operation name.
///
/// Rows appear in the order their first member span finished.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SpanUsage {
    pub class_name: String,
    pub operation_name: String,
    pub count: u64,
    pub error_count: u64,
    pub total_duration_ms: u64,
}

/// One captured application log record.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogData {
    pub trace_id: Uuid,
    pub transaction_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span_id: Option<Uuid>,
    pub log_level: String,
    pub log_context_name: String,
    pub log_message: String,
    pub log_timestamp: u64,
}
