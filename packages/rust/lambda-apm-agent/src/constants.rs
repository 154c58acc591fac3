//! Constants for the lambda-apm-agent package.
//!
//! This file centralizes all constants to ensure consistency across the codebase
//! and provide a single source of truth for configuration parameters.

/// Environment variable names for configuration.
pub mod env_vars {
    /// API key used to authenticate against the collector.
    pub const API_KEY: &str = "APM_AGENT_API_KEY";

    /// Base URL of the collector (without the monitoring path).
    pub const COLLECTOR_URL: &str = "APM_AGENT_COLLECTOR_URL";

    /// Write reports to stdout as NDJSON instead of posting to the collector.
    /// Set to "true" to enable.
    pub const REPORT_STDOUT_ENABLE: &str = "APM_AGENT_REPORT_STDOUT_ENABLE";

    /// Milliseconds subtracted from the invocation time budget when scheduling
    /// the timeout guard.
    pub const TIMEOUT_MARGIN_MS: &str = "APM_AGENT_TIMEOUT_MARGIN_MS";

    /// Application name reported with every invocation (falls back to the
    /// function name).
    pub const APPLICATION_NAME: &str = "APM_AGENT_APPLICATION_NAME";

    /// Domain name stamped on root spans.
    pub const APPLICATION_DOMAIN_NAME: &str = "APM_AGENT_APPLICATION_DOMAIN_NAME";

    /// Class name stamped on root spans.
    pub const APPLICATION_CLASS_NAME: &str = "APM_AGENT_APPLICATION_CLASS_NAME";

    /// Application stage (e.g. dev, staging, prod) reported with invocations.
    pub const APPLICATION_STAGE: &str = "APM_AGENT_APPLICATION_STAGE";

    /// Disable the trace plugin. Set to "true" to stop emitting trace reports.
    pub const TRACE_DISABLE: &str = "APM_AGENT_TRACE_DISABLE";

    /// Disable the metric plugin.
    pub const METRIC_DISABLE: &str = "APM_AGENT_METRIC_DISABLE";

    /// Disable the log plugin.
    pub const LOG_DISABLE: &str = "APM_AGENT_LOG_DISABLE";

    /// JSON array of span listener descriptors parsed at agent init.
    pub const SPAN_LISTENERS: &str = "APM_AGENT_SPAN_LISTENERS";

    /// Count-aware sampling frequency for metric reports (every Nth invocation).
    pub const METRIC_SAMPLE_COUNT_FREQ: &str = "APM_AGENT_METRIC_SAMPLE_COUNT_FREQ";

    /// AWS Lambda function name (used as fallback application name).
    pub const AWS_LAMBDA_FUNCTION_NAME: &str = "AWS_LAMBDA_FUNCTION_NAME";

    /// Log level for the agent's own diagnostics (none, error, warn, info, debug).
    pub const LOG_LEVEL: &str = "APM_AGENT_LOG_LEVEL";
}

/// Default values for configuration parameters.
pub mod defaults {
    use std::time::Duration;

    /// Default collector base URL.
    pub const COLLECTOR_URL: &str = "https://collector.lambda-apm.dev/v1";

    /// Default timeout guard margin.
    pub const TIMEOUT_MARGIN: Duration = Duration::from_millis(200);

    /// Default domain name for root spans.
    pub const APPLICATION_DOMAIN_NAME: &str = "API";

    /// Default class name for root spans.
    pub const APPLICATION_CLASS_NAME: &str = "Handler";

    /// Default application stage.
    pub const APPLICATION_STAGE: &str = "";

    /// Default application name when neither config nor environment provide one.
    pub const APPLICATION_NAME: &str = "unknown_application";

    /// Default for the stdout report bypass.
    pub const REPORT_STDOUT_ENABLE: bool = false;
}

/// Wire-level constants shared by the report types and the reporter.
pub mod wire {
    /// Version stamped on every report envelope.
    pub const DATA_FORMAT_VERSION: &str = "2.0";

    /// Path appended to the collector base URL for report submission.
    pub const MONITOR_DATA_PATH: &str = "/monitor-datas";

    /// Authorization scheme expected by the collector.
    pub const API_KEY_AUTH_SCHEME: &str = "ApiKey";
}

/// Well-known tag keys set by the agent and its listeners.
pub mod tags {
    /// Marks a span as erroneous.
    pub const ERROR: &str = "error";

    /// Error kind (type name) recorded on erroneous spans.
    pub const ERROR_KIND: &str = "error.kind";

    /// Human-readable error message recorded on erroneous spans.
    pub const ERROR_MESSAGE: &str = "error.message";

    /// Set by the security listener when a span matches a deny rule.
    pub const SECURITY_BLOCKED: &str = "security.blocked";

    /// Set by the security listener alongside the blocked/violated verdict.
    pub const SECURITY_VIOLATED: &str = "security.violated";
}
