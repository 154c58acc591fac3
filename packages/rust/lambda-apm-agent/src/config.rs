//! Agent configuration.
//!
//! [`AgentConfig`] carries every tunable. Values can be set programmatically
//! through the builder, but the environment takes precedence over
//! programmatic configuration: [`AgentConfig::resolve`] overlays the
//! `APM_AGENT_*` variables onto the struct, and
//! [`init_agent`](crate::agent::init_agent) calls it for you. Invalid
//! environment values are logged and ignored rather than failing the agent.
//!
//! # Example
//!
//! ```no_run
//! use lambda_apm_agent::config::AgentConfig;
//! use std::time::Duration;
//!
//! let config = AgentConfig::builder()
//!     .api_key("key-123".to_string())
//!     .timeout_margin(Duration::from_millis(500))
//!     .application_name("checkout".to_string())
//!     .build();
//! ```

use crate::constants::{defaults, env_vars};
use crate::error::AgentError;
use crate::logger::Logger;
use bon::Builder;
use std::env;
use std::time::Duration;

static LOGGER: Logger = Logger::const_new("config");

fn env_string(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.is_empty())
}

fn env_bool(name: &str) -> Option<bool> {
    let value = env_string(name)?;
    match value.to_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        other => {
            LOGGER.warn(format!("{name}: invalid boolean '{other}', ignoring"));
            None
        }
    }
}

fn env_u64(name: &str) -> Option<u64> {
    let value = env_string(name)?;
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            LOGGER.warn(format!("{name}: invalid integer '{value}', ignoring"));
            None
        }
    }
}

/// Configuration for [`init_agent`](crate::agent::init_agent).
#[derive(Builder, Debug, Clone)]
pub struct AgentConfig {
    /// Credential sent with every report (`Authorization: ApiKey ...`).
    #[builder(default = String::new())]
    pub api_key: String,

    /// Collector base URL; reports go to `{collector_url}/monitor-datas`.
    #[builder(default = defaults::COLLECTOR_URL.to_string())]
    pub collector_url: String,

    /// Write reports to stdout as NDJSON instead of posting them.
    #[builder(default = defaults::REPORT_STDOUT_ENABLE)]
    pub report_stdout: bool,

    /// Safety margin subtracted from the invocation budget when scheduling
    /// the timeout guard.
    #[builder(default = defaults::TIMEOUT_MARGIN)]
    pub timeout_margin: Duration,

    /// Application name on invocation reports. Falls back to the
    /// `AWS_LAMBDA_FUNCTION_NAME` environment variable when unset.
    pub application_name: Option<String>,

    /// Deployment stage label (e.g. "staging").
    #[builder(default = defaults::APPLICATION_STAGE.to_string())]
    pub application_stage: String,

    /// Domain name stamped on root spans.
    #[builder(default = defaults::APPLICATION_DOMAIN_NAME.to_string())]
    pub application_domain_name: String,

    /// Class name stamped on root spans.
    #[builder(default = defaults::APPLICATION_CLASS_NAME.to_string())]
    pub application_class_name: String,

    /// Emit trace (span tree) reports.
    #[builder(default = true)]
    pub trace_enabled: bool,

    /// Emit metric (stat) reports.
    #[builder(default = true)]
    pub metric_enabled: bool,

    /// Emit captured-log reports.
    #[builder(default = true)]
    pub log_enabled: bool,

    /// JSON array of span listener descriptors, parsed at init.
    pub span_listener_json: Option<String>,

    /// Emit metric reports only every Nth invocation.
    pub metric_sample_count_freq: Option<u64>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl AgentConfig {
    /// Configuration from environment variables alone.
    pub fn from_env() -> Self {
        Self::default().resolve()
    }

    /// Overlay environment variables onto this configuration.
    ///
    /// Set variables win over programmatic values; unset or invalid ones
    /// leave the struct untouched.
    pub fn resolve(mut self) -> Self {
        if let Some(api_key) = env_string(env_vars::API_KEY) {
            self.api_key = api_key;
        }
        if let Some(collector_url) = env_string(env_vars::COLLECTOR_URL) {
            self.collector_url = collector_url;
        }
        if let Some(report_stdout) = env_bool(env_vars::REPORT_STDOUT_ENABLE) {
            self.report_stdout = report_stdout;
        }
        if let Some(margin_ms) = env_u64(env_vars::TIMEOUT_MARGIN_MS) {
            self.timeout_margin = Duration::from_millis(margin_ms);
        }
        self.application_name = env_string(env_vars::APPLICATION_NAME)
            .or(self.application_name.take())
            .or_else(|| env_string(env_vars::AWS_LAMBDA_FUNCTION_NAME));
        if let Some(stage) = env_string(env_vars::APPLICATION_STAGE) {
            self.application_stage = stage;
        }
        if let Some(domain_name) = env_string(env_vars::APPLICATION_DOMAIN_NAME) {
            self.application_domain_name = domain_name;
        }
        if let Some(class_name) = env_string(env_vars::APPLICATION_CLASS_NAME) {
            self.application_class_name = class_name;
        }
        if let Some(disabled) = env_bool(env_vars::TRACE_DISABLE) {
            self.trace_enabled = !disabled;
        }
        if let Some(disabled) = env_bool(env_vars::METRIC_DISABLE) {
            self.metric_enabled = !disabled;
        }
        if let Some(disabled) = env_bool(env_vars::LOG_DISABLE) {
            self.log_enabled = !disabled;
        }
        if let Some(listener_json) = env_string(env_vars::SPAN_LISTENERS) {
            self.span_listener_json = Some(listener_json);
        }
        if let Some(freq) = env_u64(env_vars::METRIC_SAMPLE_COUNT_FREQ) {
            self.metric_sample_count_freq = Some(freq);
        }
        self
    }

    /// Reported application name after fallbacks.
    pub fn resolved_application_name(&self) -> &str {
        self.application_name
            .as_deref()
            .unwrap_or(defaults::APPLICATION_NAME)
    }

    /// Check invariants that would make the agent useless at runtime.
    pub fn validate(&self) -> Result<(), AgentError> {
        url::Url::parse(&self.collector_url).map_err(|e| {
            AgentError::Config(format!(
                "collector url '{}' is not a valid URL: {e}",
                self.collector_url
            ))
        })?;
        if self.api_key.is_empty() && !self.report_stdout {
            LOGGER.warn("no api key configured; the collector will reject reports");
        }
        Ok(())
    }
}

/// Remove every agent-related environment variable. Tests that touch the
/// environment run under `#[serial]` and start from this clean slate.
#[cfg(test)]
pub(crate) fn clear_agent_env() {
    for name in [
        env_vars::API_KEY,
        env_vars::COLLECTOR_URL,
        env_vars::REPORT_STDOUT_ENABLE,
        env_vars::TIMEOUT_MARGIN_MS,
        env_vars::APPLICATION_NAME,
        env_vars::APPLICATION_STAGE,
        env_vars::APPLICATION_DOMAIN_NAME,
        env_vars::APPLICATION_CLASS_NAME,
        env_vars::TRACE_DISABLE,
        env_vars::METRIC_DISABLE,
        env_vars::LOG_DISABLE,
        env_vars::SPAN_LISTENERS,
        env_vars::METRIC_SAMPLE_COUNT_FREQ,
        env_vars::AWS_LAMBDA_FUNCTION_NAME,
    ] {
        std::env::remove_var(name);
    }
}
