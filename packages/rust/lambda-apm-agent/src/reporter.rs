//! Report delivery.
//!
//! [`Reporter`] ships one invocation's queued reports as a single JSON array
//! POSTed to `{collector_url}/monitor-datas` with an `Authorization: ApiKey
//! {key}` header. Delivery failures never reach the invocation: a
//! reset-class failure is retried exactly once, everything else is logged
//! and the batch is dropped. With `report_stdout` enabled the HTTP path is
//! bypassed entirely and each report is written to stdout as one JSON line.

use crate::config::AgentConfig;
use crate::constants::wire;
use crate::error::AgentError;
use crate::logger::Logger;
use crate::report::Report;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

static LOGGER: Logger = Logger::const_new("reporter");

/// Delivery seam between the reporter and the wire.
#[async_trait]
pub trait ReportTransport: Send + Sync + fmt::Debug {
    async fn send(&self, reports: &[Report]) -> Result<(), AgentError>;
}

/// POSTs report batches to the collector.
#[derive(Debug)]
pub struct HttpReportTransport {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl HttpReportTransport {
    pub fn new(config: &AgentConfig) -> Self {
        let endpoint = format!(
            "{}{}",
            config.collector_url.trim_end_matches('/'),
            wire::MONITOR_DATA_PATH
        );
        Self {
            client: reqwest::Client::new(),
            endpoint,
            api_key: config.api_key.clone(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ReportTransport for HttpReportTransport {
    async fn send(&self, reports: &[Report]) -> Result<(), AgentError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("{} {}", wire::API_KEY_AUTH_SCHEME, self.api_key),
            )
            .json(reports)
            .send()
            .await
            .map_err(|e| AgentError::Transport {
                message: e.to_string(),
                retriable: e.is_connect() || e.is_timeout(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(AgentError::Transport {
                message: format!("collector returned {status}"),
                retriable: false,
            });
        }
        Ok(())
    }
}

/// Line sink for stdout mode.
trait Output: Send + Sync + fmt::Debug {
    fn write_line(&self, line: &str);
}

#[derive(Debug, Default)]
struct StdOutput;

impl Output for StdOutput {
    fn write_line(&self, line: &str) {
        println!("{line}");
    }
}

#[cfg(test)]
#[derive(Debug, Default)]
struct TestOutput {
    buffer: std::sync::Mutex<Vec<String>>,
}

#[cfg(test)]
impl TestOutput {
    fn new() -> Self {
        Self::default()
    }

    fn get_output(&self) -> Vec<String> {
        self.buffer.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl Output for TestOutput {
    fn write_line(&self, line: &str) {
        self.buffer.lock().unwrap().push(line.to_string());
    }
}

pub struct Reporter {
    transport: Arc<dyn ReportTransport>,
    stdout_output: Option<Arc<dyn Output>>,
}

impl fmt::Debug for Reporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reporter")
            .field("transport", &self.transport)
            .field("stdout", &self.stdout_output.is_some())
            .finish()
    }
}

impl Reporter {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            transport: Arc::new(HttpReportTransport::new(config)),
            stdout_output: config
                .report_stdout
                .then(|| Arc::new(StdOutput) as Arc<dyn Output>),
        }
    }

    /// Reporter over a custom transport.
    pub fn with_transport(transport: Arc<dyn ReportTransport>) -> Self {
        Self {
            transport,
            stdout_output: None,
        }
    }

    #[cfg(test)]
    fn with_test_output(transport: Arc<dyn ReportTransport>) -> (Self, Arc<TestOutput>) {
        let output = Arc::new(TestOutput::new());
        let reporter = Self {
            transport,
            stdout_output: Some(output.clone() as Arc<dyn Output>),
        };
        (reporter, output)
    }

    /// Deliver one invocation's batch. Never returns an error: failures are
    /// logged and the batch is dropped.
    pub async fn report(&self, reports: Vec<Report>) {
        if reports.is_empty() {
            return;
        }

        if let Some(output) = &self.stdout_output {
            for report in &reports {
                match serde_json::to_string(report) {
                    Ok(line) => output.write_line(&line),
                    Err(e) => LOGGER.warn(format!("failed to serialize report: {e}")),
                }
            }
            return;
        }

        match self.transport.send(&reports).await {
            Ok(()) => LOGGER.debug(format!("sent {} reports", reports.len())),
            Err(first) if first.is_retriable() => {
                LOGGER.warn(format!("report delivery failed ({first}), retrying once"));
                if let Err(second) = self.transport.send(&reports).await {
                    LOGGER.error(format!(
                        "dropping {} reports after retry: {second}",
                        reports.len()
                    ));
                }
            }
            Err(e) => LOGGER.error(format!("dropping {} reports: {e}", reports.len())),
        }
    }
}
