//! Error types for lambda-apm-agent.
//!
//! [`AgentError`] covers every failure the agent itself can produce. User
//! handler failures keep their own type and travel through the lifecycle as
//! [`BoxError`]; the agent records them but never converts or retries them.

use thiserror::Error;

/// Boxed error type accepted from user handlers and completion paths.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors produced by the agent.
#[derive(Error, Debug)]
pub enum AgentError {
    /// A failure surfaced by user code, recorded on the invocation.
    #[error("user code failed: {0}")]
    UserCode(#[from] BoxError),

    /// Report transmission failed. `retriable` marks reset-class failures
    /// that qualify for the reporter's single retry.
    #[error("transport error: {message}")]
    Transport { message: String, retriable: bool },

    /// Synthesized by the timeout guard when the invocation exceeds its
    /// budget minus the configured margin.
    #[error("invocation timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    /// The security listener refused to let the operation run.
    #[error("operation blocked by security policy: {0}")]
    SecurityBlocked(String),

    /// The security listener flagged the operation without blocking it.
    #[error("operation violated security policy: {0}")]
    SecurityViolated(String),

    /// A failure synthesized by the error injector listener.
    #[error("injected failure: {0}")]
    Injected(String),

    /// Bad agent configuration (environment or builder).
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl AgentError {
    /// Whether the reporter may retry the operation that produced this error.
    pub fn is_retriable(&self) -> bool {
        matches!(self, AgentError::Transport { retriable: true, .. })
    }

    /// Error type name reported to the collector.
    pub fn error_type(&self) -> &'static str {
        match self {
            AgentError::UserCode(_) => "UserCodeError",
            AgentError::Transport { .. } => "TransportError",
            AgentError::Timeout { .. } => "TimeoutError",
            AgentError::SecurityBlocked(_) => "SecurityError",
            AgentError::SecurityViolated(_) => "SecurityError",
            AgentError::Injected(_) => "InjectedError",
            AgentError::Config(_) => "ConfigurationError",
        }
    }
}
