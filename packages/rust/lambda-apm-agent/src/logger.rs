//! Logging utilities for lambda-apm-agent.
//!
//! The agent never routes its own diagnostics through the spans it records;
//! this module provides the plain, level-filtered logger used instead.
//!
//! # Example
//! ```
//! use lambda_apm_agent::logger::Logger;
//!
//! // Create a logger for your module
//! let logger = Logger::new("my_module");
//! logger.info("starting module");
//! ```
//!
//! # Static Logger Example
//! ```
//! use lambda_apm_agent::logger::Logger;
//!
//! // Define a static logger for your module
//! static LOGGER: Logger = Logger::const_new("my_module");
//!
//! // Use it directly
//! LOGGER.info("starting module");
//! ```

use crate::constants::env_vars;
use std::env;
use std::sync::OnceLock;

/// Severity, ordered from quietest to noisiest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Level {
    None,
    Error,
    Warn,
    Info,
    Debug,
}

impl Level {
    fn parse(raw: &str) -> Option<Level> {
        match raw.to_ascii_lowercase().as_str() {
            "none" => Some(Level::None),
            "error" => Some(Level::Error),
            "warn" => Some(Level::Warn),
            "info" => Some(Level::Info),
            "debug" => Some(Level::Debug),
            _ => None,
        }
    }
}

static LOG_LEVEL: OnceLock<Level> = OnceLock::new();

/// Effective level, read once from `APM_AGENT_LOG_LEVEL` (fallback
/// `LOG_LEVEL`) and cached for the process lifetime. Unset or unrecognized
/// values mean `info`.
fn effective_level() -> Level {
    *LOG_LEVEL.get_or_init(|| {
        env::var(env_vars::LOG_LEVEL)
            .or_else(|_| env::var("LOG_LEVEL"))
            .ok()
            .and_then(|raw| Level::parse(&raw))
            .unwrap_or(Level::Info)
    })
}

/// Level-filtered logger with a fixed module prefix.
///
/// `debug` and `info` go to stdout, `warn` and `error` to stderr.
#[derive(Clone)]
pub struct Logger {
    prefix: &'static str,
}

impl Logger {
    /// Create a new logger with the given prefix.
    ///
    /// The prefix is leaked; loggers are created once per module and live for
    /// the whole process.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Box::leak(prefix.into().into_boxed_str()),
        }
    }

    /// Create a new logger with the given prefix that can be used in const contexts.
    pub const fn const_new(prefix: &'static str) -> Self {
        Self { prefix }
    }

    fn should_log(&self, level: Level) -> bool {
        level <= effective_level()
    }

    fn format_message(&self, message: &str) -> String {
        format!("[{}] {}", self.prefix, message)
    }

    /// Log a debug message
    pub fn debug(&self, message: impl AsRef<str>) {
        if self.should_log(Level::Debug) {
            println!("{}", self.format_message(message.as_ref()));
        }
    }

    /// Log an info message
    pub fn info(&self, message: impl AsRef<str>) {
        if self.should_log(Level::Info) {
            println!("{}", self.format_message(message.as_ref()));
        }
    }

    /// Log a warning message
    pub fn warn(&self, message: impl AsRef<str>) {
        if self.should_log(Level::Warn) {
            eprintln!("{}", self.format_message(message.as_ref()));
        }
    }

    /// Log an error message
    pub fn error(&self, message: impl AsRef<str>) {
        if self.should_log(Level::Error) {
            eprintln!("{}", self.format_message(message.as_ref()));
        }
    }
}
