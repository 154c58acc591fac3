//! Tag values attached to spans and invocations.
//!
//! Tags are restricted to a closed set of JSON-compatible shapes so every
//! producer writes values the collector can index. The [`From`] impls keep
//! call sites terse:
//!
//! ```
//! use lambda_apm_agent::tag::TagValue;
//!
//! let status: TagValue = 200.into();
//! let path: TagValue = "/orders".into();
//! assert_eq!(status, TagValue::Num(200.0));
//! assert_eq!(path, TagValue::Str("/orders".to_string()));
//! ```

use serde::{Deserialize, Serialize};

/// A tag value: string, number, boolean, or list of strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    Str(String),
    Num(f64),
    Bool(bool),
    StrArray(Vec<String>),
}

impl TagValue {
    /// String payload, when this value is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            TagValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric payload, when this value is a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TagValue::Num(n) => Some(*n),
            _ => None,
        }
    }

    /// Boolean payload, when this value is a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            TagValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<&str> for TagValue {
    fn from(value: &str) -> Self {
        TagValue::Str(value.to_string())
    }
}

impl From<String> for TagValue {
    fn from(value: String) -> Self {
        TagValue::Str(value)
    }
}

impl From<bool> for TagValue {
    fn from(value: bool) -> Self {
        TagValue::Bool(value)
    }
}

impl From<f64> for TagValue {
    fn from(value: f64) -> Self {
        TagValue::Num(value)
    }
}

impl From<f32> for TagValue {
    fn from(value: f32) -> Self {
        TagValue::Num(value as f64)
    }
}

impl From<i32> for TagValue {
    fn from(value: i32) -> Self {
        TagValue::Num(value as f64)
    }
}

impl From<i64> for TagValue {
    fn from(value: i64) -> Self {
        TagValue::Num(value as f64)
    }
}

impl From<u32> for TagValue {
    fn from(value: u32) -> Self {
        TagValue::Num(value as f64)
    }
}

impl From<u64> for TagValue {
    fn from(value: u64) -> Self {
        TagValue::Num(value as f64)
    }
}

impl From<Vec<String>> for TagValue {
    fn from(value: Vec<String>) -> Self {
        TagValue::StrArray(value)
    }
}

impl From<Vec<&str>> for TagValue {
    fn from(value: Vec<&str>) -> Self {
        TagValue::StrArray(value.into_iter().map(str::to_string).collect())
    }
}

impl From<&[&str]> for TagValue {
    fn from(value: &[&str]) -> Self {
        TagValue::StrArray(value.iter().map(|s| s.to_string()).collect())
    }
}
