//! Security policy enforcement over spans.
//!
//! [`SecurityAwareSpanListener`] screens operations before they run. Rules
//! are [`SpanFilter`]s: in blacklist mode a span matching any rule is a
//! violation, in whitelist mode a span matching none of the rules is. A
//! violation always tags the span (`security.blocked`, `security.violated`,
//! plus the standard error tags with kind `SecurityError`); with `block`
//! enabled it also vetoes the operation at the initialization callback, so
//! the call never produces its side effect.

use crate::constants::tags;
use crate::error::AgentError;
use crate::listener::{SpanFilter, SpanListener};
use crate::logger::Logger;
use crate::span::Span;
use serde::Deserialize;
use std::sync::Arc;

static LOGGER: Logger = Logger::const_new("security");

/// Listener that applies whitelist/blacklist rules at span initialization.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SecurityAwareSpanListener {
    block: bool,
    whitelist: Option<Vec<SpanFilter>>,
    blacklist: Option<Vec<SpanFilter>>,
}

impl SecurityAwareSpanListener {
    pub fn new(
        block: bool,
        whitelist: Option<Vec<SpanFilter>>,
        blacklist: Option<Vec<SpanFilter>>,
    ) -> Self {
        Self {
            block,
            whitelist,
            blacklist,
        }
    }

    pub(crate) fn from_config(config: &serde_json::Value) -> Result<Self, AgentError> {
        serde_json::from_value(config.clone())
            .map_err(|e| AgentError::Config(format!("bad SecurityAwareSpanListener config: {e}")))
    }

    fn has_violation(&self, span: &Span) -> bool {
        if let Some(blacklist) = &self.blacklist {
            if blacklist.iter().any(|rule| rule.matches(span)) {
                return true;
            }
        }
        if let Some(whitelist) = &self.whitelist {
            if !whitelist.iter().any(|rule| rule.matches(span)) {
                return true;
            }
        }
        false
    }
}

impl SpanListener for SecurityAwareSpanListener {
    fn on_span_initialized(&self, span: &Arc<Span>) -> Result<(), AgentError> {
        if !self.has_violation(span) {
            return Ok(());
        }

        span.set_tag(tags::SECURITY_BLOCKED, true);
        span.set_tag(tags::SECURITY_VIOLATED, true);
        let error = if self.block {
            AgentError::SecurityBlocked(span.operation_name().to_string())
        } else {
            AgentError::SecurityViolated(span.operation_name().to_string())
        };
        span.set_error_tags(error.error_type(), &error.to_string());

        if self.block {
            LOGGER.warn(format!(
                "blocked operation '{}' ({}/{})",
                span.operation_name(),
                span.domain_name(),
                span.class_name()
            ));
            return Err(error);
        }
        LOGGER.debug(format!(
            "security violation on operation '{}'",
            span.operation_name()
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::test_support::detached_span;
    use crate::tag::TagValue;

    fn http_get_filter() -> SpanFilter {
        SpanFilter::builder()
            .class_name("HTTP".to_string())
            .with_tag("http.method", "GET")
            .build()
    }

    #[test]
    fn test_blacklist_match_tags_without_blocking() {
        let listener =
            SecurityAwareSpanListener::new(false, None, Some(vec![http_get_filter()]));
        let span = detached_span("fetch_user", "HTTP", "API");
        span.set_tag("http.method", "GET");

        assert!(listener.on_span_initialized(&span).is_ok());
        assert_eq!(span.get_tag(tags::SECURITY_BLOCKED), Some(TagValue::Bool(true)));
        assert_eq!(span.get_tag(tags::SECURITY_VIOLATED), Some(TagValue::Bool(true)));
        assert_eq!(
            span.get_tag(tags::ERROR_KIND),
            Some(TagValue::Str("SecurityError".to_string()))
        );
    }

    #[test]
    fn test_blacklist_match_blocks_when_configured() {
        let listener = SecurityAwareSpanListener::new(true, None, Some(vec![http_get_filter()]));
        let span = detached_span("fetch_user", "HTTP", "API");
        span.set_tag("http.method", "GET");

        let result = listener.on_span_initialized(&span);
        assert!(matches!(result, Err(AgentError::SecurityBlocked(_))));
        assert_eq!(span.get_tag(tags::SECURITY_BLOCKED), Some(TagValue::Bool(true)));
    }

    #[test]
    fn test_blacklist_non_match_passes_untouched() {
        let listener = SecurityAwareSpanListener::new(true, None, Some(vec![http_get_filter()]));
        let span = detached_span("query", "DB", "API");

        assert!(listener.on_span_initialized(&span).is_ok());
        assert_eq!(span.get_tag(tags::SECURITY_BLOCKED), None);
        assert_eq!(span.get_tag(tags::SECURITY_VIOLATED), None);
    }

    #[test]
    fn test_whitelist_non_match_gets_identical_treatment() {
        let listener = SecurityAwareSpanListener::new(true, Some(vec![http_get_filter()]), None);

        let allowed = detached_span("fetch_user", "HTTP", "API");
        allowed.set_tag("http.method", "GET");
        assert!(listener.on_span_initialized(&allowed).is_ok());
        assert_eq!(allowed.get_tag(tags::SECURITY_VIOLATED), None);

        let denied = detached_span("exec", "DB", "API");
        let result = listener.on_span_initialized(&denied);
        assert!(matches!(result, Err(AgentError::SecurityBlocked(_))));
        assert_eq!(denied.get_tag(tags::SECURITY_BLOCKED), Some(TagValue::Bool(true)));
        assert_eq!(denied.get_tag(tags::SECURITY_VIOLATED), Some(TagValue::Bool(true)));
    }

    #[test]
    fn test_from_config() {
        let config = serde_json::json!({
            "block": true,
            "blacklist": [
                {"className": "HTTP", "tags": {"http.host": ["internal.example.com"]}}
            ]
        });
        let listener = SecurityAwareSpanListener::from_config(&config).unwrap();

        let span = detached_span("call_internal", "HTTP", "API");
        span.set_tag("http.host", "internal.example.com");
        assert!(listener.on_span_initialized(&span).is_err());
    }
}
