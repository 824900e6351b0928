use crate::resilience::circuit_breaker::BreakerOpen;
use thiserror::Error;

/// Structured error context for better error handling and debugging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    /// Field path or configuration key that caused the error (e.g., "breakers.openai.failure_threshold")
    pub field_path: Option<String>,
    /// Additional context about the error (e.g., expected range, actual value)
    pub details: Option<String>,
    /// Source of the error (e.g., "settings_loader", "resource_pool")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self {
            field_path: None,
            details: None,
            source: None,
        }
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Unified error type for the guard layer.
///
/// Errors raised by wrapped operations never pass through this type unless the
/// caller chose it as their own error type; breakers and gates hand them back
/// untouched.
#[derive(Debug, Error)]
pub enum Error {
    /// A call breaker rejected the call without invoking the operation.
    #[error(transparent)]
    BreakerOpen(#[from] BreakerOpen),

    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("Validation error: {message}{}", format_context(.context))]
    Validation {
        message: String,
        context: ErrorContext,
    },

    #[error("Runtime error: {message}{}", format_context(.context))]
    Runtime {
        message: String,
        context: ErrorContext,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Settings parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

// Helper function to format error context for display
fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

impl Error {
    /// Create a new runtime error without context
    pub fn runtime(msg: impl Into<String>) -> Self {
        Error::Runtime {
            message: msg.into(),
            context: ErrorContext::new(),
        }
    }

    /// Create a new runtime error with structured context
    pub fn runtime_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Runtime {
            message: msg.into(),
            context,
        }
    }

    /// Create a new validation error with structured context
    pub fn validation_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Validation {
            message: msg.into(),
            context,
        }
    }

    /// Create a new configuration error with structured context
    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Configuration { context, .. }
            | Error::Validation { context, .. }
            | Error::Runtime { context, .. } => Some(context),
            _ => None,
        }
    }

    /// True when a breaker refused the call (the operation never ran).
    pub fn is_breaker_open(&self) -> bool {
        matches!(self, Error::BreakerOpen(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::circuit_breaker::BreakerState;
    use std::time::Duration;

    #[test]
    fn test_context_is_rendered_in_display() {
        let err = Error::configuration_with_context(
            "failure_threshold must be at least 1",
            ErrorContext::new()
                .with_field_path("breakers.openai.failure_threshold")
                .with_source("settings"),
        );
        let text = err.to_string();
        assert!(text.starts_with("Configuration error: failure_threshold must be at least 1"));
        assert!(text.contains("field: breakers.openai.failure_threshold"));
        assert!(text.contains("source: settings"));
        assert_eq!(
            err.context().and_then(|c| c.source.as_deref()),
            Some("settings")
        );
    }

    #[test]
    fn test_breaker_open_converts_transparently() {
        let open = BreakerOpen {
            name: "openai".to_string(),
            state: BreakerState::Open,
            retry_after: Duration::from_secs(3),
        };
        let expected = open.to_string();
        let err: Error = open.into();
        assert!(err.is_breaker_open());
        assert_eq!(err.to_string(), expected);
        assert!(err.context().is_none());
    }
}
