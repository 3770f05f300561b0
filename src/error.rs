//! Error types for the tool-calling orchestrator

use thiserror::Error;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

#[derive(Error, Debug)]
pub enum OrchestrationError {

    // =============================
    // Fatal Run Errors
    // =============================

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connectivity error: {0}")]
    Connectivity(String),

    #[error("Upstream HTTP {status}: {body}")]
    UpstreamProtocol { status: u16, body: String },

    #[error("LLM returned an empty response")]
    EmptyResponse,

    #[error("Step budget exhausted after {max_steps} steps; possible tool-call cycle")]
    BudgetExceeded { max_steps: u32 },

    #[error("Run cancelled at step {step}")]
    Cancelled { step: u32 },

    // =============================
    // Tool-Level Errors (fed back to the model)
    // =============================

    #[error("Tool executor not found for: {0}")]
    ToolResolution(String),

    #[error("Malformed tool arguments: {0}")]
    ToolArgument(String),

    #[error("Tool execution failed: {0}")]
    ToolExecution(String),

    #[error("Invalid tool schema: {0}")]
    InvalidToolSchema(String),

    #[error("Tool server error {code}: {message}")]
    ToolServer { code: i64, message: String },

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl OrchestrationError {
    /// Stable discriminator used in `error` events and tool failure payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Connectivity(_) => "connectivity",
            Self::UpstreamProtocol { .. } => "upstream_protocol",
            Self::EmptyResponse => "empty_response",
            Self::BudgetExceeded { .. } => "budget_exceeded",
            Self::Cancelled { .. } => "cancelled",
            Self::ToolResolution(_) => "tool_resolution",
            Self::ToolArgument(_) => "tool_argument",
            Self::ToolExecution(_) => "tool_execution",
            Self::InvalidToolSchema(_) => "invalid_tool_schema",
            Self::ToolServer { .. } => "tool_server",
            Self::SerializationError(_) => "serialization",
            Self::HttpError(_) => "http",
            Self::IoError(_) => "io",
        }
    }

    /// Whether this error ends a run. Tool-level failures become data instead.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::ToolResolution(_)
                | Self::ToolArgument(_)
                | Self::ToolExecution(_)
                | Self::ToolServer { .. }
        )
    }

    /// Classify a transport-level reqwest failure.
    pub(crate) fn from_transport(context: &str, err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() || err.is_request() {
            Self::Connectivity(format!("{}: {}", context, err))
        } else {
            Self::HttpError(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_errors_are_not_fatal() {
        assert!(!OrchestrationError::ToolResolution("x".into()).is_fatal());
        assert!(!OrchestrationError::ToolArgument("{not json".into()).is_fatal());
        assert!(!OrchestrationError::ToolExecution("boom".into()).is_fatal());
        assert!(OrchestrationError::BudgetExceeded { max_steps: 3 }.is_fatal());
        assert!(OrchestrationError::Config("missing key".into()).is_fatal());
    }

    #[test]
    fn test_budget_error_is_distinct() {
        let err = OrchestrationError::BudgetExceeded { max_steps: 4 };
        assert_eq!(err.kind(), "budget_exceeded");
        assert!(err.to_string().contains("possible tool-call cycle"));
        assert_ne!(err.kind(), OrchestrationError::EmptyResponse.kind());
    }

    #[test]
    fn test_upstream_error_carries_status_and_body() {
        let err = OrchestrationError::UpstreamProtocol {
            status: 429,
            body: r#"{"error":"rate limited"}"#.to_string(),
        };
        assert_eq!(err.to_string(), r#"Upstream HTTP 429: {"error":"rate limited"}"#);
    }
}
