//! Error types for the chat generation core.
//!
//! Two independent domains, matching the dispatch contract in `tooling`: provider
//! failures abort a step outright, tool failures are always delivered as values.

/// Error raised by a chat provider adapter.
#[derive(Debug, thiserror::Error)]
pub enum ChatProviderError {
    #[error("connection error: {0}")]
    ApiConnection(String),

    #[error("request timed out: {0}")]
    ApiTimeout(String),

    #[error("API returned status {code}: {message}")]
    ApiStatus { code: u16, message: String },

    #[error("provider stream produced no content and no tool calls")]
    ApiEmptyResponse,

    #[error("operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ChatProviderError {
    /// Map an HTTP status code to the conventional auth/permission/rate-limit triage.
    pub fn from_status(code: u16, message: impl Into<String>) -> Self {
        ChatProviderError::ApiStatus {
            code,
            message: message.into(),
        }
    }
}

/// Discriminant for `ToolError`, mirroring the four failure points in the dispatch
/// contract: lookup, parse, validate, run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolErrorKind {
    NotFound,
    Parse,
    Validate,
    Runtime,
}

/// A tool failure. Always delivered as a value inside a `ToolResult`, never raised.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ToolError {
    pub kind: ToolErrorKind,
    pub message: String,
}

impl ToolError {
    pub fn not_found(tool_name: &str) -> Self {
        Self {
            kind: ToolErrorKind::NotFound,
            message: format!("Tool `{}` not found", tool_name),
        }
    }

    pub fn parse(detail: impl std::fmt::Display) -> Self {
        Self {
            kind: ToolErrorKind::Parse,
            message: format!("Error parsing JSON arguments: {}", detail),
        }
    }

    pub fn validate(detail: impl std::fmt::Display) -> Self {
        Self {
            kind: ToolErrorKind::Validate,
            message: format!("Error validating JSON arguments: {}", detail),
        }
    }

    pub fn runtime(detail: impl std::fmt::Display) -> Self {
        Self {
            kind: ToolErrorKind::Runtime,
            message: format!("Error running tool: {}", detail),
        }
    }

    /// A tool task that was still outstanding when cancellation fired.
    pub fn cancelled() -> Self {
        Self {
            kind: ToolErrorKind::Runtime,
            message: "cancelled".to_string(),
        }
    }

    /// Short label suitable for compact UI surfaces.
    pub fn brief(&self) -> &'static str {
        match self.kind {
            ToolErrorKind::NotFound => "Tool not found",
            ToolErrorKind::Parse => "Invalid arguments",
            ToolErrorKind::Validate => "Invalid arguments",
            ToolErrorKind::Runtime => "Tool runtime error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_error_messages_match_templates() {
        assert_eq!(
            ToolError::not_found("get_weather").to_string(),
            "Tool `get_weather` not found"
        );
        assert_eq!(ToolError::not_found("x").brief(), "Tool not found");
        assert_eq!(
            ToolError::runtime("boom").to_string(),
            "Error running tool: boom"
        );
        assert_eq!(ToolError::runtime("boom").brief(), "Tool runtime error");
    }
}
