//! Error types for fleet supervisor operations.

use thiserror::Error;

/// Main error type for fleet operations.
///
/// Variants carry the name of the server (or tool) they concern so that
/// callers can log and route failures without re-deriving context.
#[derive(Error, Debug)]
pub enum FleetError {
    /// Duplicate server name found in config
    #[error("duplicate server name: {0}")]
    DuplicateServer(String),

    /// Descriptor failed validation
    #[error("invalid config for server '{0}': {1}")]
    ConfigInvalid(String, String),

    /// The wire channel could not be opened
    #[error("transport unavailable for server '{0}': {1}")]
    TransportUnavailable(String, String),

    /// A previously established channel failed
    #[error("connection lost for server '{0}': {1}")]
    ConnectionLost(String, String),

    /// A deadline was reached before the operation completed
    #[error("timeout after {1}ms for '{0}'")]
    TimeoutExceeded(String, u64),

    /// Fast-failed by the circuit breaker
    #[error("circuit open for server '{0}'")]
    CircuitOpen(String),

    /// RPC protocol error for a named server
    #[error("protocol error for server '{0}': {1}")]
    Protocol(String, String),

    /// No tool by that name in the unified catalog
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    /// The tool exists but the operating mode or access policy forbids it
    #[error("tool '{0}' not allowed: {1}")]
    ToolNotAllowed(String, String),

    /// Tool arguments did not match the declared schema
    #[error("invalid arguments for tool '{0}': {1}")]
    ToolValidationError(String, String),

    /// Failure inside a tool handler
    #[error("tool '{0}' failed: {1}")]
    ToolExecutionError(String, String),

    /// The global embedding latch forbids embedding-dependent tools
    #[error("tool '{0}' requires embeddings, which are disabled")]
    EmbeddingsDisabled(String),

    /// Operation rejected because the owning subsystem has begun teardown
    #[error("'{0}' is shutting down")]
    ShuttingDown(String),
}

impl FleetError {
    /// Whether the retry strategy may re-attempt an operation that failed
    /// with this error. Circuit-open is excluded: the breaker itself
    /// controls readmission.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FleetError::TransportUnavailable(_, _)
                | FleetError::ConnectionLost(_, _)
                | FleetError::TimeoutExceeded(_, _)
        )
    }

    /// Stable error code for the management surface envelope.
    pub fn code(&self) -> &'static str {
        match self {
            FleetError::ToolNotAllowed(_, _)
            | FleetError::ToolValidationError(_, _)
            | FleetError::EmbeddingsDisabled(_) => "BAD_REQUEST",
            FleetError::ToolNotFound(_) => "NOT_FOUND",
            FleetError::ConnectionLost(_, _) => "SESSION_NOT_FOUND",
            FleetError::DuplicateServer(_)
            | FleetError::ConfigInvalid(_, _)
            | FleetError::TransportUnavailable(_, _)
            | FleetError::TimeoutExceeded(_, _)
            | FleetError::CircuitOpen(_)
            | FleetError::Protocol(_, _)
            | FleetError::ToolExecutionError(_, _)
            | FleetError::ShuttingDown(_) => "MCP_SERVER_ERROR",
        }
    }

    /// HTTP status for the management surface envelope.
    pub fn status_code(&self) -> u16 {
        match self {
            FleetError::DuplicateServer(_) => 409,
            FleetError::ConfigInvalid(_, _)
            | FleetError::ToolNotAllowed(_, _)
            | FleetError::ToolValidationError(_, _)
            | FleetError::EmbeddingsDisabled(_) => 400,
            FleetError::ToolNotFound(_) | FleetError::ConnectionLost(_, _) => 404,
            FleetError::ShuttingDown(_) => 503,
            FleetError::TransportUnavailable(_, _)
            | FleetError::TimeoutExceeded(_, _)
            | FleetError::CircuitOpen(_)
            | FleetError::Protocol(_, _)
            | FleetError::ToolExecutionError(_, _) => 500,
        }
    }
}

/// Result type alias for fleet operations
pub type Result<T> = std::result::Result<T, FleetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_server_display() {
        let err = FleetError::DuplicateServer("gh".to_string());
        assert_eq!(err.to_string(), "duplicate server name: gh");
    }

    #[test]
    fn test_config_invalid_display() {
        let err = FleetError::ConfigInvalid(
            "gh".to_string(),
            "stdio transport requires 'command' field".to_string(),
        );
        assert_eq!(
            err.to_string(),
            "invalid config for server 'gh': stdio transport requires 'command' field"
        );
    }

    #[test]
    fn test_timeout_display_carries_elapsed() {
        let err = FleetError::TimeoutExceeded("gh".to_string(), 30_000);
        assert_eq!(err.to_string(), "timeout after 30000ms for 'gh'");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(FleetError::TransportUnavailable("a".into(), "refused".into()).is_retryable());
        assert!(FleetError::ConnectionLost("a".into(), "eof".into()).is_retryable());
        assert!(FleetError::TimeoutExceeded("a".into(), 10).is_retryable());

        assert!(!FleetError::ConfigInvalid("a".into(), "bad".into()).is_retryable());
        assert!(!FleetError::CircuitOpen("a".into()).is_retryable());
        assert!(!FleetError::ToolNotFound("t".into()).is_retryable());
        assert!(!FleetError::ToolExecutionError("t".into(), "boom".into()).is_retryable());
    }

    #[test]
    fn test_envelope_mapping_for_validation_failure() {
        // Descriptor validation failures surface as MCP_SERVER_ERROR / 400
        let err = FleetError::ConfigInvalid("x".into(), "missing command".into());
        assert_eq!(err.code(), "MCP_SERVER_ERROR");
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn test_envelope_mapping_for_conflict() {
        let err = FleetError::DuplicateServer("x".into());
        assert_eq!(err.status_code(), 409);
    }
}
