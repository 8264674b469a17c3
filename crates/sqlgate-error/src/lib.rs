//! Unified error types for the SQLGate execution plane.
//!
//! All runtime crates depend on this crate for error handling.
//!
//! # Error Hierarchy
//!
//! ```text
//! SqlGateError
//! ├── Policy          - Denied by the authorization policy engine
//! ├── Routing         - No usable backend for the request
//! ├── Pool            - Connection pool acquire/drain failures
//! ├── Validation      - Unsupported request shape or bad input
//! ├── Timeout         - Deadline expired during wait or execution
//! ├── Backend         - Driver/SQL error from a backend server
//! ├── Cancelled       - Client- or coordinator-initiated cancellation
//! ├── Configuration   - Config/setup errors
//! └── Internal        - Unexpected internal errors
//! ```
//!
//! Retry decisions are made from the error kind, never by matching on
//! message text: see [`SqlGateError::is_retryable`].

use thiserror::Error;

/// Result type alias for SQLGate operations.
pub type Result<T> = std::result::Result<T, SqlGateError>;

/// Failure modes of a connection pool acquire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PoolErrorKind {
    /// The acquire deadline expired while waiting for a connection.
    Timeout,
    /// The pool is draining or drained and rejects new acquires.
    Drained,
    /// The backend failed its health probes; acquires fail fast.
    Unhealthy,
}

impl PoolErrorKind {
    /// Stable code string for this pool failure.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "pool_timeout",
            Self::Drained => "pool_drained",
            Self::Unhealthy => "server_unhealthy",
        }
    }
}

impl std::fmt::Display for PoolErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for the SQLGate execution plane.
///
/// Every error path in the core produces exactly one terminal audit row;
/// the variants here form the closed taxonomy that callers may rely on.
#[derive(Error, Debug)]
pub enum SqlGateError {
    /// Request denied by the policy engine.
    #[error("Denied by policy: {message}")]
    Policy {
        /// Identifier of the deciding policy, when one matched.
        policy_id: Option<i64>,
        /// Identifier of the deciding rule, when one matched.
        rule_id:   Option<i64>,
        /// Human-readable denial message.
        message:   String,
        /// Machine-readable denial reason (e.g. `default_deny`, `rule_42`).
        reason:    String,
    },

    /// No backend could be chosen for this request.
    #[error("Routing error: {message}")]
    Routing {
        /// What went wrong while resolving a target.
        message: String,
    },

    /// Connection pool failure.
    #[error("Pool error on '{server_alias}': {kind}")]
    Pool {
        /// Alias of the backend whose pool failed.
        server_alias: String,
        /// Which pool failure occurred.
        kind:         PoolErrorKind,
    },

    /// Request shape is unsupported or inconsistent.
    #[error("Validation error: {message}")]
    Validation {
        /// Description of the invalid input.
        message: String,
    },

    /// Deadline expired during wait or execution.
    #[error("Query timeout after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds.
        timeout_ms: u64,
    },

    /// Backend driver or SQL error, carried through with the server alias.
    #[error("Backend error on '{server_alias}': {message}")]
    Backend {
        /// Alias of the failing backend.
        server_alias: String,
        /// Error message from the driver.
        message:      String,
        /// Whether the failure is transient (connection-level) rather than
        /// a statement error; transient failures may be retried for
        /// idempotent queries.
        transient:    bool,
    },

    /// Query cancelled before completion.
    #[error("Query cancelled: {reason}")]
    Cancelled {
        /// Query identifier for tracking/logging.
        query_id: String,
        /// Reason for cancellation (`timeout`, `client_cancel`, ...).
        reason:   String,
    },

    /// Configuration is invalid or missing.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Error message.
        message: String,
    },

    /// Unexpected internal error. Should be rare.
    #[error("Internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
        /// Optional source error for debugging.
        #[source]
        source:  Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl SqlGateError {
    /// Create a policy denial without a matching rule (default deny).
    #[must_use]
    pub fn policy_deny(message: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Policy {
            policy_id: None,
            rule_id:   None,
            message:   message.into(),
            reason:    reason.into(),
        }
    }

    /// Create a routing error.
    #[must_use]
    pub fn routing(message: impl Into<String>) -> Self {
        Self::Routing {
            message: message.into(),
        }
    }

    /// Create a pool error for a backend.
    #[must_use]
    pub fn pool(server_alias: impl Into<String>, kind: PoolErrorKind) -> Self {
        Self::Pool {
            server_alias: server_alias.into(),
            kind,
        }
    }

    /// Create a validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a timeout error.
    #[must_use]
    pub const fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    /// Create a statement-level backend error (not retried).
    #[must_use]
    pub fn backend(server_alias: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            server_alias: server_alias.into(),
            message:      message.into(),
            transient:    false,
        }
    }

    /// Create a transient (connection-level) backend error.
    #[must_use]
    pub fn backend_transient(server_alias: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            server_alias: server_alias.into(),
            message:      message.into(),
            transient:    true,
        }
    }

    /// Create a cancellation error.
    #[must_use]
    pub fn cancelled(query_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Cancelled {
            query_id: query_id.into(),
            reason:   reason.into(),
        }
    }

    /// Create a configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            source:  None,
        }
    }

    /// Check whether a retry on another backend may succeed.
    ///
    /// Only pool acquisition failures against an unhealthy backend and
    /// transient backend errors qualify; the router additionally restricts
    /// retries to idempotent statements.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Pool { kind, .. } => matches!(kind, PoolErrorKind::Unhealthy),
            Self::Backend { transient, .. } => *transient,
            _ => false,
        }
    }

    /// Check if this is a client error (4xx equivalent).
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Policy { .. } | Self::Validation { .. } | Self::Routing { .. }
        )
    }

    /// Get HTTP status code equivalent.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::Validation { .. } => 400,
            Self::Policy { .. } => 403,
            Self::Routing { .. } => 404,
            Self::Timeout { .. } | Self::Cancelled { .. } => 408,
            Self::Pool { .. } => 503,
            Self::Backend { .. } | Self::Configuration { .. } | Self::Internal { .. } => 500,
        }
    }

    /// Get the stable error code carried in responses.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Policy { .. } => "POLICY_DENY",
            Self::Routing { .. } => "ROUTING_ERROR",
            Self::Pool { kind, .. } => match kind {
                PoolErrorKind::Timeout => "POOL_TIMEOUT",
                PoolErrorKind::Drained => "POOL_DRAINED",
                PoolErrorKind::Unhealthy => "SERVER_UNHEALTHY",
            },
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Backend { .. } => "BACKEND_ERROR",
            Self::Cancelled { .. } => "CANCELLED",
            Self::Configuration { .. } => "CONFIG_ERROR",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    /// The backend alias attached to this error, when one is known.
    #[must_use]
    pub fn server_alias(&self) -> Option<&str> {
        match self {
            Self::Pool { server_alias, .. } | Self::Backend { server_alias, .. } => {
                Some(server_alias)
            },
            _ => None,
        }
    }
}

impl From<serde_json::Error> for SqlGateError {
    fn from(e: serde_json::Error) -> Self {
        Self::Validation {
            message: format!("JSON error: {e}"),
        }
    }
}

impl From<std::io::Error> for SqlGateError {
    fn from(e: std::io::Error) -> Self {
        Self::Internal {
            message: format!("I/O error: {e}"),
            source:  Some(Box::new(e)),
        }
    }
}

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Add context to an error.
    ///
    /// # Errors
    ///
    /// Returns the error with additional context message prepended.
    fn context(self, message: impl Into<String>) -> Result<T>;
}

impl<T, E: Into<SqlGateError>> ErrorContext<T> for std::result::Result<T, E> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let inner = e.into();
            SqlGateError::Internal {
                message: format!("{}: {inner}", message.into()),
                source:  None,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_deny_classification() {
        let err = SqlGateError::policy_deny("no matching policy", "default_deny");
        assert!(err.is_client_error());
        assert!(!err.is_retryable());
        assert_eq!(err.status_code(), 403);
        assert_eq!(err.error_code(), "POLICY_DENY");
    }

    #[test]
    fn test_pool_error_codes() {
        let timeout = SqlGateError::pool("a", PoolErrorKind::Timeout);
        let drained = SqlGateError::pool("a", PoolErrorKind::Drained);
        let unhealthy = SqlGateError::pool("a", PoolErrorKind::Unhealthy);

        assert_eq!(timeout.error_code(), "POOL_TIMEOUT");
        assert_eq!(drained.error_code(), "POOL_DRAINED");
        assert_eq!(unhealthy.error_code(), "SERVER_UNHEALTHY");
        assert!(!timeout.is_retryable());
        assert!(unhealthy.is_retryable());
    }

    #[test]
    fn test_backend_retryability() {
        assert!(SqlGateError::backend_transient("a", "connection reset").is_retryable());
        assert!(!SqlGateError::backend("a", "syntax error at or near").is_retryable());
    }

    #[test]
    fn test_server_alias_extraction() {
        let err = SqlGateError::backend("replica-1", "boom");
        assert_eq!(err.server_alias(), Some("replica-1"));
        assert_eq!(SqlGateError::timeout(1000).server_alias(), None);
    }

    #[test]
    fn test_timeout_display() {
        let err = SqlGateError::timeout(5000);
        assert_eq!(err.to_string(), "Query timeout after 5000ms");
        assert_eq!(err.status_code(), 408);
    }

    #[test]
    fn test_error_context() {
        fn may_fail() -> std::result::Result<(), std::io::Error> {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"))
        }

        let result = may_fail().context("failed to load masking rules");
        let err = result.unwrap_err();
        assert!(err.to_string().contains("failed to load masking rules"));
    }
}
