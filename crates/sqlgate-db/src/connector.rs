//! Connector trait definitions.
//!
//! A [`BackendConnector`] establishes connections to a configured
//! [`BackendServer`](crate::BackendServer); a [`BackendConnection`] executes
//! statements over one established connection. The pool owns connections and
//! hands them out one request at a time, so `execute` takes `&mut self`.

use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue};
use sqlgate_error::Result;

use crate::server::BackendServer;

/// Result of executing one statement on a backend.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct StatementOutcome {
    /// Result column names, in select order. Populated even when the row
    /// set is empty or truncated to zero rows.
    pub columns: Vec<String>,

    /// Result rows as JSON values, row-major.
    pub rows: Vec<Vec<JsonValue>>,

    /// Rows affected by a write statement.
    pub affected: u64,
}

impl StatementOutcome {
    /// Outcome of a write with no result set.
    #[must_use]
    pub fn affected_only(affected: u64) -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
            affected,
        }
    }
}

/// One live connection to a backend server.
#[async_trait]
pub trait BackendConnection: Send {
    /// Execute a statement with named parameters and collect its result.
    ///
    /// # Errors
    ///
    /// Returns `SqlGateError::Backend` on driver or SQL failure; the
    /// `transient` flag distinguishes connection-level failures (retryable
    /// for idempotent statements) from statement errors.
    async fn execute(&mut self, query: &str, params: &Map<String, JsonValue>)
        -> Result<StatementOutcome>;

    /// Verify the connection is alive (used by the health prober).
    ///
    /// # Errors
    ///
    /// Returns `SqlGateError::Backend` when the backend is unreachable.
    async fn ping(&mut self) -> Result<()>;
}

/// Factory for backend connections.
#[async_trait]
pub trait BackendConnector: Send + Sync {
    /// Establish a new connection to the given server.
    ///
    /// # Errors
    ///
    /// Returns a transient `SqlGateError::Backend` when the backend cannot
    /// be reached.
    async fn connect(&self, server: &BackendServer) -> Result<Box<dyn BackendConnection>>;
}
