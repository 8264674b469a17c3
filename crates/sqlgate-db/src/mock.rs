//! In-memory stub connector for tests and local wiring.
//!
//! The mock records every execution per alias so tests can assert on how
//! many times a backend was actually hit (cache and single-flight
//! guarantees depend on this).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value as JsonValue};
use sqlgate_error::{Result, SqlGateError};

use crate::connector::{BackendConnection, BackendConnector, StatementOutcome};
use crate::server::BackendServer;

type ResponderFn =
    dyn Fn(&str, &Map<String, JsonValue>) -> Result<StatementOutcome> + Send + Sync;

#[derive(Clone)]
enum Responder {
    Fixed(StatementOutcome),
    Fail { message: String, transient: bool },
    Handler(Arc<ResponderFn>),
}

#[derive(Default)]
struct MockState {
    responders:       DashMap<String, Responder>,
    delays:           DashMap<String, Duration>,
    connect_refused:  DashMap<String, bool>,
    ping_failing:     DashMap<String, bool>,
    executions:       DashMap<String, u64>,
    total_executions: AtomicU64,
}

/// Scriptable connector that never touches a real database.
///
/// Per-alias behavior defaults to an empty result; tests override it with
/// [`MockConnector::respond`], [`MockConnector::fail`] or
/// [`MockConnector::respond_with`].
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<MockState>,
}

impl MockConnector {
    /// Create a connector where every server returns empty results.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `alias` return a fixed outcome for every statement.
    pub fn respond(&self, alias: &str, outcome: StatementOutcome) {
        self.state
            .responders
            .insert(alias.to_string(), Responder::Fixed(outcome));
    }

    /// Make `alias` answer through a handler closure.
    pub fn respond_with<F>(&self, alias: &str, handler: F)
    where
        F: Fn(&str, &Map<String, JsonValue>) -> Result<StatementOutcome> + Send + Sync + 'static,
    {
        self.state
            .responders
            .insert(alias.to_string(), Responder::Handler(Arc::new(handler)));
    }

    /// Make every statement on `alias` fail.
    pub fn fail(&self, alias: &str, message: &str, transient: bool) {
        self.state.responders.insert(
            alias.to_string(),
            Responder::Fail {
                message: message.to_string(),
                transient,
            },
        );
    }

    /// Add a fixed delay before each statement completes on `alias`.
    pub fn delay(&self, alias: &str, delay: Duration) {
        self.state.delays.insert(alias.to_string(), delay);
    }

    /// Refuse new connections to `alias`.
    pub fn refuse_connections(&self, alias: &str, refused: bool) {
        self.state.connect_refused.insert(alias.to_string(), refused);
    }

    /// Make health pings against `alias` fail.
    pub fn fail_pings(&self, alias: &str, failing: bool) {
        self.state.ping_failing.insert(alias.to_string(), failing);
    }

    /// Number of statements executed against `alias`.
    #[must_use]
    pub fn executions(&self, alias: &str) -> u64 {
        self.state.executions.get(alias).map_or(0, |c| *c)
    }

    /// Total statements executed across all servers.
    #[must_use]
    pub fn total_executions(&self) -> u64 {
        self.state.total_executions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackendConnector for MockConnector {
    async fn connect(&self, server: &BackendServer) -> Result<Box<dyn BackendConnection>> {
        if self
            .state
            .connect_refused
            .get(&server.alias)
            .is_some_and(|r| *r)
        {
            return Err(SqlGateError::backend_transient(
                &server.alias,
                "connection refused",
            ));
        }
        Ok(Box::new(MockConnection {
            alias: server.alias.clone(),
            state: Arc::clone(&self.state),
        }))
    }
}

struct MockConnection {
    alias: String,
    state: Arc<MockState>,
}

#[async_trait]
impl BackendConnection for MockConnection {
    async fn execute(
        &mut self,
        query: &str,
        params: &Map<String, JsonValue>,
    ) -> Result<StatementOutcome> {
        if let Some(delay) = self.state.delays.get(&self.alias).map(|d| *d) {
            tokio::time::sleep(delay).await;
        }

        *self.state.executions.entry(self.alias.clone()).or_insert(0) += 1;
        self.state.total_executions.fetch_add(1, Ordering::SeqCst);

        let responder = self.state.responders.get(&self.alias).map(|r| r.value().clone());
        match responder {
            Some(Responder::Fixed(outcome)) => Ok(outcome),
            Some(Responder::Fail { message, transient }) => {
                if transient {
                    Err(SqlGateError::backend_transient(&self.alias, message))
                } else {
                    Err(SqlGateError::backend(&self.alias, message))
                }
            },
            Some(Responder::Handler(handler)) => handler(query, params),
            None => Ok(StatementOutcome::default()),
        }
    }

    async fn ping(&mut self) -> Result<()> {
        if self
            .state
            .ping_failing
            .get(&self.alias)
            .is_some_and(|f| *f)
        {
            return Err(SqlGateError::backend_transient(&self.alias, "ping failed"));
        }
        Ok(())
    }
}
