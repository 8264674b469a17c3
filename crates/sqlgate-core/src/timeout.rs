//! Per-query deadline registry.
//!
//! Every executing query registers here before touching a connection. The
//! registry computes the effective timeout from the request override or the
//! per-role policy, hands back a cancellation handle, and makes running
//! queries observable (and cancellable) by operators.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Timeout policy: request override first, then role, then default.
#[derive(Debug, Clone)]
pub struct TimeoutPolicy {
    /// Fallback timeout.
    pub default: Duration,
    /// Per-role timeouts (e.g. admin > service > analyst).
    pub per_role: HashMap<String, Duration>,
}

impl TimeoutPolicy {
    /// Policy with only a default timeout.
    #[must_use]
    pub fn with_default(default: Duration) -> Self {
        Self {
            default,
            per_role: HashMap::new(),
        }
    }

    /// Effective timeout for a role with an optional request override.
    #[must_use]
    pub fn effective(&self, role: &str, request_override: Option<Duration>) -> Duration {
        request_override
            .or_else(|| self.per_role.get(role).copied())
            .unwrap_or(self.default)
    }
}

/// Observable state of one registered query.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveQuery {
    /// Query identifier.
    pub qid: Uuid,
    /// Principal username.
    pub username: String,
    /// Principal role.
    pub role: String,
    /// Registration time.
    pub started_at: DateTime<Utc>,
    /// Effective timeout in milliseconds.
    pub timeout_ms: u64,
    /// Cancellation reason, once cancelled.
    pub cancelled_reason: Option<String>,
}

struct Entry {
    info:  ActiveQuery,
    token: CancellationToken,
}

/// Handle returned by [`TimeoutRegistry::register`].
pub struct QueryHandle {
    /// Query identifier.
    pub qid: Uuid,
    /// Effective timeout for the statement.
    pub timeout: Duration,
    /// Fires when the query is cancelled.
    pub token: CancellationToken,
}

/// Registry of running queries and their deadlines.
#[derive(Default)]
pub struct TimeoutRegistry {
    entries: DashMap<Uuid, Entry>,
    policy:  parking_lot::RwLock<TimeoutPolicy>,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self::with_default(Duration::from_secs(60))
    }
}

impl TimeoutRegistry {
    /// Registry with the given policy.
    #[must_use]
    pub fn new(policy: TimeoutPolicy) -> Self {
        Self {
            entries: DashMap::new(),
            policy:  parking_lot::RwLock::new(policy),
        }
    }

    /// Register a query and compute its effective timeout.
    #[must_use]
    pub fn register(
        &self,
        qid: Uuid,
        username: &str,
        role: &str,
        request_override: Option<Duration>,
    ) -> QueryHandle {
        let timeout = self.policy.read().effective(role, request_override);
        let token = CancellationToken::new();
        self.entries.insert(
            qid,
            Entry {
                info:  ActiveQuery {
                    qid,
                    username: username.to_string(),
                    role: role.to_string(),
                    started_at: Utc::now(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    cancelled_reason: None,
                },
                token: token.clone(),
            },
        );
        QueryHandle { qid, timeout, token }
    }

    /// Cancel a registered query, signalling its executor.
    ///
    /// Returns false when the query is unknown (already finished).
    pub fn cancel(&self, qid: Uuid, reason: &str) -> bool {
        let Some(mut entry) = self.entries.get_mut(&qid) else {
            return false;
        };
        if entry.info.cancelled_reason.is_none() {
            entry.info.cancelled_reason = Some(reason.to_string());
            entry.token.cancel();
            tracing::info!(%qid, reason, "query cancelled");
        }
        true
    }

    /// Cancellation reason for a query, if it was cancelled.
    #[must_use]
    pub fn cancelled_reason(&self, qid: Uuid) -> Option<String> {
        self.entries
            .get(&qid)
            .and_then(|e| e.info.cancelled_reason.clone())
    }

    /// Remove a finished query from the registry.
    pub fn unregister(&self, qid: Uuid) -> Option<ActiveQuery> {
        self.entries.remove(&qid).map(|(_, e)| e.info)
    }

    /// Snapshot of all registered queries.
    #[must_use]
    pub fn list(&self) -> Vec<ActiveQuery> {
        self.entries.iter().map(|e| e.info.clone()).collect()
    }
}
