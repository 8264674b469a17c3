//! Query execution: local single-backend runs and distributed
//! scatter/gather over a server group.

mod distributed;
pub mod stats;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use sqlgate_db::{BackendServer, PoolManager};
use sqlgate_error::{Result, SqlGateError};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use uuid::Uuid;

use crate::audit::{AuditOutcome, AuditRow, AuditSink};
use crate::inspect::{QueryInfo, QueryType};
use crate::request::{DistributionInfo, QueryRequest};
use crate::timeout::TimeoutRegistry;

pub use distributed::ActiveDistributedQuery;
pub use stats::{ServerStats, ServerStatsSnapshot};

/// Distribution mode for group execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistributedMode {
    /// Run on the single best-scored backend, failing over through the
    /// group.
    ReadAny,
    /// Fan out to every active backend; succeed on quorum.
    WriteAll,
    /// DDL/other statements: same fan-out semantics as `WriteAll`.
    Broadcast,
}

impl DistributedMode {
    /// Mode implied by the statement type.
    #[must_use]
    pub const fn for_query(query_type: QueryType) -> Self {
        match query_type {
            QueryType::Select => Self::ReadAny,
            QueryType::Insert | QueryType::Update | QueryType::Delete => Self::WriteAll,
            QueryType::Ddl | QueryType::Other => Self::Broadcast,
        }
    }

    /// Strategy name carried in `distribution_info`.
    #[must_use]
    pub const fn strategy(self) -> &'static str {
        match self {
            Self::ReadAny => "load_balanced",
            Self::WriteAll | Self::Broadcast => "all_servers",
        }
    }
}

/// Routed execution plan.
#[derive(Debug)]
pub enum ExecutionPlan {
    /// Single-backend execution.
    Local {
        /// Target backend.
        server: Arc<BackendServer>,
    },
    /// Group execution.
    Distributed {
        /// Group name, for audit targets.
        group: String,
        /// Active, role-permitted members.
        servers: Vec<Arc<BackendServer>>,
        /// Distribution mode.
        mode: DistributedMode,
    },
}

/// Result of an execution, before masking and response assembly.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    /// Overall success. Distributed writes report quorum failures here
    /// rather than as an `Err`, so distribution metadata survives.
    pub success: bool,
    /// Result column names.
    pub columns: Vec<String>,
    /// Result rows.
    pub rows: Vec<Vec<JsonValue>>,
    /// Returned rows for reads, affected rows (averaged across backends
    /// for distributed writes) for writes.
    pub rowcount: u64,
    /// Execution wall time in milliseconds (max across backends for
    /// distributed runs).
    pub execution_time_ms: u64,
    /// Backend that served the query, for local and read-any runs.
    pub server_alias: Option<String>,
    /// Distribution metadata for group runs.
    pub distribution: Option<DistributionInfo>,
    /// Per-server error report for partial distributed failures.
    pub error_message: Option<String>,
}

/// Executor tuning.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Upper bound on pool acquire waits.
    pub acquire_timeout: Duration,
    /// Row cap when the request does not set one.
    pub default_max_rows: usize,
    /// Retry budget for idempotent statements within a group.
    pub retry_limit: u32,
    /// Worker bound for distributed fan-out.
    pub max_workers: usize,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            acquire_timeout:  Duration::from_secs(30),
            default_max_rows: 10_000,
            retry_limit:      2,
            max_workers:      8,
        }
    }
}

pub(crate) struct DistributedState {
    pub(crate) group:      String,
    pub(crate) username:   String,
    pub(crate) started_at: chrono::DateTime<chrono::Utc>,
    pub(crate) servers:    Vec<String>,
    pub(crate) completed:  Vec<String>,
    pub(crate) failed:     Vec<String>,
    pub(crate) status:     &'static str,
}

/// Executes routed plans against pooled backends.
pub struct QueryExecutor {
    pub(crate) pools:    Arc<PoolManager>,
    pub(crate) stats:    Arc<ServerStats>,
    pub(crate) audit:    AuditSink,
    pub(crate) timeouts: Arc<TimeoutRegistry>,
    pub(crate) workers:  Arc<Semaphore>,
    pub(crate) active:   Mutex<HashMap<Uuid, DistributedState>>,
    pub(crate) settings: ExecutorSettings,
}

impl QueryExecutor {
    /// Create an executor.
    #[must_use]
    pub fn new(
        pools: Arc<PoolManager>,
        stats: Arc<ServerStats>,
        audit: AuditSink,
        timeouts: Arc<TimeoutRegistry>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            workers: Arc::new(Semaphore::new(settings.max_workers.max(1))),
            pools,
            stats,
            audit,
            timeouts,
            active: Mutex::new(HashMap::new()),
            settings,
        }
    }

    /// Execute a routed plan.
    ///
    /// # Errors
    ///
    /// Local failures and read-any exhaustion surface as errors; partial
    /// distributed write failures return `Ok` with `success = false` so
    /// the per-server report survives.
    pub async fn execute(
        self: &Arc<Self>,
        plan: &ExecutionPlan,
        req: &QueryRequest,
        info: &QueryInfo,
    ) -> Result<ExecOutcome> {
        match plan {
            ExecutionPlan::Local { server } => self.execute_local(server, req, info).await,
            ExecutionPlan::Distributed {
                group,
                servers,
                mode,
            } => {
                self.execute_distributed(group, servers, *mode, req, info)
                    .await
            },
        }
    }

    fn effective_max_rows(&self, req: &QueryRequest) -> usize {
        req.options.max_rows.unwrap_or(self.settings.default_max_rows)
    }

    async fn execute_local(
        self: &Arc<Self>,
        server: &Arc<BackendServer>,
        req: &QueryRequest,
        info: &QueryInfo,
    ) -> Result<ExecOutcome> {
        let qid = Uuid::new_v4();
        let handle = self.timeouts.register(
            qid,
            &req.principal.username,
            &req.principal.role,
            req.options.timeout_s.map(Duration::from_secs),
        );
        self.audit
            .begin(AuditRow::pending(
                qid,
                &req.principal.username,
                &req.principal.role,
                req.principal.client_ip.clone(),
                &req.query_text,
                info.query_type.as_str(),
                &server.alias,
            ))
            .await;

        let deadline = Instant::now() + handle.timeout;
        let result = self
            .run_on_server(server, req, info, deadline, &handle)
            .await;

        match &result {
            Ok(outcome) => {
                self.audit
                    .finish(qid, AuditOutcome::success(outcome.rowcount))
                    .await;
            },
            Err(e) => {
                self.audit.finish(qid, AuditOutcome::error(e.to_string())).await;
            },
        }
        self.timeouts.unregister(qid);
        result
    }

    /// One statement against one backend: acquire, execute under the
    /// deadline, release, update statistics.
    pub(crate) async fn run_on_server(
        self: &Arc<Self>,
        server: &Arc<BackendServer>,
        req: &QueryRequest,
        info: &QueryInfo,
        deadline: Instant,
        handle: &crate::timeout::QueryHandle,
    ) -> Result<ExecOutcome> {
        let alias = server.alias.clone();
        self.stats.begin(&alias);

        let result = self
            .run_on_server_inner(server, req, info, deadline, handle)
            .await;

        match result {
            Ok((outcome, elapsed_ms)) => {
                self.stats.finish(&alias, elapsed_ms, true);
                Ok(outcome)
            },
            Err((e, elapsed_ms)) => {
                self.stats.finish(&alias, elapsed_ms, false);
                Err(e)
            },
        }
    }

    async fn run_on_server_inner(
        self: &Arc<Self>,
        server: &Arc<BackendServer>,
        req: &QueryRequest,
        info: &QueryInfo,
        deadline: Instant,
        handle: &crate::timeout::QueryHandle,
    ) -> std::result::Result<(ExecOutcome, u64), (SqlGateError, u64)> {
        let alias = &server.alias;
        let timeout_ms = u64::try_from(handle.timeout.as_millis()).unwrap_or(u64::MAX);

        let pool = self.pools.pool_for(alias).map_err(|e| (e, 0))?;
        let acquire_budget = deadline
            .saturating_duration_since(Instant::now())
            .min(self.settings.acquire_timeout);
        let mut conn = pool.acquire(acquire_budget).await.map_err(|e| (e, 0))?;

        let started = Instant::now();
        let executed = tokio::select! {
            result = conn.connection().execute(&req.query_text, &req.params) => Some(result),
            () = handle.token.cancelled() => None,
            () = tokio::time::sleep_until(deadline) => {
                self.timeouts.cancel(handle.qid, "timeout");
                None
            }
        };
        let elapsed_ms =
            u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match executed {
            Some(Ok(statement)) => {
                conn.release(true);
                let max_rows = self.effective_max_rows(req);
                let mut rows = statement.rows;
                rows.truncate(max_rows);
                let rowcount = if info.query_type.is_write() || info.query_type == QueryType::Ddl {
                    statement.affected
                } else {
                    rows.len() as u64
                };
                Ok((
                    ExecOutcome {
                        success: true,
                        columns: statement.columns,
                        rows,
                        rowcount,
                        execution_time_ms: elapsed_ms,
                        server_alias: Some(alias.clone()),
                        distribution: None,
                        error_message: None,
                    },
                    elapsed_ms,
                ))
            },
            Some(Err(e)) => {
                // A failed statement may have left the connection dirty.
                conn.release(false);
                Err((e, elapsed_ms))
            },
            None => {
                // Timeout or cancellation: destroy the connection so the
                // pool replenishes and capacity returns promptly.
                conn.release(false);
                let reason = self
                    .timeouts
                    .cancelled_reason(handle.qid)
                    .unwrap_or_else(|| "client_cancel".to_string());
                let error = if reason == "timeout" {
                    SqlGateError::timeout(timeout_ms)
                } else {
                    SqlGateError::cancelled(handle.qid.to_string(), reason)
                };
                Err((error, elapsed_ms))
            },
        }
    }

    /// Per-backend execution statistics.
    #[must_use]
    pub fn stats(&self) -> &Arc<ServerStats> {
        &self.stats
    }
}
