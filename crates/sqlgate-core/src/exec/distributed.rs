//! Distributed execution across a server group.
//!
//! Reads run on the single best-scored backend with failover through the
//! group. Writes and broadcasts fan out to every active member in parallel
//! over a bounded worker pool; the write succeeds when at least
//! `max(1, floor(N / 2))` members succeed, where N excludes sub-executions
//! cancelled by the coordinator's own deadline.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlgate_db::BackendServer;
use sqlgate_error::{Result, SqlGateError};
use tokio::task::JoinSet;
use tokio::time::Instant;
use uuid::Uuid;

use super::{DistributedMode, DistributedState, ExecOutcome, QueryExecutor};
use crate::audit::{AuditOutcome, AuditRow};
use crate::inspect::QueryInfo;
use crate::request::{DistributionInfo, QueryRequest};

/// Observable state of a running distributed query.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveDistributedQuery {
    /// Distributed query id.
    pub query_id: Uuid,
    /// Target group.
    pub server_group: String,
    /// Principal username.
    pub username: String,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// Members of the group at scatter time.
    pub servers_total: usize,
    /// Members that have completed.
    pub servers_completed: usize,
    /// Members that have failed.
    pub servers_failed: usize,
    /// `running` or `cancelled`.
    pub status: &'static str,
}

impl QueryExecutor {
    pub(crate) async fn execute_distributed(
        self: &Arc<Self>,
        group: &str,
        servers: &[Arc<BackendServer>],
        mode: DistributedMode,
        req: &QueryRequest,
        info: &QueryInfo,
    ) -> Result<ExecOutcome> {
        if servers.is_empty() {
            return Err(SqlGateError::routing(format!(
                "no active servers in group '{group}'"
            )));
        }

        let qid = Uuid::new_v4();
        let handle = self.timeouts.register(
            qid,
            &req.principal.username,
            &req.principal.role,
            req.options.timeout_s.map(Duration::from_secs),
        );
        self.audit
            .begin(
                AuditRow::pending(
                    qid,
                    &req.principal.username,
                    &req.principal.role,
                    req.principal.client_ip.clone(),
                    &req.query_text,
                    info.query_type.as_str(),
                    format!("group:{group}"),
                )
                .with_distributed_id(qid),
            )
            .await;
        self.active.lock().insert(
            qid,
            DistributedState {
                group:      group.to_string(),
                username:   req.principal.username.clone(),
                started_at: Utc::now(),
                servers:    servers.iter().map(|s| s.alias.clone()).collect(),
                completed:  Vec::new(),
                failed:     Vec::new(),
                status:     "running",
            },
        );

        let deadline = Instant::now() + handle.timeout;
        let result = match mode {
            DistributedMode::ReadAny => {
                self.read_any(qid, servers, req, info, deadline, &handle).await
            },
            DistributedMode::WriteAll | DistributedMode::Broadcast => {
                self.write_all(qid, mode, servers, req, info, deadline, &handle)
                    .await
            },
        };

        match &result {
            Ok(outcome) if outcome.success => {
                self.audit
                    .finish(qid, AuditOutcome::success(outcome.rowcount))
                    .await;
            },
            Ok(outcome) => {
                let message = outcome
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "quorum not reached".to_string());
                self.audit.finish(qid, AuditOutcome::error(message)).await;
            },
            Err(e) => {
                self.audit.finish(qid, AuditOutcome::error(e.to_string())).await;
            },
        }
        self.timeouts.unregister(qid);
        self.active.lock().remove(&qid);
        result
    }

    /// Load-balanced single shot with failover through the group.
    async fn read_any(
        self: &Arc<Self>,
        qid: Uuid,
        servers: &[Arc<BackendServer>],
        req: &QueryRequest,
        info: &QueryInfo,
        deadline: Instant,
        handle: &crate::timeout::QueryHandle,
    ) -> Result<ExecOutcome> {
        let max_attempts = (self.settings.retry_limit as usize + 1).min(servers.len());
        let mut remaining: Vec<Arc<BackendServer>> = servers.to_vec();
        let mut failed = 0usize;
        let mut last_error: Option<SqlGateError> = None;

        for _attempt in 0..max_attempts {
            let Some(server) = self.stats.select_best(&remaining) else {
                break;
            };
            remaining.retain(|s| s.alias != server.alias);

            match self.run_on_server(&server, req, info, deadline, handle).await {
                Ok(mut outcome) => {
                    self.mark_server(qid, &server.alias, true);
                    outcome.distribution = Some(DistributionInfo {
                        strategy:          DistributedMode::ReadAny.strategy().to_string(),
                        servers_total:     servers.len(),
                        servers_succeeded: 1,
                        servers_failed:    failed,
                        query_id:          qid.to_string(),
                    });
                    return Ok(outcome);
                },
                Err(e) => {
                    self.mark_server(qid, &server.alias, false);
                    failed += 1;
                    let fatal = matches!(
                        e,
                        SqlGateError::Timeout { .. } | SqlGateError::Cancelled { .. }
                    );
                    tracing::warn!(
                        alias = %server.alias,
                        error = %e,
                        "read failed; trying next backend in group"
                    );
                    last_error = Some(e);
                    if fatal {
                        break;
                    }
                },
            }
        }

        Err(last_error
            .unwrap_or_else(|| SqlGateError::routing("group exhausted with no attempts")))
    }

    /// Parallel fan-out with majority quorum.
    #[allow(clippy::too_many_arguments)]
    async fn write_all(
        self: &Arc<Self>,
        qid: Uuid,
        mode: DistributedMode,
        servers: &[Arc<BackendServer>],
        req: &QueryRequest,
        info: &QueryInfo,
        deadline: Instant,
        handle: &crate::timeout::QueryHandle,
    ) -> Result<ExecOutcome> {
        let mut join = JoinSet::new();
        for server in servers {
            let executor = Arc::clone(self);
            let server = Arc::clone(server);
            let req = req.clone();
            let info = info.clone();
            let workers = Arc::clone(&self.workers);
            let sub_handle = crate::timeout::QueryHandle {
                qid:     handle.qid,
                timeout: handle.timeout,
                token:   handle.token.clone(),
            };
            join.spawn(async move {
                // Fan-out parallelism is bounded by the worker pool.
                let _permit = workers.acquire_owned().await;
                let result = executor
                    .run_on_server(&server, &req, &info, deadline, &sub_handle)
                    .await;
                (server.alias.clone(), result)
            });
        }

        let mut succeeded = 0usize;
        let mut cancelled = 0usize;
        let mut affected_total = 0u64;
        let mut execution_time_ms = 0u64;
        let mut errors: Vec<String> = Vec::new();

        while let Some(joined) = join.join_next().await {
            let Ok((alias, result)) = joined else {
                errors.push("executor task panicked".to_string());
                continue;
            };
            match result {
                Ok(outcome) => {
                    succeeded += 1;
                    affected_total += outcome.rowcount;
                    execution_time_ms = execution_time_ms.max(outcome.execution_time_ms);
                    self.mark_server(qid, &alias, true);
                },
                Err(e) => {
                    if matches!(e, SqlGateError::Timeout { .. } | SqlGateError::Cancelled { .. }) {
                        cancelled += 1;
                    }
                    errors.push(format!("{alias}: {e}"));
                    self.mark_server(qid, &alias, false);
                },
            }
        }

        // Quorum over terminal statuses, excluding coordinator-cancelled
        // sub-executions.
        let effective = servers.len().saturating_sub(cancelled);
        let quorum = (effective / 2).max(1);
        let success = succeeded >= quorum;
        let rowcount = if succeeded > 0 {
            affected_total / succeeded as u64
        } else {
            0
        };

        tracing::info!(
            %qid,
            strategy = mode.strategy(),
            total = servers.len(),
            succeeded,
            failed = servers.len() - succeeded,
            cancelled,
            quorum,
            success,
            "distributed fan-out complete"
        );

        Ok(ExecOutcome {
            success,
            columns: Vec::new(),
            rows: Vec::new(),
            rowcount,
            execution_time_ms,
            server_alias: None,
            distribution: Some(DistributionInfo {
                strategy:          mode.strategy().to_string(),
                servers_total:     servers.len(),
                servers_succeeded: succeeded,
                servers_failed:    servers.len() - succeeded,
                query_id:          qid.to_string(),
            }),
            error_message: if errors.is_empty() {
                None
            } else {
                Some(errors.join("\n"))
            },
        })
    }

    fn mark_server(&self, qid: Uuid, alias: &str, ok: bool) {
        let mut active = self.active.lock();
        if let Some(state) = active.get_mut(&qid) {
            if ok {
                state.completed.push(alias.to_string());
            } else {
                state.failed.push(alias.to_string());
            }
        }
    }

    /// Snapshot of running distributed queries.
    #[must_use]
    pub fn active_distributed(&self) -> Vec<ActiveDistributedQuery> {
        self.active
            .lock()
            .iter()
            .map(|(qid, state)| ActiveDistributedQuery {
                query_id:          *qid,
                server_group:      state.group.clone(),
                username:          state.username.clone(),
                started_at:        state.started_at,
                servers_total:     state.servers.len(),
                servers_completed: state.completed.len(),
                servers_failed:    state.failed.len(),
                status:            state.status,
            })
            .collect()
    }

    /// Cancel a running distributed query; sub-executions transition to
    /// cancelled and stop counting toward the quorum.
    pub fn cancel_distributed(&self, qid: Uuid) -> bool {
        let mut active = self.active.lock();
        let Some(state) = active.get_mut(&qid) else {
            return false;
        };
        state.status = "cancelled";
        drop(active);
        self.timeouts.cancel(qid, "client_cancel")
    }
}
