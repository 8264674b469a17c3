//! The query execution plane.
//!
//! [`QueryPlane`] owns every component and sequences the per-request
//! pipeline: inspection, policy decision, routing, timeout registration,
//! execution (local or distributed), masking, caching, and audit. All
//! components are constructed at startup and injected; there is no global
//! state. Background workers (policy reloader, health prober, cache
//! sweeper, audit writer, anomaly consumer) follow an
//! `init -> run -> drain -> stop` lifecycle driven by one shutdown token.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sqlgate_auth::{
    AuthorizationContext, ConditionRegistry, PolicyEngine, PolicyStore, SystemClock,
};
use sqlgate_db::{BackendConnector, HealthProber, PoolManager, ServerRegistry};
use sqlgate_error::SqlGateError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::anomaly::{AnomalyConfig, AnomalyDetector};
use crate::audit::{AuditBackend, AuditOutcome, AuditRow, AuditSink};
use crate::cache::{fingerprint, CachedResult, ResultCache};
use crate::config::CoreConfig;
use crate::exec::{ExecutorSettings, QueryExecutor, ServerStats};
use crate::inspect::{inspect, QueryInfo, QueryType};
use crate::mask::ResultMasker;
use crate::request::{DistributionInfo, QueryRequest, QueryResponse, ResponseError};
use crate::route::Router;
use crate::timeout::{TimeoutPolicy, TimeoutRegistry};

/// The assembled execution plane.
pub struct QueryPlane {
    config:   CoreConfig,
    registry: Arc<ServerRegistry>,
    pools:    Arc<PoolManager>,
    router:   Router,
    policy:   Arc<PolicyEngine>,
    masker:   Arc<ResultMasker>,
    cache:    Arc<ResultCache>,
    executor: Arc<QueryExecutor>,
    audit:    AuditSink,
    timeouts: Arc<TimeoutRegistry>,
    anomaly:  Arc<AnomalyDetector>,
    shutdown: CancellationToken,
    workers:  Mutex<Vec<JoinHandle<()>>>,
}

impl QueryPlane {
    /// Assemble the plane from its collaborators.
    ///
    /// Performs the initial policy load (a failure logs and leaves the
    /// deny-all empty snapshot in place) and spawns the audit writer and
    /// anomaly consumer. Call [`QueryPlane::start`] to launch the periodic
    /// workers.
    #[must_use]
    pub fn new(
        config: CoreConfig,
        registry: Arc<ServerRegistry>,
        connector: Arc<dyn BackendConnector>,
        policy_store: Arc<dyn PolicyStore>,
        audit_backend: Arc<dyn AuditBackend>,
    ) -> Arc<Self> {
        let shutdown = CancellationToken::new();
        let pools = Arc::new(PoolManager::new(Arc::clone(&registry), connector));
        let stats = Arc::new(ServerStats::new());

        let anomaly = Arc::new(AnomalyDetector::new(AnomalyConfig {
            min_training_samples:       config.ml_min_training_samples,
            model_update_interval_days: config.ml_model_update_interval_days,
            history_limit:              10_000,
        }));
        let (anomaly_tx, anomaly_rx) = mpsc::channel(4096);
        let anomaly_task = Arc::clone(&anomaly).spawn(anomaly_rx, shutdown.clone());

        let (audit, audit_task) = AuditSink::spawn(audit_backend, Some(anomaly_tx), 1024);

        let timeouts = Arc::new(TimeoutRegistry::new(TimeoutPolicy {
            default:  Duration::from_secs(config.default_timeout_seconds),
            per_role: config
                .role_timeout_seconds
                .iter()
                .map(|(role, secs)| (role.clone(), Duration::from_secs(*secs)))
                .collect(),
        }));

        let conditions = Arc::new(ConditionRegistry::with_builtins(Arc::new(SystemClock)));
        let policy = Arc::new(PolicyEngine::new(policy_store, conditions));
        // Initial load; on failure the empty (deny-all) snapshot stands.
        let _ = policy.reload();

        let executor = Arc::new(QueryExecutor::new(
            Arc::clone(&pools),
            stats,
            audit.clone(),
            Arc::clone(&timeouts),
            ExecutorSettings {
                acquire_timeout:  Duration::from_secs(config.acquire_timeout_seconds),
                default_max_rows: config.default_max_rows,
                retry_limit:      config.idempotent_retry_limit,
                max_workers:      config.distributed_max_workers,
            },
        ));

        let router = Router::new(Arc::clone(&registry), config.default_server.clone());
        let masker = Arc::new(ResultMasker::new(Uuid::new_v4().to_string()));
        let cache = Arc::new(ResultCache::new(config.cache.clone()));

        Arc::new(Self {
            config,
            registry,
            pools,
            router,
            policy,
            masker,
            cache,
            executor,
            audit,
            timeouts,
            anomaly,
            shutdown,
            workers: Mutex::new(vec![audit_task, anomaly_task]),
        })
    }

    /// Launch the periodic workers: policy reloader, health prober, cache
    /// sweeper.
    pub fn start(&self) {
        let mut workers = self.workers.lock();
        workers.push(Arc::clone(&self.policy).spawn_reloader(
            Duration::from_secs(self.config.policy_update_interval_seconds),
            self.shutdown.clone(),
        ));
        workers.push(
            HealthProber::new(
                Arc::clone(&self.pools),
                Duration::from_secs(self.config.health_check_interval_seconds),
                self.shutdown.clone(),
            )
            .spawn(),
        );
        workers.push(Arc::clone(&self.cache).spawn_sweeper(self.shutdown.clone()));
        tracing::info!("query plane started");
    }

    /// Stop background workers and flush pending audit writes.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.audit.flush().await;
        tracing::info!("query plane stopped");
    }

    /// Execute one governed request.
    pub async fn execute(&self, req: QueryRequest) -> QueryResponse {
        let info = inspect(&req.query_text);
        let started = Instant::now();

        // Policy precedes every resource acquisition.
        let decision = self.policy.evaluate(&self.authorization_context(&req, &info));
        if !decision.allowed {
            let error = SqlGateError::Policy {
                policy_id: decision.policy_id,
                rule_id:   decision.rule_id,
                message:   decision
                    .message
                    .unwrap_or_else(|| "denied by policy".to_string()),
                reason:    decision.reason,
            };
            self.audit_rejection(&req, &info, &error).await;
            return QueryResponse::failure(info.query_type, &error);
        }

        let plan = match self.router.route(&req, &info) {
            Ok(plan) => plan,
            Err(error) => {
                self.audit_rejection(&req, &info, &error).await;
                return QueryResponse::failure(info.query_type, &error);
            },
        };

        if info.query_type == QueryType::Select && self.config.cache.enabled {
            return self.execute_cached(&req, &info, &plan, started).await;
        }

        match self.executor.execute(&plan, &req, &info).await {
            Ok(outcome) => {
                let masked = self.mask(&info, outcome.columns.clone(), outcome.rows.clone());
                let error = outcome.error_message.as_ref().map(|message| ResponseError {
                    code:         "BACKEND_ERROR".to_string(),
                    message:      message.clone(),
                    server_alias: None,
                });
                QueryResponse {
                    success: outcome.success,
                    columns: outcome.columns,
                    data: masked.rows,
                    rowcount: outcome.rowcount,
                    execution_time_ms: outcome.execution_time_ms,
                    query_type: info.query_type,
                    masked: masked.masked,
                    masked_columns: masked.masked_columns,
                    distribution_info: outcome.distribution,
                    error: if outcome.success { None } else { error },
                }
            },
            Err(error) => QueryResponse::failure(info.query_type, &error),
        }
    }

    /// SELECT path: serve from the cache, building (execute + mask) at
    /// most once per fingerprint across concurrent callers.
    async fn execute_cached(
        &self,
        req: &QueryRequest,
        info: &QueryInfo,
        plan: &crate::exec::ExecutionPlan,
        started: Instant,
    ) -> QueryResponse {
        let fp = fingerprint(&req.query_text, &req.params, &req.target(), req.options.max_rows);
        let distribution: Mutex<Option<DistributionInfo>> = Mutex::new(None);

        let build = || async {
            let outcome = self.executor.execute(plan, req, info).await?;
            let masked = self.mask(info, outcome.columns.clone(), outcome.rows);
            *distribution.lock() = outcome.distribution;
            // Masking precedes the cache store: only governed rows are
            // ever memoised.
            Ok(CachedResult {
                columns:        outcome.columns,
                rows:           masked.rows,
                rowcount:       outcome.rowcount,
                masked:         masked.masked,
                masked_columns: masked.masked_columns,
            })
        };

        match self.cache.get_or_build(&fp, build).await {
            Ok((value, built)) => {
                if !built {
                    // Executions audit inside the executor; cache-served
                    // requests audit here so every request leaves a row.
                    self.audit_cache_hit(req, info, value.rowcount).await;
                }
                QueryResponse {
                    success: true,
                    columns: value.columns.clone(),
                    data: value.rows.clone(),
                    rowcount: value.rowcount,
                    execution_time_ms: u64::try_from(started.elapsed().as_millis())
                        .unwrap_or(u64::MAX),
                    query_type: info.query_type,
                    masked: value.masked,
                    masked_columns: value.masked_columns.clone(),
                    distribution_info: distribution.into_inner(),
                    error: None,
                }
            },
            Err(error) => QueryResponse::failure(info.query_type, &error),
        }
    }

    fn mask(
        &self,
        info: &QueryInfo,
        columns: Vec<String>,
        rows: Vec<Vec<serde_json::Value>>,
    ) -> crate::mask::MaskOutcome {
        // A table hint is only trustworthy when the statement touches
        // exactly one table.
        let hint = match info.tables.as_slice() {
            [only] => Some(only.as_str()),
            _ => None,
        };
        self.masker.mask_results(&columns, rows, hint)
    }

    fn authorization_context(&self, req: &QueryRequest, info: &QueryInfo) -> AuthorizationContext {
        AuthorizationContext {
            username:     req.principal.username.clone(),
            role:         req.principal.role.clone(),
            action:       "execute".to_string(),
            resource:     "query".to_string(),
            server_alias: req.server_alias.clone(),
            tables:       info.tables.clone(),
            columns:      Vec::new(),
            client_ip:    req.principal.client_ip.clone(),
            query_type:   Some(info.query_type.as_str().to_string()),
            query_text:   Some(req.query_text.clone()),
        }
    }

    /// Denials and routing failures never touch a connection but still
    /// leave exactly one audit row.
    async fn audit_rejection(&self, req: &QueryRequest, info: &QueryInfo, error: &SqlGateError) {
        let qid = Uuid::new_v4();
        self.audit
            .begin(AuditRow::pending(
                qid,
                &req.principal.username,
                &req.principal.role,
                req.principal.client_ip.clone(),
                &req.query_text,
                info.query_type.as_str(),
                req.target(),
            ))
            .await;
        self.audit
            .finish(qid, AuditOutcome::error(error.to_string()))
            .await;
    }

    async fn audit_cache_hit(&self, req: &QueryRequest, info: &QueryInfo, rowcount: u64) {
        let qid = Uuid::new_v4();
        self.audit
            .begin(AuditRow::pending(
                qid,
                &req.principal.username,
                &req.principal.role,
                req.principal.client_ip.clone(),
                &req.query_text,
                info.query_type.as_str(),
                req.target(),
            ))
            .await;
        self.audit.finish(qid, AuditOutcome::success(rowcount)).await;
    }

    /// Wait until all queued audit writes are applied (test support).
    pub async fn flush_audit(&self) {
        self.audit.flush().await;
    }

    /// Backend registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    /// Pool manager.
    #[must_use]
    pub fn pools(&self) -> &Arc<PoolManager> {
        &self.pools
    }

    /// Policy engine.
    #[must_use]
    pub fn policy(&self) -> &Arc<PolicyEngine> {
        &self.policy
    }

    /// Result masker.
    #[must_use]
    pub fn masker(&self) -> &Arc<ResultMasker> {
        &self.masker
    }

    /// Result cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    /// Query executor.
    #[must_use]
    pub fn executor(&self) -> &Arc<QueryExecutor> {
        &self.executor
    }

    /// Timeout registry.
    #[must_use]
    pub fn timeouts(&self) -> &Arc<TimeoutRegistry> {
        &self.timeouts
    }

    /// Anomaly detector.
    #[must_use]
    pub fn anomaly(&self) -> &Arc<AnomalyDetector> {
        &self.anomaly
    }
}
