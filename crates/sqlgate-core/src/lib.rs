//! SQLGate core: the query execution plane.
//!
//! A governed SQL proxy pipeline sitting between authenticated clients and
//! a fleet of backend databases:
//!
//! ```text
//! request -> Router -> PolicyEngine -> TimeoutRegistry
//!         -> Executor (local | distributed scatter/gather)
//!         -> ResultMasker -> ResultCache (single-flight)
//!         -> AuditSink -> AnomalyDetector (async)
//! ```
//!
//! [`plane::QueryPlane`] assembles the pipeline; the individual components
//! live in their own modules and are usable standalone.

pub mod anomaly;
pub mod audit;
pub mod cache;
pub mod config;
pub mod exec;
pub mod inspect;
pub mod mask;
pub mod plane;
pub mod request;
pub mod route;
pub mod timeout;

pub use anomaly::{AnomalyAlert, AnomalyDetector, Severity};
pub use audit::{AuditBackend, AuditOutcome, AuditRow, AuditSink, AuditStatus, MemoryAuditBackend};
pub use cache::{fingerprint, CachedResult, ResultCache};
pub use config::{CacheSettings, CoreConfig};
pub use exec::{
    DistributedMode, ExecOutcome, ExecutionPlan, ExecutorSettings, QueryExecutor, ServerStats,
};
pub use inspect::{inspect, query_hash, QueryInfo, QueryType};
pub use mask::{DataCategory, MaskOutcome, MaskingRule, MaskingType, ResultMasker};
pub use plane::QueryPlane;
pub use request::{Principal, QueryOptions, QueryRequest, QueryResponse};
pub use route::Router;
pub use timeout::{TimeoutPolicy, TimeoutRegistry};
