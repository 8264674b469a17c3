//! Per-backend execution statistics and score-based selection.
//!
//! The router and the distributed executor share one scoring discipline:
//!
//! ```text
//! score = 10 * active_queries
//!       + 5 * recent_error_rate_percent
//!       + recency_bonus when the backend errored in the last 5 minutes
//! ```
//!
//! Lowest score wins; ties break by weight (higher first) then stable
//! order. Hot-path updates take one short mutex per backend.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use sqlgate_db::BackendServer;

const ERROR_RECENCY_WINDOW_SECS: u64 = 300;

#[derive(Debug, Default)]
struct StatsInner {
    active:        u32,
    total:         u64,
    total_time_ms: u64,
    errors:        u64,
    last_error_at: Option<Instant>,
}

/// Point-in-time view of one backend's statistics.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatsSnapshot {
    /// Queries currently executing on the backend.
    pub active_queries: u32,
    /// Total queries sent to the backend.
    pub total_queries: u64,
    /// Cumulative execution wall time in milliseconds.
    pub total_time_ms: u64,
    /// Total failed executions.
    pub errors: u64,
    /// Seconds since the last error, when one occurred.
    pub seconds_since_error: Option<u64>,
}

/// Execution statistics per backend alias.
#[derive(Default)]
pub struct ServerStats {
    map: DashMap<String, Mutex<StatsInner>>,
}

impl ServerStats {
    /// Empty statistics table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_inner<T>(&self, alias: &str, f: impl FnOnce(&mut StatsInner) -> T) -> T {
        let entry = self.map.entry(alias.to_string()).or_default();
        let mut inner = entry.lock();
        f(&mut inner)
    }

    /// Record a query starting on a backend.
    pub fn begin(&self, alias: &str) {
        self.with_inner(alias, |s| {
            s.active += 1;
            s.total += 1;
        });
    }

    /// Record a query finishing on a backend.
    pub fn finish(&self, alias: &str, elapsed_ms: u64, ok: bool) {
        self.with_inner(alias, |s| {
            s.active = s.active.saturating_sub(1);
            s.total_time_ms += elapsed_ms;
            if !ok {
                s.errors += 1;
                s.last_error_at = Some(Instant::now());
            }
        });
    }

    /// Snapshot one backend's statistics.
    #[must_use]
    pub fn snapshot(&self, alias: &str) -> ServerStatsSnapshot {
        self.with_inner(alias, |s| ServerStatsSnapshot {
            active_queries:      s.active,
            total_queries:       s.total,
            total_time_ms:       s.total_time_ms,
            errors:              s.errors,
            seconds_since_error: s.last_error_at.map(|at| at.elapsed().as_secs()),
        })
    }

    /// Load-balancing score; lower is better.
    #[must_use]
    pub fn score(&self, alias: &str) -> f64 {
        self.with_inner(alias, |s| {
            let active_score = f64::from(s.active) * 10.0;

            #[allow(clippy::cast_precision_loss)]
            let error_rate = s.errors as f64 / (s.total.max(1)) as f64 * 100.0;
            let error_score = error_rate * 5.0;

            let recency_score = s.last_error_at.map_or(0.0, |at| {
                let secs = at.elapsed().as_secs();
                if secs < ERROR_RECENCY_WINDOW_SECS {
                    #[allow(clippy::cast_precision_loss)]
                    let remaining = (ERROR_RECENCY_WINDOW_SECS - secs) as f64;
                    remaining / 30.0
                } else {
                    0.0
                }
            });

            active_score + error_score + recency_score
        })
    }

    /// Pick the best-scored backend; ties break by weight then stable
    /// order.
    #[must_use]
    pub fn select_best(&self, servers: &[Arc<BackendServer>]) -> Option<Arc<BackendServer>> {
        if servers.len() == 1 {
            return servers.first().cloned();
        }
        let mut scored: Vec<(usize, f64, &Arc<BackendServer>)> = servers
            .iter()
            .enumerate()
            .map(|(idx, server)| (idx, self.score(&server.alias), server))
            .collect();
        scored.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    b.2.weight
                        .partial_cmp(&a.2.weight)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.first().map(|(_, _, server)| Arc::clone(server))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use sqlgate_db::DatabaseType;

    fn server(alias: &str, weight: f64) -> Arc<BackendServer> {
        Arc::new(BackendServer {
            alias:           alias.to_string(),
            host:            "localhost".to_string(),
            port:            5432,
            database:        "app".to_string(),
            username:        "gate".to_string(),
            password:        "secret".to_string(),
            db_type:         DatabaseType::Postgres,
            max_connections: 5,
            weight,
            allowed_roles:   HashSet::new(),
            is_active:       true,
            group:           Some("g".to_string()),
        })
    }

    #[test]
    fn test_active_queries_raise_score() {
        let stats = ServerStats::new();
        assert!(stats.score("a").abs() < f64::EPSILON);

        stats.begin("a");
        stats.begin("a");
        assert!((stats.score("a") - 20.0).abs() < f64::EPSILON);

        stats.finish("a", 10, true);
        assert!((stats.score("a") - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_errors_raise_score() {
        let stats = ServerStats::new();
        stats.begin("a");
        stats.finish("a", 10, false);

        // 100% error rate * 5 plus a fresh recency bonus of ~10.
        let score = stats.score("a");
        assert!(score > 500.0);

        let snapshot = stats.snapshot("a");
        assert_eq!(snapshot.errors, 1);
        assert_eq!(snapshot.seconds_since_error, Some(0));
    }

    #[test]
    fn test_select_best_prefers_idle_backend() {
        let stats = ServerStats::new();
        let servers = vec![server("a", 1.0), server("b", 1.0)];

        stats.begin("a");
        let best = stats.select_best(&servers).unwrap();
        assert_eq!(best.alias, "b");
    }

    #[test]
    fn test_ties_break_by_weight_then_order() {
        let stats = ServerStats::new();
        let servers = vec![server("a", 1.0), server("b", 3.0), server("c", 3.0)];
        let best = stats.select_best(&servers).unwrap();
        assert_eq!(best.alias, "b");

        let equal = vec![server("x", 1.0), server("y", 1.0)];
        assert_eq!(stats.select_best(&equal).unwrap().alias, "x");
    }

    #[test]
    fn test_single_server_shortcut() {
        let stats = ServerStats::new();
        let only = vec![server("solo", 1.0)];
        assert_eq!(stats.select_best(&only).unwrap().alias, "solo");
        assert!(stats.select_best(&[]).is_none());
    }
}
