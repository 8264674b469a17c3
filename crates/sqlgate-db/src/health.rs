//! Background health probing.
//!
//! The prober pings every pooled backend at a fixed interval. Three
//! consecutive failures mark a backend unhealthy (acquires fail fast); a
//! single success marks it healthy again. Transition counting lives in the
//! pool itself; this task only drives the probes.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::pool::PoolManager;

/// Default probe interval.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(10);

/// Periodic backend health prober.
pub struct HealthProber {
    manager:  Arc<PoolManager>,
    interval: Duration,
    shutdown: CancellationToken,
}

impl HealthProber {
    /// Create a prober over the given pools.
    #[must_use]
    pub fn new(manager: Arc<PoolManager>, interval: Duration, shutdown: CancellationToken) -> Self {
        Self {
            manager,
            interval,
            shutdown,
        }
    }

    /// Probe every existing pool once.
    pub async fn probe_all(&self) {
        for pool in self.manager.existing() {
            let healthy = pool.probe().await;
            tracing::debug!(alias = %pool.alias(), healthy, "health probe");
        }
    }

    /// Spawn the probe loop; it stops when the shutdown token fires.
    #[must_use]
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = self.shutdown.cancelled() => {
                        tracing::debug!("health prober stopping");
                        return;
                    }
                    _ = ticker.tick() => self.probe_all().await,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockConnector;
    use crate::server::{BackendServer, DatabaseType, ServerRegistry};

    fn registry_with(alias: &str) -> Arc<ServerRegistry> {
        let registry = Arc::new(ServerRegistry::new());
        registry
            .register(BackendServer {
                alias:           alias.to_string(),
                host:            "localhost".to_string(),
                port:            5432,
                database:        "app".to_string(),
                username:        "gate".to_string(),
                password:        "secret".to_string(),
                db_type:         DatabaseType::Postgres,
                max_connections: 2,
                weight:          1.0,
                allowed_roles:   std::collections::HashSet::new(),
                is_active:       true,
                group:           None,
            })
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn test_probe_all_flips_unhealthy_backend() {
        let connector = MockConnector::new();
        let manager = Arc::new(PoolManager::new(
            registry_with("a"),
            Arc::new(connector.clone()),
        ));
        let pool = manager.pool_for("a").unwrap();

        let prober = HealthProber::new(
            Arc::clone(&manager),
            DEFAULT_PROBE_INTERVAL,
            CancellationToken::new(),
        );

        connector.fail_pings("a", true);
        for _ in 0..3 {
            prober.probe_all().await;
        }
        assert!(!pool.stats().healthy);

        connector.fail_pings("a", false);
        prober.probe_all().await;
        assert!(pool.stats().healthy);
    }

    #[tokio::test]
    async fn test_spawned_prober_stops_on_shutdown() {
        let manager = Arc::new(PoolManager::new(
            registry_with("a"),
            Arc::new(MockConnector::new()),
        ));
        let shutdown = CancellationToken::new();
        let handle =
            HealthProber::new(manager, Duration::from_millis(10), shutdown.clone()).spawn();

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("prober should stop promptly")
            .unwrap();
    }
}
