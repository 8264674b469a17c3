//! Automatic pool scaling.
//!
//! The autoscaler evaluates scaling policies against live metrics and
//! resizes connection pools (or nudges a server's load-balancing weight)
//! in bounded steps. A per-policy cooldown prevents oscillation, and every
//! action is recorded with the metric value that triggered it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::pool::PoolManager;

/// Scaling events kept in the in-memory history.
const EVENT_HISTORY_LIMIT: usize = 100;

/// Direction of a scaling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScaleDirection {
    /// Grow when the metric is at or above the threshold.
    Up,
    /// Shrink when the metric is at or below the threshold.
    Down,
}

/// Metric a scaling policy observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingMetric {
    /// Queries per minute against the server.
    QueryRate,
    /// Error percentage over the recent window.
    ErrorRate,
    /// Backend CPU usage percentage.
    Cpu,
    /// Backend memory usage percentage.
    Memory,
    /// Connections currently in use.
    ActiveConnections,
}

/// Action taken when a policy triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingAction {
    /// Resize the connection pool by `step` connections.
    ConnectionPool,
    /// Adjust the load-balancing weight by `step` tenths.
    LoadBalancing,
}

/// One scaling policy for one server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingPolicy {
    /// Target server alias.
    pub server_alias: String,
    /// Scale direction.
    pub direction: ScaleDirection,
    /// Observed metric.
    pub metric: ScalingMetric,
    /// Trigger threshold.
    pub threshold: f64,
    /// Step size (connections, or tenths of weight for load balancing).
    pub step: u32,
    /// Lower bound of the scaled value.
    pub min: u32,
    /// Upper bound of the scaled value.
    pub max: u32,
    /// Seconds to wait after an action before this policy fires again.
    pub cooldown_seconds: u64,
    /// What the policy scales.
    pub action: ScalingAction,
}

/// A recorded scaling action.
#[derive(Debug, Clone, Serialize)]
pub struct ScalingEvent {
    /// Server the action applied to.
    pub server_alias: String,
    /// Direction of the action.
    pub direction: ScaleDirection,
    /// Metric that triggered the action.
    pub metric: ScalingMetric,
    /// Observed metric value at trigger time.
    pub metric_value: f64,
    /// Policy threshold.
    pub threshold: f64,
    /// Value before the action.
    pub old_value: u32,
    /// Value after the action.
    pub new_value: u32,
    /// When the action happened.
    pub at: DateTime<Utc>,
}

/// Supplier of live metric values for scaling decisions.
///
/// `ActiveConnections` falls back to pool statistics when the source
/// returns `None`; the remaining metrics come from whatever monitoring
/// pipeline feeds the implementation.
pub trait MetricsSource: Send + Sync {
    /// Current value of `metric` for `alias`, if known.
    fn metric(&self, alias: &str, metric: ScalingMetric) -> Option<f64>;
}

/// Metrics source with no data; pool statistics still cover
/// `ActiveConnections`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMetrics;

impl MetricsSource for NoMetrics {
    fn metric(&self, _alias: &str, _metric: ScalingMetric) -> Option<f64> {
        None
    }
}

/// Automatic scaling engine.
pub struct AutoScaler {
    manager:     Arc<PoolManager>,
    source:      Arc<dyn MetricsSource>,
    policies:    RwLock<Vec<ScalingPolicy>>,
    last_action: Mutex<HashMap<String, Instant>>,
    events:      Mutex<Vec<ScalingEvent>>,
}

impl AutoScaler {
    /// Create a scaler over the given pools and metrics source.
    #[must_use]
    pub fn new(manager: Arc<PoolManager>, source: Arc<dyn MetricsSource>) -> Self {
        Self {
            manager,
            source,
            policies: RwLock::new(Vec::new()),
            last_action: Mutex::new(HashMap::new()),
            events: Mutex::new(Vec::new()),
        }
    }

    /// Install the policy set, replacing any previous one.
    pub fn set_policies(&self, policies: Vec<ScalingPolicy>) {
        *self.policies.write() = policies;
    }

    /// Recorded scaling actions, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<ScalingEvent> {
        self.events.lock().clone()
    }

    fn metric_value(&self, policy: &ScalingPolicy) -> Option<f64> {
        if let Some(v) = self.source.metric(&policy.server_alias, policy.metric) {
            return Some(v);
        }
        if policy.metric == ScalingMetric::ActiveConnections {
            let pool = self.manager.pool_for(&policy.server_alias).ok()?;
            return Some(f64::from(pool.stats().in_use));
        }
        None
    }

    fn triggered(policy: &ScalingPolicy, value: f64) -> bool {
        match policy.direction {
            ScaleDirection::Up => value >= policy.threshold,
            ScaleDirection::Down => value <= policy.threshold,
        }
    }

    /// Evaluate all policies once, applying whatever actions trigger.
    pub fn evaluate_once(&self) {
        let policies = self.policies.read().clone();
        for policy in &policies {
            let Some(value) = self.metric_value(policy) else {
                continue;
            };
            if !Self::triggered(policy, value) {
                continue;
            }

            let cooldown_key = format!("{}:{:?}:{:?}", policy.server_alias, policy.metric, policy.action);
            {
                let last = self.last_action.lock();
                if let Some(at) = last.get(&cooldown_key) {
                    if at.elapsed() < Duration::from_secs(policy.cooldown_seconds) {
                        continue;
                    }
                }
            }

            let applied = match policy.action {
                ScalingAction::ConnectionPool => self.scale_pool(policy, value),
                ScalingAction::LoadBalancing => self.adjust_weight(policy, value),
            };

            if applied {
                self.last_action
                    .lock()
                    .insert(cooldown_key, Instant::now());
            }
        }
    }

    fn scale_pool(&self, policy: &ScalingPolicy, value: f64) -> bool {
        let Ok(pool) = self.manager.pool_for(&policy.server_alias) else {
            return false;
        };
        let current = pool.stats().max_connections;
        let target = match policy.direction {
            ScaleDirection::Up => current.saturating_add(policy.step).min(policy.max),
            ScaleDirection::Down => current.saturating_sub(policy.step).max(policy.min),
        };
        if target == current {
            return false;
        }
        if self.manager.resize(&policy.server_alias, target).is_err() {
            return false;
        }
        tracing::info!(
            alias = %policy.server_alias,
            metric = ?policy.metric,
            value,
            old = current,
            new = target,
            "autoscaler resized pool"
        );
        self.record(policy, value, current, target);
        true
    }

    fn adjust_weight(&self, policy: &ScalingPolicy, value: f64) -> bool {
        let registry = self.manager.registry();
        let Some(server) = registry.get(&policy.server_alias) else {
            return false;
        };
        let step = f64::from(policy.step) / 10.0;
        let target = match policy.direction {
            ScaleDirection::Up => (server.weight + step).min(f64::from(policy.max)),
            ScaleDirection::Down => (server.weight - step).max(f64::from(policy.min).max(0.1)),
        };
        if (target - server.weight).abs() < f64::EPSILON {
            return false;
        }
        if registry.set_weight(&policy.server_alias, target).is_err() {
            return false;
        }
        tracing::info!(
            alias = %policy.server_alias,
            metric = ?policy.metric,
            value,
            old = server.weight,
            new = target,
            "autoscaler adjusted weight"
        );
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        self.record(policy, value, (server.weight * 10.0) as u32, (target * 10.0) as u32);
        true
    }

    fn record(&self, policy: &ScalingPolicy, value: f64, old_value: u32, new_value: u32) {
        let mut events = self.events.lock();
        events.push(ScalingEvent {
            server_alias: policy.server_alias.clone(),
            direction: policy.direction,
            metric: policy.metric,
            metric_value: value,
            threshold: policy.threshold,
            old_value,
            new_value,
            at: Utc::now(),
        });
        if events.len() > EVENT_HISTORY_LIMIT {
            let drop_count = events.len() - EVENT_HISTORY_LIMIT;
            events.drain(..drop_count);
        }
    }

    /// Spawn the evaluation loop; it stops when the shutdown token fires.
    #[must_use]
    pub fn spawn(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => {
                        tracing::debug!("autoscaler stopping");
                        return;
                    }
                    _ = ticker.tick() => self.evaluate_once(),
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

    struct FixedMetrics(f64);

    impl MetricsSource for FixedMetrics {
        fn metric(&self, _alias: &str, _metric: ScalingMetric) -> Option<f64> {
            Some(self.0)
        }
    }

    fn manager_with(alias: &str, max_connections: u32) -> Arc<PoolManager> {
        let registry = Arc::new(ServerRegistry::new());
        registry
            .register(BackendServer {
                alias: alias.to_string(),
                host: "localhost".to_string(),
                port: 5432,
                database: "app".to_string(),
                username: "gate".to_string(),
                password: "secret".to_string(),
                db_type: DatabaseType::Postgres,
                max_connections,
                weight: 1.0,
                allowed_roles: std::collections::HashSet::new(),
                is_active: true,
                group: None,
            })
            .unwrap();
        Arc::new(PoolManager::new(registry, Arc::new(MockConnector::new())))
    }

    fn policy(direction: ScaleDirection, threshold: f64) -> ScalingPolicy {
        ScalingPolicy {
            server_alias: "a".to_string(),
            direction,
            metric: ScalingMetric::QueryRate,
            threshold,
            step: 5,
            min: 2,
            max: 20,
            cooldown_seconds: 300,
            action: ScalingAction::ConnectionPool,
        }
    }

    #[tokio::test]
    async fn test_scale_up_on_threshold() {
        let manager = manager_with("a", 5);
        let scaler = AutoScaler::new(Arc::clone(&manager), Arc::new(FixedMetrics(150.0)));
        scaler.set_policies(vec![policy(ScaleDirection::Up, 100.0)]);

        scaler.evaluate_once();

        let pool = manager.pool_for("a").unwrap();
        assert_eq!(pool.stats().max_connections, 10);

        let events = scaler.events();
        assert_eq!(events.len(), 1);
        assert!((events[0].metric_value - 150.0).abs() < f64::EPSILON);
        assert_eq!(events[0].new_value, 10);
    }

    #[tokio::test]
    async fn test_cooldown_suppresses_repeat_action() {
        let manager = manager_with("a", 5);
        let scaler = AutoScaler::new(Arc::clone(&manager), Arc::new(FixedMetrics(150.0)));
        scaler.set_policies(vec![policy(ScaleDirection::Up, 100.0)]);

        scaler.evaluate_once();
        scaler.evaluate_once();

        assert_eq!(scaler.events().len(), 1);
        assert_eq!(
            manager.pool_for("a").unwrap().stats().max_connections,
            10
        );
    }

    #[tokio::test]
    async fn test_scale_down_clamped_to_min() {
        let manager = manager_with("a", 4);
        let scaler = AutoScaler::new(Arc::clone(&manager), Arc::new(FixedMetrics(1.0)));
        scaler.set_policies(vec![policy(ScaleDirection::Down, 10.0)]);

        scaler.evaluate_once();

        assert_eq!(manager.pool_for("a").unwrap().stats().max_connections, 2);
    }

    #[tokio::test]
    async fn test_no_trigger_below_threshold() {
        let manager = manager_with("a", 5);
        let scaler = AutoScaler::new(Arc::clone(&manager), Arc::new(FixedMetrics(50.0)));
        scaler.set_policies(vec![policy(ScaleDirection::Up, 100.0)]);

        scaler.evaluate_once();

        assert!(scaler.events().is_empty());
        assert_eq!(manager.pool_for("a").unwrap().stats().max_connections, 5);
    }

    #[tokio::test]
    async fn test_weight_adjustment_action() {
        let manager = manager_with("a", 5);
        let scaler = AutoScaler::new(Arc::clone(&manager), Arc::new(FixedMetrics(150.0)));
        let mut p = policy(ScaleDirection::Up, 100.0);
        p.action = ScalingAction::LoadBalancing;
        p.step = 5;
        p.max = 10;
        scaler.set_policies(vec![p]);

        scaler.evaluate_once();

        let weight = manager.registry().get("a").unwrap().weight;
        assert!((weight - 1.5).abs() < 1e-9);
    }
}
