//! ML-flavoured anomaly detection over finalized audit rows.
//!
//! The detector consumes the audit pipeline asynchronously and never sits
//! on the request path. Each registered classifier scores one axis (query
//! volume, execution time, temporal pattern, user behaviour, access
//! pattern, query content); scores at or above the `low` threshold raise
//! an [`AnomalyAlert`].
//!
//! Baselines are trained offline from the retained history, gated by a
//! minimum sample count and an update interval; classification always uses
//! the last trained baseline and never blocks on training.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audit::{AuditRow, AuditStatus};

/// Alert severity ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Score in [0.70, 0.80).
    Low,
    /// Score in [0.80, 0.90).
    Medium,
    /// Score in [0.90, 0.95).
    High,
    /// Score in [0.95, 1.0].
    Critical,
}

impl Severity {
    /// Map a score to a severity; scores under the low threshold raise
    /// nothing.
    #[must_use]
    pub fn from_score(score: f64) -> Option<Self> {
        if score >= 0.95 {
            Some(Self::Critical)
        } else if score >= 0.90 {
            Some(Self::High)
        } else if score >= 0.80 {
            Some(Self::Medium)
        } else if score >= 0.70 {
            Some(Self::Low)
        } else {
            None
        }
    }
}

/// A raised anomaly.
#[derive(Debug, Clone, Serialize)]
pub struct AnomalyAlert {
    /// Audit row the anomaly was detected on.
    pub audit_id: Uuid,
    /// Principal the anomaly concerns.
    pub username: String,
    /// Classifier axis that fired.
    pub axis: &'static str,
    /// Severity from the score ladder.
    pub severity: Severity,
    /// Raw score in [0, 1].
    pub score: f64,
    /// Detection time.
    pub detected_at: DateTime<Utc>,
}

/// Detector tuning.
#[derive(Debug, Clone)]
pub struct AnomalyConfig {
    /// Minimum finalized rows before baselines train.
    pub min_training_samples: usize,
    /// Days between baseline retraining runs.
    pub model_update_interval_days: u32,
    /// Rows retained for training and volume features.
    pub history_limit: usize,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            min_training_samples:       100,
            model_update_interval_days: 7,
            history_limit:              10_000,
        }
    }
}

/// Statistical baseline trained from audit history.
#[derive(Debug, Default, Clone)]
pub struct Baseline {
    /// Rows the baseline was trained over.
    pub samples: usize,
    /// When training last ran.
    pub trained_at: Option<DateTime<Utc>>,
    exec_mean: f64,
    exec_std: f64,
    user_hourly_mean: HashMap<String, f64>,
    user_hourly_std: HashMap<String, f64>,
    user_hour_histogram: HashMap<String, [u64; 24]>,
    user_query_types: HashMap<String, HashSet<String>>,
    user_targets: HashMap<String, HashSet<String>>,
}

impl Baseline {
    fn train(history: &VecDeque<AuditRow>) -> Self {
        let mut exec_times = Vec::new();
        let mut user_hour_histogram: HashMap<String, [u64; 24]> = HashMap::new();
        let mut user_query_types: HashMap<String, HashSet<String>> = HashMap::new();
        let mut user_targets: HashMap<String, HashSet<String>> = HashMap::new();
        let mut user_hour_counts: HashMap<(String, i64), u64> = HashMap::new();

        for row in history {
            if let Some(ms) = row.execution_time_ms {
                #[allow(clippy::cast_precision_loss)]
                exec_times.push(ms as f64);
            }
            let hour = row.started_at.hour() as usize;
            user_hour_histogram.entry(row.username.clone()).or_default()[hour] += 1;
            user_query_types
                .entry(row.username.clone())
                .or_default()
                .insert(row.query_type.clone());
            user_targets
                .entry(row.username.clone())
                .or_default()
                .insert(row.target.clone());
            let bucket = row.started_at.timestamp() / 3600;
            *user_hour_counts
                .entry((row.username.clone(), bucket))
                .or_default() += 1;
        }

        let (exec_mean, exec_std) = mean_std(&exec_times);

        let mut per_user_counts: HashMap<String, Vec<f64>> = HashMap::new();
        for ((user, _bucket), count) in &user_hour_counts {
            #[allow(clippy::cast_precision_loss)]
            per_user_counts
                .entry(user.clone())
                .or_default()
                .push(*count as f64);
        }
        let mut user_hourly_mean = HashMap::new();
        let mut user_hourly_std = HashMap::new();
        for (user, counts) in per_user_counts {
            let (mean, std) = mean_std(&counts);
            user_hourly_mean.insert(user.clone(), mean);
            user_hourly_std.insert(user, std);
        }

        Self {
            samples: history.len(),
            trained_at: Some(Utc::now()),
            exec_mean,
            exec_std,
            user_hourly_mean,
            user_hourly_std,
            user_hour_histogram,
            user_query_types,
            user_targets,
        }
    }
}

fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    #[allow(clippy::cast_precision_loss)]
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

/// Map a z-score onto the alert score ladder: z=2 is low, z=4.5 critical.
fn z_to_score(z: f64) -> f64 {
    (0.5 + z * 0.1).clamp(0.0, 1.0)
}

/// Per-row features computed from retained history at classification time.
#[derive(Debug, Clone, Copy)]
pub struct RowFeatures {
    /// Queries by the same user in the trailing hour.
    pub user_hour_count: u64,
}

/// One anomaly axis.
pub trait AnomalyClassifier: Send + Sync {
    /// Axis name carried on alerts.
    fn axis(&self) -> &'static str;

    /// Score a row; `None` means nothing anomalous on this axis.
    fn classify(&self, row: &AuditRow, baseline: &Baseline, features: RowFeatures) -> Option<f64>;
}

struct ExecutionTimeClassifier;

impl AnomalyClassifier for ExecutionTimeClassifier {
    fn axis(&self) -> &'static str {
        "execution_time"
    }

    fn classify(&self, row: &AuditRow, baseline: &Baseline, _features: RowFeatures) -> Option<f64> {
        if baseline.trained_at.is_none() || baseline.exec_std <= f64::EPSILON {
            return None;
        }
        #[allow(clippy::cast_precision_loss)]
        let value = row.execution_time_ms? as f64;
        let z = (value - baseline.exec_mean) / baseline.exec_std;
        (z > 2.0).then(|| z_to_score(z))
    }
}

struct QueryVolumeClassifier;

impl AnomalyClassifier for QueryVolumeClassifier {
    fn axis(&self) -> &'static str {
        "query_volume"
    }

    fn classify(&self, row: &AuditRow, baseline: &Baseline, features: RowFeatures) -> Option<f64> {
        baseline.trained_at?;
        let mean = *baseline.user_hourly_mean.get(&row.username)?;
        let std = *baseline.user_hourly_std.get(&row.username)?;
        if std <= f64::EPSILON {
            return None;
        }
        #[allow(clippy::cast_precision_loss)]
        let z = (features.user_hour_count as f64 - mean) / std;
        (z > 2.0).then(|| z_to_score(z))
    }
}

struct TemporalPatternClassifier;

impl AnomalyClassifier for TemporalPatternClassifier {
    fn axis(&self) -> &'static str {
        "temporal_pattern"
    }

    fn classify(&self, row: &AuditRow, baseline: &Baseline, _features: RowFeatures) -> Option<f64> {
        baseline.trained_at?;
        let histogram = baseline.user_hour_histogram.get(&row.username)?;
        let total: u64 = histogram.iter().sum();
        if total < 20 {
            return None;
        }
        let hour = row.started_at.hour() as usize;
        #[allow(clippy::cast_precision_loss)]
        let p = histogram[hour] as f64 / total as f64;
        if histogram[hour] == 0 {
            Some(0.95)
        } else if p < 0.02 {
            Some(0.85)
        } else if p < 0.05 {
            Some(0.75)
        } else {
            None
        }
    }
}

struct UserBehaviorClassifier;

impl AnomalyClassifier for UserBehaviorClassifier {
    fn axis(&self) -> &'static str {
        "user_behavior"
    }

    fn classify(&self, row: &AuditRow, baseline: &Baseline, _features: RowFeatures) -> Option<f64> {
        baseline.trained_at?;
        let seen = baseline.user_query_types.get(&row.username)?;
        if seen.contains(&row.query_type) {
            return None;
        }
        // First write from a previously read-only user is more alarming
        // than any other new statement type.
        let is_write = matches!(row.query_type.as_str(), "INSERT" | "UPDATE" | "DELETE" | "DDL");
        Some(if is_write { 0.85 } else { 0.75 })
    }
}

struct AccessPatternClassifier;

impl AnomalyClassifier for AccessPatternClassifier {
    fn axis(&self) -> &'static str {
        "access_pattern"
    }

    fn classify(&self, row: &AuditRow, baseline: &Baseline, _features: RowFeatures) -> Option<f64> {
        baseline.trained_at?;
        let targets = baseline.user_targets.get(&row.username)?;
        (!targets.contains(&row.target)).then_some(0.8)
    }
}

struct QueryContentClassifier;

impl AnomalyClassifier for QueryContentClassifier {
    fn axis(&self) -> &'static str {
        "query_content"
    }

    fn classify(&self, row: &AuditRow, _baseline: &Baseline, _features: RowFeatures) -> Option<f64> {
        let upper = row.query_text.to_uppercase();
        let has_where = upper.contains("WHERE");
        let mut score: f64 = 0.0;

        if (upper.starts_with("DELETE") || upper.starts_with("UPDATE")) && !has_where {
            score = score.max(0.9);
        }
        if upper.starts_with("DROP") || upper.starts_with("TRUNCATE") {
            score = score.max(0.85);
        }
        if upper.contains("UNION SELECT") {
            score = score.max(0.9);
        }
        if upper.contains("--") || upper.contains("/*") {
            score = score.max(0.75);
        }
        if upper.matches(" JOIN ").count() > 3 || row.query_text.len() > 2000 {
            score = score.max(0.72);
        }

        (score > 0.0).then_some(score)
    }
}

struct DetectorState {
    history:  VecDeque<AuditRow>,
    baseline: Baseline,
}

/// Asynchronous anomaly detector.
pub struct AnomalyDetector {
    config:      AnomalyConfig,
    classifiers: Vec<Box<dyn AnomalyClassifier>>,
    state:       Mutex<DetectorState>,
    alerts:      Mutex<Vec<AnomalyAlert>>,
}

impl AnomalyDetector {
    /// Detector with the built-in classifier set.
    #[must_use]
    pub fn new(config: AnomalyConfig) -> Self {
        Self {
            config,
            classifiers: vec![
                Box::new(QueryVolumeClassifier),
                Box::new(ExecutionTimeClassifier),
                Box::new(TemporalPatternClassifier),
                Box::new(UserBehaviorClassifier),
                Box::new(AccessPatternClassifier),
                Box::new(QueryContentClassifier),
            ],
            state: Mutex::new(DetectorState {
                history:  VecDeque::new(),
                baseline: Baseline::default(),
            }),
            alerts: Mutex::new(Vec::new()),
        }
    }

    /// Classify one finalized row, record any alerts, and fold the row into
    /// history (retraining when due).
    pub fn process(&self, row: &AuditRow) -> Vec<AnomalyAlert> {
        if row.status == AuditStatus::Pending {
            return Vec::new();
        }

        let mut state = self.state.lock();
        let features = RowFeatures {
            user_hour_count: Self::user_hour_count(&state.history, row),
        };

        let mut raised = Vec::new();
        for classifier in &self.classifiers {
            let Some(score) = classifier.classify(row, &state.baseline, features) else {
                continue;
            };
            let Some(severity) = Severity::from_score(score) else {
                continue;
            };
            let alert = AnomalyAlert {
                audit_id: row.id,
                username: row.username.clone(),
                axis: classifier.axis(),
                severity,
                score,
                detected_at: Utc::now(),
            };
            tracing::warn!(
                axis = alert.axis,
                severity = ?alert.severity,
                score = alert.score,
                user = %alert.username,
                "anomaly detected"
            );
            raised.push(alert);
        }

        state.history.push_back(row.clone());
        while state.history.len() > self.config.history_limit {
            state.history.pop_front();
        }
        self.maybe_train(&mut state);
        drop(state);

        if !raised.is_empty() {
            self.alerts.lock().extend(raised.iter().cloned());
        }
        raised
    }

    fn user_hour_count(history: &VecDeque<AuditRow>, row: &AuditRow) -> u64 {
        let cutoff = row.started_at - ChronoDuration::hours(1);
        history
            .iter()
            .rev()
            .take_while(|r| r.started_at >= cutoff)
            .filter(|r| r.username == row.username)
            .count() as u64
    }

    fn maybe_train(&self, state: &mut DetectorState) {
        if state.history.len() < self.config.min_training_samples {
            return;
        }
        let due = state.baseline.trained_at.is_none_or(|at| {
            Utc::now() - at >= ChronoDuration::days(i64::from(self.config.model_update_interval_days))
        });
        if !due {
            return;
        }
        state.baseline = Baseline::train(&state.history);
        tracing::info!(samples = state.baseline.samples, "anomaly baselines trained");
    }

    /// All alerts raised so far.
    #[must_use]
    pub fn alerts(&self) -> Vec<AnomalyAlert> {
        self.alerts.lock().clone()
    }

    /// Spawn the queue consumer; it stops when the shutdown token fires.
    #[must_use]
    pub fn spawn(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<AuditRow>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => {
                        tracing::debug!("anomaly detector stopping");
                        return;
                    }
                    row = rx.recv() => {
                        let Some(row) = row else { return };
                        let _ = self.process(&row);
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(user: &str, query: &str, query_type: &str, exec_ms: u64, target: &str) -> AuditRow {
        let mut row = AuditRow::pending(
            Uuid::new_v4(),
            user,
            "analyst",
            None,
            query,
            query_type,
            target,
        );
        row.status = AuditStatus::Success;
        row.execution_time_ms = Some(exec_ms);
        row.completed_at = Some(Utc::now());
        row
    }

    fn trained_detector() -> AnomalyDetector {
        let detector = AnomalyDetector::new(AnomalyConfig {
            min_training_samples: 10,
            model_update_interval_days: 7,
            history_limit: 1000,
        });
        for i in 0..30 {
            // Vary execution times so the baseline has non-zero spread.
            detector.process(&row(
                "alice",
                "SELECT id FROM users WHERE id = 1",
                "SELECT",
                10 + (i % 5) * 10,
                "a",
            ));
        }
        detector
    }

    #[test]
    fn test_severity_ladder() {
        assert_eq!(Severity::from_score(0.69), None);
        assert_eq!(Severity::from_score(0.70), Some(Severity::Low));
        assert_eq!(Severity::from_score(0.85), Some(Severity::Medium));
        assert_eq!(Severity::from_score(0.92), Some(Severity::High));
        assert_eq!(Severity::from_score(0.99), Some(Severity::Critical));
    }

    #[test]
    fn test_untrained_baseline_raises_only_content_alerts() {
        let detector = AnomalyDetector::new(AnomalyConfig::default());
        let alerts = detector.process(&row("bob", "SELECT 1", "SELECT", 10, "a"));
        assert!(alerts.is_empty());

        let alerts = detector.process(&row("bob", "DELETE FROM users", "DELETE", 10, "a"));
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].axis, "query_content");
        assert_eq!(alerts[0].severity, Severity::High);
    }

    #[test]
    fn test_execution_time_outlier() {
        let detector = trained_detector();
        let alerts =
            detector.process(&row("alice", "SELECT id FROM users WHERE id = 1", "SELECT", 10_000, "a"));
        assert!(alerts.iter().any(|a| a.axis == "execution_time"));
    }

    #[test]
    fn test_new_target_is_access_anomaly() {
        let detector = trained_detector();
        let alerts =
            detector.process(&row("alice", "SELECT id FROM users WHERE id = 1", "SELECT", 20, "b"));
        assert!(alerts.iter().any(|a| a.axis == "access_pattern"));
    }

    #[test]
    fn test_first_write_is_behavior_anomaly() {
        let detector = trained_detector();
        let alerts = detector.process(&row(
            "alice",
            "UPDATE users SET active = false WHERE id = 1",
            "UPDATE",
            20,
            "a",
        ));
        let behavior = alerts.iter().find(|a| a.axis == "user_behavior").unwrap();
        assert_eq!(behavior.severity, Severity::Medium);
    }

    #[test]
    fn test_content_risk_markers() {
        let detector = AnomalyDetector::new(AnomalyConfig::default());
        let alerts = detector.process(&row(
            "mallory",
            "SELECT name FROM users WHERE id = 1 UNION SELECT password FROM credentials",
            "SELECT",
            5,
            "a",
        ));
        let content = alerts.iter().find(|a| a.axis == "query_content").unwrap();
        assert!(content.score >= 0.9);
    }

    #[test]
    fn test_alert_history_accumulates() {
        let detector = AnomalyDetector::new(AnomalyConfig::default());
        detector.process(&row("bob", "DROP TABLE users", "DDL", 1, "a"));
        detector.process(&row("bob", "TRUNCATE audit", "DDL", 1, "a"));
        assert_eq!(detector.alerts().len(), 2);
    }
}
