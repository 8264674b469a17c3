//! Core configuration.
//!
//! Deserialized from TOML with environment-variable overrides. Knob names
//! in the environment keep their historical upper-case spelling
//! (`POLICY_UPDATE_INTERVAL_SECONDS`, `DISTRIBUTED_MAX_WORKERS`, ...).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sqlgate_error::{Result, SqlGateError};

/// Result cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Whether result caching is enabled.
    pub enabled: bool,
    /// Maximum cached entries (LRU bound).
    pub max_entries: usize,
    /// Default TTL for cached results, in seconds.
    pub ttl_seconds: u64,
    /// Interval of the periodic expiry sweep, in seconds.
    pub sweep_interval_seconds: u64,
    /// Bounded single-flight wait before falling through to unsupervised
    /// execution, in seconds.
    pub wait_timeout_seconds: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled:                true,
            max_entries:            10_000,
            ttl_seconds:            300,
            sweep_interval_seconds: 60,
            wait_timeout_seconds:   10,
        }
    }
}

/// Configuration for the execution plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Seconds between policy store reloads.
    pub policy_update_interval_seconds: u64,

    /// Days of audit history used for anomaly baseline training.
    pub ml_training_history_days: u32,

    /// Minimum finalized audit rows before baselines train.
    pub ml_min_training_samples: usize,

    /// Days between baseline retraining runs.
    pub ml_model_update_interval_days: u32,

    /// Worker bound for distributed fan-out.
    pub distributed_max_workers: usize,

    /// Seconds between autoscaler evaluations.
    pub autoscaling_check_interval_seconds: u64,

    /// Execution time above which a query counts as slow, in milliseconds.
    pub analytics_slow_query_threshold_ms: u64,

    /// Similarity threshold for query-content analysis.
    pub analytics_similarity_threshold: f64,

    /// Default backend when a request names neither server nor group.
    pub default_server: Option<String>,

    /// Retry budget for idempotent statements within a group.
    pub idempotent_retry_limit: u32,

    /// Upper bound on pool acquire waits, in seconds.
    pub acquire_timeout_seconds: u64,

    /// Statement timeout when neither the request nor a role policy sets
    /// one, in seconds.
    pub default_timeout_seconds: u64,

    /// Per-role statement timeouts, in seconds.
    pub role_timeout_seconds: HashMap<String, u64>,

    /// Row cap applied when a request does not set `max_rows`.
    pub default_max_rows: usize,

    /// Seconds between backend health probes.
    pub health_check_interval_seconds: u64,

    /// Grace given to in-use connections when draining a pool, in seconds.
    pub drain_grace_seconds: u64,

    /// Result cache settings.
    pub cache: CacheSettings,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            policy_update_interval_seconds:      60,
            ml_training_history_days:            30,
            ml_min_training_samples:             100,
            ml_model_update_interval_days:       7,
            distributed_max_workers:             8,
            autoscaling_check_interval_seconds:  60,
            analytics_slow_query_threshold_ms:   1_000,
            analytics_similarity_threshold:      0.7,
            default_server:                      None,
            idempotent_retry_limit:              2,
            acquire_timeout_seconds:             30,
            default_timeout_seconds:             60,
            role_timeout_seconds:                HashMap::new(),
            default_max_rows:                    10_000,
            health_check_interval_seconds:       10,
            drain_grace_seconds:                 30,
            cache:                               CacheSettings::default(),
        }
    }
}

impl CoreConfig {
    /// Parse a TOML document.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the document fails to parse.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| SqlGateError::config(format!("invalid config: {e}")))
    }

    /// Apply environment-variable overrides over this configuration.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        override_u64(&mut self.policy_update_interval_seconds, "POLICY_UPDATE_INTERVAL_SECONDS");
        override_u32(&mut self.ml_training_history_days, "ML_TRAINING_HISTORY_DAYS");
        override_usize(&mut self.ml_min_training_samples, "ML_MIN_TRAINING_SAMPLES");
        override_u32(&mut self.ml_model_update_interval_days, "ML_MODEL_UPDATE_INTERVAL_DAYS");
        override_usize(&mut self.distributed_max_workers, "DISTRIBUTED_MAX_WORKERS");
        override_u64(
            &mut self.autoscaling_check_interval_seconds,
            "AUTOSCALING_CHECK_INTERVAL_SECONDS",
        );
        override_u64(
            &mut self.analytics_slow_query_threshold_ms,
            "ANALYTICS_SLOW_QUERY_THRESHOLD_MS",
        );
        if let Ok(v) = std::env::var("ANALYTICS_SIMILARITY_THRESHOLD") {
            if let Ok(parsed) = v.parse() {
                self.analytics_similarity_threshold = parsed;
            }
        }
        self
    }
}

fn override_u64(target: &mut u64, name: &str) {
    if let Ok(v) = std::env::var(name) {
        if let Ok(parsed) = v.parse() {
            *target = parsed;
        }
    }
}

fn override_u32(target: &mut u32, name: &str) {
    if let Ok(v) = std::env::var(name) {
        if let Ok(parsed) = v.parse() {
            *target = parsed;
        }
    }
}

fn override_usize(target: &mut usize, name: &str) {
    if let Ok(v) = std::env::var(name) {
        if let Ok(parsed) = v.parse() {
            *target = parsed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoreConfig::default();
        assert_eq!(config.policy_update_interval_seconds, 60);
        assert_eq!(config.distributed_max_workers, 8);
        assert_eq!(config.ml_model_update_interval_days, 7);
        assert!(config.cache.enabled);
        assert_eq!(config.cache.wait_timeout_seconds, 10);
    }

    #[test]
    fn test_partial_toml_overlays_defaults() {
        let config = CoreConfig::from_toml_str(
            r#"
            distributed_max_workers = 16
            default_server = "primary"

            [cache]
            ttl_seconds = 30
            "#,
        )
        .unwrap();

        assert_eq!(config.distributed_max_workers, 16);
        assert_eq!(config.default_server.as_deref(), Some("primary"));
        assert_eq!(config.cache.ttl_seconds, 30);
        // Untouched knobs keep their defaults.
        assert_eq!(config.policy_update_interval_seconds, 60);
        assert_eq!(config.cache.max_entries, 10_000);
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = CoreConfig::from_toml_str("policy_update_interval_seconds = \"soon\"").unwrap_err();
        assert_eq!(err.error_code(), "CONFIG_ERROR");
    }
}
