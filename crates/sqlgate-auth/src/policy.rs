//! Policy data model and stores.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use sqlgate_error::{Result, SqlGateError};

/// Effect of a matching rule or a policy default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    /// Permit the request.
    Allow,
    /// Reject the request.
    Deny,
}

/// Comparison operator for field conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    /// String equality.
    Eq,
    /// String inequality.
    Neq,
    /// Membership in a comma-separated list.
    In,
    /// Non-membership in a comma-separated list.
    NotIn,
    /// Substring containment.
    Contains,
    /// Substring non-containment.
    NotContains,
    /// Prefix match.
    StartsWith,
    /// Suffix match.
    EndsWith,
    /// Anchored regular expression match.
    Regex,
    /// Numeric greater-than.
    Gt,
    /// Numeric greater-or-equal.
    Gte,
    /// Numeric less-than.
    Lt,
    /// Numeric less-or-equal.
    Lte,
}

/// One condition inside a rule: either a field comparison or a named
/// function call with parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyCondition {
    /// Context field to compare, for operator conditions.
    #[serde(default)]
    pub field: Option<String>,

    /// Comparison operator, for operator conditions.
    #[serde(default)]
    pub operator: Option<ConditionOperator>,

    /// Comparison value.
    #[serde(default)]
    pub value: Option<JsonValue>,

    /// Named condition function, for function conditions.
    #[serde(default)]
    pub function: Option<String>,

    /// Parameters passed to the condition function.
    #[serde(default)]
    pub parameters: Map<String, JsonValue>,
}

/// An allow/deny rule with priority and conditions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Rule identifier, referenced in audit and denial reasons.
    pub id: i64,

    /// Rule name.
    pub name: String,

    /// Evaluation priority; higher evaluates first.
    #[serde(default)]
    pub priority: i32,

    /// Effect when the rule matches.
    pub effect: Effect,

    /// Rule conditions.
    #[serde(default)]
    pub conditions: Vec<PolicyCondition>,

    /// Message surfaced with the decision.
    #[serde(default)]
    pub message: Option<String>,

    /// AND the conditions together when true, OR them otherwise.
    #[serde(default = "default_true")]
    pub all_conditions_required: bool,
}

const fn default_true() -> bool {
    true
}

/// A policy: an ordered set of rules for one resource type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    /// Policy identifier.
    pub id: i64,

    /// Policy name.
    pub name: String,

    /// Resource type this policy governs; `*` matches every resource.
    pub resource_type: String,

    /// Evaluation priority; higher evaluates first.
    #[serde(default)]
    pub priority: i32,

    /// Effect applied when no rule matches. `None` lets evaluation fall
    /// through to lower-priority policies.
    #[serde(default)]
    pub default_effect: Option<Effect>,

    /// The policy's rules.
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

/// Source of authorization policies.
pub trait PolicyStore: Send + Sync {
    /// Load the current policy set.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store is unavailable or its
    /// contents fail to parse; the engine then keeps its previous snapshot.
    fn load(&self) -> Result<Vec<Policy>>;
}

/// In-memory policy store, primarily for tests and embedded setups.
#[derive(Default)]
pub struct MemoryPolicyStore {
    policies: Mutex<Vec<Policy>>,
    failing:  AtomicBool,
}

impl MemoryPolicyStore {
    /// Create a store with an initial policy set.
    #[must_use]
    pub fn new(policies: Vec<Policy>) -> Self {
        Self {
            policies: Mutex::new(policies),
            failing:  AtomicBool::new(false),
        }
    }

    /// Replace the stored policy set.
    pub fn set(&self, policies: Vec<Policy>) {
        *self.policies.lock() = policies;
    }

    /// Make subsequent loads fail (exercises the keep-previous-snapshot
    /// behavior).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl PolicyStore for MemoryPolicyStore {
    fn load(&self) -> Result<Vec<Policy>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SqlGateError::config("policy store unavailable"));
        }
        Ok(self.policies.lock().clone())
    }
}

#[derive(Deserialize)]
struct PolicyFile {
    #[serde(default)]
    policies: Vec<Policy>,
}

/// Policy store reading a TOML file on every load.
pub struct TomlPolicyStore {
    path: PathBuf,
}

impl TomlPolicyStore {
    /// Create a store over a TOML file with a top-level `policies` array.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl PolicyStore for TomlPolicyStore {
    fn load(&self) -> Result<Vec<Policy>> {
        let text = std::fs::read_to_string(&self.path).map_err(|e| {
            SqlGateError::config(format!(
                "cannot read policy file {}: {e}",
                self.path.display()
            ))
        })?;
        let file: PolicyFile = toml::from_str(&text)
            .map_err(|e| SqlGateError::config(format!("invalid policy file: {e}")))?;
        Ok(file.policies)
    }
}
