//! Policy evaluation engine.
//!
//! The engine holds an immutable compiled snapshot of the loaded policies.
//! Reloads build a fresh snapshot off to the side (validating function
//! references and precompiling regex patterns) and swap it atomically;
//! a failed load keeps the previous snapshot authoritative.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use regex::Regex;
use sqlgate_error::{Result, SqlGateError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::conditions::{evaluate_operator, value_as_string, ConditionRegistry};
use crate::context::{AuthorizationContext, AuthorizationResult};
use crate::policy::{ConditionOperator, Effect, Policy, PolicyCondition, PolicyRule, PolicyStore};

struct CompiledCondition {
    raw:   PolicyCondition,
    // Precompiled pattern for regex-operator conditions.
    regex: Option<Regex>,
}

struct CompiledRule {
    raw:        PolicyRule,
    conditions: Vec<CompiledCondition>,
}

struct CompiledPolicy {
    raw:   Policy,
    rules: Vec<CompiledRule>,
}

/// One immutable generation of loaded policies.
struct PolicySnapshot {
    policies:  Vec<CompiledPolicy>,
    loaded_at: DateTime<Utc>,
}

impl PolicySnapshot {
    fn empty() -> Self {
        Self {
            policies:  Vec::new(),
            loaded_at: Utc::now(),
        }
    }

    fn compile(mut policies: Vec<Policy>, registry: &ConditionRegistry) -> Result<Self> {
        // Higher priority first; stable sort keeps load order for ties.
        policies.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut compiled_policies = Vec::with_capacity(policies.len());
        for policy in policies {
            let mut rules: Vec<PolicyRule> = policy.rules.clone();
            rules.sort_by(|a, b| b.priority.cmp(&a.priority));

            let mut compiled_rules = Vec::with_capacity(rules.len());
            for rule in rules {
                let mut conditions = Vec::with_capacity(rule.conditions.len());
                for condition in &rule.conditions {
                    if let Some(function) = &condition.function {
                        if !registry.contains(function) {
                            return Err(SqlGateError::config(format!(
                                "policy '{}' rule '{}' references unknown condition function '{function}'",
                                policy.name, rule.name
                            )));
                        }
                    }
                    let regex = match (&condition.operator, &condition.value) {
                        (Some(ConditionOperator::Regex), Some(value)) => {
                            let pattern = value_as_string(value);
                            Some(Regex::new(&pattern).map_err(|e| {
                                SqlGateError::config(format!(
                                    "policy '{}' rule '{}' has invalid regex: {e}",
                                    policy.name, rule.name
                                ))
                            })?)
                        },
                        _ => None,
                    };
                    conditions.push(CompiledCondition {
                        raw: condition.clone(),
                        regex,
                    });
                }
                compiled_rules.push(CompiledRule {
                    raw: rule,
                    conditions,
                });
            }
            compiled_policies.push(CompiledPolicy {
                raw:   policy,
                rules: compiled_rules,
            });
        }

        Ok(Self {
            policies:  compiled_policies,
            loaded_at: Utc::now(),
        })
    }
}

/// Authorization policy engine with interval reload.
pub struct PolicyEngine {
    store:    Arc<dyn PolicyStore>,
    registry: Arc<ConditionRegistry>,
    snapshot: RwLock<Arc<PolicySnapshot>>,
}

impl PolicyEngine {
    /// Create an engine over a store and condition registry.
    ///
    /// The engine starts with an empty snapshot (which denies everything);
    /// call [`PolicyEngine::reload`] to load the initial policy set.
    #[must_use]
    pub fn new(store: Arc<dyn PolicyStore>, registry: Arc<ConditionRegistry>) -> Self {
        Self {
            store,
            registry,
            snapshot: RwLock::new(Arc::new(PolicySnapshot::empty())),
        }
    }

    /// Load policies from the store and swap the snapshot.
    ///
    /// # Errors
    ///
    /// Returns the load or compile error; the previous snapshot stays
    /// authoritative in that case.
    pub fn reload(&self) -> Result<()> {
        let policies = match self.store.load() {
            Ok(policies) => policies,
            Err(e) => {
                tracing::error!(error = %e, "policy load failed; keeping previous snapshot");
                return Err(e);
            },
        };
        let snapshot = match PolicySnapshot::compile(policies, &self.registry) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::error!(error = %e, "policy compile failed; keeping previous snapshot");
                return Err(e);
            },
        };

        let policy_count = snapshot.policies.len();
        let rule_count: usize = snapshot.policies.iter().map(|p| p.rules.len()).sum();
        *self.snapshot.write() = Arc::new(snapshot);
        tracing::info!(policies = policy_count, rules = rule_count, "authorization policies loaded");
        Ok(())
    }

    /// When the current snapshot was loaded.
    #[must_use]
    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.snapshot.read().loaded_at
    }

    /// Evaluate a request context against the current snapshot.
    #[must_use]
    pub fn evaluate(&self, ctx: &AuthorizationContext) -> AuthorizationResult {
        let snapshot = Arc::clone(&self.snapshot.read());

        for policy in &snapshot.policies {
            if policy.raw.resource_type != ctx.resource && policy.raw.resource_type != "*" {
                continue;
            }
            if let Some(result) = self.evaluate_policy(policy, ctx) {
                return result;
            }
        }

        AuthorizationResult::default_deny()
    }

    fn evaluate_policy(
        &self,
        policy: &CompiledPolicy,
        ctx: &AuthorizationContext,
    ) -> Option<AuthorizationResult> {
        for rule in &policy.rules {
            if !Self::rule_applies_to_action(rule, ctx) {
                continue;
            }
            if self.rule_matches(rule, ctx) {
                let allowed = rule.raw.effect == Effect::Allow;
                return Some(AuthorizationResult {
                    allowed,
                    policy_id:   Some(policy.raw.id),
                    policy_name: Some(policy.raw.name.clone()),
                    rule_id:     Some(rule.raw.id),
                    rule_name:   Some(rule.raw.name.clone()),
                    message:     rule.raw.message.clone(),
                    reason:      format!("rule_{}", rule.raw.id),
                });
            }
        }

        policy.raw.default_effect.map(|effect| AuthorizationResult {
            allowed:     effect == Effect::Allow,
            policy_id:   Some(policy.raw.id),
            policy_name: Some(policy.raw.name.clone()),
            rule_id:     None,
            rule_name:   None,
            message:     Some(format!(
                "Default policy effect: {}",
                if effect == Effect::Allow { "allow" } else { "deny" }
            )),
            reason:      "policy_default".to_string(),
        })
    }

    /// A rule with no action condition applies to every action.
    fn rule_applies_to_action(rule: &CompiledRule, ctx: &AuthorizationContext) -> bool {
        let mut has_action_condition = false;
        for condition in &rule.conditions {
            let Some(field) = condition.raw.field.as_deref() else {
                continue;
            };
            if field != "action" {
                continue;
            }
            has_action_condition = true;
            let Some(value) = &condition.raw.value else {
                continue;
            };
            let matched = match condition.raw.operator {
                Some(ConditionOperator::Eq) => value_as_string(value) == ctx.action,
                Some(ConditionOperator::In) => value_as_string(value)
                    .split(',')
                    .any(|v| v.trim() == ctx.action),
                Some(ConditionOperator::Regex) => condition
                    .regex
                    .as_ref()
                    .is_some_and(|re| re.is_match(&ctx.action)),
                _ => false,
            };
            if matched {
                return true;
            }
        }
        !has_action_condition
    }

    fn rule_matches(&self, rule: &CompiledRule, ctx: &AuthorizationContext) -> bool {
        if rule.conditions.is_empty() {
            return true;
        }

        let mut results = rule
            .conditions
            .iter()
            .map(|condition| self.evaluate_condition(condition, ctx));

        if rule.raw.all_conditions_required {
            results.all(|r| r)
        } else {
            results.any(|r| r)
        }
    }

    fn evaluate_condition(&self, condition: &CompiledCondition, ctx: &AuthorizationContext) -> bool {
        if let Some(function) = &condition.raw.function {
            return self.registry.call(function, ctx, &condition.raw.parameters);
        }

        let (Some(field), Some(operator), Some(value)) = (
            condition.raw.field.as_deref(),
            condition.raw.operator,
            condition.raw.value.as_ref(),
        ) else {
            return false;
        };
        let Some(field_value) = ctx.field(field) else {
            return false;
        };

        if operator == ConditionOperator::Regex {
            return condition
                .regex
                .as_ref()
                .is_some_and(|re| re.is_match(&field_value));
        }
        evaluate_operator(operator, &field_value, value)
    }

    /// Spawn the interval reloader; it stops when the shutdown token fires.
    #[must_use]
    pub fn spawn_reloader(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately and performs the initial load.
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => {
                        tracing::debug!("policy reloader stopping");
                        return;
                    }
                    _ = ticker.tick() => {
                        // Errors keep the previous snapshot; already logged.
                        let _ = self.reload();
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::SystemClock;
    use crate::policy::MemoryPolicyStore;
    use serde_json::Map;

    fn registry() -> Arc<ConditionRegistry> {
        Arc::new(ConditionRegistry::with_builtins(Arc::new(SystemClock)))
    }

    fn condition_fn(function: &str, parameters: serde_json::Value) -> PolicyCondition {
        PolicyCondition {
            field:      None,
            operator:   None,
            value:      None,
            function:   Some(function.to_string()),
            parameters: parameters.as_object().cloned().unwrap_or_default(),
        }
    }

    fn condition_field(field: &str, operator: ConditionOperator, value: serde_json::Value) -> PolicyCondition {
        PolicyCondition {
            field:      Some(field.to_string()),
            operator:   Some(operator),
            value:      Some(value),
            function:   None,
            parameters: Map::new(),
        }
    }

    fn engine_with(policies: Vec<Policy>) -> PolicyEngine {
        let engine = PolicyEngine::new(Arc::new(MemoryPolicyStore::new(policies)), registry());
        engine.reload().unwrap();
        engine
    }

    fn intern_filter_policy() -> Policy {
        Policy {
            id:             1,
            name:           "intern-guard".to_string(),
            resource_type:  "query".to_string(),
            priority:       100,
            default_effect: Some(Effect::Allow),
            rules:          vec![PolicyRule {
                id: 10,
                name: "deny-unfiltered-interns".to_string(),
                priority: 10,
                effect: Effect::Deny,
                conditions: vec![
                    condition_field("role", ConditionOperator::Eq, serde_json::json!("intern")),
                    condition_fn("has_where_clause", serde_json::json!({})),
                ],
                message: Some("interns must filter queries".to_string()),
                all_conditions_required: true,
            }],
        }
    }

    #[test]
    fn test_no_policies_denies() {
        let engine = engine_with(Vec::new());
        let result = engine.evaluate(&AuthorizationContext::for_query("a", "admin", "SELECT 1"));
        assert!(!result.allowed);
        assert_eq!(result.reason, "default_deny");
    }

    #[test]
    fn test_rule_match_wins_over_default() {
        let engine = engine_with(vec![intern_filter_policy()]);

        // The deny rule requires role=intern AND has_where_clause.
        let filtered = AuthorizationContext::for_query(
            "bob",
            "intern",
            "SELECT * FROM orders WHERE id = 1",
        );
        let result = engine.evaluate(&filtered);
        assert!(!result.allowed);
        assert_eq!(result.rule_id, Some(10));

        let analyst = AuthorizationContext::for_query("alice", "analyst", "SELECT 1");
        let result = engine.evaluate(&analyst);
        assert!(result.allowed);
        assert_eq!(result.reason, "policy_default");
    }

    #[test]
    fn test_priority_orders_policies() {
        let low = Policy {
            id:             1,
            name:           "allow-all".to_string(),
            resource_type:  "*".to_string(),
            priority:       1,
            default_effect: Some(Effect::Allow),
            rules:          Vec::new(),
        };
        let high = Policy {
            id:             2,
            name:           "deny-service".to_string(),
            resource_type:  "query".to_string(),
            priority:       50,
            default_effect: None,
            rules:          vec![PolicyRule {
                id: 20,
                name: "deny-service-role".to_string(),
                priority: 0,
                effect: Effect::Deny,
                conditions: vec![condition_field(
                    "role",
                    ConditionOperator::Eq,
                    serde_json::json!("service"),
                )],
                message: None,
                all_conditions_required: true,
            }],
        };
        let engine = engine_with(vec![low, high]);

        let service = AuthorizationContext::for_query("svc", "service", "SELECT 1");
        let result = engine.evaluate(&service);
        assert!(!result.allowed);
        assert_eq!(result.policy_id, Some(2));

        let admin = AuthorizationContext::for_query("root", "admin", "SELECT 1");
        assert!(engine.evaluate(&admin).allowed);
    }

    #[test]
    fn test_or_conditions() {
        let policy = Policy {
            id:             1,
            name:           "broad".to_string(),
            resource_type:  "query".to_string(),
            priority:       0,
            default_effect: Some(Effect::Deny),
            rules:          vec![PolicyRule {
                id: 30,
                name: "allow-privileged".to_string(),
                priority: 0,
                effect: Effect::Allow,
                conditions: vec![
                    condition_field("role", ConditionOperator::Eq, serde_json::json!("admin")),
                    condition_field("role", ConditionOperator::Eq, serde_json::json!("service")),
                ],
                message: None,
                all_conditions_required: false,
            }],
        };
        let engine = engine_with(vec![policy]);

        assert!(engine
            .evaluate(&AuthorizationContext::for_query("a", "admin", "SELECT 1"))
            .allowed);
        assert!(engine
            .evaluate(&AuthorizationContext::for_query("s", "service", "SELECT 1"))
            .allowed);
        assert!(!engine
            .evaluate(&AuthorizationContext::for_query("i", "intern", "SELECT 1"))
            .allowed);
    }

    #[test]
    fn test_unknown_function_rejected_at_load() {
        let policy = Policy {
            id:             1,
            name:           "broken".to_string(),
            resource_type:  "*".to_string(),
            priority:       0,
            default_effect: None,
            rules:          vec![PolicyRule {
                id: 40,
                name: "bad".to_string(),
                priority: 0,
                effect: Effect::Allow,
                conditions: vec![condition_fn("does_not_exist", serde_json::json!({}))],
                message: None,
                all_conditions_required: true,
            }],
        };
        let engine = PolicyEngine::new(Arc::new(MemoryPolicyStore::new(vec![policy])), registry());
        assert!(engine.reload().is_err());
    }

    #[test]
    fn test_load_failure_keeps_previous_snapshot() {
        let store = Arc::new(MemoryPolicyStore::new(vec![Policy {
            id:             1,
            name:           "allow".to_string(),
            resource_type:  "*".to_string(),
            priority:       0,
            default_effect: Some(Effect::Allow),
            rules:          Vec::new(),
        }]));
        let engine = PolicyEngine::new(Arc::clone(&store) as Arc<dyn PolicyStore>, registry());
        engine.reload().unwrap();

        store.set_failing(true);
        assert!(engine.reload().is_err());

        // Previous snapshot remains authoritative.
        let ctx = AuthorizationContext::for_query("a", "admin", "SELECT 1");
        assert!(engine.evaluate(&ctx).allowed);
    }

    #[test]
    fn test_deterministic_evaluation() {
        let engine = engine_with(vec![intern_filter_policy()]);
        let ctx = AuthorizationContext::for_query(
            "bob",
            "intern",
            "SELECT * FROM orders WHERE id = 1",
        );
        let first = engine.evaluate(&ctx);
        for _ in 0..10 {
            let again = engine.evaluate(&ctx);
            assert_eq!(first.allowed, again.allowed);
            assert_eq!(first.reason, again.reason);
        }
    }

    #[test]
    fn test_action_scoped_rule_skipped_for_other_actions() {
        let policy = Policy {
            id:             1,
            name:           "write-guard".to_string(),
            resource_type:  "query".to_string(),
            priority:       0,
            default_effect: Some(Effect::Allow),
            rules:          vec![PolicyRule {
                id: 50,
                name: "deny-writes".to_string(),
                priority: 0,
                effect: Effect::Deny,
                conditions: vec![condition_field(
                    "action",
                    ConditionOperator::Eq,
                    serde_json::json!("write"),
                )],
                message: None,
                all_conditions_required: true,
            }],
        };
        let engine = engine_with(vec![policy]);

        // action is "execute", so the write-scoped rule does not apply and
        // the policy default allows.
        let ctx = AuthorizationContext::for_query("a", "analyst", "SELECT 1");
        let result = engine.evaluate(&ctx);
        assert!(result.allowed);
        assert_eq!(result.reason, "policy_default");
    }
}
