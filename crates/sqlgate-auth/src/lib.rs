//! Rule-based authorization policy engine.
//!
//! Policies are loaded from a [`PolicyStore`], compiled into an immutable
//! snapshot, and swapped atomically so readers never observe a partially
//! mutated rule set. Evaluation is deterministic: the same context against
//! the same snapshot always yields the same decision.
//!
//! # Decision procedure
//!
//! 1. Filter policies whose `resource_type` matches the requested resource
//!    (or `*`).
//! 2. Sort policies, then rules within a policy, by priority descending.
//! 3. For each rule, check action applicability, then evaluate conditions
//!    (AND when `all_conditions_required`, OR otherwise).
//! 4. The first matching rule's effect decides. With no rule match, the
//!    policy's `default_effect` applies. With no policy match at all,
//!    **deny**.

pub mod conditions;
pub mod context;
pub mod engine;
pub mod policy;

pub use conditions::{Clock, ConditionRegistry, SystemClock};
pub use context::{AuthorizationContext, AuthorizationResult};
pub use engine::PolicyEngine;
pub use policy::{
    ConditionOperator, Effect, MemoryPolicyStore, Policy, PolicyCondition, PolicyRule,
    PolicyStore, TomlPolicyStore,
};
