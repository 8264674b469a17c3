//! Condition evaluation: field operators and named condition functions.
//!
//! Built-in functions are registered at engine construction; custom
//! handlers are registered by name and resolved at rule-load time, with an
//! error on miss. Time-based functions read an injected [`Clock`] so
//! decisions stay deterministic under test.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveTime, Timelike, Utc};
use serde_json::{Map, Value as JsonValue};

use crate::context::AuthorizationContext;
use crate::policy::ConditionOperator;

/// Source of the current time for time-based conditions.
pub trait Clock: Send + Sync {
    /// Current UTC time.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Signature of a condition function.
pub type ConditionFn =
    Arc<dyn Fn(&AuthorizationContext, &Map<String, JsonValue>, &dyn Clock) -> bool + Send + Sync>;

/// Registry of named condition functions.
pub struct ConditionRegistry {
    functions: HashMap<String, ConditionFn>,
    clock:     Arc<dyn Clock>,
}

impl ConditionRegistry {
    /// Registry with all built-ins, using the given clock.
    #[must_use]
    pub fn with_builtins(clock: Arc<dyn Clock>) -> Self {
        let mut registry = Self {
            functions: HashMap::new(),
            clock,
        };
        registry.register("in_time_window", |ctx, params, clock| {
            in_time_window(ctx, params, clock)
        });
        registry.register("match_ip_range", |ctx, params, _| match_ip_range(ctx, params));
        registry.register("match_regex", |ctx, params, _| match_regex(ctx, params));
        registry.register("is_weekend", |_, _, clock| is_weekend(clock));
        registry.register("is_business_hours", |_, params, clock| {
            is_business_hours(params, clock)
        });
        registry.register("has_role", |ctx, params, _| has_role(ctx, params));
        registry.register("table_in_list", |_, params, _| table_in_list(params));
        registry.register("all_tables_in_list", |ctx, params, _| {
            all_tables_in_list(ctx, params)
        });
        registry.register("any_table_in_list", |ctx, params, _| {
            any_table_in_list(ctx, params)
        });
        registry.register("column_in_list", |_, params, _| column_in_list(params));
        registry.register("has_where_clause", |ctx, _, _| has_where_clause(ctx));
        registry.register("row_limit_under", |ctx, params, _| row_limit_under(ctx, params));
        registry
    }

    /// Register a function under a name, replacing any previous handler.
    pub fn register<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&AuthorizationContext, &Map<String, JsonValue>, &dyn Clock) -> bool
            + Send
            + Sync
            + 'static,
    {
        self.functions.insert(name.to_string(), Arc::new(f));
    }

    /// Whether a function name resolves.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Call a function; unknown names evaluate to false.
    #[must_use]
    pub fn call(
        &self,
        name: &str,
        ctx: &AuthorizationContext,
        params: &Map<String, JsonValue>,
    ) -> bool {
        match self.functions.get(name) {
            Some(f) => f(ctx, params, self.clock.as_ref()),
            None => {
                tracing::warn!(function = name, "unknown condition function");
                false
            },
        }
    }
}

/// Render a condition value the way comparisons expect: bare strings stay
/// bare, everything else uses its JSON rendering.
#[must_use]
pub fn value_as_string(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Evaluate a field comparison.
#[must_use]
pub fn evaluate_operator(
    operator: ConditionOperator,
    field_value: &str,
    condition_value: &JsonValue,
) -> bool {
    let expected = value_as_string(condition_value);
    match operator {
        ConditionOperator::Eq => field_value == expected,
        ConditionOperator::Neq => field_value != expected,
        ConditionOperator::In => csv_list(&expected).iter().any(|v| v == field_value),
        ConditionOperator::NotIn => !csv_list(&expected).iter().any(|v| v == field_value),
        ConditionOperator::Contains => field_value.contains(&expected),
        ConditionOperator::NotContains => !field_value.contains(&expected),
        ConditionOperator::StartsWith => field_value.starts_with(&expected),
        ConditionOperator::EndsWith => field_value.ends_with(&expected),
        ConditionOperator::Regex => regex::Regex::new(&expected)
            .is_ok_and(|re| re.is_match(field_value)),
        ConditionOperator::Gt => numeric(field_value, &expected).is_some_and(|(a, b)| a > b),
        ConditionOperator::Gte => numeric(field_value, &expected).is_some_and(|(a, b)| a >= b),
        ConditionOperator::Lt => numeric(field_value, &expected).is_some_and(|(a, b)| a < b),
        ConditionOperator::Lte => numeric(field_value, &expected).is_some_and(|(a, b)| a <= b),
    }
}

fn csv_list(value: &str) -> Vec<String> {
    value.split(',').map(|v| v.trim().to_string()).collect()
}

fn numeric(a: &str, b: &str) -> Option<(f64, f64)> {
    Some((a.parse().ok()?, b.parse().ok()?))
}

fn param_str<'a>(params: &'a Map<String, JsonValue>, key: &str) -> Option<&'a str> {
    params.get(key).and_then(JsonValue::as_str)
}

fn param_list(params: &Map<String, JsonValue>, key: &str) -> Vec<String> {
    match params.get(key) {
        Some(JsonValue::Array(items)) => items
            .iter()
            .map(|v| value_as_string(v).trim().to_string())
            .collect(),
        Some(JsonValue::String(s)) => csv_list(s),
        _ => Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// Built-in condition functions
// ---------------------------------------------------------------------------

fn in_time_window(
    _ctx: &AuthorizationContext,
    params: &Map<String, JsonValue>,
    clock: &dyn Clock,
) -> bool {
    let (Some(start), Some(end)) = (param_str(params, "start_time"), param_str(params, "end_time"))
    else {
        return false;
    };
    let (Ok(start), Ok(end)) = (
        NaiveTime::parse_from_str(start, "%H:%M"),
        NaiveTime::parse_from_str(end, "%H:%M"),
    ) else {
        tracing::error!(start, end, "invalid time format for in_time_window");
        return false;
    };

    let now = clock.now().time();
    // Overnight windows (e.g. 22:00 - 06:00) wrap past midnight.
    if start > end {
        now >= start || now <= end
    } else {
        start <= now && now <= end
    }
}

fn ipv4_to_u32(ip: &str) -> Option<u32> {
    let mut octets = [0u32; 4];
    let mut count = 0;
    for part in ip.trim().split('.') {
        if count == 4 {
            return None;
        }
        octets[count] = part.parse::<u32>().ok().filter(|v| *v <= 255)?;
        count += 1;
    }
    if count != 4 {
        return None;
    }
    Some((octets[0] << 24) + (octets[1] << 16) + (octets[2] << 8) + octets[3])
}

fn match_ip_range(ctx: &AuthorizationContext, params: &Map<String, JsonValue>) -> bool {
    let ranges = param_list(params, "ip_ranges");
    let Some(client_ip) = ctx.client_ip.as_deref() else {
        return false;
    };
    let Some(client) = ipv4_to_u32(client_ip) else {
        return false;
    };

    for range in &ranges {
        if let Some((start, end)) = range.split_once('-') {
            let (Some(start), Some(end)) = (ipv4_to_u32(start), ipv4_to_u32(end)) else {
                continue;
            };
            if start <= client && client <= end {
                return true;
            }
        } else if let Some((network, bits)) = range.split_once('/') {
            let (Some(network), Ok(bits)) = (ipv4_to_u32(network), bits.trim().parse::<u32>())
            else {
                continue;
            };
            if bits > 32 {
                continue;
            }
            let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
            if client & mask == network & mask {
                return true;
            }
        } else if ipv4_to_u32(range) == Some(client) {
            return true;
        }
    }
    false
}

fn match_regex(ctx: &AuthorizationContext, params: &Map<String, JsonValue>) -> bool {
    let (Some(field), Some(pattern)) = (param_str(params, "field"), param_str(params, "pattern"))
    else {
        return false;
    };
    let Some(field_value) = ctx.field(field) else {
        return false;
    };
    regex::Regex::new(pattern).is_ok_and(|re| re.is_match(&field_value))
}

fn is_weekend(clock: &dyn Clock) -> bool {
    // Monday = 0 ... Sunday = 6.
    clock.now().weekday().num_days_from_monday() >= 5
}

fn is_business_hours(params: &Map<String, JsonValue>, clock: &dyn Clock) -> bool {
    let start_hour = params.get("start_hour").and_then(JsonValue::as_u64).unwrap_or(9);
    let end_hour = params.get("end_hour").and_then(JsonValue::as_u64).unwrap_or(17);
    let business_days: Vec<u64> = match params.get("business_days") {
        Some(JsonValue::Array(days)) => days.iter().filter_map(JsonValue::as_u64).collect(),
        _ => vec![0, 1, 2, 3, 4],
    };

    let now = clock.now();
    let day = u64::from(now.weekday().num_days_from_monday());
    if !business_days.contains(&day) {
        return false;
    }
    let hour = u64::from(now.hour());
    start_hour <= hour && hour < end_hour
}

fn has_role(ctx: &AuthorizationContext, params: &Map<String, JsonValue>) -> bool {
    let roles = param_list(params, "roles");
    !roles.is_empty() && roles.iter().any(|r| r == &ctx.role)
}

fn table_in_list(params: &Map<String, JsonValue>) -> bool {
    let Some(table) = param_str(params, "table_name") else {
        return false;
    };
    let allowed = param_list(params, "allowed_tables");
    !allowed.is_empty() && allowed.iter().any(|t| t == table)
}

fn all_tables_in_list(ctx: &AuthorizationContext, params: &Map<String, JsonValue>) -> bool {
    let allowed = param_list(params, "allowed_tables");
    if allowed.is_empty() || ctx.tables.is_empty() {
        return false;
    }
    ctx.tables.iter().all(|t| allowed.contains(t))
}

fn any_table_in_list(ctx: &AuthorizationContext, params: &Map<String, JsonValue>) -> bool {
    let allowed = param_list(params, "allowed_tables");
    if allowed.is_empty() || ctx.tables.is_empty() {
        return false;
    }
    ctx.tables.iter().any(|t| allowed.contains(t))
}

fn column_in_list(params: &Map<String, JsonValue>) -> bool {
    let Some(column) = param_str(params, "column_name") else {
        return false;
    };
    let allowed = param_list(params, "allowed_columns");
    !allowed.is_empty() && allowed.iter().any(|c| c == column)
}

fn where_regex() -> &'static regex::Regex {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| {
        regex::RegexBuilder::new(r"\bWHERE\b")
            .case_insensitive(true)
            .build()
            .expect("static pattern compiles")
    })
}

fn limit_regex() -> &'static regex::Regex {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| {
        regex::RegexBuilder::new(r"\bLIMIT\s+(\d+)")
            .case_insensitive(true)
            .build()
            .expect("static pattern compiles")
    })
}

fn has_where_clause(ctx: &AuthorizationContext) -> bool {
    ctx.query_text
        .as_deref()
        .is_some_and(|q| where_regex().is_match(q))
}

fn row_limit_under(ctx: &AuthorizationContext, params: &Map<String, JsonValue>) -> bool {
    let max_limit = params.get("max_limit").and_then(JsonValue::as_u64).unwrap_or(1000);
    let Some(query) = ctx.query_text.as_deref() else {
        return false;
    };
    limit_regex()
        .captures(query)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u64>().ok())
        .is_some_and(|limit| limit <= max_limit)
}
