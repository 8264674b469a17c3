//! Result masking pipeline.
//!
//! Masking rules map `(table_regex, column_regex)` patterns to a strategy
//! and options; the highest-priority matching rule wins per column,
//! deterministically. A secondary pass runs PII detectors over string cells
//! and masks matches in place even when no column rule applied.
//!
//! Rules are compiled once at load time and swapped as an immutable
//! snapshot, so the per-row path never compiles a pattern.

mod detectors;
mod strategies;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use sqlgate_error::{Result, SqlGateError};

pub use detectors::PiiDetectors;

/// Masking strategy applied to matched cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskingType {
    /// Replace every character with the mask character or `replacement`.
    Full,
    /// Keep `start_chars`/`end_chars`, mask the middle.
    Partial,
    /// Replace with a salted cryptographic hash.
    Hash,
    /// Replace with a stable process-local token.
    Tokenize,
    /// Replace with the literal `[REDACTED]`.
    Redact,
    /// Replace with a category-aware stable pseudonym.
    Pseudonymize,
    /// Replace with a coarser bucket (age ranges, date periods, ...).
    Generalize,
    /// Substitute per character class, preserving format.
    FormatPreserving,
    /// Emit SQL NULL.
    Nullify,
    /// Delegate to a registered custom function.
    Custom,
}

/// Category of sensitive data, used by pseudonymization and generalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataCategory {
    /// Personally identifiable information.
    Pii,
    /// Protected health information.
    Phi,
    /// Payment card data.
    Pci,
    /// Credentials (passwords, API keys).
    Credentials,
    /// Financial data.
    Financial,
    /// Location data.
    Location,
    /// General confidential data.
    Confidential,
    /// Custom category.
    Custom,
}

impl DataCategory {
    /// Stable name used for pseudonym map keys.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pii => "pii",
            Self::Phi => "phi",
            Self::Pci => "pci",
            Self::Credentials => "credentials",
            Self::Financial => "financial",
            Self::Location => "location",
            Self::Confidential => "confidential",
            Self::Custom => "custom",
        }
    }
}

/// Declarative masking rule, as loaded from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaskingRule {
    /// Table name pattern (regex, case-insensitive). Empty matches any.
    #[serde(default)]
    pub table: String,

    /// Column name pattern (regex, case-insensitive).
    pub column: String,

    /// Strategy applied to matched cells.
    pub masking_type: MaskingType,

    /// Data category driving pseudonymization/generalization.
    #[serde(default = "default_category")]
    pub data_category: DataCategory,

    /// Value pattern; `Partial` masks only the matched spans when set.
    #[serde(default)]
    pub pattern: Option<String>,

    /// Literal replacement for `Full` masking.
    #[serde(default)]
    pub replacement: Option<String>,

    /// Strategy options (`mask_char`, `start_chars`, `hash_algorithm`, ...).
    #[serde(default)]
    pub options: Map<String, JsonValue>,

    /// Higher priority wins when several rules match a column.
    #[serde(default)]
    pub priority: i32,

    /// Human-readable description.
    #[serde(default)]
    pub description: Option<String>,
}

const fn default_category() -> DataCategory {
    DataCategory::Pii
}

/// A masking rule with its patterns compiled.
pub(crate) struct CompiledMaskingRule {
    pub(crate) raw:        MaskingRule,
    table_re:              Option<regex::Regex>,
    column_re:             Option<regex::Regex>,
    pub(crate) pattern_re: Option<regex::Regex>,
}

impl CompiledMaskingRule {
    fn compile(raw: MaskingRule) -> Result<Self> {
        let build = |pattern: &str| {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map_err(|e| {
                    SqlGateError::config(format!("invalid masking rule pattern '{pattern}': {e}"))
                })
        };
        let table_re = if raw.table.is_empty() {
            None
        } else {
            Some(build(&raw.table)?)
        };
        let column_re = if raw.column.is_empty() {
            None
        } else {
            Some(build(&raw.column)?)
        };
        let pattern_re = match &raw.pattern {
            Some(pattern) => Some(build(pattern)?),
            None => None,
        };
        Ok(Self {
            raw,
            table_re,
            column_re,
            pattern_re,
        })
    }

    fn matches(&self, table: &str, column: &str) -> bool {
        let table_ok = self.table_re.as_ref().is_none_or(|re| re.is_match(table));
        let column_ok = self.column_re.as_ref().is_none_or(|re| re.is_match(column));
        table_ok && column_ok
    }
}

/// Custom masking function: `(value, options) -> masked`.
pub type CustomMaskFn = Arc<dyn Fn(&str, &Map<String, JsonValue>) -> String + Send + Sync>;

/// Process-local stable maps for tokenization and pseudonymization.
#[derive(Default)]
pub(crate) struct MaskerState {
    pub(crate) token_by_value: Mutex<HashMap<String, String>>,
    pub(crate) value_by_token: Mutex<HashMap<String, String>>,
    pub(crate) pseudonyms:     Mutex<HashMap<(String, String), String>>,
    pub(crate) counters:       Mutex<HashMap<String, u64>>,
}

/// Masked rows plus masking metadata for the response.
#[derive(Debug, Clone)]
pub struct MaskOutcome {
    /// Rows after masking.
    pub rows: Vec<Vec<JsonValue>>,
    /// Whether anything was masked.
    pub masked: bool,
    /// Names of columns that had at least one cell masked.
    pub masked_columns: Vec<String>,
}

/// Applies masking rules and PII detectors to result sets.
pub struct ResultMasker {
    rules:                 RwLock<Arc<Vec<CompiledMaskingRule>>>,
    custom:                RwLock<HashMap<String, CustomMaskFn>>,
    pub(crate) state:      MaskerState,
    pub(crate) detectors:  PiiDetectors,
    pub(crate) salt:       String,
}

impl ResultMasker {
    /// Masker with no rules; the PII detector pass still applies.
    #[must_use]
    pub fn new(salt: impl Into<String>) -> Self {
        Self {
            rules:     RwLock::new(Arc::new(Vec::new())),
            custom:    RwLock::new(HashMap::new()),
            state:     MaskerState::default(),
            detectors: PiiDetectors::new(),
            salt:      salt.into(),
        }
    }

    /// Register a custom masking function. Must happen before loading rules
    /// that reference it.
    pub fn register_custom<F>(&self, name: &str, f: F)
    where
        F: Fn(&str, &Map<String, JsonValue>) -> String + Send + Sync + 'static,
    {
        self.custom.write().insert(name.to_string(), Arc::new(f));
    }

    /// Compile and install a rule set, replacing the previous snapshot.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for invalid patterns or custom rules
    /// referencing unregistered functions; the previous snapshot stays
    /// installed in that case.
    pub fn load_rules(&self, rules: Vec<MaskingRule>) -> Result<()> {
        let custom = self.custom.read();
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            if rule.masking_type == MaskingType::Custom {
                let function = rule
                    .options
                    .get("function")
                    .and_then(JsonValue::as_str)
                    .ok_or_else(|| {
                        SqlGateError::config("custom masking rule without a 'function' option")
                    })?;
                if !custom.contains_key(function) {
                    return Err(SqlGateError::config(format!(
                        "custom masking function '{function}' is not registered"
                    )));
                }
            }
            compiled.push(CompiledMaskingRule::compile(rule)?);
        }
        drop(custom);

        // Highest priority first; stable for ties.
        compiled.sort_by(|a, b| b.raw.priority.cmp(&a.raw.priority));
        let count = compiled.len();
        *self.rules.write() = Arc::new(compiled);
        tracing::info!(rules = count, "masking rules loaded");
        Ok(())
    }

    /// Mask a result set.
    ///
    /// `table_hint` is the table the columns came from, when the inspection
    /// pass found exactly one; rules with a table pattern only match when
    /// a hint is available.
    #[must_use]
    pub fn mask_results(
        &self,
        columns: &[String],
        rows: Vec<Vec<JsonValue>>,
        table_hint: Option<&str>,
    ) -> MaskOutcome {
        let rules = Arc::clone(&self.rules.read());
        let custom = self.custom.read().clone();
        let table = table_hint.unwrap_or("");

        // Highest-priority matching rule per column; rules are pre-sorted.
        let mut rule_by_column: HashMap<usize, &CompiledMaskingRule> = HashMap::new();
        for (idx, column) in columns.iter().enumerate() {
            if let Some(rule) = rules.iter().find(|r| r.matches(table, column)) {
                rule_by_column.insert(idx, rule);
            }
        }

        let mut masked_columns: Vec<String> = Vec::new();
        let mut mark = |idx: usize| {
            if let Some(name) = columns.get(idx) {
                if !masked_columns.contains(name) {
                    masked_columns.push(name.clone());
                }
            }
        };

        let mut out_rows = Vec::with_capacity(rows.len());
        for row in rows {
            let mut out_row = Vec::with_capacity(row.len());
            for (idx, cell) in row.into_iter().enumerate() {
                let cell = if let Some(rule) = rule_by_column.get(&idx) {
                    let masked = strategies::apply_rule(&cell, rule, self, &custom);
                    mark(idx);
                    masked
                } else {
                    cell
                };

                // Secondary pass: PII detectors over string cells, applied
                // even when no column rule matched.
                let cell = if let JsonValue::String(text) = &cell {
                    match self.detectors.mask_text(text) {
                        Some(masked) => {
                            mark(idx);
                            JsonValue::String(masked)
                        },
                        None => cell,
                    }
                } else {
                    cell
                };
                out_row.push(cell);
            }
            out_rows.push(out_row);
        }

        MaskOutcome {
            rows:           out_rows,
            masked:         !masked_columns.is_empty(),
            masked_columns,
        }
    }

    /// Reverse a token produced by the `Tokenize` strategy, while the
    /// process-local mapping lives.
    #[must_use]
    pub fn untokenize(&self, token: &str) -> Option<String> {
        self.state.value_by_token.lock().get(token).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(column: &str, masking_type: MaskingType) -> MaskingRule {
        MaskingRule {
            table: String::new(),
            column: column.to_string(),
            masking_type,
            data_category: DataCategory::Pii,
            pattern: None,
            replacement: None,
            options: Map::new(),
            priority: 0,
            description: None,
        }
    }

    fn masker_with(rules: Vec<MaskingRule>) -> ResultMasker {
        let masker = ResultMasker::new("unit-salt");
        masker.load_rules(rules).unwrap();
        masker
    }

    fn columns(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| (*n).to_string()).collect()
    }

    #[test]
    fn test_partial_email_mask() {
        let mut email_rule = rule("^email$", MaskingType::Partial);
        email_rule.options.insert("start_chars".to_string(), serde_json::json!(1));
        email_rule.options.insert("end_chars".to_string(), serde_json::json!(0));
        email_rule.options.insert("mask_char".to_string(), serde_json::json!("*"));
        let masker = masker_with(vec![email_rule]);

        let outcome = masker.mask_results(
            &columns(&["id", "email"]),
            vec![vec![serde_json::json!(1), serde_json::json!("alice@example.com")]],
            Some("users"),
        );

        assert!(outcome.masked);
        assert_eq!(outcome.masked_columns, vec!["email"]);
        assert_eq!(outcome.rows[0][0], serde_json::json!(1));
        assert_eq!(outcome.rows[0][1], serde_json::json!("a****************"));
    }

    #[test]
    fn test_highest_priority_rule_wins() {
        let mut low = rule("email", MaskingType::Redact);
        low.priority = 1;
        let mut high = rule("email", MaskingType::Full);
        high.priority = 10;
        high.options.insert("mask_char".to_string(), serde_json::json!("#"));
        let masker = masker_with(vec![low, high]);

        let outcome = masker.mask_results(
            &columns(&["email"]),
            vec![vec![serde_json::json!("abc")]],
            None,
        );
        assert_eq!(outcome.rows[0][0], serde_json::json!("###"));
    }

    #[test]
    fn test_table_pattern_requires_hint() {
        let mut scoped = rule("^ssn$", MaskingType::Redact);
        scoped.table = "^patients$".to_string();
        let masker = masker_with(vec![scoped]);

        let unhinted = masker.mask_results(
            &columns(&["ssn"]),
            vec![vec![serde_json::json!("not-an-ssn")]],
            None,
        );
        assert!(!unhinted.masked);

        let hinted = masker.mask_results(
            &columns(&["ssn"]),
            vec![vec![serde_json::json!("not-an-ssn")]],
            Some("patients"),
        );
        assert_eq!(hinted.rows[0][0], serde_json::json!("[REDACTED]"));
    }

    #[test]
    fn test_every_cell_of_masked_column_is_masked() {
        let masker = masker_with(vec![rule("^secret$", MaskingType::Redact)]);
        let outcome = masker.mask_results(
            &columns(&["secret"]),
            vec![
                vec![serde_json::json!("one")],
                vec![serde_json::json!("two")],
                vec![serde_json::json!("three")],
            ],
            None,
        );
        for row in &outcome.rows {
            assert_eq!(row[0], serde_json::json!("[REDACTED]"));
        }
    }

    #[test]
    fn test_nullify_emits_null() {
        let masker = masker_with(vec![rule("^token$", MaskingType::Nullify)]);
        let outcome = masker.mask_results(
            &columns(&["token"]),
            vec![vec![serde_json::json!("tok-123")]],
            None,
        );
        assert_eq!(outcome.rows[0][0], JsonValue::Null);
        assert!(outcome.masked);
    }

    #[test]
    fn test_detector_pass_without_rules() {
        let masker = ResultMasker::new("unit-salt");
        let outcome = masker.mask_results(
            &columns(&["note"]),
            vec![vec![serde_json::json!("reach me at bob@corp.example please")]],
            None,
        );
        assert!(outcome.masked);
        assert_eq!(outcome.masked_columns, vec!["note"]);
        let JsonValue::String(text) = &outcome.rows[0][0] else {
            panic!("expected string cell");
        };
        assert!(!text.contains("bob@corp.example"));
    }

    #[test]
    fn test_unmasked_results_pass_through() {
        let masker = ResultMasker::new("unit-salt");
        let rows = vec![vec![serde_json::json!(1), serde_json::json!("plain text")]];
        let outcome = masker.mask_results(&columns(&["id", "note"]), rows.clone(), None);
        assert!(!outcome.masked);
        assert!(outcome.masked_columns.is_empty());
        assert_eq!(outcome.rows, rows);
    }

    #[test]
    fn test_custom_rule_requires_registration() {
        let masker = ResultMasker::new("unit-salt");
        let mut custom = rule("x", MaskingType::Custom);
        custom
            .options
            .insert("function".to_string(), serde_json::json!("missing_fn"));
        assert!(masker.load_rules(vec![custom.clone()]).is_err());

        masker.register_custom("missing_fn", |value, _| format!("<{value}>"));
        assert!(masker.load_rules(vec![custom]).is_ok());
    }

    #[test]
    fn test_tokenize_roundtrip_within_process() {
        let masker = masker_with(vec![rule("^account$", MaskingType::Tokenize)]);
        let outcome = masker.mask_results(
            &columns(&["account"]),
            vec![vec![serde_json::json!("ACC-99")], vec![serde_json::json!("ACC-99")]],
            None,
        );

        let JsonValue::String(token_a) = &outcome.rows[0][0] else {
            panic!("expected token");
        };
        let JsonValue::String(token_b) = &outcome.rows[1][0] else {
            panic!("expected token");
        };
        // tokenize(tokenize(x)) = tokenize(x): same input, same token.
        assert_eq!(token_a, token_b);
        assert!(token_a.starts_with("TKN_"));
        assert_eq!(masker.untokenize(token_a).as_deref(), Some("ACC-99"));
    }
}
