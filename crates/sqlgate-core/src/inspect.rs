//! Lightweight SQL inspection.
//!
//! The proxy never parses SQL semantically; it tokenizes just enough for
//! routing, policy, and masking decisions: statement type, referenced
//! tables, WHERE/LIMIT presence, and a normalized form for hashing. All
//! patterns are compiled once.

use std::sync::OnceLock;

use md5::{Digest, Md5};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

/// Statement classification used for routing and distribution decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueryType {
    /// `SELECT` (and other row-returning reads).
    Select,
    /// `INSERT`.
    Insert,
    /// `UPDATE`.
    Update,
    /// `DELETE`.
    Delete,
    /// Schema statements (`CREATE`, `ALTER`, `DROP`, `TRUNCATE`).
    Ddl,
    /// Everything else (`SHOW`, `EXPLAIN`, transaction control, ...).
    Other,
}

impl QueryType {
    /// Wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Select => "SELECT",
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Ddl => "DDL",
            Self::Other => "OTHER",
        }
    }

    /// Whether a statement of this type may be retried on another backend.
    #[must_use]
    pub const fn is_idempotent(self) -> bool {
        matches!(self, Self::Select)
    }

    /// Whether this is a data-modifying statement.
    #[must_use]
    pub const fn is_write(self) -> bool {
        matches!(self, Self::Insert | Self::Update | Self::Delete)
    }
}

impl std::fmt::Display for QueryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of inspecting one statement.
#[derive(Debug, Clone)]
pub struct QueryInfo {
    /// Statement classification.
    pub query_type: QueryType,
    /// Tables referenced via FROM/JOIN/INTO/UPDATE, lower-cased.
    pub tables: Vec<String>,
    /// Whether a WHERE clause is present.
    pub has_where: bool,
    /// LIMIT value, when present.
    pub limit: Option<u64>,
}

fn ci(pattern: &str) -> Regex {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .expect("static pattern compiles")
}

fn table_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| ci(r"(?:FROM|JOIN|INTO|UPDATE)\s+([A-Za-z_][A-Za-z0-9_.]*)"))
}

fn where_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| ci(r"\bWHERE\b"))
}

fn limit_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| ci(r"\bLIMIT\s+(\d+)"))
}

/// Classify a statement by its leading keyword.
#[must_use]
pub fn query_type(query: &str) -> QueryType {
    let head = query
        .trim_start()
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_uppercase();
    match head.as_str() {
        "SELECT" | "WITH" => QueryType::Select,
        "INSERT" => QueryType::Insert,
        "UPDATE" => QueryType::Update,
        "DELETE" => QueryType::Delete,
        "CREATE" | "ALTER" | "DROP" | "TRUNCATE" => QueryType::Ddl,
        _ => QueryType::Other,
    }
}

/// Inspect a statement for routing, policy, and masking decisions.
#[must_use]
pub fn inspect(query: &str) -> QueryInfo {
    let mut tables: Vec<String> = Vec::new();
    for caps in table_regex().captures_iter(query) {
        if let Some(m) = caps.get(1) {
            let table = m.as_str().to_ascii_lowercase();
            if !tables.contains(&table) {
                tables.push(table);
            }
        }
    }

    QueryInfo {
        query_type: query_type(query),
        tables,
        has_where: where_regex().is_match(query),
        limit: limit_regex()
            .captures(query)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse().ok()),
    }
}

/// Normalize a statement for hashing: collapse whitespace and lowercase
/// everything outside single-quoted string literals.
#[must_use]
pub fn normalize(query: &str) -> String {
    let mut out = String::with_capacity(query.len());
    let mut in_string = false;
    let mut last_was_space = false;

    for c in query.trim().chars() {
        if in_string {
            out.push(c);
            if c == '\'' {
                in_string = false;
            }
            last_was_space = false;
            continue;
        }
        if c == '\'' {
            in_string = true;
            out.push(c);
            last_was_space = false;
        } else if c.is_whitespace() {
            if !last_was_space {
                out.push(' ');
                last_was_space = true;
            }
        } else {
            out.push(c.to_ascii_lowercase());
            last_was_space = false;
        }
    }
    if out.ends_with(' ') {
        out.pop();
    }
    out
}

/// MD5 hash of the normalized statement, as carried on audit rows.
#[must_use]
pub fn query_hash(query: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(normalize(query).as_bytes());
    hex::encode(hasher.finalize())
}
