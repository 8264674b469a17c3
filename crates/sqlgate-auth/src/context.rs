//! Authorization context and decision types.

use serde::{Deserialize, Serialize};

/// Immutable context for one policy evaluation.
///
/// Constructed per request from the authenticated principal and the
/// inspected query; discarded after the decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationContext {
    /// Authenticated username.
    pub username: String,

    /// Role of the principal.
    pub role: String,

    /// Requested action (e.g. `execute`).
    pub action: String,

    /// Resource type being evaluated (e.g. `query`, `server`).
    pub resource: String,

    /// Explicit target server alias, when the request named one.
    pub server_alias: Option<String>,

    /// Tables referenced by the query, from lightweight inspection.
    pub tables: Vec<String>,

    /// Columns referenced by the query, when known.
    pub columns: Vec<String>,

    /// Client IP address.
    pub client_ip: Option<String>,

    /// Query type (`SELECT`, `UPDATE`, ...).
    pub query_type: Option<String>,

    /// Raw query text for content conditions.
    pub query_text: Option<String>,
}

impl AuthorizationContext {
    /// Context for executing a query as a principal.
    #[must_use]
    pub fn for_query(
        username: impl Into<String>,
        role: impl Into<String>,
        query_text: impl Into<String>,
    ) -> Self {
        Self {
            username:     username.into(),
            role:         role.into(),
            action:       "execute".to_string(),
            resource:     "query".to_string(),
            server_alias: None,
            tables:       Vec::new(),
            columns:      Vec::new(),
            client_ip:    None,
            query_type:   None,
            query_text:   Some(query_text.into()),
        }
    }

    /// Set the client IP.
    #[must_use]
    pub fn with_client_ip(mut self, ip: impl Into<String>) -> Self {
        self.client_ip = Some(ip.into());
        self
    }

    /// Set the referenced tables.
    #[must_use]
    pub fn with_tables(mut self, tables: Vec<String>) -> Self {
        self.tables = tables;
        self
    }

    /// Set the query type.
    #[must_use]
    pub fn with_query_type(mut self, query_type: impl Into<String>) -> Self {
        self.query_type = Some(query_type.into());
        self
    }

    /// Set the target server alias.
    #[must_use]
    pub fn with_server_alias(mut self, alias: impl Into<String>) -> Self {
        self.server_alias = Some(alias.into());
        self
    }

    /// Look up a context field by name for operator conditions.
    ///
    /// `user.username` and `user.role` are accepted as aliases so rules
    /// written against a nested principal keep working.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<String> {
        match name {
            "username" | "user.username" => Some(self.username.clone()),
            "role" | "user.role" => Some(self.role.clone()),
            "action" => Some(self.action.clone()),
            "resource" => Some(self.resource.clone()),
            "server_alias" => self.server_alias.clone(),
            "client_ip" => self.client_ip.clone(),
            "query_type" => self.query_type.clone(),
            "query_text" => self.query_text.clone(),
            _ => None,
        }
    }
}

/// Result of an authorization decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationResult {
    /// Whether the request is allowed.
    pub allowed: bool,

    /// Identifier of the deciding policy, when one matched.
    pub policy_id: Option<i64>,

    /// Name of the deciding policy.
    pub policy_name: Option<String>,

    /// Identifier of the deciding rule, when one matched.
    pub rule_id: Option<i64>,

    /// Name of the deciding rule.
    pub rule_name: Option<String>,

    /// Human-readable message.
    pub message: Option<String>,

    /// Machine-readable reason (`rule_<id>`, `policy_default`,
    /// `default_deny`).
    pub reason: String,
}

impl AuthorizationResult {
    /// The global fallback when no policy matches: deny.
    #[must_use]
    pub fn default_deny() -> Self {
        Self {
            allowed:     false,
            policy_id:   None,
            policy_name: None,
            rule_id:     None,
            rule_name:   None,
            message:     Some("No matching policy found".to_string()),
            reason:      "default_deny".to_string(),
        }
    }
}
