//! Request and response types at the plane boundary.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use sqlgate_error::SqlGateError;

use crate::inspect::QueryType;

/// Authenticated principal attached to a request by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    /// Username.
    pub username: String,
    /// Role used for policy, routing, and timeout decisions.
    pub role: String,
    /// Client IP address.
    pub client_ip: Option<String>,
}

impl Principal {
    /// Create a principal.
    #[must_use]
    pub fn new(username: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            username:  username.into(),
            role:      role.into(),
            client_ip: None,
        }
    }

    /// Set the client IP.
    #[must_use]
    pub fn with_client_ip(mut self, ip: impl Into<String>) -> Self {
        self.client_ip = Some(ip.into());
        self
    }
}

/// Per-request execution options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryOptions {
    /// Statement timeout in seconds; overrides the role policy.
    pub timeout_s: Option<u64>,
    /// Row cap for result sets. `Some(0)` returns columns with no rows.
    pub max_rows: Option<usize>,
    /// Whether to include execution metadata in the response.
    pub include_metadata: bool,
    /// Whether the caller wants streamed results (accepted, not yet acted
    /// on by the core).
    pub stream_results: bool,
}

/// A governed query request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    /// SQL text.
    pub query_text: String,

    /// Named statement parameters.
    #[serde(default)]
    pub params: Map<String, JsonValue>,

    /// Explicit target backend.
    #[serde(default)]
    pub server_alias: Option<String>,

    /// Target server group for distributed execution.
    #[serde(default)]
    pub server_group: Option<String>,

    /// Transaction correlation id, when the gateway pins one.
    #[serde(default)]
    pub transaction_id: Option<String>,

    /// Execution options.
    #[serde(default)]
    pub options: QueryOptions,

    /// Authenticated principal.
    pub principal: Principal,
}

impl QueryRequest {
    /// Request executing `query_text` as `principal`.
    #[must_use]
    pub fn new(query_text: impl Into<String>, principal: Principal) -> Self {
        Self {
            query_text: query_text.into(),
            params: Map::new(),
            server_alias: None,
            server_group: None,
            transaction_id: None,
            options: QueryOptions::default(),
            principal,
        }
    }

    /// Target an explicit backend.
    #[must_use]
    pub fn on_server(mut self, alias: impl Into<String>) -> Self {
        self.server_alias = Some(alias.into());
        self
    }

    /// Target a server group.
    #[must_use]
    pub fn on_group(mut self, group: impl Into<String>) -> Self {
        self.server_group = Some(group.into());
        self
    }

    /// Attach named parameters.
    #[must_use]
    pub fn with_params(mut self, params: Map<String, JsonValue>) -> Self {
        self.params = params;
        self
    }

    /// Set the statement timeout in seconds.
    #[must_use]
    pub const fn with_timeout_s(mut self, seconds: u64) -> Self {
        self.options.timeout_s = Some(seconds);
        self
    }

    /// Cap the number of returned rows.
    #[must_use]
    pub const fn with_max_rows(mut self, max_rows: usize) -> Self {
        self.options.max_rows = Some(max_rows);
        self
    }

    /// The routing target as recorded on audit rows and cache keys.
    #[must_use]
    pub fn target(&self) -> String {
        if let Some(alias) = &self.server_alias {
            alias.clone()
        } else if let Some(group) = &self.server_group {
            format!("group:{group}")
        } else {
            "default".to_string()
        }
    }
}

/// Distribution metadata on responses from group execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionInfo {
    /// Distribution strategy (`load_balanced` or `all_servers`).
    pub strategy: String,
    /// Members of the target group.
    pub servers_total: usize,
    /// Members that completed successfully.
    pub servers_succeeded: usize,
    /// Members that failed.
    pub servers_failed: usize,
    /// Distributed query identifier.
    pub query_id: String,
}

/// Structured error carried on failed responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseError {
    /// Stable error code (see the error taxonomy).
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Backend the error came from, when known.
    pub server_alias: Option<String>,
}

impl From<&SqlGateError> for ResponseError {
    fn from(e: &SqlGateError) -> Self {
        Self {
            code:         e.error_code().to_string(),
            message:      e.to_string(),
            server_alias: e.server_alias().map(String::from),
        }
    }
}

/// A governed query response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    /// Whether the request succeeded.
    pub success: bool,

    /// Result column names.
    pub columns: Vec<String>,

    /// Result rows (masked where rules applied).
    pub data: Vec<Vec<JsonValue>>,

    /// Row count: returned rows for reads, affected rows for writes.
    pub rowcount: u64,

    /// Wall time of the execution in milliseconds.
    pub execution_time_ms: u64,

    /// Statement classification.
    pub query_type: QueryType,

    /// Whether any masking rule or detector modified the result.
    pub masked: bool,

    /// Columns that were masked.
    pub masked_columns: Vec<String>,

    /// Present for distributed executions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distribution_info: Option<DistributionInfo>,

    /// Present when `success` is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl QueryResponse {
    /// Failed response carrying the error taxonomy code.
    #[must_use]
    pub fn failure(query_type: QueryType, error: &SqlGateError) -> Self {
        Self {
            success:           false,
            columns:           Vec::new(),
            data:              Vec::new(),
            rowcount:          0,
            execution_time_ms: 0,
            query_type,
            masked:            false,
            masked_columns:    Vec::new(),
            distribution_info: None,
            error:             Some(ResponseError::from(error)),
        }
    }
}
