//! PostgreSQL connector.
//!
//! Statements arrive with named parameters (`:name`); the connector rewrites
//! them to positional placeholders and binds JSON values with their native
//! wire types preserved.

use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue};
use sqlgate_error::{Result, SqlGateError};
use tokio_postgres::types::{IsNull, ToSql, Type};
use tokio_postgres::{NoTls, Row};

use crate::connector::{BackendConnection, BackendConnector, StatementOutcome};
use crate::server::BackendServer;

/// Connector for PostgreSQL backends.
#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresConnector;

impl PostgresConnector {
    /// Create a connector.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BackendConnector for PostgresConnector {
    async fn connect(&self, server: &BackendServer) -> Result<Box<dyn BackendConnection>> {
        let config = format!(
            "host={} port={} dbname={} user={} password={}",
            server.host, server.port, server.database, server.username, server.password
        );
        let (client, connection) = tokio_postgres::connect(&config, NoTls)
            .await
            .map_err(|e| SqlGateError::backend_transient(&server.alias, e.to_string()))?;

        let alias = server.alias.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!(alias = %alias, error = %e, "postgres connection closed");
            }
        });

        Ok(Box::new(PostgresConnection {
            alias: server.alias.clone(),
            client,
            task,
        }))
    }
}

struct PostgresConnection {
    alias:  String,
    client: tokio_postgres::Client,
    task:   tokio::task::JoinHandle<()>,
}

impl Drop for PostgresConnection {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
impl BackendConnection for PostgresConnection {
    async fn execute(
        &mut self,
        query: &str,
        params: &Map<String, JsonValue>,
    ) -> Result<StatementOutcome> {
        let (sql, ordered) = bind_named_params(query, params)
            .map_err(|message| SqlGateError::backend(&self.alias, message))?;
        let values: Vec<PgParam> = ordered.into_iter().map(PgParam::from).collect();
        let refs: Vec<&(dyn ToSql + Sync)> =
            values.iter().map(|v| v as &(dyn ToSql + Sync)).collect();

        if returns_rows(&sql) {
            let rows = self
                .client
                .query(&sql, &refs)
                .await
                .map_err(|e| self.map_error(&e))?;
            Ok(rows_to_outcome(&rows))
        } else {
            let affected = self
                .client
                .execute(&sql, &refs)
                .await
                .map_err(|e| self.map_error(&e))?;
            Ok(StatementOutcome::affected_only(affected))
        }
    }

    async fn ping(&mut self) -> Result<()> {
        self.client
            .simple_query("SELECT 1")
            .await
            .map(|_| ())
            .map_err(|e| SqlGateError::backend_transient(&self.alias, e.to_string()))
    }
}

impl PostgresConnection {
    fn map_error(&self, e: &tokio_postgres::Error) -> SqlGateError {
        // Errors without a SQLSTATE come from the connection itself.
        if e.is_closed() || e.code().is_none() {
            SqlGateError::backend_transient(&self.alias, e.to_string())
        } else {
            SqlGateError::backend(&self.alias, e.to_string())
        }
    }
}

fn returns_rows(sql: &str) -> bool {
    let head = sql.trim_start().get(..6).unwrap_or("").to_ascii_uppercase();
    head.starts_with("SELECT")
        || head.starts_with("SHOW")
        || head.starts_with("WITH")
        || head.starts_with("EXPLAI")
}

/// Rewrite `:name` placeholders to `$n`, returning the parameter values in
/// placeholder order. Skips quoted strings and `::type` casts.
fn bind_named_params(
    query: &str,
    params: &Map<String, JsonValue>,
) -> std::result::Result<(String, Vec<JsonValue>), String> {
    let mut sql = String::with_capacity(query.len());
    let mut ordered: Vec<(String, JsonValue)> = Vec::new();
    let bytes = query.as_bytes();
    let mut i = 0;
    let mut in_string = false;

    while i < bytes.len() {
        let c = bytes[i] as char;
        if in_string {
            sql.push(c);
            if c == '\'' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        match c {
            '\'' => {
                in_string = true;
                sql.push(c);
                i += 1;
            },
            ':' if i + 1 < bytes.len() && bytes[i + 1] == b':' => {
                sql.push_str("::");
                i += 2;
            },
            ':' if i + 1 < bytes.len()
                && ((bytes[i + 1] as char).is_ascii_alphabetic() || bytes[i + 1] == b'_') =>
            {
                let start = i + 1;
                let mut end = start;
                while end < bytes.len()
                    && ((bytes[end] as char).is_ascii_alphanumeric() || bytes[end] == b'_')
                {
                    end += 1;
                }
                let name = &query[start..end];
                let value = params
                    .get(name)
                    .ok_or_else(|| format!("missing parameter '{name}'"))?;
                let position = ordered
                    .iter()
                    .position(|(n, _)| n == name)
                    .unwrap_or_else(|| {
                        ordered.push((name.to_string(), value.clone()));
                        ordered.len() - 1
                    });
                sql.push('$');
                sql.push_str(&(position + 1).to_string());
                i = end;
            },
            _ => {
                sql.push(c);
                i += 1;
            },
        }
    }

    Ok((sql, ordered.into_iter().map(|(_, v)| v).collect()))
}

/// JSON parameter with its PostgreSQL wire type preserved.
#[derive(Debug)]
enum PgParam {
    Null,
    Bool(bool),
    BigInt(i64),
    Double(f64),
    Text(String),
    Json(JsonValue),
}

impl From<JsonValue> for PgParam {
    fn from(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(b) => Self::Bool(b),
            JsonValue::Number(n) => n.as_i64().map_or_else(
                || Self::Double(n.as_f64().unwrap_or(0.0)),
                Self::BigInt,
            ),
            JsonValue::String(s) => Self::Text(s),
            JsonValue::Array(_) | JsonValue::Object(_) => Self::Json(value),
        }
    }
}

impl ToSql for PgParam {
    tokio_postgres::types::to_sql_checked!();

    fn to_sql(
        &self,
        ty: &Type,
        out: &mut bytes::BytesMut,
    ) -> std::result::Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            Self::Null => Ok(IsNull::Yes),
            Self::Bool(b) => b.to_sql(ty, out),
            Self::BigInt(i) => match *ty {
                Type::INT2 => i16::try_from(*i)?.to_sql(ty, out),
                Type::INT4 => i32::try_from(*i)?.to_sql(ty, out),
                _ => i.to_sql(ty, out),
            },
            Self::Double(f) => f.to_sql(ty, out),
            Self::Text(s) => s.to_sql(ty, out),
            Self::Json(v) => v.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

fn rows_to_outcome(rows: &[Row]) -> StatementOutcome {
    let columns = rows.first().map_or_else(Vec::new, |row| {
        row.columns().iter().map(|c| c.name().to_string()).collect()
    });
    let data = rows
        .iter()
        .map(|row| (0..row.len()).map(|idx| cell_to_json(row, idx)).collect())
        .collect();
    StatementOutcome {
        columns,
        rows: data,
        affected: 0,
    }
}

fn cell_to_json(row: &Row, idx: usize) -> JsonValue {
    let ty = row.columns()[idx].type_();
    match *ty {
        Type::BOOL => opt(row.try_get::<_, Option<bool>>(idx)).map_or(JsonValue::Null, JsonValue::Bool),
        Type::INT2 => opt(row.try_get::<_, Option<i16>>(idx))
            .map_or(JsonValue::Null, |v| JsonValue::from(i64::from(v))),
        Type::INT4 => opt(row.try_get::<_, Option<i32>>(idx))
            .map_or(JsonValue::Null, |v| JsonValue::from(i64::from(v))),
        Type::INT8 => opt(row.try_get::<_, Option<i64>>(idx)).map_or(JsonValue::Null, JsonValue::from),
        Type::FLOAT4 => opt(row.try_get::<_, Option<f32>>(idx))
            .map_or(JsonValue::Null, |v| JsonValue::from(f64::from(v))),
        Type::FLOAT8 => opt(row.try_get::<_, Option<f64>>(idx)).map_or(JsonValue::Null, JsonValue::from),
        Type::JSON | Type::JSONB => {
            opt(row.try_get::<_, Option<JsonValue>>(idx)).unwrap_or(JsonValue::Null)
        },
        Type::UUID => opt(row.try_get::<_, Option<uuid::Uuid>>(idx))
            .map_or(JsonValue::Null, |v| JsonValue::String(v.to_string())),
        Type::TIMESTAMPTZ => opt(row.try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx))
            .map_or(JsonValue::Null, |v| JsonValue::String(v.to_rfc3339())),
        Type::TIMESTAMP => opt(row.try_get::<_, Option<chrono::NaiveDateTime>>(idx))
            .map_or(JsonValue::Null, |v| JsonValue::String(v.to_string())),
        Type::DATE => opt(row.try_get::<_, Option<chrono::NaiveDate>>(idx))
            .map_or(JsonValue::Null, |v| JsonValue::String(v.to_string())),
        _ => opt(row.try_get::<_, Option<String>>(idx)).map_or(JsonValue::Null, JsonValue::String),
    }
}

fn opt<T>(res: std::result::Result<Option<T>, tokio_postgres::Error>) -> Option<T> {
    res.ok().flatten()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_params_rewritten_in_order() {
        let mut params = Map::new();
        params.insert("id".to_string(), serde_json::json!(7));
        params.insert("name".to_string(), serde_json::json!("alice"));

        let (sql, ordered) =
            bind_named_params("SELECT * FROM users WHERE id = :id AND name = :name", &params)
                .unwrap();
        assert_eq!(sql, "SELECT * FROM users WHERE id = $1 AND name = $2");
        assert_eq!(ordered, vec![serde_json::json!(7), serde_json::json!("alice")]);
    }

    #[test]
    fn test_repeated_param_uses_one_placeholder() {
        let mut params = Map::new();
        params.insert("id".to_string(), serde_json::json!(1));

        let (sql, ordered) =
            bind_named_params("SELECT :id, :id", &params).unwrap();
        assert_eq!(sql, "SELECT $1, $1");
        assert_eq!(ordered.len(), 1);
    }

    #[test]
    fn test_cast_and_string_literals_untouched() {
        let params = Map::new();
        let (sql, ordered) =
            bind_named_params("SELECT '::x :notaparam'::text", &params).unwrap();
        assert_eq!(sql, "SELECT '::x :notaparam'::text");
        assert!(ordered.is_empty());
    }

    #[test]
    fn test_missing_param_is_an_error() {
        let params = Map::new();
        assert!(bind_named_params("SELECT :missing", &params).is_err());
    }

    #[test]
    fn test_returns_rows_heuristic() {
        assert!(returns_rows("SELECT 1"));
        assert!(returns_rows("  with x as (select 1) select * from x"));
        assert!(!returns_rows("UPDATE t SET x = 1"));
        assert!(!returns_rows("INSERT INTO t VALUES (1)"));
    }
}
