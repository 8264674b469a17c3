//! End-to-end pipeline tests over the mock connector: routing, policy,
//! caching, masking, distribution, timeouts, and audit.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value as JsonValue};
use sqlgate_auth::{
    ConditionOperator, Effect, MemoryPolicyStore, Policy, PolicyCondition, PolicyRule,
};
use sqlgate_core::audit::AuditStatus;
use sqlgate_core::mask::{DataCategory, MaskingRule, MaskingType};
use sqlgate_core::{
    CoreConfig, MemoryAuditBackend, Principal, QueryPlane, QueryRequest, QueryType,
};
use sqlgate_db::mock::MockConnector;
use sqlgate_db::{BackendServer, DatabaseType, ServerRegistry, StatementOutcome};

fn server(alias: &str, group: Option<&str>) -> BackendServer {
    BackendServer {
        alias:           alias.to_string(),
        host:            "localhost".to_string(),
        port:            5432,
        database:        "app".to_string(),
        username:        "gate".to_string(),
        password:        "secret".to_string(),
        db_type:         DatabaseType::Postgres,
        max_connections: 5,
        weight:          1.0,
        allowed_roles:   HashSet::new(),
        is_active:       true,
        group:           group.map(String::from),
    }
}

fn allow_all_policy() -> Policy {
    Policy {
        id:             1,
        name:           "allow-all".to_string(),
        resource_type:  "*".to_string(),
        priority:       0,
        default_effect: Some(Effect::Allow),
        rules:          Vec::new(),
    }
}

struct Harness {
    plane:     Arc<QueryPlane>,
    connector: MockConnector,
    audit:     Arc<MemoryAuditBackend>,
}

fn harness(aliases: &[(&str, Option<&str>)], policies: Vec<Policy>) -> Harness {
    let registry = Arc::new(ServerRegistry::new());
    for (alias, group) in aliases {
        registry.register(server(alias, *group)).unwrap();
    }
    let connector = MockConnector::new();
    let audit = Arc::new(MemoryAuditBackend::new(1000));

    let mut config = CoreConfig::default();
    config.cache.wait_timeout_seconds = 5;

    let plane = QueryPlane::new(
        config,
        registry,
        Arc::new(connector.clone()),
        Arc::new(MemoryPolicyStore::new(policies)),
        Arc::clone(&audit) as Arc<dyn sqlgate_core::AuditBackend>,
    );
    Harness {
        plane,
        connector,
        audit,
    }
}

fn id_row_outcome(id: i64) -> StatementOutcome {
    StatementOutcome {
        columns:  vec!["id".to_string()],
        rows:     vec![vec![json!(id)]],
        affected: 0,
    }
}

fn params(json: JsonValue) -> Map<String, JsonValue> {
    json.as_object().cloned().unwrap_or_default()
}

// S1: cached SELECT executes the backend exactly once.
#[tokio::test]
async fn select_hit_executes_backend_once() {
    let h = harness(&[("a", None)], vec![allow_all_policy()]);
    h.connector.respond("a", id_row_outcome(7));

    let request = QueryRequest::new(
        "SELECT id FROM users WHERE id = :id",
        Principal::new("alice", "analyst"),
    )
    .with_params(params(json!({"id": 7})))
    .on_server("a");

    let first = h.plane.execute(request.clone()).await;
    assert!(first.success);
    assert_eq!(first.columns, vec!["id"]);
    assert_eq!(first.data, vec![vec![json!(7)]]);
    assert_eq!(first.rowcount, 1);
    assert_eq!(first.query_type, QueryType::Select);
    assert!(!first.masked);

    let second = h.plane.execute(request).await;
    assert!(second.success);
    assert_eq!(second.data, first.data);

    // Backend executed once; the second request was served from cache.
    assert_eq!(h.connector.executions("a"), 1);

    // Both requests leave exactly one finalized audit row each.
    h.plane.flush_audit().await;
    let rows = h.audit.rows();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.status == AuditStatus::Success));
}

// S2: a partial masking rule rewrites the email column.
#[tokio::test]
async fn column_masking_applies_to_results() {
    let h = harness(&[("a", None)], vec![allow_all_policy()]);
    h.connector.respond(
        "a",
        StatementOutcome {
            columns:  vec!["id".to_string(), "email".to_string()],
            rows:     vec![vec![json!(1), json!("alice@example.com")]],
            affected: 0,
        },
    );

    let mut options = Map::new();
    options.insert("start_chars".to_string(), json!(1));
    options.insert("end_chars".to_string(), json!(0));
    options.insert("mask_char".to_string(), json!("*"));
    h.plane
        .masker()
        .load_rules(vec![MaskingRule {
            table: "users".to_string(),
            column: "^email$".to_string(),
            masking_type: MaskingType::Partial,
            data_category: DataCategory::Pii,
            pattern: None,
            replacement: None,
            options,
            priority: 10,
            description: None,
        }])
        .unwrap();

    let response = h
        .plane
        .execute(
            QueryRequest::new(
                "SELECT id, email FROM users LIMIT 1",
                Principal::new("alice", "analyst"),
            )
            .on_server("a"),
        )
        .await;

    assert!(response.success);
    assert!(response.masked);
    assert_eq!(response.masked_columns, vec!["email"]);
    assert_eq!(response.data[0][0], json!(1));
    assert_eq!(response.data[0][1], json!("a****************"));
}

// S3: a policy denial produces an audit row and never touches a backend.
#[tokio::test]
async fn policy_denial_acquires_no_connection() {
    let deny_unfiltered_interns = Policy {
        id:             10,
        name:           "intern-guard".to_string(),
        resource_type:  "query".to_string(),
        priority:       100,
        default_effect: Some(Effect::Allow),
        rules:          vec![
            PolicyRule {
                id: 101,
                name: "allow-filtered-interns".to_string(),
                priority: 10,
                effect: Effect::Allow,
                conditions: vec![
                    PolicyCondition {
                        field:      Some("role".to_string()),
                        operator:   Some(ConditionOperator::Eq),
                        value:      Some(json!("intern")),
                        function:   None,
                        parameters: Map::new(),
                    },
                    PolicyCondition {
                        field:      None,
                        operator:   None,
                        value:      None,
                        function:   Some("has_where_clause".to_string()),
                        parameters: Map::new(),
                    },
                ],
                message: None,
                all_conditions_required: true,
            },
            PolicyRule {
                id: 102,
                name: "deny-interns".to_string(),
                priority: 5,
                effect: Effect::Deny,
                conditions: vec![PolicyCondition {
                    field:      Some("role".to_string()),
                    operator:   Some(ConditionOperator::Eq),
                    value:      Some(json!("intern")),
                    function:   None,
                    parameters: Map::new(),
                }],
                message: Some("interns must filter queries".to_string()),
                all_conditions_required: true,
            },
        ],
    };
    let h = harness(&[("a", None)], vec![deny_unfiltered_interns]);

    let response = h
        .plane
        .execute(
            QueryRequest::new("SELECT * FROM orders", Principal::new("pat", "intern"))
                .on_server("a"),
        )
        .await;

    assert!(!response.success);
    assert_eq!(response.error.as_ref().unwrap().code, "POLICY_DENY");
    assert_eq!(h.connector.executions("a"), 0);
    assert_eq!(h.connector.total_executions(), 0);

    h.plane.flush_audit().await;
    let rows = h.audit.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, AuditStatus::Error);

    // A filtered query from the same role goes through.
    let response = h
        .plane
        .execute(
            QueryRequest::new(
                "SELECT * FROM orders WHERE id = 2",
                Principal::new("pat", "intern"),
            )
            .on_server("a"),
        )
        .await;
    assert!(response.success);
}

// S4 case A: a distributed write succeeds when the quorum is met.
#[tokio::test]
async fn distributed_write_reaches_quorum() {
    let h = harness(
        &[("g1", Some("g")), ("g2", Some("g")), ("g3", Some("g"))],
        vec![allow_all_policy()],
    );
    h.connector.respond("g1", StatementOutcome::affected_only(1));
    h.connector.respond("g2", StatementOutcome::affected_only(1));
    h.connector.fail("g3", "connection refused", true);

    let response = h
        .plane
        .execute(
            QueryRequest::new(
                "UPDATE t SET x = 1 WHERE id = 2",
                Principal::new("svc", "service"),
            )
            .on_group("g"),
        )
        .await;

    assert!(response.success);
    let info = response.distribution_info.unwrap();
    assert_eq!(info.strategy, "all_servers");
    assert_eq!(info.servers_total, 3);
    assert_eq!(info.servers_succeeded, 2);
    assert_eq!(info.servers_failed, 1);
    assert_eq!(response.rowcount, 1);
    assert!(response.error.is_none());
}

// S4 case B: below quorum the write fails and the per-server report
// survives in the response.
#[tokio::test]
async fn distributed_write_below_quorum_fails() {
    let h = harness(
        &[
            ("g1", Some("g")),
            ("g2", Some("g")),
            ("g3", Some("g")),
            ("g4", Some("g")),
        ],
        vec![allow_all_policy()],
    );
    h.connector.respond("g1", StatementOutcome::affected_only(1));
    h.connector.fail("g2", "disk full", false);
    h.connector.fail("g3", "disk full", false);
    h.connector.fail("g4", "disk full", false);

    let response = h
        .plane
        .execute(
            QueryRequest::new(
                "UPDATE t SET x = 1 WHERE id = 2",
                Principal::new("svc", "service"),
            )
            .on_group("g"),
        )
        .await;

    // Quorum over 4 members is 2; only one succeeded.
    assert!(!response.success);
    let info = response.distribution_info.unwrap();
    assert_eq!(info.servers_succeeded, 1);
    assert_eq!(info.servers_failed, 3);
    let error = response.error.unwrap();
    assert!(error.message.contains("g2"));
    assert!(error.message.contains("disk full"));

    h.plane.flush_audit().await;
    let rows = h.audit.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, AuditStatus::Error);
    assert!(rows[0].distributed_id.is_some());
    assert_eq!(rows[0].target, "group:g");
}

// S5: a fired deadline cancels the query and returns capacity promptly.
#[tokio::test]
async fn timeout_cancels_and_returns_connection() {
    let h = harness(&[("a", None)], vec![allow_all_policy()]);
    h.connector.respond("a", id_row_outcome(1));
    h.connector.delay("a", Duration::from_secs(5));

    let response = h
        .plane
        .execute(
            QueryRequest::new("SELECT pg_sleep(5)", Principal::new("alice", "analyst"))
                .on_server("a")
                .with_timeout_s(1),
        )
        .await;

    assert!(!response.success);
    assert_eq!(response.error.as_ref().unwrap().code, "TIMEOUT");
    assert!(response.data.is_empty());

    // The connection was destroyed at the deadline, not leaked.
    let pool = h.plane.pools().pool_for("a").unwrap();
    assert_eq!(pool.stats().in_use, 0);

    h.plane.flush_audit().await;
    let rows = h.audit.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, AuditStatus::Error);
    assert!(rows[0]
        .error_message
        .as_deref()
        .unwrap()
        .to_lowercase()
        .contains("timeout"));
}

// S6: concurrent identical SELECTs coalesce into one backend execution.
#[tokio::test]
async fn single_flight_deduplicates_concurrent_selects() {
    let h = harness(&[("a", None)], vec![allow_all_policy()]);
    h.connector.respond("a", id_row_outcome(42));
    h.connector.delay("a", Duration::from_millis(100));

    let mut handles = Vec::new();
    for _ in 0..50 {
        let plane = Arc::clone(&h.plane);
        handles.push(tokio::spawn(async move {
            plane
                .execute(
                    QueryRequest::new(
                        "SELECT id FROM t WHERE id = 42",
                        Principal::new("alice", "analyst"),
                    )
                    .on_server("a"),
                )
                .await
        }));
    }

    let mut responses = Vec::new();
    for handle in handles {
        responses.push(handle.await.unwrap());
    }

    assert_eq!(h.connector.executions("a"), 1);
    assert!(responses.iter().all(|r| r.success));
    assert!(responses.iter().all(|r| r.data == vec![vec![json!(42)]]));
}

// Distributed reads fail over to the next best backend.
#[tokio::test]
async fn distributed_read_fails_over() {
    let h = harness(
        &[("g1", Some("g")), ("g2", Some("g"))],
        vec![allow_all_policy()],
    );
    h.connector.fail("g1", "connection reset", true);
    h.connector.respond("g2", id_row_outcome(5));

    let response = h
        .plane
        .execute(
            QueryRequest::new(
                "SELECT id FROM t WHERE id = 5",
                Principal::new("alice", "analyst"),
            )
            .on_group("g"),
        )
        .await;

    assert!(response.success);
    assert_eq!(response.data, vec![vec![json!(5)]]);
    let info = response.distribution_info.unwrap();
    assert_eq!(info.strategy, "load_balanced");
    assert_eq!(info.servers_succeeded, 1);
    // One mock backend refused; executions show the failover order.
    assert_eq!(h.connector.executions("g2"), 1);
}

// Boundary: max_rows = 0 returns columns with no rows.
#[tokio::test]
async fn max_rows_zero_keeps_columns() {
    let h = harness(&[("a", None)], vec![allow_all_policy()]);
    h.connector.respond(
        "a",
        StatementOutcome {
            columns:  vec!["id".to_string(), "name".to_string()],
            rows:     vec![vec![json!(1), json!("x")], vec![json!(2), json!("y")]],
            affected: 0,
        },
    );

    let response = h
        .plane
        .execute(
            QueryRequest::new("SELECT id, name FROM t", Principal::new("alice", "analyst"))
                .on_server("a")
                .with_max_rows(0),
        )
        .await;

    assert!(response.success);
    assert_eq!(response.columns, vec!["id", "name"]);
    assert!(response.data.is_empty());
    assert_eq!(response.rowcount, 0);
}

// Requests with no target and no default backend are routing errors.
#[tokio::test]
async fn missing_target_is_routing_error() {
    let h = harness(&[("a", None)], vec![allow_all_policy()]);

    let response = h
        .plane
        .execute(QueryRequest::new("SELECT 1", Principal::new("alice", "analyst")))
        .await;

    assert!(!response.success);
    assert_eq!(response.error.as_ref().unwrap().code, "ROUTING_ERROR");
    assert_eq!(h.connector.total_executions(), 0);

    h.plane.flush_audit().await;
    assert_eq!(h.audit.rows().len(), 1);
}

// Writes bypass the cache entirely.
#[tokio::test]
async fn writes_are_never_cached() {
    let h = harness(&[("a", None)], vec![allow_all_policy()]);
    h.connector.respond("a", StatementOutcome::affected_only(1));

    let request = QueryRequest::new(
        "UPDATE t SET x = 1 WHERE id = 2",
        Principal::new("svc", "service"),
    )
    .on_server("a");

    let first = h.plane.execute(request.clone()).await;
    let second = h.plane.execute(request).await;

    assert!(first.success);
    assert!(second.success);
    assert_eq!(first.query_type, QueryType::Update);
    assert_eq!(h.connector.executions("a"), 2);
    assert!(h.plane.cache().is_empty());
}

// Finalized audit rows reach the anomaly detector off the request path.
#[tokio::test]
async fn audit_rows_feed_anomaly_detection() {
    let h = harness(&[("a", None)], vec![allow_all_policy()]);
    h.connector.respond("a", StatementOutcome::affected_only(0));

    let response = h
        .plane
        .execute(
            QueryRequest::new("DELETE FROM users", Principal::new("mallory", "service"))
                .on_server("a"),
        )
        .await;
    assert!(response.success);

    h.plane.flush_audit().await;
    // The anomaly consumer runs asynchronously; give it a moment.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let alerts = h.plane.anomaly().alerts();
    assert!(alerts.iter().any(|a| a.axis == "query_content"));
}
