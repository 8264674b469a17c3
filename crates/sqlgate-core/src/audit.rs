//! Audit log of every executed query.
//!
//! Two writes per query: a `pending` row on entry and exactly one final
//! write on exit. The sink keeps the synchronous path to a bounded-channel
//! send; a single writer task applies writes in order to the configured
//! [`AuditBackend`] and forwards finalized rows to the anomaly queue
//! (one-way pipeline, never read back on the request path).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sqlgate_error::Result;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Lifecycle status of an audit row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    /// Written on entry, before execution.
    Pending,
    /// Final: execution succeeded.
    Success,
    /// Final: execution failed (including timeouts and denials).
    Error,
}

/// One audit row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRow {
    /// Row identifier (also the query id).
    pub id: Uuid,
    /// Principal username.
    pub username: String,
    /// Principal role.
    pub role: String,
    /// Client IP address.
    pub client_ip: Option<String>,
    /// Raw query text.
    pub query_text: String,
    /// MD5 of the normalized query.
    pub query_hash: String,
    /// Statement classification.
    pub query_type: String,
    /// Target backend alias or `group:<name>`.
    pub target: String,
    /// Row status.
    pub status: AuditStatus,
    /// Returned or affected rows.
    pub rows: u64,
    /// Execution wall time in milliseconds, once finalized.
    pub execution_time_ms: Option<u64>,
    /// Error message on failed executions.
    pub error_message: Option<String>,
    /// Entry timestamp.
    pub started_at: DateTime<Utc>,
    /// Exit timestamp, once finalized.
    pub completed_at: Option<DateTime<Utc>>,
    /// Distributed query id for scattered executions.
    pub distributed_id: Option<Uuid>,
}

impl AuditRow {
    /// Pending row for a query entering execution.
    #[must_use]
    pub fn pending(
        id: Uuid,
        username: impl Into<String>,
        role: impl Into<String>,
        client_ip: Option<String>,
        query_text: impl Into<String>,
        query_type: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        let query_text = query_text.into();
        Self {
            id,
            username: username.into(),
            role: role.into(),
            client_ip,
            query_hash: crate::inspect::query_hash(&query_text),
            query_text,
            query_type: query_type.into(),
            target: target.into(),
            status: AuditStatus::Pending,
            rows: 0,
            execution_time_ms: None,
            error_message: None,
            started_at: Utc::now(),
            completed_at: None,
            distributed_id: None,
        }
    }

    /// Mark this row as part of a distributed execution.
    #[must_use]
    pub const fn with_distributed_id(mut self, qid: Uuid) -> Self {
        self.distributed_id = Some(qid);
        self
    }
}

/// Terminal outcome applied to a pending row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditOutcome {
    /// Final status: success or error.
    pub status: AuditStatus,
    /// Returned or affected rows.
    pub rows: u64,
    /// Error message for failures.
    pub error_message: Option<String>,
}

impl AuditOutcome {
    /// Successful completion.
    #[must_use]
    pub const fn success(rows: u64) -> Self {
        Self {
            status: AuditStatus::Success,
            rows,
            error_message: None,
        }
    }

    /// Failed completion.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: AuditStatus::Error,
            rows: 0,
            error_message: Some(message.into()),
        }
    }
}

/// Storage backend for audit rows.
#[async_trait]
pub trait AuditBackend: Send + Sync {
    /// Append a pending row.
    async fn write_pending(&self, row: &AuditRow) -> Result<()>;

    /// Apply the final write for a row.
    async fn finalize(&self, row: &AuditRow) -> Result<()>;
}

/// In-memory audit backend: a bounded ring of recent rows, used by tests
/// and embedded deployments.
pub struct MemoryAuditBackend {
    rows:     Mutex<Vec<AuditRow>>,
    capacity: usize,
}

impl MemoryAuditBackend {
    /// Backend retaining up to `capacity` rows.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
            capacity,
        }
    }

    /// Snapshot of retained rows, oldest first.
    #[must_use]
    pub fn rows(&self) -> Vec<AuditRow> {
        self.rows.lock().clone()
    }

    /// Find a row by id.
    #[must_use]
    pub fn find(&self, id: Uuid) -> Option<AuditRow> {
        self.rows.lock().iter().find(|r| r.id == id).cloned()
    }
}

#[async_trait]
impl AuditBackend for MemoryAuditBackend {
    async fn write_pending(&self, row: &AuditRow) -> Result<()> {
        let mut rows = self.rows.lock();
        rows.push(row.clone());
        if rows.len() > self.capacity {
            let drop_count = rows.len() - self.capacity;
            rows.drain(..drop_count);
        }
        Ok(())
    }

    async fn finalize(&self, row: &AuditRow) -> Result<()> {
        let mut rows = self.rows.lock();
        if let Some(stored) = rows.iter_mut().find(|r| r.id == row.id) {
            *stored = row.clone();
        } else {
            rows.push(row.clone());
        }
        Ok(())
    }
}

enum SinkMessage {
    Pending(AuditRow),
    Finalize {
        id:      Uuid,
        outcome: AuditOutcome,
    },
    Flush(oneshot::Sender<()>),
}

/// Handle for writing audit rows.
///
/// Cheap to clone; all clones feed the same writer task.
#[derive(Clone)]
pub struct AuditSink {
    tx: mpsc::Sender<SinkMessage>,
}

impl AuditSink {
    /// Create a sink with its writer task.
    ///
    /// Finalized rows are forwarded to `anomaly_tx` when provided.
    #[must_use]
    pub fn spawn(
        backend: Arc<dyn AuditBackend>,
        anomaly_tx: Option<mpsc::Sender<AuditRow>>,
        capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<SinkMessage>(capacity);

        let handle = tokio::spawn(async move {
            let mut pending: HashMap<Uuid, AuditRow> = HashMap::new();
            while let Some(message) = rx.recv().await {
                match message {
                    SinkMessage::Pending(row) => {
                        if let Err(e) = backend.write_pending(&row).await {
                            tracing::error!(error = %e, id = %row.id, "audit pending write failed");
                        }
                        pending.insert(row.id, row);
                    },
                    SinkMessage::Finalize { id, outcome } => {
                        let Some(mut row) = pending.remove(&id) else {
                            // Exactly-once: a second finalize finds nothing.
                            tracing::warn!(%id, "finalize for unknown or already-final audit row");
                            continue;
                        };
                        let completed_at = Utc::now();
                        row.status = outcome.status;
                        row.rows = outcome.rows;
                        row.error_message = outcome.error_message;
                        row.completed_at = Some(completed_at);
                        row.execution_time_ms = Some(
                            u64::try_from(
                                (completed_at - row.started_at).num_milliseconds().max(0),
                            )
                            .unwrap_or(u64::MAX),
                        );
                        if let Err(e) = backend.finalize(&row).await {
                            tracing::error!(error = %e, id = %row.id, "audit final write failed");
                        }
                        if let Some(anomaly_tx) = &anomaly_tx {
                            // The anomaly queue must never block the writer.
                            if anomaly_tx.try_send(row).is_err() {
                                tracing::warn!("anomaly queue full; dropping audit row");
                            }
                        }
                    },
                    SinkMessage::Flush(done) => {
                        let _ = done.send(());
                    },
                }
            }
        });

        (Self { tx }, handle)
    }

    /// Write the pending row for a query entering execution.
    pub async fn begin(&self, row: AuditRow) {
        if self.tx.send(SinkMessage::Pending(row)).await.is_err() {
            tracing::error!("audit sink closed; pending row dropped");
        }
    }

    /// Apply the terminal outcome for a row. Exactly one finalize per row
    /// takes effect; later ones are ignored by the writer.
    pub async fn finish(&self, id: Uuid, outcome: AuditOutcome) {
        if self
            .tx
            .send(SinkMessage::Finalize { id, outcome })
            .await
            .is_err()
        {
            tracing::error!(%id, "audit sink closed; final row dropped");
        }
    }

    /// Wait until every previously sent write has been applied.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(SinkMessage::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }
}
