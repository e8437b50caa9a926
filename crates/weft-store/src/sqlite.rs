use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use weft_core::error::{Result, WeftError};
use weft_core::traits::DurableLog;
use weft_core::types::{DurableRecord, TaskIdentity, TaskOutcome};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS task_records (
         key TEXT PRIMARY KEY,
         graph_id TEXT NOT NULL,
         node_id TEXT NOT NULL,
         map_index INTEGER,
         input_hash TEXT NOT NULL,
         status TEXT NOT NULL,
         outcome_json TEXT NOT NULL,
         attempts INTEGER NOT NULL DEFAULT 0,
         recorded_at TEXT NOT NULL
     );

     CREATE INDEX IF NOT EXISTS idx_records_graph
         ON task_records(graph_id, node_id, map_index);";

/// Durable log backed by SQLite.
///
/// One row per task identity. Writes are single upsert statements, so a
/// record is never observed half-written.
pub struct SqliteLog {
    conn: Mutex<Connection>,
}

impl SqliteLog {
    /// Open or create the record database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    WeftError::Database(format!("Failed to create log directory: {}", e))
                })?;
            }
        }

        let conn = Connection::open(path).map_err(|e| WeftError::Database(e.to_string()))?;

        // FULL: a record is on disk before `record` acknowledges it.
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")
            .map_err(|e| WeftError::Database(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| WeftError::Database(format!("Failed to initialize schema: {}", e)))?;

        debug!(path = %path.display(), "Durable log opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| WeftError::Database(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| WeftError::Database(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn record_sync(
        &self,
        identity: &TaskIdentity,
        outcome: &TaskOutcome,
        attempts: u32,
    ) -> Result<()> {
        let outcome_json = serde_json::to_string(outcome)?;
        let status = outcome.state().to_string();
        let conn = self
            .conn
            .lock()
            .map_err(|e| WeftError::Database(e.to_string()))?;

        conn.execute(
            "INSERT INTO task_records
                 (key, graph_id, node_id, map_index, input_hash, status, outcome_json, attempts, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(key) DO UPDATE SET
                 status = excluded.status,
                 outcome_json = excluded.outcome_json,
                 attempts = excluded.attempts,
                 recorded_at = excluded.recorded_at
             WHERE task_records.status != 'succeeded'",
            params![
                identity.key(),
                identity.graph_id,
                identity.node_id,
                identity.map_index.map(|i| i as i64),
                identity.input_hash,
                status,
                outcome_json,
                attempts as i64,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(|e| WeftError::Database(format!("Failed to write record: {}", e)))?;

        Ok(())
    }

    fn lookup_sync(&self, identity: &TaskIdentity) -> Result<Option<DurableRecord>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| WeftError::Database(e.to_string()))?;

        conn.query_row(
            "SELECT graph_id, node_id, map_index, input_hash, outcome_json, attempts, recorded_at
             FROM task_records
             WHERE key = ?1",
            params![identity.key()],
            read_row,
        )
        .optional()
        .map_err(|e| WeftError::Database(e.to_string()))?
        .map(decode_row)
        .transpose()
    }

    fn records_sync(&self, graph_id: &str) -> Result<Vec<DurableRecord>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| WeftError::Database(e.to_string()))?;

        let mut stmt = conn
            .prepare(
                "SELECT graph_id, node_id, map_index, input_hash, outcome_json, attempts, recorded_at
                 FROM task_records
                 WHERE graph_id = ?1 OR substr(graph_id, 1, length(?2)) = ?2
                 ORDER BY recorded_at, graph_id, node_id, map_index",
            )
            .map_err(|e| WeftError::Database(e.to_string()))?;

        let rows = stmt
            .query_map(params![graph_id, format!("{}/", graph_id)], read_row)
            .map_err(|e| WeftError::Database(e.to_string()))?;

        let mut records = Vec::new();
        for row in rows {
            let raw = row.map_err(|e| WeftError::Database(e.to_string()))?;
            records.push(decode_row(raw)?);
        }
        Ok(records)
    }

    fn purge_sync(&self, graph_id: &str) -> Result<usize> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| WeftError::Database(e.to_string()))?;

        conn.execute(
            "DELETE FROM task_records
             WHERE graph_id = ?1 OR substr(graph_id, 1, length(?2)) = ?2",
            params![graph_id, format!("{}/", graph_id)],
        )
        .map_err(|e| WeftError::Database(format!("Failed to purge records: {}", e)))
    }
}

type RawRow = (String, String, Option<i64>, String, String, i64, String);

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn decode_row(raw: RawRow) -> Result<DurableRecord> {
    let (graph_id, node_id, map_index, input_hash, outcome_json, attempts, ts_str) = raw;
    let outcome: TaskOutcome = serde_json::from_str(&outcome_json)?;
    Ok(DurableRecord {
        identity: TaskIdentity {
            graph_id,
            node_id,
            map_index: map_index.map(|i| i as usize),
            input_hash,
        },
        outcome,
        attempts: attempts as u32,
        recorded_at: DateTime::parse_from_rfc3339(&ts_str)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

impl DurableLog for SqliteLog {
    fn record(
        &self,
        identity: &TaskIdentity,
        outcome: &TaskOutcome,
        attempts: u32,
    ) -> BoxFuture<'_, Result<()>> {
        let identity = identity.clone();
        let outcome = outcome.clone();
        Box::pin(async move { self.record_sync(&identity, &outcome, attempts) })
    }

    fn lookup(&self, identity: &TaskIdentity) -> BoxFuture<'_, Result<Option<DurableRecord>>> {
        let identity = identity.clone();
        Box::pin(async move { self.lookup_sync(&identity) })
    }

    fn records(&self, graph_id: &str) -> BoxFuture<'_, Result<Vec<DurableRecord>>> {
        let graph_id = graph_id.to_string();
        Box::pin(async move { self.records_sync(&graph_id) })
    }

    fn purge(&self, graph_id: &str) -> BoxFuture<'_, Result<usize>> {
        let graph_id = graph_id.to_string();
        Box::pin(async move { self.purge_sync(&graph_id) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weft_core::types::{FailureKind, TaskFailure};

    fn identity(node: &str, idx: Option<usize>) -> TaskIdentity {
        TaskIdentity::new("g1", node, idx, &json!({"node": node, "idx": idx}))
    }

    #[tokio::test]
    async fn test_record_then_lookup() {
        let log = SqliteLog::in_memory().unwrap();
        let id = identity("download", Some(0));
        let outcome = TaskOutcome::success(json!({"bytes": 12}));

        log.record(&id, &outcome, 1).await.unwrap();

        let record = log.lookup(&id).await.unwrap().unwrap();
        assert_eq!(record.identity, id);
        assert_eq!(record.outcome, outcome);
        assert_eq!(record.attempts, 1);
    }

    #[tokio::test]
    async fn test_lookup_missing() {
        let log = SqliteLog::in_memory().unwrap();
        assert!(log.lookup(&identity("nope", None)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_record_is_idempotent() {
        let log = SqliteLog::in_memory().unwrap();
        let id = identity("parse", None);
        let outcome = TaskOutcome::success(json!("ok"));

        log.record(&id, &outcome, 1).await.unwrap();
        log.record(&id, &outcome, 1).await.unwrap();

        assert_eq!(log.records("g1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_success_is_write_once() {
        let log = SqliteLog::in_memory().unwrap();
        let id = identity("enrich", None);

        log.record(&id, &TaskOutcome::success(json!(1)), 1)
            .await
            .unwrap();
        log.record(&id, &TaskOutcome::success(json!(2)), 2)
            .await
            .unwrap();

        let record = log.lookup(&id).await.unwrap().unwrap();
        assert_eq!(record.outcome.value(), Some(&json!(1)));
        assert_eq!(record.attempts, 1);
    }

    #[tokio::test]
    async fn test_failure_can_be_superseded() {
        let log = SqliteLog::in_memory().unwrap();
        let id = identity("summarize", None);
        let failed = TaskOutcome::failure(TaskFailure::new(
            FailureKind::RetriesExhausted,
            "boom",
            3,
        ));

        log.record(&id, &failed, 3).await.unwrap();
        log.record(&id, &TaskOutcome::success(json!("done")), 1)
            .await
            .unwrap();

        let record = log.lookup(&id).await.unwrap().unwrap();
        assert!(record.outcome.is_success());
    }

    #[tokio::test]
    async fn test_records_include_nested_graphs() {
        let log = SqliteLog::in_memory().unwrap();
        let top = TaskIdentity::new("app", "root", None, &json!(1));
        let child = TaskIdentity::new("app/root#abc", "map-0", Some(0), &json!(2));
        let other = TaskIdentity::new("application", "root", None, &json!(3));

        for id in [&top, &child, &other] {
            log.record(id, &TaskOutcome::success(json!(null)), 1)
                .await
                .unwrap();
        }

        let records = log.records("app").await.unwrap();
        assert_eq!(records.len(), 2);

        let purged = log.purge("app").await.unwrap();
        assert_eq!(purged, 2);
        assert_eq!(log.records("application").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.db");
        let id = identity("download", Some(2));

        {
            let log = SqliteLog::open(&path).unwrap();
            log.record(&id, &TaskOutcome::success(json!("page")), 2)
                .await
                .unwrap();
        }

        let reopened = SqliteLog::open(&path).unwrap();
        let record = reopened.lookup(&id).await.unwrap().unwrap();
        assert_eq!(record.outcome.value(), Some(&json!("page")));
        assert_eq!(record.identity.map_index, Some(2));
    }
}
