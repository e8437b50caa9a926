use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use futures::future::BoxFuture;

use weft_core::error::{Result, WeftError};
use weft_core::traits::DurableLog;
use weft_core::types::{DurableRecord, TaskIdentity, TaskOutcome};

/// Durable log kept in process memory.
///
/// Same write-once semantics as [`crate::SqliteLog`]; survives graph
/// resubmission within one process but not a restart.
#[derive(Default)]
pub struct MemoryLog {
    records: Mutex<HashMap<String, DurableRecord>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn in_graph(record: &DurableRecord, graph_id: &str) -> bool {
    let gid = &record.identity.graph_id;
    gid == graph_id
        || gid
            .strip_prefix(graph_id)
            .is_some_and(|rest| rest.starts_with('/'))
}

impl DurableLog for MemoryLog {
    fn record(
        &self,
        identity: &TaskIdentity,
        outcome: &TaskOutcome,
        attempts: u32,
    ) -> BoxFuture<'_, Result<()>> {
        let identity = identity.clone();
        let outcome = outcome.clone();
        Box::pin(async move {
            let mut records = self
                .records
                .lock()
                .map_err(|e| WeftError::Database(e.to_string()))?;
            let key = identity.key();
            if records
                .get(&key)
                .is_some_and(|existing| existing.outcome.is_success())
            {
                return Ok(());
            }
            records.insert(
                key,
                DurableRecord {
                    identity,
                    outcome,
                    attempts,
                    recorded_at: Utc::now(),
                },
            );
            Ok(())
        })
    }

    fn lookup(&self, identity: &TaskIdentity) -> BoxFuture<'_, Result<Option<DurableRecord>>> {
        let key = identity.key();
        Box::pin(async move {
            let records = self
                .records
                .lock()
                .map_err(|e| WeftError::Database(e.to_string()))?;
            Ok(records.get(&key).cloned())
        })
    }

    fn records(&self, graph_id: &str) -> BoxFuture<'_, Result<Vec<DurableRecord>>> {
        let graph_id = graph_id.to_string();
        Box::pin(async move {
            let records = self
                .records
                .lock()
                .map_err(|e| WeftError::Database(e.to_string()))?;
            let mut found: Vec<DurableRecord> = records
                .values()
                .filter(|r| in_graph(r, &graph_id))
                .cloned()
                .collect();
            found.sort_by(|a, b| a.recorded_at.cmp(&b.recorded_at));
            Ok(found)
        })
    }

    fn purge(&self, graph_id: &str) -> BoxFuture<'_, Result<usize>> {
        let graph_id = graph_id.to_string();
        Box::pin(async move {
            let mut records = self
                .records
                .lock()
                .map_err(|e| WeftError::Database(e.to_string()))?;
            let before = records.len();
            records.retain(|_, r| !in_graph(r, &graph_id));
            Ok(before - records.len())
        })
    }
}
