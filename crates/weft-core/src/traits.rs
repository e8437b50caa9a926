use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::{DurableRecord, TaskIdentity, TaskOutcome};

/// Durable log — persistence of terminal task outcomes.
///
/// Implementations must make `record` idempotent per identity and must not
/// return before the outcome is visible to `lookup`.
pub trait DurableLog: Send + Sync + 'static {
    /// Persist the terminal outcome of a task.
    ///
    /// A `Succeeded` record is write-once: later calls for the same identity
    /// leave it untouched. A `Failed` record may be replaced.
    fn record(
        &self,
        identity: &TaskIdentity,
        outcome: &TaskOutcome,
        attempts: u32,
    ) -> BoxFuture<'_, Result<()>>;

    /// Look up the recorded outcome for an identity.
    fn lookup(&self, identity: &TaskIdentity) -> BoxFuture<'_, Result<Option<DurableRecord>>>;

    /// All records of a graph and of its nested graphs (`graph_id/...`).
    fn records(&self, graph_id: &str) -> BoxFuture<'_, Result<Vec<DurableRecord>>>;

    /// Delete all records of a graph and its nested graphs.
    fn purge(&self, graph_id: &str) -> BoxFuture<'_, Result<usize>>;
}
