//! Fixtures for engine tests: instrumented task functions, a durable log that
//! can be made to fail, and engine/config constructors with fast retries.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tempfile::TempDir;

use weft_core::config::{DurabilityBackend, EngineConfig};
use weft_core::error::{Result, WeftError};
use weft_core::traits::DurableLog;
use weft_core::types::{DurableRecord, TaskIdentity, TaskOutcome};
use weft_engine::{Engine, TaskContext, TaskFunction};
use weft_store::{MemoryLog, SqliteLog};

/// Shared invocation counter.
#[derive(Clone, Default)]
pub struct Calls(Arc<AtomicU32>);

impl Calls {
    pub fn count(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn bump(&self) -> u32 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Returns its input, optionally after a delay, counting invocations.
#[derive(Clone, Default)]
pub struct CountingFn {
    calls: Calls,
    delay: Option<Duration>,
}

impl CountingFn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Calls {
        self.calls.clone()
    }
}

impl TaskFunction for CountingFn {
    fn execute(&self, input: Value, _ctx: TaskContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            self.calls.bump();
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            Ok(input)
        })
    }
}

/// Fails the first `failures` invocations, then returns its input.
pub struct FlakyFn {
    failures: u32,
    calls: Calls,
}

impl FlakyFn {
    pub fn new(failures: u32) -> Self {
        Self {
            failures,
            calls: Calls::default(),
        }
    }

    pub fn calls(&self) -> Calls {
        self.calls.clone()
    }
}

impl TaskFunction for FlakyFn {
    fn execute(&self, input: Value, _ctx: TaskContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let call = self.calls.bump();
            if call <= self.failures {
                return Err(WeftError::runtime(format!("flaky failure {}", call)));
            }
            Ok(input)
        })
    }
}

/// Always fails.
#[derive(Clone, Default)]
pub struct AlwaysFail {
    calls: Calls,
}

impl AlwaysFail {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Calls {
        self.calls.clone()
    }
}

impl TaskFunction for AlwaysFail {
    fn execute(&self, _input: Value, _ctx: TaskContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let call = self.calls.bump();
            Err(WeftError::runtime(format!("failure on call {}", call)))
        })
    }
}

/// Sleeps for `input.delay_ms` (or the default delay), then returns its
/// input. Counts invocations.
#[derive(Clone)]
pub struct SlowFn {
    default_delay: Duration,
    calls: Calls,
}

impl SlowFn {
    pub fn new(default_delay: Duration) -> Self {
        Self {
            default_delay,
            calls: Calls::default(),
        }
    }

    pub fn calls(&self) -> Calls {
        self.calls.clone()
    }
}

impl TaskFunction for SlowFn {
    fn execute(&self, input: Value, _ctx: TaskContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            self.calls.bump();
            let delay = input
                .get("delay_ms")
                .and_then(Value::as_u64)
                .map(Duration::from_millis)
                .unwrap_or(self.default_delay);
            tokio::time::sleep(delay).await;
            Ok(input)
        })
    }
}

/// In-memory log whose writes can be made to fail.
#[derive(Default)]
pub struct FailingLog {
    inner: MemoryLog,
    fail_all: bool,
    fail_nodes: Mutex<HashSet<String>>,
    write_attempts: Calls,
}

impl FailingLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every write fails.
    pub fn always() -> Self {
        Self {
            fail_all: true,
            ..Self::default()
        }
    }

    /// Writes for tasks of `node_id` fail.
    pub fn fail_node(self, node_id: &str) -> Self {
        self.fail_nodes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(node_id.to_string());
        self
    }

    /// Number of `record` calls, including failed ones.
    pub fn write_attempts(&self) -> u32 {
        self.write_attempts.count()
    }

    pub fn inner(&self) -> &MemoryLog {
        &self.inner
    }

    fn should_fail(&self, identity: &TaskIdentity) -> bool {
        self.fail_all
            || self
                .fail_nodes
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .contains(&identity.node_id)
    }
}

impl DurableLog for FailingLog {
    fn record(
        &self,
        identity: &TaskIdentity,
        outcome: &TaskOutcome,
        attempts: u32,
    ) -> BoxFuture<'_, Result<()>> {
        self.write_attempts.bump();
        if self.should_fail(identity) {
            let key = identity.key();
            return Box::pin(async move {
                Err(WeftError::Database(format!("injected write failure for {}", key)))
            });
        }
        self.inner.record(identity, outcome, attempts)
    }

    fn lookup(&self, identity: &TaskIdentity) -> BoxFuture<'_, Result<Option<DurableRecord>>> {
        self.inner.lookup(identity)
    }

    fn records(&self, graph_id: &str) -> BoxFuture<'_, Result<Vec<DurableRecord>>> {
        self.inner.records(graph_id)
    }

    fn purge(&self, graph_id: &str) -> BoxFuture<'_, Result<usize>> {
        self.inner.purge(graph_id)
    }
}

/// Config with millisecond backoff and an in-memory log.
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.retry.initial_backoff_ms = 1;
    config.retry.max_backoff_ms = 5;
    config.durability.backend = DurabilityBackend::Memory;
    config.durability.write_retries = 1;
    config
}

/// Engine over the given log with [`test_config`].
pub fn engine_with(log: Arc<dyn DurableLog>) -> Engine {
    Engine::new(test_config(), log)
}

/// Engine over a fresh in-memory log with [`test_config`].
pub fn test_engine() -> Engine {
    engine_with(Arc::new(MemoryLog::new()))
}

/// A SQLite log file inside a fresh temp directory.
///
/// Keep the `TempDir` alive for as long as the database is used.
pub fn temp_sqlite() -> (TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("records.db");
    (dir, path)
}

/// Open a SQLite log at `path` as a shareable trait object.
pub fn open_sqlite(path: &std::path::Path) -> Arc<dyn DurableLog> {
    Arc::new(SqliteLog::open(path).expect("open sqlite log"))
}
