use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Stable identity of one task invocation.
///
/// Two tasks with the same identity are the same invocation: same graph, same
/// node, same position inside a map/reduce, and byte-identical input. The
/// durable log is keyed by [`TaskIdentity::key`].
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct TaskIdentity {
    pub graph_id: String,
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map_index: Option<usize>,
    pub input_hash: String,
}

impl TaskIdentity {
    pub fn new(
        graph_id: impl Into<String>,
        node_id: impl Into<String>,
        map_index: Option<usize>,
        input: &serde_json::Value,
    ) -> Self {
        Self {
            graph_id: graph_id.into(),
            node_id: node_id.into(),
            map_index,
            input_hash: hash_input(input),
        }
    }

    /// Storage key: `graph/node[idx]#hash`.
    pub fn key(&self) -> String {
        match self.map_index {
            Some(idx) => format!(
                "{}/{}[{}]#{}",
                self.graph_id, self.node_id, idx, self.input_hash
            ),
            None => format!("{}/{}#{}", self.graph_id, self.node_id, self.input_hash),
        }
    }

    /// Short form for log lines.
    pub fn short(&self) -> String {
        let hash = &self.input_hash[..self.input_hash.len().min(8)];
        match self.map_index {
            Some(idx) => format!("{}/{}[{}]#{}", self.graph_id, self.node_id, idx, hash),
            None => format!("{}/{}#{}", self.graph_id, self.node_id, hash),
        }
    }
}

impl std::fmt::Display for TaskIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.short())
    }
}

/// Hex SHA-256 of the canonical JSON encoding of a task input.
///
/// `serde_json` objects are ordered maps, so equal values always encode to
/// the same bytes.
pub fn hash_input(input: &serde_json::Value) -> String {
    format!("{:x}", Sha256::digest(input.to_string().as_bytes()))
}

/// Resources a task asks for while it runs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequest {
    #[serde(default = "default_cpu")]
    pub cpu: f64,
    #[serde(default = "default_memory_gb")]
    pub memory_gb: f64,
    #[serde(default)]
    pub accelerators: u32,
}

fn default_cpu() -> f64 {
    1.0
}

fn default_memory_gb() -> f64 {
    1.0
}

impl Default for ResourceRequest {
    fn default() -> Self {
        Self {
            cpu: default_cpu(),
            memory_gb: default_memory_gb(),
            accelerators: 0,
        }
    }
}

impl ResourceRequest {
    pub fn new(cpu: f64, memory_gb: f64) -> Self {
        Self {
            cpu,
            memory_gb,
            accelerators: 0,
        }
    }

    /// A request that always fits. Used for orchestration-only functions.
    pub fn none() -> Self {
        Self {
            cpu: 0.0,
            memory_gb: 0.0,
            accelerators: 0,
        }
    }

    pub fn with_accelerators(mut self, count: u32) -> Self {
        self.accelerators = count;
        self
    }
}

/// How often and how patiently a failed task is re-run.
///
/// Backoff fields left as `None` take the engine's `[retry]` defaults when the
/// function is registered.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt; `r` allows `r + 1` attempts.
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub initial_backoff_ms: Option<u64>,
    #[serde(default)]
    pub max_backoff_ms: Option<u64>,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    pub fn with_backoff(mut self, initial_ms: u64, max_ms: u64) -> Self {
        self.initial_backoff_ms = Some(initial_ms);
        self.max_backoff_ms = Some(max_ms);
        self
    }

    /// Fill unset backoff fields.
    pub fn resolve(mut self, initial_ms: u64, max_ms: u64) -> Self {
        self.initial_backoff_ms.get_or_insert(initial_ms);
        self.max_backoff_ms.get_or_insert(max_ms);
        self
    }

    /// Total attempts this policy allows.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Policy record attached to a function at registration.
///
/// Immutable once registered: every task created from the function carries
/// exactly these attributes for its whole lifetime.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionSpec {
    pub name: String,
    pub resources: ResourceRequest,
    pub retry: RetryPolicy,
    /// `None` uses the engine's default timeout.
    pub timeout: Option<Duration>,
}

impl FunctionSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resources: ResourceRequest::default(),
            retry: RetryPolicy::default(),
            timeout: None,
        }
    }

    pub fn with_resources(mut self, resources: ResourceRequest) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.retry.max_retries = max_retries;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Retrying,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Cancelled
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Retrying => "retrying",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Why a task ended without a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Every allowed attempt failed or timed out.
    RetriesExhausted,
    /// An input the task consumes failed, so the task never ran.
    DependencyFailed,
    /// The task's input had the wrong shape (e.g. map over a non-array).
    InvalidInput,
    /// The task asked for more resources than the engine has.
    ResourceUnsatisfiable,
    /// The graph run was aborted before the task finished.
    Aborted,
}

/// Terminal failure of a single task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
    #[serde(default)]
    pub attempts: u32,
}

impl TaskFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>, attempts: u32) -> Self {
        Self {
            kind,
            message: message.into(),
            attempts,
        }
    }

    pub fn dependency(message: impl Into<String>) -> Self {
        Self::new(FailureKind::DependencyFailed, message, 0)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(FailureKind::InvalidInput, message, 0)
    }

    /// Convert into an engine error tied to a task key.
    pub fn into_error(self, task: impl Into<String>) -> crate::error::WeftError {
        use crate::error::WeftError;
        let task = task.into();
        match self.kind {
            FailureKind::RetriesExhausted => WeftError::RetriesExhausted {
                task,
                attempts: self.attempts,
                last_error: self.message,
            },
            FailureKind::DependencyFailed => WeftError::DependencyFailed {
                task,
                reason: self.message,
            },
            FailureKind::InvalidInput => WeftError::InvalidInput {
                task,
                reason: self.message,
            },
            FailureKind::ResourceUnsatisfiable => WeftError::ResourceUnsatisfiable {
                function: task,
                detail: self.message,
            },
            FailureKind::Aborted => WeftError::Scheduler(format!("{}: {}", task, self.message)),
        }
    }
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Terminal outcome of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    Succeeded { value: serde_json::Value },
    Failed { failure: TaskFailure },
}

impl TaskOutcome {
    pub fn success(value: serde_json::Value) -> Self {
        Self::Succeeded { value }
    }

    pub fn failure(failure: TaskFailure) -> Self {
        Self::Failed { failure }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Succeeded { .. })
    }

    pub fn value(&self) -> Option<&serde_json::Value> {
        match self {
            TaskOutcome::Succeeded { value } => Some(value),
            TaskOutcome::Failed { .. } => None,
        }
    }

    pub fn as_result(&self) -> std::result::Result<&serde_json::Value, &TaskFailure> {
        match self {
            TaskOutcome::Succeeded { value } => Ok(value),
            TaskOutcome::Failed { failure } => Err(failure),
        }
    }

    pub fn into_result(self) -> std::result::Result<serde_json::Value, TaskFailure> {
        match self {
            TaskOutcome::Succeeded { value } => Ok(value),
            TaskOutcome::Failed { failure } => Err(failure),
        }
    }

    pub fn state(&self) -> TaskState {
        match self {
            TaskOutcome::Succeeded { .. } => TaskState::Succeeded,
            TaskOutcome::Failed { .. } => TaskState::Failed,
        }
    }
}

/// Persisted terminal outcome for one task identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurableRecord {
    pub identity: TaskIdentity,
    pub outcome: TaskOutcome,
    pub attempts: u32,
    pub recorded_at: DateTime<Utc>,
}

/// Point-in-time view of a task, as observed through a future.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSnapshot {
    pub state: TaskState,
    pub attempts: u32,
    pub outcome: Option<TaskOutcome>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskSnapshot {
    pub fn pending() -> Self {
        Self {
            state: TaskState::Pending,
            attempts: 0,
            outcome: None,
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Events emitted by the engine.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    GraphSubmitted {
        graph_id: String,
        nodes: usize,
    },
    TaskStarted {
        identity: TaskIdentity,
        attempt: u32,
    },
    TaskAttemptFailed {
        identity: TaskIdentity,
        attempt: u32,
        error: String,
        timed_out: bool,
    },
    TaskRetrying {
        identity: TaskIdentity,
        next_attempt: u32,
        backoff_ms: u64,
    },
    TaskSucceeded {
        identity: TaskIdentity,
        attempts: u32,
        elapsed_ms: u64,
    },
    TaskFailed {
        identity: TaskIdentity,
        failure: TaskFailure,
    },
    TaskReplayed {
        identity: TaskIdentity,
    },
    GraphCompleted {
        graph_id: String,
        succeeded: bool,
        elapsed_ms: u64,
    },
}

impl EngineEvent {
    /// Graph the event belongs to.
    pub fn graph_id(&self) -> &str {
        match self {
            EngineEvent::GraphSubmitted { graph_id, .. }
            | EngineEvent::GraphCompleted { graph_id, .. } => graph_id,
            EngineEvent::TaskStarted { identity, .. }
            | EngineEvent::TaskAttemptFailed { identity, .. }
            | EngineEvent::TaskRetrying { identity, .. }
            | EngineEvent::TaskSucceeded { identity, .. }
            | EngineEvent::TaskFailed { identity, .. }
            | EngineEvent::TaskReplayed { identity } => &identity.graph_id,
        }
    }
}
