//! Handles to tasks launched from a [`crate::Scope`], and waiting on groups
//! of them.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use tokio::sync::watch;

use weft_core::error::WeftError;
use weft_core::types::{
    FailureKind, TaskFailure, TaskIdentity, TaskOutcome, TaskSnapshot, TaskState,
};

use crate::resources::HeldLease;

pub(crate) type Observer = Arc<watch::Sender<TaskSnapshot>>;

/// Record a terminal outcome on an observed task.
pub(crate) fn settle(observer: &watch::Sender<TaskSnapshot>, outcome: &TaskOutcome, attempts: u32) {
    observer.send_modify(|s| {
        s.state = outcome.state();
        s.attempts = attempts;
        s.outcome = Some(outcome.clone());
        s.finished_at = Some(Utc::now());
    });
}

/// Fail an observed task that will never reach a terminal outcome on its own.
/// No-op if it already has one.
pub(crate) fn abort(observer: &watch::Sender<TaskSnapshot>, error: &WeftError) {
    let (state, kind) = match error {
        WeftError::ResourceUnsatisfiable { .. } => {
            (TaskState::Failed, FailureKind::ResourceUnsatisfiable)
        }
        e if e.is_malformed_graph() => (TaskState::Failed, FailureKind::InvalidInput),
        _ => (TaskState::Cancelled, FailureKind::Aborted),
    };
    observer.send_if_modified(|s| {
        if s.is_terminal() {
            return false;
        }
        s.state = state;
        s.outcome = Some(TaskOutcome::failure(TaskFailure::new(
            kind,
            error.to_string(),
            s.attempts,
        )));
        s.finished_at = Some(Utc::now());
        true
    });
}

/// Handle to a launched task.
///
/// Non-blocking queries read the latest state; [`TaskFuture::result`] waits
/// for the terminal outcome. Clones observe the same task.
///
/// A future launched from inside a task body gives that task's lease back
/// while waiting.
#[derive(Clone)]
pub struct TaskFuture {
    identity: TaskIdentity,
    rx: watch::Receiver<TaskSnapshot>,
    lease: Option<Arc<HeldLease>>,
}

impl TaskFuture {
    pub(crate) fn new(identity: TaskIdentity, rx: watch::Receiver<TaskSnapshot>) -> Self {
        Self {
            identity,
            rx,
            lease: None,
        }
    }

    pub(crate) fn with_lease(mut self, lease: Option<Arc<HeldLease>>) -> Self {
        self.lease = lease;
        self
    }

    pub fn identity(&self) -> &TaskIdentity {
        &self.identity
    }

    pub fn state(&self) -> TaskState {
        self.rx.borrow().state
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        self.rx.borrow().clone()
    }

    pub fn is_done(&self) -> bool {
        self.rx.borrow().is_terminal()
    }

    /// The outcome if the task is terminal, without waiting.
    pub fn try_result(&self) -> Option<std::result::Result<Value, TaskFailure>> {
        self.rx.borrow().outcome.clone().map(TaskOutcome::into_result)
    }

    /// Wait for the task to reach a terminal state.
    pub async fn completed(&self) -> TaskSnapshot {
        if self.is_done() {
            return self.snapshot();
        }
        suspended(self.lease.as_deref(), self.settled()).await
    }

    async fn settled(&self) -> TaskSnapshot {
        let mut rx = self.rx.clone();
        if let Ok(snapshot) = rx.wait_for(TaskSnapshot::is_terminal).await {
            return snapshot.clone();
        }
        // The run ended without settling this task.
        let mut snapshot = rx.borrow().clone();
        if !snapshot.is_terminal() {
            snapshot.state = TaskState::Cancelled;
            snapshot.outcome = Some(TaskOutcome::failure(TaskFailure::new(
                FailureKind::Aborted,
                "task was abandoned before completing",
                snapshot.attempts,
            )));
            snapshot.finished_at = Some(Utc::now());
        }
        snapshot
    }

    /// Wait for the task and return its value or failure.
    pub async fn result(&self) -> std::result::Result<Value, TaskFailure> {
        let snapshot = self.completed().await;
        match snapshot.outcome {
            Some(outcome) => outcome.into_result(),
            None => Err(TaskFailure::new(
                FailureKind::Aborted,
                "task finished without an outcome",
                snapshot.attempts,
            )),
        }
    }
}

impl std::fmt::Debug for TaskFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskFuture")
            .field("identity", &self.identity.short())
            .field("state", &self.state())
            .finish()
    }
}

async fn suspended<F: Future>(lease: Option<&HeldLease>, fut: F) -> F::Output {
    match lease {
        Some(lease) => lease.yielding(fut).await,
        None => fut.await,
    }
}

fn lease_of(futures: &[TaskFuture]) -> Option<&HeldLease> {
    futures.iter().find_map(|f| f.lease.as_deref())
}

/// When [`wait`] returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnWhen {
    /// Every future is terminal.
    AllCompleted,
    /// At least one future is terminal.
    FirstCompleted,
    /// Any future fails, or all complete.
    FirstFailure,
    /// At least `n` futures are terminal.
    AtLeast(usize),
}

/// Partition of waited futures, by index into the input slice.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WaitSet {
    pub done: Vec<usize>,
    pub pending: Vec<usize>,
}

impl WaitSet {
    fn partition(futures: &[TaskFuture]) -> Self {
        let (done, pending) = (0..futures.len()).partition(|&i| futures[i].is_done());
        Self { done, pending }
    }

    pub fn all_done(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Wait on a group of futures until `when` is satisfied.
///
/// `done` holds every future terminal at return time, not only the ones that
/// triggered the return.
pub async fn wait(futures: &[TaskFuture], when: ReturnWhen) -> WaitSet {
    suspended(lease_of(futures), wait_until(futures, when)).await
}

async fn wait_until(futures: &[TaskFuture], when: ReturnWhen) -> WaitSet {
    let target = match when {
        ReturnWhen::AllCompleted | ReturnWhen::FirstFailure => futures.len(),
        ReturnWhen::FirstCompleted => futures.len().min(1),
        ReturnWhen::AtLeast(n) => futures.len().min(n),
    };

    let mut waiting: FuturesUnordered<_> = futures
        .iter()
        .map(|f| f.settled())
        .collect();

    let mut finished = 0;
    while finished < target {
        let Some(snapshot) = waiting.next().await else {
            break;
        };
        finished += 1;
        let failed = snapshot
            .outcome
            .as_ref()
            .is_some_and(|o| !o.is_success());
        if when == ReturnWhen::FirstFailure && failed {
            break;
        }
    }

    WaitSet::partition(futures)
}

/// Like [`wait`], but gives up after `timeout` and reports whatever is done.
pub async fn wait_timeout(futures: &[TaskFuture], when: ReturnWhen, timeout: Duration) -> WaitSet {
    let bounded = tokio::time::timeout(timeout, wait_until(futures, when));
    match suspended(lease_of(futures), bounded).await {
        Ok(set) => set,
        Err(_) => WaitSet::partition(futures),
    }
}
