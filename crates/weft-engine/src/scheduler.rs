//! Dependency-driven execution of one invocation graph.
//!
//! The scheduler keeps one slot per task. After every terminal outcome it
//! walks the nodes in dependency order and dispatches whatever became ready:
//! a call once all its dependencies settled, a map element once its source
//! element settled, a reduce step once the previous step and its source
//! element settled. Each dispatched slot runs as an execution unit on a
//! `JoinSet`: durable lookup, resource lease, then supervised attempts. A
//! unit gives its lease back while its body waits on nested work.
//!
//! Outcomes are written to the durable log before anything downstream is
//! dispatched. Failures never cross into independent branches; consumers of a
//! failed value settle as `DependencyFailed` without running.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use weft_core::error::{Result, WeftError};
use weft_core::types::{
    EngineEvent, FailureKind, TaskFailure, TaskIdentity, TaskOutcome,
};

use crate::engine::EngineShared;
use crate::future::{self, Observer};
use crate::graph::{GraphNode, InvocationGraph, NodeKind};
use crate::registry::FunctionRef;
use crate::resources::HeldLease;
use crate::report::{GraphReport, GraphStatus, NodeReport, TaskReport};
use crate::retry::Supervisor;
use crate::scope::{Scope, TaskContext};

/// Terminal result held by a settled slot.
struct Settled {
    identity: Option<TaskIdentity>,
    outcome: TaskOutcome,
    attempts: u32,
    replayed: bool,
}

enum Slot {
    Waiting,
    Dispatched,
    Done(Settled),
}

fn done(slot: &Slot) -> Option<&Settled> {
    match slot {
        Slot::Done(settled) => Some(settled),
        _ => None,
    }
}

#[derive(Default)]
struct NodeState {
    /// `None` until the number of tasks is known.
    slots: Option<Vec<Slot>>,
    /// Set when the node fails as a whole (e.g. its source failed).
    failure: Option<TaskFailure>,
    /// Source sequence of a map or reduce fed by a call or reduce node,
    /// taken once when that node settles.
    items: Option<Vec<Value>>,
    /// Next reduce step to dispatch.
    cursor: usize,
}

impl NodeState {
    fn settled(&self) -> bool {
        self.failure.is_some()
            || self
                .slots
                .as_ref()
                .is_some_and(|slots| slots.iter().all(|s| matches!(s, Slot::Done(_))))
    }
}

enum UnitOutcome {
    Replayed {
        outcome: TaskOutcome,
        attempts: u32,
    },
    Executed {
        outcome: TaskOutcome,
        attempts: u32,
        elapsed_ms: u64,
    },
    LogUnavailable(String),
}

struct UnitResult {
    node: usize,
    slot: usize,
    identity: TaskIdentity,
    outcome: UnitOutcome,
}

/// One task on its way through lookup, lease, and attempts.
struct Unit {
    node: usize,
    slot: usize,
    identity: TaskIdentity,
    function: FunctionRef,
    input: Value,
    observer: Option<Observer>,
    shared: Arc<EngineShared>,
}

impl Unit {
    async fn run(self) -> UnitResult {
        let outcome = self.execute().await;
        UnitResult {
            node: self.node,
            slot: self.slot,
            identity: self.identity,
            outcome,
        }
    }

    async fn execute(&self) -> UnitOutcome {
        match self.shared.log.lookup(&self.identity).await {
            Ok(Some(record)) if record.outcome.is_success() => {
                return UnitOutcome::Replayed {
                    outcome: record.outcome,
                    attempts: record.attempts,
                };
            }
            Ok(_) => {}
            Err(e) => return UnitOutcome::LogUnavailable(e.to_string()),
        }

        let spec = self.function.spec();
        let started = Instant::now();
        let lease = match self.shared.pool.acquire(&spec.resources).await {
            Ok(lease) => HeldLease::new(self.shared.pool.clone(), spec.resources, lease),
            Err(e) => {
                let failure =
                    TaskFailure::new(FailureKind::ResourceUnsatisfiable, e.to_string(), 0);
                return UnitOutcome::Executed {
                    outcome: TaskOutcome::failure(failure),
                    attempts: 0,
                    elapsed_ms: 0,
                };
            }
        };

        let supervisor = Supervisor {
            identity: &self.identity,
            body: self.function.body(),
            policy: &spec.retry,
            timeout: spec
                .timeout
                .unwrap_or_else(|| self.shared.config.engine.default_timeout()),
            events: &self.shared.events,
            observer: self.observer.as_deref(),
        };
        let shared = &self.shared;
        let identity = &self.identity;
        let (outcome, attempts) = supervisor
            .run(self.input.clone(), |attempt| {
                TaskContext::new(
                    identity.clone(),
                    attempt,
                    Scope::nested(shared.clone(), identity, lease.clone()),
                )
            })
            .await;
        lease.close();

        UnitOutcome::Executed {
            outcome,
            attempts,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// Execution state of one submitted graph.
pub(crate) struct GraphRun {
    graph: Arc<InvocationGraph>,
    shared: Arc<EngineShared>,
    nodes: Vec<NodeState>,
    units: JoinSet<UnitResult>,
    observers: HashMap<(usize, usize), Observer>,
    started_at: DateTime<Utc>,
}

impl GraphRun {
    pub(crate) fn new(shared: Arc<EngineShared>, graph: InvocationGraph) -> Self {
        let nodes = graph
            .nodes()
            .iter()
            .map(|node| NodeState {
                slots: matches!(node.kind, NodeKind::Call).then(|| vec![Slot::Waiting]),
                ..NodeState::default()
            })
            .collect();
        Self {
            graph: Arc::new(graph),
            shared,
            nodes,
            units: JoinSet::new(),
            observers: HashMap::new(),
            started_at: Utc::now(),
        }
    }

    /// Mirror the state of one task slot into a future.
    pub(crate) fn observe(mut self, node: usize, slot: usize, observer: Observer) -> Self {
        self.observers.insert((node, slot), observer);
        self
    }

    pub(crate) async fn run(mut self) -> Result<GraphReport> {
        let started = Instant::now();
        let graph_id = self.graph.id().to_string();
        self.shared.events.publish(EngineEvent::GraphSubmitted {
            graph_id: graph_id.clone(),
            nodes: self.graph.len(),
        });
        debug!(graph_id = %graph_id, nodes = self.graph.len(), "Graph started");

        let result = self.drive().await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(()) => {
                let report = self.report();
                let succeeded = report.status == GraphStatus::Succeeded;
                info!(
                    graph_id = %graph_id,
                    status = %report.status,
                    executed = report.executed(),
                    replayed = report.replayed(),
                    elapsed_ms,
                    "Graph completed"
                );
                self.shared.events.publish(EngineEvent::GraphCompleted {
                    graph_id,
                    succeeded,
                    elapsed_ms,
                });
                Ok(report)
            }
            Err(e) => {
                self.units.abort_all();
                for observer in self.observers.values() {
                    future::abort(observer, &e);
                }
                error!(graph_id = %graph_id, error = %e, "Graph aborted");
                self.shared.events.publish(EngineEvent::GraphCompleted {
                    graph_id,
                    succeeded: false,
                    elapsed_ms,
                });
                Err(e)
            }
        }
    }

    async fn drive(&mut self) -> Result<()> {
        loop {
            self.advance();
            let Some(joined) = self.units.join_next().await else {
                break;
            };
            let finished = joined
                .map_err(|e| WeftError::Scheduler(format!("execution unit failed: {}", e)))?;
            self.complete(finished).await?;
        }

        if let Some(i) = (0..self.nodes.len()).find(|&i| !self.nodes[i].settled()) {
            return Err(WeftError::Scheduler(format!(
                "graph '{}' stalled at node '{}'",
                self.graph.id(),
                self.graph.nodes()[i].id
            )));
        }
        Ok(())
    }

    async fn complete(&mut self, finished: UnitResult) -> Result<()> {
        let UnitResult {
            node,
            slot,
            identity,
            outcome,
        } = finished;

        let settled = match outcome {
            UnitOutcome::LogUnavailable(msg) => {
                return Err(WeftError::Database(format!(
                    "lookup of {} failed: {}",
                    identity, msg
                )));
            }
            UnitOutcome::Replayed { outcome, attempts } => {
                debug!(task = %identity, "Replayed from durable log");
                self.shared.events.publish(EngineEvent::TaskReplayed {
                    identity: identity.clone(),
                });
                Settled {
                    identity: Some(identity),
                    outcome,
                    attempts,
                    replayed: true,
                }
            }
            UnitOutcome::Executed {
                outcome,
                attempts,
                elapsed_ms,
            } => {
                self.persist(&identity, &outcome, attempts).await?;
                match &outcome {
                    TaskOutcome::Succeeded { .. } => {
                        info!(task = %identity, attempts, elapsed_ms, "Task succeeded");
                        self.shared.events.publish(EngineEvent::TaskSucceeded {
                            identity: identity.clone(),
                            attempts,
                            elapsed_ms,
                        });
                    }
                    TaskOutcome::Failed { failure } => {
                        warn!(task = %identity, attempts, error = %failure, "Task failed");
                        self.shared.events.publish(EngineEvent::TaskFailed {
                            identity: identity.clone(),
                            failure: failure.clone(),
                        });
                    }
                }
                Settled {
                    identity: Some(identity),
                    outcome,
                    attempts,
                    replayed: false,
                }
            }
        };

        self.settle(node, slot, settled);
        Ok(())
    }

    /// Write a terminal outcome, retrying transient log failures.
    async fn persist(
        &self,
        identity: &TaskIdentity,
        outcome: &TaskOutcome,
        attempts: u32,
    ) -> Result<()> {
        let retries = self.shared.config.durability.write_retries;
        let mut tries = 0u32;
        loop {
            match self.shared.log.record(identity, outcome, attempts).await {
                Ok(()) => return Ok(()),
                Err(e) if tries < retries => {
                    tries += 1;
                    warn!(task = %identity, try_number = tries, error = %e, "Durable write failed, retrying");
                    tokio::time::sleep(Duration::from_millis(25 << tries.min(6))).await;
                }
                Err(e) => {
                    error!(task = %identity, error = %e, "Durable write failed");
                    return Err(WeftError::DurabilityWrite(format!("{}: {}", identity, e)));
                }
            }
        }
    }

    fn settle(&mut self, node: usize, slot: usize, settled: Settled) {
        if let Some(observer) = self.observers.get(&(node, slot)) {
            future::settle(observer, &settled.outcome, settled.attempts);
        }
        if let Some(slots) = self.nodes[node].slots.as_mut() {
            slots[slot] = Slot::Done(settled);
        }
    }

    /// Settle a slot as failed without running it.
    fn skip(&mut self, node: usize, slot: usize, failure: TaskFailure) {
        debug!(
            node = %self.graph.nodes()[node].id,
            slot,
            reason = %failure,
            "Task skipped"
        );
        self.settle(
            node,
            slot,
            Settled {
                identity: None,
                outcome: TaskOutcome::failure(failure),
                attempts: 0,
                replayed: false,
            },
        );
    }

    fn dispatch(
        &mut self,
        node_pos: usize,
        slot: usize,
        map_index: Option<usize>,
        node: &GraphNode,
        input: Value,
    ) {
        let identity = TaskIdentity::new(self.graph.id(), &node.id, map_index, &input);
        debug!(task = %identity, function = %node.function.name(), "Dispatching task");
        if let Some(slots) = self.nodes[node_pos].slots.as_mut() {
            slots[slot] = Slot::Dispatched;
        }
        let unit = Unit {
            node: node_pos,
            slot,
            identity,
            function: node.function.clone(),
            input,
            observer: self.observers.get(&(node_pos, slot)).cloned(),
            shared: self.shared.clone(),
        };
        self.units.spawn(unit.run());
    }

    // ── Readiness ─────────────────────────────────────────────

    fn advance(&mut self) {
        let graph = self.graph.clone();
        for &i in graph.order() {
            if self.nodes[i].settled() {
                continue;
            }
            let node = &graph.nodes()[i];
            match &node.kind {
                NodeKind::Call => self.poll_call(i, node),
                NodeKind::Map => self.poll_map(i, node),
                NodeKind::Reduce { initial } => self.poll_reduce(i, node, initial),
            }
        }
    }

    fn poll_call(&mut self, i: usize, node: &GraphNode) {
        if !matches!(self.slot(i, 0), Some(Slot::Waiting)) {
            return;
        }
        if !node.depends_on.iter().all(|dep| self.is_settled(dep)) {
            return;
        }
        match self.resolve_input(node) {
            Ok(input) => self.dispatch(i, 0, None, node, input),
            Err(failure) => self.skip(i, 0, failure),
        }
    }

    fn poll_map(&mut self, i: usize, node: &GraphNode) {
        let Some(len) = self.ensure_slots(i, node) else {
            return;
        };
        for k in 0..len {
            if !matches!(self.slot(i, k), Some(Slot::Waiting)) {
                continue;
            }
            match self.source_item(i, node, k) {
                None => {}
                Some(Ok(item)) => self.dispatch(i, k, Some(k), node, item),
                Some(Err(failure)) => self.skip(i, k, failure),
            }
        }
    }

    fn poll_reduce(&mut self, i: usize, node: &GraphNode, initial: &Value) {
        let Some(len) = self.ensure_slots(i, node) else {
            return;
        };
        loop {
            let k = self.nodes[i].cursor;
            if k >= len || !matches!(self.slot(i, k), Some(Slot::Waiting)) {
                return;
            }

            let acc = if k == 0 {
                initial.clone()
            } else {
                let previous = self.slot(i, k - 1).and_then(done).map(|s| {
                    s.outcome
                        .as_result()
                        .cloned()
                        .map_err(|f| f.message.clone())
                });
                match previous {
                    None => return,
                    Some(Ok(acc)) => acc,
                    Some(Err(msg)) => {
                        let failure = TaskFailure::dependency(format!(
                            "step {} of '{}' failed: {}",
                            k - 1,
                            node.id,
                            msg
                        ));
                        self.skip(i, k, failure);
                        self.nodes[i].cursor += 1;
                        continue;
                    }
                }
            };

            match self.source_item(i, node, k) {
                None => return,
                Some(Err(failure)) => {
                    self.skip(i, k, failure);
                    self.nodes[i].cursor += 1;
                }
                Some(Ok(item)) => {
                    self.dispatch(i, k, Some(k), node, json!({ "acc": acc, "item": item }));
                    self.nodes[i].cursor += 1;
                    return;
                }
            }
        }
    }

    /// Size the slots of a map/reduce once its source length is known.
    fn ensure_slots(&mut self, i: usize, node: &GraphNode) -> Option<usize> {
        if let Some(slots) = &self.nodes[i].slots {
            return Some(slots.len());
        }
        match self.source_len(node)? {
            Ok((len, items)) => {
                self.nodes[i].slots = Some((0..len).map(|_| Slot::Waiting).collect());
                self.nodes[i].items = items;
                Some(len)
            }
            Err(failure) => {
                warn!(node = %node.id, error = %failure, "Node cannot run");
                self.nodes[i].failure = Some(failure);
                None
            }
        }
    }

    fn slot(&self, node: usize, slot: usize) -> Option<&Slot> {
        self.nodes[node].slots.as_ref().and_then(|s| s.get(slot))
    }

    fn is_settled(&self, id: &str) -> bool {
        self.graph
            .position(id)
            .is_some_and(|j| self.nodes[j].settled())
    }

    // ── Value resolution ──────────────────────────────────────

    fn resolve_input(&self, node: &GraphNode) -> std::result::Result<Value, TaskFailure> {
        match node.depends_on.as_slice() {
            [] => Ok(node.input.clone()),
            [dep] => self.dependency_value(dep),
            deps => {
                let mut inputs = serde_json::Map::new();
                for dep in deps {
                    inputs.insert(dep.clone(), self.dependency_value(dep)?);
                }
                Ok(Value::Object(inputs))
            }
        }
    }

    /// Output of a settled dependency, as seen by a consumer.
    fn dependency_value(&self, id: &str) -> std::result::Result<Value, TaskFailure> {
        self.node_result(id).map_err(|f| {
            TaskFailure::dependency(format!("node '{}' failed: {}", id, f.message))
        })
    }

    /// Output of a settled node: the call value, the ordered map results, or
    /// the final accumulator.
    fn node_result(&self, id: &str) -> std::result::Result<Value, TaskFailure> {
        let j = self
            .graph
            .position(id)
            .ok_or_else(|| TaskFailure::invalid_input(format!("unknown node '{}'", id)))?;
        let state = &self.nodes[j];
        if let Some(failure) = &state.failure {
            return Err(failure.clone());
        }
        let slots = state.slots.as_deref().unwrap_or(&[]);
        let unsettled = || TaskFailure::dependency(format!("node '{}' has not settled", id));

        match &self.graph.nodes()[j].kind {
            NodeKind::Call => {
                let settled = slots.first().and_then(done).ok_or_else(unsettled)?;
                settled.outcome.as_result().cloned().map_err(Clone::clone)
            }
            NodeKind::Map => {
                let mut values = Vec::with_capacity(slots.len());
                for (k, slot) in slots.iter().enumerate() {
                    let settled = done(slot).ok_or_else(unsettled)?;
                    match settled.outcome.as_result() {
                        Ok(value) => values.push(value.clone()),
                        Err(f) => {
                            return Err(TaskFailure::new(
                                f.kind,
                                format!("element {}: {}", k, f.message),
                                f.attempts,
                            ));
                        }
                    }
                }
                Ok(Value::Array(values))
            }
            NodeKind::Reduce { initial } => match slots.last() {
                None => Ok(initial.clone()),
                Some(slot) => {
                    let settled = done(slot).ok_or_else(unsettled)?;
                    settled.outcome.as_result().cloned().map_err(Clone::clone)
                }
            },
        }
    }

    /// Length of a map/reduce source once it is known. A call or reduce
    /// source is also returned whole, so elements are not re-resolved per
    /// task.
    fn source_len(
        &self,
        node: &GraphNode,
    ) -> Option<std::result::Result<(usize, Option<Vec<Value>>), TaskFailure>> {
        let Some(dep) = node.depends_on.first() else {
            return Some(Ok((node.input.as_array().map_or(0, Vec::len), None)));
        };
        let j = self.graph.position(dep)?;
        let state = &self.nodes[j];

        if self.graph.nodes()[j].is_map() {
            if state.failure.is_some() {
                return Some(self.dependency_value(dep).map(|_| (0, None)));
            }
            return state.slots.as_ref().map(|slots| Ok((slots.len(), None)));
        }
        if !state.settled() {
            return None;
        }
        Some(match self.dependency_value(dep) {
            Ok(Value::Array(items)) => Ok((items.len(), Some(items))),
            Ok(other) => Err(TaskFailure::invalid_input(format!(
                "node '{}' produced {} where a sequence was expected",
                dep,
                json_kind(&other)
            ))),
            Err(failure) => Err(failure),
        })
    }

    fn source_item(
        &self,
        i: usize,
        node: &GraphNode,
        k: usize,
    ) -> Option<std::result::Result<Value, TaskFailure>> {
        let Some(dep) = node.depends_on.first() else {
            return Some(Ok(node.input.get(k).cloned().unwrap_or(Value::Null)));
        };
        let j = self.graph.position(dep)?;

        if self.graph.nodes()[j].is_map() {
            let settled = done(self.slot(j, k)?)?;
            return Some(settled.outcome.as_result().cloned().map_err(|f| {
                TaskFailure::dependency(format!(
                    "element {} of '{}' failed: {}",
                    k, dep, f.message
                ))
            }));
        }
        let items = self.nodes[i].items.as_ref()?;
        Some(Ok(items.get(k).cloned().unwrap_or(Value::Null)))
    }

    // ── Reporting ─────────────────────────────────────────────

    fn report(&self) -> GraphReport {
        let outputs = self.graph.output_positions();
        let nodes: Vec<NodeReport> = self
            .graph
            .nodes()
            .iter()
            .enumerate()
            .map(|(i, node)| {
                let positional = !matches!(node.kind, NodeKind::Call);
                let tasks = self.nodes[i]
                    .slots
                    .iter()
                    .flatten()
                    .enumerate()
                    .filter_map(|(k, slot)| {
                        done(slot).map(|s| TaskReport {
                            key: s.identity.as_ref().map(TaskIdentity::key),
                            map_index: positional.then_some(k),
                            outcome: s.outcome.clone(),
                            attempts: s.attempts,
                            replayed: s.replayed,
                        })
                    })
                    .collect();
                let outcome = match self.node_result(&node.id) {
                    Ok(value) => TaskOutcome::success(value),
                    Err(failure) => TaskOutcome::failure(failure),
                };
                NodeReport {
                    node_id: node.id.clone(),
                    function: node.function.name().to_string(),
                    kind: node.kind.as_str().to_string(),
                    output: outputs.contains(&i),
                    outcome,
                    tasks,
                }
            })
            .collect();

        let status = if nodes
            .iter()
            .filter(|n| n.output)
            .all(|n| n.outcome.is_success())
        {
            GraphStatus::Succeeded
        } else {
            GraphStatus::Failed
        };

        GraphReport {
            graph_id: self.graph.id().to_string(),
            status,
            started_at: self.started_at,
            finished_at: Utc::now(),
            nodes,
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
