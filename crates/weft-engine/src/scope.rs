use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;

use weft_core::error::Result;
use weft_core::types::{TaskIdentity, TaskOutcome, TaskSnapshot};

use crate::engine::EngineShared;
use crate::future::{self, TaskFuture};
use crate::graph::{GraphBuilder, InvocationGraph};
use crate::registry::FunctionRef;
use crate::report::GraphReport;
use crate::resources::HeldLease;

/// What a function body gets besides its input.
#[derive(Clone)]
pub struct TaskContext {
    identity: TaskIdentity,
    attempt: u32,
    scope: Scope,
}

impl TaskContext {
    pub(crate) fn new(identity: TaskIdentity, attempt: u32, scope: Scope) -> Self {
        Self {
            identity,
            attempt,
            scope,
        }
    }

    pub fn identity(&self) -> &TaskIdentity {
        &self.identity
    }

    /// 1-based attempt number.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Scope for nested work. Nested graph ids derive from this task's
    /// identity, so a retried or resubmitted task launches the same children
    /// and finds their recorded outcomes.
    pub fn scope(&self) -> &Scope {
        &self.scope
    }
}

/// Launch point for dynamic work: single tasks, maps, reduces, and whole
/// graphs.
///
/// Each operation becomes its own graph, `{scope}/{op}-{n}`, where `n`
/// counts operations in call order. Issuing the same operations in the same
/// order therefore reproduces the same task identities.
///
/// A task body's scope gives the task's resource lease back to the pool for
/// as long as the body waits on work it started here.
#[derive(Clone)]
pub struct Scope {
    shared: Arc<EngineShared>,
    graph_id: String,
    next_op: Arc<AtomicUsize>,
    lease: Option<Arc<HeldLease>>,
}

/// Result of [`Scope::map_reduce`].
#[derive(Debug, Clone)]
pub struct MapReduceOutput {
    pub elements: Vec<TaskOutcome>,
    pub result: TaskOutcome,
}

impl Scope {
    pub(crate) fn new(shared: Arc<EngineShared>, graph_id: impl Into<String>) -> Self {
        Self {
            shared,
            graph_id: graph_id.into(),
            next_op: Arc::new(AtomicUsize::new(0)),
            lease: None,
        }
    }

    pub(crate) fn nested(
        shared: Arc<EngineShared>,
        parent: &TaskIdentity,
        lease: Arc<HeldLease>,
    ) -> Self {
        Self {
            lease: Some(lease),
            ..Self::new(shared, parent.key())
        }
    }

    pub fn graph_id(&self) -> &str {
        &self.graph_id
    }

    fn next_graph_id(&self, op: &str) -> String {
        let n = self.next_op.fetch_add(1, Ordering::SeqCst);
        format!("{}/{}-{}", self.graph_id, op, n)
    }

    async fn suspended<F: Future>(&self, fut: F) -> F::Output {
        match &self.lease {
            Some(lease) => lease.yielding(fut).await,
            None => fut.await,
        }
    }

    /// Builder for a graph nested in this scope.
    pub fn graph(&self) -> GraphBuilder {
        GraphBuilder::new(self.next_graph_id("graph"))
    }

    /// Run a graph built with [`Scope::graph`] and wait for it.
    pub async fn run(&self, graph: InvocationGraph) -> Result<GraphReport> {
        self.suspended(self.shared.execute(graph, None)).await
    }

    /// Start a task in the background and return a handle to it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn launch(&self, function: &FunctionRef, args: Value) -> TaskFuture {
        let graph_id = self.next_graph_id("launch");
        let node = node_id(function, "call");
        let identity = TaskIdentity::new(&graph_id, &node, None, &args);
        let (tx, rx) = watch::channel(TaskSnapshot::pending());
        let observer = Arc::new(tx);
        let handle = TaskFuture::new(identity, rx).with_lease(self.lease.clone());

        let graph = match GraphBuilder::new(graph_id)
            .call(node, function, args)
            .build()
        {
            Ok(graph) => graph,
            Err(e) => {
                future::abort(&observer, &e);
                return handle;
            }
        };

        let shared = self.shared.clone();
        tokio::spawn(async move {
            if let Err(e) = shared.execute(graph, Some(observer.clone())).await {
                future::abort(&observer, &e);
            }
        });
        handle
    }

    /// Apply `function` to every item. Results keep item order; a failed
    /// element does not affect the others.
    pub async fn map(&self, function: &FunctionRef, items: Vec<Value>) -> Result<Vec<TaskOutcome>> {
        let node = node_id(function, "map");
        let graph = GraphBuilder::new(self.next_graph_id("map"))
            .map(&node, function, items)
            .build()?;
        let report = self.suspended(self.shared.execute(graph, None)).await?;
        Ok(report
            .elements(&node)
            .into_iter()
            .cloned()
            .collect())
    }

    /// Left fold of `items` through `function`, starting from `initial`.
    pub async fn reduce(
        &self,
        function: &FunctionRef,
        items: Vec<Value>,
        initial: Value,
    ) -> Result<TaskOutcome> {
        let node = node_id(function, "reduce");
        let graph = GraphBuilder::new(self.next_graph_id("reduce"))
            .reduce(&node, function, items, initial)
            .build()?;
        let report = self.suspended(self.shared.execute(graph, None)).await?;
        Ok(node_outcome(&report, &node))
    }

    /// Map then fold, with each reduce step starting as soon as its mapped
    /// element and the previous step are done.
    pub async fn map_reduce(
        &self,
        mapper: &FunctionRef,
        items: Vec<Value>,
        reducer: &FunctionRef,
        initial: Value,
    ) -> Result<MapReduceOutput> {
        let graph = GraphBuilder::new(self.next_graph_id("map_reduce"))
            .map("map", mapper, items)
            .reduce_over("reduce", reducer, "map", initial)
            .build()?;
        let report = self.suspended(self.shared.execute(graph, None)).await?;
        Ok(MapReduceOutput {
            elements: report.elements("map").into_iter().cloned().collect(),
            result: node_outcome(&report, "reduce"),
        })
    }
}

/// Node id for the single node of a scope operation. Function names may
/// contain `/`, which node ids cannot.
fn node_id(function: &FunctionRef, op: &str) -> String {
    let name = function.name().replace('/', ":");
    if name.is_empty() {
        op.to_string()
    } else {
        name
    }
}

fn node_outcome(report: &GraphReport, node: &str) -> TaskOutcome {
    report.output(node).cloned().unwrap_or_else(|| {
        TaskOutcome::failure(weft_core::types::TaskFailure::invalid_input(format!(
            "node '{}' missing from report",
            node
        )))
    })
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("graph_id", &self.graph_id)
            .finish()
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("identity", &self.identity.short())
            .field("attempt", &self.attempt)
            .finish()
    }
}
