use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use weft_core::config::EngineConfig;
use weft_core::error::{Result, WeftError};
use weft_core::event::EventBus;
use weft_core::traits::DurableLog;
use weft_core::types::{DurableRecord, FunctionSpec, TaskOutcome};
use weft_store::MemoryLog;

use crate::future::Observer;
use crate::graph::{GraphBuilder, InvocationGraph};
use crate::registry::{FunctionRef, FunctionRegistry, TaskFunction};
use crate::report::GraphReport;
use crate::resources::{PoolUsage, ResourcePool};
use crate::run_log::RunLogger;
use crate::scheduler::GraphRun;
use crate::scope::Scope;

/// State shared by the engine, its scopes, and running graphs.
pub(crate) struct EngineShared {
    pub(crate) config: EngineConfig,
    pub(crate) log: Arc<dyn DurableLog>,
    pub(crate) pool: Arc<ResourcePool>,
    pub(crate) events: Arc<EventBus>,
    registry: RwLock<FunctionRegistry>,
}

impl EngineShared {
    /// Reject graphs containing a task no amount of waiting could place.
    fn check_capacity(&self, graph: &InvocationGraph) -> Result<()> {
        for node in graph.nodes() {
            let request = &node.function.spec().resources;
            if !self.pool.admits(request) {
                return Err(WeftError::ResourceUnsatisfiable {
                    function: node.function.name().to_string(),
                    detail: format!(
                        "node '{}' requests cpu={} memory_gb={} accelerators={}, capacity is cpu={} memory_gb={} accelerators={}",
                        node.id,
                        request.cpu,
                        request.memory_gb,
                        request.accelerators,
                        self.config.capacity.cpu,
                        self.config.capacity.memory_gb,
                        self.config.capacity.accelerators
                    ),
                });
            }
        }
        Ok(())
    }

    /// Run a graph to completion, optionally mirroring its first task into a
    /// future.
    pub(crate) async fn execute(
        self: &Arc<Self>,
        graph: InvocationGraph,
        observer: Option<Observer>,
    ) -> Result<GraphReport> {
        self.check_capacity(&graph)?;
        let mut run = GraphRun::new(self.clone(), graph);
        if let Some(observer) = observer {
            run = run.observe(0, 0, observer);
        }
        run.run().await
    }
}

/// The durable execution engine.
///
/// Owns the function registry, the durable log, the resource pool, and the
/// event bus. Cloning is cheap and yields a handle to the same engine.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<EngineShared>,
}

/// Handle to a submitted graph.
pub struct GraphHandle {
    graph_id: String,
    task: JoinHandle<Result<GraphReport>>,
}

impl GraphHandle {
    pub fn graph_id(&self) -> &str {
        &self.graph_id
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop dispatching and abort running tasks. Recorded outcomes stay
    /// recorded; resubmitting the graph resumes from them.
    pub fn abort(&self) {
        self.task.abort();
    }

    /// Wait for the graph to finish.
    pub async fn join(self) -> Result<GraphReport> {
        match self.task.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(WeftError::Scheduler(format!(
                "graph '{}' was aborted",
                self.graph_id
            ))),
            Err(e) => Err(WeftError::Scheduler(format!(
                "graph '{}' panicked: {}",
                self.graph_id, e
            ))),
        }
    }
}

/// Result of [`Engine::invoke`].
#[derive(Debug, Clone)]
pub struct InvocationResult {
    pub outcome: TaskOutcome,
    pub report: GraphReport,
}

/// Background JSONL logger for one graph.
pub struct RunLogHandle {
    pub cancel: CancellationToken,
    pub task: JoinHandle<()>,
}

impl RunLogHandle {
    /// Stop logging and wait for the file to be flushed.
    pub async fn finish(self) {
        self.cancel.cancel();
        self.task.await.ok();
    }
}

impl Engine {
    pub fn new(config: EngineConfig, log: Arc<dyn DurableLog>) -> Self {
        let pool = Arc::new(ResourcePool::new(
            &config.capacity,
            config.engine.max_concurrent_tasks,
        ));
        let events = Arc::new(EventBus::new(config.engine.event_capacity));
        Self {
            shared: Arc::new(EngineShared {
                config,
                log,
                pool,
                events,
                registry: RwLock::new(FunctionRegistry::new()),
            }),
        }
    }

    /// Engine with the durable log selected by `config.durability`.
    pub fn open(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let log = weft_store::open_log(&config.durability)?;
        Ok(Self::new(config, log))
    }

    /// Engine with default settings and an in-memory log.
    pub fn in_memory() -> Self {
        Self::new(EngineConfig::default(), Arc::new(MemoryLog::new()))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.shared.events.clone()
    }

    pub fn log(&self) -> Arc<dyn DurableLog> {
        self.shared.log.clone()
    }

    pub fn resource_usage(&self) -> PoolUsage {
        self.shared.pool.usage()
    }

    /// Register a function. Unset backoff settings take the `[retry]`
    /// defaults; the resulting policy is fixed for the function's lifetime.
    pub fn register(&self, spec: FunctionSpec, body: impl TaskFunction) -> FunctionRef {
        let spec = FunctionSpec {
            retry: self.shared.config.retry.apply(spec.retry.clone()),
            ..spec
        };
        info!(
            function = %spec.name,
            max_retries = spec.retry.max_retries,
            timeout_ms = spec.timeout.map(|t| t.as_millis() as u64),
            "Function registered"
        );
        self.shared
            .registry
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .register(spec, Arc::new(body))
    }

    pub fn function(&self, name: &str) -> Result<FunctionRef> {
        self.shared
            .registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .ok_or_else(|| WeftError::UnknownFunction(name.to_string()))
    }

    pub fn functions(&self) -> Vec<String> {
        self.shared
            .registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .list()
    }

    /// Root scope for dynamic work under `graph_id`.
    pub fn scope(&self, graph_id: impl Into<String>) -> Scope {
        Scope::new(self.shared.clone(), graph_id)
    }

    pub fn graph(&self, graph_id: impl Into<String>) -> GraphBuilder {
        GraphBuilder::new(graph_id)
    }

    /// Start a graph in the background.
    ///
    /// Fails immediately, before any task runs, if a node requests more
    /// resources than the engine has.
    pub fn submit(&self, graph: InvocationGraph) -> Result<GraphHandle> {
        self.shared.check_capacity(&graph)?;
        let graph_id = graph.id().to_string();
        info!(graph_id = %graph_id, nodes = graph.len(), "Graph submitted");
        let shared = self.shared.clone();
        let task = tokio::spawn(async move { shared.execute(graph, None).await });
        Ok(GraphHandle { graph_id, task })
    }

    /// Run a graph and wait for its report.
    pub async fn run(&self, graph: InvocationGraph) -> Result<GraphReport> {
        self.submit(graph)?.join().await
    }

    /// Run a single function as the root of `graph_id`.
    pub async fn invoke(
        &self,
        graph_id: impl Into<String>,
        function: &FunctionRef,
        input: Value,
    ) -> Result<InvocationResult> {
        let graph = GraphBuilder::new(graph_id)
            .call(function.name(), function, input)
            .build()?;
        let report = self.run(graph).await?;
        let outcome = report
            .output(function.name())
            .cloned()
            .ok_or_else(|| WeftError::Scheduler("root task missing from report".into()))?;
        Ok(InvocationResult { outcome, report })
    }

    /// Recorded outcomes of a graph and everything nested under it.
    pub async fn records(&self, graph_id: &str) -> Result<Vec<DurableRecord>> {
        self.shared.log.records(graph_id).await
    }

    /// Forget a graph, so the next submission runs from scratch.
    pub async fn purge(&self, graph_id: &str) -> Result<usize> {
        let removed = self.shared.log.purge(graph_id).await?;
        info!(graph_id, removed, "Purged durable records");
        Ok(removed)
    }

    /// Start the JSONL run logger for `graph_id`, if `[log]` is enabled.
    pub fn start_run_log(&self, graph_id: &str) -> Option<RunLogHandle> {
        let log = self.shared.config.log.as_ref().filter(|l| l.enabled)?;
        let logger = RunLogger::new(log.dir(), log.level);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(logger.run(
            self.shared.events.clone(),
            graph_id.to_string(),
            cancel.clone(),
        ));
        Some(RunLogHandle { cancel, task })
    }

    /// Directory the run logger writes to, if enabled.
    pub fn run_log_dir(&self) -> Option<PathBuf> {
        self.shared
            .config
            .log
            .as_ref()
            .filter(|l| l.enabled)
            .map(|l| l.dir())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::task_fn;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use weft_core::types::{FailureKind, ResourceRequest, TaskState};

    fn double(engine: &Engine) -> FunctionRef {
        engine.register(
            FunctionSpec::new("double"),
            task_fn(|input, _ctx| async move {
                let n = input
                    .as_i64()
                    .ok_or_else(|| WeftError::runtime("expected a number"))?;
                Ok(json!(n * 2))
            }),
        )
    }

    #[tokio::test]
    async fn test_invoke_single_function() {
        let engine = Engine::in_memory();
        let f = double(&engine);
        let result = engine.invoke("g", &f, json!(21)).await.unwrap();
        assert_eq!(result.outcome.value(), Some(&json!(42)));
        assert_eq!(result.report.executed(), 1);
    }

    #[tokio::test]
    async fn test_call_chain_and_fan_in() {
        let engine = Engine::in_memory();
        let f = double(&engine);
        let sum = engine.register(
            FunctionSpec::new("sum"),
            task_fn(|input, _ctx| async move {
                let total: i64 = input
                    .as_object()
                    .map(|m| m.values().filter_map(|v| v.as_i64()).sum())
                    .unwrap_or(0);
                Ok(json!(total))
            }),
        );

        let graph = GraphBuilder::new("chain")
            .call("a", &f, json!(1))
            .call_after("b", &f, &["a"])
            .call("c", &f, json!(10))
            .call_after("total", &sum, &["b", "c"])
            .build()
            .unwrap();
        let report = engine.run(graph).await.unwrap();

        assert!(report.is_success());
        assert_eq!(report.output("b").unwrap().value(), Some(&json!(4)));
        assert_eq!(report.output("total").unwrap().value(), Some(&json!(24)));
    }

    #[tokio::test]
    async fn test_map_failure_is_isolated() {
        let engine = Engine::in_memory();
        let f = double(&engine);
        let graph = GraphBuilder::new("m")
            .map("d", &f, vec![json!(1), json!("x"), json!(3)])
            .map_over("dd", &f, "d")
            .build()
            .unwrap();
        let report = engine.run(graph).await.unwrap();

        let first: Vec<&TaskOutcome> = report.elements("d");
        assert_eq!(first[0].value(), Some(&json!(2)));
        assert!(!first[1].is_success());
        assert_eq!(first[2].value(), Some(&json!(6)));

        let second = report.elements("dd");
        assert_eq!(second[0].value(), Some(&json!(4)));
        match second[1] {
            TaskOutcome::Failed { failure } => {
                assert_eq!(failure.kind, FailureKind::DependencyFailed)
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(second[2].value(), Some(&json!(12)));
        assert_eq!(report.status, crate::report::GraphStatus::Failed);
        assert_eq!(report.summary().failed, 1);
    }

    #[tokio::test]
    async fn test_map_and_reduce_over_call_output() {
        let engine = Engine::in_memory();
        let f = double(&engine);
        let range = engine.register(
            FunctionSpec::new("range"),
            task_fn(|input, _ctx| async move {
                let n = input.as_i64().unwrap_or(0);
                Ok(json!((1..=n).collect::<Vec<_>>()))
            }),
        );
        let add = engine.register(
            FunctionSpec::new("add"),
            task_fn(|input, _ctx| async move {
                Ok(json!(input["acc"].as_i64().unwrap_or(0) + input["item"].as_i64().unwrap_or(0)))
            }),
        );
        let graph = GraphBuilder::new("seq")
            .call("r", &range, json!(5))
            .map_over("d", &f, "r")
            .reduce_over("sum", &add, "r", json!(0))
            .build()
            .unwrap();
        let report = engine.run(graph).await.unwrap();

        assert!(report.is_success());
        assert_eq!(report.output("d").unwrap().value(), Some(&json!([2, 4, 6, 8, 10])));
        assert_eq!(report.output("sum").unwrap().value(), Some(&json!(15)));
        assert_eq!(report.executed(), 1 + 5 + 5);
    }

    #[tokio::test]
    async fn test_reduce_is_left_fold() {
        let engine = Engine::in_memory();
        let concat = engine.register(
            FunctionSpec::new("concat"),
            task_fn(|input, _ctx| async move {
                let acc = input["acc"].as_str().unwrap_or_default().to_string();
                let item = input["item"].as_str().unwrap_or_default();
                Ok(json!(format!("{}{}", acc, item)))
            }),
        );
        let scope = engine.scope("fold");
        let outcome = scope
            .reduce(
                &concat,
                vec![json!("a"), json!("b"), json!("c")],
                json!(">"),
            )
            .await
            .unwrap();
        assert_eq!(outcome.value(), Some(&json!(">abc")));

        let empty = scope.reduce(&concat, vec![], json!("init")).await.unwrap();
        assert_eq!(empty.value(), Some(&json!("init")));
    }

    #[tokio::test]
    async fn test_oversized_request_rejected_at_submit() {
        let engine = Engine::in_memory();
        let big = engine.register(
            FunctionSpec::new("big").with_resources(ResourceRequest::new(1_000.0, 1.0)),
            task_fn(|input, _ctx| async move { Ok(input) }),
        );
        let graph = GraphBuilder::new("g").call("a", &big, json!(1)).build().unwrap();
        let err = engine.submit(graph).err().unwrap();
        assert!(matches!(err, WeftError::ResourceUnsatisfiable { .. }));

        let future = engine.scope("s").launch(&big, json!(1));
        let failure = future.result().await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::ResourceUnsatisfiable);
        assert_eq!(future.state(), TaskState::Failed);
    }

    #[tokio::test]
    async fn test_resubmission_replays_successes() {
        let engine = Engine::in_memory();
        let calls = Arc::new(AtomicU32::new(0));
        let counted = {
            let calls = calls.clone();
            engine.register(
                FunctionSpec::new("counted"),
                task_fn(move |input, _ctx| {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(input)
                    }
                }),
            )
        };
        let build = || {
            GraphBuilder::new("replay")
                .map("m", &counted, vec![json!(1), json!(2), json!(3)])
                .build()
                .unwrap()
        };

        let first = engine.run(build()).await.unwrap();
        assert_eq!(first.executed(), 3);
        let second = engine.run(build()).await.unwrap();
        assert_eq!(second.replayed(), 3);
        assert_eq!(second.executed(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        assert_eq!(engine.records("replay").await.unwrap().len(), 3);
        assert_eq!(engine.purge("replay").await.unwrap(), 3);
        engine.run(build()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_nested_launch_from_body() {
        let engine = Engine::in_memory();
        let f = double(&engine);
        let parent = {
            let f = f.clone();
            engine.register(
                FunctionSpec::new("parent").with_resources(ResourceRequest::none()),
                task_fn(move |input, ctx| {
                    let f = f.clone();
                    async move {
                        let a = ctx.scope().launch(&f, input.clone());
                        let b = ctx.scope().launch(&f, json!(100));
                        let a = a.result().await.map_err(|e| WeftError::runtime(e.message))?;
                        let b = b.result().await.map_err(|e| WeftError::runtime(e.message))?;
                        Ok(json!([a, b]))
                    }
                }),
            )
        };

        let result = engine.invoke("nest", &parent, json!(4)).await.unwrap();
        assert_eq!(result.outcome.value(), Some(&json!([8, 200])));
        // parent plus two children
        assert_eq!(engine.records("nest").await.unwrap().len(), 3);
    }

    fn small_engine(max_tasks: usize, cpu: f64) -> Engine {
        let mut config = EngineConfig::default();
        config.engine.max_concurrent_tasks = max_tasks;
        config.capacity.cpu = cpu;
        config.capacity.memory_gb = cpu;
        Engine::new(config, Arc::new(MemoryLog::new()))
    }

    #[tokio::test]
    async fn test_waiting_parents_free_their_slots() {
        let engine = small_engine(2, 2.0);
        let f = double(&engine);
        let parent = {
            let f = f.clone();
            engine.register(
                FunctionSpec::new("parent").with_resources(ResourceRequest::none()),
                task_fn(move |input, ctx| {
                    let f = f.clone();
                    async move {
                        ctx.scope()
                            .launch(&f, input)
                            .result()
                            .await
                            .map_err(|e| WeftError::runtime(e.message))
                    }
                }),
            )
        };

        // more parents than task slots, each waiting on a child
        let outcomes = tokio::time::timeout(
            Duration::from_secs(5),
            engine.scope("slots").map(&parent, vec![json!(1), json!(2), json!(3)]),
        )
        .await
        .expect("parents waiting on children must not starve them")
        .unwrap();

        let values: Vec<_> = outcomes.iter().map(|o| o.value().cloned()).collect();
        assert_eq!(values, vec![Some(json!(2)), Some(json!(4)), Some(json!(6))]);
        assert_eq!(engine.resource_usage().tasks, 0);
    }

    #[tokio::test]
    async fn test_parent_holding_full_capacity_runs_nested_map() {
        let engine = small_engine(4, 2.0);
        let f = double(&engine);
        let parent = {
            let f = f.clone();
            engine.register(
                FunctionSpec::new("greedy").with_resources(ResourceRequest::new(2.0, 2.0)),
                task_fn(move |input, ctx| {
                    let f = f.clone();
                    async move {
                        let items = input.as_array().cloned().unwrap_or_default();
                        let outcomes = ctx.scope().map(&f, items).await?;
                        Ok(json!(outcomes.iter().filter_map(|o| o.value()).collect::<Vec<_>>()))
                    }
                }),
            )
        };

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            engine.invoke("greedy", &parent, json!([1, 2, 3])),
        )
        .await
        .expect("nested map must run while the parent waits")
        .unwrap();
        assert_eq!(result.outcome.value(), Some(&json!([2, 4, 6])));
        assert_eq!(engine.resource_usage().cpu, 0.0);
    }

    #[tokio::test]
    async fn test_slash_in_function_name() {
        let engine = Engine::in_memory();
        let f = engine.register(
            FunctionSpec::new("math/double"),
            task_fn(|input, _ctx| async move { Ok(json!(input.as_i64().unwrap_or(0) * 2)) }),
        );
        let scope = engine.scope("names");

        let launched = scope.launch(&f, json!(5));
        assert_eq!(launched.result().await.unwrap(), json!(10));
        assert_eq!(launched.identity().node_id, "math:double");

        let mapped = scope.map(&f, vec![json!(1), json!(2)]).await.unwrap();
        assert_eq!(mapped[1].value(), Some(&json!(4)));
        let folded = scope.reduce(&f, vec![json!(1)], json!(3)).await.unwrap();
        assert!(folded.is_success());
    }

    #[tokio::test]
    async fn test_handle_join() {
        let engine = Engine::in_memory();
        let slow = engine.register(
            FunctionSpec::new("slow"),
            task_fn(|input, _ctx| async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok(input)
            }),
        );
        let graph = GraphBuilder::new("h").call("s", &slow, json!(1)).build().unwrap();
        let handle = engine.submit(graph).unwrap();
        assert_eq!(handle.graph_id(), "h");
        let report = handle.join().await.unwrap();
        assert!(report.is_success());
        assert_eq!(engine.resource_usage().tasks, 0);
    }

    #[test]
    fn test_unknown_function() {
        let engine = Engine::in_memory();
        assert!(matches!(
            engine.function("nope"),
            Err(WeftError::UnknownFunction(_))
        ));
        double(&engine);
        assert_eq!(engine.functions(), vec!["double"]);
    }
}
