//! Durable execution of function graphs.
//!
//! Register functions with an [`Engine`], then either submit a static
//! [`InvocationGraph`] or launch work dynamically through a [`Scope`]. Every
//! terminal task outcome is written to the durable log before dependents run,
//! so resubmitting a graph under the same id replays recorded successes
//! instead of executing them again.

pub mod engine;
pub mod future;
pub mod graph;
pub mod registry;
pub mod report;
pub mod resources;
pub mod retry;
pub mod run_log;
mod scheduler;
pub mod scope;

pub use engine::{Engine, GraphHandle, InvocationResult, RunLogHandle};
pub use future::{wait, wait_timeout, ReturnWhen, TaskFuture, WaitSet};
pub use graph::{GraphBuilder, GraphNode, InvocationGraph, NodeKind};
pub use registry::{task_fn, FnTask, FunctionRef, FunctionRegistry, TaskFunction};
pub use report::{
    BranchReport, BranchStatus, FanoutReport, GraphReport, GraphStatus, NodeReport,
    OverallStatus, Summary, TaskReport,
};
pub use resources::{PoolUsage, ResourceLease, ResourcePool};
pub use run_log::RunLogger;
pub use scope::{MapReduceOutput, Scope, TaskContext};
