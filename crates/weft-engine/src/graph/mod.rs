//! Invocation graphs: static DAGs of function calls, maps, and reduces.
//!
//! A graph is built with [`GraphBuilder`], validated once in
//! [`GraphBuilder::build`], and then handed to the engine. Validation rejects
//! cycles, dangling dependencies, duplicate ids, and map/reduce nodes without
//! a usable source before any task runs.

pub mod builder;
pub mod node;

pub use builder::{GraphBuilder, InvocationGraph};
pub use node::{GraphNode, NodeKind};
