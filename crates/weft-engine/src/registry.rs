use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use weft_core::error::Result;
use weft_core::types::FunctionSpec;

use crate::scope::TaskContext;

/// Body of a registered function.
///
/// Receives the resolved task input and a context carrying the task identity,
/// the attempt number, and a [`crate::Scope`] for launching nested work.
pub trait TaskFunction: Send + Sync + 'static {
    fn execute(&self, input: Value, ctx: TaskContext) -> BoxFuture<'_, Result<Value>>;
}

/// Adapter turning an async closure into a [`TaskFunction`].
pub struct FnTask<F>(F);

/// Wrap an async closure as a task function.
pub fn task_fn<F, Fut>(f: F) -> FnTask<F>
where
    F: Fn(Value, TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    FnTask(f)
}

impl<F, Fut> TaskFunction for FnTask<F>
where
    F: Fn(Value, TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    fn execute(&self, input: Value, ctx: TaskContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin((self.0)(input, ctx))
    }
}

struct Registered {
    spec: FunctionSpec,
    body: Arc<dyn TaskFunction>,
}

/// Handle to a registered function.
///
/// Cheap to clone. Graph nodes and scope operations take a `FunctionRef`
/// rather than a name, so a graph can only reference functions that exist.
#[derive(Clone)]
pub struct FunctionRef {
    inner: Arc<Registered>,
}

impl FunctionRef {
    pub(crate) fn new(spec: FunctionSpec, body: Arc<dyn TaskFunction>) -> Self {
        Self {
            inner: Arc::new(Registered { spec, body }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.spec.name
    }

    pub fn spec(&self) -> &FunctionSpec {
        &self.inner.spec
    }

    pub(crate) fn body(&self) -> Arc<dyn TaskFunction> {
        self.inner.body.clone()
    }
}

impl fmt::Debug for FunctionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRef")
            .field("spec", &self.inner.spec)
            .finish()
    }
}

/// Registry of functions known to an engine.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, FunctionRef>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function. A later registration under the same name
    /// replaces the earlier one for new graphs; existing refs keep theirs.
    pub fn register(&mut self, spec: FunctionSpec, body: Arc<dyn TaskFunction>) -> FunctionRef {
        let function = FunctionRef::new(spec, body);
        self.functions
            .insert(function.name().to_string(), function.clone());
        function
    }

    pub fn get(&self, name: &str) -> Option<FunctionRef> {
        self.functions.get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo() -> Arc<dyn TaskFunction> {
        Arc::new(task_fn(|input, _ctx| async move { Ok(input) }))
    }

    #[test]
    fn test_register_and_get() {
        let mut registry = FunctionRegistry::new();
        let f = registry.register(FunctionSpec::new("echo").with_retries(2), echo());
        assert_eq!(f.name(), "echo");
        assert_eq!(f.spec().retry.max_retries, 2);

        let fetched = registry.get("echo").unwrap();
        assert_eq!(fetched.spec(), f.spec());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_reregister_keeps_existing_refs() {
        let mut registry = FunctionRegistry::new();
        let first = registry.register(FunctionSpec::new("f").with_retries(1), echo());
        registry.register(FunctionSpec::new("f").with_retries(5), echo());

        assert_eq!(first.spec().retry.max_retries, 1);
        assert_eq!(registry.get("f").unwrap().spec().retry.max_retries, 5);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_list_sorted() {
        let mut registry = FunctionRegistry::new();
        registry.register(FunctionSpec::new("parse"), echo());
        registry.register(FunctionSpec::new("download"), echo());
        assert_eq!(registry.list(), vec!["download", "parse"]);
    }
}
