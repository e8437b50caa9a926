use serde_json::Value;

use crate::registry::FunctionRef;

/// How a node turns its input into tasks.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// One task.
    Call,
    /// One task per element of the source sequence.
    Map,
    /// A left fold: step `i` receives `{"acc": .., "item": ..}` where `acc`
    /// is the output of step `i - 1` (or `initial` for the first step).
    Reduce { initial: Value },
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Call => "call",
            NodeKind::Map => "map",
            NodeKind::Reduce { .. } => "reduce",
        }
    }
}

/// A node in an invocation graph.
///
/// Input resolution:
/// - no dependencies: `input` is passed as-is (for map/reduce it must be an
///   array, one element per task);
/// - one dependency: that node's output;
/// - several dependencies (calls only): an object keyed by dependency id.
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub id: String,
    pub function: FunctionRef,
    pub kind: NodeKind,
    pub depends_on: Vec<String>,
    pub input: Value,
}

impl GraphNode {
    pub fn call(id: impl Into<String>, function: &FunctionRef) -> Self {
        Self::with_kind(id, function, NodeKind::Call)
    }

    pub fn map(id: impl Into<String>, function: &FunctionRef) -> Self {
        Self::with_kind(id, function, NodeKind::Map)
    }

    pub fn reduce(id: impl Into<String>, function: &FunctionRef, initial: Value) -> Self {
        Self::with_kind(id, function, NodeKind::Reduce { initial })
    }

    fn with_kind(id: impl Into<String>, function: &FunctionRef, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            function: function.clone(),
            kind,
            depends_on: vec![],
            input: Value::Null,
        }
    }

    /// Literal input, used when the node has no dependencies.
    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    /// Literal sequence for a source map/reduce.
    pub fn over(self, items: Vec<Value>) -> Self {
        self.with_input(Value::Array(items))
    }

    pub fn after(mut self, dependency: impl Into<String>) -> Self {
        self.depends_on.push(dependency.into());
        self
    }

    pub fn after_all<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on
            .extend(dependencies.into_iter().map(Into::into));
        self
    }

    pub fn is_map(&self) -> bool {
        matches!(self.kind, NodeKind::Map)
    }
}
