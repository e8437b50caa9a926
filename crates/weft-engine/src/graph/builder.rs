use std::collections::{HashMap, HashSet, VecDeque};

use serde_json::Value;

use weft_core::error::{Result, WeftError};

use super::node::{GraphNode, NodeKind};
use crate::registry::FunctionRef;

/// Builder for an [`InvocationGraph`].
pub struct GraphBuilder {
    id: String,
    nodes: Vec<GraphNode>,
    outputs: Vec<String>,
}

impl GraphBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            nodes: vec![],
            outputs: vec![],
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Add a fully specified node.
    pub fn node(mut self, node: GraphNode) -> Self {
        self.nodes.push(node);
        self
    }

    /// A single call with literal input.
    pub fn call(self, id: impl Into<String>, function: &FunctionRef, input: Value) -> Self {
        self.node(GraphNode::call(id, function).with_input(input))
    }

    /// A single call consuming the outputs of `deps`.
    pub fn call_after(self, id: impl Into<String>, function: &FunctionRef, deps: &[&str]) -> Self {
        self.node(GraphNode::call(id, function).after_all(deps.iter().copied()))
    }

    /// A map over a literal sequence.
    pub fn map(self, id: impl Into<String>, function: &FunctionRef, items: Vec<Value>) -> Self {
        self.node(GraphNode::map(id, function).over(items))
    }

    /// A map over the output of another node. Chained maps run element-wise.
    pub fn map_over(self, id: impl Into<String>, function: &FunctionRef, source: &str) -> Self {
        self.node(GraphNode::map(id, function).after(source))
    }

    /// A reduce over a literal sequence.
    pub fn reduce(
        self,
        id: impl Into<String>,
        function: &FunctionRef,
        items: Vec<Value>,
        initial: Value,
    ) -> Self {
        self.node(GraphNode::reduce(id, function, initial).over(items))
    }

    /// A reduce over the output of another node.
    pub fn reduce_over(
        self,
        id: impl Into<String>,
        function: &FunctionRef,
        source: &str,
        initial: Value,
    ) -> Self {
        self.node(GraphNode::reduce(id, function, initial).after(source))
    }

    /// Mark a node as a graph output. Without explicit outputs, every node
    /// nothing depends on is an output.
    pub fn output(mut self, id: impl Into<String>) -> Self {
        self.outputs.push(id.into());
        self
    }

    /// Validate and freeze the graph.
    pub fn build(self) -> Result<InvocationGraph> {
        InvocationGraph::new(self.id, self.nodes, self.outputs)
    }
}

/// A validated, immutable invocation graph.
#[derive(Debug, Clone)]
pub struct InvocationGraph {
    id: String,
    nodes: Vec<GraphNode>,
    index: HashMap<String, usize>,
    order: Vec<usize>,
    outputs: Vec<usize>,
}

impl InvocationGraph {
    fn new(id: String, nodes: Vec<GraphNode>, outputs: Vec<String>) -> Result<Self> {
        if id.is_empty() {
            return Err(WeftError::InvalidGraph("graph id must not be empty".into()));
        }
        if nodes.is_empty() {
            return Err(WeftError::InvalidGraph(format!("graph '{}' has no nodes", id)));
        }

        let mut index = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            if node.id.is_empty() || node.id.contains('/') {
                return Err(WeftError::InvalidGraph(format!(
                    "invalid node id '{}'",
                    node.id
                )));
            }
            if index.insert(node.id.clone(), i).is_some() {
                return Err(WeftError::InvalidGraph(format!(
                    "duplicate node id '{}'",
                    node.id
                )));
            }
        }

        for node in &nodes {
            let mut seen = HashSet::new();
            for dep in &node.depends_on {
                if dep == &node.id {
                    return Err(WeftError::GraphCycle {
                        node: node.id.clone(),
                    });
                }
                if !index.contains_key(dep) {
                    return Err(WeftError::UnknownDependency {
                        node: node.id.clone(),
                        dependency: dep.clone(),
                    });
                }
                if !seen.insert(dep) {
                    return Err(WeftError::InvalidGraph(format!(
                        "node '{}' lists dependency '{}' twice",
                        node.id, dep
                    )));
                }
            }
            check_source(node)?;
        }

        let order = topological_order(&nodes, &index)?;

        let outputs = if outputs.is_empty() {
            let mut has_dependents = vec![false; nodes.len()];
            for node in &nodes {
                for dep in &node.depends_on {
                    has_dependents[index[dep]] = true;
                }
            }
            (0..nodes.len()).filter(|&i| !has_dependents[i]).collect()
        } else {
            let mut resolved = Vec::with_capacity(outputs.len());
            for out in &outputs {
                let i = *index.get(out).ok_or_else(|| {
                    WeftError::InvalidGraph(format!("output '{}' is not a node", out))
                })?;
                if !resolved.contains(&i) {
                    resolved.push(i);
                }
            }
            resolved
        };

        Ok(Self {
            id,
            nodes,
            index,
            order,
            outputs,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub(crate) fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Node positions in dependency order; ties keep declaration order.
    pub(crate) fn order(&self) -> &[usize] {
        &self.order
    }

    pub(crate) fn output_positions(&self) -> &[usize] {
        &self.outputs
    }

    /// Ids of the output nodes.
    pub fn outputs(&self) -> Vec<&str> {
        self.outputs
            .iter()
            .map(|&i| self.nodes[i].id.as_str())
            .collect()
    }
}

fn check_source(node: &GraphNode) -> Result<()> {
    if matches!(node.kind, NodeKind::Call) {
        return Ok(());
    }
    match node.depends_on.len() {
        0 if !node.input.is_array() => Err(WeftError::InvalidGraph(format!(
            "{} node '{}' needs an array input or a source node",
            node.kind.as_str(),
            node.id
        ))),
        0 | 1 => Ok(()),
        _ => Err(WeftError::InvalidGraph(format!(
            "{} node '{}' must have exactly one source",
            node.kind.as_str(),
            node.id
        ))),
    }
}

/// Kahn's algorithm over declaration order.
fn topological_order(nodes: &[GraphNode], index: &HashMap<String, usize>) -> Result<Vec<usize>> {
    let mut in_degree: Vec<usize> = nodes.iter().map(|n| n.depends_on.len()).collect();
    let mut dependents: Vec<Vec<usize>> = vec![vec![]; nodes.len()];
    for (i, node) in nodes.iter().enumerate() {
        for dep in &node.depends_on {
            dependents[index[dep]].push(i);
        }
    }

    let mut queue: VecDeque<usize> = (0..nodes.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(nodes.len());

    while let Some(i) = queue.pop_front() {
        order.push(i);
        for &next in &dependents[i] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    if order.len() < nodes.len() {
        let stuck = (0..nodes.len())
            .find(|&i| in_degree[i] > 0)
            .map(|i| nodes[i].id.clone())
            .unwrap_or_default();
        return Err(WeftError::GraphCycle { node: stuck });
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::task_fn;
    use serde_json::json;
    use std::sync::Arc;
    use weft_core::types::FunctionSpec;

    fn f(name: &str) -> FunctionRef {
        FunctionRef::new(
            FunctionSpec::new(name),
            Arc::new(task_fn(|input, _ctx| async move { Ok(input) })),
        )
    }

    #[test]
    fn test_linear_graph_order() {
        let step = f("step");
        let graph = GraphBuilder::new("g")
            .call_after("c", &step, &["b"])
            .call_after("b", &step, &["a"])
            .call("a", &step, json!(1))
            .build()
            .unwrap();

        let order: Vec<&str> = graph
            .order()
            .iter()
            .map(|&i| graph.nodes()[i].id.as_str())
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert_eq!(graph.outputs(), vec!["c"]);
    }

    #[test]
    fn test_cycle_rejected() {
        let step = f("step");
        let err = GraphBuilder::new("g")
            .call("root", &step, json!(null))
            .call_after("a", &step, &["root", "b"])
            .call_after("b", &step, &["a"])
            .build()
            .unwrap_err();
        match err {
            WeftError::GraphCycle { node } => assert!(node == "a" || node == "b"),
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_self_edge_is_cycle() {
        let step = f("step");
        let err = GraphBuilder::new("g")
            .call_after("a", &step, &["a"])
            .build()
            .unwrap_err();
        assert!(matches!(err, WeftError::GraphCycle { node } if node == "a"));
    }

    #[test]
    fn test_unknown_dependency() {
        let step = f("step");
        let err = GraphBuilder::new("g")
            .call_after("a", &step, &["ghost"])
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            WeftError::UnknownDependency { node, dependency } if node == "a" && dependency == "ghost"
        ));
    }

    #[test]
    fn test_duplicate_and_empty() {
        let step = f("step");
        let dup = GraphBuilder::new("g")
            .call("a", &step, json!(1))
            .call("a", &step, json!(2))
            .build();
        assert!(matches!(dup, Err(WeftError::InvalidGraph(_))));

        let empty = GraphBuilder::new("g").build();
        assert!(matches!(empty, Err(WeftError::InvalidGraph(_))));
    }

    #[test]
    fn test_map_source_rules() {
        let step = f("step");
        let literal = GraphBuilder::new("g")
            .node(GraphNode::map("m", &step).with_input(json!("not a list")))
            .build();
        assert!(matches!(literal, Err(WeftError::InvalidGraph(_))));

        let two_sources = GraphBuilder::new("g")
            .call("a", &step, json!([1]))
            .call("b", &step, json!([2]))
            .node(GraphNode::map("m", &step).after("a").after("b"))
            .build();
        assert!(matches!(two_sources, Err(WeftError::InvalidGraph(_))));

        let ok = GraphBuilder::new("g")
            .map("m", &step, vec![json!(1), json!(2)])
            .map_over("m2", &step, "m")
            .reduce_over("r", &step, "m2", json!(0))
            .build()
            .unwrap();
        assert_eq!(ok.outputs(), vec!["r"]);
    }

    #[test]
    fn test_explicit_outputs() {
        let step = f("step");
        let graph = GraphBuilder::new("g")
            .call("a", &step, json!(1))
            .call_after("b", &step, &["a"])
            .output("a")
            .output("b")
            .build()
            .unwrap();
        assert_eq!(graph.outputs(), vec!["a", "b"]);

        let bad = GraphBuilder::new("g")
            .call("a", &step, json!(1))
            .output("zzz")
            .build();
        assert!(matches!(bad, Err(WeftError::InvalidGraph(_))));
    }
}
