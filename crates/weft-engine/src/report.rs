use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use weft_core::types::TaskOutcome;

use crate::future::TaskFuture;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphStatus {
    /// Every output node produced a value.
    Succeeded,
    /// At least one output node failed.
    Failed,
}

impl std::fmt::Display for GraphStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GraphStatus::Succeeded => write!(f, "succeeded"),
            GraphStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Terminal state of one task slot.
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    /// Durable key; `None` for tasks skipped because an input failed.
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub map_index: Option<usize>,
    pub outcome: TaskOutcome,
    pub attempts: u32,
    /// Outcome came from the durable log instead of running.
    pub replayed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    pub node_id: String,
    pub function: String,
    pub kind: String,
    pub output: bool,
    /// Value of the node as a whole: call value, ordered map results, or
    /// final accumulator.
    pub outcome: TaskOutcome,
    pub tasks: Vec<TaskReport>,
}

/// Counts over the branches of a result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
}

/// Result of a completed graph run. Every task of every node is listed,
/// including failed and skipped ones.
#[derive(Debug, Clone, Serialize)]
pub struct GraphReport {
    pub graph_id: String,
    pub status: GraphStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub nodes: Vec<NodeReport>,
}

impl GraphReport {
    pub fn node(&self, id: &str) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| n.node_id == id)
    }

    /// Outcome of a node as a whole.
    pub fn output(&self, id: &str) -> Option<&TaskOutcome> {
        self.node(id).map(|n| &n.outcome)
    }

    /// Per-element outcomes of a map or reduce node, in index order.
    pub fn elements(&self, id: &str) -> Vec<&TaskOutcome> {
        self.node(id)
            .map(|n| n.tasks.iter().map(|t| &t.outcome).collect())
            .unwrap_or_default()
    }

    pub fn is_success(&self) -> bool {
        self.status == GraphStatus::Succeeded
    }

    /// Branch counts over the output nodes. Each task of an output node is a
    /// branch; an output node that failed before producing tasks counts once.
    pub fn summary(&self) -> Summary {
        let mut summary = Summary::default();
        for node in self.nodes.iter().filter(|n| n.output) {
            if node.tasks.is_empty() {
                if !node.outcome.is_success() {
                    summary.total += 1;
                    summary.failed += 1;
                }
                continue;
            }
            for task in &node.tasks {
                summary.total += 1;
                if task.outcome.is_success() {
                    summary.successful += 1;
                } else {
                    summary.failed += 1;
                }
            }
        }
        summary
    }

    /// Tasks whose body ran during this submission.
    pub fn executed(&self) -> usize {
        self.tasks()
            .filter(|t| !t.replayed && t.key.is_some())
            .count()
    }

    /// Tasks answered from the durable log.
    pub fn replayed(&self) -> usize {
        self.tasks().filter(|t| t.replayed).count()
    }

    pub fn tasks(&self) -> impl Iterator<Item = &TaskReport> {
        self.nodes.iter().flat_map(|n| n.tasks.iter())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Success,
    Partial,
    Failed,
}

impl OverallStatus {
    pub fn from_summary(summary: &Summary) -> Self {
        if summary.failed == 0 {
            OverallStatus::Success
        } else if summary.successful > 0 {
            OverallStatus::Partial
        } else {
            OverallStatus::Failed
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BranchReport {
    pub status: BranchStatus,
    pub timestamp: DateTime<Utc>,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregate of named, independently launched branches.
#[derive(Debug, Clone, Serialize)]
pub struct FanoutReport {
    pub overall_status: OverallStatus,
    pub completed_at: DateTime<Utc>,
    pub branches: BTreeMap<String, BranchReport>,
    pub summary: Summary,
}

impl FanoutReport {
    /// Build from the current state of each branch. Call after waiting; a
    /// branch that is not terminal yet counts as a failure.
    pub fn collect<'a, I>(branches: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a TaskFuture)>,
    {
        let now = Utc::now();
        let mut summary = Summary::default();
        let mut reports = BTreeMap::new();

        for (name, future) in branches {
            let snapshot = future.snapshot();
            let timestamp = snapshot.finished_at.unwrap_or(now);
            let report = match snapshot.outcome {
                Some(TaskOutcome::Succeeded { value }) => BranchReport {
                    status: BranchStatus::Success,
                    timestamp,
                    attempts: snapshot.attempts,
                    output: Some(value),
                    error: None,
                },
                Some(TaskOutcome::Failed { failure }) => BranchReport {
                    status: BranchStatus::Failure,
                    timestamp,
                    attempts: snapshot.attempts,
                    output: None,
                    error: Some(failure.message),
                },
                None => BranchReport {
                    status: BranchStatus::Failure,
                    timestamp,
                    attempts: snapshot.attempts,
                    output: None,
                    error: Some(format!("branch still {}", snapshot.state)),
                },
            };
            summary.total += 1;
            match report.status {
                BranchStatus::Success => summary.successful += 1,
                BranchStatus::Failure => summary.failed += 1,
            }
            reports.insert(name.to_string(), report);
        }

        Self {
            overall_status: OverallStatus::from_summary(&summary),
            completed_at: now,
            branches: reports,
            summary,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::types::{FailureKind, TaskFailure};
    use serde_json::json;

    fn task(index: usize, outcome: TaskOutcome, replayed: bool) -> TaskReport {
        TaskReport {
            key: Some(format!("g/m[{}]#h", index)),
            map_index: Some(index),
            outcome,
            attempts: 1,
            replayed,
        }
    }

    fn report() -> GraphReport {
        let failed = TaskOutcome::failure(TaskFailure::new(FailureKind::RetriesExhausted, "x", 3));
        GraphReport {
            graph_id: "g".into(),
            status: GraphStatus::Failed,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            nodes: vec![NodeReport {
                node_id: "m".into(),
                function: "f".into(),
                kind: "map".into(),
                output: true,
                outcome: failed.clone(),
                tasks: vec![
                    task(0, TaskOutcome::success(json!(1)), true),
                    task(1, failed, false),
                    task(2, TaskOutcome::success(json!(3)), false),
                ],
            }],
        }
    }

    #[test]
    fn test_summary_counts_branches() {
        let report = report();
        assert_eq!(
            report.summary(),
            Summary {
                total: 3,
                successful: 2,
                failed: 1
            }
        );
        assert_eq!(report.executed(), 2);
        assert_eq!(report.replayed(), 1);
        assert_eq!(report.elements("m").len(), 3);
        assert!(report.elements("nope").is_empty());
    }

    #[test]
    fn test_overall_status() {
        let s = |successful, failed| Summary {
            total: successful + failed,
            successful,
            failed,
        };
        assert_eq!(OverallStatus::from_summary(&s(4, 0)), OverallStatus::Success);
        assert_eq!(OverallStatus::from_summary(&s(3, 1)), OverallStatus::Partial);
        assert_eq!(OverallStatus::from_summary(&s(0, 4)), OverallStatus::Failed);
    }

    #[test]
    fn test_report_serializes_statuses() {
        let text = serde_json::to_string(&report()).unwrap();
        assert!(text.contains(r#""status":"failed""#));
        assert!(text.contains(r#""kind":"map""#));
    }
}
