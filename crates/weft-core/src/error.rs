use thiserror::Error;

#[derive(Debug, Error)]
pub enum WeftError {
    // Graph construction errors
    #[error("Graph contains a cycle through node '{node}'")]
    GraphCycle { node: String },

    #[error("Node '{node}' depends on unknown node '{dependency}'")]
    UnknownDependency { node: String, dependency: String },

    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    #[error("Function not registered: {0}")]
    UnknownFunction(String),

    #[error("Resource request of '{function}' exceeds engine capacity: {detail}")]
    ResourceUnsatisfiable { function: String, detail: String },

    // Task errors
    #[error("Task timed out after {timeout_ms}ms")]
    TaskTimeout { timeout_ms: u64 },

    #[error("Task failed: {0}")]
    TaskRuntime(String),

    #[error("Task {task} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        task: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Task {task} skipped, dependency failed: {reason}")]
    DependencyFailed { task: String, reason: String },

    #[error("Task {task} received invalid input: {reason}")]
    InvalidInput { task: String, reason: String },

    // Durability errors
    #[error("Durable log write failed: {0}")]
    DurabilityWrite(String),

    #[error("Database error: {0}")]
    Database(String),

    // Scheduler errors
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WeftError {
    /// Shorthand for a function body signalling failure.
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::TaskRuntime(message.into())
    }

    /// Errors raised while an attempt runs. Only these are retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WeftError::TaskRuntime(_)
                | WeftError::TaskTimeout { .. }
                | WeftError::Json(_)
                | WeftError::Io(_)
        )
    }

    /// True for errors that reject a graph before any task runs.
    pub fn is_malformed_graph(&self) -> bool {
        matches!(
            self,
            WeftError::GraphCycle { .. }
                | WeftError::UnknownDependency { .. }
                | WeftError::InvalidGraph(_)
                | WeftError::UnknownFunction(_)
                | WeftError::ResourceUnsatisfiable { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, WeftError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(WeftError::runtime("boom").is_retryable());
        assert!(WeftError::TaskTimeout { timeout_ms: 10 }.is_retryable());
        assert!(!WeftError::DurabilityWrite("disk full".into()).is_retryable());
        assert!(!WeftError::GraphCycle { node: "a".into() }.is_retryable());
    }

    #[test]
    fn test_malformed_graph_classification() {
        assert!(WeftError::GraphCycle { node: "a".into() }.is_malformed_graph());
        assert!(WeftError::UnknownDependency {
            node: "a".into(),
            dependency: "b".into()
        }
        .is_malformed_graph());
        assert!(!WeftError::runtime("x").is_malformed_graph());
    }

    #[test]
    fn test_display() {
        let e = WeftError::RetriesExhausted {
            task: "g/n#ab".into(),
            attempts: 3,
            last_error: "boom".into(),
        };
        assert_eq!(e.to_string(), "Task g/n#ab failed after 3 attempts: boom");
    }
}
