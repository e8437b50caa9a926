use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use weft_core::event::EventBus;
use weft_core::types::EngineEvent;

/// JSONL run logger.
///
/// Subscribes to the EventBus and appends one JSON object per line for the
/// events of one graph and the graphs nested under it. Lines are flushed as
/// they are written, so a crash loses at most the line in flight.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    graph_id: String,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    task: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    attempt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl LogEntry {
    fn new(graph_id: &str, event_type: &'static str) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            graph_id: graph_id.to_string(),
            event_type,
            task: None,
            attempt: None,
            detail: None,
        }
    }

    fn task(mut self, key: String) -> Self {
        self.task = Some(key);
        self
    }

    fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    fn detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

impl RunLogger {
    /// Logs go to `{log_dir}/{graph_id}/{timestamp}.jsonl`.
    /// `level`: 1 = graph summary, 2 = terminal task events, 3 = every attempt.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Run until cancelled or until `graph_id` completes.
    pub async fn run(self, event_bus: Arc<EventBus>, graph_id: String, cancel: CancellationToken) {
        let graph_dir = self.log_dir.join(dir_name(&graph_id));
        if let Err(e) = tokio::fs::create_dir_all(&graph_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = graph_dir.join(format!("{}.jsonl", timestamp));

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return;
            }
        };

        info!(path = %log_path.display(), "RunLogger started");

        let mut writer = tokio::io::BufWriter::new(file);
        let mut rx = event_bus.subscribe();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            if !belongs_to(event.graph_id(), &graph_id) {
                                continue;
                            }
                            let Some(entry) = self.event_to_entry(&graph_id, &event) else {
                                continue;
                            };

                            if let Ok(json) = serde_json::to_string(&entry) {
                                let line = format!("{}\n", json);
                                if let Err(e) = writer.write_all(line.as_bytes()).await {
                                    error!(error = %e, "Failed to write log entry");
                                    break;
                                }
                                if let Err(e) = writer.flush().await {
                                    error!(error = %e, "Failed to flush log");
                                }
                            }

                            if matches!(&event, EngineEvent::GraphCompleted { graph_id: done, .. } if *done == graph_id) {
                                break;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
    }

    /// Convert an event to a log entry, or `None` if filtered by level.
    fn event_to_entry(&self, root: &str, event: &EngineEvent) -> Option<LogEntry> {
        match event {
            // L1: the root graph's lifecycle; nested graphs at L2
            EngineEvent::GraphSubmitted { graph_id, nodes }
                if graph_id == root || self.level >= 2 =>
            {
                Some(LogEntry::new(graph_id, "graph_submitted").detail(serde_json::json!({
                    "nodes": nodes,
                })))
            }
            EngineEvent::GraphCompleted {
                graph_id,
                succeeded,
                elapsed_ms,
            } if graph_id == root || self.level >= 2 => {
                Some(LogEntry::new(graph_id, "graph_completed").detail(serde_json::json!({
                    "succeeded": succeeded,
                    "elapsed_ms": elapsed_ms,
                })))
            }

            // L2: terminal task events
            EngineEvent::TaskSucceeded {
                identity,
                attempts,
                elapsed_ms,
            } if self.level >= 2 => Some(
                LogEntry::new(&identity.graph_id, "task_succeeded")
                    .task(identity.key())
                    .attempt(*attempts)
                    .detail(serde_json::json!({ "elapsed_ms": elapsed_ms })),
            ),
            EngineEvent::TaskFailed { identity, failure } if self.level >= 2 => Some(
                LogEntry::new(&identity.graph_id, "task_failed")
                    .task(identity.key())
                    .attempt(failure.attempts)
                    .detail(serde_json::json!({
                        "kind": failure.kind,
                        "error": truncate_str(&failure.message, 500),
                    })),
            ),
            EngineEvent::TaskReplayed { identity } if self.level >= 2 => Some(
                LogEntry::new(&identity.graph_id, "task_replayed").task(identity.key()),
            ),

            // L3: every attempt
            EngineEvent::TaskStarted { identity, attempt } if self.level >= 3 => Some(
                LogEntry::new(&identity.graph_id, "task_started")
                    .task(identity.key())
                    .attempt(*attempt),
            ),
            EngineEvent::TaskAttemptFailed {
                identity,
                attempt,
                error,
                timed_out,
            } if self.level >= 3 => Some(
                LogEntry::new(&identity.graph_id, "task_attempt_failed")
                    .task(identity.key())
                    .attempt(*attempt)
                    .detail(serde_json::json!({
                        "error": truncate_str(error, 500),
                        "timed_out": timed_out,
                    })),
            ),
            EngineEvent::TaskRetrying {
                identity,
                next_attempt,
                backoff_ms,
            } if self.level >= 3 => Some(
                LogEntry::new(&identity.graph_id, "task_retrying")
                    .task(identity.key())
                    .attempt(*next_attempt)
                    .detail(serde_json::json!({ "backoff_ms": backoff_ms })),
            ),

            _ => None,
        }
    }
}

/// Whether `graph_id` is `root` or nested under it.
fn belongs_to(graph_id: &str, root: &str) -> bool {
    graph_id == root
        || graph_id
            .strip_prefix(root)
            .is_some_and(|rest| rest.starts_with('/'))
}

fn dir_name(graph_id: &str) -> String {
    graph_id.replace(['/', '\\'], "_")
}

/// Truncate a string for logging, on a char boundary.
fn truncate_str(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weft_core::types::TaskIdentity;

    fn started(graph: &str) -> EngineEvent {
        EngineEvent::TaskStarted {
            identity: TaskIdentity::new(graph, "n", None, &json!(1)),
            attempt: 1,
        }
    }

    fn replayed(graph: &str) -> EngineEvent {
        EngineEvent::TaskReplayed {
            identity: TaskIdentity::new(graph, "n", None, &json!(1)),
        }
    }

    #[test]
    fn test_entry_skips_empty_fields() {
        let json = serde_json::to_string(&LogEntry::new("g", "graph_submitted")).unwrap();
        assert!(json.contains("graph_submitted"));
        assert!(!json.contains("task"));
        assert!(!json.contains("detail"));
    }

    #[test]
    fn test_event_level_filtering() {
        let submitted = EngineEvent::GraphSubmitted {
            graph_id: "g".into(),
            nodes: 2,
        };
        let nested = EngineEvent::GraphSubmitted {
            graph_id: "g/map-0".into(),
            nodes: 1,
        };

        let l1 = RunLogger::new(PathBuf::from("/tmp"), 1);
        assert!(l1.event_to_entry("g", &submitted).is_some());
        assert!(l1.event_to_entry("g", &nested).is_none());
        assert!(l1.event_to_entry("g", &replayed("g")).is_none());

        let l2 = RunLogger::new(PathBuf::from("/tmp"), 2);
        assert!(l2.event_to_entry("g", &nested).is_some());
        assert!(l2.event_to_entry("g", &replayed("g")).is_some());
        assert!(l2.event_to_entry("g", &started("g")).is_none());

        let l3 = RunLogger::new(PathBuf::from("/tmp"), 3);
        assert!(l3.event_to_entry("g", &started("g")).is_some());
    }

    #[test]
    fn test_belongs_to() {
        assert!(belongs_to("etl", "etl"));
        assert!(belongs_to("etl/map-0", "etl"));
        assert!(!belongs_to("etl2", "etl"));
    }

    #[test]
    fn test_truncate_str_char_boundary() {
        assert_eq!(truncate_str("héllo", 2), "h");
        assert_eq!(truncate_str("abc", 10), "abc");
    }

    #[tokio::test]
    async fn test_writes_until_graph_completes() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::new(16));
        let logger = RunLogger::new(dir.path().to_path_buf(), 2);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(logger.run(bus.clone(), "g".into(), cancel.clone()));
        // Let the logger subscribe before publishing.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        bus.publish(replayed("g"));
        bus.publish(replayed("other"));
        bus.publish(EngineEvent::GraphCompleted {
            graph_id: "g".into(),
            succeeded: true,
            elapsed_ms: 3,
        });
        tokio::time::timeout(std::time::Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();

        let graph_dir = dir.path().join("g");
        let file = std::fs::read_dir(&graph_dir)
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        let content = std::fs::read_to_string(file).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("task_replayed"));
        assert!(lines[1].contains("graph_completed"));
    }
}
