//! Event broadcast to four notification channels, each with its own retry
//! budget and timeout. One channel failing leaves the others untouched.

use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::info;

use weft_core::error::{Result, WeftError};
use weft_core::types::{FunctionSpec, ResourceRequest};
use weft_engine::{task_fn, wait, Engine, FanoutReport, FunctionRef, ReturnWhen, TaskContext};

/// (name, max_retries, timeout_secs)
const CHANNELS: [(&str, u32, u64); 4] = [
    ("log", 2, 10),
    ("webhook", 3, 30),
    ("audit", 2, 15),
    ("metrics", 1, 10),
];

#[derive(Debug, Clone, Deserialize)]
struct Event {
    #[serde(rename = "type")]
    event_type: String,
    message: String,
    #[serde(default = "default_severity")]
    severity: String,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    tags: Option<Vec<String>>,
    /// Channels that should fail every attempt, to demonstrate isolation.
    #[serde(default)]
    fail_channels: Vec<String>,
}

fn default_severity() -> String {
    "info".to_string()
}

pub fn default_input() -> Value {
    json!({
        "type": "user.signup",
        "message": "New user registered",
        "severity": "info",
        "data": {"user_id": "usr_123", "email": "test@example.com", "plan": "pro"},
        "tags": ["user", "signup", "pro-plan"],
    })
}

fn sha256_hex(text: &str) -> String {
    format!("{:x}", Sha256::digest(text.as_bytes()))
}

/// Decode `{event, event_id}` and apply failure injection for `channel`.
fn channel_args(input: &Value, channel: &str) -> Result<(Event, String)> {
    let event: Event = serde_json::from_value(input["event"].clone())?;
    let event_id = input["event_id"].as_str().unwrap_or_default().to_string();
    if event.fail_channels.iter().any(|c| c == channel) {
        return Err(WeftError::runtime(format!("{} channel unavailable", channel)));
    }
    Ok((event, event_id))
}

async fn log_event(input: Value, _ctx: TaskContext) -> Result<Value> {
    let (event, event_id) = channel_args(&input, "log")?;
    let timestamp = Utc::now().to_rfc3339();
    info!(
        event_id = %event_id,
        level = %event.severity.to_uppercase(),
        event_type = %event.event_type,
        message = %event.message,
        "Event logged"
    );
    Ok(json!({
        "status": "success",
        "channel": "log",
        "timestamp": timestamp,
        "log_id": format!("log_{}", event_id),
    }))
}

async fn send_webhook(input: Value, _ctx: TaskContext) -> Result<Value> {
    let (event, event_id) = channel_args(&input, "webhook")?;
    let timestamp = Utc::now().to_rfc3339();
    let payload = json!({
        "event_id": event_id,
        "type": event.event_type,
        "severity": event.severity,
        "message": event.message,
        "data": event.data,
        "timestamp": timestamp,
    });
    let payload_bytes = serde_json::to_string(&payload)?.len();
    Ok(json!({
        "status": "success",
        "channel": "webhook",
        "timestamp": timestamp,
        "payload_bytes": payload_bytes,
        "delivery_id": format!("wh_{}", event_id),
    }))
}

async fn store_audit(input: Value, _ctx: TaskContext) -> Result<Value> {
    let (event, event_id) = channel_args(&input, "audit")?;
    // serde_json maps are key-ordered, so the hash is stable.
    let data = serde_json::to_string(event.data.as_ref().unwrap_or(&json!({})))?;
    let mut data_hash = sha256_hex(&data);
    data_hash.truncate(32);
    Ok(json!({
        "status": "success",
        "channel": "audit",
        "timestamp": Utc::now().to_rfc3339(),
        "audit_id": format!("aud_{}", event_id),
        "data_hash": data_hash,
    }))
}

async fn record_metrics(input: Value, _ctx: TaskContext) -> Result<Value> {
    let (event, _event_id) = channel_args(&input, "metrics")?;
    let data_size = serde_json::to_string(event.data.as_ref().unwrap_or(&json!({})))?.len();
    let mut metrics = vec![
        json!({
            "name": "events_total",
            "type": "counter",
            "value": 1,
            "labels": {"event_type": event.event_type, "severity": event.severity},
        }),
        json!({
            "name": "event_data_size_bytes",
            "type": "gauge",
            "value": data_size,
            "labels": {"event_type": event.event_type},
        }),
    ];
    for tag in event.tags.iter().flatten() {
        metrics.push(json!({
            "name": "events_by_tag",
            "type": "counter",
            "value": 1,
            "labels": {"tag": tag},
        }));
    }
    let names: Vec<&Value> = metrics.iter().map(|m| &m["name"]).collect();
    Ok(json!({
        "status": "success",
        "channel": "metrics",
        "timestamp": Utc::now().to_rfc3339(),
        "metrics_recorded": metrics.len(),
        "metric_names": names,
    }))
}

fn channel(engine: &Engine, name: &str, retries: u32, timeout_secs: u64) -> FunctionRef {
    let spec = FunctionSpec::new(format!("fanout.{}", name))
        .with_resources(ResourceRequest::new(0.5, 0.5))
        .with_retries(retries)
        .with_timeout(Duration::from_secs(timeout_secs));
    match name {
        "log" => engine.register(spec, task_fn(log_event)),
        "webhook" => engine.register(spec, task_fn(send_webhook)),
        "audit" => engine.register(spec, task_fn(store_audit)),
        _ => engine.register(spec, task_fn(record_metrics)),
    }
}

/// Register the channels and the broadcasting root; returns the root.
pub fn register(engine: &Engine) -> FunctionRef {
    let channels: Vec<(&'static str, FunctionRef)> = CHANNELS
        .iter()
        .map(|(name, retries, timeout)| (*name, channel(engine, name, *retries, *timeout)))
        .collect();

    engine.register(
        FunctionSpec::new("fanout.broadcast_event").with_resources(ResourceRequest::none()),
        task_fn(move |input: Value, ctx: TaskContext| {
            let channels = channels.clone();
            async move {
                let event: Event = serde_json::from_value(input.clone())?;
                // Derived from the graph rather than the clock so a resubmitted
                // broadcast reuses the recorded channel deliveries.
                let mut event_id = sha256_hex(&format!(
                    "{}:{}:{}",
                    event.event_type,
                    event.message,
                    ctx.identity().graph_id
                ));
                event_id.truncate(16);

                let args = json!({"event": input, "event_id": event_id});
                let futures: Vec<_> = channels
                    .iter()
                    .map(|(_, f)| ctx.scope().launch(f, args.clone()))
                    .collect();
                wait(&futures, ReturnWhen::AllCompleted).await;

                let report = FanoutReport::collect(
                    channels.iter().map(|(name, _)| *name).zip(futures.iter()),
                );
                Ok(json!({
                    "event_id": event_id,
                    "event_type": event.event_type,
                    "broadcast_at": report.completed_at,
                    "overall_status": report.overall_status,
                    "channels": report.branches,
                    "summary": report.summary,
                }))
            }
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_all_channels_succeed() {
        let engine = Engine::in_memory();
        let root = register(&engine);
        let result = engine
            .invoke("fanout-test", &root, default_input())
            .await
            .unwrap();
        let output = result.outcome.value().cloned().unwrap();
        assert_eq!(output["overall_status"], "success");
        assert_eq!(output["summary"]["successful"], 4);
        assert_eq!(output["event_id"].as_str().unwrap().len(), 16);
        assert_eq!(output["channels"]["metrics"]["output"]["metrics_recorded"], 5);
    }

    #[tokio::test]
    async fn test_broadcast_isolates_failing_channel() {
        let engine = Engine::in_memory();
        let root = register(&engine);
        let mut input = default_input();
        input["fail_channels"] = json!(["metrics"]);

        let result = engine.invoke("fanout-partial", &root, input).await.unwrap();
        let output = result.outcome.value().cloned().unwrap();
        assert_eq!(output["overall_status"], "partial");
        assert_eq!(output["summary"]["failed"], 1);
        assert_eq!(output["channels"]["metrics"]["status"], "failure");
        assert_eq!(output["channels"]["metrics"]["attempts"], 2);
        assert_eq!(output["channels"]["log"]["status"], "success");
    }
}
