use std::io::Write;
use std::time::Duration;

use weft_core::config::{DurabilityBackend, EngineConfig};
use weft_core::error::WeftError;
use weft_core::types::{FunctionSpec, RetryPolicy};
use weft_engine::{task_fn, Engine};

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[engine]
max_concurrent_tasks = 8
default_timeout_secs = 30
event_capacity = 256

[capacity]
cpu = 4.0
memory_gb = 8.0
accelerators = 1

[retry]
initial_backoff_ms = 50
max_backoff_ms = 2000

[durability]
backend = "memory"
write_retries = 5

[log]
enabled = true
log_dir = "/tmp/weft-test-logs"
level = 3
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = EngineConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_concurrent_tasks, 8);
    assert_eq!(config.engine.default_timeout(), Duration::from_secs(30));
    assert_eq!(config.engine.event_capacity, 256);
    assert_eq!(config.capacity.cpu, 4.0);
    assert_eq!(config.capacity.accelerators, 1);
    assert_eq!(config.retry.initial_backoff_ms, 50);
    assert_eq!(config.durability.backend, DurabilityBackend::Memory);
    assert_eq!(config.durability.write_retries, 5);

    let log = config.log.expect("log present");
    assert_eq!(log.level, 3);
    assert_eq!(log.dir(), std::path::PathBuf::from("/tmp/weft-test-logs"));
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("WEFT_TEST_DB_PATH", "/tmp/weft-expanded.db");

    let toml_content = r#"
[durability]
path = "${WEFT_TEST_DB_PATH}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = EngineConfig::load(tmp.path()).expect("load config");
    assert_eq!(
        config.durability.db_path(),
        std::path::PathBuf::from("/tmp/weft-expanded.db")
    );

    std::env::remove_var("WEFT_TEST_DB_PATH");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let toml_content = r#"
[capacity]
cpu = 2.0
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = EngineConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.capacity.cpu, 2.0);
    assert_eq!(config.capacity.memory_gb, 16.0);
    assert_eq!(config.engine.max_concurrent_tasks, 64);
    assert_eq!(config.engine.default_timeout_secs, 300);
    assert_eq!(config.retry.initial_backoff_ms, 200);
    assert_eq!(config.retry.max_backoff_ms, 10_000);
    assert_eq!(config.durability.backend, DurabilityBackend::Sqlite);
    assert!(config.log.is_none());
}

#[test]
fn test_missing_file_is_reported() {
    let err = EngineConfig::load(std::path::Path::new("/nonexistent/weft.toml")).unwrap_err();
    assert!(matches!(err, WeftError::ConfigNotFound(_)));
}

#[test]
fn test_invalid_backoff_range_rejected() {
    let err = EngineConfig::parse("[retry]\ninitial_backoff_ms = 500\nmax_backoff_ms = 100\n")
        .unwrap_err();
    assert!(matches!(err, WeftError::Config(_)));
}

#[test]
fn test_unknown_backend_rejected() {
    let err = EngineConfig::parse("[durability]\nbackend = \"postgres\"\n").unwrap_err();
    assert!(matches!(err, WeftError::Config(_)));
}

#[tokio::test]
async fn test_retry_section_fills_function_backoff() {
    let mut config = EngineConfig::parse("[retry]\ninitial_backoff_ms = 7\nmax_backoff_ms = 70\n")
        .expect("parse config");
    config.durability.backend = DurabilityBackend::Memory;
    let engine = Engine::open(config).expect("open engine");

    let defaulted = engine.register(
        FunctionSpec::new("defaulted").with_retries(2),
        task_fn(|input, _ctx| async move { Ok(input) }),
    );
    let explicit = engine.register(
        FunctionSpec::new("explicit").with_retry_policy(RetryPolicy::new(1).with_backoff(3, 9)),
        task_fn(|input, _ctx| async move { Ok(input) }),
    );

    assert_eq!(defaulted.spec().retry.initial_backoff_ms, Some(7));
    assert_eq!(defaulted.spec().retry.max_backoff_ms, Some(70));
    assert_eq!(explicit.spec().retry.initial_backoff_ms, Some(3));
    assert_eq!(explicit.spec().retry.max_backoff_ms, Some(9));
}
