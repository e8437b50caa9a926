use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WeftError};
use crate::types::{ResourceRequest, RetryPolicy};

/// Top-level Weft configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: SchedulerConfig,
    #[serde(default)]
    pub capacity: CapacityConfig,
    #[serde(default)]
    pub retry: RetryDefaults,
    #[serde(default)]
    pub durability: DurabilityConfig,
    /// JSONL run log. Absent = disabled.
    #[serde(default)]
    pub log: Option<LogConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Upper bound on tasks running at once, across all graphs.
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// Timeout for functions that do not declare one.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    /// Broadcast capacity of the engine event bus.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
            default_timeout_secs: default_timeout_secs(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl SchedulerConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }
}

fn default_max_concurrent_tasks() -> usize {
    64
}
fn default_timeout_secs() -> u64 {
    300
}
fn default_event_capacity() -> usize {
    1024
}

/// Total resources the engine may hand out at once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapacityConfig {
    #[serde(default = "default_capacity_cpu")]
    pub cpu: f64,
    #[serde(default = "default_capacity_memory_gb")]
    pub memory_gb: f64,
    #[serde(default)]
    pub accelerators: u32,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            cpu: default_capacity_cpu(),
            memory_gb: default_capacity_memory_gb(),
            accelerators: 0,
        }
    }
}

impl CapacityConfig {
    /// Whether a single request could ever be granted.
    pub fn admits(&self, request: &ResourceRequest) -> bool {
        request.cpu <= self.cpu
            && request.memory_gb <= self.memory_gb
            && request.accelerators <= self.accelerators
    }
}

fn default_capacity_cpu() -> f64 {
    8.0
}
fn default_capacity_memory_gb() -> f64 {
    16.0
}

/// Backoff used by functions whose retry policy leaves it unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryDefaults {
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryDefaults {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryDefaults {
    /// Fill the unset backoff fields of a policy.
    pub fn apply(&self, policy: RetryPolicy) -> RetryPolicy {
        policy.resolve(self.initial_backoff_ms, self.max_backoff_ms)
    }
}

fn default_initial_backoff_ms() -> u64 {
    200
}
fn default_max_backoff_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DurabilityBackend {
    Sqlite,
    Memory,
}

/// Durable log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DurabilityConfig {
    #[serde(default = "default_backend")]
    pub backend: DurabilityBackend,
    /// Path of the SQLite database. Default: ~/.weft/records.db
    #[serde(default)]
    pub path: Option<String>,
    /// Extra attempts for a failed record write before the run aborts.
    #[serde(default = "default_write_retries")]
    pub write_retries: u32,
}

impl Default for DurabilityConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: None,
            write_retries: default_write_retries(),
        }
    }
}

impl DurabilityConfig {
    /// Resolved database path (expands `~`).
    pub fn db_path(&self) -> PathBuf {
        match &self.path {
            Some(p) => expand_home(p),
            None => dirs_home()
                .map(|h| h.join(".weft").join("records.db"))
                .unwrap_or_else(|| PathBuf::from("weft-records.db")),
        }
    }
}

fn default_backend() -> DurabilityBackend {
    DurabilityBackend::Sqlite
}
fn default_write_retries() -> u32 {
    3
}

/// JSONL run log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable run logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: ~/.weft/logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// 1 = graph summary, 2 = terminal task events, 3 = every attempt.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: None,
            level: default_log_level(),
        }
    }
}

impl LogConfig {
    pub fn dir(&self) -> PathBuf {
        match &self.log_dir {
            Some(p) => expand_home(p),
            None => dirs_home()
                .map(|h| h.join(".weft").join("logs"))
                .unwrap_or_else(|| PathBuf::from("weft-logs")),
        }
    }
}

fn default_log_enabled() -> bool {
    true
}
fn default_log_level() -> u8 {
    2
}

impl EngineConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| WeftError::ConfigNotFound(path.display().to_string()))?;
        Self::parse(&content)
    }

    /// Parse config text, with env var expansion.
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: EngineConfig =
            toml::from_str(&expanded).map_err(|e| WeftError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.engine.max_concurrent_tasks == 0 {
            return Err(WeftError::Config(
                "engine.max_concurrent_tasks must be at least 1".into(),
            ));
        }
        if self.engine.default_timeout_secs == 0 {
            return Err(WeftError::Config(
                "engine.default_timeout_secs must be at least 1".into(),
            ));
        }
        if self.capacity.cpu < 0.0 || self.capacity.memory_gb < 0.0 {
            return Err(WeftError::Config("capacity must not be negative".into()));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(WeftError::Config(
                "retry.initial_backoff_ms exceeds retry.max_backoff_ms".into(),
            ));
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_WEFT_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_WEFT_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_WEFT_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_WEFT_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_WEFT_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config = EngineConfig::parse("").unwrap();
        assert_eq!(config.engine.max_concurrent_tasks, 64);
        assert_eq!(config.engine.default_timeout_secs, 300);
        assert_eq!(config.capacity.cpu, 8.0);
        assert_eq!(config.capacity.accelerators, 0);
        assert_eq!(config.durability.backend, DurabilityBackend::Sqlite);
        assert_eq!(config.durability.write_retries, 3);
        assert!(config.log.is_none());
    }

    #[test]
    fn test_log_section_defaults() {
        let config = EngineConfig::parse("[log]\n").unwrap();
        let log = config.log.unwrap();
        assert!(log.enabled);
        assert_eq!(log.level, 2);
    }

    #[test]
    fn test_capacity_admits() {
        let cap = CapacityConfig {
            cpu: 2.0,
            memory_gb: 4.0,
            accelerators: 0,
        };
        assert!(cap.admits(&ResourceRequest::new(2.0, 4.0)));
        assert!(!cap.admits(&ResourceRequest::new(3.0, 1.0)));
        assert!(!cap.admits(&ResourceRequest::new(1.0, 1.0).with_accelerators(1)));
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let err = EngineConfig::parse("[engine]\nmax_concurrent_tasks = 0\n").unwrap_err();
        assert!(matches!(err, WeftError::Config(_)));
    }

    #[test]
    fn test_retry_defaults_apply() {
        let defaults = RetryDefaults {
            initial_backoff_ms: 5,
            max_backoff_ms: 50,
        };
        let policy = defaults.apply(RetryPolicy::new(2));
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.initial_backoff_ms, Some(5));
        assert_eq!(policy.max_backoff_ms, Some(50));
    }

    #[test]
    fn test_expand_home_without_tilde() {
        assert_eq!(expand_home("/var/weft.db"), PathBuf::from("/var/weft.db"));
    }
}
