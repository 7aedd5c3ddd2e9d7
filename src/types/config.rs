//! Configuration structures.
//!
//! Configuration is loaded from an optional TOML file, then overridden by
//! `SORTIE_*` environment variables. Every service receives its section by
//! construction; nothing reads configuration globally.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::errors::{Error, Result};

/// Top-level configuration shared by all services.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Broker transport configuration.
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Orchestrator configuration.
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Worker configuration.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Scheduler service configuration.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from `path` (if given) and apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                toml::from_str::<Config>(&raw).map_err(|e| {
                    Error::validation(format!("invalid config {}: {}", path.display(), e))
                })?
            }
            None => Config::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply `SORTIE_*` overrides using `lookup` as the variable source.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("SORTIE_BROKER_ADDR") {
            self.broker.listen_addr = addr;
        }
        if let Some(name) = lookup("SORTIE_WORKER_NAME") {
            self.worker.name = name;
        }
        if let Some(dir) = lookup("SORTIE_MODULES_DIR") {
            self.worker.modules_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("SORTIE_EVIDENCE_DIR") {
            self.orchestrator.evidence_dir = PathBuf::from(dir);
        }
        if let Some(url) = lookup("SORTIE_SESSION_INVENTORY_URL") {
            self.worker.session_inventory_url = Some(url);
        }
    }
}

/// Reconnect/backoff policy. `max_attempts = None` retries forever.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectPolicy {
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,

    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (0-based), or `None` once the
    /// policy is exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if let Some(max) = self.max_attempts {
            if attempt >= max {
                return None;
            }
        }
        let factor = 2u32.saturating_pow(attempt.min(16));
        Some(self.initial_delay.saturating_mul(factor).min(self.max_delay))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

/// Broker transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Broker server bind/connect address (TCP).
    pub listen_addr: String,

    /// Maximum frame payload size in bytes.
    pub max_frame_bytes: u32,

    /// Maximum concurrent TCP connections accepted by the broker server.
    pub max_connections: usize,

    /// Idle read timeout per request frame on control connections.
    pub read_timeout_secs: u64,

    /// Write timeout per frame. Slow consumers are dropped.
    pub write_timeout_secs: u64,

    /// Client reconnect policy.
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:50061".to_string(),
            max_frame_bytes: 5 * 1024 * 1024,
            max_connections: 1000,
            read_timeout_secs: 300,
            write_timeout_secs: 10,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Queue receiving step (payload) replies from workers.
    pub payload_response_queue: String,

    /// Queue receiving trigger and scheduler notifications.
    pub event_queue: String,

    /// Queue the scheduler service consumes.
    pub scheduler_queue: String,

    /// Competing consumers per inbound queue.
    pub consumers: usize,

    /// Deadline for blocking control calls (health checks, triggers, kills).
    #[serde(with = "humantime_serde")]
    pub rpc_timeout: Duration,

    /// Deadline for a dispatched step to report back.
    #[serde(with = "humantime_serde")]
    pub step_timeout: Duration,

    /// How long an unknown correlation id is retried before the reply is dropped.
    #[serde(with = "humantime_serde")]
    pub correlation_grace: Duration,

    /// Interval between correlation lookups during the grace period.
    #[serde(with = "humantime_serde")]
    pub correlation_retry_interval: Duration,

    /// Root directory for per-plan-execution evidence.
    pub evidence_dir: PathBuf,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            payload_response_queue: "sortie.core.payload.response".to_string(),
            event_queue: "sortie.core.event.response".to_string(),
            scheduler_queue: "sortie.scheduler.control".to_string(),
            consumers: 4,
            rpc_timeout: Duration::from_secs(30),
            step_timeout: Duration::from_secs(3600),
            correlation_grace: Duration::from_secs(5),
            correlation_retry_interval: Duration::from_millis(200),
            evidence_dir: PathBuf::from("evidence"),
        }
    }
}

/// Worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker name; determines its queue names.
    pub name: String,

    /// Competing consumers per worker queue.
    pub consumers: usize,

    /// Tasks draining the internal action queue.
    pub action_workers: usize,

    /// Directory holding module executables.
    pub modules_dir: PathBuf,

    /// Hard limit for a single module process (None = unlimited).
    #[serde(default, with = "humantime_serde")]
    pub module_timeout: Option<Duration>,

    /// Remote session inventory endpoint polled by session listeners.
    #[serde(default)]
    pub session_inventory_url: Option<String>,

    /// Poll interval of session listeners.
    #[serde(with = "humantime_serde")]
    pub session_poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            consumers: 4,
            action_workers: 2,
            modules_dir: PathBuf::from("modules"),
            module_timeout: None,
            session_inventory_url: None,
            session_poll_interval: Duration::from_secs(5),
        }
    }
}

/// Scheduler service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Queue consumed by the scheduler service.
    pub queue: String,

    /// Optional JSON file persisting jobs across restarts.
    #[serde(default)]
    pub jobs_file: Option<PathBuf>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue: "sortie.scheduler.control".to_string(),
            jobs_file: None,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults_share_scheduler_queue() {
        let config = Config::default();
        assert_eq!(config.orchestrator.scheduler_queue, config.scheduler.queue);
        assert_eq!(config.worker.consumers, 4);
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[broker]
listen_addr = "10.0.0.1:7000"
max_frame_bytes = 1024
max_connections = 5
read_timeout_secs = 1
write_timeout_secs = 1

[broker.reconnect]
initial_delay = "1s"
max_delay = "10s"
max_attempts = 3

[worker]
name = "attacker"
consumers = 2
action_workers = 1
modules_dir = "/opt/modules"
session_poll_interval = "2s"
"#
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.broker.listen_addr, "10.0.0.1:7000");
        assert_eq!(config.broker.reconnect.max_attempts, Some(3));
        assert_eq!(config.worker.name, "attacker");
        assert_eq!(config.worker.session_poll_interval, Duration::from_secs(2));
        assert_eq!(config.orchestrator.consumers, 4);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("SORTIE_WORKER_NAME", "w2"),
            ("SORTIE_EVIDENCE_DIR", "/tmp/evidence"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        config.apply_env_overrides(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.worker.name, "w2");
        assert_eq!(config.orchestrator.evidence_dir, PathBuf::from("/tmp/evidence"));
        assert_eq!(config.broker.listen_addr, "127.0.0.1:50061");
    }

    #[test]
    fn test_invalid_toml_is_validation_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "broker = 5").unwrap();
        let err = Config::load(Some(file.path())).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_reconnect_backoff_bounded() {
        let policy = ReconnectPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            max_attempts: Some(3),
        };
        assert_eq!(policy.delay_for(0), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay_for(1), Some(Duration::from_millis(200)));
        assert_eq!(policy.delay_for(2), Some(Duration::from_millis(350)));
        assert_eq!(policy.delay_for(3), None);
    }

    #[test]
    fn test_reconnect_backoff_unbounded() {
        let policy = ReconnectPolicy::default();
        assert!(policy.delay_for(10_000).is_some());
    }
}
