use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::models::running_output::{DEFAULT_METRIC_BATCH_SIZE, DEFAULT_METRIC_BUFFER_LIMIT};

/// Top-level configuration for the metrelay agent.
///
/// Plugin tables are kept as raw YAML values; each entry under
/// `inputs.<name>` / `outputs.<name>` configures one plugin instance and is
/// parsed by the plugin itself.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// Agent scheduling and buffering options.
    #[serde(default)]
    pub agent: AgentConfig,

    /// Input plugin tables, keyed by plugin name.
    #[serde(default)]
    pub inputs: HashMap<String, Vec<serde_yaml::Value>>,

    /// Output plugin tables, keyed by plugin name.
    #[serde(default)]
    pub outputs: HashMap<String, Vec<serde_yaml::Value>>,
}

/// Agent scheduling and buffering options.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Interval at which to gather from inputs. Default: 10s.
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Align collection to wall-clock multiples of `interval`, so e.g. a 10s
    /// interval always collects on :00, :10, :20. Default: true.
    #[serde(default = "default_true")]
    pub round_interval: bool,

    /// Random per-tick delay added to collection, spreading simultaneous
    /// plugin activity. Default: 0s.
    #[serde(default, with = "humantime_serde")]
    pub collection_jitter: Duration,

    /// Fixed shift applied to every collection tick. Default: 0s.
    #[serde(default, with = "humantime_serde")]
    pub collection_offset: Duration,

    /// Interval at which buffered metrics are flushed to outputs.
    /// Default: 10s.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Random delay added to each flush, avoiding synchronized write spikes
    /// across many agents. Default: 0s.
    #[serde(default, with = "humantime_serde")]
    pub flush_jitter: Duration,

    /// Maximum number of metrics written to an output in one call; also the
    /// threshold that wakes the flush loop early. Default: 1000.
    #[serde(default = "default_metric_batch_size")]
    pub metric_batch_size: usize,

    /// Per-output buffer capacity. When full, the oldest unsent metrics are
    /// overwritten. Must be at least twice the batch size. Default: 10000.
    #[serde(default = "default_metric_buffer_limit")]
    pub metric_buffer_limit: usize,

    /// Logging verbosity (trace, debug, info, warn, error). Passed through
    /// to logger setup; the `--log-level` flag wins when given.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// --- Default value functions ---

fn default_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_metric_batch_size() -> usize {
    DEFAULT_METRIC_BATCH_SIZE
}

fn default_metric_buffer_limit() -> usize {
    DEFAULT_METRIC_BUFFER_LIMIT
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            round_interval: true,
            collection_jitter: Duration::ZERO,
            collection_offset: Duration::ZERO,
            flush_interval: default_flush_interval(),
            flush_jitter: Duration::ZERO,
            metric_batch_size: default_metric_batch_size(),
            metric_buffer_limit: default_metric_buffer_limit(),
            log_level: default_log_level(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Loads configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let mut cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.agent.normalize();
        cfg.validate()?;

        Ok(cfg)
    }

    /// Validates required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.agent.interval.is_zero() {
            bail!("agent.interval must be positive");
        }

        if self.agent.flush_interval.is_zero() {
            bail!("agent.flush_interval must be positive");
        }

        if self.agent.metric_buffer_limit < 2 * self.agent.metric_batch_size {
            bail!(
                "agent.metric_buffer_limit must be at least twice agent.metric_batch_size \
                 ({} < 2 * {})",
                self.agent.metric_buffer_limit,
                self.agent.metric_batch_size,
            );
        }

        Ok(())
    }
}

impl AgentConfig {
    /// Replaces zero batch/buffer sizes with their defaults before
    /// validation.
    pub fn normalize(&mut self) {
        if self.metric_batch_size == 0 {
            self.metric_batch_size = default_metric_batch_size();
        }
        if self.metric_buffer_limit == 0 {
            self.metric_buffer_limit = default_metric_buffer_limit();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let cfg = AgentConfig::default();
        assert_eq!(cfg.interval, Duration::from_secs(10));
        assert!(cfg.round_interval);
        assert_eq!(cfg.flush_interval, Duration::from_secs(10));
        assert_eq!(cfg.metric_batch_size, 1000);
        assert_eq!(cfg.metric_buffer_limit, 10_000);
        assert_eq!(cfg.log_level, "info");
    }

    #[test]
    fn test_parse_yaml_with_durations() {
        let cfg: Config = serde_yaml::from_str(
            r#"
agent:
  interval: 250ms
  round_interval: false
  collection_jitter: 50ms
  flush_interval: 1s
  metric_batch_size: 3
  metric_buffer_limit: 10
inputs:
  cpu:
    - percpu: true
outputs:
  file:
    - files: ["stdout"]
"#,
        )
        .expect("valid yaml");

        assert_eq!(cfg.agent.interval, Duration::from_millis(250));
        assert!(!cfg.agent.round_interval);
        assert_eq!(cfg.agent.collection_jitter, Duration::from_millis(50));
        assert_eq!(cfg.agent.metric_batch_size, 3);
        assert_eq!(cfg.inputs["cpu"].len(), 1);
        assert_eq!(cfg.outputs["file"].len(), 1);
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut cfg = Config::default();
        cfg.agent.interval = Duration::ZERO;
        let err = cfg.validate().expect_err("must fail");
        assert!(err.to_string().contains("agent.interval"));
    }

    #[test]
    fn test_validate_rejects_small_buffer_limit() {
        let mut cfg = Config::default();
        cfg.agent.metric_batch_size = 100;
        cfg.agent.metric_buffer_limit = 150;
        let err = cfg.validate().expect_err("must fail");
        assert!(err.to_string().contains("metric_buffer_limit"));
    }

    #[test]
    fn test_normalize_applies_defaults_for_zero() {
        let mut agent = AgentConfig {
            metric_batch_size: 0,
            metric_buffer_limit: 0,
            ..AgentConfig::default()
        };
        agent.normalize();
        assert_eq!(agent.metric_batch_size, 1000);
        assert_eq!(agent.metric_buffer_limit, 10_000);
    }
}
