use std::any::Any;
use std::time::SystemTime;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use sysinfo::System;

use crate::metric::Metric;
use crate::models::Accumulator;
use crate::plugin::Input;

/// CPU utilization sample.
#[derive(Debug, Clone)]
pub struct CpuMetric {
    pub timestamp: SystemTime,
    /// Total utilization across all cores, in percent.
    pub total_usage: f64,
    /// Per-core utilization in percent; empty unless `percpu` is set.
    pub core_usage: Vec<f64>,
}

impl Metric for CpuMetric {
    fn clone_metric(&self) -> Box<dyn Metric> {
        Box::new(self.clone())
    }

    fn to_value(&self) -> serde_json::Value {
        let timestamp_ms = self
            .timestamp
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        serde_json::json!({
            "name": "cpu",
            "timestamp_ms": timestamp_ms,
            "usage": self.total_usage,
            "core_usage": self.core_usage,
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Default, Deserialize)]
struct CpuConfig {
    /// Emit per-core utilization alongside the total.
    #[serde(default)]
    percpu: bool,
}

/// Samples CPU utilization on each gather.
///
/// The sampler state persists across gathers so utilization is computed
/// against the previous collection, not process start.
pub struct CpuInput {
    system: System,
    percpu: bool,
}

impl CpuInput {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_all();

        Self {
            system,
            percpu: false,
        }
    }
}

impl Default for CpuInput {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Input for CpuInput {
    async fn gather(&mut self, acc: &dyn Accumulator) -> Result<()> {
        self.system.refresh_cpu_all();

        let core_usage = if self.percpu {
            self.system
                .cpus()
                .iter()
                .map(|cpu| f64::from(cpu.cpu_usage()))
                .collect()
        } else {
            Vec::new()
        };

        let metric = CpuMetric {
            timestamp: SystemTime::now(),
            total_usage: f64::from(self.system.global_cpu_usage()),
            core_usage,
        };

        acc.add_metric(Box::new(metric)).await;
        Ok(())
    }

    fn parse_config(&mut self, cfg: &serde_yaml::Value) -> Result<()> {
        let parsed: CpuConfig =
            serde_yaml::from_value(cfg.clone()).context("cpu input config")?;
        self.percpu = parsed.percpu;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    struct CollectingAccumulator {
        metrics: Arc<Mutex<Vec<Box<dyn Metric>>>>,
    }

    #[async_trait]
    impl Accumulator for CollectingAccumulator {
        async fn add_metric(&self, metric: Box<dyn Metric>) {
            self.metrics.lock().push(metric);
        }

        fn add_error(&self, _err: anyhow::Error) {}
    }

    #[tokio::test]
    async fn test_gather_emits_one_metric() {
        let mut input = CpuInput::new();
        let acc = CollectingAccumulator::default();

        input.gather(&acc).await.expect("gather succeeds");

        let metrics = acc.metrics.lock();
        assert_eq!(metrics.len(), 1);
        let metric = metrics[0]
            .as_any()
            .downcast_ref::<CpuMetric>()
            .expect("cpu metric");
        assert!(metric.core_usage.is_empty(), "percpu off by default");
    }

    #[tokio::test]
    async fn test_percpu_config_enables_core_breakdown() {
        let mut input = CpuInput::new();
        input
            .parse_config(&serde_yaml::from_str("percpu: true").expect("yaml"))
            .expect("config parses");

        let acc = CollectingAccumulator::default();
        input.gather(&acc).await.expect("gather succeeds");

        let metrics = acc.metrics.lock();
        let metric = metrics[0]
            .as_any()
            .downcast_ref::<CpuMetric>()
            .expect("cpu metric");
        assert!(!metric.core_usage.is_empty());
    }

    #[test]
    fn test_metric_clone_is_independent() {
        let metric = CpuMetric {
            timestamp: SystemTime::UNIX_EPOCH,
            total_usage: 12.5,
            core_usage: vec![10.0, 15.0],
        };

        let clone = metric.clone_metric();
        let clone = clone
            .as_any()
            .downcast_ref::<CpuMetric>()
            .expect("cpu metric");
        assert_eq!(clone.total_usage, 12.5);
        assert_eq!(clone.core_usage, vec![10.0, 15.0]);
    }
}
