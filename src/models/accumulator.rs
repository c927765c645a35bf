use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::metric::Metric;

/// Sink handed to input plugins.
#[async_trait]
pub trait Accumulator: Send + Sync {
    /// Feeds one metric into the pipeline. Awaits channel capacity when the
    /// shared metric channel is full, applying backpressure to the producer.
    async fn add_metric(&self, metric: Box<dyn Metric>);

    /// Reports a plugin error. Logged with the input's name, never
    /// propagated.
    fn add_error(&self, err: anyhow::Error);
}

/// Accumulator forwarding into the agent's shared metric channel.
pub struct ChannelAccumulator {
    metrics: mpsc::Sender<Box<dyn Metric>>,
    input_name: Arc<str>,
}

impl ChannelAccumulator {
    pub fn new(metrics: mpsc::Sender<Box<dyn Metric>>, input_name: impl Into<Arc<str>>) -> Self {
        Self {
            metrics,
            input_name: input_name.into(),
        }
    }
}

#[async_trait]
impl Accumulator for ChannelAccumulator {
    async fn add_metric(&self, metric: Box<dyn Metric>) {
        if self.metrics.send(metric).await.is_err() {
            debug!(input = %self.input_name, "metric channel closed, metric dropped");
        }
    }

    fn add_error(&self, err: anyhow::Error) {
        error!(input = %self.input_name, error = %err, "error in plugin");
    }
}
