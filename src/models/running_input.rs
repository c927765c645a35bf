use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tokio::sync::Mutex;

use crate::models::Accumulator;
use crate::plugin::Input;

/// Wraps an input plugin with lifecycle and timing instrumentation.
///
/// The plugin sits behind a lock so gathers are serialized; the agent's
/// gather monitor guarantees only one collection is in flight per input.
pub struct RunningInput {
    pub name: Arc<str>,
    input: Mutex<Box<dyn Input>>,
    gather_time_ns: AtomicU64,
}

impl RunningInput {
    pub fn new(input: Box<dyn Input>, name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            input: Mutex::new(input),
            gather_time_ns: AtomicU64::new(0),
        }
    }

    /// Invokes the plugin's optional initializer.
    pub async fn init(&self) -> Result<()> {
        let mut input = self.input.lock().await;
        if let Some(initializer) = input.as_initializer() {
            initializer.init()?;
        }
        Ok(())
    }

    /// Runs one collection, recording how long it took.
    pub async fn gather(&self, acc: &dyn Accumulator) -> Result<()> {
        let mut input = self.input.lock().await;

        let start = Instant::now();
        let res = input.gather(acc).await;
        self.gather_time_ns
            .store(start.elapsed().as_nanos() as u64, Ordering::Relaxed);
        res
    }

    /// Duration of the most recent gather, in nanoseconds.
    pub fn gather_time_ns(&self) -> u64 {
        self.gather_time_ns.load(Ordering::Relaxed)
    }

    /// Starts the plugin if it has the service capability. Returns whether
    /// it was a service input.
    pub async fn start_service(&self, acc: Arc<dyn Accumulator>) -> Result<bool> {
        let mut input = self.input.lock().await;
        match input.as_service_input() {
            Some(service) => {
                service.start(acc).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Stops the plugin's background production if it is a service input.
    pub async fn stop_service(&self) {
        let mut input = self.input.lock().await;
        if let Some(service) = input.as_service_input() {
            service.stop().await;
        }
    }
}
