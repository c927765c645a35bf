pub mod ticker;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::metric::Metric;
use crate::models::{Accumulator, ChannelAccumulator, RunningInput, RunningOutput};

use self::ticker::Ticker;

/// Capacity of the shared input-to-fan-out metric channel. Producers block
/// when it is full, which is the pipeline's backpressure.
const METRIC_CHANNEL_CAPACITY: usize = 100;

/// How long to wait before the single output reconnect attempt.
const CONNECT_RETRY_WAIT: Duration = Duration::from_secs(15);

/// Sentinel returned when a run ended because it was cancelled. The reload
/// supervisor treats this as a clean shutdown.
#[derive(Debug, thiserror::Error)]
#[error("agent run cancelled")]
pub struct RunCancelled;

/// Top-level pipeline orchestrator.
///
/// Wires inputs through the shared metric channel into the per-output
/// buffers, drives periodic collection and flushing, and supervises
/// shutdown: cancel inputs, wait for them, close the channel, drain the
/// fan-out, flush every output once more, close the outputs.
pub struct Agent {
    cfg: AgentConfig,
    inputs: Vec<Arc<RunningInput>>,
    outputs: Vec<Arc<RunningOutput>>,
}

impl Agent {
    pub fn new(
        cfg: AgentConfig,
        inputs: Vec<Arc<RunningInput>>,
        outputs: Vec<Arc<RunningOutput>>,
    ) -> Self {
        Self {
            cfg,
            inputs,
            outputs,
        }
    }

    /// Runs the pipeline until `cancel` fires and the drain completes.
    ///
    /// Returns [`RunCancelled`] after a cancellation-driven shutdown; any
    /// other error means startup failed or a driver died.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        debug!("starting plugins");
        self.init_plugins().await?;

        let start_time = Instant::now();

        debug!("connecting outputs");
        let (metric_tx, metric_rx) = mpsc::channel::<Box<dyn Metric>>(METRIC_CHANNEL_CAPACITY);
        self.start_outputs(&cancel).await?;

        debug!("starting inputs");
        self.start_inputs(&metric_tx).await?;

        let outputs_task = tokio::spawn(run_outputs(
            self.outputs.clone(),
            metric_rx,
            self.cfg.flush_interval,
            self.cfg.flush_jitter,
        ));
        let inputs_task = tokio::spawn(run_inputs(
            cancel.clone(),
            start_time,
            self.inputs.clone(),
            metric_tx,
            self.cfg.clone(),
        ));

        inputs_task.await.context("input driver failed")?;
        outputs_task.await.context("output driver failed")?;

        if cancel.is_cancelled() {
            return Err(RunCancelled.into());
        }
        Ok(())
    }

    /// Initializes every plugin; any failure aborts startup.
    async fn init_plugins(&self) -> Result<()> {
        for input in &self.inputs {
            input
                .init()
                .await
                .with_context(|| format!("could not initialize input {}", input.name))?;
        }
        for output in &self.outputs {
            output
                .init()
                .await
                .with_context(|| format!("could not initialize output {}", output.name))?;
        }
        Ok(())
    }

    /// Connects every output, closing the already-connected ones if one
    /// fails for good.
    async fn start_outputs(&self, cancel: &CancellationToken) -> Result<()> {
        let mut connected: Vec<&Arc<RunningOutput>> = Vec::new();
        for output in &self.outputs {
            if let Err(e) = connect_output(cancel, output).await {
                for output in connected {
                    output.close().await;
                }
                return Err(e).with_context(|| format!("connecting output {}", output.name));
            }
            connected.push(output);
        }
        Ok(())
    }

    /// Starts every service input, stopping the already-started ones if one
    /// fails.
    async fn start_inputs(&self, metric_tx: &mpsc::Sender<Box<dyn Metric>>) -> Result<()> {
        debug!("starting service inputs");

        let mut started: Vec<&Arc<RunningInput>> = Vec::new();
        for input in &self.inputs {
            let acc: Arc<dyn Accumulator> = Arc::new(ChannelAccumulator::new(
                metric_tx.clone(),
                input.name.clone(),
            ));

            match input.start_service(acc).await {
                Ok(true) => started.push(input),
                Ok(false) => {}
                Err(e) => {
                    for input in started {
                        input.stop_service().await;
                    }
                    return Err(e).with_context(|| format!("starting input {}", input.name));
                }
            }
        }
        Ok(())
    }
}

/// Connects one output, retrying once after a cancellable wait.
async fn connect_output(cancel: &CancellationToken, output: &RunningOutput) -> Result<()> {
    debug!(output = %output.name, "attempting connection");

    if let Err(e) = output.connect().await {
        error!(
            output = %output.name,
            error = %e,
            "failed to connect, retrying in 15s",
        );

        sleep_cancellable(cancel, CONNECT_RETRY_WAIT).await?;

        output
            .connect()
            .await
            .with_context(|| format!("error connecting to output {}", output.name))?;
    }

    debug!(output = %output.name, "successfully connected");
    Ok(())
}

/// Sleeps for `duration` unless cancelled first.
async fn sleep_cancellable(cancel: &CancellationToken, duration: Duration) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(RunCancelled.into()),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Input driver: one ticker and gather loop per input.
///
/// When every gather loop has exited, service inputs are stopped and the
/// last senders on the shared channel are released, which is how the output
/// driver learns the inputs are done.
async fn run_inputs(
    cancel: CancellationToken,
    start_time: Instant,
    inputs: Vec<Arc<RunningInput>>,
    metric_tx: mpsc::Sender<Box<dyn Metric>>,
    cfg: AgentConfig,
) {
    let mut tasks = Vec::with_capacity(inputs.len());
    for input in &inputs {
        let ticker = if cfg.round_interval {
            Ticker::aligned(
                start_time,
                cfg.interval,
                cfg.collection_jitter,
                cfg.collection_offset,
            )
        } else {
            Ticker::unaligned(cfg.interval, cfg.collection_jitter, cfg.collection_offset)
        };

        let acc: Arc<dyn Accumulator> = Arc::new(ChannelAccumulator::new(
            metric_tx.clone(),
            input.name.clone(),
        ));

        let name = input.name.clone();
        let handle = tokio::spawn(gather_loop(
            cancel.clone(),
            acc,
            Arc::clone(input),
            ticker,
            cfg.interval,
        ));
        tasks.push((name, handle));
    }

    // The gather loops and service inputs now hold the only senders; drop
    // ours so the channel closes once every producer is done.
    drop(metric_tx);

    for (name, handle) in tasks {
        if let Err(e) = handle.await {
            if e.is_panic() {
                error!(input = %name, panic = %panic_message(e), "input gather loop panicked");
            }
        }
    }

    debug!("stopping service inputs");
    for input in &inputs {
        input.stop_service().await;
    }

    debug!("input channel closed");
}

fn panic_message(err: JoinError) -> String {
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Per-input collection loop: gather on each tick until cancelled.
async fn gather_loop(
    cancel: CancellationToken,
    acc: Arc<dyn Accumulator>,
    input: Arc<RunningInput>,
    mut ticker: Ticker,
    interval: Duration,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            tick = ticker.elapsed() => {
                if tick.is_none() {
                    return;
                }
                if let Err(e) = gather_once(acc.as_ref(), &input, &mut ticker, interval).await {
                    acc.add_error(e);
                }
            }
        }
    }
}

/// Runs a single collection while watching the clock.
///
/// The gather is never cancelled: a collection overrunning its interval logs
/// a warning each interval it is still outstanding, and collections that
/// come due while it runs are skipped.
async fn gather_once(
    acc: &dyn Accumulator,
    input: &RunningInput,
    ticker: &mut Ticker,
    interval: Duration,
) -> Result<()> {
    let gather = input.gather(acc);
    tokio::pin!(gather);

    // Warn only after a full interval, even if this collection started late.
    let mut slow_warning = tokio::time::interval_at(Instant::now() + interval, interval);
    slow_warning.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            res = &mut gather => return res,
            _ = slow_warning.tick() => {
                warn!(
                    input = %input.name,
                    interval = ?interval,
                    "collection took longer than expected; not complete after interval",
                );
            }
            tick = ticker.elapsed() => {
                if tick.is_some() {
                    debug!(
                        input = %input.name,
                        "previous collection has not completed; scheduled collection skipped",
                    );
                }
            }
        }
    }
}

/// Output driver: spawns one flush loop per output, then fans every metric
/// from the shared channel out to all outputs.
///
/// The last output receives the original metric; the rest get deep clones.
async fn run_outputs(
    outputs: Vec<Arc<RunningOutput>>,
    mut metric_rx: mpsc::Receiver<Box<dyn Metric>>,
    flush_interval: Duration,
    flush_jitter: Duration,
) {
    let cancel = CancellationToken::new();

    let mut tasks = Vec::with_capacity(outputs.len());
    for output in &outputs {
        let ticker = Ticker::rolling(flush_interval, flush_jitter);
        tasks.push(tokio::spawn(flush_loop(
            cancel.clone(),
            Arc::clone(output),
            ticker,
        )));
    }

    while let Some(metric) = metric_rx.recv().await {
        fan_out(&outputs, metric);
    }

    info!("flushing buffered metrics before shutdown");
    cancel.cancel();
    for task in tasks {
        let _ = task.await;
    }

    info!("stopping outputs");
    for output in &outputs {
        output.close().await;
    }
}

fn fan_out(outputs: &[Arc<RunningOutput>], metric: Box<dyn Metric>) {
    let Some((last, rest)) = outputs.split_last() else {
        return;
    };

    for output in rest {
        output.add_metric(metric.clone_metric());
    }
    last.add_metric(metric);
}

/// Per-output flush loop.
///
/// Shutdown is checked eagerly before the main select so cancellation wins
/// even when other arms are continuously ready. The flush-request channel is
/// a reserved hook: the sender stays bound but nothing signals it.
async fn flush_loop(cancel: CancellationToken, output: Arc<RunningOutput>, mut ticker: Ticker) {
    let (_flush_request_tx, mut flush_requested) = mpsc::channel::<Instant>(1);

    let mut batch_ready = output.take_batch_ready();

    loop {
        if cancel.is_cancelled() {
            log_write_error(&output, flush_once(&output, &mut ticker).await);
            return;
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                log_write_error(&output, flush_once(&output, &mut ticker).await);
                return;
            }
            _ = ticker.elapsed() => {
                log_write_error(&output, flush_once(&output, &mut ticker).await);
            }
            _ = flush_requested.recv() => {
                log_write_error(&output, flush_once(&output, &mut ticker).await);
            }
            _ = batch_ready.recv() => {
                log_write_error(&output, flush_batch(&output).await);
            }
        }
    }
}

/// Runs a full-buffer write, logging when it overruns the flush interval.
/// There is no write timeout; the write runs until it returns.
async fn flush_once(output: &RunningOutput, ticker: &mut Ticker) -> Result<()> {
    let write = output.write();
    tokio::pin!(write);

    loop {
        tokio::select! {
            res = &mut write => {
                output.log_buffer_status();
                return res;
            }
            _ = ticker.elapsed() => {
                warn!(output = %output.name, "did not complete within its flush interval");
                output.log_buffer_status();
            }
        }
    }
}

async fn flush_batch(output: &RunningOutput) -> Result<()> {
    let res = output.write_batch().await;
    output.log_buffer_status();
    res
}

fn log_write_error(output: &RunningOutput, res: Result<()>) {
    if let Err(e) = res {
        error!(output = %output.name, error = %e, "error writing metrics");
    }
}
