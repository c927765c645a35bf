use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

/// Cadence source for gather and flush scheduling.
///
/// Each variant runs a background timing task feeding a single-slot channel
/// through non-blocking sends: a consumer that falls behind sees at most one
/// queued tick, never a burst. Dropping the ticker stops the task.
pub struct Ticker {
    ticks: mpsc::Receiver<Instant>,
    cancel: CancellationToken,
}

impl Ticker {
    /// Ticker aligned to wall boundaries: the k-th tick fires at
    /// `start + k * interval + offset` plus a fresh jitter sample.
    ///
    /// Used for collection when `round_interval` is set, so agents on many
    /// hosts sample at the same wall-clock instants (offset and jitter then
    /// spread the load).
    pub fn aligned(start: Instant, interval: Duration, jitter: Duration, offset: Duration) -> Self {
        Self::spawn(move |cancel, ticks| async move {
            let mut boundary = start + interval;
            loop {
                let due = boundary + offset + sample_jitter(jitter);
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = sleep_until(due) => {
                        let _ = ticks.try_send(Instant::now());
                    }
                }
                boundary += interval;
            }
        })
    }

    /// Ticker free of wall alignment: first tick after `offset` plus jitter,
    /// then every `interval` plus a fresh jitter sample.
    pub fn unaligned(interval: Duration, jitter: Duration, offset: Duration) -> Self {
        Self::spawn(move |cancel, ticks| async move {
            let mut due = Instant::now() + offset + sample_jitter(jitter);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = sleep_until(due) => {
                        let _ = ticks.try_send(Instant::now());
                    }
                }
                due = Instant::now() + interval + sample_jitter(jitter);
            }
        })
    }

    /// Ticker that schedules each tick relative to when the previous one
    /// fired: `interval` plus a fresh jitter sample after the last firing.
    ///
    /// Used for flushing, where a slow write should push the next flush out
    /// rather than letting timed flushes pile up behind it.
    pub fn rolling(interval: Duration, jitter: Duration) -> Self {
        Self::spawn(move |cancel, ticks| async move {
            loop {
                let due = Instant::now() + interval + sample_jitter(jitter);
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = sleep_until(due) => {
                        let _ = ticks.try_send(Instant::now());
                    }
                }
            }
        })
    }

    fn spawn<F, Fut>(task: F) -> Self
    where
        F: FnOnce(CancellationToken, mpsc::Sender<Instant>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        tokio::spawn(task(cancel.clone(), tx));

        Self { ticks: rx, cancel }
    }

    /// Waits for the next tick. Returns `None` once the ticker has been
    /// stopped and its pending tick (if any) consumed.
    pub async fn elapsed(&mut self) -> Option<Instant> {
        self.ticks.recv().await
    }

    /// Stops the timing task. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn sample_jitter(jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return Duration::ZERO;
    }

    let nanos = rand::thread_rng().gen_range(0..=jitter.as_nanos());
    Duration::from_nanos(nanos as u64)
}
