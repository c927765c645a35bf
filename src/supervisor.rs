use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::agent::{Agent, RunCancelled};
use crate::config::Config;
use crate::plugin;

/// Runs agent generations until told to stop.
///
/// Each generation loads the configuration, builds the plugin set, and runs
/// one agent under a fresh cancellation scope. SIGHUP cancels the current
/// generation and starts the next one (config reload); SIGINT, SIGTERM, or
/// the programmatic stop token end the loop. A non-cancellation agent error
/// terminates the process.
pub struct Supervisor {
    config_path: PathBuf,
    stop: CancellationToken,
}

impl Supervisor {
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            stop: CancellationToken::new(),
        }
    }

    /// Token that stops the supervisor (and the running agent) when
    /// cancelled.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub async fn run(&self) -> Result<()> {
        loop {
            let cancel = CancellationToken::new();
            let reload = Arc::new(AtomicBool::new(false));

            let watcher = tokio::spawn(watch_signals(
                cancel.clone(),
                self.stop.clone(),
                Arc::clone(&reload),
            ));

            let result = self.run_agent(cancel.clone()).await;

            // The agent may have ended on its own (startup failure, drained
            // pipeline); release the watcher either way.
            cancel.cancel();
            watcher.abort();
            let _ = watcher.await;

            match result {
                Ok(()) => {}
                Err(e) if e.is::<RunCancelled>() => {}
                Err(e) => return Err(e.context("error running agent")),
            }

            if !reload.load(Ordering::SeqCst) {
                return Ok(());
            }
            info!("reloading configuration");
        }
    }

    async fn run_agent(&self, cancel: CancellationToken) -> Result<()> {
        let cfg = Config::load(&self.config_path)?;

        let (inputs, outputs) = plugin::load_plugins(&cfg)?;
        info!(
            inputs = inputs.len(),
            outputs = outputs.len(),
            "starting agent",
        );

        let agent = Agent::new(cfg.agent, inputs, outputs);
        agent.run(cancel).await
    }
}

/// Waits for one stop or reload trigger, then cancels the current agent
/// generation.
async fn watch_signals(cancel: CancellationToken, stop: CancellationToken, reload: Arc<AtomicBool>) {
    let mut sighup = signal(SignalKind::hangup()).expect("failed to register SIGHUP handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            info!("received SIGTERM, shutting down");
        }
        _ = sighup.recv() => {
            info!("received SIGHUP, reloading config");
            reload.store(true, Ordering::SeqCst);
        }
        _ = stop.cancelled() => {}
    }

    cancel.cancel();
}
