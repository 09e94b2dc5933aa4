//! Scan scheduler
//!
//! Runs one cycle immediately on start, then one per interval. A cycle
//! that fails or panics is logged and the loop keeps ticking.

use super::orchestrator::ZoneScanOrchestrator;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct RunningLoop {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct ScanScheduler {
    orchestrator: Arc<ZoneScanOrchestrator>,
    interval: Duration,
    state: Mutex<Option<RunningLoop>>,
}

impl ScanScheduler {
    pub fn new(orchestrator: Arc<ZoneScanOrchestrator>, interval: Duration) -> Self {
        Self {
            orchestrator,
            interval,
            state: Mutex::new(None),
        }
    }

    /// Spawn the loop; `false` if it was already running
    pub async fn start(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.is_some() {
            tracing::debug!("Scan scheduler already running");
            return false;
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_loop(
            Arc::clone(&self.orchestrator),
            self.interval,
            cancel.clone(),
        ));
        *state = Some(RunningLoop { cancel, task });

        tracing::info!(interval_secs = self.interval.as_secs(), "Scan scheduler started");
        true
    }

    /// Cancel the loop and wait for it to finish; `false` if it was not running
    pub async fn stop(&self) -> bool {
        let mut state = self.state.lock().await;
        let Some(running) = state.take() else {
            return false;
        };

        running.cancel.cancel();
        if let Err(e) = running.task.await {
            tracing::error!(error = %e, "Scan loop terminated abnormally");
        }

        tracing::info!("Scan scheduler stopped");
        true
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.is_some()
    }
}

async fn run_loop(
    orchestrator: Arc<ZoneScanOrchestrator>,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            outcome = AssertUnwindSafe(orchestrator.run_cycle()).catch_unwind() => match outcome {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "Scan cycle failed"),
                Err(_) => tracing::error!("Scan cycle panicked"),
            },
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    tracing::debug!("Scan loop exited");
}
