use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::clock;
use crate::session::manager::SessionManager;

/// How often the live session is asked whether it has gone quiet.
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// Background quiescence probe.
///
/// Wakes every tick (or immediately on shutdown) and runs the manager's
/// two-phase convergence check. Holds no locks itself; all synchronization
/// lives in [`SessionManager::poll_quiescence`].
pub struct QuiescenceTicker {
    period: Duration,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl Default for QuiescenceTicker {
    fn default() -> Self {
        Self::new(DEFAULT_TICK)
    }
}

impl QuiescenceTicker {
    pub fn new(period: Duration) -> Self {
        Self { period, task: None }
    }

    /// Spawn the tick loop. The loop exits promptly when `cancel` fires.
    pub fn start(&mut self, manager: Arc<SessionManager>, cancel: CancellationToken) {
        let period = self.period;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // Consume the immediate first tick.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("quiescence ticker stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        if manager.poll_quiescence(clock::now_ms()) {
                            debug!("quiescence tick finalized a session");
                        }
                    }
                }
            }
        });

        self.task = Some(handle);
    }

    /// Wait for the tick loop to finish. Requires `cancel` to have fired.
    /// Stopping an unstarted or already-stopped ticker is a no-op.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(handle) = self.task.take() {
            handle.await.context("waiting for quiescence ticker")?;
        }
        Ok(())
    }
}
