//! Durable wake scheduler.
//!
//! Timers, step timeouts and escalations are persisted as `ScheduledWake`
//! rows rather than in-memory timers, so they survive restarts. The
//! `WakeScheduler` polls the repository on a fixed interval and asks the
//! engine to fire every wake whose due time has passed.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::executor::WorkflowEngine;
use crate::repository::execution::ExecutionRepository;

/// Polling loop around [`WorkflowEngine::process_due_wakes`].
pub struct WakeScheduler<R: ExecutionRepository> {
    engine: Arc<WorkflowEngine<R>>,
    interval: Duration,
}

impl<R: ExecutionRepository + 'static> WakeScheduler<R> {
    /// Poll at the engine's configured `wake_poll_interval_ms`.
    pub fn new(engine: Arc<WorkflowEngine<R>>) -> Self {
        let interval = Duration::from_millis(engine.config().wake_poll_interval_ms.max(1));
        Self { engine, interval }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Fire due wakes until `token` is cancelled.
    pub async fn run(self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval_ms = self.interval.as_millis() as u64, "wake scheduler started");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let now = self.engine.clock().now();
                    match self.engine.process_due_wakes(now).await {
                        Ok(0) => {}
                        Ok(fired) => tracing::debug!(fired, "fired due wakes"),
                        Err(e) => tracing::warn!(error = %e, "wake poll failed"),
                    }
                }
            }
        }

        tracing::info!("wake scheduler stopped");
    }

    /// Run on a background task.
    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(token))
    }
}
