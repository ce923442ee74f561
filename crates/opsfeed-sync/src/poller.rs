//! Periodic reconciliation driver, paused while the consumer is hidden.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::engine::{NotificationEngine, RefreshOutcome};

#[derive(Debug, Clone, Copy)]
pub struct PollerConfig {
    pub interval: Duration,
    /// Floor between two actual fetches when visibility flips back on.
    pub min_interval: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            min_interval: Duration::from_secs(30),
        }
    }
}

pub struct PollerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    /// Clear the timer. No pass is scheduled after this returns.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        let _ = self.task.await;
        info!("poller stopped");
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

pub struct Poller;

impl Poller {
    /// Run one pass immediately, then every `interval` while visible.
    pub fn spawn(engine: Arc<NotificationEngine>, config: PollerConfig) -> PollerHandle {
        let (stop, mut stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            log_outcome(engine.refresh_now().await);

            let period = config.interval.max(Duration::from_millis(1));
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut visibility = engine.visibility();

            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {
                        if !engine.is_visible() {
                            debug!("consumer hidden; skipping poll cycle");
                            continue;
                        }
                        log_outcome(engine.refresh_now().await);
                    }
                    changed = visibility.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let visible = *visibility.borrow_and_update();
                        if visible && engine.poll_due(config.min_interval) {
                            debug!("consumer visible again; polling now");
                            log_outcome(engine.refresh_now().await);
                        }
                    }
                }
                if engine.is_disposed() {
                    break;
                }
            }
        });
        PollerHandle { stop, task }
    }
}

fn log_outcome(outcome: RefreshOutcome) {
    match outcome {
        RefreshOutcome::Completed(report) => {
            debug!(run_id = %report.run_id, created = report.created, "poll cycle finished")
        }
        RefreshOutcome::AlreadyInFlight => debug!("poll cycle skipped; pass in flight"),
        RefreshOutcome::Disposed => debug!("poll cycle dropped; engine disposed"),
    }
}
