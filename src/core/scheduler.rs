use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::batch::BatchRunner;
use super::models::DeviceDescriptor;
use super::notifications::{BackupEvent, NotificationChannel};
use super::report;

/// Daemon loop: run a batch, sleep `period`, repeat until cancelled.
///
/// Cancellation is only observed between batches and during the sleep; a
/// running batch always completes first.
pub struct Scheduler {
    runner: Arc<BatchRunner>,
    devices: Vec<DeviceDescriptor>,
    period: Duration,
    notifiers: Vec<Arc<dyn NotificationChannel>>,
}

impl Scheduler {
    pub fn new(runner: Arc<BatchRunner>, devices: Vec<DeviceDescriptor>, period: Duration) -> Self {
        Self {
            runner,
            devices,
            period,
            notifiers: Vec::new(),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationChannel>) -> Self {
        self.notifiers.push(notifier);
        self
    }

    /// Returns the number of batches that ran.
    pub async fn run(&self, stop: CancellationToken) -> u64 {
        info!(
            devices = self.devices.len(),
            period_secs = self.period.as_secs(),
            "Scheduler started"
        );

        let mut iteration: u64 = 0;

        while !stop.is_cancelled() {
            iteration += 1;
            info!(iteration, "Running scheduled backup batch");

            let event = match self.runner.run(&self.devices).await {
                Ok(result) => {
                    report::log_summary(&result);
                    BackupEvent::BatchCompleted { iteration, result }
                }
                Err(e) => {
                    // A broken inventory fails this batch only; the daemon keeps going.
                    error!(iteration, error = %e, "Backup batch aborted");
                    BackupEvent::BatchAborted {
                        iteration,
                        error: e.to_string(),
                    }
                }
            };
            self.dispatch(event).await;

            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(self.period) => {}
            }
        }

        info!(batches = iteration, "Scheduler stopped");
        iteration
    }

    async fn dispatch(&self, event: BackupEvent) {
        for notifier in &self.notifiers {
            if let Err(e) = notifier.notify(event.clone()).await {
                warn!(error = %e, "Failed to send notification");
            }
        }
    }
}
