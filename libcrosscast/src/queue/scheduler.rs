//! Periodic refresh scan trigger

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::queue::{EnqueueOutcome, JobQueue};

/// Enqueues a refresh scan every `period`
///
/// The first scan is queued immediately. Ticks missed while the runtime was
/// busy are skipped rather than replayed.
pub struct RefreshScheduler {
    queue: Arc<JobQueue>,
    period: Duration,
}

impl RefreshScheduler {
    pub fn new(queue: Arc<JobQueue>, period: Duration) -> Self {
        Self { queue, period }
    }

    /// Tick until `shutdown` flips to `true` or its sender is dropped
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(period = %humantime::format_duration(self.period), "Refresh scheduler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = chrono::Utc::now().timestamp();
                    match self.queue.enqueue_refresh(now) {
                        Ok(EnqueueOutcome::Enqueued) => debug!(now, "Queued refresh scan"),
                        Ok(EnqueueOutcome::Duplicate) => debug!("Refresh scan already pending"),
                        Err(e) => {
                            warn!(error = %e, "Could not queue refresh scan");
                            break;
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Refresh scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;

    #[tokio::test]
    async fn test_first_tick_queues_scan_and_shutdown_stops() {
        let (queue, mut receivers) = JobQueue::new(&[], &QueueConfig::default());
        let queue = Arc::new(queue);
        let (tx, rx) = watch::channel(false);

        let scheduler = RefreshScheduler::new(Arc::clone(&queue), Duration::from_secs(3600));
        let handle = tokio::spawn(scheduler.run(rx));

        let job = receivers.refresh.recv().await.unwrap();
        assert!(job.scheduled_at > 0);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_stops_when_queue_closed() {
        let (queue, _receivers) = JobQueue::new(&[], &QueueConfig::default());
        let queue = Arc::new(queue);
        queue.close();

        let (_tx, rx) = watch::channel(false);
        RefreshScheduler::new(queue, Duration::from_secs(3600))
            .run(rx)
            .await;
    }
}
