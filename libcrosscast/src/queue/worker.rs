//! Worker pool draining the job queue
//!
//! One task per queued platform plus one refresh task. A publish worker runs
//! up to `concurrency` jobs at once; each job is attempted up to
//! `max_attempts` times with exponential backoff between retryable failures.
//! An attempt that outlives `job_timeout` is abandoned and counts as a
//! retryable failure.
//!
//! When a job gives up, the [`JobFailureHook`] runs so no target is left
//! `Posting` forever.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::error::DomainError;
use crate::queue::scheduler::RefreshScheduler;
use crate::queue::{Job, JobFailureHook, JobQueue, QueueReceivers, RefreshJob};
use crate::service::dispatcher::{DispatchOutcome, PublishDispatcher};
use crate::service::events::{Event, EventBus};
use crate::service::refresh::TokenRefresher;
use crate::types::Platform;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles on every further attempt
    pub backoff_base: Duration,
    pub job_timeout: Duration,
    pub concurrency: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from(&QueueConfig::default())
    }
}

impl From<&QueueConfig> for WorkerConfig {
    fn from(config: &QueueConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff_base: config.backoff_base,
            job_timeout: config.job_timeout,
            concurrency: config.concurrency.max(1),
        }
    }
}

/// Services the workers call into
#[derive(Clone)]
pub struct WorkerContext {
    pub dispatcher: PublishDispatcher,
    pub refresher: Arc<TokenRefresher>,
    pub failure_hook: Arc<dyn JobFailureHook>,
    pub event_bus: EventBus,
}

struct Shared {
    context: WorkerContext,
    config: WorkerConfig,
    queue: Arc<JobQueue>,
}

pub struct WorkerPool {
    queue: Arc<JobQueue>,
    handles: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl WorkerPool {
    /// Spawn one worker per job channel and one refresh worker
    pub fn start(
        queue: Arc<JobQueue>,
        receivers: QueueReceivers,
        context: WorkerContext,
        config: WorkerConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            context,
            config,
            queue: Arc::clone(&queue),
        });

        let mut handles = Vec::with_capacity(receivers.jobs.len() + 1);
        for (platform, rx) in receivers.jobs {
            info!(%platform, concurrency = shared.config.concurrency, "Starting publish worker");
            handles.push(tokio::spawn(run_publish_worker(
                platform,
                rx,
                Arc::clone(&shared),
            )));
        }
        handles.push(tokio::spawn(run_refresh_worker(
            receivers.refresh,
            Arc::clone(&shared.context.refresher),
        )));

        Self {
            queue,
            handles,
            shutdown,
        }
    }

    /// Run a refresh scheduler until the pool shuts down
    pub fn spawn_scheduler(&mut self, scheduler: RefreshScheduler) {
        let signal = self.shutdown.subscribe();
        self.handles.push(tokio::spawn(scheduler.run(signal)));
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// Close the queue, let queued and in-flight jobs finish, and join every task
    pub async fn shutdown(self) {
        info!("Shutting down worker pool");
        self.queue.close();
        let _ = self.shutdown.send(true);

        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task panicked");
            }
        }
        info!("Worker pool stopped");
    }
}

async fn run_publish_worker(platform: Platform, mut rx: mpsc::Receiver<Job>, shared: Arc<Shared>) {
    let limit = shared.config.concurrency;
    let semaphore = Arc::new(Semaphore::new(limit));

    while let Some(job) = rx.recv().await {
        let permit = match Arc::clone(&semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let shared = Arc::clone(&shared);
        tokio::spawn(async move {
            process_job(&shared, &job).await;
            shared.queue.complete(&job);
            drop(permit);
        });
    }

    // Wait for in-flight jobs by reclaiming every permit
    if semaphore.acquire_many(limit as u32).await.is_err() {
        warn!(%platform, "Worker semaphore closed early");
    }
    info!(%platform, "Publish worker stopped");
}

async fn process_job(shared: &Shared, job: &Job) {
    let config = &shared.config;
    let mut attempt = 0;

    loop {
        attempt += 1;
        let sent = timeout(
            config.job_timeout,
            shared.context.dispatcher.send_post(
                &job.user_id,
                &job.post_id,
                job.platform,
                job.social_account_id.as_deref(),
            ),
        )
        .await;

        let error = match sent {
            Ok(Ok(DispatchOutcome::Published { platform_post_id })) => {
                debug!(
                    post_id = %job.post_id,
                    platform = %job.platform,
                    attempt,
                    %platform_post_id,
                    "Job completed"
                );
                return;
            }
            Ok(Ok(DispatchOutcome::SkippedDraft)) => {
                debug!(post_id = %job.post_id, "Job skipped for draft post");
                return;
            }
            Ok(Err(e)) => e,
            Err(_) => DomainError::Unknown {
                message: format!(
                    "Job timed out after {}",
                    humantime::format_duration(config.job_timeout)
                ),
                transient: true,
            },
        };

        if error.is_retryable() && attempt < config.max_attempts {
            let delay = backoff_delay(config.backoff_base, attempt);
            warn!(
                post_id = %job.post_id,
                platform = %job.platform,
                attempt,
                max_attempts = config.max_attempts,
                error = %error,
                "Job attempt failed, retrying in {}",
                humantime::format_duration(delay)
            );
            sleep(delay).await;
            continue;
        }

        error!(
            post_id = %job.post_id,
            platform = %job.platform,
            attempt,
            code = error.code(),
            error = %error,
            "Job failed"
        );
        shared.context.event_bus.emit(Event::JobFailed {
            post_id: job.post_id.clone(),
            platform: job.platform,
            social_account_id: job.social_account_id.clone(),
            attempts: attempt,
            error: error.to_string(),
        });
        if let Err(e) = shared.context.failure_hook.on_job_failed(job, &error).await {
            error!(post_id = %job.post_id, error = %e, "Job failure hook failed");
        }
        return;
    }
}

async fn run_refresh_worker(mut rx: mpsc::Receiver<RefreshJob>, refresher: Arc<TokenRefresher>) {
    while let Some(job) = rx.recv().await {
        let now = chrono::Utc::now().timestamp();
        debug!(scheduled_at = job.scheduled_at, "Running refresh scan");
        if let Err(e) = refresher.refresh_expiring(now).await {
            error!(error = %e, "Refresh scan failed");
        }
    }
    info!("Refresh worker stopped");
}

/// Delay before attempt `attempt + 1`
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(4));
    }

    #[test]
    fn test_backoff_saturates() {
        let delay = backoff_delay(Duration::from_secs(u64::MAX / 2), 40);
        assert_eq!(delay, Duration::MAX);
    }

    #[test]
    fn test_worker_config_from_queue_config() {
        let config = WorkerConfig::from(&QueueConfig {
            max_attempts: 0,
            concurrency: 0,
            ..QueueConfig::default()
        });
        assert_eq!(config.max_attempts, 1);
        assert_eq!(config.concurrency, 1);
    }
}
