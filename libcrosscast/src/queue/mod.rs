//! In-process job queue
//!
//! Publishing to slow external platforms happens off the request path: the
//! post service enqueues one [`Job`] per target and a [`worker::WorkerPool`]
//! drains the per-platform channels. Platforms flagged synchronous in
//! configuration never get a channel and are dispatched inline instead.
//!
//! A second channel carries refresh scan jobs produced by the
//! [`scheduler::RefreshScheduler`].

pub mod scheduler;
pub mod worker;

use async_trait::async_trait;
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

use crate::config::QueueConfig;
use crate::error::{CrosscastError, DomainError, Result};
use crate::types::Platform;

const REFRESH_CHANNEL_CAPACITY: usize = 1;

/// Request to publish one target of a post
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub platform: Platform,
    pub user_id: String,
    pub post_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub social_account_id: Option<String>,
}

impl Job {
    fn key(&self) -> JobKey {
        (
            self.post_id.clone(),
            self.platform,
            self.social_account_id.clone(),
        )
    }
}

/// Request to scan for expiring credentials
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshJob {
    /// Unix seconds the scan was scheduled at
    pub scheduled_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// A live job for the same target already exists
    Duplicate,
}

/// Called when a job has exhausted its attempts
#[async_trait]
pub trait JobFailureHook: Send + Sync {
    async fn on_job_failed(&self, job: &Job, error: &DomainError) -> Result<()>;
}

type JobKey = (String, Platform, Option<String>);

/// Receiving halves handed to the worker pool
pub struct QueueReceivers {
    pub jobs: HashMap<Platform, mpsc::Receiver<Job>>,
    pub refresh: mpsc::Receiver<RefreshJob>,
}

pub struct JobQueue {
    senders: RwLock<HashMap<Platform, mpsc::Sender<Job>>>,
    refresh: RwLock<Option<mpsc::Sender<RefreshJob>>>,
    live: DashSet<JobKey>,
    synchronous: Vec<Platform>,
}

impl JobQueue {
    /// Create a queue with one channel per non-synchronous platform in
    /// `platforms`, plus the refresh channel
    pub fn new(platforms: &[Platform], config: &QueueConfig) -> (Self, QueueReceivers) {
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();

        for platform in platforms {
            if config.is_synchronous(*platform) || senders.contains_key(platform) {
                continue;
            }
            let (tx, rx) = mpsc::channel(config.capacity);
            senders.insert(*platform, tx);
            receivers.insert(*platform, rx);
        }

        let (refresh_tx, refresh_rx) = mpsc::channel(REFRESH_CHANNEL_CAPACITY);

        let queue = Self {
            senders: RwLock::new(senders),
            refresh: RwLock::new(Some(refresh_tx)),
            live: DashSet::new(),
            synchronous: config.synchronous_platforms.clone(),
        };
        let receivers = QueueReceivers {
            jobs: receivers,
            refresh: refresh_rx,
        };
        (queue, receivers)
    }

    pub fn is_synchronous(&self, platform: Platform) -> bool {
        self.synchronous.contains(&platform)
    }

    /// Whether jobs for `platform` are accepted by a worker channel
    pub fn has_worker(&self, platform: Platform) -> bool {
        self.senders
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(&platform)
    }

    /// Platforms with an open job channel
    pub fn queued_platforms(&self) -> Vec<Platform> {
        let senders = self.senders.read().unwrap_or_else(|p| p.into_inner());
        Platform::ALL
            .into_iter()
            .filter(|p| senders.contains_key(p))
            .collect()
    }

    pub async fn enqueue(&self, job: Job) -> Result<EnqueueOutcome> {
        if self.is_synchronous(job.platform) {
            return Err(CrosscastError::bad_request(format!(
                "{} posts are dispatched synchronously",
                job.platform
            )));
        }

        let sender = self
            .senders
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&job.platform)
            .cloned()
            .ok_or_else(|| {
                CrosscastError::bad_request(format!("No worker running for {}", job.platform))
            })?;

        let key = job.key();
        if !self.live.insert(key.clone()) {
            debug!(post_id = %job.post_id, platform = %job.platform, "Job already queued");
            return Ok(EnqueueOutcome::Duplicate);
        }

        let platform = job.platform;
        if sender.send(job).await.is_err() {
            self.live.remove(&key);
            return Err(CrosscastError::bad_request(format!(
                "Queue for {} is closed",
                platform
            )));
        }
        Ok(EnqueueOutcome::Enqueued)
    }

    /// Queue a refresh scan unless one is already waiting
    pub fn enqueue_refresh(&self, scheduled_at: i64) -> Result<EnqueueOutcome> {
        let sender = self
            .refresh
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .ok_or_else(|| CrosscastError::bad_request("Refresh queue is closed"))?;

        match sender.try_send(RefreshJob { scheduled_at }) {
            Ok(()) => Ok(EnqueueOutcome::Enqueued),
            Err(TrySendError::Full(_)) => Ok(EnqueueOutcome::Duplicate),
            Err(TrySendError::Closed(_)) => {
                Err(CrosscastError::bad_request("Refresh queue is closed"))
            }
        }
    }

    /// Release the dedupe slot held by a finished job
    pub fn complete(&self, job: &Job) {
        self.live.remove(&job.key());
    }

    /// Whether a job for the same target is queued or running
    pub fn is_live(&self, job: &Job) -> bool {
        self.live.contains(&job.key())
    }

    pub fn live_jobs(&self) -> usize {
        self.live.len()
    }

    /// Stop accepting work. Jobs already queued are still delivered.
    pub fn close(&self) {
        self.senders
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
        self.refresh
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(platform: Platform, account: Option<&str>) -> Job {
        Job {
            platform,
            user_id: "user-1".to_string(),
            post_id: "post-1".to_string(),
            social_account_id: account.map(str::to_string),
        }
    }

    #[test]
    fn test_job_json_shape() {
        let json = serde_json::to_value(job(Platform::Tiktok, Some("acct-1"))).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "platform": "tiktok",
                "userId": "user-1",
                "postId": "post-1",
                "socialAccountId": "acct-1"
            })
        );

        let parsed: Job =
            serde_json::from_str(r#"{"platform":"x","userId":"u","postId":"p"}"#).unwrap();
        assert_eq!(parsed.social_account_id, None);
    }

    #[tokio::test]
    async fn test_enqueue_and_dedupe() {
        let config = QueueConfig::default();
        let (queue, mut receivers) = JobQueue::new(&[Platform::Facebook], &config);

        let first = queue
            .enqueue(job(Platform::Facebook, Some("acct-1")))
            .await
            .unwrap();
        let second = queue
            .enqueue(job(Platform::Facebook, Some("acct-1")))
            .await
            .unwrap();
        let other_account = queue
            .enqueue(job(Platform::Facebook, Some("acct-2")))
            .await
            .unwrap();

        assert_eq!(first, EnqueueOutcome::Enqueued);
        assert_eq!(second, EnqueueOutcome::Duplicate);
        assert_eq!(other_account, EnqueueOutcome::Enqueued);
        assert_eq!(queue.live_jobs(), 2);

        let rx = receivers.jobs.get_mut(&Platform::Facebook).unwrap();
        let received = rx.recv().await.unwrap();
        queue.complete(&received);

        let again = queue
            .enqueue(job(Platform::Facebook, Some("acct-1")))
            .await
            .unwrap();
        assert_eq!(again, EnqueueOutcome::Enqueued);
    }

    #[tokio::test]
    async fn test_synchronous_platform_is_rejected() {
        let config = QueueConfig::default();
        let (queue, receivers) = JobQueue::new(&[Platform::X, Platform::Facebook], &config);

        assert!(!receivers.jobs.contains_key(&Platform::X));
        assert!(!queue.has_worker(Platform::X));
        assert!(queue.has_worker(Platform::Facebook));
        assert_eq!(queue.queued_platforms(), vec![Platform::Facebook]);

        let err = queue.enqueue(job(Platform::X, None)).await.unwrap_err();
        assert!(matches!(
            err,
            CrosscastError::Domain(DomainError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_platform_without_worker_is_rejected() {
        let (queue, _receivers) = JobQueue::new(&[], &QueueConfig::default());
        let err = queue
            .enqueue(job(Platform::Pinterest, None))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("No worker running for pinterest"));
    }

    #[tokio::test]
    async fn test_refresh_channel_coalesces() {
        let (queue, mut receivers) = JobQueue::new(&[], &QueueConfig::default());

        assert_eq!(queue.enqueue_refresh(1).unwrap(), EnqueueOutcome::Enqueued);
        assert_eq!(queue.enqueue_refresh(2).unwrap(), EnqueueOutcome::Duplicate);
        assert_eq!(receivers.refresh.recv().await.unwrap().scheduled_at, 1);
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let (queue, mut receivers) = JobQueue::new(&[Platform::Threads], &QueueConfig::default());
        queue.enqueue(job(Platform::Threads, None)).await.unwrap();
        queue.close();

        assert!(queue.enqueue(job(Platform::Threads, Some("a"))).await.is_err());
        assert!(queue.enqueue_refresh(1).is_err());

        let rx = receivers.jobs.get_mut(&Platform::Threads).unwrap();
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
        assert!(receivers.refresh.recv().await.is_none());
    }
}
