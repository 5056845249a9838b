//! Post status reconciliation
//!
//! [`StatusReconciler`] keeps a post's aggregate status in line with its
//! targets. It runs after every target outcome (as the dispatcher's
//! observer) and after a background job gives up (as the queue's failure
//! hook). The status is always recomputed from the stored target rows, so
//! concurrent reconciliations converge on the same answer.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{DomainError, Result};
use crate::queue::{Job, JobFailureHook};
use crate::repository::PostRepository;
use crate::service::dispatcher::DispatchObserver;
use crate::types::{PostStatus, TargetKey};

pub struct StatusReconciler {
    repo: Arc<dyn PostRepository>,
}

impl StatusReconciler {
    pub fn new(repo: Arc<dyn PostRepository>) -> Self {
        Self { repo }
    }

    pub async fn reconcile(&self, post_id: &str) -> Result<Option<PostStatus>> {
        let status = self.repo.recompute_post_status(post_id).await?;
        debug!(post_id, status = ?status, "Reconciled post status");
        Ok(status)
    }
}

#[async_trait]
impl DispatchObserver for StatusReconciler {
    async fn on_success(&self, _user_id: &str, post_id: &str) -> Result<()> {
        self.reconcile(post_id).await.map(|_| ())
    }

    async fn on_failure(&self, _user_id: &str, post_id: &str, _error: &DomainError) -> Result<()> {
        self.reconcile(post_id).await.map(|_| ())
    }
}

#[async_trait]
impl JobFailureHook for StatusReconciler {
    async fn on_job_failed(&self, job: &Job, error: &DomainError) -> Result<()> {
        let message = format!("job failed: {}", error);

        let keys: Vec<TargetKey> = match &job.social_account_id {
            Some(account_id) => vec![TargetKey {
                post_id: job.post_id.clone(),
                platform: job.platform,
                social_account_id: account_id.clone(),
            }],
            None => match self.repo.find_post(&job.post_id).await? {
                Some(loaded) => loaded
                    .targets
                    .iter()
                    .filter(|t| t.platform == job.platform)
                    .map(|t| t.key())
                    .collect(),
                None => Vec::new(),
            },
        };

        for key in &keys {
            if self.repo.fail_if_in_flight(key, &message).await? {
                info!(
                    post_id = %key.post_id,
                    platform = %key.platform,
                    "Marked stuck target as failed"
                );
            }
        }

        self.reconcile(&job.post_id).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::repository::TargetUpdate;
    use crate::types::{Platform, Post, Target, TargetStatus};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_failure_hook_fails_stuck_target_only() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Arc::new(Database::new(db_path.to_str().unwrap()).await.unwrap());

        let mut post = Post::new("user-1", "Stuck");
        post.status = PostStatus::Posting;
        let stuck = Target::new(&post.id, Platform::Tiktok, "acct-t");
        let done = Target::new(&post.id, Platform::Facebook, "acct-f");
        db.create_post(&post, &[stuck.clone(), done.clone()])
            .await
            .unwrap();
        db.update_target(&stuck.key(), &TargetUpdate::posting())
            .await
            .unwrap();
        db.update_target(&done.key(), &TargetUpdate::success("fb-1"))
            .await
            .unwrap();

        let reconciler = StatusReconciler::new(db.clone());
        let job = Job {
            platform: Platform::Tiktok,
            user_id: "user-1".to_string(),
            post_id: post.id.clone(),
            social_account_id: None,
        };
        let error = DomainError::Unknown {
            message: "Job timed out after 5m".to_string(),
            transient: true,
        };
        reconciler.on_job_failed(&job, &error).await.unwrap();

        let loaded = db.find_post(&post.id).await.unwrap().unwrap();
        assert_eq!(loaded.post.status, PostStatus::PartiallyDone);

        let tiktok = loaded
            .targets
            .iter()
            .find(|t| t.platform == Platform::Tiktok)
            .unwrap();
        assert_eq!(tiktok.status, TargetStatus::Failed);
        assert_eq!(
            tiktok.error_message.as_deref(),
            Some("job failed: Job timed out after 5m")
        );

        let facebook = loaded
            .targets
            .iter()
            .find(|t| t.platform == Platform::Facebook)
            .unwrap();
        assert_eq!(facebook.status, TargetStatus::Success);
    }
}
