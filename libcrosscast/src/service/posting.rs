//! Post service
//!
//! The operations behind the post endpoints: create, edit, delete, dispatch
//! and retry. Publishing goes through the [`PublishDispatcher`], either inline
//! or as background jobs on the [`JobQueue`].

use futures::future::join_all;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::LimitsConfig;
use crate::error::{classify, DomainError, DomainResult, Result};
use crate::queue::{EnqueueOutcome, Job, JobQueue};
use crate::repository::PostRepository;
use crate::service::dispatcher::{DispatchOutcome, FanOutSummary, PublishDispatcher};
use crate::service::events::TargetResult;
use crate::types::{Platform, Post, PostStatus, PostWithTargets, Target, TargetStatus};

/// Due posts handled per poll
const DUE_POST_BATCH: usize = 100;

#[derive(Debug, Clone, Deserialize)]
pub struct TargetRequest {
    pub platform: Platform,
    pub social_account_id: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl TargetRequest {
    pub fn new(platform: Platform, social_account_id: impl Into<String>) -> Self {
        Self {
            platform,
            social_account_id: social_account_id.into(),
            text: None,
            title: None,
            options: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreatePostRequest {
    pub user_id: String,
    #[serde(default)]
    pub workspace_id: Option<String>,
    pub main_caption: String,
    #[serde(default)]
    pub scheduled_time: Option<i64>,
    #[serde(default)]
    pub draft: bool,
    /// Publish to every target right away and wait for the outcome
    #[serde(default)]
    pub post_now: bool,
    #[serde(default)]
    pub targets: Vec<TargetRequest>,
}

/// Fields of a post that may be edited
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PostUpdate {
    #[serde(default)]
    pub main_caption: Option<String>,
    #[serde(default)]
    pub scheduled_time: Option<i64>,
}

/// What happened to each target when a post was dispatched
#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    pub enqueued: usize,
    pub duplicates: usize,
    /// Targets published inline, in target order
    pub inline: Vec<TargetResult>,
}

#[derive(Debug, Clone)]
pub struct CreatedPost {
    pub post: PostWithTargets,
    pub fan_out: Option<FanOutSummary>,
    pub dispatch: Option<DispatchReport>,
}

#[derive(Clone)]
pub struct PostService {
    repo: Arc<dyn PostRepository>,
    dispatcher: PublishDispatcher,
    queue: Option<Arc<JobQueue>>,
    limits: LimitsConfig,
}

impl PostService {
    /// Without a queue every target is published inline
    pub fn new(
        repo: Arc<dyn PostRepository>,
        dispatcher: PublishDispatcher,
        queue: Option<Arc<JobQueue>>,
        limits: LimitsConfig,
    ) -> Self {
        Self {
            repo,
            dispatcher,
            queue,
            limits,
        }
    }

    /// Route dispatches for platforms with a running worker through `queue`
    pub fn with_queue(mut self, queue: Arc<JobQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn dispatcher(&self) -> &PublishDispatcher {
        &self.dispatcher
    }

    pub async fn create_post(&self, request: CreatePostRequest) -> DomainResult<CreatedPost> {
        self.validate(&request)?;

        let mut post = Post::new(&request.user_id, &request.main_caption);
        post.workspace_id = request.workspace_id.clone();
        post.scheduled_time = request.scheduled_time;
        post.status = if request.draft {
            PostStatus::Draft
        } else {
            PostStatus::Pending
        };

        let targets: Vec<Target> = request
            .targets
            .iter()
            .enumerate()
            .map(|(position, t)| {
                let mut target = Target::new(&post.id, t.platform, &t.social_account_id);
                target.text = t.text.clone();
                target.title = t.title.clone();
                target.options = t.options.clone();
                target.position = position as i64;
                target
            })
            .collect();

        self.repo
            .create_post(&post, &targets)
            .await
            .map_err(classify)?;
        info!(
            post_id = %post.id,
            status = %post.status,
            target_count = targets.len(),
            "Created post"
        );

        let mut fan_out = None;
        let mut dispatch = None;
        if !request.draft {
            let now = chrono::Utc::now().timestamp();
            if request.post_now {
                fan_out = Some(
                    self.dispatcher
                        .send_post_to_all_platforms(&post.user_id, &post.id)
                        .await?,
                );
            } else if post.scheduled_time.map_or(true, |t| t <= now) {
                dispatch = Some(self.dispatch_post(&post.user_id, &post.id).await?);
            } else {
                debug!(post_id = %post.id, scheduled_time = ?post.scheduled_time, "Post scheduled for later");
            }
        }

        Ok(CreatedPost {
            post: self.get_post(&post.user_id, &post.id).await?,
            fan_out,
            dispatch,
        })
    }

    fn validate(&self, request: &CreatePostRequest) -> DomainResult<()> {
        if request.targets.is_empty() && !request.draft {
            return Err(DomainError::BadRequest(
                "At least one target is required".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for target in &request.targets {
            if !seen.insert((target.platform, target.social_account_id.as_str())) {
                return Err(DomainError::Conflict(format!(
                    "Duplicate target {} / {}",
                    target.platform, target.social_account_id
                )));
            }
        }

        if request.targets.len() > self.limits.max_targets_per_post {
            return Err(DomainError::PlanLimitReached(format!(
                "A post can have at most {} targets",
                self.limits.max_targets_per_post
            )));
        }
        Ok(())
    }

    pub async fn get_post(&self, user_id: &str, post_id: &str) -> DomainResult<PostWithTargets> {
        match self.repo.find_post(post_id).await.map_err(classify)? {
            Some(loaded) if loaded.post.user_id == user_id => Ok(loaded),
            _ => Err(DomainError::NotFound(format!("Post {} not found", post_id))),
        }
    }

    /// Send every target of a post: background jobs where a worker exists,
    /// inline otherwise
    pub async fn dispatch_post(&self, user_id: &str, post_id: &str) -> DomainResult<DispatchReport> {
        let loaded = self.get_post(user_id, post_id).await?;
        if loaded.post.status == PostStatus::Draft {
            info!(post_id, "Not dispatching draft post");
            return Ok(DispatchReport::default());
        }
        if loaded.targets.is_empty() {
            return Err(DomainError::BadRequest(format!(
                "Post {} has no targets",
                post_id
            )));
        }

        self.repo.mark_posting(post_id).await.map_err(classify)?;

        let mut report = DispatchReport::default();
        let mut inline = Vec::new();
        for target in &loaded.targets {
            let queued = match &self.queue {
                Some(queue) if queue.has_worker(target.platform) => {
                    let job = Job {
                        platform: target.platform,
                        user_id: user_id.to_string(),
                        post_id: post_id.to_string(),
                        social_account_id: Some(target.social_account_id.clone()),
                    };
                    match queue.enqueue(job).await {
                        Ok(outcome) => Some(outcome),
                        Err(e) => {
                            warn!(post_id, platform = %target.platform, error = %e, "Enqueue failed, publishing inline");
                            None
                        }
                    }
                }
                _ => None,
            };

            match queued {
                Some(EnqueueOutcome::Enqueued) => report.enqueued += 1,
                Some(EnqueueOutcome::Duplicate) => report.duplicates += 1,
                None => inline.push(target),
            }
        }

        let sends = inline.iter().map(|target| async move {
            let outcome = self
                .dispatcher
                .send_post(
                    user_id,
                    post_id,
                    target.platform,
                    Some(target.social_account_id.as_str()),
                )
                .await;
            let (success, platform_post_id, error) = match outcome {
                Ok(DispatchOutcome::Published { platform_post_id }) => {
                    (true, Some(platform_post_id), None)
                }
                Ok(DispatchOutcome::SkippedDraft) => (false, None, None),
                Err(e) => (false, None, Some(e.to_string())),
            };
            TargetResult {
                platform: target.platform,
                social_account_id: target.social_account_id.clone(),
                success,
                platform_post_id,
                error,
            }
        });
        report.inline = join_all(sends).await;

        info!(
            post_id,
            enqueued = report.enqueued,
            duplicates = report.duplicates,
            inline = report.inline.len(),
            "Dispatched post"
        );
        Ok(report)
    }

    /// Dispatch every pending post whose scheduled time has come. Returns the
    /// number of posts dispatched.
    pub async fn dispatch_due_posts(&self, now: i64) -> Result<usize> {
        let due = self.repo.due_posts(now, DUE_POST_BATCH).await?;
        if due.is_empty() {
            return Ok(0);
        }

        info!(count = due.len(), "Dispatching due posts");
        let mut dispatched = 0;
        for loaded in &due {
            match self
                .dispatch_post(&loaded.post.user_id, &loaded.post.id)
                .await
            {
                Ok(_) => dispatched += 1,
                Err(e) => warn!(post_id = %loaded.post.id, error = %e, "Failed to dispatch due post"),
            }
        }
        Ok(dispatched)
    }

    pub async fn update_post(
        &self,
        user_id: &str,
        post_id: &str,
        update: PostUpdate,
    ) -> DomainResult<Post> {
        let mut post = self.get_post(user_id, post_id).await?.post;
        if post.status == PostStatus::Posting {
            return Err(DomainError::Conflict(
                "Post cannot be edited while it is being published".to_string(),
            ));
        }

        if let Some(caption) = update.main_caption {
            post.main_caption = caption;
        }
        if let Some(scheduled_time) = update.scheduled_time {
            post.scheduled_time = Some(scheduled_time);
        }
        post.updated_at = chrono::Utc::now().timestamp();

        self.repo.update_post(&post).await.map_err(classify)?;
        Ok(post)
    }

    pub async fn delete_post(&self, user_id: &str, post_id: &str) -> DomainResult<()> {
        let loaded = self.get_post(user_id, post_id).await?;
        if loaded.post.status == PostStatus::Posting {
            return Err(DomainError::Conflict(
                "Post cannot be deleted while it is being published".to_string(),
            ));
        }

        self.repo.delete_post(post_id).await.map_err(classify)?;
        info!(post_id, "Deleted post");
        Ok(())
    }

    /// Remove one target and recompute the post status from the rest
    pub async fn delete_target(
        &self,
        user_id: &str,
        post_id: &str,
        social_account_id: &str,
    ) -> DomainResult<Option<PostStatus>> {
        let loaded = self.get_post(user_id, post_id).await?;
        let target = find_target(&loaded, social_account_id)?;

        if target.status == TargetStatus::Posting {
            return Err(DomainError::Conflict(
                "Target cannot be removed while it is being published".to_string(),
            ));
        }

        self.repo
            .delete_target(&target.key())
            .await
            .map_err(classify)?;
        info!(post_id, platform = %target.platform, "Removed target");

        self.repo
            .recompute_post_status(post_id)
            .await
            .map_err(classify)
    }

    /// Publish a single target again, leaving every other target untouched
    pub async fn retry_target(
        &self,
        user_id: &str,
        post_id: &str,
        social_account_id: Option<&str>,
    ) -> DomainResult<DispatchOutcome> {
        let social_account_id = social_account_id.ok_or_else(|| {
            DomainError::BadRequest("social_account_id is required to retry a target".to_string())
        })?;

        let loaded = self.get_post(user_id, post_id).await?;
        let target = find_target(&loaded, social_account_id)?;
        if target.status == TargetStatus::Success {
            return Err(DomainError::Conflict(format!(
                "Target {} was already published",
                target.platform
            )));
        }
        if self.has_live_job(target)
            || (target.status.is_in_flight() && loaded.post.status == PostStatus::Posting)
        {
            return Err(DomainError::Conflict(format!(
                "Target {} is still being published",
                target.platform
            )));
        }

        info!(post_id, platform = %target.platform, "Retrying target");
        self.dispatcher
            .send_post(user_id, post_id, target.platform, Some(social_account_id))
            .await
    }

    fn has_live_job(&self, target: &Target) -> bool {
        self.queue.as_ref().is_some_and(|queue| {
            queue.is_live(&Job {
                platform: target.platform,
                user_id: String::new(),
                post_id: target.post_id.clone(),
                social_account_id: Some(target.social_account_id.clone()),
            })
        })
    }

    pub async fn failed_count(&self, user_id: &str) -> DomainResult<u64> {
        self.repo
            .count_failed_targets(user_id)
            .await
            .map_err(classify)
    }

    pub async fn failed_targets(&self, user_id: &str) -> DomainResult<Vec<Target>> {
        self.repo.failed_targets(user_id).await.map_err(classify)
    }
}

fn find_target<'a>(loaded: &'a PostWithTargets, social_account_id: &str) -> DomainResult<&'a Target> {
    loaded
        .targets
        .iter()
        .find(|t| t.social_account_id == social_account_id)
        .ok_or_else(|| {
            DomainError::NotFound(format!(
                "No target for account {} on post {}",
                social_account_id, loaded.post.id
            ))
        })
}
