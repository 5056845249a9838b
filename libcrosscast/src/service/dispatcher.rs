//! Publish dispatcher
//!
//! Sends a post to one target ([`PublishDispatcher::send_post`]) or to every
//! target at once ([`PublishDispatcher::send_post_to_all_platforms`]). Each
//! target is published in isolation: a failure is recorded on that target
//! only, and siblings keep whatever state they had.
//!
//! Errors leaving the dispatcher are always [`DomainError`]s produced by
//! [`classify`].

use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::{classify, CrosscastError, DomainError, DomainResult, Result};
use crate::platforms::{ConnectorRegistry, PublishRequest};
use crate::repository::{PostRepository, TargetUpdate};
use crate::service::events::{Event, EventBus, TargetResult};
use crate::types::{Platform, Post, PostStatus, PostWithTargets, Target};

pub use crate::types::aggregate_status;

/// Hooks run after each target settles
///
/// Injected at construction; hook errors are logged and never change the
/// outcome of the publish that triggered them.
#[async_trait]
pub trait DispatchObserver: Send + Sync {
    async fn on_success(&self, user_id: &str, post_id: &str) -> Result<()>;

    async fn on_failure(&self, user_id: &str, post_id: &str, error: &DomainError) -> Result<()>;
}

/// Observer that does nothing
pub struct NoopObserver;

#[async_trait]
impl DispatchObserver for NoopObserver {
    async fn on_success(&self, _user_id: &str, _post_id: &str) -> Result<()> {
        Ok(())
    }

    async fn on_failure(&self, _user_id: &str, _post_id: &str, _error: &DomainError) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Published { platform_post_id: String },
    /// The post is a draft; nothing was sent
    SkippedDraft,
}

/// Result of a full fan-out
#[derive(Debug, Clone)]
pub struct FanOutSummary {
    pub post_id: String,
    pub status: PostStatus,
    pub results: Vec<TargetResult>,
}

impl FanOutSummary {
    pub fn successes(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    pub fn failures(&self) -> usize {
        self.results.len() - self.successes()
    }
}

#[derive(Clone)]
pub struct PublishDispatcher {
    repo: Arc<dyn PostRepository>,
    registry: ConnectorRegistry,
    event_bus: EventBus,
    observer: Arc<dyn DispatchObserver>,
}

impl PublishDispatcher {
    pub fn new(
        repo: Arc<dyn PostRepository>,
        registry: ConnectorRegistry,
        event_bus: EventBus,
        observer: Arc<dyn DispatchObserver>,
    ) -> Self {
        Self {
            repo,
            registry,
            event_bus,
            observer,
        }
    }

    pub fn registry(&self) -> &ConnectorRegistry {
        &self.registry
    }

    /// Publish a single target of a post
    ///
    /// When `social_account_id` is `None` the first target for `platform` is
    /// used.
    pub async fn send_post(
        &self,
        user_id: &str,
        post_id: &str,
        platform: Platform,
        social_account_id: Option<&str>,
    ) -> DomainResult<DispatchOutcome> {
        self.try_send_post(user_id, post_id, platform, social_account_id)
            .await
            .map_err(classify)
    }

    /// Publish every target of a post concurrently and wait for all of them
    pub async fn send_post_to_all_platforms(
        &self,
        user_id: &str,
        post_id: &str,
    ) -> DomainResult<FanOutSummary> {
        self.fan_out(user_id, post_id).await.map_err(|e| match e {
            CrosscastError::Domain(domain) => domain,
            other => DomainError::SendToAllFailed(other.to_string()),
        })
    }

    async fn load_owned(&self, user_id: &str, post_id: &str) -> Result<PostWithTargets> {
        match self.repo.find_post(post_id).await? {
            Some(loaded) if loaded.post.user_id == user_id => Ok(loaded),
            _ => Err(CrosscastError::not_found(format!("Post {} not found", post_id))),
        }
    }

    async fn try_send_post(
        &self,
        user_id: &str,
        post_id: &str,
        platform: Platform,
        social_account_id: Option<&str>,
    ) -> Result<DispatchOutcome> {
        let loaded = self.load_owned(user_id, post_id).await?;

        let target = loaded
            .targets
            .iter()
            .find(|t| {
                t.platform == platform
                    && social_account_id.map_or(true, |id| t.social_account_id == id)
            })
            .ok_or_else(|| {
                CrosscastError::not_found(format!(
                    "No {} target on post {}",
                    platform, post_id
                ))
            })?;

        if loaded.post.status == PostStatus::Draft {
            info!(post_id, %platform, "Skipping dispatch of draft post");
            return Ok(DispatchOutcome::SkippedDraft);
        }

        self.repo.mark_posting(post_id).await?;

        let platform_post_id = self.publish_target(user_id, &loaded.post, target).await?;
        Ok(DispatchOutcome::Published { platform_post_id })
    }

    /// Publish one target and record its outcome on that target row only
    async fn publish_target(&self, user_id: &str, post: &Post, target: &Target) -> Result<String> {
        let key = target.key();
        self.repo
            .update_target(&key, &TargetUpdate::posting())
            .await?;

        debug!(
            post_id = %post.id,
            platform = %target.platform,
            social_account_id = %target.social_account_id,
            "Publishing target"
        );

        let published = match self.registry.get(target.platform) {
            Ok(connector) => {
                connector
                    .publish(PublishRequest {
                        post,
                        target,
                        user_id,
                    })
                    .await
            }
            Err(e) => Err(e),
        };

        match published {
            Ok(platform_post_id) => {
                self.repo
                    .update_target(&key, &TargetUpdate::success(&platform_post_id))
                    .await?;
                info!(
                    post_id = %post.id,
                    platform = %target.platform,
                    platform_post_id = %platform_post_id,
                    "Published target"
                );

                self.event_bus.emit(Event::TargetSucceeded {
                    post_id: post.id.clone(),
                    platform: target.platform,
                    social_account_id: target.social_account_id.clone(),
                    platform_post_id: platform_post_id.clone(),
                });

                if let Err(e) = self.observer.on_success(user_id, &post.id).await {
                    warn!(post_id = %post.id, error = %e, "Success hook failed");
                }
                Ok(platform_post_id)
            }
            Err(e) => {
                let domain = classify(e);
                let message = domain.to_string();
                warn!(
                    post_id = %post.id,
                    platform = %target.platform,
                    error = %message,
                    "Failed to publish target"
                );

                if let Err(e) = self
                    .repo
                    .update_target(&key, &TargetUpdate::failed(&message))
                    .await
                {
                    error!(post_id = %post.id, error = %e, "Could not record target failure");
                }

                self.event_bus.emit(Event::TargetFailed {
                    post_id: post.id.clone(),
                    platform: target.platform,
                    social_account_id: target.social_account_id.clone(),
                    error: message,
                });

                if let Err(e) = self.observer.on_failure(user_id, &post.id, &domain).await {
                    warn!(post_id = %post.id, error = %e, "Failure hook failed");
                }
                Err(domain.into())
            }
        }
    }

    async fn fan_out(&self, user_id: &str, post_id: &str) -> Result<FanOutSummary> {
        let loaded = self.load_owned(user_id, post_id).await?;
        let platforms = loaded.platforms();

        info!(
            post_id,
            target_count = loaded.targets.len(),
            platforms = ?platforms,
            "Sending post to all platforms"
        );

        if loaded.post.status == PostStatus::Draft {
            info!(post_id, "Skipping fan-out of draft post");
            return Ok(FanOutSummary {
                post_id: post_id.to_string(),
                status: PostStatus::Draft,
                results: Vec::new(),
            });
        }

        if loaded.targets.is_empty() {
            return Err(CrosscastError::bad_request(format!(
                "Post {} has no targets",
                post_id
            )));
        }

        self.repo
            .update_post_status(post_id, PostStatus::Posting)
            .await?;
        self.event_bus.emit(Event::DispatchStarted {
            post_id: post_id.to_string(),
            platforms,
        });

        let post = &loaded.post;
        let branches = loaded.targets.iter().map(|target| async move {
            match self.publish_target(user_id, post, target).await {
                Ok(platform_post_id) => TargetResult {
                    platform: target.platform,
                    social_account_id: target.social_account_id.clone(),
                    success: true,
                    platform_post_id: Some(platform_post_id),
                    error: None,
                },
                Err(e) => TargetResult {
                    platform: target.platform,
                    social_account_id: target.social_account_id.clone(),
                    success: false,
                    platform_post_id: None,
                    error: Some(classify(e).to_string()),
                },
            }
        });
        let results = join_all(branches).await;

        let total = results.len();
        let failure_count = results.iter().filter(|r| !r.success).count();
        let status = if failure_count == total {
            PostStatus::Failed
        } else if failure_count == 0 {
            PostStatus::Done
        } else {
            PostStatus::PartiallyDone
        };

        self.repo.update_post_status(post_id, status).await?;
        self.event_bus.emit(Event::FanOutCompleted {
            post_id: post_id.to_string(),
            status,
            results: results.clone(),
        });

        match status {
            PostStatus::Failed => {
                error!(post_id, total, failure_count, "Post failed on every platform");
                Err(DomainError::AllPlatformsFailed {
                    total,
                    failure_count,
                }
                .into())
            }
            PostStatus::PartiallyDone => {
                warn!(
                    post_id,
                    total, failure_count, "Post published to some platforms only"
                );
                Ok(FanOutSummary {
                    post_id: post_id.to_string(),
                    status,
                    results,
                })
            }
            _ => {
                info!(post_id, total, "Post published to every platform");
                Ok(FanOutSummary {
                    post_id: post_id.to_string(),
                    status,
                    results,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::platforms::mock::MockConnector;
    use crate::types::TargetStatus;
    use tempfile::TempDir;

    async fn setup(registry: ConnectorRegistry) -> (PublishDispatcher, Arc<Database>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Arc::new(Database::new(db_path.to_str().unwrap()).await.unwrap());
        let dispatcher = PublishDispatcher::new(
            db.clone(),
            registry,
            EventBus::new(16),
            Arc::new(NoopObserver),
        );
        (dispatcher, db, temp_dir)
    }

    async fn insert_post(db: &Database, platforms: &[Platform], status: PostStatus) -> Post {
        let mut post = Post::new("user-1", "Hello");
        post.status = status;
        let targets: Vec<Target> = platforms
            .iter()
            .map(|p| Target::new(&post.id, *p, format!("acct-{}", p)))
            .collect();
        db.create_post(&post, &targets).await.unwrap();
        post
    }

    #[tokio::test]
    async fn test_send_post_success() {
        let mut registry = ConnectorRegistry::new();
        registry
            .register(Arc::new(MockConnector::success(Platform::Facebook)))
            .unwrap();
        let (dispatcher, db, _temp_dir) = setup(registry).await;
        let post = insert_post(&db, &[Platform::Facebook], PostStatus::Pending).await;

        let outcome = dispatcher
            .send_post("user-1", &post.id, Platform::Facebook, None)
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Published { .. }));

        let loaded = db.find_post(&post.id).await.unwrap().unwrap();
        assert_eq!(loaded.targets[0].status, TargetStatus::Success);
        assert!(loaded.targets[0].platform_post_id.is_some());
    }

    #[tokio::test]
    async fn test_send_post_skips_drafts() {
        let connector = Arc::new(MockConnector::success(Platform::Facebook));
        let mut registry = ConnectorRegistry::new();
        registry.register(connector.clone()).unwrap();
        let (dispatcher, db, _temp_dir) = setup(registry).await;
        let post = insert_post(&db, &[Platform::Facebook], PostStatus::Draft).await;

        let outcome = dispatcher
            .send_post("user-1", &post.id, Platform::Facebook, None)
            .await
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::SkippedDraft);
        assert_eq!(connector.publish_calls(), 0);
        let loaded = db.find_post(&post.id).await.unwrap().unwrap();
        assert_eq!(loaded.post.status, PostStatus::Draft);
        assert_eq!(loaded.targets[0].status, TargetStatus::Pending);
    }

    #[tokio::test]
    async fn test_send_post_other_user_is_not_found() {
        let (dispatcher, db, _temp_dir) = setup(ConnectorRegistry::new()).await;
        let post = insert_post(&db, &[Platform::Facebook], PostStatus::Pending).await;

        let err = dispatcher
            .send_post("someone-else", &post.id, Platform::Facebook, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_send_post_missing_target_is_not_found() {
        let (dispatcher, db, _temp_dir) = setup(ConnectorRegistry::new()).await;
        let post = insert_post(&db, &[Platform::Facebook], PostStatus::Pending).await;

        let err = dispatcher
            .send_post("user-1", &post.id, Platform::Youtube, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_unregistered_connector_fails_target() {
        let (dispatcher, db, _temp_dir) = setup(ConnectorRegistry::new()).await;
        let post = insert_post(&db, &[Platform::Bluesky], PostStatus::Pending).await;

        let err = dispatcher
            .send_post("user-1", &post.id, Platform::Bluesky, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");

        let loaded = db.find_post(&post.id).await.unwrap().unwrap();
        assert_eq!(loaded.targets[0].status, TargetStatus::Failed);
        assert!(loaded.targets[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("No connector registered"));
    }

    #[tokio::test]
    async fn test_fan_out_without_targets_is_bad_request() {
        let (dispatcher, db, _temp_dir) = setup(ConnectorRegistry::new()).await;
        let post = insert_post(&db, &[], PostStatus::Pending).await;

        let err = dispatcher
            .send_post_to_all_platforms("user-1", &post.id)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "BAD_REQUEST");
    }
}
