//! Persistence seams consumed by the dispatcher, workers and services
//!
//! [`crate::db::Database`] implements both traits on SQLite.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{
    Post, PostStatus, PostWithTargets, SocialAccount, Target, TargetKey, TargetStatus, TokenGrant,
};

/// New state written to a single target row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetUpdate {
    pub status: TargetStatus,
    pub error_message: Option<String>,
    pub platform_post_id: Option<String>,
}

impl TargetUpdate {
    pub fn posting() -> Self {
        Self {
            status: TargetStatus::Posting,
            error_message: None,
            platform_post_id: None,
        }
    }

    pub fn success(platform_post_id: impl Into<String>) -> Self {
        Self {
            status: TargetStatus::Success,
            error_message: None,
            platform_post_id: Some(platform_post_id.into()),
        }
    }

    pub fn failed(error_message: impl Into<String>) -> Self {
        Self {
            status: TargetStatus::Failed,
            error_message: Some(error_message.into()),
            platform_post_id: None,
        }
    }
}

#[async_trait]
pub trait PostRepository: Send + Sync {
    /// Insert a post and its targets atomically
    async fn create_post(&self, post: &Post, targets: &[Target]) -> Result<()>;

    async fn find_post(&self, post_id: &str) -> Result<Option<PostWithTargets>>;

    /// Persist caption and schedule changes
    async fn update_post(&self, post: &Post) -> Result<()>;

    async fn update_post_status(&self, post_id: &str, status: PostStatus) -> Result<()>;

    /// Move a post to `Posting` unless it is already posting or a draft.
    /// Returns whether the row changed.
    async fn mark_posting(&self, post_id: &str) -> Result<bool>;

    async fn delete_post(&self, post_id: &str) -> Result<bool>;

    async fn update_target(&self, key: &TargetKey, update: &TargetUpdate) -> Result<()>;

    /// Fail a target only if it is still pending or posting. Returns whether it changed.
    async fn fail_if_in_flight(&self, key: &TargetKey, error_message: &str) -> Result<bool>;

    async fn delete_target(&self, key: &TargetKey) -> Result<bool>;

    /// Recompute the aggregate post status from freshly read target rows and
    /// persist it in a single write transaction. Returns the resulting status,
    /// or `None` if the post no longer exists.
    async fn recompute_post_status(&self, post_id: &str) -> Result<Option<PostStatus>>;

    /// Pending posts whose scheduled time has passed (or that have none)
    async fn due_posts(&self, now: i64, limit: usize) -> Result<Vec<PostWithTargets>>;

    async fn failed_targets(&self, user_id: &str) -> Result<Vec<Target>>;

    async fn count_failed_targets(&self, user_id: &str) -> Result<u64>;
}

#[async_trait]
pub trait AccountRepository: Send + Sync {
    /// Insert or update by `(user, workspace, platform, external page)`.
    /// An incoming `None` refresh token keeps the stored one.
    async fn upsert_account(&self, account: &SocialAccount) -> Result<SocialAccount>;

    async fn get_account(&self, account_id: &str) -> Result<Option<SocialAccount>>;

    /// Accounts whose access token expires at or before `cutoff`
    async fn accounts_expiring_before(&self, cutoff: i64) -> Result<Vec<SocialAccount>>;

    /// Store refreshed credentials. Missing refresh values keep the stored ones.
    async fn save_tokens(&self, account_id: &str, grant: &TokenGrant) -> Result<()>;
}
