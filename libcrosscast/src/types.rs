//! Core types for Crosscast

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::DomainError;

/// Social platforms a post can be published to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Facebook,
    Instagram,
    Threads,
    Tiktok,
    X,
    Linkedin,
    Pinterest,
    Youtube,
    Bluesky,
}

impl Platform {
    pub const ALL: [Platform; 9] = [
        Platform::Facebook,
        Platform::Instagram,
        Platform::Threads,
        Platform::Tiktok,
        Platform::X,
        Platform::Linkedin,
        Platform::Pinterest,
        Platform::Youtube,
        Platform::Bluesky,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Facebook => "facebook",
            Platform::Instagram => "instagram",
            Platform::Threads => "threads",
            Platform::Tiktok => "tiktok",
            Platform::X => "x",
            Platform::Linkedin => "linkedin",
            Platform::Pinterest => "pinterest",
            Platform::Youtube => "youtube",
            Platform::Bluesky => "bluesky",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tag = s.trim().to_lowercase();
        Platform::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == tag)
            .ok_or_else(|| DomainError::BadRequest(format!("Unknown platform: '{}'", s)))
    }
}

/// Lifecycle of a post
///
/// `Draft` is never dispatched. `Posting` means at least one target is in
/// flight; `Done`, `Failed` and `PartiallyDone` close a dispatch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PostStatus {
    Draft,
    Pending,
    Posting,
    Done,
    Failed,
    PartiallyDone,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Draft => "draft",
            PostStatus::Pending => "pending",
            PostStatus::Posting => "posting",
            PostStatus::Done => "done",
            PostStatus::Failed => "failed",
            PostStatus::PartiallyDone => "partially_done",
        }
    }
}

impl fmt::Display for PostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PostStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(PostStatus::Draft),
            "pending" => Ok(PostStatus::Pending),
            "posting" => Ok(PostStatus::Posting),
            "done" => Ok(PostStatus::Done),
            "failed" => Ok(PostStatus::Failed),
            "partially_done" => Ok(PostStatus::PartiallyDone),
            other => Err(format!("unknown post status '{}'", other)),
        }
    }
}

/// Outcome of a single platform target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetStatus {
    Pending,
    Posting,
    Success,
    Failed,
}

impl TargetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetStatus::Pending => "pending",
            TargetStatus::Posting => "posting",
            TargetStatus::Success => "success",
            TargetStatus::Failed => "failed",
        }
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self, TargetStatus::Pending | TargetStatus::Posting)
    }
}

impl fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TargetStatus::Pending),
            "posting" => Ok(TargetStatus::Posting),
            "success" => Ok(TargetStatus::Success),
            "failed" => Ok(TargetStatus::Failed),
            other => Err(format!("unknown target status '{}'", other)),
        }
    }
}

/// Aggregate post status for a set of target outcomes
///
/// Returns `None` while the outcome is not settled: no targets, or at least
/// one target still pending or posting. Otherwise all successes are `Done`,
/// all failures are `Failed`, and any mix is `PartiallyDone`.
pub fn aggregate_status(statuses: &[TargetStatus]) -> Option<PostStatus> {
    if statuses.is_empty() || statuses.iter().any(|s| s.is_in_flight()) {
        return None;
    }

    let successes = statuses
        .iter()
        .filter(|s| **s == TargetStatus::Success)
        .count();

    Some(if successes == statuses.len() {
        PostStatus::Done
    } else if successes == 0 {
        PostStatus::Failed
    } else {
        PostStatus::PartiallyDone
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub user_id: String,
    pub workspace_id: Option<String>,
    pub main_caption: String,
    pub scheduled_time: Option<i64>,
    pub status: PostStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Post {
    pub fn new(user_id: impl Into<String>, main_caption: impl Into<String>) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            workspace_id: None,
            main_caption: main_caption.into(),
            scheduled_time: None,
            status: PostStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One platform/account specific publish attempt belonging to a post
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub post_id: String,
    pub platform: Platform,
    pub social_account_id: String,
    pub status: TargetStatus,
    pub error_message: Option<String>,
    pub text: Option<String>,
    pub title: Option<String>,
    /// Platform-specific options such as a Pinterest board id
    pub options: BTreeMap<String, String>,
    pub platform_post_id: Option<String>,
    pub position: i64,
    pub updated_at: i64,
}

impl Target {
    pub fn new(
        post_id: impl Into<String>,
        platform: Platform,
        social_account_id: impl Into<String>,
    ) -> Self {
        Self {
            post_id: post_id.into(),
            platform,
            social_account_id: social_account_id.into(),
            status: TargetStatus::Pending,
            error_message: None,
            text: None,
            title: None,
            options: BTreeMap::new(),
            platform_post_id: None,
            position: 0,
            updated_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Text to publish, falling back to the post caption
    pub fn effective_text<'a>(&'a self, post: &'a Post) -> &'a str {
        self.text.as_deref().unwrap_or(&post.main_caption)
    }

    pub fn key(&self) -> TargetKey {
        TargetKey {
            post_id: self.post_id.clone(),
            platform: self.platform,
            social_account_id: self.social_account_id.clone(),
        }
    }
}

/// Natural key of a target; at most one live job exists per key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetKey {
    pub post_id: String,
    pub platform: Platform,
    pub social_account_id: String,
}

/// A post together with its ordered targets
#[derive(Debug, Clone)]
pub struct PostWithTargets {
    pub post: Post,
    pub targets: Vec<Target>,
}

impl PostWithTargets {
    pub fn platforms(&self) -> Vec<Platform> {
        self.targets.iter().map(|t| t.platform).collect()
    }
}

/// A connected account on a social platform
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocialAccount {
    pub id: String,
    pub user_id: String,
    pub workspace_id: Option<String>,
    pub platform: Platform,
    pub external_page_id: String,
    pub display_name: Option<String>,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<i64>,
    pub refresh_expires_at: Option<i64>,
}

/// Credentials issued by a platform during connect or refresh
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<i64>,
    pub refresh_expires_at: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_parse_is_case_insensitive() {
        assert_eq!("TikTok".parse::<Platform>().unwrap(), Platform::Tiktok);
        assert_eq!(" x ".parse::<Platform>().unwrap(), Platform::X);
    }

    #[test]
    fn test_platform_parse_unknown() {
        let err = "myspace".parse::<Platform>().unwrap_err();
        assert_eq!(err.code(), "BAD_REQUEST");
    }

    #[test]
    fn test_platform_tags_round_trip() {
        for platform in Platform::ALL {
            assert_eq!(platform.as_str().parse::<Platform>().unwrap(), platform);
        }
    }

    #[test]
    fn test_post_status_storage_strings() {
        assert_eq!(PostStatus::PartiallyDone.as_str(), "partially_done");
        assert_eq!(
            "partially_done".parse::<PostStatus>().unwrap(),
            PostStatus::PartiallyDone
        );
        assert!("posted".parse::<PostStatus>().is_err());
    }

    #[test]
    fn test_post_status_serializes_screaming_case() {
        let json = serde_json::to_string(&PostStatus::PartiallyDone).unwrap();
        assert_eq!(json, "\"PARTIALLY_DONE\"");
    }

    #[test]
    fn test_aggregate_status_rules() {
        use TargetStatus::*;

        assert_eq!(aggregate_status(&[]), None);
        assert_eq!(aggregate_status(&[Success, Posting]), None);
        assert_eq!(aggregate_status(&[Pending]), None);
        assert_eq!(aggregate_status(&[Success, Success]), Some(PostStatus::Done));
        assert_eq!(aggregate_status(&[Failed]), Some(PostStatus::Failed));
        assert_eq!(
            aggregate_status(&[Success, Failed, Success]),
            Some(PostStatus::PartiallyDone)
        );
    }

    #[test]
    fn test_effective_text_falls_back_to_caption() {
        let post = Post::new("user-1", "Caption");
        let mut target = Target::new(&post.id, Platform::Facebook, "acct-1");
        assert_eq!(target.effective_text(&post), "Caption");

        target.text = Some("Custom".to_string());
        assert_eq!(target.effective_text(&post), "Custom");
    }
}
