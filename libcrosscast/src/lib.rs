//! Crosscast - publish orchestration for social platforms
//!
//! This library sends one logical post to many social platforms at once,
//! runs the slow platform calls on a background worker pool, keeps connected
//! accounts' credentials fresh, and protects OAuth connect flows with
//! one-time state tokens.

pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod oauth_state;
pub mod platforms;
pub mod queue;
pub mod repository;
pub mod service;
pub mod types;

// Re-export commonly used types
pub use config::Config;
pub use db::Database;
pub use error::{classify, CrosscastError, DomainError, DomainResult, Result};
pub use service::CrosscastService;
pub use types::{Platform, Post, PostStatus, Target, TargetStatus};
