//! Platform connector abstraction
//!
//! Each social network is reached through a [`Connector`]: one implementation
//! per platform, looked up at runtime through the [`ConnectorRegistry`]. The
//! orchestration core only ever sees this trait; wire protocols live in the
//! connector implementations.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use libcrosscast::platforms::{mock::MockConnector, ConnectorRegistry};
//! use libcrosscast::types::Platform;
//!
//! # fn example() -> libcrosscast::error::Result<()> {
//! let mut registry = ConnectorRegistry::new();
//! registry.register(Arc::new(MockConnector::success(Platform::Facebook)))?;
//!
//! let connector = registry.get(Platform::Facebook)?;
//! assert_eq!(connector.platform(), Platform::Facebook);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{CrosscastError, DomainError, Result};
use crate::types::{Platform, Post, SocialAccount, Target, TokenGrant};

// Mock connector is available for all builds to support integration tests
pub mod mock;

/// Authorization code returned to the OAuth callback, ready for exchange
#[derive(Debug, Clone)]
pub struct CodeExchange {
    pub user_id: String,
    pub workspace_id: Option<String>,
    pub code: String,
    /// PKCE verifier, present only for connectors that use PKCE
    pub code_verifier: Option<String>,
}

/// Account details resolved by a successful code exchange
#[derive(Debug, Clone)]
pub struct ConnectedAccount {
    pub external_page_id: String,
    pub display_name: Option<String>,
    pub grant: TokenGrant,
}

/// Everything a connector needs to publish one target
#[derive(Debug, Clone, Copy)]
pub struct PublishRequest<'a> {
    pub post: &'a Post,
    pub target: &'a Target,
    pub user_id: &'a str,
}

impl PublishRequest<'_> {
    pub fn text(&self) -> &str {
        self.target.effective_text(self.post)
    }
}

/// Capability implemented once per social platform
#[async_trait]
pub trait Connector: Send + Sync {
    fn platform(&self) -> Platform;

    /// Provider URL the user is redirected to when connecting an account
    fn authorize_url(&self, state: &str, code_challenge: Option<&str>) -> String;

    /// Whether the connect flow needs a PKCE code verifier
    fn uses_pkce(&self) -> bool {
        false
    }

    /// Exchange an authorization code for account credentials
    async fn connect(&self, exchange: CodeExchange) -> Result<ConnectedAccount>;

    /// Publish a target, returning the platform's id for the created post
    async fn publish(&self, request: PublishRequest<'_>) -> Result<String>;

    /// Obtain fresh credentials for an account. Must be safe to repeat.
    async fn refresh_token(&self, account: &SocialAccount) -> Result<TokenGrant>;
}

/// Lookup table from platform to its connector
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    connectors: HashMap<Platform, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connector. Each platform may be registered once.
    pub fn register(&mut self, connector: Arc<dyn Connector>) -> Result<()> {
        let platform = connector.platform();
        if self.connectors.contains_key(&platform) {
            return Err(DomainError::Conflict(format!(
                "A connector for {} is already registered",
                platform
            ))
            .into());
        }
        self.connectors.insert(platform, connector);
        Ok(())
    }

    pub fn get(&self, platform: Platform) -> Result<Arc<dyn Connector>> {
        self.connectors.get(&platform).cloned().ok_or_else(|| {
            CrosscastError::not_found(format!("No connector registered for {}", platform))
        })
    }

    pub fn contains(&self, platform: Platform) -> bool {
        self.connectors.contains_key(&platform)
    }

    /// Registered platforms in declaration order
    pub fn platforms(&self) -> Vec<Platform> {
        Platform::ALL
            .into_iter()
            .filter(|p| self.connectors.contains_key(p))
            .collect()
    }
}
