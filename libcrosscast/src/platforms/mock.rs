//! Mock connector for testing
//!
//! A configurable [`Connector`] that can succeed, fail, fail transiently a
//! fixed number of times, or sleep before answering. Call counters are shared
//! through `Arc`s so a test can keep a handle after handing the connector to
//! a registry.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

use crate::error::{PlatformError, Result};
use crate::platforms::{CodeExchange, ConnectedAccount, Connector, PublishRequest};
use crate::types::{Platform, SocialAccount, TokenGrant};

/// Configuration for mock connector behavior
#[derive(Debug, Clone)]
pub struct MockConfig {
    pub platform: Platform,

    /// Error returned by every publish call, if any
    pub publish_error: Option<PlatformError>,

    /// Number of leading publish calls that fail with a network error
    pub transient_failures: usize,

    /// Error returned by every refresh call, if any
    pub refresh_error: Option<PlatformError>,

    /// Delay before completing publish (simulates network latency)
    pub delay: Duration,

    pub uses_pkce: bool,

    /// Lifetime of tokens handed out by connect and refresh
    pub token_lifetime: Duration,

    pub publish_calls: Arc<AtomicUsize>,
    pub refresh_calls: Arc<AtomicUsize>,
    pub connect_calls: Arc<AtomicUsize>,

    /// Text of every successful publish
    pub published: Arc<Mutex<Vec<String>>>,
}

impl MockConfig {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            publish_error: None,
            transient_failures: 0,
            refresh_error: None,
            delay: Duration::ZERO,
            uses_pkce: false,
            token_lifetime: Duration::from_secs(60 * 24 * 3600),
            publish_calls: Arc::new(AtomicUsize::new(0)),
            refresh_calls: Arc::new(AtomicUsize::new(0)),
            connect_calls: Arc::new(AtomicUsize::new(0)),
            published: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

pub struct MockConnector {
    config: MockConfig,
}

impl MockConnector {
    pub fn new(config: MockConfig) -> Self {
        Self { config }
    }

    /// A connector whose every call succeeds
    pub fn success(platform: Platform) -> Self {
        Self::new(MockConfig::new(platform))
    }

    /// A connector whose publish always fails with `PlatformError::Posting`
    pub fn publish_failure(platform: Platform, error: &str) -> Self {
        Self::new(MockConfig {
            publish_error: Some(PlatformError::Posting(error.to_string())),
            ..MockConfig::new(platform)
        })
    }

    /// A connector whose first `failures` publishes fail with a network error
    pub fn flaky(platform: Platform, failures: usize) -> Self {
        Self::new(MockConfig {
            transient_failures: failures,
            ..MockConfig::new(platform)
        })
    }

    pub fn refresh_failure(platform: Platform, error: &str) -> Self {
        Self::new(MockConfig {
            refresh_error: Some(PlatformError::Refresh(error.to_string())),
            ..MockConfig::new(platform)
        })
    }

    pub fn with_delay(platform: Platform, delay: Duration) -> Self {
        Self::new(MockConfig {
            delay,
            ..MockConfig::new(platform)
        })
    }

    pub fn with_pkce(platform: Platform) -> Self {
        Self::new(MockConfig {
            uses_pkce: true,
            ..MockConfig::new(platform)
        })
    }

    pub fn publish_calls(&self) -> usize {
        self.config.publish_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.config.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn connect_calls(&self) -> usize {
        self.config.connect_calls.load(Ordering::SeqCst)
    }

    pub fn published(&self) -> Vec<String> {
        self.config
            .published
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn grant(&self, prefix: &str) -> TokenGrant {
        let now = chrono::Utc::now().timestamp();
        TokenGrant {
            access_token: format!("{}-access-{}", prefix, uuid::Uuid::new_v4()),
            refresh_token: Some(format!("{}-refresh-{}", prefix, uuid::Uuid::new_v4())),
            expires_at: Some(now + self.config.token_lifetime.as_secs() as i64),
            refresh_expires_at: None,
        }
    }
}

#[async_trait]
impl Connector for MockConnector {
    fn platform(&self) -> Platform {
        self.config.platform
    }

    fn authorize_url(&self, state: &str, code_challenge: Option<&str>) -> String {
        let mut url = format!(
            "https://auth.mock/{}/authorize?state={}",
            self.config.platform, state
        );
        if let Some(challenge) = code_challenge {
            url.push_str("&code_challenge_method=S256&code_challenge=");
            url.push_str(challenge);
        }
        url
    }

    fn uses_pkce(&self) -> bool {
        self.config.uses_pkce
    }

    async fn connect(&self, exchange: CodeExchange) -> Result<ConnectedAccount> {
        self.config.connect_calls.fetch_add(1, Ordering::SeqCst);

        if self.config.uses_pkce && exchange.code_verifier.is_none() {
            return Err(PlatformError::Authentication("Missing code verifier".to_string()).into());
        }

        Ok(ConnectedAccount {
            external_page_id: format!("{}-page-{}", self.config.platform, exchange.code),
            display_name: Some(format!("Mock {} page", self.config.platform)),
            grant: self.grant("connect"),
        })
    }

    async fn publish(&self, request: PublishRequest<'_>) -> Result<String> {
        let call = self.config.publish_calls.fetch_add(1, Ordering::SeqCst);

        if !self.config.delay.is_zero() {
            sleep(self.config.delay).await;
        }

        if call < self.config.transient_failures {
            return Err(PlatformError::Network(format!(
                "Mock transient failure {} of {}",
                call + 1,
                self.config.transient_failures
            ))
            .into());
        }

        if let Some(error) = &self.config.publish_error {
            return Err(error.clone().into());
        }

        self.config
            .published
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(request.text().to_string());

        Ok(format!(
            "{}:mock-{}",
            self.config.platform,
            uuid::Uuid::new_v4()
        ))
    }

    async fn refresh_token(&self, _account: &SocialAccount) -> Result<TokenGrant> {
        self.config.refresh_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(error) = &self.config.refresh_error {
            return Err(error.clone().into());
        }

        Ok(self.grant("refresh"))
    }
}
