//! Token refresh
//!
//! Scans for accounts whose access token expires within the lookahead window
//! and asks each platform's connector for fresh credentials. Accounts are
//! refreshed one at a time; a failure is logged and counted, and the scan
//! moves on to the next account.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::platforms::ConnectorRegistry;
use crate::repository::AccountRepository;
use crate::service::events::{Event, EventBus};
use crate::types::{SocialAccount, TokenGrant};

/// Counts from one refresh scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub scanned: usize,
    pub refreshed: usize,
    pub failed: usize,
}

pub struct TokenRefresher {
    accounts: Arc<dyn AccountRepository>,
    registry: ConnectorRegistry,
    event_bus: EventBus,
    lookahead: Duration,
}

impl TokenRefresher {
    pub fn new(
        accounts: Arc<dyn AccountRepository>,
        registry: ConnectorRegistry,
        event_bus: EventBus,
        lookahead: Duration,
    ) -> Self {
        Self {
            accounts,
            registry,
            event_bus,
            lookahead,
        }
    }

    /// Refresh every account expiring before `now + lookahead`
    ///
    /// Only the initial account query can fail the scan.
    pub async fn refresh_expiring(&self, now: i64) -> Result<RefreshReport> {
        let cutoff = now.saturating_add(self.lookahead.as_secs() as i64);
        let accounts = self.accounts.accounts_expiring_before(cutoff).await?;

        info!(count = accounts.len(), cutoff, "Refreshing expiring credentials");

        let mut report = RefreshReport {
            scanned: accounts.len(),
            ..RefreshReport::default()
        };

        for account in &accounts {
            match self.refresh_account(account).await {
                Ok(grant) => {
                    report.refreshed += 1;
                    debug!(
                        account_id = %account.id,
                        platform = %account.platform,
                        expires_at = ?grant.expires_at,
                        "Refreshed credentials"
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        account_id = %account.id,
                        platform = %account.platform,
                        error = %e,
                        "Failed to refresh credentials"
                    );
                }
            }
        }

        info!(
            scanned = report.scanned,
            refreshed = report.refreshed,
            failed = report.failed,
            "Refresh scan finished"
        );
        self.event_bus.emit(Event::RefreshCompleted {
            scanned: report.scanned,
            refreshed: report.refreshed,
            failed: report.failed,
        });

        Ok(report)
    }

    /// Refresh and persist credentials for one account
    ///
    /// A grant without a refresh token keeps the stored one.
    pub async fn refresh_account(&self, account: &SocialAccount) -> Result<TokenGrant> {
        let connector = self.registry.get(account.platform)?;
        let grant = connector.refresh_token(account).await?;
        self.accounts.save_tokens(&account.id, &grant).await?;
        Ok(grant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::platforms::mock::MockConnector;
    use crate::types::Platform;
    use tempfile::TempDir;

    const DAY: i64 = 24 * 3600;

    fn account(platform: Platform, expires_at: i64) -> SocialAccount {
        SocialAccount {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: "user-1".to_string(),
            workspace_id: None,
            platform,
            external_page_id: format!("{}-page", platform),
            display_name: None,
            access_token: "old-access".to_string(),
            refresh_token: Some("old-refresh".to_string()),
            expires_at: Some(expires_at),
            refresh_expires_at: None,
        }
    }

    #[tokio::test]
    async fn test_refresh_skips_accounts_outside_window() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Arc::new(Database::new(db_path.to_str().unwrap()).await.unwrap());

        let now = 1_700_000_000;
        db.upsert_account(&account(Platform::Facebook, now + 2 * DAY))
            .await
            .unwrap();
        db.upsert_account(&account(Platform::Linkedin, now + 30 * DAY))
            .await
            .unwrap();

        let facebook = Arc::new(MockConnector::success(Platform::Facebook));
        let linkedin = Arc::new(MockConnector::success(Platform::Linkedin));
        let mut registry = ConnectorRegistry::new();
        registry.register(facebook.clone()).unwrap();
        registry.register(linkedin.clone()).unwrap();

        let refresher = TokenRefresher::new(
            db.clone(),
            registry,
            EventBus::new(8),
            Duration::from_secs(7 * DAY as u64),
        );
        let report = refresher.refresh_expiring(now).await.unwrap();

        assert_eq!(
            report,
            RefreshReport {
                scanned: 1,
                refreshed: 1,
                failed: 0
            }
        );
        assert_eq!(facebook.refresh_calls(), 1);
        assert_eq!(linkedin.refresh_calls(), 0);
    }
}
