//! Account connect flow
//!
//! [`ConnectService::begin`] issues a one-time state token (plus a PKCE
//! challenge for connectors that need one) and returns the provider's
//! authorize URL. [`ConnectService::complete`] validates the callback,
//! exchanges the code and stores the account.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{classify, DomainError, DomainResult, Result};
use crate::oauth_state::{random_token, OAuthStatePayload, OAuthStateStore};
use crate::platforms::{CodeExchange, ConnectorRegistry};
use crate::repository::AccountRepository;
use crate::types::{Platform, SocialAccount};

/// Where to send the user, and the state the callback must return
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub authorize_url: String,
    pub state: String,
}

/// Query parameters of a provider redirect
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthCallback {
    pub platform: Platform,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
    /// Verifier supplied by the client when the state store did not keep one
    #[serde(default)]
    pub code_verifier: Option<String>,
}

impl OAuthCallback {
    pub fn new(platform: Platform, code: &str, state: &str) -> Self {
        Self {
            platform,
            code: Some(code.to_string()),
            state: Some(state.to_string()),
            error: None,
            error_description: None,
            code_verifier: None,
        }
    }
}

/// PKCE verifier and its S256 challenge
fn pkce_pair() -> (String, String) {
    let verifier = random_token(32);
    let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
    (verifier, challenge)
}

pub struct ConnectService {
    states: Arc<dyn OAuthStateStore>,
    registry: ConnectorRegistry,
    accounts: Arc<dyn AccountRepository>,
}

impl ConnectService {
    pub fn new(
        states: Arc<dyn OAuthStateStore>,
        registry: ConnectorRegistry,
        accounts: Arc<dyn AccountRepository>,
    ) -> Self {
        Self {
            states,
            registry,
            accounts,
        }
    }

    pub fn begin(
        &self,
        user_id: &str,
        workspace_id: Option<&str>,
        platform: Platform,
    ) -> DomainResult<AuthorizationRequest> {
        let connector = self.registry.get(platform).map_err(classify)?;

        let (code_verifier, code_challenge) = if connector.uses_pkce() {
            let (verifier, challenge) = pkce_pair();
            (Some(verifier), Some(challenge))
        } else {
            (None, None)
        };

        let state = self
            .states
            .create(OAuthStatePayload {
                user_id: user_id.to_string(),
                platform,
                workspace_id: workspace_id.map(str::to_string),
                code_verifier,
            })
            .map_err(classify)?;

        info!(user_id, %platform, "Started account connect flow");
        Ok(AuthorizationRequest {
            authorize_url: connector.authorize_url(&state, code_challenge.as_deref()),
            state,
        })
    }

    pub async fn complete(&self, callback: OAuthCallback) -> DomainResult<SocialAccount> {
        if let Some(error) = &callback.error {
            // Burn the state so it cannot be replayed with a code later
            if let Some(state) = &callback.state {
                self.states.consume(state);
            }
            warn!(platform = %callback.platform, error = %error, "Provider rejected authorization");
            let message = match &callback.error_description {
                Some(description) => format!("{}: {}", error, description),
                None => error.clone(),
            };
            return Err(DomainError::BadRequest(message));
        }

        let token = callback
            .state
            .as_deref()
            .ok_or_else(|| DomainError::Unauthorized("Missing OAuth state".to_string()))?;
        let payload = self.states.consume(token).ok_or_else(|| {
            DomainError::Unauthorized("Invalid or expired OAuth state".to_string())
        })?;

        if payload.platform != callback.platform {
            return Err(DomainError::BadRequest(format!(
                "OAuth state was issued for {}, not {}",
                payload.platform, callback.platform
            )));
        }

        let code = callback
            .code
            .ok_or_else(|| DomainError::BadRequest("Missing authorization code".to_string()))?;

        self.connect_account(payload, code, callback.code_verifier)
            .await
            .map_err(classify)
    }

    async fn connect_account(
        &self,
        payload: OAuthStatePayload,
        code: String,
        client_verifier: Option<String>,
    ) -> Result<SocialAccount> {
        let connector = self.registry.get(payload.platform)?;
        let connected = connector
            .connect(CodeExchange {
                user_id: payload.user_id.clone(),
                workspace_id: payload.workspace_id.clone(),
                code,
                code_verifier: payload.code_verifier.or(client_verifier),
            })
            .await?;

        let account = SocialAccount {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: payload.user_id,
            workspace_id: payload.workspace_id,
            platform: payload.platform,
            external_page_id: connected.external_page_id,
            display_name: connected.display_name,
            access_token: connected.grant.access_token,
            refresh_token: connected.grant.refresh_token,
            expires_at: connected.grant.expires_at,
            refresh_expires_at: connected.grant.refresh_expires_at,
        };

        let stored = self.accounts.upsert_account(&account).await?;
        info!(
            account_id = %stored.id,
            platform = %stored.platform,
            external_page_id = %stored.external_page_id,
            "Connected social account"
        );
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pkce_challenge_matches_verifier() {
        let (verifier, challenge) = pkce_pair();
        assert_eq!(verifier.len(), 43);
        assert_eq!(
            challenge,
            URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
        );
        assert!(!challenge.contains('='));
    }

    #[test]
    fn test_callback_deserializes_with_missing_fields() {
        let callback: OAuthCallback =
            serde_json::from_str(r#"{"platform":"tiktok","error":"access_denied"}"#).unwrap();
        assert_eq!(callback.platform, Platform::Tiktok);
        assert_eq!(callback.error.as_deref(), Some("access_denied"));
        assert!(callback.code.is_none());
    }
}
