//! One-time OAuth state tokens
//!
//! A state token binds an OAuth callback to the user, workspace and platform
//! that started the connect flow. Tokens live for a fixed TTL (ten minutes by
//! default) and can be consumed exactly once.
//!
//! Two interchangeable stores exist:
//!
//! - [`SignedStateStore`] embeds the payload in an HS256 JWT. Nothing is
//!   stored server-side except the ids of consumed tokens, which are kept
//!   until they would have expired anyway.
//! - [`MemoryStateStore`] hands out random opaque tokens backed by a
//!   concurrent map.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::{OAuthStateConfig, StateMode, STATE_SECRET_ENV};
use crate::error::{ConfigError, CrosscastError, Result};
use crate::types::Platform;

pub const DEFAULT_STATE_TTL: Duration = Duration::from_secs(10 * 60);

/// Data bound to a connect flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthStatePayload {
    pub user_id: String,
    pub platform: Platform,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_verifier: Option<String>,
}

pub trait OAuthStateStore: Send + Sync {
    /// Issue a token for `payload`
    fn create(&self, payload: OAuthStatePayload) -> Result<String>;

    /// Return the payload for a valid, unexpired, unused token and burn it.
    /// Any other token yields `None`.
    fn consume(&self, token: &str) -> Option<OAuthStatePayload>;
}

/// Build the store selected by configuration
pub fn from_config(config: &OAuthStateConfig) -> Result<Arc<dyn OAuthStateStore>> {
    match config.mode {
        StateMode::Signed => {
            let secret = config.signing_secret().ok_or_else(|| {
                ConfigError::MissingField(format!("oauth_state.secret (or {})", STATE_SECRET_ENV))
            })?;
            Ok(Arc::new(SignedStateStore::new(&secret, config.ttl)))
        }
        StateMode::Memory => Ok(Arc::new(MemoryStateStore::new(config.ttl))),
    }
}

/// URL-safe random string built from `bytes` random bytes
pub(crate) fn random_token(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    URL_SAFE_NO_PAD.encode(buf)
}

#[derive(Debug, Serialize, Deserialize)]
struct StateClaims {
    #[serde(flatten)]
    payload: OAuthStatePayload,
    jti: String,
    iat: i64,
    exp: i64,
}

pub struct SignedStateStore {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
    /// Consumed token ids mapped to their expiry
    consumed: DashMap<String, i64>,
}

impl SignedStateStore {
    pub fn new(secret: &SecretString, ttl: Duration) -> Self {
        let bytes = secret.expose_secret().as_bytes();
        Self {
            encoding: EncodingKey::from_secret(bytes),
            decoding: DecodingKey::from_secret(bytes),
            ttl,
            consumed: DashMap::new(),
        }
    }

    fn validation() -> Validation {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "iat", "jti"]);
        validation
    }

    fn purge_consumed(&self, now: i64) {
        self.consumed.retain(|_, exp| *exp >= now);
    }
}

impl OAuthStateStore for SignedStateStore {
    fn create(&self, payload: OAuthStatePayload) -> Result<String> {
        let now = chrono::Utc::now().timestamp();
        self.purge_consumed(now);

        let claims = StateClaims {
            payload,
            jti: random_token(16),
            iat: now,
            exp: now + self.ttl.as_secs() as i64,
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| CrosscastError::OAuthState(format!("failed to sign state: {}", e)))
    }

    fn consume(&self, token: &str) -> Option<OAuthStatePayload> {
        let claims = match decode::<StateClaims>(token, &self.decoding, &Self::validation()) {
            Ok(data) => data.claims,
            Err(e) => {
                debug!(error = %e, "rejected OAuth state token");
                return None;
            }
        };

        match self.consumed.entry(claims.jti) {
            Entry::Occupied(_) => {
                debug!("OAuth state token replayed");
                None
            }
            Entry::Vacant(slot) => {
                slot.insert(claims.exp);
                Some(claims.payload)
            }
        }
    }
}

struct StateEntry {
    payload: OAuthStatePayload,
    expires_at: Instant,
}

pub struct MemoryStateStore {
    entries: DashMap<String, StateEntry>,
    ttl: Duration,
}

impl MemoryStateStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Drop every expired entry, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new(DEFAULT_STATE_TTL)
    }
}

impl OAuthStateStore for MemoryStateStore {
    fn create(&self, payload: OAuthStatePayload) -> Result<String> {
        self.purge_expired();

        let token = random_token(32);
        self.entries.insert(
            token.clone(),
            StateEntry {
                payload,
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(token)
    }

    fn consume(&self, token: &str) -> Option<OAuthStatePayload> {
        let (_, entry) = self.entries.remove(token)?;
        if entry.expires_at <= Instant::now() {
            debug!("OAuth state token expired");
            return None;
        }
        Some(entry.payload)
    }
}
