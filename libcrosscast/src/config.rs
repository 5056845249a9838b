//! Configuration management for Crosscast
//!
//! Configuration is read from a TOML file. Every section is optional and
//! falls back to the defaults below. Durations are humantime strings
//! (`"10m"`, `"24h"`, `"7d"`).

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, Result};
use crate::types::Platform;

/// Environment variable that overrides the OAuth state signing secret
pub const STATE_SECRET_ENV: &str = "CROSSCAST_STATE_SECRET";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub oauth_state: OAuthStateConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "~/.local/share/crosscast/crosscast.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateMode {
    /// Self-contained signed tokens, no server-side storage
    Signed,
    /// Opaque tokens backed by an in-process map
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthStateConfig {
    #[serde(default = "default_state_mode")]
    pub mode: StateMode,
    #[serde(default = "default_state_ttl", with = "duration_str")]
    pub ttl: Duration,
    /// Signing secret for `signed` mode; `CROSSCAST_STATE_SECRET` takes precedence
    #[serde(default, skip_serializing)]
    pub secret: Option<String>,
}

impl Default for OAuthStateConfig {
    fn default() -> Self {
        Self {
            mode: default_state_mode(),
            ttl: default_state_ttl(),
            secret: None,
        }
    }
}

impl OAuthStateConfig {
    /// Resolve the signing secret from the environment or the config file
    pub fn signing_secret(&self) -> Option<SecretString> {
        std::env::var(STATE_SECRET_ENV)
            .ok()
            .filter(|s| !s.is_empty())
            .or_else(|| self.secret.clone())
            .map(SecretString::from)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Attempts per job before the failure hook runs
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First retry delay; doubles on every further attempt
    #[serde(default = "default_backoff_base", with = "duration_str")]
    pub backoff_base: Duration,
    /// Upper bound for a single attempt
    #[serde(default = "default_job_timeout", with = "duration_str")]
    pub job_timeout: Duration,
    /// Jobs a single platform worker runs at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Platforms dispatched inline instead of through a background worker
    #[serde(default = "default_synchronous_platforms")]
    pub synchronous_platforms: Vec<Platform>,
    /// How often the daemon looks for due scheduled posts
    #[serde(default = "default_poll_interval", with = "duration_str")]
    pub poll_interval: Duration,
    /// Buffered jobs per platform channel
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base: default_backoff_base(),
            job_timeout: default_job_timeout(),
            concurrency: default_concurrency(),
            synchronous_platforms: default_synchronous_platforms(),
            poll_interval: default_poll_interval(),
            capacity: default_capacity(),
        }
    }
}

impl QueueConfig {
    pub fn is_synchronous(&self, platform: Platform) -> bool {
        self.synchronous_platforms.contains(&platform)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshConfig {
    #[serde(default = "default_refresh_period", with = "duration_str")]
    pub period: Duration,
    /// Accounts expiring within this window are refreshed
    #[serde(default = "default_refresh_lookahead", with = "duration_str")]
    pub lookahead: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            period: default_refresh_period(),
            lookahead: default_refresh_lookahead(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_targets")]
    pub max_targets_per_post: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_targets_per_post: default_max_targets(),
        }
    }
}

fn default_state_mode() -> StateMode {
    StateMode::Memory
}

fn default_state_ttl() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base() -> Duration {
    Duration::from_secs(1)
}

fn default_job_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_concurrency() -> usize {
    4
}

fn default_synchronous_platforms() -> Vec<Platform> {
    vec![Platform::X]
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_capacity() -> usize {
    1024
}

fn default_refresh_period() -> Duration {
    Duration::from_secs(24 * 3600)
}

fn default_refresh_lookahead() -> Duration {
    Duration::from_secs(7 * 24 * 3600)
}

fn default_max_targets() -> usize {
    10
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(ConfigError::ParseError)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.queue.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "queue.max_attempts".to_string(),
                reason: "must be at least 1".to_string(),
            }
            .into());
        }
        if self.queue.concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                field: "queue.concurrency".to_string(),
                reason: "must be at least 1".to_string(),
            }
            .into());
        }
        if self.queue.capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "queue.capacity".to_string(),
                reason: "must be at least 1".to_string(),
            }
            .into());
        }
        if self.refresh.period.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "refresh.period".to_string(),
                reason: "must be greater than zero".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

/// Resolve the configuration file path following XDG Base Directory spec
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("CROSSCAST_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("crosscast").join("config.toml"))
}

/// Expand `~` in the configured database path
pub fn resolve_db_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).to_string())
}

mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use secrecy::ExposeSecret;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.oauth_state.mode, StateMode::Memory);
        assert_eq!(config.oauth_state.ttl, Duration::from_secs(600));
        assert_eq!(config.queue.max_attempts, 3);
        assert_eq!(config.refresh.period, Duration::from_secs(86_400));
        assert!(config.queue.is_synchronous(Platform::X));
        assert!(!config.queue.is_synchronous(Platform::Facebook));
    }

    #[test]
    fn test_parse_full_config() {
        let config = Config::from_toml(
            r#"
            [database]
            path = "/tmp/crosscast.db"

            [oauth_state]
            mode = "signed"
            ttl = "5m"

            [queue]
            max_attempts = 5
            backoff_base = "250ms"
            job_timeout = "30s"
            concurrency = 2
            synchronous_platforms = []

            [refresh]
            period = "12h"
            lookahead = "3d"

            [limits]
            max_targets_per_post = 4
            "#,
        )
        .unwrap();

        assert_eq!(config.database.path, "/tmp/crosscast.db");
        assert_eq!(config.oauth_state.mode, StateMode::Signed);
        assert_eq!(config.oauth_state.ttl, Duration::from_secs(300));
        assert_eq!(config.queue.backoff_base, Duration::from_millis(250));
        assert!(config.queue.synchronous_platforms.is_empty());
        assert_eq!(config.refresh.lookahead, Duration::from_secs(3 * 86_400));
        assert_eq!(config.limits.max_targets_per_post, 4);
    }

    #[test]
    fn test_invalid_duration_is_parse_error() {
        let result = Config::from_toml("[refresh]\nperiod = \"daily\"\n");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Failed to parse config"));
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let result = Config::from_toml("[queue]\nmax_attempts = 0\n");
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("queue.max_attempts"));
    }

    #[test]
    #[serial]
    fn test_signing_secret_prefers_environment() {
        let state = OAuthStateConfig {
            secret: Some("from-file".to_string()),
            ..Default::default()
        };

        std::env::set_var(STATE_SECRET_ENV, "from-env");
        assert_eq!(state.signing_secret().unwrap().expose_secret(), "from-env");

        std::env::remove_var(STATE_SECRET_ENV);
        assert_eq!(state.signing_secret().unwrap().expose_secret(), "from-file");
    }

    #[test]
    #[serial]
    fn test_config_path_from_env() {
        std::env::set_var("CROSSCAST_CONFIG", "/etc/crosscast/config.toml");
        let path = resolve_config_path().unwrap();
        std::env::remove_var("CROSSCAST_CONFIG");
        assert_eq!(path, PathBuf::from("/etc/crosscast/config.toml"));
    }
}
