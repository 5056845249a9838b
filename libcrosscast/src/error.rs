//! Error types for Crosscast
//!
//! Internal failures are modelled as [`CrosscastError`]. Anything that leaves
//! the dispatcher is normalised by [`classify`] into a [`DomainError`], which
//! carries a stable code and HTTP status for the outer web layer.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CrosscastError>;

/// Result type of the caller-facing service operations
pub type DomainResult<T> = std::result::Result<T, DomainError>;

#[derive(Error, Debug)]
pub enum CrosscastError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("OAuth state error: {0}")]
    OAuthState(String),

    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl CrosscastError {
    /// Returns the appropriate process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CrosscastError::Config(_) => 2,
            CrosscastError::Domain(DomainError::BadRequest(_)) => 3,
            CrosscastError::Platform(PlatformError::Authentication(_)) => 2,
            _ => 1,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        DomainError::NotFound(message.into()).into()
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        DomainError::BadRequest(message.into()).into()
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Corrupt row in {table}: {reason}")]
    CorruptRow { table: &'static str, reason: String },
}

/// Failures raised by platform connectors
#[derive(Error, Debug, Clone)]
pub enum PlatformError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Content validation failed: {0}")]
    Validation(String),

    #[error("Posting failed: {0}")]
    Posting(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Token refresh failed: {0}")]
    Refresh(String),
}

impl PlatformError {
    /// Network and rate-limit failures may succeed on a later attempt
    pub fn is_transient(&self) -> bool {
        matches!(self, PlatformError::Network(_) | PlatformError::RateLimit(_))
    }
}

/// Classified error shape seen by every caller outside the dispatcher
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Plan limit reached: {0}")]
    PlanLimitReached(String),

    #[error("Failed to send post to all {total} platform(s)")]
    AllPlatformsFailed { total: usize, failure_count: usize },

    #[error("Failed to send post to all platforms: {0}")]
    SendToAllFailed(String),

    #[error("{message}")]
    Unknown { message: String, transient: bool },
}

impl DomainError {
    pub fn code(&self) -> &'static str {
        match self {
            DomainError::Unauthorized(_) => "UNAUTHORIZED",
            DomainError::NotFound(_) => "NOT_FOUND",
            DomainError::BadRequest(_) => "BAD_REQUEST",
            DomainError::Conflict(_) => "CONFLICT",
            DomainError::PlanLimitReached(_) => "PLAN_LIMIT_REACHED",
            DomainError::AllPlatformsFailed { .. } => "ALL_PLATFORMS_FAILED",
            DomainError::SendToAllFailed(_) => "SEND_TO_ALL_FAILED",
            DomainError::Unknown { .. } => "UNKNOWN",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            DomainError::Unauthorized(_) => 401,
            DomainError::NotFound(_) => 404,
            DomainError::BadRequest(_) => 400,
            DomainError::Conflict(_) => 409,
            DomainError::PlanLimitReached(_) => 403,
            DomainError::AllPlatformsFailed { .. }
            | DomainError::SendToAllFailed(_)
            | DomainError::Unknown { .. } => 500,
        }
    }

    /// Whether a background job that failed with this error is worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(self, DomainError::Unknown { transient: true, .. })
    }
}

/// Normalise any failure into a [`DomainError`]
///
/// Domain errors pass through unchanged; everything else becomes `Unknown`
/// (HTTP 500) with the original message preserved.
pub fn classify(error: CrosscastError) -> DomainError {
    match error {
        CrosscastError::Domain(domain) => domain,
        CrosscastError::Platform(platform) => DomainError::Unknown {
            transient: platform.is_transient(),
            message: platform.to_string(),
        },
        other => DomainError::Unknown {
            message: other.to_string(),
            transient: false,
        },
    }
}
