//! Error types for the watcher.
//!
//! - [`FetchError`] - balance or status retrieval failures
//! - [`NotificationEmitError`] - a single notification could not be delivered
//! - [`ConfigError`] - bad or missing environment configuration
//! - [`AppError`] - top-level error wrapping the above
//!
//! `From` conversions let `?` cross layers.

use thiserror::Error;

/// Failures retrieving balances or transaction status.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// Network or HTTP-level failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Credentials were rejected (401/403). The session layer is expected
    /// to refresh them on its own.
    #[error("Authentication expired: {0}")]
    AuthExpired(String),

    /// The request did not resolve within the configured bound.
    #[error("Request timed out after {0}s")]
    Timeout(u64),

    /// The backend answered but the body could not be understood.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Failure delivering one notification.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NotificationEmitError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Notification rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },
}

/// Environment configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} not set")]
    Missing(String),

    #[error("Invalid value for {var}: {message}")]
    Invalid { var: String, message: String },
}

/// Top-level application error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AppError {
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Notification error: {0}")]
    Notification(#[from] NotificationEmitError),

    /// A snapshot came back for someone other than the active session.
    #[error("Snapshot owner mismatch: expected {expected}, got {actual}")]
    MismatchedIdentity { expected: String, actual: String },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Validation error: {0}")]
    Validation(String),

    /// No session is active, so there is nobody to fetch for.
    #[error("No active session")]
    SessionUnavailable,
}

impl AppError {
    /// True when the failure is an authentication-expiry signal.
    #[must_use]
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, Self::Fetch(FetchError::AuthExpired(_)))
    }
}

/// Result alias used across the crate.
pub type AppResult<T> = Result<T, AppError>;
