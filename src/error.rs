//! Error types for the offline cache

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the offline cache
///
/// Only [`Error::FetchFailed`] ever reaches a reader, and only on a cold miss.
/// Everything else is raised by the storage layer and absorbed by the tier
/// that produced it.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML configuration parse error
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// Durable tier read or write failed
    #[error("Storage unavailable in {tier} tier: {reason}")]
    StorageUnavailable { tier: String, reason: String },

    /// Durable tier refused a write for lack of space
    #[error("Quota exceeded in {tier} tier: {reason}")]
    QuotaExceeded { tier: String, reason: String },

    /// Entry written under another schema version
    #[error("Schema mismatch for {key}: found {found}, expected {expected}")]
    SchemaMismatch {
        key: String,
        found: String,
        expected: String,
    },

    // =========================================================================
    // Fetch Errors
    // =========================================================================
    /// Remote source failed and nothing was cached for the key
    #[error("Fetch failed for {key}: {reason}")]
    FetchFailed { key: String, reason: String },

    /// Remote source did not answer in time
    #[error("Fetch for {key} timed out after {timeout_ms}ms")]
    FetchTimeout { key: String, timeout_ms: u64 },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a `StorageUnavailable` error for a tier
    pub fn storage(tier: impl std::fmt::Display, reason: impl std::fmt::Display) -> Self {
        Error::StorageUnavailable {
            tier: tier.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Build a `QuotaExceeded` error for a tier
    pub fn quota(tier: impl std::fmt::Display, reason: impl std::fmt::Display) -> Self {
        Error::QuotaExceeded {
            tier: tier.to_string(),
            reason: reason.to_string(),
        }
    }

    /// True for errors that an eviction pass may resolve
    pub fn is_quota(&self) -> bool {
        matches!(self, Error::QuotaExceeded { .. })
    }
}
