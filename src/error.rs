//! Error types for workq operations.
//!
//! Errors are split along the taxonomy the engine recovers from:
//! - Store adapter failures (transient network errors are retried, the rest surface)
//! - Configuration errors (fatal at startup, refused before any loop begins)
//!
//! Ownership conflicts (`NotOwner`, `Expired`) are not errors: they are ordinary
//! outcomes of [`crate::store::RenewOutcome`] and [`crate::store::FinishOutcome`].

use thiserror::Error;

/// Errors that can occur while talking to the backing store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to establish a connection to the store.
    #[error("Store connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis command or script failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// A job or dead-letter entry could not be (de)serialized.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A script returned a reply the adapter does not understand.
    #[error("Unexpected store reply: {0}")]
    UnexpectedReply(String),

    /// The worker already holds a processing record and may not claim another.
    #[error("Worker '{0}' already holds a lease")]
    LeaseHeld(String),
}

impl StoreError {
    /// Returns whether the error is worth retrying with backoff.
    ///
    /// Only network-level failures qualify; script errors, bad replies and
    /// serialization problems are deterministic and retrying would not help.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::ConnectionFailed(_) => true,
            StoreError::Redis(e) => {
                e.is_io_error()
                    || e.is_timeout()
                    || e.is_connection_dropped()
                    || e.is_connection_refusal()
                    || matches!(
                        e.kind(),
                        redis::ErrorKind::TryAgain | redis::ErrorKind::BusyLoadingError
                    )
            }
            StoreError::Serialization(_)
            | StoreError::UnexpectedReply(_)
            | StoreError::LeaseHeld(_) => false,
        }
    }
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A priority weight was zero or negative.
    #[error("Priority '{name}' has weight {weight}; weights must be positive integers")]
    InvalidWeight { name: String, weight: i64 },

    /// A priority name appears more than once.
    #[error("Priority '{0}' is declared more than once")]
    DuplicatePriority(String),

    /// A setting has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Lease timings do not leave room for a missed renewal.
    #[error("Lease timing invalid: {0}")]
    LeaseTiming(String),

    /// Failed to read the configuration file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl ConfigError {
    pub(crate) fn invalid(key: &str, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            key: key.to_string(),
            message: message.into(),
        }
    }
}
