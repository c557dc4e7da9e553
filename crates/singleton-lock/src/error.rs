//! Error types for lock acquisition, renewal, and the provider boundary.
//!
//! Benign outcomes (lease held by someone else, backing object missing,
//! creation race lost) are not errors; they are values of
//! [`crate::providers::AcquireOutcome`] and [`crate::providers::CreateOutcome`].
//! Everything in this module is something that actually went wrong.

use std::time::Duration;

use thiserror::Error;

use crate::scope::LockId;

/// Result type for lock operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level errors surfaced to lock-manager and listener callers.
#[derive(Debug, Error)]
pub enum Error {
    /// The blocking `lock` call could not acquire the lock in time.
    #[error("unable to acquire lock '{lock_id}' within {timeout:?}")]
    AcquisitionTimeout {
        /// The lock that could not be acquired.
        lock_id: LockId,
        /// The configured acquisition timeout.
        timeout: Duration,
    },

    /// The caller's cancellation token fired during a blocking operation.
    #[error("lock operation cancelled")]
    Cancelled,

    /// A provider (backing store) operation failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Configuration rejected by validation.
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    /// The wrapped listener failed to start.
    #[error("listener failed to start: {0}")]
    Listener(anyhow::Error),
}

/// Errors raised at the lease-provider boundary.
///
/// Providers classify backing-store status codes into typed outcomes before
/// they reach the lock manager; whatever is left over (transport failures,
/// unexpected status codes, bad configuration) comes out as one of these.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// HTTP transport failure (blob backend).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Kubernetes API failure (kubernetes backend).
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// The backing store returned a status this subsystem does not handle.
    #[error("backing store error: {status} {code}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Store-reported error code, when present.
        code: String,
        /// Human-readable detail.
        message: String,
    },

    /// Provider construction rejected its configuration.
    #[error("invalid provider configuration: {0}")]
    InvalidConfig(String),
}

/// Renewal failure, classified at the provider boundary.
///
/// The classification drives the renewal timer's backoff-vs-abort decision:
/// `Transient` speeds the timer up, `Lost` terminates it.
#[derive(Debug, Clone, Error)]
pub enum RenewError {
    /// Server-side or network failure; the lease may still be ours.
    #[error("transient renewal failure ({code}): {message}")]
    Transient {
        /// Store-reported error code or status.
        code: String,
        /// Human-readable detail.
        message: String,
    },

    /// The lease is gone: id mismatch, permanent denial, or the backing
    /// object disappeared. Unrecoverable for the current handle.
    #[error("lease lost ({code}): {message}")]
    Lost {
        /// Store-reported error code or status.
        code: String,
        /// Human-readable detail.
        message: String,
    },
}

impl RenewError {
    /// Store-reported error code for log output.
    #[must_use]
    pub fn code(&self) -> &str {
        match self {
            Self::Transient { code, .. } | Self::Lost { code, .. } => code,
        }
    }

    /// Whether the renewal timer should retry sooner rather than abort.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}
