//! # singleton-lock
//!
//! Distributed lease-based mutual exclusion: only one process among many
//! competing instances holds a named lock at a time, backed by a shared
//! store with native lease semantics (exclusive, time-bounded, renewable,
//! breakable on expiry).
//!
//! The pieces, leaves first:
//!
//! - [`providers`]: the [`LeaseProvider`] boundary and its backends — blob
//!   leases over the blob REST protocol, Kubernetes `Lease` objects, and an
//!   in-memory store for tests. Providers classify backing-store status
//!   codes into typed outcomes so nothing above them touches transport
//!   codes.
//! - [`LockManager`]: the acquisition protocol (create-on-missing with a
//!   single retry, conflict polling up to a timeout, owner metadata
//!   write-back) producing a [`LeaseHandle`].
//! - The renewal timer behind every handle: renews at half the lease
//!   period, speeds up on transient failures, and reports the lease lost on
//!   fatal ones.
//! - [`SingletonListener`]: binds a lock to an inner listener's start/stop
//!   lifecycle, with a recovery poll for locks held by crashed hosts and a
//!   transparent restart when the lease is lost mid-run.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use singleton_lock::{Backend, LockId, LockManager, SingletonConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> singleton_lock::Result<()> {
//! let provider = Backend::Memory.connect().await?;
//! let manager = LockManager::new(provider, SingletonConfig::default())?;
//!
//! let lock_id = LockId::new("OrderProcessor.Run");
//! let cancel = CancellationToken::new();
//! if let Some(handle) = manager
//!     .try_lock(&lock_id, Some("host-a"), Duration::from_secs(30), &cancel, false)
//!     .await?
//! {
//!     // ... do singleton work while the lease renews in the background ...
//!     manager.release_lock(&handle, &cancel).await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod listener;
pub mod manager;
pub mod providers;
pub mod renewal;
pub mod scope;

pub use cache::ProviderCache;
pub use config::{ConfigError, SingletonConfig};
pub use error::{Error, ProviderError, RenewError, Result};
pub use listener::{Listener, SingletonListener};
pub use manager::{LeaseHandle, LockManager};
pub use providers::{
    AcquireOutcome, Backend, BlobLeaseConfig, BlobLeaseProvider, CreateOutcome,
    KubernetesLeaseConfig, KubernetesLeaseProvider, LeaseProvider, MemoryLeaseProvider,
};
pub use renewal::{LeaseLost, RenewalState};
pub use scope::{LockId, LockScope};
