//! Lease-provider trait and the typed outcomes backends classify into.
//!
//! Providers translate backing-store status codes into these outcomes at the
//! boundary, so the lock manager never inspects transport-specific codes.
//! Classification rules shared by every backend:
//!
//! - 409 and 412 on create both mean "lost the creation race" (`NotCreated`).
//! - 409 on acquire means another holder owns the lease (`Conflict`).
//! - 404 on acquire means the backing object is missing (`NotFound`);
//!   the caller creates it and retries once.
//! - 5xx and status-less network failures during renew are `Transient`.
//! - 404/409/412 during renew mean the lease is gone (`Lost`); so does any
//!   other status not recognized above.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{ProviderError, RenewError};
use crate::scope::LockId;

/// Outcome of an acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The lease is ours; the store-assigned token proves ownership.
    Acquired(String),
    /// Another holder currently owns the lease.
    Conflict,
    /// The backing object does not exist yet.
    NotFound,
}

/// Outcome of a create-if-absent attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    /// We created the backing object.
    Created,
    /// Someone else created it first, or an incompatible lease blocked the
    /// write. Not an error; the caller proceeds to acquire.
    NotCreated,
}

/// Transport-level adapter performing the primitive lease operations
/// against one backing store.
#[async_trait]
pub trait LeaseProvider: Send + Sync + 'static {
    /// Create the backing object representing the lock if it does not exist.
    ///
    /// Losing a creation race is reported as [`CreateOutcome::NotCreated`],
    /// never as an error.
    async fn create_if_absent(&self, lock_id: &LockId) -> Result<CreateOutcome, ProviderError>;

    /// Attempt to obtain exclusive ownership for `period`.
    ///
    /// `proposed_lease_id` lets the caller pick the lease token up front so
    /// retries are idempotent; backends that assign their own tokens ignore
    /// it.
    async fn try_acquire(
        &self,
        lock_id: &LockId,
        period: Duration,
        proposed_lease_id: Option<&str>,
    ) -> Result<AcquireOutcome, ProviderError>;

    /// Extend the lease identified by `lease_id`.
    ///
    /// # Errors
    /// [`RenewError::Transient`] for server-side failures worth retrying
    /// sooner; [`RenewError::Lost`] when ownership is gone for good.
    async fn renew(&self, lock_id: &LockId, lease_id: &str) -> Result<(), RenewError>;

    /// Release the lease. Best-effort: "already expired" and "taken by
    /// someone else" are benign no-ops.
    async fn release(&self, lock_id: &LockId, lease_id: &str) -> Result<(), ProviderError>;

    /// Read the owner tag. Returns `None` when the lease is observably
    /// available, even if a stale tag from a prior owner remains.
    async fn owner(&self, lock_id: &LockId) -> Result<Option<String>, ProviderError>;

    /// Write the owner tag, conditioned on holding `lease_id`. Best-effort:
    /// silently ignored if the backing object disappeared or the lease
    /// changed hands.
    async fn set_owner(
        &self,
        lock_id: &LockId,
        lease_id: &str,
        owner: &str,
    ) -> Result<(), ProviderError>;
}
