//! Map-of-leases backend keyed by lock id.
//!
//! Time is measured with `tokio::time::Instant`, so tests running under the
//! paused clock drive expiry deterministically. Renewal faults can be
//! scripted to exercise the renewal timer's backoff and abort paths.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{ProviderError, RenewError};
use crate::providers::traits::{AcquireOutcome, CreateOutcome, LeaseProvider};
use crate::scope::LockId;

#[derive(Debug, Clone)]
struct LeaseRecord {
    lease_id: Option<String>,
    expires_at: Option<Instant>,
    period: Duration,
    owner: Option<String>,
    renewals: u32,
}

impl LeaseRecord {
    fn empty() -> Self {
        Self {
            lease_id: None,
            expires_at: None,
            period: Duration::ZERO,
            owner: None,
            renewals: 0,
        }
    }

    fn held(&self, now: Instant) -> bool {
        self.lease_id.is_some() && self.expires_at.is_some_and(|at| at > now)
    }
}

/// In-memory lease provider.
///
/// Matches the blob store's observable semantics: acquiring requires the
/// backing object to exist, a conflict is reported while another holder's
/// lease is live, and renewing an expired-but-unclaimed lease succeeds.
#[derive(Debug, Default)]
pub struct MemoryLeaseProvider {
    store: Mutex<HashMap<String, LeaseRecord>>,
    renew_faults: Mutex<VecDeque<RenewError>>,
}

impl MemoryLeaseProvider {
    /// Create an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a failure returned by the next `renew` call instead of
    /// touching the store.
    pub fn inject_renew_failure(&self, failure: RenewError) {
        self.renew_faults
            .lock()
            .unwrap()
            .push_back(failure);
    }

    /// Number of successful renewals recorded for `lock_id`.
    #[must_use]
    pub fn renewals(&self, lock_id: &LockId) -> u32 {
        self.store
            .lock()
            .unwrap()
            .get(lock_id.as_str())
            .map_or(0, |rec| rec.renewals)
    }

    /// Expire the current lease immediately, simulating a holder whose
    /// renewals stopped (crashed host). The owner tag is left in place.
    pub fn force_expire(&self, lock_id: &LockId) {
        if let Some(rec) = self.store.lock().unwrap().get_mut(lock_id.as_str()) {
            rec.expires_at = Some(Instant::now());
        }
    }
}

#[async_trait]
impl LeaseProvider for MemoryLeaseProvider {
    async fn create_if_absent(&self, lock_id: &LockId) -> Result<CreateOutcome, ProviderError> {
        let mut store = self.store.lock().unwrap();
        if store.contains_key(lock_id.as_str()) {
            Ok(CreateOutcome::NotCreated)
        } else {
            store.insert(lock_id.as_str().to_string(), LeaseRecord::empty());
            Ok(CreateOutcome::Created)
        }
    }

    async fn try_acquire(
        &self,
        lock_id: &LockId,
        period: Duration,
        proposed_lease_id: Option<&str>,
    ) -> Result<AcquireOutcome, ProviderError> {
        let now = Instant::now();
        let mut store = self.store.lock().unwrap();
        let Some(rec) = store.get_mut(lock_id.as_str()) else {
            return Ok(AcquireOutcome::NotFound);
        };
        if rec.held(now) {
            return Ok(AcquireOutcome::Conflict);
        }
        let lease_id = proposed_lease_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        rec.lease_id = Some(lease_id.clone());
        rec.expires_at = Some(now + period);
        rec.period = period;
        Ok(AcquireOutcome::Acquired(lease_id))
    }

    async fn renew(&self, lock_id: &LockId, lease_id: &str) -> Result<(), RenewError> {
        if let Some(fault) = self.renew_faults.lock().unwrap().pop_front() {
            return Err(fault);
        }
        let now = Instant::now();
        let mut store = self.store.lock().unwrap();
        let Some(rec) = store.get_mut(lock_id.as_str()) else {
            return Err(RenewError::Lost {
                code: "NotFound".to_string(),
                message: format!("no backing object for lock '{lock_id}'"),
            });
        };
        if rec.lease_id.as_deref() != Some(lease_id) {
            return Err(RenewError::Lost {
                code: "LeaseIdMismatch".to_string(),
                message: format!("lease for lock '{lock_id}' is held by someone else"),
            });
        }
        rec.expires_at = Some(now + rec.period);
        rec.renewals += 1;
        Ok(())
    }

    async fn release(&self, lock_id: &LockId, lease_id: &str) -> Result<(), ProviderError> {
        let mut store = self.store.lock().unwrap();
        if let Some(rec) = store.get_mut(lock_id.as_str()) {
            if rec.lease_id.as_deref() == Some(lease_id) {
                rec.lease_id = None;
                rec.expires_at = None;
            }
        }
        Ok(())
    }

    async fn owner(&self, lock_id: &LockId) -> Result<Option<String>, ProviderError> {
        let now = Instant::now();
        let store = self.store.lock().unwrap();
        Ok(store
            .get(lock_id.as_str())
            .filter(|rec| rec.held(now))
            .and_then(|rec| rec.owner.clone()))
    }

    async fn set_owner(
        &self,
        lock_id: &LockId,
        lease_id: &str,
        owner: &str,
    ) -> Result<(), ProviderError> {
        let mut store = self.store.lock().unwrap();
        if let Some(rec) = store.get_mut(lock_id.as_str()) {
            if rec.lease_id.as_deref() == Some(lease_id) {
                rec.owner = Some(owner.to_string());
            }
        }
        Ok(())
    }
}
