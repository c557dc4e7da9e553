//! Lock acquisition protocol and the caller-held lease handle.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SingletonConfig;
use crate::error::{Error, Result};
use crate::providers::{AcquireOutcome, CreateOutcome, LeaseProvider};
use crate::renewal::{normal_delay, LeaseLost, LostHook, RenewalState, RenewalTimer};
use crate::scope::LockId;

/// Proof of current lease ownership plus its renewal machinery.
///
/// Handles are created by a successful acquisition and invalidated by
/// [`LockManager::release_lock`] or by a fatal renewal failure. Release is
/// idempotent: the handle tracks what is left to tear down, so releasing
/// twice (or after the lease expired underneath us) is a no-op.
pub struct LeaseHandle {
    lock_id: LockId,
    lease_id: String,
    lease_period: Duration,
    state: Arc<Mutex<RenewalState>>,
    hook: Arc<LostHook>,
    inner: tokio::sync::Mutex<HandleInner>,
}

struct HandleInner {
    lease_id: Option<String>,
    timer: Option<RenewalTimer>,
}

impl LeaseHandle {
    /// The lock this handle owns.
    #[must_use]
    pub fn lock_id(&self) -> &LockId {
        &self.lock_id
    }

    /// The store-assigned token proving ownership.
    #[must_use]
    pub fn lease_id(&self) -> &str {
        &self.lease_id
    }

    /// The declared lease period.
    #[must_use]
    pub fn lease_period(&self) -> Duration {
        self.lease_period
    }

    /// Snapshot of the renewal bookkeeping for diagnostics.
    #[must_use]
    pub fn renewal_state(&self) -> RenewalState {
        self.state.lock().unwrap().clone()
    }

    /// Register the callback fired when the lease is lost. Registering
    /// after the loss fires immediately.
    pub fn on_lost(&self, callback: impl FnOnce(LeaseLost) + Send + 'static) {
        self.hook.on_lost(callback);
    }

    /// Whether a fatal renewal failure has invalidated this handle.
    #[must_use]
    pub fn is_lost(&self) -> bool {
        self.hook.is_fired()
    }
}

impl std::fmt::Debug for LeaseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseHandle")
            .field("lock_id", &self.lock_id)
            .field("lease_period", &self.lease_period)
            .finish_non_exhaustive()
    }
}

/// Orchestrates lease-provider calls into the lock-acquisition protocol.
///
/// One manager serves any number of lock ids against a single backing
/// store; construct it over the provider chosen via
/// [`crate::providers::Backend`].
pub struct LockManager {
    provider: Arc<dyn LeaseProvider>,
    config: SingletonConfig,
}

impl LockManager {
    /// Build a manager over a connected provider.
    ///
    /// # Errors
    /// Returns the configuration validation error, if any.
    pub fn new(provider: Arc<dyn LeaseProvider>, config: SingletonConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { provider, config })
    }

    /// The timing configuration this manager applies.
    #[must_use]
    pub fn config(&self) -> &SingletonConfig {
        &self.config
    }

    /// Attempt to acquire `lock_id`, returning `None` when it cannot be
    /// obtained.
    ///
    /// With `retry` set, a conflicting holder is polled through at the
    /// configured interval until the acquisition timeout elapses.
    /// Cancellation aborts the poll and yields `None` rather than an error.
    ///
    /// # Errors
    /// Propagates provider failures that are not benign outcomes.
    pub async fn try_lock(
        &self,
        lock_id: &LockId,
        owner: Option<&str>,
        period: Duration,
        cancel: &CancellationToken,
        retry: bool,
    ) -> Result<Option<LeaseHandle>> {
        let proposed = Uuid::new_v4().to_string();
        match self
            .acquire_with_retry(lock_id, period, &proposed, cancel, retry, false)
            .await?
        {
            Some(lease_id) => Ok(Some(
                self.finish_acquisition(lock_id, owner, period, lease_id)
                    .await,
            )),
            None => Ok(None),
        }
    }

    /// Acquire `lock_id` or fail.
    ///
    /// # Errors
    /// [`Error::AcquisitionTimeout`] when the lock stays contended past the
    /// configured timeout; [`Error::Cancelled`] if the caller's token fires
    /// while waiting.
    pub async fn lock(
        &self,
        lock_id: &LockId,
        owner: Option<&str>,
        period: Duration,
        cancel: &CancellationToken,
    ) -> Result<LeaseHandle> {
        let proposed = Uuid::new_v4().to_string();
        match self
            .acquire_with_retry(lock_id, period, &proposed, cancel, true, true)
            .await?
        {
            Some(lease_id) => Ok(self
                .finish_acquisition(lock_id, owner, period, lease_id)
                .await),
            None => Err(Error::AcquisitionTimeout {
                lock_id: lock_id.clone(),
                timeout: self.config.acquisition_timeout,
            }),
        }
    }

    /// Release a held lock: stop its renewal timer, then release the lease.
    ///
    /// The timer stop is awaited in full before the release call, so a
    /// renewal can never fire after the lease has been given up and
    /// silently resurrect it. Safe to call more than once.
    ///
    /// # Errors
    /// [`Error::Cancelled`] if `cancel` fired (the timer is still stopped
    /// first); provider transport failures from the release call.
    pub async fn release_lock(
        &self,
        handle: &LeaseHandle,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut inner = handle.inner.lock().await;
        if let Some(timer) = inner.timer.take() {
            timer.stop().await;
        }
        if cancel.is_cancelled() {
            // Stop is guaranteed above; the lease itself is left to expire.
            return Err(Error::Cancelled);
        }
        if let Some(lease_id) = inner.lease_id.take() {
            self.provider.release(&handle.lock_id, &lease_id).await?;
            debug!(lock_id = %handle.lock_id, "lock released");
        }
        Ok(())
    }

    /// Read the owner tag for a lock. The result may be stale immediately
    /// after return; it is correct only at the time of the read.
    ///
    /// # Errors
    /// Propagates provider transport failures.
    pub async fn lock_owner(&self, lock_id: &LockId) -> Result<Option<String>> {
        Ok(self.provider.owner(lock_id).await?)
    }

    async fn acquire_with_retry(
        &self,
        lock_id: &LockId,
        period: Duration,
        proposed: &str,
        cancel: &CancellationToken,
        retry: bool,
        propagate_cancel: bool,
    ) -> Result<Option<String>> {
        let deadline = tokio::time::Instant::now() + self.config.acquisition_timeout;
        loop {
            if let Some(lease_id) = self.acquire_once(lock_id, period, proposed).await? {
                return Ok(Some(lease_id));
            }
            if !retry || tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!(lock_id = %lock_id, "acquisition poll cancelled");
                    return if propagate_cancel {
                        Err(Error::Cancelled)
                    } else {
                        Ok(None)
                    };
                }
                () = tokio::time::sleep(self.config.acquisition_poll_interval) => {}
            }
        }
    }

    /// One acquisition round: acquire, create the backing object on 404,
    /// then retry the acquire exactly once.
    async fn acquire_once(
        &self,
        lock_id: &LockId,
        period: Duration,
        proposed: &str,
    ) -> Result<Option<String>> {
        match self
            .provider
            .try_acquire(lock_id, period, Some(proposed))
            .await?
        {
            AcquireOutcome::Acquired(lease_id) => Ok(Some(lease_id)),
            AcquireOutcome::Conflict => Ok(None),
            AcquireOutcome::NotFound => {
                match self.provider.create_if_absent(lock_id).await? {
                    CreateOutcome::Created => {
                        debug!(lock_id = %lock_id, "created backing object for lock");
                    }
                    CreateOutcome::NotCreated => {
                        debug!(lock_id = %lock_id, "backing object created by a competitor");
                    }
                }
                match self
                    .provider
                    .try_acquire(lock_id, period, Some(proposed))
                    .await?
                {
                    AcquireOutcome::Acquired(lease_id) => Ok(Some(lease_id)),
                    AcquireOutcome::Conflict | AcquireOutcome::NotFound => Ok(None),
                }
            }
        }
    }

    async fn finish_acquisition(
        &self,
        lock_id: &LockId,
        owner: Option<&str>,
        period: Duration,
        lease_id: String,
    ) -> LeaseHandle {
        if let Some(owner) = owner {
            // Metadata is diagnostic; a failed write never unwinds the lease.
            if let Err(err) = self.provider.set_owner(lock_id, &lease_id, owner).await {
                warn!(lock_id = %lock_id, error = %err, "owner metadata write failed");
            }
        }

        let state = Arc::new(Mutex::new(RenewalState {
            last_renewal: None,
            last_renewal_latency: None,
            current_delay: normal_delay(period, self.config.minimum_renewal_interval),
        }));
        let hook = Arc::new(LostHook::new());
        let timer = RenewalTimer::start(
            self.provider.clone(),
            lock_id.clone(),
            lease_id.clone(),
            period,
            self.config.minimum_renewal_interval,
            state.clone(),
            hook.clone(),
        );
        info!(
            lock_id = %lock_id,
            period_ms = period.as_millis() as u64,
            "lock acquired"
        );

        LeaseHandle {
            lock_id: lock_id.clone(),
            lease_id: lease_id.clone(),
            lease_period: period,
            state,
            hook,
            inner: tokio::sync::Mutex::new(HandleInner {
                lease_id: Some(lease_id),
                timer: Some(timer),
            }),
        }
    }
}
