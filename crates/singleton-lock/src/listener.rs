//! Binding of lock ownership to a long-running listener's lifecycle.
//!
//! The wrapper acquires the listener lock without the manager's short
//! conflict poll; when the lock is held elsewhere it arms its own
//! low-frequency recovery poll instead, which keeps retrying indefinitely
//! because the current holder's host may have crashed and its lease will
//! expire eventually. A lost lease stops the inner listener and
//! transparently restarts the whole acquisition cycle.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::manager::{LeaseHandle, LockManager};
use crate::renewal::LeaseLost;
use crate::scope::LockId;

/// A long-running listener whose lifetime the singleton wrapper controls.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    /// Begin listening.
    async fn start(&self) -> anyhow::Result<()>;

    /// Stop listening. Must tolerate being called when not started.
    async fn stop(&self);
}

/// Boxed, `Send` future. Returned by the recursive acquisition methods so
/// the `Send` auto-trait solver can resolve the `start` →
/// `attach_and_start` → spawned `handle_lease_lost` → `start` cycle: boxing
/// erases the same-module opaque `async fn` return types that the solver
/// otherwise cannot inspect within their defining scope.
type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

struct RecoveryTask {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct ListenerState {
    handle: Option<Arc<LeaseHandle>>,
    recovery: Option<RecoveryTask>,
    inner_running: bool,
}

/// Wraps an inner listener so only the lock holder runs it.
pub struct SingletonListener {
    manager: Arc<LockManager>,
    inner: Arc<dyn Listener>,
    lock_id: LockId,
    owner: Option<String>,
    state: tokio::sync::Mutex<ListenerState>,
    // Handed to background tasks (recovery poll, lost hook) so they never
    // keep the wrapper alive on their own.
    weak: Weak<SingletonListener>,
}

impl SingletonListener {
    /// Create the wrapper. `owner` is the diagnostic tag written to the
    /// lock's metadata while this instance holds it.
    pub fn new(
        manager: Arc<LockManager>,
        inner: Arc<dyn Listener>,
        lock_id: LockId,
        owner: Option<String>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            manager,
            inner,
            lock_id,
            owner,
            state: tokio::sync::Mutex::new(ListenerState::default()),
            weak: weak.clone(),
        })
    }

    /// Attempt to acquire the lock and start the inner listener.
    ///
    /// A failed acquisition is not an error: the recovery poll is armed
    /// (unless disabled by configuration) and keeps retrying until the lock
    /// frees up.
    ///
    /// # Errors
    /// Provider failures and inner-listener start failures propagate.
    pub fn start<'a>(&'a self, cancel: &'a CancellationToken) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if state.inner_running || state.recovery.is_some() {
                return Ok(());
            }

            let period = self.manager.config().listener_lock_period;
            match self
                .manager
                .try_lock(&self.lock_id, self.owner.as_deref(), period, cancel, false)
                .await?
            {
                Some(handle) => self.attach_and_start(&mut state, handle).await,
                None => {
                    match self.manager.config().listener_recovery_poll_interval {
                        Some(interval) => {
                            info!(
                                lock_id = %self.lock_id,
                                poll_interval_ms = interval.as_millis() as u64,
                                "singleton lock unavailable, starting recovery poll"
                            );
                            state.recovery = Some(self.spawn_recovery(interval));
                        }
                        None => {
                            debug!(
                                lock_id = %self.lock_id,
                                "singleton lock unavailable and recovery is disabled"
                            );
                        }
                    }
                    Ok(())
                }
            }
        })
    }

    /// Stop everything this wrapper owns: the recovery poll, the lock, the
    /// inner listener. Safe to call multiple times.
    pub async fn stop(&self, cancel: &CancellationToken) {
        let mut state = self.state.lock().await;
        if let Some(recovery) = state.recovery.take() {
            recovery.cancel.cancel();
            if let Err(err) = recovery.task.await {
                warn!(error = %err, "recovery task did not shut down cleanly");
            }
        }
        if let Some(handle) = state.handle.take() {
            if let Err(err) = self.manager.release_lock(&handle, cancel).await {
                warn!(lock_id = %self.lock_id, error = %err, "lock release failed during stop");
            }
        }
        if state.inner_running {
            self.inner.stop().await;
            state.inner_running = false;
        }
    }

    fn attach_and_start<'a>(
        &'a self,
        state: &'a mut ListenerState,
        handle: LeaseHandle,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let handle = Arc::new(handle);
            let weak = self.weak.clone();
            handle.on_lost(move |lost| {
                if let Some(listener) = weak.upgrade() {
                    tokio::spawn(async move {
                        listener.handle_lease_lost(lost).await;
                    });
                }
            });
            state.handle = Some(handle);

            self.inner.start().await.map_err(Error::Listener)?;
            state.inner_running = true;
            info!(lock_id = %self.lock_id, "singleton listener started");
            Ok(())
        })
    }

    fn spawn_recovery(&self, interval: Duration) -> RecoveryTask {
        let cancel = CancellationToken::new();
        let poll_cancel = cancel.clone();
        let weak = self.weak.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = poll_cancel.cancelled() => return,
                    () = tokio::time::sleep(interval) => {}
                }
                let Some(listener) = weak.upgrade() else { return };
                match listener.try_recover().await {
                    Ok(true) => return,
                    Ok(false) => {}
                    Err(err) => {
                        warn!(
                            lock_id = %listener.lock_id,
                            error = %err,
                            "recovery acquisition attempt failed"
                        );
                    }
                }
            }
        });
        RecoveryTask { cancel, task }
    }

    /// One recovery attempt. Returns `true` once the listener is running
    /// and the poll should end.
    fn try_recover(&self) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if state.inner_running {
                return Ok(true);
            }

            let period = self.manager.config().listener_lock_period;
            let cancel = CancellationToken::new();
            match self
                .manager
                .try_lock(&self.lock_id, self.owner.as_deref(), period, &cancel, false)
                .await?
            {
                Some(handle) => {
                    // Drop our own recovery bookkeeping without awaiting the
                    // task; the poll loop exits right after this returns.
                    if let Some(recovery) = state.recovery.take() {
                        recovery.cancel.cancel();
                    }
                    info!(lock_id = %self.lock_id, "singleton lock recovered");
                    self.attach_and_start(&mut state, handle).await?;
                    Ok(true)
                }
                None => Ok(false),
            }
        })
    }

    fn handle_lease_lost(&self, lost: LeaseLost) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            warn!(
                lock_id = %lost.lock_id,
                code = %lost.code,
                "singleton lease lost, restarting listener"
            );
            {
                let mut state = self.state.lock().await;
                if state.inner_running {
                    self.inner.stop().await;
                    state.inner_running = false;
                }
                if let Some(handle) = state.handle.take() {
                    let cancel = CancellationToken::new();
                    // Best-effort: the lease is already gone at the store.
                    if let Err(err) = self.manager.release_lock(&handle, &cancel).await {
                        debug!(lock_id = %self.lock_id, error = %err, "release after loss failed");
                    }
                }
            }

            // Self-healing restart, not an error path.
            let cancel = CancellationToken::new();
            if let Err(err) = self.start(&cancel).await {
                error!(
                    lock_id = %self.lock_id,
                    error = %err,
                    "listener restart after lease loss failed"
                );
            }
        })
    }
}
