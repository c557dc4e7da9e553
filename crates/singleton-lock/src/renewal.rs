//! Self-rescheduling lease renewal.
//!
//! One spawned task per acquired lease. The loop computes its own next
//! delay after every execution: half the lease period in steady state,
//! shrinking after transient failures to race the renewal in before the
//! lease expires, and terminal on fatal failures. Renewals for a handle are
//! strictly sequential; the next sleep is only armed after the current
//! execution finishes, and `stop` waits for the task so nothing can run
//! after it returns.

use std::cmp;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::RenewError;
use crate::providers::LeaseProvider;
use crate::scope::LockId;

/// Renewal bookkeeping, mutated only by the renewal loop.
#[derive(Debug, Clone)]
pub struct RenewalState {
    /// Wall-clock time of the last successful renewal.
    pub last_renewal: Option<DateTime<Utc>>,
    /// Round-trip latency of the last successful renewal.
    pub last_renewal_latency: Option<Duration>,
    /// Delay currently scheduled before the next renewal.
    pub current_delay: Duration,
}

/// Details handed to the lease-lost hook.
#[derive(Debug, Clone)]
pub struct LeaseLost {
    /// The lock whose lease is gone.
    pub lock_id: LockId,
    /// Store-reported error code of the fatal failure.
    pub code: String,
}

type LostCallback = Box<dyn FnOnce(LeaseLost) + Send>;

enum HookState {
    Armed(Option<LostCallback>),
    Fired(LeaseLost),
}

/// Exactly-once lease-lost notification.
///
/// The renewal loop fires the hook on fatal failure; whoever holds the
/// handle registers a callback. Registration after the loss fires the
/// callback immediately, so a loss between acquisition and registration is
/// never missed.
pub struct LostHook {
    state: Mutex<HookState>,
}

impl LostHook {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(HookState::Armed(None)),
        }
    }

    /// Register the callback invoked when the lease is lost. A second
    /// registration replaces the first.
    pub fn on_lost(&self, callback: impl FnOnce(LeaseLost) + Send + 'static) {
        let lost = {
            let mut state = self.state.lock().unwrap();
            match &mut *state {
                HookState::Armed(slot) => {
                    *slot = Some(Box::new(callback));
                    return;
                }
                HookState::Fired(lost) => lost.clone(),
            }
        };
        callback(lost);
    }

    /// Whether the lease has been reported lost.
    #[must_use]
    pub fn is_fired(&self) -> bool {
        matches!(&*self.state.lock().unwrap(), HookState::Fired(_))
    }

    fn fire(&self, lost: LeaseLost) {
        let mut state = self.state.lock().unwrap();
        if matches!(&*state, HookState::Fired(_)) {
            return;
        }
        let previous = std::mem::replace(&mut *state, HookState::Fired(lost.clone()));
        drop(state);
        if let HookState::Armed(Some(callback)) = previous {
            callback(lost);
        }
    }
}

/// Steady-state renewal delay: half the lease period, floored.
pub(crate) fn normal_delay(period: Duration, minimum: Duration) -> Duration {
    cmp::max(period / 2, minimum)
}

/// Post-failure renewal delay: halve the current delay, floored.
pub(crate) fn speedup_delay(current: Duration, minimum: Duration) -> Duration {
    cmp::max(current / 2, minimum)
}

/// Handle to the background renewal task for one lease.
pub(crate) struct RenewalTimer {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl RenewalTimer {
    /// Spawn the renewal loop for an acquired lease.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn start(
        provider: Arc<dyn LeaseProvider>,
        lock_id: LockId,
        lease_id: String,
        period: Duration,
        minimum_interval: Duration,
        state: Arc<Mutex<RenewalState>>,
        hook: Arc<LostHook>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            renewal_loop(
                provider,
                lock_id,
                lease_id,
                period,
                minimum_interval,
                state,
                hook,
                loop_cancel,
            )
            .await;
        });
        Self {
            cancel,
            task: Some(task),
        }
    }

    /// Stop the loop and wait for it to finish. After this returns no
    /// further renewal can execute.
    pub(crate) async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                error!(error = %err, "renewal task did not shut down cleanly");
            }
        }
    }
}

impl Drop for RenewalTimer {
    fn drop(&mut self) {
        // Backstop for handles dropped without an explicit release.
        self.cancel.cancel();
    }
}

#[allow(clippy::too_many_arguments)]
async fn renewal_loop(
    provider: Arc<dyn LeaseProvider>,
    lock_id: LockId,
    lease_id: String,
    period: Duration,
    minimum_interval: Duration,
    state: Arc<Mutex<RenewalState>>,
    hook: Arc<LostHook>,
    cancel: CancellationToken,
) {
    let mut delay = normal_delay(period, minimum_interval);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }

        let started = Instant::now();
        match provider.renew(&lock_id, &lease_id).await {
            Ok(()) => {
                let latency = started.elapsed();
                delay = normal_delay(period, minimum_interval);
                {
                    let mut state = state.lock().unwrap();
                    state.last_renewal = Some(Utc::now());
                    state.last_renewal_latency = Some(latency);
                    state.current_delay = delay;
                }
                debug!(
                    lock_id = %lock_id,
                    latency_ms = latency.as_millis() as u64,
                    "lease renewed"
                );
            }
            Err(err @ RenewError::Transient { .. }) => {
                delay = speedup_delay(delay, minimum_interval);
                state.lock().unwrap().current_delay = delay;
                warn!(
                    lock_id = %lock_id,
                    code = %err.code(),
                    retry_in_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient renewal failure, retrying sooner"
                );
            }
            Err(err @ RenewError::Lost { .. }) => {
                let (last_renewal, last_latency) = {
                    let state = state.lock().unwrap();
                    (state.last_renewal, state.last_renewal_latency)
                };
                let ms_since_renewal = last_renewal
                    .map(|at| (Utc::now() - at).num_milliseconds())
                    .unwrap_or(-1);
                error!(
                    lock_id = %lock_id,
                    code = %err.code(),
                    last_renewal = ?last_renewal,
                    ms_since_last_renewal = ms_since_renewal,
                    last_renewal_latency_ms =
                        last_latency.map_or(-1, |latency| latency.as_millis() as i64),
                    lease_period_ms = period.as_millis() as u64,
                    error = %err,
                    "lease lost, stopping renewal"
                );
                hook.fire(LeaseLost {
                    lock_id: lock_id.clone(),
                    code: err.code().to_string(),
                });
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steady_state_delay_is_half_the_period() {
        assert_eq!(
            normal_delay(Duration::from_secs(30), Duration::from_secs(1)),
            Duration::from_secs(15)
        );
    }

    #[test]
    fn tiny_periods_are_floored_at_the_minimum() {
        assert_eq!(
            normal_delay(Duration::from_millis(500), Duration::from_secs(1)),
            Duration::from_secs(1)
        );
        assert_eq!(
            speedup_delay(Duration::from_millis(900), Duration::from_secs(1)),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn failures_halve_the_delay_until_the_floor() {
        let minimum = Duration::from_secs(1);
        let mut delay = normal_delay(Duration::from_secs(30), minimum);
        delay = speedup_delay(delay, minimum);
        assert_eq!(delay, Duration::from_millis(7500));
        for _ in 0..10 {
            delay = speedup_delay(delay, minimum);
        }
        assert_eq!(delay, minimum);
    }

    #[test]
    fn hook_fires_exactly_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let hook = LostHook::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let count = fired.clone();
        hook.on_lost(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        });

        let lost = LeaseLost {
            lock_id: LockId::new("a"),
            code: "LeaseIdMismatch".to_string(),
        };
        hook.fire(lost.clone());
        hook.fire(lost);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(hook.is_fired());
    }

    #[test]
    fn late_registration_fires_immediately() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let hook = LostHook::new();
        hook.fire(LeaseLost {
            lock_id: LockId::new("a"),
            code: "Conflict".to_string(),
        });

        let fired = Arc::new(AtomicUsize::new(0));
        let count = fired.clone();
        hook.on_lost(move |lost| {
            assert_eq!(lost.code, "Conflict");
            count.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
