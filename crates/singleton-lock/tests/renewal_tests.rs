//! Renewal-timer cadence and lease-lost propagation tests.
//!
//! These run under the paused clock so the timer's self-computed delays can
//! be observed exactly.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use singleton_lock::{
    LeaseProvider, LockId, LockManager, MemoryLeaseProvider, RenewError, SingletonConfig,
};
use tokio_util::sync::CancellationToken;

const PERIOD: Duration = Duration::from_secs(30);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn manager_over(provider: &Arc<MemoryLeaseProvider>) -> Arc<LockManager> {
    let manager = LockManager::new(
        provider.clone() as Arc<dyn LeaseProvider>,
        SingletonConfig::default(),
    )
    .expect("default config validates");
    Arc::new(manager)
}

async fn settle() {
    for _ in 0..25 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn renews_at_half_the_lease_period() {
    init_tracing();
    let provider = Arc::new(MemoryLeaseProvider::new());
    let manager = manager_over(&provider);
    let lock_id = LockId::new("cadenced");
    let cancel = CancellationToken::new();

    let handle = manager
        .try_lock(&lock_id, None, PERIOD, &cancel, false)
        .await
        .unwrap()
        .expect("acquisition succeeds");
    settle().await;

    // Nothing before the half-period mark.
    tokio::time::advance(Duration::from_secs(14)).await;
    settle().await;
    assert_eq!(provider.renewals(&lock_id), 0);

    // First renewal lands at period/2 = 15s.
    tokio::time::advance(Duration::from_secs(2)).await;
    settle().await;
    assert_eq!(provider.renewals(&lock_id), 1);
    assert!(handle.renewal_state().last_renewal.is_some());

    manager.release_lock(&handle, &cancel).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn transient_failure_shortens_the_next_delay() {
    init_tracing();
    let provider = Arc::new(MemoryLeaseProvider::new());
    let manager = manager_over(&provider);
    let lock_id = LockId::new("flaky");
    let cancel = CancellationToken::new();

    let handle = manager
        .try_lock(&lock_id, None, PERIOD, &cancel, false)
        .await
        .unwrap()
        .expect("acquisition succeeds");
    settle().await;

    // Healthy first renewal at t=15.
    tokio::time::advance(Duration::from_secs(16)).await;
    settle().await;
    assert_eq!(provider.renewals(&lock_id), 1);

    // The renewal at t=31 hits a server-side failure: the timer must come
    // back sooner than another half period.
    provider.inject_renew_failure(RenewError::Transient {
        code: "ServerBusy".to_string(),
        message: "503".to_string(),
    });
    tokio::time::advance(Duration::from_secs(15)).await;
    settle().await;
    assert_eq!(provider.renewals(&lock_id), 1, "failed attempt records nothing");
    let delay = handle.renewal_state().current_delay;
    assert!(
        delay < Duration::from_secs(15),
        "retry delay {delay:?} must drop below period/2"
    );

    // The sped-up retry succeeds well before the next half-period mark.
    tokio::time::advance(Duration::from_secs(8)).await;
    settle().await;
    assert_eq!(provider.renewals(&lock_id), 2);

    manager.release_lock(&handle, &cancel).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn fatal_failure_stops_renewal_and_fires_the_hook_once() {
    init_tracing();
    let provider = Arc::new(MemoryLeaseProvider::new());
    let manager = manager_over(&provider);
    let lock_id = LockId::new("doomed");
    let cancel = CancellationToken::new();

    let handle = manager
        .try_lock(&lock_id, None, PERIOD, &cancel, false)
        .await
        .unwrap()
        .expect("acquisition succeeds");
    let fired = Arc::new(AtomicUsize::new(0));
    let count = fired.clone();
    handle.on_lost(move |lost| {
        assert_eq!(lost.code, "LeaseIdMismatch");
        count.fetch_add(1, Ordering::SeqCst);
    });
    settle().await;

    provider.inject_renew_failure(RenewError::Lost {
        code: "LeaseIdMismatch".to_string(),
        message: "someone else holds the lease".to_string(),
    });
    tokio::time::advance(Duration::from_secs(16)).await;
    settle().await;

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(handle.is_lost());
    assert_eq!(provider.renewals(&lock_id), 0);

    // The timer is terminal: no renewal ever runs again for this handle.
    tokio::time::advance(Duration::from_secs(120)).await;
    settle().await;
    assert_eq!(provider.renewals(&lock_id), 0);
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    // Releasing the invalidated handle stays benign.
    manager.release_lock(&handle, &cancel).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn no_renewal_can_run_after_release() {
    init_tracing();
    let provider = Arc::new(MemoryLeaseProvider::new());
    let manager = manager_over(&provider);
    let lock_id = LockId::new("stopped");
    let cancel = CancellationToken::new();

    let handle = manager
        .try_lock(&lock_id, None, PERIOD, &cancel, false)
        .await
        .unwrap()
        .expect("acquisition succeeds");
    settle().await;

    // Release awaits the timer stop; the already-scheduled execution must
    // never start afterwards.
    manager.release_lock(&handle, &cancel).await.unwrap();
    tokio::time::advance(Duration::from_secs(120)).await;
    settle().await;
    assert_eq!(provider.renewals(&lock_id), 0);
}
