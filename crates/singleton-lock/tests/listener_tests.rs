//! Singleton listener wrapper tests: recovery polling, lease-lost
//! self-healing, idempotent shutdown.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use singleton_lock::{
    AcquireOutcome, LeaseProvider, Listener, LockId, LockManager, MemoryLeaseProvider,
    RenewError, SingletonConfig, SingletonListener,
};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct CountingListener {
    starts: AtomicUsize,
    stops: AtomicUsize,
}

#[async_trait]
impl Listener for CountingListener {
    async fn start(&self) -> anyhow::Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
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
async fn starts_inner_listener_when_lock_is_free() {
    let provider = Arc::new(MemoryLeaseProvider::new());
    let manager = manager_over(&provider);
    let inner = Arc::new(CountingListener::default());
    let lock_id = LockId::new("Listener.Queue");
    let listener = SingletonListener::new(
        manager.clone(),
        inner.clone(),
        lock_id.clone(),
        Some("host-a".to_string()),
    );
    let cancel = CancellationToken::new();

    listener.start(&cancel).await.unwrap();
    assert_eq!(inner.starts.load(Ordering::SeqCst), 1);
    assert_eq!(
        manager.lock_owner(&lock_id).await.unwrap(),
        Some("host-a".to_string())
    );

    listener.stop(&cancel).await;
    assert_eq!(inner.stops.load(Ordering::SeqCst), 1);
    assert_eq!(manager.lock_owner(&lock_id).await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn recovery_poll_acquires_once_the_lock_frees_up() {
    let provider = Arc::new(MemoryLeaseProvider::new());
    let manager = manager_over(&provider);
    let inner = Arc::new(CountingListener::default());
    let lock_id = LockId::new("Listener.Queue");
    let listener =
        SingletonListener::new(manager.clone(), inner.clone(), lock_id.clone(), None);
    let cancel = CancellationToken::new();

    // Another host holds the lock without renewing (it has crashed).
    provider.create_if_absent(&lock_id).await.unwrap();
    let AcquireOutcome::Acquired(competitor) = provider
        .try_acquire(&lock_id, Duration::from_secs(60), Some("competitor"))
        .await
        .unwrap()
    else {
        panic!("competitor acquisition must succeed");
    };

    listener.start(&cancel).await.unwrap();
    assert_eq!(
        inner.starts.load(Ordering::SeqCst),
        0,
        "initial acquisition fails, listener must not start"
    );

    // Let the spawned recovery task poll once so its sleep timer is armed
    // before we fast-forward the paused clock; otherwise the advance lands
    // before the timer exists and cannot trigger it.
    settle().await;

    // The dead host's lease is released (or would expire); the recovery
    // poll picks the lock up at its next tick.
    provider.release(&lock_id, &competitor).await.unwrap();
    tokio::time::advance(Duration::from_secs(61)).await;
    settle().await;
    assert_eq!(inner.starts.load(Ordering::SeqCst), 1);

    // The poll is gone: nothing starts the listener a second time.
    tokio::time::advance(Duration::from_secs(180)).await;
    settle().await;
    assert_eq!(inner.starts.load(Ordering::SeqCst), 1);

    listener.stop(&cancel).await;
    assert_eq!(inner.stops.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn lease_loss_restarts_the_acquisition_cycle() {
    let provider = Arc::new(MemoryLeaseProvider::new());
    let manager = manager_over(&provider);
    let inner = Arc::new(CountingListener::default());
    let lock_id = LockId::new("Listener.Queue");
    let listener =
        SingletonListener::new(manager.clone(), inner.clone(), lock_id.clone(), None);
    let cancel = CancellationToken::new();

    listener.start(&cancel).await.unwrap();
    assert_eq!(inner.starts.load(Ordering::SeqCst), 1);
    settle().await;

    // The renewal halfway through the 60s listener lease comes back fatal.
    provider.inject_renew_failure(RenewError::Lost {
        code: "LeaseIdMismatch".to_string(),
        message: "lease stolen".to_string(),
    });
    tokio::time::advance(Duration::from_secs(31)).await;
    settle().await;

    // Self-healing: inner stopped once, then the cycle restarted and
    // reacquired the now-free lock.
    assert_eq!(inner.stops.load(Ordering::SeqCst), 1);
    assert_eq!(inner.starts.load(Ordering::SeqCst), 2);

    listener.stop(&cancel).await;
    assert_eq!(inner.stops.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn stop_is_idempotent() {
    let provider = Arc::new(MemoryLeaseProvider::new());
    let manager = manager_over(&provider);
    let inner = Arc::new(CountingListener::default());
    let lock_id = LockId::new("Listener.Queue");
    let listener =
        SingletonListener::new(manager.clone(), inner.clone(), lock_id.clone(), None);
    let cancel = CancellationToken::new();

    listener.start(&cancel).await.unwrap();
    listener.stop(&cancel).await;
    listener.stop(&cancel).await;
    assert_eq!(inner.stops.load(Ordering::SeqCst), 1);

    // A stopped wrapper can start a fresh cycle.
    listener.start(&cancel).await.unwrap();
    assert_eq!(inner.starts.load(Ordering::SeqCst), 2);
    listener.stop(&cancel).await;
}

#[tokio::test(start_paused = true)]
async fn disabled_recovery_makes_initial_failure_final() {
    let provider = Arc::new(MemoryLeaseProvider::new());
    let mut config = SingletonConfig::default();
    config.listener_recovery_poll_interval = None;
    let manager = Arc::new(
        LockManager::new(provider.clone() as Arc<dyn LeaseProvider>, config).unwrap(),
    );
    let inner = Arc::new(CountingListener::default());
    let lock_id = LockId::new("Listener.Queue");
    let listener =
        SingletonListener::new(manager.clone(), inner.clone(), lock_id.clone(), None);
    let cancel = CancellationToken::new();

    provider.create_if_absent(&lock_id).await.unwrap();
    let AcquireOutcome::Acquired(competitor) = provider
        .try_acquire(&lock_id, Duration::from_secs(60), Some("competitor"))
        .await
        .unwrap()
    else {
        panic!("competitor acquisition must succeed");
    };

    listener.start(&cancel).await.unwrap();
    provider.release(&lock_id, &competitor).await.unwrap();

    // No recovery poll exists to pick the freed lock up.
    tokio::time::advance(Duration::from_secs(600)).await;
    settle().await;
    assert_eq!(inner.starts.load(Ordering::SeqCst), 0);

    listener.stop(&cancel).await;
}
