use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use super::refresh::RefreshLedger;

#[tokio::test]
async fn invokes_once_within_ttl() {
    let ledger = RefreshLedger::new();
    let calls = Arc::new(AtomicU32::new(0));

    for _ in 0..3 {
        let calls = calls.clone();
        ledger
            .run_if_stale("guid", "/test/if/eth0", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Some(60_000_000)
            })
            .await;
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn reinvokes_after_expiry() {
    let ledger = RefreshLedger::new();
    let calls = Arc::new(AtomicU32::new(0));

    for _ in 0..2 {
        let calls = calls.clone();
        ledger
            .run_if_stale("guid", "/test/if/eth0", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Some(5_000) // 5 ms
            })
            .await;
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(6)).await;
    let c = calls.clone();
    ledger
        .run_if_stale("guid", "/test/if/eth0", move || async move {
            c.fetch_add(1, Ordering::SeqCst);
            Some(5_000)
        })
        .await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn zero_ttl_means_always_stale() {
    let ledger = RefreshLedger::new();
    let calls = Arc::new(AtomicU32::new(0));
    for _ in 0..3 {
        let calls = calls.clone();
        ledger
            .run_if_stale("guid", "/p", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Some(0)
            })
            .await;
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn entries_are_per_path_and_per_guid() {
    let ledger = RefreshLedger::new();
    let calls = Arc::new(AtomicU32::new(0));
    for key in [("a", "/p"), ("a", "/q"), ("b", "/p")] {
        let calls = calls.clone();
        ledger
            .run_if_stale(key.0, key.1, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Some(60_000_000)
            })
            .await;
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn concurrent_readers_invoke_once() {
    let ledger = Arc::new(RefreshLedger::new());
    let calls = Arc::new(AtomicU32::new(0));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let ledger = ledger.clone();
        let calls = calls.clone();
        tasks.push(tokio::spawn(async move {
            ledger
                .run_if_stale("guid", "/shared", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Some(60_000_000)
                })
                .await;
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn forget_resets_staleness() {
    let ledger = RefreshLedger::new();
    let calls = Arc::new(AtomicU32::new(0));
    for _ in 0..2 {
        let calls = calls.clone();
        ledger
            .run_if_stale("guid", "/p", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Some(60_000_000)
            })
            .await;
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    ledger.forget("guid");
    let c = calls.clone();
    ledger
        .run_if_stale("guid", "/p", move || async move {
            c.fetch_add(1, Ordering::SeqCst);
            Some(60_000_000)
        })
        .await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
