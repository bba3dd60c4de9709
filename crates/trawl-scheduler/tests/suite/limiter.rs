use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use trawl_core::ErrorKind;
use trawl_scheduler::{CancellationToken, ConcurrencyLimiter};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn never_exceeds_limit_under_contention() -> Result<()> {
    let limiter = ConcurrencyLimiter::new(3);
    let cancel = CancellationToken::new();
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..24 {
        let limiter = limiter.clone();
        let cancel = cancel.clone();
        let current = Arc::clone(&current);
        let peak = Arc::clone(&peak);
        handles.push(tokio::spawn(async move {
            let _permit = limiter.acquire(&cancel).await?;
            let now = current.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(2)).await;
            current.fetch_sub(1, Ordering::SeqCst);
            Ok::<_, trawl_core::Error>(())
        }));
    }
    for handle in handles {
        handle.await??;
    }

    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(limiter.in_flight(), 0);
    Ok(())
}

#[tokio::test]
async fn cancelled_waiter_returns_cancelled() -> Result<()> {
    let limiter = ConcurrencyLimiter::new(1);
    let cancel = CancellationToken::new();
    let _held = limiter.acquire(&cancel).await?;

    let waiter_cancel = CancellationToken::new();
    let waiter = {
        let limiter = limiter.clone();
        let waiter_cancel = waiter_cancel.clone();
        tokio::spawn(async move { limiter.acquire(&waiter_cancel).await.map(|_| ()) })
    };
    tokio::task::yield_now().await;
    waiter_cancel.cancel();

    let err = waiter.await?.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(limiter.in_flight(), 1);
    Ok(())
}

#[tokio::test]
async fn growing_the_limit_wakes_waiters() -> Result<()> {
    let limiter = ConcurrencyLimiter::new(1);
    let cancel = CancellationToken::new();
    let _held = limiter.acquire(&cancel).await?;

    let waiter = {
        let limiter = limiter.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { limiter.acquire(&cancel).await.map(|_| ()) })
    };
    tokio::task::yield_now().await;
    limiter.set_limit(2);

    tokio::time::timeout(Duration::from_secs(5), waiter).await???;
    Ok(())
}
