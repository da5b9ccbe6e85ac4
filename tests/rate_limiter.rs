//! Rate Limiter Integration Tests
//!
//! Sliding-window admission, tiers, concurrent callers and shared stores.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use verifact::adapters::SqliteStore;
use verifact::core::{RateLimitSettings, RateLimiter};

fn settings(limit: u32, window_seconds: u64) -> RateLimitSettings {
    RateLimitSettings {
        default_limit: limit,
        window_seconds,
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_limit_plus_one_is_rejected() {
    let limiter = RateLimiter::new(&settings(5, 60));

    for i in 0..5 {
        let result = limiter.check("client-a", None).await;
        assert!(result.allowed, "request {} should pass", i);
        assert_eq!(result.remaining, 4 - i);
    }

    let rejected = limiter.check("client-a", None).await;
    assert!(!rejected.allowed);
    assert_eq!(rejected.remaining, 0);
    let retry_after = rejected.retry_after.unwrap();
    assert!(retry_after >= Duration::from_secs(1));
    assert!(retry_after <= Duration::from_secs(60));

    // Other identifiers have their own window
    assert!(limiter.check("client-b", None).await.allowed);
}

#[tokio::test(start_paused = true)]
async fn test_window_slides() {
    let limiter = RateLimiter::new(&settings(2, 10));

    assert!(limiter.check("k", None).await.allowed);
    tokio::time::advance(Duration::from_secs(6)).await;
    assert!(limiter.check("k", None).await.allowed);
    assert!(!limiter.check("k", None).await.allowed);

    // First request leaves the window; the second is still inside it
    tokio::time::advance(Duration::from_secs(5)).await;
    assert!(limiter.check("k", None).await.allowed);
    assert!(!limiter.check("k", None).await.allowed);
}

#[tokio::test]
async fn test_concurrent_callers_share_one_window() {
    let limiter = Arc::new(RateLimiter::new(&settings(10, 3600)));

    let mut handles = Vec::new();
    for _ in 0..50 {
        let limiter = Arc::clone(&limiter);
        handles.push(tokio::spawn(async move { limiter.check("shared", None).await.allowed }));
    }

    let mut admitted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 10);
}

#[tokio::test]
async fn test_tiers_scale_limits() {
    let limiter = RateLimiter::new(&RateLimitSettings {
        default_limit: 100,
        authenticated_limit: 1000,
        ..Default::default()
    });

    assert_eq!(limiter.limit_for(None), 100);
    assert_eq!(limiter.limit_for(Some("free")), 100);
    assert_eq!(limiter.limit_for(Some("basic")), 1000);
    assert_eq!(limiter.limit_for(Some("premium")), 2000);
    assert_eq!(limiter.limit_for(Some("enterprise")), 10000);
    assert_eq!(limiter.limit_for(Some("unknown")), 100);

    let result = limiter.check("user", Some("premium")).await;
    assert_eq!(result.limit, 2000);
    assert_eq!(result.remaining, 1999);
}

#[tokio::test]
async fn test_disabled_limiter_admits_everything() {
    let limiter = RateLimiter::new(&settings(1, 60));
    limiter.set_enabled(false);

    for _ in 0..5 {
        assert!(limiter.check("k", None).await.allowed);
    }

    limiter.set_enabled(true);
    assert!(limiter.check("k", None).await.allowed);
    assert!(!limiter.check("k", None).await.allowed);
}

#[tokio::test]
async fn test_reset_clears_window() {
    let limiter = RateLimiter::new(&settings(1, 60));

    assert!(limiter.check("k", None).await.allowed);
    assert!(!limiter.check("k", None).await.allowed);
    assert!(limiter.reset("k").await);
    assert!(limiter.check("k", None).await.allowed);
}

#[tokio::test]
async fn test_sqlite_store_shares_limits_between_limiters() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("cache.db");
    let first = RateLimiter::new(&settings(3, 3600))
        .with_store(Arc::new(SqliteStore::open(&path).unwrap()));
    let second = RateLimiter::new(&settings(3, 3600))
        .with_store(Arc::new(SqliteStore::open(&path).unwrap()));

    assert!(first.check("api", None).await.allowed);
    assert!(second.check("api", None).await.allowed);
    assert!(first.check("api", None).await.allowed);

    let rejected = second.check("api", None).await;
    assert!(!rejected.allowed);
    assert!(rejected.retry_after.is_some());
}
