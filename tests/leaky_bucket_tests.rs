use dlimit::rate_limit::{Decision, LeakyBucketLimiter, LeakyBucketPolicy};
use dlimit::{ManualClock, MemoryStore};
use std::sync::Arc;
use std::time::Duration;

fn setup(rate: i64, capacity: i64) -> (LeakyBucketLimiter, Arc<MemoryStore>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    let limiter = LeakyBucketLimiter::new(store.clone(), LeakyBucketPolicy::new("upload", rate, capacity))
        .unwrap()
        .with_clock(clock.clone());
    (limiter, store, clock)
}

#[tokio::test]
async fn test_leak_scenario() {
    let (limiter, _store, clock) = setup(2, 5);

    for expected in (0..5).rev() {
        assert_eq!(
            limiter.is_allowed("user").await.unwrap(),
            Decision::allowed(expected)
        );
    }
    assert_eq!(limiter.is_allowed("user").await.unwrap(), Decision::denied(0));

    clock.advance(Duration::from_secs(1));
    assert!(limiter.is_allowed("user").await.unwrap().allowed);
    assert!(limiter.is_allowed("user").await.unwrap().allowed);
    assert!(!limiter.is_allowed("user").await.unwrap().allowed);
}

#[tokio::test]
async fn test_level_never_exceeds_capacity() {
    let (limiter, _store, clock) = setup(3, 4);

    // First call leaks from the epoch
    assert_eq!(limiter.is_allowed("user").await.unwrap(), Decision::allowed(3));

    clock.advance(Duration::from_secs(365 * 24 * 3600));
    assert_eq!(limiter.current_tokens("user").await.unwrap(), 4);
    assert_eq!(limiter.add_tokens("user", 1_000).await.unwrap(), 4);
}

#[tokio::test]
async fn test_inspection_is_idempotent() {
    let (limiter, _store, clock) = setup(1, 10);
    for _ in 0..6 {
        limiter.is_allowed("user").await.unwrap();
    }

    clock.advance(Duration::from_secs(2));
    let first = limiter.current_tokens("user").await.unwrap();
    let second = limiter.current_tokens("user").await.unwrap();
    assert_eq!(first, 6);
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_inspection_commits_timestamp() {
    let (limiter, store, clock) = setup(1, 10);
    limiter.is_allowed("user").await.unwrap();

    clock.advance(Duration::from_secs(3));
    limiter.current_tokens("user").await.unwrap();
    assert_eq!(store.ttl("upload:user").await, Some(Duration::from_secs(10)));

    // peek leaves the record untouched
    clock.advance(Duration::from_secs(3));
    assert_eq!(limiter.peek_tokens("user").await.unwrap(), 10);
    assert_eq!(store.ttl("upload:user").await, Some(Duration::from_secs(7)));
}

#[tokio::test]
async fn test_record_expires_once_refilled() {
    let (limiter, store, clock) = setup(2, 5);
    limiter.is_allowed("user").await.unwrap();
    assert_eq!(store.ttl("upload:user").await, Some(Duration::from_secs(3)));

    clock.advance(Duration::from_secs(3));
    assert!(store.is_empty().await);
    assert_eq!(limiter.peek_tokens("user").await.unwrap(), 5);
}

#[tokio::test]
async fn test_set_and_reset() {
    let (limiter, _store, _clock) = setup(1, 3);

    limiter.set_tokens("user", 0).await.unwrap();
    assert_eq!(limiter.is_allowed("user").await.unwrap(), Decision::denied(0));

    limiter.reset("user").await.unwrap();
    assert_eq!(limiter.is_allowed("user").await.unwrap(), Decision::allowed(2));
}
