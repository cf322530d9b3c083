use dlimit::rate_limit::{TokenBucketLimiter, TokenBucketPolicy};
use dlimit::{ManualClock, MemoryStore, RateLimitError};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

fn setup(max: i64, interval_secs: u64, per_refill: i64) -> (TokenBucketLimiter, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    let policy = TokenBucketPolicy::new("api", max, Duration::from_secs(interval_secs))
        .with_tokens_per_refill(per_refill);
    let limiter = TokenBucketLimiter::new(store, policy)
        .unwrap()
        .with_clock(clock.clone());
    (limiter, clock)
}

async fn drain(limiter: &TokenBucketLimiter, identity: &str) {
    while limiter.is_allowed(identity).await.unwrap().allowed {}
}

#[tokio::test]
async fn test_refill_scenario() {
    let (limiter, clock) = setup(5, 2, 2);

    for expected in (0..5).rev() {
        let decision = limiter.is_allowed("user").await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, expected);
    }
    assert!(!limiter.is_allowed("user").await.unwrap().allowed);

    // One full cycle elapses
    clock.advance(Duration::from_secs(3));
    assert!(limiter.is_allowed("user").await.unwrap().allowed);
    assert!(limiter.is_allowed("user").await.unwrap().allowed);
    assert!(!limiter.is_allowed("user").await.unwrap().allowed);
}

#[tokio::test]
async fn test_phase_preservation() {
    let (together, clock_a) = setup(10, 2, 2);
    let (stepwise, clock_b) = setup(10, 2, 2);

    drain(&together, "user").await;
    drain(&stepwise, "user").await;

    // Two cycles at once
    clock_a.advance(Duration::from_secs(4));
    let at_once = together.current_tokens("user").await.unwrap();

    // The same two cycles split unevenly
    clock_b.advance(Duration::from_secs(3));
    stepwise.current_tokens("user").await.unwrap();
    clock_b.advance(Duration::from_secs(1));
    let split = stepwise.current_tokens("user").await.unwrap();

    assert_eq!(at_once, 4);
    assert_eq!(split, at_once);
}

#[tokio::test]
async fn test_denial_keeps_refill_phase() {
    let (limiter, clock) = setup(2, 2, 1);
    drain(&limiter, "user").await;

    // Denials in between must not push the next refill back
    clock.advance(Duration::from_secs(1));
    assert!(!limiter.is_allowed("user").await.unwrap().allowed);
    clock.advance(Duration::from_secs(1));
    assert!(limiter.is_allowed("user").await.unwrap().allowed);
}

#[tokio::test]
async fn test_tokens_never_exceed_max() {
    let max = 7;
    let (limiter, clock) = setup(max, 1, 3);
    let mut rng = rand::thread_rng();

    for _ in 0..200 {
        clock.advance(Duration::from_secs(rng.gen_range(0..5)));
        let decision = limiter.is_allowed("user").await.unwrap();
        assert!(decision.remaining >= 0);
        assert!(decision.remaining <= max);

        if rng.gen_bool(0.1) {
            let tokens = limiter.add_tokens("user", rng.gen_range(1..20)).await.unwrap();
            assert!(tokens <= max);
        }
        assert!(limiter.current_tokens("user").await.unwrap() <= max);
    }
}

#[tokio::test]
async fn test_identities_are_independent() {
    let (limiter, _clock) = setup(1, 60, 1);

    assert!(limiter.is_allowed("alice").await.unwrap().allowed);
    assert!(!limiter.is_allowed("alice").await.unwrap().allowed);
    assert!(limiter.is_allowed("bob").await.unwrap().allowed);
}

#[tokio::test]
async fn test_set_tokens_bounds() {
    let (limiter, _clock) = setup(5, 2, 2);

    limiter.set_tokens("user", 5).await.unwrap();
    limiter.set_tokens("user", 0).await.unwrap();
    assert!(matches!(
        limiter.set_tokens("user", 6).await,
        Err(RateLimitError::Validation(_))
    ));
    assert!(matches!(
        limiter.set_tokens("user", -1).await,
        Err(RateLimitError::Validation(_))
    ));
    assert!(!limiter.is_allowed("user").await.unwrap().allowed);
}

#[test]
fn test_constructor_rejects_slow_refill() {
    let store = Arc::new(MemoryStore::new());
    let policy = TokenBucketPolicy::new("api", 100_000, Duration::from_secs(3600))
        .with_tokens_per_refill(1);
    assert!(matches!(
        TokenBucketLimiter::new(store, policy),
        Err(RateLimitError::Configuration(_))
    ));
}

#[tokio::test]
async fn test_records_live_for_a_day() {
    let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    let limiter = TokenBucketLimiter::new(
        store.clone(),
        TokenBucketPolicy::new("api", 5, Duration::from_secs(2)),
    )
    .unwrap()
    .with_clock(clock.clone());

    assert!(limiter.is_allowed("user").await.unwrap().allowed);
    let day = Some(Duration::from_secs(86_400));
    assert_eq!(store.ttl("api:tokens:user").await, day);
    assert_eq!(store.ttl("api:time:user").await, day);
}
