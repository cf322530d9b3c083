use dlimit::rate_limit::{
    FixedWindowLimiter, FixedWindowPolicy, LeakyBucketLimiter, LeakyBucketPolicy,
    TokenBucketLimiter, TokenBucketPolicy,
};
use dlimit::{ManualClock, MemoryStore};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;

const TASKS: usize = 25;
const CALLS_PER_TASK: usize = 2;

fn frozen() -> (Arc<MemoryStore>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
    (Arc::new(MemoryStore::with_clock(clock.clone())), clock)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fixed_window_admits_exactly_max() {
    let (store, clock) = frozen();
    let limiter = FixedWindowLimiter::new(
        store,
        FixedWindowPolicy::new("burst", 10, Duration::from_secs(10)),
    )
    .unwrap()
    .with_clock(clock);

    let handles: Vec<_> = (0..TASKS)
        .map(|_| {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                let mut admitted = 0;
                for _ in 0..CALLS_PER_TASK {
                    if limiter.is_allowed().await.unwrap().allowed {
                        admitted += 1;
                    }
                }
                admitted
            })
        })
        .collect();

    let admitted: usize = join_all(handles).await.into_iter().map(|r| r.unwrap()).sum();
    assert_eq!(admitted, 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_token_bucket_admits_exactly_capacity() {
    let (store, clock) = frozen();
    let limiter = TokenBucketLimiter::new(
        store,
        TokenBucketPolicy::new("burst", 10, Duration::from_secs(60)),
    )
    .unwrap()
    .with_clock(clock);

    let handles: Vec<_> = (0..TASKS)
        .map(|_| {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                let mut admitted = 0;
                for _ in 0..CALLS_PER_TASK {
                    if limiter.is_allowed("shared").await.unwrap().allowed {
                        admitted += 1;
                    }
                }
                admitted
            })
        })
        .collect();

    let admitted: usize = join_all(handles).await.into_iter().map(|r| r.unwrap()).sum();
    assert_eq!(admitted, 10);
    assert_eq!(limiter.current_tokens("shared").await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_leaky_bucket_admits_exactly_capacity() {
    let (store, clock) = frozen();
    let limiter = LeakyBucketLimiter::new(store, LeakyBucketPolicy::new("burst", 1, 10))
        .unwrap()
        .with_clock(clock);

    let handles: Vec<_> = (0..TASKS)
        .map(|_| {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                let mut admitted = 0;
                for _ in 0..CALLS_PER_TASK {
                    if limiter.is_allowed("shared").await.unwrap().allowed {
                        admitted += 1;
                    }
                }
                admitted
            })
        })
        .collect();

    let admitted: usize = join_all(handles).await.into_iter().map(|r| r.unwrap()).sum();
    assert_eq!(admitted, 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_separate_identities_do_not_contend() {
    let (store, clock) = frozen();
    let limiter = TokenBucketLimiter::new(
        store,
        TokenBucketPolicy::new("per-user", 3, Duration::from_secs(60)),
    )
    .unwrap()
    .with_clock(clock);

    let handles: Vec<_> = (0..TASKS)
        .map(|i| {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                let identity = format!("user-{}", i);
                let mut admitted = 0;
                for _ in 0..5 {
                    if limiter.is_allowed(&identity).await.unwrap().allowed {
                        admitted += 1;
                    }
                }
                admitted
            })
        })
        .collect();

    for result in join_all(handles).await {
        assert_eq!(result.unwrap(), 3);
    }
}
