//! Rate limiting module
//!
//! Every limiter turns one admission decision into exactly one atomic
//! transaction against an [`AtomicStore`](crate::store::AtomicStore), so
//! correctness holds across any number of processes sharing the store:
//!
//! - **Fixed Window**: remaining count per calendar-aligned window
//! - **Token Bucket**: whole-cycle refills that keep their phase
//! - **Leaky Bucket**: capacity recovering continuously at a fixed rate
//! - **Usage Window**: fixed window counting used requests
//!
//! # Example
//!
//! ```rust,no_run
//! use dlimit::rate_limit::{TokenBucketLimiter, TokenBucketPolicy};
//! use dlimit::store::RedisStore;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> dlimit::Result<()> {
//!     let store = Arc::new(RedisStore::connect("redis://localhost:6379").await?);
//!     let policy = TokenBucketPolicy::new("api", 5, Duration::from_secs(2))
//!         .with_tokens_per_refill(2);
//!     let limiter = TokenBucketLimiter::new(store, policy)?;
//!
//!     let decision = limiter.is_allowed("user-42").await?;
//!     println!("allowed={} tokens={}", decision.allowed, decision.remaining);
//!     Ok(())
//! }
//! ```

pub mod fixed_window;
pub mod keys;
pub mod leaky_bucket;
pub mod service;
pub mod token_bucket;
pub mod types;
pub mod usage_window;

// Re-export commonly used types
pub use fixed_window::FixedWindowLimiter;
pub use leaky_bucket::LeakyBucketLimiter;
pub use service::{RateLimiterService, StoreFailureMode};
pub use token_bucket::TokenBucketLimiter;
pub use types::{
    Decision, FixedWindowPolicy, LeakyBucketPolicy, RateLimitPolicy, TokenBucketPolicy,
    UsageWindowPolicy,
};
pub use usage_window::UsageWindowLimiter;
