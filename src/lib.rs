pub mod clock;
pub mod config;
pub mod error;
pub mod metrics;
pub mod rate_limit;
pub mod store;

pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::config::DlimitConfig;
pub use crate::error::{RateLimitError, Result, StoreError};
pub use crate::rate_limit::{Decision, RateLimiterService, StoreFailureMode};
pub use crate::store::{AtomicStore, MemoryStore, RedisStore};

/// Initialize tracing/logging. Logs go to stderr.
pub fn init_tracing(json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "dlimit=info".into());

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}
