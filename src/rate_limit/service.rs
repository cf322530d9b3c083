use super::fixed_window::FixedWindowLimiter;
use super::leaky_bucket::LeakyBucketLimiter;
use super::token_bucket::TokenBucketLimiter;
use super::types::{Decision, RateLimitPolicy};
use super::usage_window::UsageWindowLimiter;
use crate::clock::Clock;
use crate::config::DlimitConfig;
use crate::error::{RateLimitError, Result};
use crate::metrics::{self, DecisionTimer};
use crate::store::{AtomicStore, RedisStore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What [`RateLimiterService::check`] answers when the store fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreFailureMode {
    /// Return the store error to the caller
    #[default]
    Propagate,
    /// Admit the request
    FailOpen,
    /// Reject the request
    FailClosed,
}

#[derive(Clone)]
enum Limiter {
    FixedWindow(FixedWindowLimiter),
    TokenBucket(TokenBucketLimiter),
    LeakyBucket(LeakyBucketLimiter),
    UsageWindow(UsageWindowLimiter),
}

impl Limiter {
    fn build(store: Arc<dyn AtomicStore>, policy: RateLimitPolicy) -> Result<Self> {
        Ok(match policy {
            RateLimitPolicy::FixedWindow(p) => Limiter::FixedWindow(FixedWindowLimiter::new(store, p)?),
            RateLimitPolicy::TokenBucket(p) => Limiter::TokenBucket(TokenBucketLimiter::new(store, p)?),
            RateLimitPolicy::LeakyBucket(p) => Limiter::LeakyBucket(LeakyBucketLimiter::new(store, p)?),
            RateLimitPolicy::UsageWindow(p) => Limiter::UsageWindow(UsageWindowLimiter::new(store, p)?),
        })
    }

    fn with_clock(self, clock: Arc<dyn Clock>) -> Self {
        match self {
            Limiter::FixedWindow(l) => Limiter::FixedWindow(l.with_clock(clock)),
            Limiter::TokenBucket(l) => Limiter::TokenBucket(l.with_clock(clock)),
            Limiter::LeakyBucket(l) => Limiter::LeakyBucket(l.with_clock(clock)),
            Limiter::UsageWindow(l) => Limiter::UsageWindow(l.with_clock(clock)),
        }
    }

    fn policy(&self) -> RateLimitPolicy {
        match self {
            Limiter::FixedWindow(l) => RateLimitPolicy::FixedWindow(l.config().clone()),
            Limiter::TokenBucket(l) => RateLimitPolicy::TokenBucket(l.config().clone()),
            Limiter::LeakyBucket(l) => RateLimitPolicy::LeakyBucket(l.config().clone()),
            Limiter::UsageWindow(l) => RateLimitPolicy::UsageWindow(l.config().clone()),
        }
    }

    fn algorithm(&self) -> &'static str {
        match self {
            Limiter::FixedWindow(_) => "fixed_window",
            Limiter::TokenBucket(_) => "token_bucket",
            Limiter::LeakyBucket(_) => "leaky_bucket",
            Limiter::UsageWindow(_) => "usage_window",
        }
    }

    async fn check(&self, identity: &str) -> Result<Decision> {
        match self {
            Limiter::FixedWindow(l) => l.for_identity(identity)?.is_allowed().await,
            Limiter::TokenBucket(l) => l.is_allowed(identity).await,
            Limiter::LeakyBucket(l) => l.is_allowed(identity).await,
            Limiter::UsageWindow(l) => l.for_identity(identity)?.is_allowed().await,
        }
    }

    async fn inspect(&self, identity: &str) -> Result<i64> {
        match self {
            Limiter::FixedWindow(l) => l.for_identity(identity)?.current_count().await,
            Limiter::TokenBucket(l) => l.current_tokens(identity).await,
            Limiter::LeakyBucket(l) => l.current_tokens(identity).await,
            Limiter::UsageWindow(l) => l.for_identity(identity)?.current_count().await,
        }
    }

    async fn reset(&self, identity: &str) -> Result<()> {
        match self {
            Limiter::FixedWindow(l) => l.for_identity(identity)?.reset().await,
            Limiter::TokenBucket(l) => l.reset(identity).await,
            Limiter::LeakyBucket(l) => l.reset(identity).await,
            Limiter::UsageWindow(l) => l.for_identity(identity)?.reset().await,
        }
    }

    async fn set(&self, identity: &str, value: i64) -> Result<()> {
        match self {
            Limiter::FixedWindow(l) => l.for_identity(identity)?.set_count(value).await,
            Limiter::TokenBucket(l) => l.set_tokens(identity, value).await,
            Limiter::LeakyBucket(l) => l.set_tokens(identity, value).await,
            Limiter::UsageWindow(l) => l.for_identity(identity)?.set_count(value).await,
        }
    }

    async fn add(&self, identity: &str, amount: i64) -> Result<i64> {
        match self {
            Limiter::FixedWindow(l) => l.for_identity(identity)?.increase_count(amount).await,
            Limiter::TokenBucket(l) => l.add_tokens(identity, amount).await,
            Limiter::LeakyBucket(l) => l.add_tokens(identity, amount).await,
            Limiter::UsageWindow(l) => l.for_identity(identity)?.increase_count(amount).await,
        }
    }
}

/// Named limiters sharing one store.
///
/// `inspect`, `set` and `add` operate on each algorithm's own counter: the
/// remaining count for fixed windows, the token level for buckets and the
/// used count for usage windows.
#[derive(Clone)]
pub struct RateLimiterService {
    limiters: BTreeMap<String, Limiter>,
    failure_mode: StoreFailureMode,
}

impl RateLimiterService {
    /// Build every policy against `store`. Any invalid policy fails the whole service.
    pub fn new<I>(store: Arc<dyn AtomicStore>, policies: I, failure_mode: StoreFailureMode) -> Result<Self>
    where
        I: IntoIterator<Item = (String, RateLimitPolicy)>,
    {
        let mut limiters = BTreeMap::new();
        for (name, policy) in policies {
            let limiter = Limiter::build(store.clone(), policy).map_err(|e| {
                RateLimitError::Configuration(format!("Invalid policy '{}': {}", name, e))
            })?;
            debug!("Registered {} policy '{}'", limiter.algorithm(), name);
            limiters.insert(name, limiter);
        }

        info!(
            "Rate limiter service initialized with {} policies (failure mode: {:?})",
            limiters.len(),
            failure_mode
        );

        Ok(Self {
            limiters,
            failure_mode,
        })
    }

    /// Connect to the configured Redis store and build all policies
    pub async fn connect(config: &DlimitConfig) -> Result<Self> {
        config.validate()?;
        let store_config = config.store.as_ref().ok_or_else(|| {
            RateLimitError::Configuration("No store configured".to_string())
        })?;

        info!("Initializing rate limiter with Redis backend");
        let mut store = RedisStore::connect(&store_config.url).await?;
        if let Some(timeout) = store_config.command_timeout {
            store = store.with_command_timeout(timeout);
        }
        store.ping().await?;

        Self::new(
            Arc::new(store),
            config.policies.clone(),
            config.failure_mode,
        )
    }

    /// Drive every limiter from `clock`
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.limiters = self
            .limiters
            .into_iter()
            .map(|(name, limiter)| (name, limiter.with_clock(clock.clone())))
            .collect();
        self
    }

    pub fn failure_mode(&self) -> StoreFailureMode {
        self.failure_mode
    }

    /// Registered policies, ordered by name
    pub fn policies(&self) -> Vec<(String, RateLimitPolicy)> {
        self.limiters
            .iter()
            .map(|(name, limiter)| (name.clone(), limiter.policy()))
            .collect()
    }

    fn limiter(&self, policy: &str) -> Result<&Limiter> {
        self.limiters
            .get(policy)
            .ok_or_else(|| RateLimitError::validation(format!("Unknown policy: {}", policy)))
    }

    /// Admit or reject one request from `identity` under `policy`
    pub async fn check(&self, policy: &str, identity: &str) -> Result<Decision> {
        let limiter = self.limiter(policy)?;
        let timer = DecisionTimer::new(policy, limiter.algorithm());

        match limiter.check(identity).await {
            Ok(decision) => {
                timer.record(decision.allowed);
                if !decision.allowed {
                    warn!("Rate limit exceeded for policy '{}' identity '{}'", policy, identity);
                }
                Ok(decision)
            }
            Err(RateLimitError::Store(e)) => {
                error!("Store failure checking policy '{}': {}", policy, e);
                metrics::record_store_error(policy, "check");
                self.fallback(policy, RateLimitError::Store(e))
            }
            Err(e) => Err(e),
        }
    }

    fn fallback(&self, policy: &str, err: RateLimitError) -> Result<Decision> {
        let decision = match self.failure_mode {
            StoreFailureMode::Propagate => return Err(err),
            StoreFailureMode::FailOpen => Decision::allowed(0),
            StoreFailureMode::FailClosed => Decision::denied(0),
        };

        warn!(
            "Answering policy '{}' with {:?} after store failure: allowed={}",
            policy, self.failure_mode, decision.allowed
        );
        metrics::record_fallback(policy, decision.allowed);
        Ok(decision)
    }

    /// Current counter for `identity` under `policy`
    pub async fn inspect(&self, policy: &str, identity: &str) -> Result<i64> {
        let result = self.limiter(policy)?.inspect(identity).await;
        observe(policy, "inspect", result)
    }

    pub async fn reset(&self, policy: &str, identity: &str) -> Result<()> {
        let result = self.limiter(policy)?.reset(identity).await;
        if result.is_ok() {
            info!("Reset policy '{}' for identity '{}'", policy, identity);
        }
        observe(policy, "reset", result)
    }

    pub async fn set(&self, policy: &str, identity: &str, value: i64) -> Result<()> {
        let result = self.limiter(policy)?.set(identity, value).await;
        observe(policy, "set", result)
    }

    pub async fn add(&self, policy: &str, identity: &str, amount: i64) -> Result<i64> {
        let result = self.limiter(policy)?.add(identity, amount).await;
        observe(policy, "add", result)
    }
}

fn observe<T>(policy: &str, operation: &str, result: Result<T>) -> Result<T> {
    if let Err(RateLimitError::Store(e)) = &result {
        error!("Store failure during {} on policy '{}': {}", operation, policy, e);
        metrics::record_store_error(policy, operation);
    }
    result
}
