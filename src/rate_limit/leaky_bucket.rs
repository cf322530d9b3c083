use super::keys;
use super::types::{single_value, validate_identity, Decision, LeakyBucketPolicy};
use crate::clock::{Clock, SystemClock};
use crate::error::{RateLimitError, Result};
use crate::store::{scripts, AtomicStore};
use std::sync::Arc;
use tracing::debug;

const TOKENS_FIELD: &str = "tokens";
const LAST_TIME_FIELD: &str = "last_time";

/// Leaky bucket limiter.
///
/// The stored level is *available* capacity: a fresh bucket holds `capacity`,
/// each admitted request removes one unit, and `rate` units per second leak
/// back in, never past `capacity`. Time is tracked in whole seconds.
///
/// A bucket that has never been written is treated as last updated at the
/// unix epoch, so the first call always computes a huge leak that the
/// capacity clamp absorbs.
#[derive(Clone)]
pub struct LeakyBucketLimiter {
    store: Arc<dyn AtomicStore>,
    policy: LeakyBucketPolicy,
    clock: Arc<dyn Clock>,
}

impl LeakyBucketLimiter {
    pub fn new(store: Arc<dyn AtomicStore>, policy: LeakyBucketPolicy) -> Result<Self> {
        policy.validate()?;

        Ok(Self {
            store,
            policy,
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &LeakyBucketPolicy {
        &self.policy
    }

    fn key(&self, identity: &str) -> Result<String> {
        validate_identity(identity)?;
        Ok(keys::leaky_bucket_key(&self.policy.key_prefix, identity))
    }

    fn now_secs(&self) -> i64 {
        self.clock.now().timestamp()
    }

    /// Admit one request for `identity` if at least one unit is available
    pub async fn is_allowed(&self, identity: &str) -> Result<Decision> {
        let key = self.key(identity)?;
        let script = &scripts::LEAKY_BUCKET_CONSUME;

        let reply = self
            .store
            .execute_atomic(
                script,
                &[key.clone()],
                &[self.policy.rate, self.policy.capacity, self.now_secs()],
            )
            .await?;
        let decision = Decision::from_reply(script, reply)?;

        debug!(
            "Leaky bucket check for key {}: allowed={}, level={}",
            key, decision.allowed, decision.remaining
        );
        Ok(decision)
    }

    /// Current level after leaking.
    ///
    /// This is not a pure read: the recomputed level and the current
    /// timestamp are committed to the store, exactly as a denied request
    /// would commit them. Two back-to-back calls return the same value.
    /// Use [`peek_tokens`](Self::peek_tokens) when nothing may be written.
    pub async fn current_tokens(&self, identity: &str) -> Result<i64> {
        let key = self.key(identity)?;
        let script = &scripts::LEAKY_BUCKET_INSPECT;

        let reply = self
            .store
            .execute_atomic(
                script,
                &[key],
                &[self.policy.rate, self.policy.capacity, self.now_secs()],
            )
            .await?;
        Ok(single_value(script, reply)?)
    }

    /// Current level after leaking, computed locally without writing.
    ///
    /// The two fields are read separately, so under concurrent writes the
    /// result may mix two states. Good enough for dashboards, not for
    /// admission.
    pub async fn peek_tokens(&self, identity: &str) -> Result<i64> {
        let key = self.key(identity)?;
        let tokens = self
            .store
            .hash_get(&key, TOKENS_FIELD)
            .await?
            .unwrap_or(self.policy.capacity);
        let last_time = self.store.hash_get(&key, LAST_TIME_FIELD).await?.unwrap_or(0);

        let elapsed = (self.now_secs() - last_time).max(0);
        Ok(self
            .policy
            .capacity
            .min(tokens.saturating_add(elapsed.saturating_mul(self.policy.rate))))
    }

    /// Drop the bucket; the next request sees full capacity
    pub async fn reset(&self, identity: &str) -> Result<()> {
        let key = self.key(identity)?;
        self.store.delete(&[key]).await?;
        Ok(())
    }

    /// Leak, then credit `tokens`, capped at capacity
    pub async fn add_tokens(&self, identity: &str, tokens: i64) -> Result<i64> {
        if tokens <= 0 {
            return Err(RateLimitError::validation(
                "tokens to add must be greater than 0",
            ));
        }

        let key = self.key(identity)?;
        let script = &scripts::LEAKY_BUCKET_ADD;
        let reply = self
            .store
            .execute_atomic(
                script,
                &[key],
                &[
                    self.policy.rate,
                    self.policy.capacity,
                    tokens,
                    self.now_secs(),
                ],
            )
            .await?;
        Ok(single_value(script, reply)?)
    }

    /// Overwrite the level and stamp it with the current time
    pub async fn set_tokens(&self, identity: &str, tokens: i64) -> Result<()> {
        if tokens < 0 {
            return Err(RateLimitError::validation("tokens cannot be negative"));
        }
        if tokens > self.policy.capacity {
            return Err(RateLimitError::validation(format!(
                "tokens cannot exceed capacity ({})",
                self.policy.capacity
            )));
        }

        let key = self.key(identity)?;
        self.store
            .hash_set(
                &key,
                &[(TOKENS_FIELD, tokens), (LAST_TIME_FIELD, self.now_secs())],
                self.policy.ttl(),
            )
            .await?;
        Ok(())
    }
}
