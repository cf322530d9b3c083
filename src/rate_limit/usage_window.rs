use super::keys;
use super::types::{utc_offset, validate_identity, Decision, UsageWindowPolicy};
use crate::clock::{Clock, SystemClock};
use crate::error::{RateLimitError, Result};
use crate::store::{scripts, ttl_secs, AtomicStore};
use chrono::FixedOffset;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Fixed window that records the used count instead of the remaining one.
///
/// Keys share the window token scheme of [`FixedWindowLimiter`](super::FixedWindowLimiter)
/// but live for two windows.
#[derive(Clone)]
pub struct UsageWindowLimiter {
    store: Arc<dyn AtomicStore>,
    policy: UsageWindowPolicy,
    offset: FixedOffset,
    clock: Arc<dyn Clock>,
}

impl UsageWindowLimiter {
    pub fn new(store: Arc<dyn AtomicStore>, policy: UsageWindowPolicy) -> Result<Self> {
        policy.validate()?;
        let offset = utc_offset(policy.utc_offset_secs)?;

        Ok(Self {
            store,
            policy,
            offset,
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn for_identity(&self, identity: &str) -> Result<Self> {
        validate_identity(identity)?;
        let mut scoped = self.clone();
        scoped.policy.key_prefix = keys::scoped_prefix(&self.policy.key_prefix, identity);
        Ok(scoped)
    }

    pub fn config(&self) -> &UsageWindowPolicy {
        &self.policy
    }

    fn current_key(&self) -> String {
        keys::window_key(
            &self.policy.key_prefix,
            self.clock.now(),
            self.policy.window,
            self.offset,
        )
    }

    fn ttl(&self) -> Duration {
        self.policy.window * 2
    }

    pub async fn is_allowed(&self) -> Result<Decision> {
        let key = self.current_key();
        let script = &scripts::USAGE_WINDOW_CONSUME;

        let reply = self
            .store
            .execute_atomic(
                script,
                &[key.clone()],
                &[self.policy.max_count, ttl_secs(self.ttl())],
            )
            .await?;
        let decision = Decision::from_reply(script, reply)?;

        debug!(
            "Usage window check for key {}: allowed={}, remaining={}",
            key, decision.allowed, decision.remaining
        );
        Ok(decision)
    }

    /// Requests used in the current window
    pub async fn current_count(&self) -> Result<i64> {
        let key = self.current_key();
        Ok(self.store.get(&key).await?.unwrap_or(0))
    }

    pub async fn remaining_count(&self) -> Result<i64> {
        let used = self.current_count().await?;
        Ok((self.policy.max_count - used).max(0))
    }

    /// Record `increment` extra uses, returning the new used count
    pub async fn increase_count(&self, increment: i64) -> Result<i64> {
        if increment <= 0 {
            return Err(RateLimitError::validation(
                "increment must be greater than 0",
            ));
        }

        let key = self.current_key();
        Ok(self.store.increment_by(&key, increment, self.ttl()).await?)
    }

    /// Overwrite the used count of the current window
    pub async fn set_count(&self, count: i64) -> Result<()> {
        if count < 0 {
            return Err(RateLimitError::validation("count cannot be negative"));
        }

        let key = self.current_key();
        self.store.set_with_expiry(&key, count, self.ttl()).await?;
        Ok(())
    }

    pub async fn reset(&self) -> Result<()> {
        let key = self.current_key();
        self.store.delete(&[key]).await?;
        Ok(())
    }
}
