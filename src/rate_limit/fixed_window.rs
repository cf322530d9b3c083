use super::keys;
use super::types::{single_value, utc_offset, validate_identity, Decision, FixedWindowPolicy};
use crate::clock::{Clock, SystemClock};
use crate::error::{RateLimitError, Result};
use crate::store::{scripts, ttl_secs, AtomicStore};
use chrono::FixedOffset;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Extra lifetime given to a window key past the window itself
const EXPIRY_BUFFER: Duration = Duration::from_secs(1);

/// Counts requests inside calendar-aligned windows.
///
/// Windows are wall-clock aligned, not sliding: a burst straddling a boundary
/// can see up to twice `max_count` admissions in a short span.
#[derive(Clone)]
pub struct FixedWindowLimiter {
    store: Arc<dyn AtomicStore>,
    policy: FixedWindowPolicy,
    offset: FixedOffset,
    clock: Arc<dyn Clock>,
}

impl FixedWindowLimiter {
    /// Validate `policy` and bind it to `store`
    pub fn new(store: Arc<dyn AtomicStore>, policy: FixedWindowPolicy) -> Result<Self> {
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

    /// A limiter with the same policy whose prefix is scoped to `identity`
    pub fn for_identity(&self, identity: &str) -> Result<Self> {
        validate_identity(identity)?;
        let mut scoped = self.clone();
        scoped.policy.key_prefix = keys::scoped_prefix(&self.policy.key_prefix, identity);
        Ok(scoped)
    }

    pub fn config(&self) -> &FixedWindowPolicy {
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
        self.policy.window + EXPIRY_BUFFER
    }

    /// Admit or reject one request in the current window
    pub async fn is_allowed(&self) -> Result<Decision> {
        let key = self.current_key();
        let script = &scripts::FIXED_WINDOW_CONSUME;

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
            "Fixed window check for key {}: allowed={}, remaining={}",
            key, decision.allowed, decision.remaining
        );
        Ok(decision)
    }

    /// Remaining count in the current window; an untouched window is full
    pub async fn current_count(&self) -> Result<i64> {
        let key = self.current_key();
        Ok(self.store.get(&key).await?.unwrap_or(self.policy.max_count))
    }

    /// Forget the current window
    pub async fn reset(&self) -> Result<()> {
        let key = self.current_key();
        self.store.delete(&[key]).await?;
        Ok(())
    }

    /// Credit the current window, capped at `max_count`
    pub async fn increase_count(&self, increment: i64) -> Result<i64> {
        if increment <= 0 {
            return Err(RateLimitError::validation(
                "increment must be greater than 0",
            ));
        }

        let key = self.current_key();
        let script = &scripts::FIXED_WINDOW_INCREASE;
        let reply = self
            .store
            .execute_atomic(
                script,
                &[key],
                &[self.policy.max_count, increment, ttl_secs(self.ttl())],
            )
            .await?;
        Ok(single_value(script, reply)?)
    }

    /// Overwrite the remaining count of the current window
    pub async fn set_count(&self, count: i64) -> Result<()> {
        if count < 0 {
            return Err(RateLimitError::validation("count cannot be negative"));
        }

        let key = self.current_key();
        self.store.set_with_expiry(&key, count, self.ttl()).await?;
        Ok(())
    }
}
