use super::keys;
use super::types::{single_value, validate_identity, Decision, TokenBucketPolicy, TOKEN_BUCKET_TTL};
use crate::clock::{Clock, SystemClock};
use crate::error::{RateLimitError, Result};
use crate::store::{scripts, ttl_secs, AtomicStore};
use std::sync::Arc;
use tracing::debug;

/// Token bucket limiter.
///
/// Each identity owns a token count and the timestamp of its last refill.
/// Refills happen in whole cycles of `refill_interval`; the refill timestamp
/// advances by the cycles consumed rather than jumping to "now", so partial
/// progress toward the next refill is never lost.
#[derive(Clone)]
pub struct TokenBucketLimiter {
    store: Arc<dyn AtomicStore>,
    policy: TokenBucketPolicy,
    clock: Arc<dyn Clock>,
}

impl TokenBucketLimiter {
    pub fn new(store: Arc<dyn AtomicStore>, policy: TokenBucketPolicy) -> Result<Self> {
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

    pub fn config(&self) -> &TokenBucketPolicy {
        &self.policy
    }

    fn keys(&self, identity: &str) -> Result<(String, String)> {
        validate_identity(identity)?;
        Ok(keys::token_bucket_keys(&self.policy.key_prefix, identity))
    }

    fn refill_args(&self) -> [i64; 5] {
        [
            self.policy.max_tokens,
            ttl_secs(self.policy.refill_interval),
            self.policy.tokens_per_refill(),
            self.clock.now().timestamp(),
            ttl_secs(TOKEN_BUCKET_TTL),
        ]
    }

    /// Take one token for `identity` if one is available
    pub async fn is_allowed(&self, identity: &str) -> Result<Decision> {
        let (token_key, time_key) = self.keys(identity)?;
        let script = &scripts::TOKEN_BUCKET_CONSUME;

        let reply = self
            .store
            .execute_atomic(script, &[token_key.clone(), time_key], &self.refill_args())
            .await?;
        let decision = Decision::from_reply(script, reply)?;

        debug!(
            "Token bucket check for key {}: allowed={}, tokens={}",
            token_key, decision.allowed, decision.remaining
        );
        Ok(decision)
    }

    /// Current tokens including any refill that is due.
    ///
    /// When at least one refill cycle has elapsed the refilled count and the
    /// advanced refill timestamp are written back.
    pub async fn current_tokens(&self, identity: &str) -> Result<i64> {
        let (token_key, time_key) = self.keys(identity)?;
        let script = &scripts::TOKEN_BUCKET_INSPECT;

        let reply = self
            .store
            .execute_atomic(script, &[token_key, time_key], &self.refill_args())
            .await?;
        Ok(single_value(script, reply)?)
    }

    /// Drop all state for `identity`; the next request sees a full bucket
    pub async fn reset(&self, identity: &str) -> Result<()> {
        let (token_key, time_key) = self.keys(identity)?;
        self.store.delete(&[token_key, time_key]).await?;
        Ok(())
    }

    /// Credit tokens, capped at `max_tokens`
    pub async fn add_tokens(&self, identity: &str, tokens: i64) -> Result<i64> {
        if tokens <= 0 {
            return Err(RateLimitError::validation(
                "tokens to add must be greater than 0",
            ));
        }

        let (token_key, _) = self.keys(identity)?;
        let script = &scripts::TOKEN_BUCKET_ADD;
        let reply = self
            .store
            .execute_atomic(
                script,
                &[token_key],
                &[self.policy.max_tokens, tokens, ttl_secs(TOKEN_BUCKET_TTL)],
            )
            .await?;
        Ok(single_value(script, reply)?)
    }

    /// Overwrite the token count. The refill timestamp is left alone.
    pub async fn set_tokens(&self, identity: &str, tokens: i64) -> Result<()> {
        if tokens < 0 {
            return Err(RateLimitError::validation("tokens cannot be negative"));
        }
        if tokens > self.policy.max_tokens {
            return Err(RateLimitError::validation(format!(
                "tokens cannot exceed max tokens ({})",
                self.policy.max_tokens
            )));
        }

        let (token_key, _) = self.keys(identity)?;
        self.store
            .set_with_expiry(&token_key, tokens, TOKEN_BUCKET_TTL)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn limiter(max: i64, interval: u64, per_refill: i64) -> (TokenBucketLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let policy = TokenBucketPolicy::new("tb", max, Duration::from_secs(interval))
            .with_tokens_per_refill(per_refill);
        let limiter = TokenBucketLimiter::new(store, policy)
            .unwrap()
            .with_clock(clock.clone());
        (limiter, clock)
    }

    #[tokio::test]
    async fn test_drains_then_denies() {
        let (limiter, _) = limiter(2, 10, 1);
        assert_eq!(limiter.is_allowed("u").await.unwrap(), Decision::allowed(1));
        assert_eq!(limiter.is_allowed("u").await.unwrap(), Decision::allowed(0));
        assert_eq!(limiter.is_allowed("u").await.unwrap(), Decision::denied(0));
    }

    #[tokio::test]
    async fn test_current_tokens_reflects_due_refill() {
        let (limiter, clock) = limiter(4, 2, 1);
        for _ in 0..4 {
            limiter.is_allowed("u").await.unwrap();
        }
        assert_eq!(limiter.current_tokens("u").await.unwrap(), 0);

        clock.advance(Duration::from_secs(5));
        assert_eq!(limiter.current_tokens("u").await.unwrap(), 2);
        // Inspecting again without time passing changes nothing
        assert_eq!(limiter.current_tokens("u").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_admin_operations() {
        let (limiter, _) = limiter(5, 10, 5);
        for _ in 0..5 {
            limiter.is_allowed("u").await.unwrap();
        }

        assert_eq!(limiter.add_tokens("u", 2).await.unwrap(), 2);
        assert_eq!(limiter.add_tokens("u", 100).await.unwrap(), 5);
        assert!(limiter.add_tokens("u", 0).await.is_err());

        limiter.set_tokens("u", 1).await.unwrap();
        assert_eq!(limiter.current_tokens("u").await.unwrap(), 1);
        assert!(matches!(
            limiter.set_tokens("u", 6).await,
            Err(RateLimitError::Validation(_))
        ));
        assert!(limiter.set_tokens("u", -1).await.is_err());

        limiter.reset("u").await.unwrap();
        assert_eq!(limiter.current_tokens("u").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_empty_identity_is_rejected() {
        let (limiter, _) = limiter(5, 10, 5);
        assert!(matches!(
            limiter.is_allowed("").await,
            Err(RateLimitError::Validation(_))
        ));
    }
}
