use crate::error::{RateLimitError, Result, StoreResult};
use crate::store::{expect_reply, leak_ttl_secs, AtomicScript};
use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Longest accepted window, and the cap on derived token bucket expiry
pub const MAX_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Shortest accepted fixed window
pub const MIN_WINDOW: Duration = Duration::from_secs(1);

/// Accepted fixed-window request density, in requests per second
pub const MIN_REQUESTS_PER_SECOND: f64 = 0.1;
pub const MAX_REQUESTS_PER_SECOND: f64 = 10_000.0;

/// Token bucket records live this long regardless of policy
pub const TOKEN_BUCKET_TTL: Duration = MAX_WINDOW;

/// Fixed window: a remaining-count per calendar-aligned window
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FixedWindowPolicy {
    /// Key prefix (the identity the limit applies to)
    pub key_prefix: String,
    /// Requests admitted per window
    pub max_count: i64,
    /// Window length
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Offset used to render calendar window tokens
    #[serde(default)]
    pub utc_offset_secs: i32,
}

impl FixedWindowPolicy {
    pub fn new(key_prefix: impl Into<String>, max_count: i64, window: Duration) -> Self {
        Self {
            key_prefix: key_prefix.into(),
            max_count,
            window,
            utc_offset_secs: 0,
        }
    }

    pub fn with_utc_offset(mut self, secs: i32) -> Self {
        self.utc_offset_secs = secs;
        self
    }

    pub fn requests_per_second(&self) -> f64 {
        self.max_count as f64 / self.window.as_secs_f64()
    }

    pub fn validate(&self) -> Result<()> {
        validate_prefix(&self.key_prefix)?;
        if self.max_count <= 0 {
            return Err(RateLimitError::config("max count must be greater than 0"));
        }
        validate_window(self.window)?;
        utc_offset(self.utc_offset_secs)?;

        let density = self.requests_per_second();
        if density < MIN_REQUESTS_PER_SECOND {
            return Err(RateLimitError::config(format!(
                "request density too low: {:.2} requests/second (<{:.1}), increase max count or shorten the window",
                density, MIN_REQUESTS_PER_SECOND
            )));
        }
        if density > MAX_REQUESTS_PER_SECOND {
            return Err(RateLimitError::config(format!(
                "request density too high: {:.2} requests/second (>{:.0}), decrease max count or lengthen the window",
                density, MAX_REQUESTS_PER_SECOND
            )));
        }
        Ok(())
    }
}

/// Token bucket: discrete refills at a fixed cadence
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenBucketPolicy {
    pub key_prefix: String,
    /// Bucket capacity
    pub max_tokens: i64,
    /// Refill cadence, whole seconds
    #[serde(with = "humantime_serde")]
    pub refill_interval: Duration,
    /// Tokens credited per elapsed interval (defaults to `max_tokens`)
    #[serde(default)]
    pub tokens_per_refill: Option<i64>,
}

impl TokenBucketPolicy {
    pub fn new(key_prefix: impl Into<String>, max_tokens: i64, refill_interval: Duration) -> Self {
        Self {
            key_prefix: key_prefix.into(),
            max_tokens,
            refill_interval,
            tokens_per_refill: None,
        }
    }

    pub fn with_tokens_per_refill(mut self, tokens: i64) -> Self {
        self.tokens_per_refill = Some(tokens);
        self
    }

    pub fn tokens_per_refill(&self) -> i64 {
        self.tokens_per_refill.unwrap_or(self.max_tokens)
    }

    /// Time for an empty bucket to refill completely, in seconds
    pub fn full_refill_secs(&self) -> i64 {
        let interval = i64::try_from(self.refill_interval.as_secs()).unwrap_or(i64::MAX);
        self.max_tokens.saturating_mul(interval) / self.tokens_per_refill().max(1)
    }

    pub fn validate(&self) -> Result<()> {
        validate_prefix(&self.key_prefix)?;
        if self.max_tokens <= 0 {
            return Err(RateLimitError::config("max tokens must be greater than 0"));
        }
        if self.refill_interval < MIN_WINDOW {
            return Err(RateLimitError::config(
                "refill interval must be at least 1 second",
            ));
        }
        if self.refill_interval.subsec_nanos() != 0 {
            return Err(RateLimitError::config(
                "refill interval must be a whole number of seconds",
            ));
        }
        if self.tokens_per_refill() <= 0 {
            return Err(RateLimitError::config(
                "tokens per refill must be greater than 0",
            ));
        }

        let expiry = self.full_refill_secs();
        if expiry > MAX_WINDOW.as_secs() as i64 {
            return Err(RateLimitError::config(format!(
                "configuration would take {} seconds to refill (>24h), adjust max tokens, refill interval, or tokens per refill",
                expiry
            )));
        }
        Ok(())
    }
}

/// Leaky bucket: capacity recovers continuously at `rate` per second
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LeakyBucketPolicy {
    pub key_prefix: String,
    /// Capacity recovered per second
    pub rate: i64,
    /// Bucket size
    pub capacity: i64,
}

impl LeakyBucketPolicy {
    pub fn new(key_prefix: impl Into<String>, rate: i64, capacity: i64) -> Self {
        Self {
            key_prefix: key_prefix.into(),
            rate,
            capacity,
        }
    }

    /// Record lifetime: `ceil(capacity / rate)` seconds
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(leak_ttl_secs(self.capacity, self.rate).unsigned_abs())
    }

    pub fn validate(&self) -> Result<()> {
        validate_prefix(&self.key_prefix)?;
        if self.rate <= 0 {
            return Err(RateLimitError::config("rate must be greater than 0"));
        }
        if self.capacity <= 0 {
            return Err(RateLimitError::config("capacity must be greater than 0"));
        }
        Ok(())
    }
}

/// Count-up fixed window: stores the used count instead of the remaining one
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsageWindowPolicy {
    pub key_prefix: String,
    pub max_count: i64,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    #[serde(default)]
    pub utc_offset_secs: i32,
}

impl UsageWindowPolicy {
    pub fn new(key_prefix: impl Into<String>, max_count: i64, window: Duration) -> Self {
        Self {
            key_prefix: key_prefix.into(),
            max_count,
            window,
            utc_offset_secs: 0,
        }
    }

    pub fn with_utc_offset(mut self, secs: i32) -> Self {
        self.utc_offset_secs = secs;
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_prefix(&self.key_prefix)?;
        if self.max_count <= 0 {
            return Err(RateLimitError::config("max count must be greater than 0"));
        }
        validate_window(self.window)?;
        utc_offset(self.utc_offset_secs)?;
        Ok(())
    }
}

/// Any supported policy, as written in configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum RateLimitPolicy {
    FixedWindow(FixedWindowPolicy),
    TokenBucket(TokenBucketPolicy),
    LeakyBucket(LeakyBucketPolicy),
    UsageWindow(UsageWindowPolicy),
}

impl RateLimitPolicy {
    pub fn algorithm(&self) -> &'static str {
        match self {
            RateLimitPolicy::FixedWindow(_) => "fixed_window",
            RateLimitPolicy::TokenBucket(_) => "token_bucket",
            RateLimitPolicy::LeakyBucket(_) => "leaky_bucket",
            RateLimitPolicy::UsageWindow(_) => "usage_window",
        }
    }

    pub fn key_prefix(&self) -> &str {
        match self {
            RateLimitPolicy::FixedWindow(p) => &p.key_prefix,
            RateLimitPolicy::TokenBucket(p) => &p.key_prefix,
            RateLimitPolicy::LeakyBucket(p) => &p.key_prefix,
            RateLimitPolicy::UsageWindow(p) => &p.key_prefix,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            RateLimitPolicy::FixedWindow(p) => p.validate(),
            RateLimitPolicy::TokenBucket(p) => p.validate(),
            RateLimitPolicy::LeakyBucket(p) => p.validate(),
            RateLimitPolicy::UsageWindow(p) => p.validate(),
        }
    }
}

/// Outcome of one admission decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    /// Whether the request is admitted
    pub allowed: bool,
    /// Remaining count, tokens or level after the decision
    pub remaining: i64,
}

impl Decision {
    pub fn allowed(remaining: i64) -> Self {
        Self {
            allowed: true,
            remaining,
        }
    }

    pub fn denied(remaining: i64) -> Self {
        Self {
            allowed: false,
            remaining,
        }
    }

    /// Parse an `{allowed, counter}` script reply
    pub(crate) fn from_reply(script: &AtomicScript, reply: Vec<i64>) -> StoreResult<Self> {
        let reply = expect_reply(script, reply, 2)?;
        Ok(Self {
            allowed: reply[0] == 1,
            remaining: reply[1],
        })
    }
}

/// Parse a single-value script reply
pub(crate) fn single_value(script: &AtomicScript, reply: Vec<i64>) -> StoreResult<i64> {
    Ok(expect_reply(script, reply, 1)?[0])
}

pub(crate) fn validate_identity(identity: &str) -> Result<()> {
    if identity.is_empty() {
        return Err(RateLimitError::validation("identity cannot be empty"));
    }
    Ok(())
}

pub(crate) fn utc_offset(secs: i32) -> Result<FixedOffset> {
    FixedOffset::east_opt(secs).ok_or_else(|| {
        RateLimitError::config(format!("utc offset {} seconds is out of range", secs))
    })
}

fn validate_prefix(prefix: &str) -> Result<()> {
    if prefix.is_empty() {
        return Err(RateLimitError::config("key prefix cannot be empty"));
    }
    Ok(())
}

fn validate_window(window: Duration) -> Result<()> {
    if window.is_zero() {
        return Err(RateLimitError::config("window must be greater than 0"));
    }
    if window < MIN_WINDOW {
        return Err(RateLimitError::config("window cannot be less than 1 second"));
    }
    if window > MAX_WINDOW {
        return Err(RateLimitError::config("window cannot exceed 24 hours"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::scripts;

    #[test]
    fn test_fixed_window_density_bounds() {
        assert!(FixedWindowPolicy::new("k", 3, Duration::from_secs(2))
            .validate()
            .is_ok());

        // 1 request per day is far below 0.1/s
        let loose = FixedWindowPolicy::new("k", 1, MAX_WINDOW).validate();
        assert!(matches!(loose, Err(RateLimitError::Configuration(msg)) if msg.contains("too low")));

        let tight = FixedWindowPolicy::new("k", 20_000, Duration::from_secs(1)).validate();
        assert!(matches!(tight, Err(RateLimitError::Configuration(msg)) if msg.contains("too high")));
    }

    #[test]
    fn test_fixed_window_rejects_bad_parameters() {
        assert!(FixedWindowPolicy::new("", 10, Duration::from_secs(1))
            .validate()
            .is_err());
        assert!(FixedWindowPolicy::new("k", 0, Duration::from_secs(1))
            .validate()
            .is_err());
        assert!(FixedWindowPolicy::new("k", 10, Duration::ZERO)
            .validate()
            .is_err());
        assert!(FixedWindowPolicy::new("k", 10, Duration::from_millis(500))
            .validate()
            .is_err());
        assert!(FixedWindowPolicy::new("k", 100_000, MAX_WINDOW + Duration::from_secs(1))
            .validate()
            .is_err());
        assert!(FixedWindowPolicy::new("k", 10, Duration::from_secs(1))
            .with_utc_offset(90_000)
            .validate()
            .is_err());
    }

    #[test]
    fn test_token_bucket_defaults_and_expiry() {
        let policy = TokenBucketPolicy::new("tb", 10, Duration::from_secs(60));
        assert_eq!(policy.tokens_per_refill(), 10);
        assert_eq!(policy.full_refill_secs(), 60);
        assert!(policy.validate().is_ok());

        // 2000 tokens, one per minute: 120000s to refill
        let slow = TokenBucketPolicy::new("tb", 2000, Duration::from_secs(60)).with_tokens_per_refill(1);
        assert!(slow.validate().is_err());

        let zero_refill = TokenBucketPolicy::new("tb", 10, Duration::from_secs(1)).with_tokens_per_refill(0);
        assert!(zero_refill.validate().is_err());

        let fractional = TokenBucketPolicy::new("tb", 10, Duration::from_millis(1500));
        assert!(fractional.validate().is_err());
    }

    #[test]
    fn test_leaky_bucket_ttl() {
        assert_eq!(LeakyBucketPolicy::new("lb", 2, 5).ttl(), Duration::from_secs(3));
        assert_eq!(LeakyBucketPolicy::new("lb", 10, 1).ttl(), Duration::from_secs(1));
        assert_eq!(
            LeakyBucketPolicy::new("lb", 2, i64::MAX).ttl(),
            Duration::from_secs((i64::MAX / 2 + 1) as u64)
        );
        assert!(LeakyBucketPolicy::new("lb", 0, 5).validate().is_err());
        assert!(LeakyBucketPolicy::new("lb", 1, 0).validate().is_err());
    }

    #[test]
    fn test_policy_from_yaml() {
        let yaml = r#"
algorithm: token_bucket
key_prefix: "api"
max_tokens: 5
refill_interval: 2s
tokens_per_refill: 2
"#;
        let policy: RateLimitPolicy = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(policy.algorithm(), "token_bucket");
        assert_eq!(policy.key_prefix(), "api");
        match policy {
            RateLimitPolicy::TokenBucket(tb) => {
                assert_eq!(tb.refill_interval, Duration::from_secs(2));
                assert_eq!(tb.tokens_per_refill(), 2);
            }
            other => panic!("unexpected policy {:?}", other),
        }
    }

    #[test]
    fn test_decision_from_reply() {
        let script = &scripts::FIXED_WINDOW_CONSUME;
        assert_eq!(
            Decision::from_reply(script, vec![1, 4]).unwrap(),
            Decision::allowed(4)
        );
        assert_eq!(
            Decision::from_reply(script, vec![0, 0]).unwrap(),
            Decision::denied(0)
        );
        assert!(Decision::from_reply(script, vec![1]).is_err());
        assert!(single_value(script, vec![1, 2]).is_err());
    }

    #[test]
    fn test_identity_validation() {
        assert!(validate_identity("user-1").is_ok());
        assert!(matches!(
            validate_identity(""),
            Err(RateLimitError::Validation(_))
        ));
    }
}
