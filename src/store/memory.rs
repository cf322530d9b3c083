use super::{leak_ttl_secs, scripts, ttl_secs, AtomicScript, AtomicStore};
use crate::clock::{Clock, SystemClock};
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::trace;

/// In-process atomic store
///
/// The whole keyspace sits behind one lock and every contract runs to
/// completion while holding it, which gives the same per-key linearizability
/// as server-side script evaluation. Useful for tests and single-process
/// deployments; it does not share state across processes.
#[derive(Clone)]
pub struct MemoryStore {
    keyspace: Arc<Mutex<Keyspace>>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone)]
enum Value {
    Int(i64),
    Hash(HashMap<String, i64>),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

/// Expired entries are dropped at most this often on writes
const SWEEP_INTERVAL_SECS: i64 = 1;

#[derive(Debug, Default)]
struct Keyspace {
    entries: HashMap<String, Entry>,
    last_sweep: Option<DateTime<Utc>>,
}

impl Keyspace {
    /// Drop every expired entry. Window keys carry their bucket in the name
    /// and are never read again once the window has passed.
    fn sweep(&mut self, now: DateTime<Utc>) {
        let due = self
            .last_sweep
            .map_or(true, |at| (now - at).num_seconds() >= SWEEP_INTERVAL_SECS);
        if !due {
            return;
        }
        let before = self.entries.len();
        self.entries
            .retain(|_, e| e.expires_at.map_or(true, |at| at > now));
        self.last_sweep = Some(now);
        if self.entries.len() < before {
            trace!("Swept {} expired keys", before - self.entries.len());
        }
    }

    fn live(&mut self, key: &str, now: DateTime<Utc>) -> Option<&mut Entry> {
        let expired = matches!(
            self.entries.get(key),
            Some(Entry { expires_at: Some(at), .. }) if *at <= now
        );
        if expired {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn get_int(&mut self, key: &str, now: DateTime<Utc>) -> StoreResult<Option<i64>> {
        match self.live(key, now) {
            None => Ok(None),
            Some(Entry { value: Value::Int(v), .. }) => Ok(Some(*v)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn set_int(&mut self, key: &str, value: i64, ttl_secs: i64, now: DateTime<Utc>) {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Int(value),
                expires_at: expiry(now, ttl_secs),
            },
        );
    }

    fn hash_field(&mut self, key: &str, field: &str, now: DateTime<Utc>) -> StoreResult<Option<i64>> {
        match self.live(key, now) {
            None => Ok(None),
            Some(Entry { value: Value::Hash(fields), .. }) => Ok(fields.get(field).copied()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn hash_write(
        &mut self,
        key: &str,
        fields: &[(&str, i64)],
        now: DateTime<Utc>,
    ) -> StoreResult<&mut Entry> {
        if self.live(key, now).is_none() {
            self.entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Hash(HashMap::new()),
                    expires_at: None,
                },
            );
        }
        let entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| StoreError::WrongType(key.to_string()))?;
        match &mut entry.value {
            Value::Hash(map) => {
                for (field, value) in fields {
                    map.insert((*field).to_string(), *value);
                }
            }
            Value::Int(_) => return Err(StoreError::WrongType(key.to_string())),
        }
        Ok(entry)
    }

    fn expire(&mut self, key: &str, ttl_secs: i64, now: DateTime<Utc>) {
        if let Some(entry) = self.live(key, now) {
            entry.expires_at = expiry(now, ttl_secs);
        }
    }
}

/// `None` when the deadline is past what chrono can represent
fn expiry(now: DateTime<Utc>, ttl_secs: i64) -> Option<DateTime<Utc>> {
    chrono::Duration::try_seconds(ttl_secs.max(1)).and_then(|ttl| now.checked_add_signed(ttl))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Evaluate expiry against `clock`
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            keyspace: Arc::new(Mutex::new(Keyspace::default())),
            clock,
        }
    }

    /// Number of live keys
    pub async fn len(&self) -> usize {
        let now = self.clock.now();
        let keyspace = self.keyspace.lock().await;
        keyspace
            .entries
            .values()
            .filter(|e| e.expires_at.map_or(true, |at| at > now))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Remaining time to live of a key, if it exists and has one
    pub async fn ttl(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now();
        let mut keyspace = self.keyspace.lock().await;
        keyspace
            .live(key, now)
            .and_then(|e| e.expires_at)
            .and_then(|at| (at - now).to_std().ok())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AtomicStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<i64>> {
        let now = self.clock.now();
        self.keyspace.lock().await.get_int(key, now)
    }

    async fn set_with_expiry(&self, key: &str, value: i64, ttl: Duration) -> StoreResult<()> {
        let now = self.clock.now();
        let mut keyspace = self.keyspace.lock().await;
        keyspace.sweep(now);
        keyspace.set_int(key, value, ttl_secs(ttl), now);
        Ok(())
    }

    async fn increment_by(&self, key: &str, delta: i64, ttl: Duration) -> StoreResult<i64> {
        let now = self.clock.now();
        let mut keyspace = self.keyspace.lock().await;
        keyspace.sweep(now);
        let value = keyspace.get_int(key, now)?.unwrap_or(0).saturating_add(delta);
        keyspace.set_int(key, value, ttl_secs(ttl), now);
        Ok(value)
    }

    async fn hash_get(&self, key: &str, field: &str) -> StoreResult<Option<i64>> {
        let now = self.clock.now();
        self.keyspace.lock().await.hash_field(key, field, now)
    }

    async fn hash_set(&self, key: &str, fields: &[(&str, i64)], ttl: Duration) -> StoreResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let now = self.clock.now();
        let mut keyspace = self.keyspace.lock().await;
        keyspace.sweep(now);
        let entry = keyspace.hash_write(key, fields, now)?;
        entry.expires_at = expiry(now, ttl_secs(ttl));
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<u64> {
        let now = self.clock.now();
        let mut keyspace = self.keyspace.lock().await;
        let mut deleted = 0;
        for key in keys {
            if keyspace.live(key, now).is_some() {
                keyspace.entries.remove(key);
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn execute_atomic(
        &self,
        script: &AtomicScript,
        keys: &[String],
        args: &[i64],
    ) -> StoreResult<Vec<i64>> {
        let now = self.clock.now();
        let invocation = Invocation { script, keys, args };
        let mut keyspace = self.keyspace.lock().await;
        keyspace.sweep(now);
        trace!("Executing {} on {:?}", script, keys);

        match script.name {
            n if n == scripts::FIXED_WINDOW_CONSUME.name => {
                fixed_window_consume(&mut keyspace, &invocation, now)
            }
            n if n == scripts::FIXED_WINDOW_INCREASE.name => {
                fixed_window_increase(&mut keyspace, &invocation, now)
            }
            n if n == scripts::TOKEN_BUCKET_CONSUME.name => {
                token_bucket(&mut keyspace, &invocation, now, true)
            }
            n if n == scripts::TOKEN_BUCKET_INSPECT.name => {
                token_bucket(&mut keyspace, &invocation, now, false)
            }
            n if n == scripts::TOKEN_BUCKET_ADD.name => {
                token_bucket_add(&mut keyspace, &invocation, now)
            }
            n if n == scripts::LEAKY_BUCKET_CONSUME.name => {
                leaky_bucket(&mut keyspace, &invocation, now, LeakAction::Consume)
            }
            n if n == scripts::LEAKY_BUCKET_INSPECT.name => {
                leaky_bucket(&mut keyspace, &invocation, now, LeakAction::Inspect)
            }
            n if n == scripts::LEAKY_BUCKET_ADD.name => {
                leaky_bucket(&mut keyspace, &invocation, now, LeakAction::Add)
            }
            n if n == scripts::USAGE_WINDOW_CONSUME.name => {
                usage_window_consume(&mut keyspace, &invocation, now)
            }
            _ => Err(StoreError::UnknownScript(script.id())),
        }
    }
}

struct Invocation<'a> {
    script: &'a AtomicScript,
    keys: &'a [String],
    args: &'a [i64],
}

impl Invocation<'_> {
    fn key(&self, i: usize) -> StoreResult<&str> {
        self.keys
            .get(i)
            .map(String::as_str)
            .ok_or_else(|| self.invalid(format!("missing KEYS[{}]", i + 1)))
    }

    fn arg(&self, i: usize) -> StoreResult<i64> {
        self.args
            .get(i)
            .copied()
            .ok_or_else(|| self.invalid(format!("missing ARGV[{}]", i + 1)))
    }

    fn positive_arg(&self, i: usize) -> StoreResult<i64> {
        let value = self.arg(i)?;
        if value <= 0 {
            return Err(self.invalid(format!("ARGV[{}] must be positive", i + 1)));
        }
        Ok(value)
    }

    fn invalid(&self, detail: String) -> StoreError {
        StoreError::InvalidInvocation {
            script: self.script.id(),
            detail,
        }
    }
}

fn fixed_window_consume(
    ks: &mut Keyspace,
    inv: &Invocation<'_>,
    now: DateTime<Utc>,
) -> StoreResult<Vec<i64>> {
    let key = inv.key(0)?;
    let max_count = inv.arg(0)?;
    let ttl = inv.arg(1)?;

    let remaining = ks.get_int(key, now)?.unwrap_or(max_count);
    if remaining <= 0 {
        return Ok(vec![0, 0]);
    }

    let remaining = remaining - 1;
    ks.set_int(key, remaining, ttl, now);
    Ok(vec![1, remaining])
}

fn fixed_window_increase(
    ks: &mut Keyspace,
    inv: &Invocation<'_>,
    now: DateTime<Utc>,
) -> StoreResult<Vec<i64>> {
    let key = inv.key(0)?;
    let max_count = inv.arg(0)?;
    let increment = inv.arg(1)?;
    let ttl = inv.arg(2)?;

    let remaining = ks.get_int(key, now)?.unwrap_or(max_count);
    let remaining = max_count.min(remaining.saturating_add(increment));
    ks.set_int(key, remaining, ttl, now);
    Ok(vec![remaining])
}

fn token_bucket(
    ks: &mut Keyspace,
    inv: &Invocation<'_>,
    now: DateTime<Utc>,
    consume: bool,
) -> StoreResult<Vec<i64>> {
    let token_key = inv.key(0)?;
    let time_key = inv.key(1)?;
    let max_tokens = inv.arg(0)?;
    let interval = inv.positive_arg(1)?;
    let per_refill = inv.arg(2)?;
    let current_time = inv.arg(3)?;
    let ttl = inv.arg(4)?;

    let mut tokens = ks.get_int(token_key, now)?.unwrap_or(max_tokens);
    let mut last_refill = ks.get_int(time_key, now)?.unwrap_or(current_time);

    let cycles = (current_time - last_refill).div_euclid(interval);
    let tokens_to_add = cycles.saturating_mul(per_refill);
    let refilled = tokens_to_add > 0;
    if refilled {
        tokens = max_tokens.min(tokens.saturating_add(tokens_to_add));
        last_refill += cycles * interval;
    }

    if !consume {
        if refilled {
            ks.set_int(token_key, tokens, ttl, now);
            ks.set_int(time_key, last_refill, ttl, now);
        }
        return Ok(vec![tokens]);
    }

    if tokens > 0 {
        tokens -= 1;
        ks.set_int(token_key, tokens, ttl, now);
        ks.set_int(time_key, last_refill, ttl, now);
        return Ok(vec![1, tokens]);
    }

    ks.set_int(time_key, last_refill, ttl, now);
    Ok(vec![0, tokens])
}

fn token_bucket_add(
    ks: &mut Keyspace,
    inv: &Invocation<'_>,
    now: DateTime<Utc>,
) -> StoreResult<Vec<i64>> {
    let token_key = inv.key(0)?;
    let max_tokens = inv.arg(0)?;
    let tokens_to_add = inv.arg(1)?;
    let ttl = inv.arg(2)?;

    let tokens = ks.get_int(token_key, now)?.unwrap_or(max_tokens);
    let tokens = max_tokens.min(tokens.saturating_add(tokens_to_add));
    ks.set_int(token_key, tokens, ttl, now);
    Ok(vec![tokens])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeakAction {
    Consume,
    Inspect,
    Add,
}

fn leaky_bucket(
    ks: &mut Keyspace,
    inv: &Invocation<'_>,
    now: DateTime<Utc>,
    action: LeakAction,
) -> StoreResult<Vec<i64>> {
    let key = inv.key(0)?;
    let rate = inv.positive_arg(0)?;
    let capacity = inv.arg(1)?;
    let (tokens_to_add, current_time) = match action {
        LeakAction::Add => (inv.arg(2)?, inv.arg(3)?),
        _ => (0, inv.arg(2)?),
    };

    let tokens = ks.hash_field(key, "tokens", now)?.unwrap_or(capacity);
    let last_time = ks.hash_field(key, "last_time", now)?.unwrap_or(0);

    let elapsed = (current_time - last_time).max(0);
    let mut tokens = capacity.min(tokens.saturating_add(elapsed.saturating_mul(rate)));

    let mut reply = Vec::with_capacity(2);
    match action {
        LeakAction::Consume => {
            let allowed = tokens >= 1;
            if allowed {
                tokens -= 1;
            }
            reply.push(i64::from(allowed));
        }
        LeakAction::Add => tokens = capacity.min(tokens.saturating_add(tokens_to_add)),
        LeakAction::Inspect => {}
    }
    reply.push(tokens);

    ks.hash_write(key, &[("tokens", tokens), ("last_time", current_time)], now)?;
    ks.expire(key, leak_ttl_secs(capacity, rate), now);
    Ok(reply)
}

fn usage_window_consume(
    ks: &mut Keyspace,
    inv: &Invocation<'_>,
    now: DateTime<Utc>,
) -> StoreResult<Vec<i64>> {
    let key = inv.key(0)?;
    let max_count = inv.arg(0)?;
    let ttl = inv.arg(1)?;

    let existing = ks.get_int(key, now)?;
    let used = existing.unwrap_or(0).saturating_add(1);
    if used > max_count {
        // Rolled back: the stored count is left as it was
        return Ok(vec![0, (max_count - (used - 1)).max(0)]);
    }

    if used == 1 {
        ks.set_int(key, used, ttl, now);
    } else if let Some(entry) = ks.live(key, now) {
        entry.value = Value::Int(used);
    }
    Ok(vec![1, max_count - used])
}
