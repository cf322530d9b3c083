//! Atomic scripted store
//!
//! Limiters never perform a read followed by a separate write. Every decision
//! is a single [`AtomicScript`] submitted through [`AtomicStore::execute_atomic`],
//! which the store evaluates as one indivisible step. Two backends are provided:
//!
//! - [`RedisStore`]: Lua scripts evaluated server-side (EVALSHA/EVAL)
//! - [`MemoryStore`]: one in-process keyspace owned behind a single lock,
//!   executing each named contract natively
//!
//! Any other store offering linearizable multi-key read-modify-write can
//! implement the trait by honouring the same named contracts.

pub mod memory;
pub mod redis;
pub mod scripts;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

/// A named, versioned atomic transaction.
///
/// `source` is the Lua body used by script-capable stores. Stores that do not
/// speak Lua dispatch on [`AtomicScript::id`] instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtomicScript {
    pub name: &'static str,
    pub version: u32,
    pub source: &'static str,
}

impl AtomicScript {
    /// Stable identifier, e.g. `token_bucket_consume@v1`
    pub fn id(&self) -> String {
        format!("{}@v{}", self.name, self.version)
    }
}

impl fmt::Display for AtomicScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@v{}", self.name, self.version)
    }
}

/// Keyed integer store with server-side atomic transactions
#[async_trait]
pub trait AtomicStore: Send + Sync {
    /// Read an integer value
    async fn get(&self, key: &str) -> StoreResult<Option<i64>>;

    /// Overwrite a value and its expiry
    async fn set_with_expiry(&self, key: &str, value: i64, ttl: Duration) -> StoreResult<()>;

    /// Add `delta` (absent counts as 0) and refresh the expiry in one step
    async fn increment_by(&self, key: &str, delta: i64, ttl: Duration) -> StoreResult<i64>;

    /// Read one integer field of a composite record
    async fn hash_get(&self, key: &str, field: &str) -> StoreResult<Option<i64>>;

    /// Write fields of a composite record and refresh its expiry in one step
    async fn hash_set(&self, key: &str, fields: &[(&str, i64)], ttl: Duration) -> StoreResult<()>;

    /// Delete keys, returning how many existed
    async fn delete(&self, keys: &[String]) -> StoreResult<u64>;

    /// Run a transaction as one indivisible unit.
    ///
    /// Every contract in [`scripts`] replies with a flat integer table.
    async fn execute_atomic(
        &self,
        script: &AtomicScript,
        keys: &[String],
        args: &[i64],
    ) -> StoreResult<Vec<i64>>;
}

/// Convert a TTL to whole seconds for the store, never less than one
pub fn ttl_secs(ttl: Duration) -> i64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    i64::try_from(secs.max(1)).unwrap_or(i64::MAX)
}

/// Leaky-bucket record lifetime, `ceil(capacity / rate)` seconds and at least 1
pub fn leak_ttl_secs(capacity: i64, rate: i64) -> i64 {
    let capacity = capacity.max(0);
    let rate = rate.max(1);
    (capacity / rate + i64::from(capacity % rate != 0)).max(1)
}

/// Check the arity of a script reply
pub(crate) fn expect_reply(
    script: &AtomicScript,
    reply: Vec<i64>,
    len: usize,
) -> StoreResult<Vec<i64>> {
    if reply.len() == len {
        Ok(reply)
    } else {
        Err(StoreError::UnexpectedReply {
            operation: script.id(),
            detail: format!("expected {} values, got {:?}", len, reply),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_id() {
        assert_eq!(
            scripts::TOKEN_BUCKET_CONSUME.id(),
            "token_bucket_consume@v1"
        );
        assert_eq!(scripts::LEAKY_BUCKET_INSPECT.to_string(), "leaky_bucket_inspect@v1");
    }

    #[test]
    fn test_ttl_secs_rounds_up() {
        assert_eq!(ttl_secs(Duration::from_secs(3)), 3);
        assert_eq!(ttl_secs(Duration::from_millis(1500)), 2);
        assert_eq!(ttl_secs(Duration::from_millis(10)), 1);
        assert_eq!(ttl_secs(Duration::ZERO), 1);
    }

    #[test]
    fn test_leak_ttl_secs() {
        assert_eq!(leak_ttl_secs(5, 2), 3);
        assert_eq!(leak_ttl_secs(4, 2), 2);
        assert_eq!(leak_ttl_secs(1, 10), 1);
        assert_eq!(leak_ttl_secs(i64::MAX, 1), i64::MAX);
        assert_eq!(leak_ttl_secs(i64::MAX, 2), i64::MAX / 2 + 1);
    }

    #[test]
    fn test_expect_reply_shape() {
        let script = &scripts::FIXED_WINDOW_CONSUME;
        assert!(expect_reply(script, vec![1, 2], 2).is_ok());
        assert!(matches!(
            expect_reply(script, vec![1], 2),
            Err(StoreError::UnexpectedReply { .. })
        ));
    }
}
