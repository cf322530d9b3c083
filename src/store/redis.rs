use super::{ttl_secs, AtomicScript, AtomicStore};
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use dashmap::DashMap;
use redis::{aio::ConnectionManager, RedisResult, Script};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

/// Redis-backed atomic store
///
/// Scripts are compiled once per contract id and invoked through EVALSHA,
/// falling back to EVAL when the server has not cached them yet.
#[derive(Clone)]
pub struct RedisStore {
    /// Redis connection manager (reconnects on failure, cheap to clone)
    connection: ConnectionManager,
    /// Compiled scripts keyed by contract id
    scripts: std::sync::Arc<DashMap<String, Script>>,
    /// Upper bound for a single store round-trip
    command_timeout: Option<Duration>,
}

impl RedisStore {
    /// Connect to Redis
    pub async fn connect(redis_url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let connection = ConnectionManager::new(client).await?;
        info!("Connected to Redis store");

        Ok(Self {
            connection,
            scripts: std::sync::Arc::new(DashMap::new()),
            command_timeout: None,
        })
    }

    /// Bound every store call by `timeout`
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    /// Test Redis connection
    pub async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.connection.clone();
        self.bounded(async move { redis::cmd("PING").query_async::<_, String>(&mut conn).await })
            .await
            .map(|_| ())
    }

    fn script(&self, contract: &AtomicScript) -> Script {
        self.scripts
            .entry(contract.id())
            .or_insert_with(|| {
                debug!("Compiling atomic script {}", contract);
                Script::new(contract.source)
            })
            .clone()
    }

    async fn bounded<T, F>(&self, fut: F) -> StoreResult<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match self.command_timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => result.map_err(StoreError::from),
                Err(_) => Err(StoreError::Timeout(limit)),
            },
            None => fut.await.map_err(StoreError::from),
        }
    }
}

#[async_trait]
impl AtomicStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<i64>> {
        let mut conn = self.connection.clone();
        self.bounded(async move {
            redis::cmd("GET")
                .arg(key)
                .query_async::<_, Option<i64>>(&mut conn)
                .await
        })
        .await
    }

    async fn set_with_expiry(&self, key: &str, value: i64, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.connection.clone();
        self.bounded(async move {
            redis::cmd("SETEX")
                .arg(key)
                .arg(ttl_secs(ttl))
                .arg(value)
                .query_async::<_, ()>(&mut conn)
                .await
        })
        .await
    }

    async fn increment_by(&self, key: &str, delta: i64, ttl: Duration) -> StoreResult<i64> {
        let mut conn = self.connection.clone();
        let (value,): (i64,) = self
            .bounded(async move {
                redis::pipe()
                    .atomic()
                    .cmd("INCRBY")
                    .arg(key)
                    .arg(delta)
                    .cmd("EXPIRE")
                    .arg(key)
                    .arg(ttl_secs(ttl))
                    .ignore()
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(value)
    }

    async fn hash_get(&self, key: &str, field: &str) -> StoreResult<Option<i64>> {
        let mut conn = self.connection.clone();
        self.bounded(async move {
            redis::cmd("HGET")
                .arg(key)
                .arg(field)
                .query_async::<_, Option<i64>>(&mut conn)
                .await
        })
        .await
    }

    async fn hash_set(&self, key: &str, fields: &[(&str, i64)], ttl: Duration) -> StoreResult<()> {
        if fields.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        {
            let hset = pipe.cmd("HSET").arg(key);
            for (field, value) in fields {
                hset.arg(*field).arg(*value);
            }
            hset.ignore();
        }
        pipe.cmd("EXPIRE").arg(key).arg(ttl_secs(ttl)).ignore();

        let mut conn = self.connection.clone();
        self.bounded(async move { pipe.query_async::<_, ()>(&mut conn).await })
            .await
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection.clone();
        self.bounded(async move {
            redis::cmd("DEL")
                .arg(keys)
                .query_async::<_, u64>(&mut conn)
                .await
        })
        .await
    }

    async fn execute_atomic(
        &self,
        script: &AtomicScript,
        keys: &[String],
        args: &[i64],
    ) -> StoreResult<Vec<i64>> {
        let compiled = self.script(script);
        let mut invocation = compiled.prepare_invoke();
        for key in keys {
            invocation.key(key);
        }
        for arg in args {
            invocation.arg(*arg);
        }

        let mut conn = self.connection.clone();
        self.bounded(async move { invocation.invoke_async::<_, Vec<i64>>(&mut conn).await })
            .await
    }
}
