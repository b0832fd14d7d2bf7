use async_trait::async_trait;
use redis::{aio::ConnectionManager, RedisResult};
use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::{
    error::{RateLimitError, Result},
    store::{AtomicStore, Script, ScriptValue},
};

/// Redis client configuration
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub connection_timeout: Option<Duration>,
    pub command_timeout: Option<Duration>,
    pub enable_pipelining: bool,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            connection_timeout: Some(Duration::from_secs(5)),
            command_timeout: Some(Duration::from_secs(1)),
            enable_pipelining: true,
        }
    }
}

/// Lua scripts hashed once per script name
#[derive(Clone, Default)]
struct ScriptCache {
    scripts: Arc<RwLock<HashMap<&'static str, Arc<redis::Script>>>>,
}

impl ScriptCache {
    async fn get(&self, script: &Script) -> Arc<redis::Script> {
        if let Some(lua) = self.scripts.read().await.get(script.name()) {
            return lua.clone();
        }
        self.scripts
            .write()
            .await
            .entry(script.name())
            .or_insert_with(|| Arc::new(redis::Script::new(script.source())))
            .clone()
    }
}

/// Shared store backed by Redis
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    config: RedisConfig,
    scripts: ScriptCache,
}

impl RedisStore {
    /// Connect to Redis and verify the connection with PING
    pub async fn connect(config: RedisConfig) -> Result<Self> {
        info!("Creating Redis client for URL: {}", config.url);

        let client = redis::Client::open(config.url.clone()).map_err(|e| {
            warn!("Failed to create Redis client: {}", e);
            RateLimitError::from(e)
        })?;

        let connect_timeout = config.connection_timeout.unwrap_or(Duration::from_secs(10));
        let connection = match tokio::time::timeout(connect_timeout, client.get_connection_manager()).await {
            Ok(Ok(conn)) => {
                info!("Connection manager established successfully");
                conn
            }
            Ok(Err(e)) => {
                warn!("Failed to create connection manager: {}", e);
                return Err(e.into());
            }
            Err(_) => {
                warn!("Timeout while creating connection manager ({}s)", connect_timeout.as_secs());
                return Err(RateLimitError::StoreUnavailable(
                    "Timeout while creating Redis connection manager".to_string(),
                ));
            }
        };

        let store = Self {
            connection,
            config,
            scripts: ScriptCache::default(),
        };
        store.health_check().await?;

        info!("Redis store initialized successfully");
        Ok(store)
    }

    fn command_timeout(&self) -> Duration {
        self.config.command_timeout.unwrap_or(Duration::from_secs(5))
    }

    /// Await one round trip, bounded by the command timeout
    async fn round_trip<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.command_timeout(), fut).await {
            Ok(result) => result.map_err(RateLimitError::from),
            Err(_) => Err(RateLimitError::StoreUnavailable(format!(
                "Timeout during Redis {} ({}ms)",
                operation,
                self.command_timeout().as_millis()
            ))),
        }
    }
}

/// Convert a transaction reply into the store-neutral shape
pub(crate) fn script_reply(value: redis::Value) -> Result<Vec<ScriptValue>> {
    match value {
        redis::Value::Bulk(items) => items.into_iter().map(script_value).collect(),
        other => Err(RateLimitError::StoreProtocol(format!(
            "Expected array reply from script, got {:?}",
            other
        ))),
    }
}

fn script_value(value: redis::Value) -> Result<ScriptValue> {
    match value {
        redis::Value::Nil => Ok(ScriptValue::Nil),
        redis::Value::Int(v) => Ok(ScriptValue::Int(v)),
        redis::Value::Data(bytes) => String::from_utf8(bytes)
            .map(ScriptValue::Text)
            .map_err(|_| RateLimitError::StoreProtocol("Script returned non UTF-8 data".to_string())),
        redis::Value::Status(s) => Ok(ScriptValue::Text(s)),
        redis::Value::Okay => Ok(ScriptValue::Text("OK".to_string())),
        redis::Value::Bulk(_) => Err(RateLimitError::StoreProtocol(
            "Nested array in script reply".to_string(),
        )),
    }
}

#[async_trait]
impl AtomicStore for RedisStore {
    async fn increment(&self, key: &str) -> Result<i64> {
        let mut conn = self.connection.clone();
        self.round_trip(
            "INCR",
            redis::cmd("INCR").arg(key).query_async::<_, i64>(&mut conn),
        )
        .await
    }

    async fn set_expiry(&self, key: &str, seconds: u64) -> Result<()> {
        let mut conn = self.connection.clone();
        self.round_trip(
            "EXPIRE",
            redis::cmd("EXPIRE").arg(key).arg(seconds).query_async::<_, ()>(&mut conn),
        )
        .await
    }

    async fn read_counters(&self, keys: &[String]) -> Result<Vec<i64>> {
        if keys.is_empty() {
            return Ok(vec![]);
        }
        let mut conn = self.connection.clone();
        let values: Vec<Option<i64>> = self
            .round_trip(
                "MGET",
                redis::cmd("MGET").arg(keys).query_async::<_, Vec<Option<i64>>>(&mut conn),
            )
            .await?;
        Ok(values.into_iter().map(|v| v.unwrap_or(0)).collect())
    }

    async fn read_hash_fields(
        &self,
        key: &str,
        fields: &[&str],
    ) -> Result<HashMap<String, Option<String>>> {
        let mut conn = self.connection.clone();
        let values: Vec<Option<String>> = self
            .round_trip(
                "HMGET",
                redis::cmd("HMGET")
                    .arg(key)
                    .arg(fields)
                    .query_async::<_, Vec<Option<String>>>(&mut conn),
            )
            .await?;
        if values.len() != fields.len() {
            return Err(RateLimitError::StoreProtocol(format!(
                "HMGET returned {} values for {} fields",
                values.len(),
                fields.len()
            )));
        }
        Ok(fields.iter().map(|f| f.to_string()).zip(values).collect())
    }

    async fn write_hash_fields(&self, key: &str, fields: &[(&str, String)]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection.clone();
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in fields {
            cmd.arg(*field).arg(value);
        }
        self.round_trip("HSET", cmd.query_async::<_, ()>(&mut conn)).await
    }

    async fn sorted_set_remove_by_score_range(
        &self,
        key: &str,
        min_score: f64,
        max_score: f64,
    ) -> Result<()> {
        let mut conn = self.connection.clone();
        self.round_trip(
            "ZREMRANGEBYSCORE",
            redis::cmd("ZREMRANGEBYSCORE")
                .arg(key)
                .arg(min_score)
                .arg(max_score)
                .query_async::<_, ()>(&mut conn),
        )
        .await
    }

    async fn sorted_set_cardinality(&self, key: &str) -> Result<u64> {
        let mut conn = self.connection.clone();
        self.round_trip(
            "ZCARD",
            redis::cmd("ZCARD").arg(key).query_async::<_, u64>(&mut conn),
        )
        .await
    }

    async fn sorted_set_add(&self, key: &str, score: f64, member: &str) -> Result<()> {
        let mut conn = self.connection.clone();
        self.round_trip(
            "ZADD",
            redis::cmd("ZADD")
                .arg(key)
                .arg(score)
                .arg(member)
                .query_async::<_, ()>(&mut conn),
        )
        .await
    }

    async fn run_atomic_transaction(
        &self,
        script: &Script,
        keys: &[String],
        args: &[String],
    ) -> Result<Vec<ScriptValue>> {
        let mut conn = self.connection.clone();
        let lua = self.scripts.get(script).await;
        let mut invocation = lua.prepare_invoke();
        for key in keys {
            invocation.key(key);
        }
        for arg in args {
            invocation.arg(arg);
        }

        let reply = self
            .round_trip(
                script.name(),
                invocation.invoke_async::<_, redis::Value>(&mut conn),
            )
            .await?;
        script_reply(reply)
    }

    async fn health_check(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        self.round_trip("PING", redis::cmd("PING").query_async::<_, ()>(&mut conn))
            .await
    }

    async fn increment_with_expiry(&self, key: &str, seconds: u64) -> Result<i64> {
        if !self.config.enable_pipelining {
            let count = self.increment(key).await?;
            self.set_expiry(key, seconds).await?;
            return Ok(count);
        }

        let mut conn = self.connection.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .incr(key, 1)
            .expire(key, seconds as i64)
            .ignore();
        let (count,) = self
            .round_trip("INCR/EXPIRE", pipe.query_async::<_, (i64,)>(&mut conn))
            .await?;
        Ok(count)
    }

    async fn prune_and_count(&self, key: &str, min_score: f64, max_score: f64) -> Result<u64> {
        if !self.config.enable_pipelining {
            self.sorted_set_remove_by_score_range(key, min_score, max_score)
                .await?;
            return self.sorted_set_cardinality(key).await;
        }

        let mut conn = self.connection.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .zrembyscore(key, min_score, max_score)
            .ignore()
            .zcard(key);
        let (count,) = self
            .round_trip("ZREMRANGEBYSCORE/ZCARD", pipe.query_async::<_, (u64,)>(&mut conn))
            .await?;
        Ok(count)
    }

    async fn sorted_set_add_with_expiry(
        &self,
        key: &str,
        score: f64,
        member: &str,
        seconds: u64,
    ) -> Result<()> {
        if !self.config.enable_pipelining {
            self.sorted_set_add(key, score, member).await?;
            return self.set_expiry(key, seconds).await;
        }

        let mut conn = self.connection.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .zadd(key, member, score)
            .ignore()
            .expire(key, seconds as i64)
            .ignore();
        self.round_trip("ZADD/EXPIRE", pipe.query_async::<_, ()>(&mut conn))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        algorithms::{Algorithm, RateLimitOptions, LEAKY_BUCKET_SCRIPT, TOKEN_BUCKET_SCRIPT},
        limiter::RateLimiter,
    };

    #[test]
    fn test_redis_config() {
        let config = RedisConfig::default();
        assert_eq!(config.url, "redis://localhost:6379");
        assert!(config.enable_pipelining);
        assert_eq!(config.command_timeout, Some(Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_script_cache_hashes_once() {
        let cache = ScriptCache::default();
        let first = cache.get(&TOKEN_BUCKET_SCRIPT).await;
        let again = cache.get(&TOKEN_BUCKET_SCRIPT).await;
        let leaky = cache.get(&LEAKY_BUCKET_SCRIPT).await;

        assert!(Arc::ptr_eq(&first, &again));
        assert_ne!(first.get_hash(), leaky.get_hash());
        assert_eq!(cache.scripts.read().await.len(), 2);
    }

    #[test]
    fn test_script_reply_conversion() {
        let reply = redis::Value::Bulk(vec![
            redis::Value::Int(1),
            redis::Value::Data(b"2.5".to_vec()),
        ]);
        assert_eq!(
            script_reply(reply).unwrap(),
            vec![ScriptValue::Int(1), ScriptValue::Text("2.5".to_string())]
        );
    }

    #[test]
    fn test_script_reply_requires_array() {
        let err = script_reply(redis::Value::Int(1)).unwrap_err();
        assert!(matches!(err, RateLimitError::StoreProtocol(_)));

        let nested = redis::Value::Bulk(vec![redis::Value::Bulk(vec![])]);
        assert!(matches!(script_reply(nested), Err(RateLimitError::StoreProtocol(_))));
    }

    #[tokio::test]
    async fn test_connect_to_unreachable_redis_fails() {
        let config = RedisConfig {
            url: "redis://127.0.0.1:1".to_string(),
            connection_timeout: Some(Duration::from_millis(500)),
            ..Default::default()
        };
        let err = RedisStore::connect(config).await.err().unwrap();
        assert!(err.is_store_error());
    }

    #[tokio::test]
    #[ignore = "requires a running Redis instance"]
    async fn test_all_algorithms_against_redis() {
        let store = Arc::new(RedisStore::connect(RedisConfig::default()).await.unwrap());
        let identifier = format!("redis-test-{}", rand::random::<u32>());

        for algorithm in Algorithm::ALL {
            let limiter =
                RateLimiter::new(RateLimitOptions::new(algorithm, 3, 30), store.clone()).unwrap();
            for _ in 0..3 {
                assert!(limiter.check_limit(&identifier).await.unwrap().allowed, "{}", algorithm);
            }
            assert!(!limiter.check_limit(&identifier).await.unwrap().allowed, "{}", algorithm);
        }
    }
}
