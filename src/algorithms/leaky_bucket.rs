use async_trait::async_trait;

use super::{
    format_number, parse_arg, parse_bucket_reply, parse_field, Algorithm, AlgorithmContext,
    Decision, RateLimitAlgorithm, BUCKET_TTL_SECS,
};
use crate::{
    error::Result,
    store::{Script, ScriptValue, TransactionOps},
};

/// KEYS[1] bucket hash; ARGV capacity, leak rate (units/s), now (ms), ttl (s).
/// Returns `{allowed, capacity - volume}` with the second value as text.
const LEAKY_BUCKET_LUA: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local leak_rate = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])

local bucket = redis.call('HMGET', key, 'volume', 'last_leak')
local volume = tonumber(bucket[1]) or 0
local last_leak = tonumber(bucket[2]) or now

local elapsed = math.max(0, now - last_leak) / 1000
volume = math.max(0, volume - elapsed * leak_rate)

local allowed = volume < capacity
if allowed then
    volume = volume + 1
end

redis.call('HSET', key, 'volume', tostring(volume), 'last_leak', tostring(now))
redis.call('EXPIRE', key, ttl)

return {allowed and 1 or 0, tostring(capacity - volume)}
"#;

fn leaky_bucket_procedure(
    ops: &mut dyn TransactionOps,
    keys: &[String],
    args: &[String],
) -> Result<Vec<ScriptValue>> {
    let key = keys.first().map(String::as_str).unwrap_or_default();
    let capacity = parse_arg(args, 0)?;
    let leak_rate = parse_arg(args, 1)?;
    let now = parse_arg(args, 2)?;
    let ttl = parse_arg(args, 3)? as u64;

    let bucket = ops.read_hash_fields(key, &["volume", "last_leak"])?;
    let mut volume = parse_field(&bucket[0]).unwrap_or(0.0);
    let last_leak = parse_field(&bucket[1]).unwrap_or(now);

    let elapsed = (now - last_leak).max(0.0) / 1000.0;
    volume = (volume - elapsed * leak_rate).max(0.0);

    let allowed = volume < capacity;
    if allowed {
        volume += 1.0;
    }

    ops.write_hash_fields(
        key,
        &[
            ("volume", format_number(volume)),
            ("last_leak", format_number(now)),
        ],
    )?;
    ops.set_expiry(key, ttl)?;

    Ok(vec![
        ScriptValue::Int(i64::from(allowed)),
        ScriptValue::Text(format_number(capacity - volume)),
    ])
}

pub static LEAKY_BUCKET_SCRIPT: Script =
    Script::new("leaky_bucket", LEAKY_BUCKET_LUA, leaky_bucket_procedure);

/// Bucket of volume `limit` draining at `limit / window` units per second
pub struct LeakyBucket {
    ctx: AlgorithmContext,
}

impl LeakyBucket {
    pub fn new(ctx: AlgorithmContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl RateLimitAlgorithm for LeakyBucket {
    async fn check_limit(&self, identifier: &str) -> Result<Decision> {
        let options = &self.ctx.options;
        let key = options.key_for(identifier);
        let now = self.ctx.time_source.now_millis();
        let leak_rate = options.limit as f64 / options.window as f64;

        let reply = self
            .ctx
            .store
            .run_atomic_transaction(
                &LEAKY_BUCKET_SCRIPT,
                &[key],
                &[
                    options.limit.to_string(),
                    leak_rate.to_string(),
                    now.to_string(),
                    BUCKET_TTL_SECS.to_string(),
                ],
            )
            .await?;
        let (allowed, headroom) = parse_bucket_reply(&reply, LEAKY_BUCKET_SCRIPT.name())?;

        // An admitted request can push volume past capacity by less than one unit
        let remaining = (headroom.floor().max(0.0) as u64).min(options.limit);

        Ok(Decision {
            allowed,
            remaining,
            reset_time: now + options.window_millis(),
            used_tokens: options.limit - remaining,
        })
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::LeakyBucket
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        algorithms::RateLimitOptions, memory::MemoryStore, store::AtomicStore,
        utils::ManualTimeSource,
    };
    use std::{sync::Arc, time::Duration};

    const T0: i64 = 1_700_000_000_000;

    fn bucket(limit: u64, window: u64) -> (LeakyBucket, Arc<MemoryStore>, Arc<ManualTimeSource>) {
        let clock = Arc::new(ManualTimeSource::new(T0));
        let store = Arc::new(MemoryStore::with_time_source(clock.clone()));
        let ctx = AlgorithmContext {
            options: RateLimitOptions::new(Algorithm::LeakyBucket, limit, window),
            store: store.clone(),
            time_source: clock.clone(),
        };
        (LeakyBucket::new(ctx), store, clock)
    }

    #[tokio::test]
    async fn test_first_call() {
        let (bucket, store, _) = bucket(5, 10);
        let decision = bucket.check_limit("a").await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 4);
        assert_eq!(decision.used_tokens, 1);
        assert_eq!(decision.reset_time, T0 + 10_000);

        let key = "rate_limit:leaky-bucket:a";
        let fields = store.read_hash_fields(key, &["volume", "last_leak"]).await.unwrap();
        assert_eq!(fields["volume"].as_deref(), Some("1"));
        assert_eq!(store.ttl_millis(key).await, Some(3_600_000));
    }

    #[tokio::test]
    async fn test_fractional_leak_admits_when_below_capacity() {
        // Leak rate 0.3 units/s
        let (bucket, _, clock) = bucket(3, 10);
        for _ in 0..3 {
            assert!(bucket.check_limit("b").await.unwrap().allowed);
        }
        assert!(!bucket.check_limit("b").await.unwrap().allowed);

        clock.advance(Duration::from_millis(500));
        let decision = bucket.check_limit("b").await.unwrap();
        // 3 - 0.15 < 3, admitted and volume ends at 3.85
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.used_tokens, 3);
    }

    #[tokio::test]
    async fn test_bucket_drains_completely() {
        let (bucket, _, clock) = bucket(5, 10);
        for _ in 0..5 {
            bucket.check_limit("c").await.unwrap();
        }
        clock.advance(Duration::from_secs(60));
        let decision = bucket.check_limit("c").await.unwrap();
        assert_eq!(decision.remaining, 4);
    }
}
