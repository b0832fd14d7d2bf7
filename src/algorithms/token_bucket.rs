use async_trait::async_trait;

use super::{
    format_number, parse_arg, parse_bucket_reply, parse_field, Algorithm, AlgorithmContext,
    Decision, RateLimitAlgorithm, BUCKET_TTL_SECS,
};
use crate::{
    error::Result,
    store::{Script, ScriptValue, TransactionOps},
};

/// KEYS[1] bucket hash; ARGV capacity, refill rate (tokens/s), now (ms), ttl (s).
/// Returns `{allowed, tokens}` with tokens as text.
const TOKEN_BUCKET_LUA: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local refill_rate = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])

local bucket = redis.call('HMGET', key, 'tokens', 'last_refill')
local tokens = tonumber(bucket[1]) or capacity
local last_refill = tonumber(bucket[2]) or now

local elapsed = math.max(0, now - last_refill) / 1000
local tokens_to_add = math.floor(elapsed * refill_rate)
tokens = math.min(capacity, tokens + tokens_to_add)

local allowed = tokens > 0
if allowed then
    tokens = tokens - 1
end

redis.call('HSET', key, 'tokens', tostring(tokens), 'last_refill', tostring(now))
redis.call('EXPIRE', key, ttl)

return {allowed and 1 or 0, tostring(tokens)}
"#;

fn token_bucket_procedure(
    ops: &mut dyn TransactionOps,
    keys: &[String],
    args: &[String],
) -> Result<Vec<ScriptValue>> {
    let key = keys.first().map(String::as_str).unwrap_or_default();
    let capacity = parse_arg(args, 0)?;
    let refill_rate = parse_arg(args, 1)?;
    let now = parse_arg(args, 2)?;
    let ttl = parse_arg(args, 3)? as u64;

    let bucket = ops.read_hash_fields(key, &["tokens", "last_refill"])?;
    let mut tokens = parse_field(&bucket[0]).unwrap_or(capacity);
    let last_refill = parse_field(&bucket[1]).unwrap_or(now);

    let elapsed = (now - last_refill).max(0.0) / 1000.0;
    let tokens_to_add = (elapsed * refill_rate).floor();
    tokens = capacity.min(tokens + tokens_to_add);

    let allowed = tokens > 0.0;
    if allowed {
        tokens -= 1.0;
    }

    ops.write_hash_fields(
        key,
        &[
            ("tokens", format_number(tokens)),
            ("last_refill", format_number(now)),
        ],
    )?;
    ops.set_expiry(key, ttl)?;

    Ok(vec![
        ScriptValue::Int(i64::from(allowed)),
        ScriptValue::Text(format_number(tokens)),
    ])
}

pub static TOKEN_BUCKET_SCRIPT: Script =
    Script::new("token_bucket", TOKEN_BUCKET_LUA, token_bucket_procedure);

/// Bucket of `limit` tokens refilled at `limit / window` tokens per second
pub struct TokenBucket {
    ctx: AlgorithmContext,
}

impl TokenBucket {
    pub fn new(ctx: AlgorithmContext) -> Self {
        Self { ctx }
    }

    fn refill_rate(&self) -> f64 {
        self.ctx.options.limit as f64 / self.ctx.options.window as f64
    }
}

#[async_trait]
impl RateLimitAlgorithm for TokenBucket {
    async fn check_limit(&self, identifier: &str) -> Result<Decision> {
        let options = &self.ctx.options;
        let key = options.key_for(identifier);
        let now = self.ctx.time_source.now_millis();
        let refill_rate = self.refill_rate();

        let reply = self
            .ctx
            .store
            .run_atomic_transaction(
                &TOKEN_BUCKET_SCRIPT,
                &[key],
                &[
                    options.limit.to_string(),
                    refill_rate.to_string(),
                    now.to_string(),
                    BUCKET_TTL_SECS.to_string(),
                ],
            )
            .await?;
        let (allowed, tokens) = parse_bucket_reply(&reply, TOKEN_BUCKET_SCRIPT.name())?;

        let remaining = (tokens.floor().max(0.0) as u64).min(options.limit);
        let missing = options.limit - remaining;
        let refill_ms = (missing as f64 / refill_rate) * 1000.0;

        Ok(Decision {
            allowed,
            remaining,
            reset_time: now + refill_ms.round() as i64,
            used_tokens: missing,
        })
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::TokenBucket
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

    fn bucket(limit: u64, window: u64) -> (TokenBucket, Arc<MemoryStore>, Arc<ManualTimeSource>) {
        let clock = Arc::new(ManualTimeSource::new(T0));
        let store = Arc::new(MemoryStore::with_time_source(clock.clone()));
        let ctx = AlgorithmContext {
            options: RateLimitOptions::new(Algorithm::TokenBucket, limit, window),
            store: store.clone(),
            time_source: clock.clone(),
        };
        (TokenBucket::new(ctx), store, clock)
    }

    #[tokio::test]
    async fn test_first_call_reports_refill_time() {
        let (bucket, _, _) = bucket(5, 10);
        let decision = bucket.check_limit("a").await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 4);
        assert_eq!(decision.used_tokens, 1);
        // One missing token at 0.5 tokens/s
        assert_eq!(decision.reset_time, T0 + 2_000);
    }

    #[tokio::test]
    async fn test_state_persisted_with_fixed_ttl() {
        let (bucket, store, _) = bucket(5, 10);
        bucket.check_limit("a").await.unwrap();

        let key = "rate_limit:token-bucket:a";
        let fields = store.read_hash_fields(key, &["tokens", "last_refill"]).await.unwrap();
        assert_eq!(fields["tokens"].as_deref(), Some("4"));
        assert_eq!(fields["last_refill"], Some(T0.to_string()));
        assert_eq!(store.ttl_millis(key).await, Some(3_600_000));
    }

    #[tokio::test]
    async fn test_refill_is_capped_at_capacity() {
        let (bucket, _, clock) = bucket(5, 10);
        for _ in 0..5 {
            bucket.check_limit("b").await.unwrap();
        }
        clock.advance(Duration::from_secs(600));
        let decision = bucket.check_limit("b").await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 4);
    }

    #[tokio::test]
    async fn test_partial_refill_rounds_down() {
        let (bucket, _, clock) = bucket(5, 10);
        for _ in 0..5 {
            bucket.check_limit("c").await.unwrap();
        }
        clock.advance(Duration::from_millis(1_999));
        assert!(!bucket.check_limit("c").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_clock_skew_does_not_drain_tokens() {
        let (bucket, _, clock) = bucket(5, 10);
        bucket.check_limit("d").await.unwrap();
        clock.set(T0 - 60_000);
        let decision = bucket.check_limit("d").await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 3);
    }

    #[tokio::test]
    async fn test_malformed_state_is_treated_as_fresh() {
        let (bucket, store, _) = bucket(5, 10);
        store
            .write_hash_fields("rate_limit:token-bucket:e", &[("tokens", "garbage".to_string())])
            .await
            .unwrap();
        let decision = bucket.check_limit("e").await.unwrap();
        assert_eq!(decision.remaining, 4);
    }
}
