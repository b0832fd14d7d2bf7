use async_trait::async_trait;

use super::{Algorithm, AlgorithmContext, Decision, RateLimitAlgorithm};
use crate::error::Result;

/// One sorted-set marker per admitted request, scored by its timestamp
pub struct SlidingLog {
    ctx: AlgorithmContext,
}

impl SlidingLog {
    pub fn new(ctx: AlgorithmContext) -> Self {
        Self { ctx }
    }

    fn member(now: i64, identifier: &str) -> String {
        format!("{}-{}-{:016x}", now, identifier, rand::random::<u64>())
    }
}

#[async_trait]
impl RateLimitAlgorithm for SlidingLog {
    async fn check_limit(&self, identifier: &str) -> Result<Decision> {
        let options = &self.ctx.options;
        let key = options.key_for(identifier);
        let now = self.ctx.time_source.now_millis();
        let window_start = now - options.window_millis();

        let count = self
            .ctx
            .store
            .prune_and_count(&key, 0.0, window_start as f64)
            .await?;

        let allowed = count < options.limit;
        if allowed {
            self.ctx
                .store
                .sorted_set_add_with_expiry(
                    &key,
                    now as f64,
                    &Self::member(now, identifier),
                    options.window,
                )
                .await?;
        }

        let used_tokens = count + u64::from(allowed);
        Ok(Decision {
            allowed,
            remaining: options.limit.saturating_sub(used_tokens),
            reset_time: now + options.window_millis(),
            used_tokens,
        })
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::SlidingLog
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

    fn limiter(limit: u64, window: u64) -> (SlidingLog, Arc<MemoryStore>, Arc<ManualTimeSource>) {
        let clock = Arc::new(ManualTimeSource::new(1_700_000_000_000));
        let store = Arc::new(MemoryStore::with_time_source(clock.clone()));
        let ctx = AlgorithmContext {
            options: RateLimitOptions::new(Algorithm::SlidingLog, limit, window),
            store: store.clone(),
            time_source: clock.clone(),
        };
        (SlidingLog::new(ctx), store, clock)
    }

    #[tokio::test]
    async fn test_rejection_does_not_record_marker() {
        let (limiter, store, _) = limiter(2, 10);
        limiter.check_limit("a").await.unwrap();
        limiter.check_limit("a").await.unwrap();
        let rejected = limiter.check_limit("a").await.unwrap();
        assert!(!rejected.allowed);
        assert_eq!(rejected.used_tokens, 2);
        assert_eq!(rejected.remaining, 0);
        assert_eq!(
            store.sorted_set_cardinality("rate_limit:sliding-log:a").await.unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn test_markers_slide_out() {
        let (limiter, _, clock) = limiter(2, 10);
        limiter.check_limit("b").await.unwrap();
        clock.advance(Duration::from_secs(5));
        limiter.check_limit("b").await.unwrap();
        assert!(!limiter.check_limit("b").await.unwrap().allowed);

        // First marker is now exactly at the window start and gets pruned
        clock.advance(Duration::from_secs(5));
        let decision = limiter.check_limit("b").await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.used_tokens, 2);
    }

    #[tokio::test]
    async fn test_same_millisecond_markers_are_distinct() {
        let (limiter, _, _) = limiter(5, 10);
        for expected in 1..=5 {
            let decision = limiter.check_limit("c").await.unwrap();
            assert_eq!(decision.used_tokens, expected);
        }
    }
}
