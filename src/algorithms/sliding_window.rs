use async_trait::async_trait;

use super::{Algorithm, AlgorithmContext, Decision, RateLimitAlgorithm};
use crate::{error::Result, utils::window_key};

/// Weighted blend of the previous and current window counters
pub struct SlidingWindowCounter {
    ctx: AlgorithmContext,
}

impl SlidingWindowCounter {
    pub fn new(ctx: AlgorithmContext) -> Self {
        Self { ctx }
    }
}

/// `floor(previous * (1 - time_into_window) + current)`
fn estimate_usage(previous: i64, current: i64, time_into_window: f64) -> u64 {
    let estimate = previous.max(0) as f64 * (1.0 - time_into_window) + current.max(0) as f64;
    estimate.floor() as u64
}

#[async_trait]
impl RateLimitAlgorithm for SlidingWindowCounter {
    async fn check_limit(&self, identifier: &str) -> Result<Decision> {
        let options = &self.ctx.options;
        let base = options.key_for(identifier);
        let now = self.ctx.time_source.now_millis();
        let window_ms = options.window_millis();

        let current_window = now.div_euclid(window_ms);
        let current_key = window_key(&base, current_window);
        let previous_key = window_key(&base, current_window - 1);

        let counts = self
            .ctx
            .store
            .read_counters(&[current_key.clone(), previous_key])
            .await?;
        let (current, previous) = match counts.as_slice() {
            [current, previous] => (*current, *previous),
            other => {
                return Err(crate::error::RateLimitError::StoreProtocol(format!(
                    "Expected 2 window counters, got {}",
                    other.len()
                )))
            }
        };

        let time_into_window = now.rem_euclid(window_ms) as f64 / window_ms as f64;
        let estimated_usage = estimate_usage(previous, current, time_into_window);

        let allowed = estimated_usage < options.limit;
        if allowed {
            // Kept for two windows so it can serve as the previous counter
            self.ctx
                .store
                .increment_with_expiry(&current_key, options.window * 2)
                .await?;
        }

        let used_tokens = estimated_usage + u64::from(allowed);
        Ok(Decision {
            allowed,
            remaining: options.limit.saturating_sub(used_tokens),
            reset_time: (current_window + 1) * window_ms,
            used_tokens,
        })
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::SlidingWindow
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{algorithms::RateLimitOptions, memory::MemoryStore, utils::ManualTimeSource};
    use std::{sync::Arc, time::Duration};

    const T0: i64 = 1_700_000_010_000;

    #[test]
    fn test_estimate_usage() {
        assert_eq!(estimate_usage(10, 0, 0.0), 10);
        assert_eq!(estimate_usage(10, 2, 0.5), 7);
        assert_eq!(estimate_usage(10, 3, 0.999), 3);
    }

    #[tokio::test]
    async fn test_current_window_ttl_covers_next_window() {
        let clock = Arc::new(ManualTimeSource::new(T0));
        let store = Arc::new(MemoryStore::with_time_source(clock.clone()));
        let limiter = SlidingWindowCounter::new(AlgorithmContext {
            options: RateLimitOptions::new(Algorithm::SlidingWindow, 10, 30),
            store: store.clone(),
            time_source: clock.clone(),
        });

        let decision = limiter.check_limit("dave").await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.used_tokens, 1);
        assert_eq!(decision.remaining, 9);
        assert_eq!(decision.reset_time, T0 + 30_000);

        let key = format!("rate_limit:sliding-window:dave:{}", T0 / 30_000);
        assert_eq!(store.ttl_millis(&key).await, Some(60_000));

        clock.advance(Duration::from_secs(45));
        let decision = limiter.check_limit("dave").await.unwrap();
        // 1 * (1 - 0.5) + 0 floors to 0
        assert_eq!(decision.used_tokens, 1);
    }

    #[tokio::test]
    async fn test_rejection_leaves_counter_untouched() {
        let clock = Arc::new(ManualTimeSource::new(T0));
        let store = Arc::new(MemoryStore::with_time_source(clock.clone()));
        let limiter = SlidingWindowCounter::new(AlgorithmContext {
            options: RateLimitOptions::new(Algorithm::SlidingWindow, 2, 30),
            store: store.clone(),
            time_source: clock,
        });

        limiter.check_limit("erin").await.unwrap();
        limiter.check_limit("erin").await.unwrap();
        let rejected = limiter.check_limit("erin").await.unwrap();
        assert!(!rejected.allowed);
        assert_eq!(rejected.used_tokens, 2);

        use crate::store::AtomicStore;
        let key = format!("rate_limit:sliding-window:erin:{}", T0 / 30_000);
        assert_eq!(store.read_counters(&[key]).await.unwrap(), vec![2]);
    }
}
