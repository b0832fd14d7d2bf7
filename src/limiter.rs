use std::sync::Arc;
use tracing::debug;

use crate::{
    algorithms::{
        Algorithm, AlgorithmContext, Decision, FixedWindow, LeakyBucket, RateLimitAlgorithm,
        RateLimitOptions, SlidingLog, SlidingWindowCounter, TokenBucket,
    },
    error::Result,
    store::AtomicStore,
    utils::{SystemTimeSource, TimeSource},
};

/// Front door of the engine: owns exactly one strategy and forwards to it
pub struct RateLimiter {
    options: RateLimitOptions,
    strategy: Box<dyn RateLimitAlgorithm>,
    store: Arc<dyn AtomicStore>,
}

impl RateLimiter {
    /// Create a rate limiter over the given store using the wall clock
    pub fn new(options: RateLimitOptions, store: Arc<dyn AtomicStore>) -> Result<Self> {
        Self::with_time_source(options, store, Arc::new(SystemTimeSource))
    }

    /// Create a rate limiter with an explicit clock
    pub fn with_time_source(
        options: RateLimitOptions,
        store: Arc<dyn AtomicStore>,
        time_source: Arc<dyn TimeSource>,
    ) -> Result<Self> {
        options.validate()?;

        let ctx = AlgorithmContext {
            options: options.clone(),
            store: store.clone(),
            time_source,
        };
        let strategy: Box<dyn RateLimitAlgorithm> = match options.algorithm {
            Algorithm::FixedWindow => Box::new(FixedWindow::new(ctx)),
            Algorithm::SlidingLog => Box::new(SlidingLog::new(ctx)),
            Algorithm::SlidingWindow => Box::new(SlidingWindowCounter::new(ctx)),
            Algorithm::TokenBucket => Box::new(TokenBucket::new(ctx)),
            Algorithm::LeakyBucket => Box::new(LeakyBucket::new(ctx)),
        };

        Ok(Self {
            options,
            strategy,
            store,
        })
    }

    /// Create a rate limiter from an algorithm name as found in configuration
    pub fn from_name(
        algorithm: &str,
        limit: u64,
        window: u64,
        store: Arc<dyn AtomicStore>,
    ) -> Result<Self> {
        let options = RateLimitOptions::new(algorithm.parse()?, limit, window);
        Self::new(options, store)
    }

    /// Decide whether a request from `identifier` is admitted
    pub async fn check_limit(&self, identifier: &str) -> Result<Decision> {
        let decision = self.strategy.check_limit(identifier).await?;
        debug!(
            algorithm = %self.strategy.algorithm(),
            identifier,
            allowed = decision.allowed,
            remaining = decision.remaining,
            used = decision.used_tokens,
            "rate limit decision"
        );
        Ok(decision)
    }

    pub fn algorithm(&self) -> Algorithm {
        self.strategy.algorithm()
    }

    pub fn options(&self) -> &RateLimitOptions {
        &self.options
    }

    /// Health check for the backing store
    pub async fn health_check(&self) -> Result<()> {
        self.store.health_check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{algorithms::MAX_WINDOW_SECS, error::RateLimitError, memory::MemoryStore};

    fn store() -> Arc<dyn AtomicStore> {
        Arc::new(MemoryStore::new())
    }

    #[tokio::test]
    async fn test_limiter_selects_configured_strategy() {
        for algorithm in Algorithm::ALL {
            let limiter =
                RateLimiter::new(RateLimitOptions::new(algorithm, 10, 30), store()).unwrap();
            assert_eq!(limiter.algorithm(), algorithm);
        }
    }

    #[tokio::test]
    async fn test_unsupported_algorithm_name() {
        let result = RateLimiter::from_name("gcra", 10, 30, store());
        match result {
            Err(RateLimitError::UnsupportedAlgorithm(name)) => assert_eq!(name, "gcra"),
            _ => panic!("Expected unsupported algorithm error"),
        }
    }

    #[tokio::test]
    async fn test_invalid_limits_rejected() {
        let result = RateLimiter::from_name("token-bucket", 0, 30, store());
        assert!(matches!(result, Err(RateLimitError::Config(_))));

        let result = RateLimiter::from_name("token-bucket", 10, 0, store());
        assert!(matches!(result, Err(RateLimitError::Config(_))));

        let result = RateLimiter::from_name("fixed-window", 10, u64::MAX / 100, store());
        assert!(matches!(result, Err(RateLimitError::Config(_))));
    }

    #[tokio::test]
    async fn test_widest_window_decides() {
        for algorithm in Algorithm::ALL {
            let options = RateLimitOptions::new(algorithm, 10, MAX_WINDOW_SECS);
            let limiter = RateLimiter::new(options, store()).unwrap();
            let decision = limiter.check_limit("x").await.unwrap();
            assert!(decision.allowed, "{}", algorithm);
            assert!(decision.reset_time > 0, "{}", algorithm);
        }
    }

    #[tokio::test]
    async fn test_limiter_health_check() {
        let limiter = RateLimiter::from_name("fixed-window", 10, 30, store()).unwrap();
        assert!(limiter.health_check().await.is_ok());
    }
}
