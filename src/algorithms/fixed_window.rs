use async_trait::async_trait;

use super::{Algorithm, AlgorithmContext, Decision, RateLimitAlgorithm};
use crate::{error::Result, utils::window_key};

/// Counter per aligned window.
///
/// The counter is incremented on every call, including rejected ones, so
/// `used_tokens` keeps growing past `limit` until the window rotates.
pub struct FixedWindow {
    ctx: AlgorithmContext,
}

impl FixedWindow {
    pub fn new(ctx: AlgorithmContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl RateLimitAlgorithm for FixedWindow {
    async fn check_limit(&self, identifier: &str) -> Result<Decision> {
        let options = &self.ctx.options;
        let now = self.ctx.time_source.now_millis();

        // Window start in seconds
        let window_start = now.div_euclid(options.window_millis()) * options.window as i64;
        let key = window_key(&options.key_for(identifier), window_start);

        let count = self
            .ctx
            .store
            .increment_with_expiry(&key, options.window)
            .await?
            .max(0) as u64;

        // Inclusive: the post-increment count includes this request
        Ok(Decision {
            allowed: count <= options.limit,
            remaining: options.limit.saturating_sub(count),
            reset_time: (window_start + options.window as i64) * 1000,
            used_tokens: count,
        })
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::FixedWindow
    }
}
