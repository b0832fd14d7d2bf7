//! Admission control algorithms.
//!
//! Every strategy keeps all of its state in the shared store; nothing
//! survives in-process between two calls to `check_limit`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, sync::Arc};

use crate::{
    error::{RateLimitError, Result},
    store::{AtomicStore, ScriptValue},
    utils::{generate_key, TimeSource},
};

mod fixed_window;
mod leaky_bucket;
mod sliding_log;
mod sliding_window;
mod token_bucket;

pub use fixed_window::FixedWindow;
pub use leaky_bucket::{LeakyBucket, LEAKY_BUCKET_SCRIPT};
pub use sliding_log::SlidingLog;
pub use sliding_window::SlidingWindowCounter;
pub use token_bucket::{TokenBucket, TOKEN_BUCKET_SCRIPT};

/// Retention applied to bucket state, independent of the window
/// Largest window whose doubled length in milliseconds fits an `i64`
pub const MAX_WINDOW_SECS: u64 = (i64::MAX / 2000) as u64;

pub const BUCKET_TTL_SECS: u64 = 3600;

/// The five supported algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Algorithm {
    FixedWindow,
    SlidingLog,
    SlidingWindow,
    TokenBucket,
    LeakyBucket,
}

impl Algorithm {
    pub const ALL: [Algorithm; 5] = [
        Algorithm::FixedWindow,
        Algorithm::SlidingLog,
        Algorithm::SlidingWindow,
        Algorithm::TokenBucket,
        Algorithm::LeakyBucket,
    ];

    /// Name used in configuration and in store keys
    pub fn name(self) -> &'static str {
        match self {
            Algorithm::FixedWindow => "fixed-window",
            Algorithm::SlidingLog => "sliding-log",
            Algorithm::SlidingWindow => "sliding-window",
            Algorithm::TokenBucket => "token-bucket",
            Algorithm::LeakyBucket => "leaky-bucket",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Algorithm {
    type Err = RateLimitError;

    fn from_str(s: &str) -> Result<Self> {
        Algorithm::ALL
            .into_iter()
            .find(|a| a.name() == s)
            .ok_or_else(|| RateLimitError::UnsupportedAlgorithm(s.to_string()))
    }
}

/// Immutable configuration of one limiter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitOptions {
    pub algorithm: Algorithm,
    /// Maximum admitted requests per window
    pub limit: u64,
    /// Window length in seconds
    pub window: u64,
    pub key_prefix: Option<String>,
}

impl RateLimitOptions {
    pub fn new(algorithm: Algorithm, limit: u64, window: u64) -> Self {
        Self {
            algorithm,
            limit,
            window,
            key_prefix: None,
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 {
            return Err(RateLimitError::Config("limit must be positive".to_string()));
        }
        if self.window == 0 {
            return Err(RateLimitError::Config("window must be positive".to_string()));
        }
        // Counter keys live for two windows, in milliseconds
        if self.window > MAX_WINDOW_SECS {
            return Err(RateLimitError::Config(format!(
                "window must be at most {} seconds",
                MAX_WINDOW_SECS
            )));
        }
        Ok(())
    }

    pub fn window_millis(&self) -> i64 {
        (self.window as i64) * 1000
    }

    /// Base store key for an identifier under this configuration
    pub fn key_for(&self, identifier: &str) -> String {
        generate_key(self.key_prefix.as_deref(), self.algorithm.name(), identifier)
    }
}

/// Outcome of one admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub allowed: bool,
    /// Admissible requests left in the current accounting period
    pub remaining: u64,
    /// Epoch milliseconds when quota next becomes easier
    pub reset_time: i64,
    /// Quota consumed in the current accounting period
    pub used_tokens: u64,
}

impl Decision {
    /// Seconds until `reset_time`, rounded up
    pub fn retry_after_secs(&self, now_millis: i64) -> u64 {
        crate::utils::retry_after_secs(self.reset_time, now_millis)
    }
}

/// Common contract of every strategy
#[async_trait]
pub trait RateLimitAlgorithm: Send + Sync {
    async fn check_limit(&self, identifier: &str) -> Result<Decision>;

    fn algorithm(&self) -> Algorithm;
}

/// Shared collaborators handed to each strategy
#[derive(Clone)]
pub struct AlgorithmContext {
    pub options: RateLimitOptions,
    pub store: Arc<dyn AtomicStore>,
    pub time_source: Arc<dyn TimeSource>,
}

/// Parse the `[allowed, number]` reply every bucket transaction returns
pub(crate) fn parse_bucket_reply(reply: &[ScriptValue], script: &str) -> Result<(bool, f64)> {
    if reply.len() < 2 {
        return Err(RateLimitError::StoreProtocol(format!(
            "Invalid response from {} transaction: expected 2 values, got {}",
            script,
            reply.len()
        )));
    }
    Ok((reply[0].as_bool()?, reply[1].as_f64()?))
}

/// Parse a numeric transaction argument
pub(crate) fn parse_arg(args: &[String], index: usize) -> Result<f64> {
    args.get(index)
        .and_then(|a| a.parse::<f64>().ok())
        .ok_or_else(|| {
            RateLimitError::StoreProtocol(format!("Missing or non-numeric argument {}", index))
        })
}

/// Parse an optional stored hash field, treating garbage as absent
pub(crate) fn parse_field(value: &Option<String>) -> Option<f64> {
    value.as_deref().and_then(|v| v.parse::<f64>().ok())
}

/// Format a number the way the Lua side stores it
pub(crate) fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}
