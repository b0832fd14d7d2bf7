use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Source of "now" for decisions and key expiry, in epoch milliseconds
pub trait TimeSource: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// Wall clock time source
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Manually driven clock for simulated time
#[derive(Debug)]
pub struct ManualTimeSource {
    now: AtomicI64,
}

impl ManualTimeSource {
    pub fn new(start_millis: i64) -> Self {
        Self {
            now: AtomicI64::new(start_millis),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }

    pub fn set(&self, millis: i64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Build the base store key for an identifier under one algorithm
pub fn generate_key(prefix: Option<&str>, algorithm: &str, identifier: &str) -> String {
    match prefix {
        Some(p) if !p.is_empty() => format!("{}:rate_limit:{}:{}", p, algorithm, identifier),
        _ => format!("rate_limit:{}:{}", algorithm, identifier),
    }
}

/// Append a window index to a base key
pub fn window_key(base: &str, window_index: i64) -> String {
    format!("{}:{}", base, window_index)
}

/// Whole seconds a rejected caller should wait, never negative
pub fn retry_after_secs(reset_time_millis: i64, now_millis: i64) -> u64 {
    let wait = reset_time_millis - now_millis;
    if wait <= 0 {
        0
    } else {
        ((wait + 999) / 1000) as u64
    }
}
