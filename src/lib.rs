//! Distributed Rate Limiting
//!
//! Per-identifier admission control over a shared store. Five algorithms
//! (fixed window, sliding window log, sliding window counter, token bucket
//! and leaky bucket) keep all of their state in the store, so any number of
//! processes can decide against the same quota.

pub mod algorithms;
pub mod config;
pub mod error;
pub mod limiter;
pub mod memory;
pub mod metrics;
pub mod middleware;
pub mod redis;
pub mod store;
pub mod utils;

// Re-export main types
pub use algorithms::{Algorithm, Decision, RateLimitOptions};
pub use error::{RateLimitError, Result};
pub use limiter::RateLimiter;
pub use memory::MemoryStore;
pub use store::AtomicStore;
