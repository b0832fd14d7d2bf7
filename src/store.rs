//! Capability surface the rate limiting algorithms need from the shared store.
//!
//! Single operations are individually atomic. Batched helpers such as
//! [`AtomicStore::increment_with_expiry`] save round trips but give no
//! isolation between their steps. Only [`AtomicStore::run_atomic_transaction`]
//! runs a multi-step read-modify-write as one indivisible unit.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::{RateLimitError, Result};

/// A single value in a transaction reply
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptValue {
    Nil,
    Int(i64),
    Text(String),
}

impl ScriptValue {
    /// Read the value as a number, accepting integers and numeric text
    pub fn as_f64(&self) -> Result<f64> {
        match self {
            ScriptValue::Int(v) => Ok(*v as f64),
            ScriptValue::Text(s) => s.trim().parse::<f64>().map_err(|_| {
                RateLimitError::StoreProtocol(format!("Non-numeric transaction value: {:?}", s))
            }),
            ScriptValue::Nil => Err(RateLimitError::StoreProtocol(
                "Unexpected nil in transaction reply".to_string(),
            )),
        }
    }

    pub fn as_bool(&self) -> Result<bool> {
        match self {
            ScriptValue::Int(v) => Ok(*v != 0),
            other => Err(RateLimitError::StoreProtocol(format!(
                "Expected integer flag in transaction reply, got {:?}",
                other
            ))),
        }
    }
}

/// Hash and expiry operations available inside a native transaction
pub trait TransactionOps {
    fn read_hash_fields(&mut self, key: &str, fields: &[&str]) -> Result<Vec<Option<String>>>;

    fn write_hash_fields(&mut self, key: &str, fields: &[(&str, String)]) -> Result<()>;

    fn set_expiry(&mut self, key: &str, seconds: u64) -> Result<()>;
}

/// Native form of a transaction, for stores without a script engine
pub type NativeProcedure =
    fn(&mut dyn TransactionOps, &[String], &[String]) -> Result<Vec<ScriptValue>>;

/// A multi-step transaction the store must run atomically.
///
/// The same logic is carried twice: as a Lua body for stores with a Lua
/// engine, and as a native procedure for stores that execute it in-process
/// under their own lock. Both forms must produce the same reply shape.
pub struct Script {
    name: &'static str,
    source: &'static str,
    procedure: NativeProcedure,
}

impl Script {
    pub const fn new(name: &'static str, source: &'static str, procedure: NativeProcedure) -> Self {
        Self {
            name,
            source,
            procedure,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn source(&self) -> &'static str {
        self.source
    }

    pub fn procedure(&self) -> NativeProcedure {
        self.procedure
    }
}

impl std::fmt::Debug for Script {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Script").field("name", &self.name).finish()
    }
}

/// Shared state backend used by every algorithm
#[async_trait]
pub trait AtomicStore: Send + Sync {
    /// Atomically add one to an integer key, creating it at 0 if absent
    async fn increment(&self, key: &str) -> Result<i64>;

    async fn set_expiry(&self, key: &str, seconds: u64) -> Result<()>;

    /// Read integer counters in one round trip; missing keys read as 0
    async fn read_counters(&self, keys: &[String]) -> Result<Vec<i64>>;

    async fn read_hash_fields(
        &self,
        key: &str,
        fields: &[&str],
    ) -> Result<HashMap<String, Option<String>>>;

    async fn write_hash_fields(&self, key: &str, fields: &[(&str, String)]) -> Result<()>;

    /// Remove members scored within `[min_score, max_score]`
    async fn sorted_set_remove_by_score_range(
        &self,
        key: &str,
        min_score: f64,
        max_score: f64,
    ) -> Result<()>;

    async fn sorted_set_cardinality(&self, key: &str) -> Result<u64>;

    async fn sorted_set_add(&self, key: &str, score: f64, member: &str) -> Result<()>;

    /// Run a script as one unit, isolated from every other operation
    async fn run_atomic_transaction(
        &self,
        script: &Script,
        keys: &[String],
        args: &[String],
    ) -> Result<Vec<ScriptValue>>;

    async fn health_check(&self) -> Result<()>;

    /// Increment and set expiry in one round trip
    async fn increment_with_expiry(&self, key: &str, seconds: u64) -> Result<i64> {
        let count = self.increment(key).await?;
        self.set_expiry(key, seconds).await?;
        Ok(count)
    }

    /// Drop members in the score range then count what is left
    async fn prune_and_count(&self, key: &str, min_score: f64, max_score: f64) -> Result<u64> {
        self.sorted_set_remove_by_score_range(key, min_score, max_score)
            .await?;
        self.sorted_set_cardinality(key).await
    }

    async fn sorted_set_add_with_expiry(
        &self,
        key: &str,
        score: f64,
        member: &str,
        seconds: u64,
    ) -> Result<()> {
        self.sorted_set_add(key, score, member).await?;
        self.set_expiry(key, seconds).await
    }
}
