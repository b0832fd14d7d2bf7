//! In-process store with TTL emulation.
//!
//! Each single operation runs under one lock acquisition, so batched helpers
//! interleave with concurrent callers exactly like pipelined commands do.
//! Transactions run their native procedure under a single lock.

use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
};
use tokio::sync::{Mutex, MutexGuard};

use crate::{
    error::{RateLimitError, Result},
    store::{AtomicStore, Script, ScriptValue, TransactionOps},
    utils::{SystemTimeSource, TimeSource},
};

#[derive(Debug, Clone)]
enum StoredValue {
    Counter(i64),
    Hash(HashMap<String, String>),
    SortedSet(HashMap<String, f64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: StoredValue,
    expires_at: Option<i64>,
}

type Entries = HashMap<String, Entry>;

/// Minimum clock time between full sweeps of expired keys
const SWEEP_INTERVAL_MS: i64 = 1_000;

fn wrong_type(key: &str) -> RateLimitError {
    RateLimitError::StoreProtocol(format!(
        "WRONGTYPE operation against key {} holding the wrong kind of value",
        key
    ))
}

fn purge_expired(entries: &mut Entries, key: &str, now: i64) {
    let expired = entries
        .get(key)
        .and_then(|e| e.expires_at)
        .is_some_and(|at| at <= now);
    if expired {
        entries.remove(key);
    }
}

/// Drop the entry if its TTL has passed, then return it
fn live_entry<'a>(entries: &'a mut Entries, key: &str, now: i64) -> Option<&'a mut Entry> {
    purge_expired(entries, key, now);
    entries.get_mut(key)
}

/// Live entry for the key, created with `empty` if absent
fn entry_or_insert<'a>(
    entries: &'a mut Entries,
    key: &str,
    now: i64,
    empty: fn() -> StoredValue,
) -> &'a mut Entry {
    purge_expired(entries, key, now);
    entries.entry(key.to_string()).or_insert_with(|| Entry {
        value: empty(),
        expires_at: None,
    })
}

fn expire(entries: &mut Entries, key: &str, seconds: u64, now: i64) {
    if let Some(entry) = live_entry(entries, key, now) {
        let ttl_ms = i64::try_from(seconds)
            .unwrap_or(i64::MAX)
            .saturating_mul(1000);
        entry.expires_at = Some(now.saturating_add(ttl_ms));
    }
}

/// Local store implementing the full store contract
pub struct MemoryStore {
    entries: Mutex<Entries>,
    time_source: Arc<dyn TimeSource>,
    next_sweep: AtomicI64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_time_source(Arc::new(SystemTimeSource))
    }

    /// Use the given clock for key expiry
    pub fn with_time_source(time_source: Arc<dyn TimeSource>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            time_source,
            next_sweep: AtomicI64::new(i64::MIN),
        }
    }

    /// Lock the map, dropping every expired key when a sweep is due
    async fn lock_live(&self) -> (MutexGuard<'_, Entries>, i64) {
        let now = self.time_source.now_millis();
        let mut entries = self.entries.lock().await;
        // Only read and written under the lock
        if now >= self.next_sweep.load(Ordering::Relaxed) {
            entries.retain(|_, e| e.expires_at.map_or(true, |at| at > now));
            self.next_sweep
                .store(now.saturating_add(SWEEP_INTERVAL_MS), Ordering::Relaxed);
        }
        (entries, now)
    }

    /// Milliseconds until the key expires, `None` if absent or persistent
    pub async fn ttl_millis(&self, key: &str) -> Option<i64> {
        let (mut entries, now) = self.lock_live().await;
        live_entry(&mut entries, key, now)
            .and_then(|e| e.expires_at)
            .map(|at| at - now)
    }

    pub async fn contains_key(&self, key: &str) -> bool {
        let (mut entries, now) = self.lock_live().await;
        live_entry(&mut entries, key, now).is_some()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

struct MemoryTransaction<'a> {
    entries: &'a mut Entries,
    now: i64,
}

impl TransactionOps for MemoryTransaction<'_> {
    fn read_hash_fields(&mut self, key: &str, fields: &[&str]) -> Result<Vec<Option<String>>> {
        match live_entry(self.entries, key, self.now) {
            None => Ok(vec![None; fields.len()]),
            Some(Entry {
                value: StoredValue::Hash(hash),
                ..
            }) => Ok(fields.iter().map(|f| hash.get(*f).cloned()).collect()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn write_hash_fields(&mut self, key: &str, fields: &[(&str, String)]) -> Result<()> {
        let entry = entry_or_insert(self.entries, key, self.now, || {
            StoredValue::Hash(HashMap::new())
        });
        match &mut entry.value {
            StoredValue::Hash(hash) => {
                for (field, value) in fields {
                    hash.insert(field.to_string(), value.clone());
                }
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }
    }

    fn set_expiry(&mut self, key: &str, seconds: u64) -> Result<()> {
        expire(self.entries, key, seconds, self.now);
        Ok(())
    }
}

#[async_trait]
impl AtomicStore for MemoryStore {
    async fn increment(&self, key: &str) -> Result<i64> {
        let (mut entries, now) = self.lock_live().await;
        match live_entry(&mut entries, key, now) {
            Some(Entry {
                value: StoredValue::Counter(count),
                ..
            }) => {
                *count += 1;
                Ok(*count)
            }
            Some(_) => Err(wrong_type(key)),
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: StoredValue::Counter(1),
                        expires_at: None,
                    },
                );
                Ok(1)
            }
        }
    }

    async fn set_expiry(&self, key: &str, seconds: u64) -> Result<()> {
        let (mut entries, now) = self.lock_live().await;
        expire(&mut entries, key, seconds, now);
        Ok(())
    }

    async fn read_counters(&self, keys: &[String]) -> Result<Vec<i64>> {
        let (mut entries, now) = self.lock_live().await;
        keys.iter()
            .map(|key| match live_entry(&mut entries, key, now) {
                None => Ok(0),
                Some(Entry {
                    value: StoredValue::Counter(count),
                    ..
                }) => Ok(*count),
                Some(_) => Err(wrong_type(key)),
            })
            .collect()
    }

    async fn read_hash_fields(
        &self,
        key: &str,
        fields: &[&str],
    ) -> Result<HashMap<String, Option<String>>> {
        let (mut entries, now) = self.lock_live().await;
        let mut txn = MemoryTransaction {
            entries: &mut entries,
            now,
        };
        let values = txn.read_hash_fields(key, fields)?;
        Ok(fields
            .iter()
            .map(|f| f.to_string())
            .zip(values)
            .collect())
    }

    async fn write_hash_fields(&self, key: &str, fields: &[(&str, String)]) -> Result<()> {
        let (mut entries, now) = self.lock_live().await;
        MemoryTransaction {
            entries: &mut entries,
            now,
        }
        .write_hash_fields(key, fields)
    }

    async fn sorted_set_remove_by_score_range(
        &self,
        key: &str,
        min_score: f64,
        max_score: f64,
    ) -> Result<()> {
        let (mut entries, now) = self.lock_live().await;
        match live_entry(&mut entries, key, now) {
            None => Ok(()),
            Some(Entry {
                value: StoredValue::SortedSet(set),
                ..
            }) => {
                set.retain(|_, score| *score < min_score || *score > max_score);
                if set.is_empty() {
                    entries.remove(key);
                }
                Ok(())
            }
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn sorted_set_cardinality(&self, key: &str) -> Result<u64> {
        let (mut entries, now) = self.lock_live().await;
        match live_entry(&mut entries, key, now) {
            None => Ok(0),
            Some(Entry {
                value: StoredValue::SortedSet(set),
                ..
            }) => Ok(set.len() as u64),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn sorted_set_add(&self, key: &str, score: f64, member: &str) -> Result<()> {
        let (mut entries, now) = self.lock_live().await;
        let entry = entry_or_insert(&mut entries, key, now, || {
            StoredValue::SortedSet(HashMap::new())
        });
        match &mut entry.value {
            StoredValue::SortedSet(set) => {
                set.insert(member.to_string(), score);
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn run_atomic_transaction(
        &self,
        script: &Script,
        keys: &[String],
        args: &[String],
    ) -> Result<Vec<ScriptValue>> {
        let (mut entries, now) = self.lock_live().await;
        let mut txn = MemoryTransaction {
            entries: &mut entries,
            now,
        };
        (script.procedure())(&mut txn, keys, args)
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
