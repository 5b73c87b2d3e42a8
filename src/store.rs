//! Shared session store port.
//!
//! The coordinator and every chunk receiver talk to session state only through
//! [`SessionStore`], so the backing key-value store can be shared between
//! processes. Each operation is atomic on its own; the engine layers no
//! locking on top except the explicit merge lock.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::TransferError;

pub type StoreResult<T> = Result<T, TransferError>;

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get_record(&self, key: &str) -> StoreResult<Option<String>>;

    /// Overwrites `key`. `None` clears any previous expiry.
    async fn set_record(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Resets the expiry of an existing key. Returns false if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    /// Adds members to a set, returning how many were not already present.
    async fn set_add(&self, key: &str, members: &[u64]) -> StoreResult<u64>;

    /// Removes one member. Removing an absent member is a no-op that returns false.
    /// A set whose last member is removed no longer exists.
    async fn set_remove(&self, key: &str, member: u64) -> StoreResult<bool>;

    async fn set_cardinality(&self, key: &str) -> StoreResult<u64>;

    /// Members in ascending order.
    async fn set_members(&self, key: &str) -> StoreResult<Vec<u64>>;

    /// Set-if-absent with expiry. Returns true if the caller now owns `key`.
    async fn acquire_lock_if_absent(&self, key: &str, owner: &str, ttl: Duration) -> StoreResult<bool>;

    /// Extends the lock's expiry only while `owner` still holds it.
    async fn renew_lock(&self, key: &str, owner: &str, ttl: Duration) -> StoreResult<bool>;

    /// Deletes the lock only while `owner` still holds it.
    async fn release_lock(&self, key: &str, owner: &str) -> StoreResult<bool>;

    async fn delete_key(&self, key: &str) -> StoreResult<bool>;
}

#[derive(Debug, Clone)]
enum Value {
    Record(String),
    Set(BTreeSet<u64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

/// In-process store with key expiry.
///
/// Shares state between the registration endpoint and the chunk receiver of a
/// single server process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut HashMap<String, Entry>) -> StoreResult<T>) -> StoreResult<T> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| TransferError::Storage("memory store mutex poisoned".to_string()))?;
        let now = Instant::now();
        entries.retain(|_, entry| !entry.is_expired(now));
        f(&mut entries)
    }
}

fn wrong_type(key: &str) -> TransferError {
    TransferError::Storage(format!("key {key} holds the wrong kind of value"))
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn get_record(&self, key: &str) -> StoreResult<Option<String>> {
        self.with_entries(|entries| match entries.get(key) {
            None => Ok(None),
            Some(Entry { value: Value::Record(value), .. }) => Ok(Some(value.clone())),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn set_record(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.with_entries(|entries| {
            entries.insert(key.to_string(), Entry::new(Value::Record(value.to_string()), ttl));
            Ok(())
        })
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.with_entries(|entries| Ok(entries.contains_key(key)))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.with_entries(|entries| match entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        })
    }

    async fn set_add(&self, key: &str, members: &[u64]) -> StoreResult<u64> {
        if members.is_empty() {
            return Ok(0);
        }
        self.with_entries(|entries| {
            let entry = entries
                .entry(key.to_string())
                .or_insert_with(|| Entry::new(Value::Set(BTreeSet::new()), None));
            match &mut entry.value {
                Value::Set(set) => Ok(members.iter().filter(|m| set.insert(**m)).count() as u64),
                Value::Record(_) => Err(wrong_type(key)),
            }
        })
    }

    async fn set_remove(&self, key: &str, member: u64) -> StoreResult<bool> {
        self.with_entries(|entries| {
            let (removed, now_empty) = match entries.get_mut(key) {
                None => return Ok(false),
                Some(Entry { value: Value::Set(set), .. }) => {
                    let removed = set.remove(&member);
                    (removed, set.is_empty())
                }
                Some(_) => return Err(wrong_type(key)),
            };
            if now_empty {
                entries.remove(key);
            }
            Ok(removed)
        })
    }

    async fn set_cardinality(&self, key: &str) -> StoreResult<u64> {
        self.with_entries(|entries| match entries.get(key) {
            None => Ok(0),
            Some(Entry { value: Value::Set(set), .. }) => Ok(set.len() as u64),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn set_members(&self, key: &str) -> StoreResult<Vec<u64>> {
        self.with_entries(|entries| match entries.get(key) {
            None => Ok(Vec::new()),
            Some(Entry { value: Value::Set(set), .. }) => Ok(set.iter().copied().collect()),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn acquire_lock_if_absent(&self, key: &str, owner: &str, ttl: Duration) -> StoreResult<bool> {
        self.with_entries(|entries| {
            if entries.contains_key(key) {
                return Ok(false);
            }
            entries.insert(key.to_string(), Entry::new(Value::Record(owner.to_string()), Some(ttl)));
            Ok(true)
        })
    }

    async fn renew_lock(&self, key: &str, owner: &str, ttl: Duration) -> StoreResult<bool> {
        self.with_entries(|entries| match entries.get_mut(key) {
            Some(entry) if matches!(&entry.value, Value::Record(holder) if holder == owner) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            _ => Ok(false),
        })
    }

    async fn release_lock(&self, key: &str, owner: &str) -> StoreResult<bool> {
        self.with_entries(|entries| {
            let held = matches!(
                entries.get(key),
                Some(Entry { value: Value::Record(holder), .. }) if holder == owner
            );
            if held {
                entries.remove(key);
            }
            Ok(held)
        })
    }

    async fn delete_key(&self, key: &str) -> StoreResult<bool> {
        self.with_entries(|entries| Ok(entries.remove(key).is_some()))
    }
}
