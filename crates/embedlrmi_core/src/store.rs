use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

use crate::error::Result;

/// Key-value backend the gateway caches provider payloads in.
///
/// `ttl_seconds == 0` stores without expiry. Expired entries must read as absent.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>>;

    fn set(&self, key: &str, value: &Value, ttl_seconds: u64) -> Result<()>;

    /// Returns whether an entry was removed. Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> Result<bool>;

    /// Remove every entry created through `make_key(namespace, ..)`.
    fn purge_namespace(&self, namespace: &str) -> Result<usize>;

    fn make_key(&self, namespace: &str, fragment: &str) -> String {
        format!("{namespace}:{fragment}")
    }
}

pub trait Clock: Send + Sync {
    fn now_unix(&self) -> u64;
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now_unix(&self) -> u64 {
        self.as_ref().now_unix()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|value| value.as_secs())
            .unwrap_or(0)
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn starting_at(now_unix: u64) -> Self {
        Self {
            now: AtomicU64::new(now_unix),
        }
    }

    pub fn advance(&self, seconds: u64) {
        self.now.fetch_add(seconds, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_unix(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

pub(crate) fn expires_at(now_unix: u64, ttl_seconds: u64) -> Option<u64> {
    if ttl_seconds == 0 {
        None
    } else {
        Some(now_unix.saturating_add(ttl_seconds))
    }
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: Value,
    expires_at_unix: Option<u64>,
}

impl MemoryEntry {
    fn is_live(&self, now_unix: u64) -> bool {
        self.expires_at_unix.is_none_or(|deadline| now_unix < deadline)
    }
}

/// In-process store. Good for a single worker and for tests.
pub struct MemoryStore<C: Clock = SystemClock> {
    entries: Mutex<HashMap<String, MemoryEntry>>,
    clock: C,
}

impl MemoryStore<SystemClock> {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl Default for MemoryStore<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> MemoryStore<C> {
    pub fn with_clock(clock: C) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Number of stored entries, expired ones included until they are read or purged.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<C: Clock> CacheStore for MemoryStore<C> {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let now = self.clock.now_unix();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &Value, ttl_seconds: u64) -> Result<()> {
        let entry = MemoryEntry {
            value: value.clone(),
            expires_at_unix: expires_at(self.clock.now_unix(), ttl_seconds),
        };
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), entry);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some())
    }

    fn purge_namespace(&self, namespace: &str) -> Result<usize> {
        let prefix = self.make_key(namespace, "");
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(&prefix));
        Ok(before - entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_then_get_returns_value() {
        let store = MemoryStore::with_clock(ManualClock::starting_at(1_000));
        store
            .set("embedlrmi:abc", &json!({"nodes": []}), 60)
            .expect("set");
        assert_eq!(
            store.get("embedlrmi:abc").expect("get"),
            Some(json!({"nodes": []}))
        );
    }

    #[test]
    fn entries_expire_after_ttl() {
        let store = MemoryStore::with_clock(ManualClock::starting_at(1_000));
        store.set("k", &json!(1), 60).expect("set");
        store.clock().advance(59);
        assert!(store.get("k").expect("get").is_some());
        store.clock().advance(1);
        assert!(store.get("k").expect("get").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn zero_ttl_never_expires() {
        let store = MemoryStore::with_clock(ManualClock::starting_at(0));
        store.set("k", &json!("v"), 0).expect("set");
        store.clock().advance(u64::from(u32::MAX));
        assert_eq!(store.get("k").expect("get"), Some(json!("v")));
    }

    #[test]
    fn delete_missing_key_is_noop() {
        let store = MemoryStore::new();
        assert!(!store.delete("embedlrmi:missing").expect("delete"));
    }

    #[test]
    fn purge_namespace_leaves_other_keys() {
        let store = MemoryStore::new();
        let first = store.make_key("embedlrmi", "a");
        let second = store.make_key("embedlrmi", "b");
        let foreign = store.make_key("parsercache", "a");
        for key in [&first, &second, &foreign] {
            store.set(key, &json!(true), 0).expect("set");
        }
        assert_eq!(store.purge_namespace("embedlrmi").expect("purge"), 2);
        assert!(store.get(&foreign).expect("get").is_some());
        assert!(store.get(&first).expect("get").is_none());
    }

    #[test]
    fn make_key_joins_namespace_and_fragment() {
        assert_eq!(MemoryStore::new().make_key("embedlrmi", "ff00"), "embedlrmi:ff00");
    }
}
