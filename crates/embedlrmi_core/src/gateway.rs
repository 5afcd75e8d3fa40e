//! Get-or-fetch access to LRMI metadata.
//!
//! The gateway owns the cache protocol: key derivation, the TTL it assigns, and the rule
//! that every per-request failure degrades to "no metadata". Concurrent misses on the same
//! key are coalesced so only one provider call is in flight per key; the other callers
//! block until it finishes and share its outcome, failures included.
//!
//! Invalidation does not wait for in-flight fetches. An `invalidate` that lands between a
//! fetch's miss and its write is undone by that write. The payload is an optional
//! enhancement, so this race is tolerated.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::Result;
use crate::provider::MetadataProvider;
use crate::resolver::{RewriteRule, resolve};
use crate::store::CacheStore;

pub const CACHE_NAMESPACE: &str = "embedlrmi";

/// The node consumers embed or render, if the provider returned one.
pub fn first_node(payload: &Value) -> Option<&Value> {
    payload.get("nodes")?.as_array()?.first()
}

/// Hex SHA-256 of the canonical URL.
pub fn url_fingerprint(canonical_url: &str) -> String {
    let digest = Sha256::digest(canonical_url.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest.iter() {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

pub struct MetadataGateway {
    store: Arc<dyn CacheStore>,
    provider: Arc<dyn MetadataProvider>,
    rewrite_rules: Vec<RewriteRule>,
    ttl_seconds: u64,
    inflight: Mutex<HashMap<String, Arc<Flight>>>,
}

impl MetadataGateway {
    pub fn new(
        store: Arc<dyn CacheStore>,
        provider: Arc<dyn MetadataProvider>,
        rewrite_rules: Vec<RewriteRule>,
        ttl_seconds: u64,
    ) -> Self {
        Self {
            store,
            provider,
            rewrite_rules,
            ttl_seconds,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_settings(
        settings: &Settings,
        store: Arc<dyn CacheStore>,
        provider: Arc<dyn MetadataProvider>,
    ) -> Self {
        Self::new(
            store,
            provider,
            settings.rewrite_rules.clone(),
            settings.cache_expiry_secs,
        )
    }

    pub fn ttl_seconds(&self) -> u64 {
        self.ttl_seconds
    }

    pub fn canonical_url(&self, raw_url: &str) -> String {
        resolve(raw_url, &self.rewrite_rules)
    }

    /// Depends only on `canonical_url`, so invalidation works without a prior fetch.
    pub fn cache_key(&self, canonical_url: &str) -> String {
        self.store.make_key(CACHE_NAMESPACE, &url_fingerprint(canonical_url))
    }

    /// Cached payload for `canonical_url`, fetching and caching it on a miss.
    ///
    /// Returns `None` when the provider is unreachable, answers with an error status, or
    /// sends something that is not JSON. Successful answers are cached whether or not they
    /// contain `nodes`, so unknown pages do not hit the provider on every view.
    pub fn fetch_metadata(&self, canonical_url: &str) -> Option<Value> {
        let key = self.cache_key(canonical_url);
        match self.store.get(&key) {
            Ok(Some(payload)) => {
                debug!(%canonical_url, %key, "LRMI metadata served from cache");
                return Some(payload);
            }
            Ok(None) => {}
            Err(error) => {
                warn!(%key, %error, "cache read failed, fetching directly");
            }
        }

        let (flight, leader) = self.join_flight(&key);
        if !leader {
            debug!(%key, "waiting on in-flight LRMI fetch");
            return flight.wait();
        }

        let guard = FlightGuard {
            gateway: self,
            key: &key,
            flight: &flight,
            outcome: None,
        };
        // A flight that finished between our miss and our join has already stored its answer.
        if let Ok(Some(payload)) = self.store.get(&key) {
            return guard.complete(Some(payload));
        }
        let outcome = self.fetch_and_store(canonical_url, &key);
        guard.complete(outcome)
    }

    /// Drop the cached payload for `canonical_url`. Missing entries are fine.
    pub fn invalidate(&self, canonical_url: &str) {
        let key = self.cache_key(canonical_url);
        match self.store.delete(&key) {
            Ok(removed) => info!(%canonical_url, removed, "LRMI cache cleared for page"),
            Err(error) => warn!(%canonical_url, %error, "failed to clear LRMI cache entry"),
        }
    }

    /// Resolve a raw page URL and fetch its metadata.
    pub fn lookup_page(&self, raw_url: &str) -> Option<Value> {
        self.fetch_metadata(&self.canonical_url(raw_url))
    }

    /// Resolve a raw page URL and invalidate its entry.
    pub fn invalidate_page(&self, raw_url: &str) {
        self.invalidate(&self.canonical_url(raw_url));
    }

    /// Remove every entry this gateway has written. Fails with
    /// [`crate::Error::PurgeUnsupported`] on stores that cannot enumerate keys.
    pub fn purge_all(&self) -> Result<usize> {
        let removed = self.store.purge_namespace(CACHE_NAMESPACE)?;
        info!(removed, "LRMI cache purged");
        Ok(removed)
    }

    fn fetch_and_store(&self, canonical_url: &str, key: &str) -> Option<Value> {
        let payload = match self.provider.query(canonical_url) {
            Ok(payload) => payload,
            Err(error) => {
                warn!(%canonical_url, category = error.category(), %error, "LRMI fetch failed");
                return None;
            }
        };

        match self.store.set(key, &payload, self.ttl_seconds) {
            Ok(()) => debug!(%key, ttl = self.ttl_seconds, "LRMI metadata stored in cache"),
            Err(error) => warn!(%key, %error, "failed to store LRMI metadata"),
        }
        Some(payload)
    }

    fn join_flight(&self, key: &str) -> (Arc<Flight>, bool) {
        let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = inflight.get(key) {
            return (Arc::clone(existing), false);
        }
        let flight = Arc::new(Flight::default());
        inflight.insert(key.to_string(), Arc::clone(&flight));
        (flight, true)
    }

    fn finish_flight(&self, key: &str, flight: &Flight, outcome: Option<Value>) {
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        flight.finish(outcome);
    }

    #[cfg(test)]
    fn inflight_len(&self) -> usize {
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[derive(Default)]
struct Flight {
    outcome: Mutex<Option<Option<Value>>>,
    done: Condvar,
}

impl Flight {
    fn wait(&self) -> Option<Value> {
        let mut outcome = self.outcome.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(result) = outcome.as_ref() {
                return result.clone();
            }
            outcome = self
                .done
                .wait(outcome)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn finish(&self, result: Option<Value>) {
        *self.outcome.lock().unwrap_or_else(PoisonError::into_inner) = Some(result);
        self.done.notify_all();
    }
}

/// Releases the flight on every exit path, so a panicking provider cannot strand waiters.
struct FlightGuard<'a> {
    gateway: &'a MetadataGateway,
    key: &'a str,
    flight: &'a Flight,
    outcome: Option<Option<Value>>,
}

impl FlightGuard<'_> {
    fn complete(mut self, outcome: Option<Value>) -> Option<Value> {
        self.outcome = Some(outcome.clone());
        outcome
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        let outcome = self.outcome.take().flatten();
        self.gateway.finish_flight(self.key, self.flight, outcome);
    }
}
