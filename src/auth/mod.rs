//! Authorization UUID store: a tiered cache in front of the configured
//! providers, mapping each normalized UUID to the provider that supplied it.
//!
//! Read order is L1 (memory) → L2 (optional sqlite, backfilling L1 with the
//! row's residual TTL) → a settle-all provider fetch. L1 is written on every
//! store; L2 at most once per write interval per key.

pub mod cache;
pub mod providers;

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use tracing::{debug, info, warn};
use uuid::Uuid;

use self::cache::{Cache, MemoryCache};
use self::providers::{merge_results, Provider};

/// Cache key for the merged `uuid -> provider` map.
const MERGED_KEY: &str = "uuids:merged";

/// L1 entry bound; the store only keeps a handful of keys.
const L1_CAPACITY: usize = 64;

/// Minimum spacing between persistent writes of the same key.
pub const L2_WRITE_INTERVAL: Duration = Duration::from_secs(60);

pub struct AuthStore {
    providers: Vec<Provider>,
    l1: MemoryCache,
    l2: Option<Box<dyn Cache>>,
    ttl: Duration,
    l2_write_interval: Duration,
    l2_last_write: Mutex<HashMap<String, Instant>>,
    http: reqwest::Client,
}

impl AuthStore {
    pub fn new(
        providers: Vec<Provider>,
        l2: Option<Box<dyn Cache>>,
        ttl: Duration,
        http: reqwest::Client,
    ) -> Self {
        Self {
            providers,
            l1: MemoryCache::new(L1_CAPACITY),
            l2,
            ttl,
            l2_write_interval: L2_WRITE_INTERVAL,
            l2_last_write: Mutex::new(HashMap::new()),
            http,
        }
    }

    /// The current merged allow-set. Served from cache when fresh; a miss
    /// triggers a provider fetch. Provider failures shrink the set rather
    /// than erroring — an unreachable upstream must not take every tunnel
    /// down with it.
    pub async fn authorized(&self) -> HashMap<String, String> {
        if let Some(cached) = self.read_tiers() {
            return cached;
        }
        let merged = self.fetch_merged().await;
        self.persist(&merged);
        merged
    }

    /// Drop the merged entry from both tiers and re-fetch.
    pub async fn refresh(&self) -> HashMap<String, String> {
        self.l1.remove(MERGED_KEY);
        if let Some(l2) = &self.l2 {
            l2.remove(MERGED_KEY);
        }
        self.l2_last_write.lock().unwrap().remove(MERGED_KEY);
        let merged = self.fetch_merged().await;
        self.persist(&merged);
        info!(count = merged.len(), "uuid allow-set refreshed");
        merged
    }

    /// Snapshot the allow-set into a validator for one tunnel greeting.
    pub async fn validator(&self) -> UuidValidator {
        UuidValidator::new(self.authorized().await.into_keys())
    }

    fn read_tiers(&self) -> Option<HashMap<String, String>> {
        if let Some(hit) = self.l1.get(MERGED_KEY) {
            return decode_map(&hit.value);
        }
        let l2 = self.l2.as_ref()?;
        let hit = l2.get(MERGED_KEY)?;
        // Backfill L1 with the residual TTL so both tiers expire together.
        self.l1.put(MERGED_KEY, &hit.value, hit.remaining);
        decode_map(&hit.value)
    }

    async fn fetch_merged(&self) -> HashMap<String, String> {
        let available: Vec<&Provider> = self
            .providers
            .iter()
            .filter(|p| p.is_available())
            .collect();

        let fetches = available.iter().map(|&p| async move {
            let result = p.fetch_uuids(&self.http).await;
            (p.name().to_string(), p.priority(), result)
        });
        let settled = join_all(fetches).await;

        let mut results = Vec::new();
        for (name, priority, result) in settled {
            match result {
                Ok(uuids) => {
                    debug!(provider = %name, count = uuids.len(), "provider fetch ok");
                    results.push((name, priority, uuids));
                }
                Err(e) => {
                    warn!(provider = %name, error = %e, "provider fetch failed");
                }
            }
        }
        merge_results(results)
    }

    fn persist(&self, merged: &HashMap<String, String>) {
        let encoded = match serde_json::to_string(merged) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to encode allow-set");
                return;
            }
        };
        self.l1.put(MERGED_KEY, &encoded, self.ttl);

        let Some(l2) = &self.l2 else { return };
        let mut last = self.l2_last_write.lock().unwrap();
        let now = Instant::now();
        if let Some(prev) = last.get(MERGED_KEY) {
            if now.duration_since(*prev) < self.l2_write_interval {
                return;
            }
        }
        last.insert(MERGED_KEY.to_string(), now);
        l2.put(MERGED_KEY, &encoded, self.ttl);
    }
}

fn decode_map(raw: &str) -> Option<HashMap<String, String>> {
    match serde_json::from_str(raw) {
        Ok(map) => Some(map),
        Err(e) => {
            warn!(error = %e, "corrupt allow-set cache entry");
            None
        }
    }
}

/// Snapshot validator handed to the greeting parser:
/// `is_authorized(u) := lowercased(u) ∈ allow-set`.
#[derive(Debug, Clone)]
pub struct UuidValidator {
    allowed: HashSet<String>,
}

impl UuidValidator {
    pub fn new(uuids: impl IntoIterator<Item = String>) -> Self {
        Self {
            allowed: uuids
                .into_iter()
                .map(|u| u.to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn is_authorized(&self, uuid: &Uuid) -> bool {
        // Uuid renders lowercase hyphenated, matching the stored form.
        self.allowed.contains(&uuid.to_string())
    }

    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::cache::SqliteStore;

    const A: &str = "550e8400-e29b-41d4-a716-446655440000";
    const B: &str = "c0ffee00-0000-4000-8000-000000000001";

    fn store_with(providers: Vec<Provider>, l2: Option<Box<dyn Cache>>) -> AuthStore {
        AuthStore::new(
            providers,
            l2,
            Duration::from_secs(300),
            reqwest::Client::new(),
        )
    }

    #[tokio::test]
    async fn static_provider_populates_allow_set() {
        let store = store_with(
            vec![Provider::static_list("static", vec![A.to_string()])],
            None,
        );
        let merged = store.authorized().await;
        assert_eq!(merged.get(A).unwrap(), "static");
    }

    #[tokio::test]
    async fn second_read_served_from_l1() {
        let store = store_with(
            vec![Provider::static_list("static", vec![A.to_string()])],
            None,
        );
        store.authorized().await;
        // Cached result survives the providers vanishing.
        let merged = store.authorized().await;
        assert!(merged.contains_key(A));
        assert!(store.l1.get(MERGED_KEY).is_some());
    }

    #[tokio::test]
    async fn l2_hit_backfills_l1() {
        let l2 = SqliteStore::open_in_memory();
        let seeded: HashMap<String, String> =
            [(B.to_string(), "seed".to_string())].into_iter().collect();
        l2.put(
            MERGED_KEY,
            &serde_json::to_string(&seeded).unwrap(),
            Duration::from_secs(120),
        );

        let store = store_with(vec![], Some(Box::new(l2)));
        let merged = store.authorized().await;
        assert_eq!(merged.get(B).unwrap(), "seed");

        let backfilled = store.l1.get(MERGED_KEY).unwrap();
        // Residual TTL, not the store's full TTL.
        assert!(backfilled.remaining <= Duration::from_secs(120));
    }

    #[tokio::test]
    async fn refresh_clears_and_refetches() {
        let store = store_with(
            vec![Provider::static_list("static", vec![A.to_string()])],
            None,
        );
        store.authorized().await;
        let merged = store.refresh().await;
        assert!(merged.contains_key(A));
    }

    #[test]
    fn l2_writes_are_staggered() {
        let store = store_with(vec![], Some(Box::new(SqliteStore::open_in_memory())));
        let first: HashMap<String, String> =
            [(A.to_string(), "static".to_string())].into_iter().collect();
        let second: HashMap<String, String> =
            [(B.to_string(), "static".to_string())].into_iter().collect();

        store.persist(&first);
        store.persist(&second);

        // Second write was inside the interval: L2 keeps the first value,
        // L1 has the second.
        let l2_value = store.l2.as_ref().unwrap().get(MERGED_KEY).unwrap();
        assert!(l2_value.value.contains(A));
        let l1_value = store.l1.get(MERGED_KEY).unwrap();
        assert!(l1_value.value.contains(B));
    }

    #[tokio::test]
    async fn empty_providers_yield_empty_set() {
        let store = store_with(vec![], None);
        assert!(store.authorized().await.is_empty());
        assert!(store.validator().await.is_empty());
    }

    #[test]
    fn validator_normalizes_case() {
        let v = UuidValidator::new(vec![A.to_uppercase()]);
        assert!(v.is_authorized(&Uuid::parse_str(A).unwrap()));
        assert!(!v.is_authorized(&Uuid::parse_str(B).unwrap()));
    }
}
