//! Storage and accounting for a single cache tier

use super::keys::{CacheKey, ContextHash};
use super::persist::CacheRecord;
use super::CacheTier;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Counters for one tier
#[derive(Debug, Clone, Default, Serialize)]
pub struct TierMetrics {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub corruptions: u64,
    /// USD not spent thanks to hits
    pub estimated_savings: f64,
}

impl TierMetrics {
    fn record_hit(&mut self, saved: f64) {
        self.hits += 1;
        self.estimated_savings += saved;
    }

    fn record_miss(&mut self) {
        self.misses += 1;
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total > 0 {
            self.hits as f64 / total as f64
        } else {
            0.0
        }
    }
}

/// Point-in-time statistics for one tier
#[derive(Debug, Clone, Serialize)]
pub struct TierStats {
    pub tier: CacheTier,
    pub hits: u64,
    pub misses: u64,
    /// 0.0 - 1.0
    pub hit_rate: f64,
    pub entries: usize,
    pub estimated_savings: f64,
    pub size_bytes: usize,
    pub evictions: u64,
    pub expirations: u64,
    pub corruptions: u64,
}

impl std::fmt::Display for TierStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== {} cache ===", self.tier)?;
        writeln!(f, "Entries: {} ({} bytes)", self.entries, self.size_bytes)?;
        writeln!(f, "Hits: {}", self.hits)?;
        writeln!(f, "Misses: {}", self.misses)?;
        writeln!(f, "Hit rate: {:.1}%", self.hit_rate * 100.0)?;
        writeln!(f, "Est. savings: ${:.4}", self.estimated_savings)?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    key: String,
    value: Vec<u8>,
    created_at: DateTime<Utc>,
    ttl: Option<Duration>,
    context_hash: Option<ContextHash>,
    hit_count: u64,
    /// Cost of recomputing this value; tier default when unknown
    recompute_cost: Option<f64>,
    last_accessed: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let Some(ttl) = self.ttl else {
            return false;
        };
        match (now - self.created_at).to_std() {
            Ok(age) => age > ttl,
            // Created "in the future" (clock skew): treat as fresh
            Err(_) => false,
        }
    }

    /// Entries without expiry are never evicted for capacity
    fn is_permanent(&self) -> bool {
        self.ttl.is_none()
    }
}

#[derive(Debug, Default)]
struct TierState {
    entries: HashMap<String, CacheEntry>,
    metrics: TierMetrics,
}

/// One tier's entries and counters behind a single lock so an entry and
/// its accounting always change together
#[derive(Debug)]
pub(crate) struct TierStore {
    tier: CacheTier,
    default_ttl: Option<Duration>,
    default_recompute_cost: f64,
    max_entries: usize,
    state: Mutex<TierState>,
}

impl TierStore {
    pub(crate) fn new(
        tier: CacheTier,
        default_ttl: Option<Duration>,
        default_recompute_cost: f64,
        max_entries: usize,
    ) -> Self {
        Self {
            tier,
            default_ttl,
            default_recompute_cost,
            max_entries,
            state: Mutex::new(TierState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TierState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!("{} cache lock poisoned, recovering", self.tier);
            poisoned.into_inner()
        })
    }

    /// Look up and decode an entry.
    ///
    /// Expired entries and entries that fail to decode are removed and
    /// counted as misses.
    pub(crate) fn lookup<T, E, F>(&self, key: &CacheKey, decode: F) -> Option<T>
    where
        E: Display,
        F: FnOnce(&[u8]) -> Result<T, E>,
    {
        let now = Utc::now();
        let mut guard = self.lock();
        let state = &mut *guard;

        let Some(entry) = state.entries.get_mut(key.as_str()) else {
            state.metrics.record_miss();
            return None;
        };

        if entry.is_expired(now) {
            state.entries.remove(key.as_str());
            state.metrics.expirations += 1;
            state.metrics.record_miss();
            debug!("{} cache entry {} expired", self.tier, key);
            return None;
        }

        match decode(&entry.value) {
            Ok(value) => {
                entry.hit_count += 1;
                entry.last_accessed = Instant::now();
                let saved = entry.recompute_cost.unwrap_or(self.default_recompute_cost);
                state.metrics.record_hit(saved);
                Some(value)
            }
            Err(e) => {
                warn!("Evicting corrupt {} cache entry {}: {}", self.tier, key, e);
                state.entries.remove(key.as_str());
                state.metrics.corruptions += 1;
                state.metrics.record_miss();
                None
            }
        }
    }

    /// Insert or overwrite an entry as one unit.
    ///
    /// A tier without a default TTL never expires entries, so `ttl_override`
    /// is ignored there.
    pub(crate) fn insert(
        &self,
        key: &CacheKey,
        value: Vec<u8>,
        ttl_override: Option<Duration>,
        recompute_cost: Option<f64>,
    ) {
        let ttl = match self.default_ttl {
            Some(default_ttl) => Some(ttl_override.unwrap_or(default_ttl)),
            None => {
                if ttl_override.is_some() {
                    debug!("Ignoring TTL override for non-expiring tier {}", self.tier);
                }
                None
            }
        };

        let mut guard = self.lock();
        let state = &mut *guard;

        if !state.entries.contains_key(key.as_str()) && state.entries.len() >= self.max_entries {
            self.make_room(state);
        }

        state.entries.insert(
            key.as_str().to_string(),
            CacheEntry {
                key: key.as_str().to_string(),
                value,
                created_at: Utc::now(),
                ttl,
                context_hash: key.context_hash().cloned(),
                hit_count: 0,
                recompute_cost,
                last_accessed: Instant::now(),
            },
        );
        state.metrics.writes += 1;
    }

    /// Drop expired entries first, then the least recently used quarter
    fn make_room(&self, state: &mut TierState) {
        let now = Utc::now();
        let before = state.entries.len();
        state.entries.retain(|_, e| !e.is_expired(now));
        let expired = before - state.entries.len();
        state.metrics.expirations += expired as u64;

        if state.entries.len() < self.max_entries {
            return;
        }

        let evict_count = (self.max_entries / 4).max(1);
        let mut by_access: Vec<_> = state
            .entries
            .iter()
            .filter(|(_, e)| !e.is_permanent())
            .map(|(k, e)| (k.clone(), e.last_accessed))
            .collect();
        by_access.sort_by_key(|(_, t)| *t);

        for (key, _) in by_access.into_iter().take(evict_count) {
            state.entries.remove(&key);
            state.metrics.evictions += 1;
        }
        debug!(
            "{} cache at capacity: {} expired, {} evicted",
            self.tier, expired, state.metrics.evictions
        );
    }

    pub(crate) fn remove(&self, key: &CacheKey) -> bool {
        self.lock().entries.remove(key.as_str()).is_some()
    }

    pub(crate) fn clear(&self) -> usize {
        let mut state = self.lock();
        let count = state.entries.len();
        state.entries.clear();
        count
    }

    pub(crate) fn reset_metrics(&self) {
        self.lock().metrics = TierMetrics::default();
    }

    pub(crate) fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut state = self.lock();
        let before = state.entries.len();
        state.entries.retain(|_, e| !e.is_expired(now));
        let purged = before - state.entries.len();
        state.metrics.expirations += purged as u64;
        purged
    }

    pub(crate) fn stats(&self) -> TierStats {
        let state = self.lock();
        TierStats {
            tier: self.tier,
            hits: state.metrics.hits,
            misses: state.metrics.misses,
            hit_rate: state.metrics.hit_rate(),
            entries: state.entries.len(),
            estimated_savings: state.metrics.estimated_savings,
            size_bytes: state
                .entries
                .values()
                .map(|e| e.key.len() + e.value.len())
                .sum(),
            evictions: state.metrics.evictions,
            expirations: state.metrics.expirations,
            corruptions: state.metrics.corruptions,
        }
    }

    /// Hit count of a live entry, without counting a lookup
    pub(crate) fn hit_count(&self, key: &CacheKey) -> Option<u64> {
        self.lock().entries.get(key.as_str()).map(|e| e.hit_count)
    }

    pub(crate) fn records(&self) -> Vec<CacheRecord> {
        let state = self.lock();
        let mut records: Vec<CacheRecord> = state
            .entries
            .values()
            .map(|e| CacheRecord {
                tier: self.tier,
                key: e.key.clone(),
                value: hex::encode(&e.value),
                created_at: e.created_at,
                // Round up so a sub-second TTL does not export as already expired
                ttl_seconds: e.ttl.map(|t| t.as_secs() + u64::from(t.subsec_nanos() > 0)),
                context_hash: e.context_hash.clone(),
                hit_count: e.hit_count,
                recompute_cost: e.recompute_cost,
            })
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.key.cmp(&b.key)));
        records
    }

    /// Restore a persisted entry, keeping its original timestamp.
    /// Returns false if the record is already expired.
    pub(crate) fn restore(&self, record: CacheRecord, value: Vec<u8>) -> bool {
        let entry = CacheEntry {
            key: record.key.clone(),
            value,
            created_at: record.created_at,
            ttl: record.ttl_seconds.map(Duration::from_secs),
            context_hash: record.context_hash,
            hit_count: record.hit_count,
            recompute_cost: record.recompute_cost,
            last_accessed: Instant::now(),
        };
        if entry.is_expired(Utc::now()) {
            return false;
        }

        let mut guard = self.lock();
        let state = &mut *guard;
        if !state.entries.contains_key(&record.key) && state.entries.len() >= self.max_entries {
            self.make_room(state);
        }
        state.entries.insert(record.key, entry);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(max_entries: usize) -> TierStore {
        TierStore::new(
            CacheTier::Analysis,
            Some(Duration::from_secs(3600)),
            0.25,
            max_entries,
        )
    }

    fn decode_utf8(bytes: &[u8]) -> Result<String, std::str::Utf8Error> {
        std::str::from_utf8(bytes).map(str::to_string)
    }

    #[test]
    fn test_hit_increments_counters() {
        let store = store(10);
        let key = CacheKey::raw("k");
        store.insert(&key, b"v".to_vec(), None, None);

        assert_eq!(store.lookup(&key, decode_utf8), Some("v".to_string()));
        assert_eq!(store.lookup(&key, decode_utf8), Some("v".to_string()));
        assert_eq!(store.hit_count(&key), Some(2));

        let stats = store.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.estimated_savings, 0.5);
    }

    #[test]
    fn test_corrupt_entry_is_evicted() {
        let store = store(10);
        let key = CacheKey::raw("bad");
        store.insert(&key, vec![0xff, 0xfe], None, None);

        assert_eq!(store.lookup(&key, decode_utf8), None);
        let stats = store.stats();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.corruptions, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 0);
    }

    #[test]
    fn test_lru_eviction_at_capacity() {
        let store = store(4);
        for i in 0..4 {
            store.insert(&CacheKey::raw(format!("k{i}")), vec![i], None, None);
            std::thread::sleep(Duration::from_millis(2));
        }
        // Touch k0 so k1 becomes the least recently used
        assert!(store.lookup(&CacheKey::raw("k0"), decode_utf8).is_some());

        store.insert(&CacheKey::raw("k4"), vec![4], None, None);

        assert_eq!(store.stats().entries, 4);
        assert_eq!(store.stats().evictions, 1);
        assert!(store.hit_count(&CacheKey::raw("k1")).is_none());
        assert!(store.hit_count(&CacheKey::raw("k0")).is_some());
    }

    #[test]
    fn test_permanent_entries_survive_eviction() {
        let store = TierStore::new(CacheTier::Capability, None, 0.0, 2);
        store.insert(&CacheKey::raw("a"), vec![1], None, None);
        store.insert(&CacheKey::raw("b"), vec![2], None, None);
        store.insert(&CacheKey::raw("c"), vec![3], None, None);

        assert_eq!(store.stats().entries, 3);
        assert_eq!(store.stats().evictions, 0);
    }

    #[test]
    fn test_overwrite_does_not_evict() {
        let store = store(1);
        let key = CacheKey::raw("only");
        store.insert(&key, b"one".to_vec(), None, None);
        store.insert(&key, b"two".to_vec(), None, None);

        assert_eq!(store.lookup(&key, decode_utf8), Some("two".to_string()));
        assert_eq!(store.stats().evictions, 0);
    }
}
