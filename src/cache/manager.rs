use super::persist::{self, CacheRecord};
use super::tier::{TierStats, TierStore};
use super::{CacheConfig, CacheError, CacheKey, CacheSummary, CacheTier};
use crate::config::{Config, ConfigError};
use crate::optimization::CostEstimator;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Owns the three cache tiers.
///
/// Share it through an `Arc`; every operation takes `&self` and locks only
/// the tier it touches.
#[derive(Debug)]
pub struct CacheManager {
    tiers: [TierStore; 3],
    command_version: Mutex<Option<String>>,
    snapshot_path: Option<PathBuf>,
    sweep_interval: Option<Duration>,
}

impl CacheManager {
    pub fn new(config: CacheConfig, estimator: CostEstimator) -> Self {
        let store = |tier: CacheTier| {
            let (tokens_in, tokens_out) = tier.nominal_tokens();
            let recompute_cost = estimator
                .estimate(tier.model_tier(), tokens_in, tokens_out)
                .estimated_cost;
            TierStore::new(
                tier,
                config.ttl_for(tier),
                recompute_cost,
                config.max_entries_per_tier,
            )
        };

        Self {
            tiers: [
                store(CacheTier::Analysis),
                store(CacheTier::Command),
                store(CacheTier::Capability),
            ],
            command_version: Mutex::new(None),
            snapshot_path: config.snapshot_path.clone(),
            sweep_interval: config.sweep_interval_secs.map(Duration::from_secs),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let estimator = CostEstimator::new(config.price_table()?);
        Ok(Self::new(config.cache.clone(), estimator))
    }

    fn tier(&self, tier: CacheTier) -> &TierStore {
        &self.tiers[tier.index()]
    }

    /// Raw bytes for `key`, counting a hit or a miss
    pub fn get(&self, tier: CacheTier, key: &CacheKey) -> Option<Vec<u8>> {
        self.tier(tier)
            .lookup(key, |bytes| Ok::<_, std::convert::Infallible>(bytes.to_vec()))
    }

    /// Deserialize a JSON value. A value that no longer decodes is evicted
    /// and counted as a miss.
    pub fn get_json<T: DeserializeOwned>(&self, tier: CacheTier, key: &CacheKey) -> Option<T> {
        self.tier(tier).lookup(key, |bytes| {
            serde_json::from_slice::<T>(bytes).map_err(|e| CacheError::Corrupt(e.to_string()))
        })
    }

    /// Store `value`, replacing any existing entry. TTL defaults to the tier's.
    pub fn set(&self, tier: CacheTier, key: &CacheKey, value: Vec<u8>, ttl: Option<Duration>) {
        self.tier(tier).insert(key, value, ttl, None);
    }

    /// Store `value` along with what it actually cost to compute, so hits
    /// credit that amount as savings
    pub fn set_with_cost(
        &self,
        tier: CacheTier,
        key: &CacheKey,
        value: Vec<u8>,
        ttl: Option<Duration>,
        recompute_cost: f64,
    ) {
        self.tier(tier)
            .insert(key, value, ttl, Some(recompute_cost.max(0.0)));
    }

    pub fn set_json<T: Serialize>(
        &self,
        tier: CacheTier,
        key: &CacheKey,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec(value)?;
        self.set(tier, key, bytes, ttl);
        Ok(())
    }

    pub fn set_json_with_cost<T: Serialize>(
        &self,
        tier: CacheTier,
        key: &CacheKey,
        value: &T,
        ttl: Option<Duration>,
        recompute_cost: f64,
    ) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec(value)?;
        self.set_with_cost(tier, key, bytes, ttl, recompute_cost);
        Ok(())
    }

    /// Returns true if an entry was removed
    pub fn invalidate(&self, tier: CacheTier, key: &CacheKey) -> bool {
        let removed = self.tier(tier).remove(key);
        if removed {
            debug!("Invalidated {} cache entry {}", tier, key);
        }
        removed
    }

    /// Record the framework version. A change clears the command tier.
    ///
    /// Returns the number of entries dropped.
    pub fn set_command_version(&self, tag: &str) -> usize {
        let mut current = self.command_version.lock().unwrap_or_else(|poisoned| {
            warn!("Command version lock poisoned, recovering");
            poisoned.into_inner()
        });

        let changed = current.as_deref().is_some_and(|previous| previous != tag);
        let cleared = if changed {
            let cleared = self.tier(CacheTier::Command).clear();
            info!(
                "Framework version changed to {}; invalidated {} command cache entries",
                tag, cleared
            );
            cleared
        } else {
            0
        };

        *current = Some(tag.to_string());
        cleared
    }

    pub fn command_version(&self) -> Option<String> {
        self.command_version
            .lock()
            .map(|v| v.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn stats(&self, tier: CacheTier) -> TierStats {
        self.tier(tier).stats()
    }

    pub fn summary(&self) -> CacheSummary {
        CacheSummary::from_tiers(CacheTier::ALL.iter().map(|t| self.stats(*t)).collect())
    }

    /// Hit count of a live entry without recording a lookup
    pub fn hit_count(&self, tier: CacheTier, key: &CacheKey) -> Option<u64> {
        self.tier(tier).hit_count(key)
    }

    /// Drop every entry and reset the counters
    pub fn clear_all(&self) -> usize {
        let cleared: usize = self
            .tiers
            .iter()
            .map(|store| {
                store.reset_metrics();
                store.clear()
            })
            .sum();
        info!("Cleared {} cache entries", cleared);
        cleared
    }

    /// Remove expired entries from every tier
    pub fn purge_expired(&self) -> usize {
        let purged: usize = self.tiers.iter().map(TierStore::purge_expired).sum();
        if purged > 0 {
            debug!("Purged {} expired cache entries", purged);
        }
        purged
    }

    /// Periodically purge expired entries until the manager is dropped.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // First tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                match weak.upgrade() {
                    Some(cache) => {
                        cache.purge_expired();
                    }
                    None => break,
                }
            }
            debug!("Cache sweeper stopped");
        })
    }

    /// Start the sweeper if `sweep_interval_secs` is configured
    pub fn spawn_configured_sweeper(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        self.sweep_interval.map(|period| self.spawn_sweeper(period))
    }

    pub fn export_records(&self) -> Vec<CacheRecord> {
        self.tiers.iter().flat_map(TierStore::records).collect()
    }

    /// Load persisted records, skipping expired ones. Returns how many were restored.
    pub fn import_records(&self, records: Vec<CacheRecord>) -> Result<usize, CacheError> {
        let mut restored = 0;
        let mut skipped = 0;
        for record in records {
            let value = record.decode_value()?;
            let tier = record.tier;
            if self.tier(tier).restore(record, value) {
                restored += 1;
            } else {
                skipped += 1;
            }
        }
        if skipped > 0 {
            debug!("Skipped {} expired cache records on import", skipped);
        }
        Ok(restored)
    }

    pub fn save_snapshot(&self, path: &Path) -> Result<(), CacheError> {
        let records = self.export_records();
        let count = records.len();
        persist::write_snapshot(path, records)?;
        info!("Saved {} cache entries to {}", count, path.display());
        Ok(())
    }

    pub fn load_snapshot(&self, path: &Path) -> Result<usize, CacheError> {
        let restored = self.import_records(persist::read_snapshot(path)?)?;
        info!("Restored {} cache entries from {}", restored, path.display());
        Ok(restored)
    }

    /// Save to the configured `snapshot_path`
    pub fn save_default_snapshot(&self) -> Result<(), CacheError> {
        let path = self.snapshot_path.as_deref().ok_or(CacheError::NoSnapshotPath)?;
        self.save_snapshot(path)
    }

    /// Load from the configured `snapshot_path`
    pub fn load_default_snapshot(&self) -> Result<usize, CacheError> {
        let path = self.snapshot_path.as_deref().ok_or(CacheError::NoSnapshotPath)?;
        self.load_snapshot(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ProjectContext;
    use serde::Deserialize;

    fn manager() -> CacheManager {
        CacheManager::new(CacheConfig::default(), CostEstimator::default())
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Analysis {
        complexity: f64,
        steps: Vec<String>,
    }

    #[test]
    fn test_miss_then_hit() {
        let cache = manager();
        let context = ProjectContext::new().with_file("src/auth.js", "abc").hash();
        let key = CacheKey::analysis("Add OAuth2 support", &context);

        assert!(cache.get(CacheTier::Analysis, &key).is_none());
        cache.set(CacheTier::Analysis, &key, b"result".to_vec(), None);
        assert_eq!(cache.get(CacheTier::Analysis, &key), Some(b"result".to_vec()));
        assert_eq!(cache.hit_count(CacheTier::Analysis, &key), Some(1));

        let stats = cache.stats(CacheTier::Analysis);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate, 0.5);
        assert_eq!(stats.entries, 1);
        assert!(stats.size_bytes >= 6);
    }

    #[test]
    fn test_context_change_misses() {
        let cache = manager();
        let before = ProjectContext::new().with_file("src/auth.js", "v1").hash();
        let after = ProjectContext::new().with_file("src/auth.js", "v2").hash();

        cache.set(
            CacheTier::Analysis,
            &CacheKey::analysis("Add OAuth2 support", &before),
            b"old".to_vec(),
            None,
        );
        assert!(cache
            .get(CacheTier::Analysis, &CacheKey::analysis("Add OAuth2 support", &after))
            .is_none());
    }

    #[test]
    fn test_tiers_are_independent() {
        let cache = manager();
        let key = CacheKey::raw("shared");
        cache.set(CacheTier::Command, &key, b"cmd".to_vec(), None);

        assert!(cache.get(CacheTier::Capability, &key).is_none());
        assert_eq!(cache.get(CacheTier::Command, &key), Some(b"cmd".to_vec()));
        assert_eq!(cache.stats(CacheTier::Capability).misses, 1);
        assert_eq!(cache.stats(CacheTier::Command).hits, 1);
    }

    #[test]
    fn test_expired_entry_is_miss_and_removed() {
        let cache = manager();
        let key = CacheKey::raw("short-lived");
        cache.set(CacheTier::Command, &key, b"x".to_vec(), Some(Duration::from_millis(20)));
        std::thread::sleep(Duration::from_millis(40));

        assert!(cache.get(CacheTier::Command, &key).is_none());
        let stats = cache.stats(CacheTier::Command);
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 0);
    }

    #[test]
    fn test_capability_entries_do_not_expire() {
        let mut config = CacheConfig::default();
        config.ttl_overrides.insert("capability".into(), 1);
        let cache = CacheManager::new(config, CostEstimator::default());
        let key = CacheKey::capability("mcp servers");
        cache.set(CacheTier::Capability, &key, b"[]".to_vec(), None);

        assert_eq!(cache.purge_expired(), 0);
        assert!(cache.get(CacheTier::Capability, &key).is_some());
    }

    #[test]
    fn test_capability_ignores_ttl_override() {
        let cache = manager();
        let key = CacheKey::capability("installed tools");
        cache.set(
            CacheTier::Capability,
            &key,
            b"[]".to_vec(),
            Some(Duration::from_millis(1)),
        );
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(cache.purge_expired(), 0);
        assert!(cache.get(CacheTier::Capability, &key).is_some());
        let records = cache.export_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].ttl_seconds, None);
    }

    #[test]
    fn test_json_round_trip_and_corruption() {
        let cache = manager();
        let key = CacheKey::raw("analysis");
        let value = Analysis {
            complexity: 0.6,
            steps: vec!["schema".into(), "routes".into()],
        };

        cache.set_json(CacheTier::Analysis, &key, &value, None).unwrap();
        assert_eq!(cache.get_json::<Analysis>(CacheTier::Analysis, &key), Some(value));

        cache.set(CacheTier::Analysis, &key, b"{not json".to_vec(), None);
        assert_eq!(cache.get_json::<Analysis>(CacheTier::Analysis, &key), None);

        let stats = cache.stats(CacheTier::Analysis);
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.corruptions, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_invalidate() {
        let cache = manager();
        let key = CacheKey::raw("k");
        cache.set(CacheTier::Command, &key, b"v".to_vec(), None);

        assert!(cache.invalidate(CacheTier::Command, &key));
        assert!(!cache.invalidate(CacheTier::Command, &key));
        assert!(cache.get(CacheTier::Command, &key).is_none());
    }

    #[test]
    fn test_savings_use_actual_cost_when_known() {
        let cache = manager();
        let key = CacheKey::raw("priced");
        cache.set_with_cost(CacheTier::Analysis, &key, b"v".to_vec(), None, 0.12);

        for _ in 0..3 {
            cache.get(CacheTier::Analysis, &key);
        }
        let savings = cache.stats(CacheTier::Analysis).estimated_savings;
        assert!((savings - 0.36).abs() < 1e-9);
    }

    #[test]
    fn test_savings_fall_back_to_tier_estimate() {
        let cache = manager();
        let key = CacheKey::raw("unpriced");
        cache.set(CacheTier::Analysis, &key, b"v".to_vec(), None);
        cache.get(CacheTier::Analysis, &key);

        // Sonnet at 8000 in / 2000 out
        let expected = CostEstimator::default()
            .estimate(crate::optimization::ModelTier::Sonnet, 8_000, 2_000)
            .estimated_cost;
        assert_eq!(cache.stats(CacheTier::Analysis).estimated_savings, expected);
    }

    #[test]
    fn test_version_change_clears_command_tier() {
        let cache = manager();
        assert_eq!(cache.set_command_version("1.0.0"), 0);

        let key = CacheKey::command("discover-skills", &["--all"], "1.0.0");
        cache.set(CacheTier::Command, &key, b"skills".to_vec(), None);
        cache.set(CacheTier::Capability, &CacheKey::raw("cap"), b"c".to_vec(), None);

        assert_eq!(cache.set_command_version("1.0.0"), 0);
        assert_eq!(cache.set_command_version("2.0.0"), 1);
        assert_eq!(cache.command_version().as_deref(), Some("2.0.0"));
        assert_eq!(cache.stats(CacheTier::Command).entries, 0);
        assert_eq!(cache.stats(CacheTier::Capability).entries, 1);
    }

    #[test]
    fn test_summary_and_clear_all() {
        let cache = manager();
        cache.set(CacheTier::Analysis, &CacheKey::raw("a"), b"1".to_vec(), None);
        cache.set(CacheTier::Command, &CacheKey::raw("b"), b"2".to_vec(), None);
        cache.get(CacheTier::Analysis, &CacheKey::raw("a"));
        cache.get(CacheTier::Command, &CacheKey::raw("missing"));

        let summary = cache.summary();
        assert_eq!(summary.tiers.len(), 3);
        assert_eq!(summary.entries, 2);
        assert_eq!(summary.hits, 1);
        assert_eq!(summary.misses, 1);
        assert_eq!(summary.hit_rate, 0.5);

        assert_eq!(cache.clear_all(), 2);
        let summary = cache.summary();
        assert_eq!(summary.entries, 0);
        assert_eq!(summary.hits, 0);
    }

    #[test]
    fn test_concurrent_writers_same_key() {
        let cache = Arc::new(manager());
        let key = CacheKey::raw("contended");

        let handles: Vec<_> = (0..8u8)
            .map(|i| {
                let cache = cache.clone();
                let key = key.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        cache.set(CacheTier::Command, &key, vec![i; 16], None);
                        if let Some(value) = cache.get(CacheTier::Command, &key) {
                            // Never a torn value
                            assert!(value.iter().all(|b| *b == value[0]));
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let stats = cache.stats(CacheTier::Command);
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.hits + stats.misses, 800);
    }

    #[tokio::test]
    async fn test_sweeper_purges_expired_entries() {
        let cache = Arc::new(manager());
        cache.set(
            CacheTier::Command,
            &CacheKey::raw("brief"),
            b"x".to_vec(),
            Some(Duration::from_millis(10)),
        );

        let handle = cache.spawn_sweeper(Duration::from_millis(25));
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(cache.stats(CacheTier::Command).entries, 0);
        assert_eq!(cache.stats(CacheTier::Command).expirations, 1);

        drop(cache);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
