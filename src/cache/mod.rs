//! Context-aware result caching
//!
//! Three tiers memoize work that is expensive to redo:
//!
//! 1. **Analysis**: spec analyses, keyed by the spec text and a digest of the
//!    project context so a changed project never sees a stale analysis
//! 2. **Command**: framework command output, keyed by command, arguments and
//!    framework version
//! 3. **Capability**: tool/server capability discovery; never expires
//!
//! Each tier keeps its own expiry and hit-rate accounting. Expired entries
//! are dropped when they are looked up, and [`CacheManager::spawn_sweeper`]
//! can purge them periodically as well.

mod keys;
mod manager;
mod persist;
mod tier;

pub use keys::{CacheKey, ContextHash, ProjectContext};
pub use manager::CacheManager;
pub use persist::CacheRecord;
pub use tier::{TierMetrics, TierStats};

use crate::optimization::ModelTier;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const DAY_SECS: u64 = 24 * 60 * 60;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cached value is corrupt: {0}")]
    Corrupt(String),

    #[error("failed to serialize cache value: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid cache record {key}: {reason}")]
    InvalidRecord { key: String, reason: String },

    #[error("unsupported snapshot version {0}")]
    UnsupportedSnapshot(u32),

    #[error("no snapshot path configured")]
    NoSnapshotPath,

    #[error("snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheTier {
    Analysis,
    Command,
    Capability,
}

impl CacheTier {
    pub const ALL: [CacheTier; 3] = [CacheTier::Analysis, CacheTier::Command, CacheTier::Capability];

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheTier::Analysis => "analysis",
            CacheTier::Command => "command",
            CacheTier::Capability => "capability",
        }
    }

    /// `None` means entries never expire
    pub fn default_ttl(&self) -> Option<Duration> {
        match self {
            CacheTier::Analysis => Some(Duration::from_secs(7 * DAY_SECS)),
            CacheTier::Command => Some(Duration::from_secs(30 * DAY_SECS)),
            CacheTier::Capability => None,
        }
    }

    /// Model that would have produced an entry of this tier
    pub fn model_tier(&self) -> ModelTier {
        match self {
            CacheTier::Analysis => ModelTier::Sonnet,
            CacheTier::Command | CacheTier::Capability => ModelTier::Haiku,
        }
    }

    /// Typical (input, output) tokens of the call an entry replaces
    pub fn nominal_tokens(&self) -> (u64, u64) {
        match self {
            CacheTier::Analysis => (8_000, 2_000),
            CacheTier::Command => (2_000, 500),
            CacheTier::Capability => (1_000, 300),
        }
    }

    fn index(&self) -> usize {
        match self {
            CacheTier::Analysis => 0,
            CacheTier::Command => 1,
            CacheTier::Capability => 2,
        }
    }
}

impl fmt::Display for CacheTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "analysis" => Ok(CacheTier::Analysis),
            "command" => Ok(CacheTier::Command),
            "capability" => Ok(CacheTier::Capability),
            other => Err(format!("unknown cache tier: {}", other)),
        }
    }
}

/// Cache configuration (`[cache]` section)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Entries kept per tier before LRU eviction
    pub max_entries_per_tier: usize,
    /// Background purge interval; lazy eviction only when unset
    pub sweep_interval_secs: Option<u64>,
    /// Where `save_snapshot`/`load_snapshot` go by default
    pub snapshot_path: Option<PathBuf>,
    /// Tier name -> TTL in seconds
    pub ttl_overrides: BTreeMap<String, u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries_per_tier: 1000,
            sweep_interval_secs: None,
            snapshot_path: None,
            ttl_overrides: BTreeMap::new(),
        }
    }
}

impl CacheConfig {
    /// Effective TTL for new entries of `tier`. Capability entries never expire.
    pub fn ttl_for(&self, tier: CacheTier) -> Option<Duration> {
        if tier == CacheTier::Capability {
            return None;
        }
        self.ttl_overrides
            .iter()
            .find(|(name, _)| name.parse::<CacheTier>().ok() == Some(tier))
            .map(|(_, secs)| Duration::from_secs(*secs))
            .or_else(|| tier.default_ttl())
    }

    pub fn validate(&self) -> Result<(), String> {
        for (name, secs) in &self.ttl_overrides {
            let tier: CacheTier = name.parse()?;
            if tier == CacheTier::Capability {
                return Err("capability cache entries never expire; remove its TTL override".into());
            }
            if *secs == 0 {
                return Err(format!("TTL override for {} must be greater than zero", tier));
            }
        }
        if self.max_entries_per_tier == 0 {
            return Err("max_entries_per_tier must be greater than zero".into());
        }
        if self.sweep_interval_secs == Some(0) {
            return Err("sweep_interval_secs must be greater than zero".into());
        }
        Ok(())
    }
}

/// Statistics across all tiers
#[derive(Debug, Clone, Serialize)]
pub struct CacheSummary {
    pub tiers: Vec<TierStats>,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub entries: usize,
    pub size_bytes: usize,
    pub estimated_savings: f64,
}

impl CacheSummary {
    fn from_tiers(tiers: Vec<TierStats>) -> Self {
        let hits = tiers.iter().map(|t| t.hits).sum::<u64>();
        let misses = tiers.iter().map(|t| t.misses).sum::<u64>();
        let total = hits + misses;
        Self {
            hits,
            misses,
            hit_rate: if total > 0 { hits as f64 / total as f64 } else { 0.0 },
            entries: tiers.iter().map(|t| t.entries).sum(),
            size_bytes: tiers.iter().map(|t| t.size_bytes).sum(),
            estimated_savings: tiers.iter().map(|t| t.estimated_savings).sum(),
            tiers,
        }
    }
}

impl fmt::Display for CacheSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Cache Summary ===")?;
        for tier in &self.tiers {
            writeln!(
                f,
                "{:<11} {:>5} entries  {:>5.1}% hit rate  ${:.4} saved",
                tier.tier.as_str(),
                tier.entries,
                tier.hit_rate * 100.0,
                tier.estimated_savings
            )?;
        }
        writeln!(f, "Total hits: {}", self.hits)?;
        writeln!(f, "Total misses: {}", self.misses)?;
        writeln!(f, "Overall hit rate: {:.1}%", self.hit_rate * 100.0)?;
        writeln!(f, "Est. savings: ${:.4}", self.estimated_savings)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ttls() {
        let config = CacheConfig::default();
        assert_eq!(
            config.ttl_for(CacheTier::Analysis),
            Some(Duration::from_secs(7 * DAY_SECS))
        );
        assert_eq!(
            config.ttl_for(CacheTier::Command),
            Some(Duration::from_secs(30 * DAY_SECS))
        );
        assert_eq!(config.ttl_for(CacheTier::Capability), None);
    }

    #[test]
    fn test_ttl_overrides() {
        let mut config = CacheConfig::default();
        config.ttl_overrides.insert("analysis".into(), 60);
        config.ttl_overrides.insert("capability".into(), 60);

        assert_eq!(config.ttl_for(CacheTier::Analysis), Some(Duration::from_secs(60)));
        assert_eq!(config.ttl_for(CacheTier::Capability), None);
        assert!(config.validate().is_err());

        config.ttl_overrides.remove("capability");
        assert!(config.validate().is_ok());

        config.ttl_overrides.insert("bogus".into(), 60);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tier_parse() {
        assert_eq!("Command".parse::<CacheTier>(), Ok(CacheTier::Command));
        assert!("disk".parse::<CacheTier>().is_err());
    }
}
