//! Snapshot format for carrying cache entries across sessions

use super::keys::ContextHash;
use super::{CacheError, CacheTier};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

const SNAPSHOT_VERSION: u32 = 1;

/// One persisted cache entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub tier: CacheTier,
    pub key: String,
    /// Hex-encoded value bytes
    pub value: String,
    /// RFC 3339 on the wire
    pub created_at: DateTime<Utc>,
    pub ttl_seconds: Option<u64>,
    pub context_hash: Option<ContextHash>,
    #[serde(default)]
    pub hit_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recompute_cost: Option<f64>,
}

impl CacheRecord {
    pub fn decode_value(&self) -> Result<Vec<u8>, CacheError> {
        hex::decode(&self.value).map_err(|e| CacheError::InvalidRecord {
            key: self.key.clone(),
            reason: e.to_string(),
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    saved_at: DateTime<Utc>,
    records: Vec<CacheRecord>,
}

pub(crate) fn write_snapshot(path: &Path, records: Vec<CacheRecord>) -> Result<(), CacheError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let snapshot = Snapshot {
        version: SNAPSHOT_VERSION,
        saved_at: Utc::now(),
        records,
    };
    let content = serde_json::to_string_pretty(&snapshot)?;
    std::fs::write(path, content)?;
    Ok(())
}

pub(crate) fn read_snapshot(path: &Path) -> Result<Vec<CacheRecord>, CacheError> {
    let content = std::fs::read_to_string(path)?;
    let snapshot: Snapshot = serde_json::from_str(&content)?;
    if snapshot.version != SNAPSHOT_VERSION {
        return Err(CacheError::UnsupportedSnapshot(snapshot.version));
    }
    Ok(snapshot.records)
}
