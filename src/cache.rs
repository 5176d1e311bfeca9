//! Bounded, time-expiring cache of finished summaries.
//!
//! Keys are fingerprints of the generation settings plus the input text.
//! Expired entries are ignored on read but only removed when eviction picks
//! them. Eviction removes the single entry with the oldest `created_at` once
//! the tree holds more than `capacity` keys.

use crate::clock::Clock;
use crate::storage::{Storage, StorageError, TREE_CACHE};
use crate::summary::{GenerationRequest, SourceKind};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::{debug, warn};

pub const CACHE_CAPACITY: usize = 100;

pub fn cache_ttl() -> TimeDelta {
    TimeDelta::hours(24)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub title: Option<String>,
    pub summary: String,
    pub model: String,
    pub created_at: DateTime<Utc>,
    pub source_kind: SourceKind,
}

/// Compute the cache key for a request.
///
/// Non-cryptographic on purpose; a collision costs a wrong cached summary,
/// never a security decision.
pub fn fingerprint(request: &GenerationRequest) -> String {
    let persona = request
        .persona()
        .map(|p| p.to_lowercase())
        .unwrap_or_default();
    let settings = format!(
        "{}|{}|{}|{}",
        persona,
        request.language().as_str(),
        request.detail_level().as_str(),
        request.mode().as_str(),
    );

    use std::collections::hash_map::DefaultHasher;
    let mut hasher = DefaultHasher::new();
    settings.hash(&mut hasher);
    request.raw_text().trim().hash(&mut hasher);
    format!("h{:016x}", hasher.finish())
}

pub struct ResultCache {
    tree: sled::Tree,
    clock: Arc<dyn Clock>,
    capacity: usize,
    ttl: TimeDelta,
}

impl ResultCache {
    pub fn open(storage: &Storage, clock: Arc<dyn Clock>) -> Result<Self, StorageError> {
        Self::with_limits(storage, clock, CACHE_CAPACITY, cache_ttl())
    }

    pub fn with_limits(
        storage: &Storage,
        clock: Arc<dyn Clock>,
        capacity: usize,
        ttl: TimeDelta,
    ) -> Result<Self, StorageError> {
        Ok(Self {
            tree: storage.tree(TREE_CACHE)?,
            clock,
            capacity: capacity.max(1),
            ttl,
        })
    }

    /// Look up a live entry. Stale entries read as absent and stay on disk.
    pub fn get(&self, fingerprint: &str) -> Result<Option<CacheEntry>, StorageError> {
        let Some(bytes) = self.tree.get(fingerprint.as_bytes())? else {
            return Ok(None);
        };
        let entry: CacheEntry = serde_json::from_slice(&bytes)?;
        if self.clock.now() - entry.created_at >= self.ttl {
            debug!(key = fingerprint, "cache entry expired");
            return Ok(None);
        }
        Ok(Some(entry))
    }

    /// Insert or overwrite, then evict the oldest entry if over capacity.
    pub fn put(&self, fingerprint: &str, entry: &CacheEntry) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(entry)?;
        self.tree.insert(fingerprint.as_bytes(), bytes)?;
        if self.tree.len() > self.capacity {
            self.evict_oldest()?;
        }
        self.tree.flush()?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    fn evict_oldest(&self) -> Result<(), StorageError> {
        let mut oldest: Option<(sled::IVec, Option<DateTime<Utc>>)> = None;
        for item in self.tree.iter() {
            let (key, value) = item?;
            // Undecodable entries sort before everything else.
            let created_at = serde_json::from_slice::<CacheEntry>(&value)
                .ok()
                .map(|e| e.created_at);
            let older = match &oldest {
                None => true,
                Some((_, current)) => created_at < *current,
            };
            if older {
                oldest = Some((key, created_at));
            }
        }
        if let Some((key, created_at)) = oldest {
            if created_at.is_none() {
                warn!("evicting undecodable cache entry");
            }
            self.tree.remove(key)?;
        }
        Ok(())
    }
}
