//! Detail-tree artifact cache.
//!
//! Decoding a packet's detail tree means running the decoder again, so trees
//! are kept here keyed by packet index. All keys live in one scope (source
//! identity plus display filter); moving to a different scope drops every
//! entry at once, since a filter can change tree contents.
//!
//! Entries are `Arc`s: evicting one never invalidates a tree a caller is
//! still holding.

mod persist;

pub use persist::{cache_file_name, PersistedCache, FORMAT_VERSION};

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::model::{DetailArtifact, PacketRange};

/// Identity of the source plus the filter the trees were decoded under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheScope {
    pub source: String,
    pub filter: String,
}

impl CacheScope {
    pub fn new(source: impl Into<String>, filter: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            filter: filter.into(),
        }
    }
}

/// Size and modification time of a capture file, used to decide whether a
/// persisted cache still describes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFingerprint {
    pub len: u64,
    pub modified_secs: u64,
    pub modified_nanos: u32,
}

impl SourceFingerprint {
    pub fn of(path: &Path) -> std::io::Result<Self> {
        let metadata = std::fs::metadata(path)?;
        let modified = metadata
            .modified()?
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Ok(Self {
            len: metadata.len(),
            modified_secs: modified.as_secs(),
            modified_nanos: modified.subsec_nanos(),
        })
    }
}

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
    pub bytes: usize,
    pub max_entries: usize,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Entry {
    artifact: Arc<DetailArtifact>,
    size: usize,
    last_access: u64,
}

#[derive(Default)]
struct Inner {
    scope: Option<CacheScope>,
    entries: HashMap<u64, Entry>,
    /// last_access -> index, oldest first
    recency: BTreeMap<u64, u64>,
    clock: u64,
    bytes: usize,
}

impl Inner {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn touch(&mut self, index: u64) -> Option<Arc<DetailArtifact>> {
        let now = self.tick();
        let entry = self.entries.get_mut(&index)?;
        self.recency.remove(&entry.last_access);
        entry.last_access = now;
        self.recency.insert(now, index);
        Some(entry.artifact.clone())
    }

    fn remove(&mut self, index: u64) -> Option<Entry> {
        let entry = self.entries.remove(&index)?;
        self.recency.remove(&entry.last_access);
        self.bytes -= entry.size;
        Some(entry)
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.recency.clear();
        self.bytes = 0;
    }
}

/// LRU cache of detail trees bounded by entry count and, optionally, bytes.
pub struct ArtifactCache {
    max_entries: usize,
    max_bytes: Option<usize>,
    inner: Mutex<Inner>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl ArtifactCache {
    pub fn new(max_entries: usize, max_bytes: Option<usize>) -> Self {
        Self {
            max_entries: max_entries.max(1),
            max_bytes,
            inner: Mutex::new(Inner::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.max_entries, config.max_bytes)
    }

    pub fn scope(&self) -> Option<CacheScope> {
        self.inner.lock().scope.clone()
    }

    /// Switch to `scope`. Returns true when entries of another scope were dropped.
    pub fn rescope(&self, scope: CacheScope) -> bool {
        let mut inner = self.inner.lock();
        if inner.scope.as_ref() == Some(&scope) {
            return false;
        }
        let dropped = inner.entries.len();
        inner.clear();
        info!(
            "Artifact cache now scoped to {} [{}], dropped {} entries",
            scope.source, scope.filter, dropped
        );
        inner.scope = Some(scope);
        dropped > 0
    }

    pub fn get(&self, index: u64) -> Option<Arc<DetailArtifact>> {
        let found = self.inner.lock().touch(index);
        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    /// Like `get`, but misses unless the cache is scoped to `scope`
    pub fn get_scoped(&self, scope: &CacheScope, index: u64) -> Option<Arc<DetailArtifact>> {
        let found = {
            let mut inner = self.inner.lock();
            if inner.scope.as_ref() == Some(scope) {
                inner.touch(index)
            } else {
                None
            }
        };
        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    /// Every tree in `range`, or `None` if any is missing
    pub fn get_range(&self, range: PacketRange) -> Option<Vec<Arc<DetailArtifact>>> {
        let mut inner = self.inner.lock();
        let mut out = Vec::with_capacity(range.len() as usize);
        for index in range.start..range.end {
            match inner.touch(index) {
                Some(artifact) => out.push(artifact),
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            }
        }
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(out)
    }

    /// Whether `index` is cached, without counting as an access
    pub fn contains(&self, index: u64) -> bool {
        self.inner.lock().entries.contains_key(&index)
    }

    /// Insert or replace the tree for its packet index, evicting as needed.
    pub fn put(&self, artifact: Arc<DetailArtifact>) {
        let mut inner = self.inner.lock();
        self.insert_locked(&mut inner, artifact);
    }

    /// Insert only if the cache is still scoped to `scope`.
    ///
    /// Decodes that finish after a filter change must not land in the new scope.
    pub fn put_scoped(&self, scope: &CacheScope, artifact: Arc<DetailArtifact>) -> bool {
        let mut inner = self.inner.lock();
        if inner.scope.as_ref() != Some(scope) {
            debug!("Discarding tree for packet {} from an old scope", artifact.index);
            return false;
        }
        self.insert_locked(&mut inner, artifact);
        true
    }

    fn insert_locked(&self, inner: &mut Inner, artifact: Arc<DetailArtifact>) {
        let index = artifact.index;
        inner.remove(index);

        let size = artifact.estimated_size();
        let now = inner.tick();
        inner.entries.insert(
            index,
            Entry {
                artifact,
                size,
                last_access: now,
            },
        );
        inner.recency.insert(now, index);
        inner.bytes += size;

        while inner.entries.len() > 1 && self.over_budget(inner) {
            let Some((_, oldest)) = inner.recency.pop_first() else {
                break;
            };
            if let Some(entry) = inner.entries.remove(&oldest) {
                inner.bytes -= entry.size;
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!("Evicted tree for packet {}", oldest);
            }
        }
    }

    fn over_budget(&self, inner: &Inner) -> bool {
        inner.entries.len() > self.max_entries
            || self.max_bytes.map_or(false, |max| inner.bytes > max)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry and forget the scope
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.clear();
        inner.scope = None;
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: inner.entries.len(),
            bytes: inner.bytes,
            max_entries: self.max_entries,
        }
    }

    /// Entries from least to most recently used
    fn snapshot(&self) -> (Option<CacheScope>, Vec<Arc<DetailArtifact>>) {
        let inner = self.inner.lock();
        let artifacts = inner
            .recency
            .values()
            .filter_map(|index| inner.entries.get(index))
            .map(|entry| entry.artifact.clone())
            .collect();
        (inner.scope.clone(), artifacts)
    }

    /// Write the current scope's entries under `dir`.
    ///
    /// Returns the file written, or `None` when there is nothing to persist.
    pub fn persist(&self, dir: &Path, fingerprint: &SourceFingerprint) -> Result<Option<PathBuf>, CacheError> {
        let (scope, artifacts) = self.snapshot();
        let Some(scope) = scope else {
            return Ok(None);
        };
        if artifacts.is_empty() {
            return Ok(None);
        }
        std::fs::create_dir_all(dir)?;
        let path = dir.join(cache_file_name(&scope));
        persist::write(&path, &scope, fingerprint, &artifacts)?;
        info!("Persisted {} trees to {}", artifacts.len(), path.display());
        Ok(Some(path))
    }

    /// Scope to `scope` and load its persisted entries, if a file for it under
    /// `dir` still matches `fingerprint`. Returns how many entries were loaded.
    pub fn restore(&self, dir: &Path, scope: &CacheScope, fingerprint: &SourceFingerprint) -> usize {
        self.rescope(scope.clone());
        let path = dir.join(cache_file_name(scope));
        let Some(persisted) = persist::read_validated(&path, scope, fingerprint) else {
            return 0;
        };
        let count = persisted.artifacts.len();
        let mut inner = self.inner.lock();
        for artifact in persisted.artifacts {
            self.insert_locked(&mut inner, Arc::new(artifact));
        }
        info!("Restored {} trees from {}", count, path.display());
        count
    }
}

impl std::fmt::Debug for ArtifactCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("ArtifactCache")
            .field("max_entries", &self.max_entries)
            .field("max_bytes", &self.max_bytes)
            .field("entries", &stats.entries)
            .field("bytes", &stats.bytes)
            .field("hit_ratio", &format!("{:.2}%", stats.hit_ratio() * 100.0))
            .finish()
    }
}
