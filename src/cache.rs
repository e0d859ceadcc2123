//! Upload cache: fingerprint → previously uploaded remote location.
//!
//! The cache is the deduplication gate of a pipeline run. It is an explicit
//! value, constructed once per session (usually via [`UploadCache::open`]),
//! shared as `Arc<UploadCache>`, and flushed with [`UploadCache::save_to`] at
//! whatever boundary the host chooses.
//!
//! ## Concurrency
//!
//! Entries live in an immutable map behind an `Arc`. Readers clone the `Arc`
//! and look up against that stable snapshot; writers take the write lock only
//! long enough to swap in a copy with the new entry. [`UploadCache::record`]
//! is first-writer-wins: once a fingerprint has an entry, later records for
//! the same fingerprint return the existing entry untouched.
//!
//! ## Persistence
//!
//! [`CachePersistence`] is the load/save boundary. [`JsonFileStore`] keeps a
//! versioned JSON manifest; an unreadable or mismatched manifest is reported
//! as [`CacheError::Corruption`] and `open` starts empty instead of failing.

use crate::error::{CacheError, StorageError};
use crate::fingerprint::Fingerprint;
use crate::fsutil::write_atomic;
use crate::storage::StorageBackend;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// Bump to invalidate every persisted cache when the format changes.
pub const MANIFEST_VERSION: u32 = 1;

/// Where a fingerprint's bytes were uploaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub remote_url: String,
    pub remote_key: String,
    pub uploaded_at: DateTime<Utc>,
    /// Identifier of the backend that holds the object.
    pub backend: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_key: Option<String>,
}

/// Outcome of [`UploadCache::record`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    /// No entry existed; the given one was stored.
    Inserted(CacheEntry),
    /// An entry already existed and was kept.
    Existing(CacheEntry),
}

impl Recorded {
    /// The entry now held by the cache, whichever writer won.
    pub fn entry(&self) -> &CacheEntry {
        match self {
            Recorded::Inserted(e) | Recorded::Existing(e) => e,
        }
    }

    pub fn into_entry(self) -> CacheEntry {
        match self {
            Recorded::Inserted(e) | Recorded::Existing(e) => e,
        }
    }
}

type EntryMap = HashMap<Fingerprint, CacheEntry>;

/// Process-wide fingerprint → [`CacheEntry`] map.
#[derive(Debug, Default)]
pub struct UploadCache {
    entries: RwLock<Arc<EntryMap>>,
}

impl UploadCache {
    /// An empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache pre-populated with `entries`.
    pub fn from_entries(entries: impl IntoIterator<Item = (Fingerprint, CacheEntry)>) -> Self {
        Self {
            entries: RwLock::new(Arc::new(entries.into_iter().collect())),
        }
    }

    /// Load from `store`, starting empty if the persisted state is corrupt.
    ///
    /// Durability is best-effort: losing the cache costs re-uploads, never
    /// correctness.
    pub fn open(store: &dyn CachePersistence) -> Self {
        match store.load() {
            Ok(entries) => {
                info!("Loaded upload cache: {} entries", entries.len());
                Self::from_entries(entries)
            }
            Err(e) => {
                warn!("Upload cache unusable, starting empty: {}", e);
                Self::new()
            }
        }
    }

    /// Persist the current contents to `store`.
    pub fn save_to(&self, store: &dyn CachePersistence) -> Result<(), CacheError> {
        let snapshot = self.snapshot();
        store.save(&snapshot)?;
        debug!("Saved upload cache: {} entries", snapshot.len());
        Ok(())
    }

    /// A stable, immutable view of every entry at this instant.
    pub fn snapshot(&self) -> Arc<EntryMap> {
        Arc::clone(&self.entries.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        self.snapshot().get(fingerprint).cloned()
    }

    /// Store `entry` unless `fingerprint` already has one (first writer wins).
    pub fn record(&self, fingerprint: Fingerprint, entry: CacheEntry) -> Recorded {
        let mut guard = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = guard.get(&fingerprint) {
            debug!("Cache already holds {:?}; keeping existing entry", fingerprint);
            return Recorded::Existing(existing.clone());
        }
        Arc::make_mut(&mut guard).insert(fingerprint, entry.clone());
        debug!("Cache recorded {:?} → {}", fingerprint, entry.remote_url);
        Recorded::Inserted(entry)
    }

    /// Fingerprint whose original or thumbnail is stored under `key`.
    pub fn owner_of_key(&self, key: &str) -> Option<Fingerprint> {
        self.snapshot()
            .iter()
            .find(|(_, e)| e.remote_key == key || e.thumbnail_key.as_deref() == Some(key))
            .map(|(fp, _)| *fp)
    }

    /// Remove and return the entry for `fingerprint`.
    pub fn invalidate(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        let mut guard = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if !guard.contains_key(fingerprint) {
            return None;
        }
        Arc::make_mut(&mut guard).remove(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delete the remote objects for `fingerprint` and, only once the backend
    /// confirms, drop the cache entry.
    ///
    /// Returns `Ok(None)` when nothing is cached for the fingerprint. An entry
    /// recorded by a different backend is refused and left in place.
    pub async fn purge(
        &self,
        fingerprint: &Fingerprint,
        backend: &dyn StorageBackend,
    ) -> Result<Option<CacheEntry>, StorageError> {
        let Some(entry) = self.lookup(fingerprint) else {
            return Ok(None);
        };
        if entry.backend != backend.identifier() {
            return Err(StorageError::BackendRejected {
                status: None,
                detail: format!(
                    "entry was uploaded to '{}', not '{}'",
                    entry.backend,
                    backend.identifier()
                ),
            });
        }
        backend.delete(&entry.remote_key).await?;
        if let Some(thumb) = &entry.thumbnail_key {
            backend.delete(thumb).await?;
        }
        info!("Purged {} ({})", entry.remote_key, fingerprint);
        Ok(self.invalidate(fingerprint))
    }
}

// ── Persistence ──────────────────────────────────────────────────────────────

/// Load/save boundary for the upload cache.
pub trait CachePersistence: Send + Sync {
    /// Every known entry. A store that has never been saved returns an empty
    /// map, not an error.
    fn load(&self) -> Result<EntryMap, CacheError>;

    /// Replace the persisted state with `entries`.
    fn save(&self, entries: &EntryMap) -> Result<(), CacheError>;
}

#[derive(Serialize, Deserialize)]
struct Manifest {
    version: u32,
    entries: BTreeMap<Fingerprint, CacheEntry>,
}

/// Versioned JSON manifest on the local filesystem, saved atomically.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CachePersistence for JsonFileStore {
    fn load(&self) -> Result<EntryMap, CacheError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(EntryMap::new()),
            Err(e) => {
                return Err(CacheError::Io {
                    path: self.path.clone(),
                    source: e,
                })
            }
        };
        let manifest: Manifest = serde_json::from_str(&content)
            .map_err(|e| CacheError::Corruption(format!("{}: {}", self.path.display(), e)))?;
        if manifest.version != MANIFEST_VERSION {
            return Err(CacheError::Corruption(format!(
                "{}: manifest version {} (expected {})",
                self.path.display(),
                manifest.version,
                MANIFEST_VERSION
            )));
        }
        Ok(manifest.entries.into_iter().collect())
    }

    fn save(&self, entries: &EntryMap) -> Result<(), CacheError> {
        let manifest = Manifest {
            version: MANIFEST_VERSION,
            entries: entries.iter().map(|(k, v)| (*k, v.clone())).collect(),
        };
        let json = serde_json::to_vec_pretty(&manifest)?;
        write_atomic(&self.path, &json).map_err(|e| CacheError::Io {
            path: self.path.clone(),
            source: e,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::fingerprint;
    use std::fs;
    use tempfile::TempDir;

    fn entry(url: &str) -> CacheEntry {
        CacheEntry {
            remote_url: url.to_string(),
            remote_key: url.rsplit('/').next().unwrap_or(url).to_string(),
            uploaded_at: Utc::now(),
            backend: "local".into(),
            thumbnail_url: None,
            thumbnail_key: None,
        }
    }

    #[test]
    fn lookup_misses_then_hits() {
        let cache = UploadCache::new();
        let fp = fingerprint(b"a");
        assert!(cache.lookup(&fp).is_none());
        cache.record(fp, entry("https://cdn/a.png"));
        assert_eq!(cache.lookup(&fp).unwrap().remote_url, "https://cdn/a.png");
    }

    #[test]
    fn record_is_first_writer_wins() {
        let cache = UploadCache::new();
        let fp = fingerprint(b"a");
        let first = cache.record(fp, entry("https://cdn/first.png"));
        assert!(matches!(first, Recorded::Inserted(_)));

        let second = cache.record(fp, entry("https://cdn/second.png"));
        assert!(matches!(second, Recorded::Existing(_)));
        assert_eq!(second.entry().remote_url, "https://cdn/first.png");
        assert_eq!(cache.lookup(&fp).unwrap().remote_url, "https://cdn/first.png");
    }

    #[test]
    fn snapshot_is_stable_across_writes() {
        let cache = UploadCache::new();
        let before = cache.snapshot();
        cache.record(fingerprint(b"a"), entry("https://cdn/a.png"));
        assert!(before.is_empty());
        assert_eq!(cache.snapshot().len(), 1);
    }

    #[test]
    fn owner_of_key_matches_originals_and_thumbnails() {
        let cache = UploadCache::new();
        let fp = fingerprint(b"a");
        let mut e = entry("https://cdn/a.png");
        e.thumbnail_key = Some("thumbs/a.jpg".into());
        cache.record(fp, e);
        assert_eq!(cache.owner_of_key("a.png"), Some(fp));
        assert_eq!(cache.owner_of_key("thumbs/a.jpg"), Some(fp));
        assert_eq!(cache.owner_of_key("b.png"), None);
    }

    #[test]
    fn invalidate_removes_entry() {
        let cache = UploadCache::new();
        let fp = fingerprint(b"a");
        cache.record(fp, entry("https://cdn/a.png"));
        assert!(cache.invalidate(&fp).is_some());
        assert!(cache.lookup(&fp).is_none());
        assert!(cache.invalidate(&fp).is_none());
    }

    #[test]
    fn concurrent_records_for_one_key_keep_a_single_winner() {
        let cache = Arc::new(UploadCache::new());
        let fp = fingerprint(b"shared");
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || cache.record(fp, entry(&format!("https://cdn/{i}.png"))))
            })
            .collect();
        let outcomes: Vec<Recorded> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let inserted = outcomes
            .iter()
            .filter(|r| matches!(r, Recorded::Inserted(_)))
            .count();
        assert_eq!(inserted, 1);
        let winner = cache.lookup(&fp).unwrap();
        assert!(outcomes.iter().all(|r| r.entry() == &winner));
    }

    #[test]
    fn save_and_reopen_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let store = JsonFileStore::new(tmp.path().join("cache.json"));
        let cache = UploadCache::new();
        let fp = fingerprint(b"a");
        cache.record(fp, entry("https://cdn/a.png"));
        cache.save_to(&store).unwrap();

        let reopened = UploadCache::open(&store);
        assert_eq!(reopened.lookup(&fp), cache.lookup(&fp));

        // First-writer-wins survives the reload.
        let again = reopened.record(fp, entry("https://cdn/other.png"));
        assert!(matches!(again, Recorded::Existing(_)));
    }

    #[test]
    fn missing_manifest_loads_empty() {
        let tmp = TempDir::new().unwrap();
        let store = JsonFileStore::new(tmp.path().join("absent.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn corrupt_manifest_is_corruption_and_opens_empty() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("cache.json");
        fs::write(&path, "{ not json").unwrap();
        let store = JsonFileStore::new(&path);
        assert!(matches!(store.load(), Err(CacheError::Corruption(_))));
        assert!(UploadCache::open(&store).is_empty());
    }

    #[test]
    fn wrong_version_is_corruption() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("cache.json");
        fs::write(
            &path,
            format!(r#"{{"version": {}, "entries": {{}}}}"#, MANIFEST_VERSION + 1),
        )
        .unwrap();
        assert!(matches!(
            JsonFileStore::new(&path).load(),
            Err(CacheError::Corruption(_))
        ));
    }
}
