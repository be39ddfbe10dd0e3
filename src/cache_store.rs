//! Flat key/value caches for enrichment lookups.
//!
//! Callers only see [`KeyValueStore`]; the JSON-file implementation loads the
//! whole file up front and rewrites it atomically on `persist`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::play_event::AudioFeatures;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("failed to write cache file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize cache {}: {source}", path.display())]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// A cached lookup result and when it was fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub value: T,
    pub updated: DateTime<Utc>,
}

impl<T> CacheEntry<T> {
    pub fn new(value: T, updated: DateTime<Utc>) -> Self {
        Self { value, updated }
    }
}

/// Artist name -> genres. An empty list records a conclusive "no genres".
pub type GenreEntry = CacheEntry<Vec<String>>;
/// Track id -> image URL. `None` records a conclusive "no artwork".
pub type ArtworkEntry = CacheEntry<Option<String>>;
/// Track id -> audio features. `None` records a conclusive "no analysis".
pub type AudioFeaturesEntry = CacheEntry<Option<AudioFeatures>>;

/// Mapping interface shared by every cache backend.
pub trait KeyValueStore<V> {
    fn get(&self, key: &str) -> Option<V>;
    fn put(&mut self, key: String, value: V);
    fn retain(&mut self, keep: &mut dyn FnMut(&str, &V) -> bool);
    fn len(&self) -> usize;
    /// Writes pending changes to the backing medium.
    fn persist(&mut self) -> Result<(), CacheError>;
}

/// Cache kept only in memory.
#[cfg(test)]
#[derive(Debug, Clone)]
pub struct MemoryStore<V> {
    entries: BTreeMap<String, V>,
}

#[cfg(test)]
impl<V> Default for MemoryStore<V> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
impl<V: Clone> MemoryStore<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: impl IntoIterator<Item = (String, V)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }
}

#[cfg(test)]
impl<V: Clone> KeyValueStore<V> for MemoryStore<V> {
    fn get(&self, key: &str) -> Option<V> {
        self.entries.get(key).cloned()
    }

    fn put(&mut self, key: String, value: V) {
        self.entries.insert(key, value);
    }

    fn retain(&mut self, keep: &mut dyn FnMut(&str, &V) -> bool) {
        self.entries.retain(|key, value| keep(key, value));
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn persist(&mut self) -> Result<(), CacheError> {
        Ok(())
    }
}

/// Cache backed by a single JSON object file.
pub struct JsonFileStore<V> {
    path: PathBuf,
    entries: BTreeMap<String, V>,
    dirty: bool,
}

impl<V> JsonFileStore<V>
where
    V: Clone + Serialize + DeserializeOwned,
{
    /// Loads `path` fully into memory. A missing or unreadable file yields an
    /// empty cache.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<BTreeMap<String, V>>(&bytes) {
                Ok(entries) => {
                    debug!(
                        "Cache: loaded {} entries from {}",
                        entries.len(),
                        path.display()
                    );
                    entries
                }
                Err(err) => {
                    warn!(
                        "Cache: ignoring unreadable cache file {}: {}",
                        path.display(),
                        err
                    );
                    BTreeMap::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!("Cache: no cache file yet at {}", path.display());
                BTreeMap::new()
            }
            Err(err) => {
                warn!("Cache: failed to read {}: {}", path.display(), err);
                BTreeMap::new()
            }
        };
        Self {
            path,
            entries,
            dirty: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            file_size_bytes: fs::metadata(&self.path).map(|meta| meta.len()).unwrap_or(0),
        }
    }
}

impl<V> KeyValueStore<V> for JsonFileStore<V>
where
    V: Clone + Serialize + DeserializeOwned,
{
    fn get(&self, key: &str) -> Option<V> {
        self.entries.get(key).cloned()
    }

    fn put(&mut self, key: String, value: V) {
        self.entries.insert(key, value);
        self.dirty = true;
    }

    fn retain(&mut self, keep: &mut dyn FnMut(&str, &V) -> bool) {
        let before = self.entries.len();
        self.entries.retain(|key, value| keep(key, value));
        if self.entries.len() != before {
            self.dirty = true;
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn persist(&mut self) -> Result<(), CacheError> {
        if !self.dirty {
            return Ok(());
        }
        let bytes =
            serde_json::to_vec_pretty(&self.entries).map_err(|source| CacheError::Serialize {
                path: self.path.clone(),
                source,
            })?;
        write_atomic(&self.path, &bytes).map_err(|source| CacheError::Io {
            path: self.path.clone(),
            source,
        })?;
        self.dirty = false;
        debug!(
            "Cache: wrote {} entries to {}",
            self.entries.len(),
            self.path.display()
        );
        Ok(())
    }
}

/// Writes `bytes` next to `target` and renames over it, so readers only ever
/// see the old or the new file.
pub fn write_atomic(target: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = target.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut temp_name = target.as_os_str().to_owned();
    temp_name.push(".tmp");
    let temp_path = PathBuf::from(temp_name);
    if temp_path.exists() {
        let _ = fs::remove_file(&temp_path);
    }
    if let Err(err) = fs::write(&temp_path, bytes) {
        let _ = fs::remove_file(&temp_path);
        return Err(err);
    }
    if let Err(err) = fs::rename(&temp_path, target) {
        let _ = fs::remove_file(&temp_path);
        return Err(err);
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub file_size_bytes: u64,
}

/// Drops entries fetched before `now - max_age_days`. Returns how many went.
pub fn prune_older_than<T, S>(
    store: &mut S,
    max_age_days: u32,
    now: DateTime<Utc>,
) -> usize
where
    S: KeyValueStore<CacheEntry<T>> + ?Sized,
{
    let cutoff = now - ChronoDuration::days(i64::from(max_age_days));
    let before = store.len();
    store.retain(&mut |_, entry| entry.updated >= cutoff);
    before.saturating_sub(store.len())
}
