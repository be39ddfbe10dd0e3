//! The enriched dataset file: load, ordered append, atomic persist.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::debug;

use crate::cache_store::write_atomic;
use crate::play_event::{DedupKey, EnrichedPlayEvent};

#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("failed to read dataset {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("dataset {} is not a valid play list: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to serialize dataset: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to write dataset {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Enriched plays ordered by `played_at` ascending, with no two sharing a
/// dedup key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnrichedDataset {
    events: Vec<EnrichedPlayEvent>,
    keys: HashSet<DedupKey>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetSummary {
    pub records: usize,
    pub earliest_play: Option<DateTime<Utc>>,
    pub latest_play: Option<DateTime<Utc>>,
}

impl EnrichedDataset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Orders `events` by play time (stable) and keeps the first occurrence
    /// of each dedup key.
    pub fn from_events(mut events: Vec<EnrichedPlayEvent>) -> Self {
        events.sort_by_key(|event| event.play.played_at);
        let mut dataset = Self::new();
        for event in events {
            if dataset.keys.insert(event.dedup_key()) {
                dataset.events.push(event);
            }
        }
        dataset
    }

    /// Reads the dataset file. A missing file is an empty dataset.
    pub fn load(path: &Path) -> Result<Self, DatasetError> {
        if !path.exists() {
            debug!("Dataset: {} does not exist yet", path.display());
            return Ok(Self::new());
        }
        let text = std::fs::read_to_string(path).map_err(|source| DatasetError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let events: Vec<EnrichedPlayEvent> =
            serde_json::from_str(&text).map_err(|source| DatasetError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self::from_events(events))
    }

    /// Whether `path` holds a dataset that loads cleanly.
    pub fn is_readable(path: &Path) -> bool {
        path.is_file() && Self::load(path).is_ok()
    }

    pub fn persist(&self, path: &Path) -> Result<(), DatasetError> {
        let mut bytes = serde_json::to_vec_pretty(&self.events)?;
        bytes.push(b'\n');
        write_atomic(path, &bytes).map_err(|source| DatasetError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn events(&self) -> &[EnrichedPlayEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn contains(&self, key: &DedupKey) -> bool {
        self.keys.contains(key)
    }

    pub fn latest_play(&self) -> Option<DateTime<Utc>> {
        self.events.last().map(|event| event.play.played_at)
    }

    /// Appends events whose keys are not yet present and returns how many
    /// were added. Re-sorts when an appended play predates the current tail.
    pub fn append(&mut self, events: impl IntoIterator<Item = EnrichedPlayEvent>) -> usize {
        let mut appended = 0;
        let mut needs_sort = false;
        for event in events {
            if !self.keys.insert(event.dedup_key()) {
                continue;
            }
            if let Some(tail) = self.events.last() {
                needs_sort |= event.play.played_at < tail.play.played_at;
            }
            self.events.push(event);
            appended += 1;
        }
        if needs_sort {
            self.events.sort_by_key(|event| event.play.played_at);
        }
        appended
    }

    pub fn summary(&self) -> DatasetSummary {
        DatasetSummary {
            records: self.events.len(),
            earliest_play: self.events.first().map(|event| event.play.played_at),
            latest_play: self.latest_play(),
        }
    }
}
