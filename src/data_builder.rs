//! Full rebuild of the enriched dataset from streaming-history exports.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::dataset_store::EnrichedDataset;
use crate::enrichment::{Enricher, EnrichmentStats};
use crate::error::PipelineError;
use crate::play_event::{PlayEvent, RawExportRecord};

pub const EXPORT_FILE_PREFIX: &str = "Streaming_History_Audio_";
pub const EXPORT_FILE_EXTENSION: &str = "json";

pub fn is_export_file(path: &Path) -> bool {
    let has_prefix = path
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with(EXPORT_FILE_PREFIX));
    let has_extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(EXPORT_FILE_EXTENSION));
    has_prefix && has_extension
}

/// Export files directly inside `directory`, sorted by path.
pub fn discover_export_files(directory: &Path) -> Vec<PathBuf> {
    let entries = match std::fs::read_dir(directory) {
        Ok(entries) => entries,
        Err(err) => {
            debug!("Failed to read directory {}: {}", directory.display(), err);
            return Vec::new();
        }
    };

    let mut files = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                debug!(
                    "Failed to read a directory entry in {}: {}",
                    directory.display(),
                    err
                );
                continue;
            }
        };
        let path = entry.path();
        if path.is_file() && is_export_file(&path) {
            files.push(path);
        }
    }
    files.sort_unstable();
    files
}

/// Expands explicitly given paths: files are taken as-is, directories are
/// scanned for export files.
pub fn collect_export_files(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut files = BTreeSet::new();
    for path in paths {
        if path.is_dir() {
            files.extend(discover_export_files(path));
        } else {
            files.insert(path.clone());
        }
    }
    files.into_iter().collect()
}

/// The files a build reads: `explicit` when given, else the raw-history
/// directory. Finding nothing is an error.
pub fn resolve_export_files(
    raw_history_dir: &Path,
    explicit: &[PathBuf],
) -> Result<Vec<PathBuf>, PipelineError> {
    let files = if explicit.is_empty() {
        discover_export_files(raw_history_dir)
    } else {
        collect_export_files(explicit)
    };
    if files.is_empty() {
        let searched = explicit
            .first()
            .cloned()
            .unwrap_or_else(|| raw_history_dir.to_path_buf());
        return Err(PipelineError::NoExports(searched));
    }
    Ok(files)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseReport {
    pub files_read: usize,
    pub files_skipped: usize,
    pub plays: usize,
    pub malformed: usize,
    pub short_plays: usize,
}

/// Parses one export document. Malformed records and plays shorter than
/// `min_ms_played` are counted and skipped; only a document that is not a
/// JSON array fails.
pub fn parse_export(
    text: &str,
    min_ms_played: u64,
    report: &mut ParseReport,
) -> Result<Vec<PlayEvent>, serde_json::Error> {
    let records: Vec<serde_json::Value> = serde_json::from_str(text)?;
    let mut plays = Vec::with_capacity(records.len());
    for (index, value) in records.into_iter().enumerate() {
        let play = RawExportRecord::from_value(value).and_then(RawExportRecord::into_play_event);
        match play {
            Ok(play) if play.ms_played < min_ms_played => {
                report.short_plays += 1;
            }
            Ok(play) => {
                report.plays += 1;
                plays.push(play);
            }
            Err(err) => {
                debug!("Builder: skipping malformed record #{}: {}", index, err);
                report.malformed += 1;
            }
        }
    }
    Ok(plays)
}

/// Reads every file in order, concatenating their plays. Unreadable files are
/// skipped with a warning.
pub fn read_export_files(files: &[PathBuf], min_ms_played: u64) -> (Vec<PlayEvent>, ParseReport) {
    let mut report = ParseReport::default();
    let mut plays = Vec::new();
    for path in files {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) => {
                warn!("Builder: skipping unreadable export {}: {}", path.display(), err);
                report.files_skipped += 1;
                continue;
            }
        };
        match parse_export(&text, min_ms_played, &mut report) {
            Ok(file_plays) => {
                debug!(
                    "Builder: {} plays from {}",
                    file_plays.len(),
                    path.display()
                );
                report.files_read += 1;
                plays.extend(file_plays);
            }
            Err(err) => {
                warn!("Builder: skipping unparsable export {}: {}", path.display(), err);
                report.files_skipped += 1;
            }
        }
    }
    (plays, report)
}

/// Stable-sorts by play time and drops later occurrences of a dedup key.
pub fn merge_plays(mut plays: Vec<PlayEvent>) -> Vec<PlayEvent> {
    plays.sort_by_key(|play| play.played_at);
    let mut seen = HashSet::with_capacity(plays.len());
    plays.retain(|play| seen.insert(play.dedup_key()));
    plays
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildReport {
    pub parse: ParseReport,
    pub unique_plays: usize,
    pub enrichment: EnrichmentStats,
}

/// Builds the complete dataset from `files`. Fails when none of them could be
/// read or on an authentication failure; the caller persists caches either way.
pub fn build_dataset(
    files: &[PathBuf],
    min_ms_played: u64,
    enricher: &mut Enricher<'_>,
) -> Result<(EnrichedDataset, BuildReport), PipelineError> {
    let (plays, parse) = read_export_files(files, min_ms_played);
    if parse.files_read == 0 {
        return Err(PipelineError::NoReadableExports(parse.files_skipped));
    }
    let plays = merge_plays(plays);
    info!(
        "Builder: {} unique plays from {} files ({} malformed, {} short, {} files skipped)",
        plays.len(),
        parse.files_read,
        parse.malformed,
        parse.short_plays,
        parse.files_skipped
    );

    let unique_plays = plays.len();
    let mut enriched = Vec::with_capacity(unique_plays);
    for (index, play) in plays.into_iter().enumerate() {
        enriched.push(enricher.enrich(play)?);
        if (index + 1) % 500 == 0 {
            info!("Builder: enriched {}/{}", index + 1, unique_plays);
        }
    }
    enricher.log_summary("build");

    let report = BuildReport {
        parse,
        unique_plays,
        enrichment: enricher.stats(),
    };
    Ok((EnrichedDataset::from_events(enriched), report))
}
