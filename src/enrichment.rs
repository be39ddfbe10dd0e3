//! Cache-first enrichment of play events.
//!
//! Every field is resolved independently: cache hit, else one API lookup under
//! the retry policy. Lookups that fail for any reason other than rejected
//! credentials leave the field empty and the play is kept.

use std::collections::HashSet;

use chrono::Utc;
use log::{debug, info, warn};

use crate::backends::{ApiError, MusicApi};
use crate::cache_store::{ArtworkEntry, AudioFeaturesEntry, CacheEntry, GenreEntry, KeyValueStore};
use crate::config::EnrichmentConfig;
use crate::error::PipelineError;
use crate::play_event::{EnrichedPlayEvent, PlayEvent};
use crate::retry::RetryPolicy;

/// Which fields to resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnrichmentOptions {
    pub genres: bool,
    pub artwork: bool,
    pub audio_features: bool,
}

impl Default for EnrichmentOptions {
    fn default() -> Self {
        Self {
            genres: true,
            artwork: true,
            audio_features: false,
        }
    }
}

impl From<&EnrichmentConfig> for EnrichmentOptions {
    fn from(config: &EnrichmentConfig) -> Self {
        Self {
            genres: config.genres,
            artwork: config.artwork,
            audio_features: config.audio_features,
        }
    }
}

/// The caches an enricher reads from and writes to.
pub struct EnrichmentStores<'a> {
    pub genres: &'a mut dyn KeyValueStore<GenreEntry>,
    pub artwork: &'a mut dyn KeyValueStore<ArtworkEntry>,
    pub audio_features: &'a mut dyn KeyValueStore<AudioFeaturesEntry>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnrichmentStats {
    pub cache_hits: usize,
    pub fetched: usize,
    pub not_found: usize,
    pub failed: usize,
    /// Cache misses left empty because no API client was available.
    pub offline_misses: usize,
}

#[derive(Default)]
struct FailedKeys {
    artists: HashSet<String>,
    artwork: HashSet<String>,
    audio_features: HashSet<String>,
}

pub struct Enricher<'a> {
    api: Option<&'a mut dyn MusicApi>,
    stores: EnrichmentStores<'a>,
    retry: RetryPolicy,
    options: EnrichmentOptions,
    failed: FailedKeys,
    stats: EnrichmentStats,
}

impl<'a> Enricher<'a> {
    /// `api` may be `None` for cache-only runs.
    pub fn new(
        api: Option<&'a mut dyn MusicApi>,
        stores: EnrichmentStores<'a>,
        retry: RetryPolicy,
        options: EnrichmentOptions,
    ) -> Self {
        Self {
            api,
            stores,
            retry,
            options,
            failed: FailedKeys::default(),
            stats: EnrichmentStats::default(),
        }
    }

    pub fn stats(&self) -> EnrichmentStats {
        self.stats
    }

    /// Gives callers (the updater) access to the API client the enricher owns.
    pub fn api_mut(&mut self) -> Option<&mut (dyn MusicApi + 'a)> {
        self.api.as_deref_mut()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn log_summary(&self, run_label: &str) {
        info!(
            "Enrichment[{}]: cache_hits={} fetched={} not_found={} failed={} offline_misses={}",
            run_label,
            self.stats.cache_hits,
            self.stats.fetched,
            self.stats.not_found,
            self.stats.failed,
            self.stats.offline_misses
        );
    }

    pub fn enrich(&mut self, play: PlayEvent) -> Result<EnrichedPlayEvent, PipelineError> {
        let genres = if self.options.genres {
            self.resolve_genres(&play)?.unwrap_or_default()
        } else {
            Vec::new()
        };
        let artwork_url = if self.options.artwork {
            self.resolve_artwork(&play)?.flatten()
        } else {
            None
        };
        let audio_features = if self.options.audio_features {
            self.resolve_audio_features(&play)?.flatten()
        } else {
            None
        };
        Ok(EnrichedPlayEvent {
            play,
            genres,
            artwork_url,
            audio_features,
        })
    }

    fn resolve_genres(&mut self, play: &PlayEvent) -> Result<Option<Vec<String>>, PipelineError> {
        let Some(artist) = play.primary_artist() else {
            return Ok(None);
        };
        resolve_field(
            &mut self.api,
            &mut *self.stores.genres,
            &mut self.failed.artists,
            &mut self.stats,
            self.retry,
            artist,
            "genres",
            |api| api.artist_genres(artist),
            |genres| genres,
            Vec::new(),
        )
    }

    fn resolve_artwork(
        &mut self,
        play: &PlayEvent,
    ) -> Result<Option<Option<String>>, PipelineError> {
        let track_id = play.track_id.as_str();
        resolve_field(
            &mut self.api,
            &mut *self.stores.artwork,
            &mut self.failed.artwork,
            &mut self.stats,
            self.retry,
            track_id,
            "artwork",
            |api| api.track_artwork(track_id),
            Some,
            None,
        )
    }

    fn resolve_audio_features(
        &mut self,
        play: &PlayEvent,
    ) -> Result<Option<Option<crate::play_event::AudioFeatures>>, PipelineError> {
        let track_id = play.track_id.as_str();
        resolve_field(
            &mut self.api,
            &mut *self.stores.audio_features,
            &mut self.failed.audio_features,
            &mut self.stats,
            self.retry,
            track_id,
            "audio_features",
            |api| api.audio_features(track_id),
            Some,
            None,
        )
    }
}

/// Resolves one cache-backed field. `Ok(None)` means the field could not be
/// resolved this run and must be left empty.
#[allow(clippy::too_many_arguments)]
fn resolve_field<V, T>(
    api: &mut Option<&mut dyn MusicApi>,
    store: &mut dyn KeyValueStore<CacheEntry<V>>,
    failed: &mut HashSet<String>,
    stats: &mut EnrichmentStats,
    retry: RetryPolicy,
    key: &str,
    field: &str,
    mut fetch: impl FnMut(&mut dyn MusicApi) -> Result<T, ApiError>,
    found: impl FnOnce(T) -> V,
    conclusive_empty: V,
) -> Result<Option<V>, PipelineError>
where
    V: Clone,
{
    if let Some(entry) = store.get(key) {
        stats.cache_hits += 1;
        return Ok(Some(entry.value));
    }
    if failed.contains(key) {
        return Ok(None);
    }
    let Some(api) = api.as_mut() else {
        stats.offline_misses += 1;
        return Ok(None);
    };

    let label = format!("{field}:{key}");
    match retry.run(&label, || fetch(&mut **api)) {
        Ok(value) => {
            let value = found(value);
            store.put(key.to_string(), CacheEntry::new(value.clone(), Utc::now()));
            stats.fetched += 1;
            Ok(Some(value))
        }
        Err(ApiError::NotFound(detail)) => {
            debug!("Enrichment[{}]: nothing found ({})", label, detail);
            store.put(
                key.to_string(),
                CacheEntry::new(conclusive_empty.clone(), Utc::now()),
            );
            stats.not_found += 1;
            Ok(Some(conclusive_empty))
        }
        Err(error) if error.is_fatal() => Err(PipelineError::Authentication(error.to_string())),
        Err(error) => {
            warn!(
                "Enrichment[{}]: lookup failed, leaving field empty: {}",
                label, error
            );
            failed.insert(key.to_string());
            stats.failed += 1;
            Ok(None)
        }
    }
}
