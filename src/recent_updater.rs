//! Appends the service's recently-played window to an existing dataset.

use std::collections::HashSet;

use log::{info, warn};

use crate::backends::MAX_RECENT_PLAYS;
use crate::dataset_store::EnrichedDataset;
use crate::enrichment::{Enricher, EnrichmentStats};
use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateReport {
    pub fetched: usize,
    pub already_present: usize,
    pub appended: usize,
    /// The recent-plays request failed for a non-fatal reason.
    pub fetch_failed: bool,
    pub enrichment: EnrichmentStats,
}

pub fn clamp_recent_limit(limit: usize) -> usize {
    limit.clamp(1, MAX_RECENT_PLAYS)
}

/// Fetches up to `limit` recent plays, enriches the ones `dataset` does not
/// hold yet and appends them. Running again with no new plays appends nothing.
pub fn update_recent(
    dataset: &mut EnrichedDataset,
    enricher: &mut Enricher<'_>,
    limit: usize,
) -> Result<UpdateReport, PipelineError> {
    let limit = clamp_recent_limit(limit);
    let retry = enricher.retry_policy();
    let Some(api) = enricher.api_mut() else {
        return Err(PipelineError::Authentication(
            "no API credentials configured".to_string(),
        ));
    };

    let mut report = UpdateReport::default();
    let fetched = match retry.run("recent_plays", || api.recent_plays(limit)) {
        Ok(plays) => plays,
        Err(error) if error.is_fatal() => {
            return Err(PipelineError::Authentication(error.to_string()));
        }
        Err(error) => {
            warn!("Updater: fetching recent plays failed, nothing appended: {}", error);
            report.fetch_failed = true;
            return Ok(report);
        }
    };
    report.fetched = fetched.len();

    let mut batch_keys = HashSet::with_capacity(fetched.len());
    let mut fresh: Vec<_> = fetched
        .into_iter()
        .filter(|play| {
            let key = play.dedup_key();
            !dataset.contains(&key) && batch_keys.insert(key)
        })
        .collect();
    report.already_present = report.fetched - fresh.len();
    fresh.sort_by_key(|play| play.played_at);

    let mut enriched = Vec::with_capacity(fresh.len());
    for play in fresh {
        enriched.push(enricher.enrich(play)?);
    }
    report.appended = dataset.append(enriched);
    report.enrichment = enricher.stats();
    enricher.log_summary("update");
    info!(
        "Updater: fetched={} already_present={} appended={}",
        report.fetched, report.already_present, report.appended
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::{clamp_recent_limit, update_recent};
    use crate::backends::fake::FakeMusicApi;
    use crate::backends::{ApiError, MusicApi};
    use crate::cache_store::{ArtworkEntry, AudioFeaturesEntry, GenreEntry, MemoryStore};
    use crate::dataset_store::EnrichedDataset;
    use crate::enrichment::{Enricher, EnrichmentOptions, EnrichmentStores};
    use crate::error::PipelineError;
    use crate::play_event::{parse_timestamp, EnrichedPlayEvent, PlayEvent};
    use crate::retry::RetryPolicy;

    fn play(track_id: &str, ts: &str) -> PlayEvent {
        PlayEvent {
            track_id: track_id.to_string(),
            track_name: format!("Song {track_id}"),
            artists: vec!["Artist".to_string()],
            album_name: "Album".to_string(),
            played_at: parse_timestamp(ts).unwrap(),
            ms_played: 180_000,
        }
    }

    #[derive(Default)]
    struct Stores {
        genres: MemoryStore<GenreEntry>,
        artwork: MemoryStore<ArtworkEntry>,
        features: MemoryStore<AudioFeaturesEntry>,
    }

    impl Stores {
        fn views(&mut self) -> EnrichmentStores<'_> {
            EnrichmentStores {
                genres: &mut self.genres,
                artwork: &mut self.artwork,
                audio_features: &mut self.features,
            }
        }
    }

    fn run_update(
        api: &mut FakeMusicApi,
        stores: &mut Stores,
        dataset: &mut EnrichedDataset,
    ) -> Result<super::UpdateReport, PipelineError> {
        let mut enricher = Enricher::new(
            Some(api as &mut dyn MusicApi),
            stores.views(),
            RetryPolicy::immediate(2),
            EnrichmentOptions::default(),
        );
        update_recent(dataset, &mut enricher, 50)
    }

    #[test]
    fn test_only_missing_plays_are_appended() {
        let mut dataset = EnrichedDataset::from_events(vec![
            EnrichedPlayEvent::unenriched(play("a", "2024-05-01T08:00:00Z")),
            EnrichedPlayEvent::unenriched(play("b", "2024-05-01T09:00:00Z")),
        ]);
        let mut api = FakeMusicApi {
            recent: vec![
                play("c", "2024-05-01T10:00:00Z"),
                play("b", "2024-05-01T09:00:00Z"),
                play("a", "2024-05-01T08:00:00Z"),
            ],
            ..FakeMusicApi::default()
        }
        .with_genres("Artist", &["jazz"]);
        let mut stores = Stores::default();

        let report = run_update(&mut api, &mut stores, &mut dataset).unwrap();

        assert_eq!(report.fetched, 3);
        assert_eq!(report.already_present, 2);
        assert_eq!(report.appended, 1);
        assert_eq!(dataset.len(), 3);
        let last = dataset.events().last().unwrap();
        assert_eq!(last.play.track_id, "c");
        assert_eq!(last.genres, vec!["jazz".to_string()]);
    }

    #[test]
    fn test_second_run_without_new_plays_appends_nothing() {
        let mut dataset = EnrichedDataset::new();
        let mut api = FakeMusicApi {
            recent: vec![
                play("b", "2024-05-01T09:00:00Z"),
                play("a", "2024-05-01T08:00:00Z"),
                play("a", "2024-05-01T08:00:00Z"),
            ],
            ..FakeMusicApi::default()
        };
        let mut stores = Stores::default();

        let first = run_update(&mut api, &mut stores, &mut dataset).unwrap();
        let snapshot = dataset.clone();
        let second = run_update(&mut api, &mut stores, &mut dataset).unwrap();

        assert_eq!(first.appended, 2);
        assert_eq!(second.appended, 0);
        assert_eq!(second.already_present, 3);
        assert_eq!(dataset, snapshot);
        assert_eq!(dataset.events()[0].play.track_id, "a");
    }

    #[test]
    fn test_plays_older_than_tail_keep_dataset_ordered() {
        let mut dataset = EnrichedDataset::from_events(vec![EnrichedPlayEvent::unenriched(
            play("late", "2024-05-02T00:00:00Z"),
        )]);
        let mut api = FakeMusicApi {
            recent: vec![play("early", "2024-05-01T00:00:00Z")],
            ..FakeMusicApi::default()
        };
        let mut stores = Stores::default();

        run_update(&mut api, &mut stores, &mut dataset).unwrap();

        let ids: Vec<&str> = dataset
            .events()
            .iter()
            .map(|event| event.play.track_id.as_str())
            .collect();
        assert_eq!(ids, vec!["early", "late"]);
    }

    #[test]
    fn test_fetch_failure_appends_nothing() {
        let mut dataset = EnrichedDataset::new();
        let mut api = FakeMusicApi {
            recent: vec![play("a", "2024-05-01T08:00:00Z")],
            recent_failures: vec![
                ApiError::Transient("timed out".to_string()),
                ApiError::Transient("timed out".to_string()),
            ]
            .into(),
            ..FakeMusicApi::default()
        };
        let mut stores = Stores::default();

        let report = run_update(&mut api, &mut stores, &mut dataset).unwrap();

        assert!(report.fetch_failed);
        assert_eq!(report.appended, 0);
        assert!(dataset.is_empty());
        assert_eq!(api.recent_calls, 2);
    }

    #[test]
    fn test_rate_limited_enrichment_keeps_play() {
        let mut dataset = EnrichedDataset::new();
        let mut api = FakeMusicApi {
            recent: vec![play("a", "2024-05-01T08:00:00Z")],
            ..FakeMusicApi::default()
        }
        .with_genres("Artist", &["jazz"])
        .failing_genres(
            "Artist",
            vec![
                ApiError::RateLimited { retry_after: None },
                ApiError::RateLimited { retry_after: None },
            ],
        );
        let mut stores = Stores::default();

        let report = run_update(&mut api, &mut stores, &mut dataset).unwrap();

        assert_eq!(report.appended, 1);
        assert!(dataset.events()[0].genres.is_empty());
        assert_eq!(report.enrichment.failed, 1);
    }

    #[test]
    fn test_unauthorized_fetch_is_fatal() {
        let mut dataset = EnrichedDataset::new();
        let mut api = FakeMusicApi {
            recent_failures: vec![ApiError::Unauthorized("revoked".to_string())].into(),
            ..FakeMusicApi::default()
        };
        let mut stores = Stores::default();

        let result = run_update(&mut api, &mut stores, &mut dataset);
        assert!(matches!(result, Err(PipelineError::Authentication(_))));
        assert_eq!(api.recent_calls, 1);
    }

    #[test]
    fn test_offline_update_is_rejected() {
        let mut dataset = EnrichedDataset::new();
        let mut stores = Stores::default();
        let mut enricher = Enricher::new(
            None,
            stores.views(),
            RetryPolicy::immediate(1),
            EnrichmentOptions::default(),
        );
        let result = update_recent(&mut dataset, &mut enricher, 10);
        assert!(matches!(result, Err(PipelineError::Authentication(_))));
    }

    #[test]
    fn test_recent_limit_is_clamped() {
        assert_eq!(clamp_recent_limit(0), 1);
        assert_eq!(clamp_recent_limit(20), 20);
        assert_eq!(clamp_recent_limit(500), 50);
    }
}
