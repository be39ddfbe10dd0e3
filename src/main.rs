mod backends;
mod cache_store;
mod config;
mod data_builder;
mod dataset_store;
mod enrichment;
mod error;
mod integration_keyring;
mod play_event;
mod recent_updater;
mod retry;

use std::io::BufRead;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use log::{info, warn};

use backends::spotify::{self, SpotifyClient, SpotifyCredentials};
use backends::MusicApi;
use cache_store::{
    prune_older_than, ArtworkEntry, AudioFeaturesEntry, GenreEntry, JsonFileStore, KeyValueStore,
};
use config::{Config, EnrichmentConfig, PathsConfig};
use data_builder::BuildReport;
use dataset_store::EnrichedDataset;
use enrichment::{Enricher, EnrichmentOptions, EnrichmentStores};

#[derive(Debug, Parser)]
#[command(
    name = "spinlog",
    version,
    about = "Builds and maintains an enriched listening-history dataset"
)]
struct Cli {
    /// Path to config.toml (created with defaults when missing).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Rebuild the dataset from streaming-history exports.
    Build {
        /// Do nothing when a readable dataset already exists.
        #[arg(long)]
        if_missing: bool,
        /// Enrich from caches only; make no API calls.
        #[arg(long)]
        offline: bool,
        /// Export files or directories. Defaults to the raw-history directory.
        files: Vec<PathBuf>,
    },
    /// Append recently played tracks to the dataset.
    Update,
    /// Show dataset and cache statistics.
    Status,
    /// Grant access to the listening history and store the refresh token.
    Authorize,
    #[command(subcommand)]
    Cache(CacheCommand),
}

#[derive(Debug, Subcommand)]
enum CacheCommand {
    /// Drop cache entries older than the given age.
    Prune {
        /// Defaults to `enrichment.cache_max_age_days`.
        #[arg(long)]
        days: Option<u32>,
    },
    Stats,
}

struct Caches {
    genres: JsonFileStore<GenreEntry>,
    artwork: JsonFileStore<ArtworkEntry>,
    audio_features: JsonFileStore<AudioFeaturesEntry>,
}

impl Caches {
    fn open(paths: &PathsConfig) -> Self {
        Self {
            genres: JsonFileStore::open(paths.genre_cache_file()),
            artwork: JsonFileStore::open(paths.artwork_cache_file()),
            audio_features: JsonFileStore::open(paths.audio_features_cache_file()),
        }
    }

    fn views(&mut self) -> EnrichmentStores<'_> {
        EnrichmentStores {
            genres: &mut self.genres,
            artwork: &mut self.artwork,
            audio_features: &mut self.audio_features,
        }
    }

    fn persist(&mut self) -> anyhow::Result<()> {
        self.genres.persist()?;
        self.artwork.persist()?;
        self.audio_features.persist()?;
        Ok(())
    }

    fn print_stats(&self) {
        for (name, stats, path) in [
            ("genres", self.genres.stats(), self.genres.path()),
            ("artwork", self.artwork.stats(), self.artwork.path()),
            (
                "audio features",
                self.audio_features.stats(),
                self.audio_features.path(),
            ),
        ] {
            println!(
                "{name:>15}: {} entries, {} bytes ({})",
                stats.entries,
                stats.file_size_bytes,
                path.display()
            );
        }
    }
}

/// Authenticated client, or `None` for a cache-only run.
fn connect(config: &Config, offline: bool) -> anyhow::Result<Option<SpotifyClient>> {
    if offline {
        info!("Offline run: enriching from caches only");
        return Ok(None);
    }
    if !SpotifyCredentials::configured_in_env() {
        warn!(
            "{} / {} not set: enriching from caches only",
            spotify::CLIENT_ID_ENV,
            spotify::CLIENT_SECRET_ENV
        );
        return Ok(None);
    }
    let credentials = SpotifyCredentials::from_env()?;
    let mut client = SpotifyClient::new(&config.api, credentials);
    client
        .authenticate()
        .context("could not authenticate; run `spinlog authorize`")?;
    Ok(Some(client))
}

fn run_build(
    config: &Config,
    if_missing: bool,
    offline: bool,
    files: &[PathBuf],
) -> anyhow::Result<()> {
    let dataset_path = config.paths.enriched_dataset_file();
    if if_missing && EnrichedDataset::is_readable(&dataset_path) {
        info!(
            "Dataset already present at {}, skipping build",
            dataset_path.display()
        );
        return Ok(());
    }

    let files = data_builder::resolve_export_files(&config.paths.raw_history_dir(), files)?;
    info!("Building from {} export files", files.len());
    let mut client = connect(config, offline)?;
    let mut caches = Caches::open(&config.paths);
    let (dataset, report) =
        rebuild_and_persist(config, &files, client.as_mut(), &mut caches, &dataset_path)?;

    if dataset.is_empty() {
        warn!("Build kept no plays; check min_ms_played and the export files");
    }
    info!(
        "Build complete: {} plays written to {} (cache hits {}, fetched {}, failed {})",
        dataset.len(),
        dataset_path.display(),
        report.enrichment.cache_hits,
        report.enrichment.fetched,
        report.enrichment.failed
    );
    Ok(())
}

/// Builds from `files`, then saves the caches and, only on success, the
/// dataset.
fn rebuild_and_persist<A: MusicApi>(
    config: &Config,
    files: &[PathBuf],
    mut api: Option<&mut A>,
    caches: &mut Caches,
    dataset_path: &Path,
) -> anyhow::Result<(EnrichedDataset, BuildReport)> {
    let result = {
        let mut enricher = Enricher::new(
            api.as_deref_mut().map(|api| api as &mut dyn MusicApi),
            caches.views(),
            config.retry.policy(),
            EnrichmentOptions::from(&config.enrichment),
        );
        data_builder::build_dataset(files, config.enrichment.min_ms_played, &mut enricher)
    };
    // Lookups gathered before a fatal error are still valid.
    caches.persist().context("failed to save caches")?;
    let (dataset, report) = result?;

    dataset
        .persist(dataset_path)
        .context("failed to save dataset")?;
    Ok((dataset, report))
}

fn run_update(config: &Config) -> anyhow::Result<()> {
    let Some(mut client) = connect(config, false)? else {
        bail!(
            "updating needs API access: set {} and {}",
            spotify::CLIENT_ID_ENV,
            spotify::CLIENT_SECRET_ENV
        );
    };
    let dataset_path = config.paths.enriched_dataset_file();
    let mut dataset = EnrichedDataset::load(&dataset_path)?;
    let mut caches = Caches::open(&config.paths);

    let result = {
        let mut enricher = Enricher::new(
            Some(&mut client as &mut dyn MusicApi),
            caches.views(),
            config.retry.policy(),
            EnrichmentOptions::from(&config.enrichment),
        );
        recent_updater::update_recent(&mut dataset, &mut enricher, config.enrichment.recent_limit)
    };
    caches.persist().context("failed to save caches")?;
    let report = result?;

    if report.appended > 0 {
        dataset
            .persist(&dataset_path)
            .context("failed to save dataset")?;
    }
    info!(
        "Update complete: {} new plays, {} total",
        report.appended,
        dataset.len()
    );
    Ok(())
}

fn run_status(config: &Config) -> anyhow::Result<()> {
    let dataset_path = config.paths.enriched_dataset_file();
    let summary = EnrichedDataset::load(&dataset_path)?.summary();
    println!("dataset: {}", dataset_path.display());
    println!("{:>15}: {}", "plays", summary.records);
    let format_play = |play: Option<chrono::DateTime<Utc>>| {
        play.map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "-".to_string())
    };
    println!("{:>15}: {}", "earliest play", format_play(summary.earliest_play));
    println!("{:>15}: {}", "latest play", format_play(summary.latest_play));
    Caches::open(&config.paths).print_stats();
    Ok(())
}

fn run_authorize(config: &Config) -> anyhow::Result<()> {
    let mut credentials = SpotifyCredentials::from_env()?;
    credentials.refresh_token = None;
    let mut client = SpotifyClient::new(&config.api, credentials);
    let state = spotify::new_oauth_state().map_err(anyhow::Error::msg)?;
    let url = client.authorize_url(&state);

    println!("Open this URL and approve access:\n\n  {url}\n");
    if let Err(err) = webbrowser::open(&url) {
        warn!("Could not open a browser: {}", err);
    }
    println!("Paste the URL you were redirected to:");
    let mut redirect = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut redirect)
        .context("failed to read the redirect URL")?;

    let code = spotify::parse_redirect_code(&redirect, &state).map_err(anyhow::Error::msg)?;
    let refresh_token = client.exchange_code(&code)?;
    integration_keyring::set_refresh_token(&refresh_token).map_err(anyhow::Error::msg)?;
    info!("Authorization complete; refresh token stored in the keyring");
    Ok(())
}

/// `cache prune --days` falls back to the configured age; zero would wipe
/// every entry and is raised to one day.
fn prune_age_days(requested: Option<u32>, enrichment: &EnrichmentConfig) -> u32 {
    requested.unwrap_or(enrichment.cache_max_age_days).max(1)
}

fn run_cache(config: &Config, command: CacheCommand) -> anyhow::Result<()> {
    let mut caches = Caches::open(&config.paths);
    match command {
        CacheCommand::Stats => caches.print_stats(),
        CacheCommand::Prune { days } => {
            let days = prune_age_days(days, &config.enrichment);
            let now = Utc::now();
            let genres = prune_older_than(&mut caches.genres, days, now);
            let artwork = prune_older_than(&mut caches.artwork, days, now);
            let audio_features = prune_older_than(&mut caches.audio_features, days, now);
            caches.persist().context("failed to save caches")?;
            info!(
                "Pruned entries older than {} days: genres={} artwork={} audio_features={}",
                days, genres, artwork, audio_features
            );
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut clog = colog::default_builder();
    clog.filter(
        None,
        if cli.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        },
    );
    clog.init();

    std::panic::set_hook(Box::new(|panic_info| {
        let current_thread = std::thread::current();
        let thread_name = current_thread.name().unwrap_or("unnamed");
        log::error!("panic in thread '{}': {}", thread_name, panic_info);
    }));

    let config_path = cli.config.unwrap_or_else(config::default_config_path);
    let config = config::load_or_create(&config_path)
        .with_context(|| format!("failed to load config {}", config_path.display()))?;

    match cli.command {
        Command::Build {
            if_missing,
            offline,
            files,
        } => run_build(&config, if_missing, offline, &files),
        Command::Update => run_update(&config),
        Command::Status => run_status(&config),
        Command::Authorize => run_authorize(&config),
        Command::Cache(command) => run_cache(&config, command),
    }
}

#[cfg(test)]
mod tests {
    use super::{prune_age_days, rebuild_and_persist, Caches};
    use crate::backends::fake::FakeMusicApi;
    use crate::backends::ApiError;
    use crate::cache_store::KeyValueStore;
    use crate::config::{Config, EnrichmentConfig, PathsConfig};
    use std::path::{Path, PathBuf};

    fn config_in(dir: &Path) -> Config {
        Config {
            paths: PathsConfig {
                data_dir: dir.to_string_lossy().to_string(),
                ..PathsConfig::default()
            },
            ..Config::default()
        }
    }

    fn write_export(dir: &Path, records: &[(&str, &str, &str)]) -> PathBuf {
        let body: Vec<String> = records
            .iter()
            .map(|(uri, ts, artist)| {
                format!(
                    r#"{{"ts":"{ts}","ms_played":200000,"master_metadata_track_name":"Song","master_metadata_album_artist_name":"{artist}","master_metadata_album_album_name":"Album","spotify_track_uri":"{uri}"}}"#
                )
            })
            .collect();
        let path = dir.join("Streaming_History_Audio_2024_0.json");
        std::fs::write(&path, format!("[{}]", body.join(","))).unwrap();
        path
    }

    #[test]
    fn test_auth_failure_mid_build_saves_caches_but_not_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let dataset_path = config.paths.enriched_dataset_file();
        std::fs::write(&dataset_path, "[]\n").unwrap();
        let files = vec![write_export(
            dir.path(),
            &[
                ("spotify:track:aaa", "2024-01-01T10:00:00Z", "Alpha"),
                ("spotify:track:bbb", "2024-01-01T11:00:00Z", "Beta"),
            ],
        )];
        let mut api = FakeMusicApi::default()
            .with_genres("Alpha", &["dream pop"])
            .failing_genres("Beta", vec![ApiError::Unauthorized("revoked".to_string())]);
        let mut caches = Caches::open(&config.paths);

        let result = rebuild_and_persist(&config, &files, Some(&mut api), &mut caches, &dataset_path);

        assert!(result.is_err());
        assert_eq!(std::fs::read_to_string(&dataset_path).unwrap(), "[]\n");
        let reopened = Caches::open(&config.paths);
        assert_eq!(
            reopened.genres.get("Alpha").unwrap().value,
            vec!["dream pop".to_string()]
        );
    }

    #[test]
    fn test_unreadable_exports_leave_existing_dataset_alone() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let dataset_path = config.paths.enriched_dataset_file();
        std::fs::write(&dataset_path, "[]\n").unwrap();
        let files = vec![dir.path().join("Streaming_History_Audio_typo.json")];
        let mut caches = Caches::open(&config.paths);

        let result = rebuild_and_persist(
            &config,
            &files,
            None::<&mut FakeMusicApi>,
            &mut caches,
            &dataset_path,
        );

        assert!(result.is_err());
        assert_eq!(std::fs::read_to_string(&dataset_path).unwrap(), "[]\n");
    }

    #[test]
    fn test_successful_build_writes_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let dataset_path = config.paths.enriched_dataset_file();
        let files = vec![write_export(
            dir.path(),
            &[("spotify:track:aaa", "2024-01-01T10:00:00Z", "Alpha")],
        )];
        let mut api = FakeMusicApi::default().with_genres("Alpha", &["dream pop"]);
        let mut caches = Caches::open(&config.paths);

        let (dataset, _) =
            rebuild_and_persist(&config, &files, Some(&mut api), &mut caches, &dataset_path)
                .unwrap();

        assert_eq!(dataset.len(), 1);
        assert!(dataset_path.is_file());
    }

    #[test]
    fn test_prune_age_days_never_zero() {
        let enrichment = EnrichmentConfig::default();
        assert_eq!(prune_age_days(Some(0), &enrichment), 1);
        assert_eq!(prune_age_days(Some(7), &enrichment), 7);
        assert_eq!(prune_age_days(None, &enrichment), enrichment.cache_max_age_days);
    }
}
