//! Persistent pipeline configuration model and defaults.

use std::path::{Path, PathBuf};

use log::info;

use crate::backends::MAX_RECENT_PLAYS;
use crate::retry::RetryPolicy;

/// Root configuration persisted to `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Config {
    #[serde(default)]
    /// Where the dataset, caches and raw exports live.
    pub paths: PathsConfig,
    #[serde(default)]
    /// Web API endpoints, timeouts and pacing.
    pub api: ApiConfig,
    #[serde(default)]
    /// Retry schedule for rate-limited and transient API failures.
    pub retry: RetryConfig,
    #[serde(default)]
    /// Which enrichment fields are resolved and how plays are filtered.
    pub enrichment: EnrichmentConfig,
}

/// File locations. Relative paths are resolved against `data_dir`.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct PathsConfig {
    /// Base directory; empty means the platform data directory.
    #[serde(default)]
    pub data_dir: String,
    #[serde(default = "default_raw_history_dir")]
    pub raw_history_dir: String,
    #[serde(default = "default_enriched_dataset_file")]
    pub enriched_dataset_file: String,
    #[serde(default = "default_genre_cache_file")]
    pub genre_cache_file: String,
    #[serde(default = "default_artwork_cache_file")]
    pub artwork_cache_file: String,
    #[serde(default = "default_audio_features_cache_file")]
    pub audio_features_cache_file: String,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_accounts_base_url")]
    pub accounts_base_url: String,
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    /// Client-side ceiling on requests sent per second.
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct EnrichmentConfig {
    #[serde(default = "default_true")]
    pub genres: bool,
    #[serde(default = "default_true")]
    pub artwork: bool,
    #[serde(default)]
    pub audio_features: bool,
    /// Raw-export plays shorter than this are dropped. `0` keeps everything.
    #[serde(default = "default_min_ms_played")]
    pub min_ms_played: u64,
    /// Recently-played page size requested by `update`.
    #[serde(default = "default_recent_limit")]
    pub recent_limit: usize,
    /// Age after which `cache prune` drops entries.
    #[serde(default = "default_cache_max_age_days")]
    pub cache_max_age_days: u32,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: String::new(),
            raw_history_dir: default_raw_history_dir(),
            enriched_dataset_file: default_enriched_dataset_file(),
            genre_cache_file: default_genre_cache_file(),
            artwork_cache_file: default_artwork_cache_file(),
            audio_features_cache_file: default_audio_features_cache_file(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            accounts_base_url: default_accounts_base_url(),
            redirect_uri: default_redirect_uri(),
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            requests_per_second: default_requests_per_second(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            genres: true,
            artwork: true,
            audio_features: false,
            min_ms_played: default_min_ms_played(),
            recent_limit: default_recent_limit(),
            cache_max_age_days: default_cache_max_age_days(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            std::time::Duration::from_millis(self.base_delay_ms),
            std::time::Duration::from_millis(self.max_delay_ms),
        )
    }
}

impl PathsConfig {
    pub fn data_dir(&self) -> PathBuf {
        let configured = self.data_dir.trim();
        if !configured.is_empty() {
            return PathBuf::from(configured);
        }
        dirs::data_dir()
            .map(|path| path.join("spinlog"))
            .unwrap_or_else(|| PathBuf::from("data"))
    }

    fn resolve(&self, value: &str) -> PathBuf {
        let path = Path::new(value.trim());
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_dir().join(path)
        }
    }

    pub fn raw_history_dir(&self) -> PathBuf {
        self.resolve(&self.raw_history_dir)
    }

    pub fn enriched_dataset_file(&self) -> PathBuf {
        self.resolve(&self.enriched_dataset_file)
    }

    pub fn genre_cache_file(&self) -> PathBuf {
        self.resolve(&self.genre_cache_file)
    }

    pub fn artwork_cache_file(&self) -> PathBuf {
        self.resolve(&self.artwork_cache_file)
    }

    pub fn audio_features_cache_file(&self) -> PathBuf {
        self.resolve(&self.audio_features_cache_file)
    }
}

/// Default location of `config.toml`.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|path| path.join("spinlog"))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("config.toml")
}

/// Reads `path`, writing a default config there first if it does not exist.
pub fn load_or_create(path: &Path) -> anyhow::Result<Config> {
    if !path.exists() {
        info!(
            "Config file not found. Creating default config. path={}",
            path.display()
        );
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, toml::to_string(&Config::default())?)?;
    }
    let content = std::fs::read_to_string(path)?;
    let parsed: Config = toml::from_str(&content)?;
    Ok(sanitize_config(parsed))
}

/// Clamps values that would otherwise make a run misbehave.
pub fn sanitize_config(config: Config) -> Config {
    let clamped_recent_limit = config.enrichment.recent_limit.clamp(1, MAX_RECENT_PLAYS);
    let clamped_attempts = config.retry.max_attempts.clamp(1, 10);
    let clamped_max_delay = config.retry.max_delay_ms.max(config.retry.base_delay_ms);
    let clamped_rps = config.api.requests_per_second.clamp(1, 50);
    let clamped_connect_timeout = config.api.connect_timeout_secs.max(1);
    let clamped_read_timeout = config.api.read_timeout_secs.max(1);

    Config {
        paths: config.paths,
        api: ApiConfig {
            requests_per_second: clamped_rps,
            connect_timeout_secs: clamped_connect_timeout,
            read_timeout_secs: clamped_read_timeout,
            ..config.api
        },
        retry: RetryConfig {
            max_attempts: clamped_attempts,
            base_delay_ms: config.retry.base_delay_ms,
            max_delay_ms: clamped_max_delay,
        },
        enrichment: EnrichmentConfig {
            recent_limit: clamped_recent_limit,
            cache_max_age_days: config.enrichment.cache_max_age_days.max(1),
            ..config.enrichment
        },
    }
}

fn default_true() -> bool {
    true
}

fn default_raw_history_dir() -> String {
    "streaming_data".to_string()
}

fn default_enriched_dataset_file() -> String {
    "enriched_plays.json".to_string()
}

fn default_genre_cache_file() -> String {
    "artist_genres_cache.json".to_string()
}

fn default_artwork_cache_file() -> String {
    "track_artwork_cache.json".to_string()
}

fn default_audio_features_cache_file() -> String {
    "audio_features_cache.json".to_string()
}

fn default_api_base_url() -> String {
    "https://api.spotify.com/v1".to_string()
}

fn default_accounts_base_url() -> String {
    "https://accounts.spotify.com".to_string()
}

fn default_redirect_uri() -> String {
    "http://127.0.0.1:8080/callback".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_read_timeout_secs() -> u64 {
    15
}

fn default_requests_per_second() -> u32 {
    5
}

fn default_max_attempts() -> u32 {
    4
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_min_ms_played() -> u64 {
    30_000
}

fn default_recent_limit() -> usize {
    MAX_RECENT_PLAYS
}

fn default_cache_max_age_days() -> u32 {
    30
}
