//! Music-service API abstractions and concrete implementations.

pub mod spotify;

use std::time::Duration;

use crate::play_event::{AudioFeatures, PlayEvent};

/// Largest page the recently-played endpoint serves.
pub const MAX_RECENT_PLAYS: usize = 50;

/// Classified failure of a Web API call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// Credentials are missing, revoked or rejected. Needs re-authorization.
    #[error("authentication failed: {0}")]
    Unauthorized(String),
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    /// Timeouts, 5xx responses and transport failures.
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// Any other rejected request or unusable payload.
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl ApiError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Transient(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Operations the pipeline consumes from the music service. Implementations
/// own authentication; callers own caching.
pub trait MusicApi {
    fn recent_plays(&mut self, limit: usize) -> Result<Vec<PlayEvent>, ApiError>;
    fn artist_genres(&mut self, artist: &str) -> Result<Vec<String>, ApiError>;
    fn track_artwork(&mut self, track_id: &str) -> Result<String, ApiError>;
    fn audio_features(&mut self, track_id: &str) -> Result<AudioFeatures, ApiError>;
}

#[cfg(test)]
pub mod fake {
    //! Scripted [`MusicApi`] used by pipeline tests.

    use std::collections::{HashMap, VecDeque};

    use super::{ApiError, MusicApi};
    use crate::play_event::{AudioFeatures, PlayEvent};

    #[derive(Default)]
    pub struct FakeMusicApi {
        pub recent: Vec<PlayEvent>,
        pub genres: HashMap<String, Vec<String>>,
        pub artwork: HashMap<String, String>,
        pub features: HashMap<String, AudioFeatures>,
        /// Errors returned, in order, before any genre lookup for that artist succeeds.
        pub genre_failures: HashMap<String, VecDeque<ApiError>>,
        pub artwork_failures: HashMap<String, VecDeque<ApiError>>,
        pub recent_failures: VecDeque<ApiError>,
        pub genre_calls: Vec<String>,
        pub artwork_calls: Vec<String>,
        pub feature_calls: Vec<String>,
        pub recent_calls: usize,
    }

    impl FakeMusicApi {
        pub fn with_genres(mut self, artist: &str, genres: &[&str]) -> Self {
            self.genres.insert(
                artist.to_string(),
                genres.iter().map(|genre| genre.to_string()).collect(),
            );
            self
        }

        pub fn with_artwork(mut self, track_id: &str, url: &str) -> Self {
            self.artwork.insert(track_id.to_string(), url.to_string());
            self
        }

        pub fn with_features(mut self, track_id: &str, features: AudioFeatures) -> Self {
            self.features.insert(track_id.to_string(), features);
            self
        }

        pub fn failing_genres(mut self, artist: &str, errors: Vec<ApiError>) -> Self {
            self.genre_failures
                .insert(artist.to_string(), errors.into_iter().collect());
            self
        }

        pub fn failing_artwork(mut self, track_id: &str, errors: Vec<ApiError>) -> Self {
            self.artwork_failures
                .insert(track_id.to_string(), errors.into_iter().collect());
            self
        }
    }

    impl MusicApi for FakeMusicApi {
        fn recent_plays(&mut self, limit: usize) -> Result<Vec<PlayEvent>, ApiError> {
            self.recent_calls += 1;
            if let Some(error) = self.recent_failures.pop_front() {
                return Err(error);
            }
            Ok(self.recent.iter().take(limit).cloned().collect())
        }

        fn artist_genres(&mut self, artist: &str) -> Result<Vec<String>, ApiError> {
            self.genre_calls.push(artist.to_string());
            if let Some(error) = self
                .genre_failures
                .get_mut(artist)
                .and_then(VecDeque::pop_front)
            {
                return Err(error);
            }
            self.genres
                .get(artist)
                .cloned()
                .ok_or_else(|| ApiError::NotFound(format!("artist '{artist}'")))
        }

        fn track_artwork(&mut self, track_id: &str) -> Result<String, ApiError> {
            self.artwork_calls.push(track_id.to_string());
            if let Some(error) = self
                .artwork_failures
                .get_mut(track_id)
                .and_then(VecDeque::pop_front)
            {
                return Err(error);
            }
            self.artwork
                .get(track_id)
                .cloned()
                .ok_or_else(|| ApiError::NotFound(format!("track '{track_id}'")))
        }

        fn audio_features(&mut self, track_id: &str) -> Result<AudioFeatures, ApiError> {
            self.feature_calls.push(track_id.to_string());
            self.features
                .get(track_id)
                .cloned()
                .ok_or_else(|| ApiError::NotFound(format!("features for '{track_id}'")))
        }
    }
}
