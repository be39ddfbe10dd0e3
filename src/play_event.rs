//! Listening-history record types shared by the builder, updater and API client.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const TRACK_URI_PREFIX: &str = "spotify:track:";

/// One recorded play of a track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayEvent {
    pub track_id: String,
    pub track_name: String,
    /// Credited artists in service order; the first one is the primary artist.
    pub artists: Vec<String>,
    pub album_name: String,
    pub played_at: DateTime<Utc>,
    pub ms_played: u64,
}

/// Identity of a play: the same track at the same instant is the same play.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DedupKey {
    pub track_id: String,
    pub played_at: DateTime<Utc>,
}

impl PlayEvent {
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            track_id: self.track_id.clone(),
            played_at: self.played_at,
        }
    }

    /// Name used as the genre-cache key.
    pub fn primary_artist(&self) -> Option<&str> {
        self.artists
            .first()
            .map(String::as_str)
            .map(str::trim)
            .filter(|artist| !artist.is_empty())
    }
}

/// Per-track audio analysis values as reported by the Web API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioFeatures {
    pub danceability: f64,
    pub energy: f64,
    pub key: i32,
    pub loudness: f64,
    pub mode: i32,
    pub speechiness: f64,
    pub acousticness: f64,
    pub instrumentalness: f64,
    pub liveness: f64,
    pub valence: f64,
    pub tempo: f64,
    pub time_signature: i32,
}

/// A play plus the metadata resolved for it. Unresolved fields stay empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedPlayEvent {
    #[serde(flatten)]
    pub play: PlayEvent,
    #[serde(default)]
    pub genres: Vec<String>,
    #[serde(default)]
    pub artwork_url: Option<String>,
    #[serde(default)]
    pub audio_features: Option<AudioFeatures>,
}

impl EnrichedPlayEvent {
    pub fn unenriched(play: PlayEvent) -> Self {
        Self {
            play,
            genres: Vec::new(),
            artwork_url: None,
            audio_features: None,
        }
    }

    pub fn dedup_key(&self) -> DedupKey {
        self.play.dedup_key()
    }
}

/// Why a raw export record could not be turned into a [`PlayEvent`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedRecord {
    #[error("record is not a JSON object of the export format: {0}")]
    Shape(String),
    #[error("missing field '{0}'")]
    MissingField(&'static str),
    #[error("timestamp '{0}' is not RFC 3339")]
    Timestamp(String),
    #[error("uri '{0}' is not a track")]
    NotATrack(String),
}

/// One record of the streaming-history export, as found on disk.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawExportRecord {
    #[serde(default)]
    pub ts: Option<String>,
    #[serde(default)]
    pub ms_played: Option<u64>,
    #[serde(default)]
    pub master_metadata_track_name: Option<String>,
    #[serde(default)]
    pub master_metadata_album_artist_name: Option<String>,
    #[serde(default)]
    pub master_metadata_album_album_name: Option<String>,
    #[serde(default)]
    pub spotify_track_uri: Option<String>,
}

fn required(value: Option<String>, field: &'static str) -> Result<String, MalformedRecord> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or(MalformedRecord::MissingField(field))
}

/// Strips the `spotify:track:` prefix; bare ids pass through unchanged.
pub fn track_id_from_uri(uri: &str) -> Result<String, MalformedRecord> {
    let trimmed = uri.trim();
    let id = match trimmed.strip_prefix(TRACK_URI_PREFIX) {
        Some(id) => id,
        None if trimmed.contains(':') => {
            return Err(MalformedRecord::NotATrack(trimmed.to_string()))
        }
        None => trimmed,
    };
    if id.is_empty() {
        return Err(MalformedRecord::NotATrack(trimmed.to_string()));
    }
    Ok(id.to_string())
}

pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, MalformedRecord> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|_| MalformedRecord::Timestamp(value.to_string()))
}

impl RawExportRecord {
    pub fn from_value(value: serde_json::Value) -> Result<Self, MalformedRecord> {
        serde_json::from_value(value).map_err(|err| MalformedRecord::Shape(err.to_string()))
    }

    pub fn into_play_event(self) -> Result<PlayEvent, MalformedRecord> {
        let uri = required(self.spotify_track_uri, "spotify_track_uri")?;
        let track_id = track_id_from_uri(&uri)?;
        let ts = required(self.ts, "ts")?;
        let played_at = parse_timestamp(&ts)?;
        let track_name = required(self.master_metadata_track_name, "master_metadata_track_name")?;
        let artist = required(
            self.master_metadata_album_artist_name,
            "master_metadata_album_artist_name",
        )?;
        let album_name = self
            .master_metadata_album_album_name
            .map(|album| album.trim().to_string())
            .unwrap_or_default();
        let ms_played = self.ms_played.ok_or(MalformedRecord::MissingField("ms_played"))?;
        Ok(PlayEvent {
            track_id,
            track_name,
            artists: vec![artist],
            album_name,
            played_at,
            ms_played,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_timestamp, track_id_from_uri, EnrichedPlayEvent, MalformedRecord, RawExportRecord};
    use serde_json::json;

    #[test]
    fn test_raw_record_converts_to_play_event() {
        let record = RawExportRecord::from_value(json!({
            "ts": "2023-04-01T18:22:05Z",
            "platform": "android",
            "ms_played": 184_000,
            "master_metadata_track_name": "Night Drive",
            "master_metadata_album_artist_name": "Sample Artist",
            "master_metadata_album_album_name": "Late Hours",
            "spotify_track_uri": "spotify:track:4uLU6hMCjMI75M1A2tKUQC"
        }))
        .expect("record should deserialize");

        let event = record.into_play_event().expect("record should be valid");
        assert_eq!(event.track_id, "4uLU6hMCjMI75M1A2tKUQC");
        assert_eq!(event.artists, vec!["Sample Artist".to_string()]);
        assert_eq!(event.album_name, "Late Hours");
        assert_eq!(event.ms_played, 184_000);
        assert_eq!(event.played_at.to_rfc3339(), "2023-04-01T18:22:05+00:00");
    }

    #[test]
    fn test_podcast_record_is_rejected_as_not_a_track() {
        let record = RawExportRecord::from_value(json!({
            "ts": "2023-04-01T18:22:05Z",
            "ms_played": 1_200_000,
            "master_metadata_track_name": null,
            "spotify_track_uri": null,
            "spotify_episode_uri": "spotify:episode:abc"
        }))
        .expect("record should deserialize");
        assert_eq!(
            record.into_play_event(),
            Err(MalformedRecord::MissingField("spotify_track_uri"))
        );
        assert!(matches!(
            track_id_from_uri("spotify:episode:abc"),
            Err(MalformedRecord::NotATrack(_))
        ));
    }

    #[test]
    fn test_bad_timestamp_is_malformed() {
        assert!(matches!(
            parse_timestamp("yesterday"),
            Err(MalformedRecord::Timestamp(_))
        ));
    }

    #[test]
    fn test_dedup_key_matches_equal_instants_with_different_offsets() {
        let zulu = parse_timestamp("2023-04-01T18:22:05Z").expect("valid");
        let offset = parse_timestamp("2023-04-01T20:22:05+02:00").expect("valid");
        assert_eq!(zulu, offset);

        let millis = parse_timestamp("2023-04-01T18:22:05.120Z").expect("valid");
        assert_ne!(zulu, millis);
    }

    #[test]
    fn test_enriched_event_serializes_flat_and_reads_missing_enrichment_as_empty() {
        let parsed: EnrichedPlayEvent = serde_json::from_value(json!({
            "track_id": "t1",
            "track_name": "Song",
            "artists": ["A"],
            "album_name": "Album",
            "played_at": "2023-04-01T18:22:05Z",
            "ms_played": 31_000
        }))
        .expect("enriched event should deserialize");
        assert!(parsed.genres.is_empty());
        assert_eq!(parsed.artwork_url, None);
        assert_eq!(parsed.audio_features, None);

        let value = serde_json::to_value(&parsed).expect("serialize");
        assert_eq!(value["track_id"], "t1");
        assert_eq!(value["played_at"], "2023-04-01T18:22:05Z");
    }
}
