//! Spotify Web API client backed by `ureq`.

use std::num::NonZeroU32;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::Value;

use crate::backends::{ApiError, MusicApi, MAX_RECENT_PLAYS};
use crate::config::ApiConfig;
use crate::integration_keyring;
use crate::play_event::{parse_timestamp, AudioFeatures, PlayEvent};

pub const CLIENT_ID_ENV: &str = "SPOTIFY_CLIENT_ID";
pub const CLIENT_SECRET_ENV: &str = "SPOTIFY_CLIENT_SECRET";
pub const REFRESH_TOKEN_ENV: &str = "SPOTIFY_REFRESH_TOKEN";
const AUTHORIZE_SCOPE: &str = "user-read-recently-played";
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);
const MAX_TOKEN_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);
const RATE_LIMIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Application credentials plus the user's long-lived refresh token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpotifyCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: Option<String>,
}

impl SpotifyCredentials {
    /// Reads the client id/secret from the environment. The refresh token
    /// comes from `SPOTIFY_REFRESH_TOKEN` when set, otherwise the keyring.
    pub fn from_env() -> Result<Self, ApiError> {
        let client_id = non_empty_env(CLIENT_ID_ENV)
            .ok_or_else(|| ApiError::Unauthorized(format!("{CLIENT_ID_ENV} is not set")))?;
        let client_secret = non_empty_env(CLIENT_SECRET_ENV)
            .ok_or_else(|| ApiError::Unauthorized(format!("{CLIENT_SECRET_ENV} is not set")))?;
        let refresh_token = match non_empty_env(REFRESH_TOKEN_ENV) {
            Some(token) => Some(token),
            None => match integration_keyring::get_refresh_token() {
                Ok(token) => token,
                Err(err) => {
                    warn!("Spotify: {}", err);
                    None
                }
            },
        };
        Ok(Self {
            client_id,
            client_secret,
            refresh_token,
        })
    }

    /// Returns `true` when the client id and secret are present in the environment.
    pub fn configured_in_env() -> bool {
        non_empty_env(CLIENT_ID_ENV).is_some() && non_empty_env(CLIENT_SECRET_ENV).is_some()
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug, Clone)]
struct AccessToken {
    token: String,
    expires_at: Instant,
}

/// Blocking client for the endpoints the pipeline needs.
pub struct SpotifyClient {
    http_client: ureq::Agent,
    api_base_url: String,
    accounts_base_url: String,
    redirect_uri: String,
    credentials: SpotifyCredentials,
    access_token: Option<AccessToken>,
    limiter: DefaultDirectRateLimiter,
}

impl SpotifyClient {
    pub fn new(config: &ApiConfig, credentials: SpotifyCredentials) -> Self {
        let http_client = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(config.connect_timeout_secs))
            .timeout_read(Duration::from_secs(config.read_timeout_secs))
            .timeout_write(Duration::from_secs(config.read_timeout_secs))
            .build();
        let per_second = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
        Self {
            http_client,
            api_base_url: config.api_base_url.trim_end_matches('/').to_string(),
            accounts_base_url: config.accounts_base_url.trim_end_matches('/').to_string(),
            redirect_uri: config.redirect_uri.clone(),
            credentials,
            access_token: None,
            limiter: RateLimiter::direct(Quota::per_second(per_second)),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.access_token
            .as_ref()
            .is_some_and(|token| token.expires_at > Instant::now())
    }

    /// Exchanges the stored refresh token for a fresh access token.
    pub fn authenticate(&mut self) -> Result<(), ApiError> {
        let refresh_token = self.credentials.refresh_token.clone().ok_or_else(|| {
            ApiError::Unauthorized(
                "no refresh token stored; run `spinlog authorize` first".to_string(),
            )
        })?;
        let response = self.request_token(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
        ])?;
        if let Some(rotated) = response.refresh_token.as_deref() {
            if rotated != refresh_token {
                info!("Spotify: refresh token rotated, updating keyring");
                if let Err(err) = integration_keyring::set_refresh_token(rotated) {
                    warn!("Spotify: {}", err);
                }
                self.credentials.refresh_token = Some(rotated.to_string());
            }
        }
        self.store_access_token(&response);
        debug!("Spotify: access token refreshed");
        Ok(())
    }

    /// URL the user opens to grant this application access.
    pub fn authorize_url(&self, state: &str) -> String {
        format!(
            "{}/authorize?response_type=code&client_id={}&scope={}&redirect_uri={}&state={}",
            self.accounts_base_url,
            urlencoding::encode(&self.credentials.client_id),
            urlencoding::encode(AUTHORIZE_SCOPE),
            urlencoding::encode(&self.redirect_uri),
            urlencoding::encode(state)
        )
    }

    /// Trades an authorization code for tokens and returns the refresh token.
    pub fn exchange_code(&mut self, code: &str) -> Result<String, ApiError> {
        let redirect_uri = self.redirect_uri.clone();
        let response = self.request_token(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri.as_str()),
        ])?;
        let refresh_token = response.refresh_token.clone().ok_or_else(|| {
            ApiError::Rejected("token response did not include a refresh token".to_string())
        })?;
        self.credentials.refresh_token = Some(refresh_token.clone());
        self.store_access_token(&response);
        Ok(refresh_token)
    }

    fn store_access_token(&mut self, response: &TokenResponse) {
        let lifetime = Duration::from_secs(response.expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);
        self.access_token = Some(AccessToken {
            token: response.access_token.clone(),
            expires_at: token_expiry(Instant::now(), lifetime),
        });
    }

    fn request_token(&mut self, form: &[(&str, &str)]) -> Result<TokenResponse, ApiError> {
        let basic = BASE64.encode(format!(
            "{}:{}",
            self.credentials.client_id, self.credentials.client_secret
        ));
        let url = format!("{}/api/token", self.accounts_base_url);
        self.wait_for_rate_limit_slot();
        let response = self
            .http_client
            .post(&url)
            .set("Authorization", &format!("Basic {basic}"))
            .send_form(form)
            .map_err(|error| match error {
                ureq::Error::Status(400 | 401, response) => ApiError::Unauthorized(format!(
                    "token endpoint rejected credentials: {}",
                    response.into_string().unwrap_or_default()
                )),
                other => Self::classify_ureq_failure(other),
            })?;
        response
            .into_json::<TokenResponse>()
            .map_err(|err| ApiError::Rejected(format!("invalid token response: {err}")))
    }

    fn wait_for_rate_limit_slot(&self) {
        while self.limiter.check().is_err() {
            std::thread::sleep(RATE_LIMIT_POLL_INTERVAL);
        }
    }

    fn classify_ureq_failure(error: ureq::Error) -> ApiError {
        match error {
            ureq::Error::Status(code, response) => match code {
                401 => ApiError::Unauthorized("access token rejected".to_string()),
                404 => ApiError::NotFound(response.get_url().to_string()),
                429 => ApiError::RateLimited {
                    retry_after: response
                        .header("Retry-After")
                        .and_then(|value| value.trim().parse::<u64>().ok())
                        .map(Duration::from_secs),
                },
                408 | 500 | 502 | 503 | 504 => {
                    ApiError::Transient(format!("HTTP {code} from {}", response.get_url()))
                }
                _ => ApiError::Rejected(format!("HTTP {code} from {}", response.get_url())),
            },
            ureq::Error::Transport(transport) => ApiError::Transient(transport.to_string()),
        }
    }

    fn get_json_once(&mut self, url: &str) -> Result<Value, ApiError> {
        if !self.is_authenticated() {
            self.authenticate()?;
        }
        let token = self
            .access_token
            .as_ref()
            .map(|token| token.token.clone())
            .unwrap_or_default();
        self.wait_for_rate_limit_slot();
        let response = self
            .http_client
            .get(url)
            .set("Authorization", &format!("Bearer {token}"))
            .set("Accept", "application/json")
            .call()
            .map_err(Self::classify_ureq_failure)?;
        response.into_json::<Value>().map_err(|err| {
            if matches!(
                err.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
            ) {
                ApiError::Transient(format!("timed out reading response: {err}"))
            } else {
                ApiError::Rejected(format!("invalid JSON response: {err}"))
            }
        })
    }

    /// GETs `path` under the API base. A rejected access token is refreshed
    /// and the request replayed once.
    fn get_json(&mut self, path: &str) -> Result<Value, ApiError> {
        let url = format!("{}{}", self.api_base_url, path);
        match self.get_json_once(&url) {
            Err(ApiError::Unauthorized(reason)) if self.credentials.refresh_token.is_some() => {
                debug!("Spotify: {} ({}), refreshing token once", reason, url);
                self.access_token = None;
                self.get_json_once(&url)
            }
            other => other,
        }
    }

    fn artist_names(track: &Value) -> Vec<String> {
        track
            .get("artists")
            .and_then(Value::as_array)
            .map(|artists| {
                artists
                    .iter()
                    .filter_map(|artist| artist.get("name").and_then(Value::as_str))
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(ToOwned::to_owned)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn parse_recent_item(item: &Value) -> Option<PlayEvent> {
        let track = item.get("track")?;
        let track_id = track.get("id")?.as_str()?.to_string();
        let played_at = parse_timestamp(item.get("played_at")?.as_str()?).ok()?;
        let track_name = track.get("name")?.as_str()?.to_string();
        let artists = Self::artist_names(track);
        if artists.is_empty() {
            return None;
        }
        let album_name = track
            .get("album")
            .and_then(|album| album.get("name"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        // Recently-played does not report listen time; the full duration stands in.
        let ms_played = track
            .get("duration_ms")
            .and_then(Value::as_u64)
            .unwrap_or_default();
        Some(PlayEvent {
            track_id,
            track_name,
            artists,
            album_name,
            played_at,
            ms_played,
        })
    }

    fn parse_recent_plays(payload: &Value) -> Vec<PlayEvent> {
        let items = payload
            .get("items")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let mut plays = Vec::with_capacity(items.len());
        for item in items {
            match Self::parse_recent_item(item) {
                Some(play) => plays.push(play),
                None => debug!("Spotify: skipping recently-played item without track data"),
            }
        }
        plays
    }

    fn parse_artist_genres(artist: &str, payload: &Value) -> Result<Vec<String>, ApiError> {
        let first = payload
            .get("artists")
            .and_then(|artists| artists.get("items"))
            .and_then(Value::as_array)
            .and_then(|items| items.first())
            .ok_or_else(|| ApiError::NotFound(format!("artist '{artist}'")))?;
        Ok(first
            .get("genres")
            .and_then(Value::as_array)
            .map(|genres| {
                genres
                    .iter()
                    .filter_map(Value::as_str)
                    .map(ToOwned::to_owned)
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Picks the medium album image (second entry when there are at least two).
    fn pick_album_image(track: &Value) -> Option<String> {
        let images = track
            .get("album")
            .and_then(|album| album.get("images"))
            .and_then(Value::as_array)?;
        let image = if images.len() >= 2 {
            images.get(1)
        } else {
            images.first()
        }?;
        image
            .get("url")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned)
    }

    fn parse_audio_features(track_id: &str, payload: Value) -> Result<AudioFeatures, ApiError> {
        if payload.is_null() {
            return Err(ApiError::NotFound(format!("features for '{track_id}'")));
        }
        serde_json::from_value(payload)
            .map_err(|err| ApiError::Rejected(format!("invalid audio features payload: {err}")))
    }
}

/// Expiry instant for a token valid for `lifetime`; absurd lifetimes are
/// capped at one day.
fn token_expiry(now: Instant, lifetime: Duration) -> Instant {
    now.checked_add(lifetime.min(MAX_TOKEN_LIFETIME))
        .unwrap_or(now)
}

/// Pulls `code` out of a pasted redirect URL after checking `state`.
pub fn parse_redirect_code(redirect_url: &str, expected_state: &str) -> Result<String, String> {
    let query = redirect_url
        .trim()
        .split_once('?')
        .map(|(_, query)| query)
        .ok_or_else(|| "redirect URL has no query string".to_string())?;
    let query = query.split('#').next().unwrap_or(query);
    let mut code = None;
    let mut state = None;
    for pair in query.split('&') {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let decoded = urlencoding::decode(value)
            .map(|value| value.into_owned())
            .map_err(|err| format!("invalid query encoding: {err}"))?;
        match key {
            "code" => code = Some(decoded),
            "state" => state = Some(decoded),
            "error" => return Err(format!("authorization was denied: {decoded}")),
            _ => {}
        }
    }
    if state.as_deref() != Some(expected_state) {
        return Err("state mismatch; restart the authorization".to_string());
    }
    code.filter(|code| !code.is_empty())
        .ok_or_else(|| "redirect URL has no code parameter".to_string())
}

/// Random hex string used as the OAuth `state` parameter.
pub fn new_oauth_state() -> Result<String, String> {
    let mut bytes = [0u8; 16];
    getrandom::fill(&mut bytes).map_err(|err| format!("no OS randomness for OAuth state: {err}"))?;
    Ok(bytes.iter().map(|value| format!("{value:02x}")).collect())
}

impl MusicApi for SpotifyClient {
    fn recent_plays(&mut self, limit: usize) -> Result<Vec<PlayEvent>, ApiError> {
        let limit = limit.clamp(1, MAX_RECENT_PLAYS);
        let payload = self.get_json(&format!("/me/player/recently-played?limit={limit}"))?;
        Ok(Self::parse_recent_plays(&payload))
    }

    fn artist_genres(&mut self, artist: &str) -> Result<Vec<String>, ApiError> {
        let query = format!("artist:{artist}");
        let payload = self.get_json(&format!(
            "/search?q={}&type=artist&limit=1",
            urlencoding::encode(&query)
        ))?;
        Self::parse_artist_genres(artist, &payload)
    }

    fn track_artwork(&mut self, track_id: &str) -> Result<String, ApiError> {
        let payload = self.get_json(&format!("/tracks/{}", urlencoding::encode(track_id)))?;
        Self::pick_album_image(&payload)
            .ok_or_else(|| ApiError::NotFound(format!("artwork for '{track_id}'")))
    }

    fn audio_features(&mut self, track_id: &str) -> Result<AudioFeatures, ApiError> {
        let payload = self.get_json(&format!(
            "/audio-features/{}",
            urlencoding::encode(track_id)
        ))?;
        Self::parse_audio_features(track_id, payload)
    }
}
