//! Spotify Web API client.
//!
//! Walks one artist's discography the way the crawl needs it: every album,
//! single and compilation, every track on them, the full profile of every
//! credited artist and the audio features of every track. Uses the
//! client-credentials flow, one token per credential.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::client::{ArtistSubgraph, CatalogClient, CredentialStatus};
use super::types::{AudioFeatures, FullArtist, FullTrack, Paging, SimpleAlbum, SimpleTrack, TrackRecord};
use crate::config::{CredentialConfig, SpotifyConfig};
use crate::error::FetchError;

const API_BASE: &str = "https://api.spotify.com/v1";
const TOKEN_URL: &str = "https://accounts.spotify.com/api/token";

/// Cheap lookup used to check whether a credential is rate limited.
const PROBE_TRACK_ID: &str = "0VjIjW4GlUZAMYd2vXMi3b";

const ALBUM_GROUPS: &str = "album,single,compilation";

/// Cap on followed `next` links per listing.
const MAX_PAGES: usize = 100;

const ALBUMS_PER_REQUEST: usize = 20;
const ARTISTS_PER_REQUEST: usize = 50;
const FEATURES_PER_REQUEST: usize = 100;
const TRACKS_PER_REQUEST: usize = 50;

const MAX_SERVER_RETRIES: u32 = 3;

/// Tokens are refreshed this long before they expire.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Wait used when a 429 carries no usable `Retry-After`.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct AccessToken {
    value: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct AlbumTracks {
    id: String,
    tracks: Paging<SimpleTrack>,
}

#[derive(Debug, Deserialize)]
struct AlbumsResponse {
    albums: Vec<Option<AlbumTracks>>,
}

#[derive(Debug, Deserialize)]
struct ArtistsResponse {
    artists: Vec<Option<FullArtist>>,
}

#[derive(Debug, Deserialize)]
struct AudioFeaturesResponse {
    audio_features: Vec<Option<AudioFeatures>>,
}

#[derive(Debug, Deserialize)]
struct TracksResponse {
    tracks: Vec<Option<FullTrack>>,
}

/// Spotify client bound to one credential.
pub struct SpotifyClient {
    name: String,
    client_id: String,
    client_secret: String,
    http: Client,
    api_base: String,
    token_url: String,
    max_retry_duration: Duration,
    token: Mutex<Option<AccessToken>>,
}

impl SpotifyClient {
    /// Creates a client for `credential`. No request is made yet.
    pub fn new(
        credential: &CredentialConfig,
        max_retry_duration: Duration,
        request_timeout: Duration,
    ) -> Result<Self, FetchError> {
        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| FetchError::RequestFailed(e.to_string()))?;

        Ok(Self {
            name: credential.name.clone(),
            client_id: credential.client_id.clone(),
            client_secret: credential.client_secret.clone(),
            http,
            api_base: API_BASE.to_string(),
            token_url: TOKEN_URL.to_string(),
            max_retry_duration,
            token: Mutex::new(None),
        })
    }

    /// Points the client at different endpoints (proxies, test doubles).
    pub fn with_endpoints(mut self, api_base: impl Into<String>, token_url: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self.token_url = token_url.into();
        self
    }

    /// Builds one client per configured credential, skipping credentials
    /// that are already rate limited.
    ///
    /// # Errors
    ///
    /// Fails when a credential cannot obtain a token or the probe request
    /// fails for any reason other than rate limiting.
    pub async fn connect_all(config: &SpotifyConfig) -> Result<Vec<Arc<dyn CatalogClient>>, FetchError> {
        let candidates = config
            .clients
            .iter()
            .map(|credential| Self::new(credential, config.max_retry_duration(), config.request_timeout()))
            .collect::<Result<Vec<_>, _>>()?;

        // each probe may wait out a short rate-limit window
        let probes = futures::future::join_all(candidates.iter().map(|client| client.probe())).await;

        let mut clients: Vec<Arc<dyn CatalogClient>> = Vec::new();
        for (client, status) in candidates.into_iter().zip(probes) {
            match status? {
                CredentialStatus::Available => {
                    info!(credential = %client.name, "credential available");
                    clients.push(Arc::new(client));
                }
                status @ CredentialStatus::Cold { .. } => {
                    warn!(credential = %client.name, status = %status, "credential is cold, not starting a worker for it");
                }
            }
        }

        info!(count = clients.len(), configured = config.clients.len(), "loaded Spotify api keys");
        Ok(clients)
    }

    /// Checks whether this credential can currently make requests.
    pub async fn probe(&self) -> Result<CredentialStatus, FetchError> {
        let url = format!("{}/tracks/{}", self.api_base, PROBE_TRACK_ID);
        match self.get_json::<FullTrack>(&url).await {
            Ok(_) => Ok(CredentialStatus::Available),
            Err(FetchError::Exhausted { retry_after }) => Ok(CredentialStatus::Cold {
                cooldown: retry_after,
            }),
            Err(e) => Err(e),
        }
    }

    async fn access_token(&self) -> Result<String, FetchError> {
        let mut guard = self.token.lock().await;
        if let Some(token) = guard.as_ref() {
            if token.expires_at > Instant::now() + TOKEN_EXPIRY_MARGIN {
                return Ok(token.value.clone());
            }
        }

        let fresh = self.request_token().await?;
        let value = fresh.value.clone();
        *guard = Some(fresh);
        Ok(value)
    }

    async fn invalidate_token(&self) {
        *self.token.lock().await = None;
    }

    async fn request_token(&self) -> Result<AccessToken, FetchError> {
        let response = self
            .http
            .post(&self.token_url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body("grant_type=client_credentials")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::Auth(format!("{}: {}", status, body)));
        }

        let token: TokenResponse = response.json().await?;
        debug!(credential = %self.name, expires_in = token.expires_in, "obtained access token");
        Ok(AccessToken {
            value: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(token.expires_in),
        })
    }

    /// GETs `url` and decodes the body, absorbing rate limits up to the
    /// credential's retry budget.
    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        let mut server_retries = 0;
        let mut reauthenticated = false;

        loop {
            let token = self.access_token().await?;
            let response = self.http.get(url).bearer_auth(&token).send().await?;
            let status = response.status();

            if status.is_success() {
                return Ok(response.json::<T>().await?);
            }

            if status == StatusCode::TOO_MANY_REQUESTS {
                let retry_after = parse_retry_after(response.headers().get(RETRY_AFTER));
                if retry_after > self.max_retry_duration {
                    return Err(FetchError::Exhausted { retry_after });
                }
                warn!(credential = %self.name, retry_after_secs = retry_after.as_secs(), "rate limited, waiting");
                tokio::time::sleep(retry_after).await;
                continue;
            }

            if status == StatusCode::UNAUTHORIZED && !reauthenticated {
                reauthenticated = true;
                self.invalidate_token().await;
                continue;
            }

            if status.is_server_error() && server_retries < MAX_SERVER_RETRIES {
                server_retries += 1;
                let backoff = Duration::from_secs(1 << server_retries);
                warn!(credential = %self.name, status = %status, attempt = server_retries, "server error, retrying");
                tokio::time::sleep(backoff).await;
                continue;
            }

            let message = response.text().await.unwrap_or_default();
            return Err(FetchError::Api {
                status: status.as_u16(),
                message,
            });
        }
    }

    /// Follows `next` links, collecting every item.
    async fn collect_pages<T: DeserializeOwned>(
        &self,
        first: Paging<T>,
        requests: &mut u64,
    ) -> Result<Vec<T>, FetchError> {
        let mut items = first.items;
        let mut next = first.next;

        for _ in 0..MAX_PAGES {
            let Some(url) = next.take() else {
                break;
            };
            let page: Paging<T> = self.get_json(&url).await?;
            *requests += 1;
            items.extend(page.items);
            next = page.next;
        }

        Ok(items)
    }

    async fn artist_albums(&self, artist_id: &str, requests: &mut u64) -> Result<Vec<SimpleAlbum>, FetchError> {
        let url = format!(
            "{}/artists/{}/albums?include_groups={}&limit=50",
            self.api_base,
            urlencoding::encode(artist_id),
            ALBUM_GROUPS
        );
        let first: Paging<SimpleAlbum> = self.get_json(&url).await?;
        *requests += 1;
        self.collect_pages(first, requests).await
    }

    async fn album_tracks(&self, albums: &[SimpleAlbum], requests: &mut u64) -> Result<Vec<SimpleTrack>, FetchError> {
        let mut tracks = Vec::new();
        for chunk in albums.chunks(ALBUMS_PER_REQUEST) {
            let url = format!("{}/albums?ids={}", self.api_base, join_ids(chunk.iter().map(|a| a.id.as_str())));
            let response: AlbumsResponse = self.get_json(&url).await?;
            *requests += 1;

            for album in response.albums.into_iter().flatten() {
                let album_id = album.id;
                let listed = self.collect_pages(album.tracks, requests).await?;
                debug!(album = %album_id, tracks = listed.len(), "album tracks listed");
                tracks.extend(listed);
            }
        }
        Ok(tracks)
    }

    async fn artists(&self, ids: &[&str], requests: &mut u64) -> Result<HashMap<String, FullArtist>, FetchError> {
        let mut artists = HashMap::with_capacity(ids.len());
        for chunk in ids.chunks(ARTISTS_PER_REQUEST) {
            let url = format!("{}/artists?ids={}", self.api_base, join_ids(chunk.iter().copied()));
            let response: ArtistsResponse = self.get_json(&url).await?;
            *requests += 1;
            for artist in response.artists.into_iter().flatten() {
                artists.insert(artist.id.clone(), artist);
            }
        }
        Ok(artists)
    }

    /// Full tracks and audio features for `ids`, aligned by position.
    async fn tracks_with_features(
        &self,
        ids: &[&str],
        requests: &mut u64,
    ) -> Result<Vec<(FullTrack, Option<AudioFeatures>)>, FetchError> {
        let mut out = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(FEATURES_PER_REQUEST) {
            let url = format!("{}/audio-features?ids={}", self.api_base, join_ids(chunk.iter().copied()));
            let features: AudioFeaturesResponse = self.get_json(&url).await?;
            *requests += 1;

            let mut full = Vec::with_capacity(chunk.len());
            for sub in chunk.chunks(TRACKS_PER_REQUEST) {
                let url = format!("{}/tracks?ids={}", self.api_base, join_ids(sub.iter().copied()));
                let response: TracksResponse = self.get_json(&url).await?;
                *requests += 1;
                full.extend(response.tracks);
            }

            out.extend(pair_features(full, features.audio_features));
        }
        Ok(out)
    }
}

#[async_trait]
impl CatalogClient for SpotifyClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_artist_subgraph(&self, artist_id: &str) -> Result<ArtistSubgraph, FetchError> {
        let mut requests = 0;

        let albums = self.artist_albums(artist_id, &mut requests).await?;
        let listed = self.album_tracks(&albums, &mut requests).await?;

        let track_ids: Vec<&str> = listed
            .iter()
            .map(|t| t.id.as_str())
            .filter(|id| !id.is_empty())
            .collect();
        let artist_ids = credited_artists(&listed);

        let artists = self.artists(&artist_ids, &mut requests).await?;
        let tracks = self.tracks_with_features(&track_ids, &mut requests).await?;

        let records = tracks
            .into_iter()
            .map(|(track, features)| {
                let profiles = track
                    .artists
                    .iter()
                    .filter_map(|a| artists.get(&a.id).cloned())
                    .collect();
                TrackRecord::new(track, features, profiles)
            })
            .collect();

        Ok(ArtistSubgraph {
            tracks: records,
            requests_used: requests,
        })
    }
}

/// Seconds from a `Retry-After` header, or a short default.
fn parse_retry_after(value: Option<&HeaderValue>) -> Duration {
    value
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_RETRY_AFTER)
}

fn join_ids<'a>(ids: impl Iterator<Item = &'a str>) -> String {
    ids.map(|id| urlencoding::encode(id).into_owned())
        .collect::<Vec<_>>()
        .join(",")
}

/// Distinct artist ids credited on `tracks`, first-seen order.
fn credited_artists(tracks: &[SimpleTrack]) -> Vec<&str> {
    let mut seen = HashSet::new();
    tracks
        .iter()
        .flat_map(|t| t.artists.iter())
        .map(|a| a.id.as_str())
        .filter(|id| !id.is_empty() && seen.insert(*id))
        .collect()
}

/// Drops tracks the catalog could not resolve; features stay attached to
/// the track at the same position.
fn pair_features(
    tracks: Vec<Option<FullTrack>>,
    features: Vec<Option<AudioFeatures>>,
) -> Vec<(FullTrack, Option<AudioFeatures>)> {
    let mut features = features.into_iter();
    tracks
        .into_iter()
        .map(|track| (track, features.next().flatten()))
        .filter_map(|(track, features)| track.map(|t| (t, features)))
        .collect()
}
