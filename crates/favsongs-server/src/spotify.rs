//! Spotify Web API implementation of the playback provider.
//!
//! Tokens are read from a [`CredentialSource`]; refreshing them is the job
//! of the authorization flow, not of this client.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;

use favsongs_types::PlaybackSnapshot;

use crate::clock::Clock;
use crate::config::ProviderConfigResolved;
use crate::provider::{CollectionPage, PlaybackProvider, ProviderError};
use crate::tracker_db::TrackerDb;

const COLLECTION_PAGE_LIMIT: u32 = 100;
const PLAYLIST_LIST_LIMIT: u32 = 50;
/// Tokens expiring sooner than this are treated as expired.
const TOKEN_EXPIRY_MARGIN_SECS: i64 = 60;

#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// A currently valid bearer token for the account.
    async fn access_token(&self, account_id: &str) -> Result<String, ProviderError>;
}

/// Reads the tokens saved in the tracker database.
pub struct StoredCredentials {
    db: Arc<TrackerDb>,
    clock: Arc<dyn Clock>,
}

impl StoredCredentials {
    pub fn new(db: Arc<TrackerDb>, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }
}

#[async_trait]
impl CredentialSource for StoredCredentials {
    async fn access_token(&self, account_id: &str) -> Result<String, ProviderError> {
        let tokens = self
            .db
            .get_tokens(account_id)
            .map_err(|err| ProviderError::Unavailable(format!("{err:#}")))?
            .ok_or_else(|| ProviderError::Unauthorized("no stored tokens".to_string()))?;
        if tokens.expires_at - self.clock.now_secs() < TOKEN_EXPIRY_MARGIN_SECS {
            return Err(ProviderError::Unauthorized("access token expired".to_string()));
        }
        Ok(tokens.access_token)
    }
}

pub struct SpotifyClient {
    client: Client,
    base_url: String,
    collection_description: String,
    credentials: Arc<dyn CredentialSource>,
}

impl SpotifyClient {
    pub fn new(config: &ProviderConfigResolved, credentials: Arc<dyn CredentialSource>) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("build provider http client")?;
        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            collection_description: config.collection_description.clone(),
            credentials,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, account_id: &str, request: RequestBuilder) -> Result<Response, ProviderError> {
        let token = self.credentials.access_token(account_id).await?;
        let response = request
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| ProviderError::Unavailable(err.to_string()))?;
        match status_error(response.status(), response.headers()) {
            Some(err) => Err(err),
            None => Ok(response),
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, account_id: &str, url: &str) -> Result<T, ProviderError> {
        let response = self.send(account_id, self.client.get(url)).await?;
        decode_json(response).await
    }

    async fn current_user_id(&self, account_id: &str) -> Result<String, ProviderError> {
        let profile: UserProfile = self.get_json(account_id, &self.url("/me")).await?;
        Ok(profile.id)
    }

    /// Only follow pagination links that point back at the configured API.
    fn checked_cursor(&self, cursor: &str) -> Result<String, ProviderError> {
        if cursor.starts_with(&self.base_url) {
            Ok(cursor.to_string())
        } else {
            Err(ProviderError::Malformed(format!("unexpected page link {cursor}")))
        }
    }
}

#[async_trait]
impl PlaybackProvider for SpotifyClient {
    async fn current_playback(
        &self,
        account_id: &str,
    ) -> Result<Option<PlaybackSnapshot>, ProviderError> {
        let response = self
            .send(account_id, self.client.get(self.url("/me/player")))
            .await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let body = response
            .bytes()
            .await
            .map_err(|err| ProviderError::Unavailable(err.to_string()))?;
        if body.is_empty() {
            return Ok(None);
        }
        let player: PlayerResponse = serde_json::from_slice(&body)
            .map_err(|err| ProviderError::Malformed(err.to_string()))?;
        Ok(snapshot_from_player(player))
    }

    async fn collection_page(
        &self,
        account_id: &str,
        collection_id: &str,
        cursor: Option<&str>,
    ) -> Result<CollectionPage, ProviderError> {
        let url = match cursor {
            Some(cursor) => self.checked_cursor(cursor)?,
            None => self.url(&format!(
                "/playlists/{}/tracks?limit={COLLECTION_PAGE_LIMIT}",
                urlencoding::encode(collection_id)
            )),
        };
        let page: PlaylistTracksPage = self.get_json(account_id, &url).await?;
        Ok(CollectionPage {
            track_ids: page
                .items
                .into_iter()
                .filter_map(|entry| entry.track.and_then(|track| track.id))
                .filter(|id| !id.is_empty())
                .collect(),
            next: page.next,
        })
    }

    async fn add_to_collection(
        &self,
        account_id: &str,
        collection_id: &str,
        track_id: &str,
    ) -> Result<(), ProviderError> {
        let url = self.url(&format!(
            "/playlists/{}/tracks",
            urlencoding::encode(collection_id)
        ));
        let body = json!({ "uris": [track_uri(track_id)], "position": 0 });
        self.send(account_id, self.client.post(url).json(&body))
            .await?;
        Ok(())
    }

    async fn resolve_or_create_collection(
        &self,
        account_id: &str,
        name: &str,
        public: bool,
    ) -> Result<String, ProviderError> {
        let mut url = self.url(&format!("/me/playlists?limit={PLAYLIST_LIST_LIMIT}"));
        loop {
            let page: PlaylistsPage = self.get_json(account_id, &url).await?;
            if let Some(id) = find_collection(&page.items, name) {
                return Ok(id);
            }
            match page.next {
                Some(next) => url = self.checked_cursor(&next)?,
                None => break,
            }
        }

        let user_id = self.current_user_id(account_id).await?;
        let url = self.url(&format!("/users/{}/playlists", urlencoding::encode(&user_id)));
        let body = json!({
            "name": name,
            "public": public,
            "description": self.collection_description,
        });
        let response = self
            .send(account_id, self.client.post(url).json(&body))
            .await?;
        let created: PlaylistSummary = decode_json(response).await?;
        tracing::info!(
            account_id = %account_id,
            collection_id = %created.id,
            name = %name,
            "collection: created"
        );
        Ok(created.id)
    }
}

#[derive(Debug, Deserialize)]
struct PlayerResponse {
    progress_ms: Option<u64>,
    timestamp: Option<i64>,
    #[serde(default)]
    is_playing: bool,
    item: Option<TrackItem>,
}

#[derive(Debug, Deserialize)]
struct TrackItem {
    id: Option<String>,
    name: Option<String>,
    duration_ms: Option<u64>,
    #[serde(default)]
    artists: Vec<ArtistItem>,
}

#[derive(Debug, Deserialize)]
struct ArtistItem {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlaylistTracksPage {
    #[serde(default)]
    items: Vec<PlaylistTrackEntry>,
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlaylistTrackEntry {
    track: Option<TrackItem>,
}

#[derive(Debug, Deserialize)]
struct PlaylistsPage {
    /// Entries come back as `null` for playlists the user can no longer see.
    #[serde(default)]
    items: Vec<Option<PlaylistSummary>>,
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlaylistSummary {
    id: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct UserProfile {
    id: String,
}

async fn decode_json<T: DeserializeOwned>(response: Response) -> Result<T, ProviderError> {
    let body = response
        .bytes()
        .await
        .map_err(|err| ProviderError::Unavailable(err.to_string()))?;
    serde_json::from_slice(&body).map_err(|err| ProviderError::Malformed(err.to_string()))
}

fn status_error(status: StatusCode, headers: &HeaderMap) -> Option<ProviderError> {
    if status.is_success() {
        return None;
    }
    Some(match status {
        StatusCode::UNAUTHORIZED => ProviderError::Unauthorized(format!("status {status}")),
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited(retry_after_secs(headers)),
        _ => ProviderError::Unavailable(format!("status {status}")),
    })
}

fn retry_after_secs(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}

fn track_uri(track_id: &str) -> String {
    format!("spotify:track:{track_id}")
}

/// Exact, case-sensitive name match.
fn find_collection(items: &[Option<PlaylistSummary>], name: &str) -> Option<String> {
    items
        .iter()
        .flatten()
        .find(|item| item.name == name)
        .map(|item| item.id.clone())
}

fn snapshot_from_player(player: PlayerResponse) -> Option<PlaybackSnapshot> {
    let item = player.item?;
    let track_id = item.id.filter(|id| !id.is_empty())?;
    Some(PlaybackSnapshot {
        track_id,
        name: item.name,
        artists: item
            .artists
            .into_iter()
            .filter_map(|artist| artist.name)
            .filter(|name| !name.trim().is_empty())
            .collect(),
        progress_ms: player.progress_ms.unwrap_or(0),
        duration_ms: item.duration_ms.unwrap_or(0),
        timestamp_ms: player.timestamp,
        is_playing: player.is_playing,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{memory_db_with_account, ManualClock};
    use reqwest::header::HeaderValue;

    fn parse_player(raw: &str) -> Option<PlaybackSnapshot> {
        snapshot_from_player(serde_json::from_str(raw).unwrap())
    }

    #[test]
    fn player_response_maps_to_snapshot() {
        let snapshot = parse_player(
            r#"{
                "progress_ms": 42000,
                "timestamp": 1700000000000,
                "is_playing": true,
                "item": {
                    "id": "4uLU6hMCjMI75M1A2tKUQC",
                    "name": "Never Gonna Give You Up",
                    "duration_ms": 213573,
                    "artists": [{"name": "Rick Astley"}, {"name": null}]
                }
            }"#,
        )
        .unwrap();
        assert_eq!(snapshot.track_id, "4uLU6hMCjMI75M1A2tKUQC");
        assert_eq!(snapshot.primary_artist(), "Rick Astley");
        assert_eq!(snapshot.artists.len(), 1);
        assert_eq!(snapshot.progress_ms, 42_000);
        assert_eq!(snapshot.timestamp_ms, Some(1_700_000_000_000));
    }

    #[test]
    fn sparse_player_response_uses_placeholders() {
        let snapshot = parse_player(r#"{"item": {"id": "t1", "artists": []}}"#).unwrap();
        assert_eq!(snapshot.display_name(), favsongs_types::UNKNOWN_TRACK);
        assert_eq!(snapshot.primary_artist(), favsongs_types::UNKNOWN_ARTIST);
        assert_eq!(snapshot.duration_ms, 0);
        assert_eq!(snapshot.progress_ms, 0);
        assert!(!snapshot.is_playing);
    }

    #[test]
    fn player_without_track_is_nothing_playing() {
        assert!(parse_player(r#"{"is_playing": false, "item": null}"#).is_none());
        assert!(parse_player(r#"{"item": {"id": null, "name": "Local file"}}"#).is_none());
    }

    #[test]
    fn status_mapping() {
        let mut headers = HeaderMap::new();
        assert!(status_error(StatusCode::NO_CONTENT, &headers).is_none());
        assert!(matches!(
            status_error(StatusCode::UNAUTHORIZED, &headers),
            Some(ProviderError::Unauthorized(_))
        ));
        assert_eq!(
            status_error(StatusCode::TOO_MANY_REQUESTS, &headers),
            Some(ProviderError::RateLimited(None))
        );
        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(
            status_error(StatusCode::TOO_MANY_REQUESTS, &headers),
            Some(ProviderError::RateLimited(Some(7)))
        );
        assert!(matches!(
            status_error(StatusCode::BAD_GATEWAY, &headers),
            Some(ProviderError::Unavailable(_))
        ));
    }

    #[test]
    fn collection_lookup_is_exact() {
        let page: PlaylistsPage = serde_json::from_str(
            r#"{"items": [{"id": "1", "name": "favourite songs"}, {"id": "2", "name": "Favourite Songs"}], "next": null}"#,
        )
        .unwrap();
        assert_eq!(find_collection(&page.items, "Favourite Songs").as_deref(), Some("2"));
        assert!(find_collection(&page.items, "Favourite").is_none());
        assert_eq!(track_uri("abc"), "spotify:track:abc");
    }

    #[test]
    fn collection_lookup_skips_null_playlists() {
        let page: PlaylistsPage = serde_json::from_str(
            r#"{"items":[null,{"id":"2","name":"Favourite Songs - Whatsit"}],"next":null}"#,
        )
        .unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(
            find_collection(&page.items, "Favourite Songs - Whatsit").as_deref(),
            Some("2")
        );
    }

    #[test]
    fn tracks_page_skips_missing_tracks() {
        let page: PlaylistTracksPage = serde_json::from_str(
            r#"{"items": [{"track": {"id": "a"}}, {"track": null}, {"track": {"id": "b"}}], "next": "https://api.spotify.com/v1/next"}"#,
        )
        .unwrap();
        let ids = page
            .items
            .into_iter()
            .filter_map(|entry| entry.track.and_then(|track| track.id))
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn stored_credentials_require_unexpired_token() {
        let (db, account) = memory_db_with_account();
        let clock = Arc::new(ManualClock::new(1_000_000));
        let credentials = StoredCredentials::new(db.clone(), clock.clone());

        assert!(matches!(
            credentials.access_token(&account).await,
            Err(ProviderError::Unauthorized(_))
        ));

        db.save_tokens(&account, "token", "refresh", 1_000 + 3_600, 1_000).unwrap();
        assert_eq!(credentials.access_token(&account).await.unwrap(), "token");

        clock.set((1_000 + 3_560) * 1000);
        assert!(matches!(
            credentials.access_token(&account).await,
            Err(ProviderError::Unauthorized(_))
        ));
    }

    #[test]
    fn foreign_page_links_are_rejected() {
        let config = ProviderConfigResolved {
            api_base_url: "https://api.spotify.com/v1".to_string(),
            request_timeout: std::time::Duration::from_secs(5),
            collection_description: String::new(),
        };
        let (db, _account) = memory_db_with_account();
        let credentials = Arc::new(StoredCredentials::new(db, Arc::new(ManualClock::new(0))));
        let client = SpotifyClient::new(&config, credentials).unwrap();

        assert!(client.checked_cursor("https://api.spotify.com/v1/me/playlists?offset=50").is_ok());
        assert!(client.checked_cursor("https://evil.example/steal").is_err());
    }
}
