//! Playback provider capability.
//!
//! The tracker only talks to the provider through this trait so the core can
//! run against the real web API or an in-process fake.

use async_trait::async_trait;

use favsongs_types::PlaybackSnapshot;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Credentials are missing, expired, or were rejected.
    Unauthorized(String),
    /// The provider asked us to slow down (retry-after seconds, if given).
    RateLimited(Option<u64>),
    /// Network failure or an unexpected response status.
    Unavailable(String),
    /// The response could not be decoded.
    Malformed(String),
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderError::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            ProviderError::RateLimited(Some(secs)) => write!(f, "rate limited, retry after {secs}s"),
            ProviderError::RateLimited(None) => write!(f, "rate limited"),
            ProviderError::Unavailable(msg) => write!(f, "provider unavailable: {msg}"),
            ProviderError::Malformed(msg) => write!(f, "malformed provider response: {msg}"),
        }
    }
}

impl std::error::Error for ProviderError {}

/// One page of collection members.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionPage {
    pub track_ids: Vec<String>,
    /// Opaque cursor for the next page, `None` on the last page.
    pub next: Option<String>,
}

#[async_trait]
pub trait PlaybackProvider: Send + Sync {
    /// Current playback for the account, `None` when nothing is playing.
    async fn current_playback(
        &self,
        account_id: &str,
    ) -> Result<Option<PlaybackSnapshot>, ProviderError>;

    /// One page of track ids in the collection; pass the previous page's
    /// `next` cursor to continue.
    async fn collection_page(
        &self,
        account_id: &str,
        collection_id: &str,
        cursor: Option<&str>,
    ) -> Result<CollectionPage, ProviderError>;

    /// Append a track to the collection. Not idempotent.
    async fn add_to_collection(
        &self,
        account_id: &str,
        collection_id: &str,
        track_id: &str,
    ) -> Result<(), ProviderError>;

    /// Find the account's collection with exactly this name, creating it if absent.
    async fn resolve_or_create_collection(
        &self,
        account_id: &str,
        name: &str,
        public: bool,
    ) -> Result<String, ProviderError>;
}
