//! TTL-bounded cache of collection membership for one account.
//!
//! Owned by the account's tracker task, so no locking is involved.

use std::collections::HashSet;

use crate::provider::{PlaybackProvider, ProviderError};

/// Default membership lifetime.
pub const DEFAULT_CACHE_TTL_MS: i64 = 300_000;

#[derive(Debug, Clone)]
pub struct CollectionCacheEntry {
    pub collection_id: String,
    pub track_ids: HashSet<String>,
    /// `None` forces a refresh on next access.
    pub cached_at_ms: Option<i64>,
}

#[derive(Debug)]
pub struct CollectionCache {
    ttl_ms: i64,
    entry: Option<CollectionCacheEntry>,
}

impl CollectionCache {
    pub fn new(ttl_ms: i64) -> Self {
        Self { ttl_ms, entry: None }
    }

    pub fn entry(&self) -> Option<&CollectionCacheEntry> {
        self.entry.as_ref()
    }

    /// Track ids in the collection, refreshed from the provider when the
    /// cached copy is for another collection or older than the TTL.
    pub async fn membership(
        &mut self,
        provider: &dyn PlaybackProvider,
        account_id: &str,
        collection_id: &str,
        now_ms: i64,
    ) -> Result<&HashSet<String>, ProviderError> {
        if !self.is_fresh(collection_id, now_ms) {
            let track_ids = fetch_all(provider, account_id, collection_id).await?;
            tracing::debug!(
                account_id = %account_id,
                collection_id = %collection_id,
                count = track_ids.len(),
                "collection: membership refreshed"
            );
            self.entry = Some(CollectionCacheEntry {
                collection_id: collection_id.to_string(),
                track_ids,
                cached_at_ms: Some(now_ms),
            });
        }
        match self.entry.as_ref() {
            Some(entry) => Ok(&entry.track_ids),
            None => Err(ProviderError::Unavailable("collection cache empty".to_string())),
        }
    }

    /// Record a successful add without a refetch.
    pub fn insert(&mut self, collection_id: &str, track_id: &str) {
        if let Some(entry) = self.entry.as_mut() {
            if entry.collection_id == collection_id {
                entry.track_ids.insert(track_id.to_string());
            }
        }
    }

    /// Force the next access to refetch the whole collection.
    pub fn invalidate(&mut self) {
        if let Some(entry) = self.entry.as_mut() {
            entry.cached_at_ms = None;
        }
    }

    fn is_fresh(&self, collection_id: &str, now_ms: i64) -> bool {
        let Some(entry) = self.entry.as_ref() else {
            return false;
        };
        let Some(cached_at_ms) = entry.cached_at_ms else {
            return false;
        };
        entry.collection_id == collection_id && now_ms.saturating_sub(cached_at_ms) < self.ttl_ms
    }
}

async fn fetch_all(
    provider: &dyn PlaybackProvider,
    account_id: &str,
    collection_id: &str,
) -> Result<HashSet<String>, ProviderError> {
    let mut track_ids = HashSet::new();
    let mut cursor: Option<String> = None;
    loop {
        let page = provider
            .collection_page(account_id, collection_id, cursor.as_deref())
            .await?;
        track_ids.extend(page.track_ids);
        match page.next {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }
    Ok(track_ids)
}
