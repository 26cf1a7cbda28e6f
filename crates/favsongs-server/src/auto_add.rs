//! Adds frequently played tracks to the account's collection.

use std::sync::Arc;

use favsongs_types::Settings;

use crate::collection_cache::CollectionCache;
use crate::provider::PlaybackProvider;
use crate::store::TrackerStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    BelowThreshold,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    AlreadyPresent,
    Skipped(SkipReason),
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddMode {
    /// Threshold-driven add; never duplicates a collection entry.
    Organic,
    /// Manual override; skips the membership check.
    Force,
}

pub fn threshold_reached(occurrences: u32, settings: &Settings) -> bool {
    occurrences >= settings.favorite_threshold
}

#[derive(Clone)]
pub struct AutoAddPolicy {
    store: Arc<dyn TrackerStore>,
    provider: Arc<dyn PlaybackProvider>,
}

impl AutoAddPolicy {
    pub fn new(store: Arc<dyn TrackerStore>, provider: Arc<dyn PlaybackProvider>) -> Self {
        Self { store, provider }
    }

    /// Add `track_id` if auto-add is on and the threshold is reached.
    pub async fn maybe_add(
        &self,
        cache: &mut CollectionCache,
        account_id: &str,
        track_id: &str,
        occurrences: u32,
        settings: &Settings,
        now_ms: i64,
    ) -> AddOutcome {
        if !settings.auto_add_enabled {
            return AddOutcome::Skipped(SkipReason::Disabled);
        }
        if !threshold_reached(occurrences, settings) {
            return AddOutcome::Skipped(SkipReason::BelowThreshold);
        }
        self.add_track(cache, account_id, track_id, settings, AddMode::Organic, now_ms)
            .await
    }

    pub async fn add_track(
        &self,
        cache: &mut CollectionCache,
        account_id: &str,
        track_id: &str,
        settings: &Settings,
        mode: AddMode,
        now_ms: i64,
    ) -> AddOutcome {
        let collection_id = match self.resolve_collection(account_id, settings).await {
            Ok(id) => id,
            Err(err) => {
                tracing::warn!(
                    account_id = %account_id,
                    track_id = %track_id,
                    error = %err,
                    "collection: resolve failed"
                );
                cache.invalidate();
                return AddOutcome::Failed(err);
            }
        };

        if mode == AddMode::Organic {
            let present = cache
                .membership(self.provider.as_ref(), account_id, &collection_id, now_ms)
                .await
                .map(|members| members.contains(track_id));
            match present {
                Ok(true) => return AddOutcome::AlreadyPresent,
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(
                        account_id = %account_id,
                        collection_id = %collection_id,
                        error = %err,
                        "collection: membership fetch failed"
                    );
                    cache.invalidate();
                    return AddOutcome::Failed(err.to_string());
                }
            }
        }

        match self
            .provider
            .add_to_collection(account_id, &collection_id, track_id)
            .await
        {
            Ok(()) => {
                cache.insert(&collection_id, track_id);
                tracing::info!(
                    account_id = %account_id,
                    track_id = %track_id,
                    collection_id = %collection_id,
                    forced = mode == AddMode::Force,
                    "collection: track added"
                );
                AddOutcome::Added
            }
            Err(err) => {
                tracing::warn!(
                    account_id = %account_id,
                    track_id = %track_id,
                    collection_id = %collection_id,
                    error = %err,
                    "collection: add failed"
                );
                cache.invalidate();
                AddOutcome::Failed(err.to_string())
            }
        }
    }

    /// Resolved collection id, looked up or created on first use and then
    /// remembered in the account settings.
    async fn resolve_collection(&self, account_id: &str, settings: &Settings) -> Result<String, String> {
        if let Some(id) = settings.collection_id.as_deref().filter(|id| !id.is_empty()) {
            return Ok(id.to_string());
        }
        let id = self
            .provider
            .resolve_or_create_collection(
                account_id,
                &settings.collection_name,
                settings.collection_public,
            )
            .await
            .map_err(|err| err.to_string())?;
        if let Err(err) = self.store.set_collection_id(account_id, Some(&id)) {
            tracing::warn!(
                account_id = %account_id,
                error = %err,
                "collection: failed to persist collection id"
            );
        }
        Ok(id)
    }
}
