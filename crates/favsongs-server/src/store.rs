//! Persistent store capability used by the tracking core.
//!
//! Shared by every account task; implementations serialize their own writes.

use anyhow::Result;

use favsongs_types::{Settings, SettingsPatch};

use crate::play_recorder::RecordOutcome;

/// A completed listen ready to be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPlay {
    pub account_id: String,
    pub track_id: String,
    pub name: String,
    pub artist: String,
    pub played_at_ms: i64,
    /// Deduplication key, unique per account.
    pub play_instance_id: String,
}

/// Running totals for one (account, track) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FavoriteAggregate {
    pub occurrences: u32,
    pub last_played_ms: i64,
}

pub trait TrackerStore: Send + Sync {
    fn account_exists(&self, account_id: &str) -> Result<bool>;

    fn get_settings(&self, account_id: &str) -> Result<Settings>;

    fn update_settings(&self, account_id: &str, patch: &SettingsPatch) -> Result<Settings>;

    /// Remember (or forget) the resolved collection id.
    fn set_collection_id(&self, account_id: &str, collection_id: Option<&str>) -> Result<()>;

    /// Count a completed listen unless it duplicates an earlier one.
    ///
    /// The duplicate checks and the writes must be atomic with respect to
    /// other writers.
    fn record_play(&self, play: &CompletedPlay, min_play_gap_ms: u64) -> Result<RecordOutcome>;

    fn favorite_aggregate(&self, account_id: &str, track_id: &str)
        -> Result<Option<FavoriteAggregate>>;

    /// Persisted desired tracker state.
    fn is_running(&self, account_id: &str) -> Result<bool>;

    fn set_running(&self, account_id: &str, running: bool) -> Result<()>;

    fn list_running_account_ids(&self) -> Result<Vec<String>>;
}
