//! Turns finished listens into persisted plays.

use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;

use crate::store::{CompletedPlay, TrackerStore};
use crate::track_state::FinishedListen;

/// Why a completed listen did not increase the play count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotCountedReason {
    /// This exact listen was already recorded.
    DuplicateInstance,
    /// The previous counted listen of the track is too recent.
    WithinPlayGap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Recorded; carries the new occurrence count.
    Counted(u32),
    NotCounted(NotCountedReason),
}

/// Dedup key for a listen, falling back to `{track_id}:{played_at}`.
pub fn play_instance_key(track_id: &str, play_instance_id: Option<&str>, played_at_ms: i64) -> String {
    match play_instance_id.filter(|id| !id.is_empty()) {
        Some(id) => id.to_string(),
        None => format!("{track_id}:{played_at_ms}"),
    }
}

#[derive(Clone)]
pub struct PlayRecorder {
    store: Arc<dyn TrackerStore>,
}

impl PlayRecorder {
    pub fn new(store: Arc<dyn TrackerStore>) -> Self {
        Self { store }
    }

    /// Persist a completed listen for `account_id`.
    pub fn record(
        &self,
        account_id: &str,
        listen: &FinishedListen,
        min_play_gap_ms: u64,
    ) -> Result<RecordOutcome> {
        let play = CompletedPlay {
            account_id: account_id.to_string(),
            track_id: listen.track_id.clone(),
            name: listen.name.clone(),
            artist: listen.artist.clone(),
            played_at_ms: listen.observed_at_ms,
            play_instance_id: play_instance_key(
                &listen.track_id,
                listen.play_instance_id.as_deref(),
                listen.observed_at_ms,
            ),
        };
        self.store.record_play(&play, min_play_gap_ms)
    }
}
