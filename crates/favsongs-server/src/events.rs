//! In-process event bus for tracker updates.
//!
//! Publishing never blocks: events are dropped when nobody listens and
//! slow subscribers see `Lagged` instead of holding up the loop.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::play_recorder::NotCountedReason;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrackerEvent {
    TrackerStarted { account_id: String },
    TrackerStopped { account_id: String },
    ListenCounted {
        account_id: String,
        track_id: String,
        occurrences: u32,
    },
    ListenNotCounted {
        account_id: String,
        track_id: String,
        reason: NotCountedReason,
    },
    TrackAdded { account_id: String, track_id: String },
    AddFailed {
        account_id: String,
        track_id: String,
        error: String,
    },
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<TrackerEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a new event bus with a bounded broadcast channel.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(64);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TrackerEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: TrackerEvent) {
        let _ = self.sender.send(event);
    }
}
