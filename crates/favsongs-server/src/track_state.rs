//! Per-account track observation state machine.
//!
//! Applies noisy playback snapshots to a single "currently observed track"
//! record and reports when an observation ends, either because another track
//! replaced it or because the same track started over.

use favsongs_types::PlaybackSnapshot;

/// Default distance progress has to jump back before a replay is assumed.
pub const DEFAULT_RESTART_MARGIN_MS: u64 = 5_000;

/// The in-memory observation of one account's current track.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeTrackState {
    /// `None` while idle.
    pub track_id: Option<String>,
    pub name: String,
    pub artist: String,
    /// Highest progress seen during this observation.
    pub progress_ms: u64,
    pub duration_ms: u64,
    /// Timestamp of the last applied snapshot (unix ms).
    pub observed_at_ms: i64,
    /// Identifies this particular listen, see [`derive_play_instance_id`].
    pub play_instance_id: Option<String>,
}

/// An observation that ended and is ready for evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedListen {
    pub track_id: String,
    pub name: String,
    pub artist: String,
    pub progress_ms: u64,
    pub duration_ms: u64,
    pub observed_at_ms: i64,
    pub play_instance_id: Option<String>,
}

/// Result of applying one snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Nothing playing; state untouched.
    Ignored,
    /// Idle -> tracking.
    Started,
    /// Same listen continues.
    Continued,
    /// Same track started over; the previous listen ended.
    Restarted(FinishedListen),
    /// Another track replaced the previous one.
    Replaced(FinishedListen),
}

impl Transition {
    /// The listen that ended with this transition, if any.
    pub fn into_finished(self) -> Option<FinishedListen> {
        match self {
            Transition::Restarted(listen) | Transition::Replaced(listen) => Some(listen),
            _ => None,
        }
    }
}

/// Name one physical listen as `{track_id}:{start_ms}`.
///
/// The start time is approximated as `timestamp - progress`, which stays
/// stable across polls of a continuous play and changes when the track is
/// played again from the top. Without a timestamp there is no identifier.
pub fn derive_play_instance_id(
    track_id: &str,
    timestamp_ms: Option<i64>,
    progress_ms: u64,
) -> Option<String> {
    let timestamp_ms = timestamp_ms.filter(|ts| *ts > 0)?;
    if track_id.is_empty() {
        return None;
    }
    let progress_ms = i64::try_from(progress_ms).unwrap_or(i64::MAX);
    let start_ms = timestamp_ms.saturating_sub(progress_ms).max(0);
    Some(format!("{track_id}:{start_ms}"))
}

#[derive(Debug)]
pub struct TrackStateMachine {
    state: RuntimeTrackState,
    restart_margin_ms: u64,
}

impl Default for TrackStateMachine {
    fn default() -> Self {
        Self::new(DEFAULT_RESTART_MARGIN_MS)
    }
}

impl TrackStateMachine {
    pub fn new(restart_margin_ms: u64) -> Self {
        Self {
            state: RuntimeTrackState::default(),
            restart_margin_ms,
        }
    }

    pub fn set_restart_margin(&mut self, restart_margin_ms: u64) {
        self.restart_margin_ms = restart_margin_ms;
    }

    pub fn state(&self) -> &RuntimeTrackState {
        &self.state
    }

    pub fn is_tracking(&self) -> bool {
        self.state.track_id.is_some()
    }

    /// Apply one snapshot. `now_ms` stands in for a missing provider timestamp.
    ///
    /// Absence of playback is not evidence that a listen ended, so `None`
    /// never finalizes anything.
    pub fn apply(&mut self, snapshot: Option<&PlaybackSnapshot>, now_ms: i64) -> Transition {
        let Some(snapshot) = snapshot.filter(|s| !s.track_id.is_empty()) else {
            return Transition::Ignored;
        };
        let instance_id = derive_play_instance_id(
            &snapshot.track_id,
            snapshot.timestamp_ms,
            snapshot.progress_ms,
        );

        let Some(current_id) = self.state.track_id.as_deref() else {
            self.load(snapshot, instance_id, now_ms);
            return Transition::Started;
        };

        if current_id != snapshot.track_id {
            let finished = self.finished_listen();
            self.load(snapshot, instance_id, now_ms);
            return match finished {
                Some(listen) => Transition::Replaced(listen),
                None => Transition::Started,
            };
        }

        if self.is_restart(snapshot.progress_ms, instance_id.as_deref()) {
            let finished = self.finished_listen();
            self.load(snapshot, instance_id, now_ms);
            return match finished {
                Some(listen) => Transition::Restarted(listen),
                None => Transition::Started,
            };
        }

        // Stale or out-of-order snapshots must not pull progress back.
        if snapshot.progress_ms > self.state.progress_ms {
            self.state.progress_ms = snapshot.progress_ms;
        }
        if snapshot.duration_ms > 0 {
            self.state.duration_ms = snapshot.duration_ms;
        }
        if let Some(ts) = snapshot.timestamp_ms.filter(|ts| *ts > 0) {
            self.state.observed_at_ms = ts;
        }
        if instance_id.is_some() {
            self.state.play_instance_id = instance_id;
        }
        Transition::Continued
    }

    /// End the current observation, returning it. The machine is idle afterwards.
    pub fn flush(&mut self) -> Option<FinishedListen> {
        let finished = self.finished_listen();
        self.reset();
        finished
    }

    /// Drop the current observation without reporting it.
    pub fn reset(&mut self) {
        self.state.track_id = None;
        self.state.name.clear();
        self.state.artist.clear();
        self.state.progress_ms = 0;
        self.state.duration_ms = 0;
        self.state.observed_at_ms = 0;
        self.state.play_instance_id = None;
    }

    fn is_restart(&self, progress_ms: u64, instance_id: Option<&str>) -> bool {
        let regressed = progress_ms < self.state.progress_ms
            && self.state.progress_ms - progress_ms >= self.restart_margin_ms;
        if !regressed {
            return false;
        }
        match (self.state.play_instance_id.as_deref(), instance_id) {
            (Some(stored), Some(new)) => stored != new,
            // Without identifiers only the progress jump is left to go on.
            _ => true,
        }
    }

    fn finished_listen(&self) -> Option<FinishedListen> {
        let track_id = self.state.track_id.clone()?;
        Some(FinishedListen {
            track_id,
            name: self.state.name.clone(),
            artist: self.state.artist.clone(),
            progress_ms: self.state.progress_ms,
            duration_ms: self.state.duration_ms,
            observed_at_ms: self.state.observed_at_ms,
            play_instance_id: self.state.play_instance_id.clone(),
        })
    }

    fn load(&mut self, snapshot: &PlaybackSnapshot, instance_id: Option<String>, now_ms: i64) {
        let state = &mut self.state;
        state.track_id = Some(snapshot.track_id.clone());
        state.name.clear();
        state.name.push_str(snapshot.display_name());
        state.artist.clear();
        state.artist.push_str(snapshot.primary_artist());
        state.progress_ms = snapshot.progress_ms;
        state.duration_ms = snapshot.duration_ms;
        state.observed_at_ms = snapshot.timestamp_ms.filter(|ts| *ts > 0).unwrap_or(now_ms);
        state.play_instance_id = instance_id;
    }
}
