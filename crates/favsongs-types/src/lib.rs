use serde::{Deserialize, Serialize};

/// Name used when an account has not picked its own collection name.
pub const DEFAULT_COLLECTION_NAME: &str = "Favourite Songs - Whatsit";
/// Placeholder used when the provider reports a track without a name.
pub const UNKNOWN_TRACK: &str = "Unknown Track";
/// Placeholder used when the provider reports a track without artists.
pub const UNKNOWN_ARTIST: &str = "Unknown Artist";
/// Lower bound applied to any configured poll interval.
pub const MIN_CHECK_INTERVAL_SECS: u64 = 3;

/// One "current playback" observation reported by the playback provider.
///
/// Snapshots arrive unordered and partially redundant; consumers must not
/// assume progress only moves forward between two snapshots.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlaybackSnapshot {
    /// Provider track identifier.
    pub track_id: String,
    /// Track title, if reported.
    pub name: Option<String>,
    /// Artist names in provider order.
    pub artists: Vec<String>,
    /// Playback position in milliseconds.
    pub progress_ms: u64,
    /// Track length in milliseconds (`0` when unknown).
    pub duration_ms: u64,
    /// Provider timestamp for this observation (unix ms), if reported.
    pub timestamp_ms: Option<i64>,
    /// `false` when the provider reports the item as paused.
    pub is_playing: bool,
}

impl PlaybackSnapshot {
    /// Track title or the placeholder when the provider omitted it.
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(UNKNOWN_TRACK)
    }

    /// First artist or the placeholder when the provider sent none.
    pub fn primary_artist(&self) -> &str {
        self.artists
            .iter()
            .map(|artist| artist.as_str())
            .find(|artist| !artist.trim().is_empty())
            .unwrap_or(UNKNOWN_ARTIST)
    }
}

/// Per-account tracker settings.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    /// Occurrence count at which a track is added to the collection.
    pub favorite_threshold: u32,
    /// Fraction of a track that must be heard for a listen to count.
    pub min_completion_ratio: f64,
    /// Seconds between two playback polls.
    pub check_interval_secs: u64,
    /// Two counted listens of one track must be further apart than this.
    pub min_play_gap_ms: u64,
    /// How far progress has to jump back before a replay is assumed.
    pub restart_margin_ms: u64,
    /// Exact name of the target collection.
    pub collection_name: String,
    /// Visibility used when the collection has to be created.
    pub collection_public: bool,
    /// Whether reaching the threshold adds the track automatically.
    pub auto_add_enabled: bool,
    /// Resolved collection id, once found or created.
    pub collection_id: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            favorite_threshold: 5,
            min_completion_ratio: 0.8,
            check_interval_secs: 10,
            min_play_gap_ms: 300_000,
            restart_margin_ms: 5_000,
            collection_name: DEFAULT_COLLECTION_NAME.to_string(),
            collection_public: true,
            auto_add_enabled: true,
            collection_id: None,
        }
    }
}

impl Settings {
    /// Poll interval with the global lower bound applied.
    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.check_interval_secs.max(MIN_CHECK_INTERVAL_SECS))
    }
}

/// Partial settings update. `None` leaves the stored value untouched.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct SettingsPatch {
    pub favorite_threshold: Option<u32>,
    pub min_completion_ratio: Option<f64>,
    pub check_interval_secs: Option<u64>,
    pub min_play_gap_ms: Option<u64>,
    pub restart_margin_ms: Option<u64>,
    pub collection_name: Option<String>,
    pub collection_public: Option<bool>,
    pub auto_add_enabled: Option<bool>,
}

impl SettingsPatch {
    /// Returns true when the patch carries no field at all.
    pub fn is_empty(&self) -> bool {
        self == &SettingsPatch::default()
    }

    /// Check every present field against its allowed range.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(threshold) = self.favorite_threshold {
            if !(1..=20).contains(&threshold) {
                return Err(format!("favorite_threshold must be 1..=20, got {threshold}"));
            }
        }
        if let Some(ratio) = self.min_completion_ratio {
            if !(0.5..=1.0).contains(&ratio) {
                return Err(format!("min_completion_ratio must be 0.5..=1.0, got {ratio}"));
            }
        }
        if let Some(interval) = self.check_interval_secs {
            if !(MIN_CHECK_INTERVAL_SECS..=300).contains(&interval) {
                return Err(format!("check_interval_secs must be 3..=300, got {interval}"));
            }
        }
        if let Some(gap) = self.min_play_gap_ms {
            if gap > 86_400_000 {
                return Err(format!("min_play_gap_ms must be at most one day, got {gap}"));
            }
        }
        if let Some(margin) = self.restart_margin_ms {
            if margin > 60_000 {
                return Err(format!("restart_margin_ms must be at most 60000, got {margin}"));
            }
        }
        if let Some(name) = self.collection_name.as_deref() {
            let len = name.trim().chars().count();
            if len == 0 || len > 200 {
                return Err("collection_name must be 1..=200 characters".to_string());
            }
        }
        Ok(())
    }

    /// Apply the patch on top of `settings`.
    ///
    /// A new collection name drops the resolved collection id.
    pub fn apply_to(&self, settings: &mut Settings) {
        if let Some(value) = self.favorite_threshold {
            settings.favorite_threshold = value;
        }
        if let Some(value) = self.min_completion_ratio {
            settings.min_completion_ratio = value;
        }
        if let Some(value) = self.check_interval_secs {
            settings.check_interval_secs = value;
        }
        if let Some(value) = self.min_play_gap_ms {
            settings.min_play_gap_ms = value;
        }
        if let Some(value) = self.restart_margin_ms {
            settings.restart_margin_ms = value;
        }
        if let Some(value) = self.collection_name.as_ref() {
            let value = value.trim().to_string();
            if value != settings.collection_name {
                settings.collection_id = None;
            }
            settings.collection_name = value;
        }
        if let Some(value) = self.collection_public {
            settings.collection_public = value;
        }
        if let Some(value) = self.auto_add_enabled {
            settings.auto_add_enabled = value;
        }
    }
}

/// A connected provider account.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Account {
    /// Local account id.
    pub id: String,
    /// User id on the playback provider.
    pub provider_user_id: String,
    pub display_name: String,
    /// Creation time (unix seconds).
    pub created_at: i64,
    /// Persisted desired tracker state.
    pub tracker_running: bool,
}

/// Aggregated counted listens for one track.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FavoriteEntry {
    pub track_id: String,
    pub name: String,
    pub artist: String,
    pub occurrences: u32,
    pub last_played_ms: i64,
}

/// One counted listen.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecentPlay {
    pub track_id: String,
    pub name: String,
    pub artist: String,
    pub played_at_ms: i64,
}

/// Normalized now-playing view for dashboards.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NowPlaying {
    pub track_id: String,
    pub name: String,
    pub artist: String,
    pub progress_ms: u64,
    pub duration_ms: u64,
    pub is_playing: bool,
    /// `progress / duration`, `0.0` for unknown durations.
    pub completion_ratio: f64,
}

impl From<&PlaybackSnapshot> for NowPlaying {
    fn from(snapshot: &PlaybackSnapshot) -> Self {
        let completion_ratio = if snapshot.duration_ms > 0 {
            snapshot.progress_ms as f64 / snapshot.duration_ms as f64
        } else {
            0.0
        };
        Self {
            track_id: snapshot.track_id.clone(),
            name: snapshot.display_name().to_string(),
            artist: snapshot.primary_artist().to_string(),
            progress_ms: snapshot.progress_ms,
            duration_ms: snapshot.duration_ms,
            is_playing: snapshot.is_playing,
            completion_ratio,
        }
    }
}

/// Now-playing slot of the dashboard.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum NowPlayingState {
    Idle,
    Playing(NowPlaying),
    Error { message: String },
}

/// Listening statistics for an account.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DashboardStats {
    pub plays_last_24h: u64,
    pub max_occurrences: u32,
    pub favorite_threshold: u32,
    /// Plays left before the most played track reaches the threshold.
    pub plays_until_next_favorite: u32,
}

/// Summary view of one account.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AccountDashboard {
    pub account: Account,
    pub now_playing: NowPlayingState,
    pub stats: DashboardStats,
    pub recent: Vec<RecentPlay>,
}
