//! In-process fakes shared by the unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use favsongs_types::{PlaybackSnapshot, Settings, SettingsPatch};

use crate::clock::Clock;
use crate::play_recorder::RecordOutcome;
use crate::provider::{CollectionPage, PlaybackProvider, ProviderError};
use crate::store::{CompletedPlay, FavoriteAggregate, TrackerStore};
use crate::tracker_db::TrackerDb;

/// Fresh in-memory database with one linked account.
pub(crate) fn memory_db_with_account() -> (Arc<TrackerDb>, String) {
    memory_db_with_settings(Settings::default())
}

pub(crate) fn memory_db_with_settings(defaults: Settings) -> (Arc<TrackerDb>, String) {
    let db = TrackerDb::open_in_memory(defaults).expect("open in-memory db");
    let account = db
        .upsert_account("provider-user", "Test User", 0)
        .expect("create account");
    (Arc::new(db), account.id)
}

pub(crate) fn snapshot(track_id: &str, progress_ms: u64, timestamp_ms: Option<i64>) -> PlaybackSnapshot {
    PlaybackSnapshot {
        track_id: track_id.to_string(),
        name: Some(format!("Song {track_id}")),
        artists: vec!["Artist".to_string()],
        progress_ms,
        duration_ms: 200_000,
        timestamp_ms,
        is_playing: true,
    }
}

#[derive(Default)]
struct FakeState {
    playback: Option<PlaybackSnapshot>,
    playback_error: Option<ProviderError>,
    collections: HashMap<String, Vec<String>>,
    named: HashMap<String, String>,
    page_calls: usize,
    playback_calls: usize,
    resolve_calls: usize,
    added: Vec<(String, String)>,
    fail_adds: bool,
}

/// Scriptable provider with call counters.
pub(crate) struct FakeProvider {
    page_size: usize,
    state: Mutex<FakeState>,
}

impl FakeProvider {
    pub(crate) fn new() -> Self {
        Self {
            page_size: 100,
            state: Mutex::new(FakeState::default()),
        }
    }

    pub(crate) fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake provider state")
    }

    pub(crate) fn set_collection(&self, collection_id: &str, track_ids: &[&str]) {
        self.state().collections.insert(
            collection_id.to_string(),
            track_ids.iter().map(|id| id.to_string()).collect(),
        );
    }

    /// Register an existing collection under `name` so resolution finds it.
    pub(crate) fn name_collection(&self, name: &str, collection_id: &str) {
        let mut state = self.state();
        state.named.insert(name.to_string(), collection_id.to_string());
        state.collections.entry(collection_id.to_string()).or_default();
    }

    pub(crate) fn set_playback(&self, playback: Option<PlaybackSnapshot>) {
        let mut state = self.state();
        state.playback = playback;
        state.playback_error = None;
    }

    pub(crate) fn set_playback_error(&self, error: ProviderError) {
        self.state().playback_error = Some(error);
    }

    pub(crate) fn set_fail_adds(&self, fail: bool) {
        self.state().fail_adds = fail;
    }

    pub(crate) fn page_calls(&self) -> usize {
        self.state().page_calls
    }

    pub(crate) fn playback_calls(&self) -> usize {
        self.state().playback_calls
    }

    pub(crate) fn resolve_calls(&self) -> usize {
        self.state().resolve_calls
    }

    /// `(collection_id, track_id)` pairs in call order, failed calls included.
    pub(crate) fn added(&self) -> Vec<(String, String)> {
        self.state().added.clone()
    }

    pub(crate) fn collection(&self, collection_id: &str) -> Vec<String> {
        self.state()
            .collections
            .get(collection_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl PlaybackProvider for FakeProvider {
    async fn current_playback(
        &self,
        _account_id: &str,
    ) -> Result<Option<PlaybackSnapshot>, ProviderError> {
        let mut state = self.state();
        state.playback_calls += 1;
        if let Some(error) = state.playback_error.clone() {
            return Err(error);
        }
        Ok(state.playback.clone())
    }

    async fn collection_page(
        &self,
        _account_id: &str,
        collection_id: &str,
        cursor: Option<&str>,
    ) -> Result<CollectionPage, ProviderError> {
        let mut state = self.state();
        state.page_calls += 1;
        let Some(tracks) = state.collections.get(collection_id) else {
            return Err(ProviderError::Unavailable(format!(
                "unknown collection {collection_id}"
            )));
        };
        let offset = match cursor {
            Some(cursor) => cursor
                .parse::<usize>()
                .map_err(|_| ProviderError::Malformed(format!("bad cursor {cursor}")))?,
            None => 0,
        };
        let end = (offset + self.page_size).min(tracks.len());
        let track_ids = tracks.get(offset..end).map(<[String]>::to_vec).unwrap_or_default();
        let next = (end < tracks.len()).then(|| end.to_string());
        Ok(CollectionPage { track_ids, next })
    }

    async fn add_to_collection(
        &self,
        _account_id: &str,
        collection_id: &str,
        track_id: &str,
    ) -> Result<(), ProviderError> {
        let mut state = self.state();
        state
            .added
            .push((collection_id.to_string(), track_id.to_string()));
        if state.fail_adds {
            return Err(ProviderError::Unavailable("add rejected".to_string()));
        }
        state
            .collections
            .entry(collection_id.to_string())
            .or_default()
            .insert(0, track_id.to_string());
        Ok(())
    }

    async fn resolve_or_create_collection(
        &self,
        _account_id: &str,
        name: &str,
        _public: bool,
    ) -> Result<String, ProviderError> {
        let mut state = self.state();
        state.resolve_calls += 1;
        if let Some(id) = state.named.get(name) {
            return Ok(id.clone());
        }
        let id = format!("created-{}", state.named.len() + 1);
        state.named.insert(name.to_string(), id.clone());
        state.collections.insert(id.clone(), Vec::new());
        Ok(id)
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub(crate) struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub(crate) fn new(now_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(now_ms),
        }
    }

    pub(crate) fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub(crate) fn advance(&self, delta_ms: i64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Store wrapper whose `record_play` fails a scripted number of times.
pub(crate) struct FlakyStore {
    inner: Arc<TrackerDb>,
    record_failures: AtomicUsize,
}

impl FlakyStore {
    pub(crate) fn new(inner: Arc<TrackerDb>) -> Self {
        Self {
            inner,
            record_failures: AtomicUsize::new(0),
        }
    }

    pub(crate) fn fail_records(&self, times: usize) {
        self.record_failures.store(times, Ordering::SeqCst);
    }
}

impl TrackerStore for FlakyStore {
    fn account_exists(&self, account_id: &str) -> Result<bool> {
        self.inner.account_exists(account_id)
    }

    fn get_settings(&self, account_id: &str) -> Result<Settings> {
        self.inner.get_settings(account_id)
    }

    fn update_settings(&self, account_id: &str, patch: &SettingsPatch) -> Result<Settings> {
        self.inner.update_settings(account_id, patch)
    }

    fn set_collection_id(&self, account_id: &str, collection_id: Option<&str>) -> Result<()> {
        self.inner.set_collection_id(account_id, collection_id)
    }

    fn record_play(&self, play: &CompletedPlay, min_play_gap_ms: u64) -> Result<RecordOutcome> {
        let failing = self
            .record_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(anyhow!("database is locked"));
        }
        self.inner.record_play(play, min_play_gap_ms)
    }

    fn favorite_aggregate(
        &self,
        account_id: &str,
        track_id: &str,
    ) -> Result<Option<FavoriteAggregate>> {
        self.inner.favorite_aggregate(account_id, track_id)
    }

    fn is_running(&self, account_id: &str) -> Result<bool> {
        self.inner.is_running(account_id)
    }

    fn set_running(&self, account_id: &str, running: bool) -> Result<()> {
        self.inner.set_running(account_id, running)
    }

    fn list_running_account_ids(&self) -> Result<Vec<String>> {
        self.inner.list_running_account_ids()
    }
}
