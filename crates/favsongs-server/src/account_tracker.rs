//! One account's polling iteration.
//!
//! An `AccountTracker` is owned by exactly one task and holds the account's
//! observation state and collection cache.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use favsongs_types::Settings;

use crate::auto_add::{AddMode, AddOutcome, AutoAddPolicy};
use crate::clock::Clock;
use crate::collection_cache::CollectionCache;
use crate::completion::is_completed;
use crate::events::{EventBus, TrackerEvent};
use crate::play_recorder::{NotCountedReason, PlayRecorder, RecordOutcome};
use crate::provider::PlaybackProvider;
use crate::store::TrackerStore;
use crate::track_state::{FinishedListen, TrackStateMachine, Transition};

/// What happened to a listen once its observation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// Not enough of the track was heard.
    Incomplete,
    NotCounted(NotCountedReason),
    Counted { occurrences: u32, add: AddOutcome },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub transition: Transition,
    /// Outcome of a listen held back by an earlier failure.
    pub recovered: Option<FinalizeOutcome>,
    pub finalized: Option<FinalizeOutcome>,
}

/// Shared collaborators handed to every account task.
#[derive(Clone)]
pub struct TrackerDeps {
    pub store: Arc<dyn TrackerStore>,
    pub provider: Arc<dyn PlaybackProvider>,
    pub clock: Arc<dyn Clock>,
    pub events: EventBus,
    pub cache_ttl_ms: i64,
}

pub struct AccountTracker {
    account_id: String,
    deps: TrackerDeps,
    recorder: PlayRecorder,
    auto_add: AutoAddPolicy,
    machine: TrackStateMachine,
    cache: CollectionCache,
    pending: Option<FinishedListen>,
    poll_interval: Duration,
}

impl AccountTracker {
    pub fn new(account_id: impl Into<String>, deps: TrackerDeps) -> Self {
        let defaults = Settings::default();
        Self {
            account_id: account_id.into(),
            recorder: PlayRecorder::new(deps.store.clone()),
            auto_add: AutoAddPolicy::new(deps.store.clone(), deps.provider.clone()),
            machine: TrackStateMachine::new(defaults.restart_margin_ms),
            cache: CollectionCache::new(deps.cache_ttl_ms),
            pending: None,
            poll_interval: defaults.poll_interval(),
            deps,
        }
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    /// Interval from the most recently loaded settings.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn machine(&self) -> &TrackStateMachine {
        &self.machine
    }

    /// Poll once and apply the snapshot, finalizing any listen it ends.
    ///
    /// A finished listen that could not be recorded is kept and retried
    /// first on the next tick.
    pub async fn tick(&mut self) -> Result<TickReport> {
        let settings = self
            .deps
            .store
            .get_settings(&self.account_id)
            .context("load tracker settings")?;
        self.poll_interval = settings.poll_interval();
        self.machine.set_restart_margin(settings.restart_margin_ms);

        let recovered = self.retry_pending(&settings).await?;

        let snapshot = self
            .deps
            .provider
            .current_playback(&self.account_id)
            .await
            .context("poll current playback")?;
        let transition = self
            .machine
            .apply(snapshot.as_ref(), self.deps.clock.now_ms());
        if matches!(transition, Transition::Started) {
            tracing::debug!(
                account_id = %self.account_id,
                track_id = ?self.machine.state().track_id,
                "tracker: observing track"
            );
        }

        let finalized = match transition.clone().into_finished() {
            Some(listen) => Some(self.finalize_or_keep(listen, &settings).await?),
            None => None,
        };
        Ok(TickReport {
            transition,
            recovered,
            finalized,
        })
    }

    /// Finalize a held-back listen and whatever is being observed. Used when
    /// the task stops.
    pub async fn flush(&mut self) -> Result<Option<FinalizeOutcome>> {
        if self.pending.is_none() && !self.machine.is_tracking() {
            return Ok(None);
        }
        let settings = self
            .deps
            .store
            .get_settings(&self.account_id)
            .context("load tracker settings")?;
        let recovered = self.retry_pending(&settings).await?;
        match self.machine.flush() {
            Some(listen) => self.finalize_or_keep(listen, &settings).await.map(Some),
            None => Ok(recovered),
        }
    }

    /// A listen that ended but is not recorded yet.
    pub fn pending(&self) -> Option<&FinishedListen> {
        self.pending.as_ref()
    }

    async fn retry_pending(&mut self, settings: &Settings) -> Result<Option<FinalizeOutcome>> {
        match self.pending.take() {
            Some(listen) => {
                tracing::debug!(
                    account_id = %self.account_id,
                    track_id = %listen.track_id,
                    "tracker: retrying unrecorded listen"
                );
                self.finalize_or_keep(listen, settings).await.map(Some)
            }
            None => Ok(None),
        }
    }

    async fn finalize_or_keep(
        &mut self,
        listen: FinishedListen,
        settings: &Settings,
    ) -> Result<FinalizeOutcome> {
        match self.finalize(&listen, settings).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.pending = Some(listen);
                Err(err)
            }
        }
    }

    pub async fn finalize(
        &mut self,
        listen: &FinishedListen,
        settings: &Settings,
    ) -> Result<FinalizeOutcome> {
        if !is_completed(
            listen.progress_ms,
            listen.duration_ms,
            settings.min_completion_ratio,
        ) {
            tracing::debug!(
                account_id = %self.account_id,
                track_id = %listen.track_id,
                progress_ms = listen.progress_ms,
                duration_ms = listen.duration_ms,
                "tracker: listen incomplete"
            );
            return Ok(FinalizeOutcome::Incomplete);
        }

        let outcome = self
            .recorder
            .record(&self.account_id, listen, settings.min_play_gap_ms)
            .context("record play")?;
        let occurrences = match outcome {
            RecordOutcome::NotCounted(reason) => {
                tracing::debug!(
                    account_id = %self.account_id,
                    track_id = %listen.track_id,
                    reason = ?reason,
                    "tracker: listen not counted"
                );
                self.deps.events.publish(TrackerEvent::ListenNotCounted {
                    account_id: self.account_id.clone(),
                    track_id: listen.track_id.clone(),
                    reason,
                });
                return Ok(FinalizeOutcome::NotCounted(reason));
            }
            RecordOutcome::Counted(occurrences) => occurrences,
        };

        tracing::info!(
            account_id = %self.account_id,
            track_id = %listen.track_id,
            name = %listen.name,
            artist = %listen.artist,
            occurrences,
            "tracker: listen counted"
        );
        self.deps.events.publish(TrackerEvent::ListenCounted {
            account_id: self.account_id.clone(),
            track_id: listen.track_id.clone(),
            occurrences,
        });

        let add = self
            .auto_add
            .maybe_add(
                &mut self.cache,
                &self.account_id,
                &listen.track_id,
                occurrences,
                settings,
                self.deps.clock.now_ms(),
            )
            .await;
        self.publish_add(&listen.track_id, &add);
        Ok(FinalizeOutcome::Counted { occurrences, add })
    }

    /// Manual override: add the track regardless of play count or membership.
    pub async fn force_add(&mut self, track_id: &str) -> AddOutcome {
        let settings = match self.deps.store.get_settings(&self.account_id) {
            Ok(settings) => settings,
            Err(err) => return AddOutcome::Failed(format!("{err:#}")),
        };
        let outcome = self
            .auto_add
            .add_track(
                &mut self.cache,
                &self.account_id,
                track_id,
                &settings,
                AddMode::Force,
                self.deps.clock.now_ms(),
            )
            .await;
        self.publish_add(track_id, &outcome);
        outcome
    }

    fn publish_add(&self, track_id: &str, outcome: &AddOutcome) {
        let event = match outcome {
            AddOutcome::Added => TrackerEvent::TrackAdded {
                account_id: self.account_id.clone(),
                track_id: track_id.to_string(),
            },
            AddOutcome::Failed(error) => TrackerEvent::AddFailed {
                account_id: self.account_id.clone(),
                track_id: track_id.to_string(),
                error: error.clone(),
            },
            AddOutcome::AlreadyPresent | AddOutcome::Skipped(_) => return,
        };
        self.deps.events.publish(event);
    }
}
