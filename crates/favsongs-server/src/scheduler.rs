//! Per-account tracker tasks.
//!
//! Each running account gets its own tokio task that owns an
//! [`AccountTracker`]. The manager only keeps handles to cancel, message,
//! and join those tasks.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::account_tracker::{AccountTracker, TrackerDeps};
use crate::auto_add::AddOutcome;
use crate::events::TrackerEvent;

enum TrackerCommand {
    ForceAdd {
        track_id: String,
        reply: oneshot::Sender<AddOutcome>,
    },
}

struct TrackerHandle {
    cancel: CancellationToken,
    commands: mpsc::Sender<TrackerCommand>,
    join: JoinHandle<()>,
}

impl TrackerHandle {
    fn is_alive(&self) -> bool {
        !self.join.is_finished()
    }
}

pub struct TrackerManager {
    deps: TrackerDeps,
    trackers: Mutex<HashMap<String, TrackerHandle>>,
}

impl TrackerManager {
    pub fn new(deps: TrackerDeps) -> Self {
        Self {
            deps,
            trackers: Mutex::new(HashMap::new()),
        }
    }

    fn lock_trackers(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, TrackerHandle>>> {
        self.trackers
            .lock()
            .map_err(|_| anyhow!("tracker registry lock poisoned"))
    }

    /// Persist the running flag and spawn the account's task unless one is alive.
    pub fn start(&self, account_id: &str) -> Result<()> {
        if !self.deps.store.account_exists(account_id)? {
            return Err(anyhow!("unknown account {account_id}"));
        }
        self.deps.store.set_running(account_id, true)?;

        let mut trackers = self.lock_trackers()?;
        if trackers.get(account_id).is_some_and(TrackerHandle::is_alive) {
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let (commands, receiver) = mpsc::channel(8);
        let tracker = AccountTracker::new(account_id, self.deps.clone());
        let join = tokio::spawn(run_tracker(tracker, self.deps.clone(), cancel.clone(), receiver));
        trackers.insert(
            account_id.to_string(),
            TrackerHandle {
                cancel,
                commands,
                join,
            },
        );
        Ok(())
    }

    /// Clear the running flag, then cancel the task and wait for its final flush.
    pub async fn stop(&self, account_id: &str) -> Result<()> {
        self.deps.store.set_running(account_id, false)?;
        let handle = self.lock_trackers()?.remove(account_id);
        if let Some(handle) = handle {
            handle.cancel.cancel();
            if let Err(err) = handle.join.await {
                tracing::warn!(account_id = %account_id, error = %err, "tracker: task join failed");
            }
        }
        Ok(())
    }

    /// Start every account whose running flag survived the last shutdown.
    pub fn start_saved(&self) -> Result<usize> {
        let mut started = 0;
        for account_id in self.deps.store.list_running_account_ids()? {
            match self.start(&account_id) {
                Ok(()) => started += 1,
                Err(err) => {
                    tracing::warn!(
                        account_id = %account_id,
                        error = %format!("{err:#}"),
                        "tracker: resume failed"
                    );
                }
            }
        }
        Ok(started)
    }

    /// Cancel all tasks and wait for their flush. Running flags are kept.
    pub async fn shutdown(&self) {
        let handles = match self.lock_trackers() {
            Ok(mut trackers) => trackers.drain().collect::<Vec<_>>(),
            Err(err) => {
                tracing::error!(error = %err, "tracker: shutdown skipped");
                return;
            }
        };
        for (_, handle) in &handles {
            handle.cancel.cancel();
        }
        for (account_id, handle) in handles {
            if let Err(err) = handle.join.await {
                tracing::warn!(account_id = %account_id, error = %err, "tracker: task join failed");
            }
        }
    }

    /// Add a track to the account's collection regardless of play count.
    pub async fn force_add(&self, account_id: &str, track_id: &str) -> Result<AddOutcome> {
        if !self.deps.store.account_exists(account_id)? {
            return Err(anyhow!("unknown account {account_id}"));
        }
        let commands = self
            .lock_trackers()?
            .get(account_id)
            .filter(|handle| handle.is_alive())
            .map(|handle| handle.commands.clone());

        if let Some(commands) = commands {
            let (reply, response) = oneshot::channel();
            let command = TrackerCommand::ForceAdd {
                track_id: track_id.to_string(),
                reply,
            };
            if commands.send(command).await.is_ok() {
                if let Ok(outcome) = response.await {
                    return Ok(outcome);
                }
            }
        }

        let mut tracker = AccountTracker::new(account_id, self.deps.clone());
        Ok(tracker.force_add(track_id).await)
    }

    pub fn is_active(&self, account_id: &str) -> bool {
        self.lock_trackers()
            .map(|trackers| trackers.get(account_id).is_some_and(TrackerHandle::is_alive))
            .unwrap_or(false)
    }
}

async fn run_tracker(
    mut tracker: AccountTracker,
    deps: TrackerDeps,
    cancel: CancellationToken,
    mut commands: mpsc::Receiver<TrackerCommand>,
) {
    let account_id = tracker.account_id().to_string();
    tracing::info!(account_id = %account_id, "tracker: started");
    deps.events.publish(TrackerEvent::TrackerStarted {
        account_id: account_id.clone(),
    });

    'poll: loop {
        if cancel.is_cancelled() {
            break;
        }
        match deps.store.is_running(&account_id) {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!(account_id = %account_id, "tracker: running flag cleared");
                break;
            }
            Err(err) => {
                tracing::warn!(
                    account_id = %account_id,
                    error = %format!("{err:#}"),
                    "tracker: running flag check failed"
                );
            }
        }

        if let Err(err) = tracker.tick().await {
            tracing::warn!(
                account_id = %account_id,
                error = %format!("{err:#}"),
                "tracker: iteration failed"
            );
        }

        let deadline = Instant::now() + tracker.poll_interval();
        loop {
            tokio::select! {
                () = cancel.cancelled() => break 'poll,
                Some(command) = commands.recv() => match command {
                    TrackerCommand::ForceAdd { track_id, reply } => {
                        let outcome = tracker.force_add(&track_id).await;
                        let _ = reply.send(outcome);
                    }
                },
                () = tokio::time::sleep_until(deadline) => break,
            }
        }
    }

    match tracker.flush().await {
        Ok(Some(outcome)) => {
            tracing::info!(account_id = %account_id, outcome = ?outcome, "tracker: final flush");
        }
        Ok(None) => {}
        Err(err) => {
            tracing::warn!(
                account_id = %account_id,
                error = %format!("{err:#}"),
                "tracker: final flush failed"
            );
        }
    }
    tracing::info!(account_id = %account_id, "tracker: stopped");
    deps.events.publish(TrackerEvent::TrackerStopped { account_id });
}
