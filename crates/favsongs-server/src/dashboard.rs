//! Per-account summary view.

use anyhow::{anyhow, Result};

use favsongs_types::{AccountDashboard, DashboardStats, NowPlaying, NowPlayingState};

use crate::clock::Clock;
use crate::provider::PlaybackProvider;
use crate::store::TrackerStore;
use crate::tracker_db::TrackerDb;

/// Number of recent plays shown on the dashboard.
pub const RECENT_PLAYS_LIMIT: usize = 8;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Collect the account summary, live playback, and listening stats.
///
/// A failing provider call does not fail the dashboard; it is reported in
/// the now-playing slot instead.
pub async fn build_dashboard(
    db: &TrackerDb,
    provider: &dyn PlaybackProvider,
    clock: &dyn Clock,
    account_id: &str,
) -> Result<AccountDashboard> {
    let account = db
        .get_account(account_id)?
        .ok_or_else(|| anyhow!("unknown account {account_id}"))?;
    let settings = db.get_settings(account_id)?;

    let now_playing = match provider.current_playback(account_id).await {
        Ok(Some(snapshot)) => NowPlayingState::Playing(NowPlaying::from(&snapshot)),
        Ok(None) => NowPlayingState::Idle,
        Err(err) => {
            tracing::debug!(account_id = %account_id, error = %err, "dashboard: playback unavailable");
            NowPlayingState::Error {
                message: err.to_string(),
            }
        }
    };

    let max_occurrences = db.max_occurrences(account_id)?;
    let stats = DashboardStats {
        plays_last_24h: db.count_plays_since(account_id, clock.now_ms() - DAY_MS)?,
        max_occurrences,
        favorite_threshold: settings.favorite_threshold,
        plays_until_next_favorite: settings.favorite_threshold.saturating_sub(max_occurrences),
    };

    Ok(AccountDashboard {
        account,
        now_playing,
        stats,
        recent: db.recent_plays(account_id, RECENT_PLAYS_LIMIT)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderError;
    use crate::store::CompletedPlay;
    use crate::test_support::{memory_db_with_account, snapshot, FakeProvider, ManualClock};

    fn record(db: &TrackerDb, account: &str, track: &str, at_ms: i64) {
        let play = CompletedPlay {
            account_id: account.to_string(),
            track_id: track.to_string(),
            name: "Song".to_string(),
            artist: "Artist".to_string(),
            played_at_ms: at_ms,
            play_instance_id: format!("{track}:{at_ms}"),
        };
        db.record_play(&play, 0).unwrap();
    }

    #[tokio::test]
    async fn stats_cover_last_day_and_threshold_distance() {
        let (db, account) = memory_db_with_account();
        let clock = ManualClock::new(0);
        record(&db, &account, "a", 1_000);
        record(&db, &account, "a", 2_000);
        record(&db, &account, "b", DAY_MS + 5_000);
        for i in 0..10 {
            record(&db, &account, "c", DAY_MS + 10_000 + i);
        }
        clock.set(DAY_MS + 1_500);

        let provider = FakeProvider::new();
        let dashboard = build_dashboard(&db, &provider, &clock, &account).await.unwrap();

        assert_eq!(dashboard.now_playing, NowPlayingState::Idle);
        assert_eq!(dashboard.stats.plays_last_24h, 12);
        assert_eq!(dashboard.stats.max_occurrences, 10);
        assert_eq!(dashboard.stats.plays_until_next_favorite, 0);
        assert_eq!(dashboard.recent.len(), RECENT_PLAYS_LIMIT);
        assert_eq!(dashboard.recent[0].track_id, "c");
    }

    #[tokio::test]
    async fn now_playing_reflects_provider_state() {
        let (db, account) = memory_db_with_account();
        record(&db, &account, "a", 1_000);
        let clock = ManualClock::new(10_000);
        let provider = FakeProvider::new();

        provider.set_playback(Some(snapshot("a", 100_000, Some(9_000))));
        let dashboard = build_dashboard(&db, &provider, &clock, &account).await.unwrap();
        match dashboard.now_playing {
            NowPlayingState::Playing(view) => assert_eq!(view.completion_ratio, 0.5),
            other => panic!("unexpected state {other:?}"),
        }
        assert_eq!(dashboard.stats.plays_until_next_favorite, 4);

        provider.set_playback_error(ProviderError::Unauthorized("token expired".to_string()));
        let dashboard = build_dashboard(&db, &provider, &clock, &account).await.unwrap();
        assert!(matches!(dashboard.now_playing, NowPlayingState::Error { .. }));
    }

    #[tokio::test]
    async fn unknown_account_errors() {
        let (db, _account) = memory_db_with_account();
        let provider = FakeProvider::new();
        let clock = ManualClock::new(0);
        assert!(build_dashboard(&db, &provider, &clock, "missing").await.is_err());
    }
}
