//! SQLite store for accounts, settings, and play history.
//!
//! Provides pooled connections, schema bootstrap, and the atomic
//! record-a-play transaction.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use favsongs_types::{Account, FavoriteEntry, RecentPlay, Settings, SettingsPatch};

use crate::play_recorder::{NotCountedReason, RecordOutcome};
use crate::store::{CompletedPlay, FavoriteAggregate, TrackerStore};

const SCHEMA_VERSION: i32 = 1;

/// Access and refresh tokens saved by the authorization flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredTokens {
    pub access_token: String,
    pub refresh_token: String,
    /// Expiry (unix seconds).
    pub expires_at: i64,
}

pub struct TrackerDb {
    pool: Pool<SqliteConnectionManager>,
    /// One writer at a time keeps the duplicate checks and inserts atomic.
    write_lock: Mutex<()>,
    /// Values for settings rows created on first use.
    defaults: Settings,
}

impl TrackerDb {
    pub fn open(db_path: &Path, defaults: Settings) -> Result<Self> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create tracker db dir {:?}", parent))?;
        }
        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.busy_timeout(Duration::from_secs(5))?;
            conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;")?;
            Ok(())
        });
        Self::from_manager(manager, 4, defaults)
    }

    /// Private in-memory database; a single pooled connection keeps it alive.
    pub fn open_in_memory(defaults: Settings) -> Result<Self> {
        let manager = SqliteConnectionManager::memory().with_init(|conn| {
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            Ok(())
        });
        Self::from_manager(manager, 1, defaults)
    }

    fn from_manager(
        manager: SqliteConnectionManager,
        max_size: u32,
        defaults: Settings,
    ) -> Result<Self> {
        let pool = Pool::builder()
            .max_size(max_size)
            .build(manager)
            .context("create tracker db pool")?;
        {
            let conn = pool.get().context("open tracker db")?;
            init_schema(&conn)?;
        }
        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
            defaults,
        })
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        self.pool.get().context("open tracker db")
    }

    fn lock_writes(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| anyhow!("tracker db write lock poisoned"))
    }

    /// Create or refresh the account linked to a provider user.
    pub fn upsert_account(
        &self,
        provider_user_id: &str,
        display_name: &str,
        now_secs: i64,
    ) -> Result<Account> {
        let _guard = self.lock_writes()?;
        let mut conn = self.conn()?;
        let tx = conn.transaction().context("begin account tx")?;
        let existing: Option<String> = tx
            .query_row(
                "SELECT id FROM accounts WHERE provider_user_id = ?1",
                params![provider_user_id],
                |row| row.get(0),
            )
            .optional()
            .context("lookup account")?;
        let account_id = match existing {
            Some(id) => {
                tx.execute(
                    "UPDATE accounts SET display_name = ?1 WHERE id = ?2",
                    params![display_name, id],
                )
                .context("update account")?;
                id
            }
            None => {
                let id = uuid::Uuid::new_v4().simple().to_string();
                tx.execute(
                    "INSERT INTO accounts (id, provider_user_id, display_name, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![id, provider_user_id, display_name, now_secs],
                )
                .context("insert account")?;
                id
            }
        };
        ensure_defaults_on(&tx, &account_id, &self.defaults)?;
        let account = load_account(&tx, &account_id)?
            .ok_or_else(|| anyhow!("account {account_id} vanished during upsert"))?;
        tx.commit().context("commit account tx")?;
        Ok(account)
    }

    pub fn get_account(&self, account_id: &str) -> Result<Option<Account>> {
        let conn = self.conn()?;
        load_account(&conn, account_id)
    }

    pub fn list_accounts(&self) -> Result<Vec<Account>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT a.id, a.provider_user_id, a.display_name, a.created_at,
                   COALESCE(ts.running, 0)
            FROM accounts a
            LEFT JOIN tracker_state ts ON ts.account_id = a.id
            ORDER BY a.created_at ASC, a.id ASC
            "#,
        )?;
        let rows = stmt
            .query_map([], map_account_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list accounts")?;
        Ok(rows)
    }

    /// Make sure the settings and tracker rows exist for an account.
    pub fn ensure_account_defaults(&self, account_id: &str) -> Result<()> {
        let _guard = self.lock_writes()?;
        let conn = self.conn()?;
        ensure_defaults_on(&conn, account_id, &self.defaults)
    }

    pub fn save_tokens(
        &self,
        account_id: &str,
        access_token: &str,
        refresh_token: &str,
        expires_at: i64,
        now_secs: i64,
    ) -> Result<()> {
        let _guard = self.lock_writes()?;
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO tokens (account_id, access_token, refresh_token, expires_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(account_id) DO UPDATE SET
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at
            "#,
            params![account_id, access_token, refresh_token, expires_at, now_secs],
        )
        .context("save tokens")?;
        Ok(())
    }

    pub fn get_tokens(&self, account_id: &str) -> Result<Option<StoredTokens>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT access_token, refresh_token, expires_at FROM tokens WHERE account_id = ?1",
            params![account_id],
            |row| {
                Ok(StoredTokens {
                    access_token: row.get(0)?,
                    refresh_token: row.get(1)?,
                    expires_at: row.get(2)?,
                })
            },
        )
        .optional()
        .context("load tokens")
    }

    /// Most played tracks first, ties broken by recency.
    pub fn favorites(&self, account_id: &str, limit: usize) -> Result<Vec<FavoriteEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT f.track_id, t.name, t.artist, f.occurrences, f.last_played
            FROM favorites f
            JOIN tracks t ON t.track_id = f.track_id
            WHERE f.account_id = ?1
            ORDER BY f.occurrences DESC, f.last_played DESC
            LIMIT ?2
            "#,
        )?;
        let rows = stmt
            .query_map(params![account_id, limit as i64], |row| {
                Ok(FavoriteEntry {
                    track_id: row.get(0)?,
                    name: row.get(1)?,
                    artist: row.get(2)?,
                    occurrences: row.get(3)?,
                    last_played_ms: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list favorites")?;
        Ok(rows)
    }

    pub fn recent_plays(&self, account_id: &str, limit: usize) -> Result<Vec<RecentPlay>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT p.track_id, t.name, t.artist, p.played_at
            FROM plays p
            JOIN tracks t ON t.track_id = p.track_id
            WHERE p.account_id = ?1
            ORDER BY p.played_at DESC, p.id DESC
            LIMIT ?2
            "#,
        )?;
        let rows = stmt
            .query_map(params![account_id, limit as i64], |row| {
                Ok(RecentPlay {
                    track_id: row.get(0)?,
                    name: row.get(1)?,
                    artist: row.get(2)?,
                    played_at_ms: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list recent plays")?;
        Ok(rows)
    }

    pub fn count_plays_since(&self, account_id: &str, since_ms: i64) -> Result<u64> {
        let conn = self.conn()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM plays WHERE account_id = ?1 AND played_at >= ?2",
                params![account_id, since_ms],
                |row| row.get(0),
            )
            .context("count plays")?;
        Ok(count.max(0) as u64)
    }

    pub fn max_occurrences(&self, account_id: &str) -> Result<u32> {
        let conn = self.conn()?;
        let max: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(occurrences), 0) FROM favorites WHERE account_id = ?1",
                params![account_id],
                |row| row.get(0),
            )
            .context("max occurrences")?;
        Ok(u32::try_from(max).unwrap_or(u32::MAX))
    }
}

impl TrackerStore for TrackerDb {
    fn account_exists(&self, account_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM accounts WHERE id = ?1",
                params![account_id],
                |row| row.get(0),
            )
            .optional()
            .context("lookup account")?;
        Ok(found.is_some())
    }

    fn get_settings(&self, account_id: &str) -> Result<Settings> {
        // Rows are created with the account; only a missing row needs the writer.
        let stored = load_settings(&*self.conn()?, account_id)?;
        if let Some(settings) = stored {
            return Ok(settings);
        }
        let _guard = self.lock_writes()?;
        let conn = self.conn()?;
        ensure_defaults_on(&conn, account_id, &self.defaults)?;
        load_settings(&conn, account_id)?
            .ok_or_else(|| anyhow!("settings missing for account {account_id}"))
    }

    fn update_settings(&self, account_id: &str, patch: &SettingsPatch) -> Result<Settings> {
        patch.validate().map_err(|msg| anyhow!(msg))?;
        let _guard = self.lock_writes()?;
        let mut conn = self.conn()?;
        let tx = conn.transaction().context("begin settings tx")?;
        ensure_defaults_on(&tx, account_id, &self.defaults)?;
        let mut settings = load_settings(&tx, account_id)?
            .ok_or_else(|| anyhow!("settings missing for account {account_id}"))?;
        if patch.is_empty() {
            tx.commit().context("commit settings tx")?;
            return Ok(settings);
        }
        patch.apply_to(&mut settings);
        tx.execute(
            r#"
            UPDATE account_settings SET
                favorite_threshold = ?1,
                min_completion_ratio = ?2,
                check_interval_secs = ?3,
                min_play_gap_ms = ?4,
                restart_margin_ms = ?5,
                collection_name = ?6,
                collection_public = ?7,
                auto_add_enabled = ?8,
                collection_id = ?9
            WHERE account_id = ?10
            "#,
            params![
                settings.favorite_threshold,
                settings.min_completion_ratio,
                settings.check_interval_secs as i64,
                settings.min_play_gap_ms as i64,
                settings.restart_margin_ms as i64,
                settings.collection_name,
                settings.collection_public,
                settings.auto_add_enabled,
                settings.collection_id,
                account_id,
            ],
        )
        .context("update settings")?;
        tx.commit().context("commit settings tx")?;
        Ok(settings)
    }

    fn set_collection_id(&self, account_id: &str, collection_id: Option<&str>) -> Result<()> {
        let _guard = self.lock_writes()?;
        let conn = self.conn()?;
        ensure_defaults_on(&conn, account_id, &self.defaults)?;
        conn.execute(
            "UPDATE account_settings SET collection_id = ?1 WHERE account_id = ?2",
            params![collection_id, account_id],
        )
        .context("store collection id")?;
        Ok(())
    }

    fn record_play(&self, play: &CompletedPlay, min_play_gap_ms: u64) -> Result<RecordOutcome> {
        let _guard = self.lock_writes()?;
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("begin play tx")?;

        tx.execute(
            r#"
            INSERT INTO tracks (track_id, name, artist)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(track_id) DO UPDATE SET
                name = excluded.name,
                artist = excluded.artist
            "#,
            params![play.track_id, play.name, play.artist],
        )
        .context("upsert track")?;

        let duplicate: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM plays WHERE account_id = ?1 AND play_instance_id = ?2",
                params![play.account_id, play.play_instance_id],
                |row| row.get(0),
            )
            .optional()
            .context("lookup play instance")?;
        if duplicate.is_some() {
            tx.commit().context("commit play tx")?;
            return Ok(RecordOutcome::NotCounted(NotCountedReason::DuplicateInstance));
        }

        let favorite = load_aggregate(&tx, &play.account_id, &play.track_id)?;
        if let Some(aggregate) = favorite {
            let gap = play.played_at_ms.saturating_sub(aggregate.last_played_ms);
            if gap <= i64::try_from(min_play_gap_ms).unwrap_or(i64::MAX) {
                tx.commit().context("commit play tx")?;
                return Ok(RecordOutcome::NotCounted(NotCountedReason::WithinPlayGap));
            }
        }

        let inserted = tx
            .execute(
                r#"
                INSERT INTO plays (account_id, track_id, play_instance_id, played_at, completed)
                VALUES (?1, ?2, ?3, ?4, 1)
                ON CONFLICT(account_id, play_instance_id) DO NOTHING
                "#,
                params![play.account_id, play.track_id, play.play_instance_id, play.played_at_ms],
            )
            .context("insert play")?;
        if inserted == 0 {
            tx.commit().context("commit play tx")?;
            return Ok(RecordOutcome::NotCounted(NotCountedReason::DuplicateInstance));
        }

        let occurrences = favorite.map(|f| f.occurrences.saturating_add(1)).unwrap_or(1);
        tx.execute(
            r#"
            INSERT INTO favorites (account_id, track_id, occurrences, last_played)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(account_id, track_id) DO UPDATE SET
                occurrences = excluded.occurrences,
                last_played = excluded.last_played
            "#,
            params![play.account_id, play.track_id, occurrences, play.played_at_ms],
        )
        .context("update favorite")?;
        tx.commit().context("commit play tx")?;
        Ok(RecordOutcome::Counted(occurrences))
    }

    fn favorite_aggregate(
        &self,
        account_id: &str,
        track_id: &str,
    ) -> Result<Option<FavoriteAggregate>> {
        let conn = self.conn()?;
        load_aggregate(&conn, account_id, track_id)
    }

    fn is_running(&self, account_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let running: Option<bool> = conn
            .query_row(
                "SELECT running FROM tracker_state WHERE account_id = ?1",
                params![account_id],
                |row| row.get(0),
            )
            .optional()
            .context("load tracker state")?;
        Ok(running.unwrap_or(false))
    }

    fn set_running(&self, account_id: &str, running: bool) -> Result<()> {
        let _guard = self.lock_writes()?;
        let conn = self.conn()?;
        ensure_defaults_on(&conn, account_id, &self.defaults)?;
        conn.execute(
            "UPDATE tracker_state SET running = ?1 WHERE account_id = ?2",
            params![running, account_id],
        )
        .context("update tracker state")?;
        Ok(())
    }

    fn list_running_account_ids(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT account_id FROM tracker_state WHERE running = 1 ORDER BY account_id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()
            .context("list running trackers")?;
        Ok(ids)
    }
}

fn map_account_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        id: row.get(0)?,
        provider_user_id: row.get(1)?,
        display_name: row.get(2)?,
        created_at: row.get(3)?,
        tracker_running: row.get(4)?,
    })
}

fn load_account(conn: &Connection, account_id: &str) -> Result<Option<Account>> {
    conn.query_row(
        r#"
        SELECT a.id, a.provider_user_id, a.display_name, a.created_at,
               COALESCE(ts.running, 0)
        FROM accounts a
        LEFT JOIN tracker_state ts ON ts.account_id = a.id
        WHERE a.id = ?1
        "#,
        params![account_id],
        map_account_row,
    )
    .optional()
    .context("load account")
}

fn ensure_defaults_on(conn: &Connection, account_id: &str, defaults: &Settings) -> Result<()> {
    let known: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM accounts WHERE id = ?1",
            params![account_id],
            |row| row.get(0),
        )
        .optional()
        .context("lookup account")?;
    if known.is_none() {
        return Err(anyhow!("unknown account {account_id}"));
    }
    conn.execute(
        r#"
        INSERT INTO account_settings (
            account_id, favorite_threshold, min_completion_ratio, check_interval_secs,
            min_play_gap_ms, restart_margin_ms, collection_name, collection_public,
            auto_add_enabled
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        ON CONFLICT(account_id) DO NOTHING
        "#,
        params![
            account_id,
            defaults.favorite_threshold,
            defaults.min_completion_ratio,
            defaults.check_interval_secs as i64,
            defaults.min_play_gap_ms as i64,
            defaults.restart_margin_ms as i64,
            defaults.collection_name,
            defaults.collection_public,
            defaults.auto_add_enabled,
        ],
    )
    .context("insert default settings")?;
    conn.execute(
        "INSERT INTO tracker_state (account_id, running) VALUES (?1, 0)
         ON CONFLICT(account_id) DO NOTHING",
        params![account_id],
    )
    .context("insert tracker state")?;
    Ok(())
}

fn load_settings(conn: &Connection, account_id: &str) -> Result<Option<Settings>> {
    conn.query_row(
        r#"
        SELECT favorite_threshold, min_completion_ratio, check_interval_secs,
               min_play_gap_ms, restart_margin_ms, collection_name,
               collection_public, auto_add_enabled, collection_id
        FROM account_settings
        WHERE account_id = ?1
        "#,
        params![account_id],
        |row| {
            let check_interval: i64 = row.get(2)?;
            let play_gap: i64 = row.get(3)?;
            let restart_margin: i64 = row.get(4)?;
            Ok(Settings {
                favorite_threshold: row.get(0)?,
                min_completion_ratio: row.get(1)?,
                check_interval_secs: check_interval.max(0) as u64,
                min_play_gap_ms: play_gap.max(0) as u64,
                restart_margin_ms: restart_margin.max(0) as u64,
                collection_name: row.get(5)?,
                collection_public: row.get(6)?,
                auto_add_enabled: row.get(7)?,
                collection_id: row.get(8)?,
            })
        },
    )
    .optional()
    .context("load settings")
}

fn load_aggregate(
    conn: &Connection,
    account_id: &str,
    track_id: &str,
) -> Result<Option<FavoriteAggregate>> {
    conn.query_row(
        "SELECT occurrences, last_played FROM favorites WHERE account_id = ?1 AND track_id = ?2",
        params![account_id, track_id],
        |row| {
            Ok(FavoriteAggregate {
                occurrences: row.get(0)?,
                last_played_ms: row.get(1)?,
            })
        },
    )
    .optional()
    .context("load favorite")
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS accounts (
            id TEXT PRIMARY KEY,
            provider_user_id TEXT NOT NULL UNIQUE,
            display_name TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS tokens (
            account_id TEXT PRIMARY KEY,
            access_token TEXT NOT NULL,
            refresh_token TEXT NOT NULL,
            expires_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            FOREIGN KEY(account_id) REFERENCES accounts(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS account_settings (
            account_id TEXT PRIMARY KEY,
            favorite_threshold INTEGER NOT NULL,
            min_completion_ratio REAL NOT NULL,
            check_interval_secs INTEGER NOT NULL,
            min_play_gap_ms INTEGER NOT NULL,
            restart_margin_ms INTEGER NOT NULL,
            collection_name TEXT NOT NULL,
            collection_public INTEGER NOT NULL,
            auto_add_enabled INTEGER NOT NULL,
            collection_id TEXT,
            FOREIGN KEY(account_id) REFERENCES accounts(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS tracker_state (
            account_id TEXT PRIMARY KEY,
            running INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(account_id) REFERENCES accounts(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS tracks (
            track_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            artist TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS plays (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id TEXT NOT NULL,
            track_id TEXT NOT NULL,
            play_instance_id TEXT NOT NULL,
            played_at INTEGER NOT NULL,
            completed INTEGER NOT NULL DEFAULT 1,
            FOREIGN KEY(account_id) REFERENCES accounts(id) ON DELETE CASCADE,
            FOREIGN KEY(track_id) REFERENCES tracks(track_id) ON DELETE CASCADE,
            UNIQUE(account_id, play_instance_id)
        );

        CREATE INDEX IF NOT EXISTS idx_plays_account_played_at ON plays(account_id, played_at DESC);

        CREATE TABLE IF NOT EXISTS favorites (
            account_id TEXT NOT NULL,
            track_id TEXT NOT NULL,
            occurrences INTEGER NOT NULL DEFAULT 0,
            last_played INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY(account_id, track_id),
            FOREIGN KEY(account_id) REFERENCES accounts(id) ON DELETE CASCADE,
            FOREIGN KEY(track_id) REFERENCES tracks(track_id) ON DELETE CASCADE
        );
        "#,
    )
    .context("create tracker schema")?;

    let version: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    if version.is_none() {
        conn.execute(
            "INSERT INTO meta (key, value) VALUES ('schema_version', ?1)",
            params![SCHEMA_VERSION.to_string()],
        )
        .context("insert schema version")?;
    }
    Ok(())
}
