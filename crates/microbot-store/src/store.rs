//! Main store implementation.

use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use time::OffsetDateTime;
use tracing::info;

use microbot_types::{Action, ActionKind, DeviceUid, PairKey};

use crate::error::{Error, Result};
use crate::models::{StoredMicrobot, StoredPairingKey};
use crate::schema;

/// SQLite-based store for microbot fleet state, pairing keys, and the
/// durable action queue.
///
/// Wraps its `Connection` in a `Mutex` (rather than giving callers
/// exclusive ownership the way a single-threaded CLI tool would)
/// because this store is also handed out as `Arc<dyn ActionStore>` /
/// `Arc<dyn PairKeyStore>` and shared across the scheduler, reconnector,
/// and any caller task.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        // Create parent directories if needed
        if let Some(parent) = path.parent()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| Error::CreateDirectory {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        info!("opening database at {}", path.display());
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;

        schema::initialize(&conn)?;

        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Open the default database location.
    pub fn open_default() -> Result<Self> {
        Self::open(crate::default_db_path())
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    // === Microbot operations ===

    /// Get or create a microbot entry, bumping `last_seen` and updating
    /// `name` if a new one was observed.
    pub fn upsert_microbot(&self, uid: DeviceUid, name: Option<&str>) -> Result<StoredMicrobot> {
        let conn = self.conn.lock().expect("lock poisoned");
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let uid_str = uid.to_canonical_string();

        conn.execute(
            "INSERT INTO microbots (uid, name, last_seen, created_at) VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(uid) DO UPDATE SET
                name = COALESCE(?2, name),
                last_seen = ?3",
            params![uid_str, name, now],
        )?;

        get_microbot_row(&conn, &uid_str)?.ok_or_else(|| Error::UnknownMicrobot(uid_str))
    }

    /// Update the connected flag for a microbot.
    pub fn update_microbot_connection(&self, uid: DeviceUid, is_connected: bool) -> Result<()> {
        let conn = self.conn.lock().expect("lock poisoned");
        conn.execute(
            "UPDATE microbots SET is_connected = ?2 WHERE uid = ?1",
            params![uid.to_canonical_string(), is_connected],
        )?;
        Ok(())
    }

    /// Update the paired flag for a microbot.
    pub fn update_microbot_paired(&self, uid: DeviceUid, is_paired: bool) -> Result<()> {
        let conn = self.conn.lock().expect("lock poisoned");
        conn.execute(
            "UPDATE microbots SET is_paired = ?2 WHERE uid = ?1",
            params![uid.to_canonical_string(), is_paired],
        )?;
        Ok(())
    }

    /// Record the most recently observed pusher/battery/calibration
    /// state for a microbot. Any argument left `None` leaves that
    /// column untouched.
    pub fn update_microbot_observed_state(
        &self,
        uid: DeviceUid,
        retracted: Option<bool>,
        battery: Option<f32>,
        calibration: Option<u8>,
    ) -> Result<()> {
        let conn = self.conn.lock().expect("lock poisoned");
        conn.execute(
            "UPDATE microbots SET
                retracted = COALESCE(?2, retracted),
                battery = COALESCE(?3, battery),
                calibration = COALESCE(?4, calibration)
             WHERE uid = ?1",
            params![uid.to_canonical_string(), retracted, battery, calibration],
        )?;
        Ok(())
    }

    /// Record the most recent dispatch failure observed for a microbot.
    pub fn record_microbot_error(&self, uid: DeviceUid, message: &str) -> Result<()> {
        let conn = self.conn.lock().expect("lock poisoned");
        conn.execute(
            "UPDATE microbots SET last_error = ?2 WHERE uid = ?1",
            params![uid.to_canonical_string(), message],
        )?;
        Ok(())
    }

    /// Get a microbot by UID.
    pub fn get_microbot(&self, uid: DeviceUid) -> Result<Option<StoredMicrobot>> {
        let conn = self.conn.lock().expect("lock poisoned");
        get_microbot_row(&conn, &uid.to_canonical_string())
    }

    /// List all known microbots, most recently seen first.
    pub fn list_microbots(&self) -> Result<Vec<StoredMicrobot>> {
        let conn = self.conn.lock().expect("lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, uid, name, is_paired, is_connected, retracted, battery, calibration,
                    last_error, last_seen, created_at
             FROM microbots ORDER BY last_seen DESC",
        )?;
        let rows = stmt
            .query_map([], row_to_microbot)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // === Pairing key operations ===

    /// Whether a key is on record for `uid`.
    pub fn has_pairing_key(&self, uid: DeviceUid) -> Result<bool> {
        let conn = self.conn.lock().expect("lock poisoned");
        let exists: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM pairing_keys WHERE uid = ?1",
            params![uid.to_canonical_string()],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// The key on record for `uid`, if any.
    pub fn get_pairing_key(&self, uid: DeviceUid) -> Result<Option<StoredPairingKey>> {
        let conn = self.conn.lock().expect("lock poisoned");
        conn.query_row(
            "SELECT id, uid, pair_key, created_at FROM pairing_keys WHERE uid = ?1",
            params![uid.to_canonical_string()],
            |row| {
                let uid_str: String = row.get(1)?;
                Ok(StoredPairingKey {
                    id: row.get(0)?,
                    uid: DeviceUid::from_str(&uid_str).unwrap_or(uid),
                    pair_key: row.get(2)?,
                    created_at: OffsetDateTime::from_unix_timestamp(row.get(3)?)
                        .unwrap_or(OffsetDateTime::UNIX_EPOCH),
                })
            },
        )
        .optional()
        .map_err(Error::from)
    }

    /// Store or replace the key for `uid`.
    pub fn set_pairing_key(&self, uid: DeviceUid, key: &[u8]) -> Result<()> {
        let conn = self.conn.lock().expect("lock poisoned");
        let now = OffsetDateTime::now_utc().unix_timestamp();
        conn.execute(
            "INSERT INTO pairing_keys (uid, pair_key, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(uid) DO UPDATE SET pair_key = ?2",
            params![uid.to_canonical_string(), key, now],
        )?;
        Ok(())
    }

    /// Remove the key for `uid`. A no-op if no key is on record.
    pub fn delete_pairing_key(&self, uid: DeviceUid) -> Result<()> {
        let conn = self.conn.lock().expect("lock poisoned");
        conn.execute(
            "DELETE FROM pairing_keys WHERE uid = ?1",
            params![uid.to_canonical_string()],
        )?;
        Ok(())
    }

    // === Action queue operations ===

    /// Enqueue a new action, returning its assigned row id.
    #[allow(clippy::too_many_arguments)]
    pub fn enqueue_action(
        &self,
        microbot_uid: DeviceUid,
        kind: ActionKind,
        args: &serde_json::Value,
        retries_left: i32,
        scheduled_at: OffsetDateTime,
        prev_action_id: Option<i64>,
        prev_action_delay_seconds: f64,
    ) -> Result<i64> {
        let conn = self.conn.lock().expect("lock poisoned");
        let now = OffsetDateTime::now_utc().unix_timestamp();
        conn.execute(
            "INSERT INTO actions
                (microbot_uid, prev_action_id, prev_action_delay_seconds, retries_left,
                 scheduled_at, action, action_args, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                microbot_uid.to_canonical_string(),
                prev_action_id,
                prev_action_delay_seconds,
                retries_left,
                scheduled_at.unix_timestamp(),
                kind.as_str(),
                serde_json::to_string(args)?,
                now,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Actions with no predecessor and a due `scheduled_at`, ordered by
    /// id ascending.
    pub fn ready_actions(&self, now: OffsetDateTime) -> Result<Vec<Action>> {
        let conn = self.conn.lock().expect("lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, microbot_uid, prev_action_id, prev_action_delay_seconds, retries_left,
                    scheduled_at, action, action_args
             FROM actions
             WHERE prev_action_id IS NULL AND scheduled_at <= ?1
             ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![now.unix_timestamp()], row_to_action)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Overwrite `scheduled_at` for `action_id`.
    pub fn reschedule(&self, action_id: i64, at: OffsetDateTime) -> Result<()> {
        let conn = self.conn.lock().expect("lock poisoned");
        conn.execute(
            "UPDATE actions SET scheduled_at = ?2 WHERE id = ?1",
            params![action_id, at.unix_timestamp()],
        )?;
        Ok(())
    }

    /// Decrement `retries_left` by one, returning the new value.
    pub fn decrement_retries(&self, action_id: i64) -> Result<i32> {
        let conn = self.conn.lock().expect("lock poisoned");
        conn.execute(
            "UPDATE actions SET retries_left = retries_left - 1 WHERE id = ?1",
            params![action_id],
        )?;
        conn.query_row(
            "SELECT retries_left FROM actions WHERE id = ?1",
            params![action_id],
            |row| row.get(0),
        )
        .map_err(Error::from)
    }

    /// Mark `action_id` complete: reparent its direct successor, if
    /// any, then delete the `action_id` row.
    pub fn complete(&self, action_id: i64, now: OffsetDateTime) -> Result<()> {
        let conn = self.conn.lock().expect("lock poisoned");
        let delay: Option<f64> = conn
            .query_row(
                "SELECT prev_action_delay_seconds FROM actions WHERE id = ?1",
                params![action_id],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(delay) = delay {
            conn.execute(
                "UPDATE actions SET prev_action_id = NULL, scheduled_at = ?2
                 WHERE prev_action_id = ?1",
                params![action_id, (now + time::Duration::seconds_f64(delay)).unix_timestamp()],
            )?;
        }
        conn.execute("DELETE FROM actions WHERE id = ?1", params![action_id])?;
        Ok(())
    }

    /// Delete `action_id` and every action chained after it,
    /// transitively.
    pub fn delete_chain(&self, action_id: i64) -> Result<()> {
        let conn = self.conn.lock().expect("lock poisoned");
        let mut stack = vec![action_id];
        while let Some(id) = stack.pop() {
            let mut stmt = conn.prepare("SELECT id FROM actions WHERE prev_action_id = ?1")?;
            let children = stmt
                .query_map(params![id], |row| row.get::<_, i64>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            stack.extend(children);
            conn.execute("DELETE FROM actions WHERE id = ?1", params![id])?;
        }
        Ok(())
    }

    /// The earliest `scheduled_at` among actions with no predecessor, if
    /// any are queued at all.
    pub fn next_scheduled_at(&self) -> Result<Option<OffsetDateTime>> {
        let conn = self.conn.lock().expect("lock poisoned");
        let earliest: Option<i64> = conn
            .query_row(
                "SELECT MIN(scheduled_at) FROM actions WHERE prev_action_id IS NULL",
                [],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()?
            .flatten();
        Ok(earliest.map(|ts| OffsetDateTime::from_unix_timestamp(ts).unwrap_or(OffsetDateTime::UNIX_EPOCH)))
    }
}

fn get_microbot_row(conn: &Connection, uid_str: &str) -> Result<Option<StoredMicrobot>> {
    conn.query_row(
        "SELECT id, uid, name, is_paired, is_connected, retracted, battery, calibration,
                last_error, last_seen, created_at
         FROM microbots WHERE uid = ?1",
        params![uid_str],
        row_to_microbot,
    )
    .optional()
    .map_err(Error::from)
}

fn row_to_microbot(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMicrobot> {
    let uid_str: String = row.get(1)?;
    Ok(StoredMicrobot {
        id: row.get(0)?,
        uid: DeviceUid::from_str(&uid_str)
            .unwrap_or_else(|_| DeviceUid::from_bytes([0; 6])),
        name: row.get(2)?,
        is_paired: row.get(3)?,
        is_connected: row.get(4)?,
        retracted: row.get(5)?,
        battery: row.get(6)?,
        calibration: row.get::<_, Option<i64>>(7)?.map(|v| v as u8),
        last_error: row.get(8)?,
        last_seen: OffsetDateTime::from_unix_timestamp(row.get(9)?).unwrap_or(OffsetDateTime::UNIX_EPOCH),
        created_at: OffsetDateTime::from_unix_timestamp(row.get(10)?).unwrap_or(OffsetDateTime::UNIX_EPOCH),
    })
}

fn row_to_action(row: &rusqlite::Row<'_>) -> rusqlite::Result<Action> {
    let uid_str: String = row.get(1)?;
    let action_str: String = row.get(6)?;
    let args_str: String = row.get(7)?;
    Ok(Action {
        id: row.get(0)?,
        microbot_uid: DeviceUid::from_str(&uid_str).unwrap_or_else(|_| DeviceUid::from_bytes([0; 6])),
        prev_action_id: row.get(2)?,
        prev_action_delay_seconds: row.get(3)?,
        retries_left: row.get::<_, i64>(4)? as i32,
        scheduled_at: OffsetDateTime::from_unix_timestamp(row.get::<_, i64>(5)?).unwrap_or(OffsetDateTime::UNIX_EPOCH),
        kind: ActionKind::from_str(&action_str).unwrap_or(ActionKind::Blink),
        args: serde_json::from_str(&args_str).unwrap_or(serde_json::Value::Null),
    })
}

#[async_trait]
impl microbot_core::pairstore::PairKeyStore for Store {
    async fn has(&self, uid: DeviceUid) -> microbot_core::error::Result<bool> {
        Ok(self.has_pairing_key(uid)?)
    }

    async fn get(&self, uid: DeviceUid) -> microbot_core::error::Result<Option<PairKey>> {
        let row = self.get_pairing_key(uid)?;
        Ok(row.and_then(|r| PairKey::from_slice(&r.pair_key).ok()))
    }

    async fn set(&self, uid: DeviceUid, key: PairKey) -> microbot_core::error::Result<()> {
        Ok(self.set_pairing_key(uid, key.as_bytes())?)
    }

    async fn delete(&self, uid: DeviceUid) -> microbot_core::error::Result<()> {
        Ok(self.delete_pairing_key(uid)?)
    }
}

#[async_trait]
impl microbot_core::action_store::ActionStore for Store {
    async fn ready_actions(&self, now: OffsetDateTime) -> microbot_core::error::Result<Vec<Action>> {
        Ok(Store::ready_actions(self, now)?)
    }

    async fn reschedule(&self, action_id: i64, at: OffsetDateTime) -> microbot_core::error::Result<()> {
        Ok(Store::reschedule(self, action_id, at)?)
    }

    async fn decrement_retries(&self, action_id: i64) -> microbot_core::error::Result<i32> {
        Ok(Store::decrement_retries(self, action_id)?)
    }

    async fn complete(&self, action_id: i64, now: OffsetDateTime) -> microbot_core::error::Result<()> {
        Ok(Store::complete(self, action_id, now)?)
    }

    async fn delete_chain(&self, action_id: i64) -> microbot_core::error::Result<()> {
        Ok(Store::delete_chain(self, action_id)?)
    }

    async fn record_error(&self, uid: DeviceUid, message: &str) -> microbot_core::error::Result<()> {
        Ok(self.record_microbot_error(uid, message)?)
    }

    async fn next_scheduled_at(&self) -> microbot_core::error::Result<Option<OffsetDateTime>> {
        Ok(Store::next_scheduled_at(self)?)
    }
}
