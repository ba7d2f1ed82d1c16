use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::config::LocalConfig;
use crate::error::{Result, SyncError};
use crate::value;

/// Per-entity pull watermark and bookkeeping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncState {
    pub entity_name: String,
    pub last_sync_modified_utc: Option<DateTime<Utc>>,
    pub last_sync_sp_id: Option<i64>,
    pub last_successful_sync_utc: Option<DateTime<Utc>>,
    pub last_config_version_applied: Option<i64>,
    pub last_error: Option<String>,
}

impl SyncState {
    pub fn empty(entity_name: &str) -> Self {
        Self {
            entity_name: entity_name.to_string(),
            ..Default::default()
        }
    }

    /// The (modified, id) watermark pair, compared lexicographically.
    pub fn watermark(&self) -> Option<(DateTime<Utc>, i64)> {
        Some((self.last_sync_modified_utc?, self.last_sync_sp_id.unwrap_or(0)))
    }
}

/// Logical operation captured by an outbox row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeOperation {
    Insert,
    Update,
    SoftDelete,
}

impl ChangeOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeOperation::Insert => "Insert",
            ChangeOperation::Update => "Update",
            ChangeOperation::SoftDelete => "SoftDelete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Insert" => Some(ChangeOperation::Insert),
            "Update" => Some(ChangeOperation::Update),
            "SoftDelete" => Some(ChangeOperation::SoftDelete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeStatus {
    Pending,
    Applied,
    Conflict,
}

impl ChangeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeStatus::Pending => "Pending",
            ChangeStatus::Applied => "Applied",
            ChangeStatus::Conflict => "Conflict",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Pending" => Some(ChangeStatus::Pending),
            "Applied" => Some(ChangeStatus::Applied),
            "Conflict" => Some(ChangeStatus::Conflict),
            _ => None,
        }
    }
}

/// One outbox row. Ids are append-ordered and strictly increasing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub id: i64,
    pub entity_name: String,
    pub app_pk: String,
    pub operation: ChangeOperation,
    pub payload_json: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub status: ChangeStatus,
    pub attempt_count: i64,
    pub applied_utc: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Input for `enqueue_change`. `created_utc` defaults to now.
#[derive(Debug, Clone)]
pub struct NewChange {
    pub entity_name: String,
    pub app_pk: String,
    pub operation: ChangeOperation,
    pub payload_json: Option<String>,
    pub created_utc: Option<DateTime<Utc>>,
}

/// Append-only audit record written before any conflict is resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictLogEntry {
    pub id: i64,
    pub occurred_utc: DateTime<Utc>,
    pub entity_name: String,
    pub app_pk: String,
    pub change_id: i64,
    pub operation: ChangeOperation,
    pub policy: crate::config::ConflictPolicy,
    pub sharepoint_id: Option<i64>,
    pub local_etag: Option<String>,
    pub server_etag: Option<String>,
    pub local_payload_json: Option<String>,
    pub server_fields_json: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct NewConflict {
    pub entity_name: String,
    pub app_pk: String,
    pub change_id: i64,
    pub operation: ChangeOperation,
    pub policy: crate::config::ConflictPolicy,
    pub sharepoint_id: Option<i64>,
    pub local_etag: Option<String>,
    pub server_etag: Option<String>,
    pub local_payload_json: Option<String>,
    pub server_fields_json: Option<String>,
    pub message: String,
}

/// Core store operations the engine depends on: config, per-entity sync
/// state, the outbox, and the conflict log. Kept separate from the mirror
/// seam so a backend can implement both on one type.
pub trait SyncStore: Send + Sync {
    fn init_schema(&self) -> Result<()>;

    fn load_local_config(&self, app_id: &str) -> Result<Option<LocalConfig>>;
    /// A newer server version replaces the local copy in this single write.
    fn save_local_config(&self, config: &LocalConfig) -> Result<()>;

    fn get_sync_state(&self, entity_name: &str) -> Result<Option<SyncState>>;
    fn put_sync_state(&self, state: &SyncState) -> Result<()>;

    fn enqueue_change(&self, change: NewChange) -> Result<i64>;
    fn get_change(&self, id: i64) -> Result<Option<ChangeLogEntry>>;
    /// Pending rows in ascending (CreatedUtc, Id).
    fn get_pending_changes(&self, limit: i64) -> Result<Vec<ChangeLogEntry>>;
    fn pending_change_count(&self) -> Result<i64>;
    fn mark_change_applied(&self, id: i64, applied_utc: DateTime<Utc>) -> Result<()>;
    /// Records the error and bumps the attempt count; the row stays Pending.
    fn mark_change_failed(&self, id: i64, error: &str) -> Result<()>;
    fn mark_change_conflicted(&self, id: i64, error: &str) -> Result<()>;
    /// Operator action: return a Conflict row to Pending.
    fn reset_conflict(&self, id: i64) -> Result<()>;

    fn log_conflict(&self, conflict: &NewConflict) -> Result<i64>;
    /// Most recent first: (OccurredUtc desc, Id desc).
    fn get_recent_conflicts(&self, limit: i64) -> Result<Vec<ConflictLogEntry>>;
}

/// Embedded SQLite backend. One connection guarded by a mutex; every call
/// locks briefly, so concurrent sync tasks interleave at call granularity.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(Connection::open(path)?),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        })
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn opt_iso(dt: &Option<DateTime<Utc>>) -> Option<String> {
    dt.as_ref().map(value::to_iso8601)
}

fn parse_opt_iso(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().and_then(value::parse_iso8601)
}

fn read_change_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChangeLogEntry> {
    let operation: String = row.get(3)?;
    let status: String = row.get(6)?;
    Ok(ChangeLogEntry {
        id: row.get(0)?,
        entity_name: row.get(1)?,
        app_pk: row.get(2)?,
        operation: ChangeOperation::parse(&operation).unwrap_or(ChangeOperation::Update),
        payload_json: row.get(4)?,
        created_utc: parse_opt_iso(row.get(5)?).unwrap_or_default(),
        status: ChangeStatus::parse(&status).unwrap_or(ChangeStatus::Pending),
        attempt_count: row.get(7)?,
        applied_utc: parse_opt_iso(row.get(8)?),
        last_error: row.get(9)?,
    })
}

const CHANGE_COLUMNS: &str = "id, entity_name, app_pk, operation, payload_json, created_utc, \
                              status, attempt_count, applied_utc, last_error";

impl SyncStore for SqliteStore {
    /// Creates the core tables and indexes. Safe to call multiple times.
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn();
        conn.execute_batch(
            r#"
PRAGMA journal_mode=WAL;

CREATE TABLE IF NOT EXISTS local_config (
app_id TEXT PRIMARY KEY,
config_version INTEGER NOT NULL,
tables_json TEXT NOT NULL,
updated_utc TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sync_state (
entity_name TEXT PRIMARY KEY,
last_sync_modified_utc TEXT,
last_sync_sp_id INTEGER,
last_successful_sync_utc TEXT,
last_config_version_applied INTEGER,
last_error TEXT
);

CREATE TABLE IF NOT EXISTS change_log (
id INTEGER PRIMARY KEY AUTOINCREMENT,
entity_name TEXT NOT NULL,
app_pk TEXT NOT NULL,
operation TEXT NOT NULL CHECK(operation IN ('Insert','Update','SoftDelete')),
payload_json TEXT,
created_utc TEXT NOT NULL,
status TEXT NOT NULL DEFAULT 'Pending' CHECK(status IN ('Pending','Applied','Conflict')),
attempt_count INTEGER NOT NULL DEFAULT 0,
applied_utc TEXT,
last_error TEXT
);

CREATE INDEX IF NOT EXISTS idx_change_log_status_created
ON change_log(status, created_utc);

CREATE INDEX IF NOT EXISTS idx_change_log_entity_pk
ON change_log(entity_name, app_pk);

CREATE TABLE IF NOT EXISTS conflict_log (
id INTEGER PRIMARY KEY AUTOINCREMENT,
occurred_utc TEXT NOT NULL,
entity_name TEXT NOT NULL,
app_pk TEXT NOT NULL,
change_id INTEGER NOT NULL,
operation TEXT NOT NULL,
policy TEXT NOT NULL,
sharepoint_id INTEGER,
local_etag TEXT,
server_etag TEXT,
local_payload_json TEXT,
server_fields_json TEXT,
message TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_conflict_log_occurred
ON conflict_log(occurred_utc);

CREATE INDEX IF NOT EXISTS idx_conflict_log_entity_pk
ON conflict_log(entity_name, app_pk);
"#,
        )?;
        Ok(())
    }

    fn load_local_config(&self, app_id: &str) -> Result<Option<LocalConfig>> {
        let conn = self.conn();
        let row: Option<(i64, String, Option<String>)> = conn
            .query_row(
                "SELECT config_version, tables_json, updated_utc
                 FROM local_config WHERE app_id = ?1",
                params![app_id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()?;
        let Some((config_version, tables_json, updated)) = row else {
            return Ok(None);
        };
        Ok(Some(LocalConfig {
            app_id: app_id.to_string(),
            config_version,
            tables: serde_json::from_str(&tables_json)?,
            updated_utc: parse_opt_iso(updated).unwrap_or_default(),
        }))
    }

    fn save_local_config(&self, config: &LocalConfig) -> Result<()> {
        let tables_json = serde_json::to_string(&config.tables)?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO local_config(app_id, config_version, tables_json, updated_utc)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(app_id) DO UPDATE SET
             config_version=excluded.config_version,
             tables_json=excluded.tables_json,
             updated_utc=excluded.updated_utc",
            params![
                config.app_id,
                config.config_version,
                tables_json,
                value::to_iso8601(&config.updated_utc),
            ],
        )?;
        Ok(())
    }

    fn get_sync_state(&self, entity_name: &str) -> Result<Option<SyncState>> {
        let conn = self.conn();
        let state = conn
            .query_row(
                "SELECT last_sync_modified_utc, last_sync_sp_id, last_successful_sync_utc,
                        last_config_version_applied, last_error
                 FROM sync_state WHERE entity_name = ?1",
                params![entity_name],
                |r| {
                    Ok(SyncState {
                        entity_name: entity_name.to_string(),
                        last_sync_modified_utc: parse_opt_iso(r.get(0)?),
                        last_sync_sp_id: r.get(1)?,
                        last_successful_sync_utc: parse_opt_iso(r.get(2)?),
                        last_config_version_applied: r.get(3)?,
                        last_error: r.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(state)
    }

    fn put_sync_state(&self, state: &SyncState) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO sync_state(entity_name, last_sync_modified_utc, last_sync_sp_id,
                                    last_successful_sync_utc, last_config_version_applied, last_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(entity_name) DO UPDATE SET
             last_sync_modified_utc=excluded.last_sync_modified_utc,
             last_sync_sp_id=excluded.last_sync_sp_id,
             last_successful_sync_utc=excluded.last_successful_sync_utc,
             last_config_version_applied=excluded.last_config_version_applied,
             last_error=excluded.last_error",
            params![
                state.entity_name,
                opt_iso(&state.last_sync_modified_utc),
                state.last_sync_sp_id,
                opt_iso(&state.last_successful_sync_utc),
                state.last_config_version_applied,
                state.last_error,
            ],
        )?;
        Ok(())
    }

    fn enqueue_change(&self, change: NewChange) -> Result<i64> {
        let created = change.created_utc.unwrap_or_else(Utc::now);
        let conn = self.conn();
        conn.execute(
            "INSERT INTO change_log(entity_name, app_pk, operation, payload_json, created_utc, status)
             VALUES (?1, ?2, ?3, ?4, ?5, 'Pending')",
            params![
                change.entity_name,
                change.app_pk,
                change.operation.as_str(),
                change.payload_json,
                value::to_iso8601(&created),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn get_change(&self, id: i64) -> Result<Option<ChangeLogEntry>> {
        let conn = self.conn();
        let entry = conn
            .query_row(
                &format!("SELECT {CHANGE_COLUMNS} FROM change_log WHERE id = ?1"),
                params![id],
                read_change_row,
            )
            .optional()?;
        Ok(entry)
    }

    fn get_pending_changes(&self, limit: i64) -> Result<Vec<ChangeLogEntry>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CHANGE_COLUMNS} FROM change_log
             WHERE status = 'Pending'
             ORDER BY created_utc ASC, id ASC
             LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit], read_change_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn pending_change_count(&self) -> Result<i64> {
        let conn = self.conn();
        let n = conn.query_row(
            "SELECT COUNT(*) FROM change_log WHERE status = 'Pending'",
            [],
            |r| r.get(0),
        )?;
        Ok(n)
    }

    fn mark_change_applied(&self, id: i64, applied_utc: DateTime<Utc>) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE change_log SET status='Applied', applied_utc=?2, last_error=NULL
             WHERE id = ?1",
            params![id, value::to_iso8601(&applied_utc)],
        )?;
        Ok(())
    }

    fn mark_change_failed(&self, id: i64, error: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE change_log SET attempt_count = attempt_count + 1, last_error = ?2
             WHERE id = ?1",
            params![id, error],
        )?;
        Ok(())
    }

    fn mark_change_conflicted(&self, id: i64, error: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE change_log
             SET status='Conflict', attempt_count = attempt_count + 1, last_error = ?2
             WHERE id = ?1",
            params![id, error],
        )?;
        Ok(())
    }

    fn reset_conflict(&self, id: i64) -> Result<()> {
        let conn = self.conn();
        let updated = conn.execute(
            "UPDATE change_log SET status='Pending', last_error=NULL
             WHERE id = ?1 AND status='Conflict'",
            params![id],
        )?;
        if updated == 0 {
            return Err(SyncError::State("change is not in Conflict"));
        }
        Ok(())
    }

    fn log_conflict(&self, conflict: &NewConflict) -> Result<i64> {
        let policy_json = serde_json::to_value(conflict.policy)?;
        let policy = policy_json.as_str().unwrap_or("ServerWins").to_string();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO conflict_log(occurred_utc, entity_name, app_pk, change_id, operation,
                                      policy, sharepoint_id, local_etag, server_etag,
                                      local_payload_json, server_fields_json, message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                value::to_iso8601(&Utc::now()),
                conflict.entity_name,
                conflict.app_pk,
                conflict.change_id,
                conflict.operation.as_str(),
                policy,
                conflict.sharepoint_id,
                conflict.local_etag,
                conflict.server_etag,
                conflict.local_payload_json,
                conflict.server_fields_json,
                conflict.message,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn get_recent_conflicts(&self, limit: i64) -> Result<Vec<ConflictLogEntry>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, occurred_utc, entity_name, app_pk, change_id, operation, policy,
                    sharepoint_id, local_etag, server_etag, local_payload_json,
                    server_fields_json, message
             FROM conflict_log
             ORDER BY occurred_utc DESC, id DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |r| {
            let operation: String = r.get(5)?;
            let policy: String = r.get(6)?;
            Ok(ConflictLogEntry {
                id: r.get(0)?,
                occurred_utc: parse_opt_iso(r.get(1)?).unwrap_or_default(),
                entity_name: r.get(2)?,
                app_pk: r.get(3)?,
                change_id: r.get(4)?,
                operation: ChangeOperation::parse(&operation).unwrap_or(ChangeOperation::Update),
                policy: crate::config::ConflictPolicy::parse_name(&policy)
                    .unwrap_or_default(),
                sharepoint_id: r.get(7)?,
                local_etag: r.get(8)?,
                server_etag: r.get(9)?,
                local_payload_json: r.get(10)?,
                server_fields_json: r.get(11)?,
                message: r.get(12)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConflictPolicy;
    use chrono::TimeZone;

    fn store() -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        store.init_schema().unwrap();
        store
    }

    fn change(entity: &str, pk: &str, created: DateTime<Utc>) -> NewChange {
        NewChange {
            entity_name: entity.to_string(),
            app_pk: pk.to_string(),
            operation: ChangeOperation::Update,
            payload_json: Some(r#"{"Title":"t"}"#.to_string()),
            created_utc: Some(created),
        }
    }

    #[test]
    fn init_schema_is_idempotent() {
        let store = store();
        store.init_schema().unwrap();
        store.init_schema().unwrap();
    }

    #[test]
    fn local_config_replace_is_single_write() {
        let store = store();
        assert!(store.load_local_config("app").unwrap().is_none());

        let mut cfg = LocalConfig::empty("app");
        cfg.config_version = 1;
        store.save_local_config(&cfg).unwrap();
        cfg.config_version = 5;
        store.save_local_config(&cfg).unwrap();

        let loaded = store.load_local_config("app").unwrap().unwrap();
        assert_eq!(loaded.config_version, 5);
        assert!(loaded.tables.is_empty());
    }

    #[test]
    fn sync_state_round_trips_datetimes() {
        let store = store();
        let modified = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let state = SyncState {
            entity_name: "Clients".into(),
            last_sync_modified_utc: Some(modified),
            last_sync_sp_id: Some(42),
            last_successful_sync_utc: Some(modified),
            last_config_version_applied: Some(3),
            last_error: None,
        };
        store.put_sync_state(&state).unwrap();
        let back = store.get_sync_state("Clients").unwrap().unwrap();
        assert_eq!(back.last_sync_modified_utc, Some(modified));
        assert_eq!(back.last_sync_sp_id, Some(42));
        assert_eq!(back.watermark(), Some((modified, 42)));

        // overwrite
        store
            .put_sync_state(&SyncState {
                last_error: Some("boom".into()),
                ..state
            })
            .unwrap();
        let back = store.get_sync_state("Clients").unwrap().unwrap();
        assert_eq!(back.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn pending_changes_drain_in_created_then_id_order() {
        let store = store();
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 3, 1, 11, 0, 0).unwrap();

        // same created_utc for the first two: id breaks the tie
        let a = store.enqueue_change(change("Clients", "A", t0)).unwrap();
        let b = store.enqueue_change(change("Clients", "B", t0)).unwrap();
        let c = store.enqueue_change(change("Clients", "C", t1)).unwrap();
        assert!(a < b && b < c);

        let pending = store.get_pending_changes(10).unwrap();
        let ids: Vec<i64> = pending.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![a, b, c]);
        assert!(pending.iter().all(|p| p.status == ChangeStatus::Pending));
        assert!(pending.iter().all(|p| p.attempt_count == 0));

        let limited = store.get_pending_changes(2).unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(store.pending_change_count().unwrap(), 3);
    }

    #[test]
    fn change_lifecycle_transitions() {
        let store = store();
        let id = store
            .enqueue_change(change("Clients", "A", Utc::now()))
            .unwrap();

        store.mark_change_failed(id, "offline").unwrap();
        store.mark_change_failed(id, "still offline").unwrap();
        let row = store.get_change(id).unwrap().unwrap();
        assert_eq!(row.status, ChangeStatus::Pending);
        assert_eq!(row.attempt_count, 2);
        assert_eq!(row.last_error.as_deref(), Some("still offline"));

        let applied_at = Utc.with_ymd_and_hms(2024, 3, 2, 9, 0, 0).unwrap();
        store.mark_change_applied(id, applied_at).unwrap();
        let row = store.get_change(id).unwrap().unwrap();
        assert_eq!(row.status, ChangeStatus::Applied);
        assert_eq!(row.applied_utc, Some(applied_at));
        assert!(row.last_error.is_none());
        assert!(store.get_pending_changes(10).unwrap().is_empty());
    }

    #[test]
    fn conflict_is_terminal_until_reset() {
        let store = store();
        let id = store
            .enqueue_change(change("Clients", "A", Utc::now()))
            .unwrap();
        store.mark_change_conflicted(id, "etag mismatch").unwrap();

        let row = store.get_change(id).unwrap().unwrap();
        assert_eq!(row.status, ChangeStatus::Conflict);
        assert_eq!(row.attempt_count, 1);
        assert!(store.get_pending_changes(10).unwrap().is_empty());

        store.reset_conflict(id).unwrap();
        let row = store.get_change(id).unwrap().unwrap();
        assert_eq!(row.status, ChangeStatus::Pending);
        assert!(row.last_error.is_none());

        // resetting a non-conflict row is an error
        assert!(store.reset_conflict(id).is_err());
    }

    #[test]
    fn conflict_log_is_append_only_most_recent_first() {
        let store = store();
        for (i, pk) in ["A", "B"].iter().enumerate() {
            store
                .log_conflict(&NewConflict {
                    entity_name: "Clients".into(),
                    app_pk: pk.to_string(),
                    change_id: i as i64 + 1,
                    operation: ChangeOperation::Update,
                    policy: ConflictPolicy::Manual,
                    sharepoint_id: Some(10 + i as i64),
                    local_etag: Some("\"1\"".into()),
                    server_etag: Some("\"2\"".into()),
                    local_payload_json: Some(r#"{"Value":"x"}"#.into()),
                    server_fields_json: Some(r#"{"Value":"y"}"#.into()),
                    message: "concurrency".into(),
                })
                .unwrap();
        }
        let recent = store.get_recent_conflicts(10).unwrap();
        assert_eq!(recent.len(), 2);
        // same occurred second => id desc breaks the tie
        assert_eq!(recent[0].app_pk, "B");
        assert_eq!(recent[0].policy, ConflictPolicy::Manual);
        assert_eq!(recent[1].app_pk, "A");
        let one = store.get_recent_conflicts(1).unwrap();
        assert_eq!(one.len(), 1);
    }
}
