//! Per-entity mirror tables.
//!
//! Each synced entity gets one local table named after it, holding `AppPK`
//! as primary key, one column per whitelisted user field, and the system
//! columns the engine maintains (`__sp_id`, `__sp_modified_utc`,
//! `__sp_etag`, `IsDeleted`, `DeletedAtUtc`). Schema changes are additive
//! only; a field removed from the whitelist keeps its column.

use chrono::{DateTime, Utc};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OptionalExtension, params_from_iter};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::{
    AppTableConfig, DELETED_AT_COLUMN, IS_DELETED_COLUMN, SP_ETAG_COLUMN, SP_ID_COLUMN,
    SP_MODIFIED_COLUMN,
};
use crate::error::{Result, SyncError};
use crate::store::SqliteStore;
use crate::value;

/// Server-side bookkeeping attached to a mirror row. Never surfaced as
/// user fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemColumns {
    pub sharepoint_id: Option<i64>,
    pub sharepoint_modified_utc: Option<DateTime<Utc>>,
    pub sharepoint_etag: Option<String>,
    pub is_deleted: bool,
    pub deleted_at_utc: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorRow {
    pub app_pk: String,
    pub fields: Map<String, Value>,
    pub system: SystemColumns,
}

/// Per-entity mirror operations; the second narrow seam next to
/// [`crate::store::SyncStore`], implementable by the same backend.
pub trait MirrorStore: Send + Sync {
    /// Creates the mirror table if absent and adds columns for any
    /// whitelisted field not present yet. Never drops or retypes.
    fn ensure_entity_schema(&self, table: &AppTableConfig) -> Result<()>;

    /// Whole-row replace keyed by AppPK. Reserved keys are filtered from
    /// `fields`; fields outside the whitelist are dropped.
    fn upsert_entity_row(
        &self,
        table: &AppTableConfig,
        app_pk: &str,
        fields: &Map<String, Value>,
        system: &SystemColumns,
    ) -> Result<()>;

    fn get_entity_row(&self, table: &AppTableConfig, app_pk: &str) -> Result<Option<MirrorRow>>;
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn index_ident(entity: &str, suffix: &str) -> String {
    let safe: String = entity
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    quote_ident(&format!("idx_{safe}_{suffix}"))
}

fn json_to_sql(v: &Value) -> rusqlite::types::Value {
    use rusqlite::types::Value as Sql;
    match v {
        Value::Null => Sql::Null,
        Value::Bool(b) => Sql::Integer(i64::from(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Sql::Integer(i)
            } else {
                Sql::Real(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => Sql::Text(s.clone()),
        // nested values keep their JSON form
        other => Sql::Text(other.to_string()),
    }
}

fn sql_to_json(v: ValueRef<'_>) -> Value {
    match v {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(_) => Value::Null,
    }
}

fn existing_columns(conn: &Connection, entity: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!(
        "PRAGMA table_info({})",
        quote_ident(entity)
    ))?;
    let rows = stmt.query_map([], |r| r.get::<_, String>(1))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn require_entity_name(table: &AppTableConfig) -> Result<&str> {
    let name = table.entity_name.trim();
    if name.is_empty() {
        return Err(SyncError::InvalidArgument("empty entity name".into()));
    }
    Ok(name)
}

impl MirrorStore for SqliteStore {
    fn ensure_entity_schema(&self, table: &AppTableConfig) -> Result<()> {
        let entity = require_entity_name(table)?;
        let conn = self.conn();
        let quoted = quote_ident(entity);
        conn.execute_batch(&format!(
            r#"
CREATE TABLE IF NOT EXISTS {quoted} (
"AppPK" TEXT PRIMARY KEY,
{sp_id} INTEGER,
{sp_modified} TEXT,
{sp_etag} TEXT,
{is_deleted} INTEGER NOT NULL DEFAULT 0,
{deleted_at} TEXT
);
CREATE INDEX IF NOT EXISTS {idx_deleted} ON {quoted}({is_deleted});
CREATE INDEX IF NOT EXISTS {idx_modified} ON {quoted}({sp_modified});
CREATE INDEX IF NOT EXISTS {idx_deleted_at} ON {quoted}({deleted_at});
"#,
            sp_id = quote_ident(SP_ID_COLUMN),
            sp_modified = quote_ident(SP_MODIFIED_COLUMN),
            sp_etag = quote_ident(SP_ETAG_COLUMN),
            is_deleted = quote_ident(IS_DELETED_COLUMN),
            deleted_at = quote_ident(DELETED_AT_COLUMN),
            idx_deleted = index_ident(entity, "is_deleted"),
            idx_modified = index_ident(entity, "sp_modified"),
            idx_deleted_at = index_ident(entity, "deleted_at"),
        ))?;

        let mut existing = existing_columns(&conn, entity)?;
        for field in table.mirror_fields() {
            let present = existing.iter().any(|c| c.eq_ignore_ascii_case(field));
            if !present {
                // no declared type: values keep their own storage class
                conn.execute_batch(&format!(
                    "ALTER TABLE {quoted} ADD COLUMN {}",
                    quote_ident(field)
                ))?;
                existing.push(field.to_string());
            }
        }

        // catalog-requested indexes on user columns
        for wanted in &table.expected_indexes {
            let Some(column) = existing.iter().find(|c| c.eq_ignore_ascii_case(wanted)) else {
                continue;
            };
            let safe: String = column
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
                .collect();
            conn.execute_batch(&format!(
                "CREATE INDEX IF NOT EXISTS {} ON {quoted}({})",
                index_ident(entity, &format!("f_{safe}")),
                quote_ident(column)
            ))?;
        }
        Ok(())
    }

    fn upsert_entity_row(
        &self,
        table: &AppTableConfig,
        app_pk: &str,
        fields: &Map<String, Value>,
        system: &SystemColumns,
    ) -> Result<()> {
        let entity = require_entity_name(table)?;
        if app_pk.trim().is_empty() {
            return Err(SyncError::InvalidArgument("empty AppPK".into()));
        }

        let deleted_at = if system.is_deleted {
            system.deleted_at_utc.or_else(|| Some(Utc::now()))
        } else {
            system.deleted_at_utc
        };

        let mut columns = vec![quote_ident("AppPK")];
        let mut values = vec![rusqlite::types::Value::Text(app_pk.to_string())];
        for field in table.mirror_fields() {
            columns.push(quote_ident(field));
            values.push(
                fields
                    .get(field)
                    .map(json_to_sql)
                    .unwrap_or(rusqlite::types::Value::Null),
            );
        }
        for (name, sql) in [
            (
                SP_ID_COLUMN,
                system
                    .sharepoint_id
                    .map(rusqlite::types::Value::Integer)
                    .unwrap_or(rusqlite::types::Value::Null),
            ),
            (
                SP_MODIFIED_COLUMN,
                system
                    .sharepoint_modified_utc
                    .map(|dt| rusqlite::types::Value::Text(value::to_iso8601(&dt)))
                    .unwrap_or(rusqlite::types::Value::Null),
            ),
            (
                SP_ETAG_COLUMN,
                system
                    .sharepoint_etag
                    .clone()
                    .map(rusqlite::types::Value::Text)
                    .unwrap_or(rusqlite::types::Value::Null),
            ),
            (
                IS_DELETED_COLUMN,
                rusqlite::types::Value::Integer(i64::from(system.is_deleted)),
            ),
            (
                DELETED_AT_COLUMN,
                deleted_at
                    .map(|dt| rusqlite::types::Value::Text(value::to_iso8601(&dt)))
                    .unwrap_or(rusqlite::types::Value::Null),
            ),
        ] {
            columns.push(quote_ident(name));
            values.push(sql);
        }

        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
            quote_ident(entity),
            columns.join(", "),
            placeholders.join(", ")
        );
        let conn = self.conn();
        conn.execute(&sql, params_from_iter(values))?;
        Ok(())
    }

    fn get_entity_row(&self, table: &AppTableConfig, app_pk: &str) -> Result<Option<MirrorRow>> {
        let entity = require_entity_name(table)?;
        let conn = self.conn();
        let sql = format!(
            "SELECT * FROM {} WHERE \"AppPK\" = ?1",
            quote_ident(entity)
        );
        let mut stmt = conn.prepare(&sql)?;
        let column_names: Vec<String> =
            stmt.column_names().into_iter().map(str::to_string).collect();
        let row = stmt
            .query_row([app_pk], |r| {
                let mut raw: Vec<Value> = Vec::with_capacity(column_names.len());
                for i in 0..column_names.len() {
                    raw.push(sql_to_json(r.get_ref(i)?));
                }
                Ok(raw)
            })
            .optional()?;
        let Some(raw) = row else { return Ok(None) };

        let mut fields = Map::new();
        let mut system = SystemColumns::default();
        for (name, val) in column_names.iter().zip(raw) {
            if name == "AppPK" {
                continue;
            } else if name == SP_ID_COLUMN {
                system.sharepoint_id = value::as_i64(&val);
            } else if name == SP_MODIFIED_COLUMN {
                system.sharepoint_modified_utc = value::as_datetime_utc(&val);
            } else if name == SP_ETAG_COLUMN {
                system.sharepoint_etag = value::as_string(&val);
            } else if name == IS_DELETED_COLUMN {
                system.is_deleted = value::as_bool(&val).unwrap_or(false);
            } else if name == DELETED_AT_COLUMN {
                system.deleted_at_utc = value::as_datetime_utc(&val);
            } else if !val.is_null() {
                fields.insert(name.clone(), val);
            }
        }
        Ok(Some(MirrorRow {
            app_pk: app_pk.to_string(),
            fields,
            system,
        }))
    }
}
