//! The sync engine: watermarked incremental pull and FIFO outbox drain.
//!
//! The engine talks to the server through [`RemoteConnector`] and to disk
//! through the two store seams ([`SyncStore`] and [`MirrorStore`]); it holds
//! no state of its own, so one engine can serve any number of entities. In
//! composite syncs the outbox drains before the pull, so locally-enqueued
//! changes reach the server before the pull rewrites the mirror.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::config::{
    AppTableConfig, ConflictPolicy, LocalConfig, SyncPolicy, DELETED_AT_COLUMN, IS_DELETED_COLUMN,
};
use crate::error::{Result, SyncError};
use crate::interrupt::Interrupt;
use crate::mirror::{MirrorStore, SystemColumns};
use crate::remote::{eq_filter, modified_since_filter, ItemQuery, ListItem, RemoteConnector};
use crate::store::{ChangeLogEntry, ChangeOperation, NewConflict, SyncState, SyncStore};
use crate::value;

/// Server page size for pulls.
const PULL_PAGE_SIZE: u32 = 200;

/// Watermark overlap absorbing server clock skew and the window in which a
/// write is committed but not yet visible to `Modified` filters. Rows inside
/// the overlap are re-read; the AppPK-keyed upsert makes that idempotent.
const PULL_OVERLAP_MINUTES: i64 = 5;

/// Default outbox drain batch.
pub const DEFAULT_MAX_CHANGES: i64 = 100;

#[derive(Debug, Clone, Default)]
pub struct PullSummary {
    pub entity_name: String,
    pub items: u64,
    pub pages: u64,
}

#[derive(Debug, Clone, Default)]
pub struct PushSummary {
    pub processed: u64,
    pub applied: u64,
    pub failed: u64,
    pub conflicted: u64,
}

/// Terminal outcome of pushing one outbox row. Remote failures are folded
/// into outcomes here; only local store/serde failures escape as errors.
enum PushOutcome {
    Applied,
    Conflicted(String),
    Failed(String),
}

pub struct SyncEngine<C, S> {
    connector: Arc<C>,
    store: Arc<S>,
}

impl<C, S> SyncEngine<C, S>
where
    C: RemoteConnector,
    S: SyncStore + MirrorStore,
{
    pub fn new(connector: Arc<C>, store: Arc<S>) -> Self {
        Self { connector, store }
    }

    /// Incremental pull for one entity. Advances the (Modified, Id)
    /// watermark only after the full pagination completes.
    pub async fn sync_down(
        &self,
        table: &AppTableConfig,
        config_version: i64,
        interrupt: &Interrupt,
    ) -> Result<PullSummary> {
        match self.pull_table(table, config_version, interrupt).await {
            Ok(summary) => Ok(summary),
            Err(err) => {
                if !matches!(err, SyncError::Interrupted) {
                    self.record_pull_error(&table.entity_name, &err);
                }
                Err(err)
            }
        }
    }

    /// Pulls every enabled `OnOpen` table in priority order.
    pub async fn sync_down_on_open(
        &self,
        config: &LocalConfig,
        interrupt: &Interrupt,
    ) -> Result<Vec<PullSummary>> {
        let mut summaries = Vec::new();
        for table in config.tables_to_pull(Some(SyncPolicy::OnOpen)) {
            summaries.push(
                self.sync_down(table, config.config_version, interrupt)
                    .await?,
            );
        }
        Ok(summaries)
    }

    async fn pull_table(
        &self,
        table: &AppTableConfig,
        config_version: i64,
        interrupt: &Interrupt,
    ) -> Result<PullSummary> {
        self.store.ensure_entity_schema(table)?;

        let mut state = self
            .store
            .get_sync_state(&table.entity_name)?
            .unwrap_or_else(|| SyncState::empty(&table.entity_name));

        let filter = state
            .last_sync_modified_utc
            .map(|m| modified_since_filter(&(m - Duration::minutes(PULL_OVERLAP_MINUTES))));
        debug!(entity = %table.entity_name, filter = ?filter, "starting pull");

        let mut query = ItemQuery {
            select: pull_select(table),
            filter,
            order_by: Some("Modified asc, Id asc".into()),
            top: Some(PULL_PAGE_SIZE),
            next_page: None,
        };

        let mut summary = PullSummary {
            entity_name: table.entity_name.clone(),
            ..Default::default()
        };
        let mut watermark = state.watermark();

        loop {
            interrupt.err_if_interrupted()?;
            let page = self
                .connector
                .query_list_items(&table.list_id, &query)
                .await?;
            summary.pages += 1;
            for item in &page.items {
                interrupt.err_if_interrupted()?;
                if self.ingest_item(table, item)?.is_some() {
                    summary.items += 1;
                }
                if let Some(modified) = item.modified_utc {
                    watermark = Some(max_watermark(watermark, (modified, item.id)));
                }
            }
            match page.next_page {
                Some(cursor) => query.next_page = Some(cursor),
                None => break,
            }
        }

        if let Some((modified, sp_id)) = watermark {
            state.last_sync_modified_utc = Some(modified);
            state.last_sync_sp_id = Some(sp_id);
        }
        state.last_successful_sync_utc = Some(Utc::now());
        state.last_config_version_applied = Some(config_version);
        state.last_error = None;
        self.store.put_sync_state(&state)?;

        info!(
            entity = %table.entity_name,
            items = summary.items,
            pages = summary.pages,
            "pull complete"
        );
        Ok(summary)
    }

    /// Drains up to `max_changes` pending outbox rows in (CreatedUtc, Id)
    /// order. Failures keep a row Pending for the next drain; conflicts are
    /// terminal until an operator resets them.
    pub async fn sync_up(
        &self,
        config: &LocalConfig,
        max_changes: i64,
        interrupt: &Interrupt,
    ) -> Result<PushSummary> {
        let pending = self.store.get_pending_changes(max_changes)?;
        let mut summary = PushSummary::default();

        for entry in pending {
            interrupt.err_if_interrupted()?;
            summary.processed += 1;

            let Some(table) = config.table(&entry.entity_name) else {
                warn!(entity = %entry.entity_name, change = entry.id, "unknown entity/table");
                self.store
                    .mark_change_failed(entry.id, "Unknown entity/table")?;
                summary.failed += 1;
                continue;
            };

            let outcome = match self.push_one(table, &entry).await {
                Ok(outcome) => outcome,
                Err(SyncError::Interrupted) => return Err(SyncError::Interrupted),
                Err(err) => PushOutcome::Failed(err.to_string()),
            };
            match outcome {
                PushOutcome::Applied => {
                    self.store.mark_change_applied(entry.id, Utc::now())?;
                    summary.applied += 1;
                }
                PushOutcome::Conflicted(message) => {
                    self.store.mark_change_conflicted(entry.id, &message)?;
                    summary.conflicted += 1;
                }
                PushOutcome::Failed(message) => {
                    debug!(change = entry.id, %message, "push failed; will retry");
                    self.store.mark_change_failed(entry.id, &message)?;
                    summary.failed += 1;
                }
            }
        }

        info!(
            processed = summary.processed,
            applied = summary.applied,
            failed = summary.failed,
            conflicted = summary.conflicted,
            "outbox drain complete"
        );
        Ok(summary)
    }

    async fn push_one(
        &self,
        table: &AppTableConfig,
        entry: &ChangeLogEntry,
    ) -> Result<PushOutcome> {
        self.store.ensure_entity_schema(table)?;
        match entry.operation {
            ChangeOperation::Insert => self.push_insert(table, entry).await,
            ChangeOperation::Update => {
                let Some(payload) = parse_payload(entry)? else {
                    return Ok(PushOutcome::Failed("update change has no payload".into()));
                };
                self.push_update(table, entry, payload).await
            }
            ChangeOperation::SoftDelete => {
                let mut payload = Map::new();
                payload.insert(
                    table.pk_internal_name.clone(),
                    Value::String(entry.app_pk.clone()),
                );
                payload.insert(IS_DELETED_COLUMN.into(), Value::Bool(true));
                payload.insert(
                    DELETED_AT_COLUMN.into(),
                    Value::String(value::to_iso8601(&Utc::now())),
                );
                self.push_update(table, entry, payload).await
            }
        }
    }

    async fn push_insert(
        &self,
        table: &AppTableConfig,
        entry: &ChangeLogEntry,
    ) -> Result<PushOutcome> {
        let mut payload = parse_payload(entry)?.unwrap_or_default();
        payload.insert(
            table.pk_internal_name.clone(),
            Value::String(entry.app_pk.clone()),
        );
        payload
            .entry("Title".to_string())
            .or_insert_with(|| Value::String(entry.app_pk.clone()));

        match self
            .connector
            .create_list_item(&table.list_id, &payload)
            .await
        {
            Ok(new_id) => {
                debug!(entity = %table.entity_name, app_pk = %entry.app_pk, new_id, "created");
                // keep whatever the mirror already holds, attach the new id
                let existing = self.store.get_entity_row(table, &entry.app_pk)?;
                let (fields, mut system) = existing
                    .map(|r| (r.fields, r.system))
                    .unwrap_or_default();
                system.sharepoint_id = Some(new_id);
                self.store
                    .upsert_entity_row(table, &entry.app_pk, &fields, &system)?;
                self.refresh_mirror(table, new_id).await;
                Ok(PushOutcome::Applied)
            }
            Err(err) if err.is_already_exists() => {
                warn!(
                    entity = %table.entity_name,
                    app_pk = %entry.app_pk,
                    "create hit an existing server row"
                );
                match self.find_item_by_pk(table, &entry.app_pk).await {
                    Ok(Some(server_item)) => {
                        self.resolve_insert_exists(table, entry, &payload, &server_item)
                            .await
                    }
                    Ok(None) => Ok(PushOutcome::Failed(format!(
                        "create conflicted but no server row has {} = '{}'",
                        table.pk_internal_name, entry.app_pk
                    ))),
                    Err(fetch_err) => Ok(PushOutcome::Failed(fetch_err.to_string())),
                }
            }
            Err(err) => Ok(PushOutcome::Failed(err.to_string())),
        }
    }

    async fn push_update(
        &self,
        table: &AppTableConfig,
        entry: &ChangeLogEntry,
        payload: Map<String, Value>,
    ) -> Result<PushOutcome> {
        let local = self.store.get_entity_row(table, &entry.app_pk)?;
        let local_etag = local
            .as_ref()
            .and_then(|r| r.system.sharepoint_etag.clone());

        let sp_id = match local.as_ref().and_then(|r| r.system.sharepoint_id) {
            Some(id) => Some(id),
            None => match self.find_item_by_pk(table, &entry.app_pk).await {
                Ok(found) => found.map(|item| item.id),
                Err(err) => return Ok(PushOutcome::Failed(err.to_string())),
            },
        };
        let Some(sp_id) = sp_id else {
            return Ok(PushOutcome::Failed(format!(
                "cannot resolve server item for {} '{}'",
                table.entity_name, entry.app_pk
            )));
        };

        let if_match = local_etag.as_deref().unwrap_or("*");
        match self
            .connector
            .update_list_item(&table.list_id, sp_id, &payload, if_match)
            .await
        {
            Ok(()) => {
                self.refresh_mirror(table, sp_id).await;
                Ok(PushOutcome::Applied)
            }
            Err(err) if err.is_concurrency_conflict() => {
                self.resolve_concurrency(table, entry, sp_id, &payload, local_etag.as_deref())
                    .await
            }
            Err(err) => Ok(PushOutcome::Failed(err.to_string())),
        }
    }

    /// Concurrency-conflict path: the server row moved under our ETag.
    async fn resolve_concurrency(
        &self,
        table: &AppTableConfig,
        entry: &ChangeLogEntry,
        sp_id: i64,
        desired: &Map<String, Value>,
        local_etag: Option<&str>,
    ) -> Result<PushOutcome> {
        let server_item = match self
            .connector
            .get_list_item(&table.list_id, sp_id, &pull_select(table))
            .await
        {
            Ok(item) => item,
            Err(err) => {
                return Ok(PushOutcome::Failed(format!(
                    "conflict refetch failed: {err}"
                )));
            }
        };

        warn!(
            entity = %table.entity_name,
            app_pk = %entry.app_pk,
            policy = ?table.conflict_policy,
            "concurrency conflict"
        );
        self.log_conflict(table, entry, Some(sp_id), local_etag, &server_item, desired, "concurrency conflict on update")?;

        match table.conflict_policy {
            ConflictPolicy::Manual => {
                self.ingest_item(table, &server_item)?;
                Ok(PushOutcome::Conflicted(
                    "concurrency conflict; manual resolution required".into(),
                ))
            }
            ConflictPolicy::ServerWins => {
                self.ingest_item(table, &server_item)?;
                Ok(PushOutcome::Applied)
            }
            ConflictPolicy::ClientWins => {
                let retry_etag = server_item.etag.as_deref().unwrap_or("*");
                match self
                    .connector
                    .update_list_item(&table.list_id, sp_id, desired, retry_etag)
                    .await
                {
                    Ok(()) => {
                        self.refresh_mirror(table, sp_id).await;
                        Ok(PushOutcome::Applied)
                    }
                    Err(err) if err.is_concurrency_conflict() => Ok(PushOutcome::Conflicted(
                        "concurrency conflict persisted after one retry".into(),
                    )),
                    Err(err) => Ok(PushOutcome::Failed(err.to_string())),
                }
            }
        }
    }

    /// Already-exists path: an insert found the row on the server.
    async fn resolve_insert_exists(
        &self,
        table: &AppTableConfig,
        entry: &ChangeLogEntry,
        payload: &Map<String, Value>,
        server_item: &ListItem,
    ) -> Result<PushOutcome> {
        self.log_conflict(
            table,
            entry,
            Some(server_item.id),
            None,
            server_item,
            payload,
            "insert hit an existing server row",
        )?;

        match table.conflict_policy {
            ConflictPolicy::Manual => {
                self.ingest_item(table, server_item)?;
                Ok(PushOutcome::Conflicted(
                    "insert conflict; manual resolution required".into(),
                ))
            }
            ConflictPolicy::ServerWins => {
                self.ingest_item(table, server_item)?;
                Ok(PushOutcome::Applied)
            }
            ConflictPolicy::ClientWins => {
                // adopt the existing id and overwrite its fields
                let if_match = server_item.etag.as_deref().unwrap_or("*");
                match self
                    .connector
                    .update_list_item(&table.list_id, server_item.id, payload, if_match)
                    .await
                {
                    Ok(()) => {
                        self.refresh_mirror(table, server_item.id).await;
                        Ok(PushOutcome::Applied)
                    }
                    Err(err) if err.is_concurrency_conflict() => Ok(PushOutcome::Conflicted(
                        "insert conflict persisted after adopting the server row".into(),
                    )),
                    Err(err) => Ok(PushOutcome::Failed(err.to_string())),
                }
            }
        }
    }

    fn log_conflict(
        &self,
        table: &AppTableConfig,
        entry: &ChangeLogEntry,
        sp_id: Option<i64>,
        local_etag: Option<&str>,
        server_item: &ListItem,
        desired: &Map<String, Value>,
        message: &str,
    ) -> Result<()> {
        self.store.log_conflict(&NewConflict {
            entity_name: entry.entity_name.clone(),
            app_pk: entry.app_pk.clone(),
            change_id: entry.id,
            operation: entry.operation,
            policy: table.conflict_policy,
            sharepoint_id: sp_id,
            local_etag: local_etag.map(str::to_string),
            server_etag: server_item.etag.clone(),
            local_payload_json: Some(serde_json::to_string(desired)?),
            server_fields_json: Some(serde_json::to_string(&server_item.fields)?),
            message: message.to_string(),
        })?;
        Ok(())
    }

    /// Writes one server item into the mirror. Returns the AppPK, or `None`
    /// when the item carries no usable key and was skipped.
    fn ingest_item(&self, table: &AppTableConfig, item: &ListItem) -> Result<Option<String>> {
        let app_pk = item
            .fields
            .get(&table.pk_internal_name)
            .and_then(value::as_string)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        let Some(app_pk) = app_pk else {
            debug!(
                entity = %table.entity_name,
                sp_id = item.id,
                "server item has no {}; skipped", table.pk_internal_name
            );
            return Ok(None);
        };

        let mut fields = Map::new();
        for name in table.mirror_fields() {
            if let Some(v) = item.fields.get(name) {
                fields.insert(name.to_string(), v.clone());
            }
        }
        let system = SystemColumns {
            sharepoint_id: Some(item.id),
            sharepoint_modified_utc: item.modified_utc,
            sharepoint_etag: item.etag.clone(),
            is_deleted: item
                .fields
                .get(IS_DELETED_COLUMN)
                .and_then(value::as_bool)
                .unwrap_or(false),
            deleted_at_utc: item
                .fields
                .get(DELETED_AT_COLUMN)
                .and_then(value::as_datetime_utc),
        };
        self.store
            .upsert_entity_row(table, &app_pk, &fields, &system)?;
        Ok(Some(app_pk))
    }

    /// Best-effort mirror refresh after a server write; errors are logged
    /// and swallowed, the next pull converges anyway.
    async fn refresh_mirror(&self, table: &AppTableConfig, sp_id: i64) {
        match self
            .connector
            .get_list_item(&table.list_id, sp_id, &pull_select(table))
            .await
        {
            Ok(item) => {
                if let Err(err) = self.ingest_item(table, &item) {
                    warn!(entity = %table.entity_name, sp_id, %err, "mirror refresh write failed");
                }
            }
            Err(err) => {
                warn!(entity = %table.entity_name, sp_id, %err, "mirror refresh fetch failed");
            }
        }
    }

    async fn find_item_by_pk(
        &self,
        table: &AppTableConfig,
        app_pk: &str,
    ) -> std::result::Result<Option<ListItem>, crate::remote::RemoteError> {
        let query = ItemQuery {
            select: pull_select(table),
            filter: Some(eq_filter(&table.pk_internal_name, app_pk)),
            top: Some(1),
            ..Default::default()
        };
        let page = self.connector.query_list_items(&table.list_id, &query).await?;
        Ok(page.items.into_iter().next())
    }

    fn record_pull_error(&self, entity_name: &str, err: &SyncError) {
        let mut state = match self.store.get_sync_state(entity_name) {
            Ok(state) => state.unwrap_or_else(|| SyncState::empty(entity_name)),
            Err(_) => SyncState::empty(entity_name),
        };
        state.last_error = Some(err.to_string());
        if let Err(store_err) = self.store.put_sync_state(&state) {
            warn!(entity = %entity_name, %store_err, "failed to record pull error");
        }
    }
}

fn parse_payload(entry: &ChangeLogEntry) -> Result<Option<Map<String, Value>>> {
    let Some(raw) = entry.payload_json.as_deref() else {
        return Ok(None);
    };
    Ok(Some(serde_json::from_str(raw)?))
}

fn max_watermark(
    current: Option<(DateTime<Utc>, i64)>,
    candidate: (DateTime<Utc>, i64),
) -> (DateTime<Utc>, i64) {
    match current {
        Some(current) if current >= candidate => current,
        _ => candidate,
    }
}

/// `$select` list for pulls and refreshes: the whitelist plus the PK,
/// tombstone columns, and the item-level Id/Modified keys.
fn pull_select(table: &AppTableConfig) -> Vec<String> {
    fn add_unique(select: &mut Vec<String>, name: &str) {
        if !select.iter().any(|s| s.eq_ignore_ascii_case(name)) {
            select.push(name.to_string());
        }
    }
    let mut select = Vec::with_capacity(table.select_fields.len() + 5);
    for field in &table.select_fields {
        add_unique(&mut select, field);
    }
    add_unique(&mut select, &table.pk_internal_name);
    add_unique(&mut select, IS_DELETED_COLUMN);
    add_unique(&mut select, DELETED_AT_COLUMN);
    add_unique(&mut select, "Id");
    add_unique(&mut select, "Modified");
    select
}
