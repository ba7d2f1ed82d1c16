//! Configuration discovery against the server-side system lists.
//!
//! `APP_Config` carries one row per application with a monotonically
//! increasing `ConfigVersion`; `APP_Tables` is the table catalog. The local
//! copy is only replaced when the server version is strictly newer, so the
//! catalog refresh is cheap to call on every open.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::config::{
    AppTableConfig, AttachmentsMode, ConflictPolicy, LocalConfig, PartitionStrategy, SyncPolicy,
    DEFAULT_PK_INTERNAL_NAME,
};
use crate::error::{Result, SyncError};
use crate::remote::{eq_filter, ItemQuery, RemoteConnector};
use crate::store::SyncStore;
use crate::value;

pub const CONFIG_LIST_TITLE: &str = "APP_Config";
pub const TABLES_LIST_TITLE: &str = "APP_Tables";

const CONFLICT_POLICY_FIELD: &str = "ConflictPolicy";
const TABLES_PAGE_SIZE: u32 = 200;

/// Columns read from `APP_Tables`. `ConflictPolicy` is last so older
/// deployments without it can be retried with a truncated select.
const TABLE_SELECT: &[&str] = &[
    "EntityName",
    "ListId",
    "ListTitle",
    "Enabled",
    "PkInternalName",
    "SelectFieldsJson",
    "SyncPolicy",
    "Priority",
    "AttachmentsMode",
    "PartitionStrategy",
    "ExpectedIndexesJson",
    CONFLICT_POLICY_FIELD,
];

pub struct ConfigManager<C, S> {
    connector: Arc<C>,
    store: Arc<S>,
}

impl<C: RemoteConnector, S: SyncStore> ConfigManager<C, S> {
    pub fn new(connector: Arc<C>, store: Arc<S>) -> Self {
        Self { connector, store }
    }

    /// Returns the current table catalog for `app_id`, refreshing the local
    /// copy first when the server `ConfigVersion` is strictly newer.
    pub async fn ensure_config(&self, app_id: &str) -> Result<LocalConfig> {
        if app_id.trim().is_empty() {
            return Err(SyncError::InvalidArgument("empty AppId".into()));
        }

        let local = self
            .store
            .load_local_config(app_id)?
            .unwrap_or_else(|| LocalConfig::empty(app_id));

        let config_list = self.connector.get_list_id_by_title(CONFIG_LIST_TITLE).await?;
        let query = ItemQuery {
            select: vec![
                "AppId".into(),
                "ConfigVersion".into(),
                "MinClientVersion".into(),
                "LastModifiedUtc".into(),
            ],
            filter: Some(eq_filter("AppId", app_id)),
            top: Some(1),
            ..Default::default()
        };
        let page = self.connector.query_list_items(&config_list, &query).await?;
        let Some(remote) = page.items.into_iter().next() else {
            debug!(app_id, "no remote config row; keeping local catalog");
            return Ok(local);
        };

        let remote_version = remote
            .fields
            .get("ConfigVersion")
            .and_then(value::as_i64)
            .unwrap_or(0);
        if remote_version <= local.config_version {
            debug!(
                app_id,
                local_version = local.config_version,
                remote_version,
                "local catalog is current"
            );
            return Ok(local);
        }

        if let Some(min_client) = remote
            .fields
            .get("MinClientVersion")
            .and_then(value::as_string)
        {
            debug!(app_id, min_client = %min_client, "server minimum client version");
        }

        let tables = self.fetch_tables().await?;
        let refreshed = LocalConfig {
            app_id: app_id.to_string(),
            config_version: remote_version,
            tables,
            updated_utc: Utc::now(),
        };
        self.store.save_local_config(&refreshed)?;
        info!(
            app_id,
            config_version = refreshed.config_version,
            tables = refreshed.tables.len(),
            "table catalog refreshed"
        );
        Ok(refreshed)
    }

    async fn fetch_tables(&self) -> Result<Vec<AppTableConfig>> {
        let list_id = self.connector.get_list_id_by_title(TABLES_LIST_TITLE).await?;
        match self.fetch_table_pages(&list_id, true).await {
            Ok(tables) => Ok(tables),
            Err(SyncError::Remote(e)) if e.is_missing_column(CONFLICT_POLICY_FIELD) => {
                warn!(
                    "server APP_Tables has no ConflictPolicy column; defaulting to ServerWins"
                );
                self.fetch_table_pages(&list_id, false).await
            }
            Err(e) => Err(e),
        }
    }

    async fn fetch_table_pages(
        &self,
        list_id: &str,
        with_conflict_policy: bool,
    ) -> Result<Vec<AppTableConfig>> {
        let select: Vec<String> = TABLE_SELECT
            .iter()
            .copied()
            .filter(|c| with_conflict_policy || *c != CONFLICT_POLICY_FIELD)
            .map(str::to_string)
            .collect();
        let mut query = ItemQuery {
            select,
            order_by: Some("Priority asc".into()),
            top: Some(TABLES_PAGE_SIZE),
            ..Default::default()
        };

        let mut tables = Vec::new();
        loop {
            let page = self.connector.query_list_items(list_id, &query).await?;
            for item in page.items {
                match parse_table_row(&item.fields) {
                    Some(table) => tables.push(table),
                    None => warn!(
                        fields = %serde_json::Value::Object(item.fields.clone()),
                        "skipping unparseable APP_Tables row"
                    ),
                }
            }
            match page.next_page {
                Some(cursor) => query.next_page = Some(cursor),
                None => break,
            }
        }
        Ok(tables)
    }
}

fn parse_json_string_list(v: Option<&Value>) -> Vec<String> {
    let Some(text) = v.and_then(value::as_string) else {
        return Vec::new();
    };
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }
    match serde_json::from_str::<Vec<String>>(text) {
        Ok(list) => list,
        Err(err) => {
            warn!(%err, "ignoring malformed JSON string list in APP_Tables");
            Vec::new()
        }
    }
}

fn parse_table_row(fields: &Map<String, Value>) -> Option<AppTableConfig> {
    let entity_name = fields
        .get("EntityName")
        .and_then(value::as_string)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())?;
    let list_id = fields
        .get("ListId")
        .and_then(value::as_string)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())?;

    let pk_internal_name = fields
        .get("PkInternalName")
        .and_then(value::as_string)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| DEFAULT_PK_INTERNAL_NAME.to_string());

    Some(AppTableConfig {
        entity_name,
        list_id,
        list_title: fields
            .get("ListTitle")
            .and_then(value::as_string)
            .unwrap_or_default(),
        enabled: fields
            .get("Enabled")
            .and_then(value::as_bool)
            .unwrap_or(false),
        pk_internal_name,
        select_fields: parse_json_string_list(fields.get("SelectFieldsJson")),
        sync_policy: SyncPolicy::from_remote(fields.get("SyncPolicy")),
        attachments_mode: AttachmentsMode::from_remote(fields.get("AttachmentsMode")),
        partition_strategy: PartitionStrategy::from_remote(fields.get("PartitionStrategy")),
        conflict_policy: ConflictPolicy::from_remote(fields.get(CONFLICT_POLICY_FIELD)),
        priority: fields
            .get("Priority")
            .and_then(value::as_i64)
            .unwrap_or(0) as i32,
        expected_indexes: parse_json_string_list(fields.get("ExpectedIndexesJson")),
    })
}
