//! Thread-safe facade binding the store, the connector, configuration
//! discovery and the sync engine behind one lifecycle.
//!
//! Reads and writes always hit the local mirror; every local mutation also
//! appends an outbox row, and the background syncs reconcile both
//! directions. Overlapping syncs of one entity are serialized through a
//! per-entity lock map; distinct entities sync concurrently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::config::{AppTableConfig, LocalConfig, SyncPolicy};
use crate::discovery::ConfigManager;
use crate::engine::{PullSummary, PushSummary, SyncEngine, DEFAULT_MAX_CHANGES};
use crate::error::{Result, SyncError};
use crate::interrupt::Interrupt;
use crate::mirror::{MirrorRow, MirrorStore};
use crate::remote::RemoteConnector;
use crate::store::{ChangeOperation, ConflictLogEntry, NewChange, SyncStore};

/// Outcome of one composite sync: the outbox drain followed by the pulls.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub push: PushSummary,
    pub pulls: Vec<PullSummary>,
}

pub struct SpSyncClient<C, S> {
    app_id: String,
    connector: Arc<C>,
    store: Arc<S>,
    engine: SyncEngine<C, S>,
    config_manager: ConfigManager<C, S>,
    config: Mutex<LocalConfig>,
    table_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    max_changes_per_drain: i64,
}

impl<C, S> SpSyncClient<C, S>
where
    C: RemoteConnector,
    S: SyncStore + MirrorStore,
{
    pub fn new(app_id: impl Into<String>, connector: Arc<C>, store: Arc<S>) -> Self {
        let app_id = app_id.into();
        Self {
            engine: SyncEngine::new(connector.clone(), store.clone()),
            config_manager: ConfigManager::new(connector.clone(), store.clone()),
            config: Mutex::new(LocalConfig::empty(&app_id)),
            table_locks: Mutex::new(HashMap::new()),
            max_changes_per_drain: DEFAULT_MAX_CHANGES,
            app_id,
            connector,
            store,
        }
    }

    pub fn with_max_changes(mut self, max_changes: i64) -> Self {
        self.max_changes_per_drain = max_changes;
        self
    }

    /// Opens the store schema and brings the table catalog up to date.
    /// When the server is unreachable the previously persisted catalog is
    /// used, so an offline start still serves local reads and writes.
    pub async fn initialize(&self) -> Result<LocalConfig> {
        self.store.init_schema()?;
        match self.ensure_config().await {
            Ok(config) => Ok(config),
            Err(SyncError::Remote(remote_err)) => {
                let Some(cached) = self.store.load_local_config(&self.app_id)? else {
                    return Err(SyncError::Remote(remote_err));
                };
                warn!(
                    app_id = %self.app_id,
                    %remote_err,
                    "config refresh unreachable; using cached catalog"
                );
                self.adopt_config(&cached)?;
                Ok(cached)
            }
            Err(err) => Err(err),
        }
    }

    /// Version-gated catalog refresh; also makes sure every configured
    /// entity has its mirror table.
    pub async fn ensure_config(&self) -> Result<LocalConfig> {
        let config = self.config_manager.ensure_config(&self.app_id).await?;
        self.adopt_config(&config)?;
        Ok(config)
    }

    fn adopt_config(&self, config: &LocalConfig) -> Result<()> {
        for table in &config.tables {
            self.store.ensure_entity_schema(table)?;
        }
        *self.config.lock().unwrap() = config.clone();
        Ok(())
    }

    pub fn current_config(&self) -> LocalConfig {
        self.config.lock().unwrap().clone()
    }

    fn require_config(&self) -> Result<LocalConfig> {
        let config = self.current_config();
        if config.tables.is_empty() {
            return Err(SyncError::ConfigMissing(self.app_id.clone()));
        }
        Ok(config)
    }

    fn require_table<'a>(
        &self,
        config: &'a LocalConfig,
        entity_name: &str,
    ) -> Result<&'a AppTableConfig> {
        if entity_name.trim().is_empty() {
            return Err(SyncError::InvalidArgument("empty entity name".into()));
        }
        config
            .table(entity_name)
            .ok_or_else(|| SyncError::ConfigMissing(entity_name.to_string()))
    }

    fn table_lock(&self, entity_name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.table_locks.lock().unwrap();
        locks
            .entry(entity_name.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Outbox drain, then pull of every enabled `OnOpen` table.
    pub async fn sync_on_open(&self, interrupt: &Interrupt) -> Result<SyncReport> {
        self.sync_many(Some(SyncPolicy::OnOpen), interrupt).await
    }

    /// Outbox drain, then pull of every enabled table.
    pub async fn sync_all(&self, interrupt: &Interrupt) -> Result<SyncReport> {
        self.sync_many(None, interrupt).await
    }

    async fn sync_many(
        &self,
        policy: Option<SyncPolicy>,
        interrupt: &Interrupt,
    ) -> Result<SyncReport> {
        let config = self.require_config()?;
        let push = self
            .engine
            .sync_up(&config, self.max_changes_per_drain, interrupt)
            .await?;
        let mut pulls = Vec::new();
        for table in config.tables_to_pull(policy) {
            let lock = self.table_lock(&table.entity_name);
            let _guard = lock.lock().await;
            pulls.push(
                self.engine
                    .sync_down(table, config.config_version, interrupt)
                    .await?,
            );
        }
        info!(
            app_id = %self.app_id,
            pushed = push.applied,
            tables = pulls.len(),
            "composite sync complete"
        );
        Ok(SyncReport { push, pulls })
    }

    /// Drains the outbox, then pulls only the named entity. Overlapping
    /// calls for the same entity wait on its lock. Disabled and
    /// `Never`-policy tables still drain but are not pulled.
    pub async fn sync_table(&self, entity_name: &str, interrupt: &Interrupt) -> Result<SyncReport> {
        let config = self.require_config()?;
        let table = self.require_table(&config, entity_name)?;

        let lock = self.table_lock(entity_name);
        let _guard = lock.lock().await;

        let push = self
            .engine
            .sync_up(&config, self.max_changes_per_drain, interrupt)
            .await?;
        let mut pulls = Vec::new();
        if table.enabled && table.sync_policy != SyncPolicy::Never {
            pulls.push(
                self.engine
                    .sync_down(table, config.config_version, interrupt)
                    .await?,
            );
        } else {
            debug!(entity = %entity_name, "table is disabled or never-pulled; drain only");
        }
        Ok(SyncReport { push, pulls })
    }

    /// Local insert: merges the payload into the mirror row and appends an
    /// Insert to the outbox. Returns the outbox row id.
    pub fn upsert_local_and_enqueue_insert(
        &self,
        entity_name: &str,
        app_pk: &str,
        fields: &Map<String, Value>,
    ) -> Result<i64> {
        self.upsert_local(entity_name, app_pk, fields, ChangeOperation::Insert)
    }

    /// Local update: same merge semantics, Update operation.
    pub fn upsert_local_and_enqueue_update(
        &self,
        entity_name: &str,
        app_pk: &str,
        fields: &Map<String, Value>,
    ) -> Result<i64> {
        self.upsert_local(entity_name, app_pk, fields, ChangeOperation::Update)
    }

    fn upsert_local(
        &self,
        entity_name: &str,
        app_pk: &str,
        fields: &Map<String, Value>,
        operation: ChangeOperation,
    ) -> Result<i64> {
        let config = self.current_config();
        let table = self.require_table(&config, entity_name)?;
        let app_pk = require_app_pk(app_pk)?;
        self.store.ensure_entity_schema(table)?;

        let sanitized = sanitize_payload(table, fields);

        // merge over whatever the mirror already holds; system columns are
        // preserved untouched
        let existing = self.store.get_entity_row(table, app_pk)?;
        let (mut merged, system) = existing
            .map(|row| (row.fields, row.system))
            .unwrap_or_default();
        for (key, val) in &sanitized {
            merged.insert(key.clone(), val.clone());
        }
        self.store
            .upsert_entity_row(table, app_pk, &merged, &system)?;

        let change_id = self.store.enqueue_change(NewChange {
            entity_name: entity_name.to_string(),
            app_pk: app_pk.to_string(),
            operation,
            payload_json: Some(serde_json::to_string(&sanitized)?),
            created_utc: None,
        })?;
        debug!(
            entity = %entity_name,
            app_pk = %app_pk,
            operation = ?operation,
            change_id,
            "local write enqueued"
        );
        Ok(change_id)
    }

    /// Tombstones the mirror row and appends a SoftDelete to the outbox.
    pub fn mark_local_deleted_and_enqueue_soft_delete(
        &self,
        entity_name: &str,
        app_pk: &str,
    ) -> Result<i64> {
        let config = self.current_config();
        let table = self.require_table(&config, entity_name)?;
        let app_pk = require_app_pk(app_pk)?;
        self.store.ensure_entity_schema(table)?;

        let existing = self.store.get_entity_row(table, app_pk)?;
        let (fields, mut system) = existing
            .map(|row| (row.fields, row.system))
            .unwrap_or_default();
        system.is_deleted = true;
        system.deleted_at_utc = Some(Utc::now());
        self.store
            .upsert_entity_row(table, app_pk, &fields, &system)?;

        let change_id = self.store.enqueue_change(NewChange {
            entity_name: entity_name.to_string(),
            app_pk: app_pk.to_string(),
            operation: ChangeOperation::SoftDelete,
            payload_json: None,
            created_utc: None,
        })?;
        debug!(entity = %entity_name, app_pk = %app_pk, change_id, "soft delete enqueued");
        Ok(change_id)
    }

    /// Point read from the mirror.
    pub fn get_local(&self, entity_name: &str, app_pk: &str) -> Result<Option<MirrorRow>> {
        let config = self.current_config();
        let table = self.require_table(&config, entity_name)?;
        self.store.get_entity_row(table, require_app_pk(app_pk)?)
    }

    pub fn pending_change_count(&self) -> Result<i64> {
        self.store.pending_change_count()
    }

    pub fn recent_conflicts(&self, limit: i64) -> Result<Vec<ConflictLogEntry>> {
        self.store.get_recent_conflicts(limit)
    }

    /// Operator action: put a Conflict outbox row back into rotation.
    pub fn reset_conflict(&self, change_id: i64) -> Result<()> {
        self.store.reset_conflict(change_id)
    }

    pub fn connector(&self) -> &Arc<C> {
        &self.connector
    }
}

fn require_app_pk(app_pk: &str) -> Result<&str> {
    let trimmed = app_pk.trim();
    if trimmed.is_empty() {
        return Err(SyncError::InvalidArgument("empty AppPK".into()));
    }
    Ok(app_pk)
}

/// Strips every reserved key (the app PK, the server PK column, tombstones
/// and `__sp_*`) from a user payload before it reaches the outbox or the
/// mirror.
fn sanitize_payload(table: &AppTableConfig, fields: &Map<String, Value>) -> Map<String, Value> {
    fields
        .iter()
        .filter(|(key, _)| !table.is_reserved_column(key))
        .map(|(key, val)| (key.clone(), val.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConflictPolicy;
    use crate::store::{ChangeStatus, SqliteStore};
    use crate::testutil::MockConnector;
    use serde_json::json;

    struct Harness {
        connector: Arc<MockConnector>,
        store: Arc<SqliteStore>,
        client: SpSyncClient<MockConnector, SqliteStore>,
        clients_list: String,
    }

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    /// Server with APP_Config v1 and one `Clients` table.
    fn seeded() -> Harness {
        let connector = Arc::new(MockConnector::new());
        let config_list = connector.add_list("APP_Config");
        connector.seed_item(
            &config_list,
            json!({"AppId": "app", "ConfigVersion": 1}),
            None,
        );
        let tables_list = connector.add_list("APP_Tables");
        let clients_list = connector.add_list("Clients");
        connector.set_unique_field(&clients_list, "AppPK");
        connector.seed_item(
            &tables_list,
            json!({
                "EntityName": "Clients",
                "ListId": clients_list,
                "ListTitle": "Clients",
                "Enabled": true,
                "PkInternalName": "AppPK",
                "SelectFieldsJson": "[\"Title\",\"Value\"]",
                "SyncPolicy": 0,
                "Priority": 1,
                "ConflictPolicy": "ServerWins",
            }),
            None,
        );

        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let client = SpSyncClient::new("app", connector.clone(), store.clone());
        Harness {
            connector,
            store,
            client,
            clients_list,
        }
    }

    #[tokio::test]
    async fn initialize_discovers_catalog_and_creates_mirrors() {
        let h = seeded();
        let config = h.client.initialize().await.unwrap();
        assert_eq!(config.config_version, 1);
        assert_eq!(config.tables.len(), 1);
        // mirror schema exists: a local read works immediately
        assert!(h.client.get_local("Clients", "nope").unwrap().is_none());
    }

    #[tokio::test]
    async fn initialize_falls_back_to_cached_catalog_when_offline() {
        let h = seeded();
        h.client.initialize().await.unwrap();

        // second client against a dead server, same store
        let offline = Arc::new(MockConnector::new());
        let client2: SpSyncClient<MockConnector, SqliteStore> =
            SpSyncClient::new("app", offline, h.store.clone());
        let config = client2.initialize().await.unwrap();
        assert_eq!(config.config_version, 1);
        assert_eq!(config.tables.len(), 1);
    }

    #[tokio::test]
    async fn initialize_without_cache_or_server_fails() {
        let offline = Arc::new(MockConnector::new());
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let client: SpSyncClient<MockConnector, SqliteStore> =
            SpSyncClient::new("app", offline, store);
        assert!(matches!(
            client.initialize().await,
            Err(SyncError::Remote(_))
        ));
    }

    #[tokio::test]
    async fn sync_before_config_fails_fast() {
        let h = seeded();
        // no initialize: catalog is empty
        assert!(matches!(
            h.client.sync_on_open(&Interrupt::new()).await,
            Err(SyncError::ConfigMissing(_))
        ));
        assert!(matches!(
            h.client.sync_table("Clients", &Interrupt::new()).await,
            Err(SyncError::ConfigMissing(_))
        ));
    }

    #[tokio::test]
    async fn on_open_sync_pulls_seeded_rows() {
        let h = seeded();
        h.connector.seed_item(
            &h.clients_list,
            json!({"AppPK": "A", "Title": "a", "Value": "1"}),
            None,
        );
        h.client.initialize().await.unwrap();

        let report = h.client.sync_on_open(&Interrupt::new()).await.unwrap();
        assert_eq!(report.pulls.len(), 1);
        assert_eq!(report.pulls[0].items, 1);

        let row = h.client.get_local("Clients", "A").unwrap().unwrap();
        assert_eq!(row.fields.get("Title"), Some(&json!("a")));
        assert!(row.system.sharepoint_id.is_some());
    }

    /// Offline insert through the facade, then drain on connectivity.
    #[tokio::test]
    async fn local_insert_then_sync_table() {
        let h = seeded();
        h.client.initialize().await.unwrap();

        let change_id = h
            .client
            .upsert_local_and_enqueue_insert("Clients", "D", &fields(json!({"Title": "d"})))
            .unwrap();
        assert_eq!(h.client.pending_change_count().unwrap(), 1);

        // local read works before any network traffic
        let row = h.client.get_local("Clients", "D").unwrap().unwrap();
        assert_eq!(row.fields.get("Title"), Some(&json!("d")));
        assert!(row.system.sharepoint_id.is_none());

        let report = h.client.sync_table("Clients", &Interrupt::new()).await.unwrap();
        assert_eq!(report.push.applied, 1);
        assert_eq!(h.client.pending_change_count().unwrap(), 0);

        let row = h.client.get_local("Clients", "D").unwrap().unwrap();
        assert!(row.system.sharepoint_id.is_some());
        let change = h.store.get_change(change_id).unwrap().unwrap();
        assert_eq!(change.status, ChangeStatus::Applied);
        assert!(
            h.connector
                .find_by_field(&h.clients_list, "AppPK", "D")
                .is_some()
        );
    }

    /// No reserved key survives sanitization, in the outbox
    /// payload or the mirror.
    #[tokio::test]
    async fn payload_sanitization_strips_reserved_keys() {
        let h = seeded();
        h.client.initialize().await.unwrap();

        let dirty = fields(json!({
            "Title": "t",
            "AppPK": "evil",
            "apppk": "evil2",
            "IsDeleted": true,
            "DeletedAtUtc": "2024-01-01T00:00:00Z",
            "__sp_id": 99,
            "__sp_etag": "\"9\"",
            "__sp_modified_utc": "2024-01-01T00:00:00Z",
        }));
        let change_id = h
            .client
            .upsert_local_and_enqueue_insert("Clients", "A", &dirty)
            .unwrap();

        let change = h.store.get_change(change_id).unwrap().unwrap();
        let payload: Map<String, Value> =
            serde_json::from_str(change.payload_json.as_deref().unwrap()).unwrap();
        assert_eq!(payload.len(), 1);
        assert!(payload.contains_key("Title"));

        let row = h.client.get_local("Clients", "A").unwrap().unwrap();
        assert_eq!(row.app_pk, "A");
        assert!(!row.system.is_deleted);
        assert!(row.system.sharepoint_id.is_none());
        assert_eq!(row.fields.get("Title"), Some(&json!("t")));
    }

    #[tokio::test]
    async fn local_update_merges_over_existing_fields() {
        let h = seeded();
        h.client.initialize().await.unwrap();

        h.client
            .upsert_local_and_enqueue_insert(
                "Clients",
                "A",
                &fields(json!({"Title": "t", "Value": "1"})),
            )
            .unwrap();
        h.client
            .upsert_local_and_enqueue_update("Clients", "A", &fields(json!({"Value": "2"})))
            .unwrap();

        let row = h.client.get_local("Clients", "A").unwrap().unwrap();
        assert_eq!(row.fields.get("Title"), Some(&json!("t")), "kept");
        assert_eq!(row.fields.get("Value"), Some(&json!("2")), "overwritten");
        assert_eq!(h.client.pending_change_count().unwrap(), 2);
    }

    #[tokio::test]
    async fn update_preserves_system_columns() {
        let h = seeded();
        let id = h.connector.seed_item(
            &h.clients_list,
            json!({"AppPK": "A", "Title": "a"}),
            None,
        );
        h.client.initialize().await.unwrap();
        h.client.sync_on_open(&Interrupt::new()).await.unwrap();

        h.client
            .upsert_local_and_enqueue_update("Clients", "A", &fields(json!({"Value": "x"})))
            .unwrap();
        let row = h.client.get_local("Clients", "A").unwrap().unwrap();
        assert_eq!(row.system.sharepoint_id, Some(id));
        assert!(row.system.sharepoint_etag.is_some());
        assert_eq!(row.fields.get("Value"), Some(&json!("x")));
    }

    /// The tombstone lands locally before any sync.
    #[tokio::test]
    async fn soft_delete_marks_locally_and_enqueues() {
        let h = seeded();
        h.connector.seed_item(
            &h.clients_list,
            json!({"AppPK": "A", "Title": "a"}),
            None,
        );
        h.client.initialize().await.unwrap();
        h.client.sync_on_open(&Interrupt::new()).await.unwrap();

        h.client
            .mark_local_deleted_and_enqueue_soft_delete("Clients", "A")
            .unwrap();
        let row = h.client.get_local("Clients", "A").unwrap().unwrap();
        assert!(row.system.is_deleted);
        assert!(row.system.deleted_at_utc.is_some());

        let report = h.client.sync_table("Clients", &Interrupt::new()).await.unwrap();
        assert_eq!(report.push.applied, 1);
        let id = h
            .connector
            .find_by_field(&h.clients_list, "AppPK", "A")
            .unwrap();
        let server = h.connector.get_item_fields(&h.clients_list, id).unwrap();
        assert_eq!(server.get("IsDeleted"), Some(&json!(true)));

        // the tombstone survives the pull that followed the push
        let row = h.client.get_local("Clients", "A").unwrap().unwrap();
        assert!(row.system.is_deleted);
    }

    #[tokio::test]
    async fn invalid_arguments_are_rejected_synchronously() {
        let h = seeded();
        h.client.initialize().await.unwrap();

        assert!(matches!(
            h.client.upsert_local_and_enqueue_insert("", "A", &Map::new()),
            Err(SyncError::InvalidArgument(_))
        ));
        assert!(matches!(
            h.client.upsert_local_and_enqueue_insert("Clients", "  ", &Map::new()),
            Err(SyncError::InvalidArgument(_))
        ));
        assert!(matches!(
            h.client.upsert_local_and_enqueue_insert("Ghost", "A", &Map::new()),
            Err(SyncError::ConfigMissing(_))
        ));
        // nothing was enqueued
        assert_eq!(h.client.pending_change_count().unwrap(), 0);
    }

    /// The outbox drains before the pull, so a local write is on the server
    /// before the pull rewrites the mirror.
    #[tokio::test]
    async fn push_runs_before_pull_in_composite_sync() {
        let h = seeded();
        h.connector.seed_item(
            &h.clients_list,
            json!({"AppPK": "B", "Title": "b", "Value": "old"}),
            None,
        );
        h.client.initialize().await.unwrap();
        h.client.sync_on_open(&Interrupt::new()).await.unwrap();

        h.client
            .upsert_local_and_enqueue_update("Clients", "B", &fields(json!({"Value": "x"})))
            .unwrap();
        h.client.sync_table("Clients", &Interrupt::new()).await.unwrap();

        // had the pull run first, the mirror would have reverted to "old"
        let row = h.client.get_local("Clients", "B").unwrap().unwrap();
        assert_eq!(row.fields.get("Value"), Some(&json!("x")));
        let id = h
            .connector
            .find_by_field(&h.clients_list, "AppPK", "B")
            .unwrap();
        let server = h.connector.get_item_fields(&h.clients_list, id).unwrap();
        assert_eq!(server.get("Value"), Some(&json!("x")));
    }

    #[tokio::test]
    async fn never_policy_table_drains_but_is_not_pulled() {
        let connector = Arc::new(MockConnector::new());
        let config_list = connector.add_list("APP_Config");
        connector.seed_item(&config_list, json!({"AppId": "app", "ConfigVersion": 1}), None);
        let tables_list = connector.add_list("APP_Tables");
        let clients_list = connector.add_list("Clients");
        connector.seed_item(
            &tables_list,
            json!({
                "EntityName": "Clients",
                "ListId": clients_list,
                "Enabled": true,
                "SelectFieldsJson": "[\"Title\"]",
                "SyncPolicy": "Never",
            }),
            None,
        );
        connector.seed_item(&clients_list, json!({"AppPK": "A", "Title": "a"}), None);

        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let client: SpSyncClient<MockConnector, SqliteStore> =
            SpSyncClient::new("app", connector.clone(), store);
        client.initialize().await.unwrap();

        client
            .upsert_local_and_enqueue_insert("Clients", "D", &fields(json!({"Title": "d"})))
            .unwrap();
        let report = client.sync_table("Clients", &Interrupt::new()).await.unwrap();
        assert_eq!(report.push.applied, 1);
        assert!(report.pulls.is_empty());

        // the drain reached the server but the seeded row was never mirrored
        assert!(connector.find_by_field(&clients_list, "AppPK", "D").is_some());
        assert!(client.get_local("Clients", "A").unwrap().is_none());
    }

    #[tokio::test]
    async fn conflict_surfaces_in_audit_and_can_be_reset() {
        // like seeded(), but with Manual policy in the catalog
        let connector = Arc::new(MockConnector::new());
        let config_list = connector.add_list("APP_Config");
        connector.seed_item(&config_list, json!({"AppId": "app", "ConfigVersion": 1}), None);
        let tables_list = connector.add_list("APP_Tables");
        let clients_list = connector.add_list("Clients");
        connector.seed_item(
            &tables_list,
            json!({
                "EntityName": "Clients",
                "ListId": clients_list,
                "Enabled": true,
                "SelectFieldsJson": "[\"Title\",\"Value\"]",
                "ConflictPolicy": "Manual",
            }),
            None,
        );
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let client: SpSyncClient<MockConnector, SqliteStore> =
            SpSyncClient::new("app", connector.clone(), store.clone());

        let id = connector.seed_item(
            &clients_list,
            json!({"AppPK": "B", "Title": "b", "Value": "old"}),
            None,
        );
        client.initialize().await.unwrap();
        client.sync_on_open(&Interrupt::new()).await.unwrap();

        // server moves, then the stale local write conflicts
        connector.update_item(&clients_list, id, json!({"Value": "y"}), None);
        let change_id = client
            .upsert_local_and_enqueue_update("Clients", "B", &fields(json!({"Value": "x"})))
            .unwrap();
        let report = client.sync_table("Clients", &Interrupt::new()).await.unwrap();
        assert_eq!(report.push.conflicted, 1);

        let conflicts = client.recent_conflicts(10).unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].policy, ConflictPolicy::Manual);
        assert_eq!(conflicts[0].change_id, change_id);

        client.reset_conflict(change_id).unwrap();
        assert_eq!(client.pending_change_count().unwrap(), 1);
    }
}
