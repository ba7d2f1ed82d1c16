use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::value;

/// Default server-side primary-key column when `APP_Tables` does not name one.
pub const DEFAULT_PK_INTERNAL_NAME: &str = "AppPK";

/// System columns carried on every mirror row.
pub const SP_ID_COLUMN: &str = "__sp_id";
pub const SP_MODIFIED_COLUMN: &str = "__sp_modified_utc";
pub const SP_ETAG_COLUMN: &str = "__sp_etag";
pub const IS_DELETED_COLUMN: &str = "IsDeleted";
pub const DELETED_AT_COLUMN: &str = "DeletedAtUtc";

/// When an entity is pulled from the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncPolicy {
    #[default]
    OnOpen,
    OnDemand,
    Never,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttachmentsMode {
    #[default]
    None,
    Manual,
    Auto,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionStrategy {
    #[default]
    None,
    ByUser,
    ByDate,
}

/// How a concurrency or already-exists conflict is settled for an entity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictPolicy {
    #[default]
    ServerWins,
    ClientWins,
    Manual,
}

macro_rules! enum_coercion {
    ($ty:ident { $($variant:ident = $ord:literal),+ $(,)? }) => {
        impl $ty {
            pub fn ordinal(self) -> i64 {
                match self {
                    $($ty::$variant => $ord,)+
                }
            }

            pub fn from_ordinal(n: i64) -> Option<Self> {
                match n {
                    $($ord => Some($ty::$variant),)+
                    _ => None,
                }
            }

            pub fn parse_name(s: &str) -> Option<Self> {
                let s = s.trim();
                $(
                    if s.eq_ignore_ascii_case(stringify!($variant)) {
                        return Some($ty::$variant);
                    }
                )+
                None
            }

            /// Coerce a raw remote value: name match first (case-insensitive),
            /// then numeric ordinal, else the default.
            pub fn from_remote(v: Option<&Value>) -> Self {
                let Some(v) = v else { return Self::default() };
                if let Some(s) = v.as_str() {
                    if let Some(parsed) = Self::parse_name(s) {
                        return parsed;
                    }
                }
                value::as_i64(v)
                    .and_then(Self::from_ordinal)
                    .unwrap_or_default()
            }
        }
    };
}

enum_coercion!(SyncPolicy { OnOpen = 0, OnDemand = 1, Never = 2 });
enum_coercion!(AttachmentsMode { None = 0, Manual = 1, Auto = 2 });
enum_coercion!(PartitionStrategy { None = 0, ByUser = 1, ByDate = 2 });
enum_coercion!(ConflictPolicy { ServerWins = 0, ClientWins = 1, Manual = 2 });

/// One synced entity as described by a row of `APP_Tables`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppTableConfig {
    pub entity_name: String,
    pub list_id: String,
    #[serde(default)]
    pub list_title: String,
    pub enabled: bool,
    #[serde(default = "default_pk_internal_name")]
    pub pk_internal_name: String,
    #[serde(default)]
    pub select_fields: Vec<String>,
    #[serde(default)]
    pub sync_policy: SyncPolicy,
    #[serde(default)]
    pub attachments_mode: AttachmentsMode,
    #[serde(default)]
    pub partition_strategy: PartitionStrategy,
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub expected_indexes: Vec<String>,
}

fn default_pk_internal_name() -> String {
    DEFAULT_PK_INTERNAL_NAME.to_string()
}

impl AppTableConfig {
    /// Columns never written as user fields for this entity: the app PK, the
    /// server PK column, tombstones and the `__sp_*` system columns.
    pub fn is_reserved_column(&self, name: &str) -> bool {
        name.eq_ignore_ascii_case(DEFAULT_PK_INTERNAL_NAME)
            || name.eq_ignore_ascii_case(&self.pk_internal_name)
            || name.eq_ignore_ascii_case(IS_DELETED_COLUMN)
            || name.eq_ignore_ascii_case(DELETED_AT_COLUMN)
            || name.eq_ignore_ascii_case(SP_ID_COLUMN)
            || name.eq_ignore_ascii_case(SP_MODIFIED_COLUMN)
            || name.eq_ignore_ascii_case(SP_ETAG_COLUMN)
    }

    /// User fields that may appear in the local mirror.
    pub fn mirror_fields(&self) -> impl Iterator<Item = &str> {
        self.select_fields
            .iter()
            .map(String::as_str)
            .filter(|f| !self.is_reserved_column(f))
    }
}

/// Local copy of the server-published catalog, replaced wholesale whenever
/// the server `ConfigVersion` advances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    pub app_id: String,
    pub config_version: i64,
    pub tables: Vec<AppTableConfig>,
    pub updated_utc: DateTime<Utc>,
}

impl LocalConfig {
    pub fn empty(app_id: &str) -> Self {
        Self {
            app_id: app_id.to_string(),
            config_version: 0,
            tables: Vec::new(),
            updated_utc: Utc::now(),
        }
    }

    pub fn table(&self, entity_name: &str) -> Option<&AppTableConfig> {
        self.tables.iter().find(|t| t.entity_name == entity_name)
    }

    /// Enabled tables in priority order, optionally narrowed to one policy.
    pub fn tables_to_pull(&self, policy: Option<SyncPolicy>) -> Vec<&AppTableConfig> {
        let mut out: Vec<&AppTableConfig> = self
            .tables
            .iter()
            .filter(|t| t.enabled)
            .filter(|t| policy.is_none_or(|p| t.sync_policy == p))
            .collect();
        out.sort_by_key(|t| t.priority);
        out
    }
}
