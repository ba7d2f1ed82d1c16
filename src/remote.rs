//! Contract for the REST connector to the remote list store.
//!
//! The connector itself (authentication, cookie acquisition, form-digest
//! handling, paging transport) lives outside this crate; the engine only
//! depends on the trait below plus the error classification rules that turn
//! raw HTTP failures into conflict signals.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

/// One list item as the connector surfaces it: the integer server id, the
/// opaque version token, the server modification time, and the raw fields.
#[derive(Debug, Clone)]
pub struct ListItem {
    pub id: i64,
    pub etag: Option<String>,
    pub modified_utc: Option<DateTime<Utc>>,
    pub fields: Map<String, Value>,
}

/// Server-evaluated query over a list.
#[derive(Debug, Clone, Default)]
pub struct ItemQuery {
    pub select: Vec<String>,
    pub filter: Option<String>,
    pub order_by: Option<String>,
    pub top: Option<u32>,
    /// Opaque pagination cursor from the previous page, if any.
    pub next_page: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ItemPage {
    pub items: Vec<ListItem>,
    pub next_page: Option<String>,
}

/// Failure surfaced by any connector call. Carries enough of the HTTP
/// exchange to classify conflicts without re-reading the response.
#[derive(Debug, Clone, Error)]
#[error("HTTP {status_code} {reason_phrase}: {response_body}")]
pub struct RemoteError {
    pub status_code: u16,
    pub reason_phrase: String,
    pub response_body: String,
}

impl RemoteError {
    pub fn new(status_code: u16, reason_phrase: &str, response_body: &str) -> Self {
        Self {
            status_code,
            reason_phrase: reason_phrase.to_string(),
            response_body: response_body.to_string(),
        }
    }

    fn body_contains(&self, needle: &str) -> bool {
        self.response_body
            .to_ascii_lowercase()
            .contains(&needle.to_ascii_lowercase())
    }

    /// Optimistic-concurrency failure: 409/412, or a 400 whose body cites
    /// the ETag precondition.
    pub fn is_concurrency_conflict(&self) -> bool {
        match self.status_code {
            409 | 412 => true,
            400 => self.body_contains("etag") || self.body_contains("precondition"),
            _ => false,
        }
    }

    /// Create hit an existing row: 409, or a 400/500 whose body cites a
    /// uniqueness violation.
    pub fn is_already_exists(&self) -> bool {
        match self.status_code {
            409 => true,
            400 | 500 => {
                self.body_contains("unique")
                    || self.body_contains("already")
                    || self.body_contains("duplicate")
            }
            _ => false,
        }
    }

    /// A 400 that names the given column; used to detect servers whose
    /// `APP_Tables` schema predates a column.
    pub fn is_missing_column(&self, column: &str) -> bool {
        self.status_code == 400 && self.body_contains(column)
    }
}

/// Minimal surface the sync engine needs from the remote store. Implemented
/// over SharePoint REST by the host application; implemented in-memory by
/// the test harness. Attachment primitives stay on the host's connector
/// type, nothing in the engine touches them.
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn get_list_id_by_title(&self, title: &str) -> Result<String, RemoteError>;

    async fn query_list_items(
        &self,
        list_id: &str,
        query: &ItemQuery,
    ) -> Result<ItemPage, RemoteError>;

    async fn get_list_item(
        &self,
        list_id: &str,
        id: i64,
        select: &[String],
    ) -> Result<ListItem, RemoteError>;

    /// Returns the new item's server id.
    async fn create_list_item(
        &self,
        list_id: &str,
        fields: &Map<String, Value>,
    ) -> Result<i64, RemoteError>;

    /// `if_match` is an explicit ETag for optimistic writes, `*` for
    /// unconditional ones.
    async fn update_list_item(
        &self,
        list_id: &str,
        id: i64,
        fields: &Map<String, Value>,
        if_match: &str,
    ) -> Result<(), RemoteError>;
}

/// Quotes a string literal for the OData filter dialect: single quotes,
/// embedded quotes doubled.
pub fn odata_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// `datetime'YYYY-MM-DDTHH:MM:SSZ'` literal.
pub fn odata_datetime(dt: &DateTime<Utc>) -> String {
    format!("datetime'{}'", dt.format("%Y-%m-%dT%H:%M:%SZ"))
}

pub fn eq_filter(field: &str, value: &str) -> String {
    format!("{field} eq {}", odata_quote(value))
}

pub fn modified_since_filter(watermark: &DateTime<Utc>) -> String {
    format!("Modified ge {}", odata_datetime(watermark))
}
