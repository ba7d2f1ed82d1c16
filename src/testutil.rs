//! In-memory scripted connector for tests.
//!
//! Implements [`RemoteConnector`] over a handful of fake lists with
//! ETag-checked updates, uniqueness enforcement, a tiny subset of the
//! filter dialect (exactly what the engine emits), and knobs for failure
//! injection.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::remote::{ItemPage, ItemQuery, ListItem, RemoteConnector, RemoteError};
use crate::value;

#[derive(Debug, Clone)]
struct MockItem {
    id: i64,
    version: i64,
    modified: DateTime<Utc>,
    fields: Map<String, Value>,
}

impl MockItem {
    fn etag(&self) -> String {
        format!("\"{}\"", self.version)
    }

    fn to_list_item(&self) -> ListItem {
        ListItem {
            id: self.id,
            etag: Some(self.etag()),
            modified_utc: Some(self.modified),
            fields: self.fields.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct MockList {
    title: String,
    next_id: i64,
    unique_field: Option<String>,
    reject_select: Vec<String>,
    force_update_conflict: bool,
    items: BTreeMap<i64, MockItem>,
}

#[derive(Debug, Default)]
struct State {
    lists: BTreeMap<String, MockList>,
    next_list: usize,
}

#[derive(Debug, Default)]
pub struct MockConnector {
    state: Mutex<State>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_list(&self, title: &str) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_list += 1;
        let id = format!("list-{}", state.next_list);
        state.lists.insert(
            id.clone(),
            MockList {
                title: title.to_string(),
                next_id: 1,
                ..Default::default()
            },
        );
        id
    }

    pub fn set_unique_field(&self, list_id: &str, field: &str) {
        let mut state = self.state.lock().unwrap();
        state.lists.get_mut(list_id).unwrap().unique_field = Some(field.to_string());
    }

    pub fn set_next_id(&self, list_id: &str, next_id: i64) {
        let mut state = self.state.lock().unwrap();
        state.lists.get_mut(list_id).unwrap().next_id = next_id;
    }

    /// Queries with this column in `$select` fail with a 400 naming it.
    pub fn reject_select_column(&self, list_id: &str, column: &str) {
        let mut state = self.state.lock().unwrap();
        state
            .lists
            .get_mut(list_id)
            .unwrap()
            .reject_select
            .push(column.to_string());
    }

    /// Every update on this list fails the ETag precondition.
    pub fn force_update_conflict(&self, list_id: &str, force: bool) {
        let mut state = self.state.lock().unwrap();
        state.lists.get_mut(list_id).unwrap().force_update_conflict = force;
    }

    pub fn seed_item(
        &self,
        list_id: &str,
        fields: Value,
        modified: Option<DateTime<Utc>>,
    ) -> i64 {
        let mut state = self.state.lock().unwrap();
        let list = state.lists.get_mut(list_id).unwrap();
        let id = list.next_id;
        list.next_id += 1;
        list.items.insert(
            id,
            MockItem {
                id,
                version: 1,
                modified: modified.unwrap_or_else(Utc::now),
                fields: fields.as_object().cloned().unwrap_or_default(),
            },
        );
        id
    }

    /// Server-side edit: merges fields, bumps the version, moves Modified.
    pub fn update_item(
        &self,
        list_id: &str,
        id: i64,
        fields: Value,
        modified: Option<DateTime<Utc>>,
    ) {
        let mut state = self.state.lock().unwrap();
        let item = state
            .lists
            .get_mut(list_id)
            .unwrap()
            .items
            .get_mut(&id)
            .unwrap();
        for (k, v) in fields.as_object().cloned().unwrap_or_default() {
            item.fields.insert(k, v);
        }
        item.version += 1;
        item.modified = modified.unwrap_or_else(Utc::now);
    }

    pub fn get_item_fields(&self, list_id: &str, id: i64) -> Option<Map<String, Value>> {
        let state = self.state.lock().unwrap();
        Some(state.lists.get(list_id)?.items.get(&id)?.fields.clone())
    }

    pub fn find_by_field(&self, list_id: &str, field: &str, wanted: &str) -> Option<i64> {
        let state = self.state.lock().unwrap();
        state
            .lists
            .get(list_id)?
            .items
            .values()
            .find(|item| {
                item.fields
                    .get(field)
                    .and_then(value::as_string)
                    .is_some_and(|v| v == wanted)
            })
            .map(|item| item.id)
    }

}

fn not_found(what: &str) -> RemoteError {
    RemoteError::new(404, "Not Found", what)
}

fn filter_matches(filter: Option<&str>, item: &MockItem) -> bool {
    let Some(filter) = filter else { return true };
    if let Some(rest) = filter.strip_prefix("Modified ge datetime'") {
        let Some(lit) = rest.strip_suffix('\'') else {
            return false;
        };
        return value::parse_iso8601(lit).is_some_and(|dt| item.modified >= dt);
    }
    if let Some((field, lit)) = filter.split_once(" eq ") {
        let lit = lit.trim();
        if let Some(inner) = lit
            .strip_prefix('\'')
            .and_then(|s| s.strip_suffix('\''))
        {
            let wanted = inner.replace("''", "'");
            return item
                .fields
                .get(field.trim())
                .and_then(value::as_string)
                .is_some_and(|v| v == wanted);
        }
    }
    false
}

#[async_trait]
impl RemoteConnector for MockConnector {
    async fn get_list_id_by_title(&self, title: &str) -> Result<String, RemoteError> {
        let state = self.state.lock().unwrap();
        state
            .lists
            .iter()
            .find(|(_, l)| l.title == title)
            .map(|(id, _)| id.clone())
            .ok_or_else(|| not_found(&format!("no list titled '{title}'")))
    }

    async fn query_list_items(
        &self,
        list_id: &str,
        query: &ItemQuery,
    ) -> Result<ItemPage, RemoteError> {
        let state = self.state.lock().unwrap();
        let list = state
            .lists
            .get(list_id)
            .ok_or_else(|| not_found(&format!("no list '{list_id}'")))?;

        for rejected in &list.reject_select {
            if query.select.iter().any(|c| c.eq_ignore_ascii_case(rejected)) {
                return Err(RemoteError::new(
                    400,
                    "Bad Request",
                    &format!("The field or property '{rejected}' does not exist"),
                ));
            }
        }

        let mut items: Vec<MockItem> = list
            .items
            .values()
            .filter(|item| filter_matches(query.filter.as_deref(), item))
            .cloned()
            .collect();

        match query.order_by.as_deref() {
            Some(order) if order.contains("Modified") => {
                items.sort_by_key(|i| (i.modified, i.id));
            }
            Some(order) if order.contains("Priority") => {
                items.sort_by_key(|i| {
                    i.fields.get("Priority").and_then(value::as_i64).unwrap_or(0)
                });
            }
            _ => items.sort_by_key(|i| i.id),
        }

        let offset: usize = query
            .next_page
            .as_deref()
            .and_then(|c| c.parse().ok())
            .unwrap_or(0);
        let page_size = query.top.map(|t| t as usize).unwrap_or(usize::MAX);
        let total = items.len();
        let page: Vec<ListItem> = items
            .into_iter()
            .skip(offset)
            .take(page_size)
            .map(|i| i.to_list_item())
            .collect();
        let consumed = offset + page.len();
        let next_page = (consumed < total).then(|| consumed.to_string());

        Ok(ItemPage {
            items: page,
            next_page,
        })
    }

    async fn get_list_item(
        &self,
        list_id: &str,
        id: i64,
        _select: &[String],
    ) -> Result<ListItem, RemoteError> {
        let state = self.state.lock().unwrap();
        state
            .lists
            .get(list_id)
            .ok_or_else(|| not_found(&format!("no list '{list_id}'")))?
            .items
            .get(&id)
            .map(|i| i.to_list_item())
            .ok_or_else(|| not_found(&format!("no item {id}")))
    }

    async fn create_list_item(
        &self,
        list_id: &str,
        fields: &Map<String, Value>,
    ) -> Result<i64, RemoteError> {
        let mut state = self.state.lock().unwrap();
        let list = state
            .lists
            .get_mut(list_id)
            .ok_or_else(|| not_found(&format!("no list '{list_id}'")))?;

        if let Some(unique) = list.unique_field.clone() {
            let wanted = fields.get(&unique).and_then(value::as_string);
            if let Some(wanted) = wanted {
                let exists = list.items.values().any(|item| {
                    item.fields
                        .get(&unique)
                        .and_then(value::as_string)
                        .is_some_and(|v| v == wanted)
                });
                if exists {
                    return Err(RemoteError::new(
                        409,
                        "Conflict",
                        &format!("duplicate value for unique field '{unique}'"),
                    ));
                }
            }
        }

        let id = list.next_id;
        list.next_id += 1;
        list.items.insert(
            id,
            MockItem {
                id,
                version: 1,
                modified: Utc::now(),
                fields: fields.clone(),
            },
        );
        Ok(id)
    }

    async fn update_list_item(
        &self,
        list_id: &str,
        id: i64,
        fields: &Map<String, Value>,
        if_match: &str,
    ) -> Result<(), RemoteError> {
        let mut state = self.state.lock().unwrap();
        let list = state
            .lists
            .get_mut(list_id)
            .ok_or_else(|| not_found(&format!("no list '{list_id}'")))?;
        if list.force_update_conflict {
            return Err(RemoteError::new(
                412,
                "Precondition Failed",
                "The ETag value does not match",
            ));
        }
        let item = list
            .items
            .get_mut(&id)
            .ok_or_else(|| not_found(&format!("no item {id}")))?;
        if if_match != "*" && if_match != item.etag() {
            return Err(RemoteError::new(
                412,
                "Precondition Failed",
                "The ETag value does not match",
            ));
        }
        for (k, v) in fields {
            item.fields.insert(k.clone(), v.clone());
        }
        item.version += 1;
        item.modified = Utc::now();
        Ok(())
    }
}
