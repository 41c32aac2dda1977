//! In-process storage with the same conditioned semantics as [`PgStore`].
//!
//! Used by tests and local runs.
//!
//! [`PgStore`]: super::PgStore

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::store::{Collection, StoredMessage, StoredRow, TenantStore};
use crate::{Error, Result};

#[derive(Debug, Default)]
struct State {
    rows: HashMap<Collection, Vec<StoredRow>>,
    messages: Vec<StoredMessage>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| Error::Internal("memory store lock poisoned".to_string()))
    }
}

/// JSONB `@>` for the shapes filters use: every filter key must be present
/// and contain the filter value.
fn contains(doc: &Value, filter: &Value) -> bool {
    match (doc, filter) {
        (Value::Object(doc), Value::Object(filter)) => filter
            .iter()
            .all(|(key, wanted)| doc.get(key).is_some_and(|have| contains(have, wanted))),
        (Value::Array(doc), Value::Array(filter)) => filter
            .iter()
            .all(|wanted| doc.iter().any(|have| contains(have, wanted))),
        (doc, filter) => doc == filter,
    }
}

#[async_trait]
impl TenantStore for MemoryStore {
    async fn insert(
        &self,
        collection: Collection,
        organization_id: Uuid,
        doc: Map<String, Value>,
    ) -> Result<StoredRow> {
        let row = StoredRow {
            id: Uuid::new_v4(),
            organization_id,
            doc,
            created_at: Utc::now(),
        };
        self.lock()?
            .rows
            .entry(collection)
            .or_default()
            .push(row.clone());
        Ok(row)
    }

    async fn fetch_owned(
        &self,
        collection: Collection,
        id: Uuid,
        organization_id: Uuid,
    ) -> Result<Option<StoredRow>> {
        Ok(self
            .lock()?
            .rows
            .get(&collection)
            .and_then(|rows| {
                rows.iter()
                    .find(|r| r.id == id && r.organization_id == organization_id)
            })
            .cloned())
    }

    async fn list_owned(
        &self,
        collection: Collection,
        organization_id: Uuid,
        filter: &Map<String, Value>,
    ) -> Result<Vec<StoredRow>> {
        let filter = Value::Object(filter.clone());
        Ok(self
            .lock()?
            .rows
            .get(&collection)
            .map(|rows| {
                rows.iter()
                    .filter(|r| r.organization_id == organization_id)
                    .filter(|r| contains(&Value::Object(r.doc.clone()), &filter))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn update_owned(
        &self,
        collection: Collection,
        id: Uuid,
        organization_id: Uuid,
        patch: Map<String, Value>,
        check: &(dyn for<'r> Fn(&'r StoredRow) -> Result<()> + Send + Sync),
    ) -> Result<Option<StoredRow>> {
        let mut state = self.lock()?;
        let Some(row) = state
            .rows
            .get_mut(&collection)
            .and_then(|rows| {
                rows.iter_mut()
                    .find(|r| r.id == id && r.organization_id == organization_id)
            })
        else {
            return Ok(None);
        };

        let mut merged = row.clone();
        merged.doc.extend(patch);
        check(&merged)?;

        *row = merged.clone();
        Ok(Some(merged))
    }

    async fn delete_owned(&self, collection: Collection, id: Uuid, organization_id: Uuid) -> Result<bool> {
        let mut state = self.lock()?;
        let Some(rows) = state.rows.get_mut(&collection) else {
            return Ok(false);
        };

        let before = rows.len();
        rows.retain(|r| !(r.id == id && r.organization_id == organization_id));
        let deleted = rows.len() < before;

        if deleted && collection == Collection::Conversations {
            state.messages.retain(|m| m.conversation_id != id);
        }
        Ok(deleted)
    }

    async fn owner_of(&self, collection: Collection, id: Uuid) -> Result<Option<Uuid>> {
        Ok(self
            .lock()?
            .rows
            .get(&collection)
            .and_then(|rows| rows.iter().find(|r| r.id == id))
            .map(|r| r.organization_id))
    }

    async fn insert_message_owned(
        &self,
        conversation_id: Uuid,
        organization_id: Uuid,
        doc: Map<String, Value>,
    ) -> Result<Option<StoredMessage>> {
        let mut state = self.lock()?;
        let owned = state
            .rows
            .get(&Collection::Conversations)
            .is_some_and(|rows| {
                rows.iter()
                    .any(|r| r.id == conversation_id && r.organization_id == organization_id)
            });
        if !owned {
            return Ok(None);
        }

        let message = StoredMessage {
            id: Uuid::new_v4(),
            conversation_id,
            doc,
            created_at: Utc::now(),
        };
        state.messages.push(message.clone());
        Ok(Some(message))
    }

    async fn list_messages(&self, conversation_id: Uuid) -> Result<Vec<StoredMessage>> {
        Ok(self
            .lock()?
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect())
    }
}
