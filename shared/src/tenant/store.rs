//! Storage contract behind the tenant mediator.
//!
//! Every method that touches an organization-owned row takes the
//! organization as part of its condition. Implementations must apply that
//! condition in the same statement as the read or write.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::Result;

/// An organization-owned collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Conversations,
    Models,
    Groups,
}

impl Collection {
    pub const fn table(&self) -> &'static str {
        match self {
            Collection::Conversations => "conversations",
            Collection::Models => "model_configs",
            Collection::Groups => "groups",
        }
    }

    /// Singular name used in errors and logs.
    pub const fn label(&self) -> &'static str {
        match self {
            Collection::Conversations => "conversation",
            Collection::Models => "model",
            Collection::Groups => "group",
        }
    }
}

/// One stored row: fixed columns plus the record's attributes as a document.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub doc: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl StoredRow {
    /// The record as JSON, with the fixed columns overriding the document.
    pub fn into_value(self) -> Value {
        let mut doc = self.doc;
        doc.insert("id".to_string(), Value::String(self.id.to_string()));
        doc.insert(
            "organizationId".to_string(),
            Value::String(self.organization_id.to_string()),
        );
        doc.insert("createdAt".to_string(), Value::String(self.created_at.to_rfc3339()));
        Value::Object(doc)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub doc: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    pub fn into_value(self) -> Value {
        let mut doc = self.doc;
        doc.insert("id".to_string(), Value::String(self.id.to_string()));
        doc.insert(
            "conversationId".to_string(),
            Value::String(self.conversation_id.to_string()),
        );
        doc.insert("createdAt".to_string(), Value::String(self.created_at.to_rfc3339()));
        Value::Object(doc)
    }
}

#[async_trait]
pub trait TenantStore: Send + Sync {
    async fn insert(
        &self,
        collection: Collection,
        organization_id: Uuid,
        doc: Map<String, Value>,
    ) -> Result<StoredRow>;

    async fn fetch_owned(
        &self,
        collection: Collection,
        id: Uuid,
        organization_id: Uuid,
    ) -> Result<Option<StoredRow>>;

    /// Rows of the organization whose document contains `filter`, oldest first.
    async fn list_owned(
        &self,
        collection: Collection,
        organization_id: Uuid,
        filter: &Map<String, Value>,
    ) -> Result<Vec<StoredRow>>;

    /// Shallow-merge `patch` into the document. `None` when no owned row matched.
    ///
    /// `check` sees the merged row before it is committed; an error from it
    /// leaves the stored row untouched and is returned as is.
    async fn update_owned(
        &self,
        collection: Collection,
        id: Uuid,
        organization_id: Uuid,
        patch: Map<String, Value>,
        check: &(dyn for<'r> Fn(&'r StoredRow) -> Result<()> + Send + Sync),
    ) -> Result<Option<StoredRow>>;

    /// `false` when no owned row matched.
    async fn delete_owned(&self, collection: Collection, id: Uuid, organization_id: Uuid) -> Result<bool>;

    /// Owner lookup for security logging only. Never use for authorization.
    async fn owner_of(&self, collection: Collection, id: Uuid) -> Result<Option<Uuid>>;

    /// Insert a message only if its conversation belongs to the organization.
    async fn insert_message_owned(
        &self,
        conversation_id: Uuid,
        organization_id: Uuid,
        doc: Map<String, Value>,
    ) -> Result<Option<StoredMessage>>;

    /// Messages of a conversation in creation order. Callers check ownership
    /// of the conversation first.
    async fn list_messages(&self, conversation_id: Uuid) -> Result<Vec<StoredMessage>>;
}
