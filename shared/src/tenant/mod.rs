//! Tenant-scoped data access.
//!
//! A [`TenantMediator`] is built per request from the caller's
//! [`TenantContext`] and an injected [`TenantStore`]. It is the only path to
//! organization-owned rows: every read and write carries the context's
//! organization as a storage-level condition, so a row owned by another
//! organization is indistinguishable from one that does not exist.

mod memory;
mod postgres;
mod store;

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use store::{Collection, StoredMessage, StoredRow, TenantStore};

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, warn, Span};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::models::{Conversation, Group, Message, ModelConfig, NewMessage, TenantContext};
use crate::tee::MessageSink;
use crate::{Error, Result};

/// Attributes callers may never set; the mediator owns them.
const RESERVED_KEYS: &[&str] = &[
    "id",
    "organizationId",
    "organization_id",
    "createdAt",
    "created_at",
];

/// A record type stored in an organization-owned collection.
pub trait TenantRecord: DeserializeOwned + Send {
    const COLLECTION: Collection;

    /// Rules serde cannot express. Runs before any write is committed.
    fn check(&self) -> Result<()> {
        Ok(())
    }
}

impl TenantRecord for Conversation {
    const COLLECTION: Collection = Collection::Conversations;
}

impl TenantRecord for ModelConfig {
    const COLLECTION: Collection = Collection::Models;

    fn check(&self) -> Result<()> {
        self.validate()
    }
}

impl TenantRecord for Group {
    const COLLECTION: Collection = Collection::Groups;
}

pub struct TenantMediator {
    context: TenantContext,
    store: Arc<dyn TenantStore>,
    cancel: CancelToken,
    span: Span,
}

impl TenantMediator {
    pub fn new(context: TenantContext, store: Arc<dyn TenantStore>) -> Self {
        let span = tracing::info_span!(
            "tenant_mediator",
            actor_id = %context.actor_id,
            session_id = %context.session_id,
        );
        Self {
            context,
            store,
            cancel: CancelToken::new(),
            span,
        }
    }

    /// Abort in-flight operations with `Error::Cancelled` once `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Same scope, independent of this request's cancellation. For work that
    /// must finish after the caller has gone, such as persisting the
    /// assistant message.
    pub fn detached(&self) -> Self {
        Self {
            context: self.context.clone(),
            store: Arc::clone(&self.store),
            cancel: CancelToken::new(),
            span: self.span.clone(),
        }
    }

    pub fn context(&self) -> &TenantContext {
        &self.context
    }

    pub fn conversations(&self) -> Scoped<'_, Conversation> {
        Scoped::new(self)
    }

    pub fn models(&self) -> Scoped<'_, ModelConfig> {
        Scoped::new(self)
    }

    pub fn groups(&self) -> Scoped<'_, Group> {
        Scoped::new(self)
    }

    pub fn messages(&self) -> Messages<'_> {
        Messages { mediator: self }
    }

    fn organization(&self, operation: &str, label: &str) -> Result<Uuid> {
        self.context.organization_id.ok_or_else(|| {
            warn!(
                parent: &self.span,
                operation,
                resource = label,
                "Organization-scoped operation without an organization"
            );
            Error::TenantAccessViolation(format!("{} {} requires an organization", operation, label))
        })
    }

    async fn guarded<T>(&self, operation: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            result = operation => result,
        }
    }

    /// Build the not-found error for a denied access, logging the attempt on
    /// the `security` target if the row exists under another organization.
    async fn deny(&self, collection: Collection, id: Uuid, operation: &str) -> Error {
        let owner = match self.guarded(self.store.owner_of(collection, id)).await {
            Ok(owner) => owner,
            Err(e) => {
                debug!(parent: &self.span, error = %e, "Owner lookup failed");
                None
            }
        };

        if let Some(owner) = owner.filter(|owner| Some(*owner) != self.context.organization_id) {
            warn!(
                target: "security",
                parent: &self.span,
                actor_id = %self.context.actor_id,
                session_id = %self.context.session_id,
                organization_id = ?self.context.organization_id,
                owner_organization_id = %owner,
                resource = collection.label(),
                requested_id = %id,
                operation,
                "Cross-tenant access denied"
            );
        }

        Error::TenantResourceNotFound(format!("{} {}", collection.label(), id))
    }
}

#[async_trait]
impl MessageSink for TenantMediator {
    async fn persist_message(&self, conversation_id: Uuid, message: NewMessage) -> Result<Message> {
        self.messages().create(conversation_id, message).await
    }
}

/// Strip mediator-owned keys from caller attributes.
fn caller_attributes(attrs: Value) -> Result<Map<String, Value>> {
    let Value::Object(mut attrs) = attrs else {
        return Err(Error::Validation("Attributes must be a JSON object".to_string()));
    };
    for key in RESERVED_KEYS {
        attrs.remove(*key);
    }
    Ok(attrs)
}

/// Decode and check a row about to be written. Failures are the caller's fault.
fn admit<T: TenantRecord>(row: &StoredRow) -> Result<T> {
    let record: T = serde_json::from_value(row.clone().into_value())
        .map_err(|e| Error::Validation(format!("Invalid {}: {}", T::COLLECTION.label(), e)))?;
    record.check()?;
    Ok(record)
}

fn decode<T: DeserializeOwned>(row: StoredRow, label: &str) -> Result<T> {
    serde_json::from_value(row.into_value())
        .map_err(|e| Error::Internal(format!("Stored {} is malformed: {}", label, e)))
}

/// One organization-owned collection, viewed through the mediator.
pub struct Scoped<'a, T> {
    mediator: &'a TenantMediator,
    _record: PhantomData<fn() -> T>,
}

impl<'a, T: TenantRecord> Scoped<'a, T> {
    fn new(mediator: &'a TenantMediator) -> Self {
        Self {
            mediator,
            _record: PhantomData,
        }
    }

    /// Create a record owned by the context organization. Any caller-supplied
    /// organization is discarded.
    pub async fn create(&self, attrs: Value) -> Result<T> {
        let label = T::COLLECTION.label();
        let organization_id = self.mediator.organization("create", label)?;
        let doc = caller_attributes(attrs)?;

        // Reject attributes that would not decode before writing anything.
        admit::<T>(&StoredRow {
            id: Uuid::nil(),
            organization_id,
            doc: doc.clone(),
            created_at: Utc::now(),
        })?;

        let row = self
            .mediator
            .guarded(self.mediator.store.insert(T::COLLECTION, organization_id, doc))
            .await?;
        debug!(parent: &self.mediator.span, resource = label, id = %row.id, "Created record");
        decode(row, label)
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<T> {
        let label = T::COLLECTION.label();
        let Some(organization_id) = self.mediator.context.organization_id else {
            return Err(self.mediator.deny(T::COLLECTION, id, "read").await);
        };

        match self
            .mediator
            .guarded(self.mediator.store.fetch_owned(T::COLLECTION, id, organization_id))
            .await?
        {
            Some(row) => decode(row, label),
            None => Err(self.mediator.deny(T::COLLECTION, id, "read").await),
        }
    }

    /// Records of the context organization, optionally narrowed by a JSON
    /// containment filter. The organization condition is always applied.
    pub async fn find_many(&self, filter: Option<Value>) -> Result<Vec<T>> {
        let label = T::COLLECTION.label();
        let organization_id = self.mediator.organization("list", label)?;
        let filter = match filter {
            Some(filter) => caller_attributes(filter)?,
            None => Map::new(),
        };

        self.mediator
            .guarded(self.mediator.store.list_owned(T::COLLECTION, organization_id, &filter))
            .await?
            .into_iter()
            .map(|row| decode(row, label))
            .collect()
    }

    /// Merge `attrs` into an owned record. The ownership check and the write
    /// are one conditioned statement.
    ///
    /// The merged record must still decode and pass its checks; otherwise
    /// nothing is written and the error is `Validation`.
    pub async fn update(&self, id: Uuid, attrs: Value) -> Result<T> {
        let label = T::COLLECTION.label();
        let Some(organization_id) = self.mediator.context.organization_id else {
            return Err(self.mediator.deny(T::COLLECTION, id, "update").await);
        };
        let patch = caller_attributes(attrs)?;
        let check = |row: &StoredRow| admit::<T>(row).map(|_| ());

        match self
            .mediator
            .guarded(
                self.mediator
                    .store
                    .update_owned(T::COLLECTION, id, organization_id, patch, &check),
            )
            .await?
        {
            Some(row) => decode(row, label),
            None => Err(self.mediator.deny(T::COLLECTION, id, "update").await),
        }
    }

    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let Some(organization_id) = self.mediator.context.organization_id else {
            return Err(self.mediator.deny(T::COLLECTION, id, "delete").await);
        };

        if self
            .mediator
            .guarded(self.mediator.store.delete_owned(T::COLLECTION, id, organization_id))
            .await?
        {
            Ok(())
        } else {
            Err(self.mediator.deny(T::COLLECTION, id, "delete").await)
        }
    }
}

/// Messages, reached only through a conversation of the context organization.
pub struct Messages<'a> {
    mediator: &'a TenantMediator,
}

impl Messages<'_> {
    pub async fn find_by_conversation(&self, conversation_id: Uuid) -> Result<Vec<Message>> {
        self.mediator.conversations().find_by_id(conversation_id).await?;

        self.mediator
            .guarded(self.mediator.store.list_messages(conversation_id))
            .await?
            .into_iter()
            .map(|stored| {
                serde_json::from_value(stored.into_value())
                    .map_err(|e| Error::Internal(format!("Stored message is malformed: {}", e)))
            })
            .collect()
    }

    /// Insert a message; succeeds only if the conversation is owned by the
    /// context organization.
    pub async fn create(&self, conversation_id: Uuid, message: NewMessage) -> Result<Message> {
        let organization_id = self.mediator.organization("create", "message")?;
        let Value::Object(doc) = serde_json::to_value(&message)? else {
            return Err(Error::Internal("Message did not serialize to an object".to_string()));
        };

        match self
            .mediator
            .guarded(self.mediator.store.insert_message_owned(conversation_id, organization_id, doc))
            .await?
        {
            Some(stored) => serde_json::from_value(stored.into_value())
                .map_err(|e| Error::Internal(format!("Stored message is malformed: {}", e))),
            None => Err(self.mediator.deny(Collection::Conversations, conversation_id, "create message").await),
        }
    }
}
