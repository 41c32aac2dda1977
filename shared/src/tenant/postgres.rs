//! PostgreSQL storage.
//!
//! Each collection is a table of `(id, organization_id, doc jsonb, created_at)`;
//! messages hang off conversations by foreign key (see
//! `migrations/0001_chat_gateway.sql`). Ownership is always part of the
//! `WHERE` clause of the statement doing the work.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use super::store::{Collection, StoredMessage, StoredRow, TenantStore};
use crate::Result;

type RowTuple = (Uuid, Uuid, Json<Map<String, Value>>, DateTime<Utc>);
type MessageTuple = (Uuid, Uuid, Json<Map<String, Value>>, DateTime<Utc>);

fn row((id, organization_id, doc, created_at): RowTuple) -> StoredRow {
    StoredRow {
        id,
        organization_id,
        doc: doc.0,
        created_at,
    }
}

fn message((id, conversation_id, doc, created_at): MessageTuple) -> StoredMessage {
    StoredMessage {
        id,
        conversation_id,
        doc: doc.0,
        created_at,
    }
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TenantStore for PgStore {
    async fn insert(
        &self,
        collection: Collection,
        organization_id: Uuid,
        doc: Map<String, Value>,
    ) -> Result<StoredRow> {
        let sql = format!(
            r#"
            INSERT INTO {} (id, organization_id, doc, created_at)
            VALUES ($1, $2, $3, NOW())
            RETURNING id, organization_id, doc, created_at
            "#,
            collection.table()
        );

        let inserted: RowTuple = sqlx::query_as(&sql)
            .bind(Uuid::new_v4())
            .bind(organization_id)
            .bind(Json(doc))
            .fetch_one(&self.pool)
            .await?;

        Ok(row(inserted))
    }

    async fn fetch_owned(
        &self,
        collection: Collection,
        id: Uuid,
        organization_id: Uuid,
    ) -> Result<Option<StoredRow>> {
        let sql = format!(
            r#"
            SELECT id, organization_id, doc, created_at
            FROM {}
            WHERE id = $1 AND organization_id = $2
            "#,
            collection.table()
        );

        let found: Option<RowTuple> = sqlx::query_as(&sql)
            .bind(id)
            .bind(organization_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(found.map(row))
    }

    async fn list_owned(
        &self,
        collection: Collection,
        organization_id: Uuid,
        filter: &Map<String, Value>,
    ) -> Result<Vec<StoredRow>> {
        let sql = format!(
            r#"
            SELECT id, organization_id, doc, created_at
            FROM {}
            WHERE organization_id = $1 AND doc @> $2
            ORDER BY created_at ASC
            "#,
            collection.table()
        );

        let rows: Vec<RowTuple> = sqlx::query_as(&sql)
            .bind(organization_id)
            .bind(Json(filter))
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(row).collect())
    }

    async fn update_owned(
        &self,
        collection: Collection,
        id: Uuid,
        organization_id: Uuid,
        patch: Map<String, Value>,
        check: &(dyn for<'r> Fn(&'r StoredRow) -> Result<()> + Send + Sync),
    ) -> Result<Option<StoredRow>> {
        let sql = format!(
            r#"
            UPDATE {}
            SET doc = doc || $3
            WHERE id = $1 AND organization_id = $2
            RETURNING id, organization_id, doc, created_at
            "#,
            collection.table()
        );

        let mut tx = self.pool.begin().await?;

        let updated: Option<RowTuple> = sqlx::query_as(&sql)
            .bind(id)
            .bind(organization_id)
            .bind(Json(patch))
            .fetch_optional(&mut *tx)
            .await?;

        // Returning early drops `tx`, which rolls the update back.
        let Some(updated) = updated.map(row) else {
            return Ok(None);
        };
        check(&updated)?;

        tx.commit().await?;
        Ok(Some(updated))
    }

    async fn delete_owned(&self, collection: Collection, id: Uuid, organization_id: Uuid) -> Result<bool> {
        let sql = format!(
            "DELETE FROM {} WHERE id = $1 AND organization_id = $2",
            collection.table()
        );

        let result = sqlx::query(&sql)
            .bind(id)
            .bind(organization_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn owner_of(&self, collection: Collection, id: Uuid) -> Result<Option<Uuid>> {
        let sql = format!("SELECT organization_id FROM {} WHERE id = $1", collection.table());

        let owner: Option<Uuid> = sqlx::query_scalar(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(owner)
    }

    async fn insert_message_owned(
        &self,
        conversation_id: Uuid,
        organization_id: Uuid,
        doc: Map<String, Value>,
    ) -> Result<Option<StoredMessage>> {
        let inserted: Option<MessageTuple> = sqlx::query_as(
            r#"
            INSERT INTO messages (id, conversation_id, doc, created_at)
            SELECT $1, c.id, $3, NOW()
            FROM conversations c
            WHERE c.id = $2 AND c.organization_id = $4
            RETURNING id, conversation_id, doc, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(conversation_id)
        .bind(Json(doc))
        .bind(organization_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(inserted.map(message))
    }

    async fn list_messages(&self, conversation_id: Uuid) -> Result<Vec<StoredMessage>> {
        let rows: Vec<MessageTuple> = sqlx::query_as(
            r#"
            SELECT id, conversation_id, doc, created_at
            FROM messages
            WHERE conversation_id = $1
            ORDER BY seq ASC
            "#,
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(message).collect())
    }
}
