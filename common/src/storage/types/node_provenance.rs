use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(NodeProvenance, "node_provenance", {
    entity_id: String,
    chunk_id: String,
    tenant_id: String
});

/// One `(entity → chunk)` lineage link, the bridge used for late grounding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvenanceLink {
    pub node_id: String,
    pub chunk_id: String,
}

impl NodeProvenance {
    pub fn new(
        entity_id: impl Into<String>,
        chunk_id: impl Into<String>,
        tenant_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            entity_id: entity_id.into(),
            chunk_id: chunk_id.into(),
            tenant_id: tenant_id.into(),
        }
    }

    /// Idempotent link insert.
    pub async fn link(
        db: &SurrealDbClient,
        entity_id: &str,
        chunk_id: &str,
        tenant_id: &str,
    ) -> Result<(), AppError> {
        let mut response = db
            .query(
                "SELECT id FROM type::table($table) \
                 WHERE entity_id = $entity_id AND chunk_id = $chunk_id LIMIT 1",
            )
            .bind(("table", Self::table_name()))
            .bind(("entity_id", entity_id.to_owned()))
            .bind(("chunk_id", chunk_id.to_owned()))
            .await?;
        let existing: Vec<serde_json::Value> = response.take(0)?;
        if !existing.is_empty() {
            return Ok(());
        }

        db.store_item(Self::new(entity_id, chunk_id, tenant_id)).await?;
        Ok(())
    }

    /// Resolve entities to their chunk lineage. Entities with no links are
    /// simply absent from the result.
    pub async fn resolve_chunk_ids(
        db: &SurrealDbClient,
        entity_ids: &[String],
    ) -> Result<Vec<ProvenanceLink>, AppError> {
        if entity_ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows: Vec<Self> = db
            .query("SELECT * FROM type::table($table) WHERE entity_id IN $entity_ids")
            .bind(("table", Self::table_name()))
            .bind(("entity_ids", entity_ids.to_vec()))
            .await?
            .take(0)?;

        Ok(rows
            .into_iter()
            .map(|row| ProvenanceLink {
                node_id: row.entity_id,
                chunk_id: row.chunk_id,
            })
            .collect())
    }

    /// Entities that lost every provenance link (candidates for the orphan
    /// sweep after a cascade delete).
    pub async fn delete_by_chunk_ids(
        db: &SurrealDbClient,
        chunk_ids: &[String],
    ) -> Result<(), AppError> {
        if chunk_ids.is_empty() {
            return Ok(());
        }
        db.query("DELETE type::table($table) WHERE chunk_id IN $chunk_ids")
            .bind(("table", Self::table_name()))
            .bind(("chunk_ids", chunk_ids.to_vec()))
            .await?
            .check()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    async fn setup_db() -> SurrealDbClient {
        let database = Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("provenance_ns", &database)
            .await
            .expect("in-memory db");
        db.ensure_initialized().await.expect("schema");
        db
    }

    #[tokio::test]
    async fn link_is_idempotent_and_resolves() {
        let db = setup_db().await;

        NodeProvenance::link(&db, "e1", "c1", "t1").await.expect("link");
        NodeProvenance::link(&db, "e1", "c1", "t1").await.expect("duplicate link");
        NodeProvenance::link(&db, "e1", "c2", "t1").await.expect("second chunk");

        let links = NodeProvenance::resolve_chunk_ids(&db, &["e1".to_owned(), "e2".to_owned()])
            .await
            .expect("resolve");

        assert_eq!(links.len(), 2, "duplicate link must not create a second row");
        assert!(links.iter().all(|link| link.node_id == "e1"));
        assert!(!links.iter().any(|link| link.node_id == "e2"), "e2 has no lineage");
    }

    #[tokio::test]
    async fn resolve_with_no_ids_is_empty() {
        let db = setup_db().await;
        let links = NodeProvenance::resolve_chunk_ids(&db, &[]).await.expect("resolve");
        assert!(links.is_empty());
    }
}
