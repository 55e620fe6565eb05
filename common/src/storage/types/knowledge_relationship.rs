use serde::{Deserialize, Serialize};

use crate::{error::AppError, storage::db::SurrealDbClient};

use super::source_document::deserialize_flexible_id;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelationshipMetadata {
    pub tenant_id: String,
    pub source_id: String,
    pub relation_type: String,
}

/// Graph edge between two knowledge entities, stored in the `relates_to`
/// edge table. Uniqueness is `(in, out, relation_type)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KnowledgeRelationship {
    #[serde(rename = "in", deserialize_with = "deserialize_flexible_id")]
    pub in_: String,
    #[serde(rename = "out", deserialize_with = "deserialize_flexible_id")]
    pub out: String,
    pub metadata: RelationshipMetadata,
}

impl KnowledgeRelationship {
    pub fn new(
        in_: impl Into<String>,
        out: impl Into<String>,
        tenant_id: impl Into<String>,
        source_id: impl Into<String>,
        relation_type: impl Into<String>,
    ) -> Self {
        Self {
            in_: in_.into(),
            out: out.into(),
            metadata: RelationshipMetadata {
                tenant_id: tenant_id.into(),
                source_id: source_id.into(),
                relation_type: relation_type.into(),
            },
        }
    }

    /// Idempotent edge upsert keyed `(in, out, relation_type)`.
    pub async fn upsert(&self, db: &SurrealDbClient) -> Result<bool, AppError> {
        let mut existing = db
            .query(
                "SELECT * FROM relates_to \
                 WHERE in = type::thing('knowledge_entity', $in_id) \
                   AND out = type::thing('knowledge_entity', $out_id) \
                   AND metadata.relation_type = $relation_type",
            )
            .bind(("in_id", self.in_.clone()))
            .bind(("out_id", self.out.clone()))
            .bind(("relation_type", self.metadata.relation_type.clone()))
            .await?;
        let rows: Vec<Self> = existing.take(0)?;
        if !rows.is_empty() {
            return Ok(false);
        }

        db.query(
            "RELATE (type::thing('knowledge_entity', $in_id)) \
               -> relates_to \
               -> (type::thing('knowledge_entity', $out_id)) \
             SET metadata = $metadata, created_at = time::now()",
        )
        .bind(("in_id", self.in_.clone()))
        .bind(("out_id", self.out.clone()))
        .bind(("metadata", self.metadata.clone()))
        .await?
        .check()?;

        Ok(true)
    }

    /// All edges touching any of the given entities, tenant-scoped, with an
    /// optional relation-type filter.
    pub async fn edges_for_entities(
        db: &SurrealDbClient,
        tenant_id: &str,
        entity_ids: &[String],
        filter_relation_types: Option<&[String]>,
    ) -> Result<Vec<Self>, AppError> {
        if entity_ids.is_empty() {
            return Ok(Vec::new());
        }

        let things: Vec<surrealdb::sql::Thing> = entity_ids
            .iter()
            .map(|id| surrealdb::sql::Thing::from(("knowledge_entity", id.as_str())))
            .collect();

        let mut response = db
            .query(
                "SELECT * FROM relates_to \
                 WHERE metadata.tenant_id = $tenant_id \
                   AND (in IN $things OR out IN $things)",
            )
            .bind(("tenant_id", tenant_id.to_owned()))
            .bind(("things", things))
            .await?;
        let edges: Vec<Self> = response.take(0)?;

        Ok(match filter_relation_types {
            Some(types) if !types.is_empty() => edges
                .into_iter()
                .filter(|edge| {
                    types
                        .iter()
                        .any(|t| t.eq_ignore_ascii_case(&edge.metadata.relation_type))
                })
                .collect(),
            _ => edges,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::knowledge_entity::KnowledgeEntity;
    use uuid::Uuid;

    async fn setup_db() -> SurrealDbClient {
        let database = Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("relationship_ns", &database)
            .await
            .expect("in-memory db");
        db.ensure_initialized().await.expect("schema");
        db
    }

    async fn seed_entity(db: &SurrealDbClient, tenant: &str, name: &str) -> KnowledgeEntity {
        KnowledgeEntity::upsert_by_name(db, tenant, name, "", "CONCEPT", None)
            .await
            .expect("entity")
    }

    #[tokio::test]
    async fn upsert_is_idempotent_per_triple() {
        let db = setup_db().await;
        let a = seed_entity(&db, "t1", "Process").await;
        let b = seed_entity(&db, "t1", "Output").await;

        let edge = KnowledgeRelationship::new(&a.id, &b.id, "t1", "src1", "PRODUCES");
        assert!(edge.upsert(&db).await.expect("first upsert"));
        assert!(!edge.upsert(&db).await.expect("second upsert"), "duplicate edge skipped");

        // A different relation type between the same pair is a new edge.
        let other = KnowledgeRelationship::new(&a.id, &b.id, "t1", "src1", "REQUIRES");
        assert!(other.upsert(&db).await.expect("other type"));

        let edges = KnowledgeRelationship::edges_for_entities(&db, "t1", &[a.id.clone()], None)
            .await
            .expect("edges");
        assert_eq!(edges.len(), 2);
    }

    #[tokio::test]
    async fn edges_respect_tenant_and_relation_filter() {
        let db = setup_db().await;
        let a = seed_entity(&db, "t1", "Risk").await;
        let b = seed_entity(&db, "t1", "Control").await;

        KnowledgeRelationship::new(&a.id, &b.id, "t1", "src1", "MITIGATED_BY")
            .upsert(&db)
            .await
            .expect("edge");

        let other_tenant =
            KnowledgeRelationship::edges_for_entities(&db, "t2", &[a.id.clone()], None)
                .await
                .expect("edges");
        assert!(other_tenant.is_empty());

        let filtered = KnowledgeRelationship::edges_for_entities(
            &db,
            "t1",
            &[a.id.clone()],
            Some(&["SUMMARIZES".to_owned()]),
        )
        .await
        .expect("edges");
        assert!(filtered.is_empty());

        let matched = KnowledgeRelationship::edges_for_entities(
            &db,
            "t1",
            &[a.id.clone()],
            Some(&["mitigated_by".to_owned()]),
        )
        .await
        .expect("edges");
        assert_eq!(matched.len(), 1);
    }
}
