use std::collections::HashMap;

use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

/// Entity type token for mirrored RAPTOR summaries.
pub const RAPTOR_SUMMARY_TYPE: &str = "RAPTOR_SUMMARY";
/// Entity type token for document-structure nodes derived from TOC entries.
pub const DOCUMENT_SECTION_TYPE: &str = "DOCUMENT_SECTION";

stored_object!(KnowledgeEntity, "knowledge_entity", {
    tenant_id: String,
    name: String,
    name_key: String,
    description: String,
    entity_type: String,
    source_id: Option<String>,
    section_ref: Option<String>
});

#[derive(Debug, Clone)]
pub struct ScoredEntity {
    pub entity: KnowledgeEntity,
    pub score: f32,
}

impl KnowledgeEntity {
    pub fn new(
        tenant_id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        entity_type: impl Into<String>,
        source_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        let name = name.into();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            tenant_id: tenant_id.into(),
            name_key: name.to_lowercase(),
            name,
            description: description.into(),
            entity_type: entity_type.into(),
            source_id,
            section_ref: None,
        }
    }

    /// Name given to a mirrored RAPTOR summary entity. The suffix keeps the
    /// per-tenant unique-name constraint from colliding with domain entities.
    pub fn summary_mirror_name(title: &str, summary_node_id: &str) -> String {
        format!("{title} [summary:{summary_node_id}]")
    }

    /// Deduplicating upsert keyed by `(tenant_id, lower(name))`.
    ///
    /// An existing entity keeps its identity; an empty description is filled
    /// in from the incoming extraction.
    pub async fn upsert_by_name(
        db: &SurrealDbClient,
        tenant_id: &str,
        name: &str,
        description: &str,
        entity_type: &str,
        source_id: Option<String>,
    ) -> Result<Self, AppError> {
        let name_key = name.to_lowercase();
        let mut response = db
            .query(
                "SELECT * FROM type::table($table) \
                 WHERE tenant_id = $tenant_id AND name_key = $name_key LIMIT 1",
            )
            .bind(("table", Self::table_name()))
            .bind(("tenant_id", tenant_id.to_owned()))
            .bind(("name_key", name_key))
            .await?;
        let existing: Vec<Self> = response.take(0)?;

        if let Some(mut entity) = existing.into_iter().next() {
            if entity.description.trim().is_empty() && !description.trim().is_empty() {
                entity.description = description.to_owned();
                entity.updated_at = Utc::now();
                let updated: Option<Self> = db
                    .update((Self::table_name(), entity.id.as_str()))
                    .content(entity.clone())
                    .await?;
                return Ok(updated.unwrap_or(entity));
            }
            return Ok(entity);
        }

        let entity = Self::new(tenant_id, name, description, entity_type, source_id);
        let stored = db.store_item(entity.clone()).await?;
        Ok(stored.unwrap_or(entity))
    }

    /// Persist or refresh the entity vector in the embedding side table.
    pub async fn store_embedding(
        db: &SurrealDbClient,
        entity_id: &str,
        tenant_id: &str,
        embedding: Vec<f32>,
    ) -> Result<(), AppError> {
        db.client
            .query(
                "UPSERT type::thing('knowledge_entity_embedding', $id) SET \
                    entity_id = type::thing('knowledge_entity', $id), \
                    tenant_id = $tenant_id, \
                    embedding = $embedding, \
                    created_at = IF created_at != NONE THEN created_at ELSE time::now() END, \
                    updated_at = time::now();",
            )
            .bind(("id", entity_id.to_owned()))
            .bind(("tenant_id", tenant_id.to_owned()))
            .bind(("embedding", embedding))
            .await?
            .check()?;
        Ok(())
    }

    /// Vector anchors for graph navigation.
    pub async fn match_by_vector(
        db: &SurrealDbClient,
        tenant_id: &str,
        query_embedding: Vec<f32>,
        match_threshold: f32,
        limit: usize,
        filter_node_types: Option<&[String]>,
    ) -> Result<Vec<ScoredEntity>, AppError> {
        #[derive(Deserialize)]
        struct Row {
            entity_id: KnowledgeEntity,
            score: f32,
        }

        let take = limit.max(1);
        let sql = format!(
            r#"
            SELECT
                entity_id,
                vector::similarity::cosine(embedding, $embedding) AS score
            FROM knowledge_entity_embedding
            WHERE tenant_id = $tenant_id
              AND embedding <|{take},40|> $embedding
            ORDER BY score DESC
            LIMIT {take}
            FETCH entity_id;
            "#,
        );

        let mut response = db
            .query(&sql)
            .bind(("embedding", query_embedding))
            .bind(("tenant_id", tenant_id.to_owned()))
            .await
            .map_err(|e| AppError::InternalError(format!("Surreal query failed: {e}")))?;

        let rows: Vec<Row> = response.take::<Vec<Row>>(0).unwrap_or_default();

        Ok(rows
            .into_iter()
            .filter(|row| row.score >= match_threshold)
            .filter(|row| {
                filter_node_types
                    .map(|types| {
                        types.is_empty()
                            || types
                                .iter()
                                .any(|t| t.eq_ignore_ascii_case(&row.entity_id.entity_type))
                    })
                    .unwrap_or(true)
            })
            .map(|row| ScoredEntity {
                entity: row.entity_id,
                score: row.score,
            })
            .collect())
    }

    pub async fn fetch_by_ids(
        ids: &[String],
        db: &SurrealDbClient,
    ) -> Result<Vec<Self>, AppError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let things: Vec<Thing> = ids
            .iter()
            .map(|id| Thing::from((Self::table_name(), id.as_str())))
            .collect();
        let mut response = db
            .query("SELECT * FROM type::table($table) WHERE id IN $things")
            .bind(("table", Self::table_name()))
            .bind(("things", things))
            .await?;
        let entities: Vec<Self> = response.take(0)?;

        let mut by_id: HashMap<String, Self> = entities
            .into_iter()
            .map(|entity| (entity.id.clone(), entity))
            .collect();
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    /// Entities for a tenant, used by the community rebuild sweep.
    pub async fn list_for_tenant(
        db: &SurrealDbClient,
        tenant_id: &str,
        limit: usize,
    ) -> Result<Vec<Self>, AppError> {
        let entities: Vec<Self> = db
            .query(
                "SELECT * FROM type::table($table) WHERE tenant_id = $tenant_id \
                 ORDER BY created_at ASC LIMIT $limit",
            )
            .bind(("table", Self::table_name()))
            .bind(("tenant_id", tenant_id.to_owned()))
            .bind(("limit", limit as i64))
            .await?
            .take(0)?;
        Ok(entities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::indexes::ensure_runtime_indexes;
    use uuid::Uuid;

    async fn setup_db() -> SurrealDbClient {
        let database = Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("entity_ns", &database)
            .await
            .expect("in-memory db");
        db.ensure_initialized().await.expect("schema");
        ensure_runtime_indexes(&db, 3).await.expect("runtime indexes");
        db
    }

    #[tokio::test]
    async fn upsert_dedupes_case_insensitively_per_tenant() {
        let db = setup_db().await;

        let first = KnowledgeEntity::upsert_by_name(
            &db,
            "t1",
            "Quality Policy",
            "Top-level commitment",
            "CONCEPT",
            Some("src1".into()),
        )
        .await
        .expect("create");

        let second = KnowledgeEntity::upsert_by_name(
            &db,
            "t1",
            "QUALITY POLICY",
            "duplicate spelling",
            "CONCEPT",
            Some("src2".into()),
        )
        .await
        .expect("dedupe");
        assert_eq!(second.id, first.id);

        let other_tenant = KnowledgeEntity::upsert_by_name(
            &db,
            "t2",
            "Quality Policy",
            "other tenant",
            "CONCEPT",
            None,
        )
        .await
        .expect("other tenant create");
        assert_ne!(other_tenant.id, first.id);
    }

    #[tokio::test]
    async fn upsert_fills_empty_description() {
        let db = setup_db().await;
        let created =
            KnowledgeEntity::upsert_by_name(&db, "t1", "Audit", "", "CONCEPT", None)
                .await
                .expect("create");
        assert!(created.description.is_empty());

        let refreshed = KnowledgeEntity::upsert_by_name(
            &db,
            "t1",
            "Audit",
            "Systematic, independent examination",
            "CONCEPT",
            None,
        )
        .await
        .expect("refresh");
        assert_eq!(refreshed.id, created.id);
        assert!(!refreshed.description.is_empty());
    }

    #[tokio::test]
    async fn match_by_vector_scopes_to_tenant_and_type() {
        let db = setup_db().await;

        let own = KnowledgeEntity::upsert_by_name(&db, "t1", "Welding", "", "CONCEPT", None)
            .await
            .expect("create");
        KnowledgeEntity::store_embedding(&db, &own.id, "t1", vec![1.0, 0.0, 0.0])
            .await
            .expect("embed");

        let foreign = KnowledgeEntity::upsert_by_name(&db, "t2", "Welding", "", "CONCEPT", None)
            .await
            .expect("create");
        KnowledgeEntity::store_embedding(&db, &foreign.id, "t2", vec![1.0, 0.0, 0.0])
            .await
            .expect("embed");

        let matches = KnowledgeEntity::match_by_vector(&db, "t1", vec![1.0, 0.0, 0.0], 0.2, 5, None)
            .await
            .expect("match");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].entity.id, own.id);

        let filtered = KnowledgeEntity::match_by_vector(
            &db,
            "t1",
            vec![1.0, 0.0, 0.0],
            0.2,
            5,
            Some(&["RAPTOR_SUMMARY".to_owned()]),
        )
        .await
        .expect("match");
        assert!(filtered.is_empty(), "type filter should exclude CONCEPT rows");
    }

    #[test]
    fn summary_mirror_name_is_suffixed() {
        let name = KnowledgeEntity::summary_mirror_name("Operations overview", "sn1");
        assert_eq!(name, "Operations overview [summary:sn1]");
    }
}
