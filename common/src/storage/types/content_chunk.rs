use std::collections::HashMap;

use crate::{
    error::AppError,
    storage::db::SurrealDbClient,
    stored_object,
    utils::{authority::AuthorityLevel, embedding::EmbeddingProfile},
};
use uuid::Uuid;

/// Structural role of a chunk. Only `normative_body` rows are
/// retrieval-eligible; toc/frontmatter rows exist for the structure graph.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChunkRole {
    Toc,
    Frontmatter,
    NormativeBody,
}

stored_object!(ContentChunk, "content_chunk", {
    source_id: String,
    tenant_id: String,
    collection_id: Option<String>,
    content: String,
    chunk_index: u32,
    file_page_number: Option<u32>,
    chunk_role: ChunkRole,
    heading_path: Vec<String>,
    retrieval_eligible: bool,
    source_standard: Option<String>,
    clause_id: Option<String>,
    authority_level: AuthorityLevel,
    embedding_profile: Option<EmbeddingProfile>,
    is_global: bool,
    metadata: serde_json::Value
});

/// Scope filters shared by the vector and FTS legs of the hybrid primitive.
#[derive(Debug, Clone, Default)]
pub struct ChunkSearchFilter {
    pub tenant_id: String,
    pub include_global: bool,
    pub collection_id: Option<String>,
    pub source_standard: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: ContentChunk,
    pub score: f32,
}

impl ContentChunk {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source_id: impl Into<String>,
        tenant_id: impl Into<String>,
        content: impl Into<String>,
        chunk_index: u32,
        chunk_role: ChunkRole,
        heading_path: Vec<String>,
        authority_level: AuthorityLevel,
    ) -> Self {
        let now = Utc::now();
        let role = chunk_role;
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            source_id: source_id.into(),
            tenant_id: tenant_id.into(),
            collection_id: None,
            content: content.into(),
            chunk_index,
            file_page_number: None,
            chunk_role: role,
            heading_path,
            retrieval_eligible: role == ChunkRole::NormativeBody,
            source_standard: None,
            clause_id: None,
            authority_level,
            embedding_profile: None,
            is_global: false,
            metadata: serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    /// Store the chunk and its embedding in one transaction so neither row can
    /// be orphaned. Structural rows (toc/frontmatter) pass `None` and skip the
    /// embedding table entirely.
    pub async fn store_with_embedding(
        chunk: ContentChunk,
        embedding: Option<Vec<f32>>,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        if chunk.retrieval_eligible && embedding.is_none() {
            return Err(AppError::Validation(format!(
                "retrieval-eligible chunk {} requires an embedding",
                chunk.id
            )));
        }

        let chunk_id = chunk.id.clone();
        let tenant_id = chunk.tenant_id.clone();
        let source_id = chunk.source_id.clone();
        let collection_id = chunk.collection_id.clone();
        let source_standard = chunk.source_standard.clone();
        let is_global = chunk.is_global;

        let mut query = db
            .client
            .query("BEGIN TRANSACTION;")
            .query(format!(
                "CREATE type::thing('{chunk_table}', $chunk_id) CONTENT $chunk;",
                chunk_table = Self::table_name(),
            ))
            .bind(("chunk_id", chunk_id.clone()))
            .bind(("chunk", chunk));

        if let Some(embedding) = embedding {
            query = query
                .query(
                    "CREATE type::thing('content_chunk_embedding', $emb_id) SET \
                        chunk_id = type::thing('content_chunk', $emb_id), \
                        tenant_id = $tenant_id, \
                        source_id = $source_id, \
                        collection_id = $collection_id, \
                        source_standard = $source_standard, \
                        is_global = $is_global, \
                        embedding = $embedding, \
                        created_at = time::now(), \
                        updated_at = time::now();",
                )
                .bind(("emb_id", chunk_id))
                .bind(("tenant_id", tenant_id))
                .bind(("source_id", source_id))
                .bind(("collection_id", collection_id))
                .bind(("source_standard", source_standard))
                .bind(("is_global", is_global))
                .bind(("embedding", embedding));
        }

        let response = query
            .query("COMMIT TRANSACTION;")
            .await
            .map_err(AppError::Database)?;
        response.check().map_err(AppError::Database)?;

        Ok(())
    }

    /// Idempotent re-ingestion support: wipe all chunk rows for a source.
    pub async fn delete_by_source_id(
        source_id: &str,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        db.client
            .query("DELETE content_chunk_embedding WHERE source_id = $source_id;")
            .query("DELETE content_chunk WHERE source_id = $source_id;")
            .bind(("source_id", source_id.to_owned()))
            .await?
            .check()?;
        Ok(())
    }

    pub async fn count_by_source(
        source_id: &str,
        db: &SurrealDbClient,
    ) -> Result<usize, AppError> {
        #[derive(Deserialize)]
        struct CountRow {
            count: u64,
        }
        let rows: Vec<CountRow> = db
            .query(
                "SELECT count() AS count FROM type::table($table) \
                 WHERE source_id = $source_id GROUP ALL",
            )
            .bind(("table", Self::table_name()))
            .bind(("source_id", source_id.to_owned()))
            .await?
            .take(0)?;
        Ok(rows.first().map_or(0, |row| row.count as usize))
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
        let chunks: Vec<Self> = response.take(0)?;

        // Preserve the requested order.
        let mut by_id: HashMap<String, Self> = chunks
            .into_iter()
            .map(|chunk| (chunk.id.clone(), chunk))
            .collect();
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    /// HNSW cosine search over the embedding table, hydrating chunk rows.
    pub async fn vector_search(
        take: usize,
        query_embedding: Vec<f32>,
        filter: &ChunkSearchFilter,
        ef_search: usize,
        db: &SurrealDbClient,
    ) -> Result<Vec<ScoredChunk>, AppError> {
        #[derive(Deserialize)]
        struct Row {
            chunk_id: ContentChunk,
            score: f32,
        }

        let take = take.max(1);
        let ef = ef_search.max(10);
        let sql = format!(
            r#"
            SELECT
                chunk_id,
                vector::similarity::cosine(embedding, $embedding) AS score
            FROM content_chunk_embedding
            WHERE (tenant_id = $tenant_id OR (is_global = true AND $include_global = true))
              AND ($collection_id = NONE OR collection_id = $collection_id)
              AND ($source_standard = NONE OR source_standard = $source_standard)
              AND embedding <|{take},{ef}|> $embedding
            ORDER BY score DESC
            LIMIT {take}
            FETCH chunk_id;
            "#,
        );

        let mut response = db
            .query(&sql)
            .bind(("embedding", query_embedding))
            .bind(("tenant_id", filter.tenant_id.clone()))
            .bind(("include_global", filter.include_global))
            .bind(("collection_id", filter.collection_id.clone()))
            .bind(("source_standard", filter.source_standard.clone()))
            .await
            .map_err(|e| AppError::InternalError(format!("Surreal query failed: {e}")))?;

        let rows: Vec<Row> = response.take::<Vec<Row>>(0).unwrap_or_default();

        Ok(rows
            .into_iter()
            .map(|row| ScoredChunk {
                chunk: row.chunk_id,
                score: row.score,
            })
            .collect())
    }

    /// BM25 full-text search over chunk content.
    pub async fn fts_search(
        take: usize,
        terms: &str,
        filter: &ChunkSearchFilter,
        db: &SurrealDbClient,
    ) -> Result<Vec<ScoredChunk>, AppError> {
        #[derive(Deserialize)]
        struct Row {
            #[serde(deserialize_with = "deserialize_flexible_id")]
            id: String,
            score: f32,
        }

        let limit = i64::try_from(take.max(1)).unwrap_or(i64::MAX);

        let sql = r#"
            SELECT
                id,
                IF search::score(0) != NONE THEN search::score(0) ELSE 0 END AS score
            FROM content_chunk
            WHERE content @0@ $terms
              AND (tenant_id = $tenant_id OR (is_global = true AND $include_global = true))
              AND ($collection_id = NONE OR collection_id = $collection_id)
              AND ($source_standard = NONE OR source_standard = $source_standard)
            ORDER BY score DESC
            LIMIT $limit;
            "#;

        let response = db
            .query(sql)
            .bind(("terms", terms.to_owned()))
            .bind(("tenant_id", filter.tenant_id.clone()))
            .bind(("include_global", filter.include_global))
            .bind(("collection_id", filter.collection_id.clone()))
            .bind(("source_standard", filter.source_standard.clone()))
            .bind(("limit", limit))
            .await
            .map_err(|e| AppError::InternalError(format!("Surreal query failed: {e}")))?;

        let response = response.check().map_err(AppError::Database);
        let mut response = match response {
            Ok(response) => response,
            // An FTS query without the index defined yet is an empty result,
            // not a failure; retrieval degrades to the vector leg.
            Err(_) => return Ok(Vec::new()),
        };

        let rows: Vec<Row> = response.take::<Vec<Row>>(0).unwrap_or_default();
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = rows.iter().map(|row| row.id.clone()).collect();
        let chunks = Self::fetch_by_ids(&ids, db).await?;
        let scores: HashMap<String, f32> =
            rows.into_iter().map(|row| (row.id, row.score)).collect();

        Ok(chunks
            .into_iter()
            .map(|chunk| {
                let score = scores.get(&chunk.id).copied().unwrap_or_default();
                ScoredChunk { chunk, score }
            })
            .collect())
    }

    /// Flatten chunk attributes into the retrieval-row metadata shape.
    pub fn retrieval_metadata(&self) -> serde_json::Value {
        serde_json::json!({
            "source_id": self.source_id,
            "tenant_id": self.tenant_id,
            "collection_id": self.collection_id,
            "heading_path": self.heading_path,
            "chunk_role": self.chunk_role,
            "chunk_index": self.chunk_index,
            "file_page_number": self.file_page_number,
            "retrieval_eligible": self.retrieval_eligible,
            "is_toc": self.chunk_role == ChunkRole::Toc,
            "is_frontmatter": self.chunk_role == ChunkRole::Frontmatter,
            "source_standard": self.source_standard,
            "clause_id": self.clause_id,
            "authority_level": self.authority_level,
            "is_global": self.is_global,
            "created_at": self.created_at.to_rfc3339(),
            "updated_at": self.updated_at.to_rfc3339(),
        })
    }
}
