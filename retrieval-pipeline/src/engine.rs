//! Atomic retrieval engine: hybrid vector+FTS search blended by per-source
//! RRF, plus the graph hop with late grounding back to content chunks.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use serde_json::json;
use tracing::{info, warn};

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            content_chunk::{ChunkSearchFilter, ContentChunk, ScoredChunk},
            node_provenance::NodeProvenance,
        },
    },
    utils::{config::AppConfig, embedding::EmbeddingProvider},
};

use crate::{
    graph::{search_multi_hop_context, GraphNavRow},
    scoping::{ScopeContext, ScopePatterns, ScopeService, StructuralTrace},
    RetrievalRow,
};

#[derive(Debug, Clone, Default)]
pub struct GraphOptions {
    pub relation_types: Option<Vec<String>>,
    pub node_types: Option<Vec<String>>,
    pub max_hops: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct EngineTrace {
    pub hybrid_rpc_enabled: bool,
    pub hybrid_rpc_used: bool,
    pub structural_filter: Option<StructuralTrace>,
    pub timings_ms: BTreeMap<String, f64>,
    pub warnings: Vec<String>,
}

pub struct AtomicRetrievalEngine {
    db: Arc<SurrealDbClient>,
    embedder: Arc<EmbeddingProvider>,
    config: Arc<AppConfig>,
    patterns: Arc<ScopePatterns>,
    scope_service: ScopeService,
}

impl AtomicRetrievalEngine {
    pub fn new(
        db: Arc<SurrealDbClient>,
        embedder: Arc<EmbeddingProvider>,
        config: Arc<AppConfig>,
        patterns: Arc<ScopePatterns>,
    ) -> Self {
        Self {
            db,
            embedder,
            config,
            patterns,
            scope_service: ScopeService,
        }
    }

    pub fn db(&self) -> &Arc<SurrealDbClient> {
        &self.db
    }

    pub fn embedder(&self) -> &Arc<EmbeddingProvider> {
        &self.embedder
    }

    /// Single-question retrieval over a tenant-scoped context.
    pub async fn retrieve_context(
        &self,
        query: &str,
        scope: &ScopeContext,
        k: usize,
        fetch_k: usize,
        graph: &GraphOptions,
    ) -> Result<(Vec<RetrievalRow>, EngineTrace), AppError> {
        let mut trace = EngineTrace {
            hybrid_rpc_enabled: self.config.atomic_use_hybrid_rpc,
            ..Default::default()
        };

        // Pre-validated boundary: a degenerate query returns empty without
        // touching the embedder.
        if query.trim().chars().count() < 2 {
            return Ok((Vec::new(), trace));
        }

        let started = Instant::now();
        let query_vector = self.embed_query(query).await?;

        let vector_started = Instant::now();
        let fused = if self.config.atomic_use_hybrid_rpc {
            trace.hybrid_rpc_used = true;
            self.search_hybrid(query, &query_vector, scope, fetch_k).await?
        } else {
            let mut rows = self
                .search_hybrid("", &query_vector, scope, fetch_k)
                .await?;
            for row in &mut rows {
                row.source_layer = "vector".into();
            }
            rows
        };
        trace
            .timings_ms
            .insert("vector".into(), elapsed_ms(vector_started));

        let graph_rows = match self.graph_hop(&query_vector, scope, fetch_k, graph).await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(error = %err, "graph hop failed; continuing without graph rows");
                trace
                    .warnings
                    .push(format!("graph_hop_failed:{}", truncate(&err.to_string(), 160)));
                Vec::new()
            }
        };

        // Graph rows use "graph:{entity_id}" ids, content chunks use UUIDs.
        // No collision possible, so simple concatenation is safe.
        let mut merged: Vec<RetrievalRow> = fused;
        merged.extend(graph_rows);

        let allowed_source_ids: HashSet<String> = merged
            .iter()
            .filter_map(|row| row.metadata_str("source_id"))
            .map(str::to_owned)
            .filter(|value| !value.is_empty())
            .collect();
        self.scope_service
            .stamp_tenant_context(&mut merged, &scope.tenant_id, &allowed_source_ids);

        let (mut merged, structural) = self.scope_service.filter_structural_rows(merged);
        trace.structural_filter = Some(structural);

        info!(
            duration_ms = elapsed_ms(started),
            merged_rows = merged.len(),
            "atomic engine retrieval finished"
        );
        trace.timings_ms.insert("total".into(), elapsed_ms(started));

        merged.truncate(k.max(1));
        Ok((merged, trace))
    }

    /// Direct vector search without FTS; the degraded fallback path.
    pub async fn search_vectors_only(
        &self,
        query: &str,
        scope: &ScopeContext,
        fetch_k: usize,
    ) -> Result<Vec<RetrievalRow>, AppError> {
        if query.trim().chars().count() < 2 {
            return Ok(Vec::new());
        }
        let query_vector = self.embed_query(query).await?;
        let mut rows = self
            .search_hybrid("", &query_vector, scope, fetch_k)
            .await?;
        for row in &mut rows {
            row.source_layer = "vector".into();
        }
        Ok(rows)
    }

    /// Graph-only retrieval used by the late-fusion graph stream.
    pub async fn retrieve_graph_rows(
        &self,
        query: &str,
        scope: &ScopeContext,
        fetch_k: usize,
        graph: &GraphOptions,
    ) -> Result<Vec<RetrievalRow>, AppError> {
        if query.trim().chars().count() < 2 {
            return Ok(Vec::new());
        }
        let query_vector = self.embed_query(query).await?;
        self.graph_hop(&query_vector, scope, fetch_k, graph).await
    }

    async fn embed_query(&self, query: &str) -> Result<Vec<f32>, AppError> {
        let vector = self.embedder.embed(query).await?;
        if vector.is_empty() {
            return Err(AppError::LLMParsing(
                "Failed to generate query embedding".into(),
            ));
        }
        Ok(vector)
    }

    /// The hybrid primitive: one vector leg, one FTS leg, blended by
    /// per-source RRF. Multiple standards fan out to parallel single-standard
    /// calls with a per-standard quota so no standard can dominate.
    async fn search_hybrid(
        &self,
        query_text: &str,
        query_vector: &[f32],
        scope: &ScopeContext,
        fetch_k: usize,
    ) -> Result<Vec<RetrievalRow>, AppError> {
        let effective_text = if self.config.atomic_enable_fts {
            query_text.trim()
        } else {
            ""
        };

        let mut vector_weight = self.config.atomic_rrf_vector_weight;
        let mut fts_weight = if self.config.atomic_enable_fts {
            self.config.atomic_rrf_fts_weight
        } else {
            0.0
        };
        if self.config.atomic_enable_fts
            && self.config.atomic_clause_query_weight_boost_enabled
            && self.patterns.is_clause_heavy_query(query_text)
        {
            vector_weight = self.config.atomic_clause_query_rrf_vector_weight;
            fts_weight = self.config.atomic_clause_query_rrf_fts_weight;
        }

        let standards = scope.requested_standards();

        let mut rows = if standards.len() > 1 {
            // Cap per-standard quota so one standard cannot crowd out the rest.
            let base_quota = fetch_k / standards.len();
            let quota = base_quota.clamp(10, 20);
            let calls = standards.iter().map(|standard| {
                self.search_hybrid_single(
                    effective_text,
                    query_vector,
                    scope,
                    Some(standard.clone()),
                    quota,
                    vector_weight,
                    fts_weight,
                )
            });
            let batches = join_all(calls).await;
            let mut merged = Vec::new();
            for batch in batches {
                match batch {
                    Ok(rows) => merged.extend(rows),
                    Err(err) => {
                        warn!(error = %err, "stratified hybrid call failed");
                    }
                }
            }
            merged
        } else {
            self.search_hybrid_single(
                effective_text,
                query_vector,
                scope,
                standards.into_iter().next(),
                fetch_k,
                vector_weight,
                fts_weight,
            )
            .await?
        };

        // Clause metadata narrows results; the broker retries without it when
        // the narrowing empties the set.
        if let Some(clause_id) = scope.clause_id() {
            rows.retain(|row| {
                row.metadata_str("clause_id")
                    .map(|value| value == clause_id)
                    .unwrap_or(false)
                    || row.content.contains(&clause_id)
            });
        }

        Ok(rows)
    }

    #[allow(clippy::too_many_arguments)]
    async fn search_hybrid_single(
        &self,
        query_text: &str,
        query_vector: &[f32],
        scope: &ScopeContext,
        source_standard: Option<String>,
        fetch_k: usize,
        vector_weight: f32,
        fts_weight: f32,
    ) -> Result<Vec<RetrievalRow>, AppError> {
        let filter = ChunkSearchFilter {
            tenant_id: scope.tenant_id.clone(),
            include_global: scope.is_global.unwrap_or(false),
            collection_id: scope.collection_id.clone(),
            source_standard,
        };

        let match_count = fetch_k.max(1);
        let vector_hits = ContentChunk::vector_search(
            match_count,
            query_vector.to_vec(),
            &filter,
            self.config.atomic_hnsw_ef_search.max(10),
            &self.db,
        )
        .await?;

        let fts_hits = if fts_weight > 0.0 && !query_text.is_empty() {
            ContentChunk::fts_search(match_count, query_text, &filter, &self.db).await?
        } else {
            Vec::new()
        };

        Ok(self.fuse_rrf(vector_hits, fts_hits, match_count, vector_weight, fts_weight))
    }

    /// Per-source reciprocal rank fusion of the two result legs.
    fn fuse_rrf(
        &self,
        vector_hits: Vec<ScoredChunk>,
        fts_hits: Vec<ScoredChunk>,
        match_count: usize,
        vector_weight: f32,
        fts_weight: f32,
    ) -> Vec<RetrievalRow> {
        struct Fused {
            chunk: ContentChunk,
            similarity: f32,
            score: f32,
        }

        let rrf_k = self.config.atomic_rrf_k as f32;
        let threshold = self.config.atomic_match_threshold;
        let mut by_id: HashMap<String, Fused> = HashMap::new();
        let mut order: Vec<String> = Vec::new();

        for (rank, hit) in vector_hits
            .into_iter()
            .filter(|hit| hit.score >= threshold)
            .enumerate()
        {
            let contribution = vector_weight / (rrf_k + rank as f32 + 1.0);
            let id = hit.chunk.id.clone();
            match by_id.get_mut(&id) {
                Some(entry) => entry.score += contribution,
                None => {
                    order.push(id.clone());
                    by_id.insert(
                        id,
                        Fused {
                            chunk: hit.chunk,
                            similarity: hit.score,
                            score: contribution,
                        },
                    );
                }
            }
        }

        for (rank, hit) in fts_hits.into_iter().enumerate() {
            let contribution = fts_weight / (rrf_k + rank as f32 + 1.0);
            let id = hit.chunk.id.clone();
            match by_id.get_mut(&id) {
                Some(entry) => entry.score += contribution,
                None => {
                    order.push(id.clone());
                    by_id.insert(
                        id,
                        Fused {
                            chunk: hit.chunk,
                            similarity: 0.0,
                            score: contribution,
                        },
                    );
                }
            }
        }

        let mut fused: Vec<Fused> = order
            .into_iter()
            .filter_map(|id| by_id.remove(&id))
            .collect();
        fused.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk.id.cmp(&b.chunk.id))
        });
        fused.truncate(match_count);

        fused
            .into_iter()
            .map(|entry| chunk_to_row(entry.chunk, entry.similarity, entry.score, "hybrid"))
            .collect()
    }

    /// Late-grounding graph hop: navigate the entity graph, then resolve the
    /// returned entities to real content chunks via provenance. Entities with
    /// no chunk lineage fall back to synthetic anchor/hop rows.
    async fn graph_hop(
        &self,
        query_vector: &[f32],
        scope: &ScopeContext,
        fetch_k: usize,
        graph: &GraphOptions,
    ) -> Result<Vec<RetrievalRow>, AppError> {
        if !self.config.atomic_enable_graph_hop {
            return Ok(Vec::new());
        }
        let tenant_id = scope.tenant_id.trim();
        if tenant_id.is_empty() {
            return Ok(Vec::new());
        }

        let hops = graph.max_hops.unwrap_or(2);
        let nav_rows = search_multi_hop_context(
            &self.db,
            tenant_id,
            query_vector.to_vec(),
            self.config.atomic_match_threshold.min(0.35),
            fetch_k.min(12).max(6),
            hops,
            0.82,
            graph.node_types.as_deref(),
            graph.relation_types.as_deref(),
        )
        .await?;

        if nav_rows.is_empty() {
            return Ok(Vec::new());
        }

        let entity_meta: HashMap<String, &GraphNavRow> = nav_rows
            .iter()
            .map(|row| (row.entity_id.clone(), row))
            .collect();
        let entity_ids: Vec<String> = nav_rows.iter().map(|row| row.entity_id.clone()).collect();

        let provenance_links = NodeProvenance::resolve_chunk_ids(&self.db, &entity_ids).await?;

        let mut chunk_to_entities: HashMap<String, Vec<String>> = HashMap::new();
        let mut grounded_entity_ids: HashSet<String> = HashSet::new();
        for link in provenance_links {
            grounded_entity_ids.insert(link.node_id.clone());
            chunk_to_entities
                .entry(link.chunk_id)
                .or_default()
                .push(link.node_id);
        }

        let grounded_chunk_ids: Vec<String> = chunk_to_entities.keys().cloned().collect();
        let mut grounded_rows: Vec<RetrievalRow> = Vec::new();
        if !grounded_chunk_ids.is_empty() {
            let chunks = ContentChunk::fetch_by_ids(&grounded_chunk_ids, &self.db).await?;
            for chunk in chunks {
                let linked = chunk_to_entities
                    .get(&chunk.id)
                    .cloned()
                    .unwrap_or_default();
                let best_similarity = linked
                    .iter()
                    .filter_map(|entity_id| entity_meta.get(entity_id))
                    .map(|row| row.similarity)
                    .fold(0.0f32, f32::max);

                let reasoning: Vec<String> = linked
                    .iter()
                    .filter_map(|entity_id| entity_meta.get(entity_id))
                    .take(3)
                    .map(|row| {
                        if row.entity_description.trim().is_empty() {
                            row.entity_name.clone()
                        } else {
                            format!("{}: {}", row.entity_name, row.entity_description)
                        }
                    })
                    .collect();

                let mut row = chunk_to_row(chunk, best_similarity, best_similarity, "graph_grounded");
                row.set_metadata("retrieved_via", json!("graph"));
                row.set_metadata("graph_reasoning", json!(reasoning.join("; ")));
                row.set_metadata("graph_entity_ids", json!(linked));
                grounded_rows.push(row);
            }
        }

        let mut ungrounded_rows: Vec<RetrievalRow> = Vec::new();
        for nav in &nav_rows {
            if grounded_entity_ids.contains(&nav.entity_id) {
                continue;
            }
            let marker = if nav.hop_depth == 0 {
                "[anchor]".to_owned()
            } else {
                format!("[hop-{}]", nav.hop_depth)
            };
            let mut metadata = serde_json::Map::new();
            metadata.insert("citations".into(), json!([nav.entity_id]));
            metadata.insert("path_ids".into(), json!(nav.path_ids));
            metadata.insert("hop_depth".into(), json!(nav.hop_depth));
            metadata.insert("retrieved_via".into(), json!("graph"));
            metadata.insert("grounded".into(), json!(false));

            ungrounded_rows.push(RetrievalRow {
                id: format!("graph:{}", nav.entity_id),
                content: format!("{marker} {}: {}", nav.entity_name, nav.entity_description),
                metadata,
                similarity: nav.similarity,
                score: nav.similarity,
                source_layer: "graph".into(),
                source_type: "knowledge_entity_ungrounded".into(),
                source_id: Some(nav.entity_id.clone()),
                tenant_id: None,
                scope_penalized: false,
                scope_penalty: None,
                semantic_relevance_score: None,
            });
        }

        info!(
            total_entities = entity_ids.len(),
            grounded_chunks = grounded_rows.len(),
            ungrounded_entities = ungrounded_rows.len(),
            "graph hop late grounding finished"
        );

        grounded_rows.extend(ungrounded_rows);
        Ok(grounded_rows)
    }
}

pub(crate) fn chunk_to_row(
    chunk: ContentChunk,
    similarity: f32,
    score: f32,
    source_layer: &str,
) -> RetrievalRow {
    let mut metadata = match chunk.retrieval_metadata() {
        serde_json::Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    if let Some(extra) = chunk.metadata.as_object() {
        for (key, value) in extra {
            metadata.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
    metadata.insert("id".into(), json!(chunk.id));

    RetrievalRow {
        id: chunk.id.clone(),
        content: chunk.content.clone(),
        metadata,
        similarity,
        score,
        source_layer: source_layer.to_owned(),
        source_type: "content_chunk".into(),
        source_id: Some(chunk.source_id.clone()),
        tenant_id: Some(chunk.tenant_id),
        scope_penalized: false,
        scope_penalty: None,
        semantic_relevance_score: None,
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    (started.elapsed().as_secs_f64() * 1000.0 * 100.0).round() / 100.0
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::storage::indexes::ensure_runtime_indexes;
    use common::storage::types::content_chunk::ChunkRole;
    use common::storage::types::knowledge_entity::KnowledgeEntity;
    use common::utils::authority::AuthorityLevel;
    use uuid::Uuid;

    async fn setup_engine() -> AtomicRetrievalEngine {
        let database = Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("engine_ns", &database)
            .await
            .expect("in-memory db");
        db.ensure_initialized().await.expect("schema");
        ensure_runtime_indexes(&db, 16).await.expect("indexes");

        let config = AppConfig::default();
        let patterns = ScopePatterns::from_config(&config).expect("patterns");
        AtomicRetrievalEngine::new(
            Arc::new(db),
            Arc::new(EmbeddingProvider::new_hashed(16).expect("embedder")),
            Arc::new(config),
            Arc::new(patterns),
        )
    }

    async fn seed_chunk(
        engine: &AtomicRetrievalEngine,
        tenant: &str,
        source: &str,
        content: &str,
        standard: Option<&str>,
    ) -> ContentChunk {
        let mut chunk = ContentChunk::new(
            source,
            tenant,
            content,
            0,
            ChunkRole::NormativeBody,
            vec!["8 Operation".into()],
            AuthorityLevel::Canonical,
        );
        chunk.source_standard = standard.map(str::to_owned);
        let embedding = engine.embedder.embed(content).await.expect("embed");
        ContentChunk::store_with_embedding(chunk.clone(), Some(embedding), engine.db())
            .await
            .expect("store chunk");
        chunk
    }

    fn scope(tenant: &str) -> ScopeContext {
        ScopeContext {
            tenant_id: tenant.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn one_character_query_short_circuits() {
        let engine = setup_engine().await;
        let (rows, trace) = engine
            .retrieve_context("x", &scope("t1"), 5, 40, &GraphOptions::default())
            .await
            .expect("retrieve");
        assert!(rows.is_empty());
        assert!(trace.timings_ms.is_empty(), "no work should have been timed");
    }

    #[tokio::test]
    async fn hybrid_retrieval_returns_tenant_rows_only() {
        let engine = setup_engine().await;
        let own = seed_chunk(
            &engine,
            "t1",
            "src1",
            "production control of nonconforming outputs",
            Some("ISO 9001"),
        )
        .await;
        seed_chunk(
            &engine,
            "t2",
            "src2",
            "production control of nonconforming outputs",
            Some("ISO 9001"),
        )
        .await;

        let (rows, trace) = engine
            .retrieve_context(
                "control of nonconforming outputs",
                &scope("t1"),
                5,
                40,
                &GraphOptions::default(),
            )
            .await
            .expect("retrieve");

        assert!(trace.hybrid_rpc_used);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, own.id);
        assert_eq!(rows[0].tenant_id.as_deref(), Some("t1"));
        assert_eq!(rows[0].source_layer, "hybrid");
    }

    #[tokio::test]
    async fn multi_standard_scope_fans_out_with_quotas() {
        let engine = setup_engine().await;
        seed_chunk(&engine, "t1", "s1", "quality objectives and planning", Some("ISO 9001")).await;
        seed_chunk(&engine, "t1", "s2", "environmental objectives and planning", Some("ISO 14001"))
            .await;
        seed_chunk(&engine, "t1", "s3", "irrelevant welding procedure", None).await;

        let mut request_scope = scope("t1");
        request_scope.source_standards =
            vec!["ISO 9001".to_owned(), "ISO 14001".to_owned()];

        let (rows, _trace) = engine
            .retrieve_context(
                "objectives and planning",
                &request_scope,
                10,
                40,
                &GraphOptions::default(),
            )
            .await
            .expect("retrieve");

        let standards: HashSet<&str> = rows
            .iter()
            .filter_map(|row| row.metadata_str("source_standard"))
            .collect();
        assert!(standards.contains("ISO 9001"));
        assert!(standards.contains("ISO 14001"));
        assert!(
            rows.iter().all(|row| row.metadata_str("source_standard").is_some()),
            "unscoped chunks are excluded by the standard filter"
        );
    }

    #[tokio::test]
    async fn graph_hop_grounds_entities_and_falls_back_for_lineageless_ones() {
        let engine = setup_engine().await;
        let chunk = seed_chunk(
            &engine,
            "t1",
            "src1",
            "documented information shall be controlled",
            None,
        )
        .await;

        let grounded = KnowledgeEntity::upsert_by_name(
            engine.db(),
            "t1",
            "Documented Information",
            "control of documents",
            "CONCEPT",
            Some("src1".into()),
        )
        .await
        .expect("entity");
        let embedding = engine
            .embedder
            .embed("documented information shall be controlled")
            .await
            .expect("embed");
        KnowledgeEntity::store_embedding(engine.db(), &grounded.id, "t1", embedding.clone())
            .await
            .expect("embed entity");
        NodeProvenance::link(engine.db(), &grounded.id, &chunk.id, "t1")
            .await
            .expect("provenance");

        let ungrounded = KnowledgeEntity::upsert_by_name(
            engine.db(),
            "t1",
            "Orphan Concept",
            "no lineage",
            "CONCEPT",
            None,
        )
        .await
        .expect("entity");
        KnowledgeEntity::store_embedding(engine.db(), &ungrounded.id, "t1", embedding)
            .await
            .expect("embed entity");

        let (rows, _trace) = engine
            .retrieve_context(
                "documented information shall be controlled",
                &scope("t1"),
                10,
                40,
                &GraphOptions::default(),
            )
            .await
            .expect("retrieve");

        let grounded_row = rows
            .iter()
            .find(|row| row.source_layer == "graph_grounded")
            .expect("grounded graph row");
        assert_eq!(grounded_row.id, chunk.id);
        assert!(!grounded_row.content.contains("[anchor]"));
        assert_eq!(grounded_row.metadata_str("retrieved_via"), Some("graph"));

        let synthetic = rows
            .iter()
            .find(|row| row.source_type == "knowledge_entity_ungrounded")
            .expect("ungrounded fallback row");
        assert!(synthetic.id.starts_with("graph:"));
        assert!(synthetic.content.contains("[anchor]") || synthetic.content.contains("[hop-"));
        assert_eq!(synthetic.metadata_str("retrieved_via"), Some("graph"));
    }

    #[tokio::test]
    async fn structural_rows_are_dropped_from_results() {
        let engine = setup_engine().await;
        let mut toc = ContentChunk::new(
            "src1",
            "t1",
            "1. Scope .... 3  2. Terms .... 5",
            0,
            ChunkRole::Toc,
            vec![],
            AuthorityLevel::Supplementary,
        );
        toc.retrieval_eligible = false;
        ContentChunk::store_with_embedding(toc, None, engine.db())
            .await
            .expect("store toc");
        seed_chunk(&engine, "t1", "src1", "terms and definitions for audits", None).await;

        let (rows, trace) = engine
            .retrieve_context(
                "terms and definitions",
                &scope("t1"),
                10,
                40,
                &GraphOptions::default(),
            )
            .await
            .expect("retrieve");

        assert_eq!(rows.len(), 1);
        let structural = trace.structural_filter.expect("structural trace");
        assert!(structural.applied);
    }

    #[tokio::test]
    async fn deterministic_ordering_for_fixed_inputs() {
        let engine = setup_engine().await;
        seed_chunk(&engine, "t1", "s1", "internal audit programme planning", None).await;
        seed_chunk(&engine, "t1", "s2", "management review inputs and outputs", None).await;
        seed_chunk(&engine, "t1", "s3", "audit criteria and audit scope", None).await;

        let (first, _) = engine
            .retrieve_context("audit planning", &scope("t1"), 5, 40, &GraphOptions::default())
            .await
            .expect("retrieve");
        let (second, _) = engine
            .retrieve_context("audit planning", &scope("t1"), 5, 40, &GraphOptions::default())
            .await
            .expect("retrieve");

        let first_ids: Vec<&str> = first.iter().map(|row| row.id.as_str()).collect();
        let second_ids: Vec<&str> = second.iter().map(|row| row.id.as_str()).collect();
        assert_eq!(first_ids, second_ids);
    }
}
