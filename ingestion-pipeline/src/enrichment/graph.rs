//! Graph extraction over retrieval-eligible chunks: batched strict-JSON LLM
//! calls, an in-memory arena keyed by `(tenant, name)` and `(src, dst, type)`
//! flushed as batched upserts, provenance links, and document-structure nodes
//! from TOC chunks.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tracing::warn;

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            content_chunk::{ChunkRole, ContentChunk},
            ingestion_event::EventSeverity,
            knowledge_entity::{KnowledgeEntity, DOCUMENT_SECTION_TYPE},
            knowledge_relationship::KnowledgeRelationship,
            node_provenance::NodeProvenance,
        },
    },
    utils::{config::AppConfig, embedding::EmbeddingProvider},
};

use crate::{llm::ModelServices, state_manager::IngestionStateManager};

#[derive(Debug, Clone, Default, Serialize)]
pub struct GraphEnrichmentStats {
    pub chunks_scanned: usize,
    pub batches: usize,
    pub batches_skipped: usize,
    pub entities_upserted: usize,
    pub relations_upserted: usize,
    pub provenance_links: usize,
    pub structure_nodes: usize,
}

/// Entity rows collected before the flush, keyed by lowercased name.
#[derive(Debug, Clone)]
struct ArenaEntity {
    name: String,
    description: String,
    entity_type: String,
    chunk_ids: Vec<String>,
}

pub struct GraphEnricher<'a> {
    db: Arc<SurrealDbClient>,
    embedder: Arc<EmbeddingProvider>,
    models: Arc<dyn ModelServices>,
    config: Arc<AppConfig>,
    state: &'a IngestionStateManager,
}

impl<'a> GraphEnricher<'a> {
    pub fn new(
        db: Arc<SurrealDbClient>,
        embedder: Arc<EmbeddingProvider>,
        models: Arc<dyn ModelServices>,
        config: Arc<AppConfig>,
        state: &'a IngestionStateManager,
    ) -> Self {
        Self {
            db,
            embedder,
            models,
            config,
            state,
        }
    }

    pub async fn enrich_document(
        &self,
        source_document_id: &str,
        tenant_id: &str,
    ) -> Result<GraphEnrichmentStats, AppError> {
        let mut stats = GraphEnrichmentStats::default();

        let chunks = chunks_for_source(&self.db, source_document_id).await?;
        stats.chunks_scanned = chunks.len();

        let eligible: Vec<&ContentChunk> =
            chunks.iter().filter(|chunk| chunk.retrieval_eligible).collect();
        let toc_chunks: Vec<&ContentChunk> = chunks
            .iter()
            .filter(|chunk| chunk.chunk_role == ChunkRole::Toc)
            .collect();

        // Arena: entities keyed by name_key, relations keyed by (src, dst, type).
        let mut entity_arena: HashMap<String, ArenaEntity> = HashMap::new();
        let mut relation_arena: HashMap<(String, String, String), String> = HashMap::new();

        let batch_size = self.config.ingestion_graph_batch_size.max(1);
        let log_stride = self.config.ingestion_graph_chunk_log_every_n.max(1);
        let mut chunks_processed = 0usize;

        for batch in eligible.chunks(batch_size) {
            stats.batches += 1;
            let batch_text = batch
                .iter()
                .map(|chunk| chunk.content.as_str())
                .collect::<Vec<_>>()
                .join("\n\n---\n\n");

            let extraction = match self.models.extract_graph(&batch_text).await {
                Ok(extraction) => extraction,
                // A schema-drifting response skips this batch only; the
                // pipeline continues.
                Err(err @ AppError::Contract(_)) | Err(err @ AppError::LLMParsing(_)) => {
                    warn!(error = %err, "graph extraction contract violation; skipping batch");
                    stats.batches_skipped += 1;
                    chunks_processed += batch.len();
                    continue;
                }
                Err(err) => return Err(err),
            };

            for entity in extraction.entities {
                let name_key = entity.name.to_lowercase();
                let linked_chunks: Vec<String> = batch
                    .iter()
                    .filter(|chunk| {
                        chunk
                            .content
                            .to_lowercase()
                            .contains(&name_key)
                    })
                    .map(|chunk| chunk.id.clone())
                    .collect();
                let fallback_chunk = batch.first().map(|chunk| chunk.id.clone());

                let arena_entry =
                    entity_arena
                        .entry(name_key)
                        .or_insert_with(|| ArenaEntity {
                            name: entity.name.clone(),
                            description: String::new(),
                            entity_type: entity.entity_type.clone(),
                            chunk_ids: Vec::new(),
                        });
                if arena_entry.description.is_empty() {
                    arena_entry.description = entity.description.clone();
                }
                let links = if linked_chunks.is_empty() {
                    fallback_chunk.into_iter().collect()
                } else {
                    linked_chunks
                };
                for chunk_id in links {
                    if !arena_entry.chunk_ids.contains(&chunk_id) {
                        arena_entry.chunk_ids.push(chunk_id);
                    }
                }
            }

            for relation in extraction.relations {
                relation_arena
                    .entry((
                        relation.source.to_lowercase(),
                        relation.target.to_lowercase(),
                        relation.relation_type.to_uppercase(),
                    ))
                    .or_insert_with(|| relation.relation_type.to_uppercase());
            }

            chunks_processed += batch.len();
            if chunks_processed % log_stride < batch.len() {
                self.state
                    .log_step(
                        source_document_id,
                        &format!("Graph extraction progress: {chunks_processed} chunks"),
                        EventSeverity::Info,
                        "graph",
                        json!({
                            "chunks_processed": chunks_processed,
                            "entities_collected": entity_arena.len(),
                        }),
                    )
                    .await?;
            }
        }

        // Flush the arena: entities first (dedup by (tenant, name)), then
        // relations resolved through the freshly assigned ids.
        let mut id_by_name_key: HashMap<String, String> = HashMap::new();
        for (name_key, arena_entity) in &entity_arena {
            let stored = KnowledgeEntity::upsert_by_name(
                &self.db,
                tenant_id,
                &arena_entity.name,
                &arena_entity.description,
                &arena_entity.entity_type,
                Some(source_document_id.to_owned()),
            )
            .await?;

            let embedding_text = if arena_entity.description.is_empty() {
                arena_entity.name.clone()
            } else {
                format!("{}: {}", arena_entity.name, arena_entity.description)
            };
            let embedding = self.embedder.embed(&embedding_text).await?;
            KnowledgeEntity::store_embedding(&self.db, &stored.id, tenant_id, embedding).await?;

            for chunk_id in &arena_entity.chunk_ids {
                NodeProvenance::link(&self.db, &stored.id, chunk_id, tenant_id).await?;
                stats.provenance_links += 1;
            }

            id_by_name_key.insert(name_key.clone(), stored.id);
            stats.entities_upserted += 1;
        }

        for ((source_key, target_key, relation_type), _) in &relation_arena {
            let (Some(source_id), Some(target_id)) = (
                id_by_name_key.get(source_key),
                id_by_name_key.get(target_key),
            ) else {
                continue;
            };
            let inserted = KnowledgeRelationship::new(
                source_id,
                target_id,
                tenant_id,
                source_document_id,
                relation_type,
            )
            .upsert(&self.db)
            .await?;
            if inserted {
                stats.relations_upserted += 1;
            }
        }

        // Document-structure nodes: one section entity per TOC entry, linked
        // back to chunks sharing the section_ref.
        stats.structure_nodes = self
            .upsert_structure_nodes(source_document_id, tenant_id, &toc_chunks, &chunks)
            .await?;

        self.state
            .log_step(
                source_document_id,
                &format!(
                    "Graph enrichment finished: {} entities, {} relations",
                    stats.entities_upserted, stats.relations_upserted
                ),
                EventSeverity::Success,
                "graph",
                serde_json::to_value(&stats)?,
            )
            .await?;

        Ok(stats)
    }

    async fn upsert_structure_nodes(
        &self,
        source_document_id: &str,
        tenant_id: &str,
        toc_chunks: &[&ContentChunk],
        all_chunks: &[ContentChunk],
    ) -> Result<usize, AppError> {
        let mut count = 0usize;
        for toc_chunk in toc_chunks {
            for line in toc_chunk.content.lines() {
                let Some(section_ref) = toc_line_section(line) else {
                    continue;
                };

                let entity = KnowledgeEntity::upsert_by_name(
                    &self.db,
                    tenant_id,
                    &format!("§ {section_ref}"),
                    &format!("Document section {section_ref}"),
                    DOCUMENT_SECTION_TYPE,
                    Some(source_document_id.to_owned()),
                )
                .await?;
                self.db
                    .client
                    .query(
                        "UPDATE type::thing('knowledge_entity', $id) SET section_ref = $section_ref",
                    )
                    .bind(("id", entity.id.clone()))
                    .bind(("section_ref", section_ref.clone()))
                    .await?
                    .check()?;
                count += 1;

                for chunk in all_chunks {
                    let matches_section = chunk
                        .metadata
                        .get("section_ref")
                        .and_then(|value| value.as_str())
                        .map(|value| value.contains(&section_ref))
                        .unwrap_or(false)
                        || chunk
                            .clause_id
                            .as_deref()
                            .map(|clause| section_ref.starts_with(clause))
                            .unwrap_or(false);
                    if matches_section {
                        NodeProvenance::link(&self.db, &entity.id, &chunk.id, tenant_id).await?;
                    }
                }
            }
        }
        Ok(count)
    }
}

/// `"8.5.1 Control of production .... 42"` → `"8.5.1 Control of production"`.
fn toc_line_section(line: &str) -> Option<String> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let first = trimmed.split_whitespace().next()?;
    let is_clause = first.chars().all(|c| c.is_ascii_digit() || c == '.') && first.contains('.');
    if !is_clause {
        return None;
    }
    let without_leader = trimmed
        .split("....")
        .next()
        .unwrap_or(trimmed)
        .trim_end_matches(|c: char| c.is_ascii_digit() || c.is_whitespace() || c == '.');
    if without_leader.is_empty() {
        None
    } else {
        Some(without_leader.trim().to_owned())
    }
}

pub(crate) async fn chunks_for_source(
    db: &SurrealDbClient,
    source_document_id: &str,
) -> Result<Vec<ContentChunk>, AppError> {
    let chunks: Vec<ContentChunk> = db
        .query(
            "SELECT * FROM content_chunk WHERE source_id = $source_id \
             ORDER BY chunk_index ASC",
        )
        .bind(("source_id", source_document_id.to_owned()))
        .await?
        .take(0)?;
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChunkGraphExtraction, ExtractedEntity, ExtractedRelation};
    use async_trait::async_trait;
    use common::storage::indexes::ensure_runtime_indexes;
    use common::utils::authority::AuthorityLevel;
    use std::sync::Mutex;
    use uuid::Uuid;

    struct StubModels {
        responses: Mutex<Vec<Result<ChunkGraphExtraction, AppError>>>,
    }

    #[async_trait]
    impl ModelServices for StubModels {
        async fn extract_graph(&self, _batch: &str) -> Result<ChunkGraphExtraction, AppError> {
            self.responses
                .lock()
                .expect("lock")
                .pop()
                .unwrap_or_else(|| Ok(ChunkGraphExtraction::default()))
        }
        async fn summarize_cluster(&self, _texts: &[String]) -> Result<String, AppError> {
            Ok("summary".into())
        }
        async fn describe_visual(&self, _b64: &str, _ct: &str) -> Result<String, AppError> {
            Ok("visual".into())
        }
        async fn chat_answer(&self, _q: &str, _c: &str) -> Result<String, AppError> {
            Ok("answer".into())
        }
        fn provider_label(&self) -> &'static str {
            "stub"
        }
        fn model_label(&self) -> String {
            "stub-model".into()
        }
    }

    async fn setup() -> (Arc<SurrealDbClient>, IngestionStateManager, Arc<AppConfig>) {
        let database = Uuid::new_v4().to_string();
        let db = Arc::new(
            SurrealDbClient::memory("graph_enrich_ns", &database)
                .await
                .expect("in-memory db"),
        );
        db.ensure_initialized().await.expect("schema");
        ensure_runtime_indexes(&db, 8).await.expect("indexes");
        let config = Arc::new(AppConfig::default());
        let state = IngestionStateManager::new(Arc::clone(&db), 3);
        (db, state, config)
    }

    async fn seed_chunk(db: &SurrealDbClient, content: &str, index: u32) -> ContentChunk {
        let chunk = ContentChunk::new(
            "doc1",
            "t1",
            content,
            index,
            ChunkRole::NormativeBody,
            vec![],
            AuthorityLevel::Canonical,
        );
        ContentChunk::store_with_embedding(chunk.clone(), Some(vec![0.1; 8]), db)
            .await
            .expect("store chunk");
        chunk
    }

    #[tokio::test]
    async fn extraction_upserts_entities_relations_and_provenance() {
        let (db, state, config) = setup().await;
        let chunk = seed_chunk(&db, "The Quality Policy drives the Quality Objectives.", 0).await;

        let extraction = ChunkGraphExtraction {
            entities: vec![
                ExtractedEntity {
                    name: "Quality Policy".into(),
                    description: "Top-level commitment".into(),
                    entity_type: "CONCEPT".into(),
                },
                ExtractedEntity {
                    name: "Quality Objectives".into(),
                    description: String::new(),
                    entity_type: "CONCEPT".into(),
                },
            ],
            relations: vec![ExtractedRelation {
                source: "Quality Policy".into(),
                target: "Quality Objectives".into(),
                relation_type: "drives".into(),
            }],
        };
        let models = Arc::new(StubModels {
            responses: Mutex::new(vec![Ok(extraction)]),
        });

        let enricher = GraphEnricher::new(
            Arc::clone(&db),
            Arc::new(EmbeddingProvider::new_hashed(8).expect("embedder")),
            models,
            config,
            &state,
        );
        let stats = enricher.enrich_document("doc1", "t1").await.expect("enrich");

        assert_eq!(stats.entities_upserted, 2);
        assert_eq!(stats.relations_upserted, 1);
        assert!(stats.provenance_links >= 2);

        let links = NodeProvenance::resolve_chunk_ids(
            &db,
            &db.get_all_stored_items::<KnowledgeEntity>()
                .await
                .expect("entities")
                .iter()
                .map(|entity| entity.id.clone())
                .collect::<Vec<_>>(),
        )
        .await
        .expect("links");
        assert!(links.iter().all(|link| link.chunk_id == chunk.id));
    }

    #[tokio::test]
    async fn contract_violations_skip_the_batch_and_continue() {
        let (db, state, config) = setup().await;
        // Two batches (batch size 4, 5 chunks): first extraction errors, the
        // second succeeds.
        for index in 0..5 {
            seed_chunk(&db, &format!("Chunk {index} mentions Calibration."), index).await;
        }

        let ok_extraction = ChunkGraphExtraction {
            entities: vec![ExtractedEntity {
                name: "Calibration".into(),
                description: "Measurement".into(),
                entity_type: "CONCEPT".into(),
            }],
            relations: vec![],
        };
        // Responses pop from the back: first call gets the contract error.
        let models = Arc::new(StubModels {
            responses: Mutex::new(vec![
                Ok(ok_extraction),
                Err(AppError::Contract("schema drift".into())),
            ]),
        });

        let enricher = GraphEnricher::new(
            Arc::clone(&db),
            Arc::new(EmbeddingProvider::new_hashed(8).expect("embedder")),
            models,
            config,
            &state,
        );
        let stats = enricher.enrich_document("doc1", "t1").await.expect("enrich");

        assert_eq!(stats.batches, 2);
        assert_eq!(stats.batches_skipped, 1);
        assert_eq!(stats.entities_upserted, 1);
    }

    #[test]
    fn toc_line_parsing() {
        assert_eq!(
            toc_line_section("8.5.1 Control of production .... 42"),
            Some("8.5.1 Control of production".to_owned())
        );
        assert_eq!(toc_line_section("Introduction .... 1"), None);
        assert_eq!(toc_line_section(""), None);
    }
}
