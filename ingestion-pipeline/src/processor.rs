//! Ingestion orchestration for one document: download, strategy dispatch,
//! chunk persistence, and deferred-enrichment scheduling.

use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        store::StorageManager,
        types::{
            content_chunk::{ChunkRole, ContentChunk},
            ingestion_event::EventSeverity,
            job::{JobType, QueueJob},
            source_document::{DocumentStatus, SourceDocument, PENDING_STATUSES},
        },
    },
    utils::{authority::AuthorityLevel, config::AppConfig, embedding::EmbeddingProvider},
};

use crate::{
    parser::DocumentParser,
    state_manager::IngestionStateManager,
    strategies::{StrategyInput, StrategyKey, StrategyRegistry},
};

#[derive(Debug, PartialEq, Eq)]
pub enum ProcessOutcome {
    Processed { chunks_persisted: usize },
    EmptyFile,
    SkippedByPolicy,
}

pub struct DocumentProcessor {
    db: Arc<SurrealDbClient>,
    storage: StorageManager,
    embedder: Arc<EmbeddingProvider>,
    parser: Arc<dyn DocumentParser>,
    config: Arc<AppConfig>,
    state: IngestionStateManager,
    registry: StrategyRegistry,
}

impl DocumentProcessor {
    pub fn new(
        db: Arc<SurrealDbClient>,
        storage: StorageManager,
        embedder: Arc<EmbeddingProvider>,
        parser: Arc<dyn DocumentParser>,
        config: Arc<AppConfig>,
    ) -> Self {
        let state = IngestionStateManager::new(Arc::clone(&db), config.max_retries);
        Self {
            db,
            storage,
            embedder,
            parser,
            config,
            state,
            registry: StrategyRegistry::with_defaults(),
        }
    }

    pub fn state(&self) -> &IngestionStateManager {
        &self.state
    }

    /// Should this record be picked up at all? Non-pending rows and rows past
    /// the retry budget are left alone.
    pub fn should_process(&self, doc: &SourceDocument) -> bool {
        PENDING_STATUSES.contains(&doc.status) && doc.retry_count < self.config.max_retries
    }

    #[tracing::instrument(skip_all, fields(doc_id = %doc.id, tenant_id = %doc.tenant_id))]
    pub async fn process(&self, doc: &SourceDocument) -> Result<ProcessOutcome, AppError> {
        if !self.should_process(doc) {
            info!(status = ?doc.status, "document skipped by ingestion policy");
            return Ok(ProcessOutcome::SkippedByPolicy);
        }

        if !doc.is_global && doc.tenant_id.trim().is_empty() {
            return Err(AppError::Validation(
                "non-global document missing tenant_id".into(),
            ));
        }

        self.state.start_processing(doc).await?;

        match self.run_pipeline(doc).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                // Transient failures are requeued at the job layer without
                // touching the document's retry budget.
                if !err.is_transient() {
                    self.state.handle_error(doc, &err).await?;
                }
                Err(err)
            }
        }
    }

    async fn run_pipeline(&self, doc: &SourceDocument) -> Result<ProcessOutcome, AppError> {
        // Download through the storage port; a missing object is permanent,
        // transport failures are worth a retry.
        let bytes = self
            .storage
            .get(&doc.storage_path)
            .await
            .map_err(|err| match err {
                object_store::Error::NotFound { .. } => {
                    AppError::Processing(format!("stored object missing: {}", doc.storage_path))
                }
                other => AppError::Transient(format!("storage read failed: {other}")),
            })?;

        let parsed = self.parser.parse(&bytes, &doc.filename).await?;

        if parsed.text.trim().is_empty() {
            self.state.handle_empty_file(doc).await?;
            return Ok(ProcessOutcome::EmptyFile);
        }

        if !parsed.visual_tasks.is_empty() {
            SourceDocument::merge_metadata(
                &self.db,
                &doc.id,
                json!({ "visual_tasks": parsed.visual_tasks }),
            )
            .await?;
        }

        let strategy_key = self.resolve_strategy(doc);
        self.state
            .log_step(
                &doc.id,
                &format!("Running ingestion pipeline ({})", strategy_key.as_slug()),
                EventSeverity::Info,
                "chunking",
                json!({ "strategy": strategy_key.as_slug() }),
            )
            .await?;

        // Idempotent re-ingestion: wipe whatever a previous attempt left.
        ContentChunk::delete_by_source_id(&doc.id, &self.db).await?;

        let strategy = self.registry.get(strategy_key)?;
        let chunks = strategy
            .process(
                &self.embedder,
                &StrategyInput {
                    text: &parsed.text,
                    max_block_chars: self.config.max_characters_per_chunking_block,
                },
            )
            .await?;

        if chunks.is_empty() {
            return Err(AppError::Processing(format!(
                "ingestion produced zero chunks for document {}",
                doc.id
            )));
        }

        let persisted = self.persist_chunks(doc, chunks).await?;

        let enrichment_queued = if self.config.ingestion_enrichment_async_enabled {
            self.enqueue_deferred_enrichment(doc).await?
        } else {
            false
        };

        // The document becomes searchable as soon as chunks land; enrichment
        // never gates it.
        SourceDocument::merge_metadata(
            &self.db,
            &doc.id,
            json!({
                "searchable": { "status": "ready", "chunks_persisted": persisted },
                "enrichment": {
                    "status": if !self.config.ingestion_enrichment_async_enabled {
                        "inline"
                    } else if enrichment_queued {
                        "queued"
                    } else {
                        "already_queued"
                    },
                    "async": self.config.ingestion_enrichment_async_enabled,
                },
            }),
        )
        .await?;

        self.state.handle_success(doc, persisted).await?;
        Ok(ProcessOutcome::Processed {
            chunks_persisted: persisted,
        })
    }

    fn resolve_strategy(&self, doc: &SourceDocument) -> StrategyKey {
        let override_slug = doc
            .metadata
            .get("strategy_override")
            .and_then(|value| value.as_str())
            .or_else(|| {
                doc.metadata
                    .get("metadata")
                    .and_then(|nested| nested.get("strategy_override"))
                    .and_then(|value| value.as_str())
            });

        override_slug
            .and_then(StrategyKey::from_slug)
            .unwrap_or_else(|| StrategyKey::for_filename(&doc.filename))
    }

    async fn persist_chunks(
        &self,
        doc: &SourceDocument,
        chunks: Vec<crate::chunking::PreparedChunk>,
    ) -> Result<usize, AppError> {
        let batch_size = self.config.content_chunks_insert_batch_size.max(1);
        let total = chunks.len();
        let profile = self.embedder.profile();
        let source_standard = doc
            .metadata
            .get("source_standard")
            .and_then(|value| value.as_str())
            .map(str::to_owned);
        let authority = doc
            .metadata
            .get("authority_level")
            .and_then(|value| value.as_str())
            .and_then(AuthorityLevel::from_token)
            .unwrap_or(doc.authority_level);

        let mut persisted = 0usize;
        for (batch_index, batch) in chunks.chunks(batch_size).enumerate() {
            for (offset, prepared) in batch.iter().enumerate() {
                let chunk_index = (batch_index * batch_size + offset) as u32;
                let mut chunk = ContentChunk::new(
                    &doc.id,
                    &doc.tenant_id,
                    prepared.content.clone(),
                    chunk_index,
                    prepared.chunk_role,
                    prepared.heading_path.clone(),
                    authority,
                );
                chunk.collection_id = doc.collection_id.clone();
                chunk.is_global = doc.is_global;
                chunk.source_standard = source_standard.clone();
                chunk.clause_id = prepared.clause_id.clone();
                if let Some(section_ref) = &prepared.section_ref {
                    chunk.metadata = json!({ "section_ref": section_ref });
                }
                if prepared.embedding.is_some() {
                    chunk.embedding_profile = Some(profile.clone());
                }
                if prepared.chunk_role != ChunkRole::NormativeBody {
                    chunk.retrieval_eligible = false;
                }

                ContentChunk::store_with_embedding(chunk, prepared.embedding.clone(), &self.db)
                    .await?;
                persisted += 1;
            }
            // Short inter-batch yield keeps the worker cooperative.
            tokio::task::yield_now().await;
        }

        self.state
            .log_step(
                &doc.id,
                &format!("Persisted {persisted}/{total} chunks"),
                EventSeverity::Info,
                "persist",
                json!({ "persisted": persisted, "total": total, "batch_size": batch_size }),
            )
            .await?;

        Ok(persisted)
    }

    /// Schedule graph + RAPTOR (and optionally visual) enrichment as a
    /// deferred job, deduplicated by pending job for the same document.
    pub async fn enqueue_deferred_enrichment(
        &self,
        doc: &SourceDocument,
    ) -> Result<bool, AppError> {
        if QueueJob::pending_exists_for_document(&self.db, JobType::EnrichDocument, &doc.id).await?
        {
            return Ok(false);
        }

        QueueJob::enqueue(
            &self.db,
            JobType::EnrichDocument,
            Some(doc.tenant_id.clone()),
            json!({
                "source_document_id": doc.id,
                "tenant_id": doc.tenant_id,
                "collection_id": doc.collection_id,
                "include_visual": self.config.ingestion_visual_async_enabled,
                "include_graph": true,
                "include_raptor": true,
            }),
        )
        .await?;

        self.state
            .log_step(
                &doc.id,
                "Deferred enrichment queued (graph + RAPTOR in background)",
                EventSeverity::Info,
                "enrichment",
                json!({ "async": true }),
            )
            .await?;
        Ok(true)
    }
}

/// Refresh a document row before processing; `None` means the referenced
/// document no longer exists (handled by the lookup-requeue budget).
pub async fn load_source_record(
    db: &SurrealDbClient,
    source_document_id: &str,
) -> Result<Option<SourceDocument>, AppError> {
    let doc: Option<SourceDocument> = db.get_item(source_document_id).await?;
    if doc.is_none() {
        warn!(doc_id = source_document_id, "source document not found for job");
    }
    Ok(doc)
}

/// Status snapshot helper used by retry endpoints.
pub async fn requeue_document(
    db: &SurrealDbClient,
    doc: &SourceDocument,
) -> Result<QueueJob, AppError> {
    SourceDocument::update_status(db, &doc.id, DocumentStatus::Queued, None).await?;
    QueueJob::enqueue(
        db,
        JobType::IngestDocument,
        Some(doc.tenant_id.clone()),
        json!({ "source_document_id": doc.id }),
    )
    .await
}
