//! Job handlers behind the worker loops: slot acquisition, source-record
//! lookup with its requeue budget, and routing to the document processor,
//! enrichment pipeline, or community worker.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{job::QueueJob, source_document::SourceDocument},
    },
    utils::config::AppConfig,
};

use crate::{
    community::CommunityWorker,
    concurrency::{SlotDenied, TenantConcurrencyManager},
    enrichment::{EnrichmentPipeline, EnrichmentRequest},
    processor::{load_source_record, DocumentProcessor, ProcessOutcome},
};

/// How a handled job should be finalized by the worker loop.
#[derive(Debug)]
pub enum HandleOutcome {
    Completed(serde_json::Value),
    /// The referenced source document could not be found; retry under the
    /// lookup budget instead of the normal retry budget.
    RequeueSourceLookup,
}

pub struct JobDispatcher {
    db: Arc<SurrealDbClient>,
    processor: Arc<DocumentProcessor>,
    enrichment: Arc<EnrichmentPipeline>,
    community: Arc<CommunityWorker>,
    concurrency: TenantConcurrencyManager,
    global_semaphore: Arc<Semaphore>,
    enrichment_concurrency: TenantConcurrencyManager,
}

impl JobDispatcher {
    pub fn new(
        db: Arc<SurrealDbClient>,
        processor: Arc<DocumentProcessor>,
        enrichment: Arc<EnrichmentPipeline>,
        community: Arc<CommunityWorker>,
        config: &AppConfig,
    ) -> Self {
        Self {
            db,
            processor,
            enrichment,
            community,
            concurrency: TenantConcurrencyManager::new(config.tenant_max_concurrency),
            global_semaphore: Arc::new(Semaphore::new(config.global_max_concurrency.max(1))),
            enrichment_concurrency: TenantConcurrencyManager::new(
                config.enrichment_tenant_max_concurrency,
            ),
        }
    }

    pub fn db(&self) -> &Arc<SurrealDbClient> {
        &self.db
    }

    pub async fn handle_ingestion(&self, job: &QueueJob) -> Result<HandleOutcome, AppError> {
        let Some(record) = self.prepare_source_record(job).await? else {
            return Ok(HandleOutcome::RequeueSourceLookup);
        };

        let slot = self
            .concurrency
            .acquire(&record.tenant_id, &record.id, &self.global_semaphore)
            .await?;
        let slot = match slot {
            Ok(slot) => slot,
            Err(SlotDenied::AlreadyProcessing) => {
                debug!(doc_id = %record.id, "document already processing");
                return Ok(HandleOutcome::Completed(
                    json!({ "ok": false, "reason": "already_processing" }),
                ));
            }
        };

        info!(
            doc_id = slot.document_id(),
            active_documents = self.concurrency.active_document_count(),
            "ingestion slot acquired"
        );

        let outcome = self.processor.process(&record).await?;
        let result = match outcome {
            ProcessOutcome::Processed { chunks_persisted } => json!({
                "ok": true,
                "source_document_id": record.id,
                "chunks_persisted": chunks_persisted,
            }),
            ProcessOutcome::EmptyFile => json!({
                "ok": true,
                "source_document_id": record.id,
                "status": "empty_file",
            }),
            ProcessOutcome::SkippedByPolicy => json!({
                "ok": false,
                "source_document_id": record.id,
                "reason": "skipped_by_policy",
            }),
        };
        Ok(HandleOutcome::Completed(result))
    }

    pub async fn handle_enrichment(&self, job: &QueueJob) -> Result<HandleOutcome, AppError> {
        let request: EnrichmentRequest = serde_json::from_value(job.payload.clone())
            .map_err(|err| AppError::Validation(format!("invalid enrichment payload: {err}")))?;

        let Some(record) = load_source_record(&self.db, &request.source_document_id).await? else {
            return Ok(HandleOutcome::RequeueSourceLookup);
        };

        let slot = self
            .enrichment_concurrency
            .acquire(&record.tenant_id, &record.id, &self.global_semaphore)
            .await?;
        let _slot = match slot {
            Ok(slot) => slot,
            Err(SlotDenied::AlreadyProcessing) => {
                return Ok(HandleOutcome::Completed(
                    json!({ "ok": false, "reason": "already_processing" }),
                ));
            }
        };

        let mut request = request;
        if request.tenant_id.is_none() {
            request.tenant_id = Some(record.tenant_id.clone());
        }
        if request.collection_id.is_none() {
            request.collection_id = record.collection_id.clone();
        }

        let result = self.enrichment.run_deferred_enrichment(&request).await?;
        Ok(HandleOutcome::Completed(result))
    }

    pub async fn handle_community(&self, job: &QueueJob) -> Result<HandleOutcome, AppError> {
        let tenant_id = job
            .payload
            .get("tenant_id")
            .and_then(|value| value.as_str())
            .or(job.tenant_id.as_deref())
            .unwrap_or_default()
            .to_owned();
        if tenant_id.trim().is_empty() {
            return Err(AppError::Validation(
                "community rebuild requires a tenant_id".into(),
            ));
        }

        let stats = self.community.rebuild_tenant(&tenant_id).await?;
        Ok(HandleOutcome::Completed(json!({
            "ok": true,
            "tenant_id": tenant_id,
            "stats": serde_json::to_value(stats)?,
        })))
    }

    async fn prepare_source_record(
        &self,
        job: &QueueJob,
    ) -> Result<Option<SourceDocument>, AppError> {
        let doc_id = job
            .payload
            .get("source_document_id")
            .and_then(|value| value.as_str())
            .unwrap_or_default();
        if doc_id.is_empty() {
            return Err(AppError::Validation(
                "job payload missing source_document_id".into(),
            ));
        }
        load_source_record(&self.db, doc_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChunkGraphExtraction, ModelServices};
    use crate::parser::PlainTextParser;
    use async_trait::async_trait;
    use bytes::Bytes;
    use common::storage::indexes::ensure_runtime_indexes;
    use common::storage::store::StorageManager;
    use common::storage::types::job::JobType;
    use common::storage::types::source_document::DocumentStatus;
    use common::utils::config::StorageKind;
    use common::utils::embedding::EmbeddingProvider;
    use uuid::Uuid;

    struct StubModels;

    #[async_trait]
    impl ModelServices for StubModels {
        async fn extract_graph(&self, _batch: &str) -> Result<ChunkGraphExtraction, AppError> {
            Ok(ChunkGraphExtraction::default())
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

    async fn setup() -> (JobDispatcher, Arc<SurrealDbClient>, StorageManager) {
        let database = Uuid::new_v4().to_string();
        let db = Arc::new(
            SurrealDbClient::memory("dispatcher_ns", &database)
                .await
                .expect("in-memory db"),
        );
        db.ensure_initialized().await.expect("schema");
        ensure_runtime_indexes(&db, 16).await.expect("indexes");

        let config = Arc::new(AppConfig {
            storage: StorageKind::Memory,
            ..AppConfig::default()
        });
        let storage = StorageManager::new(&config).await.expect("storage");
        let embedder = Arc::new(EmbeddingProvider::new_hashed(16).expect("embedder"));
        let models: Arc<dyn ModelServices> = Arc::new(StubModels);

        let processor = Arc::new(DocumentProcessor::new(
            Arc::clone(&db),
            storage.clone(),
            Arc::clone(&embedder),
            Arc::new(PlainTextParser),
            Arc::clone(&config),
        ));
        let enrichment = Arc::new(EnrichmentPipeline::new(
            Arc::clone(&db),
            Arc::clone(&embedder),
            Arc::clone(&models),
            Arc::clone(&config),
        ));
        let community = Arc::new(CommunityWorker::new(
            Arc::clone(&db),
            Arc::clone(&embedder),
            models,
        ));

        let dispatcher =
            JobDispatcher::new(Arc::clone(&db), processor, enrichment, community, &config);
        (dispatcher, db, storage)
    }

    #[tokio::test]
    async fn ingestion_job_without_source_document_requeues_lookup() {
        let (dispatcher, db, _storage) = setup().await;
        let job = QueueJob::enqueue(
            &db,
            JobType::IngestDocument,
            Some("t1".into()),
            json!({ "source_document_id": "gone" }),
        )
        .await
        .expect("enqueue");

        let outcome = dispatcher.handle_ingestion(&job).await.expect("handle");
        assert!(matches!(outcome, HandleOutcome::RequeueSourceLookup));
    }

    #[tokio::test]
    async fn ingestion_job_processes_document() {
        let (dispatcher, db, storage) = setup().await;
        let mut doc = SourceDocument::new("t1", "doc.md", "t1/c/b/doc.md", "bucket");
        doc.status = DocumentStatus::Queued;
        storage
            .put(
                &doc.storage_path,
                Bytes::from_static(b"# Heading\n\nBody content for the pipeline."),
            )
            .await
            .expect("upload");
        db.store_item(doc.clone()).await.expect("store doc");

        let job = QueueJob::enqueue(
            &db,
            JobType::IngestDocument,
            Some("t1".into()),
            json!({ "source_document_id": doc.id }),
        )
        .await
        .expect("enqueue");

        let outcome = dispatcher.handle_ingestion(&job).await.expect("handle");
        let HandleOutcome::Completed(result) = outcome else {
            panic!("expected completion");
        };
        assert_eq!(result["ok"], true);
        assert!(result["chunks_persisted"].as_u64().unwrap_or(0) > 0);
    }

    #[tokio::test]
    async fn community_job_requires_tenant() {
        let (dispatcher, db, _storage) = setup().await;
        let job = QueueJob::enqueue(&db, JobType::CommunityRebuild, None, json!({}))
            .await
            .expect("enqueue");
        let err = dispatcher.handle_community(&job).await.expect_err("no tenant");
        assert!(matches!(err, AppError::Validation(_)));

        let job = QueueJob::enqueue(
            &db,
            JobType::CommunityRebuild,
            Some("t1".into()),
            json!({ "tenant_id": "t1" }),
        )
        .await
        .expect("enqueue");
        let outcome = dispatcher.handle_community(&job).await.expect("handle");
        assert!(matches!(outcome, HandleOutcome::Completed(_)));
    }
}
