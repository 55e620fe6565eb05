//! Document state transitions paired with event-log visibility: every
//! non-trivial worker step appends an `IngestionEvent` to the document's log.

use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            ingestion_batch::IngestionBatch,
            ingestion_event::{EventSeverity, IngestionEvent},
            source_document::{DocumentStatus, SourceDocument},
        },
    },
};

pub struct IngestionStateManager {
    db: Arc<SurrealDbClient>,
    max_retries: u32,
}

impl IngestionStateManager {
    pub fn new(db: Arc<SurrealDbClient>, max_retries: u32) -> Self {
        Self { db, max_retries }
    }

    pub fn db(&self) -> &Arc<SurrealDbClient> {
        &self.db
    }

    pub async fn start_processing(&self, doc: &SourceDocument) -> Result<(), AppError> {
        SourceDocument::update_status(&self.db, &doc.id, DocumentStatus::Processing, None).await?;
        IngestionEvent::append(
            &self.db,
            &doc.id,
            &format!("Processing started for {}", doc.filename),
            EventSeverity::Info,
            "start",
            json!({ "attempt": doc.retry_count + 1 }),
        )
        .await?;
        Ok(())
    }

    pub async fn log_step(
        &self,
        doc_id: &str,
        message: &str,
        severity: EventSeverity,
        phase: &str,
        phase_metadata: serde_json::Value,
    ) -> Result<(), AppError> {
        IngestionEvent::append(&self.db, doc_id, message, severity, phase, phase_metadata).await?;
        Ok(())
    }

    pub async fn handle_success(
        &self,
        doc: &SourceDocument,
        chunks_persisted: usize,
    ) -> Result<(), AppError> {
        SourceDocument::update_status(&self.db, &doc.id, DocumentStatus::Processed, None).await?;
        IngestionEvent::append(
            &self.db,
            &doc.id,
            "Document processed",
            EventSeverity::Success,
            "complete",
            json!({ "chunks_persisted": chunks_persisted }),
        )
        .await?;
        self.record_batch_progress(doc, true).await;
        info!(doc_id = %doc.id, chunks_persisted, "document processed");
        Ok(())
    }

    /// Terminal success for uploads that were valid but had no extractable
    /// content; there is nothing to retry.
    pub async fn handle_empty_file(&self, doc: &SourceDocument) -> Result<(), AppError> {
        SourceDocument::update_status(&self.db, &doc.id, DocumentStatus::EmptyFile, None).await?;
        IngestionEvent::append(
            &self.db,
            &doc.id,
            "Source file contained no extractable content",
            EventSeverity::Warning,
            "complete",
            json!({}),
        )
        .await?;
        self.record_batch_progress(doc, true).await;
        Ok(())
    }

    /// Record a processing failure on the document: retry budget decides
    /// between requeue and dead letter. The returned status tells the caller
    /// whether the failure is final.
    pub async fn handle_error(
        &self,
        doc: &SourceDocument,
        error: &AppError,
    ) -> Result<DocumentStatus, AppError> {
        let message = error.to_string();
        let status =
            SourceDocument::mark_failed(&self.db, &doc.id, &message, self.max_retries).await?;
        IngestionEvent::append(
            &self.db,
            &doc.id,
            &message,
            EventSeverity::Error,
            "error",
            json!({
                "terminal": status == DocumentStatus::DeadLetter,
                "transient": error.is_transient(),
            }),
        )
        .await?;

        if status == DocumentStatus::DeadLetter {
            self.record_batch_progress(doc, false).await;
        }

        warn!(doc_id = %doc.id, status = ?status, error = %message, "document failed");
        Ok(status)
    }

    /// Batch counters are best-effort; a failed update must not fail the job.
    /// An auto-seal batch seals its collection once it reaches a terminal
    /// status.
    async fn record_batch_progress(&self, doc: &SourceDocument, success: bool) {
        let Some(batch_id) = doc.batch_id.as_deref() else {
            return;
        };
        match IngestionBatch::record_progress(&self.db, batch_id, success).await {
            Ok(Some(batch)) if batch.status.is_terminal() && batch.auto_seal => {
                if let Err(err) =
                    common::storage::types::collection::Collection::seal(
                        &self.db,
                        &batch.collection_id,
                    )
                    .await
                {
                    warn!(batch_id, error = %err, "auto-seal failed");
                }
            }
            Ok(_) => {}
            Err(err) => {
                warn!(batch_id, error = %err, "failed to record batch progress");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::storage::types::ingestion_batch::BatchStatus;
    use uuid::Uuid;

    async fn setup() -> (Arc<SurrealDbClient>, IngestionStateManager) {
        let database = Uuid::new_v4().to_string();
        let db = Arc::new(
            SurrealDbClient::memory("state_ns", &database)
                .await
                .expect("in-memory db"),
        );
        db.ensure_initialized().await.expect("schema");
        let manager = IngestionStateManager::new(Arc::clone(&db), 2);
        (db, manager)
    }

    async fn seed_doc(db: &SurrealDbClient, batch_id: Option<String>) -> SourceDocument {
        let mut doc = SourceDocument::new("t1", "a.pdf", "t1/c/b/a.pdf", "bucket");
        doc.batch_id = batch_id;
        doc.status = DocumentStatus::Queued;
        db.store_item(doc.clone()).await.expect("store doc");
        doc
    }

    #[tokio::test]
    async fn success_path_transitions_and_logs() {
        let (db, manager) = setup().await;
        let doc = seed_doc(&db, None).await;

        manager.start_processing(&doc).await.expect("start");
        let processing: SourceDocument = db.get_item(&doc.id).await.expect("get").expect("row");
        assert_eq!(processing.status, DocumentStatus::Processing);

        manager.handle_success(&doc, 12).await.expect("success");
        let processed: SourceDocument = db.get_item(&doc.id).await.expect("get").expect("row");
        assert_eq!(processed.status, DocumentStatus::Processed);

        let events = IngestionEvent::list_after(&db, &doc.id, None, 10)
            .await
            .expect("events");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].phase, "start");
        assert_eq!(events[1].severity, EventSeverity::Success);
    }

    #[tokio::test]
    async fn error_path_retries_then_dead_letters_and_updates_batch() {
        let (db, manager) = setup().await;
        let batch = IngestionBatch::new("t1", "c1", 1, false, json!({}));
        let batch_id = batch.id.clone();
        db.store_item(batch).await.expect("store batch");
        let doc = seed_doc(&db, Some(batch_id.clone())).await;

        let first = manager
            .handle_error(&doc, &AppError::Processing("parse failed".into()))
            .await
            .expect("first error");
        assert_eq!(first, DocumentStatus::Queued);

        let batch_row: IngestionBatch = db.get_item(&batch_id).await.expect("get").expect("row");
        assert_eq!(batch_row.status, BatchStatus::Pending, "retryable failure leaves batch open");

        let second = manager
            .handle_error(&doc, &AppError::Processing("parse failed again".into()))
            .await
            .expect("second error");
        assert_eq!(second, DocumentStatus::DeadLetter);

        let batch_row: IngestionBatch = db.get_item(&batch_id).await.expect("get").expect("row");
        assert_eq!(batch_row.status, BatchStatus::Failed);
        assert_eq!(batch_row.failed, 1);
    }

    #[tokio::test]
    async fn empty_file_is_terminal_success() {
        let (db, manager) = setup().await;
        let doc = seed_doc(&db, None).await;

        manager.handle_empty_file(&doc).await.expect("empty file");
        let row: SourceDocument = db.get_item(&doc.id).await.expect("get").expect("row");
        assert_eq!(row.status, DocumentStatus::EmptyFile);
        assert!(row.status.is_terminal());
    }
}
