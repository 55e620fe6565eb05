use surrealdb::opt::PatchOp;
use uuid::Uuid;

use crate::{
    error::AppError, storage::db::SurrealDbClient, stored_object, utils::authority::AuthorityLevel,
};

/// Lifecycle of an uploaded document.
///
/// `empty_file` is a terminal success variant: the upload was valid but had
/// no extractable content, so there is nothing to retry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    PendingIngestion,
    Queued,
    Processing,
    Processed,
    Failed,
    DeadLetter,
    EmptyFile,
}

impl DocumentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Processed | Self::DeadLetter | Self::EmptyFile
        )
    }

    pub fn as_token(self) -> &'static str {
        match self {
            Self::PendingIngestion => "pending_ingestion",
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Processed => "processed",
            Self::Failed => "failed",
            Self::DeadLetter => "dead_letter",
            Self::EmptyFile => "empty_file",
        }
    }
}

/// Statuses that count against the tenant's backpressure budget.
pub const PENDING_STATUSES: [DocumentStatus; 3] = [
    DocumentStatus::PendingIngestion,
    DocumentStatus::Queued,
    DocumentStatus::Processing,
];

stored_object!(SourceDocument, "source_document", {
    tenant_id: String,
    collection_id: Option<String>,
    batch_id: Option<String>,
    filename: String,
    storage_path: String,
    storage_bucket: String,
    status: DocumentStatus,
    metadata: serde_json::Value,
    authority_level: AuthorityLevel,
    retry_count: u32,
    source_lookup_requeues: u32,
    error_message: Option<String>,
    is_global: bool
});

impl SourceDocument {
    pub fn new(
        tenant_id: impl Into<String>,
        filename: impl Into<String>,
        storage_path: impl Into<String>,
        storage_bucket: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            tenant_id: tenant_id.into(),
            collection_id: None,
            batch_id: None,
            filename: filename.into(),
            storage_path: storage_path.into(),
            storage_bucket: storage_bucket.into(),
            status: DocumentStatus::PendingIngestion,
            metadata: serde_json::Value::Object(serde_json::Map::new()),
            authority_level: AuthorityLevel::Supplementary,
            retry_count: 0,
            source_lookup_requeues: 0,
            error_message: None,
            is_global: false,
        }
    }

    /// Fetch a document and reject rows belonging to another tenant.
    pub async fn get_for_tenant(
        db: &SurrealDbClient,
        id: &str,
        tenant_id: &str,
    ) -> Result<Option<Self>, AppError> {
        let document: Option<Self> = db.get_item(id).await?;
        match document {
            Some(doc) if doc.tenant_id == tenant_id => Ok(Some(doc)),
            Some(_) | None => Ok(None),
        }
    }

    pub async fn list_for_tenant(
        db: &SurrealDbClient,
        tenant_id: &str,
        limit: usize,
    ) -> Result<Vec<Self>, AppError> {
        let documents: Vec<Self> = db
            .query(
                "SELECT * FROM type::table($table) WHERE tenant_id = $tenant_id \
                 ORDER BY created_at DESC LIMIT $limit",
            )
            .bind(("table", Self::table_name()))
            .bind(("tenant_id", tenant_id.to_owned()))
            .bind(("limit", limit as i64))
            .await?
            .take(0)?;
        Ok(documents)
    }

    pub async fn update_status(
        db: &SurrealDbClient,
        id: &str,
        status: DocumentStatus,
        error_message: Option<String>,
    ) -> Result<(), AppError> {
        let _doc: Option<Self> = db
            .update((Self::table_name(), id))
            .patch(PatchOp::replace("/status", status))
            .patch(PatchOp::replace("/error_message", error_message))
            .patch(PatchOp::replace(
                "/updated_at",
                surrealdb::sql::Datetime::default(),
            ))
            .await?;
        Ok(())
    }

    pub async fn merge_metadata(
        db: &SurrealDbClient,
        id: &str,
        patch: serde_json::Value,
    ) -> Result<(), AppError> {
        let Some(mut doc) = db.get_item::<Self>(id).await? else {
            return Err(AppError::NotFound(format!("source document {id}")));
        };

        if let (Some(current), Some(incoming)) = (doc.metadata.as_object_mut(), patch.as_object())
        {
            for (key, value) in incoming {
                current.insert(key.clone(), value.clone());
            }
        } else if patch.is_object() {
            doc.metadata = patch;
        }

        let _doc: Option<Self> = db
            .update((Self::table_name(), id))
            .patch(PatchOp::replace("/metadata", doc.metadata))
            .patch(PatchOp::replace(
                "/updated_at",
                surrealdb::sql::Datetime::default(),
            ))
            .await?;
        Ok(())
    }

    /// Record a processing failure: requeue while retries remain, otherwise
    /// park the document in the dead letter state.
    pub async fn mark_failed(
        db: &SurrealDbClient,
        id: &str,
        error_message: &str,
        max_retries: u32,
    ) -> Result<DocumentStatus, AppError> {
        let Some(doc) = db.get_item::<Self>(id).await? else {
            return Err(AppError::NotFound(format!("source document {id}")));
        };

        let retry_count = doc.retry_count.saturating_add(1);
        let next_status = if retry_count >= max_retries {
            DocumentStatus::DeadLetter
        } else {
            DocumentStatus::Queued
        };

        let _doc: Option<Self> = db
            .update((Self::table_name(), id))
            .patch(PatchOp::replace("/retry_count", retry_count))
            .patch(PatchOp::replace(
                "/status",
                if next_status == DocumentStatus::DeadLetter {
                    DocumentStatus::DeadLetter
                } else {
                    DocumentStatus::Failed
                },
            ))
            .patch(PatchOp::replace(
                "/error_message",
                Some(error_message.to_owned()),
            ))
            .patch(PatchOp::replace(
                "/updated_at",
                surrealdb::sql::Datetime::default(),
            ))
            .await?;

        // A failed-but-retryable document goes straight back to the queue so
        // the next poll can claim it.
        if next_status == DocumentStatus::Queued {
            Self::update_status(db, id, DocumentStatus::Queued, Some(error_message.to_owned()))
                .await?;
        }

        Ok(next_status)
    }

    /// Count pending documents for a tenant, scanning at most `cap` rows.
    pub async fn count_pending(
        db: &SurrealDbClient,
        tenant_id: &str,
        cap: usize,
    ) -> Result<usize, AppError> {
        #[derive(Deserialize)]
        struct IdRow {
            #[serde(deserialize_with = "deserialize_flexible_id")]
            #[allow(dead_code)]
            id: String,
        }

        let statuses: Vec<String> = PENDING_STATUSES
            .iter()
            .map(|status| status.as_token().to_owned())
            .collect();

        let rows: Vec<IdRow> = db
            .query(
                "SELECT id FROM type::table($table) \
                 WHERE tenant_id = $tenant_id AND status IN $statuses LIMIT $cap",
            )
            .bind(("table", Self::table_name()))
            .bind(("tenant_id", tenant_id.to_owned()))
            .bind(("statuses", statuses))
            .bind(("cap", cap as i64))
            .await?
            .take(0)?;

        Ok(rows.len())
    }

    pub async fn delete_cascade(
        db: &SurrealDbClient,
        id: &str,
        purge_chunks: bool,
    ) -> Result<(), AppError> {
        if purge_chunks {
            db.query(
                "DELETE content_chunk_embedding WHERE source_id = $source_id;
                 DELETE content_chunk WHERE source_id = $source_id;
                 DELETE node_provenance WHERE chunk_id IN \
                    (SELECT VALUE id FROM content_chunk WHERE source_id = $source_id);
                 DELETE summary_node WHERE source_document_id = $source_id;
                 DELETE summary_node_embedding WHERE source_document_id = $source_id;",
            )
            .bind(("source_id", id.to_owned()))
            .await?
            .check()?;
        }

        db.query("DELETE ingestion_event WHERE source_document_id = $source_id;")
            .bind(("source_id", id.to_owned()))
            .await?
            .check()?;

        let _doc: Option<Self> = db.delete_item(id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    async fn setup_db() -> SurrealDbClient {
        let database = Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("source_doc_ns", &database)
            .await
            .expect("in-memory db");
        db.ensure_initialized().await.expect("schema");
        db
    }

    #[tokio::test]
    async fn get_for_tenant_hides_foreign_rows() {
        let db = setup_db().await;
        let doc = SourceDocument::new("t1", "a.pdf", "t1/c/b/a.pdf", "bucket");
        db.store_item(doc.clone()).await.expect("store");

        let own = SourceDocument::get_for_tenant(&db, &doc.id, "t1")
            .await
            .expect("query");
        assert!(own.is_some());

        let foreign = SourceDocument::get_for_tenant(&db, &doc.id, "t2")
            .await
            .expect("query");
        assert!(foreign.is_none(), "other tenant must not see the row");
    }

    #[tokio::test]
    async fn mark_failed_requeues_then_dead_letters() {
        let db = setup_db().await;
        let doc = SourceDocument::new("t1", "a.pdf", "t1/c/b/a.pdf", "bucket");
        let id = doc.id.clone();
        db.store_item(doc).await.expect("store");

        let status = SourceDocument::mark_failed(&db, &id, "parse blew up", 2)
            .await
            .expect("first failure");
        assert_eq!(status, DocumentStatus::Queued);

        let stored: SourceDocument = db.get_item(&id).await.expect("get").expect("exists");
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.status, DocumentStatus::Queued);

        let status = SourceDocument::mark_failed(&db, &id, "parse blew up again", 2)
            .await
            .expect("second failure");
        assert_eq!(status, DocumentStatus::DeadLetter);

        let stored: SourceDocument = db.get_item(&id).await.expect("get").expect("exists");
        assert_eq!(stored.status, DocumentStatus::DeadLetter);
        assert_eq!(stored.retry_count, 2);
        assert_eq!(stored.error_message.as_deref(), Some("parse blew up again"));
    }

    #[tokio::test]
    async fn count_pending_respects_cap() {
        let db = setup_db().await;
        for index in 0..4 {
            let mut doc = SourceDocument::new(
                "t1",
                format!("f{index}.pdf"),
                format!("t1/c/b/f{index}.pdf"),
                "bucket",
            );
            doc.status = DocumentStatus::Queued;
            db.store_item(doc).await.expect("store");
        }

        let full = SourceDocument::count_pending(&db, "t1", 10).await.expect("count");
        assert_eq!(full, 4);

        let capped = SourceDocument::count_pending(&db, "t1", 2).await.expect("count");
        assert_eq!(capped, 2);
    }

    #[test]
    fn terminal_statuses() {
        assert!(DocumentStatus::Processed.is_terminal());
        assert!(DocumentStatus::DeadLetter.is_terminal());
        assert!(DocumentStatus::EmptyFile.is_terminal());
        assert!(!DocumentStatus::Failed.is_terminal());
        assert!(!DocumentStatus::Queued.is_terminal());
    }
}
