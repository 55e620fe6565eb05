use surrealdb::opt::PatchOp;
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
    Partial,
    Failed,
}

impl BatchStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Partial | Self::Failed)
    }
}

stored_object!(IngestionBatch, "ingestion_batch", {
    tenant_id: String,
    collection_id: String,
    total_files: u32,
    completed: u32,
    failed: u32,
    status: BatchStatus,
    auto_seal: bool,
    stalled: bool,
    metadata: serde_json::Value
});

impl IngestionBatch {
    pub fn new(
        tenant_id: impl Into<String>,
        collection_id: impl Into<String>,
        total_files: u32,
        auto_seal: bool,
        metadata: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            tenant_id: tenant_id.into(),
            collection_id: collection_id.into(),
            total_files,
            completed: 0,
            failed: 0,
            status: BatchStatus::Pending,
            auto_seal,
            stalled: false,
            metadata,
        }
    }

    pub async fn get_for_tenant(
        db: &SurrealDbClient,
        id: &str,
        tenant_id: &str,
    ) -> Result<Option<Self>, AppError> {
        let batch: Option<Self> = db.get_item(id).await?;
        Ok(batch.filter(|row| row.tenant_id == tenant_id))
    }

    /// Record one finished document. Terminal statuses are monotonic: once a
    /// batch reads `completed|partial|failed`, further progress is ignored.
    pub async fn record_progress(
        db: &SurrealDbClient,
        id: &str,
        success: bool,
    ) -> Result<Option<Self>, AppError> {
        let Some(batch) = db.get_item::<Self>(id).await? else {
            return Ok(None);
        };
        if batch.status.is_terminal() {
            return Ok(Some(batch));
        }

        let completed = batch.completed + u32::from(success);
        let failed = batch.failed + u32::from(!success);

        let status = if completed + failed >= batch.total_files {
            if failed == 0 {
                BatchStatus::Completed
            } else if completed == 0 {
                BatchStatus::Failed
            } else {
                BatchStatus::Partial
            }
        } else {
            BatchStatus::Processing
        };

        let updated: Option<Self> = db
            .update((Self::table_name(), id))
            .patch(PatchOp::replace("/completed", completed))
            .patch(PatchOp::replace("/failed", failed))
            .patch(PatchOp::replace("/status", status))
            .patch(PatchOp::replace(
                "/updated_at",
                surrealdb::sql::Datetime::default(),
            ))
            .await?;
        Ok(updated)
    }

    /// Grow the expected file count as uploads land in the batch.
    pub async fn add_expected_files(
        db: &SurrealDbClient,
        id: &str,
        additional: u32,
    ) -> Result<Option<Self>, AppError> {
        let Some(batch) = db.get_item::<Self>(id).await? else {
            return Ok(None);
        };
        if batch.status.is_terminal() {
            return Ok(Some(batch));
        }
        let updated: Option<Self> = db
            .update((Self::table_name(), id))
            .patch(PatchOp::replace(
                "/total_files",
                batch.total_files + additional,
            ))
            .patch(PatchOp::replace(
                "/updated_at",
                surrealdb::sql::Datetime::default(),
            ))
            .await?;
        Ok(updated)
    }

    /// Visibility flag flipped when the event stream has been silent too long.
    pub async fn mark_stalled(
        db: &SurrealDbClient,
        id: &str,
        stalled: bool,
    ) -> Result<(), AppError> {
        let _batch: Option<Self> = db
            .update((Self::table_name(), id))
            .patch(PatchOp::replace("/stalled", stalled))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    async fn setup_db() -> SurrealDbClient {
        let database = Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("batch_ns", &database)
            .await
            .expect("in-memory db");
        db.ensure_initialized().await.expect("schema");
        db
    }

    #[tokio::test]
    async fn progress_reaches_completed() {
        let db = setup_db().await;
        let batch = IngestionBatch::new("t1", "c1", 2, false, serde_json::json!({}));
        let id = batch.id.clone();
        db.store_item(batch).await.expect("store");

        let after_one = IngestionBatch::record_progress(&db, &id, true)
            .await
            .expect("progress")
            .expect("row");
        assert_eq!(after_one.status, BatchStatus::Processing);
        assert_eq!(after_one.completed, 1);

        let after_two = IngestionBatch::record_progress(&db, &id, true)
            .await
            .expect("progress")
            .expect("row");
        assert_eq!(after_two.status, BatchStatus::Completed);
    }

    #[tokio::test]
    async fn mixed_outcomes_yield_partial() {
        let db = setup_db().await;
        let batch = IngestionBatch::new("t1", "c1", 2, false, serde_json::json!({}));
        let id = batch.id.clone();
        db.store_item(batch).await.expect("store");

        IngestionBatch::record_progress(&db, &id, true)
            .await
            .expect("progress");
        let final_state = IngestionBatch::record_progress(&db, &id, false)
            .await
            .expect("progress")
            .expect("row");
        assert_eq!(final_state.status, BatchStatus::Partial);
        assert_eq!(final_state.completed, 1);
        assert_eq!(final_state.failed, 1);
    }

    #[tokio::test]
    async fn terminal_status_is_monotonic() {
        let db = setup_db().await;
        let batch = IngestionBatch::new("t1", "c1", 1, false, serde_json::json!({}));
        let id = batch.id.clone();
        db.store_item(batch).await.expect("store");

        let terminal = IngestionBatch::record_progress(&db, &id, false)
            .await
            .expect("progress")
            .expect("row");
        assert_eq!(terminal.status, BatchStatus::Failed);

        // Late duplicate progress reports must not change the terminal state.
        let after = IngestionBatch::record_progress(&db, &id, true)
            .await
            .expect("progress")
            .expect("row");
        assert_eq!(after.status, BatchStatus::Failed);
        assert_eq!(after.completed, 0);
    }
}
