use serde::{Deserialize, Serialize};

use crate::{
    error::AppError,
    storage::{db::SurrealDbClient, types::source_document::SourceDocument},
    utils::config::AppConfig,
};

/// Advisory admission snapshot returned to clients alongside uploads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub queue_depth: usize,
    pub max_pending: usize,
    pub estimated_wait_seconds: u64,
}

/// Per-tenant pending-count admission decisions.
///
/// Decisions are advisory for the client and never block in-flight work.
#[derive(Debug, Clone)]
pub struct BackpressureService {
    max_pending: usize,
    per_document_estimate_secs: u64,
}

impl BackpressureService {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_pending: config.ingestion_max_pending.max(1),
            per_document_estimate_secs: config.ingestion_per_document_estimate_secs,
        }
    }

    pub fn new(max_pending: usize, per_document_estimate_secs: u64) -> Self {
        Self {
            max_pending: max_pending.max(1),
            per_document_estimate_secs,
        }
    }

    /// Count pending documents for the tenant, capped at `max_pending` scans.
    pub async fn get_pending_snapshot(
        &self,
        db: &SurrealDbClient,
        tenant_id: &str,
    ) -> Result<QueueSnapshot, AppError> {
        let queue_depth =
            SourceDocument::count_pending(db, tenant_id, self.max_pending).await?;

        Ok(QueueSnapshot {
            queue_depth,
            max_pending: self.max_pending,
            estimated_wait_seconds: queue_depth as u64 * self.per_document_estimate_secs,
        })
    }

    /// Fail with `INGESTION_BACKPRESSURE` when the tenant queue is saturated.
    pub async fn enforce_limit(
        &self,
        db: &SurrealDbClient,
        tenant_id: &str,
    ) -> Result<QueueSnapshot, AppError> {
        let snapshot = self.get_pending_snapshot(db, tenant_id).await?;
        if snapshot.queue_depth >= snapshot.max_pending {
            return Err(AppError::Backpressure {
                queue_depth: snapshot.queue_depth,
                max_pending: snapshot.max_pending,
                estimated_wait_seconds: snapshot.estimated_wait_seconds,
            });
        }
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::source_document::{DocumentStatus, SourceDocument};
    use uuid::Uuid;

    async fn setup_db() -> SurrealDbClient {
        let database = Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("backpressure_ns", &database)
            .await
            .expect("in-memory db");
        db.ensure_initialized().await.expect("schema");
        db
    }

    #[tokio::test]
    async fn snapshot_counts_only_pending_states_for_tenant() {
        let db = setup_db().await;
        let service = BackpressureService::new(5, 45);

        for status in [
            DocumentStatus::Queued,
            DocumentStatus::Processing,
            DocumentStatus::Processed,
        ] {
            let mut doc = SourceDocument::new("t1", "file.pdf", "t1/a/b/file.pdf", "bucket");
            doc.status = status;
            db.store_item(doc).await.expect("store doc");
        }
        let mut other = SourceDocument::new("t2", "other.pdf", "t2/a/b/other.pdf", "bucket");
        other.status = DocumentStatus::Queued;
        db.store_item(other).await.expect("store other tenant doc");

        let snapshot = service.get_pending_snapshot(&db, "t1").await.expect("snapshot");
        assert_eq!(snapshot.queue_depth, 2);
        assert_eq!(snapshot.max_pending, 5);
        assert_eq!(snapshot.estimated_wait_seconds, 90);
    }

    #[tokio::test]
    async fn enforce_limit_trips_when_saturated() {
        let db = setup_db().await;
        let service = BackpressureService::new(1, 30);

        let mut doc = SourceDocument::new("t1", "file.pdf", "t1/a/b/file.pdf", "bucket");
        doc.status = DocumentStatus::PendingIngestion;
        db.store_item(doc).await.expect("store doc");

        let err = service.enforce_limit(&db, "t1").await.expect_err("saturated");
        assert!(matches!(
            err,
            AppError::Backpressure {
                queue_depth: 1,
                max_pending: 1,
                ..
            }
        ));

        // Another tenant is unaffected.
        service.enforce_limit(&db, "t2").await.expect("t2 admitted");
    }
}
