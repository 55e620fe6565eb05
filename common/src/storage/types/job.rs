use chrono::Duration as ChronoDuration;
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

pub const DEFAULT_LEASE_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    IngestDocument,
    EnrichDocument,
    CommunityRebuild,
}

impl JobType {
    pub fn as_token(self) -> &'static str {
        match self {
            Self::IngestDocument => "ingest_document",
            Self::EnrichDocument => "enrich_document",
            Self::CommunityRebuild => "community_rebuild",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    DeadLetter,
}

impl JobStatus {
    pub fn is_final(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::DeadLetter)
    }
}

stored_object!(QueueJob, "job_queue", {
    tenant_id: Option<String>,
    job_type: JobType,
    status: JobStatus,
    payload: serde_json::Value,
    result: Option<serde_json::Value>,
    error_message: Option<String>,
    lease_holder: Option<String>,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    lease_expires_at: Option<DateTime<Utc>>,
    retry_count: u32,
    source_lookup_requeues: u32
});

impl QueueJob {
    pub fn new(job_type: JobType, tenant_id: Option<String>, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            tenant_id,
            job_type,
            status: JobStatus::Pending,
            payload,
            result: None,
            error_message: None,
            lease_holder: None,
            lease_expires_at: None,
            retry_count: 0,
            source_lookup_requeues: 0,
        }
    }

    pub async fn enqueue(
        db: &SurrealDbClient,
        job_type: JobType,
        tenant_id: Option<String>,
        payload: serde_json::Value,
    ) -> Result<Self, AppError> {
        let job = Self::new(job_type, tenant_id, payload);
        let stored = db.store_item(job.clone()).await?;
        Ok(stored.unwrap_or(job))
    }

    /// Claim the oldest pending job of the given type.
    ///
    /// The claim is a compare-and-set: a candidate id is selected, then the
    /// transition `pending → processing` is applied conditionally. An empty
    /// update means another worker won the row and the next candidate is
    /// tried.
    pub async fn fetch_next(
        db: &SurrealDbClient,
        job_type: JobType,
        worker_id: &str,
        lease: std::time::Duration,
    ) -> Result<Option<Self>, AppError> {
        #[derive(Deserialize)]
        struct IdRow {
            #[serde(deserialize_with = "deserialize_flexible_id")]
            id: String,
        }

        let candidates: Vec<IdRow> = db
            .query(
                "SELECT id FROM type::table($table) \
                 WHERE job_type = $job_type AND status = 'pending' \
                 ORDER BY created_at ASC LIMIT 5",
            )
            .bind(("table", Self::table_name()))
            .bind(("job_type", job_type))
            .await?
            .take(0)?;

        let expires = Utc::now()
            + ChronoDuration::from_std(lease).unwrap_or_else(|_| ChronoDuration::seconds(60));

        for candidate in candidates {
            let claimed: Vec<Self> = db
                .query(
                    "UPDATE type::thing($table, $id) SET \
                        status = 'processing', \
                        lease_holder = $worker_id, \
                        lease_expires_at = $expires, \
                        updated_at = time::now() \
                     WHERE status = 'pending' RETURN AFTER",
                )
                .bind(("table", Self::table_name()))
                .bind(("id", candidate.id))
                .bind(("worker_id", worker_id.to_owned()))
                .bind(("expires", surrealdb::sql::Datetime::from(expires)))
                .await?
                .take(0)?;

            if let Some(job) = claimed.into_iter().next() {
                return Ok(Some(job));
            }
        }

        Ok(None)
    }

    /// Refresh the lease while the job is still running. A no-op when the
    /// job has reached a final state or the lease moved to another worker.
    pub async fn heartbeat(
        db: &SurrealDbClient,
        job_id: &str,
        worker_id: &str,
        lease: std::time::Duration,
    ) -> Result<bool, AppError> {
        let expires = Utc::now()
            + ChronoDuration::from_std(lease).unwrap_or_else(|_| ChronoDuration::seconds(60));

        let refreshed: Vec<Self> = db
            .query(
                "UPDATE type::thing($table, $id) SET \
                    lease_expires_at = $expires, \
                    updated_at = time::now() \
                 WHERE status = 'processing' AND lease_holder = $worker_id \
                 RETURN AFTER",
            )
            .bind(("table", Self::table_name()))
            .bind(("id", job_id.to_owned()))
            .bind(("worker_id", worker_id.to_owned()))
            .bind(("expires", surrealdb::sql::Datetime::from(expires)))
            .await?
            .take(0)?;

        Ok(!refreshed.is_empty())
    }

    /// Move expired `processing` rows back to `pending` so a live worker can
    /// pick them up. Called at the start of every poll.
    pub async fn maybe_requeue_stale(
        db: &SurrealDbClient,
        job_type: JobType,
    ) -> Result<usize, AppError> {
        let requeued: Vec<Self> = db
            .query(
                "UPDATE type::table($table) SET \
                    status = 'pending', \
                    lease_holder = NONE, \
                    lease_expires_at = NONE, \
                    retry_count = retry_count + 1, \
                    updated_at = time::now() \
                 WHERE job_type = $job_type \
                   AND status = 'processing' \
                   AND lease_expires_at != NONE \
                   AND lease_expires_at < time::now() \
                 RETURN AFTER",
            )
            .bind(("table", Self::table_name()))
            .bind(("job_type", job_type))
            .await?
            .take(0)?;
        Ok(requeued.len())
    }

    /// Terminal transition; idempotent. A row that is already final keeps its
    /// first outcome.
    pub async fn mark_final(
        db: &SurrealDbClient,
        job_id: &str,
        status: JobStatus,
        result: Option<serde_json::Value>,
        error_message: Option<String>,
    ) -> Result<bool, AppError> {
        if !status.is_final() {
            return Err(AppError::Validation(format!(
                "mark_final requires a terminal status, got {status:?}"
            )));
        }

        let updated: Vec<Self> = db
            .query(
                "UPDATE type::thing($table, $id) SET \
                    status = $status, \
                    result = $result, \
                    error_message = $error_message, \
                    lease_holder = NONE, \
                    lease_expires_at = NONE, \
                    updated_at = time::now() \
                 WHERE status = 'processing' \
                 RETURN AFTER",
            )
            .bind(("table", Self::table_name()))
            .bind(("id", job_id.to_owned()))
            .bind(("status", status))
            .bind(("result", result))
            .bind(("error_message", error_message))
            .await?
            .take(0)?;

        Ok(!updated.is_empty())
    }

    /// Put a transiently-failed job back into the queue. Persistent failures
    /// burn retry budget and eventually dead-letter.
    pub async fn requeue_for_retry(
        db: &SurrealDbClient,
        job_id: &str,
        transient: bool,
        max_retries: u32,
        error_message: &str,
    ) -> Result<JobStatus, AppError> {
        let Some(job) = db.get_item::<Self>(job_id).await? else {
            return Err(AppError::NotFound(format!("job {job_id}")));
        };

        let retry_count = if transient {
            job.retry_count
        } else {
            job.retry_count.saturating_add(1)
        };

        if !transient && retry_count >= max_retries {
            Self::mark_final(
                db,
                job_id,
                JobStatus::DeadLetter,
                None,
                Some(error_message.to_owned()),
            )
            .await?;
            return Ok(JobStatus::DeadLetter);
        }

        let _updated: Vec<Self> = db
            .query(
                "UPDATE type::thing($table, $id) SET \
                    status = 'pending', \
                    lease_holder = NONE, \
                    lease_expires_at = NONE, \
                    retry_count = $retry_count, \
                    error_message = $error_message, \
                    updated_at = time::now() \
                 WHERE status = 'processing' \
                 RETURN AFTER",
            )
            .bind(("table", Self::table_name()))
            .bind(("id", job_id.to_owned()))
            .bind(("retry_count", retry_count))
            .bind(("error_message", Some(error_message.to_owned())))
            .await?
            .take(0)?;

        Ok(JobStatus::Pending)
    }

    /// Requeue on a missing source-document lookup, with its own smaller
    /// budget so a deleted document cannot loop a job forever.
    pub async fn requeue_for_source_lookup(
        db: &SurrealDbClient,
        job_id: &str,
        max_source_lookup_requeues: u32,
    ) -> Result<JobStatus, AppError> {
        let Some(job) = db.get_item::<Self>(job_id).await? else {
            return Err(AppError::NotFound(format!("job {job_id}")));
        };

        let requeues = job.source_lookup_requeues.saturating_add(1);
        if requeues > max_source_lookup_requeues {
            Self::mark_final(
                db,
                job_id,
                JobStatus::Failed,
                None,
                Some("source document not found after lookup requeues".to_owned()),
            )
            .await?;
            return Ok(JobStatus::Failed);
        }

        let _updated: Vec<Self> = db
            .query(
                "UPDATE type::thing($table, $id) SET \
                    status = 'pending', \
                    lease_holder = NONE, \
                    lease_expires_at = NONE, \
                    source_lookup_requeues = $requeues, \
                    updated_at = time::now() \
                 WHERE status = 'processing' \
                 RETURN AFTER",
            )
            .bind(("table", Self::table_name()))
            .bind(("id", job_id.to_owned()))
            .bind(("requeues", requeues))
            .await?
            .take(0)?;

        Ok(JobStatus::Pending)
    }

    /// Dedupe guard for deferred enrichment: is a job for this document
    /// already pending or processing?
    pub async fn pending_exists_for_document(
        db: &SurrealDbClient,
        job_type: JobType,
        source_document_id: &str,
    ) -> Result<bool, AppError> {
        #[derive(Deserialize)]
        struct IdRow {
            #[serde(deserialize_with = "deserialize_flexible_id")]
            #[allow(dead_code)]
            id: String,
        }

        let rows: Vec<IdRow> = db
            .query(
                "SELECT id FROM type::table($table) \
                 WHERE job_type = $job_type \
                   AND status IN ['pending', 'processing'] \
                   AND payload.source_document_id = $doc \
                 LIMIT 1",
            )
            .bind(("table", Self::table_name()))
            .bind(("job_type", job_type))
            .bind(("doc", source_document_id.to_owned()))
            .await?
            .take(0)?;
        Ok(!rows.is_empty())
    }

    pub async fn get_for_tenant(
        db: &SurrealDbClient,
        job_id: &str,
        tenant_id: &str,
    ) -> Result<Option<Self>, AppError> {
        let job: Option<Self> = db.get_item(job_id).await?;
        Ok(job.filter(|row| {
            row.tenant_id
                .as_deref()
                .map(|tenant| tenant == tenant_id)
                .unwrap_or(true)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use uuid::Uuid;

    async fn setup_db() -> SurrealDbClient {
        let database = Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("job_ns", &database)
            .await
            .expect("in-memory db");
        db.ensure_initialized().await.expect("schema");
        db
    }

    fn payload(doc: &str) -> serde_json::Value {
        serde_json::json!({ "source_document_id": doc })
    }

    #[tokio::test]
    async fn fetch_next_claims_oldest_pending_once() {
        let db = setup_db().await;
        let first = QueueJob::enqueue(&db, JobType::IngestDocument, Some("t1".into()), payload("d1"))
            .await
            .expect("enqueue");
        tokio::time::sleep(Duration::from_millis(5)).await;
        QueueJob::enqueue(&db, JobType::IngestDocument, Some("t1".into()), payload("d2"))
            .await
            .expect("enqueue");

        let claimed = QueueJob::fetch_next(&db, JobType::IngestDocument, "w1", Duration::from_secs(60))
            .await
            .expect("fetch")
            .expect("job available");
        assert_eq!(claimed.id, first.id, "FIFO ordering");
        assert_eq!(claimed.status, JobStatus::Processing);
        assert_eq!(claimed.lease_holder.as_deref(), Some("w1"));
        assert!(claimed.lease_expires_at.is_some());

        // Second fetch gets the second job, not the claimed one.
        let second = QueueJob::fetch_next(&db, JobType::IngestDocument, "w2", Duration::from_secs(60))
            .await
            .expect("fetch")
            .expect("second job");
        assert_ne!(second.id, claimed.id);

        // Queue drained.
        let none = QueueJob::fetch_next(&db, JobType::IngestDocument, "w3", Duration::from_secs(60))
            .await
            .expect("fetch");
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn fetch_next_filters_by_job_type() {
        let db = setup_db().await;
        QueueJob::enqueue(&db, JobType::EnrichDocument, Some("t1".into()), payload("d1"))
            .await
            .expect("enqueue");

        let none = QueueJob::fetch_next(&db, JobType::IngestDocument, "w1", Duration::from_secs(60))
            .await
            .expect("fetch");
        assert!(none.is_none());

        let claimed = QueueJob::fetch_next(&db, JobType::EnrichDocument, "w1", Duration::from_secs(60))
            .await
            .expect("fetch");
        assert!(claimed.is_some());
    }

    #[tokio::test]
    async fn stale_leases_are_requeued_with_retry_bump() {
        let db = setup_db().await;
        let job = QueueJob::enqueue(&db, JobType::IngestDocument, Some("t1".into()), payload("d1"))
            .await
            .expect("enqueue");

        // Claim with an already-expired lease.
        QueueJob::fetch_next(&db, JobType::IngestDocument, "w1", Duration::from_millis(1))
            .await
            .expect("fetch")
            .expect("claimed");
        tokio::time::sleep(Duration::from_millis(20)).await;

        let requeued = QueueJob::maybe_requeue_stale(&db, JobType::IngestDocument)
            .await
            .expect("requeue");
        assert_eq!(requeued, 1);

        let row: QueueJob = db.get_item(&job.id).await.expect("get").expect("row");
        assert_eq!(row.status, JobStatus::Pending);
        assert_eq!(row.retry_count, 1);
        assert!(row.lease_holder.is_none());
    }

    #[tokio::test]
    async fn heartbeat_refreshes_only_own_processing_lease() {
        let db = setup_db().await;
        let job = QueueJob::enqueue(&db, JobType::IngestDocument, None, payload("d1"))
            .await
            .expect("enqueue");
        QueueJob::fetch_next(&db, JobType::IngestDocument, "w1", Duration::from_secs(60))
            .await
            .expect("fetch")
            .expect("claimed");

        assert!(QueueJob::heartbeat(&db, &job.id, "w1", Duration::from_secs(60))
            .await
            .expect("heartbeat"));
        assert!(!QueueJob::heartbeat(&db, &job.id, "w2", Duration::from_secs(60))
            .await
            .expect("foreign heartbeat"));

        QueueJob::mark_final(&db, &job.id, JobStatus::Completed, None, None)
            .await
            .expect("final");
        assert!(!QueueJob::heartbeat(&db, &job.id, "w1", Duration::from_secs(60))
            .await
            .expect("post-final heartbeat"));
    }

    #[tokio::test]
    async fn mark_final_is_idempotent() {
        let db = setup_db().await;
        let job = QueueJob::enqueue(&db, JobType::IngestDocument, None, payload("d1"))
            .await
            .expect("enqueue");
        QueueJob::fetch_next(&db, JobType::IngestDocument, "w1", Duration::from_secs(60))
            .await
            .expect("fetch")
            .expect("claimed");

        let first = QueueJob::mark_final(
            &db,
            &job.id,
            JobStatus::Completed,
            Some(serde_json::json!({"ok": true})),
            None,
        )
        .await
        .expect("final");
        assert!(first);

        // Second terminal write is a no-op; first outcome sticks.
        let second =
            QueueJob::mark_final(&db, &job.id, JobStatus::Failed, None, Some("late".into()))
                .await
                .expect("second final");
        assert!(!second);

        let row: QueueJob = db.get_item(&job.id).await.expect("get").expect("row");
        assert_eq!(row.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn persistent_failures_dead_letter_after_budget() {
        let db = setup_db().await;
        let job = QueueJob::enqueue(&db, JobType::IngestDocument, None, payload("d1"))
            .await
            .expect("enqueue");

        for attempt in 1..=3u32 {
            QueueJob::fetch_next(&db, JobType::IngestDocument, "w1", Duration::from_secs(60))
                .await
                .expect("fetch")
                .expect("claimed");
            let status = QueueJob::requeue_for_retry(&db, &job.id, false, 3, "boom")
                .await
                .expect("requeue");
            if attempt < 3 {
                assert_eq!(status, JobStatus::Pending);
            } else {
                assert_eq!(status, JobStatus::DeadLetter);
            }
        }

        let row: QueueJob = db.get_item(&job.id).await.expect("get").expect("row");
        assert_eq!(row.status, JobStatus::DeadLetter);
    }

    #[tokio::test]
    async fn transient_failures_do_not_burn_retry_budget() {
        let db = setup_db().await;
        let job = QueueJob::enqueue(&db, JobType::IngestDocument, None, payload("d1"))
            .await
            .expect("enqueue");
        QueueJob::fetch_next(&db, JobType::IngestDocument, "w1", Duration::from_secs(60))
            .await
            .expect("fetch")
            .expect("claimed");

        let status = QueueJob::requeue_for_retry(&db, &job.id, true, 3, "connection reset")
            .await
            .expect("requeue");
        assert_eq!(status, JobStatus::Pending);

        let row: QueueJob = db.get_item(&job.id).await.expect("get").expect("row");
        assert_eq!(row.retry_count, 0);
    }

    #[tokio::test]
    async fn source_lookup_budget_fails_job_when_exhausted() {
        let db = setup_db().await;
        let job = QueueJob::enqueue(&db, JobType::IngestDocument, None, payload("gone"))
            .await
            .expect("enqueue");

        for round in 1..=3u32 {
            QueueJob::fetch_next(&db, JobType::IngestDocument, "w1", Duration::from_secs(60))
                .await
                .expect("fetch")
                .expect("claimed");
            let status = QueueJob::requeue_for_source_lookup(&db, &job.id, 2)
                .await
                .expect("requeue");
            if round <= 2 {
                assert_eq!(status, JobStatus::Pending);
            } else {
                assert_eq!(status, JobStatus::Failed);
            }
        }
    }

    #[tokio::test]
    async fn enrichment_dedupe_by_pending_job() {
        let db = setup_db().await;
        assert!(!QueueJob::pending_exists_for_document(&db, JobType::EnrichDocument, "d1")
            .await
            .expect("check"));

        QueueJob::enqueue(&db, JobType::EnrichDocument, Some("t1".into()), payload("d1"))
            .await
            .expect("enqueue");
        assert!(QueueJob::pending_exists_for_document(&db, JobType::EnrichDocument, "d1")
            .await
            .expect("check"));
        assert!(!QueueJob::pending_exists_for_document(&db, JobType::EnrichDocument, "d2")
            .await
            .expect("check"));
    }
}
