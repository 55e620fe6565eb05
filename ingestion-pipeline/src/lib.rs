#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod chunking;
pub mod community;
pub mod concurrency;
pub mod dispatcher;
pub mod enrichment;
pub mod llm;
pub mod parser;
pub mod processor;
pub mod state_manager;
pub mod strategies;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{error, info, warn};
use uuid::Uuid;

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::job::{JobStatus, JobType, QueueJob},
    },
    utils::config::AppConfig,
};

use dispatcher::{HandleOutcome, JobDispatcher};

const IDLE_BACKOFF: Duration = Duration::from_millis(500);
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Poll-and-process loop for one job type. Claims under a lease, refreshes
/// the lease with a heartbeat task while the handler runs, and finalizes or
/// requeues by failure class.
pub async fn run_worker_loop(
    db: Arc<SurrealDbClient>,
    dispatcher: Arc<JobDispatcher>,
    config: Arc<AppConfig>,
    job_type: JobType,
) -> Result<(), AppError> {
    let worker_id = format!("{}-worker-{}", job_type.as_token(), Uuid::new_v4());
    let lease = Duration::from_secs(config.job_lease_secs.max(5));

    info!(%worker_id, job_type = job_type.as_token(), "worker loop started");

    loop {
        if let Err(err) = QueueJob::maybe_requeue_stale(&db, job_type).await {
            error!(%worker_id, error = %err, "failed to requeue stale jobs");
        }

        match QueueJob::fetch_next(&db, job_type, &worker_id, lease).await {
            Ok(Some(job)) => {
                process_claimed_job(&db, &dispatcher, &config, &worker_id, lease, job_type, job)
                    .await;
            }
            Ok(None) => {
                sleep(IDLE_BACKOFF).await;
            }
            Err(err) => {
                error!(%worker_id, error = %err, "failed to claim job");
                sleep(ERROR_BACKOFF).await;
            }
        }
    }
}

async fn process_claimed_job(
    db: &Arc<SurrealDbClient>,
    dispatcher: &Arc<JobDispatcher>,
    config: &Arc<AppConfig>,
    worker_id: &str,
    lease: Duration,
    job_type: JobType,
    job: QueueJob,
) {
    let job_id = job.id.clone();
    info!(%worker_id, %job_id, attempt = job.retry_count, "claimed job");

    // Heartbeat refreshes the lease every lease/3 until the job reaches a
    // final state.
    let heartbeat = {
        let db = Arc::clone(db);
        let job_id = job_id.clone();
        let worker_id = worker_id.to_owned();
        tokio::spawn(async move {
            let interval = lease / 3;
            loop {
                sleep(interval).await;
                match QueueJob::heartbeat(&db, &job_id, &worker_id, lease).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(err) => {
                        warn!(%job_id, error = %err, "heartbeat failed");
                    }
                }
            }
        })
    };

    let handled = match job_type {
        JobType::IngestDocument => dispatcher.handle_ingestion(&job).await,
        JobType::EnrichDocument => dispatcher.handle_enrichment(&job).await,
        JobType::CommunityRebuild => dispatcher.handle_community(&job).await,
    };

    let finalization = match handled {
        Ok(HandleOutcome::Completed(result)) => {
            QueueJob::mark_final(db, &job_id, JobStatus::Completed, Some(result), None)
                .await
                .map(|_| ())
        }
        Ok(HandleOutcome::RequeueSourceLookup) => {
            QueueJob::requeue_for_source_lookup(db, &job_id, config.max_source_lookup_requeues)
                .await
                .map(|status| {
                    info!(%job_id, status = ?status, "source lookup requeue");
                })
        }
        Err(err) => {
            let transient = err.is_transient();
            warn!(%worker_id, %job_id, error = %err, transient, "job failed");
            QueueJob::requeue_for_retry(
                db,
                &job_id,
                transient,
                config.max_retries,
                &err.to_string(),
            )
            .await
            .map(|status| {
                info!(%job_id, status = ?status, "job requeued after failure");
            })
        }
    };

    if let Err(err) = finalization {
        error!(%job_id, error = %err, "failed to finalize job state");
    }

    heartbeat.abort();
}

/// Enqueue a community rebuild for a tenant; used by schedules and admin
/// operations.
pub async fn enqueue_community_rebuild(
    db: &SurrealDbClient,
    tenant_id: &str,
) -> Result<QueueJob, AppError> {
    QueueJob::enqueue(
        db,
        JobType::CommunityRebuild,
        Some(tenant_id.to_owned()),
        serde_json::json!({ "tenant_id": tenant_id }),
    )
    .await
}
