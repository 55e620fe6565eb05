use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    Extension, Json,
};
use axum_typed_multipart::{FieldData, TryFromMultipart, TypedMultipart};
use bytes::Bytes;
use chrono::Utc;
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use common::{
    error::AppError,
    scope::RequestScope,
    storage::{
        store::StorageManager,
        types::{
            collection::Collection,
            ingestion_batch::IngestionBatch,
            ingestion_event::IngestionEvent,
            job::{JobType, QueueJob},
            source_document::{DocumentStatus, SourceDocument},
        },
    },
};

use crate::{api_state::ApiState, error::ApiError};

/// Heartbeat with no progress for this long flips the stalled flag.
const STALL_THRESHOLD_SECS: i64 = 180;
const STREAM_MIN_SLEEP: Duration = Duration::from_millis(500);
const STREAM_MAX_SLEEP: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
pub struct CreateBatchRequest {
    pub collection_key: String,
    #[serde(default)]
    pub collection_name: Option<String>,
    pub total_files: u32,
    #[serde(default)]
    pub auto_seal: bool,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

pub async fn create_batch(
    State(state): State<ApiState>,
    Extension(scope): Extension<RequestScope>,
    Json(request): Json<CreateBatchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let scoped = |err: AppError| ApiError::from(err).with_request_id(&scope.correlation_id);

    if request.total_files == 0 {
        return Err(scoped(AppError::Validation(
            "total_files must be at least 1".into(),
        )));
    }

    let collection = Collection::ensure_open(
        &state.db,
        &scope.tenant_id,
        &request.collection_key,
        request.collection_name.as_deref(),
    )
    .await
    .map_err(scoped)?;

    let mut metadata = request.metadata;
    metadata.insert("collection_key".into(), json!(collection.key));
    metadata.insert("collection_name".into(), json!(collection.name));

    let batch = IngestionBatch::new(
        &scope.tenant_id,
        &collection.id,
        request.total_files,
        request.auto_seal,
        serde_json::Value::Object(metadata),
    );
    let stored = state
        .db
        .store_item(batch.clone())
        .await
        .map_err(|err| scoped(AppError::Database(err)))?
        .unwrap_or(batch);

    Ok(Json(json!({
        "batch_id": stored.id,
        "tenant_id": stored.tenant_id,
        "collection_id": stored.collection_id,
        "collection_key": collection.key,
        "status": stored.status,
        "total_files": stored.total_files,
        "auto_seal": stored.auto_seal,
    })))
}

#[derive(Debug, TryFromMultipart)]
pub struct BatchFileUpload {
    #[form_data(limit = "25MiB")]
    pub file: FieldData<Bytes>,
}

/// Add one file to a batch. Enforces the batch limit and backpressure, and
/// deduplicates by filename inside the batch.
pub async fn upload_batch_file(
    State(state): State<ApiState>,
    Extension(scope): Extension<RequestScope>,
    Path(batch_id): Path<String>,
    TypedMultipart(upload): TypedMultipart<BatchFileUpload>,
) -> Result<impl IntoResponse, ApiError> {
    let scoped = |err: AppError| ApiError::from(err).with_request_id(&scope.correlation_id);

    let batch = IngestionBatch::get_for_tenant(&state.db, &batch_id, &scope.tenant_id)
        .await
        .map_err(scoped)?
        .ok_or_else(|| scoped(AppError::NotFound(format!("batch {batch_id}"))))?;

    if batch.status.is_terminal() {
        return Err(scoped(AppError::Validation(format!(
            "batch {batch_id} is already {:?}",
            batch.status
        ))));
    }

    // Sealed collections reopen on demand for batch uploads.
    let collection = state
        .db
        .get_item::<Collection>(&batch.collection_id)
        .await
        .map_err(|err| scoped(AppError::Database(err)))?
        .ok_or_else(|| scoped(AppError::NotFound(format!("collection {}", batch.collection_id))))?;
    let collection = Collection::ensure_open(&state.db, &scope.tenant_id, &collection.key, None)
        .await
        .map_err(scoped)?;

    let existing_docs = batch_documents(&state, &batch.id).await.map_err(scoped)?;
    if existing_docs.len() as u32 >= batch.total_files {
        return Err(ApiError::new(
            axum::http::StatusCode::CONFLICT,
            "BATCH_FULL",
            format!(
                "batch {batch_id} already has {} of {} files",
                existing_docs.len(),
                batch.total_files
            ),
        )
        .with_request_id(&scope.correlation_id));
    }

    let filename = upload
        .file
        .metadata
        .file_name
        .clone()
        .unwrap_or_else(|| "upload.bin".to_owned());

    // Duplicate filenames inside a batch return the existing document.
    if let Some(existing) = existing_docs.iter().find(|doc| doc.filename == filename) {
        return Ok(Json(json!({
            "status": "accepted",
            "document_id": existing.id,
            "deduplicated": true,
        }))
        .into_response());
    }

    let snapshot = state
        .backpressure
        .enforce_limit(&state.db, &scope.tenant_id)
        .await
        .map_err(scoped)?;

    let doc_id = Uuid::new_v4().to_string();
    let location = StorageManager::document_location(
        &scope.tenant_id,
        &collection.key,
        &batch.id,
        &doc_id,
        &filename,
    );
    state
        .storage
        .put(&location, upload.file.contents.clone())
        .await
        .map_err(|err| scoped(AppError::InternalError(format!("storage write failed: {err}"))))?;

    let mut doc = SourceDocument::new(
        &scope.tenant_id,
        &filename,
        &location,
        &state.config.rag_storage_bucket,
    );
    doc.id = doc_id.clone();
    doc.collection_id = Some(collection.id.clone());
    doc.batch_id = Some(batch.id.clone());
    doc.status = DocumentStatus::Queued;
    doc.metadata = json!({ "correlation_id": scope.correlation_id });
    state
        .db
        .store_item(doc)
        .await
        .map_err(|err| scoped(AppError::Database(err)))?;

    QueueJob::enqueue(
        &state.db,
        JobType::IngestDocument,
        Some(scope.tenant_id.clone()),
        json!({ "source_document_id": doc_id }),
    )
    .await
    .map_err(scoped)?;

    Ok(Json(json!({
        "status": "accepted",
        "document_id": doc_id,
        "batch_id": batch.id,
        "queue": snapshot,
    }))
    .into_response())
}

pub async fn seal_batch(
    State(state): State<ApiState>,
    Extension(scope): Extension<RequestScope>,
    Path(batch_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let scoped = |err: AppError| ApiError::from(err).with_request_id(&scope.correlation_id);

    let batch = IngestionBatch::get_for_tenant(&state.db, &batch_id, &scope.tenant_id)
        .await
        .map_err(scoped)?
        .ok_or_else(|| scoped(AppError::NotFound(format!("batch {batch_id}"))))?;

    let sealed = Collection::seal(&state.db, &batch.collection_id)
        .await
        .map_err(scoped)?
        .ok_or_else(|| scoped(AppError::NotFound(format!("collection {}", batch.collection_id))))?;

    Ok(Json(json!({
        "status": "sealed",
        "batch_id": batch.id,
        "collection_id": sealed.id,
        "collection_status": sealed.status,
    })))
}

pub async fn batch_status(
    State(state): State<ApiState>,
    Extension(scope): Extension<RequestScope>,
    Path(batch_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let scoped = |err: AppError| ApiError::from(err).with_request_id(&scope.correlation_id);
    let batch = load_batch_with_stall_check(&state, &batch_id, &scope.tenant_id)
        .await
        .map_err(scoped)?;
    Ok(Json(batch_snapshot(&batch)))
}

pub async fn batch_progress(
    State(state): State<ApiState>,
    Extension(scope): Extension<RequestScope>,
    Path(batch_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let scoped = |err: AppError| ApiError::from(err).with_request_id(&scope.correlation_id);
    let batch = load_batch_with_stall_check(&state, &batch_id, &scope.tenant_id)
        .await
        .map_err(scoped)?;

    let done = batch.completed + batch.failed;
    let percent = if batch.total_files == 0 {
        0.0
    } else {
        (done as f64 / batch.total_files as f64 * 100.0).min(100.0)
    };

    Ok(Json(json!({
        "batch_id": batch.id,
        "status": batch.status,
        "total_files": batch.total_files,
        "completed": batch.completed,
        "failed": batch.failed,
        "percent": (percent * 10.0).round() / 10.0,
        "stalled": batch.stalled,
    })))
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default = "default_events_limit")]
    pub limit: usize,
}

fn default_events_limit() -> usize {
    50
}

/// Events across all documents in the batch, cursor-paginated by
/// `"{created_at}|{event_id}"`.
pub async fn batch_events(
    State(state): State<ApiState>,
    Extension(scope): Extension<RequestScope>,
    Path(batch_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let scoped = |err: AppError| ApiError::from(err).with_request_id(&scope.correlation_id);

    IngestionBatch::get_for_tenant(&state.db, &batch_id, &scope.tenant_id)
        .await
        .map_err(scoped)?
        .ok_or_else(|| scoped(AppError::NotFound(format!("batch {batch_id}"))))?;

    let events = collect_batch_events(&state, &batch_id, query.cursor.as_deref(), query.limit)
        .await
        .map_err(scoped)?;

    let next_cursor = events.last().map(IngestionEvent::cursor);
    let items: Vec<serde_json::Value> = events
        .iter()
        .map(|event| {
            json!({
                "id": event.id,
                "source_document_id": event.source_document_id,
                "message": event.message,
                "severity": event.severity,
                "phase": event.phase,
                "phase_metadata": event.phase_metadata,
                "created_at": event.created_at.to_rfc3339(),
                "cursor": event.cursor(),
            })
        })
        .collect();

    Ok(Json(json!({ "events": items, "next_cursor": next_cursor })))
}

/// SSE stream of batch progress: `snapshot` on connect, `delta` on change,
/// `heartbeat` while idle, `terminal` on completion or session timeout.
pub async fn batch_stream(
    State(state): State<ApiState>,
    Extension(scope): Extension<RequestScope>,
    Path(batch_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>>, ApiError> {
    let scoped = |err: AppError| ApiError::from(err).with_request_id(&scope.correlation_id);

    IngestionBatch::get_for_tenant(&state.db, &batch_id, &scope.tenant_id)
        .await
        .map_err(scoped)?
        .ok_or_else(|| scoped(AppError::NotFound(format!("batch {batch_id}"))))?;

    let tenant_id = scope.tenant_id.clone();
    let session_timeout = Duration::from_secs(state.config.batch_stream_session_timeout_secs);

    let stream = async_stream::stream! {
        let started = tokio::time::Instant::now();
        let mut last_snapshot: Option<serde_json::Value> = None;
        let mut sleep = STREAM_MIN_SLEEP;

        loop {
            if started.elapsed() >= session_timeout {
                yield Ok(Event::default()
                    .event("terminal")
                    .data(json!({ "reason": "timeout" }).to_string()));
                break;
            }

            match load_batch_with_stall_check(&state, &batch_id, &tenant_id).await {
                Ok(batch) => {
                    let snapshot = batch_snapshot(&batch);
                    let terminal = batch.status.is_terminal();

                    match &last_snapshot {
                        None => {
                            yield Ok(Event::default()
                                .event("snapshot")
                                .data(snapshot.to_string()));
                        }
                        Some(previous) if *previous != snapshot => {
                            yield Ok(Event::default()
                                .event("delta")
                                .data(snapshot.to_string()));
                            sleep = STREAM_MIN_SLEEP;
                        }
                        Some(_) => {
                            yield Ok(Event::default()
                                .event("heartbeat")
                                .data(json!({ "at": Utc::now().to_rfc3339() }).to_string()));
                            // Idle streams back off cooperatively.
                            sleep = (sleep * 2).min(STREAM_MAX_SLEEP);
                        }
                    }
                    last_snapshot = Some(snapshot);

                    if terminal {
                        yield Ok(Event::default()
                            .event("terminal")
                            .data(json!({ "reason": "completed", "status": batch.status })
                                .to_string()));
                        break;
                    }
                }
                Err(err) => {
                    yield Ok(Event::default()
                        .event("terminal")
                        .data(json!({ "reason": "error", "message": err.to_string() })
                            .to_string()));
                    break;
                }
            }

            tokio::time::sleep(sleep.clamp(STREAM_MIN_SLEEP, STREAM_MAX_SLEEP)).await;
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn batch_snapshot(batch: &IngestionBatch) -> serde_json::Value {
    json!({
        "batch_id": batch.id,
        "status": batch.status,
        "total_files": batch.total_files,
        "completed": batch.completed,
        "failed": batch.failed,
        "auto_seal": batch.auto_seal,
        "stalled": batch.stalled,
        "updated_at": batch.updated_at.to_rfc3339(),
    })
}

async fn load_batch_with_stall_check(
    state: &ApiState,
    batch_id: &str,
    tenant_id: &str,
) -> Result<IngestionBatch, AppError> {
    let batch = IngestionBatch::get_for_tenant(&state.db, batch_id, tenant_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("batch {batch_id}")))?;

    if batch.status.is_terminal() || batch.stalled {
        return Ok(batch);
    }

    // A long-silent event log flips the stalled flag for visibility; it never
    // aborts the underlying work.
    let documents = batch_documents_for(state, batch_id).await?;
    let mut latest = None;
    for doc in &documents {
        if let Some(event_time) = IngestionEvent::latest_event_time(&state.db, &doc.id).await? {
            latest = Some(latest.map_or(event_time, |current: chrono::DateTime<Utc>| {
                current.max(event_time)
            }));
        }
    }

    if let Some(latest) = latest {
        if (Utc::now() - latest).num_seconds() > STALL_THRESHOLD_SECS {
            IngestionBatch::mark_stalled(&state.db, batch_id, true).await?;
            let mut stalled = batch;
            stalled.stalled = true;
            return Ok(stalled);
        }
    }

    Ok(batch)
}

async fn batch_documents(
    state: &ApiState,
    batch_id: &str,
) -> Result<Vec<SourceDocument>, AppError> {
    batch_documents_for(state, batch_id).await
}

async fn batch_documents_for(
    state: &ApiState,
    batch_id: &str,
) -> Result<Vec<SourceDocument>, AppError> {
    let documents: Vec<SourceDocument> = state
        .db
        .query("SELECT * FROM source_document WHERE batch_id = $batch_id ORDER BY created_at ASC")
        .bind(("batch_id", batch_id.to_owned()))
        .await?
        .take(0)?;
    Ok(documents)
}

async fn collect_batch_events(
    state: &ApiState,
    batch_id: &str,
    cursor: Option<&str>,
    limit: usize,
) -> Result<Vec<IngestionEvent>, AppError> {
    let documents = batch_documents_for(state, batch_id).await?;
    let mut events: Vec<IngestionEvent> = Vec::new();
    for doc in &documents {
        events.extend(IngestionEvent::list_after(&state.db, &doc.id, cursor, limit).await?);
    }
    events.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    events.truncate(limit.max(1));
    Ok(events)
}
