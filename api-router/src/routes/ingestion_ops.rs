use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Extension, Json,
};
use serde_json::json;

use common::{
    error::AppError,
    scope::RequestScope,
    storage::types::{
        job::{JobType, QueueJob},
        source_document::SourceDocument,
    },
};
use ingestion_pipeline::processor::requeue_document;

use crate::{api_state::ApiState, error::ApiError};

/// Force a retry of a failed or dead-lettered document.
pub async fn retry_document(
    State(state): State<ApiState>,
    Extension(scope): Extension<RequestScope>,
    Path(doc_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let scoped = |err: AppError| ApiError::from(err).with_request_id(&scope.correlation_id);

    let doc = SourceDocument::get_for_tenant(&state.db, &doc_id, &scope.tenant_id)
        .await
        .map_err(scoped)?
        .ok_or_else(|| scoped(AppError::NotFound(format!("source document {doc_id}"))))?;

    let job = requeue_document(&state.db, &doc).await.map_err(scoped)?;

    Ok(Json(json!({
        "status": "requeued",
        "document_id": doc.id,
        "job_id": job.id,
    })))
}

/// Enqueue deferred enrichment for a document, deduplicated by pending job.
pub async fn enqueue_enrichment(
    State(state): State<ApiState>,
    Extension(scope): Extension<RequestScope>,
    Path(doc_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let scoped = |err: AppError| ApiError::from(err).with_request_id(&scope.correlation_id);

    let doc = SourceDocument::get_for_tenant(&state.db, &doc_id, &scope.tenant_id)
        .await
        .map_err(scoped)?
        .ok_or_else(|| scoped(AppError::NotFound(format!("source document {doc_id}"))))?;

    if QueueJob::pending_exists_for_document(&state.db, JobType::EnrichDocument, &doc.id)
        .await
        .map_err(scoped)?
    {
        return Ok(Json(json!({
            "status": "accepted",
            "document_id": doc.id,
            "already_queued": true,
        })));
    }

    let job = QueueJob::enqueue(
        &state.db,
        JobType::EnrichDocument,
        Some(scope.tenant_id.clone()),
        json!({
            "source_document_id": doc.id,
            "tenant_id": doc.tenant_id,
            "collection_id": doc.collection_id,
            "include_visual": state.config.ingestion_visual_async_enabled,
            "include_graph": true,
            "include_raptor": true,
        }),
    )
    .await
    .map_err(scoped)?;

    Ok(Json(json!({
        "status": "accepted",
        "document_id": doc.id,
        "job_id": job.id,
        "already_queued": false,
    })))
}
