use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Extension, Json,
};
use axum_typed_multipart::{FieldData, TryFromMultipart, TypedMultipart};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;

use common::{
    error::AppError,
    scope::RequestScope,
    storage::{
        store::StorageManager,
        types::{
            collection::{Collection, CollectionStatus},
            job::{JobType, QueueJob},
            source_document::SourceDocument,
        },
    },
    utils::{authority::{classify_authority, AuthorityLevel}, backpressure::QueueSnapshot},
};
use uuid::Uuid;

use crate::{api_state::ApiState, error::ApiError};

#[derive(Debug, TryFromMultipart)]
pub struct DocumentUpload {
    #[form_data(limit = "25MiB")]
    pub file: FieldData<Bytes>,
    pub metadata: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UploadMetadata {
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub collection_key: Option<String>,
    #[serde(default)]
    pub collection_name: Option<String>,
    #[serde(default)]
    pub batch_id: Option<String>,
    #[serde(default)]
    pub source_standard: Option<String>,
    #[serde(default)]
    pub authority_level: Option<String>,
    #[serde(default)]
    pub strategy_override: Option<String>,
    #[serde(default)]
    pub doc_type: Option<String>,
    #[serde(default)]
    pub is_global: bool,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

fn queue_headers(snapshot: &QueueSnapshot) -> [(&'static str, String); 3] {
    [
        ("X-Queue-Depth", snapshot.queue_depth.to_string()),
        (
            "X-Queue-ETA-Seconds",
            snapshot.estimated_wait_seconds.to_string(),
        ),
        ("X-Queue-Max-Pending", snapshot.max_pending.to_string()),
    ]
}

/// Queue a document for ingestion. Honors `Idempotency-Key` replay and
/// reports the tenant's queue snapshot in response headers.
pub async fn upload_document(
    State(state): State<ApiState>,
    Extension(scope): Extension<RequestScope>,
    headers: HeaderMap,
    TypedMultipart(upload): TypedMultipart<DocumentUpload>,
) -> Result<impl IntoResponse, ApiError> {
    let scoped = |err: AppError| ApiError::from(err).with_request_id(&scope.correlation_id);

    let metadata: UploadMetadata = match upload.metadata.as_deref() {
        Some(raw) if !raw.trim().is_empty() => serde_json::from_str(raw).map_err(|err| {
            scoped(AppError::Validation(format!("invalid metadata JSON: {err}")))
        })?,
        _ => UploadMetadata::default(),
    };

    let tenant_id = scope
        .enforce_tenant_match(metadata.tenant_id.as_deref(), "metadata.tenant_id")
        .map_err(scoped)?;

    // Idempotent replay: same key within the TTL returns the original
    // payload untouched, with the replay marker header.
    let idempotency_key = headers
        .get("Idempotency-Key")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|key| format!("{tenant_id}:{key}"));

    if let Some(key) = &idempotency_key {
        if let Some(replayed) = state.idempotency.get(key).await {
            let snapshot = state
                .backpressure
                .get_pending_snapshot(&state.db, &tenant_id)
                .await
                .map_err(scoped)?;
            let mut response =
                (StatusCode::OK, Json(replayed)).into_response();
            for (name, value) in queue_headers(&snapshot) {
                if let Ok(header_value) = value.parse() {
                    response.headers_mut().insert(name, header_value);
                }
            }
            response.headers_mut().insert(
                "X-Idempotency-Replayed",
                axum::http::HeaderValue::from_static("true"),
            );
            return Ok(response);
        }
    }

    // Admission control before any durable writes.
    let snapshot = state
        .backpressure
        .enforce_limit(&state.db, &tenant_id)
        .await
        .map_err(scoped)?;

    // Collection resolution: sealed collections reject direct uploads.
    let (collection_id, collection_key) = match metadata.collection_key.as_deref() {
        Some(key) => {
            if let Some(existing) = Collection::find_by_key(&state.db, &tenant_id, key)
                .await
                .map_err(scoped)?
            {
                if existing.status == CollectionStatus::Sealed {
                    return Err(scoped(AppError::CollectionSealed(existing.key)));
                }
                (Some(existing.id), existing.key)
            } else {
                let created = Collection::ensure_open(
                    &state.db,
                    &tenant_id,
                    key,
                    metadata.collection_name.as_deref(),
                )
                .await
                .map_err(scoped)?;
                (Some(created.id), created.key)
            }
        }
        None => (None, "default".to_owned()),
    };

    let filename = upload
        .file
        .metadata
        .file_name
        .clone()
        .unwrap_or_else(|| "upload.bin".to_owned());
    let doc_id = Uuid::new_v4().to_string();
    let location = StorageManager::document_location(
        &tenant_id,
        &collection_key,
        metadata.batch_id.as_deref().unwrap_or("direct"),
        &doc_id,
        &filename,
    );

    state
        .storage
        .put(&location, upload.file.contents.clone())
        .await
        .map_err(|err| scoped(AppError::InternalError(format!("storage write failed: {err}"))))?;

    let authority = metadata
        .authority_level
        .as_deref()
        .and_then(AuthorityLevel::from_token)
        .unwrap_or_else(|| {
            classify_authority(Some(&location), metadata.doc_type.as_deref(), Some(&filename))
        });

    let mut doc = SourceDocument::new(&tenant_id, &filename, &location, &state.config.rag_storage_bucket);
    doc.id = doc_id.clone();
    doc.collection_id = collection_id;
    doc.batch_id = metadata.batch_id.clone();
    doc.is_global = metadata.is_global;
    doc.authority_level = authority;
    doc.status = common::storage::types::source_document::DocumentStatus::Queued;
    let mut doc_metadata = serde_json::Map::new();
    if let Some(standard) = &metadata.source_standard {
        doc_metadata.insert("source_standard".into(), json!(standard));
    }
    if let Some(strategy) = &metadata.strategy_override {
        doc_metadata.insert("strategy_override".into(), json!(strategy));
    }
    doc_metadata.insert("correlation_id".into(), json!(scope.correlation_id));
    for (key, value) in metadata.metadata {
        doc_metadata.entry(key).or_insert(value);
    }
    doc.metadata = serde_json::Value::Object(doc_metadata);

    state
        .db
        .store_item(doc)
        .await
        .map_err(|err| scoped(AppError::Database(err)))?;

    QueueJob::enqueue(
        &state.db,
        JobType::IngestDocument,
        Some(tenant_id.clone()),
        json!({ "source_document_id": doc_id }),
    )
    .await
    .map_err(scoped)?;

    let snapshot_after = state
        .backpressure
        .get_pending_snapshot(&state.db, &tenant_id)
        .await
        .unwrap_or(snapshot);

    let body = json!({
        "status": "accepted",
        "document_id": doc_id,
        "queue": snapshot_after,
    });

    if let Some(key) = &idempotency_key {
        state.idempotency.set(key, body.clone()).await;
    }

    let mut response = (StatusCode::OK, Json(body)).into_response();
    for (name, value) in queue_headers(&snapshot_after) {
        if let Ok(header_value) = value.parse() {
            response.headers_mut().insert(name, header_value);
        }
    }
    Ok(response)
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_list_limit")]
    pub limit: usize,
}

fn default_list_limit() -> usize {
    20
}

pub async fn list_documents(
    State(state): State<ApiState>,
    Extension(scope): Extension<RequestScope>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let documents =
        SourceDocument::list_for_tenant(&state.db, &scope.tenant_id, query.limit.clamp(1, 200))
            .await
            .map_err(|err| ApiError::from(err).with_request_id(&scope.correlation_id))?;

    let items: Vec<serde_json::Value> = documents
        .into_iter()
        .map(|doc| {
            json!({
                "id": doc.id,
                "filename": doc.filename,
                "status": doc.status,
                "collection_id": doc.collection_id,
                "batch_id": doc.batch_id,
                "authority_level": doc.authority_level,
                "retry_count": doc.retry_count,
                "error_message": doc.error_message,
                "created_at": doc.created_at.to_rfc3339(),
                "updated_at": doc.updated_at.to_rfc3339(),
            })
        })
        .collect();

    Ok(Json(json!({ "documents": items })))
}

pub async fn document_status(
    State(state): State<ApiState>,
    Extension(scope): Extension<RequestScope>,
    Path(doc_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let scoped = |err: AppError| ApiError::from(err).with_request_id(&scope.correlation_id);

    let doc = SourceDocument::get_for_tenant(&state.db, &doc_id, &scope.tenant_id)
        .await
        .map_err(scoped)?
        .ok_or_else(|| scoped(AppError::NotFound(format!("source document {doc_id}"))))?;

    Ok(Json(json!({
        "id": doc.id,
        "status": doc.status,
        "filename": doc.filename,
        "retry_count": doc.retry_count,
        "error_message": doc.error_message,
        "searchable": doc.metadata.get("searchable"),
        "enrichment": doc.metadata.get("enrichment"),
        "updated_at": doc.updated_at.to_rfc3339(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct DeleteQuery {
    #[serde(default)]
    pub purge_chunks: bool,
}

pub async fn delete_document(
    State(state): State<ApiState>,
    Extension(scope): Extension<RequestScope>,
    Path(doc_id): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let scoped = |err: AppError| ApiError::from(err).with_request_id(&scope.correlation_id);

    let doc = SourceDocument::get_for_tenant(&state.db, &doc_id, &scope.tenant_id)
        .await
        .map_err(scoped)?
        .ok_or_else(|| scoped(AppError::NotFound(format!("source document {doc_id}"))))?;

    SourceDocument::delete_cascade(&state.db, &doc.id, query.purge_chunks)
        .await
        .map_err(scoped)?;

    Ok(Json(json!({
        "status": "deleted",
        "document_id": doc.id,
        "purged_chunks": query.purge_chunks,
    })))
}
