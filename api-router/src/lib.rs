#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

use api_state::ApiState;
use axum::{
    extract::{DefaultBodyLimit, FromRef},
    middleware::{from_fn, from_fn_with_state},
    routing::{delete, get, post},
    Router,
};
use middleware_request_context::request_context;
use middleware_service_auth::service_auth;
use routes::{
    batches::{
        batch_events, batch_progress, batch_status, batch_stream, create_batch, seal_batch,
        upload_batch_file,
    },
    chat::chat_completions,
    collections::delete_collection,
    documents::{delete_document, document_status, list_documents, upload_document},
    ingestion_ops::{enqueue_enrichment, retry_document},
    liveness::live,
    readiness::ready,
    retrieval::{
        retrieval_health, run_comprehensive, run_explain, run_hybrid, run_multi_query,
        validate_scope,
    },
};

pub mod api_state;
pub mod error;
mod middleware_request_context;
mod middleware_service_auth;
mod routes;

const MAX_UPLOAD_BODY_BYTES: usize = 32 * 1024 * 1024;

/// The service router. Health probes stay public; everything else sits
/// behind service-secret auth and the tenant/correlation context.
pub fn api_routes<S>(app_state: &ApiState) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
    ApiState: FromRef<S>,
{
    // Public, unauthenticated endpoints (for k8s/systemd probes)
    let public = Router::new()
        .route("/ready", get(ready))
        .route("/live", get(live));

    let protected = Router::new()
        .route(
            "/documents",
            post(upload_document).layer(DefaultBodyLimit::max(MAX_UPLOAD_BODY_BYTES)),
        )
        .route("/documents", get(list_documents))
        .route("/documents/{id}/status", get(document_status))
        .route("/documents/{id}", delete(delete_document))
        .route("/collections/{id}", delete(delete_collection))
        .route("/ingestion/batches", post(create_batch))
        .route(
            "/ingestion/batches/{id}/files",
            post(upload_batch_file).layer(DefaultBodyLimit::max(MAX_UPLOAD_BODY_BYTES)),
        )
        .route("/ingestion/batches/{id}/seal", post(seal_batch))
        .route("/ingestion/batches/{id}/status", get(batch_status))
        .route("/ingestion/batches/{id}/progress", get(batch_progress))
        .route("/ingestion/batches/{id}/events", get(batch_events))
        .route("/ingestion/batches/{id}/stream", get(batch_stream))
        .route("/ingestion/retry/{doc_id}", post(retry_document))
        .route("/ingestion/enrich/{doc_id}", post(enqueue_enrichment))
        .route("/retrieval/validate-scope", post(validate_scope))
        .route("/retrieval/hybrid", post(run_hybrid))
        .route("/retrieval/multi-query", post(run_multi_query))
        .route("/retrieval/explain", post(run_explain))
        .route("/retrieval/comprehensive", post(run_comprehensive))
        .route("/retrieval/health", get(retrieval_health))
        .route("/chat/completions", post(chat_completions))
        .route_layer(from_fn(request_context))
        .route_layer(from_fn_with_state(app_state.clone(), service_auth));

    public.merge(protected)
}
