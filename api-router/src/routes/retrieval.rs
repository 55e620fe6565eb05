use axum::{extract::State, response::IntoResponse, Extension, Json};
use serde_json::json;

use common::{error::AppError, scope::RequestScope};
use retrieval_pipeline::{
    contract::{
        ComprehensiveRetrievalRequest, ExplainRetrievalRequest, HybridRetrievalRequest,
        ValidateScopeRequest,
    },
    multi_query::MultiQueryRetrievalRequest,
};

use crate::{api_state::ApiState, error::ApiError};

pub async fn validate_scope(
    State(state): State<ApiState>,
    Extension(scope): Extension<RequestScope>,
    Json(request): Json<ValidateScopeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let scoped = |err: AppError| ApiError::from(err).with_request_id(&scope.correlation_id);

    let tenant_id = scope
        .enforce_tenant_match(Some(&request.tenant_id), "body.tenant_id")
        .map_err(scoped)?;

    let response = state.contract.validate_scope(
        &request.query,
        &tenant_id,
        request.collection_id.as_deref(),
        request.filters.as_ref(),
    );
    Ok(Json(response))
}

pub async fn run_hybrid(
    State(state): State<ApiState>,
    Extension(scope): Extension<RequestScope>,
    Json(mut request): Json<HybridRetrievalRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let scoped = |err: AppError| ApiError::from(err).with_request_id(&scope.correlation_id);

    request.tenant_id = scope
        .enforce_tenant_match(Some(&request.tenant_id), "body.tenant_id")
        .map_err(scoped)?;

    let response = state
        .contract
        .run_hybrid(&request, false, false)
        .await
        .map_err(scoped)?;
    Ok(Json(response))
}

pub async fn run_multi_query(
    State(state): State<ApiState>,
    Extension(scope): Extension<RequestScope>,
    Json(mut request): Json<MultiQueryRetrievalRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let scoped = |err: AppError| ApiError::from(err).with_request_id(&scope.correlation_id);

    request.tenant_id = scope
        .enforce_tenant_match(Some(&request.tenant_id), "body.tenant_id")
        .map_err(scoped)?;

    if request.queries.is_empty() {
        return Err(scoped(AppError::Validation(
            "multi-query requires at least one sub-query".into(),
        )));
    }

    let response = state
        .contract
        .run_multi_query(&request)
        .await
        .map_err(scoped)?;
    Ok(Json(response))
}

pub async fn run_explain(
    State(state): State<ApiState>,
    Extension(scope): Extension<RequestScope>,
    Json(mut request): Json<ExplainRetrievalRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let scoped = |err: AppError| ApiError::from(err).with_request_id(&scope.correlation_id);

    request.tenant_id = scope
        .enforce_tenant_match(Some(&request.tenant_id), "body.tenant_id")
        .map_err(scoped)?;

    let response = state.contract.run_explain(&request).await.map_err(scoped)?;
    Ok(Json(response))
}

pub async fn run_comprehensive(
    State(state): State<ApiState>,
    Extension(scope): Extension<RequestScope>,
    Json(mut request): Json<ComprehensiveRetrievalRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let scoped = |err: AppError| ApiError::from(err).with_request_id(&scope.correlation_id);

    request.tenant_id = scope
        .enforce_tenant_match(Some(&request.tenant_id), "body.tenant_id")
        .map_err(scoped)?;

    let response = state
        .contract
        .run_comprehensive(&request)
        .await
        .map_err(scoped)?;
    Ok(Json(response))
}

pub async fn retrieval_health(State(state): State<ApiState>) -> impl IntoResponse {
    Json(json!({
        "rpc_contract_status": "fixed",
        "hybrid_rpc_enabled": state.config.atomic_use_hybrid_rpc,
        "engine_mode": state.config.retrieval_engine_mode,
    }))
}
