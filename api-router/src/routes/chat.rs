use axum::{extract::State, response::IntoResponse, Extension, Json};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use common::{error::AppError, scope::RequestScope};
use retrieval_pipeline::{
    contract::{HybridRetrievalRequest, RerankOptions},
    validation::ScopeFilters,
};

use crate::{api_state::ApiState, error::ApiError};

fn default_k() -> usize {
    6
}

#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    pub query: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub collection_id: Option<String>,
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default)]
    pub filters: Option<ScopeFilters>,
}

/// Grounded chat: retrieval resolves the context, the chat port answers over
/// it, and citations point back at the retrieved rows.
pub async fn chat_completions(
    State(state): State<ApiState>,
    Extension(scope): Extension<RequestScope>,
    Json(request): Json<ChatCompletionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let scoped = |err: AppError| ApiError::from(err).with_request_id(&scope.correlation_id);

    let tenant_id = scope
        .enforce_tenant_match(request.tenant_id.as_deref(), "body.tenant_id")
        .map_err(scoped)?;

    if request.query.trim().is_empty() {
        return Err(scoped(AppError::Validation("query must not be empty".into())));
    }

    let hybrid_request = HybridRetrievalRequest {
        query: request.query.clone(),
        tenant_id,
        collection_id: request.collection_id.clone(),
        k: request.k.clamp(1, 20),
        fetch_k: 120,
        filters: request.filters.clone(),
        rerank: Some(RerankOptions { enabled: true }),
        graph: None,
        retrieval_plan: None,
        agent_role: None,
    };

    let retrieval = state
        .contract
        .run_hybrid(&hybrid_request, false, false)
        .await
        .map_err(scoped)?;

    let context = retrieval
        .items
        .iter()
        .map(|item| format!("[{}] {}", item.source, item.content))
        .collect::<Vec<_>>()
        .join("\n\n");

    let answer = state
        .models
        .chat_answer(&request.query, &context)
        .await
        .map_err(scoped)?;

    let citations: Vec<serde_json::Value> = retrieval
        .items
        .iter()
        .map(|item| {
            json!({
                "source": item.source,
                "source_layer": item.metadata.get("source_layer"),
                "score": item.score,
            })
        })
        .collect();

    let scope_warnings: Vec<String> = retrieval.trace.warnings.clone();

    Ok(Json(json!({
        "interaction_id": Uuid::new_v4().to_string(),
        "answer": answer,
        "citations": citations,
        "mode": retrieval.trace.engine_mode,
        "scope_warnings": scope_warnings,
    })))
}
