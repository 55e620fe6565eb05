use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Extension, Json,
};
use serde::Deserialize;
use serde_json::json;

use common::{
    error::AppError,
    scope::RequestScope,
    storage::types::{collection::Collection, source_document::SourceDocument},
};

use crate::{api_state::ApiState, error::ApiError};

const DELETE_BATCH_SIZE: usize = 100;

/// Cascade delete a collection: provenance, RAPTOR nodes, chunks, documents,
/// and batches go in batches of 100; graph orphans are swept opportunistically
/// by the community rebuild.
pub async fn delete_collection(
    State(state): State<ApiState>,
    Extension(scope): Extension<RequestScope>,
    Path(collection_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let scoped = |err: AppError| ApiError::from(err).with_request_id(&scope.correlation_id);

    let collection = state
        .db
        .get_item::<Collection>(&collection_id)
        .await
        .map_err(|err| scoped(AppError::Database(err)))?
        .filter(|row| row.tenant_id == scope.tenant_id)
        .ok_or_else(|| scoped(AppError::NotFound(format!("collection {collection_id}"))))?;

    #[derive(Deserialize)]
    struct IdRow {
        #[serde(deserialize_with = "common::storage::types::source_document::deserialize_flexible_id")]
        id: String,
    }

    let mut documents_deleted = 0usize;
    loop {
        let batch: Vec<IdRow> = state
            .db
            .query(
                "SELECT id FROM source_document WHERE collection_id = $collection_id LIMIT $limit",
            )
            .bind(("collection_id", collection.id.clone()))
            .bind(("limit", DELETE_BATCH_SIZE as i64))
            .await
            .map_err(|err| scoped(AppError::Database(err)))?
            .take(0)
            .map_err(|err| scoped(AppError::Database(err)))?;

        if batch.is_empty() {
            break;
        }

        for row in &batch {
            SourceDocument::delete_cascade(&state.db, &row.id, true)
                .await
                .map_err(scoped)?;
        }
        documents_deleted += batch.len();
    }

    // Collection-scoped rows with no surviving document parent.
    state
        .db
        .query(
            "DELETE summary_node_embedding WHERE collection_id = $collection_id;
             DELETE summary_node WHERE collection_id = $collection_id;
             DELETE content_chunk_embedding WHERE collection_id = $collection_id;
             DELETE content_chunk WHERE collection_id = $collection_id;
             DELETE ingestion_batch WHERE collection_id = $collection_id;",
        )
        .bind(("collection_id", collection.id.clone()))
        .await
        .map_err(|err| scoped(AppError::Database(err)))?
        .check()
        .map_err(|err| scoped(AppError::Database(err)))?;

    let _deleted: Option<Collection> = state
        .db
        .delete_item(&collection.id)
        .await
        .map_err(|err| scoped(AppError::Database(err)))?;

    Ok(Json(json!({
        "status": "deleted",
        "collection_id": collection.id,
        "collection_key": collection.key,
        "documents_deleted": documents_deleted,
    })))
}
