use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::error::AppError;
use serde::Serialize;
use serde_json::json;

/// Canonical error shape for all non-2xx responses:
/// `{error: {code, message, details?, request_id}}`.
#[derive(Debug, Clone)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub request_id: Option<String>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.to_owned(),
            message: message.into(),
            details: None,
            request_id: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_request_id(mut self, request_id: &str) -> Self {
        self.request_id = Some(request_id.to_owned());
        self
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
    }

    pub fn not_found(code: &str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, code, message)
    }
}

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        match err {
            AppError::TenantRequired => Self::new(
                StatusCode::BAD_REQUEST,
                "TENANT_HEADER_REQUIRED",
                "X-Tenant-ID header is required",
            ),
            AppError::TenantMismatch { location } => Self::new(
                StatusCode::BAD_REQUEST,
                "TENANT_MISMATCH",
                format!("Tenant in {location} must match X-Tenant-ID header"),
            )
            .with_details(json!({ "location": location })),
            AppError::Auth(message) => Self::unauthorized(message),
            AppError::Backpressure {
                queue_depth,
                max_pending,
                estimated_wait_seconds,
            } => Self::new(
                StatusCode::TOO_MANY_REQUESTS,
                "INGESTION_BACKPRESSURE",
                "Ingestion queue is saturated for this tenant",
            )
            .with_details(json!({
                "queue_depth": queue_depth,
                "max_pending": max_pending,
                "estimated_wait_seconds": estimated_wait_seconds,
            })),
            AppError::CollectionSealed(key) => Self::new(
                StatusCode::CONFLICT,
                "COLLECTION_SEALED",
                format!("Collection {key} is sealed and rejects new documents"),
            ),
            AppError::NotFound(what) => {
                let lowered = what.to_lowercase();
                let code = if lowered.contains("document") {
                    "DOCUMENT_NOT_FOUND"
                } else if lowered.contains("job") {
                    "JOB_NOT_FOUND"
                } else if lowered.contains("batch") {
                    "BATCH_NOT_FOUND"
                } else if lowered.contains("collection") {
                    "COLLECTION_NOT_FOUND"
                } else {
                    "NOT_FOUND"
                };
                Self::not_found(code, format!("Not found: {what}"))
            }
            AppError::Validation(message) => {
                let code = if message.starts_with("scope validation failed") {
                    "SCOPE_VALIDATION_FAILED"
                } else {
                    "VALIDATION_ERROR"
                };
                Self::new(StatusCode::BAD_REQUEST, code, message)
            }
            AppError::TenantIsolation(message) => {
                tracing::error!(error = %message, "backend contract breach");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "BACKEND_CONTRACT_BREACH",
                    "Tenant isolation verification failed",
                )
            }
            AppError::Transient(message) => Self::new(
                StatusCode::BAD_GATEWAY,
                "RETRIEVAL_CHUNKS_FAILED",
                message,
            ),
            other => {
                tracing::error!(error = %other, "internal error");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "Internal server error",
                )
            }
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
    request_id: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": ErrorBody {
                code: self.code,
                message: self.message,
                details: self.details,
                request_id: self.request_id.unwrap_or_default(),
            }
        });
        (self.status, Json(body)).into_response()
    }
}
