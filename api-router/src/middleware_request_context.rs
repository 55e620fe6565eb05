use axum::{
    extract::Request,
    http::HeaderValue,
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

use common::scope::RequestScope;

use crate::error::ApiError;

/// Request-scoped context: a correlation id (inbound `X-Request-ID` or a
/// fresh UUID) and the mandatory `X-Tenant-ID`. Both are carried as an
/// explicit `RequestScope` extension, never in task-local state.
pub async fn request_context(mut request: Request, next: Next) -> Result<Response, ApiError> {
    let correlation_id = request
        .headers()
        .get("X-Request-ID")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let tenant_header = request
        .headers()
        .get("X-Tenant-ID")
        .and_then(|value| value.to_str().ok());

    let tenant_id = RequestScope::require_tenant(tenant_header)
        .map_err(|err| ApiError::from(err).with_request_id(&correlation_id))?;

    let span = tracing::info_span!(
        "request",
        request_id = %correlation_id,
        tenant_id = %tenant_id
    );
    let _entered = span.enter();

    request
        .extensions_mut()
        .insert(RequestScope::new(tenant_id, correlation_id.clone()));
    drop(_entered);

    let mut response = next.run(request).await;
    if let Ok(header_value) = HeaderValue::from_str(&correlation_id) {
        response.headers_mut().insert("X-Request-ID", header_value);
    }
    Ok(response)
}
