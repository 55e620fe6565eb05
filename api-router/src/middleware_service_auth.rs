use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;

use crate::{api_state::ApiState, error::ApiError};

/// Service-to-service authentication: `Authorization: Bearer <secret>` or
/// `X-Service-Secret`, compared constant-time against the configured secret.
/// The bypass applies only in non-deployed runtimes with no secret set.
pub async fn service_auth(
    State(state): State<ApiState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let configured = state
        .config
        .rag_service_secret
        .as_deref()
        .map(str::trim)
        .filter(|secret| !secret.is_empty());

    match configured {
        None => {
            if state.config.is_deployed() {
                return Err(ApiError::unauthorized(
                    "service secret is not configured for this deployment",
                ));
            }
            // Non-deployed runtime with no secret: development bypass.
            Ok(next.run(request).await)
        }
        Some(secret) => {
            let presented = extract_secret(&request)
                .ok_or_else(|| ApiError::unauthorized("missing service credentials"))?;

            if secrets_match(secret, &presented) {
                Ok(next.run(request).await)
            } else {
                Err(ApiError::unauthorized("invalid service credentials"))
            }
        }
    }
}

fn extract_secret(request: &Request) -> Option<String> {
    request
        .headers()
        .get("X-Service-Secret")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
        .or_else(|| {
            request
                .headers()
                .get("Authorization")
                .and_then(|value| value.to_str().ok())
                .and_then(|auth| auth.strip_prefix("Bearer "))
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_owned)
        })
}

/// Constant-time equality; length information is the only leak.
fn secrets_match(expected: &str, presented: &str) -> bool {
    let expected = expected.as_bytes();
    let presented = presented.as_bytes();
    if expected.len() != presented.len() {
        return false;
    }
    expected.ct_eq(presented).into()
}
