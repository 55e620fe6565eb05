use crate::error::AppError;
use tracing::{debug, warn};

/// Per-request tenant and correlation context.
///
/// Threaded explicitly through every repository and pipeline call; nothing in
/// this workspace hides tenant identity in task-local state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestScope {
    pub tenant_id: String,
    pub correlation_id: String,
}

impl RequestScope {
    pub fn new(tenant_id: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            correlation_id: correlation_id.into(),
        }
    }

    /// Extract a non-empty tenant id from an optional header value.
    pub fn require_tenant(header: Option<&str>) -> Result<String, AppError> {
        let tenant = header.map(str::trim).unwrap_or_default();
        if tenant.is_empty() {
            return Err(AppError::TenantRequired);
        }
        Ok(tenant.to_owned())
    }

    /// Assert that a tenant id carried inside a payload agrees with the
    /// request-scoped tenant. `location` names the offending field on failure.
    pub fn enforce_tenant_match(
        &self,
        payload_tenant: Option<&str>,
        location: &str,
    ) -> Result<String, AppError> {
        let payload = payload_tenant.map(str::trim).filter(|value| !value.is_empty());

        if let Some(payload) = payload {
            if payload != self.tenant_id {
                warn!(
                    tenant_id_header = %self.tenant_id,
                    tenant_id_payload = %payload,
                    tenant_source = location,
                    "tenant mismatch rejected"
                );
                return Err(AppError::TenantMismatch {
                    location: location.to_owned(),
                });
            }
        }

        debug!(
            tenant_id_header = %self.tenant_id,
            tenant_source = location,
            "tenant guard check passed"
        );
        Ok(self.tenant_id.clone())
    }
}
