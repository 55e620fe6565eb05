//! Post-hoc tenant isolation verification over final result sets.
//!
//! Retrieval queries are already tenant-filtered at the storage layer; the
//! canary is the independent check that nothing slipped through a merge or
//! fallback path. A violation is a backend contract breach, never a warning.

use common::error::AppError;
use tracing::error;

use crate::RetrievalItem;

pub struct LeakCanary;

impl LeakCanary {
    /// Assert every item either belongs to `tenant_id` or is explicitly
    /// global. Items without ownership metadata pass (synthetic rows carry no
    /// tenant), items with a foreign tenant fail the whole response.
    pub fn verify_isolation(tenant_id: &str, items: &[RetrievalItem]) -> Result<(), AppError> {
        let tenant_id = tenant_id.trim();
        if tenant_id.is_empty() {
            return Ok(());
        }

        for item in items {
            let row_tenant = item
                .metadata
                .get("tenant_id")
                .and_then(|value| value.as_str())
                .map(str::trim)
                .unwrap_or_default();
            if row_tenant.is_empty() || row_tenant == tenant_id {
                continue;
            }

            let is_global = item
                .metadata
                .get("is_global")
                .and_then(|value| value.as_bool())
                .unwrap_or(false);
            if is_global {
                continue;
            }

            error!(
                expected_tenant = tenant_id,
                observed_tenant = row_tenant,
                source = %item.source,
                "tenant isolation breach detected in final results"
            );
            return Err(AppError::TenantIsolation(format!(
                "result row {} belongs to tenant {row_tenant}, expected {tenant_id}",
                item.source
            )));
        }

        Ok(())
    }
}
