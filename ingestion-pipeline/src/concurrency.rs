//! Per-tenant concurrency gating for workers.
//!
//! Two gates: a per-tenant semaphore (created lazily, never reclaimed; fine
//! at realistic tenant cardinality) and a global semaphore shared across all
//! tenants. Acquisition order is tenant-then-global; an in-flight set on
//! `source_document_id` makes jobs for the same document mutually exclusive
//! without consuming a slot.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use common::error::AppError;

#[derive(Debug)]
pub enum SlotDenied {
    AlreadyProcessing,
}

pub struct TenantConcurrencyManager {
    tenant_limit: usize,
    tenants: Mutex<HashMap<String, Arc<Semaphore>>>,
    active_documents: Arc<Mutex<HashSet<String>>>,
}

/// RAII guard for an acquired slot; releases global, then tenant, then the
/// document marker in reverse acquisition order on drop.
pub struct TenantSlot {
    _global_permit: OwnedSemaphorePermit,
    _tenant_permit: OwnedSemaphorePermit,
    document_guard: DocumentGuard,
}

impl TenantSlot {
    pub fn document_id(&self) -> &str {
        &self.document_guard.document_id
    }
}

struct DocumentGuard {
    document_id: String,
    active_documents: Arc<Mutex<HashSet<String>>>,
}

impl Drop for DocumentGuard {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active_documents.lock() {
            active.remove(&self.document_id);
        }
    }
}

impl TenantConcurrencyManager {
    pub fn new(tenant_limit: usize) -> Self {
        Self {
            tenant_limit: tenant_limit.max(1),
            tenants: Mutex::new(HashMap::new()),
            active_documents: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn tenant_semaphore(&self, tenant_id: &str) -> Result<Arc<Semaphore>, AppError> {
        let mut tenants = self
            .tenants
            .lock()
            .map_err(|_| AppError::InternalError("tenant semaphore map poisoned".into()))?;
        Ok(Arc::clone(tenants.entry(tenant_id.to_owned()).or_insert_with(
            || Arc::new(Semaphore::new(self.tenant_limit)),
        )))
    }

    /// Acquire a slot for `(tenant, document)`. Returns `SlotDenied` when a
    /// job for the same document is already in flight.
    pub async fn acquire(
        &self,
        tenant_id: &str,
        document_id: &str,
        global: &Arc<Semaphore>,
    ) -> Result<Result<TenantSlot, SlotDenied>, AppError> {
        {
            let mut active = self
                .active_documents
                .lock()
                .map_err(|_| AppError::InternalError("active document set poisoned".into()))?;
            if !active.insert(document_id.to_owned()) {
                return Ok(Err(SlotDenied::AlreadyProcessing));
            }
        }

        let document_guard = DocumentGuard {
            document_id: document_id.to_owned(),
            active_documents: Arc::clone(&self.active_documents),
        };

        let tenant_semaphore = self.tenant_semaphore(tenant_id)?;
        let tenant_permit = tenant_semaphore
            .acquire_owned()
            .await
            .map_err(|_| AppError::InternalError("tenant semaphore closed".into()))?;
        let global_permit = Arc::clone(global)
            .acquire_owned()
            .await
            .map_err(|_| AppError::InternalError("global semaphore closed".into()))?;

        Ok(Ok(TenantSlot {
            _global_permit: global_permit,
            _tenant_permit: tenant_permit,
            document_guard,
        }))
    }

    pub fn active_document_count(&self) -> usize {
        self.active_documents
            .lock()
            .map(|active| active.len())
            .unwrap_or(0)
    }
}
