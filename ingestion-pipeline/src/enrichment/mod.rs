//! Deferred enrichment: visual anchoring, RAPTOR tree build, and graph
//! extraction, run sequentially per document with each sub-step toggled by
//! the job payload.

pub mod graph;
pub mod raptor;
pub mod visual;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use common::{
    error::AppError,
    storage::db::SurrealDbClient,
    utils::{config::AppConfig, embedding::EmbeddingProvider},
};

use crate::{llm::ModelServices, state_manager::IngestionStateManager};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentRequest {
    pub source_document_id: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub collection_id: Option<String>,
    #[serde(default)]
    pub include_visual: bool,
    #[serde(default = "default_true")]
    pub include_graph: bool,
    #[serde(default = "default_true")]
    pub include_raptor: bool,
}

fn default_true() -> bool {
    true
}

pub struct EnrichmentPipeline {
    db: Arc<SurrealDbClient>,
    embedder: Arc<EmbeddingProvider>,
    models: Arc<dyn ModelServices>,
    config: Arc<AppConfig>,
    state: IngestionStateManager,
}

impl EnrichmentPipeline {
    pub fn new(
        db: Arc<SurrealDbClient>,
        embedder: Arc<EmbeddingProvider>,
        models: Arc<dyn ModelServices>,
        config: Arc<AppConfig>,
    ) -> Self {
        let state = IngestionStateManager::new(Arc::clone(&db), config.max_retries);
        Self {
            db,
            embedder,
            models,
            config,
            state,
        }
    }

    pub fn db(&self) -> &Arc<SurrealDbClient> {
        &self.db
    }

    /// Run the enabled sub-steps in order (visual, then RAPTOR, then graph).
    /// Sub-step failures degrade to warnings on the result; enrichment never
    /// un-readies a searchable document.
    #[tracing::instrument(skip_all, fields(doc_id = %request.source_document_id))]
    pub async fn run_deferred_enrichment(
        &self,
        request: &EnrichmentRequest,
    ) -> Result<serde_json::Value, AppError> {
        let tenant_id = request.tenant_id.clone().unwrap_or_default();
        if tenant_id.trim().is_empty() {
            return Err(AppError::Validation(
                "enrichment requires a tenant-scoped document".into(),
            ));
        }

        let mut result = json!({
            "ok": true,
            "source_document_id": request.source_document_id,
            "visual": { "enabled": request.include_visual },
            "raptor": { "enabled": request.include_raptor },
            "graph": { "enabled": request.include_graph },
        });
        let mut warnings: Vec<String> = Vec::new();

        if request.include_visual {
            match visual::VisualContextService::new(
                Arc::clone(&self.db),
                Arc::clone(&self.models),
                &self.state,
            )
            .run_if_needed(&request.source_document_id, &tenant_id)
            .await
            {
                Ok(stats) => result["visual"] = serde_json::to_value(stats)?,
                Err(err) => {
                    warn!(error = %err, "visual enrichment failed");
                    warnings.push(format!("visual:{err}"));
                }
            }
        }

        if request.include_raptor {
            match raptor::RaptorBuilder::new(
                Arc::clone(&self.db),
                Arc::clone(&self.embedder),
                Arc::clone(&self.models),
                &self.state,
            )
            .build_if_needed(
                &request.source_document_id,
                &tenant_id,
                request.collection_id.as_deref(),
            )
            .await
            {
                Ok(stats) => result["raptor"] = serde_json::to_value(stats)?,
                Err(err) => {
                    warn!(error = %err, "raptor enrichment failed");
                    warnings.push(format!("raptor:{err}"));
                }
            }
        }

        if request.include_graph {
            match graph::GraphEnricher::new(
                Arc::clone(&self.db),
                Arc::clone(&self.embedder),
                Arc::clone(&self.models),
                Arc::clone(&self.config),
                &self.state,
            )
            .enrich_document(&request.source_document_id, &tenant_id)
            .await
            {
                Ok(stats) => result["graph"] = serde_json::to_value(stats)?,
                Err(err) => {
                    warn!(error = %err, "graph enrichment failed");
                    warnings.push(format!("graph:{err}"));
                }
            }
        }

        if !warnings.is_empty() {
            result["warnings"] = json!(warnings);
        }
        Ok(result)
    }
}
