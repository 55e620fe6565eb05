use std::sync::Arc;
use std::time::Duration;

use common::{
    storage::{db::SurrealDbClient, store::StorageManager},
    utils::{
        backpressure::BackpressureService, config::AppConfig, embedding::EmbeddingProvider,
        idempotency::IdempotencyStore,
    },
};
use ingestion_pipeline::llm::ModelServices;
use retrieval_pipeline::{scoping::ScopePatterns, ContractService, RetrievalBroker};

#[derive(Clone)]
pub struct ApiState {
    pub db: Arc<SurrealDbClient>,
    pub config: Arc<AppConfig>,
    pub storage: StorageManager,
    pub contract: Arc<ContractService>,
    pub backpressure: Arc<BackpressureService>,
    pub idempotency: Arc<IdempotencyStore>,
    pub models: Arc<dyn ModelServices>,
    pub patterns: Arc<ScopePatterns>,
}

impl ApiState {
    /// Wire the retrieval stack on top of shared resources. Construction
    /// order is explicit: patterns → broker → contract.
    pub fn new(
        db: Arc<SurrealDbClient>,
        config: Arc<AppConfig>,
        storage: StorageManager,
        embedder: Arc<EmbeddingProvider>,
        models: Arc<dyn ModelServices>,
    ) -> Result<Self, common::error::AppError> {
        let patterns = Arc::new(ScopePatterns::from_config(&config)?);
        let broker = Arc::new(RetrievalBroker::new(
            Arc::clone(&db),
            embedder,
            Arc::clone(&config),
            Arc::clone(&patterns),
        ));
        let contract = Arc::new(ContractService::new(
            broker,
            Arc::clone(&config),
            Arc::clone(&patterns),
        ));
        let backpressure = Arc::new(BackpressureService::from_config(&config));
        let idempotency = Arc::new(IdempotencyStore::new(Duration::from_secs(
            config.idempotency_ttl_secs,
        )));

        Ok(Self {
            db,
            config,
            storage,
            contract,
            backpressure,
            idempotency,
            models,
            patterns,
        })
    }
}
