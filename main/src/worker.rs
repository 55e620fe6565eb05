use std::sync::Arc;

use common::{
    storage::{db::SurrealDbClient, indexes::ensure_runtime_indexes, store::StorageManager},
    storage::types::job::JobType,
    utils::{config::get_config, embedding::EmbeddingProvider},
};
use ingestion_pipeline::{
    community::CommunityWorker,
    dispatcher::JobDispatcher,
    enrichment::EnrichmentPipeline,
    llm::{ModelServices, OpenAiModelServices},
    parser::PlainTextParser,
    processor::DocumentProcessor,
    run_worker_loop,
};
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set up tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let config = Arc::new(get_config()?);

    let db = Arc::new(
        SurrealDbClient::new(
            &config.surrealdb_address,
            &config.surrealdb_username,
            &config.surrealdb_password,
            &config.surrealdb_namespace,
            &config.surrealdb_database,
        )
        .await?,
    );
    db.ensure_initialized().await?;

    let openai_client = Arc::new(async_openai::Client::with_config(
        async_openai::config::OpenAIConfig::new()
            .with_api_key(&config.openai_api_key)
            .with_api_base(&config.openai_base_url),
    ));

    let embedder = Arc::new(EmbeddingProvider::from_config(
        &config,
        Some(Arc::clone(&openai_client)),
    )?);
    ensure_runtime_indexes(&db, embedder.dimension()).await?;

    let storage = StorageManager::new(&config).await?;
    let models: Arc<dyn ModelServices> = Arc::new(OpenAiModelServices::new(
        Arc::clone(&openai_client),
        config.chat_model.clone(),
    ));

    let processor = Arc::new(DocumentProcessor::new(
        Arc::clone(&db),
        storage,
        Arc::clone(&embedder),
        Arc::new(PlainTextParser),
        Arc::clone(&config),
    ));
    let enrichment = Arc::new(EnrichmentPipeline::new(
        Arc::clone(&db),
        Arc::clone(&embedder),
        Arc::clone(&models),
        Arc::clone(&config),
    ));
    let community = Arc::new(CommunityWorker::new(
        Arc::clone(&db),
        Arc::clone(&embedder),
        models,
    ));
    let dispatcher = Arc::new(JobDispatcher::new(
        Arc::clone(&db),
        processor,
        enrichment,
        community,
        &config,
    ));

    // One poll loop per job type; they share the dispatcher's semaphores.
    let mut handles = Vec::new();
    for job_type in [
        JobType::IngestDocument,
        JobType::EnrichDocument,
        JobType::CommunityRebuild,
    ] {
        let db = Arc::clone(&db);
        let dispatcher = Arc::clone(&dispatcher);
        let config = Arc::clone(&config);
        handles.push(tokio::spawn(async move {
            if let Err(err) = run_worker_loop(db, dispatcher, config, job_type).await {
                error!(job_type = job_type.as_token(), error = %err, "worker loop exited");
            }
        }));
    }

    for handle in handles {
        handle.await?;
    }
    Ok(())
}
