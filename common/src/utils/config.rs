use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Local,
    Memory,
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    OpenAi,
    Hashed,
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalEngineMode {
    Atomic,
    Hybrid,
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RerankMode {
    Local,
    Jina,
    Cohere,
    Hybrid,
}

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    // Runtime environment
    #[serde(default = "default_app_env")]
    pub app_env: String,
    #[serde(default)]
    pub running_in_docker: bool,
    #[serde(default)]
    pub rag_service_secret: Option<String>,
    #[serde(default = "default_storage_bucket")]
    pub rag_storage_bucket: String,
    #[serde(default)]
    pub redis_url: Option<String>,

    // SurrealDB
    #[serde(default = "default_surreal_address")]
    pub surrealdb_address: String,
    #[serde(default = "default_surreal_credential")]
    pub surrealdb_username: String,
    #[serde(default = "default_surreal_credential")]
    pub surrealdb_password: String,
    #[serde(default = "default_surreal_namespace")]
    pub surrealdb_namespace: String,
    #[serde(default = "default_surreal_database")]
    pub surrealdb_database: String,

    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_storage_kind")]
    pub storage: StorageKind,

    // Model providers
    #[serde(default)]
    pub openai_api_key: String,
    #[serde(default = "default_base_url")]
    pub openai_base_url: String,
    #[serde(default = "default_embedding_backend")]
    pub embedding_backend: EmbeddingBackend,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: usize,
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    #[serde(default)]
    pub jina_api_key: Option<String>,
    #[serde(default = "default_jina_rerank_url")]
    pub jina_rerank_url: String,
    #[serde(default)]
    pub cohere_api_key: Option<String>,
    #[serde(default = "default_cohere_rerank_url")]
    pub cohere_rerank_url: String,

    // Atomic engine
    #[serde(default = "default_true")]
    pub atomic_use_hybrid_rpc: bool,
    #[serde(default = "default_true")]
    pub atomic_enable_fts: bool,
    #[serde(default = "default_true")]
    pub atomic_enable_graph_hop: bool,
    #[serde(default = "default_match_threshold")]
    pub atomic_match_threshold: f32,
    #[serde(default = "default_rrf_k")]
    pub atomic_rrf_k: u32,
    #[serde(default = "default_weight")]
    pub atomic_rrf_vector_weight: f32,
    #[serde(default = "default_weight")]
    pub atomic_rrf_fts_weight: f32,
    #[serde(default = "default_true")]
    pub atomic_clause_query_weight_boost_enabled: bool,
    #[serde(default = "default_clause_vector_weight")]
    pub atomic_clause_query_rrf_vector_weight: f32,
    #[serde(default = "default_clause_fts_weight")]
    pub atomic_clause_query_rrf_fts_weight: f32,
    #[serde(default = "default_hnsw_ef_search")]
    pub atomic_hnsw_ef_search: usize,

    // Retrieval orchestration
    #[serde(default = "default_engine_mode")]
    pub retrieval_engine_mode: RetrievalEngineMode,
    #[serde(default = "default_rerank_mode")]
    pub rerank_mode: RerankMode,
    #[serde(default = "default_rerank_max_candidates")]
    pub rerank_max_candidates: usize,
    #[serde(default = "default_scope_penalty_factor")]
    pub retrieval_scope_penalty_factor: f32,
    #[serde(default)]
    pub scope_strict_filtering: bool,
    #[serde(default = "default_max_branch_expansions")]
    pub retrieval_plan_max_branch_expansions: usize,
    #[serde(default = "default_early_exit_penalty")]
    pub retrieval_plan_early_exit_scope_penalty: f32,
    #[serde(default = "default_multi_query_max_parallel")]
    pub retrieval_multi_query_max_parallel: usize,
    #[serde(default = "default_subquery_timeout_ms")]
    pub retrieval_multi_query_subquery_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub retrieval_multi_query_drop_scope_penalized_branches: bool,
    #[serde(default = "default_scope_drop_threshold")]
    pub retrieval_multi_query_scope_penalty_drop_threshold: f32,
    #[serde(default = "default_scope_extraction_regex")]
    pub scope_extraction_regex: String,
    #[serde(default = "default_scope_ambiguity_regex")]
    pub scope_ambiguity_regex: String,

    // Ingestion
    #[serde(default = "default_ingestion_max_pending")]
    pub ingestion_max_pending: usize,
    #[serde(default = "default_per_document_estimate")]
    pub ingestion_per_document_estimate_secs: u64,
    #[serde(default = "default_true")]
    pub ingestion_visual_async_enabled: bool,
    #[serde(default = "default_true")]
    pub ingestion_enrichment_async_enabled: bool,
    #[serde(default = "default_graph_batch_size")]
    pub ingestion_graph_batch_size: usize,
    #[serde(default = "default_graph_log_stride")]
    pub ingestion_graph_chunk_log_every_n: usize,
    #[serde(default = "default_chunk_insert_batch")]
    pub content_chunks_insert_batch_size: usize,
    #[serde(default = "default_max_chunk_block")]
    pub max_characters_per_chunking_block: usize,

    // Worker concurrency + retry
    #[serde(default = "default_global_max_concurrency")]
    pub global_max_concurrency: usize,
    #[serde(default = "default_tenant_max_concurrency")]
    pub tenant_max_concurrency: usize,
    #[serde(default = "default_enrichment_tenant_concurrency")]
    pub enrichment_tenant_max_concurrency: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_source_lookup_requeues")]
    pub max_source_lookup_requeues: u32,
    #[serde(default = "default_job_lease_secs")]
    pub job_lease_secs: u64,

    // HTTP surface
    #[serde(default = "default_idempotency_ttl")]
    pub idempotency_ttl_secs: u64,
    #[serde(default = "default_stream_session_timeout")]
    pub batch_stream_session_timeout_secs: u64,
}

impl Default for AppConfig {
    #[allow(clippy::expect_used)]
    fn default() -> Self {
        // Serde's field defaults double as the programmatic defaults.
        serde_json::from_value(serde_json::json!({}))
            .expect("empty AppConfig must deserialize from defaults")
    }
}

fn default_app_env() -> String {
    "development".to_string()
}
fn default_storage_bucket() -> String {
    "rag-documents".to_string()
}
fn default_surreal_address() -> String {
    "ws://localhost:8000".to_string()
}
fn default_surreal_credential() -> String {
    "root".to_string()
}
fn default_surreal_namespace() -> String {
    "rag".to_string()
}
fn default_surreal_database() -> String {
    "rag".to_string()
}
fn default_data_dir() -> String {
    "./data".to_string()
}
fn default_http_port() -> u16 {
    3000
}
fn default_storage_kind() -> StorageKind {
    StorageKind::Local
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_embedding_backend() -> EmbeddingBackend {
    EmbeddingBackend::OpenAi
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_embedding_dimensions() -> usize {
    1536
}
fn default_chat_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_jina_rerank_url() -> String {
    "https://api.jina.ai/v1/rerank".to_string()
}
fn default_cohere_rerank_url() -> String {
    "https://api.cohere.com/v2/rerank".to_string()
}
fn default_true() -> bool {
    true
}
fn default_match_threshold() -> f32 {
    0.25
}
fn default_rrf_k() -> u32 {
    60
}
fn default_weight() -> f32 {
    1.0
}
fn default_clause_vector_weight() -> f32 {
    0.6
}
fn default_clause_fts_weight() -> f32 {
    1.4
}
fn default_hnsw_ef_search() -> usize {
    80
}
fn default_engine_mode() -> RetrievalEngineMode {
    RetrievalEngineMode::Hybrid
}
fn default_rerank_mode() -> RerankMode {
    RerankMode::Local
}
fn default_rerank_max_candidates() -> usize {
    150
}
fn default_scope_penalty_factor() -> f32 {
    0.75
}
fn default_max_branch_expansions() -> usize {
    2
}
fn default_early_exit_penalty() -> f32 {
    0.8
}
fn default_multi_query_max_parallel() -> usize {
    4
}
fn default_subquery_timeout_ms() -> u64 {
    8000
}
fn default_scope_drop_threshold() -> f32 {
    0.95
}
fn default_scope_extraction_regex() -> String {
    r"\b(?:ISO|IEC|EN|NTC)\s?\d{3,5}(?::\d{4})?\b".to_string()
}
fn default_scope_ambiguity_regex() -> String {
    r"\b\d+(?:\.\d+)+\b".to_string()
}
fn default_ingestion_max_pending() -> usize {
    25
}
fn default_per_document_estimate() -> u64 {
    45
}
fn default_graph_batch_size() -> usize {
    4
}
fn default_graph_log_stride() -> usize {
    25
}
fn default_chunk_insert_batch() -> usize {
    100
}
fn default_max_chunk_block() -> usize {
    30_000
}
fn default_global_max_concurrency() -> usize {
    8
}
fn default_tenant_max_concurrency() -> usize {
    1
}
fn default_enrichment_tenant_concurrency() -> usize {
    2
}
fn default_max_retries() -> u32 {
    3
}
fn default_source_lookup_requeues() -> u32 {
    2
}
fn default_job_lease_secs() -> u64 {
    60
}
fn default_idempotency_ttl() -> u64 {
    600
}
fn default_stream_session_timeout() -> u64 {
    1800
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}

impl AppConfig {
    /// Whether the process is running in a deployed environment.
    ///
    /// Service-secret auth may only be bypassed when no deployment signal is
    /// present.
    pub fn is_deployed(&self) -> bool {
        let env = self.app_env.to_ascii_lowercase();
        self.running_in_docker || matches!(env.as_str(), "production" | "staging" | "deployed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_core_settings() {
        let cfg = AppConfig::default();
        assert!(cfg.atomic_use_hybrid_rpc);
        assert!(cfg.atomic_enable_fts);
        assert!(cfg.atomic_enable_graph_hop);
        assert!((cfg.atomic_match_threshold - 0.25).abs() < f32::EPSILON);
        assert_eq!(cfg.rerank_max_candidates, 150);
        assert_eq!(cfg.retrieval_plan_max_branch_expansions, 2);
        assert_eq!(cfg.retrieval_multi_query_subquery_timeout_ms, 8000);
        assert_eq!(cfg.content_chunks_insert_batch_size, 100);
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.max_source_lookup_requeues, 2);
        assert_eq!(cfg.idempotency_ttl_secs, 600);
        assert_eq!(cfg.job_lease_secs, 60);
    }

    #[test]
    fn deployed_detection_honours_docker_flag() {
        let mut cfg = AppConfig::default();
        assert!(!cfg.is_deployed());
        cfg.running_in_docker = true;
        assert!(cfg.is_deployed());
        cfg.running_in_docker = false;
        cfg.app_env = "production".into();
        assert!(cfg.is_deployed());
    }
}
