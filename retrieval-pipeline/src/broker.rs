//! Central orchestrator for knowledge retrieval: strategy execution with
//! fallbacks, the two-layer rerank composition, and the summary/graph streams
//! consumed by late fusion.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::json;
use tracing::warn;

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{content_chunk::ContentChunk, summary_node::SummaryNode},
    },
    utils::{
        config::{AppConfig, RerankMode, RetrievalEngineMode},
        embedding::EmbeddingProvider,
    },
};

use crate::{
    engine::{chunk_to_row, AtomicRetrievalEngine, EngineTrace, GraphOptions},
    executor::{PlanEarlyExit, PlanExecutor},
    fusion::stratify_results,
    plan::coerce_query_plan,
    rerank::{
        apply_external_rerank, AgentRole, CohereReranker, GravityReranker, JinaReranker,
        RetrievalIntent, SemanticReranker, TaskType,
    },
    scoping::{
        apply_scope_penalty, count_scope_penalized, ScopeContext, ScopePatterns, ScopeService,
        StructuralTrace,
    },
    trace::LiteralClauseFallback,
    RetrievalRow,
};

#[derive(Debug, Clone, Default)]
pub struct RetrieveOptions {
    pub k: usize,
    pub fetch_k: usize,
    pub enable_reranking: bool,
    pub skip_planner: bool,
    pub skip_external_rerank: bool,
    pub graph: GraphOptions,
    pub retrieval_plan: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct BrokerTrace {
    pub filters_applied: serde_json::Map<String, serde_json::Value>,
    pub engine_mode: String,
    pub planner_used: bool,
    pub planner_multihop: bool,
    pub planner_source: Option<String>,
    pub planner_skipped_reason: Option<String>,
    pub planner_fallback_reason: Option<String>,
    pub fallback_used: bool,
    pub hybrid_rpc_used: bool,
    pub rpc_contract_status: Option<String>,
    pub timings_ms: BTreeMap<String, f64>,
    pub warnings: Vec<String>,
    pub warning_codes: Vec<String>,
    pub scope_penalized_count: usize,
    pub scope_candidate_count: usize,
    pub scope_penalized_ratio: Option<f32>,
    pub requested_scopes: Vec<String>,
    pub score_space: String,
    pub structural_filter: Option<StructuralTrace>,
    pub plan_branch_policy: Option<crate::executor::PlanBranchPolicy>,
    pub plan_early_exit: Option<PlanEarlyExit>,
    pub literal_clause_fallback: Option<LiteralClauseFallback>,
}

pub struct RetrievalBroker {
    db: Arc<SurrealDbClient>,
    engine: AtomicRetrievalEngine,
    config: Arc<AppConfig>,
    patterns: Arc<ScopePatterns>,
    scope_service: ScopeService,
    gravity: GravityReranker,
    jina: JinaReranker,
    cohere: CohereReranker,
}

impl RetrievalBroker {
    pub fn new(
        db: Arc<SurrealDbClient>,
        embedder: Arc<EmbeddingProvider>,
        config: Arc<AppConfig>,
        patterns: Arc<ScopePatterns>,
    ) -> Self {
        let http_client = reqwest::Client::new();
        let engine = AtomicRetrievalEngine::new(
            Arc::clone(&db),
            embedder,
            Arc::clone(&config),
            Arc::clone(&patterns),
        );

        Self {
            db,
            engine,
            jina: JinaReranker::from_config(&config, http_client.clone()),
            cohere: CohereReranker::from_config(&config, http_client),
            config,
            patterns,
            scope_service: ScopeService,
            gravity: GravityReranker,
        }
    }

    pub fn engine(&self) -> &AtomicRetrievalEngine {
        &self.engine
    }

    pub fn patterns(&self) -> &Arc<ScopePatterns> {
        &self.patterns
    }

    pub fn config(&self) -> &Arc<AppConfig> {
        &self.config
    }

    fn engine_mode(&self) -> RetrievalEngineMode {
        self.config.retrieval_engine_mode
    }

    fn engine_mode_token(&self) -> &'static str {
        match self.engine_mode() {
            RetrievalEngineMode::Atomic => "atomic",
            RetrievalEngineMode::Hybrid => "hybrid",
        }
    }

    /// Main entry point for single-query retrieval orchestration.
    pub async fn retrieve(
        &self,
        query: &str,
        scope: &ScopeContext,
        opts: &RetrieveOptions,
    ) -> Result<(Vec<RetrievalRow>, BrokerTrace), AppError> {
        let total_started = Instant::now();
        let mut trace = BrokerTrace {
            filters_applied: filters_applied(scope),
            engine_mode: self.engine_mode_token().to_owned(),
            score_space: "similarity".to_owned(),
            ..Default::default()
        };

        if query.trim().is_empty() {
            trace.timings_ms.insert("total".into(), 0.0);
            return Ok((Vec::new(), trace));
        }

        let retrieval_started = Instant::now();
        let raw_results = self
            .execute_atomic_strategy(query, scope, opts, &mut trace)
            .await?;
        trace
            .timings_ms
            .insert("retrieval".into(), elapsed_ms(retrieval_started));

        if raw_results.is_empty() {
            trace
                .timings_ms
                .insert("total".into(), elapsed_ms(total_started));
            return Ok((Vec::new(), trace));
        }

        let rerank_started = Instant::now();
        let ranked = if opts.enable_reranking {
            self.apply_reranking(
                query,
                raw_results,
                scope,
                opts.k,
                opts.skip_external_rerank,
                &mut trace,
            )
            .await
        } else {
            let mut rows = raw_results;
            rows.truncate(opts.k.max(1));
            rows
        };
        trace
            .timings_ms
            .insert("rerank".into(), elapsed_ms(rerank_started));
        trace
            .timings_ms
            .insert("total".into(), elapsed_ms(total_started));

        Ok((ranked, trace))
    }

    async fn execute_atomic_strategy(
        &self,
        query: &str,
        scope: &ScopeContext,
        opts: &RetrieveOptions,
        trace: &mut BrokerTrace,
    ) -> Result<Vec<RetrievalRow>, AppError> {
        let plan = opts
            .retrieval_plan
            .as_ref()
            .and_then(coerce_query_plan);

        let planner_used =
            !opts.skip_planner && plan.as_ref().map(|p| !p.sub_queries.is_empty()).unwrap_or(false);

        trace.planner_used = planner_used;
        trace.planner_multihop = plan.as_ref().map(|p| p.is_multihop).unwrap_or(false);
        trace.planner_source = Some(if planner_used { "request" } else { "none" }.to_owned());
        if opts.skip_planner {
            trace.planner_skipped_reason = Some("multi_query_subquery".to_owned());
        }
        if let Some(reason) = plan.as_ref().and_then(|p| p.fallback_reason.clone()) {
            trace.planner_fallback_reason = Some(reason);
        }

        let multihop_plan = plan
            .as_ref()
            .filter(|plan| planner_used && plan.is_multihop);

        let engine_result: Result<Vec<RetrievalRow>, AppError> = if let Some(plan_ref) =
            multihop_plan
        {
            let executor = PlanExecutor::new(
                &self.engine,
                Arc::clone(&self.config),
                Arc::clone(&self.patterns),
            );
            executor
                .execute_plan(query, plan_ref, scope, opts.k, opts.fetch_k, &opts.graph)
                .await
                .map(|(rows, plan_trace)| {
                    trace.plan_branch_policy = plan_trace.branch_policy;
                    trace.plan_early_exit = plan_trace.early_exit;
                    rows
                })
        } else {
            self.engine
                .retrieve_context(query, scope, opts.k, opts.fetch_k, &opts.graph)
                .await
                .map(|(rows, engine_trace)| {
                    merge_engine_trace(trace, engine_trace);
                    rows
                })
        };

        let mut raw_results = match engine_result {
            Ok(rows) => rows,
            Err(err) => {
                if self.engine_mode() == RetrievalEngineMode::Atomic {
                    return Err(err);
                }
                warn!(error = %err, "atomic engine failed; degrading to vector fallback");
                trace
                    .warnings
                    .push(format!("atomic_engine_failed:{}", truncate(&err.to_string(), 160)));
                Vec::new()
            }
        };

        // Degraded direct vector search when the hybrid engine came up empty.
        if raw_results.is_empty() && self.engine_mode() == RetrievalEngineMode::Hybrid {
            match self
                .engine
                .search_vectors_only(query, scope, opts.fetch_k)
                .await
            {
                Ok(rows) if !rows.is_empty() => {
                    trace.fallback_used = true;
                    raw_results = rows;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(error = %err, "vector fallback failed");
                    trace
                        .warnings
                        .push(format!("vector_fallback_failed:{}", truncate(&err.to_string(), 160)));
                }
            }
        }

        // A clause filter that matched nothing gets one retry without it.
        if raw_results.is_empty() {
            if let Some(clause_id) = scope.clause_id() {
                let mut relaxed = scope.clone();
                relaxed.metadata.remove("clause_id");
                trace.literal_clause_fallback = Some(LiteralClauseFallback {
                    applied: true,
                    clause_id,
                });
                let (rows, engine_trace) = self
                    .engine
                    .retrieve_context(query, &relaxed, opts.k, opts.fetch_k, &opts.graph)
                    .await?;
                merge_engine_trace(trace, engine_trace);
                raw_results = rows;
            }
        }

        Ok(raw_results)
    }

    async fn apply_reranking(
        &self,
        query: &str,
        rows: Vec<RetrievalRow>,
        scope: &ScopeContext,
        k: usize,
        skip_external: bool,
        trace: &mut BrokerTrace,
    ) -> Vec<RetrievalRow> {
        let requested_scopes = scope.requested_standards();
        let mut working = rows;

        // Local gravity reranking always runs: the business-rule layer that
        // semantic rerankers refine on top of.
        let intent = RetrievalIntent::new(
            query,
            scope
                .agent_role
                .as_deref()
                .map(AgentRole::from_token)
                .unwrap_or_default(),
            TaskType::Explanation,
        );
        self.gravity.rerank(&mut working, &intent);
        trace.score_space = "gravity".to_owned();

        if !requested_scopes.is_empty() {
            apply_scope_penalty(
                &mut working,
                &self.patterns,
                &requested_scopes,
                self.config.retrieval_scope_penalty_factor,
            );
        }

        let candidate_count = working.len();
        let penalized_count = count_scope_penalized(&working);
        trace.scope_penalized_count = penalized_count;
        trace.scope_candidate_count = candidate_count;
        trace.scope_penalized_ratio = Some(if candidate_count == 0 {
            0.0
        } else {
            ((penalized_count as f32 / candidate_count as f32) * 10_000.0).round() / 10_000.0
        });
        trace.requested_scopes = requested_scopes.clone();

        if !requested_scopes.is_empty() && self.config.scope_strict_filtering {
            let kept: Vec<RetrievalRow> = working
                .iter()
                .filter(|row| !row.scope_penalized)
                .cloned()
                .collect();
            if !kept.is_empty() {
                working = kept;
            }
        }

        // Stratify a wide pool before the external pass so hidden scopes can
        // still be rescued by it.
        if requested_scopes.len() > 1 {
            let max_candidates = self
                .config
                .rerank_max_candidates
                .clamp(1, working.len().max(1));
            working = stratify_results(working, &self.patterns, &requested_scopes, max_candidates);
        }

        if !skip_external && !working.is_empty() {
            if let Some(reranker) = self.active_external_reranker() {
                working = apply_external_rerank(
                    reranker,
                    query,
                    working,
                    k,
                    self.config.rerank_max_candidates,
                )
                .await;
                trace.score_space = "semantic_relevance".to_owned();
            }
        }

        if requested_scopes.len() > 1 {
            stratify_results(working, &self.patterns, &requested_scopes, k.max(1))
        } else {
            working.truncate(k.max(1));
            working
        }
    }

    fn active_external_reranker(&self) -> Option<&dyn SemanticReranker> {
        match self.config.rerank_mode {
            RerankMode::Cohere if self.cohere.is_enabled() => Some(&self.cohere),
            RerankMode::Jina | RerankMode::Hybrid if self.jina.is_enabled() => Some(&self.jina),
            _ => None,
        }
    }

    /// RAPTOR summary stream: top-k summary nodes by vector.
    pub async fn retrieve_summaries(
        &self,
        query: &str,
        tenant_id: &str,
        k: usize,
        collection_id: Option<&str>,
    ) -> Result<Vec<RetrievalRow>, AppError> {
        if query.trim().chars().count() < 2 || tenant_id.trim().is_empty() {
            return Ok(Vec::new());
        }

        let query_vector = self.engine.embedder().embed(query).await?;
        let summaries =
            SummaryNode::match_summaries(&self.db, tenant_id, query_vector, k, collection_id)
                .await?;

        Ok(summaries
            .into_iter()
            .map(|scored| {
                let node = scored.node;
                let mut metadata = serde_json::Map::new();
                metadata.insert("is_raptor_summary".into(), json!(true));
                metadata.insert("title".into(), json!(node.title));
                metadata.insert("level".into(), json!(node.level));
                metadata.insert("tenant_id".into(), json!(node.tenant_id));
                metadata.insert("id".into(), json!(node.id));
                if let Some(doc) = &node.source_document_id {
                    metadata.insert("source_id".into(), json!(doc));
                }

                RetrievalRow {
                    id: node.id.clone(),
                    content: node.content,
                    metadata,
                    similarity: scored.score,
                    score: scored.score,
                    source_layer: "raptor".into(),
                    source_type: "summary_node".into(),
                    source_id: node.source_document_id,
                    tenant_id: Some(node.tenant_id),
                    scope_penalized: false,
                    scope_penalty: None,
                    semantic_relevance_score: None,
                }
            })
            .collect())
    }

    /// RAPTOR late grounding: summary nodes resolved down to their leaf
    /// content chunks.
    pub async fn resolve_summaries_to_chunks(
        &self,
        summary_ids: &[String],
        tenant_id: &str,
    ) -> Result<Vec<RetrievalRow>, AppError> {
        if summary_ids.is_empty() {
            return Ok(Vec::new());
        }

        let chunk_ids = SummaryNode::resolve_to_chunk_ids(&self.db, summary_ids).await?;
        if chunk_ids.is_empty() {
            return Ok(Vec::new());
        }

        let chunks = ContentChunk::fetch_by_ids(&chunk_ids, &self.db).await?;
        let mut rows: Vec<RetrievalRow> = chunks
            .into_iter()
            .map(|chunk| {
                let mut row = chunk_to_row(chunk, 0.0, 0.0, "raptor");
                row.set_metadata("retrieved_via", json!("raptor"));
                row
            })
            .collect();

        let allowed: HashSet<String> = rows
            .iter()
            .filter_map(|row| row.metadata_str("source_id"))
            .map(str::to_owned)
            .collect();
        self.scope_service
            .stamp_tenant_context(&mut rows, tenant_id, &allowed);

        Ok(rows)
    }

    /// Graph stream for late fusion: chunk-grounded graph navigation.
    pub async fn retrieve_graph_nodes(
        &self,
        query: &str,
        tenant_id: &str,
        graph: &GraphOptions,
        k: usize,
        collection_id: Option<&str>,
    ) -> Result<Vec<RetrievalRow>, AppError> {
        if query.trim().chars().count() < 2 || tenant_id.trim().is_empty() {
            return Ok(Vec::new());
        }

        let scope = ScopeContext {
            tenant_id: tenant_id.to_owned(),
            collection_id: collection_id.map(str::to_owned),
            ..Default::default()
        };

        let mut rows = self
            .engine
            .retrieve_graph_rows(query, &scope, k * 2, graph)
            .await?;

        let allowed: HashSet<String> = rows
            .iter()
            .filter_map(|row| row.metadata_str("source_id"))
            .map(str::to_owned)
            .collect();
        self.scope_service
            .stamp_tenant_context(&mut rows, tenant_id, &allowed);

        rows.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        rows.truncate(k.max(1));
        Ok(rows)
    }
}

fn filters_applied(scope: &ScopeContext) -> serde_json::Map<String, serde_json::Value> {
    let mut filters = serde_json::Map::new();
    if let Some(collection_id) = &scope.collection_id {
        filters.insert("collection_id".into(), json!(collection_id));
    }
    if let Some(standard) = &scope.source_standard {
        filters.insert("source_standard".into(), json!(standard));
    }
    if !scope.source_standards.is_empty() {
        filters.insert("source_standards".into(), json!(scope.source_standards));
    }
    if !scope.metadata.is_empty() {
        filters.insert("metadata".into(), serde_json::Value::Object(scope.metadata.clone()));
    }
    if let Some(time_range) = &scope.time_range {
        if let Ok(value) = serde_json::to_value(time_range) {
            filters.insert("time_range".into(), value);
        }
    }
    filters
}

fn merge_engine_trace(trace: &mut BrokerTrace, engine_trace: EngineTrace) {
    trace.hybrid_rpc_used = trace.hybrid_rpc_used || engine_trace.hybrid_rpc_used;
    if engine_trace.hybrid_rpc_used {
        trace.rpc_contract_status = Some("fixed".to_owned());
    }
    if trace.structural_filter.is_none() {
        trace.structural_filter = engine_trace.structural_filter;
    }
    for (key, value) in engine_trace.timings_ms {
        trace.timings_ms.entry(format!("engine_{key}")).or_insert(value);
    }
    for warning in engine_trace.warnings {
        if !trace.warnings.contains(&warning) {
            trace.warnings.push(warning);
        }
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    (started.elapsed().as_secs_f64() * 1000.0 * 100.0).round() / 100.0
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}
