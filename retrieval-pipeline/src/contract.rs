//! The retrieval contract service: request validation plus the four public
//! operations (`validate_scope`, `run_hybrid`, `run_multi_query`,
//! `run_explain`) and the comprehensive late-fusion path.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use common::{error::AppError, utils::config::AppConfig};

use crate::{
    broker::{BrokerTrace, RetrieveOptions, RetrievalBroker},
    engine::GraphOptions,
    fusion::to_retrieval_items,
    leak_canary::LeakCanary,
    policies::SearchHint,
    scoping::{ScopeContext, ScopePatterns},
    trace::{
        ExplainedItemDetails, HybridTrace, MatchedFilters, NormalizedScope, QueryScopeSummary,
        RetrievalPath, ScoreComponents, ValidateScopeResponse,
    },
    validation::{
        matches_time_range, metadata_keys_matched, validate_retrieval_filters, ScopeFilters,
        ScopeIssue,
    },
    RetrievalItem,
};

fn default_k() -> usize {
    10
}
fn default_fetch_k() -> usize {
    120
}
fn default_top_n() -> usize {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RerankOptions {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GraphOptionsRequest {
    #[serde(default)]
    pub relation_types: Option<Vec<String>>,
    #[serde(default)]
    pub node_types: Option<Vec<String>>,
    #[serde(default)]
    pub max_hops: Option<u32>,
}

impl GraphOptionsRequest {
    pub fn to_graph_options(&self) -> GraphOptions {
        GraphOptions {
            relation_types: self.relation_types.clone(),
            node_types: self.node_types.clone(),
            max_hops: self.max_hops,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridRetrievalRequest {
    pub query: String,
    pub tenant_id: String,
    #[serde(default)]
    pub collection_id: Option<String>,
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default = "default_fetch_k")]
    pub fetch_k: usize,
    #[serde(default)]
    pub filters: Option<ScopeFilters>,
    #[serde(default)]
    pub rerank: Option<RerankOptions>,
    #[serde(default)]
    pub graph: Option<GraphOptionsRequest>,
    #[serde(default)]
    pub retrieval_plan: Option<serde_json::Value>,
    #[serde(default)]
    pub agent_role: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateScopeRequest {
    pub query: String,
    pub tenant_id: String,
    #[serde(default)]
    pub collection_id: Option<String>,
    #[serde(default)]
    pub filters: Option<ScopeFilters>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplainRetrievalRequest {
    pub query: String,
    pub tenant_id: String,
    #[serde(default)]
    pub collection_id: Option<String>,
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default = "default_fetch_k")]
    pub fetch_k: usize,
    #[serde(default)]
    pub filters: Option<ScopeFilters>,
    #[serde(default)]
    pub rerank: Option<RerankOptions>,
    #[serde(default)]
    pub graph: Option<GraphOptionsRequest>,
    #[serde(default = "default_top_n")]
    pub top_n: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HybridRetrievalResponse {
    pub items: Vec<RetrievalItem>,
    pub trace: HybridTrace,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExplainedRetrievalItem {
    pub source: String,
    pub content: String,
    pub score: f32,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub explain: ExplainedItemDetails,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExplainRetrievalResponse {
    pub items: Vec<ExplainedRetrievalItem>,
    pub trace: HybridTrace,
    pub top_n: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CoverageRequirements {
    #[serde(default)]
    pub requested_standards: Vec<String>,
    #[serde(default)]
    pub require_all_scopes: Option<bool>,
    #[serde(default)]
    pub min_clause_refs: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RetrievalPolicy {
    #[serde(default)]
    pub min_score: Option<f32>,
    #[serde(default = "default_true")]
    pub noise_reduction: bool,
    #[serde(default)]
    pub search_hints: Vec<SearchHint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComprehensiveRetrievalRequest {
    pub query: String,
    pub tenant_id: String,
    #[serde(default)]
    pub collection_id: Option<String>,
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default = "default_fetch_k")]
    pub fetch_k: usize,
    #[serde(default)]
    pub filters: Option<ScopeFilters>,
    #[serde(default)]
    pub rerank: Option<RerankOptions>,
    #[serde(default)]
    pub graph: Option<GraphOptionsRequest>,
    #[serde(default)]
    pub coverage_requirements: Option<CoverageRequirements>,
    #[serde(default)]
    pub retrieval_policy: Option<RetrievalPolicy>,
}

pub struct ContractService {
    broker: Arc<RetrievalBroker>,
    config: Arc<AppConfig>,
    patterns: Arc<ScopePatterns>,
}

impl ContractService {
    pub fn new(
        broker: Arc<RetrievalBroker>,
        config: Arc<AppConfig>,
        patterns: Arc<ScopePatterns>,
    ) -> Self {
        Self {
            broker,
            config,
            patterns,
        }
    }

    pub fn broker(&self) -> &Arc<RetrievalBroker> {
        &self.broker
    }

    pub(crate) fn config(&self) -> &Arc<AppConfig> {
        &self.config
    }

    pub(crate) fn patterns(&self) -> &Arc<ScopePatterns> {
        &self.patterns
    }

    /// Pure validation: filter shape plus a scope-clarification advisory when
    /// the query references clauses without naming a standard.
    pub fn validate_scope(
        &self,
        query: &str,
        tenant_id: &str,
        collection_id: Option<&str>,
        filters: Option<&ScopeFilters>,
    ) -> ValidateScopeResponse {
        let default_filters = ScopeFilters::default();
        let (normalized, violations) =
            validate_retrieval_filters(filters.unwrap_or(&default_filters));

        let requested_standards = self.patterns.extract_requested_standards(query);
        let clause_refs = self.patterns.extract_clause_refs(query);
        let requires_scope_clarification = requested_standards.is_empty()
            && !clause_refs.is_empty()
            && normalized.source_standard.is_none()
            && normalized.source_standards.is_empty();

        let mut warnings = Vec::new();
        if requires_scope_clarification {
            warnings.push(ScopeIssue {
                code: "SCOPE_CLARIFICATION_RECOMMENDED".into(),
                field: "query".into(),
                message: "Query references clauses without naming a standard".into(),
            });
        }

        ValidateScopeResponse {
            valid: violations.is_empty(),
            normalized_scope: NormalizedScope {
                tenant_id: Some(tenant_id.to_owned()),
                collection_id: collection_id.map(str::to_owned),
                filters: normalized,
            },
            violations,
            warnings,
            query_scope: QueryScopeSummary {
                requested_standards: requested_standards.clone(),
                requires_scope_clarification,
                suggested_scopes: requested_standards,
            },
        }
    }

    pub(crate) fn build_scope_context(
        &self,
        validated: &ValidateScopeResponse,
        collection_id: Option<&str>,
        agent_role: Option<&str>,
    ) -> ScopeContext {
        let filters = &validated.normalized_scope.filters;
        ScopeContext {
            tenant_id: validated
                .normalized_scope
                .tenant_id
                .clone()
                .unwrap_or_default(),
            is_global: None,
            collection_id: collection_id
                .map(str::to_owned)
                .or_else(|| validated.normalized_scope.collection_id.clone()),
            source_standard: filters.source_standard.clone(),
            source_standards: filters.source_standards.clone(),
            metadata: filters.metadata.clone(),
            time_range: filters.time_range.clone(),
            agent_role: agent_role.map(str::to_owned),
        }
    }

    /// Single-query retrieval composing the atomic engine, plan executor,
    /// and the two-layer rerank. Always runs the leak canary on final rows.
    pub async fn run_hybrid(
        &self,
        request: &HybridRetrievalRequest,
        skip_planner: bool,
        skip_external_rerank: bool,
    ) -> Result<HybridRetrievalResponse, AppError> {
        let started = Instant::now();

        let validated = self.validate_scope(
            &request.query,
            &request.tenant_id,
            request.collection_id.as_deref(),
            request.filters.as_ref(),
        );
        if !validated.valid {
            let details: Vec<String> = validated
                .violations
                .iter()
                .map(|issue| format!("{}: {}", issue.field, issue.message))
                .collect();
            return Err(AppError::Validation(format!(
                "scope validation failed: {}",
                details.join("; ")
            )));
        }

        let scope = self.build_scope_context(
            &validated,
            request.collection_id.as_deref(),
            request.agent_role.as_deref(),
        );

        let opts = RetrieveOptions {
            k: request.k.max(1),
            fetch_k: request.fetch_k.max(1),
            enable_reranking: request
                .rerank
                .as_ref()
                .map(|rerank| rerank.enabled)
                .unwrap_or(true),
            skip_planner,
            skip_external_rerank,
            graph: request
                .graph
                .as_ref()
                .map(GraphOptionsRequest::to_graph_options)
                .unwrap_or_default(),
            retrieval_plan: request.retrieval_plan.clone(),
        };

        let (rows, broker_trace) = self.broker.retrieve(&request.query, &scope, &opts).await?;
        let items = to_retrieval_items(&rows);
        LeakCanary::verify_isolation(&request.tenant_id, &items)?;

        let validation_warnings: Vec<String> = validated
            .warnings
            .iter()
            .map(|issue| issue.message.clone())
            .collect();

        let mut trace = broker_trace_to_hybrid(broker_trace, started);
        for warning in validation_warnings.into_iter().rev() {
            if !trace.warnings.contains(&warning) {
                trace.warnings.insert(0, warning);
            }
        }

        Ok(HybridRetrievalResponse { items, trace })
    }

    /// `run_hybrid` with the top-N items decorated with score components,
    /// retrieval path, and matched-filter diagnostics.
    pub async fn run_explain(
        &self,
        request: &ExplainRetrievalRequest,
    ) -> Result<ExplainRetrievalResponse, AppError> {
        let hybrid_request = HybridRetrievalRequest {
            query: request.query.clone(),
            tenant_id: request.tenant_id.clone(),
            collection_id: request.collection_id.clone(),
            k: request.k,
            fetch_k: request.fetch_k,
            filters: request.filters.clone(),
            rerank: request.rerank.clone(),
            graph: request.graph.clone(),
            retrieval_plan: None,
            agent_role: None,
        };
        let hybrid = self.run_hybrid(&hybrid_request, false, false).await?;

        let top_n = request.top_n.max(1);
        let metadata_filter = request
            .filters
            .as_ref()
            .and_then(|filters| filters.metadata.clone());
        let time_range = request
            .filters
            .as_ref()
            .and_then(|filters| filters.time_range.clone());

        let items = hybrid
            .items
            .iter()
            .take(top_n)
            .map(|item| {
                let base_similarity = item
                    .metadata
                    .get("similarity")
                    .and_then(|value| value.as_f64())
                    .map(|value| value as f32)
                    .unwrap_or(item.score);
                let jina_score = item
                    .metadata
                    .get("jina_relevance_score")
                    .and_then(|value| value.as_f64())
                    .filter(|value| value.is_finite())
                    .map(|value| value as f32);
                let scope_penalized = item
                    .metadata
                    .get("scope_penalized")
                    .and_then(|value| value.as_bool())
                    .unwrap_or(false);
                let scope_penalty = item
                    .metadata
                    .get("scope_penalty")
                    .and_then(|value| value.as_f64())
                    .filter(|value| value.is_finite())
                    .map(|value| value as f32);

                let collection_id_match = request.collection_id.as_deref().map(|requested| {
                    item.metadata
                        .get("collection_id")
                        .and_then(|value| value.as_str())
                        .map(|value| value == requested)
                        .unwrap_or(false)
                });

                ExplainedRetrievalItem {
                    source: item.source.clone(),
                    content: item.content.clone(),
                    score: item.score,
                    metadata: item.metadata.clone(),
                    explain: ExplainedItemDetails {
                        score_components: ScoreComponents {
                            base_similarity,
                            jina_relevance_score: jina_score,
                            final_score: item.score,
                            scope_penalized,
                            scope_penalty_ratio: scope_penalty,
                        },
                        retrieval_path: RetrievalPath {
                            source_layer: item
                                .metadata
                                .get("source_layer")
                                .and_then(|value| value.as_str())
                                .unwrap_or_default()
                                .to_owned(),
                            source_type: item
                                .metadata
                                .get("source_type")
                                .and_then(|value| value.as_str())
                                .unwrap_or_default()
                                .to_owned(),
                        },
                        matched_filters: MatchedFilters {
                            collection_id_match,
                            time_range_match: matches_time_range(
                                &item.metadata,
                                time_range.as_ref(),
                            ),
                            metadata_keys_matched: metadata_filter
                                .as_ref()
                                .map(|filter| metadata_keys_matched(&item.metadata, filter))
                                .unwrap_or_default(),
                        },
                    },
                }
            })
            .collect();

        Ok(ExplainRetrievalResponse {
            items,
            trace: hybrid.trace,
            top_n,
        })
    }
}

pub(crate) fn broker_trace_to_hybrid(broker_trace: BrokerTrace, started: Instant) -> HybridTrace {
    let mut timings = broker_trace.timings_ms;
    timings
        .entry("total".to_owned())
        .or_insert_with(|| (started.elapsed().as_secs_f64() * 1000.0 * 100.0).round() / 100.0);

    HybridTrace {
        filters_applied: broker_trace.filters_applied,
        engine_mode: broker_trace.engine_mode,
        planner_used: broker_trace.planner_used,
        planner_multihop: broker_trace.planner_multihop,
        fallback_used: broker_trace.fallback_used,
        planner_source: broker_trace.planner_source,
        planner_skipped_reason: broker_trace.planner_skipped_reason,
        planner_fallback_reason: broker_trace.planner_fallback_reason,
        rpc_contract_status: broker_trace.rpc_contract_status,
        timings_ms: timings,
        warnings: broker_trace.warnings,
        warning_codes: broker_trace.warning_codes,
        scope_penalized_count: broker_trace.scope_penalized_count,
        scope_candidate_count: broker_trace.scope_candidate_count,
        scope_penalized_ratio: broker_trace.scope_penalized_ratio,
        score_space: Some(broker_trace.score_space),
        requested_scopes: broker_trace.requested_scopes,
        structural_filter: broker_trace.structural_filter,
        plan_branch_policy: broker_trace.plan_branch_policy,
        plan_early_exit: broker_trace.plan_early_exit,
        literal_clause_fallback: broker_trace.literal_clause_fallback,
    }
}
