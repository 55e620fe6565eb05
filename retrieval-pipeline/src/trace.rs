//! Structured trace records returned alongside retrieval results.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{
    executor::{PlanBranchPolicy, PlanEarlyExit},
    policies::{HintTrace, MinScoreTrace, NoiseTrace},
    scoping::StructuralTrace,
    validation::ScopeIssue,
};

#[derive(Debug, Clone, Serialize, Default)]
pub struct HybridTrace {
    pub filters_applied: serde_json::Map<String, serde_json::Value>,
    pub engine_mode: String,
    pub planner_used: bool,
    pub planner_multihop: bool,
    pub fallback_used: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub planner_source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub planner_skipped_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub planner_fallback_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rpc_contract_status: Option<String>,
    pub timings_ms: BTreeMap<String, f64>,
    pub warnings: Vec<String>,
    pub warning_codes: Vec<String>,
    pub scope_penalized_count: usize,
    pub scope_candidate_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope_penalized_ratio: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score_space: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub requested_scopes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structural_filter: Option<StructuralTrace>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_branch_policy: Option<PlanBranchPolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_early_exit: Option<PlanEarlyExit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub literal_clause_fallback: Option<LiteralClauseFallback>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LiteralClauseFallback {
    pub applied: bool,
    pub clause_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SubQueryStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubQueryExecution {
    pub id: String,
    pub status: SubQueryStatus,
    pub items_count: usize,
    pub latency_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MultiQueryTrace {
    pub merge_strategy: String,
    pub rrf_k: u32,
    pub failed_count: usize,
    pub timed_out_count: usize,
    pub max_parallel: usize,
    pub timings_ms: BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score_space: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FusionTrace {
    pub active: bool,
    pub quotas: FusionQuotas,
    pub counts: FusionCounts,
    pub final_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionQuotas {
    pub chunks: usize,
    pub graph: usize,
    pub raptor: usize,
}

impl Default for FusionQuotas {
    fn default() -> Self {
        Self {
            chunks: crate::fusion::FUSION_QUOTA_CHUNKS,
            graph: crate::fusion::FUSION_QUOTA_GRAPH,
            raptor: crate::fusion::FUSION_QUOTA_RAPTOR,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FusionCounts {
    pub chunks: usize,
    pub graph: usize,
    pub raptor: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CoveragePolicyTrace {
    pub requested_standards: Vec<String>,
    pub require_all_scopes: bool,
    pub min_clause_refs: usize,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct RetrievalPolicyTrace {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_score: Option<f32>,
    pub noise_reduction: bool,
    pub search_hints_applied: HintTrace,
    pub min_score_filter: MinScoreTrace,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub noise_filter: Option<NoiseTrace>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct ComprehensiveTrace {
    #[serde(flatten)]
    pub hybrid: HybridTrace,
    pub fusion: FusionTrace,
    pub missing_scopes_after: Vec<String>,
    pub missing_clause_refs_after: Vec<String>,
    pub coverage_policy: CoveragePolicyTrace,
    pub retrieval_policy: RetrievalPolicyTrace,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct QueryScopeSummary {
    pub requested_standards: Vec<String>,
    pub requires_scope_clarification: bool,
    pub suggested_scopes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NormalizedScope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection_id: Option<String>,
    pub filters: crate::validation::NormalizedFilters,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ValidateScopeResponse {
    pub valid: bool,
    pub normalized_scope: NormalizedScope,
    pub violations: Vec<ScopeIssue>,
    pub warnings: Vec<ScopeIssue>,
    pub query_scope: QueryScopeSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ScoreComponents {
    pub base_similarity: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jina_relevance_score: Option<f32>,
    pub final_score: f32,
    pub scope_penalized: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope_penalty_ratio: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RetrievalPath {
    pub source_layer: String,
    pub source_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MatchedFilters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection_id_match: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_range_match: Option<bool>,
    pub metadata_keys_matched: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExplainedItemDetails {
    pub score_components: ScoreComponents,
    pub retrieval_path: RetrievalPath,
    pub matched_filters: MatchedFilters,
}
