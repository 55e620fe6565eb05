//! Comprehensive retrieval: late fusion of the chunk, graph, and RAPTOR
//! streams with per-stream error isolation, search-hint expansion, and the
//! retrieval policy (min-score + noise reduction).

use std::time::Instant;

use serde_json::json;

use common::error::AppError;

use crate::{
    contract::{ComprehensiveRetrievalRequest, ContractService, HybridRetrievalRequest},
    fusion::{fuse_late_results, missing_clause_refs, missing_scopes, to_retrieval_items},
    policies::{apply_search_hints, filter_items_by_min_score, reduce_structural_noise},
    trace::{
        ComprehensiveTrace, CoveragePolicyTrace, FusionCounts, FusionQuotas, FusionTrace,
        HybridTrace, RetrievalPolicyTrace,
    },
    RetrievalItem,
};

#[derive(Debug, Clone, serde::Serialize)]
pub struct ComprehensiveRetrievalResponse {
    pub items: Vec<RetrievalItem>,
    pub trace: ComprehensiveTrace,
}

impl ContractService {
    pub async fn run_comprehensive(
        &self,
        request: &ComprehensiveRetrievalRequest,
    ) -> Result<ComprehensiveRetrievalResponse, AppError> {
        let started = Instant::now();
        let mut trace_warnings: Vec<String> = Vec::new();

        // 1. Deterministic search-hint expansion.
        let hints = request
            .retrieval_policy
            .as_ref()
            .map(|policy| policy.search_hints.clone())
            .unwrap_or_default();
        let (expanded_query, hint_trace) = apply_search_hints(&request.query, &hints);

        // 2. Three parallel evidence streams, each with its errors isolated
        //    to warnings.
        let chunks_request = HybridRetrievalRequest {
            query: expanded_query.clone(),
            tenant_id: request.tenant_id.clone(),
            collection_id: request.collection_id.clone(),
            k: request.k,
            fetch_k: request.fetch_k,
            filters: request.filters.clone(),
            rerank: request.rerank.clone(),
            graph: None,
            retrieval_plan: None,
            agent_role: None,
        };

        let graph_options = request
            .graph
            .as_ref()
            .map(crate::contract::GraphOptionsRequest::to_graph_options)
            .unwrap_or_default();

        let (chunks_result, graph_result, raptor_result) = tokio::join!(
            self.run_hybrid(&chunks_request, false, false),
            self.broker().retrieve_graph_nodes(
                &expanded_query,
                &request.tenant_id,
                &graph_options,
                request.k,
                request.collection_id.as_deref(),
            ),
            self.raptor_stream(
                &expanded_query,
                &request.tenant_id,
                request.k,
                request.collection_id.as_deref(),
            ),
        );

        let (mut chunk_items, chunks_trace): (Vec<RetrievalItem>, HybridTrace) = match chunks_result
        {
            Ok(response) => (response.items, response.trace),
            Err(err) => {
                trace_warnings.push(format!("chunks_pipeline_failed:{}", clip(&err.to_string())));
                (Vec::new(), HybridTrace::default())
            }
        };
        for item in &mut chunk_items {
            item.metadata.insert("fusion_source".into(), json!("chunks"));
        }

        let mut graph_items = match graph_result {
            Ok(rows) => to_retrieval_items(&rows),
            Err(err) => {
                trace_warnings.push(format!("graph_pipeline_failed:{}", clip(&err.to_string())));
                Vec::new()
            }
        };
        for item in &mut graph_items {
            item.metadata.insert("fusion_source".into(), json!("graph"));
        }

        let mut raptor_items = match raptor_result {
            Ok(items) => items,
            Err(err) => {
                trace_warnings.push(format!("raptor_pipeline_failed:{}", clip(&err.to_string())));
                Vec::new()
            }
        };
        for item in &mut raptor_items {
            item.metadata.insert("fusion_source".into(), json!("raptor"));
            item.metadata.insert("retrieved_via".into(), json!("raptor"));
            item.metadata
                .insert("raptor_reasoning".into(), json!("RAPTOR cluster expansion"));
        }

        // 3. Quota-driven fusion.
        let merged = fuse_late_results(&chunk_items, &graph_items, &raptor_items, request.k.max(1));
        let fusion_counts = FusionCounts {
            chunks: merged
                .iter()
                .filter(|item| {
                    item.metadata.get("fusion_source").and_then(|v| v.as_str()) == Some("chunks")
                })
                .count(),
            graph: graph_items.len(),
            raptor: raptor_items.len(),
        };

        // 4. Retrieval policy: min-score cutoff + noise reduction.
        let policy = request.retrieval_policy.as_ref();
        let min_score = policy.and_then(|policy| policy.min_score);
        let noise_reduction = policy.map(|policy| policy.noise_reduction).unwrap_or(true);

        let (after_min_score, min_score_trace) = filter_items_by_min_score(merged, min_score);
        let (final_items, noise_trace) = if noise_reduction {
            let (items, trace) = reduce_structural_noise(after_min_score);
            (items, Some(trace))
        } else {
            (after_min_score, None)
        };

        // 5. Coverage reporting against requirements + query references.
        let coverage = request.coverage_requirements.as_ref();
        let query_scopes = self.patterns().extract_requested_standards(&request.query);
        let mut requested_scopes: Vec<String> = Vec::new();
        for scope in coverage
            .map(|coverage| coverage.requested_standards.clone())
            .unwrap_or_default()
            .into_iter()
            .chain(query_scopes)
        {
            let normalized = self.patterns().normalize_scope_name(&scope);
            if !normalized.is_empty() && !requested_scopes.contains(&normalized) {
                requested_scopes.push(normalized);
            }
        }
        let require_all_scopes = coverage
            .and_then(|coverage| coverage.require_all_scopes)
            .unwrap_or(requested_scopes.len() >= 2);
        let min_clause_refs = coverage.map(|coverage| coverage.min_clause_refs).unwrap_or(0);

        let missing_scopes_after = missing_scopes(
            &final_items,
            self.patterns(),
            &requested_scopes,
            require_all_scopes,
        );
        let query_clause_refs = self.patterns().extract_clause_refs(&request.query);
        let missing_clause_refs_after = missing_clause_refs(
            &final_items,
            self.patterns(),
            &query_clause_refs,
            min_clause_refs,
        );

        let mut hybrid = chunks_trace;
        for warning in trace_warnings {
            if !hybrid.warnings.contains(&warning) {
                hybrid.warnings.push(warning);
            }
        }
        hybrid.timings_ms.insert(
            "total".into(),
            (started.elapsed().as_secs_f64() * 1000.0 * 100.0).round() / 100.0,
        );

        let trace = ComprehensiveTrace {
            hybrid,
            fusion: FusionTrace {
                active: true,
                quotas: FusionQuotas::default(),
                counts: fusion_counts,
                final_count: final_items.len(),
            },
            missing_scopes_after,
            missing_clause_refs_after,
            coverage_policy: CoveragePolicyTrace {
                requested_standards: requested_scopes,
                require_all_scopes,
                min_clause_refs,
            },
            retrieval_policy: RetrievalPolicyTrace {
                min_score,
                noise_reduction,
                search_hints_applied: hint_trace,
                min_score_filter: min_score_trace,
                noise_filter: noise_trace,
            },
        };

        Ok(ComprehensiveRetrievalResponse {
            items: final_items,
            trace,
        })
    }

    /// RAPTOR stream: top summaries, late-grounded to their leaf chunks.
    async fn raptor_stream(
        &self,
        query: &str,
        tenant_id: &str,
        k: usize,
        collection_id: Option<&str>,
    ) -> Result<Vec<RetrievalItem>, AppError> {
        let summaries = self
            .broker()
            .retrieve_summaries(query, tenant_id, k, collection_id)
            .await?;
        if summaries.is_empty() {
            return Ok(Vec::new());
        }

        let summary_ids: Vec<String> = summaries.iter().map(|row| row.id.clone()).collect();
        let grounded = self
            .broker()
            .resolve_summaries_to_chunks(&summary_ids, tenant_id)
            .await?;
        Ok(to_retrieval_items(&grounded))
    }
}

fn clip(text: &str) -> String {
    text.chars().take(160).collect()
}
