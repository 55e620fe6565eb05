//! Multi-query execution: N sub-queries run as independent hybrid calls
//! (planner and external rerank skipped), deduplicated by scope/clause
//! fingerprint, and merged with reciprocal-rank fusion.

use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::time::{timeout, Duration};

use common::error::AppError;

use crate::{
    contract::{ContractService, HybridRetrievalRequest, RerankOptions},
    fusion::rrf_merge,
    leak_canary::LeakCanary,
    trace::{MultiQueryTrace, SubQueryExecution, SubQueryStatus},
    validation::ScopeFilters,
    RetrievalItem,
};

fn default_merge_strategy() -> String {
    "rrf".to_owned()
}
fn default_rrf_k() -> u32 {
    60
}
fn default_top_k() -> usize {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeOptions {
    #[serde(default = "default_merge_strategy")]
    pub strategy: String,
    #[serde(default = "default_rrf_k")]
    pub rrf_k: u32,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            strategy: default_merge_strategy(),
            rrf_k: default_rrf_k(),
            top_k: default_top_k(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubQueryRequest {
    pub id: String,
    pub query: String,
    #[serde(default)]
    pub k: Option<usize>,
    #[serde(default)]
    pub fetch_k: Option<usize>,
    #[serde(default)]
    pub filters: Option<ScopeFilters>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiQueryRetrievalRequest {
    pub tenant_id: String,
    #[serde(default)]
    pub collection_id: Option<String>,
    pub queries: Vec<SubQueryRequest>,
    #[serde(default)]
    pub merge: MergeOptions,
}

#[derive(Debug, Clone, Serialize)]
pub struct MultiQueryRetrievalResponse {
    pub items: Vec<RetrievalItem>,
    pub subqueries: Vec<SubQueryExecution>,
    pub partial: bool,
    pub trace: MultiQueryTrace,
}

impl ContractService {
    pub async fn run_multi_query(
        &self,
        request: &MultiQueryRetrievalRequest,
    ) -> Result<MultiQueryRetrievalResponse, AppError> {
        let started = Instant::now();
        let config = self.config();

        let max_parallel = config.retrieval_multi_query_max_parallel.clamp(1, 8);
        let subquery_timeout =
            Duration::from_millis(config.retrieval_multi_query_subquery_timeout_ms.max(200));
        let drop_out_of_scope = config.retrieval_multi_query_drop_scope_penalized_branches;
        let scope_drop_threshold = config
            .retrieval_multi_query_scope_penalty_drop_threshold
            .clamp(0.0, 1.0);

        // Deduplicate identical sub-query intents before spending budget on
        // them.
        let mut deduped: Vec<&SubQueryRequest> = Vec::new();
        let mut duplicate_subqueries: Vec<SubQueryExecution> = Vec::new();
        let mut seen_keys: std::collections::HashSet<String> = std::collections::HashSet::new();

        for item in &request.queries {
            let clause_id = item
                .filters
                .as_ref()
                .and_then(|filters| filters.metadata.as_ref())
                .and_then(|metadata| metadata.get("clause_id"))
                .and_then(|value| value.as_str());
            let key = self.patterns().scope_clause_key(
                &item.query,
                item.filters
                    .as_ref()
                    .and_then(|filters| filters.source_standard.as_deref()),
                clause_id,
            );
            if !seen_keys.insert(key) {
                duplicate_subqueries.push(SubQueryExecution {
                    id: item.id.clone(),
                    status: SubQueryStatus::Error,
                    items_count: 0,
                    latency_ms: 0.0,
                    error_code: Some("SUBQUERY_SKIPPED_DUPLICATE".into()),
                    error_message: Some("Duplicate subquery scope/clause fingerprint".into()),
                });
                continue;
            }
            deduped.push(item);
        }

        let semaphore = Arc::new(Semaphore::new(max_parallel));
        let top_k = request.merge.top_k.max(1);

        let runs = deduped.iter().map(|item| {
            let semaphore = Arc::clone(&semaphore);
            async move {
                let sq_started = Instant::now();

                let hybrid_request = HybridRetrievalRequest {
                    query: item.query.clone(),
                    tenant_id: request.tenant_id.clone(),
                    collection_id: request.collection_id.clone(),
                    k: item.k.unwrap_or(top_k),
                    fetch_k: item.fetch_k.unwrap_or_else(|| (top_k * 4).max(40)),
                    filters: item.filters.clone(),
                    rerank: Some(RerankOptions { enabled: true }),
                    graph: None,
                    retrieval_plan: None,
                    agent_role: None,
                };

                let result = {
                    let permit = semaphore.acquire().await;
                    if permit.is_err() {
                        return (
                            SubQueryExecution {
                                id: item.id.clone(),
                                status: SubQueryStatus::Error,
                                items_count: 0,
                                latency_ms: elapsed_ms(sq_started),
                                error_code: Some("SUBQUERY_FAILED".into()),
                                error_message: Some("semaphore closed".into()),
                            },
                            Vec::new(),
                        );
                    }
                    timeout(subquery_timeout, self.run_hybrid(&hybrid_request, true, true)).await
                };

                match result {
                    Err(_) => (
                        SubQueryExecution {
                            id: item.id.clone(),
                            status: SubQueryStatus::Error,
                            items_count: 0,
                            latency_ms: elapsed_ms(sq_started),
                            error_code: Some("SUBQUERY_TIMEOUT".into()),
                            error_message: Some("Subquery timed out".into()),
                        },
                        Vec::new(),
                    ),
                    Ok(Err(err)) => (
                        SubQueryExecution {
                            id: item.id.clone(),
                            status: SubQueryStatus::Error,
                            items_count: 0,
                            latency_ms: elapsed_ms(sq_started),
                            error_code: Some("SUBQUERY_FAILED".into()),
                            error_message: Some(err.to_string()),
                        },
                        Vec::new(),
                    ),
                    Ok(Ok(response)) => {
                        let ratio = response.trace.scope_penalized_ratio;
                        if drop_out_of_scope
                            && ratio
                                .map(|ratio| ratio >= scope_drop_threshold && ratio.is_finite())
                                .unwrap_or(false)
                            && response.trace.scope_candidate_count > 0
                        {
                            return (
                                SubQueryExecution {
                                    id: item.id.clone(),
                                    status: SubQueryStatus::Error,
                                    items_count: 0,
                                    latency_ms: elapsed_ms(sq_started),
                                    error_code: Some("SUBQUERY_OUT_OF_SCOPE".into()),
                                    error_message: Some(
                                        "Branch dropped: all candidates were penalized by scope filtering"
                                            .into(),
                                    ),
                                },
                                Vec::new(),
                            );
                        }

                        (
                            SubQueryExecution {
                                id: item.id.clone(),
                                status: SubQueryStatus::Ok,
                                items_count: response.items.len(),
                                latency_ms: elapsed_ms(sq_started),
                                error_code: None,
                                error_message: None,
                            },
                            response.items,
                        )
                    }
                }
            }
        });

        let executions: Vec<(SubQueryExecution, Vec<RetrievalItem>)> = join_all(runs).await;

        let mut grouped_items: Vec<(String, Vec<RetrievalItem>)> = Vec::new();
        let mut subqueries: Vec<SubQueryExecution> = duplicate_subqueries;
        let mut failed_count = 0usize;
        let mut timed_out_count = 0usize;
        let executed_count = executions.len();

        for (execution, items) in executions {
            if execution.status == SubQueryStatus::Error {
                failed_count += 1;
                if execution.error_code.as_deref() == Some("SUBQUERY_TIMEOUT") {
                    timed_out_count += 1;
                }
            } else if !items.is_empty() {
                grouped_items.push((execution.id.clone(), items));
            }
            subqueries.push(execution);
        }

        let trace = MultiQueryTrace {
            merge_strategy: request.merge.strategy.clone(),
            rrf_k: request.merge.rrf_k,
            failed_count,
            timed_out_count,
            max_parallel,
            timings_ms: [("total".to_owned(), elapsed_ms(started))].into(),
            score_space: Some("rrf".to_owned()),
        };

        if grouped_items.is_empty() {
            if executed_count > 0 && failed_count >= executed_count {
                return Err(AppError::Transient(
                    "all multi-query subqueries failed".into(),
                ));
            }
            return Ok(MultiQueryRetrievalResponse {
                items: Vec::new(),
                subqueries,
                partial: failed_count > 0,
                trace,
            });
        }

        let merged = rrf_merge(&grouped_items, request.merge.rrf_k.max(1), top_k);
        LeakCanary::verify_isolation(&request.tenant_id, &merged)?;

        Ok(MultiQueryRetrievalResponse {
            items: merged,
            subqueries,
            partial: failed_count > 0,
            trace,
        })
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    (started.elapsed().as_secs_f64() * 1000.0 * 100.0).round() / 100.0
}
