//! Plan-driven multi-hop execution: runs a `QueryPlan`'s sub-queries in
//! parallel or sequential mode, with an early exit when a branch drifts out
//! of the requested scope, and always runs the root query as a safety branch.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::warn;

use common::{error::AppError, utils::config::AppConfig};

use crate::{
    engine::{AtomicRetrievalEngine, GraphOptions},
    plan::{ExecutionMode, PlannedSubQuery, QueryPlan},
    scoping::{scope_penalty_ratio, ScopeContext, ScopePatterns, ScopeService},
    RetrievalRow,
};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PlanBranchPolicy {
    pub configured_subqueries: usize,
    pub applied_subqueries: usize,
    pub max_branch_expansions: usize,
    pub early_exit_scope_penalty: f32,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PlanEarlyExit {
    pub enabled: bool,
    pub triggered: bool,
    pub subquery_id: u32,
    pub scope_penalized_ratio: f32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PlanTrace {
    pub branch_policy: Option<PlanBranchPolicy>,
    pub early_exit: Option<PlanEarlyExit>,
}

pub struct PlanExecutor<'a> {
    engine: &'a AtomicRetrievalEngine,
    config: Arc<AppConfig>,
    patterns: Arc<ScopePatterns>,
    scope_service: ScopeService,
}

impl<'a> PlanExecutor<'a> {
    pub fn new(
        engine: &'a AtomicRetrievalEngine,
        config: Arc<AppConfig>,
        patterns: Arc<ScopePatterns>,
    ) -> Self {
        Self {
            engine,
            config,
            patterns,
            scope_service: ScopeService,
        }
    }

    pub async fn execute_plan(
        &self,
        query: &str,
        plan: &QueryPlan,
        scope: &ScopeContext,
        k: usize,
        fetch_k: usize,
        graph: &GraphOptions,
    ) -> Result<(Vec<RetrievalRow>, PlanTrace), AppError> {
        if plan.sub_queries.is_empty() {
            let (rows, _engine_trace) = self
                .engine
                .retrieve_context(query, scope, k, fetch_k, graph)
                .await?;
            return Ok((rows, PlanTrace::default()));
        }

        let max_branch_expansions = self.config.retrieval_plan_max_branch_expansions.max(1);
        let selected: Vec<PlannedSubQuery> = plan
            .sub_queries
            .iter()
            .take(max_branch_expansions)
            .cloned()
            .collect();

        let early_exit_penalty = self
            .config
            .retrieval_plan_early_exit_scope_penalty
            .clamp(0.0, 1.0);

        let mut trace = PlanTrace {
            branch_policy: Some(PlanBranchPolicy {
                configured_subqueries: plan.sub_queries.len(),
                applied_subqueries: selected.len(),
                max_branch_expansions,
                early_exit_scope_penalty: early_exit_penalty,
            }),
            early_exit: None,
        };

        let requested_scopes = scope.requested_standards();

        let merged = match plan.execution_mode {
            ExecutionMode::Sequential => {
                self.execute_sequential(
                    query,
                    &selected,
                    scope,
                    &requested_scopes,
                    early_exit_penalty,
                    k,
                    fetch_k,
                    graph,
                    &mut trace,
                )
                .await?
            }
            ExecutionMode::Parallel => {
                self.execute_parallel(query, &selected, scope, k, fetch_k, graph)
                    .await?
            }
        };

        let mut deduped = dedupe_by_id(merged);
        deduped.truncate(k.max(1));
        Ok((deduped, trace))
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_sequential(
        &self,
        query: &str,
        sub_queries: &[PlannedSubQuery],
        scope: &ScopeContext,
        requested_scopes: &[String],
        early_exit_penalty: f32,
        k: usize,
        fetch_k: usize,
        graph: &GraphOptions,
        trace: &mut PlanTrace,
    ) -> Result<Vec<RetrievalRow>, AppError> {
        let mut merged: Vec<RetrievalRow> = Vec::new();

        for sub_query in sub_queries {
            let sub_scope = self.scope_service.scope_context_for_subquery(
                &self.patterns,
                scope,
                &sub_query.query,
            );
            let sub_graph = GraphOptions {
                relation_types: sub_query.target_relations.clone(),
                node_types: sub_query.target_node_types.clone(),
                max_hops: graph
                    .max_hops
                    .or(Some(if sub_query.is_deep { 2 } else { 1 })),
            };

            let (rows, _engine_trace) = self
                .engine
                .retrieve_context(&sub_query.query, &sub_scope, k.max(12), fetch_k, &sub_graph)
                .await?;

            let penalty = scope_penalty_ratio(&rows, requested_scopes);
            let all_out_of_scope =
                !requested_scopes.is_empty() && !rows.is_empty() && penalty >= early_exit_penalty;
            merged.extend(rows);

            // A branch that lands entirely out of scope would keep dragging
            // results away from the request; stop and fall through to the
            // safety branch.
            if all_out_of_scope {
                trace.early_exit = Some(PlanEarlyExit {
                    enabled: true,
                    triggered: true,
                    subquery_id: sub_query.id,
                    scope_penalized_ratio: (penalty * 10_000.0).round() / 10_000.0,
                });
                break;
            }
        }

        let (safety, _engine_trace) = self
            .engine
            .retrieve_context(query, scope, k.max(12), fetch_k, graph)
            .await?;
        merged.extend(safety);

        Ok(merged)
    }

    async fn execute_parallel(
        &self,
        query: &str,
        sub_queries: &[PlannedSubQuery],
        scope: &ScopeContext,
        k: usize,
        fetch_k: usize,
        graph: &GraphOptions,
    ) -> Result<Vec<RetrievalRow>, AppError> {
        let limit = self.config.retrieval_multi_query_max_parallel.max(1);
        let semaphore = Arc::new(Semaphore::new(limit));

        let bounded = sub_queries.iter().map(|sub_query| {
            let semaphore = Arc::clone(&semaphore);
            async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|_| AppError::InternalError("plan semaphore closed".into()))?;
                let sub_scope = self.scope_service.scope_context_for_subquery(
                    &self.patterns,
                    scope,
                    &sub_query.query,
                );
                let sub_graph = GraphOptions {
                    relation_types: sub_query.target_relations.clone(),
                    node_types: sub_query.target_node_types.clone(),
                    max_hops: Some(if sub_query.is_deep { 2 } else { 1 }),
                };
                self.engine
                    .retrieve_context(&sub_query.query, &sub_scope, k.max(12), fetch_k, &sub_graph)
                    .await
                    .map(|(rows, _)| rows)
            }
        });

        // The root query always runs as a safety branch.
        let safety = self
            .engine
            .retrieve_context(query, scope, k.max(12), fetch_k, graph);

        let (branch_results, safety_result) = tokio::join!(join_all(bounded), safety);

        let mut merged: Vec<RetrievalRow> = Vec::new();
        for result in branch_results {
            match result {
                Ok(rows) => merged.extend(rows),
                Err(err) => warn!(error = %err, "plan sub-query failed"),
            }
        }
        let (safety_rows, _engine_trace) = safety_result?;
        merged.extend(safety_rows);

        Ok(merged)
    }
}

/// Merge order is deterministic (sub-query order, then rank); identity-based
/// dedupe keeps the first occurrence.
fn dedupe_by_id(rows: Vec<RetrievalRow>) -> Vec<RetrievalRow> {
    let mut seen: HashSet<String> = HashSet::new();
    rows.into_iter()
        .filter(|row| !row.id.is_empty() && seen.insert(row.id.clone()))
        .collect()
}
