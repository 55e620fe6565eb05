//! Two-layer reranking: a deterministic local "gravity" scorer that always
//! runs, plus optional external semantic rerankers (Jina / Cohere) refined on
//! top of it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use common::{
    error::AppError,
    utils::{authority::AuthorityLevel, config::AppConfig},
};

use crate::RetrievalRow;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    #[default]
    SocraticMentor,
    Evaluator,
    ContentCurator,
}

impl AgentRole {
    pub fn from_token(token: &str) -> Self {
        match token.trim().to_ascii_lowercase().as_str() {
            "evaluator" => Self::Evaluator,
            "content_curator" => Self::ContentCurator,
            _ => Self::SocraticMentor,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    #[default]
    Explanation,
    Evaluation,
    Planning,
}

/// What the caller is trying to accomplish; weights authority tiers
/// differently per role/task.
#[derive(Debug, Clone)]
pub struct RetrievalIntent {
    pub query: String,
    pub role: AgentRole,
    pub task: TaskType,
}

impl RetrievalIntent {
    pub fn new(query: impl Into<String>, role: AgentRole, task: TaskType) -> Self {
        Self {
            query: query.into(),
            role,
            task,
        }
    }
}

/// Deterministic local reranker: base similarity combined with a
/// heading-path boost, the document authority weight, and agent-role/task
/// intent weights. Emits `score_space = "gravity"` and records the heading
/// boost for the external layer to respect.
#[derive(Debug, Clone, Default)]
pub struct GravityReranker;

impl GravityReranker {
    pub fn rerank(&self, rows: &mut Vec<RetrievalRow>, intent: &RetrievalIntent) {
        for row in rows.iter_mut() {
            let base = row.semantic_relevance_score.unwrap_or_else(|| {
                if row.similarity > 0.0 {
                    row.similarity
                } else {
                    row.score
                }
            });

            let heading_boost = heading_boost(row, &intent.query);
            let authority = row_authority(row);
            let authority_weight = authority.gravity_weight();
            let intent_weight = intent_weight(intent, authority);

            let score = base * heading_boost * authority_weight * intent_weight;

            row.set_metadata("heading_boost", json!(heading_boost));
            row.set_metadata("authority_weight", json!(authority_weight));
            row.set_metadata("score_space", json!("gravity"));
            row.score = score;
        }

        rows.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
    }
}

/// Boost rows whose heading path overlaps the query terms; an exact clause
/// match in the query outranks everything heading-level.
fn heading_boost(row: &RetrievalRow, query: &str) -> f32 {
    if let Some(clause_id) = row.metadata_str("clause_id") {
        if !clause_id.is_empty() && query.contains(clause_id) {
            return 1.5;
        }
    }

    let heading_text = row
        .metadata
        .get("heading_path")
        .and_then(|value| value.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| part.as_str())
                .collect::<Vec<_>>()
                .join(" ")
                .to_lowercase()
        })
        .unwrap_or_default();

    if heading_text.is_empty() {
        return 1.0;
    }

    let matched_terms = query
        .to_lowercase()
        .split_whitespace()
        .filter(|term| term.len() > 2)
        .filter(|term| heading_text.contains(*term))
        .count();

    match matched_terms {
        0 => 1.0,
        1 => 1.15,
        _ => 1.3,
    }
}

fn row_authority(row: &RetrievalRow) -> AuthorityLevel {
    row.metadata_str("authority_level")
        .and_then(AuthorityLevel::from_token)
        .unwrap_or_default()
}

/// Role/task intent weights; evaluators lean harder on binding material,
/// curators flatten the hierarchy slightly.
fn intent_weight(intent: &RetrievalIntent, authority: AuthorityLevel) -> f32 {
    let binding = matches!(
        authority,
        AuthorityLevel::Constitution | AuthorityLevel::HardConstraint | AuthorityLevel::Policy
    );

    let role_weight = match intent.role {
        AgentRole::Evaluator if binding => 1.1,
        AgentRole::ContentCurator if binding => 0.97,
        _ => 1.0,
    };
    let task_weight = match intent.task {
        TaskType::Evaluation if binding => 1.05,
        _ => 1.0,
    };
    role_weight * task_weight
}

#[derive(Debug, Clone, Deserialize)]
pub struct RerankHit {
    pub index: usize,
    pub relevance_score: f32,
}

/// External semantic reranker port (Jina, Cohere).
#[async_trait]
pub trait SemanticReranker: Send + Sync {
    fn name(&self) -> &'static str;
    fn is_enabled(&self) -> bool;
    async fn rerank_documents(
        &self,
        query: &str,
        documents: &[String],
        top_n: usize,
    ) -> Result<Vec<RerankHit>, AppError>;
}

pub struct JinaReranker {
    client: reqwest::Client,
    api_key: Option<String>,
    url: String,
    model: String,
}

impl JinaReranker {
    pub fn from_config(config: &AppConfig, client: reqwest::Client) -> Self {
        Self {
            client,
            api_key: config.jina_api_key.clone(),
            url: config.jina_rerank_url.clone(),
            model: "jina-reranker-v2-base-multilingual".to_owned(),
        }
    }
}

#[async_trait]
impl SemanticReranker for JinaReranker {
    fn name(&self) -> &'static str {
        "jina"
    }

    fn is_enabled(&self) -> bool {
        self.api_key.is_some()
    }

    async fn rerank_documents(
        &self,
        query: &str,
        documents: &[String],
        top_n: usize,
    ) -> Result<Vec<RerankHit>, AppError> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Ok(Vec::new());
        };

        #[derive(Deserialize)]
        struct JinaResponse {
            results: Vec<JinaResult>,
        }
        #[derive(Deserialize)]
        struct JinaResult {
            index: usize,
            relevance_score: f32,
        }

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(api_key)
            .json(&json!({
                "model": self.model,
                "query": query,
                "documents": documents,
                "top_n": top_n,
            }))
            .send()
            .await?
            .error_for_status()?;

        let parsed: JinaResponse = response.json().await?;
        Ok(parsed
            .results
            .into_iter()
            .map(|hit| RerankHit {
                index: hit.index,
                relevance_score: hit.relevance_score,
            })
            .collect())
    }
}

pub struct CohereReranker {
    client: reqwest::Client,
    api_key: Option<String>,
    url: String,
    model: String,
}

impl CohereReranker {
    pub fn from_config(config: &AppConfig, client: reqwest::Client) -> Self {
        Self {
            client,
            api_key: config.cohere_api_key.clone(),
            url: config.cohere_rerank_url.clone(),
            model: "rerank-v3.5".to_owned(),
        }
    }
}

#[async_trait]
impl SemanticReranker for CohereReranker {
    fn name(&self) -> &'static str {
        "cohere"
    }

    fn is_enabled(&self) -> bool {
        self.api_key.is_some()
    }

    async fn rerank_documents(
        &self,
        query: &str,
        documents: &[String],
        top_n: usize,
    ) -> Result<Vec<RerankHit>, AppError> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Ok(Vec::new());
        };

        #[derive(Deserialize)]
        struct CohereResponse {
            results: Vec<CohereResult>,
        }
        #[derive(Deserialize)]
        struct CohereResult {
            index: usize,
            relevance_score: f32,
        }

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(api_key)
            .json(&json!({
                "model": self.model,
                "query": query,
                "documents": documents,
                "top_n": top_n,
            }))
            .send()
            .await?
            .error_for_status()?;

        let parsed: CohereResponse = response.json().await?;
        Ok(parsed
            .results
            .into_iter()
            .map(|hit| RerankHit {
                index: hit.index,
                relevance_score: hit.relevance_score,
            })
            .collect())
    }
}

/// Floor applied to external scores for structurally-boosted rows: external
/// rerankers sink structurally-matched chunks because they read as loose
/// semantic matches, so the boost must be able to outrank them.
pub const STRUCTURAL_SCORE_FLOOR: f32 = 0.3;

/// Apply an external reranker to the top-N gravity-ordered candidates. Rows
/// the reranker did not score keep their order after the reranked block.
pub async fn apply_external_rerank(
    reranker: &dyn SemanticReranker,
    query: &str,
    rows: Vec<RetrievalRow>,
    k: usize,
    max_candidates: usize,
) -> Vec<RetrievalRow> {
    if rows.is_empty() {
        return rows;
    }

    let candidate_count = max_candidates.clamp(1, rows.len());
    let candidates = &rows[..candidate_count];
    let documents: Vec<String> = candidates.iter().map(|row| row.content.clone()).collect();

    let hits = match reranker
        .rerank_documents(query, &documents, k.min(candidates.len()))
        .await
    {
        Ok(hits) if !hits.is_empty() => hits,
        Ok(_) => return rows,
        Err(err) => {
            warn!(reranker = reranker.name(), error = %err, "external rerank failed");
            return rows;
        }
    };

    let mut reranked: Vec<RetrievalRow> = Vec::new();
    let mut used: Vec<usize> = Vec::new();
    for hit in &hits {
        let Some(source) = candidates.get(hit.index) else {
            continue;
        };
        used.push(hit.index);
        let mut row = source.clone();

        let mut score = hit.relevance_score;
        let boost = row.metadata_f32("heading_boost").unwrap_or(1.0);
        if boost > 1.0 {
            // External scores max out near 1.0; a tiny baseline times the
            // boost would still lose to loose semantic wins, so the floor
            // lets structural intent overrule them.
            score = score.max(STRUCTURAL_SCORE_FLOOR) * boost;
        }

        row.semantic_relevance_score = Some(score);
        row.score = score;
        row.set_metadata("score_space", json!("semantic_relevance"));
        if reranker.name() == "jina" {
            row.set_metadata("jina_relevance_score", json!(score));
        }
        reranked.push(row);
    }

    reranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });

    // Rows not reranked follow in their previous order.
    for (index, row) in rows.into_iter().enumerate() {
        if index < candidate_count && used.contains(&index) {
            continue;
        }
        reranked.push(row);
    }

    reranked
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: &str, similarity: f32, authority: &str, heading: &[&str]) -> RetrievalRow {
        let mut row = RetrievalRow {
            id: id.into(),
            content: format!("content of {id}"),
            similarity,
            score: similarity,
            source_layer: "hybrid".into(),
            source_type: "content_chunk".into(),
            ..Default::default()
        };
        row.set_metadata("authority_level", json!(authority));
        row.set_metadata("heading_path", json!(heading));
        row
    }

    fn intent(query: &str) -> RetrievalIntent {
        RetrievalIntent::new(query, AgentRole::SocraticMentor, TaskType::Explanation)
    }

    #[test]
    fn gravity_is_deterministic() {
        let make_rows = || {
            vec![
                row("b", 0.5, "supplementary", &[]),
                row("a", 0.5, "supplementary", &[]),
                row("c", 0.7, "policy", &["welding"]),
            ]
        };

        let reranker = GravityReranker;
        let mut first = make_rows();
        reranker.rerank(&mut first, &intent("welding controls"));
        let mut second = make_rows();
        reranker.rerank(&mut second, &intent("welding controls"));

        let first_ids: Vec<&str> = first.iter().map(|r| r.id.as_str()).collect();
        let second_ids: Vec<&str> = second.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(first_ids, second_ids);
        // Equal-score rows break ties by id.
        assert!(first_ids.ends_with(&["a", "b"]));
    }

    #[test]
    fn authority_outranks_equal_similarity() {
        let reranker = GravityReranker;
        let mut rows = vec![
            row("low", 0.6, "supplementary", &[]),
            row("high", 0.6, "constitution", &[]),
        ];
        reranker.rerank(&mut rows, &intent("quality"));
        assert_eq!(rows[0].id, "high");
        assert_eq!(rows[0].metadata_str("score_space"), Some("gravity"));
    }

    #[test]
    fn heading_overlap_boosts_score() {
        let reranker = GravityReranker;
        let mut rows = vec![
            row("plain", 0.6, "supplementary", &[]),
            row("matched", 0.6, "supplementary", &["welding", "procedures"]),
        ];
        reranker.rerank(&mut rows, &intent("welding procedures quality"));
        assert_eq!(rows[0].id, "matched");
        let boost = rows[0].metadata_f32("heading_boost").expect("boost");
        assert!(boost > 1.0);
    }

    #[test]
    fn clause_match_in_query_gets_top_boost() {
        let mut clause_row = row("clause", 0.4, "supplementary", &[]);
        clause_row.set_metadata("clause_id", json!("8.5.1"));
        let reranker = GravityReranker;
        let mut rows = vec![row("other", 0.5, "supplementary", &[]), clause_row];
        reranker.rerank(&mut rows, &intent("what does 8.5.1 require"));
        assert_eq!(rows[0].id, "clause");
        assert_eq!(rows[0].metadata_f32("heading_boost"), Some(1.5));
    }

    struct StubReranker {
        hits: Vec<RerankHit>,
    }

    #[async_trait]
    impl SemanticReranker for StubReranker {
        fn name(&self) -> &'static str {
            "stub"
        }
        fn is_enabled(&self) -> bool {
            true
        }
        async fn rerank_documents(
            &self,
            _query: &str,
            _documents: &[String],
            _top_n: usize,
        ) -> Result<Vec<RerankHit>, AppError> {
            Ok(self.hits.clone())
        }
    }

    #[tokio::test]
    async fn external_rerank_reorders_and_keeps_unranked_tail() {
        let rows = vec![
            row("a", 0.9, "supplementary", &[]),
            row("b", 0.8, "supplementary", &[]),
            row("c", 0.7, "supplementary", &[]),
        ];

        let stub = StubReranker {
            hits: vec![
                RerankHit {
                    index: 1,
                    relevance_score: 0.95,
                },
                RerankHit {
                    index: 0,
                    relevance_score: 0.2,
                },
            ],
        };

        let reranked = apply_external_rerank(&stub, "query", rows, 2, 2).await;
        let ids: Vec<&str> = reranked.iter().map(|row| row.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
        assert_eq!(
            reranked[0].metadata_str("score_space"),
            Some("semantic_relevance")
        );
        assert_eq!(reranked[2].metadata_str("score_space"), None);
    }

    #[tokio::test]
    async fn structural_boost_floor_lets_heading_rows_win() {
        let mut boosted = row("boosted", 0.5, "supplementary", &["welding"]);
        boosted.set_metadata("heading_boost", json!(1.3_f32));
        let semantic = row("semantic", 0.5, "supplementary", &[]);

        let stub = StubReranker {
            hits: vec![
                // The boosted row gets a tiny semantic score, the plain one a
                // decent one; the floor must flip the ordering.
                RerankHit {
                    index: 0,
                    relevance_score: 0.05,
                },
                RerankHit {
                    index: 1,
                    relevance_score: 0.35,
                },
            ],
        };

        let reranked = apply_external_rerank(&stub, "welding", vec![boosted, semantic], 2, 2).await;
        assert_eq!(reranked[0].id, "boosted");
        let score = reranked[0].semantic_relevance_score.expect("score");
        assert!((score - 0.3 * 1.3).abs() < 1e-5);
    }

    #[tokio::test]
    async fn failed_external_rerank_returns_rows_unchanged() {
        struct FailingReranker;
        #[async_trait]
        impl SemanticReranker for FailingReranker {
            fn name(&self) -> &'static str {
                "failing"
            }
            fn is_enabled(&self) -> bool {
                true
            }
            async fn rerank_documents(
                &self,
                _query: &str,
                _documents: &[String],
                _top_n: usize,
            ) -> Result<Vec<RerankHit>, AppError> {
                Err(AppError::Transient("upstream 503".into()))
            }
        }

        let rows = vec![row("a", 0.9, "supplementary", &[])];
        let reranked = apply_external_rerank(&FailingReranker, "q", rows.clone(), 1, 1).await;
        assert_eq!(reranked.len(), 1);
        assert_eq!(reranked[0].id, "a");
    }
}
