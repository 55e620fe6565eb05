use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(KnowledgeCommunity, "knowledge_community", {
    tenant_id: String,
    member_entity_ids: Vec<String>,
    summary: String,
    embedding: Vec<f32>
});

#[derive(Debug, Clone)]
pub struct ScoredCommunity {
    pub community: KnowledgeCommunity,
    pub score: f32,
}

impl KnowledgeCommunity {
    pub fn new(
        tenant_id: impl Into<String>,
        member_entity_ids: Vec<String>,
        summary: impl Into<String>,
        embedding: Vec<f32>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            tenant_id: tenant_id.into(),
            member_entity_ids,
            summary: summary.into(),
            embedding,
        }
    }

    /// Replace the tenant's communities wholesale; the rebuild worker always
    /// produces the full set.
    pub async fn replace_for_tenant(
        db: &SurrealDbClient,
        tenant_id: &str,
        communities: Vec<Self>,
    ) -> Result<usize, AppError> {
        db.query("DELETE type::table($table) WHERE tenant_id = $tenant_id")
            .bind(("table", Self::table_name()))
            .bind(("tenant_id", tenant_id.to_owned()))
            .await?
            .check()?;

        let count = communities.len();
        for community in communities {
            db.store_item(community).await?;
        }
        Ok(count)
    }

    /// Cosine match over the tenant's communities. Community cardinality is
    /// small, so the scan stays in-process instead of using an HNSW index.
    pub async fn match_communities_by_vector(
        db: &SurrealDbClient,
        tenant_id: &str,
        query_embedding: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredCommunity>, AppError> {
        let rows: Vec<Self> = db
            .query("SELECT * FROM type::table($table) WHERE tenant_id = $tenant_id LIMIT 500")
            .bind(("table", Self::table_name()))
            .bind(("tenant_id", tenant_id.to_owned()))
            .await?
            .take(0)?;

        let mut scored: Vec<ScoredCommunity> = rows
            .into_iter()
            .map(|community| {
                let score = cosine_similarity(&community.embedding, query_embedding);
                ScoredCommunity { community, score }
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.community.id.cmp(&b.community.id))
        });
        scored.truncate(k.max(1));
        Ok(scored)
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a <= f32::EPSILON || norm_b <= f32::EPSILON {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}
