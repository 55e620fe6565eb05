//! RAPTOR tree build: recursively cluster chunks by embedding similarity,
//! summarize each cluster, embed the summary, and store the level; repeat
//! until one root remains or the depth cap is reached. Summary nodes are
//! mirrored into the knowledge graph with a distinguishing name suffix.

use std::collections::HashMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::warn;

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            ingestion_event::EventSeverity,
            knowledge_entity::{KnowledgeEntity, RAPTOR_SUMMARY_TYPE},
            knowledge_relationship::KnowledgeRelationship,
            summary_node::SummaryNode,
        },
    },
    utils::embedding::EmbeddingProvider,
};

use crate::{llm::ModelServices, state_manager::IngestionStateManager};

/// Minimum chunk count before a tree is worth building.
const MIN_CHUNKS_FOR_TREE: usize = 6;
const TARGET_CLUSTER_SIZE: usize = 5;
const MAX_DEPTH: u32 = 3;
const CLUSTER_SEED: u64 = 42;

#[derive(Debug, Clone, Default, Serialize)]
pub struct RaptorStats {
    pub built: bool,
    pub chunk_count: usize,
    pub levels: u32,
    pub nodes_created: usize,
    pub clusters_skipped: usize,
    pub structural_bootstrap: bool,
}

#[derive(Debug, Clone)]
struct TreeItem {
    id: String,
    text: String,
    embedding: Vec<f32>,
    section_node_id: Option<String>,
}

pub struct RaptorBuilder<'a> {
    db: Arc<SurrealDbClient>,
    embedder: Arc<EmbeddingProvider>,
    models: Arc<dyn ModelServices>,
    state: &'a IngestionStateManager,
}

impl<'a> RaptorBuilder<'a> {
    pub fn new(
        db: Arc<SurrealDbClient>,
        embedder: Arc<EmbeddingProvider>,
        models: Arc<dyn ModelServices>,
        state: &'a IngestionStateManager,
    ) -> Self {
        Self {
            db,
            embedder,
            models,
            state,
        }
    }

    pub async fn build_if_needed(
        &self,
        source_document_id: &str,
        tenant_id: &str,
        collection_id: Option<&str>,
    ) -> Result<RaptorStats, AppError> {
        let mut stats = RaptorStats::default();

        let leaves = eligible_leaves(&self.db, source_document_id).await?;
        stats.chunk_count = leaves.len();
        if leaves.len() < MIN_CHUNKS_FOR_TREE {
            return Ok(stats);
        }

        stats.structural_bootstrap = leaves.iter().any(|item| item.section_node_id.is_some());
        stats.built = true;

        let mut current: Vec<TreeItem> = leaves;
        let mut level: u32 = 1;
        let mut mirror_by_node: HashMap<String, String> = HashMap::new();

        loop {
            let clusters = if level == 1 && stats.structural_bootstrap {
                // Structural bootstrap: level-1 assignments are seeded by
                // section before vector clustering takes over at higher
                // levels.
                cluster_by_section(&current)
            } else {
                cluster_by_embedding(&current, TARGET_CLUSTER_SIZE)
            };

            let mut next_level: Vec<TreeItem> = Vec::new();
            for (cluster_index, cluster) in clusters.iter().enumerate() {
                let texts: Vec<String> = cluster.iter().map(|item| item.text.clone()).collect();
                let summary = match self.models.summarize_cluster(&texts).await {
                    Ok(summary) if !summary.trim().is_empty() => summary,
                    Ok(_) => {
                        stats.clusters_skipped += 1;
                        continue;
                    }
                    // A misbehaving summarizer skips this cluster only.
                    Err(err @ AppError::Contract(_)) | Err(err @ AppError::LLMParsing(_)) => {
                        warn!(error = %err, "cluster summarization skipped");
                        stats.clusters_skipped += 1;
                        continue;
                    }
                    Err(err) => return Err(err),
                };

                let embedding = self.embedder.embed(&summary).await?;
                let title = format!("L{level} cluster {cluster_index}");

                let (children_ids, children_summary_ids) = if level == 1 {
                    (
                        cluster.iter().map(|item| item.id.clone()).collect(),
                        Vec::new(),
                    )
                } else {
                    (
                        Vec::new(),
                        cluster.iter().map(|item| item.id.clone()).collect::<Vec<_>>(),
                    )
                };

                let mut node = SummaryNode::new(
                    tenant_id,
                    level,
                    title.clone(),
                    summary.clone(),
                    children_ids,
                    children_summary_ids,
                    collection_id.map(str::to_owned),
                    Some(source_document_id.to_owned()),
                );
                if level == 1 {
                    node.section_node_id = cluster
                        .iter()
                        .find_map(|item| item.section_node_id.clone());
                }
                let node_id = node.id.clone();
                SummaryNode::store_with_embedding(node, embedding.clone(), &self.db).await?;
                stats.nodes_created += 1;

                // Mirror into the graph so graph navigation can reach
                // summaries; the suffixed name dodges the per-tenant
                // unique-name constraint on domain entities.
                let mirror = KnowledgeEntity::upsert_by_name(
                    &self.db,
                    tenant_id,
                    &KnowledgeEntity::summary_mirror_name(&title, &node_id),
                    &summary,
                    RAPTOR_SUMMARY_TYPE,
                    Some(source_document_id.to_owned()),
                )
                .await?;
                KnowledgeEntity::store_embedding(&self.db, &mirror.id, tenant_id, embedding.clone())
                    .await?;
                mirror_by_node.insert(node_id.clone(), mirror.id.clone());

                // Parent summary SUMMARIZES its child summaries.
                if level > 1 {
                    for child in cluster {
                        if let Some(child_mirror) = mirror_by_node.get(&child.id) {
                            KnowledgeRelationship::new(
                                &mirror.id,
                                child_mirror,
                                tenant_id,
                                source_document_id,
                                "SUMMARIZES",
                            )
                            .upsert(&self.db)
                            .await?;
                        }
                    }
                }

                // Section node gains a HAS_SUMMARY edge when bootstrap is on.
                if let Some(section_node_id) =
                    cluster.iter().find_map(|item| item.section_node_id.clone())
                {
                    KnowledgeRelationship::new(
                        &section_node_id,
                        &mirror.id,
                        tenant_id,
                        source_document_id,
                        "HAS_SUMMARY",
                    )
                    .upsert(&self.db)
                    .await?;
                }

                next_level.push(TreeItem {
                    id: node_id,
                    text: summary,
                    embedding,
                    section_node_id: None,
                });
            }

            stats.levels = level;
            if next_level.len() <= 1 || level >= MAX_DEPTH {
                break;
            }
            current = next_level;
            level += 1;
        }

        self.state
            .log_step(
                source_document_id,
                &format!(
                    "RAPTOR tree built: {} nodes across {} levels",
                    stats.nodes_created, stats.levels
                ),
                EventSeverity::Success,
                "raptor",
                serde_json::to_value(&stats)?,
            )
            .await?;

        Ok(stats)
    }
}

async fn eligible_leaves(
    db: &SurrealDbClient,
    source_document_id: &str,
) -> Result<Vec<TreeItem>, AppError> {
    #[derive(Deserialize)]
    struct EmbeddingRow {
        source_id: String,
        embedding: Vec<f32>,
        chunk_id: ChunkRef,
    }
    #[derive(Deserialize)]
    struct ChunkRef {
        #[serde(deserialize_with = "common::storage::types::source_document::deserialize_flexible_id")]
        id: String,
        content: String,
        #[serde(default)]
        metadata: serde_json::Value,
    }

    let rows: Vec<EmbeddingRow> = db
        .query(
            "SELECT source_id, embedding, chunk_id FROM content_chunk_embedding \
             WHERE source_id = $source_id FETCH chunk_id",
        )
        .bind(("source_id", source_document_id.to_owned()))
        .await?
        .take(0)?;

    Ok(rows
        .into_iter()
        .filter(|row| row.source_id == source_document_id)
        .map(|row| TreeItem {
            id: row.chunk_id.id,
            text: row.chunk_id.content,
            embedding: row.embedding,
            section_node_id: row
                .chunk_id
                .metadata
                .get("section_node_id")
                .and_then(|value| value.as_str())
                .map(str::to_owned),
        })
        .collect())
}

/// Seeded cosine k-means. Deterministic for a fixed input set; approximates
/// the original's soft clustering closely enough for tree construction.
fn cluster_by_embedding(items: &[TreeItem], target_cluster_size: usize) -> Vec<Vec<TreeItem>> {
    if items.is_empty() {
        return Vec::new();
    }
    let k = items.len().div_ceil(target_cluster_size).max(1);
    if k == 1 {
        return vec![items.to_vec()];
    }

    let mut rng = StdRng::seed_from_u64(CLUSTER_SEED);
    let mut centroids: Vec<Vec<f32>> = (0..k)
        .map(|_| items[rng.gen_range(0..items.len())].embedding.clone())
        .collect();

    let mut assignments = vec![0usize; items.len()];
    for _iteration in 0..8 {
        for (index, item) in items.iter().enumerate() {
            let mut best = (0usize, f32::MIN);
            for (centroid_index, centroid) in centroids.iter().enumerate() {
                let similarity = cosine(&item.embedding, centroid);
                if similarity > best.1 {
                    best = (centroid_index, similarity);
                }
            }
            assignments[index] = best.0;
        }

        for (centroid_index, centroid) in centroids.iter_mut().enumerate() {
            let members: Vec<&TreeItem> = items
                .iter()
                .zip(&assignments)
                .filter(|(_, assignment)| **assignment == centroid_index)
                .map(|(item, _)| item)
                .collect();
            if members.is_empty() {
                continue;
            }
            let dims = centroid.len();
            let mut mean = vec![0f32; dims];
            for member in &members {
                for (axis, value) in member.embedding.iter().enumerate().take(dims) {
                    mean[axis] += value;
                }
            }
            for value in &mut mean {
                *value /= members.len() as f32;
            }
            *centroid = mean;
        }
    }

    let mut clusters: Vec<Vec<TreeItem>> = vec![Vec::new(); k];
    for (item, assignment) in items.iter().zip(&assignments) {
        clusters[*assignment].push(item.clone());
    }
    clusters.retain(|cluster| !cluster.is_empty());
    clusters
}

/// Structural bootstrap: one cluster per section node, unsectioned items
/// pooled together.
fn cluster_by_section(items: &[TreeItem]) -> Vec<Vec<TreeItem>> {
    let mut by_section: HashMap<String, Vec<TreeItem>> = HashMap::new();
    let mut unsectioned: Vec<TreeItem> = Vec::new();
    for item in items {
        match &item.section_node_id {
            Some(section) => by_section.entry(section.clone()).or_default().push(item.clone()),
            None => unsectioned.push(item.clone()),
        }
    }

    let mut sections: Vec<String> = by_section.keys().cloned().collect();
    sections.sort();
    let mut clusters: Vec<Vec<TreeItem>> = sections
        .into_iter()
        .filter_map(|section| by_section.remove(&section))
        .collect();
    if !unsectioned.is_empty() {
        clusters.push(unsectioned);
    }
    clusters
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a <= f32::EPSILON || norm_b <= f32::EPSILON {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}
