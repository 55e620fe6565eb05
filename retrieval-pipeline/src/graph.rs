//! Multi-hop graph navigation: vector-matched anchor entities expanded along
//! `relates_to` edges with per-hop similarity decay. The result is symbolic
//! (entity ids); late grounding back to text happens in the engine.

use std::collections::{HashMap, HashSet};

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{knowledge_entity::KnowledgeEntity, knowledge_relationship::KnowledgeRelationship},
    },
};

#[derive(Debug, Clone)]
pub struct GraphNavRow {
    pub entity_id: String,
    pub entity_name: String,
    pub entity_description: String,
    pub hop_depth: u32,
    pub similarity: f32,
    pub path_ids: Vec<String>,
}

#[allow(clippy::too_many_arguments)]
pub async fn search_multi_hop_context(
    db: &SurrealDbClient,
    tenant_id: &str,
    query_vector: Vec<f32>,
    match_threshold: f32,
    limit_count: usize,
    max_hops: u32,
    decay_factor: f32,
    filter_node_types: Option<&[String]>,
    filter_relation_types: Option<&[String]>,
) -> Result<Vec<GraphNavRow>, AppError> {
    let anchors = KnowledgeEntity::match_by_vector(
        db,
        tenant_id,
        query_vector,
        match_threshold,
        limit_count.max(1),
        filter_node_types,
    )
    .await?;

    if anchors.is_empty() {
        return Ok(Vec::new());
    }

    let mut visited: HashSet<String> = HashSet::new();
    let mut rows: Vec<GraphNavRow> = Vec::new();

    for anchor in &anchors {
        visited.insert(anchor.entity.id.clone());
        rows.push(GraphNavRow {
            entity_id: anchor.entity.id.clone(),
            entity_name: anchor.entity.name.clone(),
            entity_description: anchor.entity.description.clone(),
            hop_depth: 0,
            similarity: anchor.score,
            path_ids: vec![anchor.entity.id.clone()],
        });
    }

    // Frontier carries (entity_id, similarity, path) for the next expansion.
    let mut frontier: Vec<(String, f32, Vec<String>)> = anchors
        .into_iter()
        .map(|anchor| {
            let id = anchor.entity.id;
            (id.clone(), anchor.score, vec![id])
        })
        .collect();

    let result_cap = limit_count.max(1) * 3;

    for hop in 1..=max_hops {
        if frontier.is_empty() || rows.len() >= result_cap {
            break;
        }

        let frontier_ids: Vec<String> = frontier.iter().map(|(id, _, _)| id.clone()).collect();
        let edges = KnowledgeRelationship::edges_for_entities(
            db,
            tenant_id,
            &frontier_ids,
            filter_relation_types,
        )
        .await?;
        if edges.is_empty() {
            break;
        }

        let parent_by_id: HashMap<String, (f32, Vec<String>)> = frontier
            .iter()
            .map(|(id, sim, path)| (id.clone(), (*sim, path.clone())))
            .collect();

        let mut next_frontier: Vec<(String, f32, Vec<String>)> = Vec::new();
        let mut neighbor_sources: HashMap<String, (f32, Vec<String>)> = HashMap::new();

        for edge in edges {
            let (parent, neighbor) = if parent_by_id.contains_key(&edge.in_) {
                (edge.in_.clone(), edge.out.clone())
            } else {
                (edge.out.clone(), edge.in_.clone())
            };
            if visited.contains(&neighbor) {
                continue;
            }
            let Some((parent_sim, parent_path)) = parent_by_id.get(&parent) else {
                continue;
            };
            let decayed = parent_sim * decay_factor;
            let mut path = parent_path.clone();
            path.push(neighbor.clone());

            // Keep the strongest lineage when several edges reach the node.
            match neighbor_sources.get(&neighbor) {
                Some((existing, _)) if *existing >= decayed => {}
                _ => {
                    neighbor_sources.insert(neighbor, (decayed, path));
                }
            }
        }

        if neighbor_sources.is_empty() {
            break;
        }

        let neighbor_ids: Vec<String> = neighbor_sources.keys().cloned().collect();
        let entities = KnowledgeEntity::fetch_by_ids(&neighbor_ids, db).await?;

        for entity in entities {
            if rows.len() >= result_cap {
                break;
            }
            if let Some(types) = filter_node_types {
                if !types.is_empty()
                    && !types
                        .iter()
                        .any(|t| t.eq_ignore_ascii_case(&entity.entity_type))
                {
                    continue;
                }
            }
            let Some((similarity, path)) = neighbor_sources.get(&entity.id) else {
                continue;
            };
            if !visited.insert(entity.id.clone()) {
                continue;
            }

            rows.push(GraphNavRow {
                entity_id: entity.id.clone(),
                entity_name: entity.name.clone(),
                entity_description: entity.description.clone(),
                hop_depth: hop,
                similarity: *similarity,
                path_ids: path.clone(),
            });
            next_frontier.push((entity.id, *similarity, path.clone()));
        }

        frontier = next_frontier;
    }

    rows.sort_by(|a, b| {
        a.hop_depth.cmp(&b.hop_depth).then(
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal),
        )
    });
    rows.truncate(result_cap);
    Ok(rows)
}
