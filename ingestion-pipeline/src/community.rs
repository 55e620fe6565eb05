//! Tenant-wide community rebuild: connected components over the entity
//! graph, a dense summary and embedding per community. Runs one tenant at a
//! time under its own semaphore.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            knowledge_community::KnowledgeCommunity,
            knowledge_entity::{KnowledgeEntity, RAPTOR_SUMMARY_TYPE},
            knowledge_relationship::KnowledgeRelationship,
        },
    },
    utils::embedding::EmbeddingProvider,
};

use crate::llm::ModelServices;

const ENTITY_SCAN_CAP: usize = 2000;
const MAX_COMMUNITIES: usize = 20;
const MIN_COMMUNITY_SIZE: usize = 2;

#[derive(Debug, Clone, Default, Serialize)]
pub struct CommunityRebuildStats {
    pub entities_scanned: usize,
    pub components_found: usize,
    pub communities_stored: usize,
}

pub struct CommunityWorker {
    db: Arc<SurrealDbClient>,
    embedder: Arc<EmbeddingProvider>,
    models: Arc<dyn ModelServices>,
    // One tenant rebuild at a time across the process.
    gate: Semaphore,
}

impl CommunityWorker {
    pub fn new(
        db: Arc<SurrealDbClient>,
        embedder: Arc<EmbeddingProvider>,
        models: Arc<dyn ModelServices>,
    ) -> Self {
        Self {
            db,
            embedder,
            models,
            gate: Semaphore::new(1),
        }
    }

    #[tracing::instrument(skip_all, fields(tenant_id = %tenant_id))]
    pub async fn rebuild_tenant(&self, tenant_id: &str) -> Result<CommunityRebuildStats, AppError> {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| AppError::InternalError("community gate closed".into()))?;

        let mut stats = CommunityRebuildStats::default();

        let entities = KnowledgeEntity::list_for_tenant(&self.db, tenant_id, ENTITY_SCAN_CAP)
            .await?
            .into_iter()
            // Mirrored summaries belong to the RAPTOR tree, not the domain
            // graph.
            .filter(|entity| entity.entity_type != RAPTOR_SUMMARY_TYPE)
            .collect::<Vec<_>>();
        stats.entities_scanned = entities.len();
        if entities.is_empty() {
            KnowledgeCommunity::replace_for_tenant(&self.db, tenant_id, Vec::new()).await?;
            return Ok(stats);
        }

        let entity_ids: Vec<String> = entities.iter().map(|entity| entity.id.clone()).collect();
        let edges =
            KnowledgeRelationship::edges_for_entities(&self.db, tenant_id, &entity_ids, None)
                .await?;

        let components = connected_components(&entity_ids, &edges);
        stats.components_found = components.len();

        let entity_by_id: HashMap<&str, &KnowledgeEntity> = entities
            .iter()
            .map(|entity| (entity.id.as_str(), entity))
            .collect();

        let mut sized: Vec<Vec<String>> = components
            .into_iter()
            .filter(|component| component.len() >= MIN_COMMUNITY_SIZE)
            .collect();
        sized.sort_by_key(|component| std::cmp::Reverse(component.len()));
        sized.truncate(MAX_COMMUNITIES);

        let mut communities: Vec<KnowledgeCommunity> = Vec::new();
        for component in sized {
            let member_texts: Vec<String> = component
                .iter()
                .filter_map(|id| entity_by_id.get(id.as_str()))
                .map(|entity| {
                    if entity.description.trim().is_empty() {
                        entity.name.clone()
                    } else {
                        format!("{}: {}", entity.name, entity.description)
                    }
                })
                .collect();

            let summary = match self.models.summarize_cluster(&member_texts).await {
                Ok(summary) if !summary.trim().is_empty() => summary,
                Ok(_) => continue,
                Err(err @ AppError::Contract(_)) | Err(err @ AppError::LLMParsing(_)) => {
                    warn!(error = %err, "community summary skipped");
                    continue;
                }
                Err(err) => return Err(err),
            };

            let embedding = self.embedder.embed(&summary).await?;
            communities.push(KnowledgeCommunity::new(
                tenant_id,
                component,
                summary,
                embedding,
            ));
        }

        stats.communities_stored =
            KnowledgeCommunity::replace_for_tenant(&self.db, tenant_id, communities).await?;

        info!(
            entities = stats.entities_scanned,
            communities = stats.communities_stored,
            "community rebuild finished"
        );
        Ok(stats)
    }
}

/// Undirected connected components over the edge list.
fn connected_components(
    entity_ids: &[String],
    edges: &[KnowledgeRelationship],
) -> Vec<Vec<String>> {
    let index_of: HashMap<&str, usize> = entity_ids
        .iter()
        .enumerate()
        .map(|(index, id)| (id.as_str(), index))
        .collect();

    let mut parent: Vec<usize> = (0..entity_ids.len()).collect();

    fn find(parent: &mut Vec<usize>, node: usize) -> usize {
        let mut root = node;
        while parent[root] != root {
            root = parent[root];
        }
        let mut current = node;
        while parent[current] != root {
            let next = parent[current];
            parent[current] = root;
            current = next;
        }
        root
    }

    for edge in edges {
        let (Some(&a), Some(&b)) = (
            index_of.get(edge.in_.as_str()),
            index_of.get(edge.out.as_str()),
        ) else {
            continue;
        };
        let root_a = find(&mut parent, a);
        let root_b = find(&mut parent, b);
        if root_a != root_b {
            parent[root_a] = root_b;
        }
    }

    let mut groups: HashMap<usize, Vec<String>> = HashMap::new();
    for (index, id) in entity_ids.iter().enumerate() {
        let root = find(&mut parent, index);
        groups.entry(root).or_default().push(id.clone());
    }

    let mut components: Vec<Vec<String>> = groups.into_values().collect();
    for component in &mut components {
        component.sort();
    }
    components.sort();
    components
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ChunkGraphExtraction;
    use async_trait::async_trait;
    use common::storage::indexes::ensure_runtime_indexes;
    use uuid::Uuid;

    struct StubModels;

    #[async_trait]
    impl ModelServices for StubModels {
        async fn extract_graph(&self, _batch: &str) -> Result<ChunkGraphExtraction, AppError> {
            Ok(ChunkGraphExtraction::default())
        }
        async fn summarize_cluster(&self, texts: &[String]) -> Result<String, AppError> {
            Ok(format!("Community of {} members", texts.len()))
        }
        async fn describe_visual(&self, _b64: &str, _ct: &str) -> Result<String, AppError> {
            Ok("visual".into())
        }
        async fn chat_answer(&self, _q: &str, _c: &str) -> Result<String, AppError> {
            Ok("answer".into())
        }
        fn provider_label(&self) -> &'static str {
            "stub"
        }
        fn model_label(&self) -> String {
            "stub-model".into()
        }
    }

    #[test]
    fn components_group_linked_entities() {
        let ids: Vec<String> = ["a", "b", "c", "d", "e"]
            .iter()
            .map(|id| (*id).to_owned())
            .collect();
        let edges = vec![
            KnowledgeRelationship::new("a", "b", "t1", "src", "LINKS"),
            KnowledgeRelationship::new("b", "c", "t1", "src", "LINKS"),
            KnowledgeRelationship::new("d", "e", "t1", "src", "LINKS"),
        ];

        let components = connected_components(&ids, &edges);
        assert_eq!(components.len(), 2);
        assert!(components.contains(&vec!["a".to_owned(), "b".to_owned(), "c".to_owned()]));
        assert!(components.contains(&vec!["d".to_owned(), "e".to_owned()]));
    }

    #[tokio::test]
    async fn rebuild_stores_communities_for_connected_groups() {
        let database = Uuid::new_v4().to_string();
        let db = Arc::new(
            SurrealDbClient::memory("community_worker_ns", &database)
                .await
                .expect("in-memory db"),
        );
        db.ensure_initialized().await.expect("schema");
        ensure_runtime_indexes(&db, 8).await.expect("indexes");

        let mut ids = Vec::new();
        for name in ["Risk", "Control", "Audit"] {
            let entity = KnowledgeEntity::upsert_by_name(&db, "t1", name, "desc", "CONCEPT", None)
                .await
                .expect("entity");
            ids.push(entity.id);
        }
        KnowledgeRelationship::new(&ids[0], &ids[1], "t1", "src", "MITIGATED_BY")
            .upsert(&db)
            .await
            .expect("edge");

        let worker = CommunityWorker::new(
            Arc::clone(&db),
            Arc::new(EmbeddingProvider::new_hashed(8).expect("embedder")),
            Arc::new(StubModels),
        );
        let stats = worker.rebuild_tenant("t1").await.expect("rebuild");

        assert_eq!(stats.entities_scanned, 3);
        // Risk+Control form a community; Audit is a singleton and is skipped.
        assert_eq!(stats.communities_stored, 1);

        let matches = KnowledgeCommunity::match_communities_by_vector(
            &db,
            "t1",
            &EmbeddingProvider::new_hashed(8)
                .expect("embedder")
                .embed("Community of 2 members")
                .await
                .expect("embed"),
            5,
        )
        .await
        .expect("match");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].community.member_entity_ids.len(), 2);
    }
}
