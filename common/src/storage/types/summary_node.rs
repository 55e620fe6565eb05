use std::collections::HashSet;

use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(SummaryNode, "summary_node", {
    tenant_id: String,
    collection_id: Option<String>,
    source_document_id: Option<String>,
    level: u32,
    title: String,
    content: String,
    children_ids: Vec<String>,
    children_summary_ids: Vec<String>,
    section_node_id: Option<String>,
    section_ref: Option<String>
});

#[derive(Debug, Clone)]
pub struct ScoredSummary {
    pub node: SummaryNode,
    pub score: f32,
}

impl SummaryNode {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tenant_id: impl Into<String>,
        level: u32,
        title: impl Into<String>,
        content: impl Into<String>,
        children_ids: Vec<String>,
        children_summary_ids: Vec<String>,
        collection_id: Option<String>,
        source_document_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            tenant_id: tenant_id.into(),
            collection_id,
            source_document_id,
            level: level.max(1),
            title: title.into(),
            content: content.into(),
            children_ids,
            children_summary_ids,
            section_node_id: None,
            section_ref: None,
        }
    }

    /// Store a summary node with its vector in one transaction.
    pub async fn store_with_embedding(
        node: SummaryNode,
        embedding: Vec<f32>,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        let node_id = node.id.clone();
        let tenant_id = node.tenant_id.clone();
        let collection_id = node.collection_id.clone();
        let source_document_id = node.source_document_id.clone();

        let response = db
            .client
            .query("BEGIN TRANSACTION;")
            .query(format!(
                "CREATE type::thing('{table}', $node_id) CONTENT $node;",
                table = Self::table_name(),
            ))
            .query(
                "CREATE type::thing('summary_node_embedding', $node_id) SET \
                    node_id = type::thing('summary_node', $node_id), \
                    tenant_id = $tenant_id, \
                    collection_id = $collection_id, \
                    source_document_id = $source_document_id, \
                    embedding = $embedding, \
                    created_at = time::now(), \
                    updated_at = time::now();",
            )
            .query("COMMIT TRANSACTION;")
            .bind(("node_id", node_id))
            .bind(("node", node))
            .bind(("tenant_id", tenant_id))
            .bind(("collection_id", collection_id))
            .bind(("source_document_id", source_document_id))
            .bind(("embedding", embedding))
            .await
            .map_err(AppError::Database)?;
        response.check().map_err(AppError::Database)?;
        Ok(())
    }

    /// Top-k summary nodes by cosine similarity, tenant- and
    /// collection-scoped.
    pub async fn match_summaries(
        db: &SurrealDbClient,
        tenant_id: &str,
        query_embedding: Vec<f32>,
        k: usize,
        collection_id: Option<&str>,
    ) -> Result<Vec<ScoredSummary>, AppError> {
        #[derive(Deserialize)]
        struct Row {
            node_id: SummaryNode,
            score: f32,
        }

        let take = k.max(1);
        let sql = format!(
            r#"
            SELECT
                node_id,
                vector::similarity::cosine(embedding, $embedding) AS score
            FROM summary_node_embedding
            WHERE tenant_id = $tenant_id
              AND ($collection_id = NONE OR collection_id = $collection_id)
              AND embedding <|{take},40|> $embedding
            ORDER BY score DESC
            LIMIT {take}
            FETCH node_id;
            "#,
        );

        let mut response = db
            .query(&sql)
            .bind(("embedding", query_embedding))
            .bind(("tenant_id", tenant_id.to_owned()))
            .bind(("collection_id", collection_id.map(str::to_owned)))
            .await
            .map_err(|e| AppError::InternalError(format!("Surreal query failed: {e}")))?;

        let rows: Vec<Row> = response.take::<Vec<Row>>(0).unwrap_or_default();
        Ok(rows
            .into_iter()
            .map(|row| ScoredSummary {
                node: row.node_id,
                score: row.score,
            })
            .collect())
    }

    /// Late grounding: walk summaries down to base chunk ids.
    ///
    /// `children_ids` on level-1 nodes point at content chunks; higher levels
    /// descend through `children_summary_ids`. A visited set guards against
    /// accidental cycles in hand-edited trees.
    pub async fn resolve_to_chunk_ids(
        db: &SurrealDbClient,
        summary_ids: &[String],
    ) -> Result<Vec<String>, AppError> {
        let mut chunk_ids: Vec<String> = Vec::new();
        let mut seen_chunks: HashSet<String> = HashSet::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut frontier: Vec<String> = summary_ids.to_vec();

        while !frontier.is_empty() {
            frontier.retain(|id| visited.insert(id.clone()));
            if frontier.is_empty() {
                break;
            }

            let nodes: Vec<Self> = db
                .query("SELECT * FROM type::table($table) WHERE id IN $ids")
                .bind(("table", Self::table_name()))
                .bind(("ids", frontier.clone()))
                .await?
                .take(0)?;

            let mut next_frontier = Vec::new();
            for node in nodes {
                if node.level <= 1 {
                    for chunk_id in node.children_ids {
                        if seen_chunks.insert(chunk_id.clone()) {
                            chunk_ids.push(chunk_id);
                        }
                    }
                } else {
                    next_frontier.extend(node.children_summary_ids);
                }
            }
            frontier = next_frontier;
        }

        Ok(chunk_ids)
    }

    pub async fn count_for_document(
        db: &SurrealDbClient,
        source_document_id: &str,
    ) -> Result<usize, AppError> {
        #[derive(Deserialize)]
        struct CountRow {
            count: u64,
        }
        let rows: Vec<CountRow> = db
            .query(
                "SELECT count() AS count FROM type::table($table) \
                 WHERE source_document_id = $doc GROUP ALL",
            )
            .bind(("table", Self::table_name()))
            .bind(("doc", source_document_id.to_owned()))
            .await?
            .take(0)?;
        Ok(rows.first().map_or(0, |row| row.count as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::indexes::ensure_runtime_indexes;
    use uuid::Uuid;

    async fn setup_db() -> SurrealDbClient {
        let database = Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("summary_ns", &database)
            .await
            .expect("in-memory db");
        db.ensure_initialized().await.expect("schema");
        ensure_runtime_indexes(&db, 3).await.expect("runtime indexes");
        db
    }

    #[tokio::test]
    async fn match_summaries_is_tenant_scoped() {
        let db = setup_db().await;

        let own = SummaryNode::new(
            "t1",
            1,
            "Quality overview",
            "Summary of quality clauses",
            vec!["c1".into()],
            vec![],
            None,
            Some("d1".into()),
        );
        SummaryNode::store_with_embedding(own.clone(), vec![1.0, 0.0, 0.0], &db)
            .await
            .expect("store own");

        let foreign = SummaryNode::new(
            "t2",
            1,
            "Foreign overview",
            "Other tenant",
            vec!["c9".into()],
            vec![],
            None,
            None,
        );
        SummaryNode::store_with_embedding(foreign, vec![1.0, 0.0, 0.0], &db)
            .await
            .expect("store foreign");

        let matches = SummaryNode::match_summaries(&db, "t1", vec![1.0, 0.0, 0.0], 5, None)
            .await
            .expect("match");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].node.id, own.id);
    }

    #[tokio::test]
    async fn resolve_descends_to_leaf_chunks() {
        let db = setup_db().await;

        let leaf_a = SummaryNode::new(
            "t1",
            1,
            "Leaf A",
            "covers c1 c2",
            vec!["c1".into(), "c2".into()],
            vec![],
            None,
            None,
        );
        let leaf_b = SummaryNode::new(
            "t1",
            1,
            "Leaf B",
            "covers c2 c3",
            vec!["c2".into(), "c3".into()],
            vec![],
            None,
            None,
        );
        let root = SummaryNode::new(
            "t1",
            2,
            "Root",
            "covers both leaves",
            vec![],
            vec![leaf_a.id.clone(), leaf_b.id.clone()],
            None,
            None,
        );

        for node in [leaf_a, leaf_b, root.clone()] {
            SummaryNode::store_with_embedding(node, vec![0.5, 0.5, 0.0], &db)
                .await
                .expect("store");
        }

        let mut chunk_ids = SummaryNode::resolve_to_chunk_ids(&db, &[root.id])
            .await
            .expect("resolve");
        chunk_ids.sort();
        assert_eq!(chunk_ids, vec!["c1", "c2", "c3"], "deduped leaf chunk ids");
    }

    #[tokio::test]
    async fn resolve_handles_missing_nodes() {
        let db = setup_db().await;
        let chunk_ids = SummaryNode::resolve_to_chunk_ids(&db, &["missing".to_owned()])
            .await
            .expect("resolve");
        assert!(chunk_ids.is_empty());
    }
}
