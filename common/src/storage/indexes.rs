use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{error::AppError, storage::db::SurrealDbClient};

const INDEX_POLL_INTERVAL: Duration = Duration::from_millis(50);
const FTS_ANALYZER_NAME: &str = "app_en_fts_analyzer";

#[derive(Clone, Copy)]
struct HnswIndexSpec {
    index_name: &'static str,
    table: &'static str,
}

const fn hnsw_index_specs() -> [HnswIndexSpec; 3] {
    [
        HnswIndexSpec {
            index_name: "idx_embedding_content_chunk",
            table: "content_chunk_embedding",
        },
        HnswIndexSpec {
            index_name: "idx_embedding_knowledge_entity",
            table: "knowledge_entity_embedding",
        },
        HnswIndexSpec {
            index_name: "idx_embedding_summary_node",
            table: "summary_node_embedding",
        },
    ]
}

#[derive(Clone, Copy)]
struct FtsIndexSpec {
    index_name: &'static str,
    table: &'static str,
    field: &'static str,
}

const fn fts_index_specs() -> [FtsIndexSpec; 3] {
    [
        FtsIndexSpec {
            index_name: "content_chunk_fts_content_idx",
            table: "content_chunk",
            field: "content",
        },
        FtsIndexSpec {
            index_name: "knowledge_entity_fts_name_idx",
            table: "knowledge_entity",
            field: "name",
        },
        FtsIndexSpec {
            index_name: "knowledge_entity_fts_description_idx",
            table: "knowledge_entity",
            field: "description",
        },
    ]
}

impl HnswIndexSpec {
    fn definition(&self, dimension: usize) -> String {
        format!(
            "DEFINE INDEX OVERWRITE {index} ON TABLE {table} \
             FIELDS embedding HNSW DIMENSION {dimension} DIST COSINE TYPE F32 EFC 100 M 8;",
            index = self.index_name,
            table = self.table,
        )
    }
}

impl FtsIndexSpec {
    fn definition(&self) -> String {
        format!(
            "DEFINE INDEX IF NOT EXISTS {index} ON TABLE {table} FIELDS {field} \
             SEARCH ANALYZER {analyzer} BM25;",
            index = self.index_name,
            table = self.table,
            field = self.field,
            analyzer = FTS_ANALYZER_NAME,
        )
    }
}

/// Build runtime Surreal indexes (FTS + HNSW).
///
/// Idempotent: safe to call repeatedly; HNSW definitions are overwritten so a
/// changed embedding dimension takes effect on restart.
pub async fn ensure_runtime_indexes(
    db: &SurrealDbClient,
    embedding_dimension: usize,
) -> Result<(), AppError> {
    ensure_runtime_indexes_inner(db, embedding_dimension)
        .await
        .map_err(|err| AppError::InternalError(err.to_string()))
}

async fn ensure_runtime_indexes_inner(
    db: &SurrealDbClient,
    embedding_dimension: usize,
) -> Result<()> {
    create_fts_analyzer(db).await?;

    // FTS definitions clash when submitted concurrently; keep them sequential.
    for spec in fts_index_specs() {
        submit_definition(db, spec.definition(), spec.index_name, spec.table).await?;
        wait_until_ready(db, spec.index_name, spec.table).await?;
    }

    for spec in hnsw_index_specs() {
        submit_definition(db, spec.definition(embedding_dimension), spec.index_name, spec.table)
            .await?;
        wait_until_ready(db, spec.index_name, spec.table).await?;
    }

    Ok(())
}

async fn create_fts_analyzer(db: &SurrealDbClient) -> Result<()> {
    // Prefer snowball stemming; fall back to ascii-only when the filter is
    // unavailable in the running Surreal build.
    let snowball_query = format!(
        "DEFINE ANALYZER IF NOT EXISTS {FTS_ANALYZER_NAME}
            TOKENIZERS class
            FILTERS lowercase, ascii, snowball(english);"
    );

    if let Ok(res) = db.client.query(snowball_query).await {
        if res.check().is_ok() {
            return Ok(());
        }
    }

    warn!(
        analyzer = FTS_ANALYZER_NAME,
        "Snowball analyzer unavailable; defining ascii-only fallback"
    );

    let fallback_query = format!(
        "DEFINE ANALYZER IF NOT EXISTS {FTS_ANALYZER_NAME}
            TOKENIZERS class
            FILTERS lowercase, ascii;"
    );

    db.client
        .query(fallback_query)
        .await
        .context("creating fallback FTS analyzer")?
        .check()
        .context("fallback FTS analyzer definition failed")?;

    Ok(())
}

async fn submit_definition(
    db: &SurrealDbClient,
    definition: String,
    index_name: &str,
    table: &str,
) -> Result<()> {
    let mut attempts = 0;
    const MAX_ATTEMPTS: usize = 3;
    loop {
        attempts += 1;
        let res = db
            .client
            .query(definition.clone())
            .await
            .with_context(|| format!("creating index {index_name} on table {table}"))?;
        match res.check() {
            Ok(_) => return Ok(()),
            Err(err) => {
                let conflict = err.to_string().contains("read or write conflict");
                warn!(
                    index = %index_name,
                    table = %table,
                    error = ?err,
                    attempt = attempts,
                    "Index definition failed"
                );
                if conflict && attempts < MAX_ATTEMPTS {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
                return Err(err)
                    .with_context(|| format!("index definition failed for {index_name} on {table}"));
            }
        }
    }
}

async fn wait_until_ready(db: &SurrealDbClient, index_name: &str, table: &str) -> Result<()> {
    loop {
        let info_query = format!("INFO FOR INDEX {index_name} ON TABLE {table};");
        let mut info_res = db
            .client
            .query(info_query)
            .await
            .with_context(|| format!("checking index build status for {index_name} on {table}"))?;

        let info: Option<Value> = info_res
            .take(0)
            .context("failed to deserialize INFO FOR INDEX result")?;

        let status = info
            .as_ref()
            .and_then(|i| i.get("building"))
            .and_then(|b| b.get("status"))
            .and_then(|s| s.as_str())
            // No `building` block means the index is not building anymore.
            .unwrap_or("ready")
            .to_owned();

        if status.eq_ignore_ascii_case("ready") {
            debug!(index = %index_name, table = %table, "Index is ready");
            return Ok(());
        }
        if status.eq_ignore_ascii_case("error") {
            warn!(
                index = %index_name,
                table = %table,
                "Index build reported error status; continuing without it"
            );
            return Ok(());
        }

        tokio::time::sleep(INDEX_POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn ensure_runtime_indexes_is_idempotent() {
        let namespace = "indexes_ns";
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory(namespace, database)
            .await
            .expect("in-memory db");

        db.ensure_initialized().await.expect("schema init");

        ensure_runtime_indexes(&db, 8)
            .await
            .expect("initial index creation");

        ensure_runtime_indexes(&db, 8)
            .await
            .expect("second index creation");
    }

    #[tokio::test]
    async fn ensure_hnsw_index_overwrites_dimension() {
        let namespace = "indexes_dim";
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory(namespace, database)
            .await
            .expect("in-memory db");

        db.ensure_initialized().await.expect("schema init");

        ensure_runtime_indexes(&db, 8)
            .await
            .expect("initial index creation");

        ensure_runtime_indexes(&db, 16)
            .await
            .expect("overwritten index creation");
    }
}
