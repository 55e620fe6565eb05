//! Visual context: describe images/tables captured during parsing, cache the
//! summaries by content hash, and stitch anchor tokens into the parent chunk
//! text at a stable location.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::warn;

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            content_chunk::ContentChunk, ingestion_event::EventSeverity,
            source_document::SourceDocument, visual_cache::VisualCacheEntry,
        },
    },
};

use crate::{llm::ModelServices, parser::VisualTask, state_manager::IngestionStateManager};

/// Per-image parses are independent and bounded-parallel.
const VISUAL_CONCURRENCY: usize = 3;
const PROMPT_VERSION: &str = "v2";
const SCHEMA_VERSION: &str = "1";

#[derive(Debug, Clone, Default, Serialize)]
pub struct VisualStats {
    pub attempted: usize,
    pub stitched: usize,
    pub cache_hits: usize,
    pub degraded_inline: usize,
    pub parse_failed: usize,
    pub skipped: usize,
}

pub struct VisualContextService<'a> {
    db: Arc<SurrealDbClient>,
    models: Arc<dyn ModelServices>,
    state: &'a IngestionStateManager,
}

impl<'a> VisualContextService<'a> {
    pub fn new(
        db: Arc<SurrealDbClient>,
        models: Arc<dyn ModelServices>,
        state: &'a IngestionStateManager,
    ) -> Self {
        Self { db, models, state }
    }

    /// Process the visual tasks captured during parsing, if any.
    pub async fn run_if_needed(
        &self,
        source_document_id: &str,
        tenant_id: &str,
    ) -> Result<VisualStats, AppError> {
        let mut stats = VisualStats::default();

        let Some(doc) = self.db.get_item::<SourceDocument>(source_document_id).await? else {
            return Err(AppError::NotFound(format!(
                "source document {source_document_id}"
            )));
        };
        if doc.tenant_id != tenant_id {
            return Err(AppError::TenantMismatch {
                location: "enrichment.visual".into(),
            });
        }

        let tasks: Vec<VisualTask> = doc
            .metadata
            .get("visual_tasks")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .unwrap_or_default()
            .unwrap_or_default();
        if tasks.is_empty() {
            return Ok(stats);
        }
        stats.attempted = tasks.len();

        let chunks = super::graph::chunks_for_source(&self.db, source_document_id).await?;

        let summaries: Vec<(VisualTask, Result<(String, bool), AppError>)> =
            stream::iter(tasks.into_iter().map(|task| async move {
                let result = self.describe_with_cache(&task).await;
                (task, result)
            }))
            .buffer_unordered(VISUAL_CONCURRENCY)
            .collect()
            .await;

        for (task, outcome) in summaries {
            match outcome {
                Ok((summary, cache_hit)) => {
                    if cache_hit {
                        stats.cache_hits += 1;
                    }
                    let anchor = anchor_token(&task.node_id, &task.content_type, &summary);
                    match self.stitch_into_parent(&chunks, &task, &anchor).await {
                        Ok(true) => stats.stitched += 1,
                        Ok(false) => {
                            // No parent chunk found: degrade to an inline
                            // markdown block on the first chunk.
                            if self
                                .stitch_fallback_block(&chunks, &summary)
                                .await
                                .unwrap_or(false)
                            {
                                stats.degraded_inline += 1;
                            } else {
                                stats.skipped += 1;
                            }
                        }
                        Err(err) => {
                            warn!(error = %err, node_id = %task.node_id, "anchor stitch failed");
                            stats.skipped += 1;
                        }
                    }
                }
                Err(err) => {
                    warn!(error = %err, node_id = %task.node_id, "visual parse failed");
                    stats.parse_failed += 1;
                    if self
                        .stitch_fallback_block(
                            &chunks,
                            &format!("(visual {} could not be described)", task.node_id),
                        )
                        .await
                        .unwrap_or(false)
                    {
                        stats.degraded_inline += 1;
                    }
                }
            }
        }

        self.state
            .log_step(
                source_document_id,
                &format!(
                    "Visual anchoring finished: {}/{} stitched",
                    stats.stitched, stats.attempted
                ),
                EventSeverity::Info,
                "visual",
                serde_json::to_value(&stats)?,
            )
            .await?;

        Ok(stats)
    }

    async fn describe_with_cache(
        &self,
        task: &VisualTask,
    ) -> Result<(String, bool), AppError> {
        let image_hash = hex_digest(task.image_base64.as_bytes());
        let cache_key = VisualCacheEntry::cache_key(
            &image_hash,
            &task.content_type,
            self.models.provider_label(),
            &self.models.model_label(),
            PROMPT_VERSION,
            SCHEMA_VERSION,
        );

        if let Some(hit) = VisualCacheEntry::lookup(&self.db, &cache_key).await? {
            return Ok((hit.summary, true));
        }

        let summary = self
            .models
            .describe_visual(&task.image_base64, &task.content_type)
            .await?;

        VisualCacheEntry::store(
            &self.db,
            &cache_key,
            &task.content_type,
            self.models.provider_label(),
            &self.models.model_label(),
            PROMPT_VERSION,
            SCHEMA_VERSION,
            &summary,
        )
        .await?;

        Ok((summary, false))
    }

    /// Stitch the anchor into the stored chunk text only; embeddings were
    /// computed before stitching and never see anchor tokens.
    async fn stitch_into_parent(
        &self,
        chunks: &[ContentChunk],
        task: &VisualTask,
        anchor: &str,
    ) -> Result<bool, AppError> {
        let Some(parent) = find_parent_chunk(chunks, task) else {
            return Ok(false);
        };

        let updated = stitch_anchor(
            &parent.content,
            anchor,
            task.placeholder.as_deref(),
            task.anchor_after.as_deref(),
        );

        self.db
            .client
            .query("UPDATE type::thing('content_chunk', $id) SET content = $content, updated_at = time::now()")
            .bind(("id", parent.id.clone()))
            .bind(("content", updated))
            .await?
            .check()?;
        Ok(true)
    }

    async fn stitch_fallback_block(
        &self,
        chunks: &[ContentChunk],
        summary: &str,
    ) -> Result<bool, AppError> {
        let Some(first) = chunks.first() else {
            return Ok(false);
        };
        let updated = format!("{}\n\n> [visual] {summary}", first.content);
        self.db
            .client
            .query("UPDATE type::thing('content_chunk', $id) SET content = $content, updated_at = time::now()")
            .bind(("id", first.id.clone()))
            .bind(("content", updated))
            .await?
            .check()?;
        Ok(true)
    }
}

/// The stable, parseable anchor token format.
pub fn anchor_token(node_id: &str, content_type: &str, summary: &str) -> String {
    let short_summary: String = summary.chars().take(160).collect();
    format!("<<VISUAL_ANCHOR: {node_id} | TYPE: {content_type} | DESC: {short_summary}>>")
}

/// Insert the anchor at a stable location: a prior placeholder wins, then a
/// position just after `anchor_after`, then append.
pub fn stitch_anchor(
    content: &str,
    anchor: &str,
    placeholder: Option<&str>,
    anchor_after: Option<&str>,
) -> String {
    if let Some(placeholder) = placeholder.filter(|value| !value.is_empty()) {
        if content.contains(placeholder) {
            return content.replacen(placeholder, anchor, 1);
        }
    }

    if let Some(anchor_after) = anchor_after.filter(|value| !value.is_empty()) {
        if let Some(position) = content.find(anchor_after) {
            let insert_at = position + anchor_after.len();
            let mut stitched = String::with_capacity(content.len() + anchor.len() + 1);
            stitched.push_str(&content[..insert_at]);
            stitched.push('\n');
            stitched.push_str(anchor);
            stitched.push_str(&content[insert_at..]);
            return stitched;
        }
    }

    format!("{content}\n{anchor}")
}

fn find_parent_chunk<'c>(chunks: &'c [ContentChunk], task: &VisualTask) -> Option<&'c ContentChunk> {
    if let Some(placeholder) = task.placeholder.as_deref().filter(|value| !value.is_empty()) {
        if let Some(chunk) = chunks.iter().find(|chunk| chunk.content.contains(placeholder)) {
            return Some(chunk);
        }
    }
    if let Some(anchor_after) = task.anchor_after.as_deref().filter(|value| !value.is_empty()) {
        if let Some(chunk) = chunks.iter().find(|chunk| chunk.content.contains(anchor_after)) {
            return Some(chunk);
        }
    }
    None
}

fn hex_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}
