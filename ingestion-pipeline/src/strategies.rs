//! Strategy registry: an explicit map from strategy key to pipeline variant,
//! initialized at startup. Strategies consume parsed text and produce
//! prepared chunks; a strategy that yields zero chunks from non-empty input
//! is a failure.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use common::{error::AppError, utils::embedding::EmbeddingProvider};

use crate::chunking::{
    contextual_section_chunks, late_chunk_document, split_by_headings, PreparedChunk,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyKey {
    Content,
    FastContent,
    PreProcessed,
    Rubric,
}

impl StrategyKey {
    pub fn from_slug(slug: &str) -> Option<Self> {
        match slug.trim().to_ascii_uppercase().as_str() {
            "CONTENT" => Some(Self::Content),
            "FAST_CONTENT" => Some(Self::FastContent),
            "PRE_PROCESSED" => Some(Self::PreProcessed),
            "RUBRIC" => Some(Self::Rubric),
            _ => None,
        }
    }

    pub fn as_slug(self) -> &'static str {
        match self {
            Self::Content => "CONTENT",
            Self::FastContent => "FAST_CONTENT",
            Self::PreProcessed => "PRE_PROCESSED",
            Self::Rubric => "RUBRIC",
        }
    }

    /// Default routing when no override or taxonomy slug applies:
    /// pre-extracted text formats skip the heavy pipeline.
    pub fn for_filename(filename: &str) -> Self {
        let extension = filename
            .rsplit('.')
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        match extension.as_str() {
            "md" | "txt" => Self::PreProcessed,
            _ => Self::Content,
        }
    }
}

pub struct StrategyInput<'a> {
    pub text: &'a str,
    pub max_block_chars: usize,
}

#[async_trait]
pub trait ChunkingStrategy: Send + Sync {
    async fn process(
        &self,
        embedder: &EmbeddingProvider,
        input: &StrategyInput<'_>,
    ) -> Result<Vec<PreparedChunk>, AppError>;
}

/// Default strategy: late chunking over the full text, with the contextual
/// section pipeline as fallback when late chunking fails.
struct ContentStrategy;

#[async_trait]
impl ChunkingStrategy for ContentStrategy {
    async fn process(
        &self,
        embedder: &EmbeddingProvider,
        input: &StrategyInput<'_>,
    ) -> Result<Vec<PreparedChunk>, AppError> {
        let sections = split_by_headings(input.text);

        match late_chunk_document(embedder, input.text, &sections).await {
            Ok(chunks) if !chunks.is_empty() => Ok(chunks),
            Ok(_) => Ok(Vec::new()),
            Err(err) => {
                warn!(error = %err, "late chunking failed; falling back to contextual sections");
                contextual_section_chunks(embedder, input.text, &sections, input.max_block_chars)
                    .await
            }
        }
    }
}

/// Section-based pipeline without the late-chunking pass.
struct FastContentStrategy;

#[async_trait]
impl ChunkingStrategy for FastContentStrategy {
    async fn process(
        &self,
        embedder: &EmbeddingProvider,
        input: &StrategyInput<'_>,
    ) -> Result<Vec<PreparedChunk>, AppError> {
        let sections = split_by_headings(input.text);
        contextual_section_chunks(embedder, input.text, &sections, input.max_block_chars).await
    }
}

/// Already-clean markdown: plain sections, no parent-context injection.
struct PreProcessedStrategy;

#[async_trait]
impl ChunkingStrategy for PreProcessedStrategy {
    async fn process(
        &self,
        embedder: &EmbeddingProvider,
        input: &StrategyInput<'_>,
    ) -> Result<Vec<PreparedChunk>, AppError> {
        let sections = split_by_headings(input.text);
        let mut chunks = Vec::with_capacity(sections.len());
        for section in &sections {
            let role = crate::chunking::classify_chunk_role(&section.text);
            let embedding = if role == common::storage::types::content_chunk::ChunkRole::NormativeBody
            {
                Some(embedder.embed(&section.text).await?)
            } else {
                None
            };
            chunks.push(PreparedChunk {
                content: section.text.clone(),
                embedding,
                chunk_role: role,
                heading_path: section.heading_path.clone(),
                section_ref: section.heading_path.last().cloned(),
                clause_id: None,
            });
        }
        Ok(chunks)
    }
}

/// Rubrics are short and binding: keep them intact as single sections so
/// evaluation criteria never split mid-row.
struct RubricStrategy;

#[async_trait]
impl ChunkingStrategy for RubricStrategy {
    async fn process(
        &self,
        embedder: &EmbeddingProvider,
        input: &StrategyInput<'_>,
    ) -> Result<Vec<PreparedChunk>, AppError> {
        let text = input.text.trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }
        let embedding = embedder.embed(text).await?;
        Ok(vec![PreparedChunk {
            content: text.to_owned(),
            embedding: Some(embedding),
            chunk_role: common::storage::types::content_chunk::ChunkRole::NormativeBody,
            heading_path: Vec::new(),
            section_ref: None,
            clause_id: None,
        }])
    }
}

pub struct StrategyRegistry {
    strategies: HashMap<StrategyKey, Arc<dyn ChunkingStrategy>>,
}

impl StrategyRegistry {
    /// Build the full registry; called once during startup wiring.
    pub fn with_defaults() -> Self {
        let mut strategies: HashMap<StrategyKey, Arc<dyn ChunkingStrategy>> = HashMap::new();
        strategies.insert(StrategyKey::Content, Arc::new(ContentStrategy));
        strategies.insert(StrategyKey::FastContent, Arc::new(FastContentStrategy));
        strategies.insert(StrategyKey::PreProcessed, Arc::new(PreProcessedStrategy));
        strategies.insert(StrategyKey::Rubric, Arc::new(RubricStrategy));
        Self { strategies }
    }

    pub fn get(&self, key: StrategyKey) -> Result<&Arc<dyn ChunkingStrategy>, AppError> {
        self.strategies
            .get(&key)
            .ok_or_else(|| AppError::InternalError(format!("strategy {key:?} not registered")))
    }
}
