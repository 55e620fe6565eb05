use std::sync::Arc;

use async_openai::{config::OpenAIConfig, types::CreateEmbeddingRequestArgs, Client};
use serde::{Deserialize, Serialize};
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    Retry,
};
use tracing::debug;

use crate::{
    error::AppError,
    utils::config::{AppConfig, EmbeddingBackend},
};

/// Identity of the model that produced a vector; persisted on every chunk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EmbeddingProfile {
    pub provider: String,
    pub model: String,
    pub dims: usize,
}

/// One late-chunking window: a content slice with its vector and offsets.
#[derive(Debug, Clone)]
pub struct EmbeddedWindow {
    pub content: String,
    pub embedding: Vec<f32>,
    pub char_start: usize,
    pub char_end: usize,
}

enum Backend {
    OpenAi {
        client: Arc<Client<OpenAIConfig>>,
        model: String,
        dimensions: usize,
    },
    /// Deterministic feature-hash embeddings; no network. Used by tests and
    /// air-gapped runs.
    Hashed { dimensions: usize },
}

pub struct EmbeddingProvider {
    backend: Backend,
}

const LATE_CHUNK_WINDOW_CHARS: usize = 1200;

impl EmbeddingProvider {
    pub fn from_config(
        config: &AppConfig,
        openai_client: Option<Arc<Client<OpenAIConfig>>>,
    ) -> Result<Self, AppError> {
        match config.embedding_backend {
            EmbeddingBackend::OpenAi => {
                let client = openai_client.ok_or_else(|| {
                    AppError::InternalError(
                        "OpenAI embedding backend requires a configured client".into(),
                    )
                })?;
                Ok(Self {
                    backend: Backend::OpenAi {
                        client,
                        model: config.embedding_model.clone(),
                        dimensions: config.embedding_dimensions,
                    },
                })
            }
            EmbeddingBackend::Hashed => Self::new_hashed(config.embedding_dimensions),
        }
    }

    pub fn new_hashed(dimensions: usize) -> Result<Self, AppError> {
        if dimensions == 0 {
            return Err(AppError::Validation(
                "embedding dimensions must be greater than zero".into(),
            ));
        }
        Ok(Self {
            backend: Backend::Hashed { dimensions },
        })
    }

    pub fn dimension(&self) -> usize {
        match &self.backend {
            Backend::OpenAi { dimensions, .. } | Backend::Hashed { dimensions } => *dimensions,
        }
    }

    pub fn backend_label(&self) -> &'static str {
        match &self.backend {
            Backend::OpenAi { .. } => "openai",
            Backend::Hashed { .. } => "hashed",
        }
    }

    pub fn profile(&self) -> EmbeddingProfile {
        match &self.backend {
            Backend::OpenAi {
                model, dimensions, ..
            } => EmbeddingProfile {
                provider: "openai".into(),
                model: model.clone(),
                dims: *dimensions,
            },
            Backend::Hashed { dimensions } => EmbeddingProfile {
                provider: "hashed".into(),
                model: format!("feature-hash-{dimensions}"),
                dims: *dimensions,
            },
        }
    }

    pub async fn embed(&self, input: &str) -> Result<Vec<f32>, AppError> {
        let mut vectors = self.embed_batch(&[input.to_owned()]).await?;
        vectors
            .pop()
            .ok_or_else(|| AppError::LLMParsing("No embedding data received".into()))
    }

    pub async fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }

        match &self.backend {
            Backend::OpenAi {
                client,
                model,
                dimensions,
            } => {
                let retry_strategy = ExponentialBackoff::from_millis(100).map(jitter).take(3);
                let vectors = Retry::spawn(retry_strategy, || async {
                    let request = CreateEmbeddingRequestArgs::default()
                        .model(model.clone())
                        .dimensions(*dimensions as u32)
                        .input(inputs.to_vec())
                        .build()?;

                    let response = client.embeddings().create(request).await?;
                    Ok::<_, AppError>(
                        response
                            .data
                            .into_iter()
                            .map(|row| row.embedding)
                            .collect::<Vec<_>>(),
                    )
                })
                .await?;

                if vectors.len() != inputs.len() {
                    return Err(AppError::LLMParsing(format!(
                        "Embedding batch size mismatch: sent {}, received {}",
                        inputs.len(),
                        vectors.len()
                    )));
                }
                debug!(batch = inputs.len(), dims = dimensions, "embedded batch");
                Ok(vectors)
            }
            Backend::Hashed { dimensions } => Ok(inputs
                .iter()
                .map(|input| hashed_embedding(input, *dimensions))
                .collect()),
        }
    }

    /// Late chunking: slide fixed windows over the full text, embed all
    /// windows in one batch, and return them with their character offsets.
    ///
    /// Window boundaries snap to the nearest paragraph break when one exists
    /// inside the tail third of the window.
    pub async fn late_chunk(&self, text: &str) -> Result<Vec<EmbeddedWindow>, AppError> {
        let windows = split_windows(text, LATE_CHUNK_WINDOW_CHARS);
        if windows.is_empty() {
            return Ok(Vec::new());
        }

        let contents: Vec<String> = windows
            .iter()
            .map(|(start, end)| text[*start..*end].to_owned())
            .collect();
        let vectors = self.embed_batch(&contents).await?;

        Ok(windows
            .into_iter()
            .zip(contents)
            .zip(vectors)
            .map(|(((char_start, char_end), content), embedding)| EmbeddedWindow {
                content,
                embedding,
                char_start,
                char_end,
            })
            .collect())
    }
}

/// Deterministic token feature hashing with l2 normalization.
fn hashed_embedding(input: &str, dimensions: usize) -> Vec<f32> {
    let mut vector = vec![0f32; dimensions];
    for token in input.split_whitespace() {
        let token = token.trim_matches(|c: char| !c.is_alphanumeric());
        if token.is_empty() {
            continue;
        }
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in token.to_ascii_lowercase().bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        let index = (hash % dimensions as u64) as usize;
        let sign = if hash & (1 << 63) == 0 { 1.0 } else { -1.0 };
        vector[index] += sign;
    }

    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for value in &mut vector {
            *value /= norm;
        }
    }
    vector
}

/// Split text into `(start, end)` byte windows, snapping to paragraph breaks.
fn split_windows(text: &str, window_chars: usize) -> Vec<(usize, usize)> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let mut windows = Vec::new();
    let bytes = text.len();
    let mut start = 0usize;

    while start < bytes {
        let mut end = (start + window_chars).min(bytes);
        // Avoid slicing mid-codepoint.
        while end < bytes && !text.is_char_boundary(end) {
            end += 1;
        }

        if end < bytes {
            let tail_floor = start + (window_chars * 2 / 3);
            if let Some(break_at) = text[start..end].rfind("\n\n") {
                let candidate = start + break_at;
                if candidate > tail_floor {
                    end = candidate;
                }
            }
        }

        if end <= start {
            break;
        }
        windows.push((start, end));
        start = end;
        while start < bytes && text[start..].starts_with(char::is_whitespace) {
            start += text[start..]
                .chars()
                .next()
                .map(char::len_utf8)
                .unwrap_or(1);
        }
    }

    windows
}
