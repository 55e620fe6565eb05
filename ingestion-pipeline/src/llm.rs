//! Model-facing ports for enrichment: strict-JSON graph extraction, cluster
//! summarization, visual description, and grounded chat. The default
//! implementation talks to OpenAI-compatible endpoints; tests plug in stubs.

use std::sync::Arc;

use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestMessageContentPartImageArgs,
        ChatCompletionRequestMessageContentPartTextArgs, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs, ImageDetail,
        ImageUrlArgs,
    },
    Client,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use common::error::AppError;

/// One extracted entity from a chunk batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtractedEntity {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_entity_type")]
    pub entity_type: String,
}

fn default_entity_type() -> String {
    "CONCEPT".to_owned()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtractedRelation {
    pub source: String,
    pub target: String,
    #[serde(default = "default_relation_type")]
    pub relation_type: String,
}

fn default_relation_type() -> String {
    "RELATES_TO".to_owned()
}

/// Strict-structured output of a graph extraction call.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkGraphExtraction {
    #[serde(default)]
    pub entities: Vec<ExtractedEntity>,
    #[serde(default)]
    pub relations: Vec<ExtractedRelation>,
}

/// Model services consumed by the enrichment pipeline and chat surface.
#[async_trait]
pub trait ModelServices: Send + Sync {
    /// Extract entities and relations from a batch of chunk text. A response
    /// that does not match the schema is a contract error; the caller skips
    /// that unit of work and continues.
    async fn extract_graph(&self, batch_text: &str) -> Result<ChunkGraphExtraction, AppError>;

    /// Dense summary of a cluster of related texts.
    async fn summarize_cluster(&self, texts: &[String]) -> Result<String, AppError>;

    /// Dense summary of an image or table image (base64 payload).
    async fn describe_visual(
        &self,
        image_base64: &str,
        content_type: &str,
    ) -> Result<String, AppError>;

    /// Grounded answer over retrieved context.
    async fn chat_answer(&self, question: &str, context: &str) -> Result<String, AppError>;

    fn provider_label(&self) -> &'static str;
    fn model_label(&self) -> String;
}

const GRAPH_EXTRACTION_INSTRUCTIONS: &str = "Extract the knowledge graph from the provided text. \
Respond with JSON only, matching exactly: \
{\"entities\": [{\"name\": string, \"description\": string, \"entity_type\": string}], \
\"relations\": [{\"source\": string, \"target\": string, \"relation_type\": string}]}. \
Entity names must appear in the text. Use UPPER_SNAKE_CASE relation types.";

const CLUSTER_SUMMARY_INSTRUCTIONS: &str = "Summarize the following related passages into one \
dense paragraph. Preserve clause identifiers and standard references verbatim. Respond with the \
summary text only.";

const VISUAL_DESCRIPTION_INSTRUCTIONS: &str = "Describe this figure or table for retrieval. One \
dense paragraph: what it shows, axes or columns, and any values a reader would cite.";

pub struct OpenAiModelServices {
    client: Arc<Client<OpenAIConfig>>,
    chat_model: String,
}

impl OpenAiModelServices {
    pub fn new(client: Arc<Client<OpenAIConfig>>, chat_model: String) -> Self {
        Self { client, chat_model }
    }

    async fn complete(&self, system: &str, user: String) -> Result<String, AppError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(self.chat_model.clone())
            .messages([
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(system)
                    .build()?
                    .into(),
                ChatCompletionRequestUserMessageArgs::default()
                    .content(user)
                    .build()?
                    .into(),
            ])
            .build()?;

        let response = self.client.chat().create(request).await?;
        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .unwrap_or_default();
        if content.trim().is_empty() {
            return Err(AppError::LLMParsing("empty chat completion".into()));
        }
        Ok(content)
    }
}

#[async_trait]
impl ModelServices for OpenAiModelServices {
    async fn extract_graph(&self, batch_text: &str) -> Result<ChunkGraphExtraction, AppError> {
        let raw = self
            .complete(GRAPH_EXTRACTION_INSTRUCTIONS, batch_text.to_owned())
            .await?;
        parse_graph_extraction(&raw)
    }

    async fn summarize_cluster(&self, texts: &[String]) -> Result<String, AppError> {
        let joined = texts.join("\n\n---\n\n");
        self.complete(CLUSTER_SUMMARY_INSTRUCTIONS, joined).await
    }

    async fn describe_visual(
        &self,
        image_base64: &str,
        content_type: &str,
    ) -> Result<String, AppError> {
        let image_url = format!("data:{content_type};base64,{image_base64}");

        let request = CreateChatCompletionRequestArgs::default()
            .model(self.chat_model.clone())
            .messages([ChatCompletionRequestUserMessageArgs::default()
                .content(vec![
                    ChatCompletionRequestMessageContentPartTextArgs::default()
                        .text(VISUAL_DESCRIPTION_INSTRUCTIONS)
                        .build()?
                        .into(),
                    ChatCompletionRequestMessageContentPartImageArgs::default()
                        .image_url(
                            ImageUrlArgs::default()
                                .url(image_url)
                                .detail(ImageDetail::High)
                                .build()?,
                        )
                        .build()?
                        .into(),
                ])
                .build()?
                .into()])
            .build()?;

        let response = self.client.chat().create(request).await?;
        let description = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.as_ref())
            .cloned()
            .unwrap_or_default();
        if description.trim().is_empty() {
            return Err(AppError::LLMParsing("empty visual description".into()));
        }
        Ok(description)
    }

    async fn chat_answer(&self, question: &str, context: &str) -> Result<String, AppError> {
        let user = format!("Context:\n{context}\n\nQuestion: {question}");
        self.complete(
            "Answer using only the provided context. Cite sources as [source-id].",
            user,
        )
        .await
    }

    fn provider_label(&self) -> &'static str {
        "openai"
    }

    fn model_label(&self) -> String {
        self.chat_model.clone()
    }
}

/// Parse a strict-JSON extraction, tolerating markdown code fences but
/// nothing else. Schema drift is a contract error, never a crash.
pub fn parse_graph_extraction(raw: &str) -> Result<ChunkGraphExtraction, AppError> {
    let trimmed = strip_code_fences(raw);
    let parsed: ChunkGraphExtraction = serde_json::from_str(trimmed)
        .map_err(|err| AppError::Contract(format!("graph extraction schema mismatch: {err}")))?;

    let entities: Vec<ExtractedEntity> = parsed
        .entities
        .into_iter()
        .filter(|entity| !entity.name.trim().is_empty())
        .collect();
    let relations: Vec<ExtractedRelation> = parsed
        .relations
        .into_iter()
        .filter(|relation| {
            !relation.source.trim().is_empty() && !relation.target.trim().is_empty()
        })
        .collect();

    Ok(ChunkGraphExtraction {
        entities,
        relations,
    })
}

fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.strip_suffix("```").unwrap_or(rest);
    rest.trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_fenced_json() {
        let raw = r#"{"entities": [{"name": "Quality Policy", "description": "top level", "entity_type": "CONCEPT"}], "relations": [{"source": "Quality Policy", "target": "Objectives", "relation_type": "DRIVES"}]}"#;
        let parsed = parse_graph_extraction(raw).expect("parse");
        assert_eq!(parsed.entities.len(), 1);
        assert_eq!(parsed.relations.len(), 1);

        let fenced = format!("```json\n{raw}\n```");
        let parsed = parse_graph_extraction(&fenced).expect("parse fenced");
        assert_eq!(parsed.entities[0].name, "Quality Policy");
    }

    #[test]
    fn schema_drift_is_a_contract_error() {
        let err = parse_graph_extraction("The entities are Quality Policy and Objectives.")
            .expect_err("prose is not JSON");
        assert!(matches!(err, AppError::Contract(_)));
    }

    #[test]
    fn blank_names_are_filtered() {
        let raw = r#"{"entities": [{"name": "  "}, {"name": "Audit"}], "relations": [{"source": "", "target": "Audit"}]}"#;
        let parsed = parse_graph_extraction(raw).expect("parse");
        assert_eq!(parsed.entities.len(), 1);
        assert!(parsed.relations.is_empty());
    }

    #[test]
    fn defaults_fill_missing_fields() {
        let raw = r#"{"entities": [{"name": "Audit"}]}"#;
        let parsed = parse_graph_extraction(raw).expect("parse");
        assert_eq!(parsed.entities[0].entity_type, "CONCEPT");
        assert!(parsed.relations.is_empty());
    }
}
