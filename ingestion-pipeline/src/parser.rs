//! Document parsing port. PDF parsing, OCR, and heading detection live in an
//! external collaborator; the pipeline only consumes this interface. The
//! built-in implementation handles text-native formats.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use common::error::AppError;

/// A visual element captured during parsing, to be described and anchored by
/// the enrichment pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VisualTask {
    pub node_id: String,
    pub content_type: String,
    pub image_base64: String,
    #[serde(default)]
    pub placeholder: Option<String>,
    #[serde(default)]
    pub anchor_after: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedDocument {
    pub text: String,
    pub visual_tasks: Vec<VisualTask>,
}

#[async_trait]
pub trait DocumentParser: Send + Sync {
    async fn parse(&self, bytes: &[u8], filename: &str) -> Result<ParsedDocument, AppError>;
}

/// Text-native parser: UTF-8 (lossy) decode, no visual extraction. Binary
/// formats are expected to arrive pre-extracted or through an external
/// parser implementation.
pub struct PlainTextParser;

#[async_trait]
impl DocumentParser for PlainTextParser {
    async fn parse(&self, bytes: &[u8], _filename: &str) -> Result<ParsedDocument, AppError> {
        let text = String::from_utf8_lossy(bytes).into_owned();
        Ok(ParsedDocument {
            text,
            visual_tasks: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn plain_text_parser_decodes_lossily() {
        let parser = PlainTextParser;
        let parsed = parser
            .parse(b"# Heading\n\nBody text", "doc.md")
            .await
            .expect("parse");
        assert!(parsed.text.starts_with("# Heading"));
        assert!(parsed.visual_tasks.is_empty());

        let invalid = parser.parse(&[0xf0, 0x28, 0x8c, 0x28], "junk.bin").await.expect("parse");
        assert!(!invalid.text.is_empty());
    }
}
