#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod contract;
pub mod engine;
pub mod executor;
pub mod fusion;
pub mod graph;
pub mod late_fusion;
pub mod leak_canary;
pub mod multi_query;
pub mod plan;
pub mod policies;
pub mod rerank;
pub mod scoping;
pub mod trace;
pub mod validation;

mod broker;

pub use broker::{BrokerTrace, RetrievalBroker};
pub use contract::ContractService;

use serde::{Deserialize, Serialize};

/// One retrieval candidate as it moves through the engine, fusion, and
/// reranking layers. `metadata` carries the free-form trace and ownership
/// fields (`retrieved_via`, `graph_reasoning`, `heading_boost`, ...).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RetrievalRow {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub similarity: f32,
    #[serde(default)]
    pub score: f32,
    pub source_layer: String,
    pub source_type: String,
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub scope_penalized: bool,
    #[serde(default)]
    pub scope_penalty: Option<f32>,
    #[serde(default)]
    pub semantic_relevance_score: Option<f32>,
}

impl RetrievalRow {
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|value| value.as_str())
    }

    pub fn metadata_bool(&self, key: &str) -> Option<bool> {
        self.metadata.get(key).and_then(|value| value.as_bool())
    }

    pub fn metadata_f32(&self, key: &str) -> Option<f32> {
        self.metadata
            .get(key)
            .and_then(|value| value.as_f64())
            .map(|value| value as f32)
    }

    pub fn set_metadata(&mut self, key: &str, value: serde_json::Value) {
        self.metadata.insert(key.to_owned(), value);
    }
}

/// Item shape returned to API clients. `source` is the row id (or a synthetic
/// label for rows without one).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalItem {
    pub source: String,
    pub content: String,
    pub score: f32,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}
