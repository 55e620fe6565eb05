//! Retrieval policy: deterministic search-hint query expansion, minimum-score
//! cutoff, and structural-noise reduction on returned content.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::RetrievalItem;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchHint {
    pub term: String,
    pub expansions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Default, PartialEq)]
pub struct HintTrace {
    pub applied: bool,
    pub hits: Vec<String>,
}

/// Expand the query with every hint whose term appears in it. Expansions are
/// appended once, in hint order, so the result is deterministic.
pub fn apply_search_hints(query: &str, hints: &[SearchHint]) -> (String, HintTrace) {
    let mut trace = HintTrace::default();
    if hints.is_empty() {
        return (query.to_owned(), trace);
    }

    let query_lower = query.to_lowercase();
    let mut expanded = query.to_owned();

    for hint in hints {
        let term = hint.term.trim();
        if term.is_empty() || !query_lower.contains(&term.to_lowercase()) {
            continue;
        }
        trace.hits.push(term.to_owned());
        for expansion in &hint.expansions {
            let expansion = expansion.trim();
            if expansion.is_empty() {
                continue;
            }
            if !expanded.to_lowercase().contains(&expansion.to_lowercase()) {
                expanded.push(' ');
                expanded.push_str(expansion);
            }
        }
    }

    trace.applied = !trace.hits.is_empty();
    (expanded, trace)
}

#[derive(Debug, Clone, Serialize, Default, PartialEq)]
pub struct MinScoreTrace {
    pub applied: bool,
    pub min_score: Option<f32>,
    pub dropped: usize,
}

pub fn filter_items_by_min_score(
    items: Vec<RetrievalItem>,
    min_score: Option<f32>,
) -> (Vec<RetrievalItem>, MinScoreTrace) {
    let Some(min_score) = min_score else {
        return (
            items,
            MinScoreTrace {
                applied: false,
                min_score: None,
                dropped: 0,
            },
        );
    };

    let before = items.len();
    let kept: Vec<RetrievalItem> = items
        .into_iter()
        .filter(|item| item.score >= min_score)
        .collect();
    let trace = MinScoreTrace {
        applied: true,
        min_score: Some(min_score),
        dropped: before - kept.len(),
    };
    (kept, trace)
}

#[derive(Debug, Clone, Serialize, Default, PartialEq)]
pub struct NoiseTrace {
    pub applied: bool,
    pub touched: usize,
}

#[allow(clippy::expect_used)]
fn table_row_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*\|[^\n]*\|\s*$").expect("table row regex"))
}

#[allow(clippy::expect_used)]
fn markdown_link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[([^\]]+)\]\([^)]+\)").expect("markdown link regex"))
}

#[allow(clippy::expect_used)]
fn dot_leader_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\.{4,}\s*\d+").expect("dot leader regex"))
}

/// Strip structural artifacts (table pipes, markdown links, dot leaders) from
/// item content so downstream prompts read clean prose.
pub fn reduce_structural_noise(items: Vec<RetrievalItem>) -> (Vec<RetrievalItem>, NoiseTrace) {
    let mut touched = 0usize;
    let cleaned: Vec<RetrievalItem> = items
        .into_iter()
        .filter_map(|mut item| {
            let original = item.content.clone();
            let mut content = table_row_re().replace_all(&item.content, "").into_owned();
            content = markdown_link_re().replace_all(&content, "$1").into_owned();
            content = dot_leader_re().replace_all(&content, "").into_owned();
            let content = content
                .lines()
                .map(str::trim_end)
                .collect::<Vec<_>>()
                .join("\n")
                .trim()
                .to_owned();

            if content != original {
                touched += 1;
            }
            if content.is_empty() {
                return None;
            }
            item.content = content;
            Some(item)
        })
        .collect();

    (
        cleaned,
        NoiseTrace {
            applied: true,
            touched,
        },
    )
}
