//! Canonical scope, standard, and clause utilities.
//!
//! Single source of truth for scope handling across the retrieval pipeline:
//! standard extraction, clause references, scope penalties, tenant stamping,
//! and structural-row filtering.

use std::collections::HashSet;

use regex::{Regex, RegexBuilder};
use serde::Serialize;

use common::{error::AppError, utils::config::AppConfig};

use crate::RetrievalRow;

/// Compiled scope patterns. Standard and clause expressions come from
/// configuration; the clause-hint keywords are fixed.
#[derive(Debug, Clone)]
pub struct ScopePatterns {
    standard: Regex,
    clause: Regex,
    clause_hint: Regex,
}

impl ScopePatterns {
    pub fn from_config(config: &AppConfig) -> Result<Self, AppError> {
        Self::new(&config.scope_extraction_regex, &config.scope_ambiguity_regex)
    }

    pub fn new(standard_pattern: &str, clause_pattern: &str) -> Result<Self, AppError> {
        let standard = RegexBuilder::new(standard_pattern)
            .case_insensitive(true)
            .build()
            .map_err(|err| AppError::Validation(format!("invalid scope regex: {err}")))?;
        let clause = Regex::new(clause_pattern)
            .map_err(|err| AppError::Validation(format!("invalid clause regex: {err}")))?;
        let clause_hint = RegexBuilder::new(
            r"\b(cl(?:a|á)usula|clause|numeral|apartado|secci[oó]n|standard|scope)\b",
        )
        .case_insensitive(true)
        .build()
        .map_err(|err| AppError::Validation(format!("invalid clause hint regex: {err}")))?;

        Ok(Self {
            standard,
            clause,
            clause_hint,
        })
    }

    /// Ordered, deduplicated scope labels found in `query`, uppercased.
    pub fn extract_requested_standards(&self, query: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut ordered = Vec::new();
        for capture in self.standard.find_iter(query) {
            let value = capture.as_str().trim().to_uppercase();
            if seen.insert(value.clone()) {
                ordered.push(value);
            }
        }
        ordered
    }

    /// Ordered, deduplicated clause references found in `text`.
    pub fn extract_clause_refs(&self, text: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut ordered = Vec::new();
        for capture in self.clause.find_iter(text) {
            let value = capture.as_str().to_owned();
            if seen.insert(value.clone()) {
                ordered.push(value);
            }
        }
        ordered
    }

    /// Normalise a scope label to a comparable key.
    pub fn scope_key(&self, value: &str) -> String {
        let text = value.trim().to_uppercase();
        if text.is_empty() {
            return String::new();
        }
        if let Some(matched) = self.standard.find(&text) {
            return matched
                .as_str()
                .trim()
                .to_uppercase()
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
                .collect();
        }
        text.chars().filter(|c| c.is_ascii_alphanumeric()).collect()
    }

    /// Normalise a raw scope value to a human-readable label.
    pub fn normalize_scope_name(&self, value: &str) -> String {
        let text = value.trim().to_uppercase();
        if text.is_empty() {
            return String::new();
        }
        match self.standard.find(&text) {
            Some(matched) => matched.as_str().trim().to_uppercase(),
            None => text,
        }
    }

    /// Deterministic key for deduplicating identical sub-query intents.
    pub fn scope_clause_key(
        &self,
        query: &str,
        source_standard: Option<&str>,
        clause_id: Option<&str>,
    ) -> String {
        let standard = self.normalize_scope_name(source_standard.unwrap_or_default());
        let clause = clause_id.map(str::trim).unwrap_or_default();

        if !standard.is_empty() && !clause.is_empty() {
            return format!("scope_clause::{standard}::{clause}");
        }

        let normalized_query = query
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        format!("query::{normalized_query}")
    }

    /// If exactly one clause ref appears near `standard` in `query`, return
    /// it. Multiple clauses in the window drop the hint to avoid false
    /// specificity.
    pub fn clause_near_standard(&self, query: &str, standard: &str) -> Option<String> {
        let standard = standard.trim();
        if query.is_empty() || standard.is_empty() {
            return None;
        }

        let needle = standard.to_lowercase();
        let position = query.to_lowercase().find(&needle)?;

        let window_start = position.saturating_sub(80);
        let window_end = (position + standard.len() + 120).min(query.len());
        let window_start = floor_char_boundary(query, window_start);
        let window_end = floor_char_boundary(query, window_end);
        let window = &query[window_start..window_end];

        let clauses = self.extract_clause_refs(window);
        if clauses.len() == 1 {
            clauses.into_iter().next()
        } else {
            None
        }
    }

    /// Does the query mention a clause hint keyword?
    pub fn is_clause_heavy_query(&self, query: &str) -> bool {
        self.clause_hint.is_match(query)
    }
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    index = index.min(text.len());
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

const SCOPE_CANDIDATE_KEYS: [&str; 4] = ["source_standard", "standard", "scope", "norma"];

/// Extract the scope label from a retrieval row's metadata.
pub fn extract_row_scope(row: &RetrievalRow) -> String {
    for key in SCOPE_CANDIDATE_KEYS {
        if let Some(value) = row.metadata_str(key) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return trimmed.to_uppercase();
            }
        }
    }
    String::new()
}

/// Down-weight rows whose scope doesn't match any requested standard.
///
/// A penalised row keeps `(1 - penalty_factor)` of its best score; rows
/// without a scope label pass through untouched.
pub fn apply_scope_penalty(
    rows: &mut [RetrievalRow],
    patterns: &ScopePatterns,
    requested_scopes: &[String],
    penalty_factor: f32,
) {
    if requested_scopes.is_empty() {
        return;
    }

    let requested_keys: HashSet<String> = requested_scopes
        .iter()
        .map(|scope| patterns.scope_key(scope))
        .filter(|key| !key.is_empty())
        .collect();

    for row in rows.iter_mut() {
        let row_scope = extract_row_scope(row);
        if row_scope.is_empty() {
            continue;
        }

        let row_key = patterns.scope_key(&row_scope);
        if !row_key.is_empty() && requested_keys.contains(&row_key) {
            continue;
        }
        if requested_scopes
            .iter()
            .any(|scope| row_scope.contains(&scope.to_uppercase()))
        {
            continue;
        }

        let base = row
            .semantic_relevance_score
            .unwrap_or(if row.similarity > 0.0 {
                row.similarity
            } else {
                row.score
            });
        let penalized = (base * (1.0 - penalty_factor)).max(0.0);
        row.scope_penalized = true;
        row.scope_penalty = Some(penalty_factor);
        row.similarity = penalized;
        row.score = penalized;
        if row.semantic_relevance_score.is_some() {
            row.semantic_relevance_score = Some(penalized);
        }
        row.set_metadata("scope_penalized", serde_json::Value::Bool(true));
    }
}

pub fn count_scope_penalized(rows: &[RetrievalRow]) -> usize {
    rows.iter().filter(|row| row.scope_penalized).count()
}

/// Fraction of scoped rows whose scope does NOT match any requested standard.
pub fn scope_penalty_ratio(rows: &[RetrievalRow], requested_scopes: &[String]) -> f32 {
    if requested_scopes.is_empty() || rows.is_empty() {
        return 0.0;
    }

    let requested_upper: Vec<String> = requested_scopes
        .iter()
        .map(|scope| scope.to_uppercase())
        .collect();

    let mut considered = 0usize;
    let mut penalized = 0usize;
    for row in rows {
        let row_scope = extract_row_scope(row);
        if row_scope.is_empty() {
            continue;
        }
        considered += 1;
        if !requested_upper.iter().any(|scope| row_scope.contains(scope)) {
            penalized += 1;
        }
    }

    if considered == 0 {
        0.0
    } else {
        penalized as f32 / considered as f32
    }
}

/// Tenant-scoped retrieval context threaded through the engine and executor.
#[derive(Debug, Clone, Default)]
pub struct ScopeContext {
    pub tenant_id: String,
    pub is_global: Option<bool>,
    pub collection_id: Option<String>,
    pub source_standard: Option<String>,
    pub source_standards: Vec<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub time_range: Option<crate::validation::TimeRangeFilter>,
    pub agent_role: Option<String>,
}

impl ScopeContext {
    /// Merged single+plural standards, order preserving, deduplicated.
    pub fn requested_standards(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut ordered = Vec::new();
        if let Some(single) = self.source_standard.as_deref() {
            let single = single.trim();
            if !single.is_empty() && seen.insert(single.to_owned()) {
                ordered.push(single.to_owned());
            }
        }
        for standard in &self.source_standards {
            let standard = standard.trim();
            if !standard.is_empty() && seen.insert(standard.to_owned()) {
                ordered.push(standard.to_owned());
            }
        }
        ordered
    }

    pub fn clause_id(&self) -> Option<String> {
        self.metadata
            .get("clause_id")
            .and_then(|value| value.as_str())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_owned)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StructuralTrace {
    pub applied: bool,
    pub dropped: usize,
    pub kept: usize,
}

/// Scope enforcement, structural filtering, and tenant stamping for
/// retrieval results.
#[derive(Debug, Clone, Default)]
pub struct ScopeService;

impl ScopeService {
    /// Derive a per-sub-query scope from the sub-query text: standards found
    /// in the text override the request scope, and a single clause near a
    /// single standard becomes a `clause_id` metadata filter.
    pub fn scope_context_for_subquery(
        &self,
        patterns: &ScopePatterns,
        scope: &ScopeContext,
        subquery_text: &str,
    ) -> ScopeContext {
        let mut scoped = scope.clone();
        let standards = patterns.extract_requested_standards(subquery_text);
        let clauses = patterns.extract_clause_refs(subquery_text);

        if !standards.is_empty() {
            if standards.len() == 1 {
                scoped.source_standard = standards.into_iter().next();
                scoped.source_standards = Vec::new();
            } else {
                scoped.source_standard = None;
                scoped.source_standards = standards;
            }
        }

        if !clauses.is_empty() {
            let active_standard = scoped.source_standard.clone().unwrap_or_default();
            let clause_for_standard = if active_standard.is_empty() {
                None
            } else {
                patterns.clause_near_standard(subquery_text, &active_standard)
            };

            match clause_for_standard {
                Some(clause) => {
                    scoped
                        .metadata
                        .insert("clause_id".into(), serde_json::Value::String(clause));
                }
                None => {
                    scoped.metadata.remove("clause_id");
                }
            }
        }

        scoped
    }

    /// Attach tenant ownership to rows that can be proven in-tenant.
    ///
    /// Hybrid/vector/fts rows qualify only when their `source_id` is in the
    /// allowed set; graph-layer rows are already tenant-scoped by the
    /// navigation query.
    pub fn stamp_tenant_context(
        &self,
        rows: &mut [RetrievalRow],
        tenant_id: &str,
        allowed_source_ids: &HashSet<String>,
    ) {
        if tenant_id.is_empty() {
            return;
        }

        for row in rows.iter_mut() {
            let source_layer = row.source_layer.to_lowercase();
            let source_id = row
                .metadata_str("source_id")
                .map(str::to_owned)
                .or_else(|| row.source_id.clone())
                .unwrap_or_default();

            let safe_to_stamp = match source_layer.as_str() {
                "vector" | "fts" | "hybrid" => {
                    !source_id.is_empty() && allowed_source_ids.contains(&source_id)
                }
                "graph" | "graph_grounded" | "raptor" => true,
                _ => false,
            };

            if !safe_to_stamp {
                continue;
            }

            if row.tenant_id.is_none() {
                row.tenant_id = Some(tenant_id.to_owned());
            }
            row.metadata
                .entry("tenant_id".to_owned())
                .or_insert_with(|| serde_json::Value::String(tenant_id.to_owned()));
        }
    }

    /// Drop rows that exist only for document structure: not
    /// retrieval-eligible, or flagged toc/frontmatter.
    pub fn filter_structural_rows(
        &self,
        rows: Vec<RetrievalRow>,
    ) -> (Vec<RetrievalRow>, StructuralTrace) {
        if rows.is_empty() {
            return (
                Vec::new(),
                StructuralTrace {
                    applied: true,
                    dropped: 0,
                    kept: 0,
                },
            );
        }

        let mut kept = Vec::with_capacity(rows.len());
        let mut dropped = 0usize;
        for row in rows {
            if is_structural_only_row(&row) {
                dropped += 1;
                continue;
            }
            kept.push(row);
        }

        let trace = StructuralTrace {
            applied: true,
            dropped,
            kept: kept.len(),
        };
        (kept, trace)
    }
}

fn is_structural_only_row(row: &RetrievalRow) -> bool {
    if row.metadata_bool("retrieval_eligible") == Some(false) {
        return true;
    }
    if row.metadata_bool("is_toc") == Some(true) {
        return true;
    }
    if row.metadata_bool("is_frontmatter") == Some(true) {
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn patterns() -> ScopePatterns {
        ScopePatterns::new(
            r"\b(?:ISO|IEC|EN|NTC)\s?\d{3,5}(?::\d{4})?\b",
            r"\b\d+(?:\.\d+)+\b",
        )
        .expect("patterns")
    }

    fn row(scope: Option<&str>, similarity: f32) -> RetrievalRow {
        let mut metadata = serde_json::Map::new();
        if let Some(scope) = scope {
            metadata.insert("source_standard".into(), json!(scope));
        }
        RetrievalRow {
            id: format!("row-{scope:?}-{similarity}"),
            content: "body".into(),
            metadata,
            similarity,
            score: similarity,
            source_layer: "hybrid".into(),
            source_type: "content_chunk".into(),
            ..Default::default()
        }
    }

    #[test]
    fn extracts_ordered_unique_standards() {
        let p = patterns();
        let standards =
            p.extract_requested_standards("Compare iso 9001 with ISO 14001 and ISO 9001 again");
        assert_eq!(standards, vec!["ISO 9001", "ISO 14001"]);
    }

    #[test]
    fn extracts_clause_refs_in_order() {
        let p = patterns();
        let clauses = p.extract_clause_refs("See 8.5.1 then 7.1.5.2 and 8.5.1 once more");
        assert_eq!(clauses, vec!["8.5.1", "7.1.5.2"]);
    }

    #[test]
    fn scope_key_normalises_spacing() {
        let p = patterns();
        assert_eq!(p.scope_key("iso 9001"), p.scope_key("ISO  9001".trim()));
        assert_eq!(p.scope_key("ISO 9001"), "ISO-9001");
    }

    #[test]
    fn scope_clause_key_prefers_standard_and_clause() {
        let p = patterns();
        let key = p.scope_clause_key("what does 8.5.1 require", Some("ISO 9001"), Some("8.5.1"));
        assert_eq!(key, "scope_clause::ISO 9001::8.5.1");

        let fallback = p.scope_clause_key("What   Does it  Require", None, None);
        assert_eq!(fallback, "query::what does it require");
    }

    #[test]
    fn clause_near_standard_requires_exactly_one_clause() {
        let p = patterns();
        assert_eq!(
            p.clause_near_standard("ISO 9001 clause 8.5.1 production", "ISO 9001"),
            Some("8.5.1".to_owned())
        );
        assert_eq!(
            p.clause_near_standard("ISO 9001 clauses 8.5.1 and 7.1.5", "ISO 9001"),
            None,
            "two clauses near the standard drop the hint"
        );
    }

    #[test]
    fn clause_heavy_detection() {
        let p = patterns();
        assert!(p.is_clause_heavy_query("what does clause 8.5.1 say"));
        assert!(p.is_clause_heavy_query("ver la cláusula 4.4"));
        assert!(!p.is_clause_heavy_query("how do I weld pipes"));
    }

    #[test]
    fn penalty_reduces_score_and_flags_row() {
        let p = patterns();
        let mut rows = vec![row(Some("ISO 14001"), 0.8), row(Some("ISO 9001"), 0.9)];
        apply_scope_penalty(&mut rows, &p, &["ISO 9001".to_owned()], 0.75);

        assert!(rows[0].scope_penalized);
        assert!((rows[0].score - 0.2).abs() < 1e-5);
        assert!(!rows[1].scope_penalized);
        assert!((rows[1].score - 0.9).abs() < 1e-5);
        assert_eq!(count_scope_penalized(&rows), 1);
    }

    #[test]
    fn rows_without_scope_are_untouched() {
        let p = patterns();
        let mut rows = vec![row(None, 0.5)];
        apply_scope_penalty(&mut rows, &p, &["ISO 9001".to_owned()], 0.75);
        assert!(!rows[0].scope_penalized);
        assert!((rows[0].score - 0.5).abs() < 1e-5);
    }

    #[test]
    fn penalty_ratio_counts_only_scoped_rows() {
        let rows = vec![
            row(Some("ISO 14001"), 0.8),
            row(Some("ISO 9001"), 0.9),
            row(None, 0.5),
        ];
        let ratio = scope_penalty_ratio(&rows, &["ISO 9001".to_owned()]);
        assert!((ratio - 0.5).abs() < 1e-5);

        assert_eq!(scope_penalty_ratio(&[], &["ISO 9001".to_owned()]), 0.0);
        assert_eq!(scope_penalty_ratio(&rows, &[]), 0.0);
    }

    #[test]
    fn subquery_scope_overrides_standards_and_clause() {
        let p = patterns();
        let service = ScopeService;
        let base = ScopeContext {
            tenant_id: "t1".into(),
            source_standard: Some("ISO 14001".into()),
            ..Default::default()
        };

        let scoped =
            service.scope_context_for_subquery(&p, &base, "ISO 9001 clause 8.5.1 controls");
        assert_eq!(scoped.source_standard.as_deref(), Some("ISO 9001"));
        assert_eq!(scoped.clause_id().as_deref(), Some("8.5.1"));

        let multi = service.scope_context_for_subquery(
            &p,
            &base,
            "compare 8.5.1 and 7.1.5 across ISO 9001 and ISO 14001",
        );
        assert_eq!(multi.source_standards, vec!["ISO 9001", "ISO 14001"]);
        assert!(multi.clause_id().is_none(), "multiple clauses drop the hint");
    }

    #[test]
    fn stamping_requires_allowed_source_for_hybrid_rows() {
        let service = ScopeService;
        let mut rows = vec![row(Some("ISO 9001"), 0.9)];
        rows[0]
            .metadata
            .insert("source_id".into(), json!("src-1"));
        let mut graph_row = row(None, 0.4);
        graph_row.source_layer = "graph".into();
        rows.push(graph_row);
        let mut unproven = row(None, 0.3);
        unproven.metadata.insert("source_id".into(), json!("src-x"));
        rows.push(unproven);

        let allowed: HashSet<String> = ["src-1".to_owned()].into();
        service.stamp_tenant_context(&mut rows, "t1", &allowed);

        assert_eq!(rows[0].tenant_id.as_deref(), Some("t1"));
        assert_eq!(rows[1].tenant_id.as_deref(), Some("t1"), "graph rows are pre-scoped");
        assert!(rows[2].tenant_id.is_none(), "unproven source stays unstamped");
    }

    #[test]
    fn structural_rows_are_dropped() {
        let service = ScopeService;
        let mut toc = row(None, 0.9);
        toc.metadata.insert("is_toc".into(), json!(true));
        let mut ineligible = row(None, 0.8);
        ineligible
            .metadata
            .insert("retrieval_eligible".into(), json!(false));
        let body = row(Some("ISO 9001"), 0.7);

        let (kept, trace) = service.filter_structural_rows(vec![toc, ineligible, body]);
        assert_eq!(kept.len(), 1);
        assert_eq!(trace.dropped, 2);
        assert_eq!(trace.kept, 1);
        assert!(trace.applied);
    }
}
