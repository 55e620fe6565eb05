//! Late fusion of the chunk/graph/RAPTOR streams, reciprocal-rank fusion for
//! multi-query merging, and round-robin stratification across standards.

use std::collections::{HashMap, HashSet};

use serde_json::json;

use crate::{
    scoping::{extract_row_scope, ScopePatterns},
    RetrievalItem, RetrievalRow,
};

/// Deterministic identity for deduplication across sources: the row id when
/// present, otherwise a fallback over source + content prefix.
pub fn item_identity(item: &RetrievalItem) -> String {
    let row_id = item
        .metadata
        .get("id")
        .and_then(|value| value.as_str())
        .map(str::trim)
        .unwrap_or_default();
    if !row_id.is_empty() {
        return format!("row::{row_id}");
    }
    let content_key: String = item.content.trim().chars().take(120).collect();
    format!("fallback::{}::{}", item.source.trim(), content_key)
}

/// Clause references attached to an item, from metadata and content.
pub fn item_clause_refs(item: &RetrievalItem, patterns: &ScopePatterns) -> HashSet<String> {
    let mut refs: HashSet<String> = HashSet::new();
    if let Some(clause_id) = item
        .metadata
        .get("clause_id")
        .and_then(|value| value.as_str())
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        refs.insert(clause_id.to_owned());
    }
    if let Some(raw_refs) = item.metadata.get("clause_refs").and_then(|value| value.as_array()) {
        refs.extend(
            raw_refs
                .iter()
                .filter_map(|value| value.as_str())
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_owned),
        );
    }
    refs.extend(patterns.extract_clause_refs(&item.content));
    refs
}

pub const FUSION_QUOTA_CHUNKS: usize = 3;
pub const FUSION_QUOTA_GRAPH: usize = 2;
pub const FUSION_QUOTA_RAPTOR: usize = 1;

/// Assemble the final list from the three parallel streams using fixed
/// quotas (chunks 3, graph 2, raptor 1); remaining capacity is filled from
/// chunks, then graph, then RAPTOR.
pub fn fuse_late_results(
    chunks: &[RetrievalItem],
    graph: &[RetrievalItem],
    raptor: &[RetrievalItem],
    k: usize,
) -> Vec<RetrievalItem> {
    let mut merged: Vec<RetrievalItem> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    let add_items = |source: &[RetrievalItem], limit: usize, merged: &mut Vec<RetrievalItem>, seen: &mut HashSet<String>| {
        let mut added = 0usize;
        for item in source {
            if added >= limit {
                break;
            }
            let identity = item_identity(item);
            if seen.insert(identity) {
                merged.push(item.clone());
                added += 1;
            }
        }
    };

    add_items(chunks, FUSION_QUOTA_CHUNKS, &mut merged, &mut seen);
    add_items(graph, FUSION_QUOTA_GRAPH, &mut merged, &mut seen);
    add_items(raptor, FUSION_QUOTA_RAPTOR, &mut merged, &mut seen);

    if merged.len() < k {
        add_items(chunks, k - merged.len(), &mut merged, &mut seen);
    }
    if merged.len() < k {
        add_items(graph, k - merged.len(), &mut merged, &mut seen);
    }
    if merged.len() < k {
        add_items(raptor, k - merged.len(), &mut merged, &mut seen);
    }

    merged.truncate(k);
    merged
}

/// Reciprocal rank fusion across grouped result lists:
/// `score(row) = Σ 1/(rrf_k + rank_in_group)`.
pub fn rrf_merge(
    grouped_items: &[(String, Vec<RetrievalItem>)],
    rrf_k: u32,
    top_k: usize,
) -> Vec<RetrievalItem> {
    let mut score_by_id: HashMap<String, f32> = HashMap::new();
    let mut item_by_id: HashMap<String, &RetrievalItem> = HashMap::new();
    let mut order: Vec<String> = Vec::new();

    for (_, items) in grouped_items {
        for (rank, item) in items.iter().enumerate() {
            let identity = item_identity(item);
            let contribution = 1.0 / (rrf_k as f32 + rank as f32 + 1.0);
            match score_by_id.get_mut(&identity) {
                Some(score) => *score += contribution,
                None => {
                    score_by_id.insert(identity.clone(), contribution);
                    item_by_id.insert(identity.clone(), item);
                    order.push(identity);
                }
            }
        }
    }

    let mut ranked: Vec<(String, f32)> = order
        .into_iter()
        .map(|identity| {
            let score = score_by_id.get(&identity).copied().unwrap_or_default();
            (identity, score)
        })
        .collect();
    ranked.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });

    ranked
        .into_iter()
        .take(top_k.max(1))
        .filter_map(|(identity, score)| {
            item_by_id.get(&identity).map(|source| {
                let mut metadata = source.metadata.clone();
                metadata.insert("score_space".into(), json!("rrf"));
                RetrievalItem {
                    source: source.source.clone(),
                    content: source.content.clone(),
                    score,
                    metadata,
                }
            })
        })
        .collect()
}

/// Balance results across multiple requested standards (round-robin) so a
/// single standard cannot starve the others.
pub fn stratify_results(
    rows: Vec<RetrievalRow>,
    patterns: &ScopePatterns,
    requested_scopes: &[String],
    max_count: usize,
) -> Vec<RetrievalRow> {
    if requested_scopes.is_empty() || rows.is_empty() {
        let mut rows = rows;
        rows.truncate(max_count);
        return rows;
    }

    let scope_targets: Vec<String> = requested_scopes
        .iter()
        .map(|scope| patterns.normalize_scope_name(scope))
        .filter(|scope| !scope.is_empty())
        .collect();

    let mut buckets: Vec<Vec<RetrievalRow>> = scope_targets.iter().map(|_| Vec::new()).collect();
    let mut others: Vec<RetrievalRow> = Vec::new();

    for row in rows {
        let row_scope = patterns.normalize_scope_name(&extract_row_scope(&row));
        let mut matched = false;
        for (index, target) in scope_targets.iter().enumerate() {
            if row_scope == *target
                || (!row_scope.is_empty()
                    && (row_scope.contains(target) || target.contains(&row_scope)))
            {
                buckets[index].push(row.clone());
                matched = true;
                break;
            }
        }
        if !matched {
            others.push(row);
        }
    }

    let mut stratified: Vec<RetrievalRow> = Vec::new();
    let max_len = buckets.iter().map(Vec::len).max().unwrap_or(0);
    'outer: for round in 0..max_len {
        for bucket in &buckets {
            if let Some(row) = bucket.get(round) {
                stratified.push(row.clone());
            }
            if stratified.len() >= max_count {
                break 'outer;
            }
        }
    }

    if stratified.len() < max_count {
        stratified.extend(
            others
                .into_iter()
                .take(max_count - stratified.len()),
        );
    }

    stratified.truncate(max_count);
    stratified
}

/// Convert engine rows into the client-facing item shape, preserving trace
/// and ownership fields inside metadata.
pub fn to_retrieval_items(rows: &[RetrievalRow]) -> Vec<RetrievalItem> {
    rows.iter()
        .enumerate()
        .filter(|(_, row)| !row.content.trim().is_empty())
        .map(|(index, row)| {
            let mut metadata = row.metadata.clone();
            metadata.insert("source_layer".into(), json!(row.source_layer));
            metadata.insert("source_type".into(), json!(row.source_type));
            metadata.insert("similarity".into(), json!(row.similarity));
            metadata.insert("scope_penalized".into(), json!(row.scope_penalized));
            if let Some(score) = row.semantic_relevance_score {
                metadata.insert("semantic_relevance_score".into(), json!(score));
            }
            if let Some(penalty) = row.scope_penalty {
                metadata.insert("scope_penalty".into(), json!(penalty));
            }
            if let Some(tenant_id) = &row.tenant_id {
                metadata
                    .entry("tenant_id".to_owned())
                    .or_insert_with(|| json!(tenant_id));
            }
            if !row.id.is_empty() {
                metadata.entry("id".to_owned()).or_insert_with(|| json!(row.id));
            }

            let source = if row.id.is_empty() {
                format!("R{}", index + 1)
            } else {
                row.id.clone()
            };

            RetrievalItem {
                source,
                content: row.content.trim().to_owned(),
                score: if row.score != 0.0 { row.score } else { row.similarity },
                metadata,
            }
        })
        .collect()
}

/// Which requested standards have no representative in the merged items.
pub fn missing_scopes(
    items: &[RetrievalItem],
    patterns: &ScopePatterns,
    requested_standards: &[String],
    require_all_scopes: bool,
) -> Vec<String> {
    if !require_all_scopes || requested_standards.is_empty() {
        return Vec::new();
    }

    let present: HashSet<String> = items
        .iter()
        .filter_map(|item| {
            item.metadata
                .get("source_standard")
                .and_then(|value| value.as_str())
        })
        .map(|scope| patterns.normalize_scope_name(scope))
        .filter(|scope| !scope.is_empty())
        .collect();

    requested_standards
        .iter()
        .filter(|scope| !present.contains(&patterns.normalize_scope_name(scope)))
        .cloned()
        .collect()
}

/// Which clause references from the query remain uncovered by the items.
pub fn missing_clause_refs(
    items: &[RetrievalItem],
    patterns: &ScopePatterns,
    query_clause_refs: &[String],
    min_clause_refs_required: usize,
) -> Vec<String> {
    if min_clause_refs_required == 0 || query_clause_refs.is_empty() {
        return Vec::new();
    }

    let query_clause_set: HashSet<&str> = query_clause_refs
        .iter()
        .map(String::as_str)
        .filter(|value| !value.trim().is_empty())
        .collect();
    if query_clause_set.is_empty() {
        return Vec::new();
    }

    let mut covered: HashSet<String> = HashSet::new();
    for item in items {
        covered.extend(item_clause_refs(item, patterns));
    }

    let uncovered: Vec<String> = query_clause_refs
        .iter()
        .filter(|clause| !covered.contains(clause.as_str()))
        .cloned()
        .collect();

    if uncovered.len() >= min_clause_refs_required {
        uncovered
    } else {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, content: &str) -> RetrievalItem {
        let mut metadata = serde_json::Map::new();
        metadata.insert("id".into(), json!(id));
        RetrievalItem {
            source: id.into(),
            content: content.into(),
            score: 0.5,
            metadata,
        }
    }

    fn patterns() -> ScopePatterns {
        ScopePatterns::new(
            r"\b(?:ISO|IEC|EN|NTC)\s?\d{3,5}(?::\d{4})?\b",
            r"\b\d+(?:\.\d+)+\b",
        )
        .expect("patterns")
    }

    #[test]
    fn identity_prefers_row_id() {
        assert_eq!(item_identity(&item("abc", "body")), "row::abc");

        let mut anonymous = item("", "long body text");
        anonymous.metadata.remove("id");
        anonymous.source = "G1".into();
        assert_eq!(item_identity(&anonymous), "fallback::G1::long body text");
    }

    #[test]
    fn fusion_respects_quotas_then_fills_slack() {
        let chunks: Vec<RetrievalItem> =
            (0..6).map(|i| item(&format!("c{i}"), "chunk")).collect();
        let graph: Vec<RetrievalItem> = (0..4).map(|i| item(&format!("g{i}"), "graph")).collect();
        let raptor: Vec<RetrievalItem> = (0..3).map(|i| item(&format!("r{i}"), "raptor")).collect();

        let merged = fuse_late_results(&chunks, &graph, &raptor, 6);
        let ids: Vec<&str> = merged.iter().map(|item| item.source.as_str()).collect();

        // Quotas first (3 chunks, 2 graph, 1 raptor); k=6 is exactly filled.
        assert_eq!(ids, vec!["c0", "c1", "c2", "g0", "g1", "r0"]);
    }

    #[test]
    fn fusion_slack_fills_from_chunks_first() {
        let chunks: Vec<RetrievalItem> =
            (0..5).map(|i| item(&format!("c{i}"), "chunk")).collect();
        let graph = vec![item("g0", "graph")];
        let raptor: Vec<RetrievalItem> = Vec::new();

        let merged = fuse_late_results(&chunks, &graph, &raptor, 6);
        let ids: Vec<&str> = merged.iter().map(|item| item.source.as_str()).collect();
        assert_eq!(ids, vec!["c0", "c1", "c2", "g0", "c3", "c4"]);
    }

    #[test]
    fn fusion_dedupes_across_streams() {
        let shared = item("x", "shared");
        let merged = fuse_late_results(
            &[shared.clone(), item("c1", "chunk")],
            &[shared.clone()],
            &[shared],
            6,
        );
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn rrf_merge_matches_spec_scenario() {
        // Sub-query 1 returns [A, B]; sub-query 2 returns [B, C]. With
        // rrf_k = 60 the merged ordering is B, A, C.
        let grouped = vec![
            ("q1".to_owned(), vec![item("A", "a"), item("B", "b")]),
            ("q2".to_owned(), vec![item("B", "b"), item("C", "c")]),
        ];

        let merged = rrf_merge(&grouped, 60, 10);
        let ids: Vec<&str> = merged.iter().map(|item| item.source.as_str()).collect();
        assert_eq!(ids, vec!["B", "A", "C"]);
        assert!(merged[0].score > merged[1].score);
        assert_eq!(
            merged[0].metadata.get("score_space").and_then(|v| v.as_str()),
            Some("rrf")
        );
    }

    #[test]
    fn stratify_round_robins_across_standards() {
        let p = patterns();
        let mut rows: Vec<RetrievalRow> = Vec::new();
        for (index, standard) in [
            "ISO 9001", "ISO 9001", "ISO 9001", "ISO 14001", "ISO 14001",
        ]
        .iter()
        .enumerate()
        {
            let mut row = RetrievalRow {
                id: format!("row{index}"),
                content: "body".into(),
                source_layer: "hybrid".into(),
                source_type: "content_chunk".into(),
                ..Default::default()
            };
            row.set_metadata("source_standard", json!(standard));
            rows.push(row);
        }

        let stratified = stratify_results(
            rows,
            &p,
            &["ISO 9001".to_owned(), "ISO 14001".to_owned()],
            4,
        );
        let scopes: Vec<&str> = stratified
            .iter()
            .filter_map(|row| row.metadata_str("source_standard"))
            .collect();
        assert_eq!(scopes, vec!["ISO 9001", "ISO 14001", "ISO 9001", "ISO 14001"]);
    }

    #[test]
    fn missing_scopes_reports_unrepresented_standards() {
        let p = patterns();
        let mut item_a = item("a", "body");
        item_a.metadata.insert("source_standard".into(), json!("ISO 9001"));

        let missing = missing_scopes(
            &[item_a],
            &p,
            &["ISO 9001".to_owned(), "ISO 14001".to_owned()],
            true,
        );
        assert_eq!(missing, vec!["ISO 14001"]);

        let not_required = missing_scopes(&[], &p, &["ISO 9001".to_owned()], false);
        assert!(not_required.is_empty());
    }

    #[test]
    fn missing_clause_refs_requires_threshold() {
        let p = patterns();
        let covered = item("a", "clause 8.5.1 applies here");

        let missing = missing_clause_refs(
            &[covered.clone()],
            &p,
            &["8.5.1".to_owned(), "7.1.5".to_owned()],
            1,
        );
        assert_eq!(missing, vec!["7.1.5"]);

        // Below the minimum, coverage is considered satisfied.
        let below = missing_clause_refs(
            &[covered],
            &p,
            &["8.5.1".to_owned(), "7.1.5".to_owned()],
            2,
        );
        assert!(below.is_empty());
    }
}
