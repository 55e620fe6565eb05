//! Request filter validation. Violations are collected and returned, never
//! raised; the contract layer decides whether they are fatal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScopeIssue {
    pub code: String,
    pub field: String,
    pub message: String,
}

impl ScopeIssue {
    fn new(code: &str, field: impl Into<String>, message: &str) -> Self {
        Self {
            code: code.to_owned(),
            field: field.into(),
            message: message.to_owned(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeRangeFilter {
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
}

/// Raw scope filters as they arrive on a request. Unknown top-level keys are
/// captured via the flattened map so they can be reported as violations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScopeFilters {
    #[serde(default)]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    pub time_range: Option<TimeRangeFilter>,
    #[serde(default)]
    pub source_standard: Option<String>,
    #[serde(default)]
    pub source_standards: Option<Vec<String>>,
    #[serde(flatten, default)]
    pub unknown: serde_json::Map<String, serde_json::Value>,
}

/// Canonical form after validation: single vs plural standards collapsed,
/// reserved metadata keys removed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NormalizedFilters {
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub time_range: Option<TimeRangeFilter>,
    pub source_standard: Option<String>,
    pub source_standards: Vec<String>,
}

const RESERVED_METADATA_KEYS: [&str; 2] = ["tenant_id", "institution_id"];

pub fn validate_retrieval_filters(
    filters: &ScopeFilters,
) -> (NormalizedFilters, Vec<ScopeIssue>) {
    let mut violations = Vec::new();

    let mut unknown_keys: Vec<&String> = filters.unknown.keys().collect();
    unknown_keys.sort();
    for key in unknown_keys {
        violations.push(ScopeIssue::new(
            "INVALID_SCOPE_FILTER",
            format!("filters.{key}"),
            "filter key is not allowed",
        ));
    }

    let metadata = validate_metadata_values(filters.metadata.as_ref(), &mut violations);
    let time_range = validate_time_range(filters.time_range.as_ref(), &mut violations);
    let (source_standard, source_standards) = validate_source_standards(
        filters.source_standard.as_deref(),
        filters.source_standards.as_deref(),
        &mut violations,
    );

    (
        NormalizedFilters {
            metadata,
            time_range,
            source_standard,
            source_standards,
        },
        violations,
    )
}

fn validate_metadata_values(
    metadata: Option<&serde_json::Map<String, serde_json::Value>>,
    violations: &mut Vec<ScopeIssue>,
) -> serde_json::Map<String, serde_json::Value> {
    let mut normalized = serde_json::Map::new();
    let Some(metadata) = metadata else {
        return normalized;
    };

    for (key, value) in metadata {
        if RESERVED_METADATA_KEYS.contains(&key.as_str()) {
            violations.push(ScopeIssue::new(
                "RESERVED_METADATA_KEY",
                format!("filters.metadata.{key}"),
                "this key is reserved for internal use",
            ));
            continue;
        }

        if value.is_null() {
            continue;
        }

        let is_scalar = |v: &serde_json::Value| v.is_string() || v.is_number() || v.is_boolean();
        let valid = is_scalar(value)
            || value
                .as_array()
                .map(|items| items.iter().all(is_scalar))
                .unwrap_or(false);

        if valid {
            normalized.insert(key.clone(), value.clone());
        } else {
            violations.push(ScopeIssue::new(
                "INVALID_METADATA_VALUE",
                format!("filters.metadata.{key}"),
                "metadata values must be scalars or lists of scalars",
            ));
        }
    }

    normalized
}

fn validate_time_range(
    time_range: Option<&TimeRangeFilter>,
    violations: &mut Vec<ScopeIssue>,
) -> Option<TimeRangeFilter> {
    let time_range = time_range?;
    let mut normalized = time_range.clone();

    if let Some(field) = time_range.field.as_deref() {
        if !matches!(field, "created_at" | "updated_at") {
            violations.push(ScopeIssue::new(
                "INVALID_TIME_RANGE",
                "filters.time_range.field",
                "field must be created_at or updated_at",
            ));
            return None;
        }
    }

    for (key, value) in [("from", &time_range.from), ("to", &time_range.to)] {
        if let Some(value) = value {
            if parse_iso8601(value).is_none() {
                violations.push(ScopeIssue::new(
                    "INVALID_TIME_VALUE",
                    format!("filters.time_range.{key}"),
                    "time value must be an ISO-8601 timestamp",
                ));
                match key {
                    "from" => normalized.from = None,
                    _ => normalized.to = None,
                }
            }
        }
    }

    Some(normalized)
}

fn validate_source_standards(
    source_standard: Option<&str>,
    source_standards: Option<&[String]>,
    violations: &mut Vec<ScopeIssue>,
) -> (Option<String>, Vec<String>) {
    let mut standards: Vec<String> = Vec::new();

    if let Some(raw) = source_standards {
        for value in raw {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                violations.push(ScopeIssue::new(
                    "INVALID_SCOPE_FILTER",
                    "filters.source_standards",
                    "source_standards entries must be non-empty strings",
                ));
                continue;
            }
            if !standards.iter().any(|existing| existing == trimmed) {
                standards.push(trimmed.to_owned());
            }
        }
    }

    let single = source_standard
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned);

    if let Some(single) = single {
        if !standards.iter().any(|existing| *existing == single) {
            standards.insert(0, single);
        }
    }

    match standards.len() {
        0 => (None, Vec::new()),
        1 => (standards.into_iter().next(), Vec::new()),
        _ => (None, standards),
    }
}

pub fn parse_iso8601(value: &str) -> Option<DateTime<Utc>> {
    let text = value.trim();
    if text.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}

/// Does a row's timestamp land inside the time-range filter? `None` when no
/// filter is set.
pub fn matches_time_range(
    row_metadata: &serde_json::Map<String, serde_json::Value>,
    time_range: Option<&TimeRangeFilter>,
) -> Option<bool> {
    let time_range = time_range?;
    let field = time_range.field.as_deref().unwrap_or("created_at");
    if !matches!(field, "created_at" | "updated_at") {
        return Some(false);
    }

    let Some(row_value) = row_metadata.get(field).and_then(|value| value.as_str()) else {
        return Some(false);
    };
    let Some(row_time) = parse_iso8601(row_value) else {
        return Some(false);
    };

    if let Some(from) = time_range.from.as_deref().and_then(parse_iso8601) {
        if row_time < from {
            return Some(false);
        }
    }
    if let Some(to) = time_range.to.as_deref().and_then(parse_iso8601) {
        if row_time > to {
            return Some(false);
        }
    }
    Some(true)
}

/// Which metadata filter keys are present and matching on a row.
pub fn metadata_keys_matched(
    row_metadata: &serde_json::Map<String, serde_json::Value>,
    metadata_filter: &serde_json::Map<String, serde_json::Value>,
) -> Vec<String> {
    let mut matched: Vec<String> = metadata_filter
        .iter()
        .filter(|(key, expected)| {
            let Some(actual) = row_metadata.get(*key) else {
                return false;
            };
            match expected.as_array() {
                Some(options) => options.contains(actual),
                None => actual == *expected,
            }
        })
        .map(|(key, _)| key.clone())
        .collect();
    matched.sort();
    matched
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_top_level_keys_are_rejected() {
        let filters: ScopeFilters = serde_json::from_value(json!({
            "source_standard": "ISO 9001",
            "surprise": {"x": 1}
        }))
        .expect("parse");

        let (normalized, violations) = validate_retrieval_filters(&filters);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].code, "INVALID_SCOPE_FILTER");
        assert_eq!(violations[0].field, "filters.surprise");
        assert_eq!(normalized.source_standard.as_deref(), Some("ISO 9001"));
    }

    #[test]
    fn reserved_metadata_keys_are_rejected() {
        let filters: ScopeFilters = serde_json::from_value(json!({
            "metadata": {"tenant_id": "t2", "clause_id": "8.5.1"}
        }))
        .expect("parse");

        let (normalized, violations) = validate_retrieval_filters(&filters);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].code, "RESERVED_METADATA_KEY");
        assert!(normalized.metadata.contains_key("clause_id"));
        assert!(!normalized.metadata.contains_key("tenant_id"));
    }

    #[test]
    fn non_scalar_metadata_values_are_rejected() {
        let filters: ScopeFilters = serde_json::from_value(json!({
            "metadata": {"ok": ["a", "b"], "bad": {"nested": true}}
        }))
        .expect("parse");

        let (normalized, violations) = validate_retrieval_filters(&filters);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].code, "INVALID_METADATA_VALUE");
        assert!(normalized.metadata.contains_key("ok"));
    }

    #[test]
    fn single_and_plural_standards_collapse() {
        let filters: ScopeFilters = serde_json::from_value(json!({
            "source_standard": "ISO 9001",
            "source_standards": ["ISO 9001", "ISO 14001"]
        }))
        .expect("parse");

        let (normalized, violations) = validate_retrieval_filters(&filters);
        assert!(violations.is_empty());
        assert!(normalized.source_standard.is_none());
        assert_eq!(normalized.source_standards, vec!["ISO 9001", "ISO 14001"]);

        let single: ScopeFilters = serde_json::from_value(json!({
            "source_standards": ["ISO 45001"]
        }))
        .expect("parse");
        let (normalized, _) = validate_retrieval_filters(&single);
        assert_eq!(normalized.source_standard.as_deref(), Some("ISO 45001"));
        assert!(normalized.source_standards.is_empty());
    }

    #[test]
    fn time_range_field_and_values_are_checked() {
        let filters: ScopeFilters = serde_json::from_value(json!({
            "time_range": {"field": "deleted_at", "from": "2024-01-01T00:00:00Z"}
        }))
        .expect("parse");
        let (normalized, violations) = validate_retrieval_filters(&filters);
        assert!(normalized.time_range.is_none());
        assert_eq!(violations[0].code, "INVALID_TIME_RANGE");

        let bad_value: ScopeFilters = serde_json::from_value(json!({
            "time_range": {"field": "created_at", "from": "not-a-date"}
        }))
        .expect("parse");
        let (normalized, violations) = validate_retrieval_filters(&bad_value);
        assert_eq!(violations[0].code, "INVALID_TIME_VALUE");
        assert!(normalized.time_range.expect("range kept").from.is_none());
    }

    #[test]
    fn time_range_matching_on_rows() {
        let mut metadata = serde_json::Map::new();
        metadata.insert("created_at".into(), json!("2024-06-15T12:00:00Z"));

        let range = TimeRangeFilter {
            field: Some("created_at".into()),
            from: Some("2024-01-01T00:00:00Z".into()),
            to: Some("2024-12-31T00:00:00Z".into()),
        };
        assert_eq!(matches_time_range(&metadata, Some(&range)), Some(true));

        let out_of_range = TimeRangeFilter {
            field: Some("created_at".into()),
            from: Some("2025-01-01T00:00:00Z".into()),
            to: None,
        };
        assert_eq!(matches_time_range(&metadata, Some(&out_of_range)), Some(false));
        assert_eq!(matches_time_range(&metadata, None), None);
    }

    #[test]
    fn metadata_key_matching() {
        let mut row = serde_json::Map::new();
        row.insert("doc_type".into(), json!("manual"));
        row.insert("lang".into(), json!("en"));

        let mut filter = serde_json::Map::new();
        filter.insert("doc_type".into(), json!(["manual", "guide"]));
        filter.insert("lang".into(), json!("es"));
        filter.insert("missing".into(), json!("x"));

        assert_eq!(metadata_keys_matched(&row, &filter), vec!["doc_type"]);
    }
}
