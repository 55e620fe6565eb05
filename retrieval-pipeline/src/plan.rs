use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Parallel,
    Sequential,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlannedSubQuery {
    pub id: u32,
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependency_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_relations: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_node_types: Option<Vec<String>>,
    #[serde(default)]
    pub is_deep: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct QueryPlan {
    #[serde(default)]
    pub is_multihop: bool,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    #[serde(default)]
    pub sub_queries: Vec<PlannedSubQuery>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
}

/// Coerce a loose JSON value (an LLM plan or a legacy format) into a
/// `QueryPlan`. Returns `None` when no usable sub-queries survive.
pub fn coerce_query_plan(raw_plan: &serde_json::Value) -> Option<QueryPlan> {
    let object = raw_plan.as_object()?;
    let raw_items = object.get("sub_queries")?.as_array()?;

    let mut sub_queries: Vec<PlannedSubQuery> = Vec::new();
    for (index, item) in raw_items.iter().enumerate() {
        let Some(item) = item.as_object() else {
            continue;
        };
        let query = item
            .get("query")
            .and_then(|value| value.as_str())
            .map(str::trim)
            .unwrap_or_default();
        if query.is_empty() {
            continue;
        }

        let id = match item.get("id") {
            Some(serde_json::Value::Number(number)) => number
                .as_u64()
                .and_then(|value| u32::try_from(value).ok())
                .unwrap_or(index as u32 + 1),
            Some(serde_json::Value::String(raw)) => raw
                .trim()
                .parse::<u32>()
                .unwrap_or(index as u32 + 1),
            _ => index as u32 + 1,
        };

        let dependency_id = item
            .get("dependency_id")
            .and_then(|value| value.as_u64())
            .and_then(|value| u32::try_from(value).ok());

        let string_list = |key: &str| -> Option<Vec<String>> {
            let values: Vec<String> = item
                .get(key)?
                .as_array()?
                .iter()
                .filter_map(|value| value.as_str())
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_owned)
                .collect();
            if values.is_empty() {
                None
            } else {
                Some(values)
            }
        };

        sub_queries.push(PlannedSubQuery {
            id,
            query: query.to_owned(),
            dependency_id,
            target_relations: string_list("target_relations"),
            target_node_types: string_list("target_node_types"),
            is_deep: item
                .get("is_deep")
                .and_then(|value| value.as_bool())
                .unwrap_or(false),
        });
    }

    if sub_queries.is_empty() {
        return None;
    }

    let execution_mode = match object
        .get("execution_mode")
        .and_then(|value| value.as_str())
        .map(|value| value.trim().to_lowercase())
        .as_deref()
    {
        Some("sequential") => ExecutionMode::Sequential,
        _ => ExecutionMode::Parallel,
    };

    let is_multihop = object
        .get("is_multihop")
        .and_then(|value| value.as_bool())
        .unwrap_or(sub_queries.len() > 1);

    let fallback_reason = object
        .get("fallback_reason")
        .and_then(|value| value.as_str())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned);

    Some(QueryPlan {
        is_multihop,
        execution_mode,
        sub_queries,
        fallback_reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_through_coercion() {
        let plan = QueryPlan {
            is_multihop: true,
            execution_mode: ExecutionMode::Sequential,
            sub_queries: vec![
                PlannedSubQuery {
                    id: 1,
                    query: "ISO 9001 clause 8.5.1".into(),
                    dependency_id: None,
                    target_relations: Some(vec!["REQUIRES".into()]),
                    target_node_types: None,
                    is_deep: true,
                },
                PlannedSubQuery {
                    id: 2,
                    query: "production controls".into(),
                    dependency_id: Some(1),
                    target_relations: None,
                    target_node_types: Some(vec!["CONCEPT".into()]),
                    is_deep: false,
                },
            ],
            fallback_reason: Some("planner degraded".into()),
        };

        let raw = serde_json::to_value(&plan).expect("serialize");
        let coerced = coerce_query_plan(&raw).expect("coerce");
        assert_eq!(coerced, plan);
    }

    #[test]
    fn coercion_fills_missing_ids_and_skips_blank_queries() {
        let raw = json!({
            "execution_mode": "PARALLEL",
            "sub_queries": [
                {"query": "first"},
                {"query": "   "},
                {"id": "7", "query": "seventh"},
                "not-an-object"
            ]
        });

        let plan = coerce_query_plan(&raw).expect("coerce");
        assert_eq!(plan.sub_queries.len(), 2);
        assert_eq!(plan.sub_queries[0].id, 1);
        assert_eq!(plan.sub_queries[1].id, 7);
        assert_eq!(plan.execution_mode, ExecutionMode::Parallel);
        assert!(plan.is_multihop, "defaults to multihop when several sub-queries");
    }

    #[test]
    fn single_subquery_defaults_to_not_multihop() {
        let raw = json!({"sub_queries": [{"query": "only"}]});
        let plan = coerce_query_plan(&raw).expect("coerce");
        assert!(!plan.is_multihop);
    }

    #[test]
    fn unusable_plans_yield_none() {
        assert!(coerce_query_plan(&json!(null)).is_none());
        assert!(coerce_query_plan(&json!({"sub_queries": "nope"})).is_none());
        assert!(coerce_query_plan(&json!({"sub_queries": [{"query": "  "}]})).is_none());
    }
}
