//! End-to-end scenarios driven through the full router: backpressure,
//! idempotency replay, tenant-scoped hybrid retrieval, multi-query RRF,
//! plan early-exit, and graph late grounding.


use axum::http::StatusCode;
use common::storage::types::{
    content_chunk::{ChunkRole, ContentChunk},
    knowledge_entity::KnowledgeEntity,
    node_provenance::NodeProvenance,
    source_document::{DocumentStatus, SourceDocument},
};
use common::utils::authority::AuthorityLevel;
use serde_json::json;
use test_utils::{build_test_app, embed, read_json, send_json, test_config, upload_document};
use tower::ServiceExt;

async fn seed_chunk(
    db: &common::storage::db::SurrealDbClient,
    tenant: &str,
    source: &str,
    content: &str,
    standard: Option<&str>,
) -> ContentChunk {
    let mut chunk = ContentChunk::new(
        source,
        tenant,
        content,
        0,
        ChunkRole::NormativeBody,
        vec![],
        AuthorityLevel::Canonical,
    );
    chunk.source_standard = standard.map(str::to_owned);
    let embedding = embed(content).await;
    ContentChunk::store_with_embedding(chunk.clone(), Some(embedding), db)
        .await
        .expect("store chunk");
    chunk
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn health_probes_do_not_require_tenant() {
    let app = build_test_app(test_config()).await;

    let response = app
        .router
        .clone()
        .oneshot(
            axum::http::Request::builder()
                .uri("/live")
                .body(axum::body::Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_tenant_header_is_rejected_with_stable_code() {
    let app = build_test_app(test_config()).await;

    let response = app
        .router
        .clone()
        .oneshot(
            axum::http::Request::builder()
                .method("POST")
                .uri("/retrieval/hybrid")
                .header("content-type", "application/json")
                .body(axum::body::Body::from(
                    json!({"query": "q", "tenant_id": "t1"}).to_string(),
                ))
                .expect("request"),
        )
        .await
        .expect("response");

    let (status, body) = read_json(response).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "TENANT_HEADER_REQUIRED");
    assert!(!body["error"]["request_id"].as_str().unwrap_or_default().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tenant_mismatch_in_payload_is_rejected() {
    let app = build_test_app(test_config()).await;

    let response = send_json(
        &app.router,
        "POST",
        "/retrieval/hybrid",
        "t1",
        json!({"query": "anything", "tenant_id": "t2"}),
    )
    .await;

    let (status, body) = read_json(response).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "TENANT_MISMATCH");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn service_secret_is_enforced_when_configured() {
    let mut config = test_config();
    config.rag_service_secret = Some("super-secret".into());
    let app = build_test_app(config).await;

    // No credentials → 401.
    let response = send_json(
        &app.router,
        "POST",
        "/retrieval/hybrid",
        "t1",
        json!({"query": "q", "tenant_id": "t1"}),
    )
    .await;
    let (status, body) = read_json(response).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");

    // Bearer credentials pass.
    let response = app
        .router
        .clone()
        .oneshot(
            axum::http::Request::builder()
                .method("POST")
                .uri("/retrieval/hybrid")
                .header("X-Tenant-ID", "t1")
                .header("Authorization", "Bearer super-secret")
                .header("content-type", "application/json")
                .body(axum::body::Body::from(
                    json!({"query": "welding", "tenant_id": "t1"}).to_string(),
                ))
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn backpressure_returns_429_when_tenant_queue_is_saturated() {
    let mut config = test_config();
    config.ingestion_max_pending = 1;
    let app = build_test_app(config).await;

    let first = upload_document(&app.router, "t1", "a.md", "# A\n\nbody", None, None).await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(
        first
            .headers()
            .get("X-Queue-Depth")
            .and_then(|v| v.to_str().ok()),
        Some("1")
    );
    assert_eq!(
        first
            .headers()
            .get("X-Queue-Max-Pending")
            .and_then(|v| v.to_str().ok()),
        Some("1")
    );

    let second = upload_document(&app.router, "t1", "b.md", "# B\n\nbody", None, None).await;
    let (status, body) = read_json(second).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"]["code"], "INGESTION_BACKPRESSURE");
    assert_eq!(body["error"]["details"]["queue_depth"], 1);

    // Another tenant is unaffected.
    let other = upload_document(&app.router, "t2", "c.md", "# C\n\nbody", None, None).await;
    assert_eq!(other.status(), StatusCode::OK);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn idempotency_key_replays_original_response() {
    let app = build_test_app(test_config()).await;

    let first = upload_document(&app.router, "t1", "a.md", "# A\n\nbody", None, Some("K")).await;
    assert!(first.headers().get("X-Idempotency-Replayed").is_none());
    let (status, first_body) = read_json(first).await;
    assert_eq!(status, StatusCode::OK);
    let document_id = first_body["document_id"].as_str().expect("doc id").to_owned();

    // Same key, different file: the original payload is replayed.
    let second = upload_document(
        &app.router,
        "t1",
        "different.md",
        "# Different\n\nbody",
        None,
        Some("K"),
    )
    .await;
    assert_eq!(
        second
            .headers()
            .get("X-Idempotency-Replayed")
            .and_then(|v| v.to_str().ok()),
        Some("true")
    );
    let (status, second_body) = read_json(second).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second_body["document_id"], document_id.as_str());

    // Only one document row exists.
    let docs = SourceDocument::list_for_tenant(&app.db, "t1", 10)
        .await
        .expect("list");
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].status, DocumentStatus::Queued);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hybrid_retrieval_respects_standard_filter_and_tenant() {
    let app = build_test_app(test_config()).await;

    let iso9001 = seed_chunk(
        &app.db,
        "t1",
        "src-9001",
        "Clause 8.5.1 requires controlled conditions for production",
        Some("ISO 9001"),
    )
    .await;
    seed_chunk(
        &app.db,
        "t1",
        "src-14001",
        "Environmental aspects shall be evaluated for significance",
        Some("ISO 14001"),
    )
    .await;
    // Sentinel row in another tenant: must never leak into t1 results.
    seed_chunk(
        &app.db,
        "t2",
        "src-foreign",
        "Clause 8.5.1 requires controlled conditions for production",
        Some("ISO 9001"),
    )
    .await;

    let response = send_json(
        &app.router,
        "POST",
        "/retrieval/hybrid",
        "t1",
        json!({
            "query": "8.5.1 controlled conditions production",
            "tenant_id": "t1",
            "filters": {"source_standard": "ISO 9001"},
            "k": 2,
        }),
    )
    .await;

    let (status, body) = read_json(response).await;
    assert_eq!(status, StatusCode::OK);

    let items = body["items"].as_array().expect("items");
    assert!(!items.is_empty());
    assert_eq!(items[0]["source"], iso9001.id.as_str());
    for item in items {
        assert_eq!(item["metadata"]["tenant_id"], "t1");
        assert_eq!(item["metadata"]["source_standard"], "ISO 9001");
    }

    assert_eq!(body["trace"]["filters_applied"]["source_standard"], "ISO 9001");
    assert!(body["trace"]["scope_penalized_count"].as_u64().is_some());
    assert_eq!(body["trace"]["score_space"], "gravity");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn multi_query_rrf_merges_in_expected_order() {
    let app = build_test_app(test_config()).await;

    // Engineered overlaps: q1 ranks [A, B]; q2 ranks [B, C].
    let chunk_a = seed_chunk(&app.db, "t1", "s1", "alpha beta", None).await;
    let chunk_b = seed_chunk(&app.db, "t1", "s2", "alpha beta gamma delta", None).await;
    let chunk_c = seed_chunk(&app.db, "t1", "s3", "gamma delta zeta eta theta", None).await;

    let response = send_json(
        &app.router,
        "POST",
        "/retrieval/multi-query",
        "t1",
        json!({
            "tenant_id": "t1",
            "queries": [
                {"id": "q1", "query": "alpha beta", "k": 2},
                {"id": "q2", "query": "gamma delta", "k": 2},
            ],
            "merge": {"strategy": "rrf", "rrf_k": 60, "top_k": 5},
        }),
    )
    .await;

    let (status, body) = read_json(response).await;
    assert_eq!(status, StatusCode::OK);

    let items = body["items"].as_array().expect("items");
    let ids: Vec<&str> = items
        .iter()
        .map(|item| item["source"].as_str().expect("source"))
        .collect();
    assert_eq!(
        ids,
        vec![chunk_b.id.as_str(), chunk_a.id.as_str(), chunk_c.id.as_str()],
        "RRF must rank the shared row first"
    );

    let subqueries = body["subqueries"].as_array().expect("subqueries");
    assert_eq!(subqueries.len(), 2);
    assert!(subqueries.iter().all(|sq| sq["status"] == "ok"));
    assert_eq!(body["trace"]["failed_count"], 0);
    assert_eq!(body["trace"]["score_space"], "rrf");
    assert_eq!(body["partial"], false);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_subqueries_are_skipped_by_fingerprint() {
    let app = build_test_app(test_config()).await;
    seed_chunk(&app.db, "t1", "s1", "alpha beta", None).await;

    let response = send_json(
        &app.router,
        "POST",
        "/retrieval/multi-query",
        "t1",
        json!({
            "tenant_id": "t1",
            "queries": [
                {"id": "q1", "query": "alpha beta"},
                {"id": "q2", "query": "Alpha   Beta"},
            ],
            "merge": {"top_k": 5},
        }),
    )
    .await;

    let (status, body) = read_json(response).await;
    assert_eq!(status, StatusCode::OK);
    let subqueries = body["subqueries"].as_array().expect("subqueries");
    let duplicate = subqueries
        .iter()
        .find(|sq| sq["error_code"] == "SUBQUERY_SKIPPED_DUPLICATE")
        .expect("duplicate entry");
    assert_eq!(duplicate["id"], "q2");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sequential_plan_exits_early_on_out_of_scope_branch() {
    let app = build_test_app(test_config()).await;

    // Only ISO 14001 content exists; the request scope wants ISO 9001.
    seed_chunk(
        &app.db,
        "t1",
        "s-env",
        "ISO 14001 waste management and environmental aspects",
        Some("ISO 14001"),
    )
    .await;

    let response = send_json(
        &app.router,
        "POST",
        "/retrieval/hybrid",
        "t1",
        json!({
            "query": "waste management controls",
            "tenant_id": "t1",
            "filters": {"source_standard": "ISO 9001"},
            "k": 5,
            "retrieval_plan": {
                "is_multihop": true,
                "execution_mode": "sequential",
                "sub_queries": [
                    {"id": 1, "query": "ISO 14001 waste management"},
                    {"id": 2, "query": "never executed branch"},
                    {"id": 3, "query": "also never executed"},
                ],
            },
        }),
    )
    .await;

    let (status, body) = read_json(response).await;
    assert_eq!(status, StatusCode::OK);

    assert_eq!(body["trace"]["planner_used"], true);
    assert_eq!(body["trace"]["planner_multihop"], true);
    let early_exit = &body["trace"]["plan_early_exit"];
    assert_eq!(early_exit["triggered"], true);
    assert_eq!(early_exit["subquery_id"], 1);
    assert!(early_exit["scope_penalized_ratio"].as_f64().expect("ratio") >= 0.8);
    // Branch cap: only the first two sub-queries were even eligible.
    assert_eq!(body["trace"]["plan_branch_policy"]["applied_subqueries"], 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn graph_hop_late_grounds_entities_to_chunks() {
    let app = build_test_app(test_config()).await;

    let chunk = seed_chunk(
        &app.db,
        "t1",
        "doc-1",
        "Documented information shall be retained as evidence of conformity",
        None,
    )
    .await;

    let query = "documented information retention evidence";
    let query_vector = embed(query).await;

    // Ea has chunk lineage; Eb does not.
    let grounded = KnowledgeEntity::upsert_by_name(
        &app.db,
        "t1",
        "Documented Information",
        "Evidence retention requirements",
        "CONCEPT",
        Some("doc-1".into()),
    )
    .await
    .expect("entity");
    KnowledgeEntity::store_embedding(&app.db, &grounded.id, "t1", query_vector.clone())
        .await
        .expect("embedding");
    NodeProvenance::link(&app.db, &grounded.id, &chunk.id, "t1")
        .await
        .expect("provenance");

    let ungrounded = KnowledgeEntity::upsert_by_name(
        &app.db,
        "t1",
        "Retention Schedule",
        "How long records are kept",
        "CONCEPT",
        None,
    )
    .await
    .expect("entity");
    KnowledgeEntity::store_embedding(&app.db, &ungrounded.id, "t1", query_vector)
        .await
        .expect("embedding");

    let response = send_json(
        &app.router,
        "POST",
        "/retrieval/hybrid",
        "t1",
        json!({"query": query, "tenant_id": "t1", "k": 10}),
    )
    .await;

    let (status, body) = read_json(response).await;
    assert_eq!(status, StatusCode::OK);
    let items = body["items"].as_array().expect("items");

    let grounded_item = items
        .iter()
        .find(|item| item["metadata"]["source_layer"] == "graph_grounded")
        .expect("graph-grounded row");
    assert_eq!(grounded_item["source"], chunk.id.as_str());
    assert!(grounded_item["content"]
        .as_str()
        .expect("content")
        .contains("Documented information shall be retained"));
    assert!(!grounded_item["content"].as_str().expect("content").contains("[anchor]"));
    assert_eq!(grounded_item["metadata"]["retrieved_via"], "graph");

    let synthetic = items
        .iter()
        .find(|item| item["metadata"]["source_type"] == "knowledge_entity_ungrounded")
        .expect("ungrounded fallback row");
    assert!(synthetic["source"].as_str().expect("source").starts_with("graph:"));
    assert!(synthetic["content"].as_str().expect("content").contains("[anchor]"));
    assert_eq!(synthetic["metadata"]["retrieved_via"], "graph");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn validate_scope_reports_violations_and_advisories() {
    let app = build_test_app(test_config()).await;

    let response = send_json(
        &app.router,
        "POST",
        "/retrieval/validate-scope",
        "t1",
        json!({
            "query": "what does 8.5.1 require",
            "tenant_id": "t1",
            "filters": {"metadata": {"tenant_id": "t2"}},
        }),
    )
    .await;

    let (status, body) = read_json(response).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["valid"], false);
    assert_eq!(body["violations"][0]["code"], "RESERVED_METADATA_KEY");
    assert_eq!(body["query_scope"]["requires_scope_clarification"], true);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn comprehensive_fusion_respects_quotas() {
    let app = build_test_app(test_config()).await;

    for index in 0..6 {
        seed_chunk(
            &app.db,
            "t1",
            &format!("s{index}"),
            &format!("audit programme requirement {index} for planning"),
            None,
        )
        .await;
    }

    let response = send_json(
        &app.router,
        "POST",
        "/retrieval/comprehensive",
        "t1",
        json!({
            "query": "audit programme planning",
            "tenant_id": "t1",
            "k": 6,
        }),
    )
    .await;

    let (status, body) = read_json(response).await;
    assert_eq!(status, StatusCode::OK);

    assert_eq!(body["trace"]["fusion"]["active"], true);
    assert_eq!(body["trace"]["fusion"]["quotas"]["chunks"], 3);
    assert_eq!(body["trace"]["fusion"]["quotas"]["graph"], 2);
    assert_eq!(body["trace"]["fusion"]["quotas"]["raptor"], 1);

    let items = body["items"].as_array().expect("items");
    assert!(!items.is_empty());
    // With no graph or raptor rows, slack fills from chunks.
    assert!(items
        .iter()
        .all(|item| item["metadata"]["fusion_source"] == "chunks"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn chat_completions_returns_grounded_answer_with_citations() {
    let app = build_test_app(test_config()).await;
    seed_chunk(
        &app.db,
        "t1",
        "s1",
        "Management review shall be conducted at planned intervals",
        None,
    )
    .await;

    let response = send_json(
        &app.router,
        "POST",
        "/chat/completions",
        "t1",
        json!({"query": "management review intervals", "tenant_id": "t1"}),
    )
    .await;

    let (status, body) = read_json(response).await;
    assert_eq!(status, StatusCode::OK);
    assert!(!body["interaction_id"].as_str().expect("id").is_empty());
    assert!(body["answer"].as_str().expect("answer").contains("Grounded answer"));
    assert!(!body["citations"].as_array().expect("citations").is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn batch_lifecycle_reaches_terminal_status() {
    let app = build_test_app(test_config()).await;

    let response = send_json(
        &app.router,
        "POST",
        "/ingestion/batches",
        "t1",
        json!({"collection_key": "manuals", "total_files": 1}),
    )
    .await;
    let (status, created) = read_json(response).await;
    assert_eq!(status, StatusCode::OK);
    let batch_id = created["batch_id"].as_str().expect("batch id").to_owned();

    // Simulate the worker finishing the only file.
    common::storage::types::ingestion_batch::IngestionBatch::record_progress(
        &app.db, &batch_id, true,
    )
    .await
    .expect("progress");

    let response = app
        .router
        .clone()
        .oneshot(
            axum::http::Request::builder()
                .uri(format!("/ingestion/batches/{batch_id}/progress"))
                .header("X-Tenant-ID", "t1")
                .body(axum::body::Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    let (status, progress) = read_json(response).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(progress["status"], "completed");
    assert_eq!(progress["percent"], 100.0);

    // Terminal status is monotonic even if a late failure report arrives.
    common::storage::types::ingestion_batch::IngestionBatch::record_progress(
        &app.db, &batch_id, false,
    )
    .await
    .expect("late progress");
    let batch = common::storage::types::ingestion_batch::IngestionBatch::get_for_tenant(
        &app.db, &batch_id, "t1",
    )
    .await
    .expect("get")
    .expect("row");
    assert_eq!(
        batch.status,
        common::storage::types::ingestion_batch::BatchStatus::Completed
    );
}
