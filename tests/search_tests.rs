//! Indexing, the content-hash cache, and hybrid retrieval.

mod common;

use common::{engine, write_records, FakeEmbedding, FakeLexical};
use ontograph::services::Providers;
use ontograph::{EngineConfig, GraphEngine, SearchRequest};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tempfile::TempDir;

fn corpus() -> Vec<serde_json::Value> {
    vec![
        json!({"name": "Ada", "bio": "analytical engine programs and punched cards", "age": 36}),
        json!({"name": "Grace", "bio": "compiler design and naval service", "age": 85}),
        json!({"name": "Edsger", "bio": "structured programming and shortest paths", "age": 72}),
    ]
}

#[tokio::test]
async fn build_index_writes_one_row_per_chunk() {
    let t = engine().await;
    write_records(&t.dir, "person", &corpus());
    t.engine.load("person").await.unwrap();

    let rows = t.engine.build_index("person", None).await.unwrap();
    // Short bios fit in one chunk each
    assert_eq!(rows, 3);
}

#[tokio::test]
async fn long_text_is_chunked_into_multiple_rows() {
    let t = engine().await;
    let long_bio = "distributed systems and consensus protocols ".repeat(60);
    assert!(long_bio.len() > 2000);
    write_records(
        &t.dir,
        "person",
        &[json!({"name": "Leslie", "bio": long_bio, "age": 83})],
    );
    t.engine.load("person").await.unwrap();

    let rows = t.engine.build_index("person", None).await.unwrap();
    assert!(rows >= 2, "expected multiple chunks, got {rows}");
}

#[tokio::test]
async fn identical_content_resolves_through_one_provider_call() {
    let t = engine().await;
    write_records(
        &t.dir,
        "person",
        &[
            json!({"name": "Ada", "bio": "same exact biography", "age": 1}),
            json!({"name": "Grace", "bio": "same exact biography", "age": 2}),
        ],
    );
    t.engine.load("person").await.unwrap();

    t.engine.build_index("person", None).await.unwrap();
    assert_eq!(
        t.embedding.calls.load(Ordering::SeqCst),
        1,
        "identical chunks share one batched embed call"
    );
    assert_eq!(
        t.lexical.calls.load(Ordering::SeqCst),
        1,
        "identical chunks share one segmentation call"
    );

    // A full rebuild is served entirely from the cache
    t.engine.build_index("person", None).await.unwrap();
    assert_eq!(t.embedding.calls.load(Ordering::SeqCst), 1);
    assert_eq!(t.lexical.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn lexical_search_matches_whole_tokens() {
    let t = engine().await;
    write_records(&t.dir, "person", &corpus());
    t.engine.load("person").await.unwrap();
    t.engine.build_index("person", None).await.unwrap();

    let hits = t
        .engine
        .search_lexical("compiler", Some("person"), 10)
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert!(hits[0].content.contains("compiler design"));
    assert_eq!(hits[0].source_table, "person");
    assert_eq!(hits[0].chunk_seq, 0);
}

#[tokio::test]
async fn hybrid_search_returns_ranked_hits() {
    let t = engine().await;
    write_records(&t.dir, "person", &corpus());
    t.engine.load("person").await.unwrap();
    t.engine.build_index("person", None).await.unwrap();

    let request = SearchRequest::new("compiler design").with_node_type("person");
    let hits = t.engine.search(&request).await.unwrap();
    assert!(!hits.is_empty());
    assert!(
        hits[0].content.contains("compiler design"),
        "top hit should be the lexically and semantically closest chunk: {hits:?}"
    );
    for pair in hits.windows(2) {
        assert!(pair[0].score >= pair[1].score, "hits must be score-ordered");
    }
}

#[tokio::test]
async fn alpha_zero_matches_pure_lexical_order() {
    let t = engine().await;
    write_records(&t.dir, "person", &corpus());
    t.engine.load("person").await.unwrap();
    t.engine.build_index("person", None).await.unwrap();

    let fused = t
        .engine
        .search(
            &SearchRequest::new("punched cards")
                .with_node_type("person")
                .with_alpha(0.0),
        )
        .await
        .unwrap();
    let lexical = t
        .engine
        .search_lexical("punched cards", Some("person"), 10)
        .await
        .unwrap();
    let fused_ids: Vec<i64> = fused.iter().map(|h| h.source_id).collect();
    let lexical_ids: Vec<i64> = lexical.iter().map(|h| h.source_id).collect();
    assert_eq!(fused_ids[0], lexical_ids[0]);
}

#[tokio::test]
async fn vector_search_finds_semantically_close_chunk() {
    let t = engine().await;
    write_records(&t.dir, "person", &corpus());
    t.engine.load("person").await.unwrap();
    t.engine.build_index("person", None).await.unwrap();

    // Query the exact stored text: cosine similarity 1.0 must win
    let hits = t
        .engine
        .search_vector(
            "compiler design and naval service",
            None,
            Some("person"),
            10,
        )
        .await
        .unwrap();
    assert!(!hits.is_empty());
    assert!(hits[0].content.contains("compiler design"));
}

#[tokio::test]
async fn search_without_any_signal_returns_empty() {
    let (engine, dir) = common::engine_without_providers().await;
    write_records(&dir, "person", &corpus());
    engine.load("person").await.unwrap();
    engine.build_index("person", None).await.unwrap();

    // No providers: index rows carry neither lexical form nor vector
    let hits = engine
        .search(&SearchRequest::new("compiler"))
        .await
        .unwrap();
    assert!(hits.is_empty());
}

#[tokio::test]
async fn explicit_vector_search_without_signal_is_an_error() {
    let (engine, _dir) = common::engine_without_providers().await;
    let err = engine
        .search_vector("compiler", None, Some("person"), 10)
        .await
        .unwrap_err();
    assert!(matches!(err, ontograph::EngineError::Provider { .. }));
}

#[tokio::test]
async fn fused_search_degrades_to_lexical_without_embeddings() {
    let dir = TempDir::new().unwrap();
    let lexical = Arc::new(FakeLexical::default());
    let engine = GraphEngine::open(
        EngineConfig::rooted_at(dir.path()),
        common::sample_ontology(),
        Providers::new(Some(lexical), None),
    )
    .await
    .unwrap();

    write_records(&dir, "person", &corpus());
    engine.load("person").await.unwrap();
    engine.build_index("person", None).await.unwrap();

    // Pure-vector alpha still returns the lexical hits when no vector
    // signal exists
    let hits = engine
        .search(&SearchRequest::new("compiler").with_alpha(1.0))
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert!(hits[0].content.contains("compiler design"));
}

#[tokio::test]
async fn cache_snapshot_survives_into_a_fresh_engine() {
    let t = engine().await;
    write_records(&t.dir, "person", &corpus());
    t.engine.load("person").await.unwrap();
    t.engine.build_index("person", None).await.unwrap();
    let exported = t.engine.export_cache().await.unwrap();
    assert_eq!(exported, 3);

    // Fresh root, cold database, warm snapshot
    let dir2 = TempDir::new().unwrap();
    std::fs::create_dir_all(dir2.path().join("records")).unwrap();
    std::fs::copy(
        t.dir.path().join("records").join("resolve_cache.jsonl"),
        dir2.path().join("records").join("resolve_cache.jsonl"),
    )
    .unwrap();

    let embedding = Arc::new(FakeEmbedding::default());
    let lexical = Arc::new(FakeLexical::default());
    let engine2 = GraphEngine::open(
        EngineConfig::rooted_at(dir2.path()),
        common::sample_ontology(),
        Providers::new(Some(lexical.clone()), Some(embedding.clone())),
    )
    .await
    .unwrap();
    write_records_into(dir2.path(), "person", &corpus());
    engine2.load("person").await.unwrap();
    engine2.build_index("person", None).await.unwrap();

    assert_eq!(
        embedding.calls.load(Ordering::SeqCst),
        0,
        "warm cache must prevent provider calls"
    );
    assert_eq!(lexical.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn evict_cache_only_costs_recomputation() {
    let t = engine().await;
    write_records(&t.dir, "person", &corpus());
    t.engine.load("person").await.unwrap();
    t.engine.build_index("person", None).await.unwrap();
    let calls_before = t.embedding.calls.load(Ordering::SeqCst);

    // Everything was touched seconds ago, well inside the max age
    let evicted = t.engine.evict_cache().await.unwrap();
    assert_eq!(evicted, 0, "entries within max age must survive");

    t.engine.build_index("person", None).await.unwrap();
    assert_eq!(
        t.embedding.calls.load(Ordering::SeqCst),
        calls_before,
        "surviving cache entries keep serving rebuilds"
    );
}

fn write_records_into(root: &std::path::Path, type_name: &str, records: &[serde_json::Value]) {
    let type_dir = root.join("records").join(type_name);
    std::fs::create_dir_all(&type_dir).unwrap();
    let mut content = String::new();
    for record in records {
        content.push_str(&serde_json::to_string(record).unwrap());
        content.push('\n');
    }
    std::fs::write(type_dir.join("records.jsonl"), content).unwrap();
}
