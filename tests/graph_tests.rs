//! Traversal: neighbors, bounded expansion, path enumeration, subgraph
//! extraction, and retrieval-seeded search.

mod common;

use common::{engine, write_records, TestEngine};
use ontograph::models::ontology::derive_id;
use ontograph::{Direction, EngineError, GraphSearchRequest};
use serde_json::json;

fn person_id(name: &str) -> i64 {
    derive_id("person", &[name.to_string()])
}

fn company_id(name: &str) -> i64 {
    derive_id("company", &[name.to_string()])
}

/// Ada knows Grace, Grace knows Edsger, Edsger knows Ada (a cycle);
/// Ada and Grace both work at Initech.
async fn populated() -> TestEngine {
    let t = engine().await;
    write_records(
        &t.dir,
        "person",
        &[
            json!({"name": "Ada", "bio": "analytical engine programs", "age": 36}),
            json!({"name": "Grace", "bio": "compiler design", "age": 85}),
            json!({"name": "Edsger", "bio": "structured programming", "age": 72}),
        ],
    );
    write_records(
        &t.dir,
        "company",
        &[json!({"name": "Initech", "about": "tps report solutions"})],
    );
    write_records(
        &t.dir,
        "knows",
        &[
            json!({"from": {"name": "Ada"}, "to": {"name": "Grace"}}),
            json!({"from": {"name": "Grace"}, "to": {"name": "Edsger"}}),
            json!({"from": {"name": "Edsger"}, "to": {"name": "Ada"}}),
        ],
    );
    write_records(
        &t.dir,
        "works_at",
        &[
            json!({"from": {"name": "Ada"}, "to": {"name": "Initech"}, "role": "engineer"}),
            json!({"from": {"name": "Grace"}, "to": {"name": "Initech"}, "role": "admiral"}),
        ],
    );
    t.engine.load("person").await.unwrap();
    t.engine.load("company").await.unwrap();
    t.engine.load("knows").await.unwrap();
    t.engine.load("works_at").await.unwrap();
    t
}

#[tokio::test]
async fn neighbors_follow_direction() {
    let t = populated().await;
    let ada = person_id("Ada");

    let out = t
        .engine
        .neighbors("person", ada, None, Direction::Out, 10)
        .await
        .unwrap();
    let out_ids: Vec<i64> = out.iter().map(|n| n.id).collect();
    assert!(out_ids.contains(&person_id("Grace")), "knows edge out");
    assert!(out_ids.contains(&company_id("Initech")), "works_at edge out");
    assert!(!out_ids.contains(&person_id("Edsger")), "in-edge must not appear");

    let incoming = t
        .engine
        .neighbors("person", ada, None, Direction::In, 10)
        .await
        .unwrap();
    assert_eq!(incoming.len(), 1);
    assert_eq!(incoming[0].id, person_id("Edsger"));
    assert_eq!(incoming[0].direction, Direction::In);
    assert_eq!(incoming[0].edge_type, "knows");

    // Neighbor rows carry the full record
    assert_eq!(incoming[0].record["name"], json!("Edsger"));
    assert_eq!(incoming[0].record["age"], json!(72));
}

#[tokio::test]
async fn neighbors_edge_type_filter_applies() {
    let t = populated().await;
    let ada = person_id("Ada");
    let filter = vec!["works_at".to_string()];
    let out = t
        .engine
        .neighbors("person", ada, Some(filter.as_slice()), Direction::Out, 10)
        .await
        .unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].id, company_id("Initech"));
}

#[tokio::test]
async fn mutual_edges_collapse_to_one_neighbor_marked_both() {
    let t = engine().await;
    write_records(
        &t.dir,
        "person",
        &[
            json!({"name": "Ada", "bio": "a", "age": 1}),
            json!({"name": "Grace", "bio": "b", "age": 2}),
        ],
    );
    write_records(
        &t.dir,
        "knows",
        &[
            json!({"from": {"name": "Ada"}, "to": {"name": "Grace"}}),
            json!({"from": {"name": "Grace"}, "to": {"name": "Ada"}}),
        ],
    );
    t.engine.load("person").await.unwrap();
    t.engine.load("knows").await.unwrap();

    let neighbors = t
        .engine
        .neighbors("person", person_id("Ada"), None, Direction::Both, 10)
        .await
        .unwrap();
    assert_eq!(neighbors.len(), 1, "pair must not be double-counted");
    assert_eq!(neighbors[0].direction, Direction::Both);
}

#[tokio::test]
async fn traverse_is_cycle_safe_and_depth_bounded() {
    let t = populated().await;
    let ada = person_id("Ada");

    // The knows-cycle would loop forever without visited tracking
    let knows = vec!["knows".to_string()];
    let reached = t
        .engine
        .traverse("person", ada, Some(knows.as_slice()), Direction::Out, 50, 100)
        .await
        .unwrap();
    assert_eq!(reached.len(), 2, "cycle must terminate: {reached:?}");
    let grace = reached.iter().find(|n| n.id == person_id("Grace")).unwrap();
    assert_eq!(grace.depth, 1);
    let edsger = reached.iter().find(|n| n.id == person_id("Edsger")).unwrap();
    assert_eq!(edsger.depth, 2);

    let shallow = t
        .engine
        .traverse("person", ada, Some(knows.as_slice()), Direction::Out, 1, 100)
        .await
        .unwrap();
    assert_eq!(shallow.len(), 1);
    assert_eq!(shallow[0].id, person_id("Grace"));
}

#[tokio::test]
async fn find_paths_enumerates_shortest_first() {
    let t = populated().await;
    let knows = vec!["knows".to_string()];
    let paths = t
        .engine
        .find_paths(
            ("person", person_id("Ada")),
            ("person", person_id("Edsger")),
            Some(knows.as_slice()),
            5,
            10,
        )
        .await
        .unwrap();
    assert!(!paths.is_empty());
    // Direct in-edge Edsger->Ada makes a one-step path; Ada->Grace->Edsger
    // is the two-step alternative
    assert_eq!(paths[0].len(), 1);
    assert!(paths.iter().any(|p| p.len() == 2));
    for pair in paths.windows(2) {
        assert!(pair[0].len() <= pair[1].len(), "paths must come shortest first");
    }
    let two_step = paths.iter().find(|p| p.len() == 2).unwrap();
    assert_eq!(two_step.steps[0].id, person_id("Grace"));
    assert_eq!(two_step.steps[1].id, person_id("Edsger"));
}

#[tokio::test]
async fn find_paths_unreachable_is_empty_not_an_error() {
    let t = engine().await;
    write_records(
        &t.dir,
        "person",
        &[
            json!({"name": "Ada", "bio": "a", "age": 1}),
            json!({"name": "Grace", "bio": "b", "age": 2}),
        ],
    );
    t.engine.load("person").await.unwrap();

    let paths = t
        .engine
        .find_paths(
            ("person", person_id("Ada")),
            ("person", person_id("Grace")),
            None,
            5,
            10,
        )
        .await
        .unwrap();
    assert!(paths.is_empty());
}

#[tokio::test]
async fn extract_subgraph_includes_edges_among_reached_nodes() {
    let t = populated().await;
    let subgraph = t
        .engine
        .extract_subgraph("person", person_id("Ada"), None, 2, 100, 100)
        .await
        .unwrap();
    assert!(!subgraph.truncated);
    // Everyone is within two hops of Ada
    assert_eq!(subgraph.nodes.len(), 3);
    // All five edges connect nodes inside the reached set
    assert_eq!(subgraph.edges.len(), 5);
    assert!(subgraph.edges.iter().any(|e| e.edge_type == "works_at"
        && e.from_id == person_id("Grace")
        && e.to_id == company_id("Initech")));
}

#[tokio::test]
async fn extract_subgraph_reports_truncation() {
    let t = populated().await;
    let subgraph = t
        .engine
        .extract_subgraph("person", person_id("Ada"), None, 2, 1, 100)
        .await
        .unwrap();
    assert!(subgraph.truncated);
    assert_eq!(subgraph.nodes.len(), 1);
}

#[tokio::test]
async fn missing_anchor_is_not_found_never_empty() {
    let t = populated().await;
    let missing = 424242;

    let err = t
        .engine
        .neighbors("person", missing, None, Direction::Both, 10)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NodeNotFound { id, .. } if id == missing));

    let err = t
        .engine
        .traverse("person", missing, None, Direction::Both, 2, 10)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NodeNotFound { .. }));

    let err = t
        .engine
        .find_paths(("person", person_id("Ada")), ("person", missing), None, 2, 10)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NodeNotFound { .. }));

    let err = t
        .engine
        .extract_subgraph("person", missing, None, 2, 10, 10)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NodeNotFound { .. }));
}

#[tokio::test]
async fn graph_search_pairs_seeds_with_context() {
    let t = populated().await;
    t.engine.build_index("person", None).await.unwrap();

    let results = t
        .engine
        .graph_search(&GraphSearchRequest::new("compiler design"))
        .await
        .unwrap();
    assert!(!results.is_empty());

    let seed = &results[0];
    assert_eq!(seed.node_type, "person");
    assert_eq!(seed.id, person_id("Grace"));
    assert!(seed.score > 0.0);
    assert!(!seed.matches.is_empty());
    assert_eq!(seed.record["name"], json!("Grace"));

    // One hop of context around Grace: Ada, Edsger, and Initech
    let context_ids: Vec<i64> = seed.context.iter().map(|n| n.id).collect();
    assert!(context_ids.contains(&person_id("Ada")));
    assert!(context_ids.contains(&person_id("Edsger")));
    assert!(context_ids.contains(&company_id("Initech")));
}
