//! Shared fixtures: a small ontology, counting provider fakes, and an
//! engine builder over a temp directory.

// Each test binary uses a different subset of these helpers
#![allow(dead_code)]

use async_trait::async_trait;
use ontograph::services::{EmbeddingProvider, LexicalProvider, ProviderError, Providers};
use ontograph::{
    Cardinality, EdgeTypeDef, EngineConfig, FieldDef, FieldType, GraphEngine, NodeTypeDef,
    Ontology,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

/// Lowercases and strips punctuation; counts invocations.
#[derive(Default)]
pub struct FakeLexical {
    pub calls: AtomicUsize,
}

#[async_trait]
impl LexicalProvider for FakeLexical {
    async fn segment(&self, text: &str) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let tokens: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_lowercase())
            .collect();
        Ok(tokens.join(" "))
    }
}

/// Deterministic toy embedding (letter histogram); counts invocations.
#[derive(Default)]
pub struct FakeEmbedding {
    pub calls: AtomicUsize,
}

impl FakeEmbedding {
    pub fn embed_one(text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; 26];
        for c in text.chars().filter(|c| c.is_ascii_alphabetic()) {
            v[(c.to_ascii_lowercase() as u8 - b'a') as usize] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

#[async_trait]
impl EmbeddingProvider for FakeEmbedding {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| Self::embed_one(t)).collect())
    }
}

/// People and companies with indexed text, one edge type each way.
pub fn sample_ontology() -> Ontology {
    Ontology {
        node_types: vec![
            NodeTypeDef {
                name: "person".to_string(),
                table: None,
                id_fields: vec!["name".to_string()],
                fields: vec![
                    FieldDef::new("name", FieldType::Text),
                    FieldDef::new("bio", FieldType::Text).with_index(true, true),
                    FieldDef::new("age", FieldType::Integer),
                ],
            },
            NodeTypeDef {
                name: "company".to_string(),
                table: None,
                id_fields: vec!["name".to_string()],
                fields: vec![
                    FieldDef::new("name", FieldType::Text),
                    FieldDef::new("about", FieldType::Text).with_index(true, false),
                ],
            },
        ],
        edge_types: vec![
            EdgeTypeDef {
                name: "works_at".to_string(),
                table: None,
                from: "person".to_string(),
                to: "company".to_string(),
                cardinality: Cardinality::ManyToMany,
                id_fields: vec![],
                fields: vec![FieldDef::new("role", FieldType::Text)],
                index_from: true,
                index_to: true,
            },
            EdgeTypeDef {
                name: "knows".to_string(),
                table: None,
                from: "person".to_string(),
                to: "person".to_string(),
                cardinality: Cardinality::ManyToMany,
                id_fields: vec![],
                fields: vec![],
                index_from: true,
                index_to: true,
            },
        ],
    }
}

pub struct TestEngine {
    pub engine: GraphEngine,
    pub lexical: Arc<FakeLexical>,
    pub embedding: Arc<FakeEmbedding>,
    pub dir: TempDir,
}

/// Route engine logs through the test harness when RUST_LOG asks for them.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Engine with both fake providers over a fresh temp directory.
pub async fn engine() -> TestEngine {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let lexical = Arc::new(FakeLexical::default());
    let embedding = Arc::new(FakeEmbedding::default());
    let providers = Providers::new(Some(lexical.clone()), Some(embedding.clone()));
    let engine = GraphEngine::open(
        EngineConfig::rooted_at(dir.path()),
        sample_ontology(),
        providers,
    )
    .await
    .unwrap();
    TestEngine {
        engine,
        lexical,
        embedding,
        dir,
    }
}

/// Engine without any provider (lexical fallback / degraded paths).
pub async fn engine_without_providers() -> (GraphEngine, TempDir) {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let engine = GraphEngine::open(
        EngineConfig::rooted_at(dir.path()),
        sample_ontology(),
        Providers::default(),
    )
    .await
    .unwrap();
    (engine, dir)
}

/// Write one flat file for a type, one JSON value per line.
pub fn write_records(dir: &TempDir, type_name: &str, records: &[serde_json::Value]) {
    let type_dir = dir.path().join("records").join(type_name);
    std::fs::create_dir_all(&type_dir).unwrap();
    let mut content = String::new();
    for record in records {
        content.push_str(&serde_json::to_string(record).unwrap());
        content.push('\n');
    }
    std::fs::write(type_dir.join("records.jsonl"), content).unwrap();
}

/// Read back the exported flat file of a type.
pub fn read_export(dir: &TempDir, type_name: &str) -> String {
    std::fs::read_to_string(
        dir.path()
            .join("records")
            .join(type_name)
            .join("records.jsonl"),
    )
    .unwrap()
}
