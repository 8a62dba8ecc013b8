//! Search Request / Result Types

use serde::{Deserialize, Serialize};

/// Hybrid search request.
///
/// `alpha` blends the two rankings: 1.0 is pure vector similarity, 0.0 is
/// pure lexical match. When `query_vector` is absent the engine embeds
/// `query_text` through the configured provider; when no vector signal is
/// obtainable at all, search degrades to the lexical path alone (and vice
/// versa) instead of failing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_vector: Option<Vec<f32>>,
    /// Restrict hits to one node type's backing table
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_type: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default = "default_alpha")]
    pub alpha: f64,
}

fn default_limit() -> usize {
    10
}

fn default_alpha() -> f64 {
    0.5
}

impl SearchRequest {
    pub fn new(query_text: impl Into<String>) -> Self {
        Self {
            query_text: query_text.into(),
            query_vector: None,
            node_type: None,
            limit: default_limit(),
            alpha: default_alpha(),
        }
    }

    pub fn with_node_type(mut self, node_type: impl Into<String>) -> Self {
        self.node_type = Some(node_type.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn with_vector(mut self, vector: Vec<f32>) -> Self {
        self.query_vector = Some(vector);
        self
    }
}

/// One chunk-level search hit.
///
/// `(source_table, source_id, source_field, chunk_seq)` is the composite
/// identity of the index entry and resolves back to the originating row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub source_table: String,
    pub source_id: i64,
    pub source_field: String,
    pub chunk_seq: i64,
    /// Raw chunk text
    pub content: String,
    /// Fused (or single-signal) ranking score, higher is better
    pub score: f64,
}

/// Retrieval-seeded expansion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSearchRequest {
    pub query_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_vector: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_type: Option<String>,
    /// How many distinct seed records to expand
    #[serde(default = "default_limit")]
    pub search_limit: usize,
    /// Hops of local context gathered around each seed
    #[serde(default = "default_traverse_depth")]
    pub traverse_depth: usize,
    /// Cap on context nodes per seed
    #[serde(default = "default_neighbor_limit")]
    pub neighbor_limit: usize,
    #[serde(default = "default_alpha")]
    pub alpha: f64,
}

fn default_traverse_depth() -> usize {
    1
}

fn default_neighbor_limit() -> usize {
    10
}

impl GraphSearchRequest {
    pub fn new(query_text: impl Into<String>) -> Self {
        Self {
            query_text: query_text.into(),
            query_vector: None,
            node_type: None,
            search_limit: default_limit(),
            traverse_depth: default_traverse_depth(),
            neighbor_limit: default_neighbor_limit(),
            alpha: default_alpha(),
        }
    }
}

/// One seed record with its local graph context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSearchResult {
    pub node_type: String,
    pub id: i64,
    /// Best fused score among the seed's matching chunks
    pub score: f64,
    /// Full row of the seed node
    pub record: serde_json::Value,
    /// Chunks of this record that matched the query
    pub matches: Vec<SearchHit>,
    /// Local context reached from the seed
    pub context: Vec<crate::models::graph::TraversalNode>,
}
