//! Embeddable Knowledge-Graph Engine
//!
//! This crate provides typed graph storage over an embedded libsql database,
//! flat-file synchronization, hybrid lexical/vector retrieval, and bounded
//! graph traversal for applications that own their own data directory.
//!
//! # Architecture
//!
//! - **Flat files are the truth**: one JSONL directory per declared type;
//!   tables and the search index are rebuildable caches of those files
//! - **Deterministic identity**: record ids are hashed from identity-field
//!   values, never assigned by the database, so re-imports reproduce
//!   identical ids and exports stay diff-minimal
//! - **libsql/Turso**: embedded SQLite-compatible database in WAL mode,
//!   arbitrated by a fair multi-reader/single-writer controller
//! - **Provider seams**: lexical segmentation and embeddings are consumed
//!   through async traits; the engine works degraded without them
//!
//! # Modules
//!
//! - [`models`] - Ontology declarations, flat records, query result shapes
//! - [`db`] - Connection ownership, concurrency control, schema compiler
//! - [`services`] - Sync, index/cache, retrieval, and traversal engines
//! - [`engine`] - The [`GraphEngine`] facade embedders construct
//! - [`config`] - In-memory tunables supplied by the embedding application

pub mod config;
pub mod db;
pub mod engine;
pub mod models;
pub mod services;

// Re-export commonly used types
pub use config::EngineConfig;
pub use engine::GraphEngine;
pub use models::graph::{Direction, Neighbor, Path, PathStep, Subgraph, SubgraphEdge, TraversalNode};
pub use models::ontology::{
    Cardinality, EdgeTypeDef, FieldDef, FieldIndex, FieldType, NodeTypeDef, Ontology, SchemaError,
};
pub use models::record::{FlatRecord, RecordLocation, RecordOp};
pub use models::search::{GraphSearchRequest, GraphSearchResult, SearchHit, SearchRequest};
pub use services::{
    DumpReport, EmbeddingProvider, EngineError, LedgerEntry, LexicalProvider, LoadReport,
    ProviderError, Providers, SyncReport,
};
