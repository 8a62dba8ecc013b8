//! Service Layer
//!
//! The engine's operational components: flat-file synchronization, index
//! and cache maintenance, hybrid retrieval, and graph traversal. Each
//! service owns no connection of its own; all table access goes through
//! [`crate::db::DatabaseService`].

pub mod error;
pub mod graph_service;
pub mod index_service;
pub mod providers;
pub mod search_service;
pub mod sync_service;

pub use error::EngineError;
pub use graph_service::{GraphService, MAX_TRAVERSAL_DEPTH};
pub use index_service::{chunk, content_hash, IndexService, ResolvedChunk};
pub use providers::{EmbeddingProvider, LexicalProvider, ProviderError, Providers};
pub use search_service::SearchService;
pub use sync_service::{
    DumpReport, LedgerEntry, LoadReport, SyncReport, SyncService,
};
