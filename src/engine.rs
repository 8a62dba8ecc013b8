//! Engine Facade
//!
//! [`GraphEngine`] wires the services together over one database handle and
//! one validated ontology, and is the only type most embedders need. Share
//! it behind an `Arc`; multiple engine instances in one process are fine as
//! long as they point at different directories.

use crate::config::EngineConfig;
use crate::db::{schema, DatabaseService};
use crate::models::graph::{Direction, Neighbor, Path, Subgraph, TraversalNode};
use crate::models::ontology::Ontology;
use crate::models::search::{GraphSearchRequest, GraphSearchResult, SearchHit, SearchRequest};
use crate::services::{
    DumpReport, EngineError, GraphService, IndexService, LedgerEntry, LoadReport, Providers,
    SearchService, SyncReport, SyncService,
};
use serde_json::{Map, Value};
use std::path::Path as FsPath;
use std::sync::Arc;

/// File name of the durable cache snapshot inside the data directory.
const CACHE_SNAPSHOT_FILE: &str = "resolve_cache.jsonl";

/// An embeddable knowledge-graph engine instance.
pub struct GraphEngine {
    config: EngineConfig,
    ontology: Arc<Ontology>,
    sync: SyncService,
    index: IndexService,
    search: SearchService,
    graph: GraphService,
}

impl GraphEngine {
    /// Open (or create) an engine over the configured directory.
    ///
    /// Validates the ontology, applies the compiled schema, and warms the
    /// resolve cache from the snapshot file if one exists. Schema errors are
    /// fatal here; nothing else about startup is.
    pub async fn open(
        config: EngineConfig,
        ontology: Ontology,
        providers: Providers,
    ) -> Result<Self, EngineError> {
        ontology.validate()?;
        let ontology = Arc::new(ontology);

        let db = DatabaseService::new(config.db_path.clone()).await?;
        schema::apply(&db, &ontology).await?;

        let engine = Self {
            sync: SyncService::new(db.clone(), ontology.clone(), &config),
            index: IndexService::new(db.clone(), ontology.clone(), providers.clone(), &config),
            search: SearchService::new(db.clone(), ontology.clone(), providers, &config),
            graph: GraphService::new(db, ontology.clone()),
            ontology,
            config,
        };

        let snapshot = engine.cache_snapshot_path();
        match engine.index.import_cache(&snapshot).await {
            Ok(warmed) if warmed > 0 => {
                tracing::info!(entries = warmed, "Resolve cache warmed from snapshot");
            }
            Ok(_) => {}
            Err(err) => {
                // An unreadable snapshot only costs a cold cache
                tracing::warn!("Could not warm resolve cache: {}", err);
            }
        }
        Ok(engine)
    }

    pub fn ontology(&self) -> &Ontology {
        &self.ontology
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn cache_snapshot_path(&self) -> std::path::PathBuf {
        self.config.data_dir.join(CACHE_SNAPSHOT_FILE)
    }

    // ------------------------------------------------------------------
    // Synchronization
    // ------------------------------------------------------------------

    /// Merge the flat files of a type into its backing table.
    pub async fn load(&self, type_name: &str) -> Result<LoadReport, EngineError> {
        self.sync.load(type_name).await
    }

    /// Export a backing table to its flat directory.
    pub async fn dump(&self, type_name: &str) -> Result<DumpReport, EngineError> {
        self.sync.dump(type_name).await
    }

    /// Load, reindex incrementally, and re-export as one logical unit.
    pub async fn sync(&self, type_name: &str) -> Result<SyncReport, EngineError> {
        self.sync.sync(type_name, &self.index).await
    }

    /// Delete one record by identity, cascading to edges and index rows.
    pub async fn delete(
        &self,
        type_name: &str,
        identity: &Map<String, Value>,
    ) -> Result<bool, EngineError> {
        self.sync.delete(type_name, identity).await
    }

    /// Sync-ledger entry for a type.
    pub async fn status(&self, type_name: &str) -> Result<Option<LedgerEntry>, EngineError> {
        self.sync.status(type_name).await
    }

    // ------------------------------------------------------------------
    // Index & cache
    // ------------------------------------------------------------------

    /// Rebuild index rows for a type, optionally limited to given records.
    pub async fn build_index(
        &self,
        type_name: &str,
        record_ids: Option<Vec<i64>>,
    ) -> Result<usize, EngineError> {
        self.index.build_index(type_name, record_ids).await
    }

    /// Drop cache entries idle longer than the configured max age.
    pub async fn evict_cache(&self) -> Result<usize, EngineError> {
        self.index.evict_cache(self.config.cache_max_age).await
    }

    /// Write the resolve cache to its snapshot file in the data directory.
    pub async fn export_cache(&self) -> Result<usize, EngineError> {
        self.index.export_cache(&self.cache_snapshot_path()).await
    }

    /// Load a cache snapshot from an explicit path.
    pub async fn import_cache(&self, path: &FsPath) -> Result<usize, EngineError> {
        self.index.import_cache(path).await
    }

    // ------------------------------------------------------------------
    // Retrieval
    // ------------------------------------------------------------------

    /// Fused hybrid search over the index.
    pub async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchHit>, EngineError> {
        self.search.search(request).await
    }

    /// Lexical-only ranking.
    pub async fn search_lexical(
        &self,
        query_text: &str,
        node_type: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SearchHit>, EngineError> {
        self.search.search_lexical(query_text, node_type, limit).await
    }

    /// Vector-only ranking; fails when no query vector is obtainable.
    pub async fn search_vector(
        &self,
        query_text: &str,
        query_vector: Option<&[f32]>,
        node_type: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SearchHit>, EngineError> {
        self.search
            .search_vector(query_text, query_vector, node_type, limit)
            .await
    }

    // ------------------------------------------------------------------
    // Graph traversal
    // ------------------------------------------------------------------

    /// One-hop neighbors of a node.
    pub async fn neighbors(
        &self,
        node_type: &str,
        id: i64,
        edge_types: Option<&[String]>,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<Neighbor>, EngineError> {
        self.graph
            .neighbors(node_type, id, edge_types, direction, limit)
            .await
    }

    /// Bounded breadth-first expansion from a node.
    pub async fn traverse(
        &self,
        node_type: &str,
        id: i64,
        edge_types: Option<&[String]>,
        direction: Direction,
        max_depth: usize,
        limit: usize,
    ) -> Result<Vec<TraversalNode>, EngineError> {
        self.graph
            .traverse(node_type, id, edge_types, direction, max_depth, limit)
            .await
    }

    /// Paths between two nodes, shortest first.
    pub async fn find_paths(
        &self,
        from: (&str, i64),
        to: (&str, i64),
        edge_types: Option<&[String]>,
        max_depth: usize,
        limit: usize,
    ) -> Result<Vec<Path>, EngineError> {
        self.graph
            .find_paths(from, to, edge_types, max_depth, limit)
            .await
    }

    /// Local subgraph around a node.
    pub async fn extract_subgraph(
        &self,
        node_type: &str,
        id: i64,
        edge_types: Option<&[String]>,
        max_depth: usize,
        node_limit: usize,
        edge_limit: usize,
    ) -> Result<Subgraph, EngineError> {
        self.graph
            .extract_subgraph(node_type, id, edge_types, max_depth, node_limit, edge_limit)
            .await
    }

    /// Retrieval-seeded expansion: search hits paired with graph context.
    pub async fn graph_search(
        &self,
        request: &GraphSearchRequest,
    ) -> Result<Vec<GraphSearchResult>, EngineError> {
        self.graph.graph_search(request, &self.search).await
    }
}
