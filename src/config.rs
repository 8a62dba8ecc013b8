//! Engine Configuration
//!
//! Plain in-memory tunables. The embedding application owns configuration
//! parsing (YAML/JSON or otherwise) and hands this struct over fully formed;
//! this crate never reads configuration files itself.

use std::path::PathBuf;
use std::time::Duration;

/// Tunables for one engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Database file. On-disk only: the multi-reader concurrency model
    /// depends on WAL, which an in-memory database cannot provide.
    pub db_path: PathBuf,

    /// Root of the flat-file directories (one subdirectory per type).
    pub data_dir: PathBuf,

    /// Maximum chunk length in characters for indexed text fields.
    pub chunk_max_len: usize,

    /// Rank-fusion smoothing constant `k`. Small values keep top ranks
    /// clearly separated; large values flatten scores and should be avoided.
    pub fusion_k: f64,

    /// Each ranking is prefetched to `limit * prefetch_multiplier`
    /// candidates before fusion.
    pub prefetch_multiplier: usize,

    /// Cache entries idle longer than this are eligible for eviction.
    pub cache_max_age: chrono::Duration,

    /// Bounded retries for embedding provider calls.
    pub provider_max_retries: u32,

    /// Base backoff between provider retries (doubled per attempt).
    pub provider_retry_backoff: Duration,
}

impl EngineConfig {
    /// Configuration rooted at a directory: database file and flat-file tree
    /// live side by side under it.
    pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            db_path: root.join("graph.db"),
            data_dir: root.join("records"),
            ..Self::default()
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/graph.db"),
            data_dir: PathBuf::from("./data/records"),
            chunk_max_len: 1000,
            fusion_k: 10.0,
            prefetch_multiplier: 4,
            cache_max_age: chrono::Duration::days(30),
            provider_max_retries: 3,
            provider_retry_backoff: Duration::from_millis(250),
        }
    }
}
