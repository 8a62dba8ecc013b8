//! Database Layer
//!
//! Connection ownership, concurrency control, and the ontology-to-schema
//! compiler. All table access anywhere in the crate goes through
//! [`DatabaseService`].

pub mod convert;
pub mod database;
pub mod error;
pub mod schema;

pub use database::DatabaseService;
pub use error::DatabaseError;
pub use schema::{RESOLVE_CACHE_TABLE, SEARCH_INDEX_TABLE, SYNC_LEDGER_TABLE};
