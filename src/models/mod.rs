//! Data Model Layer
//!
//! Ontology declarations, flat-file record shapes, and query result types.

pub mod graph;
pub mod ontology;
pub mod record;
pub mod search;

pub use graph::{Direction, Neighbor, Path, PathStep, Subgraph, SubgraphEdge, TraversalNode};
pub use ontology::{
    canonical_value, derive_id, Cardinality, EdgeTypeDef, FieldDef, FieldIndex, FieldType,
    NodeTypeDef, Ontology, SchemaError, TypeRef,
};
pub use record::{FlatRecord, RecordLocation, RecordOp};
pub use search::{GraphSearchRequest, GraphSearchResult, SearchHit, SearchRequest};
