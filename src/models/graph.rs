//! Graph Query Result Types
//!
//! Shared result shapes for the traversal operations. Every hit references
//! nodes by `(node_type, id)`; the full row is included as a JSON object so
//! the tool layer can render results without a second round trip.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Direction of edge following relative to the anchor node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Follow edges where the anchor is `from_id`
    Out,
    /// Follow edges where the anchor is `to_id`
    In,
    /// Union of both, deduplicated per neighbor
    Both,
}

impl Direction {
    pub fn wants_out(&self) -> bool {
        matches!(self, Direction::Out | Direction::Both)
    }

    pub fn wants_in(&self) -> bool {
        matches!(self, Direction::In | Direction::Both)
    }
}

/// One-hop neighbor hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Neighbor {
    pub node_type: String,
    pub id: i64,
    /// Edge type that connects the anchor to this neighbor
    pub edge_type: String,
    /// `Both` when an edge exists in each direction between the same pair
    pub direction: Direction,
    /// Full row of the neighbor node
    pub record: Value,
}

/// Node reached by a bounded-depth walk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraversalNode {
    pub node_type: String,
    pub id: i64,
    /// Hop count from the anchor (anchor itself is not included)
    pub depth: usize,
    /// Edge type of the hop that first reached this node
    pub edge_type: String,
    pub record: Value,
}

/// One step of a path: the edge taken and the node it lands on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathStep {
    pub edge_type: String,
    pub direction: Direction,
    pub node_type: String,
    pub id: i64,
}

/// A path between two nodes, shortest first in enumeration order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Path {
    /// Steps from (but not including) the start node to the end node
    pub steps: Vec<PathStep>,
}

impl Path {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Edge included in an extracted subgraph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubgraphEdge {
    pub edge_type: String,
    pub id: i64,
    pub from_type: String,
    pub from_id: i64,
    pub to_type: String,
    pub to_id: i64,
}

/// Subgraph around an anchor: reached nodes plus the edges among them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subgraph {
    pub nodes: Vec<TraversalNode>,
    pub edges: Vec<SubgraphEdge>,
    /// True when a node or edge limit cut the extraction short
    pub truncated: bool,
}
