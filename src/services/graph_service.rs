//! Graph Traversal Engine
//!
//! Neighbor lookup, bounded breadth-first expansion, path enumeration, and
//! subgraph extraction over the typed edge tables. Every operation validates
//! its anchor node first and fails with a not-found condition for a missing
//! anchor; "anchor missing" and "anchor has no matches" are different
//! answers and are never conflated.

use crate::db::DatabaseService;
use crate::models::graph::{
    Direction, Neighbor, Path, PathStep, Subgraph, SubgraphEdge, TraversalNode,
};
use crate::models::ontology::{NodeTypeDef, Ontology};
use crate::models::search::{GraphSearchRequest, GraphSearchResult, SearchRequest};
use crate::services::error::EngineError;
use crate::services::search_service::SearchService;
use crate::services::sync_service::{placeholders, query_all};
use crate::db::convert::raw_to_json;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// Hard cap on traversal depth, applied regardless of caller input.
pub const MAX_TRAVERSAL_DEPTH: usize = 10;

/// One realized edge hop, in either direction.
#[derive(Debug, Clone)]
struct Hop {
    edge_type: String,
    direction: Direction,
    to: (String, i64),
}

pub struct GraphService {
    db: DatabaseService,
    ontology: Arc<Ontology>,
}

impl GraphService {
    pub fn new(db: DatabaseService, ontology: Arc<Ontology>) -> Self {
        Self { db, ontology }
    }

    /// One-hop neighbors of a node.
    ///
    /// With `Direction::Both`, a pair connected by one edge in each
    /// direction yields a single neighbor entry marked `Both`, not two.
    pub async fn neighbors(
        &self,
        node_type: &str,
        id: i64,
        edge_types: Option<&[String]>,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<Neighbor>, EngineError> {
        let def = self.require_node(node_type, id).await?;

        let anchors = vec![(def.name.clone(), id)];
        let hops = self.hops(&anchors, edge_types, direction).await?;

        // Deduplicate per (neighbor, edge type), merging directions
        let mut order: Vec<(String, i64, String)> = Vec::new();
        let mut merged: HashMap<(String, i64, String), Direction> = HashMap::new();
        for hop in hops {
            let (neighbor_type, neighbor_id) = hop.to;
            let key = (neighbor_type, neighbor_id, hop.edge_type);
            match merged.get_mut(&key) {
                None => {
                    order.push(key.clone());
                    merged.insert(key, hop.direction);
                }
                Some(existing) => {
                    if *existing != hop.direction {
                        *existing = Direction::Both;
                    }
                }
            }
        }
        order.truncate(limit);

        let records = self
            .fetch_records_for(order.iter().map(|(t, i, _)| (t.clone(), *i)))
            .await?;
        Ok(order
            .into_iter()
            .map(|(neighbor_type, neighbor_id, edge_type)| Neighbor {
                record: records
                    .get(&(neighbor_type.clone(), neighbor_id))
                    .cloned()
                    .unwrap_or(Value::Null),
                direction: merged
                    .get(&(neighbor_type.clone(), neighbor_id, edge_type.clone()))
                    .copied()
                    .unwrap_or(Direction::Both),
                node_type: neighbor_type,
                id: neighbor_id,
                edge_type,
            })
            .collect())
    }

    /// Breadth-first expansion up to `max_depth` hops.
    ///
    /// A node visited at a shallower or equal depth is never re-expanded,
    /// which is what makes cyclic graphs safe. The depth is hard-capped at
    /// [`MAX_TRAVERSAL_DEPTH`] regardless of caller input.
    pub async fn traverse(
        &self,
        node_type: &str,
        id: i64,
        edge_types: Option<&[String]>,
        direction: Direction,
        max_depth: usize,
        limit: usize,
    ) -> Result<Vec<TraversalNode>, EngineError> {
        let (nodes, _) = self
            .traverse_inner(node_type, id, edge_types, direction, max_depth, limit)
            .await?;
        Ok(nodes)
    }

    async fn traverse_inner(
        &self,
        node_type: &str,
        id: i64,
        edge_types: Option<&[String]>,
        direction: Direction,
        max_depth: usize,
        limit: usize,
    ) -> Result<(Vec<TraversalNode>, bool), EngineError> {
        let def = self.require_node(node_type, id).await?;
        let depth_cap = max_depth.min(MAX_TRAVERSAL_DEPTH);

        let mut visited: HashSet<(String, i64)> = HashSet::new();
        visited.insert((def.name.clone(), id));
        let mut frontier: Vec<(String, i64)> = vec![(def.name.clone(), id)];
        let mut reached: Vec<(String, i64, usize, String)> = Vec::new();
        let mut truncated = false;

        'expansion: for depth in 1..=depth_cap {
            if frontier.is_empty() {
                break;
            }
            let hops = self.hops(&frontier, edge_types, direction).await?;
            let mut next: Vec<(String, i64)> = Vec::new();
            for hop in hops {
                let key = hop.to.clone();
                if !visited.insert(key.clone()) {
                    continue;
                }
                if reached.len() >= limit {
                    truncated = true;
                    break 'expansion;
                }
                reached.push((key.0.clone(), key.1, depth, hop.edge_type));
                next.push(key);
            }
            frontier = next;
        }

        let records = self
            .fetch_records_for(reached.iter().map(|(t, i, _, _)| (t.clone(), *i)))
            .await?;
        let nodes = reached
            .into_iter()
            .map(|(node_type, id, depth, edge_type)| TraversalNode {
                record: records
                    .get(&(node_type.clone(), id))
                    .cloned()
                    .unwrap_or(Value::Null),
                node_type,
                id,
                depth,
                edge_type,
            })
            .collect();
        Ok((nodes, truncated))
    }

    /// Paths between two nodes, shortest first, up to `max_depth` edges.
    ///
    /// Edges are followed in both directions. An unreachable target within
    /// the depth bound yields an empty list, not an error.
    pub async fn find_paths(
        &self,
        from: (&str, i64),
        to: (&str, i64),
        edge_types: Option<&[String]>,
        max_depth: usize,
        limit: usize,
    ) -> Result<Vec<Path>, EngineError> {
        let from_def = self.require_node(from.0, from.1).await?;
        let to_def = self.require_node(to.0, to.1).await?;
        let start = (from_def.name.clone(), from.1);
        let target = (to_def.name.clone(), to.1);
        let depth_cap = max_depth.min(MAX_TRAVERSAL_DEPTH);

        if limit == 0 || depth_cap == 0 {
            return Ok(Vec::new());
        }

        let mut paths = Vec::new();
        let mut queue: VecDeque<((String, i64), Vec<PathStep>)> = VecDeque::new();
        queue.push_back((start.clone(), Vec::new()));

        while let Some((node, steps)) = queue.pop_front() {
            if steps.len() >= depth_cap {
                continue;
            }
            let hops = self.hops(&[node.clone()], edge_types, Direction::Both).await?;
            for hop in hops {
                // No node repeats within one path
                if hop.to == start || steps.iter().any(|s| (s.node_type.as_str(), s.id) == (hop.to.0.as_str(), hop.to.1)) {
                    continue;
                }
                let mut extended = steps.clone();
                extended.push(PathStep {
                    edge_type: hop.edge_type.clone(),
                    direction: hop.direction,
                    node_type: hop.to.0.clone(),
                    id: hop.to.1,
                });
                if hop.to == target {
                    paths.push(Path { steps: extended });
                    if paths.len() >= limit {
                        return Ok(paths);
                    }
                } else {
                    queue.push_back((hop.to, extended));
                }
            }
        }
        Ok(paths)
    }

    /// Nodes within `max_depth` of the anchor plus every edge among them,
    /// truncated once either limit is hit (and reported as such).
    pub async fn extract_subgraph(
        &self,
        node_type: &str,
        id: i64,
        edge_types: Option<&[String]>,
        max_depth: usize,
        node_limit: usize,
        edge_limit: usize,
    ) -> Result<Subgraph, EngineError> {
        let (nodes, node_truncated) = self
            .traverse_inner(node_type, id, edge_types, Direction::Both, max_depth, node_limit)
            .await?;

        // Reached set includes the anchor
        let mut ids_by_type: HashMap<String, HashSet<i64>> = HashMap::new();
        ids_by_type.entry(node_type.to_string()).or_default().insert(id);
        for node in &nodes {
            ids_by_type
                .entry(node.node_type.clone())
                .or_default()
                .insert(node.id);
        }

        let mut edges = Vec::new();
        let mut edge_truncated = false;
        'edges: for edge in self.edge_defs(edge_types) {
            let (Some(from_ids), Some(to_ids)) =
                (ids_by_type.get(&edge.0), ids_by_type.get(&edge.1))
            else {
                continue;
            };
            let rows = self
                .edges_among(&edge.2, from_ids, to_ids)
                .await?;
            for (edge_id, from_id, to_id) in rows {
                if edges.len() >= edge_limit {
                    edge_truncated = true;
                    break 'edges;
                }
                edges.push(SubgraphEdge {
                    edge_type: edge.3.clone(),
                    id: edge_id,
                    from_type: edge.0.clone(),
                    from_id,
                    to_type: edge.1.clone(),
                    to_id,
                });
            }
        }

        Ok(Subgraph {
            nodes,
            edges,
            truncated: node_truncated || edge_truncated,
        })
    }

    /// Retrieval-seeded expansion: hybrid search supplies seed nodes, each
    /// returned with its matching chunks and local graph context.
    pub async fn graph_search(
        &self,
        request: &GraphSearchRequest,
        search: &SearchService,
    ) -> Result<Vec<GraphSearchResult>, EngineError> {
        // Chunk hits overlap per record, so fetch a few times more than the
        // requested seed count
        let mut search_request = SearchRequest::new(request.query_text.clone())
            .with_limit(request.search_limit.saturating_mul(4).max(1))
            .with_alpha(request.alpha);
        if let Some(node_type) = &request.node_type {
            search_request = search_request.with_node_type(node_type.clone());
        }
        if let Some(vector) = &request.query_vector {
            search_request = search_request.with_vector(vector.clone());
        }
        let hits = search.search(&search_request).await?;

        // Group chunk hits into distinct seed records, best score first
        let mut seed_order: Vec<(String, i64)> = Vec::new();
        let mut matches: HashMap<(String, i64), Vec<crate::models::search::SearchHit>> =
            HashMap::new();
        for hit in hits {
            let Some(type_name) = self.node_type_for_table(&hit.source_table) else {
                // Edge-table hits do not seed traversal
                continue;
            };
            let key = (type_name, hit.source_id);
            if !matches.contains_key(&key) {
                if seed_order.len() >= request.search_limit {
                    continue;
                }
                seed_order.push(key.clone());
            }
            matches.entry(key).or_default().push(hit);
        }

        let records = self.fetch_records_for(seed_order.iter().cloned()).await?;
        let mut results = Vec::with_capacity(seed_order.len());
        for (node_type, id) in seed_order {
            // The index can briefly trail the tables; a vanished seed is
            // skipped rather than failing the query
            let Some(record) = records.get(&(node_type.clone(), id)).cloned() else {
                continue;
            };
            let context = self
                .traverse(
                    &node_type,
                    id,
                    None,
                    Direction::Both,
                    request.traverse_depth,
                    request.neighbor_limit,
                )
                .await?;
            let seed_matches = matches.remove(&(node_type.clone(), id)).unwrap_or_default();
            let score = seed_matches
                .iter()
                .map(|m| m.score)
                .fold(0.0f64, f64::max);
            results.push(GraphSearchResult {
                node_type,
                id,
                score,
                record,
                matches: seed_matches,
                context,
            });
        }
        Ok(results)
    }

    /// Resolve the anchor's type and verify the row exists.
    async fn require_node(&self, node_type: &str, id: i64) -> Result<&NodeTypeDef, EngineError> {
        let def = self
            .ontology
            .node_type(node_type)
            .ok_or_else(|| EngineError::unknown_type(node_type))?;
        let table = def.table().to_string();
        let sql = format!("SELECT 1 FROM {table} WHERE id = ?");
        let rows = self
            .db
            .read(|conn| async move {
                query_all(&conn, &sql, vec![libsql::Value::Integer(id)], 1).await
            })
            .await?;
        if rows.is_empty() {
            return Err(EngineError::node_not_found(def.table(), id));
        }
        Ok(def)
    }

    fn node_type_for_table(&self, table: &str) -> Option<String> {
        self.ontology
            .node_types
            .iter()
            .find(|t| t.table() == table)
            .map(|t| t.name.clone())
    }

    /// `(from_type, to_type, table, name)` of every edge type passing the
    /// caller's filter.
    fn edge_defs(&self, filter: Option<&[String]>) -> Vec<(String, String, String, String)> {
        self.ontology
            .edge_types
            .iter()
            .filter(|e| {
                filter
                    .map(|f| f.iter().any(|n| n == &e.name))
                    .unwrap_or(true)
            })
            .map(|e| {
                (
                    e.from.clone(),
                    e.to.clone(),
                    e.table().to_string(),
                    e.name.clone(),
                )
            })
            .collect()
    }

    /// All hops out of / into a set of nodes, one query per edge table and
    /// direction.
    async fn hops(
        &self,
        nodes: &[(String, i64)],
        edge_types: Option<&[String]>,
        direction: Direction,
    ) -> Result<Vec<Hop>, EngineError> {
        let mut ids_by_type: HashMap<&str, Vec<i64>> = HashMap::new();
        for (type_name, id) in nodes {
            ids_by_type.entry(type_name.as_str()).or_default().push(*id);
        }

        let mut hops = Vec::new();
        for (from_type, to_type, table, name) in self.edge_defs(edge_types) {
            if direction.wants_out() {
                if let Some(ids) = ids_by_type.get(from_type.as_str()) {
                    for (_, other_id) in self.edge_rows(&table, "from_id", ids).await? {
                        hops.push(Hop {
                            edge_type: name.clone(),
                            direction: Direction::Out,
                            to: (to_type.clone(), other_id),
                        });
                    }
                }
            }
            if direction.wants_in() {
                if let Some(ids) = ids_by_type.get(to_type.as_str()) {
                    for (_, other_id) in self.edge_rows(&table, "to_id", ids).await? {
                        hops.push(Hop {
                            edge_type: name.clone(),
                            direction: Direction::In,
                            to: (from_type.clone(), other_id),
                        });
                    }
                }
            }
        }
        Ok(hops)
    }

    /// `(edge_id, other_id)` rows where `anchor_column` is one of the
    /// given ids.
    async fn edge_rows(
        &self,
        table: &str,
        anchor_column: &str,
        ids: &[i64],
    ) -> Result<Vec<(i64, i64)>, EngineError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let other_column = if anchor_column == "from_id" {
            "to_id"
        } else {
            "from_id"
        };
        let sql = format!(
            "SELECT id, {other_column} FROM {table}
             WHERE {anchor_column} IN ({}) ORDER BY id",
            placeholders(ids.len())
        );
        let params: Vec<libsql::Value> = ids.iter().map(|id| libsql::Value::Integer(*id)).collect();
        let rows = self
            .db
            .read(|conn| async move { query_all(&conn, &sql, params, 2).await })
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| match (&row[0], &row[1]) {
                (libsql::Value::Integer(a), libsql::Value::Integer(b)) => Some((*a, *b)),
                _ => None,
            })
            .collect())
    }

    /// Edges of one table whose endpoints both fall inside the reached set.
    async fn edges_among(
        &self,
        table: &str,
        from_ids: &HashSet<i64>,
        to_ids: &HashSet<i64>,
    ) -> Result<Vec<(i64, i64, i64)>, EngineError> {
        if from_ids.is_empty() || to_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut from_sorted: Vec<i64> = from_ids.iter().copied().collect();
        from_sorted.sort_unstable();
        let mut to_sorted: Vec<i64> = to_ids.iter().copied().collect();
        to_sorted.sort_unstable();

        let sql = format!(
            "SELECT id, from_id, to_id FROM {table}
             WHERE from_id IN ({}) AND to_id IN ({}) ORDER BY id",
            placeholders(from_sorted.len()),
            placeholders(to_sorted.len())
        );
        let mut params: Vec<libsql::Value> = Vec::with_capacity(from_sorted.len() + to_sorted.len());
        params.extend(from_sorted.iter().map(|id| libsql::Value::Integer(*id)));
        params.extend(to_sorted.iter().map(|id| libsql::Value::Integer(*id)));
        let rows = self
            .db
            .read(|conn| async move { query_all(&conn, &sql, params, 3).await })
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| match (&row[0], &row[1], &row[2]) {
                (
                    libsql::Value::Integer(a),
                    libsql::Value::Integer(b),
                    libsql::Value::Integer(c),
                ) => Some((*a, *b, *c)),
                _ => None,
            })
            .collect())
    }

    /// Full rows for a set of `(type, id)` pairs, grouped per type into one
    /// query each.
    async fn fetch_records_for(
        &self,
        keys: impl IntoIterator<Item = (String, i64)>,
    ) -> Result<HashMap<(String, i64), Value>, EngineError> {
        let mut ids_by_type: HashMap<String, Vec<i64>> = HashMap::new();
        for (type_name, id) in keys {
            let ids = ids_by_type.entry(type_name).or_default();
            if !ids.contains(&id) {
                ids.push(id);
            }
        }

        let mut records = HashMap::new();
        for (type_name, ids) in ids_by_type {
            let Some(def) = self.ontology.node_type(&type_name) else {
                continue;
            };
            let mut select = vec!["id".to_string(), "created_at".to_string(), "updated_at".to_string()];
            select.extend(def.fields.iter().map(|f| f.name.clone()));
            let sql = format!(
                "SELECT {} FROM {} WHERE id IN ({})",
                select.join(", "),
                def.table(),
                placeholders(ids.len())
            );
            let params: Vec<libsql::Value> =
                ids.iter().map(|id| libsql::Value::Integer(*id)).collect();
            let width = select.len();
            let rows = self
                .db
                .read(|conn| async move { query_all(&conn, &sql, params, width).await })
                .await?;

            for row in rows {
                let libsql::Value::Integer(id) = row[0] else {
                    continue;
                };
                let mut object = serde_json::Map::new();
                object.insert("id".to_string(), Value::from(id));
                object.insert("created_at".to_string(), raw_to_json(row[1].clone()));
                object.insert("updated_at".to_string(), raw_to_json(row[2].clone()));
                for (i, field) in def.fields.iter().enumerate() {
                    let value =
                        crate::db::convert::sql_to_json(field.field_type, row[i + 3].clone());
                    if !value.is_null() {
                        object.insert(field.name.clone(), value);
                    }
                }
                records.insert((type_name.clone(), id), Value::Object(object));
            }
        }
        Ok(records)
    }
}
