//! Hybrid Retrieval Engine
//!
//! Runs a lexical ranking and a vector-similarity ranking over the search
//! index and fuses them with reciprocal-rank fusion:
//!
//! `score = (1/(k+rank_lex) * (1-alpha) + 1/(k+rank_vec) * alpha) * (k+1)`
//!
//! An entry unmatched in one ranking contributes 0 for that term. `k` is a
//! small smoothing constant; large values flatten the scores until top ranks
//! stop being separable. Ties keep stable insertion order. When only one
//! signal is obtainable the engine degrades to that single ranking rather
//! than failing; when neither is, it returns empty.

use crate::config::EngineConfig;
use crate::db::convert::blob_to_vector;
use crate::db::schema::SEARCH_INDEX_TABLE;
use crate::db::DatabaseService;
use crate::models::ontology::Ontology;
use crate::models::search::{SearchHit, SearchRequest};
use crate::services::error::EngineError;
use crate::services::providers::Providers;
use crate::services::sync_service::query_all;
use std::collections::HashMap;
use std::sync::Arc;

/// Composite identity of one index entry.
type HitKey = (String, i64, String, i64);

/// One candidate row pulled from the search index.
#[derive(Debug, Clone)]
struct Candidate {
    key: HitKey,
    content: String,
}

pub struct SearchService {
    db: DatabaseService,
    ontology: Arc<Ontology>,
    providers: Providers,
    fusion_k: f64,
    prefetch_multiplier: usize,
}

impl SearchService {
    pub fn new(
        db: DatabaseService,
        ontology: Arc<Ontology>,
        providers: Providers,
        config: &EngineConfig,
    ) -> Self {
        Self {
            db,
            ontology,
            providers,
            fusion_k: config.fusion_k,
            prefetch_multiplier: config.prefetch_multiplier.max(1),
        }
    }

    /// Fused hybrid search.
    pub async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchHit>, EngineError> {
        let table = self.resolve_table(request.node_type.as_deref())?;
        let prefetch = request.limit.saturating_mul(self.prefetch_multiplier).max(1);

        let lexical = self
            .lexical_ranking(&request.query_text, table.as_deref(), prefetch)
            .await?;
        let vector = self
            .vector_ranking(
                &request.query_text,
                request.query_vector.as_deref(),
                table.as_deref(),
                prefetch,
            )
            .await?;

        let hits = match (lexical.is_empty(), vector.is_empty()) {
            (true, true) => Vec::new(),
            // Single-path degradation ignores alpha: a pure-vector request
            // over an index without vectors still returns the lexical hits
            (false, true) => single_ranking_hits(lexical, self.fusion_k, request.limit),
            (true, false) => single_ranking_hits(vector, self.fusion_k, request.limit),
            (false, false) => fuse(lexical, vector, self.fusion_k, request.alpha, request.limit),
        };
        Ok(hits)
    }

    /// Lexical-only ranking, for callers that explicitly want that signal.
    pub async fn search_lexical(
        &self,
        query_text: &str,
        node_type: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SearchHit>, EngineError> {
        let table = self.resolve_table(node_type)?;
        let ranking = self
            .lexical_ranking(query_text, table.as_deref(), limit.max(1))
            .await?;
        Ok(single_ranking_hits(ranking, self.fusion_k, limit))
    }

    /// Vector-only ranking.
    ///
    /// Unlike the fused path this fails when no query vector is obtainable:
    /// the caller asked for this signal specifically, and a silent lexical
    /// fallback would misrepresent the result.
    pub async fn search_vector(
        &self,
        query_text: &str,
        query_vector: Option<&[f32]>,
        node_type: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SearchHit>, EngineError> {
        let table = self.resolve_table(node_type)?;
        let query = match self.obtain_query_vector(query_text, query_vector).await? {
            Some(vector) => vector,
            None => {
                return Err(EngineError::provider(
                    "embedding",
                    "vector search requested but no query vector is obtainable \
                     (no vector supplied and no embedding provider configured)",
                ))
            }
        };
        let ranking = self
            .vector_ranking_with(&query, table.as_deref(), limit.max(1))
            .await?;
        Ok(single_ranking_hits(ranking, self.fusion_k, limit))
    }

    /// Backing table for an optional node-type restriction.
    fn resolve_table(&self, node_type: Option<&str>) -> Result<Option<String>, EngineError> {
        match node_type {
            None => Ok(None),
            Some(name) => {
                let def = self
                    .ontology
                    .node_type(name)
                    .ok_or_else(|| EngineError::unknown_type(name))?;
                Ok(Some(def.table().to_string()))
            }
        }
    }

    /// Candidates matching any query token, ranked by matched-token count.
    ///
    /// Token matching happens against the stored `lexical_form`; the query
    /// goes through the same segmentation provider so both sides share a
    /// token vocabulary.
    async fn lexical_ranking(
        &self,
        query_text: &str,
        table: Option<&str>,
        prefetch: usize,
    ) -> Result<Vec<Candidate>, EngineError> {
        let tokens = self.query_tokens(query_text).await?;
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        let mut sql = format!(
            "SELECT source_table, source_id, source_field, chunk_seq, content, lexical_form
             FROM {SEARCH_INDEX_TABLE} WHERE lexical_form IS NOT NULL"
        );
        let mut params: Vec<libsql::Value> = Vec::new();
        if let Some(table) = table {
            sql.push_str(" AND source_table = ?");
            params.push(libsql::Value::Text(table.to_string()));
        }
        let like_terms: Vec<&str> = tokens.iter().map(|_| "lexical_form LIKE ?").collect();
        sql.push_str(&format!(" AND ({})", like_terms.join(" OR ")));
        for token in &tokens {
            params.push(libsql::Value::Text(format!("%{token}%")));
        }
        sql.push_str(" ORDER BY source_table, source_id, source_field, chunk_seq");

        let rows = self
            .db
            .read(|conn| async move { query_all(&conn, &sql, params, 6).await })
            .await?;

        let mut scored: Vec<(usize, Candidate)> = Vec::new();
        for row in rows {
            let Some((candidate, lexical_form)) = candidate_of(&row) else {
                continue;
            };
            let matched = matched_token_count(&lexical_form, &tokens);
            if matched > 0 {
                scored.push((matched, candidate));
            }
        }
        // Stable sort keeps deterministic row order among equal counts
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored.truncate(prefetch);
        Ok(scored.into_iter().map(|(_, c)| c).collect())
    }

    /// Vector ranking, embedding the query text when no vector was supplied.
    /// Returns empty when no query vector is obtainable (the fused path
    /// treats that as "signal unavailable").
    async fn vector_ranking(
        &self,
        query_text: &str,
        query_vector: Option<&[f32]>,
        table: Option<&str>,
        prefetch: usize,
    ) -> Result<Vec<Candidate>, EngineError> {
        match self.obtain_query_vector(query_text, query_vector).await? {
            Some(query) => self.vector_ranking_with(&query, table, prefetch).await,
            None => Ok(Vec::new()),
        }
    }

    async fn vector_ranking_with(
        &self,
        query: &[f32],
        table: Option<&str>,
        prefetch: usize,
    ) -> Result<Vec<Candidate>, EngineError> {
        let mut sql = format!(
            "SELECT source_table, source_id, source_field, chunk_seq, content, vector
             FROM {SEARCH_INDEX_TABLE} WHERE vector IS NOT NULL"
        );
        let mut params: Vec<libsql::Value> = Vec::new();
        if let Some(table) = table {
            sql.push_str(" AND source_table = ?");
            params.push(libsql::Value::Text(table.to_string()));
        }
        sql.push_str(" ORDER BY source_table, source_id, source_field, chunk_seq");

        let rows = self
            .db
            .read(|conn| async move { query_all(&conn, &sql, params, 6).await })
            .await?;

        let mut scored: Vec<(f64, Candidate)> = Vec::new();
        for row in rows {
            let Some((candidate, _)) = candidate_of(&row) else {
                continue;
            };
            let libsql::Value::Blob(blob) = &row[5] else {
                continue;
            };
            let stored = blob_to_vector(blob);
            let similarity = cosine_similarity(query, &stored);
            scored.push((similarity, candidate));
        }
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(prefetch);
        Ok(scored.into_iter().map(|(_, c)| c).collect())
    }

    async fn obtain_query_vector(
        &self,
        query_text: &str,
        query_vector: Option<&[f32]>,
    ) -> Result<Option<Vec<f32>>, EngineError> {
        if let Some(vector) = query_vector {
            return Ok(Some(vector.to_vec()));
        }
        let Some(embedding) = &self.providers.embedding else {
            return Ok(None);
        };
        let vectors = embedding
            .embed(&[query_text.to_string()])
            .await
            .map_err(|e| EngineError::provider("embedding", e.to_string()))?;
        Ok(vectors.into_iter().next())
    }

    /// Query tokens, segmented by the lexical provider when one is
    /// configured, otherwise a plain lowercase alphanumeric split.
    async fn query_tokens(&self, query_text: &str) -> Result<Vec<String>, EngineError> {
        let segmented = match &self.providers.lexical {
            Some(provider) => provider
                .segment(query_text)
                .await
                .map_err(|e| EngineError::provider("lexical", e.to_string()))?,
            None => query_text.to_lowercase(),
        };
        Ok(segmented
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_string())
            .collect())
    }
}

fn candidate_of(row: &[libsql::Value]) -> Option<(Candidate, String)> {
    let libsql::Value::Text(source_table) = &row[0] else {
        return None;
    };
    let libsql::Value::Integer(source_id) = row[1] else {
        return None;
    };
    let libsql::Value::Text(source_field) = &row[2] else {
        return None;
    };
    let libsql::Value::Integer(chunk_seq) = row[3] else {
        return None;
    };
    let libsql::Value::Text(content) = &row[4] else {
        return None;
    };
    let extra = match &row[5] {
        libsql::Value::Text(s) => s.clone(),
        _ => String::new(),
    };
    Some((
        Candidate {
            key: (
                source_table.clone(),
                source_id,
                source_field.clone(),
                chunk_seq,
            ),
            content: content.clone(),
        },
        extra,
    ))
}

/// How many query tokens appear as whole tokens of the lexical form.
fn matched_token_count(lexical_form: &str, tokens: &[String]) -> usize {
    let stored: std::collections::HashSet<&str> = lexical_form.split_whitespace().collect();
    tokens.iter().filter(|t| stored.contains(t.as_str())).count()
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        dot += (*x as f64) * (*y as f64);
        norm_a += (*x as f64) * (*x as f64);
        norm_b += (*y as f64) * (*y as f64);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Score a single ranking with the same reciprocal-rank shape as the fused
/// path, so single-signal scores remain comparable across calls.
fn single_ranking_hits(ranking: Vec<Candidate>, k: f64, limit: usize) -> Vec<SearchHit> {
    ranking
        .into_iter()
        .enumerate()
        .take(limit)
        .map(|(rank, candidate)| hit(candidate, (1.0 / (k + rank as f64 + 1.0)) * (k + 1.0)))
        .collect()
}

/// Reciprocal-rank fusion of the two rankings. Candidates keep the order in
/// which they first appeared (lexical ranking first), which is the stable
/// tie-break.
fn fuse(
    lexical: Vec<Candidate>,
    vector: Vec<Candidate>,
    k: f64,
    alpha: f64,
    limit: usize,
) -> Vec<SearchHit> {
    let lexical_rank: HashMap<HitKey, usize> = lexical
        .iter()
        .enumerate()
        .map(|(rank, c)| (c.key.clone(), rank + 1))
        .collect();
    let vector_rank: HashMap<HitKey, usize> = vector
        .iter()
        .enumerate()
        .map(|(rank, c)| (c.key.clone(), rank + 1))
        .collect();

    let mut seen = std::collections::HashSet::new();
    let mut candidates = Vec::new();
    for candidate in lexical.into_iter().chain(vector) {
        if seen.insert(candidate.key.clone()) {
            candidates.push(candidate);
        }
    }

    let mut scored: Vec<(f64, Candidate)> = candidates
        .into_iter()
        .map(|candidate| {
            let lex_term = lexical_rank
                .get(&candidate.key)
                .map(|r| 1.0 / (k + *r as f64))
                .unwrap_or(0.0);
            let vec_term = vector_rank
                .get(&candidate.key)
                .map(|r| 1.0 / (k + *r as f64))
                .unwrap_or(0.0);
            let score = (lex_term * (1.0 - alpha) + vec_term * alpha) * (k + 1.0);
            (score, candidate)
        })
        .collect();
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(limit);
    scored.into_iter().map(|(score, c)| hit(c, score)).collect()
}

fn hit(candidate: Candidate, score: f64) -> SearchHit {
    let (source_table, source_id, source_field, chunk_seq) = candidate.key;
    SearchHit {
        source_table,
        source_id,
        source_field,
        chunk_seq,
        content: candidate.content,
        score,
    }
}
