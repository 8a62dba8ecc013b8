//! Index & Cache Manager
//!
//! Derives search-index rows from table contents: long text fields are
//! chunked, and each chunk is resolved to a lexical token string and an
//! embedding vector through a content-hash cache. The cache is keyed purely
//! by content, so identical chunks across different records share one entry
//! and one provider call.
//!
//! Provider calls happen before the write transaction is entered; a write
//! slot is never held across network latency. Exhausted embedding retries
//! degrade the affected chunks (indexed without a vector) instead of
//! failing the batch.

use crate::config::EngineConfig;
use crate::db::convert::{blob_to_vector, vector_to_blob};
use crate::db::schema::{RESOLVE_CACHE_TABLE, SEARCH_INDEX_TABLE};
use crate::db::DatabaseService;
use crate::models::ontology::{FieldIndex, Ontology, TypeRef};
use crate::services::error::EngineError;
use crate::services::providers::{embed_with_retry, Providers};
use crate::services::sync_service::{
    execute, mark_indexed, now_rfc3339, placeholders, query_all,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Resolved signals for one chunk of content.
#[derive(Debug, Clone, Default)]
pub struct ResolvedChunk {
    pub content_hash: String,
    pub lexical_form: Option<String>,
    pub vector: Option<Vec<f32>>,
}

/// One line of the durable cache snapshot.
#[derive(Debug, Serialize, Deserialize)]
struct CacheLine {
    content_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    lexical_form: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    vector: Option<Vec<f32>>,
    last_used: String,
}

/// A pending index row, fully resolved and ready to insert.
struct IndexRow {
    source_id: i64,
    source_field: String,
    chunk_seq: i64,
    content: String,
    content_hash: String,
}

pub struct IndexService {
    db: DatabaseService,
    ontology: Arc<Ontology>,
    providers: Providers,
    chunk_max_len: usize,
    max_retries: u32,
    retry_backoff: Duration,
}

impl IndexService {
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
            chunk_max_len: config.chunk_max_len,
            max_retries: config.provider_max_retries,
            retry_backoff: config.provider_retry_backoff,
        }
    }

    /// Re-derive index rows for a type.
    ///
    /// With `record_ids` the work is limited to those records (incremental
    /// update after a load); without it the whole type is reindexed. Existing
    /// index rows for each touched record are deleted first, so a shrinking
    /// chunk count never leaves orphaned tail entries. Returns the number of
    /// index rows written.
    pub async fn build_index(
        &self,
        type_name: &str,
        record_ids: Option<Vec<i64>>,
    ) -> Result<usize, EngineError> {
        let (table, indexed): (String, Vec<(String, FieldIndex)>) = {
            let type_ref = self.lookup(type_name)?;
            let indexed = match type_ref {
                TypeRef::Node(def) => def
                    .indexed_fields()
                    .map(|(f, idx)| (f.name.clone(), idx))
                    .collect(),
                TypeRef::Edge(def) => def
                    .indexed_fields()
                    .map(|(f, idx)| (f.name.clone(), idx))
                    .collect(),
            };
            let table = match type_ref {
                TypeRef::Node(def) => def.table().to_string(),
                TypeRef::Edge(def) => def.table().to_string(),
            };
            (table, indexed)
        };

        // Which record ids are affected (needed even with no indexed fields,
        // so deletions still clear stale rows)
        let touched: Vec<i64> = match &record_ids {
            Some(ids) => ids.clone(),
            None => self.all_ids(&table).await?,
        };
        if touched.is_empty() {
            return Ok(0);
        }

        let mut rows = Vec::new();
        let mut want_by_hash: HashMap<String, FieldIndex> = HashMap::new();
        let mut content_by_hash: HashMap<String, String> = HashMap::new();
        if !indexed.is_empty() {
            let source = self.fetch_text_fields(&table, &indexed, &touched).await?;
            for (source_id, field_name, index, text) in source {
                for (seq, piece) in chunk(&text, self.chunk_max_len).into_iter().enumerate() {
                    let hash = content_hash(&piece);
                    want_by_hash
                        .entry(hash.clone())
                        .and_modify(|w| {
                            w.lexical |= index.lexical;
                            w.vector |= index.vector;
                        })
                        .or_insert(index);
                    content_by_hash.entry(hash.clone()).or_insert(piece.clone());
                    rows.push(IndexRow {
                        source_id,
                        source_field: field_name.clone(),
                        chunk_seq: seq as i64,
                        content: piece,
                        content_hash: hash,
                    });
                }
            }
        }

        // Resolve every distinct hash before taking a write slot
        let resolved = self.resolve_all(&want_by_hash, &content_by_hash).await?;

        let written = rows.len();
        let table_owned = table.clone();
        self.db
            .write_transaction(move |conn| async move {
                let now = now_rfc3339();
                for id in &touched {
                    let sql = format!(
                        "DELETE FROM {SEARCH_INDEX_TABLE} WHERE source_table = ? AND source_id = ?"
                    );
                    execute(
                        &conn,
                        &sql,
                        vec![
                            libsql::Value::Text(table_owned.clone()),
                            libsql::Value::Integer(*id),
                        ],
                    )
                    .await?;
                }
                for row in &rows {
                    let chunk = resolved
                        .get(&row.content_hash)
                        .cloned()
                        .unwrap_or_default();
                    let sql = format!(
                        "INSERT OR REPLACE INTO {SEARCH_INDEX_TABLE}
                         (source_table, source_id, source_field, chunk_seq,
                          content, lexical_form, vector, content_hash, created_at)
                         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"
                    );
                    execute(
                        &conn,
                        &sql,
                        vec![
                            libsql::Value::Text(table_owned.clone()),
                            libsql::Value::Integer(row.source_id),
                            libsql::Value::Text(row.source_field.clone()),
                            libsql::Value::Integer(row.chunk_seq),
                            libsql::Value::Text(row.content.clone()),
                            chunk
                                .lexical_form
                                .clone()
                                .map(libsql::Value::Text)
                                .unwrap_or(libsql::Value::Null),
                            chunk
                                .vector
                                .as_deref()
                                .map(|v| libsql::Value::Blob(vector_to_blob(v)))
                                .unwrap_or(libsql::Value::Null),
                            libsql::Value::Text(row.content_hash.clone()),
                            libsql::Value::Text(now.clone()),
                        ],
                    )
                    .await?;
                }
                // Persist resolutions and refresh last_used for every hash
                // this batch touched
                for (hash, chunk) in &resolved {
                    upsert_cache_entry(&conn, hash, chunk, &now).await?;
                }
                mark_indexed(&conn, &table_owned).await?;
                Ok::<_, EngineError>(())
            })
            .await?;

        tracing::debug!(r#type = type_name, rows = written, "Index rebuilt");
        Ok(written)
    }

    /// Resolve one chunk through the cache, calling providers only on miss.
    pub async fn resolve(&self, content: &str, want: FieldIndex) -> Result<ResolvedChunk, EngineError> {
        let hash = content_hash(content);
        let mut want_map = HashMap::new();
        want_map.insert(hash.clone(), want);
        let mut content_map = HashMap::new();
        content_map.insert(hash.clone(), content.to_string());

        let mut resolved = self.resolve_all(&want_map, &content_map).await?;
        let chunk = resolved.remove(&hash).unwrap_or_default();

        let now = now_rfc3339();
        let persist = chunk.clone();
        self.db
            .write(move |conn| async move {
                upsert_cache_entry(&conn, &persist.content_hash, &persist, &now).await
            })
            .await?;
        Ok(chunk)
    }

    /// Delete cache entries whose `last_used` predates `now - older_than`.
    ///
    /// Always safe: an evicted entry only costs recomputation on next use.
    pub async fn evict_cache(&self, older_than: chrono::Duration) -> Result<usize, EngineError> {
        let cutoff = (Utc::now() - older_than).to_rfc3339_opts(chrono::SecondsFormat::Micros, true);
        let deleted = self
            .db
            .write(|conn| async move {
                let sql = format!("DELETE FROM {RESOLVE_CACHE_TABLE} WHERE last_used < ?");
                execute(&conn, &sql, vec![libsql::Value::Text(cutoff)]).await
            })
            .await?;
        tracing::debug!(deleted, "Cache evicted");
        Ok(deleted as usize)
    }

    /// Write the full cache to a snapshot file (newline-delimited entries).
    ///
    /// Staged next to the target and swapped in with a rename, so the
    /// snapshot path never holds a half-written file.
    pub async fn export_cache(&self, path: &Path) -> Result<usize, EngineError> {
        let rows = self
            .db
            .read(|conn| async move {
                let sql = format!(
                    "SELECT content_hash, lexical_form, vector, last_used FROM {RESOLVE_CACHE_TABLE}
                     ORDER BY content_hash"
                );
                query_all(&conn, &sql, Vec::new(), 4).await
            })
            .await?;

        let mut out = String::new();
        for row in &rows {
            let line = CacheLine {
                content_hash: match &row[0] {
                    libsql::Value::Text(s) => s.clone(),
                    _ => continue,
                },
                lexical_form: match &row[1] {
                    libsql::Value::Text(s) => Some(s.clone()),
                    _ => None,
                },
                vector: match &row[2] {
                    libsql::Value::Blob(b) => Some(blob_to_vector(b)),
                    _ => None,
                },
                last_used: match &row[3] {
                    libsql::Value::Text(s) => s.clone(),
                    _ => String::new(),
                },
            };
            out.push_str(
                &serde_json::to_string(&line)
                    .map_err(|e| EngineError::serialization(e.to_string()))?,
            );
            out.push('\n');
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let staging = path.with_extension("staging");
        std::fs::write(&staging, out)?;
        std::fs::rename(&staging, path)?;
        Ok(rows.len())
    }

    /// Load a cache snapshot, if present. Existing entries win over the
    /// snapshot's; a missing or partly unreadable file costs only a cold
    /// cache, never correctness.
    pub async fn import_cache(&self, path: &Path) -> Result<usize, EngineError> {
        if !path.exists() {
            return Ok(0);
        }
        let content = std::fs::read_to_string(path)?;
        let mut entries = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<CacheLine>(line) {
                Ok(entry) => entries.push(entry),
                Err(err) => {
                    tracing::warn!("Skipping malformed cache snapshot line: {}", err);
                }
            }
        }
        let imported = entries.len();

        self.db
            .write(move |conn| async move {
                for entry in &entries {
                    let sql = format!(
                        "INSERT INTO {RESOLVE_CACHE_TABLE} (content_hash, lexical_form, vector, last_used)
                         VALUES (?, ?, ?, ?) ON CONFLICT(content_hash) DO NOTHING"
                    );
                    execute(
                        &conn,
                        &sql,
                        vec![
                            libsql::Value::Text(entry.content_hash.clone()),
                            entry
                                .lexical_form
                                .clone()
                                .map(libsql::Value::Text)
                                .unwrap_or(libsql::Value::Null),
                            entry
                                .vector
                                .as_deref()
                                .map(|v| libsql::Value::Blob(vector_to_blob(v)))
                                .unwrap_or(libsql::Value::Null),
                            libsql::Value::Text(entry.last_used.clone()),
                        ],
                    )
                    .await?;
                }
                Ok::<_, EngineError>(())
            })
            .await?;
        Ok(imported)
    }

    fn lookup(&self, type_name: &str) -> Result<TypeRef<'_>, EngineError> {
        if let Some(def) = self.ontology.node_type(type_name) {
            return Ok(TypeRef::Node(def));
        }
        self.ontology
            .edge_type(type_name)
            .map(TypeRef::Edge)
            .ok_or_else(|| EngineError::unknown_type(type_name))
    }

    async fn all_ids(&self, table: &str) -> Result<Vec<i64>, EngineError> {
        let sql = format!("SELECT id FROM {table}");
        let rows = self
            .db
            .read(|conn| async move { query_all(&conn, &sql, Vec::new(), 1).await })
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| match row[0] {
                libsql::Value::Integer(n) => Some(n),
                _ => None,
            })
            .collect())
    }

    /// Fetch `(id, field_name, index_config, text)` for every non-empty
    /// indexed text value of the given records.
    async fn fetch_text_fields(
        &self,
        table: &str,
        indexed: &[(String, FieldIndex)],
        ids: &[i64],
    ) -> Result<Vec<(i64, String, FieldIndex, String)>, EngineError> {
        let field_list: Vec<&str> = indexed.iter().map(|(name, _)| name.as_str()).collect();
        let sql = format!(
            "SELECT id, {} FROM {} WHERE id IN ({})",
            field_list.join(", "),
            table,
            placeholders(ids.len())
        );
        let params: Vec<libsql::Value> = ids.iter().map(|id| libsql::Value::Integer(*id)).collect();
        let width = 1 + indexed.len();
        let rows = self
            .db
            .read(|conn| async move { query_all(&conn, &sql, params, width).await })
            .await?;

        let mut result = Vec::new();
        for row in rows {
            let libsql::Value::Integer(id) = row[0] else {
                continue;
            };
            for (i, (name, index)) in indexed.iter().enumerate() {
                if let libsql::Value::Text(text) = &row[i + 1] {
                    if !text.is_empty() {
                        result.push((id, name.clone(), *index, text.clone()));
                    }
                }
            }
        }
        Ok(result)
    }

    /// Resolve every distinct hash: cache first, then providers for the
    /// misses. No write slot is held during provider calls.
    async fn resolve_all(
        &self,
        want_by_hash: &HashMap<String, FieldIndex>,
        content_by_hash: &HashMap<String, String>,
    ) -> Result<HashMap<String, ResolvedChunk>, EngineError> {
        if want_by_hash.is_empty() {
            return Ok(HashMap::new());
        }

        let mut resolved: HashMap<String, ResolvedChunk> = want_by_hash
            .keys()
            .map(|hash| {
                (
                    hash.clone(),
                    ResolvedChunk {
                        content_hash: hash.clone(),
                        ..Default::default()
                    },
                )
            })
            .collect();

        // Cache lookup
        let hashes: Vec<String> = want_by_hash.keys().cloned().collect();
        let sql = format!(
            "SELECT content_hash, lexical_form, vector FROM {RESOLVE_CACHE_TABLE}
             WHERE content_hash IN ({})",
            placeholders(hashes.len())
        );
        let params: Vec<libsql::Value> = hashes
            .iter()
            .map(|h| libsql::Value::Text(h.clone()))
            .collect();
        let cached = self
            .db
            .read(|conn| async move { query_all(&conn, &sql, params, 3).await })
            .await?;
        for row in cached {
            let libsql::Value::Text(hash) = &row[0] else {
                continue;
            };
            if let Some(chunk) = resolved.get_mut(hash) {
                if let libsql::Value::Text(lexical) = &row[1] {
                    chunk.lexical_form = Some(lexical.clone());
                }
                if let libsql::Value::Blob(blob) = &row[2] {
                    chunk.vector = Some(blob_to_vector(blob));
                }
            }
        }

        // Lexical misses, one provider call per distinct chunk
        if let Some(lexical) = &self.providers.lexical {
            for (hash, want) in want_by_hash {
                if !want.lexical {
                    continue;
                }
                let Some(chunk) = resolved.get_mut(hash) else {
                    continue;
                };
                if chunk.lexical_form.is_some() {
                    continue;
                }
                let Some(content) = content_by_hash.get(hash) else {
                    continue;
                };
                match lexical.segment(content).await {
                    Ok(form) => chunk.lexical_form = Some(form),
                    Err(err) => {
                        // Degrade this chunk; the batch continues
                        tracing::warn!("Lexical segmentation failed, chunk degraded: {}", err);
                    }
                }
            }
        }

        // Embedding misses, one batched call with bounded retries
        if let Some(embedding) = &self.providers.embedding {
            let misses: Vec<String> = want_by_hash
                .iter()
                .filter(|(hash, want)| {
                    want.vector && resolved.get(*hash).map(|c| c.vector.is_none()).unwrap_or(false)
                })
                .filter_map(|(hash, _)| content_by_hash.get(hash).map(|_| hash.clone()))
                .collect();
            if !misses.is_empty() {
                let texts: Vec<String> = misses
                    .iter()
                    .map(|hash| content_by_hash[hash].clone())
                    .collect();
                match embed_with_retry(
                    embedding.as_ref(),
                    &texts,
                    self.max_retries,
                    self.retry_backoff,
                )
                .await
                {
                    Ok(vectors) => {
                        for (hash, vector) in misses.iter().zip(vectors) {
                            if let Some(chunk) = resolved.get_mut(hash) {
                                chunk.vector = Some(vector);
                            }
                        }
                    }
                    Err(err) => {
                        tracing::warn!(
                            chunks = misses.len(),
                            "Embedding failed after retries, chunks indexed without vectors: {}",
                            err
                        );
                    }
                }
            }
        }

        Ok(resolved)
    }
}

/// Persist a resolved chunk, merging with any existing entry and refreshing
/// `last_used`. Never downgrades a stored signal to null.
async fn upsert_cache_entry(
    conn: &libsql::Connection,
    hash: &str,
    chunk: &ResolvedChunk,
    now: &str,
) -> Result<(), EngineError> {
    let sql = format!(
        "INSERT INTO {RESOLVE_CACHE_TABLE} (content_hash, lexical_form, vector, last_used)
         VALUES (?, ?, ?, ?)
         ON CONFLICT(content_hash) DO UPDATE SET
             lexical_form = COALESCE(excluded.lexical_form, lexical_form),
             vector = COALESCE(excluded.vector, vector),
             last_used = excluded.last_used"
    );
    execute(
        conn,
        &sql,
        vec![
            libsql::Value::Text(hash.to_string()),
            chunk
                .lexical_form
                .clone()
                .map(libsql::Value::Text)
                .unwrap_or(libsql::Value::Null),
            chunk
                .vector
                .as_deref()
                .map(|v| libsql::Value::Blob(vector_to_blob(v)))
                .unwrap_or(libsql::Value::Null),
            libsql::Value::Text(now.to_string()),
        ],
    )
    .await?;
    Ok(())
}

/// Hex SHA-256 of a chunk's content, the cache key.
pub fn content_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// Split text into ordered pieces no longer than `max_len` characters.
///
/// Splits on whitespace and greedily packs words; a word longer than
/// `max_len` on its own is hard-split. A trailing piece shorter than half
/// `max_len` is merged into the previous piece unless that would push it
/// over `max_len`. Empty input yields no chunks; input that already fits
/// is returned verbatim as a single chunk.
pub fn chunk(text: &str, max_len: usize) -> Vec<String> {
    if text.is_empty() || max_len == 0 {
        return Vec::new();
    }
    if text.chars().count() <= max_len {
        return vec![text.to_string()];
    }

    let mut pieces: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    let push_current = |pieces: &mut Vec<String>, current: &mut String, len: &mut usize| {
        if !current.is_empty() {
            pieces.push(std::mem::take(current));
            *len = 0;
        }
    };

    for word in text.split_whitespace() {
        let word_len = word.chars().count();
        if word_len > max_len {
            // Oversized word: flush and hard-split by characters
            push_current(&mut pieces, &mut current, &mut current_len);
            let chars: Vec<char> = word.chars().collect();
            for slice in chars.chunks(max_len) {
                pieces.push(slice.iter().collect());
            }
            continue;
        }
        let needed = if current_len == 0 { word_len } else { current_len + 1 + word_len };
        if needed > max_len {
            push_current(&mut pieces, &mut current, &mut current_len);
            current.push_str(word);
            current_len = word_len;
        } else {
            if current_len > 0 {
                current.push(' ');
            }
            current.push_str(word);
            current_len = needed;
        }
    }
    push_current(&mut pieces, &mut current, &mut current_len);

    // Trailing-merge rule: a short final piece joins its predecessor when
    // the merge still fits
    if pieces.len() >= 2 {
        let last_len = pieces[pieces.len() - 1].chars().count();
        let prev_len = pieces[pieces.len() - 2].chars().count();
        if last_len < max_len / 2 && prev_len + 1 + last_len <= max_len {
            let last = pieces.pop().unwrap_or_default();
            if let Some(prev) = pieces.last_mut() {
                prev.push(' ');
                prev.push_str(&last);
            }
        }
    }

    pieces
}

/// Distinct hashes appearing in a row batch (diagnostic helper for tests).
#[cfg(test)]
fn distinct_hashes(rows: &[IndexRow]) -> usize {
    rows.iter()
        .map(|r| r.content_hash.as_str())
        .collect::<std::collections::HashSet<_>>()
        .len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_empty_yields_nothing() {
        assert!(chunk("", 100).is_empty());
    }

    #[test]
    fn chunk_short_text_is_verbatim() {
        assert_eq!(chunk("hello  world", 100), vec!["hello  world"]);
    }

    #[test]
    fn chunk_respects_max_len() {
        let text = "alpha beta gamma delta epsilon zeta eta theta";
        for piece in chunk(text, 12) {
            assert!(piece.chars().count() <= 12, "piece too long: {piece:?}");
        }
    }

    #[test]
    fn chunk_hard_splits_oversized_word() {
        let pieces = chunk("abcdefghijklmnop tail tail tail tail", 5);
        assert_eq!(pieces[0], "abcde");
        assert_eq!(pieces[1], "fghij");
        assert_eq!(pieces[2], "klmno");
    }

    #[test]
    fn chunk_merges_short_trailing_piece() {
        // "aaaa bbbb cc" at max 10: greedy gives ["aaaa bbbb", "cc"],
        // but "cc" is shorter than 5 and does not fit back, so it stays
        let pieces = chunk("aaaa bbbb cc", 10);
        assert_eq!(pieces, vec!["aaaa bbbb", "cc"]);

        // At max 12 the merge fits
        let pieces = chunk("aaaa bbbb cccc dd", 12);
        assert_eq!(*pieces.last().unwrap(), "cccc dd");
    }

    #[test]
    fn content_hash_is_stable_hex() {
        let a = content_hash("hello");
        let b = content_hash("hello");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn identical_chunks_share_a_hash() {
        let rows = vec![
            IndexRow {
                source_id: 1,
                source_field: "bio".to_string(),
                chunk_seq: 0,
                content: "same text".to_string(),
                content_hash: content_hash("same text"),
            },
            IndexRow {
                source_id: 2,
                source_field: "bio".to_string(),
                chunk_seq: 0,
                content: "same text".to_string(),
                content_hash: content_hash("same text"),
            },
        ];
        assert_eq!(distinct_hashes(&rows), 1);
    }
}
