//! File <-> Engine Synchronization
//!
//! The flat-file directory is authoritative; the database tables, the search
//! index, and the sync ledger are derived state that this service keeps
//! reproducible from it.
//!
//! `load` merges flat records into the backing table under one write
//! transaction, deriving every id from the identity-field values (never
//! engine-assigned, so identical source data always reproduces identical
//! ids). `dump` exports a table back to the flat format in identity order -
//! that ordering, not insertion order, is what keeps consecutive exports
//! diff-minimal - and replaces the live directory with an atomic rename swap
//! so a crash mid-export leaves either the old or the new directory intact,
//! never a partial one.

use crate::config::EngineConfig;
use crate::db::convert::{json_to_sql, raw_to_json, sql_to_json};
use crate::db::schema::{SEARCH_INDEX_TABLE, SYNC_LEDGER_TABLE};
use crate::db::{DatabaseError, DatabaseService};
use crate::models::ontology::{
    canonical_value, derive_id, EdgeTypeDef, NodeTypeDef, Ontology, TypeRef,
};
use crate::models::record::{FlatRecord, RecordLocation, RecordOp};
use crate::services::error::EngineError;
use crate::services::index_service::IndexService;
use chrono::{SecondsFormat, Utc};
use libsql::Connection;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Outcome of a `load` call.
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    pub upserted: usize,
    pub deleted: usize,
    /// Ids of upserted records, for incremental index rebuilds
    pub record_ids: Vec<i64>,
}

/// Outcome of a `dump` call.
#[derive(Debug, Clone)]
pub struct DumpReport {
    pub records: usize,
    /// Live directory the export now occupies
    pub path: PathBuf,
}

/// Outcome of a full `sync` (load -> index -> dump).
///
/// `warnings` is non-empty when a post-load step failed: the engine is then
/// ahead of the flat files until the next successful sync, which the ledger
/// records as divergence.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub upserted: usize,
    pub deleted: usize,
    pub indexed: Option<usize>,
    pub dumped: bool,
    pub warnings: Vec<String>,
}

/// One row of the sync ledger.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub table_name: String,
    pub last_load_at: Option<String>,
    pub last_index_at: Option<String>,
    pub last_dump_at: Option<String>,
    pub divergent: bool,
}

/// A record fully prepared for insertion: id derived, values converted.
struct PreparedUpsert {
    id: i64,
    /// Explicit timestamp from the file, if any (preserved for round-trips)
    created_at: Option<String>,
    updated_at: Option<String>,
    /// `(from_id, to_id)` for edge records
    endpoints: Option<(i64, i64)>,
    /// Column values in declared field order
    columns: Vec<libsql::Value>,
    location: RecordLocation,
}

/// One prepared operation, kept in file order. A change-set may delete and
/// then re-create the same identity, so the order is semantic.
enum PreparedOp {
    Upsert(PreparedUpsert),
    Delete(i64),
}

/// Sync engine for one data directory.
pub struct SyncService {
    db: DatabaseService,
    ontology: Arc<Ontology>,
    data_dir: PathBuf,
}

impl SyncService {
    pub fn new(db: DatabaseService, ontology: Arc<Ontology>, config: &EngineConfig) -> Self {
        Self {
            db,
            ontology,
            data_dir: config.data_dir.clone(),
        }
    }

    /// Directory holding the flat files of one type.
    pub fn type_dir(&self, type_name: &str) -> PathBuf {
        self.data_dir.join(type_name)
    }

    /// Merge all flat records of `type_name` into its backing table.
    ///
    /// Additive/overwriting: existing ids are overwritten, ids absent from
    /// the files are left untouched. Operations apply in file order, so a
    /// delete marker followed by a re-upsert of the same identity nets to
    /// the record present. Runs as a single write transaction; any
    /// validation failure (missing identity field, edge referencing a
    /// missing node) rolls the whole load back.
    pub async fn load(&self, type_name: &str) -> Result<LoadReport, EngineError> {
        let type_ref = self.lookup(type_name)?;
        let records = self.read_type_dir(type_name)?;
        if records.is_empty() {
            return Ok(LoadReport::default());
        }

        let (ops, plan) = match type_ref {
            TypeRef::Node(def) => (
                self.prepare_node_records(def, records)?,
                WritePlan::for_node(&self.ontology, def),
            ),
            TypeRef::Edge(def) => (
                self.prepare_edge_records(def, records)?,
                WritePlan::for_edge(def),
            ),
        };

        let mut report = LoadReport::default();
        for op in &ops {
            match op {
                PreparedOp::Upsert(upsert) => {
                    report.upserted += 1;
                    report.record_ids.push(upsert.id);
                }
                PreparedOp::Delete(_) => report.deleted += 1,
            }
        }

        self.db
            .write_transaction(move |conn| async move {
                for op in &ops {
                    match op {
                        PreparedOp::Upsert(upsert) => {
                            plan.validate_endpoints(&conn, upsert).await?;
                            plan.apply_upsert(&conn, upsert).await?;
                        }
                        PreparedOp::Delete(id) => {
                            plan.apply_delete(&conn, *id).await?;
                        }
                    }
                }
                mark_loaded(&conn, &plan.table).await?;
                Ok::<_, EngineError>(())
            })
            .await?;

        tracing::info!(
            r#type = type_name,
            upserted = report.upserted,
            deleted = report.deleted,
            "Flat records loaded"
        );
        Ok(report)
    }

    /// Export a backing table to its flat directory, atomically.
    ///
    /// Rows are ordered by identity-field values and serialized with stable
    /// key order, so an unchanged table always produces byte-identical
    /// output. The export is written to a staging directory first and
    /// swapped in with renames; on a failed swap the previous directory is
    /// restored and an error reported, never a half-written canonical path.
    pub async fn dump(&self, type_name: &str) -> Result<DumpReport, EngineError> {
        let lines = match self.lookup(type_name)? {
            TypeRef::Node(def) => self.export_node_lines(def).await?,
            TypeRef::Edge(def) => self.export_edge_lines(def).await?,
        };
        let records = lines.len();

        let live = self.type_dir(type_name);
        self.swap_in(type_name, &live, lines)?;

        let table = self.lookup(type_name)?.table_name().to_string();
        self.db
            .write(|conn| async move { mark_dumped(&conn, &table).await })
            .await?;

        tracing::info!(r#type = type_name, records, "Flat records exported");
        Ok(DumpReport {
            records,
            path: live,
        })
    }

    /// Load, re-derive index rows incrementally, and re-export, as one
    /// logical unit.
    ///
    /// If indexing or the export fails after the load committed, the engine
    /// is ahead of the flat files: the failure is surfaced in
    /// `SyncReport::warnings` and the ledger stays divergent until the next
    /// successful sync. It is never hidden.
    pub async fn sync(
        &self,
        type_name: &str,
        index: &IndexService,
    ) -> Result<SyncReport, EngineError> {
        let load = self.load(type_name).await?;
        let mut report = SyncReport {
            upserted: load.upserted,
            deleted: load.deleted,
            ..Default::default()
        };

        match index
            .build_index(type_name, Some(load.record_ids.clone()))
            .await
        {
            Ok(indexed) => report.indexed = Some(indexed),
            Err(err) => {
                let warning = format!("index update failed after load: {}", err);
                tracing::warn!(r#type = type_name, "{}", warning);
                report.warnings.push(warning);
                return Ok(report);
            }
        }

        match self.dump(type_name).await {
            Ok(_) => report.dumped = true,
            Err(err) => {
                let warning = format!("export failed after load: {}", err);
                tracing::warn!(r#type = type_name, "{}", warning);
                report.warnings.push(warning);
            }
        }
        Ok(report)
    }

    /// Destructively delete one record by identity, with full cascade
    /// (referencing edges, search-index rows). Returns whether it existed.
    pub async fn delete(
        &self,
        type_name: &str,
        identity: &Map<String, Value>,
    ) -> Result<bool, EngineError> {
        let (id, plan) = match self.lookup(type_name)? {
            TypeRef::Node(def) => {
                let loc = RecordLocation {
                    file: "<delete>".to_string(),
                    line: 0,
                };
                let id = node_identity_id(def, identity, &loc)?;
                (id, WritePlan::for_node(&self.ontology, def))
            }
            TypeRef::Edge(def) => {
                let record = FlatRecord {
                    op: RecordOp::Delete,
                    from: identity.get("from").and_then(|v| v.as_object()).cloned(),
                    to: identity.get("to").and_then(|v| v.as_object()).cloned(),
                    values: identity.clone(),
                    ..Default::default()
                };
                let loc = RecordLocation {
                    file: "<delete>".to_string(),
                    line: 0,
                };
                let id = self.edge_identity_id(def, &record, &loc)?;
                (id, WritePlan::for_edge(def))
            }
        };

        self.db
            .write_transaction(move |conn| async move {
                let existed = plan.apply_delete(&conn, id).await?;
                mark_loaded(&conn, &plan.table).await?;
                Ok::<_, EngineError>(existed)
            })
            .await
    }

    /// Current ledger entry for a type, if any activity has been recorded.
    pub async fn status(&self, type_name: &str) -> Result<Option<LedgerEntry>, EngineError> {
        let table = self.lookup(type_name)?.table_name().to_string();
        self.db
            .read(|conn| async move {
                let sql = format!(
                    "SELECT table_name, last_load_at, last_index_at, last_dump_at, divergent
                     FROM {SYNC_LEDGER_TABLE} WHERE table_name = ?"
                );
                let rows = query_all(&conn, &sql, vec![libsql::Value::Text(table)], 5).await?;
                Ok(rows.into_iter().next().map(|row| LedgerEntry {
                    table_name: text_of(&row[0]),
                    last_load_at: opt_text_of(&row[1]),
                    last_index_at: opt_text_of(&row[2]),
                    last_dump_at: opt_text_of(&row[3]),
                    divergent: matches!(row[4], libsql::Value::Integer(n) if n != 0),
                }))
            })
            .await
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

    // ------------------------------------------------------------------
    // Reading flat files
    // ------------------------------------------------------------------

    /// Read every `*.jsonl` file of a type directory, in file-name order.
    fn read_type_dir(
        &self,
        type_name: &str,
    ) -> Result<Vec<(FlatRecord, RecordLocation)>, EngineError> {
        let dir = self.type_dir(type_name);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut files: Vec<PathBuf> = std::fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().map(|e| e == "jsonl").unwrap_or(false))
            .collect();
        files.sort();

        let mut records = Vec::new();
        for path in files {
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let content = std::fs::read_to_string(&path)?;
            for (index, line) in content.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let location = RecordLocation {
                    file: file_name.clone(),
                    line: index + 1,
                };
                let record: FlatRecord = serde_json::from_str(line).map_err(|e| {
                    EngineError::validation(type_name, &location, format!("malformed record: {}", e))
                })?;
                records.push((record, location));
            }
        }
        Ok(records)
    }

    // ------------------------------------------------------------------
    // Preparing records (all validation and id derivation happens here,
    // before the write transaction is entered)
    // ------------------------------------------------------------------

    fn prepare_node_records(
        &self,
        def: &NodeTypeDef,
        records: Vec<(FlatRecord, RecordLocation)>,
    ) -> Result<Vec<PreparedOp>, EngineError> {
        let mut ops = Vec::with_capacity(records.len());
        for (record, location) in records {
            if record.from.is_some() || record.to.is_some() {
                return Err(EngineError::validation(
                    &def.name,
                    &location,
                    "node record cannot carry from/to endpoints",
                ));
            }
            let id = node_identity_id(def, &record.values, &location)?;
            match record.op {
                RecordOp::Delete => ops.push(PreparedOp::Delete(id)),
                RecordOp::Upsert => {
                    let columns = convert_fields(&def.name, &def.fields, &record, &location)?;
                    ops.push(PreparedOp::Upsert(PreparedUpsert {
                        id,
                        created_at: record.created_at,
                        updated_at: record.updated_at,
                        endpoints: None,
                        columns,
                        location,
                    }));
                }
            }
        }
        Ok(ops)
    }

    fn prepare_edge_records(
        &self,
        def: &EdgeTypeDef,
        records: Vec<(FlatRecord, RecordLocation)>,
    ) -> Result<Vec<PreparedOp>, EngineError> {
        let mut ops = Vec::with_capacity(records.len());
        for (record, location) in records {
            let id = self.edge_identity_id(def, &record, &location)?;
            match record.op {
                RecordOp::Delete => ops.push(PreparedOp::Delete(id)),
                RecordOp::Upsert => {
                    let (from_id, to_id) = self.edge_endpoint_ids(def, &record, &location)?;
                    let columns = convert_fields(&def.name, &def.fields, &record, &location)?;
                    ops.push(PreparedOp::Upsert(PreparedUpsert {
                        id,
                        created_at: record.created_at,
                        updated_at: record.updated_at,
                        endpoints: Some((from_id, to_id)),
                        columns,
                        location,
                    }));
                }
            }
        }
        Ok(ops)
    }

    /// Endpoint ids of an edge record, derived from the `from`/`to`
    /// identity objects.
    fn edge_endpoint_ids(
        &self,
        def: &EdgeTypeDef,
        record: &FlatRecord,
        location: &RecordLocation,
    ) -> Result<(i64, i64), EngineError> {
        let mut ids = [0i64; 2];
        for (slot, (endpoint, type_name)) in [
            (record.from.as_ref(), &def.from),
            (record.to.as_ref(), &def.to),
        ]
        .into_iter()
        .enumerate()
        {
            let endpoint = endpoint.ok_or_else(|| {
                EngineError::validation(
                    &def.name,
                    location,
                    format!(
                        "edge record missing '{}' endpoint object",
                        if slot == 0 { "from" } else { "to" }
                    ),
                )
            })?;
            // Endpoint types are validated at startup; the lookup cannot fail
            let node_def = self
                .ontology
                .node_type(type_name)
                .ok_or_else(|| EngineError::unknown_type(type_name))?;
            ids[slot] = node_identity_id(node_def, endpoint, location)?;
        }
        Ok((ids[0], ids[1]))
    }

    /// Deterministic id of an edge record: endpoint pair plus any declared
    /// identity fields of the edge itself.
    fn edge_identity_id(
        &self,
        def: &EdgeTypeDef,
        record: &FlatRecord,
        location: &RecordLocation,
    ) -> Result<i64, EngineError> {
        let (from_id, to_id) = self.edge_endpoint_ids(def, record, location)?;
        let mut parts = vec![from_id.to_string(), to_id.to_string()];
        for field in &def.id_fields {
            let value = record.values.get(field).filter(|v| !v.is_null()).ok_or_else(|| {
                EngineError::validation(
                    &def.name,
                    location,
                    format!("missing identity field '{}'", field),
                )
            })?;
            parts.push(canonical_value(value));
        }
        Ok(derive_id(&def.name, &parts))
    }

    // ------------------------------------------------------------------
    // Export
    // ------------------------------------------------------------------

    async fn export_node_lines(&self, def: &NodeTypeDef) -> Result<Vec<String>, EngineError> {
        let select = node_select_list(def);
        let order = def.id_fields.join(", ");
        let sql = format!(
            "SELECT {select} FROM {} ORDER BY {order}, id",
            def.table()
        );
        let width = 3 + def.fields.len();
        let fields = def.fields.clone();
        let rows = self
            .db
            .read(|conn| async move { query_all(&conn, &sql, Vec::new(), width).await })
            .await?;

        let mut lines = Vec::with_capacity(rows.len());
        for row in rows {
            let record = row_to_record(&fields, &row, None, None);
            lines.push(
                serde_json::to_string(&record)
                    .map_err(|e| EngineError::serialization(e.to_string()))?,
            );
        }
        Ok(lines)
    }

    async fn export_edge_lines(&self, def: &EdgeTypeDef) -> Result<Vec<String>, EngineError> {
        let select = edge_select_list(def);
        let sql = format!(
            "SELECT {select} FROM {} ORDER BY from_id, to_id, id",
            def.table()
        );
        let width = 5 + def.fields.len();
        let rows = self
            .db
            .read(|conn| async move { query_all(&conn, &sql, Vec::new(), width).await })
            .await?;

        // Resolve endpoint ids back to their identity objects
        let from_ids: BTreeSet<i64> = rows.iter().filter_map(|r| int_of(&r[1])).collect();
        let to_ids: BTreeSet<i64> = rows.iter().filter_map(|r| int_of(&r[2])).collect();
        let from_def = self
            .ontology
            .node_type(&def.from)
            .ok_or_else(|| EngineError::unknown_type(&def.from))?;
        let to_def = self
            .ontology
            .node_type(&def.to)
            .ok_or_else(|| EngineError::unknown_type(&def.to))?;
        let from_map = self.identity_objects(from_def, &from_ids).await?;
        let to_map = self.identity_objects(to_def, &to_ids).await?;

        let mut lines = Vec::with_capacity(rows.len());
        for row in rows {
            let from_id = int_of(&row[1]).unwrap_or_default();
            let to_id = int_of(&row[2]).unwrap_or_default();
            let from = from_map.get(&from_id).cloned().ok_or_else(|| {
                EngineError::sync_failed(format!(
                    "edge {} {} references missing {} node {}",
                    def.name,
                    int_of(&row[0]).unwrap_or_default(),
                    def.from,
                    from_id
                ))
            })?;
            let to = to_map.get(&to_id).cloned().ok_or_else(|| {
                EngineError::sync_failed(format!(
                    "edge {} {} references missing {} node {}",
                    def.name,
                    int_of(&row[0]).unwrap_or_default(),
                    def.to,
                    to_id
                ))
            })?;
            // Row layout: id, from_id, to_id, created_at, updated_at, fields...
            let mut trimmed = vec![row[0].clone(), row[3].clone(), row[4].clone()];
            trimmed.extend_from_slice(&row[5..]);
            let record = row_to_record(&def.fields, &trimmed, Some(from), Some(to));
            lines.push(
                serde_json::to_string(&record)
                    .map_err(|e| EngineError::serialization(e.to_string()))?,
            );
        }
        Ok(lines)
    }

    /// Fetch the identity-field objects for a set of node ids.
    async fn identity_objects(
        &self,
        def: &NodeTypeDef,
        ids: &BTreeSet<i64>,
    ) -> Result<std::collections::HashMap<i64, Map<String, Value>>, EngineError> {
        if ids.is_empty() {
            return Ok(Default::default());
        }
        let id_fields = def.id_fields.clone();
        // Identity fields are checked against the schema at startup
        let field_defs: Vec<_> = id_fields
            .iter()
            .filter_map(|name| def.field(name).cloned())
            .collect();
        let sql = format!(
            "SELECT id, {} FROM {} WHERE id IN ({})",
            id_fields.join(", "),
            def.table(),
            placeholders(ids.len())
        );
        let params: Vec<libsql::Value> = ids.iter().map(|id| libsql::Value::Integer(*id)).collect();
        let width = 1 + id_fields.len();
        let rows = self
            .db
            .read(|conn| async move { query_all(&conn, &sql, params, width).await })
            .await?;

        let mut result = std::collections::HashMap::new();
        for row in rows {
            let id = int_of(&row[0]).unwrap_or_default();
            let mut object = Map::new();
            for (i, field) in field_defs.iter().enumerate() {
                object.insert(
                    field.name.clone(),
                    sql_to_json(field.field_type, row[i + 1].clone()),
                );
            }
            result.insert(id, object);
        }
        Ok(result)
    }

    // ------------------------------------------------------------------
    // Atomic directory swap
    // ------------------------------------------------------------------

    /// Write `lines` into a staging directory and swap it with the live
    /// directory. The canonical path always holds either the previous or
    /// the new complete export.
    fn swap_in(&self, type_name: &str, live: &Path, lines: Vec<String>) -> Result<(), EngineError> {
        std::fs::create_dir_all(&self.data_dir)?;
        let stamp = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let staging = self.data_dir.join(format!(".staging_{type_name}_{stamp}"));
        let retired = self.data_dir.join(format!(".retired_{type_name}_{stamp}"));

        // Stage the full export; any failure here leaves the live dir alone
        std::fs::create_dir_all(&staging)?;
        let result = write_records_file(&staging, &lines);
        if let Err(err) = result {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(EngineError::sync_failed(format!(
                "staging write for '{}' failed: {}",
                type_name, err
            )));
        }

        let had_live = live.exists();
        if had_live {
            if let Err(err) = std::fs::rename(live, &retired) {
                let _ = std::fs::remove_dir_all(&staging);
                return Err(EngineError::sync_failed(format!(
                    "could not retire live directory for '{}': {}",
                    type_name, err
                )));
            }
        }

        if let Err(err) = std::fs::rename(&staging, live) {
            // Restore the previous export before reporting
            if had_live {
                if let Err(restore_err) = std::fs::rename(&retired, live) {
                    tracing::error!(
                        r#type = type_name,
                        "Failed to restore retired export after swap failure: {}",
                        restore_err
                    );
                }
            }
            let _ = std::fs::remove_dir_all(&staging);
            return Err(EngineError::sync_failed(format!(
                "directory swap for '{}' failed: {}",
                type_name, err
            )));
        }

        if had_live {
            // The new export is in place; the retired copy is disposable
            if let Err(err) = std::fs::remove_dir_all(&retired) {
                tracing::warn!(r#type = type_name, "Could not remove retired export: {}", err);
            }
        }
        Ok(())
    }
}

impl<'a> TypeRef<'a> {
    fn table_name(&self) -> &'a str {
        match self {
            TypeRef::Node(n) => n.table(),
            TypeRef::Edge(e) => e.table(),
        }
    }
}

// ----------------------------------------------------------------------
// Write plan: owned description of the SQL a load needs, movable into the
// write-transaction closure
// ----------------------------------------------------------------------

struct WritePlan {
    type_name: String,
    table: String,
    field_names: Vec<String>,
    /// `(from_table, to_table)` for edges; drives referential validation
    endpoint_tables: Option<(String, String)>,
    /// Edge tables referencing this node type, as `(table, column)` pairs;
    /// drives cascade deletion
    cascade: Vec<(String, String)>,
}

impl WritePlan {
    fn for_node(ontology: &Ontology, def: &NodeTypeDef) -> Self {
        let mut cascade = Vec::new();
        for edge in &ontology.edge_types {
            if edge.from == def.name {
                cascade.push((edge.table().to_string(), "from_id".to_string()));
            }
            if edge.to == def.name {
                cascade.push((edge.table().to_string(), "to_id".to_string()));
            }
        }
        Self {
            type_name: def.name.clone(),
            table: def.table().to_string(),
            field_names: def.fields.iter().map(|f| f.name.clone()).collect(),
            endpoint_tables: None,
            cascade,
        }
    }

    fn for_edge(def: &EdgeTypeDef) -> Self {
        Self {
            type_name: def.name.clone(),
            table: def.table().to_string(),
            field_names: def.fields.iter().map(|f| f.name.clone()).collect(),
            endpoint_tables: Some((def.from.clone(), def.to.clone())),
            cascade: Vec::new(),
        }
    }

    /// Referential integrity check for edge upserts, inside the transaction
    /// so rows inserted earlier in it count.
    async fn validate_endpoints(
        &self,
        conn: &Connection,
        upsert: &PreparedUpsert,
    ) -> Result<(), EngineError> {
        let (Some((from_table, to_table)), Some((from_id, to_id))) =
            (&self.endpoint_tables, upsert.endpoints)
        else {
            return Ok(());
        };
        for (table, id, side) in [(from_table, from_id, "from"), (to_table, to_id, "to")] {
            let sql = format!("SELECT 1 FROM {table} WHERE id = ?");
            let rows = query_all(conn, &sql, vec![libsql::Value::Integer(id)], 1).await?;
            if rows.is_empty() {
                return Err(EngineError::validation(
                    &self.type_name,
                    &upsert.location,
                    format!("{side} endpoint {table}/{id} does not exist"),
                ));
            }
        }
        Ok(())
    }

    async fn apply_upsert(
        &self,
        conn: &Connection,
        upsert: &PreparedUpsert,
    ) -> Result<(), EngineError> {
        let now = now_rfc3339();
        let created_explicit = upsert.created_at.is_some();

        let mut columns = vec!["id", "created_at", "updated_at"];
        let mut params = vec![
            libsql::Value::Integer(upsert.id),
            libsql::Value::Text(upsert.created_at.clone().unwrap_or_else(|| now.clone())),
            libsql::Value::Text(upsert.updated_at.clone().unwrap_or_else(|| now.clone())),
        ];
        if let Some((from_id, to_id)) = upsert.endpoints {
            columns.push("from_id");
            columns.push("to_id");
            params.push(libsql::Value::Integer(from_id));
            params.push(libsql::Value::Integer(to_id));
        }
        for name in &self.field_names {
            columns.push(name);
        }
        params.extend(upsert.columns.iter().cloned());

        let mut updates: Vec<String> = vec!["updated_at = excluded.updated_at".to_string()];
        if created_explicit {
            // The file is authoritative for its own timestamps
            updates.push("created_at = excluded.created_at".to_string());
        }
        for name in &self.field_names {
            updates.push(format!("{name} = excluded.{name}"));
        }

        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT(id) DO UPDATE SET {}",
            self.table,
            columns.join(", "),
            placeholders(columns.len()),
            updates.join(", ")
        );
        execute(conn, &sql, params).await?;
        Ok(())
    }

    /// Delete one record with full cascade. Returns whether the row existed.
    async fn apply_delete(&self, conn: &Connection, id: i64) -> Result<bool, EngineError> {
        // Index rows of edges about to be cascaded, then the edges themselves
        for (edge_table, column) in &self.cascade {
            let sql = format!(
                "DELETE FROM {SEARCH_INDEX_TABLE}
                 WHERE source_table = ? AND source_id IN (SELECT id FROM {edge_table} WHERE {column} = ?)"
            );
            execute(
                conn,
                &sql,
                vec![
                    libsql::Value::Text(edge_table.clone()),
                    libsql::Value::Integer(id),
                ],
            )
            .await?;
            let sql = format!("DELETE FROM {edge_table} WHERE {column} = ?");
            execute(conn, &sql, vec![libsql::Value::Integer(id)]).await?;
        }

        let sql = format!("DELETE FROM {SEARCH_INDEX_TABLE} WHERE source_table = ? AND source_id = ?");
        execute(
            conn,
            &sql,
            vec![
                libsql::Value::Text(self.table.clone()),
                libsql::Value::Integer(id),
            ],
        )
        .await?;

        let sql = format!("DELETE FROM {} WHERE id = ?", self.table);
        let affected = execute(conn, &sql, vec![libsql::Value::Integer(id)]).await?;
        Ok(affected > 0)
    }
}

// ----------------------------------------------------------------------
// Shared helpers
// ----------------------------------------------------------------------

/// Derive the deterministic id of a node record from its identity fields.
fn node_identity_id(
    def: &NodeTypeDef,
    values: &Map<String, Value>,
    location: &RecordLocation,
) -> Result<i64, EngineError> {
    let mut parts = Vec::with_capacity(def.id_fields.len());
    for field in &def.id_fields {
        let value = values.get(field).filter(|v| !v.is_null()).ok_or_else(|| {
            EngineError::validation(
                &def.name,
                location,
                format!("missing identity field '{}'", field),
            )
        })?;
        parts.push(canonical_value(value));
    }
    Ok(derive_id(&def.name, &parts))
}

/// Convert a record's declared value fields into column values, rejecting
/// undeclared keys so file typos surface as validation errors.
fn convert_fields(
    type_name: &str,
    fields: &[crate::models::ontology::FieldDef],
    record: &FlatRecord,
    location: &RecordLocation,
) -> Result<Vec<libsql::Value>, EngineError> {
    for key in record.values.keys() {
        if !fields.iter().any(|f| &f.name == key) {
            return Err(EngineError::validation(
                type_name,
                location,
                format!("undeclared field '{}'", key),
            ));
        }
    }
    let mut columns = Vec::with_capacity(fields.len());
    for field in fields {
        let value = record.values.get(&field.name).unwrap_or(&Value::Null);
        let converted = json_to_sql(field.field_type, value).map_err(|detail| {
            EngineError::validation(
                type_name,
                location,
                format!("field '{}': {}", field.name, detail),
            )
        })?;
        columns.push(converted);
    }
    Ok(columns)
}

/// Rebuild a flat record from an exported row.
///
/// Row layout: `id, created_at, updated_at, fields...` (endpoints already
/// stripped for edges). Null columns are omitted from the output.
fn row_to_record(
    fields: &[crate::models::ontology::FieldDef],
    row: &[libsql::Value],
    from: Option<Map<String, Value>>,
    to: Option<Map<String, Value>>,
) -> FlatRecord {
    let mut values = Map::new();
    for (i, field) in fields.iter().enumerate() {
        let value = sql_to_json(field.field_type, row[i + 3].clone());
        if !value.is_null() {
            values.insert(field.name.clone(), value);
        }
    }
    FlatRecord {
        op: RecordOp::Upsert,
        id: int_of(&row[0]),
        created_at: opt_text_of(&row[1]),
        updated_at: opt_text_of(&row[2]),
        from,
        to,
        values,
    }
}

fn node_select_list(def: &NodeTypeDef) -> String {
    let mut list = vec!["id", "created_at", "updated_at"];
    list.extend(def.fields.iter().map(|f| f.name.as_str()));
    list.join(", ")
}

fn edge_select_list(def: &EdgeTypeDef) -> String {
    let mut list = vec!["id", "from_id", "to_id", "created_at", "updated_at"];
    list.extend(def.fields.iter().map(|f| f.name.as_str()));
    list.join(", ")
}

fn write_records_file(dir: &Path, lines: &[String]) -> std::io::Result<()> {
    use std::io::Write;
    let path = dir.join("records.jsonl");
    let mut file = std::fs::File::create(&path)?;
    for line in lines {
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
    }
    file.sync_all()
}

async fn mark_loaded(conn: &Connection, table: &str) -> Result<(), EngineError> {
    let sql = format!(
        "INSERT INTO {SYNC_LEDGER_TABLE} (table_name, last_load_at, divergent) VALUES (?, ?, TRUE)
         ON CONFLICT(table_name) DO UPDATE SET last_load_at = excluded.last_load_at, divergent = TRUE"
    );
    execute(
        conn,
        &sql,
        vec![
            libsql::Value::Text(table.to_string()),
            libsql::Value::Text(now_rfc3339()),
        ],
    )
    .await?;
    Ok(())
}

async fn mark_dumped(conn: &Connection, table: &str) -> Result<(), EngineError> {
    let sql = format!(
        "INSERT INTO {SYNC_LEDGER_TABLE} (table_name, last_dump_at, divergent) VALUES (?, ?, FALSE)
         ON CONFLICT(table_name) DO UPDATE SET last_dump_at = excluded.last_dump_at, divergent = FALSE"
    );
    execute(
        conn,
        &sql,
        vec![
            libsql::Value::Text(table.to_string()),
            libsql::Value::Text(now_rfc3339()),
        ],
    )
    .await?;
    Ok(())
}

/// Record the time of an index rebuild in the ledger.
pub(crate) async fn mark_indexed(conn: &Connection, table: &str) -> Result<(), EngineError> {
    let sql = format!(
        "INSERT INTO {SYNC_LEDGER_TABLE} (table_name, last_index_at) VALUES (?, ?)
         ON CONFLICT(table_name) DO UPDATE SET last_index_at = excluded.last_index_at"
    );
    execute(
        conn,
        &sql,
        vec![
            libsql::Value::Text(table.to_string()),
            libsql::Value::Text(now_rfc3339()),
        ],
    )
    .await?;
    Ok(())
}

pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

pub(crate) async fn execute(
    conn: &Connection,
    sql: &str,
    params: Vec<libsql::Value>,
) -> Result<u64, EngineError> {
    conn.execute(sql, libsql::params_from_iter(params))
        .await
        .map_err(|e| {
            EngineError::from(DatabaseError::sql_execution(format!(
                "Failed to execute '{}': {}",
                sql, e
            )))
        })
}

/// Run a query and collect every row as a fixed-width value vector.
///
/// `width` is the length of the SELECT list; callers always know it because
/// they build the statement.
pub(crate) async fn query_all(
    conn: &Connection,
    sql: &str,
    params: Vec<libsql::Value>,
    width: usize,
) -> Result<Vec<Vec<libsql::Value>>, EngineError> {
    let mut stmt = conn.prepare(sql).await.map_err(|e| {
        EngineError::from(DatabaseError::sql_execution(format!(
            "Failed to prepare '{}': {}",
            sql, e
        )))
    })?;
    let mut rows = stmt
        .query(libsql::params_from_iter(params))
        .await
        .map_err(|e| {
            EngineError::from(DatabaseError::sql_execution(format!(
                "Failed to query '{}': {}",
                sql, e
            )))
        })?;

    let mut result = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| EngineError::from(DatabaseError::sql_execution(e.to_string())))?
    {
        let mut values = Vec::with_capacity(width);
        for i in 0..width {
            values.push(row.get_value(i as i32).map_err(|e| {
                EngineError::from(DatabaseError::sql_execution(format!(
                    "Failed to read column {}: {}",
                    i, e
                )))
            })?);
        }
        result.push(values);
    }
    Ok(result)
}

pub(crate) fn int_of(value: &libsql::Value) -> Option<i64> {
    match value {
        libsql::Value::Integer(n) => Some(*n),
        _ => None,
    }
}

pub(crate) fn text_of(value: &libsql::Value) -> String {
    match value {
        libsql::Value::Text(s) => s.clone(),
        other => raw_to_json(other.clone()).to_string(),
    }
}

pub(crate) fn opt_text_of(value: &libsql::Value) -> Option<String> {
    match value {
        libsql::Value::Text(s) => Some(s.clone()),
        _ => None,
    }
}
