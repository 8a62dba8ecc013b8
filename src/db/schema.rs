//! Ontology-to-Schema Compiler
//!
//! Turns the validated ontology into DDL for the embedded engine: one
//! `CREATE TABLE IF NOT EXISTS` per node/edge type plus the internal tables
//! (search index, resolve cache, sync ledger) and the secondary indexes the
//! type declarations hint at. All statements are idempotent, so applying the
//! schema on every startup is safe.
//!
//! Identifier safety: `Ontology::validate` has already rejected any table or
//! column name that is not a plain identifier, which is what makes the
//! string interpolation here sound.

use crate::db::database::DatabaseService;
use crate::db::error::DatabaseError;
use crate::models::ontology::{Cardinality, EdgeTypeDef, NodeTypeDef, Ontology};

/// Name of the unified search-index table.
pub const SEARCH_INDEX_TABLE: &str = "search_index";

/// Name of the content-hash resolve cache table.
pub const RESOLVE_CACHE_TABLE: &str = "resolve_cache";

/// Name of the per-table sync ledger.
pub const SYNC_LEDGER_TABLE: &str = "sync_ledger";

/// Compile the ontology into the full ordered DDL statement list.
pub fn compile(ontology: &Ontology) -> Vec<String> {
    let mut statements = Vec::new();

    for node in &ontology.node_types {
        statements.push(node_table_ddl(node));
    }
    for edge in &ontology.edge_types {
        statements.push(edge_table_ddl(edge));
        statements.extend(edge_index_ddl(edge));
    }
    statements.extend(internal_table_ddl());
    statements
}

/// Apply the compiled schema through the write slot. Idempotent.
pub async fn apply(db: &DatabaseService, ontology: &Ontology) -> Result<(), DatabaseError> {
    let statements = compile(ontology);
    db.write(|conn| async move {
        for statement in &statements {
            conn.execute(statement, ()).await.map_err(|e| {
                DatabaseError::sql_execution(format!(
                    "Failed to apply schema statement '{}': {}",
                    statement, e
                ))
            })?;
        }
        Ok::<_, DatabaseError>(())
    })
    .await?;
    tracing::debug!(
        tables = ontology.node_types.len() + ontology.edge_types.len(),
        "Schema applied"
    );
    Ok(())
}

fn node_table_ddl(node: &NodeTypeDef) -> String {
    let mut columns = vec![
        "id INTEGER PRIMARY KEY".to_string(),
        "created_at DATETIME NOT NULL".to_string(),
        "updated_at DATETIME NOT NULL".to_string(),
    ];
    for field in &node.fields {
        columns.push(format!("{} {}", field.name, field.field_type.column_type()));
    }
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
        node.table(),
        columns.join(",\n    ")
    )
}

fn edge_table_ddl(edge: &EdgeTypeDef) -> String {
    let mut columns = vec![
        "id INTEGER PRIMARY KEY".to_string(),
        "from_id INTEGER NOT NULL".to_string(),
        "to_id INTEGER NOT NULL".to_string(),
        "created_at DATETIME NOT NULL".to_string(),
        "updated_at DATETIME NOT NULL".to_string(),
    ];
    for field in &edge.fields {
        columns.push(format!("{} {}", field.name, field.field_type.column_type()));
    }
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
        edge.table(),
        columns.join(",\n    ")
    )
}

/// Secondary indexes for an edge table: traversal indexes when hinted, and
/// uniqueness constraints implied by the declared cardinality.
fn edge_index_ddl(edge: &EdgeTypeDef) -> Vec<String> {
    let table = edge.table();
    let mut statements = Vec::new();

    if edge.index_from {
        statements.push(format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_from ON {table}(from_id)"
        ));
    }
    if edge.index_to {
        statements.push(format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_to ON {table}(to_id)"
        ));
    }

    match edge.cardinality {
        Cardinality::OneToOne => {
            statements.push(format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS uniq_{table}_from ON {table}(from_id)"
            ));
            statements.push(format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS uniq_{table}_to ON {table}(to_id)"
            ));
        }
        Cardinality::OneToMany => {
            // Each target has exactly one source
            statements.push(format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS uniq_{table}_to ON {table}(to_id)"
            ));
        }
        Cardinality::ManyToMany => {}
    }

    statements
}

fn internal_table_ddl() -> Vec<String> {
    vec![
        format!(
            "CREATE TABLE IF NOT EXISTS {SEARCH_INDEX_TABLE} (
    source_table TEXT NOT NULL,
    source_id INTEGER NOT NULL,
    source_field TEXT NOT NULL,
    chunk_seq INTEGER NOT NULL,
    content TEXT NOT NULL,
    lexical_form TEXT,
    vector BLOB,
    content_hash TEXT NOT NULL,
    created_at DATETIME NOT NULL,
    PRIMARY KEY (source_table, source_id, source_field, chunk_seq)
)"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_search_index_source
             ON {SEARCH_INDEX_TABLE}(source_table, source_id)"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {RESOLVE_CACHE_TABLE} (
    content_hash TEXT PRIMARY KEY,
    lexical_form TEXT,
    vector BLOB,
    last_used DATETIME NOT NULL
)"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {SYNC_LEDGER_TABLE} (
    table_name TEXT PRIMARY KEY,
    last_load_at DATETIME,
    last_index_at DATETIME,
    last_dump_at DATETIME,
    divergent BOOLEAN NOT NULL DEFAULT FALSE
)"
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ontology::{FieldDef, FieldType};

    fn ontology() -> Ontology {
        Ontology {
            node_types: vec![NodeTypeDef {
                name: "article".to_string(),
                table: None,
                id_fields: vec!["slug".to_string()],
                fields: vec![
                    FieldDef::new("slug", FieldType::Text),
                    FieldDef::new("body", FieldType::Text).with_index(true, true),
                    FieldDef::new("views", FieldType::Integer),
                    FieldDef::new("rating", FieldType::Number),
                    FieldDef::new("published", FieldType::Boolean),
                    FieldDef::new("tags", FieldType::Array),
                    FieldDef::new("meta", FieldType::Object),
                    FieldDef::new("written_at", FieldType::DateTime),
                ],
            }],
            edge_types: vec![EdgeTypeDef {
                name: "cites".to_string(),
                table: None,
                from: "article".to_string(),
                to: "article".to_string(),
                cardinality: Cardinality::ManyToMany,
                id_fields: vec![],
                fields: vec![FieldDef::new("context", FieldType::Text)],
                index_from: true,
                index_to: false,
            }],
        }
    }

    #[test]
    fn node_ddl_declares_reserved_and_mapped_columns() {
        let ddl = node_table_ddl(&ontology().node_types[0]);
        assert!(ddl.starts_with("CREATE TABLE IF NOT EXISTS article"));
        assert!(ddl.contains("id INTEGER PRIMARY KEY"));
        assert!(ddl.contains("created_at DATETIME NOT NULL"));
        assert!(ddl.contains("slug TEXT"));
        assert!(ddl.contains("views INTEGER"));
        assert!(ddl.contains("rating REAL"));
        assert!(ddl.contains("published BOOLEAN"));
        assert!(ddl.contains("tags JSON"));
        assert!(ddl.contains("meta JSON"));
        assert!(ddl.contains("written_at DATETIME"));
    }

    #[test]
    fn edge_ddl_declares_endpoint_columns_and_hinted_indexes() {
        let ontology = ontology();
        let ddl = edge_table_ddl(&ontology.edge_types[0]);
        assert!(ddl.contains("from_id INTEGER NOT NULL"));
        assert!(ddl.contains("to_id INTEGER NOT NULL"));

        let indexes = edge_index_ddl(&ontology.edge_types[0]);
        assert!(indexes.iter().any(|s| s.contains("idx_cites_from")));
        assert!(
            !indexes.iter().any(|s| s.contains("idx_cites_to")),
            "unhinted to_id index must not be generated"
        );
    }

    #[test]
    fn one_to_many_cardinality_constrains_target() {
        let mut ontology = ontology();
        ontology.edge_types[0].cardinality = Cardinality::OneToMany;
        let indexes = edge_index_ddl(&ontology.edge_types[0]);
        assert!(indexes.iter().any(|s| s.contains("uniq_cites_to")));
        assert!(!indexes.iter().any(|s| s.contains("uniq_cites_from")));
    }

    #[test]
    fn compile_includes_internal_tables() {
        let statements = compile(&ontology());
        let all = statements.join("\n");
        assert!(all.contains(SEARCH_INDEX_TABLE));
        assert!(all.contains(RESOLVE_CACHE_TABLE));
        assert!(all.contains(SYNC_LEDGER_TABLE));
    }

    #[tokio::test]
    async fn apply_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = DatabaseService::new(dir.path().join("test.db")).await.unwrap();
        let ontology = ontology();
        apply(&db, &ontology).await.unwrap();
        apply(&db, &ontology).await.unwrap();
    }
}
