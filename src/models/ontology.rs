//! Ontology Declarations
//!
//! The ontology is the set of typed node/edge declarations that describe the
//! graph's schema. It is supplied fully parsed by the embedding application
//! (this crate does not read configuration files), validated once at startup,
//! and immutable afterwards.
//!
//! Every declared type is backed by one table carrying three reserved columns
//! (`id`, `created_at`, `updated_at`); edge tables additionally carry
//! `from_id`/`to_id`. Record ids are never assigned by the database - they are
//! derived from the identity-field values with a stable hash, so re-importing
//! identical source data always reproduces identical ids.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Separator byte between hash inputs (ASCII unit separator).
///
/// Prevents ambiguity between e.g. `("ab", "c")` and `("a", "bc")` when
/// identity values are concatenated into the hash stream.
const HASH_SEPARATOR: u8 = 0x1f;

/// Errors raised while validating an ontology at startup.
///
/// All of these are fatal: an engine cannot be opened over a malformed
/// ontology, and there is no per-record recovery path.
#[derive(Error, Debug)]
pub enum SchemaError {
    /// Semantic type name not in the supported set
    #[error("Unsupported semantic type '{type_name}' for field '{field}' of '{owner}'")]
    UnsupportedType {
        owner: String,
        field: String,
        type_name: String,
    },

    /// Table or column name unsafe to interpolate into SQL
    #[error("Invalid identifier '{identifier}' in '{owner}'")]
    InvalidIdentifier { owner: String, identifier: String },

    /// Edge references a node type that is not declared
    #[error("Edge type '{edge}' references undeclared node type '{node}'")]
    UnknownNodeType { edge: String, node: String },

    /// A type declares no identity fields
    #[error("Type '{0}' declares no identity fields")]
    EmptyIdentity(String),

    /// An identity field is not part of the value schema
    #[error("Identity field '{field}' of '{owner}' is not declared in its schema")]
    UnknownIdentityField { owner: String, field: String },

    /// Two types share a backing table
    #[error("Duplicate backing table '{0}'")]
    DuplicateTable(String),
}

/// Semantic field types supported by the schema compiler.
///
/// Closed set: the configuration loader maps its own type vocabulary onto
/// this enum via [`FieldType::parse`]; an unknown name is a fatal
/// [`SchemaError::UnsupportedType`] at startup, never a per-record error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FieldType {
    Text,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
    DateTime,
}

impl FieldType {
    /// Parse a semantic type name as supplied by the configuration loader.
    pub fn parse(owner: &str, field: &str, name: &str) -> Result<Self, SchemaError> {
        match name {
            "string" | "text" => Ok(Self::Text),
            "integer" => Ok(Self::Integer),
            "number" => Ok(Self::Number),
            "boolean" => Ok(Self::Boolean),
            "object" => Ok(Self::Object),
            "array" => Ok(Self::Array),
            "date-time" => Ok(Self::DateTime),
            other => Err(SchemaError::UnsupportedType {
                owner: owner.to_string(),
                field: field.to_string(),
                type_name: other.to_string(),
            }),
        }
    }

    /// SQL column type this semantic type maps to.
    pub fn column_type(&self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Integer => "INTEGER",
            Self::Number => "REAL",
            Self::Boolean => "BOOLEAN",
            Self::Object | Self::Array => "JSON",
            Self::DateTime => "DATETIME",
        }
    }
}

/// Which derived search signals a text field feeds.
///
/// A field may request only a lexical form, only an embedding vector, or
/// both. Fields without an index config never reach the search index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldIndex {
    #[serde(default)]
    pub lexical: bool,
    #[serde(default)]
    pub vector: bool,
}

/// One field of a node or edge value schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    /// Search-index configuration; only meaningful for `Text` fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<FieldIndex>,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            index: None,
        }
    }

    /// Builder-style index configuration.
    pub fn with_index(mut self, lexical: bool, vector: bool) -> Self {
        self.index = Some(FieldIndex { lexical, vector });
        self
    }
}

/// Declared cardinality of an edge type.
///
/// Compiled into uniqueness constraints on the edge table: `OneToOne`
/// restricts both endpoints to a single edge, `OneToMany` restricts each
/// target to one source. `ManyToMany` adds no constraint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    OneToOne,
    OneToMany,
    #[default]
    ManyToMany,
}

/// Declaration of a node type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeTypeDef {
    /// Type name as used by callers and flat-file directories
    pub name: String,
    /// Backing table name override; defaults to the type name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    /// Natural-key fields, in declared order (the order feeds the id hash)
    pub id_fields: Vec<String>,
    /// Value schema
    pub fields: Vec<FieldDef>,
}

impl NodeTypeDef {
    pub fn table(&self) -> &str {
        self.table.as_deref().unwrap_or(&self.name)
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Text fields configured for the search index.
    pub fn indexed_fields(&self) -> impl Iterator<Item = (&FieldDef, FieldIndex)> {
        self.fields.iter().filter_map(|f| {
            match (f.field_type, f.index) {
                (FieldType::Text, Some(idx)) if idx.lexical || idx.vector => Some((f, idx)),
                _ => None,
            }
        })
    }
}

/// Declaration of an edge type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeTypeDef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    /// Source node type name
    pub from: String,
    /// Target node type name
    pub to: String,
    #[serde(default)]
    pub cardinality: Cardinality,
    /// Additional identity fields beyond the endpoint pair
    #[serde(default)]
    pub id_fields: Vec<String>,
    #[serde(default)]
    pub fields: Vec<FieldDef>,
    /// Index hint for the `from_id` column
    #[serde(default = "default_true")]
    pub index_from: bool,
    /// Index hint for the `to_id` column
    #[serde(default = "default_true")]
    pub index_to: bool,
}

fn default_true() -> bool {
    true
}

impl EdgeTypeDef {
    pub fn table(&self) -> &str {
        self.table.as_deref().unwrap_or(&self.name)
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn indexed_fields(&self) -> impl Iterator<Item = (&FieldDef, FieldIndex)> {
        self.fields.iter().filter_map(|f| {
            match (f.field_type, f.index) {
                (FieldType::Text, Some(idx)) if idx.lexical || idx.vector => Some((f, idx)),
                _ => None,
            }
        })
    }
}

/// A full ontology: the set of node and edge type declarations.
///
/// Validated once via [`Ontology::validate`] before an engine is opened.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Ontology {
    pub node_types: Vec<NodeTypeDef>,
    pub edge_types: Vec<EdgeTypeDef>,
}

impl Ontology {
    pub fn node_type(&self, name: &str) -> Option<&NodeTypeDef> {
        self.node_types.iter().find(|t| t.name == name)
    }

    pub fn edge_type(&self, name: &str) -> Option<&EdgeTypeDef> {
        self.edge_types.iter().find(|t| t.name == name)
    }

    /// Edge types whose source or target is the given node type, optionally
    /// restricted to a caller-supplied name filter.
    pub fn edges_touching<'a>(
        &'a self,
        node_type: &'a str,
        filter: Option<&'a [String]>,
    ) -> impl Iterator<Item = &'a EdgeTypeDef> {
        self.edge_types.iter().filter(move |e| {
            (e.from == node_type || e.to == node_type)
                && filter.map(|f| f.iter().any(|n| n == &e.name)).unwrap_or(true)
        })
    }

    /// Look up which declared type backs a table name.
    pub fn type_for_table(&self, table: &str) -> Option<TypeRef<'_>> {
        if let Some(n) = self.node_types.iter().find(|t| t.table() == table) {
            return Some(TypeRef::Node(n));
        }
        self.edge_types
            .iter()
            .find(|t| t.table() == table)
            .map(TypeRef::Edge)
    }

    /// Validate the whole ontology. Fatal at startup on any error.
    ///
    /// Checks identifier safety (names are interpolated into DDL), identity
    /// field presence, edge endpoint resolution, and table uniqueness.
    pub fn validate(&self) -> Result<(), SchemaError> {
        let mut tables = std::collections::HashSet::new();

        for node in &self.node_types {
            validate_identifier(&node.name, node.table())?;
            if node.id_fields.is_empty() {
                return Err(SchemaError::EmptyIdentity(node.name.clone()));
            }
            for field in &node.fields {
                validate_identifier(&node.name, &field.name)?;
            }
            for id_field in &node.id_fields {
                if node.field(id_field).is_none() {
                    return Err(SchemaError::UnknownIdentityField {
                        owner: node.name.clone(),
                        field: id_field.clone(),
                    });
                }
            }
            if !tables.insert(node.table().to_string()) {
                return Err(SchemaError::DuplicateTable(node.table().to_string()));
            }
        }

        for edge in &self.edge_types {
            validate_identifier(&edge.name, edge.table())?;
            for field in &edge.fields {
                validate_identifier(&edge.name, &field.name)?;
            }
            for id_field in &edge.id_fields {
                if edge.field(id_field).is_none() {
                    return Err(SchemaError::UnknownIdentityField {
                        owner: edge.name.clone(),
                        field: id_field.clone(),
                    });
                }
            }
            for endpoint in [&edge.from, &edge.to] {
                if self.node_type(endpoint).is_none() {
                    return Err(SchemaError::UnknownNodeType {
                        edge: edge.name.clone(),
                        node: endpoint.clone(),
                    });
                }
            }
            if !tables.insert(edge.table().to_string()) {
                return Err(SchemaError::DuplicateTable(edge.table().to_string()));
            }
        }

        Ok(())
    }
}

/// Either side of the node/edge type split, resolved from a table name.
#[derive(Debug, Clone, Copy)]
pub enum TypeRef<'a> {
    Node(&'a NodeTypeDef),
    Edge(&'a EdgeTypeDef),
}

impl<'a> TypeRef<'a> {
    pub fn name(&self) -> &'a str {
        match self {
            TypeRef::Node(n) => &n.name,
            TypeRef::Edge(e) => &e.name,
        }
    }
}

/// Check that a name is safe to interpolate into SQL as an identifier.
///
/// ASCII alphanumerics and underscores only, must not start with a digit.
/// Same discipline the DDL generator applies to every table and column name.
pub fn validate_identifier(owner: &str, identifier: &str) -> Result<(), SchemaError> {
    let valid = identifier
        .chars()
        .next()
        .is_some_and(|c| !c.is_ascii_digit())
        && identifier
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(SchemaError::InvalidIdentifier {
            owner: owner.to_string(),
            identifier: identifier.to_string(),
        })
    }
}

/// Derive the deterministic 64-bit id for a record.
///
/// Hashes the type name and the canonical identity values (declared order)
/// with SHA-256, then truncates to a non-negative i64. Stable across
/// platforms and process runs: identical identity values always produce the
/// identical id, which is what makes re-imports reproducible and exports
/// diff-minimal.
pub fn derive_id(type_name: &str, identity_values: &[String]) -> i64 {
    let mut hasher = Sha256::new();
    hasher.update(type_name.as_bytes());
    for value in identity_values {
        hasher.update([HASH_SEPARATOR]);
        hasher.update(value.as_bytes());
    }
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    // Clear the sign bit so ids are always non-negative
    i64::from_be_bytes(bytes) & i64::MAX
}

/// Canonical text form of an identity-field value for hashing and ordering.
///
/// Strings are used verbatim (no JSON quoting, so hashes do not depend on a
/// serializer); other scalar JSON values use their JSON rendering.
pub fn canonical_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_ontology() -> Ontology {
        Ontology {
            node_types: vec![NodeTypeDef {
                name: "person".to_string(),
                table: None,
                id_fields: vec!["name".to_string()],
                fields: vec![
                    FieldDef::new("name", FieldType::Text),
                    FieldDef::new("bio", FieldType::Text).with_index(true, true),
                    FieldDef::new("age", FieldType::Integer),
                ],
            }],
            edge_types: vec![EdgeTypeDef {
                name: "knows".to_string(),
                table: None,
                from: "person".to_string(),
                to: "person".to_string(),
                cardinality: Cardinality::ManyToMany,
                id_fields: vec![],
                fields: vec![],
                index_from: true,
                index_to: true,
            }],
        }
    }

    #[test]
    fn derive_id_is_deterministic() {
        let a = derive_id("person", &["Ada".to_string()]);
        let b = derive_id("person", &["Ada".to_string()]);
        assert_eq!(a, b);
        assert!(a >= 0);
    }

    #[test]
    fn derive_id_differs_by_type_and_value() {
        let a = derive_id("person", &["Ada".to_string()]);
        let b = derive_id("company", &["Ada".to_string()]);
        let c = derive_id("person", &["Grace".to_string()]);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn derive_id_separator_prevents_concatenation_collisions() {
        let a = derive_id("t", &["ab".to_string(), "c".to_string()]);
        let b = derive_id("t", &["a".to_string(), "bc".to_string()]);
        assert_ne!(a, b);
    }

    #[test]
    fn parse_rejects_unknown_semantic_type() {
        let err = FieldType::parse("person", "age", "decimal").unwrap_err();
        assert!(matches!(err, SchemaError::UnsupportedType { .. }));
    }

    #[test]
    fn validate_accepts_sample() {
        sample_ontology().validate().unwrap();
    }

    #[test]
    fn validate_rejects_dangling_edge_endpoint() {
        let mut ontology = sample_ontology();
        ontology.edge_types[0].to = "city".to_string();
        let err = ontology.validate().unwrap_err();
        assert!(matches!(err, SchemaError::UnknownNodeType { .. }));
    }

    #[test]
    fn validate_rejects_sql_unsafe_identifier() {
        let mut ontology = sample_ontology();
        ontology.node_types[0].fields[0].name = "name; DROP TABLE".to_string();
        // identity field lookup now fails too, but identifier check fires first
        let err = ontology.validate().unwrap_err();
        assert!(matches!(err, SchemaError::InvalidIdentifier { .. }));
    }

    #[test]
    fn validate_rejects_missing_identity_field() {
        let mut ontology = sample_ontology();
        ontology.node_types[0].id_fields = vec!["email".to_string()];
        let err = ontology.validate().unwrap_err();
        assert!(matches!(err, SchemaError::UnknownIdentityField { .. }));
    }

    #[test]
    fn canonical_value_strings_unquoted() {
        assert_eq!(canonical_value(&json!("Ada")), "Ada");
        assert_eq!(canonical_value(&json!(42)), "42");
        assert_eq!(canonical_value(&json!(true)), "true");
    }
}
