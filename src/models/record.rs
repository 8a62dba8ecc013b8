//! Flat Record Model
//!
//! The flat-file directory is the single source of truth: one directory per
//! declared type, holding newline-delimited JSON records. The database tables
//! and the search index are rebuildable caches of these files.
//!
//! Records carry their identity fields and value fields; the reserved
//! `id`/`created_at`/`updated_at` columns are optional on input (derived on
//! load when absent) and always present on export so that re-imports
//! round-trip exactly. Edge records carry `from`/`to` objects holding the
//! endpoint types' identity-field values.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Operation marker on a flat record.
///
/// Full-table exports carry only upserts; change-set files may mix in
/// deletes, which remove the record and cascade (edges, index rows).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordOp {
    #[default]
    Upsert,
    Delete,
}

impl RecordOp {
    fn is_upsert(&self) -> bool {
        matches!(self, RecordOp::Upsert)
    }
}

/// One newline-delimited record of a flat file.
///
/// Serialization note: unrecognized keys land in `values` via
/// `serde(flatten)`; serde_json's default map keeps keys sorted, which is
/// part of what makes consecutive exports byte-identical.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlatRecord {
    /// Operation marker; omitted on export for the default upsert
    #[serde(default, skip_serializing_if = "RecordOp::is_upsert")]
    pub op: RecordOp,

    /// Deterministic id; ignored on load (always re-derived), kept on export
    /// for reproducibility
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,

    /// Edge source endpoint: identity-field values of the `from` node type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Map<String, Value>>,

    /// Edge target endpoint: identity-field values of the `to` node type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Map<String, Value>>,

    /// Identity and value fields declared by the type's schema
    #[serde(flatten)]
    pub values: Map<String, Value>,
}

impl FlatRecord {
    /// Record with only value fields (the common node upsert).
    pub fn upsert(values: Map<String, Value>) -> Self {
        Self {
            values,
            ..Default::default()
        }
    }

    /// Delete marker carrying the identity fields of the doomed record.
    pub fn delete(values: Map<String, Value>) -> Self {
        Self {
            op: RecordOp::Delete,
            values,
            ..Default::default()
        }
    }

    /// Edge upsert with endpoint identity objects.
    pub fn edge(
        from: Map<String, Value>,
        to: Map<String, Value>,
        values: Map<String, Value>,
    ) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
            values,
            ..Default::default()
        }
    }
}

/// Where a record came from, for validation error messages.
#[derive(Debug, Clone)]
pub struct RecordLocation {
    pub file: String,
    pub line: usize,
}

impl std::fmt::Display for RecordLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn upsert_marker_omitted_on_export() {
        let mut values = Map::new();
        values.insert("name".to_string(), json!("Ada"));
        let line = serde_json::to_string(&FlatRecord::upsert(values)).unwrap();
        assert!(!line.contains("\"op\""));
        assert!(line.contains("\"name\":\"Ada\""));
    }

    #[test]
    fn delete_marker_round_trips() {
        let parsed: FlatRecord = serde_json::from_str(r#"{"op":"delete","name":"Ada"}"#).unwrap();
        assert_eq!(parsed.op, RecordOp::Delete);
        assert_eq!(parsed.values["name"], json!("Ada"));
    }

    #[test]
    fn missing_marker_defaults_to_upsert() {
        let parsed: FlatRecord = serde_json::from_str(r#"{"name":"Ada"}"#).unwrap();
        assert_eq!(parsed.op, RecordOp::Upsert);
        assert!(parsed.id.is_none());
    }

    #[test]
    fn edge_endpoints_parse_into_objects() {
        let parsed: FlatRecord =
            serde_json::from_str(r#"{"from":{"name":"A"},"to":{"name":"B"},"weight":2}"#).unwrap();
        assert_eq!(parsed.from.unwrap()["name"], json!("A"));
        assert_eq!(parsed.to.unwrap()["name"], json!("B"));
        assert_eq!(parsed.values["weight"], json!(2));
    }
}
