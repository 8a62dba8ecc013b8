//! Value Conversion Helpers
//!
//! Conversions between flat-record JSON values, libsql column values, and
//! embedding-vector blobs. Vectors are stored as little-endian f32 bytes.

use crate::models::ontology::FieldType;
use serde_json::Value as JsonValue;

/// Convert a flat-record JSON value into a column value for `field_type`.
///
/// Returns a human-readable detail string on mismatch; callers wrap it into
/// a validation error carrying the record location.
pub fn json_to_sql(field_type: FieldType, value: &JsonValue) -> Result<libsql::Value, String> {
    if value.is_null() {
        return Ok(libsql::Value::Null);
    }
    match field_type {
        FieldType::Text | FieldType::DateTime => match value {
            JsonValue::String(s) => Ok(libsql::Value::Text(s.clone())),
            other => Err(format!("expected string, got {}", kind(other))),
        },
        FieldType::Integer => match value.as_i64() {
            Some(n) => Ok(libsql::Value::Integer(n)),
            None => Err(format!("expected integer, got {}", kind(value))),
        },
        FieldType::Number => match value.as_f64() {
            Some(n) => Ok(libsql::Value::Real(n)),
            None => Err(format!("expected number, got {}", kind(value))),
        },
        FieldType::Boolean => match value {
            JsonValue::Bool(b) => Ok(libsql::Value::Integer(*b as i64)),
            other => Err(format!("expected boolean, got {}", kind(other))),
        },
        FieldType::Object => match value {
            JsonValue::Object(_) => Ok(libsql::Value::Text(value.to_string())),
            other => Err(format!("expected object, got {}", kind(other))),
        },
        FieldType::Array => match value {
            JsonValue::Array(_) => Ok(libsql::Value::Text(value.to_string())),
            other => Err(format!("expected array, got {}", kind(other))),
        },
    }
}

/// Convert a column value back into the flat-record JSON form.
///
/// The inverse of [`json_to_sql`]; together they give byte-stable
/// round-trips through the database.
pub fn sql_to_json(field_type: FieldType, value: libsql::Value) -> JsonValue {
    match (field_type, value) {
        (_, libsql::Value::Null) => JsonValue::Null,
        (FieldType::Boolean, libsql::Value::Integer(n)) => JsonValue::Bool(n != 0),
        (FieldType::Object | FieldType::Array, libsql::Value::Text(s)) => {
            serde_json::from_str(&s).unwrap_or(JsonValue::String(s))
        }
        (_, libsql::Value::Integer(n)) => JsonValue::from(n),
        (_, libsql::Value::Real(n)) => JsonValue::from(n),
        (_, libsql::Value::Text(s)) => JsonValue::String(s),
        // Blobs never appear in declared value columns
        (_, libsql::Value::Blob(_)) => JsonValue::Null,
    }
}

/// Untyped column-to-JSON conversion for reserved columns and ad-hoc reads.
pub fn raw_to_json(value: libsql::Value) -> JsonValue {
    match value {
        libsql::Value::Null => JsonValue::Null,
        libsql::Value::Integer(n) => JsonValue::from(n),
        libsql::Value::Real(n) => JsonValue::from(n),
        libsql::Value::Text(s) => JsonValue::String(s),
        libsql::Value::Blob(_) => JsonValue::Null,
    }
}

/// Serialize an embedding vector to its stored blob form.
pub fn vector_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

/// Deserialize a stored blob back into an embedding vector.
///
/// Trailing bytes that do not complete an f32 are ignored.
pub fn blob_to_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}
