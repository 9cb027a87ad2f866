//! Row decoding for results coming back through the `Any` driver.
//!
//! Every result row becomes a JSON object keyed by column name. Column types
//! are classified from the driver-reported type name and decoded through a
//! chain of progressively narrower Rust types; a value that fails every
//! decode in its chain comes back as JSON null rather than failing the whole
//! statement. Columns with no prepare-time type (SQLite reports `NULL` for
//! expression-derived results) are decoded by value instead.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::Value as JsonValue;
use sqlx::any::AnyRow;
use sqlx::{Column, Row as _, TypeInfo};

/// A decoded result row: column name to JSON value.
pub type Row = serde_json::Map<String, JsonValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TypeCategory {
    Integer,
    Float,
    Boolean,
    Text,
    Binary,
    Unknown,
}

/// Classify a driver type name into a decoding category.
///
/// The `Any` driver reports a small set of names (BOOLEAN, SMALLINT,
/// INTEGER, BIGINT, REAL, DOUBLE, TEXT, BLOB, NULL); the contains-checks
/// also cover native driver names that leak through, like VARCHAR or BYTEA.
/// `NULL` is what SQLite reports for any column it cannot type at prepare
/// time (aggregates, bound parameters, literals), so it maps to `Unknown`
/// rather than to a null value.
fn categorize_type(type_name: &str) -> TypeCategory {
    let lower = type_name.to_lowercase();

    if lower == "null" {
        return TypeCategory::Unknown;
    }
    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }
    if lower.contains("int") || lower.contains("serial") {
        return TypeCategory::Integer;
    }
    if lower.contains("real")
        || lower.contains("double")
        || lower.contains("float")
        || lower.contains("decimal")
        || lower.contains("numeric")
    {
        return TypeCategory::Float;
    }
    if lower.contains("blob") || lower.contains("binary") || lower == "bytea" {
        return TypeCategory::Binary;
    }

    TypeCategory::Text
}

/// Convert a row into a JSON object.
pub(crate) fn row_to_map(row: &AnyRow) -> Row {
    row.columns()
        .iter()
        .enumerate()
        .map(|(idx, col)| {
            let category = categorize_type(col.type_info().name());
            (col.name().to_string(), decode_column(row, idx, category))
        })
        .collect()
}

fn decode_column(row: &AnyRow, idx: usize, category: TypeCategory) -> JsonValue {
    match category {
        TypeCategory::Integer => decode_integer(row, idx),
        TypeCategory::Float => decode_float(row, idx),
        TypeCategory::Boolean => decode_boolean(row, idx),
        TypeCategory::Binary => decode_binary(row, idx),
        TypeCategory::Text => decode_text(row, idx),
        TypeCategory::Unknown => decode_unknown(row, idx),
    }
}

fn decode_integer(row: &AnyRow, idx: usize) -> JsonValue {
    if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(idx) {
        return JsonValue::Number(v.into());
    }
    if let Ok(Some(v)) = row.try_get::<Option<i32>, _>(idx) {
        return JsonValue::Number(v.into());
    }
    if let Ok(Some(v)) = row.try_get::<Option<i16>, _>(idx) {
        return JsonValue::Number(v.into());
    }
    JsonValue::Null
}

fn decode_float(row: &AnyRow, idx: usize) -> JsonValue {
    if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(idx) {
        return serde_json::Number::from_f64(v)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null);
    }
    if let Ok(Some(v)) = row.try_get::<Option<f32>, _>(idx) {
        return serde_json::Number::from_f64(v.into())
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null);
    }
    // DECIMAL comes through some drivers as text
    if let Ok(Some(v)) = row.try_get::<Option<String>, _>(idx) {
        return JsonValue::String(v);
    }
    JsonValue::Null
}

fn decode_boolean(row: &AnyRow, idx: usize) -> JsonValue {
    if let Ok(Some(v)) = row.try_get::<Option<bool>, _>(idx) {
        return JsonValue::Bool(v);
    }
    if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(idx) {
        return JsonValue::Bool(v != 0);
    }
    JsonValue::Null
}

fn decode_text(row: &AnyRow, idx: usize) -> JsonValue {
    if let Ok(Some(v)) = row.try_get::<Option<String>, _>(idx) {
        return JsonValue::String(v);
    }
    JsonValue::Null
}

fn decode_binary(row: &AnyRow, idx: usize) -> JsonValue {
    if let Ok(Some(v)) = row.try_get::<Option<Vec<u8>>, _>(idx) {
        return JsonValue::String(STANDARD.encode(v));
    }
    JsonValue::Null
}

/// Decode a column whose type was unknown at prepare time.
///
/// The value itself is the only source of truth here, so every decode in
/// the chain gets a turn; only a value that misses all of them (an actual
/// SQL NULL) comes back as null.
fn decode_unknown(row: &AnyRow, idx: usize) -> JsonValue {
    if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(idx) {
        return JsonValue::Number(v.into());
    }
    if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(idx) {
        return serde_json::Number::from_f64(v)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null);
    }
    if let Ok(Some(v)) = row.try_get::<Option<String>, _>(idx) {
        return JsonValue::String(v);
    }
    if let Ok(Some(v)) = row.try_get::<Option<Vec<u8>>, _>(idx) {
        return JsonValue::String(STANDARD.encode(v));
    }
    JsonValue::Null
}
