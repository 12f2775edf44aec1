//! Field names and typed accessors for remote documents

use serde_json::Value;

use crate::error::RemoteError;
use crate::remote::{FieldMap, RemotePath, RemoteResult};
use crate::util::normalize_natural_id;

pub const NAME: &str = "name";
pub const COLOR: &str = "color";
pub const CATEGORY_ID: &str = "categoryId";
pub const PRODUCT_ID: &str = "productId";
pub const QUANTITY: &str = "quantity";
pub const COMMENT: &str = "comment";
pub const CHECKED: &str = "checked";
pub const NATURAL_ID: &str = "naturalId";
pub const LAST_CHANGE_DATE: &str = "lastChangeDate";

/// Non-blank string field, trimmed
pub fn str_field<'a>(fields: &'a FieldMap, key: &str) -> Option<&'a str> {
    fields
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Integer field. Integral floats and numeric strings are accepted since
/// other clients may not write JSON integers.
#[allow(clippy::cast_possible_truncation)]
pub fn i64_field(fields: &FieldMap, key: &str) -> Option<i64> {
    match fields.get(key)? {
        Value::Number(number) => number.as_i64().or_else(|| {
            number
                .as_f64()
                .filter(|value| value.fract() == 0.0 && value.abs() < 9.0e15)
                .map(|value| value as i64)
        }),
        Value::String(raw) => raw.trim().parse().ok(),
        _ => None,
    }
}

/// Boolean field; anything but `true` (or `"true"`) reads as false
pub fn bool_field(fields: &FieldMap, key: &str) -> bool {
    match fields.get(key) {
        Some(Value::Bool(value)) => *value,
        Some(Value::String(raw)) => raw.trim().eq_ignore_ascii_case("true"),
        _ => false,
    }
}

pub fn last_change_date(fields: &FieldMap) -> Option<i64> {
    i64_field(fields, LAST_CHANGE_DATE)
}

/// Normalized `naturalId` field
pub fn natural_id_field(fields: &FieldMap) -> Option<String> {
    str_field(fields, NATURAL_ID).and_then(normalize_natural_id)
}

pub fn put_str(fields: &mut FieldMap, key: &str, value: Option<&str>) {
    if let Some(value) = value {
        fields.insert(key.to_string(), Value::String(value.to_string()));
    }
}

pub fn put_i64(fields: &mut FieldMap, key: &str, value: Option<i64>) {
    if let Some(value) = value {
        fields.insert(key.to_string(), Value::from(value));
    }
}

/// Interpret a node read with `get` as a document body
pub fn into_fields(path: &RemotePath, value: Value) -> RemoteResult<FieldMap> {
    match value {
        Value::Object(fields) => Ok(fields),
        other => Err(RemoteError::Malformed {
            path: path.to_string(),
            reason: format!("expected an object, found {other}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn fields(value: Value) -> FieldMap {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn integers_are_read_leniently() {
        let doc = fields(json!({"a": 5, "b": 7.0, "c": " 9 ", "d": 1.5, "e": true}));
        assert_eq!(i64_field(&doc, "a"), Some(5));
        assert_eq!(i64_field(&doc, "b"), Some(7));
        assert_eq!(i64_field(&doc, "c"), Some(9));
        assert_eq!(i64_field(&doc, "d"), None);
        assert_eq!(i64_field(&doc, "e"), None);
        assert_eq!(i64_field(&doc, "missing"), None);
    }

    #[test]
    fn blank_strings_read_as_absent() {
        let doc = fields(json!({"name": "  ", "comment": " ripe "}));
        assert_eq!(str_field(&doc, NAME), None);
        assert_eq!(str_field(&doc, COMMENT), Some("ripe"));
    }

    #[test]
    fn natural_id_field_is_normalized() {
        let doc = fields(json!({"naturalId": "  Whole  MILK "}));
        assert_eq!(natural_id_field(&doc).as_deref(), Some("whole milk"));
    }

    #[test]
    fn checked_defaults_to_false() {
        assert!(!bool_field(&fields(json!({})), CHECKED));
        assert!(bool_field(&fields(json!({"checked": "TRUE"})), CHECKED));
    }

    #[test]
    fn non_object_nodes_are_malformed() {
        let path = RemotePath::parse("lists/l1/products/k").unwrap();
        assert!(matches!(
            into_fields(&path, json!("oops")),
            Err(RemoteError::Malformed { .. })
        ));
        assert!(into_fields(&path, json!({"name": "x"})).is_ok());
    }
}
