// src/value.rs
// Document value helpers: dot-path access, key validation, deep copies,
// date tagging and id generation.
//
// Documents are plain `serde_json::Value` trees. Dates are the tagged
// mapping `{"$$date": <ms since epoch>}` both in memory and on disk, so
// serialization is the identity on them.

use chrono::{DateTime, Utc};
use rand::{distributions::Alphanumeric, Rng};
use serde_json::Value;

use crate::error::{Result, VellumError};

/// Key of the date sentinel mapping
pub const DATE_KEY: &str = "$$date";
/// Key of the tombstone sentinel in log records
pub const DELETED_KEY: &str = "$$deleted";
/// Key of the index-creation sentinel in log records
pub const INDEX_CREATED_KEY: &str = "$$indexCreated";
/// Key of the index-removal sentinel in log records
pub const INDEX_REMOVED_KEY: &str = "$$indexRemoved";

/// If `v` is a tagged date, its millisecond instant
pub fn date_millis(v: &Value) -> Option<i64> {
    let map = v.as_object()?;
    if map.len() != 1 {
        return None;
    }
    let ms = map.get(DATE_KEY)?;
    match ms {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        _ => None,
    }
}

/// True if `v` is a tagged date
pub fn is_date(v: &Value) -> bool {
    date_millis(v).is_some()
}

/// Build a tagged date value from a millisecond instant
pub fn make_date(ms: i64) -> Value {
    let mut map = serde_json::Map::new();
    map.insert(DATE_KEY.to_string(), Value::from(ms));
    Value::Object(map)
}

/// Build a tagged date value from a `chrono` instant
pub fn date_from_datetime(dt: DateTime<Utc>) -> Value {
    make_date(dt.timestamp_millis())
}

/// The current instant as a tagged date value
pub fn now_date() -> Value {
    date_from_datetime(Utc::now())
}

/// Current wall-clock time in milliseconds since epoch
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Random alphanumeric document id
pub fn random_id(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Resolve a dot path inside a document, producing an owned value.
///
/// `"a.b.0"` walks mappings and sequences; a numeric segment indexes
/// into a sequence. A non-numeric segment applied to a sequence maps
/// the remaining path over every element, producing a sequence of the
/// results (elements where the remainder does not resolve are dropped).
/// `None` means the path does not resolve ("undefined").
pub fn get_dot_value(obj: &Value, path: &str) -> Option<Value> {
    if path.is_empty() {
        return Some(obj.clone());
    }
    let parts: Vec<&str> = path.split('.').collect();
    get_dot_value_parts(obj, &parts)
}

fn get_dot_value_parts(obj: &Value, parts: &[&str]) -> Option<Value> {
    if parts.is_empty() {
        return Some(obj.clone());
    }
    match obj {
        Value::Object(map) => map
            .get(parts[0])
            .and_then(|v| get_dot_value_parts(v, &parts[1..])),
        Value::Array(arr) => {
            if let Ok(i) = parts[0].parse::<usize>() {
                arr.get(i).and_then(|el| get_dot_value_parts(el, &parts[1..]))
            } else {
                Some(Value::Array(
                    arr.iter()
                        .filter_map(|el| get_dot_value_parts(el, parts))
                        .collect(),
                ))
            }
        }
        _ => None,
    }
}

/// Deep copy of a value. With `strict_keys`, mapping entries whose key
/// starts with `$` or contains `.` are silently dropped (used when an
/// upsert seeds the new document from the query literals).
pub fn deep_copy(v: &Value, strict_keys: bool) -> Value {
    if !strict_keys {
        return v.clone();
    }
    match v {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, val) in map {
                if !k.starts_with('$') && !k.contains('.') {
                    out.insert(k.clone(), deep_copy(val, true));
                }
            }
            Value::Object(out)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(|el| deep_copy(el, true)).collect()),
        other => other.clone(),
    }
}

fn check_key(key: &str, value: &Value) -> Result<()> {
    if key.starts_with('$') {
        let allowed = (key == DATE_KEY && value.is_number())
            || (key == DELETED_KEY && value == &Value::Bool(true))
            || key == INDEX_CREATED_KEY
            || key == INDEX_REMOVED_KEY;
        if !allowed {
            return Err(VellumError::InvalidKey(key.to_string()));
        }
    }
    if key.contains('.') {
        return Err(VellumError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Validate every mapping key in a document tree against the key rules
/// (no `$` prefix, no `.`, sentinel exceptions aside).
pub fn check_object(v: &Value) -> Result<()> {
    match v {
        Value::Object(map) => {
            for (k, val) in map {
                check_key(k, val)?;
                check_object(val)?;
            }
            Ok(())
        }
        Value::Array(arr) => {
            for el in arr {
                check_object(el)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_date_tagging() {
        let d = make_date(1_700_000_000_000);
        assert!(is_date(&d));
        assert_eq!(date_millis(&d), Some(1_700_000_000_000));
        // A mapping with extra keys is not a date
        assert_eq!(date_millis(&json!({"$$date": 5, "x": 1})), None);
        assert_eq!(date_millis(&json!({"date": 5})), None);
        assert!(!is_date(&json!(42)));
    }

    #[test]
    fn test_random_id_shape() {
        let id = random_id(16);
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(random_id(16), random_id(16));
    }

    #[test]
    fn test_get_dot_value_simple() {
        let doc = json!({"name": "Nell", "age": 30});
        assert_eq!(get_dot_value(&doc, "name"), Some(json!("Nell")));
        assert_eq!(get_dot_value(&doc, "missing"), None);
    }

    #[test]
    fn test_get_dot_value_nested_and_indexed() {
        let doc = json!({
            "planets": [
                {"name": "Earth", "moons": 1},
                {"name": "Mars", "moons": 2}
            ]
        });
        assert_eq!(get_dot_value(&doc, "planets.0.name"), Some(json!("Earth")));
        assert_eq!(get_dot_value(&doc, "planets.5.name"), None);
    }

    #[test]
    fn test_get_dot_value_maps_over_sequences() {
        let doc = json!({
            "planets": [
                {"name": "Earth"},
                {"name": "Mars"},
                {"size": 12}
            ]
        });
        assert_eq!(
            get_dot_value(&doc, "planets.name"),
            Some(json!(["Earth", "Mars"]))
        );
    }

    #[test]
    fn test_deep_copy_strict_keys() {
        let q = json!({"a": 1, "$gt": 5, "b.c": 2, "nested": {"$in": [1], "ok": true}});
        let copy = deep_copy(&q, true);
        assert_eq!(copy, json!({"a": 1, "nested": {"ok": true}}));
    }

    #[test]
    fn test_check_object_rejects_bad_keys() {
        assert!(check_object(&json!({"a": 1, "b": {"c": 2}})).is_ok());
        assert!(matches!(
            check_object(&json!({"$set": 1})),
            Err(VellumError::InvalidKey(_))
        ));
        assert!(matches!(
            check_object(&json!({"a.b": 1})),
            Err(VellumError::InvalidKey(_))
        ));
        assert!(matches!(
            check_object(&json!({"deep": [{"$bad": 1}]})),
            Err(VellumError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_check_object_allows_sentinels() {
        assert!(check_object(&json!({"born": {"$$date": 12345}})).is_ok());
        assert!(check_object(&json!({"$$deleted": true, "_id": "x"})).is_ok());
        // $$date with a non-number payload is not a date
        assert!(check_object(&json!({"born": {"$$date": "nope"}})).is_err());
    }
}
