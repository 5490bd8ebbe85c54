// src/update.rs
// Update expressions: whole-document replacement or a set of `$`
// modifiers applied to a deep copy of the original.

use serde_json::Value;

use crate::compare::{are_things_equal, ValueOrdering};
use crate::error::{Result, VellumError};
use crate::query::operators::{match_literal, match_operator_set, parse_operator_object};
use crate::query::Query;
use crate::value::{check_object, is_date};

/// The closed set of update modifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modifier {
    Set,
    Unset,
    Inc,
    Min,
    Max,
    Push,
    AddToSet,
    Pop,
    Pull,
}

impl Modifier {
    fn parse(name: &str) -> Result<Modifier> {
        match name {
            "$set" => Ok(Modifier::Set),
            "$unset" => Ok(Modifier::Unset),
            "$inc" => Ok(Modifier::Inc),
            "$min" => Ok(Modifier::Min),
            "$max" => Ok(Modifier::Max),
            "$push" => Ok(Modifier::Push),
            "$addToSet" => Ok(Modifier::AddToSet),
            "$pop" => Ok(Modifier::Pop),
            "$pull" => Ok(Modifier::Pull),
            other => Err(VellumError::UnknownModifier(other.to_string())),
        }
    }
}

/// One `$modifier: {field: value, ...}` group
#[derive(Debug, Clone)]
pub struct ModifierGroup {
    pub modifier: Modifier,
    pub fields: Vec<(String, Value)>,
}

/// A parsed update expression
#[derive(Debug, Clone)]
pub enum UpdateExpr {
    /// Replace the whole document (except `_id`)
    Replacement(Value),
    /// Apply modifiers to a copy of the original
    Modifiers(Vec<ModifierGroup>),
}

impl UpdateExpr {
    pub fn parse(update: &Value) -> Result<UpdateExpr> {
        let map = update.as_object().ok_or_else(|| {
            VellumError::InvalidUpdate("an update must be a mapping".to_string())
        })?;

        let dollar_keys = map.keys().filter(|k| k.starts_with('$')).count();
        if dollar_keys == 0 {
            return Ok(UpdateExpr::Replacement(update.clone()));
        }
        if dollar_keys < map.len() {
            return Err(VellumError::MixedUpdate);
        }

        let mut groups = Vec::with_capacity(map.len());
        for (name, arg) in map {
            let modifier = Modifier::parse(name)?;
            let fields = arg
                .as_object()
                .ok_or_else(|| {
                    VellumError::InvalidUpdate(format!("modifier {} needs a mapping argument", name))
                })?
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            groups.push(ModifierGroup { modifier, fields });
        }
        Ok(UpdateExpr::Modifiers(groups))
    }
}

/// Apply an update expression to a document, producing the new
/// document. The original is never mutated; `_id` is carried over and
/// must not change; the result is re-validated against the key rules.
pub fn modify(doc: &Value, expr: &UpdateExpr, ordering: &ValueOrdering) -> Result<Value> {
    let out = match expr {
        UpdateExpr::Replacement(replacement) => {
            if let (Some(new_id), Some(old_id)) = (replacement.get("_id"), doc.get("_id")) {
                if !are_things_equal(new_id, old_id) {
                    return Err(VellumError::ImmutableId);
                }
            }
            let mut out = replacement.clone();
            if let (Some(map), Some(old_id)) = (out.as_object_mut(), doc.get("_id")) {
                map.insert("_id".to_string(), old_id.clone());
            }
            out
        }
        UpdateExpr::Modifiers(groups) => {
            let mut out = doc.clone();
            for group in groups {
                for (field, value) in &group.fields {
                    apply_modifier(&mut out, group.modifier, field, value, ordering)?;
                }
            }
            let id_unchanged = match (doc.get("_id"), out.get("_id")) {
                (Some(a), Some(b)) => are_things_equal(a, b),
                (None, None) => true,
                _ => false,
            };
            if !id_unchanged {
                return Err(VellumError::ImmutableId);
            }
            out
        }
    };
    check_object(&out)?;
    Ok(out)
}

/// `$set` one dot path (shared with pick-projections)
pub(crate) fn set_dot(obj: &mut Value, path: &str, value: Value) -> Result<()> {
    apply_modifier(obj, Modifier::Set, path, &value, &ValueOrdering::new())
}

/// `$unset` one dot path (shared with omit-projections)
pub(crate) fn unset_dot(obj: &mut Value, path: &str) -> Result<()> {
    apply_modifier(obj, Modifier::Unset, path, &Value::Null, &ValueOrdering::new())
}

fn apply_modifier(
    obj: &mut Value,
    modifier: Modifier,
    field: &str,
    value: &Value,
    ordering: &ValueOrdering,
) -> Result<()> {
    let parts: Vec<&str> = field.split('.').collect();
    apply_at_path(obj, modifier, &parts, field, value, ordering)
}

// Walks all but the last path segment, auto-creating intermediate
// mappings except for $unset, which is a no-op on missing paths.
fn apply_at_path(
    current: &mut Value,
    modifier: Modifier,
    parts: &[&str],
    full_field: &str,
    value: &Value,
    ordering: &ValueOrdering,
) -> Result<()> {
    let head = parts[0];
    if parts.len() == 1 {
        return apply_last_step(current, modifier, head, full_field, value, ordering);
    }
    match current {
        Value::Object(map) => {
            if !map.contains_key(head) {
                if modifier == Modifier::Unset {
                    return Ok(());
                }
                map.insert(head.to_string(), Value::Object(serde_json::Map::new()));
            }
            match map.get_mut(head) {
                Some(next) => apply_at_path(next, modifier, &parts[1..], full_field, value, ordering),
                None => Ok(()),
            }
        }
        Value::Array(arr) => {
            let idx = head.parse::<usize>().map_err(|_| {
                VellumError::ModifierTypeError(format!(
                    "cannot navigate field {} through a sequence",
                    full_field
                ))
            })?;
            match arr.get_mut(idx) {
                Some(next) => apply_at_path(next, modifier, &parts[1..], full_field, value, ordering),
                None if modifier == Modifier::Unset => Ok(()),
                None => Err(VellumError::ModifierTypeError(format!(
                    "element {} of field {} is past the end of the sequence",
                    idx, full_field
                ))),
            }
        }
        _ if modifier == Modifier::Unset => Ok(()),
        _ => Err(VellumError::ModifierTypeError(format!(
            "cannot create field {} inside a scalar value",
            full_field
        ))),
    }
}

// A writable position: a mapping entry or a sequence element
enum Slot<'a> {
    Map(&'a mut serde_json::Map<String, Value>, String),
    Arr(&'a mut Vec<Value>, usize),
}

impl Slot<'_> {
    fn get(&self) -> Option<&Value> {
        match self {
            Slot::Map(map, key) => map.get(key.as_str()),
            Slot::Arr(arr, idx) => arr.get(*idx),
        }
    }

    fn set(&mut self, value: Value) -> Result<()> {
        match self {
            Slot::Map(map, key) => {
                map.insert(key.clone(), value);
                Ok(())
            }
            Slot::Arr(arr, idx) => {
                if *idx < arr.len() {
                    arr[*idx] = value;
                    Ok(())
                } else if *idx == arr.len() {
                    arr.push(value);
                    Ok(())
                } else {
                    Err(VellumError::ModifierTypeError(format!(
                        "cannot set element {} past the end of a sequence",
                        idx
                    )))
                }
            }
        }
    }

    fn unset(&mut self) {
        match self {
            Slot::Map(map, key) => {
                map.remove(key.as_str());
            }
            // Unsetting a sequence element leaves a null hole
            Slot::Arr(arr, idx) => {
                if let Some(el) = arr.get_mut(*idx) {
                    *el = Value::Null;
                }
            }
        }
    }

    fn get_mut(&mut self) -> Option<&mut Value> {
        match self {
            Slot::Map(map, key) => map.get_mut(key.as_str()),
            Slot::Arr(arr, idx) => arr.get_mut(*idx),
        }
    }
}

fn apply_last_step(
    container: &mut Value,
    modifier: Modifier,
    field: &str,
    full_field: &str,
    value: &Value,
    ordering: &ValueOrdering,
) -> Result<()> {
    let mut slot = match container {
        Value::Object(map) => Slot::Map(map, field.to_string()),
        Value::Array(arr) => {
            let idx = field.parse::<usize>().map_err(|_| {
                VellumError::ModifierTypeError(format!(
                    "cannot navigate field {} through a sequence",
                    full_field
                ))
            })?;
            Slot::Arr(arr, idx)
        }
        _ if modifier == Modifier::Unset => return Ok(()),
        _ => {
            return Err(VellumError::ModifierTypeError(format!(
                "cannot modify field {} of a scalar value",
                full_field
            )))
        }
    };

    match modifier {
        Modifier::Set => slot.set(value.clone()),
        Modifier::Unset => {
            slot.unset();
            Ok(())
        }
        Modifier::Inc => {
            if !value.is_number() {
                return Err(VellumError::ModifierTypeError(format!(
                    "{} must be a number to $inc with",
                    value
                )));
            }
            match slot.get() {
                None => slot.set(value.clone()),
                Some(current) if current.is_number() => {
                    let sum = add_numbers(current, value);
                    slot.set(sum)
                }
                Some(_) => Err(VellumError::ModifierTypeError(format!(
                    "cannot $inc the non-number field {}",
                    full_field
                ))),
            }
        }
        Modifier::Min => match slot.get() {
            None => slot.set(value.clone()),
            Some(current) => {
                if ordering.compare(value, current) == std::cmp::Ordering::Less {
                    slot.set(value.clone())
                } else {
                    Ok(())
                }
            }
        },
        Modifier::Max => match slot.get() {
            None => slot.set(value.clone()),
            Some(current) => {
                if ordering.compare(value, current) == std::cmp::Ordering::Greater {
                    slot.set(value.clone())
                } else {
                    Ok(())
                }
            }
        },
        Modifier::Push => {
            if slot.get().is_none() {
                slot.set(Value::Array(Vec::new()))?;
            }
            let arr = match slot.get_mut() {
                Some(Value::Array(arr)) => arr,
                _ => {
                    return Err(VellumError::ModifierTypeError(format!(
                        "cannot $push an element onto the non-sequence field {}",
                        full_field
                    )))
                }
            };
            push_value(arr, value)
        }
        Modifier::AddToSet => {
            if slot.get().is_none() {
                slot.set(Value::Array(Vec::new()))?;
            }
            let arr = match slot.get_mut() {
                Some(Value::Array(arr)) => arr,
                _ => {
                    return Err(VellumError::ModifierTypeError(format!(
                        "cannot $addToSet an element onto the non-sequence field {}",
                        full_field
                    )))
                }
            };
            add_to_set(arr, value, ordering)
        }
        Modifier::Pop => {
            let arr = match slot.get_mut() {
                Some(Value::Array(arr)) => arr,
                _ => {
                    return Err(VellumError::ModifierTypeError(format!(
                        "cannot $pop an element from the non-sequence field {}",
                        full_field
                    )))
                }
            };
            let n = value.as_f64().ok_or_else(|| {
                VellumError::ModifierTypeError(format!("{} is not a number, cannot $pop with it", value))
            })?;
            if n > 0.0 {
                arr.pop();
            } else if n < 0.0 && !arr.is_empty() {
                arr.remove(0);
            }
            Ok(())
        }
        Modifier::Pull => {
            let criteria = pull_criteria(value)?;
            let arr = match slot.get_mut() {
                Some(Value::Array(arr)) => arr,
                _ => {
                    return Err(VellumError::ModifierTypeError(format!(
                        "cannot $pull an element from the non-sequence field {}",
                        full_field
                    )))
                }
            };
            arr.retain(|el| !criteria.matches(el, ordering));
            Ok(())
        }
    }
}

// Integer arithmetic while both sides are integers, f64 otherwise
fn add_numbers(a: &Value, b: &Value) -> Value {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if let Some(sum) = x.checked_add(y) {
            return Value::from(sum);
        }
    }
    let sum = a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0);
    serde_json::Number::from_f64(sum)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn push_value(arr: &mut Vec<Value>, value: &Value) -> Result<()> {
    let map = match value.as_object() {
        Some(map) if !is_date(value) && map.contains_key("$each") => map,
        Some(map) if !is_date(value) && map.contains_key("$slice") => {
            return Err(VellumError::InvalidUpdate(
                "$slice can only be used in conjunction with $each".to_string(),
            ));
        }
        _ => {
            arr.push(value.clone());
            return Ok(());
        }
    };

    if map.keys().any(|k| k != "$each" && k != "$slice") {
        return Err(VellumError::InvalidUpdate(
            "only $slice can be used in conjunction with $each".to_string(),
        ));
    }
    let each = map
        .get("$each")
        .and_then(Value::as_array)
        .ok_or_else(|| VellumError::ModifierTypeError("$each requires a sequence value".to_string()))?;
    arr.extend(each.iter().cloned());

    if let Some(slice) = map.get("$slice") {
        let s = slice.as_i64().ok_or_else(|| {
            VellumError::ModifierTypeError("$slice requires an integer value".to_string())
        })?;
        let n = arr.len();
        if s == 0 {
            arr.clear();
        } else if s > 0 {
            arr.truncate((s as usize).min(n));
        } else {
            let keep = (s.unsigned_abs() as usize).min(n);
            arr.drain(0..n - keep);
        }
    }
    Ok(())
}

// Each listed element is a separate $addToSet; duplicates are detected
// by the comparison algebra, not by encoding tricks.
fn add_to_set(arr: &mut Vec<Value>, value: &Value, ordering: &ValueOrdering) -> Result<()> {
    let elements: Vec<Value> = match value.as_object() {
        Some(map) if !is_date(value) && map.contains_key("$each") => {
            if map.len() > 1 {
                return Err(VellumError::InvalidUpdate(
                    "cannot use another field in conjunction with $each".to_string(),
                ));
            }
            map.get("$each")
                .and_then(Value::as_array)
                .ok_or_else(|| {
                    VellumError::ModifierTypeError("$each requires a sequence value".to_string())
                })?
                .clone()
        }
        _ => vec![value.clone()],
    };
    for el in elements {
        if !arr
            .iter()
            .any(|x| ordering.compare(x, &el) == std::cmp::Ordering::Equal)
        {
            arr.push(el);
        }
    }
    Ok(())
}

// $pull takes a literal, an operator object, or a sub-query matched
// against each element
enum PullCriteria {
    Literal(Value),
    Operators(Vec<crate::query::operators::ComparisonOperator>),
    Query(Query),
}

impl PullCriteria {
    fn matches(&self, el: &Value, ordering: &ValueOrdering) -> bool {
        match self {
            PullCriteria::Literal(lit) => match_literal(Some(el), lit, ordering, false),
            PullCriteria::Operators(ops) => match_operator_set(Some(el), ops, ordering),
            PullCriteria::Query(q) => {
                if el.is_object() && !is_date(el) {
                    q.matches(el, ordering)
                } else {
                    false
                }
            }
        }
    }
}

fn pull_criteria(value: &Value) -> Result<PullCriteria> {
    if let Some(map) = value.as_object() {
        if !is_date(value) {
            if !map.is_empty() && map.keys().all(|k| k.starts_with('$')) {
                return Ok(PullCriteria::Operators(parse_operator_object(map)?));
            }
            return Ok(PullCriteria::Query(Query::parse(value)?));
        }
    }
    Ok(PullCriteria::Literal(value.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ord() -> ValueOrdering {
        ValueOrdering::new()
    }

    fn apply(doc: Value, update: Value) -> Result<Value> {
        modify(&doc, &UpdateExpr::parse(&update)?, &ord())
    }

    #[test]
    fn test_replacement_keeps_id() {
        let out = apply(json!({"_id": "X", "a": 1}), json!({"b": 2})).unwrap();
        assert_eq!(out, json!({"_id": "X", "b": 2}));
    }

    #[test]
    fn test_replacement_cannot_change_id() {
        assert!(matches!(
            apply(json!({"_id": "X", "a": 1}), json!({"_id": "Y", "a": 0})),
            Err(VellumError::ImmutableId)
        ));
        // Restating the same _id is fine
        let out = apply(json!({"_id": "X", "a": 1}), json!({"_id": "X", "a": 0})).unwrap();
        assert_eq!(out, json!({"_id": "X", "a": 0}));
    }

    #[test]
    fn test_mixed_update_is_rejected() {
        assert!(matches!(
            UpdateExpr::parse(&json!({"$set": {"a": 1}, "b": 2})),
            Err(VellumError::MixedUpdate)
        ));
    }

    #[test]
    fn test_unknown_modifier() {
        assert!(matches!(
            UpdateExpr::parse(&json!({"$rename": {"a": "b"}})),
            Err(VellumError::UnknownModifier(_))
        ));
    }

    #[test]
    fn test_set_creates_intermediate_mappings() {
        let out = apply(json!({"_id": "X"}), json!({"$set": {"a.b.c": 7}})).unwrap();
        assert_eq!(out, json!({"_id": "X", "a": {"b": {"c": 7}}}));
    }

    #[test]
    fn test_set_into_sequence_element() {
        let out = apply(
            json!({"_id": "X", "tags": ["a", "b"]}),
            json!({"$set": {"tags.1": "c"}}),
        )
        .unwrap();
        assert_eq!(out["tags"], json!(["a", "c"]));
    }

    #[test]
    fn test_unset_is_noop_on_missing_paths() {
        let doc = json!({"_id": "X", "a": 1});
        let out = apply(doc.clone(), json!({"$unset": {"b.c": true}})).unwrap();
        assert_eq!(out, doc);
        let out = apply(doc, json!({"$unset": {"a": true}})).unwrap();
        assert_eq!(out, json!({"_id": "X"}));
    }

    #[test]
    fn test_inc() {
        let out = apply(json!({"_id": "X", "n": 5}), json!({"$inc": {"n": 2, "m": 3}})).unwrap();
        assert_eq!(out["n"], json!(7));
        assert_eq!(out["m"], json!(3));
    }

    #[test]
    fn test_inc_type_errors() {
        assert!(matches!(
            apply(json!({"_id": "X", "n": "s"}), json!({"$inc": {"n": 2}})),
            Err(VellumError::ModifierTypeError(_))
        ));
        assert!(matches!(
            apply(json!({"_id": "X", "n": 1}), json!({"$inc": {"n": "2"}})),
            Err(VellumError::ModifierTypeError(_))
        ));
    }

    #[test]
    fn test_min_max() {
        let doc = json!({"_id": "X", "n": 5});
        assert_eq!(apply(doc.clone(), json!({"$min": {"n": 3}})).unwrap()["n"], json!(3));
        assert_eq!(apply(doc.clone(), json!({"$min": {"n": 9}})).unwrap()["n"], json!(5));
        assert_eq!(apply(doc.clone(), json!({"$max": {"n": 9}})).unwrap()["n"], json!(9));
        assert_eq!(apply(doc, json!({"$max": {"missing": 9}})).unwrap()["missing"], json!(9));
    }

    #[test]
    fn test_push() {
        let out = apply(json!({"_id": "X", "t": [1]}), json!({"$push": {"t": 2}})).unwrap();
        assert_eq!(out["t"], json!([1, 2]));
        // Creates the sequence when missing
        let out = apply(json!({"_id": "X"}), json!({"$push": {"t": 1}})).unwrap();
        assert_eq!(out["t"], json!([1]));
        // Whole sequences are pushed as one element
        let out = apply(json!({"_id": "X", "t": [1]}), json!({"$push": {"t": [2, 3]}})).unwrap();
        assert_eq!(out["t"], json!([1, [2, 3]]));
    }

    #[test]
    fn test_push_each_and_slice() {
        let out = apply(
            json!({"_id": "X", "t": [1]}),
            json!({"$push": {"t": {"$each": [2, 3, 4]}}}),
        )
        .unwrap();
        assert_eq!(out["t"], json!([1, 2, 3, 4]));

        let out = apply(
            json!({"_id": "X", "t": [1]}),
            json!({"$push": {"t": {"$each": [2, 3, 4], "$slice": -2}}}),
        )
        .unwrap();
        assert_eq!(out["t"], json!([3, 4]));

        let out = apply(
            json!({"_id": "X", "t": [1]}),
            json!({"$push": {"t": {"$each": [2, 3], "$slice": 2}}}),
        )
        .unwrap();
        assert_eq!(out["t"], json!([1, 2]));

        assert!(apply(
            json!({"_id": "X", "t": [1]}),
            json!({"$push": {"t": {"$slice": 2}}}),
        )
        .is_err());
        assert!(apply(
            json!({"_id": "X", "t": [1]}),
            json!({"$push": {"t": {"$each": [2], "$other": 1}}}),
        )
        .is_err());
    }

    #[test]
    fn test_add_to_set() {
        let out = apply(json!({"_id": "X", "t": [1, 2]}), json!({"$addToSet": {"t": 2}})).unwrap();
        assert_eq!(out["t"], json!([1, 2]));
        let out = apply(json!({"_id": "X", "t": [1, 2]}), json!({"$addToSet": {"t": 3}})).unwrap();
        assert_eq!(out["t"], json!([1, 2, 3]));
        // 1 and "1" are distinct set members
        let out = apply(json!({"_id": "X", "t": [1]}), json!({"$addToSet": {"t": "1"}})).unwrap();
        assert_eq!(out["t"], json!([1, "1"]));
    }

    #[test]
    fn test_add_to_set_each() {
        let out = apply(
            json!({"_id": "X", "t": [1, 2]}),
            json!({"$addToSet": {"t": {"$each": [2, 3, 2, 4]}}}),
        )
        .unwrap();
        assert_eq!(out["t"], json!([1, 2, 3, 4]));
        assert!(apply(
            json!({"_id": "X", "t": []}),
            json!({"$addToSet": {"t": {"$each": [1], "$slice": 1}}}),
        )
        .is_err());
    }

    #[test]
    fn test_pop() {
        let doc = json!({"_id": "X", "t": [1, 2, 3]});
        assert_eq!(apply(doc.clone(), json!({"$pop": {"t": 1}})).unwrap()["t"], json!([1, 2]));
        assert_eq!(apply(doc.clone(), json!({"$pop": {"t": -1}})).unwrap()["t"], json!([2, 3]));
        assert_eq!(apply(doc.clone(), json!({"$pop": {"t": 0}})).unwrap()["t"], json!([1, 2, 3]));
        assert!(apply(doc, json!({"$pop": {"t": "x"}})).is_err());
        assert!(apply(json!({"_id": "X", "t": 5}), json!({"$pop": {"t": 1}})).is_err());
    }

    #[test]
    fn test_pull_literal_and_operators() {
        let doc = json!({"_id": "X", "t": [1, 2, 3, 2]});
        assert_eq!(apply(doc.clone(), json!({"$pull": {"t": 2}})).unwrap()["t"], json!([1, 3]));
        assert_eq!(
            apply(doc, json!({"$pull": {"t": {"$gte": 2}}})).unwrap()["t"],
            json!([1])
        );
    }

    #[test]
    fn test_pull_with_sub_query() {
        let doc = json!({"_id": "X", "t": [{"k": 1, "v": "a"}, {"k": 2, "v": "b"}]});
        let out = apply(doc, json!({"$pull": {"t": {"k": 2}}})).unwrap();
        assert_eq!(out["t"], json!([{"k": 1, "v": "a"}]));
    }

    #[test]
    fn test_modifiers_cannot_touch_id() {
        assert!(matches!(
            apply(json!({"_id": "X", "a": 1}), json!({"$set": {"_id": "Y"}})),
            Err(VellumError::ImmutableId)
        ));
        assert!(matches!(
            apply(json!({"_id": "X", "a": 1}), json!({"$unset": {"_id": true}})),
            Err(VellumError::ImmutableId)
        ));
    }

    #[test]
    fn test_result_is_key_validated() {
        assert!(matches!(
            apply(json!({"_id": "X"}), json!({"$set": {"a": {"bad.key": 1}}})),
            Err(VellumError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_original_is_untouched() {
        let doc = json!({"_id": "X", "n": 1});
        let _ = apply(doc.clone(), json!({"$inc": {"n": 5}})).unwrap();
        assert_eq!(doc, json!({"_id": "X", "n": 1}));
    }
}
