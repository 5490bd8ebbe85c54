// src/query/operators.rs
// Comparison operators and the matching semantics for field clauses.
//
// Operators form a closed tagged union resolved at parse time, so an
// unknown `$op` is an `UnknownOperator` error before any document is
// examined.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lazy_static::lazy_static;
use lru::LruCache;
use regex::Regex;
use serde_json::Value;

use super::Query;
use crate::compare::{are_things_equal, compare_scalars, ValueOrdering};
use crate::error::{Result, VellumError};

lazy_static! {
    /// Compiled `$regex` patterns; recompiling on every query parse is
    /// the expensive part of regex matching
    static ref REGEX_CACHE: Mutex<LruCache<String, Regex>> =
        Mutex::new(LruCache::new(NonZeroUsize::new(100).unwrap()));
}

/// Get or compile a `$regex` pattern with caching
pub fn get_or_compile_regex(pattern: &str) -> Result<Regex> {
    {
        let mut cache = REGEX_CACHE.lock().unwrap();
        if let Some(regex) = cache.get(pattern) {
            return Ok(regex.clone());
        }
    }

    let regex = Regex::new(pattern).map_err(|e| {
        VellumError::InvalidQuery(format!("invalid $regex pattern '{}': {}", pattern, e))
    })?;

    let mut cache = REGEX_CACHE.lock().unwrap();
    cache.put(pattern.to_string(), regex.clone());
    Ok(regex)
}

/// JS-style truthiness, used by `$exists`
pub(crate) fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

/// One comparison operator with its operand
#[derive(Debug, Clone)]
pub enum ComparisonOperator {
    Lt(Value),
    Lte(Value),
    Gt(Value),
    Gte(Value),
    Ne(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Regex(Regex),
    Exists(bool),
    Size(usize),
    ElemMatch(Query),
}

impl ComparisonOperator {
    /// Parse one `$op: operand` entry of an operator object
    pub fn parse(op: &str, operand: &Value) -> Result<ComparisonOperator> {
        match op {
            "$lt" => Ok(ComparisonOperator::Lt(operand.clone())),
            "$lte" => Ok(ComparisonOperator::Lte(operand.clone())),
            "$gt" => Ok(ComparisonOperator::Gt(operand.clone())),
            "$gte" => Ok(ComparisonOperator::Gte(operand.clone())),
            "$ne" => Ok(ComparisonOperator::Ne(operand.clone())),
            "$in" => match operand.as_array() {
                Some(arr) => Ok(ComparisonOperator::In(arr.clone())),
                None => Err(VellumError::InvalidQuery(
                    "$in operator called with a non-array".to_string(),
                )),
            },
            "$nin" => match operand.as_array() {
                Some(arr) => Ok(ComparisonOperator::Nin(arr.clone())),
                None => Err(VellumError::InvalidQuery(
                    "$nin operator called with a non-array".to_string(),
                )),
            },
            "$regex" => match operand.as_str() {
                Some(pattern) => Ok(ComparisonOperator::Regex(get_or_compile_regex(pattern)?)),
                None => Err(VellumError::InvalidQuery(
                    "$regex operator called with a non-string".to_string(),
                )),
            },
            "$exists" => Ok(ComparisonOperator::Exists(truthy(operand))),
            "$size" => match operand.as_u64() {
                Some(n) => Ok(ComparisonOperator::Size(n as usize)),
                None => Err(VellumError::InvalidQuery(
                    "$size operator called without an integer".to_string(),
                )),
            },
            "$elemMatch" => match operand {
                Value::Object(_) => Ok(ComparisonOperator::ElemMatch(Query::parse(operand)?)),
                _ => Err(VellumError::InvalidQuery(
                    "$elemMatch operator called without an object".to_string(),
                )),
            },
            other => Err(VellumError::UnknownOperator(other.to_string())),
        }
    }

    /// `$size` and `$elemMatch` apply to the sequence as a whole rather
    /// than to its elements
    pub fn is_array_operator(&self) -> bool {
        matches!(
            self,
            ComparisonOperator::Size(_) | ComparisonOperator::ElemMatch(_)
        )
    }

    /// Evaluate the operator against a resolved dot-path value
    pub fn matches(&self, value: Option<&Value>, ordering: &ValueOrdering) -> bool {
        match self {
            ComparisonOperator::Lt(bound) => scalar_cmp(value, bound, ordering)
                .map(|o| o == std::cmp::Ordering::Less)
                .unwrap_or(false),
            ComparisonOperator::Lte(bound) => scalar_cmp(value, bound, ordering)
                .map(|o| o != std::cmp::Ordering::Greater)
                .unwrap_or(false),
            ComparisonOperator::Gt(bound) => scalar_cmp(value, bound, ordering)
                .map(|o| o == std::cmp::Ordering::Greater)
                .unwrap_or(false),
            ComparisonOperator::Gte(bound) => scalar_cmp(value, bound, ordering)
                .map(|o| o != std::cmp::Ordering::Less)
                .unwrap_or(false),
            ComparisonOperator::Ne(other) => match value {
                None => true,
                Some(v) => !are_things_equal(v, other),
            },
            ComparisonOperator::In(members) => match value {
                None => false,
                Some(v) => members.iter().any(|m| are_things_equal(v, m)),
            },
            ComparisonOperator::Nin(members) => match value {
                None => true,
                Some(v) => !members.iter().any(|m| are_things_equal(v, m)),
            },
            ComparisonOperator::Regex(re) => match value.and_then(Value::as_str) {
                Some(s) => re.is_match(s),
                None => false,
            },
            ComparisonOperator::Exists(expected) => value.is_some() == *expected,
            ComparisonOperator::Size(n) => match value.and_then(Value::as_array) {
                Some(arr) => arr.len() == *n,
                None => false,
            },
            ComparisonOperator::ElemMatch(sub) => match value.and_then(Value::as_array) {
                Some(arr) => arr.iter().any(|el| sub.matches(el, ordering)),
                None => false,
            },
        }
    }
}

fn scalar_cmp(
    value: Option<&Value>,
    bound: &Value,
    ordering: &ValueOrdering,
) -> Option<std::cmp::Ordering> {
    value.and_then(|v| compare_scalars(v, bound, ordering))
}

/// Parse a full operator object (every key is an operator). Callers
/// have already established that no plain field keys are mixed in.
pub fn parse_operator_object(map: &serde_json::Map<String, Value>) -> Result<Vec<ComparisonOperator>> {
    map.iter()
        .map(|(k, v)| ComparisonOperator::parse(k, v))
        .collect()
}

/// Evaluate an operator set against a resolved value, applying the
/// sequence rule: when the value is a sequence and no array-specific
/// operator is present, the set matches if some element satisfies
/// every operator (recursively, so nested sequences flatten).
pub fn match_operator_set(
    value: Option<&Value>,
    ops: &[ComparisonOperator],
    ordering: &ValueOrdering,
) -> bool {
    if let Some(Value::Array(arr)) = value {
        if !ops.iter().any(ComparisonOperator::is_array_operator) {
            return arr
                .iter()
                .any(|el| match_operator_set(Some(el), ops, ordering));
        }
    }
    ops.iter().all(|op| op.matches(value, ordering))
}

/// Evaluate a literal clause against a resolved value. A sequence
/// value matches if some element equals the literal, unless the
/// literal is itself a sequence, which compares against the whole.
pub fn match_literal(
    value: Option<&Value>,
    literal: &Value,
    ordering: &ValueOrdering,
    treat_sequence_as_value: bool,
) -> bool {
    if let Some(Value::Array(arr)) = value {
        if !treat_sequence_as_value {
            if literal.is_array() {
                return match_literal(value, literal, ordering, true);
            }
            return arr
                .iter()
                .any(|el| match_literal(Some(el), literal, ordering, false));
        }
    }
    match value {
        Some(v) => are_things_equal(v, literal),
        None => false,
    }
}
