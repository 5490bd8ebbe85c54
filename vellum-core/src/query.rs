// src/query.rs
//! Query parsing for the document-style query language.
//!
//! A query is parsed once, up front, into a closed tree of clauses.
//! Field clauses hold either a literal (exact equality) or a set of
//! comparison operators; logical clauses hold sub-queries. All
//! structural validation (unknown operators, operator/field mixing,
//! malformed operands) happens here, never during matching.

pub mod operators;

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::compare::ValueOrdering;
use crate::error::{Result, VellumError};
use crate::value::{get_dot_value, is_date};
use operators::{match_literal, match_operator_set, parse_operator_object, ComparisonOperator};

/// Caller-supplied predicate attached through [`Query::with_where`]
/// (the `$where` operator; closures cannot travel inside JSON).
pub type WherePredicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// The right-hand side of a field clause
#[derive(Debug, Clone)]
pub enum ClauseValue {
    /// Exact structural equality
    Literal(Value),
    /// All operators must hold
    Operators(Vec<ComparisonOperator>),
}

/// One `path: value-or-operators` entry of a query
#[derive(Debug, Clone)]
pub struct FieldClause {
    pub path: String,
    pub value: ClauseValue,
}

/// One top-level clause of a query
#[derive(Clone)]
pub enum Clause {
    Field(FieldClause),
    And(Vec<Query>),
    Or(Vec<Query>),
    Not(Box<Query>),
    Where(WherePredicate),
}

impl fmt::Debug for Clause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Clause::Field(fc) => f.debug_tuple("Field").field(fc).finish(),
            Clause::And(qs) => f.debug_tuple("And").field(qs).finish(),
            Clause::Or(qs) => f.debug_tuple("Or").field(qs).finish(),
            Clause::Not(q) => f.debug_tuple("Not").field(q).finish(),
            Clause::Where(_) => f.write_str("Where(<predicate>)"),
        }
    }
}

/// A parsed query; matching is infallible once parsing succeeded
#[derive(Debug, Clone, Default)]
pub struct Query {
    clauses: Vec<Clause>,
}

impl Query {
    /// Parse a query mapping. The empty query matches every document.
    pub fn parse(query: &Value) -> Result<Query> {
        let map = query.as_object().ok_or_else(|| {
            VellumError::InvalidQuery("a query must be a mapping".to_string())
        })?;

        let mut clauses = Vec::with_capacity(map.len());
        for (key, value) in map {
            if let Some(stripped) = key.strip_prefix('$') {
                clauses.push(Self::parse_logical(stripped, key, value)?);
            } else {
                clauses.push(Clause::Field(FieldClause {
                    path: key.clone(),
                    value: Self::parse_clause_value(value)?,
                }));
            }
        }
        Ok(Query { clauses })
    }

    fn parse_logical(stripped: &str, key: &str, value: &Value) -> Result<Clause> {
        match stripped {
            "or" | "and" => {
                let subs = value.as_array().ok_or_else(|| {
                    VellumError::InvalidQuery(format!("{} operator used without an array", key))
                })?;
                let queries = subs.iter().map(Query::parse).collect::<Result<Vec<_>>>()?;
                if stripped == "or" {
                    Ok(Clause::Or(queries))
                } else {
                    Ok(Clause::And(queries))
                }
            }
            "not" => Ok(Clause::Not(Box::new(Query::parse(value)?))),
            "where" => Err(VellumError::InvalidQuery(
                "$where takes a predicate; attach one with Query::with_where".to_string(),
            )),
            _ => Err(VellumError::UnknownOperator(key.to_string())),
        }
    }

    fn parse_clause_value(value: &Value) -> Result<ClauseValue> {
        // A tagged date is a literal even though its key starts with $
        if is_date(value) {
            return Ok(ClauseValue::Literal(value.clone()));
        }
        if let Value::Object(map) = value {
            let dollar_keys = map.keys().filter(|k| k.starts_with('$')).count();
            if dollar_keys > 0 {
                if dollar_keys < map.len() {
                    return Err(VellumError::MixedQuery);
                }
                return Ok(ClauseValue::Operators(parse_operator_object(map)?));
            }
        }
        Ok(ClauseValue::Literal(value.clone()))
    }

    /// Attach a `$where` predicate evaluated against the whole document
    pub fn with_where(mut self, predicate: WherePredicate) -> Self {
        self.clauses.push(Clause::Where(predicate));
        self
    }

    /// Evaluate the query against a document
    pub fn matches(&self, doc: &Value, ordering: &ValueOrdering) -> bool {
        self.clauses.iter().all(|c| Self::clause_matches(c, doc, ordering))
    }

    fn clause_matches(clause: &Clause, doc: &Value, ordering: &ValueOrdering) -> bool {
        match clause {
            Clause::Field(fc) => {
                let value = get_dot_value(doc, &fc.path);
                match &fc.value {
                    ClauseValue::Literal(lit) => {
                        match_literal(value.as_ref(), lit, ordering, false)
                    }
                    ClauseValue::Operators(ops) => {
                        match_operator_set(value.as_ref(), ops, ordering)
                    }
                }
            }
            Clause::And(subs) => subs.iter().all(|q| q.matches(doc, ordering)),
            Clause::Or(subs) => subs.iter().any(|q| q.matches(doc, ordering)),
            Clause::Not(sub) => !sub.matches(doc, ordering),
            Clause::Where(pred) => pred(doc),
        }
    }

    /// Top-level field clauses, in query order (candidate selection
    /// inspects these for index strategies)
    pub fn field_clauses(&self) -> impl Iterator<Item = &FieldClause> {
        self.clauses.iter().filter_map(|c| match c {
            Clause::Field(fc) => Some(fc),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::make_date;
    use serde_json::json;

    fn ord() -> ValueOrdering {
        ValueOrdering::new()
    }

    fn matches(query: Value, doc: Value) -> bool {
        Query::parse(&query).unwrap().matches(&doc, &ord())
    }

    #[test]
    fn test_empty_query_matches_everything() {
        assert!(matches(json!({}), json!({"a": 1})));
    }

    #[test]
    fn test_literal_equality() {
        assert!(matches(json!({"name": "Ada"}), json!({"name": "Ada"})));
        assert!(!matches(json!({"name": "Ada"}), json!({"name": "Bob"})));
        assert!(!matches(json!({"name": "Ada"}), json!({"other": 1})));
        // Deep equality on nested mappings
        assert!(matches(
            json!({"specs": {"cpu": 2, "ram": 4}}),
            json!({"specs": {"cpu": 2, "ram": 4}})
        ));
        assert!(!matches(
            json!({"specs": {"cpu": 2}}),
            json!({"specs": {"cpu": 2, "ram": 4}})
        ));
    }

    #[test]
    fn test_dot_path_clauses() {
        let doc = json!({"address": {"city": "Lyon", "zip": "69001"}});
        assert!(matches(json!({"address.city": "Lyon"}), doc.clone()));
        assert!(!matches(json!({"address.city": "Paris"}), doc));
    }

    #[test]
    fn test_date_literal_is_equality_not_operator() {
        let doc = json!({"seen": make_date(777)});
        assert!(matches(json!({"seen": {"$$date": 777}}), doc.clone()));
        assert!(!matches(json!({"seen": {"$$date": 778}}), doc));
    }

    #[test]
    fn test_operator_objects() {
        let doc = json!({"age": 35});
        assert!(matches(json!({"age": {"$gte": 18, "$lt": 60}}), doc.clone()));
        assert!(!matches(json!({"age": {"$gte": 18, "$lt": 30}}), doc));
    }

    #[test]
    fn test_mixed_query_is_rejected() {
        assert!(matches!(
            Query::parse(&json!({"age": {"$gt": 5, "plain": 1}})),
            Err(VellumError::MixedQuery)
        ));
    }

    #[test]
    fn test_unknown_operators_are_rejected_at_parse() {
        assert!(matches!(
            Query::parse(&json!({"age": {"$fuzzy": 5}})),
            Err(VellumError::UnknownOperator(_))
        ));
        assert!(matches!(
            Query::parse(&json!({"$nor": [{"a": 1}]})),
            Err(VellumError::UnknownOperator(_))
        ));
    }

    #[test]
    fn test_logical_operators() {
        let doc = json!({"age": 70, "city": "Oslo"});
        assert!(matches(
            json!({"$or": [{"age": {"$lt": 18}}, {"age": {"$gt": 65}}]}),
            doc.clone()
        ));
        assert!(matches(
            json!({"$and": [{"age": {"$gt": 65}}, {"city": "Oslo"}]}),
            doc.clone()
        ));
        assert!(matches(json!({"$not": {"city": "Paris"}}), doc.clone()));
        assert!(!matches(json!({"$not": {"city": "Oslo"}}), doc));
    }

    #[test]
    fn test_logical_operator_operand_validation() {
        assert!(Query::parse(&json!({"$or": {"a": 1}})).is_err());
        assert!(Query::parse(&json!({"$where": "js code"})).is_err());
    }

    #[test]
    fn test_where_predicate() {
        let q = Query::parse(&json!({}))
            .unwrap()
            .with_where(Arc::new(|doc: &Value| {
                doc.get("age").and_then(Value::as_i64).unwrap_or(0) % 2 == 0
            }));
        assert!(q.matches(&json!({"age": 4}), &ord()));
        assert!(!q.matches(&json!({"age": 5}), &ord()));
    }

    #[test]
    fn test_sequence_any_element_rule() {
        let doc = json!({"tags": ["db", "rust", "embedded"]});
        assert!(matches(json!({"tags": "rust"}), doc.clone()));
        assert!(!matches(json!({"tags": "python"}), doc.clone()));
        assert!(matches(json!({"tags": {"$size": 3}}), doc.clone()));
        assert!(matches(json!({"tags": {"$in": ["python", "rust"]}}), doc));
    }

    #[test]
    fn test_mapped_dot_path_over_array_of_mappings() {
        let doc = json!({"crew": [{"name": "Kim"}, {"name": "Sol"}]});
        assert!(matches(json!({"crew.name": "Sol"}), doc.clone()));
        assert!(matches(json!({"crew.0.name": "Kim"}), doc.clone()));
        assert!(!matches(json!({"crew.1.name": "Kim"}), doc));
    }

    #[test]
    fn test_exists() {
        let doc = json!({"a": null, "b": 2});
        assert!(matches(json!({"a": {"$exists": true}}), doc.clone()));
        assert!(matches(json!({"c": {"$exists": false}}), doc.clone()));
        assert!(!matches(json!({"b": {"$exists": false}}), doc));
    }
}
