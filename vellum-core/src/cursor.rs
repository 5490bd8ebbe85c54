// src/cursor.rs
// Query builder: candidates -> filter -> sort -> skip/limit ->
// projection. `exec` goes through the executor; the internal path runs
// inside an already-running executor task.

use std::cmp::Ordering;
use std::sync::Arc;

use serde_json::Value;

use crate::datastore::{Inner, Shared};
use crate::error::Result;
use crate::index::SharedDoc;
use crate::projection::Projection;
use crate::query::{Query, WherePredicate};
use crate::value::get_dot_value;

/// A builder that materializes a query result
#[derive(Clone)]
pub struct Cursor {
    shared: Arc<Shared>,
    query: Value,
    where_pred: Option<WherePredicate>,
    sort: Option<Vec<(String, i32)>>,
    projection: Option<Value>,
    limit: Option<usize>,
    skip: Option<usize>,
}

impl Cursor {
    pub(crate) fn new(shared: Arc<Shared>, query: Value) -> Cursor {
        Cursor {
            shared,
            query,
            where_pred: None,
            sort: None,
            projection: None,
            limit: None,
            skip: None,
        }
    }

    /// Sort keys applied lexicographically: direction 1 ascending,
    /// -1 descending
    pub fn sort<S: Into<String>>(mut self, keys: Vec<(S, i32)>) -> Self {
        self.sort = Some(keys.into_iter().map(|(k, d)| (k.into(), d)).collect());
        self
    }

    /// Pick/omit projection, validated at exec time
    pub fn projection(mut self, projection: Value) -> Self {
        self.projection = Some(projection);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    /// Attach a predicate evaluated against each whole document
    /// (the `$where` clause)
    pub fn with_where(mut self, predicate: WherePredicate) -> Self {
        self.where_pred = Some(predicate);
        self
    }

    /// Run the query through the executor and return document copies
    pub fn exec(&self) -> Result<Vec<Value>> {
        let cursor = self.clone();
        let sh = self.shared.clone();
        self.shared.executor.submit(false, move || {
            let mut inner = sh.inner.lock();
            cursor.exec_locked(&sh, &mut inner)
        })
    }

    // The in-task query path, shared by exec / find_one / count
    pub(crate) fn exec_locked(&self, shared: &Arc<Shared>, inner: &mut Inner) -> Result<Vec<Value>> {
        let mut query = Query::parse(&self.query)?;
        if let Some(pred) = &self.where_pred {
            query = query.with_where(pred.clone());
        }
        let projection = match &self.projection {
            Some(p) => Some(Projection::parse(p)?),
            None => None,
        };

        let candidates = Shared::get_candidates(shared, inner, &query, false);
        let ordering = &shared.ordering;
        let skip = self.skip.unwrap_or(0);

        let matched: Vec<SharedDoc> = if let Some(sort_keys) = &self.sort {
            // Collect everything first, then sort, skip, limit
            let mut all: Vec<SharedDoc> = candidates
                .into_iter()
                .filter(|d| query.matches(d.as_ref(), ordering))
                .collect();
            all.sort_by(|a, b| {
                for (path, direction) in sort_keys {
                    let va = get_dot_value(a.as_ref(), path);
                    let vb = get_dot_value(b.as_ref(), path);
                    let mut cmp = ordering.compare_opt(va.as_ref(), vb.as_ref());
                    if *direction < 0 {
                        cmp = cmp.reverse();
                    }
                    if cmp != Ordering::Equal {
                        return cmp;
                    }
                }
                Ordering::Equal
            });
            all.into_iter()
                .skip(skip)
                .take(self.limit.unwrap_or(usize::MAX))
                .collect()
        } else {
            // Unsorted: skip and limit during the scan, early-out on
            // the limit
            let mut picked = Vec::new();
            let mut skipped = 0usize;
            for doc in candidates {
                if !query.matches(doc.as_ref(), ordering) {
                    continue;
                }
                if skipped < skip {
                    skipped += 1;
                    continue;
                }
                picked.push(doc);
                if let Some(limit) = self.limit {
                    if picked.len() >= limit {
                        break;
                    }
                }
            }
            picked
        };

        let mut out = Vec::with_capacity(matched.len());
        for doc in matched {
            let copy = match &projection {
                Some(p) => p.apply(doc.as_ref())?,
                None => doc.as_ref().clone(),
            };
            out.push(copy);
        }
        Ok(out)
    }
}
