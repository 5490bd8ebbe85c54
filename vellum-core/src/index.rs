// src/index.rs
// Secondary indexes over the ordered tree, and the index set that fans
// every mutation out across all of them with all-or-nothing semantics.

pub mod tree;

use std::collections::BTreeMap;
use std::sync::Arc;

use ahash::AHashSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::compare::{are_things_equal, ValueOrdering};
use crate::error::{Result, VellumError};
use crate::value::get_dot_value;
use tree::{AvlTree, Bounds, TreeKey};

/// Canonical in-memory document: the `_id` index owns these, secondary
/// indexes and result sets share them
pub type SharedDoc = Arc<Value>;

/// Options given to `ensure_index`, also the payload of the
/// `$$indexCreated` log record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexOptions {
    pub field_name: String,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub sparse: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_after_seconds: Option<i64>,
}

impl IndexOptions {
    pub fn field(field_name: &str) -> Self {
        IndexOptions {
            field_name: field_name.to_string(),
            unique: false,
            sparse: false,
            expire_after_seconds: None,
        }
    }

    pub fn with_unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    pub fn with_sparse(mut self, sparse: bool) -> Self {
        self.sparse = sparse;
        self
    }

    pub fn with_expire_after_seconds(mut self, seconds: i64) -> Self {
        self.expire_after_seconds = Some(seconds);
        self
    }
}

fn format_key(key: &TreeKey) -> String {
    match key {
        None => "undefined".to_string(),
        Some(v) => v.to_string(),
    }
}

/// One field index. A sequence-valued field files the document once
/// per distinct element; a non-sparse index files an unresolved field
/// under the undefined band (so a unique, non-sparse index rejects two
/// documents both missing the field).
pub struct Index {
    field_name: String,
    unique: bool,
    sparse: bool,
    tree: AvlTree,
}

impl Index {
    pub fn new(options: &IndexOptions, ordering: ValueOrdering) -> Index {
        Index {
            field_name: options.field_name.clone(),
            unique: options.unique,
            sparse: options.sparse,
            tree: AvlTree::new(ordering),
        }
    }

    pub fn field_name(&self) -> &str {
        &self.field_name
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    pub fn is_sparse(&self) -> bool {
        self.sparse
    }

    pub fn options(&self) -> IndexOptions {
        IndexOptions {
            field_name: self.field_name.clone(),
            unique: self.unique,
            sparse: self.sparse,
            expire_after_seconds: None,
        }
    }

    /// Drop every entry, keeping the definition
    pub fn reset(&mut self) {
        self.tree.clear();
    }

    pub fn key_count(&self) -> usize {
        self.tree.key_count()
    }

    // The keys a document is filed under
    fn keys_for(&self, doc: &Value) -> Vec<TreeKey> {
        match get_dot_value(doc, &self.field_name) {
            None => {
                if self.sparse {
                    Vec::new()
                } else {
                    vec![None]
                }
            }
            Some(Value::Array(elements)) => {
                let mut distinct: Vec<Value> = Vec::new();
                for el in &elements {
                    if !distinct.iter().any(|k| are_things_equal(k, el)) {
                        distinct.push(el.clone());
                    }
                }
                distinct.into_iter().map(Some).collect()
            }
            Some(v) => vec![Some(v)],
        }
    }

    /// Insert a document under each of its keys. If one of the k
    /// inserts for a sequence-valued field fails, the preceding k-1
    /// are rolled back before the error surfaces.
    pub fn insert(&mut self, doc: &SharedDoc) -> Result<()> {
        let keys = self.keys_for(doc);
        for (i, key) in keys.iter().enumerate() {
            if self.unique && self.tree.contains_key(key) {
                for done in &keys[..i] {
                    self.tree.remove(done, doc);
                }
                return Err(VellumError::UniqueViolation {
                    field: self.field_name.clone(),
                    key: format_key(key),
                });
            }
            self.tree.insert(key.clone(), doc.clone());
        }
        Ok(())
    }

    /// Insert a batch; on failure every document of the batch is rolled
    /// back (used by index builds and multi-inserts)
    pub fn insert_all(&mut self, docs: &[SharedDoc]) -> Result<()> {
        for (i, doc) in docs.iter().enumerate() {
            if let Err(e) = self.insert(doc) {
                for done in &docs[..i] {
                    self.remove(done);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Remove the (key, doc) pairs of a document; silent if absent
    pub fn remove(&mut self, doc: &SharedDoc) {
        for key in self.keys_for(doc) {
            self.tree.remove(&key, doc);
        }
    }

    /// Remove old, insert new; restores old on failure
    pub fn update(&mut self, old: &SharedDoc, new: &SharedDoc) -> Result<()> {
        self.remove(old);
        if let Err(e) = self.insert(new) {
            // The original held these slots a moment ago, this cannot fail
            let _ = self.insert(old);
            return Err(e);
        }
        Ok(())
    }

    /// Two-phase multi-pair update: remove every old, insert every new;
    /// on failure the olds are restored
    pub fn update_multiple(&mut self, pairs: &[(SharedDoc, SharedDoc)]) -> Result<()> {
        for (old, _) in pairs {
            self.remove(old);
        }
        for (i, (_, new)) in pairs.iter().enumerate() {
            if let Err(e) = self.insert(new) {
                for (_, inserted) in &pairs[..i] {
                    self.remove(inserted);
                }
                for (old, _) in pairs {
                    let _ = self.insert(old);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Inverse of [`Index::update`]
    pub fn revert_update(&mut self, old: &SharedDoc, new: &SharedDoc) -> Result<()> {
        self.update(new, old)
    }

    /// All documents at exactly this key
    pub fn search(&self, value: &Value) -> Vec<SharedDoc> {
        self.tree.search(&Some(value.clone()))
    }

    /// Union of `search` over several keys, each document once
    pub fn search_any(&self, values: &[Value]) -> Vec<SharedDoc> {
        let mut seen: AHashSet<String> = AHashSet::new();
        let mut out = Vec::new();
        for value in values {
            for doc in self.search(value) {
                let id = doc.get("_id").and_then(Value::as_str).unwrap_or("").to_string();
                if seen.insert(id) {
                    out.push(doc);
                }
            }
        }
        out
    }

    /// Documents with keys inside the bounds, ascending
    pub fn between_bounds(&self, bounds: &Bounds) -> Vec<SharedDoc> {
        self.tree.between_bounds(bounds)
    }

    /// Every document, in ascending key order
    pub fn all(&self) -> Vec<SharedDoc> {
        let mut out = Vec::new();
        self.tree.for_each(&mut |_, docs| out.extend(docs.iter().cloned()));
        out
    }
}

/// The collection's indexes, `_id` always included. All mutations fan
/// out across every index with all-or-nothing semantics.
pub struct IndexSet {
    indexes: BTreeMap<String, Index>,
    ordering: ValueOrdering,
}

impl IndexSet {
    pub fn new(ordering: ValueOrdering) -> IndexSet {
        let mut indexes = BTreeMap::new();
        indexes.insert(
            "_id".to_string(),
            Index::new(&IndexOptions::field("_id").with_unique(true), ordering.clone()),
        );
        IndexSet { indexes, ordering }
    }

    /// Drop all entries from every index, keeping definitions
    pub fn reset_data(&mut self) {
        for index in self.indexes.values_mut() {
            index.reset();
        }
    }

    /// Create the index if it does not exist yet; returns whether it
    /// was created
    pub fn ensure(&mut self, options: &IndexOptions) -> bool {
        if self.indexes.contains_key(&options.field_name) {
            return false;
        }
        self.indexes.insert(
            options.field_name.clone(),
            Index::new(options, self.ordering.clone()),
        );
        true
    }

    /// Drop an index; the `_id` index cannot be dropped
    pub fn remove_index(&mut self, field_name: &str) {
        if field_name != "_id" {
            self.indexes.remove(field_name);
        }
    }

    pub fn contains(&self, field_name: &str) -> bool {
        self.indexes.contains_key(field_name)
    }

    pub fn get(&self, field_name: &str) -> Option<&Index> {
        self.indexes.get(field_name)
    }

    pub fn get_mut(&mut self, field_name: &str) -> Option<&mut Index> {
        self.indexes.get_mut(field_name)
    }

    pub fn id_index(&self) -> &Index {
        self.indexes.get("_id").expect("the _id index always exists")
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Index)> {
        self.indexes.iter()
    }

    fn names(&self) -> Vec<String> {
        self.indexes.keys().cloned().collect()
    }

    /// Insert a document into every index; on the first failure the
    /// insert is undone on every earlier index
    pub fn add_document(&mut self, doc: &SharedDoc) -> Result<()> {
        let names = self.names();
        for (i, name) in names.iter().enumerate() {
            let outcome = match self.indexes.get_mut(name) {
                Some(index) => index.insert(doc),
                None => Ok(()),
            };
            if let Err(e) = outcome {
                for undone in &names[..i] {
                    if let Some(index) = self.indexes.get_mut(undone) {
                        index.remove(doc);
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Insert a batch atomically: a failure rolls back every document
    /// of the batch already indexed
    pub fn add_documents(&mut self, docs: &[SharedDoc]) -> Result<()> {
        for (i, doc) in docs.iter().enumerate() {
            if let Err(e) = self.add_document(doc) {
                for done in &docs[..i] {
                    self.remove_document(done);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Remove a document from every index; removal is idempotent, no
    /// rollback needed
    pub fn remove_document(&mut self, doc: &SharedDoc) {
        for index in self.indexes.values_mut() {
            index.remove(doc);
        }
    }

    /// Replace old with new in every index; on failure the update is
    /// reverted on every index already updated
    pub fn update_document(&mut self, old: &SharedDoc, new: &SharedDoc) -> Result<()> {
        let names = self.names();
        for (i, name) in names.iter().enumerate() {
            let outcome = match self.indexes.get_mut(name) {
                Some(index) => index.update(old, new),
                None => Ok(()),
            };
            if let Err(e) = outcome {
                for undone in &names[..i] {
                    if let Some(index) = self.indexes.get_mut(undone) {
                        let _ = index.revert_update(old, new);
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Multi-pair variant of [`IndexSet::update_document`]
    pub fn update_documents(&mut self, pairs: &[(SharedDoc, SharedDoc)]) -> Result<()> {
        if pairs.len() == 1 {
            return self.update_document(&pairs[0].0, &pairs[0].1);
        }
        let names = self.names();
        for (i, name) in names.iter().enumerate() {
            let outcome = match self.indexes.get_mut(name) {
                Some(index) => index.update_multiple(pairs),
                None => Ok(()),
            };
            if let Err(e) = outcome {
                let reverted: Vec<(SharedDoc, SharedDoc)> =
                    pairs.iter().map(|(o, n)| (n.clone(), o.clone())).collect();
                for undone in &names[..i] {
                    if let Some(index) = self.indexes.get_mut(undone) {
                        let _ = index.update_multiple(&reverted);
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Inverse primitive: roll a committed update back across every
    /// index (used when a later, non-index step fails)
    pub fn revert_update_documents(&mut self, pairs: &[(SharedDoc, SharedDoc)]) -> Result<()> {
        let reverted: Vec<(SharedDoc, SharedDoc)> =
            pairs.iter().map(|(o, n)| (n.clone(), o.clone())).collect();
        self.update_documents(&reverted)
    }
}
