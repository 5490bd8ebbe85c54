// src/index/tree.rs
// Self-balancing ordered binary tree (AVL) mapping a document value to
// the documents carrying it. Keys follow the document total order with
// the undefined band lowest, so a custom string comparator is threaded
// through every comparison rather than relying on `Ord`.

use std::cmp::Ordering;
use std::sync::Arc;

use serde_json::Value;

use crate::compare::ValueOrdering;

use super::SharedDoc;

/// A tree key: `None` is the undefined band (a document whose indexed
/// field does not resolve, filed by non-sparse indexes)
pub type TreeKey = Option<Value>;

/// Range bounds for an ascending key scan
#[derive(Debug, Clone, Default)]
pub struct Bounds {
    pub gt: Option<Value>,
    pub gte: Option<Value>,
    pub lt: Option<Value>,
    pub lte: Option<Value>,
}

struct AvlNode {
    key: TreeKey,
    docs: Vec<SharedDoc>,
    height: i32,
    left: Link,
    right: Link,
}

type Link = Option<Box<AvlNode>>;

/// AVL tree with one node per distinct key and a document list per
/// node. Document removal is by shared-reference identity.
pub struct AvlTree {
    root: Link,
    ordering: ValueOrdering,
    key_count: usize,
}

impl AvlTree {
    pub fn new(ordering: ValueOrdering) -> Self {
        AvlTree {
            root: None,
            ordering,
            key_count: 0,
        }
    }

    pub fn clear(&mut self) {
        self.root = None;
        self.key_count = 0;
    }

    /// Number of distinct keys
    pub fn key_count(&self) -> usize {
        self.key_count
    }

    pub fn contains_key(&self, key: &TreeKey) -> bool {
        self.find(key).is_some()
    }

    /// All documents filed under `key`
    pub fn search(&self, key: &TreeKey) -> Vec<SharedDoc> {
        self.find(key)
            .map(|node| node.docs.clone())
            .unwrap_or_default()
    }

    /// Insert one (key, doc) pair; duplicate keys share a node
    pub fn insert(&mut self, key: TreeKey, doc: SharedDoc) {
        let ordering = self.ordering.clone();
        let mut added = false;
        Self::insert_rec(&mut self.root, key, doc, &ordering, &mut added);
        if added {
            self.key_count += 1;
        }
    }

    /// Remove the (key, doc) pair, matching the document by identity;
    /// silent if the pair is not present
    pub fn remove(&mut self, key: &TreeKey, doc: &SharedDoc) {
        let ordering = self.ordering.clone();
        let mut removed = false;
        Self::remove_rec(&mut self.root, key, doc, &ordering, &mut removed);
        if removed {
            self.key_count -= 1;
        }
    }

    /// Documents with keys inside the bounds, in ascending key order
    pub fn between_bounds(&self, bounds: &Bounds) -> Vec<SharedDoc> {
        let mut out = Vec::new();
        Self::collect_range(&self.root, bounds, &self.ordering, &mut out);
        out
    }

    /// In-order traversal over every node
    pub fn for_each<F: FnMut(&TreeKey, &[SharedDoc])>(&self, f: &mut F) {
        Self::visit(&self.root, f);
    }

    fn find(&self, key: &TreeKey) -> Option<&AvlNode> {
        let mut current = self.root.as_deref();
        while let Some(node) = current {
            match self.ordering.compare_opt(key.as_ref(), node.key.as_ref()) {
                Ordering::Less => current = node.left.as_deref(),
                Ordering::Greater => current = node.right.as_deref(),
                Ordering::Equal => return Some(node),
            }
        }
        None
    }

    fn insert_rec(
        link: &mut Link,
        key: TreeKey,
        doc: SharedDoc,
        ordering: &ValueOrdering,
        added: &mut bool,
    ) {
        if let Some(node) = link.as_mut() {
            match ordering.compare_opt(key.as_ref(), node.key.as_ref()) {
                Ordering::Equal => {
                    node.docs.push(doc);
                    return;
                }
                Ordering::Less => Self::insert_rec(&mut node.left, key, doc, ordering, added),
                Ordering::Greater => Self::insert_rec(&mut node.right, key, doc, ordering, added),
            }
        } else {
            *link = Some(Box::new(AvlNode {
                key,
                docs: vec![doc],
                height: 1,
                left: None,
                right: None,
            }));
            *added = true;
            return;
        }
        Self::rebalance(link);
    }

    fn remove_rec(
        link: &mut Link,
        key: &TreeKey,
        doc: &SharedDoc,
        ordering: &ValueOrdering,
        removed: &mut bool,
    ) {
        enum Step {
            Left,
            Right,
            DeleteNode,
            Done,
        }

        let step = {
            let Some(node) = link.as_mut() else { return };
            match ordering.compare_opt(key.as_ref(), node.key.as_ref()) {
                Ordering::Less => Step::Left,
                Ordering::Greater => Step::Right,
                Ordering::Equal => {
                    if let Some(pos) = node.docs.iter().position(|d| Arc::ptr_eq(d, doc)) {
                        node.docs.remove(pos);
                    }
                    if node.docs.is_empty() {
                        Step::DeleteNode
                    } else {
                        Step::Done
                    }
                }
            }
        };

        match step {
            Step::Done => return,
            Step::Left => {
                if let Some(node) = link.as_mut() {
                    Self::remove_rec(&mut node.left, key, doc, ordering, removed);
                }
            }
            Step::Right => {
                if let Some(node) = link.as_mut() {
                    Self::remove_rec(&mut node.right, key, doc, ordering, removed);
                }
            }
            Step::DeleteNode => {
                *removed = true;
                if let Some(mut node) = link.take() {
                    *link = match (node.left.take(), node.right.take()) {
                        (None, None) => None,
                        (Some(l), None) => Some(l),
                        (None, Some(r)) => Some(r),
                        (Some(l), Some(r)) => {
                            // Replace with the in-order successor
                            let mut right: Link = Some(r);
                            if let Some((k, d)) = Self::pop_min(&mut right) {
                                node.key = k;
                                node.docs = d;
                            }
                            node.left = Some(l);
                            node.right = right;
                            Some(node)
                        }
                    };
                }
            }
        }
        Self::rebalance(link);
    }

    // Detach the smallest node of the subtree, rebalancing on the way up
    fn pop_min(link: &mut Link) -> Option<(TreeKey, Vec<SharedDoc>)> {
        let has_left = link.as_ref().map_or(false, |n| n.left.is_some());
        if has_left {
            let result = match link.as_mut() {
                Some(node) => Self::pop_min(&mut node.left),
                None => None,
            };
            Self::rebalance(link);
            result
        } else {
            let mut node = link.take()?;
            *link = node.right.take();
            Some((node.key, node.docs))
        }
    }

    fn height(link: &Link) -> i32 {
        link.as_ref().map_or(0, |n| n.height)
    }

    fn update_height(node: &mut AvlNode) {
        node.height = 1 + Self::height(&node.left).max(Self::height(&node.right));
    }

    fn balance_factor(node: &AvlNode) -> i32 {
        Self::height(&node.left) - Self::height(&node.right)
    }

    fn link_balance(link: &Link) -> i32 {
        link.as_ref().map_or(0, |n| Self::balance_factor(n))
    }

    fn rotate_right(mut node: Box<AvlNode>) -> Box<AvlNode> {
        match node.left.take() {
            Some(mut pivot) => {
                node.left = pivot.right.take();
                Self::update_height(&mut node);
                pivot.right = Some(node);
                Self::update_height(&mut pivot);
                pivot
            }
            None => node,
        }
    }

    fn rotate_left(mut node: Box<AvlNode>) -> Box<AvlNode> {
        match node.right.take() {
            Some(mut pivot) => {
                node.right = pivot.left.take();
                Self::update_height(&mut node);
                pivot.left = Some(node);
                Self::update_height(&mut pivot);
                pivot
            }
            None => node,
        }
    }

    fn rebalance(link: &mut Link) {
        let Some(mut node) = link.take() else { return };
        Self::update_height(&mut node);
        let bf = Self::balance_factor(&node);
        if bf > 1 {
            if Self::link_balance(&node.left) < 0 {
                if let Some(l) = node.left.take() {
                    node.left = Some(Self::rotate_left(l));
                }
            }
            node = Self::rotate_right(node);
        } else if bf < -1 {
            if Self::link_balance(&node.right) > 0 {
                if let Some(r) = node.right.take() {
                    node.right = Some(Self::rotate_right(r));
                }
            }
            node = Self::rotate_left(node);
        }
        *link = Some(node);
    }

    fn collect_range(
        link: &Link,
        bounds: &Bounds,
        ordering: &ValueOrdering,
        out: &mut Vec<SharedDoc>,
    ) {
        let Some(node) = link.as_deref() else { return };
        let key = node.key.as_ref();

        let lower_ok = bounds.gt.as_ref().map_or(true, |b| {
            ordering.compare_opt(key, Some(b)) == Ordering::Greater
        }) && bounds.gte.as_ref().map_or(true, |b| {
            ordering.compare_opt(key, Some(b)) != Ordering::Less
        });
        let upper_ok = bounds.lt.as_ref().map_or(true, |b| {
            ordering.compare_opt(key, Some(b)) == Ordering::Less
        }) && bounds.lte.as_ref().map_or(true, |b| {
            ordering.compare_opt(key, Some(b)) != Ordering::Greater
        });

        if lower_ok {
            Self::collect_range(&node.left, bounds, ordering, out);
            if upper_ok {
                out.extend(node.docs.iter().cloned());
            }
        }
        if upper_ok {
            Self::collect_range(&node.right, bounds, ordering, out);
        }
    }

    fn visit<F: FnMut(&TreeKey, &[SharedDoc])>(link: &Link, f: &mut F) {
        if let Some(node) = link.as_deref() {
            Self::visit(&node.left, f);
            f(&node.key, &node.docs);
            Self::visit(&node.right, f);
        }
    }
}
