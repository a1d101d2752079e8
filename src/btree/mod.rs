//! Disk-resident B+-tree keyed on typed column values, storing a list of
//! row ids per key. Leaves are doubly linked in key order for range scans.
//!
//! Edits are create-new-then-swap: a change to a node builds a replacement
//! and rewires its parent and siblings, so node bytes never outgrow the
//! slot they were allocated into. Parent links are not stored in nodes; the
//! descent keeps the chain of ancestor ids instead.

use std::cmp::Ordering;

use tracing::trace;

use crate::error::{Error, Result};
use crate::physical::RowId;
use crate::schema::{ColumnType, Value};

pub mod node;
pub mod store;

pub use node::{Internal, KeyVals, Leaf, Node, NodeId};
pub use store::{HeapNodeStore, MemNodeStore, NodeStore};

pub type RootChangedFn = Box<dyn Fn(NodeId) -> Result<()> + Send + Sync>;

/// Default tree order: a node may hold up to `2 * order` keys.
pub const DEFAULT_ORDER: usize = 2;

/// Bounds of a range scan. At most one lower (`gt`/`gte`) and one upper
/// (`lt`/`lte`) bound may be supplied.
#[derive(Debug, Clone, Default)]
pub struct RangeSpec {
    pub gt: Option<Value>,
    pub gte: Option<Value>,
    pub lt: Option<Value>,
    pub lte: Option<Value>,
}

impl RangeSpec {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn gt(mut self, value: impl Into<Value>) -> Self {
        self.gt = Some(value.into());
        self
    }

    pub fn gte(mut self, value: impl Into<Value>) -> Self {
        self.gte = Some(value.into());
        self
    }

    pub fn lt(mut self, value: impl Into<Value>) -> Self {
        self.lt = Some(value.into());
        self
    }

    pub fn lte(mut self, value: impl Into<Value>) -> Self {
        self.lte = Some(value.into());
        self
    }

    fn validate(&self) -> Result<()> {
        if self.gt.is_some() && self.gte.is_some() {
            return Err(Error::InvalidRange {
                reason: "both gt and gte supplied".into(),
            });
        }
        if self.lt.is_some() && self.lte.is_some() {
            return Err(Error::InvalidRange {
                reason: "both lt and lte supplied".into(),
            });
        }
        Ok(())
    }

    fn lower(&self) -> Option<&Value> {
        self.gt.as_ref().or(self.gte.as_ref())
    }

    fn satisfies_lower(&self, key: &Value) -> bool {
        if let Some(bound) = &self.gt {
            return key.compare(bound) == Ordering::Greater;
        }
        if let Some(bound) = &self.gte {
            return key.compare(bound) != Ordering::Less;
        }
        true
    }

    fn satisfies_upper(&self, key: &Value) -> bool {
        if let Some(bound) = &self.lt {
            return key.compare(bound) == Ordering::Less;
        }
        if let Some(bound) = &self.lte {
            return key.compare(bound) != Ordering::Greater;
        }
        true
    }
}

pub struct BTree<S: NodeStore> {
    store: S,
    key_ty: ColumnType,
    order: usize,
    root: NodeId,
    on_root_changed: Option<RootChangedFn>,
}

impl<S: NodeStore> BTree<S> {
    /// Build a fresh tree: a sentinel internal root over one empty leaf.
    pub fn create(
        store: S,
        key_ty: ColumnType,
        order: usize,
        on_root_changed: Option<RootChangedFn>,
    ) -> Result<Self> {
        let first_leaf = store.create_leaf(vec![], None, None)?;
        let root = store.create_internal(vec![], vec![first_leaf.id])?;
        let mut tree = Self {
            store,
            key_ty,
            order: order.max(1),
            root: root.id,
            on_root_changed,
        };
        tree.notify_root()?;
        tree.store.commit()?;
        Ok(tree)
    }

    /// Mount a tree whose root node id is already known.
    pub fn open(
        store: S,
        key_ty: ColumnType,
        order: usize,
        root: NodeId,
        on_root_changed: Option<RootChangedFn>,
    ) -> Self {
        Self {
            store,
            key_ty,
            order: order.max(1),
            root,
            on_root_changed,
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn cmp(&self, a: &Value, b: &Value) -> Ordering {
        self.key_ty.compare(a, b)
    }

    fn notify_root(&self) -> Result<()> {
        if let Some(callback) = &self.on_root_changed {
            callback(self.root)?;
        }
        Ok(())
    }

    fn set_root(&mut self, id: NodeId) -> Result<()> {
        self.root = id;
        trace!(root = %id, "root node changed");
        self.notify_root()
    }

    fn as_leaf(node: Node) -> Result<Leaf> {
        match node {
            Node::Leaf(leaf) => Ok(leaf),
            Node::Internal(_) => Err(Error::WrongNodeType {
                found: node::INTERNAL_TAG,
                expected: node::LEAF_TAG,
            }),
        }
    }

    fn as_internal(node: Node) -> Result<Internal> {
        match node {
            Node::Internal(internal) => Ok(internal),
            Node::Leaf(_) => Err(Error::WrongNodeType {
                found: node::LEAF_TAG,
                expected: node::INTERNAL_TAG,
            }),
        }
    }

    /// Index of the child to descend into for `key`: the first position
    /// whose separator is strictly greater, else the last child.
    fn child_index(&self, keys: &[Value], key: &Value) -> usize {
        keys.iter()
            .position(|k| self.cmp(key, k) == Ordering::Less)
            .unwrap_or(keys.len())
    }

    /// Descend to the leaf owning `key`, collecting the ancestor ids
    /// root-first.
    fn find_leaf(&self, key: &Value) -> Result<(Leaf, Vec<NodeId>)> {
        let mut parents = Vec::new();
        let mut current = self.root;
        loop {
            match self.store.get(current)? {
                Node::Internal(internal) => {
                    parents.push(internal.id);
                    let index = self.child_index(&internal.keys, key);
                    current = internal.children[index];
                }
                Node::Leaf(leaf) => return Ok((leaf, parents)),
            }
        }
    }

    fn leftmost_leaf(&self) -> Result<Leaf> {
        let mut current = self.root;
        loop {
            match self.store.get(current)? {
                Node::Internal(internal) => current = internal.children[0],
                Node::Leaf(leaf) => return Ok(leaf),
            }
        }
    }

    pub fn get(&self, key: &Value) -> Result<Vec<RowId>> {
        let (leaf, _) = self.find_leaf(key)?;
        Ok(leaf
            .keyvals
            .iter()
            .find(|kv| self.cmp(&kv.key, key) == Ordering::Equal)
            .map(|kv| kv.vals.clone())
            .unwrap_or_default())
    }

    pub fn has(&self, key: &Value) -> Result<bool> {
        Ok(!self.get(key)?.is_empty())
    }

    pub fn insert(&mut self, key: Value, value: RowId) -> Result<()> {
        let (leaf, parents) = self.find_leaf(&key)?;

        let mut keyvals = leaf.keyvals.clone();
        match keyvals.binary_search_by(|kv| self.cmp(&kv.key, &key)) {
            Ok(index) => keyvals[index].vals.push(value),
            Err(index) => keyvals.insert(
                index,
                KeyVals {
                    key,
                    vals: vec![value],
                },
            ),
        }

        let replacement = self.store.create_leaf(keyvals, leaf.prev, leaf.next)?;
        self.replace_leaf(&leaf, replacement.id, &parents)?;

        if replacement.keyvals.len() > 2 * self.order {
            self.split_leaf(replacement, parents)?;
        }
        self.store.commit()
    }

    /// Swap `old` for `new_id` in the parent and in the sibling links, then
    /// drop the old leaf.
    fn replace_leaf(&mut self, old: &Leaf, new_id: NodeId, parents: &[NodeId]) -> Result<()> {
        let parent_id = *parents
            .last()
            .ok_or_else(|| Error::corrupt("leaf without a parent"))?;
        self.swap_child(parent_id, old.id, new_id)?;

        if let Some(prev_id) = old.prev {
            let mut prev = Self::as_leaf(self.store.get(prev_id)?)?;
            prev.next = Some(new_id);
            self.store.update(Node::Leaf(prev))?;
        }
        if let Some(next_id) = old.next {
            let mut next = Self::as_leaf(self.store.get(next_id)?)?;
            next.prev = Some(new_id);
            self.store.update(Node::Leaf(next))?;
        }
        self.store.delete(old.id)
    }

    fn swap_child(&self, parent_id: NodeId, old: NodeId, new: NodeId) -> Result<()> {
        let mut parent = Self::as_internal(self.store.get(parent_id)?)?;
        let position = parent
            .children
            .iter()
            .position(|&c| c == old)
            .ok_or_else(|| Error::corrupt(format!("child {old} missing from {parent_id}")))?;
        parent.children[position] = new;
        self.store.update(Node::Internal(parent))
    }

    fn split_leaf(&mut self, leaf: Leaf, parents: Vec<NodeId>) -> Result<()> {
        let mid = self.order;
        let right_keyvals = leaf.keyvals[mid..].to_vec();
        let left_keyvals = leaf.keyvals[..mid].to_vec();

        let right = self
            .store
            .create_leaf(right_keyvals, None, leaf.next)?;
        let left = self
            .store
            .create_leaf(left_keyvals, leaf.prev, Some(right.id))?;

        let mut right_linked = right.clone();
        right_linked.prev = Some(left.id);
        self.store.update(Node::Leaf(right_linked))?;

        if let Some(prev_id) = leaf.prev {
            let mut prev = Self::as_leaf(self.store.get(prev_id)?)?;
            prev.next = Some(left.id);
            self.store.update(Node::Leaf(prev))?;
        }
        if let Some(next_id) = leaf.next {
            let mut next = Self::as_leaf(self.store.get(next_id)?)?;
            next.prev = Some(right.id);
            self.store.update(Node::Leaf(next))?;
        }

        let parent_id = *parents
            .last()
            .ok_or_else(|| Error::corrupt("split leaf without a parent"))?;
        self.swap_child(parent_id, leaf.id, left.id)?;
        self.store.delete(leaf.id)?;

        let separator = right.keyvals[0].key.clone();
        self.insert_into_parent(parents, separator, right.id)
    }

    fn insert_into_parent(
        &mut self,
        mut parents: Vec<NodeId>,
        key: Value,
        child: NodeId,
    ) -> Result<()> {
        let parent_id = parents
            .pop()
            .ok_or_else(|| Error::corrupt("separator insert without a parent"))?;
        let parent = Self::as_internal(self.store.get(parent_id)?)?;

        let position = self.child_index(&parent.keys, &key);
        let mut keys = parent.keys.clone();
        keys.insert(position, key);
        let mut children = parent.children.clone();
        children.insert(position + 1, child);

        let replacement = self.store.create_internal(keys, children)?;
        match parents.last() {
            Some(&grandparent) => self.swap_child(grandparent, parent_id, replacement.id)?,
            None => self.set_root(replacement.id)?,
        }
        self.store.delete(parent_id)?;

        if replacement.keys.len() > 2 * self.order {
            self.split_internal(replacement, parents)?;
        }
        Ok(())
    }

    fn split_internal(&mut self, node: Internal, mut parents: Vec<NodeId>) -> Result<()> {
        if parents.is_empty() {
            // Splitting the root: grow the tree with a fresh single-child
            // root first.
            let new_root = self.store.create_internal(vec![], vec![node.id])?;
            self.set_root(new_root.id)?;
            parents.push(new_root.id);
        }

        let mid = self.order;
        let key_up = node.keys[mid].clone();
        let right = self.store.create_internal(
            node.keys[mid + 1..].to_vec(),
            node.children[mid + 1..].to_vec(),
        )?;
        let left = self
            .store
            .create_internal(node.keys[..mid].to_vec(), node.children[..mid + 1].to_vec())?;

        let parent_id = *parents.last().unwrap();
        self.swap_child(parent_id, node.id, left.id)?;
        self.store.delete(node.id)?;

        self.insert_into_parent(parents, key_up, right.id)
    }

    /// Drop `value` from the key's value list. The entry stays even when
    /// its list empties.
    pub fn remove(&mut self, key: &Value, value: RowId) -> Result<()> {
        let (leaf, parents) = self.find_leaf(key)?;
        let Some(position) = leaf
            .keyvals
            .iter()
            .position(|kv| self.cmp(&kv.key, key) == Ordering::Equal)
        else {
            return Ok(());
        };

        let mut keyvals = leaf.keyvals.clone();
        keyvals[position].vals.retain(|v| *v != value);

        let replacement = self.store.create_leaf(keyvals, leaf.prev, leaf.next)?;
        self.replace_leaf(&leaf, replacement.id, &parents)?;
        self.store.commit()
    }

    /// Drop the whole entry for `key`. No rebalancing happens on removal.
    pub fn remove_all(&mut self, key: &Value) -> Result<()> {
        let (leaf, parents) = self.find_leaf(key)?;
        let Some(position) = leaf
            .keyvals
            .iter()
            .position(|kv| self.cmp(&kv.key, key) == Ordering::Equal)
        else {
            return Ok(());
        };

        let mut keyvals = leaf.keyvals.clone();
        keyvals.remove(position);

        let replacement = self.store.create_leaf(keyvals, leaf.prev, leaf.next)?;
        self.replace_leaf(&leaf, replacement.id, &parents)?;
        self.store.commit()
    }

    /// Keys satisfying the range, in sorted order, with their value lists.
    pub fn get_range(&self, range: &RangeSpec) -> Result<Vec<(Value, Vec<RowId>)>> {
        range.validate()?;

        let mut leaf = match range.lower() {
            Some(bound) => self.find_leaf(bound)?.0,
            None => self.leftmost_leaf()?,
        };

        let mut out = Vec::new();
        loop {
            for kv in &leaf.keyvals {
                if !range.satisfies_lower(&kv.key) {
                    continue;
                }
                if !range.satisfies_upper(&kv.key) {
                    return Ok(out);
                }
                out.push((kv.key.clone(), kv.vals.clone()));
            }
            match leaf.next {
                Some(next) => leaf = Self::as_leaf(self.store.get(next)?)?,
                None => return Ok(out),
            }
        }
    }

    /// Every key in order, walking the leaf chain from the left spine.
    pub fn iter_all(&self) -> Result<Vec<(Value, Vec<RowId>)>> {
        self.get_range(&RangeSpec::all())
    }
}
