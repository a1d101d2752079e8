//! Node stores: where B+-tree nodes live. The in-memory flavor backs
//! rebuilt-at-open indexes; the heap flavor persists nodes as records in a
//! heap page file and batches writes in a dirty cache until commit.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::trace;

use crate::error::{Error, Result};
use crate::physical::heap::HeapPageFile;
use crate::physical::pager::PagePool;
use crate::physical::slotted;
use crate::physical::PageId;
use crate::schema::{ColumnType, Value};

use super::node::{Internal, KeyVals, Leaf, Node, NodeId};

pub trait NodeStore {
    fn get(&self, id: NodeId) -> Result<Node>;

    fn create_leaf(
        &self,
        keyvals: Vec<KeyVals>,
        prev: Option<NodeId>,
        next: Option<NodeId>,
    ) -> Result<Leaf>;

    fn create_internal(&self, keys: Vec<Value>, children: Vec<NodeId>) -> Result<Internal>;

    /// Install a same-size mutation of an existing node (sibling relinks,
    /// child-id swaps). Structural changes go through `create_*` instead.
    fn update(&self, node: Node) -> Result<()>;

    fn delete(&self, id: NodeId) -> Result<()>;

    /// Serialize dirty nodes into their slots and flush the underlying
    /// pool.
    fn commit(&self) -> Result<()>;
}

pub struct MemNodeStore {
    state: Mutex<MemNodeState>,
}

struct MemNodeState {
    nodes: HashMap<NodeId, Node>,
    next: u64,
}

impl MemNodeStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemNodeState {
                nodes: HashMap::new(),
                next: 1,
            }),
        }
    }

    pub fn node_count(&self) -> usize {
        self.state.lock().unwrap().nodes.len()
    }

    fn next_id(state: &mut MemNodeState) -> NodeId {
        let id = NodeId::new(PageId(state.next), 0);
        state.next += 1;
        id
    }
}

impl Default for MemNodeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeStore for MemNodeStore {
    fn get(&self, id: NodeId) -> Result<Node> {
        self.state
            .lock()
            .unwrap()
            .nodes
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("node {id}")))
    }

    fn create_leaf(
        &self,
        keyvals: Vec<KeyVals>,
        prev: Option<NodeId>,
        next: Option<NodeId>,
    ) -> Result<Leaf> {
        let mut state = self.state.lock().unwrap();
        let id = Self::next_id(&mut state);
        let leaf = Leaf {
            id,
            prev,
            next,
            keyvals,
        };
        state.nodes.insert(id, Node::Leaf(leaf.clone()));
        Ok(leaf)
    }

    fn create_internal(&self, keys: Vec<Value>, children: Vec<NodeId>) -> Result<Internal> {
        let mut state = self.state.lock().unwrap();
        let id = Self::next_id(&mut state);
        let internal = Internal { id, keys, children };
        state.nodes.insert(id, Node::Internal(internal.clone()));
        Ok(internal)
    }

    fn update(&self, node: Node) -> Result<()> {
        self.state.lock().unwrap().nodes.insert(node.id(), node);
        Ok(())
    }

    fn delete(&self, id: NodeId) -> Result<()> {
        self.state.lock().unwrap().nodes.remove(&id);
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        Ok(())
    }
}

/// Nodes stored as records in a heap page file. Every created or updated
/// node sits in the dirty cache until `commit` serializes it in place.
pub struct HeapNodeStore<P: PagePool> {
    heap: HeapPageFile<P>,
    key_ty: ColumnType,
    dirty: Mutex<HashMap<NodeId, Node>>,
}

impl<P: PagePool> HeapNodeStore<P> {
    pub fn new(heap: HeapPageFile<P>, key_ty: ColumnType) -> Self {
        Self {
            heap,
            key_ty,
            dirty: Mutex::new(HashMap::new()),
        }
    }

    pub fn heap(&self) -> &HeapPageFile<P> {
        &self.heap
    }

    fn create(&self, node: Node) -> Result<Node> {
        let size = node.encoded_size(&self.key_ty);
        let (page, slot, _) = self.heap.allocate_space(size)?;
        let id = NodeId::new(page, slot);

        let node = match node {
            Node::Leaf(mut leaf) => {
                leaf.id = id;
                Node::Leaf(leaf)
            }
            Node::Internal(mut internal) => {
                internal.id = id;
                Node::Internal(internal)
            }
        };
        self.dirty.lock().unwrap().insert(id, node.clone());
        trace!(node = %id, size, "create node");
        Ok(node)
    }
}

impl<P: PagePool> NodeStore for HeapNodeStore<P> {
    fn get(&self, id: NodeId) -> Result<Node> {
        if let Some(node) = self.dirty.lock().unwrap().get(&id) {
            return Ok(node.clone());
        }

        let bytes = self.heap.pool().with_page(id.page, |view| {
            // A freed or trimmed slot means the node is gone.
            let slot = match slotted::slot_entry(view, id.slot) {
                Ok(slot) if !slot.is_free() => slot,
                _ => return Err(Error::not_found(format!("node {id}"))),
            };
            Ok(view
                .bytes_at(slot.offset() as usize, slot.length() as usize)?
                .to_vec())
        })?;
        Node::decode(&bytes, &self.key_ty, id)
    }

    fn create_leaf(
        &self,
        keyvals: Vec<KeyVals>,
        prev: Option<NodeId>,
        next: Option<NodeId>,
    ) -> Result<Leaf> {
        let node = self.create(Node::Leaf(Leaf {
            id: NodeId::NULL,
            prev,
            next,
            keyvals,
        }))?;
        match node {
            Node::Leaf(leaf) => Ok(leaf),
            Node::Internal(_) => unreachable!(),
        }
    }

    fn create_internal(&self, keys: Vec<Value>, children: Vec<NodeId>) -> Result<Internal> {
        let node = self.create(Node::Internal(Internal {
            id: NodeId::NULL,
            keys,
            children,
        }))?;
        match node {
            Node::Internal(internal) => Ok(internal),
            Node::Leaf(_) => unreachable!(),
        }
    }

    fn update(&self, node: Node) -> Result<()> {
        self.dirty.lock().unwrap().insert(node.id(), node);
        Ok(())
    }

    fn delete(&self, id: NodeId) -> Result<()> {
        self.dirty.lock().unwrap().remove(&id);
        self.heap
            .pool()
            .with_page_mut(id.page, |view| slotted::free_slot(view, id.slot))?;
        self.heap.refresh_entry(id.page)?;
        trace!(node = %id, "delete node");
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        let dirty: Vec<(NodeId, Node)> = self.dirty.lock().unwrap().drain().collect();
        for (id, node) in dirty {
            let bytes = node.encode(&self.key_ty)?;
            self.heap.pool().with_page_mut(id.page, |view| {
                let slot = slotted::slot_entry(&view.as_view(), id.slot)?;
                if bytes.len() > slot.length() as usize {
                    return Err(Error::NoSpace {
                        needed: bytes.len(),
                        available: slot.length() as usize,
                    });
                }
                if bytes.len() != slot.length() as usize {
                    // Nodes are only ever rewritten at the size they were
                    // allocated with.
                    return Err(Error::corrupt(format!(
                        "node {id} shrank below its slot"
                    )));
                }
                view.put_bytes(slot.offset() as usize, &bytes)
            })?;
        }
        self.heap.pool().commit()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::physical::pager::MemPager;
    use crate::physical::RowId;

    use super::*;

    fn disk_store() -> HeapNodeStore<MemPager> {
        let pool = Arc::new(MemPager::new(256));
        let heap = HeapPageFile::create(pool).unwrap();
        HeapNodeStore::new(heap, ColumnType::U32)
    }

    fn kv(key: u32, page: u64) -> KeyVals {
        KeyVals {
            key: Value::U32(key),
            vals: vec![RowId::new(PageId(page), 0)],
        }
    }

    #[test]
    fn test_mem_store_ids_are_monotonic() {
        let store = MemNodeStore::new();
        let a = store.create_leaf(vec![], None, None).unwrap();
        let b = store.create_leaf(vec![], None, None).unwrap();
        assert_ne!(a.id, b.id);
        assert!(a.id.page < b.id.page);
    }

    #[test]
    fn test_disk_store_round_trip_through_commit() {
        let store = disk_store();
        let leaf = store.create_leaf(vec![kv(5, 80)], None, None).unwrap();
        let internal = store
            .create_internal(vec![Value::U32(5)], vec![leaf.id, leaf.id])
            .unwrap();

        // Reads come from the dirty cache before commit.
        assert!(matches!(store.get(leaf.id).unwrap(), Node::Leaf(_)));
        store.commit().unwrap();

        // And from the heap records after.
        match store.get(leaf.id).unwrap() {
            Node::Leaf(read) => {
                assert_eq!(read.keyvals.len(), 1);
                assert_eq!(read.keyvals[0].key, Value::U32(5));
            }
            _ => panic!("expected leaf"),
        }
        match store.get(internal.id).unwrap() {
            Node::Internal(read) => assert_eq!(read.children.len(), 2),
            _ => panic!("expected internal"),
        }
    }

    #[test]
    fn test_sibling_relink_keeps_size() {
        let store = disk_store();
        let l1 = store.create_leaf(vec![kv(1, 8)], None, None).unwrap();
        let mut l2 = store.create_leaf(vec![kv(2, 8)], None, None).unwrap();
        store.commit().unwrap();

        l2.prev = Some(l1.id);
        store.update(Node::Leaf(l2.clone())).unwrap();
        store.commit().unwrap();

        match store.get(l2.id).unwrap() {
            Node::Leaf(read) => assert_eq!(read.prev, Some(l1.id)),
            _ => panic!("expected leaf"),
        }
    }

    #[test]
    fn test_delete_frees_the_slot() {
        let store = disk_store();
        let leaf = store.create_leaf(vec![kv(9, 8)], None, None).unwrap();
        store.commit().unwrap();

        store.delete(leaf.id).unwrap();
        assert!(matches!(
            store.get(leaf.id),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_delete_before_commit_discards_dirty_node() {
        let store = disk_store();
        let leaf = store.create_leaf(vec![kv(3, 8)], None, None).unwrap();
        store.delete(leaf.id).unwrap();
        store.commit().unwrap();
        assert!(store.get(leaf.id).is_err());
    }
}
