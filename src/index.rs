//! Uniform interface over the in-memory and on-disk B+-trees that back
//! table indexes.
//!
//! A disk index owns a header page holding `(heap_head, root_page,
//! root_slot)`. The header page doubles as the node heap's anchor, so the
//! catalog can refer to the whole index by that single page id. A memory
//! index holds nothing durable; the table layer rebuilds it from storage at
//! open.

use std::sync::Arc;

use tracing::debug;

use crate::btree::{BTree, HeapNodeStore, MemNodeStore, NodeId, RangeSpec, RootChangedFn};
use crate::error::{Error, Result};
use crate::physical::heap::HeapPageFile;
use crate::physical::pager::PagePool;
use crate::physical::{PageId, RowId};
use crate::schema::{ColumnType, Value};

const ROOT_PAGE_OFFSET: usize = 8;
const ROOT_SLOT_OFFSET: usize = 16;

pub trait Index: Send + Sync {
    fn insert(&mut self, key: Value, rowid: RowId) -> Result<()>;

    fn insert_many(&mut self, entries: Vec<(Value, RowId)>) -> Result<()> {
        for (key, rowid) in entries {
            self.insert(key, rowid)?;
        }
        Ok(())
    }

    fn get(&self, key: &Value) -> Result<Vec<RowId>>;

    fn has(&self, key: &Value) -> Result<bool> {
        Ok(!self.get(key)?.is_empty())
    }

    fn remove(&mut self, key: &Value, rowid: RowId) -> Result<()>;

    fn remove_all(&mut self, key: &Value) -> Result<()>;

    fn get_range(&self, range: &RangeSpec) -> Result<Vec<(Value, Vec<RowId>)>>;

    /// Free everything the index owns. Every later call fails
    /// `UseAfterDrop`.
    fn destroy(&mut self) -> Result<()>;
}

pub struct MemoryIndex {
    tree: BTree<MemNodeStore>,
    dropped: bool,
}

impl MemoryIndex {
    pub fn new(key_ty: ColumnType, order: usize) -> Result<Self> {
        Ok(Self {
            tree: BTree::create(MemNodeStore::new(), key_ty, order, None)?,
            dropped: false,
        })
    }

    fn guard(&self) -> Result<()> {
        if self.dropped {
            Err(Error::UseAfterDrop)
        } else {
            Ok(())
        }
    }
}

impl Index for MemoryIndex {
    fn insert(&mut self, key: Value, rowid: RowId) -> Result<()> {
        self.guard()?;
        self.tree.insert(key, rowid)
    }

    fn get(&self, key: &Value) -> Result<Vec<RowId>> {
        self.guard()?;
        self.tree.get(key)
    }

    fn remove(&mut self, key: &Value, rowid: RowId) -> Result<()> {
        self.guard()?;
        self.tree.remove(key, rowid)
    }

    fn remove_all(&mut self, key: &Value) -> Result<()> {
        self.guard()?;
        self.tree.remove_all(key)
    }

    fn get_range(&self, range: &RangeSpec) -> Result<Vec<(Value, Vec<RowId>)>> {
        self.guard()?;
        self.tree.get_range(range)
    }

    fn destroy(&mut self) -> Result<()> {
        self.guard()?;
        self.dropped = true;
        Ok(())
    }
}

pub struct DiskIndex<P: PagePool> {
    tree: BTree<HeapNodeStore<P>>,
    pool: Arc<P>,
    header: PageId,
    dropped: bool,
}

impl<P: PagePool + Send + Sync + 'static> DiskIndex<P> {
    fn root_writer(pool: &Arc<P>, header: PageId) -> RootChangedFn {
        let pool = Arc::clone(pool);
        Box::new(move |root: NodeId| {
            pool.with_page_mut(header, |view| {
                view.set_u64_at(ROOT_PAGE_OFFSET, root.page.0)?;
                view.set_u32_at(ROOT_SLOT_OFFSET, root.slot)
            })
        })
    }

    /// Allocate the header page and the sentinel root + first leaf.
    pub fn create(pool: Arc<P>, key_ty: ColumnType, order: usize) -> Result<Self> {
        let header = pool.allocate_page()?;
        let heap = HeapPageFile::open(Arc::clone(&pool), header);
        let store = HeapNodeStore::new(heap, key_ty.clone());
        let tree = BTree::create(
            store,
            key_ty,
            order,
            Some(Self::root_writer(&pool, header)),
        )?;
        debug!(header = header.0, "created disk index");
        Ok(Self {
            tree,
            pool,
            header,
            dropped: false,
        })
    }

    /// Mount an index from its header page.
    pub fn open(pool: Arc<P>, header: PageId, key_ty: ColumnType, order: usize) -> Result<Self> {
        let root = pool.with_page(header, |view| {
            Ok(NodeId::new(
                PageId(view.u64_at(ROOT_PAGE_OFFSET)?),
                view.u32_at(ROOT_SLOT_OFFSET)?,
            ))
        })?;
        if root.is_null() {
            return Err(Error::corrupt(format!(
                "index header {header} has no root node"
            )));
        }
        let heap = HeapPageFile::open(Arc::clone(&pool), header);
        let store = HeapNodeStore::new(heap, key_ty.clone());
        let tree = BTree::open(
            store,
            key_ty,
            order,
            root,
            Some(Self::root_writer(&pool, header)),
        );
        Ok(Self {
            tree,
            pool,
            header,
            dropped: false,
        })
    }

    pub fn header(&self) -> PageId {
        self.header
    }

    fn guard(&self) -> Result<()> {
        if self.dropped {
            Err(Error::UseAfterDrop)
        } else {
            Ok(())
        }
    }
}

impl<P: PagePool + Send + Sync + 'static> Index for DiskIndex<P> {
    fn insert(&mut self, key: Value, rowid: RowId) -> Result<()> {
        self.guard()?;
        self.tree.insert(key, rowid)
    }

    fn get(&self, key: &Value) -> Result<Vec<RowId>> {
        self.guard()?;
        self.tree.get(key)
    }

    fn remove(&mut self, key: &Value, rowid: RowId) -> Result<()> {
        self.guard()?;
        self.tree.remove(key, rowid)
    }

    fn remove_all(&mut self, key: &Value) -> Result<()> {
        self.guard()?;
        self.tree.remove_all(key)
    }

    fn get_range(&self, range: &RangeSpec) -> Result<Vec<(Value, Vec<RowId>)>> {
        self.guard()?;
        self.tree.get_range(range)
    }

    fn destroy(&mut self) -> Result<()> {
        self.guard()?;
        self.tree.store().heap().destroy()?;
        self.pool.free_page(self.header)?;
        self.dropped = true;
        debug!(header = self.header.0, "dropped disk index");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::physical::pager::MemPager;

    use super::*;

    fn rid(n: u64) -> RowId {
        RowId::new(PageId(n), 0)
    }

    #[test]
    fn test_memory_index_basics() {
        let mut index = MemoryIndex::new(ColumnType::Str, 2).unwrap();
        index.insert(Value::Str("a".into()), rid(1)).unwrap();
        index.insert(Value::Str("b".into()), rid(2)).unwrap();
        assert!(index.has(&Value::Str("a".into())).unwrap());
        assert_eq!(index.get(&Value::Str("b".into())).unwrap(), vec![rid(2)]);
        assert!(!index.has(&Value::Str("c".into())).unwrap());
    }

    #[test]
    fn test_disk_index_persists_root_in_header() {
        let pool = Arc::new(MemPager::new(512));
        let header;
        {
            let mut index = DiskIndex::create(Arc::clone(&pool), ColumnType::U32, 1).unwrap();
            header = index.header();
            for i in 0..20u32 {
                index.insert(Value::U32(i), rid(i as u64)).unwrap();
            }
        }

        let index = DiskIndex::open(pool, header, ColumnType::U32, 1).unwrap();
        for i in 0..20u32 {
            assert_eq!(index.get(&Value::U32(i)).unwrap(), vec![rid(i as u64)]);
        }
        let all = index.get_range(&RangeSpec::all()).unwrap();
        assert_eq!(all.len(), 20);
    }

    #[test]
    fn test_insert_many() {
        let mut index = MemoryIndex::new(ColumnType::U32, 2).unwrap();
        index
            .insert_many((0..10u32).map(|i| (Value::U32(i), rid(i as u64))).collect())
            .unwrap();
        assert_eq!(index.get_range(&RangeSpec::all()).unwrap().len(), 10);
    }

    #[test]
    fn test_destroy_frees_every_page() {
        let pool = Arc::new(MemPager::new(512));
        pool.set_tracking(true);
        let mut index = DiskIndex::create(Arc::clone(&pool), ColumnType::U32, 1).unwrap();
        for i in 0..50u32 {
            index.insert(Value::U32(i), rid(i as u64)).unwrap();
        }
        index.destroy().unwrap();

        let allocated: std::collections::BTreeSet<_> = pool.alloc_log().into_iter().collect();
        let freed: std::collections::BTreeSet<_> = pool.free_log().into_iter().collect();
        assert_eq!(allocated, freed);
    }

    #[test]
    fn test_use_after_drop() {
        let pool = Arc::new(MemPager::new(512));
        let mut index = DiskIndex::create(pool, ColumnType::U32, 2).unwrap();
        index.insert(Value::U32(1), rid(1)).unwrap();
        index.destroy().unwrap();

        assert!(matches!(
            index.get(&Value::U32(1)),
            Err(Error::UseAfterDrop)
        ));
        assert!(matches!(
            index.insert(Value::U32(2), rid(2)),
            Err(Error::UseAfterDrop)
        ));
        assert!(matches!(index.destroy(), Err(Error::UseAfterDrop)));
    }
}
