//! Heap page file: a linked list of header pages whose entries point at
//! slotted data pages and advertise their remaining free space, giving
//! O(entries) space lookup for insertions.
//!
//! The list is addressed through an *anchor page*: its first 8 bytes hold
//! the id of the current head header page (0 when the heap is still empty).
//! Pushing a new head writes through the anchor, so durable references to
//! the heap (catalog rows, index headers) never move.

use std::sync::Arc;

use tracing::trace;

use crate::error::{Error, Result};
use crate::physical::pager::PagePool;
use crate::physical::slotted::{self, Slot};
use crate::physical::PageId;

const NEXT_OFFSET: usize = 0;
const COUNT_OFFSET: usize = 8;
const ENTRIES_OFFSET: usize = 12;
const ENTRY_SIZE: usize = 12;

pub struct HeapPageFile<P: PagePool> {
    pool: Arc<P>,
    anchor: PageId,
}

impl<P: PagePool> HeapPageFile<P> {
    /// Allocate a fresh anchor page. The first header page is created
    /// lazily by the first allocation.
    pub fn create(pool: Arc<P>) -> Result<Self> {
        let anchor = pool.allocate_page()?;
        Ok(Self { pool, anchor })
    }

    pub fn open(pool: Arc<P>, anchor: PageId) -> Self {
        Self { pool, anchor }
    }

    pub fn anchor(&self) -> PageId {
        self.anchor
    }

    pub fn pool(&self) -> &Arc<P> {
        &self.pool
    }

    /// Largest record an empty data page can host.
    pub fn max_record_size(&self) -> usize {
        self.pool.page_size() - slotted::FOOTER_FIXED - slotted::SLOT_ENTRY_SIZE
    }

    fn head(&self) -> Result<PageId> {
        self.pool
            .with_page(self.anchor, |view| view.u64_at(0).map(PageId))
    }

    fn set_head(&self, id: PageId) -> Result<()> {
        self.pool
            .with_page_mut(self.anchor, |view| view.set_u64_at(0, id.0))
    }

    fn entry_capacity(&self) -> usize {
        (self.pool.page_size() - ENTRIES_OFFSET) / ENTRY_SIZE
    }

    /// Allocate `n` record bytes somewhere in the heap, returning the data
    /// page, slot index, and slot. Entries in the current head header page
    /// are searched in insertion order; the first fit wins.
    pub fn allocate_space(&self, n: usize) -> Result<(PageId, u32, Slot)> {
        let head = match self.head()? {
            id if id.is_null() => {
                let head = self.pool.allocate_page()?;
                self.set_head(head)?;
                trace!(header = head.0, "first heap header page");
                head
            }
            id => id,
        };

        let entries = self.entries(head)?;
        if let Some((pos, &(page, _))) = entries
            .iter()
            .enumerate()
            .find(|(_, (_, free))| *free as usize >= n)
        {
            let (index, slot, new_free) = self.pool.with_page_mut(page, |view| {
                let (index, slot) = slotted::allocate_slot(view, n)?;
                let free = slotted::free_space(&view.as_view())?;
                Ok((index, slot, free))
            })?;
            self.pool.with_page_mut(head, |view| {
                view.set_u32_at(ENTRIES_OFFSET + pos * ENTRY_SIZE + 8, new_free as u32)
            })?;
            return Ok((page, index, slot));
        }

        // No advertised space fits; start a new data page.
        let page = self.pool.allocate_page()?;
        let allocated = self.pool.with_page_mut(page, |view| {
            let (index, slot) = slotted::allocate_slot(view, n)?;
            let free = slotted::free_space(&view.as_view())?;
            Ok((index, slot, free))
        });
        let (index, slot, new_free) = match allocated {
            Ok(result) => result,
            Err(err) => {
                self.pool.free_page(page)?;
                return Err(err);
            }
        };
        self.push_entry(head, page, new_free as u32)?;
        Ok((page, index, slot))
    }

    fn push_entry(&self, head: PageId, page: PageId, free: u32) -> Result<()> {
        let count = self.pool.with_page(head, |view| view.u32_at(COUNT_OFFSET))? as usize;

        if count < self.entry_capacity() {
            self.pool.with_page_mut(head, |view| {
                let at = ENTRIES_OFFSET + count * ENTRY_SIZE;
                view.set_u64_at(at, page.0)?;
                view.set_u32_at(at + 8, free)?;
                view.set_u32_at(COUNT_OFFSET, count as u32 + 1)
            })
        } else {
            // The head is full; push a new header page at the front.
            let new_head = self.pool.allocate_page()?;
            self.pool.with_page_mut(new_head, |view| {
                view.set_u64_at(NEXT_OFFSET, head.0)?;
                view.set_u32_at(COUNT_OFFSET, 1)?;
                view.set_u64_at(ENTRIES_OFFSET, page.0)?;
                view.set_u32_at(ENTRIES_OFFSET + 8, free)
            })?;
            self.set_head(new_head)?;
            trace!(header = new_head.0, "pushed new heap header page");
            Ok(())
        }
    }

    /// Header pages from the current head to the tail of the list.
    pub fn header_pages(&self) -> Result<Vec<PageId>> {
        let mut pages = Vec::new();
        let mut current = self.head()?;
        while !current.is_null() {
            pages.push(current);
            current = self
                .pool
                .with_page(current, |view| view.u64_at(NEXT_OFFSET).map(PageId))?;
        }
        Ok(pages)
    }

    /// `(data_page, free_space)` entries of one header page, in insertion
    /// order.
    pub fn entries(&self, header: PageId) -> Result<Vec<(PageId, u32)>> {
        self.pool.with_page(header, |view| {
            let count = view.u32_at(COUNT_OFFSET)? as usize;
            let mut entries = Vec::with_capacity(count);
            for i in 0..count {
                let at = ENTRIES_OFFSET + i * ENTRY_SIZE;
                entries.push((PageId(view.u64_at(at)?), view.u32_at(at + 8)?));
            }
            Ok(entries)
        })
    }

    /// Every data page in the heap, walking headers head-to-tail.
    pub fn data_pages(&self) -> Result<Vec<PageId>> {
        let mut pages = Vec::new();
        for header in self.header_pages()? {
            for (page, _) in self.entries(header)? {
                pages.push(page);
            }
        }
        Ok(pages)
    }

    /// Recompute and store the advertised free space of `page` after an
    /// out-of-band free.
    pub fn refresh_entry(&self, page: PageId) -> Result<()> {
        let free = self
            .pool
            .with_page(page, |view| slotted::free_space(view))? as u32;
        for header in self.header_pages()? {
            let entries = self.entries(header)?;
            if let Some(pos) = entries.iter().position(|&(p, _)| p == page) {
                return self.pool.with_page_mut(header, |view| {
                    view.set_u32_at(ENTRIES_OFFSET + pos * ENTRY_SIZE + 8, free)
                });
            }
        }
        Err(Error::not_found(format!("heap entry for page {page}")))
    }

    /// Free every data page and header page. The anchor itself stays with
    /// its owner; its head pointer is reset.
    pub fn destroy(&self) -> Result<()> {
        let headers = self.header_pages()?;
        for header in &headers {
            for (page, _) in self.entries(*header)? {
                self.pool.free_page(page)?;
            }
        }
        self.pool.free_pages(&headers)?;
        self.set_head(PageId::NULL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physical::pager::MemPager;

    fn heap(page_size: usize) -> HeapPageFile<MemPager> {
        HeapPageFile::create(Arc::new(MemPager::new(page_size))).unwrap()
    }

    #[test]
    fn test_allocations_share_a_page_until_full() {
        let heap = heap(256);
        let (p1, s1, _) = heap.allocate_space(50).unwrap();
        let (p2, s2, _) = heap.allocate_space(50).unwrap();
        assert_eq!(p1, p2);
        assert_eq!((s1, s2), (0, 1));

        // 256-byte data pages cannot take a third 100-byte record next to
        // two 50s plus directory overhead, so a new page is opened.
        let (p3, _, _) = heap.allocate_space(150).unwrap();
        assert_ne!(p1, p3);

        let pages = heap.data_pages().unwrap();
        assert_eq!(pages, vec![p1, p3]);
    }

    #[test]
    fn test_first_fit_in_entry_order() {
        let heap = heap(256);
        let (p1, _, _) = heap.allocate_space(200).unwrap();
        let (p2, _, _) = heap.allocate_space(200).unwrap();
        assert_ne!(p1, p2);

        // Both pages still advertise room for a small record; the first
        // entry wins.
        let (p3, _, _) = heap.allocate_space(10).unwrap();
        assert_eq!(p3, p1);
    }

    #[test]
    fn test_header_page_overflow_pushes_new_head() {
        // 64-byte pages hold (64 - 12) / 12 = 4 entries per header.
        let heap = heap(64);
        for _ in 0..5 {
            // Each 30-byte record fills a 64-byte data page on its own.
            heap.allocate_space(30).unwrap();
        }
        let headers = heap.header_pages().unwrap();
        assert_eq!(headers.len(), 2);
        assert_eq!(heap.entries(headers[0]).unwrap().len(), 1);
        assert_eq!(heap.entries(headers[1]).unwrap().len(), 4);
        assert_eq!(heap.data_pages().unwrap().len(), 5);
    }

    #[test]
    fn test_refresh_entry_allows_reuse_after_free() {
        let heap = heap(256);
        let (page, slot, _) = heap.allocate_space(200).unwrap();
        // Without a refresh the entry still advertises a nearly full page.
        heap.pool()
            .with_page_mut(page, |view| slotted::free_slot(view, slot))
            .unwrap();
        heap.refresh_entry(page).unwrap();

        let (again, _, _) = heap.allocate_space(200).unwrap();
        assert_eq!(again, page);
    }

    #[test]
    fn test_destroy_frees_everything_but_the_anchor() {
        let pool = Arc::new(MemPager::new(64));
        pool.set_tracking(true);
        let heap = HeapPageFile::create(Arc::clone(&pool)).unwrap();
        for _ in 0..5 {
            heap.allocate_space(30).unwrap();
        }
        heap.destroy().unwrap();

        let allocated: std::collections::BTreeSet<_> =
            pool.alloc_log().into_iter().collect();
        let freed: std::collections::BTreeSet<_> = pool.free_log().into_iter().collect();
        let mut expected = allocated;
        expected.remove(&heap.anchor());
        assert_eq!(freed, expected);
    }

    #[test]
    fn test_oversized_allocation_fails_without_leaking() {
        let pool = Arc::new(MemPager::new(64));
        let heap = HeapPageFile::create(Arc::clone(&pool)).unwrap();
        heap.allocate_space(10).unwrap();
        pool.set_tracking(true);
        assert!(matches!(
            heap.allocate_space(1000),
            Err(Error::NoSpace { .. })
        ));
        assert_eq!(pool.alloc_log(), pool.free_log());
    }
}
