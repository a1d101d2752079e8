use std::collections::{btree_map::Entry, BTreeMap, BTreeSet, HashMap};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Mutex;

use tracing::{debug, trace};

use crate::codec::{PageView, PageViewMut};
use crate::error::{Error, Result};
use crate::physical::PageId;

/// A fixed-size page cache over some backing store, with a freelist of
/// recycled pages and deferred writes flushed by `commit`.
///
/// Page contents may only be observed through the closure-based accessors;
/// the borrow never escapes the pool, so the cache is free to drop and
/// reload pages between calls.
pub trait PagePool {
    fn page_size(&self) -> usize;

    fn allocate_page(&self) -> Result<PageId>;

    fn free_page(&self, id: PageId) -> Result<()>;

    fn free_pages(&self, ids: &[PageId]) -> Result<()> {
        for &id in ids {
            self.free_page(id)?;
        }
        Ok(())
    }

    fn with_page<R>(&self, id: PageId, f: impl FnOnce(&PageView) -> Result<R>) -> Result<R>;

    /// Run `f` against the writable cached page. The page is marked dirty
    /// whether or not `f` succeeds; a failed closure has still only touched
    /// the in-memory copy.
    fn with_page_mut<R>(&self, id: PageId, f: impl FnOnce(&mut PageViewMut) -> Result<R>)
        -> Result<R>;

    /// Flush the freelist head (when changed) and every dirty page, then
    /// drop the cache so subsequent reads reload on demand.
    fn commit(&self) -> Result<()>;

    fn is_dirty(&self) -> bool;

    /// Toggle allocation/free tracking for tests and diagnostics.
    fn set_tracking(&self, on: bool);

    fn alloc_log(&self) -> Vec<PageId>;

    fn free_log(&self) -> Vec<PageId>;
}

/// Disk-backed pool. The freelist is threaded through the first 8 bytes of
/// each freed page; the head pointer lives at `base_offset` and pages start
/// at `base_offset + 8`. An empty freelist is represented by the head
/// pointing one page past the end of the file.
pub struct FilePager {
    state: Mutex<PagerState>,
}

struct PagerState {
    file: File,
    page_size: usize,
    base_offset: u64,
    file_len: u64,
    free_page_id: u64,
    committed_free: u64,
    end_offset: u64,
    cache: BTreeMap<PageId, Box<[u8]>>,
    dirty: BTreeSet<PageId>,
    tracking: bool,
    alloc_log: Vec<PageId>,
    free_log: Vec<PageId>,
}

impl FilePager {
    /// Set up a pool over a fresh (empty) region of `file`.
    pub fn create(file: File, page_size: usize, base_offset: u64) -> Result<Self> {
        let first_page = base_offset + 8;
        Ok(Self {
            state: Mutex::new(PagerState {
                file,
                page_size,
                base_offset,
                file_len: base_offset,
                free_page_id: first_page,
                // Forces the head to be written by the first commit.
                committed_free: u64::MAX,
                end_offset: first_page,
                cache: BTreeMap::new(),
                dirty: BTreeSet::new(),
                tracking: false,
                alloc_log: Vec::new(),
                free_log: Vec::new(),
            }),
        })
    }

    /// Mount a pool over an existing region of `file`.
    pub fn open(mut file: File, page_size: usize, base_offset: u64) -> Result<Self> {
        let file_len = file.seek(SeekFrom::End(0))?;
        let first_page = base_offset + 8;
        if file_len < first_page {
            return Err(Error::corrupt("file too short for buffer pool region"));
        }

        let mut head_bytes = [0u8; 8];
        file.seek(SeekFrom::Start(base_offset))?;
        file.read_exact(&mut head_bytes)?;
        let stored_head = u64::from_be_bytes(head_bytes);

        let page_count = (file_len - first_page).div_ceil(page_size as u64);
        let end_offset = first_page + page_count * page_size as u64;
        let free_page_id = if stored_head == 0 {
            end_offset
        } else {
            stored_head
        };

        Ok(Self {
            state: Mutex::new(PagerState {
                file,
                page_size,
                base_offset,
                file_len,
                free_page_id,
                committed_free: stored_head,
                end_offset,
                cache: BTreeMap::new(),
                dirty: BTreeSet::new(),
                tracking: false,
                alloc_log: Vec::new(),
                free_log: Vec::new(),
            }),
        })
    }

    /// Rewrite the fixed file header that precedes the pool region. The
    /// header is outside the page space, so the pool writes it directly.
    pub fn write_file_header(&self, bytes: &[u8]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.file.seek(SeekFrom::Start(0))?;
        state.file.write_all(bytes)?;
        state.file_len = state.file_len.max(bytes.len() as u64);
        Ok(())
    }
}

impl PagerState {
    fn check_bounds(&self, id: PageId) -> Result<()> {
        let first_page = self.base_offset + 8;
        if id.0 < first_page
            || id.0 >= self.end_offset
            || (id.0 - first_page) % self.page_size as u64 != 0
        {
            return Err(Error::corrupt(format!("page id {} out of bounds", id)));
        }
        Ok(())
    }

    fn load_page(&mut self, id: PageId) -> Result<&mut Box<[u8]>> {
        self.check_bounds(id)?;

        match self.cache.entry(id) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let mut page = vec![0u8; self.page_size].into_boxed_slice();
                // A page past the current file length was allocated but
                // never flushed; it reads as zeroes.
                if id.0 < self.file_len {
                    self.file.seek(SeekFrom::Start(id.0))?;
                    let available = (self.file_len - id.0).min(self.page_size as u64) as usize;
                    self.file.read_exact(&mut page[..available])?;
                }
                Ok(entry.insert(page))
            }
        }
    }

    fn install_zeroed(&mut self, id: PageId) {
        self.cache
            .insert(id, vec![0u8; self.page_size].into_boxed_slice());
        self.dirty.insert(id);
    }
}

impl PagePool for FilePager {
    fn page_size(&self) -> usize {
        self.state.lock().unwrap().page_size
    }

    fn allocate_page(&self) -> Result<PageId> {
        let mut state = self.state.lock().unwrap();

        let id = if state.free_page_id != state.end_offset {
            let id = PageId(state.free_page_id);
            let next = {
                let page = state.load_page(id)?;
                u64::from_be_bytes(page[..8].try_into().unwrap())
            };
            state.free_page_id = if next == 0 { state.end_offset } else { next };
            state.install_zeroed(id);
            trace!(page = id.0, "reuse freed page");
            id
        } else {
            let id = PageId(state.end_offset);
            state.end_offset += state.page_size as u64;
            state.free_page_id = state.end_offset;
            state.install_zeroed(id);
            trace!(page = id.0, "extend file with new page");
            id
        };

        if state.tracking {
            state.alloc_log.push(id);
        }
        Ok(id)
    }

    fn free_page(&self, id: PageId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.check_bounds(id)?;

        let prev_head = state.free_page_id;
        {
            let page = state.load_page(id)?;
            page[..8].copy_from_slice(&prev_head.to_be_bytes());
        }
        state.dirty.insert(id);
        state.free_page_id = id.0;

        if state.tracking {
            state.free_log.push(id);
        }
        trace!(page = id.0, "free page");
        Ok(())
    }

    fn with_page<R>(&self, id: PageId, f: impl FnOnce(&PageView) -> Result<R>) -> Result<R> {
        let mut state = self.state.lock().unwrap();
        let page = state.load_page(id)?;
        f(&PageView::new(page))
    }

    fn with_page_mut<R>(
        &self,
        id: PageId,
        f: impl FnOnce(&mut PageViewMut) -> Result<R>,
    ) -> Result<R> {
        let mut state = self.state.lock().unwrap();
        state.load_page(id)?;
        state.dirty.insert(id);
        let page = state.cache.get_mut(&id).unwrap();
        f(&mut PageViewMut::new(page))
    }

    fn commit(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();

        if state.free_page_id != state.committed_free {
            let head = state.free_page_id;
            let base = state.base_offset;
            state.file.seek(SeekFrom::Start(base))?;
            state.file.write_all(&head.to_be_bytes())?;
            state.committed_free = head;
        }

        let dirty = std::mem::take(&mut state.dirty);
        let count = dirty.len();
        for id in dirty {
            // The cache is dropped below anyway, so move the bytes out.
            let page = state.cache.remove(&id).unwrap();
            state.file.seek(SeekFrom::Start(id.0))?;
            state.file.write_all(&page)?;
        }
        state.file.flush()?;
        state.file_len = state.file_len.max(state.end_offset);
        state.cache.clear();

        debug!(pages = count, "commit flushed dirty pages");
        Ok(())
    }

    fn is_dirty(&self) -> bool {
        let state = self.state.lock().unwrap();
        !state.dirty.is_empty() || state.free_page_id != state.committed_free
    }

    fn set_tracking(&self, on: bool) {
        let mut state = self.state.lock().unwrap();
        state.tracking = on;
        if !on {
            state.alloc_log.clear();
            state.free_log.clear();
        }
    }

    fn alloc_log(&self) -> Vec<PageId> {
        self.state.lock().unwrap().alloc_log.clone()
    }

    fn free_log(&self) -> Vec<PageId> {
        self.state.lock().unwrap().free_log.clone()
    }
}

/// Heap-backed pool with identical semantics. Used by unit tests and by
/// in-memory index trees.
pub struct MemPager {
    state: Mutex<MemPagerState>,
}

struct MemPagerState {
    page_size: usize,
    pages: HashMap<PageId, Box<[u8]>>,
    free: Vec<PageId>,
    next_offset: u64,
    tracking: bool,
    alloc_log: Vec<PageId>,
    free_log: Vec<PageId>,
}

impl MemPager {
    pub fn new(page_size: usize) -> Self {
        Self {
            state: Mutex::new(MemPagerState {
                page_size,
                pages: HashMap::new(),
                free: Vec::new(),
                next_offset: 8,
                tracking: false,
                alloc_log: Vec::new(),
                free_log: Vec::new(),
            }),
        }
    }
}

impl PagePool for MemPager {
    fn page_size(&self) -> usize {
        self.state.lock().unwrap().page_size
    }

    fn allocate_page(&self) -> Result<PageId> {
        let mut state = self.state.lock().unwrap();
        let id = match state.free.pop() {
            Some(id) => id,
            None => {
                let id = PageId(state.next_offset);
                state.next_offset += state.page_size as u64;
                id
            }
        };
        let page = vec![0u8; state.page_size].into_boxed_slice();
        state.pages.insert(id, page);
        if state.tracking {
            state.alloc_log.push(id);
        }
        Ok(id)
    }

    fn free_page(&self, id: PageId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.pages.remove(&id).is_none() {
            return Err(Error::corrupt(format!("free of unknown page {id}")));
        }
        state.free.push(id);
        if state.tracking {
            state.free_log.push(id);
        }
        Ok(())
    }

    fn with_page<R>(&self, id: PageId, f: impl FnOnce(&PageView) -> Result<R>) -> Result<R> {
        let state = self.state.lock().unwrap();
        let page = state
            .pages
            .get(&id)
            .ok_or_else(|| Error::corrupt(format!("read of unknown page {id}")))?;
        f(&PageView::new(page))
    }

    fn with_page_mut<R>(
        &self,
        id: PageId,
        f: impl FnOnce(&mut PageViewMut) -> Result<R>,
    ) -> Result<R> {
        let mut state = self.state.lock().unwrap();
        let page = state
            .pages
            .get_mut(&id)
            .ok_or_else(|| Error::corrupt(format!("write to unknown page {id}")))?;
        f(&mut PageViewMut::new(page))
    }

    fn commit(&self) -> Result<()> {
        Ok(())
    }

    fn is_dirty(&self) -> bool {
        false
    }

    fn set_tracking(&self, on: bool) {
        let mut state = self.state.lock().unwrap();
        state.tracking = on;
        if !on {
            state.alloc_log.clear();
            state.free_log.clear();
        }
    }

    fn alloc_log(&self) -> Vec<PageId> {
        self.state.lock().unwrap().alloc_log.clone()
    }

    fn free_log(&self) -> Vec<PageId> {
        self.state.lock().unwrap().free_log.clone()
    }
}
