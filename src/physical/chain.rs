//! Linked page list: blob storage for payloads too large to live in a
//! single record. Pages carry `(next_page_id, byte_length)` headers and are
//! chained until `next_page_id` is 0.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::physical::pager::PagePool;
use crate::physical::PageId;

const NEXT_OFFSET: usize = 0;
const LEN_OFFSET: usize = 8;
const PAYLOAD_OFFSET: usize = 12;

pub struct LinkedPageList<P: PagePool> {
    pool: Arc<P>,
    head: PageId,
    dropped: bool,
}

impl<P: PagePool> LinkedPageList<P> {
    pub fn create(pool: Arc<P>) -> Result<Self> {
        let head = pool.allocate_page()?;
        Ok(Self {
            pool,
            head,
            dropped: false,
        })
    }

    pub fn open(pool: Arc<P>, head: PageId) -> Self {
        Self {
            pool,
            head,
            dropped: false,
        }
    }

    pub fn head(&self) -> PageId {
        self.head
    }

    fn guard(&self) -> Result<()> {
        if self.dropped {
            Err(Error::UseAfterDrop)
        } else {
            Ok(())
        }
    }

    fn payload_capacity(&self) -> usize {
        self.pool.page_size() - PAYLOAD_OFFSET
    }

    /// Replace the stored blob. Pages are appended as the payload needs
    /// them and trailing pages are freed when it shrinks.
    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        self.guard()?;

        let capacity = self.payload_capacity();
        let mut page = self.head;
        let mut offset = 0;
        loop {
            let chunk = capacity.min(bytes.len() - offset);
            let old_next = self.pool.with_page_mut(page, |view| {
                let next = view.as_view().u64_at(NEXT_OFFSET)?;
                view.set_u32_at(LEN_OFFSET, chunk as u32)?;
                view.put_bytes(PAYLOAD_OFFSET, &bytes[offset..offset + chunk])?;
                Ok(next)
            })?;
            offset += chunk;

            if offset >= bytes.len() {
                self.pool
                    .with_page_mut(page, |view| view.set_u64_at(NEXT_OFFSET, 0))?;
                if old_next != 0 {
                    self.free_from(PageId(old_next))?;
                }
                return Ok(());
            }

            page = if old_next != 0 {
                PageId(old_next)
            } else {
                let next = self.pool.allocate_page()?;
                self.pool
                    .with_page_mut(page, |view| view.set_u64_at(NEXT_OFFSET, next.0))?;
                next
            };
        }
    }

    pub fn read(&self) -> Result<Vec<u8>> {
        self.guard()?;

        let mut out = Vec::new();
        let mut page = self.head;
        loop {
            let (next, chunk) = self.pool.with_page(page, |view| {
                let next = view.u64_at(NEXT_OFFSET)?;
                let len = view.u32_at(LEN_OFFSET)? as usize;
                Ok((next, view.bytes_at(PAYLOAD_OFFSET, len)?.to_vec()))
            })?;
            out.extend_from_slice(&chunk);
            if next == 0 {
                return Ok(out);
            }
            page = PageId(next);
        }
    }

    fn free_from(&self, start: PageId) -> Result<()> {
        let mut pages = Vec::new();
        let mut page = start;
        while !page.is_null() {
            pages.push(page);
            page = self
                .pool
                .with_page(page, |view| view.u64_at(NEXT_OFFSET).map(PageId))?;
        }
        self.pool.free_pages(&pages)
    }

    /// Free the whole chain. Every later call fails `UseAfterDrop`.
    pub fn destroy(&mut self) -> Result<()> {
        self.guard()?;
        self.free_from(self.head)?;
        self.dropped = true;
        Ok(())
    }
}
