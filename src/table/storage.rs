//! Table storage: rowid ↔ serialized row bytes over a heap page file.
//!
//! Slot payloads carry a one-byte record tag before the row bytes:
//!
//! | tag | meaning        | body                          |
//! |-----|----------------|-------------------------------|
//! | 1   | inline row     | row record bytes              |
//! | 2   | forward stub   | target rowid (12 bytes)       |
//! | 3   | forwarded row  | row record bytes (stub target)|
//! | 4   | overflow row   | linked-page-list head (u64)   |
//!
//! Updates that outgrow their slot relocate the bytes and leave a forward
//! stub behind, so a rowid handed to a caller stays valid for the life of
//! the row. Rows too large for any data page live in a linked page list.

use std::sync::Arc;

use tracing::trace;

use crate::codec::{PageView, PageViewMut};
use crate::error::{Error, Result};
use crate::physical::chain::LinkedPageList;
use crate::physical::heap::HeapPageFile;
use crate::physical::pager::PagePool;
use crate::physical::{slotted, PageId, RowId};
use crate::schema::{Row, RowCodec};

const TAG_INLINE: u8 = 1;
const TAG_FORWARD: u8 = 2;
const TAG_FORWARDED: u8 = 3;
const TAG_OVERFLOW: u8 = 4;

const STUB_LEN: usize = 1 + RowId::ENCODED_LEN;
const OVERFLOW_LEN: usize = 1 + 8;

pub struct TableStorage<P: PagePool> {
    pool: Arc<P>,
    heap: HeapPageFile<P>,
    codec: RowCodec,
}

impl<P: PagePool> TableStorage<P> {
    pub fn create(pool: Arc<P>, codec: RowCodec) -> Result<Self> {
        let heap = HeapPageFile::create(Arc::clone(&pool))?;
        Ok(Self { pool, heap, codec })
    }

    pub fn open(pool: Arc<P>, anchor: PageId, codec: RowCodec) -> Self {
        let heap = HeapPageFile::open(Arc::clone(&pool), anchor);
        Self { pool, heap, codec }
    }

    pub fn anchor(&self) -> PageId {
        self.heap.anchor()
    }

    pub fn codec(&self) -> &RowCodec {
        &self.codec
    }

    fn read_slot(&self, rowid: RowId) -> Result<Option<Vec<u8>>> {
        self.pool.with_page(rowid.page, |view| {
            let slot = match slotted::slot_entry(view, rowid.slot) {
                Ok(slot) if !slot.is_free() => slot,
                _ => return Ok(None),
            };
            Ok(Some(
                view.bytes_at(slot.offset() as usize, slot.length() as usize)?
                    .to_vec(),
            ))
        })
    }

    fn write_slot(&self, rowid: RowId, tag: u8, body: &[u8]) -> Result<()> {
        self.pool.with_page_mut(rowid.page, |view| {
            let slot = slotted::slot_entry(&view.as_view(), rowid.slot)?;
            let offset = slot.offset() as usize;
            view.set_u8_at(offset, tag)?;
            view.put_bytes(offset + 1, body)
        })
    }

    fn free_slot(&self, rowid: RowId) -> Result<()> {
        self.pool
            .with_page_mut(rowid.page, |view| slotted::free_slot(view, rowid.slot))?;
        self.heap.refresh_entry(rowid.page)
    }

    fn stub_target(payload: &[u8]) -> Result<RowId> {
        RowId::read_at(&PageView::new(payload), 1)
    }

    fn overflow_head(payload: &[u8]) -> Result<PageId> {
        PageView::new(payload).u64_at(1).map(PageId)
    }

    pub fn insert(&self, row: &Row) -> Result<RowId> {
        let encoded = self.codec.encode(row)?;

        if 1 + encoded.len() <= self.heap.max_record_size() {
            let (page, slot, _) = self.heap.allocate_space(1 + encoded.len())?;
            let rowid = RowId::new(page, slot);
            self.write_slot(rowid, TAG_INLINE, &encoded)?;
            Ok(rowid)
        } else {
            // Too big for any data page; spill into a page chain.
            let chain = LinkedPageList::create(Arc::clone(&self.pool))?;
            chain.write(&encoded)?;
            let (page, slot, _) = self.heap.allocate_space(OVERFLOW_LEN)?;
            let rowid = RowId::new(page, slot);
            self.write_slot(rowid, TAG_OVERFLOW, &chain.head().0.to_be_bytes())?;
            trace!(%rowid, bytes = encoded.len(), "overflow row");
            Ok(rowid)
        }
    }

    pub fn get(&self, rowid: RowId) -> Result<Option<Row>> {
        let Some(payload) = self.read_slot(rowid)? else {
            return Ok(None);
        };
        match payload.first().copied() {
            Some(TAG_INLINE) | Some(TAG_FORWARDED) => {
                Ok(Some(self.codec.decode(&payload[1..])?))
            }
            Some(TAG_FORWARD) => self.get(Self::stub_target(&payload)?),
            Some(TAG_OVERFLOW) => {
                let chain =
                    LinkedPageList::open(Arc::clone(&self.pool), Self::overflow_head(&payload)?);
                Ok(Some(self.codec.decode(&chain.read()?)?))
            }
            other => Err(Error::corrupt(format!("bad record tag {other:?}"))),
        }
    }

    /// Overwrite the row at `rowid`. The same rowid remains valid whether
    /// the bytes fit in place or had to move behind a forward stub.
    pub fn set(&self, rowid: RowId, row: &Row) -> Result<RowId> {
        let Some(payload) = self.read_slot(rowid)? else {
            return Err(Error::not_found(format!("row {rowid}")));
        };
        match payload.first().copied() {
            Some(TAG_FORWARD) => {
                let target = Self::stub_target(&payload)?;
                self.set_at(target, row, Some(rowid))?;
            }
            Some(_) => self.set_at(rowid, row, None)?,
            None => return Err(Error::corrupt("empty record payload")),
        }
        Ok(rowid)
    }

    /// `current` owns the row bytes; `stub` is the anchor slot pointing at
    /// it when the row was forwarded earlier.
    fn set_at(&self, current: RowId, row: &Row, stub: Option<RowId>) -> Result<()> {
        let payload = self
            .read_slot(current)?
            .ok_or_else(|| Error::not_found(format!("row {current}")))?;
        let tag = payload[0];
        let encoded = self.codec.encode(row)?;
        let needed = 1 + encoded.len();

        if tag == TAG_OVERFLOW {
            let chain =
                LinkedPageList::open(Arc::clone(&self.pool), Self::overflow_head(&payload)?);
            return chain.write(&encoded);
        }

        if needed <= payload.len() {
            // Fits the slot it is in; rows self-delimit, so a shorter
            // encoding can leave stale tail bytes behind.
            return self.write_slot(current, tag, &encoded);
        }

        let anchor = stub.unwrap_or(current);
        let anchor_len = if anchor == current {
            payload.len()
        } else {
            STUB_LEN
        };

        if needed <= self.heap.max_record_size() && anchor_len >= STUB_LEN {
            // Forward: place the bytes elsewhere, leave a stub at the
            // caller's rowid.
            let (page, slot, _) = self.heap.allocate_space(needed)?;
            let target = RowId::new(page, slot);
            self.write_slot(target, TAG_FORWARDED, &encoded)?;

            let mut stub_body = [0u8; RowId::ENCODED_LEN];
            target.write_at(&mut PageViewMut::new(&mut stub_body), 0)?;
            self.write_slot(anchor, TAG_FORWARD, &stub_body)?;

            if anchor != current {
                self.free_slot(current)?;
            }
            trace!(row = %anchor, target = %target, "forwarded row");
            Ok(())
        } else if anchor_len >= OVERFLOW_LEN {
            // The slot cannot even hold a stub (or the row outgrew data
            // pages entirely); convert to an overflow row.
            let chain = LinkedPageList::create(Arc::clone(&self.pool))?;
            chain.write(&encoded)?;
            self.write_slot(anchor, TAG_OVERFLOW, &chain.head().0.to_be_bytes())?;
            if anchor != current {
                self.free_slot(current)?;
            }
            Ok(())
        } else {
            Err(Error::NoSpace {
                needed: STUB_LEN,
                available: anchor_len,
            })
        }
    }

    pub fn remove(&self, rowid: RowId) -> Result<()> {
        let Some(payload) = self.read_slot(rowid)? else {
            return Ok(());
        };
        match payload.first().copied() {
            Some(TAG_FORWARD) => {
                let target = Self::stub_target(&payload)?;
                self.free_slot(target)?;
                self.free_slot(rowid)
            }
            Some(TAG_OVERFLOW) => {
                let mut chain =
                    LinkedPageList::open(Arc::clone(&self.pool), Self::overflow_head(&payload)?);
                chain.destroy()?;
                self.free_slot(rowid)
            }
            Some(_) => self.free_slot(rowid),
            None => Err(Error::corrupt("empty record payload")),
        }
    }

    /// Every live row, in a stable order: header pages head to tail, each
    /// page's entries in insertion order, slots in index order. Forwarded
    /// rows surface at their stub's rowid.
    pub fn iterate(&self) -> Result<Vec<(RowId, Row)>> {
        let mut out = Vec::new();
        for header in self.heap.header_pages()? {
            for (page, _) in self.heap.entries(header)? {
                let payloads: Vec<(u32, Vec<u8>)> = self.pool.with_page(page, |view| {
                    let mut payloads = Vec::new();
                    for (index, slot) in slotted::live_slots(view)? {
                        payloads.push((
                            index,
                            view.bytes_at(slot.offset() as usize, slot.length() as usize)?
                                .to_vec(),
                        ));
                    }
                    Ok(payloads)
                })?;

                for (index, payload) in payloads {
                    let rowid = RowId::new(page, index);
                    match payload.first().copied() {
                        Some(TAG_INLINE) => {
                            out.push((rowid, self.codec.decode(&payload[1..])?));
                        }
                        Some(TAG_FORWARD) => {
                            if let Some(row) = self.get(Self::stub_target(&payload)?)? {
                                out.push((rowid, row));
                            }
                        }
                        // Reached through its stub; skip here.
                        Some(TAG_FORWARDED) => {}
                        Some(TAG_OVERFLOW) => {
                            let chain = LinkedPageList::open(
                                Arc::clone(&self.pool),
                                Self::overflow_head(&payload)?,
                            );
                            out.push((rowid, self.codec.decode(&chain.read()?)?));
                        }
                        other => {
                            return Err(Error::corrupt(format!("bad record tag {other:?}")))
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    pub fn commit(&self) -> Result<()> {
        self.pool.commit()
    }

    /// Free all row pages, overflow chains, header pages, and the anchor.
    pub fn destroy(self) -> Result<()> {
        for header in self.heap.header_pages()? {
            for (page, _) in self.heap.entries(header)? {
                let heads: Vec<PageId> = self.pool.with_page(page, |view| {
                    let mut heads = Vec::new();
                    for (_, slot) in slotted::live_slots(view)? {
                        let offset = slot.offset() as usize;
                        if view.u8_at(offset)? == TAG_OVERFLOW {
                            heads.push(PageId(view.u64_at(offset + 1)?));
                        }
                    }
                    Ok(heads)
                })?;
                for head in heads {
                    LinkedPageList::open(Arc::clone(&self.pool), head).destroy()?;
                }
            }
        }
        self.heap.destroy()?;
        self.pool.free_page(self.heap.anchor())
    }
}

#[cfg(test)]
mod tests {
    use crate::physical::pager::MemPager;
    use crate::schema::row::row;
    use crate::schema::{ColumnType, Value};

    use super::*;

    fn storage(page_size: usize) -> TableStorage<MemPager> {
        let pool = Arc::new(MemPager::new(page_size));
        let codec = RowCodec::new(vec![
            ("name".into(), ColumnType::Str),
            ("age".into(), ColumnType::U32),
        ]);
        TableStorage::create(pool, codec).unwrap()
    }

    fn person(name: &str, age: u32) -> Row {
        row(&[("name", Value::Str(name.into())), ("age", Value::U32(age))])
    }

    #[test]
    fn test_insert_get_round_trip() {
        let storage = storage(256);
        let r1 = storage.insert(&person("Alice", 30)).unwrap();
        let r2 = storage.insert(&person("Bob", 40)).unwrap();
        assert_ne!(r1, r2);

        assert_eq!(storage.get(r1).unwrap(), Some(person("Alice", 30)));
        assert_eq!(storage.get(r2).unwrap(), Some(person("Bob", 40)));
    }

    #[test]
    fn test_get_after_remove_is_none() {
        let storage = storage(256);
        let r1 = storage.insert(&person("Alice", 30)).unwrap();
        storage.remove(r1).unwrap();
        assert_eq!(storage.get(r1).unwrap(), None);
    }

    #[test]
    fn test_set_in_place_keeps_rowid() {
        let storage = storage(256);
        let r1 = storage.insert(&person("Alice", 30)).unwrap();
        let back = storage.set(r1, &person("Alice", 31)).unwrap();
        assert_eq!(back, r1);
        assert_eq!(storage.get(r1).unwrap(), Some(person("Alice", 31)));
    }

    #[test]
    fn test_growing_set_forwards_but_keeps_rowid() {
        let storage = storage(256);
        let r1 = storage.insert(&person("Al", 30)).unwrap();
        // Fill the slot's neighborhood so in-place growth is impossible.
        storage.insert(&person("Bob", 1)).unwrap();

        let big_name = "Alexander-the-considerably-longer".to_string();
        let back = storage.set(r1, &person(&big_name, 30)).unwrap();
        assert_eq!(back, r1);
        assert_eq!(
            storage.get(r1).unwrap(),
            Some(person(&big_name, 30)),
            "row readable at its original id after forwarding"
        );

        // Grow again: the stub is rewritten, not chained.
        let bigger = format!("{big_name}-{}", "x".repeat(40));
        storage.set(r1, &person(&bigger, 30)).unwrap();
        assert_eq!(storage.get(r1).unwrap(), Some(person(&bigger, 30)));
    }

    #[test]
    fn test_iterate_shows_forwarded_rows_once() {
        let storage = storage(256);
        let r1 = storage.insert(&person("Al", 30)).unwrap();
        storage.insert(&person("Bob", 1)).unwrap();
        let long = "A-very-long-replacement-name-indeed".to_string();
        storage.set(r1, &person(&long, 30)).unwrap();

        let rows = storage.iterate().unwrap();
        assert_eq!(rows.len(), 2);
        let by_id: std::collections::HashMap<_, _> = rows.into_iter().collect();
        assert_eq!(by_id.get(&r1), Some(&person(&long, 30)));
    }

    #[test]
    fn test_huge_row_goes_to_overflow() {
        let storage = storage(256);
        let huge = person(&"x".repeat(2000), 9);
        let r1 = storage.insert(&huge).unwrap();
        assert_eq!(storage.get(r1).unwrap(), Some(huge.clone()));

        // Shrinking it back rewrites the chain in place.
        let small = person("tiny", 9);
        storage.set(r1, &small).unwrap();
        assert_eq!(storage.get(r1).unwrap(), Some(small));

        storage.remove(r1).unwrap();
        assert_eq!(storage.get(r1).unwrap(), None);
    }

    #[test]
    fn test_slot_reuse_after_remove() {
        let storage = storage(256);
        let r1 = storage.insert(&person("Alice", 30)).unwrap();
        let _r2 = storage.insert(&person("Bob", 40)).unwrap();
        storage.remove(r1).unwrap();

        // Same-size insert lands in the freed slot.
        let r3 = storage.insert(&person("Carol", 50)).unwrap();
        assert_eq!(r3, r1);
    }

    #[test]
    fn test_iterate_order_is_stable() {
        let storage = storage(256);
        let mut expected = Vec::new();
        for i in 0..20u32 {
            let row = person(&format!("person-{i}"), i);
            storage.insert(&row).unwrap();
            expected.push(row);
        }
        let first: Vec<Row> = storage.iterate().unwrap().into_iter().map(|(_, r)| r).collect();
        let second: Vec<Row> = storage.iterate().unwrap().into_iter().map(|(_, r)| r).collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), expected.len());
    }

    #[test]
    fn test_destroy_frees_everything() {
        let pool = Arc::new(MemPager::new(256));
        pool.set_tracking(true);
        let codec = RowCodec::new(vec![("name".into(), ColumnType::Str)]);
        let storage = TableStorage::create(Arc::clone(&pool), codec).unwrap();

        for i in 0..30 {
            storage
                .insert(&row(&[("name", Value::Str(format!("row-{i}")))]))
                .unwrap();
        }
        // One overflow row so a chain exists too.
        storage
            .insert(&row(&[("name", Value::Str("y".repeat(1000)))]))
            .unwrap();

        storage.destroy().unwrap();
        let allocated: std::collections::BTreeSet<_> = pool.alloc_log().into_iter().collect();
        let freed: std::collections::BTreeSet<_> = pool.free_log().into_iter().collect();
        assert_eq!(allocated, freed);
    }
}
