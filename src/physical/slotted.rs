//! Intra-page allocator for variable-length records.
//!
//! Record bytes grow from the head of the page; the slot directory grows
//! from the tail:
//!
//! ```text
//! [ records → .... free .... ← slot[N-1] | ... | slot[0] | freeSpaceOffset | slotCount ]
//! ```
//!
//! A slot is an `(offset, length)` pair; `length == 0` marks a freed slot
//! whose index may be reused. A zeroed page is a valid empty slotted page.

use zerocopy::big_endian::U32;

use crate::codec::{PageView, PageViewMut};
use crate::error::{Error, Result};

/// Bytes taken by `freeSpaceOffset` and `slotCount` at the very end of the
/// page.
pub const FOOTER_FIXED: usize = 8;

pub const SLOT_ENTRY_SIZE: usize = 8;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    zerocopy::FromZeroes,
    zerocopy::FromBytes,
    zerocopy::AsBytes,
    zerocopy::Unaligned,
)]
#[repr(C)]
pub struct Slot {
    offset: U32,
    length: U32,
}

impl Slot {
    pub fn new(offset: u32, length: u32) -> Self {
        Self {
            offset: offset.into(),
            length: length.into(),
        }
    }

    pub fn offset(&self) -> u32 {
        self.offset.get()
    }

    pub fn length(&self) -> u32 {
        self.length.get()
    }

    pub fn is_free(&self) -> bool {
        self.length.get() == 0
    }

    pub fn end(&self) -> u32 {
        self.offset.get() + self.length.get()
    }
}

fn slot_pos(page_len: usize, index: u32) -> usize {
    page_len - FOOTER_FIXED - SLOT_ENTRY_SIZE * (index as usize + 1)
}

pub fn slot_count(view: &PageView) -> Result<u32> {
    view.u32_at(view.len() - 4)
}

pub fn free_space_offset(view: &PageView) -> Result<u32> {
    view.u32_at(view.len() - 8)
}

pub fn slot_entry(view: &PageView, index: u32) -> Result<Slot> {
    if index >= slot_count(view)? {
        return Err(Error::ReadPastEnd);
    }
    view.read::<Slot>(slot_pos(view.len(), index))
}

/// All live slots with their indexes, in slot-index order.
pub fn live_slots(view: &PageView) -> Result<Vec<(u32, Slot)>> {
    let count = slot_count(view)?;
    let mut slots = Vec::new();
    for index in 0..count {
        let slot = view.read::<Slot>(slot_pos(view.len(), index))?;
        if !slot.is_free() {
            slots.push((index, slot));
        }
    }
    Ok(slots)
}

/// Gaps between live records below `freeSpaceOffset`, as `(offset, length)`
/// pairs sorted by offset.
pub fn free_blocks(view: &PageView) -> Result<Vec<(u32, u32)>> {
    let fso = free_space_offset(view)?;
    let mut live = live_slots(view)?;
    live.sort_by_key(|(_, slot)| slot.offset());

    let mut blocks = Vec::new();
    let mut cursor = 0u32;
    for (_, slot) in live {
        if slot.offset() > cursor {
            blocks.push((cursor, slot.offset() - cursor));
        }
        cursor = cursor.max(slot.end());
    }
    if cursor < fso {
        blocks.push((cursor, fso - cursor));
    }
    Ok(blocks)
}

/// Size of the largest record this page can still accept. Reserves room for
/// a fresh directory entry unless a freed slot is available for reuse.
pub fn free_space(view: &PageView) -> Result<usize> {
    let count = slot_count(view)?;
    let fso = free_space_offset(view)? as usize;
    let footer_start = view.len() - FOOTER_FIXED - SLOT_ENTRY_SIZE * count as usize;

    let trailing = footer_start.saturating_sub(fso);
    let largest_block = free_blocks(view)?
        .into_iter()
        .map(|(_, len)| len as usize)
        .max()
        .unwrap_or(0);

    let mut has_free_slot = false;
    for index in 0..count {
        if view.read::<Slot>(slot_pos(view.len(), index))?.is_free() {
            has_free_slot = true;
            break;
        }
    }

    let reserve = if has_free_slot { 0 } else { SLOT_ENTRY_SIZE };
    Ok(largest_block.max(trailing).saturating_sub(reserve))
}

/// Allocate `n` record bytes, reusing the lowest freed slot index when one
/// exists and the first fitting free block otherwise placing at
/// `freeSpaceOffset`. Fails `NoSpace` when the page cannot take `n` bytes.
pub fn allocate_slot(view: &mut PageViewMut, n: usize) -> Result<(u32, Slot)> {
    let page_len = view.len();
    let (count, fso, available, first_free, block) = {
        let ro = view.as_view();
        let count = slot_count(&ro)?;
        let fso = free_space_offset(&ro)?;
        let available = free_space(&ro)?;
        let mut first_free = None;
        for index in 0..count {
            if ro.read::<Slot>(slot_pos(page_len, index))?.is_free() {
                first_free = Some(index);
                break;
            }
        }
        let block = free_blocks(&ro)?
            .into_iter()
            .find(|&(_, len)| len as usize >= n);
        (count, fso, available, first_free, block)
    };

    if available < n {
        return Err(Error::NoSpace {
            needed: n,
            available,
        });
    }

    match first_free {
        Some(index) => {
            let slot = match block {
                Some((offset, _)) => Slot::new(offset, n as u32),
                None => {
                    let slot = Slot::new(fso, n as u32);
                    view.set_u32_at(page_len - 8, fso + n as u32)?;
                    slot
                }
            };
            view.write(slot_pos(page_len, index), slot)?;
            Ok((index, slot))
        }
        None => {
            let new_footer_start =
                page_len - FOOTER_FIXED - SLOT_ENTRY_SIZE * (count as usize + 1);
            let slot = if fso as usize + n <= new_footer_start {
                let slot = Slot::new(fso, n as u32);
                view.set_u32_at(page_len - 8, fso + n as u32)?;
                slot
            } else if let Some((offset, _)) = block.filter(|_| fso as usize <= new_footer_start) {
                Slot::new(offset, n as u32)
            } else {
                return Err(Error::NoSpace {
                    needed: n,
                    available,
                });
            };
            view.write(slot_pos(page_len, count), slot)?;
            view.set_u32_at(page_len - 4, count + 1)?;
            Ok((count, slot))
        }
    }
}

/// Free a slot: the entry becomes `(0, 0)`, `freeSpaceOffset` shrinks to the
/// highest live record end, and trailing freed entries are trimmed from the
/// directory.
pub fn free_slot(view: &mut PageViewMut, index: u32) -> Result<()> {
    let page_len = view.len();
    let mut count = slot_count(&view.as_view())?;
    if index >= count {
        return Err(Error::ReadPastEnd);
    }

    view.write(slot_pos(page_len, index), Slot::new(0, 0))?;

    let new_fso = live_slots(&view.as_view())?
        .into_iter()
        .map(|(_, slot)| slot.end())
        .max()
        .unwrap_or(0);
    view.set_u32_at(page_len - 8, new_fso)?;

    while count > 0 {
        let last = view.as_view().read::<Slot>(slot_pos(page_len, count - 1))?;
        if !last.is_free() {
            break;
        }
        count -= 1;
    }
    view.set_u32_at(page_len - 4, count)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(len: usize) -> Vec<u8> {
        vec![0u8; len]
    }

    #[test]
    fn test_empty_page_accounting() {
        let buf = page(80);
        let view = PageView::new(&buf);
        assert_eq!(slot_count(&view).unwrap(), 0);
        assert_eq!(free_space_offset(&view).unwrap(), 0);
        // 80 bytes minus the fixed footer and one reserved entry.
        assert_eq!(free_space(&view).unwrap(), 64);
    }

    #[test]
    fn test_allocate_appends_in_order() {
        let mut buf = page(80);
        let mut view = PageViewMut::new(&mut buf);

        let (i0, s0) = allocate_slot(&mut view, 10).unwrap();
        let (i1, s1) = allocate_slot(&mut view, 5).unwrap();
        assert_eq!((i0, s0.offset(), s0.length()), (0, 0, 10));
        assert_eq!((i1, s1.offset(), s1.length()), (1, 10, 5));
        assert_eq!(free_space_offset(&view.as_view()).unwrap(), 15);
        assert_eq!(slot_count(&view.as_view()).unwrap(), 2);
    }

    #[test]
    fn test_slot_reuse_prefers_freed_block() {
        // Scenario: three records of 10, 5 and 4 bytes in an 80-byte page.
        let mut buf = page(80);
        let mut view = PageViewMut::new(&mut buf);
        allocate_slot(&mut view, 10).unwrap();
        allocate_slot(&mut view, 5).unwrap();
        allocate_slot(&mut view, 4).unwrap();

        free_slot(&mut view, 1).unwrap();
        assert!(slot_entry(&view.as_view(), 1).unwrap().is_free());

        // A 3-byte record fits in the freed 5-byte block and takes its
        // original offset.
        let (index, slot) = allocate_slot(&mut view, 3).unwrap();
        assert_eq!(index, 1);
        assert_eq!(slot.offset(), 10);

        // A 6-byte record does not fit the freed block; it gets a fresh
        // slot at the free space offset.
        let (index, slot) = allocate_slot(&mut view, 6).unwrap();
        assert_eq!(index, 3);
        assert_eq!(slot.offset(), 19);

        // Freeing the last slot trims the directory, so the next allocation
        // reuses its index.
        free_slot(&mut view, 3).unwrap();
        assert_eq!(slot_count(&view.as_view()).unwrap(), 3);
        let (index, _) = allocate_slot(&mut view, 8).unwrap();
        assert_eq!(index, 3);
    }

    #[test]
    fn test_free_slot_shrinks_free_space_offset() {
        let mut buf = page(80);
        let mut view = PageViewMut::new(&mut buf);
        allocate_slot(&mut view, 10).unwrap();
        allocate_slot(&mut view, 5).unwrap();
        assert_eq!(free_space_offset(&view.as_view()).unwrap(), 15);

        free_slot(&mut view, 1).unwrap();
        assert_eq!(free_space_offset(&view.as_view()).unwrap(), 10);
        assert_eq!(slot_count(&view.as_view()).unwrap(), 1);
    }

    #[test]
    fn test_no_space() {
        let mut buf = page(48);
        let mut view = PageViewMut::new(&mut buf);
        // 48 - 8 footer - 8 entry leaves 32 usable bytes.
        allocate_slot(&mut view, 20).unwrap();
        let err = allocate_slot(&mut view, 20).unwrap_err();
        assert!(matches!(err, Error::NoSpace { needed: 20, .. }));
        allocate_slot(&mut view, 4).unwrap();
    }

    #[test]
    fn test_live_slots_skip_freed() {
        let mut buf = page(80);
        let mut view = PageViewMut::new(&mut buf);
        allocate_slot(&mut view, 4).unwrap();
        allocate_slot(&mut view, 4).unwrap();
        allocate_slot(&mut view, 4).unwrap();
        free_slot(&mut view, 1).unwrap();

        let live = live_slots(&view.as_view()).unwrap();
        let indexes: Vec<u32> = live.iter().map(|(i, _)| *i).collect();
        assert_eq!(indexes, vec![0, 2]);

        let blocks = free_blocks(&view.as_view()).unwrap();
        assert_eq!(blocks, vec![(4, 4)]);
    }

    #[test]
    fn test_no_live_slots_overlap() {
        let mut buf = page(256);
        let mut view = PageViewMut::new(&mut buf);
        for _ in 0..8 {
            allocate_slot(&mut view, 7).unwrap();
        }
        free_slot(&mut view, 2).unwrap();
        free_slot(&mut view, 5).unwrap();
        allocate_slot(&mut view, 7).unwrap();
        allocate_slot(&mut view, 3).unwrap();
        allocate_slot(&mut view, 11).unwrap();

        let mut live = live_slots(&view.as_view()).unwrap();
        live.sort_by_key(|(_, slot)| slot.offset());
        for pair in live.windows(2) {
            assert!(pair[0].1.end() <= pair[1].1.offset());
        }

        let fso = free_space_offset(&view.as_view()).unwrap();
        assert!(live.iter().all(|(_, slot)| slot.end() <= fso));
    }
}
