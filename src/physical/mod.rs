use std::fmt;

use crate::codec::{PageView, PageViewMut};
use crate::error::Result;

pub mod chain;
pub mod header;
pub mod heap;
pub mod pager;
pub mod slotted;

/// Identifier of a page: the absolute byte offset of the page's first byte
/// in the database file. 0 is the null page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageId(pub u64);

impl PageId {
    pub const NULL: PageId = PageId(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Identifier of a stored row: the data page it lives in and its slot index.
/// Stable for the life of the row, including across in-place updates and
/// forwarded relocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowId {
    pub page: PageId,
    pub slot: u32,
}

impl RowId {
    pub const NULL: RowId = RowId {
        page: PageId::NULL,
        slot: 0,
    };

    pub const ENCODED_LEN: usize = 12;

    pub fn new(page: PageId, slot: u32) -> Self {
        Self { page, slot }
    }

    pub fn is_null(self) -> bool {
        self.page.is_null() && self.slot == 0
    }

    pub fn read_at(view: &PageView, offset: usize) -> Result<RowId> {
        Ok(RowId {
            page: PageId(view.u64_at(offset)?),
            slot: view.u32_at(offset + 8)?,
        })
    }

    pub fn write_at(self, view: &mut PageViewMut, offset: usize) -> Result<()> {
        view.set_u64_at(offset, self.page.0)?;
        view.set_u32_at(offset + 8, self.slot)
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.page, self.slot)
    }
}
