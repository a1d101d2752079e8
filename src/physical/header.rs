use std::io::{Read, Seek, SeekFrom, Write};

use zerocopy::{
    big_endian::{U32, U64},
    AsBytes, FromBytes,
};

use crate::error::{Error, Result};
use crate::physical::PageId;

pub const HEADER_SIZE: usize = 12;

/// Default page size for freshly created databases.
pub const DEFAULT_PAGE_SIZE: u32 = 4096;

/// The fixed record at file offset 0. The buffer-pool region (freelist head
/// pointer followed by the pages) starts immediately after it.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    zerocopy::FromZeroes,
    zerocopy::FromBytes,
    zerocopy::AsBytes,
    zerocopy::Unaligned,
)]
#[repr(C)]
pub struct FileHeader {
    /// The page size used by the buffer pool.
    page_size: U32,
    /// Anchor page of the `__dbPageIds` table heap. 0 until bootstrap has
    /// allocated it.
    header_page_id: U64,
}

impl FileHeader {
    pub fn new(page_size: u32, header_page_id: PageId) -> Self {
        Self {
            page_size: page_size.into(),
            header_page_id: header_page_id.0.into(),
        }
    }

    pub fn read<R: Read + Seek>(mut reader: R) -> Result<Self> {
        let mut bytes = [0; HEADER_SIZE];
        reader.seek(SeekFrom::Start(0))?;
        reader.read_exact(&mut bytes)?;

        let header = Self::read_from(&bytes[..]).unwrap();
        header.validate()?;
        Ok(header)
    }

    pub fn write<W: Write + Seek>(&self, mut writer: W) -> Result<()> {
        writer.seek(SeekFrom::Start(0))?;
        writer.write_all(self.as_bytes())?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let page_size = self.page_size.get();
        if !page_size.is_power_of_two() || !(512..=65536).contains(&page_size) {
            return Err(Error::corrupt(format!("bad page size {page_size}")));
        }
        Ok(())
    }

    pub fn page_size(&self) -> u32 {
        self.page_size.get()
    }

    pub fn header_page_id(&self) -> PageId {
        PageId(self.header_page_id.get())
    }

    pub fn set_header_page_id(&mut self, id: PageId) {
        self.header_page_id.set(id.0);
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn test_header_round_trip() {
        let header = FileHeader::new(DEFAULT_PAGE_SIZE, PageId(20));

        let mut buf = Cursor::new(Vec::new());
        header.write(&mut buf).unwrap();
        assert_eq!(buf.get_ref().len(), HEADER_SIZE);

        let read_back = FileHeader::read(&mut buf).unwrap();
        assert_eq!(read_back, header);
        assert_eq!(read_back.page_size(), 4096);
        assert_eq!(read_back.header_page_id(), PageId(20));
    }

    #[test]
    fn test_header_layout_is_big_endian() {
        let header = FileHeader::new(4096, PageId(0x0102));
        let bytes = header.as_bytes();
        assert_eq!(bytes, [0, 0, 16, 0, 0, 0, 0, 0, 0, 0, 1, 2]);
    }

    #[test]
    fn test_bad_page_size_rejected() {
        let mut buf = Cursor::new(vec![0u8; HEADER_SIZE]);
        assert!(FileHeader::read(&mut buf).is_err());
    }
}
