use std::mem;

use zerocopy::{
    big_endian::{F64, I16, I32, I64, U16, U32, U64},
    AsBytes, FromBytes,
};

use crate::error::{Error, Result};

/// Read-only window over a byte range. All multi-byte accessors are
/// big-endian; every access is bounds-checked against the window length.
#[derive(Clone, Copy)]
pub struct PageView<'a> {
    data: &'a [u8],
}

/// Writable window over a byte range.
pub struct PageViewMut<'a> {
    data: &'a mut [u8],
}

impl<'a> PageView<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn slice(&self, offset: usize, len: usize) -> Result<PageView<'a>> {
        let end = offset.checked_add(len).ok_or(Error::ReadPastEnd)?;
        if end > self.data.len() {
            return Err(Error::ReadPastEnd);
        }
        Ok(PageView {
            data: &self.data[offset..end],
        })
    }

    pub fn read<T: FromBytes>(&self, offset: usize) -> Result<T> {
        let end = offset
            .checked_add(mem::size_of::<T>())
            .ok_or(Error::ReadPastEnd)?;
        if end > self.data.len() {
            return Err(Error::ReadPastEnd);
        }
        Ok(T::read_from(&self.data[offset..end]).unwrap())
    }

    pub fn u8_at(&self, offset: usize) -> Result<u8> {
        self.bytes_at(offset, 1).map(|b| b[0])
    }

    pub fn u16_at(&self, offset: usize) -> Result<u16> {
        self.read::<U16>(offset).map(|v| v.get())
    }

    pub fn u32_at(&self, offset: usize) -> Result<u32> {
        self.read::<U32>(offset).map(|v| v.get())
    }

    pub fn u64_at(&self, offset: usize) -> Result<u64> {
        self.read::<U64>(offset).map(|v| v.get())
    }

    pub fn i16_at(&self, offset: usize) -> Result<i16> {
        self.read::<I16>(offset).map(|v| v.get())
    }

    pub fn i32_at(&self, offset: usize) -> Result<i32> {
        self.read::<I32>(offset).map(|v| v.get())
    }

    pub fn i64_at(&self, offset: usize) -> Result<i64> {
        self.read::<I64>(offset).map(|v| v.get())
    }

    pub fn f64_at(&self, offset: usize) -> Result<f64> {
        self.read::<F64>(offset).map(|v| v.get())
    }

    pub fn bytes_at(&self, offset: usize, len: usize) -> Result<&'a [u8]> {
        let end = offset.checked_add(len).ok_or(Error::ReadPastEnd)?;
        if end > self.data.len() {
            return Err(Error::ReadPastEnd);
        }
        Ok(&self.data[offset..end])
    }

    pub fn utf8_at(&self, offset: usize, len: usize) -> Result<&'a str> {
        let bytes = self.bytes_at(offset, len)?;
        std::str::from_utf8(bytes).map_err(|_| Error::corrupt("invalid utf-8"))
    }
}

impl<'a> PageViewMut<'a> {
    pub fn new(data: &'a mut [u8]) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn as_view(&self) -> PageView<'_> {
        PageView { data: self.data }
    }

    pub fn slice_mut(&mut self, offset: usize, len: usize) -> Result<PageViewMut<'_>> {
        let available = self.data.len();
        let end = offset.checked_add(len).ok_or(Error::NoSpace {
            needed: usize::MAX,
            available,
        })?;
        if end > available {
            return Err(Error::NoSpace {
                needed: end,
                available,
            });
        }
        Ok(PageViewMut {
            data: &mut self.data[offset..end],
        })
    }

    pub fn write<T: AsBytes>(&mut self, offset: usize, value: T) -> Result<()> {
        let needed = mem::size_of::<T>();
        let available = self.data.len();
        let end = offset
            .checked_add(needed)
            .ok_or(Error::NoSpace { needed, available })?;
        if end > available {
            return Err(Error::NoSpace { needed, available });
        }
        value.write_to(&mut self.data[offset..end]).unwrap();
        Ok(())
    }

    pub fn set_u8_at(&mut self, offset: usize, value: u8) -> Result<()> {
        self.put_bytes(offset, &[value])
    }

    pub fn set_u16_at(&mut self, offset: usize, value: u16) -> Result<()> {
        self.write(offset, U16::from(value))
    }

    pub fn set_u32_at(&mut self, offset: usize, value: u32) -> Result<()> {
        self.write(offset, U32::from(value))
    }

    pub fn set_u64_at(&mut self, offset: usize, value: u64) -> Result<()> {
        self.write(offset, U64::from(value))
    }

    pub fn set_i16_at(&mut self, offset: usize, value: i16) -> Result<()> {
        self.write(offset, I16::from(value))
    }

    pub fn set_i32_at(&mut self, offset: usize, value: i32) -> Result<()> {
        self.write(offset, I32::from(value))
    }

    pub fn set_i64_at(&mut self, offset: usize, value: i64) -> Result<()> {
        self.write(offset, I64::from(value))
    }

    pub fn set_f64_at(&mut self, offset: usize, value: f64) -> Result<()> {
        self.write(offset, F64::from(value))
    }

    pub fn put_bytes(&mut self, offset: usize, src: &[u8]) -> Result<()> {
        let needed = src.len();
        let available = self.data.len();
        let end = offset
            .checked_add(needed)
            .ok_or(Error::NoSpace { needed, available })?;
        if end > available {
            return Err(Error::NoSpace { needed, available });
        }
        self.data[offset..end].copy_from_slice(src);
        Ok(())
    }

    pub fn fill(&mut self, byte: u8, start: usize, end: usize) -> Result<()> {
        if start > end || end > self.data.len() {
            return Err(Error::NoSpace {
                needed: end,
                available: self.data.len(),
            });
        }
        self.data[start..end].fill(byte);
        Ok(())
    }
}
