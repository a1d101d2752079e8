//! Binary codecs: fixed-width primitives plus composable variable-width
//! forms. A codec turns one value into an exact byte sequence inside a view
//! and back; variable-width forms carry a u32 length prefix so that readers
//! can skip them without decoding.

use crate::error::{Error, Result};

pub mod view;

pub use view::{PageView, PageViewMut};

/// Encoded width of a codec: either a constant number of bytes or
/// value-dependent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Fixed(usize),
    Variable,
}

pub trait Codec {
    type Value;

    fn width(&self) -> Width;

    /// Total encoded size of `value`, including any length prefix.
    fn size_of(&self, value: &Self::Value) -> usize;

    /// Decode a value at `offset`, returning it with the number of bytes
    /// consumed.
    fn read_at(&self, view: &PageView, offset: usize) -> Result<(Self::Value, usize)>;

    fn write_at(&self, value: &Self::Value, view: &mut PageViewMut, offset: usize) -> Result<()>;
}

macro_rules! fixed_codec {
    ($( $name:ident, $ty:ty, $width:expr, $get:ident, $set:ident; )*) => {
        $(
            pub struct $name;

            impl Codec for $name {
                type Value = $ty;

                fn width(&self) -> Width {
                    Width::Fixed($width)
                }

                fn size_of(&self, _value: &$ty) -> usize {
                    $width
                }

                fn read_at(&self, view: &PageView, offset: usize) -> Result<($ty, usize)> {
                    Ok((view.$get(offset)?, $width))
                }

                fn write_at(&self, value: &$ty, view: &mut PageViewMut, offset: usize) -> Result<()> {
                    view.$set(offset, *value)
                }
            }
        )*
    };
}

fixed_codec! {
    U8Codec, u8, 1, u8_at, set_u8_at;
    U16Codec, u16, 2, u16_at, set_u16_at;
    U32Codec, u32, 4, u32_at, set_u32_at;
    U64Codec, u64, 8, u64_at, set_u64_at;
    I16Codec, i16, 2, i16_at, set_i16_at;
    I32Codec, i32, 4, i32_at, set_i32_at;
    I64Codec, i64, 8, i64_at, set_i64_at;
    F64Codec, f64, 8, f64_at, set_f64_at;
}

pub struct BoolCodec;

impl Codec for BoolCodec {
    type Value = bool;

    fn width(&self) -> Width {
        Width::Fixed(1)
    }

    fn size_of(&self, _value: &bool) -> usize {
        1
    }

    fn read_at(&self, view: &PageView, offset: usize) -> Result<(bool, usize)> {
        Ok((view.u8_at(offset)? != 0, 1))
    }

    fn write_at(&self, value: &bool, view: &mut PageViewMut, offset: usize) -> Result<()> {
        view.set_u8_at(offset, *value as u8)
    }
}

/// A u32 byte-length prefix followed by the inner encoding. A zero length
/// materializes the empty value without invoking the inner reader.
pub struct LengthPrefixed<C>(pub C);

impl<C: Codec> Codec for LengthPrefixed<C>
where
    C::Value: Default,
{
    type Value = C::Value;

    fn width(&self) -> Width {
        Width::Variable
    }

    fn size_of(&self, value: &C::Value) -> usize {
        4 + self.0.size_of(value)
    }

    fn read_at(&self, view: &PageView, offset: usize) -> Result<(C::Value, usize)> {
        let len = view.u32_at(offset)? as usize;
        if len == 0 {
            return Ok((C::Value::default(), 4));
        }
        let inner = view.slice(offset + 4, len)?;
        let (value, _) = self.0.read_at(&inner, 0)?;
        Ok((value, 4 + len))
    }

    fn write_at(&self, value: &C::Value, view: &mut PageViewMut, offset: usize) -> Result<()> {
        let len = self.0.size_of(value);
        view.set_u32_at(offset, len as u32)?;
        let mut inner = view.slice_mut(offset + 4, len)?;
        self.0.write_at(value, &mut inner, 0)
    }
}

/// Concatenated elements; the reader consumes until the view is exhausted,
/// so a sequence must be the last (or only) thing in its view.
pub struct Sequence<C>(pub C);

impl<C: Codec> Codec for Sequence<C> {
    type Value = Vec<C::Value>;

    fn width(&self) -> Width {
        Width::Variable
    }

    fn size_of(&self, value: &Vec<C::Value>) -> usize {
        value.iter().map(|v| self.0.size_of(v)).sum()
    }

    fn read_at(&self, view: &PageView, offset: usize) -> Result<(Vec<C::Value>, usize)> {
        let mut values = Vec::new();
        let mut pos = offset;
        while pos < view.len() {
            let (value, consumed) = self.0.read_at(view, pos)?;
            values.push(value);
            pos += consumed;
        }
        Ok((values, pos - offset))
    }

    fn write_at(&self, value: &Vec<C::Value>, view: &mut PageViewMut, offset: usize) -> Result<()> {
        let mut pos = offset;
        for item in value {
            self.0.write_at(item, view, pos)?;
            pos += self.0.size_of(item);
        }
        Ok(())
    }
}

/// One discriminator byte (0 = null, 1 = present) then the inner encoding.
pub struct Nullable<C>(pub C);

impl<C: Codec> Codec for Nullable<C> {
    type Value = Option<C::Value>;

    fn width(&self) -> Width {
        // Encoded size depends on presence even over a fixed inner codec.
        Width::Variable
    }

    fn size_of(&self, value: &Option<C::Value>) -> usize {
        match value {
            None => 1,
            Some(inner) => 1 + self.0.size_of(inner),
        }
    }

    fn read_at(&self, view: &PageView, offset: usize) -> Result<(Option<C::Value>, usize)> {
        match view.u8_at(offset)? {
            0 => Ok((None, 1)),
            1 => {
                let (value, consumed) = self.0.read_at(view, offset + 1)?;
                Ok((Some(value), 1 + consumed))
            }
            other => Err(Error::corrupt(format!("invalid null discriminator {other}"))),
        }
    }

    fn write_at(
        &self,
        value: &Option<C::Value>,
        view: &mut PageViewMut,
        offset: usize,
    ) -> Result<()> {
        match value {
            None => view.set_u8_at(offset, 0),
            Some(inner) => {
                view.set_u8_at(offset, 1)?;
                self.0.write_at(inner, view, offset + 1)
            }
        }
    }
}

/// UTF-8 text in a length-prefixed envelope.
pub struct StrCodec;

impl Codec for StrCodec {
    type Value = String;

    fn width(&self) -> Width {
        Width::Variable
    }

    fn size_of(&self, value: &String) -> usize {
        4 + value.len()
    }

    fn read_at(&self, view: &PageView, offset: usize) -> Result<(String, usize)> {
        let len = view.u32_at(offset)? as usize;
        let text = view.utf8_at(offset + 4, len)?;
        Ok((text.to_owned(), 4 + len))
    }

    fn write_at(&self, value: &String, view: &mut PageViewMut, offset: usize) -> Result<()> {
        view.set_u32_at(offset, value.len() as u32)?;
        view.put_bytes(offset + 4, value.as_bytes())
    }
}

/// Raw bytes in a length-prefixed envelope.
pub struct BytesCodec;

impl Codec for BytesCodec {
    type Value = Vec<u8>;

    fn width(&self) -> Width {
        Width::Variable
    }

    fn size_of(&self, value: &Vec<u8>) -> usize {
        4 + value.len()
    }

    fn read_at(&self, view: &PageView, offset: usize) -> Result<(Vec<u8>, usize)> {
        let len = view.u32_at(offset)? as usize;
        let bytes = view.bytes_at(offset + 4, len)?;
        Ok((bytes.to_vec(), 4 + len))
    }

    fn write_at(&self, value: &Vec<u8>, view: &mut PageViewMut, offset: usize) -> Result<()> {
        view.set_u32_at(offset, value.len() as u32)?;
        view.put_bytes(offset + 4, value)
    }
}

/// Encode a value to a fresh buffer. Convenience for callers that size a
/// slot from the encoding.
pub fn encode_to_vec<C: Codec>(codec: &C, value: &C::Value) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; codec.size_of(value)];
    codec.write_at(value, &mut PageViewMut::new(&mut buf), 0)?;
    Ok(buf)
}
