//! Row records: named values serialized as the concatenation of column
//! encodings in declared order, wrapped in a u32 length prefix.

use std::collections::BTreeMap;

use crate::codec::{Codec, PageView, PageViewMut, Width};
use crate::error::{Error, Result};
use crate::schema::{ColumnType, Value};

pub type Row = BTreeMap<String, Value>;

/// Build a row from `(name, value)` pairs.
pub fn row(fields: &[(&str, Value)]) -> Row {
    fields
        .iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect()
}

/// Codec for one column value, dispatched on its type.
pub struct ValueCodec {
    pub ty: ColumnType,
}

impl ValueCodec {
    pub fn new(ty: ColumnType) -> Self {
        Self { ty }
    }
}

impl Codec for ValueCodec {
    type Value = Value;

    fn width(&self) -> Width {
        match &self.ty {
            ColumnType::Bool | ColumnType::U8 => Width::Fixed(1),
            ColumnType::U16 | ColumnType::I16 => Width::Fixed(2),
            ColumnType::U32 | ColumnType::I32 | ColumnType::Timestamp => Width::Fixed(4),
            ColumnType::U64 | ColumnType::I64 | ColumnType::F64 => Width::Fixed(8),
            ColumnType::Date => Width::Fixed(6),
            ColumnType::Str | ColumnType::Bytes | ColumnType::Json | ColumnType::Nullable(_) => {
                Width::Variable
            }
        }
    }

    fn size_of(&self, value: &Value) -> usize {
        match (&self.ty, value) {
            (ColumnType::Bool, _) | (ColumnType::U8, _) => 1,
            (ColumnType::U16, _) | (ColumnType::I16, _) => 2,
            (ColumnType::U32, _) | (ColumnType::I32, _) | (ColumnType::Timestamp, _) => 4,
            (ColumnType::U64, _) | (ColumnType::I64, _) | (ColumnType::F64, _) => 8,
            (ColumnType::Date, _) => 6,
            (ColumnType::Str, Value::Str(s)) => 4 + s.len(),
            (ColumnType::Bytes, Value::Bytes(b)) => 4 + b.len(),
            (ColumnType::Json, Value::Json(v)) => 4 + v.to_string().len(),
            (ColumnType::Nullable(_), Value::Null) => 1,
            (ColumnType::Nullable(inner), v) => {
                1 + ValueCodec::new((**inner).clone()).size_of(v)
            }
            // Mismatched values never reach the codec; validation runs
            // first. Size them as their null form to stay total.
            _ => 0,
        }
    }

    fn read_at(&self, view: &PageView, offset: usize) -> Result<(Value, usize)> {
        match &self.ty {
            ColumnType::Bool => Ok((Value::Bool(view.u8_at(offset)? != 0), 1)),
            ColumnType::U8 => Ok((Value::U8(view.u8_at(offset)?), 1)),
            ColumnType::U16 => Ok((Value::U16(view.u16_at(offset)?), 2)),
            ColumnType::U32 => Ok((Value::U32(view.u32_at(offset)?), 4)),
            ColumnType::U64 => Ok((Value::U64(view.u64_at(offset)?), 8)),
            ColumnType::I16 => Ok((Value::I16(view.i16_at(offset)?), 2)),
            ColumnType::I32 => Ok((Value::I32(view.i32_at(offset)?), 4)),
            ColumnType::I64 => Ok((Value::I64(view.i64_at(offset)?), 8)),
            ColumnType::F64 => Ok((Value::F64(view.f64_at(offset)?), 8)),
            ColumnType::Timestamp => Ok((Value::Timestamp(view.i32_at(offset)?), 4)),
            ColumnType::Date => {
                let year = view.u32_at(offset)?;
                let month = view.u8_at(offset + 4)?;
                let day = view.u8_at(offset + 5)?;
                Ok((Value::Date { year, month, day }, 6))
            }
            ColumnType::Str => {
                let len = view.u32_at(offset)? as usize;
                let text = view.utf8_at(offset + 4, len)?;
                Ok((Value::Str(text.to_owned()), 4 + len))
            }
            ColumnType::Bytes => {
                let len = view.u32_at(offset)? as usize;
                let bytes = view.bytes_at(offset + 4, len)?;
                Ok((Value::Bytes(bytes.to_vec()), 4 + len))
            }
            ColumnType::Json => {
                let len = view.u32_at(offset)? as usize;
                let text = view.utf8_at(offset + 4, len)?;
                let value = serde_json::from_str(text)
                    .map_err(|e| Error::corrupt(format!("bad json column: {e}")))?;
                Ok((Value::Json(value), 4 + len))
            }
            ColumnType::Nullable(inner) => match view.u8_at(offset)? {
                0 => Ok((Value::Null, 1)),
                1 => {
                    let (value, consumed) =
                        ValueCodec::new((**inner).clone()).read_at(view, offset + 1)?;
                    Ok((value, 1 + consumed))
                }
                other => Err(Error::corrupt(format!("invalid null discriminator {other}"))),
            },
        }
    }

    fn write_at(&self, value: &Value, view: &mut PageViewMut, offset: usize) -> Result<()> {
        match (&self.ty, value) {
            (ColumnType::Bool, Value::Bool(b)) => view.set_u8_at(offset, *b as u8),
            (ColumnType::U8, Value::U8(n)) => view.set_u8_at(offset, *n),
            (ColumnType::U16, Value::U16(n)) => view.set_u16_at(offset, *n),
            (ColumnType::U32, Value::U32(n)) => view.set_u32_at(offset, *n),
            (ColumnType::U64, Value::U64(n)) => view.set_u64_at(offset, *n),
            (ColumnType::I16, Value::I16(n)) => view.set_i16_at(offset, *n),
            (ColumnType::I32, Value::I32(n)) => view.set_i32_at(offset, *n),
            (ColumnType::I64, Value::I64(n)) => view.set_i64_at(offset, *n),
            (ColumnType::F64, Value::F64(n)) => view.set_f64_at(offset, *n),
            (ColumnType::Timestamp, Value::Timestamp(t)) => view.set_i32_at(offset, *t),
            (ColumnType::Date, Value::Date { year, month, day }) => {
                view.set_u32_at(offset, *year)?;
                view.set_u8_at(offset + 4, *month)?;
                view.set_u8_at(offset + 5, *day)
            }
            (ColumnType::Str, Value::Str(s)) => {
                view.set_u32_at(offset, s.len() as u32)?;
                view.put_bytes(offset + 4, s.as_bytes())
            }
            (ColumnType::Bytes, Value::Bytes(b)) => {
                view.set_u32_at(offset, b.len() as u32)?;
                view.put_bytes(offset + 4, b)
            }
            (ColumnType::Json, Value::Json(v)) => {
                let text = v.to_string();
                view.set_u32_at(offset, text.len() as u32)?;
                view.put_bytes(offset + 4, text.as_bytes())
            }
            (ColumnType::Nullable(_), Value::Null) => view.set_u8_at(offset, 0),
            (ColumnType::Nullable(inner), v) => {
                view.set_u8_at(offset, 1)?;
                ValueCodec::new((**inner).clone()).write_at(v, view, offset + 1)
            }
            (ty, v) => Err(Error::corrupt(format!(
                "cannot encode {} as {}",
                v.type_name(),
                ty.type_name()
            ))),
        }
    }
}

/// Codec for whole rows over an ordered list of stored columns.
pub struct RowCodec {
    columns: Vec<(String, ColumnType)>,
}

impl RowCodec {
    pub fn new(columns: Vec<(String, ColumnType)>) -> Self {
        Self { columns }
    }

    pub fn columns(&self) -> &[(String, ColumnType)] {
        &self.columns
    }

    fn field_value<'r>(row: &'r Row, name: &str) -> &'r Value {
        row.get(name).unwrap_or(&Value::Null)
    }

    pub fn encode(&self, row: &Row) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.size_of(row)];
        self.write_at(row, &mut PageViewMut::new(&mut buf), 0)?;
        Ok(buf)
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Row> {
        let (row, _) = self.read_at(&PageView::new(bytes), 0)?;
        Ok(row)
    }
}

impl Codec for RowCodec {
    type Value = Row;

    fn width(&self) -> Width {
        Width::Variable
    }

    /// Encoded size including the u32 length prefix.
    fn size_of(&self, row: &Row) -> usize {
        4 + self
            .columns
            .iter()
            .map(|(name, ty)| {
                ValueCodec::new(ty.clone()).size_of(Self::field_value(row, name))
            })
            .sum::<usize>()
    }

    fn write_at(&self, row: &Row, view: &mut PageViewMut, offset: usize) -> Result<()> {
        let body = self.size_of(row) - 4;
        view.set_u32_at(offset, body as u32)?;
        let mut pos = offset + 4;
        for (name, ty) in &self.columns {
            let codec = ValueCodec::new(ty.clone());
            let value = Self::field_value(row, name);
            codec.write_at(value, view, pos)?;
            pos += codec.size_of(value);
        }
        Ok(())
    }

    fn read_at(&self, view: &PageView, offset: usize) -> Result<(Row, usize)> {
        let body = view.u32_at(offset)? as usize;
        let mut row = Row::new();
        let mut pos = offset + 4;
        for (name, ty) in &self.columns {
            let (value, consumed) = ValueCodec::new(ty.clone()).read_at(view, pos)?;
            row.insert(name.clone(), value);
            pos += consumed;
        }
        if pos != offset + 4 + body {
            return Err(Error::corrupt("row length prefix mismatch"));
        }
        Ok((row, 4 + body))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn people_codec() -> RowCodec {
        RowCodec::new(vec![
            ("name".into(), ColumnType::Str),
            ("age".into(), ColumnType::U32),
            ("nickname".into(), ColumnType::Nullable(Box::new(ColumnType::Str))),
        ])
    }

    #[test]
    fn test_row_round_trip() {
        let codec = people_codec();
        let record = row(&[
            ("name", Value::Str("Alice".into())),
            ("age", Value::U32(30)),
            ("nickname", Value::Str("Al".into())),
        ]);
        let bytes = codec.encode(&record).unwrap();
        assert_eq!(bytes.len(), codec.size_of(&record));
        assert_eq!(codec.decode(&bytes).unwrap(), record);
    }

    #[test]
    fn test_null_field_round_trip() {
        let codec = people_codec();
        let record = row(&[
            ("name", Value::Str("Bob".into())),
            ("age", Value::U32(44)),
            ("nickname", Value::Null),
        ]);
        let bytes = codec.encode(&record).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), record);
    }

    #[test]
    fn test_every_column_type_round_trips() {
        let columns: Vec<(String, ColumnType)> = vec![
            ("a".into(), ColumnType::Bool),
            ("b".into(), ColumnType::U8),
            ("c".into(), ColumnType::U16),
            ("d".into(), ColumnType::U32),
            ("e".into(), ColumnType::U64),
            ("f".into(), ColumnType::I16),
            ("g".into(), ColumnType::I32),
            ("h".into(), ColumnType::I64),
            ("i".into(), ColumnType::F64),
            ("j".into(), ColumnType::Str),
            ("k".into(), ColumnType::Bytes),
            ("l".into(), ColumnType::Date),
            ("m".into(), ColumnType::Timestamp),
            ("n".into(), ColumnType::Json),
        ];
        let codec = RowCodec::new(columns);
        let record = row(&[
            ("a", Value::Bool(true)),
            ("b", Value::U8(200)),
            ("c", Value::U16(65_000)),
            ("d", Value::U32(4_000_000_000)),
            ("e", Value::U64(u64::MAX)),
            ("f", Value::I16(-30_000)),
            ("g", Value::I32(-2_000_000_000)),
            ("h", Value::I64(i64::MIN)),
            ("i", Value::F64(-123.456)),
            ("j", Value::Str("snações".into())),
            ("k", Value::Bytes(vec![0, 255, 10])),
            (
                "l",
                Value::Date {
                    year: 1999,
                    month: 12,
                    day: 31,
                },
            ),
            ("m", Value::Timestamp(-86_400)),
            ("n", Value::Json(json!({"k": [1, 2, null]}))),
        ]);
        let bytes = codec.encode(&record).unwrap();
        assert_eq!(bytes.len(), codec.size_of(&record));
        assert_eq!(codec.decode(&bytes).unwrap(), record);
    }

    #[test]
    fn test_length_prefix_covers_body() {
        let codec = RowCodec::new(vec![("x".into(), ColumnType::U16)]);
        let record = row(&[("x", Value::U16(7))]);
        let bytes = codec.encode(&record).unwrap();
        assert_eq!(bytes, [0, 0, 0, 2, 0, 7]);
    }

    #[test]
    fn test_decode_truncated_fails() {
        let codec = people_codec();
        let record = row(&[
            ("name", Value::Str("Eve".into())),
            ("age", Value::U32(1)),
            ("nickname", Value::Null),
        ]);
        let bytes = codec.encode(&record).unwrap();
        assert!(codec.decode(&bytes[..bytes.len() - 2]).is_err());
    }
}
