//! Runtime table schemas: typed columns with uniqueness, index flavor,
//! validators, default sources, and computed values. A schema is plain data
//! built in client code and bound to storage by the table layer.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};

pub mod row;
pub mod value;

pub use row::{Row, RowCodec};
pub use value::Value;

pub type ComputeFn = Arc<dyn Fn(&Row) -> Value + Send + Sync>;
pub type CheckFn = Arc<dyn Fn(&Value) -> bool + Send + Sync>;
pub type DefaultFn = Arc<dyn Fn() -> Value + Send + Sync>;

/// Storage type of a column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    Bool,
    U8,
    U16,
    U32,
    U64,
    I16,
    I32,
    I64,
    F64,
    Str,
    Bytes,
    Date,
    Timestamp,
    Json,
    Nullable(Box<ColumnType>),
}

impl ColumnType {
    /// Catalog string form; nullable types carry a trailing `?`.
    pub fn type_name(&self) -> String {
        match self {
            ColumnType::Bool => "bool".into(),
            ColumnType::U8 => "u8".into(),
            ColumnType::U16 => "u16".into(),
            ColumnType::U32 => "u32".into(),
            ColumnType::U64 => "u64".into(),
            ColumnType::I16 => "i16".into(),
            ColumnType::I32 => "i32".into(),
            ColumnType::I64 => "i64".into(),
            ColumnType::F64 => "f64".into(),
            ColumnType::Str => "string".into(),
            ColumnType::Bytes => "bytes".into(),
            ColumnType::Date => "date".into(),
            ColumnType::Timestamp => "timestamp".into(),
            ColumnType::Json => "json".into(),
            ColumnType::Nullable(inner) => format!("{}?", inner.type_name()),
        }
    }

    pub fn parse(name: &str) -> Result<ColumnType> {
        if let Some(inner) = name.strip_suffix('?') {
            return Ok(ColumnType::Nullable(Box::new(ColumnType::parse(inner)?)));
        }
        match name {
            "bool" => Ok(ColumnType::Bool),
            "u8" => Ok(ColumnType::U8),
            "u16" => Ok(ColumnType::U16),
            "u32" => Ok(ColumnType::U32),
            "u64" => Ok(ColumnType::U64),
            "i16" => Ok(ColumnType::I16),
            "i32" => Ok(ColumnType::I32),
            "i64" => Ok(ColumnType::I64),
            "f64" => Ok(ColumnType::F64),
            "string" => Ok(ColumnType::Str),
            "bytes" => Ok(ColumnType::Bytes),
            "date" => Ok(ColumnType::Date),
            "timestamp" => Ok(ColumnType::Timestamp),
            "json" => Ok(ColumnType::Json),
            other => Err(Error::not_found(format!("column type {other}"))),
        }
    }

    /// Does `value` inhabit this type?
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (ColumnType::Nullable(_), Value::Null) => true,
            (ColumnType::Nullable(inner), v) => inner.accepts(v),
            (ColumnType::Bool, Value::Bool(_)) => true,
            (ColumnType::U8, Value::U8(_)) => true,
            (ColumnType::U16, Value::U16(_)) => true,
            (ColumnType::U32, Value::U32(_)) => true,
            (ColumnType::U64, Value::U64(_)) => true,
            (ColumnType::I16, Value::I16(_)) => true,
            (ColumnType::I32, Value::I32(_)) => true,
            (ColumnType::I64, Value::I64(_)) => true,
            (ColumnType::F64, Value::F64(_)) => true,
            (ColumnType::Str, Value::Str(_)) => true,
            (ColumnType::Bytes, Value::Bytes(_)) => true,
            (ColumnType::Date, Value::Date { month, day, .. }) => {
                (1..=12).contains(month) && (1..=31).contains(day)
            }
            (ColumnType::Timestamp, Value::Timestamp(_)) => true,
            (ColumnType::Json, Value::Json(_)) => true,
            _ => false,
        }
    }

    pub fn compare(&self, a: &Value, b: &Value) -> Ordering {
        a.compare(b)
    }

    pub fn is_equal(&self, a: &Value, b: &Value) -> bool {
        a == b
    }
}

/// Where a column's index lives, if anywhere. Memory indexes are rebuilt
/// from storage on table open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexFlavor {
    None,
    Disk,
    Memory,
}

impl IndexFlavor {
    pub fn is_indexed(self) -> bool {
        self != IndexFlavor::None
    }

    pub fn in_memory(self) -> bool {
        self == IndexFlavor::Memory
    }
}

/// Source of a value for a column omitted at insert.
#[derive(Clone)]
pub enum DefaultSource {
    Value(Value),
    Factory(DefaultFn),
    /// Next value of the table's durable serial counter.
    Serial,
}

#[derive(Clone)]
pub struct Column {
    pub name: String,
    pub ty: ColumnType,
    pub unique: bool,
    pub index: IndexFlavor,
    pub compute: Option<ComputeFn>,
    pub check: Option<CheckFn>,
    pub default: Option<DefaultSource>,
}

impl Column {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
            unique: false,
            index: IndexFlavor::None,
            compute: None,
            check: None,
            default: None,
        }
    }

    /// Unique columns are always indexed; the probe needs the index.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        if self.index == IndexFlavor::None {
            self.index = IndexFlavor::Disk;
        }
        self
    }

    pub fn indexed(mut self) -> Self {
        if self.index == IndexFlavor::None {
            self.index = IndexFlavor::Disk;
        }
        self
    }

    /// Keep this column's index in memory, rebuilt at open.
    pub fn in_memory(mut self) -> Self {
        self.index = IndexFlavor::Memory;
        self
    }

    /// Derive the value from the rest of the row; computed columns are
    /// never stored.
    pub fn computed(mut self, f: impl Fn(&Row) -> Value + Send + Sync + 'static) -> Self {
        self.compute = Some(Arc::new(f));
        self
    }

    pub fn check(mut self, f: impl Fn(&Value) -> bool + Send + Sync + 'static) -> Self {
        self.check = Some(Arc::new(f));
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(DefaultSource::Value(value.into()));
        self
    }

    pub fn default_fn(mut self, f: impl Fn() -> Value + Send + Sync + 'static) -> Self {
        self.default = Some(DefaultSource::Factory(Arc::new(f)));
        self
    }

    /// Fill from the durable per-column serial counter.
    pub fn serial(mut self) -> Self {
        self.default = Some(DefaultSource::Serial);
        self
    }

    pub fn is_computed(&self) -> bool {
        self.compute.is_some()
    }

    pub fn is_nullable(&self) -> bool {
        matches!(self.ty, ColumnType::Nullable(_))
    }

    /// Value of this column for `row`: computed columns derive it, stored
    /// columns read it (Null when absent).
    pub fn value_for(&self, row: &Row) -> Value {
        match &self.compute {
            Some(compute) => compute(row),
            None => row.get(&self.name).cloned().unwrap_or(Value::Null),
        }
    }

    /// Type- and check-validate one value.
    pub fn validate(&self, value: &Value) -> std::result::Result<(), String> {
        if !self.ty.accepts(value) {
            return Err(format!(
                "expected {}, got {}",
                self.ty.type_name(),
                value.type_name()
            ));
        }
        if let Some(check) = &self.check {
            if !check(value) {
                return Err("check failed".into());
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Column")
            .field("name", &self.name)
            .field("ty", &self.ty.type_name())
            .field("unique", &self.unique)
            .field("index", &self.index)
            .field("computed", &self.is_computed())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Schema {
    pub name: String,
    pub version: u32,
    pub columns: Vec<Column>,
}

impl Schema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: 1,
            columns: Vec::new(),
        }
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    pub fn column_named(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Stored columns in declared order; this order fixes the row layout.
    pub fn stored_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| !c.is_computed())
    }

    pub fn indexed_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| c.index.is_indexed())
    }

    pub fn row_codec(&self) -> RowCodec {
        RowCodec::new(
            self.stored_columns()
                .map(|c| (c.name.clone(), c.ty.clone()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_name_round_trip() {
        for ty in [
            ColumnType::Bool,
            ColumnType::U32,
            ColumnType::Str,
            ColumnType::Bytes,
            ColumnType::Date,
            ColumnType::Json,
            ColumnType::Nullable(Box::new(ColumnType::I64)),
        ] {
            assert_eq!(ColumnType::parse(&ty.type_name()).unwrap(), ty);
        }
        assert!(ColumnType::parse("varchar").is_err());
    }

    #[test]
    fn test_accepts() {
        assert!(ColumnType::U32.accepts(&Value::U32(1)));
        assert!(!ColumnType::U32.accepts(&Value::U64(1)));
        assert!(!ColumnType::U32.accepts(&Value::Null));
        let nullable = ColumnType::Nullable(Box::new(ColumnType::Str));
        assert!(nullable.accepts(&Value::Null));
        assert!(nullable.accepts(&Value::Str("x".into())));
        assert!(!nullable.accepts(&Value::U8(1)));
        assert!(!ColumnType::Date.accepts(&Value::Date {
            year: 2024,
            month: 13,
            day: 1
        }));
    }

    #[test]
    fn test_unique_implies_index() {
        let col = Column::new("ssn", ColumnType::Str).unique();
        assert_eq!(col.index, IndexFlavor::Disk);
        let col = Column::new("ssn", ColumnType::Str).in_memory().unique();
        assert_eq!(col.index, IndexFlavor::Memory);
    }

    #[test]
    fn test_column_check() {
        let col = Column::new("age", ColumnType::U32).check(|v| matches!(v, Value::U32(n) if *n > 0));
        assert!(col.validate(&Value::U32(30)).is_ok());
        assert!(col.validate(&Value::U32(0)).is_err());
        assert!(col.validate(&Value::Str("x".into())).is_err());
    }

    #[test]
    fn test_computed_column_value() {
        let col = Column::new("lower_name", ColumnType::Str).computed(|row| {
            match row.get("name") {
                Some(Value::Str(s)) => Value::Str(s.to_lowercase()),
                _ => Value::Null,
            }
        });
        let mut row = Row::new();
        row.insert("name".into(), Value::Str("Alice".into()));
        assert_eq!(col.value_for(&row), Value::Str("alice".into()));
    }

    #[test]
    fn test_stored_column_order() {
        let schema = Schema::new("people")
            .column(Column::new("name", ColumnType::Str))
            .column(Column::new("shout", ColumnType::Str).computed(|_| Value::Null))
            .column(Column::new("age", ColumnType::U32));
        let stored: Vec<_> = schema.stored_columns().map(|c| c.name.as_str()).collect();
        assert_eq!(stored, vec!["name", "age"]);
    }
}
