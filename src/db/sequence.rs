//! Durable serial-id generator backed by the `__dbSequences` catalog
//! table. Counters are named by fully qualified column (`db.table.column`)
//! and hand out monotonic ids starting at 1.

use std::sync::Mutex;

use crate::db::catalog::as_u64;
use crate::error::{Error, Result};
use crate::physical::pager::PagePool;
use crate::schema::{Row, Value};
use crate::table::{SerialSource, Table};

pub struct SequenceGenerator<P: PagePool> {
    table: Mutex<Table<P>>,
}

impl<P: PagePool + Send + Sync + 'static> SequenceGenerator<P> {
    pub fn new(table: Table<P>) -> Self {
        Self {
            table: Mutex::new(table),
        }
    }

    /// Read-modify-write the named counter under the generator lock. The
    /// first use lazily inserts the row with value 1.
    pub fn next(&self, name: &str) -> Result<u64> {
        let mut table = self.table.lock().unwrap();
        let key = Value::Str(name.to_owned());

        let rowids = table.lookup_rowids("name", &key)?;
        match rowids.first() {
            None => {
                let mut row = Row::new();
                row.insert("name".into(), key);
                row.insert("value".into(), Value::U64(1));
                table.insert(row)?;
                Ok(1)
            }
            Some(&rowid) => {
                let mut row = table
                    .get(rowid)?
                    .ok_or_else(|| Error::corrupt(format!("dangling sequence row {rowid}")))?;
                let next = as_u64(&row, "value")? + 1;
                row.insert("value".into(), Value::U64(next));
                table.set(rowid, row)?;
                Ok(next)
            }
        }
    }
}

impl<P: PagePool + Send + Sync + 'static> SerialSource for SequenceGenerator<P> {
    fn next(&self, name: &str) -> Result<u64> {
        SequenceGenerator::next(self, name)
    }
}
