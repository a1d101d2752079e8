//! Tables: a schema bound to row storage plus one index per indexed or
//! unique column. The table enforces validation and uniqueness, fills
//! defaults, and keeps every index in step with every row mutation.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::btree::DEFAULT_ORDER;
use crate::error::{Error, Result};
use crate::index::{DiskIndex, Index, MemoryIndex};
use crate::physical::pager::PagePool;
use crate::physical::{PageId, RowId};
use crate::schema::{Column, DefaultSource, IndexFlavor, Row, Schema, Value};

pub mod storage;

pub use storage::TableStorage;

/// Durable source of serial column values; implemented by the database's
/// sequence generator.
pub trait SerialSource: Send + Sync {
    fn next(&self, name: &str) -> Result<u64>;
}

impl<P: PagePool> std::fmt::Debug for Table<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("db_name", &self.db_name)
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

pub struct Table<P: PagePool> {
    db_name: String,
    schema: Schema,
    pool: Arc<P>,
    storage: TableStorage<P>,
    indexes: HashMap<String, Box<dyn Index>>,
    disk_headers: HashMap<String, PageId>,
    serial: Option<Arc<dyn SerialSource>>,
}

impl<P: PagePool + Send + Sync + 'static> Table<P> {
    /// Create a fresh table: new storage anchor, new disk indexes.
    pub fn create(
        pool: Arc<P>,
        db_name: &str,
        schema: Schema,
        serial: Option<Arc<dyn SerialSource>>,
    ) -> Result<Self> {
        let storage = TableStorage::create(Arc::clone(&pool), schema.row_codec())?;
        let mut indexes: HashMap<String, Box<dyn Index>> = HashMap::new();
        let mut disk_headers = HashMap::new();
        for column in schema.indexed_columns() {
            let index: Box<dyn Index> = match column.index {
                IndexFlavor::Disk => {
                    let index =
                        DiskIndex::create(Arc::clone(&pool), column.ty.clone(), DEFAULT_ORDER)?;
                    disk_headers.insert(column.name.clone(), index.header());
                    Box::new(index)
                }
                IndexFlavor::Memory => {
                    Box::new(MemoryIndex::new(column.ty.clone(), DEFAULT_ORDER)?)
                }
                IndexFlavor::None => unreachable!(),
            };
            indexes.insert(column.name.clone(), index);
        }
        debug!(table = %schema.name, anchor = storage.anchor().0, "created table");
        Ok(Self {
            db_name: db_name.to_owned(),
            schema,
            pool,
            storage,
            indexes,
            disk_headers,
            serial,
        })
    }

    /// Mount an existing table from its storage anchor and the header
    /// pages of its disk indexes. Memory indexes are rebuilt by scanning.
    pub fn open(
        pool: Arc<P>,
        db_name: &str,
        schema: Schema,
        anchor: PageId,
        index_headers: &HashMap<String, PageId>,
        serial: Option<Arc<dyn SerialSource>>,
    ) -> Result<Self> {
        let storage = TableStorage::open(Arc::clone(&pool), anchor, schema.row_codec());
        let mut indexes: HashMap<String, Box<dyn Index>> = HashMap::new();
        let mut disk_headers = HashMap::new();
        for column in schema.indexed_columns() {
            let index: Box<dyn Index> = match column.index {
                IndexFlavor::Disk => {
                    let header = index_headers.get(&column.name).copied().ok_or_else(|| {
                        Error::not_found(format!("index {} of {}", column.name, schema.name))
                    })?;
                    disk_headers.insert(column.name.clone(), header);
                    Box::new(DiskIndex::open(
                        Arc::clone(&pool),
                        header,
                        column.ty.clone(),
                        DEFAULT_ORDER,
                    )?)
                }
                IndexFlavor::Memory => {
                    Box::new(MemoryIndex::new(column.ty.clone(), DEFAULT_ORDER)?)
                }
                IndexFlavor::None => unreachable!(),
            };
            indexes.insert(column.name.clone(), index);
        }

        let mut table = Self {
            db_name: db_name.to_owned(),
            schema,
            pool,
            storage,
            indexes,
            disk_headers,
            serial,
        };
        table.rebuild_memory_indexes()?;
        Ok(table)
    }

    fn rebuild_memory_indexes(&mut self) -> Result<()> {
        let memory_columns: Vec<Column> = self
            .schema
            .indexed_columns()
            .filter(|c| c.index.in_memory())
            .cloned()
            .collect();
        if memory_columns.is_empty() {
            return Ok(());
        }

        for (rowid, row) in self.storage.iterate()? {
            for column in &memory_columns {
                let key = column.value_for(&row);
                self.indexes
                    .get_mut(&column.name)
                    .unwrap()
                    .insert(key, rowid)?;
            }
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.schema.name
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn anchor(&self) -> PageId {
        self.storage.anchor()
    }

    /// Header pages of the table's disk indexes, keyed by column name.
    pub fn disk_index_headers(&self) -> &HashMap<String, PageId> {
        &self.disk_headers
    }

    fn serial_name(&self, column: &str) -> String {
        format!("{}.{}.{}", self.db_name, self.schema.name, column)
    }

    fn index_of(&self, column: &str) -> Result<&dyn Index> {
        self.indexes
            .get(column)
            .map(|b| b.as_ref())
            .ok_or_else(|| Error::not_found(format!("index {column}")))
    }

    /// Validate present values, fill defaults for absent stored columns,
    /// and re-validate what was filled.
    fn complete_record(&self, mut record: Row, apply_defaults: bool) -> Result<Row> {
        for column in self.schema.stored_columns() {
            if let Some(value) = record.get(&column.name) {
                column.validate(value).map_err(|reason| Error::InvalidRecord {
                    column: column.name.clone(),
                    reason,
                })?;
            }
        }

        let absent: Vec<Column> = self
            .schema
            .stored_columns()
            .filter(|c| !record.contains_key(&c.name))
            .cloned()
            .collect();
        for column in absent {
            let value = match (&column.default, apply_defaults) {
                (Some(DefaultSource::Value(value)), true) => Some(value.clone()),
                (Some(DefaultSource::Factory(factory)), true) => Some(factory()),
                (Some(DefaultSource::Serial), true) => {
                    let serial = self.serial.as_ref().ok_or_else(|| {
                        Error::corrupt("serial column without a sequence generator")
                    })?;
                    Some(Value::U64(serial.next(&self.serial_name(&column.name))?))
                }
                _ if column.is_nullable() => Some(Value::Null),
                _ => None,
            };
            match value {
                Some(value) => {
                    column
                        .validate(&value)
                        .map_err(|reason| Error::InvalidRecord {
                            column: column.name.clone(),
                            reason,
                        })?;
                    record.insert(column.name.clone(), value);
                }
                None => {
                    return Err(Error::InvalidRecord {
                        column: column.name.clone(),
                        reason: "missing value".into(),
                    })
                }
            }
        }
        Ok(record)
    }

    fn check_unique(&self, record: &Row, old: Option<&Row>) -> Result<()> {
        for column in self.schema.columns.iter().filter(|c| c.unique) {
            let key = column.value_for(record);
            if let Some(old) = old {
                if column.ty.is_equal(&key, &column.value_for(old)) {
                    continue;
                }
            }
            if self.index_of(&column.name)?.has(&key)? {
                return Err(Error::Duplicate {
                    column: column.name.clone(),
                });
            }
        }
        Ok(())
    }

    fn insert_inner(&mut self, record: Row) -> Result<RowId> {
        let record = self.complete_record(record, true)?;
        self.check_unique(&record, None)?;

        let rowid = self.storage.insert(&record)?;

        let entries: Vec<(String, Value)> = self
            .schema
            .indexed_columns()
            .map(|c| (c.name.clone(), c.value_for(&record)))
            .collect();
        for (column, key) in entries {
            self.indexes.get_mut(&column).unwrap().insert(key, rowid)?;
        }
        Ok(rowid)
    }

    pub fn insert(&mut self, record: Row) -> Result<RowId> {
        let rowid = self.insert_inner(record)?;
        self.storage.commit()?;
        Ok(rowid)
    }

    pub fn insert_many(&mut self, records: impl IntoIterator<Item = Row>) -> Result<Vec<RowId>> {
        let mut rowids = Vec::new();
        for record in records {
            rowids.push(self.insert_inner(record)?);
        }
        self.storage.commit()?;
        Ok(rowids)
    }

    pub fn insert_and_return(&mut self, record: Row) -> Result<Row> {
        let rowid = self.insert(record)?;
        self.get(rowid)?
            .ok_or_else(|| Error::not_found(format!("row {rowid}")))
    }

    pub fn get(&self, rowid: RowId) -> Result<Option<Row>> {
        self.storage.get(rowid)
    }

    /// Replace the row at `rowid`. Indexes are retargeted for every column
    /// whose value changed; the rowid stays valid.
    pub fn set(&mut self, rowid: RowId, record: Row) -> Result<RowId> {
        let old = self
            .storage
            .get(rowid)?
            .ok_or_else(|| Error::not_found(format!("row {rowid}")))?;

        let record = self.complete_record(record, false)?;
        self.check_unique(&record, Some(&old))?;

        self.storage.set(rowid, &record)?;

        let changes: Vec<(String, Value, Value)> = self
            .schema
            .indexed_columns()
            .map(|c| (c.name.clone(), c.value_for(&old), c.value_for(&record)))
            .collect();
        for (column, old_key, new_key) in changes {
            if old_key == new_key {
                continue;
            }
            let index = self.indexes.get_mut(&column).unwrap();
            index.remove(&old_key, rowid)?;
            index.insert(new_key, rowid)?;
        }

        self.storage.commit()?;
        Ok(rowid)
    }

    fn remove_inner(&mut self, rowid: RowId) -> Result<()> {
        let Some(old) = self.storage.get(rowid)? else {
            return Ok(());
        };
        let entries: Vec<(String, Value)> = self
            .schema
            .indexed_columns()
            .map(|c| (c.name.clone(), c.value_for(&old)))
            .collect();
        for (column, key) in entries {
            self.indexes.get_mut(&column).unwrap().remove(&key, rowid)?;
        }
        self.storage.remove(rowid)
    }

    pub fn remove(&mut self, rowid: RowId) -> Result<()> {
        self.remove_inner(rowid)?;
        self.storage.commit()
    }

    /// Remove every row the named index yields for `value`.
    pub fn remove_where(&mut self, index_name: &str, value: &Value) -> Result<usize> {
        let rowids = self.index_of(index_name)?.get(value)?;
        let count = rowids.len();
        for rowid in rowids {
            self.remove_inner(rowid)?;
        }
        self.storage.commit()?;
        Ok(count)
    }

    /// Rows whose indexed column equals `value`.
    pub fn lookup(&self, index_name: &str, value: &Value) -> Result<Vec<Row>> {
        let rowids = self.index_of(index_name)?.get(value)?;
        let mut rows = Vec::with_capacity(rowids.len());
        for rowid in rowids {
            if let Some(row) = self.storage.get(rowid)? {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    /// Rowids the named index yields for `value`.
    pub fn lookup_rowids(&self, index_name: &str, value: &Value) -> Result<Vec<RowId>> {
        self.index_of(index_name)?.get(value)
    }

    pub fn lookup_unique(&self, index_name: &str, value: &Value) -> Result<Option<Row>> {
        Ok(self.lookup(index_name, value)?.into_iter().next())
    }

    /// Lookup keyed by a computed column's output.
    pub fn lookup_computed(&self, index_name: &str, value: &Value) -> Result<Vec<Row>> {
        self.lookup(index_name, value)
    }

    /// Full-table scan filtered by column equality; works on any column,
    /// indexed or not.
    pub fn scan(&self, column: &str, value: &Value) -> Result<Vec<Row>> {
        let column = self
            .schema
            .column_named(column)
            .ok_or_else(|| Error::not_found(format!("column {column}")))?
            .clone();
        Ok(self
            .storage
            .iterate()?
            .into_iter()
            .map(|(_, row)| row)
            .filter(|row| column.ty.is_equal(&column.value_for(row), value))
            .collect())
    }

    pub fn iterate(&self) -> Result<Vec<Row>> {
        Ok(self.storage.iterate()?.into_iter().map(|(_, r)| r).collect())
    }

    pub fn iterate_with_rowids(&self) -> Result<Vec<(RowId, Row)>> {
        self.storage.iterate()
    }

    /// Free every page the table owns: data, overflow, directory, and
    /// index pages.
    pub fn destroy(mut self) -> Result<()> {
        for index in self.indexes.values_mut() {
            index.destroy()?;
        }
        let name = self.schema.name.clone();
        self.storage.destroy()?;
        self.pool.commit()?;
        debug!(table = %name, "dropped table");
        Ok(())
    }
}
