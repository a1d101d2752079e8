//! The database file: a fixed header, a buffer pool, and a set of system
//! tables describing every user table, schema, and index.
//!
//! Bootstrap chains from the file header: it points at the `__dbPageIds`
//! storage anchor, and every other system table's anchor is found by
//! looking its `pageType` up there. System tables use memory-flavored
//! indexes rebuilt at open, which keeps the catalog free of circular
//! dependencies on `__dbIndexes`.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};
use zerocopy::AsBytes;

use crate::error::{Error, Result};
use crate::physical::header::{FileHeader, DEFAULT_PAGE_SIZE, HEADER_SIZE};
use crate::physical::pager::{FilePager, MemPager, PagePool};
use crate::physical::PageId;
use crate::schema::{ColumnType, Row, RowCodec, Schema, Value};
use crate::table::{SerialSource, Table, TableStorage};

pub mod catalog;
pub mod migrate;
pub mod sequence;

pub use migrate::{Migration, MigrationRecord};

use catalog::{
    as_str, as_u32, as_u64, columns_schema, indexes_schema, migrations_schema, page_ids_schema,
    schema_from_persisted, schemas_schema, sequences_schema, table_key, tables_schema,
    verify_schema, PersistedColumn, COLUMNS_PAGE, INDEXES_PAGE, MIGRATIONS_PAGE, SCHEMAS_PAGE,
    SEQUENCES_PAGE, SYSTEM_DB, TABLES_PAGE,
};
use migrate::now_timestamp;
use sequence::SequenceGenerator;

pub const DEFAULT_DB: &str = "default";

#[derive(Debug, Clone, Copy, Default)]
pub struct OpenOptions {
    pub create: bool,
    pub truncate: bool,
}

impl OpenOptions {
    pub fn create() -> Self {
        Self {
            create: true,
            truncate: false,
        }
    }

    pub fn truncate() -> Self {
        Self {
            create: true,
            truncate: true,
        }
    }
}

/// One exported row, JSON-shaped.
#[derive(Debug, Clone, Serialize)]
pub struct ExportEntry {
    pub db: String,
    pub table: String,
    pub record: serde_json::Value,
}

pub struct Db<P: PagePool + Send + Sync + 'static = FilePager> {
    pool: Arc<P>,
    sequences: Arc<SequenceGenerator<P>>,
    page_ids: Table<P>,
    tables: Table<P>,
    schemas: Table<P>,
    columns: Table<P>,
    indexes: Table<P>,
    migrations: Table<P>,
}

impl Db<FilePager> {
    /// Open or create a single-file database.
    pub fn open(path: impl AsRef<Path>, options: OpenOptions) -> Result<Self> {
        let path = path.as_ref();
        let file = File::options()
            .read(true)
            .write(true)
            .create(options.create || options.truncate)
            .truncate(options.truncate)
            .open(path)?;
        let len = file.metadata()?.len();

        if len == 0 {
            if !options.create && !options.truncate {
                return Err(Error::not_found(format!(
                    "database file {}",
                    path.display()
                )));
            }
            // Header first with a null root, then bootstrap, then rewrite
            // the header with the catalog anchor.
            FileHeader::new(DEFAULT_PAGE_SIZE, PageId::NULL).write(&file)?;
            let pool = Arc::new(FilePager::create(
                file,
                DEFAULT_PAGE_SIZE as usize,
                HEADER_SIZE as u64,
            )?);
            let db = Self::bootstrap(pool)?;
            let header = FileHeader::new(DEFAULT_PAGE_SIZE, db.page_ids.anchor());
            db.pool.write_file_header(header.as_bytes())?;
            db.pool.commit()?;
            info!(path = %path.display(), "created database");
            Ok(db)
        } else {
            let header = FileHeader::read(&file)?;
            let pool = Arc::new(FilePager::open(
                file,
                header.page_size() as usize,
                HEADER_SIZE as u64,
            )?);
            Self::mount(pool, header.header_page_id())
        }
    }
}

impl Db<MemPager> {
    /// Throwaway database over the in-memory pool.
    pub fn in_memory() -> Result<Self> {
        Self::bootstrap(Arc::new(MemPager::new(DEFAULT_PAGE_SIZE as usize)))
    }
}

impl<P: PagePool + Send + Sync + 'static> Db<P> {
    /// First open of a fresh pool: create every system table, publish
    /// their anchors in `__dbPageIds`, and insert the bootstrap rows that
    /// describe the system tables themselves.
    pub fn bootstrap(pool: Arc<P>) -> Result<Self> {
        let mut page_ids = Table::create(Arc::clone(&pool), SYSTEM_DB, page_ids_schema(), None)?;

        let seq_table = Table::create(Arc::clone(&pool), SYSTEM_DB, sequences_schema(), None)?;
        let seq_anchor = seq_table.anchor();
        Self::register_page(&mut page_ids, SEQUENCES_PAGE, seq_anchor)?;
        let sequences = Arc::new(SequenceGenerator::new(seq_table));
        let serial: Arc<dyn SerialSource> = sequences.clone();

        let mut create_system = |schema: Schema, page_type: &str| -> Result<Table<P>> {
            let table = Table::create(
                Arc::clone(&pool),
                SYSTEM_DB,
                schema,
                Some(Arc::clone(&serial)),
            )?;
            Self::register_page(&mut page_ids, page_type, table.anchor())?;
            Ok(table)
        };

        let tables = create_system(tables_schema(), TABLES_PAGE)?;
        let schemas = create_system(schemas_schema(), SCHEMAS_PAGE)?;
        let columns = create_system(columns_schema(), COLUMNS_PAGE)?;
        let indexes = create_system(indexes_schema(), INDEXES_PAGE)?;
        let migrations = create_system(migrations_schema(), MIGRATIONS_PAGE)?;

        let mut db = Self {
            pool,
            sequences,
            page_ids,
            tables,
            schemas,
            columns,
            indexes,
            migrations,
        };

        let system_tables = [
            (page_ids_schema(), db.page_ids.anchor()),
            (sequences_schema(), seq_anchor),
            (tables_schema(), db.tables.anchor()),
            (schemas_schema(), db.schemas.anchor()),
            (columns_schema(), db.columns.anchor()),
            (indexes_schema(), db.indexes.anchor()),
            (migrations_schema(), db.migrations.anchor()),
        ];
        for (schema, anchor) in system_tables {
            db.register_table(SYSTEM_DB, &schema, anchor)?;
        }
        db.pool.commit()?;
        debug!("bootstrapped system catalog");
        Ok(db)
    }

    /// Mount an existing database from the `__dbPageIds` anchor recorded
    /// in the file header.
    pub fn mount(pool: Arc<P>, page_ids_anchor: PageId) -> Result<Self> {
        if page_ids_anchor.is_null() {
            return Err(Error::corrupt("database was never bootstrapped"));
        }
        let no_headers = HashMap::new();
        let page_ids = Table::open(
            Arc::clone(&pool),
            SYSTEM_DB,
            page_ids_schema(),
            page_ids_anchor,
            &no_headers,
            None,
        )?;

        let seq_table = Table::open(
            Arc::clone(&pool),
            SYSTEM_DB,
            sequences_schema(),
            Self::system_anchor(&page_ids, SEQUENCES_PAGE)?,
            &no_headers,
            None,
        )?;
        let sequences = Arc::new(SequenceGenerator::new(seq_table));
        let serial: Arc<dyn SerialSource> = sequences.clone();

        let open_system = |schema: Schema, page_type: &str| -> Result<Table<P>> {
            Table::open(
                Arc::clone(&pool),
                SYSTEM_DB,
                schema,
                Self::system_anchor(&page_ids, page_type)?,
                &no_headers,
                Some(Arc::clone(&serial)),
            )
        };

        let tables = open_system(tables_schema(), TABLES_PAGE)?;
        let schemas = open_system(schemas_schema(), SCHEMAS_PAGE)?;
        let columns = open_system(columns_schema(), COLUMNS_PAGE)?;
        let indexes = open_system(indexes_schema(), INDEXES_PAGE)?;
        let migrations = open_system(migrations_schema(), MIGRATIONS_PAGE)?;

        Ok(Self {
            pool,
            sequences,
            page_ids,
            tables,
            schemas,
            columns,
            indexes,
            migrations,
        })
    }

    fn register_page(page_ids: &mut Table<P>, page_type: &str, anchor: PageId) -> Result<()> {
        let mut row = Row::new();
        row.insert("pageType".into(), Value::Str(page_type.to_owned()));
        row.insert("pageId".into(), Value::U64(anchor.0));
        page_ids.insert(row)?;
        Ok(())
    }

    fn system_anchor(page_ids: &Table<P>, page_type: &str) -> Result<PageId> {
        let row = page_ids
            .lookup_unique("pageType", &Value::Str(page_type.to_owned()))?
            .ok_or_else(|| Error::corrupt(format!("missing system page {page_type}")))?;
        Ok(PageId(as_u64(&row, "pageId")?))
    }

    /// Record a table, its schema version, and its columns in the catalog.
    fn register_table(&mut self, db_name: &str, schema: &Schema, anchor: PageId) -> Result<u64> {
        let mut table_row = Row::new();
        table_row.insert("db".into(), Value::Str(db_name.to_owned()));
        table_row.insert("name".into(), Value::Str(schema.name.clone()));
        table_row.insert("heapPageId".into(), Value::U64(anchor.0));
        let table_row = self.tables.insert_and_return(table_row)?;
        let table_id = as_u64(&table_row, "id")?;

        let mut schema_row = Row::new();
        schema_row.insert("tableId".into(), Value::U64(table_id));
        schema_row.insert("version".into(), Value::U32(schema.version));
        let schema_row = self.schemas.insert_and_return(schema_row)?;
        let schema_id = as_u64(&schema_row, "id")?;

        for (order, column) in schema.columns.iter().enumerate() {
            self.columns
                .insert(PersistedColumn::from_column(column, order as u32).to_row(schema_id))?;
        }
        Ok(table_id)
    }

    fn persisted_columns(&self, table_id: u64) -> Result<Vec<PersistedColumn>> {
        let schema_rows = self.schemas.lookup("tableId", &Value::U64(table_id))?;
        let latest = schema_rows
            .into_iter()
            .max_by_key(|row| as_u32(row, "version").unwrap_or(0))
            .ok_or_else(|| Error::not_found(format!("schema of table {table_id}")))?;
        let schema_id = as_u64(&latest, "id")?;

        let mut persisted: Vec<PersistedColumn> = self
            .columns
            .lookup("schemaId", &Value::U64(schema_id))?
            .iter()
            .map(PersistedColumn::from_row)
            .collect::<Result<_>>()?;
        persisted.sort_by_key(|p| p.order);
        Ok(persisted)
    }

    fn index_headers(&self, table_id: u64) -> Result<HashMap<String, PageId>> {
        let mut headers = HashMap::new();
        for row in self.indexes.lookup("tableId", &Value::U64(table_id))? {
            headers.insert(
                as_str(&row, "indexName")?.to_owned(),
                PageId(as_u64(&row, "heapPageId")?),
            );
        }
        Ok(headers)
    }

    pub fn get_or_create_table(&mut self, schema: Schema) -> Result<Table<P>> {
        self.get_or_create_table_in(DEFAULT_DB, schema)
    }

    /// Resolve `(db, name)` in the catalog: mount the table when it
    /// exists (verifying the supplied schema against the stored one), or
    /// create and register it when it does not.
    pub fn get_or_create_table_in(&mut self, db_name: &str, schema: Schema) -> Result<Table<P>> {
        let serial: Arc<dyn SerialSource> = self.sequences.clone();

        match self
            .tables
            .lookup_unique("dbName", &table_key(db_name, &schema.name))?
        {
            Some(table_row) => {
                let table_id = as_u64(&table_row, "id")?;
                let anchor = PageId(as_u64(&table_row, "heapPageId")?);
                verify_schema(&schema, &self.persisted_columns(table_id)?)?;
                let headers = self.index_headers(table_id)?;
                Table::open(
                    Arc::clone(&self.pool),
                    db_name,
                    schema,
                    anchor,
                    &headers,
                    Some(serial),
                )
            }
            None => {
                let table =
                    Table::create(Arc::clone(&self.pool), db_name, schema.clone(), Some(serial))?;
                let table_id = self.register_table(db_name, &schema, table.anchor())?;
                for (column, header) in table.disk_index_headers() {
                    let mut row = Row::new();
                    row.insert("indexName".into(), Value::Str(column.clone()));
                    row.insert("tableId".into(), Value::U64(table_id));
                    row.insert("heapPageId".into(), Value::U64(header.0));
                    self.indexes.insert(row)?;
                }
                self.pool.commit()?;
                Ok(table)
            }
        }
    }

    /// Latest persisted schema of a table, columns in declared order.
    pub fn get_schemas(&self, db_name: &str, table: &str) -> Result<Vec<PersistedColumn>> {
        let table_row = self
            .tables
            .lookup_unique("dbName", &table_key(db_name, table))?
            .ok_or_else(|| Error::not_found(format!("table {db_name}.{table}")))?;
        self.persisted_columns(as_u64(&table_row, "id")?)
    }

    pub fn rename_table(&mut self, old: &str, new: &str, db_name: &str) -> Result<()> {
        let rowids = self
            .tables
            .lookup_rowids("dbName", &table_key(db_name, old))?;
        let &rowid = rowids
            .first()
            .ok_or_else(|| Error::not_found(format!("table {db_name}.{old}")))?;
        let mut row = self
            .tables
            .get(rowid)?
            .ok_or_else(|| Error::corrupt("dangling table row"))?;
        row.insert("name".into(), Value::Str(new.to_owned()));
        self.tables.set(rowid, row)?;
        Ok(())
    }

    /// Drop a table: free its data, index, and directory pages, then
    /// scrub its catalog records.
    pub fn drop_table(&mut self, db_name: &str, name: &str) -> Result<()> {
        let table_row = self
            .tables
            .lookup_unique("dbName", &table_key(db_name, name))?
            .ok_or_else(|| Error::not_found(format!("table {db_name}.{name}")))?;
        let table_id = as_u64(&table_row, "id")?;
        let anchor = PageId(as_u64(&table_row, "heapPageId")?);

        let persisted = self.persisted_columns(table_id)?;
        let schema = schema_from_persisted(name, &persisted)?;
        let headers = self.index_headers(table_id)?;
        let table = Table::open(
            Arc::clone(&self.pool),
            db_name,
            schema,
            anchor,
            &headers,
            None,
        )?;
        table.destroy()?;

        for schema_row in self.schemas.lookup("tableId", &Value::U64(table_id))? {
            let schema_id = as_u64(&schema_row, "id")?;
            self.columns
                .remove_where("schemaId", &Value::U64(schema_id))?;
        }
        self.schemas.remove_where("tableId", &Value::U64(table_id))?;
        self.indexes.remove_where("tableId", &Value::U64(table_id))?;
        self.tables
            .remove_where("dbName", &table_key(db_name, name))?;
        self.pool.commit()
    }

    /// Run a named migration once; a completed record short-circuits.
    pub fn migrate(&mut self, migration: Migration<P>) -> Result<MigrationRecord> {
        let name_key = Value::Str(migration.name.clone());
        if let Some(row) = self.migrations.lookup_unique("name", &name_key)? {
            let completed_at = match row.get("completedAt") {
                Some(Value::Timestamp(t)) => *t,
                _ => 0,
            };
            return Ok(MigrationRecord {
                name: migration.name,
                db: as_str(&row, "db")?.to_owned(),
                completed_at,
            });
        }

        info!(migration = %migration.name, "running migration");
        (migration.run)(self)?;

        let completed_at = now_timestamp();
        let mut row = Row::new();
        row.insert("name".into(), Value::Str(migration.name.clone()));
        row.insert("db".into(), Value::Str(migration.db.clone()));
        row.insert("completedAt".into(), Value::Timestamp(completed_at));
        self.migrations.insert(row)?;

        Ok(MigrationRecord {
            name: migration.name,
            db: migration.db,
            completed_at,
        })
    }

    /// Decode every matching row to JSON. Without a `db` filter, system
    /// tables are skipped.
    pub fn export(
        &self,
        db_filter: Option<&str>,
        table_filter: Option<&str>,
    ) -> Result<Vec<ExportEntry>> {
        let mut entries = Vec::new();
        for table_row in self.tables.iterate()? {
            let tdb = as_str(&table_row, "db")?.to_owned();
            let tname = as_str(&table_row, "name")?.to_owned();

            let db_excluded = match db_filter {
                Some(filter) => tdb != filter,
                None => tdb == SYSTEM_DB,
            };
            if db_excluded || table_filter.is_some_and(|t| tname != t) {
                continue;
            }

            let persisted = self.persisted_columns(as_u64(&table_row, "id")?)?;
            let stored: Vec<(String, ColumnType)> = persisted
                .iter()
                .filter(|p| !p.computed)
                .map(|p| Ok((p.name.clone(), ColumnType::parse(&p.type_name)?)))
                .collect::<Result<_>>()?;
            let storage = TableStorage::open(
                Arc::clone(&self.pool),
                PageId(as_u64(&table_row, "heapPageId")?),
                RowCodec::new(stored),
            );

            for (_, row) in storage.iterate()? {
                let record = serde_json::Value::Object(
                    row.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
                );
                entries.push(ExportEntry {
                    db: tdb.clone(),
                    table: tname.clone(),
                    record,
                });
            }
        }
        Ok(entries)
    }

    /// Next value of a named durable counter.
    pub fn next_serial(&self, name: &str) -> Result<u64> {
        self.sequences.next(name)
    }

    pub fn commit(&self) -> Result<()> {
        self.pool.commit()
    }

    pub fn is_dirty(&self) -> bool {
        self.pool.is_dirty()
    }

    pub fn pool(&self) -> &Arc<P> {
        &self.pool
    }

    /// Flush and release the handle.
    pub fn close(self) -> Result<()> {
        self.pool.commit()
    }
}

#[cfg(test)]
mod tests {
    use crate::schema::row::row;
    use crate::schema::Column;

    use super::*;

    fn users_schema() -> Schema {
        Schema::new("users")
            .column(Column::new("id", ColumnType::U64).serial().unique())
            .column(Column::new("name", ColumnType::Str))
            .column(Column::new("email", ColumnType::Str).unique())
    }

    fn orders_schema() -> Schema {
        Schema::new("orders")
            .column(Column::new("id", ColumnType::U64).serial().unique())
            .column(Column::new("item", ColumnType::Str))
            .column(Column::new("qty", ColumnType::U32))
    }

    fn user(name: &str, email: &str) -> Row {
        row(&[
            ("name", Value::Str(name.into())),
            ("email", Value::Str(email.into())),
        ])
    }

    #[test]
    fn test_in_memory_round_trip() {
        let mut db = Db::in_memory().unwrap();
        let mut users = db.get_or_create_table(users_schema()).unwrap();

        let r1 = users.insert(user("alice", "alice@example.com")).unwrap();
        let read = users.get(r1).unwrap().unwrap();
        assert_eq!(read.get("name"), Some(&Value::Str("alice".into())));
        // The serial default filled the id.
        assert_eq!(read.get("id"), Some(&Value::U64(1)));

        let second = users
            .insert_and_return(user("bob", "bob@example.com"))
            .unwrap();
        assert_eq!(second.get("id"), Some(&Value::U64(2)));
    }

    #[test]
    fn test_persistence_round_trip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("round_trip.db");

        let users_before;
        let orders_before;
        {
            let mut db = Db::open(&path, OpenOptions::create())?;
            let mut users = db.get_or_create_table(users_schema())?;
            users.insert(user("alice", "alice@example.com"))?;
            users.insert(user("bob", "bob@example.com"))?;

            let mut orders = db.get_or_create_table(orders_schema())?;
            orders.insert(row(&[
                ("item", Value::Str("anvil".into())),
                ("qty", Value::U32(2)),
            ]))?;

            users_before = users.iterate()?;
            orders_before = orders.iterate()?;
            db.close()?;
        }

        let mut db = Db::open(&path, OpenOptions::default())?;
        let users = db.get_or_create_table(users_schema())?;
        let orders = db.get_or_create_table(orders_schema())?;

        assert_eq!(users.iterate()?, users_before);
        assert_eq!(orders.iterate()?, orders_before);

        // Unique index still works from disk.
        let found = users
            .lookup_unique("email", &Value::Str("bob@example.com".into()))?
            .unwrap();
        assert_eq!(found.get("name"), Some(&Value::Str("bob".into())));
        Ok(())
    }

    #[test]
    fn test_open_missing_without_create_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.db");
        assert!(Db::open(&path, OpenOptions::default()).is_err());
    }

    #[test]
    fn test_serials_survive_reopen() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("serials.db");

        {
            let mut db = Db::open(&path, OpenOptions::create())?;
            let mut users = db.get_or_create_table(users_schema())?;
            users.insert(user("a", "a@x"))?;
            users.insert(user("b", "b@x"))?;
            db.close()?;
        }

        let mut db = Db::open(&path, OpenOptions::default())?;
        let mut users = db.get_or_create_table(users_schema())?;
        let third = users.insert_and_return(user("c", "c@x"))?;
        assert_eq!(third.get("id"), Some(&Value::U64(3)));
        Ok(())
    }

    #[test]
    fn test_schema_mismatch_detected() {
        let mut db = Db::in_memory().unwrap();
        db.get_or_create_table(users_schema()).unwrap();

        let changed = Schema::new("users")
            .column(Column::new("id", ColumnType::U64).serial().unique())
            .column(Column::new("name", ColumnType::Str))
            .column(Column::new("email", ColumnType::Str)); // no longer unique
        match db.get_or_create_table(changed).unwrap_err() {
            Error::SchemaMismatch { column, field } => {
                assert_eq!(column, "email");
                assert_eq!(field, "unique");
            }
            other => panic!("expected schema mismatch, got {other}"),
        }
    }

    #[test]
    fn test_tables_are_namespaced_by_db() {
        let mut db = Db::in_memory().unwrap();
        let mut a = db
            .get_or_create_table_in("tenant_a", orders_schema())
            .unwrap();
        let mut b = db
            .get_or_create_table_in("tenant_b", orders_schema())
            .unwrap();

        a.insert(row(&[
            ("item", Value::Str("nails".into())),
            ("qty", Value::U32(10)),
        ]))
        .unwrap();
        assert_eq!(a.iterate().unwrap().len(), 1);
        assert_eq!(b.iterate().unwrap().len(), 0);
        b.insert(row(&[
            ("item", Value::Str("glue".into())),
            ("qty", Value::U32(1)),
        ]))
        .unwrap();
        assert_eq!(b.iterate().unwrap().len(), 1);
    }

    #[test]
    fn test_rename_table() {
        let mut db = Db::in_memory().unwrap();
        let mut orders = db.get_or_create_table(orders_schema()).unwrap();
        orders
            .insert(row(&[
                ("item", Value::Str("rope".into())),
                ("qty", Value::U32(3)),
            ]))
            .unwrap();
        drop(orders);

        db.rename_table("orders", "purchases", DEFAULT_DB).unwrap();

        let renamed = Schema::new("purchases")
            .column(Column::new("id", ColumnType::U64).serial().unique())
            .column(Column::new("item", ColumnType::Str))
            .column(Column::new("qty", ColumnType::U32));
        let purchases = db.get_or_create_table(renamed).unwrap();
        assert_eq!(purchases.iterate().unwrap().len(), 1);

        assert!(db.get_schemas(DEFAULT_DB, "orders").is_err());
    }

    #[test]
    fn test_drop_table_frees_pages_and_spares_others() {
        let mut db = Db::in_memory().unwrap();
        let mut orders = db.get_or_create_table(orders_schema()).unwrap();
        orders
            .insert(row(&[
                ("item", Value::Str("anvil".into())),
                ("qty", Value::U32(1)),
            ]))
            .unwrap();
        drop(orders);

        db.pool().set_tracking(true);
        let mut users = db.get_or_create_table(users_schema()).unwrap();
        for i in 0..25 {
            users
                .insert(user(&format!("u{i}"), &format!("u{i}@x")))
                .unwrap();
        }
        let allocated_during_users: std::collections::BTreeSet<_> =
            db.pool().alloc_log().into_iter().collect();
        drop(users);

        db.drop_table(DEFAULT_DB, "users").unwrap();
        let freed: std::collections::BTreeSet<_> = db.pool().free_log().into_iter().collect();

        // Everything freed by the drop was allocated while the users
        // table owned the pool, and the drop freed a substantial set
        // (storage anchor, directory, data, and index pages).
        assert!(!freed.is_empty());
        assert!(freed.is_subset(&allocated_during_users));

        // The catalog forgot the table; other tables are untouched.
        assert!(db.get_schemas(DEFAULT_DB, "users").is_err());
        let orders = db.get_or_create_table(orders_schema()).unwrap();
        assert_eq!(orders.iterate().unwrap().len(), 1);
    }

    #[test]
    fn test_migrations_run_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let mut db = Db::in_memory().unwrap();
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&runs);
        let first = db
            .migrate(Migration::new("add-users", move |db| {
                counter.fetch_add(1, Ordering::SeqCst);
                db.get_or_create_table(
                    Schema::new("users").column(Column::new("name", ColumnType::Str)),
                )?;
                Ok(())
            }))
            .unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(first.completed_at > 0);

        let counter = Arc::clone(&runs);
        let second = db
            .migrate(Migration::new("add-users", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(second.name, "add-users");
    }

    #[test]
    fn test_export_produces_json_rows() {
        let mut db = Db::in_memory().unwrap();
        let schema = Schema::new("blobs")
            .column(Column::new("label", ColumnType::Str))
            .column(Column::new("payload", ColumnType::Bytes));
        let mut blobs = db.get_or_create_table(schema).unwrap();
        blobs
            .insert(row(&[
                ("label", Value::Str("first".into())),
                ("payload", Value::Bytes(vec![0xde, 0xad])),
            ]))
            .unwrap();

        let entries = db.export(None, None).unwrap();
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.db, "default");
        assert_eq!(entry.table, "blobs");
        assert_eq!(entry.record["label"], serde_json::json!("first"));
        assert_eq!(entry.record["payload"], serde_json::json!("dead"));

        // System tables stay hidden unless explicitly requested.
        assert!(db.export(Some(SYSTEM_DB), None).unwrap().len() > 1);
        assert!(db
            .export(None, Some("missing"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_export_is_serializable() {
        let mut db = Db::in_memory().unwrap();
        let mut users = db.get_or_create_table(users_schema()).unwrap();
        users.insert(user("alice", "a@x")).unwrap();

        let entries = db.export(None, None).unwrap();
        let json = serde_json::to_string(&entries).unwrap();
        assert!(json.contains("\"table\":\"users\""));
        assert!(json.contains("alice"));
    }
}
