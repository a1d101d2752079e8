//! burrow: an embedded, single-file relational storage engine.
//!
//! A client defines table schemas in code, opens or creates a database
//! file, and then inserts, reads, updates, scans, and queries rows by
//! indexed column values. Storage is a paged buffer pool over one file;
//! rows live in slotted pages tracked by heap page directories; secondary
//! indexes are disk-resident B+-trees keyed on typed column values.
//!
//! ```no_run
//! use burrow::{Column, ColumnType, Db, OpenOptions, Schema, Value};
//!
//! # fn main() -> burrow::Result<()> {
//! let mut db = Db::open("people.db", OpenOptions::create())?;
//! let mut people = db.get_or_create_table(
//!     Schema::new("people")
//!         .column(Column::new("name", ColumnType::Str))
//!         .column(Column::new("ssn", ColumnType::Str).unique()),
//! )?;
//!
//! let rowid = people.insert(
//!     [
//!         ("name".to_owned(), Value::Str("Alice".into())),
//!         ("ssn".to_owned(), Value::Str("123-45-6789".into())),
//!     ]
//!     .into_iter()
//!     .collect(),
//! )?;
//! assert!(people.get(rowid)?.is_some());
//! # Ok(())
//! # }
//! ```

pub mod btree;
pub mod codec;
pub mod db;
pub mod index;
pub mod physical;
pub mod schema;
pub mod table;

mod error;

pub use btree::RangeSpec;
pub use db::{Db, ExportEntry, Migration, MigrationRecord, OpenOptions};
pub use error::{Error, Result};
pub use physical::{PageId, RowId};
pub use schema::{Column, ColumnType, Row, Schema, Value};
pub use table::Table;
