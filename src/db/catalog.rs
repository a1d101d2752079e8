//! System catalog: the schemas of the tables that describe tables.
//!
//! Catalog tables are stored exactly like user tables, inside the reserved
//! `system` database. Their indexes are memory-flavored and rebuilt at
//! open; `__dbIndexes` cannot describe its own index, so nothing durable
//! may depend on it for the catalog itself. Composite unique constraints
//! are computed columns joining the parts with a unit separator.

use crate::error::{Error, Result};
use crate::schema::{Column, ColumnType, Row, Schema, Value};

pub const SYSTEM_DB: &str = "system";

pub const PAGE_IDS_TABLE: &str = "__dbPageIds";
pub const TABLES_TABLE: &str = "__dbTables";
pub const SCHEMAS_TABLE: &str = "__dbSchemas";
pub const COLUMNS_TABLE: &str = "__dbTableColumns";
pub const INDEXES_TABLE: &str = "__dbIndexes";
pub const MIGRATIONS_TABLE: &str = "__dbMigrations";
pub const SEQUENCES_TABLE: &str = "__dbSequences";

/// `pageType` keys of `__dbPageIds`.
pub const TABLES_PAGE: &str = "tablesTable";
pub const SCHEMAS_PAGE: &str = "schemasTable";
pub const COLUMNS_PAGE: &str = "columnsTable";
pub const INDEXES_PAGE: &str = "indexesTable";
pub const MIGRATIONS_PAGE: &str = "migrationsTable";
pub const SEQUENCES_PAGE: &str = "sequencesTable";

const SEP: char = '\u{1f}';

fn key_part(value: Option<&Value>) -> String {
    match value {
        Some(Value::Str(s)) => s.clone(),
        Some(Value::U32(n)) => n.to_string(),
        Some(Value::U64(n)) => n.to_string(),
        Some(other) => other.to_json().to_string(),
        None => String::new(),
    }
}

/// Composite key over two row fields, used by the computed unique columns
/// below.
fn pair_key(row: &Row, a: &str, b: &str) -> Value {
    Value::Str(format!(
        "{}{}{}",
        key_part(row.get(a)),
        SEP,
        key_part(row.get(b))
    ))
}

/// Key for looking a table up by `(db, name)`.
pub fn table_key(db: &str, name: &str) -> Value {
    Value::Str(format!("{db}{SEP}{name}"))
}

pub fn page_ids_schema() -> Schema {
    Schema::new(PAGE_IDS_TABLE)
        .column(Column::new("pageType", ColumnType::Str).in_memory().unique())
        .column(Column::new("pageId", ColumnType::U64))
}

pub fn tables_schema() -> Schema {
    Schema::new(TABLES_TABLE)
        .column(Column::new("id", ColumnType::U64).serial().in_memory().unique())
        .column(Column::new("db", ColumnType::Str))
        .column(Column::new("name", ColumnType::Str))
        .column(Column::new("heapPageId", ColumnType::U64))
        .column(
            Column::new("dbName", ColumnType::Str)
                .computed(|row| pair_key(row, "db", "name"))
                .in_memory()
                .unique(),
        )
}

pub fn schemas_schema() -> Schema {
    Schema::new(SCHEMAS_TABLE)
        .column(Column::new("id", ColumnType::U64).serial().in_memory().unique())
        .column(Column::new("tableId", ColumnType::U64).in_memory().indexed())
        .column(Column::new("version", ColumnType::U32))
        .column(
            Column::new("tableVersion", ColumnType::Str)
                .computed(|row| pair_key(row, "tableId", "version"))
                .in_memory()
                .unique(),
        )
}

pub fn columns_schema() -> Schema {
    Schema::new(COLUMNS_TABLE)
        .column(Column::new("id", ColumnType::U64).serial().in_memory().unique())
        .column(Column::new("schemaId", ColumnType::U64).in_memory().indexed())
        .column(Column::new("name", ColumnType::Str))
        .column(Column::new("type", ColumnType::Str))
        .column(Column::new("unique", ColumnType::Bool))
        .column(Column::new("indexed", ColumnType::Bool))
        .column(Column::new("indexInMemory", ColumnType::Bool))
        .column(Column::new("computed", ColumnType::Bool))
        .column(Column::new("order", ColumnType::U32))
        .column(
            Column::new("schemaName", ColumnType::Str)
                .computed(|row| pair_key(row, "schemaId", "name"))
                .in_memory()
                .unique(),
        )
}

pub fn indexes_schema() -> Schema {
    Schema::new(INDEXES_TABLE)
        .column(Column::new("id", ColumnType::U64).serial().in_memory().unique())
        .column(Column::new("indexName", ColumnType::Str))
        .column(Column::new("tableId", ColumnType::U64).in_memory().indexed())
        .column(Column::new("heapPageId", ColumnType::U64))
        .column(
            Column::new("tableIndex", ColumnType::Str)
                .computed(|row| pair_key(row, "tableId", "indexName"))
                .in_memory()
                .unique(),
        )
}

pub fn migrations_schema() -> Schema {
    Schema::new(MIGRATIONS_TABLE)
        .column(Column::new("name", ColumnType::Str).in_memory().unique())
        .column(Column::new("db", ColumnType::Str))
        .column(Column::new("completedAt", ColumnType::Timestamp))
}

pub fn sequences_schema() -> Schema {
    Schema::new(SEQUENCES_TABLE)
        .column(Column::new("name", ColumnType::Str).in_memory().unique())
        .column(Column::new("value", ColumnType::U64).default_value(0u64))
}

pub fn as_u64(row: &Row, field: &str) -> Result<u64> {
    match row.get(field) {
        Some(Value::U64(n)) => Ok(*n),
        other => Err(Error::corrupt(format!(
            "catalog field {field} expected u64, got {other:?}"
        ))),
    }
}

pub fn as_u32(row: &Row, field: &str) -> Result<u32> {
    match row.get(field) {
        Some(Value::U32(n)) => Ok(*n),
        other => Err(Error::corrupt(format!(
            "catalog field {field} expected u32, got {other:?}"
        ))),
    }
}

pub fn as_bool(row: &Row, field: &str) -> Result<bool> {
    match row.get(field) {
        Some(Value::Bool(b)) => Ok(*b),
        other => Err(Error::corrupt(format!(
            "catalog field {field} expected bool, got {other:?}"
        ))),
    }
}

pub fn as_str<'r>(row: &'r Row, field: &str) -> Result<&'r str> {
    match row.get(field) {
        Some(Value::Str(s)) => Ok(s),
        other => Err(Error::corrupt(format!(
            "catalog field {field} expected string, got {other:?}"
        ))),
    }
}

/// One column as stored in `__dbTableColumns`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedColumn {
    pub name: String,
    pub type_name: String,
    pub unique: bool,
    pub indexed: bool,
    pub index_in_memory: bool,
    pub computed: bool,
    pub order: u32,
}

impl PersistedColumn {
    pub fn from_column(column: &Column, order: u32) -> Self {
        Self {
            name: column.name.clone(),
            type_name: column.ty.type_name(),
            unique: column.unique,
            indexed: column.index.is_indexed(),
            index_in_memory: column.index.in_memory(),
            computed: column.is_computed(),
            order,
        }
    }

    pub fn to_row(&self, schema_id: u64) -> Row {
        let mut row = Row::new();
        row.insert("schemaId".into(), Value::U64(schema_id));
        row.insert("name".into(), Value::Str(self.name.clone()));
        row.insert("type".into(), Value::Str(self.type_name.clone()));
        row.insert("unique".into(), Value::Bool(self.unique));
        row.insert("indexed".into(), Value::Bool(self.indexed));
        row.insert("indexInMemory".into(), Value::Bool(self.index_in_memory));
        row.insert("computed".into(), Value::Bool(self.computed));
        row.insert("order".into(), Value::U32(self.order));
        row
    }

    pub fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            name: as_str(row, "name")?.to_owned(),
            type_name: as_str(row, "type")?.to_owned(),
            unique: as_bool(row, "unique")?,
            indexed: as_bool(row, "indexed")?,
            index_in_memory: as_bool(row, "indexInMemory")?,
            computed: as_bool(row, "computed")?,
            order: as_u32(row, "order")?,
        })
    }
}

/// Check a supplied schema against the persisted column records, failing
/// `SchemaMismatch` on the first divergence.
pub fn verify_schema(supplied: &Schema, persisted: &[PersistedColumn]) -> Result<()> {
    for (order, column) in supplied.columns.iter().enumerate() {
        let stored = persisted
            .iter()
            .find(|p| p.name == column.name)
            .ok_or_else(|| Error::SchemaMismatch {
                column: column.name.clone(),
                field: "missing from stored schema".into(),
            })?;
        let expected = PersistedColumn::from_column(column, order as u32);
        for (field, matches) in [
            ("type", stored.type_name == expected.type_name),
            ("unique", stored.unique == expected.unique),
            ("indexed", stored.indexed == expected.indexed),
            ("indexInMemory", stored.index_in_memory == expected.index_in_memory),
            ("computed", stored.computed == expected.computed),
            ("order", stored.order == expected.order),
        ] {
            if !matches {
                return Err(Error::SchemaMismatch {
                    column: column.name.clone(),
                    field: field.into(),
                });
            }
        }
    }

    if let Some(extra) = persisted
        .iter()
        .find(|p| supplied.column_named(&p.name).is_none())
    {
        return Err(Error::SchemaMismatch {
            column: extra.name.clone(),
            field: "missing from supplied schema".into(),
        });
    }
    Ok(())
}

/// Rebuild a structural schema from catalog records. Validators, defaults,
/// and compute functions cannot be recovered; computed columns come back
/// as constant-null markers, which is enough for storage layout, drops,
/// and export.
pub fn schema_from_persisted(name: &str, persisted: &[PersistedColumn]) -> Result<Schema> {
    let mut columns: Vec<&PersistedColumn> = persisted.iter().collect();
    columns.sort_by_key(|p| p.order);

    let mut schema = Schema::new(name);
    for stored in columns {
        let mut column = Column::new(stored.name.clone(), ColumnType::parse(&stored.type_name)?);
        if stored.computed {
            column = column.computed(|_| Value::Null);
        }
        if stored.indexed {
            column = if stored.index_in_memory {
                column.in_memory()
            } else {
                column.indexed()
            };
        }
        if stored.unique {
            column = column.unique();
        }
        schema = schema.column(column);
    }
    Ok(schema)
}

#[cfg(test)]
mod tests {
    use crate::schema::row::row;

    use super::*;

    #[test]
    fn test_pair_key_is_separator_safe() {
        let a = row(&[
            ("db", Value::Str("app".into())),
            ("name", Value::Str("users".into())),
        ]);
        let b = row(&[
            ("db", Value::Str("ap".into())),
            ("name", Value::Str("pusers".into())),
        ]);
        assert_ne!(pair_key(&a, "db", "name"), pair_key(&b, "db", "name"));
        assert_eq!(pair_key(&a, "db", "name"), table_key("app", "users"));
    }

    #[test]
    fn test_persisted_column_round_trip() {
        let column = Column::new("ssn", ColumnType::Str).unique();
        let persisted = PersistedColumn::from_column(&column, 3);
        let as_row = persisted.to_row(9);
        assert_eq!(PersistedColumn::from_row(&as_row).unwrap(), persisted);
    }

    #[test]
    fn test_verify_schema_flags_divergence() {
        let schema = Schema::new("people")
            .column(Column::new("name", ColumnType::Str))
            .column(Column::new("age", ColumnType::U32));
        let mut persisted: Vec<PersistedColumn> = schema
            .columns
            .iter()
            .enumerate()
            .map(|(i, c)| PersistedColumn::from_column(c, i as u32))
            .collect();
        assert!(verify_schema(&schema, &persisted).is_ok());

        persisted[1].type_name = "u64".into();
        match verify_schema(&schema, &persisted).unwrap_err() {
            Error::SchemaMismatch { column, field } => {
                assert_eq!(column, "age");
                assert_eq!(field, "type");
            }
            other => panic!("expected schema mismatch, got {other}"),
        }
    }

    #[test]
    fn test_verify_schema_flags_missing_columns() {
        let schema = Schema::new("people").column(Column::new("name", ColumnType::Str));
        let persisted = vec![
            PersistedColumn::from_column(&Column::new("name", ColumnType::Str), 0),
            PersistedColumn::from_column(&Column::new("age", ColumnType::U32), 1),
        ];
        assert!(matches!(
            verify_schema(&schema, &persisted),
            Err(Error::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn test_schema_from_persisted_restores_layout() {
        let original = Schema::new("people")
            .column(Column::new("name", ColumnType::Str).unique())
            .column(Column::new("age", ColumnType::U32))
            .column(
                Column::new("lower", ColumnType::Str)
                    .computed(|_| Value::Null)
                    .indexed(),
            );
        let persisted: Vec<PersistedColumn> = original
            .columns
            .iter()
            .enumerate()
            .map(|(i, c)| PersistedColumn::from_column(c, i as u32))
            .collect();

        let rebuilt = schema_from_persisted("people", &persisted).unwrap();
        assert!(verify_schema(&rebuilt, &persisted).is_ok());
        let stored: Vec<_> = rebuilt.stored_columns().map(|c| c.name.clone()).collect();
        assert_eq!(stored, vec!["name", "age"]);
    }
}
