//! Named run-once migrations, recorded in `__dbMigrations`.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::db::Db;
use crate::error::Result;
use crate::physical::pager::PagePool;

pub type MigrationFn<P> = Box<dyn FnOnce(&mut Db<P>) -> Result<()>>;

pub struct Migration<P: PagePool + Send + Sync + 'static> {
    pub name: String,
    pub db: String,
    pub run: MigrationFn<P>,
}

impl<P: PagePool + Send + Sync + 'static> Migration<P> {
    pub fn new(
        name: impl Into<String>,
        run: impl FnOnce(&mut Db<P>) -> Result<()> + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            db: "default".into(),
            run: Box::new(run),
        }
    }

    pub fn in_db(mut self, db: impl Into<String>) -> Self {
        self.db = db.into();
        self
    }
}

/// What `__dbMigrations` records about a completed migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationRecord {
    pub name: String,
    pub db: String,
    pub completed_at: i32,
}

pub(crate) fn now_timestamp() -> i32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i32)
        .unwrap_or(0)
}
