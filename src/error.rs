use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("column {column} failed validation: {reason}")]
    InvalidRecord { column: String, reason: String },

    #[error("unique constraint violated on column {column}")]
    Duplicate { column: String },

    #[error("{what} not found")]
    NotFound { what: String },

    #[error("write of {needed} bytes exceeds available space of {available}")]
    NoSpace { needed: usize, available: usize },

    #[error("read past end of view")]
    ReadPastEnd,

    #[error("wrong node type: found tag {found}, expected tag {expected}")]
    WrongNodeType { found: u8, expected: u8 },

    #[error("resource used after drop")]
    UseAfterDrop,

    #[error("stored column {column} disagrees with the supplied schema on {field}")]
    SchemaMismatch { column: String, field: String },

    #[error("invalid range: {reason}")]
    InvalidRange { reason: String },

    #[error("corrupt page: {reason}")]
    CorruptPage { reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn corrupt(reason: impl Into<String>) -> Self {
        Error::CorruptPage {
            reason: reason.into(),
        }
    }

    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound { what: what.into() }
    }
}
