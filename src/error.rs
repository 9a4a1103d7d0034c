//! Error types for eventops.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("job not found: {0}")]
    NotFound(String),

    #[error("duplicate job id: {0}")]
    DuplicateId(String),

    #[error("version conflict on job {id}: expected version {expected}")]
    VersionConflict { id: String, expected: i64 },

    #[error("unknown handler: {0}")]
    UnknownHandler(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition {
        from: crate::model::JobState,
        to: crate::model::JobState,
    },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
