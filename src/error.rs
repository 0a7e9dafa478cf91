use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("another import is already in progress (bookkeeping lock is held)")]
    ConcurrentImport,

    #[error("{} exited with code {:?} (signal {:?})", .path.display(), .exit_code, .signal)]
    ExternalProcess {
        path: PathBuf,
        exit_code: Option<i32>,
        signal: Option<i32>,
    },

    #[error("an import record for schema \"{schema}\" already exists")]
    DuplicateImportRecord { schema: String },

    #[error("failed to delete schema \"{schema}\": {message}")]
    Sweep { schema: String, message: String },

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("read layer update failed: {0}")]
    ReadLayer(String),

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, ImportError>;
