//! Error types for the station daemon.

use std::path::PathBuf;

use toolcrib_protocol::ErrorInfo;

/// Faults reported by a tag reader. A read that simply saw no tag is not an
/// error; see [`crate::reader::TagRead::Timeout`].
#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    #[error("reader unavailable: {0}")]
    Unavailable(String),

    #[error("reader protocol error: {0}")]
    Protocol(String),

    #[error("reader returned an invalid tag id: {0:?}")]
    InvalidTag(String),

    #[error("reader I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("{context}: {source}")]
    Sqlite {
        context: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("failed to create data dir {path}: {source}")]
    DataDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    InvalidInput(String),
}

impl StorageError {
    pub fn sqlite(context: &'static str) -> impl FnOnce(rusqlite::Error) -> Self {
        move |source| StorageError::Sqlite { context, source }
    }

    pub fn to_error_info(&self) -> ErrorInfo {
        match self {
            StorageError::Conflict(message) => ErrorInfo::new("conflict", message.clone()),
            StorageError::InvalidInput(message) => {
                ErrorInfo::new(toolcrib_protocol::ERROR_INVALID_PARAMS, message.clone())
            }
            other => ErrorInfo::new("storage_error", other.to_string()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("home directory not found")]
    HomeNotFound,

    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}
