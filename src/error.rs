use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum HoardError {
    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid config value: {0}")]
    InvalidConfig(String),

    #[error("missing environment variable: {0}")]
    MissingEnv(String),

    #[error("invalid filename for sharding: {0}")]
    InvalidFilename(String),

    #[error("archive source request failed: {0}")]
    SourceHttp(String),

    #[error("archive source returned status {status} for {path}")]
    SourceStatus { status: u16, path: String },

    #[error("archive source has no readable file at {path} (status {status})")]
    SourceMissing { status: u16, path: String },

    #[error("fetched archive {path} is only {size} bytes (floor {floor})")]
    UndersizedFetch { path: String, size: u64, floor: u64 },

    #[error("unreadable archive {path}: {message}")]
    Archive { path: String, message: String },

    #[error("object store client error: {0}")]
    StoreConfig(String),

    #[error("failed to list s3://{bucket}/{prefix}: {message}")]
    StoreList {
        bucket: String,
        prefix: String,
        message: String,
    },

    #[error("failed to put s3://{bucket}/{key}: {message}")]
    StorePut {
        bucket: String,
        key: String,
        message: String,
    },

    #[error("failed to get s3://{bucket}/{key}: {message}")]
    StoreGet {
        bucket: String,
        key: String,
        message: String,
    },

    #[error("compression of {path} failed: {message}")]
    Compression { path: String, message: String },

    #[error("catalog request failed: {0}")]
    CatalogHttp(String),

    #[error("catalog returned status {status}: {message}")]
    CatalogStatus { status: u16, message: String },

    #[error("tabular data error: {0}")]
    Tsv(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("upload pool is shut down")]
    PoolClosed,
}

impl HoardError {
    /// Failures that only cost the current archive or file; the run carries on.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            HoardError::SourceMissing { .. }
                | HoardError::UndersizedFetch { .. }
                | HoardError::Archive { .. }
                | HoardError::Compression { .. }
        )
    }
}
