//! Error taxonomy for the daemon.
//!
//! Transient I/O problems are handled where they happen (skip, log, move on) and
//! never show up here. What remains are configuration errors, which are fatal at
//! startup, corruption, which must reach an operator, and plain operation
//! failures that callers report back as an explicit failure.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("workspace root {0} does not exist or is not a directory")]
    MissingWorkspace(PathBuf),
    #[error("backup directory {path} is not writable: {source}")]
    BackupDirUnwritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("metrics store directory {path} is not writable: {source}")]
    DataDirUnwritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },
}

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("backup {0} not found")]
    NotFound(String),
    #[error("archive for backup {id} is missing at {path}")]
    ArchiveMissing { id: String, path: PathBuf },
    #[error("checksum mismatch for backup {id}: stored {expected}, computed {actual}")]
    ChecksumMismatch {
        id: String,
        expected: String,
        actual: String,
    },
    #[error("agent {agent} not present in backup {id}")]
    AgentNotInBackup { id: String, agent: String },
    #[error("invalid agent id {0:?}")]
    InvalidAgentId(String),
    #[error("agent {0} has no state directory")]
    AgentNotFound(String),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("metadata error: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl BackupError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BackupError::Io {
            path: path.into(),
            source,
        }
    }

    /// Corruption must be surfaced to operators rather than retried.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            BackupError::ChecksumMismatch { .. } | BackupError::ArchiveMissing { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("metrics store error: {0}")]
    Sqlite(#[from] tokio_rusqlite::Error),
    #[error("bad payload in metrics store: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Failure of a single metrics collection cycle.
#[derive(Debug, Error)]
pub enum CollectError {
    #[error("cannot list agents directory {path}: {source}")]
    ListAgents {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}
