use replikv_primitives::errors::StoreError;
use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

/// Vendor-level failure conditions raised by the storage kernel.  These are
/// translated into the store-wide taxonomy exactly once, in
/// [`engine_to_store_error`]; nothing above the adapter matches on them.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("duplicate key")]
    KeyDuplicate,

    #[error("record not found")]
    RecordNotFound,

    #[error("write conflict")]
    WriteConflict,

    #[error("key truncated by index")]
    KeyTruncated,

    #[error("out of memory")]
    OutOfMemory,

    #[error("version store exhausted")]
    VersionStoreOutOfMemory,

    #[error("id space exhausted")]
    OutOfObjectIds,

    #[error("session context already set")]
    SessionContextAlreadySet,

    #[error("session sharing violation")]
    SessionSharingViolation,

    #[error("session has no active transaction")]
    NoActiveTransaction,

    #[error("log file corrupt: {0}")]
    LogFileCorrupt(String),

    #[error("database corrupted: {0}")]
    DatabaseCorrupted(String),

    #[error("log write failed: {0}")]
    LogWriteFail(String),

    #[error("log disk full")]
    LogDiskFull,

    #[error("instance unavailable")]
    InstanceUnavailable,

    #[error("backup aborted by instance close")]
    BackupAbort,

    #[error("instance termination in progress")]
    TermInProgress,

    #[error("database in use")]
    DatabaseInUse,

    #[error("backup directory not empty")]
    BackupDirectoryNotEmpty,

    #[error("incremental backup requires a prior full backup")]
    MissingFullBackup,

    #[error("backup already in progress")]
    BackupInProgress,

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("io failure: {0}")]
    Io(String),
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => EngineError::Io(format!("not found: {e}")),
            std::io::ErrorKind::OutOfMemory => EngineError::OutOfMemory,
            _ => EngineError::Io(e.to_string()),
        }
    }
}

impl EngineError {
    /// Conditions that leave the instance permanently faulted until restart.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::LogWriteFail(_)
                | EngineError::LogDiskFull
                | EngineError::InstanceUnavailable
        )
    }
}

/// The single engine-to-store translation table.  New engine conditions
/// deliberately fall through to `Unexpected` so they surface in traces
/// without widening the public taxonomy.
pub fn engine_to_store_error(e: EngineError) -> StoreError {
    match e {
        EngineError::KeyDuplicate => StoreError::RecordAlreadyExists,
        EngineError::RecordNotFound => StoreError::RecordNotFound,
        EngineError::WriteConflict => StoreError::WriteConflict,
        EngineError::KeyTruncated => StoreError::KeyTooLarge,
        EngineError::OutOfMemory => StoreError::OutOfMemory,
        EngineError::VersionStoreOutOfMemory => StoreError::TransactionTooLarge,
        EngineError::OutOfObjectIds => StoreError::NeedsDefragment,
        EngineError::SessionContextAlreadySet | EngineError::SessionSharingViolation => {
            StoreError::InvalidOperation("multithreaded transactions are not supported".into())
        }
        EngineError::NoActiveTransaction => StoreError::TransactionNotActive,
        EngineError::LogFileCorrupt(m) | EngineError::DatabaseCorrupted(m) => {
            StoreError::DatabaseFilesCorrupted(m)
        }
        EngineError::LogWriteFail(_)
        | EngineError::LogDiskFull
        | EngineError::InstanceUnavailable => StoreError::StoreFatal,
        EngineError::BackupAbort | EngineError::TermInProgress => StoreError::ObjectClosed,
        EngineError::DatabaseInUse => StoreError::StoreInUse,
        EngineError::BackupInProgress => StoreError::BackupInProgress,
        EngineError::BackupDirectoryNotEmpty
        | EngineError::MissingFullBackup
        | EngineError::InvalidPath(_) => {
            StoreError::InvalidOperation(e.to_string())
        }
        EngineError::Io(m) => StoreError::Io(m),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translation_covers_key_outcomes() {
        assert_eq!(
            engine_to_store_error(EngineError::KeyDuplicate),
            StoreError::RecordAlreadyExists
        );
        assert_eq!(
            engine_to_store_error(EngineError::RecordNotFound),
            StoreError::RecordNotFound
        );
        assert_eq!(
            engine_to_store_error(EngineError::WriteConflict),
            StoreError::WriteConflict
        );
        assert_eq!(
            engine_to_store_error(EngineError::OutOfObjectIds),
            StoreError::NeedsDefragment
        );
        assert_eq!(
            engine_to_store_error(EngineError::LogDiskFull),
            StoreError::StoreFatal
        );
        assert_eq!(
            engine_to_store_error(EngineError::TermInProgress),
            StoreError::ObjectClosed
        );
    }

    #[test]
    fn fatality() {
        assert!(EngineError::LogDiskFull.is_fatal());
        assert!(!EngineError::WriteConflict.is_fatal());
    }
}
