use thiserror::Error;

/// Result type used across the store interfaces.
pub type StoreResult<T> = Result<T, StoreError>;

/// Store-wide error taxonomy.  Engine-level conditions are translated into
/// these kinds at a single boundary in the engine adapter; everything above
/// that boundary only ever sees `StoreError`.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("replica is not primary")]
    NotPrimary,

    #[error("reconfiguration pending")]
    ReconfigurationPending,

    #[error("object is closed")]
    ObjectClosed,

    #[error("record not found")]
    RecordNotFound,

    #[error("record already exists")]
    RecordAlreadyExists,

    #[error("sequence check failed: expected {expected}, current {current}")]
    SequenceCheckFailed { expected: i64, current: i64 },

    #[error("write conflict")]
    WriteConflict,

    #[error("store operation canceled")]
    OperationCanceled,

    #[error("transaction is not active")]
    TransactionNotActive,

    #[error("transaction too large")]
    TransactionTooLarge,

    #[error("key too large")]
    KeyTooLarge,

    #[error("path too long: {0}")]
    PathTooLong(String),

    #[error("store is in use by another holder")]
    StoreInUse,

    #[error("store needs defragmentation")]
    NeedsDefragment,

    #[error("store entered a fatal state")]
    StoreFatal,

    #[error("database files are corrupted: {0}")]
    DatabaseFilesCorrupted(String),

    #[error("backup already in progress")]
    BackupInProgress,

    #[error("too many pending file stream full copy waiters")]
    MaxFileStreamFullCopyWaiters,

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("out of memory")]
    OutOfMemory,

    #[error("operation timed out")]
    Timeout,

    #[error("io: {0}")]
    Io(String),

    #[error("serialization: {0}")]
    Serialization(String),

    #[error("unexpected store failure: {0}")]
    Unexpected(String),
}

impl StoreError {
    /// Errors a secondary apply loop may retry after a bounded back-off.
    /// Everything else is terminal for the stream.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Timeout
                | StoreError::OutOfMemory
                | StoreError::WriteConflict
                | StoreError::StoreInUse
        )
    }

    /// Lookup outcomes that callers handle inline without aborting the
    /// enclosing transaction.
    pub fn is_lookup_miss(&self) -> bool {
        matches!(
            self,
            StoreError::RecordNotFound | StoreError::RecordAlreadyExists
        )
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}
