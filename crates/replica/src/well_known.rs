//! Reserved `type` namespaces for the store's own bookkeeping rows.

/// Epoch history entries, one row per epoch.
pub const TYPE_EPOCH_HISTORY: &str = "+epochHistory";
/// Single-row latest epoch.
pub const TYPE_CURRENT_EPOCH: &str = "+currentEpoch";
/// Progress vector snapshot maintained on secondaries.
pub const TYPE_PROGRESS_VECTOR: &str = "+progressVector";
/// Tombstones, v1 format (one row per deleted key).
pub const TYPE_TOMBSTONE_V1: &str = "+tombstone";
/// Tombstones, v2 format (one row per (key, index)).
pub const TYPE_TOMBSTONE_V2: &str = "+tombstone2";
/// Single-row LSN below which tombstones have been reclaimed.
pub const TYPE_LOW_WATERMARK: &str = "+tombstoneLowWatermark";
/// Single-row persisted logical clock.
pub const TYPE_FABRIC_TIME: &str = "+fabricTime";

/// Key used by the single-row namespaces.
pub const SINGLETON_KEY: &str = "0";

/// Rows that never travel in paged copy operations; their state reaches
/// secondaries through the copy prologue or epoch operations instead.
pub fn is_copy_excluded(row_type: &str) -> bool {
    matches!(
        row_type,
        TYPE_EPOCH_HISTORY
            | TYPE_CURRENT_EPOCH
            | TYPE_PROGRESS_VECTOR
            | TYPE_LOW_WATERMARK
            | TYPE_FABRIC_TIME
    )
}

/// Rows hidden from user-facing enumerations.
pub fn is_internal_type(row_type: &str) -> bool {
    row_type.starts_with('+')
}
