//! Tombstone bookkeeping for idempotent secondary replay.
//!
//! Two on-disk formats coexist.  V1 keeps one tombstone row per deleted
//! key and bumps its LSN in place on re-delete.  V2 writes one row per
//! `(key, index)` with a monotonic index, enabling range-based cleanup.
//! The low-watermark row records the LSN below which tombstones have been
//! reclaimed.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use replikv_local_store::{LocalStore, StoreTransaction, SEQUENCE_NUMBER_IGNORE};
use replikv_primitives::epoch::Lsn;
use replikv_primitives::errors::{StoreError, StoreResult};
use replikv_primitives::time::UtcTicks;

use crate::well_known::{SINGLETON_KEY, TYPE_LOW_WATERMARK, TYPE_TOMBSTONE_V1, TYPE_TOMBSTONE_V2};

const SEP: char = '\u{1}';

/// Payload of a v2 tombstone row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TombstoneData {
    pub live_entry_type: String,
    pub live_entry_key: String,
    pub index: u64,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
struct LowWatermarkData {
    lsn: Lsn,
}

pub fn tombstone_key_v1(row_type: &str, key: &str) -> String {
    format!("{row_type}{SEP}{key}")
}

pub fn tombstone_key_v2(row_type: &str, key: &str, index: u64) -> String {
    format!("{row_type}{SEP}{key}{SEP}{index:020}")
}

fn tombstone_prefix_v2(row_type: &str, key: &str) -> String {
    format!("{row_type}{SEP}{key}{SEP}")
}

fn encode<T: Serialize>(v: &T) -> StoreResult<Vec<u8>> {
    bincode::serialize(v).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: for<'de> Deserialize<'de>>(b: &[u8]) -> StoreResult<T> {
    bincode::deserialize(b).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Records a delete at `lsn`.  Returns true when a row was written or
/// bumped (false for an idempotent no-op against a newer tombstone).
#[allow(clippy::too_many_arguments)]
pub fn write_tombstone(
    store: &LocalStore,
    tx: &StoreTransaction,
    use_v2: bool,
    row_type: &str,
    key: &str,
    lsn: Lsn,
    modified_on_primary: Option<UtcTicks>,
    next_index: &AtomicU64,
) -> StoreResult<bool> {
    if use_v2 {
        if let Some(existing) = newest_tombstone_lsn_v2(store, tx, row_type, key)? {
            if existing >= lsn {
                debug!(row_type, key, lsn, existing, "tombstone replay skipped");
                return Ok(false);
            }
        }
        // The in-memory index counter restarts at zero after a rebuild, so
        // an allocated index may collide with a copied row; skip forward.
        loop {
            let index = next_index.fetch_add(1, Ordering::Relaxed);
            let data = TombstoneData {
                live_entry_type: row_type.to_string(),
                live_entry_key: key.to_string(),
                index,
            };
            match store.insert(
                tx,
                TYPE_TOMBSTONE_V2,
                &tombstone_key_v2(row_type, key, index),
                &encode(&data)?,
                lsn,
                modified_on_primary,
            ) {
                Ok(()) => return Ok(true),
                Err(StoreError::RecordAlreadyExists) => continue,
                Err(e) => return Err(e),
            }
        }
    } else {
        let ts_key = tombstone_key_v1(row_type, key);
        match store.get(tx, TYPE_TOMBSTONE_V1, &ts_key)? {
            Some(existing) if existing.lsn >= lsn => {
                debug!(row_type, key, lsn, existing = existing.lsn, "tombstone replay skipped");
                Ok(false)
            }
            Some(_) => {
                // In-place LSN bump.
                store.update_lsn(tx, TYPE_TOMBSTONE_V1, &ts_key, lsn)?;
                Ok(true)
            }
            None => {
                store.insert(tx, TYPE_TOMBSTONE_V1, &ts_key, &[], lsn, modified_on_primary)?;
                Ok(true)
            }
        }
    }
}

/// Newest tombstone LSN recorded for `(row_type, key)` in the active
/// format, if any.
pub fn newest_tombstone_lsn(
    store: &LocalStore,
    tx: &StoreTransaction,
    use_v2: bool,
    row_type: &str,
    key: &str,
) -> StoreResult<Option<Lsn>> {
    if use_v2 {
        newest_tombstone_lsn_v2(store, tx, row_type, key)
    } else {
        Ok(store
            .get(tx, TYPE_TOMBSTONE_V1, &tombstone_key_v1(row_type, key))?
            .map(|r| r.lsn))
    }
}

fn newest_tombstone_lsn_v2(
    store: &LocalStore,
    tx: &StoreTransaction,
    row_type: &str,
    key: &str,
) -> StoreResult<Option<Lsn>> {
    let prefix = tombstone_prefix_v2(row_type, key);
    let mut newest = None;
    let mut scan = store.enumerate_by_type_and_key(tx, TYPE_TOMBSTONE_V2, &prefix, true)?;
    while let Some(row) = scan.move_next()? {
        if !row.key.starts_with(&prefix) {
            break;
        }
        newest = Some(newest.map_or(row.lsn, |n: Lsn| n.max(row.lsn)));
    }
    Ok(newest)
}

/// Counts tombstone rows for one key in the v2 format.
pub fn count_tombstones_v2(
    store: &LocalStore,
    tx: &StoreTransaction,
    row_type: &str,
    key: &str,
) -> StoreResult<usize> {
    let prefix = tombstone_prefix_v2(row_type, key);
    let mut count = 0;
    let mut scan = store.enumerate_by_type_and_key(tx, TYPE_TOMBSTONE_V2, &prefix, true)?;
    while let Some(row) = scan.move_next()? {
        if !row.key.starts_with(&prefix) {
            break;
        }
        count += 1;
    }
    Ok(count)
}

pub fn decode_tombstone(value: &[u8]) -> StoreResult<TombstoneData> {
    decode(value)
}

pub fn read_low_watermark(store: &LocalStore, tx: &StoreTransaction) -> StoreResult<Lsn> {
    Ok(match store.get(tx, TYPE_LOW_WATERMARK, SINGLETON_KEY)? {
        Some(row) => decode::<LowWatermarkData>(&row.value)?.lsn,
        None => 0,
    })
}

/// Moves the low watermark forward; decreases are rejected.
pub fn update_low_watermark(
    store: &LocalStore,
    tx: &StoreTransaction,
    lsn: Lsn,
) -> StoreResult<bool> {
    let current = read_low_watermark(store, tx)?;
    if lsn < current {
        return Ok(false);
    }
    if lsn == current {
        return Ok(true);
    }
    let value = encode(&LowWatermarkData { lsn })?;
    match store.insert(tx, TYPE_LOW_WATERMARK, SINGLETON_KEY, &value, lsn, None) {
        Ok(()) => Ok(true),
        Err(StoreError::RecordAlreadyExists) => {
            store.update(
                tx,
                TYPE_LOW_WATERMARK,
                SINGLETON_KEY,
                SEQUENCE_NUMBER_IGNORE,
                None,
                Some(&value),
                lsn,
                None,
            )?;
            Ok(true)
        }
        Err(e) => Err(e),
    }
}

/// Reclaims tombstones below the watermark implied by `last_lsn` and the
/// retention window, advancing the low-watermark row.  Returns the number
/// of reclaimed rows.  Callers hold the low-watermark write lock so
/// in-flight logical copies never lose rows they expected to observe.
pub fn cleanup_tombstones(
    store: &LocalStore,
    tx: &StoreTransaction,
    use_v2: bool,
    last_lsn: Lsn,
    retention_lsns: i64,
) -> StoreResult<usize> {
    let target = last_lsn - retention_lsns;
    if target <= 0 {
        return Ok(0);
    }
    let current = read_low_watermark(store, tx)?;
    if target <= current {
        return Ok(0);
    }

    let row_type = if use_v2 {
        TYPE_TOMBSTONE_V2
    } else {
        TYPE_TOMBSTONE_V1
    };
    let mut doomed = Vec::new();
    {
        let mut scan = store.enumerate_by_type_and_key(tx, row_type, "", true)?;
        while let Some(row) = scan.move_next()? {
            if row.lsn < target {
                doomed.push(row.key);
            }
        }
    }
    for key in &doomed {
        store.delete(tx, row_type, key, SEQUENCE_NUMBER_IGNORE)?;
    }
    update_low_watermark(store, tx, target)?;
    if !doomed.is_empty() {
        info!(count = doomed.len(), watermark = target, "tombstones reclaimed");
    }
    Ok(doomed.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use replikv_engine::instance::InstanceRegistry;
    use replikv_local_store::LocalStoreSettings;
    use std::sync::Arc;

    fn open(dir: &std::path::Path) -> (Arc<InstanceRegistry>, Arc<LocalStore>) {
        let registry = InstanceRegistry::init(4);
        let store =
            LocalStore::open(registry.clone(), dir, LocalStoreSettings::default(), None).unwrap();
        (registry, store)
    }

    #[tokio::test]
    async fn v2_tombstones_are_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let (registry, store) = open(tmp.path());
        let index = AtomicU64::new(0);

        let tx = store.create_transaction().unwrap();
        assert!(write_tombstone(&store, &tx, true, "T", "k", 5, None, &index).unwrap());
        // Replay of the same delete: no new row.
        assert!(!write_tombstone(&store, &tx, true, "T", "k", 5, None, &index).unwrap());
        assert_eq!(count_tombstones_v2(&store, &tx, "T", "k").unwrap(), 1);
        // A later delete of the same key adds a second row.
        assert!(write_tombstone(&store, &tx, true, "T", "k", 9, None, &index).unwrap());
        assert_eq!(count_tombstones_v2(&store, &tx, "T", "k").unwrap(), 2);
        assert_eq!(
            newest_tombstone_lsn(&store, &tx, true, "T", "k").unwrap(),
            Some(9)
        );
        tx.rollback();

        store.terminate();
        registry.shutdown();
    }

    #[tokio::test]
    async fn v1_tombstones_bump_in_place() {
        let tmp = tempfile::tempdir().unwrap();
        let (registry, store) = open(tmp.path());
        let index = AtomicU64::new(0);

        let tx = store.create_transaction().unwrap();
        assert!(write_tombstone(&store, &tx, false, "T", "k", 5, None, &index).unwrap());
        assert!(!write_tombstone(&store, &tx, false, "T", "k", 4, None, &index).unwrap());
        assert!(write_tombstone(&store, &tx, false, "T", "k", 8, None, &index).unwrap());
        assert_eq!(
            newest_tombstone_lsn(&store, &tx, false, "T", "k").unwrap(),
            Some(8)
        );
        tx.rollback();

        store.terminate();
        registry.shutdown();
    }

    #[tokio::test]
    async fn low_watermark_never_decreases() {
        let tmp = tempfile::tempdir().unwrap();
        let (registry, store) = open(tmp.path());

        let tx = store.create_transaction().unwrap();
        assert_eq!(read_low_watermark(&store, &tx).unwrap(), 0);
        assert!(update_low_watermark(&store, &tx, 10).unwrap());
        assert!(!update_low_watermark(&store, &tx, 5).unwrap());
        assert_eq!(read_low_watermark(&store, &tx).unwrap(), 10);
        tx.rollback();

        store.terminate();
        registry.shutdown();
    }

    #[tokio::test]
    async fn cleanup_reclaims_old_tombstones() {
        let tmp = tempfile::tempdir().unwrap();
        let (registry, store) = open(tmp.path());
        let index = AtomicU64::new(0);

        let tx = store.create_transaction().unwrap();
        write_tombstone(&store, &tx, true, "T", "old", 2, None, &index).unwrap();
        write_tombstone(&store, &tx, true, "T", "new", 90, None, &index).unwrap();
        let reclaimed = cleanup_tombstones(&store, &tx, true, 100, 20).unwrap();
        assert_eq!(reclaimed, 1);
        assert_eq!(read_low_watermark(&store, &tx).unwrap(), 80);
        assert_eq!(count_tombstones_v2(&store, &tx, "T", "new").unwrap(), 1);
        assert_eq!(count_tombstones_v2(&store, &tx, "T", "old").unwrap(), 0);
        tx.rollback();

        store.terminate();
        registry.shutdown();
    }
}
