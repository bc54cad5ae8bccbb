//! Persistence of epoch bookkeeping: the current epoch row, the epoch
//! history, and the secondary's progress vector.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use replikv_local_store::{LocalStore, StoreTransaction, SEQUENCE_NUMBER_IGNORE};
use replikv_primitives::epoch::{Epoch, Lsn, ProgressVector, ProgressVectorEntry};
use replikv_primitives::errors::{StoreError, StoreResult};

use crate::well_known::{
    SINGLETON_KEY, TYPE_CURRENT_EPOCH, TYPE_EPOCH_HISTORY, TYPE_PROGRESS_VECTOR,
};

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
struct CurrentEpochData {
    epoch: Epoch,
}

/// History rows sort by this key within their namespace.
fn history_key(epoch: Epoch) -> String {
    format!("{:020}.{:020}", epoch.dataloss, epoch.configuration)
}

fn encode<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> StoreResult<T> {
    bincode::deserialize(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

pub fn read_current_epoch(store: &LocalStore, tx: &StoreTransaction) -> StoreResult<Option<Epoch>> {
    match store.get(tx, TYPE_CURRENT_EPOCH, SINGLETON_KEY)? {
        Some(row) => Ok(Some(decode::<CurrentEpochData>(&row.value)?.epoch)),
        None => Ok(None),
    }
}

/// Reads the persisted epoch history in order.
pub fn read_epoch_history(
    store: &LocalStore,
    tx: &StoreTransaction,
) -> StoreResult<ProgressVector> {
    read_vector(store, tx, TYPE_EPOCH_HISTORY)
}

pub fn read_progress_vector(
    store: &LocalStore,
    tx: &StoreTransaction,
) -> StoreResult<ProgressVector> {
    read_vector(store, tx, TYPE_PROGRESS_VECTOR)
}

fn read_vector(
    store: &LocalStore,
    tx: &StoreTransaction,
    row_type: &str,
) -> StoreResult<ProgressVector> {
    let mut vector = ProgressVector::new();
    let mut scan = store.enumerate_by_type_and_key(tx, row_type, "", true)?;
    while let Some(row) = scan.move_next()? {
        let entry: ProgressVectorEntry = decode(&row.value)?;
        vector.append(entry)?;
    }
    Ok(vector)
}

/// Appends to the epoch history and replaces the current-epoch row inside
/// the caller's transaction.  Rejects non-increasing epochs.
pub fn apply_epoch_update(
    store: &LocalStore,
    tx: &StoreTransaction,
    new_epoch: Epoch,
    previous_epoch_last_lsn: Lsn,
) -> StoreResult<()> {
    if let Some(current) = read_current_epoch(store, tx)? {
        if new_epoch <= current {
            return Err(StoreError::InvalidOperation(format!(
                "epoch update {new_epoch} not greater than current {current}"
            )));
        }
    }

    let entry = ProgressVectorEntry {
        epoch: new_epoch,
        last_lsn: previous_epoch_last_lsn,
    };
    let key = history_key(new_epoch);
    match store.insert(tx, TYPE_EPOCH_HISTORY, &key, &encode(&entry)?, 0, None) {
        Ok(()) => {}
        Err(StoreError::RecordAlreadyExists) => {
            // Idempotent replay of the same epoch boundary.
        }
        Err(e) => return Err(e),
    }

    let current = encode(&CurrentEpochData { epoch: new_epoch })?;
    match store.insert(tx, TYPE_CURRENT_EPOCH, SINGLETON_KEY, &current, 0, None) {
        Ok(()) => Ok(()),
        Err(StoreError::RecordAlreadyExists) => store.update(
            tx,
            TYPE_CURRENT_EPOCH,
            SINGLETON_KEY,
            SEQUENCE_NUMBER_IGNORE,
            None,
            Some(&current),
            0,
            None,
        ),
        Err(e) => Err(e),
    }
}

/// Replaces the stored epoch-history rows with `history`.
pub fn write_epoch_history(
    store: &LocalStore,
    tx: &StoreTransaction,
    history: &ProgressVector,
) -> StoreResult<()> {
    write_vector(store, tx, TYPE_EPOCH_HISTORY, history)
}

/// Replaces the stored progress-vector rows with `vector`.
pub fn write_progress_vector(
    store: &LocalStore,
    tx: &StoreTransaction,
    vector: &ProgressVector,
) -> StoreResult<()> {
    write_vector(store, tx, TYPE_PROGRESS_VECTOR, vector)
}

fn write_vector(
    store: &LocalStore,
    tx: &StoreTransaction,
    row_type: &str,
    vector: &ProgressVector,
) -> StoreResult<()> {
    // Drop the old rows first; the namespaces are small.
    let mut existing = Vec::new();
    {
        let mut scan = store.enumerate_by_type_and_key(tx, row_type, "", true)?;
        while let Some(row) = scan.move_next()? {
            existing.push(row.key);
        }
    }
    for key in existing {
        store.delete(tx, row_type, &key, SEQUENCE_NUMBER_IGNORE)?;
    }
    for entry in vector.entries() {
        store.insert(
            tx,
            row_type,
            &history_key(entry.epoch),
            &encode(entry)?,
            0,
            None,
        )?;
    }
    Ok(())
}

/// Initializes the progress vector from the epoch history; called when the
/// replica becomes a secondary.
pub fn snapshot_progress_vector(store: &LocalStore, tx: &StoreTransaction) -> StoreResult<()> {
    let history = read_epoch_history(store, tx)?;
    write_progress_vector(store, tx, &history)
}

/// Truncates progress-vector entries invalidated by a replay below their
/// boundary (data-loss signal).  Returns true when anything was dropped.
pub fn truncate_progress_vector_on_recovery(
    store: &LocalStore,
    tx: &StoreTransaction,
    replay_lsn: Lsn,
) -> StoreResult<bool> {
    let mut vector = read_progress_vector(store, tx)?;
    let dropped = vector.truncate_from(replay_lsn);
    if dropped == 0 {
        return Ok(false);
    }
    warn!(replay_lsn, dropped, "truncating progress vector after backward recovery");
    write_progress_vector(store, tx, &vector)?;
    Ok(true)
}

/// Serializes a vector for the copy prologue / epoch wire operations.
pub fn encode_vector(vector: &ProgressVector) -> StoreResult<Vec<u8>> {
    encode(vector)
}

pub fn decode_vector(bytes: &[u8]) -> StoreResult<ProgressVector> {
    decode(bytes)
}

pub fn encode_epoch_update(epoch: Epoch, previous_epoch_last_lsn: Lsn) -> StoreResult<Vec<u8>> {
    encode(&ProgressVectorEntry {
        epoch,
        last_lsn: previous_epoch_last_lsn,
    })
}

pub fn decode_epoch_update(bytes: &[u8]) -> StoreResult<ProgressVectorEntry> {
    decode(bytes)
}

/// Applies a full epoch history received from the primary, replacing the
/// local rows and logging the transition.
pub fn apply_epoch_history(
    store: &LocalStore,
    tx: &StoreTransaction,
    history: &ProgressVector,
) -> StoreResult<()> {
    info!(entries = history.entries().len(), "applying epoch history");
    write_epoch_history(store, tx, history)
}
