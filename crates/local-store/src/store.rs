//! The local store proper: lifecycle and data access over one engine
//! instance.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use replikv_engine::error::engine_to_store_error;
use replikv_engine::instance::{restore_database, BackupMode, EngineInstance, InstanceRegistry};
use replikv_engine::kernel::{Row, RowKey};
use replikv_primitives::epoch::Lsn;
use replikv_primitives::errors::{StoreError, StoreResult};
use replikv_primitives::time::{utc_now, UtcTicks, UTC_TICKS_NONE};

use crate::enumeration::{LsnEnumeration, PrimaryEnumeration};
use crate::open_queue::OpenJobQueue;
use crate::settings::LocalStoreSettings;
use crate::transaction::StoreTransaction;
use crate::{
    MAX_KEY_LENGTH_CHARS, MAX_TYPE_LENGTH_CHARS, MAX_VALUE_LENGTH_BYTES, SEQUENCE_NUMBER_IGNORE,
};

/// Sibling directory inside the database directory used to stage a pending
/// restore; applied (and removed) at the next open.
pub const RESTORE_STAGING_DIR: &str = "res";

pub struct LocalStore {
    directory: PathBuf,
    settings: LocalStoreSettings,
    instance: Arc<EngineInstance>,
}

impl LocalStore {
    /// Opens the store, creating the database lazily.  A pending restore
    /// staged under `res/` is applied first.  Opens are throttled through
    /// the process-wide job queue when one is supplied.
    pub fn open(
        registry: Arc<InstanceRegistry>,
        directory: &Path,
        settings: LocalStoreSettings,
        open_queue: Option<&Arc<OpenJobQueue>>,
    ) -> StoreResult<Arc<Self>> {
        let _permit = match open_queue {
            Some(q) => Some(q.enter()?),
            None => None,
        };

        let staging = directory.join(RESTORE_STAGING_DIR);
        if staging.exists() {
            info!(dir = %directory.display(), "applying staged restore");
            // Move the staging area out of the database directory first so
            // the rename-aside of the restore does not carry it away.
            let staged_aside = directory.with_extension("res");
            if staged_aside.exists() {
                fs::remove_dir_all(&staged_aside)?;
            }
            fs::rename(&staging, &staged_aside)?;
            restore_database(directory, &staged_aside)?;
            fs::remove_dir_all(&staged_aside)?;
        }

        let instance = EngineInstance::open(
            registry,
            directory,
            &settings.file_name,
            settings.engine.clone(),
            settings.pool,
        )?;

        Ok(Arc::new(Self {
            directory: directory.to_path_buf(),
            settings,
            instance,
        }))
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn settings(&self) -> &LocalStoreSettings {
        &self.settings
    }

    pub fn instance(&self) -> &Arc<EngineInstance> {
        &self.instance
    }

    pub fn store_exists(directory: &Path, settings: &LocalStoreSettings) -> bool {
        directory
            .join(format!("{}.edb", settings.file_name))
            .exists()
    }

    pub fn create_transaction(self: &Arc<Self>) -> StoreResult<StoreTransaction> {
        StoreTransaction::begin(self.instance.clone())
    }

    fn validate(row_type: &str, key: &str, value_len: usize) -> StoreResult<()> {
        if row_type.chars().count() > MAX_TYPE_LENGTH_CHARS {
            return Err(StoreError::KeyTooLarge);
        }
        if key.chars().count() > MAX_KEY_LENGTH_CHARS {
            return Err(StoreError::KeyTooLarge);
        }
        if value_len > MAX_VALUE_LENGTH_BYTES {
            return Err(StoreError::InvalidOperation("value too large".into()));
        }
        Ok(())
    }

    fn make_row(
        &self,
        row_type: &str,
        key: &str,
        value: Vec<u8>,
        seq: i64,
        modified_on_primary: Option<UtcTicks>,
    ) -> Row {
        let lsn = if self.settings.flags.use_lsn_column {
            seq
        } else {
            0
        };
        let modified_on_primary = if self.settings.flags.use_last_modified_on_primary_column {
            modified_on_primary.unwrap_or(UTC_TICKS_NONE)
        } else {
            UTC_TICKS_NONE
        };
        Row {
            row_type: row_type.to_string(),
            key: key.to_string(),
            value,
            seq,
            lsn,
            modified: utc_now(),
            modified_on_primary,
        }
    }

    /// Inserts a new row.  `RecordAlreadyExists` is returned without
    /// poisoning the transaction so callers can fall back to update.
    pub fn insert(
        &self,
        tx: &StoreTransaction,
        row_type: &str,
        key: &str,
        value: &[u8],
        seq: i64,
        modified_on_primary: Option<UtcTicks>,
    ) -> StoreResult<()> {
        Self::validate(row_type, key, value.len())?;
        tx.with_session(|session| {
            let row_key = RowKey::new(row_type, key);
            if session
                .read(&row_key)
                .map_err(engine_to_store_error)?
                .is_some()
            {
                return Err(StoreError::RecordAlreadyExists);
            }
            let row = self.make_row(row_type, key, value.to_vec(), seq, modified_on_primary);
            session.put(row_key, row).map_err(engine_to_store_error)
        })
    }

    /// Updates an existing row, optionally renaming its key.  A failed
    /// sequence check poisons the transaction; a missing record does not.
    #[allow(clippy::too_many_arguments)]
    pub fn update(
        &self,
        tx: &StoreTransaction,
        row_type: &str,
        key: &str,
        check_seq: i64,
        new_key: Option<&str>,
        new_value: Option<&[u8]>,
        seq: i64,
        modified_on_primary: Option<UtcTicks>,
    ) -> StoreResult<()> {
        let target_key = new_key.unwrap_or(key);
        Self::validate(row_type, target_key, new_value.map_or(0, |v| v.len()))?;
        let result = tx.with_session(|session| {
            let row_key = RowKey::new(row_type, key);
            let current = session
                .read(&row_key)
                .map_err(engine_to_store_error)?
                .ok_or(StoreError::RecordNotFound)?;

            if check_seq > SEQUENCE_NUMBER_IGNORE && check_seq != current.seq {
                return Err(StoreError::SequenceCheckFailed {
                    expected: check_seq,
                    current: current.seq,
                });
            }

            let value = new_value.map(<[u8]>::to_vec).unwrap_or(current.value);
            let row = self.make_row(row_type, target_key, value, seq, modified_on_primary);

            if target_key != key {
                let new_row_key = RowKey::new(row_type, target_key);
                if session
                    .read(&new_row_key)
                    .map_err(engine_to_store_error)?
                    .is_some()
                {
                    return Err(StoreError::RecordAlreadyExists);
                }
                session.remove(row_key).map_err(engine_to_store_error)?;
                session.put(new_row_key, row).map_err(engine_to_store_error)
            } else {
                session.put(row_key, row).map_err(engine_to_store_error)
            }
        });
        if let Err(e @ StoreError::SequenceCheckFailed { .. }) = &result {
            tx.poison(e);
        }
        result
    }

    /// Deletes a row with the same check semantics as update.  Missing rows
    /// return `RecordNotFound` idempotently.
    pub fn delete(
        &self,
        tx: &StoreTransaction,
        row_type: &str,
        key: &str,
        check_seq: i64,
    ) -> StoreResult<()> {
        let result = tx.with_session(|session| {
            let row_key = RowKey::new(row_type, key);
            let current = session
                .read(&row_key)
                .map_err(engine_to_store_error)?
                .ok_or(StoreError::RecordNotFound)?;
            if check_seq > SEQUENCE_NUMBER_IGNORE && check_seq != current.seq {
                return Err(StoreError::SequenceCheckFailed {
                    expected: check_seq,
                    current: current.seq,
                });
            }
            session.remove(row_key).map_err(engine_to_store_error)
        });
        if let Err(e @ StoreError::SequenceCheckFailed { .. }) = &result {
            tx.poison(e);
        }
        result
    }

    pub fn get(
        &self,
        tx: &StoreTransaction,
        row_type: &str,
        key: &str,
    ) -> StoreResult<Option<Row>> {
        tx.with_session(|session| {
            session
                .read(&RowKey::new(row_type, key))
                .map_err(engine_to_store_error)
        })
    }

    pub fn get_lsn(&self, tx: &StoreTransaction, row_type: &str, key: &str) -> StoreResult<Lsn> {
        self.get(tx, row_type, key)?
            .map(|r| r.lsn)
            .ok_or(StoreError::RecordNotFound)
    }

    /// Pure LSN bump: equal is a no-op, a decrease is a caller bug.
    pub fn update_lsn(
        &self,
        tx: &StoreTransaction,
        row_type: &str,
        key: &str,
        new_lsn: Lsn,
    ) -> StoreResult<()> {
        tx.with_session(|session| {
            let row_key = RowKey::new(row_type, key);
            let mut current = session
                .read(&row_key)
                .map_err(engine_to_store_error)?
                .ok_or(StoreError::RecordNotFound)?;
            if current.lsn == new_lsn {
                return Ok(());
            }
            debug_assert!(
                new_lsn > current.lsn,
                "LSN must not decrease: {} -> {}",
                current.lsn,
                new_lsn
            );
            if new_lsn < current.lsn {
                return Err(StoreError::InvalidOperation(format!(
                    "LSN decrease {} -> {}",
                    current.lsn, new_lsn
                )));
            }
            current.lsn = new_lsn;
            current.seq = new_lsn;
            current.modified = utc_now();
            session.put(row_key, current).map_err(engine_to_store_error)
        })
    }

    /// Forward scan of the primary index from `(type, key_start)`.  Strict
    /// mode stops at the type boundary.
    pub fn enumerate_by_type_and_key(
        &self,
        tx: &StoreTransaction,
        row_type: &str,
        key_start: &str,
        strict_type: bool,
    ) -> StoreResult<PrimaryEnumeration> {
        PrimaryEnumeration::open(
            tx.session_clone()?,
            row_type,
            key_start,
            strict_type,
            self.settings.enumeration_perf_trace_threshold,
        )
    }

    /// Change-stream scan: rows with `lsn >= from`, ordered by LSN.
    pub fn enumerate_by_lsn(
        &self,
        tx: &StoreTransaction,
        from: Lsn,
    ) -> StoreResult<LsnEnumeration> {
        LsnEnumeration::open(
            tx.session_clone()?,
            from,
            self.settings.enumeration_perf_trace_threshold,
        )
    }

    /// Highest committed LSN visible to the transaction, 0 when empty.
    pub fn last_change_lsn(&self, tx: &StoreTransaction) -> StoreResult<Lsn> {
        let session = tx.session_clone()?;
        let snapshot = session.snapshot().map_err(engine_to_store_error)?;
        Ok(session.kernel().last_lsn(snapshot))
    }

    pub fn estimate_row_count(&self) -> usize {
        self.instance.kernel().estimate_row_count()
    }

    pub fn estimate_db_size_bytes(&self) -> usize {
        self.instance.kernel().estimate_db_size_bytes()
    }

    pub fn open_file_size(&self) -> StoreResult<u64> {
        self.instance
            .kernel()
            .open_file_size()
            .map_err(engine_to_store_error)
    }

    pub fn backup(&self, backup_dir: &Path, mode: BackupMode) -> StoreResult<()> {
        self.instance.backup(backup_dir, mode)
    }

    /// Stages `src` for restore at the next open.
    pub fn prepare_restore(&self, src: &Path) -> StoreResult<()> {
        let staging = self.directory.join(RESTORE_STAGING_DIR);
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                fs::copy(entry.path(), staging.join(entry.file_name()))?;
            }
        }
        Ok(())
    }

    pub fn terminate(&self) {
        self.instance.close();
    }

    pub fn drain(&self) {
        self.instance.abort_active_sessions();
    }

    /// Deletes the database directory, with bounded retries for transient
    /// sharing violations.
    pub fn cleanup(directory: &Path) -> StoreResult<()> {
        const MAX_RETRIES: usize = 5;
        let mut last_err = None;
        for attempt in 0..MAX_RETRIES {
            if !directory.exists() {
                return Ok(());
            }
            match fs::remove_dir_all(directory) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                    warn!(attempt, dir = %directory.display(), "delete retry");
                    std::thread::sleep(Duration::from_millis(100));
                    last_err = Some(e);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(last_err
            .map(StoreError::from)
            .unwrap_or_else(|| StoreError::Unexpected("cleanup failed".into())))
    }

    /// Commit time helpers used by the replicated layer.
    pub fn store_utc_now(&self) -> UtcTicks {
        utc_now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store(dir: &Path) -> (Arc<InstanceRegistry>, Arc<LocalStore>) {
        let registry = InstanceRegistry::init(8);
        let store = LocalStore::open(
            registry.clone(),
            dir,
            LocalStoreSettings::default(),
            None,
        )
        .unwrap();
        (registry, store)
    }

    #[tokio::test]
    async fn insert_get_update_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let (registry, store) = open_store(tmp.path());

        let tx = store.create_transaction().unwrap();
        store.insert(&tx, "T", "k", &[1, 2], 1, None).unwrap();
        assert_eq!(
            store.insert(&tx, "T", "k", &[3], 1, None).unwrap_err(),
            StoreError::RecordAlreadyExists
        );
        // The duplicate insert did not poison the transaction.
        store
            .update(&tx, "T", "k", SEQUENCE_NUMBER_IGNORE, None, Some(&[9]), 2, None)
            .unwrap();
        let (_, waiter) = tx.commit_async(None).unwrap();
        waiter.await.unwrap().unwrap();

        let tx = store.create_transaction().unwrap();
        let row = store.get(&tx, "T", "k").unwrap().unwrap();
        assert_eq!(row.value, vec![9]);
        assert_eq!(row.seq, 2);
        assert_eq!(row.lsn, 2);
        store.delete(&tx, "T", "k", SEQUENCE_NUMBER_IGNORE).unwrap();
        assert_eq!(
            store.delete(&tx, "T", "k", SEQUENCE_NUMBER_IGNORE).unwrap_err(),
            StoreError::RecordNotFound
        );
        tx.rollback();

        // Draining aborts the session pool; new transactions are refused.
        store.drain();
        assert!(store.create_transaction().is_err());

        store.terminate();
        registry.shutdown();
    }

    #[tokio::test]
    async fn sequence_check_poisons_transaction() {
        let tmp = tempfile::tempdir().unwrap();
        let (registry, store) = open_store(tmp.path());

        let tx = store.create_transaction().unwrap();
        store.insert(&tx, "T", "k", &[1], 1, None).unwrap();
        let (_, waiter) = tx.commit_async(None).unwrap();
        waiter.await.unwrap().unwrap();

        let tx = store.create_transaction().unwrap();
        let err = store
            .update(&tx, "T", "k", 999, None, Some(&[2]), 2, None)
            .unwrap_err();
        assert!(matches!(err, StoreError::SequenceCheckFailed { current: 1, .. }));
        // All further operations fail fast.
        assert!(store.get(&tx, "T", "k").is_err());
        tx.rollback();

        // The committed value is untouched.
        let tx = store.create_transaction().unwrap();
        assert_eq!(store.get(&tx, "T", "k").unwrap().unwrap().value, vec![1]);
        tx.rollback();

        store.terminate();
        registry.shutdown();
    }

    #[tokio::test]
    async fn update_lsn_rules() {
        let tmp = tempfile::tempdir().unwrap();
        let (registry, store) = open_store(tmp.path());

        let tx = store.create_transaction().unwrap();
        store.insert(&tx, "T", "k", &[1], 5, None).unwrap();
        let (_, waiter) = tx.commit_async(None).unwrap();
        waiter.await.unwrap().unwrap();

        let tx = store.create_transaction().unwrap();
        store.update_lsn(&tx, "T", "k", 5).unwrap(); // equal: no-op
        store.update_lsn(&tx, "T", "k", 8).unwrap();
        assert_eq!(store.get_lsn(&tx, "T", "k").unwrap(), 8);
        tx.rollback();

        store.terminate();
        registry.shutdown();
    }

    #[tokio::test]
    async fn rename_update_moves_row() {
        let tmp = tempfile::tempdir().unwrap();
        let (registry, store) = open_store(tmp.path());

        let tx = store.create_transaction().unwrap();
        store.insert(&tx, "T", "old", &[1], 1, None).unwrap();
        store
            .update(&tx, "T", "old", SEQUENCE_NUMBER_IGNORE, Some("new"), None, 2, None)
            .unwrap();
        assert!(store.get(&tx, "T", "old").unwrap().is_none());
        assert_eq!(store.get(&tx, "T", "new").unwrap().unwrap().value, vec![1]);
        let (_, waiter) = tx.commit_async(None).unwrap();
        waiter.await.unwrap().unwrap();

        store.terminate();
        registry.shutdown();
    }

    #[test]
    fn key_length_validation() {
        let tmp = tempfile::tempdir().unwrap();
        let (registry, store) = open_store(tmp.path());

        let tx = store.create_transaction().unwrap();
        let long_type = "t".repeat(MAX_TYPE_LENGTH_CHARS + 1);
        assert_eq!(
            store.insert(&tx, &long_type, "k", &[1], 1, None).unwrap_err(),
            StoreError::KeyTooLarge
        );
        tx.rollback();

        store.terminate();
        registry.shutdown();
    }

    #[tokio::test]
    async fn staged_restore_is_applied_at_open() {
        let tmp = tempfile::tempdir().unwrap();
        let db_dir = tmp.path().join("db");
        let backup_dir = tmp.path().join("bk");

        let (registry, store) = open_store(&db_dir);
        let tx = store.create_transaction().unwrap();
        store.insert(&tx, "T", "k", &[1], 1, None).unwrap();
        let (_, waiter) = tx.commit_async(None).unwrap();
        waiter.await.unwrap().unwrap();
        store.backup(&backup_dir, BackupMode::Full).unwrap();

        let tx = store.create_transaction().unwrap();
        store.insert(&tx, "T", "extra", &[2], 2, None).unwrap();
        let (_, waiter) = tx.commit_async(None).unwrap();
        waiter.await.unwrap().unwrap();
        store.prepare_restore(&backup_dir).unwrap();
        store.terminate();

        let (registry2, store2) = open_store(&db_dir);
        let tx = store2.create_transaction().unwrap();
        assert!(store2.get(&tx, "T", "extra").unwrap().is_none());
        assert!(store2.get(&tx, "T", "k").unwrap().is_some());
        tx.rollback();
        store2.terminate();
        registry2.shutdown();
        registry.shutdown();
    }
}
