//! The migration shim: mirrors live writes into the target backend while
//! bulk migration copies the existing rows, under a single-phase state
//! machine.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{info, warn};

use replikv_copier::create_archive;
use replikv_engine::instance::BackupMode;
use replikv_local_store::{LocalStore, StoreTransaction, SEQUENCE_NUMBER_IGNORE};
use replikv_primitives::errors::{StoreError, StoreResult};
use replikv_primitives::ids::ActivityId;
use replikv_primitives::time::utc_now;
use replikv_replica::events::TxEventHandler;

use crate::blob::BlobStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MigrationPhase {
    Inactive,
    Migration,
    TargetDatabaseSwap,
    SourceDatabaseCleanup,
    TargetDatabaseActive,
    /// Failure branch: put the source back from its backup.
    RestoreSourceBackup,
    /// Failure branch: throw away the partially built target.
    TargetDatabaseCleanup,
}

impl MigrationPhase {
    /// Next phase on success.
    pub fn next(self) -> MigrationPhase {
        match self {
            MigrationPhase::Inactive => MigrationPhase::Migration,
            MigrationPhase::Migration => MigrationPhase::TargetDatabaseSwap,
            MigrationPhase::TargetDatabaseSwap => MigrationPhase::SourceDatabaseCleanup,
            MigrationPhase::SourceDatabaseCleanup => MigrationPhase::TargetDatabaseActive,
            MigrationPhase::TargetDatabaseActive => MigrationPhase::TargetDatabaseActive,
            MigrationPhase::RestoreSourceBackup | MigrationPhase::TargetDatabaseCleanup => {
                MigrationPhase::Inactive
            }
        }
    }

    /// Failure branch from this phase.
    pub fn on_failure(self) -> MigrationPhase {
        match self {
            MigrationPhase::Migration | MigrationPhase::TargetDatabaseSwap => {
                MigrationPhase::TargetDatabaseCleanup
            }
            MigrationPhase::SourceDatabaseCleanup => MigrationPhase::RestoreSourceBackup,
            other => other,
        }
    }
}

#[derive(Clone, Debug)]
pub struct MigrationSettings {
    pub batch_size: usize,
    pub conflict_retry_delay: Duration,
    pub max_conflict_retries: usize,
    pub backup_container: String,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            batch_size: 256,
            conflict_retry_delay: Duration::from_millis(50),
            max_conflict_retries: 8,
            backup_container: "store-migration".into(),
        }
    }
}

struct PhaseState {
    phase: MigrationPhase,
    failure: Option<StoreError>,
}

pub struct KeyValueStoreMigrator {
    source: Arc<LocalStore>,
    target: Arc<LocalStore>,
    settings: MigrationSettings,
    state: Mutex<PhaseState>,
    /// Source tracker id -> open mirror transaction on the target.
    mirrored: Mutex<HashMap<u64, StoreTransaction>>,
    /// Deletes staged in still-open transactions, per tracker id.
    uncommitted_deletes: Mutex<HashMap<u64, Vec<(String, String)>>>,
    /// Keys whose delete has committed; bulk migration skips them.
    deleted_keys: Mutex<HashSet<(String, String)>>,
}

impl KeyValueStoreMigrator {
    pub fn new(
        source: Arc<LocalStore>,
        target: Arc<LocalStore>,
        settings: MigrationSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            source,
            target,
            settings,
            state: Mutex::new(PhaseState {
                phase: MigrationPhase::Inactive,
                failure: None,
            }),
            mirrored: Mutex::new(HashMap::new()),
            uncommitted_deletes: Mutex::new(HashMap::new()),
            deleted_keys: Mutex::new(HashSet::new()),
        })
    }

    pub fn phase(&self) -> MigrationPhase {
        self.state.lock().phase
    }

    pub fn failure(&self) -> Option<StoreError> {
        self.state.lock().failure.clone()
    }

    fn is_mirroring(&self) -> bool {
        matches!(
            self.phase(),
            MigrationPhase::Migration | MigrationPhase::TargetDatabaseSwap
        )
    }

    pub fn start(&self) -> StoreResult<()> {
        let mut state = self.state.lock();
        if state.phase != MigrationPhase::Inactive {
            return Err(StoreError::InvalidOperation(format!(
                "migration already in phase {:?}",
                state.phase
            )));
        }
        state.phase = MigrationPhase::Migration;
        state.failure = None;
        info!("migration started");
        Ok(())
    }

    pub fn complete_phase(&self) -> MigrationPhase {
        let mut state = self.state.lock();
        let next = state.phase.next();
        info!(from = ?state.phase, to = ?next, "migration phase complete");
        state.phase = next;
        next
    }

    pub fn fail_phase(&self, error: StoreError) -> MigrationPhase {
        let mut state = self.state.lock();
        let next = state.phase.on_failure();
        warn!(from = ?state.phase, to = ?next, err = %error, "migration phase failed");
        state.phase = next;
        state.failure = Some(error);
        next
    }

    /// Copies the existing source rows into the target in batches.  Rows
    /// being deleted concurrently are skipped; conflicts retry after a
    /// back-off; already-migrated rows are skipped.
    pub async fn run_bulk_migration(self: &Arc<Self>) -> StoreResult<usize> {
        if self.phase() != MigrationPhase::Migration {
            return Err(StoreError::InvalidOperation(
                "bulk migration outside the migration phase".into(),
            ));
        }

        let mut migrated = 0usize;
        let mut resume_after: Option<(String, String)> = None;

        loop {
            let batch = self.read_batch(resume_after.as_ref())?;
            if batch.is_empty() {
                break;
            }
            resume_after = batch
                .last()
                .map(|row| (row.row_type.clone(), row.key.clone()));

            migrated += self.write_batch(&batch).await?;
        }

        info!(migrated, "bulk migration complete");
        Ok(migrated)
    }

    fn read_batch(
        &self,
        resume_after: Option<&(String, String)>,
    ) -> StoreResult<Vec<replikv_engine::kernel::Row>> {
        let tx = self.source.create_transaction()?;
        let (start_type, start_key) = match resume_after {
            Some((t, k)) => (t.as_str(), k.as_str()),
            None => ("", ""),
        };
        let mut scan = self
            .source
            .enumerate_by_type_and_key(&tx, start_type, start_key, false)?;
        let mut rows = Vec::new();
        while rows.len() < self.settings.batch_size {
            let Some(row) = scan.move_next()? else {
                break;
            };
            if let Some((t, k)) = resume_after {
                if row.row_type == *t && row.key == *k {
                    continue;
                }
            }
            // Bookkeeping namespaces rebuild on the target by themselves.
            if row.row_type.starts_with('+') {
                continue;
            }
            rows.push(row);
        }
        drop(scan);
        tx.rollback();
        Ok(rows)
    }

    async fn write_batch(
        self: &Arc<Self>,
        batch: &[replikv_engine::kernel::Row],
    ) -> StoreResult<usize> {
        let mut written = 0usize;
        for row in batch {
            let key = (row.row_type.clone(), row.key.clone());
            if self.deleted_keys.lock().contains(&key) {
                continue;
            }

            let mut attempt = 0usize;
            loop {
                let result = (|| {
                    let tx = self.target.create_transaction()?;
                    let out = self.target.insert(
                        &tx,
                        &row.row_type,
                        &row.key,
                        &row.value,
                        row.seq,
                        Some(row.modified_on_primary),
                    );
                    match out {
                        Ok(()) => {
                            tx.commit_durable(None)?;
                            Ok(true)
                        }
                        Err(StoreError::RecordAlreadyExists) => {
                            tx.rollback();
                            Ok(false)
                        }
                        Err(e) => {
                            tx.rollback();
                            Err(e)
                        }
                    }
                })();

                match result {
                    Ok(true) => {
                        written += 1;
                        break;
                    }
                    Ok(false) => break,
                    Err(StoreError::WriteConflict)
                        if attempt < self.settings.max_conflict_retries =>
                    {
                        attempt += 1;
                        tokio::time::sleep(self.settings.conflict_retry_delay).await;
                    }
                    Err(e) => {
                        self.fail_phase(e.clone());
                        return Err(e);
                    }
                }
            }
        }
        Ok(written)
    }

    /// Takes a full source backup, archives it, and uploads it through the
    /// blob store.  Returns the blob name.
    pub fn backup_source(&self, blob: &dyn BlobStore, staging: &std::path::Path) -> StoreResult<String> {
        let backup_dir = staging.join("srcbk");
        if backup_dir.exists() {
            std::fs::remove_dir_all(&backup_dir)?;
        }
        self.source.backup(&backup_dir, BackupMode::Full)?;

        let archive = staging.join("srcbk.zip");
        create_archive(&backup_dir, &archive)?;
        std::fs::remove_dir_all(&backup_dir)?;

        let name = format!("source-{}.zip", utc_now());
        blob.upload(&archive, &name, &self.settings.backup_container)?;
        std::fs::remove_file(&archive)?;
        info!(blob = %name, "source backup uploaded");
        Ok(name)
    }

    /// Downloads a source backup and stages it for restore at the source's
    /// next open.
    pub fn restore_source(
        &self,
        blob: &dyn BlobStore,
        blob_name: &str,
        staging: &std::path::Path,
    ) -> StoreResult<()> {
        let archive = staging.join("srcrestore.zip");
        blob.download(blob_name, &archive, &self.settings.backup_container)?;

        let unpack_dir = staging.join("srcrestore");
        if unpack_dir.exists() {
            std::fs::remove_dir_all(&unpack_dir)?;
        }
        replikv_copier::extract_archive(&archive, &unpack_dir)?;
        self.source.prepare_restore(&unpack_dir)?;
        std::fs::remove_dir_all(&unpack_dir)?;
        std::fs::remove_file(&archive)?;
        info!(blob = %blob_name, "source restore staged");
        Ok(())
    }
}

impl TxEventHandler for KeyValueStoreMigrator {
    fn on_create_transaction(&self, _activity: ActivityId, tx_key: u64) {
        if !self.is_mirroring() {
            return;
        }
        match self.target.create_transaction() {
            Ok(tx) => {
                self.mirrored.lock().insert(tx_key, tx);
            }
            Err(e) => {
                warn!(tx_key, err = %e, "failed to open mirror transaction");
            }
        }
    }

    fn on_insert(&self, tx_key: u64, row_type: &str, key: &str, value: &[u8]) -> StoreResult<()> {
        if !self.is_mirroring() {
            return Ok(());
        }
        let mirrored = self.mirrored.lock();
        let Some(tx) = mirrored.get(&tx_key) else {
            return Ok(());
        };
        match self.target.insert(tx, row_type, key, value, 0, None) {
            Ok(()) | Err(StoreError::RecordAlreadyExists) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn on_update(&self, tx_key: u64, row_type: &str, key: &str, value: &[u8]) -> StoreResult<()> {
        if !self.is_mirroring() {
            return Ok(());
        }
        let mirrored = self.mirrored.lock();
        let Some(tx) = mirrored.get(&tx_key) else {
            return Ok(());
        };
        match self.target.update(
            tx,
            row_type,
            key,
            SEQUENCE_NUMBER_IGNORE,
            None,
            Some(value),
            0,
            None,
        ) {
            Ok(()) => Ok(()),
            Err(StoreError::RecordNotFound) => {
                self.target.insert(tx, row_type, key, value, 0, None)
            }
            Err(e) => Err(e),
        }
    }

    fn on_delete(&self, tx_key: u64, row_type: &str, key: &str) -> StoreResult<()> {
        if !self.is_mirroring() {
            return Ok(());
        }
        {
            let mirrored = self.mirrored.lock();
            if let Some(tx) = mirrored.get(&tx_key) {
                match self.target.delete(tx, row_type, key, SEQUENCE_NUMBER_IGNORE) {
                    Ok(()) | Err(StoreError::RecordNotFound) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        self.uncommitted_deletes
            .lock()
            .entry(tx_key)
            .or_default()
            .push((row_type.to_string(), key.to_string()));
        Ok(())
    }

    fn on_commit(&self, _activity: ActivityId, tx_key: u64) -> StoreResult<()> {
        if !self.is_mirroring() {
            return Ok(());
        }
        let tx = self.mirrored.lock().remove(&tx_key);
        if let Some(tx) = tx {
            tx.commit_durable(None)?;
        }
        if let Some(deletes) = self.uncommitted_deletes.lock().remove(&tx_key) {
            let mut deleted = self.deleted_keys.lock();
            for key in deletes {
                deleted.insert(key);
            }
        }
        Ok(())
    }

    fn on_release_transaction(&self, _activity: ActivityId, tx_key: u64) {
        if let Some(tx) = self.mirrored.lock().remove(&tx_key) {
            tx.rollback();
        }
        self.uncommitted_deletes.lock().remove(&tx_key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replikv_engine::instance::InstanceRegistry;
    use replikv_local_store::LocalStoreSettings;

    async fn seeded_pair(
        root: &std::path::Path,
    ) -> (Arc<InstanceRegistry>, Arc<LocalStore>, Arc<LocalStore>) {
        let registry = InstanceRegistry::init(8);
        let source = LocalStore::open(
            registry.clone(),
            &root.join("src"),
            LocalStoreSettings::default(),
            None,
        )
        .unwrap();
        let target = LocalStore::open(
            registry.clone(),
            &root.join("dst"),
            LocalStoreSettings::default(),
            None,
        )
        .unwrap();

        let tx = source.create_transaction().unwrap();
        for i in 0..10 {
            source
                .insert(&tx, "T", &format!("k{i:02}"), &[i as u8], (i + 1) as i64, None)
                .unwrap();
        }
        let (_, waiter) = tx.commit_async(None).unwrap();
        waiter.await.unwrap().unwrap();
        (registry, source, target)
    }

    #[tokio::test]
    async fn bulk_migration_copies_rows_and_skips_deleted() {
        let tmp = tempfile::tempdir().unwrap();
        let (registry, source, target) = seeded_pair(tmp.path()).await;
        let migrator =
            KeyValueStoreMigrator::new(source.clone(), target.clone(), MigrationSettings::default());
        migrator.start().unwrap();

        // A concurrently committed delete: bulk migration must not copy it.
        migrator
            .deleted_keys
            .lock()
            .insert(("T".into(), "k03".into()));

        let migrated = migrator.run_bulk_migration().await.unwrap();
        assert_eq!(migrated, 9);

        let tx = target.create_transaction().unwrap();
        assert!(target.get(&tx, "T", "k03").unwrap().is_none());
        assert!(target.get(&tx, "T", "k00").unwrap().is_some());
        tx.rollback();

        // Re-running skips the already migrated rows.
        assert_eq!(migrator.run_bulk_migration().await.unwrap(), 0);

        source.terminate();
        target.terminate();
        registry.shutdown();
    }

    #[tokio::test]
    async fn mirroring_follows_source_transactions() {
        let tmp = tempfile::tempdir().unwrap();
        let (registry, source, target) = seeded_pair(tmp.path()).await;
        let migrator =
            KeyValueStoreMigrator::new(source.clone(), target.clone(), MigrationSettings::default());
        migrator.start().unwrap();

        let activity = ActivityId::next();
        migrator.on_create_transaction(activity, 7);
        migrator.on_insert(7, "T", "live", &[1]).unwrap();
        migrator.on_delete(7, "T", "k01").unwrap();
        migrator.on_commit(activity, 7).unwrap();
        migrator.on_release_transaction(activity, 7);

        let tx = target.create_transaction().unwrap();
        assert_eq!(target.get(&tx, "T", "live").unwrap().unwrap().value, vec![1]);
        tx.rollback();
        assert!(migrator.deleted_keys.lock().contains(&("T".into(), "k01".into())));

        source.terminate();
        target.terminate();
        registry.shutdown();
    }

    #[tokio::test]
    async fn phase_machine_branches() {
        let tmp = tempfile::tempdir().unwrap();
        let (registry, source, target) = seeded_pair(tmp.path()).await;
        let migrator = KeyValueStoreMigrator::new(source.clone(), target.clone(), MigrationSettings::default());

        migrator.start().unwrap();
        assert_eq!(migrator.phase(), MigrationPhase::Migration);
        assert!(migrator.start().is_err());

        assert_eq!(migrator.complete_phase(), MigrationPhase::TargetDatabaseSwap);
        assert_eq!(
            migrator.fail_phase(StoreError::Timeout),
            MigrationPhase::TargetDatabaseCleanup
        );
        assert_eq!(migrator.failure(), Some(StoreError::Timeout));
        assert_eq!(migrator.complete_phase(), MigrationPhase::Inactive);

        source.terminate();
        target.terminate();
        registry.shutdown();
    }

    #[tokio::test]
    async fn source_backup_round_trips_through_blob_store() {
        let tmp = tempfile::tempdir().unwrap();
        let (registry, source, target) = seeded_pair(tmp.path()).await;
        let migrator = KeyValueStoreMigrator::new(source.clone(), target.clone(), MigrationSettings::default());
        let blob = crate::blob::FileBlobStore::new(tmp.path().join("blobs"));

        let staging = tmp.path().join("staging");
        std::fs::create_dir_all(&staging).unwrap();
        let name = migrator.backup_source(&blob, &staging).unwrap();
        migrator.restore_source(&blob, &name, &staging).unwrap();

        // The restore is staged under the source's `res` directory.
        assert!(source.directory().join("res").exists());

        source.terminate();
        target.terminate();
        registry.shutdown();
    }
}
