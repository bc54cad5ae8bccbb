//! Engine instance lifecycle and commit-completion routing.
//!
//! One instance wraps one open database: the kernel, the session pool, the
//! ref-counted attach map, and the pending-commit map drained by the commit
//! callback.  Instances live in a process-wide registry with an explicit
//! init/shutdown lifecycle driven by the replica host.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use replikv_primitives::errors::{StoreError, StoreResult};

use crate::error::{engine_to_store_error, EngineError};
use crate::kernel::{CommitId, Kernel, LOG_FILE_NAME};
use crate::pool::{PoolItem, SessionPool};
use crate::settings::{EngineSettings, PoolSettings};

pub type InstanceId = u64;

/// Awaited by commit callers; resolves when the commit is durable (or the
/// instance failed).
pub type CommitWaiter = oneshot::Receiver<StoreResult<()>>;

const LOCAL_BACKUP_SUFFIX: &str = "lkbackup";

/// Process-wide instance registry.  Explicit lifecycle; looked up by the
/// commit callback path and by diagnostics.
pub struct InstanceRegistry {
    instances: RwLock<HashMap<InstanceId, Weak<EngineInstance>>>,
    next_id: AtomicU64,
    max_instances: usize,
}

impl InstanceRegistry {
    pub fn init(max_instances: usize) -> Arc<Self> {
        Arc::new(Self {
            instances: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            max_instances,
        })
    }

    pub fn shutdown(&self) {
        let instances: Vec<_> = self.instances.write().drain().collect();
        for (_, weak) in instances {
            if let Some(instance) = weak.upgrade() {
                instance.abort();
            }
        }
    }

    pub fn lookup(&self, id: InstanceId) -> Option<Arc<EngineInstance>> {
        self.instances.read().get(&id).and_then(Weak::upgrade)
    }

    fn register(&self, instance: &Arc<EngineInstance>) -> StoreResult<()> {
        let mut map = self.instances.write();
        map.retain(|_, w| w.strong_count() > 0);
        if map.len() >= self.max_instances {
            return Err(StoreError::InvalidOperation(
                "engine instance limit reached".into(),
            ));
        }
        map.insert(instance.id, Arc::downgrade(instance));
        Ok(())
    }

    fn unregister(&self, id: InstanceId) {
        self.instances.write().remove(&id);
    }
}

struct InstanceState {
    healthy: bool,
    aborting: bool,
    attached: HashMap<PathBuf, usize>,
    pending_commits: BTreeMap<CommitId, oneshot::Sender<StoreResult<()>>>,
    next_batch_start: CommitId,
    incremental_base_taken: bool,
    backup_active: bool,
}

pub struct EngineInstance {
    id: InstanceId,
    registry: Arc<InstanceRegistry>,
    kernel: Arc<Kernel>,
    pool: Arc<SessionPool>,
    settings: EngineSettings,
    state: Mutex<InstanceState>,
}

/// Backup flavours.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackupMode {
    Full,
    Incremental,
    TruncateLogsOnly,
}

impl EngineInstance {
    pub fn open(
        registry: Arc<InstanceRegistry>,
        dir: &Path,
        file_name: &str,
        settings: EngineSettings,
        pool_settings: PoolSettings,
    ) -> StoreResult<Arc<Self>> {
        let kernel =
            Kernel::open(dir, file_name, settings.clone()).map_err(engine_to_store_error)?;
        let pool = SessionPool::new(kernel.clone(), pool_settings);
        let id = registry.next_id.fetch_add(1, Ordering::Relaxed);

        let instance = Arc::new(Self {
            id,
            registry: registry.clone(),
            kernel: kernel.clone(),
            pool,
            settings,
            state: Mutex::new(InstanceState {
                healthy: true,
                aborting: false,
                attached: HashMap::new(),
                pending_commits: BTreeMap::new(),
                next_batch_start: kernel.durable_commit_id() + 1,
                incremental_base_taken: false,
                backup_active: false,
            }),
        });

        registry.register(&instance)?;

        let weak = Arc::downgrade(&instance);
        kernel.set_commit_callback(Arc::new(move |bound, err| {
            if let Some(instance) = weak.upgrade() {
                instance.on_commit_complete(bound, err.map(engine_to_store_error));
            }
        }));

        info!(instance = id, dir = %dir.display(), "engine instance opened");
        Ok(instance)
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn is_healthy(&self) -> bool {
        self.state.lock().healthy
    }

    /// Direct (non-pooled) session creation; transaction-path callers go
    /// through the pool instead.
    pub fn create_session(&self) -> StoreResult<Arc<crate::session::Session>> {
        if !self.is_healthy() {
            return Err(StoreError::StoreFatal);
        }
        if self.state.lock().aborting {
            return Err(StoreError::ObjectClosed);
        }
        Ok(crate::session::Session::new(self.kernel.clone()))
    }

    /// Releases a direct session, rolling back anything in flight.
    pub fn close_session(&self, session: Arc<crate::session::Session>) {
        session.rollback_if_active();
    }

    pub fn acquire_pool_item(self: &Arc<Self>) -> StoreResult<PoolItem> {
        if !self.is_healthy() {
            return Err(StoreError::StoreFatal);
        }
        self.pool.acquire().map_err(engine_to_store_error)
    }

    pub fn release_pool_item(&self, item: PoolItem, had_error: bool) {
        self.pool.release(item, had_error);
    }

    /// Ref-counted attach: only the first attach per path touches the
    /// engine; later calls bump the count.
    pub fn attach_database(&self, path: &Path) -> StoreResult<()> {
        let mut state = self.state.lock();
        if state.aborting {
            return Err(StoreError::ObjectClosed);
        }
        *state.attached.entry(path.to_path_buf()).or_insert(0) += 1;
        Ok(())
    }

    /// Ref-counted detach; the engine-side detach only happens on the last
    /// release.
    pub fn detach_database(&self, path: &Path) -> StoreResult<()> {
        let mut state = self.state.lock();
        match state.attached.get_mut(path) {
            Some(count) if *count > 1 => {
                *count -= 1;
                Ok(())
            }
            Some(_) => {
                state.attached.remove(path);
                debug!(path = %path.display(), "database detached");
                Ok(())
            }
            None => Err(StoreError::InvalidOperation(format!(
                "detach of unattached database {}",
                path.display()
            ))),
        }
    }

    pub fn attach_count(&self, path: &Path) -> usize {
        self.state.lock().attached.get(path).copied().unwrap_or(0)
    }

    /// Issues the lazy commit for the session's transaction and registers a
    /// waiter completed by the commit callback once the batch containing it
    /// is durable.
    pub fn commit_async(
        &self,
        item: &PoolItem,
        timeout: Option<Duration>,
    ) -> StoreResult<(CommitId, CommitWaiter)> {
        let deadline = match timeout {
            Some(t) if t > Duration::ZERO && t < self.settings.max_async_commit_delay => Some(t),
            _ => Some(self.settings.max_async_commit_delay),
        };

        let commit_id = match item.session().commit_lazy(deadline) {
            Ok(id) => id,
            Err(e) => {
                let store_err = engine_to_store_error(e.clone());
                if e.is_fatal() {
                    // Synthesize a terminal callback so every outstanding
                    // waiter drains with the fatal error.
                    self.on_commit_complete(CommitId::MAX, Some(store_err.clone()));
                }
                return Err(store_err);
            }
        };

        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock();
            if !state.healthy {
                let _ = tx.send(Err(StoreError::StoreFatal));
            } else if commit_id < state.next_batch_start {
                // Already durable before we could register.
                let _ = tx.send(Ok(()));
            } else {
                state.pending_commits.insert(commit_id, tx);
            }
        }
        Ok((commit_id, rx))
    }

    /// Synchronous durable barrier.
    pub fn commit_durable(&self, item: &PoolItem, commit_id: CommitId) -> StoreResult<()> {
        item.session()
            .commit_durable_barrier(commit_id)
            .map_err(engine_to_store_error)
    }

    /// Commit-callback entry: completes all pending commits below the
    /// exclusive bound.  Completions resume their waiters off this thread;
    /// no engine call happens inline.
    pub fn for_each_commit_completed(&self, next_batch_start: CommitId, error: Option<StoreError>) {
        self.on_commit_complete(next_batch_start, error)
    }

    fn on_commit_complete(&self, next_batch_start: CommitId, error: Option<StoreError>) {
        let mut completed = Vec::new();
        {
            let mut state = self.state.lock();
            if !state.healthy {
                return;
            }
            if matches!(error, Some(StoreError::StoreFatal)) {
                state.healthy = false;
            }
            if next_batch_start <= state.next_batch_start {
                return;
            }
            state.next_batch_start = next_batch_start;
            let still_pending = state.pending_commits.split_off(&next_batch_start);
            completed.extend(std::mem::replace(&mut state.pending_commits, still_pending));
        }

        let result = match error {
            Some(e) => Err(e),
            None => Ok(()),
        };
        for (_, waiter) in completed {
            let _ = waiter.send(result.clone());
        }
    }

    pub fn pending_commit_count(&self) -> usize {
        self.state.lock().pending_commits.len()
    }

    pub fn backup(&self, backup_dir: &Path, mode: BackupMode) -> StoreResult<()> {
        {
            let mut state = self.state.lock();
            if state.aborting {
                return Err(StoreError::ObjectClosed);
            }
            if state.backup_active {
                return Err(StoreError::BackupInProgress);
            }
            state.backup_active = true;
        }
        let result = self.backup_inner(backup_dir, mode);
        self.state.lock().backup_active = false;
        result
    }

    fn backup_inner(&self, backup_dir: &Path, mode: BackupMode) -> StoreResult<()> {
        match mode {
            BackupMode::Full => {
                fs::create_dir_all(backup_dir)?;
                self.kernel.checkpoint().map_err(engine_to_store_error)?;
                let src = self.kernel.checkpoint_path();
                let file_name = src
                    .file_name()
                    .ok_or_else(|| StoreError::InvalidOperation("bad checkpoint path".into()))?;
                fs::copy(&src, backup_dir.join(file_name))?;
                fs::write(backup_dir.join(LOG_FILE_NAME), [])?;
                self.state.lock().incremental_base_taken = true;
                info!(dir = %backup_dir.display(), "full backup complete");
                Ok(())
            }
            BackupMode::Incremental => {
                if !self.state.lock().incremental_base_taken {
                    return Err(engine_to_store_error(EngineError::MissingFullBackup));
                }
                fs::create_dir_all(backup_dir)?;
                let log = self.kernel.log_path();
                if log.exists() {
                    fs::copy(&log, backup_dir.join(LOG_FILE_NAME))?;
                }
                info!(dir = %backup_dir.display(), "incremental backup complete");
                Ok(())
            }
            BackupMode::TruncateLogsOnly => {
                if backup_dir.exists() && fs::read_dir(backup_dir)?.next().is_some() {
                    return Err(engine_to_store_error(EngineError::BackupDirectoryNotEmpty));
                }
                let temp = backup_dir.join(format!("tl{}", std::process::id()));
                self.backup_inner(&temp, BackupMode::Full)?;
                fs::remove_dir_all(&temp)?;
                Ok(())
            }
        }
    }

    /// Startup-time compaction entry used by the defragmenter.
    pub fn defragment(&self) -> StoreResult<()> {
        self.kernel.checkpoint().map_err(engine_to_store_error)
    }

    pub fn abort_active_sessions(&self) {
        self.pool.abort();
    }

    pub fn close(&self) {
        self.shutdown(false);
    }

    pub fn abort(&self) {
        self.shutdown(true);
    }

    fn shutdown(&self, abort: bool) {
        {
            let mut state = self.state.lock();
            if state.aborting {
                return;
            }
            state.aborting = true;
        }
        self.pool.abort();
        self.kernel.close(abort);

        let drained: Vec<_> = {
            let mut state = self.state.lock();
            std::mem::take(&mut state.pending_commits).into_values().collect()
        };
        for waiter in drained {
            let _ = waiter.send(Err(StoreError::ObjectClosed));
        }
        self.registry.unregister(self.id);
        info!(instance = self.id, abort, "engine instance closed");
    }
}

/// Restores database files from `from_dir` into `db_dir` with the
/// rename-aside protocol: the current directory is preserved as a local
/// backup, a fresh directory is populated from the backup, and on failure
/// the original directory is moved back.
pub fn restore_database(db_dir: &Path, from_dir: &Path) -> StoreResult<()> {
    if !from_dir.exists() {
        return Err(StoreError::InvalidOperation(format!(
            "restore source missing: {}",
            from_dir.display()
        )));
    }

    let aside = db_dir.with_extension(LOCAL_BACKUP_SUFFIX);
    if aside.exists() {
        fs::remove_dir_all(&aside)?;
    }
    if db_dir.exists() {
        fs::rename(db_dir, &aside)?;
    }

    let result = (|| -> StoreResult<()> {
        fs::create_dir_all(db_dir)?;
        for entry in fs::read_dir(from_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                fs::copy(entry.path(), db_dir.join(entry.file_name()))?;
            }
        }
        Ok(())
    })();

    match result {
        Ok(()) => {
            if aside.exists() {
                let _ = fs::remove_dir_all(&aside);
            }
            Ok(())
        }
        Err(e) => {
            warn!(err = %e, "restore failed; moving original database back");
            let _ = fs::remove_dir_all(db_dir);
            if aside.exists() {
                let _ = fs::rename(&aside, db_dir);
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(dir: &Path) -> (Arc<InstanceRegistry>, Arc<EngineInstance>) {
        let registry = InstanceRegistry::init(4);
        let instance = EngineInstance::open(
            registry.clone(),
            dir,
            "store",
            EngineSettings::default(),
            PoolSettings::default(),
        )
        .unwrap();
        (registry, instance)
    }

    fn put_row(instance: &Arc<EngineInstance>, key: &str, lsn: i64) -> (CommitId, CommitWaiter) {
        let item = instance.acquire_pool_item().unwrap();
        item.session().begin_transaction().unwrap();
        item.session()
            .put(
                crate::kernel::RowKey::new("T", key),
                crate::kernel::Row {
                    row_type: "T".into(),
                    key: key.into(),
                    value: vec![1],
                    seq: lsn,
                    lsn,
                    modified: 0,
                    modified_on_primary: 0,
                },
            )
            .unwrap();
        let out = instance.commit_async(&item, None).unwrap();
        instance.release_pool_item(item, false);
        out
    }

    #[tokio::test]
    async fn commit_waiter_resolves_after_flush() {
        let tmp = tempfile::tempdir().unwrap();
        let (registry, instance) = open(tmp.path());

        let (_id, waiter) = put_row(&instance, "a", 1);
        waiter.await.unwrap().unwrap();
        assert_eq!(instance.pending_commit_count(), 0);

        instance.close();
        registry.shutdown();
    }

    #[tokio::test]
    async fn close_drains_pending_commits() {
        let tmp = tempfile::tempdir().unwrap();
        let (registry, instance) = open(tmp.path());

        // Register a waiter for a commit id the flusher will never reach.
        let (tx, rx) = oneshot::channel();
        instance
            .state
            .lock()
            .pending_commits
            .insert(CommitId::MAX - 1, tx);

        instance.close();
        assert_eq!(rx.await.unwrap().unwrap_err(), StoreError::ObjectClosed);
        registry.shutdown();
    }

    #[test]
    fn direct_sessions_outside_the_pool() {
        let tmp = tempfile::tempdir().unwrap();
        let (registry, instance) = open(tmp.path());

        let session = instance.create_session().unwrap();
        session.begin_transaction().unwrap();
        instance.close_session(session);

        instance.close();
        assert!(instance.create_session().is_err());
        registry.shutdown();
    }

    #[test]
    fn attach_detach_refcounts() {
        let tmp = tempfile::tempdir().unwrap();
        let (registry, instance) = open(tmp.path());

        let p = tmp.path().join("aux");
        instance.attach_database(&p).unwrap();
        instance.attach_database(&p).unwrap();
        assert_eq!(instance.attach_count(&p), 2);
        instance.detach_database(&p).unwrap();
        assert_eq!(instance.attach_count(&p), 1);
        instance.detach_database(&p).unwrap();
        assert_eq!(instance.attach_count(&p), 0);
        assert!(instance.detach_database(&p).is_err());

        instance.close();
        registry.shutdown();
    }

    #[test]
    fn truncate_logs_only_requires_empty_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let (registry, instance) = open(tmp.path());

        let backup = tmp.path().join("bk");
        fs::create_dir_all(&backup).unwrap();
        fs::write(backup.join("junk"), b"x").unwrap();
        assert!(instance.backup(&backup, BackupMode::TruncateLogsOnly).is_err());

        let empty = tmp.path().join("bk2");
        instance.backup(&empty, BackupMode::TruncateLogsOnly).unwrap();
        assert!(fs::read_dir(&empty).unwrap().next().is_none());

        instance.close();
        registry.shutdown();
    }

    #[test]
    fn incremental_requires_full_first() {
        let tmp = tempfile::tempdir().unwrap();
        let (registry, instance) = open(tmp.path());

        let dir = tmp.path().join("inc");
        assert!(instance.backup(&dir, BackupMode::Incremental).is_err());
        let full = tmp.path().join("full");
        instance.backup(&full, BackupMode::Full).unwrap();
        instance.backup(&dir, BackupMode::Incremental).unwrap();

        instance.close();
        registry.shutdown();
    }

    #[tokio::test]
    async fn backup_restore_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let db_dir = tmp.path().join("db");
        let backup_dir = tmp.path().join("backup");

        let (registry, instance) = open(&db_dir);
        let (_, w) = put_row(&instance, "a", 1);
        w.await.unwrap().unwrap();
        instance.backup(&backup_dir, BackupMode::Full).unwrap();
        let (_, w) = put_row(&instance, "b", 2);
        w.await.unwrap().unwrap();
        instance.close();

        restore_database(&db_dir, &backup_dir).unwrap();

        let (registry2, instance2) = open(&db_dir);
        assert_eq!(instance2.kernel().estimate_row_count(), 1);
        instance2.close();
        registry2.shutdown();
        registry.shutdown();
    }
}
