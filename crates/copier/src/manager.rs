//! Shared per-LSN archive manager for file-stream physical full copies.
//!
//! Archives are keyed by their upper-bound LSN and reference counted: a
//! new secondary attaches to any archive at or beyond its target LSN, a
//! single backup may be in flight at a time, and surplus requests queue as
//! waiters (bounded) that retry the scan once the backup lands.  The file
//! is deleted when the last reader releases it.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tracing::{info, warn};

use replikv_engine::instance::BackupMode;
use replikv_local_store::LocalStore;
use replikv_primitives::epoch::Lsn;
use replikv_primitives::errors::{StoreError, StoreResult};
use replikv_primitives::wire::FileStreamChunk;

use crate::archive::create_archive;

const DELETE_RETRY_COUNT: usize = 5;
const DELETE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// One consumer's view of an archive: a chunked reader over the zip file.
pub struct FileStreamFullCopyContext {
    lsn: Lsn,
    file_size: u64,
    reader: Mutex<ChunkReader>,
}

struct ChunkReader {
    file: File,
    offset: u64,
}

impl FileStreamFullCopyContext {
    fn open(path: &Path, lsn: Lsn) -> StoreResult<Self> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        Ok(Self {
            lsn,
            file_size,
            reader: Mutex::new(ChunkReader { file, offset: 0 }),
        })
    }

    pub fn lsn(&self) -> Lsn {
        self.lsn
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Reads the next chunk, tagging first/last.  Returns the chunk and
    /// its starting offset; `None` once the file is exhausted.
    pub fn read_next_chunk(
        &self,
        chunk_size: usize,
    ) -> StoreResult<Option<(FileStreamChunk, u64)>> {
        let mut reader = self.reader.lock();
        if reader.offset >= self.file_size {
            return Ok(None);
        }
        let start = reader.offset;
        let remaining = (self.file_size - start) as usize;
        let len = remaining.min(chunk_size.max(1));
        let mut data = vec![0u8; len];
        reader.file.seek(SeekFrom::Start(start))?;
        reader.file.read_exact(&mut data)?;
        reader.offset = start + len as u64;

        Ok(Some((
            FileStreamChunk {
                is_first_chunk: start == 0,
                is_last_chunk: reader.offset >= self.file_size,
                data,
            },
            start,
        )))
    }
}

struct ArchiveFileContext {
    file_name: PathBuf,
    lsn: Lsn,
    usage_count: usize,
}

impl ArchiveFileContext {
    fn attach(&mut self) -> StoreResult<Arc<FileStreamFullCopyContext>> {
        let ctx = FileStreamFullCopyContext::open(&self.file_name, self.lsn)?;
        self.usage_count += 1;
        info!(
            archive = %self.file_name.display(),
            usage = self.usage_count,
            "attached full copy context"
        );
        Ok(Arc::new(ctx))
    }

    fn release(&mut self) -> usize {
        self.usage_count = self.usage_count.saturating_sub(1);
        info!(
            archive = %self.file_name.display(),
            usage = self.usage_count,
            "released full copy context"
        );
        self.usage_count
    }

    fn cleanup(&self) {
        let mut retries = DELETE_RETRY_COUNT;
        loop {
            if !self.file_name.exists() {
                return;
            }
            match fs::remove_file(&self.file_name) {
                Ok(()) => {
                    info!(archive = %self.file_name.display(), "deleted full copy archive");
                    return;
                }
                Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied && retries > 0 => {
                    retries -= 1;
                    warn!(archive = %self.file_name.display(), retries, "archive delete retry");
                    std::thread::sleep(DELETE_RETRY_DELAY);
                }
                Err(e) => {
                    warn!(archive = %self.file_name.display(), err = %e, "failed to delete archive");
                    return;
                }
            }
        }
    }
}

struct ManagerState {
    backup_active: bool,
    archives_by_lsn: BTreeMap<Lsn, ArchiveFileContext>,
    backup_waiters: Vec<oneshot::Sender<()>>,
    archive_sequence: u32,
}

pub struct FileStreamFullCopyManager {
    local_store: RwLock<Arc<LocalStore>>,
    /// Archive cache directory (`BF/` under the replica root).
    cache_dir: PathBuf,
    max_waiters: i64,
    state: Mutex<ManagerState>,
}

impl FileStreamFullCopyManager {
    pub fn new(local_store: Arc<LocalStore>, cache_dir: PathBuf, max_waiters: i64) -> Arc<Self> {
        Arc::new(Self {
            local_store: RwLock::new(local_store),
            cache_dir,
            max_waiters,
            state: Mutex::new(ManagerState {
                backup_active: false,
                archives_by_lsn: BTreeMap::new(),
                backup_waiters: Vec::new(),
                archive_sequence: 0,
            }),
        })
    }

    /// Re-targets backups after a database swap.
    pub fn set_local_store(&self, store: Arc<LocalStore>) {
        *self.local_store.write() = store;
    }

    /// Attaches to (or produces) an archive whose LSN covers `up_to_lsn`.
    pub async fn get_copy_context(
        self: &Arc<Self>,
        up_to_lsn: Lsn,
    ) -> StoreResult<Arc<FileStreamFullCopyContext>> {
        loop {
            let (sequence, waiter) = {
                let mut state = self.state.lock();

                // Use an existing archive when its LSN satisfies the target.
                let found = state
                    .archives_by_lsn
                    .range_mut(up_to_lsn..)
                    .next()
                    .map(|(_, archive)| archive.attach());
                if let Some(result) = found {
                    return result;
                }

                if state.backup_active {
                    // Only one engine backup runs per replica; queue up.
                    let current = state.backup_waiters.len() as i64;
                    if self.max_waiters >= 0 && current >= self.max_waiters {
                        return Err(StoreError::MaxFileStreamFullCopyWaiters);
                    }
                    let (tx, rx) = oneshot::channel();
                    state.backup_waiters.push(tx);
                    (0, Some(rx))
                } else {
                    state.backup_active = true;
                    state.archive_sequence += 1;
                    (state.archive_sequence, None)
                }
            };

            if let Some(rx) = waiter {
                // Retry the scan when the active backup completes.
                let _ = rx.await;
                continue;
            }

            let result = self.create_new_archive(up_to_lsn, sequence).await;
            self.release_backup_waiters();
            return result;
        }
    }

    async fn create_new_archive(
        self: &Arc<Self>,
        up_to_lsn: Lsn,
        sequence: u32,
    ) -> StoreResult<Arc<FileStreamFullCopyContext>> {
        let backup_dir = self.cache_dir.join(format!("{sequence}b"));
        let archive_file = self.cache_dir.join(format!("{sequence}z"));
        info!(
            backup = %backup_dir.display(),
            lsn = up_to_lsn,
            "creating backup for full copy"
        );

        let store = self.local_store.read().clone();
        let backup_dir2 = backup_dir.clone();
        let archive_file2 = archive_file.clone();
        let build = tokio::task::spawn_blocking(move || -> StoreResult<()> {
            if backup_dir2.exists() {
                fs::remove_dir_all(&backup_dir2)?;
            }
            fs::create_dir_all(&backup_dir2)?;
            store.backup(&backup_dir2, BackupMode::Full)?;
            if archive_file2.exists() {
                fs::remove_file(&archive_file2)?;
            }
            create_archive(&backup_dir2, &archive_file2)?;
            fs::remove_dir_all(&backup_dir2)?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Unexpected(format!("archive task: {e}")))?;
        build?;

        let mut state = self.state.lock();
        let mut archive = ArchiveFileContext {
            file_name: archive_file,
            lsn: up_to_lsn,
            usage_count: 0,
        };
        let ctx = archive.attach()?;
        state.archives_by_lsn.insert(up_to_lsn, archive);
        Ok(ctx)
    }

    fn release_backup_waiters(&self) {
        let waiters = {
            let mut state = self.state.lock();
            state.backup_active = false;
            std::mem::take(&mut state.backup_waiters)
        };
        info!(count = waiters.len(), "releasing backup waiters");
        for waiter in waiters {
            let _ = waiter.send(());
        }
    }

    /// Releases a consumer; deletes the archive when the usage count hits
    /// zero.
    pub fn release_copy_context(&self, ctx: Arc<FileStreamFullCopyContext>) {
        let mut state = self.state.lock();
        let key = ctx.lsn();
        if !state.archives_by_lsn.contains_key(&key) {
            warn!(lsn = key, "archive context not found at release");
            return;
        }
        if let Some(archive) = state.archives_by_lsn.get_mut(&key) {
            if archive.release() == 0 {
                let archive = state.archives_by_lsn.remove(&key);
                drop(state);
                if let Some(archive) = archive {
                    archive.cleanup();
                }
            }
        }
    }

    pub fn usage_count(&self, up_to_lsn: Lsn) -> usize {
        self.state
            .lock()
            .archives_by_lsn
            .get(&up_to_lsn)
            .map(|a| a.usage_count)
            .unwrap_or(0)
    }

    pub fn archive_count(&self) -> usize {
        self.state.lock().archives_by_lsn.len()
    }

    /// Drops every cached archive regardless of usage; close-time cleanup.
    pub fn clear(&self) {
        let archives = {
            let mut state = self.state.lock();
            std::mem::take(&mut state.archives_by_lsn)
        };
        for (_, archive) in archives {
            archive.cleanup();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replikv_engine::instance::InstanceRegistry;
    use replikv_local_store::LocalStoreSettings;

    async fn seeded_store(dir: &Path) -> (Arc<InstanceRegistry>, Arc<LocalStore>) {
        let registry = InstanceRegistry::init(4);
        let store =
            LocalStore::open(registry.clone(), dir, LocalStoreSettings::default(), None).unwrap();
        let tx = store.create_transaction().unwrap();
        for i in 0..20 {
            store
                .insert(&tx, "T", &format!("k{i}"), &[i as u8; 64], i + 1, None)
                .unwrap();
        }
        let (_, waiter) = tx.commit_async(None).unwrap();
        waiter.await.unwrap().unwrap();
        (registry, store)
    }

    #[tokio::test]
    async fn archive_is_shared_and_deleted_after_last_release() {
        let tmp = tempfile::tempdir().unwrap();
        let db = tmp.path().join("db");
        let cache = tmp.path().join("BF");
        fs::create_dir_all(&cache).unwrap();

        let (registry, store) = seeded_store(&db).await;
        let manager = FileStreamFullCopyManager::new(store.clone(), cache.clone(), 16);

        // A requests at LSN 500; the primary produces one archive.
        let a = manager.get_copy_context(500).await.unwrap();
        assert_eq!(manager.archive_count(), 1);
        assert_eq!(manager.usage_count(500), 1);

        // B requests at a lower LSN while A still reads: attaches, no new
        // backup.
        let b = manager.get_copy_context(400).await.unwrap();
        assert_eq!(manager.archive_count(), 1);
        assert_eq!(manager.usage_count(500), 2);

        let archive_path = cache.join("1z");
        assert!(archive_path.exists());

        manager.release_copy_context(a);
        assert!(archive_path.exists());
        manager.release_copy_context(b);
        assert!(!archive_path.exists());
        assert_eq!(manager.archive_count(), 0);

        store.terminate();
        registry.shutdown();
    }

    #[tokio::test]
    async fn chunk_reader_flags_first_and_last() {
        let tmp = tempfile::tempdir().unwrap();
        let db = tmp.path().join("db");
        let cache = tmp.path().join("BF");
        fs::create_dir_all(&cache).unwrap();

        let (registry, store) = seeded_store(&db).await;
        let manager = FileStreamFullCopyManager::new(store.clone(), cache, 16);

        let ctx = manager.get_copy_context(100).await.unwrap();
        let mut chunks = Vec::new();
        let mut total = 0u64;
        while let Some((chunk, offset)) = ctx.read_next_chunk(128).unwrap() {
            assert_eq!(offset, total);
            total += chunk.data.len() as u64;
            chunks.push(chunk);
        }
        assert_eq!(total, ctx.file_size());
        assert!(chunks.first().unwrap().is_first_chunk);
        assert!(chunks.last().unwrap().is_last_chunk);
        assert!(chunks.iter().skip(1).all(|c| !c.is_first_chunk));
        assert!(chunks
            .iter()
            .take(chunks.len() - 1)
            .all(|c| !c.is_last_chunk));

        manager.release_copy_context(ctx);
        store.terminate();
        registry.shutdown();
    }
}
