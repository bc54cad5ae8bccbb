//! Transactional storage kernel.
//!
//! A single row table with a `(type, key)` primary index and an `lsn`
//! secondary index, multi-versioned for snapshot isolation.  Committed
//! transactions append to a write-ahead log (`edb0.log`) beside a
//! checkpoint file; durability is provided lazily by a flusher thread that
//! syncs on a deadline and reports finished batches through the registered
//! commit callback with the exclusive upper bound of the durable range.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use replikv_primitives::epoch::Lsn;

use crate::error::{EngineError, EngineResult};
use crate::settings::EngineSettings;

pub type Version = u64;
/// Identifier of one committed transaction; strictly increasing.
pub type CommitId = i64;

pub const LOG_FILE_NAME: &str = "edb0.log";
pub const CHECKPOINT_SUFFIX: &str = "edb";
pub const COMPACT_SUFFIX: &str = "cmp";
const LOCK_FILE_NAME: &str = ".lock";

/// Primary-index key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowKey {
    pub row_type: String,
    pub key: String,
}

impl RowKey {
    pub fn new(row_type: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            row_type: row_type.into(),
            key: key.into(),
        }
    }
}

/// One stored row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub row_type: String,
    pub key: String,
    pub value: Vec<u8>,
    pub seq: i64,
    pub lsn: Lsn,
    pub modified: i64,
    pub modified_on_primary: i64,
}

impl Row {
    pub fn row_key(&self) -> RowKey {
        RowKey::new(self.row_type.clone(), self.key.clone())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct VersionedRow {
    version: Version,
    row: Option<Row>,
}

#[derive(Clone, Copy, Debug)]
struct LsnEntry {
    added: Version,
    removed: Option<Version>,
}

#[derive(Default)]
struct Tables {
    rows: BTreeMap<RowKey, Vec<VersionedRow>>,
    lsn_index: BTreeMap<(Lsn, RowKey), LsnEntry>,
    committed_version: Version,
    /// Active snapshot versions with reference counts, for version pruning.
    active_snapshots: BTreeMap<Version, usize>,
}

impl Tables {
    fn min_active_snapshot(&self) -> Version {
        self.active_snapshots
            .keys()
            .next()
            .copied()
            .unwrap_or(self.committed_version)
    }

    fn visible<'a>(&'a self, key: &RowKey, snapshot: Version) -> Option<&'a Row> {
        let versions = self.rows.get(key)?;
        versions
            .iter()
            .rev()
            .find(|v| v.version <= snapshot)
            .and_then(|v| v.row.as_ref())
    }

    fn latest_committed_version(&self, key: &RowKey) -> Option<Version> {
        self.rows.get(key).and_then(|v| v.last()).map(|v| v.version)
    }

    fn apply_write(&mut self, key: RowKey, row: Option<Row>, version: Version) {
        // Maintain the LSN index: close out the previous visible entry and
        // open one for the new row.
        if let Some(prev) = self.visible(&key, version - 1).cloned() {
            if let Some(entry) = self.lsn_index.get_mut(&(prev.lsn, key.clone())) {
                if entry.removed.is_none() {
                    entry.removed = Some(version);
                }
            }
        }
        if let Some(ref r) = row {
            self.lsn_index.insert(
                (r.lsn, key.clone()),
                LsnEntry {
                    added: version,
                    removed: None,
                },
            );
        }

        let horizon = self.min_active_snapshot();
        let versions = self.rows.entry(key).or_default();
        versions.push(VersionedRow { version, row });

        // Prune versions no active snapshot can still observe, keeping one
        // base version at or below the horizon.
        if versions.len() > 1 {
            let base = versions
                .iter()
                .rposition(|v| v.version <= horizon)
                .unwrap_or(0);
            if base > 0 {
                versions.drain(..base);
            }
        }
    }

    fn prune_lsn_index(&mut self) {
        let horizon = self.min_active_snapshot();
        self.lsn_index
            .retain(|_, e| e.removed.map_or(true, |r| r > horizon));
    }
}

#[derive(Serialize, Deserialize)]
struct LogRecord {
    commit_id: CommitId,
    writes: Vec<(RowKey, Option<Row>)>,
}

#[derive(Serialize, Deserialize)]
struct Checkpoint {
    version: Version,
    rows: Vec<Row>,
}

struct LogWriter {
    writer: Option<BufWriter<File>>,
    path: PathBuf,
    bytes: u64,
}

impl LogWriter {
    fn append(&mut self, record: &LogRecord) -> EngineResult<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or(EngineError::InstanceUnavailable)?;
        let body =
            bincode::serialize(record).map_err(|e| EngineError::LogWriteFail(e.to_string()))?;
        writer
            .write_all(&(body.len() as u32).to_le_bytes())
            .and_then(|_| writer.write_all(&body))
            .and_then(|_| writer.flush())
            .map_err(|e| EngineError::LogWriteFail(e.to_string()))?;
        self.bytes += body.len() as u64 + 4;
        Ok(())
    }

    fn sync(&mut self) -> EngineResult<()> {
        if let Some(w) = self.writer.as_mut() {
            w.flush()
                .and_then(|_| w.get_ref().sync_data())
                .map_err(|e| EngineError::LogWriteFail(e.to_string()))?;
        }
        Ok(())
    }

    fn truncate(&mut self) -> EngineResult<()> {
        self.writer = None;
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)?;
        self.writer = Some(BufWriter::new(file));
        self.bytes = 0;
        Ok(())
    }
}

#[derive(Default)]
struct FlushState {
    appended: CommitId,
    durable: CommitId,
    deadline: Option<Instant>,
    sync_requested: bool,
    shutdown: bool,
    failed: Option<EngineError>,
}

pub type CommitCallback = Arc<dyn Fn(CommitId, Option<EngineError>) + Send + Sync>;

/// The kernel proper.  Thread-safe; sessions share it behind an `Arc`.
pub struct Kernel {
    dir: PathBuf,
    file_name: String,
    settings: EngineSettings,
    tables: RwLock<Tables>,
    log: Mutex<LogWriter>,
    flush: Arc<(Mutex<FlushState>, Condvar)>,
    callback: RwLock<Option<CommitCallback>>,
    flusher: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("dir", &self.dir)
            .field("file_name", &self.file_name)
            .finish_non_exhaustive()
    }
}

impl Kernel {
    /// Opens (creating lazily) the database under `dir`.  Runs recovery and,
    /// when enabled and past the threshold, compaction.
    pub fn open(dir: &Path, file_name: &str, settings: EngineSettings) -> EngineResult<Arc<Self>> {
        fs::create_dir_all(dir)?;

        let lock_path = dir.join(LOCK_FILE_NAME);
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    EngineError::DatabaseInUse
                } else {
                    EngineError::from(e)
                }
            })?;

        let checkpoint_path = dir.join(format!("{file_name}.{CHECKPOINT_SUFFIX}"));
        let log_path = dir.join(LOG_FILE_NAME);

        let mut tables = Tables::default();
        if checkpoint_path.exists() {
            let bytes = fs::read(&checkpoint_path)?;
            let cp: Checkpoint = bincode::deserialize(&bytes)
                .map_err(|e| EngineError::DatabaseCorrupted(format!("checkpoint: {e}")))?;
            tables.committed_version = cp.version;
            for row in cp.rows {
                let key = row.row_key();
                tables.lsn_index.insert(
                    (row.lsn, key.clone()),
                    LsnEntry {
                        added: cp.version,
                        removed: None,
                    },
                );
                tables.rows.insert(
                    key,
                    vec![VersionedRow {
                        version: cp.version,
                        row: Some(row),
                    }],
                );
            }
        }

        let mut log_bytes = 0u64;
        if log_path.exists() {
            log_bytes = fs::metadata(&log_path)?.len();
            let mut data = Vec::new();
            File::open(&log_path)?.read_to_end(&mut data)?;
            let mut offset = 0usize;
            while data.len() - offset >= 4 {
                let len =
                    u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap()) as usize;
                if data.len() - offset - 4 < len {
                    warn!(offset, "dropping torn tail record in transaction log");
                    break;
                }
                let frame = &data[offset + 4..offset + 4 + len];
                match bincode::deserialize::<LogRecord>(frame) {
                    Ok(rec) => {
                        if rec.commit_id as u64 > tables.committed_version {
                            let version = rec.commit_id as u64;
                            for (key, row) in rec.writes {
                                tables.apply_write(key, row, version);
                            }
                            tables.committed_version = version;
                        }
                        offset += 4 + len;
                    }
                    Err(e) => {
                        warn!(offset, err = %e, "stopping replay at undecodable log record");
                        break;
                    }
                }
            }
            info!(
                version = tables.committed_version,
                rows = tables.rows.len(),
                "recovered database"
            );
        }

        let log_file = OpenOptions::new().append(true).create(true).open(&log_path)?;
        let buffer_capacity = settings.log_buffers_kb.max(1) * 1024;

        let kernel = Arc::new(Self {
            dir: dir.to_path_buf(),
            file_name: file_name.to_string(),
            settings,
            tables: RwLock::new(tables),
            log: Mutex::new(LogWriter {
                writer: Some(BufWriter::with_capacity(buffer_capacity, log_file)),
                path: log_path,
                bytes: log_bytes,
            }),
            flush: Arc::new((Mutex::new(FlushState::default()), Condvar::new())),
            callback: RwLock::new(None),
            flusher: Mutex::new(None),
        });

        {
            let committed = kernel.tables.read().committed_version as CommitId;
            let mut st = kernel.flush.0.lock();
            st.appended = committed;
            st.durable = committed;
        }

        if kernel.settings.auto_compaction
            && kernel.open_file_size()? >= kernel.settings.compaction_threshold_mb * 1024 * 1024
        {
            info!("compacting database at open");
            kernel.checkpoint()?;
        }

        kernel.spawn_flusher();
        Ok(kernel)
    }

    pub fn set_commit_callback(&self, cb: CommitCallback) {
        *self.callback.write() = Some(cb);
    }

    fn spawn_flusher(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let flush = self.flush.clone();
        let max_delay = self.settings.max_async_commit_delay;
        let handle = std::thread::Builder::new()
            .name("engine-flush".into())
            .spawn(move || {
                loop {
                    let (do_sync, shutdown) = {
                        let (lock, cv) = (&flush.0, &flush.1);
                        let mut st = lock.lock();
                        loop {
                            if st.shutdown {
                                break (st.appended > st.durable, true);
                            }
                            if st.sync_requested {
                                break (true, false);
                            }
                            match st.deadline {
                                Some(d) => {
                                    let now = Instant::now();
                                    if now >= d {
                                        break (true, false);
                                    }
                                    cv.wait_until(&mut st, d);
                                }
                                None => {
                                    cv.wait_for(&mut st, max_delay);
                                }
                            }
                        }
                    };

                    let Some(kernel) = weak.upgrade() else { return };
                    if do_sync {
                        kernel.run_flush();
                    }
                    if shutdown {
                        return;
                    }
                }
            })
            .ok();
        *self.flusher.lock() = handle;
    }

    fn run_flush(&self) {
        let target = self.flush.0.lock().appended;
        let result = self.log.lock().sync();
        let (lock, cv) = (&self.flush.0, &self.flush.1);
        let callback = self.callback.read().clone();
        match result {
            Ok(()) => {
                {
                    let mut st = lock.lock();
                    st.durable = st.durable.max(target);
                    st.deadline = None;
                    st.sync_requested = false;
                }
                cv.notify_all();
                if let Some(cb) = callback {
                    // Exclusive upper bound of the durable range.
                    cb(target + 1, None);
                }
            }
            Err(e) => {
                warn!(err = %e, "transaction log sync failed");
                {
                    let mut st = lock.lock();
                    st.failed = Some(e.clone());
                    st.deadline = None;
                    st.sync_requested = false;
                }
                cv.notify_all();
                if let Some(cb) = callback {
                    cb(CommitId::MAX, Some(e));
                }
            }
        }
    }

    /// Registers a read snapshot.  Must be paired with [`Self::end_snapshot`].
    pub fn begin_snapshot(&self) -> Version {
        let mut tables = self.tables.write();
        let v = tables.committed_version;
        *tables.active_snapshots.entry(v).or_insert(0) += 1;
        v
    }

    pub fn end_snapshot(&self, snapshot: Version) {
        let mut tables = self.tables.write();
        if let Some(count) = tables.active_snapshots.get_mut(&snapshot) {
            *count -= 1;
            if *count == 0 {
                tables.active_snapshots.remove(&snapshot);
            }
        }
        tables.prune_lsn_index();
    }

    pub fn read(&self, snapshot: Version, key: &RowKey) -> Option<Row> {
        self.tables.read().visible(key, snapshot).cloned()
    }

    /// True when `key` has a committed version newer than `snapshot`.
    pub fn has_newer_version(&self, snapshot: Version, key: &RowKey) -> bool {
        self.tables
            .read()
            .latest_committed_version(key)
            .is_some_and(|v| v > snapshot)
    }

    /// First visible row with key strictly greater than `after` (or from
    /// `start` inclusive when `after` is `None`).
    pub fn next_row(
        &self,
        snapshot: Version,
        start: &RowKey,
        after: Option<&RowKey>,
    ) -> Option<(RowKey, Row)> {
        let tables = self.tables.read();
        let lower: Bound<&RowKey> = match after {
            Some(k) => Bound::Excluded(k),
            None => Bound::Included(start),
        };
        for (key, _) in tables.rows.range::<RowKey, _>((lower, Bound::Unbounded)) {
            if let Some(row) = tables.visible(key, snapshot) {
                return Some((key.clone(), row.clone()));
            }
        }
        None
    }

    /// First visible LSN-index entry at or beyond `from` (strictly beyond
    /// `after` when given).
    pub fn next_by_lsn(
        &self,
        snapshot: Version,
        from: Lsn,
        after: Option<&(Lsn, RowKey)>,
    ) -> Option<(Lsn, RowKey, Row)> {
        let tables = self.tables.read();
        let lower: Bound<(Lsn, RowKey)> = match after {
            Some(pos) => Bound::Excluded(pos.clone()),
            None => Bound::Included((from, RowKey::new("", ""))),
        };
        for ((lsn, key), entry) in tables.lsn_index.range((lower, Bound::Unbounded)) {
            let live = entry.added <= snapshot && entry.removed.map_or(true, |r| r > snapshot);
            if !live {
                continue;
            }
            if let Some(row) = tables.visible(key, snapshot) {
                if row.lsn == *lsn {
                    return Some((*lsn, key.clone(), row.clone()));
                }
            }
        }
        None
    }

    /// Highest LSN visible at `snapshot`, 0 when the table is empty.
    pub fn last_lsn(&self, snapshot: Version) -> Lsn {
        let tables = self.tables.read();
        for ((lsn, key), entry) in tables.lsn_index.iter().rev() {
            let live = entry.added <= snapshot && entry.removed.map_or(true, |r| r > snapshot);
            if live && tables.visible(key, snapshot).is_some_and(|r| r.lsn == *lsn) {
                return *lsn;
            }
        }
        0
    }

    /// Commits a buffered write set.  Conflict rule: a committed version
    /// newer than the transaction's snapshot on any written key fails the
    /// whole commit with `WriteConflict` (first committer wins).
    pub fn commit(
        &self,
        snapshot: Version,
        writes: Vec<(RowKey, Option<Row>)>,
        lazy_deadline: Option<Duration>,
    ) -> EngineResult<CommitId> {
        if let Some(e) = self.flush.0.lock().failed.clone() {
            return Err(e);
        }
        if writes.is_empty() {
            return Ok(self.flush.0.lock().durable);
        }

        let mut tables = self.tables.write();
        for (key, _) in &writes {
            if let Some(latest) = tables.latest_committed_version(key) {
                if latest > snapshot {
                    return Err(EngineError::WriteConflict);
                }
            }
        }

        let version = tables.committed_version + 1;
        let commit_id = version as CommitId;

        self.log.lock().append(&LogRecord {
            commit_id,
            writes: writes.clone(),
        })?;

        for (key, row) in writes {
            tables.apply_write(key, row, version);
        }
        tables.committed_version = version;
        drop(tables);

        let delay = lazy_deadline
            .unwrap_or(self.settings.max_async_commit_delay)
            .min(self.settings.max_async_commit_delay);
        {
            let (lock, cv) = (&self.flush.0, &self.flush.1);
            let mut st = lock.lock();
            st.appended = commit_id;
            let deadline = Instant::now() + delay;
            st.deadline = Some(st.deadline.map_or(deadline, |d| d.min(deadline)));
            cv.notify_all();
        }
        Ok(commit_id)
    }

    /// Durable barrier: forces a sync and waits until `commit_id` is on
    /// stable storage.
    pub fn sync_to(&self, commit_id: CommitId) -> EngineResult<()> {
        let (lock, cv) = (&self.flush.0, &self.flush.1);
        let mut st = lock.lock();
        while st.durable < commit_id {
            if let Some(e) = st.failed.clone() {
                return Err(e);
            }
            if st.shutdown {
                return Err(EngineError::TermInProgress);
            }
            st.sync_requested = true;
            cv.notify_all();
            cv.wait_for(&mut st, Duration::from_millis(50));
        }
        Ok(())
    }

    pub fn durable_commit_id(&self) -> CommitId {
        self.flush.0.lock().durable
    }

    pub fn committed_version(&self) -> Version {
        self.tables.read().committed_version
    }

    /// Rewrites the checkpoint file through `<name>.cmp` + rename and
    /// truncates the log.
    pub fn checkpoint(&self) -> EngineResult<()> {
        let cp = {
            let tables = self.tables.read();
            let version = tables.committed_version;
            let rows = tables
                .rows
                .keys()
                .filter_map(|k| tables.visible(k, version).cloned())
                .collect();
            Checkpoint { version, rows }
        };

        let final_path = self.checkpoint_path();
        let tmp_path = self.dir.join(format!("{}.{COMPACT_SUFFIX}", self.file_name));
        let bytes =
            bincode::serialize(&cp).map_err(|e| EngineError::Io(format!("checkpoint: {e}")))?;
        {
            let mut f = File::create(&tmp_path)?;
            f.write_all(&bytes)?;
            f.sync_all()?;
        }
        fs::rename(&tmp_path, &final_path)?;

        let mut log = self.log.lock();
        log.sync()?;
        log.truncate()?;
        debug!(version = cp.version, rows = cp.rows.len(), "checkpoint written");
        Ok(())
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.dir
            .join(format!("{}.{CHECKPOINT_SUFFIX}", self.file_name))
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE_NAME)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn estimate_row_count(&self) -> usize {
        let tables = self.tables.read();
        let v = tables.committed_version;
        tables
            .rows
            .keys()
            .filter(|k| tables.visible(k, v).is_some())
            .count()
    }

    pub fn estimate_db_size_bytes(&self) -> usize {
        let tables = self.tables.read();
        let v = tables.committed_version;
        tables
            .rows
            .keys()
            .filter_map(|k| tables.visible(k, v))
            .map(|r| r.value.len() + 2 * (r.row_type.len() + r.key.len()) + 40)
            .sum()
    }

    pub fn open_file_size(&self) -> EngineResult<u64> {
        let mut total = 0;
        for path in [self.checkpoint_path(), self.log_path()] {
            if path.exists() {
                total += fs::metadata(&path)?.len();
            }
        }
        Ok(total)
    }

    /// Flushes everything and stops the flusher.  With `abort` the final
    /// sync is skipped.
    pub fn close(&self, abort: bool) {
        {
            let (lock, cv) = (&self.flush.0, &self.flush.1);
            let mut st = lock.lock();
            if !abort {
                st.sync_requested = true;
            }
            st.shutdown = true;
            cv.notify_all();
        }
        if let Some(handle) = self.flusher.lock().take() {
            let _ = handle.join();
        }
        let _ = fs::remove_file(self.dir.join(LOCK_FILE_NAME));
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        let _ = fs::remove_file(self.dir.join(LOCK_FILE_NAME));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(t: &str, k: &str, v: &[u8], lsn: Lsn) -> Row {
        Row {
            row_type: t.into(),
            key: k.into(),
            value: v.to_vec(),
            seq: lsn,
            lsn,
            modified: 1,
            modified_on_primary: 1,
        }
    }

    fn write(r: Row) -> (RowKey, Option<Row>) {
        (r.row_key(), Some(r))
    }

    fn open_kernel(dir: &Path) -> Arc<Kernel> {
        Kernel::open(dir, "store", EngineSettings::default()).unwrap()
    }

    #[test]
    fn commit_read_and_recover() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let kernel = open_kernel(tmp.path());
            let snap = kernel.begin_snapshot();
            let id = kernel
                .commit(snap, vec![write(row("T", "a", &[1], 1))], None)
                .unwrap();
            kernel.end_snapshot(snap);
            kernel.sync_to(id).unwrap();
            kernel.close(false);
        }
        let kernel = open_kernel(tmp.path());
        let snap = kernel.begin_snapshot();
        let got = kernel.read(snap, &RowKey::new("T", "a")).unwrap();
        assert_eq!(got.value, vec![1]);
        kernel.end_snapshot(snap);
        kernel.close(false);
    }

    #[test]
    fn snapshot_isolation_hides_later_commits() {
        let tmp = tempfile::tempdir().unwrap();
        let kernel = open_kernel(tmp.path());

        let s0 = kernel.begin_snapshot();
        kernel
            .commit(s0, vec![write(row("T", "a", &[1], 1))], None)
            .unwrap();
        kernel.end_snapshot(s0);

        let reader = kernel.begin_snapshot();
        let s1 = kernel.begin_snapshot();
        kernel
            .commit(s1, vec![write(row("T", "a", &[2], 2))], None)
            .unwrap();
        kernel.end_snapshot(s1);

        // The reader still sees the old version.
        assert_eq!(
            kernel.read(reader, &RowKey::new("T", "a")).unwrap().value,
            vec![1]
        );
        kernel.end_snapshot(reader);

        let fresh = kernel.begin_snapshot();
        assert_eq!(
            kernel.read(fresh, &RowKey::new("T", "a")).unwrap().value,
            vec![2]
        );
        kernel.end_snapshot(fresh);
        kernel.close(false);
    }

    #[test]
    fn later_writer_conflicts() {
        let tmp = tempfile::tempdir().unwrap();
        let kernel = open_kernel(tmp.path());

        let s1 = kernel.begin_snapshot();
        let s2 = kernel.begin_snapshot();

        kernel
            .commit(s1, vec![write(row("T", "a", &[1], 1))], None)
            .unwrap();
        let err = kernel
            .commit(s2, vec![write(row("T", "a", &[2], 2))], None)
            .unwrap_err();
        assert_eq!(err, EngineError::WriteConflict);

        kernel.end_snapshot(s1);
        kernel.end_snapshot(s2);
        kernel.close(false);
    }

    #[test]
    fn lsn_enumeration_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let kernel = open_kernel(tmp.path());

        for (i, key) in ["c", "a", "b"].iter().enumerate() {
            let snap = kernel.begin_snapshot();
            kernel
                .commit(
                    snap,
                    vec![write(row("T", key, &[i as u8], (i + 1) as Lsn))],
                    None,
                )
                .unwrap();
            kernel.end_snapshot(snap);
        }

        let snap = kernel.begin_snapshot();
        let mut seen = Vec::new();
        let mut pos = None;
        while let Some((lsn, key, _row)) = kernel.next_by_lsn(snap, 1, pos.as_ref()) {
            seen.push((lsn, key.key.clone()));
            pos = Some((lsn, key));
        }
        assert_eq!(
            seen,
            vec![(1, "c".into()), (2, "a".into()), (3, "b".into())]
        );
        assert_eq!(kernel.last_lsn(snap), 3);
        kernel.end_snapshot(snap);
        kernel.close(false);
    }

    #[test]
    fn second_open_of_same_directory_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let kernel = open_kernel(tmp.path());
        let err = Kernel::open(tmp.path(), "store", EngineSettings::default()).unwrap_err();
        assert_eq!(err, EngineError::DatabaseInUse);
        kernel.close(false);
    }

    #[test]
    fn checkpoint_truncates_log_and_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let kernel = open_kernel(tmp.path());
            for i in 0..10 {
                let snap = kernel.begin_snapshot();
                kernel
                    .commit(
                        snap,
                        vec![write(row("T", &format!("k{i}"), &[i], (i + 1) as Lsn))],
                        None,
                    )
                    .unwrap();
                kernel.end_snapshot(snap);
            }
            kernel.checkpoint().unwrap();
            assert_eq!(fs::metadata(kernel.log_path()).unwrap().len(), 0);
            kernel.close(false);
        }
        let kernel = open_kernel(tmp.path());
        assert_eq!(kernel.estimate_row_count(), 10);
        kernel.close(false);
    }

    #[test]
    fn commit_callback_reports_exclusive_upper_bound() {
        let tmp = tempfile::tempdir().unwrap();
        let kernel = open_kernel(tmp.path());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        kernel.set_commit_callback(Arc::new(move |bound, err| {
            assert!(err.is_none());
            seen2.lock().push(bound);
        }));

        let snap = kernel.begin_snapshot();
        let id = kernel
            .commit(snap, vec![write(row("T", "a", &[1], 1))], None)
            .unwrap();
        kernel.end_snapshot(snap);
        kernel.sync_to(id).unwrap();

        let bounds = seen.lock().clone();
        assert!(bounds.iter().any(|b| *b > id));
        kernel.close(false);
    }
}
