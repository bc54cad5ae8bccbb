//! Engine sessions: the unit of transaction ownership.
//!
//! A session is bound to the calling thread for the duration of any
//! operation through [`Session::bind`]; binding is re-entrant on the owning
//! thread and fails on any other while held.  Each session carries at most
//! one transaction: a read snapshot plus a buffered write set that is
//! handed to the kernel at commit.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{EngineError, EngineResult};
use crate::kernel::{CommitId, Kernel, Row, RowKey, Version};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

struct TxState {
    snapshot: Version,
    writes: BTreeMap<RowKey, Option<Row>>,
}

#[derive(Default)]
struct Binding {
    owner: Option<ThreadId>,
    depth: u32,
}

struct SessionInner {
    tx: Option<TxState>,
    /// Bumped whenever a transaction ends; open cursors compare against it.
    generation: u64,
    open_cursors: usize,
    unrecoverable: bool,
}

pub struct Session {
    id: u64,
    kernel: Arc<Kernel>,
    binding: Mutex<Binding>,
    inner: Mutex<SessionInner>,
}

/// Scoped thread-affinity token; releases the binding (or one nesting
/// level) on drop.
pub struct BindGuard<'a> {
    session: &'a Session,
}

impl Drop for BindGuard<'_> {
    fn drop(&mut self) {
        let mut b = self.session.binding.lock();
        b.depth -= 1;
        if b.depth == 0 {
            b.owner = None;
        }
    }
}

impl Session {
    pub fn new(kernel: Arc<Kernel>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            kernel,
            binding: Mutex::new(Binding::default()),
            inner: Mutex::new(SessionInner {
                tx: None,
                generation: 0,
                open_cursors: 0,
                unrecoverable: false,
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    /// Binds the session to the current thread.  Re-entry from the owning
    /// thread nests; entry from another thread while bound fails without
    /// rolling anything back.
    pub fn bind(&self) -> EngineResult<BindGuard<'_>> {
        let me = thread::current().id();
        let mut b = self.binding.lock();
        match b.owner {
            Some(owner) if owner != me => Err(EngineError::SessionSharingViolation),
            _ => {
                b.owner = Some(me);
                b.depth += 1;
                Ok(BindGuard { session: self })
            }
        }
    }

    pub fn begin_transaction(&self) -> EngineResult<()> {
        let _bound = self.bind()?;
        let mut inner = self.inner.lock();
        if inner.unrecoverable {
            return Err(EngineError::InstanceUnavailable);
        }
        if inner.tx.is_some() {
            return Err(EngineError::SessionContextAlreadySet);
        }
        inner.tx = Some(TxState {
            snapshot: self.kernel.begin_snapshot(),
            writes: BTreeMap::new(),
        });
        Ok(())
    }

    pub fn has_active_transaction(&self) -> bool {
        self.inner.lock().tx.is_some()
    }

    /// Reads through the transaction view (write overlay over snapshot).
    pub fn read(&self, key: &RowKey) -> EngineResult<Option<Row>> {
        let _bound = self.bind()?;
        let inner = self.inner.lock();
        let tx = inner.tx.as_ref().ok_or(EngineError::NoActiveTransaction)?;
        if let Some(overlay) = tx.writes.get(key) {
            return Ok(overlay.clone());
        }
        Ok(self.kernel.read(tx.snapshot, key))
    }

    /// Buffers an upsert.  Early conflict detection: a key already
    /// committed past this transaction's snapshot fails now rather than at
    /// commit.
    pub fn put(&self, key: RowKey, row: Row) -> EngineResult<()> {
        self.write(key, Some(row))
    }

    pub fn remove(&self, key: RowKey) -> EngineResult<()> {
        self.write(key, None)
    }

    fn write(&self, key: RowKey, row: Option<Row>) -> EngineResult<()> {
        let _bound = self.bind()?;
        let mut inner = self.inner.lock();
        let tx = inner.tx.as_mut().ok_or(EngineError::NoActiveTransaction)?;
        if self.kernel.has_newer_version(tx.snapshot, &key) {
            return Err(EngineError::WriteConflict);
        }
        tx.writes.insert(key, row);
        Ok(())
    }

    /// Snapshot version of the active transaction.
    pub fn snapshot(&self) -> EngineResult<Version> {
        let inner = self.inner.lock();
        inner
            .tx
            .as_ref()
            .map(|t| t.snapshot)
            .ok_or(EngineError::NoActiveTransaction)
    }

    /// Copy of the buffered write set, used by cursors to merge the
    /// transaction view into enumerations.
    pub fn write_overlay(&self) -> BTreeMap<RowKey, Option<Row>> {
        self.inner
            .lock()
            .tx
            .as_ref()
            .map(|t| t.writes.clone())
            .unwrap_or_default()
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    pub fn cursor_opened(&self) {
        self.inner.lock().open_cursors += 1;
    }

    pub fn cursor_closed(&self) {
        let mut inner = self.inner.lock();
        inner.open_cursors = inner.open_cursors.saturating_sub(1);
    }

    pub fn open_cursor_count(&self) -> usize {
        self.inner.lock().open_cursors
    }

    pub fn mark_unrecoverable(&self) {
        self.inner.lock().unrecoverable = true;
    }

    pub fn is_unrecoverable(&self) -> bool {
        self.inner.lock().unrecoverable
    }

    /// Lazy commit: appends the write set and returns the commit id without
    /// waiting for durability.  `timeout` bounds the flush delay together
    /// with the engine-wide maximum.
    pub fn commit_lazy(&self, timeout: Option<Duration>) -> EngineResult<CommitId> {
        let _bound = self.bind()?;
        let mut inner = self.inner.lock();
        let tx = inner.tx.take().ok_or(EngineError::NoActiveTransaction)?;
        inner.generation += 1;
        drop(inner);

        let result = self
            .kernel
            .commit(tx.snapshot, tx.writes.into_iter().collect(), timeout);
        self.kernel.end_snapshot(tx.snapshot);
        if let Err(ref e) = result {
            if e.is_fatal() {
                self.mark_unrecoverable();
            }
        }
        result
    }

    /// Durable barrier for a previously issued lazy commit.
    pub fn commit_durable_barrier(&self, commit_id: CommitId) -> EngineResult<()> {
        let _bound = self.bind()?;
        self.kernel.sync_to(commit_id)
    }

    pub fn rollback(&self) -> EngineResult<()> {
        let _bound = self.bind()?;
        let mut inner = self.inner.lock();
        let tx = inner.tx.take().ok_or(EngineError::NoActiveTransaction)?;
        inner.generation += 1;
        drop(inner);
        self.kernel.end_snapshot(tx.snapshot);
        Ok(())
    }

    /// Rollback that tolerates an already-finished transaction; used on all
    /// release paths.
    pub fn rollback_if_active(&self) {
        let _ = self.rollback();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::EngineSettings;

    fn open(dir: &std::path::Path) -> Arc<Kernel> {
        Kernel::open(dir, "store", EngineSettings::default()).unwrap()
    }

    fn row(t: &str, k: &str, v: &[u8]) -> Row {
        Row {
            row_type: t.into(),
            key: k.into(),
            value: v.to_vec(),
            seq: 1,
            lsn: 1,
            modified: 0,
            modified_on_primary: 0,
        }
    }

    #[test]
    fn read_your_writes() {
        let tmp = tempfile::tempdir().unwrap();
        let kernel = open(tmp.path());
        let session = Session::new(kernel.clone());

        session.begin_transaction().unwrap();
        let key = RowKey::new("T", "k");
        assert!(session.read(&key).unwrap().is_none());
        session.put(key.clone(), row("T", "k", &[9])).unwrap();
        assert_eq!(session.read(&key).unwrap().unwrap().value, vec![9]);
        session.remove(key.clone()).unwrap();
        assert!(session.read(&key).unwrap().is_none());
        session.rollback().unwrap();
        kernel.close(false);
    }

    #[test]
    fn foreign_thread_binding_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let kernel = open(tmp.path());
        let session = Session::new(kernel.clone());

        let _guard = session.bind().unwrap();
        // Nested re-entry on the same thread is fine.
        let _nested = session.bind().unwrap();

        let s2 = session.clone();
        let err = std::thread::spawn(move || s2.bind().map(|_| ()))
            .join()
            .unwrap()
            .unwrap_err();
        assert_eq!(err, EngineError::SessionSharingViolation);
        drop(_nested);
        drop(_guard);
        kernel.close(false);
    }

    #[test]
    fn rollback_discards_buffered_writes() {
        let tmp = tempfile::tempdir().unwrap();
        let kernel = open(tmp.path());
        let session = Session::new(kernel.clone());

        session.begin_transaction().unwrap();
        session
            .put(RowKey::new("T", "k"), row("T", "k", &[1]))
            .unwrap();
        session.rollback().unwrap();

        session.begin_transaction().unwrap();
        assert!(session.read(&RowKey::new("T", "k")).unwrap().is_none());
        session.rollback().unwrap();
        kernel.close(false);
    }

    #[test]
    fn commit_makes_rows_visible_to_new_transactions() {
        let tmp = tempfile::tempdir().unwrap();
        let kernel = open(tmp.path());
        let session = Session::new(kernel.clone());

        session.begin_transaction().unwrap();
        session
            .put(RowKey::new("T", "k"), row("T", "k", &[1]))
            .unwrap();
        let id = session.commit_lazy(None).unwrap();
        session.commit_durable_barrier(id).unwrap();

        session.begin_transaction().unwrap();
        assert_eq!(
            session.read(&RowKey::new("T", "k")).unwrap().unwrap().value,
            vec![1]
        );
        session.rollback().unwrap();
        kernel.close(false);
    }
}
