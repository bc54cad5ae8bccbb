//! Regular replicated transactions on the primary.
//!
//! User mutations apply to the engine session immediately (reads observe
//! the transaction's own writes, sequence checks run against the session
//! view) while a parallel list of replication operations accumulates.  At
//! commit the operations replicate first; the assigned LSN is then stamped
//! onto every touched row before the engine commit goes durable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use replikv_engine::kernel::Row;
use replikv_local_store::StoreTransaction;
use replikv_primitives::epoch::Lsn;
use replikv_primitives::errors::{StoreError, StoreResult};
use replikv_primitives::ids::{ActivityId, TrackerId};
use replikv_primitives::time::utc_now;
use replikv_primitives::wire::ReplicationOperation;

use crate::context::ReplicaContext;
use crate::tracker::TrackedTransaction;

pub struct ReplicatedTransaction {
    ctx: Arc<ReplicaContext>,
    tracker_id: TrackerId,
    activity_id: ActivityId,
    inner: Mutex<Option<StoreTransaction>>,
    operations: Mutex<Vec<ReplicationOperation>>,
    finished: AtomicBool,
}

impl ReplicatedTransaction {
    pub(crate) fn begin(ctx: Arc<ReplicaContext>) -> StoreResult<Arc<Self>> {
        let inner = ctx.local_store().create_transaction()?;
        let tracker_id = TrackerId::next();
        let activity_id = ActivityId::next();
        if let Some(handler) = ctx.tx_event_handler() {
            handler.on_create_transaction(activity_id, tracker_id.get());
        }
        Ok(Arc::new(Self {
            ctx,
            tracker_id,
            activity_id,
            inner: Mutex::new(Some(inner)),
            operations: Mutex::new(Vec::new()),
            finished: AtomicBool::new(false),
        }))
    }

    pub fn tracker_id(&self) -> TrackerId {
        self.tracker_id
    }

    pub fn activity_id(&self) -> ActivityId {
        self.activity_id
    }

    fn with_inner<T>(&self, f: impl FnOnce(&StoreTransaction) -> StoreResult<T>) -> StoreResult<T> {
        let guard = self.inner.lock();
        let tx = guard.as_ref().ok_or(StoreError::TransactionNotActive)?;
        f(tx)
    }

    pub fn insert(&self, row_type: &str, key: &str, value: &[u8]) -> StoreResult<()> {
        self.with_inner(|tx| {
            self.ctx
                .local_store()
                .insert(tx, row_type, key, value, 0, Some(utc_now()))?;
            if let Some(handler) = self.ctx.tx_event_handler() {
                handler.on_insert(self.tracker_id.get(), row_type, key, value)?;
            }
            self.operations.lock().push(ReplicationOperation::insert(
                row_type,
                key,
                value.to_vec(),
                utc_now(),
            ));
            Ok(())
        })
    }

    pub fn update(
        &self,
        row_type: &str,
        key: &str,
        check_seq: i64,
        new_key: Option<&str>,
        value: &[u8],
    ) -> StoreResult<()> {
        self.with_inner(|tx| {
            self.ctx.local_store().update(
                tx,
                row_type,
                key,
                check_seq,
                new_key,
                Some(value),
                0,
                Some(utc_now()),
            )?;
            if let Some(handler) = self.ctx.tx_event_handler() {
                handler.on_update(self.tracker_id.get(), row_type, key, value)?;
            }
            self.operations.lock().push(ReplicationOperation::update(
                row_type,
                key,
                new_key.map(str::to_string),
                value.to_vec(),
                utc_now(),
            ));
            Ok(())
        })
    }

    pub fn delete(&self, row_type: &str, key: &str, check_seq: i64) -> StoreResult<()> {
        self.with_inner(|tx| {
            self.ctx.local_store().delete(tx, row_type, key, check_seq)?;
            if let Some(handler) = self.ctx.tx_event_handler() {
                handler.on_delete(self.tracker_id.get(), row_type, key)?;
            }
            self.operations
                .lock()
                .push(ReplicationOperation::delete(row_type, key));
            Ok(())
        })
    }

    pub fn get(&self, row_type: &str, key: &str) -> StoreResult<Option<Row>> {
        self.with_inner(|tx| self.ctx.local_store().get(tx, row_type, key))
    }

    /// Commits: replicate, stamp rows at the assigned LSN, engine commit,
    /// durability, then flush the open simple-tx group.
    pub async fn commit(self: &Arc<Self>, timeout: Option<Duration>) -> StoreResult<Lsn> {
        let operations = std::mem::take(&mut *self.operations.lock());

        if operations.is_empty() {
            self.release(false);
            return Ok(0);
        }

        let result = self.commit_inner(operations, timeout).await;
        match &result {
            Ok(lsn) => debug!(tracker = %self.tracker_id, lsn, "transaction committed"),
            Err(_) => self.rollback_inner_only(),
        }
        self.finish_once();
        self.ctx.tracker().remove(self.tracker_id);
        if result.is_ok() {
            self.ctx.flush_simple_transaction_group();
        }
        result
    }

    async fn commit_inner(
        &self,
        operations: Vec<ReplicationOperation>,
        timeout: Option<Duration>,
    ) -> StoreResult<Lsn> {
        let lsn = self.ctx.replicator.replicate(&operations).await?;

        if let Some(handler) = self.ctx.tx_event_handler() {
            handler.on_commit(self.activity_id, self.tracker_id.get())?;
        }

        let (commit_id, waiter) = {
            let guard = self.inner.lock();
            let tx = guard.as_ref().ok_or(StoreError::TransactionNotActive)?;
            self.ctx.stamp_committed_operations(tx, &operations, lsn)?;
            tx.commit_async(timeout)?
        };

        if self.ctx.replicator.should_flush(lsn, false) {
            let kernel = self.ctx.local_store().instance().kernel().clone();
            let sync = tokio::task::spawn_blocking(move || kernel.sync_to(commit_id))
                .await
                .map_err(|e| StoreError::Unexpected(format!("flush task: {e}")))?;
            sync.map_err(replikv_engine::error::engine_to_store_error)?;
            self.ctx.replicator.mark_flushed(lsn);
        }

        waiter
            .await
            .map_err(|_| StoreError::ObjectClosed)
            .and_then(|r| r)?;
        Ok(lsn)
    }

    pub fn rollback(&self) {
        self.rollback_inner_only();
        self.finish_once();
        self.ctx.tracker().remove(self.tracker_id);
    }

    fn rollback_inner_only(&self) {
        if let Some(tx) = self.inner.lock().take() {
            tx.rollback();
        }
    }

    fn release(&self, had_error: bool) {
        let _ = had_error;
        self.rollback_inner_only();
        self.finish_once();
        self.ctx.tracker().remove(self.tracker_id);
    }

    fn finish_once(&self) {
        if !self.finished.swap(true, Ordering::SeqCst) {
            self.ctx.finish_transaction();
        }
    }
}

impl std::fmt::Debug for ReplicatedTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatedTransaction")
            .field("tracker_id", &self.tracker_id)
            .field("activity_id", &self.activity_id)
            .finish_non_exhaustive()
    }
}

impl TrackedTransaction for ReplicatedTransaction {
    fn tracker_id(&self) -> TrackerId {
        self.tracker_id
    }

    fn force_release_inner(&self) -> bool {
        let released = match self.inner.lock().as_ref() {
            Some(tx) => tx.force_release(),
            None => false,
        };
        released && !self.finished.swap(true, Ordering::SeqCst)
    }
}

impl Drop for ReplicatedTransaction {
    fn drop(&mut self) {
        // Unreleased transactions roll back; the state-machine event fires
        // exactly once.
        self.rollback_inner_only();
        if !self.finished.swap(true, Ordering::SeqCst) {
            self.ctx.finish_transaction();
            self.ctx.tracker().remove(self.tracker_id);
        }
        if let Some(handler) = self.ctx.tx_event_handler() {
            handler.on_release_transaction(self.activity_id, self.tracker_id.get());
        }
    }
}
