//! Simple transactions and their commit-batching groups.
//!
//! A group aggregates many small transactions over one shared engine
//! transaction.  The last member to commit after the group closes fires
//! one aggregate replication; completions post with a deliberate delay so
//! the engine releases its commit slot before the next group can observe
//! uncommitted state.  Any member rollback rolls back the whole group.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use replikv_local_store::StoreTransaction;
use replikv_primitives::epoch::Lsn;
use replikv_primitives::errors::{StoreError, StoreResult};
use replikv_primitives::ids::{ActivityId, TrackerId};
use replikv_primitives::time::utc_now;
use replikv_primitives::wire::ReplicationOperation;

use crate::context::ReplicaContext;
use crate::tracker::TrackedTransaction;

type GroupSlot = Arc<Mutex<Option<Arc<SimpleTransactionGroup>>>>;
type CommitSender = oneshot::Sender<StoreResult<Lsn>>;

struct GroupState {
    /// `(type, key)` staged so far, with the staging member's activity id.
    replication_map: HashMap<(String, String), ActivityId>,
    operations: Vec<ReplicationOperation>,
    replication_size: usize,
    /// One slot per joined member; filled at that member's commit.
    commit_map: HashMap<ActivityId, Option<CommitSender>>,
    committed_count: usize,
    closed: bool,
    rolled_back: bool,
}

pub struct SimpleTransactionGroup {
    ctx: Arc<ReplicaContext>,
    group_activity: ActivityId,
    migration_tx_key: u64,
    slot: GroupSlot,
    inner: Mutex<Option<StoreTransaction>>,
    state: Mutex<GroupState>,
    commit_started: AtomicBool,
}

impl SimpleTransactionGroup {
    pub(crate) fn create(ctx: Arc<ReplicaContext>, slot: GroupSlot) -> StoreResult<Arc<Self>> {
        let inner = ctx.local_store().create_transaction()?;
        let group_activity = ActivityId::next();
        let migration_tx_key = TrackerId::next().get();
        if let Some(handler) = ctx.tx_event_handler() {
            handler.on_create_transaction(group_activity, migration_tx_key);
        }
        debug!(group = %group_activity, "simple transaction group opened");
        Ok(Arc::new(Self {
            ctx,
            group_activity,
            migration_tx_key,
            slot,
            inner: Mutex::new(Some(inner)),
            state: Mutex::new(GroupState {
                replication_map: HashMap::new(),
                operations: Vec::new(),
                replication_size: 0,
                commit_map: HashMap::new(),
                committed_count: 0,
                closed: false,
                rolled_back: false,
            }),
            commit_started: AtomicBool::new(false),
        }))
    }

    pub fn group_activity(&self) -> ActivityId {
        self.group_activity
    }

    pub fn migration_tx_key(&self) -> u64 {
        self.migration_tx_key
    }

    fn can_create_transaction(&self, size_limit: usize) -> bool {
        let state = self.state.lock();
        !(state.rolled_back || state.closed || state.replication_size > size_limit)
    }

    /// Joins a new member, or refuses when the group is closed, rolled
    /// back, or past its batch limit.
    pub(crate) fn create_simple_transaction(
        self: &Arc<Self>,
        ctx: Arc<ReplicaContext>,
    ) -> Option<Arc<SimpleTransaction>> {
        if !self.can_create_transaction(ctx.settings.commit_batching_size_limit) {
            return None;
        }
        let activity = ActivityId::next();
        let mut state = self.state.lock();
        if state.rolled_back || state.closed {
            return None;
        }
        if state.commit_map.len() >= ctx.settings.transaction_high_watermark {
            // Batching window full; the caller opens a fresh group.
            return None;
        }
        state.commit_map.insert(activity, None);
        debug!(
            group = %self.group_activity,
            member = %activity,
            total = state.commit_map.len(),
            "simple transaction joined"
        );
        drop(state);
        Some(Arc::new(SimpleTransaction {
            ctx,
            group: self.clone(),
            tracker_id: TrackerId::next(),
            activity,
            finished: AtomicBool::new(false),
            resolved: AtomicBool::new(false),
        }))
    }

    /// Stages one operation: conflict check against foreign members, the
    /// local engine write, then the record.  Serialized by the group lock.
    fn stage(
        &self,
        activity: ActivityId,
        operation: ReplicationOperation,
        local_write: impl FnOnce(&StoreTransaction) -> StoreResult<()>,
    ) -> StoreResult<()> {
        let mut state = self.state.lock();
        if state.rolled_back {
            return Err(StoreError::OperationCanceled);
        }

        let pair = (operation.row_type.clone(), operation.key.clone());
        if let Some(existing) = state.replication_map.get(&pair) {
            if *existing != activity {
                warn!(
                    group = %self.group_activity,
                    member = %activity,
                    holder = %existing,
                    row_type = %pair.0,
                    key = %pair.1,
                    "write conflict inside simple transaction group"
                );
                return Err(StoreError::WriteConflict);
            }
            // Same member restaging the same key: apply the write, keep the
            // newest record.
            {
                let inner = self.inner.lock();
                let tx = inner.as_ref().ok_or(StoreError::TransactionNotActive)?;
                local_write(tx)?;
            }
            state.replication_size += operation.size();
            if let Some(slot) = state
                .operations
                .iter_mut()
                .find(|op| op.row_type == pair.0 && op.key == pair.1)
            {
                *slot = operation;
            }
            return Ok(());
        }

        {
            let inner = self.inner.lock();
            let tx = inner.as_ref().ok_or(StoreError::TransactionNotActive)?;
            local_write(tx)?;
        }

        state.replication_map.insert(pair, activity);
        state.replication_size += operation.size();
        state.operations.push(operation);
        Ok(())
    }

    pub fn is_batch_limit_exceeded(&self) -> bool {
        self.state.lock().replication_size > self.ctx.settings.commit_batching_size_limit
    }

    pub fn member_count(&self) -> usize {
        self.state.lock().commit_map.len()
    }

    /// Closes the group to new members; commits once every member has
    /// committed.
    pub fn close(self: &Arc<Self>) {
        let (do_commit, empty) = {
            let mut state = self.state.lock();
            state.closed = true;
            let do_commit = !state.rolled_back
                && state.committed_count == state.commit_map.len()
                && state.committed_count > 0;
            (do_commit, state.commit_map.is_empty())
        };
        if do_commit {
            self.begin_commit();
        } else if empty {
            // Nothing joined (or every member abandoned): just release.
            self.release_inner_transaction();
            self.clear_slot();
        }
    }

    /// Removes a member that never committed (conflict, early drop); the
    /// rest of the group is unaffected.
    pub(crate) fn abandon(self: &Arc<Self>, activity: ActivityId) {
        let (do_commit, empty_after_close) = {
            let mut state = self.state.lock();
            if state.rolled_back {
                return;
            }
            if let Some(Some(_)) = state.commit_map.get(&activity) {
                // Already committed; completion will resolve it.
                return;
            }
            state.commit_map.remove(&activity);
            let do_commit = state.closed
                && state.committed_count == state.commit_map.len()
                && state.committed_count > 0;
            (do_commit, state.closed && state.commit_map.is_empty())
        };
        if do_commit {
            self.begin_commit();
        } else if empty_after_close {
            self.release_inner_transaction();
            self.clear_slot();
        }
    }

    fn clear_slot(self: &Arc<Self>) {
        let mut slot = self.slot.lock();
        if slot
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, self))
        {
            *slot = None;
        }
    }

    fn add_commit_waiter(
        self: &Arc<Self>,
        activity: ActivityId,
        sender: CommitSender,
    ) -> StoreResult<()> {
        let (do_commit, cancel) = {
            let mut state = self.state.lock();
            if state.rolled_back {
                (false, Some(sender))
            } else {
                let slot = state
                    .commit_map
                    .get_mut(&activity)
                    .ok_or_else(|| StoreError::Unexpected("unknown simple tx".into()))?;
                debug_assert!(slot.is_none(), "duplicate commit on simple tx");
                *slot = Some(sender);
                state.committed_count += 1;
                let ready = state.closed
                    && state.committed_count == state.commit_map.len()
                    && state.committed_count > 0;
                (ready, None)
            }
        };

        if let Some(sender) = cancel {
            let _ = sender.send(Err(StoreError::OperationCanceled));
        } else if do_commit {
            self.begin_commit();
        }
        Ok(())
    }

    fn begin_commit(self: &Arc<Self>) {
        if self.commit_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            let result = this.commit_inner().await;
            this.post_completions(result).await;
        });
    }

    async fn commit_inner(self: &Arc<Self>) -> StoreResult<Lsn> {
        let operations: Vec<ReplicationOperation> = {
            let mut state = self.state.lock();
            state.replication_size = 0;
            std::mem::take(&mut state.operations)
        };

        if operations.is_empty() {
            return Ok(0);
        }

        info!(
            group = %self.group_activity,
            ops = operations.len(),
            "committing simple transaction group"
        );

        let lsn = self.ctx.replicator.replicate(&operations).await?;

        if let Some(handler) = self.ctx.tx_event_handler() {
            handler.on_commit(self.group_activity, self.migration_tx_key)?;
        }

        let (commit_id, waiter) = {
            let inner = self.inner.lock();
            let tx = inner.as_ref().ok_or(StoreError::TransactionNotActive)?;
            self.ctx.stamp_committed_operations(tx, &operations, lsn)?;
            tx.commit_async(None)?
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

    /// Completes the joined members after a deliberate delay so the engine
    /// commit slot is released before a successor group starts.
    async fn post_completions(self: &Arc<Self>, result: StoreResult<Lsn>) {
        let waiters: Vec<CommitSender> = {
            let mut state = self.state.lock();
            state.commit_map.drain().filter_map(|(_, w)| w).collect()
        };

        self.release_inner_transaction();

        tokio::time::sleep(self.ctx.settings.commit_batching_period).await;

        {
            let mut slot = self.slot.lock();
            if slot
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, self))
            {
                *slot = None;
            }
        }

        debug!(
            group = %self.group_activity,
            waiters = waiters.len(),
            ok = result.is_ok(),
            "simple transaction group completed"
        );
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }

    fn release_inner_transaction(&self) {
        if let Some(tx) = self.inner.lock().take() {
            tx.rollback();
        }
    }

    /// Rolls back the entire group; every member completes with
    /// `OperationCanceled`.
    pub fn rollback(self: &Arc<Self>, by: ActivityId) {
        let waiters: Vec<CommitSender> = {
            let mut state = self.state.lock();
            if state.rolled_back {
                return;
            }
            state.rolled_back = true;
            state.closed = true;
            state.commit_map.drain().filter_map(|(_, w)| w).collect()
        };

        info!(group = %self.group_activity, member = %by, "simple transaction group rolled back");
        self.release_inner_transaction();

        {
            let mut slot = self.slot.lock();
            if slot
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, self))
            {
                *slot = None;
            }
        }

        for waiter in waiters {
            let _ = waiter.send(Err(StoreError::OperationCanceled));
        }
    }

    fn force_release(&self) -> bool {
        match self.inner.lock().as_ref() {
            Some(tx) => tx.force_release(),
            None => false,
        }
    }
}

impl Drop for SimpleTransactionGroup {
    fn drop(&mut self) {
        if let Some(handler) = self.ctx.tx_event_handler() {
            handler.on_release_transaction(self.group_activity, self.migration_tx_key);
        }
    }
}

/// One member of a group.
pub struct SimpleTransaction {
    ctx: Arc<ReplicaContext>,
    group: Arc<SimpleTransactionGroup>,
    tracker_id: TrackerId,
    activity: ActivityId,
    finished: AtomicBool,
    /// Set once commit or rollback resolved; a drop without either
    /// abandons this member's slot in the group.
    resolved: AtomicBool,
}

impl SimpleTransaction {
    pub fn tracker_id(&self) -> TrackerId {
        self.tracker_id
    }

    pub fn activity_id(&self) -> ActivityId {
        self.activity
    }

    pub fn insert(&self, row_type: &str, key: &str, value: &[u8]) -> StoreResult<()> {
        let op = ReplicationOperation::insert(row_type, key, value.to_vec(), utc_now());
        let ctx = self.ctx.clone();
        let tx_key = self.group.migration_tx_key();
        let (t, k, v) = (row_type.to_string(), key.to_string(), value.to_vec());
        self.group.stage(self.activity, op, move |tx| {
            ctx.local_store().insert(tx, &t, &k, &v, 0, Some(utc_now()))?;
            if let Some(handler) = ctx.tx_event_handler() {
                handler.on_insert(tx_key, &t, &k, &v)?;
            }
            Ok(())
        })
    }

    pub fn update(
        &self,
        row_type: &str,
        key: &str,
        check_seq: i64,
        value: &[u8],
    ) -> StoreResult<()> {
        let op =
            ReplicationOperation::update(row_type, key, None, value.to_vec(), utc_now());
        let ctx = self.ctx.clone();
        let tx_key = self.group.migration_tx_key();
        let (t, k, v) = (row_type.to_string(), key.to_string(), value.to_vec());
        self.group.stage(self.activity, op, move |tx| {
            ctx.local_store()
                .update(tx, &t, &k, check_seq, None, Some(&v), 0, Some(utc_now()))?;
            if let Some(handler) = ctx.tx_event_handler() {
                handler.on_update(tx_key, &t, &k, &v)?;
            }
            Ok(())
        })
    }

    pub fn delete(&self, row_type: &str, key: &str, check_seq: i64) -> StoreResult<()> {
        let op = ReplicationOperation::delete(row_type, key);
        let ctx = self.ctx.clone();
        let tx_key = self.group.migration_tx_key();
        let (t, k) = (row_type.to_string(), key.to_string());
        self.group.stage(self.activity, op, move |tx| {
            ctx.local_store().delete(tx, &t, &k, check_seq)?;
            if let Some(handler) = ctx.tx_event_handler() {
                handler.on_delete(tx_key, &t, &k)?;
            }
            Ok(())
        })
    }

    /// Commits this member; resolves once the whole group commits (or
    /// cancels).
    pub async fn commit(&self) -> StoreResult<Lsn> {
        let (sender, receiver) = oneshot::channel();
        self.group.add_commit_waiter(self.activity, sender)?;
        self.resolved.store(true, Ordering::SeqCst);

        let result = receiver
            .await
            .map_err(|_| StoreError::ObjectClosed)
            .and_then(|r| r);
        self.finish_once();
        result
    }

    /// Rolls back the entire group.
    pub fn rollback(&self) {
        self.resolved.store(true, Ordering::SeqCst);
        self.group.rollback(self.activity);
        self.finish_once();
    }

    fn finish_once(&self) {
        if !self.finished.swap(true, Ordering::SeqCst) {
            self.ctx.finish_transaction();
            self.ctx.tracker().remove(self.tracker_id);
        }
    }
}

impl std::fmt::Debug for SimpleTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimpleTransaction")
            .field("tracker_id", &self.tracker_id)
            .field("activity", &self.activity)
            .finish_non_exhaustive()
    }
}

impl TrackedTransaction for SimpleTransaction {
    fn tracker_id(&self) -> TrackerId {
        self.tracker_id
    }

    fn force_release_inner(&self) -> bool {
        let released = self.group.force_release();
        released && !self.finished.swap(true, Ordering::SeqCst)
    }
}

impl Drop for SimpleTransaction {
    fn drop(&mut self) {
        if !self.resolved.load(Ordering::SeqCst) {
            // Abandoned member (conflict, early drop): leave the group so
            // the remaining members can still commit.
            self.group.abandon(self.activity);
        }
        if !self.finished.swap(true, Ordering::SeqCst) {
            self.ctx.finish_transaction();
            self.ctx.tracker().remove(self.tracker_id);
        }
    }
}
