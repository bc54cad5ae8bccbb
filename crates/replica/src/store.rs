//! The replicated store: role transitions, transaction admission, reads,
//! epoch bookkeeping, copy production, and primary-side maintenance.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{info, warn};

use replikv_copier::manager::FileStreamFullCopyManager;
use replikv_copier::CopyContextData;
use replikv_engine::instance::InstanceRegistry;
use replikv_engine::kernel::Row;
use replikv_local_store::{LocalStore, LocalStoreSettings, OpenJobQueue};
use replikv_primitives::epoch::{Epoch, Lsn};
use replikv_primitives::errors::{StoreError, StoreResult};
use replikv_primitives::ids::PartitionedReplicaId;
use replikv_primitives::wire::{OperationMetadata, ReplicationOpKind, ReplicationOperation};

use crate::context::ReplicaContext;
use crate::copy::CopyOperationEnumerator;
use crate::epoch_store;
use crate::events::TxEventHandler;
use crate::fabric_time::FabricTimeController;
use crate::notifications::{NotificationManager, SecondaryEventHandler};
use crate::paths::ReplicaPaths;
use crate::pump::SecondaryPump;
use crate::replicator::TransactionReplicator;
use crate::settings::ReplicatedStoreSettings;
use crate::simple_tx::{SimpleTransaction, SimpleTransactionGroup};
use crate::state_machine::{StateMachine, StoreState};
use crate::tombstone;
use crate::tracker::{TrackedTransaction, TransactionTracker};
use crate::transaction::ReplicatedTransaction;
use crate::transport::StateReplicator;
use crate::well_known;

type GroupSlot = Arc<Mutex<Option<Arc<SimpleTransactionGroup>>>>;

pub struct ReplicatedStore {
    ctx: Arc<ReplicaContext>,
    transport: Arc<dyn StateReplicator>,
    paths: ReplicaPaths,
    notifications: Arc<NotificationManager>,
    archive_manager: Arc<FileStreamFullCopyManager>,
    fabric_time: Arc<FabricTimeController>,
    pump: Mutex<Option<Arc<SecondaryPump>>>,
    current_group: GroupSlot,
    maintenance: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ReplicatedStore {
    /// Opens the replica at `root`: database recovery, state machine open,
    /// and all ambient services.  The replica starts in role None.
    #[allow(clippy::too_many_arguments)]
    pub async fn open(
        root: &Path,
        prid: PartitionedReplicaId,
        settings: ReplicatedStoreSettings,
        local_settings: LocalStoreSettings,
        transport: Arc<dyn StateReplicator>,
        registry: Arc<InstanceRegistry>,
        open_queue: Option<Arc<OpenJobQueue>>,
        secondary_handler: Option<Arc<dyn SecondaryEventHandler>>,
    ) -> StoreResult<Arc<Self>> {
        let paths = ReplicaPaths::new(root, prid.clone());
        fs::create_dir_all(paths.partition_root())?;
        fs::create_dir_all(paths.archive_cache_dir())?;

        let local_settings = LocalStoreSettings {
            enumeration_perf_trace_threshold: settings.enumeration_perf_trace_threshold,
            ..local_settings
        };
        let local_store = LocalStore::open(
            registry.clone(),
            &paths.database_dir(),
            local_settings,
            open_queue.as_ref(),
        )?;

        let state_machine = Arc::new(StateMachine::new());
        state_machine.open()?;

        let replicator = Arc::new(TransactionReplicator::new(transport.clone(), &settings));
        let ctx = ReplicaContext::new(
            prid.clone(),
            settings.clone(),
            registry,
            local_store.clone(),
            replicator,
            state_machine,
        );

        let ctx_weak = Arc::downgrade(&ctx);
        let tracker = TransactionTracker::new(
            settings.transaction_drain_timeout,
            Box::new(move || {
                if let Some(ctx) = ctx_weak.upgrade() {
                    ctx.finish_transaction();
                }
            }),
        );
        ctx.install_tracker(tracker);

        let current_group: GroupSlot = Arc::new(Mutex::new(None));
        {
            let slot = current_group.clone();
            ctx.install_group_flush(Box::new(move || {
                let group = slot.lock().take();
                if let Some(group) = group {
                    group.close();
                }
            }));
        }

        let fabric_time = FabricTimeController::recover(local_store)?;
        let archive_manager = FileStreamFullCopyManager::new(
            ctx.local_store(),
            paths.archive_cache_dir(),
            settings.max_file_stream_full_copy_waiters,
        );
        let notifications =
            NotificationManager::new(settings.secondary_notification_mode, secondary_handler);

        info!(replica = %prid, "replicated store opened");
        Ok(Arc::new(Self {
            ctx,
            transport,
            paths,
            notifications,
            archive_manager,
            fabric_time,
            pump: Mutex::new(None),
            current_group,
            maintenance: Mutex::new(None),
        }))
    }

    pub fn state(&self) -> StoreState {
        self.ctx.state_machine.state()
    }

    pub fn context(&self) -> &Arc<ReplicaContext> {
        &self.ctx
    }

    pub fn paths(&self) -> &ReplicaPaths {
        &self.paths
    }

    pub fn settings(&self) -> &ReplicatedStoreSettings {
        &self.ctx.settings
    }

    /// Installs (or removes) the migration mirror.
    pub fn set_tx_event_handler(&self, handler: Option<Arc<dyn TxEventHandler>>) {
        self.ctx.set_tx_event_handler(handler);
    }

    // ----- role transitions -------------------------------------------------

    pub async fn change_to_primary(self: &Arc<Self>) -> StoreResult<()> {
        let (tx, rx) = oneshot::channel();
        {
            let mut tx = Some(tx);
            self.ctx.state_machine.change_to_primary(move |r| {
                if let Some(tx) = tx.take() {
                    let _ = tx.send(r);
                }
            });
        }
        if let Some(pump) = self.pump.lock().take() {
            pump.cancel();
        }
        rx.await.map_err(|_| StoreError::ObjectClosed)??;

        // A full copy may have rebuilt the database while secondary.
        self.fabric_time.set_store(self.ctx.local_store());
        self.archive_manager.set_local_store(self.ctx.local_store());

        self.fabric_time
            .start(self.ctx.settings.fabric_time_refresh_interval);
        self.start_maintenance();
        info!("replica is now primary");
        Ok(())
    }

    pub async fn change_to_secondary(self: &Arc<Self>) -> StoreResult<()> {
        // Outstanding primary transactions must unwind before the role
        // change completes; the tracker force-releases leaks.
        self.rollback_current_group();
        self.ctx.tracker().start_drain();

        let (tx, rx) = oneshot::channel();
        {
            let mut tx = Some(tx);
            self.ctx.state_machine.change_to_secondary(move |r| {
                if let Some(tx) = tx.take() {
                    let _ = tx.send(r);
                }
            });
        }
        rx.await.map_err(|_| StoreError::ObjectClosed)??;

        self.fabric_time.stop();
        self.stop_maintenance();

        // Snapshot the progress vector from the epoch history.
        {
            let store = self.ctx.local_store();
            let tx = store.create_transaction()?;
            epoch_store::snapshot_progress_vector(&store, &tx)?;
            tx.commit_durable(None)?;
        }

        let pump = SecondaryPump::new(
            self.ctx.clone(),
            self.transport.clone(),
            self.notifications.clone(),
            self.paths.clone(),
        );
        pump.start();
        *self.pump.lock() = Some(pump);
        info!("replica is now secondary");
        Ok(())
    }

    /// Close is idempotent and cooperative: it waits for active
    /// transactions through the state machine, with the tracker drain as a
    /// safety net.
    pub async fn close(self: &Arc<Self>) -> StoreResult<()> {
        self.rollback_current_group();
        self.ctx.tracker().start_drain();

        let (tx, rx) = oneshot::channel();
        {
            let mut tx = Some(tx);
            self.ctx.state_machine.close(move |r| {
                if let Some(tx) = tx.take() {
                    let _ = tx.send(r);
                }
            });
        }
        if let Some(pump) = self.pump.lock().take() {
            pump.cancel();
        }
        rx.await.map_err(|_| StoreError::ObjectClosed)??;

        self.fabric_time.stop();
        self.stop_maintenance();
        self.notifications.drain_and_close().await;
        self.archive_manager.clear();
        self.ctx.tracker().cancel_drain_timer();

        if self.ctx.settings.enable_flush_on_drain {
            let kernel = self.ctx.local_store().instance().kernel().clone();
            let target = kernel.committed_version() as i64;
            let _ = tokio::task::spawn_blocking(move || kernel.sync_to(target)).await;
        }

        self.ctx.local_store().terminate();
        info!("replicated store closed");
        Ok(())
    }

    // ----- transactions -----------------------------------------------------

    pub fn create_transaction(self: &Arc<Self>) -> StoreResult<Arc<ReplicatedTransaction>> {
        self.ctx.state_machine.start_transaction()?;
        let tx = match ReplicatedTransaction::begin(self.ctx.clone()) {
            Ok(tx) => tx,
            Err(e) => {
                self.ctx.finish_transaction();
                return Err(e);
            }
        };
        let tracked: Arc<dyn TrackedTransaction> = tx.clone();
        if !self.ctx.tracker().try_add(&tracked) {
            tx.rollback();
            return Err(StoreError::ReconfigurationPending);
        }
        Ok(tx)
    }

    /// Joins (or opens) the current simple-tx group.
    pub fn create_simple_transaction(self: &Arc<Self>) -> StoreResult<Arc<SimpleTransaction>> {
        self.ctx.state_machine.start_transaction()?;

        let result = (|| -> StoreResult<Arc<SimpleTransaction>> {
            loop {
                if self.ctx.replicator.is_throttled() {
                    // Pressure from the transport queue: close out the open
                    // group early, once it carries a worthwhile batch.
                    let close = self
                        .current_group
                        .lock()
                        .as_ref()
                        .is_some_and(|g| {
                            g.member_count() >= self.ctx.settings.transaction_low_watermark
                        });
                    if close {
                        if let Some(group) = self.current_group.lock().take() {
                            group.close();
                        }
                    }
                }

                let existing = self.current_group.lock().clone();
                let group = match existing {
                    Some(group) => group,
                    None => {
                        let group = SimpleTransactionGroup::create(
                            self.ctx.clone(),
                            self.current_group.clone(),
                        )?;
                        *self.current_group.lock() = Some(group.clone());
                        self.spawn_group_timer(&group);
                        group
                    }
                };

                if let Some(tx) = group.create_simple_transaction(self.ctx.clone()) {
                    let tracked: Arc<dyn TrackedTransaction> = tx.clone();
                    if !self.ctx.tracker().try_add(&tracked) {
                        return Err(StoreError::ReconfigurationPending);
                    }
                    return Ok(tx);
                }

                // Group was closed, rolled back, or full: retire it and
                // retry with a fresh one.
                let mut slot = self.current_group.lock();
                if slot
                    .as_ref()
                    .is_some_and(|current| Arc::ptr_eq(current, &group))
                {
                    *slot = None;
                    drop(slot);
                    group.close();
                }
            }
        })();

        if result.is_err() {
            self.ctx.finish_transaction();
        }
        result
    }

    fn spawn_group_timer(self: &Arc<Self>, group: &Arc<SimpleTransactionGroup>) {
        let period = self.ctx.settings.commit_batching_period;
        let slot = self.current_group.clone();
        let group = group.clone();
        tokio::spawn(async move {
            tokio::time::sleep(period).await;
            let take = {
                let mut slot = slot.lock();
                if slot
                    .as_ref()
                    .is_some_and(|current| Arc::ptr_eq(current, &group))
                {
                    *slot = None;
                    true
                } else {
                    false
                }
            };
            if take {
                group.close();
            }
        });
    }

    fn rollback_current_group(&self) {
        if let Some(group) = self.current_group.lock().take() {
            group.rollback(group.group_activity());
        }
    }

    // ----- reads ------------------------------------------------------------

    pub fn get(&self, row_type: &str, key: &str) -> StoreResult<Option<Row>> {
        if self.ctx.state_machine.is_closed() {
            return Err(StoreError::ObjectClosed);
        }
        let store = self.ctx.local_store();
        let tx = store.create_transaction()?;
        let row = store.get(&tx, row_type, key)?;
        tx.rollback();
        Ok(row)
    }

    /// Rows of `row_type` whose key starts with `key_prefix`.
    pub fn enumerate(&self, row_type: &str, key_prefix: &str) -> StoreResult<Vec<Row>> {
        if self.ctx.state_machine.is_closed() {
            return Err(StoreError::ObjectClosed);
        }
        let store = self.ctx.local_store();
        let tx = store.create_transaction()?;
        let mut rows = Vec::new();
        let mut scan = store.enumerate_by_type_and_key(&tx, row_type, key_prefix, true)?;
        while let Some(row) = scan.move_next()? {
            if row.key.starts_with(key_prefix) {
                rows.push(row);
            } else {
                break;
            }
        }
        drop(scan);
        tx.rollback();
        Ok(rows)
    }

    /// Change stream: every live row (data and tombstones) with
    /// `lsn >= from`, in LSN order.
    pub fn enumerate_changes(&self, from: Lsn) -> StoreResult<Vec<Row>> {
        let store = self.ctx.local_store();
        let tx = store.create_transaction()?;
        let mut rows = Vec::new();
        let mut scan = store.enumerate_by_lsn(&tx, from)?;
        while let Some(row) = scan.move_next()? {
            if !well_known::is_copy_excluded(&row.row_type) {
                rows.push(row);
            }
        }
        drop(scan);
        tx.rollback();
        Ok(rows)
    }

    pub fn last_committed_lsn(&self) -> StoreResult<Lsn> {
        let store = self.ctx.local_store();
        let tx = store.create_transaction()?;
        let lsn = store.last_change_lsn(&tx)?;
        tx.rollback();
        Ok(lsn)
    }

    pub fn current_epoch(&self) -> StoreResult<Option<Epoch>> {
        let store = self.ctx.local_store();
        let tx = store.create_transaction()?;
        let epoch = epoch_store::read_current_epoch(&store, &tx)?;
        tx.rollback();
        Ok(epoch)
    }

    /// Logical clock reading; ticks on each call.
    pub fn fabric_time(&self) -> i64 {
        self.fabric_time.current_time()
    }

    // ----- epoch plumbing ---------------------------------------------------

    /// Routed from the transport: append to epoch history and replace the
    /// current epoch, atomically and durably.  Rejects non-increasing
    /// epochs.
    pub fn update_epoch(&self, epoch: Epoch, previous_epoch_last_lsn: Lsn) -> StoreResult<()> {
        if self.ctx.state_machine.is_closed() {
            return Err(StoreError::ObjectClosed);
        }
        let store = self.ctx.local_store();
        let tx = store.create_transaction()?;
        epoch_store::apply_epoch_update(&store, &tx, epoch, previous_epoch_last_lsn)?;
        tx.commit_durable(None)?;
        info!(%epoch, previous_epoch_last_lsn, "epoch updated");
        Ok(())
    }

    /// Recovery hook: a replay starting below a progress-vector boundary
    /// truncates that entry and everything above it.
    pub fn notify_recovery(&self, replay_lsn: Lsn) -> StoreResult<bool> {
        let store = self.ctx.local_store();
        let tx = store.create_transaction()?;
        let truncated =
            epoch_store::truncate_progress_vector_on_recovery(&store, &tx, replay_lsn)?;
        if truncated {
            tx.commit_durable(None)?;
        } else {
            tx.rollback();
        }
        Ok(truncated)
    }

    // ----- copy -------------------------------------------------------------

    /// The secondary's half of the copy handshake.
    pub fn get_copy_context(&self) -> StoreResult<CopyContextData> {
        let last_lsn = self.last_committed_lsn()?;
        let epoch = self.current_epoch()?;
        Ok(CopyContextData::new(
            format!("{}", self.ctx.prid),
            epoch,
            last_lsn,
            self.ctx.prid.replica(),
        ))
    }

    /// Builds the copy stream for a joining secondary (primary side).
    pub async fn create_copy_enumerator(
        &self,
        copy_context: CopyContextData,
    ) -> StoreResult<CopyOperationEnumerator> {
        let up_to_lsn = self
            .last_committed_lsn()?
            .max(self.ctx.replicator.last_replicated_lsn());
        CopyOperationEnumerator::create(
            self.ctx.clone(),
            copy_context,
            up_to_lsn,
            self.archive_manager.clone(),
        )
        .await
    }

    pub fn archive_manager(&self) -> &Arc<FileStreamFullCopyManager> {
        &self.archive_manager
    }

    // ----- maintenance ------------------------------------------------------

    fn start_maintenance(self: &Arc<Self>) {
        let mut maintenance = self.maintenance.lock();
        if maintenance.is_some() {
            return;
        }
        let this = Arc::downgrade(self);
        let interval = self.ctx.settings.log_truncation_interval;
        *maintenance = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(store) = this.upgrade() else { return };
                if !store.state().is_primary() {
                    return;
                }
                if let Err(e) = store.run_maintenance_pass().await {
                    warn!(err = %e, "maintenance pass failed");
                }
            }
        }));
    }

    fn stop_maintenance(&self) {
        if let Some(task) = self.maintenance.lock().take() {
            task.abort();
        }
    }

    /// One maintenance pass: tombstone cleanup (replicating the new low
    /// watermark) and log truncation via checkpoint.
    pub async fn run_maintenance_pass(self: &Arc<Self>) -> StoreResult<()> {
        self.run_tombstone_cleanup().await?;
        let kernel = self.ctx.local_store().instance().kernel().clone();
        tokio::task::spawn_blocking(move || kernel.checkpoint())
            .await
            .map_err(|e| StoreError::Unexpected(format!("checkpoint task: {e}")))?
            .map_err(replikv_engine::error::engine_to_store_error)?;
        Ok(())
    }

    /// Advances the low watermark, replicates it, and reclaims local
    /// tombstones below it.  Holds the low-watermark write lock against
    /// in-flight logical copies.
    pub async fn run_tombstone_cleanup(self: &Arc<Self>) -> StoreResult<usize> {
        if !self.state().is_primary() {
            return Err(StoreError::NotPrimary);
        }
        let _guard = self.ctx.low_watermark_lock.clone().write_owned().await;

        let store = self.ctx.local_store();
        let last_lsn = self.last_committed_lsn()?;
        let target = last_lsn - self.ctx.settings.tombstone_retention_lsns;
        if target <= 0 {
            return Ok(0);
        }
        {
            let tx = store.create_transaction()?;
            let current = tombstone::read_low_watermark(&store, &tx)?;
            tx.rollback();
            if target <= current {
                return Ok(0);
            }
        }

        // Secondaries learn the new watermark through the replication
        // stream before the primary prunes.
        let op = ReplicationOperation {
            kind: ReplicationOpKind::TombstoneLowWatermark,
            row_type: well_known::TYPE_LOW_WATERMARK.into(),
            key: well_known::SINGLETON_KEY.into(),
            new_key: None,
            value: None,
            lsn: target,
            modified_on_primary: 0,
        };
        let metadata = OperationMetadata::Replication { lsn: 0 }.encode();
        let data = replikv_primitives::wire::encode_operations(std::slice::from_ref(&op));
        self.ctx
            .replicator
            .replicate_payload(metadata, vec![data])
            .await?;

        let tx = store.create_transaction()?;
        let reclaimed = tombstone::cleanup_tombstones(
            &store,
            &tx,
            self.ctx.settings.enable_tombstone_cleanup2,
            last_lsn,
            self.ctx.settings.tombstone_retention_lsns,
        )?;
        tx.commit_durable(None)?;
        Ok(reclaimed)
    }
}
