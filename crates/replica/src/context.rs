//! Shared per-replica context threaded through transactions, groups, the
//! pump, and the copy manager.

use std::sync::atomic::AtomicU64;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use tokio::sync::RwLock as AsyncRwLock;

use replikv_engine::instance::InstanceRegistry;
use replikv_local_store::{LocalStore, StoreTransaction};
use replikv_primitives::epoch::Lsn;
use replikv_primitives::errors::StoreResult;
use replikv_primitives::ids::PartitionedReplicaId;
use replikv_primitives::wire::{ReplicationOpKind, ReplicationOperation};

use crate::events::TxEventHandler;
use crate::replicator::TransactionReplicator;
use crate::settings::ReplicatedStoreSettings;
use crate::state_machine::StateMachine;
use crate::tombstone;
use crate::tracker::TransactionTracker;

pub struct ReplicaContext {
    pub prid: PartitionedReplicaId,
    pub settings: ReplicatedStoreSettings,
    pub registry: Arc<InstanceRegistry>,
    /// Swapped wholesale when a full copy replaces the database.
    local_store: RwLock<Arc<LocalStore>>,
    pub replicator: Arc<TransactionReplicator>,
    pub state_machine: Arc<StateMachine>,
    pub tombstone_index: AtomicU64,
    /// Read-held by logical copy enumerations, write-held by tombstone
    /// cleanup so in-flight copies never lose expected rows.
    pub low_watermark_lock: Arc<AsyncRwLock<()>>,
    tracker: OnceLock<Arc<TransactionTracker>>,
    /// Set by the store: closes the open simple-tx group so later readers
    /// observe their predecessors.
    group_flush: OnceLock<Box<dyn Fn() + Send + Sync>>,
    /// Migration mirror; absent outside migration.
    tx_event_handler: RwLock<Option<Arc<dyn TxEventHandler>>>,
}

impl ReplicaContext {
    pub fn new(
        prid: PartitionedReplicaId,
        settings: ReplicatedStoreSettings,
        registry: Arc<InstanceRegistry>,
        local_store: Arc<LocalStore>,
        replicator: Arc<TransactionReplicator>,
        state_machine: Arc<StateMachine>,
    ) -> Arc<Self> {
        Arc::new(Self {
            prid,
            settings,
            registry,
            local_store: RwLock::new(local_store),
            replicator,
            state_machine,
            tombstone_index: AtomicU64::new(0),
            low_watermark_lock: Arc::new(AsyncRwLock::new(())),
            tracker: OnceLock::new(),
            group_flush: OnceLock::new(),
            tx_event_handler: RwLock::new(None),
        })
    }

    pub fn local_store(&self) -> Arc<LocalStore> {
        self.local_store.read().clone()
    }

    /// Installs the rebuilt store after a full copy swap.
    pub fn set_local_store(&self, store: Arc<LocalStore>) {
        *self.local_store.write() = store;
    }

    pub fn set_tx_event_handler(&self, handler: Option<Arc<dyn TxEventHandler>>) {
        *self.tx_event_handler.write() = handler;
    }

    pub fn tx_event_handler(&self) -> Option<Arc<dyn TxEventHandler>> {
        self.tx_event_handler.read().clone()
    }

    pub fn install_tracker(&self, tracker: Arc<TransactionTracker>) {
        let _ = self.tracker.set(tracker);
    }

    pub fn tracker(&self) -> &Arc<TransactionTracker> {
        self.tracker.get().expect("tracker installed at open")
    }

    pub fn install_group_flush(&self, f: Box<dyn Fn() + Send + Sync>) {
        let _ = self.group_flush.set(f);
    }

    /// Fires the transaction-finished state machine event and stands the
    /// drain watchdog down once the count drains.
    pub fn finish_transaction(&self) {
        self.state_machine.finish_transaction();
        if self.state_machine.transaction_count() == 0 {
            if let Some(tracker) = self.tracker.get() {
                tracker.cancel_drain_timer();
            }
        }
    }

    /// Closes the open simple-tx group (post-commit visibility flush).
    pub fn flush_simple_transaction_group(&self) {
        if let Some(f) = self.group_flush.get() {
            f();
        }
    }

    /// Stamps a committed transaction's rows with the replication LSN:
    /// inserts and updates get their row LSN bumped, deletes become
    /// tombstones.
    pub fn stamp_committed_operations(
        &self,
        tx: &StoreTransaction,
        operations: &[ReplicationOperation],
        lsn: Lsn,
    ) -> StoreResult<()> {
        for op in operations {
            match op.kind {
                ReplicationOpKind::Insert | ReplicationOpKind::Update => {
                    self.local_store()
                        .update_lsn(tx, &op.row_type, op.effective_key(), lsn)?;
                }
                ReplicationOpKind::Delete => {
                    tombstone::write_tombstone(
                        &self.local_store(),
                        tx,
                        self.settings.enable_tombstone_cleanup2,
                        &op.row_type,
                        &op.key,
                        lsn,
                        None,
                        &self.tombstone_index,
                    )?;
                }
                ReplicationOpKind::Tombstone
                | ReplicationOpKind::TombstoneLowWatermark
                | ReplicationOpKind::EpochUpdate
                | ReplicationOpKind::EpochHistory => {
                    // Never originated by user transactions.
                }
            }
        }
        Ok(())
    }
}
