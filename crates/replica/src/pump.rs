//! Secondary pump: drains the copy stream, then the replication stream,
//! applying operations deterministically and idempotently.
//!
//! One pump task per secondary.  Copy operations classify by their tag
//! (logical full, partial, snapshot-partial, file-stream, paged); the
//! first tag stages a copy destination, the end of the copy stream swaps
//! it in.  Replication operations apply with LSN-based replay protection,
//! commit asynchronously, then acknowledge.  Retryable failures back off
//! and re-apply; terminal failures fault the stream and stop the pump.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use replikv_copier::extract_archive;
use replikv_local_store::{LocalStore, StoreTransaction, SEQUENCE_NUMBER_IGNORE};
use replikv_primitives::epoch::Lsn;
use replikv_primitives::errors::{StoreError, StoreResult};
use replikv_primitives::shutdown::{shutdown_pair, ShutdownController, ShutdownGuard};
use replikv_primitives::wire::{
    decode_operations, CopyOperationKind, CopyType, OperationMetadata, ReplicationOpKind,
    ReplicationOperation,
};

use crate::context::ReplicaContext;
use crate::epoch_store;
use crate::notifications::NotificationManager;
use crate::paths::{ReplicaPaths, COMPLETION_MARKER_BYTES};
use crate::tombstone;
use crate::transport::{FaultKind, Operation, OperationStream, StateReplicator};
use crate::well_known;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PumpState {
    NotStarted,
    PumpCopy,
    PumpReplication,
    Closed,
}

/// Staged copy destination while a copy stream is in flight.
struct CopyDestination {
    store: Arc<LocalStore>,
    is_full: bool,
    is_file_stream: bool,
}

pub struct SecondaryPump {
    ctx: Arc<ReplicaContext>,
    transport: Arc<dyn StateReplicator>,
    notifications: Arc<NotificationManager>,
    paths: ReplicaPaths,
    state: Mutex<PumpState>,
    copy_destination: Mutex<Option<CopyDestination>>,
    /// `(type, key) -> LSN` of inserts applied but not yet committed.
    pending_inserts: Mutex<HashMap<(String, String), Lsn>>,
    shutdown: ShutdownController,
    cancel_guard: ShutdownGuard,
    stream_faulted: AtomicBool,
    last_lsn_processed: AtomicI64,
    /// Staging file for an incoming file-stream archive.
    staging_file: Mutex<Option<fs::File>>,
}

impl SecondaryPump {
    pub fn new(
        ctx: Arc<ReplicaContext>,
        transport: Arc<dyn StateReplicator>,
        notifications: Arc<NotificationManager>,
        paths: ReplicaPaths,
    ) -> Arc<Self> {
        let (shutdown, cancel_guard) = shutdown_pair();
        Arc::new(Self {
            ctx,
            transport,
            notifications,
            paths,
            state: Mutex::new(PumpState::NotStarted),
            copy_destination: Mutex::new(None),
            pending_inserts: Mutex::new(HashMap::new()),
            shutdown,
            cancel_guard,
            stream_faulted: AtomicBool::new(false),
            last_lsn_processed: AtomicI64::new(0),
            staging_file: Mutex::new(None),
        })
    }

    pub fn start(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            this.run().await;
        });
    }

    pub fn cancel(&self) {
        self.shutdown.trigger();
    }

    pub fn last_lsn_processed(&self) -> Lsn {
        self.last_lsn_processed.load(Ordering::SeqCst)
    }

    fn is_canceled(&self) -> bool {
        self.cancel_guard.should_shutdown()
    }

    async fn run(self: &Arc<Self>) {
        *self.state.lock() = PumpState::PumpCopy;
        self.notifications.reset_for_new_copy();

        if let Err(e) = self.drain_copy_stream().await {
            self.fault(FaultKind::Transient, &e, "copy stream drain failed");
            self.close_pump();
            return;
        }
        if self.is_canceled() {
            self.close_pump();
            return;
        }

        *self.state.lock() = PumpState::PumpReplication;
        if let Err(e) = self.drain_replication_stream().await {
            self.fault(FaultKind::Transient, &e, "replication stream drain failed");
        }
        self.close_pump();
    }

    fn close_pump(&self) {
        *self.state.lock() = PumpState::Closed;
        self.pending_inserts.lock().clear();
        info!("secondary pump closed");
    }

    async fn drain_copy_stream(self: &Arc<Self>) -> StoreResult<()> {
        let stream = self.transport.get_copy_stream()?;
        loop {
            if self.is_canceled() {
                return Ok(());
            }
            let Some(operation) = stream.get_operation().await? else {
                self.finish_copy().await?;
                if self.ctx.settings.enable_stream_faults {
                    stream.acknowledge_end_of_stream();
                }
                return Ok(());
            };
            self.process_copy_operation(operation.as_ref()).await?;
            operation.acknowledge();
        }
    }

    async fn process_copy_operation(self: &Arc<Self>, operation: &dyn Operation) -> StoreResult<()> {
        let metadata = OperationMetadata::decode(operation.metadata()).map_err(|e| {
            StoreError::InvalidOperation(format!("malformed copy metadata: {e}"))
        })?;
        let OperationMetadata::Copy {
            kind,
            copy_type,
            lsn,
        } = metadata
        else {
            return Err(StoreError::InvalidOperation(
                "replication metadata on copy stream".into(),
            ));
        };

        if copy_type.is_first_copy() || copy_type == CopyType::FileStreamRebuildCopy {
            self.prepare_copy_destination(copy_type)?;
        } else if copy_type == CopyType::FileStreamFullCopy
            && self.copy_destination.lock().is_none()
        {
            self.prepare_copy_destination(copy_type)?;
        }

        match kind {
            CopyOperationKind::ProgressVector => {
                let vector = epoch_store::decode_vector(first_buffer(operation)?)?;
                let store = self.current_local_store();
                let tx = store.create_transaction()?;
                epoch_store::write_progress_vector(&store, &tx, &vector)?;
                commit_durably(&tx)?;
                debug!(entries = vector.entries().len(), "progress vector staged");
                Ok(())
            }
            CopyOperationKind::LowWatermark => {
                let watermark: Lsn = bincode::deserialize(first_buffer(operation)?)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                let store = self.current_local_store();
                let tx = store.create_transaction()?;
                tombstone::update_low_watermark(&store, &tx, watermark)?;
                commit_durably(&tx)?;
                debug!(watermark, "low watermark staged");
                Ok(())
            }
            CopyOperationKind::EpochHistory => {
                let history = epoch_store::decode_vector(first_buffer(operation)?)?;
                let store = self.current_local_store();
                let tx = store.create_transaction()?;
                epoch_store::apply_epoch_history(&store, &tx, &history)?;
                commit_durably(&tx)?;
                Ok(())
            }
            CopyOperationKind::Page => {
                let mut operations = Vec::new();
                for buffer in operation.data() {
                    operations.extend(decode_operations(buffer)?);
                }
                self.apply_operations_with_retry(&operations, lsn).await?;
                self.last_lsn_processed.fetch_max(lsn, Ordering::SeqCst);
                Ok(())
            }
            CopyOperationKind::FileStream => {
                let chunk =
                    replikv_primitives::wire::FileStreamChunk::decode(first_buffer(operation)?)?;
                self.apply_file_stream_chunk(chunk)
            }
        }
    }

    fn prepare_copy_destination(&self, copy_type: CopyType) -> StoreResult<()> {
        let mut destination = self.copy_destination.lock();
        if destination.is_some() {
            return Ok(());
        }

        let is_full = matches!(
            copy_type,
            CopyType::FirstFullCopy | CopyType::FileStreamFullCopy | CopyType::FileStreamRebuildCopy
        );
        let is_file_stream = copy_type.is_file_stream();
        info!(?copy_type, is_full, "staging copy destination");

        if is_file_stream {
            // Chunks land in a staging file; the database is rebuilt from
            // the archive on the last chunk.
            let staging = self.paths.file_stream_staging_file();
            if staging.exists() {
                fs::remove_file(&staging)?;
            }
            if let Some(parent) = staging.parent() {
                fs::create_dir_all(parent)?;
            }
            *self.staging_file.lock() = Some(fs::File::create(&staging)?);
            *destination = Some(CopyDestination {
                store: self.ctx.local_store(),
                is_full,
                is_file_stream,
            });
            return Ok(());
        }

        if is_full {
            // Logical full copy: build a fresh database in the staging
            // directory and swap at end of copy.
            let full_dir = self.paths.full_copy_dir();
            if full_dir.exists() {
                fs::remove_dir_all(&full_dir)?;
            }
            let settings = self.ctx.local_store().settings().clone();
            let store = LocalStore::open(self.ctx.registry.clone(), &full_dir, settings, None)?;
            *destination = Some(CopyDestination {
                store,
                is_full,
                is_file_stream,
            });
        } else {
            // Partial copy: apply on top of the existing database; the
            // staging directory only carries the completion marker.
            let partial_dir = self.paths.partial_copy_dir();
            if partial_dir.exists() {
                fs::remove_dir_all(&partial_dir)?;
            }
            fs::create_dir_all(&partial_dir)?;
            *destination = Some(CopyDestination {
                store: self.ctx.local_store(),
                is_full,
                is_file_stream,
            });
        }
        Ok(())
    }

    fn apply_file_stream_chunk(
        &self,
        chunk: replikv_primitives::wire::FileStreamChunk,
    ) -> StoreResult<()> {
        {
            let mut staging = self.staging_file.lock();
            let file = staging
                .as_mut()
                .ok_or_else(|| StoreError::InvalidOperation("chunk before first copy tag".into()))?;
            file.write_all(&chunk.data)?;
            if chunk.is_last_chunk {
                file.flush()?;
                file.sync_all()?;
                *staging = None;
            } else {
                return Ok(());
            }
        }

        // Last chunk: unpack the archive and rebuild the database from it.
        info!("file stream copy complete; rebuilding database from archive");
        let full_dir = self.paths.full_copy_dir();
        if full_dir.exists() {
            fs::remove_dir_all(&full_dir)?;
        }
        extract_archive(&self.paths.file_stream_staging_file(), &full_dir)?;
        fs::remove_file(self.paths.file_stream_staging_file())?;
        self.swap_in_database(&full_dir)
    }

    /// Replaces the main database directory with `source_dir` and reopens
    /// the local store.
    fn swap_in_database(&self, source_dir: &std::path::Path) -> StoreResult<()> {
        let db_dir = self.paths.database_dir();
        let settings = self.ctx.local_store().settings().clone();

        self.ctx.local_store().terminate();

        let drop_dir = self.paths.drop_backup_dir();
        if drop_dir.exists() {
            fs::remove_dir_all(&drop_dir)?;
        }
        if db_dir.exists() {
            fs::rename(&db_dir, &drop_dir)?;
        }
        fs::rename(source_dir, &db_dir)?;

        let store = LocalStore::open(self.ctx.registry.clone(), &db_dir, settings, None)?;
        self.ctx.set_local_store(store);
        info!(dir = %db_dir.display(), "database rebuilt from copy");
        Ok(())
    }

    async fn finish_copy(self: &Arc<Self>) -> StoreResult<()> {
        let destination = self.copy_destination.lock().take();
        if let Some(destination) = destination {
            if destination.is_file_stream {
                // Swap already happened on the last chunk.
            } else if destination.is_full {
                destination.store.terminate();
                let full_dir = self.paths.full_copy_dir();
                self.swap_in_database(&full_dir)?;
            } else {
                // Partial copy: stamp the staging directory as complete.
                fs::write(self.paths.partial_copy_marker(), COMPLETION_MARKER_BYTES)?;
            }
        }

        if self.ctx.settings.enable_copy_notification_prefetch {
            self.prefetch_data_rows()?;
        }
        self.notifications.notify_copy_complete().await?;
        info!("copy stream complete");
        Ok(())
    }

    /// Warms the engine cache with the data rows before the application
    /// sees copy-complete.
    fn prefetch_data_rows(&self) -> StoreResult<()> {
        let store = self.ctx.local_store();
        let tx = store.create_transaction()?;
        let mut rows = 0usize;
        let mut scan = store.enumerate_by_type_and_key(&tx, "", "", false)?;
        while let Some(row) = scan.move_next()? {
            if !well_known::is_internal_type(&row.row_type) {
                rows += 1;
            }
        }
        drop(scan);
        tx.rollback();
        debug!(rows, "prefetched data rows before copy complete");
        Ok(())
    }

    async fn drain_replication_stream(self: &Arc<Self>) -> StoreResult<()> {
        let stream = self.transport.get_replication_stream()?;
        loop {
            if self.is_canceled() {
                self.release_stream(&stream);
                return Ok(());
            }
            let Some(operation) = stream.get_operation().await? else {
                // Null operation: the pump has fully drained.
                self.ctx.state_machine.secondary_pump_closed();
                if self.ctx.settings.enable_stream_faults {
                    stream.acknowledge_end_of_stream();
                }
                return Ok(());
            };
            self.process_replication_operation(operation).await?;
        }
    }

    fn release_stream(&self, _stream: &Arc<dyn OperationStream>) {
        debug!("operation stream released on cancel");
    }

    async fn process_replication_operation(
        self: &Arc<Self>,
        operation: Box<dyn Operation>,
    ) -> StoreResult<()> {
        let metadata = OperationMetadata::decode(operation.metadata()).map_err(|e| {
            StoreError::InvalidOperation(format!("malformed replication metadata: {e}"))
        })?;
        let lsn = metadata.lsn();

        let mut operations = Vec::new();
        for buffer in operation.data() {
            operations.extend(decode_operations(buffer)?);
        }

        self.apply_operations_with_retry(&operations, lsn).await?;
        self.last_lsn_processed.fetch_max(lsn, Ordering::SeqCst);

        // Quorum-acked and locally applied; let the application observe it.
        self.notifications
            .notify_replication_applied(lsn, Arc::new(operations))
            .await?;
        operation.acknowledge();
        Ok(())
    }

    async fn apply_operations_with_retry(
        self: &Arc<Self>,
        operations: &[ReplicationOperation],
        lsn: Lsn,
    ) -> StoreResult<()> {
        let mut attempt = 0usize;
        loop {
            match self.apply_and_commit(operations, lsn).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < self.ctx.settings.secondary_apply_max_retries => {
                    attempt += 1;
                    warn!(lsn, attempt, err = %e, "retrying secondary apply");
                    tokio::time::sleep(self.ctx.settings.secondary_apply_retry_delay).await;
                }
                Err(e) => {
                    error!(lsn, err = %e, "terminal secondary apply failure");
                    return Err(e);
                }
            }
        }
    }

    async fn apply_and_commit(
        self: &Arc<Self>,
        operations: &[ReplicationOperation],
        lsn: Lsn,
    ) -> StoreResult<()> {
        let store = self.current_local_store();
        let tx = store.create_transaction()?;

        for op in operations {
            self.apply_one(&store, &tx, op, lsn)?;
        }

        let (_, waiter) = tx.commit_async(None)?;
        waiter
            .await
            .map_err(|_| StoreError::ObjectClosed)
            .and_then(|r| r)?;
        self.remove_pending_inserts(operations);
        Ok(())
    }

    fn apply_one(
        &self,
        store: &Arc<LocalStore>,
        tx: &StoreTransaction,
        op: &ReplicationOperation,
        operation_lsn: Lsn,
    ) -> StoreResult<()> {
        // Copy pages carry per-row LSNs; replication sub-operations take
        // the operation's LSN.
        let lsn = if op.lsn > 0 { op.lsn } else { operation_lsn };

        match op.kind {
            ReplicationOpKind::Insert => self.apply_insert(store, tx, op, lsn),
            ReplicationOpKind::Update => self.apply_update(store, tx, op, lsn),
            ReplicationOpKind::Delete => self.apply_delete(store, tx, op, lsn),
            ReplicationOpKind::Tombstone => {
                tombstone::write_tombstone(
                    store,
                    tx,
                    self.ctx.settings.enable_tombstone_cleanup2,
                    &op.row_type,
                    &op.key,
                    lsn,
                    Some(op.modified_on_primary),
                    &self.ctx.tombstone_index,
                )?;
                Ok(())
            }
            ReplicationOpKind::TombstoneLowWatermark => {
                let accepted = tombstone::update_low_watermark(store, tx, lsn)?;
                if !accepted {
                    debug!(lsn, "low watermark decrease rejected");
                }
                Ok(())
            }
            ReplicationOpKind::EpochUpdate => {
                let update = epoch_store::decode_epoch_update(
                    op.value.as_deref().unwrap_or_default(),
                )?;
                epoch_store::apply_epoch_update(store, tx, update.epoch, update.last_lsn)
            }
            ReplicationOpKind::EpochHistory => {
                let history =
                    epoch_store::decode_vector(op.value.as_deref().unwrap_or_default())?;
                epoch_store::apply_epoch_history(store, tx, &history)
            }
        }
    }

    fn apply_insert(
        &self,
        store: &Arc<LocalStore>,
        tx: &StoreTransaction,
        op: &ReplicationOperation,
        lsn: Lsn,
    ) -> StoreResult<()> {
        let pending_key = (op.row_type.clone(), op.key.clone());
        if let Some(pending) = self.pending_inserts.lock().get(&pending_key) {
            if *pending >= lsn {
                debug!(row_type = %op.row_type, key = %op.key, lsn, "insert superseded by pending insert");
                return Ok(());
            }
        }

        let value = op.value.as_deref().unwrap_or_default();
        match store.insert(tx, &op.row_type, &op.key, value, lsn, Some(op.modified_on_primary)) {
            Ok(()) => {
                self.pending_inserts.lock().insert(pending_key, lsn);
                Ok(())
            }
            Err(StoreError::RecordAlreadyExists) => {
                // Fall back to an update when the incoming row is newer.
                let current = store.get_lsn(tx, &op.row_type, &op.key)?;
                if current >= lsn {
                    debug!(row_type = %op.row_type, key = %op.key, lsn, current, "insert replay skipped");
                    return Ok(());
                }
                store.update(
                    tx,
                    &op.row_type,
                    &op.key,
                    SEQUENCE_NUMBER_IGNORE,
                    None,
                    Some(value),
                    lsn,
                    Some(op.modified_on_primary),
                )
            }
            Err(e) => Err(e),
        }
    }

    fn apply_update(
        &self,
        store: &Arc<LocalStore>,
        tx: &StoreTransaction,
        op: &ReplicationOperation,
        lsn: Lsn,
    ) -> StoreResult<()> {
        let value = op.value.as_deref().unwrap_or_default();
        match store.get(tx, &op.row_type, &op.key)? {
            None => {
                // Convert to insert; the row may have been pruned by an
                // earlier full copy.
                store.insert(
                    tx,
                    &op.row_type,
                    op.effective_key(),
                    value,
                    lsn,
                    Some(op.modified_on_primary),
                )
            }
            Some(current) if current.lsn >= lsn => {
                debug!(row_type = %op.row_type, key = %op.key, lsn, current = current.lsn, "update replay skipped");
                Ok(())
            }
            Some(_) => store.update(
                tx,
                &op.row_type,
                &op.key,
                SEQUENCE_NUMBER_IGNORE,
                op.new_key.as_deref(),
                Some(value),
                lsn,
                Some(op.modified_on_primary),
            ),
        }
    }

    fn apply_delete(
        &self,
        store: &Arc<LocalStore>,
        tx: &StoreTransaction,
        op: &ReplicationOperation,
        lsn: Lsn,
    ) -> StoreResult<()> {
        match store.get(tx, &op.row_type, &op.key)? {
            Some(current) if current.lsn >= lsn => {
                debug!(row_type = %op.row_type, key = %op.key, lsn, current = current.lsn, "delete replay skipped");
                Ok(())
            }
            Some(_) => {
                store.delete(tx, &op.row_type, &op.key, SEQUENCE_NUMBER_IGNORE)?;
                tombstone::write_tombstone(
                    store,
                    tx,
                    self.ctx.settings.enable_tombstone_cleanup2,
                    &op.row_type,
                    &op.key,
                    lsn,
                    Some(op.modified_on_primary),
                    &self.ctx.tombstone_index,
                )?;
                Ok(())
            }
            None => {
                // Row never seen here; record the tombstone for replay
                // protection anyway.
                tombstone::write_tombstone(
                    store,
                    tx,
                    self.ctx.settings.enable_tombstone_cleanup2,
                    &op.row_type,
                    &op.key,
                    lsn,
                    Some(op.modified_on_primary),
                    &self.ctx.tombstone_index,
                )?;
                Ok(())
            }
        }
    }

    fn remove_pending_inserts(&self, operations: &[ReplicationOperation]) {
        let mut pending = self.pending_inserts.lock();
        for op in operations {
            if op.kind == ReplicationOpKind::Insert {
                pending.remove(&(op.row_type.clone(), op.key.clone()));
            }
        }
    }

    fn current_local_store(&self) -> Arc<LocalStore> {
        self.copy_destination
            .lock()
            .as_ref()
            .map(|d| d.store.clone())
            .unwrap_or_else(|| self.ctx.local_store())
    }

    fn fault(&self, kind: FaultKind, error: &StoreError, message: &str) {
        if self.stream_faulted.swap(true, Ordering::SeqCst) {
            return;
        }
        error!(err = %error, message, "faulting replica stream");
        self.transport.report_fault(kind, error, message);
        self.cancel();
    }
}

fn first_buffer(operation: &dyn Operation) -> StoreResult<&[u8]> {
    operation
        .data()
        .first()
        .map(|b| b.as_ref())
        .ok_or_else(|| StoreError::InvalidOperation("operation without data buffer".into()))
}

fn commit_durably(tx: &StoreTransaction) -> StoreResult<()> {
    tx.commit_durable(None)?;
    Ok(())
}
