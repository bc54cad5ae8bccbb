//! Host-owned replication transport interface.
//!
//! The core receives a handle implementing [`StateReplicator`] and never
//! owns leader election, quorum, or LSN assignment; those live behind the
//! trait.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use replikv_primitives::epoch::{Epoch, Lsn};
use replikv_primitives::errors::{StoreError, StoreResult};

/// Serialized operation handed to the transport for replication.
#[derive(Clone, Debug)]
pub struct ReplicationPayload {
    pub metadata: Bytes,
    pub data: Vec<Bytes>,
}

/// Fault severity reported back to the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultKind {
    Transient,
    Permanent,
}

/// One operation pumped from a copy or replication stream.
pub trait Operation: Send + Sync {
    fn metadata(&self) -> &[u8];
    fn data(&self) -> &[Bytes];
    /// Acknowledges the operation to the transport.  Idempotent.
    fn acknowledge(&self);
}

/// Sequential operation stream; `None` marks the end.
#[async_trait]
pub trait OperationStream: Send + Sync {
    async fn get_operation(&self) -> StoreResult<Option<Box<dyn Operation>>>;

    /// Typed end-of-stream acknowledgement, used when stream faults are
    /// enabled.  Default is a no-op for transports on the null-only
    /// protocol.
    fn acknowledge_end_of_stream(&self) {}
}

#[async_trait]
pub trait StateReplicator: Send + Sync {
    /// Replicates one payload, resolving with its assigned LSN once the
    /// write quorum acknowledged it.
    async fn replicate(&self, payload: ReplicationPayload) -> StoreResult<Lsn>;

    fn get_copy_stream(&self) -> StoreResult<Arc<dyn OperationStream>>;

    fn get_replication_stream(&self) -> StoreResult<Arc<dyn OperationStream>>;

    fn report_fault(&self, kind: FaultKind, error: &StoreError, message: &str);

    /// Current catch-up capacity of the replication queue, for primary-side
    /// backpressure.
    fn queue_depth(&self) -> QueueDepth {
        QueueDepth::default()
    }
}

/// Snapshot of the transport's outgoing queue.
#[derive(Clone, Copy, Debug, Default)]
pub struct QueueDepth {
    pub operations: usize,
    pub bytes: usize,
}

/// Epoch update flowing from the transport into the core.
#[derive(Clone, Copy, Debug)]
pub struct EpochUpdate {
    pub epoch: Epoch,
    pub previous_epoch_last_lsn: Lsn,
}
