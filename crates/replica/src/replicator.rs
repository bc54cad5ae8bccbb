//! Transaction replication: the call into the transport, primary-side
//! backpressure, and durable-flush batching.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info};

use replikv_primitives::epoch::Lsn;
use replikv_primitives::errors::StoreResult;
use replikv_primitives::wire::{encode_operations, OperationMetadata, ReplicationOperation};

use crate::settings::ReplicatedStoreSettings;
use crate::transport::{QueueDepth, ReplicationPayload, StateReplicator};

/// Backpressure state over the transport's outgoing queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThrottleState {
    Open,
    Throttled,
}

struct Throttle {
    state: ThrottleState,
}

pub struct TransactionReplicator {
    transport: Arc<dyn StateReplicator>,
    operations_threshold: usize,
    bytes_threshold: usize,
    flush_lsn_threshold: i64,
    throttle: Mutex<Throttle>,
    last_replicated: AtomicI64,
    last_flushed: AtomicI64,
}

impl TransactionReplicator {
    pub fn new(transport: Arc<dyn StateReplicator>, settings: &ReplicatedStoreSettings) -> Self {
        Self {
            transport,
            operations_threshold: settings.throttle_replication_queue_operations,
            bytes_threshold: settings.throttle_replication_queue_bytes,
            flush_lsn_threshold: settings.flush_batching_lsn_threshold,
            throttle: Mutex::new(Throttle {
                state: ThrottleState::Open,
            }),
            last_replicated: AtomicI64::new(0),
            last_flushed: AtomicI64::new(0),
        }
    }

    pub fn transport(&self) -> &Arc<dyn StateReplicator> {
        &self.transport
    }

    /// Replicates a batch of operations, returning the LSN the transport
    /// assigned to the whole batch.
    pub async fn replicate(&self, operations: &[ReplicationOperation]) -> StoreResult<Lsn> {
        let metadata = OperationMetadata::Replication { lsn: 0 }.encode();
        let data = encode_operations(operations);
        let payload = ReplicationPayload {
            metadata,
            data: vec![data],
        };
        let lsn = self.transport.replicate(payload).await?;
        self.last_replicated.fetch_max(lsn, Ordering::SeqCst);
        self.update_throttle(self.transport.queue_depth());
        debug!(lsn, ops = operations.len(), "replicated");
        Ok(lsn)
    }

    /// Re-evaluates backpressure from the transport queue depth.
    pub fn update_throttle(&self, depth: QueueDepth) {
        let mut throttle = self.throttle.lock();
        let over = depth.operations > self.operations_threshold
            || depth.bytes > self.bytes_threshold;
        match (throttle.state, over) {
            (ThrottleState::Open, true) => {
                info!(
                    ops = depth.operations,
                    bytes = depth.bytes,
                    "replication queue throttle engaged"
                );
                throttle.state = ThrottleState::Throttled;
            }
            (ThrottleState::Throttled, false) => {
                info!("replication queue throttle released");
                throttle.state = ThrottleState::Open;
            }
            _ => {}
        }
    }

    pub fn is_throttled(&self) -> bool {
        self.throttle.lock().state == ThrottleState::Throttled
    }

    pub fn last_replicated_lsn(&self) -> Lsn {
        self.last_replicated.load(Ordering::SeqCst)
    }

    /// Durable-flush batching: commits coalesce until enough LSNs have
    /// accumulated, unless the caller marks the flush high priority (role
    /// change, drain).
    pub fn should_flush(&self, lsn: Lsn, high_priority: bool) -> bool {
        high_priority || lsn - self.last_flushed.load(Ordering::SeqCst) >= self.flush_lsn_threshold
    }

    pub fn mark_flushed(&self, lsn: Lsn) {
        self.last_flushed.fetch_max(lsn, Ordering::SeqCst);
    }

    /// Raw payload replication used by epoch/watermark carriers.
    pub async fn replicate_payload(&self, metadata: Bytes, data: Vec<Bytes>) -> StoreResult<Lsn> {
        let lsn = self
            .transport
            .replicate(ReplicationPayload { metadata, data })
            .await?;
        self.last_replicated.fetch_max(lsn, Ordering::SeqCst);
        Ok(lsn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_transitions() {
        struct NullTransport;
        #[async_trait::async_trait]
        impl StateReplicator for NullTransport {
            async fn replicate(&self, _p: ReplicationPayload) -> StoreResult<Lsn> {
                Ok(1)
            }
            fn get_copy_stream(
                &self,
            ) -> StoreResult<Arc<dyn crate::transport::OperationStream>> {
                unimplemented!()
            }
            fn get_replication_stream(
                &self,
            ) -> StoreResult<Arc<dyn crate::transport::OperationStream>> {
                unimplemented!()
            }
            fn report_fault(
                &self,
                _k: crate::transport::FaultKind,
                _e: &replikv_primitives::errors::StoreError,
                _m: &str,
            ) {
            }
        }

        let settings = ReplicatedStoreSettings {
            throttle_replication_queue_operations: 10,
            throttle_replication_queue_bytes: 1000,
            ..Default::default()
        };
        let replicator = TransactionReplicator::new(Arc::new(NullTransport), &settings);

        assert!(!replicator.is_throttled());
        replicator.update_throttle(QueueDepth {
            operations: 11,
            bytes: 0,
        });
        assert!(replicator.is_throttled());
        replicator.update_throttle(QueueDepth {
            operations: 2,
            bytes: 0,
        });
        assert!(!replicator.is_throttled());
    }

    #[test]
    fn flush_batching_thresholds() {
        struct NullTransport;
        #[async_trait::async_trait]
        impl StateReplicator for NullTransport {
            async fn replicate(&self, _p: ReplicationPayload) -> StoreResult<Lsn> {
                Ok(1)
            }
            fn get_copy_stream(
                &self,
            ) -> StoreResult<Arc<dyn crate::transport::OperationStream>> {
                unimplemented!()
            }
            fn get_replication_stream(
                &self,
            ) -> StoreResult<Arc<dyn crate::transport::OperationStream>> {
                unimplemented!()
            }
            fn report_fault(
                &self,
                _k: crate::transport::FaultKind,
                _e: &replikv_primitives::errors::StoreError,
                _m: &str,
            ) {
            }
        }

        let settings = ReplicatedStoreSettings {
            flush_batching_lsn_threshold: 10,
            ..Default::default()
        };
        let replicator = TransactionReplicator::new(Arc::new(NullTransport), &settings);

        assert!(!replicator.should_flush(5, false));
        assert!(replicator.should_flush(5, true));
        assert!(replicator.should_flush(10, false));
        replicator.mark_flushed(10);
        assert!(!replicator.should_flush(15, false));
    }
}
