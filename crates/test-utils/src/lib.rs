//! In-process replication transport for tests.
//!
//! A [`ReplicationHub`] plays the role of the replication transport: it
//! assigns LSNs on the primary's `replicate`, keeps the full operation
//! log, and streams operations (with optional log replay) to any number of
//! attached secondaries.  Copy streams are preloaded by the test from a
//! primary-side copy enumerator.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use replikv_primitives::epoch::Lsn;
use replikv_primitives::errors::{StoreError, StoreResult};
use replikv_primitives::wire::OperationMetadata;
use replikv_replica::transport::{
    FaultKind, Operation, OperationStream, ReplicationPayload, StateReplicator,
};

/// One operation as stored in the hub log / delivered to secondaries.
#[derive(Clone, Debug)]
pub struct StoredOperation {
    pub lsn: Lsn,
    pub metadata: Bytes,
    pub data: Vec<Bytes>,
}

pub struct TestOperation {
    metadata: Bytes,
    data: Vec<Bytes>,
    acked: Arc<AtomicBool>,
}

impl TestOperation {
    pub fn new(metadata: Bytes, data: Vec<Bytes>) -> (Box<dyn Operation>, Arc<AtomicBool>) {
        let acked = Arc::new(AtomicBool::new(false));
        (
            Box::new(Self {
                metadata,
                data,
                acked: acked.clone(),
            }),
            acked,
        )
    }
}

impl Operation for TestOperation {
    fn metadata(&self) -> &[u8] {
        &self.metadata
    }
    fn data(&self) -> &[Bytes] {
        &self.data
    }
    fn acknowledge(&self) {
        self.acked.store(true, Ordering::SeqCst);
    }
}

type OpSender = mpsc::UnboundedSender<Option<StoredOperation>>;

struct HubState {
    next_lsn: Lsn,
    log: Vec<StoredOperation>,
    subscribers: Vec<OpSender>,
    finished: bool,
}

/// The shared "replication transport" of a test cluster.
pub struct ReplicationHub {
    state: Mutex<HubState>,
}

impl Default for ReplicationHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicationHub {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HubState {
                next_lsn: 0,
                log: Vec::new(),
                subscribers: Vec::new(),
                finished: false,
            }),
        }
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Assigns the next LSN and fans the operation out.
    pub fn append(&self, payload: ReplicationPayload) -> StoreResult<Lsn> {
        let mut state = self.state.lock();
        if state.finished {
            return Err(StoreError::ObjectClosed);
        }
        state.next_lsn += 1;
        let lsn = state.next_lsn;
        // Reissue the metadata with the assigned LSN, as the real
        // transport does when delivering to secondaries.
        let metadata = OperationMetadata::Replication { lsn }.encode();
        let stored = StoredOperation {
            lsn,
            metadata,
            data: payload.data,
        };
        state.log.push(stored.clone());
        state
            .subscribers
            .retain(|tx| tx.send(Some(stored.clone())).is_ok());
        Ok(lsn)
    }

    pub fn last_lsn(&self) -> Lsn {
        self.state.lock().next_lsn
    }

    pub fn log(&self) -> Vec<StoredOperation> {
        self.state.lock().log.clone()
    }

    /// Subscribes a secondary from just past `after_lsn`: the log tail is
    /// replayed first, then live operations follow.
    pub fn subscribe_from(&self, after_lsn: Lsn) -> mpsc::UnboundedReceiver<Option<StoredOperation>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        for op in state.log.iter().filter(|op| op.lsn > after_lsn) {
            let _ = tx.send(Some(op.clone()));
        }
        if state.finished {
            let _ = tx.send(None);
        } else {
            state.subscribers.push(tx);
        }
        rx
    }

    /// Ends every replication stream (the null operation).
    pub fn finish(&self) {
        let mut state = self.state.lock();
        state.finished = true;
        for tx in state.subscribers.drain(..) {
            let _ = tx.send(None);
        }
    }
}

/// Stream over a subscriber channel.  Single consumer (the pump).
pub struct ChannelStream {
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Option<StoredOperation>>>,
    end_acked: AtomicBool,
}

#[async_trait]
impl OperationStream for ChannelStream {
    async fn get_operation(&self) -> StoreResult<Option<Box<dyn Operation>>> {
        let item = self.rx.lock().await.recv().await;
        Ok(item.flatten().map(|op| {
            let (boxed, _acked) = TestOperation::new(op.metadata, op.data);
            boxed
        }))
    }

    fn acknowledge_end_of_stream(&self) {
        self.end_acked.store(true, Ordering::SeqCst);
    }
}

/// Fixed, preloaded stream (used for copy streams).
pub struct VecStream {
    ops: Mutex<VecDeque<(Bytes, Vec<Bytes>)>>,
    acks: Mutex<Vec<Arc<AtomicBool>>>,
    end_acked: AtomicBool,
}

impl VecStream {
    pub fn new(ops: Vec<(Bytes, Vec<Bytes>)>) -> Arc<Self> {
        Arc::new(Self {
            ops: Mutex::new(ops.into()),
            acks: Mutex::new(Vec::new()),
            end_acked: AtomicBool::new(false),
        })
    }

    pub fn all_acknowledged(&self) -> bool {
        self.acks.lock().iter().all(|a| a.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl OperationStream for VecStream {
    async fn get_operation(&self) -> StoreResult<Option<Box<dyn Operation>>> {
        let next = self.ops.lock().pop_front();
        Ok(next.map(|(metadata, data)| {
            let (boxed, acked) = TestOperation::new(metadata, data);
            self.acks.lock().push(acked);
            boxed
        }))
    }

    fn acknowledge_end_of_stream(&self) {
        self.end_acked.store(true, Ordering::SeqCst);
    }
}

/// One recorded fault report.
#[derive(Clone, Debug)]
pub struct FaultReport {
    pub kind: FaultKind,
    pub error: StoreError,
    pub message: String,
}

/// Transport handle bound to one replica of the test cluster.
pub struct TestTransport {
    hub: Arc<ReplicationHub>,
    copy_stream: Mutex<Option<Arc<VecStream>>>,
    replication_after_lsn: Mutex<Lsn>,
    pub faults: Mutex<Vec<FaultReport>>,
}

impl TestTransport {
    pub fn new(hub: Arc<ReplicationHub>) -> Arc<Self> {
        Arc::new(Self {
            hub,
            copy_stream: Mutex::new(None),
            replication_after_lsn: Mutex::new(0),
            faults: Mutex::new(Vec::new()),
        })
    }

    /// Preloads the copy stream this secondary will drain.
    pub fn set_copy_operations(&self, ops: Vec<(Bytes, Vec<Bytes>)>) {
        *self.copy_stream.lock() = Some(VecStream::new(ops));
    }

    /// Replication stream starts just past this LSN.
    pub fn set_replication_start_after(&self, lsn: Lsn) {
        *self.replication_after_lsn.lock() = lsn;
    }

    pub fn fault_count(&self) -> usize {
        self.faults.lock().len()
    }
}

#[async_trait]
impl StateReplicator for TestTransport {
    async fn replicate(&self, payload: ReplicationPayload) -> StoreResult<Lsn> {
        self.hub.append(payload)
    }

    fn get_copy_stream(&self) -> StoreResult<Arc<dyn OperationStream>> {
        let stream = self
            .copy_stream
            .lock()
            .take()
            .unwrap_or_else(|| VecStream::new(Vec::new()));
        Ok(stream)
    }

    fn get_replication_stream(&self) -> StoreResult<Arc<dyn OperationStream>> {
        let after = *self.replication_after_lsn.lock();
        let rx = self.hub.subscribe_from(after);
        Ok(Arc::new(ChannelStream {
            rx: tokio::sync::Mutex::new(rx),
            end_acked: AtomicBool::new(false),
        }))
    }

    fn report_fault(&self, kind: FaultKind, error: &StoreError, message: &str) {
        self.faults.lock().push(FaultReport {
            kind,
            error: error.clone(),
            message: message.to_string(),
        });
    }
}
