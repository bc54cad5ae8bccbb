//! Notification dispatch to the application's secondary event handler.
//!
//! One serialization task drains a bounded queue, so per-key events stay
//! in LSN order.  Copy-complete is delivered exactly once, before any
//! replication notification.  In block-secondary-ack mode the pump awaits
//! the handler before acknowledging to the transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use replikv_primitives::epoch::Lsn;
use replikv_primitives::errors::{StoreError, StoreResult};
use replikv_primitives::wire::ReplicationOperation;

use crate::settings::SecondaryNotificationMode;

/// Implemented by the application; called on the dispatch task.
pub trait SecondaryEventHandler: Send + Sync {
    fn on_copy_complete(&self) -> StoreResult<()>;

    fn on_replication_operations(
        &self,
        lsn: Lsn,
        operations: &[ReplicationOperation],
    ) -> StoreResult<()>;
}

enum Envelope {
    CopyComplete {
        done: Option<oneshot::Sender<StoreResult<()>>>,
    },
    Replication {
        lsn: Lsn,
        operations: Arc<Vec<ReplicationOperation>>,
        done: Option<oneshot::Sender<StoreResult<()>>>,
    },
}

const QUEUE_DEPTH: usize = 1024;

pub struct NotificationManager {
    mode: SecondaryNotificationMode,
    queue: Option<mpsc::Sender<Envelope>>,
    copy_complete_sent: AtomicBool,
    dispatcher: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl NotificationManager {
    pub fn new(
        mode: SecondaryNotificationMode,
        handler: Option<Arc<dyn SecondaryEventHandler>>,
    ) -> Arc<Self> {
        let (queue, dispatcher) = match (&mode, handler) {
            (SecondaryNotificationMode::Off, _) | (_, None) => (None, None),
            (_, Some(handler)) => {
                let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
                let task = tokio::spawn(dispatch_loop(rx, handler));
                (Some(tx), Some(task))
            }
        };
        Arc::new(Self {
            mode,
            queue,
            copy_complete_sent: AtomicBool::new(false),
            dispatcher: parking_lot::Mutex::new(dispatcher),
        })
    }

    pub fn mode(&self) -> SecondaryNotificationMode {
        self.mode
    }

    /// True when the apply path must wait for the handler before acking.
    pub fn blocks_secondary_ack(&self) -> bool {
        self.queue.is_some() && self.mode == SecondaryNotificationMode::BlockSecondaryAck
    }

    /// Exactly-once copy-complete.  In blocking mode resolves only after
    /// the handler returned.
    pub async fn notify_copy_complete(&self) -> StoreResult<()> {
        let Some(queue) = &self.queue else {
            return Ok(());
        };
        if self.copy_complete_sent.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("dispatching copy complete notification");
        if self.blocks_secondary_ack() {
            let (tx, rx) = oneshot::channel();
            queue
                .send(Envelope::CopyComplete { done: Some(tx) })
                .await
                .map_err(|_| StoreError::ObjectClosed)?;
            rx.await.map_err(|_| StoreError::ObjectClosed)?
        } else {
            queue
                .send(Envelope::CopyComplete { done: None })
                .await
                .map_err(|_| StoreError::ObjectClosed)
        }
    }

    /// Queues one applied replication operation.  Resolves immediately in
    /// non-blocking mode, after the handler in blocking mode.
    pub async fn notify_replication_applied(
        &self,
        lsn: Lsn,
        operations: Arc<Vec<ReplicationOperation>>,
    ) -> StoreResult<()> {
        let Some(queue) = &self.queue else {
            return Ok(());
        };
        if self.blocks_secondary_ack() {
            let (tx, rx) = oneshot::channel();
            queue
                .send(Envelope::Replication {
                    lsn,
                    operations,
                    done: Some(tx),
                })
                .await
                .map_err(|_| StoreError::ObjectClosed)?;
            rx.await.map_err(|_| StoreError::ObjectClosed)?
        } else {
            queue
                .send(Envelope::Replication {
                    lsn,
                    operations,
                    done: None,
                })
                .await
                .map_err(|_| StoreError::ObjectClosed)
        }
    }

    /// Role loss / close: stop accepting events and drain the queue so the
    /// application observes nothing from the future.
    pub async fn drain_and_close(&self) {
        let task = {
            let mut dispatcher = self.dispatcher.lock();
            dispatcher.take()
        };
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
    }

    pub fn reset_for_new_copy(&self) {
        self.copy_complete_sent.store(false, Ordering::SeqCst);
    }
}

async fn dispatch_loop(mut rx: mpsc::Receiver<Envelope>, handler: Arc<dyn SecondaryEventHandler>) {
    while let Some(envelope) = rx.recv().await {
        match envelope {
            Envelope::CopyComplete { done } => {
                let handler = handler.clone();
                let result = tokio::task::spawn_blocking(move || handler.on_copy_complete())
                    .await
                    .unwrap_or_else(|e| Err(StoreError::Unexpected(format!("handler: {e}"))));
                finish(result, done, "copy complete");
            }
            Envelope::Replication {
                lsn,
                operations,
                done,
            } => {
                let handler = handler.clone();
                let result = tokio::task::spawn_blocking(move || {
                    handler.on_replication_operations(lsn, &operations)
                })
                .await
                .unwrap_or_else(|e| Err(StoreError::Unexpected(format!("handler: {e}"))));
                debug!(lsn, "replication notification dispatched");
                finish(result, done, "replication");
            }
        }
    }
}

fn finish(result: StoreResult<()>, done: Option<oneshot::Sender<StoreResult<()>>>, what: &str) {
    if let Err(e) = &result {
        warn!(err = %e, what, "secondary event handler failed");
    }
    if let Some(done) = done {
        let _ = done.send(result.map_err(|e| match e {
            // Handler failures surface as timeout or closed; anything else
            // is fatal to the replica and handled by the pump.
            StoreError::Timeout => StoreError::Timeout,
            StoreError::ObjectClosed => StoreError::ObjectClosed,
            other => other,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl SecondaryEventHandler for Recorder {
        fn on_copy_complete(&self) -> StoreResult<()> {
            self.events.lock().push("copy".into());
            Ok(())
        }
        fn on_replication_operations(
            &self,
            lsn: Lsn,
            _ops: &[ReplicationOperation],
        ) -> StoreResult<()> {
            self.events.lock().push(format!("repl:{lsn}"));
            Ok(())
        }
    }

    #[tokio::test]
    async fn blocking_mode_preserves_order_and_once_semantics() {
        let recorder = Arc::new(Recorder {
            events: Mutex::new(Vec::new()),
        });
        let manager = NotificationManager::new(
            SecondaryNotificationMode::BlockSecondaryAck,
            Some(recorder.clone()),
        );

        manager.notify_copy_complete().await.unwrap();
        manager.notify_copy_complete().await.unwrap(); // second is a no-op
        for lsn in [1, 2, 3] {
            manager
                .notify_replication_applied(lsn, Arc::new(vec![]))
                .await
                .unwrap();
        }

        let events = recorder.events.lock().clone();
        assert_eq!(events, vec!["copy", "repl:1", "repl:2", "repl:3"]);
        manager.drain_and_close().await;
    }

    #[tokio::test]
    async fn off_mode_is_a_noop() {
        let manager = NotificationManager::new(SecondaryNotificationMode::Off, None);
        manager.notify_copy_complete().await.unwrap();
        manager
            .notify_replication_applied(1, Arc::new(vec![]))
            .await
            .unwrap();
        manager.drain_and_close().await;
    }
}
