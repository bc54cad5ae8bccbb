//! Cooperative shutdown signalling for worker loops.

use tokio::sync::watch;

/// Sending half; owned by whoever drives component lifecycle.
#[derive(Clone, Debug)]
pub struct ShutdownController {
    tx: watch::Sender<bool>,
}

/// Receiving half handed to worker loops; checked between operations.
#[derive(Clone, Debug)]
pub struct ShutdownGuard {
    rx: watch::Receiver<bool>,
}

pub fn shutdown_pair() -> (ShutdownController, ShutdownGuard) {
    let (tx, rx) = watch::channel(false);
    (ShutdownController { tx }, ShutdownGuard { rx })
}

impl ShutdownController {
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    pub fn subscribe(&self) -> ShutdownGuard {
        ShutdownGuard {
            rx: self.tx.subscribe(),
        }
    }
}

impl ShutdownGuard {
    pub fn should_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when shutdown is triggered.
    pub async fn wait(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trigger_is_observed() {
        let (ctl, mut guard) = shutdown_pair();
        assert!(!guard.should_shutdown());
        ctl.trigger();
        guard.wait().await;
        assert!(guard.should_shutdown());
    }
}
