//! Outstanding-transaction tracker.
//!
//! Tracks live transactions by tracker id so a role change or close can
//! force-release whatever the application leaked.  A drain watchdog after
//! the force-release pass treats still-live references as a ref-counting
//! bug and crashes rather than hangs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{error, info};

use replikv_primitives::ids::TrackerId;

/// Implemented by transactions that can be forcibly unwound.
pub trait TrackedTransaction: Send + Sync {
    fn tracker_id(&self) -> TrackerId;
    /// Drops the inner engine resources; returns true when this call did
    /// the release (the caller then finishes the state-machine event).
    fn force_release_inner(&self) -> bool;
}

type TransactionMap = HashMap<TrackerId, Weak<dyn TrackedTransaction>>;

struct Inner {
    outstanding: TransactionMap,
    draining: bool,
}

pub struct TransactionTracker {
    drain_timeout: Duration,
    inner: Mutex<Inner>,
    /// Generation of the active drain timer; bumped to cancel.
    timer_generation: AtomicU64,
    on_force_release: Box<dyn Fn() + Send + Sync>,
}

impl TransactionTracker {
    /// `on_force_release` runs once per transaction actually released by a
    /// drain pass (the owner decrements its transaction count there).
    pub fn new(drain_timeout: Duration, on_force_release: Box<dyn Fn() + Send + Sync>) -> Arc<Self> {
        Arc::new(Self {
            drain_timeout,
            inner: Mutex::new(Inner {
                outstanding: HashMap::new(),
                draining: false,
            }),
            timer_generation: AtomicU64::new(0),
            on_force_release,
        })
    }

    fn enabled(&self) -> bool {
        self.drain_timeout > Duration::ZERO
    }

    /// Registers a transaction; returns false while a drain is in progress
    /// (creation should be rejected upstream in that window).
    pub fn try_add(&self, tx: &Arc<dyn TrackedTransaction>) -> bool {
        if !self.enabled() {
            return true;
        }
        let mut inner = self.inner.lock();
        if !inner.draining {
            inner.outstanding.insert(tx.tracker_id(), Arc::downgrade(tx));
        }
        !inner.draining
    }

    pub fn remove(&self, id: TrackerId) {
        if !self.enabled() {
            return;
        }
        self.inner.lock().outstanding.remove(&id);
    }

    pub fn outstanding_count(&self) -> usize {
        self.inner.lock().outstanding.len()
    }

    /// Drain with the watchdog armed; used on role change and close.
    pub fn start_drain(self: &Arc<Self>) {
        self.schedule_abort_outstanding(true)
    }

    /// Drain without the watchdog.
    pub fn abort_outstanding(self: &Arc<Self>) {
        self.schedule_abort_outstanding(false)
    }

    fn schedule_abort_outstanding(self: &Arc<Self>, enable_timer: bool) {
        if !self.enabled() {
            return;
        }
        let to_release = {
            let mut inner = self.inner.lock();
            if inner.draining {
                return;
            }
            if inner.outstanding.is_empty() {
                inner.draining = false;
                info!("no outstanding transactions");
                return;
            }
            inner.draining = enable_timer;
            std::mem::take(&mut inner.outstanding)
        };

        info!(count = to_release.len(), timer = enable_timer, "scheduling abort of outstanding transactions");

        // Posted to a worker; never inline with the role-change caller.
        let this = self.clone();
        std::thread::spawn(move || this.abort_pass(to_release, enable_timer));
    }

    fn abort_pass(self: Arc<Self>, to_release: TransactionMap, enable_timer: bool) {
        for (id, weak) in to_release {
            if let Some(tx) = weak.upgrade() {
                info!(tracker = %id, "force releasing transaction");
                if tx.force_release_inner() {
                    (self.on_force_release)();
                }
            }
        }

        if enable_timer && self.inner.lock().draining {
            let generation = self.timer_generation.load(Ordering::SeqCst);
            let this = self.clone();
            std::thread::spawn(move || {
                std::thread::sleep(this.drain_timeout);
                if this.timer_generation.load(Ordering::SeqCst) == generation
                    && this.inner.lock().draining
                {
                    // Every transaction was either released by the owner or
                    // force-released above; reaching this point means a
                    // reference is still pinned somewhere.
                    error!("transaction drain timer exhausted");
                    panic!("transaction drain timer exhausted");
                }
            });
        }
    }

    /// Called when the drain completed (transaction count hit zero).
    pub fn cancel_drain_timer(&self) {
        self.timer_generation.fetch_add(1, Ordering::SeqCst);
        self.inner.lock().draining = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct FakeTx {
        id: TrackerId,
        released: AtomicUsize,
    }

    impl TrackedTransaction for FakeTx {
        fn tracker_id(&self) -> TrackerId {
            self.id
        }
        fn force_release_inner(&self) -> bool {
            self.released.fetch_add(1, Ordering::SeqCst) == 0
        }
    }

    fn fake() -> Arc<FakeTx> {
        Arc::new(FakeTx {
            id: TrackerId::next(),
            released: AtomicUsize::new(0),
        })
    }

    #[test]
    fn drain_force_releases_live_transactions() {
        let released = Arc::new(AtomicUsize::new(0));
        let released2 = released.clone();
        let tracker = TransactionTracker::new(
            Duration::from_secs(60),
            Box::new(move || {
                released2.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let tx = fake();
        let as_dyn: Arc<dyn TrackedTransaction> = tx.clone();
        assert!(tracker.try_add(&as_dyn));
        assert_eq!(tracker.outstanding_count(), 1);

        tracker.start_drain();
        for _ in 0..100 {
            if released.load(Ordering::SeqCst) == 1 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(tx.released.load(Ordering::SeqCst), 1);
        tracker.cancel_drain_timer();
    }

    #[test]
    fn dropped_transactions_are_skipped() {
        let tracker = TransactionTracker::new(Duration::from_secs(60), Box::new(|| {}));
        let tx = fake();
        let as_dyn: Arc<dyn TrackedTransaction> = tx.clone();
        tracker.try_add(&as_dyn);
        tracker.remove(tx.id);
        assert_eq!(tracker.outstanding_count(), 0);
        tracker.start_drain();
        tracker.cancel_drain_timer();
    }

    #[test]
    fn zero_timeout_disables_tracking() {
        let tracker = TransactionTracker::new(Duration::ZERO, Box::new(|| {}));
        let tx = fake();
        let as_dyn: Arc<dyn TrackedTransaction> = tx;
        assert!(tracker.try_add(&as_dyn));
        assert_eq!(tracker.outstanding_count(), 0);
    }
}
