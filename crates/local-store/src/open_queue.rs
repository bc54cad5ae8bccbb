//! Process-wide throttle on concurrent local store opens.
//!
//! Recovery storms open many databases at once; this bounds the number of
//! opens in flight.  Explicit init/shutdown lifecycle, owned by the replica
//! host.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use replikv_primitives::errors::{StoreError, StoreResult};

#[derive(Debug)]
struct QueueState {
    available: usize,
    shutdown: bool,
}

#[derive(Debug)]
pub struct OpenJobQueue {
    state: Mutex<QueueState>,
    cv: Condvar,
}

#[derive(Debug)]
pub struct OpenPermit {
    queue: Arc<OpenJobQueue>,
}

impl Drop for OpenPermit {
    fn drop(&mut self) {
        let mut st = self.queue.state.lock();
        st.available += 1;
        self.queue.cv.notify_one();
    }
}

impl OpenJobQueue {
    pub fn init(max_concurrent_opens: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState {
                available: max_concurrent_opens.max(1),
                shutdown: false,
            }),
            cv: Condvar::new(),
        })
    }

    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.cv.notify_all();
    }

    /// Blocks until an open slot is free.
    pub fn enter(self: &Arc<Self>) -> StoreResult<OpenPermit> {
        let mut st = self.state.lock();
        loop {
            if st.shutdown {
                return Err(StoreError::ObjectClosed);
            }
            if st.available > 0 {
                st.available -= 1;
                return Ok(OpenPermit {
                    queue: self.clone(),
                });
            }
            self.cv.wait(&mut st);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permits_bound_concurrency() {
        let queue = OpenJobQueue::init(1);
        let p1 = queue.enter().unwrap();

        let q2 = queue.clone();
        let handle = std::thread::spawn(move || q2.enter().map(|_| ()));
        std::thread::sleep(std::time::Duration::from_millis(30));
        drop(p1);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn shutdown_rejects_waiters() {
        let queue = OpenJobQueue::init(1);
        let _p = queue.enter().unwrap();
        queue.shutdown();
        assert_eq!(queue.enter().unwrap_err(), StoreError::ObjectClosed);
    }
}
