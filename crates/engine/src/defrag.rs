//! Background defragmentation scheduling.
//!
//! Runs checkpoint-based compaction off-thread, either on demand (id-space
//! pressure surfaces as `NeedsDefragment`) or on the configured scan
//! cadence when background maintenance is enabled.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{info, warn};

use crate::instance::EngineInstance;

struct DefragState {
    stop: bool,
    kick: bool,
}

pub struct Defragmenter {
    instance: Arc<EngineInstance>,
    state: Arc<(Mutex<DefragState>, Condvar)>,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Defragmenter {
    pub fn new(instance: Arc<EngineInstance>) -> Arc<Self> {
        Arc::new(Self {
            instance,
            state: Arc::new((
                Mutex::new(DefragState {
                    stop: false,
                    kick: false,
                }),
                Condvar::new(),
            )),
            worker: Mutex::new(None),
        })
    }

    pub fn start(self: &Arc<Self>, interval: Duration) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        let this = self.clone();
        *worker = std::thread::Builder::new()
            .name("engine-defrag".into())
            .spawn(move || this.run(interval))
            .ok();
    }

    /// Requests an immediate pass.
    pub fn kick(&self) {
        let (lock, cv) = (&self.state.0, &self.state.1);
        lock.lock().kick = true;
        cv.notify_all();
    }

    pub fn stop(&self) {
        {
            let (lock, cv) = (&self.state.0, &self.state.1);
            lock.lock().stop = true;
            cv.notify_all();
        }
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }

    fn run(&self, interval: Duration) {
        loop {
            {
                let (lock, cv) = (&self.state.0, &self.state.1);
                let mut st = lock.lock();
                if !st.stop && !st.kick {
                    cv.wait_for(&mut st, interval);
                }
                if st.stop {
                    return;
                }
                st.kick = false;
            }
            match self.instance.defragment() {
                Ok(()) => info!("defragmentation pass complete"),
                Err(e) => warn!(err = %e, "defragmentation pass failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::InstanceRegistry;
    use crate::settings::{EngineSettings, PoolSettings};

    #[test]
    fn kick_runs_a_pass_and_stop_joins() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = InstanceRegistry::init(2);
        let instance = EngineInstance::open(
            registry.clone(),
            tmp.path(),
            "store",
            EngineSettings::default(),
            PoolSettings::default(),
        )
        .unwrap();

        let defrag = Defragmenter::new(instance.clone());
        defrag.start(Duration::from_secs(3600));
        defrag.kick();
        std::thread::sleep(Duration::from_millis(100));
        defrag.stop();

        instance.close();
        registry.shutdown();
    }
}
