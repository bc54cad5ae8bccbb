//! Persisted logical clock.
//!
//! A 64-bit counter stored in its own namespace, refreshed on a timer
//! while the replica holds the primary role.  Survives restarts; never
//! moves backwards.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::warn;

use replikv_local_store::{LocalStore, StoreTransaction, SEQUENCE_NUMBER_IGNORE};
use replikv_primitives::errors::{StoreError, StoreResult};

use crate::well_known::{SINGLETON_KEY, TYPE_FABRIC_TIME};

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
struct FabricTimeData {
    logical_time: i64,
}

pub struct FabricTimeController {
    store: RwLock<Arc<LocalStore>>,
    current: AtomicI64,
    stop: Arc<(Mutex<bool>, Condvar)>,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl FabricTimeController {
    /// Loads (or seeds) the persisted counter.
    pub fn recover(store: Arc<LocalStore>) -> StoreResult<Arc<Self>> {
        let tx = store.create_transaction()?;
        let seed = match store.get(&tx, TYPE_FABRIC_TIME, SINGLETON_KEY)? {
            Some(row) => {
                let data: FabricTimeData = bincode::deserialize(&row.value)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                data.logical_time
            }
            None => 0,
        };
        tx.rollback();
        Ok(Arc::new(Self {
            store: RwLock::new(store),
            current: AtomicI64::new(seed),
            stop: Arc::new((Mutex::new(false), Condvar::new())),
            worker: Mutex::new(None),
        }))
    }

    /// Monotonic logical time; each call ticks the counter.
    pub fn next_time(&self) -> i64 {
        self.current.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn current_time(&self) -> i64 {
        self.current.load(Ordering::Relaxed)
    }

    /// Re-targets the controller after a database swap.
    pub fn set_store(&self, store: Arc<LocalStore>) {
        *self.store.write() = store;
    }

    fn persist(&self, store: &LocalStore, tx: &StoreTransaction) -> StoreResult<()> {
        let value = bincode::serialize(&FabricTimeData {
            logical_time: self.current.load(Ordering::Relaxed),
        })
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
        match store.insert(tx, TYPE_FABRIC_TIME, SINGLETON_KEY, &value, 0, None) {
            Ok(()) => Ok(()),
            Err(StoreError::RecordAlreadyExists) => store.update(
                tx,
                TYPE_FABRIC_TIME,
                SINGLETON_KEY,
                SEQUENCE_NUMBER_IGNORE,
                None,
                Some(&value),
                0,
                None,
            ),
            Err(e) => Err(e),
        }
    }

    /// One refresh pass: tick and persist durably.
    pub fn refresh(&self) -> StoreResult<()> {
        self.next_time();
        let store = self.store.read().clone();
        let tx = store.create_transaction()?;
        self.persist(&store, &tx)?;
        tx.commit_durable(None)?;
        Ok(())
    }

    /// Starts the periodic refresh; runs until [`Self::stop`].
    pub fn start(self: &Arc<Self>, interval: Duration) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        let this = self.clone();
        *worker = std::thread::Builder::new()
            .name("fabric-time".into())
            .spawn(move || loop {
                {
                    let (lock, cv) = (&this.stop.0, &this.stop.1);
                    let mut stopped = lock.lock();
                    if !*stopped {
                        cv.wait_for(&mut stopped, interval);
                    }
                    if *stopped {
                        return;
                    }
                }
                if let Err(e) = this.refresh() {
                    warn!(err = %e, "logical time refresh failed");
                }
            })
            .ok();
    }

    pub fn stop(&self) {
        {
            let (lock, cv) = (&self.stop.0, &self.stop.1);
            *lock.lock() = true;
            cv.notify_all();
        }
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replikv_engine::instance::InstanceRegistry;
    use replikv_local_store::LocalStoreSettings;

    #[tokio::test]
    async fn counter_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = InstanceRegistry::init(4);
        {
            let store = LocalStore::open(
                registry.clone(),
                tmp.path(),
                LocalStoreSettings::default(),
                None,
            )
            .unwrap();
            let timer = FabricTimeController::recover(store.clone()).unwrap();
            timer.refresh().unwrap();
            timer.refresh().unwrap();
            assert!(timer.current_time() >= 2);
            store.terminate();
        }
        {
            let store = LocalStore::open(
                registry.clone(),
                tmp.path(),
                LocalStoreSettings::default(),
                None,
            )
            .unwrap();
            let timer = FabricTimeController::recover(store.clone()).unwrap();
            assert!(timer.current_time() >= 2);
            store.terminate();
        }
        registry.shutdown();
    }
}
