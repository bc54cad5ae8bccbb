//! Session pool.
//!
//! Grows asynchronously when the free list runs low, shrinks back to the
//! maximum concurrent use observed within the eviction period, and deletes
//! (rather than returns) items whose transaction ended badly.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::kernel::Kernel;
use crate::session::Session;
use crate::settings::PoolSettings;

/// One pooled session.  Dropping the item without going through
/// [`SessionPool::release`] rolls back any in-flight transaction.
pub struct PoolItem {
    session: Arc<Session>,
}

impl std::fmt::Debug for PoolItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolItem").finish_non_exhaustive()
    }
}

impl PoolItem {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl Drop for PoolItem {
    fn drop(&mut self) {
        self.session.rollback_if_active();
    }
}

struct PoolState {
    free: Vec<Arc<Session>>,
    in_use: usize,
    max_in_use_in_period: usize,
    period_started: Instant,
    grow_in_flight: bool,
    aborting: bool,
}

pub struct SessionPool {
    kernel: Arc<Kernel>,
    settings: PoolSettings,
    state: RwLock<PoolState>,
}

impl SessionPool {
    pub fn new(kernel: Arc<Kernel>, settings: PoolSettings) -> Arc<Self> {
        let mut free = Vec::with_capacity(settings.min_size);
        for _ in 0..settings.min_size {
            free.push(Session::new(kernel.clone()));
        }
        Arc::new(Self {
            kernel,
            settings,
            state: RwLock::new(PoolState {
                free,
                in_use: 0,
                max_in_use_in_period: 0,
                period_started: Instant::now(),
                grow_in_flight: false,
                aborting: false,
            }),
        })
    }

    pub fn acquire(self: &Arc<Self>) -> EngineResult<PoolItem> {
        let (session, needs_grow) = {
            let mut state = self.state.write();
            if state.aborting {
                return Err(EngineError::TermInProgress);
            }
            let session = state
                .free
                .pop()
                .unwrap_or_else(|| Session::new(self.kernel.clone()));
            state.in_use += 1;
            state.max_in_use_in_period = state.max_in_use_in_period.max(state.in_use);
            let needs_grow =
                state.free.len() < self.settings.adjustment_size && !state.grow_in_flight;
            if needs_grow {
                state.grow_in_flight = true;
            }
            (session, needs_grow)
        };

        if needs_grow {
            let pool = self.clone();
            std::thread::spawn(move || pool.grow());
        }

        Ok(PoolItem { session })
    }

    fn grow(&self) {
        let mut fresh = Vec::with_capacity(self.settings.adjustment_size);
        for _ in 0..self.settings.adjustment_size {
            fresh.push(Session::new(self.kernel.clone()));
        }
        let mut state = self.state.write();
        state.grow_in_flight = false;
        if state.aborting {
            return;
        }
        debug!(added = fresh.len(), "session pool grown");
        state.free.append(&mut fresh);
    }

    /// Returns an item.  The item is discarded instead when the transaction
    /// ended in error, the session still holds enumerations, the session is
    /// unrecoverable, or the pool is aborting.
    pub fn release(&self, item: PoolItem, had_error: bool) {
        let discard = had_error
            || item.session.open_cursor_count() > 0
            || item.session.is_unrecoverable()
            || item.session.has_active_transaction();

        item.session.rollback_if_active();

        let mut state = self.state.write();
        state.in_use = state.in_use.saturating_sub(1);

        if state.aborting || discard {
            if discard && !state.aborting {
                warn!(session = item.session.id(), "discarding pool session");
            }
            return;
        }

        // Opportunistic shrink: keep only what the last eviction period
        // actually used concurrently, never below the minimum.
        let elapsed = state.period_started.elapsed();
        if elapsed >= self.settings.eviction_period {
            state.max_in_use_in_period = state.in_use;
            state.period_started = Instant::now();
        }
        let target_total = state
            .max_in_use_in_period
            .max(self.settings.min_size)
            .max(state.in_use);
        if state.in_use + state.free.len() >= target_total {
            return; // drop the session
        }

        state.free.push(item.session.clone());
    }

    pub fn abort(&self) {
        let mut state = self.state.write();
        state.aborting = true;
        state.free.clear();
    }

    pub fn free_count(&self) -> usize {
        self.state.read().free.len()
    }

    pub fn in_use_count(&self) -> usize {
        self.state.read().in_use
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::EngineSettings;

    fn setup(dir: &std::path::Path) -> (Arc<Kernel>, Arc<SessionPool>) {
        let kernel = Kernel::open(dir, "store", EngineSettings::default()).unwrap();
        let pool = SessionPool::new(
            kernel.clone(),
            PoolSettings {
                min_size: 2,
                adjustment_size: 2,
                eviction_period: std::time::Duration::from_secs(3600),
            },
        );
        (kernel, pool)
    }

    #[test]
    fn acquire_release_cycles() {
        let tmp = tempfile::tempdir().unwrap();
        let (kernel, pool) = setup(tmp.path());

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(pool.in_use_count(), 2);
        pool.release(a, false);
        pool.release(b, false);
        assert_eq!(pool.in_use_count(), 0);
        kernel.close(false);
    }

    #[test]
    fn error_release_discards_session() {
        let tmp = tempfile::tempdir().unwrap();
        let (kernel, pool) = setup(tmp.path());

        let item = pool.acquire().unwrap();
        let id = item.session().id();
        pool.release(item, true);

        // The discarded session never comes back out.
        for _ in 0..8 {
            let item = pool.acquire().unwrap();
            assert_ne!(item.session().id(), id);
            pool.release(item, false);
        }
        kernel.close(false);
    }

    #[test]
    fn aborting_pool_rejects_acquire() {
        let tmp = tempfile::tempdir().unwrap();
        let (kernel, pool) = setup(tmp.path());
        pool.abort();
        assert_eq!(pool.acquire().unwrap_err(), EngineError::TermInProgress);
        kernel.close(false);
    }

    #[test]
    fn release_with_active_transaction_rolls_back_and_discards() {
        let tmp = tempfile::tempdir().unwrap();
        let (kernel, pool) = setup(tmp.path());

        let item = pool.acquire().unwrap();
        item.session().begin_transaction().unwrap();
        pool.release(item, false);
        assert_eq!(pool.in_use_count(), 0);
        kernel.close(false);
    }
}
