//! Store transactions: one pooled engine session held for the transaction
//! lifetime, with fail-fast error poisoning.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use replikv_engine::instance::{CommitWaiter, EngineInstance};
use replikv_engine::kernel::CommitId;
use replikv_engine::pool::PoolItem;
use replikv_engine::session::Session;
use replikv_primitives::errors::{StoreError, StoreResult};

pub struct StoreTransaction {
    instance: Arc<EngineInstance>,
    item: Mutex<Option<PoolItem>>,
    poison: Mutex<Option<StoreError>>,
}

impl StoreTransaction {
    pub(crate) fn begin(instance: Arc<EngineInstance>) -> StoreResult<Self> {
        let item = instance.acquire_pool_item()?;
        item.session()
            .begin_transaction()
            .map_err(replikv_engine::error::engine_to_store_error)?;
        Ok(Self {
            instance,
            item: Mutex::new(Some(item)),
            poison: Mutex::new(None),
        })
    }

    /// Fails fast once a sequence-check violation (or similar) poisoned the
    /// transaction, and after release.
    pub fn check_active(&self) -> StoreResult<()> {
        if let Some(e) = self.poison.lock().clone() {
            return Err(e);
        }
        if self.item.lock().is_none() {
            return Err(StoreError::TransactionNotActive);
        }
        Ok(())
    }

    pub(crate) fn poison(&self, e: &StoreError) {
        *self.poison.lock() = Some(e.clone());
    }

    pub fn is_poisoned(&self) -> bool {
        self.poison.lock().is_some()
    }

    pub(crate) fn with_session<T>(
        &self,
        f: impl FnOnce(&Arc<Session>) -> StoreResult<T>,
    ) -> StoreResult<T> {
        self.check_active()?;
        let guard = self.item.lock();
        let item = guard.as_ref().ok_or(StoreError::TransactionNotActive)?;
        f(item.session())
    }

    pub(crate) fn session_clone(&self) -> StoreResult<Arc<Session>> {
        self.check_active()?;
        let guard = self.item.lock();
        Ok(guard
            .as_ref()
            .ok_or(StoreError::TransactionNotActive)?
            .session()
            .clone())
    }

    /// Issues the lazy commit and hands back the waiter resolved by the
    /// engine's commit callback at durability.
    pub fn commit_async(&self, timeout: Option<Duration>) -> StoreResult<(CommitId, CommitWaiter)> {
        self.check_active()?;
        let mut guard = self.item.lock();
        let item = guard.take().ok_or(StoreError::TransactionNotActive)?;
        let result = self.instance.commit_async(&item, timeout);
        self.instance.release_pool_item(item, result.is_err());
        result
    }

    /// Commit with a synchronous durable barrier.
    pub fn commit_durable(&self, timeout: Option<Duration>) -> StoreResult<CommitId> {
        self.check_active()?;
        let mut guard = self.item.lock();
        let item = guard.take().ok_or(StoreError::TransactionNotActive)?;
        let result = (|| {
            let (id, _waiter) = self.instance.commit_async(&item, timeout)?;
            self.instance.commit_durable(&item, id)?;
            Ok(id)
        })();
        self.instance.release_pool_item(item, result.is_err());
        result
    }

    pub fn rollback(&self) {
        let mut guard = self.item.lock();
        if let Some(item) = guard.take() {
            item.session().rollback_if_active();
            self.instance
                .release_pool_item(item, self.poison.lock().is_some());
        }
    }

    /// Drops the pooled session out from under the transaction; any later
    /// operation observes `TransactionNotActive`.  Used by the transaction
    /// tracker to unwind leaked transactions on role change.
    pub fn force_release(&self) -> bool {
        let mut guard = self.item.lock();
        match guard.take() {
            Some(item) => {
                item.session().rollback_if_active();
                self.instance.release_pool_item(item, true);
                *self.poison.lock() = Some(StoreError::TransactionNotActive);
                true
            }
            None => false,
        }
    }
}

impl Drop for StoreTransaction {
    fn drop(&mut self) {
        self.rollback();
    }
}
