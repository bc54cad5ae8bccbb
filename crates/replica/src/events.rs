//! Transaction event seam.
//!
//! During live migration a handler mirrors every mutating call of the core
//! into a second backend, keyed by the source transaction's tracker id.

use replikv_primitives::errors::StoreResult;
use replikv_primitives::ids::ActivityId;

pub trait TxEventHandler: Send + Sync {
    fn on_create_transaction(&self, activity: ActivityId, tx_key: u64);

    fn on_insert(&self, tx_key: u64, row_type: &str, key: &str, value: &[u8]) -> StoreResult<()>;

    fn on_update(&self, tx_key: u64, row_type: &str, key: &str, value: &[u8]) -> StoreResult<()>;

    fn on_delete(&self, tx_key: u64, row_type: &str, key: &str) -> StoreResult<()>;

    fn on_commit(&self, activity: ActivityId, tx_key: u64) -> StoreResult<()>;

    fn on_release_transaction(&self, activity: ActivityId, tx_key: u64);
}
