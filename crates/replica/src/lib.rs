//! Replicated store core: the role state machine, primary commit path
//! with simple-transaction batching, epoch and progress-vector
//! bookkeeping, the secondary pump, and notification dispatch.

pub mod context;
pub mod copy;
pub mod epoch_store;
pub mod events;
pub mod fabric_time;
pub mod notifications;
pub mod paths;
pub mod pump;
pub mod replicator;
pub mod settings;
pub mod simple_tx;
pub mod state_machine;
pub mod store;
pub mod tombstone;
pub mod tracker;
pub mod transaction;
pub mod transport;
pub mod well_known;

pub use settings::{FullCopyMode, ReplicatedStoreSettings, SecondaryNotificationMode};
pub use state_machine::{StateMachine, StoreState};
pub use store::ReplicatedStore;
pub use transaction::ReplicatedTransaction;
