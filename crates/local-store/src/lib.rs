//! Single-table key-value store over the engine adapter: schema limits,
//! CRUD by `(type, key)`, prefix and LSN-range enumerations, and store
//! transactions drawn from the engine session pool.

pub mod enumeration;
pub mod open_queue;
pub mod settings;
pub mod store;
pub mod transaction;

pub use enumeration::{LsnEnumeration, PrimaryEnumeration};
pub use open_queue::OpenJobQueue;
pub use settings::LocalStoreSettings;
pub use store::LocalStore;
pub use transaction::StoreTransaction;

/// `check_seq` value meaning "accept any current sequence number".
pub const SEQUENCE_NUMBER_IGNORE: i64 = 0;

pub const MAX_TYPE_LENGTH_CHARS: usize = 256;
pub const MAX_KEY_LENGTH_CHARS: usize = 64 * 1024;
pub const MAX_VALUE_LENGTH_BYTES: usize = 2 * 1024 * 1024 * 1024 - 1;
