//! Live migration of a key-value store into a second backend: write
//! mirroring through the core's transaction events, bulk row migration,
//! a phase state machine, and blob-store backup/restore of the source.

pub mod blob;
pub mod migrator;

pub use blob::{BlobStore, ConfigSection, FileBlobStore, SecretStore};
pub use migrator::{KeyValueStoreMigrator, MigrationPhase, MigrationSettings};
