//! Full-copy machinery shared between primary and joining secondaries:
//! the copy-context handshake payload, zip archive helpers, and the
//! reference-counted per-LSN archive manager for file-stream physical
//! copies.

pub mod archive;
pub mod context;
pub mod manager;

pub use archive::{create_archive, extract_archive};
pub use context::CopyContextData;
pub use manager::{FileStreamFullCopyContext, FileStreamFullCopyManager};
