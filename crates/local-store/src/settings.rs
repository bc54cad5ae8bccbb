use std::time::Duration;

use replikv_engine::settings::{EngineSettings, PoolSettings};

/// Column/behaviour flags of the local store, kept for format
/// compatibility with stores written before the LSN and primary-timestamp
/// columns existed.
#[derive(Clone, Copy, Debug)]
pub struct LocalStoreFlags {
    pub use_lsn_column: bool,
    pub use_last_modified_on_primary_column: bool,
}

impl Default for LocalStoreFlags {
    fn default() -> Self {
        Self {
            use_lsn_column: true,
            use_last_modified_on_primary_column: true,
        }
    }
}

#[derive(Clone, Debug)]
pub struct LocalStoreSettings {
    pub file_name: String,
    pub flags: LocalStoreFlags,
    pub engine: EngineSettings,
    pub pool: PoolSettings,
    /// Enumerations longer than this emit a warning trace.
    pub enumeration_perf_trace_threshold: Duration,
}

impl Default for LocalStoreSettings {
    fn default() -> Self {
        Self {
            file_name: "replikv".into(),
            flags: LocalStoreFlags::default(),
            engine: EngineSettings::default(),
            pool: PoolSettings::default(),
            enumeration_perf_trace_threshold: Duration::from_secs(10),
        }
    }
}
