use std::time::Duration;

/// Engine instance settings.  Several of these are sizing hints honoured on
/// a best-effort basis by the kernel; all are part of the open contract.
#[derive(Clone, Debug)]
pub struct EngineSettings {
    pub max_instances: usize,
    pub max_sessions: usize,
    pub max_open_tables: usize,
    pub max_cursors: usize,
    pub max_version_pages: usize,
    pub log_file_size_kb: usize,
    pub log_buffers_kb: usize,
    pub cache_min_mb: usize,
    pub cache_max_mb: usize,
    pub page_size_kb: usize,
    pub circular_log: bool,
    pub compaction_threshold_mb: u64,
    pub max_async_commit_delay: Duration,
    pub auto_compaction: bool,
    pub background_maintenance: bool,
    pub scan_throttle: usize,
    pub scan_interval_min: Duration,
    pub scan_interval_max: Duration,
    pub assert_on_fatal_error: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_instances: 16,
            max_sessions: 512,
            max_open_tables: 1024,
            max_cursors: 2048,
            max_version_pages: 16 * 1024,
            log_file_size_kb: 5 * 1024,
            log_buffers_kb: 1024,
            cache_min_mb: 2,
            cache_max_mb: 256,
            page_size_kb: 8,
            circular_log: true,
            compaction_threshold_mb: 500,
            max_async_commit_delay: Duration::from_millis(200),
            auto_compaction: true,
            background_maintenance: true,
            scan_throttle: 0,
            scan_interval_min: Duration::from_secs(4 * 3600),
            scan_interval_max: Duration::from_secs(7 * 24 * 3600),
            assert_on_fatal_error: false,
        }
    }
}

/// Session pool sizing.
#[derive(Clone, Copy, Debug)]
pub struct PoolSettings {
    pub min_size: usize,
    pub adjustment_size: usize,
    pub eviction_period: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_size: 4,
            adjustment_size: 4,
            eviction_period: Duration::from_secs(60),
        }
    }
}
