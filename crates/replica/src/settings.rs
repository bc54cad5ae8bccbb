use std::time::Duration;

/// Secondary notification delivery mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SecondaryNotificationMode {
    #[default]
    Off,
    NonBlockingQuorumAcked,
    BlockSecondaryAck,
}

/// Full-copy mechanism selection on the primary.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FullCopyMode {
    /// Pick by database size and support flags.
    #[default]
    Default,
    Logical,
    FileStream,
}

#[derive(Clone, Debug)]
pub struct ReplicatedStoreSettings {
    /// Max wall-clock delay before closing a simple-tx group.
    pub commit_batching_period: Duration,
    /// Size cap on a group's accumulated replication operations.
    pub commit_batching_size_limit: usize,
    /// Bounds on the simple-tx batching window.
    pub transaction_low_watermark: usize,
    pub transaction_high_watermark: usize,
    /// Primary backpressure thresholds over the transport queue.
    pub throttle_replication_queue_operations: usize,
    pub throttle_replication_queue_bytes: usize,
    /// Typed fault/end-of-stream-ack protocol instead of null-only.
    pub enable_stream_faults: bool,
    /// Force a durable barrier when draining on role change.
    pub enable_flush_on_drain: bool,
    pub secondary_notification_mode: SecondaryNotificationMode,
    /// Grace period before the tracker force-releases leaked transactions.
    /// Zero disables tracking.
    pub transaction_drain_timeout: Duration,
    /// Prefetch data rows into cache before the copy-complete notification.
    pub enable_copy_notification_prefetch: bool,
    pub enumeration_perf_trace_threshold: Duration,
    /// Tombstone-per-(key, index) format instead of in-place LSN bumps.
    pub enable_tombstone_cleanup2: bool,
    pub full_copy_mode: FullCopyMode,
    /// Target cadence for log truncation on the primary.
    pub log_truncation_interval: Duration,
    /// Durable-barrier batching: flush when this many LSNs accumulated
    /// since the last flush (high-priority requests flush immediately).
    pub flush_batching_lsn_threshold: i64,
    /// Rows per paged copy operation.
    pub copy_page_row_count: usize,
    /// Chunk size for file-stream physical copy.
    pub file_stream_chunk_size: usize,
    /// Cap on concurrent pending file-stream copy requests; negative means
    /// unbounded.
    pub max_file_stream_full_copy_waiters: i64,
    /// Tombstones are reclaimable once this many LSNs old.
    pub tombstone_retention_lsns: i64,
    /// Refresh cadence of the persisted logical clock.
    pub fabric_time_refresh_interval: Duration,
    /// Retry back-off for the secondary pump's retryable failures.
    pub secondary_apply_retry_delay: Duration,
    pub secondary_apply_max_retries: usize,
}

impl Default for ReplicatedStoreSettings {
    fn default() -> Self {
        Self {
            commit_batching_period: Duration::from_millis(50),
            commit_batching_size_limit: 1024 * 1024,
            transaction_low_watermark: 256,
            transaction_high_watermark: 1024,
            throttle_replication_queue_operations: 4096,
            throttle_replication_queue_bytes: 64 * 1024 * 1024,
            enable_stream_faults: true,
            enable_flush_on_drain: true,
            secondary_notification_mode: SecondaryNotificationMode::Off,
            transaction_drain_timeout: Duration::from_secs(30),
            enable_copy_notification_prefetch: false,
            enumeration_perf_trace_threshold: Duration::from_secs(10),
            enable_tombstone_cleanup2: true,
            full_copy_mode: FullCopyMode::Default,
            log_truncation_interval: Duration::from_secs(600),
            flush_batching_lsn_threshold: 64,
            copy_page_row_count: 128,
            file_stream_chunk_size: 512 * 1024,
            max_file_stream_full_copy_waiters: 16,
            tombstone_retention_lsns: 10_000,
            fabric_time_refresh_interval: Duration::from_secs(10),
            secondary_apply_retry_delay: Duration::from_millis(100),
            secondary_apply_max_retries: 8,
        }
    }
}
