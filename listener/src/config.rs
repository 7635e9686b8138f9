use std::time::Duration;

/// When the runtime commits offsets for successfully handled records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// Commit after each successfully handled record.
    Record,
    /// Commit after every poll's records are all handled.
    Batch,
    /// Commit no more often than every `ack_time`.
    Time,
    /// Commit every `ack_count` handled records.
    Count,
    /// Whichever of count or time triggers first.
    CountTime,
    /// User calls `acknowledge()`; commit happens at the next poll boundary.
    Manual,
    /// User calls `acknowledge()`; commit is attempted synchronously from the
    /// consumer thread.
    ManualImmediate,
}

impl AckMode {
    pub fn is_manual(&self) -> bool {
        matches!(self, AckMode::Manual | AckMode::ManualImmediate)
    }
}

/// Whether to commit the current position of newly assigned partitions that
/// have no committed offset yet, protecting the group against a later offset
/// reset by another consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentCommitOption {
    Never,
    Always,
    /// Only when the reset policy is "latest".
    LatestOnly,
    /// Only when the reset policy is "latest" and the container is not
    /// transactional.
    LatestOnlyNoTx,
}

/// Exactly-once semantics mode. librdkafka only implements group-metadata
/// offset forwarding; `V1` is accepted for configuration compatibility and
/// behaves as `V2` with a warning at build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EosMode {
    V1,
    V2,
}

/// Level used for commit logging; errors always log at error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitLogLevel {
    Trace,
    Debug,
    Info,
}

/// Per-container runtime properties. These are programmatic (one container
/// per listener, many containers per process), unlike the process-wide
/// envconfig-driven client settings in `common-kafka`.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Max time one blocking poll waits for records.
    pub poll_timeout: Duration,
    /// Poll timeout while the whole consumer is paused, kept short so pause
    /// and stop requests stay responsive.
    pub poll_timeout_while_paused: Duration,
    /// Cap on how many messages one loop iteration gathers before dispatch.
    pub max_poll_records: usize,
    /// Optional sleep between polls, capped against the group's max poll
    /// interval so the consumer is never evicted.
    pub idle_between_polls: Duration,
    /// Multiplier applied to `idle_between_polls` until the first record has
    /// been seen.
    pub idle_before_data_multiplier: f64,
    /// Publish a container-idle event when no records arrive for this long.
    pub idle_event_interval: Option<Duration>,
    /// Publish partition-idle events when one partition stays silent.
    pub idle_partition_event_interval: Option<Duration>,
    /// How often the liveness monitor checks the poll loop.
    pub monitor_interval: Duration,
    /// The monitor flags the container non-responsive when no poll happened
    /// for `poll_timeout * no_poll_threshold`.
    pub no_poll_threshold: f64,
    /// How long `start()` waits for the consumer thread to come up.
    pub consumer_start_timeout: Duration,
    pub ack_mode: AckMode,
    /// Commit window for `AckMode::Count` / `AckMode::CountTime`.
    pub ack_count: u32,
    /// Commit window for `AckMode::Time` / `AckMode::CountTime`.
    pub ack_time: Duration,
    /// Use synchronous commits; asynchronous commits trade latency for
    /// weaker failure reporting.
    pub sync_commits: bool,
    pub sync_commit_timeout: Duration,
    /// Retries for retriable commit failures (sync commits only).
    pub commit_retries: u32,
    /// Allow acknowledgements to arrive out of order; commits are re-ordered
    /// through per-partition offset queues.
    pub async_acks: bool,
    /// When set, authentication/authorization failures are retried at this
    /// interval instead of stopping the container.
    pub auth_exception_retry_interval: Option<Duration>,
    /// Stop the container when the transactional producer is fenced.
    pub stop_container_when_fenced: bool,
    /// On stop, break mid-batch instead of finishing the current record.
    pub stop_immediate: bool,
    /// On pause, stop dispatching mid-batch and retain the tail for later.
    pub pause_immediate: bool,
    /// Re-send transactional offsets after idle polls whose position moved
    /// past the last commit (e.g. due to compacted-away records).
    pub fix_tx_offsets: bool,
    /// Batch listeners receive one partition's slice per invocation.
    pub sub_batch_per_partition: bool,
    /// After a batch transaction rollback, run recovery through the
    /// after-rollback processor instead of plain reseek.
    pub batch_recover_after_rollback: bool,
    /// Write the delivery-attempt header before dispatch.
    pub delivery_attempt_header: bool,
    pub assignment_commit_option: AssignmentCommitOption,
    pub eos_mode: EosMode,
    pub commit_log_level: CommitLogLevel,
    /// Wrap each handler invocation in a tracing span.
    pub observation_enabled: bool,
    /// Emit `metrics` counters/histograms for records, batches and failures.
    pub micrometer_enabled: bool,
    /// Opaque bytes exposed to handlers through [`crate::ListenerInfo`].
    pub listener_info: Option<Vec<u8>>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(5),
            poll_timeout_while_paused: Duration::from_millis(100),
            max_poll_records: 500,
            idle_between_polls: Duration::ZERO,
            idle_before_data_multiplier: 5.0,
            idle_event_interval: None,
            idle_partition_event_interval: None,
            monitor_interval: Duration::from_secs(30),
            no_poll_threshold: 3.0,
            consumer_start_timeout: Duration::from_secs(30),
            ack_mode: AckMode::Batch,
            ack_count: 1,
            ack_time: Duration::from_secs(5),
            sync_commits: true,
            sync_commit_timeout: Duration::from_secs(30),
            commit_retries: 3,
            async_acks: false,
            auth_exception_retry_interval: None,
            stop_container_when_fenced: false,
            stop_immediate: false,
            pause_immediate: false,
            fix_tx_offsets: false,
            sub_batch_per_partition: false,
            batch_recover_after_rollback: false,
            delivery_attempt_header: false,
            assignment_commit_option: AssignmentCommitOption::LatestOnlyNoTx,
            eos_mode: EosMode::V2,
            commit_log_level: CommitLogLevel::Debug,
            observation_enabled: false,
            micrometer_enabled: true,
            listener_info: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_batch_mode_sync_commits() {
        let config = ContainerConfig::default();
        assert_eq!(config.ack_mode, AckMode::Batch);
        assert!(config.sync_commits);
        assert!(!config.async_acks);
        assert_eq!(
            config.assignment_commit_option,
            AssignmentCommitOption::LatestOnlyNoTx
        );
        assert!(config.poll_timeout > config.poll_timeout_while_paused);
    }

    #[test]
    fn manual_modes_are_manual() {
        assert!(AckMode::Manual.is_manual());
        assert!(AckMode::ManualImmediate.is_manual());
        assert!(!AckMode::Batch.is_manual());
        assert!(!AckMode::Record.is_manual());
    }
}
