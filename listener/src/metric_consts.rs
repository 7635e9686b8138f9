pub const RECORDS_PROCESSED: &str = "kafka_listener_records_processed_total";
pub const RECORDS_FAILED: &str = "kafka_listener_records_failed_total";
pub const BATCHES_PROCESSED: &str = "kafka_listener_batches_processed_total";
pub const BATCHES_FAILED: &str = "kafka_listener_batches_failed_total";
pub const HANDLER_TIME: &str = "kafka_listener_handler_duration_ms";
pub const COMMITS: &str = "kafka_listener_commits_total";
pub const COMMIT_FAILURES: &str = "kafka_listener_commit_failures_total";
pub const NACKS: &str = "kafka_listener_nacks_total";
pub const POLLS: &str = "kafka_listener_polls_total";
pub const POLL_BATCH_SIZE: &str = "kafka_listener_poll_batch_size";
pub const SEEKS_APPLIED: &str = "kafka_listener_seeks_applied_total";
pub const REBALANCES: &str = "kafka_listener_rebalances_total";
pub const TRANSACTIONS_ABORTED: &str = "kafka_listener_transactions_aborted_total";
pub const EMERGENCY_STOPS: &str = "kafka_listener_emergency_stops_total";
