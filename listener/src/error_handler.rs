use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tracing::{error, warn};

use crate::errors::ContainerError;
use crate::listener::ListenerInfo;
use crate::types::{ConsumerRecord, Partition, TopicPartitionOffset};

/// What the bridge should do with the records around a failure.
pub enum ErrorDisposition {
    /// The failure was recovered: commit through the failing record and keep
    /// iterating (subject to `is_ack_after_handle`).
    Recovered,
    /// Seek back and retain these records; the next poll replays them once
    /// their partitions unpause.
    Retain(Vec<ConsumerRecord>),
    /// Rethrow: the loop records a consumer-level error and continues.
    Bubble(anyhow::Error),
}

/// Pluggable policy for handler failures. Implementations decide between
/// recover-and-continue, seek-and-retry with retention, and bubbling up.
pub trait ErrorHandler: Send + Sync {
    /// Handles a single failing record. Returns true when the failure was
    /// recovered (the offset will be committed per `is_ack_after_handle`).
    fn handle_one(
        &self,
        _error: &ContainerError,
        _record: &ConsumerRecord,
        _info: &ListenerInfo,
    ) -> bool {
        false
    }

    /// Handles a failure with the unconsumed tail in hand (failing record
    /// first). Only called when `seeks_after_handling` is true or the
    /// failure was a commit-failed condition.
    fn handle_remaining(
        &self,
        error: &ContainerError,
        records: &[ConsumerRecord],
        info: &ListenerInfo,
    ) -> ErrorDisposition;

    /// Batch-listener failures.
    fn handle_batch(
        &self,
        error: &ContainerError,
        records: &[ConsumerRecord],
        info: &ListenerInfo,
    ) -> ErrorDisposition;

    /// Whether a recovered record's offset should be committed.
    fn is_ack_after_handle(&self) -> bool {
        true
    }

    /// Whether this handler wants the remaining records (and a seek-back)
    /// instead of a lone failing record.
    fn seeks_after_handling(&self) -> bool {
        false
    }

    /// How long retained records should wait before they are replayed.
    fn retry_backoff(&self) -> Duration {
        Duration::ZERO
    }

    /// Invoked on assignment; `pause` requests an immediate pause of the
    /// given partitions.
    fn on_partitions_assigned(
        &self,
        _partitions: &[Partition],
        _pause: &mut dyn FnMut(Vec<Partition>),
    ) {
    }

    /// The 1-based delivery attempt for a record, for the delivery-attempt
    /// header.
    fn delivery_attempt(&self, _tpo: &TopicPartitionOffset) -> i32 {
        1
    }
}

/// Seek-and-retry with bounded attempts, then recover.
///
/// Failures are retried by seeking the failing record back and replaying it
/// (plus its tail) until `max_attempts` is reached, with `backoff` between
/// attempts (enforced by the pause the retention implies). Exhausted records
/// go to the recoverer, which defaults to logging, and their offset is
/// committed so the partition can make progress.
pub struct DefaultErrorHandler {
    max_attempts: u32,
    backoff: Duration,
    recoverer: Option<Box<dyn Fn(&ConsumerRecord, &ContainerError) + Send + Sync>>,
    attempts: Mutex<HashMap<(Partition, i64), u32>>,
}

impl Default for DefaultErrorHandler {
    fn default() -> Self {
        Self::new(10, Duration::ZERO)
    }
}

impl DefaultErrorHandler {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            recoverer: None,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_recoverer(
        mut self,
        recoverer: impl Fn(&ConsumerRecord, &ContainerError) + Send + Sync + 'static,
    ) -> Self {
        self.recoverer = Some(Box::new(recoverer));
        self
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    fn bump_attempt(&self, record: &ConsumerRecord) -> u32 {
        let mut attempts = self.attempts.lock().expect("attempts mutex poisoned");
        let count = attempts
            .entry((record.partition(), record.offset))
            .or_insert(0);
        *count += 1;
        *count
    }

    fn clear_attempt(&self, record: &ConsumerRecord) {
        self.attempts
            .lock()
            .expect("attempts mutex poisoned")
            .remove(&(record.partition(), record.offset));
    }

    fn recover(&self, record: &ConsumerRecord, error: &ContainerError) {
        match &self.recoverer {
            Some(recoverer) => recoverer(record, error),
            None => error!(
                partition = %record.partition(),
                offset = record.offset,
                "retries exhausted, skipping record: {error}"
            ),
        }
        self.clear_attempt(record);
    }
}

impl ErrorHandler for DefaultErrorHandler {
    fn handle_one(
        &self,
        error: &ContainerError,
        record: &ConsumerRecord,
        _info: &ListenerInfo,
    ) -> bool {
        if self.bump_attempt(record) >= self.max_attempts {
            self.recover(record, error);
            true
        } else {
            false
        }
    }

    fn handle_remaining(
        &self,
        error: &ContainerError,
        records: &[ConsumerRecord],
        info: &ListenerInfo,
    ) -> ErrorDisposition {
        let Some(failed) = records.first() else {
            return ErrorDisposition::Recovered;
        };
        if self.handle_one(error, failed, info) {
            // the failed record is done; the tail replays without it
            ErrorDisposition::Retain(records[1..].to_vec())
        } else {
            warn!(
                partition = %failed.partition(),
                offset = failed.offset,
                "seeking back for retry: {error}"
            );
            ErrorDisposition::Retain(records.to_vec())
        }
    }

    fn handle_batch(
        &self,
        error: &ContainerError,
        records: &[ConsumerRecord],
        info: &ListenerInfo,
    ) -> ErrorDisposition {
        // batches retry as a unit; attempts are tracked on the first record
        self.handle_remaining(error, records, info)
    }

    fn seeks_after_handling(&self) -> bool {
        true
    }

    fn retry_backoff(&self) -> Duration {
        self.backoff
    }

    fn delivery_attempt(&self, tpo: &TopicPartitionOffset) -> i32 {
        let attempts = self.attempts.lock().expect("attempts mutex poisoned");
        attempts
            .get(&(tpo.partition.clone(), tpo.offset))
            .map(|count| *count as i32 + 1)
            .unwrap_or(1)
    }
}

/// Decision after a transaction rollback.
pub enum RollbackDisposition {
    /// Seek back and re-process the records in a new transaction.
    Reprocess,
    /// Skip the failed record: commit its offset (in a new transaction when
    /// `is_process_in_transaction`) and continue with the rest.
    SkipAndCommit,
    /// Give up and surface the error to the loop.
    Raise(anyhow::Error),
}

/// Invoked with the unprocessed tail when a transaction rolled back.
pub trait AfterRollbackProcessor: Send + Sync {
    fn process(
        &self,
        records: &[ConsumerRecord],
        error: &ContainerError,
        info: &ListenerInfo,
    ) -> RollbackDisposition;

    /// Whether `SkipAndCommit` offsets should be sent in a new transaction.
    fn is_process_in_transaction(&self) -> bool {
        false
    }
}

/// Re-process up to `max_attempts`, then skip-and-commit: the transactional
/// sibling of [`DefaultErrorHandler`].
pub struct DefaultAfterRollbackProcessor {
    max_attempts: u32,
    attempts: Mutex<HashMap<(Partition, i64), u32>>,
    process_in_transaction: bool,
}

impl Default for DefaultAfterRollbackProcessor {
    fn default() -> Self {
        Self::new(10, true)
    }
}

impl DefaultAfterRollbackProcessor {
    pub fn new(max_attempts: u32, process_in_transaction: bool) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            attempts: Mutex::new(HashMap::new()),
            process_in_transaction,
        }
    }
}

impl AfterRollbackProcessor for DefaultAfterRollbackProcessor {
    fn process(
        &self,
        records: &[ConsumerRecord],
        error: &ContainerError,
        _info: &ListenerInfo,
    ) -> RollbackDisposition {
        let Some(failed) = records.first() else {
            return RollbackDisposition::Reprocess;
        };
        let key = (failed.partition(), failed.offset);
        let mut attempts = self.attempts.lock().expect("attempts mutex poisoned");
        let count = attempts.entry(key.clone()).or_insert(0);
        *count += 1;
        if *count >= self.max_attempts {
            attempts.remove(&key);
            error!(
                partition = %failed.partition(),
                offset = failed.offset,
                "rollback retries exhausted, skipping record: {error}"
            );
            RollbackDisposition::SkipAndCommit
        } else {
            RollbackDisposition::Reprocess
        }
    }

    fn is_process_in_transaction(&self) -> bool {
        self.process_in_transaction
    }
}
