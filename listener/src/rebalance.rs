use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use rdkafka::config::RDKafkaLogLevel;
use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::{ClientContext, Offset, TopicPartitionList};
use tracing::{debug, error, info, warn};

use crate::ack::{AckChannel, AsyncAckState};
use crate::config::{AssignmentCommitOption, CommitLogLevel, ContainerConfig};
use crate::error_handler::ErrorHandler;
use crate::events::EventSink;
use crate::listener::ListenerInfo;
use crate::metric_consts::{COMMITS, COMMIT_FAILURES, REBALANCES};
use crate::offsets::OffsetLedger;
use crate::pause::PauseController;
use crate::seeks::SeekCallback;
use crate::types::{commit_list, ConsumerRecord, Partition};

/// User hooks around partition ownership changes, invoked on the consumer
/// thread from inside the rebalance callback.
pub trait RebalanceHandler: Send + Sync {
    fn on_partitions_assigned(&self, _partitions: &[Partition]) {}

    /// Runs while the revoked partitions are still owned, before the
    /// pre-revoke commit.
    fn on_partitions_revoked_before_commit(&self, _partitions: &[Partition]) {}

    fn on_partitions_revoked_after_commit(&self, _partitions: &[Partition]) {}

    /// Runs when ownership was lost without a commit opportunity.
    fn on_partitions_lost(&self, _partitions: &[Partition]) {}
}

/// Hook invoked with the position map and a seek callback when partitions
/// are assigned, for seek-aware handlers.
pub type SeekAwareHook = Arc<dyn Fn(&HashMap<Partition, i64>, &SeekCallback) + Send + Sync>;

/// Records held back by the error handler for replay, with the partitions
/// that must stay paused until the replay happens.
pub(crate) struct RetainedRecords {
    pub records: Vec<ConsumerRecord>,
    pub partitions: HashSet<Partition>,
}

/// State shared between the run loop, the rebalance callbacks (which fire on
/// the consumer thread inside `poll`), the acknowledgment handles, and the
/// monitor thread. Locks are held briefly and never across a call into the
/// consumer.
pub(crate) struct ListenerShared {
    pub container_id: String,
    pub info: ListenerInfo,
    pub config: ContainerConfig,
    /// The reset policy the consumer was created with, for the assignment
    /// commit option and the no-offset fatal condition.
    pub offset_reset: String,
    pub auto_commit: bool,
    pub transactional: bool,
    pub ledger: Mutex<OffsetLedger>,
    pub acks: Mutex<AckChannel>,
    pub async_state: Option<Arc<Mutex<AsyncAckState>>>,
    pub assigned: Mutex<HashSet<Partition>>,
    pub pause: Mutex<PauseController>,
    pub retained: Mutex<Option<RetainedRecords>>,
    pub seek_callback: SeekCallback,
    pub events: Arc<dyn EventSink>,
    pub rebalance_handler: Option<Arc<dyn RebalanceHandler>>,
    pub error_handler: Arc<dyn ErrorHandler>,
    pub seek_aware: Option<SeekAwareHook>,
    /// Optional probe invoked by the monitor with the current health verdict,
    /// for wiring into a process-level health registry.
    pub liveness: Option<Arc<dyn Fn(bool) + Send + Sync>>,
    pub last_poll: Mutex<Instant>,
    /// Bumped on every ownership change; lets the loop notice rebalances
    /// that happened inside a poll.
    pub rebalance_generation: AtomicU64,
    /// Subscribed topics (empty for a manual assignment).
    pub topics: Vec<String>,
    /// Asks the loop to drop and re-take the subscription, forcing a group
    /// rebalance.
    pub enforce_rebalance: AtomicBool,
}

/// What happened to a batch of offsets we tried to put on the broker.
pub(crate) enum CommitOutcome {
    Committed,
    /// A rebalance was in progress; the commits were parked on the ledger.
    RetainedForRebalance,
    Failed(KafkaError),
}

impl ListenerShared {
    pub fn assigned_snapshot(&self) -> HashSet<Partition> {
        self.assigned
            .lock()
            .expect("assigned mutex poisoned")
            .clone()
    }

    pub fn async_backpressure(&self) -> bool {
        match &self.async_state {
            Some(state) => {
                let mut state = state.lock().expect("async ack mutex poisoned");
                let backpressure = !state.deferred.is_empty();
                state.paused_for_async_acks = backpressure;
                backpressure
            }
            None => false,
        }
    }

    /// Drains the ack channel into the ledger. Returns how many acks landed.
    pub fn drain_acks(&self) -> usize {
        let entries = self.acks.lock().expect("ack channel mutex poisoned").drain();
        if entries.is_empty() {
            return 0;
        }
        let mut ledger = self.ledger.lock().expect("ledger mutex poisoned");
        let count = entries.len();
        for entry in entries {
            ledger.add_pending(entry.partition, entry.next_offset);
        }
        count
    }

    /// Synchronously (or asynchronously, per config) commits the given
    /// next-fetch offsets, retrying retriable failures and parking the
    /// commits when a rebalance is in progress.
    pub fn commit_now<C: ConsumerContext>(
        &self,
        consumer: &BaseConsumer<C>,
        commits: HashMap<Partition, i64>,
    ) -> CommitOutcome {
        if commits.is_empty() {
            return CommitOutcome::Committed;
        }
        let tpl = match commit_list(commits.iter()) {
            Ok(tpl) => tpl,
            Err(err) => return CommitOutcome::Failed(err),
        };

        let mode = if self.config.sync_commits {
            rdkafka::consumer::CommitMode::Sync
        } else {
            rdkafka::consumer::CommitMode::Async
        };

        let mut attempt = 0;
        loop {
            match consumer.commit(&tpl, mode) {
                Ok(()) => {
                    self.log_commit(&commits);
                    if self.config.micrometer_enabled {
                        metrics::counter!(COMMITS).increment(commits.len() as u64);
                    }
                    self.ledger
                        .lock()
                        .expect("ledger mutex poisoned")
                        .record_committed(&commits);
                    return CommitOutcome::Committed;
                }
                Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::RebalanceInProgress)) => {
                    info!("commit hit a rebalance in progress; retaining offsets");
                    self.ledger
                        .lock()
                        .expect("ledger mutex poisoned")
                        .retain_for_rebalance(commits);
                    return CommitOutcome::RetainedForRebalance;
                }
                Err(err) if attempt < self.config.commit_retries && is_retriable_commit(&err) => {
                    attempt += 1;
                    warn!("retriable commit failure (attempt {attempt}): {err}");
                }
                Err(err) => {
                    if self.config.micrometer_enabled {
                        metrics::counter!(COMMIT_FAILURES).increment(1);
                    }
                    error!("commit failed: {err}");
                    return CommitOutcome::Failed(err);
                }
            }
        }
    }

    fn log_commit(&self, commits: &HashMap<Partition, i64>) {
        match self.config.commit_log_level {
            CommitLogLevel::Trace => {
                tracing::trace!(container_id = %self.container_id, ?commits, "committed offsets")
            }
            CommitLogLevel::Debug => {
                debug!(container_id = %self.container_id, ?commits, "committed offsets")
            }
            CommitLogLevel::Info => {
                info!(container_id = %self.container_id, ?commits, "committed offsets")
            }
        }
    }

    fn on_partitions_revoked<C: ConsumerContext>(
        &self,
        consumer: &BaseConsumer<C>,
        revoked: Vec<Partition>,
    ) {
        info!(container_id = %self.container_id, count = revoked.len(), "partitions revoked");

        // drop retained records belonging to revoked partitions
        {
            let mut retained = self.retained.lock().expect("retained mutex poisoned");
            if let Some(buffer) = retained.as_mut() {
                buffer
                    .records
                    .retain(|record| !revoked.contains(&record.partition()));
                for partition in &revoked {
                    buffer.partitions.remove(partition);
                }
                if buffer.records.is_empty() {
                    *retained = None;
                }
            }
        }

        if let Some(handler) = &self.rebalance_handler {
            handler.on_partitions_revoked_before_commit(&revoked);
        }

        // commit everything pending while the partitions are still owned
        if !self.auto_commit {
            self.drain_acks();
            let commits = self
                .ledger
                .lock()
                .expect("ledger mutex poisoned")
                .take_pending();
            match self.commit_now(consumer, commits) {
                CommitOutcome::Committed | CommitOutcome::RetainedForRebalance => {}
                CommitOutcome::Failed(err) => {
                    warn!("pre-revoke commit failed: {err}");
                }
            }
        }

        if let Some(handler) = &self.rebalance_handler {
            handler.on_partitions_revoked_after_commit(&revoked);
        }

        self.scrub_partitions(&revoked);
    }

    fn on_partitions_lost(&self, lost: Vec<Partition>) {
        warn!(container_id = %self.container_id, count = lost.len(),
            "partitions lost without a commit opportunity");
        // queued acks for lost partitions are moot; keep the rest pending
        {
            let survivors = self
                .acks
                .lock()
                .expect("ack channel mutex poisoned")
                .drop_for(&lost);
            let mut ledger = self.ledger.lock().expect("ledger mutex poisoned");
            for entry in survivors {
                ledger.add_pending(entry.partition, entry.next_offset);
            }
        }
        {
            let mut retained = self.retained.lock().expect("retained mutex poisoned");
            if let Some(buffer) = retained.as_mut() {
                buffer
                    .records
                    .retain(|record| !lost.contains(&record.partition()));
                for partition in &lost {
                    buffer.partitions.remove(partition);
                }
                if buffer.records.is_empty() {
                    *retained = None;
                }
            }
        }
        if let Some(handler) = &self.rebalance_handler {
            handler.on_partitions_lost(&lost);
        }
        self.scrub_partitions(&lost);
    }

    fn scrub_partitions(&self, gone: &[Partition]) {
        self.ledger
            .lock()
            .expect("ledger mutex poisoned")
            .remove_revoked(gone);
        if let Some(state) = &self.async_state {
            let mut state = state.lock().expect("async ack mutex poisoned");
            for partition in gone {
                state.deferred.remove_partition(partition);
            }
        }
        self.pause
            .lock()
            .expect("pause mutex poisoned")
            .drop_revoked_retention(gone);
        {
            let mut assigned = self.assigned.lock().expect("assigned mutex poisoned");
            for partition in gone {
                assigned.remove(partition);
            }
        }
        self.rebalance_generation.fetch_add(1, Ordering::SeqCst);
    }

    fn on_partitions_assigned<C: ConsumerContext>(
        &self,
        consumer: &BaseConsumer<C>,
        assigned_now: Vec<Partition>,
    ) {
        info!(container_id = %self.container_id, count = assigned_now.len(), "partitions assigned");
        if self.config.micrometer_enabled {
            metrics::counter!(REBALANCES).increment(1);
        }

        let assigned_set: HashSet<Partition> = {
            let mut assigned = self.assigned.lock().expect("assigned mutex poisoned");
            assigned.extend(assigned_now.iter().cloned());
            assigned.clone()
        };

        // Kafka cleared all pauses across the rebalance; re-apply before any
        // records for the new assignment can be fetched
        let backpressure = self.async_backpressure();
        {
            let mut pause = self.pause.lock().expect("pause mutex poisoned");
            pause.reset_applied();
            pause.reconcile(
                consumer,
                &assigned_set,
                backpressure,
                false,
                self.events.as_ref(),
                &self.container_id,
            );
        }

        self.apply_assignment_commit(consumer, &assigned_now);

        // flush commits parked during the rebalance, for partitions we kept
        let retained = self
            .ledger
            .lock()
            .expect("ledger mutex poisoned")
            .take_retained(|partition| assigned_set.contains(partition));
        if !retained.is_empty() {
            if let CommitOutcome::Failed(err) = self.commit_now(consumer, retained) {
                warn!("replaying retained commits failed: {err}");
            }
        }

        if let Some(hook) = &self.seek_aware {
            let positions = self.current_positions(consumer, &assigned_now);
            hook(&positions, &self.seek_callback);
        }

        if let Some(handler) = &self.rebalance_handler {
            handler.on_partitions_assigned(&assigned_now);
        }

        // the error handler may ask for assigned partitions to start paused
        {
            let pause = self.pause.lock().expect("pause mutex poisoned");
            let requests = pause.requests().clone();
            drop(pause);
            let mut pause_cb = |partitions: Vec<Partition>| {
                let mut tpl = TopicPartitionList::new();
                for partition in &partitions {
                    tpl.add_partition(&partition.topic, partition.partition);
                    requests.request_partition_pause(partition.clone());
                }
                if let Err(err) = consumer.pause(&tpl) {
                    warn!("error handler pause request failed: {err}");
                }
            };
            self.error_handler
                .on_partitions_assigned(&assigned_now, &mut pause_cb);
        }

        self.rebalance_generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Commits the current position of newly assigned partitions that have
    /// no stored commit, per the configured assignment commit option.
    fn apply_assignment_commit<C: ConsumerContext>(
        &self,
        consumer: &BaseConsumer<C>,
        assigned_now: &[Partition],
    ) {
        let enabled = match self.config.assignment_commit_option {
            AssignmentCommitOption::Never => false,
            AssignmentCommitOption::Always => true,
            AssignmentCommitOption::LatestOnly => self.offset_reset == "latest",
            AssignmentCommitOption::LatestOnlyNoTx => {
                self.offset_reset == "latest" && !self.transactional
            }
        };
        if !enabled || assigned_now.is_empty() {
            return;
        }

        let mut tpl = TopicPartitionList::new();
        for partition in assigned_now {
            tpl.add_partition(&partition.topic, partition.partition);
        }
        let committed = match consumer.committed_offsets(tpl, self.config.sync_commit_timeout) {
            Ok(committed) => committed,
            Err(err) => {
                warn!("fetching committed offsets on assignment failed: {err}");
                return;
            }
        };

        let mut to_commit = HashMap::new();
        for elem in committed.elements() {
            if elem.offset() != Offset::Invalid {
                continue; // this partition already has a stored commit
            }
            let partition = Partition::new(elem.topic(), elem.partition());
            // positions are unknown until the first fetch, so anchor to the
            // watermark the reset policy would pick
            match consumer.fetch_watermarks(
                elem.topic(),
                elem.partition(),
                self.config.sync_commit_timeout,
            ) {
                Ok((low, high)) => {
                    let offset = if self.offset_reset == "latest" { high } else { low };
                    to_commit.insert(partition, offset);
                }
                Err(err) => {
                    warn!(%partition, "watermark fetch for assignment commit failed: {err}");
                }
            }
        }

        if !to_commit.is_empty() {
            info!(count = to_commit.len(), "committing initial offsets for new assignment");
            if let CommitOutcome::Failed(err) = self.commit_now(consumer, to_commit) {
                warn!("assignment commit failed: {err}");
            }
        }
    }

    fn current_positions<C: ConsumerContext>(
        &self,
        consumer: &BaseConsumer<C>,
        partitions: &[Partition],
    ) -> HashMap<Partition, i64> {
        let mut positions = HashMap::new();
        let position_map = consumer
            .position()
            .map(|tpl| tpl.to_topic_map())
            .unwrap_or_default();
        for partition in partitions {
            let position = position_map
                .get(&(partition.topic.clone(), partition.partition))
                .and_then(|offset| match offset {
                    Offset::Offset(o) => Some(*o),
                    _ => None,
                })
                .or_else(|| {
                    self.ledger
                        .lock()
                        .expect("ledger mutex poisoned")
                        .last_committed(partition)
                })
                .unwrap_or(-1);
            positions.insert(partition.clone(), position);
        }
        positions
    }
}

fn is_retriable_commit(err: &KafkaError) -> bool {
    matches!(
        err.rdkafka_error_code(),
        Some(
            RDKafkaErrorCode::RequestTimedOut
                | RDKafkaErrorCode::NetworkException
                | RDKafkaErrorCode::CoordinatorLoadInProgress
                | RDKafkaErrorCode::CoordinatorNotAvailable
                | RDKafkaErrorCode::NotCoordinator
        )
    )
}

fn partitions_of(tpl: &TopicPartitionList) -> Vec<Partition> {
    tpl.elements()
        .iter()
        .map(|elem| Partition::new(elem.topic(), elem.partition()))
        .collect()
}

/// The rdkafka client/consumer context for listener consumers: bridges
/// librdkafka logs into `tracing` and rebalance callbacks into the shared
/// state. Callbacks run on the consumer thread, inside `poll`.
pub struct ListenerContext {
    pub(crate) shared: Arc<ListenerShared>,
}

impl ListenerContext {
    pub(crate) fn new(shared: Arc<ListenerShared>) -> Self {
        Self { shared }
    }
}

impl ClientContext for ListenerContext {
    fn log(&self, level: RDKafkaLogLevel, fac: &str, log_message: &str) {
        match level {
            RDKafkaLogLevel::Emerg
            | RDKafkaLogLevel::Alert
            | RDKafkaLogLevel::Critical
            | RDKafkaLogLevel::Error => error!("librdkafka: {} {}", fac, log_message),
            RDKafkaLogLevel::Warning => warn!("librdkafka: {} {}", fac, log_message),
            RDKafkaLogLevel::Notice | RDKafkaLogLevel::Info => {
                info!("librdkafka: {} {}", fac, log_message)
            }
            RDKafkaLogLevel::Debug => debug!("librdkafka: {} {}", fac, log_message),
        }
    }
}

impl ConsumerContext for ListenerContext {
    fn pre_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Revoke(tpl) => {
                self.shared
                    .on_partitions_revoked(base_consumer, partitions_of(tpl));
            }
            Rebalance::Assign(_) => {}
            Rebalance::Error(err) => {
                warn!("rebalance error: {err}");
            }
        }
    }

    fn post_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(tpl) => {
                self.shared
                    .on_partitions_assigned(base_consumer, partitions_of(tpl));
            }
            Rebalance::Revoke(_) => {}
            Rebalance::Error(_) => {
                // ownership is gone and there is nothing left to commit
                let lost: Vec<Partition> =
                    self.shared.assigned_snapshot().into_iter().collect();
                if !lost.is_empty() {
                    self.shared.on_partitions_lost(lost);
                }
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => debug!(count = offsets.count(), "commit callback ok"),
            Err(err) => warn!("commit callback error: {err}"),
        }
    }
}
