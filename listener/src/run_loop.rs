use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use common_kafka::transaction::TransactionalProducer;
use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::Offset;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn};

use crate::ack::{AckEntry, Acknowledgment, ImmediateCommitter, NackRequest};
use crate::config::AckMode;
use crate::error_handler::{AfterRollbackProcessor, ErrorDisposition, RollbackDisposition};
use crate::errors::{ContainerError, StopReason};
use crate::events::ContainerEvent;
use crate::interceptor::{BatchInterceptor, RecordInterceptor};
use crate::listener::MessageListener;
use crate::metric_consts::{
    BATCHES_FAILED, BATCHES_PROCESSED, EMERGENCY_STOPS, HANDLER_TIME, NACKS, POLLS,
    POLL_BATCH_SIZE, RECORDS_FAILED, RECORDS_PROCESSED, SEEKS_APPLIED, TRANSACTIONS_ABORTED,
};
use crate::rebalance::{CommitOutcome, ListenerContext, ListenerShared, RetainedRecords};
use crate::seeks::SeekQueue;
use crate::types::{
    commit_list, ConsumerRecord, Partition, DELIVERY_ATTEMPT_HEADER,
    DESERIALIZER_EXCEPTION_KEY_HEADER, DESERIALIZER_EXCEPTION_VALUE_HEADER,
};

/// Margin kept between the idle-between-polls sleep and the group's max poll
/// interval, so an idling consumer is never evicted.
const POLL_INTERVAL_MARGIN: Duration = Duration::from_secs(5);

/// Granularity of interruptible sleeps (auth retry, idle-between-polls).
const SLEEP_SLICE: Duration = Duration::from_millis(100);

enum LoopExit {
    Stop(StopReason),
}

enum PollFailure {
    Fatal(StopReason),
    AuthRetryable(KafkaError),
    Transient(KafkaError),
}

/// Outcome of a transactional invocation, steering the dispatch loop.
enum TxDispatch {
    Committed,
    /// The transaction rolled back and the records were sought back; stop
    /// iterating, they will be re-polled.
    Reprocess,
    /// The failed record was skipped (offset committed); continue with the
    /// next one.
    Skip,
}

/// The single thread of control for one consumer: polls, dispatches,
/// commits. Constructed and run on the consumer thread.
pub(crate) struct ListenerConsumer {
    consumer: Arc<BaseConsumer<ListenerContext>>,
    shared: Arc<ListenerShared>,
    listener: MessageListener,
    record_interceptors: Vec<Arc<dyn RecordInterceptor>>,
    batch_interceptors: Vec<Arc<dyn BatchInterceptor>>,
    after_rollback: Arc<dyn AfterRollbackProcessor>,
    producer: Option<Arc<TransactionalProducer>>,
    seek_queue: SeekQueue,
    shutdown: CancellationToken,
    async_failures: UnboundedReceiver<(ConsumerRecord, anyhow::Error)>,
    emergency_stop: Option<Box<dyn Fn() + Send>>,
    max_poll_interval: Duration,
    consumer_thread: ThreadId,
    nack_slot: Arc<Mutex<Option<NackRequest>>>,
    /// Seek-back targets captured at nack time, applied once the sleep ends.
    nack_seeks: HashMap<Partition, i64>,
    /// Error-handler backoff gating the replay of retained records.
    retained_not_before: Option<Instant>,
    first_data_seen: bool,
    last_receive: Instant,
    last_idle_event: Option<Instant>,
    partition_last_receive: HashMap<Partition, Instant>,
    partition_idle_published: HashMap<Partition, Instant>,
    last_poll_finished: Instant,
    auth_retry_in_progress: bool,
}

/// Commits through the shared state from an acknowledgment handle; weak so a
/// leaked handle cannot keep a closed consumer alive.
struct SharedImmediateCommitter {
    shared: Weak<ListenerShared>,
    consumer: Weak<BaseConsumer<ListenerContext>>,
}

impl ImmediateCommitter for SharedImmediateCommitter {
    fn commit_now(&self, partition: &Partition, next_offset: i64) -> Result<(), KafkaError> {
        let (Some(shared), Some(consumer)) = (self.shared.upgrade(), self.consumer.upgrade())
        else {
            return Err(KafkaError::Canceled);
        };
        let mut commits = HashMap::new();
        commits.insert(partition.clone(), next_offset);
        match shared.commit_now(&consumer, commits) {
            CommitOutcome::Committed | CommitOutcome::RetainedForRebalance => Ok(()),
            CommitOutcome::Failed(err) => Err(err),
        }
    }
}

impl ListenerConsumer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        consumer: Arc<BaseConsumer<ListenerContext>>,
        shared: Arc<ListenerShared>,
        listener: MessageListener,
        record_interceptors: Vec<Arc<dyn RecordInterceptor>>,
        batch_interceptors: Vec<Arc<dyn BatchInterceptor>>,
        after_rollback: Arc<dyn AfterRollbackProcessor>,
        producer: Option<Arc<TransactionalProducer>>,
        seek_queue: SeekQueue,
        shutdown: CancellationToken,
        async_failures: UnboundedReceiver<(ConsumerRecord, anyhow::Error)>,
        emergency_stop: Option<Box<dyn Fn() + Send>>,
        max_poll_interval: Duration,
    ) -> Self {
        let now = Instant::now();
        Self {
            consumer,
            shared,
            listener,
            record_interceptors,
            batch_interceptors,
            after_rollback,
            producer,
            seek_queue,
            shutdown,
            async_failures,
            emergency_stop,
            max_poll_interval,
            consumer_thread: std::thread::current().id(),
            nack_slot: Arc::new(Mutex::new(None)),
            nack_seeks: HashMap::new(),
            retained_not_before: None,
            first_data_seen: false,
            last_receive: now,
            last_idle_event: None,
            partition_last_receive: HashMap::new(),
            partition_idle_published: HashMap::new(),
            last_poll_finished: now,
            auth_retry_in_progress: false,
        }
    }

    /// Runs until stop or a fatal condition; never lets a panic escape.
    pub fn run(mut self) -> StopReason {
        let reason = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.run_inner()
        })) {
            Ok(reason) => reason,
            Err(panic) => {
                error!(
                    container_id = %self.shared.container_id,
                    "consumer thread panicked: {panic:?}"
                );
                StopReason::Error
            }
        };

        self.shared
            .events
            .publish(&self.shared.container_id, ContainerEvent::Stopping);

        // one final commit of everything already acknowledged
        if !self.shared.auto_commit && reason != StopReason::Fenced {
            self.shared.drain_acks();
            let commits = self
                .shared
                .ledger
                .lock()
                .expect("ledger mutex poisoned")
                .take_pending();
            if let CommitOutcome::Failed(err) = self.shared.commit_now(&self.consumer, commits) {
                warn!("final commit on stop failed: {err}");
            }
        }

        if matches!(reason, StopReason::Abnormal | StopReason::Error) {
            if let Some(emergency) = &self.emergency_stop {
                emergency();
            }
        }

        self.consumer.unsubscribe();

        self.shared.events.publish(
            &self.shared.container_id,
            ContainerEvent::Stopped { reason },
        );
        info!(container_id = %self.shared.container_id, ?reason, "consumer loop finished");
        reason
    }

    fn run_inner(&mut self) -> StopReason {
        loop {
            if self.shutdown.is_cancelled() {
                return StopReason::Normal;
            }
            match self.poll_and_invoke() {
                Ok(()) => {}
                Err(LoopExit::Stop(reason)) => return reason,
            }
        }
    }

    /// One iteration of the poll-and-invoke sequence.
    fn poll_and_invoke(&mut self) -> Result<(), LoopExit> {
        self.drain_async_failures();
        self.process_commits();
        self.fix_tx_offsets_if_needed();
        self.idle_between_polls();
        self.apply_seeks();
        self.enforce_rebalance_if_requested();
        self.expire_nack_if_due();
        self.reconcile_pauses();

        let records = self.poll_batch()?;
        let records = self.merge_retained(records)?;

        if records.is_empty() {
            self.publish_idle_events();
            return Ok(());
        }
        self.note_records_received(&records);

        if self.shutdown.is_cancelled() {
            debug!("stop requested; discarding {} polled records", records.len());
            return Ok(());
        }

        self.save_positions(&records);
        if self.listener.is_batch() {
            self.invoke_batch_listener(records)
        } else {
            self.invoke_record_listener(records)
        }
    }

    // ----- pre-poll phases -------------------------------------------------

    fn drain_async_failures(&mut self) {
        while let Ok((record, source)) = self.async_failures.try_recv() {
            let err = ContainerError::ListenerExecutionFailed {
                group_id: self.shared.info.group_id.clone(),
                source,
            };
            let recovered =
                self.shared
                    .error_handler
                    .handle_one(&err, &record, &self.shared.info);
            if recovered && self.shared.error_handler.is_ack_after_handle() {
                self.shared
                    .ledger
                    .lock()
                    .expect("ledger mutex poisoned")
                    .add_pending(record.partition(), record.offset + 1);
            }
        }
    }

    fn process_commits(&mut self) {
        // auto-commit delegates to the broker; record mode commits inline
        if self.shared.auto_commit || self.shared.config.ack_mode == AckMode::Record {
            return;
        }
        self.shared.drain_acks();
        let commits = {
            let mut ledger = self.shared.ledger.lock().expect("ledger mutex poisoned");
            if !ledger.should_commit(
                self.shared.config.ack_mode,
                self.shared.config.ack_count,
                self.shared.config.ack_time,
            ) {
                return;
            }
            ledger.take_pending()
        };
        if let CommitOutcome::Failed(err) = self.shared.commit_now(&self.consumer, commits) {
            warn!("scheduled commit failed: {err}");
        }
    }

    /// Re-sends transactional offsets whose consumer position ran past the
    /// last commit without records being handled (e.g. transactional control
    /// markers), unless a seek moved the position on purpose.
    fn fix_tx_offsets_if_needed(&mut self) {
        if !self.shared.config.fix_tx_offsets || !self.shared.transactional {
            return;
        }
        let Some(producer) = self.producer.clone() else {
            return;
        };
        let last_commits = self
            .shared
            .ledger
            .lock()
            .expect("ledger mutex poisoned")
            .last_commits()
            .clone();
        if last_commits.is_empty() {
            return;
        }
        let positions = self
            .consumer
            .position()
            .map(|tpl| tpl.to_topic_map())
            .unwrap_or_default();

        let mut fixes = HashMap::new();
        for (partition, committed) in last_commits {
            let Some(Offset::Offset(position)) = positions
                .get(&(partition.topic.clone(), partition.partition))
                .copied()
            else {
                continue;
            };
            let saved = self
                .shared
                .ledger
                .lock()
                .expect("ledger mutex poisoned")
                .saved_position(&partition);
            if let Some(saved) = saved {
                if saved != position {
                    continue; // a seek moved us; nothing to fix
                }
            }
            if position > committed {
                fixes.insert(partition, position);
            }
        }
        if fixes.is_empty() {
            return;
        }

        info!(count = fixes.len(), "re-sending transactional offsets after idle polls");
        if let Err(err) = self.send_offsets_in_transaction(&producer, &fixes) {
            warn!("fix-tx-offsets transaction failed: {err}");
            return;
        }
        self.shared
            .ledger
            .lock()
            .expect("ledger mutex poisoned")
            .record_committed(&fixes);
    }

    fn idle_between_polls(&mut self) {
        let configured = self.shared.config.idle_between_polls;
        if configured.is_zero() || self.shared.assigned_snapshot().is_empty() {
            return;
        }
        let mut sleep = if self.first_data_seen {
            configured
        } else {
            configured.mul_f64(self.shared.config.idle_before_data_multiplier.max(1.0))
        };
        // never idle past the group's poll deadline
        let elapsed = self.last_poll_finished.elapsed();
        let headroom = self
            .max_poll_interval
            .saturating_sub(POLL_INTERVAL_MARGIN)
            .saturating_sub(elapsed);
        sleep = sleep.min(headroom);
        self.interruptible_sleep(sleep);
    }

    fn interruptible_sleep(&self, total: Duration) {
        let deadline = Instant::now() + total;
        while Instant::now() < deadline && !self.shutdown.is_cancelled() {
            std::thread::sleep(SLEEP_SLICE.min(deadline.saturating_duration_since(Instant::now())));
        }
    }

    fn apply_seeks(&mut self) {
        let assigned = self.shared.assigned_snapshot();
        let mut ledger = self.shared.ledger.lock().expect("ledger mutex poisoned");
        let applied = self.seek_queue.apply(&self.consumer, &assigned, &mut ledger);
        if applied > 0 && self.shared.config.micrometer_enabled {
            metrics::counter!(SEEKS_APPLIED).increment(applied as u64);
        }
    }

    /// Drops and re-takes the subscription, forcing the group coordinator to
    /// rebalance.
    fn enforce_rebalance_if_requested(&mut self) {
        use std::sync::atomic::Ordering;
        if !self.shared.enforce_rebalance.swap(false, Ordering::SeqCst) {
            return;
        }
        if self.shared.topics.is_empty() {
            warn!("enforce-rebalance ignored for a manually assigned consumer");
            return;
        }
        info!("enforcing a rebalance by re-subscribing");
        self.consumer.unsubscribe();
        let topics: Vec<&str> = self.shared.topics.iter().map(String::as_str).collect();
        if let Err(err) = self.consumer.subscribe(&topics) {
            error!("re-subscribe during enforce-rebalance failed: {err}");
        }
    }

    /// When a nack sleep has elapsed: seek back to the unacked suffix and
    /// clear the nack pause so reconciliation resumes the partitions.
    fn expire_nack_if_due(&mut self) {
        let expired = {
            let pause = self.shared.pause.lock().expect("pause mutex poisoned");
            pause.nack_expired().is_some()
        };
        if !expired {
            return;
        }
        for (partition, offset) in std::mem::take(&mut self.nack_seeks) {
            match self.consumer.seek(
                &partition.topic,
                partition.partition,
                Offset::Offset(offset),
                self.shared.config.sync_commit_timeout,
            ) {
                // the replay re-acks at or above this offset, so pending
                // commits for the already handled prefix stay valid
                Ok(()) => debug!(%partition, offset, "sought back after nack sleep"),
                Err(err) => warn!(%partition, offset, "nack seek-back failed: {err}"),
            }
        }
        self.shared
            .pause
            .lock()
            .expect("pause mutex poisoned")
            .clear_nack();
    }

    fn reconcile_pauses(&mut self) {
        let assigned = self.shared.assigned_snapshot();
        let backpressure = self.shared.async_backpressure();
        let retention_active = self
            .shared
            .retained
            .lock()
            .expect("retained mutex poisoned")
            .is_some();
        // retained records gate resumes, until their backoff has elapsed
        let allow_resume = !retention_active
            || self
                .retained_not_before
                .map(|at| Instant::now() >= at)
                .unwrap_or(true);
        let mut pause = self.shared.pause.lock().expect("pause mutex poisoned");
        if retention_active && allow_resume {
            pause.clear_retention();
        }
        pause.reconcile(
            &self.consumer,
            &assigned,
            backpressure,
            allow_resume,
            self.shared.events.as_ref(),
            &self.shared.container_id,
        );
    }

    // ----- poll ------------------------------------------------------------

    fn poll_timeout(&self) -> Duration {
        let pause = self.shared.pause.lock().expect("pause mutex poisoned");
        let mut timeout = if pause.is_container_pause_requested() {
            self.shared.config.poll_timeout_while_paused
        } else {
            self.shared.config.poll_timeout
        };
        // stay responsive to a pending nack resume
        if let Some(remaining) = pause.nack_remaining() {
            timeout = timeout.min(remaining.max(SLEEP_SLICE));
        }
        timeout
    }

    /// One "poll": a blocking read followed by zero-timeout reads, up to
    /// `max_poll_records`.
    fn poll_batch(&mut self) -> Result<Vec<ConsumerRecord>, LoopExit> {
        let mut records = Vec::new();
        let mut timeout = self.poll_timeout();

        loop {
            match self.consumer.poll(timeout) {
                None => break,
                Some(Ok(message)) => {
                    records.push(ConsumerRecord::from_borrowed(&message));
                    if records.len() >= self.shared.config.max_poll_records {
                        break;
                    }
                    timeout = Duration::ZERO;
                }
                Some(Err(err)) => match self.classify_poll_error(err) {
                    PollFailure::Fatal(reason) => return Err(LoopExit::Stop(reason)),
                    PollFailure::AuthRetryable(err) => {
                        self.auth_retry_sleep(err);
                        break;
                    }
                    PollFailure::Transient(err) => {
                        debug!("transient poll error: {err}");
                        break;
                    }
                },
            }
        }

        let now = Instant::now();
        *self
            .shared
            .last_poll
            .lock()
            .expect("last poll mutex poisoned") = now;
        self.last_poll_finished = now;

        if self.auth_retry_in_progress {
            self.auth_retry_in_progress = false;
            self.shared.events.publish(
                &self.shared.container_id,
                ContainerEvent::RetryAuthSuccessful,
            );
        }
        if self.shared.config.micrometer_enabled {
            metrics::counter!(POLLS).increment(1);
            if !records.is_empty() {
                metrics::histogram!(POLL_BATCH_SIZE).record(records.len() as f64);
            }
        }
        Ok(records)
    }

    fn classify_poll_error(&self, err: KafkaError) -> PollFailure {
        match err.rdkafka_error_code() {
            Some(RDKafkaErrorCode::AutoOffsetReset) if self.shared.offset_reset == "none" => {
                error!("no committed offset and reset policy is none: {err}");
                PollFailure::Fatal(StopReason::NoOffset)
            }
            Some(RDKafkaErrorCode::Fenced | RDKafkaErrorCode::FencedInstanceId) => {
                error!("consumer fenced: {err}");
                PollFailure::Fatal(StopReason::Fenced)
            }
            Some(
                RDKafkaErrorCode::Authentication
                | RDKafkaErrorCode::SaslAuthenticationFailed
                | RDKafkaErrorCode::GroupAuthorizationFailed
                | RDKafkaErrorCode::TopicAuthorizationFailed
                | RDKafkaErrorCode::ClusterAuthorizationFailed,
            ) => {
                if self.shared.config.auth_exception_retry_interval.is_some() {
                    PollFailure::AuthRetryable(err)
                } else {
                    error!("unrecoverable auth failure: {err}");
                    PollFailure::Fatal(StopReason::Auth)
                }
            }
            _ => PollFailure::Transient(err),
        }
    }

    fn auth_retry_sleep(&mut self, err: KafkaError) {
        let interval = self
            .shared
            .config
            .auth_exception_retry_interval
            .expect("auth retry without configured interval");
        warn!("auth failure, retrying in {interval:?}: {err}");
        self.shared.events.publish(
            &self.shared.container_id,
            ContainerEvent::RetryAuth {
                error: err.to_string(),
            },
        );
        self.auth_retry_in_progress = true;
        self.interruptible_sleep(interval);
    }

    // ----- retained-records merge & emergency stop -------------------------

    fn merge_retained(
        &mut self,
        polled: Vec<ConsumerRecord>,
    ) -> Result<Vec<ConsumerRecord>, LoopExit> {
        let mut retained_guard = self.shared.retained.lock().expect("retained mutex poisoned");
        let Some(buffer) = retained_guard.as_ref() else {
            return Ok(polled);
        };

        let still_paused = {
            let pause = self.shared.pause.lock().expect("pause mutex poisoned");
            buffer
                .partitions
                .iter()
                .all(|partition| pause.is_applied(partition))
        };

        if !polled.is_empty() && still_paused {
            // the broker handed us records although the retention's
            // partitions are paused: the error handler paused the wrong
            // partitions and continuing would lose the retained records
            drop(retained_guard);
            error!(
                polled = polled.len(),
                "records arrived while a retention was paused; emergency stop"
            );
            if self.shared.config.micrometer_enabled {
                metrics::counter!(EMERGENCY_STOPS).increment(1);
            }
            return Err(LoopExit::Stop(StopReason::Abnormal));
        }

        if let Some(not_before) = self.retained_not_before {
            if Instant::now() < not_before {
                return Ok(polled);
            }
        }

        let buffer = retained_guard.take().expect("retention checked above");
        drop(retained_guard);
        self.retained_not_before = None;
        self.shared
            .pause
            .lock()
            .expect("pause mutex poisoned")
            .clear_retention();
        debug!(count = buffer.records.len(), "replaying retained records");
        Ok(merge_replay(buffer.records, polled))
    }

    // ----- dispatch shared bits --------------------------------------------

    fn note_records_received(&mut self, records: &[ConsumerRecord]) {
        self.first_data_seen = true;
        self.last_receive = Instant::now();
        if self.last_idle_event.take().is_some() {
            self.shared.events.publish(
                &self.shared.container_id,
                ContainerEvent::ContainerNoLongerIdle,
            );
        }
        for record in records {
            let partition = record.partition();
            if self.partition_idle_published.remove(&partition).is_some() {
                self.shared.events.publish(
                    &self.shared.container_id,
                    ContainerEvent::PartitionNoLongerIdle {
                        partition: partition.clone(),
                    },
                );
            }
            self.partition_last_receive.insert(partition, Instant::now());
        }
    }

    fn publish_idle_events(&mut self) {
        if let Some(interval) = self.shared.config.idle_event_interval {
            let since_receive = self.last_receive.elapsed();
            let due = match self.last_idle_event {
                Some(last) => last.elapsed() >= interval,
                None => since_receive >= interval,
            };
            if due {
                self.last_idle_event = Some(Instant::now());
                self.shared.events.publish(
                    &self.shared.container_id,
                    ContainerEvent::ContainerIdle {
                        idle_for: since_receive,
                    },
                );
            }
        }
        if let Some(interval) = self.shared.config.idle_partition_event_interval {
            for partition in self.shared.assigned_snapshot() {
                let last_receive = self
                    .partition_last_receive
                    .entry(partition.clone())
                    .or_insert_with(Instant::now);
                let idle_for = last_receive.elapsed();
                if idle_for < interval {
                    continue;
                }
                let due = match self.partition_idle_published.get(&partition) {
                    Some(last) => last.elapsed() >= interval,
                    None => true,
                };
                if due {
                    self.partition_idle_published
                        .insert(partition.clone(), Instant::now());
                    self.shared.events.publish(
                        &self.shared.container_id,
                        ContainerEvent::PartitionIdle { partition, idle_for },
                    );
                }
            }
        }
    }

    fn save_positions(&mut self, records: &[ConsumerRecord]) {
        let positions = self
            .consumer
            .position()
            .map(|tpl| tpl.to_topic_map())
            .unwrap_or_default();
        let mut ledger = self.shared.ledger.lock().expect("ledger mutex poisoned");
        for partition in distinct_partitions(records) {
            if let Some(Offset::Offset(position)) =
                positions.get(&(partition.topic.clone(), partition.partition))
            {
                ledger.save_position(partition, *position);
            }
        }
    }

    fn ack_sender(&self) -> tokio::sync::mpsc::UnboundedSender<AckEntry> {
        self.shared
            .acks
            .lock()
            .expect("ack channel mutex poisoned")
            .sender()
    }

    fn immediate_committer(&self) -> Arc<dyn ImmediateCommitter> {
        Arc::new(SharedImmediateCommitter {
            shared: Arc::downgrade(&self.shared),
            consumer: Arc::downgrade(&self.consumer),
        })
    }

    fn record_ack_handle(&self, record: &ConsumerRecord) -> Acknowledgment {
        Acknowledgment::for_record(
            record.partition(),
            record.offset,
            self.shared.config.ack_mode,
            self.shared.config.async_acks,
            self.ack_sender(),
            self.shared.async_state.clone(),
            Some(self.immediate_committer()),
            self.consumer_thread,
            self.nack_slot.clone(),
        )
    }

    fn batch_ack_handle(&self, records: &[ConsumerRecord]) -> Acknowledgment {
        Acknowledgment::for_batch(
            records
                .iter()
                .map(|record| (record.partition(), record.offset))
                .collect(),
            self.listener.receives_record_list(),
            self.shared.config.ack_mode,
            self.shared.config.async_acks,
            self.ack_sender(),
            self.shared.async_state.clone(),
            Some(self.immediate_committer()),
            self.consumer_thread,
            self.nack_slot.clone(),
        )
    }

    fn track_async(&self, records: &[ConsumerRecord]) {
        if let Some(state) = &self.shared.async_state {
            let mut state = state.lock().expect("async ack mutex poisoned");
            for record in records {
                state.deferred.track(record.partition(), record.offset);
            }
        }
    }

    fn take_nack(&self) -> Option<NackRequest> {
        self.nack_slot
            .lock()
            .expect("nack slot mutex poisoned")
            .take()
    }

    /// Applies a nack: remember the seek-back targets for the unprocessed
    /// suffix and pause all assigned partitions for the sleep.
    fn handle_nack(&mut self, suffix: &[ConsumerRecord], sleep: Duration) {
        if self.shared.config.micrometer_enabled {
            metrics::counter!(NACKS).increment(1);
        }
        self.nack_seeks = lowest_per_partition(suffix);
        let assigned = self.shared.assigned_snapshot();
        let resume_at = Instant::now() + sleep;
        let mut pause = self.shared.pause.lock().expect("pause mutex poisoned");
        if let Err(err) = pause.pause_for_nack(&self.consumer, &assigned, resume_at) {
            // rolled back inside the controller; the suffix will simply be
            // re-polled without the sleep
            warn!("nack pause could not be applied: {err}");
            self.nack_seeks.clear();
        }
    }

    /// Stores records for replay and keeps their partitions paused.
    fn retain_records(&mut self, records: Vec<ConsumerRecord>, seek_back: bool, backoff: Duration) {
        if records.is_empty() {
            return;
        }
        let partitions: HashSet<Partition> = records.iter().map(|r| r.partition()).collect();
        if seek_back {
            // the sought offset is the first unhandled record, so pending
            // commits for the handled prefix stay valid
            for (partition, offset) in lowest_per_partition(&records) {
                if let Err(err) = self.consumer.seek(
                    &partition.topic,
                    partition.partition,
                    Offset::Offset(offset),
                    self.shared.config.sync_commit_timeout,
                ) {
                    warn!(%partition, offset, "retention seek-back failed: {err}");
                }
            }
        }
        self.shared
            .pause
            .lock()
            .expect("pause mutex poisoned")
            .set_retention(partitions.clone());
        self.retained_not_before = if backoff.is_zero() {
            None
        } else {
            Some(Instant::now() + backoff)
        };
        *self.shared.retained.lock().expect("retained mutex poisoned") =
            Some(RetainedRecords { records, partitions });
    }

    fn listener_failure(&self, source: anyhow::Error) -> ContainerError {
        ContainerError::ListenerExecutionFailed {
            group_id: self.shared.info.group_id.clone(),
            source,
        }
    }

    fn deserialization_failure(&self, record: &ConsumerRecord) -> Option<ContainerError> {
        for header in [
            DESERIALIZER_EXCEPTION_VALUE_HEADER,
            DESERIALIZER_EXCEPTION_KEY_HEADER,
        ] {
            if record.has_header(header) {
                return Some(ContainerError::Deserialization {
                    partition: record.partition(),
                    offset: record.offset,
                    header,
                });
            }
        }
        None
    }

    fn apply_early_interceptors(&self, mut record: ConsumerRecord) -> Option<ConsumerRecord> {
        for interceptor in &self.record_interceptors {
            record = interceptor.early(record, &self.shared.info)?;
        }
        Some(record)
    }

    // ----- record dispatch -------------------------------------------------

    fn invoke_record_listener(&mut self, records: Vec<ConsumerRecord>) -> Result<(), LoopExit> {
        self.track_async(&records);
        let count = records.len();

        let mut index = 0;
        while index < count {
            if self.shutdown.is_cancelled() && self.shared.config.stop_immediate {
                debug!("stop-immediate: abandoning {} records", count - index);
                return Ok(());
            }

            // early interceptors run outside any transaction
            let Some(mut record) = self.apply_early_interceptors(records[index].clone()) else {
                self.acknowledge_record(&records[index]);
                index += 1;
                continue;
            };

            if self.shared.config.delivery_attempt_header {
                let attempt = self.shared.error_handler.delivery_attempt(&record.tpo());
                record.set_header(DELIVERY_ATTEMPT_HEADER, attempt.to_be_bytes().to_vec());
            }

            if let Some(failure) = self.deserialization_failure(&record) {
                if self.shared.config.micrometer_enabled {
                    metrics::counter!(RECORDS_FAILED).increment(1);
                }
                if !self.route_record_failure(failure, &records, index)? {
                    return Ok(());
                }
                index += 1;
                continue;
            }

            if self.producer.is_some() {
                match self.invoke_record_in_transaction(&record, &records[index..])? {
                    TxDispatch::Committed => {
                        self.record_success_hooks(&record);
                        if let Some(nack) = self.take_nack() {
                            self.handle_nack(&records[index..], nack.sleep);
                            return Ok(());
                        }
                    }
                    TxDispatch::Reprocess => return Ok(()),
                    TxDispatch::Skip => {}
                }
            } else {
                match self.invoke_record_plain(&record) {
                    Ok(()) => {
                        self.record_success_hooks(&record);
                        if let Some(nack) = self.take_nack() {
                            // the handler processed nothing from here on
                            self.handle_nack(&records[index..], nack.sleep);
                            return Ok(());
                        }
                        self.acknowledge_record(&record);
                    }
                    Err(failure) => {
                        if self.shared.config.micrometer_enabled {
                            metrics::counter!(RECORDS_FAILED).increment(1);
                        }
                        if !self.route_record_failure(failure, &records, index)? {
                            return Ok(()); // records retained; stop iterating
                        }
                    }
                }
            }

            index += 1;

            // pause-immediate wins for the rest of this poll
            if self.shared.config.pause_immediate
                && self
                    .shared
                    .pause
                    .lock()
                    .expect("pause mutex poisoned")
                    .is_container_pause_requested()
                && index < count
            {
                debug!("pause-immediate: retaining {} records", count - index);
                self.retain_records(records[index..].to_vec(), false, Duration::ZERO);
                return Ok(());
            }
        }
        Ok(())
    }

    fn record_success_hooks(&mut self, record: &ConsumerRecord) {
        if self.shared.config.micrometer_enabled {
            metrics::counter!(RECORDS_PROCESSED).increment(1);
        }
        for interceptor in &self.record_interceptors {
            interceptor.after_record(record, &self.shared.info);
        }
    }

    /// Routes a record failure through the bridge. Returns true when the
    /// loop may continue with the next record.
    fn route_record_failure(
        &mut self,
        failure: ContainerError,
        records: &[ConsumerRecord],
        index: usize,
    ) -> Result<bool, LoopExit> {
        let record = &records[index];
        if let ContainerError::ListenerExecutionFailed { source, .. } = &failure {
            for interceptor in &self.record_interceptors {
                interceptor.failure(record, source, &self.shared.info);
            }
        }

        let commit_failed = matches!(failure, ContainerError::CommitFailed { .. });
        if self.shared.error_handler.seeks_after_handling() || commit_failed {
            let remaining = &records[index..];
            match self
                .shared
                .error_handler
                .handle_remaining(&failure, remaining, &self.shared.info)
            {
                ErrorDisposition::Recovered => {
                    if self.shared.error_handler.is_ack_after_handle() {
                        self.acknowledge_record(record);
                    }
                    Ok(true)
                }
                ErrorDisposition::Retain(retained) => {
                    // a retention that starts past the failing record means
                    // the failing record was recovered; commit past it
                    let failing_recovered =
                        retained.first().map(|r| r.offset) != Some(record.offset);
                    let backoff = self.shared.error_handler.retry_backoff();
                    self.retain_records(retained, true, backoff);
                    if failing_recovered && self.shared.error_handler.is_ack_after_handle() {
                        self.acknowledge_record(record);
                    }
                    Ok(false)
                }
                ErrorDisposition::Bubble(err) => {
                    error!("listener error bubbled up: {err}");
                    Ok(true)
                }
            }
        } else {
            let recovered =
                self.shared
                    .error_handler
                    .handle_one(&failure, record, &self.shared.info);
            if recovered {
                if self.shared.error_handler.is_ack_after_handle() {
                    self.acknowledge_record(record);
                }
                Ok(true)
            } else {
                // retain the unconsumed records (including the failed one)
                self.retain_records(records[index..].to_vec(), false, Duration::ZERO);
                Ok(false)
            }
        }
    }

    fn invoke_record_plain(&mut self, record: &ConsumerRecord) -> Result<(), ContainerError> {
        let mut record = record.clone();
        for interceptor in &self.record_interceptors {
            match interceptor.intercept(record, &self.shared.info) {
                Some(r) => record = r,
                None => return Ok(()),
            }
        }
        match self.call_listener_with_record(&record) {
            Ok(()) => {
                for interceptor in &self.record_interceptors {
                    interceptor.success(&record, &self.shared.info);
                }
                Ok(())
            }
            Err(source) => Err(self.listener_failure(source)),
        }
    }

    fn invoke_record_in_transaction(
        &mut self,
        record: &ConsumerRecord,
        remaining: &[ConsumerRecord],
    ) -> Result<TxDispatch, LoopExit> {
        let producer = self.producer.clone().expect("transactional path");
        let txn = match producer.begin() {
            Ok(txn) => txn,
            Err(err) => {
                self.map_producer_error(err)?;
                return Ok(TxDispatch::Skip);
            }
        };

        let mut working = record.clone();
        let mut intercept_skip = false;
        for interceptor in &self.record_interceptors {
            match interceptor.intercept(working, &self.shared.info) {
                Some(r) => working = r,
                None => {
                    intercept_skip = true;
                    working = record.clone();
                    break;
                }
            }
        }

        let handler_result = if intercept_skip {
            Ok(())
        } else {
            self.call_listener_with_record(&working)
        };

        match handler_result {
            Ok(()) => {
                let mut offsets = HashMap::new();
                offsets.insert(record.partition(), record.offset + 1);
                let send_result = self
                    .consumer
                    .group_metadata()
                    .ok_or(KafkaError::Canceled)
                    .and_then(|metadata| {
                        let tpl = commit_list(offsets.iter())?;
                        txn.send_offsets(&tpl, &metadata)
                    })
                    .and_then(|()| txn.commit());
                match send_result {
                    Ok(()) => {
                        self.shared
                            .ledger
                            .lock()
                            .expect("ledger mutex poisoned")
                            .record_committed(&offsets);
                        for interceptor in &self.record_interceptors {
                            interceptor.success(record, &self.shared.info);
                        }
                        Ok(TxDispatch::Committed)
                    }
                    Err(err) => {
                        let failure = self.map_producer_error(err)?;
                        warn!("offset transaction failed: {failure}");
                        Ok(TxDispatch::Reprocess)
                    }
                }
            }
            Err(source) => {
                if self.shared.config.micrometer_enabled {
                    metrics::counter!(TRANSACTIONS_ABORTED).increment(1);
                    metrics::counter!(RECORDS_FAILED).increment(1);
                }
                if let Err(abort_err) = txn.abort() {
                    warn!("transaction abort failed: {abort_err}");
                }
                for interceptor in &self.record_interceptors {
                    interceptor.failure(record, &source, &self.shared.info);
                }
                let failure = self.listener_failure(source);
                self.run_after_rollback(remaining, &failure)
            }
        }
    }

    /// Runs the after-rollback processor with the unprocessed tail.
    fn run_after_rollback(
        &mut self,
        remaining: &[ConsumerRecord],
        failure: &ContainerError,
    ) -> Result<TxDispatch, LoopExit> {
        match self
            .after_rollback
            .process(remaining, failure, &self.shared.info)
        {
            RollbackDisposition::Reprocess => {
                for (partition, offset) in lowest_per_partition(remaining) {
                    if let Err(err) = self.consumer.seek(
                        &partition.topic,
                        partition.partition,
                        Offset::Offset(offset),
                        self.shared.config.sync_commit_timeout,
                    ) {
                        warn!(%partition, "rollback seek failed: {err}");
                    }
                }
                Ok(TxDispatch::Reprocess)
            }
            RollbackDisposition::SkipAndCommit => {
                let Some(failed) = remaining.first() else {
                    return Ok(TxDispatch::Skip);
                };
                let mut offsets = HashMap::new();
                offsets.insert(failed.partition(), failed.offset + 1);
                if self.after_rollback.is_process_in_transaction() {
                    if let Some(producer) = self.producer.clone() {
                        match self.send_offsets_in_transaction(&producer, &offsets) {
                            Ok(()) => {
                                self.shared
                                    .ledger
                                    .lock()
                                    .expect("ledger mutex poisoned")
                                    .record_committed(&offsets);
                            }
                            Err(err) => warn!("skip-and-commit transaction failed: {err}"),
                        }
                        return Ok(TxDispatch::Skip);
                    }
                }
                if let CommitOutcome::Failed(err) = self.shared.commit_now(&self.consumer, offsets)
                {
                    warn!("skip-and-commit failed: {err}");
                }
                Ok(TxDispatch::Skip)
            }
            RollbackDisposition::Raise(err) => {
                error!("after-rollback processor raised: {err}");
                Ok(TxDispatch::Reprocess)
            }
        }
    }

    fn send_offsets_in_transaction(
        &self,
        producer: &TransactionalProducer,
        offsets: &HashMap<Partition, i64>,
    ) -> Result<(), KafkaError> {
        let metadata = self.consumer.group_metadata().ok_or(KafkaError::Canceled)?;
        let tpl = commit_list(offsets.iter())?;
        let txn = producer.begin()?;
        match txn.send_offsets(&tpl, &metadata) {
            Ok(()) => txn.commit(),
            Err(err) => {
                drop(txn.abort());
                Err(err)
            }
        }
    }

    /// Maps a producer error; fencing is terminal when configured.
    fn map_producer_error(&self, err: KafkaError) -> Result<ContainerError, LoopExit> {
        let fenced = matches!(
            err.rdkafka_error_code(),
            Some(RDKafkaErrorCode::Fenced | RDKafkaErrorCode::FencedInstanceId)
        );
        if fenced && self.shared.config.stop_container_when_fenced {
            error!("transactional producer fenced; stopping container");
            return Err(LoopExit::Stop(StopReason::Fenced));
        }
        if fenced {
            return Ok(ContainerError::Fenced(err));
        }
        Ok(ContainerError::Kafka(err))
    }

    fn call_listener_with_record(&mut self, record: &ConsumerRecord) -> anyhow::Result<()> {
        let _span = self.shared.config.observation_enabled.then(|| {
            info_span!(
                "kafka.listener.record",
                group = %self.shared.info.group_id,
                partition = %record.partition(),
                offset = record.offset
            )
            .entered()
        });
        let started = Instant::now();
        let ack = self
            .listener
            .is_acknowledging()
            .then(|| Arc::new(self.record_ack_handle(record)));
        let consumer = Arc::clone(&self.consumer);
        let result = match &mut self.listener {
            MessageListener::Record(f) => f(record),
            MessageListener::RecordConsumerAware(f) => f(record, consumer.as_ref()),
            MessageListener::RecordAcknowledging(f) => {
                f(record, ack.clone().expect("ack handle built above"))
            }
            MessageListener::RecordAcknowledgingConsumerAware(f) => f(
                record,
                ack.clone().expect("ack handle built above"),
                consumer.as_ref(),
            ),
            _ => unreachable!("batch listener in record dispatch"),
        };
        if self.shared.config.micrometer_enabled {
            metrics::histogram!(HANDLER_TIME).record(started.elapsed().as_millis() as f64);
        }
        result
    }

    /// Post-success offset bookkeeping for one record, per the ack mode.
    fn acknowledge_record(&mut self, record: &ConsumerRecord) {
        if self.shared.auto_commit || self.shared.config.ack_mode.is_manual() {
            return; // the broker or the handler owns the commit
        }
        if self.shared.transactional {
            return; // offsets ride the transaction
        }
        let mut ledger = self.shared.ledger.lock().expect("ledger mutex poisoned");
        ledger.add_pending(record.partition(), record.offset + 1);
        if self.shared.config.ack_mode == AckMode::Record {
            let commits = ledger.take_pending();
            drop(ledger);
            if let CommitOutcome::Failed(err) = self.shared.commit_now(&self.consumer, commits) {
                let failure = ContainerError::CommitFailed {
                    retries: self.shared.config.commit_retries,
                    source: err,
                };
                if !self
                    .shared
                    .error_handler
                    .handle_one(&failure, record, &self.shared.info)
                {
                    warn!("record-mode commit failed: {failure}");
                }
            }
        }
    }

    // ----- batch dispatch --------------------------------------------------

    fn invoke_batch_listener(&mut self, records: Vec<ConsumerRecord>) -> Result<(), LoopExit> {
        self.track_async(&records);

        if self.shared.config.sub_batch_per_partition {
            let grouped = group_by_partition(&records);
            for (_, slice) in grouped {
                self.invoke_one_batch(slice)?;
            }
            Ok(())
        } else {
            self.invoke_one_batch(records)
        }
    }

    fn invoke_one_batch(&mut self, records: Vec<ConsumerRecord>) -> Result<(), LoopExit> {
        let mut batch = records;
        for interceptor in &self.batch_interceptors {
            match interceptor.intercept(batch, &self.shared.info) {
                Some(b) => batch = b,
                None => return Ok(()), // intercepted away; nothing to ack
            }
        }
        if batch.is_empty() {
            return Ok(());
        }

        if self.shared.config.delivery_attempt_header {
            for record in &mut batch {
                let attempt = self.shared.error_handler.delivery_attempt(&record.tpo());
                record.set_header(DELIVERY_ATTEMPT_HEADER, attempt.to_be_bytes().to_vec());
            }
        }

        if let Some(failure) = batch.iter().find_map(|r| self.deserialization_failure(r)) {
            if self.shared.config.micrometer_enabled {
                metrics::counter!(BATCHES_FAILED).increment(1);
            }
            return self.route_batch_failure(failure, batch);
        }

        if self.producer.is_some() {
            match self.invoke_batch_in_transaction(&batch)? {
                TxDispatch::Committed => {
                    if self.shared.config.micrometer_enabled {
                        metrics::counter!(BATCHES_PROCESSED).increment(1);
                    }
                    if let Some(nack) = self.take_nack() {
                        let start = nack.start_index.min(batch.len() - 1);
                        self.handle_nack(&batch[start..], nack.sleep);
                    }
                    Ok(())
                }
                TxDispatch::Reprocess | TxDispatch::Skip => Ok(()),
            }
        } else {
            match self.invoke_batch_plain(&batch) {
                Ok(()) => {
                    if self.shared.config.micrometer_enabled {
                        metrics::counter!(BATCHES_PROCESSED).increment(1);
                    }
                    if let Some(nack) = self.take_nack() {
                        let start = nack.start_index.min(batch.len() - 1);
                        // everything before the nacked index is done
                        for record in &batch[..start] {
                            self.acknowledge_record(record);
                        }
                        self.handle_nack(&batch[start..], nack.sleep);
                        return Ok(());
                    }
                    // seed the commit path with the highest offset per
                    // partition present in the batch
                    for record in highest_records(&batch) {
                        self.acknowledge_record(&record);
                    }
                    Ok(())
                }
                Err(failure) => {
                    if self.shared.config.micrometer_enabled {
                        metrics::counter!(BATCHES_FAILED).increment(1);
                    }
                    self.route_batch_failure(failure, batch)
                }
            }
        }
    }

    fn route_batch_failure(
        &mut self,
        failure: ContainerError,
        batch: Vec<ConsumerRecord>,
    ) -> Result<(), LoopExit> {
        if let ContainerError::ListenerExecutionFailed { source, .. } = &failure {
            for interceptor in &self.batch_interceptors {
                interceptor.failure(&batch, source, &self.shared.info);
            }
        }
        match self
            .shared
            .error_handler
            .handle_batch(&failure, &batch, &self.shared.info)
        {
            ErrorDisposition::Recovered => {
                if self.shared.error_handler.is_ack_after_handle() {
                    for record in highest_records(&batch) {
                        self.acknowledge_record(&record);
                    }
                }
                Ok(())
            }
            ErrorDisposition::Retain(retained) => {
                let backoff = self.shared.error_handler.retry_backoff();
                self.retain_records(retained, true, backoff);
                Ok(())
            }
            ErrorDisposition::Bubble(err) => {
                error!("batch listener error bubbled up: {err}");
                Ok(())
            }
        }
    }

    fn invoke_batch_plain(&mut self, batch: &[ConsumerRecord]) -> Result<(), ContainerError> {
        match self.call_listener_with_batch(batch) {
            Ok(()) => {
                for interceptor in &self.batch_interceptors {
                    interceptor.success(batch, &self.shared.info);
                }
                Ok(())
            }
            Err(source) => Err(self.listener_failure(source)),
        }
    }

    fn invoke_batch_in_transaction(
        &mut self,
        batch: &[ConsumerRecord],
    ) -> Result<TxDispatch, LoopExit> {
        let producer = self.producer.clone().expect("transactional path");
        let txn = match producer.begin() {
            Ok(txn) => txn,
            Err(err) => {
                self.map_producer_error(err)?;
                return Ok(TxDispatch::Skip);
            }
        };

        match self.call_listener_with_batch(batch) {
            Ok(()) => {
                let offsets = highest_per_partition(batch);
                let send_result = self
                    .consumer
                    .group_metadata()
                    .ok_or(KafkaError::Canceled)
                    .and_then(|metadata| {
                        let tpl = commit_list(offsets.iter())?;
                        txn.send_offsets(&tpl, &metadata)
                    })
                    .and_then(|()| txn.commit());
                match send_result {
                    Ok(()) => {
                        self.shared
                            .ledger
                            .lock()
                            .expect("ledger mutex poisoned")
                            .record_committed(&offsets);
                        for interceptor in &self.batch_interceptors {
                            interceptor.success(batch, &self.shared.info);
                        }
                        Ok(TxDispatch::Committed)
                    }
                    Err(err) => {
                        let failure = self.map_producer_error(err)?;
                        warn!("batch offset transaction failed: {failure}");
                        Ok(TxDispatch::Reprocess)
                    }
                }
            }
            Err(source) => {
                if self.shared.config.micrometer_enabled {
                    metrics::counter!(TRANSACTIONS_ABORTED).increment(1);
                    metrics::counter!(BATCHES_FAILED).increment(1);
                }
                if let Err(abort_err) = txn.abort() {
                    warn!("transaction abort failed: {abort_err}");
                }
                for interceptor in &self.batch_interceptors {
                    interceptor.failure(batch, &source, &self.shared.info);
                }
                let failure = self.listener_failure(source);
                if self.shared.config.batch_recover_after_rollback {
                    self.run_after_rollback(batch, &failure)
                } else {
                    // plain reseek: the whole batch replays in a new
                    // transaction on the next poll
                    for (partition, offset) in lowest_per_partition(batch) {
                        if let Err(err) = self.consumer.seek(
                            &partition.topic,
                            partition.partition,
                            Offset::Offset(offset),
                            self.shared.config.sync_commit_timeout,
                        ) {
                            warn!(%partition, "batch rollback seek failed: {err}");
                        }
                    }
                    Ok(TxDispatch::Reprocess)
                }
            }
        }
    }

    fn call_listener_with_batch(&mut self, batch: &[ConsumerRecord]) -> anyhow::Result<()> {
        let _span = self.shared.config.observation_enabled.then(|| {
            info_span!(
                "kafka.listener.batch",
                group = %self.shared.info.group_id,
                count = batch.len()
            )
            .entered()
        });
        let started = Instant::now();
        let ack = self
            .listener
            .is_acknowledging()
            .then(|| Arc::new(self.batch_ack_handle(batch)));
        let consumer = Arc::clone(&self.consumer);
        let result = match &mut self.listener {
            MessageListener::BatchSimple(f) => f(batch),
            MessageListener::BatchConsumerAware(f) => f(batch, consumer.as_ref()),
            MessageListener::BatchAcknowledging(f) => {
                f(batch, ack.clone().expect("ack handle built above"))
            }
            MessageListener::BatchAcknowledgingConsumerAware(f) => f(
                batch,
                ack.clone().expect("ack handle built above"),
                consumer.as_ref(),
            ),
            MessageListener::BatchFullPoll(f) => {
                let grouped = group_by_partition(batch);
                f(
                    &grouped,
                    ack.clone().expect("ack handle built above"),
                    consumer.as_ref(),
                )
            }
            _ => unreachable!("record listener in batch dispatch"),
        };
        if self.shared.config.micrometer_enabled {
            metrics::histogram!(HANDLER_TIME).record(started.elapsed().as_millis() as f64);
        }
        result
    }
}

// ----- pure helpers --------------------------------------------------------

fn distinct_partitions(records: &[ConsumerRecord]) -> Vec<Partition> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for record in records {
        let partition = record.partition();
        if seen.insert(partition.clone()) {
            out.push(partition);
        }
    }
    out
}

fn group_by_partition(records: &[ConsumerRecord]) -> HashMap<Partition, Vec<ConsumerRecord>> {
    let mut grouped: HashMap<Partition, Vec<ConsumerRecord>> = HashMap::new();
    for record in records {
        grouped
            .entry(record.partition())
            .or_default()
            .push(record.clone());
    }
    grouped
}

/// Highest commit offset (offset + 1) per partition.
fn highest_per_partition(records: &[ConsumerRecord]) -> HashMap<Partition, i64> {
    let mut highest: HashMap<Partition, i64> = HashMap::new();
    for record in records {
        let slot = highest.entry(record.partition()).or_insert(record.offset + 1);
        if *slot < record.offset + 1 {
            *slot = record.offset + 1;
        }
    }
    highest
}

/// The highest-offset record of each partition present.
fn highest_records(records: &[ConsumerRecord]) -> Vec<ConsumerRecord> {
    let mut highest: HashMap<Partition, ConsumerRecord> = HashMap::new();
    for record in records {
        let entry = highest
            .entry(record.partition())
            .or_insert_with(|| record.clone());
        if entry.offset < record.offset {
            *entry = record.clone();
        }
    }
    highest.into_values().collect()
}

fn lowest_per_partition(records: &[ConsumerRecord]) -> HashMap<Partition, i64> {
    let mut lowest: HashMap<Partition, i64> = HashMap::new();
    for record in records {
        let slot = lowest.entry(record.partition()).or_insert(record.offset);
        if *slot > record.offset {
            *slot = record.offset;
        }
    }
    lowest
}

/// Replays retained records in place of a fresh poll. When the retention's
/// partitions were resumed and sought back, the poll re-reads the same
/// offsets; those duplicates are dropped while anything beyond the retained
/// high-water mark is kept.
fn merge_replay(
    retained: Vec<ConsumerRecord>,
    polled: Vec<ConsumerRecord>,
) -> Vec<ConsumerRecord> {
    let mut high_water: HashMap<Partition, i64> = HashMap::new();
    for record in &retained {
        let slot = high_water.entry(record.partition()).or_insert(record.offset);
        if *slot < record.offset {
            *slot = record.offset;
        }
    }
    let mut merged = retained;
    for record in polled {
        match high_water.get(&record.partition()) {
            Some(high) if record.offset <= *high => {} // duplicate of the replay
            _ => merged.push(record),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(partition: i32, offset: i64) -> ConsumerRecord {
        ConsumerRecord {
            topic: "events".into(),
            partition_id: partition,
            offset,
            key: None,
            value: None,
            headers: vec![],
            timestamp: None,
        }
    }

    #[test]
    fn highest_and_lowest_per_partition() {
        let records = vec![record(0, 5), record(0, 9), record(1, 2), record(0, 7)];
        let highest = highest_per_partition(&records);
        assert_eq!(highest.get(&Partition::new("events", 0)), Some(&10));
        assert_eq!(highest.get(&Partition::new("events", 1)), Some(&3));

        let lowest = lowest_per_partition(&records);
        assert_eq!(lowest.get(&Partition::new("events", 0)), Some(&5));
        assert_eq!(lowest.get(&Partition::new("events", 1)), Some(&2));
    }

    #[test]
    fn highest_records_keeps_one_per_partition() {
        let records = vec![record(0, 5), record(0, 9), record(1, 2)];
        let mut highest = highest_records(&records);
        highest.sort_by_key(|r| r.partition_id);
        assert_eq!(highest.len(), 2);
        assert_eq!(highest[0].offset, 9);
        assert_eq!(highest[1].offset, 2);
    }

    #[test]
    fn replay_merge_drops_reread_duplicates_and_keeps_the_tail() {
        let retained = vec![record(0, 5), record(0, 6)];
        // the seek-back made the poll re-read 5 and 6, plus new data
        let polled = vec![record(0, 5), record(0, 6), record(0, 7), record(1, 0)];
        let merged = merge_replay(retained, polled);
        assert_eq!(
            merged
                .iter()
                .map(|r| (r.partition_id, r.offset))
                .collect::<Vec<_>>(),
            vec![(0, 5), (0, 6), (0, 7), (1, 0)]
        );
    }

    #[test]
    fn replay_merge_with_empty_poll_is_the_buffer() {
        let retained = vec![record(0, 5), record(0, 6)];
        let merged = merge_replay(retained, Vec::new());
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn grouping_preserves_per_partition_order() {
        let records = vec![record(0, 5), record(1, 1), record(0, 6), record(1, 2)];
        let grouped = group_by_partition(&records);
        let p0 = &grouped[&Partition::new("events", 0)];
        assert_eq!(p0.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![5, 6]);
        let p1 = &grouped[&Partition::new("events", 1)];
        assert_eq!(p1.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![1, 2]);

        assert_eq!(
            distinct_partitions(&records),
            vec![Partition::new("events", 0), Partition::new("events", 1)]
        );
    }
}
