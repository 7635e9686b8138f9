use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use common_kafka::consumer::ConsumerFactory;
use common_kafka::transaction::TransactionalProducer;
use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::{Offset, TopicPartitionList};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::ack::{AckChannel, AsyncAckState};
use crate::config::{ContainerConfig, EosMode};
use crate::error_handler::{
    AfterRollbackProcessor, DefaultAfterRollbackProcessor, DefaultErrorHandler, ErrorHandler,
};
use crate::errors::{ContainerError, StopReason};
use crate::events::{ContainerEvent, EventSink, TracingEventSink};
use crate::interceptor::{BatchInterceptor, RecordInterceptor};
use crate::listener::{ListenerInfo, MessageListener};
use crate::monitor::spawn_monitor;
use crate::offsets::OffsetLedger;
use crate::pause::{PauseController, PauseRequests};
use crate::rebalance::{ListenerContext, ListenerShared, RebalanceHandler, SeekAwareHook};
use crate::run_loop::ListenerConsumer;
use crate::seeks::{SeekCallback, SeekQueue};
use crate::types::{ConsumerRecord, Partition, TopicPartitionOffset};

static CONTAINER_SEQUENCE: AtomicUsize = AtomicUsize::new(0);

/// The explicit registration surface: collects the handler, the subscription
/// (or a fixed assignment), the runtime properties, and the pluggable
/// policies, and produces a [`ListenerContainer`].
pub struct ListenerContainerBuilder {
    factory: ConsumerFactory,
    listener: Option<MessageListener>,
    topics: Vec<String>,
    assignment: Vec<TopicPartitionOffset>,
    group_id: Option<String>,
    client_id: Option<String>,
    config: ContainerConfig,
    property_overrides: HashMap<String, String>,
    record_interceptors: Vec<Arc<dyn RecordInterceptor>>,
    batch_interceptors: Vec<Arc<dyn BatchInterceptor>>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
    after_rollback: Option<Arc<dyn AfterRollbackProcessor>>,
    rebalance_handler: Option<Arc<dyn RebalanceHandler>>,
    producer: Option<Arc<TransactionalProducer>>,
    event_sink: Option<Arc<dyn EventSink>>,
    seek_aware: Option<SeekAwareHook>,
    liveness: Option<Arc<dyn Fn(bool) + Send + Sync>>,
    emergency_stop: Option<Box<dyn Fn() + Send>>,
}

impl ListenerContainerBuilder {
    pub fn new(factory: ConsumerFactory) -> Self {
        Self {
            factory,
            listener: None,
            topics: Vec::new(),
            assignment: Vec::new(),
            group_id: None,
            client_id: None,
            config: ContainerConfig::default(),
            property_overrides: HashMap::new(),
            record_interceptors: Vec::new(),
            batch_interceptors: Vec::new(),
            error_handler: None,
            after_rollback: None,
            rebalance_handler: None,
            producer: None,
            event_sink: None,
            seek_aware: None,
            liveness: None,
            emergency_stop: None,
        }
    }

    pub fn listener(mut self, listener: MessageListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Subscribe to topics (group management assigns partitions).
    pub fn topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics = topics.into_iter().map(Into::into).collect();
        self
    }

    /// Take a fixed assignment instead of subscribing. An entry offset < 0
    /// means "start from the stored/reset position".
    pub fn assignment(mut self, assignment: Vec<TopicPartitionOffset>) -> Self {
        self.assignment = assignment;
        self
    }

    pub fn group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn config(mut self, config: ContainerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn property_override(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.property_overrides.insert(key.into(), value.into());
        self
    }

    pub fn record_interceptor(mut self, interceptor: Arc<dyn RecordInterceptor>) -> Self {
        self.record_interceptors.push(interceptor);
        self
    }

    pub fn batch_interceptor(mut self, interceptor: Arc<dyn BatchInterceptor>) -> Self {
        self.batch_interceptors.push(interceptor);
        self
    }

    pub fn error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = Some(handler);
        self
    }

    pub fn after_rollback_processor(mut self, processor: Arc<dyn AfterRollbackProcessor>) -> Self {
        self.after_rollback = Some(processor);
        self
    }

    pub fn rebalance_handler(mut self, handler: Arc<dyn RebalanceHandler>) -> Self {
        self.rebalance_handler = Some(handler);
        self
    }

    /// Configures transactional dispatch: every record (or batch) runs in a
    /// producer transaction and offsets are forwarded through it.
    pub fn transactional_producer(mut self, producer: Arc<TransactionalProducer>) -> Self {
        self.producer = Some(producer);
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    /// Registers a seek-aware hook, invoked with the position map and a seek
    /// callback whenever partitions are assigned.
    pub fn on_partitions_assigned_seek(mut self, hook: SeekAwareHook) -> Self {
        self.seek_aware = Some(hook);
        self
    }

    /// Invoked by the liveness monitor on every check with the current
    /// health verdict, for feeding a process health registry.
    pub fn liveness_probe(mut self, probe: impl Fn(bool) + Send + Sync + 'static) -> Self {
        self.liveness = Some(Arc::new(probe));
        self
    }

    /// Invoked (once) when the container performs an emergency stop.
    pub fn on_emergency_stop(mut self, hook: impl Fn() + Send + 'static) -> Self {
        self.emergency_stop = Some(Box::new(hook));
        self
    }

    pub fn build(self) -> Result<ListenerContainer, ContainerError> {
        let listener = self
            .listener
            .ok_or_else(|| ContainerError::Configuration("a listener is required".into()))?;
        if self.topics.is_empty() == self.assignment.is_empty() {
            return Err(ContainerError::Configuration(
                "exactly one of topics or assignment must be set".into(),
            ));
        }
        if self.config.async_acks {
            if !self.config.ack_mode.is_manual() {
                return Err(ContainerError::Configuration(
                    "async acks require a manual ack mode".into(),
                ));
            }
            if !listener.is_acknowledging() {
                return Err(ContainerError::Configuration(
                    "async acks require an acknowledging listener".into(),
                ));
            }
        }
        if self.config.eos_mode == EosMode::V1 && self.producer.is_some() {
            warn!("EosMode::V1 is not supported by librdkafka; running with V2 semantics");
        }

        let group_id = self
            .group_id
            .clone()
            .unwrap_or_else(|| self.factory.group_id().to_string());
        let sequence = CONTAINER_SEQUENCE.fetch_add(1, Ordering::SeqCst);
        let client_prefix = self.client_id.clone().unwrap_or_else(|| group_id.clone());
        let client_id = format!("{client_prefix}-{sequence}");
        let container_id = client_id.clone();

        let info = ListenerInfo {
            group_id: group_id.clone(),
            client_id: client_id.clone(),
            container_id: container_id.clone(),
            info: self.config.listener_info.clone(),
        };

        let seek_queue = SeekQueue::new();
        let seek_callback = seek_queue.callback();
        let (failures_tx, failures_rx) = unbounded_channel();

        let async_state = self
            .config
            .async_acks
            .then(|| Arc::new(Mutex::new(AsyncAckState::default())));

        let shared = Arc::new(ListenerShared {
            container_id: container_id.clone(),
            info,
            config: self.config,
            offset_reset: self.factory.offset_reset().to_string(),
            auto_commit: self.factory.auto_commit(),
            transactional: self.producer.is_some(),
            ledger: Mutex::new(OffsetLedger::new()),
            acks: Mutex::new(AckChannel::new()),
            async_state,
            assigned: Mutex::new(HashSet::new()),
            pause: Mutex::new(PauseController::new(Arc::new(PauseRequests::default()))),
            retained: Mutex::new(None),
            seek_callback: seek_callback.clone(),
            events: self
                .event_sink
                .unwrap_or_else(|| Arc::new(TracingEventSink)),
            rebalance_handler: self.rebalance_handler,
            error_handler: self
                .error_handler
                .unwrap_or_else(|| Arc::new(DefaultErrorHandler::default())),
            seek_aware: self.seek_aware,
            liveness: self.liveness,
            last_poll: Mutex::new(Instant::now()),
            rebalance_generation: AtomicU64::new(0),
            topics: self.topics.clone(),
            enforce_rebalance: AtomicBool::new(false),
        });

        let context = ListenerContext::new(Arc::clone(&shared));
        let client_suffix = sequence.to_string();
        let consumer = self.factory.create_consumer(
            Some(group_id.as_str()),
            Some(client_prefix.as_str()),
            Some(client_suffix.as_str()),
            &self.property_overrides,
            context,
        )?;

        let max_poll_interval =
            std::time::Duration::from_millis(self.factory.max_poll_interval_ms() as u64);

        Ok(ListenerContainer {
            shared,
            shutdown: CancellationToken::new(),
            running: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
            monitor: Mutex::new(None),
            failures_tx,
            seek_callback,
            parts: Mutex::new(Some(StartParts {
                consumer,
                listener,
                record_interceptors: self.record_interceptors,
                batch_interceptors: self.batch_interceptors,
                after_rollback: self
                    .after_rollback
                    .unwrap_or_else(|| Arc::new(DefaultAfterRollbackProcessor::default())),
                producer: self.producer,
                seek_queue,
                failures_rx,
                emergency_stop: self.emergency_stop,
                topics: self.topics,
                assignment: self.assignment,
                max_poll_interval,
            })),
        })
    }
}

/// Everything the consumer thread takes ownership of at start.
struct StartParts {
    consumer: BaseConsumer<ListenerContext>,
    listener: MessageListener,
    record_interceptors: Vec<Arc<dyn RecordInterceptor>>,
    batch_interceptors: Vec<Arc<dyn BatchInterceptor>>,
    after_rollback: Arc<dyn AfterRollbackProcessor>,
    producer: Option<Arc<TransactionalProducer>>,
    seek_queue: SeekQueue,
    failures_rx: UnboundedReceiver<(ConsumerRecord, anyhow::Error)>,
    emergency_stop: Option<Box<dyn Fn() + Send>>,
    topics: Vec<String>,
    assignment: Vec<TopicPartitionOffset>,
    max_poll_interval: std::time::Duration,
}

/// Handle to one running (or startable) listener runtime. All methods are
/// safe from any thread; mutations are applied by the consumer thread at its
/// next iteration.
pub struct ListenerContainer {
    shared: Arc<ListenerShared>,
    shutdown: CancellationToken,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<thread::JoinHandle<StopReason>>>,
    monitor: Mutex<Option<thread::JoinHandle<()>>>,
    failures_tx: UnboundedSender<(ConsumerRecord, anyhow::Error)>,
    seek_callback: SeekCallback,
    parts: Mutex<Option<StartParts>>,
}

impl std::fmt::Debug for ListenerContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerContainer")
            .field("running", &self.running)
            .finish_non_exhaustive()
    }
}

impl ListenerContainer {
    /// Spawns the consumer thread, waits for it to come up (bounded by
    /// `consumer_start_timeout`), and starts the liveness monitor.
    pub fn start(&self) -> Result<(), ContainerError> {
        let parts = self
            .parts
            .lock()
            .expect("start parts mutex poisoned")
            .take()
            .ok_or(ContainerError::AlreadyRunning)?;

        self.shared
            .events
            .publish(&self.shared.container_id, ContainerEvent::Starting);

        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), ContainerError>>();
        let shared = Arc::clone(&self.shared);
        let shutdown = self.shutdown.clone();
        let running = Arc::clone(&self.running);

        let handle = thread::Builder::new()
            .name(self.shared.container_id.clone())
            .spawn(move || {
                let StartParts {
                    consumer,
                    listener,
                    record_interceptors,
                    batch_interceptors,
                    after_rollback,
                    producer,
                    seek_queue,
                    failures_rx,
                    emergency_stop,
                    topics,
                    assignment,
                    max_poll_interval,
                } = parts;

                // take the subscription (or assignment) before the first poll
                let subscribe_result = if !topics.is_empty() {
                    let names: Vec<&str> = topics.iter().map(String::as_str).collect();
                    consumer.subscribe(&names)
                } else {
                    manual_assign(&consumer, &shared, &assignment)
                };
                if let Err(err) = subscribe_result {
                    error!("consumer failed to subscribe: {err}");
                    shared
                        .events
                        .publish(&shared.container_id, ContainerEvent::FailedToStart);
                    drop(ready_tx.send(Err(ContainerError::Kafka(err))));
                    return StopReason::Error;
                }

                running.store(true, Ordering::SeqCst);
                drop(ready_tx.send(Ok(())));

                let reason = ListenerConsumer::new(
                    Arc::new(consumer),
                    Arc::clone(&shared),
                    listener,
                    record_interceptors,
                    batch_interceptors,
                    after_rollback,
                    producer,
                    seek_queue,
                    shutdown,
                    failures_rx,
                    emergency_stop,
                    max_poll_interval,
                )
                .run();

                running.store(false, Ordering::SeqCst);
                reason
            })
            .map_err(|err| ContainerError::ListenerExecutionFailed {
                group_id: self.shared.info.group_id.clone(),
                source: anyhow::Error::from(err),
            })?;

        *self.thread.lock().expect("thread mutex poisoned") = Some(handle);

        match ready_rx.recv_timeout(self.shared.config.consumer_start_timeout) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                warn!(
                    container_id = %self.shared.container_id,
                    "consumer thread did not signal readiness in time"
                );
                self.shared
                    .events
                    .publish(&self.shared.container_id, ContainerEvent::FailedToStart);
                return Err(ContainerError::StartTimeout(
                    self.shared.config.consumer_start_timeout,
                ));
            }
        }

        match spawn_monitor(Arc::clone(&self.shared), self.shutdown.clone()) {
            Ok(handle) => {
                *self.monitor.lock().expect("monitor mutex poisoned") = Some(handle)
            }
            Err(err) => warn!("failed to spawn liveness monitor: {err}"),
        }

        self.shared
            .events
            .publish(&self.shared.container_id, ContainerEvent::Started);
        info!(container_id = %self.shared.container_id, "listener container started");
        Ok(())
    }

    /// Requests a stop; the consumer thread exits at its next iteration
    /// boundary (at most one poll timeout away). Idempotent.
    pub fn stop(&self) {
        self.shutdown.cancel();
        if let Some(monitor) = self
            .monitor
            .lock()
            .expect("monitor mutex poisoned")
            .as_ref()
        {
            monitor.thread().unpark();
        }
    }

    /// Stops and blocks until the consumer thread has exited, returning why
    /// it stopped.
    pub fn stop_and_join(&self) -> Result<StopReason, ContainerError> {
        self.stop();
        let handle = self
            .thread
            .lock()
            .expect("thread mutex poisoned")
            .take()
            .ok_or(ContainerError::NotRunning)?;
        let reason = handle.join().map_err(|_| {
            ContainerError::ListenerExecutionFailed {
                group_id: self.shared.info.group_id.clone(),
                source: anyhow::anyhow!("consumer thread panicked"),
            }
        })?;
        if let Some(monitor) = self
            .monitor
            .lock()
            .expect("monitor mutex poisoned")
            .take()
        {
            monitor.thread().unpark();
            drop(monitor.join());
        }
        Ok(reason)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Pauses the whole consumer at the next reconciliation point.
    pub fn pause(&self) {
        self.shared
            .pause
            .lock()
            .expect("pause mutex poisoned")
            .requests()
            .request_container_pause();
    }

    pub fn resume(&self) {
        self.shared
            .pause
            .lock()
            .expect("pause mutex poisoned")
            .requests()
            .request_container_resume();
    }

    pub fn is_paused(&self) -> bool {
        self.shared
            .pause
            .lock()
            .expect("pause mutex poisoned")
            .is_container_pause_requested()
    }

    pub fn pause_partition(&self, partition: Partition) {
        self.shared
            .pause
            .lock()
            .expect("pause mutex poisoned")
            .requests()
            .request_partition_pause(partition);
    }

    pub fn resume_partition(&self, partition: &Partition) {
        self.shared
            .pause
            .lock()
            .expect("pause mutex poisoned")
            .requests()
            .request_partition_resume(partition);
    }

    pub fn is_partition_paused(&self, partition: &Partition) -> bool {
        self.shared
            .pause
            .lock()
            .expect("pause mutex poisoned")
            .is_applied(partition)
    }

    /// Asks the loop to drop and re-take its subscription, forcing a group
    /// rebalance.
    pub fn enforce_rebalance(&self) {
        self.shared.enforce_rebalance.store(true, Ordering::SeqCst);
    }

    pub fn assigned_partitions(&self) -> Vec<Partition> {
        let mut partitions: Vec<Partition> =
            self.shared.assigned_snapshot().into_iter().collect();
        partitions.sort();
        partitions
    }

    /// The highest uncommitted commit-offset for a partition, if any.
    pub fn pending_offset(&self, partition: &Partition) -> Option<i64> {
        self.shared
            .ledger
            .lock()
            .expect("ledger mutex poisoned")
            .pending_for(partition)
    }

    /// The most recent successfully committed offset for a partition.
    pub fn last_committed(&self, partition: &Partition) -> Option<i64> {
        self.shared
            .ledger
            .lock()
            .expect("ledger mutex poisoned")
            .last_committed(partition)
    }

    /// A thread-safe handle for enqueueing seeks.
    pub fn seek_callback(&self) -> SeekCallback {
        self.seek_callback.clone()
    }

    /// Reports a failure for a record whose handler completed asynchronously;
    /// it is routed through the error handler before the next poll.
    pub fn report_async_failure(&self, record: ConsumerRecord, error: anyhow::Error) {
        drop(self.failures_tx.send((record, error)));
    }

    /// How many ownership changes (revokes, assigns, losses) this consumer
    /// has seen; useful for tests and debugging.
    pub fn rebalance_generation(&self) -> u64 {
        self.shared
            .rebalance_generation
            .load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn container_id(&self) -> &str {
        &self.shared.container_id
    }

    pub fn group_id(&self) -> &str {
        &self.shared.info.group_id
    }
}

impl Drop for ListenerContainer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Applies a fixed assignment. Group callbacks never fire for manual
/// assignments, so the shared assigned-set is populated here.
fn manual_assign(
    consumer: &BaseConsumer<ListenerContext>,
    shared: &Arc<ListenerShared>,
    assignment: &[TopicPartitionOffset],
) -> Result<(), rdkafka::error::KafkaError> {
    let mut tpl = TopicPartitionList::new();
    for entry in assignment {
        let offset = if entry.offset >= 0 {
            Offset::Offset(entry.offset)
        } else {
            Offset::Invalid
        };
        tpl.add_partition_offset(&entry.partition.topic, entry.partition.partition, offset)?;
    }
    consumer.assign(&tpl)?;
    let mut assigned = shared.assigned.lock().expect("assigned mutex poisoned");
    for entry in assignment {
        assigned.insert(entry.partition.clone());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common_kafka::test::mock_configs;

    fn factory() -> ConsumerFactory {
        let (common, consumer) = mock_configs("localhost:9092", "builder-test");
        ConsumerFactory::new(common, consumer)
    }

    #[test]
    fn builder_requires_a_listener() {
        let err = ListenerContainerBuilder::new(factory())
            .topics(["events"])
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("listener is required"));
    }

    #[test]
    fn builder_requires_topics_xor_assignment() {
        let err = ListenerContainerBuilder::new(factory())
            .listener(MessageListener::record(|_| Ok(())))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("topics or assignment"));

        let err = ListenerContainerBuilder::new(factory())
            .listener(MessageListener::record(|_| Ok(())))
            .topics(["events"])
            .assignment(vec![TopicPartitionOffset::new(
                Partition::new("events", 0),
                -1,
            )])
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("topics or assignment"));
    }

    #[test]
    fn async_acks_need_manual_acknowledging_listener() {
        let mut config = ContainerConfig {
            async_acks: true,
            ..ContainerConfig::default()
        };

        let err = ListenerContainerBuilder::new(factory())
            .listener(MessageListener::record(|_| Ok(())))
            .topics(["events"])
            .config(config.clone())
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("manual ack mode"));

        config.ack_mode = crate::config::AckMode::Manual;
        let err = ListenerContainerBuilder::new(factory())
            .listener(MessageListener::record(|_| Ok(())))
            .topics(["events"])
            .config(config)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("acknowledging listener"));
    }

    #[test]
    fn container_ids_are_unique_per_build() {
        let build = || {
            ListenerContainerBuilder::new(factory())
                .listener(MessageListener::record(|_| Ok(())))
                .topics(["events"])
                .build()
                .expect("container builds")
        };
        let a = build();
        let b = build();
        assert_ne!(a.container_id(), b.container_id());
        assert!(a.container_id().starts_with("builder-test-"));
    }

    #[test]
    fn stop_before_start_reports_not_running() {
        let container = ListenerContainerBuilder::new(factory())
            .listener(MessageListener::record(|_| Ok(())))
            .topics(["events"])
            .build()
            .expect("container builds");
        container.stop(); // idempotent, no thread yet
        assert!(matches!(
            container.stop_and_join(),
            Err(ContainerError::NotRunning)
        ));
        assert!(!container.is_running());
    }
}
