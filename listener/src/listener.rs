use std::collections::HashMap;
use std::sync::Arc;

use rdkafka::consumer::BaseConsumer;

use crate::ack::Acknowledgment;
use crate::rebalance::ListenerContext;
use crate::types::{ConsumerRecord, Partition};

/// Per-container identity handed to handlers, interceptors and error
/// handlers instead of any thread-local propagation.
#[derive(Debug, Clone)]
pub struct ListenerInfo {
    pub group_id: String,
    pub client_id: String,
    pub container_id: String,
    /// Opaque bytes configured through `ContainerConfig::listener_info`.
    pub info: Option<Vec<u8>>,
}

/// The consumer type handed to consumer-aware listeners. Only valid on the
/// consumer thread, which is guaranteed by construction: the reference is
/// scoped to the handler invocation.
pub type ListenerConsumerRef<'a> = &'a BaseConsumer<ListenerContext>;

pub type RecordFn = Box<dyn FnMut(&ConsumerRecord) -> anyhow::Result<()> + Send>;
pub type RecordConsumerFn =
    Box<dyn FnMut(&ConsumerRecord, ListenerConsumerRef<'_>) -> anyhow::Result<()> + Send>;
pub type RecordAckFn =
    Box<dyn FnMut(&ConsumerRecord, Arc<Acknowledgment>) -> anyhow::Result<()> + Send>;
pub type RecordAckConsumerFn = Box<
    dyn FnMut(&ConsumerRecord, Arc<Acknowledgment>, ListenerConsumerRef<'_>) -> anyhow::Result<()>
        + Send,
>;
pub type BatchFn = Box<dyn FnMut(&[ConsumerRecord]) -> anyhow::Result<()> + Send>;
pub type BatchConsumerFn =
    Box<dyn FnMut(&[ConsumerRecord], ListenerConsumerRef<'_>) -> anyhow::Result<()> + Send>;
pub type BatchAckFn =
    Box<dyn FnMut(&[ConsumerRecord], Arc<Acknowledgment>) -> anyhow::Result<()> + Send>;
pub type BatchAckConsumerFn = Box<
    dyn FnMut(&[ConsumerRecord], Arc<Acknowledgment>, ListenerConsumerRef<'_>) -> anyhow::Result<()>
        + Send,
>;
pub type BatchFullPollFn = Box<
    dyn FnMut(
            &HashMap<Partition, Vec<ConsumerRecord>>,
            Arc<Acknowledgment>,
            ListenerConsumerRef<'_>,
        ) -> anyhow::Result<()>
        + Send,
>;

/// The handler registered with a container, tagged by its capability set.
/// Dispatch is a `match` on the tag; there is no adapter hierarchy.
pub enum MessageListener {
    Record(RecordFn),
    RecordConsumerAware(RecordConsumerFn),
    RecordAcknowledging(RecordAckFn),
    RecordAcknowledgingConsumerAware(RecordAckConsumerFn),
    BatchSimple(BatchFn),
    BatchConsumerAware(BatchConsumerFn),
    BatchAcknowledging(BatchAckFn),
    BatchAcknowledgingConsumerAware(BatchAckConsumerFn),
    /// Receives the whole poll grouped by partition, with an ack handle for
    /// the full poll.
    BatchFullPoll(BatchFullPollFn),
}

impl MessageListener {
    pub fn record(f: impl FnMut(&ConsumerRecord) -> anyhow::Result<()> + Send + 'static) -> Self {
        MessageListener::Record(Box::new(f))
    }

    pub fn record_consumer_aware(
        f: impl FnMut(&ConsumerRecord, ListenerConsumerRef<'_>) -> anyhow::Result<()> + Send + 'static,
    ) -> Self {
        MessageListener::RecordConsumerAware(Box::new(f))
    }

    pub fn record_acknowledging(
        f: impl FnMut(&ConsumerRecord, Arc<Acknowledgment>) -> anyhow::Result<()> + Send + 'static,
    ) -> Self {
        MessageListener::RecordAcknowledging(Box::new(f))
    }

    pub fn record_acknowledging_consumer_aware(
        f: impl FnMut(&ConsumerRecord, Arc<Acknowledgment>, ListenerConsumerRef<'_>) -> anyhow::Result<()>
            + Send
            + 'static,
    ) -> Self {
        MessageListener::RecordAcknowledgingConsumerAware(Box::new(f))
    }

    pub fn batch(f: impl FnMut(&[ConsumerRecord]) -> anyhow::Result<()> + Send + 'static) -> Self {
        MessageListener::BatchSimple(Box::new(f))
    }

    pub fn batch_consumer_aware(
        f: impl FnMut(&[ConsumerRecord], ListenerConsumerRef<'_>) -> anyhow::Result<()>
            + Send
            + 'static,
    ) -> Self {
        MessageListener::BatchConsumerAware(Box::new(f))
    }

    pub fn batch_acknowledging(
        f: impl FnMut(&[ConsumerRecord], Arc<Acknowledgment>) -> anyhow::Result<()> + Send + 'static,
    ) -> Self {
        MessageListener::BatchAcknowledging(Box::new(f))
    }

    pub fn batch_acknowledging_consumer_aware(
        f: impl FnMut(&[ConsumerRecord], Arc<Acknowledgment>, ListenerConsumerRef<'_>) -> anyhow::Result<()>
            + Send
            + 'static,
    ) -> Self {
        MessageListener::BatchAcknowledgingConsumerAware(Box::new(f))
    }

    pub fn batch_full_poll(
        f: impl FnMut(
                &HashMap<Partition, Vec<ConsumerRecord>>,
                Arc<Acknowledgment>,
                ListenerConsumerRef<'_>,
            ) -> anyhow::Result<()>
            + Send
            + 'static,
    ) -> Self {
        MessageListener::BatchFullPoll(Box::new(f))
    }

    pub fn is_batch(&self) -> bool {
        matches!(
            self,
            MessageListener::BatchSimple(_)
                | MessageListener::BatchConsumerAware(_)
                | MessageListener::BatchAcknowledging(_)
                | MessageListener::BatchAcknowledgingConsumerAware(_)
                | MessageListener::BatchFullPoll(_)
        )
    }

    pub fn is_acknowledging(&self) -> bool {
        matches!(
            self,
            MessageListener::RecordAcknowledging(_)
                | MessageListener::RecordAcknowledgingConsumerAware(_)
                | MessageListener::BatchAcknowledging(_)
                | MessageListener::BatchAcknowledgingConsumerAware(_)
                | MessageListener::BatchFullPoll(_)
        )
    }

    /// Whether the listener receives an indexable record list, which is what
    /// partial batch acknowledgement requires.
    pub fn receives_record_list(&self) -> bool {
        matches!(
            self,
            MessageListener::BatchAcknowledging(_)
                | MessageListener::BatchAcknowledgingConsumerAware(_)
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MessageListener::Record(_) => "record",
            MessageListener::RecordConsumerAware(_) => "record-consumer-aware",
            MessageListener::RecordAcknowledging(_) => "record-acknowledging",
            MessageListener::RecordAcknowledgingConsumerAware(_) => {
                "record-acknowledging-consumer-aware"
            }
            MessageListener::BatchSimple(_) => "batch",
            MessageListener::BatchConsumerAware(_) => "batch-consumer-aware",
            MessageListener::BatchAcknowledging(_) => "batch-acknowledging",
            MessageListener::BatchAcknowledgingConsumerAware(_) => {
                "batch-acknowledging-consumer-aware"
            }
            MessageListener::BatchFullPoll(_) => "batch-full-poll",
        }
    }
}
