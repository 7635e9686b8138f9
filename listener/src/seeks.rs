use std::collections::HashSet;
use std::time::Duration;

use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext};
use rdkafka::{Offset, TopicPartitionList};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

use crate::offsets::OffsetLedger;
use crate::types::Partition;

const SEEK_TIMEOUT: Duration = Duration::from_secs(10);

/// Where to reposition a partition's read pointer.
pub enum SeekTarget {
    /// An absolute offset, clamped at zero.
    Absolute(i64),
    /// Current position (or the end, when `to_current` is false) plus
    /// `delta`, clamped at zero.
    Relative { delta: i64, to_current: bool },
    Beginning,
    End,
    /// The earliest offset whose timestamp is at or after the given epoch
    /// milliseconds.
    Timestamp(i64),
    /// A function of the current position.
    Function(Box<dyn FnOnce(i64) -> i64 + Send>),
}

impl std::fmt::Debug for SeekTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SeekTarget::Absolute(offset) => write!(f, "Absolute({offset})"),
            SeekTarget::Relative { delta, to_current } => {
                write!(f, "Relative({delta}, to_current={to_current})")
            }
            SeekTarget::Beginning => write!(f, "Beginning"),
            SeekTarget::End => write!(f, "End"),
            SeekTarget::Timestamp(ts) => write!(f, "Timestamp({ts})"),
            SeekTarget::Function(_) => write!(f, "Function(..)"),
        }
    }
}

#[derive(Debug)]
pub struct SeekRequest {
    pub partition: Partition,
    pub target: SeekTarget,
}

/// Thread-safe handle for enqueueing seeks; they are applied on the consumer
/// thread before the next poll.
#[derive(Clone)]
pub struct SeekCallback {
    tx: UnboundedSender<SeekRequest>,
}

impl SeekCallback {
    pub fn seek(&self, topic: impl Into<String>, partition: i32, offset: i64) {
        self.push(topic, partition, SeekTarget::Absolute(offset));
    }

    pub fn seek_fn(
        &self,
        topic: impl Into<String>,
        partition: i32,
        f: impl FnOnce(i64) -> i64 + Send + 'static,
    ) {
        self.push(topic, partition, SeekTarget::Function(Box::new(f)));
    }

    pub fn seek_to_beginning(&self, topic: impl Into<String>, partition: i32) {
        self.push(topic, partition, SeekTarget::Beginning);
    }

    pub fn seek_to_end(&self, topic: impl Into<String>, partition: i32) {
        self.push(topic, partition, SeekTarget::End);
    }

    pub fn seek_relative(
        &self,
        topic: impl Into<String>,
        partition: i32,
        delta: i64,
        to_current: bool,
    ) {
        self.push(topic, partition, SeekTarget::Relative { delta, to_current });
    }

    pub fn seek_to_timestamp(&self, topic: impl Into<String>, partition: i32, timestamp_ms: i64) {
        self.push(topic, partition, SeekTarget::Timestamp(timestamp_ms));
    }

    fn push(&self, topic: impl Into<String>, partition: i32, target: SeekTarget) {
        let request = SeekRequest {
            partition: Partition::new(topic, partition),
            target,
        };
        // a dropped receiver means the container is gone; nothing to do
        drop(self.tx.send(request));
    }
}

/// The consumer-thread side of the seek queue.
pub struct SeekQueue {
    tx: UnboundedSender<SeekRequest>,
    rx: UnboundedReceiver<SeekRequest>,
}

impl Default for SeekQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl SeekQueue {
    pub fn new() -> Self {
        let (tx, rx) = unbounded_channel();
        Self { tx, rx }
    }

    pub fn callback(&self) -> SeekCallback {
        SeekCallback {
            tx: self.tx.clone(),
        }
    }

    pub fn drain(&mut self) -> Vec<SeekRequest> {
        let mut requests = Vec::new();
        while let Ok(request) = self.rx.try_recv() {
            requests.push(request);
        }
        requests
    }

    /// Applies all queued seeks. Seeks for unassigned partitions are logged
    /// and dropped; timestamp seeks are batched into a single
    /// `offsets_for_times` lookup. Each applied seek resets the ledger's
    /// epoch for that partition.
    pub fn apply<C: ConsumerContext>(
        &mut self,
        consumer: &BaseConsumer<C>,
        assigned: &HashSet<Partition>,
        ledger: &mut OffsetLedger,
    ) -> usize {
        let requests = self.drain();
        if requests.is_empty() {
            return 0;
        }

        let mut applied = 0;
        let mut by_timestamp: Vec<(Partition, i64)> = Vec::new();

        let positions = consumer
            .position()
            .map(|tpl| tpl.to_topic_map())
            .unwrap_or_default();

        for request in requests {
            let SeekRequest { partition, target } = request;
            if !assigned.contains(&partition) {
                warn!(%partition, ?target, "dropping seek for unassigned partition");
                continue;
            }
            let target = match target {
                SeekTarget::Timestamp(ts) => {
                    by_timestamp.push((partition, ts));
                    continue;
                }
                other => other,
            };

            let current = positions
                .get(&(partition.topic.clone(), partition.partition))
                .and_then(|offset| match offset {
                    Offset::Offset(o) => Some(*o),
                    _ => None,
                });

            let resolved = match resolve_target(target, current, || {
                consumer.fetch_watermarks(&partition.topic, partition.partition, SEEK_TIMEOUT)
            }) {
                Ok(resolved) => resolved,
                Err(err) => {
                    warn!(%partition, "seek target resolution failed: {err}");
                    continue;
                }
            };

            match consumer.seek(&partition.topic, partition.partition, resolved, SEEK_TIMEOUT) {
                Ok(()) => {
                    debug!(%partition, ?resolved, "seek applied");
                    ledger.forget(&partition);
                    applied += 1;
                }
                Err(err) => {
                    warn!(%partition, ?resolved, "seek failed: {err}");
                }
            }
        }

        applied += self.apply_timestamp_seeks(consumer, by_timestamp, ledger);
        applied
    }

    fn apply_timestamp_seeks<C: ConsumerContext>(
        &self,
        consumer: &BaseConsumer<C>,
        seeks: Vec<(Partition, i64)>,
        ledger: &mut OffsetLedger,
    ) -> usize {
        if seeks.is_empty() {
            return 0;
        }
        let mut lookup = TopicPartitionList::new();
        for (partition, ts) in &seeks {
            if lookup
                .add_partition_offset(&partition.topic, partition.partition, Offset::Offset(*ts))
                .is_err()
            {
                warn!(partition = %partition, ts, "invalid timestamp seek dropped");
            }
        }

        let resolved = match consumer.offsets_for_times(lookup, SEEK_TIMEOUT) {
            Ok(resolved) => resolved,
            Err(err) => {
                warn!("offsets_for_times lookup failed: {err}");
                return 0;
            }
        };

        let mut applied = 0;
        for elem in resolved.elements() {
            let partition = Partition::new(elem.topic(), elem.partition());
            let target = match elem.offset() {
                Offset::Offset(o) => Offset::Offset(o),
                // no record at or after the timestamp: go to the end
                _ => Offset::End,
            };
            match consumer.seek(elem.topic(), elem.partition(), target, SEEK_TIMEOUT) {
                Ok(()) => {
                    debug!(partition = %partition, ?target, "timestamp seek applied");
                    ledger.forget(&partition);
                    applied += 1;
                }
                Err(err) => {
                    warn!(partition = %partition, "timestamp seek failed: {err}");
                }
            }
        }
        applied
    }
}

/// Turns a seek target into a concrete rdkafka offset. `current` is the
/// consumer's position when known; `watermarks` is consulted lazily for
/// end-relative and position-less seeks.
fn resolve_target(
    target: SeekTarget,
    current: Option<i64>,
    watermarks: impl FnOnce() -> Result<(i64, i64), rdkafka::error::KafkaError>,
) -> Result<Offset, rdkafka::error::KafkaError> {
    match target {
        SeekTarget::Absolute(offset) => Ok(Offset::Offset(offset.max(0))),
        SeekTarget::Beginning => Ok(Offset::Beginning),
        SeekTarget::End => Ok(Offset::End),
        SeekTarget::Relative { delta, to_current } => {
            let base = if to_current {
                match current {
                    Some(position) => position,
                    None => watermarks()?.0,
                }
            } else {
                watermarks()?.1
            };
            Ok(Offset::Offset((base + delta).max(0)))
        }
        SeekTarget::Function(f) => {
            let base = match current {
                Some(position) => position,
                None => watermarks()?.0,
            };
            Ok(Offset::Offset(f(base).max(0)))
        }
        SeekTarget::Timestamp(_) => {
            unreachable!("timestamp seeks are batched through offsets_for_times")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_watermarks() -> Result<(i64, i64), rdkafka::error::KafkaError> {
        panic!("watermarks should not be fetched for this target")
    }

    #[test]
    fn absolute_seeks_clamp_at_zero() {
        assert_eq!(
            resolve_target(SeekTarget::Absolute(-5), None, no_watermarks).unwrap(),
            Offset::Offset(0)
        );
        assert_eq!(
            resolve_target(SeekTarget::Absolute(42), None, no_watermarks).unwrap(),
            Offset::Offset(42)
        );
    }

    #[test]
    fn relative_to_current_uses_position() {
        assert_eq!(
            resolve_target(
                SeekTarget::Relative {
                    delta: -3,
                    to_current: true
                },
                Some(10),
                no_watermarks,
            )
            .unwrap(),
            Offset::Offset(7)
        );
        // clamped at zero
        assert_eq!(
            resolve_target(
                SeekTarget::Relative {
                    delta: -30,
                    to_current: true
                },
                Some(10),
                no_watermarks,
            )
            .unwrap(),
            Offset::Offset(0)
        );
    }

    #[test]
    fn relative_to_end_uses_high_watermark() {
        assert_eq!(
            resolve_target(
                SeekTarget::Relative {
                    delta: -5,
                    to_current: false
                },
                Some(3),
                || Ok((0, 100)),
            )
            .unwrap(),
            Offset::Offset(95)
        );
    }

    #[test]
    fn function_seek_maps_current_position() {
        assert_eq!(
            resolve_target(SeekTarget::Function(Box::new(|pos| pos / 2)), Some(9), || {
                Ok((0, 0))
            })
            .unwrap(),
            Offset::Offset(4)
        );
        // negative results clamp at zero
        assert_eq!(
            resolve_target(
                SeekTarget::Function(Box::new(|pos| pos - 100)),
                Some(10),
                || Ok((0, 0)),
            )
            .unwrap(),
            Offset::Offset(0)
        );
    }

    #[test]
    fn callback_enqueues_for_the_queue() {
        let mut queue = SeekQueue::new();
        let callback = queue.callback();
        callback.seek("events", 0, 17);
        callback.seek_to_beginning("events", 1);
        callback.seek_relative("events", 2, -10, true);
        callback.seek_to_timestamp("events", 3, 1_700_000_000_000);

        let drained = queue.drain();
        assert_eq!(drained.len(), 4);
        assert_eq!(drained[0].partition, Partition::new("events", 0));
        assert!(matches!(drained[0].target, SeekTarget::Absolute(17)));
        assert!(matches!(drained[1].target, SeekTarget::Beginning));
        assert!(matches!(
            drained[2].target,
            SeekTarget::Relative {
                delta: -10,
                to_current: true
            }
        ));
        assert!(matches!(
            drained[3].target,
            SeekTarget::Timestamp(1_700_000_000_000)
        ));
        assert!(queue.drain().is_empty());
    }
}
