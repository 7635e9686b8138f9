use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;
use std::time::Duration;

use rdkafka::error::KafkaError;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

use crate::config::AckMode;
use crate::errors::AckError;
use crate::types::Partition;

/// One acknowledged commit position (already "next to fetch"), posted from
/// any thread and drained on the consumer thread before each poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckEntry {
    pub partition: Partition,
    pub next_offset: i64,
}

/// The ack channel: concurrent producers, single consumer (the consumer
/// thread).
pub struct AckChannel {
    tx: UnboundedSender<AckEntry>,
    rx: UnboundedReceiver<AckEntry>,
}

impl Default for AckChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl AckChannel {
    pub fn new() -> Self {
        let (tx, rx) = unbounded_channel();
        Self { tx, rx }
    }

    pub fn sender(&self) -> UnboundedSender<AckEntry> {
        self.tx.clone()
    }

    /// Drains everything currently queued without blocking.
    pub fn drain(&mut self) -> Vec<AckEntry> {
        let mut entries = Vec::new();
        while let Ok(entry) = self.rx.try_recv() {
            entries.push(entry);
        }
        entries
    }

    /// Drops queued acks for partitions that are going away.
    pub fn drop_for(&mut self, revoked: &[Partition]) -> Vec<AckEntry> {
        self.drain()
            .into_iter()
            .filter(|entry| !revoked.contains(&entry.partition))
            .collect()
    }
}

/// Per-partition in-flight offsets for out-of-order (async) acknowledgement.
///
/// `in_flight` holds every dispatched-but-uncommitted offset in arrival
/// order; `completed_ahead` marks the ones whose handler finished while an
/// earlier offset was still open. A commit is only emitted when the head
/// closes, at which point the contiguous completed run collapses into a
/// single commit position.
#[derive(Debug, Default)]
pub struct DeferredOffsets {
    in_flight: HashMap<Partition, VecDeque<i64>>,
    completed_ahead: HashMap<Partition, BTreeSet<i64>>,
}

impl DeferredOffsets {
    /// Registers a dispatched record.
    pub fn track(&mut self, partition: Partition, offset: i64) {
        self.in_flight.entry(partition).or_default().push_back(offset);
    }

    /// Processes an acknowledgement. Returns the commit position that became
    /// ready (next-to-fetch), or `None` when the ack only closed a gap-free
    /// future offset.
    pub fn ack(&mut self, partition: &Partition, offset: i64) -> Result<Option<i64>, AckError> {
        let Some(queue) = self.in_flight.get_mut(partition) else {
            warn!(%partition, offset, "ack for untracked partition ignored");
            return Ok(None);
        };
        let Some(&head) = queue.front() else {
            warn!(%partition, offset, "ack with no records in flight ignored");
            return Ok(None);
        };

        if offset < head {
            return Err(AckError::StaleAck {
                partition: partition.clone(),
                offset,
                head,
            });
        }

        let completed = self.completed_ahead.entry(partition.clone()).or_default();
        if offset > head {
            if queue.contains(&offset) {
                // idempotent: re-inserting an already deferred offset is fine
                completed.insert(offset);
            } else {
                warn!(%partition, offset, "ack for unknown offset ignored");
            }
            return Ok(None);
        }

        // the head itself closed; collapse the contiguous completed run
        queue.pop_front();
        let mut boundary = offset;
        while let Some(&next) = queue.front() {
            if completed.remove(&next) {
                queue.pop_front();
                boundary = next;
            } else {
                break;
            }
        }
        Ok(Some(boundary + 1))
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.values().all(|queue| queue.is_empty())
    }

    pub fn remove_partition(&mut self, partition: &Partition) {
        self.in_flight.remove(partition);
        self.completed_ahead.remove(partition);
    }

    pub fn clear(&mut self) {
        self.in_flight.clear();
        self.completed_ahead.clear();
    }
}

/// The out-of-order table and the async-ack pause flag share one mutex; both
/// are touched by the consumer thread and by acking threads, never with
/// another lock held.
#[derive(Debug, Default)]
pub struct AsyncAckState {
    pub deferred: DeferredOffsets,
    pub paused_for_async_acks: bool,
}

/// Commits an offset synchronously from the consumer thread, for
/// `AckMode::ManualImmediate`. Implemented over a weak consumer reference so
/// a leaked handle cannot keep a closed consumer alive.
pub trait ImmediateCommitter: Send + Sync {
    fn commit_now(&self, partition: &Partition, next_offset: i64) -> Result<(), KafkaError>;
}

/// A negative acknowledgement captured from the handler, applied by the run
/// loop after the handler returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NackRequest {
    /// Index into the dispatched batch of the first unprocessed record (0
    /// for a record listener).
    pub start_index: usize,
    pub sleep: Duration,
}

enum AckScope {
    /// One record.
    Record { partition: Partition, offset: i64 },
    /// A batch, as (partition, offset) per record in dispatch order.
    Batch {
        records: Vec<(Partition, i64)>,
        /// Whether the listener saw an indexable record list (required for
        /// partial acknowledgement).
        indexable: bool,
        /// One past the last index committed through `acknowledge_index`.
        acked_through: Mutex<usize>,
    },
}

/// The handle given to acknowledging listeners.
pub struct Acknowledgment {
    scope: AckScope,
    ack_mode: AckMode,
    async_acks: bool,
    tx: UnboundedSender<AckEntry>,
    async_state: Option<Arc<Mutex<AsyncAckState>>>,
    immediate: Option<Arc<dyn ImmediateCommitter>>,
    consumer_thread: ThreadId,
    nack_slot: Arc<Mutex<Option<NackRequest>>>,
}

impl Acknowledgment {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn for_record(
        partition: Partition,
        offset: i64,
        ack_mode: AckMode,
        async_acks: bool,
        tx: UnboundedSender<AckEntry>,
        async_state: Option<Arc<Mutex<AsyncAckState>>>,
        immediate: Option<Arc<dyn ImmediateCommitter>>,
        consumer_thread: ThreadId,
        nack_slot: Arc<Mutex<Option<NackRequest>>>,
    ) -> Self {
        Self {
            scope: AckScope::Record { partition, offset },
            ack_mode,
            async_acks,
            tx,
            async_state,
            immediate,
            consumer_thread,
            nack_slot,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn for_batch(
        records: Vec<(Partition, i64)>,
        indexable: bool,
        ack_mode: AckMode,
        async_acks: bool,
        tx: UnboundedSender<AckEntry>,
        async_state: Option<Arc<Mutex<AsyncAckState>>>,
        immediate: Option<Arc<dyn ImmediateCommitter>>,
        consumer_thread: ThreadId,
        nack_slot: Arc<Mutex<Option<NackRequest>>>,
    ) -> Self {
        Self {
            scope: AckScope::Batch {
                records,
                indexable,
                acked_through: Mutex::new(0),
            },
            ack_mode,
            async_acks,
            tx,
            async_state,
            immediate,
            consumer_thread,
            nack_slot,
        }
    }

    /// Whether acknowledgements may arrive out of order (async acks).
    pub fn is_out_of_order_commit(&self) -> bool {
        self.async_acks
    }

    /// Acknowledges the record, or the whole batch (the rest of it, after a
    /// partial `acknowledge_index`).
    pub fn acknowledge(&self) -> Result<(), AckError> {
        match &self.scope {
            AckScope::Record { partition, offset } => self.ack_one(partition, *offset),
            AckScope::Batch {
                records,
                acked_through,
                ..
            } => {
                let mut done = acked_through
                    .lock()
                    .expect("acknowledgment mutex poisoned");
                if *done >= records.len() {
                    debug!("batch already fully acknowledged");
                    return Ok(());
                }
                // commit the highest offset per partition over the remainder
                let mut highest: HashMap<Partition, i64> = HashMap::new();
                for (partition, offset) in &records[*done..] {
                    let slot = highest.entry(partition.clone()).or_insert(*offset);
                    if *slot < *offset {
                        *slot = *offset;
                    }
                }
                *done = records.len();
                drop(done);
                for (partition, offset) in highest {
                    self.ack_one(&partition, offset)?;
                }
                Ok(())
            }
        }
    }

    /// Commits through the record at `index` (inclusive). Batch +
    /// `ManualImmediate` + consumer thread only; indices must strictly
    /// increase across calls.
    pub fn acknowledge_index(&self, index: usize) -> Result<(), AckError> {
        if self.ack_mode != AckMode::ManualImmediate {
            return Err(AckError::NotManualImmediate);
        }
        self.ensure_consumer_thread()?;
        let AckScope::Batch {
            records,
            indexable,
            acked_through,
        } = &self.scope
        else {
            return Err(AckError::NotARecordList);
        };
        if !indexable {
            return Err(AckError::NotARecordList);
        }
        if index >= records.len() {
            return Err(AckError::IndexOutOfRange {
                index,
                len: records.len(),
            });
        }
        let mut done = acked_through
            .lock()
            .expect("acknowledgment mutex poisoned");
        if index + 1 <= *done {
            return Err(AckError::NonIncreasingIndex {
                index,
                last: done.saturating_sub(1),
            });
        }
        let mut highest: HashMap<Partition, i64> = HashMap::new();
        for (partition, offset) in &records[*done..=index] {
            let slot = highest.entry(partition.clone()).or_insert(*offset);
            if *slot < *offset {
                *slot = *offset;
            }
        }
        *done = index + 1;
        drop(done);
        for (partition, offset) in highest {
            self.ack_one(&partition, offset)?;
        }
        Ok(())
    }

    /// Marks this record (and everything after it) as unprocessed: the
    /// consumer pauses for `sleep`, seeks back, and replays. Consumer thread
    /// only; not available with async acks.
    pub fn nack(&self, sleep: Duration) -> Result<(), AckError> {
        self.nack_at(0, sleep)
    }

    /// Batch variant: records before `index` are acknowledged, the suffix is
    /// replayed after `sleep`.
    pub fn nack_index(&self, index: usize, sleep: Duration) -> Result<(), AckError> {
        match &self.scope {
            AckScope::Record { .. } => Err(AckError::NotARecordList),
            AckScope::Batch { records, .. } => {
                if index >= records.len() {
                    return Err(AckError::IndexOutOfRange {
                        index,
                        len: records.len(),
                    });
                }
                self.nack_at(index, sleep)
            }
        }
    }

    fn nack_at(&self, index: usize, sleep: Duration) -> Result<(), AckError> {
        if self.async_acks {
            return Err(AckError::NackWithAsyncAcks);
        }
        self.ensure_consumer_thread()?;
        *self.nack_slot.lock().expect("nack slot mutex poisoned") = Some(NackRequest {
            start_index: index,
            sleep,
        });
        Ok(())
    }

    fn ensure_consumer_thread(&self) -> Result<(), AckError> {
        if std::thread::current().id() != self.consumer_thread {
            return Err(AckError::NotConsumerThread);
        }
        Ok(())
    }

    fn ack_one(&self, partition: &Partition, offset: i64) -> Result<(), AckError> {
        if self.async_acks {
            let state = self
                .async_state
                .as_ref()
                .expect("async acks enabled without a deferred table");
            let boundary = {
                let mut state = state.lock().expect("async ack mutex poisoned");
                state.deferred.ack(partition, offset)?
            };
            if let Some(next_offset) = boundary {
                drop(self.tx.send(AckEntry {
                    partition: partition.clone(),
                    next_offset,
                }));
            }
            return Ok(());
        }

        match self.ack_mode {
            AckMode::ManualImmediate => {
                self.ensure_consumer_thread()?;
                let committer = self.immediate.as_ref().ok_or(AckError::ConsumerGone)?;
                committer.commit_now(partition, offset + 1)?;
                Ok(())
            }
            _ => {
                // Manual commits at the next poll boundary; for the non-manual
                // modes an explicit ack is simply an early hint and rides the
                // same channel.
                drop(self.tx.send(AckEntry {
                    partition: partition.clone(),
                    next_offset: offset + 1,
                }));
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(n: i32) -> Partition {
        Partition::new("events", n)
    }

    #[test]
    fn out_of_order_acks_collapse_in_offset_order() {
        // spec scenario: offsets 10..=14 acked as 11, 10, 13, 12, 14
        let mut table = DeferredOffsets::default();
        for offset in 10..=14 {
            table.track(p(0), offset);
        }

        assert_eq!(table.ack(&p(0), 11).unwrap(), None);
        assert_eq!(table.ack(&p(0), 10).unwrap(), Some(12)); // 10+11 close together
        assert_eq!(table.ack(&p(0), 13).unwrap(), None);
        assert_eq!(table.ack(&p(0), 12).unwrap(), Some(14)); // 12+13 close together
        assert_eq!(table.ack(&p(0), 14).unwrap(), Some(15));
        assert!(table.is_empty());
    }

    #[test]
    fn stale_ack_is_a_programmer_error() {
        let mut table = DeferredOffsets::default();
        table.track(p(0), 10);
        table.track(p(0), 11);
        assert_eq!(table.ack(&p(0), 10).unwrap(), Some(11));

        let err = table.ack(&p(0), 9).unwrap_err();
        assert_eq!(
            err,
            AckError::StaleAck {
                partition: p(0),
                offset: 9,
                head: 11,
            }
        );
    }

    #[test]
    fn deferred_reack_is_idempotent() {
        let mut table = DeferredOffsets::default();
        table.track(p(0), 10);
        table.track(p(0), 11);
        assert_eq!(table.ack(&p(0), 11).unwrap(), None);
        assert_eq!(table.ack(&p(0), 11).unwrap(), None);
        assert_eq!(table.ack(&p(0), 10).unwrap(), Some(12));
    }

    #[test]
    fn partitions_are_independent() {
        let mut table = DeferredOffsets::default();
        table.track(p(0), 5);
        table.track(p(1), 8);
        assert_eq!(table.ack(&p(1), 8).unwrap(), Some(9));
        assert!(!table.is_empty());
        table.remove_partition(&p(0));
        assert!(table.is_empty());
    }

    #[test]
    fn ack_channel_drains_and_filters_revoked() {
        let mut channel = AckChannel::new();
        let tx = channel.sender();
        tx.send(AckEntry {
            partition: p(0),
            next_offset: 3,
        })
        .unwrap();
        tx.send(AckEntry {
            partition: p(1),
            next_offset: 9,
        })
        .unwrap();

        let kept = channel.drop_for(&[p(0)]);
        assert_eq!(
            kept,
            vec![AckEntry {
                partition: p(1),
                next_offset: 9
            }]
        );
        assert!(channel.drain().is_empty());
    }

    fn manual_record_ack(
        offset: i64,
        tx: UnboundedSender<AckEntry>,
        consumer_thread: ThreadId,
    ) -> Acknowledgment {
        Acknowledgment::for_record(
            p(0),
            offset,
            AckMode::Manual,
            false,
            tx,
            None,
            None,
            consumer_thread,
            Arc::new(Mutex::new(None)),
        )
    }

    #[test]
    fn manual_ack_posts_next_offset() {
        let channel = AckChannel::new();
        let ack = manual_record_ack(41, channel.sender(), std::thread::current().id());
        ack.acknowledge().unwrap();

        let mut channel = channel;
        assert_eq!(
            channel.drain(),
            vec![AckEntry {
                partition: p(0),
                next_offset: 42
            }]
        );
    }

    #[test]
    fn nack_requires_consumer_thread() {
        let channel = AckChannel::new();
        // the "consumer thread" is a different thread than the one nacking
        let consumer_thread = std::thread::spawn(|| std::thread::current().id())
            .join()
            .unwrap();
        let ack = manual_record_ack(7, channel.sender(), consumer_thread);
        assert_eq!(
            ack.nack(Duration::from_millis(100)).unwrap_err(),
            AckError::NotConsumerThread
        );
    }

    #[test]
    fn nack_rejected_with_async_acks() {
        let channel = AckChannel::new();
        let state = Arc::new(Mutex::new(AsyncAckState::default()));
        let ack = Acknowledgment::for_record(
            p(0),
            7,
            AckMode::Manual,
            true,
            channel.sender(),
            Some(state),
            None,
            std::thread::current().id(),
            Arc::new(Mutex::new(None)),
        );
        assert_eq!(
            ack.nack(Duration::from_millis(100)).unwrap_err(),
            AckError::NackWithAsyncAcks
        );
    }

    #[test]
    fn nack_captures_request_for_the_loop() {
        let channel = AckChannel::new();
        let slot = Arc::new(Mutex::new(None));
        let ack = Acknowledgment::for_batch(
            vec![(p(0), 5), (p(0), 6), (p(0), 7)],
            true,
            AckMode::Manual,
            false,
            channel.sender(),
            None,
            None,
            std::thread::current().id(),
            slot.clone(),
        );
        ack.nack_index(1, Duration::from_millis(200)).unwrap();
        assert_eq!(
            slot.lock().unwrap().clone(),
            Some(NackRequest {
                start_index: 1,
                sleep: Duration::from_millis(200)
            })
        );
    }

    #[test]
    fn partial_then_full_batch_ack() {
        let mut channel = AckChannel::new();
        struct NoopCommitter(std::sync::Mutex<Vec<(Partition, i64)>>);
        impl ImmediateCommitter for NoopCommitter {
            fn commit_now(&self, partition: &Partition, next_offset: i64) -> Result<(), KafkaError> {
                self.0.lock().unwrap().push((partition.clone(), next_offset));
                Ok(())
            }
        }
        let committer = Arc::new(NoopCommitter(std::sync::Mutex::new(Vec::new())));
        let ack = Acknowledgment::for_batch(
            vec![(p(0), 5), (p(0), 6), (p(1), 3), (p(0), 7)],
            true,
            AckMode::ManualImmediate,
            false,
            channel.sender(),
            None,
            Some(committer.clone()),
            std::thread::current().id(),
            Arc::new(Mutex::new(None)),
        );

        // through index 1: only partition 0, offset 6 -> commit 7
        ack.acknowledge_index(1).unwrap();
        {
            let committed = committer.0.lock().unwrap();
            assert_eq!(committed.as_slice(), &[(p(0), 7)]);
        }

        // indices must increase
        assert!(matches!(
            ack.acknowledge_index(1).unwrap_err(),
            AckError::NonIncreasingIndex { .. }
        ));

        // second acknowledge() commits the rest: p1->4 and p0->8
        ack.acknowledge().unwrap();
        let mut committed = committer.0.lock().unwrap().clone();
        committed.sort();
        assert_eq!(committed, vec![(p(0), 7), (p(0), 8), (p(1), 4)]);
        assert!(channel.drain().is_empty());
    }

    #[test]
    fn async_ack_routes_through_deferred_table() {
        let mut channel = AckChannel::new();
        let state = Arc::new(Mutex::new(AsyncAckState::default()));
        {
            let mut locked = state.lock().unwrap();
            locked.deferred.track(p(0), 10);
            locked.deferred.track(p(0), 11);
        }
        let slot = Arc::new(Mutex::new(None));
        let tx = channel.sender();
        let make_ack = move |offset: i64| {
            Acknowledgment::for_record(
                p(0),
                offset,
                AckMode::Manual,
                true,
                tx.clone(),
                Some(state.clone()),
                None,
                std::thread::current().id(),
                slot.clone(),
            )
        };

        // high offset first: deferred, nothing on the channel
        make_ack(11).acknowledge().unwrap();
        assert!(channel.drain().is_empty());

        // the head closes the gap and both commit as one entry
        make_ack(10).acknowledge().unwrap();
        assert_eq!(
            channel.drain(),
            vec![AckEntry {
                partition: p(0),
                next_offset: 12
            }]
        );
    }
}
