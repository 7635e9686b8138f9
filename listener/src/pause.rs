use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext};
use rdkafka::error::KafkaError;
use rdkafka::TopicPartitionList;
use tracing::{debug, warn};

use crate::events::{ContainerEvent, EventSink};
use crate::types::Partition;

/// Pause state requested from outside the consumer thread (the container
/// handle). The consumer thread reconciles these against the client each
/// iteration.
#[derive(Debug, Default)]
pub struct PauseRequests {
    container: AtomicBool,
    partitions: Mutex<HashSet<Partition>>,
}

impl PauseRequests {
    pub fn request_container_pause(&self) {
        self.container.store(true, Ordering::SeqCst);
    }

    pub fn request_container_resume(&self) {
        self.container.store(false, Ordering::SeqCst);
    }

    pub fn container_pause_requested(&self) -> bool {
        self.container.load(Ordering::SeqCst)
    }

    pub fn request_partition_pause(&self, partition: Partition) {
        self.partitions
            .lock()
            .expect("pause requests mutex poisoned")
            .insert(partition);
    }

    pub fn request_partition_resume(&self, partition: &Partition) {
        self.partitions
            .lock()
            .expect("pause requests mutex poisoned")
            .remove(partition);
    }

    pub fn partition_pause_requested(&self, partition: &Partition) -> bool {
        self.partitions
            .lock()
            .expect("pause requests mutex poisoned")
            .contains(partition)
    }

    pub fn requested_partitions(&self) -> HashSet<Partition> {
        self.partitions
            .lock()
            .expect("pause requests mutex poisoned")
            .clone()
    }
}

/// Reconciles the four pause sources (user, nack sleep, async-ack
/// backpressure, retained-records) against the Kafka client. Owned by the
/// consumer thread.
pub struct PauseController {
    requests: Arc<PauseRequests>,
    /// What is actually paused on the client right now.
    applied: HashSet<Partition>,
    /// Whether a ContainerPaused event has been published.
    container_pause_published: bool,
    nack_paused: HashSet<Partition>,
    nack_resume_at: Option<Instant>,
    /// Partitions that must stay paused while retained records exist.
    retention: HashSet<Partition>,
}

impl PauseController {
    pub fn new(requests: Arc<PauseRequests>) -> Self {
        Self {
            requests,
            applied: HashSet::new(),
            container_pause_published: false,
            nack_paused: HashSet::new(),
            nack_resume_at: None,
            retention: HashSet::new(),
        }
    }

    pub fn requests(&self) -> &Arc<PauseRequests> {
        &self.requests
    }

    pub fn is_container_pause_requested(&self) -> bool {
        self.requests.container_pause_requested()
    }

    pub fn is_applied(&self, partition: &Partition) -> bool {
        self.applied.contains(partition)
    }

    pub fn retention_partitions(&self) -> &HashSet<Partition> {
        &self.retention
    }

    pub fn set_retention(&mut self, partitions: HashSet<Partition>) {
        self.retention = partitions;
    }

    pub fn clear_retention(&mut self) {
        self.retention.clear();
    }

    pub fn drop_revoked_retention(&mut self, revoked: &[Partition]) {
        for partition in revoked {
            self.retention.remove(partition);
            self.nack_paused.remove(partition);
            self.applied.remove(partition);
        }
    }

    /// Marks everything as unpaused on the client side: Kafka clears pauses
    /// across a rebalance, so after an assignment the desired state must be
    /// re-applied from scratch.
    pub fn reset_applied(&mut self) {
        self.applied.clear();
        self.container_pause_published = false;
    }

    /// Pauses all assigned partitions (minus those already paused) until
    /// `resume_at`. On failure the freshly-added pauses are rolled back so a
    /// mid-rebalance nack does not leave phantom pause state behind.
    pub fn pause_for_nack<C: ConsumerContext>(
        &mut self,
        consumer: &BaseConsumer<C>,
        assigned: &HashSet<Partition>,
        resume_at: Instant,
    ) -> Result<(), KafkaError> {
        let fresh: HashSet<Partition> = assigned.difference(&self.applied).cloned().collect();
        if !fresh.is_empty() {
            let tpl = to_tpl(&fresh);
            if let Err(err) = consumer.pause(&tpl) {
                warn!("nack pause failed (rebalance in progress?): {err}");
                return Err(err);
            }
            self.applied.extend(fresh.iter().cloned());
        }
        self.nack_paused = fresh;
        self.nack_resume_at = Some(resume_at);
        Ok(())
    }

    /// The partitions whose nack sleep has elapsed, if any. The caller seeks
    /// them back before calling [`PauseController::clear_nack`].
    pub fn nack_expired(&self) -> Option<&HashSet<Partition>> {
        match self.nack_resume_at {
            Some(resume_at) if Instant::now() >= resume_at => Some(&self.nack_paused),
            _ => None,
        }
    }

    pub fn nack_active(&self) -> bool {
        self.nack_resume_at.is_some()
    }

    /// Time left until the nack sleep elapses, to bound the next poll.
    pub fn nack_remaining(&self) -> Option<std::time::Duration> {
        self.nack_resume_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn clear_nack(&mut self) {
        self.nack_paused.clear();
        self.nack_resume_at = None;
    }

    /// Computes the partitions that should currently be paused.
    fn desired(&self, assigned: &HashSet<Partition>, async_backpressure: bool) -> HashSet<Partition> {
        let mut desired: HashSet<Partition> = HashSet::new();
        if self.requests.container_pause_requested() || async_backpressure {
            desired.extend(assigned.iter().cloned());
        }
        for partition in self.requests.requested_partitions() {
            if assigned.contains(&partition) {
                desired.insert(partition);
            }
        }
        if self.nack_resume_at.is_some() {
            desired.extend(self.nack_paused.iter().cloned());
        }
        desired.extend(self.retention.iter().cloned());
        desired
    }

    /// Applies pauses (always) and resumes (only when `allow_resume`, i.e.
    /// no retained-records buffer is active) and publishes partition and
    /// container pause/resume events on state changes.
    pub fn reconcile<C: ConsumerContext>(
        &mut self,
        consumer: &BaseConsumer<C>,
        assigned: &HashSet<Partition>,
        async_backpressure: bool,
        allow_resume: bool,
        sink: &dyn EventSink,
        container_id: &str,
    ) {
        let desired = self.desired(assigned, async_backpressure);

        let to_pause: Vec<Partition> = desired.difference(&self.applied).cloned().collect();
        if !to_pause.is_empty() {
            let tpl = to_tpl(to_pause.iter());
            match consumer.pause(&tpl) {
                Ok(()) => {
                    debug!(count = to_pause.len(), "paused partitions");
                    self.applied.extend(to_pause.iter().cloned());
                    sink.publish(
                        container_id,
                        ContainerEvent::PartitionsPaused {
                            partitions: sorted(to_pause),
                        },
                    );
                }
                Err(err) => warn!("pause failed: {err}"),
            }
        }

        if allow_resume {
            let to_resume: Vec<Partition> = self
                .applied
                .iter()
                .filter(|p| !desired.contains(*p) && assigned.contains(*p))
                .cloned()
                .collect();
            if !to_resume.is_empty() {
                let tpl = to_tpl(to_resume.iter());
                match consumer.resume(&tpl) {
                    Ok(()) => {
                        debug!(count = to_resume.len(), "resumed partitions");
                        for partition in &to_resume {
                            self.applied.remove(partition);
                        }
                        sink.publish(
                            container_id,
                            ContainerEvent::PartitionsResumed {
                                partitions: sorted(to_resume),
                            },
                        );
                    }
                    Err(err) => warn!("resume failed: {err}"),
                }
            }
        }

        // container-level transitions track the user's whole-consumer request
        let container_paused =
            self.requests.container_pause_requested() && !assigned.is_empty();
        if container_paused && !self.container_pause_published {
            self.container_pause_published = true;
            sink.publish(container_id, ContainerEvent::ContainerPaused);
        } else if !self.requests.container_pause_requested() && self.container_pause_published {
            self.container_pause_published = false;
            sink.publish(container_id, ContainerEvent::ContainerResumed);
        }
    }
}

fn to_tpl<'a>(partitions: impl IntoIterator<Item = &'a Partition>) -> TopicPartitionList {
    let mut tpl = TopicPartitionList::new();
    for partition in partitions {
        tpl.add_partition(&partition.topic, partition.partition);
    }
    tpl
}

fn sorted(mut partitions: Vec<Partition>) -> Vec<Partition> {
    partitions.sort();
    partitions
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(n: i32) -> Partition {
        Partition::new("events", n)
    }

    fn controller() -> PauseController {
        PauseController::new(Arc::new(PauseRequests::default()))
    }

    #[test]
    fn desired_includes_requested_partitions_only_when_assigned() {
        let ctl = controller();
        ctl.requests.request_partition_pause(p(0));
        ctl.requests.request_partition_pause(p(9)); // not assigned

        let assigned: HashSet<_> = [p(0), p(1)].into_iter().collect();
        let desired = ctl.desired(&assigned, false);
        assert_eq!(desired, [p(0)].into_iter().collect());
    }

    #[test]
    fn container_pause_and_backpressure_cover_all_assigned() {
        let ctl = controller();
        let assigned: HashSet<_> = [p(0), p(1)].into_iter().collect();

        assert!(ctl.desired(&assigned, true).is_superset(&assigned));

        ctl.requests.request_container_pause();
        assert!(ctl.desired(&assigned, false).is_superset(&assigned));
        ctl.requests.request_container_resume();
        assert!(ctl.desired(&assigned, false).is_empty());
    }

    #[test]
    fn retention_keeps_partition_in_desired() {
        let mut ctl = controller();
        ctl.set_retention([p(2)].into_iter().collect());
        let assigned: HashSet<_> = [p(1), p(2)].into_iter().collect();
        assert_eq!(ctl.desired(&assigned, false), [p(2)].into_iter().collect());

        ctl.clear_retention();
        assert!(ctl.desired(&assigned, false).is_empty());
    }

    #[test]
    fn nack_expiry_is_time_gated() {
        let mut ctl = controller();
        ctl.nack_paused = [p(0)].into_iter().collect();
        ctl.nack_resume_at = Some(Instant::now() + std::time::Duration::from_secs(60));
        assert!(ctl.nack_expired().is_none());
        assert!(ctl.nack_active());

        ctl.nack_resume_at = Some(Instant::now() - std::time::Duration::from_millis(1));
        assert_eq!(ctl.nack_expired(), Some(&[p(0)].into_iter().collect()));

        ctl.clear_nack();
        assert!(!ctl.nack_active());
    }

    #[test]
    fn revoked_partitions_are_scrubbed() {
        let mut ctl = controller();
        ctl.set_retention([p(0), p(1)].into_iter().collect());
        ctl.nack_paused = [p(0)].into_iter().collect();
        ctl.applied = [p(0)].into_iter().collect();

        ctl.drop_revoked_retention(&[p(0)]);
        assert_eq!(ctl.retention_partitions(), &[p(1)].into_iter().collect());
        assert!(ctl.nack_paused.is_empty());
        assert!(!ctl.is_applied(&p(0)));
    }
}
