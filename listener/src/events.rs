use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::errors::StopReason;
use crate::types::Partition;

/// Lifecycle and liveness notifications published by a container. Events
/// carry the container id for attribution instead of a handle back to the
/// container, so sinks can be shared across containers freely.
#[derive(Debug, Clone, PartialEq)]
pub enum ContainerEvent {
    Starting,
    Started,
    FailedToStart,
    ContainerPaused,
    ContainerResumed,
    PartitionsPaused { partitions: Vec<Partition> },
    PartitionsResumed { partitions: Vec<Partition> },
    ContainerIdle { idle_for: Duration },
    ContainerNoLongerIdle,
    PartitionIdle { partition: Partition, idle_for: Duration },
    PartitionNoLongerIdle { partition: Partition },
    NonResponsive { since_last_poll: Duration },
    Stopping,
    Stopped { reason: StopReason },
    RetryAuth { error: String },
    RetryAuthSuccessful,
}

/// Event consumers implement this; publication happens on the consumer
/// thread (except `NonResponsive`, which the monitor task publishes), so
/// implementations must not block for long.
pub trait EventSink: Send + Sync {
    fn publish(&self, container_id: &str, event: ContainerEvent);
}

/// Default sink: logs events through `tracing`.
#[derive(Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn publish(&self, container_id: &str, event: ContainerEvent) {
        match &event {
            ContainerEvent::NonResponsive { since_last_poll } => warn!(
                container_id,
                ?since_last_poll,
                "consumer poll loop is not responding"
            ),
            ContainerEvent::FailedToStart => warn!(container_id, "container failed to start"),
            ContainerEvent::Stopped { reason } if *reason != StopReason::Normal => {
                warn!(container_id, ?reason, "container stopped")
            }
            ContainerEvent::Starting
            | ContainerEvent::Started
            | ContainerEvent::Stopping
            | ContainerEvent::Stopped { .. } => info!(container_id, ?event, "container lifecycle"),
            other => debug!(container_id, event = ?other, "container event"),
        }
    }
}

/// Forwards events over a channel; the receiving side decides what to do
/// with them. Used by tests and by apps that multiplex container events.
pub struct ChannelEventSink {
    sender: UnboundedSender<(String, ContainerEvent)>,
}

impl ChannelEventSink {
    pub fn new(sender: UnboundedSender<(String, ContainerEvent)>) -> Self {
        Self { sender }
    }
}

impl EventSink for ChannelEventSink {
    fn publish(&self, container_id: &str, event: ContainerEvent) {
        // A dropped receiver just means nobody is listening anymore
        drop(self.sender.send((container_id.to_string(), event)));
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc::unbounded_channel;

    use super::*;

    #[test]
    fn channel_sink_forwards_with_attribution() {
        let (tx, mut rx) = unbounded_channel();
        let sink = ChannelEventSink::new(tx);

        sink.publish("listener-a", ContainerEvent::Started);
        sink.publish(
            "listener-b",
            ContainerEvent::Stopped {
                reason: StopReason::Normal,
            },
        );

        assert_eq!(
            rx.try_recv().unwrap(),
            ("listener-a".to_string(), ContainerEvent::Started)
        );
        let (id, event) = rx.try_recv().unwrap();
        assert_eq!(id, "listener-b");
        assert_eq!(
            event,
            ContainerEvent::Stopped {
                reason: StopReason::Normal
            }
        );
    }

    #[test]
    fn channel_sink_survives_dropped_receiver() {
        let (tx, rx) = unbounded_channel();
        drop(rx);
        let sink = ChannelEventSink::new(tx);
        sink.publish("listener-a", ContainerEvent::ContainerPaused);
    }
}
