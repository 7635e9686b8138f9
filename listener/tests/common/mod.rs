// shared by several test binaries; not every binary uses every helper
#![allow(dead_code)]

use std::time::{Duration, Instant};

use common_kafka::consumer::ConsumerFactory;
use common_kafka::test::mock_configs;
use kafka_listener::{ChannelEventSink, ContainerConfig, ContainerEvent};
use rdkafka::mocking::MockCluster;
use rdkafka::producer::{DefaultProducerContext, FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

pub type Events = UnboundedReceiver<(String, ContainerEvent)>;

/// One mock broker plus a producer pointed at it.
pub fn mock_cluster() -> (MockCluster<'static, DefaultProducerContext>, FutureProducer) {
    let cluster = MockCluster::new(1).expect("failed to create mock broker");
    let producer: FutureProducer = ClientConfig::new()
        .set("bootstrap.servers", cluster.bootstrap_servers())
        .set("message.timeout.ms", "5000")
        .create()
        .expect("failed to create producer");
    (cluster, producer)
}

pub fn factory_for(cluster: &MockCluster<'_, DefaultProducerContext>, group: &str) -> ConsumerFactory {
    let (common, consumer) = mock_configs(&cluster.bootstrap_servers(), group);
    ConsumerFactory::new(common, consumer)
}

/// Short timeouts so tests stay responsive to stop requests.
pub fn test_config() -> ContainerConfig {
    ContainerConfig {
        poll_timeout: Duration::from_millis(250),
        poll_timeout_while_paused: Duration::from_millis(50),
        consumer_start_timeout: Duration::from_secs(15),
        ..ContainerConfig::default()
    }
}

pub fn event_sink() -> (ChannelEventSink, Events) {
    let (tx, rx) = unbounded_channel();
    (ChannelEventSink::new(tx), rx)
}

pub async fn produce_records(
    producer: &FutureProducer,
    topic: &str,
    partition: i32,
    payloads: &[&str],
) {
    for payload in payloads {
        producer
            .send(
                FutureRecord::to(topic)
                    .partition(partition)
                    .key("key")
                    .payload(*payload),
                Timeout::After(Duration::from_secs(5)),
            )
            .await
            .map(|_| ())
            .expect("produce failed");
    }
}

/// Polls a condition until it holds or the timeout elapses.
pub async fn wait_for(what: &str, timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Drains every event currently queued.
pub fn drain_events(events: &mut Events) -> Vec<ContainerEvent> {
    let mut out = Vec::new();
    while let Ok((_, event)) = events.try_recv() {
        out.push(event);
    }
    out
}
