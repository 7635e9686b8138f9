//! End-to-end container tests against librdkafka's in-process mock cluster.
//!
//! These cover the lifecycle and commit paths that the mock broker supports;
//! transactional flows need a real broker and live in
//! `transactional_integration_tests.rs`.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kafka_listener::{
    AckMode, ContainerConfig, ContainerEvent, ListenerContainerBuilder, MessageListener,
    Partition, StopReason,
};
use uuid::Uuid;

use common::{
    drain_events, event_sink, factory_for, mock_cluster, produce_records, test_config, wait_for,
};

fn unique(name: &str) -> String {
    format!("{name}-{}", Uuid::new_v4())
}

#[tokio::test]
async fn consumes_and_commits_in_batch_mode() {
    let (cluster, producer) = mock_cluster();
    let topic = unique("listener-batch");
    cluster.create_topic(&topic, 1, 1).expect("create topic");
    produce_records(&producer, &topic, 0, &["a", "b", "c", "d", "e"]).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_in_listener = seen.clone();
    let (sink, mut events) = event_sink();

    let container = ListenerContainerBuilder::new(factory_for(&cluster, &unique("group")))
        .topics([topic.clone()])
        .listener(MessageListener::record(move |record| {
            let payload = record.value.clone().unwrap_or_default();
            seen_in_listener.lock().unwrap().push(payload);
            Ok(())
        }))
        .config(test_config())
        .event_sink(Arc::new(sink))
        .build()
        .expect("container builds");

    container.start().expect("container starts");

    wait_for("all records to be handled", Duration::from_secs(30), || {
        seen.lock().unwrap().len() == 5
    })
    .await;

    let partition = Partition::new(topic.clone(), 0);
    wait_for("batch commit to land", Duration::from_secs(10), || {
        container.last_committed(&partition) == Some(5)
    })
    .await;

    let reason = container.stop_and_join().expect("join");
    assert_eq!(reason, StopReason::Normal);

    let events = drain_events(&mut events);
    assert!(events.contains(&ContainerEvent::Starting));
    assert!(events.contains(&ContainerEvent::Started));
    assert!(events.contains(&ContainerEvent::Stopping));
    assert!(events.contains(&ContainerEvent::Stopped {
        reason: StopReason::Normal
    }));

    let handled: Vec<String> = seen
        .lock()
        .unwrap()
        .iter()
        .map(|v| String::from_utf8_lossy(v).into_owned())
        .collect();
    assert_eq!(handled, vec!["a", "b", "c", "d", "e"]);
}

#[tokio::test]
async fn manual_ack_commits_only_acknowledged_records() {
    let (cluster, producer) = mock_cluster();
    let topic = unique("listener-manual");
    cluster.create_topic(&topic, 1, 1).expect("create topic");
    produce_records(&producer, &topic, 0, &["one", "two", "three"]).await;

    let acked = Arc::new(AtomicUsize::new(0));
    let acked_in_listener = acked.clone();

    let container = ListenerContainerBuilder::new(factory_for(&cluster, &unique("group")))
        .topics([topic.clone()])
        .listener(MessageListener::record_acknowledging(move |_, ack| {
            ack.acknowledge()?;
            acked_in_listener.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
        .config(ContainerConfig {
            ack_mode: AckMode::Manual,
            ..test_config()
        })
        .build()
        .expect("container builds");

    container.start().expect("container starts");

    wait_for("all records acknowledged", Duration::from_secs(30), || {
        acked.load(Ordering::SeqCst) == 3
    })
    .await;

    let partition = Partition::new(topic.clone(), 0);
    wait_for("manual commits to land", Duration::from_secs(10), || {
        container.last_committed(&partition) == Some(3)
    })
    .await;

    assert_eq!(container.stop_and_join().expect("join"), StopReason::Normal);
}

#[tokio::test]
async fn record_mode_commits_after_each_record() {
    let (cluster, producer) = mock_cluster();
    let topic = unique("listener-record");
    cluster.create_topic(&topic, 1, 1).expect("create topic");
    produce_records(&producer, &topic, 0, &["r0", "r1"]).await;

    let handled = Arc::new(AtomicUsize::new(0));
    let handled_in_listener = handled.clone();

    let container = ListenerContainerBuilder::new(factory_for(&cluster, &unique("group")))
        .topics([topic.clone()])
        .listener(MessageListener::record(move |_| {
            handled_in_listener.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
        .config(ContainerConfig {
            ack_mode: AckMode::Record,
            ..test_config()
        })
        .build()
        .expect("container builds");

    container.start().expect("container starts");

    let partition = Partition::new(topic.clone(), 0);
    wait_for("record-mode commits", Duration::from_secs(30), || {
        container.last_committed(&partition) == Some(2)
    })
    .await;
    assert_eq!(handled.load(Ordering::SeqCst), 2);

    assert_eq!(container.stop_and_join().expect("join"), StopReason::Normal);
}

#[tokio::test]
async fn batch_listener_receives_whole_polls() {
    let (cluster, producer) = mock_cluster();
    let topic = unique("listener-batches");
    cluster.create_topic(&topic, 1, 1).expect("create topic");
    produce_records(&producer, &topic, 0, &["a", "b", "c", "d"]).await;

    let total = Arc::new(AtomicUsize::new(0));
    let batches = Arc::new(AtomicUsize::new(0));
    let (total_l, batches_l) = (total.clone(), batches.clone());

    let container = ListenerContainerBuilder::new(factory_for(&cluster, &unique("group")))
        .topics([topic.clone()])
        .listener(MessageListener::batch(move |records| {
            batches_l.fetch_add(1, Ordering::SeqCst);
            total_l.fetch_add(records.len(), Ordering::SeqCst);
            Ok(())
        }))
        .config(test_config())
        .build()
        .expect("container builds");

    container.start().expect("container starts");

    wait_for("all records dispatched", Duration::from_secs(30), || {
        total.load(Ordering::SeqCst) == 4
    })
    .await;
    assert!(batches.load(Ordering::SeqCst) >= 1);

    let partition = Partition::new(topic.clone(), 0);
    wait_for("batch commit", Duration::from_secs(10), || {
        container.last_committed(&partition) == Some(4)
    })
    .await;

    assert_eq!(container.stop_and_join().expect("join"), StopReason::Normal);
}

#[tokio::test]
async fn nack_redelivers_the_suffix_after_sleep() {
    let (cluster, producer) = mock_cluster();
    let topic = unique("listener-nack");
    cluster.create_topic(&topic, 1, 1).expect("create topic");
    produce_records(&producer, &topic, 0, &["n0", "n1", "n2"]).await;

    // nack offset 1 on its first delivery; everything else is acked
    let deliveries = Arc::new(Mutex::new(Vec::new()));
    let nacked_once = Arc::new(AtomicUsize::new(0));
    let (deliveries_l, nacked_l) = (deliveries.clone(), nacked_once.clone());
    let (sink, mut events) = event_sink();

    let container = ListenerContainerBuilder::new(factory_for(&cluster, &unique("group")))
        .topics([topic.clone()])
        .listener(MessageListener::record_acknowledging(move |record, ack| {
            deliveries_l.lock().unwrap().push(record.offset);
            if record.offset == 1 && nacked_l.fetch_add(1, Ordering::SeqCst) == 0 {
                ack.nack(Duration::from_millis(200))?;
            } else {
                ack.acknowledge()?;
            }
            Ok(())
        }))
        .config(ContainerConfig {
            ack_mode: AckMode::Manual,
            ..test_config()
        })
        .event_sink(Arc::new(sink))
        .build()
        .expect("container builds");

    container.start().expect("container starts");

    wait_for("offset 1 to be redelivered", Duration::from_secs(30), || {
        deliveries
            .lock()
            .unwrap()
            .iter()
            .filter(|offset| **offset == 1)
            .count()
            >= 2
    })
    .await;

    let partition = Partition::new(topic.clone(), 0);
    wait_for("commits to reach the end", Duration::from_secs(30), || {
        container.last_committed(&partition) == Some(3)
    })
    .await;

    assert_eq!(container.stop_and_join().expect("join"), StopReason::Normal);

    // the nack paused and later resumed the assigned partition
    let events = drain_events(&mut events);
    assert!(events
        .iter()
        .any(|event| matches!(event, ContainerEvent::PartitionsPaused { .. })));
    assert!(events
        .iter()
        .any(|event| matches!(event, ContainerEvent::PartitionsResumed { .. })));

    // the suffix (offsets 1 and 2) was replayed in order after the sleep
    let deliveries = deliveries.lock().unwrap();
    let after_nack: Vec<i64> = deliveries
        .iter()
        .copied()
        .skip_while(|offset| *offset != 1)
        .skip(1)
        .collect();
    assert_eq!(after_nack, vec![1, 2], "deliveries were {deliveries:?}");
}

#[tokio::test]
async fn failing_handler_retries_then_recovers() {
    let (cluster, producer) = mock_cluster();
    let topic = unique("listener-errors");
    cluster.create_topic(&topic, 1, 1).expect("create topic");
    produce_records(&producer, &topic, 0, &["poison", "good"]).await;

    let attempts = Arc::new(AtomicUsize::new(0));
    let good_seen = Arc::new(AtomicUsize::new(0));
    let (attempts_l, good_l) = (attempts.clone(), good_seen.clone());

    let container = ListenerContainerBuilder::new(factory_for(&cluster, &unique("group")))
        .topics([topic.clone()])
        .listener(MessageListener::record(move |record| {
            if record.value.as_deref() == Some(b"poison") {
                attempts_l.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("cannot handle this record");
            }
            good_l.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
        .error_handler(Arc::new(kafka_listener::DefaultErrorHandler::new(
            3,
            Duration::ZERO,
        )))
        .config(test_config())
        .build()
        .expect("container builds");

    container.start().expect("container starts");

    // three failing attempts, then the record is recovered (skipped) and the
    // next one is processed
    wait_for("retries to exhaust", Duration::from_secs(30), || {
        attempts.load(Ordering::SeqCst) == 3
    })
    .await;
    wait_for("good record to be handled", Duration::from_secs(30), || {
        good_seen.load(Ordering::SeqCst) == 1
    })
    .await;

    let partition = Partition::new(topic.clone(), 0);
    wait_for("commit past both records", Duration::from_secs(10), || {
        container.last_committed(&partition) == Some(2)
    })
    .await;

    assert_eq!(container.stop_and_join().expect("join"), StopReason::Normal);
    assert_eq!(attempts.load(Ordering::SeqCst), 3, "no further retries");
}

#[tokio::test]
async fn seek_callback_replays_from_absolute_offset() {
    let (cluster, producer) = mock_cluster();
    let topic = unique("listener-seek");
    cluster.create_topic(&topic, 1, 1).expect("create topic");
    produce_records(&producer, &topic, 0, &["s0", "s1", "s2"]).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_l = seen.clone();

    let container = ListenerContainerBuilder::new(factory_for(&cluster, &unique("group")))
        .topics([topic.clone()])
        .listener(MessageListener::record(move |record| {
            seen_l.lock().unwrap().push(record.offset);
            Ok(())
        }))
        .config(test_config())
        .build()
        .expect("container builds");

    container.start().expect("container starts");

    wait_for("initial consumption", Duration::from_secs(30), || {
        seen.lock().unwrap().len() == 3
    })
    .await;

    container.seek_callback().seek(topic.clone(), 0, 0);

    wait_for("replay from offset zero", Duration::from_secs(30), || {
        seen.lock().unwrap().len() == 6
    })
    .await;
    assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 0, 1, 2]);

    assert_eq!(container.stop_and_join().expect("join"), StopReason::Normal);
}

#[tokio::test]
async fn pause_and_resume_control_dispatch() {
    let (cluster, producer) = mock_cluster();
    let topic = unique("listener-pause");
    cluster.create_topic(&topic, 1, 1).expect("create topic");
    produce_records(&producer, &topic, 0, &["p0"]).await;

    let seen = Arc::new(AtomicUsize::new(0));
    let seen_l = seen.clone();
    let (sink, mut events) = event_sink();

    let container = ListenerContainerBuilder::new(factory_for(&cluster, &unique("group")))
        .topics([topic.clone()])
        .listener(MessageListener::record(move |_| {
            seen_l.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
        .config(test_config())
        .event_sink(Arc::new(sink))
        .build()
        .expect("container builds");

    container.start().expect("container starts");
    wait_for("first record", Duration::from_secs(30), || {
        seen.load(Ordering::SeqCst) == 1
    })
    .await;

    container.pause();
    wait_for("pause event", Duration::from_secs(10), || {
        drain_events(&mut events)
            .iter()
            .any(|event| *event == ContainerEvent::ContainerPaused)
    })
    .await;
    assert!(container.is_paused());

    // records produced while paused are not dispatched
    produce_records(&producer, &topic, 0, &["p1"]).await;
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(seen.load(Ordering::SeqCst), 1);

    container.resume();
    wait_for("record after resume", Duration::from_secs(30), || {
        seen.load(Ordering::SeqCst) == 2
    })
    .await;

    assert_eq!(container.stop_and_join().expect("join"), StopReason::Normal);
}

#[tokio::test]
async fn stop_is_idempotent() {
    let (cluster, _producer) = mock_cluster();
    let topic = unique("listener-stop");
    cluster.create_topic(&topic, 1, 1).expect("create topic");

    let container = ListenerContainerBuilder::new(factory_for(&cluster, &unique("group")))
        .topics([topic.clone()])
        .listener(MessageListener::record(|_| Ok(())))
        .config(test_config())
        .build()
        .expect("container builds");

    container.start().expect("container starts");
    wait_for("running", Duration::from_secs(15), || container.is_running()).await;

    container.stop();
    container.stop();
    assert_eq!(container.stop_and_join().expect("join"), StopReason::Normal);
    assert!(!container.is_running());
    assert!(matches!(
        container.stop_and_join(),
        Err(kafka_listener::ContainerError::NotRunning)
    ));
}
