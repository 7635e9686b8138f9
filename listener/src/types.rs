use std::fmt;

use rdkafka::message::{BorrowedMessage, Headers};
use rdkafka::{Message, Offset, TopicPartitionList};

/// Header carrying the delivery-attempt counter as a 4-byte big-endian value,
/// written before dispatch when `delivery_attempt_header` is enabled.
pub const DELIVERY_ATTEMPT_HEADER: &str = "kl_delivery_attempt";

/// Headers a deserializing producer-side interceptor can set to flag a record
/// whose key or value failed to decode. The run loop raises before the
/// listener ever sees such a record.
pub const DESERIALIZER_EXCEPTION_KEY_HEADER: &str = "kl_deserialization_exception_key";
pub const DESERIALIZER_EXCEPTION_VALUE_HEADER: &str = "kl_deserialization_exception_value";

/// A (topic, partition) pair with value identity, used as the map key for all
/// of the runtime's bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Partition {
    pub topic: String,
    pub partition: i32,
}

impl Partition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// A partition plus an offset, as handed to error handlers and seek hooks.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPartitionOffset {
    pub partition: Partition,
    pub offset: i64,
}

impl TopicPartitionOffset {
    pub fn new(partition: Partition, offset: i64) -> Self {
        Self { partition, offset }
    }
}

impl fmt::Display for TopicPartitionOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.partition, self.offset)
    }
}

/// An owned copy of one record as returned by the broker. Detached from the
/// rdkafka borrow at poll time so it can outlive the poll, cross the retained
/// records buffer, and be replayed after a pause.
#[derive(Debug, Clone)]
pub struct ConsumerRecord {
    pub topic: String,
    pub partition_id: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    pub headers: Vec<(String, Vec<u8>)>,
    pub timestamp: Option<i64>,
}

impl ConsumerRecord {
    pub fn from_borrowed(msg: &BorrowedMessage<'_>) -> Self {
        let headers: Vec<(String, Vec<u8>)> = msg
            .headers()
            .map(|hdrs| {
                hdrs.iter()
                    .filter_map(|header| header.value.map(|v| (header.key.to_string(), v.to_vec())))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            topic: msg.topic().to_string(),
            partition_id: msg.partition(),
            offset: msg.offset(),
            key: msg.key().map(|k| k.to_vec()),
            value: msg.payload().map(|p| p.to_vec()),
            headers,
            timestamp: msg.timestamp().to_millis(),
        }
    }

    pub fn partition(&self) -> Partition {
        Partition::new(self.topic.clone(), self.partition_id)
    }

    pub fn tpo(&self) -> TopicPartitionOffset {
        TopicPartitionOffset::new(self.partition(), self.offset)
    }

    pub fn header(&self, key: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }

    pub fn has_header(&self, key: &str) -> bool {
        self.header(key).is_some()
    }

    /// Inserts or replaces a header value.
    pub fn set_header(&mut self, key: &str, value: Vec<u8>) {
        if let Some(slot) = self.headers.iter_mut().find(|(k, _)| k == key) {
            slot.1 = value;
        } else {
            self.headers.push((key.to_string(), value));
        }
    }
}

/// Builds a commit list with every entry at `offset` (already a "next to
/// fetch" position).
pub fn commit_list<'a>(
    entries: impl IntoIterator<Item = (&'a Partition, &'a i64)>,
) -> Result<TopicPartitionList, rdkafka::error::KafkaError> {
    let mut tpl = TopicPartitionList::new();
    for (partition, offset) in entries {
        tpl.add_partition_offset(
            &partition.topic,
            partition.partition,
            Offset::Offset(*offset),
        )?;
    }
    Ok(tpl)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(topic: &str, partition: i32, offset: i64) -> ConsumerRecord {
        ConsumerRecord {
            topic: topic.to_string(),
            partition_id: partition,
            offset,
            key: None,
            value: Some(b"payload".to_vec()),
            headers: vec![],
            timestamp: Some(1_700_000_000_000),
        }
    }

    #[test]
    fn partition_display_matches_broker_notation() {
        assert_eq!(Partition::new("events", 3).to_string(), "events-3");
    }

    #[test]
    fn header_set_and_replace() {
        let mut rec = record("events", 0, 42);
        assert!(!rec.has_header(DELIVERY_ATTEMPT_HEADER));

        rec.set_header(DELIVERY_ATTEMPT_HEADER, 1i32.to_be_bytes().to_vec());
        assert_eq!(
            rec.header(DELIVERY_ATTEMPT_HEADER),
            Some(&1i32.to_be_bytes()[..])
        );

        rec.set_header(DELIVERY_ATTEMPT_HEADER, 2i32.to_be_bytes().to_vec());
        assert_eq!(
            rec.header(DELIVERY_ATTEMPT_HEADER),
            Some(&2i32.to_be_bytes()[..])
        );
        assert_eq!(rec.headers.len(), 1);
    }

    #[test]
    fn commit_list_carries_all_entries() {
        let entries = [
            (Partition::new("events", 0), 10i64),
            (Partition::new("events", 1), 7i64),
        ];
        let tpl = commit_list(entries.iter().map(|(p, o)| (p, o))).unwrap();
        assert_eq!(tpl.count(), 2);
        let map = tpl.to_topic_map();
        assert_eq!(
            map.get(&("events".to_string(), 0)),
            Some(&Offset::Offset(10))
        );
        assert_eq!(
            map.get(&("events".to_string(), 1)),
            Some(&Offset::Offset(7))
        );
    }
}
