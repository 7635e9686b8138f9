use std::time::Duration;

use rdkafka::{
    consumer::ConsumerGroupMetadata,
    error::KafkaError,
    producer::{FutureProducer, FutureRecord, Producer},
    ClientConfig, TopicPartitionList,
};
use tracing::{debug, error, info};

use crate::config::KafkaConfig;

pub struct TransactionalProducer {
    inner: FutureProducer,
    timeout: Duration,
}

impl TransactionalProducer {
    pub fn from_config(
        config: &KafkaConfig,
        transactional_id: &str,
        timeout: Duration,
    ) -> Result<Self, KafkaError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set(
                "statistics.interval.ms",
                config.kafka_statistics_interval_ms.to_string(),
            )
            .set("linger.ms", config.kafka_producer_linger_ms.to_string())
            .set(
                "message.timeout.ms",
                config.kafka_message_timeout_ms.to_string(),
            )
            .set(
                "compression.codec",
                config.kafka_compression_codec.to_owned(),
            )
            .set(
                "queue.buffering.max.kbytes",
                (config.kafka_producer_queue_mib * 1024).to_string(),
            )
            .set("transactional.id", transactional_id);

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        debug!("rdkafka configuration: {:?}", client_config);
        let api: FutureProducer = client_config.create()?;

        // "Ping" the Kafka brokers by requesting metadata
        match api
            .client()
            .fetch_metadata(None, std::time::Duration::from_secs(15))
        {
            Ok(metadata) => {
                info!(
                    "Successfully connected to Kafka brokers. Found {} topics.",
                    metadata.topics().len()
                );
            }
            Err(err) => {
                error!("Failed to fetch metadata from Kafka brokers: {:?}", err);
                return Err(err);
            }
        }

        api.init_transactions(timeout)?;

        Ok(TransactionalProducer {
            inner: api,
            timeout,
        })
    }

    pub fn begin(&self) -> Result<KafkaTransaction<'_>, KafkaError> {
        self.inner.begin_transaction()?;
        Ok(KafkaTransaction { producer: self })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    // Expose the inner at the producer level, but not at the transaction level -
    // during a transaction, we want strong control over the operations done, but outside
    // of the transaction, we want to be able to do things like fetch metadata
    pub fn inner(&self) -> &FutureProducer {
        &self.inner
    }
}

// Transactions are either read-write or write-only; associating consumed offsets
// through send_offsets turns a write-only transaction into a read-write one.
pub struct KafkaTransaction<'a> {
    producer: &'a TransactionalProducer,
}

impl KafkaTransaction<'_> {
    /// Atomically ties the given consumer offsets to this transaction. The
    /// offsets must be "next to fetch" positions (processed offset + 1), and
    /// the metadata must come from the consumer whose records were processed.
    pub fn send_offsets(
        &self,
        offsets: &TopicPartitionList,
        group_metadata: &ConsumerGroupMetadata,
    ) -> Result<(), KafkaError> {
        self.producer
            .inner
            .send_offsets_to_transaction(offsets, group_metadata, self.producer.timeout)
    }

    /// Enqueues a record inside the transaction without awaiting delivery;
    /// delivery is resolved by the transaction commit.
    pub fn send_record(&self, record: FutureRecord<'_, [u8], [u8]>) -> Result<(), KafkaError> {
        self.producer
            .inner
            .send_result(record)
            .map(|_| ())
            .map_err(|(err, _)| err)
    }

    pub fn commit(self) -> Result<(), KafkaError> {
        self.producer
            .inner
            .commit_transaction(self.producer.timeout)
    }

    pub fn abort(self) -> Result<(), KafkaError> {
        self.producer.inner.abort_transaction(self.producer.timeout)
    }
}
