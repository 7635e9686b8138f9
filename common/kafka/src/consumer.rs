use std::collections::HashMap;

use rdkafka::{
    consumer::{BaseConsumer, ConsumerContext},
    error::KafkaError,
    ClientConfig,
};
use tracing::debug;

use crate::config::{ConsumerConfig, KafkaConfig};

/// Builds consumers from the environment-driven configs, one per listener
/// container. Group id and client id parts can be overridden per consumer so
/// that several containers can share a process (and a config) while staying
/// distinguishable on the broker side.
#[derive(Clone)]
pub struct ConsumerFactory {
    common_config: KafkaConfig,
    consumer_config: ConsumerConfig,
}

impl ConsumerFactory {
    pub fn new(common_config: KafkaConfig, consumer_config: ConsumerConfig) -> Self {
        Self {
            common_config,
            consumer_config,
        }
    }

    pub fn group_id(&self) -> &str {
        &self.consumer_config.kafka_consumer_group
    }

    pub fn offset_reset(&self) -> &str {
        &self.consumer_config.kafka_consumer_offset_reset
    }

    pub fn auto_commit(&self) -> bool {
        self.consumer_config.kafka_consumer_auto_commit
    }

    pub fn max_poll_interval_ms(&self) -> u32 {
        self.consumer_config.kafka_consumer_max_poll_interval_ms
    }

    /// Assembles the rdkafka client config for one consumer. Offset storing is
    /// always disabled: the listener runtime decides what gets committed, and
    /// when, through its own ledger.
    pub fn client_config(
        &self,
        group_id: Option<&str>,
        client_id_prefix: Option<&str>,
        client_id_suffix: Option<&str>,
        property_overrides: &HashMap<String, String>,
    ) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &self.common_config.kafka_hosts)
            .set(
                "statistics.interval.ms",
                self.common_config.kafka_statistics_interval_ms.to_string(),
            )
            .set(
                "group.id",
                group_id.unwrap_or(&self.consumer_config.kafka_consumer_group),
            )
            .set(
                "auto.offset.reset",
                &self.consumer_config.kafka_consumer_offset_reset,
            )
            .set(
                "enable.auto.commit",
                self.consumer_config.kafka_consumer_auto_commit.to_string(),
            )
            .set(
                "auto.commit.interval.ms",
                self.consumer_config
                    .kafka_consumer_auto_commit_interval_ms
                    .to_string(),
            )
            .set(
                "max.poll.interval.ms",
                self.consumer_config
                    .kafka_consumer_max_poll_interval_ms
                    .to_string(),
            )
            .set(
                "session.timeout.ms",
                self.consumer_config
                    .kafka_consumer_session_timeout_ms
                    .to_string(),
            )
            .set(
                "heartbeat.interval.ms",
                self.consumer_config
                    .kafka_consumer_heartbeat_interval_ms
                    .to_string(),
            );

        client_config.set("enable.auto.offset.store", "false");

        if let Some(client_id) = build_client_id(client_id_prefix, client_id_suffix) {
            client_config.set("client.id", client_id);
        }

        if self.common_config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        // User overrides win over everything assembled above
        client_config.extend(
            property_overrides
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );

        debug!("rdkafka consumer configuration: {:?}", client_config);
        client_config
    }

    /// Creates an unsubscribed consumer; the listener container subscribes or
    /// assigns once its rebalance context is wired up.
    pub fn create_consumer<C>(
        &self,
        group_id: Option<&str>,
        client_id_prefix: Option<&str>,
        client_id_suffix: Option<&str>,
        property_overrides: &HashMap<String, String>,
        context: C,
    ) -> Result<BaseConsumer<C>, KafkaError>
    where
        C: ConsumerContext,
    {
        self.client_config(
            group_id,
            client_id_prefix,
            client_id_suffix,
            property_overrides,
        )
        .create_with_context(context)
    }
}

fn build_client_id(prefix: Option<&str>, suffix: Option<&str>) -> Option<String> {
    match (prefix, suffix) {
        (Some(p), Some(s)) => Some(format!("{p}-{s}")),
        (Some(p), None) => Some(p.to_string()),
        (None, Some(s)) => Some(s.to_string()),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn test_factory(reset: &str, auto_commit: bool) -> ConsumerFactory {
        let common = KafkaConfig {
            kafka_hosts: "localhost:9092".to_string(),
            kafka_tls: false,
            kafka_producer_linger_ms: 20,
            kafka_producer_queue_mib: 400,
            kafka_message_timeout_ms: 20_000,
            kafka_compression_codec: "none".to_string(),
            kafka_statistics_interval_ms: 10_000,
        };
        let consumer = ConsumerConfig {
            kafka_consumer_group: "factory-test".to_string(),
            kafka_consumer_offset_reset: reset.to_string(),
            kafka_consumer_auto_commit: auto_commit,
            kafka_consumer_auto_commit_interval_ms: 5000,
            kafka_consumer_max_poll_interval_ms: 300_000,
            kafka_consumer_session_timeout_ms: 45_000,
            kafka_consumer_heartbeat_interval_ms: 3000,
        };
        ConsumerFactory::new(common, consumer)
    }

    #[test]
    fn offset_store_is_always_disabled() {
        let factory = test_factory("latest", true);
        let config = factory.client_config(None, None, None, &HashMap::new());
        assert_eq!(
            config.get("enable.auto.offset.store"),
            Some("false"),
            "the runtime owns offset storage"
        );
        assert_eq!(config.get("enable.auto.commit"), Some("true"));
        assert_eq!(config.get("auto.offset.reset"), Some("latest"));
    }

    #[test]
    fn client_id_parts_compose() {
        let factory = test_factory("earliest", false);
        let config = factory.client_config(
            Some("other-group"),
            Some("listener"),
            Some("0"),
            &HashMap::new(),
        );
        assert_eq!(config.get("client.id"), Some("listener-0"));
        assert_eq!(config.get("group.id"), Some("other-group"));
    }

    #[test]
    fn property_overrides_win() {
        let factory = test_factory("earliest", false);
        let mut overrides = HashMap::new();
        overrides.insert("fetch.min.bytes".to_string(), "1024".to_string());
        overrides.insert("auto.offset.reset".to_string(), "none".to_string());
        let config = factory.client_config(None, None, None, &overrides);
        assert_eq!(config.get("fetch.min.bytes"), Some("1024"));
        assert_eq!(config.get("auto.offset.reset"), Some("none"));
    }
}
