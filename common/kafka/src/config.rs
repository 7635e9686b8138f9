use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32, // Size of the in-memory producer queue in mebibytes

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message: 20 seconds

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd

    #[envconfig(default = "10000")]
    pub kafka_statistics_interval_ms: u32,
}

#[derive(Envconfig, Clone)]
pub struct ConsumerConfig {
    pub kafka_consumer_group: String,

    // We default to "earliest" for this, but if you're bringing up a new service, you probably
    // want "latest". "none" makes a missing committed offset a fatal condition for the
    // listener runtime.
    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest, none

    // Note: consumers used in a transactional fashion should disable auto offset commits,
    // as their offsets should be committed via the transactional producer. All consumers
    // disable auto offset /storing/.
    #[envconfig(default = "false")]
    pub kafka_consumer_auto_commit: bool,

    #[envconfig(default = "5000")]
    pub kafka_consumer_auto_commit_interval_ms: i32,

    // The listener runtime caps its idle-between-polls sleep against this, staying well
    // inside the group's poll deadline.
    #[envconfig(default = "300000")]
    pub kafka_consumer_max_poll_interval_ms: u32,

    #[envconfig(default = "45000")]
    pub kafka_consumer_session_timeout_ms: u32,

    #[envconfig(default = "3000")]
    pub kafka_consumer_heartbeat_interval_ms: u32,
}

impl ConsumerConfig {
    /// Because the consumer config is so application specific, we
    /// can't set good defaults in the derive macro, so we expose a way
    /// for users to set them here before init'ing their main config struct
    pub fn set_defaults(consumer_group: &str, auto_commit: bool) {
        if std::env::var("KAFKA_CONSUMER_GROUP").is_err() {
            std::env::set_var("KAFKA_CONSUMER_GROUP", consumer_group);
        };
        if std::env::var("KAFKA_CONSUMER_AUTO_COMMIT").is_err() {
            std::env::set_var("KAFKA_CONSUMER_AUTO_COMMIT", auto_commit.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn consumer_defaults_resolve() {
        let mut env = HashMap::new();
        env.insert(
            "KAFKA_CONSUMER_GROUP".to_string(),
            "unit-test-group".to_string(),
        );
        let config = ConsumerConfig::init_from_hashmap(&env)
            .expect("defaults should satisfy the config");
        assert_eq!(config.kafka_consumer_group, "unit-test-group");
        assert_eq!(config.kafka_consumer_offset_reset, "earliest");
        assert!(!config.kafka_consumer_auto_commit);
        assert_eq!(config.kafka_consumer_max_poll_interval_ms, 300_000);
    }
}
