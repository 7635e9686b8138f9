use std::time::Duration;

use rdkafka::error::KafkaError;

use crate::types::Partition;

/// Why a container stopped, carried on the `Stopped` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Ordinary stop request.
    Normal,
    /// Emergency stop (message-loss risk detected).
    Abnormal,
    /// An escaped error or panic on the consumer thread.
    Error,
    /// Producer or consumer instance fenced.
    Fenced,
    /// Unrecoverable authentication/authorization failure.
    Auth,
    /// No committed offset and the reset policy is "none".
    NoOffset,
}

#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),

    #[error("listener execution failed (group {group_id}): {source}")]
    ListenerExecutionFailed {
        group_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("record {partition}@{offset} carries a deserialization failure in {header}")]
    Deserialization {
        partition: Partition,
        offset: i64,
        header: &'static str,
    },

    #[error("commit failed after {retries} retries: {source}")]
    CommitFailed {
        retries: u32,
        #[source]
        source: KafkaError,
    },

    #[error("transaction aborted: {0}")]
    TransactionAborted(#[source] anyhow::Error),

    #[error("producer fenced: {0}")]
    Fenced(#[source] KafkaError),

    #[error("invalid container configuration: {0}")]
    Configuration(String),

    #[error("container already running")]
    AlreadyRunning,

    #[error("container is not running")]
    NotRunning,

    #[error("consumer thread did not start within {0:?}")]
    StartTimeout(Duration),
}

/// Failures surfaced to an acknowledging caller. Misuse of the handle is an
/// error for the caller, never for the container.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum AckError {
    #[error("nack may only be called on the consumer thread")]
    NotConsumerThread,

    #[error("nack is not supported with out-of-order (async) acks")]
    NackWithAsyncAcks,

    #[error("acknowledged offset {offset} on {partition} is below the in-flight head {head}")]
    StaleAck {
        partition: Partition,
        offset: i64,
        head: i64,
    },

    #[error("index {index} out of range for a batch of {len}")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("acknowledge(index) requires indices to increase; got {index} after {last}")]
    NonIncreasingIndex { index: usize, last: usize },

    #[error("acknowledge(index) is only supported with AckMode::ManualImmediate")]
    NotManualImmediate,

    #[error("partial acknowledgement requires a record-list batch listener")]
    NotARecordList,

    #[error("the consumer backing this acknowledgment is gone")]
    ConsumerGone,

    #[error("commit failed: {0}")]
    Commit(#[from] KafkaError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_render_with_context() {
        let err = ContainerError::ListenerExecutionFailed {
            group_id: "g1".into(),
            source: anyhow::anyhow!("boom"),
        };
        assert!(err.to_string().contains("g1"));

        let ack = AckError::StaleAck {
            partition: Partition::new("t", 0),
            offset: 4,
            head: 7,
        };
        assert!(ack.to_string().contains("below the in-flight head 7"));
    }
}
