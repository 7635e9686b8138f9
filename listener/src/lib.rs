//! A single-consumer Kafka message listener runtime.
//!
//! One [`ListenerContainer`] drives one Kafka consumer on a dedicated thread:
//! it subscribes (or takes a fixed assignment), polls, hands records to the
//! registered [`MessageListener`], and commits offsets according to the
//! configured [`AckMode`], including manual acknowledgement, out-of-order
//! async acknowledgement, nack-with-sleep redelivery, user seeks, pause and
//! resume, and transactional offset forwarding through a
//! [`common_kafka::transaction::TransactionalProducer`].
//!
//! Containers are built through [`ListenerContainerBuilder`]:
//!
//! ```no_run
//! use kafka_listener::{ContainerConfig, ListenerContainerBuilder, MessageListener};
//! use common_kafka::config::{ConsumerConfig, KafkaConfig};
//! use common_kafka::consumer::ConsumerFactory;
//! use envconfig::Envconfig;
//!
//! # fn main() -> anyhow::Result<()> {
//! let factory = ConsumerFactory::new(
//!     KafkaConfig::init_from_env()?,
//!     ConsumerConfig::init_from_env()?,
//! );
//! let container = ListenerContainerBuilder::new(factory)
//!     .topics(["events"])
//!     .listener(MessageListener::record(|record| {
//!         tracing::info!("got {}@{}", record.partition(), record.offset);
//!         Ok(())
//!     }))
//!     .config(ContainerConfig::default())
//!     .build()?;
//! container.start()?;
//! # Ok(())
//! # }
//! ```

pub mod ack;
pub mod config;
pub mod container;
pub mod error_handler;
pub mod errors;
pub mod events;
pub mod interceptor;
pub mod listener;
pub mod metric_consts;
pub mod monitor;
pub mod offsets;
pub mod pause;
pub mod rebalance;
pub mod run_loop;
pub mod seeks;
pub mod types;

pub use ack::Acknowledgment;
pub use config::{AckMode, AssignmentCommitOption, CommitLogLevel, ContainerConfig, EosMode};
pub use container::{ListenerContainer, ListenerContainerBuilder};
pub use error_handler::{AfterRollbackProcessor, DefaultErrorHandler, ErrorHandler};
pub use errors::{AckError, ContainerError, StopReason};
pub use events::{ChannelEventSink, ContainerEvent, EventSink, TracingEventSink};
pub use interceptor::{BatchInterceptor, RecordInterceptor};
pub use listener::{ListenerInfo, MessageListener};
pub use rebalance::RebalanceHandler;
pub use seeks::SeekCallback;
pub use types::{ConsumerRecord, Partition, TopicPartitionOffset};
