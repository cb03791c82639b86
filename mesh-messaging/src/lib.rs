//! # Mesh Messaging
//!
//! Traced message consumption and production for mesh services.
//!
//! - **Consumer runtime** - [`Consumer`] joins a consumer group, processes
//!   every message inside a `"consume message"` span that continues the
//!   trace carried in the message headers, contains handler panics, marks
//!   each message once processed and stops cleanly on cancellation or
//!   SIGINT / SIGTERM
//! - **Producer spans** - [`start_producer_span`] and [`TracedProducer`]
//!   open a `"produce message"` span and write its context into the outgoing
//!   headers
//! - **Brokers** - [`InMemoryBroker`] for tests and local runs, Kafka behind
//!   the `kafka` feature
//!
//! ## Features
//!
//! - `kafka` - Apache Kafka support through `rdkafka`
//!
//! ## Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use mesh_messaging::*;
//! use mesh_telemetry::ObservabilityContext;
//! use opentelemetry::Context;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! struct Orders;
//!
//! #[async_trait]
//! impl MessageHandler for Orders {
//!     async fn process(&self, _cx: &Context, message: &ConsumerMessage) -> Result<(), HandlerError> {
//!         println!("order {:?}", message.key_str());
//!         Ok(())
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), MessagingError> {
//! let obs = Arc::new(ObservabilityContext::disabled());
//! let broker = InMemoryBroker::new();
//! let group = broker.group("billing").with_initial_offset(InitialOffset::Oldest);
//!
//! let producer = TracedProducer::new(broker.clone(), obs.clone());
//! producer.send(ProducerMessage::new("orders", "{}").with_key("o-1")).await?;
//!
//! let cancel = CancellationToken::new();
//! let consumer = Consumer::new(Arc::new(group), obs).with_signal_handling(false);
//!
//! let stop = cancel.clone();
//! tokio::spawn(async move {
//!     tokio::time::sleep(std::time::Duration::from_millis(50)).await;
//!     stop.cancel();
//! });
//! consumer.consume(&cancel, ["orders"], Arc::new(Orders)).await?;
//!
//! assert_eq!(broker.marked().len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod consumer;
pub mod error;
pub mod memory;
pub mod message;
pub mod producer;
pub mod traits;

#[cfg(feature = "kafka")]
pub mod kafka;

pub use config::{ConsumerConfig, InitialOffset, ProducerConfig, TlsConfig};
pub use consumer::{CONSUME_SPAN_NAME, Consumer, ConsumerState, Fault, start_consumer_span};
pub use error::{MessagingError, MessagingResult};
pub use memory::{InMemoryBroker, InMemoryGroup, MarkedOffset, TopicPartitionOffset};
pub use message::{ConsumerMessage, HeaderExtractor, HeaderInjector, ProducerMessage, RecordHeader};
pub use producer::{PRODUCE_SPAN_NAME, TracedProducer, start_producer_span};
pub use traits::{
    Claim, ConsumerGroup, ConsumerSession, FnHandler, HandlerError, MessageHandler, MessageStream,
    Producer, SessionHandler, TopicPartition, handler_fn,
};

#[cfg(feature = "kafka")]
pub use kafka::{KafkaConsumerGroup, KafkaProducer};
