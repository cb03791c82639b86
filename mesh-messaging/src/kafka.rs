//! Apache Kafka consumer group and producer

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future;
use futures_util::{Stream, StreamExt};
use mesh_telemetry::ObservabilityContext;
use parking_lot::Mutex;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer as _, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Header, Headers, Message as _, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Offset, TopicPartitionList};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConsumerConfig, ProducerConfig, TlsConfig};
use crate::consumer::Consumer;
use crate::error::{MessagingError, MessagingResult};
use crate::message::{ConsumerMessage, ProducerMessage, RecordHeader};
use crate::traits::{
    Claim, ConsumerGroup, ConsumerSession, MessageStream, Producer, SessionHandler, TopicPartition,
};

fn client_config(brokers: &str, client_id: Option<&str>, tls: Option<&TlsConfig>) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config.set("bootstrap.servers", brokers);

    if let Some(client_id) = client_id {
        client_config.set("client.id", client_id);
    }

    if let Some(tls) = tls {
        client_config.set("security.protocol", "SSL");
        if let Some(ref ca_cert) = tls.ca_cert {
            client_config.set("ssl.ca.location", ca_cert);
        }
        if let Some(ref client_cert) = tls.client_cert {
            client_config.set("ssl.certificate.location", client_cert);
        }
        if let Some(ref client_key) = tls.client_key {
            client_config.set("ssl.key.location", client_key);
        }
    }

    client_config
}

/// Kafka consumer group.
///
/// Offsets of marked messages are stored locally and committed by the
/// client's auto-commit, so a message is committed once marked whatever the
/// handler did with it.
pub struct KafkaConsumerGroup {
    consumer: StreamConsumer,
    group_id: String,
    subscribed: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl KafkaConsumerGroup {
    /// Create the consumer. Fails on invalid configuration or TLS material.
    pub fn new(config: &ConsumerConfig) -> MessagingResult<Self> {
        config.validate()?;

        info!(
            brokers = %config.bootstrap_servers(),
            group_id = %config.group_id,
            "Connecting to Kafka"
        );

        let mut client_config = client_config(
            &config.bootstrap_servers(),
            config.client_id.as_deref(),
            config.tls.as_ref(),
        );
        client_config
            .set("group.id", &config.group_id)
            .set("auto.offset.reset", config.initial_offset.as_reset_policy())
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("session.timeout.ms", config.session_timeout_ms.to_string());

        let consumer: StreamConsumer = client_config.create()?;

        Ok(Self {
            consumer,
            group_id: config.group_id.clone(),
            subscribed: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    fn subscribe(&self, topics: &[String]) -> MessagingResult<()> {
        let mut subscribed = self.subscribed.lock();
        if subscribed.as_slice() == topics {
            return Ok(());
        }

        let names: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer.subscribe(&names)?;
        *subscribed = topics.to_vec();
        info!(topics = ?topics, "Subscribed to Kafka topics");
        Ok(())
    }
}

impl std::fmt::Debug for KafkaConsumerGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaConsumerGroup")
            .field("group_id", &self.group_id)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

struct KafkaSession<'a> {
    consumer: &'a StreamConsumer,
    partitions: Vec<TopicPartition>,
}

impl<'a> KafkaSession<'a> {
    /// Session over the current assignment, which stays empty until the
    /// first poll completes the group join.
    fn new(consumer: &'a StreamConsumer) -> Self {
        let partitions = consumer
            .assignment()
            .map(|list| {
                list.elements()
                    .iter()
                    .map(|elem| TopicPartition::new(elem.topic(), elem.partition()))
                    .collect()
            })
            .unwrap_or_default();
        Self {
            consumer,
            partitions,
        }
    }
}

impl ConsumerSession for KafkaSession<'_> {
    fn claims(&self) -> BTreeMap<String, Vec<i32>> {
        let mut claims: BTreeMap<String, Vec<i32>> = BTreeMap::new();
        for tp in &self.partitions {
            claims.entry(tp.topic.clone()).or_default().push(tp.partition);
        }
        claims
    }

    fn mark_message(&self, message: &ConsumerMessage) -> MessagingResult<()> {
        let mut list = TopicPartitionList::new();
        list.add_partition_offset(
            &message.topic,
            message.partition,
            Offset::Offset(message.offset + 1),
        )?;
        self.consumer.store_offsets(&list)?;
        Ok(())
    }
}

#[async_trait]
impl ConsumerGroup for KafkaConsumerGroup {
    async fn consume(
        &self,
        cancel: &CancellationToken,
        topics: &[String],
        handler: &dyn SessionHandler,
    ) -> MessagingResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MessagingError::GroupClosed);
        }
        self.subscribe(topics)?;

        let session = KafkaSession::new(&self.consumer);
        handler.setup(&session).await?;

        let fatal = Mutex::new(None);
        let messages = deliveries(self.consumer.stream().take_until(cancel.cancelled()), &fatal);

        let claim = Claim {
            partitions: session.partitions.clone(),
            messages,
        };
        let consumed = handler.consume_claim(&session, claim).await;
        let cleaned = handler.cleanup(&session).await;

        if let Some(err) = fatal.lock().take() {
            error!(error = %err, "Fatal Kafka consumer error");
            return Err(err.into());
        }
        consumed.and(cleaned)
    }

    async fn close(&self) -> MessagingResult<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.consumer.unsubscribe();
            info!(group_id = %self.group_id, "Kafka consumer closed");
        }
        Ok(())
    }
}

/// Converted messages of `stream`. Transient errors are logged and skipped.
/// A fatal error ends the stream and is left in `fatal`.
fn deliveries<'a, S, M>(stream: S, fatal: &'a Mutex<Option<KafkaError>>) -> MessageStream<'a>
where
    S: Stream<Item = Result<M, KafkaError>> + Send + 'a,
    M: rdkafka::Message + Send + 'a,
{
    stream
        .take_while(move |delivery| {
            let keep = match delivery {
                Err(err) if is_fatal(err) => {
                    *fatal.lock() = Some(err.clone());
                    false
                }
                _ => true,
            };
            future::ready(keep)
        })
        .filter_map(|delivery| {
            future::ready(match delivery {
                Ok(message) => Some(to_consumer_message(&message)),
                Err(err) => {
                    warn!(error = %err, "Kafka consumer error");
                    None
                }
            })
        })
        .boxed()
}

fn is_fatal(err: &KafkaError) -> bool {
    matches!(err, KafkaError::MessageConsumptionFatal(_))
        || err.rdkafka_error_code() == Some(RDKafkaErrorCode::Fatal)
}

fn to_consumer_message<M: rdkafka::Message>(message: &M) -> ConsumerMessage {
    let headers = message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .map(|header| {
                    RecordHeader::new(
                        header.key.as_bytes(),
                        header.value.map(<[u8]>::to_vec).unwrap_or_default(),
                    )
                })
                .collect()
        })
        .unwrap_or_default();

    ConsumerMessage {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(<[u8]>::to_vec),
        payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        headers,
        timestamp: message
            .timestamp()
            .to_millis()
            .and_then(chrono::DateTime::from_timestamp_millis),
    }
}

/// Kafka producer
pub struct KafkaProducer {
    producer: FutureProducer,
    timeout: Duration,
}

impl KafkaProducer {
    /// Create the producer. Fails on invalid configuration or TLS material.
    pub fn new(config: &ProducerConfig) -> MessagingResult<Self> {
        config.validate()?;

        let producer: FutureProducer = client_config(
            &config.bootstrap_servers(),
            config.client_id.as_deref(),
            config.tls.as_ref(),
        )
        .create()?;

        info!(brokers = %config.bootstrap_servers(), "Kafka producer created");
        Ok(Self {
            producer,
            timeout: config.send_timeout(),
        })
    }
}

impl std::fmt::Debug for KafkaProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaProducer")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Producer for KafkaProducer {
    async fn send(&self, message: ProducerMessage) -> MessagingResult<()> {
        let mut headers = OwnedHeaders::new();
        for header in &message.headers {
            let key = String::from_utf8_lossy(&header.key);
            headers = headers.insert(Header {
                key: key.as_ref(),
                value: Some(header.value.as_slice()),
            });
        }

        let mut record = FutureRecord::<[u8], [u8]>::to(&message.topic)
            .payload(message.payload.as_slice())
            .headers(headers);
        if let Some(ref key) = message.key {
            record = record.key(key.as_slice());
        }

        debug!(topic = %message.topic, "Publishing message to Kafka");

        self.producer
            .send(record, self.timeout)
            .await
            .map_err(|(e, _)| MessagingError::Publish(e.to_string()))?;

        Ok(())
    }
}

impl Consumer {
    /// Consumer joining `group_id` on the Kafka cluster at `addresses`.
    ///
    /// New groups start at the newest offset.
    pub fn connect<I, S>(
        addresses: I,
        group_id: impl Into<String>,
        obs: Arc<ObservabilityContext>,
    ) -> MessagingResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_config(&ConsumerConfig::new(addresses, group_id), obs)
    }

    /// Consumer built from a full configuration.
    pub fn from_config(
        config: &ConsumerConfig,
        obs: Arc<ObservabilityContext>,
    ) -> MessagingResult<Self> {
        let group = KafkaConsumerGroup::new(config)?;
        Ok(Consumer::new(Arc::new(group), obs).with_signal_handling(config.handle_signals))
    }
}
