//! Traits at the broker and handler seams.
//!
//! The consumer runtime only sees these traits: a [`ConsumerGroup`] owns group
//! membership and offsets, hands a [`ConsumerSession`] and one or more
//! [`Claim`]s to a [`SessionHandler`], and the runtime's session handler calls
//! the user's [`MessageHandler`] for each message.

use crate::error::MessagingResult;
use crate::message::{ConsumerMessage, ProducerMessage};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use opentelemetry::Context;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Error returned by message handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Stream of messages for one claim.
pub type MessageStream<'a> = BoxStream<'a, ConsumerMessage>;

/// A topic partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.partition)
    }
}

/// Messages from a set of assigned partitions.
///
/// The stream ends when the session ends (rebalance, cancellation or close).
pub struct Claim<'a> {
    /// Partitions feeding this claim
    pub partitions: Vec<TopicPartition>,
    /// Delivered messages
    pub messages: MessageStream<'a>,
}

impl fmt::Debug for Claim<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Claim")
            .field("partitions", &self.partitions)
            .finish_non_exhaustive()
    }
}

/// A live binding to the partitions assigned in one group generation.
pub trait ConsumerSession: Send + Sync {
    /// Assigned partitions per topic
    fn claims(&self) -> BTreeMap<String, Vec<i32>>;

    /// Mark `message` as processed; its offset is committed by the group.
    fn mark_message(&self, message: &ConsumerMessage) -> MessagingResult<()>;
}

/// Callbacks driven by a [`ConsumerGroup`] for each session.
#[async_trait]
pub trait SessionHandler: Send + Sync {
    /// Called once the session is established, before any claim is consumed.
    async fn setup(&self, session: &dyn ConsumerSession) -> MessagingResult<()>;

    /// Called after every claim of the session has finished.
    async fn cleanup(&self, session: &dyn ConsumerSession) -> MessagingResult<()>;

    /// Consume one claim until its stream ends.
    async fn consume_claim(
        &self,
        session: &dyn ConsumerSession,
        claim: Claim<'_>,
    ) -> MessagingResult<()>;
}

/// Broker-side consumer group membership.
///
/// Group coordination, rebalancing and offset storage live behind this
/// trait.
#[async_trait]
pub trait ConsumerGroup: Send + Sync + fmt::Debug {
    /// Join the group for `topics` and run one session with `handler`.
    ///
    /// Returns `Ok(())` when the session ends through a rebalance or because
    /// `cancel` fired, and [`MessagingError::GroupClosed`] once the group has
    /// been closed.
    ///
    /// [`MessagingError::GroupClosed`]: crate::MessagingError::GroupClosed
    async fn consume(
        &self,
        cancel: &CancellationToken,
        topics: &[String],
        handler: &dyn SessionHandler,
    ) -> MessagingResult<()>;

    /// Leave the group and release the connection.
    async fn close(&self) -> MessagingResult<()>;
}

/// User code processing consumed messages.
///
/// `cx` carries the consumer span, itself a child of the trace found in the
/// message headers. The same context is current while `process` runs.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn process(&self, cx: &Context, message: &ConsumerMessage) -> Result<(), HandlerError>;
}

/// [`MessageHandler`] backed by an async closure.
pub struct FnHandler<F> {
    f: F,
}

/// Wrap `f` as a [`MessageHandler`].
///
/// ```
/// use mesh_messaging::{HandlerError, handler_fn};
///
/// let handler = handler_fn(|_cx, message| async move {
///     println!("{} bytes from {}", message.payload.len(), message.topic);
///     Ok::<_, HandlerError>(())
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Context, ConsumerMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Context, ConsumerMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn process(&self, cx: &Context, message: &ConsumerMessage) -> Result<(), HandlerError> {
        (self.f)(cx.clone(), message.clone()).await
    }
}

impl<F> fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHandler").finish_non_exhaustive()
    }
}

/// Sends messages to a broker.
#[async_trait]
pub trait Producer: Send + Sync + fmt::Debug {
    /// Send `message`, resolving once the broker acknowledged it.
    async fn send(&self, message: ProducerMessage) -> MessagingResult<()>;
}
