//! In-memory broker for tests and local runs.
//!
//! [`InMemoryBroker`] stores partitions as vectors (the offset is the index)
//! and implements [`Producer`]. [`InMemoryGroup`] implements
//! [`ConsumerGroup`] on top of it, with one claim per assigned partition,
//! committed offsets per group, and hooks to inject join failures and
//! rebalances. It records every marked offset, join and close so tests can
//! assert on them.

use crate::config::InitialOffset;
use crate::error::{MessagingError, MessagingResult};
use crate::message::{ConsumerMessage, ProducerMessage};
use crate::traits::{
    Claim, ConsumerGroup, ConsumerSession, MessageStream, Producer, SessionHandler, TopicPartition,
};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use futures_util::future::try_join_all;
use futures_util::stream;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// An offset marked by a consumer session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkedOffset {
    pub group: String,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, Vec<Vec<ConsumerMessage>>>,
    /// Next offset to read, per (group, topic, partition)
    committed: HashMap<(String, String, i32), i64>,
    marked: Vec<MarkedOffset>,
    round_robin: usize,
}

impl BrokerState {
    fn partitions_mut(&mut self, topic: &str, count: i32) -> &mut Vec<Vec<ConsumerMessage>> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); count.max(1) as usize])
    }

    fn message_at(&self, tp: &TopicPartition, offset: i64) -> Option<ConsumerMessage> {
        let index = usize::try_from(offset).ok()?;
        self.topics
            .get(&tp.topic)?
            .get(usize::try_from(tp.partition).ok()?)?
            .get(index)
            .cloned()
    }
}

struct Shared {
    state: Mutex<BrokerState>,
    partitions: i32,
    /// Bumped on every publish to wake waiting claims
    version: watch::Sender<u64>,
}

/// Shared in-memory broker. Clones refer to the same data.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    /// Broker whose topics have a single partition.
    pub fn new() -> Self {
        Self::with_partitions(1)
    }

    /// Broker whose topics have `partitions` partitions.
    pub fn with_partitions(partitions: i32) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::default()),
                partitions: partitions.max(1),
                version,
            }),
        }
    }

    /// Consumer group `group_id` on this broker.
    pub fn group(&self, group_id: impl Into<String>) -> InMemoryGroup {
        InMemoryGroup {
            broker: self.clone(),
            group_id: group_id.into(),
            initial_offset: InitialOffset::default(),
            state: Mutex::new(GroupState::default()),
        }
    }

    /// Append `message`, returning its partition and offset.
    ///
    /// Keyed messages always land on the same partition; unkeyed ones are
    /// spread round-robin.
    pub fn publish(&self, message: ProducerMessage) -> TopicPartitionOffset {
        let count = self.shared.partitions;
        let delivered = {
            let mut state = self.shared.state.lock();
            let partition = match message.key {
                Some(ref key) => key_partition(key, count),
                None => {
                    state.round_robin = state.round_robin.wrapping_add(1);
                    (state.round_robin % count as usize) as i32
                }
            };

            let log = &mut state.partitions_mut(&message.topic, count)[partition as usize];
            let offset = log.len() as i64;
            log.push(ConsumerMessage {
                topic: message.topic.clone(),
                partition,
                offset,
                key: message.key,
                payload: message.payload,
                headers: message.headers,
                timestamp: Some(Utc::now()),
            });

            TopicPartitionOffset {
                topic: message.topic,
                partition,
                offset,
            }
        };

        self.shared.version.send_modify(|v| *v = v.wrapping_add(1));
        delivered
    }

    /// Every message of `topic`, partition by partition.
    pub fn messages(&self, topic: &str) -> Vec<ConsumerMessage> {
        let state = self.shared.state.lock();
        state
            .topics
            .get(topic)
            .map(|partitions| partitions.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Offsets marked so far, in marking order.
    pub fn marked(&self) -> Vec<MarkedOffset> {
        self.shared.state.lock().marked.clone()
    }

    /// Next offset `group` reads from `topic`/`partition`, once committed.
    pub fn committed(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.shared
            .state
            .lock()
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
    }

    /// Assign every partition of `topics` and resolve start offsets.
    fn assign(
        &self,
        group: &str,
        topics: &[String],
        initial: InitialOffset,
    ) -> Vec<(TopicPartition, i64)> {
        let count = self.shared.partitions;
        let mut state = self.shared.state.lock();
        let mut assignment = Vec::new();

        for topic in topics {
            let ends: Vec<i64> = state
                .partitions_mut(topic, count)
                .iter()
                .map(|log| log.len() as i64)
                .collect();

            for (partition, end) in ends.into_iter().enumerate() {
                let partition = partition as i32;
                let key = (group.to_string(), topic.clone(), partition);
                let start = state.committed.get(&key).copied().unwrap_or(match initial {
                    InitialOffset::Newest => end,
                    InitialOffset::Oldest => 0,
                });
                assignment.push((TopicPartition::new(topic.clone(), partition), start));
            }
        }

        assignment
    }

    /// Messages of `tp` from `start` on, until `token` is cancelled.
    fn stream(&self, tp: TopicPartition, start: i64, token: CancellationToken) -> MessageStream<'static> {
        let shared = self.shared.clone();
        let changes = shared.version.subscribe();

        stream::unfold(
            (shared, changes, start),
            move |(shared, mut changes, next)| {
                let tp = tp.clone();
                let token = token.clone();
                async move {
                    loop {
                        if token.is_cancelled() {
                            return None;
                        }

                        let found = shared.state.lock().message_at(&tp, next);
                        if let Some(message) = found {
                            return Some((message, (shared, changes, next + 1)));
                        }

                        tokio::select! {
                            _ = token.cancelled() => return None,
                            changed = changes.changed() => {
                                if changed.is_err() {
                                    return None;
                                }
                            }
                        }
                    }
                }
            },
        )
        .boxed()
    }

    fn mark(&self, group: &str, message: &ConsumerMessage) {
        let mut state = self.shared.state.lock();
        let key = (group.to_string(), message.topic.clone(), message.partition);
        let next = state.committed.entry(key).or_insert(0);
        *next = (*next).max(message.offset + 1);

        state.marked.push(MarkedOffset {
            group: group.to_string(),
            topic: message.topic.clone(),
            partition: message.partition,
            offset: message.offset,
        });
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryBroker")
            .field("partitions", &self.shared.partitions)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Producer for InMemoryBroker {
    async fn send(&self, message: ProducerMessage) -> MessagingResult<()> {
        self.publish(message);
        Ok(())
    }
}

/// Where a published message landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPartitionOffset {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

fn key_partition(key: &[u8], partitions: i32) -> i32 {
    // FNV-1a
    let hash = key.iter().fold(0xcbf2_9ce4_8422_2325u64, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(0x0100_0000_01b3)
    });
    (hash % partitions as u64) as i32
}

#[derive(Default)]
struct GroupState {
    joins: usize,
    close_calls: usize,
    closed: bool,
    failures: VecDeque<MessagingError>,
    sessions: Vec<CancellationToken>,
}

/// Consumer group on an [`InMemoryBroker`].
pub struct InMemoryGroup {
    broker: InMemoryBroker,
    group_id: String,
    initial_offset: InitialOffset,
    state: Mutex<GroupState>,
}

impl InMemoryGroup {
    /// Where the group starts on partitions without a committed offset.
    pub fn with_initial_offset(mut self, offset: InitialOffset) -> Self {
        self.initial_offset = offset;
        self
    }

    /// Group ID
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Make the next join attempt fail with `err`.
    pub fn fail_next_join(&self, err: MessagingError) {
        self.state.lock().failures.push_back(err);
    }

    /// End every live session, as a partition rebalance would.
    pub fn rebalance(&self) {
        for session in self.state.lock().sessions.drain(..) {
            session.cancel();
        }
    }

    /// Number of sessions started
    pub fn joins(&self) -> usize {
        self.state.lock().joins
    }

    /// Number of times `close` was called
    pub fn close_calls(&self) -> usize {
        self.state.lock().close_calls
    }

    /// Whether the group has been closed
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl fmt::Debug for InMemoryGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryGroup")
            .field("group_id", &self.group_id)
            .field("initial_offset", &self.initial_offset)
            .finish_non_exhaustive()
    }
}

struct MemorySession<'a> {
    broker: &'a InMemoryBroker,
    group_id: &'a str,
    claims: BTreeMap<String, Vec<i32>>,
}

impl ConsumerSession for MemorySession<'_> {
    fn claims(&self) -> BTreeMap<String, Vec<i32>> {
        self.claims.clone()
    }

    fn mark_message(&self, message: &ConsumerMessage) -> MessagingResult<()> {
        self.broker.mark(self.group_id, message);
        Ok(())
    }
}

#[async_trait]
impl ConsumerGroup for InMemoryGroup {
    async fn consume(
        &self,
        cancel: &CancellationToken,
        topics: &[String],
        handler: &dyn SessionHandler,
    ) -> MessagingResult<()> {
        let session_token = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(MessagingError::GroupClosed);
            }
            if let Some(err) = state.failures.pop_front() {
                return Err(err);
            }
            state.joins += 1;
            state.sessions.retain(|t| !t.is_cancelled());

            let token = cancel.child_token();
            state.sessions.push(token.clone());
            token
        };

        let assignment = self
            .broker
            .assign(&self.group_id, topics, self.initial_offset);
        let mut claims: BTreeMap<String, Vec<i32>> = BTreeMap::new();
        for (tp, _) in &assignment {
            claims.entry(tp.topic.clone()).or_default().push(tp.partition);
        }
        debug!(group = %self.group_id, claims = ?claims, "Joined in-memory group");

        let session = MemorySession {
            broker: &self.broker,
            group_id: &self.group_id,
            claims,
        };

        handler.setup(&session).await?;

        let claims = assignment.into_iter().map(|(tp, start)| {
            let claim = Claim {
                partitions: vec![tp.clone()],
                messages: self.broker.stream(tp, start, session_token.clone()),
            };
            handler.consume_claim(&session, claim)
        });
        let consumed = try_join_all(claims).await.map(|_| ());
        // Stop sibling claims when one fails.
        session_token.cancel();

        let cleaned = handler.cleanup(&session).await;
        consumed.and(cleaned)
    }

    async fn close(&self) -> MessagingResult<()> {
        let mut state = self.state.lock();
        state.close_calls += 1;
        state.closed = true;
        for session in state.sessions.drain(..) {
            session.cancel();
        }
        Ok(())
    }
}
