//! Traced consumer-group runtime.
//!
//! A [`Consumer`] drives a [`ConsumerGroup`] on one dedicated task:
//!
//! ```text
//! Idle ──consume──▶ Consuming ──cancel / interrupt──▶ ShuttingDown ──▶ Closed
//!                       │
//!                       └──session error──▶ Failed ──▶ Closed
//! ```
//!
//! Each delivered message is processed inside a `"consume message"` span
//! continuing the trace found in its headers, then marked regardless of the
//! handler outcome. Handler errors and panics end up on the span and in the
//! log; they never stop the session.

use crate::error::{MessagingError, MessagingResult};
use crate::message::{ConsumerMessage, HeaderExtractor};
use crate::traits::{
    Claim, ConsumerGroup, ConsumerSession, HandlerError, MessageHandler, SessionHandler,
};
use async_trait::async_trait;
use futures_util::FutureExt;
use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use mesh_telemetry::ObservabilityContext;
use opentelemetry::context::FutureExt as _;
use opentelemetry::trace::{SpanKind, Status, TraceContextExt, Tracer};
use opentelemetry::{Context, KeyValue};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Name of the span opened for every consumed message.
pub const CONSUME_SPAN_NAME: &str = "consume message";

/// Lifecycle of a [`Consumer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Constructed, not consuming yet
    Idle,
    /// Join loop running
    Consuming,
    /// Cancellation observed, leaving the loop
    ShuttingDown,
    /// The group returned a fatal error
    Failed,
    /// Group connection released
    Closed,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsumerState::Idle => "idle",
            ConsumerState::Consuming => "consuming",
            ConsumerState::ShuttingDown => "shutting down",
            ConsumerState::Failed => "failed",
            ConsumerState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Why processing a message failed.
#[derive(Debug, Error)]
pub enum Fault {
    /// The handler returned an error
    #[error("{0}")]
    Handler(HandlerError),
    /// The handler panicked
    #[error("panic: {0}")]
    Panic(String),
}

impl Fault {
    /// Status description recorded on the span.
    pub fn status_message(&self) -> String {
        match self {
            Fault::Handler(err) => err.to_string(),
            Fault::Panic(_) => "panic".to_string(),
        }
    }

    /// Error recorded on the span and logged.
    fn as_error(&self) -> &(dyn std::error::Error + 'static) {
        match self {
            Fault::Handler(err) => err.as_ref(),
            Fault::Panic(_) => self,
        }
    }

    /// Whether the handler panicked.
    pub fn is_panic(&self) -> bool {
        matches!(self, Fault::Panic(_))
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Open the consumer span for `message`.
///
/// The parent is whatever trace context `message` carries in its headers,
/// layered over `parent`. Without one the span starts a new trace. The
/// returned context holds the span; end it with `cx.span().end()`.
pub fn start_consumer_span(
    obs: &ObservabilityContext,
    parent: &Context,
    message: &ConsumerMessage,
) -> Context {
    let parent = obs.extract_with(parent, &HeaderExtractor::new(&message.headers));

    let span = obs
        .tracer()
        .span_builder(CONSUME_SPAN_NAME)
        .with_kind(SpanKind::Consumer)
        .with_attributes([
            KeyValue::new("kafka.topic", message.topic.clone()),
            KeyValue::new("kafka.partition", i64::from(message.partition)),
            KeyValue::new("kafka.offset", message.offset),
        ])
        .start_with_context(obs.tracer(), &parent);

    parent.with_span(span)
}

/// Session handler wiring tracing and panic containment around the user's
/// [`MessageHandler`].
pub(crate) struct TracedSessionHandler {
    obs: Arc<ObservabilityContext>,
    handler: Arc<dyn MessageHandler>,
}

impl TracedSessionHandler {
    pub(crate) fn new(obs: Arc<ObservabilityContext>, handler: Arc<dyn MessageHandler>) -> Self {
        Self { obs, handler }
    }

    /// Run the handler for one message inside its span.
    pub(crate) async fn process_message(&self, message: &ConsumerMessage) -> Result<(), Fault> {
        let cx = start_consumer_span(&self.obs, &Context::new(), message);

        let call = self.handler.process(&cx, message).with_context(cx.clone());
        let outcome = match AssertUnwindSafe(call).catch_unwind().await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(Fault::Handler(err)),
            Err(payload) => Err(Fault::Panic(panic_message(payload))),
        };

        let span = cx.span();
        match &outcome {
            Ok(()) => span.set_status(Status::Ok),
            Err(fault) => {
                span.record_error(fault.as_error());
                span.set_status(Status::error(fault.status_message()));

                let _attached = cx.clone().attach();
                error!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    panic = fault.is_panic(),
                    error = fault.as_error(),
                    "Failed to process message"
                );
            }
        }
        span.end();

        outcome
    }
}

#[async_trait]
impl SessionHandler for TracedSessionHandler {
    async fn setup(&self, session: &dyn ConsumerSession) -> MessagingResult<()> {
        let claims = session.claims();
        info!(assigned_topics = ?claims, "Assigning topics");
        Ok(())
    }

    async fn cleanup(&self, _session: &dyn ConsumerSession) -> MessagingResult<()> {
        info!("Cleaning up consumer");
        Ok(())
    }

    async fn consume_claim(
        &self,
        session: &dyn ConsumerSession,
        mut claim: Claim<'_>,
    ) -> MessagingResult<()> {
        while let Some(message) = claim.messages.next().await {
            let outcome = self.process_message(&message).await;
            debug!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                failed = outcome.is_err(),
                "Message processed"
            );

            if let Err(err) = session.mark_message(&message) {
                warn!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    error = %err,
                    "Failed to mark message"
                );
            }
        }
        Ok(())
    }
}

/// Consumer-group runtime.
///
/// # Example
///
/// ```
/// use mesh_messaging::{Consumer, InMemoryBroker, handler_fn, HandlerError};
/// use mesh_telemetry::ObservabilityContext;
/// use std::sync::Arc;
/// use tokio_util::sync::CancellationToken;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = InMemoryBroker::new();
/// let consumer = Consumer::new(
///     Arc::new(broker.group("billing")),
///     Arc::new(ObservabilityContext::disabled()),
/// )
/// .with_signal_handling(false);
///
/// let cancel = CancellationToken::new();
/// cancel.cancel();
/// consumer
///     .consume(&cancel, ["orders"], Arc::new(handler_fn(|_cx, _msg| async {
///         Ok::<_, HandlerError>(())
///     })))
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct Consumer {
    lifecycle: Arc<Lifecycle>,
    obs: Arc<ObservabilityContext>,
    handle_signals: bool,
    shutdown_signal: Mutex<Option<BoxFuture<'static, ()>>>,
}

/// Group and state shared with the worker task.
struct Lifecycle {
    group: Arc<dyn ConsumerGroup>,
    state: Mutex<ConsumerState>,
    closed: AtomicBool,
}

impl Lifecycle {
    fn set_state(&self, state: ConsumerState) {
        *self.state.lock() = state;
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Err(err) = self.group.close().await {
            warn!(error = %err, "Failed to close consumer group");
        }
        self.set_state(ConsumerState::Closed);
        debug!("Consumer closed");
    }
}

impl Consumer {
    /// Consumer over `group`, creating spans with `obs`.
    ///
    /// SIGINT and SIGTERM stop consumption unless disabled with
    /// [`with_signal_handling`](Self::with_signal_handling).
    pub fn new(group: Arc<dyn ConsumerGroup>, obs: Arc<ObservabilityContext>) -> Self {
        Self {
            lifecycle: Arc::new(Lifecycle {
                group,
                state: Mutex::new(ConsumerState::Idle),
                closed: AtomicBool::new(false),
            }),
            obs,
            handle_signals: true,
            shutdown_signal: Mutex::new(None),
        }
    }

    /// Enable or disable stopping on process signals.
    pub fn with_signal_handling(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    /// Stop consumption when `signal` resolves, in place of process signals.
    pub fn with_shutdown_signal<F>(self, signal: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        *self.shutdown_signal.lock() = Some(Box::pin(signal));
        self
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConsumerState {
        *self.lifecycle.state.lock()
    }

    /// Observability context used for spans
    pub fn observability(&self) -> &Arc<ObservabilityContext> {
        &self.obs
    }

    /// Consume `topics` with `handler` until `cancel` fires, an interrupt
    /// arrives or the group fails.
    ///
    /// Cancellation and a closed group are a clean exit. Handler failures
    /// never end consumption. The group is closed before this returns, or by
    /// the worker when this future is dropped, so a consumer can only
    /// consume once. An empty topic list is rejected and leaves the consumer
    /// idle.
    pub async fn consume<I, S>(
        &self,
        cancel: &CancellationToken,
        topics: I,
        handler: Arc<dyn MessageHandler>,
    ) -> MessagingResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let topics: Vec<String> = topics.into_iter().map(Into::into).collect();
        if topics.is_empty() {
            return Err(MessagingError::Configuration(
                "no topics to consume".to_string(),
            ));
        }

        {
            let mut state = self.lifecycle.state.lock();
            if *state != ConsumerState::Idle {
                return Err(MessagingError::InvalidState(format!(
                    "consume called while {}",
                    *state
                )));
            }
            *state = ConsumerState::Consuming;
        }

        let token = cancel.child_token();
        // Dropping the caller's future stops the worker too.
        let _stop_worker = token.clone().drop_guard();
        let signal_task = self.spawn_signal_listener(&token);

        info!(topics = ?topics, "Starting consumer");

        let lifecycle = self.lifecycle.clone();
        let handler = TracedSessionHandler::new(self.obs.clone(), handler);
        let worker_token = token.clone();
        let worker = tokio::spawn(async move {
            let result = run_sessions(&lifecycle, &worker_token, topics, handler).await;
            lifecycle.close().await;
            result
        });

        let result = match worker.await {
            Ok(result) => result,
            Err(err) => {
                self.lifecycle.set_state(ConsumerState::Failed);
                Err(MessagingError::Other(format!("consumer task failed: {err}")))
            }
        };

        token.cancel();
        if let Some(task) = signal_task {
            task.abort();
        }

        // No-op unless the worker died before closing.
        self.close().await;
        result
    }

    /// Release the group connection. Only the first call reaches the group.
    pub async fn close(&self) {
        self.lifecycle.close().await;
    }

    fn spawn_signal_listener(&self, token: &CancellationToken) -> Option<JoinHandle<()>> {
        let signal: BoxFuture<'static, ()> = match self.shutdown_signal.lock().take() {
            Some(signal) => signal,
            None if self.handle_signals => Box::pin(process_signal()),
            None => return None,
        };

        let token = token.clone();
        Some(tokio::spawn(async move {
            tokio::select! {
                _ = signal => {
                    info!("Interrupt received, stopping consumer");
                    token.cancel();
                }
                _ = token.cancelled() => {}
            }
        }))
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("group", &self.lifecycle.group)
            .field("state", &self.state())
            .field("handle_signals", &self.handle_signals)
            .finish_non_exhaustive()
    }
}

/// Join loop run on the worker task.
async fn run_sessions(
    lifecycle: &Lifecycle,
    token: &CancellationToken,
    topics: Vec<String>,
    handler: TracedSessionHandler,
) -> MessagingResult<()> {
    loop {
        match lifecycle.group.consume(token, &topics, &handler).await {
            Ok(()) => {}
            Err(err) if err.is_group_closed() => {
                debug!("Consumer group closed");
                lifecycle.set_state(ConsumerState::ShuttingDown);
                return Ok(());
            }
            Err(err) => {
                error!(error = %err, "Consumer group session failed");
                lifecycle.set_state(ConsumerState::Failed);
                return Err(err);
            }
        }

        if token.is_cancelled() {
            info!("Stopping consumer");
            lifecycle.set_state(ConsumerState::ShuttingDown);
            return Ok(());
        }

        debug!("Rejoining consumer group");
    }
}

#[cfg(unix)]
async fn process_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
    ) {
        (Ok(mut sigint), Ok(mut sigterm)) => {
            tokio::select! {
                _ = sigint.recv() => debug!("Received SIGINT"),
                _ = sigterm.recv() => debug!("Received SIGTERM"),
            }
        }
        (Err(err), _) | (_, Err(err)) => {
            warn!(error = %err, "Failed to install signal handlers");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn process_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "Failed to install signal handler");
        std::future::pending::<()>().await;
    }
}
