//! Asynchronous error-reporting client
//!
//! Captures are non-blocking: envelopes go into a bounded queue drained by a
//! background task. When the queue is full the envelope is dropped and
//! counted. [`ReportingClient::flush`] waits until everything queued before
//! the call has been handed to the transport.

use super::dsn::Dsn;
use super::event::{Envelope, ReportEvent, TransactionEvent};
use super::transport::{HttpTransport, Transport};
use crate::error::TelemetryResult;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Destination for escalated log records and finished transactions.
pub trait Reporter: Send + Sync + fmt::Debug {
    /// Submit an error event. Must not block.
    fn capture_event(&self, event: ReportEvent);

    /// Submit a finished transaction. Must not block.
    fn capture_transaction(&self, transaction: TransactionEvent) {
        let _ = transaction;
    }
}

/// Fields stamped onto every envelope.
#[derive(Debug, Clone, Default)]
pub struct ReportingOptions {
    pub service: String,
    pub release: Option<String>,
    pub environment: Option<String>,
    pub queue_capacity: usize,
}

enum Command {
    Send(Envelope),
    Flush(oneshot::Sender<()>),
}

/// Queue-backed [`Reporter`].
pub struct ReportingClient {
    tx: mpsc::Sender<Command>,
    options: ReportingOptions,
    dropped: AtomicU64,
}

impl fmt::Debug for ReportingClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReportingClient")
            .field("options", &self.options)
            .field("dropped", &self.dropped.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ReportingClient {
    /// Start a client over `transport`. Must be called inside a Tokio runtime.
    pub fn new(options: ReportingOptions, transport: Arc<dyn Transport>) -> Self {
        let (tx, rx) = mpsc::channel(options.queue_capacity.max(1));
        tokio::spawn(run_worker(rx, transport));

        Self {
            tx,
            options,
            dropped: AtomicU64::new(0),
        }
    }

    /// Start a client posting to `dsn` over HTTP.
    pub fn from_dsn(dsn: &Dsn, options: ReportingOptions) -> TelemetryResult<Self> {
        let transport = HttpTransport::new(dsn)?;
        Ok(Self::new(options, Arc::new(transport)))
    }

    /// Envelopes discarded because the queue was full or closed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Wait until every envelope queued before this call was sent.
    ///
    /// Returns false if `timeout` elapsed first.
    pub async fn flush(&self, timeout: Duration) -> bool {
        let (ack_tx, ack_rx) = oneshot::channel();
        let wait = async {
            self.tx.send(Command::Flush(ack_tx)).await.ok()?;
            ack_rx.await.ok()
        };

        matches!(tokio::time::timeout(timeout, wait).await, Ok(Some(())))
    }

    fn enqueue(&self, envelope: Envelope) {
        if self.tx.try_send(Command::Send(envelope)).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn stamp(
        &self,
        release: &mut Option<String>,
        environment: &mut Option<String>,
        tags: &mut std::collections::BTreeMap<String, String>,
    ) {
        if release.is_none() {
            release.clone_from(&self.options.release);
        }
        if environment.is_none() {
            environment.clone_from(&self.options.environment);
        }
        if !self.options.service.is_empty() {
            tags.entry("service".to_string())
                .or_insert_with(|| self.options.service.clone());
        }
    }
}

impl Reporter for ReportingClient {
    fn capture_event(&self, mut event: ReportEvent) {
        self.stamp(&mut event.release, &mut event.environment, &mut event.tags);
        self.enqueue(Envelope::Event(event));
    }

    fn capture_transaction(&self, mut transaction: TransactionEvent) {
        self.stamp(
            &mut transaction.release,
            &mut transaction.environment,
            &mut transaction.tags,
        );
        self.enqueue(Envelope::Transaction(transaction));
    }
}

async fn run_worker(mut rx: mpsc::Receiver<Command>, transport: Arc<dyn Transport>) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Send(envelope) => {
                // Logged below warn so delivery failures are never re-reported.
                if let Err(err) = transport.send(envelope).await {
                    debug!(error = %err, "Failed to deliver error report");
                }
            }
            Command::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::event::ReportLevel;
    use crate::report::transport::MemoryTransport;

    fn options() -> ReportingOptions {
        ReportingOptions {
            service: "orders".to_string(),
            release: Some("1.4.0".to_string()),
            environment: Some("prod".to_string()),
            queue_capacity: 16,
        }
    }

    #[tokio::test]
    async fn test_capture_and_flush() {
        let transport = Arc::new(MemoryTransport::new());
        let client = ReportingClient::new(options(), transport.clone());

        client.capture_event(ReportEvent::new(ReportLevel::Error, "payment declined"));
        assert!(client.flush(Duration::from_secs(1)).await);

        let events = transport.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, "payment declined");
        assert_eq!(events[0].release.as_deref(), Some("1.4.0"));
        assert_eq!(events[0].environment.as_deref(), Some("prod"));
        assert_eq!(events[0].tags.get("service").map(String::as_str), Some("orders"));
    }

    #[tokio::test]
    async fn test_full_queue_drops() {
        #[derive(Debug)]
        struct Stalled;

        #[async_trait::async_trait]
        impl Transport for Stalled {
            async fn send(&self, _envelope: Envelope) -> TelemetryResult<()> {
                std::future::pending::<()>().await;
                Ok(())
            }
        }

        let client = ReportingClient::new(
            ReportingOptions {
                queue_capacity: 1,
                ..options()
            },
            Arc::new(Stalled),
        );

        for i in 0..10 {
            client.capture_event(ReportEvent::new(ReportLevel::Warning, format!("w{i}")));
        }

        assert!(client.dropped() >= 8);
        assert!(!client.flush(Duration::from_millis(50)).await);
    }
}
