//! Delivery of envelopes to the error-reporting backend

use super::dsn::Dsn;
use super::event::{Envelope, ReportEvent, TransactionEvent};
use crate::error::{TelemetryError, TelemetryResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;
use url::Url;

const ENVELOPE_CONTENT_TYPE: &str = "application/x-sentry-envelope";

/// Sends a single envelope.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    async fn send(&self, envelope: Envelope) -> TelemetryResult<()>;
}

/// HTTP transport posting envelopes to the DSN's envelope endpoint.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    dsn: Dsn,
    endpoint: Url,
    auth: String,
}

impl HttpTransport {
    /// Create a transport for `dsn`.
    pub fn new(dsn: &Dsn) -> TelemetryResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            dsn: dsn.clone(),
            endpoint: dsn.envelope_url()?,
            auth: dsn.auth_header(),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, envelope: Envelope) -> TelemetryResult<()> {
        let body = envelope
            .to_bytes(&self.dsn)
            .map_err(|e| TelemetryError::Transport(e.to_string()))?;

        self.client
            .post(self.endpoint.clone())
            .header("X-Sentry-Auth", &self.auth)
            .header(reqwest::header::CONTENT_TYPE, ENVELOPE_CONTENT_TYPE)
            .body(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Transport that keeps every envelope in memory.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    sent: Mutex<Vec<Envelope>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// All envelopes received so far
    pub fn envelopes(&self) -> Vec<Envelope> {
        self.sent.lock().clone()
    }

    /// Error events received so far
    pub fn events(&self) -> Vec<ReportEvent> {
        self.sent
            .lock()
            .iter()
            .filter_map(|e| match e {
                Envelope::Event(event) => Some(event.clone()),
                Envelope::Transaction(_) => None,
            })
            .collect()
    }

    /// Transactions received so far
    pub fn transactions(&self) -> Vec<TransactionEvent> {
        self.sent
            .lock()
            .iter()
            .filter_map(|e| match e {
                Envelope::Transaction(tx) => Some(tx.clone()),
                Envelope::Event(_) => None,
            })
            .collect()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, envelope: Envelope) -> TelemetryResult<()> {
        self.sent.lock().push(envelope);
        Ok(())
    }
}
