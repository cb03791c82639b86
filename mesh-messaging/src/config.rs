//! Consumer and producer configuration.

use crate::error::{MessagingError, MessagingResult};
use rustls_pemfile::{certs, private_key};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Duration;

/// Where a group without a committed offset starts reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitialOffset {
    /// Only messages produced after joining
    #[default]
    Newest,
    /// From the start of the partition
    Oldest,
}

impl InitialOffset {
    /// Value of the `auto.offset.reset` client property.
    pub fn as_reset_policy(&self) -> &'static str {
        match self {
            InitialOffset::Newest => "latest",
            InitialOffset::Oldest => "earliest",
        }
    }
}

/// TLS configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Path to CA certificate bundle
    pub ca_cert: Option<String>,
    /// Path to client certificate file
    pub client_cert: Option<String>,
    /// Path to client key file
    pub client_key: Option<String>,
}

impl TlsConfig {
    /// Create a new TLS configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the CA certificate path
    pub fn with_ca_cert(mut self, path: impl Into<String>) -> Self {
        self.ca_cert = Some(path.into());
        self
    }

    /// Set client certificate and key paths
    pub fn with_client_cert(
        mut self,
        cert_path: impl Into<String>,
        key_path: impl Into<String>,
    ) -> Self {
        self.client_cert = Some(cert_path.into());
        self.client_key = Some(key_path.into());
        self
    }

    /// Check that every configured file exists and holds well-formed PEM.
    ///
    /// A certificate without its key (or the reverse) is rejected, as is a
    /// bundle with no certificate in it.
    pub fn validate(&self) -> MessagingResult<()> {
        if let Some(ref ca) = self.ca_cert {
            load_certs(Path::new(ca), "CA bundle")?;
        }

        match (&self.client_cert, &self.client_key) {
            (Some(cert), Some(key)) => {
                load_certs(Path::new(cert), "client certificate")?;
                load_private_key(Path::new(key))?;
            }
            (None, None) => {}
            _ => {
                return Err(MessagingError::Configuration(
                    "client certificate and key must be configured together".to_string(),
                ));
            }
        }

        Ok(())
    }
}

fn open(path: &Path, what: &str) -> MessagingResult<BufReader<File>> {
    File::open(path).map(BufReader::new).map_err(|e| {
        MessagingError::Configuration(format!("failed to open {what} {}: {e}", path.display()))
    })
}

fn load_certs(path: &Path, what: &str) -> MessagingResult<usize> {
    let mut reader = open(path, what)?;

    let parsed = certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            MessagingError::Configuration(format!("failed to parse {what} {}: {e}", path.display()))
        })?;

    if parsed.is_empty() {
        return Err(MessagingError::Configuration(format!(
            "no certificate found in {what} {}",
            path.display()
        )));
    }
    Ok(parsed.len())
}

fn load_private_key(path: &Path) -> MessagingResult<()> {
    let mut reader = open(path, "client key")?;

    private_key(&mut reader)
        .map_err(|e| {
            MessagingError::Configuration(format!(
                "failed to read client key {}: {e}",
                path.display()
            ))
        })?
        .map(|_| ())
        .ok_or_else(|| {
            MessagingError::Configuration(format!("no private key found in {}", path.display()))
        })
}

/// Consumer group configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Broker addresses
    pub brokers: Vec<String>,
    /// Consumer group ID
    pub group_id: String,
    /// Client ID
    pub client_id: Option<String>,
    /// Start position for partitions without a committed offset
    #[serde(default)]
    pub initial_offset: InitialOffset,
    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout")]
    pub session_timeout_ms: u32,
    /// TLS material
    pub tls: Option<TlsConfig>,
    /// Cancel consumption on SIGINT / SIGTERM
    #[serde(default = "default_true")]
    pub handle_signals: bool,
}

fn default_session_timeout() -> u32 {
    10_000
}

fn default_true() -> bool {
    true
}

impl ConsumerConfig {
    /// Create a new consumer configuration
    pub fn new<I, S>(brokers: I, group_id: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            brokers: brokers.into_iter().map(Into::into).collect(),
            group_id: group_id.into(),
            client_id: None,
            initial_offset: InitialOffset::default(),
            session_timeout_ms: default_session_timeout(),
            tls: None,
            handle_signals: true,
        }
    }

    /// Set the client ID
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Set where new groups start reading
    pub fn with_initial_offset(mut self, offset: InitialOffset) -> Self {
        self.initial_offset = offset;
        self
    }

    /// Set the session timeout
    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout_ms = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
        self
    }

    /// Use TLS
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Do not subscribe to process signals
    pub fn without_signal_handling(mut self) -> Self {
        self.handle_signals = false;
        self
    }

    /// Comma separated broker list
    pub fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }

    /// Validate the configuration, including TLS material.
    pub fn validate(&self) -> MessagingResult<()> {
        if self.brokers.iter().all(|b| b.trim().is_empty()) {
            return Err(MessagingError::Configuration(
                "at least one broker address is required".to_string(),
            ));
        }
        if self.group_id.trim().is_empty() {
            return Err(MessagingError::Configuration(
                "group id must not be empty".to_string(),
            ));
        }
        if let Some(ref tls) = self.tls {
            tls.validate()?;
        }
        Ok(())
    }
}

/// Producer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerConfig {
    /// Broker addresses
    pub brokers: Vec<String>,
    /// Client ID
    pub client_id: Option<String>,
    /// Delivery timeout in milliseconds
    #[serde(default = "default_send_timeout")]
    pub send_timeout_ms: u64,
    /// TLS material
    pub tls: Option<TlsConfig>,
}

fn default_send_timeout() -> u64 {
    5_000
}

impl ProducerConfig {
    /// Create a new producer configuration
    pub fn new<I, S>(brokers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            brokers: brokers.into_iter().map(Into::into).collect(),
            client_id: None,
            send_timeout_ms: default_send_timeout(),
            tls: None,
        }
    }

    /// Set the client ID
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Set the delivery timeout
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Use TLS
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Delivery timeout
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// Comma separated broker list
    pub fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }

    /// Validate the configuration, including TLS material.
    pub fn validate(&self) -> MessagingResult<()> {
        if self.brokers.iter().all(|b| b.trim().is_empty()) {
            return Err(MessagingError::Configuration(
                "at least one broker address is required".to_string(),
            ));
        }
        if let Some(ref tls) = self.tls {
            tls.validate()?;
        }
        Ok(())
    }
}
