//! Message types and header carriers.
//!
//! Headers are an ordered list of byte pairs, as on the wire. Trace context
//! is read from and written to them through [`HeaderExtractor`] and
//! [`HeaderInjector`].

use chrono::{DateTime, Utc};
use opentelemetry::propagation::{Extractor, Injector};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single message header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordHeader {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl RecordHeader {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A message delivered to a consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerMessage {
    /// Source topic
    pub topic: String,
    /// Source partition
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
    /// Partition key
    pub key: Option<Vec<u8>>,
    /// Message body
    pub payload: Vec<u8>,
    /// Headers in wire order
    pub headers: Vec<RecordHeader>,
    /// Broker timestamp
    pub timestamp: Option<DateTime<Utc>>,
}

impl ConsumerMessage {
    /// Key as text, when present and valid UTF-8
    pub fn key_str(&self) -> Option<&str> {
        self.key.as_deref().and_then(|k| std::str::from_utf8(k).ok())
    }

    /// Payload as text, when valid UTF-8
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Deserialize the JSON payload.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.payload)
    }

    /// Value of the last header named `key`
    pub fn header(&self, key: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .rev()
            .find(|h| h.key == key.as_bytes())
            .map(|h| h.value.as_slice())
    }
}

/// A message to be sent by a producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProducerMessage {
    /// Destination topic
    pub topic: String,
    /// Partition key
    pub key: Option<Vec<u8>>,
    /// Message body
    pub payload: Vec<u8>,
    /// Headers in wire order
    pub headers: Vec<RecordHeader>,
}

impl ProducerMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            payload: payload.into(),
            headers: Vec::new(),
        }
    }

    /// Message with a JSON payload.
    pub fn json<T: Serialize>(topic: impl Into<String>, value: &T) -> serde_json::Result<Self> {
        Ok(Self::new(topic, serde_json::to_vec(value)?))
    }

    /// Set the partition key
    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Append a header
    pub fn with_header(mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.push(RecordHeader::new(key, value));
        self
    }
}

/// Read-only carrier over message headers.
///
/// Keys and values are decoded lossily; when a key repeats, the last value
/// wins.
#[derive(Debug, Clone, Default)]
pub struct HeaderExtractor {
    entries: HashMap<String, String>,
}

impl HeaderExtractor {
    pub fn new(headers: &[RecordHeader]) -> Self {
        let entries = headers
            .iter()
            .map(|h| {
                (
                    String::from_utf8_lossy(&h.key).into_owned(),
                    String::from_utf8_lossy(&h.value).into_owned(),
                )
            })
            .collect();
        Self { entries }
    }
}

impl Extractor for HeaderExtractor {
    fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }
}

/// Carrier appending to message headers.
#[derive(Debug)]
pub struct HeaderInjector<'a>(pub &'a mut Vec<RecordHeader>);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.push(RecordHeader::new(key, value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extractor_last_value_wins() {
        let headers = vec![
            RecordHeader::new("traceparent", "first"),
            RecordHeader::new("other", "x"),
            RecordHeader::new("traceparent", "second"),
        ];
        let extractor = HeaderExtractor::new(&headers);

        assert_eq!(extractor.get("traceparent"), Some("second"));
        assert_eq!(extractor.get("missing"), None);
        assert_eq!(extractor.keys().len(), 2);
    }

    #[test]
    fn test_extractor_lossy_bytes() {
        let headers = vec![RecordHeader::new("k", vec![0xff, b'a'])];
        let extractor = HeaderExtractor::new(&headers);

        assert_eq!(extractor.get("k"), Some("\u{fffd}a"));
    }

    #[test]
    fn test_injector_appends() {
        let mut message = ProducerMessage::new("orders", "{}").with_header("existing", "1");
        HeaderInjector(&mut message.headers).set("traceparent", "00-abc".to_string());

        assert_eq!(message.headers.len(), 2);
        assert_eq!(message.headers[0].key, b"existing");
        assert_eq!(message.headers[1].value, b"00-abc");
    }

    #[test]
    fn test_consumer_message_accessors() {
        let message = ConsumerMessage {
            topic: "orders".into(),
            partition: 0,
            offset: 4,
            key: Some(b"o-1".to_vec()),
            payload: br#"{"id":1}"#.to_vec(),
            headers: vec![RecordHeader::new("a", "1"), RecordHeader::new("a", "2")],
            timestamp: None,
        };

        assert_eq!(message.key_str(), Some("o-1"));
        assert_eq!(message.header("a"), Some(&b"2"[..]));
        let body: serde_json::Value = message.json().unwrap();
        assert_eq!(body["id"], 1);
    }
}
