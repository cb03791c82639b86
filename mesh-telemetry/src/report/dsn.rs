//! Error-reporting DSN parsing

use crate::error::{TelemetryError, TelemetryResult};
use std::fmt;
use std::str::FromStr;
use url::Url;

/// Parsed `{scheme}://{public_key}@{host}[:port]/[prefix/]{project_id}` DSN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dsn {
    scheme: String,
    public_key: String,
    host: String,
    port: Option<u16>,
    path_prefix: String,
    project_id: String,
}

impl Dsn {
    /// Parse a DSN string.
    pub fn parse(value: &str) -> TelemetryResult<Self> {
        let url = Url::parse(value)?;

        let scheme = url.scheme().to_string();
        if scheme != "http" && scheme != "https" {
            return Err(TelemetryError::Dsn(format!("unsupported scheme {scheme:?}")));
        }

        let public_key = url.username().to_string();
        if public_key.is_empty() {
            return Err(TelemetryError::Dsn("missing public key".to_string()));
        }

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| TelemetryError::Dsn("missing host".to_string()))?
            .to_string();

        let mut segments: Vec<&str> = url
            .path_segments()
            .map(|s| s.filter(|seg| !seg.is_empty()).collect())
            .unwrap_or_default();
        let project_id = segments
            .pop()
            .ok_or_else(|| TelemetryError::Dsn("missing project id".to_string()))?
            .to_string();
        let path_prefix = segments.iter().map(|s| format!("/{s}")).collect::<String>();

        Ok(Self {
            scheme,
            public_key,
            host,
            port: url.port(),
            path_prefix,
            project_id,
        })
    }

    /// Public key used to authenticate submissions.
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    /// Project the DSN points to.
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Host of the ingestion endpoint.
    pub fn host(&self) -> &str {
        &self.host
    }

    fn base(&self) -> String {
        match self.port {
            Some(port) => format!("{}://{}:{}", self.scheme, self.host, port),
            None => format!("{}://{}", self.scheme, self.host),
        }
    }

    /// Endpoint envelopes are POSTed to.
    pub fn envelope_url(&self) -> TelemetryResult<Url> {
        let url = format!(
            "{}{}/api/{}/envelope/",
            self.base(),
            self.path_prefix,
            self.project_id
        );
        Ok(Url::parse(&url)?)
    }

    /// Value of the `X-Sentry-Auth` header.
    pub fn auth_header(&self) -> String {
        format!(
            "Sentry sentry_version=7, sentry_client=mesh/{}, sentry_key={}",
            env!("CARGO_PKG_VERSION"),
            self.public_key
        )
    }
}

impl FromStr for Dsn {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Dsn::parse(s)
    }
}

impl fmt::Display for Dsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let base = self.base();
        let (scheme, rest) = base.split_once("://").unwrap_or((&self.scheme, &base));
        write!(
            f,
            "{}://{}@{}{}/{}",
            scheme, self.public_key, rest, self.path_prefix, self.project_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dsn() {
        let dsn = Dsn::parse("https://abc123@o42.ingest.example.com/1234").unwrap();

        assert_eq!(dsn.public_key(), "abc123");
        assert_eq!(dsn.host(), "o42.ingest.example.com");
        assert_eq!(dsn.project_id(), "1234");
        assert_eq!(
            dsn.envelope_url().unwrap().as_str(),
            "https://o42.ingest.example.com/api/1234/envelope/"
        );
    }

    #[test]
    fn test_parse_dsn_with_port_and_prefix() {
        let dsn = Dsn::parse("http://key@localhost:9000/sentry/7").unwrap();

        assert_eq!(
            dsn.envelope_url().unwrap().as_str(),
            "http://localhost:9000/sentry/api/7/envelope/"
        );
        assert_eq!(dsn.to_string(), "http://key@localhost:9000/sentry/7");
    }

    #[test]
    fn test_auth_header() {
        let dsn: Dsn = "https://abc123@example.com/1".parse().unwrap();
        let header = dsn.auth_header();

        assert!(header.starts_with("Sentry sentry_version=7"));
        assert!(header.ends_with("sentry_key=abc123"));
    }

    #[test]
    fn test_parse_dsn_errors() {
        assert!(Dsn::parse("not a url").is_err());
        assert!(Dsn::parse("https://example.com/1").is_err());
        assert!(Dsn::parse("https://key@example.com/").is_err());
        assert!(Dsn::parse("ftp://key@example.com/1").is_err());
    }
}
