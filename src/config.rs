use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::address::{DEFAULT_HOST, Endpoint};
use crate::error::ClientError;
use crate::query::QueryDefaults;

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_fetch_info() -> bool {
    true
}

/// Settings shared by every transport backend.
///
/// Only `port` is required; everything else has a default.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Host of the inference service, [`DEFAULT_HOST`] when omitted.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port of the inference service. Required.
    pub port: u16,
    /// Encoding and key used by single-argument image queries.
    #[serde(default)]
    pub defaults: QueryDefaults,
    /// Per-request deadline, for backends that support one.
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
    /// Whether the backend asks the service for model information on start.
    #[serde(default = "default_fetch_info")]
    pub fetch_info: bool,
}

impl ClientConfig {
    /// Configuration for `port` on [`DEFAULT_HOST`] with every default.
    pub fn new(port: u16) -> Self {
        Self {
            host: default_host(),
            port,
            defaults: QueryDefaults::default(),
            request_timeout_ms: None,
            fetch_info: default_fetch_info(),
        }
    }

    /// Overrides the host for this client.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Overrides the encoding used by single-argument image queries.
    pub fn with_defaults(mut self, defaults: QueryDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Sets a per-request deadline.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Enables or disables asking for model information on start.
    pub fn with_fetch_info(mut self, fetch_info: bool) -> Self {
        self.fetch_info = fetch_info;
        self
    }

    /// Parses a configuration document; only `port` is required.
    pub fn from_json(json: &str) -> Result<Self, ClientError> {
        Ok(serde_json::from_str(json)?)
    }

    /// The per-request deadline, if any.
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    /// Validates host and port into an [`Endpoint`].
    pub fn endpoint(&self) -> Result<Endpoint, ClientError> {
        Endpoint::new(&self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::ImageFormat;

    #[test]
    fn minimal_json_uses_defaults() {
        let config = ClientConfig::from_json(r#"{"port": 8000}"#).unwrap();
        assert_eq!(config, ClientConfig::new(8000));
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.defaults.format, ImageFormat::Jpeg);
        assert_eq!(config.defaults.key, "image");
        assert!(config.fetch_info);
        assert_eq!(config.request_timeout(), None);
    }

    #[test]
    fn full_json_overrides_everything() {
        let config = ClientConfig::from_json(
            r#"{
                "host": "localhost",
                "port": 57100,
                "defaults": {"format": "png", "key": "semantic_map"},
                "request_timeout_ms": 2500,
                "fetch_info": false
            }"#,
        )
        .unwrap();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.defaults.format, ImageFormat::Png);
        assert_eq!(config.defaults.key, "semantic_map");
        assert_eq!(config.request_timeout(), Some(Duration::from_millis(2500)));
        assert!(!config.fetch_info);
    }

    #[test]
    fn missing_port_is_an_error() {
        assert!(matches!(
            ClientConfig::from_json(r#"{"host": "10.0.0.2"}"#),
            Err(ClientError::Json(_))
        ));
    }

    #[test]
    fn endpoint_validates_port() {
        assert!(ClientConfig::new(0).endpoint().is_err());
        let endpoint = ClientConfig::new(8000).with_host("10.0.0.2").endpoint().unwrap();
        assert!(endpoint.host().is_ipv4());
    }
}
