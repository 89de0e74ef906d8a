//! Ambient configuration plumbing (not part of the core spec surface).
//!
//! Mirrors the teacher's own `pgcat.toml`-driven config: a plain struct
//! deriving `serde::Deserialize`, loaded from a TOML file by the CLI.
use serde_derive::Deserialize;
use std::path::Path;

use crate::endpoint::Endpoint;
use crate::errors::Error;

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    #[serde(deserialize_with = "deserialize_endpoint")]
    pub upstream: Endpoint,
    #[serde(deserialize_with = "deserialize_endpoint")]
    pub downstream: Endpoint,
    /// Per-session read buffer size in bytes. `None` defers to the event
    /// loop's own default (4096, matching `socket_forwarder.py`'s
    /// `BUFFER_SIZE`).
    #[serde(default)]
    pub buffer_size: Option<usize>,
}

fn deserialize_endpoint<'de, D>(deserializer: D) -> Result<Endpoint, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::Deserialize as _;
    let raw = String::deserialize(deserializer)?;
    Endpoint::parse(&raw).map_err(serde::de::Error::custom)
}

impl ProxyConfig {
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path)
            .map_err(Error::Io)?;
        toml::from_str(&contents)
            .map_err(|e| Error::MalformedEndpoint(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_toml() {
        let cfg: ProxyConfig = toml::from_str(
            r#"
            upstream = "127.0.0.1:5432"
            downstream = "0.0.0.0:6432"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.upstream, Endpoint::new("127.0.0.1", 5432));
        assert_eq!(cfg.downstream, Endpoint::new("0.0.0.0", 6432));
        assert_eq!(cfg.buffer_size, None);
    }

    #[test]
    fn parses_explicit_buffer_size() {
        let cfg: ProxyConfig = toml::from_str(
            r#"
            upstream = "127.0.0.1:5432"
            downstream = "0.0.0.0:6432"
            buffer_size = 8192
            "#,
        )
        .unwrap();
        assert_eq!(cfg.buffer_size, Some(8192));
    }

    #[test]
    fn rejects_malformed_endpoint() {
        let result: Result<ProxyConfig, _> = toml::from_str(
            r#"
            upstream = "not-an-endpoint"
            downstream = "0.0.0.0:6432"
            "#,
        );
        assert!(result.is_err());
    }
}
