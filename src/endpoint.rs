//! C1 — `Endpoint`: a `host:port` value type. See spec §3, §4.1, §6.3.
use std::fmt;
use std::net::SocketAddr;

use crate::errors::Error;

/// A host and port pair, parsed from `"<host>:<port>"`. The host is passed
/// verbatim to the socket layer; name resolution is the OS's concern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Endpoint {
            host: host.into(),
            port,
        }
    }

    /// Parse `"host:port"`. Fails with `MalformedEndpoint` when the colon is
    /// missing or the port is not a valid `u16`.
    ///
    /// Hosts containing colons (e.g. bare IPv6 literals) are rejected, since
    /// the split is on the *last* colon and the remainder must be numeric;
    /// bracketed IPv6 (`"[::1]:5432"`) splits correctly because the closing
    /// bracket precedes the final colon.
    pub fn parse(address: &str) -> Result<Self, Error> {
        let idx = address
            .rfind(':')
            .ok_or_else(|| Error::MalformedEndpoint(address.to_string()))?;
        let (host, port_str) = (&address[..idx], &address[idx + 1..]);
        if host.is_empty() {
            return Err(Error::MalformedEndpoint(address.to_string()));
        }
        let port: u16 = port_str
            .parse()
            .map_err(|_| Error::MalformedEndpoint(address.to_string()))?;
        Ok(Endpoint {
            host: host.to_string(),
            port,
        })
    }

    /// Resolve to the first matching `SocketAddr` (used to drive `connect`/`bind`).
    pub(crate) async fn to_socket_addr(&self) -> std::io::Result<SocketAddr> {
        use tokio::net::lookup_host;
        lookup_host((self.host.as_str(), self.port))
            .await?
            .next()
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotFound, "no address resolved")
            })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_and_port() {
        let e = Endpoint::parse("localhost:5432").unwrap();
        assert_eq!(e.host, "localhost");
        assert_eq!(e.port, 5432);
    }

    #[test]
    fn roundtrips_through_display() {
        let e = Endpoint::new("127.0.0.1", 54321);
        let s = e.to_string();
        assert_eq!(Endpoint::parse(&s).unwrap(), e);
    }

    #[test]
    fn rejects_missing_colon() {
        assert!(matches!(
            Endpoint::parse("localhost"),
            Err(Error::MalformedEndpoint(_))
        ));
    }

    #[test]
    fn rejects_non_numeric_port() {
        assert!(matches!(
            Endpoint::parse("localhost:abc"),
            Err(Error::MalformedEndpoint(_))
        ));
    }

    #[test]
    fn rejects_out_of_range_port() {
        assert!(matches!(
            Endpoint::parse("localhost:99999"),
            Err(Error::MalformedEndpoint(_))
        ));
    }

    #[test]
    fn equality_is_structural() {
        assert_eq!(Endpoint::new("a", 1), Endpoint::new("a", 1));
        assert_ne!(Endpoint::new("a", 1), Endpoint::new("a", 2));
    }
}
