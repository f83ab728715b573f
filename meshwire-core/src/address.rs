//! Node addressing.
//!
//! An [`Address`] is the `host:port` identity of a node. Hosts are kept as
//! strings so unresolved names (`localhost`, DNS names) can be used as
//! destinations; resolution happens when a connection is opened.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Host and port of a node.
///
/// Two addresses are equal iff host and port match after normalization:
/// surrounding whitespace is trimmed, the host is lowercased and IPv6
/// brackets are stripped. Fields are private so every instance is normalized.
///
/// # Examples
///
/// ```
/// use meshwire_core::Address;
///
/// let a = Address::parse("LocalHost:4801").expect("valid address");
/// let b = Address::new("localhost", 4801);
/// assert_eq!(a, b);
/// assert_eq!(a.to_string(), "localhost:4801");
///
/// let v6 = Address::parse("[::1]:4801").expect("valid address");
/// assert_eq!(v6.host(), "::1");
/// assert_eq!(v6.to_string(), "[::1]:4801");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    host: String,
    port: u16,
}

impl Address {
    /// Create a normalized address.
    pub fn new(host: impl AsRef<str>, port: u16) -> Self {
        Self {
            host: normalize_host(host.as_ref()),
            port,
        }
    }

    /// Parse from `host:port` or `[ipv6]:port`.
    ///
    /// # Errors
    ///
    /// Returns an error if the host is empty or the port is missing or invalid.
    pub fn parse(s: &str) -> Result<Self, AddressParseError> {
        let s = s.trim();
        let (host, port_str) = if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or(AddressParseError::UnclosedBracket)?;
            let port_str = tail
                .strip_prefix(':')
                .ok_or(AddressParseError::MissingPort)?;
            (host, port_str)
        } else {
            s.rsplit_once(':').ok_or(AddressParseError::MissingPort)?
        };

        if host.trim().is_empty() {
            return Err(AddressParseError::EmptyHost);
        }
        let port = port_str
            .parse::<u16>()
            .map_err(|_| AddressParseError::InvalidPort {
                port: port_str.to_string(),
            })?;
        Ok(Self::new(host, port))
    }

    /// The normalized host.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The socket address when the host is an IP literal.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.host
            .parse::<IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, self.port))
    }

    /// Connect target in the `host:port` form accepted by socket APIs.
    pub fn connect_target(&self) -> String {
        self.to_string()
    }
}

fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    host.to_ascii_lowercase()
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Address {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl TryFrom<String> for Address {
    type Error = AddressParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Address> for String {
    fn from(addr: Address) -> Self {
        addr.to_string()
    }
}

/// Error parsing an [`Address`] from a string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressParseError {
    /// No `:` separator before the port.
    #[error("missing port separator")]
    MissingPort,
    /// The port is not a number in `0..=65535`.
    #[error("invalid port number: {port}")]
    InvalidPort {
        /// The rejected port text.
        port: String,
    },
    /// Nothing before the port separator.
    #[error("empty host")]
    EmptyHost,
    /// An IPv6 literal opened with `[` but never closed.
    #[error("unclosed '[' in IPv6 address")]
    UnclosedBracket,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_parse_ipv4() {
        let addr = Address::parse("127.0.0.1:5800").expect("parse");
        assert_eq!(addr.host(), "127.0.0.1");
        assert_eq!(addr.port(), 5800);
        assert_eq!(
            addr.socket_addr(),
            Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 5800))
        );
    }

    #[test]
    fn test_parse_ipv6() {
        let addr = Address::parse("[::1]:5800").expect("parse");
        assert_eq!(addr.host(), "::1");
        assert_eq!(
            addr.socket_addr(),
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 5800))
        );
        assert_eq!(addr.to_string(), "[::1]:5800");
    }

    #[test]
    fn test_hostname_has_no_socket_addr() {
        let addr = Address::parse("wronghost:49255").expect("parse");
        assert_eq!(addr.socket_addr(), None);
        assert_eq!(addr.connect_target(), "wronghost:49255");
    }

    #[test]
    fn test_normalized_equality() {
        let a = Address::parse("  LOCALHOST:80 ").expect("parse");
        let b = Address::new("localhost", 80);
        assert_eq!(a, b);

        let mut map = HashMap::new();
        map.insert(a, 1);
        assert_eq!(map.get(&b), Some(&1));

        assert_ne!(Address::new("localhost", 80), Address::new("localhost", 81));
        assert_ne!(Address::new("localhost", 80), Address::new("127.0.0.1", 80));
    }

    #[test]
    fn test_from_socket_addr() {
        let sock = SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 9);
        let addr = Address::from(sock);
        assert_eq!(addr, Address::parse("[::1]:9").expect("parse"));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(Address::parse("localhost"), Err(AddressParseError::MissingPort));
        assert_eq!(Address::parse(":80"), Err(AddressParseError::EmptyHost));
        assert!(matches!(
            Address::parse("localhost:http"),
            Err(AddressParseError::InvalidPort { .. })
        ));
        assert!(matches!(
            Address::parse("localhost:70000"),
            Err(AddressParseError::InvalidPort { .. })
        ));
        assert_eq!(Address::parse("[::1:80"), Err(AddressParseError::UnclosedBracket));
        assert_eq!(Address::parse("[::1]80"), Err(AddressParseError::MissingPort));
    }

    #[test]
    fn test_serde_uses_string_form() {
        let addr = Address::new("Example.COM", 443);
        let json = serde_json::to_string(&addr).expect("serialize");
        assert_eq!(json, "\"example.com:443\"");
        let back: Address = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, addr);
        assert!(serde_json::from_str::<Address>("\"nope\"").is_err());
    }
}
