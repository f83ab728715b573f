//! Configuration for transport binding and connection behavior.

use std::time::Duration;

use crate::wire::MAX_FRAME_SIZE;

/// Configuration for a [`Transport`](crate::Transport).
///
/// Built from [`TransportConfig::default`] or one of the presets, then adjusted
/// with the `with_*` methods:
///
/// ```
/// use std::time::Duration;
/// use meshwire_transport::TransportConfig;
///
/// let config = TransportConfig::default()
///     .with_port(6000)
///     .with_port_count(30)
///     .with_listen_address("127.0.0.1")
///     .with_connect_timeout(Duration::from_secs(1));
/// assert!(config.port_auto_increment);
/// ```
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// First port to try. `0` lets the OS pick an ephemeral port.
    pub port: u16,

    /// Try the following ports when `port` is taken.
    pub port_auto_increment: bool,

    /// How many ports to try when auto-incrementing, `port` included.
    pub port_count: u16,

    /// IP address to listen on. Mutually exclusive with `listen_interface`.
    pub listen_address: Option<String>,

    /// Network interface to listen on. Must carry exactly one usable address
    /// of the preferred family.
    pub listen_interface: Option<String>,

    /// Pick IPv6 addresses when resolving `listen_interface`.
    pub prefer_ipv6: bool,

    /// Timeout for each connection attempt.
    pub connect_timeout: Duration,

    /// Attempts per connection acquire before queued sends fail.
    pub max_connect_attempts: u32,

    /// Backoff before the second attempt.
    pub initial_reconnect_delay: Duration,

    /// Upper bound of the exponential backoff between attempts.
    pub max_reconnect_delay: Duration,

    /// Interpose the [`NetworkEmulator`](crate::NetworkEmulator) on outbound
    /// traffic.
    pub use_network_emulator: bool,

    /// Largest frame accepted in either direction.
    pub max_frame_size: usize,

    /// Socket read chunk size.
    pub read_buffer_size: usize,

    /// Set `TCP_NODELAY` on every connection.
    pub tcp_nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: 0,
            port_auto_increment: true,
            port_count: 100,
            listen_address: None,
            listen_interface: None,
            prefer_ipv6: false,
            connect_timeout: Duration::from_secs(3),
            max_connect_attempts: 1,
            initial_reconnect_delay: Duration::from_millis(100),
            max_reconnect_delay: Duration::from_secs(5),
            use_network_emulator: false,
            max_frame_size: MAX_FRAME_SIZE,
            read_buffer_size: 64 * 1024,
            tcp_nodelay: true,
        }
    }
}

impl TransportConfig {
    /// Loopback listener with short timeouts, for tests and local tooling.
    pub fn local_network() -> Self {
        Self {
            listen_address: Some("127.0.0.1".to_string()),
            connect_timeout: Duration::from_secs(1),
            initial_reconnect_delay: Duration::from_millis(10),
            max_reconnect_delay: Duration::from_secs(1),
            ..Self::default()
        }
    }

    /// Set the first port to try.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Enable or disable the port search.
    pub fn with_port_auto_increment(mut self, enabled: bool) -> Self {
        self.port_auto_increment = enabled;
        self
    }

    /// Set the port search width.
    pub fn with_port_count(mut self, count: u16) -> Self {
        self.port_count = count;
        self
    }

    /// Listen on a specific IP address.
    pub fn with_listen_address(mut self, address: impl Into<String>) -> Self {
        self.listen_address = Some(address.into());
        self
    }

    /// Listen on the address of a network interface.
    pub fn with_listen_interface(mut self, interface: impl Into<String>) -> Self {
        self.listen_interface = Some(interface.into());
        self
    }

    /// Prefer IPv6 when resolving the listen interface.
    pub fn with_prefer_ipv6(mut self, prefer: bool) -> Self {
        self.prefer_ipv6 = prefer;
        self
    }

    /// Set the per-attempt connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Retry connecting up to `attempts` times with exponential backoff.
    pub fn with_connect_attempts(
        mut self,
        attempts: u32,
        initial_delay: Duration,
        max_delay: Duration,
    ) -> Self {
        self.max_connect_attempts = attempts.max(1);
        self.initial_reconnect_delay = initial_delay;
        self.max_reconnect_delay = max_delay;
        self
    }

    /// Enable the network emulator.
    pub fn with_network_emulator(mut self, enabled: bool) -> Self {
        self.use_network_emulator = enabled;
        self
    }

    /// Set the frame size limit.
    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Number of ports the bind may try.
    pub(crate) fn port_span(&self) -> u16 {
        if self.port_auto_increment && self.port != 0 {
            self.port_count.max(1)
        } else {
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_span() {
        let config = TransportConfig::default();
        assert_eq!(config.port_span(), 1, "ephemeral port never searches");

        let config = config.with_port(6000).with_port_count(30);
        assert_eq!(config.port_span(), 30);

        let config = config.with_port_auto_increment(false);
        assert_eq!(config.port_span(), 1);

        let config = TransportConfig::default()
            .with_port(6000)
            .with_port_count(0);
        assert_eq!(config.port_span(), 1);
    }

    #[test]
    fn test_connect_attempts_at_least_one() {
        let config = TransportConfig::local_network().with_connect_attempts(
            0,
            Duration::from_millis(1),
            Duration::from_millis(2),
        );
        assert_eq!(config.max_connect_attempts, 1);
        assert_eq!(config.listen_address.as_deref(), Some("127.0.0.1"));
    }
}
