//! Listen address resolution and port search.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use tokio::net::TcpListener;
use tracing::debug;

use crate::config::TransportConfig;
use crate::error::{TransportError, TransportResult};

/// Resolve the IP the transport listens on.
///
/// # Errors
///
/// `Config` when both `listen_address` and `listen_interface` are set, when
/// the address is a wildcard or not an IP literal, or when the interface does
/// not carry exactly one usable address.
pub(crate) fn resolve_listen_ip(config: &TransportConfig) -> TransportResult<IpAddr> {
    match (&config.listen_address, &config.listen_interface) {
        (Some(address), Some(interface)) => Err(TransportError::config(format!(
            "listen_address ({address}) and listen_interface ({interface}) are mutually exclusive"
        ))),
        (Some(address), None) => parse_listen_address(address),
        (None, Some(interface)) => interface_ip(interface, config.prefer_ipv6),
        (None, None) => Ok(default_listen_ip()),
    }
}

fn parse_listen_address(address: &str) -> TransportResult<IpAddr> {
    let address = address.trim();
    let ip = if address.eq_ignore_ascii_case("localhost") {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    } else {
        address
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .map_err(|_| {
                TransportError::config(format!("listen_address {address} is not an IP address"))
            })?
    };
    if ip.is_unspecified() {
        return Err(TransportError::config(format!(
            "listen_address {ip} is a wildcard address"
        )));
    }
    Ok(ip)
}

/// Addresses of the interface `name`, in the order the OS reports them.
#[cfg(unix)]
fn interface_addresses(name: &str) -> TransportResult<Option<Vec<IpAddr>>> {
    use nix::ifaddrs::getifaddrs;

    let addrs = getifaddrs()
        .map_err(|e| TransportError::config(format!("cannot list network interfaces: {e}")))?;

    let mut found = false;
    let mut ips = Vec::new();
    for ifaddr in addrs.filter(|a| a.interface_name == name) {
        found = true;
        let Some(storage) = ifaddr.address else {
            continue;
        };
        if let Some(v4) = storage.as_sockaddr_in() {
            ips.push(SocketAddr::V4((*v4).into()).ip());
        } else if let Some(v6) = storage.as_sockaddr_in6() {
            ips.push(SocketAddr::V6((*v6).into()).ip());
        }
    }
    Ok(found.then_some(ips))
}

#[cfg(not(unix))]
fn interface_addresses(_name: &str) -> TransportResult<Option<Vec<IpAddr>>> {
    Err(TransportError::config(
        "listen_interface is not supported on this platform",
    ))
}

fn interface_ip(name: &str, prefer_ipv6: bool) -> TransportResult<IpAddr> {
    let ips = interface_addresses(name)?
        .ok_or_else(|| TransportError::config(format!("unknown network interface {name}")))?;

    let usable: Vec<IpAddr> = ips
        .into_iter()
        .filter(|ip| ip.is_ipv6() == prefer_ipv6)
        .filter(|ip| !ip.is_loopback() && !ip.is_unspecified())
        .collect();

    match usable.as_slice() {
        [ip] => Ok(*ip),
        [] => Err(TransportError::config(format!(
            "network interface {name} has no usable {} address",
            if prefer_ipv6 { "IPv6" } else { "IPv4" }
        ))),
        many => Err(TransportError::config(format!(
            "network interface {name} has {} candidate addresses",
            many.len()
        ))),
    }
}

/// First non-loopback IPv4 address of the host, or loopback when there is none.
fn default_listen_ip() -> IpAddr {
    host_ipv4().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

#[cfg(unix)]
fn host_ipv4() -> Option<IpAddr> {
    nix::ifaddrs::getifaddrs()
        .ok()?
        .filter_map(|a| a.address)
        .filter_map(|storage| storage.as_sockaddr_in().map(|v4| SocketAddr::V4((*v4).into())))
        .map(|sock| sock.ip())
        .find(|ip| !ip.is_loopback() && !ip.is_unspecified())
}

#[cfg(not(unix))]
fn host_ipv4() -> Option<IpAddr> {
    None
}

/// Bind the first free port of the configured range.
///
/// Concurrent binds over the same range each end up on a distinct port: the OS
/// bind decides, a taken port just moves the search on.
pub(crate) async fn bind_listener(
    ip: IpAddr,
    config: &TransportConfig,
) -> TransportResult<TcpListener> {
    let span = config.port_span();
    let mut last_error: Option<(SocketAddr, io::Error)> = None;

    for offset in 0..span {
        let Some(port) = config.port.checked_add(offset) else {
            break;
        };
        let addr = SocketAddr::new(ip, port);
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                debug!(%addr, "port in use, trying next");
                last_error = Some((addr, e));
            }
            Err(e) => {
                return Err(TransportError::Bind {
                    address: addr.to_string(),
                    message: e.to_string(),
                });
            }
        }
    }

    let (address, message) = match last_error {
        Some((addr, e)) => (addr.to_string(), e.to_string()),
        None => (SocketAddr::new(ip, config.port).to_string(), "empty port range".to_string()),
    };
    Err(TransportError::Bind {
        address,
        message: format!("no free port among {span} tried (last error: {message})"),
    })
}
