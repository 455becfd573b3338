// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! TCP port reachability checks.

use std::net::IpAddr;
use std::net::SocketAddr;
use std::net::TcpStream;
use std::net::ToSocketAddrs;
use std::time::Duration;

/// Makes one connection attempt to `address:port` and reports whether it
/// completed within `timeout`.
///
/// Literal IP addresses are used as-is. A host name is handed to the system
/// resolver first, which `timeout` does not bound, and only the first
/// resolved address (IPv4 preferred) is tried.
pub fn probe_port(address: &str, port: u16, timeout: Duration) -> bool {
    if timeout.is_zero() {
        return false;
    }

    let Some(addr) = target(address, port) else {
        return false;
    };

    match TcpStream::connect_timeout(&addr, timeout) {
        Ok(_) => {
            tracing::debug!(%addr, "port is accepting connections");
            true
        }
        Err(err) => {
            tracing::debug!(%addr, error = %err, "connection attempt failed");
            false
        }
    }
}

fn target(address: &str, port: u16) -> Option<SocketAddr> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Some(SocketAddr::new(ip, port));
    }
    let addrs: Vec<SocketAddr> = match (address, port).to_socket_addrs() {
        Ok(addrs) => addrs.collect(),
        Err(err) => {
            tracing::debug!(address, port, error = %err, "failed to resolve address");
            return None;
        }
    };
    let addr = addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied();
    if addr.is_none() {
        tracing::debug!(address, port, "address resolved to nothing");
    }
    addr
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::time::Instant;

    #[test]
    fn open_port_is_reachable() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(probe_port("127.0.0.1", port, Duration::from_secs(2)));
    }

    #[test]
    fn closed_port_fails_in_bounded_time() {
        // Grab a free port, then release it so nothing is listening.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let start = Instant::now();
        assert!(!probe_port("127.0.0.1", port, Duration::from_secs(2)));
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn zero_timeout_never_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!probe_port("127.0.0.1", port, Duration::ZERO));
    }

    #[test]
    fn literal_address_skips_resolution() {
        assert_eq!(
            target("192.0.2.10", 22),
            Some(SocketAddr::from(([192, 0, 2, 10], 22)))
        );
    }

    #[test]
    fn host_name_gets_a_single_attempt() {
        // localhost may resolve to both ::1 and 127.0.0.1.
        assert_eq!(
            target("localhost", 22),
            Some(SocketAddr::from(([127, 0, 0, 1], 22)))
        );
    }

    #[test]
    fn unresolvable_address_is_unreachable() {
        assert!(!probe_port("not an address", 22, Duration::from_secs(1)));
    }
}
