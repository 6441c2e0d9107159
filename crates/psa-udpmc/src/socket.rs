//! Raw socket setup for the UDP-MC transport: send-side bind with
//! rejection-sampled port selection (§4.2), receive-side multicast join
//! (§4.3).

use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::io::{IntoRawFd, RawFd};

use rand::Rng;
use socket2::{Domain, Protocol, Socket, Type};

use pubsub_types::{PsError, PsResult};

const BIND_RETRY_CAP: u32 = 100;

/// Opens the send socket for a `TopicPublication`: `AF_INET/SOCK_DGRAM`,
/// multicast loopback enabled, `IP_MULTICAST_IF` pinned to `interface_ip`,
/// bound to a port chosen uniformly in `[port_base, port_max]` by
/// rejection sampling until `bind` succeeds or the retry cap is hit.
pub fn open_send_socket(
    interface_ip: Ipv4Addr,
    port_base: u16,
    port_max: u16,
) -> PsResult<(RawFd, u16)> {
    for _ in 0..BIND_RETRY_CAP {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(PsError::from)?;
        socket.set_multicast_loop_v4(true).map_err(PsError::from)?;
        socket
            .set_multicast_if_v4(&interface_ip)
            .map_err(PsError::from)?;

        let port = pick_port(port_base, port_max);
        let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
        match socket.bind(&addr.into()) {
            Ok(()) => return Ok((socket.into_raw_fd(), port)),
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => continue,
            Err(e) => return Err(PsError::from(e)),
        }
    }
    Err(PsError::ServiceException(format!(
        "exhausted {BIND_RETRY_CAP} bind attempts in port range [{port_base}, {port_max}]"
    )))
}

fn pick_port(base: u16, max: u16) -> u16 {
    if max <= base {
        return base;
    }
    rand::thread_rng().gen_range(base..=max)
}

/// Opens a receive socket joined to `group` on `interface_ip`'s multicast
/// membership, bound to `port` with `SO_REUSEADDR` so multiple local
/// subscriptions on this host can share the same group/port.
pub fn open_recv_socket(group: Ipv4Addr, port: u16, interface_ip: Ipv4Addr) -> PsResult<RawFd> {
    let socket =
        Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(PsError::from)?;
    socket.set_reuse_address(true).map_err(PsError::from)?;
    socket
        .join_multicast_v4(&group, &interface_ip)
        .map_err(PsError::from)?;
    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket.bind(&bind_addr.into()).map_err(PsError::from)?;
    socket.set_nonblocking(true).map_err(PsError::from)?;
    Ok(socket.into_raw_fd())
}

/// Parses a `udp://host:port` endpoint URL.
pub fn parse_udp_url(url: &str) -> PsResult<SocketAddrV4> {
    let rest = url
        .strip_prefix("udp://")
        .ok_or_else(|| PsError::IllegalArgument(format!("not a udp:// url: {url}")))?;
    rest.parse()
        .map_err(|_| PsError::IllegalArgument(format!("malformed udp:// url: {url}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_in_loopback_range_succeeds() {
        let (fd, port) = open_send_socket(Ipv4Addr::LOCALHOST, 40000, 40100).unwrap();
        assert!((40000..=40100).contains(&port));
        unsafe { libc::close(fd) };
    }

    #[test]
    fn parses_udp_url() {
        let addr = parse_udp_url("udp://127.0.0.1:4444").unwrap();
        assert_eq!(addr.port(), 4444);
    }

    #[test]
    fn rejects_non_udp_url() {
        assert!(parse_udp_url("tcp://127.0.0.1:4444").is_err());
    }
}
