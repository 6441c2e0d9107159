//! Resolves the local interface IP used for multicast send/receive, the
//! way `udpmc_getIpAddress` does in the original admin: an explicit
//! `PSA_IP` override wins outright, otherwise a named interface (`PSA_INTERFACE`)
//! is looked up via `getifaddrs`, falling back to loopback.

use std::ffi::CStr;
use std::net::Ipv4Addr;

pub fn resolve_interface_ip(interface: Option<&str>, override_ip: Option<&str>) -> Ipv4Addr {
    if let Some(ip) = override_ip.and_then(|s| s.parse().ok()) {
        return ip;
    }
    if let Some(name) = interface {
        if let Some(ip) = lookup_ifaddr(name) {
            return ip;
        }
        tracing::warn!(interface = name, "psa-udpmc: could not resolve interface IP, falling back to loopback");
    }
    Ipv4Addr::LOCALHOST
}

fn lookup_ifaddr(name: &str) -> Option<Ipv4Addr> {
    unsafe {
        let mut addrs: *mut libc::ifaddrs = std::ptr::null_mut();
        if libc::getifaddrs(&mut addrs) != 0 {
            return None;
        }
        let mut result = None;
        let mut cur = addrs;
        while !cur.is_null() {
            let ifa = &*cur;
            if !ifa.ifa_name.is_null() && !ifa.ifa_addr.is_null() {
                let cname = CStr::from_ptr(ifa.ifa_name);
                let family = (*ifa.ifa_addr).sa_family as libc::c_int;
                if cname.to_str() == Ok(name) && family == libc::AF_INET {
                    let sin = &*(ifa.ifa_addr as *const libc::sockaddr_in);
                    result = Some(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)));
                    break;
                }
            }
            cur = ifa.ifa_next;
        }
        libc::freeifaddrs(addrs);
        result
    }
}

/// Derives the per-PSA multicast group address from `PSA_MC_PREFIX` and
/// the resolved interface IP, matching the original's
/// `"{prefix}.{b2}.{b3}"` scheme (it reuses the interface's last two
/// octets so independently-configured processes on the same host still
/// land on distinct groups during local testing).
pub fn derive_multicast_group(mc_prefix: &str, interface_ip: Ipv4Addr) -> Ipv4Addr {
    let octets = interface_ip.octets();
    format!("{mc_prefix}.{}.{}", octets[2], octets[3])
        .parse()
        .unwrap_or(Ipv4Addr::new(224, 100, 1, 1))
}
