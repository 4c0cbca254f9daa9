//! Best-effort detection of the primary LAN IPv4 address.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};

/// Finds the IPv4 address a LAN peer would reach this host on.
///
/// Connecting a UDP socket to a public address selects the preferred outbound
/// interface without sending any packets.
pub fn detect_primary_ipv4() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    let local = socket.local_addr().ok()?;
    match local.ip() {
        IpAddr::V4(ip) if !ip.is_loopback() && !ip.is_unspecified() => Some(ip),
        _ => None,
    }
}
