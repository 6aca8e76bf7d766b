/*!
 * Utility functions and helpers for camflow.
 *
 * Address arithmetic shared by discovery and handle creation, plus the
 * duration formatting used in timeout messages.
 */
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::time::Duration;

use tracing::debug;

use crate::error::{Error, Result};

/// First three octets of the multicast group used for non-exclusive access
pub const MULTICAST_PREFIX: [u8; 3] = [239, 192, 1];

/// Port used to probe the route to a camera
const ROUTE_PROBE_PORT: u16 = 80;

/// Convert an IPv4 address to the packed integer form the vendor SDK uses
pub fn ip_to_u32(ip: Ipv4Addr) -> u32 {
    u32::from(ip)
}

/// Find the local interface address the OS would use to reach `target`
///
/// Connecting a UDP socket sends nothing, it only resolves the route.
pub fn host_ip_for(target: Ipv4Addr) -> Result<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.connect(SocketAddrV4::new(target, ROUTE_PROBE_PORT))?;
    match socket.local_addr()?.ip() {
        std::net::IpAddr::V4(ip) => {
            debug!("Resolved host interface {} for {}", ip, target);
            Ok(ip)
        }
        std::net::IpAddr::V6(ip) => Err(Error::runtime(format!(
            "Route to {} resolved to non-IPv4 address {}",
            target, ip
        ))),
    }
}

/// Default multicast group for a camera: `239.192.1.<last octet>`
pub fn default_multicast_for(address: Ipv4Addr) -> Ipv4Addr {
    let [a, b, c] = MULTICAST_PREFIX;
    Ipv4Addr::new(a, b, c, address.octets()[3])
}

/// Convert a Duration to milliseconds
pub fn duration_to_millis(duration: Duration) -> u64 {
    duration.as_secs() * 1000 + u64::from(duration.subsec_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_packing() {
        let ip = Ipv4Addr::new(192, 168, 1, 10);
        assert_eq!(ip_to_u32(ip), 0xC0A8_010A);
    }

    #[test]
    fn test_default_multicast() {
        let group = default_multicast_for(Ipv4Addr::new(192, 168, 3, 77));
        assert_eq!(group, Ipv4Addr::new(239, 192, 1, 77));
        assert!(group.is_multicast());
    }

    #[test]
    fn test_host_ip_for_loopback() {
        let ip = host_ip_for(Ipv4Addr::LOCALHOST).unwrap();
        assert!(ip.is_loopback());
    }

    #[test]
    fn test_duration_conversions() {
        let duration = Duration::from_millis(1234);
        assert_eq!(duration_to_millis(duration), 1234);
        assert_eq!(duration_to_millis(Duration::from_micros(2500)), 2);
    }
}
