//! Compact address descriptors for tunnel circuits.
//!
//! Every tunnelled chunk carries two descriptors: the browser-side peer
//! address (source) and the device-side target (destination).  Each is six
//! bytes on the wire:
//!
//! ```text
//! [ipv4:4][port:2 BE]
//! ```

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use thiserror::Error;

/// Size of one encoded descriptor in bytes.
pub const ADDR_DESCRIPTOR_LEN: usize = 6;

/// Port assumed when a destination omits one.
pub const DEFAULT_DESTINATION_PORT: u16 = 80;

/// Errors produced when parsing a user-supplied destination.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddrError {
    #[error("destination is empty")]
    Empty,

    #[error("'{0}' is not an IPv4 address")]
    InvalidHost(String),

    #[error("'{0}' is not a valid port")]
    InvalidPort(String),
}

/// An IPv4 address and port packed into six bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddrDescriptor {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl AddrDescriptor {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }

    /// Derives a descriptor from an accepted peer address.
    ///
    /// IPv4-mapped IPv6 peers (`::ffff:a.b.c.d`) are unwrapped; any other
    /// IPv6 peer has no 4-byte form and yields `None`.
    pub fn from_socket_addr(addr: SocketAddr) -> Option<Self> {
        let ip = match addr.ip() {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(v6) => v6.to_ipv4_mapped()?,
        };
        Some(Self::new(ip, addr.port()))
    }

    /// Parses a user-chosen `a.b.c.d[:port]` destination.
    ///
    /// # Errors
    ///
    /// Returns [`AddrError`] if the host is not a dotted IPv4 address or the
    /// port is not a non-zero 16-bit number.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use ttyhub_core::AddrDescriptor;
    ///
    /// let dst = AddrDescriptor::parse_destination("192.168.1.1").unwrap();
    /// assert_eq!(dst.port, 80);
    /// let dst = AddrDescriptor::parse_destination("10.0.0.2:8080").unwrap();
    /// assert_eq!(dst.to_string(), "10.0.0.2:8080");
    /// ```
    pub fn parse_destination(input: &str) -> Result<Self, AddrError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(AddrError::Empty);
        }

        let (host, port) = match input.split_once(':') {
            Some((host, port)) => {
                let port: u16 = port
                    .parse()
                    .ok()
                    .filter(|p| *p != 0)
                    .ok_or_else(|| AddrError::InvalidPort(port.to_string()))?;
                (host, port)
            }
            None => (input, DEFAULT_DESTINATION_PORT),
        };

        let ip: Ipv4Addr = host
            .parse()
            .map_err(|_| AddrError::InvalidHost(host.to_string()))?;
        Ok(Self::new(ip, port))
    }

    pub fn to_bytes(self) -> [u8; ADDR_DESCRIPTOR_LEN] {
        let o = self.ip.octets();
        let p = self.port.to_be_bytes();
        [o[0], o[1], o[2], o[3], p[0], p[1]]
    }

    pub fn from_bytes(bytes: [u8; ADDR_DESCRIPTOR_LEN]) -> Self {
        Self::new(
            Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]),
            u16::from_be_bytes([bytes[4], bytes[5]]),
        )
    }
}

impl fmt::Display for AddrDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    #[test]
    fn test_parse_destination_defaults_port_80() {
        let dst = AddrDescriptor::parse_destination("10.1.2.3").unwrap();
        assert_eq!(dst, AddrDescriptor::new(Ipv4Addr::new(10, 1, 2, 3), 80));
    }

    #[test]
    fn test_parse_destination_with_explicit_port() {
        let dst = AddrDescriptor::parse_destination(" 127.0.0.1:8443 ").unwrap();
        assert_eq!(dst.port, 8443);
    }

    #[test]
    fn test_parse_destination_rejects_hostname() {
        // Only dotted IPv4 is accepted; the device resolves nothing.
        assert_eq!(
            AddrDescriptor::parse_destination("router.local:80"),
            Err(AddrError::InvalidHost("router.local".to_string()))
        );
    }

    #[test]
    fn test_parse_destination_rejects_port_zero_and_overflow() {
        assert!(matches!(
            AddrDescriptor::parse_destination("10.0.0.1:0"),
            Err(AddrError::InvalidPort(_))
        ));
        assert!(matches!(
            AddrDescriptor::parse_destination("10.0.0.1:70000"),
            Err(AddrError::InvalidPort(_))
        ));
    }

    #[test]
    fn test_parse_destination_rejects_empty() {
        assert_eq!(AddrDescriptor::parse_destination("  "), Err(AddrError::Empty));
    }

    #[test]
    fn test_wire_layout_is_ip_then_big_endian_port() {
        let d = AddrDescriptor::new(Ipv4Addr::new(192, 168, 0, 9), 0x1F90);
        assert_eq!(d.to_bytes(), [192, 168, 0, 9, 0x1F, 0x90]);
        assert_eq!(AddrDescriptor::from_bytes(d.to_bytes()), d);
    }

    #[test]
    fn test_from_socket_addr_unwraps_mapped_ipv6() {
        let mapped = Ipv4Addr::new(10, 0, 0, 7).to_ipv6_mapped();
        let addr = SocketAddr::new(IpAddr::V6(mapped), 5000);
        assert_eq!(
            AddrDescriptor::from_socket_addr(addr),
            Some(AddrDescriptor::new(Ipv4Addr::new(10, 0, 0, 7), 5000))
        );
    }

    #[test]
    fn test_from_socket_addr_rejects_native_ipv6() {
        let addr = SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 5000);
        assert_eq!(AddrDescriptor::from_socket_addr(addr), None);
    }
}
