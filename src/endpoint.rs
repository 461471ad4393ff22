//! IPv4/IPv6 address plus port as an immutable value

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use crate::error::{Error, StatusCode};

/// Network endpoint
///
/// `Undefined` is produced when an address cannot be parsed; sockets refuse
/// to bind or send to it.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Endpoint {
    #[default]
    Undefined,
    V4 { octets: [u8; 4], port: u16 },
    V6 { octets: [u8; 16], port: u16 },
}

impl Endpoint {
    /// Parses `address` as IPv4 or IPv6 text; yields `Undefined` on failure
    pub fn new(address: &str, port: u16) -> Self {
        match address.parse::<IpAddr>() {
            Ok(ip) => SocketAddr::new(ip, port).into(),
            Err(_) => Endpoint::Undefined,
        }
    }

    /// Builds an IPv4 endpoint from a host-order address
    pub fn from_ipv4(address: u32, port: u16) -> Self {
        Endpoint::V4 { octets: address.to_be_bytes(), port }
    }

    pub fn is_defined(&self) -> bool {
        !matches!(self, Endpoint::Undefined)
    }

    pub fn is_ipv4(&self) -> bool {
        matches!(self, Endpoint::V4 { .. })
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self, Endpoint::V6 { .. })
    }

    pub fn port(&self) -> u16 {
        match *self {
            Endpoint::Undefined => 0,
            Endpoint::V4 { port, .. } | Endpoint::V6 { port, .. } => port,
        }
    }

    /// Host-order IPv4 address, 0 for anything else
    pub fn ipv4_addr(&self) -> u32 {
        match *self {
            Endpoint::V4 { octets, .. } => u32::from_be_bytes(octets),
            _ => 0,
        }
    }

    pub fn address_string(&self) -> String {
        match self.to_socket_addr() {
            Some(sa) => sa.ip().to_string(),
            None => String::new(),
        }
    }

    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        match *self {
            Endpoint::Undefined => None,
            Endpoint::V4 { octets, port } => Some(SocketAddr::new(Ipv4Addr::from(octets).into(), port)),
            Endpoint::V6 { octets, port } => Some(SocketAddr::new(Ipv6Addr::from(octets).into(), port)),
        }
    }

    /// Same as [`to_socket_addr`](Self::to_socket_addr) but reports `InvalidArgument`
    pub(crate) fn require_socket_addr(&self) -> Result<SocketAddr, Error> {
        self.to_socket_addr()
            .ok_or_else(|| Error::with_message(StatusCode::InvalidArgument, "undefined endpoint"))
    }

    /// Wildcard address of the same family, port 0
    pub(crate) fn unspecified_like(&self) -> SocketAddr {
        match self {
            Endpoint::V6 { .. } => SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0),
            _ => SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0),
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(sa: SocketAddr) -> Self {
        match sa {
            SocketAddr::V4(a) => Endpoint::V4 { octets: a.ip().octets(), port: a.port() },
            SocketAddr::V6(a) => match a.ip().to_ipv4_mapped() {
                Some(v4) => Endpoint::V4 { octets: v4.octets(), port: a.port() },
                None => Endpoint::V6 { octets: a.ip().octets(), port: a.port() },
            },
        }
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<SocketAddr>()
            .map(Endpoint::from)
            .map_err(|e| Error::with_message(StatusCode::InvalidArgument, e.to_string()))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_socket_addr() {
            Some(sa) => write!(f, "{}", sa),
            None => f.write_str("<undefined>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_render() {
        let e = Endpoint::new("127.0.0.1", 8080);
        assert!(e.is_ipv4());
        assert_eq!(e.port(), 8080);
        assert_eq!(e.to_string(), "127.0.0.1:8080");
        assert_eq!(e.address_string(), "127.0.0.1");

        let e6 = Endpoint::new("::1", 443);
        assert!(e6.is_ipv6());
        assert_eq!(e6.to_string(), "[::1]:443");
    }

    #[test]
    fn test_invalid_address_is_undefined() {
        let e = Endpoint::new("not an ip", 1);
        assert_eq!(e, Endpoint::Undefined);
        assert!(!e.is_defined());
        assert_eq!(e.port(), 0);
        assert!(e.to_socket_addr().is_none());
        assert!("1.2.3.4".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_from_ipv4_and_equality() {
        let a = Endpoint::from_ipv4(0x7F00_0001, 53);
        let b: Endpoint = "127.0.0.1:53".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.ipv4_addr(), 0x7F00_0001);
        assert_ne!(a, Endpoint::from_ipv4(0x7F00_0001, 54));
    }

    #[test]
    fn test_v4_mapped_normalization() {
        let sa: SocketAddr = "[::ffff:10.0.0.1]:9".parse().unwrap();
        assert_eq!(Endpoint::from(sa), Endpoint::new("10.0.0.1", 9));
    }
}
