//! 4.C Address object.
//!
//! An immutable sockaddr capability: family byte, length byte, up to 18
//! payload bytes (port plus a full 16-byte address, wide enough for
//! `sockaddr_in6` without truncating any octet). Grounded in `std_glue.rs`'s
//! `parse_address`/`write_address`
//! helpers, generalized from ad-hoc byte twiddling into a small value type
//! that the socket-RPC surface (4.J) can move around and wrap in capability
//! ports without re-parsing.

use smoltcp::wire::{IpAddress, IpEndpoint};

use crate::api::WireAddress;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
    pub family: u8,
    pub len: u8,
    pub bytes: [u8; 18],
}

pub const AF_INET: u8 = 2;
pub const AF_INET6: u8 = 10;

impl Address {
    /// `create-address` / `whatis-address`: copy caller bytes verbatim.
    /// spec.md §4.J: "family must be INET or AF-unspec".
    pub fn from_wire(family: u8, len: u8, bytes: [u8; 18]) -> Option<Address> {
        if family != AF_INET && family != AF_INET6 && family != 0 {
            return None;
        }
        Some(Address { family, len, bytes })
    }

    pub fn to_wire(self) -> WireAddress {
        WireAddress { family: self.family, len: self.len, bytes: self.bytes }
    }

    /// Builds an address object from a resolved stack endpoint (name,
    /// peername, accept all return one of these).
    pub fn from_endpoint(ep: IpEndpoint) -> Address {
        let mut bytes = [0u8; 18];
        let (family, len) = match ep.addr {
            IpAddress::Ipv4(v4) => {
                // sin_family(2) + sin_port(2) + sin_addr(4), matching the
                // layout `lwip_getsockname` hands back in socket-ops.c.
                bytes[0..2].copy_from_slice(&ep.port.to_be_bytes());
                bytes[2..6].copy_from_slice(&v4.0);
                (AF_INET, 8u8)
            }
            IpAddress::Ipv6(v6) => {
                // Full 16-byte address; `bytes` is sized to carry it without
                // dropping octets the way a 14-byte payload would.
                bytes[0..2].copy_from_slice(&ep.port.to_be_bytes());
                bytes[2..18].copy_from_slice(&v6.0);
                (AF_INET6, 20u8)
            }
        };
        Address { family, len, bytes }
    }

    pub fn to_endpoint(self) -> Option<IpEndpoint> {
        let port = u16::from_be_bytes([self.bytes[0], self.bytes[1]]);
        match self.family {
            AF_INET => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&self.bytes[2..6]);
                Some(IpEndpoint::new(IpAddress::v4(octets[0], octets[1], octets[2], octets[3]), port))
            }
            AF_INET6 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&self.bytes[2..18]);
                Some(IpEndpoint::new(smoltcp::wire::Ipv6Address(octets).into(), port))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_round_trips_through_wire_bytes() {
        let ep = IpEndpoint::new(IpAddress::v4(192, 168, 1, 5), 5555);
        let addr = Address::from_endpoint(ep);
        assert_eq!(addr.family, AF_INET);
        let back = addr.to_endpoint().unwrap();
        assert_eq!(back, ep);
    }

    #[test]
    fn rejects_non_inet_family() {
        assert!(Address::from_wire(99, 8, [0; 18]).is_none());
    }

    #[test]
    fn ipv6_endpoint_round_trips_without_truncation() {
        let v6 = smoltcp::wire::Ipv6Address([
            0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0xde, 0xad, 0xbe, 0xef,
        ]);
        let ep = IpEndpoint::new(v6.into(), 1234);
        let addr = Address::from_endpoint(ep);
        assert_eq!(addr.family, AF_INET6);
        assert_eq!(addr.to_endpoint().unwrap(), ep, "all 16 octets must survive the round trip");
    }
}
