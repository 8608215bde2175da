//! Teredo addressing (RFC 4380).
//!
//! A Teredo IPv6 address encodes the client's server and its NAT mapping:
//!
//! ```text
//! +--------+--------+-------+-----------+------------+
//! | prefix | server | flags | obf. port | obf. addr  |
//! | 4B     | 4B     | 2B    | 2B        | 4B         |
//! +--------+--------+-------+-----------+------------+
//! ```
//!
//! The mapped port and address are obfuscated by inverting every bit, so a
//! NAT rewriting plain addresses in payloads leaves them alone.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4};

use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{Error, Result};

/// The Teredo service prefix, `2001:0::/32`, as its high 32 bits.
pub const TEREDO_PREFIX: u32 = 0x2001_0000;

/// The Teredo service prefix as an IPv6 address.
pub const DEFAULT_PREFIX: Ipv6Addr = Ipv6Addr::new(0x2001, 0, 0, 0, 0, 0, 0, 0);

/// Cone bit in the flags field.
pub const CONE_FLAG: u16 = 0x8000;

/// Well-known host address assigned to the tunnel of a cone relay.
pub const CONE_ADDR: Ipv6Addr = Ipv6Addr::new(0xfe80, 0, 0, 0, 0x8000, 0xffff, 0xffff, 0xfffd);

/// Well-known host address assigned to the tunnel of a restricted relay.
pub const RESTRICT_ADDR: Ipv6Addr = Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0xffff, 0xffff, 0xfffd);

/// Extract the high 32 bits of an IPv6 address (the Teredo prefix slot).
pub fn prefix_of(addr: &Ipv6Addr) -> u32 {
    u32::from_be_bytes(addr.octets()[0..4].try_into().unwrap_or([0; 4]))
}

/// Does `addr` fall under the given Teredo prefix?
pub fn matches_prefix(addr: &Ipv6Addr, prefix: u32) -> bool {
    prefix_of(addr) == prefix
}

/// The components a Teredo address carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeredoEndpoint {
    /// Teredo server the client qualified against.
    pub server: Ipv4Addr,
    /// Flags field; bit 15 is the cone bit.
    pub flags: u16,
    /// Client's NAT mapping, de-obfuscated.
    pub mapped_addr: Ipv4Addr,
    /// Client's NAT mapping port, de-obfuscated.
    pub mapped_port: u16,
}

impl TeredoEndpoint {
    /// Assemble the components into an IPv6 address under `prefix`.
    pub fn to_ipv6(&self, prefix: u32) -> Ipv6Addr {
        let mut octets = [0u8; 16];
        octets[0..4].copy_from_slice(&prefix.to_be_bytes());
        octets[4..8].copy_from_slice(&self.server.octets());
        octets[8..10].copy_from_slice(&self.flags.to_be_bytes());
        octets[10..12].copy_from_slice(&(self.mapped_port ^ 0xffff).to_be_bytes());
        let mapped = self.mapped_addr.octets().map(|b| b ^ 0xff);
        octets[12..16].copy_from_slice(&mapped);
        Ipv6Addr::from(octets)
    }

    /// Take a Teredo address apart; fails unless it carries `prefix`.
    pub fn from_ipv6(addr: &Ipv6Addr, prefix: u32) -> Result<Self> {
        if !matches_prefix(addr, prefix) {
            return Err(Error::TeredoAddress(format!(
                "{addr} is not within prefix {prefix:#010x}"
            )));
        }

        let octets = addr.octets();
        let server = Ipv4Addr::new(octets[4], octets[5], octets[6], octets[7]);
        let flags = u16::from_be_bytes([octets[8], octets[9]]);
        let mapped_port = u16::from_be_bytes([octets[10], octets[11]]) ^ 0xffff;
        let mapped_addr = Ipv4Addr::new(
            octets[12] ^ 0xff,
            octets[13] ^ 0xff,
            octets[14] ^ 0xff,
            octets[15] ^ 0xff,
        );

        Ok(Self {
            server,
            flags,
            mapped_addr,
            mapped_port,
        })
    }

    /// The UDP endpoint behind the NAT mapping.
    pub fn mapped_socket(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.mapped_addr, self.mapped_port)
    }

    /// True when the address advertises a cone NAT.
    pub fn is_cone(&self) -> bool {
        self.flags & CONE_FLAG != 0
    }
}

/// Cryptographic nonce source for client qualification.
///
/// The qualification handshake itself lives outside this crate; the worker
/// initialises the source in client mode and the relay draws its nonce from
/// it at construction.
#[derive(Debug)]
pub struct NonceSource {
    rng: OsRng,
}

impl Default for NonceSource {
    fn default() -> Self {
        Self::new()
    }
}

impl NonceSource {
    pub fn new() -> Self {
        Self { rng: OsRng }
    }

    /// Draw a fresh 8-octet nonce.
    pub fn nonce(&mut self) -> [u8; 8] {
        let mut nonce = [0u8; 8];
        self.rng.fill_bytes(&mut nonce);
        nonce
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_roundtrip() {
        let endpoint = TeredoEndpoint {
            server: Ipv4Addr::new(192, 0, 2, 1),
            flags: CONE_FLAG,
            mapped_addr: Ipv4Addr::new(203, 0, 113, 55),
            mapped_port: 40000,
        };

        let addr = endpoint.to_ipv6(TEREDO_PREFIX);
        let parsed = TeredoEndpoint::from_ipv6(&addr, TEREDO_PREFIX).unwrap();
        assert_eq!(parsed, endpoint);
    }

    #[test]
    fn test_address_layout() {
        let endpoint = TeredoEndpoint {
            server: Ipv4Addr::new(192, 0, 2, 1),
            flags: 0,
            mapped_addr: Ipv4Addr::new(203, 0, 113, 55),
            mapped_port: 40000,
        };

        let octets = endpoint.to_ipv6(TEREDO_PREFIX).octets();
        assert_eq!(&octets[0..4], &[0x20, 0x01, 0x00, 0x00]);
        assert_eq!(&octets[4..8], &[192, 0, 2, 1]);
        // Port 40000 = 0x9c40, inverted 0x63bf.
        assert_eq!(&octets[10..12], &[0x63, 0xbf]);
        // Address bytes are bit-inverted.
        assert_eq!(&octets[12..16], &[!203, !0, !113, !55]);
    }

    #[test]
    fn test_prefix_mismatch() {
        let other = Ipv6Addr::new(0x2002, 0, 0, 0, 0, 0, 0, 1);
        assert!(TeredoEndpoint::from_ipv6(&other, TEREDO_PREFIX).is_err());
        assert!(!matches_prefix(&other, TEREDO_PREFIX));
    }

    #[test]
    fn test_cone_flag() {
        let endpoint = TeredoEndpoint {
            server: Ipv4Addr::new(192, 0, 2, 1),
            flags: CONE_FLAG,
            mapped_addr: Ipv4Addr::new(198, 51, 100, 1),
            mapped_port: 1234,
        };
        assert!(endpoint.is_cone());

        let endpoint = TeredoEndpoint { flags: 0, ..endpoint };
        assert!(!endpoint.is_cone());
    }

    #[test]
    fn test_well_known_addresses() {
        // Both carry the ::ffff:ffff:fffd suffix; only the cone variant
        // sets the cone bit in the flags slot.
        let cone = CONE_ADDR.octets();
        let restrict = RESTRICT_ADDR.octets();
        assert_eq!(&cone[0..2], &[0xfe, 0x80]);
        assert_eq!(&cone[8..10], &[0x80, 0x00]);
        assert_eq!(&restrict[8..10], &[0x00, 0x00]);
        assert_eq!(&cone[10..16], &restrict[10..16]);
    }

    #[test]
    fn test_default_prefix_value() {
        assert_eq!(prefix_of(&DEFAULT_PREFIX), TEREDO_PREFIX);
    }

    #[test]
    fn test_nonce_source() {
        let mut source = NonceSource::new();
        let a = source.nonce();
        let b = source.nonce();
        // Two 64-bit draws colliding would mean the source is broken.
        assert_ne!(a, b);
    }
}
