#![forbid(unsafe_code)]

//! IPv4 address, netmask and CIDR helpers.
//!
//! Everything here is pure. Parsing failures are reported as [`AddrError::InvalidFormat`] so that
//! callers can show the offending input back to the learner verbatim.

use core::fmt;
use core::net::Ipv4Addr;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddrError {
    #[error("invalid {kind}: {input:?}")]
    InvalidFormat { kind: &'static str, input: String },
}

impl AddrError {
    fn invalid(kind: &'static str, input: &str) -> Self {
        Self::InvalidFormat {
            kind,
            input: input.to_string(),
        }
    }
}

/// Parses a dotted-quad IPv4 address (`192.168.1.10`).
///
/// Exactly four decimal octets are accepted; leading zeros, octets above 255 and surrounding
/// garbage are rejected.
pub fn parse_ipv4(s: &str) -> Result<Ipv4Addr, AddrError> {
    let trimmed = s.trim();
    let mut octets = [0u8; 4];
    let mut count = 0usize;
    for part in trimmed.split('.') {
        if count == 4 {
            return Err(AddrError::invalid("IPv4 address", s));
        }
        let well_formed = !part.is_empty()
            && part.len() <= 3
            && part.bytes().all(|b| b.is_ascii_digit())
            && !(part.len() > 1 && part.starts_with('0'));
        if !well_formed {
            return Err(AddrError::invalid("IPv4 address", s));
        }
        octets[count] = part
            .parse::<u8>()
            .map_err(|_| AddrError::invalid("IPv4 address", s))?;
        count += 1;
    }
    if count != 4 {
        return Err(AddrError::invalid("IPv4 address", s));
    }
    Ok(Ipv4Addr::from(octets))
}

/// Parses a CIDR range (`192.168.1.0/24`). Host bits are cleared.
pub fn parse_cidr(s: &str) -> Result<Ipv4Cidr, AddrError> {
    let trimmed = s.trim();
    let Some((addr, len)) = trimmed.split_once('/') else {
        return Err(AddrError::invalid("CIDR", s));
    };
    let addr = parse_ipv4(addr).map_err(|_| AddrError::invalid("CIDR", s))?;
    let len = parse_prefix_len(len).ok_or_else(|| AddrError::invalid("CIDR", s))?;
    Ok(Ipv4Cidr::new(addr, len))
}

/// Parses a netmask, either dotted (`255.255.255.0`) or as a prefix length (`/24`).
pub fn parse_mask(s: &str) -> Result<Netmask, AddrError> {
    let trimmed = s.trim();
    if let Some(len) = trimmed.strip_prefix('/') {
        let len = parse_prefix_len(len).ok_or_else(|| AddrError::invalid("netmask", s))?;
        return Ok(Netmask(len));
    }
    let addr = parse_ipv4(trimmed).map_err(|_| AddrError::invalid("netmask", s))?;
    Netmask::from_addr(addr).ok_or_else(|| AddrError::invalid("netmask", s))
}

fn parse_prefix_len(s: &str) -> Option<u8> {
    if s.is_empty() || s.len() > 2 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let len = s.parse::<u8>().ok()?;
    (len <= 32).then_some(len)
}

fn prefix_bits(prefix_len: u8) -> u32 {
    match prefix_len.min(32) {
        0 => 0,
        len => u32::MAX << (32 - len),
    }
}

/// A contiguous IPv4 netmask, stored as its prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Netmask(u8);

impl Netmask {
    pub fn from_prefix_len(prefix_len: u8) -> Option<Self> {
        (prefix_len <= 32).then_some(Self(prefix_len))
    }

    /// Returns `None` for non-contiguous masks such as `255.0.255.0`.
    pub fn from_addr(mask: Ipv4Addr) -> Option<Self> {
        let bits = u32::from(mask);
        let ones = bits.leading_ones();
        (ones + bits.trailing_zeros() >= 32).then_some(Self(ones as u8))
    }

    pub fn prefix_len(self) -> u8 {
        self.0
    }

    pub fn bits(self) -> u32 {
        prefix_bits(self.0)
    }

    pub fn to_addr(self) -> Ipv4Addr {
        Ipv4Addr::from(self.bits())
    }
}

impl fmt::Display for Netmask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.to_addr(), f)
    }
}

impl FromStr for Netmask {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_mask(s)
    }
}

impl TryFrom<String> for Netmask {
    type Error = AddrError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        parse_mask(&value)
    }
}

impl From<Netmask> for String {
    fn from(value: Netmask) -> Self {
        value.to_string()
    }
}

/// An IPv4 CIDR range (e.g. `10.0.0.0/8`), always normalized to its network address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ipv4Cidr {
    network: Ipv4Addr,
    prefix_len: u8,
}

impl Ipv4Cidr {
    /// The whole IPv4 space, used for default routes.
    pub const ANY: Self = Self {
        network: Ipv4Addr::UNSPECIFIED,
        prefix_len: 0,
    };

    pub fn new(addr: Ipv4Addr, prefix_len: u8) -> Self {
        let prefix_len = prefix_len.min(32);
        Self {
            network: Ipv4Addr::from(u32::from(addr) & prefix_bits(prefix_len)),
            prefix_len,
        }
    }

    pub fn host(addr: Ipv4Addr) -> Self {
        Self::new(addr, 32)
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn mask(&self) -> Netmask {
        Netmask(self.prefix_len)
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) | !prefix_bits(self.prefix_len))
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = prefix_bits(self.prefix_len);
        u32::from(self.network) & mask == u32::from(ip) & mask
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_cidr(s)
    }
}

impl TryFrom<String> for Ipv4Cidr {
    type Error = AddrError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        parse_cidr(&value)
    }
}

impl From<Ipv4Cidr> for String {
    fn from(value: Ipv4Cidr) -> Self {
        value.to_string()
    }
}

pub fn contains(cidr: &Ipv4Cidr, address: Ipv4Addr) -> bool {
    cidr.contains(address)
}

pub fn same_subnet(a: Ipv4Addr, b: Ipv4Addr, mask: Netmask) -> bool {
    u32::from(a) & mask.bits() == u32::from(b) & mask.bits()
}

/// Returns the network prefix `address` belongs to under `mask`.
pub fn apply_mask(address: Ipv4Addr, mask: Netmask) -> Ipv4Cidr {
    Ipv4Cidr::new(address, mask.prefix_len())
}

/// Addresses the simulated internet never routes back to: RFC 1918, loopback, link-local,
/// unspecified and broadcast.
pub fn is_private(address: Ipv4Addr) -> bool {
    address.is_private()
        || address.is_loopback()
        || address.is_link_local()
        || address.is_unspecified()
        || address.is_broadcast()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ipv4_rejects_malformed_input() {
        assert_eq!(parse_ipv4("192.168.1.10"), Ok(Ipv4Addr::new(192, 168, 1, 10)));
        assert_eq!(parse_ipv4(" 8.8.8.8 "), Ok(Ipv4Addr::new(8, 8, 8, 8)));
        for bad in [
            "", "1.2.3", "1.2.3.4.5", "256.1.1.1", "1.2.3.-4", "a.b.c.d", "01.2.3.4", "1..3.4",
            "1.2.3.4/24",
        ] {
            assert!(
                matches!(
                    parse_ipv4(bad),
                    Err(AddrError::InvalidFormat {
                        kind: "IPv4 address",
                        ..
                    })
                ),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn parse_cidr_normalizes_host_bits() {
        let cidr = parse_cidr("192.168.1.77/24").unwrap();
        assert_eq!(cidr.network(), Ipv4Addr::new(192, 168, 1, 0));
        assert_eq!(cidr.to_string(), "192.168.1.0/24");
        assert_eq!(cidr.broadcast(), Ipv4Addr::new(192, 168, 1, 255));

        for bad in ["192.168.1.0", "192.168.1.0/33", "192.168.1.0/", "192.168.1.0/2a", "/24"] {
            assert!(parse_cidr(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn contains_matches_prefix_comparison() {
        let cidrs = ["0.0.0.0/0", "10.0.0.0/8", "192.168.1.0/24", "203.0.113.0/29", "8.8.8.8/32"];
        let addrs = [
            Ipv4Addr::new(10, 1, 2, 3),
            Ipv4Addr::new(192, 168, 1, 10),
            Ipv4Addr::new(192, 168, 2, 10),
            Ipv4Addr::new(203, 0, 113, 7),
            Ipv4Addr::new(203, 0, 113, 8),
            Ipv4Addr::new(8, 8, 8, 8),
        ];
        for cidr in cidrs {
            let cidr = parse_cidr(cidr).unwrap();
            for addr in addrs {
                let expected = apply_mask(addr, cidr.mask()).network() == cidr.network();
                assert_eq!(contains(&cidr, addr), expected, "{cidr} / {addr}");
            }
        }
    }

    #[test]
    fn masks_must_be_contiguous() {
        assert_eq!(parse_mask("255.255.255.0").unwrap().prefix_len(), 24);
        assert_eq!(parse_mask("255.255.255.248").unwrap().prefix_len(), 29);
        assert_eq!(parse_mask("0.0.0.0").unwrap().prefix_len(), 0);
        assert_eq!(parse_mask("/16").unwrap().to_addr(), Ipv4Addr::new(255, 255, 0, 0));
        assert!(parse_mask("255.0.255.0").is_err());
        assert!(parse_mask("255.255.255.1").is_err());
        assert!(parse_mask("/40").is_err());
    }

    #[test]
    fn same_subnet_uses_the_given_mask() {
        let mask24 = parse_mask("255.255.255.0").unwrap();
        let mask16 = parse_mask("255.255.0.0").unwrap();
        let a = Ipv4Addr::new(192, 168, 1, 10);
        let b = Ipv4Addr::new(192, 168, 2, 1);
        assert!(!same_subnet(a, b, mask24));
        assert!(same_subnet(a, b, mask16));
    }

    #[test]
    fn cidr_serde_goes_through_the_parser() {
        let cidr: Ipv4Cidr = serde_json::from_str("\"10.1.2.3/8\"").unwrap();
        assert_eq!(cidr.to_string(), "10.0.0.0/8");
        assert_eq!(serde_json::to_string(&cidr).unwrap(), "\"10.0.0.0/8\"");
        assert!(serde_json::from_str::<Ipv4Cidr>("\"10.0.0.0/99\"").is_err());
    }
}
