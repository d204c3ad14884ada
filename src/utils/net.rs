//! CIDR arithmetic used by IPAM, ACL validation and bootstrap.

use std::fmt;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;
use std::str::FromStr;

use rand::Rng;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;

use crate::Error;
use crate::Result;

/// An address with a prefix length, e.g. `10.0.0.1/32` or `fd00::/48`.
///
/// The address is kept as written; [`IpPrefix::network`] masks it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IpPrefix {
    addr: IpAddr,
    bits: u8,
}

impl IpPrefix {
    pub fn new(
        addr: IpAddr,
        bits: u8,
    ) -> Result<Self> {
        let max = max_bits(&addr);
        if bits > max {
            return Err(Error::InvalidArgument(format!(
                "prefix length {} exceeds {} for {}",
                bits, max, addr
            )));
        }
        Ok(Self { addr, bits })
    }

    /// Single-host prefix (/32 or /128) for `addr`.
    pub fn host(addr: IpAddr) -> Self {
        Self {
            addr,
            bits: max_bits(&addr),
        }
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn bits(&self) -> u8 {
        self.bits
    }

    pub fn is_ipv4(&self) -> bool {
        self.addr.is_ipv4()
    }

    pub fn is_ipv6(&self) -> bool {
        self.addr.is_ipv6()
    }

    /// The address with all host bits cleared.
    pub fn network(&self) -> IpAddr {
        match self.addr {
            IpAddr::V4(v4) => IpAddr::V4(Ipv4Addr::from(u32::from(v4) & v4_mask(self.bits))),
            IpAddr::V6(v6) => IpAddr::V6(Ipv6Addr::from(u128::from(v6) & v6_mask(self.bits))),
        }
    }

    pub fn contains(
        &self,
        ip: &IpAddr,
    ) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = v4_mask(self.bits);
                u32::from(net) & mask == u32::from(*ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = v6_mask(self.bits);
                u128::from(net) & mask == u128::from(*ip) & mask
            }
            _ => false,
        }
    }

    /// True when both prefixes share at least one address.
    pub fn overlaps(
        &self,
        other: &IpPrefix,
    ) -> bool {
        if self.is_ipv4() != other.is_ipv4() {
            return false;
        }
        if self.bits <= other.bits {
            self.contains(&other.addr)
        } else {
            other.contains(&self.addr)
        }
    }
}

impl fmt::Display for IpPrefix {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.bits)
    }
}

impl FromStr for IpPrefix {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, bits) = s
            .split_once('/')
            .ok_or_else(|| Error::InvalidArgument(format!("no '/' in prefix {:?}", s)))?;
        let addr = addr
            .parse::<IpAddr>()
            .map_err(|e| Error::InvalidArgument(format!("parse prefix {:?}: {}", s, e)))?;
        let bits = bits
            .parse::<u8>()
            .map_err(|e| Error::InvalidArgument(format!("parse prefix length {:?}: {}", s, e)))?;
        IpPrefix::new(addr, bits)
    }
}

impl Serialize for IpPrefix {
    fn serialize<S: Serializer>(
        &self,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for IpPrefix {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

fn max_bits(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

fn v4_mask(bits: u8) -> u32 {
    if bits == 0 {
        0
    } else {
        u32::MAX << (32 - bits as u32)
    }
}

fn v6_mask(bits: u8) -> u128 {
    if bits == 0 {
        0
    } else {
        u128::MAX << (128 - bits as u32)
    }
}

/// First free /32 in `cidr`, scanning upwards from the network address + 1.
///
/// `is_taken` decides whether a candidate is already allocated or reserved.
pub fn next_ipv4<F>(
    cidr: &IpPrefix,
    is_taken: F,
) -> Result<IpPrefix>
where
    F: Fn(&IpPrefix) -> bool,
{
    let IpAddr::V4(network) = cidr.network() else {
        return Err(Error::InvalidArgument(format!("{} is not an IPv4 prefix", cidr)));
    };
    let start = u32::from(network) as u64;
    let end = start + (1u64 << (32 - cidr.bits() as u32));

    let mut current = start + 1;
    while current < end {
        let candidate = IpPrefix::host(IpAddr::V4(Ipv4Addr::from(current as u32)));
        if !is_taken(&candidate) {
            return Ok(candidate);
        }
        current += 1;
    }
    Err(Error::Exhausted(cidr.to_string()))
}

/// Random /64 inside a /48: a uniformly random 16-bit subnet id written into
/// bits 48..64.
pub fn random64<R: Rng + ?Sized>(
    prefix: &IpPrefix,
    rng: &mut R,
) -> Result<IpPrefix> {
    let IpAddr::V6(network) = prefix.network() else {
        return Err(Error::InvalidArgument("prefix must be IPv6".to_string()));
    };
    if prefix.bits() != 48 {
        return Err(Error::InvalidArgument("prefix must be /48".to_string()));
    }
    let mut octets = network.octets();
    let subnet: u16 = rng.gen();
    octets[6..8].copy_from_slice(&subnet.to_be_bytes());
    IpPrefix::new(IpAddr::V6(Ipv6Addr::from(octets)), 64)
}

/// RFC 4193 unique local /48: `fd` followed by a 40-bit random global id.
pub fn generate_ula<R: Rng + ?Sized>(rng: &mut R) -> IpPrefix {
    let mut octets = [0u8; 16];
    octets[0] = 0xfd;
    rng.fill(&mut octets[1..6]);
    IpPrefix {
        addr: IpAddr::V6(Ipv6Addr::from(octets)),
        bits: 48,
    }
}
