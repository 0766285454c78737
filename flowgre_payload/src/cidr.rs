//! IPv4 CIDR ranges used to bound synthetic flow addresses.

use std::{fmt, net::Ipv4Addr, str::FromStr};

use rand::Rng;
use serde::Deserialize;

/// Errors produced when parsing a CIDR range
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Input was not of the form `a.b.c.d/len`
    #[error("'{0}' is not in a.b.c.d/len form")]
    Format(String),
    /// Address part did not parse
    #[error("'{0}' is not an IPv4 address")]
    Address(String),
    /// Prefix length was not a number in 0..=32
    #[error("'{0}' is not a prefix length between 0 and 32")]
    Prefix(String),
}

/// An IPv4 network in CIDR notation.
///
/// The stored address is always the network address, host bits are
/// cleared on parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub struct Ipv4Cidr {
    network: Ipv4Addr,
    prefix_len: u8,
}

impl Ipv4Cidr {
    /// Build a range from an address and prefix length, clearing host bits.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Prefix`] when `prefix_len` exceeds 32.
    pub fn new(addr: Ipv4Addr, prefix_len: u8) -> Result<Self, Error> {
        if prefix_len > 32 {
            return Err(Error::Prefix(prefix_len.to_string()));
        }
        let network = Ipv4Addr::from(u32::from(addr) & mask(prefix_len));
        Ok(Self {
            network,
            prefix_len,
        })
    }

    /// The network address of this range.
    #[must_use]
    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    /// The broadcast, or last, address of this range.
    #[must_use]
    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) | !mask(self.prefix_len))
    }

    /// Prefix length, 0 through 32.
    #[must_use]
    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Whether `addr` falls inside this range.
    #[must_use]
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & mask(self.prefix_len) == u32::from(self.network)
    }

    /// Draw an address uniformly from the range, network and broadcast
    /// addresses included.
    pub fn sample<R>(&self, rng: &mut R) -> Ipv4Addr
    where
        R: Rng + ?Sized,
    {
        let first = u32::from(self.network);
        let last = u32::from(self.broadcast());
        Ipv4Addr::from(rng.random_range(first..=last))
    }
}

fn mask(prefix_len: u8) -> u32 {
    // shifting a u32 by 32 overflows
    u32::MAX.checked_shl(32 - u32::from(prefix_len)).unwrap_or(0)
}

impl FromStr for Ipv4Cidr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, len) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| Error::Format(s.to_string()))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| Error::Address(addr.to_string()))?;
        let prefix_len: u8 = len.parse().map_err(|_| Error::Prefix(len.to_string()))?;
        Self::new(addr, prefix_len)
    }
}

impl TryFrom<String> for Ipv4Cidr {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use proptest::prelude::*;
    use rand::{SeedableRng, rngs::SmallRng};

    use super::{Error, Ipv4Cidr};

    #[test]
    fn parse_clears_host_bits() {
        let cidr: Ipv4Cidr = "10.1.2.3/8".parse().expect("valid cidr");
        assert_eq!(cidr.network(), Ipv4Addr::new(10, 0, 0, 0));
        assert_eq!(cidr.broadcast(), Ipv4Addr::new(10, 255, 255, 255));
        assert_eq!(cidr.to_string(), "10.0.0.0/8");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(matches!("10.0.0.0".parse::<Ipv4Cidr>(), Err(Error::Format(_))));
        assert!(matches!("10.0.0/8".parse::<Ipv4Cidr>(), Err(Error::Address(_))));
        assert!(matches!("10.0.0.0/33".parse::<Ipv4Cidr>(), Err(Error::Prefix(_))));
        assert!(matches!("10.0.0.0/x".parse::<Ipv4Cidr>(), Err(Error::Prefix(_))));
    }

    #[test]
    fn host_route_always_samples_itself() {
        let cidr: Ipv4Cidr = "192.168.7.9/32".parse().expect("valid cidr");
        let mut rng = SmallRng::seed_from_u64(7);
        for _ in 0..64 {
            assert_eq!(cidr.sample(&mut rng), Ipv4Addr::new(192, 168, 7, 9));
        }
    }

    #[test]
    fn two_address_range_reaches_both_ends() {
        let cidr: Ipv4Cidr = "172.16.0.0/31".parse().expect("valid cidr");
        let mut rng = SmallRng::seed_from_u64(11);
        let mut seen = [false; 2];
        for _ in 0..256 {
            let addr = cidr.sample(&mut rng);
            seen[usize::from(addr.octets()[3])] = true;
        }
        assert_eq!(seen, [true, true]);
    }

    proptest! {
        #[test]
        fn sample_stays_in_range(seed: u64, addr: u32, prefix_len in 0u8..=32) {
            let cidr = Ipv4Cidr::new(Ipv4Addr::from(addr), prefix_len).expect("prefix in range");
            let mut rng = SmallRng::seed_from_u64(seed);
            for _ in 0..16 {
                let sampled = cidr.sample(&mut rng);
                prop_assert!(cidr.contains(sampled), "{sampled} outside {cidr}");
            }
        }

        #[test]
        fn display_parses_back(addr: u32, prefix_len in 0u8..=32) {
            let cidr = Ipv4Cidr::new(Ipv4Addr::from(addr), prefix_len).expect("prefix in range");
            let reparsed: Ipv4Cidr = cidr.to_string().parse().expect("display output parses");
            prop_assert_eq!(cidr, reparsed);
        }
    }
}
