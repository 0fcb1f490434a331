use ipnet::Ipv4Net;
use serde::{Serialize, Serializer};
use std::{fmt, net::Ipv4Addr, str::FromStr};

/// An IPv4 egress destination, as written in an allowlist or host alias.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IpTarget {
    Addr(Ipv4Addr),
    Net(Ipv4Net),
}

#[derive(Debug, thiserror::Error)]
#[error("not an IPv4 address or network: {0:?}")]
pub struct InvalidIpTarget(String);

// === impl IpTarget ===

impl IpTarget {
    /// Returns the network covered by this target. Addresses are widened to a
    /// single-address network and networks drop any host bits.
    pub fn to_net(self) -> Ipv4Net {
        match self {
            Self::Addr(addr) => Ipv4Net::from(addr),
            Self::Net(net) => net.trunc(),
        }
    }
}

impl FromStr for IpTarget {
    type Err = InvalidIpTarget;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.contains('/') {
            return s
                .parse()
                .map(Self::Net)
                .map_err(|_| InvalidIpTarget(s.to_string()));
        }
        s.parse()
            .map(Self::Addr)
            .map_err(|_| InvalidIpTarget(s.to_string()))
    }
}

impl fmt::Display for IpTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Addr(addr) => fmt::Display::fmt(addr, f),
            Self::Net(net) => fmt::Display::fmt(net, f),
        }
    }
}

impl Serialize for IpTarget {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_addresses_and_networks() {
        assert_eq!(
            "10.0.0.5".parse::<IpTarget>().unwrap().to_net().to_string(),
            "10.0.0.5/32"
        );
        assert_eq!(
            "10.1.2.3/16".parse::<IpTarget>().unwrap().to_net().to_string(),
            "10.1.0.0/16"
        );
        assert_eq!(
            "10.1.2.3/16".parse::<IpTarget>().unwrap().to_string(),
            "10.1.2.3/16",
            "display keeps the written form"
        );

        for invalid in ["", "example.com", "256.1.1.1", "1.2.3", "1.2.3.4/33", "::1"] {
            assert!(invalid.parse::<IpTarget>().is_err(), "{invalid}");
        }
    }
}
