use serde::{Deserialize, Serialize};
use std::{fmt, num::NonZeroU16, str::FromStr};
use thiserror::Error;

/// A TCP port that egress may be allowed to.
pub type Port = NonZeroU16;

/// The port used when an allowlist entry does not name one.
pub const DEFAULT_PORT: Port = match NonZeroU16::new(443) {
    Some(port) => port,
    None => panic!("443 is not zero"),
};

/// A port specification: a single port, an inclusive range, or a
/// comma-separated list of either.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PortSpec {
    Single(Port),
    Range(Port, Port),
    List(Vec<PortSpec>),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortError {
    #[error("port specification is empty")]
    Empty,

    #[error("invalid port {value:?}: {source}")]
    Invalid {
        value: String,
        #[source]
        source: std::num::ParseIntError,
    },

    #[error("port range must be increasing: {floor}-{ceil}")]
    Decreasing { floor: Port, ceil: Port },
}

// === impl PortSpec ===

impl PortSpec {
    /// Iterates over every port covered by the specification, in the order
    /// they were written.
    pub fn ports(&self) -> Box<dyn Iterator<Item = Port> + '_> {
        match self {
            Self::Single(port) => Box::new(std::iter::once(*port)),
            Self::Range(floor, ceil) => Box::new(
                (u16::from(*floor)..=u16::from(*ceil)).filter_map(NonZeroU16::new),
            ),
            Self::List(specs) => Box::new(specs.iter().flat_map(|s| s.ports())),
        }
    }

    /// Appends `other` to this specification, producing a list.
    pub fn extend(self, other: PortSpec) -> PortSpec {
        let mut specs = match self {
            Self::List(specs) => specs,
            spec => vec![spec],
        };
        match other {
            Self::List(more) => specs.extend(more),
            spec => specs.push(spec),
        }
        Self::List(specs)
    }

    fn parse_item(s: &str) -> Result<Self, PortError> {
        match s.split_once('-') {
            None => parse_port(s).map(Self::Single),
            Some((floor, ceil)) => {
                let floor = parse_port(floor)?;
                let ceil = parse_port(ceil)?;
                if floor > ceil {
                    return Err(PortError::Decreasing { floor, ceil });
                }
                Ok(Self::Range(floor, ceil))
            }
        }
    }
}

fn parse_port(s: &str) -> Result<Port, PortError> {
    let s = s.trim();
    s.parse().map_err(|source| PortError::Invalid {
        value: s.to_string(),
        source,
    })
}

impl FromStr for PortSpec {
    type Err = PortError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(PortError::Empty);
        }

        if !s.contains(',') {
            return Self::parse_item(s);
        }

        s.split(',')
            .map(Self::parse_item)
            .collect::<Result<Vec<_>, _>>()
            .map(Self::List)
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single(port) => fmt::Display::fmt(port, f),
            Self::Range(floor, ceil) => write!(f, "{floor}-{ceil}"),
            Self::List(specs) => {
                for (i, spec) in specs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    fmt::Display::fmt(spec, f)?;
                }
                Ok(())
            }
        }
    }
}

impl From<Port> for PortSpec {
    fn from(port: Port) -> Self {
        Self::Single(port)
    }
}

impl<'de> Deserialize<'de> for PortSpec {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Host alias files write ports both as bare integers and as strings.
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        let raw = match Raw::deserialize(deserializer)? {
            Raw::Number(n) => n.to_string(),
            Raw::Text(s) => s,
        };
        raw.parse().map_err(serde::de::Error::custom)
    }
}

impl Serialize for PortSpec {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
