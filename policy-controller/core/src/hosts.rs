//! Static host aliases.
//!
//! Some egress destinations (on-prem databases and the like) are not
//! resolvable by the FQDN policy controller. Those hosts are described in a
//! YAML alias file mapping each hostname to the IPs that back it:
//!
//! ```yaml
//! db-scan.example.com:
//!   ips: ["2.3.4.5", "6.7.8.9"]
//!   port: 1521
//!   scan:
//!     - db1-vip.example.com
//! ```
//!
//! The table is loaded once at startup and shared read-only afterwards.

use crate::{ip::IpTarget, ports::PortSpec};
use regex::Regex;
use serde::Deserialize;
use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
    sync::LazyLock,
};
use thiserror::Error;

const HOSTNAME_REGEX: &str =
    r"^[a-z0-9]([-a-z0-9]{0,61}[a-z0-9])?(\.[a-z0-9]([-a-z0-9]{0,61}[a-z0-9])?)+$";

const MAX_HOSTNAME_LEN: usize = 253;

static HOSTNAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(HOSTNAME_REGEX).expect("hostname regex must compile"));

/// A known host and the concrete addresses egress to it is allowed through.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostAlias {
    pub name: String,
    pub ips: BTreeSet<IpTarget>,

    /// The port the host is usually reached on. Informational only: the port
    /// requested in an allowlist always governs.
    pub port: PortSpec,

    /// Secondary hosts (e.g. database SCAN listeners) that clients of this
    /// host are redirected to.
    pub scan: Vec<String>,
}

/// An immutable lookup table of [`HostAlias`]es keyed by lowercased hostname.
#[derive(Clone, Debug, Default)]
pub struct AliasTable(BTreeMap<String, HostAlias>);

#[derive(Debug, Error)]
pub enum AliasError {
    #[error("failed to read host alias file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse host aliases: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("host alias {host:?} has an invalid name")]
    InvalidName { host: String },

    #[error("host alias {host:?} has an invalid IP {ip:?}")]
    InvalidIp { host: String, ip: String },

    #[error("host alias {host:?} has an invalid scan host {scan:?}")]
    InvalidScanHost { host: String, scan: String },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAlias {
    #[serde(default)]
    ips: Vec<String>,
    port: PortSpec,
    #[serde(default)]
    scan: Vec<String>,
}

/// Returns true if `host` is a lowercase, dot-separated DNS name with at
/// least two labels whose top-level label is not numeric.
pub fn is_valid_hostname(host: &str) -> bool {
    if host.len() > MAX_HOSTNAME_LEN || !HOSTNAME.is_match(host) {
        return false;
    }
    // Reject things like `999.1.1.1` that look like (invalid) addresses.
    host.rsplit('.')
        .next()
        .is_some_and(|tld| !tld.bytes().all(|b| b.is_ascii_digit()))
}

// === impl AliasTable ===

impl AliasTable {
    /// Reads and validates the alias file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, AliasError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|source| AliasError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let table = Self::from_yaml(&yaml)?;
        tracing::info!(path = %path.display(), aliases = table.len(), "Loaded host aliases");
        Ok(table)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, AliasError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }

        let raw: Option<BTreeMap<String, RawAlias>> = serde_yaml::from_str(yaml)?;
        raw.unwrap_or_default()
            .into_iter()
            .map(|(name, raw)| HostAlias::validate(name, raw).map(|a| (a.name.clone(), a)))
            .collect::<Result<BTreeMap<_, _>, _>>()
            .map(Self)
    }

    pub fn lookup(&self, host: &str) -> Option<&HostAlias> {
        self.0.get(host)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<HostAlias> for AliasTable {
    fn from_iter<T: IntoIterator<Item = HostAlias>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|alias| (alias.name.clone(), alias))
                .collect(),
        )
    }
}

// === impl HostAlias ===

impl HostAlias {
    fn validate(name: String, raw: RawAlias) -> Result<Self, AliasError> {
        let name = name.trim().to_ascii_lowercase();
        if !is_valid_hostname(&name) {
            return Err(AliasError::InvalidName { host: name });
        }

        let ips = raw
            .ips
            .into_iter()
            .map(|ip| {
                ip.trim().parse::<IpTarget>().map_err(|_| AliasError::InvalidIp {
                    host: name.clone(),
                    ip,
                })
            })
            .collect::<Result<BTreeSet<_>, _>>()?;

        let scan = raw
            .scan
            .into_iter()
            .map(|scan| {
                let scan = scan.trim().to_ascii_lowercase();
                if scan.parse::<IpTarget>().is_ok() || is_valid_hostname(&scan) {
                    Ok(scan)
                } else {
                    Err(AliasError::InvalidScanHost {
                        host: name.clone(),
                        scan,
                    })
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            name,
            ips,
            port: raw.port,
            scan,
        })
    }
}
