//! Resolution of allowlist annotations into per-port egress destinations.
//!
//! An allowlist is a comma-separated list of `host[:ports]` entries, e.g.
//! `pypi.org,https://github.com/org,10.0.0.5:22,db.example.com:1521,1522`.
//! Each entry resolves to either IP destinations (IPv4 literals and hosts
//! known to the [`AliasTable`]) or FQDN destinations (everything else that
//! looks like a hostname).

use crate::{
    hosts::{is_valid_hostname, AliasTable, HostAlias},
    ip::IpTarget,
    ports::{Port, PortError, PortSpec, DEFAULT_PORT},
};
use serde::Serialize;
use std::{
    collections::{BTreeMap, BTreeSet},
    net::Ipv4Addr,
};
use thiserror::Error;

/// One parsed allowlist entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub host: String,
    pub ports: Option<PortSpec>,
}

/// Egress destinations keyed by port.
///
/// Ordered maps and sets keep iteration (and therefore any policy built from
/// this) independent of the order entries were written in.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ResolvedAllow {
    pub ip: BTreeMap<Port, BTreeSet<IpTarget>>,
    pub fqdn: BTreeMap<Port, BTreeSet<String>>,
}

#[derive(Debug, Error)]
#[error("invalid port in allowlist entry {entry:?}: {source}")]
pub struct ResolveError {
    pub entry: String,
    #[source]
    pub source: PortError,
}

/// Splits a raw allowlist into entries.
///
/// Whitespace is ignored. Port lists continue across commas: a token made up
/// only of digits and dashes extends the explicit ports of the entry before
/// it, so `db.example.com:1521,1522` is a single entry.
pub fn entries(raw: &str) -> Result<Vec<Entry>, ResolveError> {
    let raw = raw
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>();

    let mut entries = Vec::<Entry>::new();
    for token in raw.split(',').filter(|t| !t.is_empty()) {
        if is_port_continuation(token) {
            if let Some(prev) = entries.last_mut().filter(|e| e.ports.is_some()) {
                let more = token.parse::<PortSpec>().map_err(|source| ResolveError {
                    entry: format!("{}:{token}", prev.host),
                    source,
                })?;
                prev.ports = prev.ports.take().map(|p| p.extend(more));
                continue;
            }
        }

        let (host, port) = split_entry(token);
        let ports = port
            .map(str::parse::<PortSpec>)
            .transpose()
            .map_err(|source| ResolveError {
                entry: token.to_string(),
                source,
            })?;
        entries.push(Entry {
            host: host.to_string(),
            ports,
        });
    }

    Ok(entries)
}

/// Resolves a raw allowlist against the host alias table.
///
/// Any malformed port fails the whole allowlist. Hosts that are neither IPv4
/// literals, aliases, nor valid hostnames are dropped.
pub fn resolve(raw: &str, aliases: &AliasTable) -> Result<ResolvedAllow, ResolveError> {
    let mut allow = ResolvedAllow::default();

    for Entry { host, ports } in entries(raw)? {
        let ports = match ports {
            Some(spec) => spec.ports().collect::<Vec<_>>(),
            None => vec![DEFAULT_PORT],
        };
        let host = host.to_ascii_lowercase();

        if let Ok(ip) = host.parse::<IpTarget>() {
            allow.add_ip(&ports, Some(ip));
        } else if let Some(alias) = aliases.lookup(&host) {
            allow.add_alias(&ports, alias, aliases);
        } else if is_valid_hostname(&host) {
            allow.add_fqdn(&ports, &host);
        } else {
            tracing::debug!(%host, "Ignoring invalid allowlist host");
        }
    }

    Ok(allow)
}

fn is_port_continuation(token: &str) -> bool {
    token.bytes().all(|b| b.is_ascii_digit() || b == b'-')
}

/// Separates an entry into its host and optional port specification,
/// discarding any URL scheme and path.
fn split_entry(token: &str) -> (&str, Option<&str>) {
    let token = token
        .split_once("//")
        .map(|(_, rest)| rest)
        .unwrap_or(token);

    let authority = strip_path(token);
    match authority.rsplit_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (authority, None),
    }
}

fn strip_path(token: &str) -> &str {
    for (i, _) in token.match_indices('/') {
        let head = &token[..i];
        // A slash right after an address introduces a prefix length.
        if head.parse::<Ipv4Addr>().is_ok() {
            continue;
        }
        return head;
    }
    token
}

// === impl ResolvedAllow ===

impl ResolvedAllow {
    pub fn is_empty(&self) -> bool {
        self.ip.is_empty() && self.fqdn.is_empty()
    }

    fn add_ip(&mut self, ports: &[Port], ips: impl IntoIterator<Item = IpTarget> + Clone) {
        for port in ports {
            self.ip.entry(*port).or_default().extend(ips.clone());
        }
    }

    fn add_fqdn(&mut self, ports: &[Port], host: &str) {
        for port in ports {
            self.fqdn
                .entry(*port)
                .or_default()
                .insert(host.to_string());
        }
    }

    /// Adds an alias's IPs and expands its scan hosts exactly one level: a
    /// scan host that is itself an alias contributes its IPs, but its own scan
    /// hosts are not followed.
    fn add_alias(&mut self, ports: &[Port], alias: &HostAlias, aliases: &AliasTable) {
        self.add_ip(ports, alias.ips.iter().copied());

        for scan in &alias.scan {
            if let Ok(ip) = scan.parse::<IpTarget>() {
                self.add_ip(ports, Some(ip));
            } else if let Some(scan_alias) = aliases.lookup(scan) {
                self.add_ip(ports, scan_alias.ips.iter().copied());
            } else if is_valid_hostname(scan) {
                self.add_fqdn(ports, scan);
            } else {
                tracing::debug!(alias = %alias.name, %scan, "Ignoring invalid scan host");
            }
        }
    }
}

#[cfg(test)]
mod tests;
