use super::*;
use crate::hosts::HostAlias;
use maplit::{btreemap, btreeset};
use pretty_assertions::assert_eq;

fn port(p: u16) -> Port {
    Port::new(p).unwrap()
}

fn ip(s: &str) -> IpTarget {
    s.parse().unwrap()
}

fn alias(name: &str, ips: &[&str], scan: &[&str]) -> HostAlias {
    HostAlias {
        name: name.to_string(),
        ips: ips.iter().map(|s| ip(s)).collect(),
        port: "443".parse().unwrap(),
        scan: scan.iter().map(ToString::to_string).collect(),
    }
}

fn no_aliases() -> AliasTable {
    AliasTable::default()
}

#[test]
fn empty_allowlist() {
    assert!(resolve("", &no_aliases()).unwrap().is_empty());
    assert!(resolve(" , ,", &no_aliases()).unwrap().is_empty());
}

#[test]
fn hostname_defaults_to_https() {
    assert_eq!(
        resolve("google.com", &no_aliases()).unwrap(),
        ResolvedAllow {
            ip: btreemap! {},
            fqdn: btreemap! { port(443) => btreeset! { "google.com".to_string() } },
        }
    );
}

#[test]
fn ip_with_port() {
    assert_eq!(
        resolve("123.123.123.123:22", &no_aliases()).unwrap(),
        ResolvedAllow {
            ip: btreemap! { port(22) => btreeset! { ip("123.123.123.123") } },
            fqdn: btreemap! {},
        }
    );
}

#[test]
fn cidr_entries_keep_their_prefix() {
    let allow = resolve("10.1.0.0/16:5432,https://10.2.0.0/24", &no_aliases()).unwrap();
    assert_eq!(
        allow.ip,
        btreemap! {
            port(443) => btreeset! { ip("10.2.0.0/24") },
            port(5432) => btreeset! { ip("10.1.0.0/16") },
        }
    );
}

#[test]
fn hostnames_are_lowercased() {
    let allow = resolve("Google.COM", &no_aliases()).unwrap();
    assert_eq!(
        allow.fqdn,
        btreemap! { port(443) => btreeset! { "google.com".to_string() } }
    );
}

#[test]
fn invalid_hosts_are_dropped() {
    let allow = resolve("localhost,under_score.example.com:80,999.1.1.1", &no_aliases()).unwrap();
    assert!(allow.is_empty(), "{allow:?}");
}

#[test]
fn scheme_and_path_are_ignored() {
    let allow = resolve(
        "https://github.com/org/repo,http://example.com:8080/index.html",
        &no_aliases(),
    )
    .unwrap();
    assert_eq!(
        allow.fqdn,
        btreemap! {
            port(443) => btreeset! { "github.com".to_string() },
            port(8080) => btreeset! { "example.com".to_string() },
        }
    );
}

#[test]
fn whitespace_is_ignored() {
    let allow = resolve(" pypi.org ,\n 10.0.0.5 : 22 ", &no_aliases()).unwrap();
    assert_eq!(
        allow,
        ResolvedAllow {
            ip: btreemap! { port(22) => btreeset! { ip("10.0.0.5") } },
            fqdn: btreemap! { port(443) => btreeset! { "pypi.org".to_string() } },
        }
    );
}

#[test]
fn hosts_sharing_a_port_are_grouped() {
    let allow = resolve(
        "google.com,db.example.com:5432,db2.example.com:5432,123.123.123.123:22,1.1.1.1:8080",
        &no_aliases(),
    )
    .unwrap();
    assert_eq!(
        allow,
        ResolvedAllow {
            ip: btreemap! {
                port(22) => btreeset! { ip("123.123.123.123") },
                port(8080) => btreeset! { ip("1.1.1.1") },
            },
            fqdn: btreemap! {
                port(443) => btreeset! { "google.com".to_string() },
                port(5432) => btreeset! {
                    "db.example.com".to_string(),
                    "db2.example.com".to_string(),
                },
            },
        }
    );
}

#[test]
fn aliased_hosts_resolve_to_ips() {
    let aliases = AliasTable::from_iter([alias("db.alias.example", &["1.2.3.4"], &[])]);
    assert_eq!(
        resolve("db.alias.example:5432", &aliases).unwrap(),
        ResolvedAllow {
            ip: btreemap! { port(5432) => btreeset! { ip("1.2.3.4") } },
            fqdn: btreemap! {},
        }
    );
}

#[test]
fn port_ranges_expand() {
    let aliases = AliasTable::from_iter([alias("host.example", &["9.9.9.9"], &[])]);
    let allow = resolve("host.example:6005-6010", &aliases).unwrap();
    assert!(allow.fqdn.is_empty());
    assert_eq!(
        allow.ip,
        (6005..=6010)
            .map(|p| (port(p), btreeset! { ip("9.9.9.9") }))
            .collect::<BTreeMap<_, _>>()
    );
}

#[test]
fn port_lists_continue_across_commas() {
    let allow = resolve("db.example.com:1521,1522,1600-1601,pypi.org", &no_aliases()).unwrap();
    let db = btreeset! { "db.example.com".to_string() };
    assert_eq!(
        allow.fqdn,
        btreemap! {
            port(443) => btreeset! { "pypi.org".to_string() },
            port(1521) => db.clone(),
            port(1522) => db.clone(),
            port(1600) => db.clone(),
            port(1601) => db,
        }
    );

    // Without an explicit port to extend, a bare number is just an invalid host.
    assert!(resolve("google.com,22", &no_aliases())
        .unwrap()
        .fqdn
        .keys()
        .eq([&port(443)]));
}

#[test]
fn malformed_ports_fail_the_whole_allowlist() {
    for raw in [
        "google.com,pypi.org:https",
        "pypi.org:0",
        "pypi.org:70000",
        "pypi.org:10-1",
        "pypi.org:",
        "pypi.org:22,2-",
    ] {
        let error = resolve(raw, &no_aliases()).expect_err(raw);
        assert!(error.entry.contains("pypi.org"), "{raw}: {error}");
    }
}

#[test]
fn scan_hosts_expand_one_level() {
    let aliases = AliasTable::from_iter([
        alias(
            "db-scan.example.com",
            &["2.3.4.5", "6.7.8.9"],
            &["db1-vip.example.com", "db2-vip.example.com", "14.15.16.17"],
        ),
        alias("db1-vip.example.com", &["10.0.0.1"], &["db3-vip.example.com"]),
        alias("db3-vip.example.com", &["10.0.0.3"], &[]),
    ]);

    let allow = resolve("db-scan.example.com:1521", &aliases).unwrap();
    assert_eq!(
        allow,
        ResolvedAllow {
            ip: btreemap! {
                port(1521) => btreeset! {
                    ip("2.3.4.5"),
                    ip("6.7.8.9"),
                    ip("10.0.0.1"),
                    ip("14.15.16.17"),
                },
            },
            fqdn: btreemap! {
                port(1521) => btreeset! { "db2-vip.example.com".to_string() },
            },
        },
        "db3-vip is only reachable through two levels and must not appear"
    );
}

#[test]
fn self_referencing_aliases_terminate() {
    let aliases = AliasTable::from_iter([
        alias("a.example.com", &["1.1.1.1"], &["b.example.com"]),
        alias("b.example.com", &["2.2.2.2"], &["a.example.com"]),
    ]);
    let allow = resolve("a.example.com", &aliases).unwrap();
    assert_eq!(
        allow.ip,
        btreemap! { port(443) => btreeset! { ip("1.1.1.1"), ip("2.2.2.2") } }
    );
}

#[test]
fn resolution_is_deterministic() {
    let aliases = AliasTable::from_iter([alias("db.example.com", &["3.3.3.3", "1.1.1.1"], &[])]);
    let a = resolve("z.example.com,a.example.com,db.example.com:1521,10.0.0.9:22", &aliases).unwrap();
    let b = resolve("10.0.0.9:22,db.example.com:1521,a.example.com,z.example.com", &aliases).unwrap();
    assert_eq!(a, b);
    assert_eq!(
        serde_json::to_string(&a).unwrap(),
        serde_json::to_string(&b).unwrap()
    );
    assert_eq!(
        serde_json::to_string(&a).unwrap(),
        r#"{"ip":{"22":["10.0.0.9"],"1521":["1.1.1.1","3.3.3.3"]},"fqdn":{"443":["a.example.com","z.example.com"]}}"#
    );
}

#[test]
fn parses_entries() {
    assert_eq!(
        entries("pypi.org,10.0.0.5:22,db.example.com:1521,1522").unwrap(),
        vec![
            Entry {
                host: "pypi.org".to_string(),
                ports: None,
            },
            Entry {
                host: "10.0.0.5".to_string(),
                ports: Some("22".parse().unwrap()),
            },
            Entry {
                host: "db.example.com".to_string(),
                ports: Some("1521,1522".parse().unwrap()),
            },
        ]
    );
}
