//! Builds the policy resources that enforce a resolved allowlist.
//!
//! Resolved allowlists are ordered maps, so the rules produced here are
//! always sorted by port and peers are sorted within each rule. Rebuilding a
//! policy from the same allowlist yields an identical object, which keeps
//! updates of existing policies free of spurious diffs.

use crate::k8s::{
    fqdn::{FqdnEgressRule, FqdnPeer, FqdnPort},
    FQDNNetworkPolicy, FqdnNetworkPolicySpec, IPBlock, IntOrString, LabelSelector, NetworkPolicy,
    NetworkPolicyEgressRule, NetworkPolicyPeer, NetworkPolicyPort, NetworkPolicySpec, ObjectMeta,
};
use egress_policy_controller_core::{IpTarget, Ipv4Net, Port, POLICY_CONTROLLER_NAME};
use std::collections::{BTreeMap, BTreeSet};

const EGRESS: &str = "Egress";
const TCP: &str = "TCP";
const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
const FQDN_SUFFIX: &str = "-fqdn";

/// The name of the `NetworkPolicy` managed for a pod.
pub fn ip_policy_name(pod: &str) -> String {
    pod.to_string()
}

/// The name of the `FQDNNetworkPolicy` managed for a pod. The FQDN policy
/// controller materializes a `NetworkPolicy` with this same name.
pub fn fqdn_policy_name(pod: &str) -> String {
    format!("{pod}{FQDN_SUFFIX}")
}

/// Builds a `NetworkPolicy` spec with one egress rule per port, or `None` if
/// there are no IP destinations.
pub fn ip_policy_spec(
    selector: &BTreeMap<String, String>,
    ips: &BTreeMap<Port, BTreeSet<IpTarget>>,
) -> Option<NetworkPolicySpec> {
    if ips.is_empty() {
        return None;
    }

    let egress = ips
        .iter()
        .map(|(port, targets)| {
            // Addresses and networks may collapse to the same CIDR.
            let nets = targets
                .iter()
                .map(|t| t.to_net())
                .collect::<BTreeSet<Ipv4Net>>();
            NetworkPolicyEgressRule {
                ports: Some(vec![NetworkPolicyPort {
                    port: Some(IntOrString::Int(port.get().into())),
                    protocol: Some(TCP.to_string()),
                    end_port: None,
                }]),
                to: Some(
                    nets.into_iter()
                        .map(|net| NetworkPolicyPeer {
                            ip_block: Some(IPBlock {
                                cidr: net.to_string(),
                                except: None,
                            }),
                            ..Default::default()
                        })
                        .collect(),
                ),
            }
        })
        .collect();

    Some(NetworkPolicySpec {
        // Newer API versions make the selector optional.
        pod_selector: label_selector(selector).into(),
        egress: Some(egress),
        policy_types: Some(vec![EGRESS.to_string()]),
        ..Default::default()
    })
}

/// Builds an `FQDNNetworkPolicy` spec with one egress rule per port, or
/// `None` if there are no hostname destinations.
pub fn fqdn_policy_spec(
    selector: &BTreeMap<String, String>,
    fqdns: &BTreeMap<Port, BTreeSet<String>>,
) -> Option<FqdnNetworkPolicySpec> {
    if fqdns.is_empty() {
        return None;
    }

    let egress = fqdns
        .iter()
        .map(|(port, hosts)| FqdnEgressRule {
            ports: vec![FqdnPort {
                port: port.get().into(),
                protocol: Some(TCP.to_string()),
            }],
            to: vec![FqdnPeer {
                fqdns: hosts.iter().cloned().collect(),
            }],
        })
        .collect();

    Some(FqdnNetworkPolicySpec {
        pod_selector: label_selector(selector),
        egress,
        policy_types: vec![EGRESS.to_string()],
    })
}

pub fn network_policy(namespace: &str, name: String, spec: NetworkPolicySpec) -> NetworkPolicy {
    NetworkPolicy {
        metadata: metadata(namespace, name),
        spec: Some(spec),
    }
}

pub fn fqdn_network_policy(
    namespace: &str,
    name: String,
    spec: FqdnNetworkPolicySpec,
) -> FQDNNetworkPolicy {
    FQDNNetworkPolicy {
        metadata: metadata(namespace, name),
        spec,
    }
}

fn metadata(namespace: &str, name: String) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: Some(namespace.to_string()),
        labels: Some(
            [(
                MANAGED_BY_LABEL.to_string(),
                POLICY_CONTROLLER_NAME.to_string(),
            )]
            .into(),
        ),
        ..Default::default()
    }
}

fn label_selector(selector: &BTreeMap<String, String>) -> LabelSelector {
    LabelSelector {
        match_labels: Some(selector.clone()),
        match_expressions: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use egress_policy_controller_core::{resolve, AliasTable};
    use maplit::btreemap;
    use pretty_assertions::assert_eq;

    fn selector() -> BTreeMap<String, String> {
        btreemap! {
            "dag_id".to_string() => "nightly".to_string(),
            "run_id".to_string() => "r1".to_string(),
            "task_id".to_string() => "extract".to_string(),
        }
    }

    #[test]
    fn empty_maps_build_nothing() {
        assert_eq!(ip_policy_spec(&selector(), &Default::default()), None);
        assert_eq!(fqdn_policy_spec(&selector(), &Default::default()), None);
    }

    #[test]
    fn ip_policy_rules() {
        let allow = resolve(
            "10.0.0.5:22,10.0.0.5/32:22,10.1.2.3/16:22,192.168.1.1:5432",
            &AliasTable::default(),
        )
        .unwrap();
        let spec = ip_policy_spec(&selector(), &allow.ip).unwrap();

        assert_eq!(spec.policy_types, Some(vec!["Egress".to_string()]));
        assert_eq!(
            serde_json::to_value(&spec).unwrap()["podSelector"]["matchLabels"],
            serde_json::to_value(selector()).unwrap(),
            "selector is carried verbatim"
        );

        let rules = spec.egress.unwrap();
        let summary = rules
            .iter()
            .map(|rule| {
                let port = match &rule.ports.as_ref().unwrap()[0].port {
                    Some(IntOrString::Int(port)) => *port,
                    port => panic!("unexpected port {port:?}"),
                };
                let cidrs = rule
                    .to
                    .iter()
                    .flatten()
                    .map(|peer| peer.ip_block.as_ref().unwrap().cidr.clone())
                    .collect::<Vec<_>>();
                (port, cidrs)
            })
            .collect::<Vec<_>>();
        assert_eq!(
            summary,
            vec![
                (22, vec!["10.0.0.5/32".to_string(), "10.1.0.0/16".to_string()]),
                (5432, vec!["192.168.1.1/32".to_string()]),
            ]
        );
    }

    #[test]
    fn fqdn_policy_rules() {
        let allow = resolve(
            "pypi.org,github.com,db.example.com:1521",
            &AliasTable::default(),
        )
        .unwrap();
        let spec = fqdn_policy_spec(&selector(), &allow.fqdn).unwrap();
        assert_eq!(
            spec.egress,
            vec![
                FqdnEgressRule {
                    ports: vec![FqdnPort {
                        port: 443,
                        protocol: Some("TCP".to_string()),
                    }],
                    to: vec![FqdnPeer {
                        fqdns: vec!["github.com".to_string(), "pypi.org".to_string()],
                    }],
                },
                FqdnEgressRule {
                    ports: vec![FqdnPort {
                        port: 1521,
                        protocol: Some("TCP".to_string()),
                    }],
                    to: vec![FqdnPeer {
                        fqdns: vec!["db.example.com".to_string()],
                    }],
                },
            ]
        );
    }

    #[test]
    fn synthesis_is_stable() {
        let aliases = AliasTable::default();
        let a = resolve("pypi.org,10.0.0.9:22,1.1.1.1:22,github.com:22", &aliases).unwrap();
        let b = resolve("github.com:22,1.1.1.1:22,10.0.0.9:22,pypi.org", &aliases).unwrap();

        let ip = |allow: &egress_policy_controller_core::ResolvedAllow| {
            let spec = ip_policy_spec(&selector(), &allow.ip).unwrap();
            serde_json::to_vec(&network_policy("ns", ip_policy_name("pod"), spec)).unwrap()
        };
        let fqdn = |allow: &egress_policy_controller_core::ResolvedAllow| {
            let spec = fqdn_policy_spec(&selector(), &allow.fqdn).unwrap();
            serde_json::to_vec(&fqdn_network_policy("ns", fqdn_policy_name("pod"), spec))
                .unwrap()
        };

        assert_eq!(ip(&a), ip(&b));
        assert_eq!(ip(&a), ip(&a));
        assert_eq!(fqdn(&a), fqdn(&b));
    }

    #[test]
    fn policy_metadata() {
        let policy = fqdn_network_policy(
            "ns-0",
            fqdn_policy_name("worker-1"),
            FqdnNetworkPolicySpec::default(),
        );
        assert_eq!(policy.metadata.name.as_deref(), Some("worker-1-fqdn"));
        assert_eq!(policy.metadata.namespace.as_deref(), Some("ns-0"));
        assert_eq!(
            policy.metadata.labels,
            Some(btreemap! {
                "app.kubernetes.io/managed-by".to_string() => "egress-policy-controller".to_string(),
            })
        );
        assert_eq!(ip_policy_name("worker-1"), "worker-1");
    }
}
