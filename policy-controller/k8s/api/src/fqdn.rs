//! The `FQDNNetworkPolicy` resource, owned by the GKE FQDN network policy
//! controller.
//!
//! The controller resolves the listed hostnames and materializes a regular
//! `NetworkPolicy` with the same name, which is what the confirmation watch
//! waits for. The resource's CRD is installed alongside that controller, so no
//! schema is generated here.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize)]
#[kube(
    group = "networking.gke.io",
    version = "v1alpha3",
    kind = "FQDNNetworkPolicy",
    plural = "fqdnnetworkpolicies",
    schema = "disabled",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct FqdnNetworkPolicySpec {
    pub pod_selector: LabelSelector,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub egress: Vec<FqdnEgressRule>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub policy_types: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct FqdnEgressRule {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<FqdnPort>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub to: Vec<FqdnPeer>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct FqdnPort {
    pub port: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct FqdnPeer {
    pub fqdns: Vec<String>,
}
