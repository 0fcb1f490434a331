#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod fqdn;

pub use self::fqdn::{FQDNNetworkPolicy, FqdnNetworkPolicySpec};
pub use k8s_openapi::{
    api::{
        self,
        core::v1::{Pod, PodSpec, PodStatus},
        networking::v1::{
            IPBlock, NetworkPolicy, NetworkPolicyEgressRule, NetworkPolicyPeer,
            NetworkPolicyPort, NetworkPolicySpec,
        },
    },
    apimachinery::{
        self,
        pkg::{apis::meta::v1::{LabelSelector, Time}, util::intstr::IntOrString},
    },
};
pub use kube::{
    api::{Api, DeleteParams, ObjectMeta, PostParams, ResourceExt},
    core::ErrorResponse,
    Client, Error, Resource,
};
