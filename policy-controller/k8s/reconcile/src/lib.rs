#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod metrics;
mod reconcile;
pub mod stats;
mod store;
pub mod synth;

pub use self::{
    metrics::Metrics,
    reconcile::{
        AdmissionEvent, Decision, Operation, Params, Phase, PodSnapshot, ReconcileError,
        Reconciler,
    },
    store::{KubeStore, PolicyStore, StoreError},
};
pub use egress_policy_controller_k8s_api as k8s;
