#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use egress_policy_controller_core as core;
pub use egress_policy_controller_k8s_api as k8s;
pub use egress_policy_controller_k8s_reconcile as reconcile;

mod admission;
mod args;
mod stats;

pub use self::args::Args;
