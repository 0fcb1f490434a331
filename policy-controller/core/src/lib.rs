#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod allowlist;
pub mod hosts;
mod ip;
pub mod ports;
pub mod workload;

pub use self::{
    allowlist::{resolve, ResolveError, ResolvedAllow},
    hosts::{AliasError, AliasTable, HostAlias},
    ip::{InvalidIpTarget, IpTarget},
    ports::{Port, PortError, PortSpec, DEFAULT_PORT},
    workload::Workload,
};
pub use ipnet::Ipv4Net;

pub const POLICY_CONTROLLER_NAME: &str = "egress-policy-controller";
