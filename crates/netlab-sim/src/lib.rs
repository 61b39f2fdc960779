#![forbid(unsafe_code)]

//! Deterministic IPv4 sandbox for teaching routing, NAT and firewalling.
//!
//! A [`Topology`] is loaded from a scenario document, edited through validated `commit_*` calls,
//! and queried with [`forward`] or the terminal-style commands in [`shell`].

pub mod addr;
pub mod firewall;
pub mod forward;
pub mod nat;
pub mod packet;
pub mod route;
pub mod scenario;
pub mod shell;
pub mod topology;

pub use addr::{AddrError, Ipv4Cidr, Netmask};
pub use firewall::{evaluate, FirewallRule, RuleAction, RuleProtocol, Verdict};
pub use forward::{forward, forward_with, ForwardResult, HopAction, HopRecord, ProbeKind, SimConfig};
pub use nat::{translate, SnatRule, Translation};
pub use packet::{Packet, Protocol};
pub use route::{resolve, Route};
pub use scenario::ScenarioError;
pub use shell::{exec, exec_line};
pub use topology::{Device, InterfaceConfig, StaticRoute, Topology, TopologyError, ValidationError};
