#![forbid(unsafe_code)]

//! Scenario documents.
//!
//! A scenario is loaded once per session. Everything that would otherwise blow up mid-simulation
//! (dangling subnet names, gateways outside their subnet, duplicate ids or addresses, rules naming
//! interfaces that do not exist) is rejected here.

use core::net::Ipv4Addr;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::addr::{Ipv4Cidr, Netmask};
use crate::firewall::FirewallRule;
use crate::nat::SnatRule;
use crate::topology::{
    Device, Firewall, Host, Interface, InterfaceConfig, Internet, Router, Service, StaticRoute,
    Subnet, Topology, ValidationError, HOST_INTERFACE, INTERNET_ID,
};

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("invalid json: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("failed to read scenario {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("subnet {name:?}: gateway {gateway} is outside {cidr}")]
    GatewayOutsideSubnet {
        name: String,
        gateway: Ipv4Addr,
        cidr: Ipv4Cidr,
    },
    #[error("scenario must define at least one subnet")]
    NoSubnets,
    #[error("duplicate device id: {0}")]
    DuplicateId(String),
    #[error("device id {0:?} is reserved")]
    ReservedId(String),
    #[error("device {device:?} is attached to unknown subnet {subnet:?}")]
    UnknownSubnet { device: String, subnet: String },
    #[error("device {device:?}: {source}")]
    InvalidDevice {
        device: String,
        #[source]
        source: ValidationError,
    },
}

#[derive(Debug, Deserialize)]
struct ScenarioDoc {
    subnets: BTreeMap<String, SubnetDoc>,
    devices: DevicesDoc,
    internet: InternetDoc,
}

#[derive(Debug, Deserialize)]
struct SubnetDoc {
    cidr: Ipv4Cidr,
    #[serde(alias = "gateway")]
    gw: Ipv4Addr,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DevicesDoc {
    #[serde(default)]
    routers: Vec<RouterDoc>,
    #[serde(default)]
    firewalls: Vec<FirewallDoc>,
    /// Hosts grouped by the subnet they are cabled to.
    #[serde(default)]
    hosts: BTreeMap<String, Vec<HostDoc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct InterfaceDoc {
    address: Ipv4Addr,
    mask: Netmask,
    #[serde(default)]
    gateway: Option<Ipv4Addr>,
    /// Subnet the interface is cabled to; defaults to the interface name.
    #[serde(default)]
    subnet: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RouterDoc {
    id: String,
    interfaces: BTreeMap<String, InterfaceDoc>,
    #[serde(default)]
    routes: Vec<StaticRoute>,
    #[serde(default)]
    uplink: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct FirewallDoc {
    id: String,
    interfaces: BTreeMap<String, InterfaceDoc>,
    #[serde(default)]
    routes: Vec<StaticRoute>,
    #[serde(default)]
    nat: Vec<SnatRule>,
    #[serde(default)]
    rules: Vec<FirewallRule>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct HostDoc {
    id: String,
    /// Absent for hosts the learner still has to configure.
    #[serde(default)]
    address: Option<Ipv4Addr>,
    /// Defaults to the mask of the host's subnet.
    #[serde(default)]
    mask: Option<Netmask>,
    #[serde(default)]
    gateway: Option<Ipv4Addr>,
    #[serde(default)]
    services: Vec<Service>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct InternetDoc {
    ping_target: Ipv4Addr,
    http_host: String,
    #[serde(default)]
    dns: BTreeMap<String, Ipv4Addr>,
    #[serde(default)]
    dns_server: Option<Ipv4Addr>,
}

pub fn parse_str(json: &str) -> Result<Topology, ScenarioError> {
    let doc: ScenarioDoc = serde_json::from_str(json)?;
    build(doc)
}

pub fn load(path: &Path) -> Result<Topology, ScenarioError> {
    let json = std::fs::read_to_string(path).map_err(|source| ScenarioError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let topology = parse_str(&json)?;
    tracing::info!(path = %path.display(), devices = topology.devices().count(), "scenario loaded");
    Ok(topology)
}

fn build(doc: ScenarioDoc) -> Result<Topology, ScenarioError> {
    if doc.subnets.is_empty() {
        return Err(ScenarioError::NoSubnets);
    }
    let mut subnets = BTreeMap::new();
    for (name, s) in doc.subnets {
        let subnet = Subnet::new(s.cidr, s.gw).ok_or_else(|| ScenarioError::GatewayOutsideSubnet {
            name: name.clone(),
            gateway: s.gw,
            cidr: s.cidr,
        })?;
        subnets.insert(name, subnet);
    }

    let internet = Internet::new(
        doc.internet.ping_target,
        doc.internet.http_host,
        doc.internet.dns,
        doc.internet.dns_server,
    );
    let mut topology = Topology::new(subnets, internet);

    // Devices are first placed unconfigured, then configured through the regular commit path so
    // scenario files are held to exactly the same rules as learner edits.
    let mut pending: Vec<(String, String, InterfaceConfig)> = Vec::new();
    let mut seen = BTreeSet::new();
    let mut claim = |id: &str| -> Result<(), ScenarioError> {
        if id == INTERNET_ID {
            return Err(ScenarioError::ReservedId(id.to_string()));
        }
        if !seen.insert(id.to_string()) {
            return Err(ScenarioError::DuplicateId(id.to_string()));
        }
        Ok(())
    };

    let mut firewall_policy = Vec::new();
    let mut route_lists = Vec::new();

    for router in doc.devices.routers {
        claim(&router.id)?;
        let interfaces = cable(&topology, &router.id, &router.interfaces, &mut pending)?;
        topology.insert_device(Device::Router(Router::new(&router.id, interfaces, router.uplink)));
        route_lists.push((router.id, router.routes));
    }

    for firewall in doc.devices.firewalls {
        claim(&firewall.id)?;
        let interfaces = cable(&topology, &firewall.id, &firewall.interfaces, &mut pending)?;
        topology.insert_device(Device::Firewall(Firewall::new(&firewall.id, interfaces)));
        route_lists.push((firewall.id.clone(), firewall.routes));
        firewall_policy.push((firewall.id, firewall.nat, firewall.rules));
    }

    for (link, hosts) in doc.devices.hosts {
        let subnet = *topology.subnet(&link).ok_or_else(|| ScenarioError::UnknownSubnet {
            device: hosts.first().map(|h| h.id.clone()).unwrap_or_default(),
            subnet: link.clone(),
        })?;
        for host in hosts {
            claim(&host.id)?;
            topology.insert_device(Device::Host(Host::new(&host.id, &link, host.services)));
            if let Some(address) = host.address {
                let mask = host.mask.unwrap_or_else(|| subnet.cidr().mask());
                let mut config = InterfaceConfig::new(address, mask);
                config.gateway = host.gateway;
                pending.push((host.id, HOST_INTERFACE.to_string(), config));
            }
        }
    }

    let invalid = |device: String| {
        move |source: ValidationError| ScenarioError::InvalidDevice { device, source }
    };

    for (device, interface, config) in pending {
        topology
            .commit_interface(&device, &interface, config)
            .map_err(invalid(device))?;
    }
    for (device, routes) in route_lists {
        topology.commit_routes(&device, routes).map_err(invalid(device))?;
    }
    for (device, nat, rules) in firewall_policy {
        topology.commit_nat(&device, nat).map_err(invalid(device.clone()))?;
        topology
            .commit_firewall_rules(&device, rules)
            .map_err(invalid(device))?;
    }

    Ok(topology)
}

/// Builds the (unconfigured) interface map of a router or firewall and queues its addressing.
fn cable(
    topology: &Topology,
    device: &str,
    docs: &BTreeMap<String, InterfaceDoc>,
    pending: &mut Vec<(String, String, InterfaceConfig)>,
) -> Result<BTreeMap<String, Interface>, ScenarioError> {
    let mut interfaces = BTreeMap::new();
    for (name, doc) in docs {
        let link = doc.subnet.clone().unwrap_or_else(|| name.clone());
        if topology.subnet(&link).is_none() {
            return Err(ScenarioError::UnknownSubnet {
                device: device.to_string(),
                subnet: link,
            });
        }
        interfaces.insert(name.clone(), Interface::new(link));
        let mut config = InterfaceConfig::new(doc.address, doc.mask);
        config.gateway = doc.gateway;
        pending.push((device.to_string(), name.clone(), config));
    }
    Ok(interfaces)
}
