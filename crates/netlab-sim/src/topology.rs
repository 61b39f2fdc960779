#![forbid(unsafe_code)]

//! Scenario snapshot plus the learner's device configuration.
//!
//! The physical layout (subnets, devices and which subnet each interface is cabled to) is fixed
//! once a scenario is loaded. Addressing, routes, NAT and firewall rules change only through the
//! `commit_*` methods, which validate first and then apply, so a rejected commit leaves the
//! topology exactly as it was.

use core::fmt;
use core::net::Ipv4Addr;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::addr::{apply_mask, same_subnet, Ipv4Cidr, Netmask};
use crate::firewall::FirewallRule;
use crate::nat::SnatRule;
use crate::packet::Protocol;

/// Name of the single interface every host has.
pub const HOST_INTERFACE: &str = "eth0";

/// Device id of the internet pseudo-device.
pub const INTERNET_ID: &str = "internet";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceConfig {
    pub address: Ipv4Addr,
    pub mask: Netmask,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<Ipv4Addr>,
}

impl InterfaceConfig {
    pub fn new(address: Ipv4Addr, mask: Netmask) -> Self {
        Self {
            address,
            mask,
            gateway: None,
        }
    }

    pub fn with_gateway(mut self, gateway: Ipv4Addr) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn network(&self) -> Ipv4Cidr {
        apply_mask(self.address, self.mask)
    }

    /// Whether `other` is in this interface's subnet.
    pub fn on_link(&self, other: Ipv4Addr) -> bool {
        same_subnet(self.address, other, self.mask)
    }
}

/// A device port: the subnet it is cabled to plus its (optional) IPv4 configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    link: String,
    config: Option<InterfaceConfig>,
}

impl Interface {
    pub(crate) fn new(link: impl Into<String>) -> Self {
        Self {
            link: link.into(),
            config: None,
        }
    }

    /// Name of the scenario subnet this interface is attached to.
    pub fn link(&self) -> &str {
        &self.link
    }

    pub fn config(&self) -> Option<&InterfaceConfig> {
        self.config.as_ref()
    }

    pub fn address(&self) -> Option<Ipv4Addr> {
        self.config.map(|c| c.address)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticRoute {
    pub destination: Ipv4Cidr,
    pub via: Ipv4Addr,
}

/// Application services a host answers for. ICMP echo is always answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Service {
    Http,
    Dns,
}

impl Service {
    pub fn protocol(self) -> Protocol {
        match self {
            Self::Http => Protocol::Http,
            Self::Dns => Protocol::Dns,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    cidr: Ipv4Cidr,
    gateway: Ipv4Addr,
}

impl Subnet {
    /// Returns `None` when `gateway` lies outside `cidr`.
    pub fn new(cidr: Ipv4Cidr, gateway: Ipv4Addr) -> Option<Self> {
        cidr.contains(gateway).then_some(Self { cidr, gateway })
    }

    pub fn cidr(&self) -> Ipv4Cidr {
        self.cidr
    }

    pub fn gateway(&self) -> Ipv4Addr {
        self.gateway
    }
}

#[derive(Debug, Clone)]
pub struct Host {
    id: String,
    interface: Interface,
    services: Vec<Service>,
}

impl Host {
    pub(crate) fn new(
        id: impl Into<String>,
        link: impl Into<String>,
        services: Vec<Service>,
    ) -> Self {
        Self {
            id: id.into(),
            interface: Interface::new(link),
            services,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn interface(&self) -> &Interface {
        &self.interface
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }
}

#[derive(Debug, Clone)]
pub struct Router {
    id: String,
    interfaces: BTreeMap<String, Interface>,
    routes: Vec<StaticRoute>,
    uplink: bool,
}

impl Router {
    pub(crate) fn new(
        id: impl Into<String>,
        interfaces: BTreeMap<String, Interface>,
        uplink: bool,
    ) -> Self {
        Self {
            id: id.into(),
            interfaces,
            routes: Vec::new(),
            uplink,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn interfaces(&self) -> &BTreeMap<String, Interface> {
        &self.interfaces
    }

    pub fn routes(&self) -> &[StaticRoute] {
        &self.routes
    }

    /// Whether this router hands unrouted public traffic to the internet.
    pub fn is_uplink(&self) -> bool {
        self.uplink
    }
}

#[derive(Debug, Clone)]
pub struct Firewall {
    id: String,
    interfaces: BTreeMap<String, Interface>,
    routes: Vec<StaticRoute>,
    nat: Vec<SnatRule>,
    rules: Vec<FirewallRule>,
}

impl Firewall {
    pub(crate) fn new(id: impl Into<String>, interfaces: BTreeMap<String, Interface>) -> Self {
        Self {
            id: id.into(),
            interfaces,
            routes: Vec::new(),
            nat: Vec::new(),
            rules: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn interfaces(&self) -> &BTreeMap<String, Interface> {
        &self.interfaces
    }

    pub fn routes(&self) -> &[StaticRoute] {
        &self.routes
    }

    /// SNAT rules, in evaluation order.
    pub fn nat(&self) -> &[SnatRule] {
        &self.nat
    }

    /// Filter rules, in evaluation order.
    pub fn rules(&self) -> &[FirewallRule] {
        &self.rules
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Host,
    Router,
    Firewall,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Host => "host",
            Self::Router => "router",
            Self::Firewall => "firewall",
        })
    }
}

#[derive(Debug, Clone)]
pub enum Device {
    Host(Host),
    Router(Router),
    Firewall(Firewall),
}

impl Device {
    pub fn id(&self) -> &str {
        match self {
            Self::Host(h) => h.id(),
            Self::Router(r) => r.id(),
            Self::Firewall(f) => f.id(),
        }
    }

    pub fn kind(&self) -> DeviceKind {
        match self {
            Self::Host(_) => DeviceKind::Host,
            Self::Router(_) => DeviceKind::Router,
            Self::Firewall(_) => DeviceKind::Firewall,
        }
    }

    pub fn as_firewall(&self) -> Option<&Firewall> {
        match self {
            Self::Firewall(f) => Some(f),
            _ => None,
        }
    }

    pub fn interface(&self, name: &str) -> Option<&Interface> {
        match self {
            Self::Host(h) => (name == HOST_INTERFACE).then_some(&h.interface),
            Self::Router(r) => r.interfaces.get(name),
            Self::Firewall(f) => f.interfaces.get(name),
        }
    }

    fn interface_mut(&mut self, name: &str) -> Option<&mut Interface> {
        match self {
            Self::Host(h) => (name == HOST_INTERFACE).then_some(&mut h.interface),
            Self::Router(r) => r.interfaces.get_mut(name),
            Self::Firewall(f) => f.interfaces.get_mut(name),
        }
    }

    /// All interfaces, sorted by name.
    pub fn interfaces(&self) -> Vec<(&str, &Interface)> {
        match self {
            Self::Host(h) => vec![(HOST_INTERFACE, &h.interface)],
            Self::Router(r) => r.interfaces.iter().map(|(n, i)| (n.as_str(), i)).collect(),
            Self::Firewall(f) => f.interfaces.iter().map(|(n, i)| (n.as_str(), i)).collect(),
        }
    }

    pub fn routes(&self) -> &[StaticRoute] {
        match self {
            Self::Host(_) => &[],
            Self::Router(r) => &r.routes,
            Self::Firewall(f) => &f.routes,
        }
    }

    pub fn is_uplink(&self) -> bool {
        matches!(self, Self::Router(r) if r.uplink)
    }

    /// Name of the interface configured with `address`, if any.
    pub fn interface_for(&self, address: Ipv4Addr) -> Option<&str> {
        self.interfaces()
            .into_iter()
            .find(|(_, iface)| iface.address() == Some(address))
            .map(|(name, _)| name)
    }

    pub fn owns(&self, address: Ipv4Addr) -> bool {
        self.interface_for(address).is_some()
    }

    /// Whether the device answers `protocol` when it is the destination.
    pub fn serves(&self, protocol: Protocol) -> bool {
        match (self, protocol) {
            (_, Protocol::Icmp) => true,
            (Self::Host(h), protocol) => h.services.iter().any(|s| s.protocol() == protocol),
            _ => false,
        }
    }
}

/// The internet pseudo-device beyond the uplink router.
#[derive(Debug, Clone)]
pub struct Internet {
    ping_target: Ipv4Addr,
    http_host: String,
    dns: BTreeMap<String, Ipv4Addr>,
    dns_server: Ipv4Addr,
}

impl Internet {
    /// `dns_server` defaults to `ping_target`.
    pub fn new(
        ping_target: Ipv4Addr,
        http_host: impl Into<String>,
        dns: BTreeMap<String, Ipv4Addr>,
        dns_server: Option<Ipv4Addr>,
    ) -> Self {
        let http_host: String = http_host.into();
        let dns = dns
            .into_iter()
            .map(|(name, addr)| (normalize_name(&name), addr))
            .collect();
        Self {
            ping_target,
            http_host: normalize_name(&http_host),
            dns,
            dns_server: dns_server.unwrap_or(ping_target),
        }
    }

    pub fn ping_target(&self) -> Ipv4Addr {
        self.ping_target
    }

    pub fn http_host(&self) -> &str {
        &self.http_host
    }

    pub fn dns_server(&self) -> Ipv4Addr {
        self.dns_server
    }

    pub fn dns(&self) -> &BTreeMap<String, Ipv4Addr> {
        &self.dns
    }

    /// Looks `name` up in the DNS mapping (case-insensitive, trailing dot ignored).
    pub fn resolve(&self, name: &str) -> Option<Ipv4Addr> {
        self.dns.get(&normalize_name(name)).copied()
    }

    /// First name (in sorted order) that maps to `address`.
    pub fn reverse(&self, address: Ipv4Addr) -> Option<&str> {
        self.dns
            .iter()
            .find(|(_, a)| **a == address)
            .map(|(name, _)| name.as_str())
    }

    pub fn http_address(&self) -> Option<Ipv4Addr> {
        self.resolve(&self.http_host)
    }

    /// Whether a public `address` answers `protocol`.
    pub fn serves(&self, address: Ipv4Addr, protocol: Protocol) -> bool {
        match protocol {
            Protocol::Icmp => true,
            Protocol::Dns => address == self.dns_server,
            Protocol::Http => self.http_address() == Some(address),
        }
    }
}

fn normalize_name(name: &str) -> String {
    name.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// The device (and its interface) that answers for an address on a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbor {
    pub device: String,
    pub interface: String,
}

/// Lookup failures while reading the topology.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopologyError {
    #[error("unknown device {0:?}")]
    UnknownDevice(String),
    #[error("device {device:?} has no interface {interface:?}")]
    UnknownInterface { device: String, interface: String },
    #[error("interface {device}/{interface} is not configured")]
    Unconfigured { device: String, interface: String },
}

/// Why a commit was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("unknown device {0:?}")]
    UnknownDevice(String),
    #[error("device {device:?} has no interface {interface:?}")]
    UnknownInterface { device: String, interface: String },
    #[error("device {0:?} is not a firewall")]
    NotAFirewall(String),
    #[error("device {0:?} is neither a router nor a firewall")]
    NotARouter(String),
    #[error("{address} is the {which} address of {network}")]
    ReservedAddress {
        address: Ipv4Addr,
        network: Ipv4Cidr,
        which: &'static str,
    },
    #[error("gateway {gateway} is not in subnet {network}")]
    GatewayNotInSubnet { gateway: Ipv4Addr, network: Ipv4Cidr },
    #[error("gateway {0} is the interface's own address")]
    GatewayIsSelf(Ipv4Addr),
    #[error("{address} is already used by {device}/{interface}")]
    DuplicateAddress {
        address: Ipv4Addr,
        device: String,
        interface: String,
    },
    #[error("firewall rule {index} matches unknown ingress interface {interface:?}")]
    RuleIngressUnknown { index: usize, interface: String },
    #[error("NAT rule {index} egresses on unknown interface {interface:?}")]
    NatEgressUnknown { index: usize, interface: String },
    #[error("more than one route to {0}")]
    DuplicateRoute(Ipv4Cidr),
}

#[derive(Debug, Clone)]
pub struct Topology {
    subnets: BTreeMap<String, Subnet>,
    devices: BTreeMap<String, Device>,
    internet: Internet,
}

impl Topology {
    pub(crate) fn new(subnets: BTreeMap<String, Subnet>, internet: Internet) -> Self {
        Self {
            subnets,
            devices: BTreeMap::new(),
            internet,
        }
    }

    pub(crate) fn insert_device(&mut self, device: Device) {
        self.devices.insert(device.id().to_string(), device);
    }

    pub fn subnets(&self) -> &BTreeMap<String, Subnet> {
        &self.subnets
    }

    pub fn subnet(&self, name: &str) -> Option<&Subnet> {
        self.subnets.get(name)
    }

    /// Devices sorted by id.
    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn internet(&self) -> &Internet {
        &self.internet
    }

    pub fn get_device(&self, id: &str) -> Result<&Device, TopologyError> {
        self.devices
            .get(id)
            .ok_or_else(|| TopologyError::UnknownDevice(id.to_string()))
    }

    pub fn get_interface(
        &self,
        device: &str,
        interface: &str,
    ) -> Result<&InterfaceConfig, TopologyError> {
        let iface = self
            .get_device(device)?
            .interface(interface)
            .ok_or_else(|| TopologyError::UnknownInterface {
                device: device.to_string(),
                interface: interface.to_string(),
            })?;
        iface.config().ok_or_else(|| TopologyError::Unconfigured {
            device: device.to_string(),
            interface: interface.to_string(),
        })
    }

    /// Finds the interface on `link` configured with `address`, skipping device `exclude`.
    ///
    /// This is the simulation's stand-in for ARP: only devices cabled to the same subnet can
    /// answer, whatever their addressing says.
    pub fn neighbor(&self, link: &str, address: Ipv4Addr, exclude: &str) -> Option<Neighbor> {
        self.devices
            .values()
            .filter(|device| device.id() != exclude)
            .find_map(|device| {
                device
                    .interfaces()
                    .into_iter()
                    .find(|(_, iface)| iface.link() == link && iface.address() == Some(address))
                    .map(|(name, _)| Neighbor {
                        device: device.id().to_string(),
                        interface: name.to_string(),
                    })
            })
    }

    /// Whether `address` falls inside any scenario subnet.
    pub fn is_internal(&self, address: Ipv4Addr) -> bool {
        self.subnets.values().any(|s| s.cidr.contains(address))
    }

    pub fn commit_interface(
        &mut self,
        device: &str,
        interface: &str,
        config: InterfaceConfig,
    ) -> Result<(), ValidationError> {
        if let Err(err) = self.validate_interface(device, interface, &config) {
            tracing::warn!(device, interface, %err, "rejected interface commit");
            return Err(err);
        }
        self.interface_mut(device, interface)?.config = Some(config);
        tracing::info!(
            device,
            interface,
            address = %config.address,
            mask = %config.mask,
            "interface committed"
        );
        Ok(())
    }

    pub fn commit_firewall_rules(
        &mut self,
        device: &str,
        rules: Vec<FirewallRule>,
    ) -> Result<(), ValidationError> {
        let firewall = self.firewall_mut(device)?;
        for (index, rule) in rules.iter().enumerate() {
            if let Some(iface) = &rule.ingress_interface {
                if !firewall.interfaces.contains_key(iface) {
                    let err = ValidationError::RuleIngressUnknown {
                        index,
                        interface: iface.clone(),
                    };
                    tracing::warn!(device, %err, "rejected firewall rules");
                    return Err(err);
                }
            }
        }
        tracing::info!(device, count = rules.len(), "firewall rules committed");
        firewall.rules = rules;
        Ok(())
    }

    pub fn commit_nat(
        &mut self,
        device: &str,
        rules: Vec<SnatRule>,
    ) -> Result<(), ValidationError> {
        let firewall = self.firewall_mut(device)?;
        if let Some((index, rule)) = rules
            .iter()
            .enumerate()
            .find(|(_, rule)| !firewall.interfaces.contains_key(&rule.egress_interface))
        {
            let err = ValidationError::NatEgressUnknown {
                index,
                interface: rule.egress_interface.clone(),
            };
            tracing::warn!(device, %err, "rejected NAT rules");
            return Err(err);
        }
        tracing::info!(device, count = rules.len(), "NAT rules committed");
        firewall.nat = rules;
        Ok(())
    }

    /// Replaces the static routes of a router or firewall.
    pub fn commit_routes(
        &mut self,
        device: &str,
        routes: Vec<StaticRoute>,
    ) -> Result<(), ValidationError> {
        let slot = match self.devices.get_mut(device) {
            Some(Device::Router(r)) => &mut r.routes,
            Some(Device::Firewall(f)) => &mut f.routes,
            Some(Device::Host(_)) => return Err(ValidationError::NotARouter(device.to_string())),
            None => return Err(ValidationError::UnknownDevice(device.to_string())),
        };
        for (i, route) in routes.iter().enumerate() {
            if routes[..i].iter().any(|r| r.destination == route.destination) {
                let err = ValidationError::DuplicateRoute(route.destination);
                tracing::warn!(device, %err, "rejected routes");
                return Err(err);
            }
        }
        tracing::info!(device, count = routes.len(), "routes committed");
        *slot = routes;
        Ok(())
    }

    fn validate_interface(
        &self,
        device: &str,
        interface: &str,
        config: &InterfaceConfig,
    ) -> Result<(), ValidationError> {
        let dev = self
            .devices
            .get(device)
            .ok_or_else(|| ValidationError::UnknownDevice(device.to_string()))?;
        let iface = dev
            .interface(interface)
            .ok_or_else(|| ValidationError::UnknownInterface {
                device: device.to_string(),
                interface: interface.to_string(),
            })?;

        let network = config.network();
        // /31 and /32 have no network or broadcast address to reserve.
        if network.prefix_len() <= 30 {
            let which = if config.address == network.network() {
                Some("network")
            } else if config.address == network.broadcast() {
                Some("broadcast")
            } else {
                None
            };
            if let Some(which) = which {
                return Err(ValidationError::ReservedAddress {
                    address: config.address,
                    network,
                    which,
                });
            }
        }

        if let Some(gateway) = config.gateway {
            if gateway == config.address {
                return Err(ValidationError::GatewayIsSelf(gateway));
            }
            // Routers and firewalls may point at a next hop they cannot reach yet; the
            // forwarder reports that as an unreachable gateway.
            if dev.kind() == DeviceKind::Host && !config.on_link(gateway) {
                return Err(ValidationError::GatewayNotInSubnet { gateway, network });
            }
        }

        for other in self.devices.values() {
            for (name, other_iface) in other.interfaces() {
                if other.id() == device && name == interface {
                    continue;
                }
                let same_link = other_iface.link() == iface.link();
                if same_link && other_iface.address() == Some(config.address) {
                    return Err(ValidationError::DuplicateAddress {
                        address: config.address,
                        device: other.id().to_string(),
                        interface: name.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    fn interface_mut(
        &mut self,
        device: &str,
        interface: &str,
    ) -> Result<&mut Interface, ValidationError> {
        self.devices
            .get_mut(device)
            .ok_or_else(|| ValidationError::UnknownDevice(device.to_string()))?
            .interface_mut(interface)
            .ok_or_else(|| ValidationError::UnknownInterface {
                device: device.to_string(),
                interface: interface.to_string(),
            })
    }

    fn firewall_mut(&mut self, device: &str) -> Result<&mut Firewall, ValidationError> {
        match self.devices.get_mut(device) {
            Some(Device::Firewall(f)) => Ok(f),
            Some(_) => Err(ValidationError::NotAFirewall(device.to_string())),
            None => Err(ValidationError::UnknownDevice(device.to_string())),
        }
    }
}
