#![forbid(unsafe_code)]

//! Hop-by-hop probe simulation.
//!
//! [`forward`] walks a probe from its source device towards a destination address, resolving a
//! next hop on every device, filtering at firewall ingress and translating at firewall egress. It
//! only reads the [`Topology`], so any number of probes can be simulated against one snapshot.
//! Unreachable destinations are results, not errors; `Err` is reserved for lookups that a
//! validated topology should never fail.

use core::net::Ipv4Addr;

use serde::Serialize;

use crate::addr::is_private;
use crate::firewall::{evaluate, Verdict};
use crate::nat::{translate, Translation};
use crate::packet::{Packet, Protocol};
use crate::route::{resolve, Route};
use crate::topology::{Device, Topology, TopologyError, INTERNET_ID};

pub const NO_ROUTE: &str = "no route to host";
pub const HOST_UNREACHABLE: &str = "destination host unreachable";
pub const HOP_LIMIT_EXCEEDED: &str = "hop limit exceeded";
pub const CONNECTION_REFUSED: &str = "connection refused";

#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Forwarding steps a probe may take before it is dropped.
    pub max_hops: u8,
    /// TTL the source stamps on echo requests; reported back by `ping`.
    pub initial_ttl: u8,
    /// Echo requests sent by `ping` without `-c`.
    pub ping_count: u32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            max_hops: 16,
            initial_ttl: 64,
            ping_count: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ProbeKind {
    Ping,
    Traceroute,
    /// DNS query, as sent by `nslookup`.
    Lookup,
    Http,
}

impl ProbeKind {
    pub fn protocol(self) -> Protocol {
        match self {
            Self::Ping | Self::Traceroute => Protocol::Icmp,
            Self::Lookup => Protocol::Dns,
            Self::Http => Protocol::Http,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HopAction {
    Forwarded,
    Translated,
    Blocked,
    Delivered,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HopRecord {
    pub device_id: String,
    pub action: HopAction,
    /// Address the packet entered this device on (the source's egress address for the first hop).
    pub address: Option<Ipv4Addr>,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FlowState {
    New,
    Established,
    Blocked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateTableEntry {
    pub device: String,
    pub source: Ipv4Addr,
    pub translated_source: Option<Ipv4Addr>,
    pub destination: Ipv4Addr,
    pub protocol: Protocol,
    pub state: FlowState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardResult {
    pub success: bool,
    pub hops: Vec<HopRecord>,
    pub failure_reason: Option<String>,
    /// Device where the probe stopped, for failures.
    pub failed_at: Option<String>,
    pub protocol: Protocol,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    /// TTL left when the probe arrived; meaningful only on success.
    pub ttl: u8,
    pub translations: Vec<Translation>,
    /// Firewalls the probe entered, in order.
    pub firewalls: Vec<String>,
}

impl ForwardResult {
    /// Devices visited, in order, without repeats.
    pub fn path(&self) -> Vec<&str> {
        let mut path: Vec<&str> = Vec::new();
        for hop in &self.hops {
            if path.last() != Some(&hop.device_id.as_str()) {
                path.push(hop.device_id.as_str());
            }
        }
        path
    }

    /// Forwarding steps taken.
    pub fn hop_count(&self) -> usize {
        self.hops
            .iter()
            .filter(|h| h.action == HopAction::Forwarded)
            .count()
    }

    /// One connection-tracking row per firewall the probe entered.
    pub fn state_table(&self) -> Vec<StateTableEntry> {
        self.firewalls
            .iter()
            .map(|fw| {
                let blocked = self
                    .hops
                    .iter()
                    .any(|h| h.device_id == *fw && h.action == HopAction::Blocked);
                let state = if blocked {
                    FlowState::Blocked
                } else if self.success {
                    FlowState::Established
                } else {
                    FlowState::New
                };
                StateTableEntry {
                    device: fw.clone(),
                    source: self.source,
                    translated_source: self
                        .translations
                        .iter()
                        .find(|t| t.device == *fw)
                        .map(|t| t.translated),
                    destination: self.destination,
                    protocol: self.protocol,
                    state,
                }
            })
            .collect()
    }
}

enum Next {
    Device { id: String, interface: String },
    Internet,
}

struct Walk {
    config_ttl: u8,
    source: Ipv4Addr,
    destination: Ipv4Addr,
    protocol: Protocol,
    hops: Vec<HopRecord>,
    translations: Vec<Translation>,
    firewalls: Vec<String>,
}

impl Walk {
    fn hop(&mut self, device: &str, action: HopAction, address: Option<Ipv4Addr>, detail: String) {
        tracing::debug!(device, ?action, %detail, "hop");
        self.hops.push(HopRecord {
            device_id: device.to_string(),
            action,
            address,
            detail,
        });
    }

    fn finish(self, failure: Option<(&str, String)>) -> ForwardResult {
        let forwarded = self
            .hops
            .iter()
            .filter(|h| h.action == HopAction::Forwarded)
            .count();
        // The source's own send does not decrement the TTL; every later forward does.
        let decrements = u8::try_from(forwarded.saturating_sub(1)).unwrap_or(u8::MAX);
        let (failed_at, failure_reason) = match failure {
            Some((device, reason)) => (Some(device.to_string()), Some(reason)),
            None => (None, None),
        };
        tracing::debug!(
            success = failure_reason.is_none(),
            hops = self.hops.len(),
            reason = failure_reason.as_deref().unwrap_or(""),
            "forward finished"
        );
        ForwardResult {
            success: failure_reason.is_none(),
            hops: self.hops,
            failure_reason,
            failed_at,
            protocol: self.protocol,
            source: self.source,
            destination: self.destination,
            ttl: self.config_ttl.saturating_sub(decrements),
            translations: self.translations,
            firewalls: self.firewalls,
        }
    }
}

/// [`forward_with`] using [`SimConfig::default`].
pub fn forward(
    topology: &Topology,
    source: &str,
    destination: Ipv4Addr,
    probe: ProbeKind,
) -> Result<ForwardResult, TopologyError> {
    forward_with(topology, &SimConfig::default(), source, destination, probe)
}

pub fn forward_with(
    topology: &Topology,
    config: &SimConfig,
    source: &str,
    destination: Ipv4Addr,
    probe: ProbeKind,
) -> Result<ForwardResult, TopologyError> {
    let origin = topology.get_device(source)?;
    let mut route = resolve(topology, source, destination)?;
    let source_address = egress_address(origin, &route, destination);

    let mut packet = Packet::new(probe.protocol(), source_address, destination, config.max_hops);
    let mut walk = Walk {
        config_ttl: config.initial_ttl,
        source: source_address,
        destination,
        protocol: packet.protocol,
        hops: Vec::new(),
        translations: Vec::new(),
        firewalls: Vec::new(),
    };
    let mut current = source.to_string();
    let mut arrived_on = Some(source_address);

    tracing::debug!(source, %destination, ?probe, "forward");

    loop {
        let device = topology.get_device(&current)?;

        let (egress, next) = match route {
            Route::Local => {
                let detail = format!("{destination} is local");
                return Ok(deliver(walk, device, arrived_on, detail, packet.protocol));
            }
            Route::NoRoute => {
                return Ok(walk.finish(Some((current.as_str(), NO_ROUTE.to_string()))));
            }
            Route::GatewayUnreachable { gateway } => {
                let reason = format!("gateway {gateway} unreachable");
                return Ok(walk.finish(Some((current.as_str(), reason))));
            }
            Route::Direct { egress } => {
                let link = device
                    .interface(&egress)
                    .map(|iface| iface.link().to_string())
                    .ok_or_else(|| TopologyError::UnknownInterface {
                        device: current.clone(),
                        interface: egress.clone(),
                    })?;
                match topology.neighbor(&link, destination, &current) {
                    Some(n) => (
                        Some(egress),
                        Next::Device {
                            id: n.device,
                            interface: n.interface,
                        },
                    ),
                    None => {
                        let failure = Some((current.as_str(), HOST_UNREACHABLE.to_string()));
                        return Ok(walk.finish(failure));
                    }
                }
            }
            Route::ViaGateway { egress, neighbor, .. } => (
                Some(egress),
                Next::Device {
                    id: neighbor.device,
                    interface: neighbor.interface,
                },
            ),
            Route::Internet => (None, Next::Internet),
        };

        if packet.ttl_budget == 0 {
            return Ok(walk.finish(Some((current.as_str(), HOP_LIMIT_EXCEEDED.to_string()))));
        }
        packet.ttl_budget -= 1;

        // Translate once per traversal, on the way out, and only when leaving through a
        // different interface than the packet came in on.
        if let (Device::Firewall(fw), Some(out)) = (device, egress.as_deref()) {
            if packet.ingress_interface.as_deref() != Some(out) {
                let (translated, translation) = translate(packet, fw, out);
                packet = translated;
                if let Some(t) = translation {
                    let detail = format!(
                        "SNAT {} -> {} out {}",
                        t.original, t.translated, t.interface
                    );
                    walk.hop(&current, HopAction::Translated, arrived_on, detail);
                    walk.translations.push(t);
                }
            }
        }

        let next_name = match &next {
            Next::Device { id, .. } => id.as_str(),
            Next::Internet => INTERNET_ID,
        };
        let detail = match &egress {
            Some(out) => format!("out {out} to {next_name}"),
            None => format!("upstream to {next_name}"),
        };
        walk.hop(&current, HopAction::Forwarded, arrived_on, detail);

        let (next_id, ingress) = match next {
            Next::Internet => return Ok(deliver_to_internet(topology, walk, &packet)),
            Next::Device { id, interface } => (id, interface),
        };

        let next_device = topology.get_device(&next_id)?;
        arrived_on = next_device.interface(&ingress).and_then(|iface| iface.address());
        packet.ingress_interface = Some(ingress);

        if let Device::Firewall(fw) = next_device {
            walk.firewalls.push(next_id.clone());
            if let Verdict::Deny { reason, .. } = evaluate(&packet, fw) {
                walk.hop(&next_id, HopAction::Blocked, arrived_on, reason.clone());
                let reason = format!("blocked by {next_id}: {reason}");
                return Ok(walk.finish(Some((next_id.as_str(), reason))));
            }
        }

        // Hosts do not forward traffic addressed to someone else.
        if matches!(next_device, Device::Host(_)) && !next_device.owns(destination) {
            let detail = format!("{HOST_UNREACHABLE}: {next_id} does not forward");
            walk.hop(&next_id, HopAction::Blocked, arrived_on, detail);
            let failure = Some((next_id.as_str(), HOST_UNREACHABLE.to_string()));
            return Ok(walk.finish(failure));
        }

        current = next_id;
        route = resolve(topology, &current, destination)?;
    }
}

fn deliver(
    mut walk: Walk,
    device: &Device,
    arrived_on: Option<Ipv4Addr>,
    detail: String,
    protocol: Protocol,
) -> ForwardResult {
    if !device.serves(protocol) {
        let detail = format!("{CONNECTION_REFUSED}: no {protocol} service");
        walk.hop(device.id(), HopAction::Blocked, arrived_on, detail);
        return walk.finish(Some((device.id(), CONNECTION_REFUSED.to_string())));
    }
    walk.hop(device.id(), HopAction::Delivered, arrived_on, detail);
    walk.finish(None)
}

fn deliver_to_internet(topology: &Topology, mut walk: Walk, packet: &Packet) -> ForwardResult {
    let destination = packet.destination;
    if is_private(destination) || topology.is_internal(destination) {
        let detail = format!("{HOST_UNREACHABLE}: {destination} is not routed on the internet");
        walk.hop(INTERNET_ID, HopAction::Blocked, Some(destination), detail);
        return walk.finish(Some((INTERNET_ID, HOST_UNREACHABLE.to_string())));
    }
    if !topology.internet().serves(destination, packet.protocol) {
        let detail = format!("{CONNECTION_REFUSED}: no {} service", packet.protocol);
        walk.hop(INTERNET_ID, HopAction::Blocked, Some(destination), detail);
        return walk.finish(Some((INTERNET_ID, CONNECTION_REFUSED.to_string())));
    }
    let detail = format!("{destination} reached from {}", packet.source);
    walk.hop(INTERNET_ID, HopAction::Delivered, Some(destination), detail);
    walk.finish(None)
}

/// Address a probe leaves its source with: the interface it will go out on, or any configured
/// address when there is no usable route.
fn egress_address(device: &Device, route: &Route, destination: Ipv4Addr) -> Ipv4Addr {
    let egress = match route {
        Route::Local => return destination,
        Route::Direct { egress } | Route::ViaGateway { egress, .. } => Some(egress.as_str()),
        _ => None,
    };
    egress
        .and_then(|name| device.interface(name))
        .and_then(|iface| iface.address())
        .or_else(|| device.interfaces().into_iter().find_map(|(_, iface)| iface.address()))
        .unwrap_or(Ipv4Addr::UNSPECIFIED)
}
