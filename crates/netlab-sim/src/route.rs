#![forbid(unsafe_code)]

//! Next-hop selection.
//!
//! Every device gets a routing table built from its connected interfaces, its static routes and
//! its interface gateways (plus an internet default on the uplink router). Resolution is a
//! longest-prefix match over that table; equal prefixes keep table order.

use core::net::Ipv4Addr;

use serde::Serialize;

use crate::addr::Ipv4Cidr;
use crate::topology::{Device, Neighbor, Topology, TopologyError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "address", rename_all = "camelCase")]
pub enum NextHop {
    Connected,
    Gateway(Ipv4Addr),
    Internet,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteEntry {
    pub destination: Ipv4Cidr,
    /// `None` for internet handoff and for gateways no connected interface can reach.
    pub egress: Option<String>,
    pub next_hop: NextHop,
}

/// Result of resolving a destination on one device. Failures are ordinary values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// The device itself owns the destination address.
    Local,
    /// The destination shares a subnet with `egress`.
    Direct { egress: String },
    ViaGateway {
        egress: String,
        gateway: Ipv4Addr,
        neighbor: Neighbor,
    },
    /// Hand the packet to the internet pseudo-device.
    Internet,
    /// A route exists but nothing on the link answers for its next hop.
    GatewayUnreachable { gateway: Ipv4Addr },
    NoRoute,
}

pub fn routing_table(topology: &Topology, device: &str) -> Result<Vec<RouteEntry>, TopologyError> {
    Ok(table_for(topology.get_device(device)?))
}

fn table_for(device: &Device) -> Vec<RouteEntry> {
    let configured: Vec<_> = device
        .interfaces()
        .into_iter()
        .filter_map(|(name, iface)| iface.config().map(|c| (name, c)))
        .collect();

    let egress_for = |gateway: Ipv4Addr| {
        configured
            .iter()
            .find(|(_, c)| c.on_link(gateway))
            .map(|(name, _)| name.to_string())
    };

    let mut table: Vec<RouteEntry> = configured
        .iter()
        .map(|(name, c)| RouteEntry {
            destination: c.network(),
            egress: Some(name.to_string()),
            next_hop: NextHop::Connected,
        })
        .collect();

    table.extend(device.routes().iter().map(|route| RouteEntry {
        destination: route.destination,
        egress: egress_for(route.via),
        next_hop: NextHop::Gateway(route.via),
    }));

    for (name, c) in &configured {
        let Some(gateway) = c.gateway else { continue };
        // Prefer the interface the gateway was configured on when it is reachable there.
        let egress = if c.on_link(gateway) {
            Some(name.to_string())
        } else {
            egress_for(gateway)
        };
        table.push(RouteEntry {
            destination: Ipv4Cidr::ANY,
            egress,
            next_hop: NextHop::Gateway(gateway),
        });
    }

    if device.is_uplink() {
        table.push(RouteEntry {
            destination: Ipv4Cidr::ANY,
            egress: None,
            next_hop: NextHop::Internet,
        });
    }
    table
}

/// Longest-prefix match; on ties the earlier entry wins.
pub fn lookup(table: &[RouteEntry], destination: Ipv4Addr) -> Option<&RouteEntry> {
    let mut best: Option<&RouteEntry> = None;
    for entry in table.iter().filter(|e| e.destination.contains(destination)) {
        if best.map_or(true, |b| entry.destination.prefix_len() > b.destination.prefix_len()) {
            best = Some(entry);
        }
    }
    best
}

/// Decides where `device` sends a packet for `destination`.
pub fn resolve(
    topology: &Topology,
    device: &str,
    destination: Ipv4Addr,
) -> Result<Route, TopologyError> {
    let dev = topology.get_device(device)?;
    if dev.owns(destination) {
        return Ok(Route::Local);
    }

    let table = table_for(dev);
    let Some(entry) = lookup(&table, destination) else {
        return Ok(Route::NoRoute);
    };

    let route = match (entry.next_hop, &entry.egress) {
        (NextHop::Internet, _) => Route::Internet,
        (NextHop::Connected, Some(egress)) => Route::Direct {
            egress: egress.clone(),
        },
        (NextHop::Connected, None) => Route::NoRoute,
        (NextHop::Gateway(gateway), None) => Route::GatewayUnreachable { gateway },
        (NextHop::Gateway(gateway), Some(egress)) => {
            let link = dev
                .interface(egress)
                .map(|iface| iface.link())
                .ok_or_else(|| TopologyError::UnknownInterface {
                    device: device.to_string(),
                    interface: egress.clone(),
                })?;
            match topology.neighbor(link, gateway, device) {
                Some(neighbor) => Route::ViaGateway {
                    egress: egress.clone(),
                    gateway,
                    neighbor,
                },
                None => Route::GatewayUnreachable { gateway },
            }
        }
    };
    tracing::trace!(device, %destination, ?route, "route resolved");
    Ok(route)
}
