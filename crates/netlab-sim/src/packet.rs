#![forbid(unsafe_code)]

use core::fmt;
use core::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

/// Application protocol carried by a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[serde(alias = "ICMP")]
    Icmp,
    #[serde(alias = "DNS")]
    Dns,
    #[serde(alias = "HTTP")]
    Http,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Icmp => "ICMP",
            Self::Dns => "DNS",
            Self::Http => "HTTP",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A simulated probe packet. Built fresh for every forwarding query and never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Packet {
    pub protocol: Protocol,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    /// Interface of the current device the packet arrived on; `None` while still on its origin.
    pub ingress_interface: Option<String>,
    /// Remaining forwarding steps before the packet is dropped.
    pub ttl_budget: u8,
}

impl Packet {
    pub fn new(
        protocol: Protocol,
        source: Ipv4Addr,
        destination: Ipv4Addr,
        ttl_budget: u8,
    ) -> Self {
        Self {
            protocol,
            source,
            destination,
            ingress_interface: None,
            ttl_budget,
        }
    }

    pub fn arriving_on(mut self, interface: &str) -> Self {
        self.ingress_interface = Some(interface.to_string());
        self
    }
}
