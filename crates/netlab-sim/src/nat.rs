#![forbid(unsafe_code)]

//! Source NAT applied at firewall egress.

use core::fmt;
use core::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::addr::Ipv4Cidr;
use crate::packet::Packet;
use crate::topology::Firewall;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnatRule {
    pub source_cidr: Ipv4Cidr,
    pub translated_address: Ipv4Addr,
    pub egress_interface: String,
}

impl fmt::Display for SnatRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SNAT {} -> {} out {}",
            self.source_cidr, self.translated_address, self.egress_interface
        )
    }
}

/// A source rewrite performed by one firewall on one packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Translation {
    pub device: String,
    /// Zero-based index of the SNAT rule that fired.
    pub rule: usize,
    pub interface: String,
    pub original: Ipv4Addr,
    pub translated: Ipv4Addr,
}

/// Rewrites the packet's source with the first rule of `firewall` that covers it on `egress`.
///
/// Returns the packet untouched, and no translation, when nothing matches.
pub fn translate(
    packet: Packet,
    firewall: &Firewall,
    egress: &str,
) -> (Packet, Option<Translation>) {
    translate_with(packet, firewall.id(), firewall.nat(), egress)
}

pub fn translate_with(
    mut packet: Packet,
    device: &str,
    rules: &[SnatRule],
    egress: &str,
) -> (Packet, Option<Translation>) {
    let hit = rules.iter().enumerate().find(|(_, rule)| {
        rule.egress_interface == egress && rule.source_cidr.contains(packet.source)
    });
    let Some((index, rule)) = hit else {
        return (packet, None);
    };

    let translation = Translation {
        device: device.to_string(),
        rule: index,
        interface: egress.to_string(),
        original: packet.source,
        translated: rule.translated_address,
    };
    packet.source = rule.translated_address;
    (packet, Some(translation))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Protocol;

    fn snat(cidr: &str, to: [u8; 4], out: &str) -> SnatRule {
        SnatRule {
            source_cidr: cidr.parse().unwrap(),
            translated_address: Ipv4Addr::from(to),
            egress_interface: out.to_string(),
        }
    }

    fn probe(src: [u8; 4]) -> Packet {
        let destination = Ipv4Addr::new(8, 8, 8, 8);
        Packet::new(Protocol::Icmp, Ipv4Addr::from(src), destination, 16).arriving_on("lan")
    }

    #[test]
    fn matching_rule_rewrites_the_source() {
        let rules = [snat("192.168.1.0/24", [203, 0, 113, 2], "wan")];
        let (packet, translation) = translate_with(probe([192, 168, 1, 10]), "fw1", &rules, "wan");
        assert_eq!(packet.source, Ipv4Addr::new(203, 0, 113, 2));
        assert_eq!(packet.destination, Ipv4Addr::new(8, 8, 8, 8));
        let translation = translation.unwrap();
        assert_eq!(translation.original, Ipv4Addr::new(192, 168, 1, 10));
        assert_eq!(translation.rule, 0);
        assert_eq!(translation.device, "fw1");
    }

    #[test]
    fn other_egress_interfaces_are_left_alone() {
        let rules = [snat("192.168.1.0/24", [203, 0, 113, 2], "wan")];
        let (packet, translation) = translate_with(probe([192, 168, 1, 10]), "fw1", &rules, "dmz");
        assert_eq!(packet.source, Ipv4Addr::new(192, 168, 1, 10));
        assert!(translation.is_none());
    }

    #[test]
    fn non_matching_source_is_never_rewritten() {
        let rules = [snat("192.168.1.0/24", [203, 0, 113, 2], "wan")];
        let (packet, translation) = translate_with(probe([172, 16, 0, 10]), "fw1", &rules, "wan");
        assert_eq!(packet.source, Ipv4Addr::new(172, 16, 0, 10));
        assert!(translation.is_none());
    }

    #[test]
    fn first_matching_rule_wins() {
        let rules = [
            snat("192.168.1.0/24", [203, 0, 113, 2], "dmz"),
            snat("192.168.1.0/25", [203, 0, 113, 3], "wan"),
            snat("192.168.0.0/16", [203, 0, 113, 4], "wan"),
        ];
        let (packet, translation) = translate_with(probe([192, 168, 1, 10]), "fw1", &rules, "wan");
        assert_eq!(packet.source, Ipv4Addr::new(203, 0, 113, 3));
        assert_eq!(translation.map(|t| t.rule), Some(1));
    }
}
