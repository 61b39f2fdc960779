#![forbid(unsafe_code)]

//! Ordered, first-match-wins packet filter with an implicit default-deny.

use core::fmt;
use core::net::Ipv4Addr;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::addr::{parse_cidr, parse_ipv4, AddrError, Ipv4Cidr};
use crate::packet::{Packet, Protocol};
use crate::topology::Firewall;

/// Reason reported when no rule matches a packet.
pub const DEFAULT_DENY_REASON: &str = "default-deny: no matching rule";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    #[serde(alias = "ALLOW", alias = "accept")]
    Allow,
    #[serde(alias = "DENY", alias = "drop")]
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleProtocol {
    #[serde(alias = "ANY")]
    Any,
    #[serde(alias = "ICMP")]
    Icmp,
    #[serde(alias = "DNS")]
    Dns,
    #[serde(alias = "HTTP")]
    Http,
}

impl RuleProtocol {
    pub fn matches(self, protocol: Protocol) -> bool {
        matches!(
            (self, protocol),
            (Self::Any, _)
                | (Self::Icmp, Protocol::Icmp)
                | (Self::Dns, Protocol::Dns)
                | (Self::Http, Protocol::Http)
        )
    }
}

/// Source or destination selector of a rule: `any`, a CIDR, or a single address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AddrMatch {
    Any,
    Cidr(Ipv4Cidr),
}

impl AddrMatch {
    pub fn matches(&self, ip: Ipv4Addr) -> bool {
        match self {
            Self::Any => true,
            Self::Cidr(cidr) => cidr.contains(ip),
        }
    }
}

impl FromStr for AddrMatch {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("any") || s == "*" {
            return Ok(Self::Any);
        }
        if s.contains('/') {
            return parse_cidr(s).map(Self::Cidr);
        }
        parse_ipv4(s).map(|ip| Self::Cidr(Ipv4Cidr::host(ip)))
    }
}

impl TryFrom<String> for AddrMatch {
    type Error = AddrError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AddrMatch> for String {
    fn from(value: AddrMatch) -> Self {
        value.to_string()
    }
}

impl fmt::Display for AddrMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("ANY"),
            Self::Cidr(cidr) if cidr.prefix_len() == 32 => fmt::Display::fmt(&cidr.network(), f),
            Self::Cidr(cidr) => fmt::Display::fmt(cidr, f),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirewallRule {
    pub action: RuleAction,
    pub protocol: RuleProtocol,
    pub source: AddrMatch,
    pub destination: AddrMatch,
    /// `None` matches packets arriving on any interface.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_interface: Option<String>,
}

impl FirewallRule {
    pub fn matches(&self, packet: &Packet) -> bool {
        self.mismatch(packet).is_none()
    }

    /// Names the first field that stops this rule from matching `packet`.
    fn mismatch(&self, packet: &Packet) -> Option<&'static str> {
        if !self.protocol.matches(packet.protocol) {
            return Some("protocol");
        }
        if !self.source.matches(packet.source) {
            return Some("source");
        }
        if !self.destination.matches(packet.destination) {
            return Some("destination");
        }
        match &self.ingress_interface {
            Some(iface) if packet.ingress_interface.as_deref() != Some(iface.as_str()) => {
                Some("ingress interface")
            }
            _ => None,
        }
    }
}

impl fmt::Display for FirewallRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let action = match self.action {
            RuleAction::Allow => "ALLOW",
            RuleAction::Deny => "DENY",
        };
        let protocol = match self.protocol {
            RuleProtocol::Any => "ANY",
            RuleProtocol::Icmp => "ICMP",
            RuleProtocol::Dns => "DNS",
            RuleProtocol::Http => "HTTP",
        };
        write!(f, "{action} {protocol} {} -> {}", self.source, self.destination)?;
        if let Some(iface) = &self.ingress_interface {
            write!(f, " on {iface}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "camelCase")]
pub enum Verdict {
    /// `rule` is the zero-based index of the matching rule.
    Allow { rule: usize, description: String },
    /// `rule` is `None` when the default policy denied the packet.
    Deny { rule: Option<usize>, reason: String },
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow { .. })
    }
}

/// Evaluates `packet` against `firewall`'s rule list.
pub fn evaluate(packet: &Packet, firewall: &Firewall) -> Verdict {
    evaluate_rules(packet, firewall.rules())
}

pub fn evaluate_rules(packet: &Packet, rules: &[FirewallRule]) -> Verdict {
    let Some((index, rule)) = rules.iter().enumerate().find(|(_, rule)| rule.matches(packet)) else {
        return Verdict::Deny {
            rule: None,
            reason: DEFAULT_DENY_REASON.to_string(),
        };
    };
    match rule.action {
        RuleAction::Allow => Verdict::Allow {
            rule: index,
            description: format!("rule {}: {rule}", index + 1),
        },
        RuleAction::Deny => Verdict::Deny {
            rule: Some(index),
            reason: format!("denied by rule {}: {rule}", index + 1),
        },
    }
}

/// One line of a rule trace: how a single rule fared against a packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleCheck {
    pub index: usize,
    pub rule: String,
    pub matched: bool,
    /// Field that failed to match, when `matched` is false.
    pub mismatch: Option<&'static str>,
}

/// Walks the rule list the same way [`evaluate_rules`] does, stopping at the first match, and
/// reports every rule it looked at.
pub fn explain(packet: &Packet, rules: &[FirewallRule]) -> Vec<RuleCheck> {
    let mut out = Vec::new();
    for (index, rule) in rules.iter().enumerate() {
        let mismatch = rule.mismatch(packet);
        out.push(RuleCheck {
            index,
            rule: rule.to_string(),
            matched: mismatch.is_none(),
            mismatch,
        });
        if mismatch.is_none() {
            break;
        }
    }
    out
}
