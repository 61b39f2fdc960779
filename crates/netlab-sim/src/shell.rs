#![forbid(unsafe_code)]

//! Terminal-style front end over the forwarder.
//!
//! Each command runs one or more probes from a source device and renders the outcome the way the
//! matching Linux tool would. Output is plain lines; nothing here touches stdout.

use core::net::Ipv4Addr;

use thiserror::Error;

use crate::addr::parse_ipv4;
use crate::forward::{
    forward_with, ForwardResult, HopAction, ProbeKind, SimConfig, CONNECTION_REFUSED,
};
use crate::route::{routing_table, NextHop};
use crate::topology::{Topology, TopologyError};

const COMMANDS: &str = "ping, traceroute, nslookup, curl, route, help";

/// Upper bound for `ping -c`; every echo request becomes an output line.
pub const MAX_PING_COUNT: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("{0}: Name or service not known")]
    NotFound(String),
    /// The DNS query itself never made it to the server.
    #[error("{name}: Temporary failure in name resolution")]
    NoServer { name: String, reason: String },
    #[error(transparent)]
    Topology(#[from] TopologyError),
}

/// Runs `command` from `source` with the default [`SimConfig`].
pub fn exec(topology: &Topology, source: &str, command: &str, args: &[&str]) -> Vec<String> {
    exec_with(topology, &SimConfig::default(), source, command, args)
}

pub fn exec_with(
    topology: &Topology,
    config: &SimConfig,
    source: &str,
    command: &str,
    args: &[&str],
) -> Vec<String> {
    tracing::debug!(source, command, ?args, "exec");
    let out = match command {
        "ping" => ping(topology, config, source, args),
        "traceroute" => traceroute(topology, config, source, args),
        "nslookup" => nslookup(topology, config, source, args),
        "curl" => curl(topology, config, source, args),
        "route" => route(topology, source),
        "help" => Ok(help()),
        "" => Ok(Vec::new()),
        other => Ok(vec![format!("{other}: command not found (try: {COMMANDS})")]),
    };
    out.unwrap_or_else(|err| {
        tracing::warn!(source, command, %err, "command failed");
        vec![format!("internal error: {err}")]
    })
}

/// Splits a typed line on whitespace and runs it.
pub fn exec_line(topology: &Topology, source: &str, line: &str) -> Vec<String> {
    exec_line_with(topology, &SimConfig::default(), source, line)
}

pub fn exec_line_with(
    topology: &Topology,
    config: &SimConfig,
    source: &str,
    line: &str,
) -> Vec<String> {
    let mut words = line.split_whitespace();
    let Some(command) = words.next() else {
        return Vec::new();
    };
    let args: Vec<&str> = words.collect();
    exec_with(topology, config, source, command, &args)
}

/// Turns a command argument into an address.
///
/// IPv4 literals are used as-is. Names are looked up by sending a DNS probe from `source` to the
/// internet's DNS server first, so a firewall that drops DNS breaks name resolution.
pub fn resolve_target(
    topology: &Topology,
    config: &SimConfig,
    source: &str,
    target: &str,
) -> Result<Ipv4Addr, ResolveError> {
    if let Ok(address) = parse_ipv4(target) {
        return Ok(address);
    }
    let internet = topology.internet();
    let query = forward_with(topology, config, source, internet.dns_server(), ProbeKind::Lookup)?;
    if !query.success {
        return Err(ResolveError::NoServer {
            name: target.to_string(),
            reason: query.failure_reason.unwrap_or_default(),
        });
    }
    internet
        .resolve(target)
        .ok_or_else(|| ResolveError::NotFound(target.to_string()))
}

/// Resolution failures that should be shown to the user instead of aborting the command.
fn user_facing(err: ResolveError) -> Result<String, TopologyError> {
    match err {
        ResolveError::Topology(err) => Err(err),
        other => Ok(other.to_string()),
    }
}

fn ping(
    topology: &Topology,
    config: &SimConfig,
    source: &str,
    args: &[&str],
) -> Result<Vec<String>, TopologyError> {
    let mut count = config.ping_count.clamp(1, MAX_PING_COUNT);
    let mut target = None;
    let mut args = args.iter();
    while let Some(arg) = args.next() {
        match *arg {
            "-c" => {
                let value = args.next().copied().unwrap_or("");
                match value.parse::<u32>() {
                    Ok(n) if n > MAX_PING_COUNT => {
                        let range = format!("1 <= value <= {MAX_PING_COUNT}");
                        return Ok(vec![format!(
                            "ping: invalid argument: '{value}': out of range: {range}"
                        )]);
                    }
                    Ok(n) if n > 0 => count = n,
                    _ => {
                        return Ok(vec![format!(
                            "ping: invalid count of packets to transmit: `{value}'"
                        )]);
                    }
                }
            }
            other => target = Some(other),
        }
    }
    let Some(target) = target else {
        return Ok(vec!["usage: ping [-c count] <host>".to_string()]);
    };

    let address = match resolve_target(topology, config, source, target) {
        Ok(address) => address,
        Err(err) => return Ok(vec![format!("ping: {}", user_facing(err)?)]),
    };

    // Forwarding is deterministic, so one probe stands in for every echo request.
    let result = forward_with(topology, config, source, address, ProbeKind::Ping)?;
    let mut lines = vec![format!("PING {target} ({address}) 56(84) bytes of data.")];
    let reporter = failure_address(&result);
    let reason = result.failure_reason.as_deref().unwrap_or("unknown");
    for seq in 1..=count {
        if result.success {
            lines.push(format!(
                "64 bytes from {address}: icmp_seq={seq} ttl={}",
                result.ttl
            ));
        } else {
            lines.push(format!(
                "From {reporter} icmp_seq={seq} Destination host unreachable ({reason})"
            ));
        }
    }
    let received = if result.success { count } else { 0 };
    let loss = if result.success { 0 } else { 100 };
    lines.push(String::new());
    lines.push(format!("--- {target} ping statistics ---"));
    lines.push(format!("{count} packets transmitted, {received} received, {loss}% packet loss"));
    Ok(lines)
}

fn traceroute(
    topology: &Topology,
    config: &SimConfig,
    source: &str,
    args: &[&str],
) -> Result<Vec<String>, TopologyError> {
    let Some(target) = args.first().copied() else {
        return Ok(vec!["usage: traceroute <host>".to_string()]);
    };
    let address = match resolve_target(topology, config, source, target) {
        Ok(address) => address,
        Err(err) => return Ok(vec![format!("traceroute: {}", user_facing(err)?)]),
    };

    let result = forward_with(topology, config, source, address, ProbeKind::Traceroute)?;
    let mut lines = vec![format!(
        "traceroute to {target} ({address}), {} hops max, 60 byte packets",
        config.max_hops
    )];

    let path = result.path();
    let mut ttl = 0;
    if path.len() == 1 && result.success {
        ttl += 1;
        lines.push(format!("{ttl:>2}  {address} ({source})"));
    }
    for device in path.iter().skip(1) {
        ttl += 1;
        lines.push(hop_line(&result, device, ttl));
    }

    if let Some(reason) = &result.failure_reason {
        let blocked = result.hops.last().is_some_and(|h| h.action == HopAction::Blocked);
        if !blocked {
            lines.push(format!("{:>2}  * * *", ttl + 1));
        }
        lines.push(format!("traceroute: {reason}"));
    }
    Ok(lines)
}

/// Address of the device that gave up on the probe: the interface it arrived on, or the
/// probe's own source when it never left.
fn failure_address(result: &ForwardResult) -> Ipv4Addr {
    result
        .hops
        .iter()
        .rev()
        .find(|h| Some(h.device_id.as_str()) == result.failed_at.as_deref())
        .and_then(|h| h.address)
        .unwrap_or(result.source)
}

fn hop_line(result: &ForwardResult, device: &str, ttl: usize) -> String {
    let mut hops = result.hops.iter().filter(|h| h.device_id == device);
    let address = hops
        .clone()
        .find_map(|h| h.address)
        .map_or_else(|| "*".to_string(), |a| a.to_string());
    let mut line = format!("{ttl:>2}  {address} ({device})");
    if hops.any(|h| h.action == HopAction::Blocked) {
        line.push_str("  !X");
    }
    line
}

fn nslookup(
    topology: &Topology,
    config: &SimConfig,
    source: &str,
    args: &[&str],
) -> Result<Vec<String>, TopologyError> {
    let Some(name) = args.first().copied() else {
        return Ok(vec!["usage: nslookup <name>".to_string()]);
    };
    let internet = topology.internet();
    let server = internet.dns_server();

    let query = forward_with(topology, config, source, server, ProbeKind::Lookup)?;
    if !query.success {
        let mut lines = vec![";; connection timed out; no servers could be reached".to_string()];
        if let Some(reason) = query.failure_reason {
            lines.push(format!(";; {reason}"));
        }
        return Ok(lines);
    }

    let mut lines = vec![
        format!("Server:\t\t{server}"),
        format!("Address:\t{server}#53"),
        String::new(),
    ];
    if let Ok(address) = parse_ipv4(name) {
        let [a, b, c, d] = address.octets();
        let arpa = format!("{d}.{c}.{b}.{a}.in-addr.arpa");
        match internet.reverse(address) {
            Some(host) => lines.push(format!("{arpa}\tname = {host}.")),
            None => lines.push(format!("** server can't find {arpa}: NXDOMAIN")),
        }
        return Ok(lines);
    }
    match internet.resolve(name) {
        Some(address) => {
            lines.push("Non-authoritative answer:".to_string());
            lines.push(format!("Name:\t{name}"));
            lines.push(format!("Address: {address}"));
        }
        None => lines.push(format!("** server can't find {name}: NXDOMAIN")),
    }
    Ok(lines)
}

/// Host part of `http://host[:port]/path`, or of a bare host.
pub fn url_host(url: &str) -> &str {
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
        .unwrap_or(url);
    let end = rest.find(['/', ':', '?']).unwrap_or(rest.len());
    &rest[..end]
}

fn curl(
    topology: &Topology,
    config: &SimConfig,
    source: &str,
    args: &[&str],
) -> Result<Vec<String>, TopologyError> {
    let Some(url) = args.iter().copied().find(|a| !a.starts_with('-')) else {
        return Ok(vec!["curl: try 'curl <url>'".to_string()]);
    };
    let host = url_host(url);
    let address = match resolve_target(topology, config, source, host) {
        Ok(address) => address,
        Err(ResolveError::Topology(err)) => return Err(err),
        Err(_) => return Ok(vec![format!("curl: (6) Could not resolve host: {host}")]),
    };

    let result = forward_with(topology, config, source, address, ProbeKind::Http)?;
    if result.success {
        return Ok(vec![
            "HTTP/1.1 200 OK".to_string(),
            "Content-Type: text/html".to_string(),
            String::new(),
            format!("<html><body>{host}</body></html>"),
        ]);
    }
    let reason = match result.failure_reason.as_deref() {
        Some(CONNECTION_REFUSED) | None => "Connection refused",
        Some(other) => other,
    };
    Ok(vec![format!("curl: (7) Failed to connect to {host} port 80: {reason}")])
}

fn route(topology: &Topology, source: &str) -> Result<Vec<String>, TopologyError> {
    let table = routing_table(topology, source)?;
    let mut lines = vec![
        "Kernel IP routing table".to_string(),
        format!("{:<16}{:<16}{:<16}{}", "Destination", "Gateway", "Genmask", "Iface"),
    ];
    for entry in table {
        let gateway = match entry.next_hop {
            NextHop::Connected => Ipv4Addr::UNSPECIFIED.to_string(),
            NextHop::Gateway(gateway) => gateway.to_string(),
            NextHop::Internet => "internet".to_string(),
        };
        lines.push(format!(
            "{:<16}{:<16}{:<16}{}",
            entry.destination.network().to_string(),
            gateway,
            entry.destination.mask().to_string(),
            entry.egress.as_deref().unwrap_or("-"),
        ));
    }
    Ok(lines)
}

fn help() -> Vec<String> {
    [
        "ping [-c count] <host>   send ICMP echo requests",
        "traceroute <host>        show the devices a probe passes through",
        "nslookup <name|address>  query the DNS server",
        "curl <url>               fetch a page over HTTP",
        "route                    print this device's routing table",
        "help                     show this list",
    ]
    .iter()
    .map(|line| line.to_string())
    .collect()
}
