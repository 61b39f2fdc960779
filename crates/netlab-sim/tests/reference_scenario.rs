use core::net::Ipv4Addr;
use std::path::Path;

use netlab_sim::firewall::DEFAULT_DENY_REASON;
use netlab_sim::forward::{FlowState, HOP_LIMIT_EXCEEDED, HOST_UNREACHABLE, NO_ROUTE};
use netlab_sim::scenario::{load, parse_str};
use netlab_sim::{
    forward, FirewallRule, HopAction, InterfaceConfig, ProbeKind, SnatRule, Topology,
    ValidationError,
};

const INTERNET: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);

#[test]
fn lan_host_pings_the_internet_through_snat() {
    let topo = enterprise();
    let result = forward(&topo, "lan1", INTERNET, ProbeKind::Ping).unwrap();

    assert!(result.success, "{:?}", result.failure_reason);
    assert_eq!(result.path(), ["lan1", "fw1", "wan_gw", "internet"]);
    assert_eq!(result.source, Ipv4Addr::new(192, 168, 1, 10));
    assert_eq!(result.ttl, 62);
    assert_eq!(result.hop_count(), 3);

    let translated: Vec<_> = result
        .hops
        .iter()
        .filter(|h| h.action == HopAction::Translated)
        .collect();
    assert_eq!(translated.len(), 1);
    assert_eq!(translated[0].device_id, "fw1");
    assert_eq!(translated[0].detail, "SNAT 192.168.1.10 -> 203.0.113.2 out wan");

    assert_eq!(result.translations.len(), 1);
    assert_eq!(result.translations[0].original, Ipv4Addr::new(192, 168, 1, 10));
    assert_eq!(result.translations[0].translated, Ipv4Addr::new(203, 0, 113, 2));

    assert_eq!(result.hops.last().map(|h| h.action), Some(HopAction::Delivered));
    let state = result.state_table();
    assert_eq!(state.len(), 1);
    assert_eq!(state[0].state, FlowState::Established);
    assert_eq!(state[0].translated_source, Some(Ipv4Addr::new(203, 0, 113, 2)));
}

#[test]
fn without_snat_the_source_is_unchanged() {
    let mut topo = enterprise();
    topo.commit_nat("fw1", Vec::new()).unwrap();

    let result = forward(&topo, "lan1", INTERNET, ProbeKind::Ping).unwrap();
    assert!(result.success);
    assert!(result.translations.is_empty());
    assert!(result.hops.iter().all(|h| h.action != HopAction::Translated));
    assert_eq!(result.state_table()[0].translated_source, None);
}

#[test]
fn without_the_lan_allow_rule_fw1_denies_by_default() {
    let mut topo = enterprise();
    let wan_only = fw1_rules(&topo).into_iter().skip(1).collect();
    topo.commit_firewall_rules("fw1", wan_only).unwrap();

    let result = forward(&topo, "lan1", INTERNET, ProbeKind::Ping).unwrap();
    assert!(!result.success);
    let reason = result.failure_reason.as_deref().unwrap();
    assert!(reason.contains("default-deny"), "{reason}");
    assert_eq!(reason, format!("blocked by fw1: {DEFAULT_DENY_REASON}"));
    assert_eq!(result.failed_at.as_deref(), Some("fw1"));

    let last = result.hops.last().unwrap();
    assert_eq!(last.device_id, "fw1");
    assert_eq!(last.action, HopAction::Blocked);
    assert_eq!(result.state_table()[0].state, FlowState::Blocked);
}

#[test]
fn swapping_overlapping_rules_flips_the_verdict() {
    let mut topo = enterprise();
    let deny = rule(
        r#"{"action":"deny","protocol":"icmp","source":"192.168.1.0/24",
            "destination":"any","ingressInterface":"lan"}"#,
    );
    let allow = rule(
        r#"{"action":"allow","protocol":"icmp","source":"192.168.1.0/24",
            "destination":"any","ingressInterface":"lan"}"#,
    );

    topo.commit_firewall_rules("fw1", vec![deny.clone(), allow.clone()])
        .unwrap();
    let result = forward(&topo, "lan1", INTERNET, ProbeKind::Ping).unwrap();
    assert!(!result.success);
    assert_eq!(
        result.failure_reason.as_deref(),
        Some("blocked by fw1: denied by rule 1: DENY ICMP 192.168.1.0/24 -> ANY on lan")
    );

    topo.commit_firewall_rules("fw1", vec![allow, deny]).unwrap();
    assert!(forward(&topo, "lan1", INTERNET, ProbeKind::Ping).unwrap().success);
}

#[test]
fn forwarding_is_deterministic() {
    let topo = enterprise();
    let runs = [
        ("lan1", ProbeKind::Ping),
        ("web1", ProbeKind::Traceroute),
        ("lan1", ProbeKind::Lookup),
    ];
    for (source, probe) in runs {
        let first = forward(&topo, source, INTERNET, probe).unwrap();
        let second = forward(&topo, source, INTERNET, probe).unwrap();
        assert_eq!(first, second);
    }
}

#[test]
fn nat_only_fires_on_its_egress_interface() {
    let topo = enterprise();
    let result = forward(&topo, "lan1", Ipv4Addr::new(172, 16, 0, 10), ProbeKind::Ping).unwrap();
    assert!(result.success);
    assert_eq!(result.path(), ["lan1", "fw1", "web1"]);
    assert!(result.translations.is_empty());
}

#[test]
fn non_matching_source_cidr_is_never_rewritten() {
    let mut topo = enterprise();
    let nat = SnatRule {
        source_cidr: "10.0.0.0/8".parse().unwrap(),
        translated_address: Ipv4Addr::new(203, 0, 113, 2),
        egress_interface: "wan".to_string(),
    };
    topo.commit_nat("fw1", vec![nat]).unwrap();

    let result = forward(&topo, "lan1", INTERNET, ProbeKind::Ping).unwrap();
    assert!(result.success);
    assert!(result.translations.is_empty());
}

#[test]
fn routing_loops_hit_the_hop_limit() {
    let topo = parse_str(LOOP).unwrap();
    let result = forward(&topo, "pc", INTERNET, ProbeKind::Ping).unwrap();
    assert!(!result.success);
    assert_eq!(result.failure_reason.as_deref(), Some(HOP_LIMIT_EXCEEDED));
    assert_eq!(result.hop_count(), 16);
    assert!(result.hops.iter().all(|h| h.action == HopAction::Forwarded));
}

#[test]
fn unreachable_destinations_are_results() {
    let topo = enterprise();

    let result = forward(&topo, "lan1", Ipv4Addr::new(192, 168, 1, 99), ProbeKind::Ping).unwrap();
    assert_eq!(result.failure_reason.as_deref(), Some(HOST_UNREACHABLE));
    assert_eq!(result.failed_at.as_deref(), Some("lan1"));

    // lan2 has no default gateway.
    let result = forward(&topo, "lan2", INTERNET, ProbeKind::Ping).unwrap();
    assert_eq!(result.failure_reason.as_deref(), Some(NO_ROUTE));
    assert!(result.hops.is_empty());

    assert!(forward(&topo, "nobody", INTERNET, ProbeKind::Ping).is_err());
}

#[test]
fn services_decide_what_a_reached_host_answers() {
    let mut topo = enterprise();
    let mut rules = fw1_rules(&topo);
    rules.push(rule(
        r#"{"action":"allow","protocol":"any","source":"192.168.1.0/24",
            "destination":"172.16.0.0/24","ingressInterface":"lan"}"#,
    ));
    topo.commit_firewall_rules("fw1", rules).unwrap();

    let web1 = Ipv4Addr::new(172, 16, 0, 10);
    assert!(forward(&topo, "lan1", web1, ProbeKind::Http).unwrap().success);

    let result = forward(&topo, "lan1", web1, ProbeKind::Lookup).unwrap();
    assert!(!result.success);
    assert_eq!(result.failure_reason.as_deref(), Some("connection refused"));
    assert_eq!(result.failed_at.as_deref(), Some("web1"));
}

#[test]
fn rejected_commits_leave_the_topology_alone() {
    let mut topo = enterprise();
    let clash =
        InterfaceConfig::new(Ipv4Addr::new(192, 168, 1, 10), "255.255.255.0".parse().unwrap());
    assert!(matches!(
        topo.commit_interface("lan2", "eth0", clash),
        Err(ValidationError::DuplicateAddress { .. })
    ));
    assert_eq!(
        topo.get_interface("lan2", "eth0").unwrap().address,
        Ipv4Addr::new(192, 168, 1, 11)
    );

    // Learner fixes lan2 by giving it a gateway.
    let fixed = InterfaceConfig::new(Ipv4Addr::new(192, 168, 1, 11), "/24".parse().unwrap())
        .with_gateway(Ipv4Addr::new(192, 168, 1, 1));
    topo.commit_interface("lan2", "eth0", fixed).unwrap();
    assert!(forward(&topo, "lan2", INTERNET, ProbeKind::Ping).unwrap().success);
}

#[test]
fn traces_serialize_for_ui_consumers() {
    let topo = enterprise();
    let result = forward(&topo, "lan1", INTERNET, ProbeKind::Ping).unwrap();
    let json = serde_json::to_value(&result).unwrap();
    assert_eq!(json["success"], true);
    assert_eq!(json["hops"][1]["deviceId"], "fw1");
    assert_eq!(json["hops"][1]["action"], "Translated");
    assert_eq!(json["protocol"], "icmp");
}

#[test]
fn topology_can_be_shared_between_threads() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<Topology>();
}

fn enterprise() -> Topology {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("scenarios/enterprise.json");
    load(&path).expect("load reference scenario")
}

fn fw1_rules(topo: &Topology) -> Vec<FirewallRule> {
    topo.get_device("fw1")
        .unwrap()
        .as_firewall()
        .unwrap()
        .rules()
        .to_vec()
}

fn rule(json: &str) -> FirewallRule {
    serde_json::from_str(json).expect("parse rule")
}

/// Two routers whose default routes point at each other.
const LOOP: &str = r#"{
    "subnets": {
        "lan": { "cidr": "192.168.0.0/24", "gw": "192.168.0.1" },
        "core": { "cidr": "10.0.0.0/30", "gw": "10.0.0.1" }
    },
    "devices": {
        "routers": [
            { "id": "r1",
              "interfaces": { "lan": { "address": "192.168.0.1", "mask": "255.255.255.0" },
                              "core": { "address": "10.0.0.1", "mask": "255.255.255.252" } },
              "routes": [ { "destination": "0.0.0.0/0", "via": "10.0.0.2" } ] },
            { "id": "r2",
              "interfaces": { "core": { "address": "10.0.0.2", "mask": "255.255.255.252" } },
              "routes": [ { "destination": "0.0.0.0/0", "via": "10.0.0.1" } ] }
        ],
        "hosts": { "lan": [
            { "id": "pc", "address": "192.168.0.10", "gateway": "192.168.0.1" }
        ] }
    },
    "internet": { "pingTarget": "8.8.8.8", "httpHost": "example.com" }
}"#;
