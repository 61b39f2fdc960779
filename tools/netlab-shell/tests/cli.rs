#![cfg(not(target_arch = "wasm32"))]

use std::fs;
use std::path::PathBuf;

use predicates::prelude::*;
use tempfile::tempdir;

fn reference_scenario() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../crates/netlab-sim/scenarios/enterprise.json")
}

fn netlab() -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("netlab-shell");
    cmd.env_remove("RUST_LOG")
        .env_remove("NETLAB_SCENARIO")
        .env_remove("NETLAB_SOURCE")
        .env_remove("NETLAB_LOG_LEVEL");
    cmd
}

#[test]
fn ping_from_the_command_line() {
    netlab()
        .args(["--scenario", reference_scenario().to_str().unwrap(), "--source", "lan1"])
        .args(["ping", "-c", "2", "8.8.8.8"])
        .assert()
        .success()
        .stdout(predicate::str::contains("64 bytes from 8.8.8.8: icmp_seq=2 ttl=62"))
        .stdout(predicate::str::contains("2 packets transmitted, 2 received, 0% packet loss"));
}

#[test]
fn commands_are_read_from_stdin_with_env_config() {
    netlab()
        .env("NETLAB_SCENARIO", reference_scenario())
        .env("NETLAB_SOURCE", "web1")
        .write_stdin("traceroute 8.8.8.8\nroute\nexit\nping 8.8.8.8\n")
        .assert()
        .success()
        .stdout(predicate::str::contains(" 1  172.16.0.1 (fw1)  !X"))
        .stdout(predicate::str::contains("Kernel IP routing table"))
        .stdout(predicate::str::contains("PING").not());
}

#[test]
fn json_output_carries_the_trace_and_state_table() {
    let output = netlab()
        .args(["--scenario", reference_scenario().to_str().unwrap()])
        .args(["--source", "lan1", "--json"])
        .args(["ping", "8.8.8.8"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["trace"]["success"], true);
    let path: Vec<_> = value["trace"]["hops"]
        .as_array()
        .unwrap()
        .iter()
        .map(|h| h["deviceId"].as_str().unwrap())
        .collect();
    assert_eq!(path, ["lan1", "fw1", "fw1", "wan_gw", "internet"]);
    assert_eq!(value["stateTable"][0]["translatedSource"], "203.0.113.2");
    assert_eq!(value["stateTable"][0]["state"], "Established");
}

#[test]
fn edited_scenarios_change_the_outcome() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("no-lan-rule.json");
    let json = fs::read_to_string(reference_scenario()).unwrap();
    let mut doc: serde_json::Value = serde_json::from_str(&json).unwrap();
    doc["devices"]["firewalls"][0]["rules"]
        .as_array_mut()
        .unwrap()
        .remove(0);
    fs::write(&path, serde_json::to_string(&doc).unwrap()).unwrap();

    netlab()
        .args(["--scenario", path.to_str().unwrap(), "--source", "lan1"])
        .args(["ping", "-c", "1", "8.8.8.8"])
        .assert()
        .success()
        .stdout(predicate::str::contains("blocked by fw1: default-deny: no matching rule"))
        .stdout(predicate::str::contains("100% packet loss"));
}

#[test]
fn bad_inputs_fail_with_context() {
    let dir = tempdir().unwrap();
    let missing = dir.path().join("missing.json");
    netlab()
        .args(["--scenario", missing.to_str().unwrap(), "--source", "lan1", "help"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load scenario"));

    let broken = dir.path().join("broken.json");
    fs::write(&broken, "{ not json").unwrap();
    netlab()
        .args(["--scenario", broken.to_str().unwrap(), "--source", "lan1", "help"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid json"));

    netlab()
        .args(["--scenario", reference_scenario().to_str().unwrap()])
        .args(["--source", "ghost", "help"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid --source"));
}
