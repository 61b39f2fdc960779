#![forbid(unsafe_code)]

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use netlab_sim::forward::{forward_with, ProbeKind, SimConfig};
use netlab_sim::scenario;
use netlab_sim::shell::{exec_line_with, resolve_target, url_host};
use netlab_sim::Topology;

#[derive(Debug, Parser)]
#[command(name = "netlab-shell")]
#[command(about = "Run ping, traceroute, nslookup and curl inside a simulated network")]
struct Cli {
    /// Scenario document (JSON).
    #[arg(long, env = "NETLAB_SCENARIO")]
    scenario: PathBuf,

    /// Device the commands run on.
    #[arg(long, env = "NETLAB_SOURCE")]
    source: String,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, env = "NETLAB_LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// Forwarding steps a probe may take.
    #[arg(long, default_value_t = 16)]
    max_hops: u8,

    /// Print the forwarding trace and state table as JSON instead of tool output.
    #[arg(long)]
    json: bool,

    /// Command line to run. Commands are read from stdin when omitted.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let topology = scenario::load(&cli.scenario)
        .with_context(|| format!("failed to load scenario {}", cli.scenario.display()))?;
    topology
        .get_device(&cli.source)
        .with_context(|| format!("invalid --source {:?}", cli.source))?;

    let config = SimConfig {
        max_hops: cli.max_hops,
        ..SimConfig::default()
    };

    let stdout = io::stdout();
    let mut out = stdout.lock();

    if cli.json {
        let value = trace_json(&topology, &config, &cli.source, &cli.command)?;
        serde_json::to_writer_pretty(&mut out, &value)?;
        writeln!(out)?;
        return Ok(());
    }

    if !cli.command.is_empty() {
        let line = cli.command.join(" ");
        for l in exec_line_with(&topology, &config, &cli.source, &line) {
            writeln!(out, "{l}")?;
        }
        return Ok(());
    }

    for line in io::stdin().lock().lines() {
        let line = line.context("failed to read stdin")?;
        let line = line.trim();
        if matches!(line, "exit" | "quit") {
            break;
        }
        for l in exec_line_with(&topology, &config, &cli.source, line) {
            writeln!(out, "{l}")?;
        }
        out.flush()?;
    }
    Ok(())
}

/// Runs the probe behind `ping|traceroute|nslookup|curl <target>` and returns the raw trace.
fn trace_json(
    topology: &Topology,
    config: &SimConfig,
    source: &str,
    command: &[String],
) -> Result<serde_json::Value> {
    let Some((tool, args)) = command.split_first() else {
        bail!("--json needs a command, e.g. `ping 8.8.8.8`");
    };
    let Some(target) = args.iter().rev().find(|a| !a.starts_with('-')) else {
        bail!("{tool}: missing target");
    };

    let resolve = |host: &str| resolve_target(topology, config, source, host);
    let (probe, destination) = match tool.as_str() {
        "ping" => (ProbeKind::Ping, resolve(target)?),
        "traceroute" => (ProbeKind::Traceroute, resolve(target)?),
        "curl" => (ProbeKind::Http, resolve(url_host(target))?),
        "nslookup" => (ProbeKind::Lookup, topology.internet().dns_server()),
        other => bail!("--json does not support {other:?}"),
    };

    let trace = forward_with(topology, config, source, destination, probe)?;
    tracing::info!(tool = tool.as_str(), %destination, success = trace.success, "trace");
    let state_table = trace.state_table();
    Ok(serde_json::json!({
        "trace": trace,
        "stateTable": state_table,
    }))
}
