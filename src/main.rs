//! Tether - container network manager
//!
//! Creates the bridge networks and endpoints declared in a TOML manifest.

mod cli;

use cli::{Cli, Commands};
use serde::Serialize;
use std::sync::Arc;
use tether::driver::BUILTIN_DRIVERS;
use tether::ids::short_id;
use tether::link::{IpRoute, LinkOps, MemoryLinks};
use tether::manifest::{self, TetherConfig};
use tether::sandbox::MemorySandbox;
use tether::{Controller, Network, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse_args();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_level()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Completions { shell } => {
            Cli::generate_completion(shell);
        }
        Commands::Drivers => {
            for driver in BUILTIN_DRIVERS {
                println!("{}", driver);
            }
        }
        Commands::Check => {
            let config = manifest::load(&cli.config)?;
            println!(
                "Configuration OK: {} network(s), {} endpoint(s)",
                config.networks.len(),
                config.endpoint_count()
            );
            for network in &config.networks {
                println!(
                    "  {} ({}): {} endpoint(s)",
                    network.name,
                    network.driver,
                    network.endpoints.len()
                );
            }
        }
        Commands::Up { dry_run, json } => {
            let config = manifest::load(&cli.config)?;
            let links: Arc<dyn LinkOps> = if dry_run {
                info!("dry run, host links are simulated");
                Arc::new(MemoryLinks::new())
            } else {
                Arc::new(IpRoute::new())
            };

            let report = up(&config, links)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
        }
    }

    Ok(())
}

/// Endpoint created by `up`, with what was applied to its sandbox
#[derive(Debug, Serialize)]
struct EndpointReport {
    network: String,
    network_id: String,
    endpoint: String,
    endpoint_id: String,
    sandbox: MemorySandbox,
}

/// Create every network and endpoint in `config`
///
/// On failure everything created so far is removed again.
fn up(config: &TetherConfig, links: Arc<dyn LinkOps>) -> Result<Vec<EndpointReport>> {
    let controller = Controller::new(links);
    let mut created = Vec::new();

    provision(&controller, config, &mut created).inspect_err(|_| teardown(&created))
}

fn provision(
    controller: &Controller,
    config: &TetherConfig,
    created: &mut Vec<Network>,
) -> Result<Vec<EndpointReport>> {
    let mut report = Vec::new();

    for def in &config.networks {
        let network = controller.new_network(&def.driver, &def.name, &def.driver_options()?)?;
        created.push(network.clone());

        for ep in &def.endpoints {
            let (endpoint, info) =
                network.create_endpoint(&ep.name, &ep.sandbox, &ep.driver_options()?)?;

            let mut sandbox = MemorySandbox::new(ep.sandbox.clone());
            info.apply(&mut sandbox)?;

            report.push(EndpointReport {
                network: def.name.clone(),
                network_id: short_id(network.id()).to_string(),
                endpoint: ep.name.clone(),
                endpoint_id: short_id(endpoint.id()).to_string(),
                sandbox,
            });
        }
    }

    Ok(report)
}

/// Remove `networks` and their endpoints, newest first
fn teardown(networks: &[Network]) {
    for network in networks.iter().rev() {
        for endpoint in network.endpoints() {
            if let Err(e) = endpoint.delete() {
                warn!(endpoint = %endpoint.name(), error = %e, "failed to remove endpoint");
            }
        }
        if let Err(e) = network.delete() {
            warn!(network = %network.name(), error = %e, "failed to remove network");
        }
    }
}

fn print_report(report: &[EndpointReport]) {
    if report.is_empty() {
        println!("No endpoints created");
        return;
    }

    println!(
        "{:<12} {:<12} {:<16} {:<20} {:<16} SANDBOX",
        "NETWORK", "ENDPOINT", "INTERFACE", "ADDRESS", "GATEWAY"
    );
    for entry in report {
        let iface = entry.sandbox.interfaces.first();
        let gateway = entry.sandbox.gateways.first();
        println!(
            "{:<12} {:<12} {:<16} {:<20} {:<16} {}",
            entry.network,
            entry.endpoint,
            iface.map(|i| i.src_name.as_str()).unwrap_or("-"),
            iface
                .and_then(|i| i.address)
                .map(|a| a.to_string())
                .unwrap_or_else(|| "-".to_string()),
            gateway
                .map(|g| g.to_string())
                .unwrap_or_else(|| "-".to_string()),
            entry.sandbox.key
        );
    }
}
