use clap::Parser;
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use env_logger::Env;
use log::info;
use serde::Serialize;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use routemesh::config_loader::{self, CliOverrides};
use routemesh::ip::AddressPlan;
use routemesh::operator;
use routemesh::orchestrator::NetworkOrchestrator;
use routemesh::routing::RoutingPlan;
use routemesh::substrate::{NetnsSubstrate, SimulatedSubstrate, Substrate};

/// Emulate a multi-router IP network from a topology description
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the topology YAML file
    #[arg(short, long)]
    config: PathBuf,

    /// Run the whole pipeline against the in-memory substrate
    #[arg(long)]
    dry_run: bool,

    /// Print the address and routing plans as JSON and exit
    #[arg(long, conflicts_with = "dry_run")]
    plan_only: bool,

    /// Write the setup report as JSON to this path
    #[arg(long)]
    report: Option<PathBuf>,

    /// Tear down right after setup instead of starting the operator loop
    #[arg(long)]
    no_operator: bool,

    /// Prefix substrate commands with sudo
    #[arg(long)]
    sudo: bool,

    /// Override general.command_timeout (e.g. "2s", "500ms")
    #[arg(long, value_parser = humantime_serde::re::humantime::parse_duration)]
    timeout: Option<Duration>,

    /// Override general.metric_step
    #[arg(long)]
    metric_step: Option<u32>,

    /// Install primary routes only
    #[arg(long)]
    no_backups: bool,

    /// Override general.namespace_prefix
    #[arg(long)]
    namespace_prefix: Option<String>,
}

impl Args {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            command_timeout: self.timeout,
            metric_step: self.metric_step,
            no_backups: self.no_backups,
            namespace_prefix: self.namespace_prefix.clone(),
        }
    }
}

#[derive(Serialize)]
struct PlanOutput<'a> {
    addresses: Option<&'a AddressPlan>,
    routes: RoutingPlan,
}

fn main() -> Result<()> {
    // Initialize error handling
    color_eyre::install()?;

    let args = Args::parse();

    // Initialize logging with default filter level of "info"
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    info!("Starting routemesh v{}", env!("CARGO_PKG_VERSION"));

    let mut config = config_loader::load_config(&args.config)?;
    config_loader::apply_overrides(&mut config, &args.overrides())?;

    let substrate: Arc<dyn Substrate> = if args.dry_run || args.plan_only {
        Arc::new(SimulatedSubstrate::new())
    } else {
        Arc::new(NetnsSubstrate::new(&config.general.namespace_prefix).with_sudo(args.sudo))
    };
    info!("Using {} substrate", substrate.name());

    let mut network = NetworkOrchestrator::new(config, substrate).wrap_err("Failed to build topology")?;

    if args.plan_only {
        network.plan_addresses().wrap_err("Address planning failed")?;
        let output = PlanOutput {
            addresses: network.address_plan(),
            routes: network.compute_routes(),
        };
        println!(
            "{}",
            serde_json::to_string_pretty(&output).wrap_err("Failed to serialize plans")?
        );
        return Ok(());
    }

    network.setup().wrap_err("Network setup failed")?;

    let report = network.report();
    println!("{}", report.summary());
    if let Some(path) = &args.report {
        report.write_json(path)?;
    }

    if !args.no_operator {
        let stdin = io::stdin();
        let mut stdout = io::stdout();
        operator::run(&mut network, stdin.lock(), &mut stdout).wrap_err("Operator loop failed")?;
    }

    network.stop();
    info!("Network torn down");
    Ok(())
}
