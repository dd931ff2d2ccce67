//! # routemesh - multi-router IP network emulation
//!
//! This library compiles a declarative topology of hosts, routers and
//! router-to-router links into a running emulated network: an addressing
//! plan, per-interface configuration, and a ranked static routing table
//! on every router that keeps edge subnets reachable across single link
//! failures.
//!
//! ## Overview
//!
//! A run moves through fixed phases, each handled by one component:
//!
//! 1. **Plan** addresses for every link ([`ip::AddressPlanner`])
//! 2. **Emulate** nodes and links on a [`substrate::Substrate`]
//! 3. **Configure** interfaces and host default routes ([`configure::InterfaceConfigurator`])
//! 4. **Start** services such as routing daemons or web servers ([`process::ServiceLauncher`])
//! 5. **Route**: compute and apply ranked next-hops ([`routing::RouteComputer`], [`routing::RouteApplier`])
//! 6. **Operate** from a line-oriented loop, then tear down
//!
//! Only planning failures abort. Everything later is isolated per node,
//! per route entry or per service and ends up in the [`report::SetupReport`].
//!
//! ## Architecture
//!
//! - `config`: topology description and validation
//! - `config_loader`: YAML loading and CLI overrides
//! - `topology`: nodes, interfaces, links and derived adjacency
//! - `ip`: subnet registry and address planning
//! - `substrate`: network namespaces or an in-memory simulation
//! - `configure`: interface configuration
//! - `process`: service launching
//! - `routing`: route computation and application
//! - `orchestrator`: the phase machine
//! - `operator`: interactive command loop
//! - `report`: setup report
//! - `utils`: name validation
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use routemesh::{config_loader, orchestrator::NetworkOrchestrator, substrate::SimulatedSubstrate};
//!
//! let config = config_loader::load_config(Path::new("topology.yaml"))?;
//! let mut network = NetworkOrchestrator::new(config, Arc::new(SimulatedSubstrate::new()))?;
//! network.setup()?;
//! println!("{}", network.report().summary());
//! network.stop();
//! # Ok::<(), color_eyre::eyre::Error>(())
//! ```
//!
//! ## Topology Format
//!
//! ```yaml
//! general:
//!   command_timeout: 5s
//!   metric_step: 10
//! routers:
//!   - name: r0
//!   - name: r1
//! hosts:
//!   - name: pc0
//!     router: r0
//!     subnet: 10.0.0.0/24
//! links:
//!   - { a: r0, b: r1, bandwidth: 1000 }
//! ```
//!
//! ## Error Handling
//!
//! Library errors are typed with `thiserror` ([`error`]); the binary
//! reports them through `color_eyre`.

pub mod config;
pub mod config_loader;
pub mod configure;
pub mod error;
pub mod ip;
pub mod operator;
pub mod orchestrator;
pub mod process;
pub mod report;
pub mod routing;
pub mod substrate;
pub mod topology;
pub mod utils;

pub use error::{Error, PlanError, SetupError, SubstrateError, TopologyError};
