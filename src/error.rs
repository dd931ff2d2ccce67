//! Error types.
//!
//! Planning errors abort a run before anything touches the substrate.
//! Setup errors are isolated to one node, entry or service and are
//! collected into the [`SetupReport`](crate::report::SetupReport).

use ipnet::Ipv4Net;
use serde::Serialize;
use std::net::Ipv4Addr;
use std::time::Duration;

use crate::config::ValidationError;
use crate::orchestrator::Phase;

/// Failures of the address planner; fatal to the run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
pub enum PlanError {
    #[error("Address conflict: {subnet} ({owner}) overlaps {existing} ({existing_owner})")]
    AddressConflict {
        subnet: Ipv4Net,
        owner: String,
        existing: Ipv4Net,
        existing_owner: String,
    },

    #[error("Address pool {pool} exhausted while allocating a /{prefix} for {owner}")]
    AddressPoolExhausted {
        pool: Ipv4Net,
        prefix: u8,
        owner: String,
    },

    #[error("Invalid address {address} for {owner}: {reason}")]
    InvalidAddress {
        address: Ipv4Addr,
        owner: String,
        reason: String,
    },
}

/// Lookups against the topology graph
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopologyError {
    #[error("Unknown node: {0}")]
    UnknownNode(String),

    #[error("No link between {a} and {b}")]
    NoSuchLink { a: String, b: String },
}

/// Failures reported by the emulation substrate
#[derive(Debug, thiserror::Error)]
pub enum SubstrateError {
    #[error("Failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` on {node} timed out after {after:?}")]
    Timeout {
        node: String,
        command: String,
        after: Duration,
    },

    #[error("`{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("Unknown node handle: {0}")]
    UnknownNode(String),

    #[error("Link {a} <-> {b} is not emulated")]
    UnknownLink { a: String, b: String },
}

/// Isolated failures collected during setup and reconfiguration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind")]
pub enum SetupError {
    #[error("Configuration error on {node}{}: {cause}", interface.as_ref().map(|i| format!(" ({})", i)).unwrap_or_default())]
    ConfigurationError {
        node: String,
        interface: Option<String>,
        cause: String,
    },

    #[error("{router} has no route to {subnet}")]
    UnreachableDestination { router: String, subnet: Ipv4Net },

    #[error("Failed to install route {destination} via {nexthop} on {router}: {cause}")]
    RouteInstallError {
        router: String,
        destination: Ipv4Net,
        nexthop: Ipv4Addr,
        cause: String,
    },

    #[error("Failed to launch service {service} on {node}: {cause}")]
    ServiceLaunchError {
        node: String,
        service: String,
        cause: String,
    },
}

impl SetupError {
    /// Node the failure belongs to
    pub fn node(&self) -> &str {
        match self {
            SetupError::ConfigurationError { node, .. } => node,
            SetupError::UnreachableDestination { router, .. } => router,
            SetupError::RouteInstallError { router, .. } => router,
            SetupError::ServiceLaunchError { node, .. } => node,
        }
    }

    /// Unreachable destinations are expected in partitioned topologies
    pub fn is_expected(&self) -> bool {
        matches!(self, SetupError::UnreachableDestination { .. })
    }
}

/// Errors returned by orchestrator operations; planning errors abort a run
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    Substrate(#[from] SubstrateError),

    #[error("Cannot {action} in phase {actual:?}")]
    InvalidPhase { action: &'static str, actual: Phase },

    #[error("Failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}
