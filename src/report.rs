//! Setup report.
//!
//! A snapshot of what a run achieved: which interfaces came up, which
//! routes and services are in place, and every isolated failure.
//! Rendered as JSON for tooling and as a plain-text summary for people.

use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use color_eyre::eyre::{Context, Result};

use crate::error::SetupError;
use crate::orchestrator::{NetworkOrchestrator, Phase};
use crate::process::LaunchedService;
use crate::routing::RouteEntry;
use crate::topology::{InterfaceState, NodeKind};

#[derive(Debug, Clone, Serialize)]
pub struct InterfaceReport {
    pub name: String,
    pub address: Option<Ipv4Net>,
    pub state: InterfaceState,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    pub name: String,
    pub kind: NodeKind,
    pub forwarding: bool,
    pub interfaces: Vec<InterfaceReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SetupReport {
    pub generated_at: DateTime<Utc>,
    pub substrate: String,
    pub phase: Phase,
    pub degraded: bool,
    pub nodes: Vec<NodeReport>,
    pub routes: BTreeMap<String, Vec<RouteEntry>>,
    pub services: Vec<LaunchedService>,
    pub errors: Vec<SetupError>,
}

impl SetupReport {
    pub fn from_orchestrator(orch: &NetworkOrchestrator) -> Self {
        let nodes = orch
            .graph()
            .nodes()
            .iter()
            .map(|node| NodeReport {
                name: node.name.clone(),
                kind: node.kind,
                forwarding: node.forwarding,
                interfaces: node
                    .interfaces
                    .iter()
                    .map(|i| InterfaceReport {
                        name: i.name.clone(),
                        address: i.address,
                        state: i.state,
                    })
                    .collect(),
            })
            .collect();

        Self {
            generated_at: Utc::now(),
            substrate: orch.substrate_name().to_string(),
            phase: orch.phase(),
            degraded: orch.is_degraded(),
            nodes,
            routes: orch.installed_routes().clone(),
            services: orch.services().to_vec(),
            errors: orch.errors().to_vec(),
        }
    }

    pub fn interfaces_up(&self) -> usize {
        self.nodes
            .iter()
            .flat_map(|n| n.interfaces.iter())
            .filter(|i| i.state == InterfaceState::Up)
            .count()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn write_json(&self, output_path: &Path) -> Result<()> {
        let json = self.to_json().context("Failed to serialize setup report")?;
        fs::write(output_path, json)
            .with_context(|| format!("Failed to write setup report to {}", output_path.display()))?;
        log::info!("Setup report written to {}", output_path.display());
        Ok(())
    }

    /// Plain-text summary of successes and failures
    pub fn summary(&self) -> String {
        let total_interfaces: usize = self.nodes.iter().map(|n| n.interfaces.len()).sum();
        let total_routes: usize = self.routes.values().map(Vec::len).sum();
        let status = if self.degraded { "DEGRADED" } else { "OK" };

        let mut lines: Vec<String> = Vec::new();
        lines.push("=".repeat(60));
        lines.push(format!("routemesh setup report ({})", self.generated_at.to_rfc3339()));
        lines.push("=".repeat(60));
        lines.push(format!("Substrate:   {}", self.substrate));
        lines.push(format!("Phase:       {:?}", self.phase));
        lines.push(format!("Status:      {}", status));
        lines.push(format!("Interfaces:  {}/{} up", self.interfaces_up(), total_interfaces));
        lines.push(format!("Routes:      {} installed on {} routers", total_routes, self.routes.len()));
        lines.push(format!("Services:    {} started", self.services.len()));

        if !self.errors.is_empty() {
            lines.push(String::new());
            lines.push(format!("Failures ({}):", self.errors.len()));
            for error in &self.errors {
                let marker = if error.is_expected() { "-" } else { "!" };
                lines.push(format!("  {} {}", marker, error));
            }
        }
        lines.join("\n")
    }
}
