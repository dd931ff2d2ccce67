//! Routing plan data types.

use ipnet::Ipv4Net;
use serde::Serialize;
use std::fmt::Write as _;
use std::net::Ipv4Addr;

use crate::error::SetupError;
use crate::topology::{LinkId, NodeId};

/// One ranked next-hop for a destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteEntry {
    pub destination: Ipv4Net,
    pub nexthop: Ipv4Addr,
    /// Egress interface on the owning router
    pub interface: String,
    pub metric: u32,
    /// Router link the entry leaves through
    pub link: LinkId,
    /// Router hops to the destination's gateway through this next-hop
    pub hops: usize,
    /// False for standbys kept in the plan but not pushed to the kernel
    pub installed: bool,
}

impl RouteEntry {
    pub fn to_command(&self) -> Vec<String> {
        vec![
            "ip".to_string(),
            "route".to_string(),
            "add".to_string(),
            self.destination.to_string(),
            "via".to_string(),
            self.nexthop.to_string(),
            "dev".to_string(),
            self.interface.clone(),
            "metric".to_string(),
            self.metric.to_string(),
        ]
    }
}

/// Ranked entries for one destination; empty when it is unreachable
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DestinationRoutes {
    pub destination: Ipv4Net,
    pub entries: Vec<RouteEntry>,
}

impl DestinationRoutes {
    pub fn primary(&self) -> Option<&RouteEntry> {
        self.entries.first()
    }

    pub fn installed(&self) -> impl Iterator<Item = &RouteEntry> {
        self.entries.iter().filter(|e| e.installed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouterTable {
    #[serde(skip)]
    pub id: NodeId,
    pub router: String,
    pub destinations: Vec<DestinationRoutes>,
}

impl RouterTable {
    pub fn destination(&self, subnet: Ipv4Net) -> Option<&DestinationRoutes> {
        self.destinations.iter().find(|d| d.destination == subnet)
    }

    pub fn entries(&self) -> impl Iterator<Item = &RouteEntry> {
        self.destinations.iter().flat_map(|d| d.entries.iter())
    }

    /// Human-readable listing, one entry per line
    pub fn render(&self) -> String {
        let mut out = String::new();
        for dest in &self.destinations {
            if dest.entries.is_empty() {
                let _ = writeln!(out, "{} unreachable", dest.destination);
                continue;
            }
            for (rank, e) in dest.entries.iter().enumerate() {
                let role = match (rank, e.installed) {
                    (0, _) => "primary",
                    (_, true) => "backup",
                    (_, false) => "standby (not installed)",
                };
                let _ = writeln!(
                    out,
                    "{} via {} dev {} metric {} hops {} [{}]",
                    e.destination, e.nexthop, e.interface, e.metric, e.hops, role
                );
            }
        }
        out
    }
}

/// Routes of every router plus the destinations nobody could reach
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RoutingPlan {
    pub tables: Vec<RouterTable>,
    pub unreachable: Vec<SetupError>,
}

impl RoutingPlan {
    pub fn table(&self, router: &str) -> Option<&RouterTable> {
        self.tables.iter().find(|t| t.router == router)
    }

    pub fn entry_count(&self) -> usize {
        self.tables.iter().map(|t| t.entries().count()).sum()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
