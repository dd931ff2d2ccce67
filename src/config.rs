//! Topology description format.
//!
//! A topology file declares routers, hosts hanging off routers, and the
//! router-to-router links. Addressing may be pinned per host or per link;
//! everything left out is allocated by the [`AddressPlanner`](crate::ip::AddressPlanner).

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::time::Duration;

use crate::utils::validation::{interface_name, validate_interface_name, validate_node_name};

/// Whole topology description
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub addressing: AddressingConfig,
    pub routers: Vec<RouterConfig>,
    #[serde(default)]
    pub hosts: Vec<HostConfig>,
    #[serde(default)]
    pub links: Vec<LinkConfig>,
}

/// Settings that apply to the whole run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Upper bound for every command executed inside a node
    #[serde(with = "humantime_serde", default = "default_command_timeout")]
    pub command_timeout: Duration,
    /// Distance between the metrics of consecutive fallback routes
    #[serde(default = "default_metric_step")]
    pub metric_step: u32,
    /// Install standby routes next to the primary (Linux keeps distinct metrics side by side)
    #[serde(default = "default_true")]
    pub install_backups: bool,
    /// Prefix for the names of the namespaces backing each node
    #[serde(default)]
    pub namespace_prefix: String,
}

/// Address pools used when a host or link does not pin its subnet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressingConfig {
    #[serde(default = "default_edge_pool")]
    pub edge_pool: Ipv4Net,
    #[serde(default = "default_edge_prefix")]
    pub edge_prefix: u8,
    #[serde(default = "default_transit_pool")]
    pub transit_pool: Ipv4Net,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ServiceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub name: String,
    /// Router acting as this host's gateway
    pub router: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subnet: Option<Ipv4Net>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<Ipv4Addr>,
    /// Mbit/s
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bandwidth: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ServiceConfig>,
}

/// Point-to-point link between two routers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    pub a: String,
    pub b: String,
    /// Mbit/s
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bandwidth: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subnet: Option<Ipv4Net>,
}

/// Long-running process started inside a node, e.g. a web server or a routing daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub command: String,
}

/// Configuration validation errors
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Invalid general configuration: {0}")]
    InvalidGeneral(String),
    #[error("Invalid addressing configuration: {0}")]
    InvalidAddressing(String),
    #[error("Invalid node '{name}': {reason}")]
    InvalidNode { name: String, reason: String },
    #[error("Invalid link {a} <-> {b}: {reason}")]
    InvalidLink { a: String, b: String, reason: String },
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_metric_step() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

fn default_edge_pool() -> Ipv4Net {
    Ipv4Net::new(Ipv4Addr::new(10, 0, 0, 0), 8).expect("static prefix length")
}

fn default_edge_prefix() -> u8 {
    24
}

fn default_transit_pool() -> Ipv4Net {
    Ipv4Net::new(Ipv4Addr::new(10, 255, 0, 0), 16).expect("static prefix length")
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            command_timeout: default_command_timeout(),
            metric_step: default_metric_step(),
            install_backups: true,
            namespace_prefix: String::new(),
        }
    }
}

impl Default for AddressingConfig {
    fn default() -> Self {
        Self {
            edge_pool: default_edge_pool(),
            edge_prefix: default_edge_prefix(),
            transit_pool: default_transit_pool(),
        }
    }
}

impl TopologyConfig {
    /// Validate the description before anything is planned or emulated
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.general.metric_step == 0 {
            return Err(ValidationError::InvalidGeneral(
                "metric_step must be greater than 0".to_string(),
            ));
        }
        if self.general.command_timeout.is_zero() {
            return Err(ValidationError::InvalidGeneral(
                "command_timeout must be greater than 0".to_string(),
            ));
        }

        let prefix = self.addressing.edge_prefix;
        if !(8..=30).contains(&prefix) || prefix < self.addressing.edge_pool.prefix_len() {
            return Err(ValidationError::InvalidAddressing(format!(
                "edge_prefix /{} does not fit edge_pool {}",
                prefix, self.addressing.edge_pool
            )));
        }
        if self.addressing.transit_pool.prefix_len() > 30 {
            return Err(ValidationError::InvalidAddressing(format!(
                "transit_pool {} is too small for a /30",
                self.addressing.transit_pool
            )));
        }

        if self.routers.is_empty() {
            return Err(ValidationError::InvalidGeneral(
                "at least one router is required".to_string(),
            ));
        }

        let mut names = HashSet::new();
        let all_names = self
            .routers
            .iter()
            .map(|r| &r.name)
            .chain(self.hosts.iter().map(|h| &h.name));
        for name in all_names {
            validate_node_name(name).map_err(|reason| ValidationError::InvalidNode {
                name: name.clone(),
                reason,
            })?;
            if !names.insert(name.as_str()) {
                return Err(ValidationError::InvalidNode {
                    name: name.clone(),
                    reason: "duplicate node name".to_string(),
                });
            }
        }

        let service_lists = self
            .routers
            .iter()
            .map(|r| (&r.name, &r.services))
            .chain(self.hosts.iter().map(|h| (&h.name, &h.services)));
        for (node, services) in service_lists {
            let mut seen = HashSet::new();
            for service in services {
                let invalid = |reason: String| ValidationError::InvalidNode {
                    name: node.clone(),
                    reason: format!("service '{}': {}", service.name, reason),
                };
                validate_node_name(&service.name).map_err(invalid)?;
                if !seen.insert(service.name.as_str()) {
                    return Err(invalid("duplicate service name".to_string()));
                }
                if service.command.trim().is_empty() {
                    return Err(invalid("empty command".to_string()));
                }
            }
        }

        let routers: HashSet<&str> = self.routers.iter().map(|r| r.name.as_str()).collect();

        for host in &self.hosts {
            if !routers.contains(host.router.as_str()) {
                return Err(ValidationError::InvalidNode {
                    name: host.name.clone(),
                    reason: format!("gateway router '{}' does not exist", host.router),
                });
            }
            if let Some(subnet) = host.subnet {
                if subnet.prefix_len() > 30 {
                    return Err(ValidationError::InvalidNode {
                        name: host.name.clone(),
                        reason: format!("edge subnet {} leaves no room for host and gateway", subnet),
                    });
                }
            }
        }

        for link in &self.links {
            let invalid = |reason: &str| ValidationError::InvalidLink {
                a: link.a.clone(),
                b: link.b.clone(),
                reason: reason.to_string(),
            };
            if link.a == link.b {
                return Err(invalid("a router cannot be linked to itself"));
            }
            if !routers.contains(link.a.as_str()) || !routers.contains(link.b.as_str()) {
                return Err(invalid("both endpoints must be routers"));
            }
            if let Some(subnet) = link.subnet {
                if subnet.prefix_len() > 30 {
                    return Err(invalid("point-to-point subnet must be /30 or larger"));
                }
            }
        }

        // Generated interface names must fit the kernel limit
        for name in names {
            let degree = self.link_count(name);
            if degree > 0 {
                let widest = interface_name(name, degree - 1);
                validate_interface_name(&widest).map_err(|reason| {
                    ValidationError::InvalidNode {
                        name: name.to_string(),
                        reason,
                    }
                })?;
            }
        }

        Ok(())
    }

    /// Number of links (host and router) that terminate on `node`
    pub fn link_count(&self, node: &str) -> usize {
        let host_links = self
            .hosts
            .iter()
            .filter(|h| h.name == node || h.router == node)
            .count();
        let router_links = self
            .links
            .iter()
            .filter(|l| l.a == node || l.b == node)
            .count();
        host_links + router_links
    }
}
