//! Address planning.
//!
//! Pinned subnets are claimed first so automatic allocation can route
//! around them; then every unpinned link gets the next free block from
//! its pool. The planner only reads the graph and returns a plan.

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

use super::registry::SubnetRegistry;
use crate::config::{AddressingConfig, TopologyConfig};
use crate::error::PlanError;
use crate::topology::{LinkId, LinkKind, TopologyGraph};

/// Address bound to one link endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressBinding {
    pub node: String,
    pub interface: String,
    pub address: Ipv4Addr,
}

/// Planned subnet of one link. For edge links `a` is the host and `b` the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkAssignment {
    pub link: LinkId,
    pub kind: LinkKind,
    pub subnet: Ipv4Net,
    pub a: AddressBinding,
    pub b: AddressBinding,
}

/// Complete addressing plan, ordered by link id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressPlan {
    pub links: Vec<LinkAssignment>,
}

impl AddressPlan {
    pub fn link(&self, link: LinkId) -> Option<&LinkAssignment> {
        self.links.iter().find(|a| a.link == link)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Derives the addressing plan for a topology
#[derive(Debug, Clone)]
pub struct AddressPlanner {
    addressing: AddressingConfig,
}

impl AddressPlanner {
    pub fn new(addressing: AddressingConfig) -> Self {
        Self { addressing }
    }

    pub fn from_config(config: &TopologyConfig) -> Self {
        Self::new(config.addressing.clone())
    }

    /// Plan every link of `graph`.
    ///
    /// Edge subnets put the gateway on the highest usable address and the
    /// host on the lowest (unless pinned). Point-to-point subnets give the
    /// lower usable address to the endpoint with the lower node ordinal.
    pub fn plan(&self, graph: &TopologyGraph) -> Result<AddressPlan, PlanError> {
        let mut registry = SubnetRegistry::new();
        let owner = |link: LinkId| {
            let l = graph.link(link);
            format!("{}<->{}", graph.node(l.a.node).name, graph.node(l.b.node).name)
        };

        for link in graph.links() {
            if let Some(subnet) = link.requested_subnet {
                registry.claim(subnet, &owner(link.id))?;
            }
        }

        let mut plan = AddressPlan::default();
        for link in graph.links() {
            let subnet = match (link.requested_subnet, link.kind) {
                (Some(subnet), _) => subnet.trunc(),
                (None, LinkKind::Edge) => registry.claim_next(
                    self.addressing.edge_pool,
                    self.addressing.edge_prefix,
                    &owner(link.id),
                )?,
                (None, LinkKind::PointToPoint) => {
                    registry.claim_next(self.addressing.transit_pool, 30, &owner(link.id))?
                }
            };

            let host_part = |offset: u32| Ipv4Addr::from(u32::from(subnet.network()) + offset);
            let (a_addr, b_addr) = match link.kind {
                LinkKind::Edge => {
                    let gateway = Ipv4Addr::from(u32::from(subnet.broadcast()) - 1);
                    let host = self.host_address(graph, link.id, subnet, gateway)?;
                    (host, gateway)
                }
                LinkKind::PointToPoint => {
                    if link.a.node < link.b.node {
                        (host_part(1), host_part(2))
                    } else {
                        (host_part(2), host_part(1))
                    }
                }
            };

            let binding = |endpoint: &crate::topology::Endpoint, address| AddressBinding {
                node: graph.node(endpoint.node).name.clone(),
                interface: endpoint.interface.clone(),
                address,
            };
            plan.links.push(LinkAssignment {
                link: link.id,
                kind: link.kind,
                subnet,
                a: binding(&link.a, a_addr),
                b: binding(&link.b, b_addr),
            });
        }

        log::info!(
            "Planned {} subnets ({} edge, {} point-to-point)",
            plan.links.len(),
            plan.links.iter().filter(|a| a.kind == LinkKind::Edge).count(),
            plan.links.iter().filter(|a| a.kind == LinkKind::PointToPoint).count()
        );
        Ok(plan)
    }

    /// Host address on an edge subnet: the pinned one if valid, else the first usable
    fn host_address(
        &self,
        graph: &TopologyGraph,
        link: LinkId,
        subnet: Ipv4Net,
        gateway: Ipv4Addr,
    ) -> Result<Ipv4Addr, PlanError> {
        let first = Ipv4Addr::from(u32::from(subnet.network()) + 1);
        let host = graph.node(graph.link(link).a.node);
        let pinned = match graph.link(link).requested_address {
            Some(address) => address,
            None => return Ok(first),
        };
        let invalid = |reason: &str| PlanError::InvalidAddress {
            address: pinned,
            owner: host.name.clone(),
            reason: reason.to_string(),
        };
        if !subnet.contains(&pinned) || pinned == subnet.network() || pinned == subnet.broadcast() {
            return Err(invalid(&format!("not a usable address of {}", subnet)));
        }
        if pinned == gateway {
            return Err(invalid("collides with the gateway address"));
        }
        Ok(pinned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(yaml: &str) -> (TopologyConfig, TopologyGraph) {
        let config: TopologyConfig = serde_yaml::from_str(yaml).unwrap();
        let graph = TopologyGraph::from_config(&config).unwrap();
        (config, graph)
    }

    const SQUARE: &str = r#"
routers:
  - name: r0
  - name: r1
hosts:
  - name: pc0
    router: r0
    subnet: 10.0.0.0/24
  - name: pc1
    router: r1
links:
  - { a: r1, b: r0 }
"#;

    #[test]
    fn test_gateway_is_highest_usable() {
        let (config, graph) = graph(SQUARE);
        let plan = AddressPlanner::from_config(&config).plan(&graph).unwrap();
        let edge = plan.link(0).unwrap();
        assert_eq!(edge.subnet.to_string(), "10.0.0.0/24");
        assert_eq!(edge.a.address, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(edge.b.address, Ipv4Addr::new(10, 0, 0, 254));
        assert_eq!(edge.b.interface, "r0-eth0");
    }

    #[test]
    fn test_automatic_edge_skips_pinned() {
        let (config, graph) = graph(SQUARE);
        let plan = AddressPlanner::from_config(&config).plan(&graph).unwrap();
        // 10.0.0.0/24 is pinned by pc0, so pc1 gets the next block
        assert_eq!(plan.link(1).unwrap().subnet.to_string(), "10.0.1.0/24");
    }

    #[test]
    fn test_lower_ordinal_gets_lower_address() {
        let (config, graph) = graph(SQUARE);
        let plan = AddressPlanner::from_config(&config).plan(&graph).unwrap();
        let p2p = plan.link(2).unwrap();
        assert_eq!(p2p.subnet.to_string(), "10.255.0.0/30");
        // declared as r1 <-> r0; r0 has the lower ordinal
        assert_eq!(p2p.a.node, "r1");
        assert_eq!(p2p.a.address, Ipv4Addr::new(10, 255, 0, 2));
        assert_eq!(p2p.b.node, "r0");
        assert_eq!(p2p.b.address, Ipv4Addr::new(10, 255, 0, 1));
    }

    #[test]
    fn test_plan_is_deterministic() {
        let (config, graph) = graph(SQUARE);
        let planner = AddressPlanner::from_config(&config);
        let first = planner.plan(&graph).unwrap().to_json().unwrap();
        let second = planner.plan(&graph).unwrap().to_json().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_pinned_overlap_is_a_conflict() {
        let (config, graph) = graph(
            r#"
routers:
  - name: r0
  - name: r1
hosts:
  - name: pc0
    router: r0
    subnet: 10.0.0.0/24
links:
  - { a: r0, b: r1, subnet: 10.0.0.252/30 }
"#,
        );
        let err = AddressPlanner::from_config(&config).plan(&graph).unwrap_err();
        assert!(matches!(err, PlanError::AddressConflict { .. }));
        assert!(err.to_string().contains("pc0<->r0"));
    }

    #[test]
    fn test_pinned_host_address() {
        let (config, graph) = graph(
            r#"
routers:
  - name: r0
hosts:
  - name: web
    router: r0
    subnet: 10.3.3.0/24
    address: 10.3.3.10
  - name: bad
    router: r0
    subnet: 10.4.4.0/24
    address: 10.4.4.254
"#,
        );
        let err = AddressPlanner::from_config(&config).plan(&graph).unwrap_err();
        assert!(matches!(err, PlanError::InvalidAddress { ref owner, .. } if owner == "bad"));

        let mut config = config;
        config.hosts.pop();
        let graph = TopologyGraph::from_config(&config).unwrap();
        let plan = AddressPlanner::from_config(&config).plan(&graph).unwrap();
        assert_eq!(plan.link(0).unwrap().a.address, Ipv4Addr::new(10, 3, 3, 10));
    }
}
