//! The topology graph.
//!
//! Built once from a [`TopologyConfig`]. Router adjacency and edge
//! subnets are derived from the link list on every query.

use ipnet::Ipv4Net;
use petgraph::graph::{NodeIndex, UnGraph};
use std::collections::HashMap;
use std::net::Ipv4Addr;

use super::types::{
    EdgeSubnet, Endpoint, Interface, InterfaceState, Link, LinkId, LinkKind, Node, NodeId, NodeKind,
};
use crate::config::{TopologyConfig, ValidationError};
use crate::error::TopologyError;
use crate::ip::AddressPlan;
use crate::utils::validation::interface_name;

#[derive(Debug, Clone)]
pub struct TopologyGraph {
    nodes: Vec<Node>,
    links: Vec<Link>,
}

/// Router-only view used for path computations
pub struct RouterGraph {
    pub graph: UnGraph<NodeId, LinkId>,
    pub index: HashMap<NodeId, NodeIndex>,
}

impl TopologyGraph {
    /// Build the graph from a validated description.
    ///
    /// Node ordinals: routers in declaration order, then hosts.
    /// Link ordinals: one edge link per host, then router links.
    /// Interfaces are numbered per node in link order, so a router's
    /// first interfaces face its edge subnets.
    pub fn from_config(config: &TopologyConfig) -> Result<Self, ValidationError> {
        config.validate()?;

        let mut nodes: Vec<Node> = Vec::new();
        for router in &config.routers {
            let id = nodes.len();
            nodes.push(Node::new(id, &router.name, NodeKind::Router, router.services.clone()));
        }
        for host in &config.hosts {
            let id = nodes.len();
            nodes.push(Node::new(id, &host.name, NodeKind::Host, host.services.clone()));
        }

        let ids: HashMap<String, NodeId> = nodes.iter().map(|n| (n.name.clone(), n.id)).collect();

        let mut graph = Self {
            nodes,
            links: Vec::new(),
        };

        for host in &config.hosts {
            graph.add_link(
                LinkKind::Edge,
                ids[&host.name],
                ids[&host.router],
                host.bandwidth,
                host.subnet,
                host.address,
            );
        }
        for link in &config.links {
            graph.add_link(
                LinkKind::PointToPoint,
                ids[&link.a],
                ids[&link.b],
                link.bandwidth,
                link.subnet,
                None,
            );
        }

        log::debug!(
            "Built topology: {} routers, {} hosts, {} links",
            graph.routers().count(),
            graph.hosts().count(),
            graph.links.len()
        );

        Ok(graph)
    }

    fn add_link(
        &mut self,
        kind: LinkKind,
        a: NodeId,
        b: NodeId,
        bandwidth: Option<u32>,
        requested_subnet: Option<Ipv4Net>,
        requested_address: Option<Ipv4Addr>,
    ) {
        let id = self.links.len();
        let mut endpoint = |node: NodeId| {
            let owner = &mut self.nodes[node];
            let name = interface_name(&owner.name, owner.interfaces.len());
            owner.interfaces.push(Interface::new(name.clone(), id));
            Endpoint {
                node,
                interface: name,
            }
        };
        let a = endpoint(a);
        let b = endpoint(b);
        self.links.push(Link {
            id,
            kind,
            a,
            b,
            bandwidth,
            requested_subnet,
            requested_address,
            subnet: None,
            up: true,
        });
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id]
    }

    pub fn link(&self, id: LinkId) -> &Link {
        &self.links[id]
    }

    pub fn node_by_name(&self, name: &str) -> Result<&Node, TopologyError> {
        self.nodes
            .iter()
            .find(|n| n.name == name)
            .ok_or_else(|| TopologyError::UnknownNode(name.to_string()))
    }

    pub fn routers(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.is_router())
    }

    pub fn hosts(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| !n.is_router())
    }

    /// Enabled router links of `router` as (link, neighbour) pairs, in link order
    pub fn neighbors(&self, router: NodeId) -> Vec<(LinkId, NodeId)> {
        self.links
            .iter()
            .filter(|l| l.kind == LinkKind::PointToPoint && l.up)
            .filter_map(|l| l.peer_of(router).map(|peer| (l.id, peer.node)))
            .collect()
    }

    /// All addressed edge subnets, in link order
    pub fn edge_subnets(&self) -> Vec<EdgeSubnet> {
        self.links
            .iter()
            .filter(|l| l.kind == LinkKind::Edge)
            .filter_map(|l| {
                let subnet = l.subnet?;
                let gateway = self.nodes[l.b.node].interface(&l.b.interface)?.ip()?;
                Some(EdgeSubnet {
                    link: l.id,
                    host: l.a.node,
                    router: l.b.node,
                    subnet,
                    gateway,
                })
            })
            .collect()
    }

    /// Router-only subgraph over enabled links
    pub fn router_graph(&self) -> RouterGraph {
        let mut graph = UnGraph::new_undirected();
        let mut index = HashMap::new();
        for router in self.routers() {
            index.insert(router.id, graph.add_node(router.id));
        }
        for link in &self.links {
            if link.kind == LinkKind::PointToPoint && link.up {
                graph.add_edge(index[&link.a.node], index[&link.b.node], link.id);
            }
        }
        RouterGraph { graph, index }
    }

    /// True if every router can reach every other router over enabled links
    pub fn is_connected(&self) -> bool {
        let routers = self.router_graph();
        petgraph::algo::connected_components(&routers.graph) <= 1
    }

    /// Find the router link joining `a` and `b` by node names
    pub fn find_link(&self, a: &str, b: &str) -> Result<LinkId, TopologyError> {
        let x = self.node_by_name(a)?.id;
        let y = self.node_by_name(b)?.id;
        self.links
            .iter()
            .find(|l| l.connects(x, y))
            .map(|l| l.id)
            .ok_or_else(|| TopologyError::NoSuchLink {
                a: a.to_string(),
                b: b.to_string(),
            })
    }

    pub fn set_link_up(&mut self, link: LinkId, up: bool) {
        self.links[link].up = up;
    }

    /// Copy of the graph with one link administratively down
    pub fn without_link(&self, link: LinkId) -> Self {
        let mut graph = self.clone();
        graph.set_link_up(link, false);
        graph
    }

    /// Copy of the graph in which a link only counts as up if both of its
    /// interfaces were brought up. A route over a link with a dead peer
    /// would still be used by the kernel and drop traffic.
    pub fn operational(&self) -> Self {
        let mut graph = self.clone();
        for link in &mut graph.links {
            let up = [&link.a, &link.b].iter().all(|end| {
                self.nodes[end.node]
                    .interface(&end.interface)
                    .map_or(false, |i| i.state == InterfaceState::Up)
            });
            link.up &= up;
        }
        graph
    }

    /// Copy planned subnets and interface addresses into the graph
    pub fn apply_plan(&mut self, plan: &AddressPlan) {
        for assignment in &plan.links {
            let link = &mut self.links[assignment.link];
            link.subnet = Some(assignment.subnet);
            let (a, b) = (link.a.clone(), link.b.clone());
            for (endpoint, binding) in [(&a, &assignment.a), (&b, &assignment.b)] {
                if let Some(iface) = self.nodes[endpoint.node].interface_mut(&endpoint.interface) {
                    iface.address = Ipv4Net::new(binding.address, assignment.subnet.prefix_len()).ok();
                }
            }
        }
    }
}
