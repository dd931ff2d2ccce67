//! Topology type definitions.
//!
//! Nodes own their interfaces; links refer to interfaces by
//! (node, interface name). Neither side stores adjacency.

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

use crate::config::ServiceConfig;

/// Ordinal of a node in the graph (routers first, in declaration order)
pub type NodeId = usize;

/// Ordinal of a link in the graph (host links first, then router links)
pub type LinkId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Host,
    Router,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Host => "host",
            NodeKind::Router => "router",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceState {
    Down,
    Up,
}

#[derive(Debug, Clone, Serialize)]
pub struct Interface {
    pub name: String,
    pub link: LinkId,
    /// Address with its prefix length, e.g. `10.0.0.254/24`
    pub address: Option<Ipv4Net>,
    pub state: InterfaceState,
}

impl Interface {
    pub fn new(name: String, link: LinkId) -> Self {
        Self {
            name,
            link,
            address: None,
            state: InterfaceState::Down,
        }
    }

    pub fn ip(&self) -> Option<Ipv4Addr> {
        self.address.map(|a| a.addr())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub kind: NodeKind,
    pub interfaces: Vec<Interface>,
    /// IPv4 forwarding; only ever true for routers
    pub forwarding: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ServiceConfig>,
}

impl Node {
    pub fn new(id: NodeId, name: &str, kind: NodeKind, services: Vec<ServiceConfig>) -> Self {
        Self {
            id,
            name: name.to_string(),
            kind,
            interfaces: Vec::new(),
            forwarding: false,
            services,
        }
    }

    pub fn is_router(&self) -> bool {
        self.kind == NodeKind::Router
    }

    /// Record the forwarding state. Hosts never forward.
    pub fn set_forwarding(&mut self, enabled: bool) {
        self.forwarding = enabled && self.is_router();
    }

    pub fn interface(&self, name: &str) -> Option<&Interface> {
        self.interfaces.iter().find(|i| i.name == name)
    }

    pub fn interface_mut(&mut self, name: &str) -> Option<&mut Interface> {
        self.interfaces.iter_mut().find(|i| i.name == name)
    }

    /// True if `addr` is assigned to one of this node's interfaces
    pub fn owns_address(&self, addr: Ipv4Addr) -> bool {
        self.interfaces.iter().any(|i| i.ip() == Some(addr))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    /// Host to its gateway router
    Edge,
    /// Router to router
    PointToPoint,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    pub node: NodeId,
    pub interface: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Link {
    pub id: LinkId,
    pub kind: LinkKind,
    /// Host side for edge links
    pub a: Endpoint,
    /// Gateway side for edge links
    pub b: Endpoint,
    /// Mbit/s
    pub bandwidth: Option<u32>,
    /// Pinned subnet from the description, if any
    pub requested_subnet: Option<Ipv4Net>,
    /// Pinned host address of an edge link, if any
    pub requested_address: Option<Ipv4Addr>,
    /// Planned subnet
    pub subnet: Option<Ipv4Net>,
    /// Administrative state; down links are ignored by routing
    pub up: bool,
}

impl Link {
    /// The endpoint opposite to `node`
    pub fn peer_of(&self, node: NodeId) -> Option<&Endpoint> {
        if self.a.node == node {
            Some(&self.b)
        } else if self.b.node == node {
            Some(&self.a)
        } else {
            None
        }
    }

    /// The endpoint on `node`
    pub fn endpoint_on(&self, node: NodeId) -> Option<&Endpoint> {
        if self.a.node == node {
            Some(&self.a)
        } else if self.b.node == node {
            Some(&self.b)
        } else {
            None
        }
    }

    pub fn connects(&self, x: NodeId, y: NodeId) -> bool {
        (self.a.node == x && self.b.node == y) || (self.a.node == y && self.b.node == x)
    }
}

/// Host-facing network and the router interface acting as its gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EdgeSubnet {
    pub link: LinkId,
    pub host: NodeId,
    pub router: NodeId,
    pub subnet: Ipv4Net,
    pub gateway: Ipv4Addr,
}
