//! Network topology module.
//!
//! This module holds the in-memory model of nodes, interfaces and links
//! that every other component queries.

pub mod graph;
pub mod types;

// Re-export key types for easier access
pub use graph::{RouterGraph, TopologyGraph};
pub use types::{
    EdgeSubnet, Endpoint, Interface, InterfaceState, Link, LinkId, LinkKind, Node, NodeId, NodeKind,
};
