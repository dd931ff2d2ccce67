//! Interface configuration.
//!
//! Every interface with a planned address is reconciled with
//! flush, add, up. Flushing first makes a repeated run converge to the
//! same state instead of failing on an existing address. Hosts then get
//! their default route through the edge gateway.

use ipnet::Ipv4Net;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use crate::error::{SetupError, SubstrateError};
use crate::substrate::{LinkHandle, NodeExecutor, NodeHandle};
use crate::topology::{LinkId, NodeId, TopologyGraph};

/// Result of configuring every node
#[derive(Debug, Default)]
pub struct InterfaceOutcome {
    /// Interfaces that are now up, as (node, interface)
    pub configured: Vec<(NodeId, String)>,
    pub errors: Vec<SetupError>,
}

pub struct InterfaceConfigurator<'a> {
    executor: &'a NodeExecutor,
    handles: &'a BTreeMap<NodeId, NodeHandle>,
    links: Option<&'a BTreeMap<LinkId, LinkHandle>>,
}

impl<'a> InterfaceConfigurator<'a> {
    pub fn new(executor: &'a NodeExecutor, handles: &'a BTreeMap<NodeId, NodeHandle>) -> Self {
        Self {
            executor,
            handles,
            links: None,
        }
    }

    /// Only configure interfaces of links that were created. A link that
    /// failed to come up is reported where it was created, not by the
    /// nodes on either end.
    pub fn with_links(mut self, links: &'a BTreeMap<LinkId, LinkHandle>) -> Self {
        self.links = Some(links);
        self
    }

    fn emulated(&self, link: LinkId) -> bool {
        self.links.map_or(true, |links| links.contains_key(&link))
    }

    pub fn configure_interface(
        &self,
        node: &NodeHandle,
        iface: &str,
        address: Ipv4Net,
    ) -> Result<(), SubstrateError> {
        let address = address.to_string();
        self.executor.exec_checked(node, &["ip", "addr", "flush", "dev", iface])?;
        self.executor
            .exec_checked(node, &["ip", "addr", "add", &address, "dev", iface])?;
        self.executor.exec_checked(node, &["ip", "link", "set", iface, "up"])?;
        Ok(())
    }

    pub fn set_default_route(&self, host: &NodeHandle, gateway: Ipv4Addr) -> Result<(), SubstrateError> {
        let gateway = gateway.to_string();
        self.executor
            .exec_checked(host, &["ip", "route", "replace", "default", "via", &gateway])?;
        Ok(())
    }

    /// Configure one node, stopping at its first failure.
    ///
    /// Returns the interfaces brought up before the failure, if any.
    pub fn configure_node(&self, graph: &TopologyGraph, id: NodeId) -> (Vec<String>, Option<SetupError>) {
        let node = graph.node(id);
        let error = |interface: Option<&str>, cause: String| SetupError::ConfigurationError {
            node: node.name.clone(),
            interface: interface.map(str::to_string),
            cause,
        };

        let Some(handle) = self.handles.get(&id) else {
            return (Vec::new(), Some(error(None, "node is not emulated".to_string())));
        };

        let mut configured = Vec::new();
        for iface in &node.interfaces {
            let Some(address) = iface.address else {
                continue;
            };
            if !self.emulated(iface.link) {
                log::debug!("{}: skipping {}, its link was not created", node.name, iface.name);
                continue;
            }
            if let Err(e) = self.configure_interface(handle, &iface.name, address) {
                return (configured, Some(error(Some(&iface.name), e.to_string())));
            }
            configured.push(iface.name.clone());
        }

        if !node.is_router() {
            let gateway = graph
                .edge_subnets()
                .into_iter()
                .find(|e| e.host == id && self.emulated(e.link))
                .map(|e| e.gateway);
            if let Some(gateway) = gateway {
                if let Err(e) = self.set_default_route(handle, gateway) {
                    return (configured, Some(error(None, e.to_string())));
                }
            }
        }

        (configured, None)
    }

    /// Configure all nodes in parallel. A failing node does not hold up the others.
    pub fn configure_all(&self, graph: &TopologyGraph) -> InterfaceOutcome {
        let results: Vec<_> = graph
            .nodes()
            .par_iter()
            .map(|node| (node.id, self.configure_node(graph, node.id)))
            .collect();

        let mut outcome = InterfaceOutcome::default();
        for (id, (configured, error)) in results {
            outcome
                .configured
                .extend(configured.into_iter().map(|iface| (id, iface)));
            if let Some(error) = error {
                log::warn!("{}", error);
                outcome.errors.push(error);
            }
        }
        log::info!(
            "Configured {} interfaces ({} nodes failed)",
            outcome.configured.len(),
            outcome.errors.len()
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TopologyConfig;
    use crate::ip::AddressPlanner;
    use crate::substrate::{SimulatedSubstrate, Substrate};
    use std::sync::Arc;
    use std::time::Duration;

    const LINE: &str = r#"
routers:
  - name: r0
  - name: r1
hosts:
  - name: pc0
    router: r0
    subnet: 10.0.0.0/24
  - name: pc1
    router: r1
    subnet: 10.1.1.0/24
links:
  - { a: r0, b: r1 }
"#;

    fn setup() -> (Arc<SimulatedSubstrate>, NodeExecutor, TopologyGraph, BTreeMap<NodeId, NodeHandle>) {
        let config: TopologyConfig = serde_yaml::from_str(LINE).unwrap();
        let mut graph = TopologyGraph::from_config(&config).unwrap();
        let plan = AddressPlanner::from_config(&config).plan(&graph).unwrap();
        graph.apply_plan(&plan);

        let sim = Arc::new(SimulatedSubstrate::new());
        let mut handles = BTreeMap::new();
        for node in graph.nodes() {
            handles.insert(node.id, sim.create_node(&node.name, node.kind).unwrap());
        }
        for link in graph.links() {
            sim.create_link(
                &handles[&link.a.node],
                &link.a.interface,
                &handles[&link.b.node],
                &link.b.interface,
                link.bandwidth,
            )
            .unwrap();
        }
        let executor = NodeExecutor::new(sim.clone(), Duration::from_secs(1));
        (sim, executor, graph, handles)
    }

    #[test]
    fn test_configure_all_assigns_addresses_and_default_routes() {
        let (sim, executor, graph, handles) = setup();
        let outcome = InterfaceConfigurator::new(&executor, &handles).configure_all(&graph);

        assert!(outcome.errors.is_empty(), "{:?}", outcome.errors);
        assert_eq!(outcome.configured.len(), 6);
        assert_eq!(sim.addresses("r0", "r0-eth0")[0].to_string(), "10.0.0.254/24");
        assert!(sim.interface_up("pc1", "pc1-eth0"));
        assert_eq!(sim.default_gateway("pc1"), Some(Ipv4Addr::new(10, 1, 1, 254)));
        assert_eq!(sim.default_gateway("r0"), None);
    }

    #[test]
    fn test_reconfiguration_converges() {
        let (sim, executor, graph, handles) = setup();
        let configurator = InterfaceConfigurator::new(&executor, &handles);
        configurator.configure_all(&graph);
        let again = configurator.configure_all(&graph);

        assert!(again.errors.is_empty(), "{:?}", again.errors);
        assert_eq!(sim.addresses("r1", "r1-eth1").len(), 1);
        assert_eq!(sim.routes("pc0").len(), 1);
    }

    #[test]
    fn test_failure_is_isolated_to_one_node() {
        let (sim, executor, graph, handles) = setup();
        sim.fail_when("r1", "ip addr add");
        let outcome = InterfaceConfigurator::new(&executor, &handles).configure_all(&graph);

        assert_eq!(outcome.errors.len(), 1);
        match &outcome.errors[0] {
            SetupError::ConfigurationError { node, interface, .. } => {
                assert_eq!(node, "r1");
                // the edge interface comes first and aborts the rest of r1
                assert_eq!(interface.as_deref(), Some("r1-eth0"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(!sim.interface_up("r1", "r1-eth1"));
        assert!(sim.interface_up("r0", "r0-eth1"));
        assert!(sim.interface_up("pc1", "pc1-eth0"));
    }

    #[test]
    fn test_missing_link_does_not_stop_the_node() {
        let config: TopologyConfig = serde_yaml::from_str(
            r#"
routers:
  - name: r0
  - name: r1
  - name: r2
links:
  - { a: r0, b: r1 }
  - { a: r0, b: r2 }
"#,
        )
        .unwrap();
        let mut graph = TopologyGraph::from_config(&config).unwrap();
        graph.apply_plan(&AddressPlanner::from_config(&config).plan(&graph).unwrap());

        let sim = Arc::new(SimulatedSubstrate::new());
        let handles: BTreeMap<_, _> = graph
            .nodes()
            .iter()
            .map(|n| (n.id, sim.create_node(&n.name, n.kind).unwrap()))
            .collect();
        // r0 <-> r1 never made it into the substrate
        let mut links = BTreeMap::new();
        let link = graph.find_link("r0", "r2").unwrap();
        let l = graph.link(link);
        let created = sim
            .create_link(&handles[&l.a.node], &l.a.interface, &handles[&l.b.node], &l.b.interface, None)
            .unwrap();
        links.insert(link, created);

        let executor = NodeExecutor::new(sim.clone(), Duration::from_secs(1));
        let outcome = InterfaceConfigurator::new(&executor, &handles)
            .with_links(&links)
            .configure_all(&graph);

        assert!(outcome.errors.is_empty(), "{:?}", outcome.errors);
        assert!(sim.interface_up("r0", "r0-eth1"));
        assert!(sim.interface_up("r2", "r2-eth0"));
        assert_eq!(outcome.configured.len(), 2);
    }

    #[test]
    fn test_missing_handle_is_reported() {
        let (_sim, executor, graph, mut handles) = setup();
        handles.remove(&0);
        let outcome = InterfaceConfigurator::new(&executor, &handles).configure_all(&graph);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].node(), "r0");
    }
}
