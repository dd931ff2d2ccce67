#[cfg(test)]
mod emulation_tests {
    use std::collections::BTreeMap;
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use std::time::Duration;

    use routemesh::config::TopologyConfig;
    use routemesh::configure::InterfaceConfigurator;
    use routemesh::ip::AddressPlanner;
    use routemesh::orchestrator::{NetworkOrchestrator, Phase};
    use routemesh::routing::{RouteApplier, RouteComputer};
    use routemesh::substrate::{NodeExecutor, SimulatedSubstrate, Substrate};
    use routemesh::topology::TopologyGraph;
    use routemesh::SetupError;

    /// Four routers in a full mesh, one host behind each
    const FULL_MESH: &str = r#"
general:
  command_timeout: 1s
routers:
  - name: r0
  - name: r1
  - name: r2
  - name: r3
hosts:
  - { name: pc0, router: r0, subnet: 10.0.0.0/24 }
  - { name: pc1, router: r1, subnet: 10.1.1.0/24 }
  - { name: ftp, router: r2, subnet: 10.2.2.0/24, services: [{ name: ftpd, command: "vsftpd" }] }
  - { name: web, router: r3, subnet: 10.3.3.0/24, services: [{ name: http, command: "python3 -m http.server 80" }] }
links:
  - { a: r0, b: r1, bandwidth: 1000 }
  - { a: r0, b: r2, bandwidth: 1000 }
  - { a: r0, b: r3, bandwidth: 1000 }
  - { a: r1, b: r2, bandwidth: 1000 }
  - { a: r1, b: r3, bandwidth: 1000 }
  - { a: r2, b: r3, bandwidth: 1000 }
"#;

    const HOSTS: [(&str, &str); 4] = [
        ("pc0", "10.0.0.1"),
        ("pc1", "10.1.1.1"),
        ("ftp", "10.2.2.1"),
        ("web", "10.3.3.1"),
    ];

    fn running_mesh() -> (Arc<SimulatedSubstrate>, NetworkOrchestrator) {
        let config: TopologyConfig = serde_yaml::from_str(FULL_MESH).unwrap();
        let sim = Arc::new(SimulatedSubstrate::new());
        let mut network = NetworkOrchestrator::new(config, sim.clone()).unwrap();
        network.setup().unwrap();
        (sim, network)
    }

    fn addr(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn test_every_host_pair_is_reachable() {
        let (sim, network) = running_mesh();
        assert_eq!(network.phase(), Phase::Running);
        assert!(network.errors().is_empty(), "{:?}", network.errors());

        for (from, _) in HOSTS {
            for (to, address) in HOSTS {
                if from == to {
                    continue;
                }
                let path = sim.trace(from, addr(address)).unwrap();
                assert_eq!(path.len(), 4, "{} -> {}: {:?}", from, to, path);
                assert_eq!(path.last().map(String::as_str), Some(to));
            }
        }
        assert_eq!(sim.processes("web").len(), 1);
        assert_eq!(sim.bandwidth("r0", "r0-eth1"), Some(1000));
    }

    #[test]
    fn test_web_subnet_from_r0_has_ranked_candidates() {
        let (_sim, network) = running_mesh();
        let table = network.routing_plan().unwrap().table("r0").unwrap();
        let web = table.destination("10.3.3.0/24".parse().unwrap()).unwrap();

        assert!(web.entries.len() >= 2);
        let direct = network.graph().find_link("r0", "r3").unwrap();
        assert_eq!(web.primary().unwrap().link, direct);
        let metrics: Vec<u32> = web.entries.iter().map(|e| e.metric).collect();
        let mut sorted = metrics.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(metrics, sorted, "metrics must be strictly increasing");
    }

    #[test]
    fn test_removing_r0_r1_reroutes_through_r2_or_r3() {
        let (sim, mut network) = running_mesh();
        let errors = network.set_link_state("r0", "r1", false).unwrap();
        assert!(errors.is_empty(), "{:?}", errors);

        let path = sim.trace("pc0", addr("10.1.1.1")).unwrap();
        assert_eq!(path.len(), 5);
        assert!(path[2] == "r2" || path[2] == "r3", "{:?}", path);

        let back = sim.trace("pc1", addr("10.0.0.1")).unwrap();
        assert!(back[2] == "r2" || back[2] == "r3", "{:?}", back);
    }

    #[test]
    fn test_link_flap_restores_original_routes() {
        let (sim, mut network) = running_mesh();
        let before: BTreeMap<String, _> = ["r0", "r1", "r2", "r3"]
            .iter()
            .map(|r| (r.to_string(), sim.routes(r)))
            .collect();

        network.set_link_state("r1", "r3", false).unwrap();
        assert_ne!(sim.routes("r1"), before["r1"]);
        network.set_link_state("r1", "r3", true).unwrap();

        for (router, routes) in &before {
            let mut now = sim.routes(router);
            let mut expected = routes.clone();
            now.sort_by_key(|r| (r.destination, r.metric));
            expected.sort_by_key(|r| (r.destination, r.metric));
            assert_eq!(now, expected, "{}", router);
        }
    }

    #[test]
    fn test_components_reapply_idempotently() {
        let config: TopologyConfig = serde_yaml::from_str(FULL_MESH).unwrap();
        let mut graph = TopologyGraph::from_config(&config).unwrap();
        graph.apply_plan(&AddressPlanner::from_config(&config).plan(&graph).unwrap());

        let sim = Arc::new(SimulatedSubstrate::new());
        let handles: BTreeMap<_, _> = graph
            .nodes()
            .iter()
            .map(|n| (n.id, sim.create_node(&n.name, n.kind).unwrap()))
            .collect();
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
        let configurator = InterfaceConfigurator::new(&executor, &handles);
        let applier = RouteApplier::new(&executor, &handles);
        let plan = RouteComputer::from_config(&config.general).compute(&graph);

        for _ in 0..2 {
            assert!(configurator.configure_all(&graph).errors.is_empty());
            assert!(applier.apply(&plan).errors.is_empty());
        }

        for node in graph.nodes() {
            for iface in &node.interfaces {
                assert_eq!(sim.addresses(&node.name, &iface.name).len(), 1);
            }
        }
        // 4 routers x 3 remote subnets x 3 next-hops
        let total: usize = ["r0", "r1", "r2", "r3"].iter().map(|r| sim.routes(r).len()).sum();
        assert_eq!(total, 36);
    }

    #[test]
    fn test_router_outage_is_isolated() {
        let config: TopologyConfig = serde_yaml::from_str(FULL_MESH).unwrap();
        let sim = Arc::new(SimulatedSubstrate::new());
        sim.hang_when("r1", "ip link set");
        let mut network = NetworkOrchestrator::new(config, sim.clone()).unwrap();
        network.setup().unwrap();

        assert_eq!(network.phase(), Phase::Running);
        assert!(network.is_degraded());
        let config_errors: Vec<_> = network
            .errors()
            .iter()
            .filter(|e| matches!(e, SetupError::ConfigurationError { .. }))
            .collect();
        assert_eq!(config_errors.len(), 1);
        assert!(config_errors[0].to_string().contains("timed out"));

        // r0 keeps reaching ftp and web directly
        assert_eq!(sim.trace("pc0", addr("10.3.3.1")).unwrap().len(), 4);
        assert_eq!(sim.trace("pc0", addr("10.2.2.1")).unwrap().len(), 4);

        let report = network.report();
        assert!(report.degraded);
        assert!(report.summary().contains("r1"));
    }

    #[test]
    fn test_router_creation_failure_is_isolated() {
        let config: TopologyConfig = serde_yaml::from_str(FULL_MESH).unwrap();
        let sim = Arc::new(SimulatedSubstrate::new());
        sim.fail_when("r1", "ip netns add");
        let mut network = NetworkOrchestrator::new(config, sim.clone()).unwrap();
        network.setup().unwrap();

        assert_eq!(network.phase(), Phase::Running);
        assert!(network.is_degraded());
        assert!(!sim.has_node("r1"));
        for error in network.errors().iter().filter(|e| !e.is_expected()) {
            assert_eq!(error.node(), "r1", "{}", error);
        }

        // r0 keeps its links to r2 and r3
        assert!(sim.interface_up("r0", "r0-eth2"));
        assert!(sim.interface_up("r0", "r0-eth3"));
        assert_eq!(sim.trace("pc0", addr("10.2.2.1")).unwrap().len(), 4);
        assert_eq!(sim.trace("pc0", addr("10.3.3.1")).unwrap().len(), 4);
        assert_eq!(sim.trace("web", addr("10.0.0.1")).unwrap().len(), 4);
        assert!(sim.trace("pc0", addr("10.1.1.1")).is_err());
    }

    #[test]
    fn test_route_install_timeout_is_isolated() {
        let config: TopologyConfig = serde_yaml::from_str(FULL_MESH).unwrap();
        let sim = Arc::new(SimulatedSubstrate::new());
        sim.hang_when("r2", "route add");
        let mut network = NetworkOrchestrator::new(config, sim.clone()).unwrap();
        network.setup().unwrap();

        assert!(network.is_degraded());
        // 3 remote subnets x 3 next-hops, all on r2
        assert_eq!(network.errors().len(), 9, "{:?}", network.errors());
        for error in network.errors() {
            assert!(matches!(error, SetupError::RouteInstallError { router, .. } if router == "r2"));
            assert!(error.to_string().contains("timed out"), "{}", error);
        }
        assert!(network.installed_routes()["r2"].is_empty());
        assert_eq!(network.installed_routes()["r0"].len(), 9);

        assert_eq!(sim.trace("pc0", addr("10.2.2.1")).unwrap(), vec!["pc0", "r0", "r2", "ftp"]);
        assert_eq!(sim.trace("pc0", addr("10.3.3.1")).unwrap().len(), 4);
        assert!(sim.trace("ftp", addr("10.0.0.1")).is_err());
    }

    #[test]
    fn test_teardown_removes_everything() {
        let (sim, mut network) = running_mesh();
        assert_eq!(sim.node_count(), 8);
        network.stop();
        assert_eq!(sim.node_count(), 0);
        assert_eq!(network.phase(), Phase::Stopped);
    }
}
