//! Network orchestrator.
//!
//! Drives a topology through its lifecycle:
//!
//! ```text
//! Built -> AddressesPlanned -> Emulating -> InterfacesConfigured
//!       -> ServicesStarted -> RoutesApplied -> Running -> Stopped
//! ```
//!
//! Each transition calls one component. Only planning can abort the run;
//! everything after it isolates failures per node, entry or service,
//! collects them and keeps going, so a run with local failures still
//! reaches `Running` in a degraded state. `Stopped` is reachable from
//! any phase.

use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::TopologyConfig;
use crate::configure::InterfaceConfigurator;
use crate::error::{Error, SetupError, SubstrateError};
use crate::ip::{AddressPlan, AddressPlanner};
use crate::process::{LaunchedService, ServiceLauncher};
use crate::report::SetupReport;
use crate::routing::{RouteApplier, RouteComputer, RouteEntry, RoutingPlan};
use crate::substrate::{ExecOutput, LinkHandle, NodeExecutor, NodeHandle, Substrate};
use crate::topology::{InterfaceState, LinkId, NodeId, TopologyGraph};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Built,
    AddressesPlanned,
    Emulating,
    InterfacesConfigured,
    ServicesStarted,
    RoutesApplied,
    Running,
    Stopped,
}

pub struct NetworkOrchestrator {
    config: TopologyConfig,
    graph: TopologyGraph,
    executor: NodeExecutor,
    pool: rayon::ThreadPool,
    phase: Phase,
    address_plan: Option<AddressPlan>,
    routing_plan: Option<RoutingPlan>,
    handles: BTreeMap<NodeId, NodeHandle>,
    links: BTreeMap<LinkId, LinkHandle>,
    installed: BTreeMap<String, Vec<RouteEntry>>,
    services: Vec<LaunchedService>,
    errors: Vec<SetupError>,
}

impl NetworkOrchestrator {
    /// Validate the description and build the topology graph
    pub fn new(config: TopologyConfig, substrate: Arc<dyn Substrate>) -> Result<Self, Error> {
        let graph = TopologyGraph::from_config(&config)?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(graph.nodes().len().max(1))
            .thread_name(|i| format!("node-worker-{}", i))
            .build()?;
        let executor = NodeExecutor::new(substrate, config.general.command_timeout);

        log::info!(
            "Topology built: {} routers, {} hosts, {} links",
            graph.routers().count(),
            graph.hosts().count(),
            graph.links().len()
        );

        Ok(Self {
            config,
            graph,
            executor,
            pool,
            phase: Phase::Built,
            address_plan: None,
            routing_plan: None,
            handles: BTreeMap::new(),
            links: BTreeMap::new(),
            installed: BTreeMap::new(),
            services: Vec::new(),
            errors: Vec::new(),
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn graph(&self) -> &TopologyGraph {
        &self.graph
    }

    pub fn config(&self) -> &TopologyConfig {
        &self.config
    }

    pub fn address_plan(&self) -> Option<&AddressPlan> {
        self.address_plan.as_ref()
    }

    pub fn routing_plan(&self) -> Option<&RoutingPlan> {
        self.routing_plan.as_ref()
    }

    /// Routes present in the kernels, per router
    pub fn installed_routes(&self) -> &BTreeMap<String, Vec<RouteEntry>> {
        &self.installed
    }

    pub fn services(&self) -> &[LaunchedService] {
        &self.services
    }

    pub fn errors(&self) -> &[SetupError] {
        &self.errors
    }

    pub fn substrate_name(&self) -> &'static str {
        self.executor.substrate().name()
    }

    /// True once any failure other than an expected unreachable destination was recorded
    pub fn is_degraded(&self) -> bool {
        self.errors.iter().any(|e| !e.is_expected())
    }

    pub fn report(&self) -> SetupReport {
        SetupReport::from_orchestrator(self)
    }

    fn advance(&mut self, expected: Phase, next: Phase, action: &'static str) -> Result<(), Error> {
        if self.phase != expected {
            return Err(Error::InvalidPhase {
                action,
                actual: self.phase,
            });
        }
        log::info!("Phase {:?} -> {:?}", self.phase, next);
        self.phase = next;
        Ok(())
    }

    fn record(&mut self, errors: impl IntoIterator<Item = SetupError>) {
        self.errors.extend(errors);
    }

    /// Run every setup phase up to `Running`
    pub fn setup(&mut self) -> Result<(), Error> {
        self.plan_addresses()?;
        self.start_emulation()?;
        self.configure_interfaces()?;
        self.start_services()?;
        self.apply_routes()?;
        self.advance(Phase::RoutesApplied, Phase::Running, "hand over to the operator")?;

        if self.is_degraded() {
            log::warn!(
                "Network is running degraded with {} recorded failures",
                self.errors.iter().filter(|e| !e.is_expected()).count()
            );
        } else {
            log::info!("Network is running");
        }
        Ok(())
    }

    /// Derive the addressing plan. Failures here abort the run.
    pub fn plan_addresses(&mut self) -> Result<&AddressPlan, Error> {
        if self.phase != Phase::Built {
            return Err(Error::InvalidPhase {
                action: "plan addresses",
                actual: self.phase,
            });
        }
        let plan = AddressPlanner::from_config(&self.config).plan(&self.graph)?;
        self.graph.apply_plan(&plan);
        self.advance(Phase::Built, Phase::AddressesPlanned, "plan addresses")?;
        Ok(self.address_plan.insert(plan))
    }

    /// Compute routes without touching any substrate
    pub fn compute_routes(&self) -> RoutingPlan {
        let computer = RouteComputer::from_config(&self.config.general);
        self.pool.install(|| computer.compute(&self.graph))
    }

    /// Create every node and link in the substrate
    pub fn start_emulation(&mut self) -> Result<(), Error> {
        self.advance(Phase::AddressesPlanned, Phase::Emulating, "start emulation")?;

        let substrate = self.executor.substrate().clone();
        let graph = &self.graph;
        let created: Vec<_> = self.pool.install(|| {
            graph
                .nodes()
                .par_iter()
                .map(|node| (node.id, substrate.create_node(&node.name, node.kind)))
                .collect()
        });

        let mut errors = Vec::new();
        for (id, result) in created {
            match result {
                Ok(handle) => {
                    self.handles.insert(id, handle);
                }
                Err(e) => errors.push(SetupError::ConfigurationError {
                    node: self.graph.node(id).name.clone(),
                    interface: None,
                    cause: e.to_string(),
                }),
            }
        }

        for link in self.graph.links() {
            let (Some(a), Some(b)) = (self.handles.get(&link.a.node), self.handles.get(&link.b.node)) else {
                log::debug!("Skipping link {}: endpoint not emulated", link.id);
                continue;
            };
            match substrate.create_link(a, &link.a.interface, b, &link.b.interface, link.bandwidth) {
                Ok(handle) => {
                    self.links.insert(link.id, handle);
                }
                Err(e) => errors.push(SetupError::ConfigurationError {
                    node: a.name.clone(),
                    interface: Some(link.a.interface.clone()),
                    cause: e.to_string(),
                }),
            }
        }

        for error in &errors {
            log::warn!("{}", error);
        }
        log::info!(
            "Emulating {} nodes and {} links on {}",
            self.handles.len(),
            self.links.len(),
            substrate.name()
        );
        self.record(errors);
        Ok(())
    }

    /// Address every interface, then enable forwarding on routers
    pub fn configure_interfaces(&mut self) -> Result<(), Error> {
        self.advance(Phase::Emulating, Phase::InterfacesConfigured, "configure interfaces")?;

        let configurator = InterfaceConfigurator::new(&self.executor, &self.handles).with_links(&self.links);
        let graph = &self.graph;
        let outcome = self.pool.install(|| configurator.configure_all(graph));

        for (id, iface) in &outcome.configured {
            if let Some(iface) = self.graph.node_mut(*id).interface_mut(iface) {
                iface.state = InterfaceState::Up;
            }
        }
        self.record(outcome.errors);

        let errors = self.set_forwarding(true);
        self.record(errors);
        Ok(())
    }

    /// Toggle IPv4 forwarding on every emulated router
    fn set_forwarding(&mut self, enabled: bool) -> Vec<SetupError> {
        let value = if enabled { "1" } else { "0" };
        let setting = format!("net.ipv4.ip_forward={}", value);
        let routers: Vec<NodeId> = self.graph.routers().map(|r| r.id).collect();

        let mut errors = Vec::new();
        for id in routers {
            let Some(handle) = self.handles.get(&id) else {
                continue;
            };
            match self.executor.exec_checked(handle, &["sysctl", "-w", &setting]) {
                Ok(_) => self.graph.node_mut(id).set_forwarding(enabled),
                Err(e) => {
                    let error = SetupError::ConfigurationError {
                        node: handle.name.clone(),
                        interface: None,
                        cause: format!("failed to set forwarding: {}", e),
                    };
                    log::warn!("{}", error);
                    errors.push(error);
                }
            }
        }
        errors
    }

    pub fn start_services(&mut self) -> Result<(), Error> {
        self.advance(Phase::InterfacesConfigured, Phase::ServicesStarted, "start services")?;

        let launcher = ServiceLauncher::new(&self.executor, &self.handles);
        let graph = &self.graph;
        let outcome = self.pool.install(|| launcher.launch_all(graph));
        self.services = outcome.launched;
        self.record(outcome.errors);
        Ok(())
    }

    pub fn apply_routes(&mut self) -> Result<(), Error> {
        self.advance(Phase::ServicesStarted, Phase::RoutesApplied, "apply routes")?;
        let errors = self.reconcile_routes();
        self.record(errors);
        Ok(())
    }

    /// Recompute the routing plan over the links that actually carry
    /// traffic and push it
    fn reconcile_routes(&mut self) -> Vec<SetupError> {
        let computer = RouteComputer::from_config(&self.config.general);
        let operational = self.graph.operational();
        let plan = self.pool.install(|| computer.compute(&operational));
        let applier = RouteApplier::new(&self.executor, &self.handles);
        let outcome = self.pool.install(|| applier.apply(&plan));

        let mut errors = plan.unreachable.clone();
        errors.extend(outcome.errors);
        self.installed = outcome.installed;
        self.routing_plan = Some(plan);
        errors
    }

    /// Take a router link up or down and re-route around it.
    ///
    /// A link whose state change fails halfway is treated as down, so
    /// routes never rely on it. Returns the failures of the
    /// reconfiguration; they are also recorded.
    pub fn set_link_state(&mut self, a: &str, b: &str, up: bool) -> Result<Vec<SetupError>, Error> {
        if self.phase != Phase::Running {
            return Err(Error::InvalidPhase {
                action: "change link state",
                actual: self.phase,
            });
        }
        let id = self.graph.find_link(a, b)?;
        let handle = self.links.get(&id).ok_or_else(|| SubstrateError::UnknownLink {
            a: a.to_string(),
            b: b.to_string(),
        })?;

        let mut errors = Vec::new();
        let up = match self.executor.set_link_state(handle, up) {
            Ok(()) => up,
            Err(e) => {
                let error = SetupError::ConfigurationError {
                    node: handle.a.name.clone(),
                    interface: Some(handle.iface_a.clone()),
                    cause: format!("link {} <-> {} left down: {}", a, b, e),
                };
                log::warn!("{}", error);
                errors.push(error);
                false
            }
        };

        self.graph.set_link_up(id, up);
        let link = self.graph.link(id).clone();
        let state = if up { InterfaceState::Up } else { InterfaceState::Down };
        for endpoint in [&link.a, &link.b] {
            if let Some(iface) = self.graph.node_mut(endpoint.node).interface_mut(&endpoint.interface) {
                iface.state = state;
            }
        }
        log::info!("Link {} <-> {} is {}", a, b, if up { "up" } else { "down" });

        errors.extend(self.reconcile_routes());
        self.record(errors.clone());
        Ok(errors)
    }

    /// Run a command inside a node
    pub fn exec(&self, node: &str, argv: &[&str]) -> Result<ExecOutput, Error> {
        let id = self.graph.node_by_name(node)?.id;
        let handle = self
            .handles
            .get(&id)
            .ok_or_else(|| SubstrateError::UnknownNode(node.to_string()))?;
        Ok(self.executor.exec(handle, argv)?)
    }

    /// Revert forwarding and tear the emulation down. Safe from any
    /// phase and after partial setup; problems are logged, never returned.
    pub fn stop(&mut self) {
        if self.phase == Phase::Stopped {
            return;
        }
        log::info!("Phase {:?} -> {:?}", self.phase, Phase::Stopped);

        for error in self.set_forwarding(false) {
            log::warn!("Teardown: {}", error);
        }

        for (_, link) in std::mem::take(&mut self.links) {
            if let Err(e) = self.executor.destroy_link(&link) {
                log::debug!("Teardown: link {}:{} already gone: {}", link.a.name, link.iface_a, e);
            }
        }
        for (_, handle) in std::mem::take(&mut self.handles) {
            if let Err(e) = self.executor.substrate().destroy_node(&handle) {
                log::warn!("Teardown: failed to remove {}: {}", handle.name, e);
            }
        }
        self.phase = Phase::Stopped;
    }
}

impl Drop for NetworkOrchestrator {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::SimulatedSubstrate;

    const SQUARE: &str = r#"
routers:
  - name: r0
    services:
      - { name: zebra, command: "zebra -d" }
  - name: r1
  - name: r2
  - name: r3
hosts:
  - { name: pc0, router: r0, subnet: 10.0.0.0/24 }
  - { name: pc2, router: r2, subnet: 10.2.2.0/24 }
links:
  - { a: r0, b: r1 }
  - { a: r1, b: r2 }
  - { a: r2, b: r3 }
  - { a: r3, b: r0 }
"#;

    fn orchestrator(sim: &Arc<SimulatedSubstrate>) -> NetworkOrchestrator {
        let config: TopologyConfig = serde_yaml::from_str(SQUARE).unwrap();
        NetworkOrchestrator::new(config, sim.clone()).unwrap()
    }

    #[test]
    fn test_setup_reaches_running() {
        let sim = Arc::new(SimulatedSubstrate::new());
        let mut orch = orchestrator(&sim);
        orch.setup().unwrap();

        assert_eq!(orch.phase(), Phase::Running);
        assert!(!orch.is_degraded(), "{:?}", orch.errors());
        assert!(sim.forwarding("r1"));
        assert!(!sim.forwarding("pc0"));
        assert!(orch.graph().node_by_name("r3").unwrap().forwarding);
        assert_eq!(orch.services().len(), 1);
        assert!(orch
            .graph()
            .nodes()
            .iter()
            .flat_map(|n| n.interfaces.iter())
            .all(|i| i.state == InterfaceState::Up));
        assert_eq!(
            sim.trace("pc0", "10.2.2.1".parse().unwrap()).unwrap().len(),
            5
        );
    }

    #[test]
    fn test_phases_only_move_forward() {
        let sim = Arc::new(SimulatedSubstrate::new());
        let mut orch = orchestrator(&sim);
        assert!(matches!(
            orch.configure_interfaces(),
            Err(Error::InvalidPhase { actual: Phase::Built, .. })
        ));
        orch.plan_addresses().unwrap();
        assert!(orch.plan_addresses().is_err());
        assert_eq!(orch.phase(), Phase::AddressesPlanned);
    }

    #[test]
    fn test_partial_failure_still_runs_degraded() {
        let sim = Arc::new(SimulatedSubstrate::new());
        sim.fail_when("r3", "ip addr add");
        let mut orch = orchestrator(&sim);
        orch.setup().unwrap();

        assert_eq!(orch.phase(), Phase::Running);
        assert!(orch.is_degraded());
        assert!(orch.errors().iter().any(|e| e.node() == "r3"));
        // r0 still reaches pc2 over r1
        assert_eq!(
            sim.trace("pc0", "10.2.2.1".parse().unwrap()).unwrap(),
            vec!["pc0", "r0", "r1", "r2", "pc2"]
        );
    }

    #[test]
    fn test_unconfigured_router_is_not_a_nexthop() {
        let sim = Arc::new(SimulatedSubstrate::new());
        sim.fail_when("r1", "ip addr add");
        let mut orch = orchestrator(&sim);
        orch.setup().unwrap();

        let r0 = orch.routing_plan().unwrap().table("r0").unwrap();
        let dest = r0.destination("10.2.2.0/24".parse().unwrap()).unwrap();
        assert_eq!(dest.entries.len(), 1);
        assert_eq!(dest.primary().unwrap().link, orch.graph().find_link("r0", "r3").unwrap());
        assert_eq!(
            sim.trace("pc0", "10.2.2.1".parse().unwrap()).unwrap(),
            vec!["pc0", "r0", "r3", "r2", "pc2"]
        );
    }

    #[test]
    fn test_missing_link_is_routed_around() {
        let sim = Arc::new(SimulatedSubstrate::new());
        sim.fail_when("r0", "r0-eth1 type veth");
        let mut orch = orchestrator(&sim);
        orch.setup().unwrap();

        let failures: Vec<_> = orch.errors().iter().filter(|e| !e.is_expected()).collect();
        assert_eq!(failures.len(), 1, "{:?}", failures);
        assert!(matches!(
            failures[0],
            SetupError::ConfigurationError { node, interface: Some(iface), .. }
                if node == "r0" && iface == "r0-eth1"
        ));
        // r1's other side still came up
        assert!(sim.interface_up("r1", "r1-eth1"));
        assert_eq!(
            sim.trace("pc0", "10.2.2.1".parse().unwrap()).unwrap(),
            vec!["pc0", "r0", "r3", "r2", "pc2"]
        );
        assert!(matches!(
            orch.set_link_state("r0", "r1", false),
            Err(Error::Substrate(SubstrateError::UnknownLink { .. }))
        ));
    }

    #[test]
    fn test_half_failed_link_change_counts_as_down() {
        let sim = Arc::new(SimulatedSubstrate::new());
        let mut orch = orchestrator(&sim);
        orch.setup().unwrap();
        sim.fail_when("r1", "ip link set r1-eth0 down");

        let errors = orch.set_link_state("r0", "r1", false).unwrap();
        assert_eq!(errors.len(), 1, "{:?}", errors);
        assert!(errors[0].to_string().contains("left down"));
        let link = orch.graph().find_link("r0", "r1").unwrap();
        assert!(!orch.graph().link(link).up);
        assert_eq!(
            sim.trace("pc0", "10.2.2.1".parse().unwrap()).unwrap(),
            vec!["pc0", "r0", "r3", "r2", "pc2"]
        );
        assert!(orch.is_degraded());
    }

    #[test]
    fn test_link_down_reroutes() {
        let sim = Arc::new(SimulatedSubstrate::new());
        let mut orch = orchestrator(&sim);
        orch.setup().unwrap();

        let errors = orch.set_link_state("r0", "r1", false).unwrap();
        assert!(errors.is_empty(), "{:?}", errors);
        let path = sim.trace("pc0", "10.2.2.1".parse().unwrap()).unwrap();
        assert_eq!(path, vec!["pc0", "r0", "r3", "r2", "pc2"]);

        let r0 = orch.routing_plan().unwrap().table("r0").unwrap();
        let dest = r0.destination("10.2.2.0/24".parse().unwrap()).unwrap();
        assert_eq!(dest.entries.len(), 1);

        orch.set_link_state("r0", "r1", true).unwrap();
        let dest_count = orch.routing_plan().unwrap().table("r0").unwrap().destinations[0]
            .entries
            .len();
        assert_eq!(dest_count, 2);
    }

    #[test]
    fn test_stop_is_idempotent_and_reverts_forwarding() {
        let sim = Arc::new(SimulatedSubstrate::new());
        let mut orch = orchestrator(&sim);
        orch.setup().unwrap();
        orch.stop();
        orch.stop();

        assert_eq!(orch.phase(), Phase::Stopped);
        assert_eq!(sim.node_count(), 0);
        assert!(orch.graph().routers().all(|r| !r.forwarding));
        assert!(matches!(
            orch.set_link_state("r0", "r1", false),
            Err(Error::InvalidPhase { .. })
        ));
    }

    #[test]
    fn test_stop_after_partial_setup() {
        let sim = Arc::new(SimulatedSubstrate::new());
        {
            let mut orch = orchestrator(&sim);
            orch.plan_addresses().unwrap();
            orch.start_emulation().unwrap();
            assert_eq!(sim.node_count(), 6);
        }
        // dropped without an explicit stop
        assert_eq!(sim.node_count(), 0);
    }

    #[test]
    fn test_exec_in_node() {
        let sim = Arc::new(SimulatedSubstrate::new());
        let mut orch = orchestrator(&sim);
        orch.setup().unwrap();

        let output = orch.exec("pc0", &["ping", "-c", "1", "10.2.2.1"]).unwrap();
        assert!(output.success(), "{}", output.stderr);
        assert!(matches!(orch.exec("nope", &["true"]), Err(Error::Topology(_))));
    }
}
