//! In-memory substrate.
//!
//! Interprets the subset of `ip`, `sysctl`, `sh` and `ping` invocations
//! that the configurators emit, and keeps enough kernel-like state to
//! trace packets hop by hop over the installed routes. Used by
//! `--dry-run` and by the test suite. Faults can be injected per node.

use ipnet::Ipv4Net;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::time::Duration;

use super::{ExecOutput, LinkHandle, NodeHandle, Substrate};
use crate::error::SubstrateError;
use crate::topology::NodeKind;

const MAX_HOPS: usize = 32;

/// A route as the simulated kernel holds it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimRoute {
    pub destination: Ipv4Net,
    pub via: Ipv4Addr,
    pub dev: Option<String>,
    pub metric: u32,
}

#[derive(Debug, Clone, Default)]
struct SimInterface {
    addresses: Vec<Ipv4Net>,
    up: bool,
    bandwidth: Option<u32>,
    /// (node, interface) on the other end of the veth
    peer: Option<(String, String)>,
}

#[derive(Debug, Clone)]
struct SimNode {
    kind: NodeKind,
    interfaces: BTreeMap<String, SimInterface>,
    routes: Vec<SimRoute>,
    forwarding: bool,
    processes: Vec<String>,
    history: Vec<String>,
}

impl SimNode {
    fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            interfaces: BTreeMap::new(),
            routes: Vec::new(),
            forwarding: false,
            processes: Vec::new(),
            history: Vec::new(),
        }
    }

    fn owns(&self, addr: Ipv4Addr) -> bool {
        self.interfaces
            .values()
            .any(|i| i.addresses.iter().any(|a| a.addr() == addr))
    }

    /// Up interface with a connected subnet containing `addr`
    fn connected_dev(&self, addr: Ipv4Addr) -> Option<&str> {
        self.interfaces
            .iter()
            .find(|(_, i)| i.up && i.addresses.iter().any(|a| a.trunc().contains(&addr)))
            .map(|(name, _)| name.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fault {
    Fail,
    Hang,
}

#[derive(Debug, Clone)]
struct FaultRule {
    node: String,
    needle: String,
    fault: Fault,
}

#[derive(Debug, Default)]
pub struct SimulatedSubstrate {
    nodes: Mutex<BTreeMap<String, SimNode>>,
    faults: Mutex<Vec<FaultRule>>,
}

fn failed(code: i32, msg: impl Into<String>) -> Result<ExecOutput, SubstrateError> {
    Ok(ExecOutput::failed(code, msg))
}

impl SimulatedSubstrate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every command on `node` containing `needle` exit with status 1
    pub fn fail_when(&self, node: &str, needle: &str) {
        self.add_fault(node, needle, Fault::Fail);
    }

    /// Make every command on `node` containing `needle` time out
    pub fn hang_when(&self, node: &str, needle: &str) {
        self.add_fault(node, needle, Fault::Hang);
    }

    pub fn clear_faults(&self) {
        self.faults.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    fn add_fault(&self, node: &str, needle: &str, fault: Fault) {
        self.faults.lock().unwrap_or_else(|e| e.into_inner()).push(FaultRule {
            node: node.to_string(),
            needle: needle.to_string(),
            fault,
        });
    }

    fn fault_for(&self, node: &str, command: &str) -> Option<Fault> {
        self.faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|r| r.node == node && command.contains(&r.needle))
            .map(|r| r.fault)
    }

    fn with_node<T>(&self, node: &str, f: impl FnOnce(&SimNode) -> T) -> Option<T> {
        let nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        nodes.get(node).map(f)
    }

    pub fn has_node(&self, node: &str) -> bool {
        self.with_node(node, |_| ()).is_some()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn addresses(&self, node: &str, iface: &str) -> Vec<Ipv4Net> {
        self.with_node(node, |n| {
            n.interfaces
                .get(iface)
                .map(|i| i.addresses.clone())
                .unwrap_or_default()
        })
        .unwrap_or_default()
    }

    pub fn interface_up(&self, node: &str, iface: &str) -> bool {
        self.with_node(node, |n| n.interfaces.get(iface).map(|i| i.up))
            .flatten()
            .unwrap_or(false)
    }

    pub fn bandwidth(&self, node: &str, iface: &str) -> Option<u32> {
        self.with_node(node, |n| n.interfaces.get(iface).and_then(|i| i.bandwidth))
            .flatten()
    }

    pub fn routes(&self, node: &str) -> Vec<SimRoute> {
        self.with_node(node, |n| n.routes.clone()).unwrap_or_default()
    }

    pub fn default_gateway(&self, node: &str) -> Option<Ipv4Addr> {
        self.with_node(node, |n| {
            n.routes
                .iter()
                .find(|r| r.destination.prefix_len() == 0)
                .map(|r| r.via)
        })
        .flatten()
    }

    pub fn forwarding(&self, node: &str) -> bool {
        self.with_node(node, |n| n.forwarding).unwrap_or(false)
    }

    /// Background commands launched on `node`
    pub fn processes(&self, node: &str) -> Vec<String> {
        self.with_node(node, |n| n.processes.clone()).unwrap_or_default()
    }

    /// Every command run on `node`, in order
    pub fn history(&self, node: &str) -> Vec<String> {
        self.with_node(node, |n| n.history.clone()).unwrap_or_default()
    }

    /// Follow the installed routes from `from` towards `dst`.
    ///
    /// Returns the node names visited, ending with the owner of `dst`.
    pub fn trace(&self, from: &str, dst: Ipv4Addr) -> Result<Vec<String>, String> {
        let nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        let mut current = from.to_string();
        let mut path = vec![current.clone()];

        for _ in 0..MAX_HOPS {
            let node = nodes
                .get(&current)
                .ok_or_else(|| format!("{} does not exist", current))?;
            if node.owns(dst) {
                return Ok(path);
            }
            if current != from && !node.forwarding {
                return Err(format!("{} does not forward", current));
            }

            // Routes through an admin-down device are gone from the FIB, but a
            // lost carrier does not remove them: the kernel keeps using such a
            // route and the packet is dropped on the wire.
            let admin_up = |dev: &str| node.interfaces.get(dev).map_or(false, |i| i.up);
            let carrier = |dev: &str| {
                node.interfaces
                    .get(dev)
                    .and_then(|i| i.peer.as_ref())
                    .and_then(|(pn, pi)| nodes.get(pn).and_then(|p| p.interfaces.get(pi)))
                    .map_or(false, |p| p.up)
            };

            let (dev, gateway) = match node.connected_dev(dst) {
                Some(dev) => (dev.to_string(), dst),
                None => {
                    let route = node
                        .routes
                        .iter()
                        .filter(|r| r.destination.contains(&dst))
                        .filter_map(|r| {
                            let dev = match &r.dev {
                                Some(dev) => dev.clone(),
                                None => node.connected_dev(r.via)?.to_string(),
                            };
                            admin_up(&dev).then(|| (r, dev))
                        })
                        .max_by(|(x, _), (y, _)| {
                            x.destination
                                .prefix_len()
                                .cmp(&y.destination.prefix_len())
                                .then(y.metric.cmp(&x.metric))
                        })
                        .ok_or_else(|| format!("{}: network unreachable for {}", current, dst))?;
                    (route.1, route.0.via)
                }
            };

            if !carrier(&dev) {
                return Err(format!("{}: {} has no carrier", current, dev));
            }
            let (peer, _) = node
                .interfaces
                .get(&dev)
                .and_then(|i| i.peer.clone())
                .ok_or_else(|| format!("{}: {} has no carrier", current, dev))?;
            let answers = nodes.get(&peer).map_or(false, |p| p.owns(gateway));
            if !answers {
                return Err(format!("{}: no neighbour answers for {} on {}", current, gateway, dev));
            }
            current = peer;
            path.push(current.clone());
        }
        Err(format!("time to live exceeded towards {}", dst))
    }

    fn interpret(&self, node_name: &str, argv: &[&str]) -> Result<ExecOutput, SubstrateError> {
        let mut nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        let node = nodes
            .get_mut(node_name)
            .ok_or_else(|| SubstrateError::UnknownNode(node_name.to_string()))?;
        node.history.push(argv.join(" "));

        let no_device = |dev: &str| failed(1, format!("Device \"{}\" does not exist.", dev));

        match argv {
            ["ip", "addr", "flush", "dev", dev] => match node.interfaces.get_mut(*dev) {
                Some(iface) => {
                    iface.addresses.clear();
                    Ok(ExecOutput::ok(""))
                }
                None => no_device(dev),
            },
            ["ip", "addr", "add", cidr, "dev", dev] => {
                let Ok(addr) = cidr.parse::<Ipv4Net>() else {
                    return failed(1, format!("Error: any valid prefix is expected rather than \"{}\".", cidr));
                };
                match node.interfaces.get_mut(*dev) {
                    Some(iface) if iface.addresses.contains(&addr) => failed(2, "RTNETLINK answers: File exists"),
                    Some(iface) => {
                        iface.addresses.push(addr);
                        Ok(ExecOutput::ok(""))
                    }
                    None => no_device(dev),
                }
            }
            ["ip", "link", "set", dev, state @ ("up" | "down")] => match node.interfaces.get_mut(*dev) {
                Some(iface) => {
                    iface.up = *state == "up";
                    if !iface.up {
                        // the kernel drops routes through a device taken down
                        node.routes.retain(|r| r.dev.as_deref() != Some(*dev));
                    }
                    Ok(ExecOutput::ok(""))
                }
                None => no_device(dev),
            },
            ["ip", "link", "del", dev] => match node.interfaces.remove(*dev) {
                Some(iface) => {
                    node.routes.retain(|r| r.dev.as_deref() != Some(*dev));
                    if let Some((peer, peer_iface)) = iface.peer {
                        if let Some(p) = nodes.get_mut(&peer) {
                            p.interfaces.remove(&peer_iface);
                            p.routes.retain(|r| r.dev.as_deref() != Some(peer_iface.as_str()));
                        }
                    }
                    Ok(ExecOutput::ok(""))
                }
                None => no_device(dev),
            },
            ["ip", "route", "replace", "default", "via", gw] => {
                let Ok(gw) = gw.parse::<Ipv4Addr>() else {
                    return failed(1, format!("Error: inet address is expected rather than \"{}\".", gw));
                };
                if node.connected_dev(gw).is_none() {
                    return failed(2, "Error: Nexthop has invalid gateway.");
                }
                node.routes.retain(|r| !(r.destination.prefix_len() == 0 && r.metric == 0));
                node.routes.push(SimRoute {
                    destination: Ipv4Net::default(),
                    via: gw,
                    dev: None,
                    metric: 0,
                });
                Ok(ExecOutput::ok(""))
            }
            ["ip", "route", "flush", "exact", dest] => {
                let Ok(dest) = dest.parse::<Ipv4Net>() else {
                    return failed(1, format!("Error: any valid prefix is expected rather than \"{}\".", dest));
                };
                node.routes.retain(|r| r.destination != dest);
                Ok(ExecOutput::ok(""))
            }
            ["ip", "route", "add", dest, "via", via, "dev", dev, "metric", metric] => {
                let (Ok(dest), Ok(via), Ok(metric)) =
                    (dest.parse::<Ipv4Net>(), via.parse::<Ipv4Addr>(), metric.parse::<u32>())
                else {
                    return failed(1, "Error: malformed route");
                };
                let Some(iface) = node.interfaces.get(*dev) else {
                    return no_device(dev);
                };
                if !iface.up {
                    return failed(2, "Error: Nexthop device is not up.");
                }
                if !iface.addresses.iter().any(|a| a.trunc().contains(&via)) {
                    return failed(2, "Error: Nexthop has invalid gateway.");
                }
                if node.routes.iter().any(|r| r.destination == dest && r.metric == metric) {
                    return failed(2, "RTNETLINK answers: File exists");
                }
                node.routes.push(SimRoute {
                    destination: dest,
                    via,
                    dev: Some(dev.to_string()),
                    metric,
                });
                Ok(ExecOutput::ok(""))
            }
            ["ip", "route"] | ["ip", "route", "show"] | ["ip", "-4", "route"] | ["ip", "-4", "route", "show"] => {
                let mut out = String::new();
                for (name, iface) in &node.interfaces {
                    for addr in &iface.addresses {
                        let _ = writeln!(out, "{} dev {} proto kernel scope link src {}", addr.trunc(), name, addr.addr());
                    }
                }
                for r in &node.routes {
                    let dest = if r.destination.prefix_len() == 0 {
                        "default".to_string()
                    } else {
                        r.destination.to_string()
                    };
                    let _ = write!(out, "{} via {}", dest, r.via);
                    if let Some(dev) = &r.dev {
                        let _ = write!(out, " dev {}", dev);
                    }
                    if r.metric > 0 {
                        let _ = write!(out, " metric {}", r.metric);
                    }
                    out.push('\n');
                }
                Ok(ExecOutput::ok(out))
            }
            ["ip", "addr"] | ["ip", "addr", "show"] | ["ip", "-4", "addr"] | ["ip", "-4", "addr", "show"] => {
                let mut out = String::new();
                for (k, (name, iface)) in node.interfaces.iter().enumerate() {
                    let state = if iface.up { "UP" } else { "DOWN" };
                    let _ = writeln!(out, "{}: {}: state {}", k + 1, name, state);
                    for addr in &iface.addresses {
                        let _ = writeln!(out, "    inet {}", addr);
                    }
                }
                Ok(ExecOutput::ok(out))
            }
            ["sysctl", "-w", setting] => match setting.split_once('=') {
                Some(("net.ipv4.ip_forward", value @ ("0" | "1"))) => {
                    node.forwarding = value == "1" && node.kind == NodeKind::Router;
                    Ok(ExecOutput::ok(format!("{}\n", setting.replace('=', " = "))))
                }
                _ => failed(255, format!("sysctl: cannot stat {}", setting)),
            },
            ["sh", "-c", script] => {
                if script.trim_end().ends_with('&') {
                    node.processes.push(script.to_string());
                }
                Ok(ExecOutput::ok(""))
            }
            ["ping", .., target] => {
                let Ok(target) = target.parse::<Ipv4Addr>() else {
                    return failed(2, format!("ping: {}: Name or service not known", target));
                };
                drop(nodes);
                match self.trace(node_name, target) {
                    Ok(path) => Ok(ExecOutput::ok(format!("1 packets transmitted, 1 received ({})\n", path.join(" -> ")))),
                    Err(reason) => failed(1, format!("1 packets transmitted, 0 received: {}", reason)),
                }
            }
            ["true"] => Ok(ExecOutput::ok("")),
            _ => failed(127, format!("{}: command not supported by the simulated substrate", argv.join(" "))),
        }
    }
}

impl Substrate for SimulatedSubstrate {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn create_node(&self, name: &str, kind: NodeKind) -> Result<NodeHandle, SubstrateError> {
        let command = format!("ip netns add {}", name);
        if self.fault_for(name, &command).is_some() {
            return Err(SubstrateError::CommandFailed {
                command,
                stderr: "injected failure".to_string(),
            });
        }
        let mut nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        nodes.insert(name.to_string(), SimNode::new(kind));
        Ok(NodeHandle {
            name: name.to_string(),
            namespace: name.to_string(),
        })
    }

    fn create_link(
        &self,
        a: &NodeHandle,
        iface_a: &str,
        b: &NodeHandle,
        iface_b: &str,
        bandwidth: Option<u32>,
    ) -> Result<LinkHandle, SubstrateError> {
        let command = format!("ip link add {} type veth peer name {}", iface_a, iface_b);
        if self.fault_for(&a.name, &command).is_some() || self.fault_for(&b.name, &command).is_some() {
            return Err(SubstrateError::CommandFailed {
                command,
                stderr: "injected failure".to_string(),
            });
        }

        let mut nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        for (node, iface) in [(a, iface_a), (b, iface_b)] {
            let n = nodes
                .get(&node.name)
                .ok_or_else(|| SubstrateError::UnknownNode(node.name.clone()))?;
            if n.interfaces.contains_key(iface) {
                return Err(SubstrateError::CommandFailed {
                    command,
                    stderr: "RTNETLINK answers: File exists".to_string(),
                });
            }
        }
        for (node, iface, peer, peer_iface) in [(a, iface_a, b, iface_b), (b, iface_b, a, iface_a)] {
            if let Some(n) = nodes.get_mut(&node.name) {
                n.interfaces.insert(
                    iface.to_string(),
                    SimInterface {
                        bandwidth,
                        peer: Some((peer.name.clone(), peer_iface.to_string())),
                        ..SimInterface::default()
                    },
                );
            }
        }
        Ok(LinkHandle {
            a: a.clone(),
            iface_a: iface_a.to_string(),
            b: b.clone(),
            iface_b: iface_b.to_string(),
        })
    }

    fn exec(&self, node: &NodeHandle, argv: &[&str], timeout: Duration) -> Result<ExecOutput, SubstrateError> {
        let command = argv.join(" ");
        match self.fault_for(&node.name, &command) {
            Some(Fault::Hang) => Err(SubstrateError::Timeout {
                node: node.name.clone(),
                command,
                after: timeout,
            }),
            Some(Fault::Fail) => failed(1, "injected failure"),
            None => self.interpret(&node.name, argv),
        }
    }

    fn destroy_node(&self, node: &NodeHandle) -> Result<(), SubstrateError> {
        let mut nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        let removed = nodes
            .remove(&node.name)
            .ok_or_else(|| SubstrateError::UnknownNode(node.name.clone()))?;
        for iface in removed.interfaces.values() {
            if let Some((peer, peer_iface)) = &iface.peer {
                if let Some(p) = nodes.get_mut(peer) {
                    p.interfaces.remove(peer_iface);
                    p.routes.retain(|r| r.dev.as_deref() != Some(peer_iface.as_str()));
                }
            }
        }
        Ok(())
    }
}
