//! Serialized command execution.
//!
//! A node's network namespace must not be mutated by two commands at
//! once, but different nodes are independent. Every command therefore
//! takes the lock of its own node only.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{ExecOutput, LinkHandle, NodeHandle, Substrate};
use crate::error::SubstrateError;

pub struct NodeExecutor {
    substrate: Arc<dyn Substrate>,
    timeout: Duration,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl NodeExecutor {
    pub fn new(substrate: Arc<dyn Substrate>, timeout: Duration) -> Self {
        Self {
            substrate,
            timeout,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn substrate(&self) -> &Arc<dyn Substrate> {
        &self.substrate
    }

    fn lock_for(&self, node: &NodeHandle) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(node.name.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run a command inside `node`, returning raw output
    pub fn exec(&self, node: &NodeHandle, argv: &[&str]) -> Result<ExecOutput, SubstrateError> {
        let lock = self.lock_for(node);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        log::debug!("[{}] {}", node.name, argv.join(" "));
        self.substrate.exec(node, argv, self.timeout)
    }

    /// Run a command inside `node`, failing if it exits non-zero
    pub fn exec_checked(&self, node: &NodeHandle, argv: &[&str]) -> Result<ExecOutput, SubstrateError> {
        let output = self.exec(node, argv)?;
        if !output.success() {
            return Err(SubstrateError::CommandFailed {
                command: argv.join(" "),
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }

    /// Run `f` holding the locks of both link endpoints, taken in name order
    fn with_link_locked<T>(&self, link: &LinkHandle, f: impl FnOnce() -> T) -> T {
        let (first, second) = if link.a.name <= link.b.name {
            (&link.a, &link.b)
        } else {
            (&link.b, &link.a)
        };
        let first = self.lock_for(first);
        let _first = first.lock().unwrap_or_else(|e| e.into_inner());
        if link.a.name == link.b.name {
            return f();
        }
        let second = self.lock_for(second);
        let _second = second.lock().unwrap_or_else(|e| e.into_inner());
        f()
    }

    pub fn set_link_state(&self, link: &LinkHandle, up: bool) -> Result<(), SubstrateError> {
        log::debug!(
            "{}:{} <-> {}:{} {}",
            link.a.name,
            link.iface_a,
            link.b.name,
            link.iface_b,
            if up { "up" } else { "down" }
        );
        self.with_link_locked(link, || self.substrate.set_link_state(link, up, self.timeout))
    }

    pub fn destroy_link(&self, link: &LinkHandle) -> Result<(), SubstrateError> {
        self.with_link_locked(link, || self.substrate.destroy_link(link, self.timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::SimulatedSubstrate;
    use crate::topology::NodeKind;

    #[test]
    fn test_exec_checked_reports_stderr() {
        let sim = Arc::new(SimulatedSubstrate::new());
        let executor = NodeExecutor::new(sim.clone(), Duration::from_secs(1));
        let node = sim.create_node("r0", NodeKind::Router).unwrap();

        let err = executor
            .exec_checked(&node, &["ip", "link", "set", "r0-eth9", "up"])
            .unwrap_err();
        assert!(matches!(err, SubstrateError::CommandFailed { .. }));
        assert!(err.to_string().contains("r0-eth9"));
    }

    #[test]
    fn test_commands_on_same_node_share_a_lock() {
        let sim = Arc::new(SimulatedSubstrate::new());
        let executor = NodeExecutor::new(sim.clone(), Duration::from_secs(1));
        let r0 = sim.create_node("r0", NodeKind::Router).unwrap();
        let r1 = sim.create_node("r1", NodeKind::Router).unwrap();

        assert!(Arc::ptr_eq(&executor.lock_for(&r0), &executor.lock_for(&r0)));
        assert!(!Arc::ptr_eq(&executor.lock_for(&r0), &executor.lock_for(&r1)));
    }

    #[test]
    fn test_set_link_state_touches_both_ends() {
        let sim = Arc::new(SimulatedSubstrate::new());
        let executor = NodeExecutor::new(sim.clone(), Duration::from_secs(1));
        let r0 = sim.create_node("r0", NodeKind::Router).unwrap();
        let r1 = sim.create_node("r1", NodeKind::Router).unwrap();
        let link = sim.create_link(&r1, "r1-eth0", &r0, "r0-eth0", None).unwrap();

        executor.set_link_state(&link, true).unwrap();
        assert!(sim.interface_up("r0", "r0-eth0") && sim.interface_up("r1", "r1-eth0"));
        executor.set_link_state(&link, false).unwrap();
        assert!(!sim.interface_up("r0", "r0-eth0") && !sim.interface_up("r1", "r1-eth0"));

        executor.destroy_link(&link).unwrap();
        assert!(sim.addresses("r0", "r0-eth0").is_empty());
        assert!(executor.set_link_state(&link, true).is_err());
    }
}
