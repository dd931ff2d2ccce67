//! Emulation substrate module.
//!
//! The compiler only needs a narrow capability from whatever hosts the
//! emulated nodes: create nodes, wire them with links, and run commands
//! inside a node. [`Substrate`] is that capability.
//!
//! - `netns.rs`: Linux network namespaces and veth pairs
//! - `simulated.rs`: in-memory model interpreting the same commands
//! - `executor.rs`: per-node serialization and command timeouts

pub mod executor;
pub mod netns;
pub mod simulated;

use std::time::Duration;

use crate::error::SubstrateError;
use crate::topology::NodeKind;

pub use executor::NodeExecutor;
pub use netns::NetnsSubstrate;
pub use simulated::SimulatedSubstrate;

/// Handle of a node created by a substrate
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeHandle {
    pub name: String,
    /// Substrate-side identifier, e.g. the namespace name
    pub namespace: String,
}

/// Handle of a link created by a substrate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkHandle {
    pub a: NodeHandle,
    pub iface_a: String,
    pub b: NodeHandle,
    pub iface_b: String,
}

/// Result of one command run inside a node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Exit code; `None` if the process was killed by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Capability offered by the emulation environment
pub trait Substrate: Send + Sync {
    /// Short name used in logs and reports
    fn name(&self) -> &'static str;

    fn create_node(&self, name: &str, kind: NodeKind) -> Result<NodeHandle, SubstrateError>;

    /// Create a link between two nodes. Interfaces come up without addresses.
    fn create_link(
        &self,
        a: &NodeHandle,
        iface_a: &str,
        b: &NodeHandle,
        iface_b: &str,
        bandwidth: Option<u32>,
    ) -> Result<LinkHandle, SubstrateError>;

    /// Run `argv` inside `node`, giving up after `timeout`
    fn exec(&self, node: &NodeHandle, argv: &[&str], timeout: Duration) -> Result<ExecOutput, SubstrateError>;

    fn destroy_node(&self, node: &NodeHandle) -> Result<(), SubstrateError>;

    /// Take both ends of a link administratively up or down
    fn set_link_state(&self, link: &LinkHandle, up: bool, timeout: Duration) -> Result<(), SubstrateError> {
        let state = if up { "up" } else { "down" };
        for (node, iface) in [(&link.a, &link.iface_a), (&link.b, &link.iface_b)] {
            let argv = ["ip", "link", "set", iface.as_str(), state];
            let output = self.exec(node, &argv, timeout)?;
            if !output.success() {
                return Err(SubstrateError::CommandFailed {
                    command: argv.join(" "),
                    stderr: output.stderr.trim().to_string(),
                });
            }
        }
        Ok(())
    }

    /// Delete a link; removing one end of a veth pair removes both
    fn destroy_link(&self, link: &LinkHandle, timeout: Duration) -> Result<(), SubstrateError> {
        let argv = ["ip", "link", "del", link.iface_a.as_str()];
        let output = self.exec(&link.a, &argv, timeout)?;
        if !output.success() {
            return Err(SubstrateError::CommandFailed {
                command: argv.join(" "),
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(())
    }
}
