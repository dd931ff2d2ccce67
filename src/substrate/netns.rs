//! Linux network namespace substrate.
//!
//! Every node is a namespace named `<prefix><node>`, every link a veth
//! pair with one end moved into each namespace. Commands run through
//! `ip netns exec`, optionally prefixed with `sudo`.

use std::io::Read;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};

use super::{ExecOutput, LinkHandle, NodeHandle, Substrate};
use crate::error::SubstrateError;
use crate::topology::NodeKind;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Timeout for host-side plumbing (namespace and veth management)
const HOST_TIMEOUT: Duration = Duration::from_secs(10);

/// How long output readers may lag behind the exit of the child
const DRAIN_GRACE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct NetnsSubstrate {
    prefix: String,
    sudo: bool,
}

impl NetnsSubstrate {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            sudo: false,
        }
    }

    /// Prefix every command with `sudo`
    pub fn with_sudo(mut self, sudo: bool) -> Self {
        self.sudo = sudo;
        self
    }

    fn namespace_of(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = if self.sudo {
            let mut cmd = Command::new("sudo");
            cmd.args(args);
            cmd
        } else {
            let mut cmd = Command::new(args[0]);
            cmd.args(&args[1..]);
            cmd
        };
        // Own process group, so a timeout can take down everything the
        // command forked (sudo does not relay SIGKILL to its child)
        cmd.process_group(0);
        cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd
    }

    /// SIGKILL every process in group `pgid`, through sudo if configured
    fn kill_group(&self, pgid: u32) {
        let target = format!("-{}", pgid);
        let status = self
            .command(&["kill", "-KILL", "--", &target])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if let Err(e) = status {
            log::warn!("Failed to kill process group {}: {}", pgid, e);
        }
    }

    /// Run a host-side command with a deadline
    fn run(&self, node: &str, args: &[&str], timeout: Duration) -> Result<ExecOutput, SubstrateError> {
        let command = args.join(" ");
        let child = self.command(args).spawn().map_err(|source| SubstrateError::Spawn {
            command: command.clone(),
            source,
        })?;
        wait_with_timeout(child, timeout, |pgid| self.kill_group(pgid)).ok_or(SubstrateError::Timeout {
            node: node.to_string(),
            command,
            after: timeout,
        })
    }

    fn run_checked(&self, node: &str, args: &[&str]) -> Result<ExecOutput, SubstrateError> {
        let output = self.run(node, args, HOST_TIMEOUT)?;
        if !output.success() {
            return Err(SubstrateError::CommandFailed {
                command: args.join(" "),
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }
}

/// Wait for `child`, killing its process group once `timeout` elapses.
///
/// Pipes are drained on separate threads so a chatty child cannot block
/// on a full pipe while we poll. Descendants that outlive the child keep
/// the pipes open, so readers are never awaited past the deadline.
/// Returns `None` on timeout.
fn wait_with_timeout(mut child: Child, timeout: Duration, kill_group: impl Fn(u32)) -> Option<ExecOutput> {
    let drain = |pipe: Option<Box<dyn Read + Send>>| -> Receiver<String> {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut buf = String::new();
            if let Some(mut pipe) = pipe {
                let _ = pipe.read_to_string(&mut buf);
            }
            let _ = tx.send(buf);
        });
        rx
    };
    let stdout = drain(child.stdout.take().map(|p| Box::new(p) as Box<dyn Read + Send>));
    let stderr = drain(child.stderr.take().map(|p| Box::new(p) as Box<dyn Read + Send>));

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if Instant::now() >= deadline => {
                kill_group(child.id());
                let _ = child.kill();
                let _ = child.wait();
                return None;
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(_) => return None,
        }
    };

    let collect = |rx: Receiver<String>| {
        let wait = deadline.saturating_duration_since(Instant::now()).max(DRAIN_GRACE);
        rx.recv_timeout(wait).unwrap_or_default()
    };
    Some(ExecOutput {
        status: status.code(),
        stdout: collect(stdout),
        stderr: collect(stderr),
    })
}

impl Substrate for NetnsSubstrate {
    fn name(&self) -> &'static str {
        "netns"
    }

    fn create_node(&self, name: &str, kind: NodeKind) -> Result<NodeHandle, SubstrateError> {
        let ns = self.namespace_of(name);
        // Stale namespace from an earlier run
        let _ = self.run(name, &["ip", "netns", "del", &ns], HOST_TIMEOUT);
        self.run_checked(name, &["ip", "netns", "add", &ns])?;
        // Loopback is best-effort
        let _ = self.run(
            name,
            &["ip", "netns", "exec", &ns, "ip", "link", "set", "lo", "up"],
            HOST_TIMEOUT,
        );
        log::debug!("Created namespace {} for {} {}", ns, kind.as_str(), name);
        Ok(NodeHandle {
            name: name.to_string(),
            namespace: ns,
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
        let _ = self.run(&a.name, &["ip", "link", "del", iface_a], HOST_TIMEOUT);
        self.run_checked(
            &a.name,
            &["ip", "link", "add", iface_a, "type", "veth", "peer", "name", iface_b],
        )?;
        self.run_checked(&a.name, &["ip", "link", "set", iface_a, "netns", &a.namespace])?;
        self.run_checked(&b.name, &["ip", "link", "set", iface_b, "netns", &b.namespace])?;

        if let Some(mbit) = bandwidth {
            let rate = format!("{}mbit", mbit);
            for (node, iface) in [(a, iface_a), (b, iface_b)] {
                self.run_checked(
                    &node.name,
                    &[
                        "ip", "netns", "exec", &node.namespace, "tc", "qdisc", "replace", "dev", iface, "root",
                        "tbf", "rate", &rate, "burst", "32kbit", "latency", "400ms",
                    ],
                )?;
            }
        }

        log::debug!("Created veth {}:{} <-> {}:{}", a.name, iface_a, b.name, iface_b);
        Ok(LinkHandle {
            a: a.clone(),
            iface_a: iface_a.to_string(),
            b: b.clone(),
            iface_b: iface_b.to_string(),
        })
    }

    fn exec(&self, node: &NodeHandle, argv: &[&str], timeout: Duration) -> Result<ExecOutput, SubstrateError> {
        let mut args = vec!["ip", "netns", "exec", node.namespace.as_str()];
        args.extend_from_slice(argv);
        self.run(&node.name, &args, timeout)
    }

    fn destroy_node(&self, node: &NodeHandle) -> Result<(), SubstrateError> {
        // Processes keep a namespace alive after `ip netns del`
        if let Ok(output) = self.run(&node.name, &["ip", "netns", "pids", &node.namespace], HOST_TIMEOUT) {
            for pid in output.stdout.split_whitespace() {
                let _ = self.run(&node.name, &["kill", "-9", pid], HOST_TIMEOUT);
            }
        }
        self.run_checked(&node.name, &["ip", "netns", "del", &node.namespace])?;
        log::debug!("Deleted namespace {}", node.namespace);
        Ok(())
    }
}
