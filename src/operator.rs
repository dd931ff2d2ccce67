//! Line-oriented operator loop.
//!
//! Runs once the network is up. Reads one command per line until
//! `exit` or end of input.

use std::io::{self, BufRead, Write};

use crate::orchestrator::NetworkOrchestrator;
use crate::topology::{InterfaceState, LinkKind};

const HELP: &str = "\
commands:
  nodes                     list nodes and their interfaces
  links                     list links with subnets and state
  routes <router>           show the ranked routes of a router
  plan                      print the address plan as JSON
  link <a> <b> up|down      change a link and re-route
  <node> <command...>       run a command inside a node
  exit                      tear down and quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Empty,
    Help,
    Nodes,
    Links,
    Routes(String),
    Plan,
    Link { a: String, b: String, up: bool },
    Exec { node: String, argv: Vec<String> },
    Exit,
}

pub fn parse_command(line: &str) -> Result<Command, String> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let command = match words.as_slice() {
        [] => Command::Empty,
        ["help"] | ["?"] => Command::Help,
        ["nodes"] => Command::Nodes,
        ["links"] => Command::Links,
        ["plan"] => Command::Plan,
        ["exit"] | ["quit"] => Command::Exit,
        ["routes", router] => Command::Routes(router.to_string()),
        ["routes", ..] => return Err("usage: routes <router>".to_string()),
        ["link", a, b, state @ ("up" | "down")] => Command::Link {
            a: a.to_string(),
            b: b.to_string(),
            up: *state == "up",
        },
        ["link", ..] => return Err("usage: link <a> <b> up|down".to_string()),
        [node] => return Err(format!("usage: {} <command...>", node)),
        [node, argv @ ..] => Command::Exec {
            node: node.to_string(),
            argv: argv.iter().map(|s| s.to_string()).collect(),
        },
    };
    Ok(command)
}

/// Execute one command. Returns false when the operator asked to exit.
pub fn dispatch<W: Write>(orch: &mut NetworkOrchestrator, command: Command, out: &mut W) -> io::Result<bool> {
    match command {
        Command::Empty => {}
        Command::Help => writeln!(out, "{}", HELP)?,
        Command::Exit => return Ok(false),
        Command::Nodes => {
            for node in orch.graph().nodes() {
                let forwarding = if node.forwarding { " forwarding" } else { "" };
                writeln!(out, "{} ({}{})", node.name, node.kind.as_str(), forwarding)?;
                for iface in &node.interfaces {
                    let address = iface
                        .address
                        .map(|a| a.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    let state = match iface.state {
                        InterfaceState::Up => "up",
                        InterfaceState::Down => "down",
                    };
                    writeln!(out, "  {} {} {}", iface.name, address, state)?;
                }
            }
        }
        Command::Links => {
            let graph = orch.graph();
            for link in graph.links() {
                let kind = match link.kind {
                    LinkKind::Edge => "edge",
                    LinkKind::PointToPoint => "p2p",
                };
                let subnet = link
                    .subnet
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "-".to_string());
                writeln!(
                    out,
                    "{:>3} {:<4} {}:{} <-> {}:{} {} {}",
                    link.id,
                    kind,
                    graph.node(link.a.node).name,
                    link.a.interface,
                    graph.node(link.b.node).name,
                    link.b.interface,
                    subnet,
                    if link.up { "up" } else { "down" }
                )?;
            }
        }
        Command::Routes(router) => match orch.routing_plan().and_then(|p| p.table(&router)) {
            Some(table) => write!(out, "{}", table.render())?,
            None => writeln!(out, "no routing table for {}", router)?,
        },
        Command::Plan => match orch.address_plan().map(|p| p.to_json()) {
            Some(Ok(json)) => writeln!(out, "{}", json)?,
            Some(Err(e)) => writeln!(out, "error: {}", e)?,
            None => writeln!(out, "addresses are not planned")?,
        },
        Command::Link { a, b, up } => match orch.set_link_state(&a, &b, up) {
            Ok(errors) => {
                writeln!(
                    out,
                    "{} <-> {} {}; routes recomputed",
                    a,
                    b,
                    if up { "up" } else { "down" }
                )?;
                for error in errors {
                    writeln!(out, "  {}", error)?;
                }
            }
            Err(e) => writeln!(out, "error: {}", e)?,
        },
        Command::Exec { node, argv } => {
            let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
            match orch.exec(&node, &argv) {
                Ok(output) => {
                    write!(out, "{}", output.stdout)?;
                    if !output.stderr.is_empty() {
                        write!(out, "{}", output.stderr)?;
                    }
                    if !output.success() {
                        writeln!(out, "exit status: {:?}", output.status)?;
                    }
                }
                Err(e) => writeln!(out, "error: {}", e)?,
            }
        }
    }
    Ok(true)
}

/// Read commands from `input` until `exit` or end of input
pub fn run<R: BufRead, W: Write>(orch: &mut NetworkOrchestrator, input: R, out: &mut W) -> io::Result<()> {
    write!(out, "routemesh> ")?;
    out.flush()?;
    for line in input.lines() {
        let line = line?;
        let keep_going = match parse_command(&line) {
            Ok(command) => dispatch(orch, command, out)?,
            Err(usage) => {
                writeln!(out, "{}", usage)?;
                true
            }
        };
        if !keep_going {
            break;
        }
        write!(out, "routemesh> ")?;
        out.flush()?;
    }
    writeln!(out)?;
    Ok(())
}
