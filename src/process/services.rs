//! Service launching.
//!
//! Services are opaque commands (web servers, routing daemons). Each is
//! started detached with its output redirected to a per-service log
//! file, and is never waited on or restarted.

use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::config::ServiceConfig;
use crate::error::SetupError;
use crate::substrate::{NodeExecutor, NodeHandle};
use crate::topology::{NodeId, TopologyGraph};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchedService {
    pub node: String,
    pub service: String,
    pub log_file: String,
}

#[derive(Debug, Default)]
pub struct ServiceOutcome {
    pub launched: Vec<LaunchedService>,
    pub errors: Vec<SetupError>,
}

/// Log file of `service` on `node`
pub fn log_path(node: &str, service: &str) -> String {
    format!("/tmp/{}-{}.log", node, service)
}

/// Shell line starting `service` in the background
pub fn launch_script(node: &str, service: &ServiceConfig) -> String {
    format!(
        "nohup {} >{} 2>&1 &",
        service.command,
        log_path(node, &service.name)
    )
}

pub struct ServiceLauncher<'a> {
    executor: &'a NodeExecutor,
    handles: &'a BTreeMap<NodeId, NodeHandle>,
}

impl<'a> ServiceLauncher<'a> {
    pub fn new(executor: &'a NodeExecutor, handles: &'a BTreeMap<NodeId, NodeHandle>) -> Self {
        Self { executor, handles }
    }

    pub fn launch(&self, handle: &NodeHandle, service: &ServiceConfig) -> Result<LaunchedService, SetupError> {
        let script = launch_script(&handle.name, service);
        self.executor
            .exec_checked(handle, &["sh", "-c", &script])
            .map_err(|e| SetupError::ServiceLaunchError {
                node: handle.name.clone(),
                service: service.name.clone(),
                cause: e.to_string(),
            })?;
        log::debug!("{}: started {}", handle.name, service.name);
        Ok(LaunchedService {
            node: handle.name.clone(),
            service: service.name.clone(),
            log_file: log_path(&handle.name, &service.name),
        })
    }

    /// Start the services of every node; nodes run in parallel, services
    /// of one node in declaration order
    pub fn launch_all(&self, graph: &TopologyGraph) -> ServiceOutcome {
        let results: Vec<_> = graph
            .nodes()
            .par_iter()
            .filter(|node| !node.services.is_empty())
            .map(|node| -> Vec<Result<LaunchedService, SetupError>> {
                let Some(handle) = self.handles.get(&node.id) else {
                    return node
                        .services
                        .iter()
                        .map(|s| {
                            Err(SetupError::ServiceLaunchError {
                                node: node.name.clone(),
                                service: s.name.clone(),
                                cause: "node is not emulated".to_string(),
                            })
                        })
                        .collect();
                };
                node.services.iter().map(|s| self.launch(handle, s)).collect()
            })
            .collect();

        let mut outcome = ServiceOutcome::default();
        for result in results.into_iter().flatten() {
            match result {
                Ok(launched) => outcome.launched.push(launched),
                Err(error) => {
                    log::warn!("{}", error);
                    outcome.errors.push(error);
                }
            }
        }
        if !outcome.launched.is_empty() || !outcome.errors.is_empty() {
            log::info!(
                "Started {} services ({} failed)",
                outcome.launched.len(),
                outcome.errors.len()
            );
        }
        outcome
    }
}
