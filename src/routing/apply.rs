//! Pushing routing tables into routers.
//!
//! Each destination is reconciled on its own: flush every existing
//! route for it, then add the installed entries in rank order. An empty
//! destination is still flushed, which removes routes that became stale
//! after a link went down.

use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap};

use super::table::{DestinationRoutes, RouteEntry, RouterTable, RoutingPlan};
use crate::error::SetupError;
use crate::substrate::{NodeExecutor, NodeHandle};
use crate::topology::NodeId;

#[derive(Debug, Default)]
pub struct ApplyOutcome {
    /// Entries present in the kernel afterwards, per router name
    pub installed: BTreeMap<String, Vec<RouteEntry>>,
    pub errors: Vec<SetupError>,
}

impl ApplyOutcome {
    pub fn installed_count(&self) -> usize {
        self.installed.values().map(Vec::len).sum()
    }
}

pub struct RouteApplier<'a> {
    executor: &'a NodeExecutor,
    handles: &'a BTreeMap<NodeId, NodeHandle>,
}

impl<'a> RouteApplier<'a> {
    pub fn new(executor: &'a NodeExecutor, handles: &'a BTreeMap<NodeId, NodeHandle>) -> Self {
        Self { executor, handles }
    }

    fn install_error(router: &str, entry: &RouteEntry, cause: String) -> SetupError {
        SetupError::RouteInstallError {
            router: router.to_string(),
            destination: entry.destination,
            nexthop: entry.nexthop,
            cause,
        }
    }

    /// Reconcile one destination on one router
    pub fn apply_destination(
        &self,
        handle: &NodeHandle,
        router: &str,
        routes: &DestinationRoutes,
    ) -> (Vec<RouteEntry>, Vec<SetupError>) {
        let destination = routes.destination.to_string();
        if let Err(e) = self
            .executor
            .exec_checked(handle, &["ip", "route", "flush", "exact", &destination])
        {
            let cause = format!("flush failed: {}", e);
            let errors = routes
                .installed()
                .map(|entry| Self::install_error(router, entry, cause.clone()))
                .collect();
            return (Vec::new(), errors);
        }

        let mut installed = Vec::new();
        let mut errors = Vec::new();
        for entry in routes.installed() {
            let command = entry.to_command();
            let argv: Vec<&str> = command.iter().map(String::as_str).collect();
            match self.executor.exec_checked(handle, &argv) {
                Ok(_) => installed.push(entry.clone()),
                Err(e) => errors.push(Self::install_error(router, entry, e.to_string())),
            }
        }
        (installed, errors)
    }

    pub fn apply_router(&self, table: &RouterTable) -> (Vec<RouteEntry>, Vec<SetupError>) {
        let Some(handle) = self.handles.get(&table.id) else {
            let errors = table
                .destinations
                .iter()
                .flat_map(|d| d.installed())
                .map(|entry| Self::install_error(&table.router, entry, "router is not emulated".to_string()))
                .collect();
            return (Vec::new(), errors);
        };

        let mut installed = Vec::new();
        let mut errors = Vec::new();
        for routes in &table.destinations {
            let (ok, failed) = self.apply_destination(handle, &table.router, routes);
            installed.extend(ok);
            errors.extend(failed);
        }
        log::debug!("{}: {} routes installed", table.router, installed.len());
        (installed, errors)
    }

    /// Apply every table, one task per router
    pub fn apply(&self, plan: &RoutingPlan) -> ApplyOutcome {
        let results: HashMap<String, (Vec<RouteEntry>, Vec<SetupError>)> = plan
            .tables
            .par_iter()
            .map(|table| (table.router.clone(), self.apply_router(table)))
            .collect();

        let mut outcome = ApplyOutcome::default();
        for table in &plan.tables {
            let Some((installed, errors)) = results.get(&table.router) else {
                continue;
            };
            for error in errors {
                log::warn!("{}", error);
            }
            outcome.errors.extend(errors.iter().cloned());
            outcome.installed.insert(table.router.clone(), installed.clone());
        }
        log::info!(
            "Installed {} routes ({} failures)",
            outcome.installed_count(),
            outcome.errors.len()
        );
        outcome
    }
}
