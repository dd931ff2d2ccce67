//! Ranked static route computation.
//!
//! A router gets one candidate per enabled router link: the link
//! reaches the destination's gateway router in 1 hop if the neighbour
//! is that router, otherwise in 1 + the neighbour's hop distance with
//! the computing router removed from the graph. Removing it means a
//! candidate never depends on bouncing back through the router itself.
//! Candidates are ranked by (hops, link id) and given strictly
//! increasing metrics.

use petgraph::algo::dijkstra;
use petgraph::visit::NodeFiltered;
use rayon::prelude::*;

use super::table::{DestinationRoutes, RouteEntry, RouterTable, RoutingPlan};
use crate::config::GeneralConfig;
use crate::error::SetupError;
use crate::topology::{LinkId, NodeId, RouterGraph, TopologyGraph};

/// A way out of a router towards a target router
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub link: LinkId,
    pub neighbor: NodeId,
    pub hops: usize,
}

#[derive(Debug, Clone)]
pub struct RouteComputer {
    metric_step: u32,
    install_backups: bool,
}

impl RouteComputer {
    pub fn new(metric_step: u32, install_backups: bool) -> Self {
        Self {
            metric_step,
            install_backups,
        }
    }

    pub fn from_config(general: &GeneralConfig) -> Self {
        Self::new(general.metric_step, general.install_backups)
    }

    /// Hop distance from `from` to `to` in the router graph without `avoid`
    fn distance_avoiding(routers: &RouterGraph, from: NodeId, to: NodeId, avoid: NodeId) -> Option<usize> {
        let (start, goal) = (*routers.index.get(&from)?, *routers.index.get(&to)?);
        let excluded = routers.index.get(&avoid).copied();
        let view = NodeFiltered::from_fn(&routers.graph, |n| Some(n) != excluded);
        let costs = dijkstra(&view, start, Some(goal), |_| 1usize);
        costs.get(&goal).copied()
    }

    /// Candidates of `router` towards `target`, ranked best first
    pub fn candidates(
        &self,
        graph: &TopologyGraph,
        routers: &RouterGraph,
        router: NodeId,
        target: NodeId,
    ) -> Vec<Candidate> {
        let mut candidates: Vec<Candidate> = graph
            .neighbors(router)
            .into_iter()
            .filter_map(|(link, neighbor)| {
                let hops = if neighbor == target {
                    1
                } else {
                    1 + Self::distance_avoiding(routers, neighbor, target, router)?
                };
                Some(Candidate { link, neighbor, hops })
            })
            .collect();
        candidates.sort_by_key(|c| (c.hops, c.link));
        candidates
    }

    /// Table of one router. Unreachable destinations come back empty
    /// together with an error for each.
    pub fn compute_router(
        &self,
        graph: &TopologyGraph,
        routers: &RouterGraph,
        router: NodeId,
    ) -> (RouterTable, Vec<SetupError>) {
        let node = graph.node(router);
        let mut table = RouterTable {
            id: router,
            router: node.name.clone(),
            destinations: Vec::new(),
        };
        let mut unreachable = Vec::new();

        for edge in graph.edge_subnets() {
            if edge.router == router {
                continue;
            }

            let mut entries = Vec::new();
            for candidate in self.candidates(graph, routers, router, edge.router) {
                let link = graph.link(candidate.link);
                let (Some(local), Some(peer)) = (link.endpoint_on(router), link.peer_of(router)) else {
                    continue;
                };
                let Some(nexthop) = graph
                    .node(peer.node)
                    .interface(&peer.interface)
                    .and_then(|i| i.ip())
                else {
                    continue;
                };
                if node.owns_address(nexthop) {
                    continue;
                }
                let rank = entries.len() as u32;
                entries.push(RouteEntry {
                    destination: edge.subnet,
                    nexthop,
                    interface: local.interface.clone(),
                    metric: (rank + 1) * self.metric_step,
                    link: candidate.link,
                    hops: candidate.hops,
                    installed: rank == 0 || self.install_backups,
                });
            }

            if entries.is_empty() {
                unreachable.push(SetupError::UnreachableDestination {
                    router: node.name.clone(),
                    subnet: edge.subnet,
                });
            }
            table.destinations.push(DestinationRoutes {
                destination: edge.subnet,
                entries,
            });
        }

        (table, unreachable)
    }

    /// Tables for every router, computed in parallel
    pub fn compute(&self, graph: &TopologyGraph) -> RoutingPlan {
        let routers = graph.router_graph();
        let ids: Vec<NodeId> = graph.routers().map(|r| r.id).collect();
        let results: Vec<_> = ids
            .par_iter()
            .map(|&id| self.compute_router(graph, &routers, id))
            .collect();

        let mut plan = RoutingPlan::default();
        for (table, unreachable) in results {
            for error in &unreachable {
                log::warn!("{}", error);
            }
            plan.unreachable.extend(unreachable);
            plan.tables.push(table);
        }
        log::info!(
            "Computed {} route entries for {} routers ({} unreachable destinations)",
            plan.entry_count(),
            plan.tables.len(),
            plan.unreachable.len()
        );
        plan
    }
}
