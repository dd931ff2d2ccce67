//! Static multi-path routing.
//!
//! - `compute.rs`: ranked next-hops per router and destination
//! - `apply.rs`: reconciling kernel routing tables with the plan
//! - `table.rs`: plan types

pub mod apply;
pub mod compute;
pub mod table;

pub use apply::{ApplyOutcome, RouteApplier};
pub use compute::{Candidate, RouteComputer};
pub use table::{DestinationRoutes, RouteEntry, RouterTable, RoutingPlan};
