//! IP address planning module.
//!
//! This module derives the addressing plan: one edge subnet per host link,
//! one point-to-point subnet per router link, and the address of every
//! interface on them.

pub mod allocator;
pub mod registry;

// Re-export commonly used types
pub use allocator::{AddressBinding, AddressPlan, AddressPlanner, LinkAssignment};
pub use registry::SubnetRegistry;
