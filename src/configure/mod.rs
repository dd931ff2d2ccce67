//! Per-node network configuration.

pub mod interfaces;

pub use interfaces::{InterfaceConfigurator, InterfaceOutcome};
