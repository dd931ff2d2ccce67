//! Shared utilities: name validation.

pub mod validation;

pub use validation::{interface_name, validate_interface_name, validate_node_name};
