//! Process management inside emulated nodes.

pub mod services;

pub use services::{LaunchedService, ServiceLauncher, ServiceOutcome};
