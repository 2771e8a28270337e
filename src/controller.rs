pub mod controller_handler;
#[cfg(test)]
pub mod integration_tests;

pub use controller_handler::{shutdown_signal, Controller, RunSummary};
