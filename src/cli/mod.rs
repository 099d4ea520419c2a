//! Command-line interface for workq.
//!
//! Provides commands for running workers, enqueueing jobs and inspecting
//! queue and dead-letter state.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands, SimulatedHandler};
