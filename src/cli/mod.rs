//! Command-line interface for agent-swarm.
//!
//! Provides commands for checking pipeline definitions and inspecting the
//! engine configuration.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
