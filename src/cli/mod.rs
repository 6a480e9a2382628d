//! Command-line interface for reward-forge.
//!
//! Provides the `generate`, `test-reward` and `envs` commands.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
