//! Command-line interface for nmt-pool.
//!
//! Provides the `translate` and `check` commands.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli, Commands};
