//! Command-line interface for metaraid.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
