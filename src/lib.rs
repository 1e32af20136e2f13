//! CLI glue for remote-pull: argument parsing, YAML config loading and result files.
//! All download logic lives in `remote-pull-core`.

pub mod cli;
pub mod load_config;

pub use cli::{run, Cli, Commands};
