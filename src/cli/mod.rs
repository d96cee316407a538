//! # CLI Module
//!
//! Command-line entry points of the `sagewire` binary.
//!
//! ## Commands
//!
//! ### `serve`
//!
//! Run the engine with a small set of demo routes, a WebSocket echo channel
//! and, optionally, a static directory:
//!
//! ```bash
//! sagewire serve --config sagewire.yaml --addr 127.0.0.1:8080 --static ./public
//! ```
//!
//! Options:
//! - `--config <FILE>` - YAML configuration (defaults apply when omitted)
//! - `--addr <HOST:PORT>` - overrides `bind_address` and `http_port`
//! - `--static <DIR>` - serve `DIR` under `/assets`
//!
//! `SAGE_*` environment variables are applied after the file and before
//! `--addr`.
//!
//! ### `check`
//!
//! Load and validate a configuration without binding anything:
//!
//! ```bash
//! sagewire check --config sagewire.yaml
//! ```
//!
//! ## Usage from Code
//!
//! ```rust,ignore
//! use sagewire::cli::{run_cli, Cli};
//! use clap::Parser;
//!
//! run_cli(Cli::parse())?;
//! ```

mod commands;

#[cfg(test)]
mod tests;

pub use commands::{demo_routes, load_config, run_cli, Cli, Commands, EchoListener};
