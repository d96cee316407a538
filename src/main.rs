use anyhow::Context;
use clap::Parser;
use sagewire::cli::{run_cli, Cli};
use sagewire::otel::{init_logging_with_config, LogConfig};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging_with_config(&LogConfig::from_env()).context("Failed to initialize logging")?;
    run_cli(cli)
}
