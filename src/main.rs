mod api;
mod cli;
mod config;
mod engine;
mod gating;
mod instruction;
mod logging;
mod runtime;
mod scheduler;
mod session;
mod signing;
mod socket;
mod terminal;
mod time_sync;
mod urls;

use anyhow::Result;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = cli::Cli::parse();
    let config = config::SolarSshConfig::load()?;
    logging::init(&cli_args.command.log_config(&config))?;
    cli::handle_cli_command(cli_args.command, config).await
}
