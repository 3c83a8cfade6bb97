//! vscmirror - offline mirror of the VS Code update service and marketplace

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use vscmirror_cli::cmd;
use vscmirror_cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Platforms { resolved } => {
            let config = if *resolved { Some(cli.load_config()?) } else { None };
            cmd::platforms::platforms(config.as_ref())?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Status { json } => {
            let config = cli.load_config()?;
            cmd::status::status(&config, *json).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Sync(args) => {
            let config = cli.load_config()?;
            cmd::sync::sync(&config, args.continuous).await
        }
        Commands::Serve(_) => {
            let config = cli.load_config()?;
            cmd::serve::serve(&config).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
