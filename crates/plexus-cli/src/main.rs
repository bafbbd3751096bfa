//! Plexus CLI - host process for hot-reloadable modules

mod cli;
mod commands;

use std::path::Path;

use clap::Parser;
use cli::{Cli, Commands};
use plexus_kernel::RegistryConfig;
use tracing_subscriber::EnvFilter;

/// Config file picked up from the working directory when none is given
const DEFAULT_CONFIG_FILE: &str = "plexus.toml";

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging; RUST_LOG wins over --verbose
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = load_config(cli.config.as_deref())?;
    let rt = tokio::runtime::Runtime::new()?;

    match cli.command {
        Commands::Run {
            dynamic,
            library,
            interval_ms,
            iterations,
        } => rt.block_on(commands::run::run(
            config,
            commands::run::RunOptions {
                dynamic,
                library,
                interval_ms,
                iterations,
            },
        )),

        Commands::Inspect { library, symbol } => {
            commands::inspect::run(&config, &library, symbol.as_deref())
        }

        Commands::Watch { path, interval_ms } => rt.block_on(commands::watch::run(&path, interval_ms)),

        Commands::Config => commands::config_cmd::run(&config),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<RegistryConfig> {
    let config = match path {
        Some(path) => RegistryConfig::from_file(path)?,
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => RegistryConfig::from_file(DEFAULT_CONFIG_FILE)?,
        None => RegistryConfig::from_env()?,
    };
    Ok(config)
}
