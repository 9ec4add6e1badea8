//! Implementation of the config command.

use clap::Parser;
use clap::Subcommand;

use crate::config::Config;

/// Arguments for the `config` subcommand.
#[derive(Parser, Debug, Clone)]
pub struct Args {
    /// The config subcommand.
    #[command(subcommand)]
    command: ConfigSubcommand,
}

/// Subcommands for the `config` command.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigSubcommand {
    /// Generates a default configuration file.
    Init,

    /// Displays the effective configuration with secrets redacted.
    Resolve,
}

/// Runs the `config` command.
pub fn config(args: Args, config: Config) -> anyhow::Result<()> {
    let config = match args.command {
        ConfigSubcommand::Init => Config::default(),
        ConfigSubcommand::Resolve => config,
    };

    print!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}
