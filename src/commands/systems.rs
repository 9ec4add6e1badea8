//! Implementation of the systems command.

use anyhow::Result;
use anyhow::bail;
use clap::Parser;
use colored::Colorize;

use crate::config::Config;

/// Arguments for the `systems` subcommand.
#[derive(Parser, Debug, Clone)]
pub struct SystemsArgs {
    /// Checks a single system, failing if it is not available.
    #[arg(long, value_name = "NAME")]
    pub system: Option<String>,
}

/// Runs the `systems` command.
pub async fn systems(args: SystemsArgs, config: Config) -> Result<()> {
    let client = config.client()?;

    match args.system {
        Some(name) => {
            let system = client.system(&name).await?;
            println!("{name}: {status}", status = system.status);
            if !system.is_available() {
                bail!("system `{name}` is not available");
            }
        }
        None => {
            for system in client.systems().await? {
                let status = if system.is_available() {
                    system.status.green()
                } else {
                    system.status.yellow()
                };

                match system.description.as_deref().filter(|d| !d.is_empty()) {
                    Some(description) => {
                        println!("{name}: {status} ({description})", name = system.system)
                    }
                    None => println!("{name}: {status}", name = system.system),
                }
            }
        }
    }

    Ok(())
}
