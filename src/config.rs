//! Implementation of the configuration module.

use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;

/// The name of the configuration file searched for in the current directory.
pub const CONFIG_FILE_NAME: &str = "f7t.toml";

/// The environment variable naming the default target system.
pub const MACHINE_ENV: &str = "MACHINE";

/// Represents the configuration for the `f7t` CLI tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct Config {
    /// The FirecREST client configuration.
    #[serde(default)]
    pub firecrest: firecrest::Config,
    /// Defaults for command arguments.
    #[serde(default)]
    pub defaults: DefaultsConfig,
}

/// Represents defaults for command arguments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct DefaultsConfig {
    /// The system to target when `--system` and `MACHINE` are not given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// The account to charge jobs to when `--account` is not given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
}

impl Config {
    /// Loads the configuration.
    ///
    /// Reads the given file, or `f7t.toml` in the current directory if it
    /// exists, and then applies the FirecREST environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => Some(path.to_path_buf()),
            None => Some(PathBuf::from(CONFIG_FILE_NAME)).filter(|p| p.is_file()),
        };

        let mut config = match &path {
            Some(path) => Self::read_config(path)?,
            None => Self::default(),
        };

        config
            .firecrest
            .apply_env(|name| std::env::var(name).ok())
            .context("failed to apply environment variables")?;
        Ok(config)
    }

    /// Read a configuration file from the specified path.
    pub fn read_config(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| {
            format!(
                "failed to read configuration file `{path}`",
                path = path.display()
            )
        })?;

        toml::from_str(&text).with_context(|| {
            format!(
                "failed to parse configuration file `{path}`",
                path = path.display()
            )
        })
    }

    /// Write a configuration to the specified path.
    ///
    /// Secrets are written as redacted unless [`Config::unredact`] was called.
    pub fn write_config(&self, path: &Path) -> Result<()> {
        let data = toml::to_string_pretty(self).context("failed to serialize configuration")?;
        std::fs::write(path, data).with_context(|| {
            format!(
                "failed to write configuration file `{path}`",
                path = path.display()
            )
        })
    }

    /// Unredacts the secrets contained in the configuration.
    pub fn unredact(&mut self) {
        self.firecrest.unredact();
    }

    /// Resolves the target system of a command.
    ///
    /// The explicit argument wins over `MACHINE`, which wins over the
    /// configured default.
    pub fn system(&self, arg: Option<String>) -> Result<String> {
        arg.or_else(|| std::env::var(MACHINE_ENV).ok().filter(|v| !v.is_empty()))
            .or_else(|| self.defaults.system.clone())
            .context("a target system is required: use `--system` or set `MACHINE`")
    }

    /// Resolves the account of a command.
    pub fn account(&self, arg: Option<String>) -> Option<String> {
        arg.or_else(|| self.defaults.account.clone())
    }

    /// Creates a FirecREST client from the configuration.
    pub fn client(&self) -> Result<firecrest::Client> {
        firecrest::Client::new(&self.firecrest).context("failed to create the FirecREST client")
    }
}
