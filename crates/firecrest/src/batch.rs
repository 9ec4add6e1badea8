//! Implementation of batch script generation.

use std::fmt::Write;

/// The line a generated script prints once every command succeeded.
pub const SUCCESS_MARKER: &str = "f7t: all commands succeeded";

/// Represents a batch script to generate.
#[derive(Debug, Clone, bon::Builder)]
pub struct BatchScript {
    /// The name of the job.
    #[builder(into, default = "f7t")]
    pub job_name: String,
    /// The account to charge the job to.
    #[builder(into)]
    pub account: Option<String>,
    /// The node constraint (e.g. `gpu`).
    #[builder(into)]
    pub constraint: Option<String>,
    /// The number of nodes to allocate.
    #[builder(default = 1)]
    pub nodes: u32,
    /// The wall time limit (e.g. `00:10:00`).
    #[builder(into)]
    pub time: Option<String>,
    /// The modules to load before running the commands.
    #[builder(default)]
    pub modules: Vec<String>,
    /// The shell commands to run.
    #[builder(default)]
    pub commands: Vec<String>,
}

impl BatchScript {
    /// Renders the script.
    ///
    /// The script stops at the first failing command and prints
    /// [`SUCCESS_MARKER`] after the last one.
    pub fn render(&self) -> String {
        let mut script = String::from("#!/bin/bash -l\n");

        writeln!(script, "#SBATCH --job-name={name}", name = self.job_name)
            .expect("failed to write to a string");
        if let Some(account) = &self.account {
            writeln!(script, "#SBATCH --account={account}").expect("failed to write to a string");
        }
        if let Some(constraint) = &self.constraint {
            writeln!(script, "#SBATCH --constraint={constraint}")
                .expect("failed to write to a string");
        }
        writeln!(script, "#SBATCH --nodes={nodes}", nodes = self.nodes)
            .expect("failed to write to a string");
        if let Some(time) = &self.time {
            writeln!(script, "#SBATCH --time={time}").expect("failed to write to a string");
        }

        script.push_str("\nset -euo pipefail\n\n");

        for module in &self.modules {
            writeln!(script, "module load {module}").expect("failed to write to a string");
        }
        if !self.modules.is_empty() {
            script.push('\n');
        }

        for command in &self.commands {
            script.push_str(command);
            script.push('\n');
        }

        writeln!(script, "\necho \"{SUCCESS_MARKER}\"").expect("failed to write to a string");
        script
    }
}

/// Determines if the output of a generated script reports success.
pub fn check_output(output: &str) -> bool {
    output.lines().any(|line| line.trim() == SUCCESS_MARKER)
}
