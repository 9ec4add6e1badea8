//! Implementation of the submit command.

use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use firecrest::Completion;
use firecrest::Script;
use firecrest::SubmissionRequest;
use serde_json::json;

use crate::config::Config;

/// Arguments for the `submit` subcommand.
#[derive(Parser, Debug, Clone)]
pub struct SubmitArgs {
    /// The batch script to submit.
    #[arg(value_name = "SCRIPT")]
    pub script: PathBuf,

    /// The system to submit to.
    ///
    /// Defaults to the `MACHINE` environment variable.
    #[arg(long, value_name = "NAME")]
    pub system: Option<String>,

    /// The account to charge the job to.
    #[arg(long, value_name = "ACCOUNT")]
    pub account: Option<String>,

    /// Waits for the job to reach a terminal state.
    #[arg(long)]
    pub wait: bool,

    /// Fails unless the job reaches `COMPLETED`.
    ///
    /// Implies `--wait`.
    #[arg(long)]
    pub strict: bool,
}

/// Runs the `submit` command.
///
/// Prints the submitted job, and its final record when waiting, as JSON.
pub async fn submit(args: SubmitArgs, config: Config) -> Result<()> {
    let system = config.system(args.system)?;
    let client = config.client()?;

    let request = SubmissionRequest::builder()
        .system(system.clone())
        .script(Script::path(&args.script))
        .maybe_account(config.account(args.account))
        .build();

    let submission = client.submit_job(&request).await.with_context(|| {
        format!(
            "failed to submit `{script}` to `{system}`",
            script = args.script.display()
        )
    })?;

    if !args.wait && !args.strict {
        println!("{}", serde_json::to_string_pretty(&submission)?);
        return Ok(());
    }

    let completion = if args.strict {
        Completion::Success
    } else {
        Completion::Any
    };

    let job = client
        .poll_job_state(
            &system,
            &submission.job_id,
            config.firecrest.polling.job_interval(),
            completion,
        )
        .await?;

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({ "submission": submission, "job": job }))?
    );
    Ok(())
}
