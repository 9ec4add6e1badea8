//! Implementation of the run command.

use std::path::Path;
use std::path::PathBuf;

use anyhow::Result;
use anyhow::anyhow;
use anyhow::bail;
use clap::Parser;
use firecrest::Client;
use firecrest::Script;
use firecrest::SubmissionRequest;
use futures::future::join_all;
use tracing::error;
use tracing::info;

use crate::config::Config;

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    /// The batch script each workflow submits.
    #[arg(value_name = "SCRIPT")]
    pub script: PathBuf,

    /// The system to submit to.
    ///
    /// Defaults to the `MACHINE` environment variable.
    #[arg(long, value_name = "NAME")]
    pub system: Option<String>,

    /// The number of concurrent workflows.
    #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u32).range(1..))]
    pub count: u32,
}

/// Runs a single workflow: submit, wait for the job to leave the queue and
/// print its output.
async fn workflow(client: Client, system: &str, script: &Path, index: u32) -> Result<()> {
    info!("{index}: starting workflow");

    let request = SubmissionRequest::builder()
        .system(system)
        .script(Script::path(script))
        .build();
    let job = client.submit_job(&request).await?;
    info!("{index}: submitted job with id {id}", id = job.job_id);

    let interval = client.polling().job_interval();
    loop {
        let active = client.poll_active(system, &[job.job_id.as_str()]).await?;
        let Some(record) = active.first() else {
            info!("{index}: job {id} is no longer active", id = job.job_id);
            break;
        };

        info!(
            "{index}: job {id} status: {state}",
            id = job.job_id,
            state = record.state
        );
        tokio::time::sleep(interval).await;
    }

    let path = job
        .job_file_out
        .as_deref()
        .ok_or_else(|| anyhow!("job `{id}` did not report an output file", id = job.job_id))?;
    let output = client.view(system, path).await?;
    println!("{index}: job output: {output}");
    Ok(())
}

/// Runs the `run` command.
pub async fn run(args: RunArgs, config: Config) -> Result<()> {
    let system = config.system(args.system)?;
    let client = config.client()?;

    let results = join_all(
        (0..args.count).map(|i| workflow(client.clone(), &system, &args.script, i)),
    )
    .await;

    let failed = results.iter().filter(|r| r.is_err()).count();
    for (i, result) in results.into_iter().enumerate() {
        if let Err(e) = result {
            error!("{i}: workflow failed: {e:#}");
        }
    }

    if failed > 0 {
        bail!("{failed} of {count} workflows failed", count = args.count);
    }

    Ok(())
}
