//! Implementation of the ci command.
//!
//! Runs a repository's test suite as a batch job: the command generates a
//! batch script that checks out the branch under test, submits it once the
//! target system is available and reports the job's output.

use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use clap::Parser;
use firecrest::Client;
use firecrest::Completion;
use firecrest::Script;
use firecrest::SubmissionRequest;
use firecrest::batch::BatchScript;
use firecrest::batch::check_output;

use crate::config::Config;

/// The file the generated batch script is written to.
pub const SCRIPT_FILE_NAME: &str = "submission_script.sh";

/// Arguments for the `ci` subcommand.
#[derive(Parser, Debug, Clone)]
pub struct CiArgs {
    /// The system to run the pipeline on.
    ///
    /// Defaults to the `MACHINE` environment variable.
    #[arg(long, value_name = "NAME")]
    pub system: Option<String>,

    /// The branch to test.
    #[arg(long, default_value = "main")]
    pub branch: String,

    /// The account to charge the job to.
    #[arg(long, default_value = "csstaff")]
    pub account: String,

    /// The repository to test.
    #[arg(long, value_name = "URL")]
    pub repo: String,

    /// The directory to write the batch script to.
    #[arg(long, value_name = "DIR", default_value = ".")]
    pub output_dir: PathBuf,
}

/// Quotes a value for use as a single shell word.
fn quote(name: &str, value: &str) -> Result<String> {
    shlex::try_quote(value)
        .map(|quoted| quoted.into_owned())
        .with_context(|| format!("{name} `{value}` cannot be used in a shell command"))
}

/// Creates the batch script that tests a repository branch.
pub fn batch_script(repo: &str, branch: &str, account: &str) -> Result<BatchScript> {
    let repo = quote("repository", repo)?;
    let branch = quote("branch", branch)?;

    Ok(BatchScript::builder()
        .job_name("f7t-ci")
        .account(account)
        .constraint("gpu")
        .nodes(2)
        .time("00:30:00")
        .modules(vec!["cray-python".to_string()])
        .commands(vec![
            format!("git clone --depth 1 --branch {branch} {repo} ci-checkout"),
            "cd ci-checkout".to_string(),
            "python -m venv .venv".to_string(),
            ". .venv/bin/activate".to_string(),
            "pip install --quiet -r requirements.txt pytest".to_string(),
            "srun --nodes 1 --ntasks 1 python -m pytest".to_string(),
        ])
        .build())
}

/// Reads a remote file as text.
async fn read_remote(client: &Client, system: &str, path: &str) -> Result<String> {
    let bytes = client
        .fetch_output(system, path)
        .await
        .with_context(|| format!("failed to read `{path}` on `{system}`"))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Runs the `ci` command.
pub async fn ci(args: CiArgs, config: Config) -> Result<()> {
    let system = config.system(args.system)?;
    println!(
        "Will try to run the ci in system {system} on branch {branch}",
        branch = args.branch
    );

    let script_path = args.output_dir.join(SCRIPT_FILE_NAME);
    let script = batch_script(&args.repo, &args.branch, &args.account)?;
    std::fs::write(&script_path, script.render()).with_context(|| {
        format!(
            "failed to write batch script `{path}`",
            path = script_path.display()
        )
    })?;

    let client = config.client()?;
    let status = client.system(&system).await?;
    if !status.is_available() {
        println!("System {system} is not available");
        bail!("system `{system}` is not available");
    }

    let request = SubmissionRequest::builder()
        .system(system.clone())
        .script(Script::path(&script_path))
        .account(args.account)
        .build();
    let submission = client.submit_job(&request).await?;
    println!("Submitted job {id}", id = submission.job_id);

    let job = client
        .poll_job_state(
            &system,
            &submission.job_id,
            config.firecrest.polling.job_interval(),
            Completion::Any,
        )
        .await?;

    let mut stdout = String::new();
    for (label, path) in [
        ("stdout", submission.job_file_out.as_deref()),
        ("stderr", submission.job_file_err.as_deref()),
    ] {
        let Some(path) = path else { continue };

        // The scheduler may send both streams to the same file
        if label == "stderr" && Some(path) == submission.job_file_out.as_deref() {
            continue;
        }

        let content = read_remote(&client, &system, path).await?;
        println!("{label} file: {path}");
        println!("{content}");
        if label == "stdout" {
            stdout = content;
        }
    }

    if !job.state.is_success() {
        bail!(
            "job `{id}` finished in state `{state}`",
            id = submission.job_id,
            state = job.state
        );
    }

    if !check_output(&stdout) {
        bail!(
            "the output of job `{id}` does not report success",
            id = submission.job_id
        );
    }

    println!("CI pipeline succeeded");
    Ok(())
}
