//! Implementation of workflow steps.
//!
//! A workflow uploads its inputs, submits a job and waits for it to finish,
//! then downloads the job's output. Each step can also be driven on its own by
//! an external orchestrator, passing the [`CompletedJob`] of a submission to a
//! later download.

use std::path::PathBuf;

use serde::Serialize;
use tracing::info;

use crate::Client;
use crate::Completion;
use crate::Error;
use crate::JobInfo;
use crate::JobSubmission;
use crate::Result;
use crate::Script;
use crate::SubmissionRequest;
use crate::TransferMode;

/// Represents a job that finished successfully.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletedJob {
    /// The system the job ran on.
    pub system: String,
    /// The submission that created the job.
    pub submission: JobSubmission,
    /// The final scheduler record of the job.
    pub job: JobInfo,
}

impl CompletedJob {
    /// Gets the remote path of the job's standard output.
    pub fn stdout_path(&self) -> Option<&str> {
        self.submission
            .job_file_out
            .as_deref()
            .or(self.job.stdout_path.as_deref())
    }

    /// Gets the remote path of the job's standard error.
    pub fn stderr_path(&self) -> Option<&str> {
        self.submission
            .job_file_err
            .as_deref()
            .or(self.job.stderr_path.as_deref())
    }
}

/// Submits a batch script and waits for the job to complete.
#[derive(Debug, Clone, bon::Builder)]
pub struct SubmitStep {
    /// The target system.
    #[builder(into)]
    pub system: String,
    /// The batch script.
    pub script: Script,
    /// The account to charge the job to.
    #[builder(into)]
    pub account: Option<String>,
}

impl SubmitStep {
    /// Executes the step.
    ///
    /// Fails with [`Error::Scheduler`] if the job ends in any state other
    /// than `COMPLETED`.
    pub async fn execute(&self, client: &Client) -> Result<CompletedJob> {
        let request = SubmissionRequest {
            system: self.system.clone(),
            script: self.script.clone(),
            account: self.account.clone(),
        };

        let submission = client.submit_job(&request).await?;
        let job = client
            .poll_job_state(
                &self.system,
                &submission.job_id,
                client.polling().job_interval(),
                Completion::Success,
            )
            .await?;

        Ok(CompletedJob {
            system: self.system.clone(),
            submission,
            job,
        })
    }
}

/// Downloads the standard output of a completed job.
#[derive(Debug, Clone, bon::Builder)]
pub struct DownloadStep {
    /// The system the job ran on.
    #[builder(into)]
    pub system: String,
    /// The local path to write the output to.
    #[builder(into)]
    pub local_path: PathBuf,
}

impl DownloadStep {
    /// Executes the step.
    pub async fn execute(&self, client: &Client, job: &CompletedJob) -> Result<()> {
        let remote = job.stdout_path().ok_or_else(|| {
            Error::Transfer(format!(
                "job `{id}` did not report an output path",
                id = job.submission.job_id
            ))
        })?;

        let content = client.fetch_output(&self.system, remote).await?;
        tokio::fs::write(&self.local_path, content)
            .await
            .map_err(|e| Error::io(&self.local_path, e))?;

        info!(
            "downloaded the output of job `{id}` to `{path}`",
            id = job.submission.job_id,
            path = self.local_path.display()
        );
        Ok(())
    }
}

/// Uploads an input file to a system.
#[derive(Debug, Clone, bon::Builder)]
pub struct UploadStep {
    /// The target system.
    #[builder(into)]
    pub system: String,
    /// The local file to upload.
    #[builder(into)]
    pub source_path: PathBuf,
    /// The remote destination.
    ///
    /// A directory for direct uploads; the remote file path for staged
    /// uploads.
    #[builder(into)]
    pub target_path: String,
}

impl UploadStep {
    /// Executes the step using the client's transfer mode.
    pub async fn execute(&self, client: &Client) -> Result<()> {
        match client.transfer().mode {
            TransferMode::Direct => {
                client
                    .upload(&self.system, &self.source_path, &self.target_path)
                    .await
            }
            TransferMode::Staged => {
                let interval = client.polling().task_interval();
                let upload = client
                    .external_upload(&self.system, &self.source_path, &self.target_path)
                    .await?;
                upload.upload(interval).await?;
                upload.wait_finished(interval).await
            }
        }
    }
}

/// Represents a complete workflow.
#[derive(Debug, Clone, bon::Builder)]
pub struct Workflow {
    /// The inputs to upload before submitting.
    #[builder(default)]
    pub uploads: Vec<UploadStep>,
    /// The submission.
    pub submit: SubmitStep,
    /// Where to download the job's output, if anywhere.
    pub download: Option<DownloadStep>,
}

impl Workflow {
    /// Runs the workflow to completion.
    ///
    /// Independent workflows may be run concurrently through clones of one
    /// client; they share its token and rate limiter.
    pub async fn run(&self, client: &Client) -> Result<CompletedJob> {
        for upload in &self.uploads {
            upload.execute(client).await?;
        }

        let job = self.submit.execute(client).await?;

        if let Some(download) = &self.download {
            download.execute(client, &job).await?;
        }

        Ok(job)
    }
}
