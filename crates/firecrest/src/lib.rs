//! A client for submitting and tracking HPC jobs through the FirecREST API.
//!
//! The [`Client`] authenticates with the OAuth2 client-credentials grant,
//! submits batch scripts to a named system, polls the resulting tasks and jobs
//! until they reach a terminal state, and retrieves job output either directly
//! or through the object storage staging area.
//!
//! ```no_run
//! # async fn example() -> firecrest::Result<()> {
//! use firecrest::Client;
//! use firecrest::Completion;
//! use firecrest::Config;
//! use firecrest::Script;
//! use firecrest::SubmissionRequest;
//!
//! let config = Config::from_env()?;
//! let client = Client::new(&config)?;
//!
//! let request = SubmissionRequest::builder()
//!     .system("daint")
//!     .script(Script::path("script.sh"))
//!     .build();
//!
//! let submission = client.submit_job(&request).await?;
//! let job = client
//!     .poll_job_state(
//!         "daint",
//!         &submission.job_id,
//!         config.polling.job_interval(),
//!         Completion::Success,
//!     )
//!     .await?;
//!
//! if let Some(path) = &submission.job_file_out {
//!     let output = client.fetch_output("daint", path).await?;
//!     println!("{}", String::from_utf8_lossy(&output));
//! }
//! # let _ = job;
//! # Ok(())
//! # }
//! ```

mod auth;
pub mod batch;
mod client;
pub mod config;
mod error;
mod job;
mod limiter;
mod status;
pub mod storage;
mod task;
pub mod workflow;

pub use auth::*;
pub use client::Client;
pub use client::Script;
pub use client::SubmissionRequest;
pub use client::SubmissionRequestBuilder;
pub use client::SubmittedTask;
pub use config::Config;
pub use config::TransferMode;
pub use error::*;
pub use job::Completion;
pub use job::JobInfo;
pub use job::JobState;
pub use job::JobSubmission;
pub use limiter::*;
pub use status::*;
pub use storage::ExternalDownload;
pub use storage::ExternalUpload;
pub use task::TERMINAL_THRESHOLD;
pub use task::Task;
pub use task::TaskOutcome;
pub use task::TaskStatus;
