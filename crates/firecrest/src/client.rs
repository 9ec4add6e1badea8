//! Implementation of the FirecREST client.
//!
//! Every request made by the client goes through the same path: the rate
//! limiter for the endpoint's category is acquired, a bearer token is attached
//! (authenticating first if needed), and the response is decoded into an
//! explicit [`Reply`] for the endpoint.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use reqwest::Method;
use reqwest::RequestBuilder;
use reqwest::Response;
use reqwest::StatusCode;
use reqwest::multipart::Form;
use reqwest::multipart::Part;
use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_retry2::Retry;
use tokio_retry2::RetryError;
use tokio_retry2::strategy::ExponentialBackoff;
use tracing::debug;
use tracing::info;
use tracing::warn;
use url::Url;

use crate::Authenticator;
use crate::Category;
use crate::Completion;
use crate::Config;
use crate::Error;
use crate::JobInfo;
use crate::JobState;
use crate::JobSubmission;
use crate::RateLimiter;
use crate::Result;
use crate::Task;
use crate::TaskOutcome;
use crate::Token;
use crate::config::PollingConfig;
use crate::config::TaskStatusConfig;
use crate::config::TransferConfig;
use crate::job::JobListing;
use crate::task::TaskCreated;
use crate::task::TaskEnvelope;

/// The header selecting the target system of a request.
pub(crate) const MACHINE_HEADER: &str = "X-Machine-Name";

/// Response headers FirecREST uses to explain a failed request.
const ERROR_HEADERS: &[&str] = &[
    "x-machine-does-not-exist",
    "x-machine-not-available",
    "x-permission-denied",
    "x-invalid-path",
    "x-not-found",
    "x-not-a-directory",
    "x-a-directory",
    "x-exists",
    "x-size-limit",
    "x-timeout",
    "x-error",
];

/// Represents the error payload of a FirecREST response.
#[derive(Debug, Default, Clone, Deserialize)]
pub(crate) struct ApiFailure {
    /// The description of the failure.
    #[serde(default)]
    pub description: Option<String>,
    /// The error detail.
    #[serde(default)]
    pub error: Option<String>,
    /// Error headers present on the response.
    #[serde(skip)]
    pub headers: Vec<(String, String)>,
}

impl ApiFailure {
    /// Gets a message describing the failure.
    pub fn message(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        parts.extend(self.description.iter().cloned());
        parts.extend(self.error.iter().cloned());
        parts.extend(
            self.headers
                .iter()
                .map(|(name, value)| format!("{name}: {value}")),
        );

        if parts.is_empty() {
            "no error description was provided".to_string()
        } else {
            parts.join("; ")
        }
    }
}

/// Represents a decoded FirecREST response.
#[derive(Debug)]
pub(crate) enum Reply<T> {
    /// The request succeeded and the body matched the endpoint's payload.
    Success(T),
    /// The request failed and the body carried the error payload.
    Failure {
        /// The HTTP status of the response.
        status: StatusCode,
        /// The error payload.
        failure: ApiFailure,
    },
}

impl<T> Reply<T> {
    /// Converts a failure into an error using the given constructor.
    pub fn or_else(self, error: impl FnOnce(StatusCode, String) -> Error) -> Result<T> {
        match self {
            Self::Success(value) => Ok(value),
            Self::Failure { status, failure } => Err(error(status, failure.message())),
        }
    }

    /// Converts a failure into a generic API error for the endpoint.
    pub fn or_api(self, endpoint: &str) -> Result<T> {
        self.or_else(|status, message| Error::Api {
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
            message,
        })
    }
}

/// Decodes a response into a [`Reply`].
pub(crate) async fn decode<T: DeserializeOwned>(
    endpoint: &str,
    response: Response,
) -> Result<Reply<T>> {
    let status = response.status();
    let headers: Vec<_> = ERROR_HEADERS
        .iter()
        .filter_map(|name| {
            let value = response.headers().get(*name)?.to_str().ok()?;
            Some((name.to_string(), value.to_string()))
        })
        .collect();

    let body = response.text().await.map_err(|e| Error::Request {
        endpoint: endpoint.to_string(),
        source: e,
    })?;

    if status.is_success() {
        return serde_json::from_str(&body)
            .map(Reply::Success)
            .map_err(|e| Error::parse(endpoint, e));
    }

    debug!("response from `{endpoint}` was `{body}`");

    let mut failure = serde_json::from_str::<ApiFailure>(&body).unwrap_or_else(|_| ApiFailure {
        description: (!body.trim().is_empty()).then(|| body.trim().to_string()),
        ..Default::default()
    });
    failure.headers = headers;

    Ok(Reply::Failure { status, failure })
}

/// Represents the batch script of a submission.
#[derive(Debug, Clone)]
pub enum Script {
    /// A local file containing the script.
    Path(PathBuf),
    /// Script content with the file name to upload it as.
    Inline {
        /// The file name of the script.
        name: String,
        /// The script content.
        content: String,
    },
}

impl Script {
    /// Constructs a script from a local file path.
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self::Path(path.into())
    }

    /// Constructs a script from inline content.
    pub fn inline(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self::Inline {
            name: name.into(),
            content: content.into(),
        }
    }

    /// Reads the script, returning its file name and content.
    async fn read(&self) -> Result<(String, Vec<u8>)> {
        match self {
            Self::Path(path) => {
                let name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .ok_or_else(|| {
                        Error::Submission(format!(
                            "script path `{path}` does not name a file",
                            path = path.display()
                        ))
                    })?
                    .to_string();

                let content = tokio::fs::read(path).await.map_err(|e| {
                    Error::Submission(format!(
                        "failed to read script `{path}`: {e}",
                        path = path.display()
                    ))
                })?;

                Ok((name, content))
            }
            Self::Inline { name, content } => Ok((name.clone(), content.clone().into_bytes())),
        }
    }
}

/// Represents a request to submit a batch script.
#[derive(Debug, Clone, bon::Builder)]
pub struct SubmissionRequest {
    /// The name of the target system.
    #[builder(into)]
    pub system: String,
    /// The batch script to submit.
    pub script: Script,
    /// The account to charge the job to.
    #[builder(into)]
    pub account: Option<String>,
}

/// Represents a task created by a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmittedTask {
    /// The task identifier.
    pub task_id: String,
    /// The URL of the task, when reported.
    pub task_url: Option<String>,
}

/// The shared state of a [`Client`].
#[derive(Debug)]
struct Inner {
    /// The underlying HTTP client.
    http: reqwest::Client,
    /// The base URL of the API; always ends with a slash.
    base: Url,
    /// The token source.
    auth: Authenticator,
    /// The per-category rate limiter.
    limiter: RateLimiter,
    /// The polling configuration.
    polling: PollingConfig,
    /// The task status classification.
    task_status: TaskStatusConfig,
    /// The transfer configuration.
    transfer: TransferConfig,
    /// The number of retries for idempotent requests.
    retries: usize,
    /// Terminal tasks by identifier.
    terminal: Mutex<HashMap<String, Task>>,
}

/// A client for the FirecREST API.
///
/// The client can be cheaply cloned; clones share the access token, the rate
/// limiter and the record of terminal tasks, so independent workflows driven
/// concurrently through clones of one client observe a single rate limit.
#[derive(Debug, Clone)]
pub struct Client {
    /// The shared client state.
    inner: Arc<Inner>,
}

impl Client {
    /// Constructs a new client from the given configuration.
    pub fn new(config: &Config) -> Result<Self> {
        config.validate()?;

        let mut base = config.url()?.clone();
        if !base.path().ends_with('/') {
            base.set_path(&format!("{path}/", path = base.path()));
        }

        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.http.timeout() {
            builder = builder.timeout(timeout);
        }

        let http = builder
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            inner: Arc::new(Inner {
                auth: Authenticator::new(
                    http.clone(),
                    config.auth.credentials()?,
                    config.auth.expiry_leeway(),
                ),
                http,
                base,
                limiter: RateLimiter::new(&config.rate_limits),
                polling: config.polling.clone(),
                task_status: config.task_status,
                transfer: config.transfer.clone(),
                retries: config.http.retries(),
                terminal: Default::default(),
            }),
        })
    }

    /// Gets the base URL of the API.
    pub fn base_url(&self) -> &Url {
        &self.inner.base
    }

    /// Gets the polling configuration.
    pub fn polling(&self) -> &PollingConfig {
        &self.inner.polling
    }

    /// Gets the task status classification.
    pub fn task_status(&self) -> &TaskStatusConfig {
        &self.inner.task_status
    }

    /// Gets the transfer configuration.
    pub fn transfer(&self) -> &TransferConfig {
        &self.inner.transfer
    }

    /// Gets the underlying HTTP client.
    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.inner.http
    }

    /// Requests a new access token using the configured credentials.
    ///
    /// Requests made by the client authenticate on their own; this is useful
    /// for checking credentials up front.
    pub async fn authenticate(&self) -> Result<Token> {
        self.inner.auth.authenticate().await
    }

    /// Resolves an endpoint path against the base URL.
    pub(crate) fn endpoint(&self, path: &str) -> Result<Url> {
        self.inner
            .base
            .join(path.trim_start_matches('/'))
            .map_err(|e| Error::Config(format!("invalid endpoint `{path}`: {e}")))
    }

    /// Sends an authenticated request to an endpoint.
    ///
    /// The `build` callback attaches the body, query and headers to a request
    /// builder; it may be invoked more than once when a `GET` is retried.
    pub(crate) async fn send(
        &self,
        category: Category,
        method: Method,
        path: &str,
        build: impl Fn(RequestBuilder) -> RequestBuilder,
    ) -> Result<Response> {
        let url = self.endpoint(path)?;
        let retries = if method == Method::GET {
            self.inner.retries
        } else {
            0
        };

        let endpoint = path.to_string();
        Retry::spawn_notify(
            ExponentialBackoff::from_millis(50)
                .max_delay_millis(30_000)
                .take(retries),
            || self.attempt(category, method.clone(), &url, path, &build),
            move |e: &Error, delay: Duration| {
                warn!("request to `{endpoint}` failed, retrying in {delay:?}: {e}");
            },
        )
        .await
    }

    /// Makes a single attempt at sending a request.
    async fn attempt(
        &self,
        category: Category,
        method: Method,
        url: &Url,
        path: &str,
        build: &impl Fn(RequestBuilder) -> RequestBuilder,
    ) -> std::result::Result<Response, RetryError<Error>> {
        // A slot may take longer to free than a token lives
        self.inner.limiter.acquire(category).await;

        let bearer = self
            .inner
            .auth
            .bearer()
            .await
            .map_err(RetryError::permanent)?;

        debug!("{method} `{url}`");

        let request = build(
            self.inner
                .http
                .request(method, url.clone())
                .bearer_auth(bearer),
        );

        let response = request.send().await.map_err(|e| {
            let transient = e.is_connect() || e.is_timeout();
            let e = Error::Request {
                endpoint: path.to_string(),
                source: e,
            };

            if transient {
                RetryError::transient(e)
            } else {
                RetryError::permanent(e)
            }
        })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            // The token may have been revoked before its expiry
            self.inner.auth.invalidate().await;
        }

        if status.is_server_error() || status == StatusCode::UNAUTHORIZED {
            let message = response.text().await.unwrap_or_default();
            return Err(RetryError::transient(Error::Api {
                endpoint: path.to_string(),
                status: status.as_u16(),
                message,
            }));
        }

        Ok(response)
    }

    /// Sends a `GET` request to an endpoint targeting a system.
    pub(crate) async fn get_on(
        &self,
        category: Category,
        path: &str,
        system: &str,
        query: &[(&str, &str)],
    ) -> Result<Response> {
        self.send(category, Method::GET, path, |r| {
            r.header(MACHINE_HEADER, system).query(query)
        })
        .await
    }

    /// Gets the current status of a task.
    pub async fn task(&self, task_id: &str) -> Result<Task> {
        let path = format!("tasks/{task_id}");
        let response = self
            .send(Category::Tasks, Method::GET, &path, |r| r)
            .await?;

        decode::<TaskEnvelope>(&path, response)
            .await?
            .or_api(&path)?
            .task
            .into_task(task_id)
            .map_err(|e| Error::parse(&path, e))
    }

    /// Polls a task until it reaches a terminal status.
    ///
    /// The client suspends for `interval` between polls. There is no implicit
    /// timeout: a caller that wants a bound must impose one (e.g. with
    /// [`tokio::time::timeout`]).
    ///
    /// Terminal tasks are remembered; polling a task that was already observed
    /// as terminal returns the same payload without sending a request.
    pub async fn poll_task(&self, task_id: &str, interval: Duration) -> Result<Task> {
        if let Some(task) = self.terminal_task(task_id) {
            return Ok(task);
        }

        let task = self.poll_until_terminal(task_id, interval).await?;
        self.inner
            .terminal
            .lock()
            .expect("failed to lock terminal tasks")
            .insert(task_id.to_string(), task.clone());
        Ok(task)
    }

    /// Polls a task until it reaches a terminal status without remembering
    /// the result.
    async fn poll_until_terminal(&self, task_id: &str, interval: Duration) -> Result<Task> {
        loop {
            let task = self.task(task_id).await?;
            if task.is_terminal() {
                debug!(
                    "task `{task_id}` reached terminal status {status}",
                    status = task.status
                );
                return Ok(task);
            }

            debug!(
                "task `{task_id}` has status {status}: polling again in {interval:?}",
                status = task.status
            );
            tokio::time::sleep(interval).await;
        }
    }

    /// Gets the number of terminal tasks the client remembers.
    pub fn remembered_tasks(&self) -> usize {
        self.inner
            .terminal
            .lock()
            .expect("failed to lock terminal tasks")
            .len()
    }

    /// Gets a task previously observed as terminal.
    fn terminal_task(&self, task_id: &str) -> Option<Task> {
        self.inner
            .terminal
            .lock()
            .expect("failed to lock terminal tasks")
            .get(task_id)
            .cloned()
    }

    /// Uploads a batch script to a system for submission.
    ///
    /// Returns the task tracking the submission.
    pub async fn submit(&self, request: &SubmissionRequest) -> Result<SubmittedTask> {
        const PATH: &str = "compute/jobs/upload";

        if request.system.trim().is_empty() {
            return Err(Error::Submission(
                "the target system name cannot be empty".to_string(),
            ));
        }

        let (name, content) = request.script.read().await?;

        let response = self
            .send(Category::Compute, Method::POST, PATH, |r| {
                let part = Part::bytes(content.clone()).file_name(name.clone());
                let mut form = Form::new().part("file", part);
                if let Some(account) = &request.account {
                    form = form.text("account", account.clone());
                }

                r.header(MACHINE_HEADER, &request.system).multipart(form)
            })
            .await
            .map_err(|e| match e {
                Error::Request { source, .. } => {
                    Error::Submission(format!("failed to upload script `{name}`: {source}"))
                }
                Error::Api { message, status, .. } => Error::Submission(format!(
                    "server responded with status {status}: {message}"
                )),
                e => e,
            })?;

        let created: TaskCreated = decode(PATH, response).await?.or_else(|status, message| {
            Error::Submission(format!(
                "system `{system}` rejected `{name}` with status {status}: {message}",
                system = request.system
            ))
        })?;

        let task_id = created
            .task_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                Error::Submission(
                    "the submission response does not contain a task identifier".to_string(),
                )
            })?;

        info!(
            "submitted `{name}` to `{system}` as task `{task_id}`",
            system = request.system
        );

        Ok(SubmittedTask {
            task_id,
            task_url: created.task_url,
        })
    }

    /// Submits a batch script and waits for the scheduler to accept it.
    ///
    /// Returns the created job once the submission task succeeds.
    pub async fn submit_job(&self, request: &SubmissionRequest) -> Result<JobSubmission> {
        let submitted = self.submit(request).await?;
        let task = self
            .poll_task(&submitted.task_id, self.inner.polling.task_interval())
            .await?;

        match self.inner.task_status.outcome(task.status) {
            TaskOutcome::Succeeded => {
                let submission: JobSubmission = serde_json::from_value(task.data)
                    .map_err(|e| Error::parse(format!("tasks/{id}", id = task.id), e))?;
                info!(
                    "task `{id}` created job `{job}` on `{system}`",
                    id = task.id,
                    job = submission.job_id,
                    system = request.system
                );
                Ok(submission)
            }
            TaskOutcome::Failed => Err(Error::Submission(task.failure_message())),
            TaskOutcome::InProgress => unreachable!("polled task should be terminal"),
        }
    }

    /// Runs a scheduler query and returns the jobs it lists.
    ///
    /// Scheduler queries are themselves asynchronous tasks.
    async fn scheduler_query(
        &self,
        path: &str,
        system: &str,
        job_ids: &[&str],
    ) -> Result<Vec<JobInfo>> {
        let ids = job_ids.join(",");
        let query = [("jobs", ids.as_str())];
        let query = if ids.is_empty() {
            &query[..0]
        } else {
            &query[..]
        };

        let response = self.get_on(Category::Compute, path, system, query).await?;
        let created: TaskCreated = decode(path, response).await?.or_api(path)?;
        let task_id = created
            .task_id
            .ok_or_else(|| Error::parse(path, "the response does not contain a task identifier"))?;

        // Query tasks are internal to this call and are not remembered
        let task = self
            .poll_until_terminal(&task_id, self.inner.polling.task_interval())
            .await?;

        if self.inner.task_status.outcome(task.status) == TaskOutcome::Failed {
            return Err(Error::Api {
                endpoint: path.to_string(),
                status: task.status.code(),
                message: task.failure_message(),
            });
        }

        if task.data.is_null() {
            return Ok(Vec::new());
        }

        let listing: JobListing = serde_json::from_value(task.data)
            .map_err(|e| Error::parse(format!("tasks/{task_id}"), e))?;
        Ok(listing.into_jobs())
    }

    /// Gets the jobs that are still in the scheduler queue.
    ///
    /// If `job_ids` is empty, every queued job of the user is returned.
    pub async fn poll_active(&self, system: &str, job_ids: &[&str]) -> Result<Vec<JobInfo>> {
        self.scheduler_query("compute/jobs", system, job_ids).await
    }

    /// Gets the accounting record of a job.
    ///
    /// Returns `Ok(None)` if the scheduler has no record of the job yet.
    pub async fn job(&self, system: &str, job_id: &str) -> Result<Option<JobInfo>> {
        let jobs = self
            .scheduler_query("compute/acct", system, &[job_id])
            .await?;
        Ok(jobs.into_iter().find(|j| j.job_id == job_id))
    }

    /// Polls a job until it reaches a terminal state.
    ///
    /// The client suspends for `interval` between polls. A job the scheduler
    /// has no record of yet is treated as pending.
    ///
    /// With [`Completion::Success`], a terminal state other than `COMPLETED`
    /// results in [`Error::Scheduler`].
    pub async fn poll_job_state(
        &self,
        system: &str,
        job_id: &str,
        interval: Duration,
        completion: Completion,
    ) -> Result<JobInfo> {
        let mut last: Option<JobState> = None;

        loop {
            if let Some(job) = self.job(system, job_id).await? {
                if last.as_ref() != Some(&job.state) {
                    info!("job `{job_id}` on `{system}` is {state}", state = job.state);
                    last = Some(job.state.clone());
                }

                if job.state.is_terminal() {
                    if completion == Completion::Success && !job.state.is_success() {
                        return Err(Error::Scheduler {
                            job_id: job_id.to_string(),
                            state: job.state,
                        });
                    }

                    return Ok(job);
                }
            } else {
                debug!("job `{job_id}` has no accounting record yet");
            }

            tokio::time::sleep(interval).await;
        }
    }
}
