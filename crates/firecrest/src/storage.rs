//! Implementation of file transfers.
//!
//! Small files are moved directly through the `utilities` endpoints. Larger
//! files are staged through object storage: FirecREST copies the file to a
//! staging area and hands out a temporary link, which should be invalidated
//! once the file has been retrieved.

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use futures::StreamExt;
use reqwest::Method;
use reqwest::multipart::Form;
use reqwest::multipart::Part;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::io::BufWriter;
use tracing::debug;
use tracing::info;
use tracing::warn;
use url::Url;

use crate::Category;
use crate::Client;
use crate::Error;
use crate::Result;
use crate::Task;
use crate::TaskStatus;
use crate::client::MACHINE_HEADER;
use crate::client::Reply;
use crate::client::decode;
use crate::config::TransferMode;
use crate::task::TaskCreated;

/// The header naming the task whose object storage link is invalidated.
const TASK_ID_HEADER: &str = "X-Task-Id";

/// Staged upload status: the object storage form is ready.
pub const UPLOAD_FORM_READY: TaskStatus = TaskStatus::new(111);

/// Staged upload status: the object storage received the file.
pub const UPLOAD_RECEIVED: TaskStatus = TaskStatus::new(112);

/// Staged upload status: the file is moving from the staging area to the
/// system.
pub const UPLOAD_IN_PROGRESS: TaskStatus = TaskStatus::new(113);

/// Staged upload status: the file arrived on the system.
pub const UPLOAD_FINISHED: TaskStatus = TaskStatus::new(114);

/// Staged upload status: the transfer to the system failed.
pub const UPLOAD_FAILED: TaskStatus = TaskStatus::new(115);

/// Staged download status: the file is moving to the staging area.
pub const DOWNLOAD_IN_PROGRESS: TaskStatus = TaskStatus::new(116);

/// Staged download status: the object storage link is ready.
pub const DOWNLOAD_READY: TaskStatus = TaskStatus::new(117);

/// Staged download status: the transfer to the staging area failed.
pub const DOWNLOAD_FAILED: TaskStatus = TaskStatus::new(118);

/// Represents the response of the view endpoint.
#[derive(Debug, Deserialize)]
struct ViewResponse {
    /// The file content.
    output: String,
}

/// Represents the object storage form a staged upload posts to.
#[derive(Debug, Clone, Deserialize)]
struct UploadForm {
    /// The URL of the form.
    url: Url,
    /// The HTTP method of the form; only `POST` is supported.
    #[serde(default)]
    method: Option<String>,
    /// The form fields to send along with the file.
    #[serde(default)]
    data: BTreeMap<String, JsonValue>,
    /// Extra headers to send.
    #[serde(default)]
    headers: BTreeMap<String, String>,
}

/// Represents the payload of a staged upload whose form is ready.
#[derive(Debug, Deserialize)]
struct UploadFormPayload {
    /// The form parameters.
    parameters: UploadForm,
}

/// Creates a task through a `POST` to a storage endpoint and returns its id.
async fn create_transfer(
    client: &Client,
    path: &str,
    system: &str,
    form: &[(&str, &str)],
) -> Result<String> {
    let response = client
        .send(Category::Storage, Method::POST, path, |r| {
            r.header(MACHINE_HEADER, system).form(form)
        })
        .await
        .map_err(into_transfer)?;

    let created: TaskCreated = decode(path, response).await?.or_else(|status, message| {
        Error::Transfer(format!(
            "system `{system}` rejected the transfer with status {status}: {message}"
        ))
    })?;

    created
        .task_id
        .ok_or_else(|| Error::parse(path, "the response does not contain a task identifier"))
}

/// Reclassifies request failures as transfer failures.
fn into_transfer(e: Error) -> Error {
    match e {
        Error::Request { endpoint, source } => {
            Error::Transfer(format!("request to `{endpoint}` failed: {source}"))
        }
        Error::Api {
            endpoint,
            status,
            message,
        } => Error::Transfer(format!(
            "request to `{endpoint}` failed with status {status}: {message}"
        )),
        e => e,
    }
}

/// Represents a file being staged from a system for download.
#[derive(Debug, Clone)]
pub struct ExternalDownload {
    /// The client that created the transfer.
    client: Client,
    /// The system the file is on.
    system: String,
    /// The remote path of the file.
    source: String,
    /// The identifier of the transfer task.
    task_id: String,
    /// The object storage link, once ready.
    link: Option<Url>,
}

impl ExternalDownload {
    /// Gets the identifier of the transfer task.
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Gets the remote path being downloaded.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Gets the current status of the transfer.
    pub async fn status(&self) -> Result<TaskStatus> {
        Ok(self.client.task(&self.task_id).await?.status)
    }

    /// Waits until the file is available in the staging area.
    ///
    /// Returns the object storage link.
    pub async fn wait_ready(&mut self, interval: Duration) -> Result<Url> {
        if let Some(link) = &self.link {
            return Ok(link.clone());
        }

        let link = loop {
            let task = self.client.task(&self.task_id).await?;
            match task.status {
                DOWNLOAD_READY => break parse_link(&task)?,
                DOWNLOAD_FAILED => return Err(Error::Transfer(task.failure_message())),
                status if status.is_terminal() => {
                    return Err(Error::Transfer(task.failure_message()));
                }
                status => {
                    debug!(
                        "staging of `{source}` has status {status}: polling again in {interval:?}",
                        source = self.source
                    );
                    tokio::time::sleep(interval).await;
                }
            }
        };

        info!(
            "`{source}` on `{system}` is staged for download",
            source = self.source,
            system = self.system
        );
        self.link = Some(link.clone());
        Ok(link)
    }

    /// Gets the object storage link once the file is staged.
    pub async fn object_storage_link(&mut self) -> Result<Url> {
        let interval = self.client.polling().task_interval();
        self.wait_ready(interval).await
    }

    /// Retrieves the staged file.
    ///
    /// The file may be retrieved any number of times until the link is
    /// invalidated.
    pub async fn bytes(&mut self) -> Result<Vec<u8>> {
        let link = self.object_storage_link().await?;
        let response = self.fetch(&link).await?;
        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| Error::Transfer(format!("failed to read staged `{}`: {e}", self.source)))
    }

    /// Retrieves the staged file into a local path.
    pub async fn finish_download(&mut self, local_path: impl AsRef<Path>) -> Result<()> {
        let local_path = local_path.as_ref();
        let link = self.object_storage_link().await?;
        let response = self.fetch(&link).await?;

        let file = fs::File::create(local_path)
            .await
            .map_err(|e| Error::io(local_path, e))?;
        let mut writer = BufWriter::new(file);
        let mut stream = response.bytes_stream();
        while let Some(bytes) = stream.next().await {
            let bytes = bytes.map_err(|e| {
                Error::Transfer(format!("failed to read staged `{}`: {e}", self.source))
            })?;
            writer
                .write_all(&bytes)
                .await
                .map_err(|e| Error::io(local_path, e))?;
        }

        writer.flush().await.map_err(|e| Error::io(local_path, e))?;
        info!(
            "downloaded `{source}` to `{path}`",
            source = self.source,
            path = local_path.display()
        );
        Ok(())
    }

    /// Sends the request for the staged file.
    async fn fetch(&self, link: &Url) -> Result<reqwest::Response> {
        // Object storage links are presigned; no bearer token is sent
        let response = self
            .client
            .http()
            .get(link.clone())
            .send()
            .await
            .map_err(|e| Error::Transfer(format!("failed to reach object storage: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Transfer(format!(
                "object storage rejected the link for `{source}` with status {status}: the link \
                 may have expired or been invalidated",
                source = self.source
            )));
        }

        Ok(response)
    }

    /// Invalidates the object storage link.
    pub async fn invalidate(&mut self) -> Result<()> {
        const PATH: &str = "storage/xfer-external/invalidate";

        let response = self
            .client
            .send(Category::Storage, Method::POST, PATH, |r| {
                r.header(TASK_ID_HEADER, &self.task_id)
            })
            .await
            .map_err(into_transfer)?;

        decode::<JsonValue>(PATH, response)
            .await?
            .or_else(|status, message| {
                Error::Transfer(format!(
                    "failed to invalidate the link for `{source}` with status {status}: {message}",
                    source = self.source
                ))
            })?;

        debug!("invalidated the link for `{source}`", source = self.source);
        self.link = None;
        Ok(())
    }
}

/// Parses the object storage link out of a ready download task.
fn parse_link(task: &Task) -> Result<Url> {
    let endpoint = || format!("tasks/{id}", id = task.id);
    let link = task
        .data
        .as_str()
        .ok_or_else(|| Error::parse(endpoint(), "the staged download has no link"))?;
    link.parse().map_err(|e| Error::parse(endpoint(), e))
}

/// Represents a file being uploaded to a system through the staging area.
#[derive(Debug, Clone)]
pub struct ExternalUpload {
    /// The client that created the transfer.
    client: Client,
    /// The local file being uploaded.
    source: PathBuf,
    /// The remote destination.
    target: String,
    /// The identifier of the transfer task.
    task_id: String,
}

impl ExternalUpload {
    /// Gets the identifier of the transfer task.
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Gets the current status of the transfer.
    pub async fn status(&self) -> Result<TaskStatus> {
        Ok(self.client.task(&self.task_id).await?.status)
    }

    /// Waits for the object storage form and posts the local file to it.
    pub async fn upload(&self, interval: Duration) -> Result<()> {
        let form = loop {
            let task = self.client.task(&self.task_id).await?;
            match task.status {
                UPLOAD_FORM_READY => {
                    let payload: UploadFormPayload = serde_json::from_value(task.data)
                        .map_err(|e| Error::parse(format!("tasks/{}", self.task_id), e))?;
                    break payload.parameters;
                }
                UPLOAD_FAILED => return Err(Error::Transfer(task.failure_message())),
                status if status.is_terminal() => {
                    return Err(Error::Transfer(task.failure_message()));
                }
                _ => tokio::time::sleep(interval).await,
            }
        };

        if let Some(method) = &form.method
            && !method.eq_ignore_ascii_case("post")
        {
            return Err(Error::Transfer(format!(
                "unsupported object storage upload method `{method}`"
            )));
        }

        let content = fs::read(&self.source)
            .await
            .map_err(|e| Error::io(&self.source, e))?;
        let name = self
            .source
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("upload")
            .to_string();

        let mut multipart = Form::new();
        for (key, value) in &form.data {
            let value = match value {
                JsonValue::String(s) => s.clone(),
                other => other.to_string(),
            };
            multipart = multipart.text(key.clone(), value);
        }
        multipart = multipart.part("file", Part::bytes(content).file_name(name));

        let mut request = self.client.http().post(form.url.clone());
        for (name, value) in &form.headers {
            request = request.header(name, value);
        }

        let response = request
            .multipart(multipart)
            .send()
            .await
            .map_err(|e| Error::Transfer(format!("failed to reach object storage: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Transfer(format!(
                "object storage rejected the upload of `{source}` with status {status}",
                source = self.source.display()
            )));
        }

        info!(
            "uploaded `{source}` to the staging area for `{target}`",
            source = self.source.display(),
            target = self.target
        );
        Ok(())
    }

    /// Waits until the file has been moved from the staging area to the
    /// system.
    pub async fn wait_finished(&self, interval: Duration) -> Result<()> {
        loop {
            let task = self.client.task(&self.task_id).await?;
            match task.status {
                UPLOAD_FINISHED => {
                    info!("`{target}` is on the system", target = self.target);
                    return Ok(());
                }
                UPLOAD_FAILED => return Err(Error::Transfer(task.failure_message())),
                status if status.is_terminal() => {
                    return Err(Error::Transfer(task.failure_message()));
                }
                _ => tokio::time::sleep(interval).await,
            }
        }
    }
}

impl Client {
    /// Starts staging a remote file for download.
    pub async fn external_download(&self, system: &str, path: &str) -> Result<ExternalDownload> {
        let task_id = create_transfer(
            self,
            "storage/xfer-external/download",
            system,
            &[("sourcePath", path)],
        )
        .await?;

        debug!("staging `{path}` on `{system}` with task `{task_id}`");
        Ok(ExternalDownload {
            client: self.clone(),
            system: system.to_string(),
            source: path.to_string(),
            task_id,
            link: None,
        })
    }

    /// Starts a staged upload of a local file to a system.
    pub async fn external_upload(
        &self,
        system: &str,
        source: impl AsRef<Path>,
        target: &str,
    ) -> Result<ExternalUpload> {
        let source = source.as_ref();
        if !fs::try_exists(source).await.unwrap_or(false) {
            return Err(Error::Transfer(format!(
                "local file `{path}` does not exist",
                path = source.display()
            )));
        }

        let name = source
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();

        let task_id = create_transfer(
            self,
            "storage/xfer-external/upload",
            system,
            &[("sourcePath", name), ("targetPath", target)],
        )
        .await?;

        Ok(ExternalUpload {
            client: self.clone(),
            source: source.to_path_buf(),
            target: target.to_string(),
            task_id,
        })
    }

    /// Views the content of a small remote text file.
    pub async fn view(&self, system: &str, path: &str) -> Result<String> {
        const PATH: &str = "utilities/view";

        let response = self
            .get_on(Category::Utilities, PATH, system, &[("targetPath", path)])
            .await
            .map_err(into_transfer)?;

        let view: ViewResponse = decode(PATH, response).await?.or_else(|status, message| {
            Error::Transfer(format!(
                "failed to view `{path}` on `{system}` with status {status}: {message}"
            ))
        })?;
        Ok(view.output)
    }

    /// Downloads a small remote file directly.
    pub async fn download(&self, system: &str, path: &str) -> Result<Vec<u8>> {
        const PATH: &str = "utilities/download";

        let response = self
            .get_on(Category::Utilities, PATH, system, &[("sourcePath", path)])
            .await
            .map_err(into_transfer)?;

        let status = response.status();
        if !status.is_success() {
            let message = match decode::<JsonValue>(PATH, response).await? {
                Reply::Failure { failure, .. } => failure.message(),
                Reply::Success(value) => value.to_string(),
            };
            return Err(Error::Transfer(format!(
                "failed to download `{path}` from `{system}` with status {status}: {message}"
            )));
        }

        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| Error::Transfer(format!("failed to read `{path}`: {e}")))
    }

    /// Uploads a small local file directly into a remote directory.
    pub async fn upload(
        &self,
        system: &str,
        source: impl AsRef<Path>,
        target_dir: &str,
    ) -> Result<()> {
        const PATH: &str = "utilities/upload";

        let source = source.as_ref();
        let content = fs::read(source).await.map_err(|e| Error::io(source, e))?;
        let name = source
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("upload")
            .to_string();

        let response = self
            .send(Category::Utilities, Method::POST, PATH, |r| {
                let form = Form::new()
                    .text("targetPath", target_dir.to_string())
                    .part("file", Part::bytes(content.clone()).file_name(name.clone()));
                r.header(MACHINE_HEADER, system).multipart(form)
            })
            .await
            .map_err(into_transfer)?;

        decode::<JsonValue>(PATH, response)
            .await?
            .or_else(|status, message| {
                Error::Transfer(format!(
                    "failed to upload `{source}` to `{system}` with status {status}: {message}",
                    source = source.display()
                ))
            })?;

        info!(
            "uploaded `{source}` to `{target_dir}` on `{system}`",
            source = source.display()
        );
        Ok(())
    }

    /// Reads the content of a remote file, such as a job's output.
    ///
    /// Uses the configured [`TransferMode`]; a staged transfer invalidates its
    /// link after retrieval unless links are configured to be kept.
    pub async fn fetch_output(&self, system: &str, path: &str) -> Result<Vec<u8>> {
        match self.transfer().mode {
            TransferMode::Direct => self.download(system, path).await,
            TransferMode::Staged => {
                let mut download = self.external_download(system, path).await?;
                let bytes = download.bytes().await;
                if self.transfer().keep_links {
                    return bytes;
                }

                match (bytes, download.invalidate().await) {
                    (Ok(bytes), Ok(())) => Ok(bytes),
                    (Ok(_), Err(e)) => Err(e),
                    (Err(e), invalidated) => {
                        if let Err(cause) = invalidated {
                            warn!("failed to invalidate the link for `{path}`: {cause}");
                        }
                        Err(e)
                    }
                }
            }
        }
    }
}
