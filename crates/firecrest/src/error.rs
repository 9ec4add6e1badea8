//! Error types for the FirecREST client.

use std::path::PathBuf;

use crate::JobState;

/// Represents an error from the FirecREST client.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The token endpoint rejected the credentials or could not be reached.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// A batch script could not be uploaded or the submission was rejected.
    #[error("job submission failed: {0}")]
    Submission(String),

    /// A job reached a terminal state other than `COMPLETED`.
    #[error("job `{job_id}` finished in state `{state}`")]
    Scheduler {
        /// The identifier of the job.
        job_id: String,
        /// The terminal state the job reached.
        state: JobState,
    },

    /// A staged or direct file transfer failed.
    #[error("file transfer failed: {0}")]
    Transfer(String),

    /// A response body did not match the shape expected for its endpoint.
    #[error("failed to parse response from `{endpoint}`: {message}")]
    Parse {
        /// The endpoint that produced the response.
        endpoint: String,
        /// A description of what was malformed.
        message: String,
    },

    /// The FirecREST API returned an error for a request that does not belong
    /// to one of the categories above.
    #[error("request to `{endpoint}` failed with status {status}: {message}")]
    Api {
        /// The endpoint that was requested.
        endpoint: String,
        /// The HTTP status code of the response.
        status: u16,
        /// The error message reported by the API.
        message: String,
    },

    /// The client configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A transport-level failure while talking to the API.
    #[error("failed to send request to `{endpoint}`")]
    Request {
        /// The endpoint that was requested.
        endpoint: String,
        /// The underlying transport error.
        #[source]
        source: reqwest::Error,
    },

    /// A local file could not be read or written.
    #[error("failed to access `{}`", .path.display())]
    Io {
        /// The local path being accessed.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Constructs a parse error for the given endpoint.
    pub(crate) fn parse(endpoint: impl Into<String>, message: impl ToString) -> Self {
        Self::Parse {
            endpoint: endpoint.into(),
            message: message.to_string(),
        }
    }

    /// Constructs an I/O error for the given path.
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result type for FirecREST client operations.
pub type Result<T> = std::result::Result<T, Error>;
