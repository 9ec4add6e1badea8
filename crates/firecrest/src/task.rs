//! Implementation of FirecREST asynchronous tasks.
//!
//! Long-running FirecREST operations (job submission, scheduler queries and
//! staged transfers) immediately return a task identifier. The task is then
//! polled until its status code reaches the terminal range.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::config::TaskStatusConfig;

/// The lowest terminal task status code.
///
/// Any code below this value means the task is still in progress.
pub const TERMINAL_THRESHOLD: u16 = 200;

/// Represents the status code of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskStatus(u16);

impl TaskStatus {
    /// Constructs a task status from a raw code.
    pub const fn new(code: u16) -> Self {
        Self(code)
    }

    /// Gets the raw status code.
    pub const fn code(self) -> u16 {
        self.0
    }

    /// Determines if the task has reached a terminal status.
    pub const fn is_terminal(self) -> bool {
        self.0 >= TERMINAL_THRESHOLD
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{code}", code = self.0)
    }
}

impl FromStr for TaskStatus {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

/// Represents the classification of a task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The task has not reached a terminal status.
    InProgress,
    /// The task finished successfully.
    Succeeded,
    /// The task finished unsuccessfully.
    Failed,
}

impl TaskStatusConfig {
    /// Classifies a task status.
    pub fn outcome(&self, status: TaskStatus) -> TaskOutcome {
        if !status.is_terminal() {
            TaskOutcome::InProgress
        } else if (self.success_min..=self.success_max).contains(&status.code()) {
            TaskOutcome::Succeeded
        } else {
            TaskOutcome::Failed
        }
    }
}

/// Represents a FirecREST task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Task {
    /// The task identifier.
    pub id: String,
    /// The task status.
    #[serde(serialize_with = "serialize_status")]
    pub status: TaskStatus,
    /// The human readable description of the status.
    pub description: Option<String>,
    /// The microservice that created the task.
    pub service: Option<String>,
    /// The task payload.
    ///
    /// Its shape depends on the operation and status: a job submission
    /// carries the job identifier and output paths, a staged download
    /// carries the object storage link, and a failure carries an error
    /// message.
    pub data: JsonValue,
}

/// Serializes a task status as its code.
fn serialize_status<S>(status: &TaskStatus, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_u16(status.code())
}

impl Task {
    /// Determines if the task has reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Gets a message describing a failed task.
    ///
    /// Prefers a string payload over the status description.
    pub(crate) fn failure_message(&self) -> String {
        match &self.data {
            JsonValue::String(s) if !s.is_empty() => s.clone(),
            JsonValue::Null => self
                .description
                .clone()
                .unwrap_or_else(|| format!("task `{id}` failed", id = self.id)),
            other => match &self.description {
                Some(description) => format!("{description}: {other}"),
                None => other.to_string(),
            },
        }
    }
}

/// Represents the response to a request that created a task.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct TaskCreated {
    /// The identifier of the created task.
    pub task_id: Option<String>,
    /// The URL of the created task.
    #[serde(default)]
    pub task_url: Option<String>,
}

/// Represents the response of the task status endpoint.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct TaskEnvelope {
    /// The task record.
    pub task: TaskRecord,
}

/// Represents a task record as sent by FirecREST.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct TaskRecord {
    /// The task identifier.
    #[serde(default, alias = "hash_id")]
    pub task_id: Option<String>,
    /// The status code as a string.
    pub status: String,
    /// The description of the status.
    #[serde(default)]
    pub description: Option<String>,
    /// The service that created the task.
    #[serde(default)]
    pub service: Option<String>,
    /// The task payload.
    #[serde(default)]
    pub data: JsonValue,
}

impl TaskRecord {
    /// Converts the record into a task.
    ///
    /// Returns an error message if the status is not an integer.
    pub fn into_task(self, id: &str) -> Result<Task, String> {
        let status = self
            .status
            .parse()
            .map_err(|_| format!("task status `{status}` is not an integer", status = self.status))?;

        Ok(Task {
            id: self.task_id.unwrap_or_else(|| id.to_string()),
            status,
            description: self.description,
            service: self.service,
            data: self.data,
        })
    }
}
