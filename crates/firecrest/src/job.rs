//! Implementation of scheduler jobs.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value as JsonValue;

/// Represents the state of a scheduler job.
///
/// States that are not known are preserved in [`JobState::Other`] and treated
/// as non-terminal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JobState {
    /// The job is waiting for resources.
    Pending,
    /// The job is running.
    Running,
    /// The job is finishing and some processes may still be active.
    Completing,
    /// The job has been allocated nodes that are booting.
    Configuring,
    /// The job has been suspended.
    Suspended,
    /// The job has been requeued.
    Requeued,
    /// The job is about to change size.
    Resizing,
    /// The job has been stopped with its resources retained.
    Stopped,
    /// The job finished with an exit code of zero.
    Completed,
    /// The job finished with a non-zero exit code or other failure.
    Failed,
    /// The job was cancelled.
    Cancelled,
    /// The job reached its time limit.
    Timeout,
    /// The job failed to launch because of a node boot failure.
    BootFail,
    /// The job reached its deadline.
    Deadline,
    /// The job failed because of a node failure.
    NodeFail,
    /// The job ran out of memory.
    OutOfMemory,
    /// The job was preempted.
    Preempted,
    /// A state not known to the client.
    Other(String),
}

impl JobState {
    /// Determines if the state is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed
                | Self::Failed
                | Self::Cancelled
                | Self::Timeout
                | Self::BootFail
                | Self::Deadline
                | Self::NodeFail
                | Self::OutOfMemory
                | Self::Preempted
        )
    }

    /// Determines if the state is the successful terminal state.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Gets the scheduler's name for the state.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completing => "COMPLETING",
            Self::Configuring => "CONFIGURING",
            Self::Suspended => "SUSPENDED",
            Self::Requeued => "REQUEUED",
            Self::Resizing => "RESIZING",
            Self::Stopped => "STOPPED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Timeout => "TIMEOUT",
            Self::BootFail => "BOOT_FAIL",
            Self::Deadline => "DEADLINE",
            Self::NodeFail => "NODE_FAIL",
            Self::OutOfMemory => "OUT_OF_MEMORY",
            Self::Preempted => "PREEMPTED",
            Self::Other(s) => s,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // The scheduler decorates some states, e.g. `CANCELLED by 1234` or
        // `RUNNING+`; only the leading word is significant
        let base = s
            .trim()
            .split(|c: char| c.is_whitespace() || c == '+')
            .next()
            .unwrap_or_default();

        Ok(match base.to_ascii_uppercase().as_str() {
            "PENDING" | "PD" => Self::Pending,
            "RUNNING" | "R" => Self::Running,
            "COMPLETING" | "CG" => Self::Completing,
            "CONFIGURING" | "CF" => Self::Configuring,
            "SUSPENDED" | "S" => Self::Suspended,
            "REQUEUED" | "RQ" => Self::Requeued,
            "RESIZING" | "RS" => Self::Resizing,
            "STOPPED" | "ST" => Self::Stopped,
            "COMPLETED" | "CD" => Self::Completed,
            "FAILED" | "F" => Self::Failed,
            "CANCELLED" | "CA" => Self::Cancelled,
            "TIMEOUT" | "TO" => Self::Timeout,
            "BOOT_FAIL" | "BF" => Self::BootFail,
            "DEADLINE" | "DL" => Self::Deadline,
            "NODE_FAIL" | "NF" => Self::NodeFail,
            "OUT_OF_MEMORY" | "OOM" => Self::OutOfMemory,
            "PREEMPTED" | "PR" => Self::Preempted,
            _ => Self::Other(s.trim().to_string()),
        })
    }
}

impl Serialize for JobState {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for JobState {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let Ok(state) = s.parse();
        Ok(state)
    }
}

/// Represents what a caller requires of a job's terminal state.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Any terminal state is accepted.
    #[default]
    Any,
    /// The job must reach `COMPLETED`; any other terminal state is an error.
    Success,
}

/// Deserializes a job identifier that may be sent as a number or a string.
fn job_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match JsonValue::deserialize(deserializer)? {
        JsonValue::String(s) => Ok(s),
        JsonValue::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected a job identifier, found `{other}`"
        ))),
    }
}

/// Represents a job created by a successful submission task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSubmission {
    /// The scheduler job identifier.
    #[serde(rename = "jobid", deserialize_with = "job_id")]
    pub job_id: String,
    /// The path of the batch script on the remote system.
    #[serde(default)]
    pub job_file: Option<String>,
    /// The path of the job's standard output on the remote system.
    #[serde(default)]
    pub job_file_out: Option<String>,
    /// The path of the job's standard error on the remote system.
    #[serde(default)]
    pub job_file_err: Option<String>,
}

/// Represents the scheduler's view of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    /// The scheduler job identifier.
    #[serde(rename = "jobid", deserialize_with = "job_id")]
    pub job_id: String,
    /// The job name.
    #[serde(default)]
    pub name: Option<String>,
    /// The job state.
    pub state: JobState,
    /// The partition the job runs in.
    #[serde(default)]
    pub partition: Option<String>,
    /// The number of nodes allocated to the job.
    #[serde(default)]
    pub nodes: Option<String>,
    /// The list of nodes allocated to the job.
    #[serde(default)]
    pub nodelist: Option<String>,
    /// The job start time.
    #[serde(default)]
    pub start_time: Option<String>,
    /// The elapsed time of the job.
    #[serde(default)]
    pub time: Option<String>,
    /// The remaining time of the job.
    #[serde(default)]
    pub time_left: Option<String>,
    /// The owner of the job.
    #[serde(default)]
    pub user: Option<String>,
    /// The path of the job's standard output, when reported.
    #[serde(default, alias = "job_file_out")]
    pub stdout_path: Option<String>,
    /// The path of the job's standard error, when reported.
    #[serde(default, alias = "job_file_err")]
    pub stderr_path: Option<String>,
}

/// Represents the job listing carried by scheduler query tasks.
///
/// The queue listing is an object keyed by position while the accounting
/// listing is an array.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum JobListing {
    /// The listing is an array of jobs.
    List(Vec<JobInfo>),
    /// The listing is an object keyed by position.
    Map(BTreeMap<String, JobInfo>),
}

impl JobListing {
    /// Converts the listing into a list of jobs.
    pub fn into_jobs(self) -> Vec<JobInfo> {
        match self {
            Self::List(jobs) => jobs,
            Self::Map(jobs) => {
                let mut jobs: Vec<_> = jobs.into_iter().collect();
                jobs.sort_by_key(|(k, _)| k.parse::<usize>().unwrap_or(usize::MAX));
                jobs.into_iter().map(|(_, job)| job).collect()
            }
        }
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    /// The states that end a job.
    const TERMINAL: &[&str] = &[
        "COMPLETED",
        "FAILED",
        "CANCELLED",
        "TIMEOUT",
        "BOOT_FAIL",
        "DEADLINE",
        "NODE_FAIL",
        "OUT_OF_MEMORY",
        "PREEMPTED",
    ];

    #[test]
    fn terminal_iff_in_terminal_set() {
        for s in TERMINAL {
            let state: JobState = s.parse().unwrap();
            assert!(state.is_terminal(), "{s}");
            assert_eq!(state.as_str(), *s);
            assert_eq!(state.is_success(), *s == "COMPLETED");
        }

        for s in [
            "PENDING",
            "RUNNING",
            "COMPLETING",
            "CONFIGURING",
            "SUSPENDED",
            "REQUEUED",
            "RESIZING",
            "STOPPED",
            "SPECIAL_EXIT",
        ] {
            let state: JobState = s.parse().unwrap();
            assert!(!state.is_terminal(), "{s}");
            assert!(!state.is_success(), "{s}");
        }
    }

    #[test]
    fn it_parses_decorated_states() {
        assert_eq!(
            "CANCELLED by 12345".parse::<JobState>().unwrap(),
            JobState::Cancelled
        );
        assert_eq!("RUNNING+".parse::<JobState>().unwrap(), JobState::Running);
        assert_eq!("cd".parse::<JobState>().unwrap(), JobState::Completed);
        assert_eq!(
            "SPECIAL_EXIT".parse::<JobState>().unwrap(),
            JobState::Other("SPECIAL_EXIT".to_string())
        );
    }

    #[test]
    fn it_parses_submissions() {
        let submission: JobSubmission = serde_json::from_value(json!({
            "jobid": 1234,
            "result": "Job submitted",
            "job_file": "/scratch/user/script.sh",
            "job_file_out": "/scratch/user/slurm-1234.out",
            "job_file_err": "/scratch/user/slurm-1234.out",
        }))
        .unwrap();

        assert_eq!(submission.job_id, "1234");
        assert_eq!(
            submission.job_file_out.as_deref(),
            Some("/scratch/user/slurm-1234.out")
        );
    }

    #[test]
    fn it_parses_both_listing_shapes() {
        let map: JobListing = serde_json::from_value(json!({
            "1": { "jobid": "2", "state": "PENDING" },
            "0": { "jobid": "1", "state": "RUNNING", "nodes": "2" },
        }))
        .unwrap();
        let jobs = map.into_jobs();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].job_id, "1");
        assert_eq!(jobs[0].state, JobState::Running);
        assert_eq!(jobs[1].state, JobState::Pending);

        let list: JobListing =
            serde_json::from_value(json!([{ "jobid": "1", "state": "COMPLETED" }])).unwrap();
        assert_eq!(list.into_jobs()[0].state, JobState::Completed);
    }
}
