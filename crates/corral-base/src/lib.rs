//! Core types for corral: job identities, job status, and engine
//! configuration. These are used by every binary in the workspace.

pub mod proto;

use derive_more::{Display, From, FromStr, Into};
use serde::{Deserialize, Serialize};
use strum::EnumIter;

/// Name of the uploaded payload file inside a job's directory.
pub const INPUT_ARTIFACT: &str = "input";

/// Name of the success artifact inside a job's directory.
pub const RESULT_ARTIFACT: &str = "result";

/// Name of the failure artifact inside a job's directory.
pub const ERROR_ARTIFACT: &str = "error";

/// Identity of a single job. Assigned by the job store at creation time and
/// monotonically increasing. The decimal form of this id is the only payload
/// carried on the queue.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Display,
    Eq,
    From,
    FromStr,
    Hash,
    Into,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[serde(transparent)]
pub struct JobId(pub i64);

/// Lifecycle state of a job. Transitions are monotone along exactly one of
/// two chains: Received → Running → Success, or Received → Running → Fail.
#[derive(Clone, Copy, Debug, EnumIter, Eq, PartialEq, strum::Display, strum::EnumString)]
pub enum JobStatus {
    Received,
    Running,
    Fail,
    Success,
}

impl JobStatus {
    /// The form stored in the job index and used as the key in the monitor's
    /// engine×status matrix.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            JobStatus::Received => "RECEIVED",
            JobStatus::Running => "RUNNING",
            JobStatus::Fail => "FAIL",
            JobStatus::Success => "SUCCESS",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "RECEIVED" => Some(JobStatus::Received),
            "RUNNING" => Some(JobStatus::Running),
            "FAIL" => Some(JobStatus::Fail),
            "SUCCESS" => Some(JobStatus::Success),
            _ => None,
        }
    }

    /// True for Success and Fail, the two states no transition leaves.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Fail)
    }
}

/// Static description of one processing engine. Loaded once from the engines
/// configuration document and frozen for the life of the process.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Engine name. Also the name of the engine's queue.
    pub name: String,

    /// How many worker processes the supervisor launches for this engine.
    pub workers: u32,

    /// Container image the sandbox is created from.
    pub image: String,

    /// Shell command run inside the image.
    pub cmd: String,

    /// Where the job volume is mounted inside the container.
    pub mountpoint: String,

    /// Name of the input file as seen by the command inside the container.
    pub input_filename: String,

    /// Per-job wall-clock budget in seconds. Zero disables the timeout.
    #[serde(default)]
    pub timeout: u64,

    /// Byte ceiling on a single upload for this engine.
    pub size_limit: u64,

    /// Numeric uid the container command runs as.
    #[serde(default)]
    pub user: u32,

    /// Extra flags passed verbatim to the sandbox runtime's create call.
    #[serde(default)]
    pub run_flags: Vec<String>,
}

/// The top-level shape of the engines configuration document.
#[derive(Debug, Deserialize)]
pub struct EngineConfigFile {
    pub engines: Vec<EngineConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_status_round_trips_through_db_form() {
        for status in [
            JobStatus::Received,
            JobStatus::Running,
            JobStatus::Fail,
            JobStatus::Success,
        ] {
            assert_eq!(JobStatus::from_db_str(status.as_db_str()), Some(status));
        }
        assert_eq!(JobStatus::from_db_str("BOGUS"), None);
    }

    #[test]
    fn job_status_display_is_title_case() {
        assert_eq!(JobStatus::Received.to_string(), "Received");
        assert_eq!(JobStatus::Fail.to_string(), "Fail");
    }

    #[test]
    fn only_success_and_fail_are_terminal() {
        assert!(!JobStatus::Received.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Fail.is_terminal());
        assert!(JobStatus::Success.is_terminal());
    }

    #[test]
    fn engine_config_fills_defaults() {
        let engine: EngineConfig = serde_json::from_str(
            r#"{
                "name": "md5",
                "workers": 2,
                "image": "corral/md5",
                "cmd": "md5sum input > result",
                "mountpoint": "/jobs",
                "input_filename": "input",
                "size_limit": 1048576
            }"#,
        )
        .unwrap();
        assert_eq!(engine.timeout, 0);
        assert_eq!(engine.user, 0);
        assert!(engine.run_flags.is_empty());
    }
}
