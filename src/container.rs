use std::{collections::BTreeMap, fmt, path::PathBuf, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type ContainerId = String;

/// Lifecycle state of a managed container, as last written by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Created,
    Running,
    Stopped,
    Deleted,
}

impl ContainerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Deleted => "deleted",
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContainerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "deleted" => Ok(Self::Deleted),
            other => Err(format!("unknown container status: {other}")),
        }
    }
}

/// A long-lived container managed through the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    /// Assigned by the provider, never reused.
    pub id: ContainerId,
    pub name: Option<String>,
    pub image: String,
    pub status: ContainerStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateOptions {
    pub name: Option<String>,
    pub image: String,
    /// Host path -> container path.
    pub mounts: BTreeMap<PathBuf, String>,
}

/// Parameters of a one-off job as submitted by a caller. Image and command
/// may be left out, in which case they are detected from the directory contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub host_dir: String,
    #[serde(default)]
    pub container_dir: String,
    #[serde(default)]
    pub cmd: Option<Vec<String>>,
}

/// A fully resolved job: one bind mount and one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOptions {
    pub image: String,
    /// Already translated to the runtime daemon's view of the filesystem.
    pub host_dir: PathBuf,
    pub container_dir: String,
    pub cmd: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOutput {
    pub exit_code: i64,
    pub logs: String,
}

/// Exit code reported when a job exceeds its wall-clock budget.
pub const TIMEOUT_EXIT_CODE: i64 = -1;

impl JobOutput {
    pub fn timed_out() -> Self {
        Self {
            exit_code: TIMEOUT_EXIT_CODE,
            logs: "timeout".to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecOutput {
    pub exit_code: i64,
    pub logs: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// History record of one exec invocation against a running container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerTask {
    /// Time-ordered, so ids sort by creation time.
    pub id: String,
    pub container_id: ContainerId,
    pub cmd: Vec<String>,
    pub status: TaskStatus,
    pub exit_code: Option<i64>,
    pub logs: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ContainerTask {
    pub fn pending(container_id: &str, cmd: &[String]) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            container_id: container_id.to_owned(),
            cmd: cmd.to_vec(),
            status: TaskStatus::Pending,
            exit_code: None,
            logs: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }
}
