//! Task wire types for the executor agent.
//!
//! The same JSON shape travels over the HTTP API and into the on-disk
//! `task.json`, so clients and the store stay symmetric.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Exit code synthesized for crashed and timed-out tasks.
pub const SYNTHETIC_EXIT_CODE: i32 = 137;

/// Status reason for a process that disappeared without an exit file.
pub const REASON_PROCESS_CRASHED: &str = "ProcessCrashed";
/// Status reason for a task that outlived its timeout.
pub const REASON_TASK_TIMEOUT: &str = "TaskTimeout";

/// A short-lived unit of work executed by the agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Unique name within this agent
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub spec: TaskSpec,
    #[serde(default)]
    pub status: TaskStatus,
    /// Set on soft-delete; the reconcile loop drives stop and cleanup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

/// What to run: a host process or (unimplemented) a container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<ProcessSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerSpec>,
}

/// A process invocation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSpec {
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub working_dir: String,
    /// Seconds of runtime after which the task is reported as timed out
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

/// A container invocation. Accepted on the wire; the runtime rejects it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    #[serde(default)]
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
}

/// Simple environment variable
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

/// Observed task state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Timeout,
    Unknown,
}

impl TaskState {
    /// Terminal states: the process will never run again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed | TaskState::Timeout)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    #[serde(default)]
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_statuses: Vec<SubStatus>,
}

/// One observation of the underlying process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

impl Task {
    /// Whether this task counts against the active-task bound.
    pub fn is_active(&self) -> bool {
        self.deletion_timestamp.is_none()
            && matches!(self.status.state, TaskState::Pending | TaskState::Running)
    }

    /// Whether this task has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.state.is_terminal()
    }

    /// Validate the parts of a task the agent refuses outright.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("task name must not be empty".to_string());
        }
        if self.name.contains(['/', '\\', '\0']) || self.name == "." || self.name == ".." {
            return Err(format!("task name {:?} is not a valid directory name", self.name));
        }
        match (&self.spec.process, &self.spec.container) {
            (Some(process), None) => {
                if process.command.is_empty() {
                    return Err("process command must not be empty".to_string());
                }
                Ok(())
            }
            (None, Some(_)) => Ok(()),
            (Some(_), Some(_)) => Err("task spec must not set both process and container".to_string()),
            (None, None) => Err("task spec must set either process or container".to_string()),
        }
    }
}
