//! The per-pod task executor agent.

pub mod manager;
pub mod runtime;
pub mod server;
pub mod store;
pub mod task;

pub use manager::{MAX_ACTIVE_TASKS, TaskError, TaskManager};
pub use runtime::{ProcessRuntime, TaskRuntime, UnimplementedContainerRuntime};
pub use store::TaskStore;
pub use task::{Task, TaskSpec, TaskState, TaskStatus};

use std::path::PathBuf;
use std::time::Duration;

/// Default task data directory.
pub const DEFAULT_DATA_DIR: &str = "/var/lib/sandbox/tasks";
/// Default HTTP listen address.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:5758";
/// Default name of the peer container entered in sidecar mode.
pub const DEFAULT_MAIN_CONTAINER_NAME: &str = "main";
/// Default reconcile ticker interval.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_millis(500);

/// Runtime configuration for the agent daemon.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Directory holding one subdirectory per task
    pub data_dir: PathBuf,
    /// Address the HTTP API binds to
    pub listen_addr: String,
    /// Run task processes inside the main container's PID namespace
    pub enable_sidecar_mode: bool,
    /// Container located via its environment marker in sidecar mode
    pub main_container_name: String,
    /// Reconcile ticker interval
    pub reconcile_interval: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            enable_sidecar_mode: false,
            main_container_name: DEFAULT_MAIN_CONTAINER_NAME.to_string(),
            reconcile_interval: DEFAULT_RECONCILE_INTERVAL,
        }
    }
}
