//! In-memory task registry and reconcile loop.
//!
//! The manager owns the authoritative in-memory view of every task, enforces
//! the single-active-task bound, and runs a ticker that projects desired
//! state (including soft-deletes) onto the process runtime. All mutations go
//! through one RwLock; `active` counts tasks that are neither terminal nor
//! soft-deleted.

use crate::agent::AgentConfig;
use crate::agent::runtime::{ProcessRuntime, TaskRuntime, UnimplementedContainerRuntime};
use crate::agent::store::TaskStore;
use crate::agent::task::{Task, TaskState};
use anyhow::Result;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Upper bound on tasks that may be pending or running at once.
pub const MAX_ACTIVE_TASKS: usize = 1;

/// Task operation failures, mapped onto HTTP statuses by the server.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("invalid task: {0}")]
    Invalid(String),
    #[error("task {0:?} already exists")]
    AlreadyExists(String),
    #[error(
        "active task quota exceeded: at most {MAX_ACTIVE_TASKS} task may be pending or running"
    )]
    QuotaExceeded,
    #[error("task {0:?} not found")]
    NotFound(String),
    #[error("{0:#}")]
    Internal(#[from] anyhow::Error),
}

#[derive(Default)]
struct Inner {
    tasks: HashMap<String, Task>,
    active: usize,
}

/// Task registry plus its execution backends.
pub struct TaskManager {
    store: TaskStore,
    process: ProcessRuntime,
    container: UnimplementedContainerRuntime,
    inner: RwLock<Inner>,
}

impl TaskManager {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            store: TaskStore::new(&config.data_dir),
            process: ProcessRuntime::new(
                &config.data_dir,
                config.enable_sidecar_mode,
                &config.main_container_name,
            ),
            container: UnimplementedContainerRuntime,
            inner: RwLock::new(Inner::default()),
        }
    }

    fn runtime_for(&self, task: &Task) -> &dyn TaskRuntime {
        if task.spec.process.is_some() {
            &self.process
        } else {
            &self.container
        }
    }

    /// Rebuild the in-memory view from disk after a restart.
    pub async fn recover(&self) -> Result<()> {
        let persisted = self.store.list().await?;
        let mut inner = self.inner.write().await;
        for mut task in persisted {
            match self.runtime_for(&task).inspect(&task).await {
                Ok(status) => task.status = status,
                Err(e) => {
                    warn!(task = %task.name, error = %e, "inspect failed during recovery");
                    task.status.state = TaskState::Unknown;
                }
            }
            if task.is_active() {
                inner.active += 1;
            }
            inner.tasks.insert(task.name.clone(), task);
        }
        info!(tasks = inner.tasks.len(), active = inner.active, "recovered task state");
        Ok(())
    }

    /// Create a task: persist, start, record the first observed status.
    pub async fn create(&self, task: Task) -> Result<Task, TaskError> {
        let mut inner = self.inner.write().await;
        self.create_locked(&mut inner, task).await
    }

    async fn create_locked(&self, inner: &mut Inner, mut task: Task) -> Result<Task, TaskError> {
        task.validate().map_err(TaskError::Invalid)?;
        if inner.tasks.contains_key(&task.name) {
            return Err(TaskError::AlreadyExists(task.name));
        }
        if inner.active >= MAX_ACTIVE_TASKS {
            return Err(TaskError::QuotaExceeded);
        }

        // The caller does not get to smuggle in status or a tombstone.
        task.status = Default::default();
        task.deletion_timestamp = None;

        self.store.save(&task).await.map_err(TaskError::Internal)?;

        let runtime = self.runtime_for(&task);
        if let Err(e) = runtime.start(&task).await {
            if let Err(cleanup) = self.store.delete(&task.name).await {
                warn!(task = %task.name, error = %cleanup, "rolling back stored task failed");
            }
            return Err(TaskError::Internal(
                e.context(format!("starting task {}", task.name)),
            ));
        }

        // Record the first observation so the create response already
        // carries a status.
        match runtime.inspect(&task).await {
            Ok(status) => task.status = status,
            Err(e) => warn!(task = %task.name, error = %e, "initial inspect failed"),
        }
        if let Err(e) = self.store.save(&task).await {
            warn!(task = %task.name, error = %e, "persisting initial status failed");
        }

        if task.is_active() {
            inner.active += 1;
        }
        inner.tasks.insert(task.name.clone(), task.clone());
        Ok(task)
    }

    /// Current in-memory view of one task.
    pub async fn get(&self, name: &str) -> Option<Task> {
        self.inner.read().await.tasks.get(name).cloned()
    }

    /// Current in-memory view of all tasks, name-ordered.
    pub async fn list(&self) -> Vec<Task> {
        let inner = self.inner.read().await;
        let mut tasks: Vec<Task> = inner.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.name.cmp(&b.name));
        tasks
    }

    /// Soft-delete: stamp the tombstone and let the reconcile loop stop and
    /// clean up. Missing tasks are fine.
    pub async fn delete(&self, name: &str) -> Result<(), TaskError> {
        let mut inner = self.inner.write().await;
        self.delete_locked(&mut inner, name).await;
        Ok(())
    }

    async fn delete_locked(&self, inner: &mut Inner, name: &str) {
        let Some(task) = inner.tasks.get_mut(name) else {
            return;
        };
        if task.deletion_timestamp.is_some() {
            return;
        }
        let was_active = task.is_active();
        task.deletion_timestamp = Some(Utc::now());
        let snapshot = task.clone();
        if was_active {
            inner.active -= 1;
        }
        if let Err(e) = self.store.save(&snapshot).await {
            warn!(task = %name, error = %e, "persisting soft-delete failed");
        }
    }

    /// Sync to a desired task set: soft-delete what is absent, create what
    /// is missing. Returns the resulting view plus per-task errors.
    pub async fn sync(&self, desired: Vec<Task>) -> (Vec<Task>, Vec<String>) {
        let mut errors = Vec::new();
        let mut inner = self.inner.write().await;

        let desired_names: HashSet<&str> = desired.iter().map(|t| t.name.as_str()).collect();
        let existing: Vec<String> = inner.tasks.keys().cloned().collect();
        for name in existing {
            if !desired_names.contains(name.as_str()) {
                self.delete_locked(&mut inner, &name).await;
            }
        }

        for task in desired {
            if inner.tasks.contains_key(&task.name) {
                continue;
            }
            let name = task.name.clone();
            if let Err(e) = self.create_locked(&mut inner, task).await {
                errors.push(format!("task {name:?}: {e}"));
            }
        }

        let mut tasks: Vec<Task> = inner.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.name.cmp(&b.name));
        (tasks, errors)
    }

    /// Run the reconcile ticker until cancelled.
    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("task reconcile loop stopping");
                    return;
                }
                _ = ticker.tick() => {
                    self.reconcile_once().await;
                }
            }
        }
    }

    /// One reconcile pass: refresh every task's status, finalize tombstoned
    /// terminal tasks, and stop what should not be running.
    pub async fn reconcile_once(&self) {
        let snapshot: Vec<Task> = {
            let inner = self.inner.read().await;
            inner.tasks.values().cloned().collect()
        };

        let mut to_stop: Vec<Task> = Vec::new();
        for task in snapshot {
            let status = match self.runtime_for(&task).inspect(&task).await {
                Ok(status) => status,
                Err(e) => {
                    warn!(task = %task.name, error = %e, "inspect failed");
                    continue;
                }
            };

            let mut inner = self.inner.write().await;
            let Some(current) = inner.tasks.get_mut(&task.name) else {
                continue;
            };
            let was_active = current.is_active();
            current.status = status;
            let now_active = current.is_active();
            let updated = current.clone();

            if was_active && !now_active {
                inner.active -= 1;
                if let Err(e) = self.store.save(&updated).await {
                    warn!(task = %updated.name, error = %e, "persisting terminal status failed");
                }
            }

            if updated.deletion_timestamp.is_some() {
                if updated.is_terminal() {
                    // Terminal and tombstoned: nothing left to stop.
                    if let Err(e) = self.store.delete(&updated.name).await {
                        warn!(task = %updated.name, error = %e, "finalizing task failed");
                        continue;
                    }
                    inner.tasks.remove(&updated.name);
                    debug!(task = %updated.name, "finalized deleted task");
                } else {
                    to_stop.push(updated);
                }
            } else if updated.status.state == TaskState::Timeout {
                to_stop.push(updated);
            }
        }

        for task in to_stop {
            if let Err(e) = self.runtime_for(&task).stop(&task).await {
                warn!(task = %task.name, error = %e, "stopping task failed");
            }
        }
    }

    /// Number of tasks currently counted against the active bound.
    pub async fn active_tasks(&self) -> usize {
        self.inner.read().await.active
    }
}
