//! Durable per-task state on local disk.
//!
//! Layout is one directory per task, `{data-dir}/{name}/task.json`, shared
//! with the process runtime's pid/exit/log files. Every operation on a task
//! takes that task's mutex from a lazily-populated map; the map's own lock is
//! never held across IO. The rename of `task.json.tmp` onto `task.json` is
//! the durability boundary.

use crate::agent::task::Task;
use anyhow::{Context, Result, bail};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

const TASK_FILE: &str = "task.json";
const TASK_TMP_FILE: &str = "task.json.tmp";

/// Filesystem-backed task store.
pub struct TaskStore {
    data_dir: PathBuf,
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TaskStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            locks: StdMutex::new(HashMap::new()),
        }
    }

    /// Create the data directory if needed and return the store.
    pub async fn open(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let store = Self::new(data_dir);
        fs::create_dir_all(&store.data_dir)
            .await
            .with_context(|| format!("creating data dir {}", store.data_dir.display()))?;
        Ok(store)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Resolve the directory for `name`, refusing anything that would escape
    /// the data directory.
    pub fn task_dir(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() {
            bail!("task name must not be empty");
        }
        if name == "." || name == ".." || name.contains(['/', '\\', '\0']) {
            bail!("task name {name:?} attempts path traversal");
        }
        let joined = self.data_dir.join(name);
        if !joined.starts_with(&self.data_dir) {
            bail!("task path {} escapes the data dir", joined.display());
        }
        Ok(joined)
    }

    fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks.entry(name.to_string()).or_default().clone()
    }

    /// Persist a task: write to a temp file, fsync, rename into place.
    pub async fn save(&self, task: &Task) -> Result<()> {
        let dir = self.task_dir(&task.name)?;
        let lock = self.lock_for(&task.name);
        let _guard = lock.lock().await;

        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating task dir {}", dir.display()))?;

        let data = serde_json::to_vec_pretty(task).context("serializing task")?;
        let tmp = dir.join(TASK_TMP_FILE);
        let mut file = fs::File::create(&tmp)
            .await
            .with_context(|| format!("creating {}", tmp.display()))?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp, dir.join(TASK_FILE))
            .await
            .with_context(|| format!("committing task {}", task.name))?;
        Ok(())
    }

    /// Load one task; `None` if it was never saved.
    pub async fn load(&self, name: &str) -> Result<Option<Task>> {
        let dir = self.task_dir(name)?;
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;
        read_task(&dir.join(TASK_FILE)).await
    }

    /// Remove a task's directory; missing is not an error.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let dir = self.task_dir(name)?;
        let lock = self.lock_for(name);
        {
            let _guard = lock.lock().await;
            match fs::remove_dir_all(&dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("deleting task dir {}", dir.display()));
                }
            }
        }
        self.locks.lock().unwrap().remove(name);
        Ok(())
    }

    /// Load every persisted task, skipping entries that fail to read.
    pub async fn list(&self) -> Result<Vec<Task>> {
        let mut entries = match fs::read_dir(&self.data_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("listing data dir {}", self.data_dir.display()));
            }
        };

        let mut tasks = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let lock = self.lock_for(&name);
            let _guard = lock.lock().await;
            match read_task(&entry.path().join(TASK_FILE)).await {
                Ok(Some(task)) => tasks.push(task),
                Ok(None) => {}
                Err(e) => {
                    warn!(task = %name, error = %e, "skipping unreadable task entry");
                }
            }
        }
        tasks.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tasks)
    }
}

async fn read_task(path: &Path) -> Result<Option<Task>> {
    let raw = match fs::read(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };
    let task = serde_json::from_slice(&raw)
        .with_context(|| format!("unmarshaling {}", path.display()))?;
    Ok(Some(task))
}
