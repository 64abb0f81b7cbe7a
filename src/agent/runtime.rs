//! Process execution for tasks.
//!
//! Every task runs as a shim-wrapped shell process in its own process group.
//! The shim forwards termination signals to the child, waits for it, and
//! writes the exit code to an `exit` file before returning; the presence of
//! that file is what `inspect` treats as terminal. Status is derived purely
//! from the filesystem, so it survives agent restarts.
//!
//! In sidecar mode the shim is launched through `nsenter` into the PID
//! namespace of the pod's main container, located by scanning
//! `/proc/*/environ` for its `CONTAINER_NAME` marker.

use crate::agent::task::{
    REASON_PROCESS_CRASHED, REASON_TASK_TIMEOUT, SYNTHETIC_EXIT_CODE, SubStatus, Task, TaskState,
    TaskStatus,
};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tokio::time::{Duration, sleep};
use tracing::{debug, warn};

const PID_FILE: &str = "pid";
const EXIT_FILE: &str = "exit";
const STDOUT_LOG: &str = "stdout.log";
const STDERR_LOG: &str = "stderr.log";

/// How long a stopped task gets to exit after SIGTERM before SIGKILL.
const STOP_GRACE: Duration = Duration::from_secs(10);
const STOP_POLL: Duration = Duration::from_millis(200);

/// Execution backend for tasks.
#[async_trait]
pub trait TaskRuntime: Send + Sync {
    /// Launch the task's workload.
    async fn start(&self, task: &Task) -> Result<()>;

    /// Derive the task's current status from observable state.
    async fn inspect(&self, task: &Task) -> Result<TaskStatus>;

    /// Request shutdown of the task's workload, escalating if ignored.
    async fn stop(&self, task: &Task) -> Result<()>;
}

/// Runs tasks as host processes, optionally entering a peer container's PID
/// namespace.
pub struct ProcessRuntime {
    data_dir: PathBuf,
    sidecar_mode: bool,
    main_container_name: String,
}

impl ProcessRuntime {
    pub fn new(data_dir: impl Into<PathBuf>, sidecar_mode: bool, main_container_name: &str) -> Self {
        Self {
            data_dir: data_dir.into(),
            sidecar_mode,
            main_container_name: main_container_name.to_string(),
        }
    }

    fn task_dir(&self, task: &Task) -> PathBuf {
        self.data_dir.join(&task.name)
    }

    /// Find the main container's init process by its environment marker.
    fn find_main_container_pid(&self) -> Result<i32> {
        let marker = format!("CONTAINER_NAME={}", self.main_container_name);
        let mut pids: Vec<i32> = std::fs::read_dir("/proc")
            .context("reading /proc")?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str().and_then(|n| n.parse().ok()))
            .collect();
        pids.sort_unstable();

        for pid in pids {
            let Ok(environ) = std::fs::read(format!("/proc/{pid}/environ")) else {
                continue;
            };
            let found = environ
                .split(|b| *b == 0)
                .any(|entry| entry == marker.as_bytes());
            if found {
                return Ok(pid);
            }
        }
        bail!(
            "no process with {marker} found; is the main container named {:?}?",
            self.main_container_name
        );
    }
}

#[async_trait]
impl TaskRuntime for ProcessRuntime {
    async fn start(&self, task: &Task) -> Result<()> {
        let Some(process) = &task.spec.process else {
            bail!("task {} has no process spec", task.name);
        };
        if process.command.is_empty() {
            bail!("task {} has an empty command", task.name);
        }

        let dir = self.task_dir(task);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating task dir {}", dir.display()))?;

        let stdout = append_log(&dir.join(STDOUT_LOG))?;
        let stderr = append_log(&dir.join(STDERR_LOG))?;

        let command_line: Vec<String> = process
            .command
            .iter()
            .chain(process.args.iter())
            .map(|part| shell_quote(part))
            .collect();
        let shim = shim_script(&command_line.join(" "), &dir.join(EXIT_FILE));

        let mut cmd = if self.sidecar_mode {
            let target = self.find_main_container_pid()?;
            let mut cmd = Command::new("nsenter");
            cmd.arg("-t")
                .arg(target.to_string())
                .arg("-p")
                .arg("--")
                .arg("/bin/sh")
                .arg("-c")
                .arg(&shim);
            cmd
        } else {
            let mut cmd = Command::new("/bin/sh");
            cmd.arg("-c").arg(&shim);
            cmd
        };

        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .process_group(0);
        if !process.working_dir.is_empty() {
            cmd.current_dir(&process.working_dir);
        }
        for env in &process.env {
            cmd.env(&env.name, &env.value);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning task {}", task.name))?;
        let pid = child
            .id()
            .with_context(|| format!("task {} exited before its pid was recorded", task.name))?;

        tokio::fs::write(dir.join(PID_FILE), pid.to_string())
            .await
            .with_context(|| format!("writing pid file for task {}", task.name))?;

        // Reap the child when it exits; status comes from the files, not the
        // Child handle.
        let name = task.name.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!(task = %name, %status, "shim exited"),
                Err(e) => warn!(task = %name, error = %e, "waiting on shim failed"),
            }
        });

        Ok(())
    }

    async fn inspect(&self, task: &Task) -> Result<TaskStatus> {
        let dir = self.task_dir(task);
        let pid_path = dir.join(PID_FILE);
        let exit_path = dir.join(EXIT_FILE);

        if exit_path.exists() {
            let raw = std::fs::read_to_string(&exit_path)
                .with_context(|| format!("reading exit file for task {}", task.name))?;
            let started_at = mtime(&pid_path);
            let finished_at = mtime(&exit_path);
            return Ok(match raw.trim().parse::<i32>() {
                Ok(0) => terminal_status(TaskState::Succeeded, started_at, finished_at, 0, "", ""),
                Ok(code) => terminal_status(
                    TaskState::Failed,
                    started_at,
                    finished_at,
                    code,
                    "Error",
                    &format!("process exited with code {code}"),
                ),
                Err(_) => terminal_status(
                    TaskState::Unknown,
                    started_at,
                    finished_at,
                    SYNTHETIC_EXIT_CODE,
                    "MalformedExitFile",
                    &format!("unparseable exit file contents {:?}", raw.trim()),
                ),
            });
        }

        if pid_path.exists() {
            let raw = std::fs::read_to_string(&pid_path)
                .with_context(|| format!("reading pid file for task {}", task.name))?;
            let pid: i32 = raw
                .trim()
                .parse()
                .with_context(|| format!("unparseable pid file for task {}", task.name))?;
            let started_at = mtime(&pid_path);

            if pid_alive(pid) {
                let timeout = task.spec.process.as_ref().and_then(|p| p.timeout_seconds);
                if let (Some(timeout), Some(started)) = (timeout, started_at) {
                    let elapsed = Utc::now().signed_duration_since(started);
                    if elapsed.num_seconds() >= 0 && elapsed.num_seconds() as u64 > timeout {
                        return Ok(terminal_status(
                            TaskState::Timeout,
                            started_at,
                            None,
                            SYNTHETIC_EXIT_CODE,
                            REASON_TASK_TIMEOUT,
                            &format!("task exceeded its {timeout}s timeout"),
                        ));
                    }
                }
                return Ok(TaskStatus {
                    state: TaskState::Running,
                    sub_statuses: vec![SubStatus {
                        started_at,
                        ..Default::default()
                    }],
                });
            }

            // A pid file without an exit file and without a live process
            // means the shim died before committing an exit code.
            return Ok(terminal_status(
                TaskState::Failed,
                started_at,
                None,
                SYNTHETIC_EXIT_CODE,
                REASON_PROCESS_CRASHED,
                "process disappeared without writing an exit code",
            ));
        }

        Ok(TaskStatus {
            state: TaskState::Pending,
            sub_statuses: Vec::new(),
        })
    }

    async fn stop(&self, task: &Task) -> Result<()> {
        let dir = self.task_dir(task);
        let raw = match std::fs::read_to_string(dir.join(PID_FILE)) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e).with_context(|| format!("reading pid for task {}", task.name)),
        };
        let recorded: i32 = raw
            .trim()
            .parse()
            .with_context(|| format!("unparseable pid file for task {}", task.name))?;

        // In sidecar mode the recorded pid is nsenter; the shim is its only
        // child. Fall back to the whole process group when resolution fails.
        let target = if self.sidecar_mode {
            shim_pid_of(recorded).unwrap_or(-recorded)
        } else {
            recorded
        };

        debug!(task = %task.name, target, "sending SIGTERM");
        signal(target, libc::SIGTERM);

        let deadline = tokio::time::Instant::now() + STOP_GRACE;
        while tokio::time::Instant::now() < deadline {
            if !pid_alive(target) {
                return Ok(());
            }
            sleep(STOP_POLL).await;
        }

        warn!(task = %task.name, target, "SIGTERM ignored, escalating to SIGKILL");
        signal(target, libc::SIGKILL);
        signal(-recorded, libc::SIGKILL);
        Ok(())
    }
}

/// Placeholder container backend: every operation fails the same way.
pub struct UnimplementedContainerRuntime;

const CONTAINER_UNIMPLEMENTED: &str = "container runtime is not implemented";

#[async_trait]
impl TaskRuntime for UnimplementedContainerRuntime {
    async fn start(&self, _task: &Task) -> Result<()> {
        bail!(CONTAINER_UNIMPLEMENTED);
    }

    async fn inspect(&self, _task: &Task) -> Result<TaskStatus> {
        bail!(CONTAINER_UNIMPLEMENTED);
    }

    async fn stop(&self, _task: &Task) -> Result<()> {
        bail!(CONTAINER_UNIMPLEMENTED);
    }
}

/// The shim: forward termination signals, wait for the child, commit the
/// exit code to disk, exit with the same code.
fn shim_script(command_line: &str, exit_path: &Path) -> String {
    let exit_file = shell_quote(&exit_path.to_string_lossy());
    format!(
        r#"child=
_forward() {{
    [ -n "$child" ] && kill -TERM "$child" 2>/dev/null
}}
trap _forward TERM INT
{command_line} &
child=$!
wait "$child"
code=$?
if [ "$code" -gt 128 ] && kill -0 "$child" 2>/dev/null; then
    wait "$child"
    code=$?
fi
echo "$code" > {exit_file}
exit "$code"
"#
    )
}

fn terminal_status(
    state: TaskState,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    exit_code: i32,
    reason: &str,
    message: &str,
) -> TaskStatus {
    TaskStatus {
        state,
        sub_statuses: vec![SubStatus {
            started_at,
            finished_at,
            exit_code,
            reason: reason.to_string(),
            message: message.to_string(),
        }],
    }
}

/// Single-quote a string for /bin/sh.
fn shell_quote(part: &str) -> String {
    format!("'{}'", part.replace('\'', r"'\''"))
}

fn append_log(path: &Path) -> Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening log file {}", path.display()))
}

fn mtime(path: &Path) -> Option<DateTime<Utc>> {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::<Utc>::from)
}

/// Liveness probe; negative pids probe the process group.
fn pid_alive(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

fn signal(pid: i32, sig: i32) {
    unsafe {
        libc::kill(pid, sig);
    }
}

/// First child of `pid`, from the procfs children list.
fn shim_pid_of(pid: i32) -> Option<i32> {
    let children = std::fs::read_to_string(format!("/proc/{pid}/task/{pid}/children")).ok()?;
    children.split_whitespace().next()?.parse().ok()
}
