// Copyright (c) Facebook, Inc. and its affiliates.
//! Task execution in local shell, over SSH and in Kubernetes pods.
//!
//! `Executor::execute()` starts a command and returns a `TaskHandle` as
//! soon as the command is running. All backends report termination by
//! sending the exit code over a channel from a watcher thread, which
//! `ExitWatch` turns into the non-blocking `status()` and the bounded
//! `wait()` of the handle contract.
use anyhow::{bail, Context, Result};
use crossbeam::channel::{self, select, Receiver};
use log::{error, warn};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::isolation::Decorators;
use swan_util::conf::{self, Flag};
use swan_util::*;

pub mod cluster;
pub mod kubernetes;
pub mod liveness;
pub mod local;
pub mod remote;
pub mod service;

#[cfg(test)]
pub(crate) mod mock;

pub use cluster::ClusterTaskHandle;
pub use kubernetes::{KubernetesConfig, KubernetesExecutor};
pub use liveness::is_listening;
pub use local::LocalExecutor;
pub use remote::{RemoteExecutor, SshConfig};
pub use service::ServiceHandle;

/// How long an indefinite `wait()` keeps waiting once the program has
/// been asked to exit.
pub const EXIT_GRACE: Duration = Duration::from_secs(10);
const WAIT_SLICE: Duration = Duration::from_millis(250);

lazy_static::lazy_static! {
    pub static ref OUTPUT_LINES_COUNT: Flag<i64> = conf::int_flag(
        "output_lines_count",
        "Number of lines printed from stderr & stdout in case of task unsucessful termination",
        5,
    );
    pub static ref RUN_ON_KUBERNETES: Flag<bool> = conf::bool_flag(
        "run_on_kubernetes",
        "Launch HP and BE tasks as pods on an existing Kubernetes cluster",
        false,
    );
    static ref OUTPUT_ROOT: RwLock<Option<PathBuf>> = RwLock::new(None);
}

pub fn register_flags() {
    lazy_static::initialize(&OUTPUT_LINES_COUNT);
    lazy_static::initialize(&RUN_ON_KUBERNETES);
    kubernetes::register_flags();
    remote::register_flags();
}

/// Directory under which task output directories are created. Defaults
/// to the current directory.
pub fn set_output_root<P: AsRef<Path>>(path: P) {
    *OUTPUT_ROOT.write().unwrap() = Some(path.as_ref().to_path_buf());
}

pub fn output_root() -> PathBuf {
    match OUTPUT_ROOT.read().unwrap().as_ref() {
        Some(v) => v.clone(),
        None => PathBuf::from("."),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Terminated,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TaskStatus {
    pub exit_code: i32,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
}

pub trait TaskHandle: Send {
    /// Command as requested by the caller.
    fn name(&self) -> String;

    /// Non-blocking snapshot. The status record is present iff terminated.
    fn status(&mut self) -> (TaskState, Option<TaskStatus>);

    /// Blocks up to `timeout`, zero meaning forever. Returns whether the
    /// task terminated.
    fn wait(&mut self, timeout: Duration) -> bool;

    /// Kills the task and waits for it. Succeeds on terminated tasks.
    fn stop(&mut self) -> Result<()>;

    /// Releases output streams. The task must be terminated.
    fn clean(&mut self) -> Result<()>;

    /// Removes the output files. `clean()` must have been called.
    fn erase_output(&mut self) -> Result<()>;

    fn stdout_path(&self) -> PathBuf;
    fn stderr_path(&self) -> PathBuf;

    /// Host the task runs on.
    fn address(&self) -> String;

    fn exit_code(&mut self) -> Result<i32> {
        match self.status() {
            (TaskState::Terminated, Some(st)) => Ok(st.exit_code),
            _ => bail!("task {:?} is still running", self.name()),
        }
    }

    fn is_running(&mut self) -> bool {
        self.status().0 == TaskState::Running
    }
}

pub trait Executor: Send + Sync {
    fn name(&self) -> String;
    fn execute(&self, command: &str) -> Result<Box<dyn TaskHandle>>;
}

pub type ExecutorRef = Arc<dyn Executor>;

/// Exit code delivered by a watcher thread.
#[derive(Debug)]
pub struct ExitWatch {
    rx: Receiver<i32>,
    code: Option<i32>,
}

impl ExitWatch {
    pub fn new(rx: Receiver<i32>) -> Self {
        Self { rx, code: None }
    }

    fn on_recv(&mut self, res: std::result::Result<i32, channel::RecvError>) -> i32 {
        // A watcher which went away without a report counts as killed.
        let code = res.unwrap_or(-1);
        self.code = Some(code);
        code
    }

    pub fn poll(&mut self) -> Option<i32> {
        if self.code.is_none() {
            match self.rx.try_recv() {
                Ok(code) => self.code = Some(code),
                Err(channel::TryRecvError::Disconnected) => self.code = Some(-1),
                Err(channel::TryRecvError::Empty) => {}
            }
        }
        self.code
    }

    pub fn wait(&mut self, timeout: Duration) -> bool {
        if self.poll().is_some() {
            return true;
        }
        let deadline = match timeout.as_nanos() {
            0 => None,
            _ => Some(Instant::now() + timeout),
        };
        let mut drain_deadline: Option<Instant> = None;
        loop {
            let mut slice = WAIT_SLICE;
            if let Some(at) = deadline {
                let now = Instant::now();
                if now >= at {
                    return false;
                }
                slice = slice.min(at - now);
            }
            let res = select! {
                recv(self.rx) -> res => Some(res),
                recv(channel::after(slice)) -> _ => None,
            };
            if let Some(res) = res {
                self.on_recv(res);
                return true;
            }
            if deadline.is_none() && prog_exiting() {
                let at = *drain_deadline.get_or_insert_with(|| Instant::now() + EXIT_GRACE);
                if Instant::now() >= at {
                    warn!("executor: Giving up waiting, program is exiting");
                    return false;
                }
            }
        }
    }
}

/// Per task directory holding the `stdout` and `stderr` files.
#[derive(Clone, Debug, PartialEq)]
pub struct OutputDir {
    pub dir: PathBuf,
}

/// Basename of the first word of `command`.
pub fn binary_name(command: &str) -> Result<String> {
    let first = match command.split_whitespace().next() {
        Some(v) => v,
        None => bail!("empty command string"),
    };
    Ok(Path::new(first)
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| first.to_string()))
}

impl OutputDir {
    /// Creates `<root>/<prefix>_<binary>_XXXXXX` with empty output files.
    pub fn create(root: &Path, prefix: &str, command: &str) -> Result<Self> {
        let name = binary_name(command)?;
        fs::create_dir_all(root)
            .with_context(|| format!("failed to create output root {:?}", root))?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("{}_{}_", prefix, &name))
            .tempdir_in(root)
            .with_context(|| format!("failed to create output directory for {:?}", &name))?
            .into_path();
        let odir = Self { dir };
        let res = fs::set_permissions(&odir.dir, fs::Permissions::from_mode(0o755))
            .map_err(anyhow::Error::from)
            .and_then(|_| odir.create_files());
        if let Err(e) = res {
            let _ = fs::remove_dir_all(&odir.dir);
            return Err(e.context(format!("failed to set up {:?}", &odir.dir)));
        }
        Ok(odir)
    }

    fn create_files(&self) -> Result<()> {
        for path in &[self.stdout_path(), self.stderr_path()] {
            fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)?;
        }
        Ok(())
    }

    pub fn stdout_path(&self) -> PathBuf {
        self.dir.join("stdout")
    }

    pub fn stderr_path(&self) -> PathBuf {
        self.dir.join("stderr")
    }

    pub fn open_stdout(&self) -> Result<fs::File> {
        Ok(fs::OpenOptions::new()
            .append(true)
            .open(self.stdout_path())?)
    }

    pub fn open_stderr(&self) -> Result<fs::File> {
        Ok(fs::OpenOptions::new()
            .append(true)
            .open(self.stderr_path())?)
    }

    pub fn erase(&self) -> Result<()> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to remove {:?}", &self.dir)),
        }
    }
}

/// Tracks the clean / erase ordering of a handle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CleanState {
    pub cleaned: bool,
    pub erased: bool,
}

impl CleanState {
    pub fn check_clean(&self, name: &str, state: TaskState) -> Result<bool> {
        if state != TaskState::Terminated {
            bail!("cannot clean running task {:?}", name);
        }
        Ok(!self.cleaned)
    }

    pub fn check_erase(&self, name: &str) -> Result<bool> {
        if !self.cleaned {
            bail!("cannot erase output of {:?} before clean", name);
        }
        Ok(!self.erased)
    }
}

/// Logs the tails of a task's output files.
pub fn log_output(handle: &dyn TaskHandle) {
    let nr = OUTPUT_LINES_COUNT.value().max(0) as usize;
    for (what, path) in &[("stdout", handle.stdout_path()), ("stderr", handle.stderr_path())] {
        match read_last_lines(path, nr) {
            Ok(lines) => {
                if lines.is_empty() {
                    error!("{:?} on {}: {} is empty", handle.name(), handle.address(), what);
                    continue;
                }
                error!(
                    "{:?} on {}: last {} lines of {}:\n{}",
                    handle.name(),
                    handle.address(),
                    lines.len(),
                    what,
                    lines.join("\n")
                );
            }
            Err(e) => warn!("cannot read {} of {:?} ({:#})", what, handle.name(), &e),
        }
    }
}

/// Common post-start check of the local and SSH executors. A task which
/// exits with 127 within the first 100ms could not find its binary.
pub fn check_started(handle: &mut Box<dyn TaskHandle>, executor: &str) -> Result<()> {
    if !handle.wait(Duration::from_millis(100)) {
        return Ok(());
    }
    let code = handle.exit_code()?;
    if code == 127 {
        log_output(handle.as_ref());
        let _ = handle.clean();
        bail!(
            "{}: failed to start {:?}, command not found (exit code 127)",
            executor,
            handle.name()
        );
    }
    if code != 0 {
        log_output(handle.as_ref());
    }
    Ok(())
}

/// Stops, cleans and erases the handle, collecting all errors.
pub fn stop_clean_erase(handle: &mut dyn TaskHandle) -> Result<()> {
    let mut errs = crate::error::ErrorCollection::default();
    errs.add_result(handle.stop());
    errs.add_result(handle.clean());
    errs.add_result(handle.erase_output());
    errs.into_result()
}

/// Builds the executors for the high priority and best effort workloads.
pub trait ExecutorFactory: Send + Sync {
    fn high_priority(&self, decorators: Decorators) -> Result<ExecutorRef>;
    fn best_effort(&self, decorators: Decorators) -> Result<ExecutorRef>;
}

pub struct LocalExecutorFactory {}

impl ExecutorFactory for LocalExecutorFactory {
    fn high_priority(&self, decorators: Decorators) -> Result<ExecutorRef> {
        Ok(Arc::new(LocalExecutor::with_decorators(decorators)))
    }

    fn best_effort(&self, decorators: Decorators) -> Result<ExecutorRef> {
        Ok(Arc::new(LocalExecutor::with_decorators(decorators)))
    }
}

pub struct KubernetesExecutorFactory {}

impl ExecutorFactory for KubernetesExecutorFactory {
    fn high_priority(&self, decorators: Decorators) -> Result<ExecutorRef> {
        Ok(Arc::new(KubernetesExecutor::new(
            KubernetesConfig::high_priority_from_flags(decorators),
        )?))
    }

    fn best_effort(&self, decorators: Decorators) -> Result<ExecutorRef> {
        Ok(Arc::new(KubernetesExecutor::new(
            KubernetesConfig::best_effort_from_flags(decorators),
        )?))
    }
}

pub fn executor_factory() -> Box<dyn ExecutorFactory> {
    if RUN_ON_KUBERNETES.value() {
        Box::new(KubernetesExecutorFactory {})
    } else {
        Box::new(LocalExecutorFactory {})
    }
}
