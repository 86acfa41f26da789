// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Context, Result};
use crossbeam::channel;
use log::{debug, warn};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread::spawn;
use std::time::Duration;

use super::{
    check_started, output_root, CleanState, Executor, ExitWatch, OutputDir, TaskHandle,
    TaskState, TaskStatus,
};
use crate::isolation::{Decorator, Decorators};
use swan_util::*;

const KILL_WAIT: Duration = Duration::from_secs(1);

/// Runs commands through `sh -c` in a new session on this host.
#[derive(Debug, Default)]
pub struct LocalExecutor {
    decorators: Decorators,
    output_root: Option<PathBuf>,
}

impl LocalExecutor {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with_decorators(decorators: Decorators) -> Self {
        Self {
            decorators,
            output_root: None,
        }
    }

    /// Places output directories under `root` instead of the process-wide
    /// output root.
    pub fn output_root(mut self, root: PathBuf) -> Self {
        self.output_root = Some(root);
        self
    }
}

impl Executor for LocalExecutor {
    fn name(&self) -> String {
        "Local".into()
    }

    fn execute(&self, command: &str) -> Result<Box<dyn TaskHandle>> {
        let decorated = self.decorators.decorate(command);
        debug!("local: Starting {:?}", &decorated);

        let root = self.output_root.clone().unwrap_or_else(output_root);
        let out = OutputDir::create(&root, "local", command)?;

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&decorated)
            .stdin(Stdio::null())
            .stdout(out.open_stdout()?)
            .stderr(out.open_stderr()?);
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = match cmd.spawn() {
            Ok(v) => v,
            Err(e) => {
                let _ = out.erase();
                return Err(e).with_context(|| format!("failed to start {:?}", command));
            }
        };
        let pid = child.id();

        let (tx, rx) = channel::bounded::<i32>(1);
        let name = command.to_string();
        spawn(move || {
            let code = match child.wait() {
                Ok(st) => st.code().unwrap_or(-1),
                Err(e) => {
                    warn!("local: Failed to wait for {:?} ({:?})", &name, &e);
                    -1
                }
            };
            debug!("local: {:?} exited with {}", &name, code);
            let _ = tx.send(code);
        });

        let mut handle: Box<dyn TaskHandle> = Box::new(LocalTaskHandle {
            command: command.to_string(),
            pid,
            out,
            watch: ExitWatch::new(rx),
            clean_state: Default::default(),
        });
        check_started(&mut handle, "local")?;
        Ok(handle)
    }
}

pub struct LocalTaskHandle {
    command: String,
    pid: u32,
    out: OutputDir,
    watch: ExitWatch,
    clean_state: CleanState,
}

impl TaskHandle for LocalTaskHandle {
    fn name(&self) -> String {
        self.command.clone()
    }

    fn status(&mut self) -> (TaskState, Option<TaskStatus>) {
        match self.watch.poll() {
            Some(exit_code) => (
                TaskState::Terminated,
                Some(TaskStatus {
                    exit_code,
                    stdout_path: self.out.stdout_path(),
                    stderr_path: self.out.stderr_path(),
                }),
            ),
            None => (TaskState::Running, None),
        }
    }

    fn wait(&mut self, timeout: Duration) -> bool {
        self.watch.wait(timeout)
    }

    fn stop(&mut self) -> Result<()> {
        if self.watch.poll().is_some() {
            return Ok(());
        }
        debug!("local: Killing {:?} (pgid {})", &self.command, self.pid);
        signal_process_group(self.pid, libc::SIGKILL)?;
        if !self.watch.wait(KILL_WAIT) {
            bail!(
                "cannot terminate {:?} (pgid {}) within {:?}",
                &self.command,
                self.pid,
                KILL_WAIT
            );
        }
        Ok(())
    }

    fn clean(&mut self) -> Result<()> {
        let state = self.status().0;
        if self.clean_state.check_clean(&self.command, state)? {
            self.clean_state.cleaned = true;
        }
        Ok(())
    }

    fn erase_output(&mut self) -> Result<()> {
        if self.clean_state.check_erase(&self.command)? {
            self.out.erase()?;
            self.clean_state.erased = true;
        }
        Ok(())
    }

    fn stdout_path(&self) -> PathBuf {
        self.out.stdout_path()
    }

    fn stderr_path(&self) -> PathBuf {
        self.out.stderr_path()
    }

    fn address(&self) -> String {
        "127.0.0.1".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    fn executor(dir: &tempfile::TempDir) -> LocalExecutor {
        LocalExecutor::new().output_root(dir.path().to_path_buf())
    }

    #[test]
    fn test_exit_code_and_output() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut h = executor(&dir).execute("echo hello; echo oops >&2; exit 3").unwrap();
        assert!(h.wait(Duration::from_secs(0)));
        assert_eq!(h.exit_code().unwrap(), 3);
        let (state, status) = h.status();
        assert_eq!(state, TaskState::Terminated);
        let status = status.unwrap();
        assert_eq!(
            std::fs::read_to_string(&status.stdout_path).unwrap(),
            "hello\n"
        );
        assert_eq!(
            std::fs::read_to_string(&status.stderr_path).unwrap(),
            "oops\n"
        );
        assert!(status
            .stdout_path
            .parent()
            .unwrap()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("local_echo_"));
    }

    #[test]
    fn test_stop_is_idempotent_and_state_monotone() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut h = executor(&dir).execute("sleep 30").unwrap();
        assert_eq!(h.status().0, TaskState::Running);
        assert!(!h.wait(Duration::from_millis(100)));
        assert!(h.clean().is_err());

        let started = Instant::now();
        h.stop().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(h.status().0, TaskState::Terminated);
        h.stop().unwrap();
        assert_eq!(h.status().0, TaskState::Terminated);
        assert_eq!(h.exit_code().unwrap(), -1);
    }

    #[test]
    fn test_clean_then_erase() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut h = executor(&dir).execute("true").unwrap();
        assert!(h.wait(Duration::from_secs(5)));
        assert!(h.erase_output().is_err());
        h.clean().unwrap();
        let odir = h.stdout_path().parent().unwrap().to_path_buf();
        assert!(odir.exists());
        h.erase_output().unwrap();
        assert!(!odir.exists());
        h.erase_output().unwrap();
    }

    #[test]
    fn test_missing_binary_fails_to_start() {
        let dir = tempfile::TempDir::new().unwrap();
        let res = executor(&dir).execute("/nonexistent/swan-no-such-binary");
        assert!(res.is_err());
    }

    #[derive(Debug)]
    struct EnvPrefix;

    impl Decorator for EnvPrefix {
        fn decorate(&self, command: &str) -> String {
            format!("env SWAN_TEST_MARK=pinned {}", command)
        }
    }

    #[test]
    fn test_decorated_command() {
        let dir = tempfile::TempDir::new().unwrap();
        let exec = LocalExecutor::with_decorators(Decorators(vec![Arc::new(EnvPrefix)]))
            .output_root(dir.path().to_path_buf());
        let mut h = exec.execute("sh -c 'echo $SWAN_TEST_MARK'").unwrap();
        assert!(h.wait(Duration::from_secs(5)));
        assert_eq!(h.exit_code().unwrap(), 0);
        assert_eq!(
            std::fs::read_to_string(h.stdout_path()).unwrap(),
            "pinned\n"
        );
    }
}
