// Copyright (c) Facebook, Inc. and its affiliates.
//! Executor running commands on another host through the `ssh` client.
//! Connections share one control socket per host. The remote shell
//! reports its pid on the first output line so that `stop()` can kill
//! the remote process group without the original channel.
use anyhow::{anyhow, bail, Context, Result};
use crossbeam::channel;
use log::{debug, warn};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread::{spawn, JoinHandle};
use std::time::Duration;

use super::{
    check_started, output_root, CleanState, Executor, ExitWatch, OutputDir, TaskHandle,
    TaskState, TaskStatus,
};
use crate::isolation::{Decorator, Decorators};
use swan_util::conf::{self, Flag};
use swan_util::*;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const KILL_WAIT: Duration = Duration::from_secs(1);

lazy_static::lazy_static! {
    static ref SSH_LOGIN: Flag<String> = conf::string_flag(
        "remote_ssh_login",
        "Login used for connecting to remote nodes",
        &std::env::var("USER").unwrap_or_else(|_| "root".into()),
    );
    static ref SSH_KEY_PATH: Flag<String> = conf::file_flag(
        "remote_ssh_key_path",
        "Key for user in from flag remote_ssh_login used for connecting to remote nodes",
        &format!(
            "{}/.ssh/id_rsa",
            std::env::var("HOME").unwrap_or_else(|_| "/root".into())
        ),
    );
    static ref SSH_PORT: Flag<i64> = conf::int_flag(
        "remote_ssh_port",
        "Port used for SSH connection to remote nodes",
        22,
    );
}

pub fn register_flags() {
    lazy_static::initialize(&SSH_LOGIN);
    lazy_static::initialize(&SSH_KEY_PATH);
    lazy_static::initialize(&SSH_PORT);
}

#[derive(Clone, Debug, PartialEq)]
pub struct SshConfig {
    pub host: String,
    pub user: String,
    pub port: u16,
    pub key_path: String,
}

impl SshConfig {
    pub fn from_flags(host: &str) -> Result<Self> {
        let port = SSH_PORT.value();
        if port <= 0 || port > u16::MAX as i64 {
            bail!("invalid SSH port {}", port);
        }
        Ok(Self {
            host: host.to_string(),
            user: SSH_LOGIN.value(),
            port: port as u16,
            key_path: SSH_KEY_PATH.value(),
        })
    }

    /// `ssh` invocation up to and including the destination.
    pub fn ssh_args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-o".into(),
            "BatchMode=yes".into(),
            "-o".into(),
            "StrictHostKeyChecking=no".into(),
            "-o".into(),
            format!("ConnectTimeout={}", CONNECT_TIMEOUT.as_secs()),
            "-o".into(),
            "ControlMaster=auto".into(),
            "-o".into(),
            "ControlPath=/tmp/swan-ssh-%r@%h:%p".into(),
            "-o".into(),
            "ControlPersist=60".into(),
            "-p".into(),
            self.port.to_string(),
        ];
        if !self.key_path.is_empty() {
            args.push("-i".into());
            args.push(self.key_path.clone());
        }
        args.push(format!("{}@{}", &self.user, &self.host));
        args
    }

    fn command(&self, remote_cmd: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(&self.ssh_args()).arg(remote_cmd);
        cmd
    }
}

/// Remote side of `execute()`: print the shell pid, then replace the
/// shell with the command.
pub fn remote_command(decorated: &str) -> String {
    format!("echo $$; exec sh -c {}", shell_quote(decorated))
}

pub struct RemoteExecutor {
    config: SshConfig,
    decorators: Decorators,
    output_root: Option<PathBuf>,
}

impl RemoteExecutor {
    pub fn new(config: SshConfig, decorators: Decorators) -> Self {
        Self {
            config,
            decorators,
            output_root: None,
        }
    }

    pub fn output_root(mut self, root: PathBuf) -> Self {
        self.output_root = Some(root);
        self
    }
}

impl Executor for RemoteExecutor {
    fn name(&self) -> String {
        format!("Remote({})", &self.config.host)
    }

    fn execute(&self, command: &str) -> Result<Box<dyn TaskHandle>> {
        let decorated = self.decorators.decorate(command);
        debug!("remote: Starting {:?} on {}", &decorated, &self.config.host);

        let root = self.output_root.clone().unwrap_or_else(output_root);
        let out = OutputDir::create(&root, "remote", command)?;
        let mut stdout_file = out.open_stdout()?;

        let mut cmd = self.config.command(&remote_command(&decorated));
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
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
                return Err(e).with_context(|| format!("failed to run ssh to {}", &self.config.host));
            }
        };
        let local_pid = child.id();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("ssh stdout not captured"))?;

        let (pid_tx, pid_rx) = channel::bounded::<u32>(1);
        let reader_name = command.to_string();
        let reader = spawn(move || {
            let mut lines = BufReader::new(stdout).lines();
            match lines.next() {
                Some(Ok(line)) => match line.trim().parse::<u32>() {
                    Ok(pid) => {
                        let _ = pid_tx.send(pid);
                    }
                    Err(_) => warn!("remote: Unexpected first line {:?} for {:?}", &line, &reader_name),
                },
                _ => return,
            }
            for line in lines {
                match line {
                    Ok(line) => {
                        if let Err(e) = writeln!(stdout_file, "{}", line) {
                            warn!("remote: Failed to write output of {:?} ({:?})", &reader_name, &e);
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            let _ = stdout_file.flush();
        });

        let (tx, rx) = channel::bounded::<i32>(1);
        let waiter_name = command.to_string();
        spawn(move || {
            let code = match child.wait() {
                Ok(st) => st.code().unwrap_or(-1),
                Err(e) => {
                    warn!("remote: Failed to wait for ssh of {:?} ({:?})", &waiter_name, &e);
                    -1
                }
            };
            let _ = tx.send(code);
        });

        let mut watch = ExitWatch::new(rx);
        let remote_pid = match pid_rx.recv_timeout(CONNECT_TIMEOUT) {
            Ok(pid) => pid,
            Err(_) => {
                let _ = signal_process_group(local_pid, libc::SIGKILL);
                watch.wait(KILL_WAIT);
                let _ = reader.join();
                let tail = read_last_lines(out.stderr_path(), 5).unwrap_or_default();
                let _ = out.erase();
                bail!(
                    "failed to start {:?} on {} over ssh: {}",
                    command,
                    &self.config.host,
                    tail.join(" ")
                );
            }
        };

        let mut handle: Box<dyn TaskHandle> = Box::new(RemoteTaskHandle {
            command: command.to_string(),
            config: self.config.clone(),
            local_pid,
            remote_pid,
            out,
            watch,
            reader: Some(reader),
            clean_state: Default::default(),
        });
        check_started(&mut handle, "remote")?;
        Ok(handle)
    }
}

pub struct RemoteTaskHandle {
    command: String,
    config: SshConfig,
    local_pid: u32,
    remote_pid: u32,
    out: OutputDir,
    watch: ExitWatch,
    reader: Option<JoinHandle<()>>,
    clean_state: CleanState,
}

impl TaskHandle for RemoteTaskHandle {
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
        let kill = format!(
            "pkill -KILL -P {pid}; kill -KILL {pid}",
            pid = self.remote_pid
        );
        debug!("remote: {:?} on {}", &kill, &self.config.host);
        if let Err(e) = self.config.command(&kill).stdin(Stdio::null()).output() {
            warn!("remote: Failed to run kill on {} ({:?})", &self.config.host, &e);
        }
        if self.watch.wait(KILL_WAIT) {
            return Ok(());
        }
        signal_process_group(self.local_pid, libc::SIGKILL)?;
        if !self.watch.wait(KILL_WAIT) {
            bail!(
                "cannot terminate {:?} on {} (remote pid {})",
                &self.command,
                &self.config.host,
                self.remote_pid
            );
        }
        Ok(())
    }

    fn clean(&mut self) -> Result<()> {
        let state = self.status().0;
        if self.clean_state.check_clean(&self.command, state)? {
            if let Some(reader) = self.reader.take() {
                if reader.join().is_err() {
                    warn!("remote: Output reader of {:?} panicked", &self.command);
                }
            }
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
        self.config.host.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssh_args() {
        let cfg = SshConfig {
            host: "10.0.0.2".into(),
            user: "swan".into(),
            port: 2222,
            key_path: "/home/swan/.ssh/id_rsa".into(),
        };
        let args = cfg.ssh_args();
        assert!(args.contains(&"ControlMaster=auto".to_string()));
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert_eq!(args[args.len() - 1], "swan@10.0.0.2");
        assert_eq!(args[args.len() - 3], "/home/swan/.ssh/id_rsa");
        let port_idx = args.iter().position(|a| a == "-p").unwrap();
        assert_eq!(args[port_idx + 1], "2222");
    }

    #[test]
    fn test_remote_command() {
        assert_eq!(
            remote_command("taskset -c 1 memcached -p 11211"),
            "echo $$; exec sh -c 'taskset -c 1 memcached -p 11211'"
        );
    }
}
