// Copyright (c) Facebook, Inc. and its affiliates.
//! Telemetry sessions bind a task's output to an external collector which
//! ingests it under the experiment tags. A load generator session is
//! started once the load run has terminated and reads its finished stdout.
//! Server sessions run alongside the workload until the phase ends.
use anyhow::{bail, Result};
use log::{debug, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ErrorCollection, SwanError};
use crate::executor::{log_output, ExecutorRef, LocalExecutor, TaskHandle};
use swan_intf::SessionTags;
use swan_util::conf::{self, Flag};
use swan_util::*;

lazy_static::lazy_static! {
    static ref ENABLED: Flag<bool> = conf::bool_flag(
        "telemetry_enabled",
        "Feed workload and load generator output to the telemetry collector",
        false,
    );
    static ref COLLECTOR_PATH: Flag<String> = conf::string_flag(
        "telemetry_collector_path",
        "Collector command, invoked with --tags, --host and --input",
        "swan-collector",
    );
    static ref INGEST_TIMEOUT: Flag<Duration> = conf::duration_flag(
        "telemetry_ingest_timeout",
        "How long to wait for the collector to ingest a finished load run",
        Duration::from_secs(60),
    );
}

pub fn register_flags() {
    lazy_static::initialize(&ENABLED);
    lazy_static::initialize(&COLLECTOR_PATH);
    lazy_static::initialize(&INGEST_TIMEOUT);
}

/// What a collector needs to know about the observed task.
#[derive(Clone, Debug, PartialEq)]
pub struct TaskInfo {
    pub name: String,
    pub address: String,
    pub stdout: PathBuf,
}

impl TaskInfo {
    pub fn of(handle: &dyn TaskHandle) -> Self {
        Self {
            name: handle.name(),
            address: handle.address(),
            stdout: handle.stdout_path(),
        }
    }
}

pub trait SessionHandle: Send {
    /// Blocks until the collector has ingested everything.
    fn wait(&mut self) -> Result<()>;

    /// Tears the collector down. Idempotent.
    fn stop(&mut self) -> Result<()>;
}

pub trait SessionLauncher: Send + Sync {
    fn launch(&self, task: &TaskInfo, tags: &SessionTags) -> Result<Box<dyn SessionHandle>>;
}

pub type SessionLauncherRef = Arc<dyn SessionLauncher>;

/// Runs the collector binary through an executor.
pub struct Collector {
    exec: ExecutorRef,
    path: String,
    ingest_timeout: Duration,
}

impl Collector {
    pub fn new(exec: ExecutorRef, path: &str, ingest_timeout: Duration) -> Self {
        Self {
            exec,
            path: path.to_string(),
            ingest_timeout,
        }
    }

    pub fn command(&self, task: &TaskInfo, tags: &SessionTags) -> String {
        format!(
            "{} --tags {} --host {} --input {}",
            &self.path,
            shell_quote(&tags.to_string()),
            &task.address,
            shell_quote(&task.stdout.to_string_lossy())
        )
    }
}

impl SessionLauncher for Collector {
    fn launch(&self, task: &TaskInfo, tags: &SessionTags) -> Result<Box<dyn SessionHandle>> {
        debug!("telemetry: Collecting {:?} as {}", &task.name, tags);
        match self.exec.execute(&self.command(task, tags)) {
            Ok(handle) => Ok(Box::new(CollectorSession {
                handle,
                ingest_timeout: self.ingest_timeout,
                stopped: false,
            })),
            Err(e) => Err(SwanError::Telemetry(format!(
                "starting collector for {:?}: {:#}",
                &task.name, &e
            ))
            .into()),
        }
    }
}

pub struct CollectorSession {
    handle: Box<dyn TaskHandle>,
    ingest_timeout: Duration,
    stopped: bool,
}

impl SessionHandle for CollectorSession {
    fn wait(&mut self) -> Result<()> {
        if !self.handle.wait(self.ingest_timeout) {
            bail!(SwanError::Telemetry(format!(
                "collector {:?} did not finish within {:?}",
                self.handle.name(),
                self.ingest_timeout
            )));
        }
        let code = self.handle.exit_code()?;
        if code != 0 {
            log_output(self.handle.as_ref());
            bail!(SwanError::Telemetry(format!(
                "collector {:?} exited with {}",
                self.handle.name(),
                code
            )));
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        let mut errs = ErrorCollection::default();
        errs.add_result(self.handle.stop());
        errs.add_result(self.handle.clean());
        errs.into_result()
    }
}

impl Drop for CollectorSession {
    fn drop(&mut self) {
        if !self.stopped {
            if let Err(e) = self.stop() {
                warn!("telemetry: Failed to stop collector ({:#})", &e);
            }
        }
    }
}

/// Collector binary in use, if telemetry is enabled.
pub fn collector_path() -> Option<String> {
    match ENABLED.value() {
        true => Some(COLLECTOR_PATH.value()),
        false => None,
    }
}

/// The collector configured by flags, if telemetry is enabled.
pub fn collector_from_flags() -> Option<SessionLauncherRef> {
    if !ENABLED.value() {
        return None;
    }
    Some(Arc::new(Collector::new(
        Arc::new(LocalExecutor::new()),
        &COLLECTOR_PATH.value(),
        INGEST_TIMEOUT.value(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::mock::{Journal, MockExecutor, MockHandle};

    fn info() -> TaskInfo {
        TaskInfo {
            name: "mutilate".into(),
            address: "127.0.0.1".into(),
            stdout: PathBuf::from("/tmp/out dir/stdout"),
        }
    }

    fn tags() -> SessionTags {
        SessionTags {
            experiment_id: "e1".into(),
            phase_id: "baseline".into(),
            repetition_id: 0,
            load_point_qps: 1000,
            aggressor_name: "Baseline".into(),
        }
    }

    #[test]
    fn test_command() {
        let journal = Journal::default();
        let c = Collector::new(
            Arc::new(MockExecutor::new(&journal)),
            "collect",
            Duration::from_secs(1),
        );
        assert_eq!(
            c.command(&info(), &tags()),
            "collect --tags 'experiment_id:e1,phase_id:baseline,repetition_id:0,\
             load_point_qps:1000,aggressor_name:Baseline' --host 127.0.0.1 \
             --input '/tmp/out dir/stdout'"
        );
    }

    #[test]
    fn test_session_lifecycle() {
        let journal = Journal::default();
        let exec = MockExecutor::new(&journal).respond(|cmd| Ok(MockHandle::finishing(cmd, 0)));
        let c = Collector::new(Arc::new(exec), "collect", Duration::from_secs(1));
        let mut s = c.launch(&info(), &tags()).unwrap();
        s.wait().unwrap();
        s.stop().unwrap();
        s.stop().unwrap();
        drop(s);
        assert_eq!(journal.count("stop"), 1);
        assert_eq!(journal.count("clean"), 1);
    }

    #[test]
    fn test_session_failure() {
        let journal = Journal::default();
        let exec = MockExecutor::new(&journal).respond(|cmd| Ok(MockHandle::finishing(cmd, 2)));
        let c = Collector::new(Arc::new(exec), "collect", Duration::from_secs(1));
        let mut s = c.launch(&info(), &tags()).unwrap();
        let err = s.wait().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SwanError>(),
            Some(SwanError::Telemetry(_))
        ));
    }
}
