// Copyright (c) Facebook, Inc. and its affiliates.
//! Scripted executor and handles for exercising launchers, load generators
//! and phases without spawning processes.
use anyhow::{bail, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{Executor, TaskHandle, TaskState, TaskStatus};

/// Shared ordered log of lifecycle events, e.g. `"stop memcached"`.
#[derive(Clone, Debug, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, event: String) {
        self.0.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, verb: &str) -> usize {
        let prefix = format!("{} ", verb);
        self.events()
            .iter()
            .filter(|e| e.starts_with(&prefix))
            .count()
    }

    pub fn position(&self, event: &str) -> Option<usize> {
        self.events().iter().position(|e| e == event)
    }

    /// Commands passed to `MockExecutor::execute()` in order.
    pub fn commands(&self) -> Vec<String> {
        self.events()
            .iter()
            .filter_map(|e| e.strip_prefix("exec ").map(|s| s.to_string()))
            .collect()
    }
}

#[derive(Debug)]
pub struct MockHandle {
    name: String,
    code: Option<i32>,
    exit_on_wait: Option<i32>,
    cleaned: bool,
    erased: bool,
    stdout: PathBuf,
    stderr: PathBuf,
    journal: Option<Journal>,
}

impl MockHandle {
    fn new(name: &str, code: Option<i32>, exit_on_wait: Option<i32>) -> Self {
        Self {
            name: name.to_string(),
            code,
            exit_on_wait,
            cleaned: false,
            erased: false,
            stdout: PathBuf::from("/dev/null"),
            stderr: PathBuf::from("/dev/null"),
            journal: None,
        }
    }

    /// Runs until stopped.
    pub fn running(name: &str) -> Self {
        Self::new(name, None, None)
    }

    /// Runs until the first `wait()` and then exits with `code`.
    pub fn finishing(name: &str, code: i32) -> Self {
        Self::new(name, None, Some(code))
    }

    pub fn terminated(name: &str, code: i32) -> Self {
        Self::new(name, Some(code), None)
    }

    pub fn journal(mut self, journal: &Journal) -> Self {
        self.journal = Some(journal.clone());
        self
    }

    /// Writes `content` as the stdout file inside `dir`.
    pub fn with_stdout(mut self, dir: &Path, content: &str) -> Self {
        let mut file = tempfile::Builder::new()
            .prefix("mock_stdout_")
            .tempfile_in(dir)
            .unwrap();
        file.write_all(content.as_bytes()).unwrap();
        self.stdout = file.into_temp_path().keep().unwrap();
        self
    }

    fn record(&self, verb: &str) {
        if let Some(journal) = self.journal.as_ref() {
            journal.push(format!("{} {}", verb, &self.name));
        }
    }
}

impl TaskHandle for MockHandle {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn status(&mut self) -> (TaskState, Option<TaskStatus>) {
        match self.code {
            Some(exit_code) => (
                TaskState::Terminated,
                Some(TaskStatus {
                    exit_code,
                    stdout_path: self.stdout.clone(),
                    stderr_path: self.stderr.clone(),
                }),
            ),
            None => (TaskState::Running, None),
        }
    }

    fn wait(&mut self, _timeout: Duration) -> bool {
        if self.code.is_none() {
            self.code = self.exit_on_wait.take();
        }
        self.code.is_some()
    }

    fn stop(&mut self) -> Result<()> {
        self.record("stop");
        if self.code.is_none() {
            self.code = Some(-1);
        }
        Ok(())
    }

    fn clean(&mut self) -> Result<()> {
        if self.code.is_none() {
            bail!("cannot clean running task {:?}", &self.name);
        }
        if !self.cleaned {
            self.record("clean");
            self.cleaned = true;
        }
        Ok(())
    }

    fn erase_output(&mut self) -> Result<()> {
        if !self.cleaned {
            bail!("cannot erase output of {:?} before clean", &self.name);
        }
        if !self.erased {
            self.record("erase");
            self.erased = true;
        }
        Ok(())
    }

    fn stdout_path(&self) -> PathBuf {
        self.stdout.clone()
    }

    fn stderr_path(&self) -> PathBuf {
        self.stderr.clone()
    }

    fn address(&self) -> String {
        "127.0.0.1".into()
    }
}

type Responder = dyn Fn(&str) -> Result<MockHandle> + Send + Sync;

/// Records every executed command in the journal as `"exec <command>"`
/// and answers with the handle produced by the responder. The default
/// responder returns a handle which runs until stopped.
pub struct MockExecutor {
    pub journal: Journal,
    responder: Box<Responder>,
}

impl MockExecutor {
    pub fn new(journal: &Journal) -> Self {
        Self {
            journal: journal.clone(),
            responder: Box::new(|cmd| Ok(MockHandle::running(cmd))),
        }
    }

    pub fn respond<F>(mut self, responder: F) -> Self
    where
        F: Fn(&str) -> Result<MockHandle> + Send + Sync + 'static,
    {
        self.responder = Box::new(responder);
        self
    }

    pub fn commands(&self) -> Vec<String> {
        self.journal.commands()
    }
}

impl Executor for MockExecutor {
    fn name(&self) -> String {
        "Mock".into()
    }

    fn execute(&self, command: &str) -> Result<Box<dyn TaskHandle>> {
        self.journal.push(format!("exec {}", command));
        let handle = (self.responder)(command)?;
        Ok(Box::new(handle.journal(&self.journal)))
    }
}
