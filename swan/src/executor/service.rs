// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{anyhow, Result};
use std::path::PathBuf;
use std::time::Duration;

use super::{log_output, TaskHandle, TaskState, TaskStatus};

/// Wraps a long-lived task. A service is expected to run until the phase
/// stops it, so finding it terminated on the first `stop()` is reported as
/// a premature termination. The error sticks for later `stop()` calls.
pub struct ServiceHandle {
    inner: Box<dyn TaskHandle>,
    checked: bool,
    premature: Option<String>,
}

impl ServiceHandle {
    pub fn new(inner: Box<dyn TaskHandle>) -> Self {
        Self {
            inner,
            checked: false,
            premature: None,
        }
    }

    pub fn boxed(inner: Box<dyn TaskHandle>) -> Box<dyn TaskHandle> {
        Box::new(Self::new(inner))
    }

    fn check_premature(&mut self) {
        if self.checked {
            return;
        }
        self.checked = true;
        if let (TaskState::Terminated, Some(st)) = self.inner.status() {
            log_output(self.inner.as_ref());
            self.premature = Some(format!(
                "service {:?} on {} terminated prematurely (exit code {})",
                self.inner.name(),
                self.inner.address(),
                st.exit_code
            ));
        }
    }
}

impl TaskHandle for ServiceHandle {
    fn name(&self) -> String {
        self.inner.name()
    }

    fn status(&mut self) -> (TaskState, Option<TaskStatus>) {
        self.inner.status()
    }

    fn wait(&mut self, timeout: Duration) -> bool {
        self.inner.wait(timeout)
    }

    fn stop(&mut self) -> Result<()> {
        self.check_premature();
        self.inner.stop()?;
        match self.premature.as_ref() {
            Some(msg) => Err(anyhow!("{}", msg)),
            None => Ok(()),
        }
    }

    fn clean(&mut self) -> Result<()> {
        self.inner.clean()
    }

    fn erase_output(&mut self) -> Result<()> {
        self.inner.erase_output()
    }

    fn stdout_path(&self) -> PathBuf {
        self.inner.stdout_path()
    }

    fn stderr_path(&self) -> PathBuf {
        self.inner.stderr_path()
    }

    fn address(&self) -> String {
        self.inner.address()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::mock::MockHandle;

    #[test]
    fn test_premature_termination_is_sticky() {
        let mut svc = ServiceHandle::new(Box::new(MockHandle::terminated("memcached", 1)));
        assert!(svc.stop().is_err());
        assert!(svc.stop().is_err());
        svc.clean().unwrap();
        svc.erase_output().unwrap();
    }

    #[test]
    fn test_running_service_stops_cleanly() {
        let mut svc = ServiceHandle::new(Box::new(MockHandle::running("memcached")));
        assert!(svc.is_running());
        svc.stop().unwrap();
        assert_eq!(svc.status().0, TaskState::Terminated);
        svc.stop().unwrap();
    }
}
