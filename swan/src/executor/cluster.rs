// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::Result;
use log::debug;
use std::path::PathBuf;
use std::time::Duration;

use super::{TaskHandle, TaskState, TaskStatus};
use crate::error::ErrorCollection;

/// One leader and any number of agents driven as a single task. The
/// leader decides termination and the exit code. Agents are stopped
/// before the leader.
pub struct ClusterTaskHandle {
    leader: Box<dyn TaskHandle>,
    agents: Vec<Box<dyn TaskHandle>>,
}

impl ClusterTaskHandle {
    pub fn new(leader: Box<dyn TaskHandle>, agents: Vec<Box<dyn TaskHandle>>) -> Self {
        Self { leader, agents }
    }

    pub fn add_agent(&mut self, agent: Box<dyn TaskHandle>) {
        self.agents.push(agent);
    }

    pub fn nr_agents(&self) -> usize {
        self.agents.len()
    }

    pub fn leader(&mut self) -> &mut Box<dyn TaskHandle> {
        &mut self.leader
    }

    pub fn agents(&mut self) -> &mut Vec<Box<dyn TaskHandle>> {
        &mut self.agents
    }
}

impl TaskHandle for ClusterTaskHandle {
    fn name(&self) -> String {
        self.leader.name()
    }

    fn status(&mut self) -> (TaskState, Option<TaskStatus>) {
        self.leader.status()
    }

    fn wait(&mut self, timeout: Duration) -> bool {
        self.leader.wait(timeout)
    }

    fn stop(&mut self) -> Result<()> {
        let mut errs = ErrorCollection::default();
        for agent in self.agents.iter_mut() {
            debug!("cluster: Stopping agent {:?}", agent.name());
            errs.add_result(agent.stop());
        }
        errs.add_result(self.leader.stop());
        errs.into_result()
    }

    fn clean(&mut self) -> Result<()> {
        let mut errs = ErrorCollection::default();
        for agent in self.agents.iter_mut() {
            errs.add_result(agent.clean());
        }
        errs.add_result(self.leader.clean());
        errs.into_result()
    }

    fn erase_output(&mut self) -> Result<()> {
        let mut errs = ErrorCollection::default();
        for agent in self.agents.iter_mut() {
            errs.add_result(agent.erase_output());
        }
        errs.add_result(self.leader.erase_output());
        errs.into_result()
    }

    fn stdout_path(&self) -> PathBuf {
        self.leader.stdout_path()
    }

    fn stderr_path(&self) -> PathBuf {
        self.leader.stderr_path()
    }

    fn address(&self) -> String {
        self.leader.address()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::mock::{Journal, MockHandle};

    #[test]
    fn test_cluster_lifecycle() {
        let journal = Journal::default();
        let leader = MockHandle::running("controller").journal(&journal);
        let agents: Vec<Box<dyn TaskHandle>> = vec![
            Box::new(MockHandle::running("injector-1").journal(&journal)),
            Box::new(MockHandle::running("injector-2").journal(&journal)),
        ];
        let mut cluster = ClusterTaskHandle::new(Box::new(leader), agents);
        assert_eq!(cluster.name(), "controller");
        assert!(!cluster.wait(Duration::from_millis(10)));

        cluster.stop().unwrap();
        assert_eq!(
            journal.events(),
            vec!["stop injector-1", "stop injector-2", "stop controller"]
        );
        cluster.clean().unwrap();
        cluster.erase_output().unwrap();
        assert_eq!(journal.count("erase"), 3);
    }

    #[test]
    fn test_leader_decides_exit_code() {
        let leader = MockHandle::terminated("controller", 0);
        let agents: Vec<Box<dyn TaskHandle>> = vec![Box::new(MockHandle::running("injector"))];
        let mut cluster = ClusterTaskHandle::new(Box::new(leader), agents);
        assert!(cluster.wait(Duration::from_secs(0)));
        assert_eq!(cluster.exit_code().unwrap(), 0);
        assert!(cluster.agents()[0].is_running());
        cluster.stop().unwrap();
        assert!(!cluster.agents()[0].is_running());
    }
}
