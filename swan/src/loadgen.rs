// Copyright (c) Facebook, Inc. and its affiliates.

// The load generators under loadgen/ inherit all uses from this file.
use anyhow::{bail, Context, Result};
use log::{debug, error, info, warn};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ErrorCollection, SwanError};
use crate::executor::{
    log_output, stop_clean_erase, ClusterTaskHandle, ExecutorRef, ServiceHandle, TaskHandle,
};
use crate::parse::{self, Results};
use crate::workloads::Workload;
use swan_util::conf::{self, Flag};

pub mod mutilate;
pub mod specjbb;

/// Lowest latency target in microseconds tuning accepts.
pub const MIN_SLO: i64 = 5000;

lazy_static::lazy_static! {
    static ref LOAD_GENERATOR: Flag<String> = conf::string_flag(
        "experiment_load_generator",
        "Load generator, mutilate or specjbb. Follows the high priority workload when unset",
        "mutilate",
    );
}

pub fn register_flags() {
    lazy_static::initialize(&LOAD_GENERATOR);
    mutilate::register_flags();
    specjbb::register_flags();
}

pub trait LoadGenerator: Send + Sync {
    fn name(&self) -> String;

    /// Configuration snapshot recorded with every measurement.
    fn parameters(&self) -> Vec<String>;

    /// One-shot data fill of the latency critical workload.
    fn populate(&self) -> Result<()>;

    /// Finds the highest QPS which keeps the 99th percentile latency under
    /// `slo` microseconds. Returns the QPS and the latency achieved.
    fn tune(&self, slo: i64) -> Result<(i64, i64)>;

    /// Starts a fixed `qps` load for `duration`. The returned handle
    /// terminates with the load run.
    fn load(&self, qps: i64, duration: Duration) -> Result<Box<dyn TaskHandle>>;

    /// Results of a terminated load run from its stdout file.
    fn parse_results(&self, stdout: &Path) -> Result<Results>;
}

pub type LoadGeneratorRef = Arc<dyn LoadGenerator>;

/// Rejects latency targets tuning cannot work with. Called before anything
/// is launched.
pub fn check_slo(slo: i64) -> Result<()> {
    if slo < MIN_SLO {
        bail!(SwanError::Config(format!(
            "SLO {}us is below the minimum of {}us",
            slo, MIN_SLO
        )));
    }
    Ok(())
}

/// Stops, cleans and erases every handle, logging failures. Used to unwind
/// partially started clusters.
pub fn discard_all(handles: Vec<Box<dyn TaskHandle>>) {
    for mut handle in handles.into_iter() {
        if let Err(e) = stop_clean_erase(handle.as_mut()) {
            error!("loadgen: Failed to discard {:?} ({:#})", handle.name(), &e);
        }
    }
}

/// Waits for a finite run to terminate and checks its exit code. On
/// failure the task output is logged.
pub fn wait_for_success(handle: &mut Box<dyn TaskHandle>, timeout: Duration) -> Result<()> {
    if !handle.wait(timeout) {
        bail!(SwanError::LoadRun(format!(
            "{:?} did not finish within {:?}",
            handle.name(),
            timeout
        )));
    }
    let code = handle.exit_code()?;
    if code != 0 {
        log_output(handle.as_ref());
        bail!(SwanError::LoadRun(format!(
            "{:?} exited with {}",
            handle.name(),
            code
        )));
    }
    Ok(())
}

/// Stops and cleans a finished auxiliary run, keeping its output.
fn release(handle: &mut Box<dyn TaskHandle>) -> Result<()> {
    let mut errs = ErrorCollection::default();
    errs.add_result(handle.stop());
    errs.add_result(handle.clean());
    errs.into_result()
}

/// Name of the load generator driving `hp`.
pub fn load_generator_name(hp: Workload) -> String {
    if LOAD_GENERATOR.is_set() {
        return LOAD_GENERATOR.value();
    }
    match hp {
        Workload::Specjbb => "specjbb".into(),
        _ => LOAD_GENERATOR.value(),
    }
}

/// Builds the load generator `name` for the high priority workload `hp`.
/// The master or controller runs on `local`.
pub fn create(name: &str, hp: Workload, local: ExecutorRef) -> Result<LoadGeneratorRef> {
    match (name, hp) {
        ("mutilate", Workload::Memcached) => {
            let cfg = mutilate::MutilateConfig::from_flags();
            let agents = mutilate::agent_executors_from_flags()?;
            Ok(Arc::new(mutilate::Mutilate::new(local, agents, cfg)))
        }
        ("specjbb", Workload::Specjbb) => {
            let cfg = specjbb::SpecjbbLoadConfig::from_flags();
            Ok(Arc::new(specjbb::Specjbb::new(local.clone(), local, cfg)))
        }
        ("mutilate", _) | ("specjbb", _) => bail!(SwanError::Config(format!(
            "load generator {} cannot drive {}",
            name, hp
        ))),
        _ => bail!(SwanError::Config(format!(
            "unknown load generator {:?}",
            name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::mock::{Journal, MockExecutor};

    #[test]
    fn test_check_slo() {
        for pair in &[(0, false), (3000, false), (4999, false), (5000, true), (10000, true)] {
            assert_eq!(check_slo(pair.0).is_ok(), pair.1, "slo {}", pair.0);
        }
        assert!(crate::error::is_config_error(&check_slo(-1).unwrap_err()));
    }

    #[test]
    fn test_create() {
        let journal = Journal::default();
        let local: ExecutorRef = Arc::new(MockExecutor::new(&journal));
        assert!(create("mutilate", Workload::Memcached, local.clone()).is_ok());
        assert!(create("specjbb", Workload::Specjbb, local.clone()).is_ok());
        for (name, hp) in &[
            ("mutilate", Workload::Specjbb),
            ("specjbb", Workload::Memcached),
            ("ycsb", Workload::Memcached),
        ] {
            let err = create(name, *hp, local.clone()).err().unwrap();
            assert!(crate::error::is_config_error(&err));
        }
        assert!(journal.events().is_empty());
    }
}
