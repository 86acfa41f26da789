// Copyright (c) Facebook, Inc. and its affiliates.
//! Phases drive one repetition at a time. Every repetition keeps a stack
//! of the tasks and telemetry sessions it started, which is unwound in
//! reverse order whichever way the repetition ends.
use anyhow::{bail, Context, Result};
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::error::{ErrorCollection, SwanError};
use crate::executor::{self, TaskHandle};
use crate::loadgen::{check_slo, LoadGeneratorRef};
use crate::telemetry::{SessionHandle, SessionLauncherRef, TaskInfo};
use crate::workloads::{Aggressor, HighPriority};
use swan_intf::{aggressor_label, MeasurementRecord, PhaseRecord, SessionTags};
use swan_util::*;

/// Peak load published by tuning and read by the measurement phases.
#[derive(Clone, Debug, Default)]
pub struct PeakLoad(Arc<RwLock<Option<i64>>>);

impl PeakLoad {
    pub fn new(value: Option<i64>) -> Self {
        Self(Arc::new(RwLock::new(value)))
    }

    pub fn set(&self, value: i64) {
        *self.0.write().unwrap() = Some(value);
    }

    pub fn get(&self) -> Option<i64> {
        *self.0.read().unwrap()
    }
}

/// QPS of load point `index` out of `count`, truncated.
pub fn load_point_qps(peak: i64, index: u32, count: u32) -> i64 {
    peak * index as i64 / count as i64
}

/// Identifies one repetition and where its output goes.
#[derive(Clone, Debug, PartialEq)]
pub struct Session {
    pub experiment_id: String,
    pub phase_id: String,
    pub repetition: u32,
    pub dir: PathBuf,
}

pub trait Phase {
    fn name(&self) -> String;

    /// Runs one repetition.
    fn run(&mut self, session: &Session) -> Result<()>;

    /// Called once after all repetitions.
    fn finalize(&mut self) -> Result<()> {
        Ok(())
    }
}

const WAIT_SLICE: Duration = Duration::from_millis(500);
const DRAIN_GRACE: Duration = Duration::from_secs(5);

fn check_exiting() -> Result<()> {
    if prog_exiting() {
        bail!("interrupted");
    }
    Ok(())
}

/// Waits for `handle` to terminate, `timeout` of zero meaning forever.
/// Once the program starts exiting the task gets `DRAIN_GRACE` before the
/// wait is abandoned and the cleanup stack stops it.
fn wait_or_drain(handle: &mut Box<dyn TaskHandle>, timeout: Duration) -> Result<bool> {
    let deadline = match timeout.as_nanos() {
        0 => None,
        _ => Some(Instant::now() + timeout),
    };
    let mut drain_deadline = None;
    loop {
        if handle.wait(WAIT_SLICE) {
            return Ok(true);
        }
        let now = Instant::now();
        if deadline.map(|d| now >= d).unwrap_or(false) {
            return Ok(false);
        }
        if prog_exiting() {
            let grace_end = *drain_deadline.get_or_insert(now + DRAIN_GRACE);
            if now >= grace_end {
                bail!("interrupted while waiting for {:?}", handle.name());
            }
        }
    }
}

enum Deferred {
    Task(Box<dyn TaskHandle>),
    Session(Box<dyn SessionHandle>),
}

/// Tasks and sessions of a repetition in start order.
#[derive(Default)]
pub struct CleanupStack {
    entries: Vec<Deferred>,
}

impl CleanupStack {
    pub fn push_task(&mut self, handle: Box<dyn TaskHandle>) -> &mut Box<dyn TaskHandle> {
        self.entries.push(Deferred::Task(handle));
        match self.entries.last_mut() {
            Some(Deferred::Task(h)) => h,
            _ => unreachable!(),
        }
    }

    pub fn push_session(&mut self, session: Box<dyn SessionHandle>) -> &mut Box<dyn SessionHandle> {
        self.entries.push(Deferred::Session(session));
        match self.entries.last_mut() {
            Some(Deferred::Session(s)) => s,
            _ => unreachable!(),
        }
    }

    /// Stops sessions, then stops and cleans tasks, newest first. Task
    /// output stays in the repetition directory.
    pub fn unwind(&mut self) -> Result<()> {
        let mut errs = ErrorCollection::default();
        while let Some(entry) = self.entries.pop() {
            match entry {
                Deferred::Session(mut s) => errs.add_result(s.stop()),
                Deferred::Task(mut h) => {
                    debug!("phase: Stopping {:?}", h.name());
                    errs.add_result(h.stop());
                    errs.add_result(h.clean());
                }
            }
        }
        errs.into_result()
    }
}

impl Drop for CleanupStack {
    fn drop(&mut self) {
        if !self.entries.is_empty() {
            if let Err(e) = self.unwind() {
                error!("phase: Cleanup failed ({:#})", &e);
            }
        }
    }
}

/// Runs `steps` and unwinds the stack afterwards. The first error wins.
fn with_cleanup<F>(steps: F) -> Result<()>
where
    F: FnOnce(&mut CleanupStack) -> Result<()>,
{
    let mut stack = CleanupStack::default();
    let mut errs = ErrorCollection::default();
    errs.add_result(steps(&mut stack));
    errs.add_result(stack.unwind());
    errs.into_result()
}

/// Finds the peak load of the latency critical workload under the SLO.
pub struct TuningPhase {
    hp: HighPriority,
    lg: LoadGeneratorRef,
    slo: i64,
    peak: PeakLoad,
    pub qps: Vec<i64>,
    pub sli: Vec<i64>,
}

impl TuningPhase {
    pub fn new(hp: HighPriority, lg: LoadGeneratorRef, slo: i64, peak: PeakLoad) -> Self {
        Self {
            hp,
            lg,
            slo,
            peak,
            qps: vec![],
            sli: vec![],
        }
    }
}

impl Phase for TuningPhase {
    fn name(&self) -> String {
        "tuning".into()
    }

    fn run(&mut self, session: &Session) -> Result<()> {
        check_slo(self.slo)?;
        executor::set_output_root(&session.dir);
        let (hp, lg, slo) = (&self.hp, &self.lg, self.slo);
        let mut found = None;
        with_cleanup(|stack| {
            debug!("phase: Launching {}", hp.launcher.name());
            stack.push_task(hp.launcher.launch().context("launching latency critical workload")?);
            check_exiting()?;
            lg.populate()?;
            check_exiting()?;
            found = Some(lg.tune(slo)?);
            Ok(())
        })?;
        if let Some((qps, sli)) = found {
            info!(
                "tuning: Repetition {} achieved {} QPS at {}us",
                session.repetition, qps, sli
            );
            self.qps.push(qps);
            self.sli.push(sli);
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        if self.qps.is_empty() {
            bail!("tuning produced no results");
        }
        let avg = self.qps.iter().sum::<i64>() / self.qps.len() as i64;
        info!("tuning: Peak load {} QPS over {} repetitions", avg, self.qps.len());
        self.peak.set(avg);
        Ok(())
    }
}

/// Measures the latency critical workload at one load point, next to an
/// aggressor set or alone.
pub struct MeasurementPhase {
    pub id: String,
    hp: HighPriority,
    aggressors: Vec<Aggressor>,
    lg: LoadGeneratorRef,
    load_point: u32,
    load_points: u32,
    peak: PeakLoad,
    load_duration: Duration,
    wait_timeout: Duration,
    telemetry: Option<SessionLauncherRef>,
    pub measurements: Vec<MeasurementRecord>,
}

impl MeasurementPhase {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: &str,
        hp: HighPriority,
        aggressors: Vec<Aggressor>,
        lg: LoadGeneratorRef,
        load_point: u32,
        load_points: u32,
        peak: PeakLoad,
        load_duration: Duration,
    ) -> Self {
        Self {
            id: id.to_string(),
            hp,
            aggressors,
            lg,
            load_point,
            load_points,
            peak,
            load_duration,
            wait_timeout: Duration::from_secs(0),
            telemetry: None,
            measurements: vec![],
        }
    }

    pub fn wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn telemetry(mut self, telemetry: Option<SessionLauncherRef>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn aggressor_label(&self) -> String {
        let names: Vec<String> = self.aggressors.iter().map(|a| a.name()).collect();
        aggressor_label(&names)
    }

    /// Phase row of the metadata store.
    pub fn record(&self, experiment_id: &str) -> PhaseRecord {
        PhaseRecord {
            experiment_id: experiment_id.to_string(),
            id: self.id.clone(),
            lc_parameters: self.hp.launcher.parameters(),
            lc_isolation: self.hp.isolation.clone(),
            aggressor_names: self.aggressors.iter().map(|a| a.name()).collect(),
            aggressor_parameters: self
                .aggressors
                .iter()
                .map(|a| a.launcher.parameters())
                .collect(),
            aggressor_isolations: self.aggressors.iter().map(|a| a.isolation.clone()).collect(),
            measurements: vec![],
        }
    }

    fn target_qps(&self) -> Result<i64> {
        if self.load_point < 1 || self.load_point > self.load_points {
            bail!(SwanError::Config(format!(
                "load point {} out of range 1-{}",
                self.load_point, self.load_points
            )));
        }
        match self.peak.get() {
            Some(peak) => Ok(load_point_qps(peak, self.load_point, self.load_points)),
            None => bail!("peak load is not known yet"),
        }
    }
}

impl Phase for MeasurementPhase {
    fn name(&self) -> String {
        self.id.clone()
    }

    fn run(&mut self, session: &Session) -> Result<()> {
        let qps = self.target_qps()?;
        executor::set_output_root(&session.dir);
        let tags = SessionTags {
            experiment_id: session.experiment_id.clone(),
            phase_id: session.phase_id.clone(),
            repetition_id: session.repetition,
            load_point_qps: qps,
            aggressor_name: self.aggressor_label(),
        };
        info!(
            "phase: {} load point {}/{} ({} QPS) repetition {}",
            &self.id, self.load_point, self.load_points, qps, session.repetition
        );

        let mut results = None;
        with_cleanup(|stack| {
            debug!("phase: Launching {}", self.hp.launcher.name());
            let hp = stack.push_task(
                self.hp
                    .launcher
                    .launch()
                    .context("launching latency critical workload")?,
            );
            let hp_info = TaskInfo::of(hp.as_ref());
            check_exiting()?;
            self.lg.populate()?;

            for aggr in self.aggressors.iter() {
                check_exiting()?;
                debug!("phase: Launching aggressor {}", aggr.launcher.name());
                let handle = stack.push_task(
                    aggr.launcher
                        .launch()
                        .with_context(|| format!("launching aggressor {}", aggr.name()))?,
                );
                let info = TaskInfo::of(handle.as_ref());
                if let Some(tel) = self.telemetry.as_ref() {
                    stack.push_session(tel.launch(&info, &tags)?);
                }
            }

            if let Some(tel) = self.telemetry.as_ref() {
                stack.push_session(tel.launch(&hp_info, &tags)?);
            }

            check_exiting()?;
            let run = stack.push_task(self.lg.load(qps, self.load_duration)?);
            if !wait_or_drain(run, self.wait_timeout)? {
                bail!(SwanError::LoadRun(format!(
                    "{:?} did not finish within {:?}",
                    run.name(),
                    self.wait_timeout
                )));
            }
            let run_info = TaskInfo::of(run.as_ref());
            let code = run.exit_code()?;

            if let Some(tel) = self.telemetry.as_ref() {
                let lg_session = stack.push_session(tel.launch(&run_info, &tags)?);
                if let Err(e) = lg_session.wait() {
                    warn!("phase: Load generator telemetry failed ({:#})", &e);
                }
            }

            if code != 0 {
                bail!(SwanError::LoadRun(format!(
                    "{:?} exited with {}",
                    &run_info.name, code
                )));
            }
            results = Some(self.lg.parse_results(&run_info.stdout)?);
            Ok(())
        })?;

        if let Some(results) = results {
            self.measurements.push(MeasurementRecord {
                experiment_id: session.experiment_id.clone(),
                phase_id: self.id.clone(),
                load: qps,
                load_point_qps: qps,
                repetition: session.repetition,
                lg_parameters: self.lg.parameters(),
                results,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::executor::mock::{Journal, MockExecutor, MockHandle};
    use crate::executor::ExecutorRef;
    use crate::loadgen::mutilate::{Mutilate, MutilateConfig};
    use crate::workloads::memcached::{Memcached, MemcachedConfig};
    use crate::workloads::stressng::{StressKind, StressNg};
    use crate::workloads::{LauncherRef, ServiceLauncher, Workload};
    use std::net::TcpListener;
    use std::path::Path;

    pub const REPORT: &str = "\
#type       avg     std     min     5th    10th    90th    95th    99th
read       52.0    19.1    22.6    31.2    33.6    74.4    90.3   129.7

Total QPS = 1999.5 (19995 / 10.0s)
";

    /// Memcached on `port` whose tasks and mutilate runs go through one
    /// journaled mock executor. Load runs exit with `lg_code`.
    pub fn mock_setup(
        journal: &Journal,
        port: u16,
        out: &Path,
        lg_code: i32,
    ) -> (HighPriority, LoadGeneratorRef, ExecutorRef) {
        let out = out.to_path_buf();
        let exec: ExecutorRef = Arc::new(MockExecutor::new(journal).respond(move |cmd| {
            if cmd.starts_with("mutilate") {
                let code = if cmd.contains(" -q ") { lg_code } else { 0 };
                Ok(MockHandle::finishing(cmd, code).with_stdout(&out, REPORT))
            } else {
                Ok(MockHandle::running(cmd))
            }
        }));
        let mc_cfg = MemcachedConfig {
            port,
            liveness_timeout: Duration::from_millis(300),
            ..Default::default()
        };
        let launcher: LauncherRef =
            ServiceLauncher::wrap(Arc::new(Memcached::new(exec.clone(), mc_cfg.clone()).unwrap()));
        let hp = HighPriority {
            id: Workload::Memcached,
            launcher,
            isolation: "taskset -c 0".into(),
        };
        let lg_cfg = MutilateConfig {
            server: mc_cfg.address(),
            ..Default::default()
        };
        let lg: LoadGeneratorRef = Arc::new(Mutilate::new(exec.clone(), vec![], lg_cfg));
        (hp, lg, exec)
    }

    pub fn stress_aggressor(exec: ExecutorRef) -> Aggressor {
        Aggressor {
            id: Workload::StressNg(StressKind::Stream),
            launcher: ServiceLauncher::wrap(Arc::new(StressNg::with_command(
                exec,
                StressKind::Stream,
                "stress-ng --stream=1".into(),
            ))),
            isolation: "taskset -c 2".into(),
        }
    }

    pub fn listen() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    fn session(dir: &Path, phase: &str, rep: u32) -> Session {
        Session {
            experiment_id: "e1".into(),
            phase_id: phase.into(),
            repetition: rep,
            dir: dir.to_path_buf(),
        }
    }

    #[test]
    fn test_load_point_qps() {
        for (peak, i, n, qps) in &[
            (5000, 1, 1, 5000),
            (4000, 1, 2, 2000),
            (4000, 2, 2, 4000),
            (1000, 1, 3, 333),
            (1000, 3, 3, 1000),
        ] {
            assert_eq!(load_point_qps(*peak, *i, *n), *qps);
        }
    }

    #[test]
    fn test_peak_load() {
        let peak = PeakLoad::default();
        assert_eq!(peak.get(), None);
        let reader = peak.clone();
        peak.set(4200);
        assert_eq!(reader.get(), Some(4200));
    }

    #[test]
    fn test_measurement_ordering_and_cleanup() {
        let dir = tempfile::TempDir::new().unwrap();
        let (_listener, port) = listen();
        let journal = Journal::default();
        let (hp, lg, exec) = mock_setup(&journal, port, dir.path(), 0);
        let mut phase = MeasurementPhase::new(
            "aggressor_nr_0",
            hp,
            vec![stress_aggressor(exec)],
            lg,
            1,
            2,
            PeakLoad::new(Some(4000)),
            Duration::from_secs(1),
        );
        assert_eq!(phase.aggressor_label(), "stress-ng-stream");
        phase.run(&session(dir.path(), "aggressor_nr_0", 0)).unwrap();

        let cmds = journal.commands();
        assert_eq!(cmds.len(), 4);
        assert!(cmds[0].starts_with("memcached"));
        assert!(cmds[1].contains("--loadonly"));
        assert_eq!(cmds[2], "stress-ng --stream=1");
        assert!(cmds[3].contains("-q 2000 -t 1"));

        // Newest first: load run, aggressor, memcached.
        let stops: Vec<String> = journal
            .events()
            .into_iter()
            .filter(|e| e.starts_with("stop "))
            .collect();
        assert_eq!(stops.len(), 4);
        assert!(stops[1].contains("-q 2000"));
        assert_eq!(stops[2], "stop stress-ng --stream=1");
        assert!(stops[3].starts_with("stop memcached"));
        assert_eq!(journal.count("clean"), 4);

        assert_eq!(phase.measurements.len(), 1);
        let m = &phase.measurements[0];
        assert_eq!((m.load, m.load_point_qps, m.repetition), (2000, 2000, 0));
        assert_eq!(m.results["percentile/99th"], 129.7);
        // The achieved rate only shows up in the parsed results.
        assert_eq!(m.results[crate::parse::QPS], 1999.5);
    }

    #[test]
    fn test_measurement_load_failure() {
        let dir = tempfile::TempDir::new().unwrap();
        let (_listener, port) = listen();
        let journal = Journal::default();
        let (hp, lg, _) = mock_setup(&journal, port, dir.path(), 1);
        let mut phase = MeasurementPhase::new(
            "baseline",
            hp,
            vec![],
            lg,
            1,
            1,
            PeakLoad::new(Some(1000)),
            Duration::from_secs(1),
        );
        let err = phase.run(&session(dir.path(), "baseline", 0)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SwanError>(),
            Some(SwanError::LoadRun(_))
        ));
        assert!(phase.measurements.is_empty());
        assert_eq!(journal.count("clean"), 3);
    }

    #[test]
    fn test_tuning_rejects_low_slo() {
        let dir = tempfile::TempDir::new().unwrap();
        let (_listener, port) = listen();
        let journal = Journal::default();
        let (hp, lg, _) = mock_setup(&journal, port, dir.path(), 0);
        let mut tuning = TuningPhase::new(hp, lg, 3000, PeakLoad::default());
        let err = tuning.run(&session(dir.path(), "tuning", 0)).unwrap_err();
        assert!(crate::error::is_config_error(&err));
        assert!(journal.events().is_empty());
    }

    #[test]
    fn test_tuning() {
        let dir = tempfile::TempDir::new().unwrap();
        let (_listener, port) = listen();
        let journal = Journal::default();
        let (hp, lg, _) = mock_setup(&journal, port, dir.path(), 0);
        let peak = PeakLoad::default();
        let mut tuning = TuningPhase::new(hp, lg, 5000, peak.clone());
        assert!(tuning.finalize().is_err());
        for rep in 0..2 {
            tuning.run(&session(dir.path(), "tuning", rep)).unwrap();
        }
        tuning.finalize().unwrap();
        assert_eq!(tuning.sli, vec![129, 129]);
        assert_eq!(peak.get(), Some(1999));
    }
}
