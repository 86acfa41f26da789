// Copyright (c) Facebook, Inc. and its affiliates.
//! Experiment driver. Creates the experiment directory tree, records the
//! platform, environment and flags, runs tuning unless the peak load is
//! given and then measures every aggressor set at every load point.
use anyhow::{bail, Context, Result};
use log::{error, info, warn};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::error::{is_config_error, SwanError};
use crate::executor::{self, LocalExecutor};
use crate::isolation::{planner, WorkloadIsolations};
use crate::loadgen::{self, LoadGeneratorRef};
use crate::metadata::{self, MetadataStoreRef};
use crate::phase::{MeasurementPhase, PeakLoad, Phase, Session, TuningPhase};
use crate::telemetry::{self, SessionLauncherRef};
use crate::workloads::{self, Aggressor, AggressorFactory, HighPriority};
use swan_intf::{phase_name, ExperimentRecord, MetadataKind};
use swan_util::conf::{self, Flag};
use swan_util::*;

pub const MASTER_LOG: &str = "master.log";
pub const RECORD_FILE: &str = "experiment.json";
const TUNING_PHASE: &str = "tuning";

lazy_static::lazy_static! {
    static ref SLO: Flag<i64> = conf::int_flag(
        "experiment_slo",
        "Target 99th percentile latency of the latency critical workload in microseconds",
        5000,
    );
    static ref LOAD_POINTS: Flag<i64> = conf::int_flag(
        "experiment_load_points",
        "Number of load points to measure, evenly spread up to the peak load",
        10,
    );
    static ref LOAD_DURATION: Flag<Duration> = conf::duration_flag(
        "experiment_load_duration",
        "Length of each load run",
        Duration::from_secs(15),
    );
    static ref REPETITIONS: Flag<i64> = conf::int_flag(
        "experiment_repetitions",
        "Repetitions of every load point",
        1,
    );
    static ref STOP_ON_ERROR: Flag<bool> = conf::bool_flag(
        "experiment_stop_on_error",
        "Abort the experiment on the first failed repetition",
        false,
    );
    static ref PEAK_LOAD: Flag<i64> = conf::int_flag(
        "experiment_peak_load",
        "Peak load in QPS. 0 runs tuning to find it",
        0,
    );
    static ref LG_WAIT_TIMEOUT: Flag<Duration> = conf::duration_flag(
        "experiment_load_generator_wait_timeout",
        "How long to wait for a load run to finish, 0 waits forever",
        Duration::from_secs(0),
    );
    static ref WORK_DIR: Flag<String> = conf::string_flag(
        "experiment_work_dir",
        "Directory the experiment directories are created in",
        "./experiments",
    );
    static ref APP_NAME: Flag<String> = conf::string_flag(
        "experiment_app_name",
        "Prefix of the experiment directory",
        "swan",
    );
}

pub fn register_flags() {
    lazy_static::initialize(&SLO);
    lazy_static::initialize(&LOAD_POINTS);
    lazy_static::initialize(&LOAD_DURATION);
    lazy_static::initialize(&REPETITIONS);
    lazy_static::initialize(&STOP_ON_ERROR);
    lazy_static::initialize(&PEAK_LOAD);
    lazy_static::initialize(&LG_WAIT_TIMEOUT);
    lazy_static::initialize(&WORK_DIR);
    lazy_static::initialize(&APP_NAME);
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExperimentConfig {
    pub app_name: String,
    pub work_dir: PathBuf,
    pub slo: i64,
    pub load_points: u32,
    pub load_duration: Duration,
    pub repetitions: u32,
    pub stop_on_error: bool,
    pub peak_load: Option<i64>,
    pub lg_wait_timeout: Duration,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            app_name: "swan".into(),
            work_dir: PathBuf::from("./experiments"),
            slo: 5000,
            load_points: 10,
            load_duration: Duration::from_secs(15),
            repetitions: 1,
            stop_on_error: false,
            peak_load: None,
            lg_wait_timeout: Duration::from_secs(0),
        }
    }
}

fn positive(name: &str, v: i64) -> Result<u32> {
    if v < 1 || v > u32::MAX as i64 {
        bail!(SwanError::Config(format!("{} must be positive, got {}", name, v)));
    }
    Ok(v as u32)
}

impl ExperimentConfig {
    pub fn from_flags() -> Result<Self> {
        let cfg = Self {
            app_name: APP_NAME.value(),
            work_dir: PathBuf::from(WORK_DIR.value()),
            slo: SLO.value(),
            load_points: positive(LOAD_POINTS.name(), LOAD_POINTS.value())?,
            load_duration: LOAD_DURATION.value(),
            repetitions: positive(REPETITIONS.name(), REPETITIONS.value())?,
            stop_on_error: STOP_ON_ERROR.value(),
            peak_load: match PEAK_LOAD.value() {
                0 => None,
                v if v < 0 => bail!(SwanError::Config(format!(
                    "{} must not be negative, got {}",
                    PEAK_LOAD.name(),
                    v
                ))),
                v => Some(v),
            },
            lg_wait_timeout: LG_WAIT_TIMEOUT.value(),
        };
        if cfg.peak_load.is_none() {
            loadgen::check_slo(cfg.slo)?;
        }
        Ok(cfg)
    }
}

/// Everything an experiment runs, built before any directory is created.
pub struct ExperimentParts {
    pub hp: HighPriority,
    pub aggressors: Vec<Vec<Aggressor>>,
    pub lg: LoadGeneratorRef,
    pub telemetry: Option<SessionLauncherRef>,
}

impl ExperimentParts {
    pub fn from_flags() -> Result<Self> {
        let plan = planner::plan_from_flags()?;
        let isolations = WorkloadIsolations::from_plan(&plan)?;
        let executors = executor::executor_factory();

        let hp = workloads::high_priority(
            &workloads::HP_WORKLOAD.value(),
            isolations.hp.clone(),
            executors.as_ref(),
        )?;
        let aggressors = AggressorFactory::new(&isolations, executors.as_ref())
            .create_all(&workloads::BE_WORKLOADS.value())?;
        let lg = loadgen::create(
            &loadgen::load_generator_name(hp.id),
            hp.id,
            Arc::new(LocalExecutor::new()),
        )?;
        Ok(Self {
            hp,
            aggressors,
            lg,
            telemetry: telemetry::collector_from_flags(),
        })
    }
}

/// `baseline` for the empty set and `aggressor_nr_<k>` for the k-th
/// non-empty one.
pub fn phase_ids(sets: &[Vec<Aggressor>]) -> Vec<String> {
    let mut nr = 0;
    sets.iter()
        .map(|set| match set.is_empty() {
            true => phase_name(None),
            false => {
                nr += 1;
                phase_name(Some(nr - 1))
            }
        })
        .collect()
}

pub struct Experiment {
    pub id: String,
    pub dir: PathBuf,
    cfg: ExperimentConfig,
    parts: ExperimentParts,
    store: Option<MetadataStoreRef>,
    record: ExperimentRecord,
    nr_failures: u32,
}

impl Experiment {
    /// Creates `<work_dir>/<app>-<timestamp>-<uuid>/` and starts copying
    /// the log into its master log.
    pub fn create(cfg: ExperimentConfig, parts: ExperimentParts) -> Result<Self> {
        let id = Uuid::new_v4().to_string();
        let dir = cfg
            .work_dir
            .join(format!("{}-{}-{}", &cfg.app_name, timestamp_now(), &id));
        fs::create_dir_all(&dir)
            .map_err(|e| SwanError::Io(format!("creating {:?}: {}", &dir, &e)))?;
        add_log_file(dir.join(MASTER_LOG))
            .map_err(|e| SwanError::Io(format!("opening master log: {:#}", &e)))?;
        info!("experiment: Started {} in {:?}", &id, &dir);

        let record = ExperimentRecord {
            id: id.clone(),
            load_duration: cfg.load_duration.as_secs_f64(),
            tuning_duration: 0.0,
            lc_name: parts.hp.id.to_string(),
            lg_names: vec![parts.lg.name()],
            repetitions: cfg.repetitions,
            load_points: cfg.load_points,
            slo: cfg.slo,
            phases: vec![],
        };
        Ok(Self {
            id,
            dir,
            cfg,
            parts,
            store: None,
            record,
            nr_failures: 0,
        })
    }

    pub fn with_store(mut self, store: MetadataStoreRef) -> Self {
        self.store = Some(store);
        self
    }

    pub fn record(&self) -> &ExperimentRecord {
        &self.record
    }

    pub fn nr_failures(&self) -> u32 {
        self.nr_failures
    }

    /// Stores the experiment row and the platform, environment and flag
    /// maps. Failures here are fatal.
    pub fn record_metadata(
        &self,
        platform: BTreeMap<String, String>,
        environ: BTreeMap<String, String>,
        flags: BTreeMap<String, String>,
    ) -> Result<()> {
        let store = match self.store.as_ref() {
            Some(v) => v,
            None => return Ok(()),
        };
        store.record_experiment(&self.record)?;
        store.record_map(&self.id, MetadataKind::Platform, platform)?;
        store.record_map(&self.id, MetadataKind::Environ, environ)?;
        store.record_map(&self.id, MetadataKind::Flags, flags)?;
        Ok(())
    }

    /// Mid-run store updates only warn.
    fn store_update<F>(&self, what: &str, update: F)
    where
        F: FnOnce(&dyn metadata::MetadataStore) -> Result<()>,
    {
        if let Some(store) = self.store.as_ref() {
            if let Err(e) = update(store.as_ref()) {
                warn!("experiment: Skipping {} metadata update ({:#})", what, &e);
            }
        }
    }

    fn repetition_dir(&self, phase: &str, rep: u32) -> Result<PathBuf> {
        let dir = self.dir.join(phase).join(rep.to_string());
        fs::create_dir_all(&dir)
            .map_err(|e| SwanError::Io(format!("creating {:?}: {}", &dir, &e)))?;
        Ok(dir)
    }

    /// Runs every repetition of `phase`. A failed repetition ends the
    /// experiment if stop-on-error is set, if it is a configuration error
    /// or if the program is exiting. Otherwise it is logged and counted.
    fn run_repetitions(&mut self, phase: &mut dyn Phase, phase_id: &str) -> Result<()> {
        for rep in 0..self.cfg.repetitions {
            if prog_exiting() {
                bail!("interrupted before {} repetition {}", phase_id, rep);
            }
            let session = Session {
                experiment_id: self.id.clone(),
                phase_id: phase_id.to_string(),
                repetition: rep,
                dir: self.repetition_dir(phase_id, rep)?,
            };
            if let Err(e) = phase.run(&session) {
                if self.cfg.stop_on_error || is_config_error(&e) || prog_exiting() {
                    return Err(e.context(format!("{} repetition {}", phase.name(), rep)));
                }
                error!(
                    "experiment: {} repetition {} failed ({:#})",
                    phase.name(),
                    rep,
                    &e
                );
                self.nr_failures += 1;
            }
        }
        Ok(())
    }

    fn tune(&mut self, peak: &PeakLoad) -> Result<()> {
        let started_at = Instant::now();
        let mut tuning = TuningPhase::new(
            self.parts.hp.clone(),
            self.parts.lg.clone(),
            self.cfg.slo,
            peak.clone(),
        );
        self.run_repetitions(&mut tuning, TUNING_PHASE)?;
        tuning.finalize().context("tuning")?;
        self.record.tuning_duration = started_at.elapsed().as_secs_f64();
        let row = self.record.row();
        self.store_update("experiment", |s| s.record_experiment(&row));
        Ok(())
    }

    fn measure(&mut self, phase_id: &str, aggressors: &[Aggressor], peak: &PeakLoad) -> Result<()> {
        for load_point in 1..=self.cfg.load_points {
            let mut phase = MeasurementPhase::new(
                phase_id,
                self.parts.hp.clone(),
                aggressors.to_vec(),
                self.parts.lg.clone(),
                load_point,
                self.cfg.load_points,
                peak.clone(),
                self.cfg.load_duration,
            )
            .wait_timeout(self.cfg.lg_wait_timeout)
            .telemetry(self.parts.telemetry.clone());

            if load_point == 1 {
                let row = phase.record(&self.id);
                self.store_update("phase", |s| s.record_phase(&row));
                self.record.add_phase(row);
            }

            let res = self.run_repetitions(&mut phase, phase_id);
            for m in phase.measurements.drain(..) {
                self.store_update("measurement", |s| s.record_measurement(&m));
                if let Some(rec) = self.record.phase_mut(phase_id) {
                    rec.add_measurement(m);
                }
            }
            res?;
        }
        if let Some(rec) = self.record.phase_mut(phase_id) {
            rec.sort_measurements();
        }
        Ok(())
    }

    /// Tuning, if needed, followed by the measurement phases in the order
    /// the aggressors were given.
    pub fn run(&mut self) -> Result<()> {
        let peak = PeakLoad::new(self.cfg.peak_load);
        match peak.get() {
            Some(v) => info!("experiment: Using peak load {} QPS", v),
            None => self.tune(&peak)?,
        }

        let sets = std::mem::take(&mut self.parts.aggressors);
        let ids = phase_ids(&sets);
        let res = sets
            .iter()
            .zip(ids.iter())
            .map(|(set, id)| self.measure(id, set, &peak))
            .find(|r| r.is_err())
            .unwrap_or(Ok(()));
        self.parts.aggressors = sets;
        res?;

        if self.nr_failures > 0 {
            warn!(
                "experiment: {} repetitions failed, see {:?}",
                self.nr_failures,
                self.dir.join(MASTER_LOG)
            );
        }
        info!("experiment: {} finished", &self.id);
        Ok(())
    }

    /// Writes the in-memory record next to the master log.
    pub fn save_record(&self) -> Result<()> {
        let path = self.dir.join(RECORD_FILE);
        self.record
            .save(&path)
            .with_context(|| format!("saving {:?}", &path))
    }

    pub fn record_path(&self) -> PathBuf {
        self.dir.join(RECORD_FILE)
    }
}

/// Directories in `work_dir`, for callers checking what a run left.
pub fn experiment_dirs(work_dir: &Path) -> Vec<PathBuf> {
    match fs::read_dir(work_dir) {
        Ok(rd) => rd
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect(),
        Err(_) => vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::mock::Journal;
    use crate::metadata::{FileStore, MetadataStore};
    use crate::phase::tests::{listen, mock_setup, stress_aggressor};
    use crate::workloads::Workload;

    fn config(work_dir: &Path, load_points: u32, repetitions: u32, peak: i64) -> ExperimentConfig {
        ExperimentConfig {
            work_dir: work_dir.to_path_buf(),
            load_points,
            repetitions,
            load_duration: Duration::from_secs(1),
            peak_load: Some(peak),
            ..Default::default()
        }
    }

    fn l1d(exec: crate::executor::ExecutorRef) -> Aggressor {
        Aggressor {
            id: Workload::L1d,
            ..stress_aggressor(exec)
        }
    }

    fn store(dir: &Path) -> Arc<FileStore> {
        Arc::new(FileStore::open(&dir.join("metadata"), 1, Duration::from_secs(1)).unwrap())
    }

    #[test]
    fn test_phase_ids() {
        let journal = Journal::default();
        let exec: crate::executor::ExecutorRef =
            Arc::new(crate::executor::mock::MockExecutor::new(&journal));
        let sets = vec![
            vec![l1d(exec.clone())],
            vec![],
            vec![stress_aggressor(exec)],
        ];
        assert_eq!(
            phase_ids(&sets),
            vec!["aggressor_nr_0", "baseline", "aggressor_nr_1"]
        );
    }

    #[test]
    fn test_baseline_only() {
        let dir = tempfile::TempDir::new().unwrap();
        let (_listener, port) = listen();
        let journal = Journal::default();
        let (hp, lg, _) = mock_setup(&journal, port, dir.path(), 0);
        let parts = ExperimentParts {
            hp,
            aggressors: vec![vec![]],
            lg,
            telemetry: None,
        };
        let store = store(dir.path());
        let mut exp = Experiment::create(config(dir.path(), 1, 1, 5000), parts)
            .unwrap()
            .with_store(store.clone());
        exp.record_metadata(BTreeMap::new(), BTreeMap::new(), BTreeMap::new())
            .unwrap();
        exp.run().unwrap();
        assert!(exp.dir.join("baseline/0").is_dir());

        let rec = store.get_experiment(&exp.id).unwrap();
        assert_eq!(rec.phases.len(), 1);
        assert_eq!(rec.phases[0].id, "baseline");
        assert!(rec.phases[0].aggressor_names.is_empty());
        assert_eq!(rec.phases[0].measurements.len(), 1);
        let m = &rec.phases[0].measurements[0];
        assert_eq!(m.load, 5000);
        assert!(!m.results.is_empty());
        assert_eq!(exp.nr_failures(), 0);
        exp.save_record().unwrap();
        assert_eq!(ExperimentRecord::load(exp.record_path()).unwrap(), rec);
    }

    #[test]
    fn test_aggressor_phases() {
        let dir = tempfile::TempDir::new().unwrap();
        let (_listener, port) = listen();
        let journal = Journal::default();
        let (hp, lg, exec) = mock_setup(&journal, port, dir.path(), 0);
        let parts = ExperimentParts {
            hp,
            aggressors: vec![vec![], vec![l1d(exec)]],
            lg,
            telemetry: None,
        };
        let store = store(dir.path());
        let mut exp = Experiment::create(config(dir.path(), 2, 2, 4000), parts)
            .unwrap()
            .with_store(store.clone());
        exp.record_metadata(BTreeMap::new(), BTreeMap::new(), BTreeMap::new())
            .unwrap();
        exp.run().unwrap();

        let rec = store.get_experiment(&exp.id).unwrap();
        let ids: Vec<&str> = rec.phases.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["baseline", "aggressor_nr_0"]);
        for phase in rec.phases.iter() {
            let loads: Vec<i64> = phase.measurements.iter().map(|m| m.load).collect();
            assert_eq!(loads, vec![2000, 2000, 4000, 4000]);
        }
        assert!(rec.phases[0].aggressor_names.is_empty());
        assert_eq!(rec.phases[1].aggressor_names, vec!["l1d".to_string()]);

        let nr_with_prefix = |events: Vec<String>, prefix: &str| {
            events.iter().filter(|e| e.starts_with(prefix)).count()
        };
        assert_eq!(nr_with_prefix(journal.commands(), "stress-ng"), 4);
        assert_eq!(nr_with_prefix(journal.events(), "stop stress-ng"), 4);
    }

    #[test]
    fn test_liveness_failure() {
        let dir = tempfile::TempDir::new().unwrap();
        let port = {
            let (_listener, port) = listen();
            port
        };
        for &stop_on_error in &[true, false] {
            let journal = Journal::default();
            let (hp, lg, _) = mock_setup(&journal, port, dir.path(), 0);
            let parts = ExperimentParts {
                hp,
                aggressors: vec![vec![]],
                lg,
                telemetry: None,
            };
            let cfg = ExperimentConfig {
                stop_on_error,
                ..config(dir.path(), 1, 2, 1000)
            };
            let mut exp = Experiment::create(cfg, parts).unwrap();
            let res = exp.run();

            if stop_on_error {
                let err = res.unwrap_err();
                assert!(matches!(
                    err.downcast_ref::<SwanError>(),
                    Some(SwanError::Liveness(..))
                ));
                assert_eq!(journal.commands().len(), 1);
            } else {
                res.unwrap();
                assert_eq!(exp.nr_failures(), 2);
                assert_eq!(journal.commands().len(), 2);
                assert!(exp.record().phases[0].measurements.is_empty());
            }
            assert!(journal.commands().iter().all(|c| c.starts_with("memcached")));
            assert_eq!(journal.count("stop"), journal.commands().len());
            assert_eq!(journal.count("clean"), journal.commands().len());
            assert_eq!(journal.count("erase"), journal.commands().len());
        }
    }

    #[test]
    fn test_config_from_flags_defaults() {
        let cfg = ExperimentConfig::from_flags().unwrap();
        assert_eq!(cfg.slo, 5000);
        assert_eq!(cfg.load_points, 10);
        assert_eq!(cfg.peak_load, None);
    }
}
