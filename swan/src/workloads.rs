// Copyright (c) Facebook, Inc. and its affiliates.

// The individual workloads under workloads/ inherit all uses from this
// file. Make common stuff available.
use anyhow::{bail, Context, Result};
use log::{debug, info};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::SwanError;
use crate::executor::{ExecutorFactory, ExecutorRef, ServiceHandle, TaskHandle};
use crate::isolation::{Decorator, DecoratorRef, Decorators, Parallel, WorkloadIsolations};
use swan_util::conf::{self, Flag};

pub mod caffe;
pub mod ibench;
pub mod memcached;
pub mod specjbb;
pub mod stream;
pub mod stressng;

/// Builds a command line from its configuration and starts it on an
/// executor. Launchers hold no state across launches.
pub trait Launcher: Send + Sync {
    fn name(&self) -> String;

    /// Configuration snapshot recorded with the phase metadata.
    fn parameters(&self) -> String;

    fn launch(&self) -> Result<Box<dyn TaskHandle>>;
}

pub type LauncherRef = Arc<dyn Launcher>;

/// Marks the launched task as long-lived. The phase has to stop it and a
/// task found dead at that point is reported as an error.
pub struct ServiceLauncher {
    inner: LauncherRef,
}

impl ServiceLauncher {
    pub fn wrap(inner: LauncherRef) -> LauncherRef {
        Arc::new(Self { inner })
    }
}

impl Launcher for ServiceLauncher {
    fn name(&self) -> String {
        self.inner.name()
    }

    fn parameters(&self) -> String {
        self.inner.parameters()
    }

    fn launch(&self) -> Result<Box<dyn TaskHandle>> {
        Ok(ServiceHandle::boxed(self.inner.launch()?))
    }
}

lazy_static::lazy_static! {
    pub static ref BE_WORKLOADS: Flag<Vec<String>> = conf::slice_flag(
        "experiment_be_workloads",
        "Best effort workloads run one at a time next to the high priority workload. \
         stress-ng-cache-l1 needs HyperThreads; l1d, l1i, l3, membw and stream need iBench and STREAM",
        &["None", "stress-ng-cache-l3", "stress-ng-memcpy", "stress-ng-stream", "caffe"],
    );
    static ref BE_AS_SERVICE: Flag<bool> = conf::bool_flag(
        "debug_treat_be_as_service",
        "Debug only: track best effort workloads as services so their premature exit is detected",
        true,
    );
    static ref L1D_PROCESSES: Flag<i64> = conf::int_flag(
        "experiment_be_l1d_processes_number",
        "Number of L1 data cache best effort processes to be run",
        1,
    );
    static ref L1I_PROCESSES: Flag<i64> = conf::int_flag(
        "experiment_be_l1i_processes_number",
        "Number of L1 instruction cache best effort processes to be run",
        1,
    );
    static ref L3_PROCESSES: Flag<i64> = conf::int_flag(
        "experiment_be_l3_processes_number",
        "Number of L3 data cache best effort processes to be run",
        1,
    );
    static ref MEMBW_PROCESSES: Flag<i64> = conf::int_flag(
        "experiment_be_membw_processes_number",
        "Number of memory bandwidth best effort processes to be run",
        1,
    );
    pub static ref HP_WORKLOAD: Flag<String> = conf::string_flag(
        "experiment_hp_workload",
        "High priority workload, memcached or specjbb",
        "memcached",
    );
}

pub fn register_flags() {
    lazy_static::initialize(&BE_WORKLOADS);
    lazy_static::initialize(&BE_AS_SERVICE);
    lazy_static::initialize(&L1D_PROCESSES);
    lazy_static::initialize(&L1I_PROCESSES);
    lazy_static::initialize(&L3_PROCESSES);
    lazy_static::initialize(&MEMBW_PROCESSES);
    lazy_static::initialize(&HP_WORKLOAD);
    caffe::register_flags();
    ibench::register_flags();
    memcached::register_flags();
    specjbb::register_flags();
    stream::register_flags();
    stressng::register_flags();
}

/// Thread placement class of a best effort workload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Placement {
    L1,
    Llc,
    Unisolated,
}

/// Every workload the harness can run, by the identifier used on the
/// command line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Workload {
    Memcached,
    Specjbb,
    L1d,
    L1i,
    L3,
    MemBw,
    Stream,
    Caffe,
    CaffeIsolated,
    StressNg(stressng::StressKind),
    None,
}

impl FromStr for Workload {
    type Err = anyhow::Error;

    fn from_str(input: &str) -> Result<Self> {
        Ok(match input {
            "memcached" => Self::Memcached,
            "specjbb" => Self::Specjbb,
            "l1d" => Self::L1d,
            "l1i" => Self::L1i,
            "l3" => Self::L3,
            "membw" => Self::MemBw,
            "stream" => Self::Stream,
            "caffe" => Self::Caffe,
            "caffe-isolated" => Self::CaffeIsolated,
            "None" => Self::None,
            v => match v.parse::<stressng::StressKind>() {
                Ok(kind) => Self::StressNg(kind),
                Err(_) => {
                    return Err(SwanError::Config(format!("unknown workload {:?}", v)).into())
                }
            },
        })
    }
}

impl fmt::Display for Workload {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Memcached => write!(f, "memcached"),
            Self::Specjbb => write!(f, "specjbb"),
            Self::L1d => write!(f, "l1d"),
            Self::L1i => write!(f, "l1i"),
            Self::L3 => write!(f, "l3"),
            Self::MemBw => write!(f, "membw"),
            Self::Stream => write!(f, "stream"),
            Self::Caffe => write!(f, "caffe"),
            Self::CaffeIsolated => write!(f, "caffe-isolated"),
            Self::StressNg(kind) => write!(f, "{}", kind),
            Self::None => write!(f, "None"),
        }
    }
}

fn nr_processes(flag: &Flag<i64>) -> Result<u32> {
    let nr = flag.value();
    if nr < 1 {
        bail!(SwanError::Config(format!("{} must be at least 1", flag.name())));
    }
    Ok(nr as u32)
}

impl Workload {
    pub fn is_high_priority(&self) -> bool {
        matches!(self, Self::Memcached | Self::Specjbb)
    }

    pub fn placement(&self) -> Placement {
        match self {
            Self::L1d | Self::L1i | Self::StressNg(stressng::StressKind::CacheL1) => Placement::L1,
            Self::Caffe => Placement::Unisolated,
            _ => Placement::Llc,
        }
    }

    /// Number of parallel copies requested for the iBench aggressors.
    pub fn nr_processes(&self) -> Result<u32> {
        match self {
            Self::L1d => nr_processes(&L1D_PROCESSES),
            Self::L1i => nr_processes(&L1I_PROCESSES),
            Self::L3 => nr_processes(&L3_PROCESSES),
            Self::MemBw => nr_processes(&MEMBW_PROCESSES),
            _ => Ok(1),
        }
    }

    /// Decorators of a best effort workload: its placement followed by a
    /// `parallel(N)` wrapper when more than one copy is requested.
    pub fn decorators(&self, isolations: &WorkloadIsolations) -> Result<Decorators> {
        let mut decorators = match self.placement() {
            Placement::L1 => Decorators::new().push(isolations.be_l1.clone()),
            Placement::Llc => Decorators::new().push(isolations.be_llc.clone()),
            Placement::Unisolated => Decorators::new(),
        };
        let nr = self.nr_processes()?;
        if nr != 1 {
            decorators = decorators.push(Arc::new(Parallel::new(nr)));
        }
        Ok(decorators)
    }

    /// Launcher of a best effort workload on `exec`. `None` has none.
    pub fn best_effort_launcher(&self, exec: ExecutorRef) -> Result<Option<LauncherRef>> {
        let launcher: LauncherRef = match self {
            Self::None => return Ok(None),
            Self::Memcached | Self::Specjbb => {
                bail!(SwanError::Config(format!("{} is not a best effort workload", self)))
            }
            Self::L1d => Arc::new(ibench::IBench::new(exec, ibench::IBenchConfig::l1d())?),
            Self::L1i => Arc::new(ibench::L1i::new(exec, ibench::L1iConfig::from_flags())?),
            Self::L3 => Arc::new(ibench::IBench::new(exec, ibench::IBenchConfig::l3())?),
            Self::MemBw => Arc::new(ibench::IBench::new(exec, ibench::IBenchConfig::membw())?),
            Self::Stream => Arc::new(stream::Stream::new(exec, stream::StreamConfig::from_flags())),
            Self::Caffe => Arc::new(caffe::Caffe::new(exec, caffe::CaffeConfig::from_flags())),
            Self::CaffeIsolated => {
                let mut cfg = caffe::CaffeConfig::from_flags();
                cfg.name = "Caffe isolated".into();
                Arc::new(caffe::Caffe::new(exec, cfg))
            }
            Self::StressNg(kind) => Arc::new(stressng::StressNg::new(exec, *kind)),
        };
        Ok(Some(launcher))
    }
}

/// A best effort workload ready to be launched in aggressor phases.
#[derive(Clone)]
pub struct Aggressor {
    pub id: Workload,
    pub launcher: LauncherRef,
    pub isolation: String,
}

impl std::fmt::Debug for Aggressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggressor")
            .field("id", &self.id)
            .field("isolation", &self.isolation)
            .finish_non_exhaustive()
    }
}

impl Aggressor {
    pub fn name(&self) -> String {
        self.id.to_string()
    }
}

/// Builds aggressors from workload identifiers, placing L1 aggressors on
/// the HP siblings and everything else on the shared cache threads.
pub struct AggressorFactory<'a> {
    pub isolations: &'a WorkloadIsolations,
    pub executors: &'a dyn ExecutorFactory,
    pub as_service: bool,
}

impl<'a> AggressorFactory<'a> {
    pub fn new(isolations: &'a WorkloadIsolations, executors: &'a dyn ExecutorFactory) -> Self {
        Self {
            isolations,
            executors,
            as_service: BE_AS_SERVICE.value(),
        }
    }

    pub fn create(&self, name: &str) -> Result<Option<Aggressor>> {
        let id: Workload = name.parse()?;
        if id == Workload::None {
            return Ok(None);
        }
        if id.is_high_priority() {
            bail!(SwanError::Config(format!("{} is not a best effort workload", &id)));
        }
        let decorators = id.decorators(self.isolations)?;
        let isolation = decorators.describe();
        let exec = self.executors.best_effort(decorators)?;
        let mut launcher = match id.best_effort_launcher(exec)? {
            Some(v) => v,
            None => return Ok(None),
        };
        if self.as_service {
            launcher = ServiceLauncher::wrap(launcher);
        }
        debug!("workloads: Aggressor {} isolated as {:?}", &id, &isolation);
        Ok(Some(Aggressor {
            id,
            launcher,
            isolation,
        }))
    }

    /// Aggressor sets in input order. `None` yields the empty set of the
    /// baseline.
    pub fn create_all<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<Vec<Aggressor>>> {
        let mut sets = vec![];
        for name in names.iter() {
            match self.create(name.as_ref())? {
                Some(aggr) => sets.push(vec![aggr]),
                None => sets.push(vec![]),
            }
        }
        Ok(sets)
    }
}

/// The latency critical workload of an experiment together with the
/// isolation it runs under.
#[derive(Clone)]
pub struct HighPriority {
    pub id: Workload,
    pub launcher: LauncherRef,
    pub isolation: String,
}

pub fn high_priority(
    name: &str,
    isolation: DecoratorRef,
    executors: &dyn ExecutorFactory,
) -> Result<HighPriority> {
    let id: Workload = name.parse()?;
    let decorators = Decorators::new().push(isolation);
    let desc = decorators.describe();
    let exec = executors.high_priority(decorators)?;
    let launcher: LauncherRef = match id {
        Workload::Memcached => Arc::new(memcached::Memcached::new(
            exec,
            memcached::MemcachedConfig::from_flags(),
        )?),
        Workload::Specjbb => Arc::new(specjbb::Backend::new(
            exec,
            specjbb::BackendConfig::from_flags(),
        )),
        v => bail!(SwanError::Config(format!(
            "{} is not a high priority workload",
            v
        ))),
    };
    info!("workloads: High priority workload {} isolated as {:?}", &id, &desc);
    Ok(HighPriority {
        id,
        launcher: ServiceLauncher::wrap(launcher),
        isolation: desc,
    })
}

/// Rejects non-positive run lengths in launcher configurations.
fn check_positive_duration(what: &str, dur: Duration) -> Result<()> {
    if dur.as_secs() == 0 {
        bail!(SwanError::Config(format!(
            "{}: duration {:?} must be at least one second",
            what, dur
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::mock::{Journal, MockExecutor};
    use crate::isolation::{IntSet, Taskset};

    struct MockFactory {
        journal: Journal,
    }

    impl ExecutorFactory for MockFactory {
        fn high_priority(&self, _decorators: Decorators) -> Result<ExecutorRef> {
            Ok(Arc::new(MockExecutor::new(&self.journal)))
        }

        fn best_effort(&self, _decorators: Decorators) -> Result<ExecutorRef> {
            Ok(Arc::new(MockExecutor::new(&self.journal)))
        }
    }

    fn isolations() -> WorkloadIsolations {
        let set = |s: &str| s.parse::<IntSet>().unwrap();
        WorkloadIsolations {
            hp: Arc::new(Taskset::new(set("0-1")).unwrap()),
            be_l1: Arc::new(Taskset::new(set("6-7")).unwrap()),
            be_llc: Arc::new(Taskset::new(set("2")).unwrap()),
        }
    }

    #[test]
    fn test_workload_ids() {
        for name in &[
            "memcached",
            "specjbb",
            "l1d",
            "l1i",
            "l3",
            "membw",
            "stream",
            "caffe",
            "caffe-isolated",
            "stress-ng-cache-l1",
            "stress-ng-cache-l3",
            "stress-ng-memcpy",
            "stress-ng-stream",
            "None",
        ] {
            let w: Workload = name.parse().unwrap();
            assert_eq!(&w.to_string(), name);
        }
        let err = "bogus".parse::<Workload>().unwrap_err();
        assert!(crate::error::is_config_error(&err));
    }

    #[test]
    fn test_placement() {
        let iso = isolations();
        for pair in &[
            ("l1d", "taskset -c 6,7 x"),
            ("stress-ng-cache-l1", "taskset -c 6,7 x"),
            ("l3", "taskset -c 2 x"),
            ("caffe-isolated", "taskset -c 2 x"),
            ("caffe", "x"),
        ] {
            let w: Workload = pair.0.parse().unwrap();
            assert_eq!(w.decorators(&iso).unwrap().decorate("x"), pair.1);
        }
    }

    #[test]
    fn test_aggressor_factory() {
        let journal = Journal::default();
        let factory = MockFactory {
            journal: journal.clone(),
        };
        let iso = isolations();
        let aggrs = AggressorFactory {
            isolations: &iso,
            executors: &factory,
            as_service: true,
        };
        let sets = aggrs.create_all(&["None", "stress-ng-stream"]).unwrap();
        assert_eq!(sets.len(), 2);
        assert!(sets[0].is_empty());
        assert_eq!(sets[1][0].name(), "stress-ng-stream");
        assert_eq!(sets[1][0].isolation, "taskset -c 2");

        let mut h = sets[1][0].launcher.launch().unwrap();
        assert_eq!(journal.commands(), vec!["stress-ng --stream=1"]);
        h.stop().unwrap();

        assert_eq!(sets[1][0].launcher.name(), "stress-ng-stream");
        for name in &["memcached", "specjbb"] {
            let err = aggrs.create(name).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<SwanError>(),
                Some(SwanError::Config(_))
            ));
        }
        assert!(aggrs.create("nope").is_err());
    }

    #[test]
    fn test_high_priority_rejects_aggressors() {
        let factory = MockFactory {
            journal: Journal::default(),
        };
        let hp = Arc::new(Taskset::new("0".parse().unwrap()).unwrap());
        assert!(high_priority("l1d", hp.clone(), &factory).is_err());
        let hp = high_priority("specjbb", hp, &factory).unwrap();
        assert_eq!(hp.id, Workload::Specjbb);
        assert!(hp.id.is_high_priority());
        assert_eq!(hp.launcher.name(), "SPECjbb Backend");
        assert_eq!(hp.isolation, "taskset -c 0");
    }
}
