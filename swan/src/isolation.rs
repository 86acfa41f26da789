// Copyright (c) Facebook, Inc. and its affiliates.
//! Command decorators which place a workload into its isolation before it
//! is handed to an executor. Every decorator is a pure string transform;
//! the wrapping tools `exec` into the inner command so its exit status is
//! what the executor observes.
use anyhow::{bail, Result};
use log::debug;
use std::fmt;
use std::process::Command;
use std::sync::Arc;

use crate::error::SwanError;
use swan_util::*;

pub mod intset;
pub mod planner;
pub mod topo;

pub use intset::IntSet;
pub use planner::{plan, plan_from_flags, CpuPlan, ManualPlacement};

pub trait Decorator: fmt::Debug + Send + Sync {
    fn decorate(&self, command: &str) -> String;

    /// Short description recorded with the experiment metadata.
    fn describe(&self) -> String {
        self.decorate("").trim().to_string()
    }
}

pub type DecoratorRef = Arc<dyn Decorator>;

/// Pins the command to an explicit thread set.
#[derive(Clone, Debug, PartialEq)]
pub struct Taskset {
    pub cpus: IntSet,
}

impl Taskset {
    pub fn new(cpus: IntSet) -> Result<Self> {
        if cpus.is_empty() {
            bail!("Empty thread set specified for taskset");
        }
        Ok(Self { cpus })
    }
}

impl Decorator for Taskset {
    fn decorate(&self, command: &str) -> String {
        format!("taskset -c {} {}", self.cpus.to_list_string(), command)
    }
}

pub const CPUSET_CONTROLLER: &str = "cpuset";
pub const CPU_CONTROLLER: &str = "cpu";
pub const MEMORY_CONTROLLER: &str = "memory";

/// Runs the command inside an existing cgroup.
#[derive(Clone, Debug, PartialEq)]
pub struct Cgroup {
    pub controllers: Vec<String>,
    pub path: String,
}

impl Cgroup {
    pub fn new(controllers: &[&str], path: &str) -> Result<Self> {
        if controllers.is_empty() {
            bail!("No controllers specified for cgroup");
        }
        if path.is_empty() {
            bail!("Empty path specified for cgroup");
        }
        let path = match path.starts_with('/') {
            true => path.to_string(),
            false => format!("/{}", path),
        };
        Ok(Self {
            controllers: controllers.iter().map(|s| s.to_string()).collect(),
            path,
        })
    }

    pub fn spec(&self) -> String {
        format!("{}:{}", self.controllers.join(","), &self.path)
    }
}

impl Decorator for Cgroup {
    fn decorate(&self, command: &str) -> String {
        format!("cgexec -g {} {}", self.spec(), command)
    }
}

/// cpuset cgroup with its cpus and memory nodes, managed through the
/// libcgroup tools.
#[derive(Clone, Debug, PartialEq)]
pub struct CpusetCgroup {
    pub cgroup: Cgroup,
    pub cpus: IntSet,
    pub mems: IntSet,
}

impl CpusetCgroup {
    pub fn new(path: &str, cpus: IntSet, mems: IntSet) -> Result<Self> {
        if cpus.is_empty() {
            bail!("Empty set of cpus provided");
        }
        if mems.is_empty() {
            bail!("Empty set of memory nodes provided");
        }
        Ok(Self {
            cgroup: Cgroup::new(&[CPUSET_CONTROLLER], path)?,
            cpus,
            mems,
        })
    }

    pub fn create(&self) -> Result<()> {
        run_command(
            Command::new("cgcreate").args(&["-g", &self.cgroup.spec()]),
            "failed to create cgroup",
        )?;
        let res = self.set("cpuset.cpus", &self.cpus.to_string()).and_then(|_| {
            self.set("cpuset.mems", &self.mems.to_string())
        });
        if let Err(e) = res {
            if let Err(e) = self.destroy() {
                log::warn!("isolation: Failed to remove {} ({:#})", self.cgroup.spec(), &e);
            }
            return Err(e);
        }
        Ok(())
    }

    fn set(&self, name: &str, value: &str) -> Result<()> {
        run_command(
            Command::new("cgset").args(&["-r", &format!("{}={}", name, value), &self.cgroup.path]),
            "failed to configure cgroup",
        )
    }

    pub fn destroy(&self) -> Result<()> {
        run_command(
            Command::new("cgdelete").args(&["--recursive", "-g", &self.cgroup.spec()]),
            "failed to delete cgroup",
        )
    }
}

impl Decorator for CpusetCgroup {
    fn decorate(&self, command: &str) -> String {
        self.cgroup.decorate(command)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NamespaceKind {
    Pid,
    Ipc,
    Mount,
    Uts,
    Net,
    User,
}

impl NamespaceKind {
    fn option(&self) -> &'static str {
        match self {
            Self::Pid => "--fork --pid --mount-proc",
            Self::Ipc => "--ipc",
            Self::Mount => "--mount",
            Self::Uts => "--uts",
            Self::Net => "--net",
            Self::User => "--user",
        }
    }
}

/// Runs the command inside freshly unshared namespaces.
#[derive(Clone, Debug, PartialEq)]
pub struct Namespace {
    kinds: Vec<NamespaceKind>,
}

impl Namespace {
    pub fn new(kinds: &[NamespaceKind]) -> Result<Self> {
        if kinds.is_empty() {
            bail!("Invalid namespace mask");
        }
        let mut uniq = vec![];
        for k in kinds {
            if !uniq.contains(k) {
                uniq.push(*k);
            }
        }
        Ok(Self { kinds: uniq })
    }
}

impl Decorator for Namespace {
    fn decorate(&self, command: &str) -> String {
        let opts: Vec<&str> = self.kinds.iter().map(|k| k.option()).collect();
        format!("unshare {} {}", opts.join(" "), command)
    }
}

/// Cache allocation through intel-cmt-cat.
#[derive(Clone, Debug, PartialEq)]
pub struct Rdtset {
    pub cpus: IntSet,
    pub mask: u64,
}

impl Decorator for Rdtset {
    fn decorate(&self, command: &str) -> String {
        let range = self.cpus.to_string();
        format!(
            "rdtset -v -c {} -t 'l3={:#x};cpu={}' {}",
            &range, self.mask, &range, command
        )
    }
}

/// Resets all cache allocation assignments.
pub fn clean_rdt_assignments() -> Result<String> {
    command_output(Command::new("pqos").arg("-R"))
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Numactl {
    pub all: bool,
    pub localalloc: bool,
    pub interleave: IntSet,
    pub membind: IntSet,
    pub cpunodebind: IntSet,
    pub physcpubind: IntSet,
    pub preferred: Option<u32>,
}

impl Decorator for Numactl {
    fn decorate(&self, command: &str) -> String {
        let mut opts = vec![];
        if self.all {
            opts.push("-a".to_string());
        }
        if self.localalloc {
            opts.push("-l".to_string());
        }
        for (opt, set) in &[
            ("-i", &self.interleave),
            ("-m", &self.membind),
            ("-C", &self.physcpubind),
            ("-N", &self.cpunodebind),
        ] {
            if !set.is_empty() {
                opts.push(format!("{} {}", opt, set.to_list_string()));
            }
        }
        if let Some(node) = self.preferred {
            opts.push(format!("--preferred={}", node));
        }
        format!("numactl {} -- {}", opts.join(" "), command)
    }
}

/// Runs `nr` copies of the command in a private pid namespace and waits
/// for all of them.
#[derive(Clone, Debug, PartialEq)]
pub struct Parallel {
    pub nr: u32,
}

impl Parallel {
    pub fn new(nr: u32) -> Self {
        Self { nr }
    }
}

impl Decorator for Parallel {
    fn decorate(&self, command: &str) -> String {
        debug!("isolation: Running {:?} {} times", command, self.nr);
        let inner = format!(
            "seq {} | xargs -P {} -I{{}} sh -c {}",
            self.nr,
            self.nr,
            shell_quote(command)
        );
        format!(
            "unshare --fork --pid --mount-proc sh -c {}",
            shell_quote(&inner)
        )
    }

    fn describe(&self) -> String {
        format!("parallel({})", self.nr)
    }
}

/// Ordered decorator list. The first entry wraps outermost so that
/// `[a, b].decorate(c) == a.decorate(b.decorate(c))`.
#[derive(Clone, Debug, Default)]
pub struct Decorators(pub Vec<DecoratorRef>);

impl Decorators {
    pub fn new() -> Self {
        Self(vec![])
    }

    pub fn push(mut self, decorator: DecoratorRef) -> Self {
        self.0.push(decorator);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Decorator for Decorators {
    fn decorate(&self, command: &str) -> String {
        self.0
            .iter()
            .rev()
            .fold(command.to_string(), |cmd, d| d.decorate(&cmd))
    }

    fn describe(&self) -> String {
        self.0
            .iter()
            .map(|d| d.describe())
            .collect::<Vec<String>>()
            .join(" | ")
    }
}

pub fn compose(outer: DecoratorRef, inner: DecoratorRef) -> Decorators {
    Decorators(vec![outer, inner])
}

/// Thread placement of the three workload classes as decorators.
#[derive(Clone, Debug)]
pub struct WorkloadIsolations {
    pub hp: DecoratorRef,
    pub be_l1: DecoratorRef,
    pub be_llc: DecoratorRef,
}

impl WorkloadIsolations {
    /// Every class needs at least one thread.
    pub fn from_plan(plan: &CpuPlan) -> Result<Self> {
        let taskset = |class: &str, cpus: &IntSet| -> Result<DecoratorRef> {
            match Taskset::new(cpus.clone()) {
                Ok(v) => Ok(Arc::new(v)),
                Err(e) => Err(SwanError::Config(format!("{} placement: {:#}", class, &e)).into()),
            }
        };
        Ok(Self {
            hp: taskset("HP", &plan.hp)?,
            be_l1: taskset("BE-L1", &plan.be_l1)?,
            be_llc: taskset("BE-LLC", &plan.be_llc)?,
        })
    }
}

pub fn register_flags() {
    planner::register_flags();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(s: &str) -> IntSet {
        s.parse().unwrap()
    }

    #[test]
    fn test_taskset() {
        let t = Taskset::new(set("0-2,5")).unwrap();
        assert_eq!(t.decorate("sleep 1"), "taskset -c 0,1,2,5 sleep 1");
        assert!(Taskset::new(IntSet::new()).is_err());
    }

    #[test]
    fn test_isolations_reject_empty_class() {
        let plan = CpuPlan {
            hp: set("0"),
            be_l1: set("1"),
            be_llc: set("2"),
        };
        let iso = WorkloadIsolations::from_plan(&plan).unwrap();
        assert_eq!(iso.be_llc.decorate("ls"), "taskset -c 2 ls");

        let plan = CpuPlan {
            be_llc: IntSet::new(),
            ..plan
        };
        let err = WorkloadIsolations::from_plan(&plan).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SwanError>(),
            Some(SwanError::Config(_))
        ));
    }

    #[test]
    fn test_cgroup_and_namespace() {
        let cg = Cgroup::new(&[CPUSET_CONTROLLER, MEMORY_CONTROLLER], "swan/hp").unwrap();
        assert_eq!(cg.decorate("ls"), "cgexec -g cpuset,memory:/swan/hp ls");
        assert!(Cgroup::new(&[], "x").is_err());
        assert!(CpusetCgroup::new("x", IntSet::new(), set("0")).is_err());

        let ns = Namespace::new(&[NamespaceKind::Pid, NamespaceKind::Net]).unwrap();
        assert_eq!(
            ns.decorate("ls"),
            "unshare --fork --pid --mount-proc --net ls"
        );
        assert!(Namespace::new(&[]).is_err());
    }

    #[test]
    fn test_rdtset_numactl() {
        let r = Rdtset {
            cpus: set("0-3"),
            mask: 0xf,
        };
        assert_eq!(r.decorate("ls"), "rdtset -v -c 0-3 -t 'l3=0xf;cpu=0-3' ls");

        let n = Numactl {
            membind: set("0"),
            physcpubind: set("1-2"),
            ..Default::default()
        };
        assert_eq!(n.decorate("ls"), "numactl -m 0 -C 1,2 -- ls");
    }

    #[test]
    fn test_parallel() {
        let p = Parallel::new(3);
        assert_eq!(
            p.decorate("echo hi"),
            "unshare --fork --pid --mount-proc sh -c \
             'seq 3 | xargs -P 3 -I{} sh -c '\\''echo hi'\\'''"
        );
    }

    #[test]
    fn test_composition_is_left_associative() {
        let a: DecoratorRef = Arc::new(Taskset::new(set("1")).unwrap());
        let b: DecoratorRef = Arc::new(Namespace::new(&[NamespaceKind::Ipc]).unwrap());
        let c = "memcached -p 11211";
        assert_eq!(
            compose(a.clone(), b.clone()).decorate(c),
            a.decorate(&b.decorate(c))
        );
        assert_eq!(
            compose(a.clone(), b.clone()).decorate(c),
            "taskset -c 1 unshare --ipc memcached -p 11211"
        );
        assert_eq!(Decorators::new().decorate(c), c);
        assert_eq!(
            Decorators::new().push(a).push(b).describe(),
            "taskset -c 1 | unshare --ipc"
        );
    }
}
