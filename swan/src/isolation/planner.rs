// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::Result;
use log::{debug, info, warn};

use super::topo::ThreadSet;
use super::IntSet;
use crate::error::SwanError;
use swan_util::conf::{self, Flag};

lazy_static::lazy_static! {
    static ref HP_CPU_COUNT: Flag<i64> = conf::int_flag(
        "experiment_hp_workload_cpu_count",
        "Number of CPUs assigned to high priority task. CPUs will be assigned automatically to workloads.",
        1,
    );
    static ref BE_CPU_COUNT: Flag<i64> = conf::int_flag(
        "experiment_be_workload_cpu_count",
        "Number of CPUs assigned to best effort task. CPUs will be assigned automatically to workloads.",
        1,
    );
    static ref HP_RANGE: Flag<String> = conf::string_flag(
        "experiment_hp_workload_cpu_range",
        "HP cpuset range (e.g: 0-2). All three 'range' flags must be set to use this policy.",
        "",
    );
    static ref BE_LLC_RANGE: Flag<String> = conf::string_flag(
        "experiment_be_workload_l3_cpu_range",
        "BE cpuset range (e.g: 0-2) for workloads that are targeted as LLC-interfering workloads. All three 'range' flags must be set to use this policy.",
        "",
    );
    static ref BE_L1_RANGE: Flag<String> = conf::string_flag(
        "experiment_be_workload_l1_cpu_range",
        "BE cpuset range (e.g: 0-2) for workloads that are targeted as L1-interfering workloads. All three 'range' flags must be set to use this policy.",
        "",
    );
}

pub fn register_flags() {
    lazy_static::initialize(&HP_CPU_COUNT);
    lazy_static::initialize(&BE_CPU_COUNT);
    lazy_static::initialize(&HP_RANGE);
    lazy_static::initialize(&BE_LLC_RANGE);
    lazy_static::initialize(&BE_L1_RANGE);
}

/// Manually specified thread sets. Used only when all three are set.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ManualPlacement {
    pub hp: IntSet,
    pub be_llc: IntSet,
    pub be_l1: IntSet,
}

impl ManualPlacement {
    pub fn is_complete(&self) -> bool {
        !self.hp.is_empty() && !self.be_llc.is_empty() && !self.be_l1.is_empty()
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CpuPlan {
    pub hp: IntSet,
    pub be_l1: IntSet,
    pub be_llc: IntSet,
}

/// Allocates disjoint HP, BE-L1 and BE-LLC thread sets on `topo`.
pub fn plan(
    topo: &ThreadSet,
    hp_count: usize,
    be_count: usize,
    manual: &ManualPlacement,
) -> Result<CpuPlan> {
    if manual.is_complete() {
        info!("Using Manual Core Placement for workload isolation");
        let plan = CpuPlan {
            hp: manual.hp.clone(),
            be_l1: manual.be_l1.clone(),
            be_llc: manual.be_llc.clone(),
        };
        debug!(
            "isolation: HP={} BE-LLC={} BE-L1={}",
            &plan.hp, &plan.be_llc, &plan.be_l1
        );
        return Ok(plan);
    }

    let shared = topo.shared_cache_threads()?;
    let available = shared.available_threads();
    let hp = available.take(hp_count).map_err(|_| {
        SwanError::InsufficientCpus(format!(
            "there is not enough cpus to run HP task ({} required, {} available)",
            hp_count,
            available.len()
        ))
    })?;

    let hp_threads = topo.from_threads(&hp)?;
    let mut be_l1 = topo.siblings_of(&hp_threads).available_threads();

    let remaining = available.difference(&hp);
    let be_llc = remaining.take(be_count).map_err(|_| {
        SwanError::InsufficientCpus(format!(
            "cannot allocate remaining threads for BE task ({} required, {} left)",
            be_count,
            remaining.len()
        ))
    })?;

    if be_l1.is_empty() {
        warn!("Machine does not support HyperThreads. L1-Cache Best Effort workloads will use LLC threads");
        be_l1 = be_llc.clone();
    }

    info!("Using Automatic Core Placement for workload isolation");
    debug!(
        "isolation: HP={} BE-LLC={} BE-L1={}",
        &hp, &be_llc, &be_l1
    );
    Ok(CpuPlan { hp, be_l1, be_llc })
}

fn range_flag(flag: &Flag<String>) -> Result<IntSet> {
    flag.value().parse::<IntSet>().map_err(|e| {
        SwanError::Config(format!("flag {:?}: {:#}", flag.name(), &e)).into()
    })
}

/// Plans using the isolation flags and the host topology.
pub fn plan_from_flags() -> Result<CpuPlan> {
    let manual = ManualPlacement {
        hp: range_flag(&HP_RANGE)?,
        be_llc: range_flag(&BE_LLC_RANGE)?,
        be_l1: range_flag(&BE_L1_RANGE)?,
    };
    let count = |flag: &Flag<i64>| -> Result<usize> {
        let v = flag.value();
        if v < 0 {
            return Err(SwanError::Config(format!("flag {:?} must not be negative", flag.name())).into());
        }
        Ok(v as usize)
    };
    let (hp_count, be_count) = (count(&HP_CPU_COUNT)?, count(&BE_CPU_COUNT)?);

    let topo = if manual.is_complete() {
        ThreadSet::default()
    } else {
        ThreadSet::discover()?
    };
    plan(&topo, hp_count, be_count, &manual)
}

#[cfg(test)]
mod tests {
    use super::super::topo::LSCPU_2S_HT;
    use super::*;

    #[test]
    fn test_automatic_plan() {
        let topo = ThreadSet::parse_lscpu(LSCPU_2S_HT).unwrap();
        let plan = plan(&topo, 2, 1, &ManualPlacement::default()).unwrap();
        assert_eq!(plan.hp.to_string(), "0-1");
        assert_eq!(plan.be_l1.to_string(), "6-7");
        assert_eq!(plan.be_llc.to_string(), "2");
        assert!(plan.hp.intersection(&plan.be_llc).is_empty());
        assert!(plan.hp.intersection(&plan.be_l1).is_empty());
    }

    #[test]
    fn test_insufficient_cpus() {
        let topo = ThreadSet::parse_lscpu(LSCPU_2S_HT).unwrap();
        for (hp, be) in &[(5, 1), (3, 2)] {
            let err = plan(&topo, *hp, *be, &ManualPlacement::default()).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<SwanError>(),
                Some(SwanError::InsufficientCpus(_))
            ));
        }
    }

    #[test]
    fn test_no_hyperthreads_falls_back_to_llc() {
        let topo = ThreadSet::parse_lscpu("0,0,0\n1,1,0\n2,2,0\n3,3,0\n").unwrap();
        let plan = plan(&topo, 1, 2, &ManualPlacement::default()).unwrap();
        assert_eq!(plan.hp.to_string(), "0");
        assert_eq!(plan.be_llc.to_string(), "1-2");
        assert_eq!(plan.be_l1, plan.be_llc);
    }

    #[test]
    fn test_manual_plan_needs_all_three() {
        let topo = ThreadSet::parse_lscpu(LSCPU_2S_HT).unwrap();
        let manual = ManualPlacement {
            hp: "8-9".parse().unwrap(),
            be_llc: "10".parse().unwrap(),
            be_l1: "11".parse().unwrap(),
        };
        let plan_m = plan(&topo, 1, 1, &manual).unwrap();
        assert_eq!(plan_m.hp.to_string(), "8-9");
        assert_eq!(plan_m.be_l1.to_string(), "11");

        let partial = ManualPlacement {
            be_l1: IntSet::new(),
            ..manual
        };
        let plan_a = plan(&topo, 1, 1, &partial).unwrap();
        assert_eq!(plan_a.hp.to_string(), "0");
    }
}
