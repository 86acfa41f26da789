// Copyright (c) Facebook, Inc. and its affiliates.
//! iBench interference generators. `l1d`, `l3` and `memBw` take their run
//! length in seconds, `l1i` an iteration count and an intensity.
use super::*;

pub const DEFAULT_DURATION: Duration = Duration::from_secs(86400);
pub const MAX_L1I_INTENSITY: u32 = 20;

lazy_static::lazy_static! {
    static ref L1D_PATH: Flag<String> = conf::string_flag(
        "l1d_path", "Path to the L1 data cache aggressor binary", "l1d");
    static ref L1D_DURATION: Flag<Duration> = conf::duration_flag(
        "l1d_duration", "Run length of the L1 data cache aggressor", DEFAULT_DURATION);
    static ref L3_PATH: Flag<String> = conf::string_flag(
        "l3_path", "Path to the L3 cache aggressor binary", "l3");
    static ref L3_DURATION: Flag<Duration> = conf::duration_flag(
        "l3_duration", "Run length of the L3 cache aggressor", DEFAULT_DURATION);
    static ref MEMBW_PATH: Flag<String> = conf::string_flag(
        "membw_path", "Path to the memory bandwidth aggressor binary", "memBw");
    static ref MEMBW_DURATION: Flag<Duration> = conf::duration_flag(
        "membw_duration", "Run length of the memory bandwidth aggressor", DEFAULT_DURATION);
    static ref L1I_PATH: Flag<String> = conf::string_flag(
        "l1i_path", "Path to the L1 instruction cache aggressor binary", "l1i");
    static ref L1I_ITERATIONS: Flag<i64> = conf::int_flag(
        "l1i_iterations", "Number of iterations of the L1 instruction cache aggressor",
        i32::MAX as i64);
    static ref L1I_INTENSITY: Flag<i64> = conf::int_flag(
        "l1i_intensity", "Intensity of the L1 instruction cache aggressor (0-20)", 20);
}

pub fn register_flags() {
    lazy_static::initialize(&L1D_PATH);
    lazy_static::initialize(&L1D_DURATION);
    lazy_static::initialize(&L3_PATH);
    lazy_static::initialize(&L3_DURATION);
    lazy_static::initialize(&MEMBW_PATH);
    lazy_static::initialize(&MEMBW_DURATION);
    lazy_static::initialize(&L1I_PATH);
    lazy_static::initialize(&L1I_ITERATIONS);
    lazy_static::initialize(&L1I_INTENSITY);
}

#[derive(Clone, Debug, PartialEq)]
pub struct IBenchConfig {
    pub name: String,
    pub path: String,
    pub duration: Duration,
}

impl IBenchConfig {
    pub fn l1d() -> Self {
        Self {
            name: "L1 Data".into(),
            path: L1D_PATH.value(),
            duration: L1D_DURATION.value(),
        }
    }

    pub fn l3() -> Self {
        Self {
            name: "L3 Data".into(),
            path: L3_PATH.value(),
            duration: L3_DURATION.value(),
        }
    }

    pub fn membw() -> Self {
        Self {
            name: "Memory Bandwidth".into(),
            path: MEMBW_PATH.value(),
            duration: MEMBW_DURATION.value(),
        }
    }

    pub fn command(&self) -> String {
        format!("{} {}", &self.path, self.duration.as_secs())
    }
}

/// Duration driven aggressor: `l1d`, `l3` or `memBw`.
pub struct IBench {
    exec: ExecutorRef,
    cfg: IBenchConfig,
}

impl IBench {
    pub fn new(exec: ExecutorRef, cfg: IBenchConfig) -> Result<Self> {
        check_positive_duration(&cfg.name, cfg.duration)?;
        Ok(Self { exec, cfg })
    }
}

impl Launcher for IBench {
    fn name(&self) -> String {
        self.cfg.name.clone()
    }

    fn parameters(&self) -> String {
        self.cfg.command()
    }

    fn launch(&self) -> Result<Box<dyn TaskHandle>> {
        self.exec.execute(&self.cfg.command())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct L1iConfig {
    pub path: String,
    pub iterations: i64,
    pub intensity: i64,
}

impl L1iConfig {
    pub fn from_flags() -> Self {
        Self {
            path: L1I_PATH.value(),
            iterations: L1I_ITERATIONS.value(),
            intensity: L1I_INTENSITY.value(),
        }
    }

    pub fn command(&self) -> String {
        format!("{} {} {}", &self.path, self.iterations, self.intensity)
    }
}

pub struct L1i {
    exec: ExecutorRef,
    cfg: L1iConfig,
}

impl L1i {
    pub fn new(exec: ExecutorRef, cfg: L1iConfig) -> Result<Self> {
        if cfg.intensity < 0 || cfg.intensity > MAX_L1I_INTENSITY as i64 {
            bail!(SwanError::Config(format!(
                "l1i intensity {} out of range 0-{}",
                cfg.intensity, MAX_L1I_INTENSITY
            )));
        }
        if cfg.iterations < 1 || cfg.iterations > i32::MAX as i64 {
            bail!(SwanError::Config(format!(
                "l1i iterations {} out of range 1-{}",
                cfg.iterations,
                i32::MAX
            )));
        }
        Ok(Self { exec, cfg })
    }
}

impl Launcher for L1i {
    fn name(&self) -> String {
        "L1 Instruction".into()
    }

    fn parameters(&self) -> String {
        self.cfg.command()
    }

    fn launch(&self) -> Result<Box<dyn TaskHandle>> {
        self.exec.execute(&self.cfg.command())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::mock::{Journal, MockExecutor};

    fn mock() -> (Journal, ExecutorRef) {
        let journal = Journal::default();
        let exec = Arc::new(MockExecutor::new(&journal));
        (journal, exec)
    }

    #[test]
    fn test_ibench_command() {
        let (journal, exec) = mock();
        let cfg = IBenchConfig {
            name: "L3 Data".into(),
            path: "/opt/ibench/l3".into(),
            duration: Duration::from_secs(30),
        };
        let l3 = IBench::new(exec.clone(), cfg.clone()).unwrap();
        l3.launch().unwrap();
        assert_eq!(journal.commands(), vec!["/opt/ibench/l3 30"]);

        let zero = IBenchConfig {
            duration: Duration::from_millis(10),
            ..cfg
        };
        assert!(IBench::new(exec, zero).is_err());
    }

    #[test]
    fn test_l1i_ranges() {
        let (journal, exec) = mock();
        for (iterations, intensity, ok) in &[
            (1, 0, true),
            (i32::MAX as i64, 20, true),
            (0, 10, false),
            (i32::MAX as i64 + 1, 10, false),
            (10, 21, false),
            (10, -1, false),
        ] {
            let cfg = L1iConfig {
                path: "l1i".into(),
                iterations: *iterations,
                intensity: *intensity,
            };
            assert_eq!(L1i::new(exec.clone(), cfg).is_ok(), *ok);
        }
        let cfg = L1iConfig {
            path: "l1i".into(),
            iterations: 100,
            intensity: 5,
        };
        L1i::new(exec, cfg).unwrap().launch().unwrap();
        assert_eq!(journal.commands(), vec!["l1i 100 5"]);
    }
}
