// Copyright (c) Facebook, Inc. and its affiliates.
use super::*;

lazy_static::lazy_static! {
    static ref PATH: Flag<String> = conf::string_flag(
        "stressng_path",
        "Path to the stress-ng binary",
        "stress-ng",
    );
    static ref CUSTOM_ARGUMENTS: Flag<String> = conf::string_flag(
        "stressng_custom_arguments",
        "Arguments passed verbatim to stress-ng for the stress-ng-custom aggressor",
        "",
    );
    static ref STREAM_PROCESSES: Flag<i64> = conf::int_flag(
        "stressng_stream_process_number",
        "Number of stream stressors (--stream=N)",
        1,
    );
    static ref CACHE_L1_PROCESSES: Flag<i64> = conf::int_flag(
        "stressng_cache_l1_process_number",
        "Number of L1 cache stressors (--cache=N --cache-level=1)",
        1,
    );
    static ref CACHE_L3_PROCESSES: Flag<i64> = conf::int_flag(
        "stressng_cache_l3_process_number",
        "Number of L3 cache stressors (--cache=N --cache-level=3)",
        1,
    );
    static ref MEMCPY_PROCESSES: Flag<i64> = conf::int_flag(
        "stressng_memcpy_process_number",
        "Number of memcpy stressors (--memcpy=N)",
        1,
    );
}

pub fn register_flags() {
    lazy_static::initialize(&PATH);
    lazy_static::initialize(&CUSTOM_ARGUMENTS);
    lazy_static::initialize(&STREAM_PROCESSES);
    lazy_static::initialize(&CACHE_L1_PROCESSES);
    lazy_static::initialize(&CACHE_L3_PROCESSES);
    lazy_static::initialize(&MEMCPY_PROCESSES);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StressKind {
    Stream,
    CacheL1,
    CacheL3,
    Memcpy,
    Custom,
}

impl FromStr for StressKind {
    type Err = anyhow::Error;

    fn from_str(input: &str) -> Result<Self> {
        Ok(match input {
            "stress-ng-stream" => Self::Stream,
            "stress-ng-cache-l1" => Self::CacheL1,
            "stress-ng-cache-l3" => Self::CacheL3,
            "stress-ng-memcpy" => Self::Memcpy,
            "stress-ng-custom" => Self::Custom,
            v => bail!("unknown stress-ng aggressor {:?}", v),
        })
    }
}

impl fmt::Display for StressKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Stream => "stress-ng-stream",
            Self::CacheL1 => "stress-ng-cache-l1",
            Self::CacheL3 => "stress-ng-cache-l3",
            Self::Memcpy => "stress-ng-memcpy",
            Self::Custom => "stress-ng-custom",
        };
        write!(f, "{}", name)
    }
}

impl StressKind {
    /// stress-ng arguments for `nr` stressors.
    pub fn arguments(&self, nr: i64, custom: &str) -> String {
        match self {
            Self::Stream => format!("--stream={}", nr),
            Self::CacheL1 => format!("--cache={} --cache-level=1", nr),
            Self::CacheL3 => format!("--cache={} --cache-level=3", nr),
            Self::Memcpy => format!("--memcpy={}", nr),
            Self::Custom => custom.trim().to_string(),
        }
    }

    fn nr_from_flags(&self) -> i64 {
        match self {
            Self::Stream => STREAM_PROCESSES.value(),
            Self::CacheL1 => CACHE_L1_PROCESSES.value(),
            Self::CacheL3 => CACHE_L3_PROCESSES.value(),
            Self::Memcpy => MEMCPY_PROCESSES.value(),
            Self::Custom => 0,
        }
    }
}

pub struct StressNg {
    exec: ExecutorRef,
    kind: StressKind,
    command: String,
}

impl StressNg {
    pub fn new(exec: ExecutorRef, kind: StressKind) -> Self {
        let args = kind.arguments(kind.nr_from_flags(), &CUSTOM_ARGUMENTS.value());
        Self::with_command(exec, kind, format!("{} {}", PATH.value(), args))
    }

    pub fn with_command(exec: ExecutorRef, kind: StressKind, command: String) -> Self {
        Self {
            exec,
            kind,
            command,
        }
    }
}

impl Launcher for StressNg {
    fn name(&self) -> String {
        self.kind.to_string()
    }

    fn parameters(&self) -> String {
        self.command.clone()
    }

    fn launch(&self) -> Result<Box<dyn TaskHandle>> {
        if self.kind == StressKind::Custom && self.command.split_whitespace().count() < 2 {
            bail!(SwanError::Config(
                "stress-ng-custom needs stressng_custom_arguments".into()
            ));
        }
        self.exec.execute(&self.command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::mock::{Journal, MockExecutor};

    #[test]
    fn test_arguments() {
        for (kind, nr, args) in &[
            (StressKind::Stream, 1, "--stream=1"),
            (StressKind::CacheL1, 2, "--cache=2 --cache-level=1"),
            (StressKind::CacheL3, 4, "--cache=4 --cache-level=3"),
            (StressKind::Memcpy, 3, "--memcpy=3"),
            (StressKind::Custom, 0, "--cpu 2"),
        ] {
            assert_eq!(kind.arguments(*nr, " --cpu 2 "), *args);
        }
    }

    #[test]
    fn test_custom_needs_arguments() {
        let journal = Journal::default();
        let exec: ExecutorRef = Arc::new(MockExecutor::new(&journal));
        let s = StressNg::with_command(exec.clone(), StressKind::Custom, "stress-ng ".into());
        assert!(crate::error::is_config_error(&s.launch().err().unwrap()));
        assert!(journal.commands().is_empty());

        let s = StressNg::with_command(exec, StressKind::Custom, "stress-ng --cpu 1".into());
        s.launch().unwrap();
        assert_eq!(journal.commands(), vec!["stress-ng --cpu 1"]);
    }
}
