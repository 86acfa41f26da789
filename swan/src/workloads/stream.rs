// Copyright (c) Facebook, Inc. and its affiliates.
use super::*;

lazy_static::lazy_static! {
    static ref PATH: Flag<String> = conf::string_flag(
        "stream_path",
        "Path to the STREAM memory bandwidth binary",
        "stream.100M",
    );
    static ref THREADS: Flag<i64> = conf::int_flag(
        "experiment_be_stream_thread_number",
        "Number of OpenMP threads of STREAM, 0 leaves the OpenMP default",
        0,
    );
}

pub fn register_flags() {
    lazy_static::initialize(&PATH);
    lazy_static::initialize(&THREADS);
}

#[derive(Clone, Debug, PartialEq)]
pub struct StreamConfig {
    pub path: String,
    pub threads: u32,
}

impl StreamConfig {
    pub fn from_flags() -> Self {
        Self {
            path: PATH.value(),
            threads: THREADS.value().max(0) as u32,
        }
    }

    pub fn command(&self) -> String {
        match self.threads {
            0 => self.path.clone(),
            nr => format!("env OMP_NUM_THREADS={} {}", nr, &self.path),
        }
    }
}

pub struct Stream {
    exec: ExecutorRef,
    cfg: StreamConfig,
}

impl Stream {
    pub fn new(exec: ExecutorRef, cfg: StreamConfig) -> Self {
        Self { exec, cfg }
    }
}

impl Launcher for Stream {
    fn name(&self) -> String {
        "Stream".into()
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

    #[test]
    fn test_command() {
        for (threads, cmd) in &[(0, "stream.100M"), (4, "env OMP_NUM_THREADS=4 stream.100M")] {
            let cfg = StreamConfig {
                path: "stream.100M".into(),
                threads: *threads,
            };
            assert_eq!(cfg.command(), *cmd);
        }
    }
}
