// Copyright (c) Facebook, Inc. and its affiliates.
//! mutilate memcached load generator. With agents configured the master
//! only coordinates and the agents, reached over SSH, generate the load.
use super::*;
use crate::executor::{RemoteExecutor, SshConfig};
use crate::isolation::Decorators;
use crate::workloads::memcached;

lazy_static::lazy_static! {
    static ref PATH: Flag<String> = conf::string_flag(
        "mutilate_path",
        "Path to the mutilate binary",
        "mutilate",
    );
    static ref AGENTS: Flag<Vec<String>> = conf::slice_flag(
        "mutilate_agent",
        "Hosts mutilate agents run on, empty to generate the load from the master",
        &[],
    );
    static ref TUNING_TIME: Flag<Duration> = conf::duration_flag(
        "mutilate_tuning_time",
        "Length of each step of the SLO search",
        Duration::from_secs(10),
    );
    static ref WARMUP_TIME: Flag<Duration> = conf::duration_flag(
        "mutilate_warmup_time",
        "Warmup before every measurement (--warmup)",
        Duration::from_secs(10),
    );
    static ref RECORDS: Flag<i64> = conf::int_flag(
        "mutilate_records",
        "Number of memcached records to populate and query (-r)",
        10000,
    );
    static ref AGENT_THREADS: Flag<i64> = conf::int_flag(
        "mutilate_agent_threads",
        "Agent threads (-T)",
        8,
    );
    static ref AGENT_PORT: Flag<i64> = conf::int_flag(
        "mutilate_agent_port",
        "Port agents listen on for the master (-p)",
        5556,
    );
    static ref AGENT_CONNECTIONS: Flag<i64> = conf::int_flag(
        "mutilate_agent_connections",
        "Connections per agent thread (-C on the master)",
        1,
    );
    static ref AGENT_CONNECTIONS_DEPTH: Flag<i64> = conf::int_flag(
        "mutilate_agent_connections_depth",
        "Outstanding requests per agent connection (-D on the master)",
        1,
    );
    static ref AGENT_AFFINITY: Flag<bool> = conf::bool_flag(
        "mutilate_agent_affinity",
        "Pin agent threads to cores (--affinity)",
        false,
    );
    static ref AGENT_BLOCKING: Flag<bool> = conf::bool_flag(
        "mutilate_agent_blocking",
        "Use blocking epoll on agents (-B)",
        true,
    );
    static ref MASTER_THREADS: Flag<i64> = conf::int_flag(
        "mutilate_master_threads",
        "Master threads (-T)",
        8,
    );
    static ref MASTER_CONNECTIONS: Flag<i64> = conf::int_flag(
        "mutilate_master_connections",
        "Connections per master thread (-c)",
        4,
    );
    static ref MASTER_CONNECTIONS_DEPTH: Flag<i64> = conf::int_flag(
        "mutilate_master_connections_depth",
        "Outstanding requests per master connection (-d)",
        4,
    );
    static ref MASTER_AFFINITY: Flag<bool> = conf::bool_flag(
        "mutilate_master_affinity",
        "Pin master threads to cores (--affinity)",
        false,
    );
    static ref MASTER_BLOCKING: Flag<bool> = conf::bool_flag(
        "mutilate_master_blocking",
        "Use blocking epoll on the master (-B)",
        true,
    );
    static ref MASTER_QPS: Flag<i64> = conf::int_flag(
        "mutilate_master_qps",
        "QPS issued by the master itself when agents do the bulk of the load (-Q)",
        1000,
    );
    static ref KEY_SIZE: Flag<String> = conf::string_flag(
        "mutilate_master_keysize",
        "Key size distribution (-K)",
        "30",
    );
    static ref VALUE_SIZE: Flag<String> = conf::string_flag(
        "mutilate_master_valuesize",
        "Value size distribution (-V)",
        "200",
    );
    static ref INTERARRIVAL_DIST: Flag<String> = conf::string_flag(
        "mutilate_master_interarrival_dist",
        "Inter-arrival distribution (-i)",
        "exponential",
    );
}

pub fn register_flags() {
    lazy_static::initialize(&PATH);
    lazy_static::initialize(&AGENTS);
    lazy_static::initialize(&TUNING_TIME);
    lazy_static::initialize(&WARMUP_TIME);
    lazy_static::initialize(&RECORDS);
    lazy_static::initialize(&AGENT_THREADS);
    lazy_static::initialize(&AGENT_PORT);
    lazy_static::initialize(&AGENT_CONNECTIONS);
    lazy_static::initialize(&AGENT_CONNECTIONS_DEPTH);
    lazy_static::initialize(&AGENT_AFFINITY);
    lazy_static::initialize(&AGENT_BLOCKING);
    lazy_static::initialize(&MASTER_THREADS);
    lazy_static::initialize(&MASTER_CONNECTIONS);
    lazy_static::initialize(&MASTER_CONNECTIONS_DEPTH);
    lazy_static::initialize(&MASTER_AFFINITY);
    lazy_static::initialize(&MASTER_BLOCKING);
    lazy_static::initialize(&MASTER_QPS);
    lazy_static::initialize(&KEY_SIZE);
    lazy_static::initialize(&VALUE_SIZE);
    lazy_static::initialize(&INTERARRIVAL_DIST);
}

/// One SSH executor per configured agent host.
pub fn agent_executors_from_flags() -> Result<Vec<(String, ExecutorRef)>> {
    let mut execs: Vec<(String, ExecutorRef)> = vec![];
    for host in AGENTS.value().iter() {
        let cfg = SshConfig::from_flags(host)?;
        execs.push((host.clone(), Arc::new(RemoteExecutor::new(cfg, Decorators::new()))));
    }
    Ok(execs)
}

#[derive(Clone, Debug, PartialEq)]
pub struct MutilateConfig {
    pub path: String,
    pub server: String,
    pub tuning_time: Duration,
    pub warmup_time: Duration,
    pub records: u32,

    pub agent_threads: u32,
    pub agent_port: u16,
    pub agent_connections: u32,
    pub agent_connections_depth: u32,
    pub agent_affinity: bool,
    pub agent_blocking: bool,

    pub master_threads: u32,
    pub master_connections: u32,
    pub master_connections_depth: u32,
    pub master_affinity: bool,
    pub master_blocking: bool,
    pub master_qps: u32,

    pub key_size: String,
    pub value_size: String,
    pub interarrival_dist: String,
}

impl Default for MutilateConfig {
    fn default() -> Self {
        Self {
            path: "mutilate".into(),
            server: "127.0.0.1:11211".into(),
            tuning_time: Duration::from_secs(10),
            warmup_time: Duration::from_secs(10),
            records: 10000,
            agent_threads: 8,
            agent_port: 5556,
            agent_connections: 1,
            agent_connections_depth: 1,
            agent_affinity: false,
            agent_blocking: true,
            master_threads: 8,
            master_connections: 4,
            master_connections_depth: 4,
            master_affinity: false,
            master_blocking: true,
            master_qps: 1000,
            key_size: "30".into(),
            value_size: "200".into(),
            interarrival_dist: "exponential".into(),
        }
    }
}

impl MutilateConfig {
    pub fn from_flags() -> Self {
        let u32_of = |v: i64| v.max(0) as u32;
        Self {
            path: PATH.value(),
            server: format!("{}:{}", memcached::LISTEN_IP.value(), memcached::PORT.value()),
            tuning_time: TUNING_TIME.value(),
            warmup_time: WARMUP_TIME.value(),
            records: u32_of(RECORDS.value()),
            agent_threads: u32_of(AGENT_THREADS.value()),
            agent_port: AGENT_PORT.value() as u16,
            agent_connections: u32_of(AGENT_CONNECTIONS.value()),
            agent_connections_depth: u32_of(AGENT_CONNECTIONS_DEPTH.value()),
            agent_affinity: AGENT_AFFINITY.value(),
            agent_blocking: AGENT_BLOCKING.value(),
            master_threads: u32_of(MASTER_THREADS.value()),
            master_connections: u32_of(MASTER_CONNECTIONS.value()),
            master_connections_depth: u32_of(MASTER_CONNECTIONS_DEPTH.value()),
            master_affinity: MASTER_AFFINITY.value(),
            master_blocking: MASTER_BLOCKING.value(),
            master_qps: u32_of(MASTER_QPS.value()),
            key_size: KEY_SIZE.value(),
            value_size: VALUE_SIZE.value(),
            interarrival_dist: INTERARRIVAL_DIST.value(),
        }
    }

    pub fn agent_command(&self) -> String {
        let mut cmd = format!(
            "{} -T {} -A -p {}",
            &self.path, self.agent_threads, self.agent_port
        );
        if self.agent_affinity {
            cmd += " --affinity";
        }
        if self.agent_blocking {
            cmd += " -B";
        }
        cmd
    }

    pub fn populate_command(&self) -> String {
        format!(
            "{} -s {} --loadonly -r {} -K {} -V {}",
            &self.path, &self.server, self.records, &self.key_size, &self.value_size
        )
    }

    /// Master options shared by tuning and load runs.
    pub fn master_command(&self, agents: &[String]) -> String {
        let mut cmd = format!(
            "{} -s {} --warmup {} --noload -r {} -K {} -V {} -i {} -T {} -d {} -c {}",
            &self.path,
            &self.server,
            self.warmup_time.as_secs(),
            self.records,
            &self.key_size,
            &self.value_size,
            &self.interarrival_dist,
            self.master_threads,
            self.master_connections_depth,
            self.master_connections,
        );
        if self.master_affinity {
            cmd += " --affinity";
        }
        if self.master_blocking {
            cmd += " -B";
        }
        if !agents.is_empty() {
            cmd += &format!(
                " -D {} -C {} -p {}",
                self.agent_connections_depth, self.agent_connections, self.agent_port
            );
            if self.master_qps > 0 {
                cmd += &format!(" -Q {}", self.master_qps);
            }
            for agent in agents.iter() {
                cmd += &format!(" -a {}", agent);
            }
        }
        cmd
    }

    pub fn load_command(&self, agents: &[String], qps: i64, duration: Duration) -> String {
        format!(
            "{} -q {} -t {} --swanpercentile 99",
            self.master_command(agents),
            qps,
            duration.as_secs().max(1)
        )
    }

    pub fn tune_command(&self, agents: &[String], slo: i64) -> String {
        format!(
            "{} --search 99:{} -t {} --swanpercentile 99",
            self.master_command(agents),
            slo,
            self.tuning_time.as_secs().max(1)
        )
    }
}

pub struct Mutilate {
    master: ExecutorRef,
    agents: Vec<(String, ExecutorRef)>,
    cfg: MutilateConfig,
}

impl Mutilate {
    pub fn new(master: ExecutorRef, agents: Vec<(String, ExecutorRef)>, cfg: MutilateConfig) -> Self {
        Self {
            master,
            agents,
            cfg,
        }
    }

    fn agent_hosts(&self) -> Vec<String> {
        self.agents.iter().map(|(host, _)| host.clone()).collect()
    }

    /// Starts every agent. Agents which already started are discarded if a
    /// later one fails.
    fn start_agents(&self) -> Result<Vec<Box<dyn TaskHandle>>> {
        let mut started = vec![];
        for (host, exec) in self.agents.iter() {
            match exec.execute(&self.cfg.agent_command()) {
                Ok(h) => started.push(ServiceHandle::boxed(h)),
                Err(e) => {
                    discard_all(started);
                    return Err(e.context(format!("starting mutilate agent on {}", host)));
                }
            }
        }
        Ok(started)
    }

    /// Runs the master with `cmd` next to freshly started agents.
    fn start_cluster(&self, cmd: &str) -> Result<Box<dyn TaskHandle>> {
        let agents = self.start_agents()?;
        let master = match self.master.execute(cmd) {
            Ok(v) => v,
            Err(e) => {
                discard_all(agents);
                return Err(e.context("starting mutilate master"));
            }
        };
        if agents.is_empty() {
            Ok(master)
        } else {
            Ok(Box::new(ClusterTaskHandle::new(master, agents)))
        }
    }
}

impl LoadGenerator for Mutilate {
    fn name(&self) -> String {
        "mutilate".into()
    }

    fn parameters(&self) -> Vec<String> {
        let mut params = vec![self.cfg.master_command(&self.agent_hosts())];
        if !self.agents.is_empty() {
            params.push(self.cfg.agent_command());
        }
        params
    }

    fn populate(&self) -> Result<()> {
        let mut handle = self.master.execute(&self.cfg.populate_command())?;
        let res = wait_for_success(&mut handle, Duration::from_secs(0));
        let mut errs = ErrorCollection::default();
        errs.add_result(res.context("populating memcached"));
        errs.add_result(stop_clean_erase(handle.as_mut()));
        errs.into_result()
    }

    fn tune(&self, slo: i64) -> Result<(i64, i64)> {
        check_slo(slo)?;
        let cmd = self.cfg.tune_command(&self.agent_hosts(), slo);
        info!("mutilate: Tuning for SLO {}us", slo);
        let mut handle = self.start_cluster(&cmd)?;

        let res = wait_for_success(&mut handle, Duration::from_secs(0)).and_then(|_| {
            let results = parse::parse_file(&handle.stdout_path(), parse::parse_mutilate)?;
            parse::mutilate_qps_and_sli(&results)
        });
        if let Err(e) = release(&mut handle) {
            warn!("mutilate: Failed to release tuning run ({:#})", &e);
        }
        let (qps, sli) = res.context("mutilate tuning")?;
        info!("mutilate: Peak load {} QPS at {}us", qps, sli);
        Ok((qps, sli))
    }

    fn load(&self, qps: i64, duration: Duration) -> Result<Box<dyn TaskHandle>> {
        let cmd = self.cfg.load_command(&self.agent_hosts(), qps, duration);
        debug!("mutilate: Loading at {} QPS for {:?}", qps, duration);
        self.start_cluster(&cmd)
    }

    fn parse_results(&self, stdout: &Path) -> Result<Results> {
        parse::parse_file(stdout, parse::parse_mutilate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::mock::{Journal, MockExecutor, MockHandle};

    const REPORT: &str = "\
#type       avg     std     min     5th    10th    90th    95th    99th
read       52.0    19.1    22.6    31.2    33.6    74.4    90.3  4800.0

Total QPS = 41000.2 (410002 / 10.0s)
";

    #[test]
    fn test_commands() {
        let cfg = MutilateConfig::default();
        assert_eq!(cfg.agent_command(), "mutilate -T 8 -A -p 5556 -B");
        assert_eq!(
            cfg.populate_command(),
            "mutilate -s 127.0.0.1:11211 --loadonly -r 10000 -K 30 -V 200"
        );
        let base = "mutilate -s 127.0.0.1:11211 --warmup 10 --noload -r 10000 -K 30 -V 200 \
                    -i exponential -T 8 -d 4 -c 4 -B";
        assert_eq!(cfg.master_command(&[]), base);
        assert_eq!(
            cfg.load_command(&[], 2000, Duration::from_secs(15)),
            format!("{} -q 2000 -t 15 --swanpercentile 99", base)
        );
        assert_eq!(
            cfg.tune_command(&[], 5000),
            format!("{} --search 99:5000 -t 10 --swanpercentile 99", base)
        );
        assert_eq!(
            cfg.master_command(&["a1".into(), "a2".into()]),
            format!("{} -D 1 -C 1 -p 5556 -Q 1000 -a a1 -a a2", base)
        );
    }

    #[test]
    fn test_tune_rejects_low_slo() {
        let journal = Journal::default();
        let lg = Mutilate::new(
            Arc::new(MockExecutor::new(&journal)),
            vec![],
            MutilateConfig::default(),
        );
        for slo in &[0, 3000] {
            assert!(crate::error::is_config_error(&lg.tune(*slo).unwrap_err()));
        }
        assert!(journal.events().is_empty());
    }

    #[test]
    fn test_tune() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().to_path_buf();
        let journal = Journal::default();
        let exec = MockExecutor::new(&journal)
            .respond(move |cmd| Ok(MockHandle::finishing(cmd, 0).with_stdout(&path, REPORT)));
        let lg = Mutilate::new(Arc::new(exec), vec![], MutilateConfig::default());
        assert_eq!(lg.tune(5000).unwrap(), (41000, 4800));
        assert!(journal.commands()[0].contains("--search 99:5000"));
        assert_eq!(journal.count("clean"), 1);
    }

    #[test]
    fn test_load_run_failure() {
        let journal = Journal::default();
        let exec = MockExecutor::new(&journal).respond(|cmd| Ok(MockHandle::finishing(cmd, 1)));
        let lg = Mutilate::new(Arc::new(exec), vec![], MutilateConfig::default());
        let err = lg.populate().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SwanError>(),
            Some(SwanError::LoadRun(_))
        ));
        assert_eq!(journal.count("erase"), 1);
    }

    #[test]
    fn test_agent_failure_discards_started_agents() {
        let journal = Journal::default();
        let ok: ExecutorRef = Arc::new(MockExecutor::new(&journal));
        let bad: ExecutorRef = Arc::new(
            MockExecutor::new(&journal).respond(|_| bail!("ssh: connection refused")),
        );
        let master: ExecutorRef = Arc::new(MockExecutor::new(&journal));
        let lg = Mutilate::new(
            master,
            vec![("a1".into(), ok), ("a2".into(), bad)],
            MutilateConfig::default(),
        );
        assert!(lg.load(1000, Duration::from_secs(1)).is_err());
        assert_eq!(journal.count("stop"), 1);
        assert_eq!(journal.count("erase"), 1);
        assert!(journal
            .commands()
            .iter()
            .all(|c| !c.contains("--noload")));
    }

    #[test]
    fn test_load_with_agents_is_cluster() {
        let journal = Journal::default();
        let agent: ExecutorRef = Arc::new(MockExecutor::new(&journal));
        let master: ExecutorRef = Arc::new(MockExecutor::new(&journal));
        let lg = Mutilate::new(master, vec![("a1".into(), agent)], MutilateConfig::default());
        let mut h = lg.load(1000, Duration::from_secs(1)).unwrap();
        assert!(h.name().contains("-a a1"));
        h.stop().unwrap();
        let master = journal.commands()[1].clone();
        let agent_stop = journal.position("stop mutilate -T 8 -A -p 5556 -B").unwrap();
        let master_stop = journal.position(&format!("stop {}", master)).unwrap();
        assert!(agent_stop < master_stop);
    }
}
