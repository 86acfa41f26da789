// Copyright (c) Facebook, Inc. and its affiliates.
use super::*;
use crate::executor::liveness::ensure_listening;

lazy_static::lazy_static! {
    static ref PATH: Flag<String> = conf::string_flag(
        "memcached_path",
        "Path to the memcached binary",
        "memcached",
    );
    pub static ref PORT: Flag<i64> = conf::int_flag(
        "memcached_port",
        "Port for Memcached to listen on (-p)",
        11211,
    );
    pub static ref LISTEN_IP: Flag<String> = conf::ip_flag(
        "memcached_listening_address",
        "IP address of interface that Memcached will be listening on, must be an actual device address and not 0.0.0.0",
        "127.0.0.1",
    );
    static ref USER: Flag<String> = conf::string_flag(
        "memcached_user",
        "Username for Memcached process (-u)",
        "root",
    );
    static ref THREADS: Flag<i64> = conf::int_flag(
        "memcached_threads",
        "Number of threads to use (-t)",
        4,
    );
    static ref THREADS_AFFINITY: Flag<bool> = conf::bool_flag(
        "memcached_threads_affinity",
        "Threads affinity (-T), requires patched memcached",
        false,
    );
    static ref CONNECTIONS: Flag<i64> = conf::int_flag(
        "memcached_connections",
        "Max simultaneous connections (-c)",
        2048,
    );
    static ref MAX_MEMORY: Flag<i64> = conf::int_flag(
        "memcached_max_memory",
        "Maximum memory in megabytes to use for items (-m)",
        4096,
    );
    static ref LIVENESS_TIMEOUT: Flag<Duration> = conf::duration_flag(
        "memcached_liveness_timeout",
        "How long to wait for Memcached to accept connections after launch",
        Duration::from_secs(5),
    );
}

pub fn register_flags() {
    lazy_static::initialize(&PATH);
    lazy_static::initialize(&PORT);
    lazy_static::initialize(&LISTEN_IP);
    lazy_static::initialize(&USER);
    lazy_static::initialize(&THREADS);
    lazy_static::initialize(&THREADS_AFFINITY);
    lazy_static::initialize(&CONNECTIONS);
    lazy_static::initialize(&MAX_MEMORY);
    lazy_static::initialize(&LIVENESS_TIMEOUT);
}

#[derive(Clone, Debug, PartialEq)]
pub struct MemcachedConfig {
    pub path: String,
    pub port: u16,
    pub ip: String,
    pub user: String,
    pub threads: u32,
    pub threads_affinity: bool,
    pub connections: u32,
    pub max_memory_mb: u32,
    pub liveness_timeout: Duration,
}

impl Default for MemcachedConfig {
    fn default() -> Self {
        Self {
            path: "memcached".into(),
            port: 11211,
            ip: "127.0.0.1".into(),
            user: "root".into(),
            threads: 4,
            threads_affinity: false,
            connections: 2048,
            max_memory_mb: 4096,
            liveness_timeout: Duration::from_secs(5),
        }
    }
}

impl MemcachedConfig {
    pub fn from_flags() -> Self {
        Self {
            path: PATH.value(),
            port: PORT.value() as u16,
            ip: LISTEN_IP.value(),
            user: USER.value(),
            threads: THREADS.value() as u32,
            threads_affinity: THREADS_AFFINITY.value(),
            connections: CONNECTIONS.value() as u32,
            max_memory_mb: MAX_MEMORY.value() as u32,
            liveness_timeout: LIVENESS_TIMEOUT.value(),
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", &self.ip, self.port)
    }

    pub fn command(&self) -> String {
        let mut cmd = format!(
            "{} -p {} -u {} -t {} -m {} -c {}",
            &self.path, self.port, &self.user, self.threads, self.max_memory_mb, self.connections
        );
        if self.threads_affinity {
            cmd += " -T";
        }
        cmd
    }
}

pub struct Memcached {
    exec: ExecutorRef,
    cfg: MemcachedConfig,
}

impl Memcached {
    pub fn new(exec: ExecutorRef, cfg: MemcachedConfig) -> Result<Self> {
        if cfg.ip == "0.0.0.0" {
            bail!(SwanError::Config(
                "memcached has to listen on an actual device address, not 0.0.0.0".into()
            ));
        }
        Ok(Self { exec, cfg })
    }
}

impl Launcher for Memcached {
    fn name(&self) -> String {
        "Memcached".into()
    }

    fn parameters(&self) -> String {
        self.cfg.command()
    }

    fn launch(&self) -> Result<Box<dyn TaskHandle>> {
        let mut handle = self
            .exec
            .execute(&self.cfg.command())
            .context("launching memcached")?;
        ensure_listening(&mut handle, &self.cfg.address(), self.cfg.liveness_timeout)?;
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::mock::{Journal, MockExecutor};
    use std::net::TcpListener;

    #[test]
    fn test_command() {
        let mut cfg = MemcachedConfig::default();
        assert_eq!(cfg.command(), "memcached -p 11211 -u root -t 4 -m 4096 -c 2048");
        cfg.threads_affinity = true;
        assert!(cfg.command().ends_with(" -T"));
        assert_eq!(cfg.address(), "127.0.0.1:11211");
    }

    #[test]
    fn test_rejects_any_address() {
        let journal = Journal::default();
        let cfg = MemcachedConfig {
            ip: "0.0.0.0".into(),
            ..Default::default()
        };
        let err = Memcached::new(Arc::new(MockExecutor::new(&journal)), cfg)
            .err()
            .unwrap();
        assert!(crate::error::is_config_error(&err));
    }

    #[test]
    fn test_launch_waits_for_port() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let journal = Journal::default();
        let cfg = MemcachedConfig {
            port,
            ..Default::default()
        };
        let mc = Memcached::new(Arc::new(MockExecutor::new(&journal)), cfg).unwrap();
        let mut h = mc.launch().unwrap();
        assert!(h.is_running());
        h.stop().unwrap();
    }

    #[test]
    fn test_liveness_failure_cleans_up() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let journal = Journal::default();
        let cfg = MemcachedConfig {
            port,
            liveness_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let mc = Memcached::new(Arc::new(MockExecutor::new(&journal)), cfg).unwrap();
        let err = mc.launch().err().unwrap();
        assert!(matches!(
            err.downcast_ref::<SwanError>(),
            Some(SwanError::Liveness(_, _))
        ));
        assert_eq!(journal.count("stop"), 1);
        assert_eq!(journal.count("clean"), 1);
        assert_eq!(journal.count("erase"), 1);
    }
}
