// Copyright (c) Facebook, Inc. and its affiliates.
//! SPECjbb controller and transaction injectors.
//!
//! Load runs use a PRESET controller at a fixed injection rate. Tuning
//! runs the HBIR_RT search and feeds the resulting binary log to the
//! reporter, whose critical-jOPS is taken as the peak load.
use super::*;
use crate::executor::liveness::ensure_listening;
use crate::workloads::specjbb::{SpecjbbCommon, GROUP};

const LOAD_JMX_PORT: u16 = 5556;
const TUNE_JMX_PORT: u16 = 5557;
const TXI_JMX_PORT: u16 = 5558;

lazy_static::lazy_static! {
    static ref CONTROLLER_PORT: Flag<i64> = conf::int_flag(
        "specjbb_controller_port",
        "Port the SPECjbb controller accepts injectors and backends on",
        24000,
    );
    static ref CONTROLLER_WAIT: Flag<Duration> = conf::duration_flag(
        "specjbb_controller_wait_timeout",
        "How long to wait for the controller to listen before starting injectors, 0 to skip",
        Duration::from_secs(30),
    );
}

pub fn register_flags() {
    lazy_static::initialize(&CONTROLLER_PORT);
    lazy_static::initialize(&CONTROLLER_WAIT);
}

#[derive(Clone, Debug, PartialEq)]
pub struct SpecjbbLoadConfig {
    pub common: SpecjbbCommon,
    pub controller_port: u16,
    pub controller_wait: Duration,
}

impl Default for SpecjbbLoadConfig {
    fn default() -> Self {
        Self {
            common: Default::default(),
            controller_port: 24000,
            controller_wait: Duration::from_secs(30),
        }
    }
}

impl SpecjbbLoadConfig {
    pub fn from_flags() -> Self {
        Self {
            common: SpecjbbCommon::from_flags(),
            controller_port: CONTROLLER_PORT.value() as u16,
            controller_wait: CONTROLLER_WAIT.value(),
        }
    }

    fn controller_command(&self, jmx_port: u16, type_opts: &str) -> String {
        let c = &self.common;
        format!(
            "java -jar {} -Dspecjbb.controller.type={} \
             -Dspecjbb.input.number_customers={} -Dspecjbb.input.number_products={} \
             -Dspecjbb.run.datafile.dir={} {} -m distcontroller -p {}",
            SpecjbbCommon::jmx_options(jmx_port),
            type_opts,
            c.customer_number,
            c.product_number,
            &c.output_dir,
            &c.jar_path,
            &c.props_path
        )
    }

    /// Fixed injection rate run. SPECjbb takes the duration in milliseconds.
    pub fn load_command(&self, injection_rate: i64, duration: Duration) -> String {
        self.controller_command(
            LOAD_JMX_PORT,
            &format!(
                "PRESET -Dspecjbb.controller.preset.ir={} -Dspecjbb.controller.preset.duration={}",
                injection_rate,
                duration.as_secs() * 1000
            ),
        )
    }

    /// High bound injection rate search followed by the response time curve.
    pub fn hbir_rt_command(&self) -> String {
        self.controller_command(TUNE_JMX_PORT, "HBIR_RT")
    }

    pub fn reporter_command(&self, raw_file: &str, slo: i64) -> String {
        let c = &self.common;
        format!(
            "java -jar {} {} -m reporter -cIRtarget {} -p {} -raw {} -s {}",
            SpecjbbCommon::jmx_options(TUNE_JMX_PORT),
            &c.jar_path,
            slo,
            &c.props_path,
            &c.output_template_path,
            raw_file
        )
    }

    /// Injectors take JVM ids starting from 1.
    pub fn txi_command(&self, jvm_id: u32) -> String {
        let c = &self.common;
        format!(
            "java -jar {} {} -Dspecjbb.controller.host={} {} -m txinjector -G {} -J JVM{} -p {}",
            SpecjbbCommon::jmx_options(TXI_JMX_PORT),
            c.jvm_options(),
            &c.controller_ip,
            &c.jar_path,
            GROUP,
            jvm_id,
            &c.props_path
        )
    }

    pub fn controller_address(&self) -> String {
        format!("{}:{}", &self.common.controller_ip, self.controller_port)
    }
}

pub struct Specjbb {
    controller: ExecutorRef,
    injectors: ExecutorRef,
    cfg: SpecjbbLoadConfig,
}

impl Specjbb {
    pub fn new(controller: ExecutorRef, injectors: ExecutorRef, cfg: SpecjbbLoadConfig) -> Self {
        Self {
            controller,
            injectors,
            cfg,
        }
    }

    /// Starts the controller with `cmd` and, once it listens, every
    /// injector. Injectors leave when the controller finishes its run, so
    /// they are plain agents rather than services. On failure everything already started is stopped, cleaned
    /// and erased before the error is returned.
    fn start_cluster(&self, cmd: &str) -> Result<ClusterTaskHandle> {
        let mut controller = self
            .controller
            .execute(cmd)
            .context("starting SPECjbb controller")?;
        if self.cfg.controller_wait.as_nanos() > 0 {
            ensure_listening(
                &mut controller,
                &self.cfg.controller_address(),
                self.cfg.controller_wait,
            )?;
        }

        let mut injectors: Vec<Box<dyn TaskHandle>> = vec![];
        for id in 1..=self.cfg.common.txi_count {
            let txi_cmd = self.cfg.txi_command(id);
            match self.injectors.execute(&txi_cmd) {
                Ok(h) => injectors.push(h),
                Err(e) => {
                    error!("specjbb: Failed to start transaction injector JVM{}", id);
                    let mut started = vec![controller];
                    started.append(&mut injectors);
                    discard_all(started);
                    return Err(e.context(format!("starting SPECjbb transaction injector {}", id)));
                }
            }
        }
        Ok(ClusterTaskHandle::new(controller, injectors))
    }
}

impl LoadGenerator for Specjbb {
    fn name(&self) -> String {
        "SPECjbb".into()
    }

    fn parameters(&self) -> Vec<String> {
        vec![self.cfg.hbir_rt_command(), self.cfg.txi_command(1)]
    }

    fn populate(&self) -> Result<()> {
        debug!("specjbb: Nothing to populate");
        Ok(())
    }

    fn tune(&self, slo: i64) -> Result<(i64, i64)> {
        check_slo(slo)?;
        info!("specjbb: Running HBIR_RT search");
        let mut cluster = self.start_cluster(&self.cfg.hbir_rt_command())?;

        cluster.leader().wait(Duration::from_secs(0));
        let injectors = std::mem::take(cluster.agents());
        discard_all(injectors);

        let mut controller: Box<dyn TaskHandle> = Box::new(cluster);
        let res = wait_for_success(&mut controller, Duration::from_secs(0)).and_then(|_| {
            parse::parse_file(&controller.stdout_path(), parse::parse_specjbb_raw_file_name)
        });
        let raw_file = match res {
            Ok(v) => v,
            Err(e) => {
                if let Err(re) = release(&mut controller) {
                    warn!("specjbb: Failed to release HBIR_RT controller ({:#})", &re);
                }
                return Err(e.context("SPECjbb HBIR_RT run"));
            }
        };

        let mut reporter = match self
            .controller
            .execute(&self.cfg.reporter_command(&raw_file, slo))
        {
            Ok(v) => v,
            Err(e) => {
                if let Err(re) = release(&mut controller) {
                    warn!("specjbb: Failed to release HBIR_RT controller ({:#})", &re);
                }
                return Err(e.context("starting SPECjbb reporter"));
            }
        };
        let res = wait_for_success(&mut reporter, Duration::from_secs(0)).and_then(|_| {
            parse::parse_file(&reporter.stdout_path(), parse::parse_specjbb_critical_jops)
        });

        let mut errs = ErrorCollection::default();
        errs.add_result(stop_clean_erase(controller.as_mut()));
        errs.add_result(stop_clean_erase(reporter.as_mut()));
        if let Err(e) = errs.into_result() {
            warn!("specjbb: Failed to clean up tuning runs ({:#})", &e);
        }

        let jops = res.context("SPECjbb reporter")?;
        info!("specjbb: critical-jOPS {}", jops);
        Ok((jops, 0))
    }

    fn load(&self, qps: i64, duration: Duration) -> Result<Box<dyn TaskHandle>> {
        debug!("specjbb: Injection rate {} for {:?}", qps, duration);
        Ok(Box::new(self.start_cluster(&self.cfg.load_command(qps, duration))?))
    }

    fn parse_results(&self, stdout: &Path) -> Result<Results> {
        parse::parse_file(stdout, parse::parse_specjbb_load)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::mock::{Journal, MockExecutor, MockHandle};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(txi_count: u32) -> SpecjbbLoadConfig {
        SpecjbbLoadConfig {
            common: SpecjbbCommon {
                txi_count,
                ..Default::default()
            },
            controller_wait: Duration::from_secs(0),
            ..Default::default()
        }
    }

    #[test]
    fn test_commands() {
        let cfg = config(1);
        let load = cfg.load_command(4000, Duration::from_secs(15));
        assert!(load.contains("-Dspecjbb.controller.type=PRESET"));
        assert!(load.contains("-Dspecjbb.controller.preset.ir=4000"));
        assert!(load.contains("-Dspecjbb.controller.preset.duration=15000"));
        assert!(load.contains("-Dcom.sun.management.jmxremote.port=5556"));
        assert!(load.ends_with("-m distcontroller -p /usr/share/specjbb/config/specjbb2015.props"));

        assert!(cfg.hbir_rt_command().contains("-Dspecjbb.controller.type=HBIR_RT"));
        assert!(cfg
            .reporter_command("/tmp/x.data.gz", 5000)
            .ends_with("-m reporter -cIRtarget 5000 \
                        -p /usr/share/specjbb/config/specjbb2015.props \
                        -raw /usr/share/specjbb/config/template-D.raw -s /tmp/x.data.gz"));
        assert!(cfg.txi_command(2).contains("-m txinjector -G GRP1 -J JVM2"));
    }

    #[test]
    fn test_injector_failure_discards_cluster() {
        let journal = Journal::default();
        let nr = Arc::new(AtomicUsize::new(0));
        let injectors = MockExecutor::new(&journal).respond(move |cmd| {
            if nr.fetch_add(1, Ordering::SeqCst) == 1 {
                bail!("injector failed to start");
            }
            Ok(MockHandle::running(cmd))
        });
        let controller = MockExecutor::new(&journal)
            .respond(|_| Ok(MockHandle::running("controller")));
        let lg = Specjbb::new(Arc::new(controller), Arc::new(injectors), config(2));

        assert!(lg.load(1000, Duration::from_secs(1)).is_err());
        let txi1 = format!("stop {}", lg.cfg.txi_command(1));
        assert!(journal.position("stop controller").is_some());
        assert!(journal.position(&txi1).is_some());
        assert_eq!(journal.count("stop"), 2);
        assert_eq!(journal.count("clean"), 2);
        assert_eq!(journal.count("erase"), 2);
    }

    #[test]
    fn test_load_with_departed_injectors() {
        let journal = Journal::default();
        let controller = MockExecutor::new(&journal)
            .respond(|_| Ok(MockHandle::finishing("controller", 0)));
        let injectors =
            MockExecutor::new(&journal).respond(|cmd| Ok(MockHandle::terminated(cmd, 0)));
        let lg = Specjbb::new(Arc::new(controller), Arc::new(injectors), config(2));

        let mut h = lg.load(1000, Duration::from_secs(1)).unwrap();
        assert!(h.wait(Duration::from_secs(1)));
        assert_eq!(h.exit_code().unwrap(), 0);
        h.stop().unwrap();
        h.clean().unwrap();
        assert_eq!(journal.count("stop"), 3);
        assert_eq!(journal.count("clean"), 3);
    }

    #[test]
    fn test_tune() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().to_path_buf();
        let journal = Journal::default();
        let controller = MockExecutor::new(&journal).respond(move |cmd| {
            let out = if cmd.contains("-m reporter") {
                "RUN RESULT: hbIR (max attempted) = 12000, max-jOPS = 11640, critical-jOPS = 2684\n"
            } else {
                "  42s: Binary log file is /tmp/specjbb/run.data.gz\n"
            };
            Ok(MockHandle::finishing(cmd, 0).with_stdout(&path, out))
        });
        let lg = Specjbb::new(
            Arc::new(controller),
            Arc::new(MockExecutor::new(&journal)),
            config(1),
        );
        assert_eq!(lg.tune(5000).unwrap(), (2684, 0));
        let cmds = journal.commands();
        assert_eq!(cmds.len(), 3);
        assert!(cmds[2].contains("-s /tmp/specjbb/run.data.gz"));
        assert_eq!(journal.count("erase"), 3);

        assert!(lg.tune(3000).is_err());
        assert_eq!(journal.commands().len(), 3);
    }

    #[test]
    fn test_tune_failure_releases_controller() {
        let journal = Journal::default();
        let controller =
            MockExecutor::new(&journal).respond(|_| Ok(MockHandle::finishing("controller", 1)));
        let lg = Specjbb::new(
            Arc::new(controller),
            Arc::new(MockExecutor::new(&journal)),
            config(1),
        );
        let err = lg.tune(5000).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SwanError>(),
            Some(SwanError::LoadRun(_))
        ));
        assert_eq!(journal.commands().len(), 2);
        assert!(journal.position("stop controller").is_some());
        assert!(journal.position("clean controller").is_some());
        assert!(journal.position("erase controller").is_none());
    }
}
