// Copyright (c) Facebook, Inc. and its affiliates.
//! SPECjbb backend and the settings shared with the controller, the
//! transaction injectors and the reporter in `loadgen::specjbb`.
use super::*;

lazy_static::lazy_static! {
    static ref JAR_PATH: Flag<String> = conf::file_flag(
        "specjbb_path_lg",
        "Path to the SPECjbb jar",
        "/usr/share/specjbb/specjbb2015.jar",
    );
    static ref PROPS_PATH: Flag<String> = conf::file_flag(
        "specjbb_props_path_lg",
        "Path to the SPECjbb properties file",
        "/usr/share/specjbb/config/specjbb2015.props",
    );
    static ref OUTPUT_TEMPLATE_PATH: Flag<String> = conf::string_flag(
        "specjbb_output_template_path",
        "Path to the template used by the reporter to render the raw results",
        "/usr/share/specjbb/config/template-D.raw",
    );
    static ref CONTROLLER_IP: Flag<String> = conf::ip_flag(
        "specjbb_controller_ip",
        "IP address of the SPECjbb controller",
        "127.0.0.1",
    );
    static ref TXI_COUNT: Flag<i64> = conf::int_flag(
        "specjbb_txl_count",
        "Number of transaction injectors run by the load generator",
        1,
    );
    static ref CUSTOMER_NUMBER: Flag<i64> = conf::int_flag(
        "specjbb_customer_number",
        "Number of customers",
        100,
    );
    static ref PRODUCT_NUMBER: Flag<i64> = conf::int_flag(
        "specjbb_product_number",
        "Number of products",
        100,
    );
    static ref OUTPUT_DIR: Flag<String> = conf::string_flag(
        "specjbb_output_dir",
        "Directory the controller writes its binary log into",
        "/usr/share/specjbb/",
    );
    static ref JVM_HEAP_SIZE: Flag<i64> = conf::int_flag(
        "specjbb_jvm_heap_size",
        "JVM heap size in gigabytes of the backend and the injectors",
        10,
    );
}

pub fn register_flags() {
    lazy_static::initialize(&JAR_PATH);
    lazy_static::initialize(&PROPS_PATH);
    lazy_static::initialize(&OUTPUT_TEMPLATE_PATH);
    lazy_static::initialize(&CONTROLLER_IP);
    lazy_static::initialize(&TXI_COUNT);
    lazy_static::initialize(&CUSTOMER_NUMBER);
    lazy_static::initialize(&PRODUCT_NUMBER);
    lazy_static::initialize(&OUTPUT_DIR);
    lazy_static::initialize(&JVM_HEAP_SIZE);
}

pub const GROUP: &str = "GRP1";

/// Settings common to every SPECjbb component.
#[derive(Clone, Debug, PartialEq)]
pub struct SpecjbbCommon {
    pub jar_path: String,
    pub props_path: String,
    pub output_template_path: String,
    pub controller_ip: String,
    pub txi_count: u32,
    pub customer_number: u32,
    pub product_number: u32,
    pub output_dir: String,
    pub jvm_heap_gb: u32,
}

impl Default for SpecjbbCommon {
    fn default() -> Self {
        Self {
            jar_path: "/usr/share/specjbb/specjbb2015.jar".into(),
            props_path: "/usr/share/specjbb/config/specjbb2015.props".into(),
            output_template_path: "/usr/share/specjbb/config/template-D.raw".into(),
            controller_ip: "127.0.0.1".into(),
            txi_count: 1,
            customer_number: 100,
            product_number: 100,
            output_dir: "/usr/share/specjbb/".into(),
            jvm_heap_gb: 10,
        }
    }
}

impl SpecjbbCommon {
    pub fn from_flags() -> Self {
        Self {
            jar_path: JAR_PATH.value(),
            props_path: PROPS_PATH.value(),
            output_template_path: OUTPUT_TEMPLATE_PATH.value(),
            controller_ip: CONTROLLER_IP.value(),
            txi_count: TXI_COUNT.value().max(0) as u32,
            customer_number: CUSTOMER_NUMBER.value().max(0) as u32,
            product_number: PRODUCT_NUMBER.value().max(0) as u32,
            output_dir: OUTPUT_DIR.value(),
            jvm_heap_gb: JVM_HEAP_SIZE.value().max(1) as u32,
        }
    }

    /// Heap and GC settings of the backend and the injectors.
    pub fn jvm_options(&self) -> String {
        format!(
            "-server -Xms{g}g -Xmx{g}g -XX:NativeMemoryTracking=summary \
             -XX:+UseParallelOldGC -XX:ParallelGCThreads=8 -XX:ConcGCThreads=4 \
             -XX:InitiatingHeapOccupancyPercent=80 -XX:MaxGCPauseMillis=100 -XX:+AlwaysPreTouch",
            g = self.jvm_heap_gb
        )
    }

    /// Unauthenticated JMX on `port`, IPv4 only.
    pub fn jmx_options(port: u16) -> String {
        format!(
            "-Dcom.sun.management.jmxremote.port={} \
             -Dcom.sun.management.jmxremote.ssl=false \
             -Dcom.sun.management.jmxremote.authenticate=false \
             -Djava.net.preferIPv4Stack=true",
            port
        )
    }

    /// JVM id of the backend. Injectors take `JVM1` through `JVM<txi_count>`.
    pub fn backend_jvm_id(&self) -> u32 {
        self.txi_count + 1
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct BackendConfig {
    pub common: SpecjbbCommon,
    pub jvm_id: u32,
}

impl BackendConfig {
    pub fn from_flags() -> Self {
        let common = SpecjbbCommon::from_flags();
        let jvm_id = common.backend_jvm_id();
        Self { common, jvm_id }
    }

    pub fn command(&self) -> String {
        format!(
            "java -jar {} -Dspecjbb.controller.host={} {} -m backend -G {} -J JVM{}",
            self.common.jvm_options(),
            &self.common.controller_ip,
            &self.common.jar_path,
            GROUP,
            self.jvm_id
        )
    }
}

/// The SPECjbb backend is the high priority workload; the controller and
/// the injectors drive it.
pub struct Backend {
    exec: ExecutorRef,
    cfg: BackendConfig,
}

impl Backend {
    pub fn new(exec: ExecutorRef, cfg: BackendConfig) -> Self {
        Self { exec, cfg }
    }
}

impl Launcher for Backend {
    fn name(&self) -> String {
        "SPECjbb Backend".into()
    }

    fn parameters(&self) -> String {
        self.cfg.command()
    }

    fn launch(&self) -> Result<Box<dyn TaskHandle>> {
        self.exec
            .execute(&self.cfg.command())
            .context("launching SPECjbb backend")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_command() {
        let common = SpecjbbCommon {
            jvm_heap_gb: 2,
            txi_count: 2,
            ..Default::default()
        };
        let cfg = BackendConfig {
            jvm_id: common.backend_jvm_id(),
            common,
        };
        let cmd = cfg.command();
        assert!(cmd.starts_with("java -jar -server -Xms2g -Xmx2g "));
        assert!(cmd.ends_with(
            "-Dspecjbb.controller.host=127.0.0.1 /usr/share/specjbb/specjbb2015.jar \
             -m backend -G GRP1 -J JVM3"
        ));
    }
}
