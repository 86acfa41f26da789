// Copyright (c) Facebook, Inc. and its affiliates.
//! Executor running each command in its own pod through `kubectl`.
//!
//! `execute()` creates the pod from a JSON manifest, polls it until it is
//! ready and then streams its log into the local stdout file. A watcher
//! thread polls the pod phase and reports the container exit code once the
//! pod succeeds or fails, or -1 if the pod disappears. Finished pods are
//! deleted by the watcher.
use anyhow::{anyhow, bail, Context, Result};
use crossbeam::channel;
use log::{debug, info, warn};
use serde_json::{json, Value};
use std::io::Write;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{sleep, spawn};
use std::time::{Duration, Instant};

use super::{
    output_root, CleanState, Executor, ExitWatch, OutputDir, TaskHandle, TaskState, TaskStatus,
};
use crate::isolation::{Decorator, Decorators};
use swan_util::conf::{self, Flag};
use swan_util::*;

const DEFAULT_IMAGE: &str = "jess/stress";
const POLL_INTERVAL: Duration = Duration::from_millis(500);
const READY_BACKOFF: Duration = Duration::from_secs(1);
const STOP_WAIT: Duration = Duration::from_secs(30);

fn hostname() -> String {
    sysinfo::System::host_name().unwrap_or_else(|| "localhost".into())
}

lazy_static::lazy_static! {
    static ref KUBECTL: Flag<String> = conf::string_flag(
        "kubernetes_kubectl_path",
        "kubectl binary used to talk to the cluster",
        "kubectl",
    );
    static ref IMAGE: Flag<String> = conf::string_flag(
        "kubernetes_image",
        "Container image for HP and BE pods",
        DEFAULT_IMAGE,
    );
    static ref NAMESPACE: Flag<String> = conf::string_flag(
        "kubernetes_namespace",
        "Namespace for experiment pods",
        "default",
    );
    static ref NODE_NAME: Flag<String> = conf::string_flag(
        "kubernetes_target_node_name",
        "Experiment's Kubernetes pods will be run on this node, default is $HOSTNAME",
        &hostname(),
    );
    static ref HP_CPU: Flag<i64> = conf::int_flag(
        "kubernetes_hp_cpu_resource",
        "CPU request (and limit in guaranteed class) for HP pods in millicores",
        nr_cpus() as i64 * 1000,
    );
    static ref HP_MEMORY: Flag<i64> = conf::int_flag(
        "kubernetes_hp_memory_resource",
        "Memory request (and limit in guaranteed class) for HP pods in bytes",
        4_000_000_000,
    );
    static ref HP_GUARANTEED: Flag<bool> = conf::bool_flag(
        "kubernetes_hp_guaranteed_class",
        "Run HP pods in the Guaranteed QoS class instead of Burstable",
        false,
    );
    static ref HP_PRIORITY_CLASS: Flag<String> = conf::string_flag(
        "kubernetes_hp_priority_class",
        "Priority class name of HP pods, empty for none",
        "",
    );
    static ref LAUNCH_TIMEOUT: Flag<Duration> = conf::duration_flag(
        "kubernetes_launch_timeout",
        "Maximum time for a pod to become ready, 0 for no limit besides the retries",
        Duration::from_secs(0),
    );
    static ref READY_RETRIES: Flag<i64> = conf::int_flag(
        "kubernetes_pod_ready_retries",
        "Number of readiness checks of a new pod, one per second",
        120,
    );
}

pub fn register_flags() {
    lazy_static::initialize(&KUBECTL);
    lazy_static::initialize(&IMAGE);
    lazy_static::initialize(&NAMESPACE);
    lazy_static::initialize(&NODE_NAME);
    lazy_static::initialize(&HP_CPU);
    lazy_static::initialize(&HP_MEMORY);
    lazy_static::initialize(&HP_GUARANTEED);
    lazy_static::initialize(&HP_PRIORITY_CLASS);
    lazy_static::initialize(&LAUNCH_TIMEOUT);
    lazy_static::initialize(&READY_RETRIES);
}

#[derive(Clone, Debug)]
pub struct KubernetesConfig {
    pub pod_name_prefix: String,
    pub container_name: String,
    pub image: String,
    pub namespace: String,
    pub node_name: String,
    pub cpu_request: i64,
    pub cpu_limit: i64,
    pub memory_request: i64,
    pub memory_limit: i64,
    pub privileged: bool,
    pub host_network: bool,
    pub priority_class: String,
    pub launch_timeout: Duration,
    pub ready_retries: u32,
    pub kubectl: String,
    pub decorators: Decorators,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            pod_name_prefix: "swan".into(),
            container_name: "swan".into(),
            image: DEFAULT_IMAGE.into(),
            namespace: "default".into(),
            node_name: String::new(),
            cpu_request: 0,
            cpu_limit: 0,
            memory_request: 0,
            memory_limit: 0,
            privileged: false,
            host_network: false,
            priority_class: String::new(),
            launch_timeout: Duration::from_secs(0),
            ready_retries: 120,
            kubectl: "kubectl".into(),
            decorators: Decorators::new(),
        }
    }
}

impl KubernetesConfig {
    fn from_flags(decorators: Decorators) -> Self {
        Self {
            image: IMAGE.value(),
            namespace: NAMESPACE.value(),
            node_name: NODE_NAME.value(),
            launch_timeout: LAUNCH_TIMEOUT.value(),
            ready_retries: READY_RETRIES.value().max(1) as u32,
            kubectl: KUBECTL.value(),
            privileged: true,
            decorators,
            ..Default::default()
        }
    }

    pub fn high_priority_from_flags(decorators: Decorators) -> Self {
        let mut cfg = Self::from_flags(decorators);
        cfg.pod_name_prefix = "swan-hp".into();
        cfg.host_network = true;
        cfg.cpu_request = HP_CPU.value();
        cfg.memory_request = HP_MEMORY.value();
        if HP_GUARANTEED.value() {
            cfg.cpu_limit = cfg.cpu_request;
            cfg.memory_limit = cfg.memory_request;
        }
        cfg.priority_class = HP_PRIORITY_CLASS.value();
        cfg
    }

    pub fn best_effort_from_flags(decorators: Decorators) -> Self {
        let mut cfg = Self::from_flags(decorators);
        cfg.pod_name_prefix = "swan-be".into();
        cfg
    }

    pub fn pod_name(&self) -> String {
        let id = uuid::Uuid::new_v4().simple().to_string();
        format!("{}-{}", &self.pod_name_prefix, &id[..8])
    }

    fn resources(&self) -> Value {
        let mut requests = serde_json::Map::new();
        let mut limits = serde_json::Map::new();
        if self.cpu_request > 0 {
            requests.insert("cpu".into(), json!(format!("{}m", self.cpu_request)));
        }
        if self.memory_request > 0 {
            requests.insert("memory".into(), json!(self.memory_request.to_string()));
        }
        if self.cpu_limit > 0 {
            limits.insert("cpu".into(), json!(format!("{}m", self.cpu_limit)));
        }
        if self.memory_limit > 0 {
            limits.insert("memory".into(), json!(self.memory_limit.to_string()));
        }
        json!({ "requests": requests, "limits": limits })
    }

    /// Pod manifest running `command` through `sh -c`.
    pub fn pod_manifest(&self, name: &str, command: &str) -> Value {
        let mut spec = json!({
            "dnsPolicy": "Default",
            "restartPolicy": "Never",
            "hostNetwork": self.host_network,
            "terminationGracePeriodSeconds": 0,
            "containers": [{
                "name": &self.container_name,
                "image": &self.image,
                "command": ["sh", "-c", command],
                "resources": self.resources(),
                "imagePullPolicy": "IfNotPresent",
                "securityContext": { "privileged": self.privileged },
            }],
        });
        if !self.node_name.is_empty() {
            spec["nodeName"] = json!(&self.node_name);
        }
        if !self.priority_class.is_empty() {
            spec["priorityClassName"] = json!(&self.priority_class);
        }
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": name,
                "namespace": &self.namespace,
                "labels": { "name": name },
            },
            "spec": spec,
        })
    }

    fn kubectl(&self) -> Command {
        let mut cmd = Command::new(&self.kubectl);
        cmd.arg("--namespace").arg(&self.namespace);
        cmd
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PodState {
    Pending,
    Ready,
    Finished(i32),
    Gone,
}

/// Interprets `kubectl get pod -o json` output.
pub fn pod_state(pod: &Value) -> PodState {
    let status = &pod["status"];
    match status["phase"].as_str().unwrap_or("") {
        "Succeeded" | "Failed" => {
            let code = status["containerStatuses"][0]["state"]["terminated"]["exitCode"]
                .as_i64()
                .unwrap_or(-1);
            PodState::Finished(code as i32)
        }
        "Running" => {
            let ready = status["conditions"]
                .as_array()
                .map(|conds| {
                    conds
                        .iter()
                        .any(|c| c["type"] == "Ready" && c["status"] == "True")
                })
                .unwrap_or(false);
            if ready {
                PodState::Ready
            } else {
                PodState::Pending
            }
        }
        _ => PodState::Pending,
    }
}

fn get_pod(cfg: &KubernetesConfig, name: &str) -> Result<PodState> {
    let output = cfg
        .kubectl()
        .args(&["get", "pod", name, "-o", "json"])
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("failed to run {:?}", &cfg.kubectl))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("NotFound") || stderr.contains("not found") {
            return Ok(PodState::Gone);
        }
        bail!("kubectl get pod {:?} failed: {}", name, stderr.trim());
    }
    let pod: Value = serde_json::from_slice(&output.stdout)
        .with_context(|| format!("failed to parse state of pod {:?}", name))?;
    Ok(pod_state(&pod))
}

fn delete_pod(cfg: &KubernetesConfig, name: &str) -> Result<()> {
    debug!("k8s: Deleting pod {:?}", name);
    let mut cmd = cfg.kubectl();
    cmd.args(&[
        "delete",
        "pod",
        name,
        "--grace-period=0",
        "--ignore-not-found",
        "--wait=false",
    ]);
    run_command(&mut cmd, &format!("failed to delete pod {:?}", name))
}

pub struct KubernetesExecutor {
    config: KubernetesConfig,
    output_root: Option<PathBuf>,
}

impl KubernetesExecutor {
    pub fn new(config: KubernetesConfig) -> Result<Self> {
        if config.image.is_empty() {
            bail!("kubernetes executor needs a container image");
        }
        if find_bin(&config.kubectl, Option::<&str>::None).is_none() {
            bail!("{:?} not found", &config.kubectl);
        }
        Ok(Self {
            config,
            output_root: None,
        })
    }

    pub fn output_root(mut self, root: PathBuf) -> Self {
        self.output_root = Some(root);
        self
    }

    fn create_pod(&self, name: &str, command: &str) -> Result<()> {
        let manifest = self.config.pod_manifest(name, command);
        let mut child = self
            .config
            .kubectl()
            .args(&["create", "-f", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to run {:?}", &self.config.kubectl))?;
        child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("kubectl stdin not captured"))?
            .write_all(manifest.to_string().as_bytes())?;
        let output = child.wait_with_output()?;
        if !output.status.success() {
            bail!(
                "cannot schedule pod {:?} in namespace {:?}: {}",
                name,
                &self.config.namespace,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    fn wait_ready(&self, name: &str) -> Result<PodState> {
        let started = Instant::now();
        for _ in 0..self.config.ready_retries {
            match get_pod(&self.config, name)? {
                PodState::Pending => {}
                PodState::Gone => bail!("pod {:?} disappeared before becoming ready", name),
                state => return Ok(state),
            }
            if self.config.launch_timeout.as_nanos() > 0
                && started.elapsed() >= self.config.launch_timeout
            {
                break;
            }
            if prog_exiting() {
                bail!("program exiting");
            }
            sleep(READY_BACKOFF);
        }
        bail!(
            "pod {:?} did not become ready after {} checks ({:.1}s)",
            name,
            self.config.ready_retries,
            started.elapsed().as_secs_f64()
        )
    }
}

impl Executor for KubernetesExecutor {
    fn name(&self) -> String {
        "Kubernetes".into()
    }

    fn execute(&self, command: &str) -> Result<Box<dyn TaskHandle>> {
        // At least one line must be logged for `kubectl logs -f` to start
        // streaming.
        let wrapped = format!("echo;{}", self.config.decorators.decorate(command));
        let name = self.config.pod_name();
        info!("k8s: Creating pod {:?} for {:?}", &name, command);

        let root = self.output_root.clone().unwrap_or_else(output_root);
        let out = OutputDir::create(&root, "kubernetes", command)?;

        if let Err(e) = self.create_pod(&name, &wrapped) {
            let _ = out.erase();
            return Err(e);
        }
        if let Err(e) = self.wait_ready(&name) {
            let _ = delete_pod(&self.config, &name);
            let _ = out.erase();
            return Err(e.context(format!("cannot create task on pod {:?}", &name)));
        }

        let logs = self
            .config
            .kubectl()
            .args(&["logs", "-f", &name])
            .stdin(Stdio::null())
            .stdout(out.open_stdout()?)
            .stderr(out.open_stderr()?)
            .spawn();
        let logs = match logs {
            Ok(v) => v,
            Err(e) => {
                let _ = delete_pod(&self.config, &name);
                let _ = out.erase();
                return Err(e).context("failed to stream pod logs");
            }
        };

        let (tx, rx) = channel::bounded::<i32>(1);
        let stopping = Arc::new(AtomicBool::new(false));
        let cfg = self.config.clone();
        let pod = name.clone();
        let watcher_stopping = stopping.clone();
        spawn(move || {
            let code = loop {
                match get_pod(&cfg, &pod) {
                    Ok(PodState::Finished(code)) => break code,
                    Ok(PodState::Gone) => break -1,
                    Ok(_) => {}
                    Err(e) => {
                        if watcher_stopping.load(Ordering::Relaxed) {
                            break -1;
                        }
                        warn!("k8s: Failed to poll pod {:?} ({:#})", &pod, &e);
                    }
                }
                sleep(POLL_INTERVAL);
            };
            debug!("k8s: Pod {:?} finished with {}", &pod, code);
            if let Err(e) = delete_pod(&cfg, &pod) {
                warn!("k8s: {:#}", &e);
            }
            let _ = tx.send(code);
        });

        Ok(Box::new(KubernetesTaskHandle {
            command: command.to_string(),
            pod: name,
            config: self.config.clone(),
            out,
            watch: ExitWatch::new(rx),
            logs: Some(logs),
            stopping,
            clean_state: Default::default(),
        }))
    }
}

pub struct KubernetesTaskHandle {
    command: String,
    pod: String,
    config: KubernetesConfig,
    out: OutputDir,
    watch: ExitWatch,
    logs: Option<Child>,
    stopping: Arc<AtomicBool>,
    clean_state: CleanState,
}

impl TaskHandle for KubernetesTaskHandle {
    fn name(&self) -> String {
        self.command.clone()
    }

    fn status(&mut self) -> (TaskState, Option<TaskStatus>) {
        match self.watch.poll() {
            Some(exit_code) => (
                TaskState::Terminated,
                Some(TaskStatus {
                    exit_code,
                    stdout_path: self.out.stdout_path(),
                    stderr_path: self.out.stderr_path(),
                }),
            ),
            None => (TaskState::Running, None),
        }
    }

    fn wait(&mut self, timeout: Duration) -> bool {
        self.watch.wait(timeout)
    }

    fn stop(&mut self) -> Result<()> {
        if self.watch.poll().is_some() {
            return Ok(());
        }
        self.stopping.store(true, Ordering::Relaxed);
        delete_pod(&self.config, &self.pod)?;
        if !self.watch.wait(STOP_WAIT) {
            bail!("pod {:?} still present {:?} after deletion", &self.pod, STOP_WAIT);
        }
        Ok(())
    }

    fn clean(&mut self) -> Result<()> {
        let state = self.status().0;
        if self.clean_state.check_clean(&self.command, state)? {
            if let Some(mut logs) = self.logs.take() {
                if let Ok(None) = logs.try_wait() {
                    sleep(POLL_INTERVAL);
                    let _ = logs.kill();
                }
                logs.wait()?;
            }
            self.clean_state.cleaned = true;
        }
        Ok(())
    }

    fn erase_output(&mut self) -> Result<()> {
        if self.clean_state.check_erase(&self.command)? {
            self.out.erase()?;
            self.clean_state.erased = true;
        }
        Ok(())
    }

    fn stdout_path(&self) -> PathBuf {
        self.out.stdout_path()
    }

    fn stderr_path(&self) -> PathBuf {
        self.out.stderr_path()
    }

    fn address(&self) -> String {
        self.config.node_name.clone()
    }
}
