// Copyright (c) Facebook, Inc. and its affiliates.
//! Facts about the machine an experiment runs on. Every fact is best
//! effort: whatever cannot be determined is left out.
use anyhow::{anyhow, Result};
use log::debug;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::process::Command;
use sysinfo::System;

use swan_util::*;

pub const CPU_MODEL: &str = "cpu_model";
pub const KERNEL_VERSION: &str = "kernel_version";
pub const OS_VERSION: &str = "os_version";
pub const HOSTNAME: &str = "hostname";
pub const TOPOLOGY: &str = "cpu_topology";
pub const DOCKER_VERSION: &str = "docker_version";
pub const COLLECTOR_VERSION: &str = "collector_version";

fn insert<F: FnOnce() -> Result<String>>(facts: &mut BTreeMap<String, String>, key: &str, f: F) {
    match f() {
        Ok(v) => {
            facts.insert(key.to_string(), v);
        }
        Err(e) => debug!("platform: Skipping {} ({:#})", key, &e),
    }
}

fn cpu_model() -> Result<String> {
    let mut sys = System::new();
    sys.refresh_cpu();
    sys.cpus()
        .first()
        .map(|cpu| cpu.brand().trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow!("no CPU brand"))
}

/// Scaling governor of every CPU, keyed `governor/cpu<N>`.
pub fn governors(sys_cpu: &Path) -> BTreeMap<String, String> {
    let mut facts = BTreeMap::new();
    let entries = match fs::read_dir(sys_cpu) {
        Ok(v) => v,
        Err(e) => {
            debug!("platform: Cannot list {:?} ({})", sys_cpu, &e);
            return facts;
        }
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name().to_string_lossy().to_string();
        let is_cpu = name.starts_with("cpu") && name[3..].chars().all(|c| c.is_ascii_digit());
        if !is_cpu || name.len() == 3 {
            continue;
        }
        if let Ok(gov) = read_one_line(entry.path().join("cpufreq/scaling_governor")) {
            facts.insert(format!("governor/{}", &name), gov.trim().to_string());
        }
    }
    facts
}

/// IRQ numbers of `/proc/interrupts` lines mentioning `nic`.
pub fn nic_irqs(interrupts: &str, nic: &str) -> Vec<u32> {
    interrupts
        .lines()
        .filter(|line| line.split_whitespace().any(|tok| tok.starts_with(nic)))
        .filter_map(|line| line.split(':').next())
        .filter_map(|irq| irq.trim().parse::<u32>().ok())
        .collect()
}

/// CPU affinity of every NIC interrupt, keyed `irq/<nic>/<irq>`.
pub fn irq_affinities() -> BTreeMap<String, String> {
    let mut facts = BTreeMap::new();
    let interrupts = match fs::read_to_string("/proc/interrupts") {
        Ok(v) => v,
        Err(_) => return facts,
    };
    let nics = match fs::read_dir("/sys/class/net") {
        Ok(v) => v,
        Err(_) => return facts,
    };
    for nic in nics.filter_map(|e| e.ok()) {
        let nic = nic.file_name().to_string_lossy().to_string();
        if nic == "lo" {
            continue;
        }
        for irq in nic_irqs(&interrupts, &nic) {
            let path = format!("/proc/irq/{}/smp_affinity_list", irq);
            if let Ok(aff) = read_one_line(&path) {
                facts.insert(format!("irq/{}/{}", &nic, irq), aff.trim().to_string());
            }
        }
    }
    facts
}

/// Collects everything known about this host. `collector` is the telemetry
/// collector binary whose version is recorded if present.
pub fn facts(collector: Option<&str>) -> BTreeMap<String, String> {
    let mut facts = BTreeMap::new();
    insert(&mut facts, CPU_MODEL, cpu_model);
    insert(&mut facts, KERNEL_VERSION, || {
        System::kernel_version().ok_or_else(|| anyhow!("unknown"))
    });
    insert(&mut facts, OS_VERSION, || {
        System::long_os_version().ok_or_else(|| anyhow!("unknown"))
    });
    insert(&mut facts, HOSTNAME, || {
        System::host_name().ok_or_else(|| anyhow!("unknown"))
    });
    insert(&mut facts, TOPOLOGY, || command_output(Command::new("lscpu").arg("-e")));
    insert(&mut facts, DOCKER_VERSION, || {
        command_output(
            Command::new("docker")
                .arg("version")
                .arg("--format")
                .arg("{{.Server.Version}}"),
        )
    });
    if let Some(path) = collector {
        insert(&mut facts, COLLECTOR_VERSION, || {
            command_output(Command::new(path).arg("--version"))
        });
    }
    facts.extend(governors(Path::new("/sys/devices/system/cpu")));
    facts.extend(irq_affinities());
    facts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nic_irqs() {
        let interrupts = "\
            CPU0       CPU1
  0:         33          0   IO-APIC   2-edge      timer
 24:          0     123456   PCI-MSI 524288-edge      eth0-TxRx-0
 25:          0     654321   PCI-MSI 524289-edge      eth0-TxRx-1
 26:          1          0   PCI-MSI 524290-edge      eth1
NMI:          0          0   Non-maskable interrupts
";
        assert_eq!(nic_irqs(interrupts, "eth0"), vec![24, 25]);
        assert_eq!(nic_irqs(interrupts, "eth1"), vec![26]);
        assert!(nic_irqs(interrupts, "ens3").is_empty());
    }

    #[test]
    fn test_governors() {
        let dir = tempfile::TempDir::new().unwrap();
        for (cpu, gov) in &[("cpu0", "performance"), ("cpu1", "powersave")] {
            let path = dir.path().join(cpu).join("cpufreq");
            fs::create_dir_all(&path).unwrap();
            fs::write(path.join("scaling_governor"), format!("{}\n", gov)).unwrap();
        }
        fs::create_dir_all(dir.path().join("cpufreq")).unwrap();
        fs::create_dir_all(dir.path().join("cpuidle")).unwrap();

        let govs = governors(dir.path());
        assert_eq!(govs.len(), 2);
        assert_eq!(govs["governor/cpu0"], "performance");
        assert_eq!(govs["governor/cpu1"], "powersave");
    }
}
