pub mod system;

use crate::snapshot::{
    Category, Counters, CpuInfo, DiskEntry, DiskUsage, InterfaceAddress, MemoryInfo,
    PlatformInfo, ProcessEntry, Snapshot, SwapInfo,
};
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_TOP_PROCESSES: usize = 5;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("нет доступа: {0}")]
    PermissionDenied(String),
    #[error("источник недоступен: {0}")]
    Unavailable(String),
    #[error("не удалось разрешить адрес {host}: {reason}")]
    Resolve { host: String, reason: String },
    #[error("ошибка ввода-вывода: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub device: String,
    pub mountpoint: String,
    pub fstype: String,
    pub opts: String,
}

pub trait HostProbe {
    fn platform(&mut self) -> Result<PlatformInfo, ProbeError>;
    /// Blocks for `sample` to average usage over an interval.
    fn cpu(&mut self, sample: Duration) -> Result<CpuInfo, ProbeError>;
    fn memory(&mut self) -> Result<MemoryInfo, ProbeError>;
    fn swap(&mut self) -> Result<SwapInfo, ProbeError>;
    fn partitions(&mut self) -> Result<Vec<Partition>, ProbeError>;
    fn disk_usage(&mut self, mountpoint: &str) -> Result<DiskUsage, ProbeError>;
    /// `Ok(None)` when the platform exposes no aggregate I/O counters.
    fn disk_io(&mut self) -> Result<Option<Counters>, ProbeError>;
    fn interfaces(&mut self) -> Result<BTreeMap<String, Vec<InterfaceAddress>>, ProbeError>;
    fn net_io(&mut self) -> Result<Counters, ProbeError>;
    fn processes(&mut self) -> Result<Vec<ProcessEntry>, ProbeError>;
    fn hostname(&mut self) -> Result<String, ProbeError>;
    fn resolve_ip(&mut self, hostname: &str) -> Result<String, ProbeError>;
}

#[derive(Debug, Clone)]
pub struct CollectOptions {
    pub cpu_sample_interval: Duration,
    pub top_process_limit: usize,
}

impl Default for CollectOptions {
    fn default() -> Self {
        Self {
            cpu_sample_interval: Duration::from_secs(1),
            top_process_limit: DEFAULT_TOP_PROCESSES,
        }
    }
}

pub fn degrade<T>(
    category: &str,
    producer: impl FnOnce() -> Result<T, ProbeError>,
) -> Category<T> {
    match producer() {
        Ok(value) => Category::Ok(value),
        Err(err) => {
            warn!(category, error = %err, "категория не собрана, записана ошибка");
            Category::failed(err.to_string())
        }
    }
}

pub fn collect<P: HostProbe>(probe: &mut P, opts: &CollectOptions) -> Snapshot {
    let timestamp = humantime::format_rfc3339_micros(SystemTime::now()).to_string();

    let platform = degrade("platform", || probe.platform());
    let cpu = degrade("cpu", || probe.cpu(opts.cpu_sample_interval));
    let memory = degrade("memory", || probe.memory());
    let swap = degrade("swap", || probe.swap());
    let disks = degrade("disks", || collect_disks(probe));
    let disk_io = degrade("disk_io", || probe.disk_io());
    let network_interfaces = degrade("network_interfaces", || probe.interfaces());
    let net_io = degrade("net_io", || probe.net_io());
    let top_processes = degrade("top_processes", || {
        probe
            .processes()
            .map(|procs| rank_processes(procs, opts.top_process_limit))
    });

    let (hostname, local_ip) = match probe.hostname() {
        Ok(name) => {
            let ip = match probe.resolve_ip(&name) {
                Ok(ip) => Some(ip),
                Err(err) => {
                    debug!(hostname = %name, error = %err, "локальный IP не определён");
                    None
                }
            };
            (Some(name), ip)
        }
        Err(err) => {
            warn!(error = %err, "имя хоста не определено");
            (None, None)
        }
    };

    let snapshot = Snapshot {
        timestamp,
        platform,
        cpu,
        memory,
        swap,
        disks,
        disk_io,
        network_interfaces,
        net_io,
        top_processes,
        hostname,
        local_ip,
    };
    info!(
        failed_categories = failed_categories(&snapshot).len(),
        "сбор сведений о системе завершён"
    );
    snapshot
}

fn collect_disks<P: HostProbe>(probe: &mut P) -> Result<Vec<DiskEntry>, ProbeError> {
    let partitions = probe.partitions()?;
    let mut disks = Vec::with_capacity(partitions.len());
    for part in partitions {
        let usage = match probe.disk_usage(&part.mountpoint) {
            Ok(usage) => Some(usage),
            Err(ProbeError::PermissionDenied(reason)) => {
                debug!(mountpoint = %part.mountpoint, reason = %reason, "нет доступа к точке монтирования");
                None
            }
            Err(err) => {
                debug!(mountpoint = %part.mountpoint, error = %err, "не удалось получить заполненность диска");
                None
            }
        };
        disks.push(DiskEntry {
            device: part.device,
            mountpoint: part.mountpoint,
            fstype: part.fstype,
            opts: part.opts,
            usage,
        });
    }
    Ok(disks)
}

/// Highest CPU consumers first; equal usage keeps enumeration order.
pub fn rank_processes(mut procs: Vec<ProcessEntry>, limit: usize) -> Vec<ProcessEntry> {
    for p in &mut procs {
        if !p.cpu_percent.is_finite() {
            p.cpu_percent = 0.0;
        }
    }
    procs.sort_by(|a, b| b.cpu_percent.total_cmp(&a.cpu_percent));
    procs.truncate(limit);
    procs
}

pub fn failed_categories(snapshot: &Snapshot) -> Vec<&'static str> {
    let checks = [
        ("platform", snapshot.platform.is_failed()),
        ("cpu", snapshot.cpu.is_failed()),
        ("memory", snapshot.memory.is_failed()),
        ("swap", snapshot.swap.is_failed()),
        ("disks", snapshot.disks.is_failed()),
        ("disk_io", snapshot.disk_io.is_failed()),
        ("network_interfaces", snapshot.network_interfaces.is_failed()),
        ("net_io", snapshot.net_io.is_failed()),
        ("top_processes", snapshot.top_processes.is_failed()),
    ];
    checks
        .into_iter()
        .filter(|(_, failed)| *failed)
        .map(|(name, _)| name)
        .collect()
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::collections::HashSet;

    #[derive(Debug, Clone, Default)]
    pub struct FakeProbe {
        pub failing: HashSet<&'static str>,
        pub denied_mounts: HashSet<String>,
        pub partitions: Vec<Partition>,
        pub processes: Vec<ProcessEntry>,
        pub hostname: Option<String>,
        pub ip: Option<String>,
        pub cpu_samples: Vec<Duration>,
    }

    impl FakeProbe {
        pub fn healthy() -> Self {
            Self {
                partitions: vec![
                    partition("/dev/sda1", "/"),
                    partition("/dev/sdb1", "/data"),
                    partition("/dev/sr0", "/media/cdrom"),
                ],
                processes: (1..=8)
                    .map(|pid| process(pid, (pid * 7 % 5) as f64 * 10.0))
                    .collect(),
                hostname: Some("HOST1".to_string()),
                ip: Some("192.168.0.10".to_string()),
                ..Self::default()
            }
        }

        fn fail_if(&self, category: &str) -> Result<(), ProbeError> {
            if self.failing.contains(category) {
                return Err(ProbeError::Unavailable(format!("{category} отключён")));
            }
            Ok(())
        }
    }

    pub fn partition(device: &str, mountpoint: &str) -> Partition {
        Partition {
            device: device.to_string(),
            mountpoint: mountpoint.to_string(),
            fstype: "ext4".to_string(),
            opts: "rw,relatime".to_string(),
        }
    }

    pub fn process(pid: u32, cpu_percent: f64) -> ProcessEntry {
        ProcessEntry {
            pid,
            name: format!("proc-{pid}"),
            cpu_percent,
            memory: Some(crate::snapshot::ProcessMemory {
                rss: 4096 * pid as u64,
                vms: 8192 * pid as u64,
            }),
        }
    }

    impl HostProbe for FakeProbe {
        fn platform(&mut self) -> Result<PlatformInfo, ProbeError> {
            self.fail_if("platform")?;
            Ok(PlatformInfo {
                system: "Linux".to_string(),
                node: "HOST1".to_string(),
                release: "6.1.0".to_string(),
                version: "Debian 12".to_string(),
                machine: "x86_64".to_string(),
                processor: "AMD Ryzen™ 7 5800X".to_string(),
            })
        }

        fn cpu(&mut self, sample: Duration) -> Result<CpuInfo, ProbeError> {
            self.fail_if("cpu")?;
            self.cpu_samples.push(sample);
            Ok(CpuInfo {
                physical_cores: Some(2),
                logical_processors: Some(4),
                usage_percent_per_core: vec![12.5, 0.0, 100.0, 33.3],
                avg_usage_percent: 36.45,
                freq_mhz: None,
            })
        }

        fn memory(&mut self) -> Result<MemoryInfo, ProbeError> {
            self.fail_if("memory")?;
            Ok(MemoryInfo {
                total_bytes: 16 * 1024 * 1024 * 1024,
                available_bytes: 8 * 1024 * 1024 * 1024,
                used_bytes: 8 * 1024 * 1024 * 1024,
                percent: 50.0,
            })
        }

        fn swap(&mut self) -> Result<SwapInfo, ProbeError> {
            self.fail_if("swap")?;
            Ok(SwapInfo {
                total: 2048,
                used: 512,
                free: 1536,
                percent: 25.0,
            })
        }

        fn partitions(&mut self) -> Result<Vec<Partition>, ProbeError> {
            self.fail_if("disks")?;
            Ok(self.partitions.clone())
        }

        fn disk_usage(&mut self, mountpoint: &str) -> Result<DiskUsage, ProbeError> {
            if self.denied_mounts.contains(mountpoint) {
                return Err(ProbeError::PermissionDenied(mountpoint.to_string()));
            }
            Ok(DiskUsage {
                total: 1000,
                used: 250,
                free: 750,
                percent: 25.0,
            })
        }

        fn disk_io(&mut self) -> Result<Option<Counters>, ProbeError> {
            self.fail_if("disk_io")?;
            Ok(Some(Counters::from([
                ("read_bytes".to_string(), 512),
                ("write_bytes".to_string(), 1024),
            ])))
        }

        fn interfaces(&mut self) -> Result<BTreeMap<String, Vec<InterfaceAddress>>, ProbeError> {
            self.fail_if("network_interfaces")?;
            Ok(BTreeMap::from([(
                "eth0".to_string(),
                vec![InterfaceAddress {
                    family: "AF_INET".to_string(),
                    address: Some("192.168.0.10".to_string()),
                    netmask: Some("255.255.255.0".to_string()),
                    broadcast: Some("192.168.0.255".to_string()),
                    ptp: None,
                }],
            )]))
        }

        fn net_io(&mut self) -> Result<Counters, ProbeError> {
            self.fail_if("net_io")?;
            Ok(Counters::from([
                ("bytes_recv".to_string(), 100),
                ("bytes_sent".to_string(), 200),
            ]))
        }

        fn processes(&mut self) -> Result<Vec<ProcessEntry>, ProbeError> {
            self.fail_if("top_processes")?;
            Ok(self.processes.clone())
        }

        fn hostname(&mut self) -> Result<String, ProbeError> {
            self.hostname
                .clone()
                .ok_or_else(|| ProbeError::Unavailable("hostname".to_string()))
        }

        fn resolve_ip(&mut self, hostname: &str) -> Result<String, ProbeError> {
            self.ip.clone().ok_or_else(|| ProbeError::Resolve {
                host: hostname.to_string(),
                reason: "NXDOMAIN".to_string(),
            })
        }
    }
}
