use crate::collectors::{HostProbe, Partition, ProbeError};
use crate::snapshot::{
    percent_of, Counters, CpuInfo, DiskUsage, InterfaceAddress, MemoryInfo, PlatformInfo,
    ProcessEntry, ProcessMemory, SwapInfo,
};
use std::collections::BTreeMap;
#[cfg(target_os = "linux")]
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;
use sysinfo::{Disks, Networks, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::debug;

pub struct SysinfoProbe {
    system: System,
    disks: Disks,
    networks: Networks,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            disks: Disks::new(),
            networks: Networks::new(),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl HostProbe for SysinfoProbe {
    fn platform(&mut self) -> Result<PlatformInfo, ProbeError> {
        self.system.refresh_cpu_all();
        let processor = self
            .system
            .cpus()
            .first()
            .map(|c| c.brand().trim().to_string())
            .unwrap_or_default();

        Ok(PlatformInfo {
            system: os_family(std::env::consts::OS).to_string(),
            node: System::host_name().unwrap_or_default(),
            release: System::kernel_version().unwrap_or_default(),
            version: System::long_os_version()
                .or_else(System::os_version)
                .unwrap_or_default(),
            machine: std::env::consts::ARCH.to_string(),
            processor,
        })
    }

    fn cpu(&mut self, sample: Duration) -> Result<CpuInfo, ProbeError> {
        self.system.refresh_cpu_all();
        std::thread::sleep(sample.max(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL));
        self.system.refresh_cpu_all();

        let cpus = self.system.cpus();
        if cpus.is_empty() {
            return Err(ProbeError::Unavailable(
                "список процессоров пуст".to_string(),
            ));
        }

        let per_core: Vec<f64> = cpus
            .iter()
            .map(|c| finite_or_zero(c.cpu_usage() as f64))
            .collect();
        let avg = per_core.iter().sum::<f64>() / per_core.len() as f64;
        let freqs: Vec<u64> = cpus.iter().map(|c| c.frequency()).collect();

        Ok(CpuInfo {
            physical_cores: self.system.physical_core_count().map(|n| n as u64),
            logical_processors: Some(cpus.len() as u64),
            usage_percent_per_core: per_core,
            avg_usage_percent: avg,
            freq_mhz: frequency_summary(&freqs),
        })
    }

    fn memory(&mut self) -> Result<MemoryInfo, ProbeError> {
        self.system.refresh_memory();
        let total = self.system.total_memory();
        if total == 0 {
            return Err(ProbeError::Unavailable(
                "объём памяти не определён".to_string(),
            ));
        }
        let used = self.system.used_memory();
        Ok(MemoryInfo {
            total_bytes: total,
            available_bytes: self.system.available_memory(),
            used_bytes: used,
            percent: percent_of(used, total),
        })
    }

    fn swap(&mut self) -> Result<SwapInfo, ProbeError> {
        self.system.refresh_memory();
        let total = self.system.total_swap();
        let used = self.system.used_swap();
        Ok(SwapInfo {
            total,
            used,
            free: self.system.free_swap(),
            percent: percent_of(used, total),
        })
    }

    fn partitions(&mut self) -> Result<Vec<Partition>, ProbeError> {
        self.disks = Disks::new_with_refreshed_list();
        let mount_opts = read_mount_options();

        Ok(self
            .disks
            .iter()
            .map(|d| {
                let mountpoint = d.mount_point().to_string_lossy().to_string();
                let opts = mount_opts
                    .get(&mountpoint)
                    .cloned()
                    .unwrap_or_else(|| default_mount_options(d.is_removable()));
                Partition {
                    device: d.name().to_string_lossy().to_string(),
                    fstype: d.file_system().to_string_lossy().to_string(),
                    mountpoint,
                    opts,
                }
            })
            .collect())
    }

    fn disk_usage(&mut self, mountpoint: &str) -> Result<DiskUsage, ProbeError> {
        check_mount_access(Path::new(mountpoint))?;
        let disk = self
            .disks
            .iter()
            .find(|d| d.mount_point() == Path::new(mountpoint))
            .ok_or_else(|| ProbeError::Unavailable(format!("точка монтирования {mountpoint}")))?;

        let total = disk.total_space();
        let free = disk.available_space();
        let used = total.saturating_sub(free);
        Ok(DiskUsage {
            total,
            used,
            free,
            percent: percent_of(used, total),
        })
    }

    #[cfg(target_os = "linux")]
    fn disk_io(&mut self) -> Result<Option<Counters>, ProbeError> {
        let text = fs::read_to_string("/proc/diskstats")?;
        let counters = parse_diskstats(&text, |name| {
            Path::new("/sys/block").join(name).exists()
        });
        Ok(Some(counters))
    }

    #[cfg(not(target_os = "linux"))]
    fn disk_io(&mut self) -> Result<Option<Counters>, ProbeError> {
        Ok(None)
    }

    fn interfaces(&mut self) -> Result<BTreeMap<String, Vec<InterfaceAddress>>, ProbeError> {
        self.networks = Networks::new_with_refreshed_list();
        let mut out = BTreeMap::new();
        for (name, data) in &self.networks {
            let mut addrs = Vec::new();
            let mac = data.mac_address();
            if !mac.is_unspecified() {
                addrs.push(InterfaceAddress {
                    family: LINK_FAMILY.to_string(),
                    address: Some(mac.to_string()),
                    netmask: None,
                    broadcast: None,
                    ptp: None,
                });
            }
            for net in data.ip_networks() {
                addrs.push(interface_address(net.addr, net.prefix));
            }
            out.insert(name.clone(), addrs);
        }
        debug!(interfaces = out.len(), "сетевые интерфейсы собраны");
        Ok(out)
    }

    fn net_io(&mut self) -> Result<Counters, ProbeError> {
        if self.networks.is_empty() {
            self.networks = Networks::new_with_refreshed_list();
        }
        let mut counters = Counters::new();
        for (key, value) in [
            ("bytes_sent", self.networks.values().map(|n| n.total_transmitted()).sum::<u64>()),
            ("bytes_recv", self.networks.values().map(|n| n.total_received()).sum()),
            ("packets_sent", self.networks.values().map(|n| n.total_packets_transmitted()).sum()),
            ("packets_recv", self.networks.values().map(|n| n.total_packets_received()).sum()),
            ("errout", self.networks.values().map(|n| n.total_errors_on_transmitted()).sum()),
            ("errin", self.networks.values().map(|n| n.total_errors_on_received()).sum()),
        ] {
            counters.insert(key.to_string(), value);
        }
        Ok(counters)
    }

    fn processes(&mut self) -> Result<Vec<ProcessEntry>, ProbeError> {
        // Per-process CPU usage needs two refreshes.
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::everything(),
        );
        std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::everything(),
        );

        let processes = self.system.processes();
        if processes.is_empty() {
            return Err(ProbeError::Unavailable(
                "таблица процессов пуста".to_string(),
            ));
        }

        Ok(processes
            .values()
            .map(|p| {
                let rss = p.memory();
                let vms = p.virtual_memory();
                ProcessEntry {
                    pid: p.pid().as_u32(),
                    name: p.name().to_string_lossy().to_string(),
                    cpu_percent: finite_or_zero(p.cpu_usage() as f64),
                    memory: (rss > 0 || vms > 0).then_some(ProcessMemory { rss, vms }),
                }
            })
            .collect())
    }

    fn hostname(&mut self) -> Result<String, ProbeError> {
        System::host_name()
            .filter(|h| !h.trim().is_empty())
            .ok_or_else(|| ProbeError::Unavailable("имя хоста".to_string()))
    }

    fn resolve_ip(&mut self, hostname: &str) -> Result<String, ProbeError> {
        let resolve_err = |reason: String| ProbeError::Resolve {
            host: hostname.to_string(),
            reason,
        };
        let addrs: Vec<IpAddr> = (hostname, 0)
            .to_socket_addrs()
            .map_err(|e| resolve_err(e.to_string()))?
            .map(|a| a.ip())
            .collect();

        addrs
            .iter()
            .find(|ip| ip.is_ipv4())
            .or_else(|| addrs.first())
            .map(|ip| ip.to_string())
            .ok_or_else(|| resolve_err("пустой ответ".to_string()))
    }
}

#[cfg(target_os = "linux")]
const LINK_FAMILY: &str = "AF_PACKET";
#[cfg(not(target_os = "linux"))]
const LINK_FAMILY: &str = "AF_LINK";

fn os_family(os: &str) -> &str {
    match os {
        "linux" => "Linux",
        "windows" => "Windows",
        "macos" => "Darwin",
        "freebsd" => "FreeBSD",
        other => other,
    }
}

fn finite_or_zero(v: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

fn frequency_summary(freqs: &[u64]) -> Option<BTreeMap<String, f64>> {
    let known: Vec<u64> = freqs.iter().copied().filter(|f| *f > 0).collect();
    if known.is_empty() {
        return None;
    }
    let current = known.iter().sum::<u64>() as f64 / known.len() as f64;
    let min = known.iter().copied().min().unwrap_or(0) as f64;
    let max = known.iter().copied().max().unwrap_or(0) as f64;
    Some(BTreeMap::from([
        ("current".to_string(), current),
        ("max".to_string(), max),
        ("min".to_string(), min),
    ]))
}

fn interface_address(addr: IpAddr, prefix: u8) -> InterfaceAddress {
    match addr {
        IpAddr::V4(ip) => {
            let mask = ipv4_mask(prefix);
            let broadcast = Ipv4Addr::from(u32::from(ip) | !u32::from(mask));
            InterfaceAddress {
                family: "AF_INET".to_string(),
                address: Some(ip.to_string()),
                netmask: Some(mask.to_string()),
                broadcast: (prefix < 31).then(|| broadcast.to_string()),
                ptp: None,
            }
        }
        IpAddr::V6(ip) => InterfaceAddress {
            family: "AF_INET6".to_string(),
            address: Some(ip.to_string()),
            netmask: Some(ipv6_mask(prefix).to_string()),
            broadcast: None,
            ptp: None,
        },
    }
}

fn ipv4_mask(prefix: u8) -> Ipv4Addr {
    let bits = u32::from(prefix.min(32));
    let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
    Ipv4Addr::from(mask)
}

fn ipv6_mask(prefix: u8) -> Ipv6Addr {
    let bits = u32::from(prefix.min(128));
    let mask = if bits == 0 { 0 } else { u128::MAX << (128 - bits) };
    Ipv6Addr::from(mask)
}

fn check_mount_access(path: &Path) -> Result<(), ProbeError> {
    match fs::read_dir(path) {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == ErrorKind::PermissionDenied => Err(
            ProbeError::PermissionDenied(format!("{}: {err}", path.display())),
        ),
        Err(err) => Err(ProbeError::Io(err)),
    }
}

fn default_mount_options(removable: bool) -> String {
    if removable {
        "rw,removable".to_string()
    } else {
        "rw,fixed".to_string()
    }
}

#[cfg(target_os = "linux")]
fn read_mount_options() -> HashMap<String, String> {
    match fs::read_to_string("/proc/mounts") {
        Ok(text) => parse_mounts(&text),
        Err(err) => {
            debug!(error = %err, "не удалось прочитать /proc/mounts");
            HashMap::new()
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn read_mount_options() -> std::collections::HashMap<String, String> {
    std::collections::HashMap::new()
}

#[cfg(target_os = "linux")]
fn parse_mounts(text: &str) -> HashMap<String, String> {
    text.lines()
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let _device = cols.next()?;
            let mountpoint = cols.next()?;
            let _fstype = cols.next()?;
            let opts = cols.next()?;
            Some((unescape_mount_path(mountpoint), opts.to_string()))
        })
        .collect()
}

#[cfg(target_os = "linux")]
fn unescape_mount_path(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = std::str::from_utf8(&bytes[i + 1..i + 4]).ok();
            if let Some(v) = digits.and_then(|d| u8::from_str_radix(d, 8).ok()) {
                out.push(v);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).to_string()
}

/// Sums whole-disk rows of `/proc/diskstats`; partitions are skipped so
/// their I/O is not counted twice.
#[cfg(target_os = "linux")]
fn parse_diskstats(text: &str, is_disk: impl Fn(&str) -> bool) -> Counters {
    const SECTOR_BYTES: u64 = 512;
    let mut read_count = 0_u64;
    let mut read_bytes = 0_u64;
    let mut read_time = 0_u64;
    let mut write_count = 0_u64;
    let mut write_bytes = 0_u64;
    let mut write_time = 0_u64;
    let mut busy_time = 0_u64;

    for line in text.lines() {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() < 13 || !is_disk(cols[2]) {
            continue;
        }
        let field = |i: usize| cols[i].parse::<u64>().unwrap_or(0);
        read_count = read_count.saturating_add(field(3));
        read_bytes = read_bytes.saturating_add(field(5).saturating_mul(SECTOR_BYTES));
        read_time = read_time.saturating_add(field(6));
        write_count = write_count.saturating_add(field(7));
        write_bytes = write_bytes.saturating_add(field(9).saturating_mul(SECTOR_BYTES));
        write_time = write_time.saturating_add(field(10));
        busy_time = busy_time.saturating_add(field(12));
    }

    Counters::from([
        ("busy_time".to_string(), busy_time),
        ("read_bytes".to_string(), read_bytes),
        ("read_count".to_string(), read_count),
        ("read_time".to_string(), read_time),
        ("write_bytes".to_string(), write_bytes),
        ("write_count".to_string(), write_count),
        ("write_time".to_string(), write_time),
    ])
}
