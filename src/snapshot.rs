use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type Counters = BTreeMap<String, u64>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub timestamp: String,
    pub platform: Category<PlatformInfo>,
    pub cpu: Category<CpuInfo>,
    pub memory: Category<MemoryInfo>,
    pub swap: Category<SwapInfo>,
    pub disks: Category<Vec<DiskEntry>>,
    pub disk_io: Category<Option<Counters>>,
    pub network_interfaces: Category<BTreeMap<String, Vec<InterfaceAddress>>>,
    pub net_io: Category<Counters>,
    pub top_processes: Category<Vec<ProcessEntry>>,
    pub hostname: Option<String>,
    pub local_ip: Option<String>,
}

/// A metric group that is either populated or replaced by `{"error": ...}`.
///
/// `Failed` is listed first so that deserialization never mistakes a
/// placeholder for a populated value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Category<T> {
    Failed(Placeholder),
    Ok(T),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Placeholder {
    pub error: String,
}

impl<T> Category<T> {
    pub fn failed(message: impl Into<String>) -> Self {
        Category::Failed(Placeholder {
            error: message.into(),
        })
    }

    pub fn as_ok(&self) -> Option<&T> {
        match self {
            Category::Ok(value) => Some(value),
            Category::Failed(_) => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Category::Ok(_) => None,
            Category::Failed(p) => Some(p.error.as_str()),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Category::Failed(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformInfo {
    pub system: String,
    pub node: String,
    pub release: String,
    pub version: String,
    pub machine: String,
    pub processor: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuInfo {
    pub physical_cores: Option<u64>,
    pub logical_processors: Option<u64>,
    pub usage_percent_per_core: Vec<f64>,
    pub avg_usage_percent: f64,
    pub freq_mhz: Option<BTreeMap<String, f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryInfo {
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub used_bytes: u64,
    pub percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapInfo {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskEntry {
    pub device: String,
    pub mountpoint: String,
    pub fstype: String,
    pub opts: String,
    /// `None` when the mount point could not be queried (e.g. permission denied).
    pub usage: Option<DiskUsage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskUsage {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub percent: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceAddress {
    pub family: String,
    pub address: Option<String>,
    pub netmask: Option<String>,
    pub broadcast: Option<String>,
    pub ptp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessEntry {
    pub pid: u32,
    pub name: String,
    pub cpu_percent: f64,
    pub memory: Option<ProcessMemory>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessMemory {
    pub rss: u64,
    pub vms: u64,
}

pub fn percent_of(part: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let pct = (part as f64 / total as f64) * 100.0;
    (pct * 10.0).round() / 10.0
}
