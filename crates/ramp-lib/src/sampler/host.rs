//! Host resource sampling from procfs
//!
//! Reads cumulative counters and turns the delta between two ticks into
//! rates:
//! - /proc/stat for CPU busy time
//! - /proc/meminfo for memory in use
//! - /proc/diskstats for per-device IOPS, throughput, latency, utilization
//! - /proc/net/dev for link bandwidth and packet rate
//! - `ethtool -S` for ENA allowance-exceeded counters (optional)

use super::ResourceSampler;
use crate::models::{clamp_percent, DeviceSample, NicAllowance, ResourceSample};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::fs;
use tracing::{debug, warn};

const SECTOR_BYTES: f64 = 512.0;
const MIB: f64 = 1024.0 * 1024.0;
const ETHTOOL_TIMEOUT: Duration = Duration::from_secs(2);

/// Configuration for the host sampler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSamplerConfig {
    /// procfs mount point
    pub proc_root: PathBuf,
    /// Block device holding the ledger, e.g. `nvme1n1`
    pub data_device: Option<String>,
    /// Block device holding account state, if separate
    pub accounts_device: Option<String>,
    /// Interface carrying RPC traffic, e.g. `eth0`
    pub network_interface: Option<String>,
    /// Link capacity used as 100% bandwidth
    pub link_bandwidth_mbps: f64,
    /// Packet rate used as 100% PPS
    pub link_max_pps: f64,
    /// Read ENA allowance counters through `ethtool -S`
    pub nic_allowance_checks: bool,
    pub ethtool_path: String,
}

impl Default for HostSamplerConfig {
    fn default() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
            data_device: None,
            accounts_device: None,
            network_interface: None,
            link_bandwidth_mbps: 25_000.0,
            link_max_pps: 1_000_000.0,
            nic_allowance_checks: false,
            ethtool_path: "ethtool".to_string(),
        }
    }
}

/// Aggregate CPU jiffies from the first line of /proc/stat
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub busy: u64,
    pub total: u64,
}

/// Cumulative counters for one block device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskCounters {
    pub reads: u64,
    pub sectors_read: u64,
    pub read_ms: u64,
    pub writes: u64,
    pub sectors_written: u64,
    pub write_ms: u64,
    pub io_ticks_ms: u64,
}

/// Cumulative counters for one network interface
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetCounters {
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
}

/// Parse the aggregate `cpu` line of /proc/stat
pub fn parse_cpu_times(content: &str) -> Result<CpuTimes> {
    let line = content
        .lines()
        .find(|l| l.starts_with("cpu "))
        .context("No aggregate cpu line in /proc/stat")?;

    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .map(|v| v.parse().unwrap_or(0))
        .collect();
    if fields.len() < 4 {
        anyhow::bail!("Truncated cpu line in /proc/stat: {}", line);
    }

    // user nice system idle iowait irq softirq steal; guest time is already in user
    let total: u64 = fields.iter().take(8).sum();
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);

    Ok(CpuTimes {
        busy: total.saturating_sub(idle),
        total,
    })
}

/// Parse /proc/meminfo into a used-memory percentage
pub fn parse_meminfo(content: &str) -> Result<f64> {
    let mut total = None;
    let mut available = None;

    for line in content.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() >= 2 {
            match parts[0] {
                "MemTotal:" => total = parts[1].parse::<u64>().ok(),
                "MemAvailable:" => available = parts[1].parse::<u64>().ok(),
                _ => {}
            }
        }
    }

    let total = total.context("MemTotal missing from /proc/meminfo")?;
    let available = available.context("MemAvailable missing from /proc/meminfo")?;
    if total == 0 {
        anyhow::bail!("MemTotal is zero");
    }

    Ok(clamp_percent(
        total.saturating_sub(available) as f64 / total as f64 * 100.0,
    ))
}

/// Find the counters for `device` in /proc/diskstats
pub fn parse_diskstats(content: &str, device: &str) -> Option<DiskCounters> {
    content.lines().find_map(|line| {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 14 || parts[2] != device {
            return None;
        }
        let field = |i: usize| parts[3 + i].parse::<u64>().unwrap_or(0);
        Some(DiskCounters {
            reads: field(0),
            sectors_read: field(2),
            read_ms: field(3),
            writes: field(4),
            sectors_written: field(6),
            write_ms: field(7),
            io_ticks_ms: field(9),
        })
    })
}

/// Find the counters for `interface` in /proc/net/dev
pub fn parse_net_dev(content: &str, interface: &str) -> Option<NetCounters> {
    content.lines().find_map(|line| {
        let (name, rest) = line.split_once(':')?;
        if name.trim() != interface {
            return None;
        }
        let fields: Vec<u64> = rest
            .split_whitespace()
            .map(|v| v.parse().unwrap_or(0))
            .collect();
        if fields.len() < 10 {
            return None;
        }
        Some(NetCounters {
            rx_bytes: fields[0],
            rx_packets: fields[1],
            tx_bytes: fields[8],
            tx_packets: fields[9],
        })
    })
}

/// Parse `ethtool -S` output into counter name → value
pub fn parse_ethtool_stats(content: &str) -> HashMap<String, u64> {
    content
        .lines()
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            let value = value.trim().parse::<u64>().ok()?;
            Some((name.trim().to_string(), value))
        })
        .collect()
}

/// Counters captured at one tick
#[derive(Debug, Clone, Default)]
struct Snapshot {
    at: Option<Instant>,
    cpu: CpuTimes,
    data_disk: Option<DiskCounters>,
    accounts_disk: Option<DiskCounters>,
    net: Option<NetCounters>,
    nic: Option<HashMap<String, u64>>,
}

/// Resource sampler reading the local host's procfs
pub struct HostSampler {
    config: HostSamplerConfig,
    previous: Mutex<Snapshot>,
}

impl HostSampler {
    /// Create a sampler and capture the baseline counters
    pub async fn new(config: HostSamplerConfig) -> Result<Self> {
        let sampler = Self {
            config,
            previous: Mutex::new(Snapshot::default()),
        };
        let baseline = sampler.snapshot().await?;
        *sampler.lock_previous() = baseline;

        let unmonitored = sampler.unmonitored_dimensions();
        if !unmonitored.is_empty() {
            warn!(
                dimensions = ?unmonitored,
                "Dimensions not monitored; their values read 0 and can never flag a bottleneck"
            );
        }
        Ok(sampler)
    }

    /// Resource dimensions this configuration cannot observe
    pub fn unmonitored_dimensions(&self) -> Vec<&'static str> {
        let mut dims = Vec::new();
        if self.config.network_interface.is_none() {
            dims.extend(["network_bandwidth", "network_pps"]);
            if self.config.nic_allowance_checks {
                dims.push("nic_allowance");
            }
        }
        dims
    }

    pub fn config(&self) -> &HostSamplerConfig {
        &self.config
    }

    fn lock_previous(&self) -> std::sync::MutexGuard<'_, Snapshot> {
        match self.previous.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn read_proc(&self, name: &str) -> Result<String> {
        let path = self.config.proc_root.join(name);
        fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))
    }

    async fn snapshot(&self) -> Result<Snapshot> {
        let cpu = parse_cpu_times(&self.read_proc("stat").await?)?;

        let (data_disk, accounts_disk) =
            if self.config.data_device.is_some() || self.config.accounts_device.is_some() {
                let diskstats = self.read_proc("diskstats").await?;
                (
                    self.device_counters(&diskstats, self.config.data_device.as_deref())?,
                    self.device_counters(&diskstats, self.config.accounts_device.as_deref())?,
                )
            } else {
                (None, None)
            };

        let net = match &self.config.network_interface {
            Some(iface) => {
                let content = self.read_proc("net/dev").await?;
                Some(
                    parse_net_dev(&content, iface)
                        .with_context(|| format!("Interface {} not found in net/dev", iface))?,
                )
            }
            None => None,
        };

        let nic = if self.config.nic_allowance_checks {
            self.read_ethtool().await
        } else {
            None
        };

        Ok(Snapshot {
            at: Some(Instant::now()),
            cpu,
            data_disk,
            accounts_disk,
            net,
            nic,
        })
    }

    fn device_counters(&self, diskstats: &str, device: Option<&str>) -> Result<Option<DiskCounters>> {
        match device {
            Some(name) => parse_diskstats(diskstats, name)
                .map(Some)
                .with_context(|| format!("Device {} not found in diskstats", name)),
            None => Ok(None),
        }
    }

    /// ENA counters; `None` when the platform does not expose them
    async fn read_ethtool(&self) -> Option<HashMap<String, u64>> {
        let iface = self.config.network_interface.as_deref()?;
        let output = tokio::time::timeout(
            ETHTOOL_TIMEOUT,
            tokio::process::Command::new(&self.config.ethtool_path)
                .arg("-S")
                .arg(iface)
                .kill_on_drop(true)
                .output(),
        )
        .await;

        match output {
            Ok(Ok(out)) if out.status.success() => {
                let stats = parse_ethtool_stats(&String::from_utf8_lossy(&out.stdout));
                let supported = NicAllowance::ALL
                    .iter()
                    .any(|a| stats.contains_key(a.counter_name()));
                supported.then_some(stats)
            }
            Ok(Ok(out)) => {
                debug!(status = %out.status, "ethtool -S failed, NIC allowances unavailable");
                None
            }
            Ok(Err(e)) => {
                debug!(error = %e, "Could not run ethtool");
                None
            }
            Err(_) => {
                debug!("ethtool -S timed out");
                None
            }
        }
    }

    /// Compute a sample from two snapshots
    fn compute(&self, prev: &Snapshot, cur: &Snapshot) -> ResourceSample {
        let elapsed = match (prev.at, cur.at) {
            (Some(a), Some(b)) => b.saturating_duration_since(a).as_secs_f64(),
            _ => 0.0,
        };

        let cpu_total = cur.cpu.total.saturating_sub(prev.cpu.total);
        let cpu_busy = cur.cpu.busy.saturating_sub(prev.cpu.busy);
        let cpu_percent = if cpu_total > 0 {
            clamp_percent(cpu_busy as f64 / cpu_total as f64 * 100.0)
        } else {
            0.0
        };

        let (network_bandwidth_percent, network_pps_percent) = match (prev.net, cur.net) {
            (Some(p), Some(c)) if elapsed > 0.0 => self.network_percent(&p, &c, elapsed),
            _ => (0.0, 0.0),
        };

        let nic_allowance_exceeded = match (&prev.nic, &cur.nic) {
            (Some(p), Some(c)) => Some(
                NicAllowance::ALL
                    .iter()
                    .copied()
                    .filter(|a| {
                        let name = a.counter_name();
                        c.get(name).copied().unwrap_or(0) > p.get(name).copied().unwrap_or(0)
                    })
                    .collect::<BTreeSet<_>>(),
            ),
            _ => None,
        };

        ResourceSample {
            timestamp: chrono::Utc::now(),
            cpu_percent,
            memory_percent: 0.0,
            data_device: device_sample(prev.data_disk, cur.data_disk, elapsed),
            accounts_device: device_sample(prev.accounts_disk, cur.accounts_disk, elapsed),
            network_bandwidth_percent,
            network_pps_percent,
            nic_allowance_exceeded,
        }
    }

    fn network_percent(&self, prev: &NetCounters, cur: &NetCounters, secs: f64) -> (f64, f64) {
        let rx_bits = cur.rx_bytes.saturating_sub(prev.rx_bytes) as f64 * 8.0 / secs;
        let tx_bits = cur.tx_bytes.saturating_sub(prev.tx_bytes) as f64 * 8.0 / secs;
        let link_bits = self.config.link_bandwidth_mbps * 1_000_000.0;
        let bandwidth = if link_bits > 0.0 {
            clamp_percent(rx_bits.max(tx_bits) / link_bits * 100.0)
        } else {
            0.0
        };

        let packets = (cur.rx_packets.saturating_sub(prev.rx_packets)
            + cur.tx_packets.saturating_sub(prev.tx_packets)) as f64
            / secs;
        let pps = if self.config.link_max_pps > 0.0 {
            clamp_percent(packets / self.config.link_max_pps * 100.0)
        } else {
            0.0
        };

        (bandwidth, pps)
    }
}

fn device_sample(
    prev: Option<DiskCounters>,
    cur: Option<DiskCounters>,
    secs: f64,
) -> Option<DeviceSample> {
    let (prev, cur) = (prev?, cur?);
    if secs <= 0.0 {
        return Some(DeviceSample {
            iops: 0.0,
            throughput_mibps: 0.0,
            avg_latency_ms: 0.0,
            utilization_percent: 0.0,
        });
    }

    let ios = cur.reads.saturating_sub(prev.reads) + cur.writes.saturating_sub(prev.writes);
    let sectors = cur.sectors_read.saturating_sub(prev.sectors_read)
        + cur.sectors_written.saturating_sub(prev.sectors_written);
    let io_ms = cur.read_ms.saturating_sub(prev.read_ms) + cur.write_ms.saturating_sub(prev.write_ms);
    let ticks = cur.io_ticks_ms.saturating_sub(prev.io_ticks_ms);

    Some(DeviceSample {
        iops: ios as f64 / secs,
        throughput_mibps: sectors as f64 * SECTOR_BYTES / MIB / secs,
        avg_latency_ms: if ios > 0 { io_ms as f64 / ios as f64 } else { 0.0 },
        utilization_percent: clamp_percent(ticks as f64 / (secs * 1000.0) * 100.0),
    })
}

#[async_trait]
impl ResourceSampler for HostSampler {
    async fn sample(&self) -> Result<ResourceSample> {
        let current = self.snapshot().await?;
        let memory_percent = parse_meminfo(&self.read_proc("meminfo").await?)?;

        let mut previous = self.lock_previous();
        let mut sample = self.compute(&previous, &current);
        sample.memory_percent = memory_percent;
        *previous = current;

        Ok(sample)
    }
}
