//! Core data models for the QPS ramp
//!
//! Samples, load results and verdicts are immutable records. They are
//! serialized as-is into the run directory so every verdict can be audited
//! against the inputs it was computed from.

use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;

/// Records that carry their own sampling instant
pub trait Timestamped {
    fn timestamp(&self) -> DateTime<Utc>;
}

/// Storage metrics for one monitored block device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSample {
    pub iops: f64,
    pub throughput_mibps: f64,
    pub avg_latency_ms: f64,
    pub utilization_percent: f64,
}

/// NIC allowance counters that can report "exceeded"
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NicAllowance {
    BandwidthIn,
    BandwidthOut,
    Pps,
    Conntrack,
    Linklocal,
}

impl NicAllowance {
    pub const ALL: [NicAllowance; 5] = [
        NicAllowance::BandwidthIn,
        NicAllowance::BandwidthOut,
        NicAllowance::Pps,
        NicAllowance::Conntrack,
        NicAllowance::Linklocal,
    ];

    /// Name of the `ethtool -S` counter backing this allowance
    pub fn counter_name(&self) -> &'static str {
        match self {
            NicAllowance::BandwidthIn => "bw_in_allowance_exceeded",
            NicAllowance::BandwidthOut => "bw_out_allowance_exceeded",
            NicAllowance::Pps => "pps_allowance_exceeded",
            NicAllowance::Conntrack => "conntrack_allowance_exceeded",
            NicAllowance::Linklocal => "linklocal_allowance_exceeded",
        }
    }
}

/// Snapshot of host resource usage at one instant
///
/// Device and NIC fields are `None` when the device is not monitored or the
/// platform cannot report them. Zero is a real reading, absence is not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_device: Option<DeviceSample>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accounts_device: Option<DeviceSample>,
    pub network_bandwidth_percent: f64,
    pub network_pps_percent: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nic_allowance_exceeded: Option<BTreeSet<NicAllowance>>,
}

impl ResourceSample {
    /// A sample with every reading at zero and no optional fields
    pub fn idle(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            cpu_percent: 0.0,
            memory_percent: 0.0,
            data_device: None,
            accounts_device: None,
            network_bandwidth_percent: 0.0,
            network_pps_percent: 0.0,
            nic_allowance_exceeded: None,
        }
    }

    /// Iterate over the monitored devices
    pub fn devices(&self) -> impl Iterator<Item = &DeviceSample> {
        self.data_device.iter().chain(self.accounts_device.iter())
    }
}

impl Timestamped for ResourceSample {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Node liveness as judged by the health probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// Node sync/liveness state at one instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSample {
    pub timestamp: DateTime<Utc>,
    pub local_height: Option<u64>,
    pub reference_height: Option<u64>,
    /// `reference_height - local_height`, when both are known
    pub height_diff: Option<i64>,
    pub status: HealthStatus,
    pub data_loss: bool,
    pub latency_ms: f64,
}

impl HealthSample {
    pub fn healthy(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            local_height: None,
            reference_height: None,
            height_diff: None,
            status: HealthStatus::Healthy,
            data_loss: false,
            latency_ms: 0.0,
        }
    }

    pub fn unhealthy(timestamp: DateTime<Utc>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            ..Self::healthy(timestamp)
        }
    }

    /// True when the node should be treated as not functioning
    pub fn is_unhealthy(&self) -> bool {
        self.status == HealthStatus::Unhealthy || self.data_loss
    }
}

impl Timestamped for HealthSample {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Outcome of one fixed-QPS burst
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadResult {
    pub target_qps: u64,
    pub achieved_qps: f64,
    pub success_rate_percent: f64,
    pub latency_p50_ms: f64,
    pub latency_p99_ms: f64,
    pub error_rate_percent: f64,
    /// Requests that never got a response; not part of the error rate
    #[serde(default)]
    pub timeout_rate_percent: f64,
    pub duration_s: f64,
}

impl LoadResult {
    /// Build a result, clamping achieved QPS to the target and the rates to
    /// a combined 100%
    pub fn new(
        target_qps: u64,
        achieved_qps: f64,
        success_rate_percent: f64,
        error_rate_percent: f64,
        latency_p50_ms: f64,
        latency_p99_ms: f64,
        duration_s: f64,
    ) -> Self {
        let success = clamp_percent(success_rate_percent);
        let error = clamp_percent(error_rate_percent).min(100.0 - success);
        Self {
            target_qps,
            achieved_qps: achieved_qps.clamp(0.0, target_qps as f64),
            success_rate_percent: success,
            latency_p50_ms: latency_p50_ms.max(0.0),
            latency_p99_ms: latency_p99_ms.max(0.0),
            error_rate_percent: error,
            timeout_rate_percent: 0.0,
            duration_s,
        }
    }

    /// Set the timeout share, bounded by what success and errors leave over
    pub fn with_timeout_rate(mut self, timeout_rate_percent: f64) -> Self {
        let remaining = 100.0 - self.success_rate_percent - self.error_rate_percent;
        self.timeout_rate_percent = clamp_percent(timeout_rate_percent).min(remaining.max(0.0));
        self
    }
}

/// Clamp a reading into [0, 100]; NaN becomes 0
pub fn clamp_percent(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}

/// A signal the classifier can find in violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DimensionKind {
    Cpu,
    Memory,
    DiskIops,
    DiskThroughput,
    DiskLatency,
    DiskUtilization,
    NetworkBandwidth,
    NetworkPps,
    NicAllowance,
    RpcSuccessRate,
    RpcLatency,
    RpcErrorRate,
}

impl DimensionKind {
    /// RPC dimensions are observed from the caller side
    pub fn is_rpc(&self) -> bool {
        matches!(
            self,
            DimensionKind::RpcSuccessRate | DimensionKind::RpcLatency | DimensionKind::RpcErrorRate
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DimensionKind::Cpu => "cpu",
            DimensionKind::Memory => "memory",
            DimensionKind::DiskIops => "disk_iops",
            DimensionKind::DiskThroughput => "disk_throughput",
            DimensionKind::DiskLatency => "disk_latency",
            DimensionKind::DiskUtilization => "disk_utilization",
            DimensionKind::NetworkBandwidth => "network_bandwidth",
            DimensionKind::NetworkPps => "network_pps",
            DimensionKind::NicAllowance => "nic_allowance",
            DimensionKind::RpcSuccessRate => "rpc_success_rate",
            DimensionKind::RpcLatency => "rpc_latency",
            DimensionKind::RpcErrorRate => "rpc_error_rate",
        }
    }
}

impl fmt::Display for DimensionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which row of the decision table a verdict came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scenario {
    ResourceFalsePositive,
    RpcViolation,
    ResourcePlusUnhealthy,
    NodeFailure,
    Normal,
}

impl Scenario {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scenario::ResourceFalsePositive => "resource_false_positive",
            Scenario::RpcViolation => "rpc_violation",
            Scenario::ResourcePlusUnhealthy => "resource_plus_unhealthy",
            Scenario::NodeFailure => "node_failure",
            Scenario::Normal => "normal",
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classifier output for one evaluation cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BottleneckVerdict {
    pub cycle_index: u64,
    pub is_bottleneck: bool,
    pub scenario: Scenario,
    pub contributing_dimensions: BTreeSet<DimensionKind>,
    pub consecutive_count: u32,
    /// Consecutive cycles where the node was unhealthy with nothing else wrong
    pub unhealthy_streak: u32,
}

/// Upper bound of the ramp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxQps {
    Bounded(u64),
    Unbounded,
}

impl MaxQps {
    pub fn is_unbounded(&self) -> bool {
        matches!(self, MaxQps::Unbounded)
    }

    /// True when `qps` lies beyond the bound
    pub fn exceeded_by(&self, qps: u64) -> bool {
        match self {
            MaxQps::Bounded(max) => qps > *max,
            MaxQps::Unbounded => false,
        }
    }
}

impl fmt::Display for MaxQps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaxQps::Bounded(max) => write!(f, "{}", max),
            MaxQps::Unbounded => f.write_str("unbounded"),
        }
    }
}

impl std::str::FromStr for MaxQps {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("unbounded") {
            return Ok(MaxQps::Unbounded);
        }
        trimmed
            .parse::<u64>()
            .map(MaxQps::Bounded)
            .map_err(|_| format!("expected a QPS number or \"unbounded\", got {:?}", s))
    }
}

impl Serialize for MaxQps {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            MaxQps::Bounded(max) => serializer.serialize_u64(*max),
            MaxQps::Unbounded => serializer.serialize_str("unbounded"),
        }
    }
}

impl<'de> Deserialize<'de> for MaxQps {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Environment variables arrive as strings, files as numbers
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(max) => Ok(MaxQps::Bounded(max)),
            Raw::Text(text) => text.parse().map_err(de::Error::custom),
        }
    }
}

/// Lifecycle phase of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Warmup,
    Steady,
    Cooldown,
    Terminated,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Warmup => "warmup",
            Phase::Steady => "steady",
            Phase::Cooldown => "cooldown",
            Phase::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Why a run stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    BottleneckConfirmed,
    NodeFailure,
    MaxQpsReached,
    UserAbort,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TerminationReason::BottleneckConfirmed => "bottleneck_confirmed",
            TerminationReason::NodeFailure => "node_failure",
            TerminationReason::MaxQpsReached => "max_qps_reached",
            TerminationReason::UserAbort => "user_abort",
        };
        f.write_str(s)
    }
}

/// Mutable progress of a run, owned by the ramp controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub current_qps: u64,
    pub step_size: u64,
    pub max_qps: MaxQps,
    pub consecutive_bottleneck_count: u32,
    pub unhealthy_streak: u32,
    pub phase: Phase,
    pub termination_reason: Option<TerminationReason>,
    /// Highest level that did not trigger a confirmed bottleneck
    pub max_successful_qps: Option<u64>,
    pub cycles_evaluated: u64,
    pub updated_at: DateTime<Utc>,
}

impl RunState {
    pub fn new(initial_qps: u64, step_size: u64, max_qps: MaxQps) -> Self {
        Self {
            current_qps: initial_qps,
            step_size,
            max_qps,
            consecutive_bottleneck_count: 0,
            unhealthy_streak: 0,
            phase: Phase::Warmup,
            termination_reason: None,
            max_successful_qps: None,
            cycles_evaluated: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.phase == Phase::Terminated
    }
}

/// Something unusual observed during a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleAnomaly {
    ResourceSampleStale,
    HealthSampleStale,
    SampleRetried,
    Inconclusive,
    ResourceFalsePositive,
    TransientUnhealthy,
    DataLossReported,
}

impl fmt::Display for CycleAnomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CycleAnomaly::ResourceSampleStale => "resource_sample_stale",
            CycleAnomaly::HealthSampleStale => "health_sample_stale",
            CycleAnomaly::SampleRetried => "sample_retried",
            CycleAnomaly::Inconclusive => "inconclusive",
            CycleAnomaly::ResourceFalsePositive => "resource_false_positive",
            CycleAnomaly::TransientUnhealthy => "transient_unhealthy",
            CycleAnomaly::DataLossReported => "data_loss_reported",
        };
        f.write_str(s)
    }
}

/// Everything evaluated in one cycle, as written to the event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleRecord {
    pub cycle_index: u64,
    pub timestamp: DateTime<Utc>,
    pub load: LoadResult,
    pub resource: Option<ResourceSample>,
    pub health: Option<HealthSample>,
    pub verdict: BottleneckVerdict,
    #[serde(default)]
    pub anomalies: Vec<CycleAnomaly>,
}

/// Final record of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub state: RunState,
    pub termination_reason: Option<TerminationReason>,
    pub max_successful_qps: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fatal_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cycles: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_qps_parses_numbers_and_unbounded() {
        assert_eq!("3000".parse::<MaxQps>().unwrap(), MaxQps::Bounded(3000));
        assert_eq!("Unbounded".parse::<MaxQps>().unwrap(), MaxQps::Unbounded);
        assert!("lots".parse::<MaxQps>().is_err());
    }

    #[test]
    fn test_max_qps_serde() {
        let bounded: MaxQps = serde_json::from_str("3000").unwrap();
        assert_eq!(bounded, MaxQps::Bounded(3000));

        let from_env: MaxQps = serde_json::from_str("\"2500\"").unwrap();
        assert_eq!(from_env, MaxQps::Bounded(2500));

        let unbounded: MaxQps = serde_json::from_str("\"unbounded\"").unwrap();
        assert_eq!(unbounded, MaxQps::Unbounded);
        assert_eq!(serde_json::to_string(&unbounded).unwrap(), "\"unbounded\"");
    }

    #[test]
    fn test_max_qps_exceeded_by() {
        assert!(MaxQps::Bounded(3000).exceeded_by(3500));
        assert!(!MaxQps::Bounded(3000).exceeded_by(3000));
        assert!(!MaxQps::Unbounded.exceeded_by(u64::MAX));
    }

    #[test]
    fn test_absent_devices_are_omitted_from_json() {
        let sample = ResourceSample::idle(Utc::now());
        let json = serde_json::to_value(&sample).unwrap();

        assert!(json.get("data_device").is_none());
        assert!(json.get("accounts_device").is_none());
        assert!(json.get("nic_allowance_exceeded").is_none());
        assert_eq!(json["cpu_percent"], 0.0);
    }

    #[test]
    fn test_load_result_clamps_invariants() {
        let result = LoadResult::new(1000, 1200.0, 97.0, 10.0, 5.0, 40.0, 60.0);
        assert_eq!(result.achieved_qps, 1000.0);
        assert_eq!(result.success_rate_percent, 97.0);
        assert!(result.success_rate_percent + result.error_rate_percent <= 100.0);

        let with_timeouts = result.with_timeout_rate(50.0);
        assert_eq!(with_timeouts.timeout_rate_percent, 0.0);
    }

    #[test]
    fn test_health_sample_unhealthy_includes_data_loss() {
        let mut sample = HealthSample::healthy(Utc::now());
        assert!(!sample.is_unhealthy());

        sample.data_loss = true;
        assert!(sample.is_unhealthy());
    }

    #[test]
    fn test_scenario_serializes_snake_case() {
        let json = serde_json::to_string(&Scenario::ResourcePlusUnhealthy).unwrap();
        assert_eq!(json, "\"resource_plus_unhealthy\"");
        assert_eq!(Scenario::RpcViolation.to_string(), "rpc_violation");
    }
}
