//! Bottleneck classification
//!
//! Fuses the latest resource sample, health sample and load result into a
//! single verdict. The decision table is evaluated in priority order and the
//! first matching row wins:
//!
//! 1. node unhealthy with no other signal: counts toward node failure
//! 2. RPC degradation: a bottleneck on its own
//! 3. resource violation on an unhealthy node: a bottleneck
//! 4. resource violation on a healthy node: a false positive, resets
//! 5. otherwise normal, resets
//!
//! The classifier itself is stateless. Hysteresis counters go in with the
//! call and come back out on the verdict.

use crate::error::ConfigError;
use crate::models::{
    BottleneckVerdict, DeviceSample, DimensionKind, HealthSample, LoadResult, ResourceSample,
    Scenario,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Consecutive qualifying cycles needed to confirm a bottleneck
pub const CONFIRMATION_CYCLES: u32 = 3;

/// Consecutive lone-unhealthy cycles that mean the node has failed
pub const NODE_FAILURE_CYCLES: u32 = 3;

/// Per-dimension violation thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_utilization_percent: f64,
    pub disk_latency_ms: f64,
    /// Provisioned IOPS ceiling per device; unchecked when unset
    pub disk_iops: Option<f64>,
    /// Provisioned throughput ceiling per device; unchecked when unset
    pub disk_throughput_mibps: Option<f64>,
    pub network_bandwidth_percent: f64,
    pub network_pps_percent: f64,
    /// Violated when the success rate drops below this
    pub rpc_success_rate_percent: f64,
    pub rpc_p99_latency_ms: f64,
    pub rpc_error_rate_percent: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            cpu_percent: 85.0,
            memory_percent: 90.0,
            disk_utilization_percent: 90.0,
            disk_latency_ms: 50.0,
            disk_iops: None,
            disk_throughput_mibps: None,
            network_bandwidth_percent: 80.0,
            network_pps_percent: 80.0,
            rpc_success_rate_percent: 95.0,
            rpc_p99_latency_ms: 1000.0,
            rpc_error_rate_percent: 5.0,
        }
    }
}

impl Thresholds {
    /// Reject thresholds that could never (or would always) fire
    pub fn validate(&self) -> Result<(), ConfigError> {
        let percents = [
            ("cpu_percent", self.cpu_percent),
            ("memory_percent", self.memory_percent),
            ("disk_utilization_percent", self.disk_utilization_percent),
            ("network_bandwidth_percent", self.network_bandwidth_percent),
            ("network_pps_percent", self.network_pps_percent),
            ("rpc_success_rate_percent", self.rpc_success_rate_percent),
            ("rpc_error_rate_percent", self.rpc_error_rate_percent),
        ];
        for (field, value) in percents {
            if !(value > 0.0 && value <= 100.0) {
                return Err(ConfigError::ThresholdOutOfRange {
                    field,
                    value,
                    expected: "0 < value <= 100",
                });
            }
        }

        let positives = [
            ("disk_latency_ms", Some(self.disk_latency_ms)),
            ("rpc_p99_latency_ms", Some(self.rpc_p99_latency_ms)),
            ("disk_iops", self.disk_iops),
            ("disk_throughput_mibps", self.disk_throughput_mibps),
        ];
        for (field, value) in positives {
            if let Some(value) = value {
                if !(value > 0.0 && value.is_finite()) {
                    return Err(ConfigError::ThresholdOutOfRange {
                        field,
                        value,
                        expected: "value > 0",
                    });
                }
            }
        }

        Ok(())
    }
}

/// Running counters carried between cycles
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hysteresis {
    pub consecutive_count: u32,
    pub unhealthy_streak: u32,
}

impl Hysteresis {
    pub fn new(consecutive_count: u32, unhealthy_streak: u32) -> Self {
        Self {
            consecutive_count,
            unhealthy_streak,
        }
    }
}

impl From<&BottleneckVerdict> for Hysteresis {
    fn from(verdict: &BottleneckVerdict) -> Self {
        Self {
            consecutive_count: verdict.consecutive_count,
            unhealthy_streak: verdict.unhealthy_streak,
        }
    }
}

/// Stateless bottleneck classifier
#[derive(Debug, Clone, Default)]
pub struct BottleneckClassifier {
    thresholds: Thresholds,
}

impl BottleneckClassifier {
    pub fn new(thresholds: Thresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    /// Classify one cycle
    ///
    /// Identical inputs always produce an identical verdict.
    pub fn classify(
        &self,
        cycle_index: u64,
        load: &LoadResult,
        resource: &ResourceSample,
        health: &HealthSample,
        prior: Hysteresis,
    ) -> BottleneckVerdict {
        let resource_dims = self.resource_violations(resource);
        let rpc_dims = self.rpc_violations(load);
        let resource_violated = !resource_dims.is_empty();
        let rpc_violated = !rpc_dims.is_empty();
        let unhealthy = health.is_unhealthy();

        let (scenario, is_bottleneck, consecutive_count, unhealthy_streak) =
            if unhealthy && !resource_violated && !rpc_violated {
                let streak = prior.unhealthy_streak.saturating_add(1);
                let scenario = if streak >= NODE_FAILURE_CYCLES {
                    Scenario::NodeFailure
                } else {
                    Scenario::Normal
                };
                (scenario, false, 0, streak)
            } else if rpc_violated {
                (
                    Scenario::RpcViolation,
                    true,
                    prior.consecutive_count.saturating_add(1),
                    0,
                )
            } else if resource_violated && unhealthy {
                (
                    Scenario::ResourcePlusUnhealthy,
                    true,
                    prior.consecutive_count.saturating_add(1),
                    0,
                )
            } else if resource_violated {
                (Scenario::ResourceFalsePositive, false, 0, 0)
            } else {
                (Scenario::Normal, false, 0, 0)
            };

        let mut contributing_dimensions = resource_dims;
        contributing_dimensions.extend(rpc_dims);

        BottleneckVerdict {
            cycle_index,
            is_bottleneck,
            scenario,
            contributing_dimensions,
            consecutive_count,
            unhealthy_streak,
        }
    }

    /// Verdict for a cycle whose samples were unavailable: no evidence either
    /// way, counters reset
    pub fn inconclusive(&self, cycle_index: u64) -> BottleneckVerdict {
        BottleneckVerdict {
            cycle_index,
            is_bottleneck: false,
            scenario: Scenario::Normal,
            contributing_dimensions: BTreeSet::new(),
            consecutive_count: 0,
            unhealthy_streak: 0,
        }
    }

    /// Host-level dimensions currently over threshold
    pub fn resource_violations(&self, sample: &ResourceSample) -> BTreeSet<DimensionKind> {
        let t = &self.thresholds;
        let mut dims = BTreeSet::new();

        if sample.cpu_percent > t.cpu_percent {
            dims.insert(DimensionKind::Cpu);
        }
        if sample.memory_percent > t.memory_percent {
            dims.insert(DimensionKind::Memory);
        }
        for device in sample.devices() {
            self.device_violations(device, &mut dims);
        }
        if sample.network_bandwidth_percent > t.network_bandwidth_percent {
            dims.insert(DimensionKind::NetworkBandwidth);
        }
        if sample.network_pps_percent > t.network_pps_percent {
            dims.insert(DimensionKind::NetworkPps);
        }
        if sample
            .nic_allowance_exceeded
            .as_ref()
            .is_some_and(|flags| !flags.is_empty())
        {
            dims.insert(DimensionKind::NicAllowance);
        }

        dims
    }

    fn device_violations(&self, device: &DeviceSample, dims: &mut BTreeSet<DimensionKind>) {
        let t = &self.thresholds;

        if device.utilization_percent > t.disk_utilization_percent {
            dims.insert(DimensionKind::DiskUtilization);
        }
        if device.avg_latency_ms > t.disk_latency_ms {
            dims.insert(DimensionKind::DiskLatency);
        }
        if t.disk_iops.is_some_and(|max| device.iops > max) {
            dims.insert(DimensionKind::DiskIops);
        }
        if t
            .disk_throughput_mibps
            .is_some_and(|max| device.throughput_mibps > max)
        {
            dims.insert(DimensionKind::DiskThroughput);
        }
    }

    /// Caller-visible RPC dimensions currently in violation
    pub fn rpc_violations(&self, load: &LoadResult) -> BTreeSet<DimensionKind> {
        let t = &self.thresholds;
        let mut dims = BTreeSet::new();

        if load.success_rate_percent < t.rpc_success_rate_percent {
            dims.insert(DimensionKind::RpcSuccessRate);
        }
        if load.latency_p99_ms > t.rpc_p99_latency_ms {
            dims.insert(DimensionKind::RpcLatency);
        }
        if load.error_rate_percent > t.rpc_error_rate_percent {
            dims.insert(DimensionKind::RpcErrorRate);
        }

        dims
    }
}

/// Owns the rolling counters for callers that classify cycle after cycle
#[derive(Debug, Clone, Default)]
pub struct HysteresisTracker {
    classifier: BottleneckClassifier,
    state: Hysteresis,
}

impl HysteresisTracker {
    pub fn new(classifier: BottleneckClassifier) -> Self {
        Self {
            classifier,
            state: Hysteresis::default(),
        }
    }

    /// Classify the cycle and advance the counters
    pub fn evaluate(
        &mut self,
        cycle_index: u64,
        load: &LoadResult,
        resource: &ResourceSample,
        health: &HealthSample,
    ) -> BottleneckVerdict {
        let verdict = self
            .classifier
            .classify(cycle_index, load, resource, health, self.state);
        self.state = Hysteresis::from(&verdict);
        verdict
    }

    /// Record a cycle with no usable samples
    pub fn inconclusive(&mut self, cycle_index: u64) -> BottleneckVerdict {
        let verdict = self.classifier.inconclusive(cycle_index);
        self.state = Hysteresis::from(&verdict);
        verdict
    }

    pub fn current(&self) -> Hysteresis {
        self.state
    }

    pub fn reset(&mut self) {
        self.state = Hysteresis::default();
    }

    pub fn classifier(&self) -> &BottleneckClassifier {
        &self.classifier
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NicAllowance;
    use chrono::{TimeZone, Utc};

    fn ts() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn good_load() -> LoadResult {
        LoadResult::new(1000, 998.0, 99.9, 0.1, 12.0, 80.0, 60.0)
    }

    fn nominal_resources() -> ResourceSample {
        ResourceSample {
            cpu_percent: 40.0,
            memory_percent: 55.0,
            network_bandwidth_percent: 20.0,
            network_pps_percent: 15.0,
            ..ResourceSample::idle(ts())
        }
    }

    fn hot_cpu() -> ResourceSample {
        ResourceSample {
            cpu_percent: 97.0,
            ..nominal_resources()
        }
    }

    fn healthy() -> HealthSample {
        HealthSample::healthy(ts())
    }

    fn unhealthy() -> HealthSample {
        HealthSample::unhealthy(ts())
    }

    #[test]
    fn test_normal_cycle() {
        let classifier = BottleneckClassifier::default();
        let verdict = classifier.classify(
            1,
            &good_load(),
            &nominal_resources(),
            &healthy(),
            Hysteresis::new(2, 0),
        );

        assert_eq!(verdict.scenario, Scenario::Normal);
        assert!(!verdict.is_bottleneck);
        assert_eq!(verdict.consecutive_count, 0);
        assert!(verdict.contributing_dimensions.is_empty());
    }

    #[test]
    fn test_rpc_violation_is_sufficient_alone() {
        let classifier = BottleneckClassifier::default();
        let load = LoadResult::new(1000, 900.0, 90.0, 2.0, 12.0, 80.0, 60.0);

        let verdict = classifier.classify(
            1,
            &load,
            &nominal_resources(),
            &healthy(),
            Hysteresis::default(),
        );

        assert_eq!(verdict.scenario, Scenario::RpcViolation);
        assert!(verdict.is_bottleneck);
        assert_eq!(verdict.consecutive_count, 1);
        assert!(verdict
            .contributing_dimensions
            .contains(&DimensionKind::RpcSuccessRate));
    }

    #[test]
    fn test_rpc_latency_and_error_rate_violations() {
        let classifier = BottleneckClassifier::default();
        let slow = LoadResult::new(1000, 1000.0, 99.0, 0.5, 300.0, 1500.0, 60.0);
        let erroring = LoadResult::new(1000, 1000.0, 96.0, 4.0, 10.0, 50.0, 60.0);

        let v1 = classifier.classify(1, &slow, &nominal_resources(), &healthy(), Hysteresis::default());
        assert_eq!(v1.scenario, Scenario::RpcViolation);
        assert!(v1.contributing_dimensions.contains(&DimensionKind::RpcLatency));

        let strict = BottleneckClassifier::new(Thresholds {
            rpc_error_rate_percent: 3.0,
            ..Thresholds::default()
        });
        let v2 = strict.classify(1, &erroring, &nominal_resources(), &healthy(), Hysteresis::default());
        assert_eq!(v2.scenario, Scenario::RpcViolation);
        assert_eq!(
            v2.contributing_dimensions,
            BTreeSet::from([DimensionKind::RpcErrorRate])
        );
    }

    #[test]
    fn test_resource_false_positive_resets_count() {
        let classifier = BottleneckClassifier::default();
        let verdict =
            classifier.classify(4, &good_load(), &hot_cpu(), &healthy(), Hysteresis::new(2, 0));

        assert_eq!(verdict.scenario, Scenario::ResourceFalsePositive);
        assert!(!verdict.is_bottleneck);
        assert_eq!(verdict.consecutive_count, 0);
        // Diagnostics are still attached
        assert_eq!(
            verdict.contributing_dimensions,
            BTreeSet::from([DimensionKind::Cpu])
        );
    }

    #[test]
    fn test_resource_plus_unhealthy_is_bottleneck() {
        let classifier = BottleneckClassifier::default();
        let verdict =
            classifier.classify(2, &good_load(), &hot_cpu(), &unhealthy(), Hysteresis::new(1, 2));

        assert_eq!(verdict.scenario, Scenario::ResourcePlusUnhealthy);
        assert!(verdict.is_bottleneck);
        assert_eq!(verdict.consecutive_count, 2);
        assert_eq!(verdict.unhealthy_streak, 0);
    }

    #[test]
    fn test_hysteresis_resets_between_isolated_spikes() {
        let mut tracker = HysteresisTracker::default();

        let v1 = tracker.evaluate(1, &good_load(), &hot_cpu(), &healthy());
        let v2 = tracker.evaluate(2, &good_load(), &nominal_resources(), &healthy());
        let v3 = tracker.evaluate(3, &good_load(), &hot_cpu(), &healthy());

        assert_eq!(v1.scenario, Scenario::ResourceFalsePositive);
        assert_eq!(v2.scenario, Scenario::Normal);
        assert_eq!(v3.scenario, Scenario::ResourceFalsePositive);
        assert_eq!(v3.consecutive_count, 0);
        assert_eq!(tracker.current().consecutive_count, 0);
    }

    #[test]
    fn test_confirmation_counts_mixed_qualifying_cycles() {
        let mut tracker = HysteresisTracker::default();
        let degraded = LoadResult::new(1000, 800.0, 80.0, 20.0, 50.0, 2000.0, 60.0);

        let v1 = tracker.evaluate(1, &degraded, &nominal_resources(), &healthy());
        let v2 = tracker.evaluate(2, &good_load(), &hot_cpu(), &unhealthy());
        let v3 = tracker.evaluate(3, &degraded, &nominal_resources(), &healthy());

        assert_eq!(v1.consecutive_count, 1);
        assert_eq!(v2.consecutive_count, 2);
        assert_eq!(v3.consecutive_count, CONFIRMATION_CYCLES);
        assert!(v3.is_bottleneck);
    }

    #[test]
    fn test_tracker_current_and_reset() {
        let mut tracker = HysteresisTracker::default();
        let degraded = LoadResult::new(1000, 800.0, 80.0, 20.0, 50.0, 2000.0, 60.0);

        tracker.evaluate(1, &degraded, &nominal_resources(), &healthy());
        tracker.evaluate(2, &degraded, &nominal_resources(), &healthy());
        assert_eq!(tracker.current(), Hysteresis::new(2, 0));

        tracker.reset();
        assert_eq!(tracker.current(), Hysteresis::default());

        let v = tracker.evaluate(3, &degraded, &nominal_resources(), &healthy());
        assert_eq!(v.consecutive_count, 1);
    }

    #[test]
    fn test_two_qualifying_then_normal_resets() {
        let mut tracker = HysteresisTracker::default();
        let degraded = LoadResult::new(1000, 800.0, 80.0, 20.0, 50.0, 2000.0, 60.0);

        tracker.evaluate(1, &degraded, &nominal_resources(), &healthy());
        tracker.evaluate(2, &degraded, &nominal_resources(), &healthy());
        let v3 = tracker.evaluate(3, &good_load(), &nominal_resources(), &healthy());

        assert_eq!(v3.scenario, Scenario::Normal);
        assert_eq!(v3.consecutive_count, 0);
    }

    #[test]
    fn test_lone_unhealthy_becomes_node_failure_on_third_cycle() {
        let mut tracker = HysteresisTracker::default();

        let v1 = tracker.evaluate(1, &good_load(), &nominal_resources(), &unhealthy());
        let v2 = tracker.evaluate(2, &good_load(), &nominal_resources(), &unhealthy());
        let v3 = tracker.evaluate(3, &good_load(), &nominal_resources(), &unhealthy());

        assert_eq!(v1.scenario, Scenario::Normal);
        assert_eq!(v1.unhealthy_streak, 1);
        assert!(!v1.is_bottleneck);
        assert_eq!(v2.scenario, Scenario::Normal);
        assert_eq!(v3.scenario, Scenario::NodeFailure);
        assert!(!v3.is_bottleneck);
        assert_eq!(v3.consecutive_count, 0);
    }

    #[test]
    fn test_data_loss_counts_as_unhealthy() {
        let classifier = BottleneckClassifier::default();
        let mut health = healthy();
        health.data_loss = true;

        let verdict = classifier.classify(
            5,
            &good_load(),
            &nominal_resources(),
            &health,
            Hysteresis::new(0, 2),
        );

        assert_eq!(verdict.scenario, Scenario::NodeFailure);
    }

    #[test]
    fn test_unhealthy_streak_broken_by_corroborated_cycle() {
        let mut tracker = HysteresisTracker::default();
        tracker.evaluate(1, &good_load(), &nominal_resources(), &unhealthy());
        tracker.evaluate(2, &good_load(), &nominal_resources(), &unhealthy());
        let v3 = tracker.evaluate(3, &good_load(), &hot_cpu(), &unhealthy());
        let v4 = tracker.evaluate(4, &good_load(), &nominal_resources(), &unhealthy());

        assert_eq!(v3.scenario, Scenario::ResourcePlusUnhealthy);
        assert_eq!(v4.scenario, Scenario::Normal);
        assert_eq!(v4.unhealthy_streak, 1);
    }

    #[test]
    fn test_classification_is_idempotent() {
        let classifier = BottleneckClassifier::default();
        let resource = ResourceSample {
            memory_percent: 95.0,
            nic_allowance_exceeded: Some(BTreeSet::from([NicAllowance::Pps])),
            ..hot_cpu()
        };
        let prior = Hysteresis::new(1, 0);

        let first = classifier.classify(7, &good_load(), &resource, &unhealthy(), prior);
        let second = classifier.classify(7, &good_load(), &resource, &unhealthy(), prior);

        assert_eq!(
            serde_json::to_vec(&first).unwrap(),
            serde_json::to_vec(&second).unwrap()
        );
    }

    #[test]
    fn test_device_and_nic_dimensions() {
        let classifier = BottleneckClassifier::new(Thresholds {
            disk_iops: Some(10_000.0),
            ..Thresholds::default()
        });
        let resource = ResourceSample {
            data_device: Some(DeviceSample {
                iops: 12_000.0,
                throughput_mibps: 300.0,
                avg_latency_ms: 80.0,
                utilization_percent: 95.0,
            }),
            nic_allowance_exceeded: Some(BTreeSet::from([NicAllowance::BandwidthIn])),
            ..nominal_resources()
        };

        let dims = classifier.resource_violations(&resource);

        assert_eq!(
            dims,
            BTreeSet::from([
                DimensionKind::DiskIops,
                DimensionKind::DiskLatency,
                DimensionKind::DiskUtilization,
                DimensionKind::NicAllowance,
            ])
        );
    }

    #[test]
    fn test_absent_devices_never_violate() {
        let classifier = BottleneckClassifier::default();
        let resource = ResourceSample {
            nic_allowance_exceeded: Some(BTreeSet::new()),
            ..nominal_resources()
        };

        assert!(classifier.resource_violations(&resource).is_empty());
    }

    #[test]
    fn test_inconclusive_resets_counters() {
        let mut tracker = HysteresisTracker::default();
        let degraded = LoadResult::new(1000, 800.0, 80.0, 20.0, 50.0, 2000.0, 60.0);
        tracker.evaluate(1, &degraded, &nominal_resources(), &healthy());

        let verdict = tracker.inconclusive(2);

        assert_eq!(verdict.scenario, Scenario::Normal);
        assert_eq!(tracker.current(), Hysteresis::default());
    }

    #[test]
    fn test_threshold_validation() {
        assert!(Thresholds::default().validate().is_ok());

        let bad_percent = Thresholds {
            cpu_percent: 120.0,
            ..Thresholds::default()
        };
        assert!(matches!(
            bad_percent.validate(),
            Err(ConfigError::ThresholdOutOfRange { field: "cpu_percent", .. })
        ));

        let bad_iops = Thresholds {
            disk_iops: Some(0.0),
            ..Thresholds::default()
        };
        assert!(bad_iops.validate().is_err());
    }
}
