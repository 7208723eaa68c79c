//! Observability for ramp runs
//!
//! Provides:
//! - Prometheus metrics (QPS levels, verdicts, burst latency, sampling errors)
//! - Structured JSON logging of run events with tracing

use crate::models::{BottleneckVerdict, CycleAnomaly, LoadResult, RunState, Scenario, TerminationReason};
use prometheus::{
    register_gauge, register_histogram, register_int_counter, register_int_counter_vec,
    register_int_gauge, Gauge, Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Buckets for load burst duration (in seconds)
const BURST_BUCKETS: &[f64] = &[1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0];

static GLOBAL_METRICS: OnceLock<RampMetricsInner> = OnceLock::new();

struct RampMetricsInner {
    target_qps: IntGauge,
    achieved_qps: Gauge,
    max_successful_qps: IntGauge,
    consecutive_bottlenecks: IntGauge,
    cycles_evaluated: IntCounter,
    verdicts: IntCounterVec,
    burst_duration_seconds: Histogram,
    sample_errors: IntCounterVec,
    stale_samples: IntCounterVec,
}

impl RampMetricsInner {
    fn new() -> Self {
        Self {
            target_qps: register_int_gauge!(
                "rpc_ramp_target_qps",
                "Target QPS of the level currently being driven"
            )
            .expect("Failed to register target_qps"),

            achieved_qps: register_gauge!(
                "rpc_ramp_achieved_qps",
                "QPS achieved by the last completed burst"
            )
            .expect("Failed to register achieved_qps"),

            max_successful_qps: register_int_gauge!(
                "rpc_ramp_max_successful_qps",
                "Highest level that completed without a confirmed bottleneck"
            )
            .expect("Failed to register max_successful_qps"),

            consecutive_bottlenecks: register_int_gauge!(
                "rpc_ramp_consecutive_bottlenecks",
                "Current consecutive bottleneck verdict count"
            )
            .expect("Failed to register consecutive_bottlenecks"),

            cycles_evaluated: register_int_counter!(
                "rpc_ramp_cycles_evaluated_total",
                "Total number of classified cycles"
            )
            .expect("Failed to register cycles_evaluated"),

            verdicts: register_int_counter_vec!(
                "rpc_ramp_verdicts_total",
                "Verdicts by scenario",
                &["scenario"]
            )
            .expect("Failed to register verdicts"),

            burst_duration_seconds: register_histogram!(
                "rpc_ramp_burst_duration_seconds",
                "Wall time of each load burst",
                BURST_BUCKETS.to_vec()
            )
            .expect("Failed to register burst_duration_seconds"),

            sample_errors: register_int_counter_vec!(
                "rpc_ramp_sample_errors_total",
                "Failed sampling attempts by component",
                &["component"]
            )
            .expect("Failed to register sample_errors"),

            stale_samples: register_int_counter_vec!(
                "rpc_ramp_stale_samples_total",
                "Samples too old at classification time, by stream",
                &["stream"]
            )
            .expect("Failed to register stale_samples"),
        }
    }
}

/// Handle to the process-wide ramp metrics
///
/// Clones share the same underlying Prometheus collectors.
#[derive(Clone)]
pub struct RampMetrics {
    _private: (),
}

impl Default for RampMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RampMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(RampMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &RampMetricsInner {
        GLOBAL_METRICS.get_or_init(RampMetricsInner::new)
    }

    pub fn set_target_qps(&self, qps: u64) {
        self.inner().target_qps.set(qps as i64);
    }

    /// Record a completed burst
    pub fn observe_burst(&self, result: &LoadResult, elapsed_secs: f64) {
        self.inner().achieved_qps.set(result.achieved_qps);
        self.inner().burst_duration_seconds.observe(elapsed_secs);
    }

    /// Record a classified cycle and the state it produced
    pub fn observe_verdict(&self, verdict: &BottleneckVerdict, state: &RunState) {
        let inner = self.inner();
        inner.cycles_evaluated.inc();
        inner
            .verdicts
            .with_label_values(&[verdict.scenario.as_str()])
            .inc();
        inner
            .consecutive_bottlenecks
            .set(state.consecutive_bottleneck_count as i64);
        if let Some(qps) = state.max_successful_qps {
            inner.max_successful_qps.set(qps as i64);
        }
    }

    pub fn record_sample_error(&self, component: &str) {
        self.inner()
            .sample_errors
            .with_label_values(&[component])
            .inc();
    }

    pub fn record_stale_sample(&self, stream: &str) {
        self.inner()
            .stale_samples
            .with_label_values(&[stream])
            .inc();
    }
}

/// Structured logger for ramp run events
#[derive(Clone)]
pub struct StructuredLogger {
    run_id: String,
}

impl StructuredLogger {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn log_run_started(&self, state: &RunState) {
        info!(
            event = "run_started",
            run_id = %self.run_id,
            initial_qps = state.current_qps,
            step_size = state.step_size,
            max_qps = %state.max_qps,
            "Ramp run started"
        );
    }

    pub fn log_level_started(&self, cycle_index: u64, qps: u64, warmup: bool) {
        info!(
            event = "level_started",
            run_id = %self.run_id,
            cycle = cycle_index,
            qps = qps,
            warmup = warmup,
            "Driving load level"
        );
    }

    pub fn log_verdict(&self, verdict: &BottleneckVerdict, load: &LoadResult) {
        let dimensions: Vec<String> = verdict
            .contributing_dimensions
            .iter()
            .map(|d| d.to_string())
            .collect();

        if verdict.is_bottleneck || verdict.scenario == Scenario::NodeFailure {
            warn!(
                event = "verdict",
                run_id = %self.run_id,
                cycle = verdict.cycle_index,
                qps = load.target_qps,
                scenario = %verdict.scenario,
                bottleneck = verdict.is_bottleneck,
                consecutive = verdict.consecutive_count,
                unhealthy_streak = verdict.unhealthy_streak,
                dimensions = ?dimensions,
                success_rate = load.success_rate_percent,
                p99_ms = load.latency_p99_ms,
                "Bottleneck indicators present"
            );
        } else {
            info!(
                event = "verdict",
                run_id = %self.run_id,
                cycle = verdict.cycle_index,
                qps = load.target_qps,
                scenario = %verdict.scenario,
                dimensions = ?dimensions,
                success_rate = load.success_rate_percent,
                p99_ms = load.latency_p99_ms,
                "Level evaluated"
            );
        }
    }

    pub fn log_anomaly(&self, cycle_index: u64, anomaly: &CycleAnomaly) {
        warn!(
            event = "cycle_anomaly",
            run_id = %self.run_id,
            cycle = cycle_index,
            anomaly = %anomaly,
            "Cycle anomaly"
        );
    }

    pub fn log_terminated(&self, reason: TerminationReason, max_successful_qps: Option<u64>) {
        info!(
            event = "run_terminated",
            run_id = %self.run_id,
            reason = %reason,
            max_successful_qps = ?max_successful_qps,
            "Ramp run finished"
        );
    }

    pub fn log_fatal(&self, qps: u64, last_good_qps: Option<u64>, error: &str) {
        warn!(
            event = "run_failed",
            run_id = %self.run_id,
            qps = qps,
            last_good_qps = ?last_good_qps,
            error = %error,
            "Ramp run aborted by load driver failure"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "runner_shutdown",
            run_id = %self.run_id,
            reason = %reason,
            "Ramp runner shutting down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_metrics_handles_share_registry() {
        let metrics = RampMetrics::new();
        let other = metrics.clone();

        metrics.set_target_qps(1500);
        other.record_sample_error("resource_sampler");
        other.record_stale_sample("health");

        let families = prometheus::gather();
        assert!(families.iter().any(|f| f.get_name() == "rpc_ramp_target_qps"));
    }

    /// Current value of a gathered counter or gauge, matched on one label
    fn gathered(name: &str, label: Option<(&str, &str)>) -> Option<f64> {
        prometheus::gather()
            .iter()
            .find(|f| f.get_name() == name)?
            .get_metric()
            .iter()
            .find(|m| match label {
                Some((key, value)) => m
                    .get_label()
                    .iter()
                    .any(|l| l.get_name() == key && l.get_value() == value),
                None => true,
            })
            .map(|m| {
                if m.has_counter() {
                    m.get_counter().get_value()
                } else {
                    m.get_gauge().get_value()
                }
            })
    }

    #[test]
    fn test_observe_verdict() {
        let metrics = RampMetrics::new();
        let mut state = RunState::new(1000, 500, crate::models::MaxQps::Bounded(3000));
        state.max_successful_qps = Some(1234);
        let verdict = BottleneckVerdict {
            cycle_index: 1,
            is_bottleneck: false,
            scenario: Scenario::Normal,
            contributing_dimensions: BTreeSet::new(),
            consecutive_count: 0,
            unhealthy_streak: 0,
        };
        let normal = ("scenario", "normal");
        let before = gathered("rpc_ramp_verdicts_total", Some(normal)).unwrap_or(0.0);

        metrics.observe_verdict(&verdict, &state);
        metrics.observe_burst(
            &LoadResult::new(1000, 990.0, 99.9, 0.1, 12.0, 80.0, 60.0),
            60.2,
        );

        let after = gathered("rpc_ramp_verdicts_total", Some(normal)).unwrap();
        assert!(after >= before + 1.0);
        assert_eq!(gathered("rpc_ramp_max_successful_qps", None), Some(1234.0));
    }

    #[test]
    fn test_structured_logger_run_id() {
        let logger = StructuredLogger::new("ramp-20261016");
        assert_eq!(logger.run_id(), "ramp-20261016");
    }
}
