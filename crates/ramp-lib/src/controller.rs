//! Adaptive QPS ramp
//!
//! The controller steps load up one level at a time, asks the classifier
//! for a verdict after every burst and stops once the node has hit a real
//! ceiling, failed outright, reached the configured maximum or been aborted.
//!
//! It never waits on the samplers: each cycle reads whatever sample is
//! newest, re-reads once after one sampling interval if that sample is too
//! old, and treats the cycle as inconclusive if it is still too old.

use crate::classifier::{BottleneckClassifier, HysteresisTracker, Thresholds, CONFIRMATION_CYCLES};
use crate::driver::LoadDriver;
use crate::error::{ConfigError, LoadDriverError, RampError};
use crate::health::{components, HealthRegistry};
use crate::models::{
    BottleneckVerdict, CycleAnomaly, CycleRecord, HealthSample, LoadResult, MaxQps, Phase,
    ResourceSample, RunState, RunSummary, Scenario, TerminationReason,
};
use crate::observability::{RampMetrics, StructuredLogger};
use crate::recorder::RunRecorder;
use crate::retry::RetryPolicy;
use crate::stream::SampleReader;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Ramp parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RampConfig {
    pub initial_qps: u64,
    pub max_qps: MaxQps,
    pub step_qps: u64,
    pub duration_per_level_s: u64,
    /// Settling burst at `initial_qps` before the first evaluated level; 0 skips it
    pub warmup_s: u64,
    pub cooldown_s: u64,
    /// Stop on a confirmed bottleneck; may only be disabled with a finite `max_qps`
    pub auto_stop: bool,
    /// Added to the burst duration to form the load driver's hard timeout
    pub driver_grace_s: u64,
}

impl Default for RampConfig {
    fn default() -> Self {
        Self {
            initial_qps: 1000,
            max_qps: MaxQps::Bounded(10_000),
            step_qps: 500,
            duration_per_level_s: 60,
            warmup_s: 30,
            cooldown_s: 10,
            auto_stop: true,
            driver_grace_s: 30,
        }
    }
}

impl RampConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_qps == 0 {
            return Err(ConfigError::NotPositive { field: "initial_qps" });
        }
        if self.step_qps == 0 {
            return Err(ConfigError::NotPositive { field: "step_qps" });
        }
        if self.duration_per_level_s == 0 {
            return Err(ConfigError::NotPositive {
                field: "duration_per_level_s",
            });
        }
        match self.max_qps {
            MaxQps::Bounded(0) => return Err(ConfigError::NotPositive { field: "max_qps" }),
            MaxQps::Bounded(max) if self.initial_qps > max => {
                return Err(ConfigError::InitialAboveMax {
                    initial: self.initial_qps,
                    max,
                })
            }
            MaxQps::Unbounded if !self.auto_stop => {
                return Err(ConfigError::UnboundedWithoutAutoStop)
            }
            _ => {}
        }
        Ok(())
    }

    fn level_duration(&self) -> Duration {
        Duration::from_secs(self.duration_per_level_s)
    }
}

/// What a finished run produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub termination_reason: TerminationReason,
    /// Highest level that completed without a confirmed bottleneck
    pub max_successful_qps: Option<u64>,
    pub final_state: RunState,
    pub verdicts: Vec<BottleneckVerdict>,
}

/// Read-only view of a running ramp's state
#[derive(Clone)]
pub struct RunStatusHandle {
    rx: watch::Receiver<RunState>,
}

impl RunStatusHandle {
    /// The most recently published state
    pub fn snapshot(&self) -> RunState {
        self.rx.borrow().clone()
    }

    /// Wait for the next published state
    pub async fn changed(&mut self) -> Option<RunState> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }
}

/// Requests a stop between levels
#[derive(Clone)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl AbortHandle {
    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Drives a ramp run
pub struct RampController {
    config: RampConfig,
    driver: Arc<dyn LoadDriver>,
    resources: SampleReader<ResourceSample>,
    health: SampleReader<HealthSample>,
    classifier: BottleneckClassifier,
    recorder: Arc<dyn RunRecorder>,
    max_sample_age: Duration,
    abort_tx: Arc<watch::Sender<bool>>,
    status_tx: watch::Sender<RunState>,
    logger: StructuredLogger,
    metrics: Option<RampMetrics>,
    registry: Option<HealthRegistry>,
}

impl RampController {
    pub fn builder() -> RampControllerBuilder {
        RampControllerBuilder::new()
    }

    pub fn config(&self) -> &RampConfig {
        &self.config
    }

    pub fn status(&self) -> RunStatusHandle {
        RunStatusHandle {
            rx: self.status_tx.subscribe(),
        }
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            tx: self.abort_tx.clone(),
        }
    }

    fn aborted(&self) -> bool {
        *self.abort_tx.borrow()
    }

    /// Run the ramp to completion
    ///
    /// A load driver failure ends the run with [`RampError::LoadDriver`]
    /// after the cycles so far and a summary have been recorded.
    pub async fn run(&self) -> Result<RunOutcome, RampError> {
        let started_at = Utc::now();
        let mut state = RunState::new(
            self.config.initial_qps,
            self.config.step_qps,
            self.config.max_qps,
        );
        let mut tracker = HysteresisTracker::new(self.classifier.clone());
        let mut verdicts = Vec::new();

        self.logger.log_run_started(&state);
        if let Some(registry) = &self.registry {
            registry.register(components::LOAD_DRIVER).await;
            registry.register(components::RECORDER).await;
            registry.set_ready(true).await;
        }
        self.publish(&mut state).await?;

        if self.config.warmup_s > 0 && !self.aborted() {
            self.logger.log_level_started(0, state.current_qps, true);
            let warmup = Duration::from_secs(self.config.warmup_s);
            if let Err(source) = self.drive(state.current_qps, warmup).await {
                return Err(self.fail(state, source, started_at).await);
            }
        }

        state.phase = Phase::Steady;
        self.publish(&mut state).await?;

        let mut cycle_index = 0u64;
        let reason = loop {
            if self.aborted() {
                break TerminationReason::UserAbort;
            }

            cycle_index += 1;
            self.logger
                .log_level_started(cycle_index, state.current_qps, false);
            let load = match self
                .drive(state.current_qps, self.config.level_duration())
                .await
            {
                Ok(load) => load,
                Err(source) => return Err(self.fail(state, source, started_at).await),
            };

            let mut anomalies = Vec::new();
            let samples = self.read_samples(&mut anomalies).await;
            let verdict = match &samples {
                Some((resource, health)) => tracker.evaluate(cycle_index, &load, resource, health),
                None => tracker.inconclusive(cycle_index),
            };
            annotate(&verdict, samples.as_ref().map(|(_, h)| h.as_ref()), &mut anomalies);

            state.consecutive_bottleneck_count = verdict.consecutive_count;
            state.unhealthy_streak = verdict.unhealthy_streak;
            state.cycles_evaluated += 1;

            let confirmed =
                verdict.is_bottleneck && verdict.consecutive_count >= CONFIRMATION_CYCLES;
            if !confirmed && verdict.scenario != Scenario::NodeFailure {
                state.max_successful_qps = Some(state.current_qps);
            }

            self.record_cycle(CycleRecord {
                cycle_index,
                timestamp: Utc::now(),
                load: load.clone(),
                resource: samples.as_ref().map(|(r, _)| r.as_ref().clone()),
                health: samples.as_ref().map(|(_, h)| h.as_ref().clone()),
                verdict: verdict.clone(),
                anomalies: anomalies.clone(),
            })
            .await?;

            self.logger.log_verdict(&verdict, &load);
            for anomaly in &anomalies {
                self.logger.log_anomaly(cycle_index, anomaly);
            }
            if let Some(metrics) = &self.metrics {
                metrics.observe_verdict(&verdict, &state);
            }
            verdicts.push(verdict.clone());

            if verdict.scenario == Scenario::NodeFailure {
                break TerminationReason::NodeFailure;
            }
            if confirmed {
                if self.config.auto_stop {
                    break TerminationReason::BottleneckConfirmed;
                }
                warn!(
                    qps = state.current_qps,
                    consecutive = verdict.consecutive_count,
                    "Bottleneck confirmed, continuing because auto_stop is disabled"
                );
            }

            let next_qps = state.current_qps.saturating_add(self.config.step_qps);
            if state.max_qps.exceeded_by(next_qps) {
                break TerminationReason::MaxQpsReached;
            }

            self.publish(&mut state).await?;
            self.pause(Duration::from_secs(self.config.cooldown_s)).await;
            if self.aborted() {
                break TerminationReason::UserAbort;
            }
            state.current_qps = next_qps;
            self.publish(&mut state).await?;
        };

        self.finish(state, reason, verdicts, started_at).await
    }

    /// One burst under the hard timeout; never retried
    async fn drive(&self, qps: u64, duration: Duration) -> Result<LoadResult, LoadDriverError> {
        if let Some(metrics) = &self.metrics {
            metrics.set_target_qps(qps);
        }

        let limit = duration + Duration::from_secs(self.config.driver_grace_s);
        let start = Instant::now();
        let result = RetryPolicy::none()
            .run("load burst", || async {
                match tokio::time::timeout(limit, self.driver.drive(qps, duration)).await {
                    Ok(result) => result,
                    Err(_) => Err(LoadDriverError::Timeout {
                        timeout_secs: limit.as_secs(),
                    }),
                }
            })
            .await;

        match &result {
            Ok(load) => {
                if let Some(metrics) = &self.metrics {
                    metrics.observe_burst(load, start.elapsed().as_secs_f64());
                }
                if let Some(registry) = &self.registry {
                    registry.set_healthy(components::LOAD_DRIVER).await;
                }
            }
            Err(e) => {
                if let Some(registry) = &self.registry {
                    registry
                        .set_unhealthy(components::LOAD_DRIVER, e.to_string())
                        .await;
                }
            }
        }
        result
    }

    /// Freshest samples, re-reading once after one interval if either is stale
    async fn read_samples(
        &self,
        anomalies: &mut Vec<CycleAnomaly>,
    ) -> Option<(Arc<ResourceSample>, Arc<HealthSample>)> {
        for attempt in 0..2 {
            let now = Utc::now();
            let resource = self.resources.latest_within(self.max_sample_age, now);
            let health = self.health.latest_within(self.max_sample_age, now);

            if resource.is_none() {
                note(anomalies, CycleAnomaly::ResourceSampleStale);
                self.count_stale("resource");
            }
            if health.is_none() {
                note(anomalies, CycleAnomaly::HealthSampleStale);
                self.count_stale("health");
            }

            match (resource, health) {
                (Some(resource), Some(health)) => return Some((resource, health)),
                _ if attempt == 0 => {
                    note(anomalies, CycleAnomaly::SampleRetried);
                    debug!(
                        wait_ms = self.max_sample_age.as_millis() as u64,
                        "Samples stale, retrying once"
                    );
                    tokio::time::sleep(self.max_sample_age).await;
                }
                _ => {}
            }
        }

        note(anomalies, CycleAnomaly::Inconclusive);
        None
    }

    fn count_stale(&self, stream: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_stale_sample(stream);
        }
    }

    /// Sleep, waking early on abort
    async fn pause(&self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        let mut abort = self.abort_tx.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = abort.wait_for(|aborted| *aborted) => {}
        }
    }

    async fn publish(&self, state: &mut RunState) -> Result<(), RampError> {
        state.updated_at = Utc::now();
        self.status_tx.send_replace(state.clone());
        let result = self.recorder.record_state(state);
        self.track_recorder(&result).await;
        result.map_err(RampError::Recorder)
    }

    async fn record_cycle(&self, record: CycleRecord) -> Result<(), RampError> {
        let result = self.recorder.record_cycle(&record);
        self.track_recorder(&result).await;
        result.map_err(RampError::Recorder)
    }

    async fn track_recorder(&self, result: &Result<()>) {
        if let (Some(registry), Err(e)) = (&self.registry, result) {
            registry
                .set_unhealthy(components::RECORDER, e.to_string())
                .await;
        }
    }

    async fn finish(
        &self,
        mut state: RunState,
        reason: TerminationReason,
        verdicts: Vec<BottleneckVerdict>,
        started_at: DateTime<Utc>,
    ) -> Result<RunOutcome, RampError> {
        state.phase = Phase::Cooldown;
        self.publish(&mut state).await?;
        if reason != TerminationReason::UserAbort {
            self.pause(Duration::from_secs(self.config.cooldown_s)).await;
        }

        state.phase = Phase::Terminated;
        state.termination_reason = Some(reason);
        self.publish(&mut state).await?;

        let summary = RunSummary {
            state: state.clone(),
            termination_reason: Some(reason),
            max_successful_qps: state.max_successful_qps,
            fatal_error: None,
            started_at,
            finished_at: Utc::now(),
            cycles: state.cycles_evaluated,
        };
        let result = self.recorder.finish(&summary);
        self.track_recorder(&result).await;
        result.map_err(RampError::Recorder)?;

        self.logger.log_terminated(reason, state.max_successful_qps);
        if let Some(registry) = &self.registry {
            registry.set_ready(false).await;
        }

        Ok(RunOutcome {
            termination_reason: reason,
            max_successful_qps: state.max_successful_qps,
            final_state: state,
            verdicts,
        })
    }

    /// Record what is known about a run the load driver killed
    async fn fail(
        &self,
        mut state: RunState,
        source: LoadDriverError,
        started_at: DateTime<Utc>,
    ) -> RampError {
        let message = source.to_string();
        self.logger
            .log_fatal(state.current_qps, state.max_successful_qps, &message);

        state.phase = Phase::Terminated;
        if let Err(e) = self.publish(&mut state).await {
            warn!(error = %e, "Failed to record final state");
        }

        let summary = RunSummary {
            state: state.clone(),
            termination_reason: None,
            max_successful_qps: state.max_successful_qps,
            fatal_error: Some(message),
            started_at,
            finished_at: Utc::now(),
            cycles: state.cycles_evaluated,
        };
        if let Err(e) = self.recorder.finish(&summary) {
            warn!(error = %e, "Failed to record run summary");
        }
        if let Some(registry) = &self.registry {
            registry.set_ready(false).await;
        }

        RampError::LoadDriver {
            qps: state.current_qps,
            last_good_qps: state.max_successful_qps,
            source,
        }
    }
}

fn note(anomalies: &mut Vec<CycleAnomaly>, anomaly: CycleAnomaly) {
    if !anomalies.contains(&anomaly) {
        anomalies.push(anomaly);
    }
}

/// Flag the signals a verdict absorbed without acting on
fn annotate(verdict: &BottleneckVerdict, health: Option<&HealthSample>, anomalies: &mut Vec<CycleAnomaly>) {
    if verdict.scenario == Scenario::ResourceFalsePositive {
        note(anomalies, CycleAnomaly::ResourceFalsePositive);
    }
    if let Some(health) = health {
        if health.is_unhealthy() && verdict.scenario == Scenario::Normal {
            note(anomalies, CycleAnomaly::TransientUnhealthy);
        }
        if health.data_loss {
            note(anomalies, CycleAnomaly::DataLossReported);
        }
    }
}

/// Builder for [`RampController`]
pub struct RampControllerBuilder {
    config: RampConfig,
    thresholds: Thresholds,
    driver: Option<Arc<dyn LoadDriver>>,
    resources: Option<SampleReader<ResourceSample>>,
    health: Option<SampleReader<HealthSample>>,
    recorder: Option<Arc<dyn RunRecorder>>,
    max_sample_age: Duration,
    logger: Option<StructuredLogger>,
    metrics: Option<RampMetrics>,
    registry: Option<HealthRegistry>,
}

impl RampControllerBuilder {
    pub fn new() -> Self {
        Self {
            config: RampConfig::default(),
            thresholds: Thresholds::default(),
            driver: None,
            resources: None,
            health: None,
            recorder: None,
            max_sample_age: Duration::from_secs(5),
            logger: None,
            metrics: None,
            registry: None,
        }
    }

    pub fn config(mut self, config: RampConfig) -> Self {
        self.config = config;
        self
    }

    pub fn thresholds(mut self, thresholds: Thresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn driver(mut self, driver: Arc<dyn LoadDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    pub fn resources(mut self, reader: SampleReader<ResourceSample>) -> Self {
        self.resources = Some(reader);
        self
    }

    pub fn health(mut self, reader: SampleReader<HealthSample>) -> Self {
        self.health = Some(reader);
        self
    }

    pub fn recorder(mut self, recorder: Arc<dyn RunRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Oldest sample a cycle may use; normally one sampling interval
    pub fn max_sample_age(mut self, age: Duration) -> Self {
        self.max_sample_age = age;
        self
    }

    pub fn logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn metrics(mut self, metrics: RampMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn registry(mut self, registry: HealthRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Validate the configuration and build the controller
    pub fn build(self) -> Result<RampController> {
        self.config.validate()?;
        self.thresholds.validate()?;

        let driver = self
            .driver
            .ok_or_else(|| anyhow::anyhow!("Load driver is required"))?;
        let resources = self
            .resources
            .ok_or_else(|| anyhow::anyhow!("Resource sample stream is required"))?;
        let health = self
            .health
            .ok_or_else(|| anyhow::anyhow!("Health sample stream is required"))?;
        let recorder = self
            .recorder
            .ok_or_else(|| anyhow::anyhow!("Run recorder is required"))?;

        let initial = RunState::new(
            self.config.initial_qps,
            self.config.step_qps,
            self.config.max_qps,
        );
        let (status_tx, _) = watch::channel(initial);
        let (abort_tx, _) = watch::channel(false);

        Ok(RampController {
            config: self.config,
            driver,
            resources,
            health,
            classifier: BottleneckClassifier::new(self.thresholds),
            recorder,
            max_sample_age: self.max_sample_age,
            abort_tx: Arc::new(abort_tx),
            status_tx,
            logger: self
                .logger
                .unwrap_or_else(|| StructuredLogger::new("ramp")),
            metrics: self.metrics,
            registry: self.registry,
        })
    }
}

impl Default for RampControllerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
