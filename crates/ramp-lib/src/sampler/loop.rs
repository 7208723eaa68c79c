//! Fixed-interval sampling loop
//!
//! Drives one sample source on a ticker and appends every successful sample
//! to its stream. Each call is bounded by the interval so a stuck source
//! cannot hold the loop past teardown.

use super::ResourceSampler;
use crate::health::HealthRegistry;
use crate::models::{HealthSample, ResourceSample, Timestamped};
use crate::observability::RampMetrics;
use crate::probe::HealthProbe;
use crate::stream::SampleWriter;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Anything the loop can poll for samples
#[async_trait]
pub trait SampleSource: Send + Sync + 'static {
    type Sample: Timestamped + Send + Sync + 'static;

    async fn next_sample(&self) -> Result<Self::Sample>;
}

#[async_trait]
impl SampleSource for Arc<dyn ResourceSampler> {
    type Sample = ResourceSample;

    async fn next_sample(&self) -> Result<ResourceSample> {
        self.sample().await
    }
}

#[async_trait]
impl SampleSource for Arc<dyn HealthProbe> {
    type Sample = HealthSample;

    async fn next_sample(&self) -> Result<HealthSample> {
        Ok(self.sample().await)
    }
}

/// Sampling loop for one stream
pub struct SamplingLoop<S: SampleSource> {
    component: &'static str,
    source: S,
    writer: SampleWriter<S::Sample>,
    interval: Duration,
    health: Option<HealthRegistry>,
    metrics: Option<RampMetrics>,
}

impl<S: SampleSource> SamplingLoop<S> {
    /// Create a loop that reports as `component`
    pub fn new(
        component: &'static str,
        source: S,
        writer: SampleWriter<S::Sample>,
        interval: Duration,
    ) -> Self {
        Self {
            component,
            source,
            writer,
            interval,
            health: None,
            metrics: None,
        }
    }

    /// Report success and failure to a health registry
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn with_metrics(mut self, metrics: RampMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Spawn the loop onto the runtime
    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Run until the shutdown channel fires or closes
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            component = self.component,
            interval_ms = self.interval.as_millis() as u64,
            "Starting sampling loop"
        );

        if let Some(health) = &self.health {
            health.register(self.component).await;
        }

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut taken = 0u64;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.tick().await {
                        taken += 1;
                    }
                }
                _ = shutdown.recv() => {
                    info!(component = self.component, samples = taken, "Stopping sampling loop");
                    break;
                }
            }
        }
    }

    /// Take one sample; returns true if it was appended
    async fn tick(&self) -> bool {
        let start = Instant::now();
        let outcome = tokio::time::timeout(self.interval, self.source.next_sample()).await;

        let error = match outcome {
            Ok(Ok(sample)) => {
                if !self.writer.push(sample) {
                    return false;
                }
                debug!(
                    component = self.component,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Sample recorded"
                );
                if let Some(health) = &self.health {
                    health.set_healthy(self.component).await;
                }
                return true;
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("sample took longer than {:?}", self.interval),
        };

        warn!(component = self.component, error = %error, "Sampling failed");
        if let Some(metrics) = &self.metrics {
            metrics.record_sample_error(self.component);
        }
        if let Some(health) = &self.health {
            health.set_degraded(self.component, error).await;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::{components, ComponentStatus};
    use crate::stream::sample_stream;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSampler {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ResourceSampler for CountingSampler {
        async fn sample(&self) -> Result<ResourceSample> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("diskstats unreadable");
            }
            Ok(ResourceSample::idle(chrono::Utc::now()))
        }
    }

    struct FixedProbe;

    #[async_trait]
    impl HealthProbe for FixedProbe {
        async fn sample(&self) -> HealthSample {
            HealthSample::healthy(chrono::Utc::now())
        }
    }

    #[tokio::test]
    async fn test_loop_appends_samples_until_shutdown() {
        let sampler: Arc<dyn ResourceSampler> = Arc::new(CountingSampler {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let (writer, reader) = sample_stream();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = SamplingLoop::new(
            components::RESOURCE_SAMPLER,
            sampler,
            writer,
            Duration::from_millis(10),
        )
        .spawn(shutdown_rx);

        tokio::time::sleep(Duration::from_millis(55)).await;
        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_millis(100), handle)
            .await
            .expect("loop should stop promptly")
            .unwrap();

        assert!(reader.len() >= 2);
    }

    #[tokio::test]
    async fn test_failed_sample_degrades_component() {
        let sampler: Arc<dyn ResourceSampler> = Arc::new(CountingSampler {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let (writer, reader) = sample_stream();
        let health = HealthRegistry::new();

        let sampling = SamplingLoop::new(
            components::RESOURCE_SAMPLER,
            sampler,
            writer,
            Duration::from_millis(10),
        )
        .with_health(health.clone());

        assert!(!sampling.tick().await);
        assert!(reader.is_empty());

        let report = health.health().await;
        assert_eq!(
            report.components[components::RESOURCE_SAMPLER].status,
            ComponentStatus::Degraded
        );
    }

    #[tokio::test]
    async fn test_health_probe_source() {
        let probe: Arc<dyn HealthProbe> = Arc::new(FixedProbe);
        let (writer, reader) = sample_stream();

        let sampling = SamplingLoop::new(
            components::HEALTH_PROBE,
            probe,
            writer,
            Duration::from_millis(50),
        );

        assert!(sampling.tick().await);
        assert!(!reader.latest().unwrap().is_unhealthy());
    }
}
