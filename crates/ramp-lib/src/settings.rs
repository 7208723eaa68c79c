//! Runner settings
//!
//! Everything the runner needs, assembled once at startup and validated as
//! a unit before any load is driven. Layering (defaults, file, environment,
//! command line) is done by the runner binary; this module only defines the
//! shape and the checks.

use crate::classifier::Thresholds;
use crate::controller::RampConfig;
use crate::driver::DriverConfig;
use crate::error::ConfigError;
use crate::probe::ProbeConfig;
use crate::sampler::HostSamplerConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Complete runner configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerSettings {
    /// Name of the run directory; generated from the start time when unset
    pub run_id: Option<String>,
    /// Parent directory for run directories
    pub output_dir: PathBuf,
    /// Port for the status and metrics API
    pub api_port: u16,
    /// Interval of both background samplers; also the maximum sample age
    pub sample_interval_ms: u64,
    pub ramp: RampConfig,
    pub thresholds: Thresholds,
    pub probe: ProbeConfig,
    pub sampler: HostSamplerConfig,
    pub driver: DriverConfig,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            run_id: None,
            output_dir: PathBuf::from("runs"),
            api_port: 9184,
            sample_interval_ms: 5000,
            ramp: RampConfig::default(),
            thresholds: Thresholds::default(),
            probe: ProbeConfig::default(),
            sampler: HostSamplerConfig::default(),
            driver: DriverConfig::default(),
        }
    }
}

impl RunnerSettings {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    /// Directory this run writes into
    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.output_dir.join(run_id)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.ramp.validate()?;
        self.thresholds.validate()?;

        if self.sample_interval_ms == 0 {
            return Err(ConfigError::NotPositive {
                field: "sample_interval_ms",
            });
        }

        let worst_case = self.probe.worst_case();
        if worst_case > self.sample_interval() {
            return Err(ConfigError::Invalid {
                field: "probe",
                reason: format!(
                    "a probe can take up to {}ms (timeout x attempts + backoff), longer than the {}ms sampling interval",
                    worst_case.as_millis(),
                    self.sample_interval_ms
                ),
            });
        }
        if self.probe.data_loss_lag <= self.probe.max_healthy_lag {
            return Err(ConfigError::Invalid {
                field: "probe.data_loss_lag",
                reason: format!(
                    "must exceed max_healthy_lag ({})",
                    self.probe.max_healthy_lag
                ),
            });
        }
        check_url("probe.local_rpc_url", &self.probe.local_rpc_url)?;
        if let Some(reference) = &self.probe.reference_rpc_url {
            check_url("probe.reference_rpc_url", reference)?;
        }
        check_url("driver.target_url", &self.driver.target_url)?;

        if self.driver.command.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "driver.command",
                reason: "load tool command is empty".to_string(),
            });
        }
        if self.sampler.link_bandwidth_mbps <= 0.0 {
            return Err(ConfigError::NotPositive {
                field: "sampler.link_bandwidth_mbps",
            });
        }
        if self.sampler.nic_allowance_checks && self.sampler.network_interface.is_none() {
            return Err(ConfigError::Invalid {
                field: "sampler.nic_allowance_checks",
                reason: "requires sampler.network_interface".to_string(),
            });
        }

        Ok(())
    }
}

fn check_url(field: &'static str, value: &str) -> Result<(), ConfigError> {
    url::Url::parse(value)
        .map(|_| ())
        .map_err(|e| ConfigError::Invalid {
            field,
            reason: format!("{:?} is not a valid URL: {}", value, e),
        })
}
