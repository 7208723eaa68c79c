//! Error types shared across the ramp

use thiserror::Error;

/// Invalid configuration, detected before any load is driven
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    NotPositive { field: &'static str },

    #[error("threshold {field} = {value} is out of range ({expected})")]
    ThresholdOutOfRange {
        field: &'static str,
        value: f64,
        expected: &'static str,
    },

    #[error("max_qps is unbounded but auto_stop is disabled; the run would never end. Set a finite max_qps or enable auto_stop")]
    UnboundedWithoutAutoStop,

    #[error("initial_qps ({initial}) is above max_qps ({max})")]
    InitialAboveMax { initial: u64, max: u64 },

    #[error("{field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Failure of the external load tool
#[derive(Debug, Error)]
pub enum LoadDriverError {
    #[error("failed to launch load tool `{command}`: {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("load tool exited with {status}: {stderr}")]
    Crashed { status: String, stderr: String },

    #[error("load tool produced no usable result record: {0}")]
    MissingResult(String),

    #[error("load burst did not finish within {timeout_secs}s")]
    Timeout { timeout_secs: u64 },
}

/// Errors that end a ramp run
#[derive(Debug, Error)]
pub enum RampError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("load driver failed at {qps} QPS (last good level: {last_good_qps:?}): {source}")]
    LoadDriver {
        qps: u64,
        last_good_qps: Option<u64>,
        #[source]
        source: LoadDriverError,
    },

    #[error("failed to record run: {0}")]
    Recorder(#[from] anyhow::Error),
}

impl RampError {
    /// Highest level reached before the failure, if any
    pub fn last_good_qps(&self) -> Option<u64> {
        match self {
            RampError::LoadDriver { last_good_qps, .. } => *last_good_qps,
            _ => None,
        }
    }
}
