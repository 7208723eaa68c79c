//! Adaptive load ramp library for blockchain RPC nodes
//!
//! This crate provides the core functionality for:
//! - Stepping load up level by level (`controller`)
//! - Deciding whether the node has hit a real ceiling (`classifier`)
//! - Background resource and health sampling (`sampler`, `probe`, `stream`)
//! - Running the external load tool (`driver`)
//! - Recording runs to disk (`recorder`)
//! - Health checks and observability

pub mod classifier;
pub mod controller;
pub mod driver;
pub mod error;
pub mod health;
pub mod models;
pub mod observability;
pub mod probe;
pub mod recorder;
pub mod retry;
pub mod sampler;
pub mod settings;
pub mod stream;

pub use classifier::{BottleneckClassifier, Hysteresis, HysteresisTracker, Thresholds};
pub use controller::{AbortHandle, RampConfig, RampController, RunOutcome, RunStatusHandle};
pub use error::{ConfigError, LoadDriverError, RampError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{RampMetrics, StructuredLogger};
pub use settings::RunnerSettings;
