//! Ramp Runner - adaptive QPS ramp against a blockchain RPC node
//!
//! Steps load up level by level until the node hits a confirmed
//! bottleneck, fails, reaches the configured maximum or is aborted.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use ramp_lib::{
    driver::CommandLoadDriver,
    health::{components, HealthRegistry},
    observability::{RampMetrics, StructuredLogger},
    probe::{HealthProbe, RpcHealthProbe},
    recorder::{write_atomic, FileRecorder},
    sampler::{HostSampler, ResourceSampler, SamplingLoop},
    stream::sample_stream,
    HealthSample, RampController, RampError, ResourceSample, RunnerSettings,
};
use ramp_runner::{api, config};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const SETTINGS_FILE: &str = "settings.json";

/// Exit status for settings that failed validation
const EXIT_CONFIG: u8 = 2;
/// Exit status when the load tool failed mid-run
const EXIT_LOAD_DRIVER: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let args = config::Args::parse();

    let settings = match config::load(&args) {
        Ok(settings) => settings,
        Err(e) => {
            error!(error = format!("{:#}", e), "Failed to load configuration");
            eprintln!("ramp-runner: {:#}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    if let Err(e) = settings.validate() {
        error!(error = %e, "Invalid configuration");
        eprintln!("ramp-runner: invalid configuration: {}", e);
        return ExitCode::from(EXIT_CONFIG);
    }

    match run(settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = format!("{:#}", e), "Ramp run failed");
            match e.downcast_ref::<RampError>() {
                Some(RampError::LoadDriver { .. }) => ExitCode::from(EXIT_LOAD_DRIVER),
                _ => ExitCode::FAILURE,
            }
        }
    }
}

async fn run(settings: RunnerSettings) -> Result<()> {
    let run_id = settings
        .run_id
        .clone()
        .unwrap_or_else(|| Utc::now().format("ramp-%Y%m%dT%H%M%SZ").to_string());
    let run_dir = settings.run_dir(&run_id);

    info!(run_id = %run_id, run_dir = %run_dir.display(), "Starting ramp-runner");

    let recorder = Arc::new(FileRecorder::create(&run_dir)?);
    write_atomic(&run_dir.join(SETTINGS_FILE), &settings)
        .context("Failed to record settings")?;

    // Initialize health registry
    let health_registry = HealthRegistry::new();
    health_registry.register(components::RESOURCE_SAMPLER).await;
    health_registry.register(components::HEALTH_PROBE).await;

    let metrics = RampMetrics::new();
    let logger = StructuredLogger::new(&run_id);

    // Background samplers
    let interval = settings.sample_interval();
    let (resource_writer, resource_reader) = sample_stream::<ResourceSample>();
    let (health_writer, health_reader) = sample_stream::<HealthSample>();

    let sampler: Arc<dyn ResourceSampler> = Arc::new(
        HostSampler::new(settings.sampler.clone())
            .await
            .context("Failed to initialize resource sampler")?,
    );
    let probe: Arc<dyn HealthProbe> = Arc::new(
        RpcHealthProbe::new(settings.probe.clone()).context("Failed to initialize health probe")?,
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let sampler_handle = SamplingLoop::new(
        components::RESOURCE_SAMPLER,
        sampler,
        resource_writer,
        interval,
    )
    .with_health(health_registry.clone())
    .with_metrics(metrics.clone())
    .spawn(shutdown_tx.subscribe());
    let probe_handle = SamplingLoop::new(components::HEALTH_PROBE, probe, health_writer, interval)
        .with_health(health_registry.clone())
        .with_metrics(metrics.clone())
        .spawn(shutdown_tx.subscribe());

    let controller = RampController::builder()
        .config(settings.ramp.clone())
        .thresholds(settings.thresholds.clone())
        .driver(Arc::new(CommandLoadDriver::new(settings.driver.clone())))
        .resources(resource_reader)
        .health(health_reader)
        .recorder(recorder)
        .max_sample_age(interval)
        .logger(logger.clone())
        .metrics(metrics.clone())
        .registry(health_registry.clone())
        .build()?;

    // Start status, health and metrics server
    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        metrics.clone(),
        controller.status(),
        controller.abort_handle(),
    ));
    let api_handle = tokio::spawn(api::serve(settings.api_port, app_state));

    // Ctrl-C stops the run before its next level
    let abort = controller.abort_handle();
    let signal_logger = logger.clone();
    let signal_handle = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_logger.log_shutdown("SIGINT received, aborting run");
            abort.abort();
        }
    });

    let result = controller.run().await;

    let _ = shutdown_tx.send(());
    for (name, handle) in [
        (components::RESOURCE_SAMPLER, sampler_handle),
        (components::HEALTH_PROBE, probe_handle),
    ] {
        if let Err(e) = handle.await {
            warn!(component = name, error = %e, "Sampling loop did not stop cleanly");
        }
    }
    signal_handle.abort();
    api_handle.abort();

    let outcome = result?;
    logger.log_shutdown("run complete");
    info!(
        run_dir = %run_dir.display(),
        reason = %outcome.termination_reason,
        max_successful_qps = ?outcome.max_successful_qps,
        "Ramp finished"
    );
    println!(
        "{}: max successful QPS {} (results in {})",
        outcome.termination_reason,
        outcome
            .max_successful_qps
            .map_or_else(|| "none".to_string(), |q| q.to_string()),
        run_dir.display()
    );

    Ok(())
}
