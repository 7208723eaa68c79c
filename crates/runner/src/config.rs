//! Runner configuration
//!
//! Settings are layered, later sources winning:
//! built-in defaults, an optional TOML/YAML/JSON file, `RAMP__*`
//! environment variables, then command-line flags.

use anyhow::{Context, Result};
use clap::Parser;
use config::{Config, Environment, File};
use ramp_lib::{MaxQps, RunnerSettings};
use std::collections::HashMap;
use std::path::PathBuf;

/// Adaptive QPS ramp runner
#[derive(Parser, Debug, Default)]
#[command(name = "ramp-runner")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Settings file (TOML, YAML or JSON)
    #[arg(short, long, env = "RAMP_CONFIG")]
    pub config: Option<PathBuf>,

    /// First load level
    #[arg(long)]
    pub initial_qps: Option<u64>,

    /// Highest load level, or "unbounded"
    #[arg(long, value_parser = parse_max_qps)]
    pub max_qps: Option<MaxQps>,

    /// Increment between levels
    #[arg(long)]
    pub step_qps: Option<u64>,

    /// Seconds each level is held
    #[arg(long)]
    pub duration_per_level_s: Option<u64>,

    /// Seconds of unevaluated load before the first level
    #[arg(long)]
    pub warmup_s: Option<u64>,

    /// Seconds of idle between levels
    #[arg(long)]
    pub cooldown_s: Option<u64>,

    /// Keep ramping after a confirmed bottleneck
    #[arg(long)]
    pub no_auto_stop: bool,

    /// RPC endpoint the load tool targets
    #[arg(long)]
    pub target_url: Option<String>,

    /// RPC endpoint of the node under test, for health probing
    #[arg(long)]
    pub local_rpc_url: Option<String>,

    /// Trusted RPC endpoint used as the chain-height reference
    #[arg(long)]
    pub reference_rpc_url: Option<String>,

    /// Parent directory for run directories
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Name of this run's directory
    #[arg(long)]
    pub run_id: Option<String>,

    /// Port for the status and metrics API
    #[arg(long)]
    pub api_port: Option<u16>,

    /// Background sampling interval in milliseconds
    #[arg(long)]
    pub sample_interval_ms: Option<u64>,
}

fn parse_max_qps(value: &str) -> Result<MaxQps, String> {
    value.parse()
}

/// Load settings from the process environment
pub fn load(args: &Args) -> Result<RunnerSettings> {
    load_from(args, None)
}

/// Load settings, reading `RAMP__*` variables from `env` instead of the
/// process environment when given
pub fn load_from(args: &Args, env: Option<HashMap<String, String>>) -> Result<RunnerSettings> {
    let mut builder = Config::builder();

    if let Some(path) = &args.config {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix("RAMP")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
            .source(env),
    );

    let overrides: [(&str, Option<String>); 13] = [
        ("ramp.initial_qps", args.initial_qps.map(|v| v.to_string())),
        ("ramp.max_qps", args.max_qps.map(|v| v.to_string())),
        ("ramp.step_qps", args.step_qps.map(|v| v.to_string())),
        (
            "ramp.duration_per_level_s",
            args.duration_per_level_s.map(|v| v.to_string()),
        ),
        ("ramp.warmup_s", args.warmup_s.map(|v| v.to_string())),
        ("ramp.cooldown_s", args.cooldown_s.map(|v| v.to_string())),
        ("driver.target_url", args.target_url.clone()),
        ("probe.local_rpc_url", args.local_rpc_url.clone()),
        ("probe.reference_rpc_url", args.reference_rpc_url.clone()),
        (
            "output_dir",
            args.output_dir.as_ref().map(|p| p.display().to_string()),
        ),
        ("run_id", args.run_id.clone()),
        ("api_port", args.api_port.map(|v| v.to_string())),
        (
            "sample_interval_ms",
            args.sample_interval_ms.map(|v| v.to_string()),
        ),
    ];
    for (key, value) in overrides {
        builder = builder.set_override_option(key, value)?;
    }
    if args.no_auto_stop {
        builder = builder.set_override("ramp.auto_stop", false)?;
    }

    let settings = builder
        .build()
        .context("Failed to assemble configuration")?
        .try_deserialize::<RunnerSettings>()
        .context("Failed to parse configuration")?;

    Ok(settings)
}
