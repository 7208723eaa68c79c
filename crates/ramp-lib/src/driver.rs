//! Load driver
//!
//! Runs one fixed-QPS burst against the node and reports what the client
//! side saw. The default implementation shells out to an external load tool
//! and parses its JSON report (vegeta's `report -type=json` format).

use crate::error::LoadDriverError;
use crate::models::LoadResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

const STDERR_LIMIT: usize = 2048;

/// Something that can drive a load burst
#[async_trait]
pub trait LoadDriver: Send + Sync {
    /// Drive `target_qps` for `duration`, returning once the burst completes
    async fn drive(&self, target_qps: u64, duration: Duration) -> Result<LoadResult, LoadDriverError>;
}

/// Configuration for [`CommandLoadDriver`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Shell used to run `command`
    pub shell: String,
    /// Command template; `{qps}`, `{duration}`, `{target}` and `{body}` are
    /// substituted before the burst
    pub command: String,
    /// RPC endpoint under load
    pub target_url: String,
    /// Request body file handed to the tool
    pub body_file: String,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            command: "echo 'POST {target}' | vegeta attack -rate={qps} -duration={duration}s \
                      -header 'Content-Type: application/json' -body {body} \
                      | vegeta report -type=json"
                .to_string(),
            target_url: "http://127.0.0.1:8899".to_string(),
            body_file: "get_slot.json".to_string(),
        }
    }
}

impl DriverConfig {
    /// Substitute the placeholders for one burst
    pub fn render(&self, target_qps: u64, duration: Duration) -> String {
        self.command
            .replace("{qps}", &target_qps.to_string())
            .replace("{duration}", &duration.as_secs().to_string())
            .replace("{target}", &self.target_url)
            .replace("{body}", &self.body_file)
    }
}

/// Latency block of a vegeta report, nanoseconds
#[derive(Debug, Clone, Default, Deserialize)]
struct ReportLatencies {
    #[serde(rename = "50th", default)]
    p50: f64,
    #[serde(rename = "99th", default)]
    p99: f64,
}

/// The parts of a vegeta JSON report the ramp uses
#[derive(Debug, Clone, Deserialize)]
struct VegetaReport {
    latencies: ReportLatencies,
    /// Attack duration, nanoseconds
    #[serde(default)]
    duration: f64,
    requests: u64,
    /// Requests issued per second
    rate: f64,
    /// Success ratio in [0, 1]
    success: f64,
    #[serde(default)]
    status_codes: HashMap<String, u64>,
}

/// Parse a vegeta JSON report into a [`LoadResult`]
///
/// Status code `0` means no response arrived and counts as a timeout;
/// any other non-2xx code is an error.
pub fn parse_vegeta_report(target_qps: u64, output: &str) -> Result<LoadResult, LoadDriverError> {
    let report: VegetaReport = serde_json::from_str(output.trim())
        .or_else(|first| {
            output
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .ok_or(first)
                .and_then(|l| serde_json::from_str(l.trim()))
        })
        .map_err(|e| LoadDriverError::MissingResult(e.to_string()))?;

    let (mut timeouts, mut errors) = (0u64, 0u64);
    for (code, count) in &report.status_codes {
        match code.parse::<u16>() {
            Ok(0) => timeouts += count,
            Ok(c) if (200..300).contains(&c) => {}
            _ => errors += count,
        }
    }

    let share = |n: u64| {
        if report.requests == 0 {
            0.0
        } else {
            n as f64 / report.requests as f64 * 100.0
        }
    };

    Ok(LoadResult::new(
        target_qps,
        report.rate,
        report.success * 100.0,
        share(errors),
        report.latencies.p50 / 1_000_000.0,
        report.latencies.p99 / 1_000_000.0,
        report.duration / 1_000_000_000.0,
    )
    .with_timeout_rate(share(timeouts)))
}

/// Kills the burst's process group if dropped before the shell is reaped
struct ProcessGroupGuard(Option<u32>);

impl ProcessGroupGuard {
    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if let Some(pgid) = self.0 {
            kill_process_group(pgid);
        }
    }
}

#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    let status = std::process::Command::new("kill")
        .arg("-KILL")
        .arg("--")
        .arg(format!("-{}", pgid))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match status {
        // Non-zero just means the group already exited
        Ok(_) => debug!(pgid, "Load tool process group stopped"),
        Err(e) => warn!(pgid, error = %e, "Failed to signal load tool process group"),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: u32) {}

/// Load driver that runs an external tool per burst
pub struct CommandLoadDriver {
    config: DriverConfig,
}

impl CommandLoadDriver {
    pub fn new(config: DriverConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }
}

#[async_trait]
impl LoadDriver for CommandLoadDriver {
    async fn drive(&self, target_qps: u64, duration: Duration) -> Result<LoadResult, LoadDriverError> {
        let command = self.config.render(target_qps, duration);
        info!(qps = target_qps, duration_secs = duration.as_secs(), "Starting load burst");
        debug!(command = %command, "Load tool command");

        let mut cmd = Command::new(&self.config.shell);
        cmd.arg("-c")
            .arg(&command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn().map_err(|source| LoadDriverError::Launch {
            command: self.config.shell.clone(),
            source,
        })?;
        // Dropping the burst (hard timeout) must also stop the pipeline the
        // shell started, not just the shell.
        let mut group = ProcessGroupGuard(child.id());

        let output = child
            .wait_with_output()
            .await
            .map_err(|source| LoadDriverError::Launch {
                command: self.config.shell.clone(),
                source,
            })?;
        group.disarm();

        if !output.status.success() {
            let mut stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            if stderr.len() > STDERR_LIMIT {
                let mut cut = STDERR_LIMIT;
                while !stderr.is_char_boundary(cut) {
                    cut -= 1;
                }
                stderr.truncate(cut);
            }
            return Err(LoadDriverError::Crashed {
                status: output.status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }

        let result = parse_vegeta_report(target_qps, &String::from_utf8_lossy(&output.stdout))?;
        debug!(
            qps = target_qps,
            achieved = result.achieved_qps,
            success = result.success_rate_percent,
            p99_ms = result.latency_p99_ms,
            "Load burst complete"
        );
        Ok(result)
    }
}
