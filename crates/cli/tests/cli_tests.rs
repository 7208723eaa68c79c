//! CLI integration tests

use chrono::Utc;
use ramp_lib::recorder::{FileRecorder, RunRecorder};
use ramp_lib::{
    BottleneckVerdict, CycleAnomaly, CycleRecord, LoadResult, MaxQps, Phase, RunState, RunSummary,
    Scenario, TerminationReason,
};
use std::collections::BTreeSet;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

fn rampctl(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_rampctl"))
        .args(args)
        .env("NO_COLOR", "1")
        .env_remove("RAMP_API_URL")
        .output()
        .expect("Failed to execute command")
}

fn cycle(index: u64, qps: u64, scenario: Scenario, anomalies: Vec<CycleAnomaly>) -> CycleRecord {
    CycleRecord {
        cycle_index: index,
        timestamp: Utc::now(),
        load: LoadResult::new(qps, qps as f64 * 0.99, 99.2, 0.8, 15.0, 310.0, 60.0),
        resource: None,
        health: None,
        verdict: BottleneckVerdict {
            cycle_index: index,
            is_bottleneck: scenario == Scenario::RpcViolation,
            scenario,
            contributing_dimensions: BTreeSet::new(),
            consecutive_count: u32::from(scenario == Scenario::RpcViolation),
            unhealthy_streak: 0,
        },
        anomalies,
    }
}

/// Write a finished three-level run into `dir`
fn write_run(dir: &Path) {
    let recorder = FileRecorder::create(dir).unwrap();
    recorder
        .record_cycle(&cycle(1, 1000, Scenario::Normal, vec![]))
        .unwrap();
    recorder
        .record_cycle(&cycle(
            2,
            1500,
            Scenario::Normal,
            vec![CycleAnomaly::SampleRetried],
        ))
        .unwrap();
    recorder
        .record_cycle(&cycle(3, 2000, Scenario::RpcViolation, vec![]))
        .unwrap();

    let mut state = RunState::new(1000, 500, MaxQps::Bounded(2000));
    state.current_qps = 2000;
    state.phase = Phase::Terminated;
    state.termination_reason = Some(TerminationReason::MaxQpsReached);
    state.max_successful_qps = Some(2000);
    state.cycles_evaluated = 3;
    recorder.record_state(&state).unwrap();

    let now = Utc::now();
    recorder
        .finish(&RunSummary {
            state: state.clone(),
            termination_reason: state.termination_reason,
            max_successful_qps: state.max_successful_qps,
            fatal_error: None,
            started_at: now - chrono::Duration::seconds(200),
            finished_at: now,
            cycles: 3,
        })
        .unwrap();
}

/// Test that the CLI shows help
#[test]
fn test_cli_help() {
    let output = rampctl(&["--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI help should succeed");
    assert!(stdout.contains("ramp runner"), "Should show app description");
    assert!(stdout.contains("status"), "Should show status command");
    assert!(stdout.contains("abort"), "Should show abort command");
    assert!(stdout.contains("report"), "Should show report command");
}

/// Test that the CLI shows version
#[test]
fn test_cli_version() {
    let output = rampctl(&["--version"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI version should succeed");
    assert!(stdout.contains("rampctl"), "Should show binary name");
}

/// Test format and api-url options
#[test]
fn test_global_options() {
    let output = rampctl(&["--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(stdout.contains("--format"), "Should show format option");
    assert!(stdout.contains("table"), "Should show table format");
    assert!(stdout.contains("json"), "Should show json format");
    assert!(stdout.contains("--api-url"), "Should show api-url option");
    assert!(stdout.contains("RAMP_API_URL"), "Should show env var");
}

/// Test report subcommand help
#[test]
fn test_report_help() {
    let output = rampctl(&["report", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "Report help should succeed");
    assert!(stdout.contains("RUN_DIR"), "Should show run dir argument");
    assert!(
        stdout.contains("--flagged-only"),
        "Should show flagged-only option"
    );
}

/// Test report on a finished run
#[test]
fn test_report_table() {
    let dir = TempDir::new().unwrap();
    write_run(dir.path());

    let output = rampctl(&["report", dir.path().to_str().unwrap()]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "Report should succeed");
    assert!(stdout.contains("max_qps_reached"));
    assert!(stdout.contains("rpc_violation"));
    assert!(stdout.contains("sample_retried"));
    assert!(stdout.contains("Total: 3 cycles"));
}

/// Test report filtering and JSON output
#[test]
fn test_report_json_flagged_only() {
    let dir = TempDir::new().unwrap();
    write_run(dir.path());

    let output = rampctl(&[
        "--format",
        "json",
        "report",
        dir.path().to_str().unwrap(),
        "--flagged-only",
    ]);
    assert!(output.status.success(), "Report should succeed");

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let cycles = report["cycles"].as_array().unwrap();
    assert_eq!(cycles.len(), 2);
    assert_eq!(cycles[0]["cycle_index"], 2);
    assert_eq!(cycles[1]["cycle_index"], 3);
    assert_eq!(report["summary"]["max_successful_qps"], 2000);
}

/// Test report on a missing run directory
#[test]
fn test_report_missing_dir() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("nope");

    let output = rampctl(&["report", missing.to_str().unwrap()]);
    assert!(!output.status.success(), "Missing run dir should fail");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("does not exist"));
}

/// Test status against an unreachable runner
#[test]
fn test_status_unreachable() {
    let output = rampctl(&["--api-url", "http://127.0.0.1:1", "status"]);
    assert!(!output.status.success(), "Unreachable runner should fail");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Failed to reach ramp-runner"));
}

/// Test invalid command error handling
#[test]
fn test_invalid_command() {
    let output = rampctl(&["invalid-command"]);
    assert!(!output.status.success(), "Invalid command should fail");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("error") || stderr.contains("invalid"),
        "Should show error message"
    );
}

/// Test missing required argument error handling
#[test]
fn test_missing_argument() {
    let output = rampctl(&["report"]);
    assert!(!output.status.success(), "Missing argument should fail");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("required") || stderr.contains("error"),
        "Should show error about missing argument"
    );
}
